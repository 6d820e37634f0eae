//! Exit, side-exit, and catch traces.
//!
//! An exit trace is the continuation of a guard or branch: it writes the virtual stack to memory,
//! synchronises the frame and stack pointers, and asks the runtime to bind a jump to a translation
//! of the target bytecode. A catch trace is run by the unwinder when an instruction throws: it
//! only writes the virtual stack to memory.
//!
//! None of these functions alter the main trace or the virtual stack: they work on copies of
//! the values to spill.

use super::Translator;
use crate::{
    bytecode::Offset,
    hir::{BlockIdx, Extra, Inst, InstIdx, MarkerData, Opcode, TraceKind},
    TranslationError,
};

/// A function run by an exit trace after it has spilled the stack. It may emit (with
/// [Translator::gen_for]) into the block it is given and may return one further value to push.
pub(super) type CustomExit<'a, 'u> =
    &'a mut dyn FnMut(&mut Translator<'u>, BlockIdx) -> Result<Option<InstIdx>, TranslationError>;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum ExitFlag {
    None,
    /// Exit without IR being generated for the target: used for the initial miss of cache
    /// lookups, which are better handled by the interpreter.
    NoIR,
    /// The exit is part of lowering the current bytecode: attribute it to the current bytecode
    /// until the exit's own work is done.
    DelayedMarker,
}

impl<'u> Translator<'u> {
    /// Create an exit trace to `target` (or, if `None`, the current bytecode).
    pub(super) fn exit_trace(
        &mut self,
        target: Option<Offset>,
    ) -> Result<BlockIdx, TranslationError> {
        let vals = self.peek_spill_values();
        self.exit_trace_with(target, vals)
    }

    /// As [Self::exit_trace] but spilling `vals` (top first) rather than the virtual stack.
    pub(super) fn exit_trace_with(
        &mut self,
        target: Option<Offset>,
        vals: Vec<InstIdx>,
    ) -> Result<BlockIdx, TranslationError> {
        let target = target.unwrap_or(self.bc.bc_off);
        self.exit_trace_impl(target, ExitFlag::None, vals, None)
    }

    /// An exit to `target` which raises the warning `msg` before leaving.
    pub(super) fn exit_trace_warn(
        &mut self,
        target: Offset,
        vals: Vec<InstIdx>,
        msg: &str,
    ) -> Result<BlockIdx, TranslationError> {
        let msg = self.cns(msg)?;
        let mut warn = |t: &mut Translator<'u>,
                        b: BlockIdx|
         -> Result<Option<InstIdx>, TranslationError> {
            t.gen_for(b, Inst::new(Opcode::RaiseWarning).srcs(&[msg]))?;
            Ok(None)
        };
        self.exit_trace_impl(target, ExitFlag::None, vals, Some(&mut warn))
    }

    /// An exit to `target` taken part way through lowering the current bytecode, running `custom`
    /// before leaving.
    pub(super) fn side_exit(
        &mut self,
        target: Offset,
        custom: CustomExit<'_, 'u>,
    ) -> Result<BlockIdx, TranslationError> {
        let vals = self.peek_spill_values();
        self.exit_trace_impl(target, ExitFlag::DelayedMarker, vals, Some(custom))
    }

    /// An exit to the current bytecode which asks for it to be interpreted.
    pub(super) fn exit_slow_trace(&mut self) -> Result<BlockIdx, TranslationError> {
        let vals = self.peek_spill_values();
        self.exit_trace_impl(self.bc.bc_off, ExitFlag::NoIR, vals, None)
    }

    fn exit_trace_impl(
        &mut self,
        target: Offset,
        flag: ExitFlag,
        vals: Vec<InstIdx>,
        custom: Option<CustomExit<'_, 'u>>,
    ) -> Result<BlockIdx, TranslationError> {
        let kind = match flag {
            ExitFlag::DelayedMarker => TraceKind::SideExit,
            ExitFlag::None | ExitFlag::NoIR => TraceKind::Exit,
        };
        let tidx = self.m.new_trace(kind, target)?;
        let exit = self.m.entry(tidx);

        let mut exit_marker = MarkerData {
            bc_off: target,
            func: self.bc.func,
            stack_off: self.tracker.sp_offset() + i32::try_from(vals.len()).unwrap()
                - self.stack_deficit_i32(),
        };
        let first = if flag == ExitFlag::DelayedMarker {
            self.make_marker(self.bc.bc_off)
        } else {
            exit_marker
        };
        self.gen_for(exit, Inst::new(Opcode::Marker).extra(Extra::Marker(first)))?;

        let mut stack = self.sp();
        if self.stack_deficit != 0 || !vals.is_empty() {
            stack = self.spill_for(exit, stack, &vals)?;
        }

        if let Some(custom) = custom {
            stack = self.gen_for(exit, Inst::new(Opcode::ExceptionBarrier).srcs(&[stack]))?;
            if let Some(v) = custom(self, exit)? {
                let zero = self.cns(0)?;
                stack = self.gen_for(exit, Inst::new(Opcode::SpillStack).srcs(&[stack, zero, v]))?;
                exit_marker.stack_off += 1;
            }
        }

        if flag == ExitFlag::DelayedMarker {
            self.gen_for(
                exit,
                Inst::new(Opcode::Marker).extra(Extra::Marker(exit_marker)),
            )?;
        }

        let fp = self.fp();
        self.gen_for(exit, Inst::new(Opcode::SyncABIRegs).srcs(&[fp, stack]))?;

        let req = if flag == ExitFlag::NoIR {
            let op = if target == self.start_bc_off {
                Opcode::ReqRetranslateNoIR
            } else {
                Opcode::ReqBindJmpNoIR
            };
            Inst::new(op).extra(Extra::BcOffset(target))
        } else if self.bc.bc_off == self.start_bc_off && target == self.start_bc_off {
            Inst::new(Opcode::ReqRetranslate)
        } else {
            Inst::new(Opcode::ReqBindJmp).extra(Extra::BcOffset(target))
        };
        self.gen_for(exit, req)?;
        Ok(exit)
    }

    /// Create a catch trace for the current state of the virtual stack.
    pub(super) fn catch_trace(&mut self) -> Result<BlockIdx, TranslationError> {
        let tidx = self.m.new_trace(TraceKind::Catch, self.bc.bc_off)?;
        let catch = self.m.entry(tidx);
        self.gen_for(catch, Inst::new(Opcode::BeginCatch))?;
        let mk = self.make_marker(self.bc.bc_off);
        self.gen_for(catch, Inst::new(Opcode::Marker).extra(Extra::Marker(mk)))?;
        let vals = self.peek_spill_values();
        let sp = self.sp();
        let sp = self.spill_for(catch, sp, &vals)?;
        self.gen_for(catch, Inst::new(Opcode::EndCatch).srcs(&[sp]))?;
        debug_assert_eq!(self.m.trace(tidx).blocks().len(), 1);
        Ok(catch)
    }

    /// Spill the stack deficit and `vals` (top first) into the auxiliary block `bidx`.
    fn spill_for(
        &mut self,
        bidx: BlockIdx,
        sp: InstIdx,
        vals: &[InstIdx],
    ) -> Result<InstIdx, TranslationError> {
        let deficit = self.cns(self.stack_deficit)?;
        let mut srcs = vec![sp, deficit];
        srcs.extend_from_slice(vals);
        self.gen_for(bidx, Inst::new(Opcode::SpillStack).srcs(&srcs))
    }
}
