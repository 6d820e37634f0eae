//! Translate bytecode into HIR.
//!
//! A [Translator] is one translation session. The caller moves the bytecode cursor with
//! [Translator::set_bc_off], feeds each instruction to [Translator::translate], and, when done,
//! calls [Translator::end] followed by [Translator::finish] to obtain the [Module].
//!
//! The session owns:
//!
//!   * the *virtual evaluation stack*: the values on top of the bytecode operand stack that have
//!     not yet been written to memory, together with the *stack deficit*, the number of cells
//!     below the virtual stack that have been popped but whose popping has not yet been reflected
//!     in the stack pointer;
//!   * one [BcState] per (possibly inlined) frame being translated;
//!   * the FPI stack, one entry per call whose activation record has been pushed but whose
//!     `FCall` has not yet been seen;
//!   * a [FrameTracker] following the main trace.
//!
//! Lowerings that can't handle the shape of their inputs detect this *before* emitting anything
//! and fall back to `InterpOne` / `InterpOneCF`.

use crate::{
    bytecode::Offset,
    config::TranslatorConfig,
    hir::{BlockIdx, Const, Extra, Field, Inst, InstIdx, MarkerData, Module, Opcode, TraceIdx, Ty},
    log::{log_ir, should_log_ir, IRPhase, Log, Verbosity},
    unit::{Class, ClassId, Func, FuncId, LitstrId, NamedEntity, NamedEntityId, Unit},
    TranslationError,
};
use std::fmt::Write;

mod arith;
mod call;
mod cont;
mod control;
mod dispatch;
mod emit;
mod exit;
mod globals;
mod locals;
mod misc;
mod refine;
mod stack;
mod state;
mod types;

use state::{BcState, FrameTracker};

/// A translation session.
pub struct Translator<'u> {
    unit: &'u dyn Unit,
    cfg: TranslatorConfig,
    log: Log,
    m: Module,
    /// The main trace block instructions are currently appended to.
    cur_block: BlockIdx,
    /// The virtual evaluation stack. The top of the stack is the *last* element.
    eval_stack: Vec<InstIdx>,
    stack_deficit: u32,
    /// The frame currently being translated.
    bc: BcState,
    /// The frames of the callers of inlined frames, innermost last.
    callers: Vec<BcState>,
    /// `(stack pointer, stack offset)` captured at each pending call's `FPush*`.
    fpi: Vec<(InstIdx, i32)>,
    start_bc_off: Offset,
    /// Is the current bytecode the last in the region being translated?
    last_bc_off: bool,
    /// Has the main trace been terminated?
    has_exit: bool,
    tracker: FrameTracker,
    /// The marker for the current position, if it has not yet been emitted.
    pending_marker: Option<MarkerData>,
    next_cache_handle: u32,
}

impl<'u> Translator<'u> {
    /// Start translating `func` at bytecode offset `start`. `sp_offset` is the number of stack
    /// cells between the frame pointer and the stack pointer on entry.
    pub fn new(
        unit: &'u dyn Unit,
        cfg: TranslatorConfig,
        func: FuncId,
        start: Offset,
        sp_offset: i32,
    ) -> Result<Self, TranslationError> {
        let log = Log::new().map_err(|e| TranslationError::General(e.to_string()))?;
        let num_locals = unit
            .func(func)
            .ok_or_else(|| TranslationError::General(format!("unknown function {}", func.0)))?
            .num_locals;
        let mut m = Module::new(start);
        let bb = m.entry(TraceIdx::MAIN);
        m.push_inst(
            bb,
            Inst::new(Opcode::Marker).extra(Extra::Marker(MarkerData {
                bc_off: start,
                func,
                stack_off: sp_offset,
            })),
        )?;
        let fp = m.push_inst(bb, Inst::new(Opcode::DefFP))?;
        let sp = m.push_inst(
            bb,
            Inst::new(Opcode::DefSP)
                .extra(Extra::StackOffset(sp_offset))
                .srcs(&[fp]),
        )?;
        Ok(Self {
            unit,
            cfg,
            log,
            m,
            cur_block: bb,
            eval_stack: Vec::new(),
            stack_deficit: 0,
            bc: BcState {
                bc_off: start,
                func,
            },
            callers: Vec::new(),
            fpi: Vec::new(),
            start_bc_off: start,
            last_bc_off: false,
            has_exit: false,
            tracker: FrameTracker::new(fp, sp, sp_offset, num_locals),
            pending_marker: None,
            next_cache_handle: 0,
        })
    }

    /// The module built so far.
    pub fn module(&self) -> &Module {
        &self.m
    }

    pub fn bc_off(&self) -> Offset {
        self.bc.bc_off
    }

    pub fn is_inlining(&self) -> bool {
        !self.callers.is_empty()
    }

    /// Has the main trace been terminated?
    pub fn has_exit(&self) -> bool {
        self.has_exit
    }

    /// How many values are on the virtual evaluation stack?
    pub fn eval_stack_len(&self) -> usize {
        self.eval_stack.len()
    }

    pub fn stack_deficit(&self) -> u32 {
        self.stack_deficit
    }

    /// How many call-preparation regions are open?
    pub fn fpi_depth(&self) -> usize {
        self.fpi.len()
    }

    /// How many frames deep is the frame being translated (0 if not inlining)?
    pub fn inline_depth(&self) -> usize {
        self.callers.len()
    }

    /// Move the bytecode cursor to `off`. `last` is true if `off` is the last bytecode of the
    /// region being translated.
    ///
    /// # Panics
    ///
    /// If `last` is set while inlining.
    pub fn set_bc_off(&mut self, off: Offset, last: bool) {
        assert!(
            !(self.is_inlining() && last),
            "the last bytecode of a region can't be inside an inlined frame"
        );
        if off != self.bc.bc_off {
            self.bc.bc_off = off;
            self.emit_marker();
        }
        self.last_bc_off = last;
    }

    /// Called when the tracelet ends: if the main trace hasn't otherwise been terminated, bind a
    /// jump to the next bytecode.
    pub fn end(&mut self) -> Result<(), TranslationError> {
        if self.has_exit {
            return Ok(());
        }
        let next = self.next_bc_off();
        if next >= self.cur_func()?.past {
            // The region ends with a backward jump at the very end of the function.
            return Ok(());
        }
        self.set_bc_off(next, true);
        let sp = self.spill_stack()?;
        let fp = self.fp();
        self.gen_op(Opcode::SyncABIRegs, &[fp, sp])?;
        self.gen(Inst::new(Opcode::ReqBindJmp).extra(Extra::BcOffset(next)))?;
        self.has_exit = true;
        Ok(())
    }

    /// Finish the session and return the translated [Module].
    pub fn finish(self) -> Result<Module, TranslationError> {
        if should_log_ir(IRPhase::HIR) {
            log_ir(&format!(
                "--- Begin hir ---\n{}--- End hir ---\n",
                self.m
            ));
        }
        #[cfg(any(test, debug_assertions))]
        self.m.assert_well_formed();
        Ok(self.m)
    }

    /// Return a human-readable rendition of the virtual stack and FPI stack.
    pub fn show_stack(&self) -> String {
        let mut out = String::new();
        let depth = self.tracker.sp_offset() + self.num_cells() - self.stack_deficit_i32();
        writeln!(
            out,
            "+-- {depth} stack element(s), deficit {}, {} pending call(s) --+",
            self.stack_deficit,
            self.fpi.len()
        )
        .ok();
        for (i, v) in self.eval_stack.iter().rev().enumerate() {
            writeln!(out, "| {i:>2}: {}", self.m.display_inst(*v)).ok();
        }
        for (sp, off) in self.fpi.iter().rev() {
            writeln!(out, "| ActRec at sp offset {off} (%{sp})").ok();
        }
        writeln!(out, "+--").ok();
        out
    }

    // Type guards, checks, and assertions. These are issued by the caller, which knows the types
    // that the region being translated was specialised for.

    /// Guard that local `id` has type `ty`. Only valid at the start of a trace.
    pub fn guard_type_local(&mut self, id: u32, ty: Ty) -> Result<(), TranslationError> {
        let fp = self.fp();
        self.gen(
            Inst::new(Opcode::GuardLoc)
                .tp(ty)
                .extra(Extra::LocalId(id))
                .srcs(&[fp]),
        )?;
        Ok(())
    }

    /// Check that local `id` has type `ty`, exiting to `dest` (or the current bytecode) if not.
    pub fn check_type_local(
        &mut self,
        id: u32,
        ty: Ty,
        dest: Option<Offset>,
    ) -> Result<(), TranslationError> {
        let exit = self.exit_trace(dest)?;
        let fp = self.fp();
        self.gen(
            Inst::new(Opcode::CheckLoc)
                .tp(ty)
                .extra(Extra::LocalId(id))
                .srcs(&[fp])
                .taken(exit),
        )?;
        Ok(())
    }

    pub fn assert_type_local(&mut self, id: u32, ty: Ty) -> Result<(), TranslationError> {
        let fp = self.fp();
        self.gen(
            Inst::new(Opcode::AssertLoc)
                .tp(ty)
                .extra(Extra::LocalId(id))
                .srcs(&[fp]),
        )?;
        Ok(())
    }

    pub fn override_type_local(&mut self, id: u32, ty: Ty) -> Result<(), TranslationError> {
        let fp = self.fp();
        self.gen(
            Inst::new(Opcode::OverrideLoc)
                .tp(ty)
                .extra(Extra::LocalId(id))
                .srcs(&[fp]),
        )?;
        Ok(())
    }

    /// Guard that the stack cell `idx` has type `ty`. Only valid at the start of a trace, while
    /// nothing has been pushed or popped.
    pub fn guard_type_stack(&mut self, idx: u32, ty: Ty) -> Result<(), TranslationError> {
        if ty.subtype_of(Ty::CLS) {
            // Classes are never guarded on.
            return self.assert_type_stack(idx, ty);
        }
        assert!(self.eval_stack.is_empty() && self.stack_deficit == 0);
        let sp = self.sp();
        self.gen(
            Inst::new(Opcode::GuardStk)
                .tp(ty)
                .extra(Extra::StackOffset(stack_index(idx)))
                .srcs(&[sp]),
        )?;
        Ok(())
    }

    /// Check that the stack cell `idx` has type `ty`, exiting to `dest` if not.
    pub fn check_type_stack(
        &mut self,
        idx: u32,
        ty: Ty,
        dest: Offset,
    ) -> Result<(), TranslationError> {
        let exit = self.exit_trace(Some(dest))?;
        let idx = usize::try_from(idx).unwrap();
        if idx < self.eval_stack.len() {
            let v = self.eval_stack_at(idx);
            let checked = self.gen(
                Inst::new(Opcode::CheckType)
                    .tp(ty)
                    .srcs(&[v])
                    .taken(exit),
            )?;
            self.replace(idx, checked);
        } else {
            let off = self.mem_stack_offset(idx);
            let sp = self.sp();
            self.gen(
                Inst::new(Opcode::CheckStk)
                    .tp(ty)
                    .extra(Extra::StackOffset(off))
                    .srcs(&[sp])
                    .taken(exit),
            )?;
        }
        Ok(())
    }

    pub fn assert_type_stack(&mut self, idx: u32, ty: Ty) -> Result<(), TranslationError> {
        let idx = usize::try_from(idx).unwrap();
        if idx < self.eval_stack.len() {
            let v = self.eval_stack_at(idx);
            let asserted = self.gen(Inst::new(Opcode::AssertType).tp(ty).srcs(&[v]))?;
            self.replace(idx, asserted);
        } else {
            let off = self.mem_stack_offset(idx);
            let sp = self.sp();
            self.gen(
                Inst::new(Opcode::AssertStk)
                    .tp(ty)
                    .extra(Extra::StackOffset(off))
                    .srcs(&[sp]),
            )?;
        }
        Ok(())
    }

    /// Record that the stack cell `idx` holds the static string `s`.
    pub fn assert_string_stack(&mut self, idx: u32, s: &str) -> Result<(), TranslationError> {
        let idx = usize::try_from(idx).unwrap();
        let c = self.cns(s)?;
        if idx < self.eval_stack.len() {
            assert!(self.m.ty(self.eval_stack_at(idx)).maybe(Ty::STR));
            self.replace(idx, c);
        } else {
            let off = self.mem_stack_offset(idx);
            let sp = self.sp();
            self.gen(
                Inst::new(Opcode::AssertStkVal)
                    .extra(Extra::StackOffset(off))
                    .srcs(&[sp, c]),
            )?;
        }
        Ok(())
    }

    /// Guard that the by-reference-ness of the parameters of the function whose activation
    /// record is `entry_ar_delta` cells above the stack pointer matches `vals` wherever `mask`
    /// is set.
    pub fn guard_refs(
        &mut self,
        entry_ar_delta: i64,
        mask: &[bool],
        vals: &[bool],
    ) -> Result<(), TranslationError> {
        if mask.len() != vals.len() {
            return Err(TranslationError::General(format!(
                "GuardRefs mask has {} bits but there are {} values",
                mask.len(),
                vals.len()
            )));
        }
        let sp = self.sp();
        let ar_off = self.cns(entry_ar_delta * 16)?;
        let func = self.gen_op(Opcode::LdARFuncPtr, &[sp, ar_off])?;
        let mut num_params = None;
        for (i, (chunk, vals_chunk)) in mask.chunks(64).zip(vals.chunks(64)).enumerate() {
            let mask64 = pack_bits(chunk);
            if mask64 == 0 {
                continue;
            }
            let vals64 = pack_bits(vals_chunk);
            // The first 64 parameters are always checked against a constant; beyond that we
            // need the callee's real parameter count.
            let np = match (i, num_params) {
                (0, _) => self.cns(64)?,
                (1, _) | (_, None) => {
                    let f = self.cns(Const::Field(Field::FuncNumParams))?;
                    self.gen(Inst::new(Opcode::LdRaw).tp(Ty::INT).srcs(&[func, f]))?
                }
                (_, Some(x)) => x,
            };
            num_params = Some(np);
            let first = i64::try_from(i * 64).map_err(|_| {
                TranslationError::LimitExceeded(format!("{} parameters", mask.len()))
            })?;
            let first = self.cns(first)?;
            let mask_c = self.cns(mask64 as i64)?;
            let vals_c = self.cns(vals64 as i64)?;
            self.gen_op(Opcode::GuardRefs, &[func, np, first, mask_c, vals_c])?;
        }
        Ok(())
    }

    /// Record that `$this` is known to be non-null in the current frame.
    pub fn set_this_available(&mut self) {
        self.tracker.set_this_available();
    }

    /// Emit a statistics counter bump if statistics are enabled (or `force` is set).
    pub fn emit_inc_stat(
        &mut self,
        counter: i64,
        value: i64,
        force: bool,
    ) -> Result<(), TranslationError> {
        if self.cfg.stats || force {
            let c = self.cns(counter)?;
            let v = self.cns(value)?;
            let f = self.cns(force)?;
            self.gen_op(Opcode::IncStat, &[c, v, f])?;
        }
        Ok(())
    }

    /// Count executions of this translation.
    pub fn emit_inc_trans_counter(&mut self) -> Result<(), TranslationError> {
        self.gen(Inst::new(Opcode::IncTransCounter))?;
        Ok(())
    }

    // Metadata lookups.

    fn cur_func(&self) -> Result<&'u Func, TranslationError> {
        self.func(self.bc.func)
    }

    fn func(&self, id: FuncId) -> Result<&'u Func, TranslationError> {
        self.unit
            .func(id)
            .ok_or_else(|| TranslationError::General(format!("unknown function {}", id.0)))
    }

    fn class(&self, id: ClassId) -> Result<&'u Class, TranslationError> {
        self.unit
            .class(id)
            .ok_or_else(|| TranslationError::General(format!("unknown class {}", id.0)))
    }

    /// The class of the current function, if it is a method.
    fn cur_class(&self) -> Result<Option<&'u Class>, TranslationError> {
        self.cur_func()?.cls.map(|c| self.class(c)).transpose()
    }

    fn litstr(&self, id: LitstrId) -> Result<&'u str, TranslationError> {
        self.unit
            .litstr(id)
            .ok_or_else(|| TranslationError::General(format!("unknown string literal {}", id.0)))
    }

    fn named_entity(&self, id: NamedEntityId) -> Result<&'u NamedEntity, TranslationError> {
        self.unit
            .named_entity(id)
            .ok_or_else(|| TranslationError::General(format!("unknown named entity {}", id.0)))
    }

    /// The offset of the bytecode after the current one.
    fn next_bc_off(&self) -> Offset {
        self.unit.advance(self.bc.func, self.bc.bc_off)
    }

    /// A fresh handle for a runtime cache slot.
    fn new_cache_handle(&mut self) -> u32 {
        let ch = self.next_cache_handle;
        self.next_cache_handle += 1;
        ch
    }

    fn fp(&self) -> InstIdx {
        self.tracker.fp()
    }

    fn sp(&self) -> InstIdx {
        self.tracker.sp()
    }

    fn log(&self, level: Verbosity, msg: &str) {
        self.log.log(level, msg);
    }
}

fn stack_index(idx: u32) -> i32 {
    i32::try_from(idx).unwrap()
}

/// Pack up to 64 bools into a little-endian bit vector.
fn pack_bits(bits: &[bool]) -> u64 {
    bits.iter()
        .enumerate()
        .fold(0, |acc, (i, b)| acc | (u64::from(*b) << i))
}

#[cfg(test)]
mod tests {
    use crate::{
        testing::{assert_hir_matches, TestUnit},
        TranslationError,
    };

    #[test]
    fn guard_refs_beyond_64_params() {
        let u = TestUnit::new();
        let mut t = u.translator();
        let mut vals = [false; 70];
        vals[65] = true;
        t.guard_refs(0, &[true; 70], &vals).unwrap();
        assert_hir_matches(
            t.module(),
            "
            ...
                %{{f}}: Func = LdARFuncPtr %{{sp}}, 0
                GuardRefs %{{f}}, 64, 0, -1, 0
                %{{n}}: Int = LdRaw<Int> %{{f}}, #FuncNumParams
                GuardRefs %{{f}}, %{{n}}, 64, 63, 2
                ...
            ",
        );
    }

    #[test]
    #[should_panic(expected = "does not end with a terminal")]
    fn finish_checks_well_formedness() {
        let u = TestUnit::new();
        let t = u.translator();
        t.finish().unwrap();
    }

    #[test]
    fn guard_refs_with_mismatched_lengths() {
        let u = TestUnit::new();
        let mut t = u.translator();
        assert!(matches!(
            t.guard_refs(0, &[true; 70], &[false; 10]),
            Err(TranslationError::General(_))
        ));
    }
}
