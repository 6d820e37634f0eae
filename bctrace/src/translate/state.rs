//! Per-frame translation state.
//!
//! [BcState] is the bytecode cursor of one (possibly inlined) frame. [FrameTracker] follows the
//! main trace as it is emitted and records what is statically known about the current frame: the
//! SSA values of the frame and stack pointers, the stack pointer's offset from the frame pointer,
//! for each local its type and (if available) the SSA value it currently holds, and the types of
//! those stack cells in memory whose types are known.

use crate::{
    bytecode::Offset,
    hir::{Extra, InstIdx, Module, Opcode, Ty, ACT_REC_CELLS},
    unit::FuncId,
};
use std::collections::HashMap;

#[derive(Clone, Copy, Debug)]
pub(crate) struct BcState {
    pub(crate) bc_off: Offset,
    pub(crate) func: FuncId,
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct LocalState {
    /// The SSA value the local is known to hold, if any.
    pub(crate) value: Option<InstIdx>,
    pub(crate) ty: Ty,
}

impl LocalState {
    fn unknown() -> Self {
        Self {
            value: None,
            ty: Ty::GEN,
        }
    }
}

/// What [FrameTracker] knows about a caller while one of its callees is inlined.
#[derive(Clone, Debug)]
struct SavedFrame {
    fp: InstIdx,
    sp: InstIdx,
    sp_offset: i32,
    locals: Vec<LocalState>,
    stack_tys: HashMap<i32, Ty>,
    this_available: bool,
}

#[derive(Clone, Debug)]
pub(crate) struct FrameTracker {
    fp: InstIdx,
    sp: InstIdx,
    /// How many cells the stack pointer is above the frame pointer.
    sp_offset: i32,
    locals: Vec<LocalState>,
    /// The known types of in-memory stack cells, keyed by their distance in cells above the frame
    /// pointer.
    stack_tys: HashMap<i32, Ty>,
    /// Is `$this` known to be non-null in the current frame?
    this_available: bool,
    callers: Vec<SavedFrame>,
}

impl FrameTracker {
    pub(crate) fn new(fp: InstIdx, sp: InstIdx, sp_offset: i32, num_locals: u32) -> Self {
        Self {
            fp,
            sp,
            sp_offset,
            locals: vec![LocalState::unknown(); to_usize(num_locals)],
            stack_tys: HashMap::new(),
            this_available: false,
            callers: Vec::new(),
        }
    }

    pub(crate) fn fp(&self) -> InstIdx {
        self.fp
    }

    pub(crate) fn sp(&self) -> InstIdx {
        self.sp
    }

    pub(crate) fn sp_offset(&self) -> i32 {
        self.sp_offset
    }

    pub(crate) fn this_available(&self) -> bool {
        self.this_available
    }

    pub(crate) fn set_this_available(&mut self) {
        self.this_available = true;
    }

    pub(crate) fn local(&self, id: u32) -> LocalState {
        self.locals
            .get(to_usize(id))
            .copied()
            .unwrap_or_else(LocalState::unknown)
    }

    pub(crate) fn local_ty(&self, id: u32) -> Ty {
        self.local(id).ty
    }

    /// Record that local `id` holds `value` whose type is `ty`.
    pub(crate) fn set_local_value(&mut self, id: u32, value: InstIdx, ty: Ty) {
        let l = self.local_mut(id);
        l.value = Some(value);
        l.ty = ty;
    }

    fn local_mut(&mut self, id: u32) -> &mut LocalState {
        let i = to_usize(id);
        if i >= self.locals.len() {
            self.locals.resize(i + 1, LocalState::unknown());
        }
        &mut self.locals[i]
    }

    /// The known type of the in-memory stack cell `off` cells below the stack pointer, if any.
    pub(crate) fn stack_ty(&self, off: i32) -> Option<Ty> {
        self.stack_tys.get(&self.slot(off)).copied()
    }

    fn slot(&self, off: i32) -> i32 {
        self.sp_offset - 1 - off
    }

    /// Forget the types of every stack cell at or above `slot`.
    fn kill_stack_above(&mut self, slot: i32) {
        self.stack_tys.retain(|k, _| *k < slot);
    }

    /// Forget the SSA values of all locals and the inner types of boxed locals: something we
    /// can't see may have written to them.
    fn kill_locals(&mut self) {
        for l in self.locals.iter_mut() {
            l.value = None;
            if l.ty.maybe_boxed() {
                l.ty = (l.ty - Ty::BOXED_CELL) | Ty::BOXED_CELL;
            }
        }
    }

    /// Update the tracked state to reflect the main trace instruction `iidx`, which has just
    /// been emitted.
    pub(crate) fn update(&mut self, m: &Module, iidx: InstIdx) {
        let inst = m.inst(iidx);
        match inst.opcode() {
            Opcode::DefFP | Opcode::FreeActRec => self.fp = iidx,
            Opcode::DefSP | Opcode::ReDefSP | Opcode::ReDefGeneratorSP => {
                let Extra::StackOffset(off) = inst.extra_data() else {
                    panic!("{} without a stack offset", inst.opcode());
                };
                self.sp = iidx;
                self.sp_offset = *off;
            }
            Opcode::SpillStack => {
                let Some(deficit) = m.const_int(inst.src(1)) else {
                    panic!("SpillStack with a non-constant deficit");
                };
                let vals = &inst.src_vals()[2..];
                self.kill_stack_above(self.sp_offset - i32::try_from(deficit).unwrap());
                self.sp = iidx;
                self.sp_offset += to_i32(vals.len()) - i32::try_from(deficit).unwrap();
                for (i, v) in vals.iter().enumerate() {
                    let slot = self.slot(to_i32(i));
                    self.stack_tys.insert(slot, m.ty(*v));
                }
            }
            Opcode::SpillFrame | Opcode::CufIterSpillFrame => {
                self.kill_stack_above(self.sp_offset);
                self.sp = iidx;
                self.sp_offset += ACT_REC_CELLS;
            }
            Opcode::Call => {
                // The arguments are passed as sources, so only the activation record is on the
                // stack. It is replaced by the return value.
                self.sp = iidx;
                self.sp_offset -= ACT_REC_CELLS - 1;
                self.kill_locals();
                self.kill_stack_above(self.sp_offset - 1);
            }
            Opcode::CallArray => {
                // The activation record and the argument array are replaced by the return value.
                self.sp = iidx;
                self.sp_offset -= ACT_REC_CELLS;
                self.kill_locals();
                self.kill_stack_above(self.sp_offset - 1);
            }
            Opcode::CallBuiltin => self.kill_locals(),
            Opcode::InterpOneCF => {
                self.kill_locals();
                self.stack_tys.clear();
            }
            Opcode::InterpOne => {
                let Some(adjust) = m.const_int(inst.src(3)) else {
                    panic!("InterpOne with a non-constant stack adjustment");
                };
                self.sp = iidx;
                self.sp_offset -= i32::try_from(adjust).unwrap();
                self.kill_locals();
                self.stack_tys.clear();
            }
            Opcode::CastStk => {
                if let (Extra::StackOffset(off), Some(tp)) = (inst.extra_data(), inst.type_param())
                {
                    let slot = self.slot(*off);
                    self.stack_tys.insert(slot, tp);
                }
            }
            Opcode::GuardStk | Opcode::CheckStk | Opcode::AssertStk => {
                let (Extra::StackOffset(off), Some(tp)) = (inst.extra_data(), inst.type_param())
                else {
                    panic!("{} without a stack offset and type", inst.opcode());
                };
                let slot = self.slot(*off);
                let t = match self.stack_tys.get(&slot) {
                    Some(cur) if inst.opcode() == Opcode::AssertStk && !(*cur & tp).is_empty() => {
                        *cur & tp
                    }
                    _ => tp,
                };
                self.stack_tys.insert(slot, t);
            }
            Opcode::ExceptionBarrier | Opcode::RetAdjustStack | Opcode::GenericRetDecRefs => {
                self.sp = iidx;
            }
            Opcode::DefInlineFP => {
                let Extra::InlineFrame(data) = inst.extra_data() else {
                    panic!("DefInlineFP without frame data");
                };
                self.callers.push(SavedFrame {
                    fp: self.fp,
                    sp: inst.src(1),
                    sp_offset: data.ret_sp_off,
                    locals: std::mem::take(&mut self.locals),
                    stack_tys: std::mem::take(&mut self.stack_tys),
                    this_available: self.this_available,
                });
                self.fp = iidx;
                self.sp = inst.src(0);
                self.locals = vec![LocalState::unknown(); to_usize(data.num_locals)];
                self.this_available = false;
            }
            Opcode::InlineReturn => {
                let Some(caller) = self.callers.pop() else {
                    panic!("InlineReturn outside of an inlined frame");
                };
                self.fp = caller.fp;
                self.sp = caller.sp;
                self.sp_offset = caller.sp_offset;
                self.locals = caller.locals;
                self.stack_tys = caller.stack_tys;
                self.this_available = caller.this_available;
            }
            Opcode::LdLoc => {
                if let Some(id) = inst.local_id() {
                    self.set_local_value(id, iidx, m.ty(iidx));
                }
            }
            Opcode::StLoc => {
                if let Some(id) = inst.local_id() {
                    let v = inst.src(1);
                    self.set_local_value(id, v, m.ty(v));
                }
            }
            Opcode::GuardLoc | Opcode::CheckLoc | Opcode::OverrideLoc => {
                if let (Some(id), Some(tp)) = (inst.local_id(), inst.type_param()) {
                    let l = self.local_mut(id);
                    l.value = None;
                    l.ty = tp;
                }
            }
            Opcode::AssertLoc => {
                if let (Some(id), Some(tp)) = (inst.local_id(), inst.type_param()) {
                    let l = self.local_mut(id);
                    let t = l.ty & tp;
                    l.ty = if t.is_none() { tp } else { t };
                    if l.value.map(|v| !m.ty(v).subtype_of(l.ty)).unwrap_or(false) {
                        l.value = None;
                    }
                }
            }
            Opcode::StRef => {
                // The box stays where it is but now holds a value of a different type.
                let (bx, v) = (inst.src(0), inst.src(1));
                let boxed = m.ty(v).box_();
                for l in self.locals.iter_mut() {
                    if l.value == Some(bx) {
                        l.value = None;
                        l.ty = boxed;
                    }
                }
            }
            Opcode::LdThis => self.this_available = true,
            _ => (),
        }
    }
}

fn to_usize(n: u32) -> usize {
    usize::try_from(n).unwrap()
}

fn to_i32(n: usize) -> i32 {
    i32::try_from(n).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hir::{Const, Inst, TraceIdx};

    #[test]
    fn spill_and_interp_offsets() {
        let mut m = Module::new(0);
        let bb = m.entry(TraceIdx::MAIN);
        let fp = m.push_inst(bb, Inst::new(Opcode::DefFP)).unwrap();
        let sp = m
            .push_inst(
                bb,
                Inst::new(Opcode::DefSP)
                    .extra(Extra::StackOffset(4))
                    .srcs(&[fp]),
            )
            .unwrap();
        let mut t = FrameTracker::new(fp, sp, 4, 2);
        let one = m.insert_const(Const::Int(1)).unwrap();
        let spill = m
            .push_inst(bb, Inst::new(Opcode::SpillStack).srcs(&[sp, one, one, one]))
            .unwrap();
        t.update(&m, spill);
        assert_eq!(t.sp(), spill);
        assert_eq!(t.sp_offset(), 5);
        let bc = m.insert_const(Const::Int(12)).unwrap();
        let adj = m.insert_const(Const::Int(2)).unwrap();
        let interp = m
            .push_inst(
                bb,
                Inst::new(Opcode::InterpOne)
                    .tp(Ty::INT)
                    .srcs(&[fp, spill, bc, adj]),
            )
            .unwrap();
        t.update(&m, interp);
        assert_eq!(t.sp_offset(), 3);
    }

    #[test]
    fn local_tracking() {
        let mut m = Module::new(0);
        let bb = m.entry(TraceIdx::MAIN);
        let fp = m.push_inst(bb, Inst::new(Opcode::DefFP)).unwrap();
        let sp = m
            .push_inst(
                bb,
                Inst::new(Opcode::DefSP)
                    .extra(Extra::StackOffset(1))
                    .srcs(&[fp]),
            )
            .unwrap();
        let mut t = FrameTracker::new(fp, sp, 1, 1);
        assert_eq!(t.local_ty(0), Ty::GEN);
        let g = m
            .push_inst(
                bb,
                Inst::new(Opcode::GuardLoc)
                    .tp(Ty::INT | Ty::DBL)
                    .extra(Extra::LocalId(0))
                    .srcs(&[fp]),
            )
            .unwrap();
        t.update(&m, g);
        assert_eq!(t.local_ty(0), Ty::INT | Ty::DBL);
        let a = m
            .push_inst(
                bb,
                Inst::new(Opcode::AssertLoc)
                    .tp(Ty::INT)
                    .extra(Extra::LocalId(0))
                    .srcs(&[fp]),
            )
            .unwrap();
        t.update(&m, a);
        assert_eq!(t.local_ty(0), Ty::INT);
        let three = m.insert_const(Const::Int(3)).unwrap();
        let st = m
            .push_inst(
                bb,
                Inst::new(Opcode::StLoc)
                    .extra(Extra::LocalId(0))
                    .srcs(&[fp, three]),
            )
            .unwrap();
        t.update(&m, st);
        assert_eq!(t.local(0).value, Some(three));
    }
}
