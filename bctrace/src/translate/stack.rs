//! The virtual evaluation stack.
//!
//! Index 0 is always the top of the stack. Values are only written to memory when the stack is
//! spilled (by [Translator::spill_stack] in the main trace, or by exit and catch traces, which
//! spill a copy).

use super::Translator;
use crate::{
    hir::{Extra, Inst, InstIdx, Opcode, Ty},
    TranslationError,
};

impl Translator<'_> {
    pub(super) fn push(&mut self, v: InstIdx) -> InstIdx {
        self.eval_stack.push(v);
        v
    }

    /// Push `IncRef v`.
    pub(super) fn push_inc_ref(&mut self, v: InstIdx) -> Result<InstIdx, TranslationError> {
        let r = self.inc_ref(v)?;
        Ok(self.push(r))
    }

    /// Pop the top of the stack, which is expected to have type `ty`. If the virtual stack is
    /// empty, the value is loaded from memory, narrowed by whatever we know about the cell.
    pub(super) fn pop(&mut self, ty: Ty) -> Result<InstIdx, TranslationError> {
        match self.eval_stack.pop() {
            Some(v) => {
                self.refine_type(v, ty);
                Ok(v)
            }
            None => {
                let off = self.stack_deficit_i32();
                let ty = match self.tracker.stack_ty(off) {
                    Some(known) if !(known & ty).is_empty() => known & ty,
                    _ => ty,
                };
                self.stack_deficit = self
                    .stack_deficit
                    .checked_add(1)
                    .unwrap_or_else(|| panic!("stack deficit overflow"));
                let sp = self.sp();
                self.gen(
                    Inst::new(Opcode::LdStack)
                        .tp(ty)
                        .extra(Extra::StackOffset(off))
                        .srcs(&[sp]),
                )
            }
        }
    }

    pub(super) fn pop_c(&mut self) -> Result<InstIdx, TranslationError> {
        self.pop(Ty::CELL)
    }

    pub(super) fn pop_v(&mut self) -> Result<InstIdx, TranslationError> {
        self.pop(Ty::BOXED_CELL)
    }

    pub(super) fn pop_r(&mut self) -> Result<InstIdx, TranslationError> {
        self.pop(Ty::GEN)
    }

    pub(super) fn pop_a(&mut self) -> Result<InstIdx, TranslationError> {
        self.pop(Ty::CLS)
    }

    /// Pop a call argument.
    pub(super) fn pop_f(&mut self) -> Result<InstIdx, TranslationError> {
        self.pop(Ty::GEN)
    }

    /// Pop and throw away `n` values.
    pub(super) fn discard(&mut self, n: u32) -> Result<(), TranslationError> {
        for _ in 0..n {
            self.pop(Ty::GEN | Ty::CLS)?;
        }
        Ok(())
    }

    /// Pop the top of the stack and release it. If the value is only in memory, this is done
    /// without loading it into the virtual stack.
    pub(super) fn pop_dec_ref(&mut self, ty: Ty) -> Result<(), TranslationError> {
        if let Some(v) = self.eval_stack.pop() {
            return self.dec_ref(v);
        }
        let off = self.stack_deficit_i32();
        let sp = self.sp();
        self.gen(
            Inst::new(Opcode::DecRefStack)
                .tp(ty)
                .extra(Extra::StackOffset(off))
                .srcs(&[sp]),
        )?;
        self.stack_deficit += 1;
        Ok(())
    }

    /// Make sure that the virtual stack holds at least `idx + 1` values. Values we don't yet
    /// have a type for are loaded generically: a later `pop` or `top` will narrow them.
    fn extend_stack(&mut self, idx: usize, ty: Ty) -> Result<(), TranslationError> {
        if idx == 0 {
            let v = self.pop(ty)?;
            self.push(v);
            return Ok(());
        }
        let v = self.pop(Ty::GEN | Ty::CLS)?;
        self.extend_stack(idx - 1, ty)?;
        self.push(v);
        Ok(())
    }

    /// Return, without popping it, the value `idx` cells below the top of the stack, which is
    /// expected to have type `ty`.
    pub(super) fn top(&mut self, ty: Ty, idx: usize) -> Result<InstIdx, TranslationError> {
        if idx >= self.eval_stack.len() {
            self.extend_stack(idx, ty)?;
        }
        assert!(idx < self.eval_stack.len(), "stack extension failed");
        let v = self.eval_stack_at(idx);
        self.refine_type(v, ty);
        Ok(v)
    }

    pub(super) fn top_c(&mut self, idx: usize) -> Result<InstIdx, TranslationError> {
        self.top(Ty::CELL, idx)
    }

    /// The type of the value `idx` cells below the top of the stack. Unlike [Self::top], this
    /// never emits anything.
    pub(super) fn top_ty(&self, idx: usize) -> Ty {
        if idx < self.eval_stack.len() {
            self.m.ty(self.eval_stack_at(idx))
        } else {
            self.tracker
                .stack_ty(self.mem_stack_offset(idx))
                .unwrap_or(Ty::GEN)
        }
    }

    /// The value `idx` cells below the top of the virtual stack.
    ///
    /// # Panics
    ///
    /// If the virtual stack has `idx` or fewer values.
    pub(super) fn eval_stack_at(&self, idx: usize) -> InstIdx {
        self.eval_stack[self.eval_stack.len() - 1 - idx]
    }

    pub(super) fn replace(&mut self, idx: usize, v: InstIdx) {
        let len = self.eval_stack.len();
        self.eval_stack[len - 1 - idx] = v;
    }

    /// The values of the virtual stack, top first. The stack itself is unchanged.
    pub(super) fn peek_spill_values(&self) -> Vec<InstIdx> {
        self.eval_stack.iter().rev().copied().collect()
    }

    /// Write the virtual stack to memory, returning the new stack pointer.
    pub(super) fn spill_stack(&mut self) -> Result<InstIdx, TranslationError> {
        let vals = self.peek_spill_values();
        let deficit = self.cns(i64::from(self.stack_deficit))?;
        let mut srcs = vec![self.sp(), deficit];
        srcs.extend(vals);
        let sp = self.gen(Inst::new(Opcode::SpillStack).srcs(&srcs))?;
        self.eval_stack.clear();
        self.stack_deficit = 0;
        Ok(sp)
    }

    /// The number of cells on the virtual stack.
    pub(super) fn num_cells(&self) -> i32 {
        // A stack never holds anywhere near 2^31 cells.
        i32::try_from(self.eval_stack.len()).unwrap()
    }

    pub(super) fn stack_deficit_i32(&self) -> i32 {
        i32::try_from(self.stack_deficit).unwrap()
    }

    /// The offset from the stack pointer of the in-memory cell `idx` cells below the top of the
    /// stack.
    pub(super) fn mem_stack_offset(&self, idx: usize) -> i32 {
        assert!(idx >= self.eval_stack.len());
        i32::try_from(idx - self.eval_stack.len()).unwrap() + self.stack_deficit_i32()
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        hir::{Opcode, Ty},
        testing::{assert_hir_matches, TestUnit},
    };

    #[test]
    fn push_then_pop_is_free() {
        let u = TestUnit::new();
        let mut t = u.translator();
        let three = t.cns(3).unwrap();
        t.push(three);
        let before = t.module().trace_insts(crate::hir::TraceIdx::MAIN).count();
        assert_eq!(t.pop(Ty::CELL).unwrap(), three);
        assert_eq!(t.module().trace_insts(crate::hir::TraceIdx::MAIN).count(), before);
        assert_eq!(t.stack_deficit(), 0);
    }

    #[test]
    fn pop_empty_stack_loads() {
        let u = TestUnit::new();
        let mut t = u.translator();
        let v = t.pop(Ty::INT).unwrap();
        assert_eq!(t.stack_deficit(), 1);
        assert_eq!(t.module().inst(v).opcode(), Opcode::LdStack);
        assert_eq!(t.module().ty(v), Ty::INT);
        let w = t.pop(Ty::CELL).unwrap();
        assert_eq!(t.stack_deficit(), 2);
        assert_ne!(v, w);
        t.discard(3).unwrap();
        assert_eq!(t.stack_deficit(), 5);
    }

    #[test]
    fn extend_preserves_order() {
        let u = TestUnit::new();
        let mut t = u.translator();
        let a = t.cns(1).unwrap();
        let b = t.cns(2).unwrap();
        t.push(a);
        t.push(b);
        // The stack is now [b, a, <memory>...]; reaching down three cells must load two
        // values from memory beneath `a` without disturbing `b` and `a`.
        let c = t.top(Ty::STR, 3).unwrap();
        assert_eq!(t.eval_stack_len(), 4);
        assert_eq!(t.eval_stack_at(0), b);
        assert_eq!(t.eval_stack_at(1), a);
        assert_eq!(t.eval_stack_at(3), c);
        assert_eq!(t.module().ty(c), Ty::STR);
        assert_eq!(t.module().ty(t.eval_stack_at(2)), Ty::GEN | Ty::CLS);
        assert_eq!(t.stack_deficit(), 2);
        assert_hir_matches(
            t.module(),
            "
            ...
            %{{_}}: Gen|Cls = LdStack<Gen|Cls> [off 0] %{{sp}}
            %{{_}}: Str = LdStack<Str> [off 1] %{{sp}}
            ",
        );
        // Popping the generically loaded value narrows it.
        let v = t.eval_stack_at(2);
        t.pop(Ty::CELL).unwrap();
        t.pop(Ty::CELL).unwrap();
        t.pop(Ty::CELL).unwrap();
        assert_eq!(t.module().ty(v), Ty::CELL);
    }

    #[test]
    fn guarded_stack_cell_keeps_its_type() {
        let u = TestUnit::new();
        let mut t = u.translator();
        t.guard_type_stack(1, Ty::INT).unwrap();
        assert_eq!(t.top_ty(1), Ty::INT);
        t.pop(Ty::CELL).unwrap();
        let v = t.pop(Ty::CELL).unwrap();
        assert_eq!(t.module().ty(v), Ty::INT);
    }

    #[test]
    fn pop_dec_ref_from_memory() {
        let u = TestUnit::new();
        let mut t = u.translator();
        t.pop_dec_ref(Ty::CELL).unwrap();
        assert_eq!(t.stack_deficit(), 1);
        let sp = t.spill_stack().unwrap();
        assert_eq!(t.stack_deficit(), 0);
        assert_eq!(t.module().inst(sp).opcode(), Opcode::SpillStack);
        assert_hir_matches(
            t.module(),
            "
            ...
            DecRefStack<Cell> [off 0] %{{sp}}
            %{{_}}: StkPtr = SpillStack %{{sp}}, 1
            ",
        );
    }
}
