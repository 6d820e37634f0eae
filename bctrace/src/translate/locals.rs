//! Reads and writes of locals.
//!
//! Everything here needs to know whether the local is boxed. If we don't, the bytecode is
//! interpreted.

use super::Translator;
use crate::{
    bytecode::IsTypeOp,
    hir::{Const, Extra, Inst, Opcode, Ty},
    TranslationError,
};

impl Translator<'_> {
    pub(super) fn emit_cget_l(&mut self, id: u32) -> Result<(), TranslationError> {
        if !self.local_shape_known(id) {
            return self.punt("CGetL of a local that may be boxed", Some(Ty::CELL), 0, 0);
        }
        let exit = self.exit_trace(None)?;
        let v = self.ld_loc_inner_warn(id, exit, None)?;
        self.push_inc_ref(v)?;
        Ok(())
    }

    /// Push local `id` underneath the top of the stack.
    pub(super) fn emit_cget_l2(&mut self, id: u32) -> Result<(), TranslationError> {
        if !self.local_shape_known(id) {
            return self.punt("CGetL2 of a local that may be boxed", Some(Ty::CELL), 1, 1);
        }
        let exit = self.exit_trace(None)?;
        // The notice for an uninitialized local must see the stack as it was before the pop.
        let catch = if self.tracker.local_ty(id).subtype_of(Ty::UNINIT) {
            Some(self.catch_trace()?)
        } else {
            None
        };
        let old_top = self.pop(Ty::GEN)?;
        let v = self.ld_loc_inner_warn(id, exit, catch)?;
        self.push_inc_ref(v)?;
        self.push(old_top);
        Ok(())
    }

    /// Push a reference to local `id`, boxing the local first if need be.
    pub(super) fn emit_vget_l(&mut self, id: u32) -> Result<(), TranslationError> {
        if !self.local_shape_known(id) {
            return self.punt("VGetL of a local that may be boxed", Some(Ty::BOXED_CELL), 0, 0);
        }
        let mut v = self.ld_loc(id)?;
        if !self.m.ty(v).is_boxed() {
            if self.m.ty(v).subtype_of(Ty::UNINIT) {
                v = self.cns(Const::InitNull)?;
            }
            v = self.gen_op(Opcode::Box, &[v])?;
            let fp = self.fp();
            self.gen(
                Inst::new(Opcode::StLoc)
                    .extra(Extra::LocalId(id))
                    .srcs(&[fp, v]),
            )?;
        }
        self.push_inc_ref(v)?;
        Ok(())
    }

    pub(super) fn emit_set_l(&mut self, id: u32) -> Result<(), TranslationError> {
        if !self.local_shape_known(id) {
            return self.punt("SetL to a local that may be boxed", Some(Ty::CELL), 1, 0);
        }
        let exit = self.exit_trace(None)?;
        let src = self.pop_c()?;
        let v = self.st_loc(id, Some(exit), src)?;
        self.push(v);
        Ok(())
    }

    /// Bind local `id` to the reference on top of the stack.
    pub(super) fn emit_bind_l(&mut self, id: u32) -> Result<(), TranslationError> {
        let new_val = self.pop_v()?;
        // The reference on the stack is only released after the old value is, so count it
        // before loading the old value.
        self.push_inc_ref(new_val)?;
        let old = self.ld_loc(id)?;
        let fp = self.fp();
        self.gen(
            Inst::new(Opcode::StLoc)
                .extra(Extra::LocalId(id))
                .srcs(&[fp, new_val]),
        )?;
        self.dec_ref(old)
    }

    pub(super) fn emit_unset_l(&mut self, id: u32) -> Result<(), TranslationError> {
        let prev = self.ld_loc(id)?;
        let uninit = self.cns(Const::Uninit)?;
        let fp = self.fp();
        self.gen(
            Inst::new(Opcode::StLoc)
                .extra(Extra::LocalId(id))
                .srcs(&[fp, uninit]),
        )?;
        self.dec_ref(prev)
    }

    pub(super) fn emit_isset_l(&mut self, id: u32) -> Result<(), TranslationError> {
        if !self.local_shape_known(id) {
            return self.punt("IssetL of a local that may be boxed", Some(Ty::BOOL), 0, 0);
        }
        let exit = self.exit_trace(None)?;
        let v = self.ld_loc_inner(id, exit)?;
        let r = self.gen(Inst::new(Opcode::IsNType).tp(Ty::NULL).srcs(&[v]))?;
        self.push(r);
        Ok(())
    }

    pub(super) fn emit_empty_l(&mut self, id: u32) -> Result<(), TranslationError> {
        if !self.local_shape_known(id) {
            return self.punt("EmptyL of a local that may be boxed", Some(Ty::BOOL), 0, 0);
        }
        let exit = self.exit_trace(None)?;
        let v = self.ld_loc_inner(id, exit)?;
        let b = self.gen_op(Opcode::ConvCellToBool, &[v])?;
        let r = self.gen_op(Opcode::OpNot, &[b])?;
        self.push(r);
        Ok(())
    }

    pub(super) fn emit_is_type_l(&mut self, id: u32, op: IsTypeOp) -> Result<(), TranslationError> {
        if !self.local_shape_known(id) {
            return self.punt("IsTypeL of a local that may be boxed", Some(Ty::BOOL), 0, 0);
        }
        let exit = self.exit_trace(None)?;
        let v = self.ld_loc_inner_warn(id, exit, None)?;
        let r = self.gen(Inst::new(Opcode::IsType).tp(op.ty()).srcs(&[v]))?;
        self.push(r);
        Ok(())
    }
}
