//! Globals and static properties.
//!
//! Both are reached through a pointer computed from a name (and, for static properties, a
//! class) on the stack. We only lower these bytecodes when the name is known to be a string: for
//! anything else the interpreter's name conversion rules apply.

use super::Translator;
use crate::{
    bytecode::IncDecOp,
    hir::{BlockIdx, Const, Inst, InstIdx, Opcode, Ty},
    TranslationError,
};
use std::cell::Cell;

/// Which kind of named storage a bytecode addresses.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(super) enum Storage {
    /// A global: the name is on top of the stack.
    Global,
    /// A static property: the class is on top of the stack, the name below it.
    StaticProp,
}

impl<'u> Translator<'u> {
    /// Is the name of a global at stack index `idx` usable? If not, interpret the current
    /// bytecode, which pops everything down to and including the name.
    fn check_gbl_name(&mut self, result: Option<Ty>, idx: usize) -> Result<bool, TranslationError> {
        if self.top_ty(idx).is_string() {
            return Ok(true);
        }
        self.punt("global name is not a string", result, to_u32(idx + 1), 0)?;
        Ok(false)
    }

    /// As [Self::check_gbl_name], for a static property whose class is at stack index `idx`.
    fn check_cls_prop(&mut self, result: Option<Ty>, idx: usize) -> Result<bool, TranslationError> {
        if self.top_ty(idx + 1).is_string() {
            return Ok(true);
        }
        self.punt(
            "static property name is not a string",
            result,
            to_u32(idx + 2),
            0,
        )?;
        Ok(false)
    }

    fn check_name(
        &mut self,
        storage: Storage,
        result: Option<Ty>,
        idx: usize,
    ) -> Result<bool, TranslationError> {
        match storage {
            Storage::Global => self.check_gbl_name(result, idx),
            Storage::StaticProp => self.check_cls_prop(result, idx),
        }
    }

    /// Pop a global's name and look up its address. If `block` is `None` a missing global is a
    /// fatal error; otherwise we branch to `block`.
    fn ld_gbl_addr(&mut self, block: Option<BlockIdx>) -> Result<InstIdx, TranslationError> {
        let name = self.pop_c()?;
        let addr = self.gen(
            Inst::new(Opcode::LdGblAddr)
                .srcs(&[name])
                .maybe_taken(block),
        )?;
        self.dec_ref(name)?;
        Ok(addr)
    }

    /// Pop a global's name and return its address, defining it if need be.
    fn ld_gbl_addr_def(&mut self) -> Result<InstIdx, TranslationError> {
        let name = self.pop_c()?;
        self.gen_op(Opcode::LdGblAddrDef, &[name])
    }

    /// If `cls` is a class whose name we know, return it.
    fn find_class_name(&self, cls: InstIdx) -> Result<Option<&'u str>, TranslationError> {
        if let Some(Const::Cls(id)) = self.m.const_val(cls) {
            return Ok(Some(self.class(*id)?.name.as_str()));
        }
        let inst = self.m.inst(cls);
        if inst.opcode() == Opcode::LdClsCached {
            if let Some(Const::Str(s)) = self.m.const_val(inst.src(0)) {
                return Ok(self
                    .unit
                    .lookup_class(s)
                    .and_then(|x| self.unit.class(x))
                    .map(|c| c.name.as_str()));
            }
        }
        Ok(None)
    }

    /// Can the static property named at stack index 1, of the class on top of the stack, be
    /// reached through a per-class cache?
    fn can_use_sprop_cache(&self) -> Result<bool, TranslationError> {
        if self.eval_stack.len() < 2 {
            return Ok(false);
        }
        let cls = self.eval_stack_at(0);
        let prop = self.eval_stack_at(1);
        if !matches!(self.m.const_val(prop), Some(Const::Str(_))) {
            return Ok(false);
        }
        let cur = self.cur_class()?.map(|c| c.id);
        Ok(match self.m.const_val(cls) {
            Some(Const::Cls(id)) => self.class(*id)?.is_persistent() || Some(*id) == cur,
            _ => false,
        })
    }

    /// Pop a class and a property name and look up the static property's address. Failure
    /// branches to `block` or, if that is `None`, throws.
    fn ld_cls_prop_addr(&mut self, block: Option<BlockIdx>) -> Result<InstIdx, TranslationError> {
        let ctx = match self.cur_class()? {
            Some(c) => Const::Cls(c.id),
            None => Const::Null,
        };
        if self.can_use_sprop_cache()? {
            let cls = self.pop_a()?;
            let prop = self.pop_c()?;
            let cls_name = self.find_class_name(cls)?.ok_or_else(|| {
                TranslationError::General("cached static property of an unnamed class".into())
            })?;
            let cls_name = self.cns(cls_name)?;
            let ctx = self.cns(ctx)?;
            return self.gen(
                Inst::new(Opcode::LdClsPropAddrCached)
                    .srcs(&[cls, prop, cls_name, ctx])
                    .maybe_taken(block),
            );
        }
        let block = match block {
            Some(b) => b,
            None => self.catch_trace()?,
        };
        let cls = self.pop_a()?;
        let prop = self.pop_c()?;
        let ctx = self.cns(ctx)?;
        let addr = self.gen(
            Inst::new(Opcode::LdClsPropAddr)
                .srcs(&[cls, prop, ctx])
                .taken(block),
        )?;
        self.dec_ref(prop)?;
        Ok(addr)
    }

    fn ld_addr(
        &mut self,
        storage: Storage,
        block: Option<BlockIdx>,
    ) -> Result<InstIdx, TranslationError> {
        match storage {
            Storage::Global => self.ld_gbl_addr(block),
            Storage::StaticProp => self.ld_cls_prop_addr(block),
        }
    }

    /// Store `src` to the cell `ptr` points to, pushing `src` and releasing the old value.
    fn emit_bind_mem(&mut self, ptr: InstIdx, src: InstIdx) -> Result<(), TranslationError> {
        let zero = self.cns(0)?;
        let prev = self.gen(Inst::new(Opcode::LdMem).tp(Ty::GEN).srcs(&[ptr, zero]))?;
        self.push_inc_ref(src)?;
        self.gen_op(Opcode::StMem, &[ptr, zero, src])?;
        if self.m.ty(src).maybe_counted() && self.m.ty(src).can_run_dtor() {
            // A destructor may run when the old value dies, and it could observe anything: leave
            // the trace and release the old value on the way out.
            let exit = self.exit_trace(Some(self.next_bc_off()))?;
            self.m
                .insert_inst(exit, 1, Inst::new(Opcode::DecRef).srcs(&[prev]))?;
            self.gen(
                Inst::new(Opcode::DecRefNZOrBranch)
                    .srcs(&[prev])
                    .taken(exit),
            )?;
        } else {
            self.dec_ref(prev)?;
        }
        Ok(())
    }

    pub(super) fn emit_set_named(&mut self, storage: Storage) -> Result<(), TranslationError> {
        let val_ty = match self.top_ty(0) {
            t if t.not_boxed() => t,
            _ => Ty::CELL,
        };
        if !self.check_name(storage, Some(val_ty), 1)? {
            return Ok(());
        }
        let src = self.pop_c()?;
        let addr = match storage {
            Storage::Global => self.ld_gbl_addr_def()?,
            Storage::StaticProp => self.ld_cls_prop_addr(None)?,
        };
        let ptr = self.gen_op(Opcode::UnboxPtr, &[addr])?;
        self.emit_bind_mem(ptr, src)
    }

    pub(super) fn emit_bind_named(&mut self, storage: Storage) -> Result<(), TranslationError> {
        let val_ty = match self.top_ty(0) {
            t if t.is_boxed() => t,
            _ => Ty::BOXED_CELL,
        };
        if !self.check_name(storage, Some(val_ty), 1)? {
            return Ok(());
        }
        let src = self.pop_v()?;
        let addr = match storage {
            Storage::Global => self.ld_gbl_addr_def()?,
            Storage::StaticProp => self.ld_cls_prop_addr(None)?,
        };
        self.emit_bind_mem(addr, src)
    }

    pub(super) fn emit_vget_named(&mut self, storage: Storage) -> Result<(), TranslationError> {
        if !self.check_name(storage, Some(Ty::BOXED_CELL), 0)? {
            return Ok(());
        }
        let addr = match storage {
            Storage::Global => self.ld_gbl_addr_def()?,
            Storage::StaticProp => self.ld_cls_prop_addr(None)?,
        };
        let ptr = self.gen_op(Opcode::BoxPtr, &[addr])?;
        let zero = self.cns(0)?;
        let v = self.gen(
            Inst::new(Opcode::LdMem)
                .tp(Ty::BOXED_CELL)
                .srcs(&[ptr, zero]),
        )?;
        self.push_inc_ref(v)?;
        Ok(())
    }

    pub(super) fn emit_isset_named(&mut self, storage: Storage) -> Result<(), TranslationError> {
        if !self.check_name(storage, Some(Ty::BOOL), 0)? {
            return Ok(());
        }
        let ptr = Cell::new(None);
        let r = self.cond(
            |t, taken| {
                ptr.set(Some(t.ld_addr(storage, Some(taken))?));
                Ok(())
            },
            |t| {
                let p = ptr.get().expect("address loaded by the branch");
                let p = t.gen_op(Opcode::UnboxPtr, &[p])?;
                t.gen(Inst::new(Opcode::IsNTypeMem).tp(Ty::NULL).srcs(&[p]))
            },
            |t| t.cns(false),
        )?;
        self.push(r);
        Ok(())
    }

    pub(super) fn emit_empty_named(&mut self, storage: Storage) -> Result<(), TranslationError> {
        if !self.check_name(storage, Some(Ty::BOOL), 0)? {
            return Ok(());
        }
        let ptr = Cell::new(None);
        let r = self.cond(
            |t, taken| {
                ptr.set(Some(t.ld_addr(storage, Some(taken))?));
                Ok(())
            },
            |t| {
                let p = ptr.get().expect("address loaded by the branch");
                let p = t.gen_op(Opcode::UnboxPtr, &[p])?;
                let zero = t.cns(0)?;
                let v = t.gen(Inst::new(Opcode::LdMem).tp(Ty::CELL).srcs(&[p, zero]))?;
                let b = t.gen_op(Opcode::ConvCellToBool, &[v])?;
                t.gen_op(Opcode::OpNot, &[b])
            },
            |t| t.cns(true),
        )?;
        self.push(r);
        Ok(())
    }

    /// `CGetG` / `CGetS`. `result` is the predicted type of the value; if `inferred` it is known
    /// to be right and the value is known not to be boxed.
    pub(super) fn emit_cget_named(
        &mut self,
        storage: Storage,
        result: Option<Ty>,
        inferred: bool,
    ) -> Result<(), TranslationError> {
        let result_ty = result.unwrap_or(Ty::CELL);
        if !self.check_name(storage, Some(result_ty), 0)? {
            return Ok(());
        }
        let exit = if inferred || result_ty == Ty::CELL {
            None
        } else {
            Some(self.exit_slow_trace()?)
        };
        let mut ptr = match storage {
            Storage::Global => {
                let slow = self.exit_slow_trace()?;
                self.ld_gbl_addr(Some(slow))?
            }
            Storage::StaticProp => self.ld_cls_prop_addr(None)?,
        };
        if !inferred {
            ptr = self.gen_op(Opcode::UnboxPtr, &[ptr])?;
        }
        let zero = self.cns(0)?;
        let v = self.gen(
            Inst::new(Opcode::LdMem)
                .tp(result_ty)
                .srcs(&[ptr, zero])
                .maybe_taken(exit),
        )?;
        self.push_inc_ref(v)?;
        Ok(())
    }

    pub(super) fn emit_inc_dec_s(&mut self, op: IncDecOp) -> Result<(), TranslationError> {
        if !self.check_cls_prop(Some(Ty::CELL), 0)? {
            return Ok(());
        }
        let exit = self.exit_slow_trace()?;
        let addr = self.ld_cls_prop_addr(None)?;
        let ptr = self.gen_op(Opcode::UnboxPtr, &[addr])?;
        self.emit_inc_dec_mem(op, ptr, exit)
    }
}

fn to_u32(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}
