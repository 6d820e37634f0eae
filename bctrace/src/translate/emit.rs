//! Appending instructions to the main trace, and the local-variable and control-flow helpers
//! built on top of that.

use super::Translator;
use crate::{
    hir::{BlockHint, BlockIdx, Const, Extra, Inst, InstIdx, MarkerData, Opcode, TraceIdx, Ty},
    log::Verbosity,
    TranslationError,
};

impl Translator<'_> {
    /// Note that a marker for the current bytecode offset and stack depth is needed. It is
    /// emitted just before the next main trace instruction.
    pub(super) fn emit_marker(&mut self) {
        self.pending_marker = Some(self.make_marker(self.bc.bc_off));
    }

    pub(super) fn make_marker(&self, bc_off: i32) -> MarkerData {
        MarkerData {
            bc_off,
            func: self.bc.func,
            stack_off: self.tracker.sp_offset() + self.num_cells() - self.stack_deficit_i32(),
        }
    }

    /// Append `inst` to the current block of the main trace.
    pub(super) fn gen(&mut self, inst: Inst) -> Result<InstIdx, TranslationError> {
        if let Some(mk) = self.pending_marker.take() {
            self.m.push_inst(
                self.cur_block,
                Inst::new(Opcode::Marker).extra(Extra::Marker(mk)),
            )?;
        }
        let iidx = self.m.push_inst(self.cur_block, inst)?;
        self.tracker.update(&self.m, iidx);
        Ok(iidx)
    }

    /// Shorthand for an instruction with no type parameter, extra data, or taken block.
    pub(super) fn gen_op(
        &mut self,
        opcode: Opcode,
        srcs: &[InstIdx],
    ) -> Result<InstIdx, TranslationError> {
        self.gen(Inst::new(opcode).srcs(srcs))
    }

    /// Append `inst` to the (auxiliary trace) block `bidx`. Nothing about the main trace
    /// changes.
    pub(super) fn gen_for(
        &mut self,
        bidx: BlockIdx,
        inst: Inst,
    ) -> Result<InstIdx, TranslationError> {
        debug_assert_ne!(self.m.block(bidx).trace(), Some(TraceIdx::MAIN));
        self.m.push_inst(bidx, inst)
    }

    pub(super) fn cns(&mut self, c: impl Into<Const>) -> Result<InstIdx, TranslationError> {
        self.m.insert_const(c.into())
    }

    /// Increment `v`'s reference count (if it has one), returning the value to use from now on.
    pub(super) fn inc_ref(&mut self, v: InstIdx) -> Result<InstIdx, TranslationError> {
        if self.m.ty(v).maybe_counted() {
            self.gen_op(Opcode::IncRef, &[v])
        } else {
            Ok(v)
        }
    }

    pub(super) fn dec_ref(&mut self, v: InstIdx) -> Result<(), TranslationError> {
        if self.m.ty(v).maybe_counted() {
            self.gen_op(Opcode::DecRef, &[v])?;
        }
        Ok(())
    }

    // Locals.

    /// Load local `id`. If the value the local holds is already known, no instruction is
    /// emitted.
    pub(super) fn ld_loc(&mut self, id: u32) -> Result<InstIdx, TranslationError> {
        let l = self.tracker.local(id);
        if let Some(v) = l.value {
            return Ok(v);
        }
        let fp = self.fp();
        self.gen(
            Inst::new(Opcode::LdLoc)
                .tp(l.ty)
                .extra(Extra::LocalId(id))
                .srcs(&[fp]),
        )
    }

    /// Do we know whether local `id` is boxed or not? Lowerings that read or write locals must
    /// check this before emitting anything.
    pub(super) fn local_shape_known(&self, id: u32) -> bool {
        let t = self.tracker.local_ty(id);
        t.is_boxed() || t.not_boxed()
    }

    /// Load local `id`, dereferencing it if it is boxed. The dereference exits to `exit` if the
    /// box's contents don't have the type we expect.
    pub(super) fn ld_loc_inner(
        &mut self,
        id: u32,
        exit: BlockIdx,
    ) -> Result<InstIdx, TranslationError> {
        let loc = self.ld_loc(id)?;
        let ty = self.m.ty(loc);
        assert!(
            ty.is_boxed() || ty.not_boxed(),
            "local {id} may or may not be boxed ({ty})"
        );
        if ty.is_boxed() {
            self.gen(
                Inst::new(Opcode::LdRef)
                    .tp(ty.inner_type())
                    .srcs(&[loc])
                    .taken(exit),
            )
        } else {
            Ok(loc)
        }
    }

    /// As [Self::ld_loc_inner], but raise a notice (unwinding to `catch`, which is created if not
    /// supplied) if the local is uninitialized, in which case the result is null.
    pub(super) fn ld_loc_inner_warn(
        &mut self,
        id: u32,
        exit: BlockIdx,
        catch: Option<BlockIdx>,
    ) -> Result<InstIdx, TranslationError> {
        let v = self.ld_loc_inner(id, exit)?;
        if self.m.ty(v).subtype_of(Ty::UNINIT) {
            let catch = match catch {
                Some(x) => x,
                None => self.catch_trace()?,
            };
            let name = self.local_name(id)?;
            let name = self.cns(name.as_str())?;
            self.gen(
                Inst::new(Opcode::RaiseUninitLoc)
                    .srcs(&[name])
                    .taken(catch),
            )?;
            return self.cns(Const::InitNull);
        }
        Ok(v)
    }

    fn local_name(&self, id: u32) -> Result<String, TranslationError> {
        let f = self.cur_func()?;
        Ok(f
            .local_names
            .get(usize::try_from(id).unwrap())
            .cloned()
            .unwrap_or_else(|| format!("local{id}")))
    }

    /// Store `new_val` to local `id`, releasing the old value. If the local is boxed, the value is
    /// stored into the box, whose current contents are loaded with a type check that exits to
    /// `exit`. Returns `new_val` with its reference count incremented.
    ///
    /// # Panics
    ///
    /// If it isn't known whether the local is boxed (see [Self::local_shape_known]), or if the
    /// local is boxed and `exit` is `None`.
    pub(super) fn st_loc(
        &mut self,
        id: u32,
        exit: Option<BlockIdx>,
        new_val: InstIdx,
    ) -> Result<InstIdx, TranslationError> {
        self.st_loc_impl(id, exit, new_val, true)
    }

    /// As [Self::st_loc], but with no reference counting.
    pub(super) fn st_loc_nrc(
        &mut self,
        id: u32,
        exit: Option<BlockIdx>,
        new_val: InstIdx,
    ) -> Result<InstIdx, TranslationError> {
        self.st_loc_impl(id, exit, new_val, false)
    }

    fn st_loc_impl(
        &mut self,
        id: u32,
        exit: Option<BlockIdx>,
        new_val: InstIdx,
        rc: bool,
    ) -> Result<InstIdx, TranslationError> {
        assert!(!self.m.ty(new_val).maybe_boxed());
        assert!(self.local_shape_known(id));
        let old = self.ld_loc(id)?;
        let old_ty = self.m.ty(old);
        if old_ty.not_boxed() {
            let fp = self.fp();
            self.gen(
                Inst::new(Opcode::StLoc)
                    .extra(Extra::LocalId(id))
                    .srcs(&[fp, new_val]),
            )?;
            let ret = if rc { self.inc_ref(new_val)? } else { new_val };
            if rc {
                self.dec_ref(old)?;
            }
            return Ok(ret);
        }
        let Some(exit) = exit else {
            panic!("store to boxed local {id} without an exit");
        };
        // The LdRef guards the inner type, so it must precede the IncRef.
        let inner = self.gen(
            Inst::new(Opcode::LdRef)
                .tp(old_ty.inner_type())
                .srcs(&[old])
                .taken(exit),
        )?;
        let ret = if rc { self.inc_ref(new_val)? } else { new_val };
        self.gen_op(Opcode::StRef, &[old, new_val])?;
        if rc {
            self.dec_ref(inner)?;
        }
        Ok(ret)
    }

    // Diamonds.

    /// Build a two-armed diamond in the main trace. `branch` emits a conditional branch to the
    /// block it is given; `next` then emits the fall-through arm and `taken` the branch target
    /// arm. Returns the join of the two arms' results.
    pub(super) fn cond<B, N, T>(
        &mut self,
        branch: B,
        next: N,
        taken: T,
    ) -> Result<InstIdx, TranslationError>
    where
        B: FnOnce(&mut Self, BlockIdx) -> Result<(), TranslationError>,
        N: FnOnce(&mut Self) -> Result<InstIdx, TranslationError>,
        T: FnOnce(&mut Self) -> Result<InstIdx, TranslationError>,
    {
        let taken_block = self.m.new_block(BlockHint::Unlikely)?;
        let done_block = self.m.new_block(BlockHint::Neither)?;
        branch(self, taken_block)?;
        let v1 = next(self)?;
        self.gen(Inst::new(Opcode::Jmp_).srcs(&[v1]).taken(done_block))?;
        self.m.append_block(TraceIdx::MAIN, taken_block);
        self.cur_block = taken_block;
        let v2 = taken(self)?;
        self.gen(Inst::new(Opcode::Jmp_).srcs(&[v2]).taken(done_block))?;
        self.m.append_block(TraceIdx::MAIN, done_block);
        self.cur_block = done_block;
        let ty = self.m.ty(v1) | self.m.ty(v2);
        self.gen(Inst::new(Opcode::DefLabel).tp(ty))
    }

    /// Build a one-armed diamond: `branch` emits a conditional branch to the block it is given,
    /// which `taken` fills. Both paths then continue in a fresh block.
    pub(super) fn if_then<B, T>(&mut self, branch: B, taken: T) -> Result<(), TranslationError>
    where
        B: FnOnce(&mut Self, BlockIdx) -> Result<(), TranslationError>,
        T: FnOnce(&mut Self) -> Result<(), TranslationError>,
    {
        let taken_block = self.m.new_block(BlockHint::Unlikely)?;
        let done_block = self.m.new_block(BlockHint::Neither)?;
        branch(self, taken_block)?;
        self.gen(Inst::new(Opcode::Jmp_).taken(done_block))?;
        self.m.append_block(TraceIdx::MAIN, taken_block);
        self.cur_block = taken_block;
        taken(self)?;
        self.gen(Inst::new(Opcode::Jmp_).taken(done_block))?;
        self.m.append_block(TraceIdx::MAIN, done_block);
        self.cur_block = done_block;
        Ok(())
    }

    // Falling back to the interpreter.

    /// Have the interpreter execute the current bytecode, which pops `popped` cells and pushes a
    /// value of type `ty` (if not `None`) plus `extra_pushed` further cells.
    pub(super) fn interp_one(
        &mut self,
        ty: Option<Ty>,
        popped: u32,
        extra_pushed: u32,
    ) -> Result<(), TranslationError> {
        let sp = self.spill_stack()?;
        self.discard(popped)?;
        assert_eq!(popped, self.stack_deficit);
        let pushed = i64::from(ty.is_some()) + i64::from(extra_pushed);
        let fp = self.fp();
        let bc = self.cns(self.bc.bc_off)?;
        let adjust = self.cns(i64::from(popped) - pushed)?;
        let mut inst = Inst::new(Opcode::InterpOne).srcs(&[fp, sp, bc, adjust]);
        if let Some(ty) = ty {
            inst = inst.tp(ty);
        }
        self.gen(inst)?;
        self.stack_deficit = 0;
        Ok(())
    }

    /// Have the interpreter execute the current bytecode, which may transfer control anywhere.
    /// This ends the main trace.
    pub(super) fn interp_one_cf(&mut self, popped: u32) -> Result<(), TranslationError> {
        let sp = self.spill_stack()?;
        self.discard(popped)?;
        assert_eq!(popped, self.stack_deficit);
        let fp = self.fp();
        let bc = self.cns(self.bc.bc_off)?;
        self.gen_op(Opcode::InterpOneCF, &[fp, sp, bc])?;
        self.stack_deficit = 0;
        self.has_exit = true;
        Ok(())
    }

    /// Give up on specialising the current bytecode for reason `why`: see [Self::interp_one].
    pub(super) fn punt(
        &mut self,
        why: &str,
        ty: Option<Ty>,
        popped: u32,
        extra_pushed: u32,
    ) -> Result<(), TranslationError> {
        self.log(
            Verbosity::Translation,
            &format!("interpreting bc {}: {why}", self.bc.bc_off),
        );
        self.interp_one(ty, popped, extra_pushed)
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        hir::{BlockHint, Const, Opcode, TraceIdx, TraceKind, Ty},
        testing::{assert_hir_matches, TestUnit},
    };

    #[test]
    fn markers_are_lazy() {
        let u = TestUnit::new();
        let mut t = u.translator();
        t.set_bc_off(1, false);
        t.set_bc_off(2, false);
        let one = t.cns(1).unwrap();
        t.push(one);
        let v = t.pop(Ty::INT).unwrap();
        t.gen_op(Opcode::PrintInt, &[v]).unwrap();
        t.end().unwrap();
        // Only the offset current when something was emitted gets a marker.
        assert_hir_matches(
            t.module(),
            "
            trace 0 (main):
              bb0:
                Marker [bc=0 sp=4 func#0]
                %{{fp}}: FramePtr = DefFP
                %{{sp}}: StkPtr = DefSP [off 4] %{{fp}}
                Marker [bc=2 sp=4 func#0]
                PrintInt 1
                Marker [bc=3 sp=4 func#0]
                %{{sp2}}: StkPtr = SpillStack %{{sp}}, 0
                SyncABIRegs %{{fp}}, %{{sp2}}
                ReqBindJmp [bc 3]
            ",
        );
        assert!(t.has_exit());
        t.finish().unwrap();
    }

    #[test]
    fn uninit_local_raises() {
        let u = TestUnit::new();
        let mut t = u.translator();
        t.guard_type_local(1, Ty::UNINIT).unwrap();
        let exit = t.exit_trace(None).unwrap();
        let v = t.ld_loc_inner_warn(1, exit, None).unwrap();
        assert_eq!(t.module().const_val(v).map(|c| c.ty()), Some(Const::InitNull.ty()));
        let catch = t
            .module()
            .traces()
            .find(|(_, tr)| tr.kind() == TraceKind::Catch)
            .map(|(tidx, _)| t.module().entry(tidx))
            .unwrap();
        let raise = t
            .module()
            .trace_insts(TraceIdx::MAIN)
            .find(|i| t.module().inst(*i).opcode() == Opcode::RaiseUninitLoc)
            .unwrap();
        assert_eq!(t.module().inst(raise).taken_block(), Some(catch));
        assert_hir_matches(
            t.module(),
            "
            ...
            %{{_}}: Uninit = LdLoc<Uninit> [loc 1] %{{_}}
            RaiseUninitLoc \"b\" -> bb{{_}}
            ...
            ",
        );
    }

    #[test]
    fn store_to_boxed_local() {
        let u = TestUnit::new();
        let mut t = u.translator();
        t.guard_type_local(0, Ty::BOXED_INT).unwrap();
        let exit = t.exit_trace(None).unwrap();
        let s = t.cns("x").unwrap();
        let r = t.st_loc(0, Some(exit), s).unwrap();
        // Static strings aren't reference counted.
        assert_eq!(r, s);
        assert_hir_matches(
            t.module(),
            "
            ...
            %{{box}}: BoxedInt = LdLoc<BoxedInt> [loc 0] %{{_}}
            %{{_}}: Int = LdRef<Int> %{{box}} -> bb{{_}}
            StRef %{{box}}, \"x\"
            ...
            ",
        );
        assert_eq!(t.tracker.local_ty(0), Ty::BOXED_STATIC_STR);
    }

    #[test]
    fn store_releases_old_value() {
        let u = TestUnit::new();
        let mut t = u.translator();
        t.guard_type_local(2, Ty::OBJ).unwrap();
        let v = t.cns(7).unwrap();
        t.st_loc(2, None, v).unwrap();
        assert_hir_matches(
            t.module(),
            "
            ...
            %{{old}}: Obj = LdLoc<Obj> [loc 2] %{{fp}}
            StLoc [loc 2] %{{fp}}, 7
            DecRef %{{old}}
            ",
        );
        // The store is tracked, so reloading the local needs no instruction.
        assert_eq!(t.ld_loc(2).unwrap(), v);
    }

    #[test]
    fn cond_diamond() {
        let u = TestUnit::new();
        let mut t = u.translator();
        let a = t.cns(1).unwrap();
        let v = t
            .cond(
                |t, taken| {
                    let b = t.cns(true)?;
                    t.gen(
                        crate::hir::Inst::new(Opcode::JmpNZero)
                            .srcs(&[b])
                            .taken(taken),
                    )?;
                    Ok(())
                },
                |_| Ok(a),
                |t| t.cns(2.5),
            )
            .unwrap();
        assert_eq!(t.module().ty(v), Ty::INT | Ty::DBL);
        let blocks = t.module().trace(TraceIdx::MAIN).blocks().to_vec();
        assert_eq!(blocks.len(), 3);
        assert_eq!(t.module().block(blocks[1]).hint(), BlockHint::Unlikely);
        t.end().unwrap();
        assert_hir_matches(
            t.module(),
            "
            trace 0 (main):
              bb0:
                ...
                JmpNZero true -> bb{{taken}}
                Jmp_ 1 -> bb{{done}}
              bb{{taken}}: unlikely
                Jmp_ 2.5 -> bb{{done}}
              bb{{done}}:
                %{{_}}: Int|Dbl = DefLabel<Int|Dbl>
                ...
                ReqBindJmp [bc 1]
            ",
        );
        t.finish().unwrap();
    }

    #[test]
    fn interp_one_accounting() {
        let u = TestUnit::new();
        let mut t = u.translator();
        let a = t.cns(1).unwrap();
        t.push(a);
        t.push(a);
        t.push(a);
        t.interp_one(Some(Ty::INT), 2, 0).unwrap();
        assert_eq!(t.eval_stack_len(), 0);
        assert_eq!(t.stack_deficit(), 0);
        // Three cells were spilled, two popped and one pushed.
        assert_eq!(t.tracker.sp_offset(), 4 + 3 - 1);
        assert_hir_matches(
            t.module(),
            "
            ...
            %{{sp1}}: StkPtr = SpillStack %{{sp0}}, 0, 1, 1, 1
            %{{_}}: Int = LdStack<Int> [off 0] %{{sp1}}
            %{{_}}: Int = LdStack<Int> [off 1] %{{sp1}}
            %{{_}}: StkPtr = InterpOne<Int> %{{fp}}, %{{sp1}}, 0, 1
            ",
        );
    }
}
