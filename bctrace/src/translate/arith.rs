//! Arithmetic, logical, and comparison operators, including the read-modify-write forms on
//! locals.

use super::Translator;
use crate::{
    bytecode::{IncDecOp, SetOpOp},
    hir::{BlockIdx, Inst, InstIdx, Opcode, Ty},
    TranslationError,
};

/// Can `opcode` be applied directly to operands of types `t1` and `t2`? Bools are converted to
/// ints first.
fn arith_types_supported(opcode: Opcode, t1: Ty, t2: Ty) -> bool {
    let ok = match opcode {
        Opcode::OpAdd | Opcode::OpSub | Opcode::OpMul => &[Ty::INT, Ty::BOOL, Ty::DBL][..],
        Opcode::OpBitAnd | Opcode::OpBitOr | Opcode::OpBitXor => &[Ty::INT, Ty::BOOL][..],
        _ => panic!("{opcode} is not a binary arithmetic opcode"),
    };
    !t1.is_none() && !t2.is_none() && t1.subtype_of_any(ok) && t2.subtype_of_any(ok)
}

fn is_bit_op(opcode: Opcode) -> bool {
    matches!(
        opcode,
        Opcode::OpBitAnd | Opcode::OpBitOr | Opcode::OpBitXor
    )
}

impl Translator<'_> {
    /// Convert `v` to an int if it is a bool.
    fn bool_to_int(&mut self, v: InstIdx) -> Result<InstIdx, TranslationError> {
        if self.m.ty(v).is_bool() {
            self.gen_op(Opcode::ConvBoolToInt, &[v])
        } else {
            Ok(v)
        }
    }

    pub(super) fn emit_binary_arith(&mut self, opcode: Opcode) -> Result<(), TranslationError> {
        let t1 = self.top_ty(0);
        let t2 = self.top_ty(1);
        if arith_types_supported(opcode, t1, t2) {
            let tr = self.pop_c()?;
            let tl = self.pop_c()?;
            let tr = self.bool_to_int(tr)?;
            let tl = self.bool_to_int(tl)?;
            let r = self.gen_op(opcode, &[tl, tr])?;
            self.push(r);
            return Ok(());
        }
        let ty = if !is_bit_op(opcode) {
            // Either an int or a double.
            Ty::CELL
        } else if t1.is_string() && t2.is_string() {
            Ty::STR
        } else if (t1.needs_reg() && (t2.needs_reg() || t2.is_string()))
            || (t2.needs_reg() && t1.is_string())
        {
            // Both could be strings.
            Ty::CELL
        } else {
            Ty::INT
        };
        self.interp_one(Some(ty), 2, 0)
    }

    /// `Div` and `Mod` can produce `false` (with a warning) or either numeric type, so are left
    /// to the interpreter.
    pub(super) fn emit_div_mod(&mut self) -> Result<(), TranslationError> {
        self.interp_one(Some(Ty::CELL), 2, 0)
    }

    pub(super) fn emit_bit_not(&mut self) -> Result<(), TranslationError> {
        let ty = self.top_ty(0);
        if ty.is_int() {
            let src = self.pop_c()?;
            let r = self.gen_op(Opcode::OpBitNot, &[src])?;
            self.push(r);
            return Ok(());
        }
        let rty = if ty.is_string() {
            Ty::STR
        } else if ty.needs_reg() {
            Ty::CELL
        } else {
            Ty::INT
        };
        self.interp_one(Some(rty), 1, 0)
    }

    pub(super) fn emit_not(&mut self) -> Result<(), TranslationError> {
        let src = self.pop_c()?;
        let b = self.gen_op(Opcode::ConvCellToBool, &[src])?;
        let r = self.gen_op(Opcode::OpNot, &[b])?;
        self.push(r);
        self.dec_ref(src)
    }

    /// Logical xor.
    pub(super) fn emit_xor(&mut self) -> Result<(), TranslationError> {
        let btr = self.pop_c()?;
        let btl = self.pop_c()?;
        let tr = self.gen_op(Opcode::ConvCellToBool, &[btr])?;
        let tl = self.gen_op(Opcode::ConvCellToBool, &[btl])?;
        let x = self.gen_op(Opcode::OpLogicXor, &[tl, tr])?;
        let r = self.gen_op(Opcode::ConvCellToBool, &[x])?;
        self.push(r);
        self.dec_ref(btl)?;
        self.dec_ref(btr)
    }

    /// Compare the top two cells. Comparisons that might call back into user code (an object's
    /// `__toString`, or element-wise comparison of arrays holding objects) get a catch trace.
    pub(super) fn emit_cmp(&mut self, opcode: Opcode) -> Result<(), TranslationError> {
        let t0 = self.top_ty(0);
        let t1 = self.top_ty(1);
        let may_reenter = !matches!(opcode, Opcode::OpSame | Opcode::OpNSame)
            && (t0.maybe(Ty::OBJ) || t1.maybe(Ty::OBJ) || (t0.maybe(Ty::ARR) && t1.maybe(Ty::ARR)));
        let catch = if may_reenter {
            Some(self.catch_trace()?)
        } else {
            None
        };
        let src1 = self.pop_c()?;
        let src2 = self.pop_c()?;
        let r = self.gen(Inst::new(opcode).srcs(&[src2, src1]).maybe_taken(catch))?;
        self.push(r);
        self.dec_ref(src2)?;
        self.dec_ref(src1)
    }

    /// Increment or decrement the number `src`, pushing the old or new value as `op` requires.
    /// Returns the new value.
    pub(super) fn emit_inc_dec(
        &mut self,
        op: IncDecOp,
        src: InstIdx,
    ) -> Result<InstIdx, TranslationError> {
        let one = if self.m.ty(src).is_int() {
            self.cns(1)?
        } else {
            self.cns(1.0)?
        };
        let opcode = if op.is_inc() {
            Opcode::OpAdd
        } else {
            Opcode::OpSub
        };
        let r = self.gen_op(opcode, &[src, one])?;
        // Numbers aren't reference counted.
        self.push(if op.is_pre() { r } else { src });
        Ok(r)
    }

    pub(super) fn emit_inc_dec_l(&mut self, id: u32, op: IncDecOp) -> Result<(), TranslationError> {
        let ty = self.tracker.local_ty(id).unbox();
        if !self.local_shape_known(id) || !ty.subtype_of_any(&[Ty::BOOL, Ty::INT, Ty::DBL]) {
            return self.punt("IncDecL on a non-number", Some(Ty::CELL), 0, 0);
        }
        let exit = self.exit_trace(None)?;
        let src = self.ld_loc_inner(id, exit)?;
        if self.m.ty(src).is_bool() {
            // Incrementing or decrementing a bool leaves it unchanged.
            self.push(src);
            return Ok(());
        }
        let r = self.emit_inc_dec(op, src)?;
        self.st_loc(id, Some(exit), r)?;
        Ok(())
    }

    /// Increment or decrement the int at `ptr`, exiting to `exit` if it isn't an int.
    pub(super) fn emit_inc_dec_mem(
        &mut self,
        op: IncDecOp,
        ptr: InstIdx,
        exit: BlockIdx,
    ) -> Result<(), TranslationError> {
        let zero = self.cns(0)?;
        let src = self.gen(
            Inst::new(Opcode::LdMem)
                .tp(Ty::INT)
                .srcs(&[ptr, zero])
                .taken(exit),
        )?;
        let r = self.emit_inc_dec(op, src)?;
        self.gen_op(Opcode::StMemNT, &[ptr, zero, r])?;
        Ok(())
    }

    pub(super) fn emit_set_op_l(&mut self, id: u32, op: SetOpOp) -> Result<(), TranslationError> {
        if !self.local_shape_known(id) {
            return self.punt("SetOpL on a local that may be boxed", Some(Ty::CELL), 1, 0);
        }
        let opcode = match op {
            SetOpOp::Concat => Opcode::Concat,
            SetOpOp::Plus => Opcode::OpAdd,
            SetOpOp::Minus => Opcode::OpSub,
            SetOpOp::Mul => Opcode::OpMul,
            SetOpOp::And => Opcode::OpBitAnd,
            SetOpOp::Or => Opcode::OpBitOr,
            SetOpOp::Xor => Opcode::OpBitXor,
            SetOpOp::Div | SetOpOp::Mod | SetOpOp::Sl | SetOpOp::Sr => {
                return self.punt("unsupported SetOpL", Some(Ty::CELL), 1, 0);
            }
        };
        if opcode != Opcode::Concat
            && !arith_types_supported(opcode, self.tracker.local_ty(id).unbox(), self.top_ty(0))
        {
            return self.punt("SetOpL on unsupported types", Some(Ty::CELL), 1, 0);
        }
        let exit = self.exit_trace(None)?;
        let loc = self.ld_loc_inner_warn(id, exit, None)?;
        let val = self.pop_c()?;
        if opcode == Opcode::Concat {
            // Concat consumes both operands' references (including the one the local held)
            // and produces a new one, which the local takes over.
            let r = self.gen_op(Opcode::Concat, &[loc, val])?;
            let stored = self.st_loc_nrc(id, Some(exit), r)?;
            self.push_inc_ref(stored)?;
            return Ok(());
        }
        let val = self.bool_to_int(val)?;
        let loc = self.bool_to_int(loc)?;
        let r = self.gen_op(opcode, &[loc, val])?;
        let stored = self.st_loc(id, Some(exit), r)?;
        self.push(stored);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        bytecode::{IncDecOp, Op, SetOpOp},
        hir::{Opcode, TraceIdx, TraceKind, Ty},
        testing::{assert_hir_matches, feed, TestUnit},
    };

    #[test]
    fn bools_are_converted() {
        let u = TestUnit::new();
        let mut t = u.translator();
        feed(&mut t, 0, &[Op::True, Op::Int(2), Op::BitAnd]);
        assert_eq!(t.module().ty(t.eval_stack_at(0)), Ty::INT);
        assert_hir_matches(
            t.module(),
            "
            ...
                %{{b}}: Int = ConvBoolToInt true
                %{{_}}: Int = OpBitAnd %{{b}}, 2
            ",
        );
    }

    #[test]
    fn unknown_bit_op_operands_are_interpreted() {
        let u = TestUnit::new();
        let mut t = u.translator();
        let s = t.cns("x").unwrap();
        t.push(s);
        t.push(s);
        t.set_bc_off(0, false);
        t.translate(&Op::BitOr).unwrap();
        assert_hir_matches(
            t.module(),
            "
            ...
                %{{_}}: StkPtr = InterpOne<Str> %{{fp}}, %{{sp}}, 0, 1
            ",
        );
    }

    #[test]
    fn div_is_interpreted() {
        let u = TestUnit::new();
        let mut t = u.translator();
        feed(&mut t, 0, &[Op::Int(1), Op::Int(0), Op::Div]);
        assert_eq!(t.tracker.sp_offset(), 5);
        assert!(t
            .module()
            .trace_insts(TraceIdx::MAIN)
            .any(|i| t.module().inst(i).opcode() == Opcode::InterpOne));
    }

    #[test]
    fn comparing_ints_cannot_throw() {
        let u = TestUnit::new();
        let mut t = u.translator();
        feed(&mut t, 0, &[Op::Int(1), Op::Int(2), Op::Lt]);
        assert_eq!(t.module().traces().count(), 1);
        assert_hir_matches(
            t.module(),
            "
            ...
                %{{_}}: Bool = OpLt 1, 2
            ",
        );
    }

    #[test]
    fn comparing_unknowns_may_throw() {
        let u = TestUnit::new();
        let mut t = u.translator();
        feed(&mut t, 0, &[Op::Eq]);
        assert!(t
            .module()
            .traces()
            .any(|(_, tr)| tr.kind() == TraceKind::Catch));
        assert_hir_matches(
            t.module(),
            "
            ...
                %{{a}}: Cell = LdStack<Cell> [off 0] %{{sp}}
                %{{b}}: Cell = LdStack<Cell> [off 1] %{{sp}}
                %{{_}}: Bool = OpEq %{{b}}, %{{a}} -> bb{{_}}
                DecRef %{{b}}
                DecRef %{{a}}
                ...
            ",
        );
    }

    #[test]
    fn post_increment_of_int_local() {
        let u = TestUnit::new();
        let mut t = u.translator();
        t.guard_type_local(0, Ty::INT).unwrap();
        feed(
            &mut t,
            0,
            &[Op::IncDecL {
                local: 0,
                op: IncDecOp::PostInc,
            }],
        );
        let old = t.eval_stack_at(0);
        assert_eq!(t.module().inst(old).opcode(), Opcode::LdLoc);
        assert_hir_matches(
            t.module(),
            "
            ...
                %{{v}}: Int = LdLoc<Int> [loc 0] %{{fp}}
                %{{r}}: Int = OpAdd %{{v}}, 1
                StLoc [loc 0] %{{fp}}, %{{r}}
                ...
            ",
        );
    }

    #[test]
    fn increment_of_string_local_is_interpreted() {
        let u = TestUnit::new();
        let mut t = u.translator();
        t.guard_type_local(0, Ty::STR).unwrap();
        feed(
            &mut t,
            0,
            &[Op::IncDecL {
                local: 0,
                op: IncDecOp::PreInc,
            }],
        );
        assert!(!t
            .module()
            .trace_insts(TraceIdx::MAIN)
            .any(|i| t.module().inst(i).opcode() == Opcode::OpAdd));
    }

    #[test]
    fn concat_onto_local() {
        let mut u = TestUnit::new();
        let s = u.litstr("s");
        let mut t = u.translator();
        t.guard_type_local(1, Ty::STR).unwrap();
        feed(
            &mut t,
            0,
            &[
                Op::String(s),
                Op::SetOpL {
                    local: 1,
                    op: SetOpOp::Concat,
                },
            ],
        );
        assert_hir_matches(
            t.module(),
            "
            ...
                %{{l}}: Str = LdLoc<Str> [loc 1] %{{fp}}
                %{{c}}: Str = Concat %{{l}}, \"s\"
                StLoc [loc 1] %{{fp}}, %{{c}}
                %{{_}}: Str = IncRef %{{c}}
                ...
            ",
        );
    }
}
