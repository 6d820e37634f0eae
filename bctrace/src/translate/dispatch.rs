//! The entry point for lowering one bytecode instruction.

use super::{globals::Storage, Translator};
use crate::{
    bytecode::Op,
    hir::{Const, Opcode, Ty},
    log::{log_ir, should_log_ir, IRPhase},
    TranslationError,
};

impl Translator<'_> {
    /// Lower `op`, the bytecode at the current offset (see [Self::set_bc_off]).
    pub fn translate(&mut self, op: &Op) -> Result<(), TranslationError> {
        if should_log_ir(IRPhase::Bytecode) {
            log_ir(&format!("{:>5}: {op:?}\n{}", self.bc.bc_off, self.show_stack()));
        }
        match op {
            Op::Nop => Ok(()),
            Op::PopC => self.pop_dec_ref(Ty::CELL),
            Op::PopV => self.pop_dec_ref(Ty::BOXED_CELL),
            Op::PopR => self.pop_dec_ref(Ty::GEN),
            Op::Dup => {
                let v = self.top_c(0)?;
                self.push_inc_ref(v)?;
                Ok(())
            }
            Op::UnboxR | Op::FPassR => self.emit_unbox_r(),

            Op::Null => self.push_cns(Const::InitNull),
            Op::NullUninit => self.push_cns(Const::Uninit),
            Op::True => self.push_cns(true),
            Op::False => self.push_cns(false),
            Op::Int(x) => self.push_cns(*x),
            Op::Double(x) => self.push_cns(*x),
            Op::String(id) => self.emit_string(*id),
            Op::Array(id) => self.emit_array(*id),
            Op::NewArray { capacity } => self.emit_new_array(*capacity),
            Op::NewTuple { num_args } => self.emit_new_tuple(*num_args),
            Op::ArrayAdd => self.emit_array_add(),
            Op::AddElemC => self.emit_add_elem_c(),
            Op::AddNewElemC => self.emit_add_new_elem_c(),
            Op::NewCol { .. } => self.interp_one(Some(Ty::OBJ), 0, 0),
            Op::ColAddElemC => self.interp_one(Some(Ty::OBJ), 3, 0),
            Op::ColAddNewElemC => self.interp_one(Some(Ty::OBJ), 2, 0),
            Op::Cns(id) => self.emit_cns(*id),
            Op::CnsE(_) => self.punt("CnsE", Some(Ty::CELL), 0, 0),
            Op::CnsU(_) => self.punt("CnsU", Some(Ty::CELL), 0, 0),
            Op::DefCns(id) => self.emit_def_cns(*id),
            Op::ClsCnsD { cns, cls } => self.emit_cls_cns_d(*cns, *cls),
            Op::Concat => self.emit_concat(),

            Op::Add => self.emit_binary_arith(Opcode::OpAdd),
            Op::Sub => self.emit_binary_arith(Opcode::OpSub),
            Op::Mul => self.emit_binary_arith(Opcode::OpMul),
            Op::BitAnd => self.emit_binary_arith(Opcode::OpBitAnd),
            Op::BitOr => self.emit_binary_arith(Opcode::OpBitOr),
            Op::BitXor => self.emit_binary_arith(Opcode::OpBitXor),
            Op::Div | Op::Mod => self.emit_div_mod(),
            Op::Xor => self.emit_xor(),
            Op::Not => self.emit_not(),
            Op::BitNot => self.emit_bit_not(),
            Op::Same => self.emit_cmp(Opcode::OpSame),
            Op::NSame => self.emit_cmp(Opcode::OpNSame),
            Op::Eq => self.emit_cmp(Opcode::OpEq),
            Op::Neq => self.emit_cmp(Opcode::OpNeq),
            Op::Lt => self.emit_cmp(Opcode::OpLt),
            Op::Lte => self.emit_cmp(Opcode::OpLte),
            Op::Gt => self.emit_cmp(Opcode::OpGt),
            Op::Gte => self.emit_cmp(Opcode::OpGte),
            Op::CastBool => self.emit_cast_bool(),
            Op::CastInt => self.emit_cast_int(),
            Op::CastDouble => self.emit_cast_double(),
            Op::CastString => self.emit_cast_string(),
            Op::CastArray => self.emit_cast_array(),
            Op::CastObject => self.emit_cast_object(),
            Op::InstanceOfD(id) => {
                let name = self.litstr(*id)?;
                self.emit_instance_of_d(name)
            }
            Op::Print => self.emit_print(),

            Op::Jmp {
                target,
                break_tracelet,
            } => self.emit_jmp(*target, *break_tracelet, false),
            Op::JmpNS {
                target,
                break_tracelet,
            } => self.emit_jmp(*target, *break_tracelet, true),
            Op::JmpZ(target) => self.emit_jmp_z(*target),
            Op::JmpNZ(target) => self.emit_jmp_nz(*target),
            Op::Switch {
                targets,
                base,
                bounded,
            } => self.emit_switch(targets, *base, *bounded),
            Op::SSwitch { cases, default } => self.emit_sswitch(cases, *default),
            Op::RetC { free_inline } => self.emit_ret(Ty::CELL, *free_inline),
            Op::RetV { free_inline } => self.emit_ret(Ty::BOXED_CELL, *free_inline),

            Op::CGetL(id) => self.emit_cget_l(*id),
            Op::CGetL2(id) => self.emit_cget_l2(*id),
            Op::VGetL(id) => self.emit_vget_l(*id),
            Op::CGetG { result, inferred } => {
                self.emit_cget_named(Storage::Global, *result, *inferred)
            }
            Op::CGetS { result, inferred } => {
                self.emit_cget_named(Storage::StaticProp, *result, *inferred)
            }
            Op::VGetG => self.emit_vget_named(Storage::Global),
            Op::VGetS => self.emit_vget_named(Storage::StaticProp),
            Op::AGetC => self.emit_aget_c(),
            Op::AGetL(id) => self.emit_aget_l(*id),
            Op::IssetL(id) => self.emit_isset_l(*id),
            Op::IssetG => self.emit_isset_named(Storage::Global),
            Op::IssetS => self.emit_isset_named(Storage::StaticProp),
            Op::EmptyL(id) => self.emit_empty_l(*id),
            Op::EmptyG => self.emit_empty_named(Storage::Global),
            Op::EmptyS => self.emit_empty_named(Storage::StaticProp),
            Op::IsTypeC(x) => self.emit_is_type_c(*x),
            Op::IsTypeL(id, x) => self.emit_is_type_l(*id, *x),
            Op::SetL(id) => self.emit_set_l(*id),
            Op::SetG => self.emit_set_named(Storage::Global),
            Op::SetS => self.emit_set_named(Storage::StaticProp),
            Op::SetOpL { local, op } => self.emit_set_op_l(*local, *op),
            Op::IncDecL { local, op } => self.emit_inc_dec_l(*local, *op),
            Op::IncDecS(op) => self.emit_inc_dec_s(*op),
            Op::BindL(id) => self.emit_bind_l(*id),
            Op::BindG => self.emit_bind_named(Storage::Global),
            Op::BindS => self.emit_bind_named(Storage::StaticProp),
            Op::UnsetL(id) => self.emit_unset_l(*id),
            Op::UnsetG | Op::UnsetN => self.interp_one(None, 1, 0),
            Op::MInstr { popped, result } => self.interp_one(*result, *popped, 0),

            Op::FPushFunc { num_params } => self.emit_fpush_func(*num_params),
            Op::FPushFuncD { num_params, func } => self.emit_fpush_func_d(*num_params, *func),
            Op::FPushFuncU { .. } => self.emit_fpush_func_u(),
            Op::FPushObjMethodD {
                num_params,
                name,
                base_class,
            } => self.emit_fpush_obj_method_d(*num_params, *name, *base_class),
            Op::FPushClsMethodD {
                num_params,
                name,
                cls,
            } => self.emit_fpush_cls_method_d(*num_params, *name, *cls),
            Op::FPushClsMethodF {
                num_params,
                name,
                cls,
            } => self.emit_fpush_cls_method_f(*num_params, *name, *cls),
            Op::FPushCtor { num_params } => self.emit_fpush_ctor(*num_params),
            Op::FPushCtorD { num_params, cls } => self.emit_fpush_ctor_d(*num_params, *cls),
            Op::FPushCufIter { num_params, iter } => self.emit_fpush_cuf_iter(*num_params, *iter),
            Op::FPushCuf {
                kind,
                num_params,
                callee,
                cls,
                inv_name,
            } => self.emit_fpush_cuf(*kind, *num_params, *callee, *cls, *inv_name),
            Op::FPassC => Ok(()),
            Op::FPassV => self.emit_fpass_v(),
            Op::FCall { num_params, callee } => self.emit_fcall(*num_params, *callee),
            Op::FCallArray => self.emit_fcall_array(),
            Op::FCallBuiltin {
                num_args,
                num_non_default,
                func,
            } => self.emit_fcall_builtin(*num_args, *num_non_default, *func),
            Op::CreateCl { num_params, name } => self.emit_create_cl(*num_params, *name),
            Op::NativeImpl => self.emit_native_impl(),

            Op::IterInit { iter, target, val } => {
                self.emit_iter_init(Opcode::IterInit, *iter, *target, *val, None)
            }
            Op::IterInitK {
                iter,
                target,
                val,
                key,
            } => self.emit_iter_init(Opcode::IterInitK, *iter, *target, *val, Some(*key)),
            Op::WIterInit { iter, target, val } => {
                self.emit_iter_init(Opcode::WIterInit, *iter, *target, *val, None)
            }
            Op::WIterInitK {
                iter,
                target,
                val,
                key,
            } => self.emit_iter_init(Opcode::WIterInitK, *iter, *target, *val, Some(*key)),
            Op::IterNext { iter, target, val } => {
                self.emit_iter_next(Opcode::IterNext, *iter, *target, *val, None)
            }
            Op::IterNextK {
                iter,
                target,
                val,
                key,
            } => self.emit_iter_next(Opcode::IterNextK, *iter, *target, *val, Some(*key)),
            Op::WIterNext { iter, target, val } => {
                self.emit_iter_next(Opcode::WIterNext, *iter, *target, *val, None)
            }
            Op::WIterNextK {
                iter,
                target,
                val,
                key,
            } => self.emit_iter_next(Opcode::WIterNextK, *iter, *target, *val, Some(*key)),
            Op::IterFree(iter) => self.emit_iter_free(Opcode::IterFree, *iter),
            Op::CIterFree(iter) => self.emit_iter_free(Opcode::CIterFree, *iter),
            Op::DecodeCufIter { iter, target } => self.emit_decode_cuf_iter(*iter, *target),

            Op::This => self.emit_this(),
            Op::BareThis { .. } => self.emit_bare_this(),
            Op::CheckThis => self.emit_check_this(),
            Op::InitThisLoc(id) => self.emit_init_this_loc(*id),
            Op::StaticLocInit { local, name } => self.emit_static_loc_init(*local, *name),
            Op::LateBoundCls => self.emit_late_bound_cls(),
            Op::Self_ => self.emit_self(),
            Op::Parent => self.emit_parent(),
            Op::VerifyParamType(id) => self.emit_verify_param_type(*id),
            Op::AKExists => self.emit_ak_exists(),
            Op::ArrayIdx => self.emit_array_idx(),
            Op::DefCls | Op::DefFunc => self.interp_one(None, 0, 0),
            Op::ClassExists | Op::InterfaceExists | Op::TraitExists => {
                self.interp_one(Some(Ty::BOOL), 2, 0)
            }
            Op::ReqDoc => self.punt("ReqDoc", Some(Ty::CELL), 1, 0),

            Op::CreateCont(id) => {
                let name = self.litstr(*id)?;
                self.emit_create_cont(name)
            }
            Op::ContEnter => self.emit_cont_enter(),
            Op::ContExit => self.emit_cont_exit(),
            Op::UnpackCont => self.emit_unpack_cont(),
            Op::PackCont(label) => self.emit_pack_cont(*label),
            Op::ContRetC => self.emit_cont_ret_c(),
            Op::ContNext => self.emit_cont_next(),
            Op::ContSend => self.emit_cont_send(false),
            Op::ContRaise => self.emit_cont_send(true),
            Op::ContValid => self.emit_cont_valid(),
            Op::ContCurrent => self.emit_cont_current(),
            Op::ContStopped => self.emit_cont_stopped(),
            Op::ContHandle => self.emit_cont_handle(),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        bytecode::Op,
        hir::{Opcode, TraceIdx, Ty},
        testing::{assert_hir_matches, feed, TestUnit},
    };

    #[test]
    fn dup_and_pop() {
        let u = TestUnit::new();
        let mut t = u.translator();
        t.guard_type_local(0, Ty::OBJ).unwrap();
        feed(&mut t, 0, &[Op::CGetL(0), Op::Dup, Op::PopC, Op::PopC]);
        assert_eq!(t.eval_stack_len(), 0);
        assert_hir_matches(
            t.module(),
            "
            ...
                %{{o}}: Obj = LdLoc<Obj> [loc 0] %{{fp}}
                %{{o1}}: Obj = IncRef %{{o}}
                ...
                %{{o2}}: Obj = IncRef %{{o1}}
                ...
                DecRef %{{o2}}
                ...
                DecRef %{{o1}}
                ...
            ",
        );
    }

    #[test]
    fn member_instructions_are_interpreted() {
        let u = TestUnit::new();
        let mut t = u.translator();
        feed(
            &mut t,
            0,
            &[
                Op::Int(1),
                Op::MInstr {
                    popped: 1,
                    result: Some(Ty::CELL),
                },
            ],
        );
        assert_eq!(t.eval_stack_len(), 0);
        assert!(t
            .module()
            .trace_insts(TraceIdx::MAIN)
            .any(|i| t.module().inst(i).opcode() == Opcode::InterpOne));
    }

    #[test]
    fn a_small_function_ends_in_a_bind_jmp() {
        let u = TestUnit::new();
        let mut t = u.translator();
        t.guard_type_local(0, Ty::INT).unwrap();
        t.guard_type_local(1, Ty::INT).unwrap();
        feed(
            &mut t,
            0,
            &[Op::CGetL(0), Op::Int(2), Op::Mul, Op::SetL(1), Op::PopC],
        );
        t.end().unwrap();
        let m = t.finish().unwrap();
        assert_hir_matches(
            &m,
            "
            ...
                %{{x}}: Int = LdLoc<Int> [loc 0] %{{fp}}
                ...
                %{{y}}: Int = OpMul %{{x}}, 2
                ...
                StLoc [loc 1] %{{fp}}, %{{y}}
                ...
                SyncABIRegs %{{fp}}, %{{_}}
                ReqBindJmp [bc 5]
            ...
            ",
        );
    }
}
