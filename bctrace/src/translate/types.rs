//! Casts, type tests, class references, and parameter type verification.
//!
//! Casts specialise on the static type of their operand: a cast of a value whose type we know
//! becomes a single conversion (or nothing at all) and only casts of unknown values go through
//! the generic, possibly throwing, `ConvCellTo*` helpers.

use super::Translator;
use crate::{
    bytecode::IsTypeOp,
    hir::{Const, Inst, InstIdx, Opcode, Ty},
    unit::{Class, TypeConstraintKind},
    TranslationError,
};

impl<'u> Translator<'u> {
    fn class_ctx(&self) -> Result<Const, TranslationError> {
        Ok(match self.cur_class()? {
            Some(c) => Const::Cls(c.id),
            None => Const::Null,
        })
    }

    /// Is `cls` unique, or a parent of the current class? Either way, it can be burnt into code.
    fn class_is_unique_or_ctx_parent(&self, cls: &Class) -> Result<bool, TranslationError> {
        if cls.is_unique() {
            return Ok(true);
        }
        Ok(self
            .cur_class()?
            .is_some_and(|ctx| self.unit.class_of(ctx.id, cls.id)))
    }

    pub(super) fn emit_cast_bool(&mut self) -> Result<(), TranslationError> {
        let src = self.pop_c()?;
        let r = self.gen_op(Opcode::ConvCellToBool, &[src])?;
        self.push(r);
        self.dec_ref(src)
    }

    pub(super) fn emit_cast_int(&mut self) -> Result<(), TranslationError> {
        let from = self.top_ty(0);
        let catch = if from.is_obj() || !from.is_known_unboxed_data_type() {
            Some(self.catch_trace()?)
        } else {
            None
        };
        let src = self.pop_c()?;
        let r = if from.is_int() {
            src
        } else if from.is_null() {
            self.cns(0)?
        } else if from.is_array() {
            let r = self.gen_op(Opcode::ConvArrToInt, &[src])?;
            self.dec_ref(src)?;
            r
        } else if from.is_bool() {
            self.gen_op(Opcode::ConvBoolToInt, &[src])?
        } else if from.is_dbl() {
            self.gen_op(Opcode::ConvDblToInt, &[src])?
        } else if from.is_string() {
            let r = self.gen_op(Opcode::ConvStrToInt, &[src])?;
            self.dec_ref(src)?;
            r
        } else {
            let op = if from.is_obj() {
                Opcode::ConvObjToInt
            } else {
                Opcode::ConvCellToInt
            };
            self.gen(Inst::new(op).srcs(&[src]).maybe_taken(catch))?
        };
        self.push(r);
        Ok(())
    }

    pub(super) fn emit_cast_double(&mut self) -> Result<(), TranslationError> {
        let from = self.top_ty(0);
        let catch = if from.is_obj() || !from.is_known_unboxed_data_type() {
            Some(self.catch_trace()?)
        } else {
            None
        };
        let src = self.pop_c()?;
        let r = if from.is_dbl() {
            src
        } else if from.is_null() {
            self.cns(0.0)?
        } else if from.is_array() {
            let r = self.gen_op(Opcode::ConvArrToDbl, &[src])?;
            self.dec_ref(src)?;
            r
        } else if from.is_bool() {
            self.gen_op(Opcode::ConvBoolToDbl, &[src])?
        } else if from.is_int() {
            self.gen_op(Opcode::ConvIntToDbl, &[src])?
        } else if from.is_string() {
            self.gen_op(Opcode::ConvStrToDbl, &[src])?
        } else {
            let op = if from.is_obj() {
                Opcode::ConvObjToDbl
            } else {
                Opcode::ConvCellToDbl
            };
            self.gen(Inst::new(op).srcs(&[src]).maybe_taken(catch))?
        };
        self.push(r);
        Ok(())
    }

    pub(super) fn emit_cast_string(&mut self) -> Result<(), TranslationError> {
        let from = self.top_ty(0);
        let catch = if from.is_obj() || !from.is_known_unboxed_data_type() {
            Some(self.catch_trace()?)
        } else {
            None
        };
        let src = self.pop_c()?;
        let r = if from.is_string() {
            src
        } else if from.is_null() {
            self.cns("")?
        } else if from.is_array() {
            let r = self.cns("Array")?;
            self.dec_ref(src)?;
            r
        } else if from.is_bool() {
            self.gen_op(Opcode::ConvBoolToStr, &[src])?
        } else if from.is_dbl() {
            self.gen_op(Opcode::ConvDblToStr, &[src])?
        } else if from.is_int() {
            self.gen_op(Opcode::ConvIntToStr, &[src])?
        } else {
            let op = if from.is_obj() {
                Opcode::ConvObjToStr
            } else {
                Opcode::ConvCellToStr
            };
            self.gen(Inst::new(op).srcs(&[src]).maybe_taken(catch))?
        };
        self.push(r);
        Ok(())
    }

    /// The array conversions consume their operand's reference.
    pub(super) fn emit_cast_array(&mut self) -> Result<(), TranslationError> {
        let src = self.pop_c()?;
        let from = self.m.ty(src);
        let r = if from.is_array() {
            src
        } else if from.is_null() {
            self.cns(Const::EmptyArr)?
        } else {
            let op = if from.is_bool() {
                Opcode::ConvBoolToArr
            } else if from.is_dbl() {
                Opcode::ConvDblToArr
            } else if from.is_int() {
                Opcode::ConvIntToArr
            } else if from.is_string() {
                Opcode::ConvStrToArr
            } else if from.is_obj() {
                Opcode::ConvObjToArr
            } else {
                Opcode::ConvCellToArr
            };
            self.gen_op(op, &[src])?
        };
        self.push(r);
        Ok(())
    }

    pub(super) fn emit_cast_object(&mut self) -> Result<(), TranslationError> {
        let src = self.pop_c()?;
        let r = if self.m.ty(src).is_obj() {
            src
        } else {
            self.gen_op(Opcode::ConvCellToObj, &[src])?
        };
        self.push(r);
        Ok(())
    }

    pub(super) fn emit_is_type_c(&mut self, op: IsTypeOp) -> Result<(), TranslationError> {
        let src = self.pop_c()?;
        let r = self.gen(Inst::new(Opcode::IsType).tp(op.ty()).srcs(&[src]))?;
        self.push(r);
        self.dec_ref(src)
    }

    pub(super) fn emit_instance_of_d(&mut self, name: &'u str) -> Result<(), TranslationError> {
        let src_ty = self.top_ty(0);
        if Ty::OBJ.strict_subtype_of(src_ty) {
            return self.punt("InstanceOfD of a value that may be an object", Some(Ty::BOOL), 1, 0);
        }
        let src = self.pop_c()?;
        if !src_ty.is_obj() {
            // Arrays only satisfy a handful of builtin interfaces, none of which we model.
            self.push_cns(false)?;
            return self.dec_ref(src);
        }

        let obj_cls = self.gen_op(Opcode::LdObjClass, &[src])?;
        let name_cns = self.cns(name)?;
        let have_bit = self.unit.has_instance_bit(name);
        let maybe_cls = match self.unit.lookup_unique_class(name) {
            Some(id) => Some(self.class(id)?),
            None => None,
        };
        let is_unique = maybe_cls.is_some_and(|c| c.is_unique());
        let is_normal = maybe_cls.is_some_and(|c| c.is_unique() && c.is_normal());
        let check_cls = match maybe_cls {
            Some(c) if self.class_is_unique_or_ctx_parent(c)? => self.cns(Const::Cls(c.id))?,
            _ => self.gen_op(Opcode::LdClsCachedSafe, &[name_cns])?,
        };
        let r = if have_bit {
            self.gen_op(Opcode::InstanceOfBitmask, &[obj_cls, name_cns])?
        } else if is_unique && is_normal {
            self.gen_op(Opcode::ExtendsClass, &[obj_cls, check_cls])?
        } else {
            let iface = self.cns(maybe_cls.is_some() && !is_normal)?;
            self.gen_op(Opcode::InstanceOf, &[obj_cls, check_cls, iface])?
        };
        self.push(r);
        self.dec_ref(src)
    }

    fn emit_aget(&mut self, src: InstIdx) -> Result<InstIdx, TranslationError> {
        if self.m.ty(src).is_string() {
            let ctx = self.class_ctx()?;
            let ctx = self.cns(ctx)?;
            self.gen_op(Opcode::LdCls, &[src, ctx])
        } else {
            self.gen_op(Opcode::LdObjClass, &[src])
        }
    }

    pub(super) fn emit_aget_c(&mut self) -> Result<(), TranslationError> {
        if !self.top_ty(0).subtype_of_any(&[Ty::STR, Ty::OBJ]) || self.top_ty(0).is_none() {
            return self.interp_one(Some(Ty::CLS), 1, 0);
        }
        let src = self.pop_c()?;
        let r = self.emit_aget(src)?;
        self.push(r);
        self.dec_ref(src)
    }

    pub(super) fn emit_aget_l(&mut self, id: u32) -> Result<(), TranslationError> {
        let inner = self.tracker.local_ty(id).unbox();
        if !self.local_shape_known(id) || !(inner.is_string() || inner.is_obj()) {
            return self.punt("AGetL of a local that is not a string or object", Some(Ty::CLS), 0, 0);
        }
        let exit = self.exit_trace(None)?;
        let src = self.ld_loc_inner(id, exit)?;
        let r = self.emit_aget(src)?;
        self.push(r);
        Ok(())
    }

    /// Unbox the `R` on top of the stack.
    pub(super) fn emit_unbox_r(&mut self) -> Result<(), TranslationError> {
        let exit = self.exit_trace(None)?;
        let src = self.pop_r()?;
        if self.m.ty(src).not_boxed() {
            self.push(src);
            return Ok(());
        }
        let v = self.gen(Inst::new(Opcode::Unbox).srcs(&[src]).taken(exit))?;
        self.push_inc_ref(v)?;
        self.dec_ref(src)
    }

    pub(super) fn emit_verify_param_type(&mut self, id: u32) -> Result<(), TranslationError> {
        let func = self.cur_func()?;
        let tc = &func
            .params
            .get(usize::try_from(id).unwrap_or(usize::MAX))
            .ok_or_else(|| {
                TranslationError::General(format!("{} has no parameter {id}", func.name))
            })?
            .type_constraint;
        let loc_ty = self.tracker.local_ty(id).unbox();
        if !loc_ty.is_known_data_type() {
            return self.punt("VerifyParamType of a local of unknown type", None, 0, 0);
        }
        if tc.nullable && loc_ty.is_null() {
            return Ok(());
        }
        let param = self.cns(id)?;

        if tc.is_callable() {
            let exit = self.exit_trace(None)?;
            let v = self.ld_loc(id)?;
            let v = self.gen(Inst::new(Opcode::Unbox).srcs(&[v]).taken(exit))?;
            let catch = self.catch_trace()?;
            self.gen(
                Inst::new(Opcode::VerifyParamCallable)
                    .srcs(&[v, param])
                    .taken(catch),
            )?;
            return Ok(());
        }

        if !tc.is_object_or_typedef() {
            let v = self.ld_loc(id)?;
            if self.m.ty(v).is_boxed() {
                let exit = self.exit_trace(None)?;
                let inner = self.m.ty(v).inner_type();
                self.gen(Inst::new(Opcode::LdRef).tp(inner).srcs(&[v]).taken(exit))?;
            }
            if !tc.check_primitive(loc_ty) {
                let catch = self.catch_trace()?;
                self.gen(
                    Inst::new(Opcode::VerifyParamFail)
                        .srcs(&[param])
                        .taken(catch),
                )?;
            }
            return Ok(());
        }

        // A non-object may still satisfy a typedef.
        if !loc_ty.is_obj() {
            return self.punt("VerifyParamType of a non-object against a class", None, 0, 0);
        }

        let known = match &tc.kind {
            TypeConstraintKind::Object(name) => match self.unit.lookup_class(name) {
                Some(id) => Some(self.class(id)?),
                None => None,
            },
            TypeConstraintKind::Self_ => self.cur_class()?,
            TypeConstraintKind::Parent => match self.cur_class()?.and_then(|c| c.parent) {
                Some(p) => Some(self.class(p)?),
                None => None,
            },
            _ => unreachable!(),
        };
        let name = match (&tc.kind, known) {
            (TypeConstraintKind::Object(name), _) => name.as_str(),
            (_, Some(c)) => c.name.as_str(),
            (_, None) => {
                // `self` or `parent` outside of a class that has one: this always fails.
                let catch = self.catch_trace()?;
                self.gen(
                    Inst::new(Opcode::VerifyParamFail)
                        .srcs(&[param])
                        .taken(catch),
                )?;
                return Ok(());
            }
        };
        let known = match known {
            Some(c) if self.class_is_unique_or_ctx_parent(c)? => Some(c),
            _ => None,
        };

        let have_bit = self.unit.has_instance_bit(name);
        let constraint = match known {
            Some(c) => self.cns(Const::Cls(c.id))?,
            None => {
                let name = self.cns(name)?;
                self.gen_op(Opcode::LdClsCachedSafe, &[name])?
            }
        };
        let exit = self.exit_trace(None)?;
        let v = self.ld_loc(id)?;
        let v = self.gen(Inst::new(Opcode::Unbox).srcs(&[v]).taken(exit))?;
        let obj_cls = self.gen_op(Opcode::LdObjClass, &[v])?;
        if have_bit || known.is_some_and(|c| c.is_unique() && c.is_normal()) {
            let is_instance = if have_bit {
                let name = self.cns(name)?;
                self.gen_op(Opcode::InstanceOfBitmask, &[obj_cls, name])?
            } else {
                self.gen_op(Opcode::ExtendsClass, &[obj_cls, constraint])?
            };
            self.if_then(
                |t, taken| {
                    t.gen(Inst::new(Opcode::JmpZero).srcs(&[is_instance]).taken(taken))?;
                    Ok(())
                },
                |t| {
                    let catch = t.catch_trace()?;
                    t.gen(
                        Inst::new(Opcode::VerifyParamFail)
                            .srcs(&[param])
                            .taken(catch),
                    )?;
                    Ok(())
                },
            )
        } else {
            let catch = self.catch_trace()?;
            self.gen(
                Inst::new(Opcode::VerifyParamCls)
                    .srcs(&[obj_cls, constraint, param])
                    .taken(catch),
            )?;
            Ok(())
        }
    }
}
