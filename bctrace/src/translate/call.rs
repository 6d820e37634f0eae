//! Calls: pushing activation records, passing arguments, calling, inlining, and returning.
//!
//! Every `FPush*` opens an FPI (function parameter initialization) region, recorded on the FPI
//! stack as the stack pointer (and its offset) the caller will see once the callee's activation
//! record has been popped. The matching `FCall*` (or an inlined return) closes it.

use super::{state::BcState, Translator};
use crate::{
    bytecode::{CufKind, Offset},
    hir::{
        ActRecInfo, BlockIdx, Const, DefInlineFPData, Extra, Inst, InstIdx, Opcode, Ty,
        ACT_REC_CELLS,
    },
    log::Verbosity,
    unit::{Attrs, ClassId, FuncId, LitstrId, MethodLookup, NamedEntityId},
    TranslationError,
};

impl Translator<'_> {
    /// Write an activation record for a call to `func` with receiver or class `obj_or_cls`.
    fn emit_fpush_act_rec(
        &mut self,
        func: InstIdx,
        obj_or_cls: InstIdx,
        num_args: u32,
        inv_name: Option<&str>,
        ctor: bool,
    ) -> Result<(), TranslationError> {
        // The stack as it will be once the activation record has been popped again.
        let actual = self.spill_stack()?;
        let mut ret_sp = actual;
        if self.cur_func()?.is_generator() {
            // A generator's frame and stack pointers aren't related, so an inlined callee can't
            // recover the stack pointer from the frame pointer.
            let sp = self.sp();
            ret_sp = self.gen_op(Opcode::StashGeneratorSP, &[sp])?;
        }
        self.fpi.push((ret_sp, self.tracker.sp_offset()));
        let fp = self.fp();
        self.gen(
            Inst::new(Opcode::SpillFrame)
                .extra(Extra::ActRec(ActRecInfo {
                    num_args,
                    inv_name: inv_name.map(str::to_owned),
                    ctor,
                }))
                .srcs(&[actual, fp, func, obj_or_cls]),
        )?;
        assert_eq!(self.stack_deficit, 0);
        Ok(())
    }

    /// Have the interpreter push an activation record (above `extra_pushed` further cells). We
    /// still track the FPI region so that the `FCall` balances.
    fn interp_fpush(
        &mut self,
        why: &str,
        popped: u32,
        extra_pushed: u32,
    ) -> Result<(), TranslationError> {
        let act_rec = u32::try_from(ACT_REC_CELLS).unwrap();
        self.punt(why, None, popped, extra_pushed + act_rec)?;
        self.fpi
            .push((self.sp(), self.tracker.sp_offset() - ACT_REC_CELLS));
        Ok(())
    }

    pub(super) fn emit_fpush_func(&mut self, num_params: u32) -> Result<(), TranslationError> {
        // Anything other than a string (e.g. an object with `__invoke`) is left to the
        // interpreter.
        if !self.top_ty(0).is_string() {
            return self.interp_fpush("FPushFunc on a non-string", 1, 0);
        }
        let name = self.pop_c()?;
        self.fpush_func_by_name(num_params, name)
    }

    fn fpush_func_by_name(
        &mut self,
        num_params: u32,
        name: InstIdx,
    ) -> Result<(), TranslationError> {
        let catch = self.catch_trace()?;
        let func = self.gen(Inst::new(Opcode::LdFunc).srcs(&[name]).taken(catch))?;
        let null = self.cns(Const::InitNull)?;
        self.emit_fpush_act_rec(func, null, num_params, None, false)
    }

    pub(super) fn emit_fpush_func_u(&mut self) -> Result<(), TranslationError> {
        self.interp_fpush("FPushFuncU", 0, 0)
    }

    pub(super) fn emit_fpush_func_d(
        &mut self,
        num_params: u32,
        id: NamedEntityId,
    ) -> Result<(), TranslationError> {
        let ne = self.named_entity(id)?;
        let name = self.cns(ne.name.as_str())?;
        let Some(callee) = self.unit.lookup_func(id) else {
            return self.fpush_func_by_name(num_params, name);
        };
        let func = if self.unit.is_name_binding_immutable(callee) {
            self.cns(Const::Func(callee))?
        } else {
            let catch = self.catch_trace()?;
            self.gen(
                Inst::new(Opcode::LdFuncCached)
                    .srcs(&[name])
                    .taken(catch),
            )?
        };
        let null = self.cns(Const::InitNull)?;
        self.emit_fpush_act_rec(func, null, num_params, None, false)
    }

    pub(super) fn emit_fpush_obj_method_d(
        &mut self,
        num_params: u32,
        name: LitstrId,
        base_class: Option<ClassId>,
    ) -> Result<(), TranslationError> {
        if !self.top_ty(0).is_obj() {
            return self.interp_fpush("FPushObjMethodD on a non-object", 1, 0);
        }
        let name = self.litstr(name)?;
        let ctx = self.cur_func()?.cls;
        match self.unit.lookup_obj_method(base_class, name, ctx) {
            MethodLookup::Resolved { func, magic_call } => {
                let obj = self.pop_c()?;
                let obj_or_cls = if self.func(func)?.is_static() {
                    // The activation record holds the class rather than the object.
                    let Some(cls) = base_class else {
                        return Err(TranslationError::General(format!(
                            "static method {name} resolved without a receiver class"
                        )));
                    };
                    self.dec_ref(obj)?;
                    self.cns(Const::Cls(cls))?
                } else {
                    obj
                };
                let f = self.cns(Const::Func(func))?;
                self.emit_fpush_act_rec(f, obj_or_cls, num_params, magic_call.then_some(name), false)
            }
            MethodLookup::Slot { slot, has_this } => {
                let obj = self.pop_c()?;
                let cls = self.gen_op(Opcode::LdObjClass, &[obj])?;
                let slot = self.cns(slot)?;
                let f = self.gen_op(Opcode::LdClsMethod, &[cls, slot])?;
                let obj_or_cls = if has_this {
                    obj
                } else {
                    self.dec_ref(obj)?;
                    cls
                };
                self.emit_fpush_act_rec(f, obj_or_cls, num_params, None, false)
            }
            MethodLookup::NeedsRuntimeLookup => {
                let obj = self.pop_c()?;
                let null = self.cns(Const::Null)?;
                self.emit_fpush_act_rec(null, obj, num_params, None, false)?;
                let act_rec = self.spill_stack()?;
                let cls = self.gen_op(Opcode::LdObjClass, &[obj])?;
                // The lookup may run a destructor, which must see the new activation record.
                self.emit_marker();
                let name = self.cns(name)?;
                self.gen_op(Opcode::LdObjMethod, &[cls, name, act_rec])?;
                Ok(())
            }
        }
    }

    /// The context (`$this` or class) for a call to the method `callee` of `cls` (named
    /// `cls_name`). Returns `None`, having emitted nothing, if we can't tell whether the call is
    /// static.
    fn cls_method_ctx(
        &mut self,
        callee: FuncId,
        cls: Option<ClassId>,
        cls_name: &str,
    ) -> Result<Option<InstIdx>, TranslationError> {
        let cur = self.cur_func()?;
        let might_not_be_static = !self.func(callee)?.is_static()
            && !cur.is_static()
            && cur
                .cls
                .zip(cls)
                .is_some_and(|(ctx, cls)| self.unit.class_of(ctx, cls));
        if !might_not_be_static {
            let name = self.cns(cls_name)?;
            let ctx = self.cns(cur.cls.map_or(Const::Null, Const::Cls))?;
            return Ok(Some(self.gen_op(Opcode::LdCls, &[name, ctx])?));
        }
        if self.tracker.this_available() {
            let fp = self.fp();
            let this = self.gen_op(Opcode::LdThis, &[fp])?;
            return Ok(Some(self.inc_ref(this)?));
        }
        Ok(None)
    }

    pub(super) fn emit_fpush_cls_method_d(
        &mut self,
        num_params: u32,
        name: LitstrId,
        cls: NamedEntityId,
    ) -> Result<(), TranslationError> {
        let meth_name = self.litstr(name)?;
        let ne = self.named_entity(cls)?;
        let base = self.unit.lookup_unique_class(&ne.name);
        let ctx = self.cur_func()?.cls;
        match self.unit.lookup_cls_method(base, meth_name, ctx) {
            MethodLookup::Resolved { func, magic_call } => {
                let Some(obj_or_cls) = self.cls_method_ctx(func, base, &ne.name)? else {
                    return self.interp_fpush("FPushClsMethodD whose call may not be static", 0, 0);
                };
                let f = self.cns(Const::Func(func))?;
                self.emit_fpush_act_rec(
                    f,
                    obj_or_cls,
                    num_params,
                    magic_call.then_some(meth_name),
                    false,
                )
            }
            MethodLookup::Slot { .. } | MethodLookup::NeedsRuntimeLookup => {
                let stack = self.spill_stack()?;
                let exit = self.exit_slow_trace()?;
                let cls_name = self.cns(ne.name.as_str())?;
                let meth = self.cns(meth_name)?;
                let ne_id = self.cns(ne.id.0)?;
                let fp = self.fp();
                let f = self.gen(
                    Inst::new(Opcode::LdClsMethodCache)
                        .srcs(&[cls_name, meth, ne_id, fp, stack])
                        .taken(exit),
                )?;
                let null = self.cns(Const::InitNull)?;
                self.emit_fpush_act_rec(f, null, num_params, None, false)
            }
        }
    }

    /// `FPushClsMethodF` with the class and method name already known: the call forwards the
    /// current late static binding context.
    pub(super) fn emit_fpush_cls_method_f(
        &mut self,
        num_params: u32,
        name: LitstrId,
        cls: ClassId,
    ) -> Result<(), TranslationError> {
        let meth_name = self.litstr(name)?;
        let exit = self.exit_slow_trace()?;
        // The class and method name: we already know what they are.
        self.pop_a()?;
        self.pop_c()?;
        let cur = self.cur_func()?;
        let fp = self.fp();
        let cur_fn = self.cns(Const::Func(cur.id))?;
        let cur_ctx = self.gen_op(Opcode::LdCtx, &[fp, cur_fn])?;
        match self.unit.lookup_cls_method(Some(cls), meth_name, cur.cls) {
            MethodLookup::Resolved { func, magic_call } => {
                let f = self.cns(Const::Func(func))?;
                let ctx = self.gen_op(Opcode::GetCtxFwdCall, &[cur_ctx, f])?;
                self.emit_fpush_act_rec(f, ctx, num_params, magic_call.then_some(meth_name), false)
            }
            MethodLookup::Slot { .. } | MethodLookup::NeedsRuntimeLookup => {
                let c = self.cns(Const::Cls(cls))?;
                let meth = self.cns(meth_name)?;
                let f = self.gen(
                    Inst::new(Opcode::LdClsMethodFCache)
                        .srcs(&[c, meth, cur_ctx, fp])
                        .taken(exit),
                )?;
                let null = self.cns(Const::InitNull)?;
                self.emit_fpush_act_rec(f, null, num_params, None, false)
            }
        }
    }

    fn fpush_ctor_common(
        &mut self,
        cls: InstIdx,
        obj: InstIdx,
        ctor: Option<FuncId>,
        num_params: u32,
        catch: BlockIdx,
    ) -> Result<(), TranslationError> {
        self.push(obj);
        let f = match ctor {
            Some(f) => self.cns(Const::Func(f))?,
            None => self.gen(Inst::new(Opcode::LdClsCtor).srcs(&[cls]).taken(catch))?,
        };
        let obj = self.inc_ref(obj)?;
        self.emit_fpush_act_rec(f, obj, num_params, None, true)
    }

    pub(super) fn emit_fpush_ctor(&mut self, num_params: u32) -> Result<(), TranslationError> {
        let catch = self.catch_trace()?;
        let cls = self.pop_a()?;
        let obj = self.gen_op(Opcode::AllocObj, &[cls])?;
        let obj = self.inc_ref(obj)?;
        self.fpush_ctor_common(cls, obj, None, num_params, catch)
    }

    pub(super) fn emit_fpush_ctor_d(
        &mut self,
        num_params: u32,
        cls_name: LitstrId,
    ) -> Result<(), TranslationError> {
        let cls_name = self.litstr(cls_name)?;
        // Each catch trace captures the stack at its own point.
        let catch1 = self.catch_trace()?;
        let catch2 = self.catch_trace()?;
        let cls = self
            .unit
            .lookup_unique_class(cls_name)
            .map(|c| self.class(c))
            .transpose()?;
        let persistent = cls.is_some_and(|c| c.is_persistent());
        let fast_alloc =
            !self.cfg.obj_destruct_call && persistent && cls.is_some_and(|c| c.can_instantiate());

        let mut ctor = cls.filter(|c| c.is_unique()).and_then(|c| c.ctor);
        if let (Some(f), Some(c)) = (ctor, cls) {
            if !self.func(f)?.attrs.contains(Attrs::PUBLIC) {
                // Only call a non-public constructor directly if we know it's accessible.
                ctor = match self.cur_func()?.cls {
                    None => None,
                    Some(ctx) if ctx == c.id => ctor,
                    Some(ctx) => {
                        let private = self.func(f)?.attrs.contains(Attrs::PRIVATE);
                        let related =
                            self.unit.class_of(ctx, c.id) || self.unit.class_of(c.id, ctx);
                        if private || !related {
                            None
                        } else {
                            ctor
                        }
                    }
                };
            }
        }

        let clss = match cls {
            Some(c) if persistent => self.cns(Const::Cls(c.id))?,
            _ => {
                let name = self.cns(cls_name)?;
                self.gen(
                    Inst::new(Opcode::LdClsCached)
                        .srcs(&[name])
                        .taken(catch1),
                )?
            }
        };
        let alloc = if fast_alloc {
            Opcode::AllocObjFast
        } else {
            Opcode::AllocObj
        };
        let obj = self.gen_op(alloc, &[clss])?;
        let obj = self.inc_ref(obj)?;
        self.fpush_ctor_common(clss, obj, ctor, num_params, catch2)
    }

    pub(super) fn emit_fpush_cuf_iter(
        &mut self,
        num_params: u32,
        iter: u32,
    ) -> Result<(), TranslationError> {
        let sp = self.spill_stack()?;
        self.fpi.push((sp, self.tracker.sp_offset()));
        let fp = self.fp();
        self.gen(
            Inst::new(Opcode::CufIterSpillFrame)
                .extra(Extra::FPushCuf {
                    num_args: num_params,
                    iter_id: iter,
                })
                .srcs(&[sp, fp]),
        )?;
        Ok(())
    }

    /// `FPushCuf` and its variants. For `FPushCufSafe`, a default value sits on top of the
    /// callable and is left on the stack beneath a success flag.
    pub(super) fn emit_fpush_cuf(
        &mut self,
        kind: CufKind,
        num_params: u32,
        callee: Option<FuncId>,
        cls: Option<ClassId>,
        inv_name: Option<LitstrId>,
    ) -> Result<(), TranslationError> {
        let safe = kind == CufKind::Safe;
        let Some(callee) = callee else {
            // Usually an array callable: we can't do better than the interpreter.
            let ty = self.top_ty(usize::from(safe));
            return if safe {
                self.interp_fpush(&format!("FPushCufSafe on {ty}"), 2, 2)
            } else {
                self.interp_fpush(&format!("FPushCuf on {ty}"), 1, 0)
            };
        };
        let callee_f = self.func(callee)?;
        let mut func = self.cns(Const::Func(callee))?;
        let ctx = match cls {
            Some(cls) => {
                let c = self.class(cls)?;
                let ctx = if kind == CufKind::Forward {
                    let fp = self.fp();
                    let cur_fn = self.cns(Const::Func(self.bc.func))?;
                    let ctx = self.gen_op(Opcode::LdCtx, &[fp, cur_fn])?;
                    self.gen_op(Opcode::GetCtxFwdCall, &[ctx, func])?
                } else {
                    let Some(ctx) = self.cls_method_ctx(callee, Some(cls), &c.name)? else {
                        let popped = if safe { 2 } else { 1 };
                        let extra = if safe { 2 } else { 0 };
                        return self.interp_fpush(
                            "FPushCuf whose call may not be static",
                            popped,
                            extra,
                        );
                    };
                    ctx
                };
                if !c.is_persistent() {
                    // The miss path is rare: leave it to the interpreter.
                    let exit = self.exit_slow_trace()?;
                    let name = self.cns(c.name.as_str())?;
                    self.gen(
                        Inst::new(Opcode::LdClsCachedSafe)
                            .srcs(&[name])
                            .taken(exit),
                    )?;
                }
                ctx
            }
            None => {
                if !callee_f.attrs.contains(Attrs::PERSISTENT) {
                    let exit = self.exit_slow_trace()?;
                    let name = self.cns(callee_f.name.as_str())?;
                    func = self.gen(
                        Inst::new(Opcode::LdFuncCachedSafe)
                            .srcs(&[name])
                            .taken(exit),
                    )?;
                }
                self.cns(Const::InitNull)?
            }
        };

        let default = if safe { Some(self.pop_c()?) } else { None };
        self.pop_dec_ref(Ty::CELL)?;
        if let Some(default) = default {
            self.push(default);
            let ok = self.cns(true)?;
            self.push(ok);
        }
        let inv_name = inv_name.map(|x| self.litstr(x)).transpose()?;
        self.emit_fpush_act_rec(func, ctx, num_params, inv_name, false)
    }

    pub(super) fn emit_fpass_v(&mut self) -> Result<(), TranslationError> {
        let exit = self.exit_trace(None)?;
        let bx = self.pop_v()?;
        let v = self.gen(Inst::new(Opcode::Unbox).srcs(&[bx]).taken(exit))?;
        self.push_inc_ref(v)?;
        self.dec_ref(bx)
    }

    pub(super) fn emit_fcall(
        &mut self,
        num_params: u32,
        callee: Option<FuncId>,
    ) -> Result<(), TranslationError> {
        let mut args = (0..num_params)
            .map(|_| self.pop_f())
            .collect::<Result<Vec<_>, _>>()?;
        args.reverse();
        let sp = self.spill_stack()?;
        let ret_bc_off = self.cns(self.next_bc_off())?;
        let callee = match callee {
            Some(f) => self.cns(Const::Func(f))?,
            None => self.cns(Const::Null)?,
        };
        let mut srcs = vec![sp, ret_bc_off, callee];
        srcs.extend(args);
        self.gen(Inst::new(Opcode::Call).srcs(&srcs))?;
        self.fpi.pop();
        Ok(())
    }

    pub(super) fn emit_fcall_array(&mut self) -> Result<(), TranslationError> {
        let sp = self.spill_stack()?;
        let (pc, after) = (self.bc.bc_off, self.next_bc_off());
        self.gen(
            Inst::new(Opcode::CallArray)
                .extra(Extra::CallArray { pc, after })
                .srcs(&[sp]),
        )?;
        self.fpi.pop();
        Ok(())
    }

    pub(super) fn emit_fcall_builtin(
        &mut self,
        num_args: u32,
        num_non_default: u32,
        id: NamedEntityId,
    ) -> Result<(), TranslationError> {
        let Some(callee) = self.unit.lookup_func(id) else {
            let name = &self.named_entity(id)?.name;
            return self.punt(&format!("unknown builtin {name}"), Some(Ty::CELL), num_args, 0);
        };
        let f = self.func(callee)?;
        let n = usize::try_from(num_args).unwrap();
        if f.params.len() < n {
            return Err(TranslationError::General(format!(
                "builtin {} called with {n} arguments but has {} parameters",
                f.name,
                f.params.len()
            )));
        }
        if num_non_default > num_args {
            return Err(TranslationError::General(format!(
                "builtin {} called with {num_non_default} non-default arguments out of {num_args}",
                f.name
            )));
        }

        // Arguments are passed by address, and casting them may throw, so they must be in memory.
        let sp = self.spill_stack()?;
        for (i, p) in f.params[..usize::try_from(num_non_default).unwrap()]
            .iter()
            .enumerate()
        {
            let Some(t) = p
                .builtin_type
                .filter(|t| t.subtype_of_any(&[Ty::BOOL, Ty::INT, Ty::ARR, Ty::OBJ, Ty::STR]))
            else {
                continue;
            };
            self.gen(
                Inst::new(Opcode::CastStk)
                    .tp(t)
                    .extra(Extra::StackOffset(i32::try_from(n - i - 1).unwrap()))
                    .srcs(&[sp]),
            )?;
        }

        let mut args = vec![self.cns(Const::Func(callee))?, sp];
        for (i, p) in f.params[..n].iter().enumerate() {
            let off = Extra::StackOffset(i32::try_from(n - i - 1).unwrap());
            let arg = match p.builtin_type {
                // Scalars are passed by value.
                Some(t) if t.subtype_of_any(&[Ty::BOOL, Ty::INT]) => {
                    self.gen(Inst::new(Opcode::LdStack).tp(t).extra(off).srcs(&[sp]))?
                }
                _ => self.gen(Inst::new(Opcode::LdStackAddr).extra(off).srcs(&[sp]))?,
            };
            args.push(arg);
        }
        let mut ret_ty = f.return_type.unwrap_or(Ty::INIT_NULL);
        if f.attrs.contains(Attrs::REFERENCE) {
            ret_ty = ret_ty.box_();
        }
        let ret = self.gen(Inst::new(Opcode::CallBuiltin).tp(ret_ty).srcs(&args))?;

        for i in 0..num_args {
            let arg = self.pop_r()?;
            if i >= num_args - num_non_default {
                self.dec_ref(arg)?;
            }
        }
        self.push(ret);
        Ok(())
    }

    pub(super) fn emit_native_impl(&mut self) -> Result<(), TranslationError> {
        let fp = self.fp();
        let f = self.cns(Const::Func(self.bc.func))?;
        self.gen_op(Opcode::NativeImpl, &[f, fp])?;
        self.emit_ret_ctrl()
    }

    /// Pop the activation record and return to the caller.
    fn emit_ret_ctrl(&mut self) -> Result<(), TranslationError> {
        let fp = self.fp();
        let sp = self.gen_op(Opcode::RetAdjustStack, &[fp])?;
        self.emit_ret_tail(sp)
    }

    pub(super) fn emit_ret_tail(&mut self, sp: InstIdx) -> Result<(), TranslationError> {
        let fp = self.fp();
        let ret_addr = self.gen_op(Opcode::LdRetAddr, &[fp])?;
        let fp = self.gen_op(Opcode::FreeActRec, &[fp])?;
        self.gen_op(Opcode::RetCtrl, &[sp, fp, ret_addr])?;
        self.has_exit = true;
        Ok(())
    }

    pub(super) fn emit_create_cl(
        &mut self,
        num_params: u32,
        name: LitstrId,
    ) -> Result<(), TranslationError> {
        let name = self.litstr(name)?;
        // Closure classes are unique and defined before they can be instantiated.
        let Some(cls) = self.unit.lookup_unique_class(name) else {
            return Err(TranslationError::General(format!(
                "closure class {name} is not defined"
            )));
        };
        let sp = self.spill_stack()?;
        let cls = self.cns(Const::Cls(cls))?;
        let n = self.cns(num_params)?;
        let fp = self.fp();
        let closure = self.gen_op(Opcode::CreateCl, &[cls, n, fp, sp])?;
        self.discard(num_params)?;
        self.push(closure);
        Ok(())
    }

    // Inlining.

    /// Start translating the body of `target` inline, in place of the `FCall` at the current
    /// bytecode, which passes `num_params` arguments and returns to `ret_bc_off`. The `FPush*`
    /// of the call must have been translated in this session.
    ///
    /// # Panics
    ///
    /// If no call is being prepared, or if `target` is a generator.
    pub fn begin_inlining(
        &mut self,
        num_params: u32,
        target: FuncId,
        ret_bc_off: Offset,
    ) -> Result<(), TranslationError> {
        let Some(&(prev_sp, prev_sp_off)) = self.fpi.last() else {
            panic!("can't inline a call whose FPush* is in another tracelet");
        };
        let f = self.func(target)?;
        assert!(!f.is_generator(), "can't inline generator {}", f.name);
        self.log(Verbosity::Inlining, &format!("begin inlining: {}", f.name));

        let mut params = (0..num_params)
            .map(|_| self.pop_f())
            .collect::<Result<Vec<_>, _>>()?;
        params.reverse();
        let callee_sp = self.spill_stack()?;
        let callee_fp = self.gen(
            Inst::new(Opcode::DefInlineFP)
                .extra(Extra::InlineFrame(DefInlineFPData {
                    target,
                    ret_bc_off,
                    ret_sp_off: prev_sp_off,
                    num_locals: f.num_locals,
                    has_this: f.may_have_this(),
                }))
                .srcs(&[callee_sp, prev_sp]),
        )?;
        let caller = std::mem::replace(
            &mut self.bc,
            BcState {
                bc_off: f.base,
                func: target,
            },
        );
        self.callers.push(caller);
        let sp = self.sp();
        self.gen(
            Inst::new(Opcode::ReDefSP)
                .extra(Extra::StackOffset(i32::try_from(f.num_locals).unwrap()))
                .srcs(&[callee_fp, sp]),
        )?;
        self.profile_function_entry("Inline")?;

        for (i, p) in (0..).zip(params) {
            self.gen(
                Inst::new(Opcode::StLoc)
                    .extra(Extra::LocalId(i))
                    .srcs(&[callee_fp, p]),
            )?;
        }
        // The remaining locals must be initialized in case we leave the trace.
        let uninit = self.cns(Const::Uninit)?;
        for i in num_params..f.num_locals {
            self.gen(
                Inst::new(Opcode::StLoc)
                    .extra(Extra::LocalId(i))
                    .srcs(&[callee_fp, uninit]),
            )?;
        }
        self.emit_marker();
        Ok(())
    }

    fn profile_function_entry(&mut self, category: &str) -> Result<(), TranslationError> {
        if !(self.cfg.stats && self.cfg.stats_func_entry) {
            return Ok(());
        }
        let group = self.cns("FunctionEntry")?;
        let cat = self.cns(category)?;
        let one = self.cns(1)?;
        self.gen_op(Opcode::IncStatGrouped, &[group, cat, one])?;
        Ok(())
    }

    fn emit_ret_from_inlined(&mut self, ty: Ty) -> Result<(), TranslationError> {
        let ret = self.pop(ty)?;
        let f = self.cur_func()?;
        assert!(!f.may_use_vv() && !f.is_pseudomain());
        assert!(!self.fpi.is_empty());

        self.emit_dec_ref_locals_inline(ret)?;
        let fp = self.fp();
        self.gen_op(Opcode::InlineReturn, &[fp])?;

        let Some(caller) = self.callers.pop() else {
            panic!("inlined return without a caller");
        };
        self.bc = caller;
        self.fpi.pop();
        let off = Extra::StackOffset(self.tracker.sp_offset());
        let sp = self.sp();
        if self.cur_func()?.is_generator() {
            self.gen(Inst::new(Opcode::ReDefGeneratorSP).extra(off).srcs(&[sp]))?;
        } else {
            let fp = self.fp();
            self.gen(Inst::new(Opcode::ReDefSP).extra(off).srcs(&[fp, sp]))?;
        }
        // The caller's stack was spilled when inlining began.
        assert_eq!(self.num_cells(), 0);
        self.stack_deficit = 0;

        self.log(
            Verbosity::Inlining,
            &format!("end inlining: {}", self.cur_func()?.name),
        );
        self.push(ret);
        self.emit_marker();
        Ok(())
    }

    /// Release the current frame's locals (and `$this`) before returning `ret`. If `ret` is an
    /// `IncRef` of a local (or of `$this`), the `IncRef` is cancelled out by releasing `ret` in
    /// place of that local, and the value to return is the local's own value.
    fn emit_dec_ref_locals_inline(&mut self, ret: InstIdx) -> Result<InstIdx, TranslationError> {
        let ret_inst = self.m.inst(ret);
        let src = match ret_inst.opcode() {
            Opcode::IncRef => {
                let s = ret_inst.src(0);
                match self.m.inst(s).opcode() {
                    op @ (Opcode::LdLoc | Opcode::LdThis) => Some((s, op)),
                    _ => None,
                }
            }
            _ => None,
        };
        let f = self.cur_func()?;
        let fp = self.fp();
        if f.may_have_this() {
            if matches!(src, Some((_, Opcode::LdThis))) {
                self.dec_ref(ret)?;
            } else {
                self.gen_op(Opcode::DecRefThis, &[fp])?;
            }
        }
        // Not while inlining: reordering the releases defeats eliminating them.
        let ret_loc = match src {
            Some((s, Opcode::LdLoc)) if !self.is_inlining() => self.m.inst(s).local_id(),
            _ => None,
        };
        for id in (0..f.num_locals).rev() {
            if ret_loc == Some(id) {
                self.dec_ref(ret)?;
                continue;
            }
            self.gen(
                Inst::new(Opcode::DecRefLoc)
                    .tp(Ty::GEN)
                    .extra(Extra::LocalId(id))
                    .srcs(&[fp]),
            )?;
        }
        Ok(src.map_or(ret, |(s, _)| s))
    }

    /// `RetC` / `RetV`, returning a value of type `ty`. With `free_inline` the locals are
    /// released inline rather than by a generic helper.
    pub(super) fn emit_ret(&mut self, ty: Ty, free_inline: bool) -> Result<(), TranslationError> {
        if self.is_inlining() {
            return self.emit_ret_from_inlined(ty);
        }
        let f = self.cur_func()?;
        let exit = self.exit_slow_trace()?;
        self.gen(Inst::new(Opcode::ExitWhenSurprised).taken(exit))?;
        if f.may_use_vv() {
            // Once locals start being released there's no bytecode boundary to exit to, so this
            // must come first.
            let exit = self.exit_slow_trace()?;
            let fp = self.fp();
            self.gen(
                Inst::new(Opcode::ReleaseVVOrExit)
                    .srcs(&[fp])
                    .taken(exit),
            )?;
        }
        let ret = self.pop(ty)?;
        let fp = self.fp();
        let sp = if free_inline {
            let use_ret = self.emit_dec_ref_locals_inline(ret)?;
            self.gen_op(Opcode::StRetVal, &[fp, use_ret])?;
            self.gen_op(Opcode::RetAdjustStack, &[fp])?
        } else {
            if f.may_have_this() {
                self.gen_op(Opcode::DecRefThis, &[fp])?;
            }
            let n = self.cns(f.num_locals)?;
            let sp = self.gen_op(Opcode::GenericRetDecRefs, &[fp, n])?;
            self.gen_op(Opcode::StRetVal, &[fp, ret])?;
            sp
        };
        self.emit_ret_tail(sp)
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        bytecode::Op,
        hir::{Opcode, TraceIdx, Ty},
        testing::{assert_hir_matches, feed, TestUnit},
        unit::{Attrs, Func, ParamInfo},
        TranslationError,
    };

    fn callee(u: &mut TestUnit, num_locals: u32) -> crate::unit::FuncId {
        u.add_func(Func {
            name: "f".to_owned(),
            base: 100,
            past: 200,
            num_locals,
            ..Default::default()
        })
    }

    #[test]
    fn inlining_balances() {
        let mut u = TestUnit::new();
        let f = callee(&mut u, 1);
        let ne = u.named_entity("f");
        u.bind_func(ne, f, true);
        let mut t = u.translator();
        t.set_bc_off(0, false);
        t.translate(&Op::FPushFuncD {
            num_params: 0,
            func: ne,
        })
        .unwrap();
        assert_eq!(t.fpi_depth(), 1);
        t.set_bc_off(1, false);
        t.begin_inlining(0, f, 2).unwrap();
        assert_eq!(t.inline_depth(), 1);
        feed(&mut t, 100, &[Op::Int(5), Op::RetC { free_inline: false }]);
        assert_eq!(t.inline_depth(), 0);
        assert_eq!(t.fpi_depth(), 0);
        assert_eq!(t.eval_stack_len(), 1);
        assert_eq!(t.tracker.sp_offset(), 4);
        t.set_bc_off(2, true);
        t.translate(&Op::Print).unwrap();
        t.end().unwrap();
        assert_hir_matches(
            t.module(),
            "
            ...
                %{{sp1}}: StkPtr = SpillStack %{{sp0}}, 0
                %{{sp2}}: StkPtr = SpillFrame [args 0] %{{sp1}}, %{{fp}}, func#1, InitNull
                ...
                %{{sp3}}: StkPtr = SpillStack %{{sp2}}, 0
                %{{fp2}}: FramePtr = DefInlineFP [func#1 retbc 2 retsp 4] %{{sp3}}, %{{sp1}}
                %{{_}}: StkPtr = ReDefSP [off 1] %{{fp2}}, %{{sp3}}
                StLoc [loc 0] %{{fp2}}, Uninit
                ...
                DecRefLoc<Gen> [loc 0] %{{fp2}}
                InlineReturn %{{fp2}}
                %{{_}}: StkPtr = ReDefSP [off 4] %{{fp}}, %{{sp1}}
                ...
                PrintInt 5
                ...
                ReqBindJmp [bc 3]
                ...
            ",
        );
        t.finish().unwrap();
    }

    #[test]
    fn inline_return_of_local_is_folded() {
        let u = TestUnit::new();
        let mut t = u.translator();
        t.guard_type_local(0, Ty::OBJ).unwrap();
        feed(
            &mut t,
            0,
            &[Op::CGetL(0), Op::RetC { free_inline: true }],
        );
        assert!(t.has_exit());
        assert_hir_matches(
            t.module(),
            "
            ...
                %{{v}}: Obj = LdLoc<Obj> [loc 0] %{{fp}}
                %{{r}}: Obj = IncRef %{{v}}
                ...
                ExitWhenSurprised -> bb{{_}}
                DecRefLoc<Gen> [loc 3] %{{fp}}
                DecRefLoc<Gen> [loc 2] %{{fp}}
                DecRefLoc<Gen> [loc 1] %{{fp}}
                DecRef %{{r}}
                StRetVal %{{fp}}, %{{v}}
                %{{sp}}: StkPtr = RetAdjustStack %{{fp}}
                %{{ra}}: RetAddr = LdRetAddr %{{fp}}
                %{{fp2}}: FramePtr = FreeActRec %{{fp}}
                RetCtrl %{{sp}}, %{{fp2}}, %{{ra}}
                ...
            ",
        );
        t.finish().unwrap();
    }

    #[test]
    fn generic_return() {
        let mut u = TestUnit::new();
        u.main_mut().attrs = Attrs::MAY_USE_VV;
        let mut t = u.translator();
        feed(&mut t, 0, &[Op::Null, Op::RetC { free_inline: false }]);
        assert_hir_matches(
            t.module(),
            "
            ...
                ExitWhenSurprised -> bb1
                ReleaseVVOrExit %{{fp}} -> bb2
                %{{sp}}: StkPtr = GenericRetDecRefs %{{fp}}, 4
                StRetVal %{{fp}}, {{_}}
                ...
            ",
        );
    }

    #[test]
    fn call_passes_arguments_as_sources() {
        let mut u = TestUnit::new();
        let f = callee(&mut u, 1);
        let ne = u.named_entity("f");
        u.bind_func(ne, f, false);
        let mut t = u.translator();
        feed(
            &mut t,
            0,
            &[
                Op::FPushFuncD {
                    num_params: 1,
                    func: ne,
                },
                Op::Int(7),
                Op::FPassC,
                Op::FCall {
                    num_params: 1,
                    callee: Some(f),
                },
            ],
        );
        assert_eq!(t.fpi_depth(), 0);
        // The activation record is replaced by the return value.
        assert_eq!(t.tracker.sp_offset(), 5);
        assert_hir_matches(
            t.module(),
            "
            ...
                %{{f}}: Func = LdFuncCached \"f\" -> bb1
                %{{sp1}}: StkPtr = SpillStack %{{sp0}}, 0
                %{{sp2}}: StkPtr = SpillFrame [args 1] %{{sp1}}, %{{fp}}, %{{f}}, InitNull
                ...
                %{{sp3}}: StkPtr = SpillStack %{{sp2}}, 0
                %{{_}}: StkPtr = Call %{{sp3}}, 4, func#1, 7
                ...
            ",
        );
    }

    #[test]
    fn interpreted_fpush_still_balances() {
        let u = TestUnit::new();
        let mut t = u.translator();
        feed(
            &mut t,
            0,
            &[
                Op::FPushFunc { num_params: 0 },
                Op::FCall {
                    num_params: 0,
                    callee: None,
                },
            ],
        );
        assert_eq!(t.fpi_depth(), 0);
        assert!(t
            .module()
            .trace_insts(TraceIdx::MAIN)
            .any(|i| t.module().inst(i).opcode() == Opcode::InterpOne));
    }

    #[test]
    fn builtin_with_too_many_non_default_args_is_rejected() {
        let mut u = TestUnit::new();
        let f = u.add_func(Func {
            name: "strlen".to_owned(),
            params: vec![ParamInfo::default()],
            ..Default::default()
        });
        let ne = u.named_entity("strlen");
        u.bind_func(ne, f, true);
        let mut t = u.translator();
        t.set_bc_off(0, false);
        t.translate(&Op::Null).unwrap();
        let r = t.translate(&Op::FCallBuiltin {
            num_args: 1,
            num_non_default: 2,
            func: ne,
        });
        assert!(matches!(r, Err(TranslationError::General(_))));
        assert_eq!(t.eval_stack_len(), 1);
    }
}
