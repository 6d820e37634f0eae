//! Generators ("continuations").
//!
//! A generator object owns the activation record of its body. Inside the body, local 0 holds the
//! generator object; inside the generator's own methods (`next`, `send`...) it is `$this`.

use super::Translator;
use crate::{
    hir::{Const, Extra, Field, Inst, InstIdx, Opcode, Ty},
    unit::Func,
    TranslationError,
};

/// The size of a stack cell in bytes.
const CELL_SIZE: i64 = 16;

/// For each local of `orig`, the id of the local of the same name in `body`. `None` if some local
/// of `orig` is unnamed or has no counterpart.
fn map_cont_params(orig: &Func, body: &Func) -> Option<Vec<u32>> {
    (0..orig.num_locals)
        .map(|i| {
            let name = orig.local_names.get(usize::try_from(i).ok()?)?;
            body.lookup_var_id(name)
        })
        .collect()
}

impl Translator<'_> {
    fn field(&mut self, f: Field) -> Result<InstIdx, TranslationError> {
        self.cns(Const::Field(f))
    }

    /// The generator object of the generator body being translated.
    fn ld_cont_local(&mut self) -> Result<InstIdx, TranslationError> {
        let fp = self.fp();
        self.gen(
            Inst::new(Opcode::AssertLoc)
                .tp(Ty::OBJ)
                .extra(Extra::LocalId(0))
                .srcs(&[fp]),
        )?;
        self.ld_loc(0)
    }

    /// The generator object whose method is being translated.
    fn ld_cont_this(&mut self) -> Result<InstIdx, TranslationError> {
        let fp = self.fp();
        self.gen_op(Opcode::LdThis, &[fp])
    }

    /// Replace the generator's current value with `new_val`.
    fn set_cont_value(&mut self, cont: InstIdx, new_val: InstIdx) -> Result<(), TranslationError> {
        let off = self.field(Field::ContValue)?;
        let old = self.gen(Inst::new(Opcode::LdProp).tp(Ty::CELL).srcs(&[cont, off]))?;
        self.gen_op(Opcode::StProp, &[cont, off, new_val])?;
        self.dec_ref(old)
    }

    /// In debug builds of the IR, check that nothing has been sent to the generator yet.
    fn assert_nothing_received(&mut self, cont: InstIdx) -> Result<(), TranslationError> {
        if !self.cfg.generate_asserts {
            return Ok(());
        }
        let off = self.field(Field::ContReceived)?;
        let old = self.gen(Inst::new(Opcode::LdProp).tp(Ty::CELL).srcs(&[cont, off]))?;
        self.gen(
            Inst::new(Opcode::DbgAssertType)
                .tp(Ty::INIT_NULL)
                .srcs(&[old]),
        )?;
        Ok(())
    }

    pub(super) fn emit_create_cont(&mut self, body_name: &str) -> Result<(), TranslationError> {
        let fp = self.fp();
        let slow = self.exit_slow_trace()?;
        self.gen(Inst::new(Opcode::ExitOnVarEnv).srcs(&[fp]).taken(slow))?;

        let orig = self.cur_func()?;
        let body_id = self.unit.lookup_func_by_name(body_name).ok_or_else(|| {
            TranslationError::General(format!("unknown generator body {body_name}"))
        })?;
        let body = self.func(body_id)?;
        let orig_fn = self.cns(Const::Func(orig.id))?;
        let body_fn = self.cns(Const::Func(body.id))?;
        let cont = if orig.is_method() {
            let ctx = self.gen_op(Opcode::LdCtx, &[fp, orig_fn])?;
            self.gen_op(Opcode::CreateContMeth, &[orig_fn, body_fn, ctx])?
        } else {
            self.gen_op(Opcode::CreateContFunc, &[orig_fn, body_fn])?
        };

        let params = if orig.num_locals <= self.cfg.max_inline_cont_locals {
            map_cont_params(orig, body)
        } else {
            None
        };
        match params {
            Some(params) => {
                let this_id = if orig.may_have_this() && orig.lookup_var_id("this").is_none() {
                    body.lookup_var_id("this")
                } else {
                    None
                };
                let ar = self.field(Field::ContArPtr)?;
                let cont_ar = self.gen(
                    Inst::new(Opcode::LdRaw)
                        .tp(Ty::PTR_TO_GEN)
                        .srcs(&[cont, ar]),
                )?;
                for (i, to) in (0..).zip(params) {
                    // Nothing guards the outer function's locals, so all we know is that they
                    // hold something.
                    self.gen(
                        Inst::new(Opcode::AssertLoc)
                            .tp(Ty::GEN)
                            .extra(Extra::LocalId(i))
                            .srcs(&[fp]),
                    )?;
                    let v = self.ld_loc(i)?;
                    let v = self.inc_ref(v)?;
                    let off = self.cns(-CELL_SIZE * (i64::from(to) + 1))?;
                    self.gen_op(Opcode::StMem, &[cont_ar, off, v])?;
                }
                if let Some(this_id) = this_id {
                    let this = self.gen_op(Opcode::LdThis, &[fp])?;
                    let this = self.inc_ref(this)?;
                    let off = self.cns(-CELL_SIZE * (i64::from(this_id) + 1))?;
                    self.gen_op(Opcode::StMem, &[cont_ar, off, this])?;
                }
            }
            None => {
                self.gen_op(Opcode::FillContLocals, &[fp, orig_fn, body_fn, cont])?;
            }
        }
        self.push(cont);
        Ok(())
    }

    /// Transfer control into the generator body. Only found in generator methods, whose stacks
    /// are empty at this point.
    pub(super) fn emit_cont_enter(&mut self) -> Result<(), TranslationError> {
        debug_assert!(self.eval_stack.is_empty() && self.stack_deficit == 0);
        let cont = self.ld_cont_this()?;
        let ar = self.field(Field::ContArPtr)?;
        let cont_ar = self.gen(
            Inst::new(Opcode::LdRaw)
                .tp(Ty::FRAME_PTR)
                .srcs(&[cont, ar]),
        )?;
        let zero = self.cns(0)?;
        let func = self.gen_op(Opcode::LdARFuncPtr, &[cont_ar, zero])?;
        let entry = self.field(Field::ContEntry)?;
        let body = self.gen(Inst::new(Opcode::LdRaw).tp(Ty::TCA).srcs(&[func, entry]))?;
        let ret_off = self.cns(self.next_bc_off() - self.cur_func()?.base)?;
        let fp = self.fp();
        self.gen_op(Opcode::ContEnter, &[cont_ar, body, ret_off, fp])?;
        Ok(())
    }

    fn cont_exit_impl(&mut self) -> Result<(), TranslationError> {
        let sp = if self.stack_deficit != 0 || !self.eval_stack.is_empty() {
            self.spill_stack()?
        } else {
            self.sp()
        };
        self.emit_ret_tail(sp)
    }

    pub(super) fn emit_cont_exit(&mut self) -> Result<(), TranslationError> {
        let slow = self.exit_slow_trace()?;
        self.gen(Inst::new(Opcode::ExitWhenSurprised).taken(slow))?;
        self.cont_exit_impl()
    }

    /// Push the value sent into the generator, then the label to resume at.
    pub(super) fn emit_unpack_cont(&mut self) -> Result<(), TranslationError> {
        let fp = self.fp();
        self.gen_op(Opcode::LinkContVarEnv, &[fp])?;
        let cont = self.ld_cont_local()?;
        let off = self.field(Field::ContReceived)?;
        let received = self.gen(Inst::new(Opcode::LdProp).tp(Ty::CELL).srcs(&[cont, off]))?;
        self.push(received);
        let null = self.cns(Const::InitNull)?;
        self.gen_op(Opcode::StProp, &[cont, off, null])?;
        let label = self.field(Field::ContLabel)?;
        let label = self.gen(Inst::new(Opcode::LdRaw).tp(Ty::INT).srcs(&[cont, label]))?;
        self.push(label);
        Ok(())
    }

    pub(super) fn emit_pack_cont(&mut self, label: i64) -> Result<(), TranslationError> {
        let fp = self.fp();
        self.gen_op(Opcode::UnlinkContVarEnv, &[fp])?;
        let cont = self.ld_cont_local()?;
        let new_val = self.pop_c()?;
        self.set_cont_value(cont, new_val)?;
        let slot = self.field(Field::ContLabel)?;
        let label = self.cns(label)?;
        self.gen_op(Opcode::StRaw, &[cont, slot, label])?;
        Ok(())
    }

    pub(super) fn emit_cont_ret_c(&mut self) -> Result<(), TranslationError> {
        let cont = self.ld_cont_local()?;
        let slow = self.exit_slow_trace()?;
        self.gen(Inst::new(Opcode::ExitWhenSurprised).taken(slow))?;
        let done = self.field(Field::ContDone)?;
        let t = self.cns(true)?;
        self.gen_op(Opcode::StRaw, &[cont, done, t])?;
        let new_val = self.pop_c()?;
        self.set_cont_value(cont, new_val)?;
        self.cont_exit_impl()
    }

    pub(super) fn emit_cont_next(&mut self) -> Result<(), TranslationError> {
        let cont = self.ld_cont_this()?;
        let slow = self.exit_slow_trace()?;
        self.gen(Inst::new(Opcode::ContPreNext).srcs(&[cont]).taken(slow))?;
        self.assert_nothing_received(cont)
    }

    /// `ContSend` / `ContRaise`: store local 0 (the argument of `send` / `raise`) as the
    /// received value. Raising resumes one label earlier, where the body rethrows.
    pub(super) fn emit_cont_send(&mut self, raise: bool) -> Result<(), TranslationError> {
        let cont = self.ld_cont_this()?;
        let slow = self.exit_slow_trace()?;
        self.gen(Inst::new(Opcode::ContStartedCheck).srcs(&[cont]).taken(slow))?;
        let slow = self.exit_slow_trace()?;
        self.gen(Inst::new(Opcode::ContPreNext).srcs(&[cont]).taken(slow))?;
        let fp = self.fp();
        self.gen(
            Inst::new(Opcode::AssertLoc)
                .tp(Ty::CELL)
                .extra(Extra::LocalId(0))
                .srcs(&[fp]),
        )?;
        let v = self.ld_loc(0)?;
        let new_val = self.inc_ref(v)?;
        self.assert_nothing_received(cont)?;
        let off = self.field(Field::ContReceived)?;
        self.gen_op(Opcode::StProp, &[cont, off, new_val])?;
        if raise {
            let slot = self.field(Field::ContLabel)?;
            let label = self.gen(Inst::new(Opcode::LdRaw).tp(Ty::INT).srcs(&[cont, slot]))?;
            let one = self.cns(1)?;
            let label = self.gen_op(Opcode::OpSub, &[label, one])?;
            self.gen_op(Opcode::StRaw, &[cont, slot, label])?;
        }
        Ok(())
    }

    pub(super) fn emit_cont_valid(&mut self) -> Result<(), TranslationError> {
        let cont = self.ld_cont_this()?;
        let slot = self.field(Field::ContDone)?;
        let done = self.gen(Inst::new(Opcode::LdRaw).tp(Ty::BOOL).srcs(&[cont, slot]))?;
        let r = self.gen_op(Opcode::OpNot, &[done])?;
        self.push(r);
        Ok(())
    }

    pub(super) fn emit_cont_current(&mut self) -> Result<(), TranslationError> {
        let cont = self.ld_cont_this()?;
        let slow = self.exit_slow_trace()?;
        self.gen(Inst::new(Opcode::ContStartedCheck).srcs(&[cont]).taken(slow))?;
        let off = self.field(Field::ContValue)?;
        let v = self.gen(Inst::new(Opcode::LdProp).tp(Ty::CELL).srcs(&[cont, off]))?;
        self.push_inc_ref(v)?;
        Ok(())
    }

    pub(super) fn emit_cont_stopped(&mut self) -> Result<(), TranslationError> {
        let cont = self.ld_cont_this()?;
        let slot = self.field(Field::ContRunning)?;
        let f = self.cns(false)?;
        self.gen_op(Opcode::StRaw, &[cont, slot, f])?;
        Ok(())
    }

    pub(super) fn emit_cont_handle(&mut self) -> Result<(), TranslationError> {
        self.interp_one_cf(1)
    }
}

#[cfg(test)]
mod tests {
    use super::map_cont_params;
    use crate::{
        bytecode::Op,
        config::TranslatorConfig,
        hir::{Opcode, TraceIdx, Ty},
        testing::{assert_hir_matches, feed, TestUnit},
        unit::{Attrs, Func},
    };

    fn body(names: &[&str]) -> Func {
        Func {
            name: "main$gen".to_owned(),
            num_locals: u32::try_from(names.len()).unwrap(),
            local_names: names.iter().map(|x| x.to_string()).collect(),
            attrs: Attrs::GENERATOR,
            ..Default::default()
        }
    }

    #[test]
    fn params_map_by_name() {
        let u = TestUnit::new();
        let orig = crate::unit::Unit::func(&u, crate::unit::FuncId(0)).unwrap();
        assert_eq!(
            map_cont_params(orig, &body(&["cont", "d", "c", "b", "a"])),
            Some(vec![4, 3, 2, 1])
        );
        assert_eq!(map_cont_params(orig, &body(&["cont", "a", "b"])), None);
    }

    #[test]
    fn create_cont_copies_locals() {
        let mut u = TestUnit::new();
        u.add_func(body(&["cont", "a", "b", "c", "d"]));
        let name = u.litstr("main$gen");
        let mut t = u.translator();
        feed(&mut t, 0, &[Op::CreateCont(name)]);
        assert_hir_matches(
            t.module(),
            "
            ...
                ExitOnVarEnv %{{fp}} -> bb{{_}}
                %{{c}}: Obj = CreateContFunc func#0, func#1
                %{{ar}}: PtrToGen = LdRaw<PtrToGen> %{{c}}, #ContArPtr
                AssertLoc<Gen> [loc 0] %{{fp}}
                %{{a}}: Gen = LdLoc<Gen> [loc 0] %{{fp}}
                %{{a2}}: Gen = IncRef %{{a}}
                StMem %{{ar}}, -32, %{{a2}}
                ...
            ",
        );
        assert_eq!(t.module().ty(t.eval_stack_at(0)), Ty::OBJ);
    }

    #[test]
    fn create_cont_with_many_locals_fills_at_runtime() {
        let mut u = TestUnit::new();
        u.add_func(body(&["cont", "a", "b", "c", "d"]));
        let name = u.litstr("main$gen");
        let cfg = TranslatorConfig {
            max_inline_cont_locals: 2,
            ..Default::default()
        };
        let mut t = u.translator_with(cfg);
        feed(&mut t, 0, &[Op::CreateCont(name)]);
        assert!(t
            .module()
            .trace_insts(TraceIdx::MAIN)
            .any(|i| t.module().inst(i).opcode() == Opcode::FillContLocals));
    }

    #[test]
    fn unpack_and_pack() {
        let u = TestUnit::new();
        let mut t = u.translator();
        feed(&mut t, 0, &[Op::UnpackCont, Op::PopC, Op::PackCont(3)]);
        assert_hir_matches(
            t.module(),
            "
            ...
                LinkContVarEnv %{{fp}}
                AssertLoc<Obj> [loc 0] %{{fp}}
                %{{c}}: Obj = LdLoc<Obj> [loc 0] %{{fp}}
                %{{r}}: Cell = LdProp<Cell> %{{c}}, #ContReceived
                StProp %{{c}}, #ContReceived, InitNull
                %{{_}}: Int = LdRaw<Int> %{{c}}, #ContLabel
                ...
                UnlinkContVarEnv %{{fp}}
                AssertLoc<Obj> [loc 0] %{{fp}}
                %{{old}}: Cell = LdProp<Cell> %{{c}}, #ContValue
                StProp %{{c}}, #ContValue, %{{r}}
                DecRef %{{old}}
                StRaw %{{c}}, #ContLabel, 3
                ...
            ",
        );
    }

    #[test]
    fn raise_rewinds_the_label() {
        let u = TestUnit::new();
        let mut t = u.translator();
        feed(&mut t, 0, &[Op::ContRaise]);
        assert_hir_matches(
            t.module(),
            "
            ...
                %{{l}}: Int = LdRaw<Int> %{{c}}, #ContLabel
                %{{l2}}: Int = OpSub %{{l}}, 1
                StRaw %{{c}}, #ContLabel, %{{l2}}
                ...
            ",
        );
    }

    #[test]
    fn cont_exit_returns() {
        let u = TestUnit::new();
        let mut t = u.translator();
        feed(&mut t, 0, &[Op::ContExit]);
        assert!(t.has_exit());
        assert_hir_matches(
            t.module(),
            "
            ...
                ExitWhenSurprised -> bb{{_}}
                %{{r}}: RetAddr = LdRetAddr %{{fp}}
                %{{f}}: FramePtr = FreeActRec %{{fp}}
                RetCtrl %{{sp}}, %{{f}}, %{{r}}
            ...
            ",
        );
    }
}
