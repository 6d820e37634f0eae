//! Literals, constants, array construction, class references, and the other bytecodes that
//! don't fit anywhere else.

use super::Translator;
use crate::{
    hir::{BlockIdx, ClsCnsName, Const, Extra, Inst, InstIdx, Opcode, Ty},
    unit::{ArrayId, LitstrId},
    TranslationError,
};
use std::cell::Cell;

impl<'u> Translator<'u> {
    pub(super) fn push_cns(&mut self, c: impl Into<Const>) -> Result<(), TranslationError> {
        let v = self.cns(c)?;
        self.push(v);
        Ok(())
    }

    pub(super) fn emit_string(&mut self, id: LitstrId) -> Result<(), TranslationError> {
        let s = self.litstr(id)?;
        self.push_cns(s)
    }

    pub(super) fn emit_array(&mut self, id: ArrayId) -> Result<(), TranslationError> {
        self.push_cns(Const::Arr(id))
    }

    pub(super) fn emit_new_array(&mut self, capacity: u32) -> Result<(), TranslationError> {
        if capacity == 0 {
            return self.push_cns(Const::EmptyArr);
        }
        let cap = self.cns(capacity)?;
        let arr = self.gen_op(Opcode::NewArray, &[cap])?;
        self.push(arr);
        Ok(())
    }

    /// `NewTuple` reads its elements from memory, so the stack is spilled first.
    pub(super) fn emit_new_tuple(&mut self, num_args: u32) -> Result<(), TranslationError> {
        let sp = self.spill_stack()?;
        for _ in 0..num_args {
            self.pop_c()?;
        }
        let n = self.cns(num_args)?;
        let tuple = self.gen_op(Opcode::NewTuple, &[n, sp])?;
        self.push(tuple);
        Ok(())
    }

    pub(super) fn emit_array_add(&mut self) -> Result<(), TranslationError> {
        if !(self.top_ty(0).is_array() && self.top_ty(1).is_array()) {
            return self.interp_one(Some(Ty::ARR), 2, 0);
        }
        let tr = self.pop_c()?;
        let tl = self.pop_c()?;
        let r = self.gen_op(Opcode::ArrayAdd, &[tl, tr])?;
        self.push(r);
        Ok(())
    }

    /// The `AddElem*` helpers consume their operands' references.
    pub(super) fn emit_add_elem_c(&mut self) -> Result<(), TranslationError> {
        let key_ty = self.top_ty(1);
        let opcode = if key_ty.is_int() {
            Opcode::AddElemIntKey
        } else if key_ty.is_string() {
            Opcode::AddElemStrKey
        } else {
            return self.punt("AddElemC with a non-Int, non-Str key", Some(Ty::ARR), 3, 0);
        };
        let val = self.pop_c()?;
        let key = self.pop_c()?;
        let arr = self.pop_c()?;
        let r = self.gen_op(opcode, &[arr, key, val])?;
        self.push(r);
        Ok(())
    }

    pub(super) fn emit_add_new_elem_c(&mut self) -> Result<(), TranslationError> {
        if !self.top_ty(1).is_array() {
            return self.interp_one(Some(Ty::ARR), 2, 0);
        }
        let val = self.pop_c()?;
        let arr = self.pop_c()?;
        let r = self.gen_op(Opcode::AddNewElem, &[arr, val])?;
        self.push(r);
        Ok(())
    }

    // Constants.

    pub(super) fn emit_cns(&mut self, id: LitstrId) -> Result<(), TranslationError> {
        let name_str = self.litstr(id)?;
        let name = self.cns(name_str)?;
        let r = match self.unit.lookup_persistent_cns(name_str) {
            // A dynamic system constant: always looked up the slow way.
            Some(Const::Uninit) => {
                let catch = self.catch_trace()?;
                self.gen(
                    Inst::new(Opcode::LookupCns)
                        .tp(Ty::CELL)
                        .srcs(&[name])
                        .taken(catch),
                )?
            }
            Some(c) => self.cns(c)?,
            None => {
                let catch = self.catch_trace()?;
                let cached = self.gen(Inst::new(Opcode::LdCns).tp(Ty::CELL).srcs(&[name]))?;
                self.cond(
                    |t, taken| {
                        t.gen(Inst::new(Opcode::CheckInit).srcs(&[cached]).taken(taken))?;
                        Ok(())
                    },
                    |_| Ok(cached),
                    |t| {
                        t.gen(
                            Inst::new(Opcode::LookupCns)
                                .tp(Ty::CELL)
                                .srcs(&[name])
                                .taken(catch),
                        )
                    },
                )?
            }
        };
        self.push(r);
        Ok(())
    }

    pub(super) fn emit_def_cns(&mut self, id: LitstrId) -> Result<(), TranslationError> {
        let name = self.litstr(id)?;
        let name = self.cns(name)?;
        let val = self.pop_c()?;
        let r = self.gen_op(Opcode::DefCns, &[name, val])?;
        self.push(r);
        Ok(())
    }

    /// Load a class constant, side-exiting to the next bytecode (after looking the constant up
    /// the slow way) if the cache slot hasn't been filled yet.
    pub(super) fn emit_cls_cns_d(
        &mut self,
        cns: LitstrId,
        cls: LitstrId,
    ) -> Result<(), TranslationError> {
        let name = ClsCnsName {
            cls: self.litstr(cls)?.to_owned(),
            cns: self.litstr(cns)?.to_owned(),
        };
        let lookup_name = name.clone();
        let mut lookup = move |t: &mut Translator<'u>,
                               b: BlockIdx|
              -> Result<Option<InstIdx>, TranslationError> {
            let v = t.gen_for(
                b,
                Inst::new(Opcode::LookupClsCns)
                    .tp(Ty::CELL)
                    .extra(Extra::ClsCns(lookup_name.clone())),
            )?;
            Ok(Some(v))
        };
        let next = self.next_bc_off();
        let side_exit = self.side_exit(next, &mut lookup)?;
        let c = self.gen(
            Inst::new(Opcode::LdClsCns)
                .tp(Ty::UNCOUNTED)
                .extra(Extra::ClsCns(name)),
        )?;
        self.gen(Inst::new(Opcode::CheckInit).srcs(&[c]).taken(side_exit))?;
        self.push(c);
        Ok(())
    }

    pub(super) fn emit_concat(&mut self) -> Result<(), TranslationError> {
        let tr = self.pop_c()?;
        let tl = self.pop_c()?;
        let r = self.gen_op(Opcode::Concat, &[tl, tr])?;
        self.push(r);
        Ok(())
    }

    pub(super) fn emit_print(&mut self) -> Result<(), TranslationError> {
        let ty = self.top_ty(0);
        let opcode = if ty.is_int() {
            Some(Opcode::PrintInt)
        } else if ty.is_bool() {
            Some(Opcode::PrintBool)
        } else if ty.is_string() {
            Some(Opcode::PrintStr)
        } else if ty.is_null() {
            None
        } else {
            return self.interp_one(Some(Ty::INT), 1, 0);
        };
        // The print helpers release their argument.
        let v = self.pop_c()?;
        if let Some(opcode) = opcode {
            self.gen_op(opcode, &[v])?;
        }
        self.push_cns(1)
    }

    // `$this` and class references.

    /// Load `$this`, exiting to the interpreter if the frame has none (unless we already know
    /// it does).
    pub(super) fn ld_this_checked(&mut self) -> Result<InstIdx, TranslationError> {
        let exit = if self.tracker.this_available() {
            None
        } else {
            Some(self.exit_slow_trace()?)
        };
        let fp = self.fp();
        self.gen(Inst::new(Opcode::LdThis).srcs(&[fp]).maybe_taken(exit))
    }

    pub(super) fn emit_this(&mut self) -> Result<(), TranslationError> {
        if self.cur_class()?.is_none() {
            return self.interp_one(Some(Ty::OBJ), 0, 0);
        }
        let this = self.ld_this_checked()?;
        self.push_inc_ref(this)?;
        Ok(())
    }

    /// As [Self::emit_this]. Rather than pushing null (and maybe raising a notice) when there is
    /// no `$this`, we leave the trace, so that the rest of the trace can rely on `$this`.
    pub(super) fn emit_bare_this(&mut self) -> Result<(), TranslationError> {
        if self.cur_class()?.is_none() {
            return self.interp_one(Some(Ty::INIT_NULL), 0, 0);
        }
        let this = self.ld_this_checked()?;
        self.push_inc_ref(this)?;
        Ok(())
    }

    pub(super) fn emit_check_this(&mut self) -> Result<(), TranslationError> {
        if self.cur_class()?.is_none() {
            return self.interp_one(None, 0, 0);
        }
        self.ld_this_checked()?;
        Ok(())
    }

    pub(super) fn emit_init_this_loc(&mut self, id: u32) -> Result<(), TranslationError> {
        if self.cur_class()?.is_none() {
            // Outside a class $this is never set.
            return Ok(());
        }
        let this = self.ld_this_checked()?;
        let this = self.inc_ref(this)?;
        let fp = self.fp();
        self.gen(
            Inst::new(Opcode::StLoc)
                .extra(Extra::LocalId(id))
                .srcs(&[fp, this]),
        )?;
        Ok(())
    }

    pub(super) fn emit_late_bound_cls(&mut self) -> Result<(), TranslationError> {
        if self.cur_class()?.is_none() {
            return self.interp_one(Some(Ty::CLS), 0, 0);
        }
        let fp = self.fp();
        let func = self.cns(Const::Func(self.bc.func))?;
        let ctx = self.gen_op(Opcode::LdCtx, &[fp, func])?;
        let cls = self.gen_op(Opcode::LdClsCtx, &[ctx])?;
        self.push(cls);
        Ok(())
    }

    pub(super) fn emit_self(&mut self) -> Result<(), TranslationError> {
        match self.cur_class()? {
            Some(c) => self.push_cns(Const::Cls(c.id)),
            None => self.interp_one(Some(Ty::CLS), 0, 0),
        }
    }

    pub(super) fn emit_parent(&mut self) -> Result<(), TranslationError> {
        match self.cur_class()?.and_then(|c| c.parent) {
            Some(p) => self.push_cns(Const::Cls(p)),
            None => self.interp_one(Some(Ty::CLS), 0, 0),
        }
    }

    // Arrays.

    pub(super) fn emit_ak_exists(&mut self) -> Result<(), TranslationError> {
        let arr_ty = self.top_ty(0);
        let key_ty = self.top_ty(1);
        if !arr_ty.subtype_of_any(&[Ty::ARR, Ty::OBJ]) {
            return self.punt("AKExists on a non-array", Some(Ty::BOOL), 2, 0);
        }
        if !key_ty.subtype_of_any(&[Ty::STR, Ty::INT, Ty::NULL]) {
            return self.punt("AKExists with an unsupported key", Some(Ty::BOOL), 2, 0);
        }
        let arr = self.pop_c()?;
        let key = self.pop_c()?;
        let r = self.gen_op(Opcode::AKExists, &[arr, key])?;
        self.push(r);
        self.dec_ref(arr)?;
        self.dec_ref(key)
    }

    /// `ArrayIdx` pops a default, an array, and a key.
    pub(super) fn emit_array_idx(&mut self) -> Result<(), TranslationError> {
        let arr_ty = self.top_ty(1);
        let key_ty = self.top_ty(2);
        if !arr_ty.is_array() {
            return self.interp_one(Some(Ty::CELL), 3, 0);
        }
        if key_ty.is_null() {
            // A null key is never found.
            let def = self.pop_c()?;
            let arr = self.pop_c()?;
            let key = self.pop_c()?;
            self.push(def);
            self.dec_ref(arr)?;
            return self.dec_ref(key);
        }
        if !(key_ty.is_int() || key_ty.is_string()) {
            return self.interp_one(Some(Ty::CELL), 3, 0);
        }
        let def = self.pop_c()?;
        let arr = self.pop_c()?;
        let key = self.pop_c()?;
        let (helper, idx_key) = match self.m.const_val(key) {
            _ if self.m.ty(key).is_int() => ("arrayIdxI", key),
            Some(Const::Str(s)) => match strictly_integer(s) {
                Some(i) => ("arrayIdxI", self.cns(i)?),
                None => ("arrayIdxS", key),
            },
            // A string that might look like an integer.
            _ => ("arrayIdxSi", key),
        };
        let helper = self.cns(Const::Helper(helper))?;
        let r = self.gen_op(Opcode::ArrayIdx, &[helper, arr, idx_key, def])?;
        self.push(r);
        self.dec_ref(arr)?;
        self.dec_ref(key)
    }

    pub(super) fn emit_static_loc_init(
        &mut self,
        id: u32,
        name: LitstrId,
    ) -> Result<(), TranslationError> {
        let func = self.cur_func()?;
        if func.is_pseudomain() {
            return self.punt("StaticLocInit in a pseudo-main", None, 1, 0);
        }
        let name = self.litstr(name)?;
        let name = self.cns(name)?;
        let value = self.pop_c()?;
        let fp = self.fp();
        let boxed = if func.is_closure_body() || func.is_generator_from_closure() {
            self.gen_op(Opcode::StaticLocInit, &[name, fp, value])?
        } else {
            let handle = self.new_cache_handle();
            let ch = self.cns(Const::CacheHandle(handle))?;
            let cached = Cell::new(None);
            self.cond(
                |t, taken| {
                    cached.set(Some(t.gen(
                        Inst::new(Opcode::LdStaticLocCached)
                            .srcs(&[ch])
                            .taken(taken),
                    )?));
                    Ok(())
                },
                // Already initialized.
                |t| {
                    let cached = cached.get().expect("branch emitted the cached load");
                    t.gen_op(Opcode::IncRef, &[cached])
                },
                |t| {
                    let fp = t.fp();
                    t.gen_op(Opcode::StaticLocInitCached, &[name, fp, value, ch])
                },
            )?
        };
        let fp = self.fp();
        self.gen(
            Inst::new(Opcode::StLoc)
                .extra(Extra::LocalId(id))
                .srcs(&[fp, boxed]),
        )?;
        self.dec_ref(value)
    }
}

/// If `s` is the canonical decimal form of an `i64` (no sign other than a leading `-`, no leading
/// zeros, no `-0`), return that integer.
fn strictly_integer(s: &str) -> Option<i64> {
    let digits = s.strip_prefix('-').unwrap_or(s);
    if digits.is_empty()
        || !digits.bytes().all(|b| b.is_ascii_digit())
        || (digits.len() > 1 && digits.starts_with('0'))
        || s == "-0"
    {
        return None;
    }
    s.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::strictly_integer;
    use crate::{
        bytecode::Op,
        hir::{Const, Opcode, TraceIdx, Ty},
        testing::{assert_hir_matches, feed, TestUnit},
        unit::{Attrs, Class},
    };

    #[test]
    fn add_then_print() {
        let u = TestUnit::new();
        let mut t = u.translator();
        feed(&mut t, 0, &[Op::Int(3), Op::Int(4), Op::Add, Op::Print]);
        assert_eq!(t.eval_stack_len(), 1);
        assert_eq!(t.module().const_int(t.eval_stack_at(0)), Some(1));
        t.end().unwrap();
        assert_hir_matches(
            t.module(),
            "
            ...
                %{{r}}: Int = OpAdd 3, 4
                Marker [bc=3 sp=5 func#0]
                PrintInt %{{r}}
                Marker [bc=4 sp=5 func#0]
                %{{sp}}: StkPtr = SpillStack %{{_}}, 0, 1
                ...
            ",
        );
        t.finish().unwrap();
    }

    #[test]
    fn print_of_unknown_is_interpreted() {
        let u = TestUnit::new();
        let mut t = u.translator();
        feed(&mut t, 0, &[Op::Print]);
        assert_hir_matches(
            t.module(),
            "
            ...
                %{{sp}}: StkPtr = SpillStack %{{_}}, 0
                %{{_}}: Gen|Cls = LdStack<Gen|Cls> [off 0] %{{sp}}
                %{{_}}: StkPtr = InterpOne<Int> %{{_}}, %{{sp}}, 0, 0
            ",
        );
    }

    #[test]
    fn cns_diamond() {
        let mut u = TestUnit::new();
        let name = u.litstr("FOO");
        let mut t = u.translator();
        feed(&mut t, 0, &[Op::Cns(name)]);
        let v = t.eval_stack_at(0);
        assert_eq!(t.module().inst(v).opcode(), Opcode::DefLabel);
        assert_eq!(t.module().ty(v), Ty::CELL);
        assert_hir_matches(
            t.module(),
            "
            ...
                %{{c}}: Cell = LdCns<Cell> \"FOO\"
                CheckInit %{{c}} -> bb{{taken}}
                Jmp_ %{{c}} -> bb{{done}}
              bb{{taken}}: unlikely
                %{{l}}: Cell = LookupCns<Cell> \"FOO\" -> bb{{catch}}
                Jmp_ %{{l}} -> bb{{done}}
              bb{{done}}:
                %{{_}}: Cell = DefLabel<Cell>
            trace 1 (catch):
            ...
                BeginCatch
                ...
            ",
        );
    }

    #[test]
    fn persistent_cns_is_a_constant() {
        let mut u = TestUnit::new();
        let name = u.litstr("PHP_EOL");
        u.persistent_cns("PHP_EOL", Const::Str("\n".to_owned()));
        let mut t = u.translator();
        feed(&mut t, 0, &[Op::Cns(name)]);
        let v = t.eval_stack_at(0);
        assert!(t.module().is_const(v));
        assert_eq!(t.module().traces().count(), 1);
    }

    #[test]
    fn static_local_diamond() {
        let mut u = TestUnit::new();
        let name = u.litstr("s");
        let mut t = u.translator();
        feed(
            &mut t,
            0,
            &[Op::Int(1), Op::StaticLocInit { local: 0, name }],
        );
        assert_hir_matches(
            t.module(),
            "
            ...
                %{{c}}: BoxedCell = LdStaticLocCached ch#{{h}} -> bb{{taken}}
                %{{i}}: BoxedCell = IncRef %{{c}}
                Jmp_ %{{i}} -> bb{{done}}
              bb{{taken}}: unlikely
                %{{n}}: BoxedCell = StaticLocInitCached \"s\", %{{fp}}, 1, ch#{{h}}
                Jmp_ %{{n}} -> bb{{done}}
              bb{{done}}:
                %{{b}}: BoxedCell = DefLabel<BoxedCell>
                StLoc [loc 0] %{{fp}}, %{{b}}
            ",
        );
    }

    #[test]
    fn closure_static_local_is_not_cached() {
        let mut u = TestUnit::new();
        u.main_mut().attrs = Attrs::CLOSURE_BODY;
        let name = u.litstr("s");
        let mut t = u.translator();
        feed(
            &mut t,
            0,
            &[Op::Int(1), Op::StaticLocInit { local: 0, name }],
        );
        assert!(!t
            .module()
            .trace_insts(TraceIdx::MAIN)
            .any(|i| t.module().inst(i).opcode() == Opcode::LdStaticLocCached));
        assert_hir_matches(
            t.module(),
            "
            ...
                %{{b}}: BoxedCell = StaticLocInit \"s\", %{{fp}}, 1
                StLoc [loc 0] %{{fp}}, %{{b}}
            ",
        );
    }

    #[test]
    fn this_outside_class_is_interpreted() {
        let u = TestUnit::new();
        let mut t = u.translator();
        feed(&mut t, 0, &[Op::This]);
        assert!(t
            .module()
            .trace_insts(TraceIdx::MAIN)
            .any(|i| t.module().inst(i).opcode() == Opcode::InterpOne));
    }

    #[test]
    fn this_is_only_checked_once() {
        let mut u = TestUnit::new();
        let c = u.add_class(Class {
            name: "C".to_owned(),
            ..Default::default()
        });
        u.main_mut().cls = Some(c);
        let mut t = u.translator();
        feed(&mut t, 0, &[Op::CheckThis, Op::This]);
        let this_loads = t
            .module()
            .trace_insts(TraceIdx::MAIN)
            .filter(|i| t.module().inst(*i).opcode() == Opcode::LdThis)
            .map(|i| t.module().inst(i).taken_block().is_some())
            .collect::<Vec<_>>();
        assert_eq!(this_loads, vec![true, false]);
    }

    #[test]
    fn array_idx_with_integer_string_key() {
        let mut u = TestUnit::new();
        let k = u.litstr("12");
        let mut t = u.translator();
        t.guard_type_local(0, Ty::ARR).unwrap();
        feed(
            &mut t,
            0,
            &[Op::String(k), Op::CGetL(0), Op::Null, Op::ArrayIdx],
        );
        assert_hir_matches(
            t.module(),
            "
            ...
                %{{r}}: Cell = ArrayIdx @arrayIdxI, %{{a}}, 12, InitNull
                DecRef %{{a}}
                ...
            ",
        );
    }

    #[test]
    fn canonical_integers() {
        assert_eq!(strictly_integer("0"), Some(0));
        assert_eq!(strictly_integer("-17"), Some(-17));
        assert_eq!(strictly_integer("017"), None);
        assert_eq!(strictly_integer("-0"), None);
        assert_eq!(strictly_integer("+1"), None);
        assert_eq!(strictly_integer("1.0"), None);
        assert_eq!(strictly_integer(""), None);
        assert_eq!(strictly_integer("99999999999999999999"), None);
    }
}
