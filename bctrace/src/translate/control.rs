//! Jumps, conditional branches, switches, and iterators.
//!
//! Every branch out of the tracelet leaves through an exit trace; only the fall-through path of a
//! conditional stays in the main trace.

use super::Translator;
use crate::{
    bytecode::Offset,
    hir::{Extra, Inst, InstIdx, JmpSwitchData, LdSSwitchData, Opcode, Ty},
    log::Verbosity,
    unit::LitstrId,
    TranslationError,
};

impl Translator<'_> {
    /// An unconditional jump to `target`. Backward jumps check for surprise flags (e.g. pending
    /// signals) unless `no_surprise` is set. If the jump doesn't end the tracelet, translation
    /// simply continues at `target`.
    pub(super) fn emit_jmp(
        &mut self,
        target: Offset,
        break_tracelet: bool,
        no_surprise: bool,
    ) -> Result<(), TranslationError> {
        if target < self.bc.bc_off && !no_surprise {
            let exit = self.exit_slow_trace()?;
            self.gen(Inst::new(Opcode::ExitWhenSurprised).taken(exit))?;
        }
        if !break_tracelet {
            return Ok(());
        }
        let exit = self.exit_trace(Some(target))?;
        self.gen(Inst::new(Opcode::Jmp_).taken(exit))?;
        self.has_exit = true;
        Ok(())
    }

    /// Branch to `target` if `src` is falsey (`negate`) or truthy (otherwise). Consumes `src`.
    fn jmp_cond(
        &mut self,
        target: Offset,
        negate: bool,
        src: InstIdx,
    ) -> Result<InstIdx, TranslationError> {
        if self.last_bc_off {
            // Both successors leave the trace.
            self.spill_stack()?;
        }
        let exit = self.exit_trace(Some(target))?;
        let b = if self.m.ty(src).is_bool() {
            src
        } else {
            self.gen_op(Opcode::ConvCellToBool, &[src])?
        };
        self.dec_ref(src)?;
        let op = if negate {
            Opcode::JmpZero
        } else {
            Opcode::JmpNZero
        };
        self.gen(Inst::new(op).srcs(&[b]).taken(exit))
    }

    pub(super) fn emit_jmp_z(&mut self, target: Offset) -> Result<(), TranslationError> {
        let src = self.pop_c()?;
        self.jmp_cond(target, true, src)?;
        Ok(())
    }

    pub(super) fn emit_jmp_nz(&mut self, target: Offset) -> Result<(), TranslationError> {
        let src = self.pop_c()?;
        self.jmp_cond(target, false, src)?;
        Ok(())
    }

    /// An integer switch. `targets` are relative to the current bytecode and end with the
    /// default case; see [crate::bytecode::Op::Switch].
    pub(super) fn emit_switch(
        &mut self,
        targets: &[Offset],
        base: i64,
        bounded: bool,
    ) -> Result<(), TranslationError> {
        let bc = self.bc.bc_off;
        let Some(&last) = targets.last() else {
            return Err(TranslationError::General(format!(
                "switch at {bc} has no default case"
            )));
        };
        let default_off = bc + last;
        let zero_off = switch_zero_off(bc, targets, base, bounded);
        let n_targets = i64::try_from(switch_cases(targets.len(), bounded)).unwrap();

        let ty = self.top_ty(0);
        if !(ty.is_null()
            || ty.is_bool()
            || ty.is_int()
            || ty.is_dbl()
            || ty.is_string()
            || ty.is_obj()
            || ty.is_array())
        {
            self.log(
                Verbosity::Translation,
                &format!("interpreting switch at {bc} on a value of type {ty}"),
            );
            return self.interp_one_cf(1);
        }

        let val = self.pop_c()?;
        let mut bounded = bounded;
        let index = if ty.is_null() {
            return self.jmp_out(zero_off);
        } else if ty.is_bool() {
            let Some(&nonzero) = targets.len().checked_sub(2).map(|i| &targets[i]) else {
                return Err(TranslationError::General(format!(
                    "switch at {bc} has no case for non-zero values"
                )));
            };
            let exit = self.exit_trace(Some(bc + nonzero))?;
            self.gen(Inst::new(Opcode::JmpNZero).srcs(&[val]).taken(exit))?;
            return self.jmp_out(zero_off);
        } else if ty.is_int() {
            val
        } else if ty.is_dbl() {
            bounded = false;
            let (b, n) = (self.cns(base)?, self.cns(n_targets)?);
            self.gen_op(Opcode::LdSwitchDblIndex, &[val, b, n])?
        } else if ty.is_string() {
            bounded = false;
            let (b, n) = (self.cns(base)?, self.cns(n_targets)?);
            self.gen_op(Opcode::LdSwitchStrIndex, &[val, b, n])?
        } else if ty.is_obj() {
            bounded = false;
            let catch = self.catch_trace()?;
            let (b, n) = (self.cns(base)?, self.cns(n_targets)?);
            self.gen(
                Inst::new(Opcode::LdSwitchObjIndex)
                    .srcs(&[val, b, n])
                    .taken(catch),
            )?
        } else {
            // Arrays always take the default case.
            self.dec_ref(val)?;
            return self.jmp_out(default_off);
        };

        let data = JmpSwitchData {
            func: self.bc.func,
            base,
            bounded,
            cases: targets.len(),
            default_off,
            targets: targets.iter().map(|x| bc + x).collect(),
        };
        let sp = self.spill_stack()?;
        let fp = self.fp();
        self.gen_op(Opcode::SyncABIRegs, &[fp, sp])?;
        self.gen(
            Inst::new(Opcode::JmpSwitchDest)
                .extra(Extra::Switch(Box::new(data)))
                .srcs(&[index]),
        )?;
        self.has_exit = true;
        Ok(())
    }

    /// A string switch. Offsets are relative to the current bytecode.
    pub(super) fn emit_sswitch(
        &mut self,
        cases: &[(LitstrId, Offset)],
        default: Offset,
    ) -> Result<(), TranslationError> {
        let bc = self.bc.bc_off;
        let cases = cases
            .iter()
            .map(|(s, off)| Ok((self.litstr(*s)?.to_owned(), bc + off)))
            .collect::<Result<Vec<_>, TranslationError>>()?;
        // Comparing a string against a numeric string is a numeric comparison, which the fast
        // path can't do.
        let fast = self.top_ty(0).is_string() && !cases.iter().any(|(s, _)| is_numeric_str(s));
        let catch = if fast {
            None
        } else {
            Some(self.catch_trace()?)
        };
        let test = self.pop_c()?;
        let data = LdSSwitchData {
            func: self.bc.func,
            cases,
            default_off: bc + default,
        };
        let op = if fast {
            Opcode::LdSSwitchDestFast
        } else {
            Opcode::LdSSwitchDestSlow
        };
        let dest = self.gen(
            Inst::new(op)
                .extra(Extra::SSwitch(Box::new(data)))
                .srcs(&[test])
                .maybe_taken(catch),
        )?;
        self.dec_ref(test)?;
        let sp = self.spill_stack()?;
        let fp = self.fp();
        self.gen_op(Opcode::SyncABIRegs, &[fp, sp])?;
        self.gen_op(Opcode::JmpIndirect, &[dest])?;
        self.has_exit = true;
        Ok(())
    }

    /// End the main trace with a jump to an exit to `target`.
    fn jmp_out(&mut self, target: Offset) -> Result<(), TranslationError> {
        let exit = self.exit_trace(Some(target))?;
        self.gen(Inst::new(Opcode::Jmp_).taken(exit))?;
        self.has_exit = true;
        Ok(())
    }

    // Iterators.

    /// `IterInit` and its variants (`op`): start iterating over the value on top of the stack,
    /// storing the first value (and key) into locals, or jump to `target` if it is empty.
    pub(super) fn emit_iter_init(
        &mut self,
        op: Opcode,
        iter: u32,
        target: Offset,
        val: u32,
        key: Option<u32>,
    ) -> Result<(), TranslationError> {
        let ty = self.top_ty(0);
        if !(ty.is_array() || ty == Ty::OBJ) {
            self.log(
                Verbosity::Translation,
                &format!("interpreting {op} over a value of type {ty}"),
            );
            return self.interp_one_cf(1);
        }
        let src = self.pop_c()?;
        let fp = self.fp();
        let mut srcs = vec![src, fp, self.cns(iter)?, self.cns(val)?];
        if let Some(key) = key {
            srcs.push(self.cns(key)?);
        }
        let res = self.gen(Inst::new(op).tp(Ty::BOOL).srcs(&srcs))?;
        self.jmp_cond(target, true, res)?;
        Ok(())
    }

    /// `IterNext` and its variants (`op`): advance the iterator, jumping back to `target` if
    /// there are more elements.
    pub(super) fn emit_iter_next(
        &mut self,
        op: Opcode,
        iter: u32,
        target: Offset,
        val: u32,
        key: Option<u32>,
    ) -> Result<(), TranslationError> {
        let fp = self.fp();
        let mut srcs = vec![fp, self.cns(iter)?, self.cns(val)?];
        if let Some(key) = key {
            srcs.push(self.cns(key)?);
        }
        let res = self.gen(Inst::new(op).tp(Ty::BOOL).srcs(&srcs))?;
        self.jmp_cond(target, false, res)?;
        Ok(())
    }

    /// `IterFree` or `CIterFree`.
    pub(super) fn emit_iter_free(&mut self, op: Opcode, iter: u32) -> Result<(), TranslationError> {
        let fp = self.fp();
        self.gen(Inst::new(op).extra(Extra::IterId(iter)).srcs(&[fp]))?;
        Ok(())
    }

    pub(super) fn emit_decode_cuf_iter(
        &mut self,
        iter: u32,
        target: Offset,
    ) -> Result<(), TranslationError> {
        let src = self.pop_c()?;
        let ty = self.m.ty(src);
        if ty.is_array() || ty.is_string() || ty.is_obj() {
            let fp = self.fp();
            let res = self.gen(
                Inst::new(Opcode::DecodeCufIter)
                    .tp(Ty::BOOL)
                    .extra(Extra::IterId(iter))
                    .srcs(&[src, fp]),
            )?;
            self.dec_ref(src)?;
            self.jmp_cond(target, true, res)?;
        } else {
            // Nothing else is callable.
            self.dec_ref(src)?;
            self.emit_jmp(target, true, false)?;
        }
        Ok(())
    }
}

/// The number of `targets` that are real cases.
fn switch_cases(len: usize, bounded: bool) -> usize {
    if bounded {
        len.saturating_sub(2)
    } else {
        len
    }
}

/// The absolute offset a switch at `bc` jumps to for the value 0.
fn switch_zero_off(bc: Offset, targets: &[Offset], base: i64, bounded: bool) -> Offset {
    let n = i64::try_from(switch_cases(targets.len(), bounded)).unwrap();
    let default = bc + targets[targets.len() - 1];
    if base <= 0 && base + n > 0 {
        bc + targets[usize::try_from(-base).unwrap()]
    } else {
        default
    }
}

/// Does `s` look like a number to the runtime's loose comparisons? Leading whitespace is allowed;
/// trailing garbage is not.
fn is_numeric_str(s: &str) -> bool {
    let s = s.trim_start_matches([' ', '\t', '\n', '\r', '\x0b', '\x0c']);
    let s = s.strip_prefix(['+', '-']).unwrap_or(s);
    let (mantissa, exp) = match s.find(['e', 'E']) {
        Some(i) => (&s[..i], Some(&s[i + 1..])),
        None => (s, None),
    };
    let (int, frac) = match mantissa.split_once('.') {
        Some((i, f)) => (i, f),
        None => (mantissa, ""),
    };
    let digits = |x: &str| x.bytes().all(|b| b.is_ascii_digit());
    if int.is_empty() && frac.is_empty() {
        return false;
    }
    let exp_ok = match exp {
        Some(e) => {
            let e = e.strip_prefix(['+', '-']).unwrap_or(e);
            !e.is_empty() && digits(e)
        }
        None => true,
    };
    digits(int) && digits(frac) && exp_ok
}

#[cfg(test)]
mod tests {
    use super::{is_numeric_str, switch_zero_off};
    use crate::{
        bytecode::Op,
        hir::{Opcode, TraceIdx, TraceKind, Ty},
        testing::{assert_hir_matches, feed, TestUnit},
    };

    #[test]
    fn backward_jump_checks_for_surprises() {
        let u = TestUnit::new();
        let mut t = u.translator();
        feed(
            &mut t,
            5,
            &[Op::Jmp {
                target: 2,
                break_tracelet: true,
            }],
        );
        assert!(t.has_exit());
        assert_hir_matches(
            t.module(),
            "
            trace 0 (main):
              bb0:
                ...
                Marker [bc=5 sp=4 func#0]
                ExitWhenSurprised -> bb1
                Jmp_ -> bb2
            trace 1 (exit):
              bb1:
                Marker [bc=5 sp=4 func#0]
                SyncABIRegs %{{fp}}, %{{sp}}
                ReqBindJmpNoIR [bc 5]
            trace 2 (exit):
              bb2:
                Marker [bc=2 sp=4 func#0]
                SyncABIRegs %{{fp}}, %{{sp}}
                ReqBindJmp [bc 2]
            ",
        );
    }

    #[test]
    fn forward_and_no_surprise_jumps() {
        let u = TestUnit::new();
        let mut t = u.translator();
        feed(
            &mut t,
            5,
            &[Op::JmpNS {
                target: 1,
                break_tracelet: false,
            }],
        );
        assert!(!t.has_exit());
        let mut t = u.translator();
        feed(
            &mut t,
            5,
            &[Op::Jmp {
                target: 9,
                break_tracelet: true,
            }],
        );
        assert!(!t
            .module()
            .trace_insts(TraceIdx::MAIN)
            .any(|i| t.module().inst(i).opcode() == Opcode::ExitWhenSurprised));
        assert_eq!(t.module().traces_len(), 2);
    }

    #[test]
    fn conditional_jump_keeps_fallthrough() {
        let u = TestUnit::new();
        let mut t = u.translator();
        t.guard_type_stack(0, Ty::INT).unwrap();
        feed(&mut t, 0, &[Op::JmpZ(7)]);
        t.end().unwrap();
        assert_hir_matches(
            t.module(),
            "
            trace 0 (main):
              bb0:
                ...
                GuardStk<Int> [off 0] %{{sp0}}
                %{{v}}: Int = LdStack<Int> [off 0] %{{sp0}}
                %{{sp1}}: StkPtr = SpillStack %{{sp0}}, 1
                %{{b}}: Bool = ConvCellToBool %{{v}}
                JmpZero %{{b}} -> bb1
                ...
                ReqBindJmp [bc 1]
            trace 1 (exit):
              bb1:
                Marker [bc=7 sp=3 func#0]
                SyncABIRegs %{{fp}}, %{{sp1}}
                ReqBindJmp [bc 7]
            ",
        );
    }

    #[test]
    fn switch_offsets() {
        // Bounded: the last two entries are the non-zero and default cases.
        assert_eq!(switch_zero_off(10, &[1, 2, 3, 4], 0, true), 11);
        assert_eq!(switch_zero_off(10, &[1, 2, 3, 4], -1, true), 12);
        assert_eq!(switch_zero_off(10, &[1, 2, 3, 4], -2, true), 14);
        assert_eq!(switch_zero_off(10, &[1, 2, 3, 4], 1, true), 14);
        assert_eq!(switch_zero_off(10, &[1, 2, 3], -2, false), 13);
    }

    #[test]
    fn int_switch() {
        let u = TestUnit::new();
        let mut t = u.translator();
        feed(
            &mut t,
            10,
            &[
                Op::Int(1),
                Op::Switch {
                    targets: vec![1, 2, 3],
                    base: 0,
                    bounded: true,
                },
            ],
        );
        assert!(t.has_exit());
        t.end().unwrap();
        assert_hir_matches(
            t.module(),
            "
            trace 0 (main):
              bb0:
                ...
                Marker [bc=11 sp=5 func#0]
                %{{sp1}}: StkPtr = SpillStack %{{sp0}}, 0
                SyncABIRegs %{{fp}}, %{{sp1}}
                JmpSwitchDest [base 0 cases 3 default 14 bounded] 1
            ",
        );
    }

    #[test]
    fn null_switch_takes_zero_case() {
        let u = TestUnit::new();
        let mut t = u.translator();
        feed(
            &mut t,
            10,
            &[
                Op::Null,
                Op::Switch {
                    targets: vec![5, 6, 7, 8],
                    base: 0,
                    bounded: true,
                },
            ],
        );
        assert!(t.has_exit());
        assert_hir_matches(
            t.module(),
            "
            ...
                Jmp_ -> bb1
            trace 1 (exit):
              bb1:
                ...
                ReqBindJmp [bc 16]
            ",
        );
    }

    #[test]
    fn unknown_switch_is_interpreted() {
        let u = TestUnit::new();
        let mut t = u.translator();
        feed(
            &mut t,
            10,
            &[Op::Switch {
                targets: vec![1, 2],
                base: 0,
                bounded: false,
            }],
        );
        assert!(t.has_exit());
        assert!(t
            .module()
            .trace_insts(TraceIdx::MAIN)
            .any(|i| t.module().inst(i).opcode() == Opcode::InterpOneCF));
    }

    #[test]
    fn sswitch_fast_and_slow() {
        let mut u = TestUnit::new();
        let x = u.litstr("x");
        let a = u.litstr("a");
        let ten = u.litstr(" 10");
        let mut t = u.translator();
        feed(
            &mut t,
            0,
            &[
                Op::String(x),
                Op::SSwitch {
                    cases: vec![(a, 2)],
                    default: 3,
                },
            ],
        );
        assert_eq!(t.module().traces_len(), 1);
        assert_hir_matches(
            t.module(),
            "
            ...
                %{{d}}: TCA = LdSSwitchDestFast [\"a\" -> 3, default -> 4] \"x\"
                %{{sp1}}: StkPtr = SpillStack %{{sp0}}, 0
                SyncABIRegs %{{fp}}, %{{sp1}}
                JmpIndirect %{{d}}
            ",
        );

        // A numeric-looking case needs the slow path, which may throw.
        let mut t = u.translator();
        feed(
            &mut t,
            0,
            &[
                Op::String(x),
                Op::SSwitch {
                    cases: vec![(a, 2), (ten, 5)],
                    default: 3,
                },
            ],
        );
        let catch = t
            .module()
            .traces()
            .find(|(_, tr)| tr.kind() == TraceKind::Catch)
            .map(|(tidx, _)| t.module().entry(tidx))
            .unwrap();
        let slow = t
            .module()
            .trace_insts(TraceIdx::MAIN)
            .find(|i| t.module().inst(*i).opcode() == Opcode::LdSSwitchDestSlow)
            .unwrap();
        assert_eq!(t.module().inst(slow).taken_block(), Some(catch));
    }

    #[test]
    fn sswitch_of_unknown_type_is_slow() {
        let mut u = TestUnit::new();
        let a = u.litstr("a");
        let b = u.litstr("b");
        let mut t = u.translator();
        feed(
            &mut t,
            0,
            &[Op::SSwitch {
                cases: vec![(a, 2), (b, 4)],
                default: 6,
            }],
        );
        assert!(!t
            .module()
            .trace_insts(TraceIdx::MAIN)
            .any(|i| t.module().inst(i).opcode() == Opcode::LdSSwitchDestFast));
        assert_hir_matches(
            t.module(),
            "
            ...
                %{{v}}: Cell = LdStack<Cell> [off 0] %{{sp0}}
                %{{d}}: TCA = LdSSwitchDestSlow [\"a\" -> 2, \"b\" -> 4, default -> 6] %{{v}} -> bb{{catch}}
                DecRef %{{v}}
                ...
                JmpIndirect %{{d}}
            ...
            trace {{_}} (catch):
                bb{{catch}}:
                ...
                EndCatch %{{_}}
            ",
        );
    }

    #[test]
    fn numeric_strings() {
        for s in ["1", " 10", "-3.5", ".5", "5.", "1e10", "+2E-3"] {
            assert!(is_numeric_str(s), "{s}");
        }
        for s in ["", "a", "1a", ".", "1e", "e5", "--1", "1 "] {
            assert!(!is_numeric_str(s), "{s}");
        }
    }

    #[test]
    fn iter_init_over_array() {
        let u = TestUnit::new();
        let mut t = u.translator();
        t.guard_type_stack(0, Ty::ARR).unwrap();
        feed(
            &mut t,
            0,
            &[Op::IterInitK {
                iter: 0,
                target: 9,
                val: 1,
                key: 2,
            }],
        );
        assert_hir_matches(
            t.module(),
            "
            ...
                %{{v}}: Arr = LdStack<Arr> [off 0] %{{sp}}
                %{{b}}: Bool = IterInitK<Bool> %{{v}}, %{{fp}}, 0, 1, 2
                %{{_}}: StkPtr = SpillStack %{{sp}}, 1
                JmpZero %{{b}} -> bb1
            ...
            ",
        );
    }

    #[test]
    fn iter_init_over_scalar_is_interpreted() {
        let u = TestUnit::new();
        let mut t = u.translator();
        t.guard_type_stack(0, Ty::INT).unwrap();
        feed(
            &mut t,
            0,
            &[Op::IterInit {
                iter: 0,
                target: 9,
                val: 1,
            }],
        );
        assert!(t.has_exit());
        assert!(!t
            .module()
            .trace_insts(TraceIdx::MAIN)
            .any(|i| t.module().inst(i).opcode() == Opcode::IterInit));
    }
}
