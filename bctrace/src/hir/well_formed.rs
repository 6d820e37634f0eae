//! Basic well-formedness checks for HIR. After calling [Module::assert_well_formed] one can safely
//! assume:
//!
//!   * Every block placed in a trace is non-empty and ends with exactly one terminal instruction.
//!   * Every trace other than the main trace has exactly one block.
//!   * Every trace starts with a `Marker`, except catch traces, which start with `BeginCatch`
//!     followed by a `Marker` and end with `EndCatch`.
//!   * Every source operand is defined before its user and produces a value.
//!   * Every taken block exists and has been placed in a trace.
//!   * Opcodes which need a taken block have one.

#![cfg(any(test, debug_assertions))]

use super::{Module, Opcode, TraceIdx, TraceKind};

impl Module {
    pub(crate) fn assert_well_formed(&self) {
        for (tidx, trace) in self.traces() {
            if trace.kind() != TraceKind::Main && trace.blocks().len() != 1 {
                panic!(
                    "Trace {tidx} ({}) has {} blocks",
                    trace.kind(),
                    trace.blocks().len()
                );
            }
            self.check_trace_entry(tidx);
            for bidx in trace.blocks() {
                let block = self.block(*bidx);
                let Some((last, rest)) = block.insts().split_last() else {
                    panic!("Block bb{bidx} in trace {tidx} is empty");
                };
                if !self.inst(*last).opcode().is_terminal() {
                    panic!(
                        "Block bb{bidx} in trace {tidx} does not end with a terminal:\n  {}",
                        self.display_inst(*last)
                    );
                }
                for iidx in rest {
                    if self.inst(*iidx).opcode().is_terminal() {
                        panic!(
                            "Terminal instruction in the middle of block bb{bidx}:\n  {}",
                            self.display_inst(*iidx)
                        );
                    }
                }
                for iidx in block.insts() {
                    let inst = self.inst(*iidx);
                    for src in inst.src_vals() {
                        if *src >= *iidx {
                            panic!(
                                "Instruction %{iidx} uses %{src} before it is defined:\n  {}",
                                self.display_inst(*iidx)
                            );
                        }
                        if self.ty(*src).is_none() {
                            panic!(
                                "Instruction %{iidx} uses %{src} which produces no value:\n  {}",
                                self.display_inst(*iidx)
                            );
                        }
                    }
                    match inst.taken_block() {
                        Some(b) => {
                            if usize::from(b) >= self.blocks.len() {
                                panic!("Instruction %{iidx} targets non-existent block bb{b}");
                            }
                            if self.block(b).trace().is_none() {
                                panic!(
                                    "Instruction %{iidx} targets unplaced block bb{b}:\n  {}",
                                    self.display_inst(*iidx)
                                );
                            }
                        }
                        None => {
                            if inst.opcode().requires_taken() {
                                panic!(
                                    "Instruction %{iidx} has no taken block:\n  {}",
                                    self.display_inst(*iidx)
                                );
                            }
                        }
                    }
                }
            }
        }
    }

    fn check_trace_entry(&self, tidx: TraceIdx) {
        let trace = self.trace(tidx);
        let mut insts = self.block(self.entry(tidx)).insts().iter();
        if trace.kind() == TraceKind::Catch {
            match insts.next() {
                Some(x) if self.inst(*x).opcode() == Opcode::BeginCatch => (),
                _ => panic!("Catch trace {tidx} does not start with BeginCatch"),
            }
            match self.block(self.entry(tidx)).insts().last() {
                Some(x) if self.inst(*x).opcode() == Opcode::EndCatch => (),
                _ => panic!("Catch trace {tidx} does not end with EndCatch"),
            }
        }
        match insts.next() {
            Some(x) if self.inst(*x).opcode() == Opcode::Marker => (),
            _ => panic!("Trace {tidx} ({}) does not start with a Marker", trace.kind()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::{Const, Extra, Inst, MarkerData, Module, Opcode, TraceIdx, TraceKind};
    use crate::unit::FuncId;

    fn marker() -> Inst {
        Inst::new(Opcode::Marker).extra(Extra::Marker(MarkerData {
            bc_off: 0,
            func: FuncId(0),
            stack_off: 0,
        }))
    }

    #[test]
    fn well_formed_module() {
        let mut m = Module::new(0);
        let bb0 = m.entry(TraceIdx::MAIN);
        m.push_inst(bb0, marker()).unwrap();
        let fp = m.push_inst(bb0, Inst::new(Opcode::DefFP)).unwrap();
        let sp = m
            .push_inst(
                bb0,
                Inst::new(Opcode::DefSP)
                    .extra(Extra::StackOffset(0))
                    .srcs(&[fp]),
            )
            .unwrap();
        let c = m.new_trace(TraceKind::Catch, 0).unwrap();
        let cb = m.entry(c);
        m.push_inst(cb, Inst::new(Opcode::BeginCatch)).unwrap();
        m.push_inst(cb, marker()).unwrap();
        m.push_inst(cb, Inst::new(Opcode::EndCatch).srcs(&[sp]))
            .unwrap();
        m.push_inst(bb0, Inst::new(Opcode::SyncABIRegs).srcs(&[fp, sp]))
            .unwrap();
        m.push_inst(bb0, Inst::new(Opcode::ReqBindJmp).extra(Extra::BcOffset(4)))
            .unwrap();
        m.assert_well_formed();
    }

    #[test]
    #[should_panic(expected = "does not end with a terminal")]
    fn unterminated_block() {
        let mut m = Module::new(0);
        let bb0 = m.entry(TraceIdx::MAIN);
        m.push_inst(bb0, marker()).unwrap();
        m.push_inst(bb0, Inst::new(Opcode::DefFP)).unwrap();
        m.assert_well_formed();
    }

    #[test]
    #[should_panic(expected = "produces no value")]
    fn use_of_valueless_inst() {
        let mut m = Module::new(0);
        let bb0 = m.entry(TraceIdx::MAIN);
        let mk = m.push_inst(bb0, marker()).unwrap();
        let one = m.insert_const(Const::Int(1)).unwrap();
        m.push_inst(bb0, Inst::new(Opcode::OpAdd).srcs(&[one, one]))
            .unwrap();
        m.push_inst(bb0, Inst::new(Opcode::PrintInt).srcs(&[mk]))
            .unwrap();
        m.push_inst(bb0, Inst::new(Opcode::ReqBindJmp).extra(Extra::BcOffset(4)))
            .unwrap();
        m.assert_well_formed();
    }

    #[test]
    #[should_panic(expected = "has no taken block")]
    fn guard_without_target() {
        let mut m = Module::new(0);
        let bb0 = m.entry(TraceIdx::MAIN);
        m.push_inst(bb0, marker()).unwrap();
        m.push_inst(bb0, Inst::new(Opcode::ExitWhenSurprised))
            .unwrap();
        m.push_inst(bb0, Inst::new(Opcode::ReqBindJmp).extra(Extra::BcOffset(4)))
            .unwrap();
        m.assert_well_formed();
    }
}
