//! Narrowing the types of already-emitted values.

use super::Translator;
use crate::hir::{InstIdx, Opcode, Ty};

impl Translator<'_> {
    /// If `ty` is strictly narrower than the type of `v`, narrow `v` to `ty`.
    ///
    /// Values produced by `Mov` and `IncRef` are narrowed by narrowing their source and then
    /// recomputing their type. Otherwise only instructions whose result type is their type
    /// parameter can be narrowed.
    ///
    /// # Panics
    ///
    /// If `v` needs narrowing but is produced by an instruction that doesn't take a type
    /// parameter.
    pub(super) fn refine_type(&mut self, v: InstIdx, ty: Ty) {
        let cur = self.m.ty(v);
        if !ty.strict_subtype_of(cur) {
            return;
        }
        let inst = self.m.inst(v);
        match inst.opcode() {
            // Constants are interned, so narrowing one would narrow every use of it.
            Opcode::DefConst => (),
            Opcode::Mov | Opcode::IncRef => {
                let src = inst.src(0);
                self.refine_type(src, ty);
                let out = self.m.output_type(self.m.inst(v));
                self.m.set_ty(v, out);
            }
            _ if cur.is_null() && ty.is_null() => self.m.set_ty(v, ty),
            Opcode::LdLoc
            | Opcode::LdStack
            | Opcode::LdMem
            | Opcode::LdProp
            | Opcode::LdRef
            | Opcode::DefLabel => {
                self.m.set_type_param(v, ty);
                debug_assert_eq!(self.m.output_type(self.m.inst(v)), ty);
            }
            x => panic!(
                "Can't narrow {} (produced by {x}) to {ty}:\n  {}",
                cur,
                self.m.display_inst(v)
            ),
        }
    }
}
