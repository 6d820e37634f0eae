//! The decoded bytecode instructions the translator consumes.
//!
//! Decoding is not our business: the caller hands [crate::Translator::translate] one [Op] at a
//! time with its immediates already resolved into ids. Some immediates are the result of the
//! caller's own analysis of the surrounding code (e.g. whether a jump ends the tracelet, or which
//! function an `FCall` reaches), as the raw bytecode does not carry them.

use crate::{
    hir::Ty,
    unit::{ClassId, FuncId, LitstrId, NamedEntityId},
};

/// A bytecode offset, relative to the start of its unit.
pub type Offset = i32;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IncDecOp {
    PreInc,
    PostInc,
    PreDec,
    PostDec,
}

impl IncDecOp {
    pub fn is_pre(self) -> bool {
        matches!(self, IncDecOp::PreInc | IncDecOp::PreDec)
    }

    pub fn is_inc(self) -> bool {
        matches!(self, IncDecOp::PreInc | IncDecOp::PostInc)
    }
}

/// The operator of a `SetOpL`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SetOpOp {
    Plus,
    Minus,
    Mul,
    Div,
    Mod,
    Concat,
    And,
    Or,
    Xor,
    Sl,
    Sr,
}

/// The type tested by `IsTypeC` / `IsTypeL`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IsTypeOp {
    Null,
    Bool,
    Int,
    Dbl,
    Str,
    Arr,
    Obj,
}

impl IsTypeOp {
    pub fn ty(self) -> Ty {
        match self {
            IsTypeOp::Null => Ty::NULL,
            IsTypeOp::Bool => Ty::BOOL,
            IsTypeOp::Int => Ty::INT,
            IsTypeOp::Dbl => Ty::DBL,
            IsTypeOp::Str => Ty::STR,
            IsTypeOp::Arr => Ty::ARR,
            IsTypeOp::Obj => Ty::OBJ,
        }
    }
}

/// Which flavour of `FPushCuf*`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CufKind {
    Plain,
    /// `FPushCufF`: forward the current late static binding context.
    Forward,
    /// `FPushCufSafe`: a default value sits above the callable and a success flag is pushed.
    Safe,
}

/// A decoded bytecode instruction. Jump and iterator targets are absolute offsets; the tables of
/// `Switch` and `SSwitch` are relative to the switch itself.
#[derive(Clone, Debug, PartialEq)]
pub enum Op {
    // Basic stack manipulation.
    Nop,
    PopC,
    PopV,
    PopR,
    Dup,
    UnboxR,

    // Literals and constants.
    Null,
    NullUninit,
    True,
    False,
    Int(i64),
    Double(f64),
    String(LitstrId),
    Array(crate::unit::ArrayId),
    NewArray {
        capacity: u32,
    },
    NewTuple {
        num_args: u32,
    },
    ArrayAdd,
    AddElemC,
    AddNewElemC,
    NewCol {
        num_elems: u32,
    },
    ColAddElemC,
    ColAddNewElemC,
    Cns(LitstrId),
    CnsE(LitstrId),
    CnsU(LitstrId),
    DefCns(LitstrId),
    ClsCnsD {
        cns: LitstrId,
        cls: LitstrId,
    },
    Concat,

    // Operators.
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Xor,
    Not,
    BitAnd,
    BitOr,
    BitXor,
    BitNot,
    Same,
    NSame,
    Eq,
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
    CastBool,
    CastInt,
    CastDouble,
    CastString,
    CastArray,
    CastObject,
    InstanceOfD(LitstrId),
    Print,

    // Control flow.
    Jmp {
        target: Offset,
        /// Does this jump end the tracelet being translated?
        break_tracelet: bool,
    },
    /// A jump which never checks for surprise flags.
    JmpNS {
        target: Offset,
        break_tracelet: bool,
    },
    JmpZ(Offset),
    JmpNZ(Offset),
    Switch {
        /// Relative jump offsets. The last entry is the default case; if `bounded`, the
        /// penultimate entry is the case for the first non-zero value.
        targets: Vec<Offset>,
        base: i64,
        bounded: bool,
    },
    SSwitch {
        /// `(case literal, relative offset)` pairs.
        cases: Vec<(LitstrId, Offset)>,
        /// The relative offset of the default case.
        default: Offset,
    },
    RetC {
        free_inline: bool,
    },
    RetV {
        free_inline: bool,
    },

    // Reads and writes of locals, globals, and static properties. Ops on globals and static
    // properties take their name from the stack.
    CGetL(u32),
    CGetL2(u32),
    VGetL(u32),
    /// `result` is the predicted (or, if `inferred`, proven) type of the global.
    CGetG {
        result: Option<Ty>,
        inferred: bool,
    },
    CGetS {
        result: Option<Ty>,
        inferred: bool,
    },
    VGetG,
    VGetS,
    AGetC,
    AGetL(u32),
    IssetL(u32),
    IssetG,
    IssetS,
    EmptyL(u32),
    EmptyG,
    EmptyS,
    IsTypeC(IsTypeOp),
    IsTypeL(u32, IsTypeOp),
    SetL(u32),
    SetG,
    SetS,
    SetOpL {
        local: u32,
        op: SetOpOp,
    },
    IncDecL {
        local: u32,
        op: IncDecOp,
    },
    IncDecS(IncDecOp),
    BindL(u32),
    BindG,
    BindS,
    UnsetL(u32),
    UnsetG,
    UnsetN,
    /// A member (`$a[..]->..`) instruction. These always go through the interpreter.
    MInstr {
        popped: u32,
        result: Option<Ty>,
    },

    // Calls.
    FPushFunc {
        num_params: u32,
    },
    FPushFuncD {
        num_params: u32,
        func: NamedEntityId,
    },
    FPushFuncU {
        num_params: u32,
        func: NamedEntityId,
        fallback: NamedEntityId,
    },
    FPushObjMethodD {
        num_params: u32,
        name: LitstrId,
        /// The class of the receiver, if known.
        base_class: Option<ClassId>,
    },
    FPushClsMethodD {
        num_params: u32,
        name: LitstrId,
        cls: NamedEntityId,
    },
    /// `FPushClsMethodF` with its class and method name known.
    FPushClsMethodF {
        num_params: u32,
        name: LitstrId,
        cls: ClassId,
    },
    FPushCtor {
        num_params: u32,
    },
    FPushCtorD {
        num_params: u32,
        cls: LitstrId,
    },
    FPushCufIter {
        num_params: u32,
        iter: u32,
    },
    /// `FPushCuf`, `FPushCufF`, or `FPushCufSafe`, with whatever is known about the callable.
    FPushCuf {
        kind: CufKind,
        num_params: u32,
        callee: Option<FuncId>,
        cls: Option<ClassId>,
        inv_name: Option<LitstrId>,
    },
    FPassC,
    FPassV,
    FPassR,
    FCall {
        num_params: u32,
        callee: Option<FuncId>,
    },
    FCallArray,
    FCallBuiltin {
        num_args: u32,
        num_non_default: u32,
        func: NamedEntityId,
    },
    CreateCl {
        num_params: u32,
        name: LitstrId,
    },
    NativeImpl,

    // Iterators.
    IterInit {
        iter: u32,
        target: Offset,
        val: u32,
    },
    IterInitK {
        iter: u32,
        target: Offset,
        val: u32,
        key: u32,
    },
    WIterInit {
        iter: u32,
        target: Offset,
        val: u32,
    },
    WIterInitK {
        iter: u32,
        target: Offset,
        val: u32,
        key: u32,
    },
    IterNext {
        iter: u32,
        target: Offset,
        val: u32,
    },
    IterNextK {
        iter: u32,
        target: Offset,
        val: u32,
        key: u32,
    },
    WIterNext {
        iter: u32,
        target: Offset,
        val: u32,
    },
    WIterNextK {
        iter: u32,
        target: Offset,
        val: u32,
        key: u32,
    },
    IterFree(u32),
    DecodeCufIter {
        iter: u32,
        target: Offset,
    },
    CIterFree(u32),

    // Classes, objects, and functions.
    This,
    BareThis {
        notice: bool,
    },
    CheckThis,
    InitThisLoc(u32),
    StaticLocInit {
        local: u32,
        name: LitstrId,
    },
    LateBoundCls,
    Self_,
    Parent,
    VerifyParamType(u32),
    AKExists,
    ArrayIdx,
    DefCls,
    DefFunc,
    ClassExists,
    InterfaceExists,
    TraitExists,
    ReqDoc,

    // Generators.
    CreateCont(LitstrId),
    ContEnter,
    ContExit,
    UnpackCont,
    PackCont(i64),
    ContRetC,
    ContNext,
    ContSend,
    ContRaise,
    ContValid,
    ContCurrent,
    ContStopped,
    ContHandle,
}
