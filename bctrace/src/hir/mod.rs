//! The high-level IR (HIR) that the translator emits.
//!
//! A [Module] is an append-only arena of instructions, blocks, and traces. Each instruction
//! produces at most one SSA value, so an [InstIdx] doubles as a value reference: there is no
//! separate value table. Blocks hold an ordered list of [InstIdx]s; traces hold an ordered list of
//! [BlockIdx]s. Every trace other than the main trace has exactly one block.
//!
//! Constants are `DefConst` instructions that live in the instruction arena but in no block. They
//! are interned by value and print inline at their use sites, so `%3: Int = OpAdd 1, %2` means
//! "add the constant 1 to the value produced by instruction 3".
//!
//! Terminology:
//!
//!   * A *terminal* instruction transfers control out of the block that contains it (e.g. `Jmp_`,
//!     `ReqBindJmp`, `RetCtrl`). Every block ends with exactly one terminal instruction.
//!   * The *taken* block of an instruction is where control goes if the instruction's runtime
//!     precondition fails (for guards), if its condition holds (for conditional branches), or if
//!     it throws (for instructions with a catch trace).
//!
//! Abbreviations used throughout:
//!
//!   * `bc`: bytecode.
//!   * `fp` / `sp`: frame / stack pointer.
//!   * `tp`: type parameter.

use crate::{
    bytecode::Offset,
    unit::{ArrayId, ClassId, FuncId},
    TranslationError,
};
use indexmap::IndexMap;
use smallvec::SmallVec;
use std::{
    fmt,
    hash::{Hash, Hasher},
};
use strum::{Display, EnumCount};
use typed_index_collections::TiVec;

mod ty;
pub(crate) mod well_formed;

pub use ty::Ty;

/// The number of stack cells occupied by an activation record.
pub const ACT_REC_CELLS: i32 = 3;

/// Helper to create index overflow errors.
fn index_overflow(typ: &str) -> TranslationError {
    TranslationError::LimitExceeded(format!("index overflow: {typ}"))
}

// Generate common methods for 32-bit index types.
macro_rules! index_32bit {
    ($struct:ident) => {
        impl $struct {
            pub(crate) fn new(v: usize) -> Result<Self, TranslationError> {
                u32::try_from(v)
                    .map_err(|_| index_overflow(stringify!($struct)))
                    .map(Self)
            }
        }

        impl From<usize> for $struct {
            /// Required for TiVec. **Do not use internally as this can `panic`!** Instead, use
            /// [Self::new].
            fn from(v: usize) -> Self {
                Self::new(v).unwrap()
            }
        }

        impl From<$struct> for usize {
            fn from(s: $struct) -> usize {
                // `u32` always fits in `usize` on the platforms we support.
                s.0 as usize
            }
        }

        impl fmt::Display for $struct {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

/// An instruction index, which is also the identity of the SSA value the instruction produces.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct InstIdx(u32);
index_32bit!(InstIdx);

/// A block index.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct BlockIdx(u32);
index_32bit!(BlockIdx);

/// A trace index. The main trace is always [TraceIdx::MAIN].
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct TraceIdx(u32);
index_32bit!(TraceIdx);

impl TraceIdx {
    pub const MAIN: TraceIdx = TraceIdx(0);
}

static_assertions::assert_eq_size!(InstIdx, u32);
static_assertions::assert_eq_size!(Option<BlockIdx>, u64);

#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum TraceKind {
    #[strum(to_string = "main")]
    Main,
    #[strum(to_string = "exit")]
    Exit,
    #[strum(to_string = "side-exit")]
    SideExit,
    #[strum(to_string = "catch")]
    Catch,
}

#[derive(Debug)]
pub struct Trace {
    kind: TraceKind,
    /// The bytecode offset this trace was created for.
    bc_off: Offset,
    blocks: Vec<BlockIdx>,
}

impl Trace {
    pub fn kind(&self) -> TraceKind {
        self.kind
    }

    pub fn bc_off(&self) -> Offset {
        self.bc_off
    }

    pub fn blocks(&self) -> &[BlockIdx] {
        &self.blocks
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BlockHint {
    Neither,
    Unlikely,
}

#[derive(Debug)]
pub struct Block {
    trace: Option<TraceIdx>,
    hint: BlockHint,
    insts: Vec<InstIdx>,
}

impl Block {
    pub fn trace(&self) -> Option<TraceIdx> {
        self.trace
    }

    pub fn hint(&self) -> BlockHint {
        self.hint
    }

    pub fn insts(&self) -> &[InstIdx] {
        &self.insts
    }
}

/// The special runtime object fields that `LdRaw` / `StRaw` / `LdProp` / `StProp` address.
#[derive(Clone, Copy, Debug, Display, Eq, Hash, PartialEq)]
pub enum Field {
    ContArPtr,
    ContEntry,
    ContLabel,
    ContDone,
    ContRunning,
    ContValue,
    ContReceived,
    StrLen,
    FuncNumParams,
}

/// A constant value.
#[derive(Clone, Debug)]
pub enum Const {
    Int(i64),
    Dbl(f64),
    Bool(bool),
    /// A static string.
    Str(String),
    /// The static empty array.
    EmptyArr,
    /// A static array literal.
    Arr(ArrayId),
    Func(FuncId),
    Cls(ClassId),
    Null,
    InitNull,
    Uninit,
    Field(Field),
    /// The address of a named runtime helper.
    Helper(&'static str),
    CacheHandle(u32),
}

impl Const {
    pub fn ty(&self) -> Ty {
        match self {
            Const::Int(_) => Ty::INT,
            Const::Dbl(_) => Ty::DBL,
            Const::Bool(_) => Ty::BOOL,
            Const::Str(_) => Ty::STATIC_STR,
            Const::EmptyArr | Const::Arr(_) => Ty::STATIC_ARR,
            Const::Func(_) => Ty::FUNC,
            Const::Cls(_) => Ty::CLS,
            Const::Null => Ty::NULL,
            Const::InitNull => Ty::INIT_NULL,
            Const::Uninit => Ty::UNINIT,
            Const::Field(_) => Ty::INT,
            Const::Helper(_) => Ty::TCA,
            Const::CacheHandle(_) => Ty::CACHE_HANDLE,
        }
    }
}

impl From<i64> for Const {
    fn from(v: i64) -> Self {
        Const::Int(v)
    }
}

impl From<i32> for Const {
    fn from(v: i32) -> Self {
        Const::Int(i64::from(v))
    }
}

impl From<u32> for Const {
    fn from(v: u32) -> Self {
        Const::Int(i64::from(v))
    }
}

impl From<f64> for Const {
    fn from(v: f64) -> Self {
        Const::Dbl(v)
    }
}

impl From<bool> for Const {
    fn from(v: bool) -> Self {
        Const::Bool(v)
    }
}

impl From<&str> for Const {
    fn from(v: &str) -> Self {
        Const::Str(v.to_owned())
    }
}

impl fmt::Display for Const {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Const::Int(x) => write!(f, "{x}"),
            Const::Dbl(x) => write!(f, "{x:?}"),
            Const::Bool(x) => write!(f, "{x}"),
            Const::Str(x) => write!(f, "{x:?}"),
            Const::EmptyArr => write!(f, "array()"),
            Const::Arr(x) => write!(f, "array#{}", x.0),
            Const::Func(x) => write!(f, "func#{}", x.0),
            Const::Cls(x) => write!(f, "cls#{}", x.0),
            Const::Null => write!(f, "Null"),
            Const::InitNull => write!(f, "InitNull"),
            Const::Uninit => write!(f, "Uninit"),
            Const::Field(x) => write!(f, "#{x}"),
            Const::Helper(x) => write!(f, "@{x}"),
            Const::CacheHandle(x) => write!(f, "ch#{x}"),
        }
    }
}

/// Interning key for [Const]s. Doubles compare by bit pattern so that e.g. `0.0` and `-0.0` are
/// distinct constants and `NaN` can be interned at all.
#[derive(Debug)]
struct ConstKey(Const);

impl Hash for ConstKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(&self.0).hash(state);
        match &self.0 {
            Const::Int(x) => x.hash(state),
            Const::Dbl(x) => x.to_bits().hash(state),
            Const::Bool(x) => x.hash(state),
            Const::Str(x) => x.hash(state),
            Const::Arr(x) => x.hash(state),
            Const::Func(x) => x.hash(state),
            Const::Cls(x) => x.hash(state),
            Const::Field(x) => x.hash(state),
            Const::Helper(x) => x.hash(state),
            Const::CacheHandle(x) => x.hash(state),
            Const::EmptyArr | Const::Null | Const::InitNull | Const::Uninit => (),
        }
    }
}

impl PartialEq for ConstKey {
    fn eq(&self, other: &Self) -> bool {
        match (&self.0, &other.0) {
            (Const::Int(x), Const::Int(y)) => x == y,
            (Const::Dbl(x), Const::Dbl(y)) => x.to_bits() == y.to_bits(),
            (Const::Bool(x), Const::Bool(y)) => x == y,
            (Const::Str(x), Const::Str(y)) => x == y,
            (Const::Arr(x), Const::Arr(y)) => x == y,
            (Const::Func(x), Const::Func(y)) => x == y,
            (Const::Cls(x), Const::Cls(y)) => x == y,
            (Const::Field(x), Const::Field(y)) => x == y,
            (Const::Helper(x), Const::Helper(y)) => x == y,
            (Const::CacheHandle(x), Const::CacheHandle(y)) => x == y,
            (Const::EmptyArr, Const::EmptyArr)
            | (Const::Null, Const::Null)
            | (Const::InitNull, Const::InitNull)
            | (Const::Uninit, Const::Uninit) => true,
            _ => false,
        }
    }
}

impl Eq for ConstKey {}

/// A source position marker.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MarkerData {
    pub bc_off: Offset,
    pub func: FuncId,
    pub stack_off: i32,
}

/// The shape of an activation record written by `SpillFrame`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ActRecInfo {
    pub num_args: u32,
    /// The name passed to a magic `__call` method, if any.
    pub inv_name: Option<String>,
    /// Is this the frame of a constructor call?
    pub ctor: bool,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DefInlineFPData {
    pub target: FuncId,
    pub ret_bc_off: Offset,
    /// The caller's stack offset once the callee's activation record has been popped.
    pub ret_sp_off: i32,
    pub num_locals: u32,
    pub has_this: bool,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct JmpSwitchData {
    pub func: FuncId,
    pub base: i64,
    pub bounded: bool,
    pub cases: usize,
    pub default_off: Offset,
    pub targets: Vec<Offset>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LdSSwitchData {
    pub func: FuncId,
    pub cases: Vec<(String, Offset)>,
    pub default_off: Offset,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ClsCnsName {
    pub cls: String,
    pub cns: String,
}

/// Non-SSA data attached to an instruction.
#[derive(Clone, Debug, Default)]
pub enum Extra {
    #[default]
    None,
    Const(Const),
    Marker(MarkerData),
    LocalId(u32),
    StackOffset(i32),
    IterId(u32),
    BcOffset(Offset),
    ActRec(ActRecInfo),
    InlineFrame(DefInlineFPData),
    Switch(Box<JmpSwitchData>),
    SSwitch(Box<LdSSwitchData>),
    ClsCns(ClsCnsName),
    CallArray { pc: Offset, after: Offset },
    FPushCuf { num_args: u32, iter_id: u32 },
}

impl fmt::Display for Extra {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Extra::None => Ok(()),
            Extra::Const(c) => write!(f, "{c}"),
            Extra::Marker(MarkerData {
                bc_off,
                func,
                stack_off,
            }) => write!(f, "bc={bc_off} sp={stack_off} func#{}", func.0),
            Extra::LocalId(x) => write!(f, "loc {x}"),
            Extra::StackOffset(x) => write!(f, "off {x}"),
            Extra::IterId(x) => write!(f, "iter {x}"),
            Extra::BcOffset(x) => write!(f, "bc {x}"),
            Extra::ActRec(ActRecInfo {
                num_args,
                inv_name,
                ctor,
            }) => {
                write!(f, "args {num_args}")?;
                if let Some(x) = inv_name {
                    write!(f, " inv {x:?}")?;
                }
                if *ctor {
                    write!(f, " ctor")?;
                }
                Ok(())
            }
            Extra::InlineFrame(DefInlineFPData {
                target,
                ret_bc_off,
                ret_sp_off,
                ..
            }) => write!(f, "func#{} retbc {ret_bc_off} retsp {ret_sp_off}", target.0),
            Extra::Switch(x) => {
                write!(f, "base {} cases {} default {}", x.base, x.cases, x.default_off)?;
                if x.bounded {
                    write!(f, " bounded")?;
                }
                Ok(())
            }
            Extra::SSwitch(x) => {
                for (s, off) in &x.cases {
                    write!(f, "{s:?} -> {off}, ")?;
                }
                write!(f, "default -> {}", x.default_off)
            }
            Extra::ClsCns(ClsCnsName { cls, cns }) => write!(f, "{cls}::{cns}"),
            Extra::CallArray { pc, after } => write!(f, "pc {pc} after {after}"),
            Extra::FPushCuf { num_args, iter_id } => write!(f, "args {num_args} iter {iter_id}"),
        }
    }
}

/// How an opcode's result type is determined.
#[derive(Clone, Copy, Debug)]
enum Dest {
    /// No result.
    None,
    /// The result type is the instruction's type parameter.
    Param,
    /// The result always has this type.
    Fixed(Ty),
    /// The result type depends on the source types.
    Computed,
}

/// HIR opcodes.
#[derive(Clone, Copy, Debug, Display, EnumCount, Eq, Hash, PartialEq)]
pub enum Opcode {
    // Frame and stack plumbing.
    DefFP,
    DefSP,
    DefInlineFP,
    InlineReturn,
    ReDefSP,
    ReDefGeneratorSP,
    StashGeneratorSP,
    SpillStack,
    SpillFrame,
    CufIterSpillFrame,
    ExceptionBarrier,
    SyncABIRegs,
    Marker,
    DefConst,
    DefLabel,
    Nop,
    Mov,
    // Reference counting.
    IncRef,
    DecRef,
    DecRefStack,
    DecRefLoc,
    DecRefThis,
    DecRefNZOrBranch,
    // Loads and stores.
    LdStack,
    LdStackAddr,
    LdLoc,
    LdMem,
    LdProp,
    LdRef,
    LdRaw,
    StLoc,
    StMem,
    StMemNT,
    StProp,
    StRef,
    StRaw,
    Box,
    Unbox,
    BoxPtr,
    UnboxPtr,
    LdThis,
    LdCtx,
    LdCls,
    LdClsCached,
    LdClsCachedSafe,
    LdClsCtx,
    LdObjClass,
    LdClsCns,
    LookupClsCns,
    LdCns,
    LookupCns,
    CheckInit,
    DefCns,
    LdFunc,
    LdFuncCached,
    LdFuncCachedSafe,
    LdClsMethod,
    LdClsMethodCache,
    LdClsMethodFCache,
    LdObjMethod,
    LdClsCtor,
    GetCtxFwdCall,
    LdARFuncPtr,
    LdRetAddr,
    LdGblAddr,
    LdGblAddrDef,
    LdClsPropAddr,
    LdClsPropAddrCached,
    LdStaticLocCached,
    StaticLocInit,
    StaticLocInitCached,
    LdSwitchDblIndex,
    LdSwitchStrIndex,
    LdSwitchObjIndex,
    LdSSwitchDestFast,
    LdSSwitchDestSlow,
    // Guards and type assertions.
    GuardLoc,
    GuardStk,
    CheckLoc,
    CheckStk,
    AssertLoc,
    AssertStk,
    OverrideLoc,
    CheckType,
    AssertType,
    AssertStkVal,
    GuardRefs,
    DbgAssertType,
    ExitWhenSurprised,
    ExitOnVarEnv,
    ReleaseVVOrExit,
    // Arithmetic and logic.
    OpAdd,
    OpSub,
    OpMul,
    OpMod,
    OpBitAnd,
    OpBitOr,
    OpBitXor,
    OpBitNot,
    OpNot,
    OpLogicXor,
    OpGt,
    OpGte,
    OpLt,
    OpLte,
    OpEq,
    OpNeq,
    OpSame,
    OpNSame,
    // Conversions.
    ConvBoolToInt,
    ConvBoolToDbl,
    ConvBoolToStr,
    ConvBoolToArr,
    ConvDblToInt,
    ConvDblToStr,
    ConvDblToArr,
    ConvIntToDbl,
    ConvIntToStr,
    ConvIntToArr,
    ConvStrToInt,
    ConvStrToDbl,
    ConvStrToArr,
    ConvArrToInt,
    ConvArrToDbl,
    ConvObjToInt,
    ConvObjToDbl,
    ConvObjToStr,
    ConvObjToArr,
    ConvCellToBool,
    ConvCellToInt,
    ConvCellToDbl,
    ConvCellToStr,
    ConvCellToArr,
    ConvCellToObj,
    // Type tests.
    IsType,
    IsNType,
    IsNTypeMem,
    InstanceOf,
    InstanceOfBitmask,
    ExtendsClass,
    // Arrays, strings, and objects.
    NewArray,
    NewTuple,
    ArrayAdd,
    AddElemIntKey,
    AddElemStrKey,
    AddNewElem,
    ArrayIdx,
    AKExists,
    Concat,
    PrintStr,
    PrintInt,
    PrintBool,
    AllocObj,
    AllocObjFast,
    CreateCl,
    // Calls and returns.
    Call,
    CallArray,
    CallBuiltin,
    CastStk,
    NativeImpl,
    RetAdjustStack,
    GenericRetDecRefs,
    StRetVal,
    FreeActRec,
    RetCtrl,
    // Iterators.
    IterInit,
    IterInitK,
    IterNext,
    IterNextK,
    WIterInit,
    WIterInitK,
    WIterNext,
    WIterNextK,
    IterFree,
    DecodeCufIter,
    CIterFree,
    // Generators.
    CreateContFunc,
    CreateContMeth,
    FillContLocals,
    ContEnter,
    LinkContVarEnv,
    UnlinkContVarEnv,
    ContPreNext,
    ContStartedCheck,
    // Runtime errors.
    RaiseUninitLoc,
    RaiseWarning,
    VerifyParamCallable,
    VerifyParamFail,
    VerifyParamCls,
    // Statistics.
    IncStat,
    IncStatGrouped,
    IncTransCounter,
    // Control flow.
    Jmp_,
    JmpZero,
    JmpNZero,
    JmpSwitchDest,
    JmpIndirect,
    ReqBindJmp,
    ReqBindJmpNoIR,
    ReqRetranslate,
    ReqRetranslateNoIR,
    BeginCatch,
    EndCatch,
    InterpOne,
    InterpOneCF,
}

impl Opcode {
    fn dest(self) -> Dest {
        use Opcode::*;
        match self {
            DefFP | DefInlineFP | FreeActRec => Dest::Fixed(Ty::FRAME_PTR),
            DefSP | ReDefSP | ReDefGeneratorSP | StashGeneratorSP | SpillStack | SpillFrame
            | CufIterSpillFrame | ExceptionBarrier | Call | CallArray | RetAdjustStack
            | GenericRetDecRefs | InterpOne => Dest::Fixed(Ty::STK_PTR),
            DefConst | DefLabel | LdStack | LdLoc | LdMem | LdProp | LdRef | LdRaw | LdClsCns
            | LookupClsCns | LdCns | LookupCns | CallBuiltin | IterInit | IterInitK | IterNext
            | IterNextK | WIterInit | WIterInitK | WIterNext | WIterNextK | DecodeCufIter => {
                Dest::Param
            }
            Mov | IncRef | Box | Unbox | CheckType | AssertType | OpAdd | OpSub | OpMul => {
                Dest::Computed
            }
            LdStackAddr | BoxPtr | UnboxPtr | LdGblAddr | LdGblAddrDef
            | LdClsPropAddr | LdClsPropAddrCached => Dest::Fixed(Ty::PTR_TO_GEN),
            LdThis | AllocObj | AllocObjFast | CreateCl | CreateContFunc | CreateContMeth
            | ConvCellToObj => Dest::Fixed(Ty::OBJ),
            LdCtx | GetCtxFwdCall => Dest::Fixed(Ty::OBJ | Ty::CLS),
            LdCls | LdClsCached | LdClsCachedSafe | LdClsCtx | LdObjClass => Dest::Fixed(Ty::CLS),
            LdFunc | LdFuncCached | LdFuncCachedSafe | LdClsMethod | LdClsMethodCache
            | LdClsMethodFCache | LdClsCtor | LdARFuncPtr => Dest::Fixed(Ty::FUNC),
            LdRetAddr => Dest::Fixed(Ty::RET_ADDR),
            LdStaticLocCached | StaticLocInit | StaticLocInitCached => Dest::Fixed(Ty::BOXED_CELL),
            LdSwitchDblIndex | LdSwitchStrIndex | LdSwitchObjIndex => Dest::Fixed(Ty::INT),
            LdSSwitchDestFast | LdSSwitchDestSlow => Dest::Fixed(Ty::TCA),
            OpMod | OpBitAnd | OpBitOr | OpBitXor | OpBitNot => Dest::Fixed(Ty::INT),
            OpNot | OpLogicXor | OpGt | OpGte | OpLt | OpLte | OpEq | OpNeq | OpSame | OpNSame
            | DefCns | IsType | IsNType | IsNTypeMem | InstanceOf | InstanceOfBitmask
            | ExtendsClass | AKExists | ConvCellToBool => Dest::Fixed(Ty::BOOL),
            ConvBoolToInt | ConvDblToInt | ConvStrToInt | ConvArrToInt | ConvObjToInt
            | ConvCellToInt => Dest::Fixed(Ty::INT),
            ConvBoolToDbl | ConvIntToDbl | ConvStrToDbl | ConvArrToDbl | ConvObjToDbl
            | ConvCellToDbl => Dest::Fixed(Ty::DBL),
            ConvBoolToStr => Dest::Fixed(Ty::STATIC_STR),
            ConvDblToStr | ConvIntToStr | ConvObjToStr | ConvCellToStr | Concat => {
                Dest::Fixed(Ty::STR)
            }
            ConvBoolToArr | ConvDblToArr | ConvIntToArr | ConvStrToArr | ConvObjToArr
            | ConvCellToArr | NewArray | NewTuple | ArrayAdd | AddElemIntKey | AddElemStrKey
            | AddNewElem => Dest::Fixed(Ty::ARR),
            ArrayIdx => Dest::Fixed(Ty::CELL),
            InlineReturn | SyncABIRegs | Marker | Nop | DecRef | DecRefStack | DecRefLoc
            | DecRefThis | DecRefNZOrBranch | StLoc | StMem | StMemNT | StProp | StRef | StRaw
            | CheckInit | LdObjMethod | GuardLoc | GuardStk | CheckLoc | CheckStk | AssertLoc
            | AssertStk | OverrideLoc | AssertStkVal | GuardRefs | DbgAssertType
            | ExitWhenSurprised | ExitOnVarEnv | ReleaseVVOrExit | PrintStr | PrintInt
            | PrintBool | CastStk | NativeImpl | StRetVal | RetCtrl | IterFree | CIterFree
            | FillContLocals | ContEnter | LinkContVarEnv | UnlinkContVarEnv | ContPreNext
            | ContStartedCheck | RaiseUninitLoc | RaiseWarning | VerifyParamCallable
            | VerifyParamFail | VerifyParamCls | IncStat | IncStatGrouped | IncTransCounter
            | Jmp_ | JmpZero | JmpNZero | JmpSwitchDest | JmpIndirect | ReqBindJmp
            | ReqBindJmpNoIR | ReqRetranslate | ReqRetranslateNoIR | BeginCatch | EndCatch
            | InterpOneCF => Dest::None,
        }
    }

    /// Does this opcode unconditionally transfer control out of its block?
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Opcode::Jmp_
                | Opcode::JmpSwitchDest
                | Opcode::JmpIndirect
                | Opcode::ReqBindJmp
                | Opcode::ReqBindJmpNoIR
                | Opcode::ReqRetranslate
                | Opcode::ReqRetranslateNoIR
                | Opcode::RetCtrl
                | Opcode::EndCatch
                | Opcode::InterpOneCF
        )
    }

    /// Must an instruction with this opcode have a taken block?
    pub fn requires_taken(self) -> bool {
        matches!(
            self,
            Opcode::Jmp_
                | Opcode::JmpZero
                | Opcode::JmpNZero
                | Opcode::CheckLoc
                | Opcode::CheckStk
                | Opcode::CheckType
                | Opcode::CheckInit
                | Opcode::ExitWhenSurprised
                | Opcode::ExitOnVarEnv
                | Opcode::ReleaseVVOrExit
                | Opcode::DecRefNZOrBranch
                | Opcode::LdStaticLocCached
                | Opcode::ContPreNext
                | Opcode::ContStartedCheck
        )
    }

    /// Does the type of this opcode's result depend on a type parameter?
    pub fn has_type_param(self) -> bool {
        matches!(self.dest(), Dest::Param)
    }
}

/// An instruction.
#[derive(Clone, Debug)]
pub struct Inst {
    opcode: Opcode,
    tp: Option<Ty>,
    srcs: SmallVec<[InstIdx; 3]>,
    extra: Extra,
    taken: Option<BlockIdx>,
    /// The type of this instruction's result. Computed when the instruction is pushed.
    ty: Ty,
}

impl Inst {
    pub fn new(opcode: Opcode) -> Self {
        Self {
            opcode,
            tp: None,
            srcs: SmallVec::new(),
            extra: Extra::None,
            taken: None,
            ty: Ty::NONE,
        }
    }

    /// Set this instruction's type parameter.
    pub fn tp(mut self, tp: Ty) -> Self {
        self.tp = Some(tp);
        self
    }

    pub fn extra(mut self, extra: Extra) -> Self {
        self.extra = extra;
        self
    }

    pub fn srcs(mut self, srcs: &[InstIdx]) -> Self {
        self.srcs.extend_from_slice(srcs);
        self
    }

    pub fn taken(mut self, b: BlockIdx) -> Self {
        self.taken = Some(b);
        self
    }

    /// Set the taken block to `b` if `b` is not `None`.
    pub fn maybe_taken(mut self, b: Option<BlockIdx>) -> Self {
        self.taken = b;
        self
    }

    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    pub fn type_param(&self) -> Option<Ty> {
        self.tp
    }

    pub fn src(&self, i: usize) -> InstIdx {
        self.srcs[i]
    }

    pub fn src_vals(&self) -> &[InstIdx] {
        &self.srcs
    }

    pub fn extra_data(&self) -> &Extra {
        &self.extra
    }

    pub fn taken_block(&self) -> Option<BlockIdx> {
        self.taken
    }

    pub fn ty(&self) -> Ty {
        self.ty
    }

    pub fn local_id(&self) -> Option<u32> {
        match self.extra {
            Extra::LocalId(x) => Some(x),
            _ => None,
        }
    }
}

/// The top-level container for HIR.
#[derive(Debug)]
pub struct Module {
    insts: TiVec<InstIdx, Inst>,
    blocks: TiVec<BlockIdx, Block>,
    traces: TiVec<TraceIdx, Trace>,
    /// Interned constants: each maps to a `DefConst` instruction that is in no block.
    consts: IndexMap<ConstKey, InstIdx>,
}

impl Module {
    /// Create a new [Module] with an empty main trace starting at bytecode offset `bc_off`.
    pub fn new(bc_off: Offset) -> Self {
        let mut m = Module {
            insts: TiVec::new(),
            blocks: TiVec::new(),
            traces: TiVec::new(),
            consts: IndexMap::new(),
        };
        m.traces.push(Trace {
            kind: TraceKind::Main,
            bc_off,
            blocks: Vec::new(),
        });
        m.blocks.push(Block {
            trace: Some(TraceIdx::MAIN),
            hint: BlockHint::Neither,
            insts: Vec::new(),
        });
        m.traces[TraceIdx::MAIN].blocks.push(BlockIdx(0));
        m
    }

    pub fn inst(&self, idx: InstIdx) -> &Inst {
        &self.insts[idx]
    }

    /// The type of the value produced by `idx`.
    pub fn ty(&self, idx: InstIdx) -> Ty {
        self.insts[idx].ty
    }

    pub fn block(&self, idx: BlockIdx) -> &Block {
        &self.blocks[idx]
    }

    pub fn trace(&self, idx: TraceIdx) -> &Trace {
        &self.traces[idx]
    }

    pub fn traces(&self) -> impl Iterator<Item = (TraceIdx, &Trace)> {
        self.traces.iter_enumerated()
    }

    pub fn traces_len(&self) -> usize {
        self.traces.len()
    }

    /// The first block of trace `idx`.
    pub fn entry(&self, idx: TraceIdx) -> BlockIdx {
        self.traces[idx].blocks[0]
    }

    /// Iterate over the instructions of trace `idx` in block order.
    pub fn trace_insts(&self, idx: TraceIdx) -> impl Iterator<Item = InstIdx> + '_ {
        self.traces[idx]
            .blocks
            .iter()
            .flat_map(|b| self.blocks[*b].insts.iter().copied())
    }

    /// If `idx` is a constant, return its value.
    pub fn const_val(&self, idx: InstIdx) -> Option<&Const> {
        let inst = &self.insts[idx];
        match (&inst.opcode, &inst.extra) {
            (Opcode::DefConst, Extra::Const(c)) => Some(c),
            _ => None,
        }
    }

    pub fn is_const(&self, idx: InstIdx) -> bool {
        self.const_val(idx).is_some()
    }

    /// If `idx` is an integer constant, return its value.
    pub fn const_int(&self, idx: InstIdx) -> Option<i64> {
        match self.const_val(idx) {
            Some(Const::Int(x)) => Some(*x),
            _ => None,
        }
    }

    /// Create a new auxiliary trace with a single, empty, block.
    pub(crate) fn new_trace(
        &mut self,
        kind: TraceKind,
        bc_off: Offset,
    ) -> Result<TraceIdx, TranslationError> {
        assert_ne!(kind, TraceKind::Main);
        let tidx = TraceIdx::new(self.traces.len())?;
        let bidx = self.new_block(BlockHint::Neither)?;
        self.traces.push(Trace {
            kind,
            bc_off,
            blocks: Vec::new(),
        });
        self.append_block(tidx, bidx);
        Ok(tidx)
    }

    /// Create a new block which is not yet part of any trace.
    pub(crate) fn new_block(&mut self, hint: BlockHint) -> Result<BlockIdx, TranslationError> {
        let bidx = BlockIdx::new(self.blocks.len())?;
        self.blocks.push(Block {
            trace: None,
            hint,
            insts: Vec::new(),
        });
        Ok(bidx)
    }

    /// Append the detached block `bidx` to the end of trace `tidx`.
    pub(crate) fn append_block(&mut self, tidx: TraceIdx, bidx: BlockIdx) {
        assert!(self.blocks[bidx].trace.is_none(), "block {bidx} already placed");
        self.blocks[bidx].trace = Some(tidx);
        self.traces[tidx].blocks.push(bidx);
    }

    /// Compute `inst`'s result type, append it to block `bidx` and return its index.
    pub(crate) fn push_inst(
        &mut self,
        bidx: BlockIdx,
        mut inst: Inst,
    ) -> Result<InstIdx, TranslationError> {
        assert!(
            !matches!(inst.opcode, Opcode::DefConst),
            "constants must be created with insert_const"
        );
        inst.ty = self.output_type(&inst);
        let iidx = InstIdx::new(self.insts.len())?;
        self.insts.push(inst);
        self.blocks[bidx].insts.push(iidx);
        Ok(iidx)
    }

    /// Insert an instruction at position `pos` of block `bidx`.
    pub(crate) fn insert_inst(
        &mut self,
        bidx: BlockIdx,
        pos: usize,
        mut inst: Inst,
    ) -> Result<InstIdx, TranslationError> {
        inst.ty = self.output_type(&inst);
        let iidx = InstIdx::new(self.insts.len())?;
        self.insts.push(inst);
        self.blocks[bidx].insts.insert(pos, iidx);
        Ok(iidx)
    }

    /// Intern `c`, returning the `DefConst` instruction that defines it.
    pub(crate) fn insert_const(&mut self, c: Const) -> Result<InstIdx, TranslationError> {
        let key = ConstKey(c);
        if let Some(x) = self.consts.get(&key) {
            return Ok(*x);
        }
        let iidx = InstIdx::new(self.insts.len())?;
        let ty = key.0.ty();
        self.insts.push(Inst {
            opcode: Opcode::DefConst,
            tp: Some(ty),
            srcs: SmallVec::new(),
            extra: Extra::Const(key.0.clone()),
            taken: None,
            ty,
        });
        self.consts.insert(key, iidx);
        Ok(iidx)
    }

    /// What result type does `inst` produce given the current types of its sources?
    pub(crate) fn output_type(&self, inst: &Inst) -> Ty {
        match inst.opcode.dest() {
            Dest::None => Ty::NONE,
            Dest::Fixed(t) => t,
            Dest::Param => inst
                .tp
                .unwrap_or_else(|| panic!("{} requires a type parameter", inst.opcode)),
            Dest::Computed => {
                let src_ty = |i: usize| self.insts[inst.srcs[i]].ty;
                match inst.opcode {
                    Opcode::Mov | Opcode::IncRef => src_ty(0),
                    Opcode::Box => src_ty(0).box_(),
                    Opcode::Unbox => src_ty(0).unbox(),
                    Opcode::CheckType | Opcode::AssertType => {
                        let tp = inst.tp.unwrap_or_else(|| {
                            panic!("{} requires a type parameter", inst.opcode)
                        });
                        let t = tp & src_ty(0);
                        if t.is_empty() {
                            tp
                        } else {
                            t
                        }
                    }
                    Opcode::OpAdd | Opcode::OpSub | Opcode::OpMul => {
                        if src_ty(0).is_int() && src_ty(1).is_int() {
                            Ty::INT
                        } else {
                            Ty::DBL
                        }
                    }
                    x => unreachable!("{x}"),
                }
            }
        }
    }

    /// Narrow the type parameter and result type of `idx` to `ty`.
    pub(crate) fn set_type_param(&mut self, idx: InstIdx, ty: Ty) {
        let inst = &mut self.insts[idx];
        inst.tp = Some(ty);
        inst.ty = ty;
    }

    /// Set the result type of `idx` without touching its type parameter.
    pub(crate) fn set_ty(&mut self, idx: InstIdx, ty: Ty) {
        self.insts[idx].ty = ty;
    }

    /// Return a [fmt::Display]able version of the instruction at `idx`.
    pub fn display_inst(&self, idx: InstIdx) -> DisplayableInst<'_> {
        DisplayableInst { m: self, idx }
    }

    fn fmt_operand(&self, f: &mut fmt::Formatter<'_>, idx: InstIdx) -> fmt::Result {
        match self.const_val(idx) {
            Some(c) => write!(f, "{c}"),
            None => write!(f, "%{idx}"),
        }
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (tidx, trace) in self.traces.iter_enumerated() {
            writeln!(f, "trace {tidx} ({}):", trace.kind)?;
            for bidx in &trace.blocks {
                let block = &self.blocks[*bidx];
                match block.hint {
                    BlockHint::Neither => writeln!(f, "  bb{bidx}:")?,
                    BlockHint::Unlikely => writeln!(f, "  bb{bidx}: unlikely")?,
                }
                for iidx in &block.insts {
                    writeln!(f, "    {}", self.display_inst(*iidx))?;
                }
            }
        }
        Ok(())
    }
}

pub struct DisplayableInst<'a> {
    m: &'a Module,
    idx: InstIdx,
}

impl fmt::Display for DisplayableInst<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inst = self.m.inst(self.idx);
        if !inst.ty.is_none() {
            write!(f, "%{}: {} = ", self.idx, inst.ty)?;
        }
        write!(f, "{}", inst.opcode)?;
        if let Some(tp) = inst.tp {
            write!(f, "<{tp}>")?;
        }
        if !matches!(inst.extra, Extra::None) {
            write!(f, " [{}]", inst.extra)?;
        }
        for (i, src) in inst.srcs.iter().enumerate() {
            if i == 0 {
                write!(f, " ")?;
            } else {
                write!(f, ", ")?;
            }
            self.m.fmt_operand(f, *src)?;
        }
        if let Some(b) = inst.taken {
            write!(f, " -> bb{b}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn const_interning() {
        let mut m = Module::new(0);
        let a = m.insert_const(Const::Int(3)).unwrap();
        let b = m.insert_const(Const::Int(3)).unwrap();
        let c = m.insert_const(Const::Dbl(0.0)).unwrap();
        let d = m.insert_const(Const::Dbl(-0.0)).unwrap();
        let e = m.insert_const(Const::Dbl(f64::NAN)).unwrap();
        let f = m.insert_const(Const::Dbl(f64::NAN)).unwrap();
        assert_eq!(a, b);
        assert_ne!(c, d);
        assert_eq!(e, f);
        assert_eq!(m.ty(a), Ty::INT);
        assert_eq!(m.const_int(a), Some(3));
        // Constants never appear in a block.
        assert_eq!(m.trace_insts(TraceIdx::MAIN).count(), 0);
    }

    #[test]
    fn print_module() {
        let mut m = Module::new(0);
        let bb0 = m.entry(TraceIdx::MAIN);
        let fp = m.push_inst(bb0, Inst::new(Opcode::DefFP)).unwrap();
        let sp = m
            .push_inst(
                bb0,
                Inst::new(Opcode::DefSP)
                    .extra(Extra::StackOffset(2))
                    .srcs(&[fp]),
            )
            .unwrap();
        let one = m.insert_const(Const::Int(1)).unwrap();
        let ld = m
            .push_inst(
                bb0,
                Inst::new(Opcode::LdStack)
                    .tp(Ty::INT)
                    .extra(Extra::StackOffset(0))
                    .srcs(&[sp]),
            )
            .unwrap();
        m.push_inst(bb0, Inst::new(Opcode::OpAdd).srcs(&[ld, one]))
            .unwrap();
        let exit = m.new_trace(TraceKind::Exit, 7).unwrap();
        let eb = m.entry(exit);
        m.push_inst(
            eb,
            Inst::new(Opcode::ReqBindJmp).extra(Extra::BcOffset(7)),
        )
        .unwrap();
        m.push_inst(bb0, Inst::new(Opcode::Jmp_).taken(eb)).unwrap();
        assert_eq!(
            m.to_string(),
            [
                "trace 0 (main):",
                "  bb0:",
                "    %0: FramePtr = DefFP",
                "    %1: StkPtr = DefSP [off 2] %0",
                "    %3: Int = LdStack<Int> [off 0] %1",
                "    %4: Int = OpAdd %3, 1",
                "    Jmp_ -> bb1",
                "trace 1 (exit):",
                "  bb1:",
                "    ReqBindJmp [bc 7]",
                ""
            ]
            .join("\n")
        );
    }

    #[test]
    fn index_overflow_is_an_error() {
        assert!(InstIdx::new(usize::try_from(u32::MAX).unwrap()).is_ok());
        #[cfg(target_pointer_width = "64")]
        assert!(matches!(
            InstIdx::new(usize::try_from(u32::MAX).unwrap() + 1),
            Err(TranslationError::LimitExceeded(_))
        ));
    }
}
