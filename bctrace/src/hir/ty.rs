//! The HIR type lattice.
//!
//! A [Ty] is a set of runtime kinds: the empty set is the bottom type `None` and every union of
//! bits is itself a valid type. Value kinds come in two flavours: the plain kinds that a cell can
//! directly hold, and "boxed" kinds, which describe a reference cell whose inner value has the
//! corresponding plain kind. The boxed bits are the plain bits shifted left by [BOXED_SHIFT].
//!
//! The remaining bits are non-value kinds (pointers, metaobjects, code addresses) which never
//! appear on the evaluation stack as program values, with the exception of [Ty::CLS], which class
//! reference instructions push.

use bitflags::bitflags;
use std::fmt;

/// How far the boxed bits are shifted relative to their unboxed equivalents.
const BOXED_SHIFT: u32 = 10;

bitflags! {
    #[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
    pub struct Ty: u32 {
        const UNINIT = 1 << 0;
        const INIT_NULL = 1 << 1;
        const BOOL = 1 << 2;
        const INT = 1 << 3;
        const DBL = 1 << 4;
        const STATIC_STR = 1 << 5;
        const COUNTED_STR = 1 << 6;
        const STATIC_ARR = 1 << 7;
        const COUNTED_ARR = 1 << 8;
        const OBJ = 1 << 9;

        const BOXED_UNINIT = 1 << 10;
        const BOXED_INIT_NULL = 1 << 11;
        const BOXED_BOOL = 1 << 12;
        const BOXED_INT = 1 << 13;
        const BOXED_DBL = 1 << 14;
        const BOXED_STATIC_STR = 1 << 15;
        const BOXED_COUNTED_STR = 1 << 16;
        const BOXED_STATIC_ARR = 1 << 17;
        const BOXED_COUNTED_ARR = 1 << 18;
        const BOXED_OBJ = 1 << 19;

        const CLS = 1 << 20;
        const FUNC = 1 << 21;
        const STK_PTR = 1 << 22;
        const FRAME_PTR = 1 << 23;
        const PTR_TO_GEN = 1 << 24;
        const RET_ADDR = 1 << 25;
        const CACHE_HANDLE = 1 << 26;
        const TCA = 1 << 27;

        const NULL = Self::UNINIT.bits() | Self::INIT_NULL.bits();
        const STR = Self::STATIC_STR.bits() | Self::COUNTED_STR.bits();
        const ARR = Self::STATIC_ARR.bits() | Self::COUNTED_ARR.bits();
        const UNCOUNTED_INIT = Self::INIT_NULL.bits()
            | Self::BOOL.bits()
            | Self::INT.bits()
            | Self::DBL.bits()
            | Self::STATIC_STR.bits()
            | Self::STATIC_ARR.bits();
        const UNCOUNTED = Self::UNCOUNTED_INIT.bits() | Self::UNINIT.bits();
        const CELL = Self::UNCOUNTED.bits()
            | Self::COUNTED_STR.bits()
            | Self::COUNTED_ARR.bits()
            | Self::OBJ.bits();
        const INIT_CELL = Self::CELL.bits() & !Self::UNINIT.bits();
        const BOXED_CELL = Self::CELL.bits() << BOXED_SHIFT;
        const GEN = Self::CELL.bits() | Self::BOXED_CELL.bits();
    }
}

/// Names for the types that print as a single word. Order matters: the first exact match wins.
const NAMED: &[(Ty, &str)] = &[
    (Ty::GEN, "Gen"),
    (Ty::CELL, "Cell"),
    (Ty::INIT_CELL, "InitCell"),
    (Ty::BOXED_CELL, "BoxedCell"),
    (Ty::UNCOUNTED, "Uncounted"),
    (Ty::UNCOUNTED_INIT, "UncountedInit"),
    (Ty::NULL, "Null"),
    (Ty::STR, "Str"),
    (Ty::ARR, "Arr"),
    (Ty::UNINIT, "Uninit"),
    (Ty::INIT_NULL, "InitNull"),
    (Ty::BOOL, "Bool"),
    (Ty::INT, "Int"),
    (Ty::DBL, "Dbl"),
    (Ty::STATIC_STR, "StaticStr"),
    (Ty::COUNTED_STR, "CountedStr"),
    (Ty::STATIC_ARR, "StaticArr"),
    (Ty::COUNTED_ARR, "CountedArr"),
    (Ty::OBJ, "Obj"),
    (Ty::CLS, "Cls"),
    (Ty::FUNC, "Func"),
    (Ty::STK_PTR, "StkPtr"),
    (Ty::FRAME_PTR, "FramePtr"),
    (Ty::PTR_TO_GEN, "PtrToGen"),
    (Ty::RET_ADDR, "RetAddr"),
    (Ty::CACHE_HANDLE, "CacheHandle"),
    (Ty::TCA, "TCA"),
];

impl Ty {
    /// The bottom type: no value has this type. Instructions that produce no value have this type.
    pub const NONE: Ty = Ty::empty();

    /// Is every value of `self` also a value of `other`? Note that `NONE` is a subtype of
    /// everything.
    pub fn subtype_of(self, other: Ty) -> bool {
        other.contains(self)
    }

    pub fn strict_subtype_of(self, other: Ty) -> bool {
        self != other && self.subtype_of(other)
    }

    pub fn subtype_of_any(self, others: &[Ty]) -> bool {
        others.iter().any(|x| self.subtype_of(*x))
    }

    /// Could a value of `self` also be a value of `other`?
    pub fn maybe(self, other: Ty) -> bool {
        self.intersects(other)
    }

    pub fn is_none(self) -> bool {
        self.is_empty()
    }

    fn is_nonempty_subtype(self, other: Ty) -> bool {
        !self.is_empty() && self.subtype_of(other)
    }

    pub fn is_null(self) -> bool {
        self.is_nonempty_subtype(Ty::NULL)
    }

    pub fn is_bool(self) -> bool {
        self.is_nonempty_subtype(Ty::BOOL)
    }

    pub fn is_int(self) -> bool {
        self.is_nonempty_subtype(Ty::INT)
    }

    pub fn is_dbl(self) -> bool {
        self.is_nonempty_subtype(Ty::DBL)
    }

    pub fn is_string(self) -> bool {
        self.is_nonempty_subtype(Ty::STR)
    }

    pub fn is_array(self) -> bool {
        self.is_nonempty_subtype(Ty::ARR)
    }

    pub fn is_obj(self) -> bool {
        self.is_nonempty_subtype(Ty::OBJ)
    }

    pub fn is_cls(self) -> bool {
        self.is_nonempty_subtype(Ty::CLS)
    }

    pub fn is_boxed(self) -> bool {
        self.is_nonempty_subtype(Ty::BOXED_CELL)
    }

    pub fn not_boxed(self) -> bool {
        self.is_nonempty_subtype(Ty::CELL)
    }

    pub fn maybe_boxed(self) -> bool {
        self.maybe(Ty::BOXED_CELL)
    }

    /// Might a value of this type carry a reference count?
    pub fn maybe_counted(self) -> bool {
        self.maybe(Ty::COUNTED_STR | Ty::COUNTED_ARR | Ty::OBJ | Ty::BOXED_CELL)
    }

    /// Might releasing a value of this type run a destructor?
    pub fn can_run_dtor(self) -> bool {
        self.maybe(Ty::OBJ | Ty::COUNTED_ARR | Ty::BOXED_OBJ | Ty::BOXED_COUNTED_ARR)
    }

    /// Does this type pin down a single runtime data type, so that a consumer never needs to
    /// inspect a type tag?
    pub fn is_known_data_type(self) -> bool {
        assert!(self.subtype_of(Ty::GEN), "{self} is not a program value type");
        if self.is_empty() {
            return false;
        }
        self.subtype_of_any(&[Ty::STR, Ty::ARR, Ty::NULL, Ty::BOXED_CELL])
            || self.bits().count_ones() == 1
    }

    pub fn is_known_unboxed_data_type(self) -> bool {
        self.not_boxed() && self.is_known_data_type()
    }

    /// Does a value of this type need a runtime type tag to be interpreted?
    pub fn needs_reg(self) -> bool {
        self.subtype_of(Ty::GEN) && !self.is_known_data_type()
    }

    /// The type of the value inside a box of type `self`.
    ///
    /// # Panics
    ///
    /// If `self` is not a boxed type.
    pub fn inner_type(self) -> Ty {
        assert!(self.is_boxed(), "inner_type of unboxed type {self}");
        Ty::from_bits_retain(self.bits() >> BOXED_SHIFT)
    }

    /// The type of a value after unboxing: plain kinds stay as they are and boxed kinds become
    /// their inner kinds.
    pub fn unbox(self) -> Ty {
        let inner = Ty::from_bits_retain((self & Ty::BOXED_CELL).bits() >> BOXED_SHIFT);
        (self - Ty::BOXED_CELL) | inner
    }

    /// The type of a box holding a value of type `self`. Uninitialized values are boxed as null.
    ///
    /// # Panics
    ///
    /// If `self` is not a subtype of [Ty::CELL].
    pub fn box_(self) -> Ty {
        assert!(self.subtype_of(Ty::CELL), "cannot box {self}");
        let t = if self.maybe(Ty::UNINIT) {
            (self - Ty::UNINIT) | Ty::INIT_NULL
        } else {
            self
        };
        Ty::from_bits_retain(t.bits() << BOXED_SHIFT)
    }

    /// The type of the value a pointer of this type points to. We only model pointers to `Gen`.
    pub fn deref(self) -> Ty {
        assert!(self.subtype_of(Ty::PTR_TO_GEN), "deref of non-pointer {self}");
        Ty::GEN
    }
}

impl fmt::Display for Ty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "None");
        }
        if let Some((_, n)) = NAMED.iter().find(|(t, _)| t == self) {
            return write!(f, "{n}");
        }
        // Greedily peel off the largest named subsets so that e.g. `Int|Str` prints that way
        // rather than as `Int|StaticStr|CountedStr`. Only boxed bits can be left over.
        let mut rest = *self;
        let mut parts = Vec::new();
        for (t, n) in NAMED {
            if t.subtype_of(rest) {
                parts.push((*n).to_owned());
                rest -= *t;
            }
        }
        if !rest.is_empty() {
            let inner = rest.inner_type().to_string();
            if inner.contains('|') {
                parts.push(format!("Boxed({inner})"));
            } else {
                parts.push(format!("Boxed{inner}"));
            }
        }
        write!(f, "{}", parts.join("|"))
    }
}
