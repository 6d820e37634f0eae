//! The metadata the translator needs about the code it translates.
//!
//! The translator does not own or decode any of this: it is handed a `&dyn Unit` and asks it to
//! resolve the ids embedded in [crate::bytecode::Op]s into functions, classes, literals, and named
//! entities. A `Unit` is also the translator's oracle for questions whose answers depend on the
//! runtime's class hierarchy, such as which method a call site will reach.

use crate::{bytecode::Offset, hir::Const, hir::Ty};
use bitflags::bitflags;

macro_rules! id {
    ($(#[$attr:meta])* $name:ident) => {
        $(#[$attr])*
        #[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
        pub struct $name(pub u32);
    };
}

id!(
    /// A function id.
    FuncId
);
id!(
    /// A class id.
    ClassId
);
id!(
    /// An index into a unit's string literal table.
    LitstrId
);
id!(
    /// An index into a unit's array literal table.
    ArrayId
);
id!(
    /// An index into a unit's named entity table.
    NamedEntityId
);

bitflags! {
    /// Attributes of functions and classes.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct Attrs: u32 {
        const STATIC = 1 << 0;
        const PRIVATE = 1 << 1;
        const PUBLIC = 1 << 2;
        const ABSTRACT = 1 << 3;
        const INTERFACE = 1 << 4;
        const TRAIT = 1 << 5;
        /// The class or function has exactly one definition program-wide.
        const UNIQUE = 1 << 6;
        /// The class or function is bound for the lifetime of the process, so it can be burned
        /// into code as a constant.
        const PERSISTENT = 1 << 7;
        /// The function's frame may be captured by a variable environment (`extract`, `$$x`...).
        const MAY_USE_VV = 1 << 8;
        const GENERATOR = 1 << 9;
        const CLOSURE_BODY = 1 << 10;
        const GENERATOR_FROM_CLOSURE = 1 << 11;
        const PSEUDOMAIN = 1 << 12;
        /// The function's return value is returned by reference.
        const REFERENCE = 1 << 13;
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub enum TypeConstraintKind {
    /// Anything goes.
    #[default]
    None,
    /// A primitive type hint, such as `int`.
    Primitive(Ty),
    Callable,
    /// A class, interface, or typedef name.
    Object(String),
    Self_,
    Parent,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TypeConstraint {
    pub kind: TypeConstraintKind,
    pub nullable: bool,
}

impl TypeConstraint {
    pub fn is_callable(&self) -> bool {
        matches!(self.kind, TypeConstraintKind::Callable)
    }

    pub fn is_object_or_typedef(&self) -> bool {
        matches!(
            self.kind,
            TypeConstraintKind::Object(_) | TypeConstraintKind::Self_ | TypeConstraintKind::Parent
        )
    }

    /// Does a value of type `ty` satisfy this (non-object) constraint?
    pub fn check_primitive(&self, ty: Ty) -> bool {
        match &self.kind {
            TypeConstraintKind::None => true,
            TypeConstraintKind::Primitive(t) => ty.subtype_of(*t),
            _ => false,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ParamInfo {
    pub type_constraint: TypeConstraint,
    /// For builtins: the type the argument is cast to before the call. `None` for parameters that
    /// are passed as-is.
    pub builtin_type: Option<Ty>,
}

#[derive(Clone, Debug, Default)]
pub struct Func {
    pub id: FuncId,
    pub name: String,
    /// The offset of the first bytecode of this function.
    pub base: Offset,
    /// One past the offset of the last bytecode of this function.
    pub past: Offset,
    pub params: Vec<ParamInfo>,
    /// The number of locals, including parameters.
    pub num_locals: u32,
    /// The names of named locals, indexed by local id.
    pub local_names: Vec<String>,
    pub cls: Option<ClassId>,
    pub attrs: Attrs,
    /// The slot of this method in its class's method table.
    pub method_slot: u32,
    /// For builtins: the type of the return value.
    pub return_type: Option<Ty>,
}

impl Func {
    pub fn num_params(&self) -> usize {
        self.params.len()
    }

    pub fn is_static(&self) -> bool {
        self.attrs.contains(Attrs::STATIC)
    }

    pub fn is_method(&self) -> bool {
        self.cls.is_some()
    }

    pub fn is_generator(&self) -> bool {
        self.attrs.contains(Attrs::GENERATOR)
    }

    pub fn is_closure_body(&self) -> bool {
        self.attrs.contains(Attrs::CLOSURE_BODY)
    }

    pub fn is_generator_from_closure(&self) -> bool {
        self.attrs.contains(Attrs::GENERATOR_FROM_CLOSURE)
    }

    pub fn is_pseudomain(&self) -> bool {
        self.attrs.contains(Attrs::PSEUDOMAIN)
    }

    pub fn is_non_closure_method(&self) -> bool {
        self.is_method() && !self.is_closure_body()
    }

    /// Could this function's frame have a `$this`?
    pub fn may_have_this(&self) -> bool {
        self.is_method() && !self.is_static()
    }

    pub fn may_use_vv(&self) -> bool {
        self.attrs.contains(Attrs::MAY_USE_VV)
    }

    /// Return the local id of the local named `name`.
    pub fn lookup_var_id(&self, name: &str) -> Option<u32> {
        self.local_names
            .iter()
            .position(|x| x == name)
            .and_then(|x| u32::try_from(x).ok())
    }
}

#[derive(Clone, Debug, Default)]
pub struct Class {
    pub id: ClassId,
    pub name: String,
    pub parent: Option<ClassId>,
    pub attrs: Attrs,
    pub ctor: Option<FuncId>,
}

impl Class {
    pub fn is_unique(&self) -> bool {
        self.attrs.contains(Attrs::UNIQUE)
    }

    pub fn is_persistent(&self) -> bool {
        self.attrs.contains(Attrs::PERSISTENT)
    }

    /// Is this a class, as opposed to an interface or trait?
    pub fn is_normal(&self) -> bool {
        !self.attrs.intersects(Attrs::INTERFACE | Attrs::TRAIT)
    }

    pub fn can_instantiate(&self) -> bool {
        !self
            .attrs
            .intersects(Attrs::ABSTRACT | Attrs::INTERFACE | Attrs::TRAIT)
    }
}

/// A name paired with the id of the runtime cache slot that binds it.
#[derive(Clone, Debug)]
pub struct NamedEntity {
    pub name: String,
    pub id: NamedEntityId,
}

/// The outcome of resolving a method call at translation time.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MethodLookup {
    /// The call always reaches `func`.
    Resolved { func: FuncId, magic_call: bool },
    /// The call reaches whichever method occupies `slot` in the receiver's class. `has_this` is
    /// false if that method is static.
    Slot { slot: u32, has_this: bool },
    /// Nothing is known: the method must be looked up by name at run-time.
    NeedsRuntimeLookup,
}

/// The metadata services the translator consults.
pub trait Unit {
    fn func(&self, id: FuncId) -> Option<&Func>;
    fn class(&self, id: ClassId) -> Option<&Class>;
    fn litstr(&self, id: LitstrId) -> Option<&str>;
    fn array(&self, id: ArrayId) -> Option<&[Const]>;
    fn named_entity(&self, id: NamedEntityId) -> Option<&NamedEntity>;

    /// Return the function currently bound to the named entity `id`, if known.
    fn lookup_func(&self, id: NamedEntityId) -> Option<FuncId>;
    fn lookup_func_by_name(&self, name: &str) -> Option<FuncId>;
    /// Return the class named `name` if it is defined and unique.
    fn lookup_unique_class(&self, name: &str) -> Option<ClassId>;
    /// Return the class named `name` if it is defined at all.
    fn lookup_class(&self, name: &str) -> Option<ClassId>;
    /// Return the value of the persistent constant `name`, if there is one.
    fn lookup_persistent_cns(&self, name: &str) -> Option<Const>;

    /// Resolve `name` as an instance method call on an object whose class is `base` (or a
    /// subclass of it), from the class context `ctx`.
    fn lookup_obj_method(
        &self,
        base: Option<ClassId>,
        name: &str,
        ctx: Option<ClassId>,
    ) -> MethodLookup;
    /// Resolve `name` as a static method call on `cls` from the class context `ctx`. Never
    /// returns [MethodLookup::Slot].
    fn lookup_cls_method(
        &self,
        cls: Option<ClassId>,
        name: &str,
        ctx: Option<ClassId>,
    ) -> MethodLookup;

    /// Is the binding of `func`'s name fixed for every request?
    fn is_name_binding_immutable(&self, func: FuncId) -> bool;
    /// Does the runtime keep an instance-of bit for the class named `name`?
    fn has_instance_bit(&self, name: &str) -> bool;
    /// Is `cls` the same class as, or a subclass of, `base`?
    fn class_of(&self, cls: ClassId, base: ClassId) -> bool;
    /// Return the offset of the bytecode after the one at `off`.
    fn advance(&self, func: FuncId, off: Offset) -> Offset;
}
