//! Helpers for tests: an in-memory [Unit] and HIR pattern matching.

use crate::{
    bytecode::{Offset, Op},
    config::TranslatorConfig,
    hir::{Const, Module},
    translate::Translator,
    unit::{
        ArrayId, Class, ClassId, Func, FuncId, LitstrId, MethodLookup, NamedEntity, NamedEntityId,
        Unit,
    },
};
use fm::FMBuilder;
use regex::Regex;
use std::{
    collections::{HashMap, HashSet},
    sync::OnceLock,
};

/// The number of locals of the function [TestUnit::new] creates.
pub(crate) const MAIN_LOCALS: u32 = 4;

/// A [Unit] whose contents are set up by the test. Function 0 is always `main`, a function with
/// locals `$a`..`$d`, whose bytecodes are one offset apart.
pub(crate) struct TestUnit {
    funcs: Vec<Func>,
    classes: Vec<Class>,
    litstrs: Vec<String>,
    arrays: Vec<Vec<Const>>,
    named: Vec<NamedEntity>,
    bound_funcs: HashMap<NamedEntityId, FuncId>,
    persistent_cns: HashMap<String, Const>,
    obj_methods: HashMap<String, MethodLookup>,
    cls_methods: HashMap<String, MethodLookup>,
    immutable: HashSet<FuncId>,
    instance_bits: HashSet<String>,
}

impl TestUnit {
    pub(crate) fn new() -> Self {
        let main = Func {
            name: "main".to_owned(),
            base: 0,
            past: 1000,
            num_locals: MAIN_LOCALS,
            local_names: ["a", "b", "c", "d"].map(String::from).to_vec(),
            ..Default::default()
        };
        Self {
            funcs: vec![main],
            classes: Vec::new(),
            litstrs: Vec::new(),
            arrays: Vec::new(),
            named: Vec::new(),
            bound_funcs: HashMap::new(),
            persistent_cns: HashMap::new(),
            obj_methods: HashMap::new(),
            cls_methods: HashMap::new(),
            immutable: HashSet::new(),
            instance_bits: HashSet::new(),
        }
    }

    /// A translator for `main` starting at offset 0 with an empty stack.
    pub(crate) fn translator(&self) -> Translator<'_> {
        self.translator_with(TranslatorConfig::default())
    }

    pub(crate) fn translator_with(&self, cfg: TranslatorConfig) -> Translator<'_> {
        Translator::new(self, cfg, FuncId(0), 0, i32::try_from(MAIN_LOCALS).unwrap()).unwrap()
    }

    pub(crate) fn main_mut(&mut self) -> &mut Func {
        &mut self.funcs[0]
    }

    pub(crate) fn add_func(&mut self, mut f: Func) -> FuncId {
        let id = FuncId(u32::try_from(self.funcs.len()).unwrap());
        f.id = id;
        self.funcs.push(f);
        id
    }

    pub(crate) fn add_class(&mut self, mut c: Class) -> ClassId {
        let id = ClassId(u32::try_from(self.classes.len()).unwrap());
        c.id = id;
        self.classes.push(c);
        id
    }

    pub(crate) fn litstr(&mut self, s: &str) -> LitstrId {
        let i = match self.litstrs.iter().position(|x| x == s) {
            Some(i) => i,
            None => {
                self.litstrs.push(s.to_owned());
                self.litstrs.len() - 1
            }
        };
        LitstrId(u32::try_from(i).unwrap())
    }

    pub(crate) fn array(&mut self, elems: Vec<Const>) -> ArrayId {
        self.arrays.push(elems);
        ArrayId(u32::try_from(self.arrays.len() - 1).unwrap())
    }

    pub(crate) fn named_entity(&mut self, name: &str) -> NamedEntityId {
        let id = NamedEntityId(u32::try_from(self.named.len()).unwrap());
        self.named.push(NamedEntity {
            name: name.to_owned(),
            id,
        });
        id
    }

    /// Bind the named entity `ne` to `f`. If `immutable`, the binding is the same in every
    /// request.
    pub(crate) fn bind_func(&mut self, ne: NamedEntityId, f: FuncId, immutable: bool) {
        self.bound_funcs.insert(ne, f);
        if immutable {
            self.immutable.insert(f);
        }
    }

    pub(crate) fn persistent_cns(&mut self, name: &str, c: Const) {
        self.persistent_cns.insert(name.to_owned(), c);
    }

    pub(crate) fn obj_method(&mut self, name: &str, l: MethodLookup) {
        self.obj_methods.insert(name.to_owned(), l);
    }

    pub(crate) fn cls_method(&mut self, name: &str, l: MethodLookup) {
        self.cls_methods.insert(name.to_owned(), l);
    }

    pub(crate) fn instance_bit(&mut self, name: &str) {
        self.instance_bits.insert(name.to_owned());
    }
}

impl Unit for TestUnit {
    fn func(&self, id: FuncId) -> Option<&Func> {
        self.funcs.get(usize::try_from(id.0).unwrap())
    }

    fn class(&self, id: ClassId) -> Option<&Class> {
        self.classes.get(usize::try_from(id.0).unwrap())
    }

    fn litstr(&self, id: LitstrId) -> Option<&str> {
        self.litstrs
            .get(usize::try_from(id.0).unwrap())
            .map(|x| x.as_str())
    }

    fn array(&self, id: ArrayId) -> Option<&[Const]> {
        self.arrays
            .get(usize::try_from(id.0).unwrap())
            .map(|x| x.as_slice())
    }

    fn named_entity(&self, id: NamedEntityId) -> Option<&NamedEntity> {
        self.named.get(usize::try_from(id.0).unwrap())
    }

    fn lookup_func(&self, id: NamedEntityId) -> Option<FuncId> {
        self.bound_funcs.get(&id).copied()
    }

    fn lookup_func_by_name(&self, name: &str) -> Option<FuncId> {
        self.funcs.iter().find(|f| f.name == name).map(|f| f.id)
    }

    fn lookup_unique_class(&self, name: &str) -> Option<ClassId> {
        self.classes
            .iter()
            .find(|c| c.name == name && c.is_unique())
            .map(|c| c.id)
    }

    fn lookup_class(&self, name: &str) -> Option<ClassId> {
        self.classes.iter().find(|c| c.name == name).map(|c| c.id)
    }

    fn lookup_persistent_cns(&self, name: &str) -> Option<Const> {
        self.persistent_cns.get(name).cloned()
    }

    fn lookup_obj_method(
        &self,
        _base: Option<ClassId>,
        name: &str,
        _ctx: Option<ClassId>,
    ) -> MethodLookup {
        self.obj_methods
            .get(name)
            .copied()
            .unwrap_or(MethodLookup::NeedsRuntimeLookup)
    }

    fn lookup_cls_method(
        &self,
        _cls: Option<ClassId>,
        name: &str,
        _ctx: Option<ClassId>,
    ) -> MethodLookup {
        self.cls_methods
            .get(name)
            .copied()
            .unwrap_or(MethodLookup::NeedsRuntimeLookup)
    }

    fn is_name_binding_immutable(&self, func: FuncId) -> bool {
        self.immutable.contains(&func)
    }

    fn has_instance_bit(&self, name: &str) -> bool {
        self.instance_bits.contains(name)
    }

    fn class_of(&self, cls: ClassId, base: ClassId) -> bool {
        let mut cur = Some(cls);
        while let Some(c) = cur {
            if c == base {
                return true;
            }
            cur = self.class(c).and_then(|x| x.parent);
        }
        false
    }

    fn advance(&self, _func: FuncId, off: Offset) -> Offset {
        off + 1
    }
}

/// Translate `ops`, placing the `i`th at offset `start + i`. The last op is marked as the last of
/// the region unless we end up inlining.
pub(crate) fn feed(t: &mut Translator<'_>, start: Offset, ops: &[Op]) {
    for (i, op) in ops.iter().enumerate() {
        let last = i + 1 == ops.len() && !t.is_inlining();
        t.set_bc_off(start + i32::try_from(i).unwrap(), last);
        t.translate(op).unwrap();
    }
}

/// Check that the textual form of `m` matches the [fm] pattern `ptn`. `{{name}}` binds a name to
/// some literal text, requiring all other uses of that name to match the same text; `{{_}}`
/// matches any literal text.
pub(crate) fn assert_hir_matches(m: &Module, ptn: &str) {
    static PTN_RE: OnceLock<Regex> = OnceLock::new();
    static PTN_RE_IGNORE: OnceLock<Regex> = OnceLock::new();
    static LITERAL_RE: OnceLock<Regex> = OnceLock::new();
    let ptn_re = PTN_RE
        .get_or_init(|| Regex::new(r"\{\{.+?\}\}").unwrap())
        .clone();
    let ptn_re_ignore = PTN_RE_IGNORE
        .get_or_init(|| Regex::new(r"\{\{_\}\}").unwrap())
        .clone();
    let literal_re = LITERAL_RE
        .get_or_init(|| Regex::new(r"[a-zA-Z0-9\._]+").unwrap())
        .clone();
    let fmm = FMBuilder::new(ptn)
        .unwrap()
        .name_matcher_ignore(ptn_re_ignore, literal_re.clone())
        .name_matcher(ptn_re, literal_re)
        .build()
        .unwrap();
    if let Err(e) = fmm.matches(&m.to_string()) {
        panic!("{e}");
    }
}
