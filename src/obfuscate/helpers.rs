//! Synthesized helper routines: string decoders and call wrappers. Pools are
//! bounded by the configured helper counts; encoding sites round-robin across
//! the pool instead of minting one helper each. Names, mode tags and salts
//! are recorded so the metadata engine can hint the deobfuscator.

use crate::ast::{BinOpKind, CmpOpKind, Expr, FunctionDef, Module, Param, Stmt};
use crate::meta::HelperHint;
use crate::rng::Determinism;

use super::rename::NameGenerator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelperKind {
    StringDecode,
    CallWrap,
}

impl HelperKind {
    pub const fn mode_tag(self) -> &'static str {
        match self {
            Self::StringDecode => "string_decode",
            Self::CallWrap => "call_wrap",
        }
    }
}

#[derive(Debug, Clone)]
pub struct HelperSpec {
    pub name: String,
    pub kind: HelperKind,
    pub salt: u64,
    pub used: bool,
}

impl HelperSpec {
    /// The salt byte actually baked into the emitted decoder body.
    pub const fn salt_byte(&self) -> i64 {
        (self.salt & 0xff) as i64
    }
}

#[derive(Debug)]
pub struct HelperRegistry {
    string_pool: Vec<HelperSpec>,
    call_pool: Vec<HelperSpec>,
}

impl HelperRegistry {
    pub fn new(
        config_string_helpers: usize,
        config_call_helpers: usize,
        det: &Determinism,
        generator: &mut NameGenerator,
    ) -> Self {
        let string_pool = (0..config_string_helpers)
            .map(|index| {
                let base = if index == 0 {
                    "_obf_str".to_string()
                } else {
                    format!("_obf_str{index}")
                };
                HelperSpec {
                    name: generator.fresh_named(&base),
                    kind: HelperKind::StringDecode,
                    salt: det.helper_salt(index),
                    used: false,
                }
            })
            .collect();
        let call_pool = (0..config_call_helpers)
            .map(|index| {
                let base = if index == 0 {
                    "_obf_call".to_string()
                } else {
                    format!("_obf_call{index}")
                };
                HelperSpec {
                    name: generator.fresh_named(&base),
                    kind: HelperKind::CallWrap,
                    salt: 0,
                    used: false,
                }
            })
            .collect();
        Self {
            string_pool,
            call_pool,
        }
    }

    /// Round-robin assignment of a string site to its decoder.
    pub fn string_helper(&self, site: u64) -> &HelperSpec {
        &self.string_pool[(site % self.string_pool.len() as u64) as usize]
    }

    pub fn mark_string_used(&mut self, site: u64) {
        let index = (site % self.string_pool.len() as u64) as usize;
        self.string_pool[index].used = true;
    }

    pub fn call_helper(&mut self, site: u64) -> &HelperSpec {
        let index = (site % self.call_pool.len() as u64) as usize;
        self.call_pool[index].used = true;
        &self.call_pool[index]
    }

    pub fn is_helper_name(&self, name: &str) -> bool {
        self.string_pool.iter().any(|h| h.name == name)
            || self.call_pool.iter().any(|h| h.name == name)
    }

    pub fn any_used(&self) -> bool {
        self.string_pool.iter().chain(&self.call_pool).any(|h| h.used)
    }

    /// Emits the definitions of every referenced helper at the top of the
    /// module (after a docstring, when present).
    pub fn emit(&self, module: &mut Module, keep_docstrings: bool) {
        let insert_at = if keep_docstrings {
            crate::ast::docstring_insert_index(&module.body)
        } else {
            0
        };
        let mut defs: Vec<Stmt> = Vec::new();
        for spec in self.string_pool.iter().filter(|h| h.used) {
            defs.push(Stmt::FunctionDef(build_string_helper(spec)));
        }
        for spec in self.call_pool.iter().filter(|h| h.used) {
            defs.push(Stmt::FunctionDef(build_call_helper(spec)));
        }
        for def in defs.into_iter().rev() {
            module.body.insert(insert_at, def);
        }
    }

    pub fn hints(&self) -> Vec<HelperHint> {
        self.string_pool
            .iter()
            .chain(&self.call_pool)
            .filter(|h| h.used)
            .map(|h| HelperHint {
                helper_name: h.name.clone(),
                mode: h.kind.mode_tag().to_string(),
                salt: h.salt,
                params: vec![],
            })
            .collect()
    }
}

/// ```python
/// def _obf_str(m, p, s=SALT):
///     if m == 0:
///         return "".join("".join(chr(c ^ (k ^ s)) for c in d) for k, d in p)
///     if m == 1:
///         return __import__("base64").b64decode(p).decode("utf-8")
///     return "".join(reversed(p))
/// ```
fn build_string_helper(spec: &HelperSpec) -> FunctionDef {
    let join = |arg: Expr| Expr::call(Expr::attr(Expr::str(""), "join"), vec![arg]);

    let chunk_char = Expr::call_name(
        "chr",
        vec![Expr::binop(
            Expr::name("c"),
            BinOpKind::BitXor,
            Expr::binop(Expr::name("k"), BinOpKind::BitXor, Expr::name("s")),
        )],
    );
    let inner = Expr::GeneratorExp {
        elt: Box::new(join(Expr::GeneratorExp {
            elt: Box::new(chunk_char),
            target: Box::new(Expr::store("c")),
            iter: Box::new(Expr::name("d")),
        })),
        target: Box::new(Expr::Tuple(vec![Expr::store("k"), Expr::store("d")])),
        iter: Box::new(Expr::name("p")),
    };
    let xor_branch = Stmt::If {
        test: Expr::compare(Expr::name("m"), CmpOpKind::Eq, Expr::int(0)),
        body: vec![Stmt::Return(Some(join(inner)))],
        orelse: vec![],
    };

    let b64_value = Expr::call(
        Expr::attr(
            Expr::call(
                Expr::attr(Expr::dunder_import("base64"), "b64decode"),
                vec![Expr::name("p")],
            ),
            "decode",
        ),
        vec![Expr::str("utf-8")],
    );
    let b64_branch = Stmt::If {
        test: Expr::compare(Expr::name("m"), CmpOpKind::Eq, Expr::int(1)),
        body: vec![Stmt::Return(Some(b64_value))],
        orelse: vec![],
    };

    let reverse_value = join(Expr::call_name("reversed", vec![Expr::name("p")]));

    FunctionDef {
        name: spec.name.clone(),
        params: vec![
            Param::new("m"),
            Param::new("p"),
            Param {
                name: "s".into(),
                default: Some(Expr::int(spec.salt_byte())),
            },
        ],
        body: vec![xor_branch, b64_branch, Stmt::Return(Some(reverse_value))],
        decorators: vec![],
        is_async: false,
    }
}

/// ```python
/// def _obf_call(f, a, k):
///     return f(*a, **k)
/// ```
fn build_call_helper(spec: &HelperSpec) -> FunctionDef {
    let call = Expr::Call {
        func: Box::new(Expr::name("f")),
        args: vec![Expr::Starred(Box::new(Expr::name("a")))],
        keywords: vec![crate::ast::Keyword {
            arg: None,
            value: Expr::name("k"),
        }],
    };
    FunctionDef {
        name: spec.name.clone(),
        params: vec![Param::new("f"), Param::new("a"), Param::new("k")],
        body: vec![Stmt::Return(Some(call))],
        decorators: vec![],
        is_async: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use rustc_hash::FxHashSet;

    fn registry(strings: usize, calls: usize) -> HelperRegistry {
        let det = Determinism::new(7, 23);
        let mut rng = StdRng::seed_from_u64(7);
        let mut generator = NameGenerator::new(FxHashSet::default(), &mut rng);
        HelperRegistry::new(strings, calls, &det, &mut generator)
    }

    #[test]
    fn test_round_robin_assignment() {
        let registry = registry(2, 1);
        let first = registry.string_helper(0).name.clone();
        let second = registry.string_helper(1).name.clone();
        assert_ne!(first, second);
        assert_eq!(registry.string_helper(2).name, first);
    }

    #[test]
    fn test_only_used_helpers_are_emitted() {
        let mut registry = registry(2, 1);
        registry.mark_string_used(0);
        let mut module = Module { body: vec![] };
        registry.emit(&mut module, false);
        assert_eq!(module.body.len(), 1);
        match &module.body[0] {
            Stmt::FunctionDef(def) => assert_eq!(def.params.len(), 3),
            other => panic!("unexpected statement: {other:?}"),
        }
    }

    #[test]
    fn test_hints_carry_mode_and_salt() {
        let mut registry = registry(1, 1);
        registry.mark_string_used(0);
        let hints = registry.hints();
        assert_eq!(hints.len(), 1);
        assert_eq!(hints[0].mode, "string_decode");
        assert_eq!(hints[0].salt, Determinism::new(7, 23).helper_salt(0));
    }

    #[test]
    fn test_helper_names_avoid_collisions() {
        let det = Determinism::new(7, 23);
        let mut rng = StdRng::seed_from_u64(7);
        let mut used = FxHashSet::default();
        used.insert("_obf_str".to_string());
        let mut generator = NameGenerator::new(used, &mut rng);
        let registry = HelperRegistry::new(1, 1, &det, &mut generator);
        assert_eq!(registry.string_helper(0).name, "_obf_str_x");
    }
}
