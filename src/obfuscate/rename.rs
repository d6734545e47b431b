//! Deterministic, collision-free identifier substitution.
//!
//! Two walks: a collector binds every renamable symbol in its scope and
//! assigns obfuscated names in traversal order, then the renamer rewrites
//! binding and use occurrences by resolving each name against the enclosing
//! scope chain (innermost first). Generated names are unique across the
//! whole module, so no new shadowing can be introduced; two occurrences of
//! one original name in different scopes still get distinct replacements.

use std::collections::BTreeMap;

use lazy_static::lazy_static;
use rand::Rng;
use rand::rngs::StdRng;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::ast::{Ctx, Expr, Module, Stmt};
use crate::{Error, Result};

lazy_static! {
    pub static ref BUILTIN_NAMES: FxHashSet<&'static str> = [
        "abs", "aiter", "all", "anext", "any", "ascii", "bin", "bool", "breakpoint",
        "bytearray", "bytes", "callable", "chr", "classmethod", "compile", "complex",
        "delattr", "dict", "dir", "divmod", "enumerate", "eval", "exec", "filter",
        "float", "format", "frozenset", "getattr", "globals", "hasattr", "hash",
        "help", "hex", "id", "input", "int", "isinstance", "issubclass", "iter",
        "len", "list", "locals", "map", "max", "memoryview", "min", "next", "object",
        "oct", "open", "ord", "pow", "print", "property", "range", "repr", "reversed",
        "round", "set", "setattr", "slice", "sorted", "staticmethod", "str", "sum",
        "super", "tuple", "type", "vars", "zip", "ArithmeticError", "AssertionError",
        "AttributeError", "BaseException", "Exception", "FileNotFoundError",
        "GeneratorExit", "ImportError", "IndexError", "KeyError", "KeyboardInterrupt",
        "LookupError", "MemoryError", "NameError", "NotImplementedError", "OSError",
        "OverflowError", "RecursionError", "RuntimeError", "StopAsyncIteration",
        "StopIteration", "SyntaxError", "SystemError", "SystemExit", "TypeError",
        "UnicodeDecodeError", "UnicodeEncodeError", "UnicodeError", "ValueError",
        "ZeroDivisionError", "True", "False", "None", "NotImplemented", "Ellipsis",
        "__import__",
    ]
    .into_iter()
    .collect();
    static ref KEYWORDS: FxHashSet<&'static str> = [
        "and", "as", "assert", "async", "await", "break", "class", "continue", "def",
        "del", "elif", "else", "except", "finally", "for", "from", "global", "if",
        "import", "in", "is", "lambda", "nonlocal", "not", "or", "pass", "raise",
        "return", "try", "while", "with", "yield",
    ]
    .into_iter()
    .collect();
}

pub fn is_keyword(name: &str) -> bool {
    KEYWORDS.contains(name)
}

pub fn is_dunder(name: &str) -> bool {
    name.len() > 4 && name.starts_with("__") && name.ends_with("__")
}

const NAME_STEMS: [char; 5] = ['o', 'q', 'z', 'w', 'j'];
const MAX_NAME_ATTEMPTS: u32 = 100_000;

/// Seeded generator of fresh identifiers. The stem varies with the seed, the
/// incrementing counter keeps the namespace collision-free.
#[derive(Debug)]
pub struct NameGenerator {
    used: FxHashSet<String>,
    counter: u32,
    stem: char,
}

impl NameGenerator {
    pub fn new(used: FxHashSet<String>, rng: &mut StdRng) -> Self {
        let stem = NAME_STEMS[rng.gen_range(0..NAME_STEMS.len())];
        Self {
            used,
            counter: 0,
            stem,
        }
    }

    pub fn mark_used(&mut self, name: &str) {
        self.used.insert(name.to_string());
    }

    pub fn is_used(&self, name: &str) -> bool {
        self.used.contains(name)
    }

    pub fn next_name(&mut self) -> Result<String> {
        for _ in 0..MAX_NAME_ATTEMPTS {
            let name = format!("_{}{:x}", self.stem, self.counter);
            self.counter = self.counter.wrapping_add(1);
            if !self.used.contains(&name) && !is_keyword(&name) {
                self.used.insert(name.clone());
                return Ok(name);
            }
        }
        Err(Error::RenameCollision(format!(
            "name generator exhausted after {MAX_NAME_ATTEMPTS} attempts"
        )))
    }

    /// Fresh name derived from a stable base, for helpers and tables.
    pub fn fresh_named(&mut self, base: &str) -> String {
        let mut name = base.to_string();
        while self.used.contains(&name) || is_keyword(&name) {
            name.push_str("_x");
        }
        self.used.insert(name.clone());
        name
    }
}

/// Bijective (scope, original) -> obfuscated mapping.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RenameMap {
    entries: FxHashMap<(String, String), String>,
}

impl RenameMap {
    pub fn insert(&mut self, scope: &str, original: &str, obfuscated: String) {
        self.entries
            .insert((scope.to_string(), original.to_string()), obfuscated);
    }

    pub fn get(&self, scope: &str, original: &str) -> Option<&String> {
        self.entries
            .get(&(scope.to_string(), original.to_string()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// JSON artifact form: `"scope::name"` keys, module scope is the empty
    /// path (`"::main"`).
    pub fn to_artifact(&self) -> BTreeMap<String, String> {
        self.entries
            .iter()
            .map(|((scope, name), obf)| (format!("{scope}::{name}"), obf.clone()))
            .collect()
    }

    pub fn from_artifact(artifact: &BTreeMap<String, String>) -> Self {
        let mut map = Self::default();
        for (key, obf) in artifact {
            let (scope, name) = key.split_once("::").unwrap_or(("", key.as_str()));
            map.insert(scope, name, obf.clone());
        }
        map
    }

    /// Reverse index for deobfuscation: (original scope path, obfuscated
    /// name) -> original name.
    pub fn reverse_index(&self) -> FxHashMap<(String, String), String> {
        self.entries
            .iter()
            .map(|((scope, name), obf)| ((scope.clone(), obf.clone()), name.clone()))
            .collect()
    }
}

/// Every identifier mentioned anywhere in the module, used to seed the name
/// generator so fresh names cannot collide.
pub fn collect_identifiers(module: &Module) -> FxHashSet<String> {
    let mut ids = FxHashSet::default();
    collect_ids_body(&module.body, &mut ids);
    ids
}

fn collect_ids_body(body: &[Stmt], ids: &mut FxHashSet<String>) {
    for stmt in body {
        collect_ids_stmt(stmt, ids);
    }
}

fn collect_ids_stmt(stmt: &Stmt, ids: &mut FxHashSet<String>) {
    match stmt {
        Stmt::FunctionDef(def) => {
            ids.insert(def.name.clone());
            for param in &def.params {
                ids.insert(param.name.clone());
                if let Some(default) = &param.default {
                    collect_ids_expr(default, ids);
                }
            }
            for dec in &def.decorators {
                collect_ids_expr(dec, ids);
            }
            collect_ids_body(&def.body, ids);
        }
        Stmt::ClassDef(def) => {
            ids.insert(def.name.clone());
            for base in &def.bases {
                collect_ids_expr(base, ids);
            }
            for kw in &def.keywords {
                collect_ids_expr(&kw.value, ids);
            }
            for dec in &def.decorators {
                collect_ids_expr(dec, ids);
            }
            collect_ids_body(&def.body, ids);
        }
        Stmt::Assign { targets, value } => {
            for target in targets {
                collect_ids_expr(target, ids);
            }
            collect_ids_expr(value, ids);
        }
        Stmt::AugAssign { target, value, .. } => {
            collect_ids_expr(target, ids);
            collect_ids_expr(value, ids);
        }
        Stmt::Return(value) | Stmt::Raise(value) => {
            if let Some(value) = value {
                collect_ids_expr(value, ids);
            }
        }
        Stmt::Expr(value) => collect_ids_expr(value, ids),
        Stmt::If { test, body, orelse } => {
            collect_ids_expr(test, ids);
            collect_ids_body(body, ids);
            collect_ids_body(orelse, ids);
        }
        Stmt::While { test, body } => {
            collect_ids_expr(test, ids);
            collect_ids_body(body, ids);
        }
        Stmt::For { target, iter, body, orelse } => {
            collect_ids_expr(target, ids);
            collect_ids_expr(iter, ids);
            collect_ids_body(body, ids);
            collect_ids_body(orelse, ids);
        }
        Stmt::Try { body, handlers, orelse, finalbody } => {
            collect_ids_body(body, ids);
            for handler in handlers {
                if let Some(typ) = &handler.typ {
                    collect_ids_expr(typ, ids);
                }
                if let Some(name) = &handler.name {
                    ids.insert(name.clone());
                }
                collect_ids_body(&handler.body, ids);
            }
            collect_ids_body(orelse, ids);
            collect_ids_body(finalbody, ids);
        }
        Stmt::Import { names } | Stmt::ImportFrom { names, .. } => {
            for alias in names {
                ids.insert(alias.bound_name().to_string());
            }
        }
        Stmt::Delete { targets } => {
            for target in targets {
                collect_ids_expr(target, ids);
            }
        }
        Stmt::Global { names } | Stmt::Nonlocal { names } => {
            for name in names {
                ids.insert(name.clone());
            }
        }
        Stmt::Pass | Stmt::Break | Stmt::Continue => {}
    }
}

fn collect_ids_expr(expr: &Expr, ids: &mut FxHashSet<String>) {
    let mut stack = vec![expr];
    while let Some(expr) = stack.pop() {
        match expr {
            Expr::Name { id, .. } => {
                ids.insert(id.clone());
            }
            Expr::Literal(_) => {}
            Expr::Tuple(items) | Expr::List(items) | Expr::BoolOp { values: items, .. } => {
                stack.extend(items.iter());
            }
            Expr::Dict { keys, values } => {
                stack.extend(keys.iter());
                stack.extend(values.iter());
            }
            Expr::Attribute { value, .. } | Expr::Starred(value) => stack.push(value),
            Expr::Subscript { value, index } => {
                stack.push(value);
                stack.push(index);
            }
            Expr::Call { func, args, keywords } => {
                stack.push(func);
                stack.extend(args.iter());
                for kw in keywords {
                    stack.push(&kw.value);
                }
            }
            Expr::BinOp { left, right, .. } | Expr::Compare { left, right, .. } => {
                stack.push(left);
                stack.push(right);
            }
            Expr::UnaryOp { operand, .. } => stack.push(operand),
            Expr::IfExp { test, body, orelse } => {
                stack.push(test);
                stack.push(body);
                stack.push(orelse);
            }
            Expr::Lambda { params, body } => {
                for param in params {
                    ids.insert(param.name.clone());
                    if let Some(default) = &param.default {
                        stack.push(default);
                    }
                }
                stack.push(body);
            }
            Expr::GeneratorExp { elt, target, iter } => {
                stack.push(elt);
                stack.push(target);
                stack.push(iter);
            }
        }
    }
}

/// Keyword-argument names observed at call sites. Renaming any of these
/// would break `fn(name=...)` call shapes, so they are protected wholesale.
pub fn collect_keyword_arg_names(module: &Module) -> FxHashSet<String> {
    let mut names = FxHashSet::default();
    let mut module = module.clone();
    crate::ast::visit_exprs_mut(&mut module.body, &mut |expr| {
        if let Expr::Call { keywords, .. } = expr {
            for kw in keywords {
                if let Some(arg) = &kw.arg {
                    names.insert(arg.clone());
                }
            }
        }
    });
    names
}

struct ScopeInfo {
    bound: FxHashSet<String>,
}

struct Collector<'a> {
    protected: &'a FxHashSet<String>,
    generator: &'a mut NameGenerator,
    map: RenameMap,
    scopes: FxHashMap<String, ScopeInfo>,
    stack: Vec<String>,
    class_depth: u32,
    function_depth: u32,
    error: Option<Error>,
}

impl<'a> Collector<'a> {
    fn new(protected: &'a FxHashSet<String>, generator: &'a mut NameGenerator) -> Self {
        let mut scopes = FxHashMap::default();
        scopes.insert(
            String::new(),
            ScopeInfo {
                bound: FxHashSet::default(),
            },
        );
        Self {
            protected,
            generator,
            map: RenameMap::default(),
            scopes,
            stack: vec![String::new()],
            class_depth: 0,
            function_depth: 0,
            error: None,
        }
    }

    fn current_scope(&self) -> &str {
        self.stack.last().map(String::as_str).unwrap_or("")
    }

    fn child_scope(&self, name: &str) -> String {
        let current = self.current_scope();
        if current.is_empty() {
            name.to_string()
        } else {
            format!("{current}.{name}")
        }
    }

    fn allowed(&self, name: &str) -> bool {
        !name.is_empty()
            && !self.protected.contains(name)
            && !BUILTIN_NAMES.contains(name)
            && !is_keyword(name)
            && !is_dunder(name)
    }

    fn bind_in(&mut self, scope: String, name: &str) {
        let info = self.scopes.entry(scope.clone()).or_insert_with(|| ScopeInfo {
            bound: FxHashSet::default(),
        });
        if !info.bound.insert(name.to_string()) {
            return;
        }
        if self.allowed(name) && self.map.get(&scope, name).is_none() {
            match self.generator.next_name() {
                Ok(obf) => self.map.insert(&scope, name, obf),
                Err(err) => {
                    if self.error.is_none() {
                        self.error = Some(err);
                    }
                }
            }
        }
    }

    fn bind(&mut self, name: &str) {
        self.bind_in(self.current_scope().to_string(), name);
    }

    /// Class-body statements bind class attributes, which stay visible under
    /// their original names to external code.
    fn in_class_body(&self) -> bool {
        self.class_depth > 0 && self.function_depth == 0
    }

    fn collect_body(&mut self, body: &[Stmt]) {
        for stmt in body {
            self.collect_stmt(stmt);
        }
    }

    fn collect_stmt(&mut self, stmt: &Stmt) {
        match stmt {
            Stmt::FunctionDef(def) => {
                if !self.in_class_body() {
                    self.bind(&def.name);
                }
                let scope = self.child_scope(&def.name);
                self.stack.push(scope);
                self.function_depth += 1;
                let decls = scan_scope_decls(&def.body);
                for param in &def.params {
                    self.bind(&param.name);
                }
                for stmt in &def.body {
                    self.collect_scoped_stmt(stmt, &decls);
                }
                self.function_depth -= 1;
                self.stack.pop();
            }
            Stmt::ClassDef(def) => {
                if !self.in_class_body() {
                    self.bind(&def.name);
                }
                let scope = self.child_scope(&def.name);
                self.stack.push(scope);
                self.class_depth += 1;
                self.collect_body(&def.body);
                self.class_depth -= 1;
                self.stack.pop();
            }
            _ => self.collect_scoped_stmt(stmt, &ScopeDecls::default()),
        }
    }

    fn collect_scoped_stmt(&mut self, stmt: &Stmt, decls: &ScopeDecls) {
        match stmt {
            Stmt::FunctionDef(_) | Stmt::ClassDef(_) => self.collect_stmt(stmt),
            Stmt::Assign { targets, .. } => {
                for target in targets {
                    self.bind_target(target, decls);
                }
            }
            Stmt::AugAssign { target, .. } => self.bind_target(target, decls),
            Stmt::For { target, body, orelse, .. } => {
                self.bind_target(target, decls);
                for stmt in body {
                    self.collect_scoped_stmt(stmt, decls);
                }
                for stmt in orelse {
                    self.collect_scoped_stmt(stmt, decls);
                }
            }
            Stmt::If { body, orelse, .. } => {
                for stmt in body {
                    self.collect_scoped_stmt(stmt, decls);
                }
                for stmt in orelse {
                    self.collect_scoped_stmt(stmt, decls);
                }
            }
            Stmt::While { body, .. } => {
                for stmt in body {
                    self.collect_scoped_stmt(stmt, decls);
                }
            }
            Stmt::Try { body, handlers, orelse, finalbody } => {
                for stmt in body {
                    self.collect_scoped_stmt(stmt, decls);
                }
                for handler in handlers {
                    if let Some(name) = &handler.name {
                        self.bind_name(name, decls);
                    }
                    for stmt in &handler.body {
                        self.collect_scoped_stmt(stmt, decls);
                    }
                }
                for stmt in orelse {
                    self.collect_scoped_stmt(stmt, decls);
                }
                for stmt in finalbody {
                    self.collect_scoped_stmt(stmt, decls);
                }
            }
            Stmt::Import { names } | Stmt::ImportFrom { names, .. } => {
                if self.in_class_body() {
                    return;
                }
                for alias in names {
                    if alias.name == "*" {
                        continue;
                    }
                    let bound = alias.bound_name().to_string();
                    self.bind_name(&bound, decls);
                }
            }
            Stmt::Delete { targets } => {
                for target in targets {
                    self.bind_target(target, decls);
                }
            }
            _ => {}
        }
    }

    fn bind_name(&mut self, name: &str, decls: &ScopeDecls) {
        if self.in_class_body() {
            return;
        }
        if decls.nonlocals.contains(name) {
            // A nonlocal binding belongs to the enclosing function scope;
            // resolution walks up to it, so nothing is bound here.
            return;
        }
        if decls.globals.contains(name) {
            self.bind_in(String::new(), name);
        } else {
            self.bind(name);
        }
    }

    fn bind_target(&mut self, target: &Expr, decls: &ScopeDecls) {
        match target {
            Expr::Name { id, ctx } if *ctx != Ctx::Load => self.bind_name(id, decls),
            Expr::Tuple(items) | Expr::List(items) => {
                for item in items {
                    self.bind_target(item, decls);
                }
            }
            Expr::Starred(inner) => self.bind_target(inner, decls),
            _ => {}
        }
    }
}

/// Declarations directly inside one scope (not crossing into nested defs):
/// `global x` rebinds `x` at module level, `nonlocal x` defers to the
/// enclosing function's binding.
#[derive(Default)]
struct ScopeDecls {
    globals: FxHashSet<String>,
    nonlocals: FxHashSet<String>,
}

fn scan_scope_decls(body: &[Stmt]) -> ScopeDecls {
    let mut globals = FxHashSet::default();
    let mut nonlocals = FxHashSet::default();
    fn walk(body: &[Stmt], globals: &mut FxHashSet<String>, nonlocals: &mut FxHashSet<String>) {
        for stmt in body {
            match stmt {
                Stmt::Global { names } => globals.extend(names.iter().cloned()),
                Stmt::Nonlocal { names } => nonlocals.extend(names.iter().cloned()),
                Stmt::If { body, orelse, .. } | Stmt::For { body, orelse, .. } => {
                    walk(body, globals, nonlocals);
                    walk(orelse, globals, nonlocals);
                }
                Stmt::While { body, .. } => walk(body, globals, nonlocals),
                Stmt::Try { body, handlers, orelse, finalbody } => {
                    walk(body, globals, nonlocals);
                    for handler in handlers {
                        walk(&handler.body, globals, nonlocals);
                    }
                    walk(orelse, globals, nonlocals);
                    walk(finalbody, globals, nonlocals);
                }
                _ => {}
            }
        }
    }
    walk(body, &mut globals, &mut nonlocals);
    ScopeDecls { globals, nonlocals }
}

struct Renamer<'a> {
    map: &'a RenameMap,
    scopes: &'a FxHashMap<String, ScopeInfo>,
    stack: Vec<String>,
}

impl<'a> Renamer<'a> {
    /// Innermost-first resolution against the scope chain, mirroring how the
    /// target language resolves names. Stops at the first scope that binds
    /// the name, renamed or not.
    fn resolve(&self, name: &str) -> Option<String> {
        for scope in self.stack.iter().rev() {
            if let Some(obf) = self.map.get(scope, name) {
                return Some(obf.clone());
            }
            if let Some(info) = self.scopes.get(scope) {
                if info.bound.contains(name) {
                    return None;
                }
            }
        }
        None
    }

    fn maybe(&self, name: &mut String) {
        if let Some(obf) = self.resolve(name) {
            *name = obf;
        }
    }

    fn child_scope(&self, name: &str) -> String {
        let current = self.stack.last().map(String::as_str).unwrap_or("");
        if current.is_empty() {
            name.to_string()
        } else {
            format!("{current}.{name}")
        }
    }

    fn rename_body(&mut self, body: &mut [Stmt]) {
        for stmt in body {
            self.rename_stmt(stmt);
        }
    }

    fn rename_stmt(&mut self, stmt: &mut Stmt) {
        match stmt {
            Stmt::FunctionDef(def) => {
                for dec in &mut def.decorators {
                    self.rename_expr(dec);
                }
                let scope = self.child_scope(&def.name);
                if let Some(obf) = self.map.get(self.stack.last().unwrap(), &def.name) {
                    def.name = obf.clone();
                }
                self.stack.push(scope);
                for param in &mut def.params {
                    if let Some(default) = &mut param.default {
                        self.rename_expr(default);
                    }
                    self.maybe(&mut param.name);
                }
                self.rename_body(&mut def.body);
                self.stack.pop();
            }
            Stmt::ClassDef(def) => {
                for dec in &mut def.decorators {
                    self.rename_expr(dec);
                }
                for base in &mut def.bases {
                    self.rename_expr(base);
                }
                for kw in &mut def.keywords {
                    self.rename_expr(&mut kw.value);
                }
                let scope = self.child_scope(&def.name);
                if let Some(obf) = self.map.get(self.stack.last().unwrap(), &def.name) {
                    def.name = obf.clone();
                }
                self.stack.push(scope);
                self.rename_body(&mut def.body);
                self.stack.pop();
            }
            Stmt::Assign { targets, value } => {
                for target in targets {
                    self.rename_expr(target);
                }
                self.rename_expr(value);
            }
            Stmt::AugAssign { target, value, .. } => {
                self.rename_expr(target);
                self.rename_expr(value);
            }
            Stmt::Return(value) | Stmt::Raise(value) => {
                if let Some(value) = value {
                    self.rename_expr(value);
                }
            }
            Stmt::Expr(value) => self.rename_expr(value),
            Stmt::If { test, body, orelse } => {
                self.rename_expr(test);
                self.rename_body(body);
                self.rename_body(orelse);
            }
            Stmt::While { test, body } => {
                self.rename_expr(test);
                self.rename_body(body);
            }
            Stmt::For { target, iter, body, orelse } => {
                self.rename_expr(target);
                self.rename_expr(iter);
                self.rename_body(body);
                self.rename_body(orelse);
            }
            Stmt::Try { body, handlers, orelse, finalbody } => {
                self.rename_body(body);
                for handler in handlers {
                    if let Some(typ) = &mut handler.typ {
                        self.rename_expr(typ);
                    }
                    if let Some(name) = &mut handler.name {
                        self.maybe(name);
                    }
                    self.rename_body(&mut handler.body);
                }
                self.rename_body(orelse);
                self.rename_body(finalbody);
            }
            Stmt::Import { names } | Stmt::ImportFrom { names, .. } => {
                for alias in names {
                    if alias.name == "*" {
                        continue;
                    }
                    let bound = alias.bound_name().to_string();
                    if let Some(obf) = self.resolve(&bound) {
                        alias.asname = Some(obf);
                    }
                }
            }
            Stmt::Delete { targets } => {
                for target in targets {
                    self.rename_expr(target);
                }
            }
            Stmt::Global { names } | Stmt::Nonlocal { names } => {
                for name in names {
                    self.maybe(name);
                }
            }
            Stmt::Pass | Stmt::Break | Stmt::Continue => {}
        }
    }

    fn rename_expr(&mut self, expr: &mut Expr) {
        match expr {
            Expr::Name { id, .. } => self.maybe(id),
            Expr::Literal(_) => {}
            Expr::Tuple(items) | Expr::List(items) | Expr::BoolOp { values: items, .. } => {
                for item in items {
                    self.rename_expr(item);
                }
            }
            Expr::Dict { keys, values } => {
                for key in keys {
                    self.rename_expr(key);
                }
                for value in values {
                    self.rename_expr(value);
                }
            }
            // Attribute names are object namespace members, not scoped
            // identifiers; only the value side is renamed.
            Expr::Attribute { value, .. } | Expr::Starred(value) => self.rename_expr(value),
            Expr::Subscript { value, index } => {
                self.rename_expr(value);
                self.rename_expr(index);
            }
            Expr::Call { func, args, keywords } => {
                self.rename_expr(func);
                for arg in args {
                    self.rename_expr(arg);
                }
                for kw in keywords {
                    self.rename_expr(&mut kw.value);
                }
            }
            Expr::BinOp { left, right, .. } | Expr::Compare { left, right, .. } => {
                self.rename_expr(left);
                self.rename_expr(right);
            }
            Expr::UnaryOp { operand, .. } => self.rename_expr(operand),
            Expr::IfExp { test, body, orelse } => {
                self.rename_expr(test);
                self.rename_expr(body);
                self.rename_expr(orelse);
            }
            Expr::Lambda { params, body } => {
                for param in params {
                    if let Some(default) = &mut param.default {
                        self.rename_expr(default);
                    }
                    self.maybe(&mut param.name);
                }
                self.rename_expr(body);
            }
            Expr::GeneratorExp { elt, target, iter } => {
                self.rename_expr(iter);
                self.rename_expr(target);
                self.rename_expr(elt);
            }
        }
    }
}

/// Collects and applies the rename map in one deterministic operation.
/// `protected` must already contain user-excluded names and call-site
/// keyword-argument names.
pub fn rename_module(
    module: &mut Module,
    protected: &FxHashSet<String>,
    generator: &mut NameGenerator,
) -> Result<RenameMap> {
    let mut collector = Collector::new(protected, generator);
    collector.collect_body(&module.body);
    if let Some(err) = collector.error {
        return Err(err);
    }
    let map = collector.map;
    let scopes = collector.scopes;
    let mut renamer = Renamer {
        map: &map,
        scopes: &scopes,
        stack: vec![String::new()],
    };
    renamer.rename_body(&mut module.body);
    Ok(map)
}

/// Best-effort inverse: rewrites obfuscated names back to the originals,
/// translating scope paths through the map as it descends.
pub fn reverse_rename(module: &mut Module, map: &RenameMap) {
    let index = map.reverse_index();
    let mut walker = ReverseWalker {
        index: &index,
        stack: vec![String::new()],
    };
    walker.walk_body(&mut module.body);
}

struct ReverseWalker<'a> {
    index: &'a FxHashMap<(String, String), String>,
    stack: Vec<String>,
}

impl<'a> ReverseWalker<'a> {
    fn resolve(&self, name: &str) -> Option<String> {
        for scope in self.stack.iter().rev() {
            if let Some(orig) = self.index.get(&(scope.clone(), name.to_string())) {
                return Some(orig.clone());
            }
        }
        None
    }

    fn maybe(&self, name: &mut String) {
        if let Some(orig) = self.resolve(name) {
            *name = orig;
        }
    }

    fn child_scope(&self, original_name: &str) -> String {
        let current = self.stack.last().map(String::as_str).unwrap_or("");
        if current.is_empty() {
            original_name.to_string()
        } else {
            format!("{current}.{original_name}")
        }
    }

    fn walk_body(&mut self, body: &mut [Stmt]) {
        for stmt in body {
            self.walk_stmt(stmt);
        }
    }

    fn walk_stmt(&mut self, stmt: &mut Stmt) {
        match stmt {
            Stmt::FunctionDef(def) => {
                for dec in &mut def.decorators {
                    self.walk_expr(dec);
                }
                self.maybe(&mut def.name);
                let scope = self.child_scope(&def.name);
                self.stack.push(scope);
                for param in &mut def.params {
                    if let Some(default) = &mut param.default {
                        self.walk_expr(default);
                    }
                    self.maybe(&mut param.name);
                }
                self.walk_body(&mut def.body);
                self.stack.pop();
            }
            Stmt::ClassDef(def) => {
                for dec in &mut def.decorators {
                    self.walk_expr(dec);
                }
                for base in &mut def.bases {
                    self.walk_expr(base);
                }
                for kw in &mut def.keywords {
                    self.walk_expr(&mut kw.value);
                }
                self.maybe(&mut def.name);
                let scope = self.child_scope(&def.name);
                self.stack.push(scope);
                self.walk_body(&mut def.body);
                self.stack.pop();
            }
            Stmt::Assign { targets, value } => {
                for target in targets {
                    self.walk_expr(target);
                }
                self.walk_expr(value);
            }
            Stmt::AugAssign { target, value, .. } => {
                self.walk_expr(target);
                self.walk_expr(value);
            }
            Stmt::Return(value) | Stmt::Raise(value) => {
                if let Some(value) = value {
                    self.walk_expr(value);
                }
            }
            Stmt::Expr(value) => self.walk_expr(value),
            Stmt::If { test, body, orelse } => {
                self.walk_expr(test);
                self.walk_body(body);
                self.walk_body(orelse);
            }
            Stmt::While { test, body } => {
                self.walk_expr(test);
                self.walk_body(body);
            }
            Stmt::For { target, iter, body, orelse } => {
                self.walk_expr(target);
                self.walk_expr(iter);
                self.walk_body(body);
                self.walk_body(orelse);
            }
            Stmt::Try { body, handlers, orelse, finalbody } => {
                self.walk_body(body);
                for handler in handlers {
                    if let Some(typ) = &mut handler.typ {
                        self.walk_expr(typ);
                    }
                    if let Some(name) = &mut handler.name {
                        self.maybe(name);
                    }
                    self.walk_body(&mut handler.body);
                }
                self.walk_body(orelse);
                self.walk_body(finalbody);
            }
            Stmt::Import { names } | Stmt::ImportFrom { names, .. } => {
                for alias in names {
                    if let Some(asname) = alias.asname.clone() {
                        if let Some(orig) = self.resolve(&asname) {
                            if orig == alias.bound_name() || orig == alias.name {
                                alias.asname = None;
                            } else {
                                alias.asname = Some(orig);
                            }
                        }
                    }
                }
            }
            Stmt::Delete { targets } => {
                for target in targets {
                    self.walk_expr(target);
                }
            }
            Stmt::Global { names } | Stmt::Nonlocal { names } => {
                for name in names {
                    self.maybe(name);
                }
            }
            Stmt::Pass | Stmt::Break | Stmt::Continue => {}
        }
    }

    fn walk_expr(&mut self, expr: &mut Expr) {
        match expr {
            Expr::Name { id, .. } => self.maybe(id),
            Expr::Literal(_) => {}
            Expr::Tuple(items) | Expr::List(items) | Expr::BoolOp { values: items, .. } => {
                for item in items {
                    self.walk_expr(item);
                }
            }
            Expr::Dict { keys, values } => {
                for key in keys {
                    self.walk_expr(key);
                }
                for value in values {
                    self.walk_expr(value);
                }
            }
            Expr::Attribute { value, .. } | Expr::Starred(value) => self.walk_expr(value),
            Expr::Subscript { value, index } => {
                self.walk_expr(value);
                self.walk_expr(index);
            }
            Expr::Call { func, args, keywords } => {
                self.walk_expr(func);
                for arg in args {
                    self.walk_expr(arg);
                }
                for kw in keywords {
                    self.walk_expr(&mut kw.value);
                }
            }
            Expr::BinOp { left, right, .. } | Expr::Compare { left, right, .. } => {
                self.walk_expr(left);
                self.walk_expr(right);
            }
            Expr::UnaryOp { operand, .. } => self.walk_expr(operand),
            Expr::IfExp { test, body, orelse } => {
                self.walk_expr(test);
                self.walk_expr(body);
                self.walk_expr(orelse);
            }
            Expr::Lambda { params, body } => {
                for param in params {
                    if let Some(default) = &mut param.default {
                        self.walk_expr(default);
                    }
                    self.maybe(&mut param.name);
                }
                self.walk_expr(body);
            }
            Expr::GeneratorExp { elt, target, iter } => {
                self.walk_expr(iter);
                self.walk_expr(target);
                self.walk_expr(elt);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{FunctionDef, Param};
    use rand::SeedableRng;

    fn generator_for(module: &Module) -> NameGenerator {
        let mut rng = StdRng::seed_from_u64(1);
        NameGenerator::new(collect_identifiers(module), &mut rng)
    }

    fn def(name: &str, params: Vec<Param>, body: Vec<Stmt>) -> Stmt {
        Stmt::FunctionDef(FunctionDef {
            name: name.into(),
            params,
            body,
            decorators: vec![],
            is_async: false,
        })
    }

    #[test]
    fn test_renames_function_and_uses() {
        let mut module = Module {
            body: vec![
                def(
                    "helper",
                    vec![Param::new("value")],
                    vec![Stmt::Return(Some(Expr::name("value")))],
                ),
                Stmt::Expr(Expr::call_name("helper", vec![Expr::int(1)])),
            ],
        };
        let mut generator = generator_for(&module);
        let map = rename_module(&mut module, &FxHashSet::default(), &mut generator).unwrap();
        let obf = map.get("", "helper").unwrap().clone();
        match &module.body[0] {
            Stmt::FunctionDef(def) => assert_eq!(def.name, obf),
            other => panic!("unexpected statement: {other:?}"),
        }
        match &module.body[1] {
            Stmt::Expr(Expr::Call { func, .. }) => {
                assert_eq!(**func, Expr::name(obf.clone()));
            }
            other => panic!("unexpected statement: {other:?}"),
        }
    }

    #[test]
    fn test_same_name_in_two_scopes_gets_two_replacements() {
        let mut module = Module {
            body: vec![
                def(
                    "first",
                    vec![],
                    vec![
                        Stmt::Assign {
                            targets: vec![Expr::store("temp")],
                            value: Expr::int(1),
                        },
                        Stmt::Return(Some(Expr::name("temp"))),
                    ],
                ),
                def(
                    "second",
                    vec![],
                    vec![
                        Stmt::Assign {
                            targets: vec![Expr::store("temp")],
                            value: Expr::int(2),
                        },
                        Stmt::Return(Some(Expr::name("temp"))),
                    ],
                ),
            ],
        };
        let mut generator = generator_for(&module);
        let map = rename_module(&mut module, &FxHashSet::default(), &mut generator).unwrap();
        let first = map.get("first", "temp").unwrap();
        let second = map.get("second", "temp").unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_kwarg_names_are_not_renamed() {
        let mut module = Module {
            body: vec![
                def(
                    "configure",
                    vec![Param::new("seed")],
                    vec![Stmt::Return(Some(Expr::name("seed")))],
                ),
                Stmt::Expr(Expr::Call {
                    func: Box::new(Expr::name("configure")),
                    args: vec![],
                    keywords: vec![crate::ast::Keyword {
                        arg: Some("seed".into()),
                        value: Expr::int(9),
                    }],
                }),
            ],
        };
        let mut protected = FxHashSet::default();
        protected.extend(collect_keyword_arg_names(&module));
        let mut generator = generator_for(&module);
        let map = rename_module(&mut module, &protected, &mut generator).unwrap();
        assert!(map.get("configure", "seed").is_none());
        match &module.body[0] {
            Stmt::FunctionDef(def) => assert_eq!(def.params[0].name, "seed"),
            other => panic!("unexpected statement: {other:?}"),
        }
    }

    #[test]
    fn test_nonlocal_store_resolves_to_enclosing_binding() {
        let inner = def(
            "inner",
            vec![],
            vec![
                Stmt::Nonlocal {
                    names: vec!["total".into()],
                },
                Stmt::Assign {
                    targets: vec![Expr::store("total")],
                    value: Expr::int(2),
                },
            ],
        );
        let mut module = Module {
            body: vec![def(
                "outer",
                vec![],
                vec![
                    Stmt::Assign {
                        targets: vec![Expr::store("total")],
                        value: Expr::int(1),
                    },
                    inner,
                ],
            )],
        };
        let mut generator = generator_for(&module);
        let map = rename_module(&mut module, &FxHashSet::default(), &mut generator).unwrap();
        let outer_total = map.get("outer", "total").unwrap().clone();
        assert!(map.get("outer.inner", "total").is_none());
        let Stmt::FunctionDef(outer) = &module.body[0] else {
            panic!("expected def");
        };
        let Stmt::FunctionDef(inner) = &outer.body[1] else {
            panic!("expected nested def");
        };
        assert_eq!(
            inner.body[0],
            Stmt::Nonlocal {
                names: vec![outer_total.clone()]
            }
        );
        assert_eq!(
            inner.body[1],
            Stmt::Assign {
                targets: vec![Expr::store(outer_total)],
                value: Expr::int(2),
            }
        );
    }

    #[test]
    fn test_dunder_and_builtin_names_protected() {
        let mut module = Module {
            body: vec![Stmt::Assign {
                targets: vec![Expr::store("__version__")],
                value: Expr::call_name("len", vec![Expr::str("x")]),
            }],
        };
        let mut generator = generator_for(&module);
        let map = rename_module(&mut module, &FxHashSet::default(), &mut generator).unwrap();
        assert!(map.is_empty());
    }

    #[test]
    fn test_rename_round_trips_through_reverse() {
        let mut module = Module {
            body: vec![
                def(
                    "outer",
                    vec![Param::new("count")],
                    vec![
                        Stmt::Assign {
                            targets: vec![Expr::store("total")],
                            value: Expr::name("count"),
                        },
                        Stmt::Return(Some(Expr::name("total"))),
                    ],
                ),
                Stmt::Expr(Expr::call_name("outer", vec![Expr::int(3)])),
            ],
        };
        let original = module.clone();
        let mut generator = generator_for(&module);
        let map = rename_module(&mut module, &FxHashSet::default(), &mut generator).unwrap();
        assert_ne!(module, original);
        reverse_rename(&mut module, &map);
        assert_eq!(module, original);
    }

    #[test]
    fn test_artifact_round_trip() {
        let mut map = RenameMap::default();
        map.insert("", "main", "_o0".into());
        map.insert("main", "x", "_o1".into());
        let artifact = map.to_artifact();
        assert_eq!(artifact.get("::main"), Some(&"_o0".to_string()));
        assert_eq!(artifact.get("main::x"), Some(&"_o1".to_string()));
        assert_eq!(RenameMap::from_artifact(&artifact), map);
    }
}
