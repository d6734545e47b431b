//! Frontline redirect: top-level definitions get per-kind resolver tables,
//! and deferred use sites (function and lambda bodies) are rewritten to go
//! through the table. Tables are built after renaming, so their keys are the
//! post-rename names, and are inserted directly after the last redirected
//! definition. Module-level uses may execute before that point and are left
//! direct.

use rand::Rng;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::Result;
use crate::ast::{Ctx, Expr, Module, Stmt};
use crate::config::{EffectiveConfig, RedirectKind, RedirectMode};
use crate::rng::Determinism;

use super::rename::NameGenerator;

#[derive(Debug)]
struct Selected {
    name: String,
    kind: RedirectKind,
    stmt_index: usize,
}

fn top_level_symbols(module: &Module) -> Vec<Selected> {
    let mut symbols = Vec::new();
    for (index, stmt) in module.body.iter().enumerate() {
        match stmt {
            Stmt::FunctionDef(def) => symbols.push(Selected {
                name: def.name.clone(),
                kind: RedirectKind::Function,
                stmt_index: index,
            }),
            Stmt::ClassDef(def) => symbols.push(Selected {
                name: def.name.clone(),
                kind: RedirectKind::Class,
                stmt_index: index,
            }),
            Stmt::Assign { targets, .. } => {
                if let [Expr::Name { id, .. }] = targets.as_slice() {
                    symbols.push(Selected {
                        name: id.clone(),
                        kind: RedirectKind::Variable,
                        stmt_index: index,
                    });
                }
            }
            _ => {}
        }
    }
    symbols
}

fn build_table(
    mode: RedirectMode,
    table_name: &str,
    symbols: &[String],
) -> (Option<Stmt>, FxHashMap<String, Expr>) {
    let mut uses = FxHashMap::default();
    let table = match mode {
        RedirectMode::DictGet => {
            for symbol in symbols {
                uses.insert(
                    symbol.clone(),
                    Expr::subscript(Expr::name(table_name), Expr::str(symbol.clone())),
                );
            }
            Some(dict_of(symbols))
        }
        RedirectMode::Lambda => {
            for symbol in symbols {
                uses.insert(
                    symbol.clone(),
                    Expr::call_name(table_name, vec![Expr::str(symbol.clone())]),
                );
            }
            Some(Expr::lambda(
                vec![crate::ast::Param::new("_k")],
                Expr::subscript(dict_of(symbols), Expr::name("_k")),
            ))
        }
        RedirectMode::GlobalsGet => {
            for symbol in symbols {
                uses.insert(
                    symbol.clone(),
                    Expr::subscript(Expr::call_name("globals", vec![]), Expr::str(symbol.clone())),
                );
            }
            None
        }
        RedirectMode::Itemgetter => {
            for (index, symbol) in symbols.iter().enumerate() {
                let getter = Expr::call(
                    Expr::attr(Expr::dunder_import("operator"), "itemgetter"),
                    vec![Expr::int(index as i64)],
                );
                uses.insert(symbol.clone(), Expr::call(getter, vec![Expr::name(table_name)]));
            }
            Some(Expr::Tuple(symbols.iter().map(Expr::name).collect()))
        }
    };
    let stmt = table.map(|value| Stmt::Assign {
        targets: vec![Expr::store(table_name)],
        value,
    });
    (stmt, uses)
}

fn dict_of(symbols: &[String]) -> Expr {
    Expr::Dict {
        keys: symbols.iter().map(|s| Expr::str(s.clone())).collect(),
        values: symbols.iter().map(Expr::name).collect(),
    }
}

/// Names bound directly inside one function scope (not nested defs); loads
/// of these are locals and must not be redirected.
fn local_binds(def: &crate::ast::FunctionDef) -> FxHashSet<String> {
    let mut bound: FxHashSet<String> = def.params.iter().map(|p| p.name.clone()).collect();
    let mut globals = FxHashSet::default();
    fn walk(body: &[Stmt], bound: &mut FxHashSet<String>, globals: &mut FxHashSet<String>) {
        for stmt in body {
            match stmt {
                Stmt::FunctionDef(inner) => {
                    bound.insert(inner.name.clone());
                }
                Stmt::ClassDef(inner) => {
                    bound.insert(inner.name.clone());
                }
                Stmt::Assign { targets, .. } | Stmt::Delete { targets } => {
                    for target in targets {
                        bind_target(target, bound);
                    }
                }
                Stmt::AugAssign { target, .. } => bind_target(target, bound),
                Stmt::For { target, body, orelse, .. } => {
                    bind_target(target, bound);
                    walk(body, bound, globals);
                    walk(orelse, bound, globals);
                }
                Stmt::If { body, orelse, .. } => {
                    walk(body, bound, globals);
                    walk(orelse, bound, globals);
                }
                Stmt::While { body, .. } => walk(body, bound, globals),
                Stmt::Try { body, handlers, orelse, finalbody } => {
                    walk(body, bound, globals);
                    for handler in handlers {
                        if let Some(name) = &handler.name {
                            bound.insert(name.clone());
                        }
                        walk(&handler.body, bound, globals);
                    }
                    walk(orelse, bound, globals);
                    walk(finalbody, bound, globals);
                }
                Stmt::Import { names } | Stmt::ImportFrom { names, .. } => {
                    for alias in names {
                        if alias.name != "*" {
                            bound.insert(alias.bound_name().to_string());
                        }
                    }
                }
                Stmt::Global { names } => globals.extend(names.iter().cloned()),
                _ => {}
            }
        }
    }
    fn bind_target(target: &Expr, bound: &mut FxHashSet<String>) {
        match target {
            Expr::Name { id, ctx } if *ctx != Ctx::Load => {
                bound.insert(id.clone());
            }
            Expr::Tuple(items) | Expr::List(items) => {
                for item in items {
                    bind_target(item, bound);
                }
            }
            Expr::Starred(inner) => bind_target(inner, bound),
            _ => {}
        }
    }
    walk(&def.body, &mut bound, &mut globals);
    for name in &globals {
        bound.remove(name);
    }
    bound
}

struct Rewriter<'a> {
    replacements: &'a FxHashMap<String, Expr>,
    shadows: Vec<FxHashSet<String>>,
    changed: usize,
}

impl<'a> Rewriter<'a> {
    fn is_shadowed(&self, name: &str) -> bool {
        self.shadows.iter().any(|set| set.contains(name))
    }

    /// Module- and class-level statements run before the tables exist, so
    /// only deferred bodies are rewritten.
    fn walk_immediate(&mut self, body: &mut [Stmt]) {
        for stmt in body {
            match stmt {
                Stmt::FunctionDef(def) => {
                    self.shadows.push(local_binds(def));
                    for stmt in &mut def.body {
                        self.walk_deferred_stmt(stmt);
                    }
                    self.shadows.pop();
                }
                Stmt::ClassDef(def) => self.walk_immediate(&mut def.body),
                Stmt::If { body, orelse, .. } => {
                    self.walk_immediate(body);
                    self.walk_immediate(orelse);
                }
                Stmt::While { body, .. } => self.walk_immediate(body),
                Stmt::For { body, orelse, .. } => {
                    self.walk_immediate(body);
                    self.walk_immediate(orelse);
                }
                Stmt::Try { body, handlers, orelse, finalbody } => {
                    self.walk_immediate(body);
                    for handler in handlers {
                        self.walk_immediate(&mut handler.body);
                    }
                    self.walk_immediate(orelse);
                    self.walk_immediate(finalbody);
                }
                _ => {}
            }
        }
    }

    fn walk_deferred_stmt(&mut self, stmt: &mut Stmt) {
        match stmt {
            Stmt::FunctionDef(def) => {
                self.shadows.push(local_binds(def));
                for stmt in &mut def.body {
                    self.walk_deferred_stmt(stmt);
                }
                self.shadows.pop();
            }
            Stmt::ClassDef(def) => {
                for base in &mut def.bases {
                    self.rewrite_expr(base);
                }
                for stmt in &mut def.body {
                    self.walk_deferred_stmt(stmt);
                }
            }
            Stmt::Assign { targets, value } => {
                for target in targets {
                    self.rewrite_expr(target);
                }
                self.rewrite_expr(value);
            }
            Stmt::AugAssign { target, value, .. } => {
                self.rewrite_expr(target);
                self.rewrite_expr(value);
            }
            Stmt::Return(value) | Stmt::Raise(value) => {
                if let Some(value) = value {
                    self.rewrite_expr(value);
                }
            }
            Stmt::Expr(value) => self.rewrite_expr(value),
            Stmt::If { test, body, orelse } => {
                self.rewrite_expr(test);
                for stmt in body.iter_mut().chain(orelse.iter_mut()) {
                    self.walk_deferred_stmt(stmt);
                }
            }
            Stmt::While { test, body } => {
                self.rewrite_expr(test);
                for stmt in body {
                    self.walk_deferred_stmt(stmt);
                }
            }
            Stmt::For { target, iter, body, orelse } => {
                self.rewrite_expr(target);
                self.rewrite_expr(iter);
                for stmt in body.iter_mut().chain(orelse.iter_mut()) {
                    self.walk_deferred_stmt(stmt);
                }
            }
            Stmt::Try { body, handlers, orelse, finalbody } => {
                for stmt in body.iter_mut() {
                    self.walk_deferred_stmt(stmt);
                }
                for handler in handlers {
                    if let Some(typ) = &mut handler.typ {
                        self.rewrite_expr(typ);
                    }
                    for stmt in &mut handler.body {
                        self.walk_deferred_stmt(stmt);
                    }
                }
                for stmt in orelse.iter_mut().chain(finalbody.iter_mut()) {
                    self.walk_deferred_stmt(stmt);
                }
            }
            Stmt::Delete { targets } => {
                for target in targets {
                    self.rewrite_expr(target);
                }
            }
            _ => {}
        }
    }

    fn rewrite_expr(&mut self, expr: &mut Expr) {
        if let Expr::Name { id, ctx: Ctx::Load } = expr {
            if !self.is_shadowed(id) {
                if let Some(replacement) = self.replacements.get(id) {
                    *expr = replacement.clone();
                    self.changed += 1;
                    return;
                }
            }
        }
        match expr {
            Expr::Name { .. } | Expr::Literal(_) => {}
            Expr::Tuple(items) | Expr::List(items) | Expr::BoolOp { values: items, .. } => {
                for item in items {
                    self.rewrite_expr(item);
                }
            }
            Expr::Dict { keys, values } => {
                for key in keys {
                    self.rewrite_expr(key);
                }
                for value in values {
                    self.rewrite_expr(value);
                }
            }
            Expr::Attribute { value, .. } | Expr::Starred(value) => self.rewrite_expr(value),
            Expr::Subscript { value, index } => {
                self.rewrite_expr(value);
                self.rewrite_expr(index);
            }
            Expr::Call { func, args, keywords } => {
                self.rewrite_expr(func);
                for arg in args {
                    self.rewrite_expr(arg);
                }
                for kw in keywords {
                    self.rewrite_expr(&mut kw.value);
                }
            }
            Expr::BinOp { left, right, .. } | Expr::Compare { left, right, .. } => {
                self.rewrite_expr(left);
                self.rewrite_expr(right);
            }
            Expr::UnaryOp { operand, .. } => self.rewrite_expr(operand),
            Expr::IfExp { test, body, orelse } => {
                self.rewrite_expr(test);
                self.rewrite_expr(body);
                self.rewrite_expr(orelse);
            }
            Expr::Lambda { params, body } => {
                let shadow: FxHashSet<String> =
                    params.iter().map(|p| p.name.clone()).collect();
                self.shadows.push(shadow);
                self.rewrite_expr(body);
                self.shadows.pop();
            }
            Expr::GeneratorExp { elt, target, iter } => {
                self.rewrite_expr(iter);
                let mut shadow = FxHashSet::default();
                collect_target_names(target, &mut shadow);
                self.shadows.push(shadow);
                self.rewrite_expr(elt);
                self.shadows.pop();
            }
        }
    }
}

fn collect_target_names(target: &Expr, names: &mut FxHashSet<String>) {
    match target {
        Expr::Name { id, .. } => {
            names.insert(id.clone());
        }
        Expr::Tuple(items) | Expr::List(items) => {
            for item in items {
                collect_target_names(item, names);
            }
        }
        Expr::Starred(inner) => collect_target_names(inner, names),
        _ => {}
    }
}

pub fn redirect_frontline(
    module: &mut Module,
    config: &EffectiveConfig,
    det: &Determinism,
    generator: &mut NameGenerator,
) -> Result<usize> {
    let redirect = &config.redirect;
    if redirect.kinds.is_empty() {
        return Ok(0);
    }

    let symbols = top_level_symbols(module);
    let mut selected: FxHashMap<RedirectKind, Vec<String>> = FxHashMap::default();
    let mut seen: FxHashSet<String> = FxHashSet::default();
    let mut total = 0usize;
    let mut last_def_index = 0usize;
    for (index, symbol) in symbols.iter().enumerate() {
        if !redirect.kinds.iter().any(|(kind, _)| *kind == symbol.kind) {
            continue;
        }
        if !seen.insert(symbol.name.clone()) {
            continue;
        }
        if !redirect.all {
            if total >= redirect.max {
                break;
            }
            let mut rng = det.site_rng("redirect", 0, index as u64);
            if !rng.gen_bool(redirect.rate) {
                continue;
            }
        }
        selected.entry(symbol.kind).or_default().push(symbol.name.clone());
        last_def_index = last_def_index.max(symbol.stmt_index);
        total += 1;
    }
    if total == 0 {
        return Ok(0);
    }

    let mut replacements: FxHashMap<String, Expr> = FxHashMap::default();
    let mut tables: Vec<Stmt> = Vec::new();
    for (kind, mode) in &redirect.kinds {
        let Some(names) = selected.get(kind) else {
            continue;
        };
        let table_name = generator.next_name()?;
        let (table, uses) = build_table(*mode, &table_name, names);
        tables.extend(table);
        replacements.extend(uses);
    }

    let mut rewriter = Rewriter {
        replacements: &replacements,
        shadows: Vec::new(),
        changed: 0,
    };
    rewriter.walk_immediate(&mut module.body);
    let changed = rewriter.changed;

    // Tables land right after the last selected definition, so every symbol
    // they capture exists and any trailing module-level code that calls into
    // rewritten functions finds them populated.
    let insert_at = (last_def_index + 1).min(module.body.len());
    for table in tables.into_iter().rev() {
        module.body.insert(insert_at, table);
    }
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RawOptions;
    use crate::ast::{FunctionDef, Param};
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn sample_module() -> Module {
        Module {
            body: vec![
                Stmt::FunctionDef(FunctionDef {
                    name: "compute".into(),
                    params: vec![],
                    body: vec![Stmt::Return(Some(Expr::int(1)))],
                    decorators: vec![],
                    is_async: false,
                }),
                Stmt::FunctionDef(FunctionDef {
                    name: "caller".into(),
                    params: vec![],
                    body: vec![Stmt::Return(Some(Expr::call_name("compute", vec![])))],
                    decorators: vec![],
                    is_async: false,
                }),
                Stmt::Expr(Expr::call_name("caller", vec![])),
            ],
        }
    }

    fn run(config: &EffectiveConfig, module: &mut Module) -> usize {
        let det = Determinism::new(17, 0);
        let mut rng = StdRng::seed_from_u64(17);
        let mut generator = NameGenerator::new(
            super::super::rename::collect_identifiers(module),
            &mut rng,
        );
        redirect_frontline(module, config, &det, &mut generator).unwrap()
    }

    #[test]
    fn test_redirect_all_rewrites_deferred_uses_only() {
        let mut module = sample_module();
        let config = RawOptions {
            redirect_kinds: vec!["function".into()],
            redirect_all: true,
            ..RawOptions::default()
        }
        .resolve()
        .unwrap();
        let changed = run(&config, &mut module);
        assert_eq!(changed, 1, "only the call inside `caller` is deferred");
        // Table inserted after the last redirected definition, before the
        // trailing module-level call, which itself stays direct.
        assert!(matches!(&module.body[2], Stmt::Assign { .. }));
        assert_eq!(module.body[3], Stmt::Expr(Expr::call_name("caller", vec![])));
        let Stmt::FunctionDef(def) = &module.body[1] else {
            panic!("expected def");
        };
        let Stmt::Return(Some(Expr::Call { func, .. })) = &def.body[0] else {
            panic!("expected return call, got {:?}", def.body[0]);
        };
        assert!(
            matches!(func.as_ref(), Expr::Subscript { .. }),
            "expected dict_get lookup, got {func:?}"
        );
    }

    #[test]
    fn test_redirect_all_ignores_cap_and_rate() {
        let mut module = sample_module();
        let config = RawOptions {
            redirect_kinds: vec!["function".into()],
            redirect_all: true,
            redirect_rate: Some(0.0),
            redirect_max: Some(0),
            ..RawOptions::default()
        }
        .resolve()
        .unwrap();
        assert!(run(&config, &mut module) > 0);
    }

    #[test]
    fn test_shadowed_local_not_redirected() {
        let mut module = Module {
            body: vec![
                Stmt::FunctionDef(FunctionDef {
                    name: "compute".into(),
                    params: vec![],
                    body: vec![Stmt::Return(Some(Expr::int(1)))],
                    decorators: vec![],
                    is_async: false,
                }),
                Stmt::FunctionDef(FunctionDef {
                    name: "other".into(),
                    params: vec![Param::new("compute")],
                    body: vec![Stmt::Return(Some(Expr::call_name("compute", vec![])))],
                    decorators: vec![],
                    is_async: false,
                }),
            ],
        };
        let config = RawOptions {
            redirect_kinds: vec!["function".into()],
            redirect_all: true,
            ..RawOptions::default()
        }
        .resolve()
        .unwrap();
        assert_eq!(run(&config, &mut module), 0);
    }

    #[test]
    fn test_rate_zero_without_all_selects_nothing() {
        let mut module = sample_module();
        let config = RawOptions {
            redirect_kinds: vec!["function".into()],
            redirect_rate: Some(0.0),
            ..RawOptions::default()
        }
        .resolve()
        .unwrap();
        assert_eq!(run(&config, &mut module), 0);
        assert_eq!(module.body.len(), 3, "no table emitted when nothing selected");
    }
}
