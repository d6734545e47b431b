//! Builtin aliasing: free-standing builtin references are routed through
//! module-level alias bindings whose initializers come from the builtin
//! strategy pool.

use std::collections::BTreeSet;

use rand::Rng;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::Result;
use crate::ast::{Ctx, Expr, Module, Stmt};
use crate::config::EffectiveConfig;
use crate::methods::BuiltinMethod;
use crate::rng::Determinism;

use super::rename::{BUILTIN_NAMES, NameGenerator, is_dunder};

/// Names bound anywhere in the module; a builtin shadowed by any binding is
/// not aliased.
fn collect_bound_names(module: &Module) -> FxHashSet<String> {
    let mut bound = FxHashSet::default();
    let mut module = module.clone();
    crate::ast::visit_bodies_mut(&mut module.body, &mut |body| {
        for stmt in body.iter() {
            match stmt {
                Stmt::FunctionDef(def) => {
                    bound.insert(def.name.clone());
                    for param in &def.params {
                        bound.insert(param.name.clone());
                    }
                }
                Stmt::ClassDef(def) => {
                    bound.insert(def.name.clone());
                }
                Stmt::Try { handlers, .. } => {
                    for handler in handlers {
                        if let Some(name) = &handler.name {
                            bound.insert(name.clone());
                        }
                    }
                }
                Stmt::Import { names } | Stmt::ImportFrom { names, .. } => {
                    for alias in names {
                        if alias.name != "*" {
                            bound.insert(alias.bound_name().to_string());
                        }
                    }
                }
                Stmt::Global { names } | Stmt::Nonlocal { names } => {
                    bound.extend(names.iter().cloned());
                }
                _ => {}
            }
        }
    });
    crate::ast::visit_exprs_mut(&mut module.body, &mut |expr| match expr {
        Expr::Name { id, ctx } if *ctx != Ctx::Load => {
            bound.insert(id.clone());
        }
        Expr::Lambda { params, .. } => {
            for param in params {
                bound.insert(param.name.clone());
            }
        }
        _ => {}
    });
    bound
}

/// Builtin names used in load position and not shadowed, sorted for
/// deterministic alias assignment.
fn collect_builtin_loads(module: &Module, config: &EffectiveConfig) -> Vec<String> {
    let bound = collect_bound_names(module);
    let mut found = BTreeSet::new();
    let mut module = module.clone();
    crate::ast::visit_exprs_mut(&mut module.body, &mut |expr| {
        if let Expr::Name { id, ctx: Ctx::Load } = expr {
            if BUILTIN_NAMES.contains(id.as_str())
                && !bound.contains(id)
                && !config.preserve_names.contains(id)
                && !is_dunder(id)
            {
                found.insert(id.clone());
            }
        }
    });
    found.into_iter().collect()
}

fn alias_value(method: BuiltinMethod, builtin: &str) -> Expr {
    match method {
        BuiltinMethod::BuiltinsGetattrAlias => Expr::call_name(
            "getattr",
            vec![Expr::dunder_import("builtins"), Expr::str(builtin)],
        ),
        BuiltinMethod::GlobalsLookup => Expr::call(
            Expr::attr(Expr::call_name("globals", vec![]), "get"),
            vec![Expr::str(builtin), Expr::name(builtin)],
        ),
        BuiltinMethod::Alias => Expr::name(builtin),
    }
}

pub fn obfuscate_builtins(
    module: &mut Module,
    config: &EffectiveConfig,
    det: &Determinism,
    generator: &mut NameGenerator,
) -> Result<usize> {
    let targets = collect_builtin_loads(module, config);
    if targets.is_empty() {
        return Ok(0);
    }

    let mut alias_map: FxHashMap<String, String> = FxHashMap::default();
    for name in &targets {
        alias_map.insert(name.clone(), generator.next_name()?);
    }

    let mut counter = 0u64;
    let mut changed = 0;
    crate::ast::visit_exprs_mut(&mut module.body, &mut |expr| {
        let Expr::Name { id, ctx: Ctx::Load } = expr else {
            return;
        };
        let Some(alias) = alias_map.get(id) else {
            return;
        };
        let site = counter;
        counter += 1;
        let mut rng = det.site_rng("builtins", 0, site);
        if !rng.gen_bool(config.builtin_rate) {
            return;
        }
        *id = alias.clone();
        changed += 1;
    });

    if changed > 0 {
        let pool = &config.methods.builtin;
        let insert_at = if config.keep_docstrings {
            crate::ast::docstring_insert_index(&module.body)
        } else {
            0
        };
        for (index, name) in targets.iter().enumerate().rev() {
            let mut rng = det.site_rng("builtin_alias", 0, index as u64);
            let method = pool[rng.gen_range(0..pool.len())];
            module.body.insert(
                insert_at,
                Stmt::Assign {
                    targets: vec![Expr::store(alias_map[name].clone())],
                    value: alias_value(method, name),
                },
            );
        }
    }
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RawOptions;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn generator(module: &Module) -> NameGenerator {
        let mut rng = StdRng::seed_from_u64(5);
        NameGenerator::new(super::super::rename::collect_identifiers(module), &mut rng)
    }

    #[test]
    fn test_builtin_load_is_aliased() {
        let mut module = Module {
            body: vec![Stmt::Expr(Expr::call_name("print", vec![Expr::str("hi")]))],
        };
        let config = RawOptions {
            builtin_rate: Some(1.0),
            ..RawOptions::default()
        }
        .resolve()
        .unwrap();
        let det = Determinism::new(6, 0);
        let mut generator = generator(&module);
        let changed = obfuscate_builtins(&mut module, &config, &det, &mut generator).unwrap();
        assert_eq!(changed, 1);
        // Alias assignment first, rewritten call second.
        assert_eq!(module.body.len(), 2);
        let Stmt::Assign { targets, .. } = &module.body[0] else {
            panic!("expected alias assignment, got {:?}", module.body[0]);
        };
        let Expr::Name { id: alias, .. } = &targets[0] else {
            panic!("expected name target");
        };
        let Stmt::Expr(Expr::Call { func, .. }) = &module.body[1] else {
            panic!("expected call");
        };
        assert_eq!(**func, Expr::name(alias.clone()));
    }

    #[test]
    fn test_shadowed_builtin_not_aliased() {
        let module = Module {
            body: vec![
                Stmt::Assign {
                    targets: vec![Expr::store("print")],
                    value: Expr::name("len"),
                },
                Stmt::Expr(Expr::call_name("print", vec![])),
            ],
        };
        let config = RawOptions::default().resolve().unwrap();
        // `print` is shadowed by the assignment; only `len` qualifies.
        let targets = collect_builtin_loads(&module, &config);
        assert_eq!(targets, vec!["len".to_string()]);
    }
}
