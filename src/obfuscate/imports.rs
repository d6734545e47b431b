//! Import indirection: plain import statements become dynamic-loader or
//! namespace-lookup bindings. Star imports and shapes the chosen strategy
//! cannot express are left unmodified.

use rand::Rng;
use rand::rngs::StdRng;
use tracing::debug;

use crate::ast::{Expr, ImportAlias, Module, Stmt};
use crate::config::EffectiveConfig;
use crate::methods::ImportMethod;
use crate::rng::Determinism;
use crate::{Error, Result};

fn importlib_module(module_name: &str) -> Expr {
    Expr::call(
        Expr::attr(Expr::dunder_import("importlib"), "import_module"),
        vec![Expr::str(module_name)],
    )
}

/// `import a.b` binds the top-level package, which is exactly what
/// `__import__("a.b")` returns; an `as` binding needs the leaf module and
/// therefore the importlib form.
fn import_binding(alias: &ImportAlias, method: ImportMethod, pool: &[ImportMethod]) -> Result<Stmt> {
    let needs_leaf = alias.asname.is_some() && alias.name.contains('.');
    let method = if needs_leaf {
        if pool.contains(&ImportMethod::ImportlibModule) {
            ImportMethod::ImportlibModule
        } else {
            return Err(Error::UnsupportedSiteShape(format!(
                "dotted `as` import of {} needs the importlib strategy",
                alias.name
            )));
        }
    } else {
        method
    };
    let value = match method {
        ImportMethod::DunderImport => Expr::dunder_import(&alias.name),
        ImportMethod::ImportlibModule => importlib_module(&alias.name),
        ImportMethod::GlobalsLookup => Expr::call(
            Expr::call(
                Expr::attr(Expr::call_name("globals", vec![]), "get"),
                vec![Expr::str("__import__"), Expr::name("__import__")],
            ),
            vec![Expr::str(&alias.name)],
        ),
    };
    Ok(Stmt::Assign {
        targets: vec![Expr::store(alias.bound_name())],
        value,
    })
}

/// `from m import a as b` becomes `b = getattr(import_module("m"), "a")`.
fn import_from_binding(module_name: &str, alias: &ImportAlias) -> Stmt {
    let value = Expr::call_name(
        "getattr",
        vec![importlib_module(module_name), Expr::str(&alias.name)],
    );
    Stmt::Assign {
        targets: vec![Expr::store(alias.bound_name())],
        value,
    }
}

fn rewrite_import(stmt: Stmt, config: &EffectiveConfig, rng: &mut StdRng) -> Vec<Stmt> {
    let pool = &config.methods.import;
    match stmt {
        Stmt::Import { names } => {
            let mut bindings = Vec::with_capacity(names.len());
            let mut skipped = false;
            for alias in &names {
                let method = pool[rng.gen_range(0..pool.len())];
                match import_binding(alias, method, pool) {
                    Ok(binding) => bindings.push(binding),
                    // Per-site recovery: the statement is left unmodified,
                    // never partially rewritten.
                    Err(err) => {
                        debug!(%err, "import site skipped");
                        skipped = true;
                        break;
                    }
                }
            }
            if skipped {
                vec![Stmt::Import { names }]
            } else {
                bindings
            }
        }
        Stmt::ImportFrom { module, names } => {
            if names.iter().any(|alias| alias.name == "*")
                || !pool.contains(&ImportMethod::ImportlibModule)
            {
                return vec![Stmt::ImportFrom { module, names }];
            }
            names
                .iter()
                .map(|alias| import_from_binding(&module, alias))
                .collect()
        }
        other => vec![other],
    }
}

pub fn obfuscate_imports(
    module: &mut Module,
    config: &EffectiveConfig,
    det: &Determinism,
    iteration: u32,
) -> usize {
    let mut counter = 0u64;
    let mut changed = 0;
    crate::ast::visit_bodies_mut(&mut module.body, &mut |body| {
        let mut out: Vec<Stmt> = Vec::with_capacity(body.len());
        for stmt in body.drain(..) {
            if !matches!(stmt, Stmt::Import { .. } | Stmt::ImportFrom { .. }) {
                out.push(stmt);
                continue;
            }
            let site = counter;
            counter += 1;
            let mut rng = det.site_rng("imports", iteration, site);
            if !rng.gen_bool(config.import_rate) {
                out.push(stmt);
                continue;
            }
            let rewritten = rewrite_import(stmt, config, &mut rng);
            let still_import = rewritten
                .iter()
                .any(|s| matches!(s, Stmt::Import { .. } | Stmt::ImportFrom { .. }));
            if !still_import {
                changed += 1;
            }
            out.extend(rewritten);
        }
        *body = out;
    });
    changed
}
