//! Attribute write/delete indirection: `obj.attr = v` becomes a
//! `setattr`-shaped call statement, `del obj.attr` a `delattr`-shaped one.

use rand::Rng;
use rand::rngs::StdRng;

use crate::ast::{Expr, Module, Param, Stmt};
use crate::config::EffectiveConfig;
use crate::methods::SetattrMethod;
use crate::rng::Determinism;

use super::rename::is_dunder;

fn allowed(attr: &str, config: &EffectiveConfig) -> bool {
    !config.preserve_attrs.contains(attr) && !is_dunder(attr)
}

fn pick_setter(pool: &[SetattrMethod], rng: &mut StdRng) -> SetattrMethod {
    let setters: Vec<SetattrMethod> = pool.iter().copied().filter(|m| m.is_setter()).collect();
    if setters.is_empty() {
        SetattrMethod::Setattr
    } else {
        setters[rng.gen_range(0..setters.len())]
    }
}

fn pick_deleter(pool: &[SetattrMethod], rng: &mut StdRng) -> SetattrMethod {
    let deleters: Vec<SetattrMethod> = pool.iter().copied().filter(|m| !m.is_setter()).collect();
    if deleters.is_empty() {
        SetattrMethod::Delattr
    } else {
        deleters[rng.gen_range(0..deleters.len())]
    }
}

fn set_expr(method: SetattrMethod, obj: Expr, attr: &str, value: Expr) -> Expr {
    match method {
        SetattrMethod::BuiltinsSetattr => Expr::call(
            Expr::attr(Expr::dunder_import("builtins"), "setattr"),
            vec![obj, Expr::str(attr), value],
        ),
        SetattrMethod::LambdaSetattr => {
            let lam = Expr::lambda(
                vec![Param::new("_o"), Param::new("_n"), Param::new("_v")],
                Expr::call_name(
                    "setattr",
                    vec![Expr::name("_o"), Expr::name("_n"), Expr::name("_v")],
                ),
            );
            Expr::call(lam, vec![obj, Expr::str(attr), value])
        }
        _ => Expr::call_name("setattr", vec![obj, Expr::str(attr), value]),
    }
}

fn del_expr(method: SetattrMethod, obj: Expr, attr: &str) -> Expr {
    match method {
        SetattrMethod::BuiltinsDelattr => Expr::call(
            Expr::attr(Expr::dunder_import("builtins"), "delattr"),
            vec![obj, Expr::str(attr)],
        ),
        SetattrMethod::LambdaDelattr => {
            let lam = Expr::lambda(
                vec![Param::new("_o"), Param::new("_n")],
                Expr::call_name("delattr", vec![Expr::name("_o"), Expr::name("_n")]),
            );
            Expr::call(lam, vec![obj, Expr::str(attr)])
        }
        _ => Expr::call_name("delattr", vec![obj, Expr::str(attr)]),
    }
}

pub fn obfuscate_setattrs(
    module: &mut Module,
    config: &EffectiveConfig,
    det: &Determinism,
    iteration: u32,
) -> usize {
    let pool = config.methods.setattr.clone();
    let mut counter = 0u64;
    let mut changed = 0;
    crate::ast::visit_bodies_mut(&mut module.body, &mut |body| {
        let mut out: Vec<Stmt> = Vec::with_capacity(body.len());
        for stmt in body.drain(..) {
            match stmt {
                Stmt::Assign { targets, value }
                    if targets.len() == 1
                        && matches!(
                            &targets[0],
                            Expr::Attribute { attr, .. } if allowed(attr, config)
                        ) =>
                {
                    let site = counter;
                    counter += 1;
                    let mut rng = det.site_rng("setattrs", iteration, site);
                    if !rng.gen_bool(config.setattr_rate) {
                        out.push(Stmt::Assign { targets, value });
                        continue;
                    }
                    let mut targets = targets;
                    let Some(Expr::Attribute { value: obj, attr, .. }) = targets.pop() else {
                        unreachable!("matched above");
                    };
                    let method = pick_setter(&pool, &mut rng);
                    out.push(Stmt::Expr(set_expr(method, *obj, &attr, value)));
                    changed += 1;
                }
                Stmt::Delete { targets }
                    if !targets.is_empty()
                        && targets.iter().all(|t| {
                            matches!(t, Expr::Attribute { attr, .. } if allowed(attr, config))
                        }) =>
                {
                    let site = counter;
                    counter += 1;
                    let mut rng = det.site_rng("setattrs", iteration, site);
                    if !rng.gen_bool(config.setattr_rate) {
                        out.push(Stmt::Delete { targets });
                        continue;
                    }
                    for target in targets {
                        let Expr::Attribute { value: obj, attr, .. } = target else {
                            unreachable!("matched above");
                        };
                        let method = pick_deleter(&pool, &mut rng);
                        out.push(Stmt::Expr(del_expr(method, *obj, &attr)));
                        changed += 1;
                    }
                }
                other => out.push(other),
            }
        }
        *body = out;
    });
    changed
}
