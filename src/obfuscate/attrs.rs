//! Attribute-load indirection: `obj.attr` becomes a `getattr`-shaped lookup
//! drawn from the eligible strategy pool, with the attribute name itself
//! optionally decomposed.

use rand::Rng;
use rand::rngs::StdRng;

use crate::ast::{Ctx, Expr, Module, Param};
use crate::config::EffectiveConfig;
use crate::methods::AttrMethod;
use crate::rng::Determinism;

use super::rename::is_dunder;

/// The attribute name as an expression: plain string, character join, or
/// `chr`-generator join.
fn attr_name_expr(attr: &str, rng: &mut StdRng) -> Expr {
    let join = |arg: Expr| Expr::call(Expr::attr(Expr::str(""), "join"), vec![arg]);
    match rng.gen_range(0..3u8) {
        0 if attr.chars().count() > 1 => {
            let chars = attr.chars().map(|ch| Expr::str(ch.to_string())).collect();
            join(Expr::Tuple(chars))
        }
        1 => {
            let ords = attr
                .chars()
                .map(|ch| Expr::int(i64::from(ch as u32)))
                .collect();
            join(Expr::GeneratorExp {
                elt: Box::new(Expr::call_name("chr", vec![Expr::name("_c")])),
                target: Box::new(Expr::store("_c")),
                iter: Box::new(Expr::Tuple(ords)),
            })
        }
        _ => Expr::str(attr),
    }
}

fn build_attr_load(method: AttrMethod, obj: Expr, attr: &str, rng: &mut StdRng) -> Expr {
    let attr_expr = attr_name_expr(attr, rng);
    match method {
        AttrMethod::BuiltinsGetattr => Expr::call(
            Expr::attr(Expr::dunder_import("builtins"), "getattr"),
            vec![obj, attr_expr],
        ),
        AttrMethod::OperatorAttrgetter => {
            let getter = Expr::call(
                Expr::attr(Expr::dunder_import("operator"), "attrgetter"),
                vec![attr_expr],
            );
            Expr::call(getter, vec![obj])
        }
        AttrMethod::LambdaGetattr => {
            let lam = Expr::lambda(
                vec![Param::new("_o"), Param::new("_n")],
                Expr::call_name("getattr", vec![Expr::name("_o"), Expr::name("_n")]),
            );
            Expr::call(lam, vec![obj, attr_expr])
        }
        AttrMethod::GlobalsGetattr => {
            let lookup = Expr::call(
                Expr::attr(Expr::call_name("globals", vec![]), "get"),
                vec![Expr::str("getattr"), Expr::name("getattr")],
            );
            Expr::call(lookup, vec![obj, attr_expr])
        }
        AttrMethod::LocalsGetattr => {
            // Local dict fallback form; ultimately resolves to builtin getattr.
            let local_lookup = Expr::call(
                Expr::attr(Expr::call_name("locals", vec![]), "get"),
                vec![Expr::str("getattr")],
            );
            let func = Expr::BoolOp {
                op: crate::ast::BoolOpKind::Or,
                values: vec![local_lookup, Expr::name("getattr")],
            };
            Expr::call(func, vec![obj, attr_expr])
        }
        AttrMethod::Getattr => Expr::call_name("getattr", vec![obj, attr_expr]),
    }
}

pub fn obfuscate_attrs(
    module: &mut Module,
    config: &EffectiveConfig,
    det: &Determinism,
    iteration: u32,
) -> usize {
    let pool = &config.methods.attr;
    let mut counter = 0u64;
    let mut changed = 0;
    crate::ast::visit_exprs_mut(&mut module.body, &mut |expr| {
        let Expr::Attribute { attr, ctx, .. } = expr else {
            return;
        };
        if *ctx != Ctx::Load || config.preserve_attrs.contains(attr) || is_dunder(attr) {
            return;
        }
        let site = counter;
        counter += 1;
        let mut rng = det.site_rng("attrs", iteration, site);
        if !rng.gen_bool(config.attr_rate) {
            return;
        }
        let method = pool[rng.gen_range(0..pool.len())];
        let Expr::Attribute { value, attr, .. } = std::mem::replace(expr, Expr::none()) else {
            unreachable!("matched above");
        };
        *expr = build_attr_load(method, *value, &attr, &mut rng);
        changed += 1;
    });
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Stmt;
    use crate::{RawOptions, config::AttrMode};

    fn attr_module() -> Module {
        Module {
            body: vec![Stmt::Expr(Expr::attr(Expr::name("obj"), "field"))],
        }
    }

    fn config_with_mode(mode: AttrMode) -> EffectiveConfig {
        RawOptions {
            attr_mode: Some(mode),
            attr_rate: Some(1.0),
            ..RawOptions::default()
        }
        .resolve()
        .unwrap()
    }

    #[test]
    fn test_getattr_mode_rewrites_load() {
        let mut module = attr_module();
        let config = config_with_mode(AttrMode::Getattr);
        let det = Determinism::new(1, 0);
        let changed = obfuscate_attrs(&mut module, &config, &det, 0);
        assert_eq!(changed, 1);
        let Stmt::Expr(Expr::Call { func, args, .. }) = &module.body[0] else {
            panic!("expected call statement, got {:?}", module.body[0]);
        };
        assert_eq!(**func, Expr::name("getattr"));
        assert_eq!(args[0], Expr::name("obj"));
    }

    #[test]
    fn test_preserved_and_dunder_attrs_untouched() {
        let mut module = Module {
            body: vec![
                Stmt::Expr(Expr::attr(Expr::name("obj"), "append")),
                Stmt::Expr(Expr::attr(Expr::name("obj"), "__dict__")),
            ],
        };
        let config = config_with_mode(AttrMode::Getattr);
        let det = Determinism::new(1, 0);
        assert_eq!(obfuscate_attrs(&mut module, &config, &det, 0), 0);
    }

    #[test]
    fn test_store_context_untouched() {
        let mut module = Module {
            body: vec![Stmt::Assign {
                targets: vec![Expr::Attribute {
                    value: Box::new(Expr::name("obj")),
                    attr: "field".into(),
                    ctx: Ctx::Store,
                }],
                value: Expr::int(1),
            }],
        };
        let config = config_with_mode(AttrMode::Getattr);
        let det = Determinism::new(1, 0);
        assert_eq!(obfuscate_attrs(&mut module, &config, &det, 0), 0);
    }

    #[test]
    fn test_rate_zero_touches_nothing() {
        let mut module = attr_module();
        let config = RawOptions {
            attr_rate: Some(0.0),
            ..RawOptions::default()
        }
        .resolve()
        .unwrap();
        let det = Determinism::new(1, 0);
        assert_eq!(obfuscate_attrs(&mut module, &config, &det, 0), 0);
    }
}
