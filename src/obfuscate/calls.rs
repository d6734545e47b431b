//! Call indirection: a direct call is routed through a shared wrapper
//! helper, an immediately-invoked lambda, or (only when explicitly
//! allow-listed) an evaluation-built trampoline. Argument order and keyword
//! names are preserved exactly; starred or splatted call shapes are skipped.

use rand::Rng;

use crate::ast::{BinOpKind, Expr, Keyword, Module, Param};
use crate::config::EffectiveConfig;
use crate::methods::CallMethod;
use crate::rng::Determinism;

use super::helpers::HelperRegistry;

fn kwargs_dict(keywords: Vec<Keyword>) -> Expr {
    let mut keys = Vec::with_capacity(keywords.len());
    let mut values = Vec::with_capacity(keywords.len());
    for kw in keywords {
        keys.push(Expr::str(kw.arg.expect("splats are filtered before rewrite")));
        values.push(kw.value);
    }
    Expr::Dict { keys, values }
}

fn wrap_body() -> Expr {
    Expr::Call {
        func: Box::new(Expr::name("_f")),
        args: vec![Expr::Starred(Box::new(Expr::name("_a")))],
        keywords: vec![Keyword {
            arg: None,
            value: Expr::name("_k"),
        }],
    }
}

fn lambda_wrap(func: Expr, args: Vec<Expr>, keywords: Vec<Keyword>) -> Expr {
    let lam = Expr::lambda(
        vec![Param::new("_f"), Param::new("_a"), Param::new("_k")],
        wrap_body(),
    );
    Expr::call(lam, vec![func, Expr::Tuple(args), kwargs_dict(keywords)])
}

fn eval_wrap(func: Expr, args: Vec<Expr>, keywords: Vec<Keyword>) -> Expr {
    // The source string is concatenated at runtime so the trampoline text
    // never appears verbatim in the output.
    let source = Expr::binop(
        Expr::str("lambda f,a,k: f(*a, **k)"),
        BinOpKind::Add,
        Expr::str(""),
    );
    let trampoline = Expr::call_name("eval", vec![source]);
    Expr::call(
        trampoline,
        vec![func, Expr::Tuple(args), kwargs_dict(keywords)],
    )
}

fn helper_wrap(helper_name: &str, func: Expr, args: Vec<Expr>, keywords: Vec<Keyword>) -> Expr {
    Expr::call_name(
        helper_name,
        vec![func, Expr::Tuple(args), kwargs_dict(keywords)],
    )
}

pub fn obfuscate_calls(
    module: &mut Module,
    config: &EffectiveConfig,
    det: &Determinism,
    iteration: u32,
    registry: &mut HelperRegistry,
) -> usize {
    let pool = config.methods.call.clone();
    let mut counter = 0u64;
    let mut changed = 0;
    crate::ast::visit_exprs_mut(&mut module.body, &mut |expr| {
        let Expr::Call { func, args, keywords } = expr else {
            return;
        };
        if let Expr::Name { id, .. } = func.as_ref() {
            if registry.is_helper_name(id) {
                return;
            }
        }
        if args.iter().any(|arg| matches!(arg, Expr::Starred(_)))
            || keywords.iter().any(|kw| kw.arg.is_none())
        {
            return;
        }
        let site = counter;
        counter += 1;
        let mut rng = det.site_rng("calls", iteration, site);
        if !rng.gen_bool(config.call_rate) {
            return;
        }
        let method = pool[rng.gen_range(0..pool.len())];
        let Expr::Call { func, args, keywords } = std::mem::replace(expr, Expr::none()) else {
            unreachable!("matched above");
        };
        *expr = match method {
            CallMethod::LambdaWrap => lambda_wrap(*func, args, keywords),
            CallMethod::BuiltinsEvalCall => eval_wrap(*func, args, keywords),
            CallMethod::HelperWrap => {
                let helper_name = registry.call_helper(site).name.clone();
                helper_wrap(&helper_name, *func, args, keywords)
            }
        };
        changed += 1;
    });
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Stmt;
    use crate::rng::Determinism;
    use crate::{RawOptions, config::CallMode};
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use rustc_hash::FxHashSet;

    fn registry() -> HelperRegistry {
        let det = Determinism::new(3, 0);
        let mut rng = StdRng::seed_from_u64(3);
        let mut generator = super::super::rename::NameGenerator::new(FxHashSet::default(), &mut rng);
        HelperRegistry::new(1, 1, &det, &mut generator)
    }

    fn call_module() -> Module {
        Module {
            body: vec![Stmt::Expr(Expr::Call {
                func: Box::new(Expr::name("work")),
                args: vec![Expr::int(1)],
                keywords: vec![Keyword {
                    arg: Some("mode".into()),
                    value: Expr::str("fast"),
                }],
            })],
        }
    }

    #[test]
    fn test_helper_wrap_preserves_args_and_keywords() {
        let mut module = call_module();
        let config = RawOptions {
            call_mode: Some(CallMode::Wrap),
            call_rate: Some(1.0),
            ..RawOptions::default()
        }
        .resolve()
        .unwrap();
        let mut registry = registry();
        let det = Determinism::new(3, 0);
        assert_eq!(obfuscate_calls(&mut module, &config, &det, 0, &mut registry), 1);
        let Stmt::Expr(Expr::Call { func, args, .. }) = &module.body[0] else {
            panic!("expected call, got {:?}", module.body[0]);
        };
        assert_eq!(**func, Expr::name("_obf_call"));
        assert_eq!(args[0], Expr::name("work"));
        assert_eq!(args[1], Expr::Tuple(vec![Expr::int(1)]));
        let Expr::Dict { keys, values } = &args[2] else {
            panic!("expected kwargs dict");
        };
        assert_eq!(keys[0], Expr::str("mode"));
        assert_eq!(values[0], Expr::str("fast"));
    }

    #[test]
    fn test_starred_and_splat_sites_skipped() {
        let mut module = Module {
            body: vec![
                Stmt::Expr(Expr::Call {
                    func: Box::new(Expr::name("work")),
                    args: vec![Expr::Starred(Box::new(Expr::name("args")))],
                    keywords: vec![],
                }),
                Stmt::Expr(Expr::Call {
                    func: Box::new(Expr::name("work")),
                    args: vec![],
                    keywords: vec![Keyword {
                        arg: None,
                        value: Expr::name("kwargs"),
                    }],
                }),
            ],
        };
        let config = RawOptions {
            call_mode: Some(CallMode::Wrap),
            call_rate: Some(1.0),
            ..RawOptions::default()
        }
        .resolve()
        .unwrap();
        let mut registry = registry();
        let det = Determinism::new(3, 0);
        assert_eq!(obfuscate_calls(&mut module, &config, &det, 0, &mut registry), 0);
    }

    #[test]
    fn test_helper_calls_not_rewrapped() {
        let config = RawOptions {
            call_mode: Some(CallMode::Wrap),
            call_rate: Some(1.0),
            ..RawOptions::default()
        }
        .resolve()
        .unwrap();
        let mut registry = registry();
        let det = Determinism::new(3, 0);
        let mut module = Module {
            body: vec![Stmt::Expr(Expr::call_name("_obf_call", vec![Expr::name("f")]))],
        };
        assert_eq!(obfuscate_calls(&mut module, &config, &det, 0, &mut registry), 0);
    }
}
