//! Control-flow encoding: condition wrapping, branch restructuring, loop
//! form rewrites, and semantically-inert flow injection. For one construct
//! the sub-passes apply in a fixed relative order: conditions, then
//! branches, then loops.

use rand::Rng;
use rand::rngs::StdRng;

use crate::Result;
use crate::ast::{BinOpKind, CmpOpKind, Expr, ExceptHandler, Module, Stmt};
use crate::config::{EffectiveConfig, LoopMode};
use crate::rng::Determinism;

use super::rename::NameGenerator;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlowCounts {
    pub conditions: usize,
    pub branches: usize,
    pub loops: usize,
    pub dead_blocks: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CondStrategy {
    NotNot,
    IfExpReshuffle,
    BoolCall,
    LambdaCall,
    TupleIndex,
}

/// Strategies that evaluate the whole test exactly once, in order, are safe
/// for any expression. Tuple-indexed selection is reserved for effect-free
/// tests.
const COND_ANY: [CondStrategy; 4] = [
    CondStrategy::NotNot,
    CondStrategy::IfExpReshuffle,
    CondStrategy::BoolCall,
    CondStrategy::LambdaCall,
];
const COND_PURE: [CondStrategy; 5] = [
    CondStrategy::NotNot,
    CondStrategy::IfExpReshuffle,
    CondStrategy::BoolCall,
    CondStrategy::LambdaCall,
    CondStrategy::TupleIndex,
];

fn encode_condition(test: Expr, strategy: CondStrategy) -> Expr {
    match strategy {
        CondStrategy::NotNot => Expr::not(Expr::not(test)),
        CondStrategy::IfExpReshuffle => Expr::IfExp {
            test: Box::new(test),
            body: Box::new(Expr::bool(true)),
            orelse: Box::new(Expr::bool(false)),
        },
        CondStrategy::BoolCall => Expr::call_name("bool", vec![test]),
        CondStrategy::LambdaCall => Expr::call(Expr::lambda(vec![], test), vec![]),
        CondStrategy::TupleIndex => Expr::subscript(
            Expr::Tuple(vec![Expr::bool(false), Expr::bool(true)]),
            Expr::not(Expr::not(test)),
        ),
    }
}

fn wrap_test(test: &mut Expr, rng: &mut StdRng) {
    let pool: &[CondStrategy] = if test.is_effect_free() {
        &COND_PURE
    } else {
        &COND_ANY
    };
    let strategy = pool[rng.gen_range(0..pool.len())];
    let old = std::mem::replace(test, Expr::none());
    *test = encode_condition(old, strategy);
}

/// A comparison that is true but not a literal constant: `(a ^ b) == c`
/// with `c == a ^ b`.
fn opaque_true(rng: &mut StdRng) -> Expr {
    let a = rng.gen_range(100..=999i64);
    let b = rng.gen_range(100..=999i64);
    Expr::compare(
        Expr::binop(Expr::int(a), BinOpKind::BitXor, Expr::int(b)),
        CmpOpKind::Eq,
        Expr::int(a ^ b),
    )
}

/// A comparison that is false but keeps the same masked surface shape as
/// [`opaque_true`], so dead branches are not told apart by a literal scan.
fn opaque_false(rng: &mut StdRng) -> Expr {
    if rng.gen_bool(0.5) {
        let a = rng.gen_range(100..=999i64);
        let b = rng.gen_range(100..=999i64);
        let off = rng.gen_range(1..=50i64);
        Expr::compare(
            Expr::binop(Expr::int(a), BinOpKind::BitXor, Expr::int(b)),
            CmpOpKind::Eq,
            Expr::int((a ^ b) + off),
        )
    } else {
        let a = rng.gen_range(100..=999i64);
        let k = rng.gen_range(1..=63i64);
        Expr::compare(
            Expr::binop(Expr::int(a), BinOpKind::BitXor, Expr::int(k)),
            CmpOpKind::Eq,
            Expr::int(a),
        )
    }
}

fn encode_conditions(
    module: &mut Module,
    config: &EffectiveConfig,
    det: &Determinism,
    iteration: u32,
) -> usize {
    let mut counter = 0u64;
    let mut changed = 0;
    crate::ast::visit_bodies_mut(&mut module.body, &mut |body| {
        for stmt in body.iter_mut() {
            let test = match stmt {
                Stmt::If { test, .. } | Stmt::While { test, .. } => test,
                _ => continue,
            };
            let site = counter;
            counter += 1;
            let mut rng = det.site_rng("flow_cond", iteration, site);
            if !rng.gen_bool(config.cond_rate) {
                continue;
            }
            wrap_test(test, &mut rng);
            changed += 1;
        }
    });
    changed
}

fn extend_branches(
    module: &mut Module,
    config: &EffectiveConfig,
    det: &Determinism,
    iteration: u32,
) -> usize {
    let mut counter = 0u64;
    let mut changed = 0;
    crate::ast::visit_bodies_mut(&mut module.body, &mut |body| {
        for stmt in body.iter_mut() {
            let Stmt::If { test, body: if_body, orelse } = stmt else {
                continue;
            };
            let site = counter;
            counter += 1;
            let mut rng = det.site_rng("flow_branch", iteration, site);
            if !rng.gen_bool(config.branch_rate) {
                continue;
            }
            let invert = !orelse.is_empty() && rng.gen_bool(0.5);
            if invert {
                let old_test = std::mem::replace(test, Expr::none());
                *test = Expr::not(old_test);
                std::mem::swap(if_body, orelse);
            } else {
                let inner_body = std::mem::take(if_body);
                if_body.push(Stmt::If {
                    test: opaque_true(&mut rng),
                    body: inner_body,
                    orelse: vec![],
                });
            }
            changed += 1;
        }
    });
    changed
}

fn guard_loop(test: &mut Expr, body: &mut Vec<Stmt>) {
    let old_test = std::mem::replace(test, Expr::bool(true));
    body.insert(
        0,
        Stmt::If {
            test: Expr::not(old_test),
            body: vec![Stmt::Break],
            orelse: vec![],
        },
    );
}

/// ```python
/// _it = iter(seq)
/// while True:
///     try:
///         x = next(_it)
///     except StopIteration:
///         break
///     ...
/// ```
fn iterator_loop(
    target: Expr,
    iter: Expr,
    body: Vec<Stmt>,
    generator: &mut NameGenerator,
) -> Result<Vec<Stmt>> {
    let it_name = generator.next_name()?;
    let bind = Stmt::Assign {
        targets: vec![Expr::store(it_name.clone())],
        value: Expr::call_name("iter", vec![iter]),
    };
    let advance = Stmt::Try {
        body: vec![Stmt::Assign {
            targets: vec![target],
            value: Expr::call_name("next", vec![Expr::name(it_name)]),
        }],
        handlers: vec![ExceptHandler {
            typ: Some(Expr::name("StopIteration")),
            name: None,
            body: vec![Stmt::Break],
        }],
        orelse: vec![],
        finalbody: vec![],
    };
    let mut loop_body = vec![advance];
    loop_body.extend(body);
    Ok(vec![
        bind,
        Stmt::While {
            test: Expr::bool(true),
            body: loop_body,
        },
    ])
}

fn encode_loops(
    module: &mut Module,
    config: &EffectiveConfig,
    det: &Determinism,
    iteration: u32,
    generator: &mut NameGenerator,
) -> Result<usize> {
    let mut counter = 0u64;
    let mut changed = 0;
    let mut failure: Option<crate::Error> = None;
    crate::ast::visit_bodies_mut(&mut module.body, &mut |body| {
        let mut out: Vec<Stmt> = Vec::with_capacity(body.len());
        for stmt in body.drain(..) {
            match stmt {
                Stmt::While { mut test, body: mut while_body } => {
                    let site = counter;
                    counter += 1;
                    let mut rng = det.site_rng("flow_loop", iteration, site);
                    let eligible = config.loop_mode != LoopMode::Iterator
                        && !matches!(test, Expr::Literal(crate::ast::Literal::Bool(true)));
                    if eligible && rng.gen_bool(config.loop_rate) {
                        guard_loop(&mut test, &mut while_body);
                        changed += 1;
                    }
                    out.push(Stmt::While { test, body: while_body });
                }
                Stmt::For { target, iter, body: for_body, orelse } => {
                    let site = counter;
                    counter += 1;
                    let mut rng = det.site_rng("flow_loop", iteration, site);
                    let eligible = config.loop_mode != LoopMode::Guard && orelse.is_empty();
                    if eligible && rng.gen_bool(config.loop_rate) && failure.is_none() {
                        match iterator_loop(target, iter, for_body, generator) {
                            Ok(stmts) => {
                                out.extend(stmts);
                                changed += 1;
                            }
                            Err(err) => failure = Some(err),
                        }
                    } else {
                        out.push(Stmt::For { target, iter, body: for_body, orelse });
                    }
                }
                other => out.push(other),
            }
        }
        *body = out;
    });
    match failure {
        Some(err) => Err(err),
        None => Ok(changed),
    }
}

fn dead_if(rng: &mut StdRng) -> Stmt {
    Stmt::If {
        test: opaque_false(rng),
        body: vec![Stmt::Pass],
        orelse: vec![],
    }
}

fn inject_dead_flow(
    module: &mut Module,
    config: &EffectiveConfig,
    det: &Determinism,
    iteration: u32,
) -> usize {
    let mut counter = 0u64;
    let mut changed = 0;
    crate::ast::visit_function_bodies_mut(&mut module.body, &mut |body| {
        let site = counter;
        counter += 1;
        let mut rng = det.site_rng("flow_inject", iteration, site);
        if !rng.gen_bool(config.flow_rate) {
            return;
        }
        let insert_at = if config.keep_docstrings {
            crate::ast::docstring_insert_index(body)
        } else {
            0
        };
        let amount = rng.gen_range(1..=config.flow_count);
        for _ in 0..amount {
            body.insert(insert_at, dead_if(&mut rng));
            changed += 1;
        }
    });
    changed
}

pub fn obfuscate_flow(
    module: &mut Module,
    config: &EffectiveConfig,
    det: &Determinism,
    iteration: u32,
    generator: &mut NameGenerator,
) -> Result<FlowCounts> {
    let counts = FlowCounts {
        conditions: encode_conditions(module, config, det, iteration),
        branches: extend_branches(module, config, det, iteration),
        loops: encode_loops(module, config, det, iteration, generator)?,
        dead_blocks: inject_dead_flow(module, config, det, iteration),
    };
    Ok(counts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RawOptions;
    use rand::SeedableRng;
    use rustc_hash::FxHashSet;

    fn generator() -> NameGenerator {
        let mut rng = StdRng::seed_from_u64(1);
        NameGenerator::new(FxHashSet::default(), &mut rng)
    }

    fn full_flow_config() -> EffectiveConfig {
        RawOptions {
            cond_rate: Some(1.0),
            branch_rate: Some(1.0),
            loop_rate: Some(1.0),
            flow_rate: Some(1.0),
            flow_count: Some(1),
            ..RawOptions::default()
        }
        .resolve()
        .unwrap()
    }

    #[test]
    fn test_condition_strategies_preserve_truth_shape() {
        for strategy in COND_PURE {
            let encoded = encode_condition(Expr::name("flag"), strategy);
            assert_ne!(encoded, Expr::name("flag"), "{strategy:?}");
        }
    }

    #[test]
    fn test_impure_test_never_gets_tuple_index() {
        let impure = Expr::call_name("next_value", vec![]);
        assert!(!impure.is_effect_free());
        for seed in 0..50u64 {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut test = impure.clone();
            wrap_test(&mut test, &mut rng);
            assert!(
                !matches!(test, Expr::Subscript { .. }),
                "tuple-index selected for impure test at seed {seed}"
            );
        }
    }

    #[test]
    fn test_branch_invert_swaps_arms() {
        let mut module = Module {
            body: vec![Stmt::If {
                test: Expr::name("cond"),
                body: vec![Stmt::Return(Some(Expr::int(1)))],
                orelse: vec![Stmt::Return(Some(Expr::int(2)))],
            }],
        };
        let config = RawOptions {
            cond_rate: Some(0.0),
            branch_rate: Some(1.0),
            loop_rate: Some(0.0),
            flow_rate: Some(0.0),
            ..RawOptions::default()
        }
        .resolve()
        .unwrap();
        let det = Determinism::new(12, 0);
        let changed = extend_branches(&mut module, &config, &det, 0);
        assert_eq!(changed, 1);
        let Stmt::If { test, body, orelse } = &module.body[0] else {
            panic!("expected if");
        };
        match test {
            Expr::UnaryOp { .. } => {
                // Inverted form: arms swapped under a negated test.
                assert_eq!(body[0], Stmt::Return(Some(Expr::int(2))));
                assert_eq!(orelse[0], Stmt::Return(Some(Expr::int(1))));
            }
            _ => {
                // Nested form: original body under an always-true inner if.
                let Stmt::If { body: inner, .. } = &body[0] else {
                    panic!("expected nested if");
                };
                assert_eq!(inner[0], Stmt::Return(Some(Expr::int(1))));
            }
        }
    }

    #[test]
    fn test_for_loop_becomes_iterator_form() {
        let mut module = Module {
            body: vec![Stmt::For {
                target: Expr::store("x"),
                iter: Expr::call_name("range", vec![Expr::int(3)]),
                body: vec![Stmt::Expr(Expr::call_name("print", vec![Expr::name("x")]))],
                orelse: vec![],
            }],
        };
        let config = RawOptions {
            loop_rate: Some(1.0),
            ..RawOptions::default()
        }
        .resolve()
        .unwrap();
        let det = Determinism::new(13, 0);
        let mut generator = generator();
        let changed = encode_loops(&mut module, &config, &det, 0, &mut generator).unwrap();
        assert_eq!(changed, 1);
        assert_eq!(module.body.len(), 2);
        assert!(matches!(&module.body[0], Stmt::Assign { .. }));
        let Stmt::While { test, body } = &module.body[1] else {
            panic!("expected while");
        };
        assert_eq!(*test, Expr::bool(true));
        assert!(matches!(&body[0], Stmt::Try { .. }));
    }

    #[test]
    fn test_while_loop_gets_guard() {
        let mut module = Module {
            body: vec![Stmt::While {
                test: Expr::name("running"),
                body: vec![Stmt::Pass],
            }],
        };
        let config = RawOptions {
            loop_rate: Some(1.0),
            ..RawOptions::default()
        }
        .resolve()
        .unwrap();
        let det = Determinism::new(13, 0);
        let mut generator = generator();
        let changed = encode_loops(&mut module, &config, &det, 0, &mut generator).unwrap();
        assert_eq!(changed, 1);
        let Stmt::While { test, body } = &module.body[0] else {
            panic!("expected while");
        };
        assert_eq!(*test, Expr::bool(true));
        let Stmt::If { body: guard_body, .. } = &body[0] else {
            panic!("expected guard if");
        };
        assert_eq!(guard_body[0], Stmt::Break);
    }

    #[test]
    fn test_dead_flow_injected_into_function_bodies() {
        let mut module = Module {
            body: vec![Stmt::FunctionDef(crate::ast::FunctionDef {
                name: "work".into(),
                params: vec![],
                body: vec![Stmt::Return(Some(Expr::int(1)))],
                decorators: vec![],
                is_async: false,
            })],
        };
        let det = Determinism::new(14, 0);
        let changed = inject_dead_flow(&mut module, &full_flow_config(), &det, 0);
        assert_eq!(changed, 1);
        let Stmt::FunctionDef(def) = &module.body[0] else {
            panic!("expected def");
        };
        assert!(matches!(&def.body[0], Stmt::If { .. }));
        assert_eq!(def.body.len(), 2);
    }
}
