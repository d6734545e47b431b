//! Junk function injection: small, never-called functions with plausible
//! arithmetic bodies, placed per the configured position.

use rand::Rng;

use crate::Result;
use crate::ast::{BinOpKind, CmpOpKind, Expr, FunctionDef, Module, Param, Stmt};
use crate::config::{EffectiveConfig, JunkPosition};
use crate::rng::Determinism;

use super::rename::NameGenerator;

/// ```python
/// def _junk_0(x=SEED):
///     y = ((x ^ 1337) + 97) - 97
///     if y == -1:
///         return y
///     return y ^ 0
/// ```
fn build_junk_function(name: String, seed: i64) -> FunctionDef {
    let masked = Expr::binop(
        Expr::binop(
            Expr::binop(Expr::name("x"), BinOpKind::BitXor, Expr::int(1337)),
            BinOpKind::Add,
            Expr::int(97),
        ),
        BinOpKind::Sub,
        Expr::int(97),
    );
    FunctionDef {
        name,
        params: vec![Param {
            name: "x".into(),
            default: Some(Expr::int(seed)),
        }],
        body: vec![
            Stmt::Assign {
                targets: vec![Expr::store("y")],
                value: masked,
            },
            Stmt::If {
                test: Expr::compare(Expr::name("y"), CmpOpKind::Eq, Expr::int(-1)),
                body: vec![Stmt::Return(Some(Expr::name("y")))],
                orelse: vec![],
            },
            Stmt::Return(Some(Expr::binop(Expr::name("y"), BinOpKind::BitXor, Expr::int(0)))),
        ],
        decorators: vec![],
        is_async: false,
    }
}

pub fn inject_junk_functions(
    module: &mut Module,
    config: &EffectiveConfig,
    det: &Determinism,
    generator: &mut NameGenerator,
) -> Result<usize> {
    if config.junk == 0 {
        return Ok(0);
    }
    let mut inserted = 0;
    for index in 0..config.junk {
        let mut rng = det.site_rng("junk", 0, u64::from(index));
        let name = generator.fresh_named(&format!("_junk_{index:x}"));
        let stmt = Stmt::FunctionDef(build_junk_function(name, rng.gen_range(100..=9999i64)));
        match config.junk_position {
            JunkPosition::Bottom => module.body.push(stmt),
            JunkPosition::Random => {
                let start = if config.keep_docstrings {
                    crate::ast::docstring_insert_index(&module.body)
                } else {
                    0
                };
                let at = rng.gen_range(start..=module.body.len());
                module.body.insert(at, stmt);
            }
            JunkPosition::Top => {
                let at = if config.keep_docstrings {
                    crate::ast::docstring_insert_index(&module.body)
                } else {
                    0
                };
                module.body.insert(at, stmt);
            }
        }
        inserted += 1;
    }
    Ok(inserted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RawOptions;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use rustc_hash::FxHashSet;

    #[test]
    fn test_junk_count_and_position() {
        let mut module = Module {
            body: vec![Stmt::Expr(Expr::str("docstring"))],
        };
        let config = RawOptions {
            junk: Some(2),
            keep_docstrings: true,
            ..RawOptions::default()
        }
        .resolve()
        .unwrap();
        let det = Determinism::new(19, 0);
        let mut rng = StdRng::seed_from_u64(19);
        let mut generator = NameGenerator::new(FxHashSet::default(), &mut rng);
        let inserted = inject_junk_functions(&mut module, &config, &det, &mut generator).unwrap();
        assert_eq!(inserted, 2);
        assert!(crate::ast::is_docstring(&module.body[0]));
        assert!(matches!(&module.body[1], Stmt::FunctionDef(_)));
        assert!(matches!(&module.body[2], Stmt::FunctionDef(_)));
    }
}
