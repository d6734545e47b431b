//! `None` literal encoding: immediately-invoked lambdas and known-false
//! conditional expressions.

use rand::Rng;
use rand::rngs::StdRng;

use crate::ast::{CmpOpKind, Expr, Literal, Module};
use crate::config::{EffectiveConfig, NoneMode};
use crate::rng::Determinism;

const MIXED: [NoneMode; 2] = [NoneMode::Lambda, NoneMode::IfExpr];

pub fn encode_none(mode: NoneMode, rng: &mut StdRng) -> Expr {
    let mode = match mode {
        NoneMode::Mixed => MIXED[rng.gen_range(0..MIXED.len())],
        explicit => explicit,
    };
    if mode == NoneMode::IfExpr {
        let a = rng.gen_range(10..=999i64);
        let b = a + rng.gen_range(1..=20i64);
        return Expr::IfExp {
            test: Box::new(Expr::compare(Expr::int(a), CmpOpKind::Eq, Expr::int(b))),
            body: Box::new(Expr::int(0)),
            orelse: Box::new(Expr::none()),
        };
    }
    Expr::call(Expr::lambda(vec![], Expr::none()), vec![])
}

/// Exact inverse of [`encode_none`].
pub fn decode_none_expr(expr: &Expr) -> bool {
    match expr {
        Expr::Literal(Literal::None) => true,
        Expr::IfExp { test, orelse, .. } => {
            let Expr::Compare {
                left,
                op: CmpOpKind::Eq,
                right,
            } = test.as_ref()
            else {
                return false;
            };
            matches!(
                (left.as_ref(), right.as_ref()),
                (Expr::Literal(Literal::Int(a)), Expr::Literal(Literal::Int(b))) if a != b
            ) && **orelse == Expr::none()
        }
        Expr::Call { func, args, keywords } => {
            args.is_empty()
                && keywords.is_empty()
                && matches!(
                    func.as_ref(),
                    Expr::Lambda { params, body } if params.is_empty() && **body == Expr::none()
                )
        }
        _ => false,
    }
}

pub fn obfuscate_none(
    module: &mut Module,
    config: &EffectiveConfig,
    det: &Determinism,
    iteration: u32,
) -> usize {
    let mut counter = 0u64;
    let mut changed = 0;
    crate::ast::visit_exprs_mut(&mut module.body, &mut |expr| {
        if !matches!(expr, Expr::Literal(Literal::None)) {
            return;
        }
        let site = counter;
        counter += 1;
        let mut rng = det.site_rng("none", iteration, site);
        if !rng.gen_bool(config.none_rate) {
            return;
        }
        *expr = encode_none(config.none_mode, &mut rng);
        changed += 1;
    });
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_none_round_trip_every_mode() {
        let mut rng = StdRng::seed_from_u64(41);
        for mode in [NoneMode::Mixed, NoneMode::Lambda, NoneMode::IfExpr] {
            let expr = encode_none(mode, &mut rng);
            assert!(decode_none_expr(&expr), "{mode:?}");
            assert_ne!(expr, Expr::none());
        }
    }
}
