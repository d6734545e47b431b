//! Bool literal encoding: constant comparisons and masked XOR identities.

use rand::Rng;
use rand::rngs::StdRng;

use crate::ast::{BinOpKind, CmpOpKind, Expr, Literal, Module};
use crate::config::{BoolMode, EffectiveConfig};
use crate::rng::Determinism;

const MIXED: [BoolMode; 2] = [BoolMode::Compare, BoolMode::Xor];

pub fn encode_bool(value: bool, mode: BoolMode, rng: &mut StdRng) -> Expr {
    let mode = match mode {
        BoolMode::Mixed => MIXED[rng.gen_range(0..MIXED.len())],
        explicit => explicit,
    };
    if mode == BoolMode::Xor {
        let left = rng.gen_range(10..=10_000i64);
        let right = left ^ i64::from(value);
        return Expr::call_name(
            "bool",
            vec![Expr::binop(Expr::int(left), BinOpKind::BitXor, Expr::int(right))],
        );
    }
    let a = rng.gen_range(10..=9999i64);
    let b = if value { a } else { a + rng.gen_range(1..=100i64) };
    Expr::compare(Expr::int(a), CmpOpKind::Eq, Expr::int(b))
}

/// Exact inverse of [`encode_bool`].
pub fn decode_bool_expr(expr: &Expr) -> Option<bool> {
    match expr {
        Expr::Literal(Literal::Bool(value)) => Some(*value),
        Expr::Compare {
            left,
            op: CmpOpKind::Eq,
            right,
        } => {
            let Expr::Literal(Literal::Int(a)) = left.as_ref() else {
                return None;
            };
            let Expr::Literal(Literal::Int(b)) = right.as_ref() else {
                return None;
            };
            Some(a == b)
        }
        Expr::Call { func, args, keywords } if keywords.is_empty() => {
            if **func != Expr::name("bool") {
                return None;
            }
            let [inner] = args.as_slice() else {
                return None;
            };
            super::numbers::fold_int_expr(inner).map(|v| v != 0)
        }
        _ => None,
    }
}

pub fn obfuscate_bools(
    module: &mut Module,
    config: &EffectiveConfig,
    det: &Determinism,
    iteration: u32,
) -> usize {
    let mut counter = 0u64;
    let mut changed = 0;
    crate::ast::visit_exprs_mut(&mut module.body, &mut |expr| {
        let Expr::Literal(Literal::Bool(value)) = expr else {
            return;
        };
        let value = *value;
        let site = counter;
        counter += 1;
        let mut rng = det.site_rng("bools", iteration, site);
        if !rng.gen_bool(config.bool_rate) {
            return;
        }
        *expr = encode_bool(value, config.bool_mode, &mut rng);
        changed += 1;
    });
    changed
}
