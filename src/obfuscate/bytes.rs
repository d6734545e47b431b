//! Bytes literal encoding: XOR-masked generator expressions, plain value
//! tuples, or concatenated mixed pieces.

use rand::Rng;
use rand::rngs::StdRng;

use crate::ast::{BinOpKind, Expr, Literal, Module};
use crate::config::{BytesMode, EffectiveConfig};
use crate::rng::Determinism;

const MIXED: [BytesMode; 3] = [BytesMode::Xor, BytesMode::List, BytesMode::Split];
const LEAVES: [BytesMode; 2] = [BytesMode::Xor, BytesMode::List];
const SPLIT_MAX_PIECE: usize = 6;

fn leaf_expr(data: &[u8], mode: BytesMode, rng: &mut StdRng) -> Expr {
    if mode == BytesMode::List {
        let values = data.iter().map(|v| Expr::int(i64::from(*v))).collect();
        return Expr::call_name("bytes", vec![Expr::Tuple(values)]);
    }
    let key = rng.gen_range(1..=255i64);
    let encoded = data
        .iter()
        .map(|v| Expr::int(i64::from(*v) ^ key))
        .collect();
    let gen_expr = Expr::GeneratorExp {
        elt: Box::new(Expr::binop(Expr::name("_b"), BinOpKind::BitXor, Expr::int(key))),
        target: Box::new(Expr::store("_b")),
        iter: Box::new(Expr::Tuple(encoded)),
    };
    Expr::call_name("bytes", vec![gen_expr])
}

fn split_expr(data: &[u8], rng: &mut StdRng) -> Expr {
    if data.len() <= 1 {
        return leaf_expr(data, BytesMode::Xor, rng);
    }
    let mut pieces: Vec<&[u8]> = Vec::new();
    let mut idx = 0;
    while idx < data.len() {
        let max_step = SPLIT_MAX_PIECE.min(data.len() - idx);
        let step = rng.gen_range(1..=max_step);
        pieces.push(&data[idx..idx + step]);
        idx += step;
    }
    if pieces.len() == 1 {
        return leaf_expr(pieces[0], BytesMode::Xor, rng);
    }
    let mut exprs = pieces.into_iter().map(|piece| {
        let mode = LEAVES[rng.gen_range(0..LEAVES.len())];
        leaf_expr(piece, mode, rng)
    });
    let first = exprs.next().expect("split produced no pieces");
    exprs.fold(first, |out, next| Expr::binop(out, BinOpKind::Add, next))
}

pub fn encode_bytes(data: &[u8], mode: BytesMode, rng: &mut StdRng) -> Expr {
    let mode = match mode {
        BytesMode::Mixed => MIXED[rng.gen_range(0..MIXED.len())],
        explicit => explicit,
    };
    match mode {
        BytesMode::Split => split_expr(data, rng),
        explicit => leaf_expr(data, explicit, rng),
    }
}

fn decode_leaf(expr: &Expr) -> Option<Vec<u8>> {
    let Expr::Call { func, args, keywords } = expr else {
        return None;
    };
    if !keywords.is_empty() || **func != Expr::name("bytes") {
        return None;
    }
    let [payload] = args.as_slice() else {
        return None;
    };
    match payload {
        Expr::Tuple(values) => values
            .iter()
            .map(|v| match v {
                Expr::Literal(Literal::Int(value)) => u8::try_from(*value).ok(),
                _ => None,
            })
            .collect(),
        Expr::GeneratorExp { elt, iter, .. } => {
            let Expr::BinOp {
                op: BinOpKind::BitXor,
                right,
                ..
            } = elt.as_ref()
            else {
                return None;
            };
            let Expr::Literal(Literal::Int(key)) = right.as_ref() else {
                return None;
            };
            let Expr::Tuple(values) = iter.as_ref() else {
                return None;
            };
            values
                .iter()
                .map(|v| match v {
                    Expr::Literal(Literal::Int(value)) => u8::try_from(*value ^ *key).ok(),
                    _ => None,
                })
                .collect()
        }
        _ => None,
    }
}

/// Exact inverse of [`encode_bytes`].
pub fn decode_bytes_expr(expr: &Expr) -> Option<Vec<u8>> {
    match expr {
        Expr::BinOp {
            left,
            op: BinOpKind::Add,
            right,
        } => {
            let mut out = decode_bytes_expr(left)?;
            out.extend(decode_bytes_expr(right)?);
            Some(out)
        }
        _ => decode_leaf(expr),
    }
}

pub fn obfuscate_bytes(
    module: &mut Module,
    config: &EffectiveConfig,
    det: &Determinism,
    iteration: u32,
) -> usize {
    let mut counter = 0u64;
    let mut changed = 0;
    crate::ast::visit_exprs_mut(&mut module.body, &mut |expr| {
        let Expr::Literal(Literal::Bytes(data)) = expr else {
            return;
        };
        let data = data.clone();
        let site = counter;
        counter += 1;
        let mut rng = det.site_rng("bytes", iteration, site);
        if !rng.gen_bool(config.bytes_rate) {
            return;
        }
        *expr = encode_bytes(&data, config.bytes_mode, &mut rng);
        changed += 1;
    });
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_bytes_round_trip_every_mode() {
        let mut rng = StdRng::seed_from_u64(21);
        let long: Vec<u8> = (0..=255).collect();
        for data in [vec![], vec![0u8], vec![1, 2, 3], long] {
            for mode in [BytesMode::Mixed, BytesMode::Xor, BytesMode::List, BytesMode::Split] {
                let expr = encode_bytes(&data, mode, &mut rng);
                assert_eq!(decode_bytes_expr(&expr), Some(data.clone()), "{mode:?}");
            }
        }
    }

    #[test]
    fn test_xor_leaf_masks_raw_values() {
        let mut rng = StdRng::seed_from_u64(3);
        let expr = leaf_expr(&[7, 7, 7], BytesMode::Xor, &mut rng);
        let Expr::Call { args, .. } = &expr else {
            panic!("expected call");
        };
        let Expr::GeneratorExp { iter, .. } = &args[0] else {
            panic!("expected generator");
        };
        let Expr::Tuple(values) = iter.as_ref() else {
            panic!("expected tuple");
        };
        assert!(values.iter().all(|v| *v != Expr::int(7)));
    }
}
