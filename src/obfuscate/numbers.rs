//! Integer and float literal encoding. Each site becomes an arithmetic or
//! byte-reinterpretation expression that evaluates back to the exact
//! original value.

use rand::Rng;
use rand::rngs::StdRng;

use crate::ast::{BinOpKind, Expr, Literal, Module};
use crate::config::{EffectiveConfig, FloatMode, IntMode};
use crate::rng::Determinism;

const INT_MIXED: [IntMode; 3] = [IntMode::Xor, IntMode::Arith, IntMode::Split];
const FLOAT_MIXED: [FloatMode; 2] = [FloatMode::Hex, FloatMode::Struct];

pub fn encode_int(value: i64, mode: IntMode, rng: &mut StdRng) -> Expr {
    let mode = match mode {
        IntMode::Mixed => INT_MIXED[rng.gen_range(0..INT_MIXED.len())],
        explicit => explicit,
    };
    match mode {
        IntMode::Arith => {
            let key = rng.gen_range(1..=1000i64);
            match value.checked_add(key) {
                Some(sum) => Expr::binop(
                    Expr::binop(Expr::int(sum), BinOpKind::Sub, Expr::int(key)),
                    BinOpKind::Add,
                    Expr::int(0),
                ),
                None => xor_int(value, rng),
            }
        }
        IntMode::Split => {
            let pivot = rng.gen_range(-5000..=5000i64);
            match value.checked_sub(pivot) {
                Some(rest) => Expr::binop(Expr::int(pivot), BinOpKind::Add, Expr::int(rest)),
                None => xor_int(value, rng),
            }
        }
        _ => xor_int(value, rng),
    }
}

fn xor_int(value: i64, rng: &mut StdRng) -> Expr {
    let key = rng.gen_range(1..=32768i64);
    Expr::binop(Expr::int(value ^ key), BinOpKind::BitXor, Expr::int(key))
}

/// Constant-folds integer arithmetic produced by [`encode_int`]. Also the
/// workhorse of best-effort literal restoration.
pub fn fold_int_expr(expr: &Expr) -> Option<i64> {
    match expr {
        Expr::Literal(Literal::Int(v)) => Some(*v),
        Expr::BinOp { left, op, right } => {
            let left = fold_int_expr(left)?;
            let right = fold_int_expr(right)?;
            match op {
                BinOpKind::Add => left.checked_add(right),
                BinOpKind::Sub => left.checked_sub(right),
                BinOpKind::BitXor => Some(left ^ right),
                _ => None,
            }
        }
        Expr::UnaryOp {
            op: crate::ast::UnaryOpKind::USub,
            operand,
        } => fold_int_expr(operand)?.checked_neg(),
        _ => None,
    }
}

/// Renders a float the way the target language's `float.hex()` does:
/// `[sign]0x1.<13 hex digits>p<signed exponent>`, subnormals with a `0x0.`
/// lead and `p-1022`.
pub fn float_to_hex(value: f64) -> String {
    if value == 0.0 {
        return if value.is_sign_negative() {
            "-0x0.0p+0".to_string()
        } else {
            "0x0.0p+0".to_string()
        };
    }
    let bits = value.to_bits();
    let sign = if bits >> 63 == 1 { "-" } else { "" };
    let exponent = ((bits >> 52) & 0x7ff) as i64;
    let mantissa = bits & 0x000f_ffff_ffff_ffff;
    if exponent == 0 {
        format!("{sign}0x0.{mantissa:013x}p-1022")
    } else {
        format!("{sign}0x1.{mantissa:013x}p{:+}", exponent - 1023)
    }
}

/// Exact inverse of [`float_to_hex`]; rejects anything it did not emit.
pub fn float_from_hex(text: &str) -> Option<f64> {
    let (negative, rest) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };
    let rest = rest.strip_prefix("0x")?;
    let (lead, rest) = rest.split_at_checked(1)?;
    let rest = rest.strip_prefix('.')?;
    let (digits, exp_text) = rest.split_once('p')?;
    let exponent: i64 = exp_text.parse().ok()?;
    if lead == "0" && digits == "0" && exponent == 0 {
        return Some(if negative { -0.0 } else { 0.0 });
    }
    if digits.len() != 13 {
        return None;
    }
    let mantissa = u64::from_str_radix(digits, 16).ok()?;
    let sign_bit = u64::from(negative) << 63;
    let bits = match lead {
        "1" => {
            let biased = exponent.checked_add(1023)?;
            if !(1..=2046).contains(&biased) {
                return None;
            }
            sign_bit | ((biased as u64) << 52) | mantissa
        }
        "0" if exponent == -1022 => sign_bit | mantissa,
        _ => return None,
    };
    Some(f64::from_bits(bits))
}

pub fn encode_float(value: f64, mode: FloatMode, rng: &mut StdRng) -> Expr {
    let mode = match mode {
        FloatMode::Mixed => FLOAT_MIXED[rng.gen_range(0..FLOAT_MIXED.len())],
        explicit => explicit,
    };
    match mode {
        FloatMode::Struct => {
            let payload = format!("{:016x}", value.to_bits());
            let unpack = Expr::call(
                Expr::attr(Expr::dunder_import("struct"), "unpack"),
                vec![
                    Expr::str("!d"),
                    Expr::call(
                        Expr::attr(Expr::name("bytes"), "fromhex"),
                        vec![Expr::str(payload)],
                    ),
                ],
            );
            Expr::subscript(unpack, Expr::int(0))
        }
        _ => Expr::call(
            Expr::attr(Expr::name("float"), "fromhex"),
            vec![Expr::str(float_to_hex(value))],
        ),
    }
}

/// Inverts both float encodings structurally.
pub fn fold_float_expr(expr: &Expr) -> Option<f64> {
    match expr {
        Expr::Literal(Literal::Float(v)) => Some(*v),
        Expr::Call { func, args, keywords } if keywords.is_empty() => {
            let Expr::Attribute { value, attr, .. } = func.as_ref() else {
                return None;
            };
            if attr != "fromhex" || **value != Expr::name("float") {
                return None;
            }
            let [Expr::Literal(Literal::Str(text))] = args.as_slice() else {
                return None;
            };
            float_from_hex(text)
        }
        Expr::Subscript { value, index } => {
            if **index != Expr::int(0) {
                return None;
            }
            let Expr::Call { func, args, keywords } = value.as_ref() else {
                return None;
            };
            if !keywords.is_empty() {
                return None;
            }
            let Expr::Attribute { attr, .. } = func.as_ref() else {
                return None;
            };
            if attr != "unpack" {
                return None;
            }
            let [Expr::Literal(Literal::Str(fmt)), payload] = args.as_slice() else {
                return None;
            };
            if fmt != "!d" {
                return None;
            }
            let Expr::Call { args: inner, .. } = payload else {
                return None;
            };
            let [Expr::Literal(Literal::Str(hex))] = inner.as_slice() else {
                return None;
            };
            let bits = u64::from_str_radix(hex, 16).ok()?;
            Some(f64::from_bits(bits))
        }
        _ => None,
    }
}

pub fn obfuscate_ints(
    module: &mut Module,
    config: &EffectiveConfig,
    det: &Determinism,
    iteration: u32,
) -> usize {
    let mut counter = 0u64;
    let mut changed = 0;
    crate::ast::visit_exprs_mut(&mut module.body, &mut |expr| {
        let Expr::Literal(Literal::Int(value)) = expr else {
            return;
        };
        let value = *value;
        let site = counter;
        counter += 1;
        let mut rng = det.site_rng("ints", iteration, site);
        if !rng.gen_bool(config.int_rate) {
            return;
        }
        *expr = encode_int(value, config.int_mode, &mut rng);
        changed += 1;
    });
    changed
}

pub fn obfuscate_floats(
    module: &mut Module,
    config: &EffectiveConfig,
    det: &Determinism,
    iteration: u32,
) -> usize {
    let mut counter = 0u64;
    let mut changed = 0;
    crate::ast::visit_exprs_mut(&mut module.body, &mut |expr| {
        let Expr::Literal(Literal::Float(value)) = expr else {
            return;
        };
        let value = *value;
        if !value.is_finite() {
            return;
        }
        let site = counter;
        counter += 1;
        let mut rng = det.site_rng("floats", iteration, site);
        if !rng.gen_bool(config.float_rate) {
            return;
        }
        *expr = encode_float(value, config.float_mode, &mut rng);
        changed += 1;
    });
    changed
}
