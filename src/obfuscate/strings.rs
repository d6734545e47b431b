//! String-literal encoding. The only parallel stage in the pipeline: a
//! single-threaded collector lists candidate sites in traversal order, a
//! fixed-size worker pool encodes them independently, and a single-threaded
//! applier writes results back in site-key order. Output is byte-identical
//! for a fixed seed regardless of worker count.

use std::panic::{AssertUnwindSafe, catch_unwind};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand::Rng;
use rand::rngs::StdRng;
use rayon::prelude::*;
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::ast::{BinOpKind, Expr, Literal, Module, Stmt};
use crate::config::{EffectiveConfig, StringMode};
use crate::rng::Determinism;
use crate::{Error, Result};

use super::helpers::HelperRegistry;

/// One candidate literal site, tagged with its stable key.
#[derive(Debug, Clone)]
struct StringSite {
    key: u64,
    value: String,
}

const LEAF_MODES: [StringMode; 3] = [StringMode::Xor, StringMode::B64, StringMode::Reverse];
const MIXED_MODES: [StringMode; 4] = [
    StringMode::Xor,
    StringMode::B64,
    StringMode::Reverse,
    StringMode::Split,
];

fn chunk_sizes(len: usize, min: usize, max: usize, rng: &mut StdRng) -> Vec<usize> {
    let mut sizes = Vec::new();
    let mut remaining = len;
    while remaining > 0 {
        let hi = max.min(remaining);
        let lo = min.min(hi);
        let step = rng.gen_range(lo..=hi);
        sizes.push(step);
        remaining -= step;
    }
    sizes
}

fn xor_expr(
    value: &str,
    rng: &mut StdRng,
    chunk_min: usize,
    chunk_max: usize,
    helper_name: &str,
    salt_byte: i64,
) -> Expr {
    let chars: Vec<char> = value.chars().collect();
    let mut encoded = Vec::new();
    let mut idx = 0;
    for size in chunk_sizes(chars.len(), chunk_min, chunk_max, rng) {
        let key = rng.gen_range(1..=255i64);
        let stored_key = key ^ salt_byte;
        let data: Vec<Expr> = chars[idx..idx + size]
            .iter()
            .map(|ch| Expr::int(i64::from(*ch as u32) ^ key))
            .collect();
        encoded.push(Expr::Tuple(vec![Expr::int(stored_key), Expr::Tuple(data)]));
        idx += size;
    }
    Expr::call_name(helper_name, vec![Expr::int(0), Expr::Tuple(encoded)])
}

fn b64_expr(value: &str, helper_name: &str) -> Expr {
    let payload = BASE64.encode(value.as_bytes());
    Expr::call_name(helper_name, vec![Expr::int(1), Expr::str(payload)])
}

fn reverse_expr(value: &str, helper_name: &str) -> Expr {
    let reversed: String = value.chars().rev().collect();
    Expr::call_name(helper_name, vec![Expr::int(2), Expr::str(reversed)])
}

fn leaf_expr(
    value: &str,
    mode: StringMode,
    rng: &mut StdRng,
    chunk_min: usize,
    chunk_max: usize,
    helper_name: &str,
    salt_byte: i64,
) -> Expr {
    match mode {
        StringMode::B64 => b64_expr(value, helper_name),
        StringMode::Reverse => reverse_expr(value, helper_name),
        _ => xor_expr(value, rng, chunk_min, chunk_max, helper_name, salt_byte),
    }
}

fn split_expr(
    value: &str,
    rng: &mut StdRng,
    chunk_min: usize,
    chunk_max: usize,
    helper_name: &str,
    salt_byte: i64,
) -> Expr {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() <= 1 {
        return leaf_expr(
            value,
            StringMode::Xor,
            rng,
            chunk_min,
            chunk_max,
            helper_name,
            salt_byte,
        );
    }
    let mut parts: Vec<String> = Vec::new();
    let mut idx = 0;
    for size in chunk_sizes(chars.len(), chunk_min, chunk_max, rng) {
        parts.push(chars[idx..idx + size].iter().collect());
        idx += size;
    }
    if parts.len() == 1 {
        return leaf_expr(
            &parts[0],
            StringMode::Xor,
            rng,
            chunk_min,
            chunk_max,
            helper_name,
            salt_byte,
        );
    }
    let mut exprs = parts.iter().map(|part| {
        let leaf_mode = LEAF_MODES[rng.gen_range(0..LEAF_MODES.len())];
        leaf_expr(
            part,
            leaf_mode,
            rng,
            chunk_min,
            chunk_max,
            helper_name,
            salt_byte,
        )
    });
    let first = exprs.next().expect("split produced no parts");
    exprs.fold(first, |out, next| Expr::binop(out, BinOpKind::Add, next))
}

/// Encodes one string value. `mixed` resolves to a seeded choice drawn from
/// the supplied generator, which must be derived from the site key.
pub fn encode_string_value(
    value: &str,
    mode: StringMode,
    rng: &mut StdRng,
    chunk_min: usize,
    chunk_max: usize,
    helper_name: &str,
    salt_byte: i64,
) -> Expr {
    let mode = match mode {
        StringMode::Mixed => MIXED_MODES[rng.gen_range(0..MIXED_MODES.len())],
        explicit => explicit,
    };
    if mode == StringMode::Split {
        split_expr(value, rng, chunk_min, chunk_max, helper_name, salt_byte)
    } else {
        leaf_expr(value, mode, rng, chunk_min, chunk_max, helper_name, salt_byte)
    }
}

fn literal_i64(expr: &Expr) -> Option<i64> {
    match expr {
        Expr::Literal(Literal::Int(v)) => Some(*v),
        _ => None,
    }
}

fn decode_xor_payload(payload: &Expr, salt_byte: i64) -> Option<String> {
    let Expr::Tuple(chunks) = payload else {
        return None;
    };
    let mut out = String::new();
    for chunk in chunks {
        let Expr::Tuple(pair) = chunk else {
            return None;
        };
        let [stored_key, data] = pair.as_slice() else {
            return None;
        };
        let key = literal_i64(stored_key)? ^ salt_byte;
        let Expr::Tuple(values) = data else {
            return None;
        };
        for value in values {
            let code = literal_i64(value)? ^ key;
            out.push(char::from_u32(u32::try_from(code).ok()?)?);
        }
    }
    Some(out)
}

/// Inverts an encoded string expression using helper-name -> salt hints.
/// Exact inverse of [`encode_string_value`]; concatenations produced by the
/// split mode are folded recursively.
pub fn decode_string_expr(expr: &Expr, helper_salts: &FxHashMap<String, u64>) -> Option<String> {
    match expr {
        Expr::BinOp {
            left,
            op: BinOpKind::Add,
            right,
        } => {
            let mut out = decode_string_expr(left, helper_salts)?;
            out.push_str(&decode_string_expr(right, helper_salts)?);
            Some(out)
        }
        Expr::Call { func, args, keywords } if keywords.is_empty() => {
            let Expr::Name { id, .. } = func.as_ref() else {
                return None;
            };
            let salt_byte = (*helper_salts.get(id)? & 0xff) as i64;
            let [mode, payload] = args.as_slice() else {
                return None;
            };
            match literal_i64(mode)? {
                0 => decode_xor_payload(payload, salt_byte),
                1 => {
                    let Expr::Literal(Literal::Str(text)) = payload else {
                        return None;
                    };
                    let bytes = BASE64.decode(text).ok()?;
                    String::from_utf8(bytes).ok()
                }
                2 => {
                    let Expr::Literal(Literal::Str(text)) = payload else {
                        return None;
                    };
                    Some(text.chars().rev().collect())
                }
                _ => None,
            }
        }
        _ => None,
    }
}

struct SiteWalker<'a, F: FnMut(u64, &mut Expr)> {
    counter: u64,
    keep_docstrings: bool,
    f: &'a mut F,
}

impl<'a, F: FnMut(u64, &mut Expr)> SiteWalker<'a, F> {
    fn walk_body(&mut self, body: &mut [Stmt]) {
        for (idx, stmt) in body.iter_mut().enumerate() {
            if idx == 0 && self.keep_docstrings && crate::ast::is_docstring(stmt) {
                continue;
            }
            self.walk_stmt(stmt);
        }
    }

    fn walk_stmt(&mut self, stmt: &mut Stmt) {
        match stmt {
            Stmt::FunctionDef(def) => {
                for dec in &mut def.decorators {
                    self.walk_expr(dec);
                }
                for param in &mut def.params {
                    if let Some(default) = &mut param.default {
                        self.walk_expr(default);
                    }
                }
                self.walk_body(&mut def.body);
            }
            Stmt::ClassDef(def) => {
                for dec in &mut def.decorators {
                    self.walk_expr(dec);
                }
                for base in &mut def.bases {
                    self.walk_expr(base);
                }
                for kw in &mut def.keywords {
                    self.walk_expr(&mut kw.value);
                }
                self.walk_body(&mut def.body);
            }
            Stmt::Assign { targets, value } => {
                for target in targets {
                    self.walk_expr(target);
                }
                self.walk_expr(value);
            }
            Stmt::AugAssign { target, value, .. } => {
                self.walk_expr(target);
                self.walk_expr(value);
            }
            Stmt::Return(value) | Stmt::Raise(value) => {
                if let Some(value) = value {
                    self.walk_expr(value);
                }
            }
            Stmt::Expr(value) => self.walk_expr(value),
            Stmt::If { test, body, orelse } => {
                self.walk_expr(test);
                self.walk_body(body);
                self.walk_body(orelse);
            }
            Stmt::While { test, body } => {
                self.walk_expr(test);
                self.walk_body(body);
            }
            Stmt::For { target, iter, body, orelse } => {
                self.walk_expr(target);
                self.walk_expr(iter);
                self.walk_body(body);
                self.walk_body(orelse);
            }
            Stmt::Try { body, handlers, orelse, finalbody } => {
                self.walk_body(body);
                for handler in handlers {
                    if let Some(typ) = &mut handler.typ {
                        self.walk_expr(typ);
                    }
                    self.walk_body(&mut handler.body);
                }
                self.walk_body(orelse);
                self.walk_body(finalbody);
            }
            Stmt::Delete { targets } => {
                for target in targets {
                    self.walk_expr(target);
                }
            }
            Stmt::Import { .. }
            | Stmt::ImportFrom { .. }
            | Stmt::Global { .. }
            | Stmt::Nonlocal { .. }
            | Stmt::Pass
            | Stmt::Break
            | Stmt::Continue => {}
        }
    }

    fn walk_expr(&mut self, expr: &mut Expr) {
        match expr {
            Expr::Literal(Literal::Str(value)) => {
                if !value.is_empty() {
                    let key = self.counter;
                    self.counter += 1;
                    (self.f)(key, expr);
                }
                return;
            }
            Expr::Literal(_) | Expr::Name { .. } => return,
            Expr::Tuple(items) | Expr::List(items) | Expr::BoolOp { values: items, .. } => {
                for item in items {
                    self.walk_expr(item);
                }
            }
            Expr::Dict { keys, values } => {
                for key in keys {
                    self.walk_expr(key);
                }
                for value in values {
                    self.walk_expr(value);
                }
            }
            Expr::Attribute { value, .. } | Expr::Starred(value) => self.walk_expr(value),
            Expr::Subscript { value, index } => {
                self.walk_expr(value);
                self.walk_expr(index);
            }
            Expr::Call { func, args, keywords } => {
                self.walk_expr(func);
                for arg in args {
                    self.walk_expr(arg);
                }
                for kw in keywords {
                    self.walk_expr(&mut kw.value);
                }
            }
            Expr::BinOp { left, right, .. } | Expr::Compare { left, right, .. } => {
                self.walk_expr(left);
                self.walk_expr(right);
            }
            Expr::UnaryOp { operand, .. } => self.walk_expr(operand),
            Expr::IfExp { test, body, orelse } => {
                self.walk_expr(test);
                self.walk_expr(body);
                self.walk_expr(orelse);
            }
            Expr::Lambda { params, body } => {
                for param in params {
                    if let Some(default) = &mut param.default {
                        self.walk_expr(default);
                    }
                }
                self.walk_expr(body);
            }
            Expr::GeneratorExp { elt, target, iter } => {
                self.walk_expr(elt);
                self.walk_expr(target);
                self.walk_expr(iter);
            }
        }
    }
}

fn visit_string_sites<F: FnMut(u64, &mut Expr)>(module: &mut Module, keep_docstrings: bool, f: &mut F) {
    let mut walker = SiteWalker {
        counter: 0,
        keep_docstrings,
        f,
    };
    walker.walk_body(&mut module.body);
}

/// Runs the parallel string stage: collect, encode on the worker pool, apply
/// in key order. Returns the number of rewritten sites.
pub fn run_string_stage(
    module: &mut Module,
    config: &EffectiveConfig,
    det: &Determinism,
    registry: &mut HelperRegistry,
) -> Result<usize> {
    let mut sites: Vec<StringSite> = Vec::new();
    visit_string_sites(module, config.keep_docstrings, &mut |key, expr| {
        if let Expr::Literal(Literal::Str(value)) = expr {
            sites.push(StringSite {
                key,
                value: value.clone(),
            });
        }
    });
    if sites.is_empty() {
        return Ok(0);
    }

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.mt_workers)
        .build()
        .map_err(|err| Error::LiteralWorker(err.to_string()))?;

    let mode = config.string_mode;
    let rate = config.string_rate;
    let chunk_min = config.string_chunk_min;
    let chunk_max = config.string_chunk_max;
    let shared: &HelperRegistry = registry;
    let encoded: Vec<Option<(u64, Expr)>> = pool
        .install(|| {
            sites
                .par_iter()
                .map(|site| {
                    catch_unwind(AssertUnwindSafe(|| {
                        let mut rng = det.site_rng("strings", 0, site.key);
                        if !rng.gen_bool(rate) {
                            return None;
                        }
                        let helper = shared.string_helper(site.key);
                        Some((
                            site.key,
                            encode_string_value(
                                &site.value,
                                mode,
                                &mut rng,
                                chunk_min,
                                chunk_max,
                                &helper.name,
                                helper.salt_byte(),
                            ),
                        ))
                    }))
                    .map_err(|_| Error::LiteralWorker("string encoder panicked".into()))
                })
                .collect::<Result<Vec<_>>>()
        })?;

    let mut results: FxHashMap<u64, Expr> = FxHashMap::default();
    for entry in encoded.into_iter().flatten() {
        registry.mark_string_used(entry.0);
        results.insert(entry.0, entry.1);
    }
    let changed = results.len();

    visit_string_sites(module, config.keep_docstrings, &mut |key, expr| {
        if let Some(replacement) = results.remove(&key) {
            *expr = replacement;
        }
    });
    debug!(sites = changed, "string literal stage applied");
    Ok(changed)
}
