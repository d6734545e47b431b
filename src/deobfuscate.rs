//! Metadata-driven reconstruction. Strict mode requires the embedded source
//! payload and returns it verbatim; best-effort mode reverses whatever the
//! metadata still describes and reports everything it could not restore as
//! structured warnings instead of failing.

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::info;

use crate::ast::{Expr, Keyword, Literal, Module};
use crate::meta::{ObfuMeta, decode_source_payload, digest_module};
use crate::obfuscate::rename::{RenameMap, reverse_rename};
use crate::obfuscate::{bools, bytes, none, numbers, strings};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeobfMode {
    #[default]
    BestEffort,
    Strict,
}

impl DeobfMode {
    pub const fn name(self) -> &'static str {
        match self {
            Self::BestEffort => "best-effort",
            Self::Strict => "strict",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "best-effort" => Some(Self::BestEffort),
            "strict" => Some(Self::Strict),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RestoredProgram {
    /// The embedded original text, byte for byte.
    Source(String),
    /// An approximate reconstruction of the tree.
    Tree(Module),
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeobfOutcome {
    pub restored: RestoredProgram,
    pub warnings: Vec<String>,
}

struct HintIndex {
    string_salts: FxHashMap<String, u64>,
    call_wrappers: FxHashSet<String>,
}

impl HintIndex {
    fn from_meta(meta: &ObfuMeta) -> Option<Self> {
        let hints = meta.helper_hints.as_ref()?;
        let mut string_salts = FxHashMap::default();
        let mut call_wrappers = FxHashSet::default();
        for hint in hints {
            match hint.mode.as_str() {
                "string_decode" => {
                    string_salts.insert(hint.helper_name.clone(), hint.salt);
                }
                "call_wrap" => {
                    call_wrappers.insert(hint.helper_name.clone());
                }
                _ => {}
            }
        }
        Some(Self {
            string_salts,
            call_wrappers,
        })
    }
}

/// Rebuilds `f(args..., kw=...)` from a wrapped `(f, (args...), {kw: ...})`
/// triple.
fn unwrap_call_triple(args: &[Expr]) -> Option<Expr> {
    let [func, Expr::Tuple(positional), Expr::Dict { keys, values }] = args else {
        return None;
    };
    let mut keywords = Vec::with_capacity(keys.len());
    for (key, value) in keys.iter().zip(values) {
        let Expr::Literal(Literal::Str(name)) = key else {
            return None;
        };
        keywords.push(Keyword {
            arg: Some(name.clone()),
            value: value.clone(),
        });
    }
    Some(Expr::Call {
        func: Box::new(func.clone()),
        args: positional.clone(),
        keywords,
    })
}

/// Matches `lambda _f, _a, _k: _f(*_a, **_k)` regardless of parameter names.
fn is_wrap_lambda(func: &Expr) -> bool {
    let Expr::Lambda { params, body } = func else {
        return false;
    };
    if params.len() != 3 || params.iter().any(|p| p.default.is_some()) {
        return false;
    }
    let Expr::Call { func, args, keywords } = body.as_ref() else {
        return false;
    };
    let func_ok = matches!(func.as_ref(), Expr::Name { id, .. } if *id == params[0].name);
    let args_ok = matches!(
        args.as_slice(),
        [Expr::Starred(inner)] if matches!(inner.as_ref(), Expr::Name { id, .. } if *id == params[1].name)
    );
    let kw_ok = matches!(
        keywords.as_slice(),
        [Keyword { arg: None, value }] if matches!(value, Expr::Name { id, .. } if *id == params[2].name)
    );
    func_ok && args_ok && kw_ok
}

/// Matches `eval("lambda f,a,k: ..." + "")`.
fn is_eval_trampoline(func: &Expr) -> bool {
    let Expr::Call { func, args, keywords } = func else {
        return false;
    };
    **func == Expr::name("eval")
        && keywords.is_empty()
        && matches!(
            args.as_slice(),
            [Expr::BinOp { left, .. }] if matches!(left.as_ref(), Expr::Literal(Literal::Str(_)))
        )
}

fn simplify_expr(expr: &mut Expr, hints: Option<&HintIndex>) -> bool {
    if let Some(hints) = hints {
        if let Some(text) = strings::decode_string_expr(expr, &hints.string_salts) {
            *expr = Expr::str(text);
            return true;
        }
    }

    if let Expr::Call { func, args, keywords } = expr {
        if keywords.is_empty() {
            let wrapped = match func.as_ref() {
                Expr::Name { id, .. } => {
                    hints.is_some_and(|h| h.call_wrappers.contains(id))
                }
                other => is_wrap_lambda(other) || is_eval_trampoline(other),
            };
            if wrapped {
                if let Some(direct) = unwrap_call_triple(args) {
                    *expr = direct;
                    return true;
                }
            }
            // `getattr(obj, "name")` folds back to a plain attribute load.
            if **func == Expr::name("getattr") && args.len() == 2 {
                if let Expr::Literal(Literal::Str(attr)) = &args[1] {
                    *expr = Expr::attr(args[0].clone(), attr.clone());
                    return true;
                }
            }
        }
    }

    if let Some(data) = bytes::decode_bytes_expr(expr) {
        if !matches!(expr, Expr::Literal(_)) {
            *expr = Expr::bytes(data);
            return true;
        }
    }
    if let Some(value) = numbers::fold_float_expr(expr) {
        if !matches!(expr, Expr::Literal(_)) {
            *expr = Expr::float(value);
            return true;
        }
    }
    if none::decode_none_expr(expr) && !matches!(expr, Expr::Literal(_)) {
        *expr = Expr::none();
        return true;
    }
    if let Some(value) = bools::decode_bool_expr(expr) {
        if !matches!(expr, Expr::Literal(_)) {
            *expr = Expr::bool(value);
            return true;
        }
    }
    if matches!(expr, Expr::BinOp { .. }) {
        if let Some(value) = numbers::fold_int_expr(expr) {
            *expr = Expr::int(value);
            return true;
        }
    }
    false
}

/// Reconstructs an approximation (or, with an embedded source, the exact
/// original) of the program described by `meta`.
pub fn deobfuscate(
    module: &Module,
    meta: &ObfuMeta,
    mode: DeobfMode,
    force: bool,
) -> Result<DeobfOutcome> {
    let mut warnings = Vec::new();

    if let Some(expected) = &meta.output_digest {
        let actual = digest_module(module)?;
        if actual != *expected {
            if !force {
                return Err(Error::DeobfSchema(
                    "output digest mismatch (pass force to ignore)".into(),
                ));
            }
            warnings.push("digest mismatch ignored due to force".to_string());
        }
    }

    if let Some(payload) = &meta.source {
        let text = decode_source_payload(payload)?;
        info!("restored embedded source payload");
        return Ok(DeobfOutcome {
            restored: RestoredProgram::Source(text),
            warnings,
        });
    }

    if mode == DeobfMode::Strict {
        return Err(Error::DeobfSourceMissing);
    }

    let mut restored = module.clone();

    match &meta.rename_map {
        Some(artifact) => {
            let map = RenameMap::from_artifact(artifact);
            reverse_rename(&mut restored, &map);
        }
        None => {
            warnings.push("rename_map absent - identifiers left obfuscated".to_string());
        }
    }

    let hints = HintIndex::from_meta(meta);
    if hints.is_none() {
        warnings.push("helper_hints absent - literal decoding limited to structural folds".to_string());
    }

    let mut simplified = 0usize;
    // Passes over the tree until no fold applies; nested encodings unwrap one
    // layer per round.
    loop {
        let mut changed = 0usize;
        crate::ast::visit_exprs_mut(&mut restored.body, &mut |expr| {
            if simplify_expr(expr, hints.as_ref()) {
                changed += 1;
            }
        });
        simplified += changed;
        if changed == 0 {
            break;
        }
    }
    if simplified == 0 {
        warnings.push("no encoded expressions recognized - tree returned as-is".to_string());
    }
    warnings.push("best-effort restore: unrecognized transforms may remain".to_string());

    info!(simplified, "best-effort deobfuscation complete");
    Ok(DeobfOutcome {
        restored: RestoredProgram::Tree(restored),
        warnings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::{HelperHint, MetaVersion};
    use crate::{RawOptions, obfuscate};

    fn sample_module() -> Module {
        use crate::ast::Stmt;
        Module {
            body: vec![
                Stmt::Assign {
                    targets: vec![Expr::store("x")],
                    value: Expr::str("hello"),
                },
                Stmt::Expr(Expr::call_name("print", vec![Expr::name("x")])),
            ],
        }
    }

    fn bare_meta() -> ObfuMeta {
        ObfuMeta {
            version: MetaVersion::V2,
            config: None,
            stats: None,
            rename_map: None,
            helper_hints: None,
            value_salt: None,
            input_digest: None,
            output_digest: None,
            source: None,
            warnings: vec![],
        }
    }

    #[test]
    fn test_strict_without_source_fails() {
        let result = deobfuscate(&sample_module(), &bare_meta(), DeobfMode::Strict, false);
        assert!(matches!(result, Err(Error::DeobfSourceMissing)));
    }

    #[test]
    fn test_best_effort_without_source_warns() {
        let outcome =
            deobfuscate(&sample_module(), &bare_meta(), DeobfMode::BestEffort, false).unwrap();
        assert!(matches!(outcome.restored, RestoredProgram::Tree(_)));
        assert!(
            outcome
                .warnings
                .iter()
                .any(|w| w.contains("rename_map absent"))
        );
    }

    #[test]
    fn test_strict_returns_source_verbatim() {
        let source = "x = \"hello\"\nprint(x)\n";
        let mut meta = bare_meta();
        meta.source = Some(crate::meta::encode_source_payload(source).unwrap());
        let outcome = deobfuscate(&sample_module(), &meta, DeobfMode::Strict, false).unwrap();
        assert_eq!(
            outcome.restored,
            RestoredProgram::Source(source.to_string())
        );
    }

    #[test]
    fn test_digest_mismatch_fails_without_force() {
        let mut meta = bare_meta();
        meta.output_digest = Some("not-the-digest".into());
        let result = deobfuscate(&sample_module(), &meta, DeobfMode::BestEffort, false);
        assert!(matches!(result, Err(Error::DeobfSchema(_))));
        let outcome = deobfuscate(&sample_module(), &meta, DeobfMode::BestEffort, true).unwrap();
        assert!(outcome.warnings.iter().any(|w| w.contains("force")));
    }

    #[test]
    fn test_full_cycle_restores_names_and_strings() {
        let config = RawOptions {
            level: Some(2),
            seed: Some(23),
            value_salt: Some(23),
            ..RawOptions::default()
        }
        .resolve()
        .unwrap();
        let original = sample_module();
        let output = obfuscate(original.clone(), &config, None).unwrap();
        let outcome =
            deobfuscate(&output.module, &output.meta, DeobfMode::BestEffort, false).unwrap();
        let RestoredProgram::Tree(tree) = outcome.restored else {
            panic!("expected tree outcome");
        };
        // The rename map and helper hints fully restore this module, except
        // for the emitted helper definitions and builtin aliases that remain.
        let json = serde_json::to_string(&tree).unwrap();
        assert!(json.contains("hello"));
        let crate::ast::Stmt::Assign { targets, value } = tree
            .body
            .iter()
            .find(|stmt| {
                matches!(stmt, crate::ast::Stmt::Assign { targets, .. }
                    if targets == &vec![Expr::store("x")])
            })
            .unwrap()
        else {
            panic!("expected assignment to x");
        };
        assert_eq!(targets[0], Expr::store("x"));
        assert_eq!(*value, Expr::str("hello"));
    }

    #[test]
    fn test_unknown_helper_hint_mode_ignored() {
        let mut meta = bare_meta();
        meta.helper_hints = Some(vec![HelperHint {
            helper_name: "_h".into(),
            mode: "future_mode".into(),
            salt: 0,
            params: vec![],
        }]);
        let outcome =
            deobfuscate(&sample_module(), &meta, DeobfMode::BestEffort, false).unwrap();
        assert!(matches!(outcome.restored, RestoredProgram::Tree(_)));
    }
}
