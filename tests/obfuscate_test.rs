use py_obfuscate_rs::ast::{Expr, FunctionDef, ImportAlias, Keyword, Module, Param, Stmt};
use py_obfuscate_rs::config::Profile;
use py_obfuscate_rs::methods::Tier;
use py_obfuscate_rs::obfuscate::strings::decode_string_expr;
use py_obfuscate_rs::{RawOptions, obfuscate};
use rustc_hash::FxHashMap;

fn sample_program() -> Module {
    Module {
        body: vec![
            Stmt::Import {
                names: vec![ImportAlias {
                    name: "os".into(),
                    asname: None,
                }],
            },
            Stmt::Assign {
                targets: vec![Expr::store("greeting")],
                value: Expr::str("hello"),
            },
            Stmt::Assign {
                targets: vec![Expr::store("count")],
                value: Expr::int(42),
            },
            Stmt::FunctionDef(FunctionDef {
                name: "configure".into(),
                params: vec![Param::new("seed"), Param::new("limit")],
                body: vec![
                    Stmt::If {
                        test: Expr::compare(
                            Expr::name("seed"),
                            py_obfuscate_rs::ast::CmpOpKind::Gt,
                            Expr::int(0),
                        ),
                        body: vec![Stmt::Return(Some(Expr::name("seed")))],
                        orelse: vec![Stmt::Return(Some(Expr::name("limit")))],
                    },
                ],
                decorators: vec![],
                is_async: false,
            }),
            Stmt::FunctionDef(FunctionDef {
                name: "main".into(),
                params: vec![],
                body: vec![
                    Stmt::For {
                        target: Expr::store("i"),
                        iter: Expr::call_name("range", vec![Expr::name("count")]),
                        body: vec![Stmt::Expr(Expr::call_name(
                            "print",
                            vec![Expr::attr(Expr::name("os"), "curdir")],
                        ))],
                        orelse: vec![],
                    },
                    Stmt::Return(Some(Expr::Call {
                        func: Box::new(Expr::name("configure")),
                        args: vec![],
                        keywords: vec![
                            Keyword {
                                arg: Some("seed".into()),
                                value: Expr::int(7),
                            },
                            Keyword {
                                arg: Some("limit".into()),
                                value: Expr::none(),
                            },
                        ],
                    })),
                ],
                decorators: vec![],
                is_async: false,
            }),
            Stmt::Expr(Expr::call_name("main", vec![])),
        ],
    }
}

#[test]
fn test_determinism_across_worker_counts() {
    let reference = RawOptions {
        level: Some(5),
        seed: Some(1234),
        mt_workers: Some(1),
        ..RawOptions::default()
    }
    .resolve()
    .unwrap();
    let expected = obfuscate(sample_program(), &reference, None).unwrap();
    for workers in [2usize, 4] {
        let config = RawOptions {
            level: Some(5),
            seed: Some(1234),
            mt_workers: Some(workers),
            ..RawOptions::default()
        }
        .resolve()
        .unwrap();
        let output = obfuscate(sample_program(), &config, None).unwrap();
        assert_eq!(
            serde_json::to_string(&output.module).unwrap(),
            serde_json::to_string(&expected.module).unwrap(),
            "output differs with {workers} workers"
        );
    }
}

#[test]
fn test_repeated_runs_are_byte_identical() {
    let config = RawOptions {
        level: Some(4),
        seed: Some(99),
        ..RawOptions::default()
    }
    .resolve()
    .unwrap();
    let a = obfuscate(sample_program(), &config, None).unwrap();
    let b = obfuscate(sample_program(), &config, None).unwrap();
    assert_eq!(
        serde_json::to_string(&a.module).unwrap(),
        serde_json::to_string(&b.module).unwrap()
    );
    assert_eq!(a.meta.to_json().unwrap(), b.meta.to_json().unwrap());
}

#[test]
fn test_rename_map_is_bijective_per_scope() {
    let config = RawOptions {
        seed: Some(3),
        ..RawOptions::default()
    }
    .resolve()
    .unwrap();
    let output = obfuscate(sample_program(), &config, None).unwrap();
    let artifact = output.rename_map.to_artifact();
    assert!(!artifact.is_empty());
    let mut per_scope: FxHashMap<String, Vec<&String>> = FxHashMap::default();
    for (key, obf) in &artifact {
        let scope = key.split_once("::").map(|(s, _)| s).unwrap_or("");
        per_scope.entry(scope.to_string()).or_default().push(obf);
    }
    for (scope, names) in per_scope {
        let mut unique = names.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), names.len(), "collision in scope {scope:?}");
    }
}

#[test]
fn test_keyword_argument_names_survive() {
    let config = RawOptions {
        level: Some(5),
        seed: Some(8),
        ..RawOptions::default()
    }
    .resolve()
    .unwrap();
    let output = obfuscate(sample_program(), &config, None).unwrap();
    let json = serde_json::to_string(&output.module).unwrap();
    assert!(json.contains("seed"), "kwarg name `seed` must survive");
    assert!(json.contains("limit"), "kwarg name `limit` must survive");
}

#[test]
fn test_risky_strategy_never_emitted_without_allow() {
    for seed in 0..120u64 {
        let config = RawOptions {
            dynamic_level: Some(Tier::Heavy),
            calls: Some(true),
            call_rate: Some(1.0),
            seed: Some(seed),
            ..RawOptions::default()
        }
        .resolve()
        .unwrap();
        let output = obfuscate(sample_program(), &config, None).unwrap();
        let json = serde_json::to_string(&output.module).unwrap();
        assert!(
            !json.contains("\"eval\""),
            "eval trampoline appeared at seed {seed} without explicit allow"
        );
    }
}

#[test]
fn test_risky_strategy_emitted_when_allowed() {
    let mut seen = false;
    for seed in 0..20u64 {
        let config = RawOptions {
            dynamic_level: Some(Tier::Heavy),
            dynamic_allow: vec!["call:builtins_eval_call".into()],
            call_mode: Some(py_obfuscate_rs::config::CallMode::Eval),
            calls: Some(true),
            call_rate: Some(1.0),
            seed: Some(seed),
            ..RawOptions::default()
        }
        .resolve()
        .unwrap();
        let output = obfuscate(sample_program(), &config, None).unwrap();
        let json = serde_json::to_string(&output.module).unwrap();
        seen |= json.contains("\"eval\"");
    }
    assert!(seen, "allowed risky strategy never appeared across 20 seeds");
}

#[test]
fn test_config_precedence_scenario() {
    // level 3 default
    let level_only = RawOptions {
        level: Some(3),
        ..RawOptions::default()
    }
    .resolve()
    .unwrap();
    assert_eq!(level_only.attr_rate, 0.5);

    // profile overrides the level default
    let with_profile = RawOptions {
        level: Some(3),
        profile: Profile::Stealth,
        ..RawOptions::default()
    }
    .resolve()
    .unwrap();
    assert_eq!(with_profile.attr_rate, 0.3);

    // explicit flag overrides both
    let explicit = RawOptions {
        level: Some(3),
        profile: Profile::Stealth,
        attr_rate: Some(0.9),
        ..RawOptions::default()
    }
    .resolve()
    .unwrap();
    assert_eq!(explicit.attr_rate, 0.9);
}

#[test]
fn test_xor_string_decodes_with_value_salt() {
    let module = Module {
        body: vec![Stmt::Assign {
            targets: vec![Expr::store("x")],
            value: Expr::str("hello"),
        }],
    };
    let config = RawOptions {
        rename: Some(false),
        strings: Some(true),
        builtins: Some(false),
        string_mode: Some(py_obfuscate_rs::config::StringMode::Xor),
        seed: Some(1),
        value_salt: Some(23),
        ..RawOptions::default()
    }
    .resolve()
    .unwrap();
    let output = obfuscate(module, &config, None).unwrap();

    let encoded = output
        .module
        .body
        .iter()
        .find_map(|stmt| match stmt {
            Stmt::Assign { targets, value } if targets == &vec![Expr::store("x")] => Some(value),
            _ => None,
        })
        .expect("assignment to x missing");
    assert!(!encoded.is_string_literal(), "literal was not encoded");

    let hints = output.meta.helper_hints.as_ref().expect("hints missing");
    let salts: FxHashMap<String, u64> = hints
        .iter()
        .filter(|h| h.mode == "string_decode")
        .map(|h| (h.helper_name.clone(), h.salt))
        .collect();
    assert_eq!(
        decode_string_expr(encoded, &salts),
        Some("hello".to_string())
    );

    // A wrong salt must yield a different value, not a failure of the
    // decoding machinery.
    let wrong: FxHashMap<String, u64> =
        salts.iter().map(|(k, v)| (k.clone(), v ^ 0x5a)).collect();
    assert_ne!(decode_string_expr(encoded, &wrong), Some("hello".to_string()));
}

#[test]
fn test_transform_order_is_respected_in_meta() {
    let config = RawOptions {
        order: Some(vec!["flow".into(), "ints".into(), "attrs".into()]),
        ..RawOptions::default()
    }
    .resolve()
    .unwrap();
    let output = obfuscate(sample_program(), &config, None).unwrap();
    let echo = output.meta.config.expect("config echo missing");
    assert_eq!(echo.order, vec!["flow", "ints", "attrs"]);
}

#[test]
fn test_helper_pool_bounds_are_respected() {
    let config = RawOptions {
        strings: Some(true),
        rename: Some(false),
        builtins: Some(false),
        string_helpers: Some(2),
        seed: Some(6),
        ..RawOptions::default()
    }
    .resolve()
    .unwrap();
    let module = Module {
        body: (0..12)
            .map(|i| Stmt::Assign {
                targets: vec![Expr::store(format!("v{i}"))],
                value: Expr::str(format!("value number {i}")),
            })
            .collect(),
    };
    let output = obfuscate(module, &config, None).unwrap();
    let hints = output.meta.helper_hints.unwrap();
    let decoders = hints.iter().filter(|h| h.mode == "string_decode").count();
    assert!(decoders <= 2, "helper pool bound exceeded: {decoders}");
    assert!(decoders >= 1);
}

#[test]
fn test_junk_functions_and_passes_accumulate() {
    let config = RawOptions {
        level: Some(5),
        seed: Some(77),
        junk: Some(3),
        passes: Some(2),
        ..RawOptions::default()
    }
    .resolve()
    .unwrap();
    let output = obfuscate(sample_program(), &config, None).unwrap();
    assert_eq!(output.stats.junk_functions, 3);
    assert!(output.stats.ints > 0);
}
