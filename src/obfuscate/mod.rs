//! The obfuscation pipeline: configuration-driven passes applied in a
//! dependency-aware order. Renaming runs first so every later pass sees
//! final identifiers; the string stage runs on its bounded worker pool;
//! the configured transform order is applied `passes` times; helpers,
//! builtin aliases and redirect tables land last.

pub mod attrs;
pub mod bools;
pub mod builtins;
pub mod bytes;
pub mod calls;
pub mod flow;
pub mod helpers;
pub mod imports;
pub mod junk;
pub mod none;
pub mod numbers;
pub mod redirect;
pub mod rename;
pub mod setattrs;
pub mod strings;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::ast::Module;
use crate::config::{EffectiveConfig, PassId};
use crate::meta::{MetaConfigEcho, MetaVersion, ObfuMeta, digest_module, encode_source_payload};
use crate::methods::CallMethod;
use crate::Result;
use crate::rng::Determinism;

use helpers::HelperRegistry;
use rename::{NameGenerator, RenameMap};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObfuscationStats {
    pub renamed: usize,
    pub strings: usize,
    pub ints: usize,
    pub floats: usize,
    pub bytes: usize,
    pub none_values: usize,
    pub bools: usize,
    pub attrs: usize,
    pub setattrs: usize,
    pub calls: usize,
    pub builtins: usize,
    pub imports: usize,
    pub flow_conditions: usize,
    pub flow_branches: usize,
    pub flow_loops: usize,
    pub dead_blocks: usize,
    pub junk_functions: usize,
    pub redirected: usize,
    #[serde(default)]
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ObfuscationOutput {
    pub module: Module,
    pub rename_map: RenameMap,
    pub stats: ObfuscationStats,
    pub meta: ObfuMeta,
}

fn digest_salt_component(digest: &str) -> u64 {
    u64::from_str_radix(digest.get(..16).unwrap_or("0"), 16).unwrap_or(0)
}

/// Runs the full pipeline over `module`. `source` is the original program
/// text, used only for the embedded metadata payload when
/// `meta-include-source` is set; the core itself never parses it.
pub fn obfuscate(
    mut module: Module,
    config: &EffectiveConfig,
    source: Option<&str>,
) -> Result<ObfuscationOutput> {
    let input_digest = digest_module(&module)?;
    let value_salt = if config.salt_coupling {
        config.value_salt ^ digest_salt_component(&input_digest)
    } else {
        config.value_salt
    };
    let det = Determinism::new(config.seed, value_salt);
    let mut stats = ObfuscationStats::default();

    if config.methods.call.contains(&CallMethod::BuiltinsEvalCall) {
        let note = "risky method enabled: call:builtins_eval_call";
        warn!("{note}");
        stats.warnings.push(note.to_string());
    }

    let mut used = rename::collect_identifiers(&module);
    used.extend(config.preserve_names.iter().cloned());
    let mut generator = NameGenerator::new(used, &mut det.pass_rng("names", 0));

    stats.junk_functions = junk::inject_junk_functions(&mut module, config, &det, &mut generator)?;

    let mut rename_map = RenameMap::default();
    if config.rename {
        let mut protected = config.preserve_names.clone();
        protected.extend(rename::collect_keyword_arg_names(&module));
        rename_map = rename::rename_module(&mut module, &protected, &mut generator)?;
        stats.renamed = rename_map.len();
    }

    let mut registry = HelperRegistry::new(
        config.string_helpers,
        config.call_helpers,
        &det,
        &mut generator,
    );

    if config.strings {
        stats.strings = strings::run_string_stage(&mut module, config, &det, &mut registry)?;
    }

    for iteration in 0..config.passes {
        for pass in &config.transform_order {
            match pass {
                PassId::Attrs if config.attrs => {
                    stats.attrs += attrs::obfuscate_attrs(&mut module, config, &det, iteration);
                }
                PassId::Setattrs if config.setattrs => {
                    stats.setattrs +=
                        setattrs::obfuscate_setattrs(&mut module, config, &det, iteration);
                }
                PassId::Calls if config.calls => {
                    stats.calls +=
                        calls::obfuscate_calls(&mut module, config, &det, iteration, &mut registry);
                }
                PassId::Imports if config.imports => {
                    stats.imports += imports::obfuscate_imports(&mut module, config, &det, iteration);
                }
                PassId::Bools if config.bools => {
                    stats.bools += bools::obfuscate_bools(&mut module, config, &det, iteration);
                }
                PassId::Ints if config.ints => {
                    stats.ints += numbers::obfuscate_ints(&mut module, config, &det, iteration);
                }
                PassId::Floats if config.floats => {
                    stats.floats += numbers::obfuscate_floats(&mut module, config, &det, iteration);
                }
                PassId::Bytes if config.bytes => {
                    stats.bytes += bytes::obfuscate_bytes(&mut module, config, &det, iteration);
                }
                PassId::None if config.none_values => {
                    stats.none_values += none::obfuscate_none(&mut module, config, &det, iteration);
                }
                PassId::Flow if config.flow => {
                    let counts =
                        flow::obfuscate_flow(&mut module, config, &det, iteration, &mut generator)?;
                    stats.flow_conditions += counts.conditions;
                    stats.flow_branches += counts.branches;
                    stats.flow_loops += counts.loops;
                    stats.dead_blocks += counts.dead_blocks;
                }
                _ => {}
            }
        }
        debug!(iteration, "transform pass complete");
    }

    if registry.any_used() {
        registry.emit(&mut module, config.keep_docstrings);
    }

    if config.builtins {
        stats.builtins = builtins::obfuscate_builtins(&mut module, config, &det, &mut generator)?;
    }

    stats.redirected = redirect::redirect_frontline(&mut module, config, &det, &mut generator)?;

    let output_digest = digest_module(&module)?;

    let source_payload = if config.meta.include_source {
        match source {
            Some(text) => Some(encode_source_payload(text)?),
            None => {
                let note = "meta-include-source set but no source text was provided";
                warn!("{note}");
                stats.warnings.push(note.to_string());
                None
            }
        }
    } else {
        None
    };

    let meta = ObfuMeta {
        version: MetaVersion::V2,
        config: Some(MetaConfigEcho::from_config(config)),
        stats: Some(stats.clone()),
        rename_map: if config.meta.omit_rename_map {
            None
        } else {
            Some(rename_map.to_artifact())
        },
        helper_hints: if config.meta.omit_helper_hints {
            None
        } else {
            Some(registry.hints())
        },
        value_salt: Some(value_salt),
        input_digest: Some(input_digest),
        output_digest: Some(output_digest),
        source: source_payload,
        warnings: stats.warnings.clone(),
    };

    info!(
        renamed = stats.renamed,
        strings = stats.strings,
        attrs = stats.attrs,
        calls = stats.calls,
        redirected = stats.redirected,
        "obfuscation pipeline complete"
    );

    Ok(ObfuscationOutput {
        module,
        rename_map,
        stats,
        meta,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RawOptions;
    use crate::ast::{Expr, Stmt};

    fn sample_module() -> Module {
        Module {
            body: vec![
                Stmt::Assign {
                    targets: vec![Expr::store("greeting")],
                    value: Expr::str("hello"),
                },
                Stmt::Expr(Expr::call_name("print", vec![Expr::name("greeting")])),
            ],
        }
    }

    #[test]
    fn test_pipeline_is_deterministic_for_fixed_seed() {
        let config = RawOptions {
            level: Some(4),
            seed: Some(42),
            ..RawOptions::default()
        }
        .resolve()
        .unwrap();
        let a = obfuscate(sample_module(), &config, None).unwrap();
        let b = obfuscate(sample_module(), &config, None).unwrap();
        assert_eq!(a.module, b.module);
        assert_eq!(a.meta.to_json().unwrap(), b.meta.to_json().unwrap());
    }

    #[test]
    fn test_different_seeds_differ() {
        let base = RawOptions {
            level: Some(4),
            seed: Some(1),
            ..RawOptions::default()
        };
        let config_a = base.clone().resolve().unwrap();
        let config_b = RawOptions {
            seed: Some(2),
            ..base
        }
        .resolve()
        .unwrap();
        let a = obfuscate(sample_module(), &config_a, None).unwrap();
        let b = obfuscate(sample_module(), &config_b, None).unwrap();
        assert_ne!(a.module, b.module);
    }

    #[test]
    fn test_worker_count_does_not_change_output() {
        for workers in [1usize, 2, 4] {
            let config = RawOptions {
                level: Some(4),
                seed: Some(7),
                mt_workers: Some(workers),
                ..RawOptions::default()
            }
            .resolve()
            .unwrap();
            let reference = RawOptions {
                level: Some(4),
                seed: Some(7),
                mt_workers: Some(1),
                ..RawOptions::default()
            }
            .resolve()
            .unwrap();
            let a = obfuscate(sample_module(), &config, None).unwrap();
            let b = obfuscate(sample_module(), &reference, None).unwrap();
            assert_eq!(a.module, b.module, "workers={workers}");
        }
    }

    #[test]
    fn test_salt_coupling_changes_output() {
        let plain = RawOptions {
            seed: Some(5),
            ..RawOptions::default()
        }
        .resolve()
        .unwrap();
        let coupled = RawOptions {
            seed: Some(5),
            salt_coupling: true,
            ..RawOptions::default()
        }
        .resolve()
        .unwrap();
        let a = obfuscate(sample_module(), &plain, None).unwrap();
        let b = obfuscate(sample_module(), &coupled, None).unwrap();
        assert_ne!(a.meta.value_salt, b.meta.value_salt);
    }
}
