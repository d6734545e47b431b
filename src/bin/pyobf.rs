use std::fs;
use std::path::PathBuf;

use clap::Parser;

use py_obfuscate_rs::ast::Module;
use py_obfuscate_rs::deobfuscate::{DeobfMode, RestoredProgram, deobfuscate};
use py_obfuscate_rs::meta::ObfuMeta;
use py_obfuscate_rs::{RawOptions, obfuscate};

/// AST obfuscator for Python-like syntax trees (JSON in, JSON out).
#[derive(Debug, Parser)]
#[command(name = "pyobf", version, about)]
struct Cli {
    /// Input syntax tree (JSON produced by the external parser).
    input: PathBuf,

    /// Output path (tree JSON, or restored source for deobfuscation).
    #[arg(short, long)]
    output: PathBuf,

    #[arg(long, value_parser = clap::value_parser!(u8).range(1..=5))]
    level: Option<u8>,

    /// Preset profile: balanced, stealth or max.
    #[arg(long, default_value = "balanced")]
    profile: String,

    /// Dynamic method pool tier: safe, medium or heavy.
    #[arg(long)]
    dynamic_level: Option<String>,

    /// Comma-separated allow overrides (e.g. attr:globals_getattr).
    #[arg(long, default_value = "")]
    dynamic_allow: String,

    /// Comma-separated deny overrides.
    #[arg(long, default_value = "")]
    dynamic_deny: String,

    #[arg(long)]
    passes: Option<u32>,
    #[arg(long)]
    junk: Option<u32>,
    #[arg(long, default_value = "top")]
    junk_position: String,

    // Feature toggles; each `--x` pairs with `--no-x` and both unset means
    // "inherit from level/profile".
    #[arg(long, overrides_with = "no_rename")]
    rename: bool,
    #[arg(long)]
    no_rename: bool,
    #[arg(long, overrides_with = "no_strings")]
    strings: bool,
    #[arg(long)]
    no_strings: bool,
    #[arg(long, overrides_with = "no_ints")]
    ints: bool,
    #[arg(long)]
    no_ints: bool,
    #[arg(long, overrides_with = "no_floats")]
    floats: bool,
    #[arg(long)]
    no_floats: bool,
    #[arg(long, overrides_with = "no_bytes")]
    bytes: bool,
    #[arg(long)]
    no_bytes: bool,
    #[arg(long = "none", overrides_with = "no_none")]
    none_values: bool,
    #[arg(long = "no-none")]
    no_none: bool,
    #[arg(long, overrides_with = "no_bools")]
    bools: bool,
    #[arg(long)]
    no_bools: bool,
    #[arg(long, overrides_with = "no_flow")]
    flow: bool,
    #[arg(long)]
    no_flow: bool,
    #[arg(long, overrides_with = "no_attrs")]
    attrs: bool,
    #[arg(long)]
    no_attrs: bool,
    #[arg(long, overrides_with = "no_setattrs")]
    setattrs: bool,
    #[arg(long)]
    no_setattrs: bool,
    #[arg(long, overrides_with = "no_calls")]
    calls: bool,
    #[arg(long)]
    no_calls: bool,
    #[arg(long, overrides_with = "no_builtins")]
    builtins: bool,
    #[arg(long)]
    no_builtins: bool,
    #[arg(long, overrides_with = "no_imports")]
    imports: bool,
    #[arg(long)]
    no_imports: bool,

    #[arg(long)]
    string_mode: Option<String>,
    #[arg(long)]
    int_mode: Option<String>,
    #[arg(long)]
    float_mode: Option<String>,
    #[arg(long)]
    bytes_mode: Option<String>,
    #[arg(long)]
    bool_mode: Option<String>,
    #[arg(long)]
    none_mode: Option<String>,
    #[arg(long)]
    attr_mode: Option<String>,
    #[arg(long)]
    setattr_mode: Option<String>,
    #[arg(long)]
    call_mode: Option<String>,
    #[arg(long)]
    builtin_mode: Option<String>,
    #[arg(long)]
    import_mode: Option<String>,
    #[arg(long)]
    loop_mode: Option<String>,

    #[arg(long)]
    attr_rate: Option<f64>,
    #[arg(long)]
    setattr_rate: Option<f64>,
    #[arg(long)]
    call_rate: Option<f64>,
    #[arg(long)]
    builtin_rate: Option<f64>,
    #[arg(long)]
    import_rate: Option<f64>,
    #[arg(long)]
    flow_rate: Option<f64>,
    #[arg(long)]
    cond_rate: Option<f64>,
    #[arg(long)]
    branch_rate: Option<f64>,
    #[arg(long)]
    loop_rate: Option<f64>,
    #[arg(long)]
    flow_count: Option<u32>,
    #[arg(long)]
    string_rate: Option<f64>,
    #[arg(long)]
    int_rate: Option<f64>,
    #[arg(long)]
    float_rate: Option<f64>,
    #[arg(long)]
    bytes_rate: Option<f64>,
    #[arg(long)]
    bool_rate: Option<f64>,
    #[arg(long)]
    none_rate: Option<f64>,

    #[arg(long)]
    string_chunk_min: Option<usize>,
    #[arg(long)]
    string_chunk_max: Option<usize>,
    #[arg(long)]
    string_helpers: Option<usize>,
    #[arg(long)]
    call_helpers: Option<usize>,

    /// Comma-separated transform order.
    #[arg(long)]
    order: Option<String>,

    /// Comma-separated names to never rename.
    #[arg(long, default_value = "")]
    preserve: String,
    /// Comma-separated attribute names to keep direct.
    #[arg(long, default_value = "")]
    preserve_attrs: String,
    #[arg(long)]
    keep_docstrings: bool,

    #[arg(long)]
    seed: Option<u64>,
    #[arg(long)]
    value_salt: Option<u64>,
    #[arg(long)]
    salt_coupling: bool,
    #[arg(long)]
    mt_workers: Option<usize>,

    /// Comma-separated redirect kinds, each optionally `kind:mode`.
    #[arg(long, default_value = "")]
    redirect: String,
    #[arg(long)]
    redirect_rate: Option<f64>,
    #[arg(long)]
    redirect_max: Option<usize>,
    #[arg(long)]
    redirect_all: bool,

    /// Write the rename map as a standalone JSON artifact.
    #[arg(long)]
    emit_map: Option<PathBuf>,
    /// Write the obfumeta JSON artifact.
    #[arg(long)]
    emit_meta: Option<PathBuf>,
    /// Original source text to embed for lossless deobfuscation.
    #[arg(long)]
    source: Option<PathBuf>,
    #[arg(long)]
    meta_include_source: bool,
    #[arg(long)]
    meta_omit_rename_map: bool,
    #[arg(long)]
    meta_omit_helper_hints: bool,
    #[arg(long)]
    meta_minimal: bool,

    /// Deobfuscate `input` using the metadata at `--meta`.
    #[arg(long)]
    deobfuscate: bool,
    #[arg(long)]
    meta: Option<PathBuf>,
    /// best-effort or strict.
    #[arg(long, default_value = "best-effort")]
    deobf_mode: String,
    /// Ignore digest mismatches during deobfuscation.
    #[arg(long)]
    force: bool,

    /// Validate that the written tree round-trips through JSON.
    #[arg(long)]
    check: bool,
    /// Print the resolved configuration.
    #[arg(long)]
    explain: bool,
}

fn split_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}

fn parse_mode<T>(raw: &Option<String>, parse: fn(&str) -> Option<T>, what: &str) -> Result<Option<T>, String> {
    match raw {
        None => Ok(None),
        Some(text) => parse(text)
            .map(Some)
            .ok_or_else(|| format!("unknown {what}: {text}")),
    }
}

const fn toggle(on: bool, off: bool) -> Option<bool> {
    match (on, off) {
        (true, _) => Some(true),
        (_, true) => Some(false),
        _ => None,
    }
}

fn to_raw_options(cli: &Cli) -> Result<RawOptions, String> {
    use py_obfuscate_rs::config::{
        AttrMode, BoolMode, BuiltinMode, BytesMode, CallMode, FloatMode, ImportMode, IntMode,
        JunkPosition, LoopMode, NoneMode, Profile, SetattrMode, StringMode,
    };
    use py_obfuscate_rs::methods::Tier;

    Ok(RawOptions {
        level: cli.level,
        profile: Profile::from_name(&cli.profile)
            .ok_or_else(|| format!("unknown profile: {}", cli.profile))?,
        dynamic_level: parse_mode(&cli.dynamic_level, Tier::from_name, "dynamic level")?,
        dynamic_allow: split_csv(&cli.dynamic_allow),
        dynamic_deny: split_csv(&cli.dynamic_deny),
        passes: cli.passes,
        junk: cli.junk,
        junk_position: JunkPosition::from_name(&cli.junk_position)
            .ok_or_else(|| format!("unknown junk position: {}", cli.junk_position))?,
        rename: toggle(cli.rename, cli.no_rename),
        strings: toggle(cli.strings, cli.no_strings),
        ints: toggle(cli.ints, cli.no_ints),
        floats: toggle(cli.floats, cli.no_floats),
        bytes: toggle(cli.bytes, cli.no_bytes),
        none_values: toggle(cli.none_values, cli.no_none),
        bools: toggle(cli.bools, cli.no_bools),
        flow: toggle(cli.flow, cli.no_flow),
        attrs: toggle(cli.attrs, cli.no_attrs),
        setattrs: toggle(cli.setattrs, cli.no_setattrs),
        calls: toggle(cli.calls, cli.no_calls),
        builtins: toggle(cli.builtins, cli.no_builtins),
        imports: toggle(cli.imports, cli.no_imports),
        string_mode: parse_mode(&cli.string_mode, StringMode::from_name, "string mode")?,
        int_mode: parse_mode(&cli.int_mode, IntMode::from_name, "int mode")?,
        float_mode: parse_mode(&cli.float_mode, FloatMode::from_name, "float mode")?,
        bytes_mode: parse_mode(&cli.bytes_mode, BytesMode::from_name, "bytes mode")?,
        bool_mode: parse_mode(&cli.bool_mode, BoolMode::from_name, "bool mode")?,
        none_mode: parse_mode(&cli.none_mode, NoneMode::from_name, "none mode")?,
        attr_mode: parse_mode(&cli.attr_mode, AttrMode::from_name, "attr mode")?,
        setattr_mode: parse_mode(&cli.setattr_mode, SetattrMode::from_name, "setattr mode")?,
        call_mode: parse_mode(&cli.call_mode, CallMode::from_name, "call mode")?,
        builtin_mode: parse_mode(&cli.builtin_mode, BuiltinMode::from_name, "builtin mode")?,
        import_mode: parse_mode(&cli.import_mode, ImportMode::from_name, "import mode")?,
        loop_mode: parse_mode(&cli.loop_mode, LoopMode::from_name, "loop mode")?,
        attr_rate: cli.attr_rate,
        setattr_rate: cli.setattr_rate,
        call_rate: cli.call_rate,
        builtin_rate: cli.builtin_rate,
        import_rate: cli.import_rate,
        flow_rate: cli.flow_rate,
        cond_rate: cli.cond_rate,
        branch_rate: cli.branch_rate,
        loop_rate: cli.loop_rate,
        flow_count: cli.flow_count,
        string_rate: cli.string_rate,
        int_rate: cli.int_rate,
        float_rate: cli.float_rate,
        bytes_rate: cli.bytes_rate,
        bool_rate: cli.bool_rate,
        none_rate: cli.none_rate,
        string_chunk_min: cli.string_chunk_min,
        string_chunk_max: cli.string_chunk_max,
        string_helpers: cli.string_helpers,
        call_helpers: cli.call_helpers,
        order: cli.order.as_ref().map(|raw| split_csv(raw)),
        preserve: split_csv(&cli.preserve),
        preserve_attrs: split_csv(&cli.preserve_attrs),
        keep_docstrings: cli.keep_docstrings,
        seed: cli.seed,
        value_salt: cli.value_salt,
        salt_coupling: cli.salt_coupling,
        mt_workers: cli.mt_workers,
        redirect_kinds: split_csv(&cli.redirect),
        redirect_rate: cli.redirect_rate,
        redirect_max: cli.redirect_max,
        redirect_all: cli.redirect_all,
        meta_include_source: cli.meta_include_source,
        meta_omit_rename_map: cli.meta_omit_rename_map,
        meta_omit_helper_hints: cli.meta_omit_helper_hints,
        meta_minimal: cli.meta_minimal,
    })
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run() {
        eprintln!("error: {e}");
        std::process::exit(2);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let raw = to_raw_options(&cli)?;
    let config = raw.resolve()?;

    let tree_json = fs::read_to_string(&cli.input)?;
    let module: Module = serde_json::from_str(&tree_json)?;

    if cli.deobfuscate {
        let meta_path = cli
            .meta
            .as_ref()
            .ok_or("--meta is required with --deobfuscate")?;
        let meta = ObfuMeta::from_json(&fs::read_to_string(meta_path)?)?;
        let mode = DeobfMode::from_name(&cli.deobf_mode)
            .ok_or_else(|| format!("unknown deobfuscation mode: {}", cli.deobf_mode))?;
        let outcome = deobfuscate(&module, &meta, mode, cli.force)?;
        match &outcome.restored {
            RestoredProgram::Source(text) => fs::write(&cli.output, text)?,
            RestoredProgram::Tree(tree) => {
                fs::write(&cli.output, serde_json::to_string_pretty(tree)?)?;
            }
        }
        println!(
            "Deobfuscated: {} using meta={}",
            cli.output.display(),
            meta_path.display()
        );
        for warning in &outcome.warnings {
            println!("warning: {warning}");
        }
        return Ok(());
    }

    if cli.explain {
        println!("{}", config.describe());
    }

    let source_text = match &cli.source {
        Some(path) => Some(fs::read_to_string(path)?),
        None => None,
    };
    let output = obfuscate(module, &config, source_text.as_deref())?;

    let rendered = serde_json::to_string_pretty(&output.module)?;
    fs::write(&cli.output, &rendered)?;

    if cli.check {
        let _: Module = serde_json::from_str(&rendered)?;
    }

    if let Some(path) = &cli.emit_map {
        fs::write(
            path,
            serde_json::to_string_pretty(&output.rename_map.to_artifact())?,
        )?;
    }
    if let Some(path) = &cli.emit_meta {
        fs::write(path, output.meta.to_json()?)?;
    }

    let stats = &output.stats;
    println!(
        "Wrote: {} | stats(renamed={}, strings={}, ints={}, floats={}, bytes={}, none={}, \
         bools={}, attrs={}, setattrs={}, calls={}, builtins={}, imports={}, \
         flow(cond={}, branch={}, loop={}, dead={}), junk={}, redirected={})",
        cli.output.display(),
        stats.renamed,
        stats.strings,
        stats.ints,
        stats.floats,
        stats.bytes,
        stats.none_values,
        stats.bools,
        stats.attrs,
        stats.setattrs,
        stats.calls,
        stats.builtins,
        stats.imports,
        stats.flow_conditions,
        stats.flow_branches,
        stats.flow_loops,
        stats.dead_blocks,
        stats.junk_functions,
        stats.redirected,
    );
    for warning in &stats.warnings {
        println!("warning: {warning}");
    }
    Ok(())
}
