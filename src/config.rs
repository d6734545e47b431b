//! Layered configuration resolution. Precedence, lowest to highest: level
//! defaults, profile preset, dynamic-level tier defaults, allow/deny
//! overrides, explicit per-feature flags/rates/modes. Later layers override
//! earlier ones field by field.

use rustc_hash::FxHashSet;

use crate::methods::{Method, MethodPool, Tier};
use crate::{Error, Result};

macro_rules! mode_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub enum $name {
            Mixed,
            $($variant),+
        }

        impl $name {
            pub const fn name(self) -> &'static str {
                match self {
                    Self::Mixed => "mixed",
                    $(Self::$variant => $text),+
                }
            }

            pub fn from_name(name: &str) -> Option<Self> {
                match name {
                    "mixed" => Some(Self::Mixed),
                    $($text => Some(Self::$variant),)+
                    _ => None,
                }
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::Mixed
            }
        }
    };
}

mode_enum!(StringMode { Xor => "xor", B64 => "b64", Reverse => "reverse", Split => "split" });
mode_enum!(IntMode { Xor => "xor", Arith => "arith", Split => "split" });
mode_enum!(FloatMode { Hex => "hex", Struct => "struct" });
mode_enum!(BytesMode { Xor => "xor", List => "list", Split => "split" });
mode_enum!(BoolMode { Compare => "compare", Xor => "xor" });
mode_enum!(NoneMode { Lambda => "lambda", IfExpr => "ifexpr" });
mode_enum!(AttrMode { Getattr => "getattr", Builtins => "builtins", Attrgetter => "attrgetter", Lambda => "lambda" });
mode_enum!(SetattrMode { Setattr => "setattr", Builtins => "builtins", Lambda => "lambda" });
mode_enum!(CallMode { Wrap => "wrap", Lambda => "lambda", Eval => "eval" });
mode_enum!(BuiltinMode { Alias => "alias", Getattr => "getattr", Globals => "globals" });
mode_enum!(ImportMode { Dunder => "dunder", Importlib => "importlib", Globals => "globals" });
mode_enum!(LoopMode { Guard => "guard", Iterator => "iterator" });

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Profile {
    #[default]
    Balanced,
    Stealth,
    Max,
}

impl Profile {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Balanced => "balanced",
            Self::Stealth => "stealth",
            Self::Max => "max",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "balanced" => Some(Self::Balanced),
            "stealth" => Some(Self::Stealth),
            "max" => Some(Self::Max),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JunkPosition {
    #[default]
    Top,
    Bottom,
    Random,
}

impl JunkPosition {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Top => "top",
            Self::Bottom => "bottom",
            Self::Random => "random",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "top" => Some(Self::Top),
            "bottom" => Some(Self::Bottom),
            "random" => Some(Self::Random),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PassId {
    Attrs,
    Setattrs,
    Calls,
    Imports,
    Bools,
    Ints,
    Floats,
    Bytes,
    None,
    Flow,
}

impl PassId {
    pub const DEFAULT_ORDER: [Self; 10] = [
        Self::Attrs,
        Self::Setattrs,
        Self::Calls,
        Self::Imports,
        Self::Bools,
        Self::Ints,
        Self::Floats,
        Self::Bytes,
        Self::None,
        Self::Flow,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            Self::Attrs => "attrs",
            Self::Setattrs => "setattrs",
            Self::Calls => "calls",
            Self::Imports => "imports",
            Self::Bools => "bools",
            Self::Ints => "ints",
            Self::Floats => "floats",
            Self::Bytes => "bytes",
            Self::None => "none",
            Self::Flow => "flow",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::DEFAULT_ORDER.into_iter().find(|p| p.name() == name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RedirectKind {
    Class,
    Function,
    Variable,
}

impl RedirectKind {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Class => "class",
            Self::Function => "function",
            Self::Variable => "variable",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "class" => Some(Self::Class),
            "function" => Some(Self::Function),
            "variable" => Some(Self::Variable),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RedirectMode {
    Lambda,
    GlobalsGet,
    #[default]
    DictGet,
    Itemgetter,
}

impl RedirectMode {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Lambda => "lambda",
            Self::GlobalsGet => "globals_get",
            Self::DictGet => "dict_get",
            Self::Itemgetter => "itemgetter",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "lambda" => Some(Self::Lambda),
            "globals_get" => Some(Self::GlobalsGet),
            "dict_get" => Some(Self::DictGet),
            "itemgetter" => Some(Self::Itemgetter),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RedirectConfig {
    /// Selected kinds with the mode each kind's table uses.
    pub kinds: Vec<(RedirectKind, RedirectMode)>,
    pub rate: f64,
    pub max: usize,
    /// Redirect every eligible symbol; ignores `rate` and `max` entirely.
    pub all: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetaConfig {
    pub include_source: bool,
    pub omit_rename_map: bool,
    pub omit_helper_hints: bool,
}

/// Everything the caller may set. Unset fields inherit through the layer
/// stack during [`RawOptions::resolve`].
#[derive(Debug, Clone, Default)]
pub struct RawOptions {
    pub level: Option<u8>,
    pub profile: Profile,
    pub dynamic_level: Option<Tier>,
    pub dynamic_allow: Vec<String>,
    pub dynamic_deny: Vec<String>,
    pub passes: Option<u32>,
    pub junk: Option<u32>,
    pub junk_position: JunkPosition,

    pub rename: Option<bool>,
    pub strings: Option<bool>,
    pub ints: Option<bool>,
    pub floats: Option<bool>,
    pub bytes: Option<bool>,
    pub none_values: Option<bool>,
    pub bools: Option<bool>,
    pub flow: Option<bool>,
    pub attrs: Option<bool>,
    pub setattrs: Option<bool>,
    pub calls: Option<bool>,
    pub builtins: Option<bool>,
    pub imports: Option<bool>,

    pub string_mode: Option<StringMode>,
    pub int_mode: Option<IntMode>,
    pub float_mode: Option<FloatMode>,
    pub bytes_mode: Option<BytesMode>,
    pub bool_mode: Option<BoolMode>,
    pub none_mode: Option<NoneMode>,
    pub attr_mode: Option<AttrMode>,
    pub setattr_mode: Option<SetattrMode>,
    pub call_mode: Option<CallMode>,
    pub builtin_mode: Option<BuiltinMode>,
    pub import_mode: Option<ImportMode>,
    pub loop_mode: Option<LoopMode>,

    pub attr_rate: Option<f64>,
    pub setattr_rate: Option<f64>,
    pub call_rate: Option<f64>,
    pub builtin_rate: Option<f64>,
    pub import_rate: Option<f64>,
    pub flow_rate: Option<f64>,
    pub cond_rate: Option<f64>,
    pub branch_rate: Option<f64>,
    pub loop_rate: Option<f64>,
    pub flow_count: Option<u32>,
    pub string_rate: Option<f64>,
    pub int_rate: Option<f64>,
    pub float_rate: Option<f64>,
    pub bytes_rate: Option<f64>,
    pub bool_rate: Option<f64>,
    pub none_rate: Option<f64>,

    pub string_chunk_min: Option<usize>,
    pub string_chunk_max: Option<usize>,
    pub string_helpers: Option<usize>,
    pub call_helpers: Option<usize>,
    pub order: Option<Vec<String>>,

    pub preserve: Vec<String>,
    pub preserve_attrs: Vec<String>,
    pub keep_docstrings: bool,
    pub seed: Option<u64>,
    pub value_salt: Option<u64>,
    /// Mix an input-tree-derived component into the value salt.
    pub salt_coupling: bool,
    pub mt_workers: Option<usize>,

    /// Tokens `kind` or `kind:mode`, e.g. `function:lambda`.
    pub redirect_kinds: Vec<String>,
    pub redirect_rate: Option<f64>,
    pub redirect_max: Option<usize>,
    pub redirect_all: bool,

    pub meta_include_source: bool,
    pub meta_omit_rename_map: bool,
    pub meta_omit_helper_hints: bool,
    /// Shorthand: omit source, rename map and helper hints together.
    pub meta_minimal: bool,
}

/// Immutable, fully-resolved configuration. Built once per run.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectiveConfig {
    pub level: u8,
    pub profile: Profile,
    pub dynamic_level: Tier,
    pub passes: u32,
    pub junk: u32,
    pub junk_position: JunkPosition,

    pub rename: bool,
    pub strings: bool,
    pub ints: bool,
    pub floats: bool,
    pub bytes: bool,
    pub none_values: bool,
    pub bools: bool,
    pub flow: bool,
    pub attrs: bool,
    pub setattrs: bool,
    pub calls: bool,
    pub builtins: bool,
    pub imports: bool,

    pub string_mode: StringMode,
    pub int_mode: IntMode,
    pub float_mode: FloatMode,
    pub bytes_mode: BytesMode,
    pub bool_mode: BoolMode,
    pub none_mode: NoneMode,
    pub attr_mode: AttrMode,
    pub setattr_mode: SetattrMode,
    pub call_mode: CallMode,
    pub builtin_mode: BuiltinMode,
    pub import_mode: ImportMode,
    pub loop_mode: LoopMode,

    pub attr_rate: f64,
    pub setattr_rate: f64,
    pub call_rate: f64,
    pub builtin_rate: f64,
    pub import_rate: f64,
    pub flow_rate: f64,
    pub cond_rate: f64,
    pub branch_rate: f64,
    pub loop_rate: f64,
    pub flow_count: u32,
    pub string_rate: f64,
    pub int_rate: f64,
    pub float_rate: f64,
    pub bytes_rate: f64,
    pub bool_rate: f64,
    pub none_rate: f64,

    pub string_chunk_min: usize,
    pub string_chunk_max: usize,
    pub string_helpers: usize,
    pub call_helpers: usize,
    pub transform_order: Vec<PassId>,

    pub keep_docstrings: bool,
    pub preserve_names: FxHashSet<String>,
    pub preserve_attrs: FxHashSet<String>,
    pub seed: u64,
    pub value_salt: u64,
    pub salt_coupling: bool,
    pub mt_workers: usize,

    pub redirect: RedirectConfig,
    pub meta: MetaConfig,
    pub methods: MethodPool,
}

struct LevelDefaults {
    rename: bool,
    strings: bool,
    ints: bool,
    floats: bool,
    bytes: bool,
    none_values: bool,
    bools: bool,
    flow: bool,
    attrs: bool,
    setattrs: bool,
    calls: bool,
    builtins: bool,
    imports: bool,
    passes: u32,
    junk: u32,
    dynamic_rate: f64,
    flow_rate: f64,
    structural_rate: f64,
    flow_count: u32,
}

fn level_defaults(level: u8) -> LevelDefaults {
    let dynamic_rate = match level {
        1 => 0.3,
        2 => 0.4,
        3 => 0.5,
        4 => 0.75,
        _ => 1.0,
    };
    let structural_rate = match level {
        1 => 0.2,
        2 => 0.3,
        3 => 0.4,
        4 => 0.6,
        _ => 0.9,
    };
    LevelDefaults {
        rename: true,
        strings: level >= 2,
        ints: level >= 3,
        floats: level >= 3,
        bytes: level >= 4,
        none_values: level >= 3,
        bools: level >= 4,
        flow: level >= 3,
        attrs: level >= 4,
        setattrs: level >= 3,
        calls: level >= 4,
        builtins: level >= 2,
        imports: level >= 4,
        passes: if level >= 4 { 2 } else { 1 },
        junk: match level {
            4 => 1,
            5 => 3,
            _ => 0,
        },
        dynamic_rate,
        flow_rate: dynamic_rate,
        structural_rate,
        flow_count: if level >= 5 { 2 } else { 1 },
    }
}

struct ProfileOverlay {
    dynamic_level: Tier,
    passes: u32,
    junk: u32,
    attr_rate: f64,
    setattr_rate: f64,
    call_rate: f64,
    builtin_rate: f64,
    import_rate: f64,
    flow_rate: f64,
    cond_rate: f64,
    branch_rate: f64,
    loop_rate: f64,
    flow_count: u32,
    features_on: bool,
    bytes: bool,
}

fn profile_overlay(profile: Profile) -> Option<ProfileOverlay> {
    match profile {
        // Balanced is the neutral profile: level defaults pass through.
        Profile::Balanced => None,
        Profile::Stealth => Some(ProfileOverlay {
            dynamic_level: Tier::Safe,
            passes: 1,
            junk: 0,
            attr_rate: 0.3,
            setattr_rate: 0.45,
            call_rate: 0.4,
            builtin_rate: 0.6,
            import_rate: 0.3,
            flow_rate: 0.35,
            cond_rate: 0.25,
            branch_rate: 0.2,
            loop_rate: 0.15,
            flow_count: 1,
            features_on: true,
            bytes: false,
        }),
        Profile::Max => Some(ProfileOverlay {
            dynamic_level: Tier::Heavy,
            passes: 3,
            junk: 4,
            attr_rate: 1.0,
            setattr_rate: 1.0,
            call_rate: 1.0,
            builtin_rate: 1.0,
            import_rate: 1.0,
            flow_rate: 1.0,
            cond_rate: 1.0,
            branch_rate: 1.0,
            loop_rate: 1.0,
            flow_count: 2,
            features_on: true,
            bytes: true,
        }),
    }
}

/// Attribute names common enough that rewriting them is rarely worth the
/// noise; callers extend the set with `preserve_attrs`.
const DEFAULT_PRESERVED_ATTRS: [&str; 9] = [
    "format", "append", "extend", "items", "keys", "values", "read", "write", "close",
];

const DEFAULT_PRESERVED_NAMES: [&str; 4] = ["__name__", "__file__", "__package__", "__spec__"];

fn check_rate(name: &str, rate: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&rate) || rate.is_nan() {
        return Err(Error::Config(format!(
            "{name} must be between 0.0 and 1.0, got {rate}"
        )));
    }
    Ok(())
}

fn parse_order(tokens: &[String]) -> Result<Vec<PassId>> {
    let mut order = Vec::with_capacity(tokens.len());
    for token in tokens {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        let pass = PassId::from_name(token)
            .ok_or_else(|| Error::Config(format!("unknown transform in order: {token}")))?;
        if order.contains(&pass) {
            return Err(Error::Config(format!("duplicate transform in order: {token}")));
        }
        order.push(pass);
    }
    if order.is_empty() {
        order = PassId::DEFAULT_ORDER.to_vec();
    }
    Ok(order)
}

fn parse_redirect_kinds(tokens: &[String]) -> Result<Vec<(RedirectKind, RedirectMode)>> {
    let mut kinds = Vec::new();
    for token in tokens {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        let (kind_name, mode) = match token.split_once(':') {
            Some((kind, mode_name)) => {
                let mode = RedirectMode::from_name(mode_name.trim()).ok_or_else(|| {
                    Error::Config(format!("unknown redirect mode: {mode_name}"))
                })?;
                (kind.trim(), mode)
            }
            None => (token, RedirectMode::default()),
        };
        let kind = RedirectKind::from_name(kind_name)
            .ok_or_else(|| Error::Config(format!("unknown redirect kind: {kind_name}")))?;
        if kinds.iter().any(|(k, _)| *k == kind) {
            return Err(Error::Config(format!("duplicate redirect kind: {kind_name}")));
        }
        kinds.push((kind, mode));
    }
    Ok(kinds)
}

fn resolve_methods(
    tier: Tier,
    allow: &[String],
    deny: &[String],
    raw: &RawOptions,
) -> Result<MethodPool> {
    let mut pool = MethodPool::for_tier(tier);
    let mut explicit_allow: Vec<Method> = Vec::new();

    for token in allow {
        for method in Method::parse_token(token).map_err(Error::Config)? {
            pool.add(method);
            explicit_allow.push(method);
        }
    }
    // Deny is applied after allow: same-token conflicts resolve as a veto.
    for token in deny {
        for method in Method::parse_token(token).map_err(Error::Config)? {
            pool.remove(method);
        }
    }

    // Risky strategies are opt-in only through explicit allow tokens, even
    // at the heaviest tier.
    let risky: Vec<Method> = pool
        .call
        .iter()
        .map(|m| Method::Call(*m))
        .filter(|m| m.is_risky())
        .collect();
    for method in risky {
        if !explicit_allow.contains(&method) {
            pool.remove(method);
        }
    }

    apply_explicit_method_mode(&mut pool, raw);

    // An explicit mode that narrows a family to a risky strategy still needs
    // the allow token; the gate is structural, not a preference.
    if let Some(method) = pool
        .call
        .iter()
        .map(|m| Method::Call(*m))
        .find(|m| m.is_risky() && !explicit_allow.contains(m))
    {
        return Err(Error::Config(format!(
            "risky strategy {}:{} requires an explicit dynamic-allow entry",
            method.family().name(),
            method.name()
        )));
    }

    pool.sanitize();
    Ok(pool)
}

fn apply_explicit_method_mode(pool: &mut MethodPool, raw: &RawOptions) {
    use crate::methods::{AttrMethod, BuiltinMethod, CallMethod, ImportMethod, SetattrMethod};

    match raw.attr_mode {
        Some(AttrMode::Getattr) => pool.attr = vec![AttrMethod::Getattr],
        Some(AttrMode::Builtins) => pool.attr = vec![AttrMethod::BuiltinsGetattr],
        Some(AttrMode::Attrgetter) => pool.attr = vec![AttrMethod::OperatorAttrgetter],
        Some(AttrMode::Lambda) => pool.attr = vec![AttrMethod::LambdaGetattr],
        _ => {}
    }
    match raw.setattr_mode {
        Some(SetattrMode::Setattr) => {
            pool.setattr = vec![SetattrMethod::Setattr, SetattrMethod::Delattr];
        }
        Some(SetattrMode::Builtins) => {
            pool.setattr = vec![SetattrMethod::BuiltinsSetattr, SetattrMethod::BuiltinsDelattr];
        }
        Some(SetattrMode::Lambda) => {
            pool.setattr = vec![SetattrMethod::LambdaSetattr, SetattrMethod::LambdaDelattr];
        }
        _ => {}
    }
    match raw.call_mode {
        Some(CallMode::Wrap) => pool.call = vec![CallMethod::HelperWrap],
        Some(CallMode::Lambda) => pool.call = vec![CallMethod::LambdaWrap],
        Some(CallMode::Eval) => pool.call = vec![CallMethod::BuiltinsEvalCall],
        _ => {}
    }
    match raw.builtin_mode {
        Some(BuiltinMode::Alias) => pool.builtin = vec![BuiltinMethod::Alias],
        Some(BuiltinMode::Getattr) => pool.builtin = vec![BuiltinMethod::BuiltinsGetattrAlias],
        Some(BuiltinMode::Globals) => pool.builtin = vec![BuiltinMethod::GlobalsLookup],
        _ => {}
    }
    match raw.import_mode {
        Some(ImportMode::Dunder) => pool.import = vec![ImportMethod::DunderImport],
        Some(ImportMode::Importlib) => pool.import = vec![ImportMethod::ImportlibModule],
        Some(ImportMode::Globals) => pool.import = vec![ImportMethod::GlobalsLookup],
        _ => {}
    }
}

impl RawOptions {
    pub fn resolve(&self) -> Result<EffectiveConfig> {
        let level = self.level.unwrap_or(2);
        if !(1..=5).contains(&level) {
            return Err(Error::Config(format!("level must be 1..=5, got {level}")));
        }

        let base = level_defaults(level);
        let overlay = profile_overlay(self.profile);

        let mut rename = base.rename;
        let mut strings = base.strings;
        let mut ints = base.ints;
        let mut floats = base.floats;
        let mut bytes = base.bytes;
        let mut none_values = base.none_values;
        let mut bools = base.bools;
        let mut flow = base.flow;
        let mut attrs = base.attrs;
        let mut setattrs = base.setattrs;
        let mut calls = base.calls;
        let mut builtins = base.builtins;
        let mut imports = base.imports;
        let mut passes = base.passes;
        let mut junk = base.junk;
        let mut attr_rate = base.dynamic_rate;
        let mut setattr_rate = base.dynamic_rate;
        let mut call_rate = base.dynamic_rate;
        let mut builtin_rate = base.dynamic_rate;
        let mut import_rate = base.dynamic_rate;
        let mut flow_rate = base.flow_rate;
        let mut cond_rate = base.structural_rate;
        let mut branch_rate = base.structural_rate;
        let mut loop_rate = base.structural_rate;
        let mut flow_count = base.flow_count;
        let mut dynamic_level = Tier::Safe;

        if let Some(overlay) = overlay {
            rename = overlay.features_on;
            strings = overlay.features_on;
            ints = overlay.features_on;
            floats = overlay.features_on;
            bytes = overlay.bytes;
            none_values = overlay.features_on;
            bools = overlay.features_on;
            flow = overlay.features_on;
            attrs = overlay.features_on;
            setattrs = overlay.features_on;
            calls = overlay.features_on;
            builtins = overlay.features_on;
            imports = overlay.features_on;
            passes = overlay.passes;
            junk = overlay.junk;
            attr_rate = overlay.attr_rate;
            setattr_rate = overlay.setattr_rate;
            call_rate = overlay.call_rate;
            builtin_rate = overlay.builtin_rate;
            import_rate = overlay.import_rate;
            flow_rate = overlay.flow_rate;
            cond_rate = overlay.cond_rate;
            branch_rate = overlay.branch_rate;
            loop_rate = overlay.loop_rate;
            flow_count = overlay.flow_count;
            dynamic_level = overlay.dynamic_level;
        }

        if let Some(tier) = self.dynamic_level {
            dynamic_level = tier;
        }

        // Explicit flags/rates/modes are the top layer.
        rename = self.rename.unwrap_or(rename);
        strings = self.strings.unwrap_or(strings);
        ints = self.ints.unwrap_or(ints);
        floats = self.floats.unwrap_or(floats);
        bytes = self.bytes.unwrap_or(bytes);
        none_values = self.none_values.unwrap_or(none_values);
        bools = self.bools.unwrap_or(bools);
        flow = self.flow.unwrap_or(flow);
        attrs = self.attrs.unwrap_or(attrs);
        setattrs = self.setattrs.unwrap_or(setattrs);
        calls = self.calls.unwrap_or(calls);
        builtins = self.builtins.unwrap_or(builtins);
        imports = self.imports.unwrap_or(imports);
        passes = self.passes.unwrap_or(passes).max(1);
        junk = self.junk.unwrap_or(junk);
        attr_rate = self.attr_rate.unwrap_or(attr_rate);
        setattr_rate = self.setattr_rate.unwrap_or(setattr_rate);
        call_rate = self.call_rate.unwrap_or(call_rate);
        builtin_rate = self.builtin_rate.unwrap_or(builtin_rate);
        import_rate = self.import_rate.unwrap_or(import_rate);
        flow_rate = self.flow_rate.unwrap_or(flow_rate);
        cond_rate = self.cond_rate.unwrap_or(cond_rate);
        branch_rate = self.branch_rate.unwrap_or(branch_rate);
        loop_rate = self.loop_rate.unwrap_or(loop_rate);
        flow_count = self.flow_count.unwrap_or(flow_count);

        // Literal-type rates default to rewriting every eligible site.
        let string_rate = self.string_rate.unwrap_or(1.0);
        let int_rate = self.int_rate.unwrap_or(1.0);
        let float_rate = self.float_rate.unwrap_or(1.0);
        let bytes_rate = self.bytes_rate.unwrap_or(1.0);
        let bool_rate = self.bool_rate.unwrap_or(1.0);
        let none_rate = self.none_rate.unwrap_or(1.0);
        check_rate("string-rate", string_rate)?;
        check_rate("int-rate", int_rate)?;
        check_rate("float-rate", float_rate)?;
        check_rate("bytes-rate", bytes_rate)?;
        check_rate("bool-rate", bool_rate)?;
        check_rate("none-rate", none_rate)?;

        check_rate("attr-rate", attr_rate)?;
        check_rate("setattr-rate", setattr_rate)?;
        check_rate("call-rate", call_rate)?;
        check_rate("builtin-rate", builtin_rate)?;
        check_rate("import-rate", import_rate)?;
        check_rate("flow-rate", flow_rate)?;
        check_rate("cond-rate", cond_rate)?;
        check_rate("branch-rate", branch_rate)?;
        check_rate("loop-rate", loop_rate)?;
        if flow_count == 0 {
            return Err(Error::Config("flow-count must be >= 1".into()));
        }

        let string_chunk_min = self.string_chunk_min.unwrap_or(1);
        let string_chunk_max = self.string_chunk_max.unwrap_or(6);
        if string_chunk_min == 0 || string_chunk_max == 0 {
            return Err(Error::Config("string chunk sizes must be >= 1".into()));
        }
        if string_chunk_min > string_chunk_max {
            return Err(Error::Config(
                "string-chunk-min must be <= string-chunk-max".into(),
            ));
        }

        let string_helpers = self.string_helpers.unwrap_or(1);
        let call_helpers = self.call_helpers.unwrap_or(1);
        if string_helpers == 0 || call_helpers == 0 {
            return Err(Error::Config("helper pool sizes must be >= 1".into()));
        }

        let mt_workers = self.mt_workers.unwrap_or(1);
        if mt_workers == 0 {
            return Err(Error::Config("mt-workers must be >= 1".into()));
        }

        let transform_order = match &self.order {
            Some(tokens) => parse_order(tokens)?,
            None => PassId::DEFAULT_ORDER.to_vec(),
        };

        let redirect_rate = self.redirect_rate.unwrap_or(0.5);
        check_rate("redirect-rate", redirect_rate)?;
        let redirect = RedirectConfig {
            kinds: parse_redirect_kinds(&self.redirect_kinds)?,
            rate: redirect_rate,
            max: self.redirect_max.unwrap_or(32),
            all: self.redirect_all,
        };

        let methods = resolve_methods(dynamic_level, &self.dynamic_allow, &self.dynamic_deny, self)?;

        let mut preserve_names: FxHashSet<String> =
            self.preserve.iter().map(|s| s.trim().to_string()).collect();
        preserve_names.remove("");
        preserve_names.extend(DEFAULT_PRESERVED_NAMES.iter().map(ToString::to_string));

        let mut preserve_attrs: FxHashSet<String> = self
            .preserve_attrs
            .iter()
            .map(|s| s.trim().to_string())
            .collect();
        preserve_attrs.remove("");
        preserve_attrs.extend(DEFAULT_PRESERVED_ATTRS.iter().map(ToString::to_string));

        let meta = MetaConfig {
            include_source: self.meta_include_source && !self.meta_minimal,
            omit_rename_map: self.meta_omit_rename_map || self.meta_minimal,
            omit_helper_hints: self.meta_omit_helper_hints || self.meta_minimal,
        };

        Ok(EffectiveConfig {
            level,
            profile: self.profile,
            dynamic_level,
            passes,
            junk,
            junk_position: self.junk_position,
            rename,
            strings,
            ints,
            floats,
            bytes,
            none_values,
            bools,
            flow,
            attrs,
            setattrs,
            calls,
            builtins,
            imports,
            string_mode: self.string_mode.unwrap_or_default(),
            int_mode: self.int_mode.unwrap_or_default(),
            float_mode: self.float_mode.unwrap_or_default(),
            bytes_mode: self.bytes_mode.unwrap_or_default(),
            bool_mode: self.bool_mode.unwrap_or_default(),
            none_mode: self.none_mode.unwrap_or_default(),
            attr_mode: self.attr_mode.unwrap_or_default(),
            setattr_mode: self.setattr_mode.unwrap_or_default(),
            call_mode: self.call_mode.unwrap_or_default(),
            builtin_mode: self.builtin_mode.unwrap_or_default(),
            import_mode: self.import_mode.unwrap_or_default(),
            loop_mode: self.loop_mode.unwrap_or_default(),
            attr_rate,
            setattr_rate,
            call_rate,
            builtin_rate,
            import_rate,
            flow_rate,
            cond_rate,
            branch_rate,
            loop_rate,
            flow_count,
            string_rate,
            int_rate,
            float_rate,
            bytes_rate,
            bool_rate,
            none_rate,
            string_chunk_min,
            string_chunk_max,
            string_helpers,
            call_helpers,
            transform_order,
            keep_docstrings: self.keep_docstrings,
            preserve_names,
            preserve_attrs,
            seed: self.seed.unwrap_or(0),
            value_salt: self.value_salt.unwrap_or(0),
            salt_coupling: self.salt_coupling,
            mt_workers,
            redirect,
            meta,
            methods,
        })
    }
}

impl EffectiveConfig {
    /// One-line summary for `--explain`.
    pub fn describe(&self) -> String {
        format!(
            "level={} profile={} dynamic={} passes={} order={} junk={}@{} \
             rates(attr={:.2} setattr={:.2} call={:.2} builtin={:.2} import={:.2} \
             flow={:.2} cond={:.2} branch={:.2} loop={:.2}) workers={} methods({})",
            self.level,
            self.profile.name(),
            self.dynamic_level.name(),
            self.passes,
            self.transform_order
                .iter()
                .map(|p| p.name())
                .collect::<Vec<_>>()
                .join(","),
            self.junk,
            self.junk_position.name(),
            self.attr_rate,
            self.setattr_rate,
            self.call_rate,
            self.builtin_rate,
            self.import_rate,
            self.flow_rate,
            self.cond_rate,
            self.branch_rate,
            self.loop_rate,
            self.mt_workers,
            self.methods.describe(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::methods::CallMethod;

    #[test]
    fn test_level_three_defaults() {
        let config = RawOptions {
            level: Some(3),
            ..RawOptions::default()
        }
        .resolve()
        .unwrap();
        assert!(config.strings && config.ints && config.floats);
        assert!(!config.attrs && !config.bytes);
        assert_eq!(config.attr_rate, 0.5);
    }

    #[test]
    fn test_profile_overrides_level_rate() {
        let config = RawOptions {
            level: Some(3),
            profile: Profile::Stealth,
            ..RawOptions::default()
        }
        .resolve()
        .unwrap();
        assert_eq!(config.attr_rate, 0.3);
    }

    #[test]
    fn test_explicit_rate_overrides_profile_and_level() {
        let config = RawOptions {
            level: Some(3),
            profile: Profile::Stealth,
            attr_rate: Some(0.9),
            ..RawOptions::default()
        }
        .resolve()
        .unwrap();
        assert_eq!(config.attr_rate, 0.9);
    }

    #[test]
    fn test_rate_out_of_range_is_config_error() {
        let result = RawOptions {
            attr_rate: Some(1.5),
            ..RawOptions::default()
        }
        .resolve();
        assert!(matches!(result, Err(crate::Error::Config(_))));
    }

    #[test]
    fn test_risky_method_filtered_even_at_heavy_tier() {
        let config = RawOptions {
            dynamic_level: Some(Tier::Heavy),
            ..RawOptions::default()
        }
        .resolve()
        .unwrap();
        assert!(!config.methods.call.contains(&CallMethod::BuiltinsEvalCall));
    }

    #[test]
    fn test_risky_method_allowed_when_explicit() {
        let config = RawOptions {
            dynamic_level: Some(Tier::Heavy),
            dynamic_allow: vec!["call:builtins_eval_call".into()],
            ..RawOptions::default()
        }
        .resolve()
        .unwrap();
        assert!(config.methods.call.contains(&CallMethod::BuiltinsEvalCall));
    }

    #[test]
    fn test_deny_beats_allow_for_same_token() {
        let config = RawOptions {
            dynamic_allow: vec!["call:builtins_eval_call".into()],
            dynamic_deny: vec!["call:builtins_eval_call".into()],
            ..RawOptions::default()
        }
        .resolve()
        .unwrap();
        assert!(!config.methods.call.contains(&CallMethod::BuiltinsEvalCall));
    }

    #[test]
    fn test_unknown_allow_token_is_config_error() {
        let result = RawOptions {
            dynamic_allow: vec!["attr:warp_drive".into()],
            ..RawOptions::default()
        }
        .resolve();
        assert!(matches!(result, Err(crate::Error::Config(_))));
    }

    #[test]
    fn test_unknown_order_token_is_config_error() {
        let result = RawOptions {
            order: Some(vec!["attrs".into(), "quux".into()]),
            ..RawOptions::default()
        }
        .resolve();
        assert!(matches!(result, Err(crate::Error::Config(_))));
    }

    #[test]
    fn test_unknown_redirect_kind_is_config_error() {
        let result = RawOptions {
            redirect_kinds: vec!["module".into()],
            ..RawOptions::default()
        }
        .resolve();
        assert!(matches!(result, Err(crate::Error::Config(_))));
    }

    #[test]
    fn test_redirect_kind_with_mode() {
        let config = RawOptions {
            redirect_kinds: vec!["function:lambda".into(), "class".into()],
            ..RawOptions::default()
        }
        .resolve()
        .unwrap();
        assert_eq!(
            config.redirect.kinds,
            vec![
                (RedirectKind::Function, RedirectMode::Lambda),
                (RedirectKind::Class, RedirectMode::DictGet),
            ]
        );
    }

    #[test]
    fn test_meta_minimal_implies_omissions() {
        let config = RawOptions {
            meta_minimal: true,
            meta_include_source: true,
            ..RawOptions::default()
        }
        .resolve()
        .unwrap();
        assert!(!config.meta.include_source);
        assert!(config.meta.omit_rename_map);
        assert!(config.meta.omit_helper_hints);
    }

    #[test]
    fn test_explicit_eval_mode_still_needs_allow() {
        let result = RawOptions {
            call_mode: Some(CallMode::Eval),
            ..RawOptions::default()
        }
        .resolve();
        assert!(matches!(result, Err(crate::Error::Config(_))));

        let config = RawOptions {
            call_mode: Some(CallMode::Eval),
            dynamic_allow: vec!["call:builtins_eval_call".into()],
            ..RawOptions::default()
        }
        .resolve()
        .unwrap();
        assert_eq!(config.methods.call, vec![CallMethod::BuiltinsEvalCall]);
    }

    #[test]
    fn test_explicit_call_mode_narrows_pool() {
        let config = RawOptions {
            call_mode: Some(CallMode::Lambda),
            ..RawOptions::default()
        }
        .resolve()
        .unwrap();
        assert_eq!(config.methods.call, vec![CallMethod::LambdaWrap]);
    }
}
