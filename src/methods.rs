//! Dynamic method pools: per reference family, the closed set of indirection
//! strategies, tiered by risk. A `risky` strategy is never eligible unless it
//! was explicitly allow-listed, regardless of tier.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Family {
    Attr,
    Setattr,
    Call,
    Builtin,
    Import,
}

impl Family {
    pub const ALL: [Self; 5] = [
        Self::Attr,
        Self::Setattr,
        Self::Call,
        Self::Builtin,
        Self::Import,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            Self::Attr => "attr",
            Self::Setattr => "setattr",
            Self::Call => "call",
            Self::Builtin => "builtin",
            Self::Import => "import",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "attr" => Some(Self::Attr),
            "setattr" => Some(Self::Setattr),
            "call" => Some(Self::Call),
            "builtin" => Some(Self::Builtin),
            "import" => Some(Self::Import),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttrMethod {
    Getattr,
    BuiltinsGetattr,
    OperatorAttrgetter,
    LambdaGetattr,
    GlobalsGetattr,
    LocalsGetattr,
}

impl AttrMethod {
    pub const ALL: [Self; 6] = [
        Self::Getattr,
        Self::BuiltinsGetattr,
        Self::OperatorAttrgetter,
        Self::LambdaGetattr,
        Self::GlobalsGetattr,
        Self::LocalsGetattr,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            Self::Getattr => "getattr",
            Self::BuiltinsGetattr => "builtins_getattr",
            Self::OperatorAttrgetter => "operator_attrgetter",
            Self::LambdaGetattr => "lambda_getattr",
            Self::GlobalsGetattr => "globals_getattr",
            Self::LocalsGetattr => "locals_getattr",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SetattrMethod {
    Setattr,
    Delattr,
    BuiltinsSetattr,
    BuiltinsDelattr,
    LambdaSetattr,
    LambdaDelattr,
}

impl SetattrMethod {
    pub const ALL: [Self; 6] = [
        Self::Setattr,
        Self::Delattr,
        Self::BuiltinsSetattr,
        Self::BuiltinsDelattr,
        Self::LambdaSetattr,
        Self::LambdaDelattr,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            Self::Setattr => "setattr",
            Self::Delattr => "delattr",
            Self::BuiltinsSetattr => "builtins_setattr",
            Self::BuiltinsDelattr => "builtins_delattr",
            Self::LambdaSetattr => "lambda_setattr",
            Self::LambdaDelattr => "lambda_delattr",
        }
    }

    pub const fn is_setter(self) -> bool {
        matches!(
            self,
            Self::Setattr | Self::BuiltinsSetattr | Self::LambdaSetattr
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallMethod {
    HelperWrap,
    LambdaWrap,
    BuiltinsEvalCall,
}

impl CallMethod {
    pub const ALL: [Self; 3] = [Self::HelperWrap, Self::LambdaWrap, Self::BuiltinsEvalCall];

    pub const fn name(self) -> &'static str {
        match self {
            Self::HelperWrap => "helper_wrap",
            Self::LambdaWrap => "lambda_wrap",
            Self::BuiltinsEvalCall => "builtins_eval_call",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BuiltinMethod {
    Alias,
    BuiltinsGetattrAlias,
    GlobalsLookup,
}

impl BuiltinMethod {
    pub const ALL: [Self; 3] = [Self::Alias, Self::BuiltinsGetattrAlias, Self::GlobalsLookup];

    pub const fn name(self) -> &'static str {
        match self {
            Self::Alias => "alias",
            Self::BuiltinsGetattrAlias => "builtins_getattr_alias",
            Self::GlobalsLookup => "globals_lookup",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ImportMethod {
    DunderImport,
    ImportlibModule,
    GlobalsLookup,
}

impl ImportMethod {
    pub const ALL: [Self; 3] = [Self::DunderImport, Self::ImportlibModule, Self::GlobalsLookup];

    pub const fn name(self) -> &'static str {
        match self {
            Self::DunderImport => "dunder_import",
            Self::ImportlibModule => "importlib_module",
            Self::GlobalsLookup => "globals_lookup",
        }
    }
}

/// One strategy of one family, as addressed by `family:strategy` tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Attr(AttrMethod),
    Setattr(SetattrMethod),
    Call(CallMethod),
    Builtin(BuiltinMethod),
    Import(ImportMethod),
}

impl Method {
    pub const fn family(self) -> Family {
        match self {
            Self::Attr(_) => Family::Attr,
            Self::Setattr(_) => Family::Setattr,
            Self::Call(_) => Family::Call,
            Self::Builtin(_) => Family::Builtin,
            Self::Import(_) => Family::Import,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Attr(m) => m.name(),
            Self::Setattr(m) => m.name(),
            Self::Call(m) => m.name(),
            Self::Builtin(m) => m.name(),
            Self::Import(m) => m.name(),
        }
    }

    /// Risk is a structural property of the variant, never inferred from its
    /// name. Evaluation-based call indirection is the only risky strategy.
    pub const fn is_risky(self) -> bool {
        matches!(self, Self::Call(CallMethod::BuiltinsEvalCall))
    }

    fn in_family(family: Family, name: &str) -> Option<Self> {
        match family {
            Family::Attr => AttrMethod::ALL
                .into_iter()
                .find(|m| m.name() == name)
                .map(Self::Attr),
            Family::Setattr => SetattrMethod::ALL
                .into_iter()
                .find(|m| m.name() == name)
                .map(Self::Setattr),
            Family::Call => CallMethod::ALL
                .into_iter()
                .find(|m| m.name() == name)
                .map(Self::Call),
            Family::Builtin => BuiltinMethod::ALL
                .into_iter()
                .find(|m| m.name() == name)
                .map(Self::Builtin),
            Family::Import => ImportMethod::ALL
                .into_iter()
                .find(|m| m.name() == name)
                .map(Self::Import),
        }
    }

    /// Parses one allow/deny token. A bare strategy name resolves against
    /// every family that knows it; `family:strategy` pins one family.
    pub fn parse_token(token: &str) -> Result<Vec<Self>, String> {
        if let Some((family_name, method_name)) = token.split_once(':') {
            let family = Family::from_name(family_name.trim())
                .ok_or_else(|| format!("unknown dynamic method family: {family_name}"))?;
            let method = Self::in_family(family, method_name.trim())
                .ok_or_else(|| format!("unknown dynamic method: {token}"))?;
            return Ok(vec![method]);
        }
        let name = token.trim();
        let matches: Vec<Self> = Family::ALL
            .into_iter()
            .filter_map(|family| Self::in_family(family, name))
            .collect();
        if matches.is_empty() {
            return Err(format!("unknown dynamic method: {name}"));
        }
        Ok(matches)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Safe,
    Medium,
    Heavy,
}

impl Tier {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Safe => "safe",
            Self::Medium => "medium",
            Self::Heavy => "heavy",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "safe" => Some(Self::Safe),
            "medium" => Some(Self::Medium),
            "heavy" => Some(Self::Heavy),
            _ => None,
        }
    }
}

/// The resolved, eligible strategy set per family. Order within each family
/// follows the canonical `ALL` order so seeded choices are stable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodPool {
    pub attr: Vec<AttrMethod>,
    pub setattr: Vec<SetattrMethod>,
    pub call: Vec<CallMethod>,
    pub builtin: Vec<BuiltinMethod>,
    pub import: Vec<ImportMethod>,
}

impl MethodPool {
    pub fn for_tier(tier: Tier) -> Self {
        match tier {
            Tier::Safe => Self {
                attr: vec![
                    AttrMethod::Getattr,
                    AttrMethod::BuiltinsGetattr,
                    AttrMethod::OperatorAttrgetter,
                    AttrMethod::LambdaGetattr,
                ],
                setattr: vec![
                    SetattrMethod::Setattr,
                    SetattrMethod::Delattr,
                    SetattrMethod::BuiltinsSetattr,
                    SetattrMethod::BuiltinsDelattr,
                    SetattrMethod::LambdaSetattr,
                ],
                call: vec![CallMethod::HelperWrap, CallMethod::LambdaWrap],
                builtin: vec![BuiltinMethod::Alias, BuiltinMethod::BuiltinsGetattrAlias],
                import: vec![ImportMethod::DunderImport],
            },
            Tier::Medium => Self {
                attr: vec![
                    AttrMethod::Getattr,
                    AttrMethod::BuiltinsGetattr,
                    AttrMethod::OperatorAttrgetter,
                    AttrMethod::LambdaGetattr,
                    AttrMethod::GlobalsGetattr,
                ],
                setattr: SetattrMethod::ALL.to_vec(),
                call: vec![CallMethod::HelperWrap, CallMethod::LambdaWrap],
                builtin: BuiltinMethod::ALL.to_vec(),
                import: vec![ImportMethod::DunderImport, ImportMethod::ImportlibModule],
            },
            Tier::Heavy => Self {
                attr: AttrMethod::ALL.to_vec(),
                setattr: SetattrMethod::ALL.to_vec(),
                call: CallMethod::ALL.to_vec(),
                builtin: BuiltinMethod::ALL.to_vec(),
                import: ImportMethod::ALL.to_vec(),
            },
        }
    }

    pub fn contains(&self, method: Method) -> bool {
        match method {
            Method::Attr(m) => self.attr.contains(&m),
            Method::Setattr(m) => self.setattr.contains(&m),
            Method::Call(m) => self.call.contains(&m),
            Method::Builtin(m) => self.builtin.contains(&m),
            Method::Import(m) => self.import.contains(&m),
        }
    }

    pub fn add(&mut self, method: Method) {
        if self.contains(method) {
            return;
        }
        match method {
            Method::Attr(m) => self.attr.push(m),
            Method::Setattr(m) => self.setattr.push(m),
            Method::Call(m) => self.call.push(m),
            Method::Builtin(m) => self.builtin.push(m),
            Method::Import(m) => self.import.push(m),
        }
        self.canonicalize();
    }

    pub fn remove(&mut self, method: Method) {
        match method {
            Method::Attr(m) => self.attr.retain(|x| *x != m),
            Method::Setattr(m) => self.setattr.retain(|x| *x != m),
            Method::Call(m) => self.call.retain(|x| *x != m),
            Method::Builtin(m) => self.builtin.retain(|x| *x != m),
            Method::Import(m) => self.import.retain(|x| *x != m),
        }
    }

    /// A family emptied by deny overrides falls back to its canonical first
    /// strategy so the pipeline always has one eligible rewrite per family.
    pub fn sanitize(&mut self) {
        if self.attr.is_empty() {
            self.attr.push(AttrMethod::Getattr);
        }
        if self.setattr.is_empty() {
            self.setattr.push(SetattrMethod::Setattr);
        }
        if self.call.is_empty() {
            self.call.push(CallMethod::HelperWrap);
        }
        if self.builtin.is_empty() {
            self.builtin.push(BuiltinMethod::Alias);
        }
        if self.import.is_empty() {
            self.import.push(ImportMethod::DunderImport);
        }
        self.canonicalize();
    }

    fn canonicalize(&mut self) {
        self.attr = AttrMethod::ALL
            .into_iter()
            .filter(|m| self.attr.contains(m))
            .collect();
        self.setattr = SetattrMethod::ALL
            .into_iter()
            .filter(|m| self.setattr.contains(m))
            .collect();
        self.call = CallMethod::ALL
            .into_iter()
            .filter(|m| self.call.contains(m))
            .collect();
        self.builtin = BuiltinMethod::ALL
            .into_iter()
            .filter(|m| self.builtin.contains(m))
            .collect();
        self.import = ImportMethod::ALL
            .into_iter()
            .filter(|m| self.import.contains(m))
            .collect();
    }

    pub fn describe(&self) -> String {
        let fmt_family = |names: Vec<&'static str>| names.join(",");
        format!(
            "attr=[{}] setattr=[{}] call=[{}] builtin=[{}] import=[{}]",
            fmt_family(self.attr.iter().map(|m| m.name()).collect()),
            fmt_family(self.setattr.iter().map(|m| m.name()).collect()),
            fmt_family(self.call.iter().map(|m| m.name()).collect()),
            fmt_family(self.builtin.iter().map(|m| m.name()).collect()),
            fmt_family(self.import.iter().map(|m| m.name()).collect()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_family_qualified_token() {
        let parsed = Method::parse_token("call:builtins_eval_call").unwrap();
        assert_eq!(parsed, vec![Method::Call(CallMethod::BuiltinsEvalCall)]);
        assert!(parsed[0].is_risky());
    }

    #[test]
    fn test_parse_bare_token_hits_every_owning_family() {
        let parsed = Method::parse_token("globals_lookup").unwrap();
        assert_eq!(
            parsed,
            vec![
                Method::Builtin(BuiltinMethod::GlobalsLookup),
                Method::Import(ImportMethod::GlobalsLookup),
            ]
        );
    }

    #[test]
    fn test_parse_unknown_token_fails() {
        assert!(Method::parse_token("attr:nonsense").is_err());
        assert!(Method::parse_token("nonsense").is_err());
        assert!(Method::parse_token("bogus:getattr").is_err());
    }

    #[test]
    fn test_safe_tier_has_no_risky_strategy() {
        let pool = MethodPool::for_tier(Tier::Safe);
        assert!(!pool.contains(Method::Call(CallMethod::BuiltinsEvalCall)));
    }

    #[test]
    fn test_heavy_tier_lists_everything() {
        let pool = MethodPool::for_tier(Tier::Heavy);
        assert_eq!(pool.attr.len(), AttrMethod::ALL.len());
        assert!(pool.contains(Method::Call(CallMethod::BuiltinsEvalCall)));
    }

    #[test]
    fn test_sanitize_refills_emptied_family() {
        let mut pool = MethodPool::for_tier(Tier::Safe);
        pool.remove(Method::Call(CallMethod::HelperWrap));
        pool.remove(Method::Call(CallMethod::LambdaWrap));
        pool.sanitize();
        assert_eq!(pool.call, vec![CallMethod::HelperWrap]);
    }
}
