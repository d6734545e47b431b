//! The `obfumeta` artifact: everything needed to reverse an obfuscation run,
//! subject to the configured inclusion level. The reader accepts both the
//! legacy v1 layout and the current v2 layout and decodes them into one
//! canonical in-memory representation; unknown versions fail closed.

use std::collections::BTreeMap;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

use crate::ast::Module;
use crate::config::EffectiveConfig;
use crate::obfuscate::ObfuscationStats;
use crate::{Error, Result};

pub const FORMAT_V1: &str = "obfumeta-v1";
pub const FORMAT_V2: &str = "obfumeta-v2";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetaVersion {
    V1,
    V2,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelperHint {
    pub helper_name: String,
    pub mode: String,
    pub salt: u64,
    #[serde(default)]
    pub params: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetaConfigEcho {
    pub level: u8,
    pub profile: String,
    pub dynamic_level: String,
    pub passes: u32,
    pub order: Vec<String>,
    pub seed: u64,
}

impl MetaConfigEcho {
    pub fn from_config(config: &EffectiveConfig) -> Self {
        Self {
            level: config.level,
            profile: config.profile.name().to_string(),
            dynamic_level: config.dynamic_level.name().to_string(),
            passes: config.passes,
            order: config
                .transform_order
                .iter()
                .map(|p| p.name().to_string())
                .collect(),
            seed: config.seed,
        }
    }
}

/// Canonical in-memory metadata, independent of the wire version it came
/// from. Created at the end of obfuscation; consumed, never mutated, during
/// deobfuscation.
#[derive(Debug, Clone, PartialEq)]
pub struct ObfuMeta {
    pub version: MetaVersion,
    pub config: Option<MetaConfigEcho>,
    pub stats: Option<ObfuscationStats>,
    pub rename_map: Option<BTreeMap<String, String>>,
    pub helper_hints: Option<Vec<HelperHint>>,
    pub value_salt: Option<u64>,
    pub input_digest: Option<String>,
    pub output_digest: Option<String>,
    /// base64(zstd(source)), required by strict deobfuscation.
    pub source: Option<String>,
    pub warnings: Vec<String>,
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "format")]
enum MetaWire {
    #[serde(rename = "obfumeta-v1")]
    V1 {
        #[serde(default)]
        rename_map: Option<BTreeMap<String, String>>,
        #[serde(default)]
        original_source: Option<String>,
        #[serde(default)]
        output_digest: Option<String>,
        #[serde(default)]
        warnings: Vec<String>,
    },
    #[serde(rename = "obfumeta-v2")]
    V2 {
        #[serde(default)]
        config: Option<MetaConfigEcho>,
        #[serde(default)]
        stats: Option<ObfuscationStats>,
        #[serde(default)]
        rename_map: Option<BTreeMap<String, String>>,
        #[serde(default)]
        helper_hints: Option<Vec<HelperHint>>,
        #[serde(default)]
        value_salt: Option<u64>,
        #[serde(default)]
        input_digest: Option<String>,
        #[serde(default)]
        output_digest: Option<String>,
        #[serde(default)]
        original_source: Option<String>,
        #[serde(default)]
        warnings: Vec<String>,
    },
}

impl ObfuMeta {
    /// Serializes as the current (v2) wire format.
    pub fn to_json(&self) -> Result<String> {
        let wire = MetaWire::V2 {
            config: self.config.clone(),
            stats: self.stats.clone(),
            rename_map: self.rename_map.clone(),
            helper_hints: self.helper_hints.clone(),
            value_salt: self.value_salt,
            input_digest: self.input_digest.clone(),
            output_digest: self.output_digest.clone(),
            original_source: self.source.clone(),
            warnings: self.warnings.clone(),
        };
        Ok(serde_json::to_string_pretty(&wire)?)
    }

    /// Accepts v1 and v2; any other `format` value is a schema error.
    pub fn from_json(text: &str) -> Result<Self> {
        let wire: MetaWire = serde_json::from_str(text)
            .map_err(|err| Error::DeobfSchema(err.to_string()))?;
        Ok(match wire {
            MetaWire::V1 {
                rename_map,
                original_source,
                output_digest,
                warnings,
            } => Self {
                version: MetaVersion::V1,
                config: None,
                stats: None,
                rename_map,
                helper_hints: None,
                value_salt: None,
                input_digest: None,
                output_digest,
                source: original_source,
                warnings,
            },
            MetaWire::V2 {
                config,
                stats,
                rename_map,
                helper_hints,
                value_salt,
                input_digest,
                output_digest,
                original_source,
                warnings,
            } => Self {
                version: MetaVersion::V2,
                config,
                stats,
                rename_map,
                helper_hints,
                value_salt,
                input_digest,
                output_digest,
                source: original_source,
                warnings,
            },
        })
    }
}

/// md5 digest of a tree's canonical JSON serialization.
pub fn digest_module(module: &Module) -> Result<String> {
    let json = serde_json::to_string(module)?;
    Ok(format!("{:x}", md5::compute(json.as_bytes())))
}

pub fn encode_source_payload(source: &str) -> Result<String> {
    let compressed = zstd::encode_all(source.as_bytes(), 0).map_err(Error::Io)?;
    Ok(BASE64.encode(compressed))
}

pub fn decode_source_payload(payload: &str) -> Result<String> {
    let compressed = BASE64
        .decode(payload)
        .map_err(|err| Error::DeobfSchema(format!("bad source payload: {err}")))?;
    let bytes = zstd::decode_all(compressed.as_slice())
        .map_err(|err| Error::DeobfSchema(format!("bad source payload: {err}")))?;
    String::from_utf8(bytes)
        .map_err(|err| Error::DeobfSchema(format!("bad source payload: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_meta() -> ObfuMeta {
        ObfuMeta {
            version: MetaVersion::V2,
            config: None,
            stats: None,
            rename_map: Some(BTreeMap::from([("::main".to_string(), "_o0".to_string())])),
            helper_hints: Some(vec![HelperHint {
                helper_name: "_obf_str".into(),
                mode: "string_decode".into(),
                salt: 23,
                params: vec![],
            }]),
            value_salt: Some(23),
            input_digest: None,
            output_digest: None,
            source: None,
            warnings: vec![],
        }
    }

    #[test]
    fn test_v2_round_trip() {
        let meta = sample_meta();
        let json = meta.to_json().unwrap();
        assert!(json.contains(FORMAT_V2));
        let back = ObfuMeta::from_json(&json).unwrap();
        assert_eq!(meta, back);
    }

    #[test]
    fn test_reader_accepts_v1() {
        let json = r#"{
            "format": "obfumeta-v1",
            "rename_map": {"main": "_o0"}
        }"#;
        let meta = ObfuMeta::from_json(json).unwrap();
        assert_eq!(meta.version, MetaVersion::V1);
        assert!(meta.helper_hints.is_none());
        assert_eq!(
            meta.rename_map.unwrap().get("main"),
            Some(&"_o0".to_string())
        );
    }

    #[test]
    fn test_unknown_version_fails_closed() {
        let json = r#"{"format": "obfumeta-v9"}"#;
        let result = ObfuMeta::from_json(json);
        assert!(matches!(result, Err(Error::DeobfSchema(_))));
    }

    #[test]
    fn test_source_payload_round_trip() {
        let source = "def main():\n    return 42\n";
        let payload = encode_source_payload(source).unwrap();
        assert_ne!(payload, source);
        assert_eq!(decode_source_payload(&payload).unwrap(), source);
    }
}
