//! # py-obfuscate-rs
//!
//! A deterministic, seed-driven obfuscator for Python-like syntax trees,
//! with metadata-driven reconstruction. The crate consumes a tree produced
//! by an external parser (exchanged as JSON), rewrites it in place through a
//! configurable pass pipeline, and hands the result back for unparsing. An
//! optional `obfumeta` artifact makes the transformation partially (or, with
//! an embedded source payload, fully) reversible.
//!
//! ## Example
//!
//! ```rust
//! use py_obfuscate_rs::{ast, obfuscate, RawOptions};
//!
//! let module = ast::Module {
//!     body: vec![ast::Stmt::Assign {
//!         targets: vec![ast::Expr::store("x")],
//!         value: ast::Expr::str("hello"),
//!     }],
//! };
//! let config = RawOptions { seed: Some(7), ..RawOptions::default() }
//!     .resolve()
//!     .expect("config resolution failed");
//! let output = obfuscate(module, &config, None).expect("obfuscation failed");
//! assert!(output.stats.strings > 0 || output.stats.renamed > 0);
//! ```

pub mod ast;
pub mod config;
pub mod deobfuscate;
pub mod meta;
pub mod methods;
pub mod obfuscate;
pub mod rng;

pub use config::{EffectiveConfig, RawOptions};
pub use deobfuscate::{DeobfMode, DeobfOutcome, deobfuscate};
pub use meta::ObfuMeta;
pub use obfuscate::{ObfuscationOutput, ObfuscationStats, obfuscate};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid rate, mode, pass name or strategy token. Fatal before any
    /// tree mutation.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The seeded name generator exhausted its namespace.
    #[error("rename collision: {0}")]
    RenameCollision(String),

    /// A site's shape is not convertible by any eligible strategy. Recovered
    /// per site; never aborts a run.
    #[error("unsupported site shape: {0}")]
    UnsupportedSiteShape(String),

    /// Strict deobfuscation without an embedded source payload.
    #[error("metadata has no embedded source payload (required by strict mode)")]
    DeobfSourceMissing,

    /// Unknown or future metadata version, or a malformed artifact.
    #[error("unsupported metadata: {0}")]
    DeobfSchema(String),

    /// A worker in the parallel string-literal stage failed. The whole run
    /// aborts; no partial literal-stage output is applied.
    #[error("literal encoding worker failed: {0}")]
    LiteralWorker(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
