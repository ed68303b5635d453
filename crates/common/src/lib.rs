//! Shared vocabulary of the prospector workspace.
//!
//! - [`feature`]: the declarative feature catalog schema (`FeatureSpec` and its enums).
//! - [`detection`]: structured match records emitted by the feature detector.
//! - [`outline`]: per-file structural signatures (classes, functions, call sites).
//!
//! Everything here is a plain value object. Nothing in this crate parses source code.

pub mod detection;
pub mod feature;
pub mod outline;

pub use detection::{Detection, DetectionKind};
pub use feature::{CatalogFile, Concept, ConstructQuery, FeatureSpec, LocatorStrategy, TargetLevel};
pub use outline::{CallRef, ClassOutline, FunctionOutline, StructuralSignature};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Source languages understood by the engine.
///
/// `Tsx` shares catalogs, templates and import semantics with `TypeScript`
/// (see [`SourceLanguage::family`]) but is parsed with the TSX grammar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceLanguage {
    Python,
    TypeScript,
    Tsx,
}

impl SourceLanguage {
    pub const ALL: [SourceLanguage; 3] = [Self::Python, Self::TypeScript, Self::Tsx];

    /// Identifier used as the engine cache key for this language's grammar.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Python => "python",
            Self::TypeScript => "typescript",
            Self::Tsx => "tsx",
        }
    }

    /// Catalog / template family. `tsx` resolves to `typescript`.
    pub fn family(&self) -> &'static str {
        match self {
            Self::Python => "python",
            Self::TypeScript | Self::Tsx => "typescript",
        }
    }

    /// Parses a language name as written in configuration files.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "python" | "py" => Some(Self::Python),
            "typescript" | "ts" => Some(Self::TypeScript),
            "tsx" => Some(Self::Tsx),
            _ => None,
        }
    }

    /// Picks a language from a file extension. Returns `None` for unsupported files.
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension().and_then(|e| e.to_str())? {
            "py" | "pyi" => Some(Self::Python),
            "ts" | "mts" | "cts" => Some(Self::TypeScript),
            "tsx" => Some(Self::Tsx),
            _ => None,
        }
    }
}

impl fmt::Display for SourceLanguage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
