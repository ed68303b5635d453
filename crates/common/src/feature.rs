//! Feature catalog schema.
//!
//! A catalog file groups the features of one library for one language:
//!
//! ```json
//! {
//!   "version": 1,
//!   "language": "python",
//!   "library": "fastapi",
//!   "features": [
//!     {
//!       "feature_key": "http_endpoint",
//!       "absolute_paths": ["fastapi.APIRouter", "fastapi.FastAPI"],
//!       "target_level": "function",
//!       "concept": "annotation",
//!       "locator_strategy": "variable_bound",
//!       "construct_query": { "python": { "annotation_name": "^(get|post|put|delete)$" } },
//!       "startpoint": true
//!     }
//!   ]
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Granularity a feature attaches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetLevel {
    Function,
    Class,
}

/// Syntactic shape through which a feature is used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Concept {
    /// Decorators (`@router.get(...)`, `@dataclass`).
    #[serde(alias = "annotation-like", alias = "decorator")]
    Annotation,
    /// Call expressions (`app.add_middleware(...)`, `create_engine(...)`).
    #[serde(alias = "call-expression", alias = "call_expression")]
    Call,
    /// Base classes (`class User(Base)`).
    Inheritance,
}

/// How a feature's usage is located relative to the imported symbol.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum LocatorStrategy {
    /// Through a module variable bound to the imported symbol (`router = APIRouter()`).
    #[serde(alias = "variable-bound")]
    VariableBound,
    /// Through the imported symbol itself, or a member of it.
    #[default]
    Direct,
}

/// Language-specific regex overrides narrowing a feature's structural match.
///
/// An absent field means "any": the rendered query matches on shape alone.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConstructQuery {
    /// Attribute accessed on the receiver (`get` in `router.get(...)`).
    #[serde(default, alias = "attribute", skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// Last identifier of a decorator expression.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotation_name: Option<String>,
    /// Full text of a call's function expression.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callee: Option<String>,
    /// Full text of a base class expression.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub superclass: Option<String>,
}

impl ConstructQuery {
    pub fn is_empty(&self) -> bool {
        self.method.is_none()
            && self.annotation_name.is_none()
            && self.callee.is_none()
            && self.superclass.is_none()
    }
}

/// One catalog entry.
///
/// `(library, feature_key)` identifies a feature within a language.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSpec {
    pub feature_key: String,
    /// Filled from the enclosing [`CatalogFile`] when omitted on the entry.
    #[serde(default)]
    pub library: String,
    pub absolute_paths: Vec<String>,
    pub target_level: TargetLevel,
    pub concept: Concept,
    #[serde(default)]
    pub locator_strategy: LocatorStrategy,
    /// Keyed by language family (`"python"`, `"typescript"`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub construct_query: Option<BTreeMap<String, ConstructQuery>>,
    #[serde(default)]
    pub description: String,
    /// Marks entry-point features such as HTTP handlers.
    #[serde(default)]
    pub startpoint: bool,
}

/// Reasons a catalog entry is rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FeatureSpecError {
    #[error("feature key is empty")]
    EmptyKey,
    #[error("feature '{0}' has no library")]
    EmptyLibrary(String),
    #[error("feature '{0}' declares no absolute paths")]
    NoAbsolutePaths(String),
    #[error("feature '{0}' declares an empty absolute path")]
    EmptyAbsolutePath(String),
}

impl FeatureSpec {
    /// Regex overrides for a language family, if any were configured.
    pub fn construct_query_for(&self, family: &str) -> Option<&ConstructQuery> {
        self.construct_query
            .as_ref()
            .and_then(|by_language| by_language.get(family))
    }

    /// Checks the structural invariants of a catalog entry.
    pub fn validate(&self) -> Result<(), FeatureSpecError> {
        if self.feature_key.trim().is_empty() {
            return Err(FeatureSpecError::EmptyKey);
        }
        if self.library.trim().is_empty() {
            return Err(FeatureSpecError::EmptyLibrary(self.feature_key.clone()));
        }
        if self.absolute_paths.is_empty() {
            return Err(FeatureSpecError::NoAbsolutePaths(self.feature_key.clone()));
        }
        if self.absolute_paths.iter().any(|p| p.trim().is_empty()) {
            return Err(FeatureSpecError::EmptyAbsolutePath(
                self.feature_key.clone(),
            ));
        }
        Ok(())
    }
}

fn default_version() -> u32 {
    1
}

/// On-disk catalog file: the features of one library for one language.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogFile {
    #[serde(default = "default_version")]
    pub version: u32,
    pub language: String,
    pub library: String,
    #[serde(default)]
    pub features: Vec<FeatureSpec>,
}

impl CatalogFile {
    /// Consumes the file, stamping the file-level library onto entries that omit it.
    pub fn into_features(self) -> Vec<FeatureSpec> {
        let library = self.library;
        self.features
            .into_iter()
            .map(|mut spec| {
                if spec.library.is_empty() {
                    spec.library = library.clone();
                }
                spec
            })
            .collect()
    }
}
