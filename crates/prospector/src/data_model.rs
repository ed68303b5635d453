//! Data-model detection: does a file declare record-like types, and where?
//!
//! Each language has an ordered list of strategies. The first one that yields a
//! non-empty result wins; results are never merged.
//!
//! | language   | strategies                                   |
//! |------------|----------------------------------------------|
//! | Python     | structural signature, then the raw query     |
//! | TypeScript | raw query (interfaces, object type aliases)  |

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use common::{SourceLanguage, StructuralSignature};
use serde::Serialize;
use tracing::debug;
use tree_sitter::{QueryCursor, StreamingIterator};

use crate::cache::{EngineCache, QuerySource};
use crate::context::ParsedSource;
use crate::error::ConfigError;
use crate::templates::builtin;

/// Fully-qualified bases that make a class a data model.
const MODEL_BASES: &[&str] = &[
    "pydantic.BaseModel",
    "pydantic.main.BaseModel",
    "sqlmodel.SQLModel",
    "typing.TypedDict",
    "typing.NamedTuple",
    "typing_extensions.TypedDict",
    "typing_extensions.NamedTuple",
    "msgspec.Struct",
    "marshmallow.Schema",
];

/// Fully-qualified decorators that make a class a data model.
const MODEL_DECORATORS: &[&str] = &[
    "dataclasses.dataclass",
    "pydantic.dataclasses.dataclass",
    "attrs.define",
    "attrs.frozen",
    "attr.s",
    "attr.attrs",
    "attr.dataclass",
    "attr.define",
];

/// Model name to `(start_line, end_line)`.
///
/// Single-line spans are dropped on insertion.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct DataModelPositions(BTreeMap<String, (u32, u32)>);

impl DataModelPositions {
    pub fn insert(&mut self, name: impl Into<String>, start_line: u32, end_line: u32) {
        if start_line == end_line {
            return;
        }
        self.0
            .entry(name.into())
            .or_insert((start_line.min(end_line), start_line.max(end_line)));
    }

    pub fn get(&self, name: &str) -> Option<(u32, u32)> {
        self.0.get(name).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, (u32, u32))> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, u32, u32)> for DataModelPositions {
    fn from_iter<I: IntoIterator<Item = (String, u32, u32)>>(iter: I) -> Self {
        let mut positions = Self::default();
        for (name, start, end) in iter {
            positions.insert(name, start, end);
        }
        positions
    }
}

/// Outcome for one file. `found` reports whether any model was recognized, including
/// single-line ones that `positions` leaves out.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DataModelDetection {
    pub found: bool,
    pub positions: DataModelPositions,
}

/// One way of recognizing data models. `None` means "nothing here, try the next one".
pub trait DataModelStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn detect(
        &self,
        cache: &EngineCache,
        parsed: &ParsedSource<'_>,
        signature: &StructuralSignature,
    ) -> Result<Option<Vec<(String, u32, u32)>>, ConfigError>;
}

/// Python classes recognized from the structural outline and resolved imports.
pub struct SignatureStrategy;

impl SignatureStrategy {
    fn is_model_decorator(parsed: &ParsedSource<'_>, decorator: &str) -> bool {
        let bare = decorator.split('(').next().unwrap_or(decorator).trim();
        parsed
            .context
            .resolve_local(bare)
            .is_some_and(|path| MODEL_DECORATORS.contains(&path.as_str()))
    }

    fn is_model_base(parsed: &ParsedSource<'_>, base: &str) -> bool {
        // `TypedDict[...]`-style subscripts keep their head.
        let bare = base.split('[').next().unwrap_or(base).trim();
        parsed
            .context
            .resolve_local(bare)
            .is_some_and(|path| MODEL_BASES.contains(&path.as_str()))
    }
}

impl DataModelStrategy for SignatureStrategy {
    fn name(&self) -> &'static str {
        "signature"
    }

    fn detect(
        &self,
        _cache: &EngineCache,
        parsed: &ParsedSource<'_>,
        signature: &StructuralSignature,
    ) -> Result<Option<Vec<(String, u32, u32)>>, ConfigError> {
        let mut models: HashSet<&str> = HashSet::new();
        for class in &signature.classes {
            let decorated = class
                .decorators
                .iter()
                .any(|d| Self::is_model_decorator(parsed, d));
            let based = class.bases.iter().any(|b| Self::is_model_base(parsed, b));
            if decorated || based {
                models.insert(class.name.as_str());
            }
        }

        // Subclasses of in-file models, to a fixpoint.
        loop {
            let before = models.len();
            for class in &signature.classes {
                if !models.contains(class.name.as_str())
                    && class.bases.iter().any(|b| models.contains(b.as_str()))
                {
                    models.insert(class.name.as_str());
                }
            }
            if models.len() == before {
                break;
            }
        }

        if models.is_empty() {
            return Ok(None);
        }
        Ok(Some(
            signature
                .classes
                .iter()
                .filter(|c| models.contains(c.name.as_str()))
                .map(|c| (c.name.clone(), c.start_line, c.end_line))
                .collect(),
        ))
    }
}

/// A dedicated tree-sitter query capturing `@model` and `@model_name`.
pub struct QueryStrategy {
    language: SourceLanguage,
    source: QuerySource,
}

impl QueryStrategy {
    /// The embedded query for `language`, or `<queries_dir>/<family>/data_model.scm`
    /// when that file exists.
    pub fn new(language: SourceLanguage, queries_dir: Option<&Path>) -> Self {
        let builtin = match language.family() {
            "python" => builtin::PYTHON_DATA_MODEL,
            _ => builtin::TS_DATA_MODEL,
        };
        let source = match queries_dir {
            Some(dir) => {
                let path = dir.join(language.family()).join("data_model.scm");
                if path.is_file() {
                    QuerySource::file("data_model", path, false)
                } else {
                    QuerySource::embedded("data_model", builtin)
                }
            }
            None => QuerySource::embedded("data_model", builtin),
        };
        Self { language, source }
    }

    fn cache_key(&self) -> String {
        format!("{}:data_model", self.language)
    }
}

impl DataModelStrategy for QueryStrategy {
    fn name(&self) -> &'static str {
        "query"
    }

    fn detect(
        &self,
        cache: &EngineCache,
        parsed: &ParsedSource<'_>,
        _signature: &StructuralSignature,
    ) -> Result<Option<Vec<(String, u32, u32)>>, ConfigError> {
        let set = cache.get_compiled_queries(
            &self.cache_key(),
            self.language,
            std::slice::from_ref(&self.source),
        )?;
        let Some(query) = set.get("data_model") else {
            return Ok(None);
        };
        let model_idx = query.capture_index_for_name("model");
        let name_idx = query.capture_index_for_name("model_name");

        let mut found = Vec::new();
        let mut cursor = QueryCursor::new();
        let mut matches = cursor.matches(query, parsed.tree.root_node(), parsed.source);
        while let Some(m) = matches.next() {
            let model = m
                .captures
                .iter()
                .find(|c| Some(c.index) == model_idx)
                .map(|c| c.node);
            let name = m
                .captures
                .iter()
                .find(|c| Some(c.index) == name_idx)
                .and_then(|c| c.node.utf8_text(parsed.source).ok());
            if let (Some(model), Some(name)) = (model, name) {
                let span = (
                    (model.start_position().row + 1) as u32,
                    (model.end_position().row + 1) as u32,
                );
                if !found.iter().any(|(n, _, _): &(String, u32, u32)| n == name) {
                    found.push((name.to_string(), span.0, span.1));
                }
            }
        }
        Ok((!found.is_empty()).then_some(found))
    }
}

/// The strategies of one language, in search order.
pub struct DataModelDetector {
    strategies: Vec<Box<dyn DataModelStrategy>>,
}

impl DataModelDetector {
    pub fn for_language(language: SourceLanguage, queries_dir: Option<&Path>) -> Self {
        let mut strategies: Vec<Box<dyn DataModelStrategy>> = Vec::new();
        if language == SourceLanguage::Python {
            strategies.push(Box::new(SignatureStrategy));
        }
        strategies.push(Box::new(QueryStrategy::new(language, queries_dir)));
        Self { strategies }
    }

    pub fn detect(
        &self,
        cache: &EngineCache,
        parsed: &ParsedSource<'_>,
        signature: &StructuralSignature,
    ) -> Result<DataModelDetection, ConfigError> {
        for strategy in &self.strategies {
            if let Some(models) = strategy.detect(cache, parsed, signature)? {
                debug!(
                    strategy = strategy.name(),
                    count = models.len(),
                    "data models found"
                );
                return Ok(DataModelDetection {
                    found: true,
                    positions: models.into_iter().collect(),
                });
            }
        }
        Ok(DataModelDetection::default())
    }
}
