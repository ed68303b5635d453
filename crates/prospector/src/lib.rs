//! # Prospector: structural feature detection
//!
//! Finds where a file uses the constructs of known libraries (FastAPI routes, Celery
//! tasks, NestJS controllers, ORM models) by running tree-sitter queries compiled from a
//! declarative feature catalog.
//!
//! - [`cache`]: grammars, pooled parsers and compiled queries, shared across files.
//! - [`templates`] / [`compiler`]: catalog entry → tree-sitter query with `#match?`
//!   predicates.
//! - [`context`]: imports, aliases and module bindings of one file.
//! - [`detector`]: catalog features → [`common::Detection`]s.
//! - [`data_model`]: record-like type declarations.
//! - [`outline`]: classes, functions and call sites.
//! - [`package_manager`]: package manager of a directory.
//! - [`pipeline`]: all of the above per file, in parallel.

pub mod cache;
pub mod catalog;
pub mod compiler;
pub mod config;
pub mod context;
pub mod data_model;
pub mod detector;
pub mod error;
pub mod outline;
pub mod package_manager;
pub mod pipeline;
pub mod templates;

pub use cache::EngineCache;
pub use catalog::{Catalog, CatalogLoad};
pub use compiler::{CompiledQuery, QueryCompiler};
pub use config::EngineConfig;
pub use context::{expand_import_paths, ImportAliasMap, ParsedSource, SourceContext};
pub use data_model::{DataModelDetection, DataModelPositions};
pub use detector::FeatureDetector;
pub use error::{ConfigError, EngineError};
pub use package_manager::RuleTable;
pub use pipeline::{Engine, FileFacts};
pub use templates::{TemplateId, TemplateSet};
