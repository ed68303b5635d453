//! # Engine Cache: the CST front-end
//!
//! Process-lifetime, append-only memoization of everything tree-sitter makes expensive:
//!
//! - **Grammars** keyed by language.
//! - **Parsers**: `tree_sitter::Parser` is `Send` but not `Sync`, so parsers live in a
//!   per-language pool and are leased out one per worker. Dropping the lease returns the
//!   parser to the pool.
//! - **Query sets** (outline, data-model queries) keyed by a caller-chosen string. A key is
//!   bound to the exact source configuration it was first compiled from; asking for the
//!   same key with different sources is a [`ConfigError::CacheKeyConflict`].
//! - **Feature queries** keyed by `language:template:content-hash` (see `compiler`).
//!
//! Every map uses compute-if-absent under the shard lock, so two threads racing on the
//! same key compile once and share one `Arc`.

use std::ops::{Deref, DerefMut};
use std::path::PathBuf;
use std::sync::Arc;

use common::SourceLanguage;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;
use tree_sitter::{Language, Parser, Query, Tree};

use crate::compiler::CompiledQuery;
use crate::error::{ConfigError, EngineError, IN_MEMORY};

/// Where the text of a query comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryOrigin {
    /// Shipped inside the binary.
    Embedded(&'static str),
    /// Read from disk on first compilation.
    File(PathBuf),
}

/// One named query within a query set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuerySource {
    pub name: String,
    pub origin: QueryOrigin,
    /// An optional source whose file is absent is skipped silently.
    pub optional: bool,
}

impl QuerySource {
    pub fn embedded(name: &str, text: &'static str) -> Self {
        Self {
            name: name.to_string(),
            origin: QueryOrigin::Embedded(text),
            optional: false,
        }
    }

    pub fn file(name: &str, path: impl Into<PathBuf>, optional: bool) -> Self {
        Self {
            name: name.to_string(),
            origin: QueryOrigin::File(path.into()),
            optional,
        }
    }
}

/// Compiled queries of one set, in source order.
#[derive(Debug, Default)]
pub struct QuerySet {
    queries: Vec<(String, Query)>,
}

impl QuerySet {
    pub fn get(&self, name: &str) -> Option<&Query> {
        self.queries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, q)| q)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.queries.iter().map(|(n, _)| n.as_str())
    }

    pub fn len(&self) -> usize {
        self.queries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }
}

struct CachedQuerySet {
    language: SourceLanguage,
    sources: Vec<QuerySource>,
    set: Arc<QuerySet>,
}

/// Shared engine cache. Construct once and pass around as `Arc<EngineCache>`.
#[derive(Default)]
pub struct EngineCache {
    grammars: DashMap<SourceLanguage, Language>,
    parsers: DashMap<SourceLanguage, Arc<Mutex<Vec<Parser>>>>,
    query_sets: DashMap<String, CachedQuerySet>,
    feature_queries: DashMap<String, Arc<CompiledQuery>>,
}

impl EngineCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the grammar for `language`, loading it on first use.
    pub fn get_grammar(&self, language: SourceLanguage) -> Language {
        self.grammars
            .entry(language)
            .or_insert_with(|| {
                debug!(language = %language, "loading grammar");
                grammar_for(language)
            })
            .clone()
    }

    /// Leases a parser configured for `language`.
    ///
    /// # Errors
    /// `ConfigError::GrammarLoad` if the grammar's ABI is not supported by the linked
    /// tree-sitter runtime.
    pub fn get_parser(&self, language: SourceLanguage) -> Result<ParserLease, ConfigError> {
        let pool = Arc::clone(&self.parsers.entry(language).or_default());

        let pooled = pool.lock().pop();
        let parser = match pooled {
            Some(parser) => parser,
            None => {
                debug!(language = %language, "creating parser");
                let mut parser = Parser::new();
                parser
                    .set_language(&self.get_grammar(language))
                    .map_err(|e| ConfigError::GrammarLoad {
                        language: language.to_string(),
                        reason: e.to_string(),
                    })?;
                parser
            }
        };

        Ok(ParserLease {
            parser: Some(parser),
            pool,
        })
    }

    /// Parses `source` with a leased parser.
    ///
    /// # Errors
    /// - `EngineError::Config` if no parser can be built for the language.
    /// - `EngineError::Parse` if tree-sitter returns no tree.
    pub fn parse(&self, language: SourceLanguage, source: &[u8]) -> Result<Tree, EngineError> {
        let mut parser = self.get_parser(language)?;
        // A previous lease may have been interrupted mid-parse.
        parser.reset();
        parser
            .parse(source, None)
            .ok_or_else(|| EngineError::parse(IN_MEMORY, "tree-sitter returned no tree"))
    }

    /// Compiles (once) and returns the query set registered under `key`.
    ///
    /// Sources are compiled against `language`'s grammar in order. A `File` source that
    /// is missing is skipped when `optional`, and is a `MissingQueryFile` error otherwise.
    ///
    /// # Errors
    /// - `CacheKeyConflict` if `key` was first compiled from different sources or for a
    ///   different language.
    /// - `MissingQueryFile` / `QueryCompile` from the first compilation.
    pub fn get_compiled_queries(
        &self,
        key: &str,
        language: SourceLanguage,
        sources: &[QuerySource],
    ) -> Result<Arc<QuerySet>, ConfigError> {
        let entry = self
            .query_sets
            .entry(key.to_string())
            .or_try_insert_with(|| {
                debug!(key, language = %language, count = sources.len(), "compiling query set");
                let set = compile_sources(&self.get_grammar(language), sources)?;
                Ok::<_, ConfigError>(CachedQuerySet {
                    language,
                    sources: sources.to_vec(),
                    set: Arc::new(set),
                })
            })?;

        if entry.language != language || entry.sources != sources {
            return Err(ConfigError::CacheKeyConflict(key.to_string()));
        }
        Ok(Arc::clone(&entry.set))
    }

    /// Returns the feature query cached under `key`, compiling it with `build` on a miss.
    pub fn get_feature_query<F>(&self, key: &str, build: F) -> Result<Arc<CompiledQuery>, ConfigError>
    where
        F: FnOnce() -> Result<CompiledQuery, ConfigError>,
    {
        let entry = self
            .feature_queries
            .entry(key.to_string())
            .or_try_insert_with(|| {
                debug!(key, "compiling feature query");
                build().map(Arc::new)
            })?;
        Ok(Arc::clone(&entry))
    }

    /// Number of distinct feature queries compiled so far.
    pub fn feature_query_count(&self) -> usize {
        self.feature_queries.len()
    }
}

fn grammar_for(language: SourceLanguage) -> Language {
    match language {
        SourceLanguage::Python => tree_sitter_python::LANGUAGE.into(),
        SourceLanguage::TypeScript => tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into(),
        SourceLanguage::Tsx => tree_sitter_typescript::LANGUAGE_TSX.into(),
    }
}

fn compile_sources(grammar: &Language, sources: &[QuerySource]) -> Result<QuerySet, ConfigError> {
    let mut queries = Vec::with_capacity(sources.len());
    for source in sources {
        let text = match &source.origin {
            QueryOrigin::Embedded(text) => (*text).to_string(),
            QueryOrigin::File(path) => match std::fs::read_to_string(path) {
                Ok(text) => text,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound && source.optional => {
                    debug!(name = %source.name, path = %path.display(), "optional query absent");
                    continue;
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(ConfigError::MissingQueryFile(path.clone()));
                }
                Err(e) => {
                    return Err(ConfigError::QueryCompile {
                        name: source.name.clone(),
                        reason: e.to_string(),
                    });
                }
            },
        };
        let query = Query::new(grammar, &text).map_err(|e| ConfigError::QueryCompile {
            name: source.name.clone(),
            reason: e.to_string(),
        })?;
        queries.push((source.name.clone(), query));
    }
    Ok(QuerySet { queries })
}

/// A parser borrowed from the cache's pool. Returned on drop.
pub struct ParserLease {
    parser: Option<Parser>,
    pool: Arc<Mutex<Vec<Parser>>>,
}

impl Deref for ParserLease {
    type Target = Parser;

    fn deref(&self) -> &Parser {
        self.parser.as_ref().expect("parser is present until the lease drops")
    }
}

impl DerefMut for ParserLease {
    fn deref_mut(&mut self) -> &mut Parser {
        self.parser.as_mut().expect("parser is present until the lease drops")
    }
}

impl Drop for ParserLease {
    fn drop(&mut self) {
        if let Some(parser) = self.parser.take() {
            self.pool.lock().push(parser);
        }
    }
}
