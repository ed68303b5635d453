//! # File pipeline
//!
//! Per file: parse → source context → outline → feature detection + data models →
//! call ordering. Files are independent; the only shared state is the engine cache.
//!
//! A failing file never aborts its siblings. Each file yields its own
//! `Result<FileFacts, EngineError>`; callers inspect [`EngineError::is_fatal`] to tell a
//! broken configuration (stop the language) from a broken file (skip it).

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use common::{Detection, SourceLanguage, StructuralSignature};
use memmap2::Mmap;
use oracle::{CallOrder, ScopeKind};
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cache::EngineCache;
use crate::catalog::Catalog;
use crate::config::EngineConfig;
use crate::context::{ImportAliasMap, ModuleBinding, ParsedSource};
use crate::data_model::{DataModelDetection, DataModelDetector};
use crate::detector::FeatureDetector;
use crate::error::{ConfigError, EngineError};
use crate::outline;
use crate::package_manager::RuleTable;
use crate::templates::TemplateSet;

/// Everything the engine learned about one file.
///
/// `signature` lists module functions and each class's methods in call order: callees
/// before callers, or source order when the calls form a cycle.
#[derive(Debug, Clone, Serialize)]
pub struct FileFacts {
    pub path: PathBuf,
    pub language: SourceLanguage,
    pub imports: Vec<String>,
    pub import_aliases: ImportAliasMap,
    pub bindings: Vec<ModuleBinding>,
    pub detections: Vec<Detection>,
    pub data_models: DataModelDetection,
    pub signature: StructuralSignature,
}

pub struct Engine {
    cache: Arc<EngineCache>,
    config: EngineConfig,
    /// Per family. A family whose templates failed to load stays disabled.
    templates: HashMap<&'static str, Result<TemplateSet, ConfigError>>,
    data_models: HashMap<SourceLanguage, DataModelDetector>,
    catalog: Catalog,
    rules: RuleTable,
}

impl Engine {
    /// Builds an engine from `config`.
    ///
    /// # Errors
    /// A malformed package-manager table or an unreadable catalog directory. Template
    /// problems only disable the affected language.
    pub fn new(config: EngineConfig) -> Result<Self, ConfigError> {
        Self::with_cache(config, Arc::new(EngineCache::new()))
    }

    pub fn with_cache(config: EngineConfig, cache: Arc<EngineCache>) -> Result<Self, ConfigError> {
        let mut templates = HashMap::new();
        for family in ["python", "typescript"] {
            let set = match &config.queries_dir {
                Some(dir) => TemplateSet::load(dir, family),
                None => TemplateSet::builtin(family),
            };
            if let Err(e) = &set {
                warn!(family, error = %e, "templates unavailable, language disabled");
            }
            templates.insert(family, set);
        }

        let data_models = SourceLanguage::ALL
            .into_iter()
            .map(|lang| {
                (
                    lang,
                    DataModelDetector::for_language(lang, config.queries_dir.as_deref()),
                )
            })
            .collect();

        let mut catalog = Catalog::default();
        if config.include_builtin_catalog {
            catalog.merge(Catalog::builtin());
        }
        if let Some(dir) = &config.catalog_dir {
            let rejected = catalog.merge(Catalog::load_dir(dir)?);
            if !rejected.is_empty() {
                warn!(count = rejected.len(), dir = %dir.display(), "catalog entries rejected");
            }
        }

        let rules = match &config.package_manager_rules {
            Some(path) => RuleTable::load(path)?,
            None => RuleTable::builtin()?,
        };

        info!(
            features = catalog.len(),
            concurrency = config.concurrency,
            "engine ready"
        );
        Ok(Self {
            cache,
            config,
            templates,
            data_models,
            catalog,
            rules,
        })
    }

    pub fn cache(&self) -> &Arc<EngineCache> {
        &self.cache
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn rules(&self) -> &RuleTable {
        &self.rules
    }

    /// Analyzes one in-memory file.
    ///
    /// # Errors
    /// - `Parse` for binary or non-UTF-8 content and parser refusals.
    /// - `Config` when the language's templates are unavailable.
    pub fn analyze_source(
        &self,
        path: &Path,
        language: SourceLanguage,
        source: &[u8],
    ) -> Result<FileFacts, EngineError> {
        let label = path.display().to_string();
        if source.contains(&0) {
            return Err(EngineError::parse(label, "binary content"));
        }
        if let Err(e) = std::str::from_utf8(source) {
            return Err(EngineError::parse(label, format!("not valid UTF-8: {e}")));
        }
        let templates = match self.templates.get(language.family()) {
            Some(Ok(set)) => set,
            Some(Err(e)) => return Err(e.clone().into()),
            None => {
                return Err(ConfigError::UnsupportedLanguage(language.to_string()).into())
            }
        };

        let parsed =
            ParsedSource::parse(&self.cache, language, source).map_err(|e| e.at(&label))?;
        let mut signature =
            outline::extract(&self.cache, language, &parsed.tree, parsed.source)?;

        let detections = FeatureDetector::new(&self.cache, templates)
            .detect(&parsed, self.catalog.features(language));

        let data_models = match self.data_models.get(&language) {
            Some(detector) => detector
                .detect(&self.cache, &parsed, &signature)
                .unwrap_or_else(|e| {
                    warn!(path = %label, error = %e, "data-model detection skipped");
                    DataModelDetection::default()
                }),
            None => DataModelDetection::default(),
        };

        order_signature(&mut signature);
        debug!(
            path = %label,
            detections = detections.len(),
            models = data_models.positions.len(),
            "file analyzed"
        );

        let ParsedSource { context, .. } = parsed;
        Ok(FileFacts {
            path: path.to_path_buf(),
            language,
            imports: context.imports,
            import_aliases: context.import_aliases,
            bindings: context.bindings,
            detections,
            data_models,
            signature,
        })
    }

    /// Reads and analyzes one file from disk. The language follows the file extension.
    pub fn analyze_file(&self, path: &Path) -> Result<FileFacts, EngineError> {
        let language = SourceLanguage::from_path(path).ok_or_else(|| {
            ConfigError::UnsupportedLanguage(path.display().to_string())
        })?;
        let file = File::open(path)?;
        if file.metadata()?.len() == 0 {
            return self.analyze_source(path, language, b"");
        }
        // SAFETY: mmap is read-only; the file handle outlives the mmap.
        let mmap = unsafe { Mmap::map(&file)? };
        self.analyze_source(path, language, &mmap)
    }

    /// Analyzes `paths` on a pool of `config.concurrency` threads.
    ///
    /// Results are returned in input order, one per path.
    pub fn analyze_files(
        &self,
        paths: &[PathBuf],
    ) -> Result<Vec<(PathBuf, Result<FileFacts, EngineError>)>, EngineError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.concurrency.max(1))
            .build()
            .map_err(|e| std::io::Error::other(e.to_string()))?;

        let results: Vec<_> = pool.install(|| {
            paths
                .par_iter()
                .map(|path| (path.clone(), self.analyze_file(path)))
                .collect()
        });

        let failed = results.iter().filter(|(_, r)| r.is_err()).count();
        info!(files = results.len(), failed, "analysis finished");
        Ok(results)
    }

    /// Package-manager detection with the engine's rule table.
    pub fn detect_manager<S: AsRef<str>>(
        &self,
        language: SourceLanguage,
        directory: &Path,
        files: &[S],
        repo_root: &Path,
    ) -> Option<&str> {
        self.rules
            .detect_manager(language, directory, files, repo_root)
    }
}

/// Sorts module functions and every class's methods into call order.
fn order_signature(signature: &mut StructuralSignature) {
    let functions = std::mem::take(&mut signature.functions);
    signature.functions = CallOrder::sort(functions, ScopeKind::Procedural);
    for class in &mut signature.classes {
        let methods = std::mem::take(&mut class.methods);
        class.methods = CallOrder::sort(methods, ScopeKind::Class);
    }
}
