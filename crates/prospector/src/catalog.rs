//! Feature catalogs: which library constructs to look for, per language family.
//!
//! A catalog directory holds one JSON file per library (see [`common::CatalogFile`]),
//! nested however the user likes. Loading never aborts on a bad file: malformed files and
//! invalid entries are logged, reported in [`CatalogLoad::rejected`] and skipped.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use common::{CatalogFile, FeatureSpec, SourceLanguage};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::ConfigError;

const BUILTIN: &[(&str, &str)] = &[
    (
        "python/fastapi.json",
        include_str!("../defaults/catalog/python/fastapi.json"),
    ),
    (
        "python/celery.json",
        include_str!("../defaults/catalog/python/celery.json"),
    ),
    (
        "python/sqlalchemy.json",
        include_str!("../defaults/catalog/python/sqlalchemy.json"),
    ),
    (
        "python/flask_sqlalchemy.json",
        include_str!("../defaults/catalog/python/flask_sqlalchemy.json"),
    ),
    (
        "python/pytest.json",
        include_str!("../defaults/catalog/python/pytest.json"),
    ),
    (
        "typescript/nestjs.json",
        include_str!("../defaults/catalog/typescript/nestjs.json"),
    ),
    (
        "typescript/express.json",
        include_str!("../defaults/catalog/typescript/express.json"),
    ),
    (
        "typescript/prisma.json",
        include_str!("../defaults/catalog/typescript/prisma.json"),
    ),
];

/// Features grouped by language family.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    by_family: BTreeMap<String, Vec<FeatureSpec>>,
}

/// Result of loading catalog files.
#[derive(Debug, Default)]
pub struct CatalogLoad {
    pub catalog: Catalog,
    /// Files or entries that were skipped, with the reason.
    pub rejected: Vec<ConfigError>,
}

impl Catalog {
    /// The catalog shipped with the engine.
    pub fn builtin() -> CatalogLoad {
        let mut load = CatalogLoad::default();
        for (name, text) in BUILTIN {
            load.add_text(Path::new(name), text);
        }
        load
    }

    /// Loads every `*.json` file under `dir`, recursively, in path order.
    ///
    /// # Errors
    /// Only if `dir` itself cannot be read.
    pub fn load_dir(dir: &Path) -> Result<CatalogLoad, ConfigError> {
        if !dir.is_dir() {
            return Err(ConfigError::MalformedCatalog {
                path: dir.to_path_buf(),
                reason: "not a directory".into(),
            });
        }
        let mut load = CatalogLoad::default();
        for entry in WalkDir::new(dir)
            .sort_by_file_name()
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "json"))
        {
            load.add_file(entry.path());
        }
        Ok(load)
    }

    /// Adds all features of `other`, subject to the same uniqueness rule.
    pub fn merge(&mut self, other: CatalogLoad) -> Vec<ConfigError> {
        let mut rejected = other.rejected;
        for (family, features) in other.catalog.by_family {
            for spec in features {
                if let Err(e) = self.insert(&family, spec) {
                    warn!(error = %e, "catalog entry rejected");
                    rejected.push(e);
                }
            }
        }
        rejected
    }

    /// Features applicable to `language`.
    pub fn features(&self, language: SourceLanguage) -> &[FeatureSpec] {
        self.by_family
            .get(language.family())
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.by_family.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert(&mut self, family: &str, spec: FeatureSpec) -> Result<(), ConfigError> {
        let features = self.by_family.entry(family.to_string()).or_default();
        if features
            .iter()
            .any(|f| f.library == spec.library && f.feature_key == spec.feature_key)
        {
            return Err(ConfigError::InvalidCatalogEntry {
                library: spec.library,
                feature_key: spec.feature_key,
                reason: format!("duplicate feature in language '{family}'"),
            });
        }
        features.push(spec);
        Ok(())
    }
}

impl CatalogLoad {
    fn add_file(&mut self, path: &Path) {
        match std::fs::read_to_string(path) {
            Ok(text) => self.add_text(path, &text),
            Err(e) => self.reject(ConfigError::MalformedCatalog {
                path: path.to_path_buf(),
                reason: e.to_string(),
            }),
        }
    }

    fn add_text(&mut self, path: &Path, text: &str) {
        let file: CatalogFile = match serde_json::from_str(text) {
            Ok(file) => file,
            Err(e) => {
                return self.reject(ConfigError::MalformedCatalog {
                    path: PathBuf::from(path),
                    reason: e.to_string(),
                })
            }
        };
        let Some(language) = SourceLanguage::from_name(&file.language) else {
            return self.reject(ConfigError::MalformedCatalog {
                path: PathBuf::from(path),
                reason: format!("unsupported language '{}'", file.language),
            });
        };
        let family = language.family();

        let mut keys = HashSet::new();
        for spec in file.into_features() {
            if let Err(e) = spec.validate() {
                self.reject(ConfigError::InvalidCatalogEntry {
                    library: spec.library.clone(),
                    feature_key: spec.feature_key.clone(),
                    reason: e.to_string(),
                });
                continue;
            }
            if !keys.insert((spec.library.clone(), spec.feature_key.clone())) {
                self.reject(ConfigError::InvalidCatalogEntry {
                    library: spec.library.clone(),
                    feature_key: spec.feature_key.clone(),
                    reason: format!("duplicate feature in {}", path.display()),
                });
                continue;
            }
            if let Err(e) = self.catalog.insert(family, spec) {
                self.reject(e);
            }
        }
        debug!(path = %path.display(), family, "catalog file loaded");
    }

    fn reject(&mut self, error: ConfigError) {
        warn!(error = %error, "catalog entry rejected");
        self.rejected.push(error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_catalog_is_clean() {
        let load = Catalog::builtin();
        assert!(load.rejected.is_empty(), "{:?}", load.rejected);
        let python = load.catalog.features(SourceLanguage::Python);
        assert!(python
            .iter()
            .any(|f| f.library == "fastapi" && f.feature_key == "http_endpoint" && f.startpoint));
        // TSX shares the TypeScript catalog.
        assert_eq!(
            load.catalog.features(SourceLanguage::Tsx).len(),
            load.catalog.features(SourceLanguage::TypeScript).len()
        );
    }

    #[test]
    fn test_load_dir_skips_bad_files() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("python").join("web");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(
            nested.join("flask.json"),
            r#"{
                "language": "python",
                "library": "flask",
                "features": [
                    {"feature_key": "route", "absolute_paths": ["flask.Flask"],
                     "target_level": "function", "concept": "annotation",
                     "locator_strategy": "variable_bound"},
                    {"feature_key": "empty", "absolute_paths": [],
                     "target_level": "function", "concept": "call"},
                    {"feature_key": "route", "absolute_paths": ["flask.Blueprint"],
                     "target_level": "function", "concept": "annotation"}
                ]
            }"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("broken.json"), "{ not json").unwrap();
        std::fs::write(
            dir.path().join("cobol.json"),
            r#"{"language": "cobol", "library": "x", "features": []}"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let load = Catalog::load_dir(dir.path()).unwrap();
        let python = load.catalog.features(SourceLanguage::Python);
        assert_eq!(python.len(), 1);
        assert_eq!(python[0].library, "flask");
        assert_eq!(load.rejected.len(), 4);
        assert!(load
            .rejected
            .iter()
            .any(|e| matches!(e, ConfigError::MalformedCatalog { .. })));
    }

    #[test]
    fn test_merge_rejects_duplicates_across_sources() {
        let mut catalog = Catalog::builtin().catalog;
        let before = catalog.len();

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("fastapi.json"),
            r#"{"language": "python", "library": "fastapi", "features": [
                {"feature_key": "http_endpoint", "absolute_paths": ["fastapi.FastAPI"],
                 "target_level": "function", "concept": "annotation"},
                {"feature_key": "background", "absolute_paths": ["fastapi.BackgroundTasks"],
                 "target_level": "function", "concept": "call"}
            ]}"#,
        )
        .unwrap();
        let rejected = catalog.merge(Catalog::load_dir(dir.path()).unwrap());
        assert_eq!(rejected.len(), 1);
        assert_eq!(catalog.len(), before + 1);
    }

    #[test]
    fn test_load_dir_requires_directory() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Catalog::load_dir(&dir.path().join("missing")).is_err());
    }
}
