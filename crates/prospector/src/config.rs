//! Engine configuration (`prospector.toml`).
//!
//! ```toml
//! queries_dir = "queries"                     # replaces the built-in templates
//! catalog_dir = "catalog"                     # extra feature catalogs
//! package_manager_rules = "managers.toml"     # replaces the built-in rule table
//! include_builtin_catalog = true
//! concurrency = 8
//! ```
//!
//! Every field is optional. Relative paths are resolved against the config file's
//! directory.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const CONFIG_ENV: &str = "PROSPECTOR_CONFIG";
pub const CONFIG_FILE: &str = "prospector.toml";

fn default_concurrency() -> usize {
    num_cpus::get()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    #[serde(default)]
    pub queries_dir: Option<PathBuf>,
    #[serde(default)]
    pub catalog_dir: Option<PathBuf>,
    #[serde(default)]
    pub package_manager_rules: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub include_builtin_catalog: bool,
    /// Worker threads for multi-file analysis.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            queries_dir: None,
            catalog_dir: None,
            package_manager_rules: None,
            include_builtin_catalog: true,
            concurrency: default_concurrency(),
        }
    }
}

impl EngineConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let malformed = |reason: String| ConfigError::MalformedConfig {
            path: path.to_path_buf(),
            reason,
        };
        let text = std::fs::read_to_string(path).map_err(|e| malformed(e.to_string()))?;
        let mut config: Self = toml::from_str(&text).map_err(|e| malformed(e.to_string()))?;
        if config.concurrency == 0 {
            return Err(malformed("concurrency must be at least 1".into()));
        }

        let base = path.parent().unwrap_or_else(|| Path::new("."));
        for dir in [
            &mut config.queries_dir,
            &mut config.catalog_dir,
            &mut config.package_manager_rules,
        ]
        .into_iter()
        .flatten()
        {
            if dir.is_relative() {
                *dir = base.join(&*dir);
            }
        }
        Ok(config)
    }

    /// Explicit path, then `$PROSPECTOR_CONFIG`, then `./prospector.toml`, then defaults.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return Self::load(Path::new(&path));
        }
        let local = Path::new(CONFIG_FILE);
        if local.is_file() {
            return Self::load(local);
        }
        Ok(Self::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert!(config.include_builtin_catalog);
        assert!(config.concurrency >= 1);
        assert_eq!(config.queries_dir, None);
    }

    #[test]
    fn test_relative_paths_follow_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(
            &path,
            "queries_dir = \"q\"\ncatalog_dir = \"/abs/catalog\"\nconcurrency = 2\n",
        )
        .unwrap();
        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.queries_dir, Some(dir.path().join("q")));
        assert_eq!(config.catalog_dir, Some(PathBuf::from("/abs/catalog")));
        assert_eq!(config.concurrency, 2);
    }

    #[test]
    fn test_rejects_bad_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);

        std::fs::write(&path, "concurrency = 0\n").unwrap();
        assert!(matches!(
            EngineConfig::load(&path),
            Err(ConfigError::MalformedConfig { .. })
        ));

        std::fs::write(&path, "unknown_key = 1\n").unwrap();
        assert!(EngineConfig::load(&path).is_err());

        assert!(EngineConfig::resolve(Some(&dir.path().join("missing.toml"))).is_err());
    }
}
