//! Package-manager detection from a directory listing.
//!
//! Rules come from a TOML table keyed by language family (see
//! `defaults/package_managers.toml`). Managers are evaluated in table order and the first
//! manager with any matching signature wins. There is no scoring: reorder the table to
//! change precedence.

use std::collections::BTreeMap;
use std::path::Path;

use common::SourceLanguage;
use globset::{Glob, GlobMatcher};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::ConfigError;

const BUILTIN_RULES: &str = include_str!("../defaults/package_managers.toml");

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawSignature {
    File {
        file: String,
        #[serde(default)]
        contains: Option<String>,
        #[serde(default)]
        excludes: Option<String>,
    },
    Glob {
        glob: String,
    },
}

#[derive(Debug, Deserialize)]
struct RawRule {
    manager: String,
    signatures: Vec<RawSignature>,
}

/// One way of recognizing a manager.
#[derive(Debug, Clone)]
pub enum Signature {
    /// `file` is listed in the directory, and its text contains `contains` (when set) and
    /// does not contain `excludes` (when set).
    File {
        file: String,
        contains: Option<String>,
        excludes: Option<String>,
    },
    /// Any listed file name matches.
    Glob { pattern: String, matcher: GlobMatcher },
}

#[derive(Debug, Clone)]
pub struct PackageManagerRule {
    pub manager: String,
    pub signatures: Vec<Signature>,
}

/// Ordered rules per language family. Immutable once loaded.
#[derive(Debug, Clone, Default)]
pub struct RuleTable {
    by_family: BTreeMap<String, Vec<PackageManagerRule>>,
}

impl RuleTable {
    /// The table shipped with the engine.
    pub fn builtin() -> Result<Self, ConfigError> {
        Self::parse(BUILTIN_RULES)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::MalformedRuleTable(format!("{}: {e}", path.display())))?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let raw: BTreeMap<String, Vec<RawRule>> =
            toml::from_str(text).map_err(|e| ConfigError::MalformedRuleTable(e.to_string()))?;

        let mut by_family = BTreeMap::new();
        for (family, rules) in raw {
            let language = SourceLanguage::from_name(&family)
                .ok_or_else(|| ConfigError::UnsupportedLanguage(family.clone()))?;
            let compiled = rules
                .into_iter()
                .map(compile_rule)
                .collect::<Result<Vec<_>, _>>()?;
            by_family.insert(language.family().to_string(), compiled);
        }
        Ok(Self { by_family })
    }

    pub fn rules(&self, language: SourceLanguage) -> &[PackageManagerRule] {
        self.by_family
            .get(language.family())
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Detects the package manager of `directory` (relative to `repo_root`) from its file
    /// listing. File contents are read only for signatures that need them.
    ///
    /// `None` means auto-detection failed; the caller decides what to fall back to.
    pub fn detect_manager<S: AsRef<str>>(
        &self,
        language: SourceLanguage,
        directory: &Path,
        files: &[S],
        repo_root: &Path,
    ) -> Option<&str> {
        let base = repo_root.join(directory);
        let detected = self
            .rules(language)
            .iter()
            .find(|rule| {
                rule.signatures
                    .iter()
                    .any(|sig| signature_matches(sig, files, &base))
            })
            .map(|rule| rule.manager.as_str());
        debug!(
            directory = %directory.display(),
            language = %language,
            manager = detected.unwrap_or("-"),
            "package manager detection"
        );
        detected
    }
}

fn compile_rule(raw: RawRule) -> Result<PackageManagerRule, ConfigError> {
    let signatures = raw
        .signatures
        .into_iter()
        .map(|sig| match sig {
            RawSignature::File {
                file,
                contains,
                excludes,
            } => Ok(Signature::File {
                file,
                contains,
                excludes,
            }),
            RawSignature::Glob { glob } => {
                let matcher = Glob::new(&glob)
                    .map_err(|e| ConfigError::InvalidGlob {
                        pattern: glob.clone(),
                        reason: e.to_string(),
                    })?
                    .compile_matcher();
                Ok(Signature::Glob {
                    pattern: glob,
                    matcher,
                })
            }
        })
        .collect::<Result<Vec<_>, ConfigError>>()?;
    Ok(PackageManagerRule {
        manager: raw.manager,
        signatures,
    })
}

fn signature_matches<S: AsRef<str>>(signature: &Signature, files: &[S], base: &Path) -> bool {
    match signature {
        Signature::Glob { matcher, .. } => files.iter().any(|f| matcher.is_match(f.as_ref())),
        Signature::File {
            file,
            contains,
            excludes,
        } => {
            if !files.iter().any(|f| f.as_ref() == file) {
                return false;
            }
            if contains.is_none() && excludes.is_none() {
                return true;
            }
            let path = base.join(file);
            let text = match std::fs::read_to_string(&path) {
                Ok(text) => text,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "unreadable manifest");
                    return false;
                }
            };
            contains.as_ref().map_or(true, |needle| text.contains(needle.as_str()))
                && excludes.as_ref().map_or(true, |needle| !text.contains(needle.as_str()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detect<'t>(table: &'t RuleTable, language: SourceLanguage, files: &[&str]) -> Option<&'t str> {
        table.detect_manager(language, Path::new("."), files, Path::new("/nonexistent"))
    }

    #[test]
    fn test_first_matching_manager_wins() {
        let table = RuleTable::parse(
            r#"
            [[python]]
            manager = "A"
            signatures = [{ file = "shared.lock" }]

            [[python]]
            manager = "B"
            signatures = [{ file = "shared.lock" }, { glob = "*.b" }]
            "#,
        )
        .unwrap();
        assert_eq!(detect(&table, SourceLanguage::Python, &["shared.lock"]), Some("A"));
        assert_eq!(detect(&table, SourceLanguage::Python, &["x.b"]), Some("B"));
        assert_eq!(detect(&table, SourceLanguage::Python, &["README.md"]), None);
        assert_eq!(detect(&table, SourceLanguage::TypeScript, &["shared.lock"]), None);
    }

    #[test]
    fn test_builtin_lockfiles() {
        let table = RuleTable::builtin().unwrap();
        assert_eq!(
            detect(&table, SourceLanguage::Python, &["poetry.lock", "requirements.txt"]),
            Some("poetry")
        );
        assert_eq!(
            detect(&table, SourceLanguage::Python, &["requirements-dev.txt"]),
            Some("pip")
        );
        assert_eq!(
            detect(&table, SourceLanguage::TypeScript, &["package.json", "pnpm-lock.yaml"]),
            Some("pnpm")
        );
        assert_eq!(
            detect(&table, SourceLanguage::Tsx, &["package.json", "bun.lockb"]),
            Some("bun")
        );
        assert_eq!(detect(&table, SourceLanguage::TypeScript, &["package.json"]), Some("npm"));
    }

    #[test]
    fn test_content_predicates() {
        let root = tempfile::tempdir().unwrap();
        let pkg = root.path().join("svc");
        std::fs::create_dir_all(&pkg).unwrap();
        std::fs::write(
            pkg.join("pyproject.toml"),
            "[project]\nname = \"svc\"\n\n[tool.poetry]\nname = \"svc\"\n",
        )
        .unwrap();

        let table = RuleTable::builtin().unwrap();
        let files = ["pyproject.toml"];
        assert_eq!(
            table.detect_manager(SourceLanguage::Python, Path::new("svc"), &files, root.path()),
            Some("poetry")
        );

        std::fs::write(pkg.join("pyproject.toml"), "[project]\nname = \"svc\"\n").unwrap();
        assert_eq!(
            table.detect_manager(SourceLanguage::Python, Path::new("svc"), &files, root.path()),
            Some("pip")
        );
    }

    #[test]
    fn test_excluded_content_blocks_match() {
        let root = tempfile::tempdir().unwrap();
        let table = RuleTable::parse(
            r#"
            [[python]]
            manager = "pip"
            signatures = [{ file = "pyproject.toml", excludes = "[tool.poetry]" }]
            "#,
        )
        .unwrap();
        let files = ["pyproject.toml"];
        let manifest = root.path().join("pyproject.toml");

        std::fs::write(&manifest, "[project]\nname = \"svc\"\n\n[tool.poetry]\n").unwrap();
        assert_eq!(
            table.detect_manager(SourceLanguage::Python, Path::new("."), &files, root.path()),
            None
        );

        std::fs::write(&manifest, "[project]\nname = \"svc\"\n").unwrap();
        assert_eq!(
            table.detect_manager(SourceLanguage::Python, Path::new("."), &files, root.path()),
            Some("pip")
        );
    }

    #[test]
    fn test_unreadable_file_is_no_match() {
        let table = RuleTable::parse(
            r#"
            [[python]]
            manager = "poetry"
            signatures = [{ file = "pyproject.toml", contains = "[tool.poetry]" }]
            "#,
        )
        .unwrap();
        assert_eq!(detect(&table, SourceLanguage::Python, &["pyproject.toml"]), None);
    }

    #[test]
    fn test_invalid_tables() {
        assert!(matches!(
            RuleTable::parse("[[python]]\nmanager = \"x\"\nsignatures = [{ glob = \"a[\" }]\n"),
            Err(ConfigError::InvalidGlob { .. })
        ));
        assert!(matches!(
            RuleTable::parse("[[cobol]]\nmanager = \"x\"\nsignatures = []\n"),
            Err(ConfigError::UnsupportedLanguage(_))
        ));
        assert!(matches!(
            RuleTable::parse("python = 3"),
            Err(ConfigError::MalformedRuleTable(_))
        ));
    }
}
