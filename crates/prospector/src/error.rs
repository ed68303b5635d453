use std::path::PathBuf;

/// Configuration problems. Fatal for the unit they belong to (a feature, a query set, a
/// language run), never for the whole process.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    /// A required query or template file is absent.
    #[error("Missing query file: {}", .0.display())]
    MissingQueryFile(PathBuf),

    /// No template exists for this `(concept, target_level)` pair.
    #[error("Unsupported combination: concept '{concept}' with target level '{target}'")]
    UnsupportedCombination { concept: String, target: String },

    /// A `{{placeholder}}` survived template rendering.
    #[error("Unresolved placeholder '{{{{{placeholder}}}}}' in template '{template}'")]
    UnresolvedPlaceholder { template: String, placeholder: String },

    /// Tree-sitter rejected the query text (bad node type, bad capture, invalid regex).
    #[error("Query '{name}' failed to compile: {reason}")]
    QueryCompile { name: String, reason: String },

    /// A catalog file is not valid JSON for the catalog schema.
    #[error("Malformed catalog {}: {reason}", .path.display())]
    MalformedCatalog { path: PathBuf, reason: String },

    /// A catalog entry violates a schema invariant.
    #[error("Invalid catalog entry '{library}/{feature_key}': {reason}")]
    InvalidCatalogEntry {
        library: String,
        feature_key: String,
        reason: String,
    },

    #[error("Unsupported language: {0}")]
    UnsupportedLanguage(String),

    /// The grammar could not be attached to a parser (ABI mismatch).
    #[error("Grammar for '{language}' failed to load: {reason}")]
    GrammarLoad { language: String, reason: String },

    /// The same cache key was requested with a different source configuration.
    #[error("Cache key '{0}' is already bound to a different query configuration")]
    CacheKeyConflict(String),

    #[error("Invalid glob '{pattern}': {reason}")]
    InvalidGlob { pattern: String, reason: String },

    #[error("Malformed package-manager rule table: {0}")]
    MalformedRuleTable(String),

    #[error("Malformed config {}: {reason}", .path.display())]
    MalformedConfig { path: PathBuf, reason: String },
}

/// Errors surfaced by the engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Binary content, non-UTF-8 text, or a parser refusal. Recoverable per file.
    #[error("Parse failure in {path}: {reason}")]
    Parse { path: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Label used for sources that do not come from a file.
pub(crate) const IN_MEMORY: &str = "<memory>";

impl EngineError {
    pub(crate) fn parse(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Parse {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Configuration errors stop the unit they belong to; everything else is per file.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Config(_))
    }

    /// Re-labels a parse failure with the file it happened in.
    pub(crate) fn at(self, file: &str) -> Self {
        match self {
            Self::Parse { path, reason } if path == IN_MEMORY => Self::Parse {
                path: file.to_string(),
                reason,
            },
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        let config: EngineError = ConfigError::UnsupportedLanguage("cobol".into()).into();
        assert!(config.is_fatal());
        assert!(!EngineError::parse("a.py", "binary content").is_fatal());
        let io: EngineError = std::io::Error::other("disk").into();
        assert!(!io.is_fatal());
    }

    #[test]
    fn test_placeholder_message_keeps_braces() {
        let err = ConfigError::UnresolvedPlaceholder {
            template: "call_expression".into(),
            placeholder: "receiver_predicate".into(),
        };
        assert_eq!(
            err.to_string(),
            "Unresolved placeholder '{{receiver_predicate}}' in template 'call_expression'"
        );
    }

    #[test]
    fn test_relabel_only_in_memory_failures() {
        let relabeled = EngineError::parse(IN_MEMORY, "parser refused").at("src/app.py");
        assert!(matches!(relabeled, EngineError::Parse { ref path, .. } if path == "src/app.py"));

        let kept = EngineError::parse("lib.py", "binary").at("other.py");
        assert!(matches!(kept, EngineError::Parse { ref path, .. } if path == "lib.py"));
    }
}
