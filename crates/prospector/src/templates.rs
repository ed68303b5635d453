//! Query templates: one file per `(concept, target_level)` shape and language family.
//!
//! Templates are tree-sitter queries with `{{...}}_predicate` placeholders where the
//! compiler splices feature-specific `#match?` predicates. The built-in set is embedded in
//! the binary; a configured `queries_dir` replaces it wholesale with
//! `<queries_dir>/<family>/<template>.scm`.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use common::{Concept, TargetLevel};
use tracing::debug;

use crate::error::ConfigError;

/// Closed set of query templates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TemplateId {
    AnnotationClass,
    AnnotationFunction,
    CallExpression,
    Inheritance,
}

impl TemplateId {
    pub const ALL: [TemplateId; 4] = [
        Self::AnnotationClass,
        Self::AnnotationFunction,
        Self::CallExpression,
        Self::Inheritance,
    ];

    /// Maps a feature's shape to its template.
    ///
    /// # Errors
    /// `UnsupportedCombination` for `inheritance` at function level.
    pub fn select(concept: Concept, target: TargetLevel) -> Result<Self, ConfigError> {
        match (concept, target) {
            (Concept::Annotation, TargetLevel::Class) => Ok(Self::AnnotationClass),
            (Concept::Annotation, TargetLevel::Function) => Ok(Self::AnnotationFunction),
            (Concept::Call, _) => Ok(Self::CallExpression),
            (Concept::Inheritance, TargetLevel::Class) => Ok(Self::Inheritance),
            (Concept::Inheritance, TargetLevel::Function) => {
                Err(ConfigError::UnsupportedCombination {
                    concept: "inheritance".into(),
                    target: "function".into(),
                })
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::AnnotationClass => "annotation_class",
            Self::AnnotationFunction => "annotation_function",
            Self::CallExpression => "call_expression",
            Self::Inheritance => "inheritance",
        }
    }

    pub fn file_name(&self) -> String {
        format!("{}.scm", self.name())
    }
}

impl fmt::Display for TemplateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Built-in query text, by family and name.
pub(crate) mod builtin {
    pub const PYTHON_ANNOTATION_CLASS: &str =
        include_str!("../queries/python/annotation_class.scm");
    pub const PYTHON_ANNOTATION_FUNCTION: &str =
        include_str!("../queries/python/annotation_function.scm");
    pub const PYTHON_CALL_EXPRESSION: &str = include_str!("../queries/python/call_expression.scm");
    pub const PYTHON_INHERITANCE: &str = include_str!("../queries/python/inheritance.scm");
    pub const PYTHON_DATA_MODEL: &str = include_str!("../queries/python/data_model.scm");
    pub const PYTHON_OUTLINE: &str = include_str!("../queries/python/outline.scm");

    pub const TS_ANNOTATION_CLASS: &str =
        include_str!("../queries/typescript/annotation_class.scm");
    pub const TS_ANNOTATION_FUNCTION: &str =
        include_str!("../queries/typescript/annotation_function.scm");
    pub const TS_CALL_EXPRESSION: &str = include_str!("../queries/typescript/call_expression.scm");
    pub const TS_INHERITANCE: &str = include_str!("../queries/typescript/inheritance.scm");
    pub const TS_DATA_MODEL: &str = include_str!("../queries/typescript/data_model.scm");
}

fn builtin_template(family: &str, id: TemplateId) -> Option<&'static str> {
    use builtin::*;
    let text = match (family, id) {
        ("python", TemplateId::AnnotationClass) => PYTHON_ANNOTATION_CLASS,
        ("python", TemplateId::AnnotationFunction) => PYTHON_ANNOTATION_FUNCTION,
        ("python", TemplateId::CallExpression) => PYTHON_CALL_EXPRESSION,
        ("python", TemplateId::Inheritance) => PYTHON_INHERITANCE,
        ("typescript", TemplateId::AnnotationClass) => TS_ANNOTATION_CLASS,
        ("typescript", TemplateId::AnnotationFunction) => TS_ANNOTATION_FUNCTION,
        ("typescript", TemplateId::CallExpression) => TS_CALL_EXPRESSION,
        ("typescript", TemplateId::Inheritance) => TS_INHERITANCE,
        _ => return None,
    };
    Some(text)
}

/// The four templates of one language family.
#[derive(Debug, Clone)]
pub struct TemplateSet {
    family: String,
    templates: HashMap<TemplateId, String>,
}

impl TemplateSet {
    /// The templates shipped with the engine.
    ///
    /// # Errors
    /// `UnsupportedLanguage` for a family without built-in templates.
    pub fn builtin(family: &str) -> Result<Self, ConfigError> {
        let mut templates = HashMap::with_capacity(TemplateId::ALL.len());
        for id in TemplateId::ALL {
            let text = builtin_template(family, id)
                .ok_or_else(|| ConfigError::UnsupportedLanguage(family.to_string()))?;
            templates.insert(id, text.to_string());
        }
        Ok(Self {
            family: family.to_string(),
            templates,
        })
    }

    /// Loads `<dir>/<family>/*.scm`. Every template is required.
    ///
    /// # Errors
    /// `MissingQueryFile` for the first absent template. The caller stops the family's
    /// run: a partial template set would silently drop whole feature classes.
    pub fn load(dir: &Path, family: &str) -> Result<Self, ConfigError> {
        let mut templates = HashMap::with_capacity(TemplateId::ALL.len());
        for id in TemplateId::ALL {
            let path = dir.join(family).join(id.file_name());
            let text = std::fs::read_to_string(&path)
                .map_err(|_| ConfigError::MissingQueryFile(path.clone()))?;
            debug!(path = %path.display(), "loaded template");
            templates.insert(id, text);
        }
        Ok(Self {
            family: family.to_string(),
            templates,
        })
    }

    pub fn family(&self) -> &str {
        &self.family
    }

    pub fn get(&self, id: TemplateId) -> &str {
        self.templates.get(&id).map(String::as_str).unwrap_or_default()
    }
}
