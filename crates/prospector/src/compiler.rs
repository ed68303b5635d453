//! # Query Compiler
//!
//! Turns a [`FeatureSpec`] into an executable tree-sitter query:
//!
//! 1. Select the template for `(concept, target_level)` ([`TemplateId::select`]).
//! 2. Pull the regex overrides for the compiler's language family from `construct_query`.
//! 3. Escape each regex for the query string grammar and render it as
//!    `(#match? @capture "<regex>")`. Absent regexes render to nothing.
//! 4. Substitute the fragments at the template's placeholders; a placeholder the compiler
//!    does not know is a configuration error. Compile the text.
//! 5. Cache the result under `language:template:template_hash:hash`. Both hashes are
//!    BLAKE3: one over the template text, one over the canonical JSON of the fields that
//!    shape the query. Identical specs under identical templates share one `Arc`.

use std::sync::Arc;

use common::{ConstructQuery, FeatureSpec, SourceLanguage};
use tracing::debug;
use tree_sitter::Query;

use crate::cache::EngineCache;
use crate::error::ConfigError;
use crate::templates::{TemplateId, TemplateSet};

/// Placeholder name, capture it constrains, and the `construct_query` field feeding it.
type PredicateSlot = (&'static str, &'static str, fn(&ConstructQuery) -> Option<&String>);

const PREDICATE_SLOTS: [PredicateSlot; 4] = [
    ("annotation_name_predicate", "annotation_name", annotation_name_regex),
    ("method_predicate", "method", method_regex),
    ("callee_predicate", "callee", callee_regex),
    ("superclass_predicate", "superclass", superclass_regex),
];

fn annotation_name_regex(cq: &ConstructQuery) -> Option<&String> {
    cq.annotation_name.as_ref()
}

fn method_regex(cq: &ConstructQuery) -> Option<&String> {
    cq.method.as_ref()
}

fn callee_regex(cq: &ConstructQuery) -> Option<&String> {
    cq.callee.as_ref()
}

fn superclass_regex(cq: &ConstructQuery) -> Option<&String> {
    cq.superclass.as_ref()
}

const METHOD_PLACEHOLDER: &str = "{{method_predicate}}";

/// A feature query ready to run.
#[derive(Debug)]
pub struct CompiledQuery {
    pub template: TemplateId,
    pub language: SourceLanguage,
    pub cache_key: String,
    /// Rendered query text, predicates included.
    pub text: String,
    pub query: Query,
    /// `#match?` passes when its capture is absent from a match, so a configured method
    /// regex must additionally require the `@method` capture to be present.
    pub requires_method: bool,
}

impl CompiledQuery {
    pub fn capture_index(&self, name: &str) -> Option<u32> {
        self.query.capture_index_for_name(name)
    }
}

/// Escapes `regex` for a tree-sitter query string literal.
///
/// Backslashes are doubled first, then double quotes are escaped; control characters
/// that would otherwise end or corrupt the literal are written as `\n`, `\r`, `\t`.
pub fn escape_regex_literal(regex: &str) -> String {
    let mut out = String::with_capacity(regex.len() + 8);
    for ch in regex.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            _ => out.push(ch),
        }
    }
    out
}

/// Renders a `#match?` predicate over `capture`.
pub fn render_predicate(capture: &str, regex: &str) -> String {
    format!("(#match? @{capture} \"{}\")", escape_regex_literal(regex))
}

/// Substitutes the predicate placeholders of `template_text`.
///
/// Placeholders are read from the template only, in one pass, so `{{` inside an injected
/// regex is never taken for a placeholder.
///
/// # Errors
/// `UnresolvedPlaceholder` if the template names a placeholder the compiler does not
/// fill, or leaves a `{{` unterminated.
pub fn render_template(
    template: TemplateId,
    template_text: &str,
    overrides: Option<&ConstructQuery>,
) -> Result<String, ConfigError> {
    let unresolved = |placeholder: &str| ConfigError::UnresolvedPlaceholder {
        template: template.name().to_string(),
        placeholder: placeholder.trim().to_string(),
    };

    let mut text = String::with_capacity(template_text.len() + 64);
    let mut rest = template_text;
    while let Some(start) = rest.find("{{") {
        text.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find("}}").ok_or_else(|| unresolved(after))?;
        let name = after[..end].trim();
        let (_, capture, field) = PREDICATE_SLOTS
            .iter()
            .find(|(slot, _, _)| *slot == name)
            .copied()
            .ok_or_else(|| unresolved(name))?;
        if let Some(regex) = overrides.and_then(field) {
            text.push_str(&render_predicate(capture, regex));
        }
        rest = &after[end + 2..];
    }
    text.push_str(rest);

    if let Some(cq) = overrides {
        for (slot, _, field) in PREDICATE_SLOTS {
            if field(cq).is_some() && !template_text.contains(&format!("{{{{{slot}}}}}")) {
                debug!(%template, slot, "regex has no placeholder in template, ignored");
            }
        }
    }
    Ok(text)
}

/// BLAKE3 hex digest of the canonical JSON of the query-shaping fields.
///
/// `description` and `startpoint` do not change the query and are left out. The JSON
/// object is a sorted map, so the digest does not depend on field order.
pub fn content_hash(spec: &FeatureSpec) -> String {
    let canonical = serde_json::json!({
        "feature_key": spec.feature_key,
        "library": spec.library,
        "absolute_paths": spec.absolute_paths,
        "target_level": spec.target_level,
        "concept": spec.concept,
        "locator_strategy": spec.locator_strategy,
        "construct_query": spec.construct_query,
    });
    blake3::hash(canonical.to_string().as_bytes())
        .to_hex()
        .to_string()
}

/// `language:template:template_hash:content_hash`.
///
/// `template_hash` is BLAKE3 over the template text, so engines with different
/// `queries_dir` templates can share one cache without reading each other's queries.
pub fn cache_key(
    language: SourceLanguage,
    template: TemplateId,
    template_text: &str,
    spec: &FeatureSpec,
) -> String {
    format!(
        "{}:{}:{}:{}",
        language.as_str(),
        template.name(),
        blake3::hash(template_text.as_bytes()).to_hex(),
        content_hash(spec)
    )
}

/// Compiles feature specs for one grammar, memoized in the shared [`EngineCache`].
pub struct QueryCompiler<'a> {
    cache: &'a EngineCache,
    templates: &'a TemplateSet,
    language: SourceLanguage,
}

impl<'a> QueryCompiler<'a> {
    pub fn new(cache: &'a EngineCache, templates: &'a TemplateSet, language: SourceLanguage) -> Self {
        Self {
            cache,
            templates,
            language,
        }
    }

    /// Returns the compiled query for `spec`, compiling it on first request.
    ///
    /// # Errors
    /// - `UnsupportedCombination` for shapes without a template.
    /// - `UnresolvedPlaceholder` if the template has placeholders the compiler does not fill.
    /// - `QueryCompile` for invalid query text or an invalid regex.
    pub fn build_query(&self, spec: &FeatureSpec) -> Result<Arc<CompiledQuery>, ConfigError> {
        let template = TemplateId::select(spec.concept, spec.target_level)?;
        let template_text = self.templates.get(template);
        let key = cache_key(self.language, template, template_text, spec);

        self.cache.get_feature_query(&key, || {
            let overrides = spec.construct_query_for(self.language.family());
            let text = render_template(template, template_text, overrides)?;

            let query = Query::new(&self.cache.get_grammar(self.language), &text).map_err(|e| {
                ConfigError::QueryCompile {
                    name: format!("{}/{}", spec.library, spec.feature_key),
                    reason: e.to_string(),
                }
            })?;

            let requires_method = template_text.contains(METHOD_PLACEHOLDER)
                && overrides.is_some_and(|cq| cq.method.is_some());

            Ok(CompiledQuery {
                template,
                language: self.language,
                cache_key: key.clone(),
                text,
                query,
                requires_method,
            })
        })
    }
}
