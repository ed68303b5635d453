//! # Feature Detector
//!
//! Runs catalog features against a parsed file.
//!
//! For each feature:
//! 1. **Eligibility**: at least one of its `absolute_paths` is among the file's imported
//!    paths or their dotted prefixes. Ineligible features cost nothing.
//! 2. **Compile** the feature query (cached across files). A configuration error skips the
//!    feature with a warning.
//! 3. **Locate**: every query match is checked against the feature's locator strategy.
//!    - `variable_bound`: the receiver (`router` in `@router.get`, `app` in
//!      `app.add_middleware`, `db` in `db.Model`) must be a module variable assigned from
//!      a local reference to the feature (`router = APIRouter()`).
//!    - `direct`: the decorator, callee or superclass must be a local reference to the
//!      feature or a member of one.
//! 4. **Emit** a [`Detection`], dropping any whose `(feature_key, start_line, end_line)`
//!    was already emitted. The earlier match wins.

use std::collections::HashSet;

use common::{
    Concept, Detection, DetectionKind, FeatureSpec, LocatorStrategy, SourceLanguage, TargetLevel,
};
use tracing::{debug, warn};
use tree_sitter::{Node, QueryCursor, QueryMatch, StreamingIterator};

use crate::cache::EngineCache;
use crate::compiler::{CompiledQuery, QueryCompiler};
use crate::context::ParsedSource;
use crate::templates::TemplateSet;

/// Capture indices of one compiled query. Absent captures are `None`.
struct Captures {
    target: Option<u32>,
    annotation: Option<u32>,
    annotation_name: Option<u32>,
    bound_object: Option<u32>,
    callee: Option<u32>,
    method: Option<u32>,
    call_args: Option<u32>,
    subclass: Option<u32>,
    superclass: Option<u32>,
}

impl Captures {
    fn of(compiled: &CompiledQuery) -> Self {
        Self {
            target: compiled.capture_index("target"),
            annotation: compiled.capture_index("annotation"),
            annotation_name: compiled.capture_index("annotation_name"),
            bound_object: compiled.capture_index("bound_object"),
            callee: compiled.capture_index("callee"),
            method: compiled.capture_index("method"),
            call_args: compiled.capture_index("call_args"),
            subclass: compiled.capture_index("subclass"),
            superclass: compiled.capture_index("superclass"),
        }
    }
}

fn node_of<'t>(m: &QueryMatch<'_, 't>, index: Option<u32>) -> Option<Node<'t>> {
    let index = index?;
    m.captures.iter().find(|c| c.index == index).map(|c| c.node)
}

fn text<'a>(node: Node, source: &'a [u8]) -> &'a str {
    node.utf8_text(source).unwrap_or("")
}

fn lines(start: Node, end: Node) -> (u32, u32) {
    (
        (start.start_position().row + 1) as u32,
        (end.end_position().row + 1) as u32,
    )
}

/// `true` when `subject` is one of `refs` or a member of one (`pytest.fixture` for `pytest`).
fn is_reference(subject: &str, refs: &[String]) -> bool {
    refs.iter().any(|r| {
        subject == r
            || subject
                .strip_prefix(r.as_str())
                .is_some_and(|rest| rest.starts_with('.'))
    })
}

/// Per-feature inputs shared by all matches.
struct Locator<'f> {
    spec: &'f FeatureSpec,
    refs: Vec<String>,
    variables: Vec<String>,
}

impl Locator<'_> {
    fn accepts(&self, bound_object: Option<&str>, subject: &str) -> bool {
        match self.spec.locator_strategy {
            LocatorStrategy::VariableBound => {
                bound_object.is_some_and(|b| self.variables.iter().any(|v| v == b))
            }
            LocatorStrategy::Direct => is_reference(subject, &self.refs),
        }
    }
}

pub struct FeatureDetector<'a> {
    cache: &'a EngineCache,
    templates: &'a TemplateSet,
}

impl<'a> FeatureDetector<'a> {
    pub fn new(cache: &'a EngineCache, templates: &'a TemplateSet) -> Self {
        Self { cache, templates }
    }

    /// Detects every eligible feature of `features` in `parsed`.
    ///
    /// Ordering of the result is not significant.
    pub fn detect(&self, parsed: &ParsedSource<'_>, features: &[FeatureSpec]) -> Vec<Detection> {
        let expanded: HashSet<String> = parsed
            .context
            .expanded_import_paths()
            .into_iter()
            .collect();
        let compiler = QueryCompiler::new(self.cache, self.templates, parsed.language);

        let mut seen: HashSet<(String, u32, u32)> = HashSet::new();
        let mut detections = Vec::new();

        for spec in features {
            if !spec.absolute_paths.iter().any(|p| expanded.contains(p)) {
                continue;
            }

            let compiled = match compiler.build_query(spec) {
                Ok(compiled) => compiled,
                Err(e) => {
                    warn!(
                        library = %spec.library,
                        feature = %spec.feature_key,
                        error = %e,
                        "skipping feature"
                    );
                    continue;
                }
            };

            let mut refs: Vec<String> = Vec::new();
            for path in &spec.absolute_paths {
                for local in parsed.context.local_references(path) {
                    if !refs.contains(&local) {
                        refs.push(local);
                    }
                }
            }
            let variables = match spec.locator_strategy {
                LocatorStrategy::VariableBound => parsed.context.bound_variables(&refs),
                LocatorStrategy::Direct => Vec::new(),
            };
            if spec.locator_strategy == LocatorStrategy::VariableBound && variables.is_empty() {
                debug!(feature = %spec.feature_key, "no bound variable, nothing to locate");
                continue;
            }

            let locator = Locator {
                spec,
                refs,
                variables,
            };
            for detection in self.run(parsed, &compiled, &locator) {
                let key = (
                    detection.feature_key.clone(),
                    detection.start_line,
                    detection.end_line,
                );
                if seen.insert(key) {
                    detections.push(detection);
                }
            }
        }

        detections
    }

    fn run(
        &self,
        parsed: &ParsedSource<'_>,
        compiled: &CompiledQuery,
        locator: &Locator<'_>,
    ) -> Vec<Detection> {
        let captures = Captures::of(compiled);
        let source = parsed.source;
        let mut out = Vec::new();

        let mut cursor = QueryCursor::new();
        let mut matches = cursor.matches(&compiled.query, parsed.tree.root_node(), source);
        while let Some(m) = matches.next() {
            if compiled.requires_method && node_of(m, captures.method).is_none() {
                continue;
            }
            let bound_object = node_of(m, captures.bound_object).map(|n| text(n, source));

            let detection = match locator.spec.concept {
                Concept::Annotation => {
                    annotation(m, &captures, parsed, locator, bound_object)
                }
                Concept::Call => call(m, &captures, source, locator, bound_object),
                Concept::Inheritance => inheritance(m, &captures, source, locator, bound_object),
            };
            if let Some(detection) = detection {
                out.push(stamp(detection, locator.spec));
            }
        }
        out
    }
}

fn stamp(detection: Detection, spec: &FeatureSpec) -> Detection {
    let target = match spec.target_level {
        TargetLevel::Function => "function",
        TargetLevel::Class => "class",
    };
    let locator = match spec.locator_strategy {
        LocatorStrategy::VariableBound => "variable_bound",
        LocatorStrategy::Direct => "direct",
    };
    let detection = detection
        .with_metadata("target", target)
        .with_metadata("locator", locator);
    if spec.startpoint {
        detection.with_metadata("startpoint", "true")
    } else {
        detection
    }
}

fn annotation(
    m: &QueryMatch<'_, '_>,
    captures: &Captures,
    parsed: &ParsedSource<'_>,
    locator: &Locator<'_>,
    bound_object: Option<&str>,
) -> Option<Detection> {
    let source = parsed.source;
    let node = node_of(m, captures.annotation)?;
    let name = text(node_of(m, captures.annotation_name)?, source);

    let (level, target_name) = decorated_target(node, parsed.language, source)?;
    if level != locator.spec.target_level {
        return None;
    }
    if !locator.accepts(bound_object, decorator_subject(node, source)) {
        return None;
    }

    let detection = Detection::new(
        &locator.spec.feature_key,
        &locator.spec.library,
        text(node, source).trim(),
        lines(node, node),
        DetectionKind::Annotation {
            bound_object: bound_object.map(str::to_string),
            annotation_name: name.to_string(),
            variable_names: locator.variables.clone(),
        },
    );
    Some(match target_name {
        Some(target_name) => detection.with_metadata("target_name", target_name),
        None => detection,
    })
}

fn call(
    m: &QueryMatch<'_, '_>,
    captures: &Captures,
    source: &[u8],
    locator: &Locator<'_>,
    bound_object: Option<&str>,
) -> Option<Detection> {
    let target = node_of(m, captures.target)?;
    let callee = text(node_of(m, captures.callee)?, source);
    if !locator.accepts(bound_object, callee) {
        return None;
    }
    let args_text = node_of(m, captures.call_args)
        .map(|n| text(n, source))
        .unwrap_or("");

    Some(Detection::new(
        &locator.spec.feature_key,
        &locator.spec.library,
        text(target, source),
        lines(target, target),
        DetectionKind::Call {
            callee: callee.to_string(),
            args_text: args_text.to_string(),
        },
    ))
}

fn inheritance(
    m: &QueryMatch<'_, '_>,
    captures: &Captures,
    source: &[u8],
    locator: &Locator<'_>,
    bound_object: Option<&str>,
) -> Option<Detection> {
    let target = node_of(m, captures.target)?;
    let subclass = text(node_of(m, captures.subclass)?, source);
    let superclass_node = node_of(m, captures.superclass)?;
    let superclass = text(superclass_node, source);
    if !locator.accepts(bound_object, superclass) {
        return None;
    }

    // The class header: `class User(Base)` / `class A extends B`.
    let header_end = superclass_node.parent().unwrap_or(superclass_node);
    let header = source
        .get(target.start_byte()..header_end.end_byte())
        .and_then(|bytes| std::str::from_utf8(bytes).ok())
        .unwrap_or(superclass);

    Some(Detection::new(
        &locator.spec.feature_key,
        &locator.spec.library,
        header,
        lines(target, header_end),
        DetectionKind::Inheritance {
            subclass: subclass.to_string(),
            superclass: superclass.to_string(),
        },
    ))
}

/// The expression a decorator applies, without call arguments (`router.get` for
/// `@router.get("/items")`).
fn decorator_subject<'a>(decorator: Node, source: &'a [u8]) -> &'a str {
    let Some(expr) = decorator.named_child(0) else {
        return "";
    };
    let expr = if matches!(expr.kind(), "call" | "call_expression") {
        expr.child_by_field_name("function").unwrap_or(expr)
    } else {
        expr
    };
    text(expr, source)
}

/// Resolves what a decorator is attached to: its level and, when named, its name.
///
/// `None` for decorators on things that are neither functions nor classes (TypeScript
/// fields and parameters).
fn decorated_target(
    decorator: Node,
    language: SourceLanguage,
    source: &[u8],
) -> Option<(TargetLevel, Option<String>)> {
    let parent = decorator.parent()?;
    let definition = match language {
        SourceLanguage::Python => parent.child_by_field_name("definition")?,
        SourceLanguage::TypeScript | SourceLanguage::Tsx => match parent.kind() {
            "export_statement" => parent.child_by_field_name("declaration")?,
            "class_body" => {
                // Member decorators precede their member as siblings.
                let mut next = decorator.next_named_sibling();
                while let Some(node) = next.filter(|n| n.kind() == "decorator") {
                    next = node.next_named_sibling();
                }
                next?
            }
            _ => parent,
        },
    };

    let level = match definition.kind() {
        "function_definition" | "method_definition" | "method_signature"
        | "abstract_method_signature" => TargetLevel::Function,
        "class_definition" | "class_declaration" | "abstract_class_declaration" | "class" => {
            TargetLevel::Class
        }
        _ => return None,
    };
    let name = definition
        .child_by_field_name("name")
        .map(|n| text(n, source).to_string());
    Some((level, name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::ConstructQuery;
    use std::collections::BTreeMap;

    fn feature(
        key: &str,
        paths: &[&str],
        target: TargetLevel,
        concept: Concept,
        locator: LocatorStrategy,
    ) -> FeatureSpec {
        FeatureSpec {
            feature_key: key.into(),
            library: "lib".into(),
            absolute_paths: paths.iter().map(|p| p.to_string()).collect(),
            target_level: target,
            concept,
            locator_strategy: locator,
            construct_query: None,
            description: String::new(),
            startpoint: false,
        }
    }

    fn with_query(mut spec: FeatureSpec, family: &str, cq: ConstructQuery) -> FeatureSpec {
        spec.construct_query = Some(BTreeMap::from([(family.to_string(), cq)]));
        spec
    }

    fn http_endpoint() -> FeatureSpec {
        let mut spec = with_query(
            feature(
                "http_endpoint",
                &["fastapi.APIRouter", "fastapi.FastAPI"],
                TargetLevel::Function,
                Concept::Annotation,
                LocatorStrategy::VariableBound,
            ),
            "python",
            ConstructQuery {
                annotation_name: Some("^(get|post|put|delete|patch)$".into()),
                ..Default::default()
            },
        );
        spec.library = "fastapi".into();
        spec.startpoint = true;
        spec
    }

    fn detect(language: SourceLanguage, source: &str, features: &[FeatureSpec]) -> Vec<Detection> {
        let cache = EngineCache::new();
        let templates = TemplateSet::builtin(language.family()).unwrap();
        let parsed = ParsedSource::parse(&cache, language, source.as_bytes()).unwrap();
        FeatureDetector::new(&cache, &templates).detect(&parsed, features)
    }

    const FASTAPI_APP: &str = "\
from fastapi import APIRouter

router = APIRouter()

@router.get(\"/items\")
async def list_items():
    return []

def helper():
    pass
";

    #[test]
    fn test_fastapi_router_endpoint() {
        let found = detect(SourceLanguage::Python, FASTAPI_APP, &[http_endpoint()]);
        assert_eq!(found.len(), 1);
        let d = &found[0];
        assert_eq!(d.feature_key, "http_endpoint");
        assert_eq!(d.library, "fastapi");
        assert_eq!((d.start_line, d.end_line), (5, 5));
        assert_eq!(d.match_text, "@router.get(\"/items\")");
        assert_eq!(
            d.kind,
            DetectionKind::Annotation {
                bound_object: Some("router".into()),
                annotation_name: "get".into(),
                variable_names: vec!["router".into()],
            }
        );
        assert!(d.is_startpoint());
        assert_eq!(d.metadata.get("target_name").map(String::as_str), Some("list_items"));
    }

    #[test]
    fn test_duplicate_features_are_deduplicated() {
        let found = detect(
            SourceLanguage::Python,
            FASTAPI_APP,
            &[http_endpoint(), http_endpoint()],
        );
        assert_eq!(found.len(), 1);
    }

    #[test]
    fn test_ineligible_feature_is_skipped() {
        let flask = feature(
            "route",
            &["flask.Flask"],
            TargetLevel::Function,
            Concept::Annotation,
            LocatorStrategy::VariableBound,
        );
        assert!(detect(SourceLanguage::Python, FASTAPI_APP, &[flask]).is_empty());
    }

    #[test]
    fn test_unbound_receiver_is_rejected() {
        let src = "from fastapi import APIRouter\n\n@other.get(\"/x\")\ndef f():\n    pass\n";
        assert!(detect(SourceLanguage::Python, src, &[http_endpoint()]).is_empty());
    }

    #[test]
    fn test_misconfigured_feature_does_not_stop_others() {
        let broken = feature(
            "broken",
            &["fastapi.APIRouter"],
            TargetLevel::Function,
            Concept::Inheritance,
            LocatorStrategy::Direct,
        );
        let found = detect(SourceLanguage::Python, FASTAPI_APP, &[broken, http_endpoint()]);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].feature_key, "http_endpoint");
    }

    #[test]
    fn test_direct_annotation_with_member() {
        let fixture = with_query(
            feature(
                "fixture",
                &["pytest", "pytest.fixture"],
                TargetLevel::Function,
                Concept::Annotation,
                LocatorStrategy::Direct,
            ),
            "python",
            ConstructQuery {
                annotation_name: Some("^fixture$".into()),
                ..Default::default()
            },
        );
        let src = "import pytest\n\n@pytest.fixture(scope=\"session\")\ndef db():\n    pass\n\n@pytest.mark.slow\ndef test_a(db):\n    pass\n";
        let found = detect(SourceLanguage::Python, src, &[fixture]);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].start_line, 3);
        match &found[0].kind {
            DetectionKind::Annotation {
                bound_object,
                variable_names,
                ..
            } => {
                assert_eq!(bound_object.as_deref(), Some("pytest"));
                assert!(variable_names.is_empty());
            }
            other => panic!("unexpected kind {other:?}"),
        }
    }

    #[test]
    fn test_target_level_is_enforced() {
        let class_level = feature(
            "dataclass",
            &["dataclasses.dataclass"],
            TargetLevel::Class,
            Concept::Annotation,
            LocatorStrategy::Direct,
        );
        let src = "from dataclasses import dataclass\n\n@dataclass\ndef not_a_class():\n    pass\n\n@dataclass\nclass Point:\n    x: int\n";
        let found = detect(SourceLanguage::Python, src, &[class_level]);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].start_line, 7);
        assert_eq!(found[0].metadata.get("target").map(String::as_str), Some("class"));
    }

    #[test]
    fn test_direct_call() {
        let engine = feature(
            "engine",
            &["sqlalchemy.create_engine"],
            TargetLevel::Function,
            Concept::Call,
            LocatorStrategy::Direct,
        );
        let src = "from sqlalchemy import create_engine\n\nengine = create_engine(\"sqlite://\")\nprint(engine)\n";
        let found = detect(SourceLanguage::Python, src, &[engine]);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].start_line, 3);
        assert_eq!(
            found[0].kind,
            DetectionKind::Call {
                callee: "create_engine".into(),
                args_text: "(\"sqlite://\")".into(),
            }
        );
    }

    #[test]
    fn test_variable_bound_call_requires_method() {
        let middleware = with_query(
            feature(
                "middleware",
                &["fastapi.FastAPI"],
                TargetLevel::Function,
                Concept::Call,
                LocatorStrategy::VariableBound,
            ),
            "python",
            ConstructQuery {
                method: Some("^add_middleware$".into()),
                ..Default::default()
            },
        );
        let src = "from fastapi import FastAPI\napp = FastAPI()\napp.add_middleware(CORS)\napp.include_router(r)\n";
        let found = detect(SourceLanguage::Python, src, &[middleware]);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].start_line, 3);
        assert_eq!(found[0].match_text, "app.add_middleware(CORS)");
    }

    #[test]
    fn test_direct_inheritance() {
        let base = feature(
            "declarative_base",
            &["sqlalchemy.orm.DeclarativeBase"],
            TargetLevel::Class,
            Concept::Inheritance,
            LocatorStrategy::Direct,
        );
        let src = "from sqlalchemy.orm import DeclarativeBase\n\nclass Base(DeclarativeBase):\n    pass\n\nclass Other(object):\n    pass\n";
        let found = detect(SourceLanguage::Python, src, &[base]);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].match_text, "class Base(DeclarativeBase)");
        assert_eq!((found[0].start_line, found[0].end_line), (3, 3));
        assert_eq!(
            found[0].kind,
            DetectionKind::Inheritance {
                subclass: "Base".into(),
                superclass: "DeclarativeBase".into(),
            }
        );
    }

    #[test]
    fn test_variable_bound_inheritance() {
        let model = feature(
            "model",
            &["flask_sqlalchemy.SQLAlchemy"],
            TargetLevel::Class,
            Concept::Inheritance,
            LocatorStrategy::VariableBound,
        );
        let src = "from flask_sqlalchemy import SQLAlchemy\ndb = SQLAlchemy()\n\nclass User(db.Model):\n    pass\n";
        let found = detect(SourceLanguage::Python, src, &[model]);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].start_line, 4);
    }

    #[test]
    fn test_nestjs_decorators() {
        let controller = feature(
            "controller",
            &["@nestjs/common.Controller"],
            TargetLevel::Class,
            Concept::Annotation,
            LocatorStrategy::Direct,
        );
        let route = with_query(
            feature(
                "route",
                &["@nestjs/common.Get", "@nestjs/common.Post"],
                TargetLevel::Function,
                Concept::Annotation,
                LocatorStrategy::Direct,
            ),
            "typescript",
            ConstructQuery {
                annotation_name: Some("^(Get|Post)$".into()),
                ..Default::default()
            },
        );
        let src = "\
import { Controller, Get } from '@nestjs/common';

@Controller('cats')
export class CatsController {
  @Get()
  findAll() {
    return [];
  }
}
";
        let mut found = detect(SourceLanguage::TypeScript, src, &[controller, route]);
        found.sort_by_key(|d| d.start_line);
        let summary: Vec<(&str, u32)> = found
            .iter()
            .map(|d| (d.feature_key.as_str(), d.start_line))
            .collect();
        assert_eq!(summary, vec![("controller", 3), ("route", 5)]);
        assert_eq!(
            found[1].metadata.get("target_name").map(String::as_str),
            Some("findAll")
        );
    }

    #[test]
    fn test_express_variable_bound_call() {
        let routes = with_query(
            feature(
                "route",
                &["express"],
                TargetLevel::Function,
                Concept::Call,
                LocatorStrategy::VariableBound,
            ),
            "typescript",
            ConstructQuery {
                method: Some("^(get|post)$".into()),
                ..Default::default()
            },
        );
        let src = "import express from 'express';\nconst app = express();\napp.get('/x', handler);\napp.listen(3000);\n";
        let found = detect(SourceLanguage::TypeScript, src, &[routes]);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].start_line, 3);
        match &found[0].kind {
            DetectionKind::Call { callee, .. } => assert_eq!(callee, "app.get"),
            other => panic!("unexpected kind {other:?}"),
        }
    }

    #[test]
    fn test_is_reference() {
        let refs = vec!["pytest".to_string()];
        assert!(is_reference("pytest", &refs));
        assert!(is_reference("pytest.fixture", &refs));
        assert!(!is_reference("pytestx.fixture", &refs));
        assert!(!is_reference("fixture", &refs));
    }
}
