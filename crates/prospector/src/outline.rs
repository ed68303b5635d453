//! Structural outline extraction.
//!
//! Builds a [`StructuralSignature`] (classes with their methods, module-level functions,
//! call sites) from one pass of the outline query. Nested functions belong to neither
//! scope and are left out; nested classes are listed as classes.
//!
//! Python only. Other languages get an empty signature.

use std::collections::HashMap;

use common::{CallRef, ClassOutline, FunctionOutline, SourceLanguage, StructuralSignature};
use tree_sitter::{Node, Query, QueryCursor, StreamingIterator, Tree};

use crate::cache::{EngineCache, QuerySource};
use crate::error::ConfigError;
use crate::templates::builtin;

const OUTLINE_KEY: &str = "python:outline";

/// Compiled (once) outline query for Python.
pub fn outline_query(cache: &EngineCache) -> Result<std::sync::Arc<crate::cache::QuerySet>, ConfigError> {
    cache.get_compiled_queries(
        OUTLINE_KEY,
        SourceLanguage::Python,
        &[QuerySource::embedded("outline", builtin::PYTHON_OUTLINE)],
    )
}

/// Extracts the structural signature of a parsed file.
///
/// # Errors
/// Only if the embedded outline query fails to compile.
pub fn extract(
    cache: &EngineCache,
    language: SourceLanguage,
    tree: &Tree,
    source: &[u8],
) -> Result<StructuralSignature, ConfigError> {
    if language != SourceLanguage::Python {
        return Ok(StructuralSignature::default());
    }
    let set = outline_query(cache)?;
    let Some(query) = set.get("outline") else {
        return Ok(StructuralSignature::default());
    };
    Ok(extract_python(query, tree.root_node(), source))
}

fn capture<'t>(m: &tree_sitter::QueryMatch<'_, 't>, query: &Query, name: &str) -> Option<Node<'t>> {
    m.captures
        .iter()
        .find(|c| query.capture_names()[c.index as usize] == name)
        .map(|c| c.node)
}

fn text(node: Node, source: &[u8]) -> String {
    node.utf8_text(source).unwrap_or("").to_string()
}

fn extract_python(query: &Query, root: Node, source: &[u8]) -> StructuralSignature {
    let mut classes: Vec<ClassOutline> = Vec::new();
    let mut class_index: HashMap<usize, usize> = HashMap::new();
    // (owning class node id, method) pairs, attached once all classes are known.
    let mut methods: Vec<(usize, FunctionOutline)> = Vec::new();
    let mut functions: Vec<FunctionOutline> = Vec::new();

    let mut cursor = QueryCursor::new();
    let mut matches = cursor.matches(query, root, source);
    while let Some(m) = matches.next() {
        if let (Some(def), Some(name)) = (capture(m, query, "class.def"), capture(m, query, "class.name")) {
            if matches!(enclosing_scope(def), Some(Scope::Function(_))) {
                continue;
            }
            let bases = capture(m, query, "class.bases")
                .map(|bases| base_names(bases, source))
                .unwrap_or_default();
            let (outer, decorators) = decorated(def, source);
            class_index.insert(def.id(), classes.len());
            classes.push(ClassOutline {
                name: text(name, source),
                bases,
                decorators,
                start_line: line(outer.start_position().row),
                end_line: line(outer.end_position().row),
                methods: Vec::new(),
            });
            continue;
        }

        let (Some(def), Some(name)) = (capture(m, query, "fn.def"), capture(m, query, "fn.name")) else {
            continue;
        };
        let name = text(name, source);
        let (outer, decorators) = decorated(def, source);
        let mut cursor = def.walk();
        let is_async = def.children(&mut cursor).any(|c| c.kind() == "async");
        let calls = def
            .child_by_field_name("body")
            .map(|body| collect_calls(body, source))
            .unwrap_or_default();

        let mut outline = FunctionOutline {
            qualified_name: name.clone(),
            name,
            parent_class: None,
            decorators,
            calls,
            is_async,
            start_line: line(outer.start_position().row),
            end_line: line(outer.end_position().row),
        };

        match enclosing_scope(def) {
            None => functions.push(outline),
            Some(Scope::Class(class_node)) => {
                let class_name = class_node
                    .child_by_field_name("name")
                    .map(|n| text(n, source))
                    .unwrap_or_default();
                outline.qualified_name = format!("{class_name}.{}", outline.name);
                outline.parent_class = Some(class_name);
                methods.push((class_node.id(), outline));
            }
            Some(Scope::Function(_)) => {}
        }
    }

    for (class_id, method) in methods {
        if let Some(&idx) = class_index.get(&class_id) {
            classes[idx].methods.push(method);
        }
    }

    StructuralSignature { classes, functions }
}

fn line(row: usize) -> u32 {
    (row + 1) as u32
}

enum Scope<'t> {
    Class(Node<'t>),
    Function(Node<'t>),
}

/// Nearest enclosing class or function definition.
fn enclosing_scope(node: Node) -> Option<Scope> {
    let mut current = node.parent();
    while let Some(parent) = current {
        match parent.kind() {
            "class_definition" => return Some(Scope::Class(parent)),
            "function_definition" => return Some(Scope::Function(parent)),
            _ => current = parent.parent(),
        }
    }
    None
}

/// The node spanning the definition including its decorators, and the decorator texts.
fn decorated<'t>(def: Node<'t>, source: &[u8]) -> (Node<'t>, Vec<String>) {
    let Some(parent) = def.parent().filter(|p| p.kind() == "decorated_definition") else {
        return (def, Vec::new());
    };
    let mut cursor = parent.walk();
    let decorators = parent
        .named_children(&mut cursor)
        .filter(|c| c.kind() == "decorator")
        .map(|c| {
            let raw = text(c, source);
            raw.trim().trim_start_matches('@').trim().to_string()
        })
        .collect();
    (parent, decorators)
}

fn base_names(bases: Node, source: &[u8]) -> Vec<String> {
    let mut cursor = bases.walk();
    bases
        .named_children(&mut cursor)
        .filter(|c| matches!(c.kind(), "identifier" | "attribute" | "subscript"))
        .map(|c| text(c, source))
        .collect()
}

/// Calls in `body` in source order, not descending into nested definitions.
fn collect_calls(body: Node, source: &[u8]) -> Vec<CallRef> {
    let mut calls = Vec::new();
    let mut stack = vec![body];
    while let Some(node) = stack.pop() {
        if node.kind() == "call" {
            if let Some(call) = call_ref(node, source) {
                calls.push(call);
            }
        }
        let mut cursor = node.walk();
        let children: Vec<Node> = node
            .named_children(&mut cursor)
            .filter(|c| !matches!(c.kind(), "function_definition" | "class_definition"))
            .collect();
        stack.extend(children.into_iter().rev());
    }
    calls
}

fn call_ref(call: Node, source: &[u8]) -> Option<CallRef> {
    let function = call.child_by_field_name("function")?;
    let line = line(call.start_position().row);
    match function.kind() {
        "identifier" => Some(CallRef::bare(&text(function, source), line)),
        "attribute" => {
            let receiver = function.child_by_field_name("object")?;
            let name = function.child_by_field_name("attribute")?;
            Some(CallRef::on(&text(receiver, source), &text(name, source), line))
        }
        _ => None,
    }
}
