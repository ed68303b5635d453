//! # Source Context
//!
//! Parses a file once and extracts what feature matching needs from its module level:
//!
//! - the imported paths, in source order,
//! - the [`ImportAliasMap`] (`fully.qualified.path` → local alias, first binding wins),
//! - module variables bound to a call (`router = APIRouter()`), for variable-bound features.
//!
//! Python paths are dotted (`fastapi.APIRouter`, `.models.User` for relative imports).
//! TypeScript paths are `module.Symbol` where `module` is the import specifier as written
//! (`@nestjs/common.Controller`); default and namespace imports bind the module itself.

use std::collections::{BTreeSet, HashSet};

use common::SourceLanguage;
use serde::ser::{Serialize, SerializeMap, Serializer};
use tree_sitter::{Node, Tree};

use crate::cache::EngineCache;
use crate::error::EngineError;

/// Fully-qualified path → local alias. Insertion-ordered; the first binding of a path wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportAliasMap {
    entries: Vec<(String, String)>,
}

impl ImportAliasMap {
    /// Records a binding unless `path` is already bound. Returns whether it was recorded.
    fn insert(&mut self, path: String, alias: String) -> bool {
        if self.get(&path).is_some() {
            return false;
        }
        self.entries.push((path, alias));
        true
    }

    pub fn get(&self, path: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(p, _)| p == path)
            .map(|(_, a)| a.as_str())
    }

    /// `(path, alias)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(p, a)| (p.as_str(), a.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<(String, String)> for ImportAliasMap {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        let mut map = Self::default();
        for (path, alias) in iter {
            map.insert(path, alias);
        }
        map
    }
}

impl Serialize for ImportAliasMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (path, alias) in &self.entries {
            map.serialize_entry(path, alias)?;
        }
        map.end()
    }
}

/// A module-level variable assigned from a call: `router = APIRouter(prefix="/v1")`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ModuleBinding {
    pub name: String,
    /// Text of the called expression (`APIRouter`, `fastapi.FastAPI`, `express`).
    pub callee: String,
    pub line: u32,
}

/// Per-file facts used to correlate query matches with catalog entries.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SourceContext {
    pub language: SourceLanguage,
    /// Imported paths in source order, without duplicates.
    pub imports: Vec<String>,
    pub import_aliases: ImportAliasMap,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub bindings: Vec<ModuleBinding>,
}

impl SourceContext {
    /// Parses `source` and builds its context.
    ///
    /// # Errors
    /// `EngineError::Parse` if the parser produces no tree.
    pub fn from_source(
        cache: &EngineCache,
        language: SourceLanguage,
        source: &[u8],
    ) -> Result<Self, EngineError> {
        let tree = cache.parse(language, source)?;
        Ok(Self::from_tree(language, &tree, source))
    }

    /// Builds the context from an already parsed tree.
    pub fn from_tree(language: SourceLanguage, tree: &Tree, source: &[u8]) -> Self {
        let mut builder = ContextBuilder::default();
        let root = tree.root_node();
        match language {
            SourceLanguage::Python => {
                builder.walk(root, source, &python_import);
                python_bindings(root, source, &mut builder.bindings);
            }
            SourceLanguage::TypeScript | SourceLanguage::Tsx => {
                builder.walk(root, source, &typescript_import);
                typescript_bindings(root, source, &mut builder.bindings);
            }
        }
        Self {
            language,
            imports: builder.imports,
            import_aliases: builder.aliases,
            bindings: builder.bindings,
        }
    }

    /// Imported paths plus all their dotted prefixes.
    pub fn expanded_import_paths(&self) -> Vec<String> {
        expand_import_paths(&self.imports)
    }

    /// Local spellings of `path` in this file.
    ///
    /// `path` is referenced as `A` when it was imported as `A`, and as `A.rest` when a
    /// parent `Q` was imported as `A` and `path == Q.rest`.
    pub fn local_references(&self, path: &str) -> Vec<String> {
        let mut refs = Vec::new();
        for (imported, alias) in self.import_aliases.iter() {
            let local = if imported == path {
                alias.to_string()
            } else if let Some(rest) = strip_dotted_prefix(path, imported) {
                format!("{alias}.{rest}")
            } else {
                continue;
            };
            if !refs.contains(&local) {
                refs.push(local);
            }
        }
        refs
    }

    /// Inverse of [`local_references`](Self::local_references): the fully-qualified path
    /// a local expression such as `pydantic.BaseModel` or `BaseModel` refers to.
    ///
    /// The longest matching alias wins. `None` if no import covers `text`.
    pub fn resolve_local(&self, text: &str) -> Option<String> {
        let mut best: Option<(usize, String)> = None;
        for (imported, alias) in self.import_aliases.iter() {
            let resolved = if text == alias {
                imported.to_string()
            } else if let Some(rest) = strip_dotted_prefix(text, alias) {
                format!("{imported}.{rest}")
            } else {
                continue;
            };
            if best.as_ref().map_or(true, |(len, _)| alias.len() > *len) {
                best = Some((alias.len(), resolved));
            }
        }
        best.map(|(_, path)| path)
    }

    /// Module variables bound to a call of one of `refs`, in source order.
    pub fn bound_variables(&self, refs: &[String]) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for binding in &self.bindings {
            if refs.iter().any(|r| *r == binding.callee) && !names.contains(&binding.name) {
                names.push(binding.name.clone());
            }
        }
        names
    }
}

/// A parsed file with its context: the unit every detector works on.
pub struct ParsedSource<'s> {
    pub language: SourceLanguage,
    pub source: &'s [u8],
    pub tree: Tree,
    pub context: SourceContext,
}

impl<'s> ParsedSource<'s> {
    /// Parses `source` once and builds its [`SourceContext`].
    ///
    /// # Errors
    /// `EngineError::Parse` if the parser produces no tree.
    pub fn parse(
        cache: &EngineCache,
        language: SourceLanguage,
        source: &'s [u8],
    ) -> Result<Self, EngineError> {
        let tree = cache.parse(language, source)?;
        let context = SourceContext::from_tree(language, &tree, source);
        Ok(Self {
            language,
            source,
            tree,
            context,
        })
    }
}

/// Returns every path plus all of its dotted prefixes, sorted and de-duplicated.
///
/// `a.b.c` expands to `a`, `a.b`, `a.b.c`. Prefixes made only of dots (`..x` → `.`, `..`)
/// name no module and are left out.
pub fn expand_import_paths<S: AsRef<str>>(paths: &[S]) -> Vec<String> {
    let mut expanded = BTreeSet::new();
    for path in paths {
        let path = path.as_ref();
        for (i, ch) in path.char_indices() {
            let prefix = &path[..i];
            if ch == '.' && !is_dots_only(prefix) {
                expanded.insert(prefix.to_string());
            }
        }
        if !is_dots_only(path) {
            expanded.insert(path.to_string());
        }
    }
    expanded.into_iter().collect()
}

fn is_dots_only(path: &str) -> bool {
    path.chars().all(|c| c == '.')
}

fn strip_dotted_prefix<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    path.strip_prefix(prefix)?
        .strip_prefix('.')
        .filter(|rest| !rest.is_empty())
}

#[derive(Default)]
struct ContextBuilder {
    imports: Vec<String>,
    seen: HashSet<String>,
    aliases: ImportAliasMap,
    bindings: Vec<ModuleBinding>,
}

/// `(path, alias)`; `alias` is `None` for wildcard and side-effect imports.
type ImportBinding = (String, Option<String>);

impl ContextBuilder {
    /// Walks the whole tree so that conditional and function-local imports count too.
    fn walk<F>(&mut self, root: Node, source: &[u8], import_of: &F)
    where
        F: Fn(Node, &[u8]) -> Option<Vec<ImportBinding>>,
    {
        let mut stack = vec![root];
        while let Some(node) = stack.pop() {
            if let Some(found) = import_of(node, source) {
                for (path, alias) in found {
                    self.record(path, alias);
                }
                continue;
            }
            let mut cursor = node.walk();
            let children: Vec<Node> = node.named_children(&mut cursor).collect();
            // Reverse so the stack pops children in source order.
            stack.extend(children.into_iter().rev());
        }
    }

    fn record(&mut self, path: String, alias: Option<String>) {
        if path.is_empty() {
            return;
        }
        if self.seen.insert(path.clone()) {
            self.imports.push(path.clone());
        }
        if let Some(alias) = alias {
            self.aliases.insert(path, alias);
        }
    }
}

fn text<'a>(node: Node, source: &'a [u8]) -> &'a str {
    node.utf8_text(source).unwrap_or("")
}

fn line_of(node: Node) -> u32 {
    (node.start_position().row + 1) as u32
}

fn join_module(module: &str, name: &str) -> String {
    if module.ends_with('.') {
        format!("{module}{name}")
    } else {
        format!("{module}.{name}")
    }
}

/// Python `import` / `from ... import` statements.
fn python_import(node: Node, source: &[u8]) -> Option<Vec<ImportBinding>> {
    let mut found = Vec::new();
    let mut cursor = node.walk();
    match node.kind() {
        "import_statement" => {
            for child in node.children_by_field_name("name", &mut cursor) {
                match child.kind() {
                    "dotted_name" => {
                        let path = text(child, source).to_string();
                        found.push((path.clone(), Some(path)));
                    }
                    "aliased_import" => {
                        let (Some(name), Some(alias)) = (
                            child.child_by_field_name("name"),
                            child.child_by_field_name("alias"),
                        ) else {
                            continue;
                        };
                        found.push((
                            text(name, source).to_string(),
                            Some(text(alias, source).to_string()),
                        ));
                    }
                    _ => {}
                }
            }
        }
        "import_from_statement" => {
            let module = text(node.child_by_field_name("module_name")?, source);
            for child in node.children_by_field_name("name", &mut cursor) {
                match child.kind() {
                    "dotted_name" => {
                        let name = text(child, source);
                        found.push((join_module(module, name), Some(name.to_string())));
                    }
                    "aliased_import" => {
                        let (Some(name), Some(alias)) = (
                            child.child_by_field_name("name"),
                            child.child_by_field_name("alias"),
                        ) else {
                            continue;
                        };
                        found.push((
                            join_module(module, text(name, source)),
                            Some(text(alias, source).to_string()),
                        ));
                    }
                    _ => {}
                }
            }
            let mut cursor = node.walk();
            if node
                .named_children(&mut cursor)
                .any(|c| c.kind() == "wildcard_import")
            {
                found.push((module.to_string(), None));
            }
        }
        _ => return None,
    }
    Some(found)
}

/// TypeScript `import` declarations.
fn typescript_import(node: Node, source: &[u8]) -> Option<Vec<ImportBinding>> {
    if node.kind() != "import_statement" {
        return None;
    }
    let module = text(node.child_by_field_name("source")?, source)
        .trim_matches(|c| c == '"' || c == '\'' || c == '`')
        .to_string();

    let mut found = Vec::new();
    let mut cursor = node.walk();
    let clause = node
        .named_children(&mut cursor)
        .find(|c| c.kind() == "import_clause");
    let Some(clause) = clause else {
        // `import "reflect-metadata";`
        found.push((module, None));
        return Some(found);
    };

    let mut cursor = clause.walk();
    for part in clause.named_children(&mut cursor) {
        match part.kind() {
            "identifier" => found.push((module.clone(), Some(text(part, source).to_string()))),
            "namespace_import" => {
                let mut inner = part.walk();
                if let Some(ident) = part
                    .named_children(&mut inner)
                    .find(|c| c.kind() == "identifier")
                {
                    found.push((module.clone(), Some(text(ident, source).to_string())));
                };
            }
            "named_imports" => {
                let mut inner = part.walk();
                for spec in part
                    .named_children(&mut inner)
                    .filter(|c| c.kind() == "import_specifier")
                {
                    let Some(name) = spec.child_by_field_name("name") else {
                        continue;
                    };
                    let name = text(name, source).trim_matches(|c| c == '"' || c == '\'');
                    let alias = spec
                        .child_by_field_name("alias")
                        .map(|a| text(a, source))
                        .unwrap_or(name);
                    found.push((format!("{module}.{name}"), Some(alias.to_string())));
                }
            }
            _ => {}
        }
    }
    Some(found)
}

/// Text of the function called by `value`, if `value` is a call.
fn python_callee<'a>(value: Node, source: &'a [u8]) -> Option<&'a str> {
    (value.kind() == "call")
        .then(|| value.child_by_field_name("function"))
        .flatten()
        .map(|f| text(f, source))
}

fn python_bindings(root: Node, source: &[u8], out: &mut Vec<ModuleBinding>) {
    let mut cursor = root.walk();
    for stmt in root.named_children(&mut cursor) {
        if stmt.kind() != "expression_statement" {
            continue;
        }
        let Some(assignment) = stmt.named_child(0).filter(|n| n.kind() == "assignment") else {
            continue;
        };
        let (Some(left), Some(right)) = (
            assignment.child_by_field_name("left"),
            assignment.child_by_field_name("right"),
        ) else {
            continue;
        };
        if left.kind() != "identifier" {
            continue;
        }
        if let Some(callee) = python_callee(right, source) {
            out.push(ModuleBinding {
                name: text(left, source).to_string(),
                callee: callee.to_string(),
                line: line_of(stmt),
            });
        }
    }
}

fn typescript_callee<'a>(value: Node, source: &'a [u8]) -> Option<&'a str> {
    let field = match value.kind() {
        "call_expression" => "function",
        "new_expression" => "constructor",
        "await_expression" => return value.named_child(0).and_then(|v| typescript_callee(v, source)),
        _ => return None,
    };
    value.child_by_field_name(field).map(|f| text(f, source))
}

fn typescript_bindings(root: Node, source: &[u8], out: &mut Vec<ModuleBinding>) {
    let mut cursor = root.walk();
    for stmt in root.named_children(&mut cursor) {
        let declaration = match stmt.kind() {
            "lexical_declaration" | "variable_declaration" => stmt,
            "export_statement" => match stmt.child_by_field_name("declaration") {
                Some(decl)
                    if matches!(decl.kind(), "lexical_declaration" | "variable_declaration") =>
                {
                    decl
                }
                _ => continue,
            },
            _ => continue,
        };
        let mut inner = declaration.walk();
        for declarator in declaration
            .named_children(&mut inner)
            .filter(|c| c.kind() == "variable_declarator")
        {
            let (Some(name), Some(value)) = (
                declarator.child_by_field_name("name"),
                declarator.child_by_field_name("value"),
            ) else {
                continue;
            };
            if name.kind() != "identifier" {
                continue;
            }
            if let Some(callee) = typescript_callee(value, source) {
                out.push(ModuleBinding {
                    name: text(name, source).to_string(),
                    callee: callee.to_string(),
                    line: line_of(declarator),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn python(source: &str) -> SourceContext {
        SourceContext::from_source(&EngineCache::new(), SourceLanguage::Python, source.as_bytes())
            .unwrap()
    }

    fn typescript(source: &str) -> SourceContext {
        SourceContext::from_source(
            &EngineCache::new(),
            SourceLanguage::TypeScript,
            source.as_bytes(),
        )
        .unwrap()
    }

    fn aliases(ctx: &SourceContext) -> Vec<(&str, &str)> {
        ctx.import_aliases.iter().collect()
    }

    #[test]
    fn test_python_import_forms() {
        let ctx = python(
            "import os\n\
             import numpy as np\n\
             import a.b.c\n\
             from fastapi import APIRouter\n\
             from sqlalchemy.orm import Session as DbSession, relationship\n\
             from .models import User\n\
             from . import utils\n\
             from typing import *\n",
        );
        assert_eq!(
            aliases(&ctx),
            vec![
                ("os", "os"),
                ("numpy", "np"),
                ("a.b.c", "a.b.c"),
                ("fastapi.APIRouter", "APIRouter"),
                ("sqlalchemy.orm.Session", "DbSession"),
                ("sqlalchemy.orm.relationship", "relationship"),
                (".models.User", "User"),
                (".utils", "utils"),
            ]
        );
        assert_eq!(ctx.imports.last().map(String::as_str), Some("typing"));
        assert_eq!(ctx.imports.len(), 9);
    }

    #[test]
    fn test_parenthesized_from_import() {
        let ctx = python("from pydantic import (\n    BaseModel,\n    Field as F,\n)\n");
        assert_eq!(
            aliases(&ctx),
            vec![("pydantic.BaseModel", "BaseModel"), ("pydantic.Field", "F")]
        );
    }

    #[test]
    fn test_first_binding_wins() {
        let ctx = python(
            "from fastapi import APIRouter\n\
             from fastapi import APIRouter as Router\n",
        );
        assert_eq!(ctx.import_aliases.get("fastapi.APIRouter"), Some("APIRouter"));
        assert_eq!(ctx.import_aliases.len(), 1);

        let map: ImportAliasMap = vec![
            ("x.y".to_string(), "first".to_string()),
            ("x.y".to_string(), "second".to_string()),
        ]
        .into_iter()
        .collect();
        assert_eq!(map.get("x.y"), Some("first"));
    }

    #[test]
    fn test_repeated_module_import_keeps_first_alias() {
        let ctx = python("import a.b as x\nimport a.b as y\n");
        assert_eq!(ctx.import_aliases.get("a.b"), Some("x"));
        assert_eq!(ctx.import_aliases.len(), 1);
        assert_eq!(ctx.resolve_local("x").as_deref(), Some("a.b"));
    }

    #[test]
    fn test_nested_imports_are_found() {
        let ctx = python(
            "try:\n    import ujson as json\nexcept ImportError:\n    import json\n\
             def f():\n    from celery import shared_task\n",
        );
        assert_eq!(ctx.import_aliases.get("ujson"), Some("json"));
        assert_eq!(ctx.import_aliases.get("json"), Some("json"));
        assert_eq!(ctx.import_aliases.get("celery.shared_task"), Some("shared_task"));
    }

    #[test]
    fn test_expand_import_paths() {
        assert_eq!(expand_import_paths(&["a.b.c"]), vec!["a", "a.b", "a.b.c"]);
        assert_eq!(
            expand_import_paths(&["x.y", "x", "a"]),
            vec!["a", "x", "x.y"]
        );
        assert_eq!(expand_import_paths(&[".models.User"]), vec![".models", ".models.User"]);
        assert!(expand_import_paths::<&str>(&[]).is_empty());
    }

    #[test]
    fn test_relative_paths_skip_dot_prefixes() {
        assert_eq!(expand_import_paths(&["..x.y"]), vec!["..x", "..x.y"]);
        assert!(expand_import_paths(&[".", ".."]).is_empty());
    }

    #[test]
    fn test_local_references() {
        let ctx = python(
            "import fastapi\n\
             from fastapi import APIRouter as R\n\
             import a.b as ab\n",
        );
        assert_eq!(
            ctx.local_references("fastapi.APIRouter"),
            vec!["fastapi.APIRouter", "R"]
        );
        assert_eq!(ctx.local_references("a.b.c.D"), vec!["ab.c.D"]);
        assert_eq!(ctx.local_references("fastapi"), vec!["fastapi"]);
        assert!(ctx.local_references("flask.Flask").is_empty());
        // `fastapix` is not a child of `fastapi`.
        assert!(ctx.local_references("fastapix.App").is_empty());
    }

    #[test]
    fn test_resolve_local() {
        let ctx = python(
            "import pydantic\n\
             from pydantic import BaseModel\n\
             import typing as t\n",
        );
        assert_eq!(ctx.resolve_local("BaseModel").as_deref(), Some("pydantic.BaseModel"));
        assert_eq!(
            ctx.resolve_local("pydantic.BaseModel").as_deref(),
            Some("pydantic.BaseModel")
        );
        assert_eq!(ctx.resolve_local("t.TypedDict").as_deref(), Some("typing.TypedDict"));
        assert_eq!(ctx.resolve_local("Unknown"), None);
    }

    #[test]
    fn test_python_bindings() {
        let ctx = python(
            "from fastapi import APIRouter, FastAPI\n\
             router = APIRouter(prefix=\"/v1\")\n\
             app: FastAPI = FastAPI()\n\
             VERSION = \"1\"\n\
             def f():\n    inner = APIRouter()\n",
        );
        let names: Vec<(&str, &str, u32)> = ctx
            .bindings
            .iter()
            .map(|b| (b.name.as_str(), b.callee.as_str(), b.line))
            .collect();
        assert_eq!(
            names,
            vec![("router", "APIRouter", 2), ("app", "FastAPI", 3)]
        );
        assert_eq!(
            ctx.bound_variables(&["APIRouter".to_string()]),
            vec!["router"]
        );
    }

    #[test]
    fn test_typescript_import_forms() {
        let ctx = typescript(
            "import express from 'express';\n\
             import * as path from \"path\";\n\
             import { Controller, Get as HttpGet } from '@nestjs/common';\n\
             import type { Request } from 'express';\n\
             import 'reflect-metadata';\n",
        );
        assert_eq!(
            aliases(&ctx),
            vec![
                ("express", "express"),
                ("path", "path"),
                ("@nestjs/common.Controller", "Controller"),
                ("@nestjs/common.Get", "HttpGet"),
                ("express.Request", "Request"),
            ]
        );
        assert!(ctx.imports.contains(&"reflect-metadata".to_string()));
        assert!(ctx
            .expanded_import_paths()
            .contains(&"@nestjs/common".to_string()));
    }

    #[test]
    fn test_typescript_bindings() {
        let ctx = typescript(
            "import express from 'express';\n\
             import { PrismaClient } from '@prisma/client';\n\
             const app = express();\n\
             export const prisma = new PrismaClient();\n\
             let count = 0;\n",
        );
        let names: Vec<(&str, &str)> = ctx
            .bindings
            .iter()
            .map(|b| (b.name.as_str(), b.callee.as_str()))
            .collect();
        assert_eq!(names, vec![("app", "express"), ("prisma", "PrismaClient")]);
    }

    #[test]
    fn test_alias_map_serializes_in_order() {
        let ctx = python("import zlib\nimport abc\n");
        let json = serde_json::to_string(&ctx.import_aliases).unwrap();
        assert_eq!(json, r#"{"zlib":"zlib","abc":"abc"}"#);
    }
}
