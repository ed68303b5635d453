//! Structural signatures: the per-file outline of classes, functions and call sites.

use serde::{Deserialize, Serialize};

/// A call made from inside a function body.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallRef {
    /// Receiver expression text (`self` in `self.save()`); `None` for bare calls.
    pub receiver: Option<String>,
    /// Called name (`save` in `self.save()`, `helper` in `helper()`).
    pub name: String,
    /// Line number (1-indexed).
    pub line: u32,
}

impl CallRef {
    pub fn bare(name: &str, line: u32) -> Self {
        Self {
            receiver: None,
            name: name.to_string(),
            line,
        }
    }

    pub fn on(receiver: &str, name: &str, line: u32) -> Self {
        Self {
            receiver: Some(receiver.to_string()),
            name: name.to_string(),
            line,
        }
    }
}

/// A function or method definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionOutline {
    /// Symbol name (e.g., `"handler"`).
    pub name: String,
    /// `"ClassName.method"` for methods, the bare name otherwise.
    pub qualified_name: String,
    pub parent_class: Option<String>,
    /// Decorator expressions without the leading `@`.
    pub decorators: Vec<String>,
    /// Calls in the body, in source order. Nested definitions are not included.
    pub calls: Vec<CallRef>,
    pub is_async: bool,
    /// First line of the definition, decorators included (1-indexed).
    pub start_line: u32,
    pub end_line: u32,
}

impl FunctionOutline {
    /// Convenience constructor for a function with only a name and call list.
    pub fn named(name: &str, calls: Vec<CallRef>) -> Self {
        Self {
            name: name.to_string(),
            qualified_name: name.to_string(),
            parent_class: None,
            decorators: Vec::new(),
            calls,
            is_async: false,
            start_line: 0,
            end_line: 0,
        }
    }
}

/// A class definition with its directly nested methods.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassOutline {
    pub name: String,
    /// Base class expressions as written (`"BaseModel"`, `"db.Model"`).
    pub bases: Vec<String>,
    pub decorators: Vec<String>,
    pub start_line: u32,
    pub end_line: u32,
    pub methods: Vec<FunctionOutline>,
}

/// Outline of one source file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructuralSignature {
    pub classes: Vec<ClassOutline>,
    /// Module-level functions.
    pub functions: Vec<FunctionOutline>,
}

impl StructuralSignature {
    pub fn is_empty(&self) -> bool {
        self.classes.is_empty() && self.functions.is_empty()
    }

    pub fn class(&self, name: &str) -> Option<&ClassOutline> {
        self.classes.iter().find(|c| c.name == name)
    }
}
