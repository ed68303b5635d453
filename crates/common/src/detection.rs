//! Detection records: one structured match of a feature against a file location.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Concept-specific payload of a [`Detection`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "concept", rename_all = "snake_case")]
pub enum DetectionKind {
    Annotation {
        /// Receiver of the decorator (`router` in `@router.get`), if any.
        bound_object: Option<String>,
        annotation_name: String,
        /// Module variables bound to the feature's imported symbol.
        variable_names: Vec<String>,
    },
    Call {
        callee: String,
        args_text: String,
    },
    Inheritance {
        subclass: String,
        superclass: String,
    },
}

/// One match instance.
///
/// Lines are 1-indexed and inclusive; `end_line >= start_line` always holds for
/// records built through [`Detection::new`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Detection {
    pub feature_key: String,
    pub library: String,
    pub match_text: String,
    pub start_line: u32,
    pub end_line: u32,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
    #[serde(flatten)]
    pub kind: DetectionKind,
}

impl Detection {
    /// Builds a detection, normalizing an inverted line range.
    pub fn new(
        feature_key: impl Into<String>,
        library: impl Into<String>,
        match_text: impl Into<String>,
        lines: (u32, u32),
        kind: DetectionKind,
    ) -> Self {
        let (a, b) = lines;
        Self {
            feature_key: feature_key.into(),
            library: library.into(),
            match_text: match_text.into(),
            start_line: a.min(b),
            end_line: a.max(b),
            metadata: BTreeMap::new(),
            kind,
        }
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<String>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    /// Identity used for de-duplication: two records with the same key describe the
    /// same usage even if they were produced by different locator paths.
    pub fn dedup_key(&self) -> (&str, u32, u32) {
        (&self.feature_key, self.start_line, self.end_line)
    }

    /// `true` when the detection came from a feature flagged as an entry point.
    pub fn is_startpoint(&self) -> bool {
        self.metadata.get("startpoint").map(String::as_str) == Some("true")
    }
}

/// Filters a detection list down to entry-point usages.
pub fn startpoints(detections: &[Detection]) -> Vec<&Detection> {
    detections.iter().filter(|d| d.is_startpoint()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(lines: (u32, u32)) -> Detection {
        Detection::new(
            "engine",
            "sqlalchemy",
            "create_engine(url)",
            lines,
            DetectionKind::Call {
                callee: "create_engine".into(),
                args_text: "(url)".into(),
            },
        )
    }

    #[test]
    fn test_new_normalizes_inverted_range() {
        let d = call((9, 4));
        assert_eq!((d.start_line, d.end_line), (4, 9));
    }

    #[test]
    fn test_dedup_key() {
        assert_eq!(call((3, 3)).dedup_key(), ("engine", 3, 3));
    }

    #[test]
    fn test_startpoints_filter() {
        let plain = call((1, 1));
        let entry = call((2, 2)).with_metadata("startpoint", "true");
        let all = vec![plain, entry];
        let picked = startpoints(&all);
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].start_line, 2);
    }

    #[test]
    fn test_serialized_shape_is_flat() {
        let json = serde_json::to_value(call((1, 2))).unwrap();
        assert_eq!(json["concept"], "call");
        assert_eq!(json["callee"], "create_engine");
        assert_eq!(json["start_line"], 1);
        assert!(json.get("metadata").is_none());
    }
}
