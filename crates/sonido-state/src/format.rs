//! Serialized state document.
//!
//! # Layout
//!
//! ```json
//! {
//!   "format_version": 1,
//!   "app_version": "1.4.0",
//!   "tree": {
//!     "gain": -6.0,
//!     "showMeters": true,
//!     "tone": { "bass": 2.5, "voicing": 1 }
//!   }
//! }
//! ```
//!
//! `tree` mirrors the [`ParamHolder`](crate::ParamHolder): one entry per leaf
//! keyed by identity, nested objects for groups, in tree order.
//!
//! Older saves were a single flat object with no envelope. A top-level object
//! without a `tree` member is read as that legacy layout.

use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

/// Current document layout version.
pub const FORMAT_VERSION: u32 = 1;

/// Version reported for legacy documents that carry no envelope.
pub const LEGACY_FORMAT_VERSION: u32 = 0;

#[derive(Serialize)]
struct Envelope<'a> {
    format_version: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    app_version: Option<&'a str>,
    tree: &'a Map<String, Value>,
}

/// A parsed state document.
#[derive(Debug, Clone, PartialEq)]
pub struct StateDocument {
    /// Layout version; [`LEGACY_FORMAT_VERSION`] for envelope-less documents.
    pub format_version: u32,
    /// Version of the application that wrote the document, if recorded.
    pub app_version: Option<String>,
    /// Leaf values keyed by identity.
    pub tree: Map<String, Value>,
}

impl StateDocument {
    /// Wrap a tree in a current-version envelope.
    pub fn new(tree: Map<String, Value>, app_version: Option<String>) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            app_version,
            tree,
        }
    }

    /// Parse a document, accepting the legacy flat layout.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, DocumentError> {
        let value: Value = serde_json::from_slice(bytes).map_err(DocumentError::Json)?;
        let Value::Object(mut root) = value else {
            return Err(DocumentError::NotAnObject);
        };

        match root.remove("tree") {
            Some(Value::Object(tree)) => {
                let format_version = root
                    .get("format_version")
                    .and_then(Value::as_u64)
                    .and_then(|v| u32::try_from(v).ok())
                    .unwrap_or(FORMAT_VERSION);
                let app_version = root
                    .get("app_version")
                    .and_then(Value::as_str)
                    .map(str::to_owned);
                Ok(Self {
                    format_version,
                    app_version,
                    tree,
                })
            }
            Some(_) => Err(DocumentError::TreeNotAnObject),
            None => Ok(Self {
                format_version: LEGACY_FORMAT_VERSION,
                app_version: None,
                tree: root,
            }),
        }
    }

    /// Encode as compact JSON.
    pub fn to_vec(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&self.envelope())
    }

    /// Encode as indented JSON.
    pub fn to_string_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&self.envelope())
    }

    fn envelope(&self) -> Envelope<'_> {
        Envelope {
            format_version: self.format_version,
            app_version: self.app_version.as_deref(),
            tree: &self.tree,
        }
    }

    /// Whether the document used the envelope-less layout.
    pub fn is_legacy(&self) -> bool {
        self.format_version == LEGACY_FORMAT_VERSION
    }

    /// Every leaf as a dotted path and its value, in document order.
    pub fn leaves(&self) -> Vec<(String, &Value)> {
        let mut out = Vec::new();
        collect_leaves(&self.tree, "", &mut out);
        out
    }
}

fn collect_leaves<'a>(map: &'a Map<String, Value>, prefix: &str, out: &mut Vec<(String, &'a Value)>) {
    for (key, value) in map {
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        match value {
            Value::Object(inner) => collect_leaves(inner, &path, out),
            _ => out.push((path, value)),
        }
    }
}

/// Why a byte buffer is not a state document.
#[derive(Debug, Error)]
pub enum DocumentError {
    /// Not valid JSON.
    #[error("invalid JSON: {0}")]
    Json(serde_json::Error),
    /// Valid JSON, but not an object at the top level.
    #[error("state document must be a JSON object")]
    NotAnObject,
    /// The `tree` member is not an object.
    #[error("state document `tree` must be a JSON object")]
    TreeNotAnObject,
}

/// What [`PluginState::deserialize`](crate::PluginState::deserialize) did.
///
/// Loading never fails on bad data; problems are listed here and logged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadReport {
    /// Layout version of the loaded document, `None` if it could not be read.
    pub format_version: Option<u32>,
    /// Application version recorded in the document.
    pub app_version: Option<String>,
    /// The document used the legacy flat layout.
    pub legacy_layout: bool,
    /// Leaves whose value changed.
    pub applied: usize,
    /// Leaves present in the document with the value they already had.
    pub unchanged: usize,
    /// Tree entries absent from the document (kept their value).
    pub missing: usize,
    /// Document entries with no counterpart in the tree.
    pub ignored: Vec<String>,
    /// Entries whose payload had the wrong type or an invalid value.
    pub rejected: Vec<String>,
    /// Set when the whole document was unreadable and nothing was applied.
    pub malformed: Option<String>,
}

impl LoadReport {
    /// Whether every entry was understood.
    pub fn is_clean(&self) -> bool {
        self.malformed.is_none() && self.ignored.is_empty() && self.rejected.is_empty()
    }

    /// Whether any leaf changed.
    pub fn changed_anything(&self) -> bool {
        self.applied > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_layout() {
        let tree = json!({ "gain": -6.0 }).as_object().cloned().unwrap();
        let doc = StateDocument::new(tree, Some("1.0.0".to_string()));
        let text = String::from_utf8(doc.to_vec().unwrap()).unwrap();
        assert_eq!(
            text,
            r#"{"format_version":1,"app_version":"1.0.0","tree":{"gain":-6.0}}"#
        );
    }

    #[test]
    fn app_version_omitted_when_absent() {
        let doc = StateDocument::new(Map::new(), None);
        let text = String::from_utf8(doc.to_vec().unwrap()).unwrap();
        assert_eq!(text, r#"{"format_version":1,"tree":{}}"#);
    }

    #[test]
    fn parse_envelope() {
        let doc = StateDocument::from_slice(
            br#"{"format_version":1,"app_version":"2.1","tree":{"gain":-3.0}}"#,
        )
        .unwrap();
        assert_eq!(doc.format_version, 1);
        assert_eq!(doc.app_version.as_deref(), Some("2.1"));
        assert_eq!(doc.tree["gain"], json!(-3.0));
        assert!(!doc.is_legacy());
    }

    #[test]
    fn parse_legacy_flat() {
        let doc = StateDocument::from_slice(br#"{"gain":-3.0,"mix":50.0}"#).unwrap();
        assert!(doc.is_legacy());
        assert_eq!(doc.tree.len(), 2);
    }

    #[test]
    fn reject_non_objects() {
        assert!(matches!(
            StateDocument::from_slice(b"not json"),
            Err(DocumentError::Json(_))
        ));
        assert!(matches!(
            StateDocument::from_slice(b"[1,2]"),
            Err(DocumentError::NotAnObject)
        ));
        assert!(matches!(
            StateDocument::from_slice(br#"{"tree":3}"#),
            Err(DocumentError::TreeNotAnObject)
        ));
    }

    #[test]
    fn leaves_flatten_groups() {
        let doc = StateDocument::from_slice(
            br#"{"tree":{"gain":1.0,"tone":{"bass":2.0,"eq":{"q":0.7}}}}"#,
        )
        .unwrap();
        let paths: Vec<_> = doc.leaves().into_iter().map(|(p, _)| p).collect();
        assert_eq!(paths, ["gain", "tone.bass", "tone.eq.q"]);
    }

    #[test]
    fn report_cleanliness() {
        let mut report = LoadReport::default();
        assert!(report.is_clean());
        report.ignored.push("legacyParam".to_string());
        assert!(!report.is_clean());
        assert!(!report.changed_anything());
    }
}
