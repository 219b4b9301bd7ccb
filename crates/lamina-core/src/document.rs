//! The document tree accumulated over a build, and the merge rules that
//! combine package contributions into it.

use serde::{Deserialize, Serialize};
use serde_json::map::Entry;
use serde_json::{Map, Value};
use thiserror::Error;

/// Errors raised while merging two document trees.
#[derive(Error, Debug)]
pub enum MergeError {
    /// Two contributions set the same leaf to different values.
    #[error("conflicting property: {path}")]
    ConflictingProperty { path: String },
}

/// A nested string-keyed tree of values. The root is always an object.
///
/// The document is the single mutable artifact of a build: every loaded
/// package folds its contribution in via [`Document::merge`], and build
/// steps transform it in place.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Document(Map<String, Value>);

impl Document {
    /// Create an empty document.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the document has no top-level keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Access the underlying map.
    #[must_use]
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Look up a value by path. Paths may use `.` or `/` separators;
    /// empty segments are ignored, so `/a/b` and `a.b` address the same
    /// node.
    #[must_use]
    pub fn get(&self, path: &str) -> Option<&Value> {
        let mut segs = segments(path);
        let mut node = self.0.get(segs.next()?)?;
        for seg in segs {
            node = node.get(seg)?;
        }
        Some(node)
    }

    /// Set a value by path, creating intermediate objects as needed.
    /// An intermediate scalar in the way is replaced by an object.
    pub fn set(&mut self, path: &str, value: Value) {
        let segs: Vec<&str> = segments(path).collect();
        set_in(&mut self.0, &segs, value);
    }

    /// Fold `other` into this document.
    ///
    /// Nested objects merge recursively. A leaf already present must hold
    /// an equal value, otherwise the merge fails naming the full dotted
    /// path of the conflict. Identical re-contributions are accepted, which
    /// makes the merge idempotent and order-independent on conflict-free
    /// inputs.
    ///
    /// # Errors
    ///
    /// Returns [`MergeError::ConflictingProperty`] on the first
    /// incompatible leaf.
    pub fn merge(&mut self, other: &Self) -> Result<(), MergeError> {
        let mut path = Vec::new();
        merge_maps(&mut self.0, &other.0, &mut path)
    }
}

impl From<Map<String, Value>> for Document {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl From<Document> for Value {
    fn from(doc: Document) -> Self {
        Value::Object(doc.0)
    }
}

fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split(['/', '.']).filter(|s| !s.is_empty())
}

fn set_in(map: &mut Map<String, Value>, segs: &[&str], value: Value) {
    match segs {
        [] => {}
        [leaf] => {
            map.insert((*leaf).to_string(), value);
        }
        [head, rest @ ..] => {
            let slot = map
                .entry((*head).to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !slot.is_object() {
                *slot = Value::Object(Map::new());
            }
            if let Value::Object(inner) = slot {
                set_in(inner, rest, value);
            }
        }
    }
}

fn merge_maps(
    a: &mut Map<String, Value>,
    b: &Map<String, Value>,
    path: &mut Vec<String>,
) -> Result<(), MergeError> {
    for (key, incoming) in b {
        path.push(key.clone());
        match a.entry(key.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(incoming.clone());
            }
            Entry::Occupied(mut slot) => match (slot.get_mut(), incoming) {
                (Value::Object(existing), Value::Object(new)) => {
                    merge_maps(existing, new, path)?;
                }
                (existing, new) => {
                    if *existing != *new {
                        return Err(MergeError::ConflictingProperty {
                            path: path.join("."),
                        });
                    }
                }
            },
        }
        path.pop();
    }
    Ok(())
}
