//! Where a finished document goes.
//!
//! The loader hands the fully merged, fully processed document to a
//! deployment sink exactly once, at the root, after both build phases
//! succeed. The wire protocol to any particular backend store is out of
//! scope; sinks only see the document.

use lamina_core::Document;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while publishing a document.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("failed to write document to '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize document: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Receives the finished document.
pub trait DeploymentSink {
    /// Publish the document.
    ///
    /// # Errors
    ///
    /// Returns a [`SinkError`] if the document could not be delivered.
    fn publish(&mut self, document: &Document) -> Result<(), SinkError>;
}

/// Writes the document as pretty-printed JSON to a file.
pub struct JsonFileSink {
    path: PathBuf,
}

impl JsonFileSink {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl DeploymentSink for JsonFileSink {
    fn publish(&mut self, document: &Document) -> Result<(), SinkError> {
        let json = serde_json::to_string_pretty(document)?;
        std::fs::write(&self.path, json).map_err(|source| SinkError::Io {
            path: self.path.clone(),
            source,
        })
    }
}

/// Discards the document; useful when the caller only wants the value
/// returned from the build.
pub struct NullSink;

impl DeploymentSink for NullSink {
    fn publish(&mut self, _document: &Document) -> Result<(), SinkError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn json_file_sink_writes_the_document() {
        let tmp = TempDir::new().unwrap();
        let out = tmp.path().join("out.json");
        let mut doc = Document::new();
        doc.set("a.b", json!(1));

        JsonFileSink::new(&out).publish(&doc).unwrap();
        let written: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(out).unwrap()).unwrap();
        assert_eq!(written, json!({"a": {"b": 1}}));
    }
}
