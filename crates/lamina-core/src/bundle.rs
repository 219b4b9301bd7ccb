//! Discovery of module source files within a package directory.
//!
//! Packages declare module directories in their manifest; the bundler walks
//! those directories and turns every source file into a path-addressed
//! entry that can be embedded into the document. Paths with a hidden
//! (dot-prefixed) component are skipped.

use crate::Document;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors that can occur while bundling module sources.
#[derive(Error, Debug)]
pub enum BundleError {
    #[error("module source directory not found: {0}")]
    SourceDirNotFound(PathBuf),

    #[error("module path is not valid UTF-8: {0}")]
    NonUtf8Path(PathBuf),

    #[error("invalid module search pattern: {0}")]
    Pattern(#[from] glob::PatternError),

    #[error("failed to walk module directory: {0}")]
    Glob(#[from] glob::GlobError),

    #[error("failed to read module source: {0}")]
    Io(#[from] std::io::Error),
}

/// One bundled module source: a package-relative, extension-stripped path
/// and the source text found there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub path: String,
    pub text: String,
}

/// Walk `rel_dir` under `package_dir` and collect every non-hidden source
/// file. The returned paths are relative to the package directory (so a
/// file `lib/util.src` becomes module path `lib/util`) and are yielded in
/// sorted order.
///
/// # Errors
///
/// Fails if the directory does not exist, a path is not valid UTF-8, or a
/// file cannot be read.
pub fn bundle(package_dir: &Path, rel_dir: &str) -> Result<Vec<SourceFile>, BundleError> {
    let root = package_dir.join(rel_dir);
    if !root.is_dir() {
        return Err(BundleError::SourceDirNotFound(root));
    }

    let pattern_path = root.join("**").join("*");
    let pattern = pattern_path
        .to_str()
        .ok_or_else(|| BundleError::NonUtf8Path(pattern_path.clone()))?;

    let mut sources = Vec::new();
    for entry in glob::glob(pattern)? {
        let file = entry?;
        if !file.is_file() {
            continue;
        }
        let Ok(rel) = file.strip_prefix(&root) else {
            continue;
        };
        if is_hidden(rel) {
            continue;
        }
        let Ok(package_rel) = file.strip_prefix(package_dir) else {
            continue;
        };
        let path = module_path(package_rel)?;
        let text = fs::read_to_string(&file)?;
        sources.push(SourceFile { path, text });
    }
    Ok(sources)
}

/// Place module source text into the document at the slash-separated
/// module path.
pub fn add_source(doc: &mut Document, module_path: &str, text: &str) {
    doc.set(module_path, Value::String(text.to_string()));
}

/// True if any component of the path starts with a dot.
fn is_hidden(rel: &Path) -> bool {
    rel.components()
        .any(|c| c.as_os_str().to_string_lossy().starts_with('.'))
}

/// Convert a package-relative file path to a module path: `/`-separated,
/// with the final extension stripped.
fn module_path(rel: &Path) -> Result<String, BundleError> {
    let stripped = rel.with_extension("");
    let mut parts = Vec::new();
    for component in stripped.components() {
        let part = component
            .as_os_str()
            .to_str()
            .ok_or_else(|| BundleError::NonUtf8Path(rel.to_path_buf()))?;
        parts.push(part.to_string());
    }
    Ok(parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;
    use tempfile::TempDir;

    fn write(dir: &Path, rel: &str, text: &str) {
        let path = dir.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, text).unwrap();
    }

    #[test]
    fn bundles_sources_with_stripped_extensions() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "lib/util.src", "util source");
        write(tmp.path(), "lib/nested/helper.src", "helper source");

        let sources = bundle(tmp.path(), "lib").unwrap();
        let paths: Vec<&str> = sources.iter().map(|s| s.path.as_str()).collect();
        assert_eq!(paths, vec!["lib/nested/helper", "lib/util"]);
        assert_eq!(sources[1].text, "util source");
    }

    #[test]
    fn hidden_entries_are_excluded() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "lib/visible.src", "ok");
        write(tmp.path(), "lib/.hidden.src", "no");
        write(tmp.path(), "lib/.git/config.src", "no");

        let sources = bundle(tmp.path(), "lib").unwrap();
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].path, "lib/visible");
    }

    #[test]
    fn missing_directory_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let err = bundle(tmp.path(), "nope").unwrap_err();
        assert!(matches!(err, BundleError::SourceDirNotFound(_)));
    }

    #[test]
    fn add_source_places_text_in_document() {
        let mut doc = Document::new();
        add_source(&mut doc, "lib/util", "exports!");
        assert_eq!(doc.get("lib.util"), Some(&json!("exports!")));
    }
}
