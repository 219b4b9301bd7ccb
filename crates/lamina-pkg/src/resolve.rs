//! Lookup of package names to package directories.

use crate::manifest::MANIFEST_FILE;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors that can occur during package resolution.
#[derive(Error, Debug)]
pub enum ResolveError {
    /// No candidate directory contained a manifest.
    #[error("cannot find package '{name}'")]
    NotFound { name: String },

    /// A candidate containing a manifest could not be canonicalized.
    #[error("failed to canonicalize package directory '{path}': {source}")]
    Canonicalize {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Look up the directory for a package name.
///
/// An absolute name is its own single candidate; a `./` or `../` name
/// joins to `source_dir`; any other name produces one candidate per
/// search path. Candidates are probed in order and the first directory
/// containing a `lamina.toml` wins, returned in canonical form so that
/// directory identity comparisons are reliable.
///
/// Pure filesystem probe, no side effects.
///
/// # Errors
///
/// Returns [`ResolveError::NotFound`] naming the original `name` when no
/// candidate contains a manifest.
pub fn resolve(
    name: &str,
    search_paths: &[PathBuf],
    source_dir: &Path,
) -> Result<PathBuf, ResolveError> {
    let candidates: Vec<PathBuf> = if Path::new(name).is_absolute() {
        vec![PathBuf::from(name)]
    } else if name.starts_with('.') {
        vec![source_dir.join(name)]
    } else {
        search_paths.iter().map(|dir| dir.join(name)).collect()
    };

    for candidate in candidates {
        if candidate.join(MANIFEST_FILE).is_file() {
            return candidate
                .canonicalize()
                .map_err(|source| ResolveError::Canonicalize {
                    path: candidate.clone(),
                    source,
                });
        }
    }
    Err(ResolveError::NotFound {
        name: name.to_string(),
    })
}
