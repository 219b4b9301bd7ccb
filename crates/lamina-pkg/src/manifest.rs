//! Lamina package manifest (`lamina.toml`) parsing and validation.

use lamina_core::Document;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

/// The manifest filename probed for when resolving packages.
pub const MANIFEST_FILE: &str = "lamina.toml";

/// Errors that can occur when working with manifests.
#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("failed to read manifest file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse manifest: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid package name '{0}': {1}")]
    InvalidName(String, &'static str),

    #[error("invalid version '{0}': {1}")]
    InvalidVersion(String, String),

    #[error("unknown step kind '{reference}' for step '{step}'")]
    UnknownStepKind { step: String, reference: String },

    #[error("malformed step reference '{reference}' for step '{step}': {reason}")]
    MalformedStepRef {
        step: String,
        reference: String,
        reason: &'static str,
    },

    #[error("invalid document table: {0}")]
    Document(String),
}

/// The complete lamina.toml manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    /// Package metadata (required).
    pub package: Package,

    /// Packages this one depends on, mapped to a constraint string. The
    /// constraint is carried for diagnostics; resolution is by name.
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,

    /// Module directories whose sources the `modules` step bundles.
    #[serde(default)]
    pub modules: Vec<String>,

    /// Content contributed verbatim to the document tree at load time.
    #[serde(default)]
    pub document: Option<toml::Table>,

    /// Pre-merge build steps: step name to step reference.
    #[serde(default)]
    pub preprocessors: BTreeMap<String, String>,

    /// Post-merge build steps: step name to step reference.
    #[serde(default)]
    pub postprocessors: BTreeMap<String, String>,

    /// Free-form configuration fields, copied verbatim and overridable by
    /// caller-supplied options at load time.
    #[serde(flatten)]
    pub extra: BTreeMap<String, toml::Value>,
}

/// Package metadata section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Package {
    /// Package name (required). This is the package's identity: two
    /// directories declaring the same name conflict.
    pub name: String,

    /// Package version (optional, semver when present).
    #[serde(default)]
    pub version: Option<String>,

    /// Short description.
    #[serde(default)]
    pub description: Option<String>,
}

/// The executable kind a step reference selects, decided at manifest
/// parse time.
#[derive(Debug, Clone, PartialEq)]
pub enum StepKind {
    /// Bundle the manifest's module directories into the document.
    Modules,
    /// Write a literal value at a document path.
    Set {
        path: String,
        value: serde_json::Value,
    },
    /// Render a template of `{dotted.path}` placeholders into a document
    /// path.
    Format { path: String, template: String },
}

impl StepKind {
    /// Parse a manifest step reference.
    ///
    /// # Errors
    ///
    /// Returns [`ManifestError::UnknownStepKind`] for an unrecognized
    /// kind, or [`ManifestError::MalformedStepRef`] for a recognized kind
    /// with a bad payload.
    pub fn parse(step: &str, reference: &str) -> Result<Self, ManifestError> {
        if reference == "modules" {
            return Ok(Self::Modules);
        }
        if let Some(rest) = reference.strip_prefix("set:") {
            let (path, raw) = split_assignment(step, reference, rest)?;
            let value =
                serde_json::from_str(raw).map_err(|_| ManifestError::MalformedStepRef {
                    step: step.to_string(),
                    reference: reference.to_string(),
                    reason: "value is not valid JSON",
                })?;
            return Ok(Self::Set {
                path: path.to_string(),
                value,
            });
        }
        if let Some(rest) = reference.strip_prefix("format:") {
            let (path, template) = split_assignment(step, reference, rest)?;
            return Ok(Self::Format {
                path: path.to_string(),
                template: template.to_string(),
            });
        }
        Err(ManifestError::UnknownStepKind {
            step: step.to_string(),
            reference: reference.to_string(),
        })
    }
}

fn split_assignment<'r>(
    step: &str,
    reference: &str,
    rest: &'r str,
) -> Result<(&'r str, &'r str), ManifestError> {
    rest.split_once('=')
        .filter(|(path, _)| !path.is_empty())
        .ok_or_else(|| ManifestError::MalformedStepRef {
            step: step.to_string(),
            reference: reference.to_string(),
            reason: "expected '<path>=<value>'",
        })
}

impl Manifest {
    /// Load a manifest from a package directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_dir(dir: impl AsRef<Path>) -> Result<Self, ManifestError> {
        let content = std::fs::read_to_string(dir.as_ref().join(MANIFEST_FILE))?;
        Self::parse(&content)
    }

    /// Parse a manifest from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid, a field fails validation,
    /// or a step reference does not name a known kind.
    pub fn parse(content: &str) -> Result<Self, ManifestError> {
        let manifest: Self = toml::from_str(content)?;
        manifest.validate()?;
        Ok(manifest)
    }

    fn validate(&self) -> Result<(), ManifestError> {
        self.validate_name()?;
        self.validate_version()?;
        for (step, reference) in self.preprocessors.iter().chain(&self.postprocessors) {
            StepKind::parse(step, reference)?;
        }
        Ok(())
    }

    /// Validate the package name.
    fn validate_name(&self) -> Result<(), ManifestError> {
        let name = &self.package.name;

        if name.is_empty() {
            return Err(ManifestError::InvalidName(
                name.clone(),
                "name cannot be empty",
            ));
        }

        if name.len() > 64 {
            return Err(ManifestError::InvalidName(
                name.clone(),
                "name cannot exceed 64 characters",
            ));
        }

        // Must start with a letter
        if !name.chars().next().is_some_and(|c| c.is_ascii_alphabetic()) {
            return Err(ManifestError::InvalidName(
                name.clone(),
                "name must start with a letter",
            ));
        }

        // Only alphanumeric, hyphens, and underscores
        for c in name.chars() {
            if !c.is_ascii_alphanumeric() && c != '-' && c != '_' {
                return Err(ManifestError::InvalidName(
                    name.clone(),
                    "name can only contain letters, numbers, hyphens, and underscores",
                ));
            }
        }

        Ok(())
    }

    /// Validate the version string when present.
    fn validate_version(&self) -> Result<(), ManifestError> {
        if let Some(version) = &self.package.version {
            semver::Version::parse(version)
                .map_err(|e| ManifestError::InvalidVersion(version.clone(), e.to_string()))?;
        }
        Ok(())
    }

    /// Apply caller-supplied options on top of the free-form fields.
    /// Overrides win on key collision; this is intentional, not a
    /// conflict.
    pub fn apply_overrides(&mut self, options: &BTreeMap<String, toml::Value>) {
        for (key, value) in options {
            self.extra.insert(key.clone(), value.clone());
        }
    }

    /// The package's verbatim document contribution from the manifest's
    /// `[document]` table.
    ///
    /// # Errors
    ///
    /// Returns an error if the table cannot be represented as a document.
    pub fn document_contribution(&self) -> Result<Document, ManifestError> {
        let Some(table) = &self.document else {
            return Ok(Document::new());
        };
        let value =
            serde_json::to_value(table).map_err(|e| ManifestError::Document(e.to_string()))?;
        match value {
            serde_json::Value::Object(map) => Ok(Document::from(map)),
            other => Err(ManifestError::Document(format!(
                "expected a table, got {other}"
            ))),
        }
    }
}
