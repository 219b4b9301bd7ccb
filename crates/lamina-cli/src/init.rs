//! Package initialization for `lamina init`.

use anyhow::{bail, Context, Result};
use lamina_pkg::{Manifest, MANIFEST_FILE};
use std::path::Path;
use std::{env, fs};

/// Initialize a new Lamina package in the current directory.
pub fn init_package(name: Option<String>) -> Result<()> {
    let current_dir = env::current_dir().context("failed to get current directory")?;
    init_in(&current_dir, name)
}

fn init_in(dir: &Path, name: Option<String>) -> Result<()> {
    let manifest_path = dir.join(MANIFEST_FILE);
    if manifest_path.exists() {
        bail!("cannot initialize: `{MANIFEST_FILE}` already exists in this directory");
    }

    let name = match name {
        Some(n) => n,
        None => infer_package_name(dir)?,
    };

    // Parsing the starter manifest applies the package name rules.
    let content = starter_manifest(&name);
    Manifest::parse(&content).with_context(|| format!("invalid package name `{name}`"))?;

    fs::create_dir_all(dir.join("lib")).context("failed to create lib directory")?;
    fs::write(&manifest_path, content)
        .with_context(|| format!("failed to write {MANIFEST_FILE}"))?;

    println!("Created package `{name}`");
    Ok(())
}

/// Infer the package name from the directory name.
fn infer_package_name(dir: &Path) -> Result<String> {
    dir.file_name()
        .and_then(|n| n.to_str())
        .map(ToString::to_string)
        .context("cannot infer package name from directory")
}

fn starter_manifest(name: &str) -> String {
    format!(
        r#"modules = ["lib"]

[package]
name = "{name}"
version = "0.1.0"

[preprocessors]
modules = "modules"
"#
    )
}
