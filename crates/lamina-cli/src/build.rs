//! The `lamina build` command.

use anyhow::{Context, Result};
use lamina_pkg::{JsonFileSink, Loader, NullSink, Options};
use std::env;
use std::path::{Path, PathBuf};

/// Build a package and deliver the finished document to `output`, or
/// print it to stdout.
pub fn build(
    package: &str,
    package_paths: &[PathBuf],
    overrides: &[String],
    output: Option<&Path>,
) -> Result<()> {
    let cwd = env::current_dir().context("failed to get current directory")?;

    let mut search_paths = package_paths.to_vec();
    search_paths.push(cwd.join("packages"));

    let loader = Loader::new(search_paths).with_options(parse_overrides(overrides)?);

    match output {
        Some(path) => {
            let mut sink = JsonFileSink::new(path);
            loader.load_project(package, &cwd, &mut sink)?;
            tracing::info!(path = %path.display(), "document written");
        }
        None => {
            let mut sink = NullSink;
            let document = loader.load_project(package, &cwd, &mut sink)?;
            println!("{}", serde_json::to_string_pretty(&document)?);
        }
    }
    Ok(())
}

fn parse_overrides(overrides: &[String]) -> Result<Options> {
    let mut options = Options::new();
    for entry in overrides {
        let (key, raw) = entry
            .split_once('=')
            .with_context(|| format!("invalid override '{entry}', expected KEY=VALUE"))?;
        options.insert(key.to_string(), parse_value(raw));
    }
    Ok(options)
}

/// Parse an override value as TOML, falling back to a plain string so
/// `--set name=widgets` works without quoting.
fn parse_value(raw: &str) -> toml::Value {
    let wrapped = format!("v = {raw}");
    match wrapped.parse::<toml::Table>() {
        Ok(mut table) => table
            .remove("v")
            .unwrap_or_else(|| toml::Value::String(raw.to_string())),
        Err(_) => toml::Value::String(raw.to_string()),
    }
}
