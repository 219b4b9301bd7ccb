//! Integration tests for package loading and full builds.

use lamina_core::Document;
use lamina_pkg::{BuildContext, DeploymentSink, LoadError, Loader, SinkError, MANIFEST_FILE};
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn write_package(root: &Path, rel: &str, manifest: &str) -> PathBuf {
    let dir = root.join(rel);
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join(MANIFEST_FILE), manifest).unwrap();
    dir
}

/// Sink that records every publish call.
#[derive(Default)]
struct RecordingSink {
    published: Vec<Document>,
}

impl DeploymentSink for RecordingSink {
    fn publish(&mut self, document: &Document) -> Result<(), SinkError> {
        self.published.push(document.clone());
        Ok(())
    }
}

#[test]
fn full_build_merges_bundles_and_runs_both_phases() {
    let tmp = TempDir::new().unwrap();
    let lib = write_package(
        tmp.path(),
        "lib",
        r#"
modules = ["lib"]

[package]
name = "lib"

[preprocessors]
modules = "modules"
"#,
    );
    fs::create_dir_all(lib.join("lib")).unwrap();
    fs::write(lib.join("lib/util.src"), "1").unwrap();

    write_package(
        tmp.path(),
        "app",
        r#"
[package]
name = "app"

[dependencies]
lib = "*"

[document.app]
main = "2"

[preprocessors]
ready = "set:meta.ready=true"

[postprocessors]
stamp = "format:meta.combined={lib.util}-{app.main}"
"#,
    );

    let loader = Loader::new(vec![tmp.path().to_path_buf()]);
    let mut sink = RecordingSink::default();
    let document = loader
        .load_project("app", tmp.path(), &mut sink)
        .unwrap();

    assert_eq!(
        serde_json::to_value(&document).unwrap(),
        json!({
            "lib": { "util": "1" },
            "app": { "main": "2" },
            "meta": { "ready": true, "combined": "1-2" },
        })
    );
    assert_eq!(sink.published.len(), 1);
    assert_eq!(sink.published[0], document);
}

#[test]
fn shared_dependency_loads_once() {
    let tmp = TempDir::new().unwrap();
    write_package(
        tmp.path(),
        "shared",
        r#"
[package]
name = "shared"

[document.shared]
marker = "x"
"#,
    );
    for name in ["b", "c"] {
        write_package(
            tmp.path(),
            name,
            &format!(
                r#"
[package]
name = "{name}"

[dependencies]
shared = "*"
"#
            ),
        );
    }
    write_package(
        tmp.path(),
        "app",
        r#"
[package]
name = "app"

[dependencies]
b = "*"
c = "*"
"#,
    );

    let loader = Loader::new(vec![tmp.path().to_path_buf()]);
    let mut ctx = BuildContext::new();
    let loaded = loader.load("app", true, tmp.path(), &mut ctx).unwrap();

    assert_eq!(ctx.load_order(), ["shared", "b", "c", "app"]);
    assert_eq!(loaded.document.get("shared.marker"), Some(&json!("x")));
}

#[test]
fn shared_dependency_pre_step_runs_once() {
    let tmp = TempDir::new().unwrap();
    // the step rewrites its own input, so every run appends another "x"
    write_package(
        tmp.path(),
        "shared",
        r#"
[package]
name = "shared"

[document.shared]
n = "o"

[preprocessors]
count = "format:shared.n={shared.n}x"
"#,
    );
    for name in ["b", "c"] {
        write_package(
            tmp.path(),
            name,
            &format!(
                r#"
[package]
name = "{name}"

[dependencies]
shared = "*"
"#
            ),
        );
    }
    write_package(
        tmp.path(),
        "app",
        r#"
[package]
name = "app"

[dependencies]
b = "*"
c = "*"
"#,
    );

    let loader = Loader::new(vec![tmp.path().to_path_buf()]);
    let mut sink = RecordingSink::default();
    let document = loader
        .load_project("app", tmp.path(), &mut sink)
        .unwrap();
    assert_eq!(document.get("shared.n"), Some(&json!("ox")));
}

#[test]
fn same_name_from_two_directories_is_fatal() {
    let tmp = TempDir::new().unwrap();
    write_package(tmp.path(), "vendor/a", "[package]\nname = \"dup\"\n");
    write_package(tmp.path(), "vendor/b", "[package]\nname = \"dup\"\n");
    write_package(
        tmp.path(),
        "app",
        r#"
[package]
name = "app"

[dependencies]
"../vendor/a" = "*"
"../vendor/b" = "*"
"#,
    );

    let loader = Loader::new(vec![tmp.path().to_path_buf()]);
    let mut ctx = BuildContext::new();
    let err = loader.load("app", true, tmp.path(), &mut ctx).unwrap_err();
    match err {
        LoadError::ConflictingPackage { name, first, second } => {
            assert_eq!(name, "dup");
            assert_ne!(first, second);
        }
        other => panic!("expected ConflictingPackage, got {other}"),
    }
}

#[test]
fn package_depending_on_itself_is_fatal() {
    let tmp = TempDir::new().unwrap();
    write_package(
        tmp.path(),
        "selfy",
        r#"
[package]
name = "selfy"

[dependencies]
selfy = "*"
"#,
    );

    let loader = Loader::new(vec![tmp.path().to_path_buf()]);
    let mut ctx = BuildContext::new();
    let err = loader.load("selfy", true, tmp.path(), &mut ctx).unwrap_err();
    assert!(matches!(err, LoadError::SelfDependency { .. }));
}

#[test]
fn dependency_cycle_is_fatal() {
    let tmp = TempDir::new().unwrap();
    write_package(
        tmp.path(),
        "a",
        "[package]\nname = \"a\"\n\n[dependencies]\nb = \"*\"\n",
    );
    write_package(
        tmp.path(),
        "b",
        "[package]\nname = \"b\"\n\n[dependencies]\na = \"*\"\n",
    );

    let loader = Loader::new(vec![tmp.path().to_path_buf()]);
    let mut ctx = BuildContext::new();
    let err = loader.load("a", true, tmp.path(), &mut ctx).unwrap_err();
    assert!(matches!(err, LoadError::CircularDependency { .. }));
}

#[test]
fn conflicting_contributions_are_fatal() {
    let tmp = TempDir::new().unwrap();
    write_package(
        tmp.path(),
        "one",
        "[package]\nname = \"one\"\n\n[document.settings]\nmode = \"fast\"\n",
    );
    write_package(
        tmp.path(),
        "two",
        "[package]\nname = \"two\"\n\n[document.settings]\nmode = \"slow\"\n",
    );
    write_package(
        tmp.path(),
        "app",
        r#"
[package]
name = "app"

[dependencies]
one = "*"
two = "*"
"#,
    );

    let loader = Loader::new(vec![tmp.path().to_path_buf()]);
    let mut sink = RecordingSink::default();
    let err = loader
        .load_project("app", tmp.path(), &mut sink)
        .unwrap_err();
    assert!(err.to_string().contains("settings.mode"));
    assert!(sink.published.is_empty());
}

#[test]
fn dependency_pre_step_output_is_visible_to_root_post_step() {
    let tmp = TempDir::new().unwrap();
    write_package(
        tmp.path(),
        "lib",
        r#"
[package]
name = "lib"

[preprocessors]
flag = "set:lib.flag=\"on\""
"#,
    );
    write_package(
        tmp.path(),
        "app",
        r#"
[package]
name = "app"

[dependencies]
lib = "*"

[postprocessors]
echo = "format:out=lib says {lib.flag}"
"#,
    );

    let loader = Loader::new(vec![tmp.path().to_path_buf()]);
    let mut sink = RecordingSink::default();
    let document = loader
        .load_project("app", tmp.path(), &mut sink)
        .unwrap();
    assert_eq!(document.get("out"), Some(&json!("lib says on")));
}

#[test]
fn failed_post_step_skips_the_sink() {
    let tmp = TempDir::new().unwrap();
    write_package(
        tmp.path(),
        "app",
        r#"
[package]
name = "app"

[postprocessors]
broken = "format:out={nothing.here}"
"#,
    );

    let loader = Loader::new(vec![tmp.path().to_path_buf()]);
    let mut sink = RecordingSink::default();
    let err = loader
        .load_project("app", tmp.path(), &mut sink)
        .unwrap_err();
    assert!(matches!(err, LoadError::Step(_)));
    assert!(sink.published.is_empty());
}

#[test]
fn options_override_manifest_fields() {
    let tmp = TempDir::new().unwrap();
    write_package(
        tmp.path(),
        "app",
        "minify = false\n\n[package]\nname = \"app\"\n",
    );

    let mut options = lamina_pkg::Options::new();
    options.insert("minify".to_string(), toml::Value::Boolean(true));
    let loader = Loader::new(vec![tmp.path().to_path_buf()]).with_options(options);

    let mut ctx = BuildContext::new();
    let loaded = loader.load("app", true, tmp.path(), &mut ctx).unwrap();
    assert_eq!(
        loaded.manifest.extra.get("minify"),
        Some(&toml::Value::Boolean(true))
    );
}
