//! Sandboxed loading of modules embedded in a finished document.
//!
//! Module paths are not filesystem paths: they address nodes inside the
//! document tree, with `/` as the root. A module's source text is executed
//! through a [`ModuleRuntime`] in a scope that exposes only the module's
//! own exports, a `require` bound to the module's directory, and a small
//! logging facility.
//!
//! Circular requires are supported through a two-phase binding: before a
//! module executes, the cache holds an [`ModuleState::InProgress`]
//! placeholder for it, snapshotting whatever exports the module had
//! attached so far each time it requires another module. A circular
//! consumer observes that partial value; the real exports overwrite the
//! placeholder once execution completes.

use crate::Document;
use serde_json::{Map, Value};
use std::cell::RefCell;
use std::collections::HashMap;
use thiserror::Error;

/// Errors raised while requiring a module.
#[derive(Error, Debug)]
pub enum ModuleError {
    /// No document node exists at the resolved path.
    #[error("could not require module: {target}")]
    NotFound { target: String },

    /// The resolved node is not source text.
    #[error("module path does not hold source text: {path}")]
    NotASource { path: String },

    /// The runtime failed while executing the module source.
    #[error("module '{path}' failed to execute: {message}")]
    Execution { path: String, message: String },
}

/// A cached module value: either mid-execution (partial exports) or fully
/// loaded.
#[derive(Debug, Clone)]
pub enum ModuleState {
    /// The module is currently executing; holds the exports attached so
    /// far.
    InProgress(Value),
    /// Execution finished; holds the final exports.
    Loaded(Value),
}

impl ModuleState {
    /// The exported value in either state.
    #[must_use]
    pub fn value(&self) -> &Value {
        match self {
            Self::InProgress(v) | Self::Loaded(v) => v,
        }
    }
}

/// Cache of module exports keyed by normalized absolute module path.
pub type ModuleCache = HashMap<String, ModuleState>;

/// Executes module source text inside a [`ModuleScope`].
pub trait ModuleRuntime {
    /// Run `source`, attaching exports to the scope.
    ///
    /// # Errors
    ///
    /// Returns an error if the source cannot be executed.
    fn execute(&self, source: &str, scope: &mut ModuleScope<'_, '_>) -> Result<(), ModuleError>;
}

/// Adapter turning a closure into a [`ModuleRuntime`].
pub struct FnRuntime<F>(pub F);

impl<F> ModuleRuntime for FnRuntime<F>
where
    F: Fn(&str, &mut ModuleScope<'_, '_>) -> Result<(), ModuleError>,
{
    fn execute(&self, source: &str, scope: &mut ModuleScope<'_, '_>) -> Result<(), ModuleError> {
        (self.0)(source, scope)
    }
}

/// Resolves and executes modules out of a document.
pub struct ModuleLoader<'a> {
    document: &'a Document,
    runtime: &'a dyn ModuleRuntime,
    cache: RefCell<ModuleCache>,
}

impl<'a> ModuleLoader<'a> {
    /// Create a loader with an empty cache.
    pub fn new(document: &'a Document, runtime: &'a dyn ModuleRuntime) -> Self {
        Self::with_cache(document, runtime, ModuleCache::new())
    }

    /// Create a loader reusing a previously populated cache.
    pub fn with_cache(
        document: &'a Document,
        runtime: &'a dyn ModuleRuntime,
        cache: ModuleCache,
    ) -> Self {
        Self {
            document,
            runtime,
            cache: RefCell::new(cache),
        }
    }

    /// Take the cache back out of the loader.
    #[must_use]
    pub fn into_cache(self) -> ModuleCache {
        self.cache.into_inner()
    }

    /// Require the module at `target`.
    ///
    /// Targets starting with `.` resolve against `current_dir`; all other
    /// targets resolve against the document root. Returns the module's
    /// exported value, executing it on first use.
    ///
    /// # Errors
    ///
    /// Fails if no module exists at the resolved path, the node there is
    /// not source text, or execution fails.
    pub fn require(&self, current_dir: &str, target: &str) -> Result<Value, ModuleError> {
        let path = resolve_path(current_dir, target);
        {
            let cache = self.cache.borrow();
            if let Some(state) = cache.get(&path) {
                return Ok(state.value().clone());
            }
        }

        let source = self.lookup_source(&path, target)?;
        self.cache
            .borrow_mut()
            .insert(path.clone(), ModuleState::InProgress(empty_exports()));

        let mut scope = ModuleScope {
            loader: self,
            dir: parent_dir(&path),
            path: path.clone(),
            exports: empty_exports(),
        };
        match self.runtime.execute(&source, &mut scope) {
            Ok(()) => {
                let exports = scope.exports;
                self.cache
                    .borrow_mut()
                    .insert(path, ModuleState::Loaded(exports.clone()));
                Ok(exports)
            }
            Err(err) => {
                // a failed module must not be observable as loaded
                self.cache.borrow_mut().remove(&path);
                Err(err)
            }
        }
    }

    fn lookup_source(&self, path: &str, target: &str) -> Result<String, ModuleError> {
        let node = self.document.get(path).ok_or_else(|| ModuleError::NotFound {
            target: target.to_string(),
        })?;
        match node {
            Value::String(text) => Ok(text.clone()),
            _ => Err(ModuleError::NotASource {
                path: path.to_string(),
            }),
        }
    }

    fn record_partial(&self, path: &str, exports: Value) {
        self.cache
            .borrow_mut()
            .insert(path.to_string(), ModuleState::InProgress(exports));
    }
}

/// The execution scope handed to a [`ModuleRuntime`].
pub struct ModuleScope<'l, 'a> {
    loader: &'l ModuleLoader<'a>,
    path: String,
    dir: String,
    exports: Value,
}

impl ModuleScope<'_, '_> {
    /// The normalized absolute path of the executing module.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The directory the module's relative requires resolve against.
    #[must_use]
    pub fn dir(&self) -> &str {
        &self.dir
    }

    /// The exports attached so far.
    #[must_use]
    pub fn exports(&self) -> &Value {
        &self.exports
    }

    /// Mutable access to the export object.
    pub fn exports_mut(&mut self) -> &mut Value {
        &mut self.exports
    }

    /// Attach a single named export.
    pub fn set_export(&mut self, key: &str, value: Value) {
        if !self.exports.is_object() {
            self.exports = empty_exports();
        }
        if let Value::Object(map) = &mut self.exports {
            map.insert(key.to_string(), value);
        }
    }

    /// Require another module, relative to this module's directory.
    ///
    /// The current partial exports are published to the cache first, so a
    /// circular require back into this module observes them.
    ///
    /// # Errors
    ///
    /// Propagates any [`ModuleError`] from the nested require.
    pub fn require(&mut self, target: &str) -> Result<Value, ModuleError> {
        self.loader.record_partial(&self.path, self.exports.clone());
        self.loader.require(&self.dir, target)
    }

    /// Minimal logging facility exposed to module code.
    pub fn log(&self, message: &str) {
        tracing::debug!(module = %self.path, "{}", message);
    }
}

fn empty_exports() -> Value {
    Value::Object(Map::new())
}

/// Join and normalize a module path: `.` segments collapse, `..` pops (and
/// is ignored at the root). Targets not starting with `.` are rooted.
fn resolve_path(current_dir: &str, target: &str) -> String {
    let base = if target.starts_with('.') {
        current_dir
    } else {
        "/"
    };
    let mut segments: Vec<&str> = Vec::new();
    for seg in base.split('/').chain(target.split('/')) {
        match seg {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    format!("/{}", segments.join("/"))
}

fn parent_dir(path: &str) -> String {
    match path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => path[..idx].to_string(),
    }
}

/// A runtime whose module source is JSON.
///
/// The parsed value becomes the module's exports. Objects of the form
/// `{"$require": "<target>"}` are replaced by the required module's
/// exports; an optional `"$get": "dotted.path"` selects inside them.
pub struct JsonRuntime;

impl ModuleRuntime for JsonRuntime {
    fn execute(&self, source: &str, scope: &mut ModuleScope<'_, '_>) -> Result<(), ModuleError> {
        let parsed: Value = serde_json::from_str(source).map_err(|e| ModuleError::Execution {
            path: scope.path().to_string(),
            message: format!("invalid module source: {e}"),
        })?;
        let resolved = resolve_markers(parsed, scope)?;
        *scope.exports_mut() = resolved;
        Ok(())
    }
}

fn resolve_markers(value: Value, scope: &mut ModuleScope<'_, '_>) -> Result<Value, ModuleError> {
    match value {
        Value::Object(map) => {
            if let Some(Value::String(target)) = map.get("$require") {
                let target = target.clone();
                let required = scope.require(&target)?;
                if let Some(Value::String(select)) = map.get("$get") {
                    return Ok(lookup(&required, select).cloned().unwrap_or(Value::Null));
                }
                return Ok(required);
            }
            let mut out = Map::new();
            for (key, inner) in map {
                let resolved = resolve_markers(inner, scope)?;
                out.insert(key, resolved);
            }
            Ok(Value::Object(out))
        }
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(resolve_markers(item, scope)?);
            }
            Ok(Value::Array(out))
        }
        other => Ok(other),
    }
}

fn lookup<'v>(value: &'v Value, path: &str) -> Option<&'v Value> {
    let mut node = value;
    for seg in path.split('.').filter(|s| !s.is_empty()) {
        node = node.get(seg)?;
    }
    Some(node)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::cell::Cell;

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => Document::from(map),
            _ => panic!("test document must be an object"),
        }
    }

    #[test]
    fn path_resolution_rules() {
        assert_eq!(resolve_path("/lib", "util"), "/util");
        assert_eq!(resolve_path("/lib", "./util"), "/lib/util");
        assert_eq!(resolve_path("/lib/nested", "../util"), "/lib/util");
        assert_eq!(resolve_path("/", "../escape"), "/escape");
        assert_eq!(resolve_path("/lib", "a/./b"), "/a/b");
    }

    #[test]
    fn parent_dir_of_paths() {
        assert_eq!(parent_dir("/lib/util"), "/lib");
        assert_eq!(parent_dir("/util"), "/");
    }

    #[test]
    fn requires_and_caches_a_module() {
        let d = doc(json!({"lib": {"util": "the-source"}}));
        let executions = Cell::new(0usize);
        let runtime = FnRuntime(|source: &str, scope: &mut ModuleScope<'_, '_>| {
            executions.set(executions.get() + 1);
            scope.set_export("src", json!(source));
            Ok(())
        });
        let loader = ModuleLoader::new(&d, &runtime);

        let first = loader.require("/", "lib/util").unwrap();
        let second = loader.require("/lib", "./util").unwrap();
        assert_eq!(first, json!({"src": "the-source"}));
        assert_eq!(first, second);
        assert_eq!(executions.get(), 1);
    }

    #[test]
    fn missing_module_names_the_target() {
        let d = doc(json!({}));
        let runtime = FnRuntime(|_: &str, _: &mut ModuleScope<'_, '_>| Ok(()));
        let loader = ModuleLoader::new(&d, &runtime);
        let err = loader.require("/", "no/such/module").unwrap_err();
        assert_eq!(err.to_string(), "could not require module: no/such/module");
    }

    #[test]
    fn non_source_node_is_rejected() {
        let d = doc(json!({"lib": {"util": {"nested": "x"}}}));
        let runtime = FnRuntime(|_: &str, _: &mut ModuleScope<'_, '_>| Ok(()));
        let loader = ModuleLoader::new(&d, &runtime);
        let err = loader.require("/", "lib/util").unwrap_err();
        assert!(matches!(err, ModuleError::NotASource { ref path } if path == "/lib/util"));
    }

    #[test]
    fn failed_module_is_not_cached() {
        let d = doc(json!({"bad": "boom"}));
        let attempts = Cell::new(0usize);
        let runtime = FnRuntime(|_: &str, scope: &mut ModuleScope<'_, '_>| {
            attempts.set(attempts.get() + 1);
            Err(ModuleError::Execution {
                path: scope.path().to_string(),
                message: "boom".to_string(),
            })
        });
        let loader = ModuleLoader::new(&d, &runtime);
        assert!(loader.require("/", "bad").is_err());
        assert!(loader.require("/", "bad").is_err());
        assert_eq!(attempts.get(), 2);
    }

    #[test]
    fn circular_require_observes_partial_exports() {
        let d = doc(json!({"a": "mod-a", "b": "mod-b"}));
        let runtime = FnRuntime(|source: &str, scope: &mut ModuleScope<'_, '_>| match source {
            "mod-a" => {
                scope.set_export("name", json!("a"));
                let peer = scope.require("./b")?;
                scope.set_export("peer", peer);
                Ok(())
            }
            "mod-b" => {
                let back = scope.require("./a")?;
                scope.set_export("saw", back.get("name").cloned().unwrap_or(Value::Null));
                Ok(())
            }
            _ => unreachable!(),
        });
        let loader = ModuleLoader::new(&d, &runtime);

        let a = loader.require("/", "a").unwrap();
        // b ran mid-way through a's execution and saw the partial export
        assert_eq!(a, json!({"name": "a", "peer": {"saw": "a"}}));
    }

    #[test]
    fn json_runtime_resolves_require_markers() {
        let d = doc(json!({
            "lib": {
                "config": r#"{"port": 8080, "host": "localhost"}"#,
                "server": r#"{"listen": {"$require": "./config", "$get": "port"}}"#
            }
        }));
        let loader = ModuleLoader::new(&d, &JsonRuntime);
        let server = loader.require("/", "lib/server").unwrap();
        assert_eq!(server, json!({"listen": 8080}));
    }

    #[test]
    fn json_runtime_circular_sees_placeholder() {
        let d = doc(json!({
            "a": r#"{"x": 1, "peer": {"$require": "./b"}}"#,
            "b": r#"{"back": {"$require": "./a"}}"#
        }));
        let loader = ModuleLoader::new(&d, &JsonRuntime);
        let a = loader.require("/", "a").unwrap();
        // the JSON runtime attaches exports only on completion, so the
        // circular edge observes the empty placeholder
        assert_eq!(a, json!({"x": 1, "peer": {"back": {}}}));
    }

    #[test]
    fn json_runtime_rejects_bad_source() {
        let d = doc(json!({"bad": "{not json"}));
        let loader = ModuleLoader::new(&d, &JsonRuntime);
        let err = loader.require("/", "bad").unwrap_err();
        assert!(matches!(err, ModuleError::Execution { .. }));
    }
}
