//! Finding, loading and assembling packages into a single document.
//!
//! Loading is a depth-first walk of the dependency graph. All state for
//! one build invocation lives in an explicitly passed [`BuildContext`]:
//! the loaded-package registry, package load order, dependency edges and
//! the phase-keyed step sets. Separate builds in the same process use
//! separate contexts and cannot leak state into each other.

use crate::manifest::{Manifest, ManifestError, StepKind};
use crate::resolve::{resolve, ResolveError};
use crate::sink::{DeploymentSink, SinkError};
use crate::steps::{
    step_for, BuildManager, BuildStep, LogObserver, StepContext, StepError, StepId, StepSet,
};
use lamina_core::{Document, MergeError};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Caller-supplied overrides for a manifest's free-form fields.
pub type Options = BTreeMap<String, toml::Value>;

/// Errors that can occur while loading a package tree.
#[derive(Error, Debug)]
pub enum LoadError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error("invalid manifest in '{dir}': {source}")]
    Manifest {
        dir: PathBuf,
        #[source]
        source: ManifestError,
    },

    /// Two different directories claim the same package identity.
    #[error("conflicting packages for '{name}': '{first}' and '{second}'")]
    ConflictingPackage {
        name: String,
        first: PathBuf,
        second: PathBuf,
    },

    /// A package lists itself as a dependency, by resolved directory.
    #[error("package specifies itself as a dependency: {dir}")]
    SelfDependency { dir: PathBuf },

    /// A dependency cycle re-entered a package mid-load.
    #[error("circular dependency through '{dir}'")]
    CircularDependency { dir: PathBuf },

    /// Two contributions disagreed on a document leaf.
    #[error("merge conflict in contribution from '{package}': {source}")]
    Merge {
        package: String,
        #[source]
        source: MergeError,
    },

    #[error(transparent)]
    Step(#[from] StepError),

    #[error(transparent)]
    Sink(#[from] SinkError),
}

/// Per-build-invocation state, explicitly passed instead of living in
/// process-wide globals.
#[derive(Debug, Default)]
pub struct BuildContext {
    /// Package name to the canonical directory it was loaded from.
    registry: HashMap<String, PathBuf>,
    /// Directories currently mid-load, for cycle detection.
    in_progress: HashSet<PathBuf>,
    /// Packages in the order they finished loading (dependency-first).
    load_order: Vec<String>,
    /// Direct dependency edges by package name.
    dep_edges: HashMap<String, Vec<String>>,
    /// Pre-merge steps collected from every loaded package.
    pre: StepSet,
    /// Post-merge steps collected from every loaded package.
    post: StepSet,
    /// Pre-merge steps that have already run in this build.
    ran_pre: HashSet<StepId>,
}

impl BuildContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The canonical directory a package was loaded from, if it has been.
    #[must_use]
    pub fn package_dir(&self, name: &str) -> Option<&PathBuf> {
        self.registry.get(name)
    }

    /// Packages in dependency-first load order.
    #[must_use]
    pub fn load_order(&self) -> &[String] {
        &self.load_order
    }
}

/// The result of loading one package.
#[derive(Debug)]
pub struct LoadedPackage {
    /// The package's merged contribution. Empty when the package was
    /// already satisfied elsewhere in the graph.
    pub document: Document,
    /// The parsed manifest with overrides applied.
    pub manifest: Manifest,
    /// The canonical package directory.
    pub dir: PathBuf,
    /// True when this call found the package already loaded and
    /// contributed nothing.
    pub already_loaded: bool,
}

/// Loads package trees.
#[derive(Debug, Default)]
pub struct Loader {
    search_paths: Vec<PathBuf>,
    options: Options,
}

impl Loader {
    #[must_use]
    pub fn new(search_paths: Vec<PathBuf>) -> Self {
        Self {
            search_paths,
            options: Options::new(),
        }
    }

    /// Supply overrides applied on top of every loaded manifest's
    /// free-form fields.
    #[must_use]
    pub fn with_options(mut self, options: Options) -> Self {
        self.options = options;
        self
    }

    /// Load the root package and everything it depends on, run the
    /// post-merge phase over the fully merged document, and hand the
    /// result to the deployment sink.
    ///
    /// The sink is invoked exactly once, and only if both phases
    /// succeed.
    ///
    /// # Errors
    ///
    /// Returns the first fatal [`LoadError`].
    pub fn load_project(
        &self,
        name: &str,
        source_dir: &Path,
        sink: &mut dyn DeploymentSink,
    ) -> Result<Document, LoadError> {
        let mut ctx = BuildContext::new();
        let loaded = self.load(name, true, source_dir, &mut ctx)?;

        let mut manager = BuildManager::new(StepContext {
            root: true,
            dir: loaded.dir.clone(),
            manifest: loaded.manifest.clone(),
        });
        for package in &ctx.load_order {
            let deps = ctx.dep_edges.get(package).cloned().unwrap_or_default();
            manager.add_package(package.clone(), deps);
        }
        for (id, step) in ctx.post.iter() {
            manager.add(id.clone(), Arc::clone(step));
        }

        let mut observer = LogObserver::new("postprocessor", true);
        let outcome = manager.run(loaded.document, &mut observer);
        let document = outcome.into_result()?;

        sink.publish(&document)?;
        tracing::info!(package = %loaded.manifest.package.name, "build complete");
        Ok(document)
    }

    /// Load one package: resolve it, load its dependencies, merge every
    /// contribution and run the pre-merge steps collected so far.
    ///
    /// Loading a package already satisfied elsewhere in the graph returns
    /// an empty contribution so the caller's merge is a no-op; the same
    /// name from a different directory is fatal.
    ///
    /// # Errors
    ///
    /// Returns the first fatal [`LoadError`].
    pub fn load(
        &self,
        name: &str,
        root: bool,
        source_dir: &Path,
        ctx: &mut BuildContext,
    ) -> Result<LoadedPackage, LoadError> {
        let dir = resolve(name, &self.search_paths, source_dir)?;
        self.load_resolved(root, dir, ctx)
    }

    fn load_resolved(
        &self,
        root: bool,
        dir: PathBuf,
        ctx: &mut BuildContext,
    ) -> Result<LoadedPackage, LoadError> {
        let mut manifest = Manifest::from_dir(&dir).map_err(|source| LoadError::Manifest {
            dir: dir.clone(),
            source,
        })?;
        manifest.apply_overrides(&self.options);
        let pkg_name = manifest.package.name.clone();

        if let Some(first) = ctx.registry.get(&pkg_name) {
            if *first != dir {
                return Err(LoadError::ConflictingPackage {
                    name: pkg_name,
                    first: first.clone(),
                    second: dir,
                });
            }
            // already satisfied: an empty contribution keeps the
            // caller's merge a no-op and never re-runs steps
            return Ok(LoadedPackage {
                document: Document::new(),
                manifest,
                dir,
                already_loaded: true,
            });
        }

        if !ctx.in_progress.insert(dir.clone()) {
            return Err(LoadError::CircularDependency { dir });
        }
        tracing::info!(package = %pkg_name, dir = %dir.display(), "loading");

        let result = self.load_fresh(root, &dir, &pkg_name, &manifest, ctx);
        ctx.in_progress.remove(&dir);
        let document = result?;

        ctx.registry.insert(pkg_name.clone(), dir.clone());
        ctx.load_order.push(pkg_name);

        Ok(LoadedPackage {
            document,
            manifest,
            dir,
            already_loaded: false,
        })
    }

    fn load_fresh(
        &self,
        root: bool,
        dir: &Path,
        pkg_name: &str,
        manifest: &Manifest,
        ctx: &mut BuildContext,
    ) -> Result<Document, LoadError> {
        let mut document = Document::new();
        let mut edges = Vec::new();

        for dep_name in manifest.dependencies.keys() {
            let dep_dir = resolve(dep_name, &self.search_paths, dir)?;
            if dep_dir == dir {
                return Err(LoadError::SelfDependency {
                    dir: dir.to_path_buf(),
                });
            }
            let loaded = self.load_resolved(false, dep_dir, ctx)?;
            edges.push(loaded.manifest.package.name.clone());
            if !loaded.already_loaded {
                document
                    .merge(&loaded.document)
                    .map_err(|source| LoadError::Merge {
                        package: loaded.manifest.package.name.clone(),
                        source,
                    })?;
            }
        }

        let own = manifest
            .document_contribution()
            .map_err(|source| LoadError::Manifest {
                dir: dir.to_path_buf(),
                source,
            })?;
        document.merge(&own).map_err(|source| LoadError::Merge {
            package: pkg_name.to_string(),
            source,
        })?;

        collect_steps(dir, pkg_name, manifest, ctx)?;
        ctx.dep_edges.insert(pkg_name.to_string(), edges.clone());

        run_pre_phase(root, dir, manifest, &edges, document, ctx)
    }
}

fn collect_steps(
    dir: &Path,
    pkg_name: &str,
    manifest: &Manifest,
    ctx: &mut BuildContext,
) -> Result<(), LoadError> {
    let phases = [
        (&manifest.preprocessors, &mut ctx.pre),
        (&manifest.postprocessors, &mut ctx.post),
    ];
    for (declared, set) in phases {
        for (step_name, reference) in declared {
            let kind =
                StepKind::parse(step_name, reference).map_err(|source| LoadError::Manifest {
                    dir: dir.to_path_buf(),
                    source,
                })?;
            set.add(StepId::new(pkg_name, step_name), step_for(&kind));
        }
    }
    Ok(())
}

/// Run every collected pre-merge step that has not run yet. Each step
/// runs exactly once per build, at the load level of its owning
/// package.
fn run_pre_phase(
    root: bool,
    dir: &Path,
    manifest: &Manifest,
    edges: &[String],
    document: Document,
    ctx: &mut BuildContext,
) -> Result<Document, LoadError> {
    let pending: Vec<(StepId, Arc<dyn BuildStep>)> = ctx
        .pre
        .iter()
        .filter(|(id, _)| !ctx.ran_pre.contains(id))
        .map(|(id, step)| (id.clone(), Arc::clone(step)))
        .collect();
    if pending.is_empty() {
        return Ok(document);
    }

    let mut manager = BuildManager::new(StepContext {
        root,
        dir: dir.to_path_buf(),
        manifest: manifest.clone(),
    });
    // dependencies already ran their steps at their own load level
    for dep in edges {
        manager.add_package(dep.clone(), Vec::new());
    }
    manager.add_package(manifest.package.name.clone(), edges.to_vec());
    for (id, step) in pending {
        manager.add(id, step);
    }

    let mut observer = LogObserver::new("preprocessor", root);
    let outcome = manager.run(document, &mut observer);
    ctx.ran_pre.extend(outcome.completed.iter().cloned());
    Ok(outcome.into_result()?)
}
