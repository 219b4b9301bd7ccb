//! Build-step scheduling.
//!
//! Every loaded package contributes named transformation steps in two
//! phases: pre-merge steps run as each package loads, post-merge steps run
//! once at the root over the fully merged document. The [`BuildManager`]
//! executes steps package-by-package in dependency order, captures
//! failures instead of halting, and reports the status of every step at
//! the end of the run.

use crate::manifest::{Manifest, StepKind};
use lamina_core::{add_source, bundle, Document};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// The underlying cause a step reports on failure.
pub type StepFault = Box<dyn std::error::Error + Send + Sync>;

/// A step failure carrying the identity of the step that raised it.
#[derive(Error, Debug)]
pub enum StepError {
    #[error("step '{id}' failed: {source}")]
    Failed {
        id: StepId,
        #[source]
        source: StepFault,
    },
}

/// Identity of a build step: the owning package plus the step name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StepId {
    pub package: String,
    pub name: String,
}

impl StepId {
    pub fn new(package: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            package: package.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.package, self.name)
    }
}

/// Lifecycle state of a step. `Completed`, `Failed` and `Incomplete` are
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    /// Not yet attempted.
    Pending,
    /// Currently executing.
    Running,
    /// Finished and transformed the document.
    Completed,
    /// Raised an error; recorded against the step's identity.
    Failed,
    /// Never attempted because a prerequisite package failed or never
    /// loaded. A warning, not an error.
    Incomplete,
}

/// The context handed to every step.
#[derive(Debug, Clone)]
pub struct StepContext {
    /// Whether the current load is the root package.
    pub root: bool,
    /// Directory of the package currently loading.
    pub dir: PathBuf,
    /// Manifest of the package currently loading.
    pub manifest: Manifest,
}

/// A build step is anything that can transform the document.
pub trait BuildStep: Send + Sync {
    /// Transform the document, or report why it could not.
    ///
    /// # Errors
    ///
    /// Any error is captured by the scheduler and recorded against this
    /// step's identity; it does not halt independent steps.
    fn run(&self, ctx: &StepContext, document: Document) -> Result<Document, StepFault>;
}

/// Adapter turning a closure into a [`BuildStep`].
pub struct FnStep<F>(pub F);

impl<F> BuildStep for FnStep<F>
where
    F: Fn(&StepContext, Document) -> Result<Document, StepFault> + Send + Sync,
{
    fn run(&self, ctx: &StepContext, document: Document) -> Result<Document, StepFault> {
        (self.0)(ctx, document)
    }
}

/// An insertion-ordered set of steps keyed by [`StepId`].
///
/// Registration is first-writer-wins: a step already registered under the
/// same identity is ignored rather than treated as an error, which is what
/// makes repeated loads of the same package idempotent.
#[derive(Default, Clone)]
pub struct StepSet {
    entries: Vec<(StepId, Arc<dyn BuildStep>)>,
}

impl StepSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a step. Returns false if the identity was already taken.
    pub fn add(&mut self, id: StepId, step: Arc<dyn BuildStep>) -> bool {
        if self.contains(&id) {
            return false;
        }
        self.entries.push((id, step));
        true
    }

    #[must_use]
    pub fn contains(&self, id: &StepId) -> bool {
        self.entries.iter().any(|(existing, _)| existing == id)
    }

    /// Iterate in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &(StepId, Arc<dyn BuildStep>)> {
        self.entries.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for StepSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|(id, _)| id))
            .finish()
    }
}

/// Notifications emitted around step execution.
pub trait StepObserver {
    fn step_started(&mut self, _id: &StepId) {}
    fn step_finished(&mut self, _id: &StepId, _status: StepStatus) {}
    fn run_finished(&mut self, _outcome: &RunOutcome) {}
}

/// Observer that ignores every notification.
pub struct NullObserver;

impl StepObserver for NullObserver {}

/// Observer that reports lifecycle events through `tracing`, the way the
/// build pipeline surfaces them to an operator.
pub struct LogObserver {
    phase: &'static str,
    announce: bool,
}

impl LogObserver {
    /// `announce` controls whether step starts are logged at info level
    /// (used for the root package) or left to debug output.
    #[must_use]
    pub fn new(phase: &'static str, announce: bool) -> Self {
        Self { phase, announce }
    }
}

impl StepObserver for LogObserver {
    fn step_started(&mut self, id: &StepId) {
        if self.announce {
            tracing::info!("{} {}", self.phase, id);
        }
    }

    fn step_finished(&mut self, id: &StepId, status: StepStatus) {
        if status == StepStatus::Completed {
            tracing::debug!("completed {} {}", self.phase, id);
        }
    }

    fn run_finished(&mut self, outcome: &RunOutcome) {
        for failure in &outcome.failures {
            tracing::error!("error when running {}: {}", self.phase, failure);
        }
        for id in &outcome.incomplete {
            tracing::warn!("{} failed to run: {}", self.phase, id);
        }
    }
}

/// The report produced by a scheduler run.
#[derive(Debug)]
pub struct RunOutcome {
    /// The (possibly) transformed document.
    pub document: Document,
    /// Steps that completed, in execution order.
    pub completed: Vec<StepId>,
    /// Steps never attempted because a prerequisite was not satisfied.
    pub incomplete: Vec<StepId>,
    /// Every captured failure, in the order recorded.
    pub failures: Vec<StepError>,
}

impl RunOutcome {
    /// Collapse the outcome into a result: the first recorded failure
    /// becomes the run's overall error; incomplete steps alone do not
    /// fail the run.
    ///
    /// # Errors
    ///
    /// Returns the first recorded [`StepError`] if any step failed.
    pub fn into_result(mut self) -> Result<Document, StepError> {
        if self.failures.is_empty() {
            Ok(self.document)
        } else {
            Err(self.failures.remove(0))
        }
    }
}

/// Runs a set of steps against a document.
///
/// Packages execute in the order they were registered (the loader
/// registers them dependency-first); steps within one package run in
/// registration order but carry no ordering guarantee relative to each
/// other. A package whose direct dependency has a failed or missing step
/// has all of its own steps marked incomplete rather than failed.
pub struct BuildManager {
    context: StepContext,
    order: Vec<String>,
    edges: HashMap<String, Vec<String>>,
    steps: HashMap<String, Vec<(StepId, Arc<dyn BuildStep>)>>,
    registered: HashSet<StepId>,
}

impl BuildManager {
    #[must_use]
    pub fn new(context: StepContext) -> Self {
        Self {
            context,
            order: Vec::new(),
            edges: HashMap::new(),
            steps: HashMap::new(),
            registered: HashSet::new(),
        }
    }

    /// Register a package and its direct dependencies. Packages execute
    /// in registration order; re-registration is ignored.
    pub fn add_package(&mut self, package: impl Into<String>, deps: Vec<String>) {
        let package = package.into();
        if !self.order.contains(&package) {
            self.order.push(package.clone());
            self.edges.insert(package, deps);
        }
    }

    /// Register a step. First writer for an identity wins; the owning
    /// package is registered implicitly if needed.
    pub fn add(&mut self, id: StepId, step: Arc<dyn BuildStep>) -> bool {
        if !self.registered.insert(id.clone()) {
            return false;
        }
        if !self.order.contains(&id.package) {
            self.add_package(id.package.clone(), Vec::new());
        }
        self.steps.entry(id.package.clone()).or_default().push((id, step));
        true
    }

    /// Execute every registered step against `document`.
    ///
    /// Failures are captured, not thrown: the run continues with
    /// independent steps so the outcome can enumerate every failure in
    /// one pass.
    pub fn run(mut self, document: Document, observer: &mut dyn StepObserver) -> RunOutcome {
        let order = std::mem::take(&mut self.order);
        let mut document = document;
        let mut completed = Vec::new();
        let mut incomplete = Vec::new();
        let mut failures = Vec::new();
        // whether every step of a package completed; absent = never ran
        let mut package_ok: HashMap<String, bool> = HashMap::new();

        for package in order {
            let pkg_steps = self.steps.remove(&package).unwrap_or_default();
            let deps = self.edges.remove(&package).unwrap_or_default();

            let blocked = deps
                .iter()
                .any(|dep| !package_ok.get(dep).copied().unwrap_or(false));
            if blocked {
                for (id, _) in pkg_steps {
                    incomplete.push(id);
                }
                package_ok.insert(package, false);
                continue;
            }

            let mut all_ok = true;
            for (id, step) in pkg_steps {
                observer.step_started(&id);
                let attempt = document.clone();
                match step.run(&self.context, attempt) {
                    Ok(next) => {
                        document = next;
                        observer.step_finished(&id, StepStatus::Completed);
                        completed.push(id);
                    }
                    Err(source) => {
                        all_ok = false;
                        observer.step_finished(&id, StepStatus::Failed);
                        failures.push(StepError::Failed { id, source });
                    }
                }
            }
            package_ok.insert(package, all_ok);
        }

        let outcome = RunOutcome {
            document,
            completed,
            incomplete,
            failures,
        };
        observer.run_finished(&outcome);
        outcome
    }
}

/// Instantiate the executable for a parsed step reference.
#[must_use]
pub fn step_for(kind: &StepKind) -> Arc<dyn BuildStep> {
    match kind {
        StepKind::Modules => Arc::new(ModulesStep),
        StepKind::Set { path, value } => Arc::new(SetStep {
            path: path.clone(),
            value: value.clone(),
        }),
        StepKind::Format { path, template } => Arc::new(FormatStep {
            path: path.clone(),
            template: template.clone(),
        }),
    }
}

/// Bundles the loading package's module directories into the document.
pub struct ModulesStep;

impl BuildStep for ModulesStep {
    fn run(&self, ctx: &StepContext, mut document: Document) -> Result<Document, StepFault> {
        for rel_dir in &ctx.manifest.modules {
            for source in bundle(&ctx.dir, rel_dir)? {
                add_source(&mut document, &source.path, &source.text);
            }
        }
        Ok(document)
    }
}

/// Writes a literal value at a document path.
pub struct SetStep {
    pub path: String,
    pub value: Value,
}

impl BuildStep for SetStep {
    fn run(&self, _ctx: &StepContext, mut document: Document) -> Result<Document, StepFault> {
        document.set(&self.path, self.value.clone());
        Ok(document)
    }
}

/// Renders a template of `{dotted.path}` placeholders looked up in the
/// document and writes the result at a document path. Literal braces are
/// written as `{{` and `}}`.
pub struct FormatStep {
    pub path: String,
    pub template: String,
}

impl BuildStep for FormatStep {
    fn run(&self, _ctx: &StepContext, mut document: Document) -> Result<Document, StepFault> {
        let rendered = render(&self.template, &document)?;
        document.set(&self.path, Value::String(rendered));
        Ok(document)
    }
}

fn render(template: &str, document: &Document) -> Result<String, StepFault> {
    let mut out = String::new();
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let mut key = String::new();
                let mut closed = false;
                for inner in chars.by_ref() {
                    if inner == '}' {
                        closed = true;
                        break;
                    }
                    key.push(inner);
                }
                if !closed {
                    return Err(
                        format!("unterminated placeholder in template '{template}'").into()
                    );
                }
                let value = document
                    .get(&key)
                    .ok_or_else(|| format!("unknown placeholder '{{{key}}}'"))?;
                match value {
                    Value::String(s) => out.push_str(s),
                    other => out.push_str(&other.to_string()),
                }
            }
            other => out.push(other),
        }
    }
    Ok(out)
}
