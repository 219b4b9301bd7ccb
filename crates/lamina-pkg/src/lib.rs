//! Package loading and build orchestration for Lamina.
//!
//! This crate provides:
//! - Parsing and validation of `lamina.toml` manifests
//! - Package resolution across search paths
//! - Depth-first package loading with a per-build registry
//! - Pre- and post-merge build-step scheduling
//! - Deployment sinks for the finished document

mod load;
mod manifest;
mod resolve;
mod sink;
mod steps;

pub use load::{BuildContext, LoadError, LoadedPackage, Loader, Options};
pub use manifest::{Manifest, ManifestError, Package, StepKind, MANIFEST_FILE};
pub use resolve::{resolve, ResolveError};
pub use sink::{DeploymentSink, JsonFileSink, NullSink, SinkError};
pub use steps::{
    step_for, BuildManager, BuildStep, FnStep, FormatStep, LogObserver, ModulesStep, NullObserver,
    RunOutcome, SetStep, StepContext, StepError, StepFault, StepId, StepObserver, StepSet,
    StepStatus,
};
