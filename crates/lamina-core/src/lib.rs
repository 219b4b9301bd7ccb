//! Core document machinery for the Lamina build tool.
//!
//! This crate provides:
//! - The nested key/value [`Document`] tree that a build accumulates
//! - Deep merging of package contributions with conflict detection
//! - Bundling of module source files into the document
//! - A sandboxed module loader for requiring modules out of a finished
//!   document, including circular references

mod bundle;
mod document;
mod modules;

pub use bundle::{add_source, bundle, BundleError, SourceFile};
pub use document::{Document, MergeError};
pub use modules::{
    FnRuntime, JsonRuntime, ModuleCache, ModuleError, ModuleLoader, ModuleRuntime, ModuleScope,
    ModuleState,
};
