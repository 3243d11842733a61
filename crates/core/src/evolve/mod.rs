//! Self-patching: diagnose the dominant failure, request a source patch,
//! gate it, verify it in a disposable sandbox and persist it.
//!
//! Applying a patch only rewrites the persisted source tree. The running
//! process is never reloaded; an external supervisor exports the tree
//! (`evoloop export-source <dir>`), rebuilds and restarts.

pub mod classify;
pub mod engine;
pub mod gate;
pub mod patch;
pub mod sandbox;

pub use engine::{PatchOutcome, SelfPatchEngine};
pub use sandbox::{DockerSandbox, PatchSandbox, ProcessSandbox};
