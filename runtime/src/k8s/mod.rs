//! Everything that talks to the Kubernetes API server lives under this
//! module; see [`client::PodApi`] for the trait boundary the rest of the
//! crate programs against.

mod client;
mod diagnostics;
mod exec;
mod snapshot;
mod watch;

#[cfg(test)]
pub mod testutil;

pub use client::{K8sPodApi, PodApi};
pub use diagnostics::{emit as emit_diagnostics, PodDiagnostics};
pub use exec::{ExecError, ExecIo};
pub use snapshot::{ContainerState, ContainerStatus, PodCondition, PodPhase, PodSnapshot};
pub use watch::{PodEvent, PodWatch, PodWatcher, WatchError};

/// The annotation the Process writes on the pod once the exec's exit status
/// is known, so a subsequent `Run` against the same pod can recover it
/// without re-running the command (see the spec's pod-reuse fallback).
pub const EXIT_STATUS_ANNOTATION: &str = "ci.runtime/exit-status";
