//! Kubernetes-backed execution runtime: pause-pod lifecycle, pod watching,
//! volume streaming, process wait, container lifecycle, worker entry point,
//! and the reaper GC sweep. See `README`/design docs for the component
//! breakdown; this crate implements components A-G.

pub mod config;
pub mod container;
pub mod db;
mod error;
pub mod image;
pub mod k8s;
pub mod pod_spec;
pub mod process;
pub mod reaper;
pub mod volume;
pub mod worker;

pub use error::{Error, Result};
