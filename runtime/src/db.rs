//! The container/volume database registry is an external collaborator (see the
//! spec's non-goals): a stable-handle allocator and state tracker the core reads
//! from and writes to, but never implements. This module only declares the seam.

use std::collections::HashSet;

use async_trait::async_trait;
use serde_json::Value;

use crate::Result;

/// The DB-assigned stable identifier for a logical container; doubles as the pod
/// name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContainerHandle(pub String);

impl std::fmt::Display for ContainerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A DB row for a container that has been allocated a handle but not yet marked
/// created (the pod may or may not exist yet).
#[derive(Debug, Clone)]
pub struct CreatingContainer {
    pub handle: ContainerHandle,
}

/// A DB row for a container that has completed the creating -> created
/// transition.
#[derive(Debug, Clone)]
pub struct CreatedContainer {
    pub handle: ContainerHandle,
}

/// The three outcomes of looking a container up by its owner key.
pub enum ContainerLookup {
    None,
    Creating(CreatingContainer),
    Created(CreatedContainer),
}

/// A DB row describing a volume, independent of whether its pod currently
/// exists.
#[derive(Debug, Clone)]
pub struct VolumeRow {
    pub handle: String,
    pub worker_name: String,
    pub container_name: String,
    pub mount_path: String,
    pub pod_name: Option<String>,
    /// Present for volumes backed by the shared cache PVC rather than a
    /// container-local emptyDir.
    pub is_cache: bool,
}

/// The DB operations the core consumes, per the spec's external interfaces
/// section. A production implementation backs this with a SQL database; the
/// core only ever sees this trait.
#[async_trait]
pub trait ContainerRegistry: Send + Sync {
    async fn find_container(&self, owner: &str) -> Result<ContainerLookup>;

    async fn create_container(&self, owner: &str, metadata: &Value) -> Result<CreatingContainer>;

    /// Transitions a creating row to created. Takes the row by value/reference
    /// rather than letting rows carry a registry handle of their own.
    async fn mark_created(&self, creating: &CreatingContainer) -> Result<CreatedContainer>;

    async fn update_containers_missing_since(
        &self,
        worker_name: &str,
        handles: &HashSet<String>,
    ) -> Result<()>;

    async fn destroy_containers(&self, worker_name: &str, handles: &HashSet<String>) -> Result<()>;

    async fn find_destroying_containers(&self, worker_name: &str) -> Result<Vec<String>>;

    /// Looks a created container row up directly by handle, for re-attach
    /// paths that don't know the original owner key.
    async fn find_container_by_handle(&self, handle: &str) -> Result<Option<CreatedContainer>>;

    async fn find_volume(&self, handle: &str) -> Result<Option<VolumeRow>>;

    async fn get_destroying_volumes(&self, worker_name: &str) -> Result<Vec<String>>;

    /// Removes volumes that were cleaned up successfully, and keeps the ones
    /// listed as failed in the destroying state for the next sweep to retry.
    async fn remove_destroying_volumes(&self, worker_name: &str, failed_handles: &[String]) -> Result<()>;
}
