//! Component F: the entry point the pipeline engine calls into. Deduplicates
//! logical containers against the registry, owns one Kubernetes namespace,
//! and produces [`Container`]s and their [`Volume`] mount lists from specs.

use std::sync::Arc;

use serde_json::Value;

use crate::config::Config;
use crate::container::{Container, ContainerSpec};
use crate::db::{ContainerHandle, ContainerLookup, ContainerRegistry};
use crate::k8s::PodApi;
use crate::volume::Volume;
use crate::Result;

pub struct Worker {
    name: String,
    api: Arc<dyn PodApi>,
    registry: Arc<dyn ContainerRegistry>,
    config: Config,
}

impl Worker {
    pub fn new(name: String, api: Arc<dyn PodApi>, registry: Arc<dyn ContainerRegistry>, config: Config) -> Self {
        Self { name, api, registry, config }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `FindOrCreateContainer(ctx, owner, metadata, spec, delegate) →
    /// (Container, mounts)`.
    ///
    /// `delegate` is the executor the returned mounts stream through; `None`
    /// produces stub volumes (accepted as no-ops) rather than ones bound to a
    /// live pod, matching callers that only need a placeholder mount list.
    pub async fn find_or_create_container(
        &self,
        owner: &str,
        metadata: &Value,
        spec: ContainerSpec,
        delegate: Option<Arc<dyn PodApi>>,
    ) -> Result<(Arc<Container>, Vec<Volume>)> {
        let handle = match self.registry.find_container(owner).await? {
            ContainerLookup::None => self.registry.create_container(owner, metadata).await?.handle,
            ContainerLookup::Creating(creating) => self.registry.mark_created(&creating).await?.handle,
            ContainerLookup::Created(created) => created.handle,
        };

        let mounts = build_mounts(&handle, &self.name, &spec, delegate.as_ref());

        let container = Arc::new(Container::new(
            handle,
            self.name.clone(),
            spec,
            Arc::clone(&self.api),
            self.config.clone(),
            mounts.clone(),
        ));

        Ok((container, mounts))
    }

    /// `LookupContainer(ctx, handle) → (Container, found)`. Succeeds whether
    /// or not the pod has been created yet — the DB row is authoritative.
    /// The registry only carries the handle, not the original spec, so the
    /// returned Container supports `attach` but not `run`.
    pub async fn lookup_container(&self, handle: &str) -> Result<Option<Arc<Container>>> {
        let Some(created) = self.registry.find_container_by_handle(handle).await? else {
            return Ok(None);
        };
        Ok(Some(Arc::new(Container::from_handle(
            created.handle,
            self.name.clone(),
            Arc::clone(&self.api),
            self.config.clone(),
        ))))
    }

    /// `LookupVolume(ctx, handle) → (Volume, found)`. For cache-backed rows,
    /// wraps the mount path under the configured shared-cache base path.
    pub async fn lookup_volume(&self, handle: &str) -> Result<Option<Volume>> {
        let Some(row) = self.registry.find_volume(handle).await? else {
            return Ok(None);
        };

        let mount_path = if row.is_cache {
            format!("{}/{}", self.config.cache_base_path.trim_end_matches('/'), row.handle)
        } else {
            row.mount_path.clone()
        };

        let volume = Volume::new(
            row.handle.clone(),
            row.worker_name.clone(),
            row.container_name.clone(),
            mount_path,
            Arc::clone(&self.api),
        );

        if let Some(pod_name) = row.pod_name {
            volume.set_pod_name(pod_name);
        }

        Ok(Some(volume))
    }
}

/// One Volume per input, output, and cache path, in the same order
/// [`crate::pod_spec::build_pause_pod`] lays out mount points in, so a
/// caller zipping mounts against `spec.inputs`/`spec.outputs`/`spec.caches`
/// sees a consistent order.
fn build_mounts(
    handle: &ContainerHandle,
    worker_name: &str,
    spec: &ContainerSpec,
    delegate: Option<&Arc<dyn PodApi>>,
) -> Vec<Volume> {
    let mut mounts = Vec::with_capacity(spec.inputs.len() + spec.outputs.len() + spec.caches.len());

    for input in &spec.inputs {
        let mut volume = new_mount(handle, worker_name, &input.destination_path, delegate);
        if let Some(artifact) = input.artifact.clone() {
            volume = volume.with_artifact(artifact);
        }
        mounts.push(volume);
    }

    for path in spec.outputs.values() {
        mounts.push(new_mount(handle, worker_name, path, delegate));
    }

    for cache in &spec.caches {
        mounts.push(new_mount(handle, worker_name, &cache.path, delegate));
    }

    mounts
}

fn new_mount(
    handle: &ContainerHandle,
    worker_name: &str,
    mount_path: &str,
    delegate: Option<&Arc<dyn PodApi>>,
) -> Volume {
    match delegate {
        Some(api) => Volume::new(
            handle.0.clone(),
            worker_name.to_owned(),
            crate::pod_spec::MAIN_CONTAINER_NAME.to_owned(),
            mount_path.to_owned(),
            Arc::clone(api),
        ),
        None => Volume::stub(
            handle.0.clone(),
            worker_name.to_owned(),
            crate::pod_spec::MAIN_CONTAINER_NAME.to_owned(),
            mount_path.to_owned(),
        ),
    }
}
