//! Component E: translates an abstract spec into a pod, creating it lazily on
//! first `run`, and tracks the process-local properties the engine reads
//! back on re-attach.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use crate::db::ContainerHandle;
use crate::k8s::PodApi;
use crate::process::{Process, ProcessIo, ProcessSpec};
use crate::volume::Volume;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerType {
    Task,
    Get,
    Put,
    Check,
}

impl ContainerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerType::Task => "task",
            ContainerType::Get => "get",
            ContainerType::Put => "put",
            ContainerType::Check => "check",
        }
    }
}

#[derive(Debug, Clone)]
pub struct InputMount {
    pub destination_path: String,
    /// An artifact source the input streams in from before the command runs.
    /// `None` means the mount exists with nothing to stream (a stub).
    pub artifact: Option<Arc<dyn crate::volume::ArtifactSource>>,
}

#[derive(Debug, Clone)]
pub struct CacheMount {
    pub handle: String,
    pub path: String,
}

/// Immutable once attached to a [`Container`].
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub image_ref: String,
    pub resource_type: String,
    pub container_type: ContainerType,
    pub privileged: bool,
    pub dir: String,
    pub env: Vec<String>,
    pub inputs: Vec<InputMount>,
    pub outputs: BTreeMap<String, String>,
    pub caches: Vec<CacheMount>,
    pub cpu_millis: Option<i64>,
    pub memory_bytes: Option<i64>,
}

/// The well-known property key the exit status is recorded under.
pub const EXIT_STATUS_PROPERTY: &str = "exit-status";

/// The one capability `Process` needs back from its owning `Container`: a
/// place to record exit status. Kept narrow so the two don't hold a cyclic
/// reference to each other's full type.
pub trait PropertyWriter: Send + Sync {
    fn set_property(&self, name: &str, value: &str);
}

pub struct Container {
    handle: ContainerHandle,
    worker_name: String,
    spec: Option<ContainerSpec>,
    api: Arc<dyn PodApi>,
    config: crate::config::Config,
    properties: Mutex<HashMap<String, String>>,
    mounts: Vec<Volume>,
    pod_created: Mutex<bool>,
}

impl Container {
    pub fn new(
        handle: ContainerHandle,
        worker_name: String,
        spec: ContainerSpec,
        api: Arc<dyn PodApi>,
        config: crate::config::Config,
        mounts: Vec<Volume>,
    ) -> Self {
        Self {
            handle,
            worker_name,
            spec: Some(spec),
            api,
            config,
            properties: Mutex::new(HashMap::new()),
            mounts,
            pod_created: Mutex::new(false),
        }
    }

    /// Reconstructs a Container for a handle whose spec the DB doesn't carry
    /// (re-attach after a restart). `run` is unavailable on the result — the
    /// pod, if one exists, is assumed already created — but `attach` works.
    pub fn from_handle(
        handle: ContainerHandle,
        worker_name: String,
        api: Arc<dyn PodApi>,
        config: crate::config::Config,
    ) -> Self {
        Self {
            handle,
            worker_name,
            spec: None,
            api,
            config,
            properties: Mutex::new(HashMap::new()),
            mounts: Vec::new(),
            pod_created: Mutex::new(true),
        }
    }

    pub fn handle(&self) -> &ContainerHandle {
        &self.handle
    }

    pub fn properties(&self) -> HashMap<String, String> {
        self.properties.lock().unwrap().clone()
    }

    /// `Run(ctx, processSpec, io) → Process`. Derives the process id, creates
    /// the pod if it doesn't already exist, binds every mount in the volume
    /// list to the pod name, and returns a [`Process`] over the result.
    pub async fn run(self: &Arc<Self>, process_spec: ProcessSpec, io: ProcessIo) -> Result<Process> {
        let pod_name = self.handle.0.clone();

        let already_created = *self.pod_created.lock().unwrap();
        if !already_created {
            match self.api.get(&pod_name).await {
                Ok(_) => {}
                Err(Error::NotFound(_)) => self.create_pod(&pod_name).await?,
                Err(error) => return Err(error),
            }
            *self.pod_created.lock().unwrap() = true;
        }

        for volume in &self.mounts {
            volume.set_pod_name(pod_name.clone());
        }

        let process_id = if process_spec.id.is_empty() {
            self.handle.0.clone()
        } else {
            process_spec.id.clone()
        };

        Ok(Process::new(
            process_id,
            pod_name,
            Arc::clone(&self.api),
            Arc::clone(self) as Arc<dyn PropertyWriter>,
            self.config.pod_startup_timeout,
            process_spec,
            io,
            self.mounts.clone(),
        ))
    }

    /// `Attach(ctx, processID, io)`: recovers an in-flight or completed
    /// process without re-running the command. Checks the in-process
    /// property map first, falling back to the pod's `exit-status`
    /// annotation — the persistent source of truth across process-manager
    /// restarts, when the map has been wiped.
    pub async fn attach(&self, process_id: String, _io: ProcessIo) -> Result<Process> {
        if let Some(status) = self.properties.lock().unwrap().get(EXIT_STATUS_PROPERTY) {
            let code: i32 = status.parse().map_err(|_| Error::Other("corrupt exit-status property".into()))?;
            return Ok(Process::already_exited(process_id, self.handle.0.clone(), code));
        }

        let snapshot = self.api.get(&self.handle.0).await?;
        if let Some(code) = snapshot.exit_status_annotation() {
            self.set_property(EXIT_STATUS_PROPERTY, &code.to_string());
            return Ok(Process::already_exited(process_id, self.handle.0.clone(), code));
        }

        Err(Error::NotFound(format!(
            "no completion status for process {process_id} on container {}",
            self.handle
        )))
    }

    async fn create_pod(&self, pod_name: &str) -> Result<()> {
        let spec = self
            .spec
            .as_ref()
            .ok_or_else(|| Error::Other("container has no spec; looked up by handle for attach only".into()))?;
        let pod = crate::pod_spec::build_pause_pod(pod_name, &self.worker_name, spec, &self.config)
            .map_err(|error| Error::Other(Box::new(error)))?;
        let manifest = serde_json::to_value(&pod).map_err(|error| Error::Other(Box::new(error)))?;
        self.api.create(manifest).await?;
        Ok(())
    }
}

impl PropertyWriter for Container {
    fn set_property(&self, name: &str, value: &str) {
        self.properties.lock().unwrap().insert(name.to_owned(), value.to_owned());
    }
}
