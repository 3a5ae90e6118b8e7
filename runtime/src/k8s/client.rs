//! The `PodApi` trait is the one seam through which the rest of the crate
//! touches Kubernetes. Everything above this module works in terms of
//! [`PodSnapshot`] and plain Rust types; only `K8sPodApi` and its siblings in
//! this module import `kube`/`k8s_openapi` directly. This keeps
//! [`crate::process`], [`crate::volume`], and [`crate::worker`] unit-testable
//! against [`crate::k8s::testutil::FakePodApi`] without a live cluster.

use std::pin::Pin;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod as RawPod;
use kube::{
    api::{Api, AttachParams, DeleteParams, ListParams, Patch, PatchParams, PostParams},
    Client,
};
use tokio::io::AsyncWrite;
use tokio_util::sync::CancellationToken;

use super::exec::{self, ExecError, ExecIo};
use super::snapshot::PodSnapshot;
use super::watch::{PodWatch, PodWatcher};
use crate::Error;

/// Everything above the `k8s` module drives Kubernetes through this trait.
/// Production code gets [`K8sPodApi`]; tests get
/// [`super::testutil::FakePodApi`].
#[async_trait]
pub trait PodApi: std::fmt::Debug + Send + Sync {
    async fn get(&self, name: &str) -> Result<PodSnapshot, Error>;

    /// Creates a pod from a pre-built manifest (see [`crate::pod_spec`]).
    /// Returns the created snapshot. Treats "already exists" as success and
    /// fetches the existing pod instead, per the spec's pause-pod reuse rule.
    async fn create(&self, manifest: serde_json::Value) -> Result<PodSnapshot, Error>;

    async fn delete(&self, name: &str) -> Result<(), Error>;

    async fn list_by_label(&self, selector: &str) -> Result<Vec<PodSnapshot>, Error>;

    /// A restartable stream of state snapshots for one named pod. Boxed
    /// rather than returning [`PodWatcher`] directly so
    /// [`super::testutil::FakePodApi`] can hand back an in-memory equivalent.
    fn watcher(&self, pod_name: &str) -> Box<dyn PodWatch>;

    #[allow(clippy::too_many_arguments)]
    async fn exec_in_pod(
        &self,
        pod: &str,
        container: &str,
        command: Vec<String>,
        io: ExecIo,
        tty: bool,
        cancel: CancellationToken,
    ) -> Result<(), ExecError>;

    /// Records the command's exit status on the pod as
    /// [`super::EXIT_STATUS_ANNOTATION`], so a later `attach` can recover it
    /// without the in-process property map. Best-effort from the caller's
    /// point of view: a failure here is logged, not propagated, since the
    /// in-process map already has the authoritative value for this run.
    async fn annotate_exit_status(&self, pod: &str, exit_status: i32) -> Result<(), Error>;
}

pub struct K8sPodApi {
    client: Client,
    namespace: String,
    pods: Api<RawPod>,
}

impl std::fmt::Debug for K8sPodApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("K8sPodApi")
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

impl K8sPodApi {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            pods: Api::namespaced(client.clone(), namespace),
            client,
            namespace: namespace.to_owned(),
        }
    }
}

#[async_trait]
impl PodApi for K8sPodApi {
    async fn get(&self, name: &str) -> Result<PodSnapshot, Error> {
        match self.pods.get(name).await {
            Ok(pod) => Ok(PodSnapshot::from(pod)),
            Err(kube::Error::Api(response)) if response.code == 404 => {
                Err(Error::NotFound(format!("pod {name}")))
            }
            Err(error) => Err(Error::Transport(Box::new(error))),
        }
    }

    async fn create(&self, manifest: serde_json::Value) -> Result<PodSnapshot, Error> {
        let pod: RawPod =
            serde_json::from_value(manifest).map_err(|error| Error::Other(Box::new(error)))?;
        let name = pod.metadata.name.clone().unwrap_or_default();

        match self.pods.create(&PostParams::default(), &pod).await {
            Ok(created) => Ok(PodSnapshot::from(created)),
            Err(kube::Error::Api(response)) if response.code == 409 => self.get(&name).await,
            Err(error) => Err(Error::Transport(Box::new(error))),
        }
    }

    async fn delete(&self, name: &str) -> Result<(), Error> {
        match self.pods.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(response)) if response.code == 404 => Ok(()),
            Err(error) => Err(Error::Transport(Box::new(error))),
        }
    }

    async fn list_by_label(&self, selector: &str) -> Result<Vec<PodSnapshot>, Error> {
        let list = self
            .pods
            .list(&ListParams::default().labels(selector))
            .await
            .map_err(|error| Error::Transport(Box::new(error)))?;
        Ok(list.items.into_iter().map(PodSnapshot::from).collect())
    }

    fn watcher(&self, pod_name: &str) -> Box<dyn PodWatch> {
        Box::new(PodWatcher::new(self.client.clone(), &self.namespace, pod_name))
    }

    async fn exec_in_pod(
        &self,
        pod: &str,
        container: &str,
        command: Vec<String>,
        io: ExecIo,
        tty: bool,
        cancel: CancellationToken,
    ) -> Result<(), ExecError> {
        let io = ensure_at_least_one_stream(io);

        let params = AttachParams {
            container: Some(container.to_owned()),
            stdin: io.stdin.is_some(),
            stdout: io.stdout.is_some() || io.stderr.is_some(),
            stderr: io.stderr.is_some() && !tty,
            tty,
            ..AttachParams::default()
        };

        let attached = self
            .pods
            .exec(pod, command, &params)
            .await
            .map_err(|error| ExecError::Transport(Box::new(error)))?;

        exec::drive(attached, io, cancel).await
    }

    async fn annotate_exit_status(&self, pod: &str, exit_status: i32) -> Result<(), Error> {
        let patch = serde_json::json!({
            "metadata": {
                "annotations": {
                    (super::EXIT_STATUS_ANNOTATION): exit_status.to_string(),
                }
            }
        });
        self.pods
            .patch(pod, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|error| Error::Transport(Box::new(error)))?;
        Ok(())
    }
}

/// Per the spec: if all of stdin/stdout/stderr are absent, stdout is wired to
/// a discard sink so the exec request is still well-formed.
fn ensure_at_least_one_stream(mut io: ExecIo) -> ExecIo {
    if !io.any_enabled() {
        io.stdout = Some(discard_sink());
    }
    io
}

fn discard_sink() -> Pin<Box<dyn AsyncWrite + Send>> {
    Box::pin(tokio::io::sink())
}
