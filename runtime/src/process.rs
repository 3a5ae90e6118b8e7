//! Component D: a running or completed command. Waits for pod readiness via
//! the watcher, runs the command via `ExecInPod`, reports exit status, and
//! writes diagnostics on failure. One logical type serves both the
//! freshly-created and re-attached (hijacked) mechanical modes.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

use crate::container::{PropertyWriter, EXIT_STATUS_PROPERTY};
use crate::k8s::{self, ExecError, ExecIo, PodApi, PodEvent, PodPhase, WatchError};
use crate::volume::Volume;
use crate::{Error, Result};

/// Transient-watch retry policy: tolerate this many *consecutive* errors from
/// the pod watcher before giving up, with linear backoff. The watcher already
/// absorbs most reconnect churn internally; this is a second, thinner layer
/// for whatever reaches `wait` regardless.
const MAX_CONSECUTIVE_WATCH_ERRORS: u32 = 3;
const WATCH_ERROR_BACKOFF_STEP: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Default)]
pub struct ProcessSpec {
    pub id: String,
    pub path: String,
    pub args: Vec<String>,
    pub dir: Option<String>,
    pub env: Vec<String>,
    pub tty: bool,
}

#[derive(Default)]
pub struct ProcessIo {
    pub stdin: Option<Pin<Box<dyn AsyncRead + Send>>>,
    pub stdout: Option<Pin<Box<dyn AsyncWrite + Send>>>,
    pub stderr: Option<Pin<Box<dyn AsyncWrite + Send>>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessResult {
    pub exit_status: i32,
}

enum Mode {
    /// The pause-pod mode: wait for Running, stream inputs, exec the command.
    Run {
        api: Arc<dyn PodApi>,
        properties: Arc<dyn PropertyWriter>,
        startup_timeout: Duration,
        spec: ProcessSpec,
        io: ProcessIo,
        mounts: Vec<Volume>,
    },
    /// Recovered via `Container::attach`; already has a terminal result.
    AlreadyExited { exit_status: i32 },
}

pub struct Process {
    id: String,
    pod_name: String,
    mode: Mode,
}

impl std::fmt::Debug for Process {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Process")
            .field("id", &self.id)
            .field("pod_name", &self.pod_name)
            .finish_non_exhaustive()
    }
}

impl Process {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: String,
        pod_name: String,
        api: Arc<dyn PodApi>,
        properties: Arc<dyn PropertyWriter>,
        startup_timeout: Duration,
        spec: ProcessSpec,
        io: ProcessIo,
        mounts: Vec<Volume>,
    ) -> Self {
        Self {
            id,
            pod_name,
            mode: Mode::Run { api, properties, startup_timeout, spec, io, mounts },
        }
    }

    pub fn already_exited(id: String, pod_name: String, exit_status: i32) -> Self {
        Self { id, pod_name, mode: Mode::AlreadyExited { exit_status } }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// `Wait(ctx) → Result{ExitStatus: int} | error`.
    pub async fn wait(self, cancel: CancellationToken) -> Result<ProcessResult> {
        match self.mode {
            Mode::AlreadyExited { exit_status } => Ok(ProcessResult { exit_status }),
            Mode::Run { api, properties, startup_timeout, spec, io, mounts } => {
                wait_for_pod_running(api.as_ref(), &self.pod_name, startup_timeout, &cancel).await?;

                stream_inputs(&mounts, &cancel).await?;

                let tty = spec.tty;
                let command = command_line(&spec);
                let exec_io = ExecIo { stdin: io.stdin, stdout: io.stdout, stderr: io.stderr };

                let exit_status = match api.exec_in_pod(&self.pod_name, "main", command, exec_io, tty, cancel).await {
                    Ok(()) => 0,
                    Err(ExecError::Exit { code }) => code,
                    Err(other) => return Err(Error::from(other)),
                };

                properties.set_property(EXIT_STATUS_PROPERTY, &exit_status.to_string());
                if let Err(error) = api.annotate_exit_status(&self.pod_name, exit_status).await {
                    log::warn!("failed to annotate pod {} with exit status: {error}", self.pod_name);
                }
                Ok(ProcessResult { exit_status })
            }
        }
    }
}

fn command_line(spec: &ProcessSpec) -> Vec<String> {
    let mut command = vec![spec.path.clone()];
    command.extend(spec.args.iter().cloned());
    command
}

/// Streams every input whose mount carries an artifact, in spec order,
/// before the command is dispatched. A streaming-input error aborts the
/// command dispatch entirely: no exec occurs.
async fn stream_inputs(mounts: &[Volume], cancel: &CancellationToken) -> Result<()> {
    for mount in mounts {
        let Some(artifact) = mount.artifact() else { continue };
        let bytes = artifact.stream_out(".", cancel.clone()).await?;
        let reader: Pin<Box<dyn AsyncRead + Send>> = Box::pin(std::io::Cursor::new(bytes));
        mount.stream_in(".", reader, cancel.clone()).await?;
    }
    Ok(())
}

/// Watches the pod via [`PodApi::watcher`] until it reaches Running, applying
/// the fast-fail classifications and startup timeout from the spec.
/// Diagnostics are written to `stderr` as a side effect of any fatal return.
async fn wait_for_pod_running(
    api: &dyn PodApi,
    pod_name: &str,
    startup_timeout: Duration,
    cancel: &CancellationToken,
) -> Result<()> {
    let deadline = tokio::time::Instant::now() + startup_timeout;
    let mut watcher = api.watcher(pod_name);
    let mut consecutive_errors = 0u32;

    loop {
        if tokio::time::Instant::now() >= deadline {
            if let Ok(snapshot) = api.get(pod_name).await {
                k8s::emit_diagnostics(&mut std::io::stderr(), &snapshot, "timed out waiting for pod to start");
            }
            return Err(Error::PodFatal("timed out waiting for pod to start".to_owned()));
        }

        let event = tokio::select! {
            result = watcher.next(cancel) => result,
            _ = cancel.cancelled() => return Err(Error::Cancelled),
        };

        let snapshot = match event {
            Ok(PodEvent::Applied(snapshot) | PodEvent::Deleted(snapshot)) => {
                consecutive_errors = 0;
                snapshot
            }
            Err(WatchError::Cancelled) => return Err(Error::Cancelled),
            Err(WatchError::Transient(source)) => {
                consecutive_errors += 1;
                if consecutive_errors > MAX_CONSECUTIVE_WATCH_ERRORS {
                    return Err(Error::PodFatal("too many consecutive errors watching pod state".to_owned()));
                }
                log::warn!("transient error watching pod {pod_name}: {source}");
                sleep_with_cancel(WATCH_ERROR_BACKOFF_STEP * consecutive_errors, cancel).await?;
                continue;
            }
        };

        if let Some(reason) = fast_fail_reason(&snapshot) {
            emit_and_fail(&snapshot, &reason);
            return Err(Error::PodFatal(reason));
        }

        if snapshot.phase == PodPhase::Running {
            return Ok(());
        }

        if matches!(snapshot.phase, PodPhase::Failed | PodPhase::Succeeded) {
            let reason = format!("pod reached phase {} before the command ran", snapshot.phase);
            emit_and_fail(&snapshot, &reason);
            return Err(Error::PodFatal(reason));
        }
    }
}

fn fast_fail_reason(snapshot: &k8s::PodSnapshot) -> Option<String> {
    if let Some(reason) = snapshot.image_pull_failure() {
        return Some(reason.to_owned());
    }
    if snapshot.is_evicted() {
        return Some("Evicted".to_owned());
    }
    if snapshot.is_unschedulable() {
        return Some("Unschedulable".to_owned());
    }
    None
}

fn emit_and_fail(snapshot: &k8s::PodSnapshot, reason: &str) {
    k8s::emit_diagnostics(&mut std::io::stderr(), snapshot, reason);
}

async fn sleep_with_cancel(duration: Duration, cancel: &CancellationToken) -> Result<()> {
    tokio::select! {
        _ = tokio::time::sleep(duration) => Ok(()),
        _ = cancel.cancelled() => Err(Error::Cancelled),
    }
}
