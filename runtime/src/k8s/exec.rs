//! Bidirectional stream plumbing for `ExecInPod`, built on top of
//! `kube::Api::exec`'s [`kube::api::AttachedProcess`]. This is the one place in
//! the k8s module that's allowed to juggle raw `kube` types directly; the
//! `PodApi` trait (see [`super::client`]) hides them from everything above it.

use std::pin::Pin;

use kube::api::AttachedProcess;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

/// The error vocabulary for a single `ExecInPod` call.
#[derive(Debug)]
pub enum ExecError {
    /// The remote command ran and exited non-zero.
    Exit { code: i32 },
    /// The attach/stream machinery itself failed.
    Transport(Box<dyn std::error::Error + Send + Sync + 'static>),
    /// The calling context was cancelled while the exec was in flight.
    Cancelled,
}

impl std::fmt::Display for ExecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecError::Exit { code } => write!(f, "command exited with status {code}"),
            ExecError::Transport(source) => write!(f, "exec transport error: {source}"),
            ExecError::Cancelled => f.write_str("exec cancelled"),
        }
    }
}

impl std::error::Error for ExecError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ExecError::Transport(source) => Some(source.as_ref()),
            ExecError::Exit { .. } | ExecError::Cancelled => None,
        }
    }
}

/// The caller-supplied I/O for an exec call. Per the spec: when at least one
/// of stdin/stdout/stderr is absent, at least one stream must still be
/// enabled; callers that pass all three as `None` get a discard sink attached
/// to stdout so the underlying protocol still has a stream to open.
#[derive(Default)]
pub struct ExecIo {
    pub stdin: Option<Pin<Box<dyn AsyncRead + Send>>>,
    pub stdout: Option<Pin<Box<dyn AsyncWrite + Send>>>,
    pub stderr: Option<Pin<Box<dyn AsyncWrite + Send>>>,
}

impl ExecIo {
    pub fn none() -> Self {
        Self::default()
    }

    /// Whether any stream is enabled; if not, the caller should fall back to
    /// a discard stdout so the exec request itself is still well-formed.
    pub fn any_enabled(&self) -> bool {
        self.stdin.is_some() || self.stdout.is_some() || self.stderr.is_some()
    }
}

/// Pumps `reader` into the remote process's stdin until EOF, then drops the
/// writer so the remote side observes EOF on its own stdin.
async fn pump_stdin(
    mut reader: Pin<Box<dyn AsyncRead + Send>>,
    mut writer: impl AsyncWrite + Unpin,
) -> std::io::Result<()> {
    tokio::io::copy(&mut reader, &mut writer).await?;
    writer.shutdown().await
}

/// Pumps a remote stream (stdout or stderr) into `writer` until EOF.
async fn pump_output(
    mut reader: impl AsyncRead + Unpin,
    mut writer: Pin<Box<dyn AsyncWrite + Send>>,
) -> std::io::Result<()> {
    tokio::io::copy(&mut reader, &mut writer).await?;
    Ok(())
}

/// Drains a remote stream to nowhere, used when the caller did not ask for
/// stdout/stderr but the underlying protocol still delivers one.
async fn drain(mut reader: impl AsyncRead + Unpin) -> std::io::Result<()> {
    let mut buf = [0u8; 8192];
    loop {
        if reader.read(&mut buf).await? == 0 {
            return Ok(());
        }
    }
}

/// Drives an already-opened `AttachedProcess` to completion: forwards
/// `io.stdin`/`io.stdout`/`io.stderr` against the corresponding remote
/// streams, drains any remote stream the caller didn't ask for, and resolves
/// the exit status. Returns `Ok(())` for a zero exit, `Err(Exit{code})` for a
/// non-zero one.
pub async fn drive(
    mut attached: AttachedProcess,
    io: ExecIo,
    cancel: CancellationToken,
) -> Result<(), ExecError> {
    let stdin_task = match (io.stdin, attached.stdin()) {
        (Some(reader), Some(writer)) => {
            Some(tokio::spawn(async move { pump_stdin(reader, writer).await }))
        }
        _ => None,
    };

    let stdout_task = match attached.stdout() {
        Some(remote) => {
            if let Some(writer) = io.stdout {
                Some(tokio::spawn(async move { pump_output(remote, writer).await }))
            } else {
                Some(tokio::spawn(async move { drain(remote).await }))
            }
        }
        None => None,
    };

    let stderr_task = match attached.stderr() {
        Some(remote) => {
            if let Some(writer) = io.stderr {
                Some(tokio::spawn(async move { pump_output(remote, writer).await }))
            } else {
                Some(tokio::spawn(async move { drain(remote).await }))
            }
        }
        None => None,
    };

    let join_all = async move {
        if let Some(task) = stdin_task {
            let _ = task.await;
        }
        if let Some(task) = stdout_task {
            let _ = task.await;
        }
        if let Some(task) = stderr_task {
            let _ = task.await;
        }
    };

    tokio::select! {
        _ = join_all => {}
        _ = cancel.cancelled() => return Err(ExecError::Cancelled),
    }

    let exit_code = match attached.take_status() {
        Some(status_future) => tokio::select! {
            status = status_future => status.and_then(exit_code_of_status).unwrap_or(0),
            _ = cancel.cancelled() => return Err(ExecError::Cancelled),
        },
        None => 0,
    };

    if exit_code == 0 {
        Ok(())
    } else {
        Err(ExecError::Exit { code: exit_code })
    }
}

/// Kubernetes reports a non-zero exit through the status object's
/// `details.causes`, not a dedicated field: `reason: "NonZeroExitCode"` with a
/// cause `{reason: "ExitCode", message: "<code>"}`.
fn exit_code_of_status(status: k8s_openapi::apimachinery::pkg::apis::meta::v1::Status) -> Option<i32> {
    if status.status.as_deref() == Some("Success") {
        return Some(0);
    }
    status
        .details
        .as_ref()
        .and_then(|details| details.causes.as_ref())
        .and_then(|causes| causes.iter().find(|cause| cause.reason.as_deref() == Some("ExitCode")))
        .and_then(|cause| cause.message.as_deref())
        .and_then(|message| message.parse().ok())
        .or(Some(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exec_error_display_includes_exit_code() {
        let error = ExecError::Exit { code: 42 };
        assert_eq!(error.to_string(), "command exited with status 42");
    }

    #[test]
    fn empty_exec_io_has_nothing_enabled() {
        assert!(!ExecIo::none().any_enabled());
    }
}
