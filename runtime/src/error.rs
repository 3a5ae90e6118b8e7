use std::fmt;

/// The error vocabulary raised by the runtime, per the error-kind taxonomy in the
/// design: not-found, transient, pod-fatal, transport, cancellation, and DB errors.
/// Exit-nonzero is deliberately absent here — it is carried as an ordinary
/// [`crate::process::ProcessResult`], never as an `Error`.
#[derive(Debug)]
pub enum Error {
    /// A pod or DB row absent where one was expected.
    NotFound(String),

    /// Intermittent cluster failure exhausted its retry budget.
    Transient(Box<dyn std::error::Error + Send + Sync + 'static>),

    /// Image pull, crashloop, eviction, unschedulable, or startup timeout. The
    /// diagnostic block has already been written to the caller's stderr by the
    /// time this is returned.
    PodFatal(String),

    /// An exec or watch stream failed during an in-flight operation.
    Transport(Box<dyn std::error::Error + Send + Sync + 'static>),

    /// The calling context was cancelled.
    Cancelled,

    /// The container/volume database registry returned an error.
    Db(Box<dyn std::error::Error + Send + Sync + 'static>),

    /// Anything else, wrapped verbatim.
    Other(Box<dyn std::error::Error + Send + Sync + 'static>),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NotFound(what) => write!(f, "not found: {what}"),
            Error::Transient(source) => write!(f, "transient API error: {source}"),
            Error::PodFatal(message) => f.write_str(message),
            Error::Transport(source) => write!(f, "transport error: {source}"),
            Error::Cancelled => f.write_str("cancelled"),
            Error::Db(source) => write!(f, "container registry error: {source}"),
            Error::Other(source) => source.fmt(f),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Transient(source) | Error::Transport(source) | Error::Db(source) | Error::Other(source) => {
                Some(source.as_ref())
            }
            Error::NotFound(_) | Error::PodFatal(_) | Error::Cancelled => None,
        }
    }
}

impl From<crate::k8s::ExecError> for Error {
    fn from(value: crate::k8s::ExecError) -> Self {
        match value {
            crate::k8s::ExecError::Exit { code } => {
                // Callers that care about the exit code unwrap `ExecError` themselves
                // before it would ever reach here; reaching this arm means the code
                // treated a non-zero exit as a hard failure.
                Error::Other(format!("command exited with status {code}").into())
            }
            crate::k8s::ExecError::Transport(source) => Error::Transport(source),
            crate::k8s::ExecError::Cancelled => Error::Cancelled,
        }
    }
}

impl From<crate::k8s::WatchError> for Error {
    fn from(value: crate::k8s::WatchError) -> Self {
        match value {
            crate::k8s::WatchError::Transient(source) => Error::Transient(source),
            crate::k8s::WatchError::Cancelled => Error::Cancelled,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
