//! Formats the structured "Pod Failure Diagnostics" block written to the
//! caller's stderr whenever a pod is classified fatal (image pull, crashloop,
//! eviction, unschedulable, or startup timeout). Writing to stderr is a side
//! effect of [`crate::process::Process::wait`]; this module only formats.

use std::fmt;
use std::io::Write;

use super::snapshot::PodSnapshot;

pub struct PodDiagnostics<'a> {
    pub snapshot: &'a PodSnapshot,
    pub reason: &'a str,
}

impl fmt::Display for PodDiagnostics<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let snapshot = self.snapshot;

        writeln!(f, "Pod Failure Diagnostics")?;
        writeln!(f, "  Pod: {}/{}", snapshot.namespace, snapshot.name)?;
        writeln!(f, "  Reason: {}", self.reason)?;
        write!(f, "  Phase: {}", snapshot.phase)?;
        if let Some(reason) = snapshot.reason.as_deref() {
            write!(f, " ({reason})")?;
        }
        writeln!(f)?;
        if let Some(message) = snapshot.message.as_deref() {
            writeln!(f, "  Message: {message}")?;
        }

        if !snapshot.conditions.is_empty() {
            writeln!(f, "  Conditions:")?;
        }
        for condition in &snapshot.conditions {
            if condition.status == "True" {
                continue;
            }
            write!(f, "    {}={}", condition.type_, condition.status)?;
            if let Some(reason) = condition.reason.as_deref() {
                write!(f, " reason={reason}")?;
            }
            if let Some(message) = condition.message.as_deref() {
                write!(f, " message={message}")?;
            }
            writeln!(f)?;
        }

        if !snapshot.container_statuses.is_empty() {
            writeln!(f, "  Container Statuses:")?;
        }
        for status in &snapshot.container_statuses {
            let state_name = status.state.as_ref().map(|s| s.state_name()).unwrap_or("unknown");
            write!(
                f,
                "    container {:?} using image {:?} is {state_name}",
                status.name, status.image
            )?;
            if let Some(state) = &status.state {
                if let Some(reason) = state.reason() {
                    write!(f, " because {reason}")?;
                }
                if let Some(message) = state.message() {
                    write!(f, ": {message}")?;
                }
            }
            writeln!(f)?;
        }

        Ok(())
    }
}

/// Writes the diagnostic block to `sink` (the caller's stderr). Errors writing
/// diagnostics are logged, not propagated: the caller already has a fatal
/// error of their own to return.
pub fn emit(sink: &mut dyn Write, snapshot: &PodSnapshot, reason: &str) {
    let block = PodDiagnostics { snapshot, reason };
    if let Err(error) = write!(sink, "{block}") {
        log::warn!("failed to write pod diagnostics: {error}");
    }
}
