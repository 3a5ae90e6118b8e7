//! A lightweight domain view over a Kubernetes Pod, converted from the raw
//! `k8s-openapi` type at the [`super::PodApi`] boundary. Keeping this separate
//! from `k8s_openapi::api::core::v1::Pod` means the fast-fail classification
//! logic in [`crate::process`] never has to deal with the raw API's pervasive
//! `Option`-of-`Option` shape, and it gives the diagnostic block in
//! [`super::diagnostics`] a stable `Display` impl to target.

use std::{collections::BTreeMap, fmt};

use k8s_openapi::api::core::v1::Pod as RawPod;

pub const IMAGE_PULL_FAILURE_REASONS: &[&str] = &[
    "ImagePullBackOff",
    "ErrImagePull",
    "CrashLoopBackOff",
    "InvalidImageName",
    "CreateContainerConfigError",
];

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl From<Option<&str>> for PodPhase {
    fn from(value: Option<&str>) -> Self {
        match value {
            Some("Pending") => PodPhase::Pending,
            Some("Running") => PodPhase::Running,
            Some("Succeeded") => PodPhase::Succeeded,
            Some("Failed") => PodPhase::Failed,
            _ => PodPhase::Unknown,
        }
    }
}

impl fmt::Display for PodPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PodPhase::Pending => "Pending",
            PodPhase::Running => "Running",
            PodPhase::Succeeded => "Succeeded",
            PodPhase::Failed => "Failed",
            PodPhase::Unknown => "Unknown",
        })
    }
}

#[derive(Debug, Clone)]
pub struct PodCondition {
    pub type_: String,
    pub status: String,
    pub reason: Option<String>,
    pub message: Option<String>,
}

#[derive(Debug, Clone)]
pub enum ContainerState {
    Waiting { reason: Option<String>, message: Option<String> },
    Running,
    Terminated { exit_code: i32, reason: Option<String>, message: Option<String> },
}

impl ContainerState {
    pub fn state_name(&self) -> &'static str {
        match self {
            ContainerState::Waiting { .. } => "waiting",
            ContainerState::Running => "running",
            ContainerState::Terminated { .. } => "terminated",
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            ContainerState::Waiting { reason, .. } | ContainerState::Terminated { reason, .. } => {
                reason.as_deref()
            }
            ContainerState::Running => None,
        }
    }

    pub fn message(&self) -> Option<&str> {
        match self {
            ContainerState::Waiting { message, .. } | ContainerState::Terminated { message, .. } => {
                message.as_deref()
            }
            ContainerState::Running => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ContainerStatus {
    pub name: String,
    pub image: String,
    pub state: Option<ContainerState>,
}

impl ContainerStatus {
    fn cannot_pull_image(&self) -> bool {
        let Some(ContainerState::Waiting { reason: Some(reason), .. }) = &self.state else {
            return false;
        };
        IMAGE_PULL_FAILURE_REASONS.contains(&reason.as_str())
    }
}

/// A point-in-time view of a pod, as returned by [`super::PodApi::get`] or
/// delivered through [`super::PodWatcher::next`].
#[derive(Debug, Clone)]
pub struct PodSnapshot {
    pub name: String,
    pub namespace: String,
    pub resource_version: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub phase: PodPhase,
    pub reason: Option<String>,
    pub message: Option<String>,
    pub conditions: Vec<PodCondition>,
    pub container_statuses: Vec<ContainerStatus>,
}

impl PodSnapshot {
    pub fn is_unschedulable(&self) -> bool {
        self.conditions
            .iter()
            .any(|condition| condition.type_ == "PodScheduled" && condition.reason.as_deref() == Some("Unschedulable"))
    }

    pub fn is_evicted(&self) -> bool {
        self.phase == PodPhase::Failed && self.reason.as_deref() == Some("Evicted")
    }

    /// Returns the first terminal image-pull/crashloop reason observed on any
    /// container, if any.
    pub fn image_pull_failure(&self) -> Option<&str> {
        self.container_statuses
            .iter()
            .find(|status| status.cannot_pull_image())
            .and_then(|status| status.state.as_ref())
            .and_then(ContainerState::reason)
    }

    pub fn main_container(&self, name: &str) -> Option<&ContainerStatus> {
        self.container_statuses.iter().find(|status| status.name == name)
    }

    pub fn exit_status_annotation(&self) -> Option<i32> {
        self.annotations.get(crate::k8s::EXIT_STATUS_ANNOTATION)?.parse().ok()
    }
}

impl From<RawPod> for PodSnapshot {
    fn from(pod: RawPod) -> Self {
        let metadata = pod.metadata;
        let status = pod.status.unwrap_or_default();

        PodSnapshot {
            name: metadata.name.unwrap_or_default(),
            namespace: metadata.namespace.unwrap_or_default(),
            resource_version: metadata.resource_version,
            labels: metadata.labels.unwrap_or_default().into_iter().collect(),
            annotations: metadata.annotations.unwrap_or_default().into_iter().collect(),
            phase: PodPhase::from(status.phase.as_deref()),
            reason: status.reason,
            message: status.message,
            conditions: status
                .conditions
                .unwrap_or_default()
                .into_iter()
                .map(|condition| PodCondition {
                    type_: condition.type_,
                    status: condition.status,
                    reason: condition.reason,
                    message: condition.message,
                })
                .collect(),
            container_statuses: status
                .container_statuses
                .unwrap_or_default()
                .into_iter()
                .map(|status| ContainerStatus {
                    name: status.name,
                    image: status.image,
                    state: status.state.map(|state| {
                        if let Some(terminated) = state.terminated {
                            ContainerState::Terminated {
                                exit_code: terminated.exit_code,
                                reason: terminated.reason,
                                message: terminated.message,
                            }
                        } else if let Some(waiting) = state.waiting {
                            ContainerState::Waiting {
                                reason: waiting.reason,
                                message: waiting.message,
                            }
                        } else {
                            ContainerState::Running
                        }
                    }),
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot_with_condition(type_: &str, status: &str, reason: Option<&str>) -> PodSnapshot {
        PodSnapshot {
            name: "p".to_owned(),
            namespace: "ns".to_owned(),
            resource_version: None,
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            phase: PodPhase::Pending,
            reason: None,
            message: None,
            conditions: vec![PodCondition {
                type_: type_.to_owned(),
                status: status.to_owned(),
                reason: reason.map(str::to_owned),
                message: None,
            }],
            container_statuses: vec![],
        }
    }

    #[test]
    fn detects_unschedulable() {
        let snapshot = snapshot_with_condition("PodScheduled", "False", Some("Unschedulable"));
        assert!(snapshot.is_unschedulable());
    }

    #[test]
    fn schedulable_pod_is_not_unschedulable() {
        let snapshot = snapshot_with_condition("PodScheduled", "True", None);
        assert!(!snapshot.is_unschedulable());
    }

    #[test]
    fn detects_image_pull_backoff() {
        let mut snapshot = snapshot_with_condition("PodScheduled", "True", None);
        snapshot.container_statuses.push(ContainerStatus {
            name: "main".to_owned(),
            image: "ubuntu:22.04".to_owned(),
            state: Some(ContainerState::Waiting {
                reason: Some("ImagePullBackOff".to_owned()),
                message: Some("back-off pulling image".to_owned()),
            }),
        });
        assert_eq!(snapshot.image_pull_failure(), Some("ImagePullBackOff"));
    }

    #[test]
    fn detects_eviction() {
        let mut snapshot = snapshot_with_condition("PodScheduled", "True", None);
        snapshot.phase = PodPhase::Failed;
        snapshot.reason = Some("Evicted".to_owned());
        assert!(snapshot.is_evicted());
    }
}
