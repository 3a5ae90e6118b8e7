//! Builds the pause-pod manifest for a [`crate::container::ContainerSpec`].
//! Field layout mirrors the job/pod-template construction the teacher's
//! kubernetes execution backend used, adapted from a Job's `PodTemplateSpec`
//! down to a bare `Pod` since the pause-pod pattern has no batch semantics to
//! offer.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Container, EmptyDirVolumeSource, EnvVar, Pod, PodSecurityContext, PodSpec, ResourceRequirements,
    SecurityContext, Volume as RawVolume, VolumeMount, PersistentVolumeClaimVolumeSource,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::config::Config;
use crate::container::ContainerSpec;
use crate::image;

pub const MAIN_CONTAINER_NAME: &str = "main";
pub const WORKER_LABEL_PREFIX: &str = "k8s-";
const PAUSE_COMMAND: &[&str] = &["sh", "-c", "trap 'exit 0' TERM; sleep 86400 & wait"];

/// Error building a pod manifest: currently only image resolution can fail.
#[derive(Debug)]
pub struct BuildError(pub image::InvalidImageReference);

impl std::fmt::Display for BuildError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid image reference: {}", self.0)
    }
}

impl std::error::Error for BuildError {}

/// Builds the pause pod for `spec`, named `handle`, owned by `worker_name`.
pub fn build_pause_pod(
    handle: &str,
    worker_name: &str,
    spec: &ContainerSpec,
    config: &Config,
) -> Result<Pod, BuildError> {
    let image = image::resolve_image(&spec.image_ref, &spec.resource_type, &config.resource_type_images)
        .map_err(BuildError)?;

    let mut labels = BTreeMap::new();
    labels.insert("worker".to_owned(), format!("{WORKER_LABEL_PREFIX}{worker_name}"));
    labels.insert("type".to_owned(), spec.container_type.as_str().to_owned());
    labels.insert("handle".to_owned(), handle.to_owned());

    let (volumes, volume_mounts) = build_volumes(spec, config);

    let security_context = if spec.privileged {
        Some(SecurityContext {
            privileged: Some(true),
            ..Default::default()
        })
    } else {
        Some(SecurityContext {
            allow_privilege_escalation: Some(false),
            ..Default::default()
        })
    };

    let resources = build_resources(spec);

    let env = spec
        .env
        .iter()
        .filter_map(|entry| split_env(entry))
        .map(|(name, value)| EnvVar {
            name,
            value: Some(value),
            ..Default::default()
        })
        .collect();

    Ok(Pod {
        metadata: ObjectMeta {
            name: Some(handle.to_owned()),
            labels: Some(labels),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![Container {
                name: MAIN_CONTAINER_NAME.to_owned(),
                image: Some(image),
                command: Some(PAUSE_COMMAND.iter().map(|s| s.to_string()).collect()),
                working_dir: non_empty(&spec.dir),
                env: Some(env),
                volume_mounts: Some(volume_mounts),
                resources,
                security_context,
                ..Default::default()
            }],
            volumes: Some(volumes),
            restart_policy: Some("Never".to_owned()),
            security_context: Some(PodSecurityContext::default()),
            image_pull_secrets: non_empty_secrets(&config.image_pull_secrets),
            service_account_name: non_empty(&config.service_account),
            ..Default::default()
        }),
        ..Default::default()
    })
}

fn split_env(entry: &str) -> Option<(String, String)> {
    let (name, value) = entry.split_once('=')?;
    Some((name.to_owned(), value.to_owned()))
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_owned())
}

fn non_empty_secrets(
    secrets: &[String],
) -> Option<Vec<k8s_openapi::api::core::v1::LocalObjectReference>> {
    (!secrets.is_empty()).then(|| {
        secrets
            .iter()
            .map(|name| k8s_openapi::api::core::v1::LocalObjectReference { name: name.clone() })
            .collect()
    })
}

fn build_resources(spec: &ContainerSpec) -> Option<ResourceRequirements> {
    let (cpu_millis, memory_bytes) = (spec.cpu_millis?, spec.memory_bytes?);

    let mut quantities = BTreeMap::new();
    quantities.insert("cpu".to_owned(), Quantity(format!("{cpu_millis}m")));
    quantities.insert("memory".to_owned(), Quantity(memory_bytes.to_string()));

    Some(ResourceRequirements {
        limits: Some(quantities.clone()),
        requests: Some(quantities),
        ..Default::default()
    })
}

/// Builds volumes/mounts in the deterministic order the spec mandates:
/// inputs (spec order), outputs (sorted by name), then caches (spec order).
fn build_volumes(spec: &ContainerSpec, config: &Config) -> (Vec<RawVolume>, Vec<VolumeMount>) {
    let mut volumes = Vec::new();
    let mut mounts = Vec::new();

    for (index, input) in spec.inputs.iter().enumerate() {
        let name = format!("input-{index}");
        volumes.push(empty_dir(&name));
        mounts.push(VolumeMount {
            name,
            mount_path: input.destination_path.clone(),
            ..Default::default()
        });
    }

    let mut outputs: Vec<(&String, &String)> = spec.outputs.iter().collect();
    outputs.sort_by_key(|(name, _)| name.as_str());
    for (name, path) in outputs {
        let volume_name = format!("output-{name}");
        volumes.push(empty_dir(&volume_name));
        mounts.push(VolumeMount {
            name: volume_name,
            mount_path: path.clone(),
            ..Default::default()
        });
    }

    if !spec.caches.is_empty() {
        if config.has_shared_cache() {
            volumes.push(RawVolume {
                name: "cache".to_owned(),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: config.cache_volume_claim.clone(),
                    ..Default::default()
                }),
                ..Default::default()
            });
            for cache in &spec.caches {
                mounts.push(VolumeMount {
                    name: "cache".to_owned(),
                    mount_path: cache.path.clone(),
                    sub_path: Some(cache.handle.clone()),
                    ..Default::default()
                });
            }
        } else {
            for (index, cache) in spec.caches.iter().enumerate() {
                let name = format!("cache-{index}");
                volumes.push(empty_dir(&name));
                mounts.push(VolumeMount {
                    name,
                    mount_path: cache.path.clone(),
                    ..Default::default()
                });
            }
        }
    }

    (volumes, mounts)
}

fn empty_dir(name: &str) -> RawVolume {
    RawVolume {
        name: name.to_owned(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{CacheMount, ContainerType};

    fn minimal_spec() -> ContainerSpec {
        ContainerSpec {
            image_ref: "docker:///ubuntu:22.04".to_owned(),
            resource_type: "task".to_owned(),
            container_type: ContainerType::Task,
            privileged: false,
            dir: "/work".to_owned(),
            env: vec![],
            inputs: vec![],
            outputs: Default::default(),
            caches: vec![],
            cpu_millis: None,
            memory_bytes: None,
        }
    }

    #[test]
    fn pause_command_traps_sigterm() {
        let config = Config::default();
        let pod = build_pause_pod("task-abc", "w", &minimal_spec(), &config).unwrap();
        let container = &pod.spec.unwrap().containers[0];
        assert_eq!(
            container.command.as_ref().unwrap(),
            &vec!["sh".to_owned(), "-c".to_owned(), "trap 'exit 0' TERM; sleep 86400 & wait".to_owned()]
        );
    }

    #[test]
    fn resolves_docker_scheme_image() {
        let config = Config::default();
        let pod = build_pause_pod("task-abc", "w", &minimal_spec(), &config).unwrap();
        let container = &pod.spec.unwrap().containers[0];
        assert_eq!(container.image.as_deref(), Some("ubuntu:22.04"));
    }

    #[test]
    fn labels_include_worker_and_type() {
        let config = Config::default();
        let pod = build_pause_pod("task-abc", "w", &minimal_spec(), &config).unwrap();
        let labels = pod.metadata.labels.unwrap();
        assert_eq!(labels.get("worker"), Some(&"k8s-w".to_owned()));
        assert_eq!(labels.get("type"), Some(&"task".to_owned()));
    }

    #[test]
    fn outputs_are_mounted_in_sorted_order() {
        let mut spec = minimal_spec();
        spec.outputs.insert("b".to_owned(), "/b".to_owned());
        spec.outputs.insert("a".to_owned(), "/a".to_owned());
        let config = Config::default();
        let pod = build_pause_pod("task-abc", "w", &spec, &config).unwrap();
        let mounts = pod.spec.unwrap().containers[0].volume_mounts.clone().unwrap();
        assert_eq!(mounts[0].mount_path, "/a");
        assert_eq!(mounts[1].mount_path, "/b");
    }

    #[test]
    fn caches_use_pvc_subpath_when_configured() {
        let mut config = Config::default();
        config.cache_volume_claim = "ci-cache".to_owned();
        config.cache_base_path = "/var/ci/cache".to_owned();
        let mut spec = minimal_spec();
        spec.caches.push(CacheMount { handle: "h1".to_owned(), path: "/cache".to_owned() });
        let pod = build_pause_pod("task-abc", "w", &spec, &config).unwrap();
        let pod_spec = pod.spec.unwrap();
        let mount = pod_spec.containers[0].volume_mounts.as_ref().unwrap().last().unwrap();
        assert_eq!(mount.sub_path.as_deref(), Some("h1"));
    }

    #[test]
    fn rejects_invalid_image() {
        let mut spec = minimal_spec();
        spec.image_ref = "not a valid ref!".to_owned();
        let config = Config::default();
        assert!(build_pause_pod("task-abc", "w", &spec, &config).is_err());
    }
}
