//! The configuration surface consumed by the runtime (see the spec's external
//! interfaces section). Loading a YAML file into this struct is provided as a
//! convenience; discovering *which* file to load, merging command-line flags, and
//! wiring up logging are the embedding CLI's job, not the core's.

use std::{collections::HashMap, path::Path, time::Duration};

use serde::{Deserialize, Serialize};

fn default_namespace() -> String {
    "default".to_owned()
}

const fn default_pod_startup_timeout() -> Duration {
    Duration::from_secs(5 * 60)
}

/// The resource-type name -> image defaults baked into the binary, overridable per
/// [`Config::resource_type_images`]. Mirrors the canonical resource images used
/// across the CI ecosystem.
pub fn default_resource_type_images() -> HashMap<String, String> {
    [
        ("git", "concourse/git-resource"),
        ("time", "concourse/time-resource"),
        ("registry-image", "concourse/registry-image-resource"),
        ("s3", "concourse/s3-resource"),
        ("docker-image", "concourse/docker-image-resource"),
    ]
    .into_iter()
    .map(|(name, image)| (name.to_owned(), format!("{image}:latest")))
    .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// The namespace the worker operates in. All Kubernetes API calls the runtime
    /// makes are scoped to this single namespace.
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Path to a kubeconfig file. Empty means "use the in-cluster config".
    #[serde(default)]
    pub kubeconfig_path: String,

    /// How long `Process::wait` will wait for a pod to reach `Running` before
    /// failing with a timeout.
    #[serde(default = "default_pod_startup_timeout", with = "duration_seconds")]
    pub pod_startup_timeout: Duration,

    /// Overrides/extends the default base-resource-type name -> image map.
    #[serde(default)]
    pub resource_type_images: HashMap<String, String>,

    /// Secret names referenced as `imagePullSecrets` on every pod this worker
    /// creates.
    #[serde(default)]
    pub image_pull_secrets: Vec<String>,

    /// Service account name set on every pod this worker creates. Empty uses the
    /// namespace's default service account.
    #[serde(default)]
    pub service_account: String,

    /// PVC claim name backing the shared cache. Empty means caches are emptyDir
    /// (not shared across pods).
    #[serde(default)]
    pub cache_volume_claim: String,

    /// Mount path of the shared cache volume, and the prefix under which
    /// per-cache-handle subdirectories live.
    #[serde(default)]
    pub cache_base_path: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            kubeconfig_path: String::new(),
            pod_startup_timeout: default_pod_startup_timeout(),
            resource_type_images: HashMap::new(),
            image_pull_secrets: Vec::new(),
            service_account: String::new(),
            cache_volume_claim: String::new(),
            cache_base_path: String::new(),
        }
    }
}

impl Config {
    pub fn from_yaml_str(input: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(input)
    }

    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|error| crate::Error::Other(Box::new(error)))?;
        Self::from_yaml_str(&contents).map_err(|error| crate::Error::Other(Box::new(error)))
    }

    /// Returns whether the shared persistent cache is configured (PVC + base
    /// path). The Reaper only attempts cache cleanup when this is true.
    pub fn has_shared_cache(&self) -> bool {
        !self.cache_volume_claim.is_empty() && !self.cache_base_path.is_empty()
    }
}

mod duration_seconds {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}
