//! Component G: a periodic sweep that reconciles live pods against the DB's
//! container registry, deletes pods the DB has marked for destruction, and
//! wipes per-volume subdirectories on a shared persistent cache.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::db::ContainerRegistry;
use crate::k8s::{ExecIo, PodApi};
use crate::{Error, Result};

pub struct Reaper {
    worker_name: String,
    api: Arc<dyn PodApi>,
    registry: Arc<dyn ContainerRegistry>,
    config: Config,
}

impl Reaper {
    pub fn new(worker_name: String, api: Arc<dyn PodApi>, registry: Arc<dyn ContainerRegistry>, config: Config) -> Self {
        Self { worker_name, api, registry, config }
    }

    pub async fn run_once(&self, cancel: &CancellationToken) -> Result<()> {
        let label_selector = format!("worker={}{}", crate::pod_spec::WORKER_LABEL_PREFIX, self.worker_name);
        let pods = self.api.list_by_label(&label_selector).await?;

        let mut handles = HashSet::with_capacity(pods.len());
        let mut pod_name_by_handle = HashMap::with_capacity(pods.len());
        for pod in &pods {
            let handle = pod.labels.get("handle").cloned().unwrap_or_else(|| pod.name.clone());
            pod_name_by_handle.insert(handle.clone(), pod.name.clone());
            handles.insert(handle);
        }

        self.registry.update_containers_missing_since(&self.worker_name, &handles).await?;
        self.registry.destroy_containers(&self.worker_name, &handles).await?;

        let destroying = self.registry.find_destroying_containers(&self.worker_name).await?;
        for handle in destroying {
            let pod_name = pod_name_by_handle.get(&handle).cloned().unwrap_or(handle);
            match self.api.delete(&pod_name).await {
                Ok(()) | Err(Error::NotFound(_)) => {}
                Err(error) => return Err(error),
            }
        }

        if self.config.has_shared_cache() && !pods.is_empty() {
            self.clean_destroying_volumes(&pods, cancel).await?;
        }

        Ok(())
    }

    async fn clean_destroying_volumes(&self, pods: &[crate::k8s::PodSnapshot], cancel: &CancellationToken) -> Result<()> {
        let destroying = self.registry.get_destroying_volumes(&self.worker_name).await?;
        if destroying.is_empty() {
            return Ok(());
        }

        let Some(live_pod) = pods.iter().find(|pod| pod.phase == crate::k8s::PodPhase::Running) else {
            return Ok(());
        };

        let mut failed = Vec::new();
        for handle in destroying {
            if !is_safe_handle(&handle) {
                log::warn!("refusing to clean cache for unsafe volume handle {handle:?}");
                failed.push(handle);
                continue;
            }

            let target = format!("{}/{}", self.config.cache_base_path.trim_end_matches('/'), handle);
            let command = vec!["rm".to_owned(), "-rf".to_owned(), target];
            let io = ExecIo::none();
            let result = self
                .api
                .exec_in_pod(&live_pod.name, crate::pod_spec::MAIN_CONTAINER_NAME, command, io, false, cancel.clone())
                .await;

            if result.is_err() {
                failed.push(handle);
            }
        }

        self.registry.remove_destroying_volumes(&self.worker_name, &failed).await
    }
}

/// Rejects empty handles and anything that could escape the cache base path.
fn is_safe_handle(handle: &str) -> bool {
    !handle.is_empty() && !handle.contains('/') && !handle.contains("..")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{CreatedContainer, CreatingContainer, ContainerLookup, VolumeRow};
    use crate::k8s::testutil::{running_pod, FakePodApi};
    use serde_json::Value;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeRegistry {
        destroying_containers: Mutex<Vec<String>>,
        destroying_volumes: Mutex<Vec<String>>,
        removed_failed: Mutex<Vec<String>>,
        reported_handles: Mutex<Option<HashSet<String>>>,
    }

    #[async_trait::async_trait]
    impl ContainerRegistry for FakeRegistry {
        async fn find_container(&self, _owner: &str) -> Result<ContainerLookup> {
            Ok(ContainerLookup::None)
        }
        async fn create_container(&self, _owner: &str, _metadata: &Value) -> Result<CreatingContainer> {
            unreachable!("reaper never creates containers")
        }
        async fn mark_created(&self, creating: &CreatingContainer) -> Result<CreatedContainer> {
            Ok(CreatedContainer { handle: creating.handle.clone() })
        }
        async fn update_containers_missing_since(&self, _worker_name: &str, handles: &HashSet<String>) -> Result<()> {
            *self.reported_handles.lock().unwrap() = Some(handles.clone());
            Ok(())
        }
        async fn destroy_containers(&self, _worker_name: &str, _handles: &HashSet<String>) -> Result<()> {
            Ok(())
        }
        async fn find_destroying_containers(&self, _worker_name: &str) -> Result<Vec<String>> {
            Ok(self.destroying_containers.lock().unwrap().clone())
        }
        async fn find_container_by_handle(&self, _handle: &str) -> Result<Option<CreatedContainer>> {
            Ok(None)
        }
        async fn find_volume(&self, _handle: &str) -> Result<Option<VolumeRow>> {
            Ok(None)
        }
        async fn get_destroying_volumes(&self, _worker_name: &str) -> Result<Vec<String>> {
            Ok(self.destroying_volumes.lock().unwrap().clone())
        }
        async fn remove_destroying_volumes(&self, _worker_name: &str, failed_handles: &[String]) -> Result<()> {
            *self.removed_failed.lock().unwrap() = failed_handles.to_vec();
            Ok(())
        }
    }

    fn labeled_pod(name: &str, handle: Option<&str>) -> crate::k8s::PodSnapshot {
        let mut pod = running_pod(name);
        if let Some(handle) = handle {
            pod.labels.insert("handle".to_owned(), handle.to_owned());
        }
        pod
    }

    #[tokio::test]
    async fn deletes_by_handle_label_leaving_others_alone() {
        let api = Arc::new(FakePodApi::new());
        api.insert_pod(labeled_pod("readable-a", Some("uuid-1")));
        api.insert_pod(labeled_pod("readable-b", Some("uuid-2")));

        let registry = Arc::new(FakeRegistry::default());
        registry.destroying_containers.lock().unwrap().push("uuid-1".to_owned());

        let reaper = Reaper::new("w".to_owned(), api.clone(), registry.clone(), Config::default());
        reaper.run_once(&CancellationToken::new()).await.unwrap();

        assert!(api.get("readable-a").await.is_err());
        assert!(api.get("readable-b").await.is_ok());

        let reported = registry.reported_handles.lock().unwrap().clone().unwrap();
        assert_eq!(reported, HashSet::from(["uuid-1".to_owned(), "uuid-2".to_owned()]));
    }

    #[tokio::test]
    async fn second_sweep_with_same_destroying_set_is_a_no_op() {
        let api = Arc::new(FakePodApi::new());
        api.insert_pod(labeled_pod("readable-a", Some("uuid-1")));
        let registry = Arc::new(FakeRegistry::default());
        registry.destroying_containers.lock().unwrap().push("uuid-1".to_owned());

        let reaper = Reaper::new("w".to_owned(), api.clone(), registry, Config::default());
        reaper.run_once(&CancellationToken::new()).await.unwrap();
        reaper.run_once(&CancellationToken::new()).await.unwrap();
    }

    #[tokio::test]
    async fn unsafe_cache_handles_are_rejected_without_exec() {
        let api = Arc::new(FakePodApi::new());
        api.insert_pod(labeled_pod("readable-a", Some("uuid-1")));
        let registry = Arc::new(FakeRegistry::default());
        registry.destroying_volumes.lock().unwrap().push("../escape".to_owned());

        let mut config = Config::default();
        config.cache_volume_claim = "ci-cache".to_owned();
        config.cache_base_path = "/var/ci/cache".to_owned();

        let reaper = Reaper::new("w".to_owned(), api.clone(), registry.clone(), config);
        reaper.run_once(&CancellationToken::new()).await.unwrap();

        assert!(api.exec_calls().is_empty());
        assert_eq!(registry.removed_failed.lock().unwrap().clone(), vec!["../escape".to_owned()]);
    }

    #[tokio::test]
    async fn valid_cache_handle_execs_rm_in_a_live_pod() {
        let api = Arc::new(FakePodApi::new());
        api.insert_pod(labeled_pod("readable-a", Some("uuid-1")));
        let registry = Arc::new(FakeRegistry::default());
        registry.destroying_volumes.lock().unwrap().push("vol-1".to_owned());

        let mut config = Config::default();
        config.cache_volume_claim = "ci-cache".to_owned();
        config.cache_base_path = "/var/ci/cache".to_owned();

        let reaper = Reaper::new("w".to_owned(), api.clone(), registry.clone(), config);
        reaper.run_once(&CancellationToken::new()).await.unwrap();

        let calls = api.exec_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(
            calls[0].1,
            vec!["rm".to_owned(), "-rf".to_owned(), "/var/ci/cache/vol-1".to_owned()]
        );
        assert!(registry.removed_failed.lock().unwrap().is_empty());
    }
}
