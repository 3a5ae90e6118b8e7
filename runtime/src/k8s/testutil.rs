//! A scriptable [`PodApi`] fake so [`crate::process`] and [`crate::worker`]
//! can be unit tested without a cluster.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{ExecError, ExecIo, PodApi, PodEvent, PodPhase, PodSnapshot, PodWatch, WatchError};
use crate::Error;

#[derive(Default, Debug)]
pub struct FakePodApi {
    pods: Arc<Mutex<HashMap<String, PodSnapshot>>>,
    exec_log: Mutex<Vec<(String, Vec<String>)>>,
    exec_results: Mutex<VecDeque<Result<(), ExecError>>>,
    /// Bytes handed to the next exec call whose `io.stdout` is enabled, in
    /// call order. Lets a test script what a `tar cf` exec "produces" without
    /// a real container to tar.
    stdout_script: Mutex<VecDeque<Vec<u8>>>,
    /// Whatever each exec call with `io.stdin` enabled read to completion, in
    /// call order. Lets a test assert what a `tar xf` exec received.
    stdin_log: Mutex<Vec<Vec<u8>>>,
}

/// [`FakePodApi::watcher`]'s return value: reports whatever the current
/// in-memory snapshot for `pod_name` is on every call, rather than genuinely
/// waiting for a change. Good enough for tests, which only ever care about
/// the pod's state at the moment `wait_for_pod_running` looks.
struct FakeWatcher {
    pods: Arc<Mutex<HashMap<String, PodSnapshot>>>,
    pod_name: String,
}

#[async_trait]
impl PodWatch for FakeWatcher {
    async fn next(&mut self, _cancel: &CancellationToken) -> Result<PodEvent, WatchError> {
        match self.pods.lock().unwrap().get(&self.pod_name).cloned() {
            Some(snapshot) => Ok(PodEvent::Applied(snapshot)),
            None => Err(WatchError::Transient(Box::new(Error::NotFound(format!(
                "pod {}",
                self.pod_name
            ))))),
        }
    }
}

pub fn running_pod(name: &str) -> PodSnapshot {
    PodSnapshot {
        name: name.to_owned(),
        namespace: "default".to_owned(),
        resource_version: Some("1".to_owned()),
        labels: BTreeMap::new(),
        annotations: BTreeMap::new(),
        phase: PodPhase::Running,
        reason: None,
        message: None,
        conditions: vec![],
        container_statuses: vec![],
    }
}

pub fn pending_pod(name: &str) -> PodSnapshot {
    let mut pod = running_pod(name);
    pod.phase = PodPhase::Pending;
    pod
}

impl FakePodApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_pod(&self, pod: PodSnapshot) {
        self.pods.lock().unwrap().insert(pod.name.clone(), pod);
    }

    pub fn push_exec_result(&self, result: Result<(), ExecError>) {
        self.exec_results.lock().unwrap().push_back(result);
    }

    pub fn exec_calls(&self) -> Vec<(String, Vec<String>)> {
        self.exec_log.lock().unwrap().clone()
    }

    pub fn push_stdout_bytes(&self, bytes: Vec<u8>) {
        self.stdout_script.lock().unwrap().push_back(bytes);
    }

    pub fn stdin_log(&self) -> Vec<Vec<u8>> {
        self.stdin_log.lock().unwrap().clone()
    }
}

#[async_trait]
impl PodApi for FakePodApi {
    async fn get(&self, name: &str) -> Result<PodSnapshot, Error> {
        self.pods
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("pod {name}")))
    }

    async fn create(&self, manifest: serde_json::Value) -> Result<PodSnapshot, Error> {
        let name = manifest["metadata"]["name"]
            .as_str()
            .unwrap_or_default()
            .to_owned();
        let mut pods = self.pods.lock().unwrap();
        let pod = pods.entry(name.clone()).or_insert_with(|| pending_pod(&name));
        Ok(pod.clone())
    }

    async fn delete(&self, name: &str) -> Result<(), Error> {
        self.pods.lock().unwrap().remove(name);
        Ok(())
    }

    async fn list_by_label(&self, _selector: &str) -> Result<Vec<PodSnapshot>, Error> {
        Ok(self.pods.lock().unwrap().values().cloned().collect())
    }

    fn watcher(&self, pod_name: &str) -> Box<dyn PodWatch> {
        Box::new(FakeWatcher { pods: Arc::clone(&self.pods), pod_name: pod_name.to_owned() })
    }

    async fn exec_in_pod(
        &self,
        pod: &str,
        _container: &str,
        command: Vec<String>,
        io: ExecIo,
        _tty: bool,
        _cancel: CancellationToken,
    ) -> Result<(), ExecError> {
        self.exec_log.lock().unwrap().push((pod.to_owned(), command));

        if let Some(mut stdin) = io.stdin {
            let mut received = Vec::new();
            let _ = tokio::io::AsyncReadExt::read_to_end(&mut stdin, &mut received).await;
            self.stdin_log.lock().unwrap().push(received);
        }

        if let Some(mut stdout) = io.stdout {
            let bytes = self.stdout_script.lock().unwrap().pop_front().unwrap_or_default();
            let _ = tokio::io::AsyncWriteExt::write_all(&mut stdout, &bytes).await;
        }

        self.exec_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(()))
    }

    async fn annotate_exit_status(&self, pod: &str, exit_status: i32) -> Result<(), Error> {
        if let Some(snapshot) = self.pods.lock().unwrap().get_mut(pod) {
            snapshot
                .annotations
                .insert(crate::k8s::EXIT_STATUS_ANNOTATION.to_owned(), exit_status.to_string());
        }
        Ok(())
    }
}
