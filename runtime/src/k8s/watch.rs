//! A reconnecting pod watcher. Kubernetes watch streams end on their own —
//! apiserver restarts, load balancer idle timeouts, resource-version windows
//! expiring — so staying watched means reconnecting with the last-seen
//! resource version. After a run of consecutive reconnect failures we fall
//! back to a single-shot read rather than erroring out entirely, so `next`
//! keeps making forward progress even when the watch endpoint itself is
//! unhealthy.

use std::pin::Pin;

use async_trait::async_trait;
use backoff::{backoff::Backoff, ExponentialBackoff};
use futures::{Stream, StreamExt};
use k8s_openapi::api::core::v1::Pod as RawPod;
use kube::{
    api::{Api, WatchEvent as RawWatchEvent, WatchParams},
    Client,
};
use tokio_util::sync::CancellationToken;

use super::snapshot::PodSnapshot;

/// The seam [`crate::process`] programs against: one named pod's state,
/// observed as a sequence of events rather than re-polled from scratch.
/// Production code gets a [`PodWatcher`]; tests get
/// [`super::testutil::FakePodApi`]'s in-memory equivalent.
#[async_trait]
pub trait PodWatch: Send {
    async fn next(&mut self, cancel: &CancellationToken) -> Result<PodEvent, WatchError>;
}

/// Reconnect attempts that fail consecutively before `next` falls back to a
/// single-shot read.
const RECONNECT_FALLBACK_THRESHOLD: u32 = 3;

#[derive(Debug)]
pub enum WatchError {
    /// A single-shot fallback read itself failed.
    Transient(Box<dyn std::error::Error + Send + Sync + 'static>),
    /// The calling context was cancelled.
    Cancelled,
}

impl std::fmt::Display for WatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WatchError::Transient(source) => write!(f, "pod watch failed: {source}"),
            WatchError::Cancelled => f.write_str("pod watch cancelled"),
        }
    }
}

impl std::error::Error for WatchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WatchError::Transient(source) => Some(source.as_ref()),
            WatchError::Cancelled => None,
        }
    }
}

/// A change to the watched pod, normalized out of `kube`'s raw
/// `WatchEvent<Pod>` so nothing above this module needs `k8s_openapi`.
#[derive(Debug, Clone)]
pub enum PodEvent {
    Applied(PodSnapshot),
    Deleted(PodSnapshot),
}

type TransportError = Box<dyn std::error::Error + Send + Sync + 'static>;
type EventStream = Pin<Box<dyn Stream<Item = Result<RawEvent, TransportError>> + Send>>;

/// One item off a live watch stream with kube's wire-level `WatchEvent`
/// already normalized away: an add/modify collapses to `Applied`, and a
/// bookmark (no pod change, just a resume point) becomes a bare resource
/// version to remember.
enum RawEvent {
    Applied(RawPod),
    Deleted(RawPod),
    ResourceVersionAdvance(String),
}

/// The two cluster calls a watcher needs: a single-shot read to seed state,
/// and a resumable watch stream. Exists so the reconnect/fallback state
/// machine in [`Watcher`] can be driven by a scripted fake in tests instead
/// of a live `kube::Api`.
#[async_trait]
trait Transport: Send {
    async fn get(&self, pod_name: &str) -> Result<RawPod, TransportError>;

    async fn watch(&self, pod_name: &str, resource_version: &str) -> Result<EventStream, TransportError>;
}

struct KubeTransport {
    api: Api<RawPod>,
}

#[async_trait]
impl Transport for KubeTransport {
    async fn get(&self, pod_name: &str) -> Result<RawPod, TransportError> {
        self.api.get(pod_name).await.map_err(|error| Box::new(error) as TransportError)
    }

    async fn watch(&self, pod_name: &str, resource_version: &str) -> Result<EventStream, TransportError> {
        let watch_params = WatchParams::default().fields(&format!("metadata.name={pod_name}"));
        let stream = self
            .api
            .watch(&watch_params, resource_version)
            .await
            .map_err(|error| Box::new(error) as TransportError)?;

        Ok(Box::pin(stream.map(|item| match item {
            Ok(RawWatchEvent::Added(pod) | RawWatchEvent::Modified(pod)) => Ok(RawEvent::Applied(pod)),
            Ok(RawWatchEvent::Deleted(pod)) => Ok(RawEvent::Deleted(pod)),
            Ok(RawWatchEvent::Bookmark(bookmark)) => {
                Ok(RawEvent::ResourceVersionAdvance(bookmark.metadata.resource_version))
            }
            Ok(RawWatchEvent::Error(response)) => Err(Box::new(kube::Error::Api(response)) as TransportError),
            Err(error) => Err(Box::new(error) as TransportError),
        })))
    }
}

/// Watches a single named pod by field selector, over a pluggable
/// [`Transport`]. A field selector rather than a label selector keeps the
/// watch scoped to exactly the pod the caller cares about.
struct Watcher<T: Transport> {
    transport: T,
    pod_name: String,
    last_resource_version: Option<String>,
    backoff: ExponentialBackoff,
    consecutive_reconnect_failures: u32,
    seeded: bool,
    active_stream: Option<EventStream>,
}

impl<T: Transport> Watcher<T> {
    fn new(transport: T, pod_name: &str) -> Self {
        Self {
            transport,
            pod_name: pod_name.to_owned(),
            last_resource_version: None,
            backoff: ExponentialBackoff::default(),
            consecutive_reconnect_failures: 0,
            seeded: false,
            active_stream: None,
        }
    }

    /// The first call always does a single-shot read, to seed state even
    /// before any change event has occurred. Every subsequent call reads
    /// from the long-lived watch stream, transparently reconnecting it on
    /// failure, and drops to a single-shot read once reconnects have failed
    /// [`RECONNECT_FALLBACK_THRESHOLD`] times in a row.
    async fn next(&mut self, cancel: &CancellationToken) -> Result<PodEvent, WatchError> {
        if !self.seeded {
            self.seeded = true;
            return self.single_shot_read(cancel).await;
        }

        loop {
            if self.active_stream.is_none() {
                if self.consecutive_reconnect_failures >= RECONNECT_FALLBACK_THRESHOLD {
                    log::warn!(
                        "pod watch for {} failed to reconnect {} times in a row, falling back to a single-shot read",
                        self.pod_name,
                        self.consecutive_reconnect_failures
                    );
                    self.consecutive_reconnect_failures = 0;
                    return self.single_shot_read(cancel).await;
                }
                self.reconnect(cancel).await?;
                continue;
            }

            match self.drain_one(cancel).await {
                DrainOutcome::Event(event) => {
                    self.consecutive_reconnect_failures = 0;
                    return Ok(event);
                }
                DrainOutcome::StreamEnded => {
                    self.active_stream = None;
                    continue;
                }
                DrainOutcome::Cancelled => return Err(WatchError::Cancelled),
                DrainOutcome::Error(error) => {
                    log::warn!("pod watch stream for {} failed: {error}", self.pod_name);
                    self.active_stream = None;
                    continue;
                }
            }
        }
    }

    async fn single_shot_read(&mut self, cancel: &CancellationToken) -> Result<PodEvent, WatchError> {
        let result = tokio::select! {
            result = self.transport.get(&self.pod_name) => result,
            _ = cancel.cancelled() => return Err(WatchError::Cancelled),
        };
        match result {
            Ok(pod) => {
                self.remember_resource_version(&pod);
                Ok(PodEvent::Applied(PodSnapshot::from(pod)))
            }
            Err(error) => Err(WatchError::Transient(error)),
        }
    }

    async fn reconnect(&mut self, cancel: &CancellationToken) -> Result<(), WatchError> {
        let resource_version = self.last_resource_version.clone().unwrap_or_else(|| "0".to_owned());
        let watch_result = tokio::select! {
            result = self.transport.watch(&self.pod_name, &resource_version) => result,
            _ = cancel.cancelled() => return Err(WatchError::Cancelled),
        };

        match watch_result {
            Ok(stream) => {
                self.active_stream = Some(stream);
                self.backoff.reset();
                Ok(())
            }
            Err(error) => {
                self.consecutive_reconnect_failures += 1;
                let delay = self.backoff.next_backoff().unwrap_or(std::time::Duration::from_secs(1));
                log::warn!(
                    "pod watch reconnect for {} failed ({}/{}): {error}",
                    self.pod_name,
                    self.consecutive_reconnect_failures,
                    RECONNECT_FALLBACK_THRESHOLD
                );
                tokio::time::sleep(delay).await;
                Ok(())
            }
        }
    }

    async fn drain_one(&mut self, cancel: &CancellationToken) -> DrainOutcome {
        loop {
            let stream = self.active_stream.as_mut().expect("drain_one called without an active stream");

            let next = tokio::select! {
                next = stream.next() => next,
                _ = cancel.cancelled() => return DrainOutcome::Cancelled,
            };

            let Some(item) = next else {
                return DrainOutcome::StreamEnded;
            };

            match item {
                Ok(RawEvent::Applied(pod)) => {
                    self.remember_resource_version(&pod);
                    return DrainOutcome::Event(PodEvent::Applied(PodSnapshot::from(pod)));
                }
                Ok(RawEvent::Deleted(pod)) => {
                    self.remember_resource_version(&pod);
                    return DrainOutcome::Event(PodEvent::Deleted(PodSnapshot::from(pod)));
                }
                // Bookmarks carry no pod change; remember the resource version
                // and keep draining the same stream.
                Ok(RawEvent::ResourceVersionAdvance(rv)) => {
                    self.last_resource_version = Some(rv);
                }
                Err(error) => return DrainOutcome::Error(error),
            }
        }
    }

    fn remember_resource_version(&mut self, pod: &RawPod) {
        if let Some(rv) = pod.metadata.resource_version.clone() {
            self.last_resource_version = Some(rv);
        }
    }
}

enum DrainOutcome {
    Event(PodEvent),
    StreamEnded,
    Cancelled,
    Error(TransportError),
}

/// Production-facing handle: a [`Watcher`] wired to a real `kube::Api`.
pub struct PodWatcher(Watcher<KubeTransport>);

impl PodWatcher {
    pub fn new(client: Client, namespace: &str, pod_name: &str) -> Self {
        Self(Watcher::new(KubeTransport { api: Api::namespaced(client, namespace) }, pod_name))
    }

    pub async fn next(&mut self, cancel: &CancellationToken) -> Result<PodEvent, WatchError> {
        self.0.next(cancel).await
    }
}

#[async_trait]
impl PodWatch for PodWatcher {
    async fn next(&mut self, cancel: &CancellationToken) -> Result<PodEvent, WatchError> {
        PodWatcher::next(self, cancel).await
    }
}
