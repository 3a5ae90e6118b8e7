//! Component C: a handle to a mount path in a (possibly not-yet-created) pod.
//! Content moves in and out by exec'ing `tar` inside the container (see
//! [`crate::k8s::exec`]), never through the Kubernetes API directly.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;

use crate::k8s::{ExecIo, PodApi};
use crate::{Error, Result};

/// Something a volume can stream a tar archive out of, to be streamed into
/// another volume as an input artifact. Concretely, another `Volume`'s
/// `stream_out`.
#[async_trait]
pub trait ArtifactSource: std::fmt::Debug + Send + Sync {
    async fn stream_out(&self, path: &str, cancel: CancellationToken) -> Result<Vec<u8>>;
}

#[derive(Debug)]
struct VolumeInner {
    handle: String,
    worker_name: String,
    container_name: String,
    mount_path: String,
    pod_name: Mutex<Option<String>>,
    api: Option<Arc<dyn PodApi>>,
    /// For input mounts, the source the content is streamed in from before
    /// the command runs. `None` for outputs, caches, and inputs with nothing
    /// to pre-populate.
    artifact: Option<Arc<dyn ArtifactSource>>,
}

/// Cloning a `Volume` shares its binding state: once any clone observes
/// `set_pod_name`, every clone does.
#[derive(Debug, Clone)]
pub struct Volume {
    inner: Arc<VolumeInner>,
}

impl Volume {
    pub fn new(
        handle: String,
        worker_name: String,
        container_name: String,
        mount_path: String,
        api: Arc<dyn PodApi>,
    ) -> Self {
        Self {
            inner: Arc::new(VolumeInner {
                handle,
                worker_name,
                container_name,
                mount_path,
                pod_name: Mutex::new(None),
                api: Some(api),
                artifact: None,
            }),
        }
    }

    /// A stub volume has no executor; cache-initialization calls against it
    /// are accepted as no-ops, for compatibility with placeholder use in a
    /// mount list.
    pub fn stub(handle: String, worker_name: String, container_name: String, mount_path: String) -> Self {
        Self {
            inner: Arc::new(VolumeInner {
                handle,
                worker_name,
                container_name,
                mount_path,
                pod_name: Mutex::new(None),
                api: None,
                artifact: None,
            }),
        }
    }

    /// Attaches the artifact this volume should stream in before the
    /// container's process runs. Only meaningful on input mounts; built as a
    /// separate step from `new` since the artifact source is resolved by the
    /// caller (another volume, or a registry-backed source) after the mount
    /// itself is constructed. Must be called before the volume is cloned.
    pub fn with_artifact(mut self, artifact: Arc<dyn ArtifactSource>) -> Self {
        Arc::get_mut(&mut self.inner)
            .expect("with_artifact called after the volume was cloned")
            .artifact = Some(artifact);
        self
    }

    pub fn artifact(&self) -> Option<Arc<dyn ArtifactSource>> {
        self.inner.artifact.clone()
    }

    pub fn handle(&self) -> &str {
        &self.inner.handle
    }

    pub fn source(&self) -> &str {
        &self.inner.worker_name
    }

    pub fn mount_path(&self) -> &str {
        &self.inner.mount_path
    }

    pub fn pod_name(&self) -> Option<String> {
        self.inner.pod_name.lock().unwrap().clone()
    }

    pub fn set_pod_name(&self, pod_name: String) {
        *self.inner.pod_name.lock().unwrap() = Some(pod_name);
    }

    fn resolve_path(&self, path: &str) -> String {
        if path.is_empty() || path == "." {
            self.inner.mount_path.clone()
        } else {
            format!("{}/{}", self.inner.mount_path.trim_end_matches('/'), path)
        }
    }

    fn bound_pod(&self) -> Result<String> {
        self.pod_name().ok_or_else(|| Error::Other("volume not bound".into()))
    }

    /// `tar xf - -C <mountPath>/<path>`, with `reader` fed as the exec's
    /// stdin.
    pub async fn stream_in(
        &self,
        path: &str,
        reader: std::pin::Pin<Box<dyn AsyncRead + Send>>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let Some(api) = &self.inner.api else { return Ok(()) };
        let pod_name = self.bound_pod()?;
        let target = self.resolve_path(path);

        let io = ExecIo {
            stdin: Some(reader),
            stdout: None,
            stderr: None,
        };

        api.exec_in_pod(
            &pod_name,
            &self.inner.container_name,
            vec!["tar".to_owned(), "xf".to_owned(), "-".to_owned(), "-C".to_owned(), target],
            io,
            false,
            cancel,
        )
        .await
        .map_err(Error::from)
    }

    /// `tar cf - -C <mountPath>/<path> .`; returns the raw tar bytes.
    ///
    /// Buffers the whole archive rather than returning a live stream: the
    /// only consumer is another volume's `stream_in`, and the pod-exec
    /// transport doesn't expose a `Read`-able handle once `exec_in_pod` has
    /// returned.
    pub async fn stream_out(&self, path: &str, cancel: CancellationToken) -> Result<Vec<u8>> {
        let Some(api) = &self.inner.api else { return Ok(Vec::new()) };
        let pod_name = self.bound_pod()?;
        let target = self.resolve_path(path);

        let (writer, mut reader) = tokio::io::duplex(64 * 1024);
        let io = ExecIo {
            stdin: None,
            stdout: Some(Box::pin(writer)),
            stderr: None,
        };

        let command = vec![
            "tar".to_owned(),
            "cf".to_owned(),
            "-".to_owned(),
            "-C".to_owned(),
            target,
            ".".to_owned(),
        ];

        let exec = api.exec_in_pod(&pod_name, &self.inner.container_name, command, io, false, cancel);
        let mut buf = Vec::new();
        let read = tokio::io::AsyncReadExt::read_to_end(&mut reader, &mut buf);

        let (exec_result, read_result) = tokio::join!(exec, read);
        exec_result.map_err(Error::from)?;
        read_result.map_err(|error| Error::Transport(Box::new(error)))?;
        Ok(buf)
    }
}

#[async_trait]
impl ArtifactSource for Volume {
    async fn stream_out(&self, path: &str, cancel: CancellationToken) -> Result<Vec<u8>> {
        Volume::stream_out(self, path, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::k8s::testutil::FakePodApi;

    #[tokio::test]
    async fn stream_in_before_bind_fails() {
        let api: Arc<dyn PodApi> = Arc::new(FakePodApi::new());
        let volume = Volume::new("h".into(), "w".into(), "main".into(), "/mnt".into(), api);
        let reader: std::pin::Pin<Box<dyn AsyncRead + Send>> = Box::pin(tokio::io::empty());
        let result = volume.stream_in("", reader, CancellationToken::new()).await;
        assert!(result.is_err());
    }

    #[test]
    fn resolve_path_joins_relative_paths() {
        let api: Arc<dyn PodApi> = Arc::new(FakePodApi::new());
        let volume = Volume::new("h".into(), "w".into(), "main".into(), "/mnt".into(), api);
        assert_eq!(volume.resolve_path(""), "/mnt");
        assert_eq!(volume.resolve_path("."), "/mnt");
        assert_eq!(volume.resolve_path("sub/dir"), "/mnt/sub/dir");
    }

    #[test]
    fn stub_volume_has_no_bound_pod_requirement_for_cache_init() {
        let volume = Volume::stub("h".into(), "w".into(), "main".into(), "/mnt".into());
        assert_eq!(volume.pod_name(), None);
    }

    #[test]
    fn with_artifact_is_visible_through_clones() {
        let source = Volume::stub("src".into(), "w".into(), "main".into(), "/src".into());
        let input = Volume::stub("in".into(), "w".into(), "main".into(), "/in".into())
            .with_artifact(Arc::new(source) as Arc<dyn ArtifactSource>);
        let cloned = input.clone();
        assert!(cloned.artifact().is_some());
    }

    #[test]
    fn volume_without_artifact_has_none() {
        let volume = Volume::stub("h".into(), "w".into(), "main".into(), "/mnt".into());
        assert!(volume.artifact().is_none());
    }

    /// Container A's output volume streams out of its pod; the resulting tar
    /// bytes become the stdin of container B's input volume streaming in,
    /// even though the two volumes are bound to different pods.
    #[tokio::test]
    async fn stream_out_of_one_pod_feeds_stream_in_of_another() {
        let api = Arc::new(FakePodApi::new());
        let tar_bytes = b"fake-tar-archive".to_vec();
        api.push_stdout_bytes(tar_bytes.clone());

        let output = Volume::new("o".into(), "a".into(), "main".into(), "/o".into(), api.clone() as Arc<dyn PodApi>);
        output.set_pod_name("pod-a".into());

        let input = Volume::new("o".into(), "b".into(), "main".into(), "/o".into(), api.clone() as Arc<dyn PodApi>);
        input.set_pod_name("pod-b".into());

        let bytes = output.stream_out("", CancellationToken::new()).await.unwrap();
        assert_eq!(bytes, tar_bytes);

        let reader: std::pin::Pin<Box<dyn AsyncRead + Send>> = Box::pin(std::io::Cursor::new(bytes));
        input.stream_in("", reader, CancellationToken::new()).await.unwrap();

        let stdin_log = api.stdin_log();
        assert_eq!(stdin_log.len(), 1);
        assert_eq!(stdin_log[0], tar_bytes);

        let calls = api.exec_calls();
        assert_eq!(calls[0].0, "pod-a");
        assert_eq!(calls[0].1[0..2], ["tar".to_owned(), "cf".to_owned()]);
        assert_eq!(calls[1].0, "pod-b");
        assert_eq!(calls[1].1[0..2], ["tar".to_owned(), "xf".to_owned()]);
    }

    /// The same flow, but wired through `ArtifactSource` the way
    /// [`crate::worker`] actually connects volumes: `input.with_artifact`
    /// holds the source, and the consumer pulls from the trait object rather
    /// than a concrete `Volume`.
    #[tokio::test]
    async fn artifact_source_trait_object_carries_bytes_across_pods() {
        let api = Arc::new(FakePodApi::new());
        let tar_bytes = b"another-fake-tar".to_vec();
        api.push_stdout_bytes(tar_bytes.clone());

        let output = Volume::new("o".into(), "a".into(), "main".into(), "/o".into(), api.clone() as Arc<dyn PodApi>);
        output.set_pod_name("pod-a".into());

        let input = Volume::new("o".into(), "b".into(), "main".into(), "/o".into(), api.clone() as Arc<dyn PodApi>)
            .with_artifact(Arc::new(output) as Arc<dyn ArtifactSource>);
        input.set_pod_name("pod-b".into());

        let artifact = input.artifact().expect("input volume has an artifact source");
        let bytes = artifact.stream_out("", CancellationToken::new()).await.unwrap();
        let reader: std::pin::Pin<Box<dyn AsyncRead + Send>> = Box::pin(std::io::Cursor::new(bytes));
        input.stream_in("", reader, CancellationToken::new()).await.unwrap();

        assert_eq!(api.stdin_log(), vec![tar_bytes]);
    }
}
