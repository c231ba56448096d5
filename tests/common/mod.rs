//! Scripted in-memory container engine for deterministic tests
//!
//! `MockEngine` records every call, keeps track of live containers, volumes
//! and networks, and lets a test decide per image what a container prints,
//! how it exits and whether it ever exits.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use insulate::engine::{
    encode_frame, ByteStream, ContainerEngine, ContainerSpec, EngineError, InputStream, PathKind, PathStat,
    ProgressStream, StreamKind,
};
use insulate::PipelineDefinition;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use tokio::io::AsyncWrite;

#[derive(Debug, Default)]
pub struct MockState {
    calls: Vec<String>,
    next_id: usize,
    /// Containers created and not yet removed
    containers: HashMap<String, ContainerSpec>,
    /// Every container ever created, in order
    created: Vec<(String, ContainerSpec)>,
    volumes: BTreeSet<String>,
    networks: BTreeSet<String>,
    stdin: HashMap<String, Vec<u8>>,
    uploads: Vec<(String, String, Vec<u8>)>,
    exit_codes: HashMap<String, i64>,
    output: HashMap<String, Vec<u8>>,
    hanging: HashSet<String>,
    stalled_pulls: HashSet<String>,
    failures: Vec<(String, Option<String>)>,
    paths: HashMap<String, PathStat>,
    downloads: HashMap<String, (Vec<u8>, PathStat)>,
}

/// In-memory engine. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MockEngine {
    state: Arc<Mutex<MockState>>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    /// Containers from `image` exit with `code`
    pub fn with_exit_code(self, image: &str, code: i64) -> Self {
        self.lock().exit_codes.insert(image.to_string(), code);
        self
    }

    /// Containers from `image` print `text` on stdout
    pub fn with_output(self, image: &str, text: &str) -> Self {
        self.lock()
            .output
            .insert(image.to_string(), encode_frame(StreamKind::Stdout, text.as_bytes()));
        self
    }

    /// Containers from `image` never exit
    pub fn with_hanging(self, image: &str) -> Self {
        self.lock().hanging.insert(image.to_string());
        self
    }

    /// Pulls of `image` never make progress
    pub fn with_stalled_pull(self, image: &str) -> Self {
        self.lock().stalled_pulls.insert(image.to_string());
        self
    }

    /// Every call to `operation` fails
    pub fn fail_on(self, operation: &str) -> Self {
        self.lock().failures.push((operation.to_string(), None));
        self
    }

    /// Calls to `operation` whose argument is `arg` fail
    pub fn fail_on_arg(self, operation: &str, arg: &str) -> Self {
        self.lock()
            .failures
            .push((operation.to_string(), Some(arg.to_string())));
        self
    }

    pub fn with_volume(self, name: &str) -> Self {
        self.lock().volumes.insert(name.to_string());
        self
    }

    pub fn with_network(self, name: &str) -> Self {
        self.lock().networks.insert(name.to_string());
        self
    }

    /// Override what `stat_path` reports for `path`
    pub fn with_path(self, path: &str, stat: PathStat) -> Self {
        self.lock().paths.insert(path.to_string(), stat);
        self
    }

    /// Serve `archive` when `path` is copied out of a container
    pub fn with_download(self, path: &str, archive: Vec<u8>, stat: PathStat) -> Self {
        self.lock()
            .downloads
            .insert(path.to_string(), (archive, stat));
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    /// Calls to `operation`, with their argument
    pub fn calls_to(&self, operation: &str) -> Vec<String> {
        let prefix = format!("{} ", operation);
        self.lock()
            .calls
            .iter()
            .filter(|call| call.starts_with(&prefix) || call.as_str() == operation)
            .cloned()
            .collect()
    }

    pub fn live_containers(&self) -> usize {
        self.lock().containers.len()
    }

    pub fn created(&self) -> Vec<(String, ContainerSpec)> {
        self.lock().created.clone()
    }

    pub fn created_images(&self) -> Vec<String> {
        self.lock()
            .created
            .iter()
            .map(|(_, spec)| spec.image.clone())
            .collect()
    }

    /// What was written to the stdin of the `index`-th created container
    pub fn stdin_of(&self, index: usize) -> String {
        let state = self.lock();
        let id = &state.created[index].0;
        String::from_utf8_lossy(state.stdin.get(id).map(Vec::as_slice).unwrap_or_default()).into_owned()
    }

    pub fn uploads(&self) -> Vec<(String, String, Vec<u8>)> {
        self.lock().uploads.clone()
    }

    pub fn volumes(&self) -> Vec<String> {
        self.lock().volumes.iter().cloned().collect()
    }

    pub fn networks(&self) -> Vec<String> {
        self.lock().networks.iter().cloned().collect()
    }

    fn record(&self, operation: &str, arg: &str) -> Result<(), EngineError> {
        let mut state = self.lock();
        state.calls.push(if arg.is_empty() {
            operation.to_string()
        } else {
            format!("{} {}", operation, arg)
        });
        let failing = state
            .failures
            .iter()
            .any(|(op, expected)| op == operation && expected.as_deref().map_or(true, |e| e == arg));
        if failing {
            return Err(EngineError::Api(format!("{} {} failed", operation, arg)));
        }
        Ok(())
    }

    fn image_of(&self, id: &str) -> Result<String, EngineError> {
        self.lock()
            .containers
            .get(id)
            .map(|spec| spec.image.clone())
            .ok_or_else(|| EngineError::NotFound(format!("no such container: {}", id)))
    }
}

/// Writer capturing a container's stdin
struct StdinCapture {
    state: Arc<Mutex<MockState>>,
    id: String,
}

impl AsyncWrite for StdinCapture {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let mut state = self.state.lock().unwrap();
        state.stdin.entry(self.id.clone()).or_default().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

fn bytes_stream(chunks: Vec<Vec<u8>>) -> ByteStream {
    futures_util::stream::iter(chunks.into_iter().map(|chunk| Ok(Bytes::from(chunk)))).boxed()
}

pub fn dir_stat(name: &str) -> PathStat {
    PathStat {
        name: name.to_string(),
        size: 0,
        mode: 0o755,
        kind: PathKind::Directory,
        link_target: String::new(),
    }
}

pub fn file_stat(name: &str, size: u64) -> PathStat {
    PathStat {
        name: name.to_string(),
        size,
        mode: 0o644,
        kind: PathKind::File,
        link_target: String::new(),
    }
}

#[async_trait]
impl ContainerEngine for MockEngine {
    async fn pull_image(&self, image: &str) -> Result<ProgressStream, EngineError> {
        self.record("pull_image", image)?;
        if self.lock().stalled_pulls.contains(image) {
            return Ok(futures_util::stream::pending().boxed());
        }
        let status = format!("Status: Image is up to date for {}", image);
        Ok(futures_util::stream::iter(vec![Ok(status)]).boxed())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, EngineError> {
        self.record("create_container", &spec.image)?;
        let mut state = self.lock();
        state.next_id += 1;
        let id = format!("container{:04}", state.next_id);
        state.containers.insert(id.clone(), spec.clone());
        state.created.push((id.clone(), spec.clone()));
        Ok(id)
    }

    async fn attach_stdin(&self, id: &str) -> Result<InputStream, EngineError> {
        self.record("attach_stdin", id)?;
        Ok(Box::pin(StdinCapture {
            state: Arc::clone(&self.state),
            id: id.to_string(),
        }))
    }

    async fn start_container(&self, id: &str) -> Result<(), EngineError> {
        let image = self.image_of(id)?;
        self.record("start_container", &image)
    }

    async fn wait_container(&self, id: &str) -> Result<i64, EngineError> {
        let image = self.image_of(id)?;
        self.record("wait_container", &image)?;
        if self.lock().hanging.contains(&image) {
            futures_util::future::pending::<()>().await;
        }
        Ok(self.lock().exit_codes.get(&image).copied().unwrap_or(0))
    }

    async fn container_logs(&self, id: &str, _follow: bool) -> Result<ByteStream, EngineError> {
        let image = self.image_of(id)?;
        self.record("container_logs", &image)?;
        let output = self.lock().output.get(&image).cloned().unwrap_or_default();
        Ok(bytes_stream(vec![output]))
    }

    async fn stop_container(&self, id: &str) -> Result<(), EngineError> {
        let image = self.image_of(id)?;
        self.record("stop_container", &image)
    }

    async fn remove_container(&self, id: &str, _force: bool) -> Result<(), EngineError> {
        let image = self.image_of(id)?;
        self.record("remove_container", &image)?;
        self.lock().containers.remove(id);
        Ok(())
    }

    async fn stat_path(&self, _id: &str, path: &str) -> Result<PathStat, EngineError> {
        self.record("stat_path", path)?;
        let state = self.lock();
        if let Some(stat) = state.paths.get(path) {
            return Ok(stat.clone());
        }
        if let Some((_, stat)) = state.downloads.get(path) {
            return Ok(stat.clone());
        }
        let name = path.rsplit('/').next().unwrap_or(path);
        Ok(dir_stat(name))
    }

    async fn copy_to_container(&self, id: &str, dir: &str, archive: Vec<u8>) -> Result<(), EngineError> {
        self.record("copy_to_container", dir)?;
        self.lock()
            .uploads
            .push((id.to_string(), dir.to_string(), archive));
        Ok(())
    }

    async fn copy_from_container(&self, _id: &str, path: &str) -> Result<(ByteStream, PathStat), EngineError> {
        self.record("copy_from_container", path)?;
        let (archive, stat) = self
            .lock()
            .downloads
            .get(path)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("no such path: {}", path)))?;
        // Split in two to exercise chunk reassembly
        let half = archive.len() / 2;
        let (head, tail) = archive.split_at(half);
        Ok((bytes_stream(vec![head.to_vec(), tail.to_vec()]), stat))
    }

    async fn create_volume(&self, name: &str, _driver: &str) -> Result<(), EngineError> {
        self.record("create_volume", name)?;
        if !self.lock().volumes.insert(name.to_string()) {
            return Err(EngineError::Api(format!("volume {} already exists", name)));
        }
        Ok(())
    }

    async fn list_volumes(&self) -> Result<Vec<String>, EngineError> {
        self.record("list_volumes", "")?;
        Ok(self.volumes())
    }

    async fn remove_volume(&self, name: &str) -> Result<(), EngineError> {
        self.record("remove_volume", name)?;
        if !self.lock().volumes.remove(name) {
            return Err(EngineError::NotFound(format!("no such volume: {}", name)));
        }
        Ok(())
    }

    async fn create_network(&self, name: &str, _driver: &str) -> Result<String, EngineError> {
        self.record("create_network", name)?;
        if !self.lock().networks.insert(name.to_string()) {
            return Err(EngineError::Api(format!("network {} already exists", name)));
        }
        Ok(format!("{}-id", name))
    }

    async fn list_networks(&self) -> Result<Vec<String>, EngineError> {
        self.record("list_networks", "")?;
        Ok(self.networks())
    }

    async fn remove_network(&self, name: &str) -> Result<(), EngineError> {
        self.record("remove_network", name)?;
        if !self.lock().networks.remove(name) {
            return Err(EngineError::NotFound(format!("no such network: {}", name)));
        }
        Ok(())
    }
}

/// Parse a definition, panicking on invalid YAML
pub fn definition(yaml: &str) -> PipelineDefinition {
    PipelineDefinition::from_yaml(yaml).expect("valid pipeline definition")
}
