//! In-memory sandbox engine with scripted processes.
//!
//! The filesystem is a [`FileSystemTree`]; processes do not execute anything,
//! they replay a [`ProcessScript`] registered for their command line. Used by
//! the test suite and for offline demos of the boot pipeline.

use super::{
    CommandSpec, DirEntry, EntryKind, SandboxBooter, SandboxEngine, SandboxProcess, ServerReady,
};
use crate::error::TreeError;
use crate::tree::{split_path, FileContents, FileSystemTree, FsNode};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};

/// What a scripted process does once spawned.
#[derive(Debug, Clone, Default)]
pub struct ProcessScript {
    /// Lines printed before anything else happens.
    pub output: Vec<String>,
    /// Port announced as listening after the output.
    pub ready_port: Option<u16>,
    /// Exit code; `None` keeps the process alive until teardown.
    pub exit_code: Option<i32>,
}

impl ProcessScript {
    /// A process that prints `output` and exits with `code`.
    pub fn exits(code: i32, output: &[&str]) -> Self {
        Self {
            output: output.iter().map(|line| line.to_string()).collect(),
            ready_port: None,
            exit_code: Some(code),
        }
    }

    /// A long-running server that prints `output` and listens on `port`.
    pub fn serves(port: u16, output: &[&str]) -> Self {
        Self {
            output: output.iter().map(|line| line.to_string()).collect(),
            ready_port: Some(port),
            exit_code: None,
        }
    }
}

pub struct MemoryEngine {
    id: String,
    fs: Mutex<FileSystemTree>,
    scripts: HashMap<String, ProcessScript>,
    spawned: Mutex<Vec<String>>,
    running: Mutex<Vec<oneshot::Sender<i32>>>,
    ready_tx: broadcast::Sender<ServerReady>,
    teardowns: Arc<AtomicUsize>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::with_scripts(HashMap::new(), Arc::new(AtomicUsize::new(0)))
    }

    fn with_scripts(scripts: HashMap<String, ProcessScript>, teardowns: Arc<AtomicUsize>) -> Self {
        let (ready_tx, _) = broadcast::channel(16);
        let id = uuid::Uuid::new_v4().simple().to_string();
        Self {
            id: id[..8].to_string(),
            fs: Mutex::new(FileSystemTree::new()),
            scripts,
            spawned: Mutex::new(Vec::new()),
            running: Mutex::new(Vec::new()),
            ready_tx,
            teardowns,
        }
    }

    /// Copy of the current filesystem.
    pub fn snapshot(&self) -> FileSystemTree {
        self.fs.lock().clone()
    }

    /// Command lines spawned so far, in order.
    pub fn spawned(&self) -> Vec<String> {
        self.spawned.lock().clone()
    }

    fn preview_url(&self, port: u16) -> String {
        format!("https://{}-{port}.sandbox.test", self.id)
    }
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn parent_and_name(path: &str) -> anyhow::Result<(String, String)> {
    let parts = split_path(path).ok_or_else(|| TreeError::InvalidPath(path.to_string()))?;
    let (name, parents) = parts
        .split_last()
        .ok_or_else(|| TreeError::InvalidPath(path.to_string()))?;
    Ok((parents.join("/"), (*name).to_string()))
}

#[async_trait]
impl SandboxEngine for MemoryEngine {
    async fn mkdir(&self, path: &str) -> anyhow::Result<()> {
        self.fs.lock().create_dir_all(path)?;
        Ok(())
    }

    async fn write_file(&self, path: &str, contents: &[u8]) -> anyhow::Result<()> {
        let (parent, name) = parent_and_name(path)?;
        let mut fs = self.fs.lock();
        let dir = fs
            .dir_mut(&parent)
            .ok_or_else(|| TreeError::NotFound(parent.clone()))?;
        if let Some((_, FsNode::Directory(_))) = dir.entries().find(|(n, _)| **n == name) {
            anyhow::bail!(TreeError::IsADirectory(path.to_string()));
        }
        dir.insert_node(name, FsNode::file(FileContents::from_bytes(contents.to_vec())));
        Ok(())
    }

    async fn read_file(&self, path: &str) -> anyhow::Result<Vec<u8>> {
        let fs = self.fs.lock();
        match fs.get(path) {
            Some(FsNode::File { contents }) => Ok(contents.as_bytes().to_vec()),
            Some(FsNode::Directory(_)) => Err(TreeError::IsADirectory(path.to_string()).into()),
            None => Err(TreeError::NotFound(path.to_string()).into()),
        }
    }

    async fn remove(&self, path: &str) -> anyhow::Result<()> {
        self.fs.lock().remove(path);
        Ok(())
    }

    async fn read_dir(&self, path: &str) -> anyhow::Result<Vec<DirEntry>> {
        let fs = self.fs.lock();
        let dir = fs
            .dir(path)
            .ok_or_else(|| TreeError::NotFound(path.to_string()))?;
        Ok(dir
            .entries()
            .map(|(name, node)| {
                let kind = if node.is_dir() {
                    EntryKind::Directory
                } else {
                    EntryKind::File
                };
                DirEntry::new(name.clone(), kind)
            })
            .collect())
    }

    async fn spawn(&self, command: &CommandSpec) -> anyhow::Result<SandboxProcess> {
        let line = command.to_string();
        self.spawned.lock().push(line.clone());

        let script = self
            .scripts
            .get(&line)
            .cloned()
            .unwrap_or_else(|| ProcessScript::exits(0, &[]));

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = oneshot::channel();

        for output in script.output {
            let _ = out_tx.send(output);
        }
        if let Some(port) = script.ready_port {
            let _ = self.ready_tx.send(ServerReady {
                port,
                url: self.preview_url(port),
            });
        }
        drop(out_tx);

        match script.exit_code {
            Some(code) => {
                let _ = exit_tx.send(code);
            }
            None => self.running.lock().push(exit_tx),
        }

        Ok(SandboxProcess {
            output: out_rx,
            exit: exit_rx,
        })
    }

    fn server_ready(&self) -> broadcast::Receiver<ServerReady> {
        self.ready_tx.subscribe()
    }

    async fn teardown(&self) -> anyhow::Result<()> {
        self.running.lock().clear();
        *self.fs.lock() = FileSystemTree::new();
        self.teardowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Boots [`MemoryEngine`]s and keeps counters for assertions.
pub struct MemoryBooter {
    scripts: HashMap<String, ProcessScript>,
    boot_delay: Option<Duration>,
    boots: AtomicUsize,
    failures_left: AtomicUsize,
    teardowns: Arc<AtomicUsize>,
    engines: Mutex<Vec<Arc<MemoryEngine>>>,
}

impl MemoryBooter {
    pub fn new() -> Self {
        Self {
            scripts: HashMap::new(),
            boot_delay: None,
            boots: AtomicUsize::new(0),
            failures_left: AtomicUsize::new(0),
            teardowns: Arc::new(AtomicUsize::new(0)),
            engines: Mutex::new(Vec::new()),
        }
    }

    /// Register the behaviour of a command line, e.g. `"npm install"`.
    pub fn with_script(mut self, command: &str, script: ProcessScript) -> Self {
        self.scripts.insert(command.to_string(), script);
        self
    }

    pub fn with_boot_delay(mut self, delay: Duration) -> Self {
        self.boot_delay = Some(delay);
        self
    }

    /// Make the next `count` boots fail.
    pub fn fail_next_boots(&self, count: usize) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    /// Boot attempts so far, failed ones included.
    pub fn boots(&self) -> usize {
        self.boots.load(Ordering::SeqCst)
    }

    pub fn teardowns(&self) -> usize {
        self.teardowns.load(Ordering::SeqCst)
    }

    /// The most recently booted engine.
    pub fn last_engine(&self) -> Option<Arc<MemoryEngine>> {
        self.engines.lock().last().cloned()
    }
}

impl Default for MemoryBooter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SandboxBooter for MemoryBooter {
    async fn boot(&self) -> anyhow::Result<Arc<dyn SandboxEngine>> {
        self.boots.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.boot_delay {
            tokio::time::sleep(delay).await;
        }
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            anyhow::bail!("simulated boot failure");
        }

        let engine = Arc::new(MemoryEngine::with_scripts(
            self.scripts.clone(),
            self.teardowns.clone(),
        ));
        self.engines.lock().push(engine.clone());
        Ok(engine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_requires_existing_parent() {
        let engine = MemoryEngine::new();
        assert!(engine.write_file("a/b.txt", b"x").await.is_err());

        engine.mkdir("a").await.unwrap();
        engine.write_file("a/b.txt", b"x").await.unwrap();
        assert_eq!(engine.read_file("a/b.txt").await.unwrap(), b"x");
    }

    #[tokio::test]
    async fn scripted_process_replays_output_and_exit() {
        let booter = MemoryBooter::new().with_script("npm install", ProcessScript::exits(3, &["added 1 package"]));
        let engine = booter.boot().await.unwrap();

        let mut process = engine.spawn(&CommandSpec::new("npm", ["install"])).await.unwrap();
        assert_eq!(process.output.recv().await.as_deref(), Some("added 1 package"));
        assert_eq!(process.output.recv().await, None);
        assert_eq!(process.exit.await.unwrap(), 3);
    }

    #[tokio::test]
    async fn serving_process_announces_port() {
        let booter = MemoryBooter::new().with_script("npm run dev", ProcessScript::serves(3000, &[]));
        let engine = booter.boot().await.unwrap();
        let mut ready = engine.server_ready();

        let _process = engine.spawn(&CommandSpec::new("npm", ["run", "dev"])).await.unwrap();
        let event = ready.recv().await.unwrap();
        assert_eq!(event.port, 3000);
        assert!(event.url.starts_with("https://"));
    }

    #[tokio::test]
    async fn teardown_clears_filesystem_and_counts() {
        let booter = MemoryBooter::new();
        let engine = booter.boot().await.unwrap();
        engine.mkdir("src").await.unwrap();
        engine.teardown().await.unwrap();

        assert!(engine.read_dir(".").await.unwrap().is_empty());
        assert_eq!(booter.teardowns(), 1);
    }
}
