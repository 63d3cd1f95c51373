//! Sandbox abstraction layer.
//!
//! Defines the [`SandboxEngine`] trait every sandbox backend implements, the
//! cloneable [`SandboxHandle`] the rest of the crate passes around, and the
//! process model used by the dev-server launcher. Two engines exist:
//!
//! - [`local::LocalEngine`]: a host temp directory plus `tokio::process`
//! - [`memory::MemoryEngine`]: an in-memory tree with scripted processes
//!
//! Engines are never constructed directly by the orchestrator; they are booted
//! through a [`SandboxBooter`] owned by the [`registry::SandboxRegistry`].

pub mod local;
pub mod memory;
pub mod mount;
pub mod reader;
pub mod registry;

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};

pub use mount::FileSystemMounter;
pub use reader::{FileTreeNode, FileTreeReader, NodeKind};
pub use registry::SandboxRegistry;

/// Type of a directory entry as reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: EntryKind,
}

impl DirEntry {
    pub fn new(name: impl Into<String>, kind: EntryKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// A command to run inside the sandbox, relative to the project root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: String,
}

impl CommandSpec {
    pub fn new<I, S>(program: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.to_string(),
            args: args.into_iter().map(Into::into).collect(),
            cwd: ".".to_string(),
        }
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// A running process: its merged stdout/stderr lines and its exit code.
///
/// `output` closes once the process has no more output; `exit` resolves with
/// the exit code. A dropped `exit` sender means the engine lost the process.
pub struct SandboxProcess {
    pub output: mpsc::UnboundedReceiver<String>,
    pub exit: oneshot::Receiver<i32>,
}

/// Emitted by the engine whenever a server inside the sandbox starts
/// listening. May fire several times for one process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerReady {
    pub port: u16,
    pub url: String,
}

/// Provider-agnostic sandbox interface.
///
/// Paths are relative to the sandbox project root. `write_file` does not
/// create missing parent directories; [`FileSystemMounter`] handles that.
#[async_trait]
pub trait SandboxEngine: Send + Sync {
    /// Create a directory and all of its missing parents.
    async fn mkdir(&self, path: &str) -> anyhow::Result<()>;

    /// Write a file. The parent directory must already exist.
    async fn write_file(&self, path: &str, contents: &[u8]) -> anyhow::Result<()>;

    /// Read a file's raw bytes.
    async fn read_file(&self, path: &str) -> anyhow::Result<Vec<u8>>;

    /// Remove a file or a directory tree. Missing paths are not an error.
    async fn remove(&self, path: &str) -> anyhow::Result<()>;

    /// List the direct entries of a directory.
    async fn read_dir(&self, path: &str) -> anyhow::Result<Vec<DirEntry>>;

    /// Start a process. Returns as soon as it is running.
    async fn spawn(&self, command: &CommandSpec) -> anyhow::Result<SandboxProcess>;

    /// Subscribe to server-ready notifications.
    fn server_ready(&self) -> broadcast::Receiver<ServerReady>;

    /// Stop every process and discard the sandbox filesystem.
    async fn teardown(&self) -> anyhow::Result<()>;
}

/// Boots a fresh engine. Expensive; only the registry calls it.
#[async_trait]
pub trait SandboxBooter: Send + Sync {
    async fn boot(&self) -> anyhow::Result<Arc<dyn SandboxEngine>>;
}

/// Cheap, cloneable reference to a booted engine.
#[derive(Clone)]
pub struct SandboxHandle {
    id: String,
    engine: Arc<dyn SandboxEngine>,
}

impl SandboxHandle {
    pub fn new(engine: Arc<dyn SandboxEngine>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            engine,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn engine(&self) -> &dyn SandboxEngine {
        self.engine.as_ref()
    }

    /// Whether two handles refer to the same boot.
    pub fn same_as(&self, other: &SandboxHandle) -> bool {
        self.id == other.id
    }
}

impl fmt::Debug for SandboxHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SandboxHandle").field("id", &self.id).finish()
    }
}
