//! Workspace orchestrator: boots the shared sandbox, fills it with the
//! project snapshot and hands off to the dev-server launcher, publishing
//! progress as an [`OrchestratorState`] read model.
//!
//! Boot pipeline, once per orchestrator until reset:
//!
//! 1. acquire the sandbox from the [`SandboxRegistry`]
//! 2. load the snapshot: a cached one immediately (refreshed in the background
//!    for the next boot) or a blocking fetch that then populates the cache
//! 3. mount it
//! 4. start the [`DevServerLauncher`] and map its events into the state
//!
//! A failure at any step parks the state in `error` until [`retry`] is
//! called. Branch changes and retries tear the sandbox down and start a new
//! boot epoch; steps still running for the old epoch are ignored.
//!
//! [`retry`]: Orchestrator::retry

pub mod state;

use crate::devserver::{DevServerEvent, DevServerLauncher, DevServerState, LauncherConfig};
use crate::error::OrchestratorError;
use crate::fetch::TreeFetcher;
use crate::sandbox::reader::DEFAULT_SKIP_DIRS;
use crate::sandbox::{FileSystemMounter, FileTreeNode, FileTreeReader, SandboxHandle, SandboxRegistry};
use crate::store::{CacheKey, SnapshotCache};
use crate::tree::{FileContents, FileSystemTree};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub use state::{transition, Event, OrchestratorState, Phase, StateStore, StateUpdate};

/// Runtime settings for one orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// `owner/name` of the project repository.
    pub repository_id: String,
    /// Initial branch; `None` is the repository's default branch.
    pub branch: Option<String>,
    pub fetch_timeout: Option<Duration>,
    pub launcher: LauncherConfig,
    /// Directory names hidden from [`Orchestrator::file_tree`].
    pub skip_dirs: Vec<String>,
}

impl OrchestratorConfig {
    pub fn new(repository_id: impl Into<String>) -> Self {
        Self {
            repository_id: repository_id.into(),
            branch: None,
            fetch_timeout: Some(Duration::from_secs(120)),
            launcher: LauncherConfig {
                install_timeout: Some(Duration::from_secs(900)),
                ready_timeout: None,
            },
            skip_dirs: DEFAULT_SKIP_DIRS.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn with_branch(mut self, branch: Option<String>) -> Self {
        self.branch = normalize_branch(branch);
        self
    }
}

/// Outcome of a manual refresh.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RefreshSummary {
    pub written: usize,
    pub removed: usize,
}

/// Blank branch names mean the default branch.
fn normalize_branch(branch: Option<String>) -> Option<String> {
    branch
        .map(|b| b.trim().to_string())
        .filter(|b| !b.is_empty())
}

#[derive(Default)]
struct Session {
    /// Re-entry guard; set by `boot`, cleared by retry and branch reboots.
    boot_started: bool,
    /// Current branch input.
    branch: Option<String>,
    /// Branch the current boot was started with.
    booted_branch: Option<String>,
    handle: Option<SandboxHandle>,
    /// What was last written into the sandbox, for refresh diffs.
    mounted: Option<FileSystemTree>,
    tasks: Vec<JoinHandle<()>>,
}

pub struct Orchestrator {
    repository_id: String,
    fetch_timeout: Option<Duration>,
    registry: Arc<SandboxRegistry>,
    fetcher: Arc<dyn TreeFetcher>,
    cache: SnapshotCache,
    mounter: FileSystemMounter,
    reader: FileTreeReader,
    launcher: DevServerLauncher,
    store: Arc<StateStore>,
    dev_state: Arc<Mutex<DevServerState>>,
    session: Mutex<Session>,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        registry: Arc<SandboxRegistry>,
        fetcher: Arc<dyn TreeFetcher>,
        cache: SnapshotCache,
    ) -> Self {
        Self {
            repository_id: config.repository_id,
            fetch_timeout: config.fetch_timeout,
            registry,
            fetcher,
            cache,
            mounter: FileSystemMounter::new(),
            reader: FileTreeReader::new(config.skip_dirs),
            launcher: DevServerLauncher::new(config.launcher),
            store: Arc::new(StateStore::new()),
            dev_state: Arc::new(Mutex::new(DevServerState::default())),
            session: Mutex::new(Session {
                branch: normalize_branch(config.branch),
                ..Session::default()
            }),
        }
    }

    pub fn repository_id(&self) -> &str {
        &self.repository_id
    }

    pub fn branch(&self) -> Option<String> {
        self.session.lock().branch.clone()
    }

    /// Current read model.
    pub fn state(&self) -> OrchestratorState {
        self.store.snapshot()
    }

    /// Current state first, then every change in order. Fold the updates into
    /// an [`OrchestratorState`] with [`OrchestratorState::apply`].
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<StateUpdate> {
        self.store.subscribe()
    }

    /// The launcher's own view of the current boot.
    pub fn dev_server(&self) -> DevServerState {
        self.dev_state.lock().clone()
    }

    /// Run the boot pipeline. A no-op if a boot already started; returns once
    /// the snapshot is mounted and the dev server is launching.
    pub async fn boot(&self) -> Result<(), OrchestratorError> {
        let (epoch, branch) = {
            let mut session = self.session.lock();
            if session.boot_started {
                tracing::debug!("Boot already started for {}; ignoring", self.repository_id);
                return Ok(());
            }
            session.boot_started = true;
            session.booted_branch = session.branch.clone();
            (self.store.epoch(), session.branch.clone())
        };

        match self.run_boot(epoch, branch.as_deref()).await {
            Ok(()) => Ok(()),
            Err(_) if self.store.epoch() != epoch => {
                tracing::debug!("Boot epoch {epoch} superseded");
                Err(OrchestratorError::Superseded)
            }
            Err(e) => {
                tracing::warn!("Boot of {} failed: {e}", self.repository_id);
                self.store.dispatch(
                    epoch,
                    Event::Failed {
                        message: e.to_string(),
                        kind: e.kind(),
                    },
                );
                Err(e)
            }
        }
    }

    async fn run_boot(&self, epoch: u64, branch: Option<&str>) -> Result<(), OrchestratorError> {
        self.store.dispatch(epoch, Event::BootStarted);
        let handle = self.registry.acquire().await?;
        self.ensure_current(epoch)?;

        self.store.dispatch(epoch, Event::Fetching);
        let key = CacheKey::new(&self.repository_id, branch);
        let tree = match self.cache.get(&key).await {
            Some(entry) => {
                tracing::info!("Using cached snapshot {key} from {}", entry.stored_at);
                self.revalidate(key, branch);
                entry.tree
            }
            None => {
                let tree = self.fetch(branch, false).await?;
                self.cache.set(&key, &tree).await;
                tree
            }
        };
        self.ensure_current(epoch)?;

        self.store.dispatch(epoch, Event::Mounting);
        self.mounter.mount(&handle, &tree).await?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mut session = self.session.lock();
        self.ensure_current(epoch)?;
        session.handle = Some(handle.clone());
        session.mounted = Some(tree);
        session.tasks.push(self.launcher.start(handle, events_tx));
        session.tasks.push(self.spawn_pump(epoch, events_rx));
        Ok(())
    }

    fn ensure_current(&self, epoch: u64) -> Result<(), OrchestratorError> {
        if self.store.epoch() == epoch {
            Ok(())
        } else {
            Err(OrchestratorError::Superseded)
        }
    }

    async fn fetch(&self, branch: Option<&str>, fresh: bool) -> Result<FileSystemTree, OrchestratorError> {
        let request = async {
            if fresh {
                self.fetcher.fetch_tree_fresh(&self.repository_id, branch).await
            } else {
                self.fetcher.fetch_tree(&self.repository_id, branch).await
            }
        };
        let result = match self.fetch_timeout {
            Some(limit) => tokio::time::timeout(limit, request).await.map_err(|_| {
                OrchestratorError::Timeout {
                    phase: "fetching project files",
                    secs: limit.as_secs(),
                }
            })?,
            None => request.await,
        };
        result.map_err(OrchestratorError::Fetch)
    }

    /// Refresh the cache entry for `key` in a detached task. Only the next
    /// boot sees the result; failures are logged and dropped.
    fn revalidate(&self, key: CacheKey, branch: Option<&str>) {
        let fetcher = self.fetcher.clone();
        let cache = self.cache.clone();
        let repository_id = self.repository_id.clone();
        let branch = branch.map(str::to_string);
        let limit = self.fetch_timeout;

        tokio::spawn(async move {
            let request = fetcher.fetch_tree(&repository_id, branch.as_deref());
            let result = match limit {
                Some(limit) => match tokio::time::timeout(limit, request).await {
                    Ok(result) => result,
                    Err(_) => Err(anyhow::anyhow!("timed out after {}s", limit.as_secs())),
                },
                None => request.await,
            };
            match result {
                Ok(tree) => {
                    cache.set(&key, &tree).await;
                    tracing::debug!("Revalidated snapshot {key}");
                }
                Err(e) => tracing::warn!("Background revalidation of {key} failed: {e:#}"),
            }
        });
    }

    fn spawn_pump(&self, epoch: u64, mut events: mpsc::UnboundedReceiver<DevServerEvent>) -> JoinHandle<()> {
        let store = self.store.clone();
        let dev_state = self.dev_state.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                dev_state.lock().apply(&event);
                store.dispatch(epoch, Event::DevServer(event));
            }
        })
    }

    /// Drop everything tied to the current boot and tear the sandbox down.
    async fn reset_session(&self) {
        let tasks = {
            let mut session = self.session.lock();
            session.boot_started = false;
            session.handle = None;
            session.mounted = None;
            // Bumped under the session lock so an in-flight boot cannot
            // commit its handle after this point.
            self.store.reset();
            std::mem::take(&mut session.tasks)
        };
        for task in tasks {
            task.abort();
        }
        *self.dev_state.lock() = DevServerState::default();
        self.registry.teardown().await;
    }

    /// Tear down, reset to idle and boot again. The recovery path from
    /// `error`, also usable at any other time.
    pub async fn retry(&self) -> Result<(), OrchestratorError> {
        tracing::info!("Retrying boot of {}", self.repository_id);
        self.reset_session().await;
        self.boot().await
    }

    /// Update the branch input. Reboots only when a boot has started and the
    /// effective branch differs from the one it used. Returns whether a reboot
    /// happened.
    pub async fn set_branch(&self, branch: Option<String>) -> Result<bool, OrchestratorError> {
        let branch = normalize_branch(branch);
        let reboot = {
            let mut session = self.session.lock();
            let reboot = session.boot_started && session.booted_branch != branch;
            session.branch = branch.clone();
            reboot
        };
        if !reboot {
            tracing::debug!("Branch input {branch:?} needs no reboot");
            return Ok(false);
        }

        tracing::info!(
            "Branch changed to {}; rebooting",
            branch.as_deref().unwrap_or("default")
        );
        self.reset_session().await;
        self.boot().await?;
        Ok(true)
    }

    /// Re-fetch bypassing every cache, write the differences into the running
    /// sandbox and update the cache. The dev server keeps running and the
    /// phase does not change.
    pub async fn refresh(&self) -> Result<RefreshSummary, OrchestratorError> {
        let (handle, branch, epoch) = {
            let session = self.session.lock();
            let handle = session.handle.clone().ok_or(OrchestratorError::NotMounted)?;
            (handle, session.booted_branch.clone(), self.store.epoch())
        };

        let fresh = self.fetch(branch.as_deref(), true).await?;
        let mounted = self.session.lock().mounted.clone().unwrap_or_default();
        let diff = mounted.diff(&fresh);
        self.mounter.apply(&handle, &diff).await?;

        {
            let mut session = self.session.lock();
            if self.store.epoch() == epoch {
                session.mounted = Some(fresh.clone());
            }
        }
        self.cache
            .set(&CacheKey::new(&self.repository_id, branch.as_deref()), &fresh)
            .await;

        let summary = RefreshSummary {
            written: diff.changed.len(),
            removed: diff.removed.len(),
        };
        tracing::info!(
            "Refreshed {}: {} written, {} removed",
            self.repository_id,
            summary.written,
            summary.removed
        );
        Ok(summary)
    }

    /// Write one file into the running sandbox, creating parent directories.
    pub async fn write_file(
        &self,
        path: &str,
        contents: impl Into<FileContents>,
    ) -> Result<(), OrchestratorError> {
        let contents = contents.into();
        let handle = self
            .session
            .lock()
            .handle
            .clone()
            .ok_or(OrchestratorError::NotMounted)?;
        self.mounter.write_file(&handle, path, &contents).await?;

        if let Some(tree) = self.session.lock().mounted.as_mut() {
            if let Err(e) = tree.insert_file(path, contents) {
                tracing::debug!("Written file {path} not tracked in mounted tree: {e}");
            }
        }
        Ok(())
    }

    /// Browse the live sandbox filesystem. Available once mounting finished.
    pub async fn file_tree(&self) -> Result<Vec<FileTreeNode>, OrchestratorError> {
        let handle = self
            .session
            .lock()
            .handle
            .clone()
            .ok_or(OrchestratorError::NotMounted)?;
        Ok(self.reader.read(&handle, ".").await)
    }

    /// Explicit shutdown: stop the launcher and destroy the sandbox.
    pub async fn teardown(&self) {
        self.reset_session().await;
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        // The sandbox stays in the registry for the next orchestrator.
        for task in self.session.get_mut().tasks.drain(..) {
            task.abort();
        }
    }
}
