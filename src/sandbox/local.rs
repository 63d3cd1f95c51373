//! Local sandbox provider: a temp directory on the host as the sandbox
//! filesystem and `tokio::process` for commands.
//!
//! No isolation beyond the working directory; intended for the CLI and for
//! development. Each command runs in its own process group so teardown also
//! stops whatever the command started (npm runs the actual server as a
//! grandchild). Readiness is detected from the localhost URL dev servers
//! print on startup, and preview URLs are `http://localhost:{port}`.

use super::{
    CommandSpec, DirEntry, EntryKind, SandboxBooter, SandboxEngine, SandboxProcess, ServerReady,
};
use crate::tree::split_path;
use async_trait::async_trait;
use parking_lot::Mutex;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, LazyLock};
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

static LISTENING_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"https?://(?:localhost|127\.0\.0\.1|0\.0\.0\.0|\[::1?\]):(\d{2,5})")
        .expect("listening-url regex is valid")
});

/// Port of the first localhost URL printed in `line`, if any.
pub fn detect_listening_port(line: &str) -> Option<u16> {
    LISTENING_URL
        .captures(line)
        .and_then(|caps| caps.get(1))
        .and_then(|port| port.as_str().parse().ok())
}

pub struct LocalEngine {
    root: PathBuf,
    /// Owns the temp directory; `None` once torn down.
    dir: Mutex<Option<TempDir>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Process group ids of spawned commands.
    groups: Mutex<Vec<u32>>,
    ready_tx: broadcast::Sender<ServerReady>,
}

impl LocalEngine {
    /// Create an engine rooted in a fresh temp directory.
    pub fn create() -> anyhow::Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix("workspace-sandbox-")
            .tempdir()
            .map_err(|e| anyhow::anyhow!("Failed to create sandbox directory: {e}"))?;
        let (ready_tx, _) = broadcast::channel(16);
        Ok(Self {
            root: dir.path().to_path_buf(),
            dir: Mutex::new(Some(dir)),
            tasks: Mutex::new(Vec::new()),
            groups: Mutex::new(Vec::new()),
            ready_tx,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> anyhow::Result<PathBuf> {
        anyhow::ensure!(self.dir.lock().is_some(), "Sandbox has been torn down");
        let parts = split_path(path)
            .ok_or_else(|| anyhow::anyhow!("Path escapes the sandbox root: {path}"))?;
        let mut resolved = self.root.clone();
        resolved.extend(parts);
        Ok(resolved)
    }
}

fn forward_lines<R>(
    reader: R,
    lines_tx: mpsc::UnboundedSender<String>,
    ready_tx: broadcast::Sender<ServerReady>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        // Read to EOF even when nobody listens, so the child never sees a
        // closed pipe.
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!("Output stream failed: {e}");
                    break;
                }
            }
            let line = String::from_utf8_lossy(&buf)
                .trim_end_matches(['\n', '\r'])
                .to_string();
            if let Some(port) = detect_listening_port(&line) {
                let _ = ready_tx.send(ServerReady {
                    port,
                    url: format!("http://localhost:{port}"),
                });
            }
            let _ = lines_tx.send(line);
        }
    })
}

/// SIGKILL every process in the group led by `pgid`.
#[cfg(unix)]
fn kill_group(pgid: u32) {
    let Ok(pgid) = libc::pid_t::try_from(pgid) else {
        return;
    };
    // SAFETY: plain signal delivery; fails with ESRCH once the group is gone.
    let rc = unsafe { libc::kill(-pgid, libc::SIGKILL) };
    if rc != 0 {
        tracing::debug!(
            "Process group {pgid} already gone: {}",
            std::io::Error::last_os_error()
        );
    }
}

#[cfg(not(unix))]
fn kill_group(_pgid: u32) {}

#[async_trait]
impl SandboxEngine for LocalEngine {
    async fn mkdir(&self, path: &str) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(self.resolve(path)?).await?;
        Ok(())
    }

    async fn write_file(&self, path: &str, contents: &[u8]) -> anyhow::Result<()> {
        tokio::fs::write(self.resolve(path)?, contents).await?;
        Ok(())
    }

    async fn read_file(&self, path: &str) -> anyhow::Result<Vec<u8>> {
        Ok(tokio::fs::read(self.resolve(path)?).await?)
    }

    async fn remove(&self, path: &str) -> anyhow::Result<()> {
        let target = self.resolve(path)?;
        let meta = match tokio::fs::symlink_metadata(&target).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if meta.is_dir() {
            tokio::fs::remove_dir_all(&target).await?;
        } else {
            tokio::fs::remove_file(&target).await?;
        }
        Ok(())
    }

    async fn read_dir(&self, path: &str) -> anyhow::Result<Vec<DirEntry>> {
        let mut dir = tokio::fs::read_dir(self.resolve(path)?).await?;
        let mut entries = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let kind = match entry.file_type().await {
                Ok(ft) if ft.is_symlink() => EntryKind::Symlink,
                Ok(ft) if ft.is_dir() => EntryKind::Directory,
                Ok(ft) if ft.is_file() => EntryKind::File,
                Ok(_) => EntryKind::Other,
                Err(e) => {
                    tracing::debug!("Cannot stat {name}: {e}");
                    EntryKind::Other
                }
            };
            entries.push(DirEntry::new(name, kind));
        }
        Ok(entries)
    }

    async fn spawn(&self, command: &CommandSpec) -> anyhow::Result<SandboxProcess> {
        let cwd = self.resolve(&command.cwd)?;
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .current_dir(&cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        let mut child = cmd
            .spawn()
            .map_err(|e| anyhow::anyhow!("Failed to spawn `{command}`: {e}"))?;
        if let Some(pid) = child.id() {
            self.groups.lock().push(pid);
        }

        let (lines_tx, lines_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = oneshot::channel();

        let mut tasks = Vec::with_capacity(3);
        if let Some(stdout) = child.stdout.take() {
            tasks.push(forward_lines(stdout, lines_tx.clone(), self.ready_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tasks.push(forward_lines(stderr, lines_tx, self.ready_tx.clone()));
        }

        let program = command.program.clone();
        tasks.push(tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code().unwrap_or(-1),
                Err(e) => {
                    tracing::warn!("Waiting on {program} failed: {e}");
                    -1
                }
            };
            let _ = exit_tx.send(code);
        }));

        let mut held = self.tasks.lock();
        held.retain(|task| !task.is_finished());
        held.extend(tasks);

        Ok(SandboxProcess {
            output: lines_rx,
            exit: exit_rx,
        })
    }

    fn server_ready(&self) -> broadcast::Receiver<ServerReady> {
        self.ready_tx.subscribe()
    }

    async fn teardown(&self) -> anyhow::Result<()> {
        for pgid in self.groups.lock().drain(..) {
            kill_group(pgid);
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        let dir = self.dir.lock().take();
        if let Some(dir) = dir {
            let path = dir.path().to_path_buf();
            tokio::task::spawn_blocking(move || dir.close())
                .await
                .map_err(|e| anyhow::anyhow!("Cleanup task failed: {e}"))?
                .map_err(|e| anyhow::anyhow!("Failed to remove {}: {e}", path.display()))?;
        }
        Ok(())
    }
}

/// Boots a [`LocalEngine`] in a fresh temp directory.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalBooter;

#[async_trait]
impl SandboxBooter for LocalBooter {
    async fn boot(&self) -> anyhow::Result<Arc<dyn SandboxEngine>> {
        let engine = tokio::task::spawn_blocking(LocalEngine::create)
            .await
            .map_err(|e| anyhow::anyhow!("Sandbox boot task failed: {e}"))??;
        tracing::info!("Local sandbox rooted at {}", engine.root().display());
        Ok(Arc::new(engine))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_common_dev_server_banners() {
        assert_eq!(detect_listening_port("  ➜  Local:   http://localhost:5173/"), Some(5173));
        assert_eq!(detect_listening_port("- Local: http://127.0.0.1:3000"), Some(3000));
        assert_eq!(detect_listening_port("ready on http://0.0.0.0:8080"), Some(8080));
        assert_eq!(detect_listening_port("see https://nextjs.org/docs"), None);
    }

    #[tokio::test]
    async fn filesystem_operations_stay_under_root() {
        let engine = LocalEngine::create().unwrap();
        engine.mkdir("src/app").await.unwrap();
        engine.write_file("src/app/page.js", b"export {}").await.unwrap();

        assert_eq!(engine.read_file("src/app/page.js").await.unwrap(), b"export {}");
        assert!(engine.root().join("src/app/page.js").exists());
        assert!(engine.write_file("../escape.txt", b"x").await.is_err());

        let entries = engine.read_dir("src").await.unwrap();
        assert_eq!(entries, vec![DirEntry::new("app", EntryKind::Directory)]);

        engine.remove("src").await.unwrap();
        engine.remove("src").await.unwrap();
        assert!(!engine.root().join("src").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn spawn_streams_output_exit_code_and_readiness() {
        let engine = LocalEngine::create().unwrap();
        let mut ready = engine.server_ready();

        let cmd = CommandSpec::new(
            "sh",
            ["-c", "echo 'Local: http://localhost:4321/'; echo oops >&2; exit 3"],
        );
        let mut process = engine.spawn(&cmd).await.unwrap();

        let mut lines = Vec::new();
        while let Some(line) = process.output.recv().await {
            lines.push(line);
        }
        lines.sort();
        assert_eq!(lines, vec!["Local: http://localhost:4321/", "oops"]);
        assert_eq!(process.exit.await.unwrap(), 3);

        let event = ready.recv().await.unwrap();
        assert_eq!(event.port, 4321);
        assert_eq!(event.url, "http://localhost:4321");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn invalid_utf8_does_not_stop_the_output() {
        let engine = LocalEngine::create().unwrap();
        let cmd = CommandSpec::new("sh", ["-c", "printf 'bad \\377 byte\\nafter\\n'"]);
        let mut process = engine.spawn(&cmd).await.unwrap();

        let mut lines = Vec::new();
        while let Some(line) = process.output.recv().await {
            lines.push(line);
        }
        assert_eq!(lines, vec!["bad \u{FFFD} byte", "after"]);
        assert_eq!(process.exit.await.unwrap(), 0);
    }

    /// Alive and not a zombie.
    #[cfg(target_os = "linux")]
    fn process_running(pid: u32) -> bool {
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Ok(stat) => {
                stat.rsplit(')').next().and_then(|rest| rest.split_whitespace().next()) != Some("Z")
            }
            Err(_) => false,
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn teardown_kills_processes_started_by_a_command() {
        let engine = LocalEngine::create().unwrap();
        let cmd = CommandSpec::new("sh", ["-c", "sleep 30 & echo $!; wait"]);
        let mut process = engine.spawn(&cmd).await.unwrap();
        let pid: u32 = process.output.recv().await.unwrap().trim().parse().unwrap();
        assert!(process_running(pid));

        engine.teardown().await.unwrap();

        let gone = async {
            while process_running(pid) {
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            }
        };
        tokio::time::timeout(std::time::Duration::from_secs(5), gone)
            .await
            .expect("background process outlived teardown");
    }

    #[tokio::test]
    async fn teardown_removes_the_root() {
        let engine = LocalBooter.boot().await.unwrap();
        engine.mkdir("x").await.unwrap();
        engine.teardown().await.unwrap();
        assert!(engine.mkdir("y").await.is_err());
    }
}
