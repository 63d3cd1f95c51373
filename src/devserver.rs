//! Dev-server launcher: detects the project type in a mounted sandbox,
//! installs dependencies, starts the dev command and reports progress as a
//! stream of [`DevServerEvent`]s.
//!
//! The dev process is never awaited to completion. It runs until the sandbox
//! is torn down; if it exits on its own that is reported as a failure.

use crate::error::{ErrorKind, LaunchError, LaunchStage};
use crate::sandbox::{CommandSpec, SandboxHandle, SandboxProcess, ServerReady};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

const CONFIG_EXTENSIONS: &[&str] = &["js", "mjs", "cjs", "ts"];

// ── Project detection ───────────────────────────────────────────────────────────

/// How the project is started. Detection always yields one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProjectKind {
    NextJs,
    Vite,
    /// Generic fallback: `npm run <script>`.
    Script(String),
}

impl ProjectKind {
    /// Detect from the names in the project root and the parsed `package.json`.
    pub fn detect(root_entries: &[String], package_json: Option<&serde_json::Value>) -> Self {
        if has_config(root_entries, "next.config") || has_dependency(package_json, "next") {
            return ProjectKind::NextJs;
        }
        if has_config(root_entries, "vite.config") || has_dependency(package_json, "vite") {
            return ProjectKind::Vite;
        }

        let scripts = package_json.and_then(|pkg| pkg.get("scripts"));
        let declared = |name: &str| scripts.and_then(|s| s.get(name)).is_some();
        let script = if declared("dev") {
            "dev"
        } else if declared("start") {
            "start"
        } else {
            "dev"
        };
        ProjectKind::Script(script.to_string())
    }

    pub fn install_command(&self) -> CommandSpec {
        CommandSpec::new("npm", ["install"])
    }

    pub fn dev_command(&self) -> CommandSpec {
        match self {
            ProjectKind::NextJs => CommandSpec::new(
                "npx",
                ["next", "dev", "--port", "3000", "--hostname", "0.0.0.0"],
            ),
            ProjectKind::Vite => {
                CommandSpec::new("npx", ["vite", "--host", "0.0.0.0", "--port", "5173"])
            }
            ProjectKind::Script(name) => CommandSpec::new("npm", ["run", name.as_str()]),
        }
    }
}

impl fmt::Display for ProjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProjectKind::NextJs => f.write_str("Next.js"),
            ProjectKind::Vite => f.write_str("Vite"),
            ProjectKind::Script(name) => write!(f, "npm script `{name}`"),
        }
    }
}

fn has_config(entries: &[String], stem: &str) -> bool {
    CONFIG_EXTENSIONS
        .iter()
        .any(|ext| entries.iter().any(|e| *e == format!("{stem}.{ext}")))
}

fn has_dependency(package_json: Option<&serde_json::Value>, name: &str) -> bool {
    let Some(pkg) = package_json else {
        return false;
    };
    ["dependencies", "devDependencies"]
        .iter()
        .any(|section| pkg.get(section).and_then(|deps| deps.get(name)).is_some())
}

// ── Status stream ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DevServerEvent {
    Installing,
    Starting,
    Output(String),
    /// The server is listening. May arrive more than once; the latest wins.
    Ready(ServerReady),
    Failed { message: String, kind: ErrorKind },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DevServerStatus {
    #[default]
    Idle,
    Installing,
    Starting,
    Running,
    Error,
}

/// Launcher-side view of one boot attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DevServerState {
    pub status: DevServerStatus,
    pub url: Option<String>,
    pub error: Option<String>,
    pub output: Vec<String>,
}

impl DevServerState {
    pub fn apply(&mut self, event: &DevServerEvent) {
        match event {
            DevServerEvent::Installing => {
                self.status = DevServerStatus::Installing;
                self.url = None;
                self.error = None;
            }
            DevServerEvent::Starting => self.status = DevServerStatus::Starting,
            DevServerEvent::Output(line) => self.output.push(line.clone()),
            DevServerEvent::Ready(server) => {
                if self.status != DevServerStatus::Error {
                    self.status = DevServerStatus::Running;
                    self.url = Some(server.url.clone());
                }
            }
            DevServerEvent::Failed { message, .. } => {
                self.status = DevServerStatus::Error;
                self.url = None;
                self.error = Some(message.clone());
            }
        }
    }
}

// ── Launcher ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct LauncherConfig {
    /// Limit on the dependency install. `None` waits forever.
    pub install_timeout: Option<Duration>,
    /// Limit on the dev server reporting its first listening port.
    pub ready_timeout: Option<Duration>,
}

#[derive(Debug, Clone, Default)]
pub struct DevServerLauncher {
    config: LauncherConfig,
}

impl DevServerLauncher {
    pub fn new(config: LauncherConfig) -> Self {
        Self { config }
    }

    /// Start install + dev server in the background. Progress goes to
    /// `events`; the task ends when the launch fails, the dev process exits,
    /// or the receiver is dropped.
    pub fn start(
        &self,
        handle: SandboxHandle,
        events: mpsc::UnboundedSender<DevServerEvent>,
    ) -> JoinHandle<()> {
        let launcher = self.clone();
        tokio::spawn(async move {
            if let Err(e) = launcher.drive(&handle, &events).await {
                tracing::warn!("Dev server launch in sandbox {} failed: {e}", handle.id());
                let _ = events.send(DevServerEvent::Failed {
                    message: e.to_string(),
                    kind: e.kind(),
                });
            }
        })
    }

    /// Inspect the mounted project root.
    pub async fn detect(&self, handle: &SandboxHandle) -> ProjectKind {
        let engine = handle.engine();
        let entries: Vec<String> = match engine.read_dir(".").await {
            Ok(entries) => entries.into_iter().map(|e| e.name).collect(),
            Err(e) => {
                tracing::debug!("Cannot list project root: {e:#}");
                Vec::new()
            }
        };

        let package_json: Option<serde_json::Value> = if entries.iter().any(|e| e == "package.json") {
            match engine.read_file("package.json").await {
                Ok(bytes) => serde_json::from_slice(&bytes)
                    .map_err(|e| tracing::warn!("Ignoring unparsable package.json: {e}"))
                    .ok(),
                Err(e) => {
                    tracing::debug!("Cannot read package.json: {e:#}");
                    None
                }
            }
        } else {
            None
        };

        ProjectKind::detect(&entries, package_json.as_ref())
    }

    async fn drive(
        &self,
        handle: &SandboxHandle,
        events: &mpsc::UnboundedSender<DevServerEvent>,
    ) -> Result<(), LaunchError> {
        let kind = self.detect(handle).await;
        tracing::info!("Detected {kind} project in sandbox {}", handle.id());

        let _ = events.send(DevServerEvent::Installing);
        let install = spawn(handle, &kind.install_command(), LaunchStage::Install).await?;
        let exit_code = match self.config.install_timeout {
            Some(limit) => tokio::time::timeout(limit, pump_until_exit(install, events))
                .await
                .map_err(|_| LaunchError::InstallTimedOut {
                    secs: limit.as_secs(),
                })??,
            None => pump_until_exit(install, events).await?,
        };
        if exit_code != 0 {
            return Err(LaunchError::InstallFailed { exit_code });
        }

        // Subscribe before spawning so an early announcement is not missed.
        let ready = handle.engine().server_ready();
        let _ = events.send(DevServerEvent::Starting);
        let dev = spawn(handle, &kind.dev_command(), LaunchStage::DevServer).await?;
        self.supervise(dev, ready, events).await
    }

    async fn supervise(
        &self,
        process: SandboxProcess,
        mut ready: broadcast::Receiver<ServerReady>,
        events: &mpsc::UnboundedSender<DevServerEvent>,
    ) -> Result<(), LaunchError> {
        let SandboxProcess { mut output, mut exit } = process;
        let mut output_open = true;
        let mut ready_open = true;
        let mut announced = false;

        let limit = self.config.ready_timeout;
        let deadline = async move {
            match limit {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                biased;
                () = events.closed() => return Ok(()),
                line = output.recv(), if output_open => match line {
                    Some(line) => {
                        let _ = events.send(DevServerEvent::Output(line));
                    }
                    None => output_open = false,
                },
                server = ready.recv(), if ready_open => match server {
                    Ok(server) => {
                        tracing::info!("Dev server listening on port {} at {}", server.port, server.url);
                        announced = true;
                        let _ = events.send(DevServerEvent::Ready(server));
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!("Missed {skipped} server-ready notifications");
                    }
                    Err(broadcast::error::RecvError::Closed) => ready_open = false,
                },
                code = &mut exit => {
                    drain(&mut output, events);
                    return Err(match code {
                        Ok(exit_code) => LaunchError::DevServerExited { exit_code },
                        Err(_) => LaunchError::ProcessLost { stage: LaunchStage::DevServer },
                    });
                }
                () = &mut deadline, if !announced => {
                    return Err(LaunchError::ReadyTimedOut {
                        secs: limit.map(|l| l.as_secs()).unwrap_or_default(),
                    });
                }
            }
        }
    }
}

async fn spawn(
    handle: &SandboxHandle,
    command: &CommandSpec,
    stage: LaunchStage,
) -> Result<SandboxProcess, LaunchError> {
    tracing::info!("Running `{command}` in sandbox {}", handle.id());
    handle
        .engine()
        .spawn(command)
        .await
        .map_err(|source| LaunchError::Spawn {
            stage,
            command: command.to_string(),
            source,
        })
}

/// Forward output until the process exits, then return its exit code.
async fn pump_until_exit(
    process: SandboxProcess,
    events: &mpsc::UnboundedSender<DevServerEvent>,
) -> Result<i32, LaunchError> {
    let SandboxProcess { mut output, mut exit } = process;
    let mut output_open = true;
    loop {
        tokio::select! {
            biased;
            line = output.recv(), if output_open => match line {
                Some(line) => {
                    let _ = events.send(DevServerEvent::Output(line));
                }
                None => output_open = false,
            },
            code = &mut exit => {
                drain(&mut output, events);
                return code.map_err(|_| LaunchError::ProcessLost { stage: LaunchStage::Install });
            }
        }
    }
}

/// Forward lines already buffered without waiting for more.
fn drain(output: &mut mpsc::UnboundedReceiver<String>, events: &mpsc::UnboundedSender<DevServerEvent>) {
    while let Ok(line) = output.try_recv() {
        let _ = events.send(DevServerEvent::Output(line));
    }
}
