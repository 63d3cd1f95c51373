//! Typed error hierarchy for the sandbox orchestrator.
//!
//! - `TreeError`: malformed snapshot paths
//! - `SandboxError`: booting the shared sandbox engine
//! - `MountError`: writing snapshots into a running sandbox
//! - `LaunchError`: dependency install and dev-server supervision
//! - `OrchestratorError`: the boot pipeline and the user-triggered operations
//!
//! Every fatal error maps to an [`ErrorKind`] so the UI can pick a message
//! without parsing strings.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Coarse failure classification surfaced next to the error message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Network,
    SandboxBoot,
    Mount,
    Install,
    DevServer,
    Timeout,
    ResourceExhaustion,
}

impl ErrorKind {
    pub fn label(&self) -> &'static str {
        match self {
            ErrorKind::Network => "network",
            ErrorKind::SandboxBoot => "sandbox_boot",
            ErrorKind::Mount => "mount",
            ErrorKind::Install => "install",
            ErrorKind::DevServer => "dev_server",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ResourceExhaustion => "resource_exhaustion",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TreeError {
    #[error("Invalid path {0:?}")]
    InvalidPath(String),

    #[error("{0} is a file, not a directory")]
    NotADirectory(String),

    #[error("{0} is a directory")]
    IsADirectory(String),

    #[error("{0} does not exist")]
    NotFound(String),
}

/// Errors from acquiring the shared sandbox engine.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Sandbox boot failed: {0}")]
    Boot(String),

    #[error("Sandbox was torn down while it was booting")]
    TornDown,
}

/// Errors from writing a snapshot into a sandbox.
#[derive(Debug, Error)]
pub enum MountError {
    #[error("Invalid sandbox path {0:?}")]
    InvalidPath(String),

    #[error("Failed to create directory {path}: {source}")]
    CreateDir {
        path: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Failed to write {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Failed to remove {path}: {source}")]
    Remove {
        path: String,
        #[source]
        source: anyhow::Error,
    },
}

impl MountError {
    pub fn kind(&self) -> ErrorKind {
        let source = match self {
            MountError::InvalidPath(_) => return ErrorKind::Mount,
            MountError::CreateDir { source, .. }
            | MountError::Write { source, .. }
            | MountError::Remove { source, .. } => source,
        };
        if is_resource_exhaustion(source) {
            ErrorKind::ResourceExhaustion
        } else {
            ErrorKind::Mount
        }
    }
}

fn is_resource_exhaustion(err: &anyhow::Error) -> bool {
    err.chain()
        .filter_map(|cause| cause.downcast_ref::<std::io::Error>())
        .any(|io| {
            matches!(
                io.kind(),
                std::io::ErrorKind::StorageFull | std::io::ErrorKind::OutOfMemory
            )
        })
}

/// Which launcher step a process belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchStage {
    Install,
    DevServer,
}

impl fmt::Display for LaunchStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LaunchStage::Install => f.write_str("install"),
            LaunchStage::DevServer => f.write_str("dev server"),
        }
    }
}

/// Errors from installing dependencies and supervising the dev server.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("Failed to spawn {stage} command `{command}`: {source}")]
    Spawn {
        stage: LaunchStage,
        command: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Dependency install failed with exit code {exit_code}")]
    InstallFailed { exit_code: i32 },

    #[error("Dependency install did not finish within {secs}s")]
    InstallTimedOut { secs: u64 },

    #[error("Dev server exited with code {exit_code}")]
    DevServerExited { exit_code: i32 },

    #[error("Dev server did not report a listening port within {secs}s")]
    ReadyTimedOut { secs: u64 },

    #[error("Lost track of the {stage} process")]
    ProcessLost { stage: LaunchStage },
}

impl LaunchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LaunchError::Spawn { stage, source, .. } => {
                if is_resource_exhaustion(source) {
                    ErrorKind::ResourceExhaustion
                } else {
                    stage_kind(*stage)
                }
            }
            LaunchError::InstallFailed { .. } => ErrorKind::Install,
            LaunchError::InstallTimedOut { .. } | LaunchError::ReadyTimedOut { .. } => {
                ErrorKind::Timeout
            }
            LaunchError::DevServerExited { .. } => ErrorKind::DevServer,
            LaunchError::ProcessLost { stage } => stage_kind(*stage),
        }
    }
}

fn stage_kind(stage: LaunchStage) -> ErrorKind {
    match stage {
        LaunchStage::Install => ErrorKind::Install,
        LaunchStage::DevServer => ErrorKind::DevServer,
    }
}

/// Errors from the boot pipeline and the user-triggered operations.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error("Failed to fetch project files: {0}")]
    Fetch(#[source] anyhow::Error),

    #[error("Timed out after {secs}s while {phase}")]
    Timeout { phase: &'static str, secs: u64 },

    #[error(transparent)]
    Mount(#[from] MountError),

    #[error("No sandbox is mounted yet")]
    NotMounted,

    #[error("Boot attempt was superseded by a newer one")]
    Superseded,
}

impl OrchestratorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            OrchestratorError::Sandbox(_) => ErrorKind::SandboxBoot,
            OrchestratorError::Fetch(_) => ErrorKind::Network,
            OrchestratorError::Timeout { .. } => ErrorKind::Timeout,
            OrchestratorError::Mount(e) => e.kind(),
            OrchestratorError::NotMounted | OrchestratorError::Superseded => ErrorKind::SandboxBoot,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_failure_message_carries_exit_code() {
        let err = LaunchError::InstallFailed { exit_code: 127 };
        assert!(err.to_string().contains("127"));
        assert_eq!(err.kind(), ErrorKind::Install);
    }

    #[test]
    fn full_disk_is_resource_exhaustion() {
        let io = std::io::Error::new(std::io::ErrorKind::StorageFull, "disk full");
        let err = MountError::Write {
            path: "big.bin".into(),
            source: anyhow::Error::new(io),
        };
        assert_eq!(err.kind(), ErrorKind::ResourceExhaustion);
        assert_eq!(
            OrchestratorError::Mount(err).kind(),
            ErrorKind::ResourceExhaustion
        );
    }

    #[test]
    fn fetch_failures_are_network_errors() {
        let err = OrchestratorError::Fetch(anyhow::anyhow!("connection refused"));
        assert_eq!(err.kind(), ErrorKind::Network);
        assert_eq!(err.kind().to_string(), "network");
    }
}
