//! Workspace sandbox orchestration.
//!
//! Boots an ephemeral sandbox for a project, fills it with the project's files
//! fetched from a git host (through a stale-while-revalidate snapshot cache),
//! installs dependencies, starts the dev server and keeps the result in sync
//! with branch switches, manual refreshes and retries. Progress is exposed as
//! an [`OrchestratorState`] read model.

pub mod config;
pub mod devserver;
pub mod error;
pub mod fetch;
pub mod orchestrator;
pub mod sandbox;
pub mod store;
pub mod tree;

pub use config::Config;
pub use error::{ErrorKind, OrchestratorError};
pub use orchestrator::{
    Orchestrator, OrchestratorConfig, OrchestratorState, Phase, RefreshSummary, StateUpdate,
};
pub use tree::{FileContents, FileSystemTree};
