//! TOML configuration.
//!
//! Looked up at an explicit path, else `config.toml` in the platform config
//! directory, else built-in defaults. `GITHUB_TOKEN` and
//! `WORKSPACE_SANDBOX_DB` override the file.

use crate::devserver::LauncherConfig;
use crate::fetch::github::GITHUB_API_BASE;
use crate::orchestrator::OrchestratorConfig;
use crate::sandbox::reader::DEFAULT_SKIP_DIRS;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub github: GitHubConfig,
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
    #[serde(default)]
    pub tree: TreeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    /// SQLite file for snapshots; `~` is expanded.
    pub db_path: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            db_path: "~/.workspace-sandbox/snapshots.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GitHubConfig {
    pub api_base: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            api_base: GITHUB_API_BASE.to_string(),
            token: None,
        }
    }
}

/// Per-phase limits in seconds. `0` disables a limit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutsConfig {
    pub fetch_secs: u64,
    pub install_secs: u64,
    pub ready_secs: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            fetch_secs: 120,
            install_secs: 900,
            ready_secs: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TreeConfig {
    /// Directory names hidden from the file browser.
    pub skip: Vec<String>,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            skip: DEFAULT_SKIP_DIRS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

fn limit(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse workspace-sandbox config")
    }

    /// `config.toml` in the platform config directory.
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "workspace-sandbox")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Load from `explicit` (which must exist) or the default location, then
    /// apply environment overrides. Returns the file actually read, if any.
    pub fn load_or_default(explicit: Option<&Path>) -> Result<(Self, Option<PathBuf>)> {
        let (mut config, source) = match explicit {
            Some(path) => (Self::load(path)?, Some(path.to_path_buf())),
            None => match Self::default_path().filter(|p| p.exists()) {
                Some(path) => (Self::load(&path)?, Some(path)),
                None => (Self::default(), None),
            },
        };
        config.apply_env(|name| std::env::var(name).ok());
        Ok((config, source))
    }

    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(token) = var("GITHUB_TOKEN").filter(|t| !t.trim().is_empty()) {
            self.github.token = Some(token);
        }
        if let Some(db) = var("WORKSPACE_SANDBOX_DB").filter(|p| !p.trim().is_empty()) {
            self.cache.db_path = db;
        }
    }

    pub fn db_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.cache.db_path).into_owned())
    }

    pub fn launcher_config(&self) -> LauncherConfig {
        LauncherConfig {
            install_timeout: limit(self.timeouts.install_secs),
            ready_timeout: limit(self.timeouts.ready_secs),
        }
    }

    pub fn orchestrator_config(&self, repository_id: &str, branch: Option<String>) -> OrchestratorConfig {
        OrchestratorConfig {
            fetch_timeout: limit(self.timeouts.fetch_secs),
            launcher: self.launcher_config(),
            skip_dirs: self.tree.skip.clone(),
            ..OrchestratorConfig::new(repository_id)
        }
        .with_branch(branch)
    }

    /// Effective configuration as TOML, token redacted.
    pub fn to_toml(&self) -> Result<String> {
        let mut shown = self.clone();
        if shown.github.token.is_some() {
            shown.github.token = Some("<redacted>".to_string());
        }
        toml::to_string_pretty(&shown).context("Failed to serialize config")
    }
}
