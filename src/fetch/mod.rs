//! File-tree fetch collaborator: turns a repository id and optional branch
//! into a [`FileSystemTree`].

pub mod github;

use crate::tree::FileSystemTree;
use async_trait::async_trait;

pub use github::GitHubTreeFetcher;

/// Remote source of project snapshots. Implementations keep no cache of their
/// own; caching is the orchestrator's job.
#[async_trait]
pub trait TreeFetcher: Send + Sync {
    /// Fetch the tree for `repository_id` at `branch` (the default branch when
    /// `None`).
    async fn fetch_tree(&self, repository_id: &str, branch: Option<&str>) -> anyhow::Result<FileSystemTree>;

    /// Same as [`fetch_tree`](Self::fetch_tree) but bypassing any HTTP or CDN
    /// caching between us and the remote.
    async fn fetch_tree_fresh(
        &self,
        repository_id: &str,
        branch: Option<&str>,
    ) -> anyhow::Result<FileSystemTree> {
        self.fetch_tree(repository_id, branch).await
    }
}
