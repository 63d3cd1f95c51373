//! Writes snapshots into a running sandbox.
//!
//! Engines only promise `mkdir -p` and plain file writes, so every write here
//! creates its parent directory first. This is also the implementation behind
//! single-file edits coming from the chat pipeline.

use super::SandboxHandle;
use crate::error::MountError;
use crate::tree::{split_path, FileContents, FileSystemTree, TreeDiff};

/// Stateless mounter; all state lives in the sandbox.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileSystemMounter;

/// Normalize a sandbox path, rejecting anything that escapes the root.
fn normalize(path: &str) -> Result<(String, String), MountError> {
    let parts = split_path(path).ok_or_else(|| MountError::InvalidPath(path.to_string()))?;
    let Some((_, parents)) = parts.split_last() else {
        return Err(MountError::InvalidPath(path.to_string()));
    };
    Ok((parts.join("/"), parents.join("/")))
}

impl FileSystemMounter {
    pub fn new() -> Self {
        Self
    }

    /// Mount a whole snapshot: directories first (parents before children),
    /// then file contents.
    pub async fn mount(&self, handle: &SandboxHandle, tree: &FileSystemTree) -> Result<(), MountError> {
        let engine = handle.engine();
        for dir in tree.directories() {
            engine
                .mkdir(&dir)
                .await
                .map_err(|source| MountError::CreateDir { path: dir.clone(), source })?;
        }

        let files = tree.files();
        for (path, contents) in &files {
            engine
                .write_file(path, contents.as_bytes())
                .await
                .map_err(|source| MountError::Write {
                    path: path.clone(),
                    source,
                })?;
        }

        tracing::info!(
            "Mounted {} files into sandbox {}",
            files.len(),
            handle.id()
        );
        Ok(())
    }

    /// Write one file, creating any missing parent directories.
    pub async fn write_file(
        &self,
        handle: &SandboxHandle,
        path: &str,
        contents: &FileContents,
    ) -> Result<(), MountError> {
        let (path, parent) = normalize(path)?;
        let engine = handle.engine();
        if !parent.is_empty() {
            engine
                .mkdir(&parent)
                .await
                .map_err(|source| MountError::CreateDir {
                    path: parent.clone(),
                    source,
                })?;
        }
        if let Err(source) = engine.write_file(&path, contents.as_bytes()).await {
            return Err(MountError::Write { path, source });
        }
        Ok(())
    }

    /// The tree with `paths` excised. Pure; the sandbox is not touched.
    pub fn remove<P: AsRef<str>>(&self, tree: &FileSystemTree, paths: &[P]) -> FileSystemTree {
        tree.without(paths)
    }

    /// Delete removed paths, then write changed files, in a live sandbox.
    pub async fn apply(&self, handle: &SandboxHandle, diff: &TreeDiff) -> Result<(), MountError> {
        for path in &diff.removed {
            let (path, _) = normalize(path)?;
            if let Err(source) = handle.engine().remove(&path).await {
                return Err(MountError::Remove { path, source });
            }
        }
        for (path, contents) in &diff.changed {
            self.write_file(handle, path, contents).await?;
        }
        tracing::debug!(
            "Applied diff to sandbox {}: {} written, {} removed",
            handle.id(),
            diff.changed.len(),
            diff.removed.len()
        );
        Ok(())
    }
}
