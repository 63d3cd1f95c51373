//! Walks the live sandbox filesystem into a display tree for the file browser.

use super::{EntryKind, SandboxEngine, SandboxHandle};
use crate::tree::join_path;
use futures_util::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashSet;

/// Directories skipped by default: dependencies, VCS metadata and build output.
pub const DEFAULT_SKIP_DIRS: &[&str] = &["node_modules", ".git", ".next", "dist", "build", ".cache"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    File,
    Directory,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileTreeNode {
    pub name: String,
    pub path: String,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<FileTreeNode>>,
}

/// Directories before files, then case-sensitive by name.
fn display_order(a: &FileTreeNode, b: &FileTreeNode) -> Ordering {
    match (a.kind, b.kind) {
        (NodeKind::Directory, NodeKind::File) => Ordering::Less,
        (NodeKind::File, NodeKind::Directory) => Ordering::Greater,
        _ => a.name.cmp(&b.name),
    }
}

#[derive(Debug, Clone)]
pub struct FileTreeReader {
    skip: HashSet<String>,
}

impl Default for FileTreeReader {
    fn default() -> Self {
        Self::new(DEFAULT_SKIP_DIRS.iter().copied())
    }
}

impl FileTreeReader {
    pub fn new<I, S>(skip: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            skip: skip.into_iter().map(Into::into).collect(),
        }
    }

    /// List `root` recursively. Never fails: unreadable directories come back
    /// empty and symlinks or special files are shown as plain files.
    pub async fn read(&self, handle: &SandboxHandle, root: &str) -> Vec<FileTreeNode> {
        self.walk(handle.engine(), root.to_string()).await
    }

    fn walk<'a>(&'a self, engine: &'a dyn SandboxEngine, dir: String) -> BoxFuture<'a, Vec<FileTreeNode>> {
        async move {
            let entries = match engine.read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) => {
                    tracing::debug!("Skipping unreadable directory {dir}: {e:#}");
                    return Vec::new();
                }
            };

            let mut nodes = Vec::with_capacity(entries.len());
            for entry in entries {
                let path = join_path(&dir, &entry.name);
                match entry.kind {
                    EntryKind::Directory if self.skip.contains(&entry.name) => continue,
                    EntryKind::Directory => {
                        let children = self.walk(engine, path.clone()).await;
                        nodes.push(FileTreeNode {
                            name: entry.name,
                            path,
                            kind: NodeKind::Directory,
                            children: Some(children),
                        });
                    }
                    EntryKind::Symlink if self.skip.contains(&entry.name) => continue,
                    EntryKind::File | EntryKind::Symlink | EntryKind::Other => {
                        nodes.push(FileTreeNode {
                            name: entry.name,
                            path,
                            kind: NodeKind::File,
                            children: None,
                        });
                    }
                }
            }

            nodes.sort_by(display_order);
            nodes
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::memory::MemoryEngine;
    use crate::sandbox::FileSystemMounter;
    use crate::tree::FileSystemTree;
    use std::sync::Arc;

    async fn mounted(files: &[(&str, &str)]) -> SandboxHandle {
        let handle = SandboxHandle::new(Arc::new(MemoryEngine::new()));
        let tree = FileSystemTree::from_files(files.iter().copied()).unwrap();
        FileSystemMounter::new().mount(&handle, &tree).await.unwrap();
        handle
    }

    fn names(nodes: &[FileTreeNode]) -> Vec<&str> {
        nodes.iter().map(|n| n.name.as_str()).collect()
    }

    #[tokio::test]
    async fn skips_configured_directories_and_sorts_dirs_first() {
        let handle = mounted(&[
            ("node_modules/react/index.js", "x"),
            ("node_modules/react/package.json", "{}"),
            (".git/HEAD", "ref: refs/heads/main"),
            ("src/b.js", "b"),
            ("src/a.js", "a"),
            ("Zeta/z.txt", "z"),
            ("alpha.txt", "a"),
            ("README.md", "# hi"),
        ])
        .await;

        let tree = FileTreeReader::default().read(&handle, ".").await;

        assert_eq!(names(&tree), vec!["Zeta", "src", "README.md", "alpha.txt"]);
        let src = &tree[1];
        assert_eq!(src.kind, NodeKind::Directory);
        assert_eq!(src.path, "src");
        let children = src.children.as_ref().unwrap();
        assert_eq!(names(children), vec!["a.js", "b.js"]);
        assert_eq!(children[0].path, "src/a.js");
    }

    #[tokio::test]
    async fn skip_set_is_configurable() {
        let handle = mounted(&[("dist/out.js", "x"), ("node_modules/a.js", "y")]).await;

        let tree = FileTreeReader::new(["dist"]).read(&handle, ".").await;

        assert_eq!(names(&tree), vec!["node_modules"]);
    }

    #[tokio::test]
    async fn missing_root_yields_empty_listing() {
        let handle = mounted(&[("a.txt", "a")]).await;
        assert!(FileTreeReader::default().read(&handle, "nope").await.is_empty());
    }

    #[test]
    fn serializes_kind_as_type() {
        let node = FileTreeNode {
            name: "a.js".into(),
            path: "src/a.js".into(),
            kind: NodeKind::File,
            children: None,
        };
        let json = serde_json::to_value(&node).unwrap();
        assert_eq!(json["type"], "file");
        assert!(json.get("children").is_none());
    }
}
