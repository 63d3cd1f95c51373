//! Recursive project snapshot exchanged between the fetcher, the snapshot
//! cache and the sandbox mounter.
//!
//! The JSON shape is the sandbox mount format:
//! `{"src": {"directory": {"main.js": {"file": {"contents": "..."}}}}}`.
//! Paths are `/`-separated and relative to the project root; a leading `/` or
//! `./` is ignored and `..` is never accepted.

use crate::error::TreeError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// File payload. Valid UTF-8 stays a JSON string, anything else is kept as a
/// byte array so the snapshot survives a cache round-trip unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FileContents {
    Text(String),
    Bytes(Vec<u8>),
}

impl FileContents {
    /// Classify raw bytes as text when they decode as UTF-8.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        match String::from_utf8(bytes) {
            Ok(text) => Self::Text(text),
            Err(e) => Self::Bytes(e.into_bytes()),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Text(text) => text.as_bytes(),
            Self::Bytes(bytes) => bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }
}

impl From<&str> for FileContents {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<String> for FileContents {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<Vec<u8>> for FileContents {
    fn from(bytes: Vec<u8>) -> Self {
        Self::from_bytes(bytes)
    }
}

/// A single entry: a file payload or a nested directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FsNode {
    File { contents: FileContents },
    Directory(FileSystemTree),
}

impl FsNode {
    pub fn file(contents: impl Into<FileContents>) -> Self {
        Self::File {
            contents: contents.into(),
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, Self::Directory(_))
    }
}

/// Name → node mapping for one directory level.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileSystemTree(BTreeMap<String, FsNode>);

/// Files to write and paths to delete to turn one snapshot into another.
/// Removals are meant to be applied first: a path that turns from a
/// directory into a file is listed in `removed` as well as in `changed`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeDiff {
    pub changed: Vec<(String, FileContents)>,
    pub removed: Vec<String>,
}

impl TreeDiff {
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.removed.is_empty()
    }
}

/// Split a sandbox path into components. Returns `None` when the path tries
/// to climb out of the root.
pub fn split_path(path: &str) -> Option<Vec<&str>> {
    let mut parts = Vec::new();
    for part in path.trim().split('/') {
        match part {
            "" | "." => continue,
            ".." => return None,
            other => parts.push(other),
        }
    }
    Some(parts)
}

/// Join a parent path and an entry name, treating `""` and `"."` as the root.
pub fn join_path(parent: &str, name: &str) -> String {
    let parent = parent.trim_matches('/');
    if parent.is_empty() || parent == "." {
        name.to_string()
    } else {
        format!("{parent}/{name}")
    }
}

/// Proper ancestors of a normalized path, nearest first.
fn ancestors(path: &str) -> impl Iterator<Item = &str> {
    path.rmatch_indices('/').map(move |(i, _)| &path[..i])
}

fn parts_or_err(path: &str) -> Result<Vec<&str>, TreeError> {
    split_path(path).ok_or_else(|| TreeError::InvalidPath(path.to_string()))
}

impl FileSystemTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a tree from `path → contents` pairs, creating directories as needed.
    pub fn from_files<I, P, C>(files: I) -> Result<Self, TreeError>
    where
        I: IntoIterator<Item = (P, C)>,
        P: AsRef<str>,
        C: Into<FileContents>,
    {
        let mut tree = Self::new();
        for (path, contents) in files {
            tree.insert_file(path.as_ref(), contents)?;
        }
        Ok(tree)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Entries of this directory level, ordered by name.
    pub fn entries(&self) -> impl Iterator<Item = (&String, &FsNode)> {
        self.0.iter()
    }

    pub fn get(&self, path: &str) -> Option<&FsNode> {
        let parts = split_path(path)?;
        let (last, parents) = parts.split_last()?;
        let mut dir = self;
        for part in parents {
            match dir.0.get(*part)? {
                FsNode::Directory(child) => dir = child,
                FsNode::File { .. } => return None,
            }
        }
        dir.0.get(*last)
    }

    /// The directory at `path`; the empty path is the root itself.
    pub fn dir(&self, path: &str) -> Option<&FileSystemTree> {
        let parts = split_path(path)?;
        let mut dir = self;
        for part in parts {
            match dir.0.get(part)? {
                FsNode::Directory(child) => dir = child,
                FsNode::File { .. } => return None,
            }
        }
        Some(dir)
    }

    pub fn dir_mut(&mut self, path: &str) -> Option<&mut FileSystemTree> {
        let parts = split_path(path)?;
        let mut dir = self;
        for part in parts {
            match dir.0.get_mut(part)? {
                FsNode::Directory(child) => dir = child,
                FsNode::File { .. } => return None,
            }
        }
        Some(dir)
    }

    pub fn file(&self, path: &str) -> Option<&FileContents> {
        match self.get(path)? {
            FsNode::File { contents } => Some(contents),
            FsNode::Directory(_) => None,
        }
    }

    /// `mkdir -p`: create every missing directory along `path`.
    pub fn create_dir_all(&mut self, path: &str) -> Result<&mut FileSystemTree, TreeError> {
        let parts = parts_or_err(path)?;
        let mut dir = self;
        let mut walked = String::new();
        for part in parts {
            walked = join_path(&walked, part);
            let node = dir
                .0
                .entry(part.to_string())
                .or_insert_with(|| FsNode::Directory(FileSystemTree::new()));
            match node {
                FsNode::Directory(child) => dir = child,
                FsNode::File { .. } => return Err(TreeError::NotADirectory(walked)),
            }
        }
        Ok(dir)
    }

    /// Insert or replace a file, creating intermediate directories.
    pub fn insert_file(
        &mut self,
        path: &str,
        contents: impl Into<FileContents>,
    ) -> Result<(), TreeError> {
        let parts = parts_or_err(path)?;
        let Some((name, parents)) = parts.split_last() else {
            return Err(TreeError::InvalidPath(path.to_string()));
        };
        let dir = self.create_dir_all(&parents.join("/"))?;
        if let Some(FsNode::Directory(_)) = dir.0.get(*name) {
            return Err(TreeError::IsADirectory(path.to_string()));
        }
        dir.0.insert((*name).to_string(), FsNode::file(contents));
        Ok(())
    }

    /// Insert a node directly under this directory level.
    pub fn insert_node(&mut self, name: impl Into<String>, node: FsNode) {
        self.0.insert(name.into(), node);
    }

    /// Detach the node at `path`, if present.
    pub fn remove(&mut self, path: &str) -> Option<FsNode> {
        let parts = split_path(path)?;
        let (last, parents) = parts.split_last()?;
        let dir = self.dir_mut(&parents.join("/"))?;
        dir.0.remove(*last)
    }

    /// Copy of this tree with every path in `paths` excised. Missing paths are
    /// ignored.
    pub fn without<P: AsRef<str>>(&self, paths: &[P]) -> FileSystemTree {
        let mut pruned = self.clone();
        for path in paths {
            pruned.remove(path.as_ref());
        }
        pruned
    }

    /// Every file as `(path, contents)`, depth-first in name order.
    pub fn files(&self) -> Vec<(String, &FileContents)> {
        let mut out = Vec::new();
        self.collect_files("", &mut out);
        out
    }

    fn collect_files<'a>(&'a self, prefix: &str, out: &mut Vec<(String, &'a FileContents)>) {
        for (name, node) in &self.0 {
            let path = join_path(prefix, name);
            match node {
                FsNode::File { contents } => out.push((path, contents)),
                FsNode::Directory(child) => child.collect_files(&path, out),
            }
        }
    }

    /// Every directory path, parents before children.
    pub fn directories(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_dirs("", &mut out);
        out
    }

    fn collect_dirs(&self, prefix: &str, out: &mut Vec<String>) {
        for (name, node) in &self.0 {
            if let FsNode::Directory(child) = node {
                let path = join_path(prefix, name);
                out.push(path.clone());
                child.collect_dirs(&path, out);
            }
        }
    }

    pub fn file_count(&self) -> usize {
        self.files().len()
    }

    /// What must be written and removed to turn `self` into `newer`.
    pub fn diff(&self, newer: &FileSystemTree) -> TreeDiff {
        let old: BTreeMap<String, &FileContents> = self.files().into_iter().collect();
        let new: BTreeMap<String, &FileContents> = newer.files().into_iter().collect();

        let changed = new
            .iter()
            .filter(|(path, contents)| old.get(*path) != Some(*contents))
            .map(|(path, contents)| (path.clone(), (*contents).clone()))
            .collect();
        let mut removed: BTreeSet<String> = old
            .keys()
            .filter(|path| !new.contains_key(*path))
            .cloned()
            .collect();
        removed.extend(
            new.keys()
                .filter(|path| self.get(path).is_some_and(FsNode::is_dir))
                .cloned(),
        );

        // Drop paths already covered by a removed ancestor.
        let removed = removed
            .iter()
            .filter(|path| !ancestors(path).any(|dir| removed.contains(dir)))
            .cloned()
            .collect();

        TreeDiff { changed, removed }
    }
}
