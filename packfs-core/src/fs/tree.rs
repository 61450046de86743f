//! Immutable in-memory tree of rendered files.
//!
//! Paths are `/`-separated and case-sensitive. They are stored without a
//! leading slash; the root is the empty path. Queries accept either form.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::error::{PackFsError, PackFsResult};
use crate::orchestrator::AggregateResult;

/// Inode number of the root directory.
pub const ROOT_INO: u64 = 1;

/// Kind of a tree node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Directory,
    File,
}

/// Attributes of one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeStat {
    pub ino: u64,
    pub kind: NodeKind,
    /// Byte length of a file's content; 0 for directories.
    pub size: u64,
}

#[derive(Debug, Clone)]
enum Node {
    Directory { children: BTreeSet<String> },
    File { content: String },
}

#[derive(Debug, Clone)]
struct TreeEntry {
    ino: u64,
    node: Node,
}

/// Read-only tree built once from an [`AggregateResult`].
#[derive(Debug, Clone)]
pub struct RenderTree {
    entries: BTreeMap<String, TreeEntry>,
    /// Index `ino - 1` to path.
    paths: Vec<String>,
}

impl RenderTree {
    /// Build the tree.
    ///
    /// Each `pack:job` key becomes a top-level directory holding that job's
    /// files, with a directory for every proper prefix of a nested file
    /// name. Failed jobs become empty directories.
    ///
    /// Fails with [`PackFsError::TreeConflict`] when one path would be both
    /// a file and a directory, and with [`PackFsError::InvalidPath`] for
    /// names that cannot be addressed (empty, `.` or `..` segments).
    pub fn build(aggregate: &AggregateResult) -> PackFsResult<Self> {
        let mut builder = TreeBuilder::new();

        for (key, outcome) in aggregate {
            check_segment(key, key)?;
            builder.add_dir(key)?;

            let Some(files) = outcome.files() else {
                debug!(job = %key, "job failed, exposing empty directory");
                continue;
            };
            for (name, content) in files {
                builder.add_file(&format!("{}/{}", key, name), content)?;
            }
        }

        Ok(builder.finish())
    }

    /// Immediate children of a directory, preceded by `.` and `..`.
    pub fn list_children(&self, path: &str) -> PackFsResult<Vec<String>> {
        let path = normalize(path);
        match &self.entry(path)?.node {
            Node::Directory { children } => {
                let mut names = Vec::with_capacity(children.len() + 2);
                names.push(".".to_string());
                names.push("..".to_string());
                names.extend(children.iter().cloned());
                Ok(names)
            }
            Node::File { .. } => Err(PackFsError::NotADirectory(display(path))),
        }
    }

    /// Kind and size of the node at `path`.
    pub fn stat(&self, path: &str) -> PackFsResult<NodeStat> {
        let entry = self.entry(normalize(path))?;
        Ok(stat_of(entry))
    }

    /// Up to `length` bytes of a file starting at `offset`.
    ///
    /// Reading at or past the end returns an empty slice.
    pub fn read_range(&self, path: &str, offset: u64, length: usize) -> PackFsResult<&[u8]> {
        let path = normalize(path);
        match &self.entry(path)?.node {
            Node::File { content } => {
                let bytes = content.as_bytes();
                let start = usize::try_from(offset).unwrap_or(usize::MAX).min(bytes.len());
                let end = start.saturating_add(length).min(bytes.len());
                Ok(&bytes[start..end])
            }
            Node::Directory { .. } => Err(PackFsError::IsADirectory(display(path))),
        }
    }

    /// Path of an inode, without leading slash.
    pub fn path_of(&self, ino: u64) -> Option<&str> {
        let idx = usize::try_from(ino.checked_sub(1)?).ok()?;
        self.paths.get(idx).map(String::as_str)
    }

    /// Attributes of an inode.
    pub fn stat_ino(&self, ino: u64) -> PackFsResult<NodeStat> {
        let path = self
            .path_of(ino)
            .ok_or_else(|| PackFsError::NotFound(format!("inode {}", ino)))?;
        self.stat(path)
    }

    /// Inode of the parent directory; the root is its own parent.
    pub fn parent_ino(&self, ino: u64) -> Option<u64> {
        let path = self.path_of(ino)?;
        let parent = match path.rfind('/') {
            Some(pos) => &path[..pos],
            None if path.is_empty() => return Some(ROOT_INO),
            None => "",
        };
        self.entries.get(parent).map(|e| e.ino)
    }

    /// Join a directory path and a child name.
    pub fn child_path(parent: &str, name: &str) -> String {
        let parent = normalize(parent);
        if parent.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", parent, name)
        }
    }

    /// Number of nodes, root included.
    pub fn node_count(&self) -> usize {
        self.entries.len()
    }

    /// Number of file nodes.
    pub fn file_count(&self) -> usize {
        self.entries
            .values()
            .filter(|e| matches!(e.node, Node::File { .. }))
            .count()
    }

    /// Sum of all file sizes in bytes.
    pub fn total_bytes(&self) -> u64 {
        self.entries
            .values()
            .map(|e| match &e.node {
                Node::File { content } => content.len() as u64,
                Node::Directory { .. } => 0,
            })
            .sum()
    }

    fn entry(&self, path: &str) -> PackFsResult<&TreeEntry> {
        self.entries
            .get(path)
            .ok_or_else(|| PackFsError::NotFound(display(path)))
    }
}

fn stat_of(entry: &TreeEntry) -> NodeStat {
    match &entry.node {
        Node::Directory { .. } => NodeStat {
            ino: entry.ino,
            kind: NodeKind::Directory,
            size: 0,
        },
        Node::File { content } => NodeStat {
            ino: entry.ino,
            kind: NodeKind::File,
            size: content.len() as u64,
        },
    }
}

fn normalize(path: &str) -> &str {
    path.trim_start_matches('/').trim_end_matches('/')
}

fn display(path: &str) -> String {
    format!("/{}", path)
}

fn check_segment(segment: &str, path: &str) -> PackFsResult<()> {
    if segment.is_empty() || segment == "." || segment == ".." || segment.contains('/') {
        return Err(PackFsError::InvalidPath(display(path)));
    }
    Ok(())
}

/// Mutable staging area; only [`RenderTree::build`] uses it.
struct TreeBuilder {
    nodes: BTreeMap<String, Node>,
}

impl TreeBuilder {
    fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            String::new(),
            Node::Directory {
                children: BTreeSet::new(),
            },
        );
        Self { nodes }
    }

    /// Register a directory whose parent already exists. Idempotent.
    fn add_dir(&mut self, path: &str) -> PackFsResult<()> {
        match self.nodes.get(path) {
            Some(Node::Directory { .. }) => return Ok(()),
            Some(Node::File { .. }) => {
                return Err(PackFsError::TreeConflict {
                    path: display(path),
                })
            }
            None => {}
        }

        self.link_to_parent(path)?;
        self.nodes.insert(
            path.to_string(),
            Node::Directory {
                children: BTreeSet::new(),
            },
        );
        Ok(())
    }

    /// Register a file, creating its missing ancestors.
    fn add_file(&mut self, path: &str, content: &str) -> PackFsResult<()> {
        for segment in path.split('/') {
            check_segment(segment, path)?;
        }

        for (pos, _) in path.match_indices('/') {
            self.add_dir(&path[..pos])?;
        }

        match self.nodes.get(path) {
            Some(Node::Directory { .. }) => {
                return Err(PackFsError::TreeConflict {
                    path: display(path),
                })
            }
            Some(Node::File { .. }) => {}
            None => self.link_to_parent(path)?,
        }

        self.nodes.insert(
            path.to_string(),
            Node::File {
                content: content.to_string(),
            },
        );
        Ok(())
    }

    fn link_to_parent(&mut self, path: &str) -> PackFsResult<()> {
        let (parent, name) = match path.rfind('/') {
            Some(pos) => (&path[..pos], &path[pos + 1..]),
            None => ("", path),
        };
        match self.nodes.get_mut(parent) {
            Some(Node::Directory { children }) => {
                children.insert(name.to_string());
                Ok(())
            }
            Some(Node::File { .. }) => Err(PackFsError::TreeConflict {
                path: display(parent),
            }),
            None => Err(PackFsError::NotFound(display(parent))),
        }
    }

    /// Number inodes in path order; the root sorts first and gets 1.
    fn finish(self) -> RenderTree {
        let mut entries = BTreeMap::new();
        let mut paths = Vec::with_capacity(self.nodes.len());

        for (idx, (path, node)) in self.nodes.into_iter().enumerate() {
            paths.push(path.clone());
            entries.insert(
                path,
                TreeEntry {
                    ino: idx as u64 + ROOT_INO,
                    node,
                },
            );
        }

        RenderTree { entries, paths }
    }
}
