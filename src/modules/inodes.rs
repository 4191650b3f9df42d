//! Node id to path mapping for the kernel interface.
//!
//! The kernel addresses objects by node id while every backend is path
//! based, so the dispatcher remembers which path each id it handed out
//! stands for, and for how many kernel lookups.

use super::constants::{INITIAL_INODE, ROOT_INODE};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
struct Node {
    path: PathBuf,
    lookups: u64,
}

/// Maps FUSE node ids to paths below the mount root.
#[derive(Debug)]
pub struct InodeTable {
    nodes: HashMap<u64, Node>,
    by_path: HashMap<PathBuf, u64>,
    next_inode: u64,
}

impl InodeTable {
    /// Creates a table holding only the root.
    pub fn new() -> Self {
        let root = PathBuf::from("/");
        let mut nodes = HashMap::new();
        nodes.insert(
            ROOT_INODE,
            Node {
                path: root.clone(),
                lookups: 1,
            },
        );
        let mut by_path = HashMap::new();
        by_path.insert(root, ROOT_INODE);

        Self {
            nodes,
            by_path,
            next_inode: INITIAL_INODE,
        }
    }

    /// Path of a node id.
    pub fn path(&self, ino: u64) -> Option<&Path> {
        self.nodes.get(&ino).map(|node| node.path.as_path())
    }

    /// Node id for `path`, counting one kernel lookup.
    pub fn remember(&mut self, path: &Path) -> u64 {
        let ino = self.assign(path);
        if let Some(node) = self.nodes.get_mut(&ino) {
            node.lookups += 1;
        }
        ino
    }

    /// Node id for `path` without counting a lookup.
    ///
    /// Directory listings report these so that `readdir` and `lookup`
    /// agree on the id of an entry.
    pub fn assign(&mut self, path: &Path) -> u64 {
        if let Some(&ino) = self.by_path.get(path) {
            return ino;
        }

        let ino = self.next_inode;
        self.next_inode += 1;
        self.nodes.insert(
            ino,
            Node {
                path: path.to_path_buf(),
                lookups: 0,
            },
        );
        self.by_path.insert(path.to_path_buf(), ino);
        ino
    }

    /// Drops `nlookup` kernel references; the node goes away at zero.
    pub fn forget(&mut self, ino: u64, nlookup: u64) {
        if ino == ROOT_INODE {
            return;
        }
        let gone = match self.nodes.get_mut(&ino) {
            Some(node) => {
                node.lookups = node.lookups.saturating_sub(nlookup);
                node.lookups == 0
            }
            None => false,
        };
        if gone {
            if let Some(node) = self.nodes.remove(&ino) {
                if self.by_path.get(&node.path) == Some(&ino) {
                    self.by_path.remove(&node.path);
                }
            }
        }
    }

    /// Forgets the path mapping of a removed object.
    ///
    /// The node id stays valid for open handles until the kernel forgets it;
    /// a node that was only listed goes away at once.
    pub fn unlink(&mut self, path: &Path) {
        if let Some(ino) = self.by_path.remove(path) {
            if self.nodes.get(&ino).map_or(false, |node| node.lookups == 0) {
                self.nodes.remove(&ino);
            }
        }
    }

    /// Moves `from` and everything below it to `to`.
    pub fn rename(&mut self, from: &Path, to: &Path) {
        self.by_path.remove(to);

        let moved: Vec<(PathBuf, u64)> = self
            .by_path
            .iter()
            .filter(|(path, _)| path.starts_with(from))
            .map(|(path, ino)| (path.clone(), *ino))
            .collect();

        for (old, ino) in moved {
            self.by_path.remove(&old);
            let new = match old.strip_prefix(from) {
                Ok(rest) if rest.as_os_str().is_empty() => to.to_path_buf(),
                Ok(rest) => to.join(rest),
                Err(_) => continue,
            };
            if let Some(node) = self.nodes.get_mut(&ino) {
                node.path = new.clone();
            }
            self.by_path.insert(new, ino);
        }
    }

    /// Number of known nodes, root included.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether only the root is known.
    pub fn is_empty(&self) -> bool {
        self.nodes.len() <= 1
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}
