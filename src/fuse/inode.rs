//! Inode management for path <-> inode mapping
//!
//! fuser hands out inode numbers while the dispatcher works with paths.
//! This table keeps the two in sync across lookups, renames and removals.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

/// Root directory inode (always 1 in FUSE)
pub const ROOT_INODE: u64 = 1;

/// Bidirectional inode <-> path map
pub struct InodeTable {
    inode_to_path: DashMap<u64, PathBuf>,
    path_to_inode: DashMap<PathBuf, u64>,
    next_inode: AtomicU64,
}

impl InodeTable {
    /// Create a table with the root directory pre-registered
    pub fn new() -> Self {
        let table = Self {
            inode_to_path: DashMap::new(),
            path_to_inode: DashMap::new(),
            next_inode: AtomicU64::new(ROOT_INODE + 1),
        };

        let root_path = PathBuf::from("/");
        table.inode_to_path.insert(ROOT_INODE, root_path.clone());
        table.path_to_inode.insert(root_path, ROOT_INODE);

        table
    }

    /// Get inode for a path, allocating one on first sight
    pub fn get_or_create_inode(&self, path: &Path) -> u64 {
        let normalized = normalize_path(path);

        if let Some(inode) = self.path_to_inode.get(&normalized) {
            return *inode;
        }

        // Another thread may win the insert; its inode is the one returned
        let entry = self.path_to_inode.entry(normalized.clone()).or_insert_with(|| {
            let inode = self.next_inode.fetch_add(1, Ordering::SeqCst);
            self.inode_to_path.insert(inode, normalized.clone());
            inode
        });
        *entry
    }

    pub fn get_path(&self, inode: u64) -> Option<PathBuf> {
        self.inode_to_path.get(&inode).map(|p| p.clone())
    }

    /// Get inode for a path without allocating
    pub fn get_inode(&self, path: &Path) -> Option<u64> {
        let normalized = normalize_path(path);
        self.path_to_inode.get(&normalized).map(|i| *i)
    }

    /// Inode of the directory containing `path`; the root is its own parent
    pub fn parent_inode(&self, path: &Path) -> u64 {
        path.parent()
            .and_then(|p| self.get_inode(p))
            .unwrap_or(ROOT_INODE)
    }

    /// Forget a path and everything below it
    pub fn remove_path(&self, path: &Path) {
        let normalized = normalize_path(path);
        let doomed: Vec<PathBuf> = self
            .path_to_inode
            .iter()
            .filter(|e| e.key().starts_with(&normalized))
            .map(|e| e.key().clone())
            .collect();
        for path in doomed {
            if let Some((_, inode)) = self.path_to_inode.remove(&path) {
                self.inode_to_path.remove(&inode);
            }
        }
    }

    /// Move a path and its descendants, keeping their inode numbers
    pub fn rename_path(&self, old: &Path, new: &Path) {
        let old_normalized = normalize_path(old);
        let new_normalized = normalize_path(new);
        if old_normalized == new_normalized {
            return;
        }

        // The destination is replaced by the rename
        self.remove_path(&new_normalized);

        let moved: Vec<PathBuf> = self
            .path_to_inode
            .iter()
            .filter(|e| e.key().starts_with(&old_normalized))
            .map(|e| e.key().clone())
            .collect();
        for path in moved {
            if let Some((_, inode)) = self.path_to_inode.remove(&path) {
                let renamed = match path.strip_prefix(&old_normalized) {
                    Ok(rest) if !rest.as_os_str().is_empty() => new_normalized.join(rest),
                    _ => new_normalized.clone(),
                };
                self.inode_to_path.insert(inode, renamed.clone());
                self.path_to_inode.insert(renamed, inode);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inode_to_path.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inode_to_path.is_empty()
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

fn normalize_path(path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        PathBuf::from("/").join(path)
    }
}
