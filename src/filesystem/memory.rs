//! In-memory filesystem
//!
//! Keeps the whole tree in a path-keyed map. Useful as a scratch mount
//! and as the reference implementation the dispatcher tests run against.

use std::collections::{BTreeMap, HashMap};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::trace;

use crate::error::{FsError, Result};
use crate::filesystem::{
    DirFiller, FileInfo, FileStat, FuseFileSystem, Statvfs, DEFAULT_DIR_MODE,
};

/// Size reported as the total capacity in statfs (1 GiB), also the largest
/// file size
const CAPACITY: u64 = 1 << 30;
const BLOCK_SIZE: u32 = 4096;

/// `RENAME_NOREPLACE` from `renameat2(2)`
const RENAME_NOREPLACE: u32 = 1;

#[derive(Debug, Clone)]
enum Content {
    File(Vec<u8>),
    Directory,
    Symlink(PathBuf),
}

#[derive(Debug, Clone)]
struct Node {
    content: Content,
    mode: u32,
    uid: u32,
    gid: u32,
    atime: SystemTime,
    mtime: SystemTime,
    ctime: SystemTime,
    xattrs: HashMap<String, Vec<u8>>,
}

impl Node {
    fn new(content: Content, mode: u32) -> Self {
        let now = SystemTime::now();
        Self {
            content,
            mode: mode & 0o7777,
            uid: 0,
            gid: 0,
            atime: now,
            mtime: now,
            ctime: now,
            xattrs: HashMap::new(),
        }
    }

    fn stat(&self) -> FileStat {
        let mut stat = match &self.content {
            Content::File(data) => FileStat::file(data.len() as u64, self.mode, self.mtime),
            Content::Directory => FileStat::directory(self.mode, self.mtime),
            Content::Symlink(target) => {
                FileStat::symlink(target.as_os_str().len() as u64, self.mtime)
            }
        };
        stat.uid = self.uid;
        stat.gid = self.gid;
        stat.atime = self.atime;
        stat.ctime = self.ctime;
        stat
    }

    fn touch(&mut self) {
        let now = SystemTime::now();
        self.mtime = now;
        self.ctime = now;
    }
}

/// Filesystem that lives entirely in process memory
pub struct MemoryFs {
    name: String,
    nodes: RwLock<BTreeMap<PathBuf, Node>>,
    next_handle: AtomicU64,
}

impl MemoryFs {
    pub fn new(name: impl Into<String>) -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            PathBuf::from("/"),
            Node::new(Content::Directory, DEFAULT_DIR_MODE),
        );
        Self {
            name: name.into(),
            nodes: RwLock::new(nodes),
            next_handle: AtomicU64::new(1),
        }
    }

    fn display(path: &Path) -> String {
        path.display().to_string()
    }

    /// Verify that the parent of `path` exists and is a directory
    fn check_parent(nodes: &BTreeMap<PathBuf, Node>, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .ok_or_else(|| FsError::InvalidPath(Self::display(path)))?;
        match nodes.get(parent).map(|n| &n.content) {
            Some(Content::Directory) => Ok(()),
            Some(_) => Err(FsError::NotADirectory(Self::display(parent))),
            None => Err(FsError::NotFound(Self::display(parent))),
        }
    }

    fn insert_new(&self, path: &Path, node: Node) -> Result<()> {
        let mut nodes = self.nodes.write();
        Self::check_parent(&nodes, path)?;
        if nodes.contains_key(path) {
            return Err(FsError::AlreadyExists(Self::display(path)));
        }
        nodes.insert(path.to_path_buf(), node);
        Ok(())
    }

    fn with_node<T>(&self, path: &Path, f: impl FnOnce(&mut Node) -> Result<T>) -> Result<T> {
        let mut nodes = self.nodes.write();
        let node = nodes
            .get_mut(path)
            .ok_or_else(|| FsError::NotFound(Self::display(path)))?;
        f(node)
    }

    fn has_children(nodes: &BTreeMap<PathBuf, Node>, path: &Path) -> bool {
        nodes
            .range(path.to_path_buf()..)
            .skip(1)
            .take_while(|(p, _)| p.starts_with(path))
            .next()
            .is_some()
    }
}

impl Default for MemoryFs {
    fn default() -> Self {
        Self::new("memfs")
    }
}

#[async_trait]
impl FuseFileSystem for MemoryFs {
    fn name(&self) -> &str {
        &self.name
    }

    async fn getattr(&self, path: &Path, stat: &mut FileStat) -> Result<()> {
        let nodes = self.nodes.read();
        let node = nodes
            .get(path)
            .ok_or_else(|| FsError::NotFound(Self::display(path)))?;
        *stat = node.stat();
        Ok(())
    }

    async fn readdir(
        &self,
        path: &Path,
        filler: &mut DirFiller,
        offset: i64,
        _fi: &FileInfo,
    ) -> Result<()> {
        let nodes = self.nodes.read();
        let dir = nodes
            .get(path)
            .ok_or_else(|| FsError::NotFound(Self::display(path)))?;
        if !matches!(dir.content, Content::Directory) {
            return Err(FsError::NotADirectory(Self::display(path)));
        }

        let children = nodes
            .range(path.to_path_buf()..)
            .skip(1)
            .take_while(|(p, _)| p.starts_with(path))
            .filter(|(p, _)| p.parent() == Some(path));

        let listing = [
            (OsString::from("."), dir.stat()),
            (OsString::from(".."), dir.stat()),
        ]
            .into_iter()
            .chain(children.filter_map(|(p, node)| {
                p.file_name().map(|name| (name.to_os_string(), node.stat()))
            }));

        for (idx, (name, stat)) in listing.enumerate().skip(offset.max(0) as usize) {
            if filler.add(name, Some(stat), idx as i64 + 1) {
                break;
            }
        }
        Ok(())
    }

    async fn open(&self, path: &Path, fi: &mut FileInfo) -> Result<()> {
        let nodes = self.nodes.read();
        match nodes.get(path).map(|n| &n.content) {
            Some(Content::Directory) => Err(FsError::IsADirectory(Self::display(path))),
            Some(_) => {
                fi.fh = self.next_handle.fetch_add(1, Ordering::Relaxed);
                trace!("open: {:?} fh={}", path, fi.fh);
                Ok(())
            }
            None => Err(FsError::NotFound(Self::display(path))),
        }
    }

    async fn read(
        &self,
        path: &Path,
        buf: &mut [u8],
        offset: u64,
        _fi: &FileInfo,
    ) -> Result<usize> {
        let nodes = self.nodes.read();
        match nodes.get(path).map(|n| &n.content) {
            Some(Content::File(data)) => {
                let start = (offset as usize).min(data.len());
                let end = start.saturating_add(buf.len()).min(data.len());
                let n = end - start;
                buf[..n].copy_from_slice(&data[start..end]);
                Ok(n)
            }
            Some(Content::Directory) => Err(FsError::IsADirectory(Self::display(path))),
            Some(Content::Symlink(_)) => Err(FsError::InvalidArgument(Self::display(path))),
            None => Err(FsError::NotFound(Self::display(path))),
        }
    }

    async fn write(&self, path: &Path, buf: &[u8], offset: u64, _fi: &FileInfo) -> Result<usize> {
        self.with_node(path, |node| match &mut node.content {
            Content::File(data) => {
                let end = file_len(offset.checked_add(buf.len() as u64))?;
                let start = end - buf.len();
                if data.len() < end {
                    data.resize(end, 0);
                }
                data[start..end].copy_from_slice(buf);
                node.touch();
                Ok(buf.len())
            }
            Content::Directory => Err(FsError::IsADirectory(Self::display(path))),
            Content::Symlink(_) => Err(FsError::InvalidArgument(Self::display(path))),
        })
    }

    async fn create(&self, path: &Path, mode: u32, fi: &mut FileInfo) -> Result<()> {
        self.insert_new(path, Node::new(Content::File(Vec::new()), mode))?;
        fi.fh = self.next_handle.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn mkdir(&self, path: &Path, mode: u32) -> Result<()> {
        self.insert_new(path, Node::new(Content::Directory, mode))
    }

    async fn unlink(&self, path: &Path) -> Result<()> {
        let mut nodes = self.nodes.write();
        match nodes.get(path).map(|n| &n.content) {
            Some(Content::Directory) => Err(FsError::IsADirectory(Self::display(path))),
            Some(_) => {
                nodes.remove(path);
                Ok(())
            }
            None => Err(FsError::NotFound(Self::display(path))),
        }
    }

    async fn rmdir(&self, path: &Path) -> Result<()> {
        let mut nodes = self.nodes.write();
        match nodes.get(path).map(|n| &n.content) {
            Some(Content::Directory) if path == Path::new("/") => {
                Err(FsError::PermissionDenied)
            }
            Some(Content::Directory) => {
                if Self::has_children(&nodes, path) {
                    return Err(FsError::NotEmpty(Self::display(path)));
                }
                nodes.remove(path);
                Ok(())
            }
            Some(_) => Err(FsError::NotADirectory(Self::display(path))),
            None => Err(FsError::NotFound(Self::display(path))),
        }
    }

    async fn rename(&self, from: &Path, to: &Path, flags: u32) -> Result<()> {
        let mut nodes = self.nodes.write();
        if !nodes.contains_key(from) {
            return Err(FsError::NotFound(Self::display(from)));
        }
        Self::check_parent(&nodes, to)?;
        if to.starts_with(from) && to != from {
            return Err(FsError::InvalidArgument(Self::display(to)));
        }
        if let Some(existing) = nodes.get(to) {
            if flags & RENAME_NOREPLACE != 0 {
                return Err(FsError::AlreadyExists(Self::display(to)));
            }
            if matches!(existing.content, Content::Directory) && Self::has_children(&nodes, to) {
                return Err(FsError::NotEmpty(Self::display(to)));
            }
        }

        // Move the node and everything below it
        let moved: Vec<PathBuf> = nodes
            .range(from.to_path_buf()..)
            .take_while(|(p, _)| p.starts_with(from))
            .map(|(p, _)| p.clone())
            .collect();
        nodes.remove(to);
        for old in moved {
            if let Some(node) = nodes.remove(&old) {
                let suffix = old.strip_prefix(from).unwrap_or(Path::new(""));
                let new = if suffix.as_os_str().is_empty() {
                    to.to_path_buf()
                } else {
                    to.join(suffix)
                };
                nodes.insert(new, node);
            }
        }
        Ok(())
    }

    async fn truncate(&self, path: &Path, size: u64) -> Result<()> {
        self.with_node(path, |node| match &mut node.content {
            Content::File(data) => {
                data.resize(file_len(Some(size))?, 0);
                node.touch();
                Ok(())
            }
            Content::Directory => Err(FsError::IsADirectory(Self::display(path))),
            Content::Symlink(_) => Err(FsError::InvalidArgument(Self::display(path))),
        })
    }

    async fn chmod(&self, path: &Path, mode: u32) -> Result<()> {
        self.with_node(path, |node| {
            node.mode = mode & 0o7777;
            node.ctime = SystemTime::now();
            Ok(())
        })
    }

    async fn chown(&self, path: &Path, uid: Option<u32>, gid: Option<u32>) -> Result<()> {
        self.with_node(path, |node| {
            if let Some(uid) = uid {
                node.uid = uid;
            }
            if let Some(gid) = gid {
                node.gid = gid;
            }
            node.ctime = SystemTime::now();
            Ok(())
        })
    }

    async fn symlink(&self, target: &Path, link: &Path) -> Result<()> {
        self.insert_new(link, Node::new(Content::Symlink(target.to_path_buf()), 0o777))
    }

    async fn utimens(
        &self,
        path: &Path,
        atime: Option<SystemTime>,
        mtime: Option<SystemTime>,
    ) -> Result<()> {
        self.with_node(path, |node| {
            if let Some(atime) = atime {
                node.atime = atime;
            }
            if let Some(mtime) = mtime {
                node.mtime = mtime;
            }
            Ok(())
        })
    }

    async fn statfs(&self, _path: &Path, stat: &mut Statvfs) -> Result<()> {
        let nodes = self.nodes.read();
        let used: u64 = nodes
            .values()
            .map(|n| match &n.content {
                Content::File(data) => data.len() as u64,
                _ => 0,
            })
            .sum();
        let blocks = CAPACITY / BLOCK_SIZE as u64;
        let free = blocks.saturating_sub(used.div_ceil(BLOCK_SIZE as u64));
        *stat = Statvfs {
            bsize: BLOCK_SIZE,
            frsize: BLOCK_SIZE,
            blocks,
            bfree: free,
            bavail: free,
            files: u32::MAX as u64,
            ffree: (u32::MAX as u64).saturating_sub(nodes.len() as u64),
            namemax: 255,
        };
        Ok(())
    }

    async fn setxattr(&self, path: &Path, name: &str, value: &[u8], _flags: i32) -> Result<()> {
        self.with_node(path, |node| {
            node.xattrs.insert(name.to_string(), value.to_vec());
            Ok(())
        })
    }

    async fn getxattr(&self, path: &Path, name: &str, value: &mut [u8]) -> Result<usize> {
        self.with_node(path, |node| {
            let stored = node
                .xattrs
                .get(name)
                .ok_or_else(|| FsError::NoAttribute(name.to_string()))?;
            copy_sized(stored, value)
        })
    }

    async fn listxattr(&self, path: &Path, list: &mut [u8]) -> Result<usize> {
        self.with_node(path, |node| {
            let mut names: Vec<&String> = node.xattrs.keys().collect();
            names.sort();
            let mut packed = Vec::new();
            for name in names {
                packed.extend_from_slice(name.as_bytes());
                packed.push(0);
            }
            copy_sized(&packed, list)
        })
    }

    async fn removexattr(&self, path: &Path, name: &str) -> Result<()> {
        self.with_node(path, |node| {
            node.xattrs
                .remove(name)
                .map(|_| ())
                .ok_or_else(|| FsError::NoAttribute(name.to_string()))
        })
    }
}

/// xattr size-query convention: an empty buffer asks for the size only
fn copy_sized(data: &[u8], out: &mut [u8]) -> Result<usize> {
    if out.is_empty() {
        return Ok(data.len());
    }
    if out.len() < data.len() {
        return Err(FsError::Range);
    }
    out[..data.len()].copy_from_slice(data);
    Ok(data.len())
}

/// Length a file may grow to, `EFBIG` past [`CAPACITY`]
fn file_len(size: Option<u64>) -> Result<usize> {
    size.filter(|&size| size <= CAPACITY)
        .and_then(|size| usize::try_from(size).ok())
        .ok_or(FsError::Errno(libc::EFBIG))
}
