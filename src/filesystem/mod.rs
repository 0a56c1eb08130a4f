pub mod memory;

use std::ffi::OsString;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;

use crate::error::{FsError, Result};

/// File type bits of `st_mode`
pub const S_IFMT: u32 = 0o170000;
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFREG: u32 = 0o100000;
pub const S_IFLNK: u32 = 0o120000;

/// Default file mode (rw-r--r--)
pub const DEFAULT_FILE_MODE: u32 = 0o644;
/// Default directory mode (rwxr-xr-x)
pub const DEFAULT_DIR_MODE: u32 = 0o755;

/// File type enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    File,
    Directory,
    Symlink,
}

/// Per-open-file information shared between open/read/write/release
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileInfo {
    /// Open flags (`O_RDONLY`, `O_WRONLY`, ...)
    pub flags: i32,
    /// Handle chosen by the filesystem in open/create
    pub fh: u64,
    pub direct_io: bool,
    pub keep_cache: bool,
    pub nonseekable: bool,
    /// Set on release when the kernel also wants a flush
    pub flush: bool,
    pub lock_owner: Option<u64>,
}

impl FileInfo {
    pub fn with_flags(flags: i32) -> Self {
        Self {
            flags,
            ..Default::default()
        }
    }

    pub fn with_handle(fh: u64) -> Self {
        Self {
            fh,
            ..Default::default()
        }
    }
}

/// Attributes of a file, filled in by getattr
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    /// Type and permission bits
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u32,
    pub size: u64,
    pub blocks: u64,
    pub blksize: u32,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
}

impl Default for FileStat {
    fn default() -> Self {
        Self {
            mode: 0,
            nlink: 0,
            uid: 0,
            gid: 0,
            rdev: 0,
            size: 0,
            blocks: 0,
            blksize: 4096,
            atime: UNIX_EPOCH,
            mtime: UNIX_EPOCH,
            ctime: UNIX_EPOCH,
        }
    }
}

impl FileStat {
    pub fn file(size: u64, perm: u32, mtime: SystemTime) -> Self {
        Self {
            mode: S_IFREG | (perm & 0o7777),
            nlink: 1,
            size,
            blocks: size.div_ceil(512),
            atime: mtime,
            mtime,
            ctime: mtime,
            ..Default::default()
        }
    }

    pub fn directory(perm: u32, mtime: SystemTime) -> Self {
        Self {
            mode: S_IFDIR | (perm & 0o7777),
            nlink: 2,
            atime: mtime,
            mtime,
            ctime: mtime,
            ..Default::default()
        }
    }

    pub fn symlink(target_len: u64, mtime: SystemTime) -> Self {
        Self {
            mode: S_IFLNK | 0o777,
            nlink: 1,
            size: target_len,
            atime: mtime,
            mtime,
            ctime: mtime,
            ..Default::default()
        }
    }

    /// File type encoded in `mode`, `None` for types FUSE callers here never produce
    pub fn kind(&self) -> Option<FileKind> {
        match self.mode & S_IFMT {
            S_IFREG => Some(FileKind::File),
            S_IFDIR => Some(FileKind::Directory),
            S_IFLNK => Some(FileKind::Symlink),
            _ => None,
        }
    }

    /// Permission bits only
    pub fn perm(&self) -> u16 {
        (self.mode & 0o7777) as u16
    }

    pub fn is_dir(&self) -> bool {
        self.kind() == Some(FileKind::Directory)
    }
}

/// Filesystem statistics, filled in by statfs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Statvfs {
    pub bsize: u32,
    pub frsize: u32,
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub namemax: u32,
}

impl Default for Statvfs {
    fn default() -> Self {
        Self {
            bsize: 4096,
            frsize: 4096,
            blocks: 0,
            bfree: 0,
            bavail: 0,
            files: 0,
            ffree: 0,
            namemax: 255,
        }
    }
}

/// Caller identity of the request currently being served
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FuseContext {
    pub uid: u32,
    pub gid: u32,
    pub pid: u32,
    pub umask: u32,
}

/// One entry produced by readdir
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: OsString,
    pub stat: Option<FileStat>,
    /// Offset of the entry that follows this one
    pub next_offset: i64,
}

/// Collects directory entries for one readdir request
///
/// `add` reports `true` once the reply buffer is full; the filesystem
/// should stop adding and return.
#[derive(Debug, Default)]
pub struct DirFiller {
    entries: Vec<DirEntry>,
    limit: Option<usize>,
}

impl DirFiller {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            entries: Vec::new(),
            limit: Some(limit),
        }
    }

    pub fn add(&mut self, name: impl Into<OsString>, stat: Option<FileStat>, next_offset: i64) -> bool {
        if self.is_full() {
            return true;
        }
        self.entries.push(DirEntry {
            name: name.into(),
            stat,
            next_offset,
        });
        self.is_full()
    }

    pub fn is_full(&self) -> bool {
        self.limit.is_some_and(|limit| self.entries.len() >= limit)
    }

    pub fn entries(&self) -> &[DirEntry] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<DirEntry> {
        self.entries
    }
}

/// Path-based filesystem served through FUSE
///
/// Every method receives the absolute path (relative to the mount root)
/// and the typed view for its request. Implementations report failures
/// through [`FsError`]; the dispatcher turns them into `-errno` codes.
/// Methods may be called concurrently from several threads.
#[async_trait]
pub trait FuseFileSystem: Send + Sync {
    /// Program name placed first in the native argument vector
    fn name(&self) -> &str {
        "fuse"
    }

    async fn getattr(&self, path: &Path, stat: &mut FileStat) -> Result<()>;

    async fn readdir(
        &self,
        path: &Path,
        filler: &mut DirFiller,
        offset: i64,
        fi: &FileInfo,
    ) -> Result<()>;

    async fn open(&self, path: &Path, fi: &mut FileInfo) -> Result<()>;

    /// Read up to `buf.len()` bytes at `offset`
    ///
    /// # Returns
    /// Number of bytes placed in `buf`
    async fn read(&self, path: &Path, buf: &mut [u8], offset: u64, fi: &FileInfo)
        -> Result<usize>;

    /// Write `buf` at `offset`
    ///
    /// # Returns
    /// Number of bytes written
    async fn write(&self, path: &Path, _buf: &[u8], _offset: u64, _fi: &FileInfo) -> Result<usize> {
        Err(not_supported("write", path))
    }

    async fn create(&self, path: &Path, _mode: u32, _fi: &mut FileInfo) -> Result<()> {
        Err(not_supported("create", path))
    }

    async fn mkdir(&self, path: &Path, _mode: u32) -> Result<()> {
        Err(not_supported("mkdir", path))
    }

    async fn unlink(&self, path: &Path) -> Result<()> {
        Err(not_supported("unlink", path))
    }

    async fn rmdir(&self, path: &Path) -> Result<()> {
        Err(not_supported("rmdir", path))
    }

    /// Rename/move a file or directory; `flags` carries `RENAME_*` bits
    async fn rename(&self, from: &Path, _to: &Path, _flags: u32) -> Result<()> {
        Err(not_supported("rename", from))
    }

    async fn truncate(&self, path: &Path, _size: u64) -> Result<()> {
        Err(not_supported("truncate", path))
    }

    async fn chmod(&self, path: &Path, _mode: u32) -> Result<()> {
        Err(not_supported("chmod", path))
    }

    /// `None` leaves the corresponding id unchanged
    async fn chown(&self, path: &Path, _uid: Option<u32>, _gid: Option<u32>) -> Result<()> {
        Err(not_supported("chown", path))
    }

    /// Create a symlink at `link` pointing to `target`
    async fn symlink(&self, _target: &Path, link: &Path) -> Result<()> {
        Err(not_supported("symlink", link))
    }

    /// `None` leaves the corresponding timestamp unchanged
    async fn utimens(
        &self,
        path: &Path,
        _atime: Option<SystemTime>,
        _mtime: Option<SystemTime>,
    ) -> Result<()> {
        Err(not_supported("utimens", path))
    }

    async fn flush(&self, _path: &Path, _fi: &FileInfo) -> Result<()> {
        Ok(())
    }

    async fn release(&self, _path: &Path, _fi: &FileInfo) -> Result<()> {
        Ok(())
    }

    async fn statfs(&self, _path: &Path, _stat: &mut Statvfs) -> Result<()> {
        Ok(())
    }

    async fn setxattr(&self, _path: &Path, _name: &str, _value: &[u8], _flags: i32) -> Result<()> {
        Ok(())
    }

    /// # Returns
    /// Attribute size; with an empty `value` only the size is requested
    async fn getxattr(&self, _path: &Path, _name: &str, _value: &mut [u8]) -> Result<usize> {
        Ok(0)
    }

    /// # Returns
    /// Size of the NUL-separated name list; with an empty `list` only the size is requested
    async fn listxattr(&self, _path: &Path, _list: &mut [u8]) -> Result<usize> {
        Ok(0)
    }

    async fn removexattr(&self, _path: &Path, _name: &str) -> Result<()> {
        Ok(())
    }
}

fn not_supported(op: &str, path: &Path) -> FsError {
    FsError::NotSupported(format!("{} on {:?}", op, path))
}
