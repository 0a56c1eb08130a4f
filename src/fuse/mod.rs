pub mod bridge;
pub mod context;
pub mod inode;
pub mod native;

use std::future::Future;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;

use tracing::{debug, error, trace};

use crate::errno::{return_code, Outcome, ReturnValue};
use crate::error::Result;
use crate::filesystem::{DirFiller, FileInfo, FileStat, FuseContext, FuseFileSystem, Statvfs};

/// Worker threads for the dispatcher's runtime when none are configured
pub const DEFAULT_WORKER_THREADS: usize = 4;

/// Routes native FUSE callbacks to a [`FuseFileSystem`]
///
/// Each entry point returns the protocol's signed code: `0` or a positive
/// count on success, `-errno` on failure. Failures and panics raised by the
/// filesystem are logged and contained here so the native loop keeps
/// serving. Entry points may be called concurrently.
pub struct CallbackDispatcher {
    fs: Arc<dyn FuseFileSystem>,
    /// Dedicated runtime driving the filesystem's async operations
    runtime: tokio::runtime::Runtime,
}

impl CallbackDispatcher {
    /// Create a dispatcher with a default-sized runtime
    pub fn new(fs: Arc<dyn FuseFileSystem>) -> io::Result<Self> {
        Self::with_worker_threads(fs, DEFAULT_WORKER_THREADS)
    }

    pub fn with_worker_threads(fs: Arc<dyn FuseFileSystem>, worker_threads: usize) -> io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(worker_threads.max(1))
            .thread_name("fuse-worker")
            .enable_all()
            .build()?;
        Ok(Self { fs, runtime })
    }

    pub fn filesystem(&self) -> &Arc<dyn FuseFileSystem> {
        &self.fs
    }

    /// Caller context of the request being served on this thread
    pub fn context(&self) -> FuseContext {
        context::current()
    }

    /// Run one filesystem operation behind the fault-isolation boundary
    ///
    /// `describe` renders the path and arguments for log lines; it is only
    /// evaluated when something is logged.
    fn guarded<T, F, D>(&self, op: &'static str, describe: D, operation: F) -> i32
    where
        T: ReturnValue,
        F: Future<Output = Result<T>>,
        D: Fn() -> String,
    {
        trace!("{}: {}", op, describe());

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.runtime.block_on(operation)));
        match outcome {
            Ok(Ok(value)) => return_code(Outcome::Success(value)),
            Ok(Err(e)) => {
                if e.is_expected() {
                    debug!("{} {}: {}", op, describe(), e);
                } else {
                    error!("Failed to {} {}: {}", op, describe(), e);
                }
                return_code::<T>(Outcome::Failure(&e))
            }
            Err(payload) => {
                error!(
                    "Failed to {} {}: panicked: {}",
                    op,
                    describe(),
                    panic_message(payload.as_ref())
                );
                return_code::<T>(Outcome::Panicked)
            }
        }
    }

    pub fn getattr(&self, path: &Path, stat: &mut FileStat) -> i32 {
        self.guarded(
            "getattr",
            || format!("{:?}", path),
            self.fs.getattr(path, stat),
        )
    }

    pub fn readdir(&self, path: &Path, filler: &mut DirFiller, offset: i64, fi: &FileInfo) -> i32 {
        self.guarded(
            "readdir",
            || format!("{:?}, offset {}", path, offset),
            self.fs.readdir(path, filler, offset, fi),
        )
    }

    pub fn open(&self, path: &Path, fi: &mut FileInfo) -> i32 {
        let flags = fi.flags;
        self.guarded(
            "open",
            || format!("{:?}, flags {:#o}", path, flags),
            self.fs.open(path, fi),
        )
    }

    pub fn read(&self, path: &Path, buf: &mut [u8], offset: u64, fi: &FileInfo) -> i32 {
        let size = buf.len();
        self.guarded(
            "read",
            || format!("{:?}, size {}, offset {}", path, size, offset),
            self.fs.read(path, buf, offset, fi),
        )
    }

    pub fn write(&self, path: &Path, buf: &[u8], offset: u64, fi: &FileInfo) -> i32 {
        self.guarded(
            "write",
            || format!("{:?}, size {}, offset {}", path, buf.len(), offset),
            self.fs.write(path, buf, offset, fi),
        )
    }

    pub fn create(&self, path: &Path, mode: u32, fi: &mut FileInfo) -> i32 {
        self.guarded(
            "create",
            || format!("{:?}, mode {:o}", path, mode),
            self.fs.create(path, mode, fi),
        )
    }

    pub fn mkdir(&self, path: &Path, mode: u32) -> i32 {
        self.guarded(
            "mkdir",
            || format!("{:?}, mode {:o}", path, mode),
            self.fs.mkdir(path, mode),
        )
    }

    pub fn unlink(&self, path: &Path) -> i32 {
        self.guarded("unlink", || format!("{:?}", path), self.fs.unlink(path))
    }

    pub fn rmdir(&self, path: &Path) -> i32 {
        self.guarded("rmdir", || format!("{:?}", path), self.fs.rmdir(path))
    }

    /// Rename without flags; same as `rename_with_flags(from, to, 0)`
    pub fn rename(&self, from: &Path, to: &Path) -> i32 {
        self.rename_with_flags(from, to, 0)
    }

    pub fn rename_with_flags(&self, from: &Path, to: &Path, flags: u32) -> i32 {
        self.guarded(
            "rename",
            || format!("{:?}, new path {:?}, flags {:#x}", from, to, flags),
            self.fs.rename(from, to, flags),
        )
    }

    pub fn truncate(&self, path: &Path, size: u64) -> i32 {
        self.guarded(
            "truncate",
            || format!("{:?}, size {}", path, size),
            self.fs.truncate(path, size),
        )
    }

    pub fn chmod(&self, path: &Path, mode: u32) -> i32 {
        self.guarded(
            "chmod",
            || format!("{:?}, mode {:o}", path, mode),
            self.fs.chmod(path, mode),
        )
    }

    pub fn chown(&self, path: &Path, uid: Option<u32>, gid: Option<u32>) -> i32 {
        self.guarded(
            "chown",
            || format!("{:?}, uid {:?}, gid {:?}", path, uid, gid),
            self.fs.chown(path, uid, gid),
        )
    }

    pub fn symlink(&self, target: &Path, link: &Path) -> i32 {
        self.guarded(
            "symlink",
            || format!("link {:?}, target {:?}", link, target),
            self.fs.symlink(target, link),
        )
    }

    pub fn utimens(&self, path: &Path, atime: Option<SystemTime>, mtime: Option<SystemTime>) -> i32 {
        self.guarded(
            "utimens",
            || format!("{:?}, atime {:?}, mtime {:?}", path, atime, mtime),
            self.fs.utimens(path, atime, mtime),
        )
    }

    pub fn flush(&self, path: &Path, fi: &FileInfo) -> i32 {
        let fh = fi.fh;
        self.guarded(
            "flush",
            || format!("{:?}, fh {}", path, fh),
            self.fs.flush(path, fi),
        )
    }

    pub fn release(&self, path: &Path, fi: &FileInfo) -> i32 {
        let fh = fi.fh;
        self.guarded(
            "release",
            || format!("{:?}, fh {}", path, fh),
            self.fs.release(path, fi),
        )
    }

    pub fn statfs(&self, path: &Path, stat: &mut Statvfs) -> i32 {
        self.guarded("statfs", || format!("{:?}", path), self.fs.statfs(path, stat))
    }

    pub fn setxattr(&self, path: &Path, name: &str, value: &[u8], flags: i32) -> i32 {
        self.guarded(
            "setxattr",
            || format!("{:?}, name {}, size {}", path, name, value.len()),
            self.fs.setxattr(path, name, value, flags),
        )
    }

    pub fn getxattr(&self, path: &Path, name: &str, value: &mut [u8]) -> i32 {
        let size = value.len();
        self.guarded(
            "getxattr",
            || format!("{:?}, name {}, size {}", path, name, size),
            self.fs.getxattr(path, name, value),
        )
    }

    pub fn listxattr(&self, path: &Path, list: &mut [u8]) -> i32 {
        let size = list.len();
        self.guarded(
            "listxattr",
            || format!("{:?}, size {}", path, size),
            self.fs.listxattr(path, list),
        )
    }

    pub fn removexattr(&self, path: &Path, name: &str) -> i32 {
        self.guarded(
            "removexattr",
            || format!("{:?}, name {}", path, name),
            self.fs.removexattr(path, name),
        )
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}
