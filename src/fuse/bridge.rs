//! fuser `Filesystem` implementation on top of the callback dispatcher
//!
//! fuser speaks inodes; the dispatcher speaks paths. Every request is
//! resolved to a path through the inode table, run inside the caller's
//! request context, and its return code turned into the matching reply.

use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr, Request, TimeOrNow,
};
use tracing::{debug, trace};

use crate::errno::errno_of;
use crate::filesystem::{DirFiller, FileInfo, FileKind, FileStat, FuseContext, Statvfs};
use crate::fuse::context;
use crate::fuse::inode::{InodeTable, ROOT_INODE};
use crate::fuse::CallbackDispatcher;

/// Default TTL for attribute caching (1 second)
const ATTR_TTL: Duration = Duration::from_secs(1);

/// Generation number (not used, always 0)
const GENERATION: u64 = 0;

/// `fuse_file_info` bits returned from open/create
const FOPEN_DIRECT_IO: u32 = 1 << 0;
const FOPEN_KEEP_CACHE: u32 = 1 << 1;
const FOPEN_NONSEEKABLE: u32 = 1 << 2;

fn to_fuse_file_type(kind: Option<FileKind>) -> FileType {
    match kind {
        Some(FileKind::Directory) => FileType::Directory,
        Some(FileKind::Symlink) => FileType::Symlink,
        Some(FileKind::File) | None => FileType::RegularFile,
    }
}

fn stat_to_attr(ino: u64, stat: &FileStat) -> FileAttr {
    FileAttr {
        ino,
        size: stat.size,
        blocks: stat.blocks,
        atime: stat.atime,
        mtime: stat.mtime,
        ctime: stat.ctime,
        crtime: stat.ctime,
        kind: to_fuse_file_type(stat.kind()),
        perm: stat.perm(),
        nlink: stat.nlink.max(1),
        uid: stat.uid,
        gid: stat.gid,
        rdev: stat.rdev,
        blksize: stat.blksize,
        flags: 0,
    }
}

fn open_flags(fi: &FileInfo) -> u32 {
    let mut flags = 0;
    if fi.direct_io {
        flags |= FOPEN_DIRECT_IO;
    }
    if fi.keep_cache {
        flags |= FOPEN_KEEP_CACHE;
    }
    if fi.nonseekable {
        flags |= FOPEN_NONSEEKABLE;
    }
    flags
}

fn request_context(req: &Request<'_>) -> FuseContext {
    FuseContext {
        uid: req.uid(),
        gid: req.gid(),
        pid: req.pid(),
        umask: 0,
    }
}

fn to_system_time(time: TimeOrNow) -> SystemTime {
    match time {
        TimeOrNow::SpecificTime(t) => t,
        TimeOrNow::Now => SystemTime::now(),
    }
}

/// Attribute changes carried by one setattr request
#[derive(Debug, Default)]
struct AttrChanges {
    mode: Option<u32>,
    uid: Option<u32>,
    gid: Option<u32>,
    size: Option<u64>,
    atime: Option<SystemTime>,
    mtime: Option<SystemTime>,
}

/// One readdir reply entry
#[derive(Debug, PartialEq)]
struct ListedEntry {
    ino: u64,
    next_offset: i64,
    kind: FileType,
    name: OsString,
}

/// How a getxattr/listxattr return code is answered
#[derive(Debug, PartialEq)]
enum XattrReply {
    Error(i32),
    /// Size query (`size == 0`)
    Size(u32),
    /// The first `n` bytes of the buffer
    Data(usize),
}

/// A value that does not fit the caller's buffer is `ERANGE`, never cut short
fn xattr_reply(rc: i32, size: u32) -> XattrReply {
    match errno_of(rc) {
        Some(errno) => XattrReply::Error(errno),
        None if size == 0 => XattrReply::Size(rc as u32),
        None if rc as u32 > size => XattrReply::Error(libc::ERANGE),
        None => XattrReply::Data(rc as usize),
    }
}

/// Adapts fuser's inode-based callbacks to the path-based dispatcher
pub struct FuserBridge {
    dispatcher: Arc<CallbackDispatcher>,
    inodes: InodeTable,
    /// Log every request at debug level (`-d`)
    debug: bool,
}

impl FuserBridge {
    pub fn new(dispatcher: Arc<CallbackDispatcher>, debug: bool) -> Self {
        Self {
            dispatcher,
            inodes: InodeTable::new(),
            debug,
        }
    }

    /// Get path for inode, returning ENOENT if not found
    fn inode_to_path(&self, ino: u64) -> Result<PathBuf, i32> {
        self.inodes.get_path(ino).ok_or(libc::ENOENT)
    }

    fn child_path(&self, parent: u64, name: &OsStr) -> Result<PathBuf, i32> {
        self.inode_to_path(parent).map(|p| p.join(name))
    }

    fn log_request(&self, op: &str, path: &Path) {
        if self.debug {
            debug!("{}: {:?}", op, path);
        } else {
            trace!("{}: {:?}", op, path);
        }
    }

    /// Run a dispatcher call inside the request's caller context
    fn call<T>(&self, req: &Request<'_>, f: impl FnOnce(&CallbackDispatcher) -> T) -> T {
        self.call_as(request_context(req), f)
    }

    fn call_as<T>(&self, ctx: FuseContext, f: impl FnOnce(&CallbackDispatcher) -> T) -> T {
        context::scope(ctx, || f(&self.dispatcher))
    }

    /// chmod, chown, truncate, then utimens; stops at the first failure
    fn apply_changes(&self, ctx: FuseContext, path: &Path, changes: AttrChanges) -> i32 {
        if let Some(mode) = changes.mode {
            let rc = self.call_as(ctx, |d| d.chmod(path, mode & 0o7777));
            if rc != 0 {
                return rc;
            }
        }
        if changes.uid.is_some() || changes.gid.is_some() {
            let rc = self.call_as(ctx, |d| d.chown(path, changes.uid, changes.gid));
            if rc != 0 {
                return rc;
            }
        }
        if let Some(size) = changes.size {
            let rc = self.call_as(ctx, |d| d.truncate(path, size));
            if rc != 0 {
                return rc;
            }
        }
        if changes.atime.is_some() || changes.mtime.is_some() {
            return self.call_as(ctx, |d| d.utimens(path, changes.atime, changes.mtime));
        }
        0
    }

    /// List `path` (inode `ino`), mapping `.` and `..` to their inodes
    fn list_dir(
        &self,
        ctx: FuseContext,
        ino: u64,
        path: &Path,
        fh: u64,
        offset: i64,
    ) -> Result<Vec<ListedEntry>, i32> {
        let mut filler = DirFiller::new();
        let fi = FileInfo::with_handle(fh);
        let rc = self.call_as(ctx, |d| d.readdir(path, &mut filler, offset, &fi));
        if let Some(errno) = errno_of(rc) {
            return Err(errno);
        }

        Ok(filler
            .into_entries()
            .into_iter()
            .map(|entry| {
                let entry_ino = if entry.name == "." {
                    ino
                } else if entry.name == ".." {
                    if ino == ROOT_INODE {
                        ROOT_INODE
                    } else {
                        self.inodes.parent_inode(path)
                    }
                } else {
                    self.inodes.get_or_create_inode(&path.join(&entry.name))
                };
                ListedEntry {
                    ino: entry_ino,
                    next_offset: entry.next_offset,
                    kind: to_fuse_file_type(entry.stat.and_then(|s| s.kind())),
                    name: entry.name,
                }
            })
            .collect())
    }

    /// unlink or rmdir, forgetting the path's inodes on success
    fn remove(&self, ctx: FuseContext, path: &Path, dir: bool) -> i32 {
        let rc = self.call_as(ctx, |d| if dir { d.rmdir(path) } else { d.unlink(path) });
        if rc == 0 {
            self.inodes.remove_path(path);
        }
        rc
    }

    /// rename, moving the inode numbers along on success
    fn move_path(&self, ctx: FuseContext, from: &Path, to: &Path, flags: u32) -> i32 {
        let rc = self.call_as(ctx, |d| d.rename_with_flags(from, to, flags));
        if rc == 0 {
            self.inodes.rename_path(from, to);
        }
        rc
    }

    /// getattr for `path`, as a fuser attribute for `ino`
    fn attr_of(&self, req: &Request<'_>, ino: u64, path: &Path) -> Result<FileAttr, i32> {
        let mut stat = FileStat::default();
        let rc = self.call(req, |d| d.getattr(path, &mut stat));
        match errno_of(rc) {
            Some(errno) => Err(errno),
            None => Ok(stat_to_attr(ino, &stat)),
        }
    }

    /// getattr for a freshly created or looked-up child, registering its inode
    fn entry_of(&self, req: &Request<'_>, path: &Path) -> Result<FileAttr, i32> {
        let mut stat = FileStat::default();
        let rc = self.call(req, |d| d.getattr(path, &mut stat));
        if let Some(errno) = errno_of(rc) {
            return Err(errno);
        }
        let ino = self.inodes.get_or_create_inode(path);
        Ok(stat_to_attr(ino, &stat))
    }

    fn reply_entry(&self, req: &Request<'_>, path: &Path, rc: i32, reply: ReplyEntry) {
        if let Some(errno) = errno_of(rc) {
            reply.error(errno);
            return;
        }
        match self.entry_of(req, path) {
            Ok(attr) => reply.entry(&ATTR_TTL, &attr, GENERATION),
            Err(errno) => reply.error(errno),
        }
    }

    fn reply_empty(rc: i32, reply: ReplyEmpty) {
        match errno_of(rc) {
            Some(errno) => reply.error(errno),
            None => reply.ok(),
        }
    }

    fn reply_xattr(rc: i32, size: u32, buf: &[u8], reply: ReplyXattr) {
        match xattr_reply(rc, size) {
            XattrReply::Error(errno) => reply.error(errno),
            XattrReply::Size(size) => reply.size(size),
            XattrReply::Data(len) => reply.data(&buf[..len.min(buf.len())]),
        }
    }
}

macro_rules! resolve {
    ($result:expr, $reply:ident) => {
        match $result {
            Ok(path) => path,
            Err(errno) => {
                $reply.error(errno);
                return;
            }
        }
    };
}

impl Filesystem for FuserBridge {
    fn lookup(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let path = resolve!(self.child_path(parent, name), reply);
        self.log_request("lookup", &path);
        match self.entry_of(req, &path) {
            Ok(attr) => reply.entry(&ATTR_TTL, &attr, GENERATION),
            Err(errno) => reply.error(errno),
        }
    }

    fn getattr(&mut self, req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        let path = resolve!(self.inode_to_path(ino), reply);
        self.log_request("getattr", &path);
        match self.attr_of(req, ino, &path) {
            Ok(attr) => reply.attr(&ATTR_TTL, &attr),
            Err(errno) => reply.error(errno),
        }
    }

    fn setattr(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let path = resolve!(self.inode_to_path(ino), reply);
        self.log_request("setattr", &path);

        let changes = AttrChanges {
            mode,
            uid,
            gid,
            size,
            atime: atime.map(to_system_time),
            mtime: mtime.map(to_system_time),
        };
        let rc = self.apply_changes(request_context(req), &path, changes);
        if let Some(errno) = errno_of(rc) {
            reply.error(errno);
            return;
        }

        match self.attr_of(req, ino, &path) {
            Ok(attr) => reply.attr(&ATTR_TTL, &attr),
            Err(errno) => reply.error(errno),
        }
    }

    fn mkdir(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        let path = resolve!(self.child_path(parent, name), reply);
        // Apply umask to get effective mode (permission bits only)
        let effective_mode = (mode & !umask) & 0o7777;
        self.log_request("mkdir", &path);
        let rc = self.call(req, |d| d.mkdir(&path, effective_mode));
        self.reply_entry(req, &path, rc, reply);
    }

    fn unlink(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = resolve!(self.child_path(parent, name), reply);
        self.log_request("unlink", &path);
        let rc = self.remove(request_context(req), &path, false);
        Self::reply_empty(rc, reply);
    }

    fn rmdir(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = resolve!(self.child_path(parent, name), reply);
        self.log_request("rmdir", &path);
        let rc = self.remove(request_context(req), &path, true);
        Self::reply_empty(rc, reply);
    }

    fn symlink(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let path = resolve!(self.child_path(parent, link_name), reply);
        self.log_request("symlink", &path);
        let rc = self.call(req, |d| d.symlink(target, &path));
        self.reply_entry(req, &path, rc, reply);
    }

    fn rename(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        let old_path = resolve!(self.child_path(parent, name), reply);
        let new_path = resolve!(self.child_path(newparent, newname), reply);
        self.log_request("rename", &old_path);
        let rc = self.move_path(request_context(req), &old_path, &new_path, flags);
        Self::reply_empty(rc, reply);
    }

    fn open(&mut self, req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let path = resolve!(self.inode_to_path(ino), reply);
        self.log_request("open", &path);
        let mut fi = FileInfo::with_flags(flags);
        let rc = self.call(req, |d| d.open(&path, &mut fi));
        match errno_of(rc) {
            Some(errno) => reply.error(errno),
            None => reply.opened(fi.fh, open_flags(&fi)),
        }
    }

    fn read(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        flags: i32,
        lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let path = resolve!(self.inode_to_path(ino), reply);
        self.log_request("read", &path);
        let fi = FileInfo {
            fh,
            flags,
            lock_owner,
            ..Default::default()
        };
        let mut buf = vec![0u8; size as usize];
        let rc = self.call(req, |d| d.read(&path, &mut buf, offset.max(0) as u64, &fi));
        match errno_of(rc) {
            Some(errno) => reply.error(errno),
            None => reply.data(&buf[..(rc as usize).min(buf.len())]),
        }
    }

    fn write(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        flags: i32,
        lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let path = resolve!(self.inode_to_path(ino), reply);
        self.log_request("write", &path);
        let fi = FileInfo {
            fh,
            flags,
            lock_owner,
            ..Default::default()
        };
        let rc = self.call(req, |d| d.write(&path, data, offset.max(0) as u64, &fi));
        match errno_of(rc) {
            Some(errno) => reply.error(errno),
            None => reply.written(rc as u32),
        }
    }

    fn flush(&mut self, req: &Request<'_>, ino: u64, fh: u64, lock_owner: u64, reply: ReplyEmpty) {
        let path = resolve!(self.inode_to_path(ino), reply);
        self.log_request("flush", &path);
        let fi = FileInfo {
            fh,
            lock_owner: Some(lock_owner),
            ..Default::default()
        };
        let rc = self.call(req, |d| d.flush(&path, &fi));
        Self::reply_empty(rc, reply);
    }

    fn release(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        fh: u64,
        flags: i32,
        lock_owner: Option<u64>,
        flush: bool,
        reply: ReplyEmpty,
    ) {
        let path = resolve!(self.inode_to_path(ino), reply);
        self.log_request("release", &path);
        let fi = FileInfo {
            fh,
            flags,
            lock_owner,
            flush,
            ..Default::default()
        };
        let rc = self.call(req, |d| d.release(&path, &fi));
        Self::reply_empty(rc, reply);
    }

    fn opendir(&mut self, _req: &Request<'_>, _ino: u64, _flags: i32, reply: ReplyOpen) {
        // Directories are listed by path; no handle needed
        reply.opened(0, 0);
    }

    fn readdir(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let path = resolve!(self.inode_to_path(ino), reply);
        self.log_request("readdir", &path);

        let entries = match self.list_dir(request_context(req), ino, &path, fh, offset) {
            Ok(entries) => entries,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };

        for entry in entries {
            if reply.add(entry.ino, entry.next_offset, entry.kind, &entry.name) {
                // Buffer full
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _flags: i32,
        reply: ReplyEmpty,
    ) {
        reply.ok();
    }

    fn statfs(&mut self, req: &Request<'_>, ino: u64, reply: ReplyStatfs) {
        let path = self
            .inodes
            .get_path(ino)
            .unwrap_or_else(|| PathBuf::from("/"));
        self.log_request("statfs", &path);
        let mut st = Statvfs::default();
        let rc = self.call(req, |d| d.statfs(&path, &mut st));
        match errno_of(rc) {
            Some(errno) => reply.error(errno),
            None => reply.statfs(
                st.blocks, st.bfree, st.bavail, st.files, st.ffree, st.bsize, st.namemax,
                st.frsize,
            ),
        }
    }

    fn setxattr(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        let path = resolve!(self.inode_to_path(ino), reply);
        let name = resolve!(name.to_str().ok_or(libc::EINVAL), reply);
        self.log_request("setxattr", &path);
        let rc = self.call(req, |d| d.setxattr(&path, name, value, flags));
        Self::reply_empty(rc, reply);
    }

    fn getxattr(&mut self, req: &Request<'_>, ino: u64, name: &OsStr, size: u32, reply: ReplyXattr) {
        let path = resolve!(self.inode_to_path(ino), reply);
        let name = resolve!(name.to_str().ok_or(libc::EINVAL), reply);
        self.log_request("getxattr", &path);
        let mut buf = vec![0u8; size as usize];
        let rc = self.call(req, |d| d.getxattr(&path, name, &mut buf));
        Self::reply_xattr(rc, size, &buf, reply);
    }

    fn listxattr(&mut self, req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        let path = resolve!(self.inode_to_path(ino), reply);
        self.log_request("listxattr", &path);
        let mut buf = vec![0u8; size as usize];
        let rc = self.call(req, |d| d.listxattr(&path, &mut buf));
        Self::reply_xattr(rc, size, &buf, reply);
    }

    fn removexattr(&mut self, req: &Request<'_>, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = resolve!(self.inode_to_path(ino), reply);
        let name = resolve!(name.to_str().ok_or(libc::EINVAL), reply);
        self.log_request("removexattr", &path);
        let rc = self.call(req, |d| d.removexattr(&path, name));
        Self::reply_empty(rc, reply);
    }

    fn access(&mut self, req: &Request<'_>, ino: u64, _mask: i32, reply: ReplyEmpty) {
        // Existence check only; permissions are left to default_permissions
        let path = resolve!(self.inode_to_path(ino), reply);
        match self.attr_of(req, ino, &path) {
            Ok(_) => reply.ok(),
            Err(errno) => reply.error(errno),
        }
    }

    fn create(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let path = resolve!(self.child_path(parent, name), reply);
        // Apply umask to get effective mode (permission bits only)
        let effective_mode = (mode & !umask) & 0o7777;
        self.log_request("create", &path);

        let mut fi = FileInfo::with_flags(flags);
        let rc = self.call(req, |d| d.create(&path, effective_mode, &mut fi));
        if let Some(errno) = errno_of(rc) {
            reply.error(errno);
            return;
        }
        match self.entry_of(req, &path) {
            Ok(attr) => reply.created(&ATTR_TTL, &attr, GENERATION, fi.fh, open_flags(&fi)),
            Err(errno) => reply.error(errno),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{FsError, Result};
    use crate::filesystem::memory::MemoryFs;
    use crate::filesystem::FuseFileSystem;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Records attribute changes, failing the one named in `fail`
    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
        fail: Option<&'static str>,
    }

    impl Recorder {
        fn record(&self, call: String, op: &str) -> Result<()> {
            self.calls.lock().push(call);
            if self.fail == Some(op) {
                return Err(FsError::Errno(libc::EPERM));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl FuseFileSystem for Recorder {
        async fn getattr(&self, _: &Path, _: &mut FileStat) -> Result<()> {
            Ok(())
        }

        async fn readdir(&self, _: &Path, _: &mut DirFiller, _: i64, _: &FileInfo) -> Result<()> {
            Ok(())
        }

        async fn open(&self, _: &Path, _: &mut FileInfo) -> Result<()> {
            Ok(())
        }

        async fn read(&self, _: &Path, _: &mut [u8], _: u64, _: &FileInfo) -> Result<usize> {
            Ok(0)
        }

        async fn chmod(&self, _: &Path, mode: u32) -> Result<()> {
            self.record(format!("chmod {:o}", mode), "chmod")
        }

        async fn chown(&self, _: &Path, uid: Option<u32>, gid: Option<u32>) -> Result<()> {
            self.record(format!("chown {:?} {:?}", uid, gid), "chown")
        }

        async fn truncate(&self, _: &Path, size: u64) -> Result<()> {
            self.record(format!("truncate {}", size), "truncate")
        }

        async fn utimens(
            &self,
            _: &Path,
            atime: Option<SystemTime>,
            mtime: Option<SystemTime>,
        ) -> Result<()> {
            self.record(
                format!("utimens {} {}", atime.is_some(), mtime.is_some()),
                "utimens",
            )
        }
    }

    fn bridge_over(fs: Arc<dyn FuseFileSystem>) -> FuserBridge {
        let dispatcher = CallbackDispatcher::with_worker_threads(fs, 1).unwrap();
        FuserBridge::new(Arc::new(dispatcher), false)
    }

    fn all_changes() -> AttrChanges {
        AttrChanges {
            mode: Some(0o100644),
            uid: Some(1000),
            gid: None,
            size: Some(12),
            atime: None,
            mtime: Some(SystemTime::now()),
        }
    }

    #[test]
    fn test_setattr_order() {
        let fs = Arc::new(Recorder::default());
        let bridge = bridge_over(fs.clone());

        let rc = bridge.apply_changes(FuseContext::default(), Path::new("/f"), all_changes());
        assert_eq!(rc, 0);
        assert_eq!(
            *fs.calls.lock(),
            vec!["chmod 644", "chown Some(1000) None", "truncate 12", "utimens false true"]
        );
    }

    #[test]
    fn test_setattr_stops_at_first_failure() {
        let fs = Arc::new(Recorder {
            fail: Some("chown"),
            ..Default::default()
        });
        let bridge = bridge_over(fs.clone());

        let rc = bridge.apply_changes(FuseContext::default(), Path::new("/f"), all_changes());
        assert_eq!(rc, -libc::EPERM);
        assert_eq!(*fs.calls.lock(), vec!["chmod 644", "chown Some(1000) None"]);
    }

    #[test]
    fn test_setattr_without_changes() {
        let fs = Arc::new(Recorder::default());
        let bridge = bridge_over(fs.clone());

        let rc = bridge.apply_changes(FuseContext::default(), Path::new("/f"), AttrChanges::default());
        assert_eq!(rc, 0);
        assert!(fs.calls.lock().is_empty());
    }

    #[test]
    fn test_readdir_dot_entries() {
        let bridge = bridge_over(Arc::new(MemoryFs::default()));
        let ctx = FuseContext::default();
        assert_eq!(bridge.dispatcher.mkdir(Path::new("/a"), 0o755), 0);
        assert_eq!(bridge.dispatcher.mkdir(Path::new("/a/b"), 0o755), 0);

        let a = bridge.inodes.get_or_create_inode(Path::new("/a"));
        let b = bridge.inodes.get_or_create_inode(Path::new("/a/b"));
        let entries = bridge.list_dir(ctx, b, Path::new("/a/b"), 0, 0).unwrap();
        assert_eq!(entries[0].name, ".");
        assert_eq!(entries[0].ino, b);
        assert_eq!(entries[1].name, "..");
        assert_eq!(entries[1].ino, a);

        let entries = bridge.list_dir(ctx, ROOT_INODE, Path::new("/"), 0, 0).unwrap();
        assert_eq!(entries[1].ino, ROOT_INODE);
        let listed = entries.iter().find(|e| e.name == "a").unwrap();
        assert_eq!(listed.ino, a);
        assert_eq!(listed.kind, FileType::Directory);

        assert_eq!(
            bridge.list_dir(ctx, 99, Path::new("/missing"), 0, 0),
            Err(libc::ENOENT)
        );
    }

    #[test]
    fn test_rename_moves_inodes() {
        let bridge = bridge_over(Arc::new(MemoryFs::default()));
        let ctx = FuseContext::default();
        let mut fi = FileInfo::default();
        assert_eq!(bridge.dispatcher.mkdir(Path::new("/a"), 0o755), 0);
        assert_eq!(bridge.dispatcher.create(Path::new("/a/f"), 0o644, &mut fi), 0);
        let a = bridge.inodes.get_or_create_inode(Path::new("/a"));
        let f = bridge.inodes.get_or_create_inode(Path::new("/a/f"));

        assert_eq!(bridge.move_path(ctx, Path::new("/a"), Path::new("/b"), 0), 0);
        assert_eq!(bridge.inodes.get_path(a), Some(PathBuf::from("/b")));
        assert_eq!(bridge.inodes.get_path(f), Some(PathBuf::from("/b/f")));
        assert_eq!(bridge.inodes.get_inode(Path::new("/a")), None);

        // A failed rename leaves the table alone
        let rc = bridge.move_path(ctx, Path::new("/missing"), Path::new("/b/f"), 0);
        assert_eq!(rc, -libc::ENOENT);
        assert_eq!(bridge.inodes.get_path(f), Some(PathBuf::from("/b/f")));
    }

    #[test]
    fn test_unlink_forgets_inode() {
        let bridge = bridge_over(Arc::new(MemoryFs::default()));
        let ctx = FuseContext::default();
        let mut fi = FileInfo::default();
        assert_eq!(bridge.dispatcher.mkdir(Path::new("/d"), 0o755), 0);
        assert_eq!(bridge.dispatcher.create(Path::new("/d/f"), 0o644, &mut fi), 0);
        let d = bridge.inodes.get_or_create_inode(Path::new("/d"));
        let f = bridge.inodes.get_or_create_inode(Path::new("/d/f"));

        // Not empty
        assert_eq!(bridge.remove(ctx, Path::new("/d"), true), -libc::ENOTEMPTY);
        assert_eq!(bridge.inodes.get_path(d), Some(PathBuf::from("/d")));

        assert_eq!(bridge.remove(ctx, Path::new("/d/f"), false), 0);
        assert_eq!(bridge.inodes.get_path(f), None);
        assert_eq!(bridge.remove(ctx, Path::new("/d"), true), 0);
        assert_eq!(bridge.inodes.get_path(d), None);
    }

    #[test]
    fn test_xattr_reply() {
        assert_eq!(xattr_reply(5, 0), XattrReply::Size(5));
        assert_eq!(xattr_reply(5, 8), XattrReply::Data(5));
        assert_eq!(xattr_reply(5, 5), XattrReply::Data(5));
        assert_eq!(xattr_reply(9, 8), XattrReply::Error(libc::ERANGE));
        assert_eq!(xattr_reply(-libc::ENODATA, 8), XattrReply::Error(libc::ENODATA));
    }

    #[test]
    fn test_stat_to_attr() {
        let now = SystemTime::now();
        let stat = FileStat::file(5000, 0o640, now);
        let attr = stat_to_attr(7, &stat);
        assert_eq!(attr.ino, 7);
        assert_eq!(attr.size, 5000);
        assert_eq!(attr.perm, 0o640);
        assert_eq!(attr.kind, FileType::RegularFile);
        assert_eq!(attr.mtime, now);

        let attr = stat_to_attr(1, &FileStat::directory(0o755, now));
        assert_eq!(attr.kind, FileType::Directory);
        assert_eq!(attr.nlink, 2);
    }

    #[test]
    fn test_open_flags() {
        assert_eq!(open_flags(&FileInfo::default()), 0);
        let fi = FileInfo {
            direct_io: true,
            nonseekable: true,
            ..Default::default()
        };
        assert_eq!(open_flags(&fi), FOPEN_DIRECT_IO | FOPEN_NONSEEKABLE);
    }

    #[test]
    fn test_unknown_mode_is_regular_file() {
        assert_eq!(to_fuse_file_type(None), FileType::RegularFile);
        assert_eq!(
            to_fuse_file_type(Some(FileKind::Symlink)),
            FileType::Symlink
        );
    }
}
