//! Fault isolation across every dispatcher entry point

use std::path::Path;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use parking_lot::Mutex;

use pathfuse::filesystem::memory::MemoryFs;
use pathfuse::filesystem::{DirFiller, FileInfo, FileStat, Statvfs};
use pathfuse::{CallbackDispatcher, FsError, FuseFileSystem, Result};

const HEALTHY: u8 = 0;
const FAILING: u8 = 1;
const PANICKING: u8 = 2;

/// Filesystem whose every operation succeeds, fails or panics on demand
#[derive(Default)]
struct Switchable {
    mode: AtomicU8,
    renames: Mutex<Vec<(String, String, u32)>>,
}

impl Switchable {
    fn set(&self, mode: u8) {
        self.mode.store(mode, Ordering::SeqCst);
    }

    fn check(&self, op: &str) -> Result<()> {
        match self.mode.load(Ordering::SeqCst) {
            FAILING => Err(FsError::Backend(format!("{} unavailable", op))),
            PANICKING => panic!("{} blew up", op),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl FuseFileSystem for Switchable {
    async fn getattr(&self, _: &Path, _: &mut FileStat) -> Result<()> {
        self.check("getattr")
    }

    async fn readdir(&self, _: &Path, _: &mut DirFiller, _: i64, _: &FileInfo) -> Result<()> {
        self.check("readdir")
    }

    async fn open(&self, _: &Path, _: &mut FileInfo) -> Result<()> {
        self.check("open")
    }

    async fn read(&self, _: &Path, buf: &mut [u8], _: u64, _: &FileInfo) -> Result<usize> {
        self.check("read").map(|_| buf.len())
    }

    async fn write(&self, _: &Path, buf: &[u8], _: u64, _: &FileInfo) -> Result<usize> {
        self.check("write").map(|_| buf.len())
    }

    async fn create(&self, _: &Path, _: u32, _: &mut FileInfo) -> Result<()> {
        self.check("create")
    }

    async fn mkdir(&self, _: &Path, _: u32) -> Result<()> {
        self.check("mkdir")
    }

    async fn unlink(&self, _: &Path) -> Result<()> {
        self.check("unlink")
    }

    async fn rmdir(&self, _: &Path) -> Result<()> {
        self.check("rmdir")
    }

    async fn rename(&self, from: &Path, to: &Path, flags: u32) -> Result<()> {
        self.check("rename")?;
        self.renames.lock().push((
            from.display().to_string(),
            to.display().to_string(),
            flags,
        ));
        Ok(())
    }

    async fn truncate(&self, _: &Path, _: u64) -> Result<()> {
        self.check("truncate")
    }

    async fn chmod(&self, _: &Path, _: u32) -> Result<()> {
        self.check("chmod")
    }

    async fn chown(&self, _: &Path, _: Option<u32>, _: Option<u32>) -> Result<()> {
        self.check("chown")
    }

    async fn symlink(&self, _: &Path, _: &Path) -> Result<()> {
        self.check("symlink")
    }

    async fn utimens(&self, _: &Path, _: Option<SystemTime>, _: Option<SystemTime>) -> Result<()> {
        self.check("utimens")
    }

    async fn flush(&self, _: &Path, _: &FileInfo) -> Result<()> {
        self.check("flush")
    }

    async fn release(&self, _: &Path, _: &FileInfo) -> Result<()> {
        self.check("release")
    }

    async fn statfs(&self, _: &Path, _: &mut Statvfs) -> Result<()> {
        self.check("statfs")
    }

    async fn setxattr(&self, _: &Path, _: &str, _: &[u8], _: i32) -> Result<()> {
        self.check("setxattr")
    }

    async fn getxattr(&self, _: &Path, _: &str, _: &mut [u8]) -> Result<usize> {
        self.check("getxattr").map(|_| 0)
    }

    async fn listxattr(&self, _: &Path, _: &mut [u8]) -> Result<usize> {
        self.check("listxattr").map(|_| 0)
    }

    async fn removexattr(&self, _: &Path, _: &str) -> Result<()> {
        self.check("removexattr")
    }
}

/// Invoke every entry point once and collect the return codes
fn call_all(d: &CallbackDispatcher) -> Vec<(&'static str, i32)> {
    let path = Path::new("/file");
    let other = Path::new("/other");
    let mut fi = FileInfo::default();
    let mut stat = FileStat::default();
    let mut statvfs = Statvfs::default();
    let mut filler = DirFiller::new();
    let mut buf = [0u8; 8];
    let now = Some(SystemTime::now());

    vec![
        ("getattr", d.getattr(path, &mut stat)),
        ("readdir", d.readdir(Path::new("/"), &mut filler, 0, &fi)),
        ("open", d.open(path, &mut fi)),
        ("read", d.read(path, &mut buf, 0, &fi)),
        ("write", d.write(path, b"abc", 0, &fi)),
        ("create", d.create(path, 0o644, &mut fi)),
        ("mkdir", d.mkdir(other, 0o755)),
        ("unlink", d.unlink(path)),
        ("rmdir", d.rmdir(other)),
        ("rename", d.rename(path, other)),
        ("rename_with_flags", d.rename_with_flags(path, other, 1)),
        ("truncate", d.truncate(path, 0)),
        ("chmod", d.chmod(path, 0o600)),
        ("chown", d.chown(path, Some(1000), None)),
        ("symlink", d.symlink(path, other)),
        ("utimens", d.utimens(path, now, now)),
        ("flush", d.flush(path, &fi)),
        ("release", d.release(path, &fi)),
        ("statfs", d.statfs(Path::new("/"), &mut statvfs)),
        ("setxattr", d.setxattr(path, "user.k", b"v", 0)),
        ("getxattr", d.getxattr(path, "user.k", &mut buf)),
        ("listxattr", d.listxattr(path, &mut buf)),
        ("removexattr", d.removexattr(path, "user.k")),
    ]
}

fn setup() -> (Arc<Switchable>, CallbackDispatcher) {
    let fs = Arc::new(Switchable::default());
    let dispatcher = CallbackDispatcher::with_worker_threads(fs.clone(), 2).unwrap();
    (fs, dispatcher)
}

#[test]
fn test_every_entry_point_reports_failures_as_eio() {
    let (fs, d) = setup();
    fs.set(FAILING);

    for (op, code) in call_all(&d) {
        assert_eq!(code, -libc::EIO, "{} should fail with EIO", op);
    }
}

#[test]
fn test_every_entry_point_contains_panics() {
    let (fs, d) = setup();
    fs.set(PANICKING);

    for (op, code) in call_all(&d) {
        assert_eq!(code, -libc::EIO, "{} should contain its panic", op);
    }

    // The dispatcher keeps serving once the filesystem recovers
    fs.set(HEALTHY);
    for (op, code) in call_all(&d) {
        assert!(code >= 0, "{} returned {} after recovery", op, code);
    }
}

#[test]
fn test_success_codes() {
    let (_fs, d) = setup();
    let codes: std::collections::HashMap<_, _> = call_all(&d).into_iter().collect();

    assert_eq!(codes["read"], 8);
    assert_eq!(codes["write"], 3);
    assert_eq!(codes["getattr"], 0);
    assert_eq!(codes["getxattr"], 0);
}

#[test]
fn test_rename_without_flags_is_flags_zero() {
    let (fs, d) = setup();

    assert_eq!(d.rename(Path::new("/a"), Path::new("/b")), 0);
    assert_eq!(d.rename_with_flags(Path::new("/a"), Path::new("/b"), 0), 0);

    let renames = fs.renames.lock().clone();
    assert_eq!(renames.len(), 2);
    assert_eq!(renames[0], renames[1]);
    assert_eq!(renames[0].2, 0);
}

#[test]
fn test_concurrent_requests_against_memory_fs() {
    let d = Arc::new(
        CallbackDispatcher::with_worker_threads(Arc::new(MemoryFs::new("memfs")), 2).unwrap(),
    );

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let d = d.clone();
            std::thread::spawn(move || {
                let path = format!("/file-{}", i);
                let path = Path::new(&path);
                let mut fi = FileInfo::default();
                assert_eq!(d.create(path, 0o644, &mut fi), 0);
                assert_eq!(d.write(path, b"payload", 0, &fi), 7);

                let mut buf = [0u8; 16];
                assert_eq!(d.read(path, &mut buf, 0, &fi), 7);
                assert_eq!(&buf[..7], b"payload");
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let mut filler = DirFiller::new();
    assert_eq!(d.readdir(Path::new("/"), &mut filler, 0, &FileInfo::default()), 0);
    let files = filler
        .entries()
        .iter()
        .filter(|e| e.name.to_string_lossy().starts_with("file-"))
        .count();
    assert_eq!(files, 8);
}

#[test]
fn test_missing_path_is_enoent() {
    let d = CallbackDispatcher::new(Arc::new(MemoryFs::default())).unwrap();
    let mut stat = FileStat::default();
    assert_eq!(d.getattr(Path::new("/missing"), &mut stat), -libc::ENOENT);
    assert_eq!(d.unlink(Path::new("/missing")), -libc::ENOENT);
}

#[test]
fn test_oversized_growth_is_rejected_not_fatal() {
    let d = CallbackDispatcher::new(Arc::new(MemoryFs::default())).unwrap();
    let path = Path::new("/f");
    let mut fi = FileInfo::default();
    assert_eq!(d.create(path, 0o644, &mut fi), 0);

    assert_eq!(d.truncate(path, 1 << 50), -libc::EFBIG);
    assert_eq!(d.write(path, b"x", 1 << 50, &fi), -libc::EFBIG);

    assert_eq!(d.write(path, b"still serving", 0, &fi), 13);
}
