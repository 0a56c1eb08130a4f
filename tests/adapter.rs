//! Adapter lifecycle against a scripted native loop

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use pathfuse::filesystem::memory::MemoryFs;
use pathfuse::filesystem::FileStat;
use pathfuse::fuse::native::NativeLoop;
use pathfuse::mount::unmount::Unmounter;
use pathfuse::{
    CallbackDispatcher, FuseFileSystemAdapter, MountError, MountOptions, MountState,
    ShutdownHooks,
};

/// Stands in for the kernel side of a mount: serving until unmounted
#[derive(Default)]
struct Session {
    mounted: Mutex<bool>,
    changed: Condvar,
    args: Mutex<Vec<Vec<String>>>,
    root_status: Mutex<Option<i32>>,
}

impl Session {
    fn serve(&self) {
        let mut mounted = self.mounted.lock();
        *mounted = true;
        self.changed.notify_all();
        while *mounted {
            self.changed.wait(&mut mounted);
        }
    }

    fn wait_serving(&self) {
        let mut mounted = self.mounted.lock();
        while !*mounted {
            self.changed.wait(&mut mounted);
        }
    }

    fn unmount(&self) {
        *self.mounted.lock() = false;
        self.changed.notify_all();
    }

    fn last_args(&self) -> Vec<String> {
        self.args.lock().last().cloned().unwrap_or_default()
    }
}

/// Native loop that serves until the session is unmounted
struct FakeLoop {
    session: Arc<Session>,
    exit_code: i32,
}

impl NativeLoop for FakeLoop {
    fn run(&self, args: &[String], dispatcher: Arc<CallbackDispatcher>) -> i32 {
        self.session.args.lock().push(args.to_vec());
        if self.exit_code != 0 {
            return self.exit_code;
        }

        let mut stat = FileStat::default();
        *self.session.root_status.lock() = Some(dispatcher.getattr(Path::new("/"), &mut stat));

        self.session.serve();
        0
    }
}

/// Unmounts the session, as `fusermount -u` would
struct FakeUnmounter {
    session: Arc<Session>,
    calls: Arc<AtomicUsize>,
}

impl Unmounter for FakeUnmounter {
    fn unmount(&self, _path: &Path) -> Result<(), MountError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.session.unmount();
        Ok(())
    }
}

struct Fixture {
    adapter: Arc<FuseFileSystemAdapter>,
    session: Arc<Session>,
    unmounts: Arc<AtomicUsize>,
    hooks: ShutdownHooks,
}

fn fixture(exit_code: i32) -> Fixture {
    let session = Arc::new(Session::default());
    let unmounts = Arc::new(AtomicUsize::new(0));
    let hooks = ShutdownHooks::new();

    let adapter = FuseFileSystemAdapter::builder(Arc::new(MemoryFs::new("memfs")), "/mnt/memfs")
        .native_loop(Arc::new(FakeLoop {
            session: session.clone(),
            exit_code,
        }))
        .unmounter(Box::new(FakeUnmounter {
            session: session.clone(),
            calls: unmounts.clone(),
        }))
        .mount_timeout(Duration::from_millis(100))
        .shutdown_hooks(hooks.clone())
        .worker_threads(1)
        .build()
        .unwrap();

    Fixture {
        adapter: Arc::new(adapter),
        session,
        unmounts,
        hooks,
    }
}

#[test]
fn test_mount_serves_and_unmounts() {
    let f = fixture(0);
    f.adapter
        .mount(&MountOptions::new().option("allow_other"))
        .unwrap();

    assert!(f.adapter.is_mounted());
    assert_eq!(f.adapter.mount_point(), PathBuf::from("/mnt/memfs"));
    assert_eq!(
        f.session.last_args(),
        vec!["memfs", "-f", "/mnt/memfs", "-oallow_other"]
    );
    assert_eq!(*f.session.root_status.lock(), Some(0));

    f.adapter.umount(false).unwrap();
    assert_eq!(f.adapter.state(), MountState::NotMounted);
    assert_eq!(f.unmounts.load(Ordering::SeqCst), 1);

    // Idempotent
    f.adapter.umount(true).unwrap();
    assert_eq!(f.unmounts.load(Ordering::SeqCst), 1);
}

#[test]
fn test_second_mount_rejected() {
    let f = fixture(0);
    f.adapter.mount(&MountOptions::new()).unwrap();

    let err = f.adapter.mount(&MountOptions::new()).unwrap_err();
    assert!(matches!(err, MountError::AlreadyMounted(p) if p == Path::new("/mnt/memfs")));
    assert!(f.adapter.is_mounted());

    f.adapter.umount(false).unwrap();
}

#[test]
fn test_remount_after_umount() {
    let f = fixture(0);
    f.adapter.mount(&MountOptions::new()).unwrap();
    f.adapter.umount(false).unwrap();

    f.adapter.mount(&MountOptions::new().debug(true)).unwrap();
    assert_eq!(f.session.last_args(), vec!["memfs", "-f", "-d", "/mnt/memfs"]);
    f.adapter.umount(false).unwrap();
    assert_eq!(f.session.args.lock().len(), 2);
}

#[test]
fn test_failing_loop() {
    let f = fixture(1);

    let err = f.adapter.mount(&MountOptions::new()).unwrap_err();
    assert!(matches!(err, MountError::MountFailed(1)));
    assert_eq!(f.adapter.state(), MountState::NotMounted);

    let err = f
        .adapter
        .mount(&MountOptions::new().blocking(true))
        .unwrap_err();
    assert!(matches!(err, MountError::MountFailed(1)));
    assert_eq!(f.adapter.state(), MountState::NotMounted);
    assert_eq!(f.unmounts.load(Ordering::SeqCst), 0);
}

#[test]
fn test_blocking_mount_returns_after_umount() {
    let f = fixture(0);
    let adapter = f.adapter.clone();
    let mount = thread::spawn(move || adapter.mount(&MountOptions::new().blocking(true)));

    f.session.wait_serving();
    assert!(f.adapter.is_mounted());
    f.adapter.umount(false).unwrap();

    mount.join().unwrap().unwrap();
    assert_eq!(f.adapter.state(), MountState::NotMounted);
    assert_eq!(f.unmounts.load(Ordering::SeqCst), 1);
}

#[test]
fn test_shutdown_hooks_force_unmount() {
    let f = fixture(0);
    f.adapter.mount(&MountOptions::new()).unwrap();

    assert_eq!(f.hooks.run(), 1);
    assert_eq!(f.adapter.state(), MountState::NotMounted);
    assert_eq!(f.unmounts.load(Ordering::SeqCst), 1);

    // The host's own umount afterwards finds nothing to do
    f.adapter.umount(false).unwrap();
    assert_eq!(f.unmounts.load(Ordering::SeqCst), 1);
}
