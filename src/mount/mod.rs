//! Mount management and lifecycle
//!
//! [`MountController`] owns the mount state of one filesystem instance. The
//! state lives in an atomic so concurrent `mount`/`umount` callers race on a
//! compare-and-exchange and exactly one of them proceeds. Each mount attempt
//! also bumps a generation counter stored next to the state, so a loop that
//! ends late can only reset the mount it belongs to.

pub mod shutdown;
pub mod unmount;

use std::collections::BTreeSet;
use std::fmt;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Weak};
use std::thread;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::error::MountError;
use shutdown::ShutdownHooks;
use unmount::{platform_unmounter, Unmounter};

/// How long a non-blocking mount waits for the loop to fail before
/// assuming it is serving
pub const DEFAULT_MOUNT_TIMEOUT: Duration = Duration::from_millis(2000);

/// Name of the thread running a non-blocking native loop
pub const LOOP_THREAD_NAME: &str = "fuse-main";

/// Lifecycle state of a mount
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MountState {
    NotMounted = 0,
    Mounting = 1,
    Mounted = 2,
    Unmounting = 3,
}

impl MountState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => MountState::Mounting,
            2 => MountState::Mounted,
            3 => MountState::Unmounting,
            _ => MountState::NotMounted,
        }
    }
}

impl fmt::Display for MountState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MountState::NotMounted => "not mounted",
            MountState::Mounting => "mounting",
            MountState::Mounted => "mounted",
            MountState::Unmounting => "unmounting",
        };
        f.write_str(name)
    }
}

/// Absolute directory a filesystem is mounted on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountPoint(PathBuf);

impl MountPoint {
    pub fn new(path: impl AsRef<Path>) -> io::Result<Self> {
        Ok(Self(std::path::absolute(path)?))
    }

    pub fn path(&self) -> &Path {
        &self.0
    }

    /// Path as passed to the native loop, without a trailing `\`
    pub fn to_arg(&self) -> String {
        let arg = self.0.to_string_lossy();
        arg.strip_suffix('\\').unwrap_or(&arg).to_string()
    }
}

/// How a mount is performed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MountOptions {
    /// Run the native loop on the calling thread until unmounted
    pub blocking: bool,
    /// Enable the native loop's debug output
    pub debug: bool,
    /// Free-form `-o` options, passed through as-is
    pub options: BTreeSet<String>,
}

impl MountOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn blocking(mut self, blocking: bool) -> Self {
        self.blocking = blocking;
        self
    }

    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn option(mut self, option: impl Into<String>) -> Self {
        self.options.insert(option.into());
        self
    }
}

/// Argument vector handed to the native loop
///
/// `<name> -f [-d] <mountpoint> -o<opt>...`
pub fn loop_args(name: &str, mount_point: &MountPoint, options: &MountOptions) -> Vec<String> {
    let mut args = vec![name.to_string(), "-f".to_string()];
    if options.debug {
        args.push("-d".to_string());
    }
    args.push(mount_point.to_arg());
    args.extend(options.options.iter().map(|o| format!("-o{}", o)));
    args
}

const STATE_BITS: u32 = 8;
const STATE_MASK: u64 = (1 << STATE_BITS) - 1;

fn pack(generation: u64, state: MountState) -> u64 {
    (generation << STATE_BITS) | state as u64
}

struct Inner {
    name: String,
    mount_point: MountPoint,
    /// Mount generation in the high bits, [`MountState`] in the low byte
    state: AtomicU64,
    unmounter: Box<dyn Unmounter>,
    mount_timeout: Duration,
    hooks: Option<ShutdownHooks>,
    hook_registered: AtomicBool,
}

impl Inner {
    fn state(&self) -> MountState {
        MountState::from_u8((self.state.load(Ordering::SeqCst) & STATE_MASK) as u8)
    }

    /// NotMounted -> Mounting under a fresh generation, which is returned
    fn begin_mount(&self) -> Option<u64> {
        let mut current = self.state.load(Ordering::SeqCst);
        loop {
            if current & STATE_MASK != MountState::NotMounted as u64 {
                return None;
            }
            let generation = ((current >> STATE_BITS) + 1) & (u64::MAX >> STATE_BITS);
            match self.state.compare_exchange(
                current,
                pack(generation, MountState::Mounting),
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Some(generation),
                Err(actual) => current = actual,
            }
        }
    }

    /// `from -> to` within whatever generation is current
    fn transition(&self, from: MountState, to: MountState) -> bool {
        let mut current = self.state.load(Ordering::SeqCst);
        loop {
            if current & STATE_MASK != from as u64 {
                return false;
            }
            let generation = current >> STATE_BITS;
            match self.state.compare_exchange(
                current,
                pack(generation, to),
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// `from -> to` only if `generation` is still the current mount
    fn transition_in(&self, generation: u64, from: MountState, to: MountState) -> bool {
        self.state
            .compare_exchange(
                pack(generation, from),
                pack(generation, to),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    fn umount(&self, force: bool) -> Result<(), MountError> {
        if !self.transition(MountState::Mounted, MountState::Unmounting) {
            debug!(
                "Skipping unmount of {:?}: {}",
                self.mount_point.path(),
                self.state()
            );
            return Ok(());
        }

        info!(
            "Unmounting {:?}{}",
            self.mount_point.path(),
            if force { " (forced)" } else { "" }
        );
        let result = self.unmounter.unmount(self.mount_point.path());
        self.transition(MountState::Unmounting, MountState::NotMounted);

        if let Err(e) = &result {
            error!("Failed to unmount {:?}: {}", self.mount_point.path(), e);
        }
        result
    }
}

/// Mount/unmount state machine for one mount point
#[derive(Clone)]
pub struct MountController {
    inner: Arc<Inner>,
}

impl MountController {
    pub fn builder(name: impl Into<String>, mount_point: impl AsRef<Path>) -> MountControllerBuilder {
        MountControllerBuilder::new(name, mount_point)
    }

    pub fn state(&self) -> MountState {
        self.inner.state()
    }

    pub fn is_mounted(&self) -> bool {
        self.state() == MountState::Mounted
    }

    pub fn mount_point(&self) -> &Path {
        self.inner.mount_point.path()
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Mount the filesystem by running `launch` with the loop argument vector
    ///
    /// `launch` runs the native loop and returns its exit code. In blocking
    /// mode it runs on the calling thread and this returns once the loop
    /// ends. Otherwise it runs on a `fuse-main` thread and this returns as
    /// soon as the loop fails or the mount timeout elapses, whichever is
    /// first; an elapsed timeout counts as a successful mount.
    pub fn mount<F>(&self, options: &MountOptions, launch: F) -> Result<(), MountError>
    where
        F: FnOnce(Vec<String>) -> i32 + Send + 'static,
    {
        let inner = &self.inner;
        let Some(generation) = inner.begin_mount() else {
            return Err(MountError::AlreadyMounted(
                inner.mount_point.path().to_path_buf(),
            ));
        };

        info!(
            "Mounting {} at {:?} ({})",
            inner.name,
            inner.mount_point.path(),
            if options.blocking { "blocking" } else { "non-blocking" }
        );
        let args = loop_args(&inner.name, &inner.mount_point, options);
        debug!("Native loop arguments: {:?}", args);

        self.register_shutdown_hook();

        let result = if options.blocking {
            self.mount_blocking(generation, args, launch)
        } else {
            self.mount_detached(generation, args, launch)
        };

        if let Err(e) = &result {
            // A concurrent umount may already have reset this mount and a
            // newer one may be underway; leave that one alone
            if !inner.transition_in(generation, MountState::Mounting, MountState::NotMounted) {
                inner.transition_in(generation, MountState::Mounted, MountState::NotMounted);
            }
            error!("Failed to mount {:?}: {}", inner.mount_point.path(), e);
        }
        result
    }

    fn mount_blocking<F>(
        &self,
        generation: u64,
        args: Vec<String>,
        launch: F,
    ) -> Result<(), MountError>
    where
        F: FnOnce(Vec<String>) -> i32,
    {
        let inner = &self.inner;
        inner.transition_in(generation, MountState::Mounting, MountState::Mounted);

        let code = panic::catch_unwind(AssertUnwindSafe(|| launch(args)))
            .map_err(|_| MountError::LoopPanicked)?;
        if code != 0 {
            return Err(MountError::MountFailed(code));
        }

        // Unmounted from outside; an in-flight umount owns the reset otherwise
        inner.transition_in(generation, MountState::Mounted, MountState::NotMounted);
        info!("Filesystem at {:?} unmounted", inner.mount_point.path());
        Ok(())
    }

    fn mount_detached<F>(
        &self,
        generation: u64,
        args: Vec<String>,
        launch: F,
    ) -> Result<(), MountError>
    where
        F: FnOnce(Vec<String>) -> i32 + Send + 'static,
    {
        let inner = &self.inner;
        // Rendezvous: a send fails once `mount` has stopped listening
        let (tx, rx) = mpsc::sync_channel(0);
        let mount_point = inner.mount_point.path().to_path_buf();
        let weak: Weak<Inner> = Arc::downgrade(inner);

        thread::Builder::new()
            .name(LOOP_THREAD_NAME.to_string())
            .spawn(move || {
                let code = panic::catch_unwind(AssertUnwindSafe(|| launch(args))).ok();
                match code {
                    Some(0) => info!("Native loop for {:?} exited", mount_point),
                    Some(code) => warn!("Native loop for {:?} exited with {}", mount_point, code),
                    None => error!("Native loop for {:?} panicked", mount_point),
                }
                if tx.send(code).is_err() {
                    // The mount already succeeded, so the filesystem is gone
                    if let Some(inner) = weak.upgrade() {
                        let reset = inner.transition_in(
                            generation,
                            MountState::Mounted,
                            MountState::NotMounted,
                        );
                        if reset {
                            info!("Mount at {:?} went away, marked not mounted", mount_point);
                        }
                    }
                }
            })
            .map_err(MountError::Setup)?;

        match rx.recv_timeout(inner.mount_timeout) {
            Err(mpsc::RecvTimeoutError::Timeout) => {
                debug!(
                    "Native loop still running after {:?}, assuming mounted",
                    inner.mount_timeout
                );
            }
            Ok(Some(0)) => {
                debug!("Native loop returned 0 before the mount timeout");
            }
            Ok(Some(code)) => return Err(MountError::MountFailed(code)),
            Ok(None) | Err(mpsc::RecvTimeoutError::Disconnected) => {
                return Err(MountError::LoopPanicked)
            }
        }

        inner.transition_in(generation, MountState::Mounting, MountState::Mounted);
        drop(rx);
        info!("Mounted {:?}", inner.mount_point.path());
        Ok(())
    }

    fn register_shutdown_hook(&self) {
        let Some(hooks) = &self.inner.hooks else {
            return;
        };
        if self.inner.hook_registered.load(Ordering::SeqCst) || !hooks.accepts_hooks() {
            return;
        }

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let name = format!("umount {:?}", self.inner.mount_point.path());
        let registered = hooks.register(name, move || {
            if let Some(inner) = weak.upgrade() {
                // Errors are already logged by umount
                let _ = inner.umount(true);
            }
        });
        self.inner.hook_registered.store(registered, Ordering::SeqCst);
    }

    /// Unmount if mounted; a no-op in any other state
    ///
    /// The state is `NotMounted` afterwards whether or not the unmount
    /// utility succeeded.
    pub fn umount(&self, force: bool) -> Result<(), MountError> {
        self.inner.umount(force)
    }
}

impl fmt::Debug for MountController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MountController")
            .field("name", &self.inner.name)
            .field("mount_point", &self.inner.mount_point)
            .field("state", &self.state())
            .finish()
    }
}

/// Builder for [`MountController`]
pub struct MountControllerBuilder {
    name: String,
    mount_point: PathBuf,
    unmounter: Option<Box<dyn Unmounter>>,
    mount_timeout: Duration,
    hooks: Option<ShutdownHooks>,
}

impl MountControllerBuilder {
    pub fn new(name: impl Into<String>, mount_point: impl AsRef<Path>) -> Self {
        Self {
            name: name.into(),
            mount_point: mount_point.as_ref().to_path_buf(),
            unmounter: None,
            mount_timeout: DEFAULT_MOUNT_TIMEOUT,
            hooks: None,
        }
    }

    /// Override the platform unmount strategy
    pub fn unmounter(mut self, unmounter: Box<dyn Unmounter>) -> Self {
        self.unmounter = Some(unmounter);
        self
    }

    pub fn mount_timeout(mut self, timeout: Duration) -> Self {
        self.mount_timeout = timeout;
        self
    }

    /// Register a forced unmount with `hooks` on first mount
    pub fn shutdown_hooks(mut self, hooks: ShutdownHooks) -> Self {
        self.hooks = Some(hooks);
        self
    }

    pub fn build(self) -> Result<MountController, MountError> {
        let mount_point = MountPoint::new(&self.mount_point).map_err(MountError::Setup)?;
        Ok(MountController {
            inner: Arc::new(Inner {
                name: self.name,
                mount_point,
                state: AtomicU64::new(pack(0, MountState::NotMounted)),
                unmounter: self.unmounter.unwrap_or_else(platform_unmounter),
                mount_timeout: self.mount_timeout,
                hooks: self.hooks,
                hook_registered: AtomicBool::new(false),
            }),
        })
    }
}
