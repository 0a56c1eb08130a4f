//! Wires a filesystem implementation to a mount controller and a native loop

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::error::MountError;
use crate::filesystem::FuseFileSystem;
use crate::fuse::native::{FuserLoop, NativeLoop};
use crate::fuse::{CallbackDispatcher, DEFAULT_WORKER_THREADS};
use crate::mount::shutdown::ShutdownHooks;
use crate::mount::unmount::Unmounter;
use crate::mount::{MountController, MountOptions, MountState, DEFAULT_MOUNT_TIMEOUT};

/// A mountable filesystem
///
/// Owns the dispatcher that serves requests and the controller that tracks
/// whether the native loop is running.
pub struct FuseFileSystemAdapter {
    controller: MountController,
    dispatcher: Arc<CallbackDispatcher>,
    native: Arc<dyn NativeLoop>,
}

impl FuseFileSystemAdapter {
    pub fn builder(fs: Arc<dyn FuseFileSystem>, mount_point: impl AsRef<Path>) -> AdapterBuilder {
        AdapterBuilder::new(fs, mount_point)
    }

    /// Build with the platform unmounter and the fuser loop
    pub fn new(fs: Arc<dyn FuseFileSystem>, mount_point: impl AsRef<Path>) -> Result<Self, MountError> {
        Self::builder(fs, mount_point).build()
    }

    /// Mount the filesystem and start serving requests
    ///
    /// See [`MountController::mount`] for blocking and timeout behaviour.
    pub fn mount(&self, options: &MountOptions) -> Result<(), MountError> {
        let native = self.native.clone();
        let dispatcher = self.dispatcher.clone();
        self.controller
            .mount(options, move |args| native.run(&args, dispatcher))
    }

    /// Unmount if mounted
    pub fn umount(&self, force: bool) -> Result<(), MountError> {
        self.controller.umount(force)
    }

    pub fn state(&self) -> MountState {
        self.controller.state()
    }

    pub fn is_mounted(&self) -> bool {
        self.controller.is_mounted()
    }

    pub fn mount_point(&self) -> &Path {
        self.controller.mount_point()
    }

    pub fn controller(&self) -> &MountController {
        &self.controller
    }

    pub fn dispatcher(&self) -> &Arc<CallbackDispatcher> {
        &self.dispatcher
    }
}

/// Builder for [`FuseFileSystemAdapter`]
pub struct AdapterBuilder {
    fs: Arc<dyn FuseFileSystem>,
    mount_point: PathBuf,
    native: Option<Arc<dyn NativeLoop>>,
    unmounter: Option<Box<dyn Unmounter>>,
    mount_timeout: Duration,
    hooks: Option<ShutdownHooks>,
    worker_threads: usize,
}

impl AdapterBuilder {
    pub fn new(fs: Arc<dyn FuseFileSystem>, mount_point: impl AsRef<Path>) -> Self {
        Self {
            fs,
            mount_point: mount_point.as_ref().to_path_buf(),
            native: None,
            unmounter: None,
            mount_timeout: DEFAULT_MOUNT_TIMEOUT,
            hooks: None,
            worker_threads: DEFAULT_WORKER_THREADS,
        }
    }

    /// Serve through a different native loop than fuser
    pub fn native_loop(mut self, native: Arc<dyn NativeLoop>) -> Self {
        self.native = Some(native);
        self
    }

    pub fn unmounter(mut self, unmounter: Box<dyn Unmounter>) -> Self {
        self.unmounter = Some(unmounter);
        self
    }

    pub fn mount_timeout(mut self, timeout: Duration) -> Self {
        self.mount_timeout = timeout;
        self
    }

    pub fn shutdown_hooks(mut self, hooks: ShutdownHooks) -> Self {
        self.hooks = Some(hooks);
        self
    }

    pub fn worker_threads(mut self, worker_threads: usize) -> Self {
        self.worker_threads = worker_threads;
        self
    }

    pub fn build(self) -> Result<FuseFileSystemAdapter, MountError> {
        let name = self.fs.name().to_string();

        let mut controller = MountController::builder(&name, &self.mount_point)
            .mount_timeout(self.mount_timeout);
        if let Some(unmounter) = self.unmounter {
            controller = controller.unmounter(unmounter);
        }
        if let Some(hooks) = self.hooks {
            controller = controller.shutdown_hooks(hooks);
        }
        let controller = controller.build()?;

        let dispatcher = CallbackDispatcher::with_worker_threads(self.fs, self.worker_threads)
            .map_err(MountError::Setup)?;
        let native = self.native.unwrap_or_else(|| Arc::new(FuserLoop));

        info!(
            "Created filesystem {} for {:?}",
            name,
            controller.mount_point()
        );
        Ok(FuseFileSystemAdapter {
            controller,
            dispatcher: Arc::new(dispatcher),
            native,
        })
    }
}
