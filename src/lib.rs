//! pathfuse: mount lifecycle and callback dispatch for path-based FUSE filesystems
//!
//! Implement [`FuseFileSystem`] against paths and this crate takes care of
//! mounting it, serving kernel requests and unmounting it again.
//!
//! # Architecture
//!
//! - **Filesystem**: the [`FuseFileSystem`] async trait, one method per
//!   operation, returning typed errors. [`filesystem::memory::MemoryFs`] is
//!   a complete in-memory implementation.
//! - **Dispatcher**: [`CallbackDispatcher`] turns each call into the signed
//!   errno convention and contains failures and panics so the native loop
//!   keeps serving.
//! - **Native loop**: [`fuse::native::FuserLoop`] serves the dispatcher
//!   through fuser, mapping inodes back to paths.
//! - **Mount controller**: [`MountController`] tracks mount state atomically,
//!   runs the loop blocking or on a background thread, and forces unmounts
//!   with the platform's unmount utility.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use pathfuse::filesystem::memory::MemoryFs;
//! use pathfuse::{FuseFileSystemAdapter, MountOptions};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let adapter = FuseFileSystemAdapter::new(Arc::new(MemoryFs::new("memfs")), "/mnt/memfs")?;
//!
//! // Returns once the loop has been serving for the mount timeout
//! adapter.mount(&MountOptions::new().option("default_permissions"))?;
//! // ...
//! adapter.umount(false)?;
//! # Ok(())
//! # }
//! ```

pub mod adapter;
pub mod config;
pub mod env;
pub mod errno;
pub mod error;
pub mod filesystem;
pub mod fuse;
pub mod mount;

pub use adapter::{AdapterBuilder, FuseFileSystemAdapter};
pub use error::{FsError, MountError, Result};
pub use filesystem::FuseFileSystem;
pub use fuse::CallbackDispatcher;
pub use mount::shutdown::ShutdownHooks;
pub use mount::{MountController, MountOptions, MountState};
