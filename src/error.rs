use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Failure raised by a filesystem implementation while serving one request
#[derive(Error, Debug)]
pub enum FsError {
    #[error("Path not found: {0}")]
    NotFound(String),

    #[error("Path already exists: {0}")]
    AlreadyExists(String),

    #[error("Not a directory: {0}")]
    NotADirectory(String),

    #[error("Is a directory: {0}")]
    IsADirectory(String),

    #[error("Directory not empty: {0}")]
    NotEmpty(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Operation not supported: {0}")]
    NotSupported(String),

    #[error("Read-only filesystem")]
    ReadOnly,

    #[error("Permission denied")]
    PermissionDenied,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("No such attribute: {0}")]
    NoAttribute(String),

    #[error("Result buffer too small")]
    Range,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("errno {0}")]
    Errno(i32),
}

impl FsError {
    /// Convert error to libc errno for FUSE responses
    ///
    /// Kinds without a precise errno collapse to `EIO`.
    pub fn to_errno(&self) -> i32 {
        match self {
            FsError::NotFound(_) => libc::ENOENT,
            FsError::AlreadyExists(_) => libc::EEXIST,
            FsError::NotADirectory(_) => libc::ENOTDIR,
            FsError::IsADirectory(_) => libc::EISDIR,
            FsError::NotEmpty(_) => libc::ENOTEMPTY,
            FsError::InvalidPath(_) => libc::EINVAL,
            FsError::NotSupported(_) => libc::ENOSYS,
            FsError::ReadOnly => libc::EROFS,
            FsError::PermissionDenied => libc::EACCES,
            FsError::InvalidArgument(_) => libc::EINVAL,
            FsError::NoAttribute(_) => no_attribute_errno(),
            FsError::Range => libc::ERANGE,
            FsError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            FsError::Backend(_) => libc::EIO,
            FsError::Errno(code) if *code > 0 => *code,
            FsError::Errno(_) => libc::EIO,
        }
    }

    /// Whether this failure is part of normal filesystem traffic
    /// (a lookup miss) rather than something worth an error log.
    pub fn is_expected(&self) -> bool {
        self.to_errno() == libc::ENOENT
    }
}

#[cfg(target_os = "linux")]
fn no_attribute_errno() -> i32 {
    libc::ENODATA
}

#[cfg(not(target_os = "linux"))]
fn no_attribute_errno() -> i32 {
    libc::ENOATTR
}

/// Result type alias for filesystem operations
pub type Result<T> = std::result::Result<T, FsError>;

/// Why a single unmount attempt did not succeed
#[derive(Error, Debug)]
pub enum UnmountCause {
    #[error("{program} exited with {}", describe_exit(.code))]
    ExitCode { program: &'static str, code: Option<i32> },

    #[error("failed to run {program}: {source}")]
    Spawn {
        program: &'static str,
        #[source]
        source: io::Error,
    },
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("code {}", code),
        None => "a signal".to_string(),
    }
}

/// Lifecycle failures surfaced by mount/umount
#[derive(Error, Debug)]
pub enum MountError {
    #[error("Filesystem already mounted at {0:?}")]
    AlreadyMounted(PathBuf),

    #[error("Unable to mount filesystem, return code = {0}")]
    MountFailed(i32),

    #[error("Unable to mount filesystem: native loop panicked")]
    LoopPanicked,

    #[error("Unable to mount filesystem: {0}")]
    Setup(#[source] io::Error),

    #[error("Unable to unmount filesystem on {0}")]
    UnsupportedPlatform(&'static str),

    #[error("Unable to unmount {path:?}: {cause}{}", previous_suffix(.previous))]
    UnmountFailed {
        path: PathBuf,
        #[source]
        cause: UnmountCause,
        previous: Option<UnmountCause>,
    },

    #[error("Unmount of {0:?} was interrupted")]
    Interrupted(PathBuf),
}

fn previous_suffix(previous: &Option<UnmountCause>) -> String {
    match previous {
        Some(cause) => format!(" (after {})", cause),
        None => String::new(),
    }
}
