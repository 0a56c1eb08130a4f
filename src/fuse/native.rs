//! Native FUSE event loop entry point
//!
//! The loop is handed a libfuse-style argument vector
//! (`<name> -f [-d] <mountpoint> -o<opt>...`) and the dispatcher, and
//! serves requests until the filesystem is unmounted.

use std::path::PathBuf;
use std::sync::Arc;

use fuser::MountOption;
use tracing::{error, info};

use crate::fuse::bridge::FuserBridge;
use crate::fuse::CallbackDispatcher;

/// Exit code for an argument vector the loop cannot interpret
pub const EXIT_BAD_ARGS: i32 = 2;

/// Blocking native event loop
///
/// `run` returns only once the loop stops serving; `0` means a clean
/// unmount, anything else is a failure code.
pub trait NativeLoop: Send + Sync + 'static {
    fn run(&self, args: &[String], dispatcher: Arc<CallbackDispatcher>) -> i32;
}

/// Serves the dispatcher through a fuser session
#[derive(Debug, Clone, Default)]
pub struct FuserLoop;

impl NativeLoop for FuserLoop {
    fn run(&self, args: &[String], dispatcher: Arc<CallbackDispatcher>) -> i32 {
        let parsed = match LoopArgs::parse(args) {
            Ok(parsed) => parsed,
            Err(e) => {
                error!("Invalid FUSE arguments {:?}: {}", args, e);
                return EXIT_BAD_ARGS;
            }
        };

        info!(
            "Starting FUSE session at {:?} with options {:?}",
            parsed.mount_point, parsed.options
        );
        let bridge = FuserBridge::new(dispatcher, parsed.debug);
        match fuser::mount2(bridge, &parsed.mount_point, &parsed.options) {
            Ok(()) => {
                info!("FUSE session at {:?} ended", parsed.mount_point);
                0
            }
            Err(e) => {
                error!("FUSE session at {:?} failed: {}", parsed.mount_point, e);
                e.raw_os_error().unwrap_or(1)
            }
        }
    }
}

/// Argument vector decoded into fuser terms
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopArgs {
    pub mount_point: PathBuf,
    pub options: Vec<MountOption>,
    pub debug: bool,
}

impl LoopArgs {
    pub fn parse(args: &[String]) -> Result<Self, String> {
        let (program, rest) = args
            .split_first()
            .ok_or_else(|| "empty argument vector".to_string())?;

        let mut mount_point = None;
        let mut options = Vec::new();
        let mut debug = false;

        let mut iter = rest.iter();
        while let Some(arg) = iter.next() {
            match arg.as_str() {
                // Sessions always run in the foreground of their thread
                "-f" => {}
                "-d" => debug = true,
                "-o" => {
                    let value = iter
                        .next()
                        .ok_or_else(|| "-o requires a value".to_string())?;
                    push_options(&mut options, value);
                }
                opt if opt.starts_with("-o") => push_options(&mut options, &opt[2..]),
                flag if flag.starts_with('-') => {
                    return Err(format!("unsupported flag {}", flag));
                }
                path => {
                    if mount_point.replace(PathBuf::from(path)).is_some() {
                        return Err(format!("unexpected extra argument {}", path));
                    }
                }
            }
        }

        if !options.iter().any(|o| matches!(o, MountOption::FSName(_))) {
            options.push(MountOption::FSName(program.clone()));
        }

        Ok(Self {
            mount_point: mount_point.ok_or_else(|| "missing mount point".to_string())?,
            options,
            debug,
        })
    }
}

/// `-o a,b` and `-oa -ob` are equivalent
fn push_options(options: &mut Vec<MountOption>, value: &str) {
    options.extend(
        value
            .split(',')
            .filter(|s| !s.is_empty())
            .map(parse_mount_option),
    );
}

/// Map a `mount.fuse` option name to fuser's representation
pub fn parse_mount_option(s: &str) -> MountOption {
    match s {
        "auto_unmount" => MountOption::AutoUnmount,
        "allow_other" => MountOption::AllowOther,
        "allow_root" => MountOption::AllowRoot,
        "default_permissions" => MountOption::DefaultPermissions,
        "dev" => MountOption::Dev,
        "nodev" => MountOption::NoDev,
        "suid" => MountOption::Suid,
        "nosuid" => MountOption::NoSuid,
        "ro" => MountOption::RO,
        "rw" => MountOption::RW,
        "exec" => MountOption::Exec,
        "noexec" => MountOption::NoExec,
        "atime" => MountOption::Atime,
        "noatime" => MountOption::NoAtime,
        "dirsync" => MountOption::DirSync,
        "sync" => MountOption::Sync,
        "async" => MountOption::Async,
        x if x.starts_with("fsname=") => MountOption::FSName(x[7..].into()),
        x if x.starts_with("subtype=") => MountOption::Subtype(x[8..].into()),
        x => MountOption::CUSTOM(x.into()),
    }
}
