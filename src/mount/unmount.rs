//! Forced unmount strategies per operating system

use std::ffi::OsStr;
use std::io;
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{MountError, UnmountCause};

/// Forces a kernel-level unmount of a mount point
pub trait Unmounter: Send + Sync {
    fn unmount(&self, path: &Path) -> Result<(), MountError>;
}

/// Runs an external program and reports its exit code
///
/// `Ok(None)` means the process was terminated by a signal.
pub trait CommandRunner: Send + Sync {
    fn run(&self, program: &'static str, args: &[&OsStr]) -> io::Result<Option<i32>>;
}

impl<R: CommandRunner + ?Sized> CommandRunner for Arc<R> {
    fn run(&self, program: &'static str, args: &[&OsStr]) -> io::Result<Option<i32>> {
        (**self).run(program, args)
    }
}

/// Runs commands as child processes
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemCommand;

impl CommandRunner for SystemCommand {
    fn run(&self, program: &'static str, args: &[&OsStr]) -> io::Result<Option<i32>> {
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()?;
        if !output.status.success() {
            debug!(
                "{} {:?} failed: {}",
                program,
                args,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(output.status.code())
    }
}

/// Outcome of one unmount command
enum Attempt {
    Interrupted,
    Failed(UnmountCause),
}

fn attempt<R: CommandRunner>(
    runner: &R,
    program: &'static str,
    args: &[&OsStr],
) -> Result<(), Attempt> {
    match runner.run(program, args) {
        Ok(Some(0)) => Ok(()),
        Ok(code) => Err(Attempt::Failed(UnmountCause::ExitCode { program, code })),
        Err(e) if e.kind() == io::ErrorKind::Interrupted => Err(Attempt::Interrupted),
        Err(source) => Err(Attempt::Failed(UnmountCause::Spawn { program, source })),
    }
}

/// No force-unmount procedure exists for this OS
#[derive(Debug, Clone, Copy)]
pub struct UnsupportedUnmounter {
    os: &'static str,
}

impl UnsupportedUnmounter {
    pub fn new(os: &'static str) -> Self {
        Self { os }
    }
}

impl Unmounter for UnsupportedUnmounter {
    fn unmount(&self, _path: &Path) -> Result<(), MountError> {
        Err(MountError::UnsupportedPlatform(self.os))
    }
}

/// `umount -f <path>`
#[derive(Debug, Clone, Default)]
pub struct MacosUnmounter<R = SystemCommand> {
    runner: R,
}

impl MacosUnmounter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<R: CommandRunner> MacosUnmounter<R> {
    pub fn with_runner(runner: R) -> Self {
        Self { runner }
    }
}

impl<R: CommandRunner> Unmounter for MacosUnmounter<R> {
    fn unmount(&self, path: &Path) -> Result<(), MountError> {
        match attempt(&self.runner, "umount", &["-f".as_ref(), path.as_os_str()]) {
            Ok(()) => Ok(()),
            Err(Attempt::Interrupted) => Err(MountError::Interrupted(path.to_path_buf())),
            Err(Attempt::Failed(cause)) => Err(MountError::UnmountFailed {
                path: path.to_path_buf(),
                cause,
                previous: None,
            }),
        }
    }
}

/// `fusermount -u -z <path>`, falling back to `umount <path>`
#[derive(Debug, Clone, Default)]
pub struct LinuxUnmounter<R = SystemCommand> {
    runner: R,
}

impl LinuxUnmounter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<R: CommandRunner> LinuxUnmounter<R> {
    pub fn with_runner(runner: R) -> Self {
        Self { runner }
    }
}

impl<R: CommandRunner> Unmounter for LinuxUnmounter<R> {
    fn unmount(&self, path: &Path) -> Result<(), MountError> {
        let first = match attempt(
            &self.runner,
            "fusermount",
            &["-u".as_ref(), "-z".as_ref(), path.as_os_str()],
        ) {
            Ok(()) => return Ok(()),
            Err(first) => first,
        };

        match &first {
            Attempt::Interrupted => warn!("fusermount interrupted for {:?}, trying umount", path),
            Attempt::Failed(cause) => warn!("{} for {:?}, trying umount", cause, path),
        }

        let second = attempt(&self.runner, "umount", &[path.as_os_str()]);
        match (first, second) {
            (Attempt::Interrupted, _) | (_, Err(Attempt::Interrupted)) => {
                Err(MountError::Interrupted(path.to_path_buf()))
            }
            (_, Ok(())) => Ok(()),
            (Attempt::Failed(previous), Err(Attempt::Failed(cause))) => {
                Err(MountError::UnmountFailed {
                    path: path.to_path_buf(),
                    cause,
                    previous: Some(previous),
                })
            }
        }
    }
}

/// Unmount strategy for the OS this process runs on
pub fn platform_unmounter() -> Box<dyn Unmounter> {
    if cfg!(windows) {
        Box::new(UnsupportedUnmounter::new("windows"))
    } else if cfg!(target_os = "macos") {
        Box::new(MacosUnmounter::new())
    } else {
        Box::new(LinuxUnmounter::new())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Replays scripted results and records every invocation
    #[derive(Default)]
    pub struct ScriptedRunner {
        results: Mutex<VecDeque<io::Result<Option<i32>>>>,
        calls: Mutex<Vec<Vec<String>>>,
    }

    impl ScriptedRunner {
        pub fn new(results: Vec<io::Result<Option<i32>>>) -> Arc<Self> {
            Arc::new(Self {
                results: Mutex::new(results.into()),
                calls: Mutex::new(Vec::new()),
            })
        }

        pub fn calls(&self) -> Vec<Vec<String>> {
            self.calls.lock().clone()
        }
    }

    impl CommandRunner for ScriptedRunner {
        fn run(&self, program: &'static str, args: &[&OsStr]) -> io::Result<Option<i32>> {
            let mut call = vec![program.to_string()];
            call.extend(args.iter().map(|a| a.to_string_lossy().into_owned()));
            self.calls.lock().push(call);
            self.results.lock().pop_front().unwrap_or(Ok(Some(0)))
        }
    }
}
