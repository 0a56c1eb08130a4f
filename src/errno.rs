//! Translation of operation outcomes into the FUSE return-code convention
//!
//! Every dispatch entry point ends here: `0` or a positive count means
//! success, anything negative is `-errno`.

use crate::error::FsError;

/// Success values an operation may produce
pub trait ReturnValue {
    fn into_code(self) -> i32;
}

impl ReturnValue for () {
    fn into_code(self) -> i32 {
        0
    }
}

/// Byte counts saturate at `i32::MAX`; the kernel never asks for more.
impl ReturnValue for usize {
    fn into_code(self) -> i32 {
        i32::try_from(self).unwrap_or(i32::MAX)
    }
}

/// What happened while serving one request
pub enum Outcome<'a, T> {
    /// The operation returned a value
    Success(T),
    /// The operation reported a failure
    Failure(&'a FsError),
    /// The operation panicked
    Panicked,
}

/// Map an outcome to the signed return code handed back to the native loop
pub fn return_code<T: ReturnValue>(outcome: Outcome<'_, T>) -> i32 {
    match outcome {
        Outcome::Success(value) => value.into_code(),
        Outcome::Failure(err) => -err.to_errno(),
        Outcome::Panicked => -libc::EIO,
    }
}

/// Recover a positive errno from a return code, if it signals failure
pub fn errno_of(code: i32) -> Option<i32> {
    if code < 0 {
        Some(-code)
    } else {
        None
    }
}
