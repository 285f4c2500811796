//! Retry-on-EINTR wrapper for blocking calls.
//!
//! Blocking socket and process calls can be interrupted by a delivered
//! signal (a child exiting, a terminal resize, ...). That is not a fault, so
//! [`uninterruptible`] simply repeats the call.

use crate::error::TaskventError;
use std::io;

/// Errors that can report an interrupted system call.
pub trait Interruptible {
    /// Whether this error is `EINTR`.
    fn is_interrupted(&self) -> bool;
}

impl Interruptible for zmq::Error {
    fn is_interrupted(&self) -> bool {
        *self == zmq::Error::EINTR
    }
}

impl Interruptible for nix::errno::Errno {
    fn is_interrupted(&self) -> bool {
        *self == nix::errno::Errno::EINTR
    }
}

impl Interruptible for io::Error {
    fn is_interrupted(&self) -> bool {
        self.kind() == io::ErrorKind::Interrupted
    }
}

impl Interruptible for TaskventError {
    fn is_interrupted(&self) -> bool {
        match self {
            TaskventError::Zmq(e) => e.is_interrupted(),
            TaskventError::Io(e) => e.is_interrupted(),
            _ => false,
        }
    }
}

/// Run `f`, retrying for as long as it fails with an interrupted system call.
///
/// Any other error is returned unchanged on the first failure.
pub fn uninterruptible<T, E, F>(mut f: F) -> Result<T, E>
where
    E: Interruptible,
    F: FnMut() -> Result<T, E>,
{
    loop {
        match f() {
            Err(e) if e.is_interrupted() => continue,
            other => return other,
        }
    }
}
