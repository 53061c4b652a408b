//! Error types for the thread runtime.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::object::ObjectRef;
use crate::reference::{IndirectRef, IndirectRefKind};

/// Recoverable failures of thread operations.
///
/// Broken runtime invariants are not reported through this type; they abort
/// through the crate's fatal path instead.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use vmthread::error::{ThreadError, ThreadResult};
///
/// let timeout = ThreadError::SuspendTimeout(Duration::from_secs(30));
/// assert_eq!(timeout.to_string(), "thread suspension timed out after 30s");
///
/// let ok: ThreadResult<u32> = Ok(1);
/// assert!(ok.is_ok());
/// ```
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ThreadError {
    /// The target did not reach a suspended state within the debugger timeout.
    #[error("thread suspension timed out after {0:?}")]
    SuspendTimeout(Duration),
    /// No live thread is bound to the given managed peer.
    #[error("no live thread for the requested peer")]
    NoSuchThread,
    /// The OS refused to create a native thread.
    #[error("thread creation failed: {0}")]
    ThreadCreation(String),
    /// The runtime owning this thread has been dropped.
    #[error("runtime is no longer available")]
    RuntimeUnavailable,
    /// The managed peer could not be created; an exception is pending.
    #[error("managed peer creation failed")]
    PeerCreation,
    /// Managed code returned to its native caller with an exception pending.
    #[error("uncaught exception {0:?}")]
    UncaughtException(ObjectRef),
}

/// Result type for thread operations
pub type ThreadResult<T> = Result<T, ThreadError>;

/// Failure to decode an opaque reference handle.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceError {
    /// The handle was recognized but its slot no longer holds an object.
    #[error("use of deleted {kind} {handle}")]
    Deleted {
        kind: IndirectRefKind,
        handle: IndirectRef,
    },
    /// The handle is not known to any reference table or scope.
    #[error("use of invalid reference {0}")]
    Invalid(IndirectRef),
}

/// Failure reported by a code-generation backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    #[error("failed to compile {method}: {reason}")]
    Backend { method: String, reason: String },
    #[error("method {0} has no code to compile")]
    NoCode(String),
}

/// Logs `args` at error level and panics with the same message.
#[cold]
#[track_caller]
pub(crate) fn fatal_error(args: fmt::Arguments<'_>) -> ! {
    let message = args.to_string();
    tracing::error!(target: "threads", "{message}");
    panic!("{message}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_formats_readable_messages() {
        let handle = IndirectRef::from_raw(0x46);
        let cases = [
            (
                ThreadError::SuspendTimeout(Duration::from_millis(250)).to_string(),
                "thread suspension timed out after 250ms",
            ),
            (
                ThreadError::ThreadCreation("out of memory".into()).to_string(),
                "thread creation failed: out of memory",
            ),
            (
                ReferenceError::Deleted {
                    kind: IndirectRefKind::Global,
                    handle,
                }
                .to_string(),
                "use of deleted global reference 0x46",
            ),
            (
                ReferenceError::Invalid(IndirectRef::from_raw(0x1000)).to_string(),
                "use of invalid reference 0x1000",
            ),
            (
                CompileError::NoCode("Foo.bar".into()).to_string(),
                "method Foo.bar has no code to compile",
            ),
        ];

        for (actual, expected) in cases {
            assert_eq!(actual, expected);
        }
    }

    #[test]
    #[should_panic(expected = "invariant broken: 7")]
    fn fatal_panics_with_message() {
        fatal!("invariant broken: {}", 7);
    }
}
