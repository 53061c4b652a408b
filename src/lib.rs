//! Thread management core for a managed runtime.
//!
//! The crate binds native OS threads to managed thread objects and keeps them
//! cooperating with a stop-the-world collector:
//!
//! - [`thread`]: the per-thread entity, its lifecycle and diagnostics
//! - [`safepoint`]: suspend/resume accounting and state transitions
//! - [`stack`]: managed frames, machine contexts and the stack walker
//! - [`exception`]: handler search and non-local delivery
//! - [`reference`]: opaque reference handles and their tables
//!
//! Everything hangs off a [`Runtime`], which owns the global locks, the thread
//! registry and the global reference tables. The object model and compiled
//! code metadata are supplied by the embedder through [`ObjectModel`] and
//! [`CodeIntrospection`].
//!
//! # Examples
//!
//! ```
//! use std::sync::Arc;
//! use vmthread::test_utils::{MockCode, MockObjectModel};
//! use vmthread::{Runtime, RuntimeConfig, Thread, ThreadState};
//!
//! let objects = Arc::new(MockObjectModel::new());
//! let code = Arc::new(MockCode::new());
//! let runtime = Runtime::new(RuntimeConfig::default(), objects, code);
//!
//! let thread = Thread::attach(&runtime, Some("main"), false, None).unwrap();
//! assert_eq!(thread.state(), ThreadState::Native);
//!
//! let old = thread.transition_to_runnable();
//! assert_eq!(old, ThreadState::Native);
//! thread.transition_to_suspended(ThreadState::Native);
//!
//! runtime.detach_current_thread();
//! ```

/// Logs the message at error level and aborts the current operation by
/// panicking. Used for broken runtime invariants, never for recoverable
/// conditions.
macro_rules! fatal {
    ($($arg:tt)*) => {
        $crate::error::fatal_error(format_args!($($arg)*))
    };
}

pub mod compiler;
pub mod config;
pub mod error;
pub mod exception;
pub mod locks;
pub mod object;
pub mod reference;
pub mod roots;
pub mod runtime;
pub mod safepoint;
pub mod stack;
pub mod test_utils;
pub mod thread;
pub mod thread_list;
pub mod trace;
pub mod well_known;

pub use config::RuntimeConfig;
pub use error::{CompileError, ReferenceError, ThreadError, ThreadResult};
pub use exception::{CatchSearch, LongJump, catch_long_jump};
pub use object::{ClassRef, ObjectModel, ObjectRef, Value};
pub use reference::{IndirectRef, IndirectRefKind};
pub use runtime::{Runtime, RuntimeEvent};
pub use safepoint::{ScopedRunnable, SuspendAllGuard, SuspendReason};
pub use stack::{CodeIntrospection, FrameId, Method, StackVisitor, StackWalker, WalkControl};
pub use thread::{Thread, ThreadIndex, ThreadState};
pub use thread_list::ThreadList;
