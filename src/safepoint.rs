//! Cooperative suspension of managed threads.
//!
//! A thread is either *runnable*, holding the global mutator lock shared and
//! free to touch the heap, or in one of the suspended-class states, in which
//! case it has released that hold. Suspenders raise a thread's suspend count;
//! the thread notices at its next transition or safepoint check and parks
//! until the count drops back to zero.
//!
//! The protocol relies on two locks:
//!
//! - the mutator lock, taken exclusively by the collector to stop the world
//! - the suspend-count lock, under which counts and states change, paired
//!   with the resume condition variable
//!
//! # Examples
//!
//! ```
//! use std::sync::Arc;
//! use vmthread::test_utils::{attach_main, test_runtime};
//! use vmthread::{ScopedRunnable, ThreadState};
//!
//! let (runtime, _, _) = test_runtime();
//! let thread = attach_main(&runtime);
//! {
//!     let _runnable = ScopedRunnable::new(&thread);
//!     assert_eq!(thread.state(), ThreadState::Runnable);
//!     thread.full_suspend_check();
//! }
//! assert_eq!(thread.state(), ThreadState::Native);
//! runtime.detach_current_thread();
//! ```

mod suspend;
mod transitions;


pub use suspend::{SuspendAllGuard, SuspendReason};
pub use transitions::NoSuspensionScope;

use crate::thread::{Thread, ThreadState};

/// Keeps the thread runnable for a scope and restores its previous state on
/// exit. Nested use on an already runnable thread is a no-op.
pub struct ScopedRunnable<'a> {
    thread: &'a Thread,
    restore: Option<ThreadState>,
}

impl<'a> ScopedRunnable<'a> {
    pub fn new(thread: &'a Thread) -> Self {
        let restore = (thread.state() != ThreadState::Runnable).then(|| thread.transition_to_runnable());
        Self { thread, restore }
    }
}

impl Drop for ScopedRunnable<'_> {
    fn drop(&mut self) {
        let Some(state) = self.restore else {
            return;
        };
        if std::thread::panicking() {
            // Unwinding from a fatal error or a long jump: give the hold back
            // without the assertions, which could panic again.
            self.thread.set_state_unsafe(state);
            let runtime = self.thread.runtime();
            if runtime.locks().mutator.is_shared_held() {
                runtime.locks().mutator.shared_unlock();
            }
            return;
        }
        self.thread.transition_to_suspended(state);
    }
}
