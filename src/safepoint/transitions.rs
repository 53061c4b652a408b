//! Thread state transitions and suspend-count bookkeeping.

use std::sync::atomic::Ordering;

use crate::locks::{self, LockLevel, SuspendCountGuard};
use crate::runtime::Runtime;
use crate::thread::{THREAD_NAME_DURING_STARTUP, Thread, ThreadState};
use crate::thread_list::{ThreadList, ThreadListInner};

fn abort_dump(runtime: &Runtime, list: Option<&ThreadListInner>) -> String {
    match list {
        Some(inner) => ThreadList::dump_for_abort_locked(inner),
        None => runtime.thread_list().dump_for_abort(),
    }
}

impl Thread {
    /// Stores a new state without the suspend-count lock. Only the owning
    /// thread may do this, and only where no suspender can be racing it.
    pub fn set_state_unsafe(&self, new_state: ThreadState) -> ThreadState {
        if new_state == ThreadState::Runnable {
            self.has_been_runnable.store(true, Ordering::Release);
        }
        ThreadState::from_u8(self.state.swap(new_state as u8, Ordering::AcqRel))
    }

    /// Stores a new state under the suspend-count lock and returns the old one.
    pub fn set_state(&self, guard: &SuspendCountGuard<'_>, new_state: ThreadState) -> ThreadState {
        self.check_suspend_guard(guard);
        self.set_state_unsafe(new_state)
    }

    pub fn suspend_count(&self) -> i32 {
        self.suspend_count.load(Ordering::Acquire)
    }

    pub fn debug_suspend_count(&self) -> i32 {
        self.debug_suspend_count.load(Ordering::Acquire)
    }

    /// Never runnable and still bound to the startup placeholder name, i.e.
    /// not fully attached.
    pub fn is_still_starting(&self) -> bool {
        !self.has_been_runnable.load(Ordering::Acquire) && self.name().as_str() == THREAD_NAME_DURING_STARTUP
    }

    /// Whether the thread is stopped as far as the collector is concerned.
    pub fn is_suspended(&self) -> bool {
        let runtime = self.runtime();
        let guard = runtime.locks().thread_suspend_count.lock();
        self.is_suspended_locked(&guard)
    }

    pub fn is_suspended_locked(&self, guard: &SuspendCountGuard<'_>) -> bool {
        self.check_suspend_guard(guard);
        match self.state() {
            ThreadState::Runnable => false,
            ThreadState::Starting => true,
            _ => self.suspend_count.load(Ordering::Relaxed) > 0,
        }
    }

    fn check_suspend_guard(&self, guard: &SuspendCountGuard<'_>) {
        let runtime = self.runtime();
        if runtime.config().check_locks && !guard.belongs_to(&runtime.locks().thread_suspend_count) {
            fatal!("suspend state of {self} changed under a foreign lock");
        }
    }

    /// Adjusts the suspend count by `delta`, which must be `+1`, `-1` or
    /// `-debug_suspend_count` (clearing every debugger request at once).
    /// Debugger requests are mirrored in the debug count. Reaching zero wakes
    /// every thread waiting to become runnable.
    pub fn modify_suspend_count(&self, guard: &SuspendCountGuard<'_>, delta: i32, for_debugger: bool) {
        self.apply_suspend_delta(None, guard, delta, for_debugger);
    }

    /// [`modify_suspend_count`](Self::modify_suspend_count) for callers that
    /// hold the registry lock, so a fatal underflow can still dump it.
    pub(crate) fn modify_suspend_count_listed(
        &self,
        list: &ThreadListInner,
        guard: &SuspendCountGuard<'_>,
        delta: i32,
        for_debugger: bool,
    ) {
        self.apply_suspend_delta(Some(list), guard, delta, for_debugger);
    }

    fn apply_suspend_delta(
        &self,
        list: Option<&ThreadListInner>,
        guard: &SuspendCountGuard<'_>,
        delta: i32,
        for_debugger: bool,
    ) {
        self.check_suspend_guard(guard);
        let runtime = self.runtime();
        let count = self.suspend_count.load(Ordering::Relaxed);
        let debug_count = self.debug_suspend_count.load(Ordering::Relaxed);

        if runtime.config().check_locks {
            if delta != 1 && delta != -1 && delta != -debug_count {
                fatal!("bad suspend count delta {delta} for {self} (debug count {debug_count})");
            }
            if debug_count < 0 || count < debug_count {
                fatal!("corrupt suspend counts on {self}: count {count}, debug count {debug_count}");
            }
        }

        if delta < 0 && count + delta < 0 {
            // Expected when a thread attaches while the world is stopped.
            if self.is_still_starting() {
                tracing::debug!(target: "threads", thread = %self, delta, "ignoring suspend count underflow while starting");
                return;
            }
            let dump = abort_dump(&runtime, list);
            fatal!("{self} suspend count already zero when applying {delta}\n{dump}");
        }
        if for_debugger && debug_count + delta < 0 {
            let dump = abort_dump(&runtime, list);
            fatal!("{self} debug suspend count already zero when applying {delta}\n{dump}");
        }

        let new_count = count + delta;
        self.suspend_count.store(new_count, Ordering::Release);
        if for_debugger {
            self.debug_suspend_count
                .store(debug_count + delta, Ordering::Release);
        }
        if new_count == 0 {
            runtime.locks().resume_cond.notify_all();
        }
    }

    /// Leaves managed code: releases the shared mutator hold and moves to
    /// `new_state`, after which a suspender may treat this thread as stopped.
    pub fn transition_to_suspended(&self, new_state: ThreadState) {
        let runtime = self.runtime();
        if runtime.config().check_locks && !self.is_current() {
            fatal!("{self} transitioned by a foreign thread");
        }
        if new_state == ThreadState::Runnable {
            fatal!("{self} cannot suspend into Runnable");
        }
        self.assert_thread_suspension_is_allowable(true);

        let old_state = self.set_state_unsafe(new_state);
        if old_state != ThreadState::Runnable {
            fatal!("{self} suspended from {old_state} instead of Runnable");
        }
        runtime.locks().mutator.shared_unlock();
    }

    /// Enters managed code, waiting first for every outstanding suspend
    /// request to be withdrawn. Returns the state left behind.
    pub fn transition_to_runnable(&self) -> ThreadState {
        let runtime = self.runtime();
        let locks = runtime.locks();
        if runtime.config().check_locks && !self.is_current() {
            fatal!("{self} transitioned by a foreign thread");
        }
        let old_state = self.state();
        if old_state == ThreadState::Runnable {
            fatal!("{self} is already runnable");
        }

        loop {
            if self.suspend_count.load(Ordering::Acquire) > 0 {
                let mut guard = locks.thread_suspend_count.lock();
                if locks.mutator.is_held() {
                    fatal!("{self} waits for resumption while holding the mutator lock");
                }
                while self.suspend_count.load(Ordering::Acquire) != 0 {
                    guard.wait(&locks.resume_cond);
                }
            }

            locks.mutator.shared_lock();
            {
                let guard = locks.thread_suspend_count.lock();
                if self.suspend_count.load(Ordering::Acquire) == 0 {
                    self.set_state(&guard, ThreadState::Runnable);
                    break;
                }
            }
            // Suspended again between the wait and the shared hold.
            locks.mutator.shared_unlock();
        }
        old_state
    }

    /// Parks at a safepoint if a suspension is pending.
    pub fn full_suspend_check(&self) {
        tracing::trace!(target: "threads", thread = %self, "self-suspending");
        self.transition_to_suspended(ThreadState::Suspended);
        self.transition_to_runnable();
        tracing::trace!(target: "threads", thread = %self, "self-reviving");
    }

    /// Checks that this thread may block for the collector: no
    /// no-suspension scope is open and, when `check_locks`, no ranked lock
    /// other than the mutator lock is held.
    pub fn assert_thread_suspension_is_allowable(&self, check_locks: bool) {
        let runtime = self.runtime();
        if !runtime.config().check_locks {
            return;
        }
        let depth = self.no_suspension.load(Ordering::Acquire);
        if depth > 0 {
            let cause = *self.no_suspension_cause.lock();
            fatal!("{self} may not suspend: {depth} no-suspension scope(s) open, last cause {cause:?}");
        }
        if check_locks {
            let held: Vec<LockLevel> = locks::held_levels()
                .into_iter()
                .filter(|level| *level != LockLevel::Mutator)
                .collect();
            if !held.is_empty() {
                for level in &held {
                    tracing::error!(target: "threads", thread = %self, ?level, "lock held at suspension point");
                }
                fatal!("{self} holds {held:?} at a suspension point");
            }
        }
    }

    /// Opens a region in which suspension is a fatal error. Returns the cause
    /// of the enclosing region, to be handed back to
    /// [`end_assert_no_thread_suspension`](Self::end_assert_no_thread_suspension).
    pub fn start_assert_no_thread_suspension(&self, cause: &'static str) -> Option<&'static str> {
        let previous = self.no_suspension_cause.lock().replace(cause);
        self.no_suspension.fetch_add(1, Ordering::AcqRel);
        previous
    }

    pub fn end_assert_no_thread_suspension(&self, previous: Option<&'static str>) {
        let depth = self.no_suspension.load(Ordering::Acquire);
        if depth == 0 {
            fatal!("{self} ended a no-suspension region that was never started");
        }
        self.no_suspension.store(depth - 1, Ordering::Release);
        *self.no_suspension_cause.lock() = previous;
    }

    pub fn no_thread_suspension_cause(&self) -> Option<&'static str> {
        *self.no_suspension_cause.lock()
    }
}

/// A no-suspension region bound to a scope.
pub struct NoSuspensionScope<'a> {
    thread: &'a Thread,
    previous: Option<&'static str>,
}

impl<'a> NoSuspensionScope<'a> {
    pub fn new(thread: &'a Thread, cause: &'static str) -> Self {
        let previous = thread.start_assert_no_thread_suspension(cause);
        Self { thread, previous }
    }
}

impl Drop for NoSuspensionScope<'_> {
    fn drop(&mut self) {
        self.thread.end_assert_no_thread_suspension(self.previous);
    }
}
