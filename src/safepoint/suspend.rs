//! Suspending other threads: single-thread requests with polling and the
//! collector's stop-the-world pause.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::error::{ThreadError, ThreadResult};
use crate::locks;
use crate::object::ObjectRef;
use crate::runtime::Runtime;
use crate::thread::Thread;
use crate::thread_list::ThreadListInner;

/// Who is asking for a suspension. Only debugger requests can time out; the
/// collector waits for as long as it takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuspendReason {
    Debugger,
    Gc,
}

impl SuspendReason {
    fn for_debugger(self) -> bool {
        self == SuspendReason::Debugger
    }
}

/// Pacing for suspension polls: a yield first, then sleeps starting at 1ms
/// that double while the doubled delay stays below the configured maximum.
#[derive(Debug)]
pub(crate) struct SuspendBackoff {
    delay: Duration,
    total: Duration,
    max: Duration,
}

impl SuspendBackoff {
    /// Doubled before the first sleep.
    const INITIAL: Duration = Duration::from_micros(500);

    pub(crate) fn new(max: Duration) -> Self {
        Self {
            delay: Duration::ZERO,
            total: Duration::ZERO,
            max,
        }
    }

    /// Time spent sleeping so far. Yields are not counted.
    pub(crate) fn total(&self) -> Duration {
        self.total
    }

    /// Advances the schedule. `None` means yield instead of sleeping.
    pub(crate) fn next_pause(&mut self) -> Option<Duration> {
        let doubled = self.delay * 2;
        if doubled < self.max {
            self.delay = doubled;
        }
        if self.delay.is_zero() {
            self.delay = Self::INITIAL;
            None
        } else {
            self.total += self.delay;
            Some(self.delay)
        }
    }

    fn pause(&mut self) {
        match self.next_pause() {
            Some(delay) => thread::sleep(delay),
            None => thread::yield_now(),
        }
    }
}

impl Runtime {
    /// Suspends the thread bound to `peer` and waits until it is stopped.
    ///
    /// With `request_suspension` false the caller has already raised the
    /// count and only waits. A debugger request that does not complete within
    /// [`debugger_suspend_timeout`](crate::RuntimeConfig::debugger_suspend_timeout)
    /// withdraws its request and fails with [`ThreadError::SuspendTimeout`].
    /// The calling thread must not hold any ranked lock, including the
    /// mutator lock, since it sleeps between polls.
    pub fn suspend_thread_by_peer(
        &self,
        peer: ObjectRef,
        reason: SuspendReason,
        request_suspension: bool,
    ) -> ThreadResult<Arc<Thread>> {
        self.suspend_polling(reason, request_suspension, |list| {
            list.find_by_peer(self.objects(), peer)
        })
    }

    /// Like [`suspend_thread_by_peer`](Self::suspend_thread_by_peer) for a
    /// known entity. Fails if the thread is no longer registered.
    pub fn suspend_thread(
        &self,
        thread: &Arc<Thread>,
        reason: SuspendReason,
        request_suspension: bool,
    ) -> ThreadResult<Arc<Thread>> {
        self.suspend_polling(reason, request_suspension, |list| {
            list.contains(thread).then(|| Arc::clone(thread))
        })
    }

    fn suspend_polling(
        &self,
        reason: SuspendReason,
        request_suspension: bool,
        mut resolve: impl FnMut(&ThreadListInner) -> Option<Arc<Thread>>,
    ) -> ThreadResult<Arc<Thread>> {
        let timeout = match reason {
            SuspendReason::Debugger => Some(self.config().debugger_suspend_timeout),
            SuspendReason::Gc => None,
        };
        let mut backoff = SuspendBackoff::new(self.config().max_suspend_backoff);
        let mut requested = false;

        loop {
            {
                let list = self.thread_list().lock();
                let Some(thread) = resolve(&list) else {
                    tracing::warn!(target: "threads", ?reason, "no such thread for suspend");
                    return Err(ThreadError::NoSuchThread);
                };
                let guard = self.locks().thread_suspend_count.lock();
                if request_suspension && !requested {
                    thread.modify_suspend_count_listed(&list, &guard, 1, reason.for_debugger());
                    requested = true;
                }
                if thread.is_current() {
                    fatal!("{thread} asked to suspend itself through {reason:?} suspension");
                }
                if thread.is_suspended_locked(&guard) {
                    tracing::debug!(target: "threads", thread = %thread, ?reason, waited = ?backoff.total(), "suspended");
                    return Ok(thread);
                }
                if let Some(timeout) = timeout {
                    if backoff.total() > timeout {
                        if requested {
                            thread.modify_suspend_count_listed(&list, &guard, -1, reason.for_debugger());
                        }
                        tracing::warn!(target: "threads", thread = %thread, ?timeout, "suspend thread by peer timed out");
                        return Err(ThreadError::SuspendTimeout(timeout));
                    }
                }
            }

            let held = locks::held_levels();
            if !held.is_empty() {
                fatal!("holding {held:?} while sleeping for thread suspension");
            }
            backoff.pause();
        }
    }

    /// Withdraws one suspend request of `reason` from `thread`.
    pub fn resume_thread(&self, thread: &Thread, reason: SuspendReason) {
        let guard = self.locks().thread_suspend_count.lock();
        thread.modify_suspend_count(&guard, -1, reason.for_debugger());
        tracing::debug!(target: "threads", thread = %thread, ?reason, "resumed");
    }

    /// Drops every outstanding debugger request, e.g. when the debugger
    /// detaches.
    pub fn undo_debugger_suspensions(&self) {
        let list = self.thread_list().lock();
        let guard = self.locks().thread_suspend_count.lock();
        for thread in list.iter() {
            let debug_count = thread.debug_suspend_count();
            if debug_count > 0 {
                thread.modify_suspend_count_listed(&list, &guard, -debug_count, true);
            }
        }
    }

    /// Stops every other thread at a safepoint. The world restarts when the
    /// returned guard is dropped.
    ///
    /// The caller must not be runnable: it takes the mutator lock exclusively,
    /// which waits for every runnable thread to pass a safepoint.
    pub fn suspend_all(&self) -> SuspendAllGuard<'_> {
        if self.locks().mutator.is_held() {
            fatal!("suspend_all called while holding the mutator lock");
        }
        let current = Thread::current();
        let threads: Vec<Arc<Thread>> = {
            let list = self.thread_list().lock();
            let guard = self.locks().thread_suspend_count.lock();
            list.iter()
                .filter(|thread| !current.as_ref().is_some_and(|me| Arc::ptr_eq(me, thread)))
                .map(|thread| {
                    thread.modify_suspend_count_listed(&list, &guard, 1, false);
                    Arc::clone(thread)
                })
                .collect()
        };

        self.locks().mutator.exclusive_lock();
        tracing::debug!(target: "threads", count = threads.len(), "all threads suspended");
        SuspendAllGuard {
            runtime: self,
            threads,
        }
    }
}

/// Proof that the world is stopped. Resumes every thread it suspended on drop.
pub struct SuspendAllGuard<'a> {
    runtime: &'a Runtime,
    threads: Vec<Arc<Thread>>,
}

impl SuspendAllGuard<'_> {
    pub fn threads(&self) -> &[Arc<Thread>] {
        &self.threads
    }

    /// Visits every root of the stopped world: runtime-wide roots and the
    /// roots of every registered thread.
    pub fn visit_roots(&self, visitor: &mut dyn FnMut(ObjectRef)) {
        self.runtime.visit_roots(visitor);
        for thread in self.runtime.thread_list().snapshot() {
            thread.visit_roots(visitor);
        }
    }
}

impl Drop for SuspendAllGuard<'_> {
    fn drop(&mut self) {
        self.runtime.locks().mutator.exclusive_unlock();
        let guard = self.runtime.locks().thread_suspend_count.lock();
        for thread in &self.threads {
            thread.modify_suspend_count(&guard, -1, false);
        }
        tracing::debug!(target: "threads", count = self.threads.len(), "all threads resumed");
    }
}
