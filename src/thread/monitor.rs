//! Monitor-related per-thread state: parking in `Object.wait`, interrupts,
//! and monitors entered through the native interface.

use std::time::{Duration, Instant};

use crate::object::ObjectRef;

use super::{Thread, ThreadState};

/// Guarded by the thread's wait mutex.
#[derive(Debug, Default)]
pub(crate) struct WaitState {
    pub(crate) interrupted: bool,
    /// Monitor the thread is parked on, if any.
    pub(crate) monitor: Option<ObjectRef>,
    notified: bool,
}

/// How a [`Thread::monitor_wait`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Notified,
    TimedOut,
    Interrupted,
}

impl Thread {
    /// Parks the calling thread on `monitor` until it is notified,
    /// interrupted, or `timeout` elapses.
    ///
    /// The caller must be runnable and must already have released the
    /// monitor. The thread is suspendable while parked and runnable again on
    /// return. A pending interrupt is consumed without parking.
    pub fn monitor_wait(&self, monitor: ObjectRef, timeout: Option<Duration>) -> WaitOutcome {
        if !self.is_current() {
            fatal!("{self} asked to wait by another thread");
        }
        {
            let mut wait = self.wait.lock();
            if wait.interrupted {
                wait.interrupted = false;
                return WaitOutcome::Interrupted;
            }
            wait.monitor = Some(monitor);
            wait.notified = false;
        }

        let parked_state = if timeout.is_some() {
            ThreadState::TimedWaiting
        } else {
            ThreadState::Waiting
        };
        self.transition_to_suspended(parked_state);

        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let outcome = {
            let mut wait = self.wait.lock();
            let outcome = loop {
                if wait.notified {
                    break WaitOutcome::Notified;
                }
                if wait.interrupted {
                    wait.interrupted = false;
                    break WaitOutcome::Interrupted;
                }
                match deadline {
                    None => wait.wait(&self.wait_cond),
                    Some(deadline) => {
                        let remaining = deadline.saturating_duration_since(Instant::now());
                        if remaining.is_zero() {
                            break WaitOutcome::TimedOut;
                        }
                        wait.wait_for(&self.wait_cond, remaining);
                    }
                }
            };
            wait.monitor = None;
            wait.notified = false;
            outcome
        };

        self.transition_to_runnable();
        tracing::trace!(target: "threads", thread = %self, %monitor, ?outcome, "monitor wait ended");
        outcome
    }

    /// Wakes this thread if it is parked in [`monitor_wait`](Self::monitor_wait).
    /// Returns whether it was waiting.
    pub fn notify(&self) -> bool {
        let mut wait = self.wait.lock();
        if wait.monitor.is_none() {
            return false;
        }
        wait.notified = true;
        self.wait_cond.notify_one();
        true
    }

    /// Sets the interrupt flag and wakes a parked wait.
    pub fn interrupt(&self) {
        let mut wait = self.wait.lock();
        if wait.interrupted {
            return;
        }
        wait.interrupted = true;
        if wait.monitor.is_some() {
            self.wait_cond.notify_one();
        }
    }

    /// Returns the interrupt flag and clears it.
    pub fn interrupted(&self) -> bool {
        let mut wait = self.wait.lock();
        std::mem::take(&mut wait.interrupted)
    }

    /// Reads the interrupt flag without clearing it.
    pub fn is_interrupted(&self) -> bool {
        self.wait.lock().interrupted
    }

    /// Monitor the thread is parked on.
    pub fn wait_monitor(&self) -> Option<ObjectRef> {
        self.wait.lock().monitor
    }

    /// Whether this thread owns `object`'s monitor.
    pub fn holds_lock(&self, object: Option<ObjectRef>) -> bool {
        let Some(object) = object else {
            return false;
        };
        self.runtime().objects().monitor_owner(object) == Some(self.thin_lock_id())
    }

    /// Records the monitor this thread is blocked trying to enter. Cleared
    /// with `None` once it is acquired.
    pub fn set_monitor_enter_object(&self, object: Option<ObjectRef>) {
        self.monitor_enter_object.store(object);
    }

    pub fn monitor_enter_object(&self) -> Option<ObjectRef> {
        self.monitor_enter_object.load()
    }

    /// Enters `object`'s monitor on behalf of native code. Monitors still held
    /// this way are released when the thread detaches.
    pub fn jni_monitor_enter(&self, object: ObjectRef) {
        self.runtime().objects().monitor_enter(self, object);
        self.jni_monitors.lock().push(object);
    }

    /// Exits a monitor entered with [`jni_monitor_enter`](Self::jni_monitor_enter).
    /// Returns false if this thread never entered it that way.
    pub fn jni_monitor_exit(&self, object: ObjectRef) -> bool {
        {
            let mut monitors = self.jni_monitors.lock();
            let Some(position) = monitors.iter().rposition(|held| *held == object) else {
                return false;
            };
            monitors.remove(position);
        }
        self.runtime().objects().monitor_exit(self, object);
        true
    }

    pub fn jni_monitor_count(&self) -> usize {
        self.jni_monitors.lock().len()
    }
}
