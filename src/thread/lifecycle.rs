//! Creation, attachment, naming and destruction of thread entities.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread::JoinHandle;

use crate::config::{KB, MB, RuntimeConfig};
use crate::error::{ThreadError, ThreadResult};
use crate::object::{ObjectRef, Value};
use crate::reference::{IndirectRef, Lookup};
use crate::runtime::{Runtime, RuntimeEvent};
use crate::safepoint::ScopedRunnable;
use crate::well_known;

use super::dump::pretty_size;
use super::{MAIN_THREAD_ID, Thread, ThreadState};

/// Managed priorities 1 through 10 and the nice values they map to.
const NICE_VALUES: [i32; 10] = [19, 16, 13, 10, 0, -2, -4, -5, -6, -8];
pub const MIN_PRIORITY: i32 = 1;
pub const NORM_PRIORITY: i32 = 5;
pub const MAX_PRIORITY: i32 = 10;

/// Turns a requested managed stack size into the size to ask the OS for.
///
/// Zero selects the configured default. The result leaves room for native
/// frames and the overflow reserve and is rounded up to whole pages. `None`
/// if the arithmetic overflows.
pub fn fix_stack_size(config: &RuntimeConfig, requested: usize) -> Option<usize> {
    let mut size = if requested == 0 {
        config.default_stack_size
    } else {
        requested
    };
    // Native code called from managed code shares the stack.
    size = size.checked_add(MB)?;
    size = size.max(min_stack_size());
    size = size.checked_add(config.stack_overflow_reserved_bytes)?;
    let page = page_size();
    size.checked_next_multiple_of(page)
}

fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    usize::try_from(page).ok().filter(|page| *page > 0).unwrap_or(4 * KB)
}

#[cfg(target_os = "linux")]
fn min_stack_size() -> usize {
    libc::PTHREAD_STACK_MIN
}

#[cfg(not(target_os = "linux"))]
fn min_stack_size() -> usize {
    16 * KB
}

#[cfg(target_os = "linux")]
fn current_tid() -> i64 {
    // SAFETY: gettid has no preconditions and cannot fail.
    unsafe { libc::syscall(libc::SYS_gettid) as i64 }
}

#[cfg(not(target_os = "linux"))]
fn current_tid() -> i64 {
    // SAFETY: getpid has no preconditions and cannot fail.
    i64::from(unsafe { libc::getpid() })
}

fn current_pthread() -> usize {
    // SAFETY: pthread_self has no preconditions.
    unsafe { libc::pthread_self() as usize }
}

/// Lowest address and size of the calling thread's stack.
#[cfg(target_os = "linux")]
fn native_stack_bounds() -> Option<(usize, usize)> {
    // SAFETY: the attribute object is initialized by pthread_getattr_np and
    // destroyed before returning; the out-pointers are valid locals.
    unsafe {
        let mut attr: libc::pthread_attr_t = std::mem::zeroed();
        if libc::pthread_getattr_np(libc::pthread_self(), &mut attr) != 0 {
            return None;
        }
        let mut addr: *mut libc::c_void = std::ptr::null_mut();
        let mut size: libc::size_t = 0;
        let rc = libc::pthread_attr_getstack(&attr, &mut addr, &mut size);
        libc::pthread_attr_destroy(&mut attr);
        (rc == 0).then_some((addr as usize, size))
    }
}

#[cfg(not(target_os = "linux"))]
fn native_stack_bounds() -> Option<(usize, usize)> {
    None
}

#[cfg(target_os = "linux")]
fn set_native_thread_name(name: &str) {
    // The kernel keeps 15 bytes plus the terminator.
    const MAX_NATIVE_NAME_LEN: usize = 15;
    let mut end = name.len().min(MAX_NATIVE_NAME_LEN);
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    let Ok(name) = std::ffi::CString::new(&name[..end]) else {
        return;
    };
    // SAFETY: PR_SET_NAME reads a NUL-terminated string of at most 16 bytes.
    unsafe {
        libc::prctl(libc::PR_SET_NAME, name.as_ptr() as libc::c_ulong, 0, 0, 0);
    }
}

#[cfg(not(target_os = "linux"))]
fn set_native_thread_name(_name: &str) {}

/// Maps a nice value onto the managed 1..=10 priority scale.
pub(crate) fn priority_for_nice(nice: i32) -> i32 {
    NICE_VALUES
        .iter()
        .position(|threshold| nice >= *threshold)
        .map_or(MAX_PRIORITY, |index| index as i32 + MIN_PRIORITY)
}

pub(crate) fn nice_of(tid: i64) -> i32 {
    let Ok(who) = libc::id_t::try_from(tid) else {
        return 0;
    };
    // SAFETY: getpriority only reads scheduler state for `who`.
    unsafe { libc::getpriority(libc::PRIO_PROCESS, who) }
}

impl Thread {
    /// Binds this entity to the calling native thread and registers it.
    ///
    /// Must run on the thread the entity describes, before it is visible to
    /// anyone else.
    pub fn init(self: &Arc<Self>) {
        if let Some(existing) = Thread::current() {
            fatal!("native thread already attached as {existing}");
        }
        let runtime = self.runtime();
        if runtime.is_shutting_down() {
            tracing::warn!(target: "threads", "thread attaching while runtime is shutting down");
        }

        let thin_lock_id = runtime.thread_list().alloc_thread_id();
        self.thin_lock_id.store(thin_lock_id, Ordering::Release);
        self.tid.store(current_tid(), Ordering::Relaxed);
        self.pthread.store(current_pthread(), Ordering::Relaxed);
        let _ = self.native.set(std::thread::current());
        self.init_stack_hwm(runtime.config());

        Thread::set_current(Some(Arc::clone(self)));
        runtime.thread_list().register(self);
        tracing::debug!(target: "threads", thread = %self, "initialized");
    }

    fn init_stack_hwm(&self, config: &RuntimeConfig) {
        let marker = 0u8;
        let here = &marker as *const u8 as usize;
        let (begin, size, from_os) = match native_stack_bounds() {
            Some((begin, size)) => (begin, size, true),
            None => (here.saturating_sub(config.default_stack_size), config.default_stack_size, false),
        };

        if size <= config.stack_overflow_reserved_bytes {
            fatal!(
                "attempt to attach a thread with a too-small stack ({size} bytes, {} reserved)",
                config.stack_overflow_reserved_bytes
            );
        }
        self.stack_begin.store(begin, Ordering::Relaxed);
        self.stack_size.store(size, Ordering::Relaxed);
        self.reset_default_stack_end_with(config);

        if from_os && here <= self.stack_end() {
            fatal!(
                "stack variable {here:#x} below the computed stack end {:#x}",
                self.stack_end()
            );
        }
    }

    /// Gives stack-overflow handling the reserved region below the usual end.
    pub fn set_stack_end_for_stack_overflow(&self) {
        if self.stack_end() == self.stack_begin() {
            let mut dump = String::new();
            let _ = self.dump_stack(&mut dump);
            fatal!(
                "stack overflow while handling stack overflow on {self}; increase the reserved bytes\n{dump}"
            );
        }
        self.stack_end.store(self.stack_begin(), Ordering::Relaxed);
    }

    /// Restores the overflow reserve after stack-overflow handling.
    pub fn reset_default_stack_end(&self) {
        self.reset_default_stack_end_with(self.runtime().config());
    }

    fn reset_default_stack_end_with(&self, config: &RuntimeConfig) {
        let end = self.stack_begin() + config.stack_overflow_reserved_bytes;
        self.stack_end.store(end, Ordering::Relaxed);
    }

    /// Refreshes the OS identity after `fork` in the child.
    pub fn init_after_fork(&self) {
        self.tid.store(current_tid(), Ordering::Relaxed);
        self.pthread.store(current_pthread(), Ordering::Relaxed);
    }

    /// Attaches the calling native thread to `runtime`.
    ///
    /// The thread ends up in [`ThreadState::Native`]. Unless it is the main
    /// thread or the runtime is a compiler, it also gets a managed peer; if
    /// that fails the thread stays attached without a peer and the failure is
    /// left pending as an exception.
    pub fn attach(
        runtime: &Arc<Runtime>,
        name: Option<&str>,
        as_daemon: bool,
        group: Option<ObjectRef>,
    ) -> ThreadResult<Arc<Thread>> {
        if runtime.is_shutting_down() {
            tracing::error!(target: "threads", ?name, "thread attaching while runtime is shutting down");
            return Err(ThreadError::RuntimeUnavailable);
        }
        let thread = Thread::new(runtime, as_daemon);
        thread.init();

        {
            let guard = runtime.locks().thread_suspend_count.lock();
            if thread.state() == ThreadState::Runnable {
                fatal!("{thread} attached while runnable");
            }
            thread.set_state(&guard, ThreadState::Native);
        }

        if thread.thin_lock_id() != MAIN_THREAD_ID && !runtime.config().is_compiler {
            thread.create_peer(name, as_daemon, group);
        } else if let Some(name) = name {
            thread.set_thread_name(name);
        }

        let locals = thread.local_reference_count();
        if locals != 0 {
            fatal!("{thread} leaked {locals} local references while attaching");
        }
        if thread.peer().is_some() {
            runtime.post_event(RuntimeEvent::ThreadStarted {
                thin_lock_id: thread.thin_lock_id(),
                name: thread.name().as_str().to_owned(),
            });
        }
        Ok(thread)
    }

    /// Allocates and initializes the managed `Thread` object for this entity.
    ///
    /// On allocation failure an OutOfMemoryError is left pending and the
    /// entity keeps working as a native-only thread.
    pub fn create_peer(&self, name: Option<&str>, as_daemon: bool, group: Option<ObjectRef>) {
        let runtime = self.runtime();
        if !runtime.is_started() {
            fatal!("managed peer requested for {self} before the runtime started");
        }
        let objects = runtime.objects();
        let group = group.or_else(|| runtime.main_thread_group());
        let thread_name = name.and_then(|name| objects.new_string(name));
        let priority = self.native_priority();
        let Some(thread_class) = objects.find_class(well_known::THREAD) else {
            fatal!("class {} is not loaded", well_known::THREAD);
        };

        let _runnable = ScopedRunnable::new(self);
        let Some(peer) = self.alloc_object(thread_class) else {
            if !self.is_exception_pending() {
                fatal!("peer allocation for {self} failed without an exception");
            }
            return;
        };
        self.set_peer(Some(peer));

        objects.invoke(
            self,
            peer,
            &well_known::THREAD_INIT,
            &[
                Value::Object(group),
                Value::Object(thread_name),
                Value::Int(priority),
                Value::Bool(as_daemon),
            ],
        );
        self.assert_no_pending_exception();
        objects.set_field(peer, &well_known::THREAD_VM_DATA, Value::Int(self.index().as_u32() as i32));

        let mut peer_name = objects.get_field(peer, &well_known::THREAD_NAME).as_object();
        if peer_name.is_none() {
            // Without core library code the constructor leaves the fields
            // unset; fill in what it would have assigned.
            objects.set_field(peer, &well_known::THREAD_DAEMON, Value::Bool(as_daemon));
            objects.set_field(peer, &well_known::THREAD_GROUP_FIELD, Value::Object(group));
            objects.set_field(peer, &well_known::THREAD_NAME, Value::Object(thread_name));
            objects.set_field(peer, &well_known::THREAD_PRIORITY, Value::Int(priority));
            peer_name = thread_name;
        }
        if let Some(name) = peer_name.and_then(|name| objects.string_value(name)) {
            self.set_thread_name(&name);
        }
    }

    /// Records a new name, renames the OS thread when called on the current
    /// thread, and tells observers.
    pub fn set_thread_name(&self, name: &str) {
        self.name.store(Arc::new(name.to_owned()));
        if self.is_current() {
            set_native_thread_name(name);
        }
        if let Some(runtime) = self.runtime.upgrade() {
            runtime.post_event(RuntimeEvent::ThreadRenamed {
                thin_lock_id: self.thin_lock_id(),
                name: name.to_owned(),
            });
        }
    }

    /// Managed priority corresponding to the thread's current nice value.
    pub fn native_priority(&self) -> i32 {
        if self.tid() == 0 {
            return NORM_PRIORITY;
        }
        priority_for_nice(nice_of(self.tid()))
    }

    /// Starts a native thread for the managed thread `peer`.
    ///
    /// Must be called by an attached thread. If the OS refuses, `vmData` is
    /// cleared and an OutOfMemoryError is left pending on the caller.
    pub fn create_native_thread(
        runtime: &Arc<Runtime>,
        peer: ObjectRef,
        stack_size: usize,
        daemon: bool,
    ) -> ThreadResult<JoinHandle<()>> {
        let Some(creator) = Thread::current() else {
            fatal!("native thread creation requested by an unattached thread");
        };
        let objects = runtime.objects();
        let child = Thread::new(runtime, daemon);
        objects.set_field(peer, &well_known::THREAD_VM_DATA, Value::Int(child.index().as_u32() as i32));
        // Keeps the peer reachable until the child has registered itself.
        let pinned = runtime.references().add_global(peer);

        let spawn_result = match fix_stack_size(runtime.config(), stack_size) {
            Some(size) => std::thread::Builder::new()
                .stack_size(size)
                .spawn(move || run_managed_thread(child, pinned))
                .map_err(|err| (size, err.to_string())),
            None => Err((stack_size, "stack size overflows".to_owned())),
        };

        match spawn_result {
            Ok(handle) => Ok(handle),
            Err((size, reason)) => {
                runtime.references().delete_global(pinned);
                Err(creator.report_spawn_failure(peer, size, &reason))
            }
        }
    }

    pub(crate) fn report_spawn_failure(&self, peer: ObjectRef, stack_size: usize, reason: &str) -> ThreadError {
        let runtime = self.runtime();
        runtime
            .objects()
            .set_field(peer, &well_known::THREAD_VM_DATA, Value::Int(0));
        let message = format!("thread creation ({} stack) failed: {reason}", pretty_size(stack_size));
        self.throw_out_of_memory_error(&message);
        ThreadError::ThreadCreation(message)
    }

    /// Runs the managed-side teardown while the thread is still registered:
    /// releases monitors entered through the native interface, reports an
    /// uncaught exception, leaves the thread group and wakes joiners.
    pub fn destroy(&self) {
        let runtime = self.runtime();
        let objects = runtime.objects();

        let monitors = std::mem::take(&mut *self.jni_monitors.lock());
        for monitor in monitors.into_iter().rev() {
            tracing::warn!(target: "threads", thread = %self, %monitor, "releasing monitor still held on detach");
            objects.monitor_exit(self, monitor);
        }

        let Some(peer) = self.peer() else {
            return;
        };
        {
            let _runnable = ScopedRunnable::new(self);
            self.handle_uncaught_exception(peer);
            self.remove_from_thread_group(peer);

            objects.set_field(peer, &well_known::THREAD_VM_DATA, Value::Int(0));
            runtime.post_event(RuntimeEvent::ThreadDied {
                thin_lock_id: self.thin_lock_id(),
            });

            // Thread.join waits on the peer's lock object.
            if let Some(lock) = objects.get_field(peer, &well_known::THREAD_LOCK).as_object() {
                objects.monitor_enter(self, lock);
                objects.notify_all(self, lock);
                objects.monitor_exit(self, lock);
            }
        }
        self.set_peer(None);
    }

    fn handle_uncaught_exception(&self, peer: ObjectRef) {
        let Some(exception) = self.exception() else {
            return;
        };
        self.clear_exception();

        let runtime = self.runtime();
        let objects = runtime.objects();
        let handler = objects
            .get_field(peer, &well_known::THREAD_UNCAUGHT_HANDLER)
            .as_object()
            .or_else(|| objects.get_field(peer, &well_known::THREAD_GROUP_FIELD).as_object());
        let Some(handler) = handler else {
            tracing::warn!(target: "threads", thread = %self, %exception, "no handler for uncaught exception");
            return;
        };
        objects.invoke(
            self,
            handler,
            &well_known::UNCAUGHT_EXCEPTION,
            &[Value::Object(Some(peer)), Value::Object(Some(exception))],
        );
        // An exception thrown by the handler itself is dropped.
        self.clear_exception();
    }

    fn remove_from_thread_group(&self, peer: ObjectRef) {
        let runtime = self.runtime();
        let objects = runtime.objects();
        // No group in the compiler and in tests.
        if let Some(group) = objects.get_field(peer, &well_known::THREAD_GROUP_FIELD).as_object() {
            objects.invoke(
                self,
                group,
                &well_known::THREAD_GROUP_REMOVE_THREAD,
                &[Value::Object(Some(peer))],
            );
        }
    }
}

/// Body of a thread started by [`Thread::create_native_thread`].
fn run_managed_thread(thread: Arc<Thread>, pinned_peer: IndirectRef) {
    let runtime = match thread.try_runtime() {
        Ok(runtime) => runtime,
        Err(err) => {
            tracing::error!(target: "threads", %err, "managed thread started after runtime teardown");
            return;
        }
    };
    thread.init();
    {
        let guard = runtime.locks().thread_suspend_count.lock();
        thread.set_state(&guard, ThreadState::Native);
    }

    let peer = match runtime.references().lookup_global(pinned_peer) {
        Lookup::Live(peer) => peer,
        Lookup::Cleared | Lookup::Deleted => fatal!("peer of {thread} vanished before it started"),
    };
    runtime.references().delete_global(pinned_peer);
    thread.set_peer(Some(peer));

    {
        let _runnable = ScopedRunnable::new(&thread);
        let objects = runtime.objects();
        if let Some(name) = objects
            .get_field(peer, &well_known::THREAD_NAME)
            .as_object()
            .and_then(|name| objects.string_value(name))
        {
            thread.set_thread_name(&name);
        }
        runtime.post_event(RuntimeEvent::ThreadStarted {
            thin_lock_id: thread.thin_lock_id(),
            name: thread.name().as_str().to_owned(),
        });

        let return_pc = run_managed_thread as fn(Arc<Thread>, IndirectRef) as usize;
        // An uncaught exception stays pending and is reported by destroy.
        let _ = thread.invoke_upcall(return_pc, |thread| {
            objects.invoke(thread, peer, &well_known::THREAD_RUN, &[]);
        });
    }
    runtime.detach_current_thread();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ObjectModel;
    use crate::test_utils::{attach_main, test_runtime};

    #[test]
    fn stack_size_gets_headroom_and_page_alignment() {
        let config = RuntimeConfig::default();
        let page = page_size();

        let default = fix_stack_size(&config, 0).unwrap();
        assert!(default >= config.default_stack_size + MB + config.stack_overflow_reserved_bytes);
        assert_eq!(default % page, 0);

        let explicit = fix_stack_size(&config, 3 * MB + 1).unwrap();
        assert!(explicit > 4 * MB);
        assert_eq!(explicit % page, 0);

        assert_eq!(fix_stack_size(&config, usize::MAX - 10), None);
    }

    #[test]
    fn nice_values_map_to_priorities() {
        assert_eq!(priority_for_nice(19), 1);
        assert_eq!(priority_for_nice(12), 4);
        assert_eq!(priority_for_nice(0), 5);
        assert_eq!(priority_for_nice(-3), 7);
        assert_eq!(priority_for_nice(-20), 10);
        assert_eq!(priority_for_nice(20), 1);
    }

    #[test]
    fn init_records_identity_and_stack() {
        let (runtime, _, _) = test_runtime();
        let thread = attach_main(&runtime);

        assert_eq!(thread.thin_lock_id(), MAIN_THREAD_ID);
        assert!(thread.tid() > 0);
        assert_ne!(thread.pthread_handle(), 0);
        assert!(thread.native_thread().is_some());
        assert!(thread.stack_size() > runtime.config().stack_overflow_reserved_bytes);
        assert_eq!(
            thread.stack_end(),
            thread.stack_begin() + runtime.config().stack_overflow_reserved_bytes
        );

        thread.set_stack_end_for_stack_overflow();
        assert_eq!(thread.stack_end(), thread.stack_begin());
        thread.reset_default_stack_end();
        assert!(thread.stack_end() > thread.stack_begin());

        runtime.detach_current_thread();
    }

    #[test]
    #[should_panic(expected = "already attached")]
    fn attaching_twice_is_fatal() {
        let (runtime, _, _) = test_runtime();
        let _main = attach_main(&runtime);
        let second = Thread::new(&runtime, false);
        second.init();
    }

    #[test]
    fn main_thread_gets_name_but_no_peer() {
        let (runtime, _, _) = test_runtime();
        let main = attach_main(&runtime);

        assert_eq!(main.state(), ThreadState::Native);
        assert!(main.peer().is_none());
        assert_eq!(main.name().as_str(), "main");
        assert!(!main.is_still_starting());

        runtime.detach_current_thread();
        assert_eq!(main.state(), ThreadState::Terminated);
    }

    #[test]
    fn spawn_failure_clears_vm_data_and_raises_oom() {
        let (runtime, objects, _) = test_runtime();
        let main = attach_main(&runtime);
        runtime.finish_startup(objects.new_thread_group("main")).unwrap();

        let peer = objects.new_instance(well_known::THREAD);
        objects.set_field(peer, &well_known::THREAD_VM_DATA, Value::Int(42));
        let err = main.report_spawn_failure(peer, 2 * MB, "Resource temporarily unavailable");

        assert_eq!(
            err,
            ThreadError::ThreadCreation("thread creation (2MB stack) failed: Resource temporarily unavailable".to_owned())
        );
        assert_eq!(objects.get_field(peer, &well_known::THREAD_VM_DATA).as_int(), Some(0));
        let exception = main.exception().expect("OutOfMemoryError pending");
        assert_eq!(objects.descriptor_of(exception), well_known::OUT_OF_MEMORY_ERROR);

        main.clear_exception();
        runtime.detach_current_thread();
    }
}
