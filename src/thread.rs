//! The per-thread runtime entity.
//!
//! Every native thread that runs managed code owns exactly one [`Thread`]. It
//! is created with [`Thread::new`], becomes visible to the rest of the runtime
//! when [`Thread::init`] registers it on its own native thread, and is torn
//! down by [`Runtime::detach_current_thread`](crate::Runtime::detach_current_thread).
//!
//! # Examples
//!
//! ```
//! use std::sync::Arc;
//! use vmthread::test_utils::{MockCode, MockObjectModel};
//! use vmthread::{Runtime, RuntimeConfig, Thread};
//!
//! let runtime = Runtime::new(
//!     RuntimeConfig::default(),
//!     Arc::new(MockObjectModel::new()),
//!     Arc::new(MockCode::new()),
//! );
//! let thread = Thread::attach(&runtime, Some("main"), false, None).unwrap();
//!
//! assert_eq!(thread.thin_lock_id(), 1);
//! assert_eq!(thread.name().as_str(), "main");
//! assert!(Thread::current().is_some_and(|current| Arc::ptr_eq(&current, &thread)));
//!
//! runtime.detach_current_thread();
//! assert!(Thread::current().is_none());
//! ```

mod dump;
mod lifecycle;
mod monitor;
mod state;

use std::cell::RefCell;
use std::fmt;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU8, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use arc_swap::ArcSwap;
use crossbeam_utils::atomic::AtomicCell;
use once_cell::sync::OnceCell;
use parking_lot::{Condvar, Mutex};

pub use dump::{MAX_REPETITION, dump_state_for};
pub use lifecycle::{MAX_PRIORITY, MIN_PRIORITY, NORM_PRIORITY, fix_stack_size};
pub use monitor::WaitOutcome;
pub use state::ThreadState;

use crate::error::{ThreadError, ThreadResult};
use crate::locks::{LockLevel, RankedMutex};
use crate::object::ObjectRef;
use crate::reference::{IndirectRefKind, IndirectReferenceTable, ReferenceScope};
use crate::runtime::Runtime;
use crate::stack::{Context, ManagedStack};

use monitor::WaitState;

/// Name carried by a thread until it is attached and named.
pub const THREAD_NAME_DURING_STARTUP: &str = "<native thread without managed peer>";

/// Thin-lock id of the thread that started the runtime.
pub const MAIN_THREAD_ID: u32 = 1;

/// Process-unique identity of a [`Thread`], stored in its peer's `vmData`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadIndex(pub(crate) u32);

impl ThreadIndex {
    fn next() -> Self {
        static NEXT: AtomicU32 = AtomicU32::new(1);
        let mut index = NEXT.fetch_add(1, Ordering::Relaxed);
        while index == 0 || index > i32::MAX as u32 {
            NEXT.store(1, Ordering::Relaxed);
            index = NEXT.fetch_add(1, Ordering::Relaxed);
        }
        ThreadIndex(index)
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }
}

thread_local! {
    static CURRENT: RefCell<Option<Arc<Thread>>> = const { RefCell::new(None) };
}

pub struct Thread {
    index: ThreadIndex,
    runtime: Weak<Runtime>,
    daemon: bool,
    thin_lock_id: AtomicU32,
    tid: AtomicI64,
    /// `pthread_t` of the owning native thread, 0 until initialized.
    pthread: AtomicUsize,
    native: OnceCell<std::thread::Thread>,
    pub(crate) state: AtomicU8,
    pub(crate) suspend_count: AtomicI32,
    pub(crate) debug_suspend_count: AtomicI32,
    /// Set the first time the thread enters `Runnable`.
    pub(crate) has_been_runnable: AtomicBool,
    stack_begin: AtomicUsize,
    stack_size: AtomicUsize,
    stack_end: AtomicUsize,
    peer: AtomicCell<Option<ObjectRef>>,
    name: ArcSwap<String>,
    exception: AtomicCell<Option<ObjectRef>>,
    class_loader_override: AtomicCell<Option<ObjectRef>>,
    pub(crate) throwing_oom: AtomicBool,
    pub(crate) managed_stack: Mutex<ManagedStack>,
    pub(crate) scopes: Mutex<Vec<ReferenceScope>>,
    pub(crate) locals: Mutex<IndirectReferenceTable>,
    pub(crate) jni_monitors: Mutex<Vec<ObjectRef>>,
    long_jump_context: Mutex<Option<Box<Context>>>,
    pub(crate) wait: RankedMutex<WaitState>,
    pub(crate) wait_cond: Condvar,
    pub(crate) monitor_enter_object: AtomicCell<Option<ObjectRef>>,
    pub(crate) no_suspension: AtomicU32,
    pub(crate) no_suspension_cause: Mutex<Option<&'static str>>,
}

impl Thread {
    /// Creates an entity for a thread that is about to start. It is not
    /// registered until [`init`](Self::init) runs on the new native thread.
    pub fn new(runtime: &Arc<Runtime>, daemon: bool) -> Arc<Thread> {
        let check = runtime.config().check_locks;
        Arc::new(Thread {
            index: ThreadIndex::next(),
            runtime: Arc::downgrade(runtime),
            daemon,
            thin_lock_id: AtomicU32::new(0),
            tid: AtomicI64::new(0),
            pthread: AtomicUsize::new(0),
            native: OnceCell::new(),
            state: AtomicU8::new(ThreadState::Starting as u8),
            suspend_count: AtomicI32::new(0),
            debug_suspend_count: AtomicI32::new(0),
            has_been_runnable: AtomicBool::new(false),
            stack_begin: AtomicUsize::new(0),
            stack_size: AtomicUsize::new(0),
            stack_end: AtomicUsize::new(0),
            peer: AtomicCell::new(None),
            name: ArcSwap::from_pointee(THREAD_NAME_DURING_STARTUP.to_owned()),
            exception: AtomicCell::new(None),
            class_loader_override: AtomicCell::new(None),
            throwing_oom: AtomicBool::new(false),
            managed_stack: Mutex::new(ManagedStack::new()),
            scopes: Mutex::new(Vec::new()),
            locals: Mutex::new(IndirectReferenceTable::new(IndirectRefKind::Local)),
            jni_monitors: Mutex::new(Vec::new()),
            long_jump_context: Mutex::new(None),
            wait: RankedMutex::new("thread wait mutex", LockLevel::Default, check, WaitState::default()),
            wait_cond: Condvar::new(),
            monitor_enter_object: AtomicCell::new(None),
            no_suspension: AtomicU32::new(0),
            no_suspension_cause: Mutex::new(None),
        })
    }

    /// The entity bound to the calling native thread, if it is attached.
    pub fn current() -> Option<Arc<Thread>> {
        CURRENT.with(|current| current.borrow().clone())
    }

    pub(crate) fn set_current(thread: Option<Arc<Thread>>) {
        CURRENT.with(|current| *current.borrow_mut() = thread);
    }

    /// Whether this entity belongs to the calling native thread.
    pub fn is_current(&self) -> bool {
        CURRENT.with(|current| {
            current
                .borrow()
                .as_ref()
                .is_some_and(|thread| ptr::eq(Arc::as_ptr(thread), self))
        })
    }

    pub fn runtime(&self) -> Arc<Runtime> {
        match self.runtime.upgrade() {
            Some(runtime) => runtime,
            None => fatal!("thread {} outlived its runtime", self.index.0),
        }
    }

    pub fn try_runtime(&self) -> ThreadResult<Arc<Runtime>> {
        self.runtime.upgrade().ok_or(ThreadError::RuntimeUnavailable)
    }

    pub fn index(&self) -> ThreadIndex {
        self.index
    }

    pub fn is_daemon(&self) -> bool {
        self.daemon
    }

    /// Small dense id used as the monitor ownership tag. Zero until registered.
    pub fn thin_lock_id(&self) -> u32 {
        self.thin_lock_id.load(Ordering::Acquire)
    }

    /// OS thread id.
    pub fn tid(&self) -> i64 {
        self.tid.load(Ordering::Relaxed)
    }

    pub fn pthread_handle(&self) -> usize {
        self.pthread.load(Ordering::Relaxed)
    }

    pub fn native_thread(&self) -> Option<&std::thread::Thread> {
        self.native.get()
    }

    pub fn state(&self) -> ThreadState {
        ThreadState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn name(&self) -> Arc<String> {
        self.name.load_full()
    }

    pub fn peer(&self) -> Option<ObjectRef> {
        self.peer.load()
    }

    pub(crate) fn set_peer(&self, peer: Option<ObjectRef>) {
        self.peer.store(peer);
    }

    pub fn class_loader_override(&self) -> Option<ObjectRef> {
        self.class_loader_override.load()
    }

    pub fn set_class_loader_override(&self, loader: Option<ObjectRef>) {
        self.class_loader_override.store(loader);
    }

    pub fn stack_begin(&self) -> usize {
        self.stack_begin.load(Ordering::Relaxed)
    }

    pub fn stack_size(&self) -> usize {
        self.stack_size.load(Ordering::Relaxed)
    }

    /// Lowest usable stack address; below it lies the overflow reserve.
    pub fn stack_end(&self) -> usize {
        self.stack_end.load(Ordering::Relaxed)
    }

    pub fn exception(&self) -> Option<ObjectRef> {
        self.exception.load()
    }

    pub fn is_exception_pending(&self) -> bool {
        self.exception.load().is_some()
    }

    pub fn set_exception(&self, exception: ObjectRef) {
        self.exception.store(Some(exception));
    }

    pub fn clear_exception(&self) {
        self.exception.store(None);
    }

    pub fn assert_no_pending_exception(&self) {
        if let Some(exception) = self.exception() {
            let runtime = self.runtime();
            let objects = runtime.objects();
            let descriptor = objects.class_descriptor(objects.class_of(exception));
            fatal!("no pending exception expected on {self}: {descriptor} {exception:?}");
        }
    }

    /// Runs `f` with exclusive access to this thread's frame chain.
    pub fn with_managed_stack<R>(&self, f: impl FnOnce(&mut ManagedStack) -> R) -> R {
        f(&mut self.managed_stack.lock())
    }

    /// Hands out the thread's reusable long-jump context, allocating it on
    /// first use. Must be given back with
    /// [`release_long_jump_context`](Self::release_long_jump_context).
    pub fn take_long_jump_context(&self) -> Box<Context> {
        self.long_jump_context.lock().take().unwrap_or_default()
    }

    pub fn release_long_jump_context(&self, context: Box<Context>) {
        let mut slot = self.long_jump_context.lock();
        if slot.is_some() {
            fatal!("long jump context released twice on {self}");
        }
        *slot = Some(context);
    }
}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thread")
            .field("index", &self.index)
            .field("thin_lock_id", &self.thin_lock_id())
            .field("tid", &self.tid())
            .field("state", &self.state())
            .field("name", &self.name())
            .finish_non_exhaustive()
    }
}
