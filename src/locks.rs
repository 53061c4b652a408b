//! Ranked locks shared by the thread runtime.
//!
//! Every lock has a [`LockLevel`]. A thread holding a lock may only acquire
//! locks of a strictly lower level; with checking enabled a violation is
//! fatal. The levels a thread currently holds are tracked in a thread-local so
//! the safepoint code can assert that nothing is held at suspension points.

use std::cell::{Cell, RefCell};
use std::ops::{Deref, DerefMut};
use std::ptr;
use std::time::Duration;

use parking_lot::lock_api::RawRwLock as RawRwLockApi;
use parking_lot::{Condvar, Mutex, MutexGuard, RawRwLock};

/// Position of a lock in the acquisition order. Higher levels are taken first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum LockLevel {
    ThreadSuspendCount = 0,
    JniWeakGlobals = 1,
    JniGlobals = 2,
    Default = 3,
    CompilerDriver = 4,
    ThreadList = 5,
    Mutator = 6,
}

const LEVEL_COUNT: usize = 7;

impl LockLevel {
    pub const ALL: [LockLevel; LEVEL_COUNT] = [
        LockLevel::ThreadSuspendCount,
        LockLevel::JniWeakGlobals,
        LockLevel::JniGlobals,
        LockLevel::Default,
        LockLevel::CompilerDriver,
        LockLevel::ThreadList,
        LockLevel::Mutator,
    ];
}

thread_local! {
    static HELD: Cell<[u8; LEVEL_COUNT]> = const { Cell::new([0; LEVEL_COUNT]) };
    static MUTATOR_HOLDS: RefCell<Vec<(usize, MutatorHold)>> = const { RefCell::new(Vec::new()) };
}

/// Levels of all ranked locks the calling thread currently holds, lowest first.
pub fn held_levels() -> Vec<LockLevel> {
    let counts = HELD.with(Cell::get);
    LockLevel::ALL
        .into_iter()
        .filter(|level| counts[*level as usize] > 0)
        .collect()
}

/// Whether the calling thread holds any lock at `level`.
pub fn is_held(level: LockLevel) -> bool {
    HELD.with(Cell::get)[level as usize] > 0
}

fn check_order(level: LockLevel, name: &str, check: bool) {
    if !check {
        return;
    }
    let counts = HELD.with(Cell::get);
    if let Some(conflict) = LockLevel::ALL
        .into_iter()
        .find(|held| *held <= level && counts[*held as usize] > 0)
    {
        fatal!("lock level violation: acquiring \"{name}\" ({level:?}) while holding a {conflict:?} lock");
    }
}

fn mark_held(level: LockLevel) {
    HELD.with(|cell| {
        let mut counts = cell.get();
        counts[level as usize] = counts[level as usize].saturating_add(1);
        cell.set(counts);
    });
}

fn mark_released(level: LockLevel) {
    HELD.with(|cell| {
        let mut counts = cell.get();
        counts[level as usize] = counts[level as usize].saturating_sub(1);
        cell.set(counts);
    });
}

/// A parking_lot mutex that participates in lock-level checking.
pub struct RankedMutex<T> {
    name: &'static str,
    level: LockLevel,
    check: bool,
    inner: Mutex<T>,
}

impl<T> RankedMutex<T> {
    pub const fn new(name: &'static str, level: LockLevel, check: bool, value: T) -> Self {
        Self {
            name,
            level,
            check,
            inner: Mutex::new(value),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn level(&self) -> LockLevel {
        self.level
    }

    pub fn lock(&self) -> RankedMutexGuard<'_, T> {
        check_order(self.level, self.name, self.check);
        let guard = self.inner.lock();
        mark_held(self.level);
        RankedMutexGuard { mutex: self, guard }
    }

    /// Non-blocking acquisition. Cannot deadlock, so the level order is not
    /// enforced; diagnostic paths use this while holding lower-level locks.
    pub fn try_lock(&self) -> Option<RankedMutexGuard<'_, T>> {
        let guard = self.inner.try_lock()?;
        mark_held(self.level);
        Some(RankedMutexGuard { mutex: self, guard })
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for RankedMutex<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RankedMutex")
            .field("name", &self.name)
            .field("level", &self.level)
            .finish_non_exhaustive()
    }
}

pub struct RankedMutexGuard<'a, T> {
    mutex: &'a RankedMutex<T>,
    guard: MutexGuard<'a, T>,
}

impl<T> RankedMutexGuard<'_, T> {
    /// Blocks on `cond`, releasing the mutex while parked.
    pub fn wait(&mut self, cond: &Condvar) {
        cond.wait(&mut self.guard);
    }

    /// Like [`wait`](Self::wait) with a timeout. Returns true on timeout.
    pub fn wait_for(&mut self, cond: &Condvar, timeout: Duration) -> bool {
        cond.wait_for(&mut self.guard, timeout).timed_out()
    }

    pub fn belongs_to(&self, mutex: &RankedMutex<T>) -> bool {
        ptr::eq(self.mutex, mutex)
    }
}

impl<T> Deref for RankedMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for RankedMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for RankedMutexGuard<'_, T> {
    fn drop(&mut self) {
        mark_released(self.mutex.level);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MutatorHold {
    Shared,
    Exclusive,
}

/// The global reader/writer lock guarding the managed heap.
///
/// Runnable threads hold it shared; the collector takes it exclusively to
/// stop the world. Holds are not scoped: a thread acquires the shared hold in
/// one transition and releases it in another, so the raw lock is used and the
/// owning thread is tracked here.
pub struct MutatorLock {
    raw: RawRwLock,
    check: bool,
}

impl MutatorLock {
    pub fn new(check: bool) -> Self {
        Self {
            raw: <RawRwLock as RawRwLockApi>::INIT,
            check,
        }
    }

    fn key(&self) -> usize {
        self as *const Self as usize
    }

    fn hold(&self) -> Option<MutatorHold> {
        let key = self.key();
        MUTATOR_HOLDS.with(|holds| {
            holds
                .borrow()
                .iter()
                .find(|(lock, _)| *lock == key)
                .map(|(_, hold)| *hold)
        })
    }

    fn record(&self, hold: Option<MutatorHold>) {
        let key = self.key();
        MUTATOR_HOLDS.with(|holds| {
            let mut holds = holds.borrow_mut();
            holds.retain(|(lock, _)| *lock != key);
            if let Some(hold) = hold {
                holds.push((key, hold));
            }
        });
    }

    pub fn shared_lock(&self) {
        if let Some(hold) = self.hold() {
            fatal!("mutator lock acquired shared while already held {hold:?}");
        }
        check_order(LockLevel::Mutator, "mutator lock", self.check);
        self.raw.lock_shared();
        self.record(Some(MutatorHold::Shared));
        mark_held(LockLevel::Mutator);
    }

    pub fn shared_unlock(&self) {
        if self.hold() != Some(MutatorHold::Shared) {
            fatal!("releasing a shared mutator hold the current thread does not own");
        }
        self.record(None);
        mark_released(LockLevel::Mutator);
        // SAFETY: the tracking above proves this thread holds a shared lock.
        unsafe { self.raw.unlock_shared() };
    }

    pub fn exclusive_lock(&self) {
        if let Some(hold) = self.hold() {
            fatal!("mutator lock acquired exclusively while already held {hold:?}");
        }
        check_order(LockLevel::Mutator, "mutator lock", self.check);
        self.raw.lock_exclusive();
        self.record(Some(MutatorHold::Exclusive));
        mark_held(LockLevel::Mutator);
    }

    pub fn exclusive_unlock(&self) {
        if self.hold() != Some(MutatorHold::Exclusive) {
            fatal!("releasing an exclusive mutator hold the current thread does not own");
        }
        self.record(None);
        mark_released(LockLevel::Mutator);
        // SAFETY: the tracking above proves this thread holds the exclusive lock.
        unsafe { self.raw.unlock_exclusive() };
    }

    pub fn is_shared_held(&self) -> bool {
        self.hold() == Some(MutatorHold::Shared)
    }

    pub fn is_exclusive_held(&self) -> bool {
        self.hold() == Some(MutatorHold::Exclusive)
    }

    pub fn is_held(&self) -> bool {
        self.hold().is_some()
    }
}

/// Suspend-count lock guard; proof of holding it is required to change counts.
pub type SuspendCountGuard<'a> = RankedMutexGuard<'a, ()>;

/// The runtime-wide locks that are not owned by a single data structure.
pub struct Locks {
    pub mutator: MutatorLock,
    pub thread_suspend_count: RankedMutex<()>,
    /// Signalled whenever a suspend count drops to zero.
    pub resume_cond: Condvar,
}

impl Locks {
    pub fn new(check: bool) -> Self {
        Self {
            mutator: MutatorLock::new(check),
            thread_suspend_count: RankedMutex::new(
                "thread suspend count lock",
                LockLevel::ThreadSuspendCount,
                check,
                (),
            ),
            resume_cond: Condvar::new(),
        }
    }
}
