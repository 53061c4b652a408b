//! Registry of live threads.

use std::fmt;
use std::sync::Arc;

use crate::locks::{LockLevel, RankedMutex, RankedMutexGuard};
use crate::object::{ObjectModel, ObjectRef};
use crate::thread::{Thread, ThreadIndex};
use crate::well_known;

/// Dense thin-lock id allocation: the smallest free id is handed out first.
#[derive(Debug)]
struct ThreadIdAllocator {
    words: Vec<u64>,
    max_id: u32,
}

impl ThreadIdAllocator {
    fn new(max_id: u32) -> Self {
        Self {
            words: Vec::new(),
            max_id,
        }
    }

    fn alloc(&mut self) -> Option<u32> {
        // Bit n stands for id n + 1; id 0 is never handed out.
        let mut word_index = 0;
        loop {
            if word_index == self.words.len() {
                self.words.push(0);
            }
            let word = self.words[word_index];
            if word != u64::MAX {
                let bit = word.trailing_ones();
                let id = word_index as u32 * 64 + bit + 1;
                if id > self.max_id {
                    return None;
                }
                self.words[word_index] |= 1 << bit;
                return Some(id);
            }
            word_index += 1;
        }
    }

    fn release(&mut self, id: u32) -> bool {
        if id == 0 {
            return false;
        }
        let bit = (id - 1) as usize;
        match self.words.get_mut(bit / 64) {
            Some(word) if *word & (1 << (bit % 64)) != 0 => {
                *word &= !(1 << (bit % 64));
                true
            }
            _ => false,
        }
    }
}

/// Registry contents, reachable only through the registry lock.
#[derive(Debug)]
pub struct ThreadListInner {
    threads: Vec<Arc<Thread>>,
    ids: ThreadIdAllocator,
}

impl ThreadListInner {
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Thread>> {
        self.threads.iter()
    }

    pub fn len(&self) -> usize {
        self.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    pub fn contains(&self, thread: &Thread) -> bool {
        self.threads.iter().any(|t| std::ptr::eq(Arc::as_ptr(t), thread))
    }

    pub fn find_by_index(&self, index: ThreadIndex) -> Option<Arc<Thread>> {
        self.threads.iter().find(|t| t.index() == index).cloned()
    }

    pub fn find_by_thin_lock_id(&self, thin_lock_id: u32) -> Option<Arc<Thread>> {
        self.threads
            .iter()
            .find(|t| t.thin_lock_id() == thin_lock_id)
            .cloned()
    }

    /// The live thread whose managed peer is `peer`.
    pub fn find_by_peer(&self, objects: &dyn ObjectModel, peer: ObjectRef) -> Option<Arc<Thread>> {
        let index = objects.get_field(peer, &well_known::THREAD_VM_DATA).as_int()?;
        let index = u32::try_from(index).ok().filter(|index| *index != 0)?;
        self.find_by_index(ThreadIndex(index))
    }
}

pub type ThreadListGuard<'a> = RankedMutexGuard<'a, ThreadListInner>;

pub struct ThreadList {
    inner: RankedMutex<ThreadListInner>,
}

impl ThreadList {
    pub fn new(check_locks: bool, max_thread_id: u32) -> Self {
        Self {
            inner: RankedMutex::new(
                "thread list lock",
                LockLevel::ThreadList,
                check_locks,
                ThreadListInner {
                    threads: Vec::new(),
                    ids: ThreadIdAllocator::new(max_thread_id),
                },
            ),
        }
    }

    pub fn lock(&self) -> ThreadListGuard<'_> {
        self.inner.lock()
    }

    pub(crate) fn try_lock(&self) -> Option<ThreadListGuard<'_>> {
        self.inner.try_lock()
    }

    pub fn alloc_thread_id(&self) -> u32 {
        match self.lock().ids.alloc() {
            Some(id) => id,
            None => fatal!("out of internal thread ids"),
        }
    }

    pub fn release_thread_id(&self, id: u32) {
        if !self.lock().ids.release(id) {
            fatal!("releasing thread id {id} which is not allocated");
        }
    }

    pub fn register(&self, thread: &Arc<Thread>) {
        let mut inner = self.lock();
        if inner.contains(thread) {
            fatal!("thread {thread} registered twice");
        }
        inner.threads.push(Arc::clone(thread));
        tracing::debug!(target: "threads", thread = %thread, count = inner.threads.len(), "registered");
    }

    /// Removes `thread` and frees its thin-lock id.
    pub fn unregister(&self, thread: &Thread) {
        let mut inner = self.lock();
        let Some(position) = inner
            .threads
            .iter()
            .position(|t| std::ptr::eq(Arc::as_ptr(t), thread))
        else {
            fatal!("unregistering {thread} which is not registered");
        };
        inner.threads.swap_remove(position);
        let id = thread.thin_lock_id();
        if !inner.ids.release(id) {
            fatal!("releasing thread id {id} which is not allocated");
        }
        tracing::debug!(target: "threads", thread = %thread, count = inner.threads.len(), "unregistered");
    }

    pub fn contains(&self, thread: &Thread) -> bool {
        self.lock().contains(thread)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn snapshot(&self) -> Vec<Arc<Thread>> {
        self.lock().threads.clone()
    }

    /// Finds the thread for `peer` without keeping the registry locked. Only
    /// a suspended result is stable after the lock is released, so finding a
    /// running thread here is a caller error.
    pub fn find_suspended_by_peer(&self, objects: &dyn ObjectModel, peer: ObjectRef) -> Option<Arc<Thread>> {
        let thread = self.lock().find_by_peer(objects, peer)?;
        if !thread.is_suspended() {
            fatal!("{thread} looked up without the thread list lock while not suspended");
        }
        Some(thread)
    }

    /// Writes the state and stack of every thread.
    pub fn dump(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        let inner = self.lock();
        Self::dump_locked(&inner, out)
    }

    pub(crate) fn dump_locked(inner: &ThreadListInner, out: &mut dyn fmt::Write) -> fmt::Result {
        writeln!(out, "THREADS ({}):", inner.len())?;
        for thread in inner.iter() {
            thread.dump(out)?;
            writeln!(out)?;
        }
        Ok(())
    }

    /// Best-effort dump for fatal paths that may already hold runtime locks.
    pub(crate) fn dump_for_abort(&self) -> String {
        match self.try_lock() {
            Some(inner) => Self::dump_for_abort_locked(&inner),
            None => "(thread list lock unavailable)\n".to_owned(),
        }
    }

    /// Dump for fatal paths whose caller holds the registry lock.
    pub(crate) fn dump_for_abort_locked(inner: &ThreadListInner) -> String {
        let mut out = String::new();
        let _ = Self::dump_locked(inner, &mut out);
        out
    }
}
