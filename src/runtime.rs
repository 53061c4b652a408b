//! The process-scoped owner of all thread-management state.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_utils::atomic::AtomicCell;

use crate::config::RuntimeConfig;
use crate::error::{ThreadError, ThreadResult};
use crate::locks::Locks;
use crate::object::{ObjectModel, ObjectRef, Value};
use crate::reference::ReferenceTables;
use crate::stack::CodeIntrospection;
use crate::thread::{Thread, ThreadState};
use crate::thread_list::ThreadList;
use crate::well_known;

/// Notifications for debugger-style observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeEvent {
    ThreadStarted {
        thin_lock_id: u32,
        name: String,
    },
    ThreadDied {
        thin_lock_id: u32,
    },
    ThreadRenamed {
        thin_lock_id: u32,
        name: String,
    },
    ExceptionThrown {
        thin_lock_id: u32,
        exception: ObjectRef,
        throw_method: Option<String>,
        throw_dex_pc: Option<u32>,
        catch_method: Option<String>,
        catch_dex_pc: Option<u32>,
    },
}

const EVENT_CAPACITY: usize = 1024;

/// Owns the global locks, the thread registry and the global reference
/// tables, together with the embedder's object model and code metadata.
pub struct Runtime {
    config: RuntimeConfig,
    locks: Locks,
    thread_list: ThreadList,
    references: ReferenceTables,
    objects: Arc<dyn ObjectModel>,
    code: Arc<dyn CodeIntrospection>,
    started: AtomicBool,
    shutting_down: AtomicBool,
    main_thread_group: AtomicCell<Option<ObjectRef>>,
    preallocated_oom: AtomicCell<Option<ObjectRef>>,
    events_tx: flume::Sender<RuntimeEvent>,
    events_rx: flume::Receiver<RuntimeEvent>,
}

impl Runtime {
    pub fn new(
        config: RuntimeConfig,
        objects: Arc<dyn ObjectModel>,
        code: Arc<dyn CodeIntrospection>,
    ) -> Arc<Runtime> {
        let check = config.check_locks;
        let (events_tx, events_rx) = flume::bounded(EVENT_CAPACITY);
        tracing::debug!(target: "threads", ?config, "runtime created");
        Arc::new(Runtime {
            locks: Locks::new(check),
            thread_list: ThreadList::new(check, config.max_thread_id),
            references: ReferenceTables::new(check),
            config,
            objects,
            code,
            started: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            main_thread_group: AtomicCell::new(None),
            preallocated_oom: AtomicCell::new(None),
            events_tx,
            events_rx,
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn locks(&self) -> &Locks {
        &self.locks
    }

    pub fn thread_list(&self) -> &ThreadList {
        &self.thread_list
    }

    pub fn references(&self) -> &ReferenceTables {
        &self.references
    }

    pub fn objects(&self) -> &dyn ObjectModel {
        self.objects.as_ref()
    }

    pub fn code(&self) -> &dyn CodeIntrospection {
        self.code.as_ref()
    }

    /// Managed code may run once this is true.
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    pub fn main_thread_group(&self) -> Option<ObjectRef> {
        self.main_thread_group.load()
    }

    pub fn preallocated_out_of_memory_error(&self) -> Option<ObjectRef> {
        self.preallocated_oom.load()
    }

    /// Completes startup once the core library is usable: records the main
    /// thread group, pre-allocates the OutOfMemoryError thrown when the heap
    /// cannot even hold an exception, and gives the calling thread a managed
    /// peer if it has none yet.
    pub fn finish_startup(self: &Arc<Self>, main_thread_group: ObjectRef) -> ThreadResult<()> {
        self.main_thread_group.store(Some(main_thread_group));

        let Some(oom_class) = self.objects.find_class(well_known::OUT_OF_MEMORY_ERROR) else {
            fatal!("class {} is not loaded", well_known::OUT_OF_MEMORY_ERROR);
        };
        let Some(oom) = self.objects.alloc_object(oom_class) else {
            fatal!("could not pre-allocate OutOfMemoryError");
        };
        let message = self.objects.new_string("[memory exhausted while throwing]");
        self.objects
            .set_field(oom, &well_known::THROWABLE_DETAIL_MESSAGE, Value::Object(message));
        self.preallocated_oom.store(Some(oom));

        self.started.store(true, Ordering::Release);
        tracing::debug!(target: "threads", "runtime started");

        if let Some(thread) = Thread::current() {
            if thread.peer().is_none() {
                let name = thread.name();
                thread.create_peer(Some(name.as_str()), thread.is_daemon(), Some(main_thread_group));
                if thread.is_exception_pending() {
                    return Err(ThreadError::PeerCreation);
                }
            }
        }
        Ok(())
    }

    /// Stops new managed work from starting. Threads still attached are
    /// left to detach themselves.
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
        let remaining = self.thread_list.len();
        tracing::debug!(target: "threads", remaining, "runtime shutting down");
    }

    /// Tears down the calling thread's entity: runs the managed-side
    /// destruction, removes it from the registry and clears the thread-local
    /// self pointer.
    pub fn detach_current_thread(&self) {
        let Some(thread) = Thread::current() else {
            fatal!("detach requested by a native thread that is not attached");
        };
        thread.destroy();
        self.thread_list.unregister(&thread);

        {
            let _guard = self.locks.thread_suspend_count.lock();
            if thread.state() == ThreadState::Runnable {
                fatal!("detaching {thread} while it is still runnable");
            }
            thread.set_state_unsafe(ThreadState::Terminated);
        }
        Thread::set_current(None);
        tracing::debug!(target: "threads", thread = %thread, "detached");
    }

    /// Subscribes to runtime events. Events are dropped when no one drains
    /// the channel.
    pub fn events(&self) -> flume::Receiver<RuntimeEvent> {
        self.events_rx.clone()
    }

    pub(crate) fn post_event(&self, event: RuntimeEvent) {
        if let Err(flume::TrySendError::Full(event)) = self.events_tx.try_send(event) {
            // Full: drop the oldest so recent history survives.
            let _ = self.events_rx.try_recv();
            let _ = self.events_tx.try_send(event);
        }
    }

    /// Visits roots held outside any thread: global references and the
    /// pre-allocated OutOfMemoryError.
    pub fn visit_roots(&self, visitor: &mut dyn FnMut(ObjectRef)) {
        self.references.visit_roots(visitor);
        if let Some(oom) = self.preallocated_oom.load() {
            visitor(oom);
        }
        if let Some(group) = self.main_thread_group.load() {
            visitor(group);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{attach_main, test_runtime};

    #[test]
    fn finish_startup_preallocates_oom_and_peers_main() {
        let (runtime, objects, _) = test_runtime();
        let main = attach_main(&runtime);
        assert!(main.peer().is_none());

        let group = objects.new_thread_group("main");
        runtime.finish_startup(group).unwrap();

        assert!(runtime.is_started());
        let oom = runtime.preallocated_out_of_memory_error().unwrap();
        assert_eq!(objects.descriptor_of(oom), well_known::OUT_OF_MEMORY_ERROR);
        let peer = main.peer().expect("main thread gets a peer");
        assert_eq!(objects.string_field(peer, &well_known::THREAD_NAME).as_deref(), Some("main"));

        let mut roots = Vec::new();
        runtime.visit_roots(&mut |root| roots.push(root));
        assert!(roots.contains(&oom));
        assert!(roots.contains(&group));

        runtime.detach_current_thread();
    }

    #[test]
    fn events_are_bounded() {
        let (runtime, _, _) = test_runtime();
        for id in 0..(EVENT_CAPACITY as u32 + 10) {
            runtime.post_event(RuntimeEvent::ThreadDied { thin_lock_id: id });
        }
        let events: Vec<_> = runtime.events().drain().collect();
        assert_eq!(events.len(), EVENT_CAPACITY);
    }
}
