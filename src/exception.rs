//! Throwing managed exceptions and delivering them to their handlers.
//!
//! Delivery searches the stack for the innermost frame whose exception table
//! covers the current bytecode offset with a matching catch type. If the
//! search reaches the upcall frame that entered managed code first, the
//! exception is uncaught and goes back to the native caller.
//!
//! The transfer itself is a non-local jump: [`Thread::deliver_exception`]
//! discards the managed frames above the target and unwinds the native stack
//! with a [`LongJump`] payload. The payload lands either in
//! [`catch_long_jump`], wrapped around the code that runs a handler frame, or
//! in [`Thread::invoke_upcall`] when nothing caught the exception.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::Ordering;

use crate::error::{ThreadError, ThreadResult};
use crate::object::{ClassRef, ObjectModel, ObjectRef, Value, pretty_descriptor};
use crate::runtime::RuntimeEvent;
use crate::safepoint::ScopedRunnable;
use crate::stack::{Frame, FrameId, FrameView, Method, StackVisitor, StackWalker, WalkControl, WalkMode};
use crate::thread::Thread;
use crate::well_known;

/// Unwind payload carrying control to a handler or upcall frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LongJump {
    pub target: FrameId,
    /// Machine address execution resumes at. Zero for interpreter frames.
    pub native_pc: usize,
    /// Handler offset, `None` when the target is an upcall frame.
    pub dex_pc: Option<u32>,
}

/// Where a thrown exception will end up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatchSearch {
    /// A managed frame with a matching catch block.
    Handler {
        frame: FrameId,
        method: Arc<Method>,
        dex_pc: u32,
        native_pc: usize,
    },
    /// No handler: the exception returns to the native code that called in.
    Upcall { frame: FrameId, native_pc: usize },
}

impl CatchSearch {
    pub fn frame(&self) -> FrameId {
        match self {
            CatchSearch::Handler { frame, .. } | CatchSearch::Upcall { frame, .. } => *frame,
        }
    }

    pub fn is_handler(&self) -> bool {
        matches!(self, CatchSearch::Handler { .. })
    }
}

struct CatchBlockVisitor<'a> {
    objects: &'a dyn ObjectModel,
    exception_class: ClassRef,
    /// First managed frame: where the exception was thrown.
    throw_site: Option<(Arc<Method>, Option<u32>)>,
    native_frames: usize,
    result: Option<CatchSearch>,
}

impl<'a> CatchBlockVisitor<'a> {
    fn new(objects: &'a dyn ObjectModel, exception_class: ClassRef) -> Self {
        Self {
            objects,
            exception_class,
            throw_site: None,
            native_frames: 0,
            result: None,
        }
    }
}

impl StackVisitor for CatchBlockVisitor<'_> {
    fn visit_frame(&mut self, frame: &FrameView<'_>) -> WalkControl {
        let Some(method) = frame.method() else {
            self.result = Some(CatchSearch::Upcall {
                frame: frame.id(),
                native_pc: frame.native_pc().unwrap_or(0),
            });
            return WalkControl::Stop;
        };
        if method.is_runtime() {
            return WalkControl::Continue;
        }
        if self.throw_site.is_none() {
            self.throw_site = Some((Arc::clone(method), frame.dex_pc()));
        }
        if method.is_native() {
            self.native_frames += 1;
            return WalkControl::Continue;
        }
        let Some(dex_pc) = frame.dex_pc() else {
            return WalkControl::Continue;
        };
        let Some(handler_pc) = method.find_catch_block(self.objects, self.exception_class, dex_pc) else {
            return WalkControl::Continue;
        };
        let native_pc = match frame.frame() {
            Frame::Quick(_) => frame.code().native_pc_for_dex_pc(method, handler_pc),
            Frame::Shadow(_) | Frame::Upcall(_) => 0,
        };
        self.result = Some(CatchSearch::Handler {
            frame: frame.id(),
            method: Arc::clone(method),
            dex_pc: handler_pc,
            native_pc,
        });
        WalkControl::Stop
    }
}

/// Runs `body`, which executes the frame `frame`, and returns the long jump
/// that brought control back to that frame, if any. Jumps to other frames
/// and ordinary panics keep unwinding.
pub fn catch_long_jump<R>(frame: FrameId, body: impl FnOnce() -> R) -> Result<R, LongJump> {
    match panic::catch_unwind(AssertUnwindSafe(body)) {
        Ok(value) => Ok(value),
        Err(payload) => match payload.downcast::<LongJump>() {
            Ok(jump) if jump.target == frame => Err(*jump),
            Ok(jump) => panic::resume_unwind(jump),
            Err(payload) => panic::resume_unwind(payload),
        },
    }
}

impl Thread {
    /// Finds where `exception` would be delivered from the current stack,
    /// without transferring control.
    ///
    /// `None` if the stack has neither a handler nor an upcall frame.
    pub fn find_catch_block(&self, exception: ObjectRef) -> Option<CatchSearch> {
        let runtime = self.runtime();
        let objects = runtime.objects();
        let mut visitor = CatchBlockVisitor::new(objects, objects.class_of(exception));
        let stack = self.managed_stack.lock();
        StackWalker::new(&stack, runtime.code())
            .mode(WalkMode::IncludeTransitions)
            .walk(&mut visitor);
        visitor.result
    }

    /// Transfers control to the handler of the pending exception, or back to
    /// the native caller if no managed frame catches it. Never returns.
    pub fn deliver_exception(&self) -> ! {
        let Some(exception) = self.exception() else {
            fatal!("{self} asked to deliver an exception with none pending");
        };
        self.clear_exception();
        let runtime = self.runtime();
        let objects = runtime.objects();

        let previous_cause = self.start_assert_no_thread_suspension("Finding catch block");
        let mut context = self.take_long_jump_context();
        let mut visitor = CatchBlockVisitor::new(objects, objects.class_of(exception));
        {
            let stack = self.managed_stack.lock();
            StackWalker::new(&stack, runtime.code())
                .mode(WalkMode::IncludeTransitions)
                .with_context(&mut context)
                .walk(&mut visitor);
        }
        let Some(target) = visitor.result.take() else {
            fatal!("no handler and no upcall frame for exception {exception} on {self}");
        };

        let (throw_method, throw_dex_pc) = match &visitor.throw_site {
            Some((method, dex_pc)) => (Some(method.pretty_name()), *dex_pc),
            None => (None, None),
        };
        let (catch_method, catch_dex_pc) = match &target {
            CatchSearch::Handler { method, dex_pc, .. } => (Some(method.pretty_name()), Some(*dex_pc)),
            CatchSearch::Upcall { .. } => (None, None),
        };
        tracing::debug!(
            target: "threads",
            thread = %self,
            %exception,
            throw_method = throw_method.as_deref().unwrap_or("<none>"),
            catch_method = catch_method.as_deref().unwrap_or("<upcall>"),
            native_frames = visitor.native_frames,
            "delivering exception"
        );
        runtime.post_event(RuntimeEvent::ExceptionThrown {
            thin_lock_id: self.thin_lock_id(),
            exception,
            throw_method,
            throw_dex_pc,
            catch_method,
            catch_dex_pc,
        });

        // The handler frame roots the exception again from here on.
        self.set_exception(exception);
        self.end_assert_no_thread_suspension(previous_cause);

        let jump = match &target {
            CatchSearch::Handler {
                frame,
                dex_pc,
                native_pc,
                ..
            } => LongJump {
                target: *frame,
                native_pc: *native_pc,
                dex_pc: Some(*dex_pc),
            },
            CatchSearch::Upcall { frame, native_pc } => LongJump {
                target: *frame,
                native_pc: *native_pc,
                dex_pc: None,
            },
        };

        let discarded = {
            let mut stack = self.managed_stack.lock();
            let target_is_shadow = matches!(stack.frame(jump.target), Some(Frame::Shadow(_)));
            if jump.native_pc == 0 && !target_is_shadow {
                fatal!("long jump to {} on {self} with a null pc", jump.target);
            }
            context.set_sp(jump.target.0 as usize);
            context.set_pc(jump.native_pc);
            context.smash_caller_saves();

            let discarded = stack.unwind_to(jump.target);
            match (stack.top_mut(), jump.dex_pc) {
                (Some(Frame::Quick(frame)), Some(_)) => frame.native_pc = jump.native_pc,
                (Some(Frame::Shadow(frame)), Some(dex_pc)) => frame.dex_pc = dex_pc,
                _ => {}
            }
            discarded
        };
        self.pop_scopes_owned_by(&discarded);
        self.release_long_jump_context(context);

        panic::resume_unwind(Box::new(jump))
    }

    fn pop_scopes_owned_by(&self, discarded: &[FrameId]) {
        let mut scopes = self.scopes.lock();
        while scopes
            .last()
            .and_then(|scope| scope.owner())
            .is_some_and(|owner| discarded.contains(&owner))
        {
            scopes.pop();
        }
    }

    /// Calls into managed code from native code.
    ///
    /// Pushes an upcall frame returning to `return_pc`, runs `body`, and pops
    /// every frame down to and including the upcall frame. An exception no
    /// managed frame caught is reported as
    /// [`ThreadError::UncaughtException`] and stays pending.
    pub fn invoke_upcall<R>(&self, return_pc: usize, body: impl FnOnce(&Thread) -> R) -> ThreadResult<R> {
        let frame = self.managed_stack.lock().push_upcall(return_pc);
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| body(self)));
        self.managed_stack.lock().unwind_past(frame);

        match outcome {
            Ok(value) => Ok(value),
            Err(payload) => match payload.downcast::<LongJump>() {
                Ok(jump) if jump.target == frame => match self.exception() {
                    Some(exception) => Err(ThreadError::UncaughtException(exception)),
                    None => fatal!("{self} returned to its upcall without a pending exception"),
                },
                Ok(jump) => panic::resume_unwind(jump),
                Err(payload) => panic::resume_unwind(payload),
            },
        }
    }

    /// Throws a new instance of the class `descriptor` with `message`.
    /// No exception may be pending.
    pub fn throw_new_exception(&self, descriptor: &str, message: Option<&str>) {
        self.assert_no_pending_exception();
        self.throw_new_wrapped_exception(descriptor, message);
    }

    pub fn throw_new_exception_fmt(&self, descriptor: &str, args: fmt::Arguments<'_>) {
        let message = args.to_string();
        self.throw_new_exception(descriptor, Some(&message));
    }

    /// Throws a new instance of `descriptor` whose cause is the exception
    /// currently pending, if any.
    pub fn throw_new_wrapped_exception(&self, descriptor: &str, message: Option<&str>) {
        if !(descriptor.len() > 2 && descriptor.starts_with('L') && descriptor.ends_with(';')) {
            fatal!("exception class descriptor {descriptor:?} is not a class descriptor");
        }
        let cause = self.exception();
        self.clear_exception();

        let runtime = self.runtime();
        let objects = runtime.objects();
        let _runnable = ScopedRunnable::new(self);
        let Some(class) = objects.find_class(descriptor) else {
            fatal!("exception class {descriptor} is not loaded");
        };
        let Some(exception) = self.alloc_object(class) else {
            // An OutOfMemoryError is pending instead.
            return;
        };
        let message = message.and_then(|message| objects.new_string(message));

        if !runtime.is_started() {
            // No managed code yet: fill in what the constructor would.
            objects.set_field(exception, &well_known::THROWABLE_DETAIL_MESSAGE, Value::Object(message));
            objects.set_field(exception, &well_known::THROWABLE_CAUSE, Value::Object(cause));
            self.set_exception(exception);
            return;
        }

        objects.invoke(
            self,
            exception,
            &well_known::THROWABLE_INIT,
            &[Value::Object(message), Value::Object(cause)],
        );
        // A constructor that threw leaves its own exception pending.
        if !self.is_exception_pending() {
            self.set_exception(exception);
        }
    }

    /// Throws an OutOfMemoryError. If that allocation fails too, the
    /// runtime's pre-allocated instance is thrown instead.
    pub fn throw_out_of_memory_error(&self, message: &str) {
        let recursive = self.throwing_oom.swap(true, Ordering::AcqRel);
        tracing::error!(
            target: "threads",
            thread = %self,
            "Throwing OutOfMemoryError \"{message}\"{}",
            if recursive { " (recursive case)" } else { "" }
        );
        if recursive {
            // The pre-allocated error has no stack trace; log one instead.
            let mut dump = String::new();
            let _ = self.dump(&mut dump);
            tracing::error!(target: "threads", "{dump}");
            let Some(oom) = self.runtime().preallocated_out_of_memory_error() else {
                fatal!("out of memory before the runtime pre-allocated its OutOfMemoryError");
            };
            self.set_exception(oom);
        } else {
            self.throw_new_exception(well_known::OUT_OF_MEMORY_ERROR, Some(message));
        }
        self.throwing_oom.store(false, Ordering::Release);
    }

    /// Allocates an instance of `class`, leaving an OutOfMemoryError pending
    /// on failure. Allocation may suspend for the collector.
    pub fn alloc_object(&self, class: ClassRef) -> Option<ObjectRef> {
        self.assert_thread_suspension_is_allowable(true);
        let runtime = self.runtime();
        let objects = runtime.objects();
        let object = objects.alloc_object(class);
        if object.is_none() {
            let pretty = pretty_descriptor(&objects.class_descriptor(class));
            self.throw_out_of_memory_error(&format!("Failed to allocate a {pretty} instance"));
        }
        object
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference::ReferenceScope;
    use crate::stack::CatchHandler;
    use crate::test_utils::{attach_main, test_runtime};

    const RUNTIME_EXCEPTION: &str = "Ljava/lang/RuntimeException;";
    const ILLEGAL_STATE: &str = "Ljava/lang/IllegalStateException;";

    fn catching(name: &str, catch_type: Option<ClassRef>, handler_pc: u32) -> Arc<Method> {
        Arc::new(
            Method::new(name, ClassRef(50), "Lcom/example/App;").with_catch_handler(CatchHandler {
                start_pc: 0,
                end_pc: 16,
                catch_type,
                handler_pc,
            }),
        )
    }

    fn plain(name: &str) -> Arc<Method> {
        Arc::new(Method::new(name, ClassRef(50), "Lcom/example/App;"))
    }

    #[test]
    fn outermost_matching_frame_is_found_past_non_matching_ones() {
        let (runtime, objects, _) = test_runtime();
        let thread = attach_main(&runtime);
        let runtime_exception = objects.find_class(RUNTIME_EXCEPTION).unwrap();
        let unrelated = objects.find_class(well_known::OUT_OF_MEMORY_ERROR).unwrap();
        let exception = objects.new_instance(ILLEGAL_STATE);

        let (upcall, outer) = thread.with_managed_stack(|stack| {
            let upcall = stack.push_upcall(0x10);
            let outer = stack.push_shadow(catching("outer", Some(runtime_exception), 40), 3, Vec::new());
            stack.push_shadow(catching("middle", Some(unrelated), 30), 3, Vec::new());
            stack.push_shadow(plain("inner"), 3, Vec::new());
            (upcall, outer)
        });

        let search = thread.find_catch_block(exception).unwrap();
        assert_eq!(search.frame(), outer);
        assert!(matches!(search, CatchSearch::Handler { dex_pc: 40, .. }));

        let error = objects.new_instance(well_known::OUT_OF_MEMORY_ERROR);
        assert!(matches!(thread.find_catch_block(error), Some(CatchSearch::Handler { dex_pc: 30, .. })));

        thread.with_managed_stack(|stack| stack.unwind_past(upcall));
        runtime.detach_current_thread();
    }

    #[test]
    fn innermost_of_two_matching_frames_wins() {
        let (runtime, objects, _) = test_runtime();
        let thread = attach_main(&runtime);
        let exception = objects.new_instance(RUNTIME_EXCEPTION);

        let inner = thread.with_managed_stack(|stack| {
            stack.push_upcall(0x10);
            stack.push_shadow(catching("outer", None, 8), 1, Vec::new());
            stack.push_shadow(catching("inner", None, 12), 1, Vec::new())
        });
        assert_eq!(thread.find_catch_block(exception).map(|search| search.frame()), Some(inner));
        runtime.detach_current_thread();
    }

    #[test]
    fn uncovered_pc_and_runtime_frames_fall_through_to_the_upcall() {
        let (runtime, objects, _) = test_runtime();
        let thread = attach_main(&runtime);
        let exception = objects.new_instance(RUNTIME_EXCEPTION);

        let upcall = thread.with_managed_stack(|stack| {
            let upcall = stack.push_upcall(0x77);
            stack.push_shadow(catching("outer", None, 8), 16, Vec::new());
            stack.push_quick(Arc::new(Method::runtime("resolution")), 0x20, Vec::new(), Vec::new());
            upcall
        });
        assert_eq!(
            thread.find_catch_block(exception),
            Some(CatchSearch::Upcall {
                frame: upcall,
                native_pc: 0x77
            })
        );
        runtime.detach_current_thread();
    }

    #[test]
    fn delivery_lands_in_the_handler_frame() {
        let (runtime, objects, _) = test_runtime();
        let thread = attach_main(&runtime);
        runtime.finish_startup(objects.new_thread_group("main")).unwrap();
        let events = runtime.events();
        let _ = events.drain().count();
        let runtime_exception = objects.find_class(RUNTIME_EXCEPTION).unwrap();
        let runnable = ScopedRunnable::new(&thread);

        let result = thread.invoke_upcall(0x10, |thread| {
            let handler_frame =
                thread.with_managed_stack(|stack| stack.push_shadow(catching("guarded", Some(runtime_exception), 20), 4, Vec::new()));
            let jump = catch_long_jump(handler_frame, || {
                let thrower = thread.with_managed_stack(|stack| stack.push_shadow(plain("thrower"), 2, Vec::new()));
                thread.push_reference_scope(ReferenceScope::owned_by(4, thrower));
                thread.throw_new_exception(ILLEGAL_STATE, Some("boom"));
                thread.deliver_exception();
            })
            .unwrap_err();

            assert_eq!(jump.target, handler_frame);
            assert_eq!(jump.dex_pc, Some(20));
            thread.with_managed_stack(|stack| match stack.top() {
                Some(Frame::Shadow(frame)) => {
                    assert_eq!(frame.id, handler_frame);
                    assert_eq!(frame.dex_pc, 20);
                }
                other => panic!("unexpected top frame {other:?}"),
            });
            assert!(thread.pop_reference_scope().is_none());

            let exception = thread.exception().unwrap();
            assert_eq!(objects.descriptor_of(exception), ILLEGAL_STATE);
            assert_eq!(
                objects.string_field(exception, &well_known::THROWABLE_DETAIL_MESSAGE).as_deref(),
                Some("boom")
            );
            thread.clear_exception();
            7
        });

        assert_eq!(result, Ok(7));
        assert!(thread.with_managed_stack(|stack| stack.is_empty()));
        let thrown = events
            .drain()
            .find_map(|event| match event {
                RuntimeEvent::ExceptionThrown {
                    throw_method,
                    catch_method,
                    catch_dex_pc,
                    ..
                } => Some((throw_method, catch_method, catch_dex_pc)),
                _ => None,
            })
            .unwrap();
        assert_eq!(
            thrown,
            (
                Some("com.example.App.thrower".to_owned()),
                Some("com.example.App.guarded".to_owned()),
                Some(20)
            )
        );
        drop(runnable);
        runtime.detach_current_thread();
    }

    #[test]
    fn uncaught_exception_returns_to_the_native_caller() {
        let (runtime, objects, _) = test_runtime();
        let thread = attach_main(&runtime);
        let runnable = ScopedRunnable::new(&thread);

        let result: ThreadResult<()> = thread.invoke_upcall(0x10, |thread| {
            thread.with_managed_stack(|stack| stack.push_shadow(plain("run"), 0, Vec::new()));
            thread.throw_new_exception(RUNTIME_EXCEPTION, None);
            thread.deliver_exception();
        });

        let exception = thread.exception().unwrap();
        assert_eq!(result, Err(ThreadError::UncaughtException(exception)));
        assert_eq!(objects.descriptor_of(exception), RUNTIME_EXCEPTION);
        assert!(thread.with_managed_stack(|stack| stack.is_empty()));
        thread.clear_exception();
        drop(runnable);
        runtime.detach_current_thread();
    }

    #[test]
    fn wrapped_exception_takes_the_pending_one_as_cause() {
        let (runtime, objects, _) = test_runtime();
        let thread = attach_main(&runtime);
        runtime.finish_startup(objects.new_thread_group("main")).unwrap();

        thread.throw_new_exception_fmt(RUNTIME_EXCEPTION, format_args!("code {}", 3));
        let cause = thread.exception().unwrap();
        thread.throw_new_wrapped_exception(ILLEGAL_STATE, None);
        let wrapper = thread.exception().unwrap();

        assert_ne!(wrapper, cause);
        assert_eq!(objects.get_field(wrapper, &well_known::THROWABLE_CAUSE).as_object(), Some(cause));
        assert_eq!(
            objects.string_field(cause, &well_known::THROWABLE_DETAIL_MESSAGE).as_deref(),
            Some("code 3")
        );
        thread.clear_exception();
        runtime.detach_current_thread();
    }

    #[test]
    #[should_panic(expected = "no pending exception expected")]
    fn throwing_over_a_pending_exception_is_fatal() {
        let (runtime, _, _) = test_runtime();
        let thread = attach_main(&runtime);
        thread.throw_new_exception(RUNTIME_EXCEPTION, None);
        thread.throw_new_exception(RUNTIME_EXCEPTION, None);
    }

    #[test]
    fn exhausted_heap_falls_back_to_the_preallocated_error() {
        let (runtime, objects, _) = test_runtime();
        let thread = attach_main(&runtime);
        runtime.finish_startup(objects.new_thread_group("main")).unwrap();
        let preallocated = runtime.preallocated_out_of_memory_error().unwrap();

        objects.set_fail_allocations(true);
        let class = objects.find_class(well_known::OBJECT).unwrap();
        assert_eq!(thread.alloc_object(class), None);
        objects.set_fail_allocations(false);

        assert_eq!(thread.exception(), Some(preallocated));
        assert!(!thread.throwing_oom.load(Ordering::Relaxed));
        thread.clear_exception();
        runtime.detach_current_thread();
    }

    #[test]
    fn landing_pad_ignores_jumps_to_other_frames() {
        let jump = LongJump {
            target: FrameId(9),
            native_pc: 0x40,
            dex_pc: None,
        };
        let outer = catch_long_jump(FrameId(9), || {
            let inner = catch_long_jump(FrameId(3), || -> u32 { panic::resume_unwind(Box::new(jump)) });
            unreachable!("inner landing pad returned {inner:?}");
        });
        assert_eq!(outer, Err(jump));
    }
}
