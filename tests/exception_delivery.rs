use std::sync::Arc;

use vmthread::object::ObjectModel;
use vmthread::stack::{CatchHandler, Frame, Method, MethodFlags};
use vmthread::test_utils::{attach_main, test_runtime};
use vmthread::{
    CatchSearch, ClassRef, CodeIntrospection, LongJump, ScopedRunnable, ThreadError, ThreadResult, catch_long_jump,
    well_known,
};

const RUNTIME_EXCEPTION: &str = "Ljava/lang/RuntimeException;";
const ILLEGAL_STATE: &str = "Ljava/lang/IllegalStateException;";
const APP: &str = "Lorg/sample/Service;";

fn guarded(name: &str, catch_type: ClassRef, handler_pc: u32) -> Arc<Method> {
    Arc::new(Method::new(name, ClassRef(60), APP).with_catch_handler(CatchHandler {
        start_pc: 0,
        end_pc: 10,
        catch_type: Some(catch_type),
        handler_pc,
    }))
}

#[test]
fn exception_escaping_a_reentrant_call_is_caught_further_out() {
    let (runtime, objects, _) = test_runtime();
    let thread = attach_main(&runtime);
    runtime.finish_startup(objects.new_thread_group("main")).unwrap();
    let runtime_exception = objects.find_class(RUNTIME_EXCEPTION).unwrap();
    let runnable = ScopedRunnable::new(&thread);

    let outcome = thread.invoke_upcall(0x10, |thread| {
        let handler_frame = thread.with_managed_stack(|stack| {
            stack.push_shadow(guarded("dispatch", runtime_exception, 24), 4, Vec::new())
        });
        let landed: Result<(), LongJump> = catch_long_jump(handler_frame, || {
            let bridge = Arc::new(Method::new("bridge", ClassRef(60), APP).with_flags(MethodFlags::NATIVE));
            thread.with_managed_stack(|stack| stack.push_quick(bridge, 0x3000, Vec::new(), Vec::new()));

            let inner: ThreadResult<()> = thread.invoke_upcall(0x30, |thread| {
                let callback = Arc::new(Method::new("callback", ClassRef(60), APP));
                thread.with_managed_stack(|stack| stack.push_shadow(callback, 1, Vec::new()));
                thread.throw_new_exception(ILLEGAL_STATE, Some("rejected"));
                thread.deliver_exception()
            });
            let pending = thread.exception().unwrap();
            assert_eq!(inner, Err(ThreadError::UncaughtException(pending)));
            thread.with_managed_stack(|stack| {
                assert!(matches!(stack.top(), Some(Frame::Quick(frame)) if frame.method.name == "bridge"));
            });

            // The native method returns with the exception still pending.
            thread.deliver_exception()
        });
        let jump = landed.unwrap_err();

        assert_eq!(jump.target, handler_frame);
        assert_eq!(jump.dex_pc, Some(24));
        let exception = thread.exception().unwrap();
        assert_eq!(objects.descriptor_of(exception), ILLEGAL_STATE);
        assert_eq!(
            objects
                .string_field(exception, &well_known::THROWABLE_DETAIL_MESSAGE)
                .as_deref(),
            Some("rejected")
        );
        thread.clear_exception();
        "recovered"
    });

    assert_eq!(outcome, Ok("recovered"));
    assert!(thread.with_managed_stack(|stack| stack.is_empty()));
    drop(runnable);
    runtime.detach_current_thread();
}

#[test]
fn wrapped_exceptions_chain_their_causes() {
    let (runtime, objects, _) = test_runtime();
    let thread = attach_main(&runtime);
    runtime.finish_startup(objects.new_thread_group("main")).unwrap();

    thread.throw_new_exception_fmt(ILLEGAL_STATE, format_args!("bad state {}", 3));
    let first = thread.exception().unwrap();
    thread.throw_new_wrapped_exception(RUNTIME_EXCEPTION, Some("wrapper"));
    let second = thread.exception().unwrap();

    assert_ne!(first, second);
    assert_eq!(
        objects.get_field(second, &well_known::THROWABLE_CAUSE).as_object(),
        Some(first)
    );
    assert_eq!(
        objects.string_field(first, &well_known::THROWABLE_DETAIL_MESSAGE).as_deref(),
        Some("bad state 3")
    );
    assert_eq!(objects.invocation_count(&well_known::THROWABLE_INIT), 2);

    thread.clear_exception();
    runtime.detach_current_thread();
}

#[test]
fn exceptions_thrown_before_startup_are_built_without_managed_code() {
    let (runtime, objects, _) = test_runtime();
    let thread = attach_main(&runtime);

    thread.throw_new_exception(RUNTIME_EXCEPTION, Some("early"));
    let exception = thread.exception().unwrap();
    assert_eq!(objects.invocation_count(&well_known::THROWABLE_INIT), 0);
    assert_eq!(
        objects
            .string_field(exception, &well_known::THROWABLE_DETAIL_MESSAGE)
            .as_deref(),
        Some("early")
    );
    assert_eq!(objects.get_field(exception, &well_known::THROWABLE_CAUSE).as_object(), None);

    thread.clear_exception();
    runtime.detach_current_thread();
}

#[test]
fn catch_search_does_not_touch_the_stack() {
    let (runtime, objects, code) = test_runtime();
    let thread = attach_main(&runtime);
    let runtime_exception = objects.find_class(RUNTIME_EXCEPTION).unwrap();
    let exception = objects.new_instance(ILLEGAL_STATE);

    let compiled = guarded("poll", runtime_exception, 6);
    let frame = thread.with_managed_stack(|stack| {
        stack.push_upcall(0x10);
        stack.push_quick(Arc::clone(&compiled), 0x1008, Vec::new(), Vec::new())
    });

    let search = thread.find_catch_block(exception).unwrap();
    assert!(search.is_handler());
    match search {
        CatchSearch::Handler { frame: found, dex_pc, native_pc, .. } => {
            assert_eq!(found, frame);
            assert_eq!(dex_pc, 6);
            assert_eq!(native_pc, code.native_pc_for_dex_pc(&compiled, 6));
        }
        CatchSearch::Upcall { .. } => unreachable!(),
    }
    assert_eq!(thread.with_managed_stack(|stack| stack.depth()), 2);
    assert!(!thread.is_exception_pending());

    thread.with_managed_stack(|stack| while stack.pop().is_some() {});
    runtime.detach_current_thread();
}

#[test]
#[should_panic(expected = "no pending exception expected")]
fn throwing_over_a_pending_exception_is_fatal() {
    let (runtime, objects, _) = test_runtime();
    let thread = attach_main(&runtime);
    thread.set_exception(objects.new_instance(RUNTIME_EXCEPTION));
    thread.throw_new_exception(ILLEGAL_STATE, None);
}
