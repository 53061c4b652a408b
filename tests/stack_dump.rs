use std::sync::Arc;

use vmthread::stack::{Method, MethodFlags};
use vmthread::test_utils::{attach_main, test_runtime};
use vmthread::trace::StackTraceElement;
use vmthread::{ClassRef, ScopedRunnable, Thread, ThreadState, well_known};

const APP: &str = "Lorg/sample/Poller;";

#[test]
fn started_thread_dump_names_its_group_and_locks() {
    let (runtime, objects, code) = test_runtime();
    let main = attach_main(&runtime);
    runtime.finish_startup(objects.new_thread_group("system")).unwrap();
    let peer = main.peer().unwrap();

    let lock = objects.new_instance(well_known::OBJECT);
    main.jni_monitor_enter(lock);
    let poll = Arc::new(Method::new("poll", ClassRef(60), APP).with_source_file("Poller.java"));
    code.set_line_table(&poll, &[(0, 30), (4, 31)]);
    main.with_managed_stack(|stack| {
        stack.push_upcall(0x10);
        stack.push_shadow(Arc::clone(&poll), 5, Vec::new());
    });

    let mut out = String::new();
    {
        let _runnable = ScopedRunnable::new(&main);
        main.dump(&mut out).unwrap();
    }
    let lines: Vec<&str> = out.lines().collect();
    assert!(lines[0].starts_with("\"main\" prio="), "{out}");
    assert!(lines[0].ends_with(" tid=1 Runnable"), "{out}");
    assert!(
        lines[1].starts_with(&format!("  | group=\"system\" sCount=0 dsCount=0 obj={peer} self=")),
        "{out}"
    );
    assert!(out.contains("  at org.sample.Poller.poll(Poller.java:31)\n"), "{out}");
    assert!(
        out.contains(&format!("  - locked <{lock}> (a java.lang.Object)\n")),
        "{out}"
    );

    main.with_managed_stack(|stack| while stack.pop().is_some() {});
    assert!(main.jni_monitor_exit(lock));
    runtime.detach_current_thread();
}

#[test]
fn daemon_threads_are_flagged() {
    let (runtime, objects, _) = test_runtime();
    let _main = attach_main(&runtime);
    runtime.finish_startup(objects.new_thread_group("main")).unwrap();

    let (tx, rx) = flume::bounded(1);
    let (done_tx, done_rx) = flume::bounded::<()>(1);
    let handle = {
        let runtime = Arc::clone(&runtime);
        std::thread::spawn(move || {
            let thread = Thread::attach(&runtime, Some("finalizer"), true, None).unwrap();
            tx.send(Arc::clone(&thread)).unwrap();
            done_rx.recv().unwrap();
            runtime.detach_current_thread();
        })
    };
    let daemon = rx.recv().unwrap();

    let mut out = String::new();
    daemon.dump_state(&mut out).unwrap();
    let header = out.lines().next().unwrap();
    assert!(header.starts_with("\"finalizer\" daemon prio="), "{out}");
    assert!(header.ends_with(" tid=2 Native"), "{out}");

    let short = daemon.to_string();
    assert!(short.starts_with("Thread[2,tid="), "{short}");
    assert!(short.ends_with(",\"finalizer\"]"), "{short}");

    done_tx.send(()).unwrap();
    handle.join().unwrap();
    assert_eq!(daemon.state(), ThreadState::Terminated);
    runtime.detach_current_thread();
}

#[test]
fn captured_traces_resolve_to_printable_elements() {
    let (runtime, _, code) = test_runtime();
    let thread = attach_main(&runtime);

    let run = Arc::new(Method::new("run", ClassRef(60), APP).with_source_file("Poller.java"));
    code.set_line_table(&run, &[(0, 12)]);
    let select = Arc::new(Method::new("select", ClassRef(61), "Lorg/sample/Selector;").with_flags(MethodFlags::NATIVE));
    let anonymous = Arc::new(Method::new("lambda$0", ClassRef(62), "Lorg/sample/Task;"));
    thread.with_managed_stack(|stack| {
        stack.push_shadow(Arc::clone(&run), 2, Vec::new());
        stack.push_shadow(anonymous, 0, Vec::new());
        stack.push_quick(select, 0x4000, Vec::new(), Vec::new());
    });

    let trace = thread.create_internal_stack_trace();
    assert_eq!(thread.stack_depth(), 3);
    let elements = runtime.internal_stack_trace_to_elements(&trace, None);
    let printed: Vec<String> = elements.iter().map(StackTraceElement::to_string).collect();
    assert_eq!(
        printed,
        [
            "org.sample.Selector.select(Native Method)",
            "org.sample.Task.lambda$0(Unknown Source)",
            "org.sample.Poller.run(Poller.java:12)",
        ]
    );
    assert!(elements[0].is_native_method());

    let truncated = runtime.internal_stack_trace_to_elements(&trace, Some(1));
    assert_eq!(truncated.len(), 1);

    thread.with_managed_stack(|stack| while stack.pop().is_some() {});
    runtime.detach_current_thread();
}
