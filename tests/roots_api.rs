use std::collections::HashSet;
use std::sync::Arc;

use vmthread::reference::{Lookup, ReferenceScope};
use vmthread::stack::{Method, ReferenceBitmap, VRegLocation};
use vmthread::test_utils::{attach_main, test_runtime};
use vmthread::{ClassRef, ObjectRef, Thread, well_known};

fn collect_world(runtime: &vmthread::Runtime) -> HashSet<ObjectRef> {
    let world = runtime.suspend_all();
    let mut roots = HashSet::new();
    world.visit_roots(&mut |root| {
        roots.insert(root);
    });
    roots
}

#[test]
fn stopped_world_reports_runtime_and_thread_roots() {
    let (runtime, objects, code) = test_runtime();
    let main = attach_main(&runtime);
    let group = objects.new_thread_group("main");
    runtime.finish_startup(group).unwrap();

    let global = objects.new_instance(well_known::OBJECT);
    let weak = objects.new_instance(well_known::OBJECT);
    let local = objects.new_instance(well_known::OBJECT);
    let compiled = objects.new_instance(well_known::OBJECT);
    let unreferenced = objects.new_instance(well_known::OBJECT);

    runtime.references().add_global(global);
    runtime.references().add_weak_global(weak);
    main.add_local_reference(local);

    let method = Arc::new(Method::new("tick", ClassRef(7), "Lapp/Clock;").with_registers(2));
    code.set_reference_bitmap(&method, ReferenceBitmap::from_registers(&[1]));
    code.set_vreg_location(&method, 1, VRegLocation::Stack { slot: 0 });
    main.with_managed_stack(|stack| {
        stack.push_upcall(0x20);
        stack.push_quick(Arc::clone(&method), 0x1004, vec![compiled.addr(), unreferenced.addr()], Vec::new());
    });

    let roots = collect_world(&runtime);
    let expected = [
        global,
        local,
        compiled,
        group,
        main.peer().unwrap(),
        runtime.preallocated_out_of_memory_error().unwrap(),
    ];
    for root in expected {
        assert!(roots.contains(&root), "missing root {root}");
    }
    assert!(!roots.contains(&weak));
    assert!(!roots.contains(&unreferenced));

    main.with_managed_stack(|stack| while stack.pop().is_some() {});
    runtime.detach_current_thread();
}

#[test]
fn other_threads_are_scanned_while_stopped() {
    let (runtime, objects, _) = test_runtime();
    let _main = attach_main(&runtime);
    runtime.finish_startup(objects.new_thread_group("main")).unwrap();
    let held = objects.new_instance(well_known::OBJECT);

    let (ready_tx, ready_rx) = flume::bounded(1);
    let (release_tx, release_rx) = flume::bounded::<()>(1);
    let handle = {
        let runtime = Arc::clone(&runtime);
        std::thread::spawn(move || {
            let thread = Thread::attach(&runtime, Some("holder"), false, None).unwrap();
            let mut scope = ReferenceScope::new(1);
            scope.set(0, Some(held));
            thread.push_reference_scope(scope);
            ready_tx.send(()).unwrap();
            release_rx.recv().unwrap();
            thread.pop_reference_scope();
            runtime.detach_current_thread();
        })
    };
    ready_rx.recv().unwrap();

    assert!(collect_world(&runtime).contains(&held));

    release_tx.send(()).unwrap();
    handle.join().unwrap();
    runtime.detach_current_thread();
}

#[test]
fn weak_globals_are_cleared_by_the_sweep() {
    let (runtime, objects, _) = test_runtime();
    let main = attach_main(&runtime);
    let survivor = objects.new_instance(well_known::OBJECT);
    let garbage = objects.new_instance(well_known::OBJECT);

    let survivor_ref = runtime.references().add_weak_global(survivor);
    let garbage_ref = runtime.references().add_weak_global(garbage);
    let cleared = runtime.references().sweep_weak_globals(|object| object == survivor);

    assert_eq!(cleared, 1);
    assert_eq!(runtime.references().lookup_weak_global(survivor_ref), Lookup::Live(survivor));
    assert_eq!(runtime.references().lookup_weak_global(garbage_ref), Lookup::Cleared);
    assert_eq!(main.try_decode_reference(garbage_ref), Ok(None));
    assert_eq!(main.decode_reference(survivor_ref), Some(survivor));

    assert!(runtime.references().delete_weak_global(garbage_ref));
    assert_eq!(runtime.references().weak_global_count(), 1);
    runtime.detach_current_thread();
}
