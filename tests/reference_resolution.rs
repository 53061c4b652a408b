use vmthread::reference::ReferenceScope;
use vmthread::test_utils::{attach_main, test_config, test_runtime, test_runtime_with};
use vmthread::{IndirectRef, IndirectRefKind, ReferenceError, RuntimeConfig, well_known};

#[test]
fn every_handle_kind_resolves_to_its_object() {
    let (runtime, objects, _) = test_runtime();
    let thread = attach_main(&runtime);
    let object = objects.new_instance(well_known::OBJECT);

    let local = thread.add_local_reference(object);
    let global = runtime.references().add_global(object);
    let weak = runtime.references().add_weak_global(object);
    let mut scope = ReferenceScope::new(3);
    scope.set(2, Some(object));
    let scoped = scope.handle(2);
    thread.push_reference_scope(scope);

    assert_eq!(local.kind(), IndirectRefKind::Local);
    assert_eq!(global.kind(), IndirectRefKind::Global);
    assert_eq!(weak.kind(), IndirectRefKind::WeakGlobal);
    assert_eq!(scoped.kind(), IndirectRefKind::ScopeOrInvalid);
    for handle in [local, global, weak, scoped] {
        assert_eq!(thread.try_decode_reference(handle), Ok(Some(object)), "{handle:?}");
    }
    assert!(thread.scope_contains(scoped));
    assert!(!thread.scope_contains(local));
    assert_eq!(thread.num_scope_references(), 1);
    assert_eq!(thread.decode_reference(IndirectRef::NULL), None);

    thread.pop_reference_scope();
    thread.delete_local_reference(local);
    runtime.detach_current_thread();
}

#[test]
fn deleted_handles_stay_dead_after_slot_reuse() {
    let (runtime, objects, _) = test_runtime();
    let thread = attach_main(&runtime);
    let first = objects.new_instance(well_known::OBJECT);
    let second = objects.new_instance(well_known::OBJECT);

    let stale = runtime.references().add_global(first);
    assert!(runtime.references().delete_global(stale));
    let fresh = runtime.references().add_global(second);

    assert_ne!(stale, fresh);
    assert_eq!(
        thread.try_decode_reference(stale),
        Err(ReferenceError::Deleted {
            kind: IndirectRefKind::Global,
            handle: stale,
        })
    );
    assert_eq!(thread.try_decode_reference(fresh), Ok(Some(second)));
    assert!(!runtime.references().delete_global(stale));

    let local = thread.add_local_reference(first);
    thread.delete_local_reference(local);
    assert!(matches!(
        thread.try_decode_reference(local),
        Err(ReferenceError::Deleted { kind: IndirectRefKind::Local, .. })
    ));
    runtime.detach_current_thread();
}

#[test]
fn empty_scope_slot_is_a_deleted_reference() {
    let (runtime, _, _) = test_runtime();
    let thread = attach_main(&runtime);
    let scope = ReferenceScope::new(2);
    let handle = scope.handle(0);
    thread.push_reference_scope(scope);

    assert!(matches!(
        thread.try_decode_reference(handle),
        Err(ReferenceError::Deleted { kind: IndirectRefKind::ScopeOrInvalid, .. })
    ));
    thread.pop_reference_scope();
    runtime.detach_current_thread();
}

#[test]
fn unknown_handles_are_invalid_unless_working_around_app_bugs() {
    let bogus = IndirectRef::from_raw(0x1000);
    let (runtime, _, _) = test_runtime();
    let thread = attach_main(&runtime);
    assert_eq!(thread.try_decode_reference(bogus), Err(ReferenceError::Invalid(bogus)));
    runtime.detach_current_thread();

    let config = RuntimeConfig {
        work_around_app_jni_bugs: true,
        verify_objects: false,
        ..test_config()
    };
    let (lenient, objects, _) = test_runtime_with(config);
    let thread = attach_main(&lenient);
    let object = objects.new_instance(well_known::OBJECT);
    let raw = IndirectRef::from_raw(object.addr() as u64);
    assert_eq!(raw.kind(), IndirectRefKind::ScopeOrInvalid);
    assert_eq!(thread.decode_reference(raw), Some(object));
    lenient.detach_current_thread();
}

#[test]
#[should_panic(expected = "JNI ERROR (app bug)")]
fn decoding_garbage_is_fatal() {
    let (runtime, _, _) = test_runtime();
    let thread = attach_main(&runtime);
    thread.decode_reference(IndirectRef::from_raw(0x2004));
}

#[test]
#[should_panic(expected = "failed to verify object")]
fn decoded_objects_are_verified() {
    let (runtime, _, _) = test_runtime();
    let thread = attach_main(&runtime);
    let handle = thread.add_local_reference(vmthread::ObjectRef::from_raw(0xbad0).unwrap());
    thread.decode_reference(handle);
}
