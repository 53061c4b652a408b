//! Test fixtures: an in-memory object model, a table-driven code metadata
//! provider and runtime builders.
//!
//! These stand in for the embedder in unit tests, integration tests,
//! doctests and benchmarks.
//!
//! # Examples
//!
//! ```
//! use vmthread::test_utils::{attach_main, test_runtime};
//! use vmthread::well_known;
//!
//! let (runtime, objects, _code) = test_runtime();
//! let main = attach_main(&runtime);
//! let group = objects.new_thread_group("main");
//! runtime.finish_startup(group).unwrap();
//!
//! let peer = main.peer().unwrap();
//! assert_eq!(objects.descriptor_of(peer), well_known::THREAD);
//! runtime.detach_current_thread();
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::config::RuntimeConfig;
use crate::object::{ClassRef, FieldDescriptor, MethodDescriptor, ObjectModel, ObjectRef, Value};
use crate::runtime::Runtime;
use crate::stack::{CodeIntrospection, Method, ReferenceBitmap, VRegLocation};
use crate::thread::{NORM_PRIORITY, Thread};
use crate::well_known;

/// Class ids handed out by the mock start here, clear of the small ids tests
/// use for methods of classes the mock does not know.
const FIRST_CLASS_ID: u32 = 1000;
const HEAP_BASE: usize = 0x7000_0000;
const OBJECT_ALIGN: usize = 0x20;

/// Classes every mock heap starts with, as `(descriptor, superclass)`.
const CORE_CLASSES: &[(&str, Option<&str>)] = &[
    (well_known::OBJECT, None),
    (well_known::STRING, Some(well_known::OBJECT)),
    (well_known::THREAD, Some(well_known::OBJECT)),
    (well_known::THREAD_GROUP, Some(well_known::OBJECT)),
    (well_known::UNCAUGHT_EXCEPTION_HANDLER, Some(well_known::OBJECT)),
    (well_known::THROWABLE, Some(well_known::OBJECT)),
    ("Ljava/lang/Exception;", Some(well_known::THROWABLE)),
    ("Ljava/lang/RuntimeException;", Some("Ljava/lang/Exception;")),
    ("Ljava/lang/IllegalStateException;", Some("Ljava/lang/RuntimeException;")),
    ("Ljava/lang/NullPointerException;", Some("Ljava/lang/RuntimeException;")),
    ("Ljava/lang/Error;", Some(well_known::THROWABLE)),
    ("Ljava/lang/VirtualMachineError;", Some("Ljava/lang/Error;")),
    (well_known::OUT_OF_MEMORY_ERROR, Some("Ljava/lang/VirtualMachineError;")),
    ("Ljava/lang/StackOverflowError;", Some("Ljava/lang/VirtualMachineError;")),
];

/// Behaviour attached to a managed method by a test.
pub type InvokeHook = Arc<dyn Fn(&Thread, ObjectRef, &[Value]) -> Value + Send + Sync>;

/// A recorded call through [`ObjectModel::invoke`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub method: MethodDescriptor,
    pub receiver: ObjectRef,
    pub args: Vec<Value>,
}

struct MockClass {
    descriptor: String,
    super_class: Option<ClassRef>,
}

struct MockObject {
    class: ClassRef,
    fields: HashMap<FieldDescriptor, Value>,
    string: Option<String>,
}

#[derive(Clone, Copy)]
struct MonitorState {
    owner: u32,
    recursion: u32,
}

#[derive(Default)]
struct MockHeap {
    classes: Vec<MockClass>,
    class_index: HashMap<String, ClassRef>,
    objects: HashMap<ObjectRef, MockObject>,
    next_addr: usize,
    fail_allocations: bool,
    simulate_constructors: bool,
    invocations: Vec<Invocation>,
    hooks: HashMap<MethodDescriptor, InvokeHook>,
    monitors: HashMap<ObjectRef, MonitorState>,
    notifications: HashMap<ObjectRef, usize>,
}

impl MockHeap {
    fn class(&self, class: ClassRef) -> Option<&MockClass> {
        let index = class.0.checked_sub(FIRST_CLASS_ID)?;
        self.classes.get(index as usize)
    }

    fn define(&mut self, descriptor: &str, super_descriptor: Option<&str>) -> ClassRef {
        if let Some(existing) = self.class_index.get(descriptor) {
            return *existing;
        }
        let super_class = super_descriptor.map(|name| match self.class_index.get(name) {
            Some(class) => *class,
            None => fatal!("superclass {name} of {descriptor} is not defined"),
        });
        let class = ClassRef(FIRST_CLASS_ID + self.classes.len() as u32);
        self.classes.push(MockClass {
            descriptor: descriptor.to_owned(),
            super_class,
        });
        self.class_index.insert(descriptor.to_owned(), class);
        class
    }

    fn allocate(&mut self, class: ClassRef, string: Option<String>) -> ObjectRef {
        self.next_addr += OBJECT_ALIGN;
        let Some(object) = ObjectRef::from_raw(HEAP_BASE + self.next_addr) else {
            fatal!("mock heap address wrapped");
        };
        self.objects.insert(
            object,
            MockObject {
                class,
                fields: HashMap::new(),
                string,
            },
        );
        object
    }

    fn object(&self, object: ObjectRef) -> &MockObject {
        match self.objects.get(&object) {
            Some(entry) => entry,
            None => fatal!("object {object} was not allocated by the mock heap"),
        }
    }

    fn object_mut(&mut self, object: ObjectRef) -> &mut MockObject {
        match self.objects.get_mut(&object) {
            Some(entry) => entry,
            None => fatal!("object {object} was not allocated by the mock heap"),
        }
    }

    fn class_named(&self, descriptor: &str) -> ClassRef {
        match self.class_index.get(descriptor) {
            Some(class) => *class,
            None => fatal!("mock class {descriptor} is not defined"),
        }
    }
}

fn default_value(field: &FieldDescriptor) -> Value {
    match field.ty {
        "I" => Value::Int(0),
        "Z" => Value::Bool(false),
        _ => Value::Object(None),
    }
}

/// An [`ObjectModel`] over an in-memory heap.
///
/// Objects are never collected. `Throwable.<init>` stores its message and
/// cause; `Thread.<init>` fills in the thread fields only when constructor
/// simulation is on, so the runtime's own fallback can be exercised too.
/// Other managed methods do nothing unless a test installs a hook.
pub struct MockObjectModel {
    heap: Mutex<MockHeap>,
    monitor_released: Condvar,
}

impl Default for MockObjectModel {
    fn default() -> Self {
        Self::new()
    }
}

impl MockObjectModel {
    pub fn new() -> Self {
        let mut heap = MockHeap::default();
        for (descriptor, super_descriptor) in CORE_CLASSES {
            heap.define(descriptor, *super_descriptor);
        }
        Self {
            heap: Mutex::new(heap),
            monitor_released: Condvar::new(),
        }
    }

    /// Defines a class, or returns the existing one with that descriptor.
    pub fn define_class(&self, descriptor: &str, super_descriptor: Option<&str>) -> ClassRef {
        self.heap.lock().define(descriptor, super_descriptor)
    }

    /// Allocates an instance even while allocations are set to fail.
    pub fn new_instance(&self, descriptor: &str) -> ObjectRef {
        let mut heap = self.heap.lock();
        let class = heap.class_named(descriptor);
        heap.allocate(class, None)
    }

    pub fn new_thread_group(&self, name: &str) -> ObjectRef {
        let mut heap = self.heap.lock();
        let group_class = heap.class_named(well_known::THREAD_GROUP);
        let string_class = heap.class_named(well_known::STRING);
        let group = heap.allocate(group_class, None);
        let name = heap.allocate(string_class, Some(name.to_owned()));
        heap.object_mut(group)
            .fields
            .insert(well_known::THREAD_GROUP_NAME, Value::Object(Some(name)));
        group
    }

    /// A fully initialized `java.lang.Thread`, as managed code would create
    /// before starting it.
    pub fn new_thread_object(&self, name: &str, group: Option<ObjectRef>, daemon: bool) -> ObjectRef {
        let mut heap = self.heap.lock();
        let thread_class = heap.class_named(well_known::THREAD);
        let string_class = heap.class_named(well_known::STRING);
        let object_class = heap.class_named(well_known::OBJECT);
        let peer = heap.allocate(thread_class, None);
        let name = heap.allocate(string_class, Some(name.to_owned()));
        let lock = heap.allocate(object_class, None);
        let fields = &mut heap.object_mut(peer).fields;
        fields.insert(well_known::THREAD_NAME, Value::Object(Some(name)));
        fields.insert(well_known::THREAD_GROUP_FIELD, Value::Object(group));
        fields.insert(well_known::THREAD_DAEMON, Value::Bool(daemon));
        fields.insert(well_known::THREAD_PRIORITY, Value::Int(NORM_PRIORITY));
        fields.insert(well_known::THREAD_LOCK, Value::Object(Some(lock)));
        peer
    }

    pub fn descriptor_of(&self, object: ObjectRef) -> String {
        let heap = self.heap.lock();
        let class = heap.object(object).class;
        heap.class(class)
            .map(|class| class.descriptor.clone())
            .unwrap_or_default()
    }

    /// Reads a string-typed field as a Rust string.
    pub fn string_field(&self, object: ObjectRef, field: &FieldDescriptor) -> Option<String> {
        let heap = self.heap.lock();
        let value = heap.object(object).fields.get(field).copied()?;
        heap.object(value.as_object()?).string.clone()
    }

    pub fn set_fail_allocations(&self, fail: bool) {
        self.heap.lock().fail_allocations = fail;
    }

    pub fn set_simulate_constructors(&self, simulate: bool) {
        self.heap.lock().simulate_constructors = simulate;
    }

    /// Runs `hook` whenever `method` is invoked, after any built-in behaviour.
    pub fn set_invoke_hook(
        &self,
        method: MethodDescriptor,
        hook: impl Fn(&Thread, ObjectRef, &[Value]) -> Value + Send + Sync + 'static,
    ) {
        self.heap.lock().hooks.insert(method, Arc::new(hook));
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.heap.lock().invocations.clone()
    }

    pub fn invocation_count(&self, method: &MethodDescriptor) -> usize {
        self.heap
            .lock()
            .invocations
            .iter()
            .filter(|invocation| invocation.method == *method)
            .count()
    }

    /// Number of `notify_all` calls made on `object`.
    pub fn notify_count(&self, object: ObjectRef) -> usize {
        self.heap.lock().notifications.get(&object).copied().unwrap_or(0)
    }

    pub fn object_count(&self) -> usize {
        self.heap.lock().objects.len()
    }

    fn construct_thread(heap: &mut MockHeap, peer: ObjectRef, args: &[Value]) {
        let object_class = heap.class_named(well_known::OBJECT);
        let lock = heap.allocate(object_class, None);
        let value = |index: usize| args.get(index).copied().unwrap_or_default();
        let fields = &mut heap.object_mut(peer).fields;
        fields.insert(well_known::THREAD_GROUP_FIELD, value(0));
        fields.insert(well_known::THREAD_NAME, value(1));
        fields.insert(well_known::THREAD_PRIORITY, value(2));
        fields.insert(well_known::THREAD_DAEMON, value(3));
        fields.insert(well_known::THREAD_LOCK, Value::Object(Some(lock)));
    }
}

impl ObjectModel for MockObjectModel {
    fn find_class(&self, descriptor: &str) -> Option<ClassRef> {
        self.heap.lock().class_index.get(descriptor).copied()
    }

    fn class_of(&self, object: ObjectRef) -> ClassRef {
        self.heap.lock().object(object).class
    }

    fn class_descriptor(&self, class: ClassRef) -> String {
        match self.heap.lock().class(class) {
            Some(class) => class.descriptor.clone(),
            None => fatal!("unknown mock class {class:?}"),
        }
    }

    fn is_assignable_from(&self, target: ClassRef, source: ClassRef) -> bool {
        let heap = self.heap.lock();
        let mut current = Some(source);
        while let Some(class) = current {
            if class == target {
                return true;
            }
            current = heap.class(class).and_then(|class| class.super_class);
        }
        false
    }

    fn alloc_object(&self, class: ClassRef) -> Option<ObjectRef> {
        let mut heap = self.heap.lock();
        if heap.fail_allocations || heap.class(class).is_none() {
            return None;
        }
        Some(heap.allocate(class, None))
    }

    fn new_string(&self, utf8: &str) -> Option<ObjectRef> {
        let mut heap = self.heap.lock();
        if heap.fail_allocations {
            return None;
        }
        let class = heap.class_named(well_known::STRING);
        Some(heap.allocate(class, Some(utf8.to_owned())))
    }

    fn string_value(&self, string: ObjectRef) -> Option<String> {
        self.heap.lock().object(string).string.clone()
    }

    fn get_field(&self, object: ObjectRef, field: &FieldDescriptor) -> Value {
        self.heap
            .lock()
            .object(object)
            .fields
            .get(field)
            .copied()
            .unwrap_or_else(|| default_value(field))
    }

    fn set_field(&self, object: ObjectRef, field: &FieldDescriptor, value: Value) {
        self.heap.lock().object_mut(object).fields.insert(*field, value);
    }

    fn invoke(&self, thread: &Thread, receiver: ObjectRef, method: &MethodDescriptor, args: &[Value]) -> Value {
        let hook = {
            let mut heap = self.heap.lock();
            heap.invocations.push(Invocation {
                method: *method,
                receiver,
                args: args.to_vec(),
            });
            if *method == well_known::THROWABLE_INIT {
                let fields = &mut heap.object_mut(receiver).fields;
                fields.insert(
                    well_known::THROWABLE_DETAIL_MESSAGE,
                    args.first().copied().unwrap_or_default(),
                );
                fields.insert(well_known::THROWABLE_CAUSE, args.get(1).copied().unwrap_or_default());
            } else if *method == well_known::THREAD_INIT && heap.simulate_constructors {
                Self::construct_thread(&mut heap, receiver, args);
            }
            heap.hooks.get(method).cloned()
        };
        match hook {
            Some(hook) => hook(thread, receiver, args),
            None => Value::Void,
        }
    }

    fn monitor_owner(&self, object: ObjectRef) -> Option<u32> {
        self.heap.lock().monitors.get(&object).map(|monitor| monitor.owner)
    }

    fn monitor_enter(&self, thread: &Thread, object: ObjectRef) {
        let me = thread.thin_lock_id();
        let mut heap = self.heap.lock();
        loop {
            match heap.monitors.get_mut(&object) {
                None => {
                    heap.monitors.insert(object, MonitorState { owner: me, recursion: 1 });
                    return;
                }
                Some(monitor) if monitor.owner == me => {
                    monitor.recursion += 1;
                    return;
                }
                Some(_) => self.monitor_released.wait(&mut heap),
            }
        }
    }

    fn monitor_exit(&self, thread: &Thread, object: ObjectRef) {
        let mut heap = self.heap.lock();
        let Some(monitor) = heap.monitors.get_mut(&object) else {
            fatal!("{thread} exited monitor {object} it does not own");
        };
        if monitor.owner != thread.thin_lock_id() {
            fatal!("{thread} exited monitor {object} owned by thread {}", monitor.owner);
        }
        monitor.recursion -= 1;
        if monitor.recursion == 0 {
            heap.monitors.remove(&object);
            self.monitor_released.notify_all();
        }
    }

    fn notify_all(&self, _thread: &Thread, object: ObjectRef) {
        *self.heap.lock().notifications.entry(object).or_default() += 1;
    }

    fn verify_object(&self, object: ObjectRef) {
        if !self.heap.lock().objects.contains_key(&object) {
            fatal!("failed to verify object {object}: not allocated by the mock heap");
        }
    }
}

type MethodKey = (String, String);

fn method_key(method: &Method) -> MethodKey {
    (method.class_descriptor.clone(), method.name.clone())
}

#[derive(Default)]
struct CodeTables {
    lines: HashMap<MethodKey, Vec<(u32, i32)>>,
    bitmaps: HashMap<MethodKey, Option<ReferenceBitmap>>,
    locations: HashMap<(MethodKey, u16), VRegLocation>,
}

/// A [`CodeIntrospection`] driven by per-method tables.
///
/// Machine code of every method starts at [`MockCode::CODE_BASE`] with four
/// bytes per bytecode unit. Methods without a reference map get an empty
/// one, and virtual registers live in the stack slot of the same number
/// unless told otherwise.
#[derive(Default)]
pub struct MockCode {
    tables: Mutex<CodeTables>,
}

impl MockCode {
    pub const CODE_BASE: usize = 0x1000;

    pub fn new() -> Self {
        Self::default()
    }

    /// `(dex_pc, line)` pairs; a pc maps to the last entry at or before it.
    pub fn set_line_table(&self, method: &Method, table: &[(u32, i32)]) {
        let mut table = table.to_vec();
        table.sort_unstable_by_key(|(dex_pc, _)| *dex_pc);
        self.tables.lock().lines.insert(method_key(method), table);
    }

    pub fn set_reference_bitmap(&self, method: &Method, bitmap: ReferenceBitmap) {
        self.tables.lock().bitmaps.insert(method_key(method), Some(bitmap));
    }

    /// Makes the method report no reference map at all.
    pub fn clear_reference_bitmap(&self, method: &Method) {
        self.tables.lock().bitmaps.insert(method_key(method), None);
    }

    pub fn set_vreg_location(&self, method: &Method, vreg: u16, location: VRegLocation) {
        self.tables
            .lock()
            .locations
            .insert((method_key(method), vreg), location);
    }
}

impl CodeIntrospection for MockCode {
    fn line_number(&self, method: &Method, dex_pc: u32) -> Option<i32> {
        let tables = self.tables.lock();
        let table = tables.lines.get(&method_key(method))?;
        table
            .iter()
            .take_while(|(start, _)| *start <= dex_pc)
            .last()
            .map(|(_, line)| *line)
    }

    fn dex_pc_for_native_pc(&self, _method: &Method, native_pc: usize) -> u32 {
        (native_pc.saturating_sub(Self::CODE_BASE) / 4) as u32
    }

    fn native_pc_for_dex_pc(&self, _method: &Method, dex_pc: u32) -> usize {
        Self::CODE_BASE + dex_pc as usize * 4
    }

    fn reference_bitmap(&self, method: &Method, _dex_pc: u32) -> Option<ReferenceBitmap> {
        match self.tables.lock().bitmaps.get(&method_key(method)) {
            Some(bitmap) => bitmap.clone(),
            None => Some(ReferenceBitmap::default()),
        }
    }

    fn vreg_location(&self, method: &Method, vreg: u16) -> VRegLocation {
        self.tables
            .lock()
            .locations
            .get(&(method_key(method), vreg))
            .copied()
            .unwrap_or(VRegLocation::Stack { slot: usize::from(vreg) })
    }
}

/// Configuration with every consistency check enabled.
pub fn test_config() -> RuntimeConfig {
    RuntimeConfig {
        check_locks: true,
        verify_objects: true,
        ..RuntimeConfig::default()
    }
}

/// A runtime over fresh mocks, with every consistency check enabled.
pub fn test_runtime() -> (Arc<Runtime>, Arc<MockObjectModel>, Arc<MockCode>) {
    test_runtime_with(test_config())
}

pub fn test_runtime_with(config: RuntimeConfig) -> (Arc<Runtime>, Arc<MockObjectModel>, Arc<MockCode>) {
    let objects = Arc::new(MockObjectModel::new());
    let code = Arc::new(MockCode::new());
    let runtime = Runtime::new(config, objects.clone(), code.clone());
    (runtime, objects, code)
}

/// Attaches the calling thread as `"main"`. On a fresh runtime it becomes
/// the main thread and gets no peer until the runtime starts.
pub fn attach_main(runtime: &Arc<Runtime>) -> Arc<Thread> {
    match Thread::attach(runtime, Some("main"), false, None) {
        Ok(thread) => thread,
        Err(err) => fatal!("attaching the main thread failed: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_hierarchy_answers_assignability() {
        let objects = MockObjectModel::new();
        let throwable = objects.find_class(well_known::THROWABLE).unwrap();
        let oom = objects.find_class(well_known::OUT_OF_MEMORY_ERROR).unwrap();
        let custom = objects.define_class("Lapp/Failure;", Some("Ljava/lang/RuntimeException;"));

        assert!(objects.is_assignable_from(throwable, oom));
        assert!(objects.is_assignable_from(throwable, custom));
        assert!(!objects.is_assignable_from(oom, throwable));
        assert!(!objects.is_assignable_from(throwable, ClassRef(3)));
        assert_eq!(objects.define_class("Lapp/Failure;", None), custom);
    }

    #[test]
    fn fields_default_by_type() {
        let objects = MockObjectModel::new();
        let peer = objects.new_instance(well_known::THREAD);
        assert_eq!(objects.get_field(peer, &well_known::THREAD_PRIORITY), Value::Int(0));
        assert_eq!(objects.get_field(peer, &well_known::THREAD_DAEMON), Value::Bool(false));
        assert_eq!(objects.get_field(peer, &well_known::THREAD_NAME), Value::Object(None));

        let named = objects.new_thread_object("worker", None, true);
        assert_eq!(objects.string_field(named, &well_known::THREAD_NAME).as_deref(), Some("worker"));
    }

    #[test]
    fn failing_allocations_spare_fixtures() {
        let objects = MockObjectModel::new();
        let class = objects.find_class(well_known::OBJECT).unwrap();
        objects.set_fail_allocations(true);
        assert_eq!(objects.alloc_object(class), None);
        assert_eq!(objects.new_string("x"), None);
        objects.new_instance(well_known::OBJECT);
        assert_eq!(objects.object_count(), 1);
    }

    #[test]
    fn code_tables_map_pcs_and_lines() {
        let code = MockCode::new();
        let method = Method::new("m", ClassRef(1), "LFoo;");
        code.set_line_table(&method, &[(4, 20), (0, 10)]);

        assert_eq!(code.line_number(&method, 0), Some(10));
        assert_eq!(code.line_number(&method, 7), Some(20));
        assert_eq!(code.native_pc_for_dex_pc(&method, 3), 0x100c);
        assert_eq!(code.dex_pc_for_native_pc(&method, 0x100c), 3);
        assert_eq!(code.vreg_location(&method, 2), VRegLocation::Stack { slot: 2 });
        assert_eq!(code.reference_bitmap(&method, 0), Some(ReferenceBitmap::default()));
        code.clear_reference_bitmap(&method);
        assert_eq!(code.reference_bitmap(&method, 0), None);
    }
}
