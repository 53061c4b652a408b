//! The runtime's view of managed objects.
//!
//! Heap layout, allocation and method invocation belong to the embedder. This
//! module only defines the handles the thread runtime passes around and the
//! [`ObjectModel`] capability it calls through.

use std::fmt;
use std::num::NonZeroUsize;

use crate::thread::Thread;

/// Address of a managed object. Never null; absence is `Option<ObjectRef>`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct ObjectRef(NonZeroUsize);

impl ObjectRef {
    pub fn from_raw(addr: usize) -> Option<Self> {
        NonZeroUsize::new(addr).map(Self)
    }

    pub fn addr(self) -> usize {
        self.0.get()
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.addr())
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.addr())
    }
}

/// Identity of a loaded class.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct ClassRef(pub u32);

/// A field or argument value exchanged with managed code.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum Value {
    #[default]
    Void,
    Int(i32),
    Bool(bool),
    Object(Option<ObjectRef>),
}

impl Value {
    pub fn as_int(self) -> Option<i32> {
        match self {
            Value::Int(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bool(self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(v),
            Value::Int(v) => Some(v != 0),
            _ => None,
        }
    }

    pub fn as_object(self) -> Option<ObjectRef> {
        match self {
            Value::Object(v) => v,
            _ => None,
        }
    }
}

impl From<ObjectRef> for Value {
    fn from(object: ObjectRef) -> Self {
        Value::Object(Some(object))
    }
}

impl From<Option<ObjectRef>> for Value {
    fn from(object: Option<ObjectRef>) -> Self {
        Value::Object(object)
    }
}

/// A field named by its declaring class descriptor, name and type descriptor.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct FieldDescriptor {
    pub class: &'static str,
    pub name: &'static str,
    pub ty: &'static str,
}

/// A method named by its declaring class descriptor, name and signature.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct MethodDescriptor {
    pub class: &'static str,
    pub name: &'static str,
    pub signature: &'static str,
}

/// Object-model services the thread runtime depends on.
///
/// Methods that run managed code (`invoke`) report managed exceptions by
/// leaving them pending on `thread`, not through their return value.
pub trait ObjectModel: Send + Sync {
    /// Looks up a loaded class by descriptor, e.g. `Ljava/lang/Thread;`.
    fn find_class(&self, descriptor: &str) -> Option<ClassRef>;

    fn class_of(&self, object: ObjectRef) -> ClassRef;

    fn class_descriptor(&self, class: ClassRef) -> String;

    /// Whether a value of class `source` can be stored in a `target` slot.
    fn is_assignable_from(&self, target: ClassRef, source: ClassRef) -> bool;

    /// Allocates an uninitialized instance. `None` means the heap is exhausted.
    fn alloc_object(&self, class: ClassRef) -> Option<ObjectRef>;

    fn new_string(&self, utf8: &str) -> Option<ObjectRef>;

    fn string_value(&self, string: ObjectRef) -> Option<String>;

    fn get_field(&self, object: ObjectRef, field: &FieldDescriptor) -> Value;

    fn set_field(&self, object: ObjectRef, field: &FieldDescriptor, value: Value);

    /// Invokes a virtual or interface method on `receiver`.
    fn invoke(
        &self,
        thread: &Thread,
        receiver: ObjectRef,
        method: &MethodDescriptor,
        args: &[Value],
    ) -> Value;

    /// Thin-lock id of the thread owning `object`'s monitor, if any.
    fn monitor_owner(&self, object: ObjectRef) -> Option<u32>;

    fn monitor_enter(&self, thread: &Thread, object: ObjectRef);

    fn monitor_exit(&self, thread: &Thread, object: ObjectRef);

    fn notify_all(&self, thread: &Thread, object: ObjectRef);

    /// Checks that `object` looks like a valid heap object. Aborts if not.
    fn verify_object(&self, object: ObjectRef);
}

/// Turns a type descriptor into source form: `Ljava/lang/String;` becomes
/// `java.lang.String`, `[I` becomes `int[]`.
pub fn pretty_descriptor(descriptor: &str) -> String {
    let dims = descriptor.bytes().take_while(|b| *b == b'[').count();
    let element = &descriptor[dims..];
    let mut pretty = match element.as_bytes().first() {
        Some(b'L') if element.ends_with(';') => element[1..element.len() - 1].replace('/', "."),
        Some(b'Z') if element.len() == 1 => "boolean".to_owned(),
        Some(b'B') if element.len() == 1 => "byte".to_owned(),
        Some(b'C') if element.len() == 1 => "char".to_owned(),
        Some(b'S') if element.len() == 1 => "short".to_owned(),
        Some(b'I') if element.len() == 1 => "int".to_owned(),
        Some(b'J') if element.len() == 1 => "long".to_owned(),
        Some(b'F') if element.len() == 1 => "float".to_owned(),
        Some(b'D') if element.len() == 1 => "double".to_owned(),
        Some(b'V') if element.len() == 1 => "void".to_owned(),
        _ => element.replace('/', "."),
    };
    for _ in 0..dims {
        pretty.push_str("[]");
    }
    pretty
}
