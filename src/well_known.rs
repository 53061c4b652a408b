//! Classes, fields and methods of the core library the thread runtime touches.

use crate::object::{FieldDescriptor, MethodDescriptor};

pub const OBJECT: &str = "Ljava/lang/Object;";
pub const STRING: &str = "Ljava/lang/String;";
pub const THREAD: &str = "Ljava/lang/Thread;";
pub const THREAD_GROUP: &str = "Ljava/lang/ThreadGroup;";
pub const THROWABLE: &str = "Ljava/lang/Throwable;";
pub const OUT_OF_MEMORY_ERROR: &str = "Ljava/lang/OutOfMemoryError;";
pub const UNCAUGHT_EXCEPTION_HANDLER: &str = "Ljava/lang/Thread$UncaughtExceptionHandler;";

pub const THREAD_NAME: FieldDescriptor = FieldDescriptor {
    class: THREAD,
    name: "name",
    ty: STRING,
};

pub const THREAD_DAEMON: FieldDescriptor = FieldDescriptor {
    class: THREAD,
    name: "daemon",
    ty: "Z",
};

pub const THREAD_PRIORITY: FieldDescriptor = FieldDescriptor {
    class: THREAD,
    name: "priority",
    ty: "I",
};

pub const THREAD_GROUP_FIELD: FieldDescriptor = FieldDescriptor {
    class: THREAD,
    name: "group",
    ty: THREAD_GROUP,
};

/// Back-reference from the managed peer to its native entity.
pub const THREAD_VM_DATA: FieldDescriptor = FieldDescriptor {
    class: THREAD,
    name: "vmData",
    ty: "I",
};

/// Object joiners wait on; notified when the thread dies.
pub const THREAD_LOCK: FieldDescriptor = FieldDescriptor {
    class: THREAD,
    name: "lock",
    ty: OBJECT,
};

pub const THREAD_UNCAUGHT_HANDLER: FieldDescriptor = FieldDescriptor {
    class: THREAD,
    name: "uncaughtHandler",
    ty: UNCAUGHT_EXCEPTION_HANDLER,
};

pub const THREAD_GROUP_NAME: FieldDescriptor = FieldDescriptor {
    class: THREAD_GROUP,
    name: "name",
    ty: STRING,
};

pub const THROWABLE_DETAIL_MESSAGE: FieldDescriptor = FieldDescriptor {
    class: THROWABLE,
    name: "detailMessage",
    ty: STRING,
};

pub const THROWABLE_CAUSE: FieldDescriptor = FieldDescriptor {
    class: THROWABLE,
    name: "cause",
    ty: THROWABLE,
};

pub const THREAD_INIT: MethodDescriptor = MethodDescriptor {
    class: THREAD,
    name: "<init>",
    signature: "(Ljava/lang/ThreadGroup;Ljava/lang/String;IZ)V",
};

pub const THREAD_RUN: MethodDescriptor = MethodDescriptor {
    class: THREAD,
    name: "run",
    signature: "()V",
};

pub const THREAD_GROUP_REMOVE_THREAD: MethodDescriptor = MethodDescriptor {
    class: THREAD_GROUP,
    name: "removeThread",
    signature: "(Ljava/lang/Thread;)V",
};

pub const UNCAUGHT_EXCEPTION: MethodDescriptor = MethodDescriptor {
    class: UNCAUGHT_EXCEPTION_HANDLER,
    name: "uncaughtException",
    signature: "(Ljava/lang/Thread;Ljava/lang/Throwable;)V",
};

pub const THROWABLE_INIT: MethodDescriptor = MethodDescriptor {
    class: THROWABLE,
    name: "<init>",
    signature: "(Ljava/lang/String;Ljava/lang/Throwable;)V",
};
