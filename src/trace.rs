//! Current-method lookup and stack trace capture for throwables.

use std::fmt;
use std::sync::Arc;

use crate::object::pretty_descriptor;
use crate::runtime::Runtime;
use crate::safepoint::NoSuspensionScope;
use crate::stack::{FrameId, Method, StackWalker, WalkControl, visit_fn};
use crate::thread::Thread;
use crate::well_known;

/// Bytecode offset recorded for frames that have none, e.g. native methods.
pub const NO_DEX_PC: u32 = u32::MAX;

/// Line number reported for a native method.
const NATIVE_LINE: i32 = -2;

/// The innermost managed method of a thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentMethod {
    pub method: Arc<Method>,
    pub dex_pc: u32,
    pub frame: FrameId,
}

/// One resolved entry of a stack trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackTraceElement {
    /// Declaring class in source form, e.g. `java.lang.Thread`.
    pub declaring_class: String,
    pub method_name: String,
    pub file_name: Option<String>,
    /// `-1` when unknown, `-2` for native methods.
    pub line_number: i32,
}

impl StackTraceElement {
    pub fn is_native_method(&self) -> bool {
        self.line_number == NATIVE_LINE
    }
}

impl fmt::Display for StackTraceElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.declaring_class, self.method_name)?;
        match (&self.file_name, self.line_number) {
            _ if self.is_native_method() => f.write_str("(Native Method)"),
            (Some(file), line) if line >= 0 => write!(f, "({file}:{line})"),
            (Some(file), _) => write!(f, "({file})"),
            (None, _) => f.write_str("(Unknown Source)"),
        }
    }
}

impl Thread {
    /// The innermost method that is not a runtime trampoline.
    pub fn current_method(&self) -> Option<CurrentMethod> {
        let runtime = self.runtime();
        let stack = self.managed_stack.lock();
        let mut current = None;
        StackWalker::new(&stack, runtime.code()).walk(&mut visit_fn(|frame| {
            let Some(method) = frame.method() else {
                return WalkControl::Continue;
            };
            if method.is_runtime() {
                return WalkControl::Continue;
            }
            current = Some(CurrentMethod {
                method: Arc::clone(method),
                dex_pc: frame.dex_pc().unwrap_or(NO_DEX_PC),
                frame: frame.id(),
            });
            WalkControl::Stop
        }));
        current
    }

    /// Captures the managed stack as `(method, dex_pc)` pairs, innermost
    /// first.
    ///
    /// Frames of the throwable being constructed are left out: the walk
    /// skips leading frames declared by `Throwable` or its subclasses.
    /// Runtime trampolines never appear.
    pub fn create_internal_stack_trace(&self) -> Vec<(Arc<Method>, u32)> {
        let runtime = self.runtime();
        let objects = runtime.objects();
        let Some(throwable) = objects.find_class(well_known::THROWABLE) else {
            fatal!("class {} is not loaded", well_known::THROWABLE);
        };

        let _no_suspension = NoSuspensionScope::new(self, "Building internal stack trace");
        let stack = self.managed_stack.lock();
        let mut skipping = true;
        let mut trace = Vec::new();
        StackWalker::new(&stack, runtime.code()).walk(&mut visit_fn(|frame| {
            let Some(method) = frame.method() else {
                return WalkControl::Continue;
            };
            if method.is_runtime() {
                return WalkControl::Continue;
            }
            if skipping {
                if objects.is_assignable_from(throwable, method.declaring_class) {
                    return WalkControl::Continue;
                }
                skipping = false;
            }
            trace.push((Arc::clone(method), frame.dex_pc().unwrap_or(NO_DEX_PC)));
            WalkControl::Continue
        }));
        trace
    }

    /// Number of frames [`create_internal_stack_trace`](Self::create_internal_stack_trace)
    /// would capture.
    pub fn stack_depth(&self) -> usize {
        self.create_internal_stack_trace().len()
    }
}

impl Runtime {
    /// Resolves a captured trace into printable elements, keeping at most
    /// `max_depth` of them.
    pub fn internal_stack_trace_to_elements(
        &self,
        trace: &[(Arc<Method>, u32)],
        max_depth: Option<usize>,
    ) -> Vec<StackTraceElement> {
        let limit = max_depth.unwrap_or(trace.len());
        trace
            .iter()
            .take(limit)
            .map(|(method, dex_pc)| {
                let line_number = if method.is_native() {
                    NATIVE_LINE
                } else if *dex_pc == NO_DEX_PC {
                    -1
                } else {
                    self.code().line_number(method, *dex_pc).unwrap_or(-1)
                };
                StackTraceElement {
                    declaring_class: pretty_descriptor(&method.class_descriptor),
                    method_name: method.name.clone(),
                    file_name: method.source_file.clone(),
                    line_number,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ObjectModel;
    use crate::object::ClassRef;
    use crate::stack::MethodFlags;
    use crate::test_utils::{attach_main, test_runtime};

    #[test]
    fn current_method_skips_runtime_frames() {
        let (runtime, _, _) = test_runtime();
        let thread = attach_main(&runtime);
        assert_eq!(thread.current_method(), None);

        let work = Arc::new(Method::new("work", ClassRef(4), "LJob;"));
        let frame = thread.with_managed_stack(|stack| {
            let frame = stack.push_shadow(Arc::clone(&work), 6, Vec::new());
            stack.push_quick(Arc::new(Method::runtime("callee-save")), 0x44, Vec::new(), Vec::new());
            frame
        });

        assert_eq!(
            thread.current_method(),
            Some(CurrentMethod {
                method: work,
                dex_pc: 6,
                frame
            })
        );
        runtime.detach_current_thread();
    }

    #[test]
    fn trace_skips_throwable_constructors() {
        let (runtime, objects, code) = test_runtime();
        let thread = attach_main(&runtime);
        let throwable = objects.find_class(well_known::THROWABLE).unwrap();
        let exception = objects.find_class("Ljava/lang/RuntimeException;").unwrap();

        let main = Arc::new(Method::new("main", ClassRef(4), "Lapp/Main;").with_source_file("Main.java"));
        code.set_line_table(&main, &[(0, 10), (8, 12)]);
        let read = Arc::new(Method::new("read", ClassRef(5), "Lapp/Io;").with_flags(MethodFlags::NATIVE));
        let init = Arc::new(Method::new("<init>", exception, "Ljava/lang/RuntimeException;"));
        let fill = Arc::new(Method::new("fillInStackTrace", throwable, well_known::THROWABLE));

        thread.with_managed_stack(|stack| {
            stack.push_shadow(Arc::clone(&main), 9, Vec::new());
            stack.push_quick(read, 0x2000, Vec::new(), Vec::new());
            stack.push_shadow(init, 1, Vec::new());
            stack.push_quick(Arc::new(Method::runtime("alloc")), 0x50, Vec::new(), Vec::new());
            stack.push_shadow(fill, 0, Vec::new());
        });

        let trace = thread.create_internal_stack_trace();
        let names: Vec<&str> = trace.iter().map(|(method, _)| method.name.as_str()).collect();
        assert_eq!(names, ["read", "main"]);
        assert_eq!(trace[0].1, NO_DEX_PC);
        assert_eq!(trace[1].1, 9);
        assert_eq!(thread.stack_depth(), 2);

        let elements = runtime.internal_stack_trace_to_elements(&trace, None);
        let rendered: Vec<String> = elements.iter().map(ToString::to_string).collect();
        assert_eq!(rendered, ["app.Io.read(Native Method)", "app.Main.main(Main.java:12)"]);
        assert_eq!(runtime.internal_stack_trace_to_elements(&trace, Some(1)).len(), 1);
        runtime.detach_current_thread();
    }

    #[test]
    fn element_without_source_renders_unknown() {
        let element = StackTraceElement {
            declaring_class: "a.B".to_owned(),
            method_name: "c".to_owned(),
            file_name: None,
            line_number: -1,
        };
        assert_eq!(element.to_string(), "a.B.c(Unknown Source)");
        assert!(!element.is_native_method());
    }
}
