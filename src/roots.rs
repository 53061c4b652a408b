//! Root scanning hooks exposed to the collector.
//!
//! A thread's roots are its peer, its pending exception, its class-loader
//! override, the monitor it is blocked on, its local reference table, its
//! reference scopes and every reference held in a managed frame. Compiled
//! frames are decoded through their reference maps; a register-resident
//! reference is read from the walk's register context.

use crate::object::ObjectRef;
use crate::stack::{Context, FrameView, StackVisitor, StackWalker, VRegLocation, WalkControl};
use crate::thread::Thread;

/// Reports every reference held in the frames it visits.
pub struct ReferenceMapVisitor<'v> {
    visitor: &'v mut dyn FnMut(ObjectRef),
}

impl<'v> ReferenceMapVisitor<'v> {
    pub fn new(visitor: &'v mut dyn FnMut(ObjectRef)) -> Self {
        Self { visitor }
    }

    fn visit_compiled(&mut self, frame: &FrameView<'_>) {
        let Some(quick) = frame.quick_frame() else {
            return;
        };
        let method = &quick.method;
        if method.is_native() || method.is_runtime() || method.is_proxy() {
            return;
        }
        let code = frame.code();
        let dex_pc = code.dex_pc_for_native_pc(method, quick.native_pc);
        let Some(bitmap) = code.reference_bitmap(method, dex_pc) else {
            fatal!(
                "no reference map for {} at dex pc {dex_pc:#x} (native pc {:#x})",
                method.pretty_name(),
                quick.native_pc
            );
        };

        let num_regs = bitmap.width_bits().min(usize::from(method.registers_size));
        for reg in (0..num_regs).filter(|reg| bitmap.is_set(*reg)) {
            let raw = match code.vreg_location(method, reg as u16) {
                VRegLocation::Context { vmap_offset } => {
                    let register = method.spilled_register(vmap_offset);
                    let Some(context) = frame.context() else {
                        fatal!("register-resident v{reg} in {} walked without a context", method.pretty_name());
                    };
                    match context.gpr(register) {
                        Some(value) => value,
                        None => fatal!(
                            "v{reg} of {} lives in r{register}, whose value is unknown",
                            method.pretty_name()
                        ),
                    }
                }
                VRegLocation::Stack { slot } => match quick.slots.get(slot) {
                    Some(value) => *value,
                    None => fatal!(
                        "v{reg} of {} lives in slot {slot} beyond the frame's {} slots",
                        method.pretty_name(),
                        quick.slots.len()
                    ),
                },
            };
            if let Some(object) = ObjectRef::from_raw(raw) {
                (self.visitor)(object);
            }
        }
    }
}

impl StackVisitor for ReferenceMapVisitor<'_> {
    fn visit_frame(&mut self, frame: &FrameView<'_>) -> WalkControl {
        match frame.shadow_frame() {
            Some(shadow) => shadow
                .references
                .iter()
                .flatten()
                .for_each(|object| (self.visitor)(*object)),
            None => self.visit_compiled(frame),
        }
        WalkControl::Continue
    }
}

impl Thread {
    /// Visits every root this thread holds.
    ///
    /// The thread must be suspended, or be the caller, for the frame scan to
    /// see a consistent stack.
    pub fn visit_roots(&self, visitor: &mut dyn FnMut(ObjectRef)) {
        let held = [
            self.peer(),
            self.exception(),
            self.class_loader_override(),
            self.monitor_enter_object(),
        ];
        held.into_iter().flatten().for_each(|object| visitor(object));

        self.locals.lock().visit_roots(visitor);
        for scope in self.scopes.lock().iter() {
            scope.visit_roots(visitor);
        }
        self.visit_stack_roots(visitor);
    }

    fn visit_stack_roots(&self, visitor: &mut dyn FnMut(ObjectRef)) {
        let runtime = self.runtime();
        let stack = self.managed_stack.lock();
        let mut context = Context::new();
        StackWalker::new(&stack, runtime.code())
            .with_context(&mut context)
            .walk(&mut ReferenceMapVisitor::new(visitor));
    }

    /// Hands every reference on the managed stack to the object model's
    /// verifier.
    pub fn verify_stack(&self) {
        let runtime = self.runtime();
        let objects = runtime.objects();
        self.visit_stack_roots(&mut |object| objects.verify_object(object));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::object::ClassRef;
    use crate::reference::ReferenceScope;
    use crate::stack::{Method, ReferenceBitmap};
    use crate::test_utils::{attach_main, test_runtime};
    use crate::well_known;

    fn collect(thread: &Thread) -> Vec<usize> {
        let mut roots = Vec::new();
        thread.visit_roots(&mut |object| roots.push(object.addr()));
        roots.sort_unstable();
        roots
    }

    #[test]
    fn compiled_frame_roots_follow_the_reference_map() {
        let (runtime, objects, code) = test_runtime();
        let thread = attach_main(&runtime);
        let in_slot = objects.new_instance(well_known::OBJECT);
        let in_register = objects.new_instance(well_known::OBJECT);
        let not_a_reference = objects.new_instance(well_known::OBJECT);

        // v0 in slot 0, v1 spilled to r6, v2 holds a non-reference, v3 null.
        let method = Arc::new(
            Method::new("compute", ClassRef(9), "LCalc;")
                .with_registers(4)
                .with_core_spill_mask(1 << 6),
        );
        code.set_reference_bitmap(&method, ReferenceBitmap::from_registers(&[0, 1, 3]));
        code.set_vreg_location(&method, 1, VRegLocation::Context { vmap_offset: 0 });
        code.set_vreg_location(&method, 3, VRegLocation::Stack { slot: 3 });

        thread.with_managed_stack(|stack| {
            stack.push_upcall(0x10);
            stack.push_quick(
                Arc::clone(&method),
                0x1008,
                vec![in_slot.addr(), 0, not_a_reference.addr(), 0],
                Vec::new(),
            );
            stack.capture_registers(vec![(6, in_register.addr())]);
        });

        let mut expected = vec![in_slot.addr(), in_register.addr()];
        expected.sort_unstable();
        assert_eq!(collect(&thread), expected);
        runtime.detach_current_thread();
    }

    #[test]
    fn register_values_come_from_the_callee_that_saved_them() {
        let (runtime, objects, code) = test_runtime();
        let thread = attach_main(&runtime);
        let outer_value = objects.new_instance(well_known::OBJECT);
        let clobbered = objects.new_instance(well_known::OBJECT);

        let outer = Arc::new(Method::new("outer", ClassRef(9), "LCalc;").with_registers(1).with_core_spill_mask(1 << 7));
        code.set_reference_bitmap(&outer, ReferenceBitmap::from_registers(&[0]));
        code.set_vreg_location(&outer, 0, VRegLocation::Context { vmap_offset: 0 });
        let inner = Arc::new(Method::new("inner", ClassRef(9), "LCalc;"));

        thread.with_managed_stack(|stack| {
            stack.push_quick(Arc::clone(&outer), 0x1000, Vec::new(), Vec::new());
            stack.push_quick(inner, 0x1000, Vec::new(), vec![(7, outer_value.addr())]);
            stack.capture_registers(vec![(7, clobbered.addr())]);
        });

        assert_eq!(collect(&thread), vec![outer_value.addr()]);
        runtime.detach_current_thread();
    }

    #[test]
    fn thread_level_roots_are_reported() {
        let (runtime, objects, _) = test_runtime();
        let thread = attach_main(&runtime);
        let exception = objects.new_instance(well_known::THROWABLE);
        let local = objects.new_instance(well_known::OBJECT);
        let scoped = objects.new_instance(well_known::OBJECT);
        let interpreted = objects.new_instance(well_known::OBJECT);

        thread.set_exception(exception);
        let handle = thread.add_local_reference(local);
        let mut scope = ReferenceScope::new(2);
        scope.set(1, Some(scoped));
        thread.push_reference_scope(scope);
        thread.with_managed_stack(|stack| {
            stack.push_shadow(
                Arc::new(Method::new("run", ClassRef(9), "LCalc;")),
                0,
                vec![None, Some(interpreted)],
            );
        });

        let mut expected = vec![exception.addr(), local.addr(), scoped.addr(), interpreted.addr()];
        expected.sort_unstable();
        assert_eq!(collect(&thread), expected);

        thread.verify_stack();
        thread.clear_exception();
        thread.delete_local_reference(handle);
        runtime.detach_current_thread();
    }

    #[test]
    #[should_panic(expected = "no reference map")]
    fn missing_reference_map_is_fatal() {
        let (runtime, _, code) = test_runtime();
        let thread = attach_main(&runtime);
        let method = Arc::new(Method::new("opaque", ClassRef(9), "LCalc;").with_registers(2));
        code.clear_reference_bitmap(&method);
        thread.with_managed_stack(|stack| {
            stack.push_quick(method, 0x1000, Vec::new(), Vec::new());
        });
        thread.visit_roots(&mut |_| {});
    }

    #[test]
    #[should_panic(expected = "verify")]
    fn verify_stack_rejects_bogus_references() {
        let (runtime, _, _) = test_runtime();
        let thread = attach_main(&runtime);
        thread.with_managed_stack(|stack| {
            stack.push_shadow(
                Arc::new(Method::new("run", ClassRef(9), "LCalc;")),
                0,
                vec![ObjectRef::from_raw(0xdead_0000)],
            );
        });
        thread.verify_stack();
    }
}
