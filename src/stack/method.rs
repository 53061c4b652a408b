//! Method metadata as seen by the stack walker.

use bitflags::bitflags;

use crate::object::{ClassRef, ObjectModel, pretty_descriptor};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MethodFlags: u32 {
        const STATIC = 1 << 0;
        /// Implemented in native code; has no bytecode or reference maps.
        const NATIVE = 1 << 1;
        /// Runtime-internal trampoline or callee-save frame.
        const RUNTIME = 1 << 2;
        const PROXY = 1 << 3;
    }
}

/// One entry of a method's exception table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatchHandler {
    /// First bytecode offset covered, inclusive.
    pub start_pc: u32,
    /// End of the covered range, exclusive.
    pub end_pc: u32,
    /// `None` catches everything.
    pub catch_type: Option<ClassRef>,
    pub handler_pc: u32,
}

impl CatchHandler {
    pub fn covers(&self, dex_pc: u32) -> bool {
        (self.start_pc..self.end_pc).contains(&dex_pc)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Method {
    pub name: String,
    pub declaring_class: ClassRef,
    /// Descriptor of the declaring class, e.g. `Lcom/example/Foo;`.
    pub class_descriptor: String,
    pub source_file: Option<String>,
    pub flags: MethodFlags,
    /// Number of virtual registers the method's frames carry.
    pub registers_size: u16,
    /// Bit `n` set when core register `n` is spilled by the method's prologue.
    pub core_spill_mask: u32,
    pub catch_handlers: Vec<CatchHandler>,
}

impl Method {
    pub fn new(name: impl Into<String>, declaring_class: ClassRef, class_descriptor: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            declaring_class,
            class_descriptor: class_descriptor.into(),
            source_file: None,
            flags: MethodFlags::empty(),
            registers_size: 0,
            core_spill_mask: 0,
            catch_handlers: Vec::new(),
        }
    }

    /// A runtime-internal method, e.g. a callee-save frame.
    pub fn runtime(name: impl Into<String>) -> Self {
        Self::new(name, ClassRef(0), "Lruntime;").with_flags(MethodFlags::RUNTIME)
    }

    pub fn with_source_file(mut self, file: impl Into<String>) -> Self {
        self.source_file = Some(file.into());
        self
    }

    pub fn with_flags(mut self, flags: MethodFlags) -> Self {
        self.flags |= flags;
        self
    }

    pub fn with_registers(mut self, registers_size: u16) -> Self {
        self.registers_size = registers_size;
        self
    }

    pub fn with_core_spill_mask(mut self, mask: u32) -> Self {
        self.core_spill_mask = mask;
        self
    }

    pub fn with_catch_handler(mut self, handler: CatchHandler) -> Self {
        self.catch_handlers.push(handler);
        self
    }

    pub fn is_native(&self) -> bool {
        self.flags.contains(MethodFlags::NATIVE)
    }

    pub fn is_runtime(&self) -> bool {
        self.flags.contains(MethodFlags::RUNTIME)
    }

    pub fn is_proxy(&self) -> bool {
        self.flags.contains(MethodFlags::PROXY)
    }

    /// `com.example.Foo.bar`
    pub fn pretty_name(&self) -> String {
        format!("{}.{}", pretty_descriptor(&self.class_descriptor), self.name)
    }

    /// Handler offset for an exception of `exception_class` thrown at `dex_pc`.
    /// Entries are tried in table order; the first covering, matching entry wins.
    pub fn find_catch_block(
        &self,
        objects: &dyn ObjectModel,
        exception_class: ClassRef,
        dex_pc: u32,
    ) -> Option<u32> {
        self.catch_handlers
            .iter()
            .filter(|handler| handler.covers(dex_pc))
            .find(|handler| match handler.catch_type {
                None => true,
                Some(catch_type) => objects.is_assignable_from(catch_type, exception_class),
            })
            .map(|handler| handler.handler_pc)
    }

    /// Core register holding the value at `vmap_offset` among this method's
    /// spilled registers, i.e. the position of the `vmap_offset`-th set bit of
    /// the spill mask.
    pub fn spilled_register(&self, vmap_offset: u32) -> usize {
        if vmap_offset >= self.core_spill_mask.count_ones() {
            fatal!(
                "vmap offset {vmap_offset} out of range for spill mask {:#x} in {}",
                self.core_spill_mask,
                self.pretty_name()
            );
        }
        let mut mask = self.core_spill_mask;
        let mut matches = 0;
        let mut shifts = 0;
        while matches != vmap_offset + 1 {
            matches += mask & 1;
            mask >>= 1;
            shifts += 1;
        }
        shifts - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spilled_register_follows_mask_bits() {
        let method = Method::new("m", ClassRef(1), "LFoo;").with_core_spill_mask(0b1011_0000);
        assert_eq!(method.spilled_register(0), 4);
        assert_eq!(method.spilled_register(1), 5);
        assert_eq!(method.spilled_register(2), 7);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn spilled_register_beyond_mask_is_fatal() {
        let method = Method::new("m", ClassRef(1), "LFoo;").with_core_spill_mask(0b1);
        method.spilled_register(1);
    }

    #[test]
    fn pretty_name_uses_dotted_class() {
        let method = Method::new("run", ClassRef(1), "Lcom/example/Worker;");
        assert_eq!(method.pretty_name(), "com.example.Worker.run");
    }

    #[test]
    fn catch_handler_range_is_half_open() {
        let handler = CatchHandler {
            start_pc: 2,
            end_pc: 6,
            catch_type: None,
            handler_pc: 10,
        };
        assert!(!handler.covers(1));
        assert!(handler.covers(2));
        assert!(handler.covers(5));
        assert!(!handler.covers(6));
    }
}
