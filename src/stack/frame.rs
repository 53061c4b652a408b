//! Managed frames and the per-thread frame chain.

use std::fmt;
use std::sync::Arc;

use crate::object::ObjectRef;

use super::Method;

/// Identifies a frame for the lifetime of the thread's stack. Frame ids grow
/// from the outermost frame inwards and are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameId(pub u64);

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A frame of compiled code. Locals live in stack slots or in registers
/// described by the method's metadata.
#[derive(Debug, Clone)]
pub struct QuickFrame {
    pub id: FrameId,
    pub method: Arc<Method>,
    pub native_pc: usize,
    /// Raw stack slots addressed by [`VRegLocation::Stack`](super::VRegLocation).
    pub slots: Vec<usize>,
    /// `(register, value)` pairs this frame's prologue saved: the caller's
    /// register contents at the call.
    pub callee_saves: Vec<(usize, usize)>,
}

/// An interpreter frame holding its locals directly.
#[derive(Debug, Clone)]
pub struct ShadowFrame {
    pub id: FrameId,
    pub method: Arc<Method>,
    pub dex_pc: u32,
    pub vregs: Vec<u32>,
    pub references: Vec<Option<ObjectRef>>,
}

/// Native code that called into managed code. Carries no method.
#[derive(Debug, Clone)]
pub struct UpcallFrame {
    pub id: FrameId,
    pub native_pc: usize,
}

#[derive(Debug, Clone)]
pub enum Frame {
    Quick(QuickFrame),
    Shadow(ShadowFrame),
    Upcall(UpcallFrame),
}

impl Frame {
    pub fn id(&self) -> FrameId {
        match self {
            Frame::Quick(frame) => frame.id,
            Frame::Shadow(frame) => frame.id,
            Frame::Upcall(frame) => frame.id,
        }
    }

    pub fn method(&self) -> Option<&Arc<Method>> {
        match self {
            Frame::Quick(frame) => Some(&frame.method),
            Frame::Shadow(frame) => Some(&frame.method),
            Frame::Upcall(_) => None,
        }
    }
}

/// The chain of managed frames of one thread, outermost first.
#[derive(Debug, Default)]
pub struct ManagedStack {
    frames: Vec<Frame>,
    next_id: u64,
    /// Register file captured when the thread last left managed code.
    top_registers: Vec<(usize, usize)>,
}

impl ManagedStack {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate_id(&mut self) -> FrameId {
        self.next_id += 1;
        FrameId(self.next_id)
    }

    pub fn push_quick(
        &mut self,
        method: Arc<Method>,
        native_pc: usize,
        slots: Vec<usize>,
        callee_saves: Vec<(usize, usize)>,
    ) -> FrameId {
        let id = self.allocate_id();
        self.frames.push(Frame::Quick(QuickFrame {
            id,
            method,
            native_pc,
            slots,
            callee_saves,
        }));
        id
    }

    pub fn push_shadow(&mut self, method: Arc<Method>, dex_pc: u32, references: Vec<Option<ObjectRef>>) -> FrameId {
        let id = self.allocate_id();
        self.frames.push(Frame::Shadow(ShadowFrame {
            id,
            method,
            dex_pc,
            vregs: Vec::new(),
            references,
        }));
        id
    }

    pub fn push_upcall(&mut self, native_pc: usize) -> FrameId {
        let id = self.allocate_id();
        self.frames.push(Frame::Upcall(UpcallFrame { id, native_pc }));
        id
    }

    pub fn pop(&mut self) -> Option<Frame> {
        self.frames.pop()
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Frames from the innermost outwards.
    pub fn iter_innermost_first(&self) -> impl Iterator<Item = &Frame> {
        self.frames.iter().rev()
    }

    pub fn frame(&self, id: FrameId) -> Option<&Frame> {
        self.frames.iter().find(|frame| frame.id() == id)
    }

    pub fn frame_mut(&mut self, id: FrameId) -> Option<&mut Frame> {
        self.frames.iter_mut().find(|frame| frame.id() == id)
    }

    pub fn top(&self) -> Option<&Frame> {
        self.frames.last()
    }

    pub fn top_mut(&mut self) -> Option<&mut Frame> {
        self.frames.last_mut()
    }

    /// Discards every frame newer than `id`, keeping `id` itself. Returns the
    /// ids of the discarded frames.
    pub fn unwind_to(&mut self, id: FrameId) -> Vec<FrameId> {
        match self.frames.iter().position(|frame| frame.id() == id) {
            Some(position) => self.frames.drain(position + 1..).map(|frame| frame.id()).collect(),
            None => Vec::new(),
        }
    }

    /// Discards `id` and every frame newer than it.
    pub fn unwind_past(&mut self, id: FrameId) -> Vec<FrameId> {
        match self.frames.iter().position(|frame| frame.id() == id) {
            Some(position) => self.frames.drain(position..).map(|frame| frame.id()).collect(),
            None => Vec::new(),
        }
    }

    pub fn capture_registers(&mut self, registers: Vec<(usize, usize)>) {
        self.top_registers = registers;
    }

    pub fn top_registers(&self) -> &[(usize, usize)] {
        &self.top_registers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ClassRef;

    fn method(name: &str) -> Arc<Method> {
        Arc::new(Method::new(name, ClassRef(1), "LTest;"))
    }

    #[test]
    fn unwind_to_keeps_target_frame() {
        let mut stack = ManagedStack::new();
        let upcall = stack.push_upcall(0x10);
        let outer = stack.push_shadow(method("outer"), 0, Vec::new());
        let inner = stack.push_shadow(method("inner"), 3, Vec::new());
        let innermost = stack.push_quick(method("innermost"), 0x2000, Vec::new(), Vec::new());

        assert_eq!(stack.unwind_to(outer), vec![inner, innermost]);
        assert_eq!(stack.top().map(Frame::id), Some(outer));
        assert_eq!(stack.unwind_past(upcall), vec![upcall, outer]);
        assert!(stack.is_empty());
    }

    #[test]
    fn frame_ids_are_not_reused() {
        let mut stack = ManagedStack::new();
        let first = stack.push_upcall(0);
        stack.pop();
        let second = stack.push_upcall(0);
        assert!(second > first);
    }
}
