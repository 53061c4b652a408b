//! Opaque reference handles and their resolution.
//!
//! Native code never sees object addresses directly. It holds an
//! [`IndirectRef`] whose low two bits name the table the handle belongs to:
//!
//! | bits | kind |
//! |------|------|
//! | `00` | reference-scope slot address, or invalid |
//! | `01` | local (per-thread table) |
//! | `10` | global |
//! | `11` | weak global |
//!
//! Table handles additionally carry a slot index and a serial number so a
//! deleted handle is detected even after its slot was reused.

mod table;

use std::fmt;
use std::mem;

pub use table::{IndirectReferenceTable, Lookup};

use crate::error::ReferenceError;
use crate::locks::{LockLevel, RankedMutex};
use crate::object::ObjectRef;
use crate::stack::FrameId;
use crate::thread::Thread;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum IndirectRefKind {
    ScopeOrInvalid = 0,
    Local = 1,
    Global = 2,
    WeakGlobal = 3,
}

impl fmt::Display for IndirectRefKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IndirectRefKind::ScopeOrInvalid => "reference scope entry",
            IndirectRefKind::Local => "local reference",
            IndirectRefKind::Global => "global reference",
            IndirectRefKind::WeakGlobal => "weak global reference",
        };
        f.write_str(name)
    }
}

/// An opaque handle to an object. Zero is the null handle.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct IndirectRef(u64);

impl IndirectRef {
    pub const NULL: IndirectRef = IndirectRef(0);

    const KIND_BITS: u32 = 2;
    const INDEX_BITS: u32 = 22;
    const INDEX_MASK: u64 = (1 << Self::INDEX_BITS) - 1;
    pub(crate) const MAX_INDEX: usize = Self::INDEX_MASK as usize;

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    pub(crate) fn encode(kind: IndirectRefKind, index: u32, serial: u32) -> Self {
        let raw = (u64::from(serial) << (Self::KIND_BITS + Self::INDEX_BITS))
            | ((u64::from(index) & Self::INDEX_MASK) << Self::KIND_BITS)
            | kind as u64;
        Self(raw)
    }

    pub fn kind(self) -> IndirectRefKind {
        match self.0 & 0b11 {
            1 => IndirectRefKind::Local,
            2 => IndirectRefKind::Global,
            3 => IndirectRefKind::WeakGlobal,
            _ => IndirectRefKind::ScopeOrInvalid,
        }
    }

    pub(crate) fn index(self) -> u32 {
        ((self.0 >> Self::KIND_BITS) & Self::INDEX_MASK) as u32
    }

    pub(crate) fn serial(self) -> u32 {
        (self.0 >> (Self::KIND_BITS + Self::INDEX_BITS)) as u32
    }
}

impl fmt::Debug for IndirectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IndirectRef({:#x}, {:?})", self.0, self.kind())
    }
}

impl fmt::Display for IndirectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// A block of reference slots pushed by native code for the duration of a
/// call. Handles to its slots are the slot addresses themselves.
#[derive(Debug)]
pub struct ReferenceScope {
    slots: Box<[Option<ObjectRef>]>,
    owner: Option<FrameId>,
}

impl ReferenceScope {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![None; capacity].into_boxed_slice(),
            owner: None,
        }
    }

    /// A scope that belongs to a managed frame and is discarded with it when
    /// an exception unwinds past that frame.
    pub fn owned_by(capacity: usize, frame: FrameId) -> Self {
        Self {
            owner: Some(frame),
            ..Self::new(capacity)
        }
    }

    pub fn owner(&self) -> Option<FrameId> {
        self.owner
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of populated slots.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn set(&mut self, index: usize, object: Option<ObjectRef>) {
        self.slots[index] = object;
    }

    pub fn get(&self, index: usize) -> Option<ObjectRef> {
        self.slots[index]
    }

    pub fn handle(&self, index: usize) -> IndirectRef {
        IndirectRef::from_raw(&self.slots[index] as *const Option<ObjectRef> as u64)
    }

    /// Index of the slot `handle` addresses, if it points into this scope.
    pub fn slot_index(&self, handle: IndirectRef) -> Option<usize> {
        let base = self.slots.as_ptr() as u64;
        let stride = mem::size_of::<Option<ObjectRef>>() as u64;
        let offset = handle.raw().checked_sub(base)?;
        let index = offset / stride;
        (offset % stride == 0 && index < self.slots.len() as u64).then_some(index as usize)
    }

    pub fn visit_roots(&self, visitor: &mut dyn FnMut(ObjectRef)) {
        self.slots.iter().flatten().for_each(|object| visitor(*object));
    }
}

/// Process-wide global and weak-global tables, each under its own lock.
pub struct ReferenceTables {
    globals: RankedMutex<IndirectReferenceTable>,
    weak_globals: RankedMutex<IndirectReferenceTable>,
}

impl ReferenceTables {
    pub fn new(check_locks: bool) -> Self {
        Self {
            globals: RankedMutex::new(
                "JNI global reference table lock",
                LockLevel::JniGlobals,
                check_locks,
                IndirectReferenceTable::new(IndirectRefKind::Global),
            ),
            weak_globals: RankedMutex::new(
                "JNI weak global reference table lock",
                LockLevel::JniWeakGlobals,
                check_locks,
                IndirectReferenceTable::new(IndirectRefKind::WeakGlobal),
            ),
        }
    }

    pub fn add_global(&self, object: ObjectRef) -> IndirectRef {
        self.globals.lock().add(object)
    }

    pub fn delete_global(&self, handle: IndirectRef) -> bool {
        self.globals.lock().remove(handle)
    }

    pub fn add_weak_global(&self, object: ObjectRef) -> IndirectRef {
        self.weak_globals.lock().add(object)
    }

    pub fn delete_weak_global(&self, handle: IndirectRef) -> bool {
        self.weak_globals.lock().remove(handle)
    }

    pub fn lookup_global(&self, handle: IndirectRef) -> Lookup {
        self.globals.lock().get(handle)
    }

    pub fn lookup_weak_global(&self, handle: IndirectRef) -> Lookup {
        self.weak_globals.lock().get(handle)
    }

    /// Clears weak globals whose referents the collector did not mark.
    pub fn sweep_weak_globals(&self, is_live: impl FnMut(ObjectRef) -> bool) -> usize {
        self.weak_globals.lock().sweep(is_live)
    }

    /// Global references are strong roots; weak globals are not.
    pub fn visit_roots(&self, visitor: &mut dyn FnMut(ObjectRef)) {
        self.globals.lock().visit_roots(visitor);
    }

    pub fn global_count(&self) -> usize {
        self.globals.lock().len()
    }

    pub fn weak_global_count(&self) -> usize {
        self.weak_globals.lock().len()
    }
}

impl Thread {
    pub fn add_local_reference(&self, object: ObjectRef) -> IndirectRef {
        self.locals.lock().add(object)
    }

    pub fn delete_local_reference(&self, handle: IndirectRef) -> bool {
        self.locals.lock().remove(handle)
    }

    pub fn local_reference_count(&self) -> usize {
        self.locals.lock().len()
    }

    pub fn push_reference_scope(&self, scope: ReferenceScope) {
        self.scopes.lock().push(scope);
    }

    pub fn pop_reference_scope(&self) -> Option<ReferenceScope> {
        self.scopes.lock().pop()
    }

    /// Runs `f` on the innermost reference scope.
    pub fn with_top_reference_scope<R>(&self, f: impl FnOnce(&mut ReferenceScope) -> R) -> Option<R> {
        self.scopes.lock().last_mut().map(f)
    }

    /// Whether `handle` addresses a slot of one of this thread's scopes.
    pub fn scope_contains(&self, handle: IndirectRef) -> bool {
        self.scopes
            .lock()
            .iter()
            .any(|scope| scope.slot_index(handle).is_some())
    }

    /// Total number of populated slots across all reference scopes.
    pub fn num_scope_references(&self) -> usize {
        self.scopes.lock().iter().map(ReferenceScope::len).sum()
    }

    fn scope_lookup(&self, handle: IndirectRef) -> Option<Option<ObjectRef>> {
        self.scopes.lock().iter().rev().find_map(|scope| {
            scope
                .slot_index(handle)
                .map(|index| scope.get(index))
        })
    }

    /// Resolves `handle` to the object it stands for.
    ///
    /// A cleared weak global resolves to `Ok(None)`. A recognized handle
    /// whose slot is empty or deleted, and a handle nobody recognizes, are
    /// errors.
    pub fn try_decode_reference(
        &self,
        handle: IndirectRef,
    ) -> Result<Option<ObjectRef>, ReferenceError> {
        if handle.is_null() {
            return Ok(None);
        }
        let runtime = self.runtime();
        let kind = handle.kind();
        let resolved = match kind {
            IndirectRefKind::Local => match self.locals.lock().get(handle) {
                Lookup::Live(object) => Some(object),
                Lookup::Cleared | Lookup::Deleted => None,
            },
            IndirectRefKind::Global => match runtime.references().lookup_global(handle) {
                Lookup::Live(object) => Some(object),
                Lookup::Cleared | Lookup::Deleted => None,
            },
            IndirectRefKind::WeakGlobal => match runtime.references().lookup_weak_global(handle) {
                Lookup::Live(object) => Some(object),
                Lookup::Cleared => return Ok(None),
                Lookup::Deleted => None,
            },
            IndirectRefKind::ScopeOrInvalid => match self.scope_lookup(handle) {
                Some(slot) => slot,
                None if runtime.config().work_around_app_jni_bugs => {
                    ObjectRef::from_raw(handle.raw() as usize)
                }
                None => return Err(ReferenceError::Invalid(handle)),
            },
        };

        let Some(object) = resolved else {
            return Err(ReferenceError::Deleted { kind, handle });
        };
        if runtime.config().verify_objects {
            runtime.objects().verify_object(object);
        }
        Ok(Some(object))
    }

    /// Like [`try_decode_reference`](Self::try_decode_reference) but treats a
    /// bad handle as a fatal native-interface error.
    pub fn decode_reference(&self, handle: IndirectRef) -> Option<ObjectRef> {
        match self.try_decode_reference(handle) {
            Ok(object) => object,
            Err(err) => fatal!("JNI ERROR (app bug): {err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_fields_round_trip() {
        let handle = IndirectRef::encode(IndirectRefKind::WeakGlobal, 17, 3);
        assert_eq!(handle.kind(), IndirectRefKind::WeakGlobal);
        assert_eq!(handle.index(), 17);
        assert_eq!(handle.serial(), 3);
    }

    #[test]
    fn scope_slot_handles_are_scope_kind() {
        let mut scope = ReferenceScope::new(4);
        let object = ObjectRef::from_raw(0x4000).unwrap();
        scope.set(2, Some(object));

        let handle = scope.handle(2);
        assert_eq!(handle.kind(), IndirectRefKind::ScopeOrInvalid);
        assert_eq!(scope.slot_index(handle), Some(2));
        assert_eq!(scope.slot_index(IndirectRef::from_raw(handle.raw() + 1)), None);
        assert_eq!(scope.len(), 1);

        let mut roots = Vec::new();
        scope.visit_roots(&mut |o| roots.push(o));
        assert_eq!(roots, vec![object]);
    }
}
