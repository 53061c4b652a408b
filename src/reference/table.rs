//! Serial-checked tables backing local, global and weak-global handles.

use crate::object::ObjectRef;

use super::{IndirectRef, IndirectRefKind};

#[derive(Debug, Clone, Copy)]
enum Slot {
    Live { serial: u32, object: ObjectRef },
    /// A weak entry whose referent the collector found dead.
    Cleared { serial: u32 },
    Free { serial: u32 },
}

impl Slot {
    fn serial(self) -> u32 {
        match self {
            Slot::Live { serial, .. } | Slot::Cleared { serial } | Slot::Free { serial } => serial,
        }
    }
}

/// Result of looking a handle up in its table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    Live(ObjectRef),
    /// Weak referent reclaimed by the collector. Not an error.
    Cleared,
    /// The handle was never issued by this table or has been deleted.
    Deleted,
}

/// A table of object references addressed by [`IndirectRef`] handles.
///
/// Slots are reused; every reuse bumps the slot's serial so that a handle to
/// the previous occupant no longer resolves.
#[derive(Debug)]
pub struct IndirectReferenceTable {
    kind: IndirectRefKind,
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

impl IndirectReferenceTable {
    pub fn new(kind: IndirectRefKind) -> Self {
        Self {
            kind,
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
        }
    }

    pub fn kind(&self) -> IndirectRefKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn add(&mut self, object: ObjectRef) -> IndirectRef {
        let (index, serial) = match self.free.pop() {
            Some(index) => {
                let serial = self.slots[index as usize].serial().wrapping_add(1);
                self.slots[index as usize] = Slot::Live { serial, object };
                (index, serial)
            }
            None => {
                let index = self.slots.len();
                if index > IndirectRef::MAX_INDEX {
                    fatal!("{} table overflow ({} entries)", self.kind, index);
                }
                self.slots.push(Slot::Live { serial: 0, object });
                (index as u32, 0)
            }
        };
        self.live += 1;
        IndirectRef::encode(self.kind, index, serial)
    }

    fn slot(&self, handle: IndirectRef) -> Option<(usize, Slot)> {
        if handle.kind() != self.kind {
            return None;
        }
        let index = handle.index() as usize;
        let slot = *self.slots.get(index)?;
        (slot.serial() == handle.serial()).then_some((index, slot))
    }

    pub fn get(&self, handle: IndirectRef) -> Lookup {
        match self.slot(handle) {
            Some((_, Slot::Live { object, .. })) => Lookup::Live(object),
            Some((_, Slot::Cleared { .. })) => Lookup::Cleared,
            Some((_, Slot::Free { .. })) | None => Lookup::Deleted,
        }
    }

    /// Deletes the entry for `handle`. Returns false for unknown or stale handles.
    pub fn remove(&mut self, handle: IndirectRef) -> bool {
        match self.slot(handle) {
            Some((index, Slot::Live { serial, .. } | Slot::Cleared { serial })) => {
                self.slots[index] = Slot::Free { serial };
                self.free.push(index as u32);
                self.live -= 1;
                true
            }
            _ => false,
        }
    }

    /// Clears every live entry whose referent `is_live` rejects. Returns the
    /// number of entries cleared.
    pub fn sweep(&mut self, mut is_live: impl FnMut(ObjectRef) -> bool) -> usize {
        let mut cleared = 0;
        for slot in &mut self.slots {
            if let Slot::Live { serial, object } = *slot {
                if !is_live(object) {
                    *slot = Slot::Cleared { serial };
                    cleared += 1;
                }
            }
        }
        cleared
    }

    pub fn visit_roots(&self, visitor: &mut dyn FnMut(ObjectRef)) {
        for slot in &self.slots {
            if let Slot::Live { object, .. } = slot {
                visitor(*object);
            }
        }
    }
}
