//! Free-list backed handle table.
//!
//! Handles are small integers handed across the host/guest boundary, so freed
//! slots are reused before the table grows. Slot `0` is never handed out: it
//! is the sentinel holding the head of the free list.

use core::mem;

/// The maximum handle value, keeping the upper bit free for use by the guest.
const MAX_HANDLE: u32 = 1 << 30;

/// Errors produced by [`ResourceTable`] operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TableError {
    /// The handle is `0`, out of range, or refers to a free slot.
    #[error("invalid resource handle {0}")]
    InvalidHandle(u32),
    /// No more handles can be allocated.
    #[error("resource table has no free handles")]
    Full,
}

enum Slot<T> {
    /// A free slot, or the sentinel. `next == 0` terminates the free list.
    Free { next: u32 },
    Occupied(T),
}

/// A table of values indexed by `u32` handles starting at `1`.
pub struct ResourceTable<T> {
    slots: Vec<Slot<T>>,
    len: usize,
}

impl<T> Default for ResourceTable<T> {
    fn default() -> Self {
        ResourceTable::new()
    }
}

impl<T> ResourceTable<T> {
    /// Creates an empty table containing only the sentinel slot.
    pub fn new() -> Self {
        ResourceTable {
            slots: vec![Slot::Free { next: 0 }],
            len: 0,
        }
    }

    fn free_head(&self) -> u32 {
        match self.slots[0] {
            Slot::Free { next } => next,
            Slot::Occupied(_) => unreachable!("sentinel slot is never occupied"),
        }
    }

    fn set_free_head(&mut self, head: u32) {
        self.slots[0] = Slot::Free { next: head };
    }

    /// Inserts `value`, returning its new handle.
    pub fn insert(&mut self, value: T) -> Result<u32, TableError> {
        let head = self.free_head();
        let handle = if head == 0 {
            let handle = u32::try_from(self.slots.len()).map_err(|_| TableError::Full)?;
            if handle >= MAX_HANDLE {
                return Err(TableError::Full);
            }
            self.slots.push(Slot::Occupied(value));
            handle
        } else {
            let next = match mem::replace(&mut self.slots[head as usize], Slot::Occupied(value)) {
                Slot::Free { next } => next,
                Slot::Occupied(_) => unreachable!("free list points at occupied slot"),
            };
            self.set_free_head(next);
            head
        };
        self.len += 1;
        Ok(handle)
    }

    fn index(&self, handle: u32) -> Result<usize, TableError> {
        match self.slots.get(handle as usize) {
            Some(Slot::Occupied(_)) if handle != 0 => Ok(handle as usize),
            _ => Err(TableError::InvalidHandle(handle)),
        }
    }

    /// Returns whether `handle` refers to a live entry.
    pub fn contains(&self, handle: u32) -> bool {
        self.index(handle).is_ok()
    }

    pub fn get(&self, handle: u32) -> Result<&T, TableError> {
        match &self.slots[self.index(handle)?] {
            Slot::Occupied(value) => Ok(value),
            Slot::Free { .. } => unreachable!(),
        }
    }

    pub fn get_mut(&mut self, handle: u32) -> Result<&mut T, TableError> {
        let index = self.index(handle)?;
        match &mut self.slots[index] {
            Slot::Occupied(value) => Ok(value),
            Slot::Free { .. } => unreachable!(),
        }
    }

    /// Removes the entry at `handle`, pushing its slot onto the free list.
    pub fn remove(&mut self, handle: u32) -> Result<T, TableError> {
        let index = self.index(handle)?;
        let head = self.free_head();
        let value = match mem::replace(&mut self.slots[index], Slot::Free { next: head }) {
            Slot::Occupied(value) => value,
            Slot::Free { .. } => unreachable!(),
        };
        self.set_free_head(handle);
        self.len -= 1;
        Ok(value)
    }

    /// Drops every entry and resets handle numbering.
    pub fn clear(&mut self) {
        self.slots.truncate(1);
        self.set_free_head(0);
        self.len = 0;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Iterates over live `(handle, value)` pairs in handle order.
    pub fn iter(&self) -> impl Iterator<Item = (u32, &T)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .skip(1)
            .filter_map(|(i, slot)| match slot {
                Slot::Occupied(value) => Some((i as u32, value)),
                Slot::Free { .. } => None,
            })
    }
}
