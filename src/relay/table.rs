//! Fixed-capacity connection table.
//!
//! Maps a small integer slot to a connection handle. Slot occupancy is the
//! single source of truth for whether a session is live. Freed slots go to
//! an ordered free pool so allocation always hands out the lowest free
//! index, and an occupied slot is never overwritten.

use std::collections::BTreeSet;
use std::fmt;

/// Identity of a live session: its index in the connection table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(usize);

impl SlotId {
    pub fn new(index: usize) -> Self {
        Self(index)
    }

    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Arena of connection handles with lowest-free-slot allocation.
///
/// Storage grows lazily up to `capacity`; indices released by `remove`
/// are reused before any fresh index is handed out.
pub struct ConnectionTable<C> {
    slots: Vec<Option<C>>,
    /// Released indices below `slots.len()`.
    free: BTreeSet<usize>,
    len: usize,
    capacity: usize,
}

impl<C> ConnectionTable<C> {
    /// Create an empty table that holds at most `capacity` connections.
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: BTreeSet::new(),
            len: 0,
            capacity,
        }
    }

    /// Store a connection in the lowest free slot.
    ///
    /// Returns the connection back if the table is full.
    pub fn insert(&mut self, conn: C) -> Result<SlotId, C> {
        if let Some(index) = self.free.pop_first() {
            debug_assert!(self.slots[index].is_none(), "free slot is occupied");
            self.slots[index] = Some(conn);
            self.len += 1;
            return Ok(SlotId(index));
        }

        if self.slots.len() >= self.capacity {
            return Err(conn);
        }

        self.slots.push(Some(conn));
        self.len += 1;
        Ok(SlotId(self.slots.len() - 1))
    }

    /// Empty a slot, returning the connection that occupied it.
    pub fn remove(&mut self, slot: SlotId) -> Option<C> {
        let conn = self.slots.get_mut(slot.0)?.take()?;
        self.free.insert(slot.0);
        self.len -= 1;
        Some(conn)
    }

    pub fn get(&self, slot: SlotId) -> Option<&C> {
        self.slots.get(slot.0)?.as_ref()
    }

    pub fn get_mut(&mut self, slot: SlotId) -> Option<&mut C> {
        self.slots.get_mut(slot.0)?.as_mut()
    }

    pub fn contains(&self, slot: SlotId) -> bool {
        self.get(slot).is_some()
    }

    /// Number of occupied slots.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.len >= self.capacity
    }

    /// Iterate over occupied slots in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = (SlotId, &C)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, conn)| conn.as_ref().map(|c| (SlotId(index), c)))
    }
}
