//! Order-indexed dispatch table.
//!
//! The roster maps an allocation size order to the component that serves
//! it, so the hot path is a single atomic load. Entries change over time:
//! a quantum allocator publishes one of its partitions as the direct server
//! for an order, removing itself as middleman, and takes the slot back when
//! the partition goes offline. Racing stores are all valid serves, so plain
//! atomic stores suffice and no compare-exchange is needed.
//!
//! An entry is a tagged value packed into a `u64`; there is no allocator
//! object behind an unsupported order, just [`RosterEntry::None`].

use std::array;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::common::MAX_ROSTER;

const TAG_MASK: u64 = 0xFF;
const TAG_NONE: u64 = 0;
const TAG_QUANTUM: u64 = 1;
const TAG_PARTITION: u64 = 2;
const TAG_SLAB: u64 = 3;

const ALLOCATOR_SHIFT: u32 = 8;
const ALLOCATOR_MASK: u64 = 0xFF;
const SLOT_SHIFT: u32 = 16;
const SLOT_MASK: u64 = 0xFFFF_FFFF;

/// The component an order routes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RosterEntry {
    /// Unsupported order: allocation yields 0.
    None,
    /// Route to a quantum allocator.
    Quantum {
        /// Index of the quantum allocator.
        allocator: usize,
    },
    /// Route straight to one partition of a quantum allocator.
    Partition {
        /// Index of the owning quantum allocator.
        allocator: usize,
        /// Partition slot within the allocator.
        slot: usize,
    },
    /// Route to the slab allocator.
    Slab,
}

fn pack(entry: RosterEntry) -> u64 {
    match entry {
        RosterEntry::None => TAG_NONE,
        RosterEntry::Quantum { allocator } => {
            TAG_QUANTUM | ((allocator as u64) << ALLOCATOR_SHIFT)
        }
        RosterEntry::Partition { allocator, slot } => {
            TAG_PARTITION | ((allocator as u64) << ALLOCATOR_SHIFT) | ((slot as u64) << SLOT_SHIFT)
        }
        RosterEntry::Slab => TAG_SLAB,
    }
}

fn unpack(word: u64) -> RosterEntry {
    match word & TAG_MASK {
        TAG_QUANTUM => RosterEntry::Quantum {
            allocator: ((word >> ALLOCATOR_SHIFT) & ALLOCATOR_MASK) as usize,
        },
        TAG_PARTITION => RosterEntry::Partition {
            allocator: ((word >> ALLOCATOR_SHIFT) & ALLOCATOR_MASK) as usize,
            slot: ((word >> SLOT_SHIFT) & SLOT_MASK) as usize,
        },
        TAG_SLAB => RosterEntry::Slab,
        _ => RosterEntry::None,
    }
}

/// Atomic table of allocator assignments indexed by size order.
#[derive(Debug)]
pub struct Roster {
    entries: [AtomicU64; MAX_ROSTER],
}

impl Roster {
    /// Creates a roster with every order unassigned.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: array::from_fn(|_| AtomicU64::new(TAG_NONE)),
        }
    }

    /// Returns the entry assigned to `order`.
    #[must_use]
    pub fn get(&self, order: u32) -> RosterEntry {
        debug_assert!((order as usize) < MAX_ROSTER, "order out of range: {order}");
        unpack(self.entries[order as usize].load(Ordering::SeqCst))
    }

    /// Assigns an entry to a specific order.
    pub fn set(&self, order: u32, entry: RosterEntry) {
        debug_assert!((order as usize) < MAX_ROSTER, "order out of range: {order}");
        self.entries[order as usize].store(pack(entry), Ordering::SeqCst);
    }

    /// Assigns an entry to every order in `lo..=hi`.
    pub fn set_range(&self, entry: RosterEntry, lo: u32, hi: u32) {
        debug_assert!(lo <= hi && (hi as usize) < MAX_ROSTER, "bad order range");
        for order in lo..=hi {
            self.set(order, entry);
        }
    }
}

impl Default for Roster {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_round_trip() {
        let entries = [
            RosterEntry::None,
            RosterEntry::Quantum { allocator: 2 },
            RosterEntry::Partition {
                allocator: 1,
                slot: 16383,
            },
            RosterEntry::Slab,
        ];
        for entry in entries {
            assert_eq!(unpack(pack(entry)), entry);
        }
    }

    #[test]
    fn test_defaults_to_none() {
        let roster = Roster::new();
        for order in 0..MAX_ROSTER as u32 {
            assert_eq!(roster.get(order), RosterEntry::None);
        }
    }

    #[test]
    fn test_set_range() {
        let roster = Roster::new();
        roster.set_range(RosterEntry::Slab, 27, 48);
        assert_eq!(roster.get(26), RosterEntry::None);
        assert_eq!(roster.get(27), RosterEntry::Slab);
        assert_eq!(roster.get(48), RosterEntry::Slab);
        assert_eq!(roster.get(49), RosterEntry::None);
    }

    #[test]
    fn test_overwrite() {
        let roster = Roster::new();
        roster.set(12, RosterEntry::Quantum { allocator: 1 });
        roster.set(
            12,
            RosterEntry::Partition {
                allocator: 1,
                slot: 3,
            },
        );
        assert_eq!(
            roster.get(12),
            RosterEntry::Partition {
                allocator: 1,
                slot: 3
            }
        );
    }
}
