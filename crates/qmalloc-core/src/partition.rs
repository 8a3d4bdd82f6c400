//! Partition allocator: one quantum-size carving of a single partition.
//!
//! A partition is a power-of-two-sized, equally-aligned sub-range of a
//! quantum allocator's space. At any moment it serves exactly one quantum
//! size order; every bit in its registry is one quantum. Partitions are
//! arena slots owned by their quantum allocator: they are constructed once,
//! never null, and re-targeted in place when an empty slot is reused for a
//! different order. Whether a slot is in service is tracked by the owner's
//! partition registry, not by the slot itself.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::common::{
    is_power_of_two, mask, order_div, order_mul, order_to_size, MAX_ALLOCATION_ORDER,
};
use crate::registry::Registry;
use crate::space::Space;
use crate::vm;

/// Allocator for a specific quantum size in a single partition.
#[derive(Debug)]
pub struct Partition {
    /// Bounds of the partition. Fixed for the life of the slot.
    space: Space,
    /// true if allocations are cleared on deallocation.
    is_secure: bool,
    /// Size order of the quantum served by the current incarnation.
    quantum_size_order: AtomicU32,
    /// Tracks allocation of each quantum in the partition.
    registry: Registry,
}

impl Partition {
    /// Creates a partition slot. Registry storage is sized for the
    /// allocator's smallest order so any later re-target fits in place.
    #[must_use]
    pub fn new(
        is_shared: bool,
        is_secure: bool,
        base: u64,
        partition_size: u64,
        quantum_size_order: u32,
        smallest_size_order: u32,
    ) -> Self {
        debug_assert!(
            is_power_of_two(partition_size) && partition_size != 0,
            "invalid partition size: {partition_size:#x}"
        );
        debug_assert!(base != 0, "base must not be zero");
        debug_assert!(
            quantum_size_order <= MAX_ALLOCATION_ORDER,
            "invalid quantum size order: {quantum_size_order}"
        );

        let capacity = (partition_size >> smallest_size_order) as u32;
        let maximum = (partition_size >> quantum_size_order) as u32;

        Self {
            space: Space::new(base, partition_size),
            is_secure,
            quantum_size_order: AtomicU32::new(quantum_size_order),
            registry: Registry::with_capacity(is_shared, maximum, capacity),
        }
    }

    /// Bounds of the partition.
    #[must_use]
    pub fn space(&self) -> &Space {
        &self.space
    }

    /// Size order of the quantum served by the current incarnation.
    #[must_use]
    pub fn quantum_size_order(&self) -> u32 {
        self.quantum_size_order.load(Ordering::SeqCst)
    }

    /// Size of the quantum served by the current incarnation.
    #[must_use]
    pub fn quantum_size(&self) -> u64 {
        order_to_size(self.quantum_size_order())
    }

    /// Re-targets the slot to serve a different quantum order. Only legal
    /// while the owner holds the offline guarantee for this slot.
    pub fn retarget(&self, quantum_size_order: u32) {
        self.quantum_size_order
            .store(quantum_size_order, Ordering::SeqCst);
        self.registry
            .reset((self.space.size() >> quantum_size_order) as u32);
    }

    /// Returns the index of the quantum containing the address.
    #[must_use]
    pub fn quantum_index(&self, address: u64) -> u32 {
        order_div(address - self.space.base(), self.quantum_size_order()) as u32
    }

    /// Speculatively tests whether the partition has no allocations.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    /// Allocates one quantum. Returns its address, or 0 when the partition
    /// is full or is no longer serving `order` (a caller holding a stale
    /// dispatch entry); the owning quantum allocator handles both by moving
    /// on to another partition.
    pub fn try_allocate(&self, order: u32) -> u64 {
        if order != self.quantum_size_order() {
            return 0;
        }

        match self.registry.find_free() {
            Some(index) => self.space.base() + order_mul(index as u64, order),
            None => 0,
        }
    }

    /// Frees the quantum containing the address.
    pub fn deallocate(&self, address: u64) {
        debug_assert!(address != 0, "address must not be zero");
        debug_assert!(self.space.contains(address), "address outside partition");

        let index = self.quantum_index(address);
        debug_assert!(self.registry.is_set(index), "double deallocate");

        if self.is_secure {
            vm::clear(self.allocation_base(address), self.quantum_size());
        }

        self.registry.free(index);
    }

    /// Zeroes the content of the quantum containing the address.
    pub fn clear(&self, address: u64) {
        vm::clear(self.allocation_base(address), self.quantum_size());
    }

    /// Number of bytes allocated at the address.
    #[must_use]
    pub fn allocation_size(&self, address: u64) -> u64 {
        debug_assert!(self.space.contains(address), "address outside partition");
        self.quantum_size()
    }

    /// Base address of the quantum containing the address.
    #[must_use]
    pub fn allocation_base(&self, address: u64) -> u64 {
        debug_assert!(self.space.contains(address), "address outside partition");
        address & !mask(self.quantum_size())
    }

    /// Returns the next allocated quantum's address after `address`, or 0.
    /// An `address` of 0 starts from the beginning of the partition.
    #[must_use]
    pub fn next_allocation(&self, address: u64) -> u64 {
        debug_assert!(
            address == 0 || self.space.contains(address),
            "address outside partition"
        );
        let initial = if address != 0 {
            self.quantum_index(address) + 1
        } else {
            0
        };
        let order = self.quantum_size_order();

        match self.registry.set_iter(initial).next_set() {
            Some(index) => self.space.base() + order_mul(index as u64, order),
            None => 0,
        }
    }

    /// Adds this partition's sampled allocation counts into the per-order
    /// slots of `counts` and `sizes`.
    pub fn stats(&self, counts: &mut [u64], sizes: &mut [u64]) {
        let order = self.quantum_size_order();
        let count = self.registry.count() as u64;
        counts[order as usize] += count;
        sizes[order as usize] += order_mul(count, order);
    }
}
