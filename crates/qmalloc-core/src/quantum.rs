//! Quantum allocator: a span of memory subdivided into partitions.
//!
//! The top-level allocator runs several quantum allocators so the ratio of
//! partition size to quantum size stays low, which keeps per-partition
//! registries small and fast. Each quantum allocator owns a fixed arena of
//! equal-sized partition slots, a partition registry (bit set = slot handed
//! out, memory committed) and one order registry per handled order (bit set
//! = partition online for that order, reachable by the fast-path
//! iteration). A slot's bit is set in at most one order registry at any
//! time.
//!
//! Partition lifecycle: a slot is claimed from the partition registry and
//! committed, targeted at an order, brought online, and served until every
//! partition for the order is full. When no fresh slot remains, an empty
//! partition of any order can be taken offline, re-targeted and brought
//! back online for the starved order. Offlining is the linearization point
//! for that ownership change: only the thread whose clear actually flipped
//! the order-registry bit proceeds with the rebuild.

use std::sync::Arc;

use log::debug;

use crate::common::{order_div, order_mul, order_to_size, MAX_QUANTUM_ALLOCATOR_ORDERS};
use crate::partition::Partition;
use crate::registry::Registry;
use crate::roster::{Roster, RosterEntry};
use crate::space::Space;
use crate::vm;

/// Manages `partition_count` equal-sized partitions for a contiguous range
/// of quantum size orders.
#[derive(Debug)]
pub struct QuantumAllocator {
    /// Bounds of the managed span.
    space: Space,
    /// Dispatch table shared with the top-level allocator.
    roster: Arc<Roster>,
    /// This allocator's index, used in roster entries.
    self_index: usize,
    /// Size order of the smallest quantum handled.
    smallest_size_order: u32,
    /// Size order of the largest quantum handled.
    largest_size_order: u32,
    /// Order of the partition size.
    partition_size_order: u32,
    /// Size of each partition in bytes.
    partition_size: u64,
    /// Number of partition slots.
    partition_count: u32,
    /// Partition slot arena.
    partitions: Box<[Partition]>,
    /// Bit set = slot handed out to a partition incarnation, committed.
    partition_registry: Registry,
    /// Per-order online registries, indexed by `order - smallest_size_order`.
    order_registry: Box<[Registry]>,
}

impl QuantumAllocator {
    /// Creates a quantum allocator over `[base, base + partition_count *
    /// partition_size)`. No memory is committed until a partition is
    /// claimed.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        is_shared: bool,
        is_secure: bool,
        roster: Arc<Roster>,
        self_index: usize,
        smallest_size_order: u32,
        largest_size_order: u32,
        partition_size_order: u32,
        partition_count: u32,
        base: u64,
    ) -> Self {
        debug_assert!(
            ((largest_size_order - smallest_size_order) as usize) < MAX_QUANTUM_ALLOCATOR_ORDERS,
            "order range too wide"
        );

        let partition_size = order_to_size(partition_size_order);
        let partitions = (0..partition_count as usize)
            .map(|slot| {
                Partition::new(
                    is_shared,
                    is_secure,
                    base + order_mul(slot as u64, partition_size_order),
                    partition_size,
                    smallest_size_order,
                    smallest_size_order,
                )
            })
            .collect();
        let partition_registry = Registry::new(is_shared, partition_count);
        let order_registry = (0..MAX_QUANTUM_ALLOCATOR_ORDERS)
            .map(|_| Registry::new(is_shared, partition_count))
            .collect();

        Self {
            space: Space::new(base, partition_size * partition_count as u64),
            roster,
            self_index,
            smallest_size_order,
            largest_size_order,
            partition_size_order,
            partition_size,
            partition_count,
            partitions,
            partition_registry,
            order_registry,
        }
    }

    /// Bounds of the managed span.
    #[must_use]
    pub fn space(&self) -> &Space {
        &self.space
    }

    /// Tests whether an address lies inside the managed span.
    #[must_use]
    pub fn contains(&self, address: u64) -> bool {
        self.space.contains(address)
    }

    /// Size order of the smallest quantum handled.
    #[must_use]
    pub fn smallest_size_order(&self) -> u32 {
        self.smallest_size_order
    }

    /// Size order of the largest quantum handled.
    #[must_use]
    pub fn largest_size_order(&self) -> u32 {
        self.largest_size_order
    }

    /// Order-registry index for a handled order.
    fn order_index(&self, order: u32) -> usize {
        debug_assert!(
            self.smallest_size_order <= order && order <= self.largest_size_order,
            "order out of range: {order}"
        );
        (order - self.smallest_size_order) as usize
    }

    /// Partition slot containing an address.
    fn partition_index(&self, address: u64) -> usize {
        debug_assert!(self.contains(address), "address outside allocator");
        order_div(address - self.space.base(), self.partition_size_order) as usize
    }

    /// Base address of a partition slot.
    fn partition_base(&self, slot: usize) -> u64 {
        self.space.base() + order_mul(slot as u64, self.partition_size_order)
    }

    /// Claims a free partition slot and commits its memory.
    fn allocate_partition(&self) -> Option<usize> {
        let slot = self.partition_registry.find_free()? as usize;
        vm::commit(self.partition_base(slot), self.partition_size);
        debug!(
            "partition slot {slot} committed at {:#x}",
            self.partition_base(slot)
        );
        Some(slot)
    }

    /// Brings a partition online for an order and publishes it as the
    /// direct server for that order.
    fn add_to_order(&self, order_index: usize, slot: usize) {
        self.online_partition(slot, order_index);
        self.roster.set(
            self.smallest_size_order + order_index as u32,
            RosterEntry::Partition {
                allocator: self.self_index,
                slot,
            },
        );
    }

    /// Takes a partition out of rotation for an order and takes back the
    /// dispatch slot from it. Returns true only for the caller whose clear
    /// actually flipped the bit; that caller owns the transition.
    fn offline_partition(&self, slot: usize, order_index: usize) -> bool {
        let cleared = self.order_registry[order_index].clear(slot as u32);
        self.roster.set(
            self.smallest_size_order + order_index as u32,
            RosterEntry::Quantum {
                allocator: self.self_index,
            },
        );
        cleared
    }

    /// Puts a partition back into rotation for an order.
    fn online_partition(&self, slot: usize, order_index: usize) -> bool {
        self.order_registry[order_index].set(slot as u32)
    }

    /// Claims a fresh slot, targets it at `order_index` and brings it
    /// online. Returns the slot, or `None` when every slot is handed out.
    fn new_order_partition(&self, order_index: usize) -> Option<usize> {
        let slot = self.allocate_partition()?;
        let order = self.smallest_size_order + order_index as u32;
        self.partitions[slot].retarget(order);
        self.add_to_order(order_index, slot);
        Some(slot)
    }

    /// Scans for an empty partition, takes it offline from its current
    /// order and re-establishes it for `order_index`. Returns the rebuilt
    /// slot or `None`.
    fn free_up_partition(&self, order_index: usize) -> Option<usize> {
        let target_order = self.smallest_size_order + order_index as u32;

        for slot in (0..self.partition_count as usize).rev() {
            if !self.partition_registry.is_set(slot as u32) {
                continue;
            }

            let partition = &self.partitions[slot];

            // Provisionally empty?
            if !partition.is_empty() {
                continue;
            }

            // Take the partition offline from the order it currently
            // serves, then test emptiness for real. Losing the clear means
            // another thread owns this slot's transition; move on.
            let current_index = self.order_index(partition.quantum_size_order());
            if !self.offline_partition(slot, current_index) {
                continue;
            }

            if !partition.is_empty() {
                self.online_partition(slot, current_index);
                continue;
            }

            debug!("partition slot {slot} re-targeted to order {target_order}");
            partition.retarget(target_order);
            self.add_to_order(order_index, slot);

            return Some(slot);
        }

        None
    }

    /// Produces a partition able to serve `order_index`: a fresh slot if
    /// one remains, otherwise a rebuilt empty one.
    fn free_partition_slot(&self, order_index: usize) -> Option<usize> {
        self.new_order_partition(order_index)
            .or_else(|| self.free_up_partition(order_index))
    }

    /// Allocates a block of `2^order` bytes. Returns its address or 0 when
    /// no partition can serve the order.
    pub fn allocate(&self, order: u32) -> u64 {
        let order_index = self.order_index(order);
        let mut iter = self.order_registry[order_index].set_iter(0);

        loop {
            let slot = match iter.next_set() {
                Some(index) => index as usize,
                // Online partitions exhausted: keep producing partitions
                // until one serves the request or none can be produced.
                None => match self.free_partition_slot(order_index) {
                    Some(slot) => slot,
                    None => return 0,
                },
            };

            let address = self.partitions[slot].try_allocate(order);
            if address != 0 {
                return address;
            }
        }
    }

    /// Fast-path entry for a roster-published partition: try it first, and
    /// on a full partition run the ordinary iteration with the full slot
    /// excluded so it cannot be reselected.
    pub fn allocate_from_partition(&self, slot: usize, order: u32) -> u64 {
        debug_assert!(slot < self.partition_count as usize, "slot out of range");

        let address = self.partitions[slot].try_allocate(order);
        if address != 0 {
            return address;
        }

        self.allocate_excluding(slot, order)
    }

    /// Allocation with one partition excluded. The full partition is taken
    /// offline so the iteration cannot reselect it, and is always brought
    /// back online before returning. This bounds the fallback to a single
    /// level: every other partition is tried at most once per pass.
    fn allocate_excluding(&self, full_slot: usize, order: u32) -> u64 {
        let order_index = self.order_index(order);

        self.offline_partition(full_slot, order_index);
        let address = self.allocate(order);
        self.online_partition(full_slot, order_index);

        address
    }

    /// Frees the block containing the address.
    pub fn deallocate(&self, address: u64) {
        debug_assert!(address != 0, "address must not be zero");
        let slot = self.partition_index(address);
        self.partitions[slot].deallocate(address);
    }

    /// Zeroes the content of the block containing the address.
    pub fn clear(&self, address: u64) {
        let slot = self.partition_index(address);
        self.partitions[slot].clear(address);
    }

    /// Number of bytes allocated at the address.
    #[must_use]
    pub fn allocation_size(&self, address: u64) -> u64 {
        let slot = self.partition_index(address);
        self.partitions[slot].allocation_size(address)
    }

    /// Base address of the allocated block containing the address.
    #[must_use]
    pub fn allocation_base(&self, address: u64) -> u64 {
        let slot = self.partition_index(address);
        self.partitions[slot].allocation_base(address)
    }

    /// Returns the next allocation after `address`, or 0 when the span is
    /// exhausted. An `address` of 0 starts from the first slot.
    #[must_use]
    pub fn next_allocation(&self, address: u64) -> u64 {
        let mut address = address;
        let mut slot = 0;
        if address != 0 && self.contains(address) {
            slot = self.partition_index(address);
        } else {
            address = 0;
        }

        while slot < self.partition_count as usize {
            if self.partition_registry.is_set(slot as u32) {
                let next = self.partitions[slot].next_allocation(address);
                if next != 0 {
                    return next;
                }
            }

            slot += 1;
            address = 0;
        }

        0
    }

    /// Adds sampled allocation counts for every handed-out partition into
    /// the per-order slots of `counts` and `sizes`.
    pub fn stats(&self, counts: &mut [u64], sizes: &mut [u64]) {
        for slot in 0..self.partition_count as usize {
            if self.partition_registry.is_set(slot as u32) {
                self.partitions[slot].stats(counts, sizes);
            }
        }
    }
}
