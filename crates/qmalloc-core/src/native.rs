//! Top-level native allocator.
//!
//! A `NativeAllocator` owns one reserved virtual address region and carves
//! it into three quantum allocator spans (small, medium, large), with a
//! slab allocator reserving separately for anything beyond the largest
//! quantum. An order-indexed roster dispatches each allocation in a single
//! atomic load; deallocation and the address queries route by containment,
//! since the three spans are disjoint and every other address belongs to
//! the slab allocator or to nobody.
//!
//! Closing consumes the allocator, so a close racing a live operation is
//! unrepresentable in safe code.

use std::sync::Arc;

use log::debug;
use thiserror::Error;

use crate::common::{
    is_valid_address, mask, order_mul, round_up_power_of_2, size_to_order, LARGEST_SIZE,
    LARGEST_SIZE_ORDER, MAX_ADDRESS_ORDER, MAX_PARTITION_QUANTUM, MAX_QUANTUM_ALLOCATORS,
    MAX_QUANTUM_ALLOCATOR_ORDERS, MAX_ROSTER, SMALLEST_SIZE_ORDER,
};
use crate::config::HeapConfig;
use crate::quantum::QuantumAllocator;
use crate::roster::{Roster, RosterEntry};
use crate::slab::SlabAllocator;
use crate::space::Space;
use crate::vm;

/// Failure to construct a [`NativeAllocator`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AllocatorError {
    /// The OS could not reserve the requested virtual address range.
    #[error("virtual address reservation of {size} bytes failed")]
    ReservationFailed {
        /// Bytes requested from the OS.
        size: u64,
    },
    /// The fixed base address is unusable.
    #[error("base address {address:#x} is invalid or misaligned")]
    InvalidBaseAddress {
        /// The rejected address.
        address: u64,
    },
}

/// Per-allocator layout derived from the configuration.
struct RegionLayout {
    smallest_size_order: u32,
    largest_size_order: u32,
    partition_size_order: u32,
    partition_count: u32,
    offset: u64,
}

fn region_layouts(config: &HeapConfig) -> ([RegionLayout; MAX_QUANTUM_ALLOCATORS], u64) {
    let counts = config.partition_counts();
    let mut reservation = 0u64;

    let layouts = std::array::from_fn(|index| {
        let smallest_size_order =
            SMALLEST_SIZE_ORDER + (index * MAX_QUANTUM_ALLOCATOR_ORDERS) as u32;
        let largest_size_order = smallest_size_order + MAX_QUANTUM_ALLOCATOR_ORDERS as u32 - 1;
        // Partition size keeps the quantum registry at or below
        // MAX_PARTITION_QUANTUM bits.
        let partition_size = order_mul(MAX_PARTITION_QUANTUM as u64, smallest_size_order);
        let partition_size_order = size_to_order(partition_size);
        let offset = reservation;
        reservation += order_mul(counts[index] as u64, partition_size_order);

        RegionLayout {
            smallest_size_order,
            largest_size_order,
            partition_size_order,
            partition_count: counts[index],
            offset,
        }
    });

    (layouts, reservation)
}

/// Quantum-based native memory allocator.
pub struct NativeAllocator {
    /// Bounds of the root reservation.
    space: Space,
    /// true if the allocator may be used from multiple threads.
    shared: bool,
    /// true if allocations are zeroed on deallocation.
    secure: bool,
    /// Order-indexed dispatch table.
    roster: Arc<Roster>,
    /// Small, medium and large quantum allocators.
    quantum_allocators: Box<[QuantumAllocator]>,
    /// Slab allocator for blocks beyond the largest quantum.
    slab_allocator: SlabAllocator,
}

impl NativeAllocator {
    /// Creates an allocator laid out per `config`.
    ///
    /// The whole quantum region is reserved up front (address space only;
    /// nothing is committed); the slab allocator reserves separately per
    /// slab. Construction either fully succeeds or changes nothing.
    pub fn create(config: HeapConfig) -> Result<Self, AllocatorError> {
        if config.address != 0
            && (!is_valid_address(config.address) || config.address & mask(LARGEST_SIZE) != 0)
        {
            return Err(AllocatorError::InvalidBaseAddress {
                address: config.address,
            });
        }

        let (layouts, reservation) = region_layouts(&config);

        let base = if reservation == 0 {
            // No quantum regions configured; only the slab allocator serves.
            0
        } else if config.address == 0 {
            vm::reserve_aligned(reservation, LARGEST_SIZE)
        } else {
            vm::reserve_at(reservation, config.address)
        };

        if base == 0 && reservation != 0 {
            return Err(AllocatorError::ReservationFailed { size: reservation });
        }

        let roster = Arc::new(Roster::new());

        let quantum_allocators: Box<[QuantumAllocator]> = layouts
            .iter()
            .enumerate()
            .map(|(index, layout)| {
                QuantumAllocator::new(
                    config.shared,
                    config.secure,
                    Arc::clone(&roster),
                    index,
                    layout.smallest_size_order,
                    layout.largest_size_order,
                    layout.partition_size_order,
                    layout.partition_count,
                    base + layout.offset,
                )
            })
            .collect();

        let slab_allocator = SlabAllocator::new(config.shared, config.secure, config.max_slab_count);

        // Wire the roster. Orders below the smallest quantum round up to it,
        // so they route to the small allocator as well. A region configured
        // with zero partitions serves nothing: its whole order range stays
        // unassigned and allocation yields 0.
        for (index, layout) in layouts.iter().enumerate() {
            let entry = if layout.partition_count == 0 {
                RosterEntry::None
            } else {
                RosterEntry::Quantum { allocator: index }
            };
            let lo = if index == 0 { 0 } else { layout.smallest_size_order };
            roster.set_range(entry, lo, layout.largest_size_order);
        }
        roster.set_range(RosterEntry::Slab, LARGEST_SIZE_ORDER + 1, MAX_ADDRESS_ORDER);
        roster.set_range(
            RosterEntry::None,
            MAX_ADDRESS_ORDER + 1,
            MAX_ROSTER as u32 - 1,
        );

        debug!("allocator created: {reservation:#x} bytes reserved at {base:#x}");

        Ok(Self {
            space: Space::new(base, reservation),
            shared: config.shared,
            secure: config.secure,
            roster,
            quantum_allocators,
            slab_allocator,
        })
    }

    /// Base address of the root reservation.
    #[must_use]
    pub fn base(&self) -> u64 {
        self.space.base()
    }

    /// Size of the root reservation in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.space.size()
    }

    /// Tests whether an address lies inside the root reservation.
    #[must_use]
    pub fn contains(&self, address: u64) -> bool {
        self.space.contains(address)
    }

    /// true if the allocator may be used from multiple threads.
    #[must_use]
    pub fn is_shared(&self) -> bool {
        self.shared
    }

    /// true if allocations are zeroed on deallocation.
    #[must_use]
    pub fn is_secure(&self) -> bool {
        self.secure
    }

    /// Allocates a block of at least `size` bytes, rounded up to a power of
    /// two. Returns its address, or 0 if the memory is not available.
    #[must_use]
    pub fn allocate(&self, size: u64) -> u64 {
        let order = size_to_order(size);

        match self.roster.get(order) {
            RosterEntry::None => 0,
            RosterEntry::Quantum { allocator } => self.quantum_allocators[allocator].allocate(order),
            RosterEntry::Partition { allocator, slot } => {
                self.quantum_allocators[allocator].allocate_from_partition(slot, order)
            }
            RosterEntry::Slab => self.slab_allocator.allocate(order),
        }
    }

    /// Makes the block containing `address` available for further
    /// allocation. Zero and unknown addresses are ignored.
    pub fn deallocate(&self, address: u64) {
        if address == 0 {
            return;
        }

        for allocator in self.quantum_allocators.iter() {
            if allocator.contains(address) {
                allocator.deallocate(address);
                return;
            }
        }

        self.slab_allocator.deallocate(address);
    }

    /// Resizes the block at `old_address` to at least `new_size` bytes.
    ///
    /// A fresh block is used only when the size order actually changes;
    /// shrinking within the same quantum returns the old address untouched.
    /// When a fresh block is needed, the contents are copied, the old block
    /// is freed and the new address returned; if that allocation fails the
    /// old block is left intact and 0 is returned.
    #[must_use]
    pub fn reallocate(&self, old_address: u64, new_size: u64) -> u64 {
        if old_address == 0 {
            return self.allocate(new_size);
        }

        let old_size = self.allocation_size(old_address);

        if old_size < round_up_power_of_2(new_size)
            || size_to_order(new_size) < size_to_order(old_size)
        {
            let new_address = self.allocate(new_size);

            if new_address != 0 && old_size != 0 {
                let copy_size = old_size.min(self.allocation_size(new_address));
                vm::copy(old_address, new_address, copy_size);
                self.deallocate(old_address);
            }

            return new_address;
        }

        old_address
    }

    /// Zeroes the content of the block containing the address.
    pub fn clear(&self, address: u64) {
        for allocator in self.quantum_allocators.iter() {
            if allocator.contains(address) {
                allocator.clear(address);
                return;
            }
        }

        self.slab_allocator.clear(address);
    }

    /// Number of bytes allocated at the address: always a power of two, not
    /// the requested size. Unknown addresses yield 0.
    #[must_use]
    pub fn allocation_size(&self, address: u64) -> u64 {
        for allocator in self.quantum_allocators.iter() {
            if allocator.contains(address) {
                return allocator.allocation_size(address);
            }
        }

        self.slab_allocator.allocation_size(address)
    }

    /// Base address of the allocated block containing the address. Unknown
    /// addresses yield 0.
    #[must_use]
    pub fn allocation_base(&self, address: u64) -> u64 {
        for allocator in self.quantum_allocators.iter() {
            if allocator.contains(address) {
                return allocator.allocation_base(address);
            }
        }

        self.slab_allocator.allocation_base(address)
    }

    /// Walks the live allocations in ascending address order. Start with an
    /// `address` of 0; each call returns the next allocation after the one
    /// given, and 0 marks the end. The result may have been deallocated by
    /// the time it is returned, so it is a key for further queries, not a
    /// license to dereference.
    #[must_use]
    pub fn next_allocation(&self, address: u64) -> u64 {
        let mut address = address;

        for allocator in self.quantum_allocators.iter() {
            if address == 0 || allocator.contains(address) {
                let next = allocator.next_allocation(address);

                if next != 0 {
                    return next;
                }

                address = 0;
            }
        }

        self.slab_allocator.next_allocation(address)
    }

    /// Fills `counts` and `sizes` with sampled allocation totals. Slot `k`
    /// holds the totals for blocks of size `2^k`; slot 0 is the sum of all
    /// other slots. Sizes are rounded block sizes, not requested sizes.
    pub fn stats(&self, counts: &mut [u64; 64], sizes: &mut [u64; 64]) {
        counts.fill(0);
        sizes.fill(0);

        for allocator in self.quantum_allocators.iter() {
            allocator.stats(counts, sizes);
        }

        self.slab_allocator.stats(counts, sizes);

        let mut count = 0;
        let mut size = 0;

        for order in 1..counts.len() {
            count += counts[order];
            size += sizes[order];
        }

        counts[0] = count;
        sizes[0] = size;
    }

    /// Releases all memory owned by the allocator. Dropping does the same;
    /// taking `self` by value makes a close racing a live operation
    /// unrepresentable.
    pub fn close(self) {}
}

impl Drop for NativeAllocator {
    fn drop(&mut self) {
        self.slab_allocator.close();

        if self.space.size() != 0 {
            vm::release(self.space.base(), self.space.size());
        }

        debug!(
            "allocator closed: {:#x} bytes released at {:#x}",
            self.space.size(),
            self.space.base()
        );
    }
}
