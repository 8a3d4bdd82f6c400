//! Slab allocator for large one-off blocks.
//!
//! Blocks above the largest quantum order are served directly from the OS
//! as self-aligned reservations, tracked individually. Deallocating a slab
//! clears its registry bit but keeps the `(base, size)` descriptor, so a
//! later reservation of a compatible size reuses the address range without
//! another system call.
//!
//! A slot's descriptor is written only by the thread that just won the
//! slot's bit in `find_free`; readers consult only slots whose bit is set.

use std::sync::atomic::{AtomicU64, Ordering};

use log::debug;

use crate::common::{order_to_size, size_to_order, MAX_ALLOCATION_ORDER};
use crate::registry::Registry;
use crate::vm;

/// Descriptor of one large reservation. A zero size means the slot has
/// never held a slab.
#[derive(Debug)]
struct SlabSlot {
    /// Base address of the reservation.
    base: AtomicU64,
    /// Size of the reservation in bytes.
    size: AtomicU64,
}

impl SlabSlot {
    fn new() -> Self {
        Self {
            base: AtomicU64::new(0),
            size: AtomicU64::new(0),
        }
    }

    fn get(&self) -> (u64, u64) {
        (
            self.base.load(Ordering::SeqCst),
            self.size.load(Ordering::SeqCst),
        )
    }

    fn set(&self, base: u64, size: u64) {
        self.base.store(base, Ordering::SeqCst);
        self.size.store(size, Ordering::SeqCst);
    }
}

/// Allocator for large blocks that are unlikely to be recycled.
#[derive(Debug)]
pub struct SlabAllocator {
    /// true if recycled slabs must read as zero.
    is_secure: bool,
    /// Slab descriptors.
    slots: Box<[SlabSlot]>,
    /// Tracks which slots hold a live allocation.
    registry: Registry,
}

impl SlabAllocator {
    /// Creates a slab allocator with `max_count` slots. Nothing is reserved
    /// until the first allocation.
    #[must_use]
    pub fn new(is_shared: bool, is_secure: bool, max_count: u32) -> Self {
        Self {
            is_secure,
            slots: (0..max_count as usize).map(|_| SlabSlot::new()).collect(),
            registry: Registry::new(is_shared, max_count),
        }
    }

    /// Finds the live slab containing the address.
    fn find(&self, address: u64) -> Option<usize> {
        (0..self.slots.len()).find(|&index| {
            if !self.registry.is_set(index as u32) {
                return false;
            }
            let (base, size) = self.slots[index].get();
            base <= address && address < base + size
        })
    }

    /// Attempts to recycle a previously freed slab; reserves new space
    /// otherwise. Returns the base address or 0.
    fn reserve(&self, size: u64) -> u64 {
        let index = match self.registry.find_free() {
            Some(index) => index as usize,
            None => return 0,
        };

        // Winning the bit makes this thread the slot's sole writer.
        let slot = &self.slots[index];
        let (slab_base, slab_size) = slot.get();

        if slab_size != 0 {
            if slab_size > size {
                // Trim the surplus tail back to the OS.
                vm::release(slab_base + size, slab_size - size);
            }

            if slab_size >= size {
                if self.is_secure {
                    // Drop and re-map the surviving pages so the recycled
                    // slab reads as zero.
                    vm::uncommit(slab_base, size);
                    vm::commit(slab_base, size);
                }

                slot.set(slab_base, size);
                debug!("slab slot {index} recycled: {size:#x} bytes at {slab_base:#x}");
                return slab_base;
            }

            // Too small to recycle.
            vm::release(slab_base, slab_size);
            slot.set(0, 0);
        }

        let base = vm::reserve_aligned(size, size);

        if base == 0 {
            self.registry.free(index as u32);
            return 0;
        }

        vm::commit(base, size);
        slot.set(base, size);
        debug!("slab slot {index} reserved: {size:#x} bytes at {base:#x}");

        base
    }

    /// Allocates a block of `2^order` bytes. Orders beyond
    /// `MAX_ALLOCATION_ORDER` are unsupported and yield 0.
    pub fn allocate(&self, order: u32) -> u64 {
        if order > MAX_ALLOCATION_ORDER {
            return 0;
        }

        self.reserve(order_to_size(order))
    }

    /// Frees the slab containing the address, keeping its descriptor for
    /// recycling. Unknown addresses are ignored.
    pub fn deallocate(&self, address: u64) {
        if let Some(index) = self.find(address) {
            self.registry.free(index as u32);
        }
    }

    /// Zeroes the content of the slab containing the address.
    pub fn clear(&self, address: u64) {
        if let Some(index) = self.find(address) {
            let (base, size) = self.slots[index].get();
            vm::clear(base, size);
        }
    }

    /// Number of bytes allocated at the address, or 0 if unknown.
    #[must_use]
    pub fn allocation_size(&self, address: u64) -> u64 {
        match self.find(address) {
            Some(index) => self.slots[index].get().1,
            None => 0,
        }
    }

    /// Base address of the slab containing the address, or 0 if unknown.
    #[must_use]
    pub fn allocation_base(&self, address: u64) -> u64 {
        match self.find(address) {
            Some(index) => self.slots[index].get().0,
            None => 0,
        }
    }

    /// Returns the next live slab's base after `address`, or 0. An
    /// `address` of 0 starts from the first slot.
    #[must_use]
    pub fn next_allocation(&self, address: u64) -> u64 {
        let initial = if address == 0 {
            0
        } else {
            match self.find(address) {
                Some(index) => index as u32 + 1,
                None => return 0,
            }
        };

        match self.registry.set_iter(initial).next_set() {
            Some(index) => self.slots[index as usize].get().0,
            None => 0,
        }
    }

    /// Adds sampled allocation counts into the per-order slots of `counts`
    /// and `sizes`.
    pub fn stats(&self, counts: &mut [u64], sizes: &mut [u64]) {
        for index in 0..self.slots.len() {
            if self.registry.is_set(index as u32) {
                let (_, size) = self.slots[index].get();
                let order = size_to_order(size) as usize;
                counts[order] += 1;
                sizes[order] += size;
            }
        }
    }

    /// Releases every reservation still described by a slot.
    pub fn close(&self) {
        for slot in self.slots.iter() {
            let (base, size) = slot.get();
            if size != 0 {
                vm::release(base, size);
                slot.set(0, 0);
            }
        }
    }
}
