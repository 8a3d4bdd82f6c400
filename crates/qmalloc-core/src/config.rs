//! Allocator construction parameters.

use serde::{Deserialize, Serialize};

use crate::common::MAX_QUANTUM_ALLOCATORS;

/// Layout and mode of a [`NativeAllocator`](crate::NativeAllocator).
///
/// Partition counts size the three quantum allocator regions (small, medium,
/// large); a count of zero disables that region and its orders. Counts are
/// bounded by `MAX_REGISTRY_BIT_COUNT` (16384), the most one registry can
/// track. The whole struct is plain data so embedders can keep layouts in
/// configuration files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeapConfig {
    /// Fixed base address for the reservation, or 0 to let the OS choose.
    /// A non-zero address must be aligned to the largest quantum size.
    pub address: u64,
    /// true if the allocator may be used from multiple threads.
    pub shared: bool,
    /// true if allocations are zeroed on deallocation and recycled slabs
    /// read as zero.
    pub secure: bool,
    /// Partition count for the small quantum allocator (orders 3..=10).
    pub small_partition_count: u32,
    /// Partition count for the medium quantum allocator (orders 11..=18).
    pub medium_partition_count: u32,
    /// Partition count for the large quantum allocator (orders 19..=26).
    pub large_partition_count: u32,
    /// Maximum number of concurrently tracked slabs.
    pub max_slab_count: u32,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            address: 0,
            shared: false,
            secure: false,
            small_partition_count: 8,
            medium_partition_count: 8,
            large_partition_count: 8,
            max_slab_count: 8,
        }
    }
}

impl HeapConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a fixed base address for the reservation.
    #[must_use]
    pub fn with_address(mut self, address: u64) -> Self {
        self.address = address;
        self
    }

    /// Selects shared (multi-thread) mode.
    #[must_use]
    pub fn with_shared(mut self, shared: bool) -> Self {
        self.shared = shared;
        self
    }

    /// Selects secure mode.
    #[must_use]
    pub fn with_secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    /// Sets all three partition counts at once.
    #[must_use]
    pub fn with_partition_counts(mut self, small: u32, medium: u32, large: u32) -> Self {
        self.small_partition_count = small;
        self.medium_partition_count = medium;
        self.large_partition_count = large;
        self
    }

    /// Sets the maximum number of concurrently tracked slabs.
    #[must_use]
    pub fn with_max_slab_count(mut self, max_slab_count: u32) -> Self {
        self.max_slab_count = max_slab_count;
        self
    }

    /// Partition counts in quantum-allocator order: small, medium, large.
    #[must_use]
    pub fn partition_counts(&self) -> [u32; MAX_QUANTUM_ALLOCATORS] {
        [
            self.small_partition_count,
            self.medium_partition_count,
            self.large_partition_count,
        ]
    }
}
