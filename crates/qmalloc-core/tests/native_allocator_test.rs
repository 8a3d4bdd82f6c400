//! End-to-end tests of the public allocator API on a confined heap.

use qmalloc_core::common::{
    order_to_size, round_up_power_of_2, size_to_order, LARGEST_SIZE, MAX_PARTITION_QUANTUM,
};
use qmalloc_core::{HeapConfig, NativeAllocator};

fn default_allocator() -> NativeAllocator {
    NativeAllocator::create(HeapConfig::default()).expect("create")
}

#[test]
fn test_size_and_base_queries() {
    let allocator = default_allocator();

    let a = allocator.allocate(13);
    assert_ne!(a, 0);
    assert_eq!(allocator.allocation_size(a), 16);
    assert_eq!(allocator.allocation_size(a + 15), 16);
    assert_eq!(allocator.allocation_base(a + 15), a);
}

#[test]
fn test_reallocate() {
    let allocator = default_allocator();

    let a = allocator.allocate(64);
    assert_ne!(a, 0);

    // Shrinking or re-requesting within the same quantum is a no-op.
    let b = allocator.reallocate(a, 63);
    assert_eq!(b, a);
    let c = allocator.reallocate(b, 64);
    assert_eq!(c, b);

    // Growing past the quantum moves the block.
    let d = allocator.reallocate(c, 65);
    assert_ne!(d, c);
    assert_ne!(d, 0);
    assert_eq!(allocator.allocation_size(d), 128);

    // The old quantum was freed and its address is served again.
    let e = allocator.reallocate(c, 64);
    assert_eq!(e, a);

    // Reallocating from zero is a plain allocation.
    let f = allocator.reallocate(0, 64);
    assert_ne!(f, 0);
}

#[test]
fn test_reallocate_copies_contents() {
    let allocator = default_allocator();

    let old = allocator.allocate(32);
    assert_ne!(old, 0);
    unsafe {
        (old as *mut u64).write(0xABCD_EF01_2345_6789);
        ((old + 8) as *mut u64).write(0x1111_2222_3333_4444);
    }

    let new = allocator.reallocate(old, 100);
    assert_ne!(new, 0);
    assert_ne!(new, old);
    unsafe {
        assert_eq!((new as *const u64).read(), 0xABCD_EF01_2345_6789);
        assert_eq!(((new + 8) as *const u64).read(), 0x1111_2222_3333_4444);
    }
}

#[test]
fn test_clear_touches_only_the_target() {
    let allocator = default_allocator();

    let a1 = allocator.allocate(32);
    let a2 = allocator.allocate(32);
    let a3 = allocator.allocate(32);
    assert!(a1 != 0 && a2 != 0 && a3 != 0);

    unsafe {
        for (address, pattern) in [(a1, 0x1111u64), (a2, 0x2222), (a3, 0x3333)] {
            for word in 0..4 {
                ((address + word * 8) as *mut u64).write(pattern);
            }
        }
    }

    allocator.clear(a2);

    unsafe {
        for word in 0..4 {
            assert_eq!(((a1 + word * 8) as *const u64).read(), 0x1111);
            assert_eq!(((a2 + word * 8) as *const u64).read(), 0);
            assert_eq!(((a3 + word * 8) as *const u64).read(), 0x3333);
        }
    }
}

#[test]
fn test_next_allocation_visits_all() {
    let allocator = default_allocator();

    let a1 = allocator.allocate(16);
    let a2 = allocator.allocate(16);
    assert!(a1 != 0 && a2 != 0);

    assert_eq!(allocator.next_allocation(0), a1);
    assert_eq!(allocator.next_allocation(a1), a2);
    assert_eq!(allocator.next_allocation(a2), 0);
}

#[test]
fn test_next_allocation_sees_slabs() {
    let allocator = default_allocator();

    let small = allocator.allocate(16);
    let slab = allocator.allocate(LARGEST_SIZE + 1);
    assert!(small != 0 && slab != 0);

    assert_eq!(allocator.next_allocation(0), small);
    assert_eq!(allocator.next_allocation(small), slab);
    assert_eq!(allocator.next_allocation(slab), 0);
}

#[test]
fn test_iteration_is_ascending_and_complete() {
    let allocator = default_allocator();

    let mut live = Vec::new();
    for size in [8u64, 24, 100, 3000, 70_000, 900_000, 5_000_000] {
        let address = allocator.allocate(size);
        assert_ne!(address, 0, "allocation of {size} failed");
        live.push(address);
    }
    live.sort_unstable();

    let mut walked = Vec::new();
    let mut address = allocator.next_allocation(0);
    while address != 0 {
        walked.push(address);
        address = allocator.next_allocation(address);
    }

    assert_eq!(walked, live);
}

#[test]
fn test_alignment_and_size_rounding() {
    let allocator = default_allocator();

    for size in [1u64, 8, 13, 16, 100, 4096, 70_000, 1 << 20, LARGEST_SIZE] {
        let address = allocator.allocate(size);
        assert_ne!(address, 0, "allocation of {size} failed");
        let rounded = round_up_power_of_2(size).max(8);
        assert_eq!(address % rounded, 0, "misaligned allocation of {size}");
        assert_eq!(
            allocator.allocation_size(address),
            order_to_size(size_to_order(size))
        );
        allocator.deallocate(address);
    }
}

#[test]
fn test_disjointness() {
    let allocator = default_allocator();

    let mut ranges: Vec<(u64, u64)> = Vec::new();
    for size in [8u64, 8, 16, 50, 1000, 1000, 66_000, 1 << 21] {
        let address = allocator.allocate(size);
        assert_ne!(address, 0);
        ranges.push((address, address + allocator.allocation_size(address)));
    }

    ranges.sort_unstable();
    for pair in ranges.windows(2) {
        assert!(pair[0].1 <= pair[1].0, "overlap: {pair:x?}");
    }
}

#[test]
fn test_base_recovery_at_every_offset() {
    let allocator = default_allocator();

    let address = allocator.allocate(100); // 128-byte quantum
    assert_ne!(address, 0);
    for offset in 0..allocator.allocation_size(address) {
        assert_eq!(allocator.allocation_base(address + offset), address);
    }
}

#[test]
fn test_deallocate_unknown_is_noop() {
    let allocator = default_allocator();

    let address = allocator.allocate(16);
    assert_ne!(address, 0);

    let mut counts_before = [0u64; 64];
    let mut sizes_before = [0u64; 64];
    allocator.stats(&mut counts_before, &mut sizes_before);

    // Outside every known range: the reservation is 64 MiB aligned and this
    // is below any mapping the allocator could own.
    allocator.deallocate(0x100);
    allocator.deallocate(0);

    let mut counts_after = [0u64; 64];
    let mut sizes_after = [0u64; 64];
    allocator.stats(&mut counts_after, &mut sizes_after);

    assert_eq!(counts_before, counts_after);
    assert_eq!(sizes_before, sizes_after);
    assert_eq!(allocator.next_allocation(0), address);
}

#[test]
fn test_recycle_same_address() {
    let allocator = default_allocator();

    let first = allocator.allocate(48);
    assert_ne!(first, 0);
    allocator.deallocate(first);
    assert_eq!(allocator.allocate(48), first);
}

#[test]
fn test_stats_conservation() {
    let allocator = default_allocator();

    let requests = [8u64, 13, 64, 2049, 100_000];
    let mut rounded_total = 0u64;
    for size in requests {
        assert_ne!(allocator.allocate(size), 0);
        rounded_total += order_to_size(size_to_order(size));
    }

    let mut counts = [0u64; 64];
    let mut sizes = [0u64; 64];
    allocator.stats(&mut counts, &mut sizes);

    assert_eq!(counts[0], requests.len() as u64);
    assert_eq!(sizes[0], rounded_total);
    assert_eq!(counts[3], 1); // 8
    assert_eq!(counts[4], 1); // 13 -> 16
    assert_eq!(counts[6], 1); // 64
    assert_eq!(counts[12], 1); // 2049 -> 4096
    assert_eq!(counts[17], 1); // 100_000 -> 131072
}

#[test]
fn test_exhaustion_terminates() {
    let config = HeapConfig::default()
        .with_partition_counts(1, 1, 1)
        .with_max_slab_count(1);
    let allocator = NativeAllocator::create(config).expect("create");

    let mut served = 0u32;
    loop {
        if allocator.allocate(2049) == 0 {
            break;
        }
        served += 1;
        assert!(
            served <= MAX_PARTITION_QUANTUM + 16,
            "exhaustion did not terminate"
        );
    }

    // One 32 MiB partition of 4 KiB quanta.
    assert_eq!(served, 8192);
}

#[test]
fn test_slab_allocation_round_trip() {
    let allocator = default_allocator();

    let size = LARGEST_SIZE + 1;
    let address = allocator.allocate(size);
    assert_ne!(address, 0);
    assert_eq!(allocator.allocation_size(address), 2 * LARGEST_SIZE);
    assert_eq!(allocator.allocation_base(address + 12345), address);
    assert_eq!(address % (2 * LARGEST_SIZE), 0);

    allocator.deallocate(address);
    assert_eq!(allocator.allocate(size), address);
}

#[test]
fn test_secure_mode_zeroes_on_free() {
    let config = HeapConfig::default().with_secure(true);
    let allocator = NativeAllocator::create(config).expect("create");

    let address = allocator.allocate(64);
    assert_ne!(address, 0);
    unsafe { (address as *mut u64).write(0x5A5A_5A5A_5A5A_5A5A) };
    allocator.deallocate(address);

    let again = allocator.allocate(64);
    assert_eq!(again, address);
    unsafe { assert_eq!((again as *const u64).read(), 0) };
}

#[test]
fn test_close_releases() {
    let allocator = default_allocator();
    let address = allocator.allocate(1 << 28);
    assert_ne!(address, 0);
    allocator.close();
}
