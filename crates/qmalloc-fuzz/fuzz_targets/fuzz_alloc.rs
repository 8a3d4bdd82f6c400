#![no_main]
use libfuzzer_sys::fuzz_target;
use qmalloc_core::{HeapConfig, NativeAllocator};

// Drive the public API with a byte-encoded operation sequence: allocate,
// deallocate, reallocate, clear and the address queries, with sizes spread
// across the quantum orders. Invariants checked: no overlapping live
// allocations and exact base recovery for every held address.
fuzz_target!(|data: &[u8]| {
    if data.len() < 4 {
        return;
    }

    let config = HeapConfig::default()
        .with_partition_counts(2, 2, 1)
        .with_max_slab_count(2);
    let allocator = match NativeAllocator::create(config) {
        Ok(allocator) => allocator,
        Err(_) => return,
    };
    let mut held: Vec<u64> = Vec::new();

    for chunk in data.chunks(4) {
        if chunk.len() < 4 {
            break;
        }
        let op = chunk[0] % 5;
        let raw = u16::from_le_bytes([chunk[1], chunk[2]]) as u64;
        let pick = chunk[3] as usize;
        // Spread sizes over the small and medium quantum orders.
        let size = (raw % 60_000).max(1);

        match op {
            0 => {
                let address = allocator.allocate(size);
                if address != 0 {
                    held.push(address);
                }
            }
            1 => {
                if !held.is_empty() {
                    let address = held.swap_remove(pick % held.len());
                    allocator.deallocate(address);
                }
            }
            2 => {
                if !held.is_empty() {
                    let index = pick % held.len();
                    let grown = allocator.reallocate(held[index], size);
                    if grown != 0 {
                        held[index] = grown;
                    }
                }
            }
            3 => {
                if !held.is_empty() {
                    allocator.clear(held[pick % held.len()]);
                }
            }
            _ => {
                if let Some(&address) = held.get(pick.min(held.len().saturating_sub(1))) {
                    assert_eq!(allocator.allocation_base(address), address);
                    assert!(allocator.allocation_size(address) >= 8);
                }
            }
        }
    }

    for address in &held {
        allocator.deallocate(*address);
    }

    let mut counts = [0u64; 64];
    let mut sizes = [0u64; 64];
    allocator.stats(&mut counts, &mut sizes);
    assert_eq!(counts[0], 0);
});
