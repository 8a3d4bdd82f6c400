//! Virtual-memory facade.
//!
//! Encapsulates every OS memory call the allocator makes: reservation of
//! address ranges (no backing), commit/uncommit of pages within a
//! reservation, release, and raw zero/copy over committed memory. All sizes
//! must be page multiples and all addresses page-aligned; violations are
//! programmer errors and diagnosed by debug assertions.
//!
//! This is the only module in the crate that contains `unsafe` code. Every
//! call site documents the invariant that makes it sound.

use std::ptr;
use std::sync::OnceLock;

use log::warn;

use crate::common::{is_valid_address, mask, round_up, BYTES_PER_WORD};

/// Platform memory page size, discovered once.
static PAGE_SIZE: OnceLock<u64> = OnceLock::new();

/// Returns the platform memory page size.
#[must_use]
pub fn page_size() -> u64 {
    *PAGE_SIZE.get_or_init(|| {
        // SAFETY: sysconf with a valid name constant has no memory effects.
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        debug_assert!(size > 0, "sysconf(_SC_PAGESIZE) failed");
        size as u64
    })
}

/// Returns the mask for the platform memory page size.
#[must_use]
pub fn page_mask() -> u64 {
    page_size() - 1
}

fn is_page_aligned(value: u64) -> bool {
    value & page_mask() == 0
}

/// Reserves an address range of `size` bytes for future use, without
/// backing. Returns the reserved address or 0 if the request cannot be
/// satisfied.
#[must_use]
pub fn reserve(size: u64) -> u64 {
    debug_assert!(is_page_aligned(size), "size not page aligned: {size:#x}");

    // SAFETY: an anonymous PROT_NONE mapping with a null hint touches no
    // existing memory; the kernel picks the placement.
    let address = unsafe {
        libc::mmap(
            ptr::null_mut(),
            size as usize,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
            -1,
            0,
        )
    };

    if address == libc::MAP_FAILED {
        warn!("reservation of {size:#x} bytes failed");
        return 0;
    }

    address as u64
}

/// Reserves an address range of `size` bytes at exactly `location`. A
/// mapping that lands anywhere else is treated as a collision: it is
/// unmapped and 0 is returned.
#[must_use]
pub fn reserve_at(size: u64, location: u64) -> u64 {
    debug_assert!(is_page_aligned(size), "size not page aligned: {size:#x}");
    debug_assert!(
        is_page_aligned(location),
        "location not page aligned: {location:#x}"
    );

    // SAFETY: the hint is only a hint without MAP_FIXED; the kernel never
    // replaces an existing mapping on this path.
    let address = unsafe {
        libc::mmap(
            location as *mut libc::c_void,
            size as usize,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
            -1,
            0,
        )
    };

    if address == libc::MAP_FAILED {
        return 0;
    }

    if address as u64 != location {
        // SAFETY: unmapping the mapping we just created.
        unsafe { libc::munmap(address, size as usize) };
        return 0;
    }

    location
}

/// Reserves a range of `size` bytes aligned to the specified power of two.
/// Over-reserves by `alignment - page`, then releases the misaligned prefix
/// and postfix so only the aligned middle remains. Returns the aligned base
/// or 0 if the request cannot be satisfied.
#[must_use]
pub fn reserve_aligned(size: u64, alignment: u64) -> u64 {
    debug_assert!(is_page_aligned(size), "size not page aligned: {size:#x}");
    debug_assert!(
        alignment != 0 && is_page_aligned(alignment) && alignment.is_power_of_two(),
        "alignment must be a page-aligned power of two: {alignment:#x}"
    );

    let reserve_size = size + alignment - page_size();
    let address = reserve(reserve_size);

    if address == 0 {
        return 0;
    }

    let base = round_up(address, alignment);
    let prefix_size = base - address;
    let postfix_size = reserve_size - size - prefix_size;

    if prefix_size != 0 {
        release(address, prefix_size);
    }

    if postfix_size != 0 {
        release(base + size, postfix_size);
    }

    base
}

/// Returns a reserved address range to the OS.
pub fn release(address: u64, size: u64) {
    debug_assert!(is_valid_address(address), "invalid address: {address:#x}");
    debug_assert!(is_page_aligned(size), "size not page aligned: {size:#x}");

    // SAFETY: the caller owns the reservation covering `[address, address +
    // size)`; no other component holds a reference into it.
    let result = unsafe { libc::munmap(address as *mut libc::c_void, size as usize) };

    if result != 0 {
        warn!("release of {size:#x} bytes at {address:#x} failed");
    }
}

/// Makes `size` bytes at `address` readable and writable. Pages read as
/// zero on first touch.
pub fn commit(address: u64, size: u64) {
    debug_assert!(is_valid_address(address), "invalid address: {address:#x}");
    debug_assert!(is_page_aligned(size), "size not page aligned: {size:#x}");

    // SAFETY: the range lies inside a reservation owned by the caller.
    let result = unsafe {
        libc::mprotect(
            address as *mut libc::c_void,
            size as usize,
            libc::PROT_READ | libc::PROT_WRITE,
        )
    };

    if result != 0 {
        warn!("commit of {size:#x} bytes at {address:#x} failed");
    }
}

/// Returns committed pages to the OS without giving up the address range.
/// A later commit of the same range reads as zero.
pub fn uncommit(address: u64, size: u64) {
    debug_assert!(is_valid_address(address), "invalid address: {address:#x}");
    debug_assert!(is_page_aligned(size), "size not page aligned: {size:#x}");

    // SAFETY: the range lies inside a reservation owned by the caller; the
    // caller guarantees no live allocation references it.
    unsafe {
        libc::madvise(address as *mut libc::c_void, size as usize, libc::MADV_DONTNEED);
        libc::mprotect(address as *mut libc::c_void, size as usize, libc::PROT_NONE);
    }
}

/// Zeroes `size` bytes at `address`. The size must be a multiple of 8.
pub fn clear(address: u64, size: u64) {
    debug_assert!(is_valid_address(address), "invalid address: {address:#x}");
    debug_assert!(
        size & mask(BYTES_PER_WORD as u64) == 0,
        "size must align on 8 bytes: {size:#x}"
    );

    // SAFETY: the caller owns a committed allocation covering the range.
    unsafe { ptr::write_bytes(address as *mut u8, 0, size as usize) };
}

/// Copies `size` bytes from `src` to `dst`. The ranges must not overlap and
/// the size must be a multiple of 8.
pub fn copy(src: u64, dst: u64, size: u64) {
    debug_assert!(is_valid_address(src), "invalid source: {src:#x}");
    debug_assert!(is_valid_address(dst), "invalid destination: {dst:#x}");
    debug_assert!(
        size & mask(BYTES_PER_WORD as u64) == 0,
        "size must align on 8 bytes: {size:#x}"
    );

    // SAFETY: the caller owns committed allocations covering both ranges and
    // guarantees they are disjoint.
    unsafe { ptr::copy_nonoverlapping(src as *const u8, dst as *mut u8, size as usize) };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_size_sane() {
        let page = page_size();
        assert!(page >= 4096);
        assert!(page.is_power_of_two());
    }

    #[test]
    fn test_reserve_release() {
        let size = 16 * page_size();
        let address = reserve(size);
        assert_ne!(address, 0);
        assert_eq!(address & page_mask(), 0);
        release(address, size);
    }

    #[test]
    fn test_reserve_aligned() {
        let alignment = 1 << 22; // 4 MiB
        let size = alignment;
        let address = reserve_aligned(size, alignment);
        assert_ne!(address, 0);
        assert_eq!(address & (alignment - 1), 0);
        release(address, size);
    }

    #[test]
    fn test_commit_clear_copy() {
        let size = 4 * page_size();
        let address = reserve(size);
        assert_ne!(address, 0);
        commit(address, size);

        clear(address, size);
        // SAFETY (test): range was just committed read-write.
        unsafe {
            let first = address as *mut u64;
            assert_eq!(*first, 0);
            *first = 0xFEED_FACE_CAFE_BEEF;
        }
        copy(address, address + page_size(), 8);
        unsafe {
            let copied = (address + page_size()) as *const u64;
            assert_eq!(*copied, 0xFEED_FACE_CAFE_BEEF);
        }

        release(address, size);
    }
}
