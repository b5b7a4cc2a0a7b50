//! End-to-end regression tests against the real kernel.
//!
//! These exercise the public API the way an application would: sparse
//! reservations far larger than physical memory, on-demand commits, and
//! ring mappings used as linear buffers with wraparound.

use vmem::{commit, free, reserve, RepeatMapping, ALLOC_GRANULARITY, PAGE_SIZE};

// ============================================================================
// Repeat (ring) mappings
// ============================================================================

/// One write through view 0 is visible through every view.
#[test]
fn ring_views_alias_one_buffer() {
    let ring_count = 5;
    let ring = RepeatMapping::new(3, ring_count).unwrap();
    let ring_size = ring.ring_len();
    assert_eq!(ring_size, 3 * ALLOC_GRANULARITY);
    assert_eq!(ring.len(), ring_size * ring_count as usize);

    let bytes = unsafe { ring.as_mut_slice() };
    bytes[0] = 20;

    // Setting this value in 1 location updates every location.
    let sum: u32 = (0..ring_count as usize)
        .map(|i| u32::from(bytes[i * ring_size]))
        .sum();
    assert_eq!(sum, 100);
}

/// Writes land identically at any offset, through any view.
#[test]
fn ring_wraparound_at_arbitrary_offsets() {
    let ring = RepeatMapping::new(1, 4).unwrap();
    let w = ring.ring_len();
    let bytes = unsafe { ring.as_mut_slice() };

    bytes[w + 1234] = 77; // write through view 1
    assert_eq!(bytes[1234], 77); // read through view 0
    assert_eq!(bytes[3 * w + 1234], 77); // read through view 3

    bytes[w - 1] = 5; // last byte of view 0
    assert_eq!(bytes[2 * w - 1], 5);
}

/// Tearing a ring down leaks neither names nor address space.
#[test]
fn destroyed_ring_frees_its_address_space() {
    let ring = RepeatMapping::new(3, 5).unwrap();
    let total = ring.len();
    drop(ring);

    // A fresh same-size reservation must succeed afterwards.
    let region = reserve(total).unwrap();
    free(region, total).unwrap();

    // And so must building the same ring again.
    let again = RepeatMapping::new(3, 5).unwrap();
    drop(again);
}

/// A single view is a legal (if pointless) ring.
#[test]
fn single_view_ring() {
    let ring = RepeatMapping::new(1, 1).unwrap();
    let bytes = unsafe { ring.as_mut_slice() };
    bytes[0] = 9;
    assert_eq!(bytes[ring.ring_len() - 1], 0);
}

// ============================================================================
// Sparse regions
// ============================================================================

/// A 39-bit (512 GiB) reservation costs only address space; committing a
/// few megabytes makes exactly those pages usable.
#[cfg(target_pointer_width = "64")]
#[test]
fn sparse_half_terabyte_region() {
    let region_size = 1usize << 39;
    let region = reserve(region_size).unwrap();

    // Commits reserve page-file space, so this stays modest.
    let committed = PAGE_SIZE * 5000;
    commit(region, committed).unwrap();

    let ptr = region.as_ptr();
    unsafe {
        // Scattered writes across the committed prefix; only the touched
        // pages ever get physical backing.
        *ptr = 20;
        *ptr.add(100_000) = 20;
        *ptr.add(1_000_000) = 20;
        *ptr.add(10_000_000) = 20;
        *ptr.add(20_000_000) = 20;

        for i in 0..24 {
            *ptr.add(1 << i) = 50;
        }
        for i in 0..24 {
            assert_eq!(*ptr.add(1 << i), 50);
        }
        assert_eq!(*ptr.add(20_000_000), 20);
    }

    free(region, region_size).unwrap();
}

/// Create/destroy round trips have no observable side effects.
#[test]
fn reserve_free_round_trips() {
    for pages in [1usize, 2, 16, 1024] {
        let size = pages * PAGE_SIZE;
        let region = reserve(size).unwrap();
        free(region, size).unwrap();
    }
}

/// Every byte of a committed range is independently readable and writable.
#[test]
fn committed_range_fully_usable() {
    let size = 64 * PAGE_SIZE;
    let region = reserve(size).unwrap();
    commit(region, size).unwrap();

    let bytes = unsafe { std::slice::from_raw_parts_mut(region.as_ptr(), size) };
    for (i, b) in bytes.iter_mut().enumerate() {
        *b = (i % 251) as u8;
    }
    for (i, b) in bytes.iter().enumerate() {
        assert_eq!(*b, (i % 251) as u8);
    }

    free(region, size).unwrap();
}

/// Freeing the middle of a reservation leaves the head and tail reserved
/// and independently freeable.
#[cfg(not(windows))]
#[test]
fn partial_free_splits_reservation() {
    use std::ptr::NonNull;

    let region = reserve(3 * PAGE_SIZE).unwrap();
    let middle = unsafe { NonNull::new_unchecked(region.as_ptr().add(PAGE_SIZE)) };
    let tail = unsafe { NonNull::new_unchecked(region.as_ptr().add(2 * PAGE_SIZE)) };

    free(middle, PAGE_SIZE).unwrap();
    free(region, PAGE_SIZE).unwrap();
    free(tail, PAGE_SIZE).unwrap();
}
