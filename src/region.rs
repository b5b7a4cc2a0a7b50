//! Reserve, commit, and free of raw virtual address ranges.
//!
//! `reserve` claims address space without physical backing, `commit` makes
//! a sub-range usable (guaranteeing page-file backing where the platform
//! supports the distinction), and `free` releases both. Regions are
//! exclusively owned by the caller that reserved them; these calls do not
//! serialize concurrent misuse of a single region.
//!
//! Every call is validated against the crate's tracked metadata before any
//! parameter reaches the kernel: a free size that does not match what was
//! reserved is undefined behavior on several kernels (it can crash the
//! process outright), so it is caught here and surfaced as
//! [`Error::ContractViolation`](crate::Error::ContractViolation) instead.
//!
//! # Example
//!
//! ```rust,ignore
//! use vmem::{reserve, commit, free, PAGE_SIZE};
//!
//! // Claim half a terabyte of address space; costs nothing physical.
//! let region = reserve(512 << 30)?;
//!
//! // Make the first megabyte actually writable.
//! commit(region, 1 << 20)?;
//! unsafe { *region.as_ptr() = 42 };
//!
//! free(region, 512 << 30)?;
//! ```

use std::ptr::NonNull;

use tracing::debug;

use crate::error::{contract_violation, Result};
use crate::ledger::{FreePlan, Ledger, Record, RegionState};
use crate::{sys, PAGE_SIZE};

/// Tracked metadata for every live reservation in this process.
static REGIONS: Ledger<sys::ReserveToken> = Ledger::new();

/// Reserve `size` bytes of virtual address space.
///
/// No physical memory and no page-file space is consumed; only address
/// space. `size` is rounded up to [`PAGE_SIZE`]. On platforms that need an
/// explicit [`commit`], touching the memory before committing fails cleanly
/// rather than crashing.
///
/// # Errors
///
/// [`Error::AddressSpaceExhausted`](crate::Error::AddressSpaceExhausted) if
/// the kernel cannot grant the range;
/// [`Error::ContractViolation`](crate::Error::ContractViolation) for a zero
/// size.
pub fn reserve(size: usize) -> Result<NonNull<u8>> {
    let len = page_span(size)?;
    let (base, token) = sys::reserve(len)?;
    REGIONS.insert(base.as_ptr() as usize, len, RegionState::Reserved, token);
    debug!(base = base.as_ptr() as usize, len, "reserved region");
    Ok(base)
}

/// Commit `size` bytes at `addr`, which must lie wholly inside one
/// reservation.
///
/// After a successful commit every byte of the range is readable and
/// writable, and backing is guaranteed even under later memory pressure.
/// On kernels that auto-commit on first write this only reserves page-file
/// space (or is a validated no-op).
///
/// # Errors
///
/// [`Error::CommitDenied`](crate::Error::CommitDenied) if the system cannot
/// guarantee backing;
/// [`Error::ContractViolation`](crate::Error::ContractViolation) if the
/// range is not inside a tracked reservation.
pub fn commit(addr: NonNull<u8>, size: usize) -> Result<()> {
    let len = page_span(size)?;
    let base = page_aligned(addr)?;
    REGIONS.check_contains(base, len)?;
    sys::commit(addr.as_ptr(), len)?;
    REGIONS.mark_committed(base, len);
    debug!(base, len, "committed range");
    Ok(())
}

/// Release the reservation (and any commitment) for `size` bytes at `addr`.
///
/// An exact free removes the whole reservation. Freeing a strict sub-range
/// is honored where the kernel supports it and leaves the head and/or tail
/// leftovers reserved and independently freeable; on Windows the kernel
/// releases whole allocations only, so a partial free is rejected.
///
/// # Errors
///
/// [`Error::ContractViolation`](crate::Error::ContractViolation) if the
/// range was never reserved, straddles reservation boundaries, or is a
/// partial free on a platform without partial release. Kernel-level
/// failures are passed through.
pub fn free(addr: NonNull<u8>, size: usize) -> Result<()> {
    let len = page_span(size)?;
    let base = page_aligned(addr)?;

    let FreePlan { record, head, tail } = REGIONS.take_covering(base, len)?;
    let Record {
        base: record_base,
        len: record_len,
        state,
        token,
    } = record;

    let restore = |token| {
        REGIONS.restore(Record {
            base: record_base,
            len: record_len,
            state,
            token,
        });
    };

    if head.is_none() && tail.is_none() {
        match sys::release_exact(addr.as_ptr(), len, token) {
            Ok(()) => {
                debug!(base, len, "freed region");
                Ok(())
            }
            Err((token, e)) => {
                restore(token);
                Err(e)
            }
        }
    } else if !sys::PARTIAL_FREE_SUPPORTED {
        restore(token);
        Err(contract_violation(format!(
            "partial free of {len:#x} bytes at {base:#x}: this platform releases whole reservations only"
        )))
    } else {
        match sys::release_split((record_base, record_len), token, (base, len), head, tail) {
            Ok((head_token, tail_token)) => {
                if let (Some((b, l)), Some(t)) = (head, head_token) {
                    REGIONS.insert(b, l, state, t);
                }
                if let (Some((b, l)), Some(t)) = (tail, tail_token) {
                    REGIONS.insert(b, l, state, t);
                }
                debug!(base, len, "freed sub-range");
                Ok(())
            }
            Err((token, e)) => {
                restore(token);
                Err(e)
            }
        }
    }
}

/// Round `size` up to a whole number of pages, rejecting zero.
fn page_span(size: usize) -> Result<usize> {
    if size == 0 {
        return Err(contract_violation("size must be greater than 0"));
    }
    size.checked_add(PAGE_SIZE - 1)
        .map(|s| s & !(PAGE_SIZE - 1))
        .ok_or_else(|| contract_violation("size overflows the address space"))
}

fn page_aligned(addr: NonNull<u8>) -> Result<usize> {
    let base = addr.as_ptr() as usize;
    if base % PAGE_SIZE != 0 {
        return Err(contract_violation(format!(
            "address {base:#x} is not page-aligned"
        )));
    }
    Ok(base)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    // These run against the real kernel. They only assert behavior visible
    // through the public API, because the ledger is shared by every test in
    // the process.

    #[test]
    fn reserve_then_free_round_trip() {
        let region = reserve(4 * PAGE_SIZE).unwrap();
        free(region, 4 * PAGE_SIZE).unwrap();
    }

    #[test]
    fn sizes_round_up_to_page_multiples() {
        let region = reserve(1).unwrap();
        // The single byte became a whole page; freeing by either size works
        // because both round to the same span.
        free(region, PAGE_SIZE).unwrap();
    }

    #[test]
    fn committed_range_is_readable_and_writable() {
        let pages = 16;
        let region = reserve(pages * PAGE_SIZE).unwrap();
        commit(region, pages * PAGE_SIZE).unwrap();

        let ptr = region.as_ptr();
        for page in 0..pages {
            unsafe {
                *ptr.add(page * PAGE_SIZE) = page as u8;
                *ptr.add(page * PAGE_SIZE + PAGE_SIZE - 1) = !(page as u8);
            }
        }
        for page in 0..pages {
            unsafe {
                assert_eq!(*ptr.add(page * PAGE_SIZE), page as u8);
                assert_eq!(*ptr.add(page * PAGE_SIZE + PAGE_SIZE - 1), !(page as u8));
            }
        }

        free(region, pages * PAGE_SIZE).unwrap();
    }

    #[test]
    fn commit_outside_reservation_is_rejected() {
        let region = reserve(2 * PAGE_SIZE).unwrap();

        // Overruns the end of the reservation.
        let err = commit(region, 3 * PAGE_SIZE).unwrap_err();
        assert!(matches!(err, Error::ContractViolation(_)));

        free(region, 2 * PAGE_SIZE).unwrap();
    }

    #[test]
    fn free_with_oversized_length_is_rejected() {
        let region = reserve(2 * PAGE_SIZE).unwrap();

        let err = free(region, 3 * PAGE_SIZE).unwrap_err();
        assert!(matches!(err, Error::ContractViolation(_)));

        // The reservation is still intact and freeable.
        free(region, 2 * PAGE_SIZE).unwrap();
    }

    #[test]
    fn near_max_length_is_rejected() {
        let region = reserve(PAGE_SIZE).unwrap();

        // Rounds to a valid page span but wraps past the address-space end
        // when added to the base.
        let err = free(region, usize::MAX - 2 * PAGE_SIZE).unwrap_err();
        assert!(matches!(err, Error::ContractViolation(_)));

        free(region, PAGE_SIZE).unwrap();
    }

    #[test]
    fn misaligned_address_is_rejected() {
        let region = reserve(PAGE_SIZE).unwrap();
        let inside = unsafe { NonNull::new_unchecked(region.as_ptr().add(1)) };

        assert!(matches!(
            commit(inside, 16),
            Err(Error::ContractViolation(_))
        ));
        assert!(matches!(free(inside, 16), Err(Error::ContractViolation(_))));

        free(region, PAGE_SIZE).unwrap();
    }

    #[test]
    fn zero_size_is_rejected() {
        assert!(matches!(reserve(0), Err(Error::ContractViolation(_))));
    }

    #[cfg(not(windows))]
    #[test]
    fn partial_free_leaves_independent_leftovers() {
        let region = reserve(3 * PAGE_SIZE).unwrap();
        let middle = unsafe { NonNull::new_unchecked(region.as_ptr().add(PAGE_SIZE)) };
        let tail = unsafe { NonNull::new_unchecked(region.as_ptr().add(2 * PAGE_SIZE)) };

        free(middle, PAGE_SIZE).unwrap();

        // Head and tail survived the split and free independently.
        free(region, PAGE_SIZE).unwrap();
        free(tail, PAGE_SIZE).unwrap();
    }
}
