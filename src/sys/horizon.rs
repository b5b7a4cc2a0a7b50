//! Capability-kernel backend (Horizon), built on the libnx virtual-memory
//! SDK.
//!
//! The kernel has only a single "reservation" concept; reserve and commit
//! are emulated through the crate-level ledger, which carries the kernel
//! token and splits it on partial free. Ring placement is non-atomic here
//! (probe, then map each view), so the builder's retry loop applies.
//!
//! Every `virtmem*` call happens with the SDK's global lock held.

use std::ffi::c_void;
use std::io;
use std::ptr::NonNull;

use tracing::{debug, error, warn};

use crate::error::{Error, Result};
use crate::ledger::Range;
use crate::ring::RingBackend;

type SvcHandle = u32;

/// Read | write.
const PERM_RW: u32 = 3;

#[repr(C)]
pub(crate) struct VirtmemReservation {
    _opaque: [u8; 0],
}

extern "C" {
    fn virtmemLock();
    fn virtmemUnlock();
    fn virtmemFindAslr(size: usize, guard_size: usize) -> *mut c_void;
    fn virtmemAddReservation(mem: *mut c_void, size: usize) -> *mut VirtmemReservation;
    fn virtmemRemoveReservation(reservation: *mut VirtmemReservation);

    fn svcCreateSharedMemory(out: *mut SvcHandle, size: usize, local_perm: u32, other_perm: u32)
        -> u32;
    fn svcMapSharedMemory(handle: SvcHandle, addr: *mut c_void, size: usize, perm: u32) -> u32;
    fn svcUnmapSharedMemory(handle: SvcHandle, addr: *mut c_void, size: usize) -> u32;
    fn svcCloseHandle(handle: SvcHandle) -> u32;
}

/// Kernel reservation token, stored in the ledger.
pub(crate) struct ReserveToken(*mut VirtmemReservation);

// SAFETY: the token is only dereferenced by the kernel SDK, always under
// the virtmem lock; holding it across threads is fine.
unsafe impl Send for ReserveToken {}

/// Freeing a sub-range splits the reservation into fresh tokens.
pub(crate) const PARTIAL_FREE_SUPPORTED: bool = true;

/// Run `f` with the SDK's virtual-memory lock held.
fn with_virtmem_lock<R>(f: impl FnOnce() -> R) -> R {
    unsafe { virtmemLock() };
    let result = f();
    unsafe { virtmemUnlock() };
    result
}

pub(crate) fn reserve(len: usize) -> Result<(NonNull<u8>, ReserveToken)> {
    let (addr, reservation) = with_virtmem_lock(|| {
        let addr = unsafe { virtmemFindAslr(len, 0) };
        if addr.is_null() {
            return (addr, std::ptr::null_mut());
        }
        (addr, unsafe { virtmemAddReservation(addr, len) })
    });

    match (NonNull::new(addr.cast::<u8>()), reservation.is_null()) {
        (Some(base), false) => Ok((base, ReserveToken(reservation))),
        _ => {
            debug!(len, "address-space probe or reservation failed");
            Err(Error::AddressSpaceExhausted { size: len })
        }
    }
}

pub(crate) fn commit(addr: *mut u8, len: usize) -> Result<()> {
    // No separate commit concept; the ledger's state change is the commit.
    let _ = (addr, len);
    Ok(())
}

pub(crate) fn release_exact(
    base: *mut u8,
    len: usize,
    token: ReserveToken,
) -> std::result::Result<(), (ReserveToken, Error)> {
    let _ = (base, len);
    with_virtmem_lock(|| unsafe { virtmemRemoveReservation(token.0) });
    Ok(())
}

pub(crate) fn release_split(
    _record: Range,
    token: ReserveToken,
    _sub: Range,
    head: Option<Range>,
    tail: Option<Range>,
) -> std::result::Result<(Option<ReserveToken>, Option<ReserveToken>), (ReserveToken, Error)> {
    let renew = |range: Option<Range>| -> Option<ReserveToken> {
        let (base, len) = range?;
        let reservation = unsafe { virtmemAddReservation(base as *mut c_void, len) };
        if reservation.is_null() {
            // The range is genuinely unreserved now; tracking follows suit.
            error!(base, len, "could not re-reserve leftover range after partial free");
            None
        } else {
            Some(ReserveToken(reservation))
        }
    };

    Ok(with_virtmem_lock(|| {
        unsafe { virtmemRemoveReservation(token.0) };
        (renew(head), renew(tail))
    }))
}

// ---------------------------------------------------------------------------
// Ring backend
// ---------------------------------------------------------------------------

/// Owned shared-memory kernel handle.
pub(crate) struct Backing {
    handle: SvcHandle,
    len: usize,
}

impl Drop for Backing {
    fn drop(&mut self) {
        let rc = unsafe { svcCloseHandle(self.handle) };
        if rc != 0 {
            warn!(rc, "svcCloseHandle failed for ring backing");
        }
    }
}

// SAFETY: kernel handles are plain capabilities, valid from any thread.
unsafe impl Send for Backing {}
unsafe impl Sync for Backing {}

pub(crate) struct Span {
    base: NonNull<u8>,
    reservation: *mut VirtmemReservation,
}

pub(crate) struct SysRing;

fn svc_error(call: &str, rc: u32) -> Error {
    io::Error::other(format!("{call} failed with rc {rc:#x}")).into()
}

impl RingBackend for SysRing {
    type Backing = Backing;
    type Span = Span;

    /// The probe and the view mappings are separate calls; anything can
    /// allocate into the span in between. The builder retries.
    const ATOMIC_PLACEMENT: bool = false;

    fn create_backing(&self, len: usize) -> Result<Backing> {
        let mut handle: SvcHandle = 0;
        let rc = unsafe { svcCreateSharedMemory(&mut handle, len, PERM_RW, PERM_RW) };
        if rc != 0 {
            debug!(rc, len, "shared-memory creation failed");
            return Err(Error::CommitDenied { size: len });
        }
        Ok(Backing { handle, len })
    }

    fn reserve_span(&self, total: usize) -> Result<Span> {
        with_virtmem_lock(|| {
            let addr = unsafe { virtmemFindAslr(total, 0) };
            let base = NonNull::new(addr.cast::<u8>())
                .ok_or(Error::AddressSpaceExhausted { size: total })?;
            let reservation = unsafe { virtmemAddReservation(addr, total) };
            if reservation.is_null() {
                return Err(Error::AddressSpaceExhausted { size: total });
            }
            Ok(Span { base, reservation })
        })
    }

    fn span_base(&self, span: &Span) -> NonNull<u8> {
        span.base
    }

    fn map_view(
        &self,
        span: &mut Span,
        backing: &Backing,
        index: u32,
        view_len: usize,
        _view_count: u32,
    ) -> Result<()> {
        debug_assert_eq!(view_len, backing.len);
        let addr = unsafe { span.base.as_ptr().add(index as usize * view_len) };
        let rc = unsafe { svcMapSharedMemory(backing.handle, addr.cast(), view_len, PERM_RW) };
        if rc != 0 {
            return Err(svc_error("svcMapSharedMemory", rc));
        }
        Ok(())
    }

    fn abandon_span(
        &self,
        span: Span,
        backing: &Backing,
        views_mapped: u32,
        view_len: usize,
        _view_count: u32,
    ) {
        for index in 0..views_mapped {
            let addr = unsafe { span.base.as_ptr().add(index as usize * view_len) };
            let rc = unsafe { svcUnmapSharedMemory(backing.handle, addr.cast(), view_len) };
            if rc != 0 {
                warn!(index, rc, "svcUnmapSharedMemory failed");
            }
        }
        with_virtmem_lock(|| unsafe { virtmemRemoveReservation(span.reservation) });
    }
}
