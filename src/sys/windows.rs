//! Windows backend, built on windows-sys.
//!
//! Reserve/commit is the native two-step `VirtualAlloc` flow. The ring build
//! uses the placeholder APIs; replacing a placeholder is atomic, so it never
//! retries. The backing is an unnamed page-file mapping object.

use std::ffi::c_void;
use std::io;
use std::ptr::{null, null_mut, NonNull};

use tracing::{debug, warn};
use windows_sys::Win32::Foundation::{CloseHandle, HANDLE, INVALID_HANDLE_VALUE};
use windows_sys::Win32::System::Memory::{
    CreateFileMappingW, MapViewOfFile3, UnmapViewOfFile2, VirtualAlloc, VirtualAlloc2,
    VirtualFree, MEMORY_MAPPED_VIEW_ADDRESS, MEM_COMMIT, MEM_PRESERVE_PLACEHOLDER, MEM_RELEASE,
    MEM_REPLACE_PLACEHOLDER, MEM_RESERVE, MEM_RESERVE_PLACEHOLDER, PAGE_NOACCESS, PAGE_READWRITE,
};

use crate::error::{contract_violation, Error, Result};
use crate::ledger::Range;
use crate::ring::RingBackend;

pub(crate) type ReserveToken = ();

/// `VirtualFree(MEM_RELEASE)` only accepts whole allocations.
pub(crate) const PARTIAL_FREE_SUPPORTED: bool = false;

pub(crate) fn reserve(len: usize) -> Result<(NonNull<u8>, ReserveToken)> {
    let ptr = unsafe { VirtualAlloc(null(), len, MEM_RESERVE, PAGE_READWRITE) };
    match NonNull::new(ptr.cast::<u8>()) {
        Some(base) => Ok((base, ())),
        None => {
            debug!(error = %io::Error::last_os_error(), len, "reserve failed");
            Err(Error::AddressSpaceExhausted { size: len })
        }
    }
}

pub(crate) fn commit(addr: *mut u8, len: usize) -> Result<()> {
    let ptr = unsafe { VirtualAlloc(addr.cast(), len, MEM_COMMIT, PAGE_READWRITE) };
    if ptr.is_null() {
        debug!(error = %io::Error::last_os_error(), len, "commit failed");
        return Err(Error::CommitDenied { size: len });
    }
    Ok(())
}

pub(crate) fn release_exact(
    base: *mut u8,
    len: usize,
    token: ReserveToken,
) -> std::result::Result<(), (ReserveToken, Error)> {
    // Size must be zero for MEM_RELEASE; the tracked length already
    // validated the caller's size.
    let _ = len;
    if unsafe { VirtualFree(base.cast(), 0, MEM_RELEASE) } == 0 {
        return Err((token, io::Error::last_os_error().into()));
    }
    Ok(())
}

pub(crate) fn release_split(
    _record: Range,
    token: ReserveToken,
    _sub: Range,
    _head: Option<Range>,
    _tail: Option<Range>,
) -> std::result::Result<(Option<ReserveToken>, Option<ReserveToken>), (ReserveToken, Error)> {
    // Unreachable through the public API: callers are rejected first
    // because PARTIAL_FREE_SUPPORTED is false.
    Err((
        token,
        contract_violation("this platform releases whole reservations only"),
    ))
}

// ---------------------------------------------------------------------------
// Ring backend
// ---------------------------------------------------------------------------

/// Page-file-backed mapping object.
pub(crate) struct Backing(HANDLE);

impl Drop for Backing {
    fn drop(&mut self) {
        unsafe {
            CloseHandle(self.0);
        }
    }
}

// SAFETY: the mapping handle is an owned kernel object reference, valid
// from any thread.
unsafe impl Send for Backing {}
unsafe impl Sync for Backing {}

/// Placeholder span under construction. `splits` counts how many times the
/// original placeholder has been carved so teardown can release every piece.
pub(crate) struct Span {
    base: NonNull<u8>,
    splits: u32,
}

pub(crate) struct SysRing;

impl RingBackend for SysRing {
    type Backing = Backing;
    type Span = Span;

    /// MEM_REPLACE_PLACEHOLDER swaps a view in atomically; no race window.
    const ATOMIC_PLACEMENT: bool = true;

    fn create_backing(&self, len: usize) -> Result<Backing> {
        let handle = unsafe {
            CreateFileMappingW(
                INVALID_HANDLE_VALUE, // page file, not a real file
                null(),
                PAGE_READWRITE,
                (len as u64 >> 32) as u32,
                len as u32,
                null(), // unnamed: never visible to other processes
            )
        };
        if handle.is_null() {
            debug!(error = %io::Error::last_os_error(), len, "backing mapping creation failed");
            return Err(Error::CommitDenied { size: len });
        }
        Ok(Backing(handle))
    }

    fn reserve_span(&self, total: usize) -> Result<Span> {
        let ptr = unsafe {
            VirtualAlloc2(
                INVALID_HANDLE_VALUE,
                null(),
                total,
                MEM_RESERVE | MEM_RESERVE_PLACEHOLDER,
                PAGE_NOACCESS,
                null_mut(),
                0,
            )
        };
        let base = NonNull::new(ptr.cast::<u8>()).ok_or_else(|| {
            debug!(error = %io::Error::last_os_error(), total, "placeholder reservation failed");
            Error::AddressSpaceExhausted { size: total }
        })?;
        Ok(Span { base, splits: 0 })
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
        view_count: u32,
    ) -> Result<()> {
        let addr = unsafe { span.base.as_ptr().add(index as usize * view_len) };

        // Carve a view-sized placeholder off the remainder. The last view
        // takes the remainder as-is.
        if index + 1 < view_count {
            if unsafe {
                VirtualFree(
                    addr.cast(),
                    view_len,
                    MEM_RELEASE | MEM_PRESERVE_PLACEHOLDER,
                )
            } == 0
            {
                return Err(io::Error::last_os_error().into());
            }
            span.splits = index + 1;
        }

        let view = unsafe {
            MapViewOfFile3(
                backing.0,
                INVALID_HANDLE_VALUE,
                addr.cast(),
                0,
                view_len,
                MEM_REPLACE_PLACEHOLDER,
                PAGE_READWRITE,
                null_mut(),
                0,
            )
        };
        if view.Value.is_null() {
            return Err(io::Error::last_os_error().into());
        }
        Ok(())
    }

    fn abandon_span(
        &self,
        span: Span,
        _backing: &Backing,
        views_mapped: u32,
        view_len: usize,
        view_count: u32,
    ) {
        let addr_of = |index: u32| -> *mut c_void {
            unsafe { span.base.as_ptr().add(index as usize * view_len).cast() }
        };

        // Mapped views revert to placeholders first.
        for index in 0..views_mapped {
            let view = MEMORY_MAPPED_VIEW_ADDRESS {
                Value: addr_of(index),
            };
            if unsafe { UnmapViewOfFile2(INVALID_HANDLE_VALUE, view, MEM_PRESERVE_PLACEHOLDER) }
                == 0
            {
                warn!(index, error = %io::Error::last_os_error(), "failed to unmap ring view");
            }
        }

        // Each carved placeholder is its own region, plus the tail remainder
        // if the carving never finished.
        for index in 0..span.splits {
            unsafe {
                VirtualFree(addr_of(index), 0, MEM_RELEASE);
            }
        }
        if span.splits < view_count {
            unsafe {
                VirtualFree(addr_of(span.splits), 0, MEM_RELEASE);
            }
        }
    }
}
