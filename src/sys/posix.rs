//! POSIX backend (Linux, macOS, the BSDs), built on rustix.
//!
//! Reserve maps anonymous memory without swap accounting; commit remaps the
//! range with it. The ring backing is a memfd on Linux, elsewhere a shm
//! object unlinked the moment it exists.

use std::ptr::NonNull;

use rustix::fd::OwnedFd;
use rustix::mm::{MapFlags, ProtFlags};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::ledger::Range;
use crate::ring::RingBackend;

pub(crate) type ReserveToken = ();

/// munmap happily releases any sub-range of a mapping.
pub(crate) const PARTIAL_FREE_SUPPORTED: bool = true;

pub(crate) fn reserve(len: usize) -> Result<(NonNull<u8>, ReserveToken)> {
    let mut flags = MapFlags::PRIVATE;
    // Not every unix has the no-swap-accounting flag.
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        flags |= MapFlags::NORESERVE;
    }

    let ptr = unsafe {
        rustix::mm::mmap_anonymous(
            std::ptr::null_mut(),
            len,
            ProtFlags::READ | ProtFlags::WRITE,
            flags,
        )
    }
    .map_err(|errno| {
        debug!(%errno, len, "reserve mmap failed");
        Error::AddressSpaceExhausted { size: len }
    })?;

    NonNull::new(ptr.cast::<u8>())
        .map(|base| (base, ()))
        .ok_or(Error::AddressSpaceExhausted { size: len })
}

pub(crate) fn commit(addr: *mut u8, len: usize) -> Result<()> {
    // In-place remap without NORESERVE guarantees page-file backing.
    unsafe {
        rustix::mm::mmap_anonymous(
            addr.cast(),
            len,
            ProtFlags::READ | ProtFlags::WRITE,
            MapFlags::PRIVATE | MapFlags::FIXED,
        )
    }
    .map_err(|errno| {
        debug!(%errno, len, "commit remap failed");
        Error::CommitDenied { size: len }
    })?;
    Ok(())
}

pub(crate) fn release_exact(
    base: *mut u8,
    len: usize,
    token: ReserveToken,
) -> std::result::Result<(), (ReserveToken, Error)> {
    match unsafe { rustix::mm::munmap(base.cast(), len) } {
        Ok(()) => Ok(()),
        Err(errno) => Err((token, errno.into())),
    }
}

pub(crate) fn release_split(
    _record: Range,
    token: ReserveToken,
    sub: Range,
    head: Option<Range>,
    tail: Option<Range>,
) -> std::result::Result<(Option<ReserveToken>, Option<ReserveToken>), (ReserveToken, Error)> {
    // The leftovers keep their original mappings; only the freed sub-range
    // is unmapped.
    match unsafe { rustix::mm::munmap(sub.0 as *mut _, sub.1) } {
        Ok(()) => Ok((head.map(|_| ()), tail.map(|_| ()))),
        Err(errno) => Err((token, errno.into())),
    }
}

// ---------------------------------------------------------------------------
// Ring backend
// ---------------------------------------------------------------------------

/// Reserved-but-unmapped span for a repeat mapping under construction.
pub(crate) struct Span {
    base: NonNull<u8>,
    total: usize,
}

pub(crate) struct SysRing;

#[cfg(target_os = "linux")]
fn backing_fd(len: usize) -> Result<OwnedFd> {
    let _ = len;
    // Anonymous by construction; nothing to unlink.
    Ok(rustix::fs::memfd_create(
        "vmem-ring",
        rustix::fs::MemfdFlags::CLOEXEC,
    )?)
}

#[cfg(not(target_os = "linux"))]
fn backing_fd(len: usize) -> Result<OwnedFd> {
    use std::sync::atomic::{AtomicU32, Ordering};

    static COUNTER: AtomicU32 = AtomicU32::new(0);
    let _ = len;

    // Unlinked before the fd is ever used; the storage lives through the fd.
    let name = format!(
        "/vmem-ring-{}-{}",
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::Relaxed)
    );
    let fd = rustix::shm::open(
        &name,
        rustix::shm::OFlags::CREATE | rustix::shm::OFlags::EXCL | rustix::shm::OFlags::RDWR,
        rustix::fs::Mode::from_raw_mode(0o600),
    )?;
    if let Err(errno) = rustix::shm::unlink(&name) {
        warn!(%errno, name, "could not unlink transient shm name");
    }
    Ok(fd)
}

impl RingBackend for SysRing {
    type Backing = OwnedFd;
    type Span = Span;

    /// MAP_FIXED replaces the placeholder atomically; no race window.
    const ATOMIC_PLACEMENT: bool = true;

    fn create_backing(&self, len: usize) -> Result<OwnedFd> {
        let fd = backing_fd(len)?;
        rustix::fs::ftruncate(&fd, len as u64)?;
        Ok(fd)
    }

    fn reserve_span(&self, total: usize) -> Result<Span> {
        // PROT_NONE placeholder holds the span while the views go in.
        let ptr = unsafe {
            rustix::mm::mmap_anonymous(
                std::ptr::null_mut(),
                total,
                ProtFlags::empty(),
                MapFlags::PRIVATE,
            )
        }
        .map_err(|errno| {
            debug!(%errno, total, "span reservation failed");
            Error::AddressSpaceExhausted { size: total }
        })?;
        let base = NonNull::new(ptr.cast::<u8>())
            .ok_or(Error::AddressSpaceExhausted { size: total })?;
        Ok(Span { base, total })
    }

    fn span_base(&self, span: &Span) -> NonNull<u8> {
        span.base
    }

    fn map_view(
        &self,
        span: &mut Span,
        backing: &OwnedFd,
        index: u32,
        view_len: usize,
        _view_count: u32,
    ) -> Result<()> {
        let addr = unsafe { span.base.as_ptr().add(index as usize * view_len) };
        unsafe {
            rustix::mm::mmap(
                addr.cast(),
                view_len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED | MapFlags::FIXED,
                backing,
                0,
            )
        }?;
        Ok(())
    }

    fn abandon_span(
        &self,
        span: Span,
        _backing: &OwnedFd,
        _views_mapped: u32,
        _view_len: usize,
        _view_count: u32,
    ) {
        // One munmap covers mapped views and placeholder remainder alike.
        if let Err(errno) = unsafe { rustix::mm::munmap(span.base.as_ptr().cast(), span.total) } {
            warn!(%errno, "failed to unmap repeat-mapping span");
        }
    }
}
