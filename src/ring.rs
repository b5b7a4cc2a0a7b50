//! Repeat ("magic ring") mappings.
//!
//! A repeat mapping is one physical buffer of `W` bytes presented as `N`
//! adjacent virtual views, so the span behaves like a linear buffer with
//! wraparound: a write through any view is instantly visible through all of
//! them (`view[i][k] == view[j][k]` for all valid `i`, `j`, `k`).
//!
//! # Build algorithm
//!
//! 1. Create a backing object of `W` bytes that can be mapped more than once
//!    (memfd / transient shm object / page-file mapping object / shared
//!    memory handle). Any transient name is gone before the call returns.
//! 2. Reserve a contiguous `W * N` placeholder span with no access rights,
//!    purely to discover `N` adjacent free slots.
//! 3. Map the backing object read-write at each `base + i*W`, replacing the
//!    placeholder.
//! 4. If any view fails to map, unwind *everything* (mapped views and the
//!    placeholder) and retry from step 2.
//!
//! Platforms whose kernels can replace a placeholder atomically never race
//! and run a single attempt. On the capability kernel the address probe and
//! the view mappings are separate steps, so an unrelated allocation can land
//! inside the span between them; the bounded retry loop is what makes the
//! build correct there, not a performance tweak. The attempt budget is
//! explicit ([`DEFAULT_BUILD_ATTEMPTS`]) and exhausting it reports
//! [`Error::RaceLost`], distinct from address-space exhaustion.
//!
//! # Example
//!
//! ```rust,ignore
//! use vmem::{RepeatMapping, ALLOC_GRANULARITY};
//!
//! // 3 granularity units wide, repeated 5 times.
//! let ring = RepeatMapping::new(3, 5)?;
//! let w = ring.ring_len();
//! unsafe {
//!     ring.as_mut_slice()[0] = 20;
//!     assert_eq!(ring.as_slice()[4 * w], 20); // visible in every view
//! }
//! ```

use std::ptr::NonNull;

use tracing::{debug, warn};

use crate::error::{contract_violation, Error, Result};
use crate::{sys, ALLOC_GRANULARITY};

/// Default number of build attempts before a repeat-mapping build gives up
/// with [`Error::RaceLost`].
///
/// Only consumed on platforms without atomic placeholder replacement; the
/// others succeed or fail on the first attempt.
pub const DEFAULT_BUILD_ATTEMPTS: u32 = 40;

/// Platform pieces the builder is written against.
///
/// One implementation per platform lives in [`crate::sys`]; the builder and
/// teardown logic exist exactly once, here.
pub(crate) trait RingBackend {
    /// Multi-mappable backing object. Dropping it releases the identity
    /// (the storage itself lives while any view is mapped).
    type Backing;
    /// Reserved-but-unmapped span state, consumed by [`Self::abandon_span`].
    type Span;

    /// Whether placing a view over the reserved span cannot race with
    /// unrelated allocations. When true, a failed view map is a real error
    /// and retrying would not help.
    const ATOMIC_PLACEMENT: bool;

    fn create_backing(&self, len: usize) -> Result<Self::Backing>;
    fn reserve_span(&self, total: usize) -> Result<Self::Span>;
    fn span_base(&self, span: &Self::Span) -> NonNull<u8>;

    /// Map view `index` of `view_count` over the span. On error the span is
    /// left with exactly `index` views mapped.
    fn map_view(
        &self,
        span: &mut Self::Span,
        backing: &Self::Backing,
        index: u32,
        view_len: usize,
        view_count: u32,
    ) -> Result<()>;

    /// Unmap the first `views_mapped` views and release the rest of the
    /// span. Also used as the teardown path for fully-built mappings, so it
    /// must tolerate any `views_mapped` from 0 to `view_count`.
    fn abandon_span(
        &self,
        span: Self::Span,
        backing: &Self::Backing,
        views_mapped: u32,
        view_len: usize,
        view_count: u32,
    );
}

/// Builder/teardown core, generic over the platform backend.
pub(crate) struct RawRing<B: RingBackend> {
    backend: B,
    span: Option<B::Span>,
    backing: Option<B::Backing>,
    base: NonNull<u8>,
    view_len: usize,
    view_count: u32,
}

pub(crate) fn build<B: RingBackend>(
    backend: B,
    view_len: usize,
    view_count: u32,
    attempts: u32,
) -> Result<RawRing<B>> {
    let total = view_len * view_count as usize;
    let backing = backend.create_backing(view_len)?;
    let budget = if B::ATOMIC_PLACEMENT { 1 } else { attempts };

    for attempt in 1..=budget {
        let mut span = backend.reserve_span(total)?;
        let mut mapped = 0u32;
        let mut failure = None;

        for index in 0..view_count {
            match backend.map_view(&mut span, &backing, index, view_len, view_count) {
                Ok(()) => mapped += 1,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        match failure {
            None => {
                let base = backend.span_base(&span);
                debug!(
                    base = base.as_ptr() as usize,
                    view_len, view_count, attempt, "repeat mapping built"
                );
                return Ok(RawRing {
                    backend,
                    span: Some(span),
                    backing: Some(backing),
                    base,
                    view_len,
                    view_count,
                });
            }
            Some(e) => {
                // Leaving stale views mapped would alias unrelated memory
                // later, so the unwind is unconditional.
                backend.abandon_span(span, &backing, mapped, view_len, view_count);
                if B::ATOMIC_PLACEMENT {
                    return Err(e);
                }
                warn!(attempt, budget, error = %e, "repeat mapping view collided, retrying");
            }
        }
    }

    Err(Error::RaceLost { attempts: budget })
}

impl<B: RingBackend> Drop for RawRing<B> {
    fn drop(&mut self) {
        if let (Some(span), Some(backing)) = (self.span.take(), self.backing.take()) {
            self.backend
                .abandon_span(span, &backing, self.view_count, self.view_len, self.view_count);
        }
        // Dropping the backing releases the storage identity; the kernel
        // keeps the pages alive only while views reference them.
    }
}

/// A contiguous region presenting repeated views of one backing buffer.
///
/// The total span is `ring_len() * repeat_count()` bytes. Writes through any
/// view are visible through all views. The mapping is unmapped and its
/// backing released on drop; dropping a mapping whose build was unwound
/// part-way is safe.
pub struct RepeatMapping {
    inner: RawRing<sys::SysRing>,
}

impl RepeatMapping {
    /// Build a repeat mapping of `ring_width_units` allocation-granularity
    /// units, repeated `repeat_count` times, with the default attempt
    /// budget.
    ///
    /// # Errors
    ///
    /// [`Error::ContractViolation`] for zero width/count or a span that
    /// overflows the address space, [`Error::RaceLost`] when every build
    /// attempt collided, or the underlying allocation failure.
    pub fn new(ring_width_units: u32, repeat_count: u32) -> Result<Self> {
        Self::with_attempts(ring_width_units, repeat_count, DEFAULT_BUILD_ATTEMPTS)
    }

    /// Build with an explicit attempt budget.
    ///
    /// The budget only matters on platforms whose address reservation is not
    /// atomic; everywhere else the first attempt decides.
    pub fn with_attempts(
        ring_width_units: u32,
        repeat_count: u32,
        attempts: u32,
    ) -> Result<Self> {
        let (view_len, view_count) = ring_geometry(ring_width_units, repeat_count, attempts)?;
        let inner = build(sys::SysRing, view_len, view_count, attempts)?;
        Ok(Self { inner })
    }

    /// Base address of the first view.
    pub fn as_ptr(&self) -> *mut u8 {
        self.inner.base.as_ptr()
    }

    /// Width of one view in bytes (`ring_width_units * ALLOC_GRANULARITY`).
    pub fn ring_len(&self) -> usize {
        self.inner.view_len
    }

    /// Number of adjacent views.
    pub fn repeat_count(&self) -> u32 {
        self.inner.view_count
    }

    /// Total mapped span in bytes (`ring_len() * repeat_count()`).
    pub fn len(&self) -> usize {
        self.inner.view_len * self.inner.view_count as usize
    }

    /// Always false; a mapping cannot be built with a zero span.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// View the whole span as a byte slice.
    ///
    /// # Safety
    ///
    /// The caller must ensure no mutable references to this memory exist.
    pub unsafe fn as_slice(&self) -> &[u8] {
        // SAFETY: the span is mapped readable for the lifetime of self;
        // caller guarantees aliasing rules.
        unsafe { std::slice::from_raw_parts(self.as_ptr(), self.len()) }
    }

    /// View the whole span as a mutable byte slice.
    ///
    /// # Safety
    ///
    /// The caller must ensure exclusive access. This returns a mutable
    /// reference from `&self` because every view aliases the same pages by
    /// construction; callers own the synchronization.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn as_mut_slice(&self) -> &mut [u8] {
        // SAFETY: the span is mapped read-write for the lifetime of self;
        // caller guarantees exclusive access.
        unsafe { std::slice::from_raw_parts_mut(self.as_ptr(), self.len()) }
    }
}

// SAFETY: RepeatMapping is Send + Sync because the mapping is valid from any
// thread, the kernel owns page-level coherence for shared mappings, and all
// mutation goes through unsafe accessors whose callers own synchronization.
unsafe impl Send for RepeatMapping {}
unsafe impl Sync for RepeatMapping {}

fn ring_geometry(
    ring_width_units: u32,
    repeat_count: u32,
    attempts: u32,
) -> Result<(usize, u32)> {
    if ring_width_units == 0 || repeat_count == 0 {
        return Err(contract_violation(
            "repeat mapping width and repeat count must be nonzero",
        ));
    }
    if attempts == 0 {
        return Err(contract_violation("attempt budget must be nonzero"));
    }
    let view_len = (ring_width_units as usize)
        .checked_mul(ALLOC_GRANULARITY)
        .ok_or_else(|| contract_violation("ring width overflows the address space"))?;
    view_len
        .checked_mul(repeat_count as usize)
        .filter(|&t| t <= isize::MAX as usize)
        .ok_or_else(|| contract_violation("repeat mapping span overflows the address space"))?;
    Ok((view_len, repeat_count))
}
