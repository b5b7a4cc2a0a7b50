//! Platform backends, selected at build time.
//!
//! Every backend exposes the same surface:
//!
//! - `ReserveToken`: opaque kernel reservation token stored in the ledger
//!   (`()` where the kernel tracks reservations itself),
//! - `PARTIAL_FREE_SUPPORTED`: whether the kernel can release a sub-range
//!   of a reservation,
//! - `reserve` / `commit` / `release_exact` / `release_split`: the region
//!   primitives,
//! - `SysRing`: the [`crate::ring::RingBackend`] implementation.
//!
//! Three capability sets exist: native reserve/commit/free with atomic view
//! placement (POSIX, Windows), and ledger-emulated reserve/commit with
//! retry-based view placement (the capability kernel, which has only a
//! single "reservation" concept and no atomic reserve-and-map primitive).
//!
//! The release functions hand their token back on failure so the caller can
//! keep the tracked metadata matching kernel reality.

#[cfg(target_os = "horizon")]
mod horizon;
#[cfg(target_os = "horizon")]
pub(crate) use horizon::*;

#[cfg(all(unix, not(target_os = "horizon")))]
mod posix;
#[cfg(all(unix, not(target_os = "horizon")))]
pub(crate) use posix::*;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
pub(crate) use windows::*;
