//! # vmem
//!
//! Cross-platform virtual address-space management: reserve address ranges
//! without committing physical memory, commit pages on demand, release
//! ranges, and build "magic ring" repeat mappings where one physical buffer
//! appears several times at adjacent addresses.
//!
//! ## Features
//!
//! - **Sparse reservations**: claim hundreds of gigabytes of address space
//!   and commit only the parts you touch
//! - **Validated frees**: sizes are checked against tracked metadata before
//!   reaching the kernel, where a mismatch could crash the process
//! - **Repeat mappings**: `N` adjacent views of one buffer, so a linear
//!   write wraps around for free
//! - **One code path**: the ring builder is written once against a small
//!   platform interface (POSIX mmap, Windows placeholder APIs, and a
//!   capability kernel that emulates reserve/commit through a ledger)
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use vmem::{reserve, commit, free, RepeatMapping, PAGE_SIZE};
//!
//! // Sparse region: reserve big, commit small.
//! let region = reserve(512 << 30)?;
//! commit(region, 64 * PAGE_SIZE)?;
//! unsafe { *region.as_ptr() = 1 };
//! free(region, 512 << 30)?;
//!
//! // Ring: writes through any view show up in all of them.
//! let ring = RepeatMapping::new(3, 5)?;
//! unsafe { ring.as_mut_slice()[0] = 20 };
//! assert_eq!(unsafe { ring.as_slice()[ring.ring_len()] }, 20);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod error;
mod ledger;
pub mod region;
pub mod ring;
mod sys;

pub use error::{Error, Result};
pub use region::{commit, free, reserve};
pub use ring::{RepeatMapping, DEFAULT_BUILD_ATTEMPTS};

/// Size of one memory page in bytes.
///
/// 4096 on every supported platform.
pub const PAGE_SIZE: usize = 4096;

/// Minimum alignment and size increment for address-space reservations.
///
/// 64 KiB everywhere: the strictest supported platform's granularity, used
/// uniformly so callers see one behavior even where the kernel would allow
/// finer mappings.
pub const ALLOC_GRANULARITY: usize = 64 * 1024;
