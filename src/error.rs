//! Error types for vmem.

use thiserror::Error;

/// Result type alias using vmem's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for vmem operations.
#[derive(Error, Debug)]
pub enum Error {
    /// The kernel could not find or grant the requested address range.
    ///
    /// Not fatal: the caller may retry with a smaller size.
    #[error("address space exhausted: could not reserve {size} bytes")]
    AddressSpaceExhausted {
        /// Size of the failed reservation in bytes.
        size: usize,
    },

    /// The system lacks resources to guarantee backing for a commit.
    ///
    /// The caller may retry with a smaller range.
    #[error("commit denied: could not guarantee backing for {size} bytes")]
    CommitDenied {
        /// Size of the failed commit in bytes.
        size: usize,
    },

    /// An intervening allocation invalidated every attempt to build a
    /// repeat mapping.
    ///
    /// Only returned after the whole attempt budget is spent; individual
    /// collisions are retried internally.
    #[error("repeat mapping lost the address-space race {attempts} times")]
    RaceLost {
        /// How many build attempts were made before giving up.
        attempts: u32,
    },

    /// The caller passed an address or size inconsistent with a prior
    /// reservation.
    ///
    /// Detected against tracked metadata before anything reaches the
    /// kernel, where the same mistake could corrupt the process. With the
    /// `strict` cargo feature enabled this panics instead.
    #[error("contract violation: {0}")]
    ContractViolation(String),

    /// System call error (via rustix).
    #[cfg(unix)]
    #[error("system error: {0}")]
    System(#[from] rustix::io::Errno),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Build a `ContractViolation`, logging it as an error.
///
/// Under the `strict` feature this panics so misuse is caught loudly in
/// development builds.
pub(crate) fn contract_violation(msg: impl Into<String>) -> Error {
    let msg = msg.into();
    tracing::error!(%msg, "contract violation");

    #[cfg(feature = "strict")]
    panic!("vmem contract violation: {msg}");

    #[cfg(not(feature = "strict"))]
    Error::ContractViolation(msg)
}
