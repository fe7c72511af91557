use strand_common::RefCountError;
use thiserror::Error;

/// Errors produced by buffer and allocator operations.
///
/// Capacity and range violations are synchronous and never retried by the
/// framework; reference-count misuse indicates a lifetime bug in the caller.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BufError {
    /// An allocation was requested with `initial > max`.
    #[error("range error: initial capacity {initial} exceeds max capacity {max}")]
    Range {
        /// Requested initial capacity.
        initial: usize,
        /// Requested max capacity.
        max: usize,
    },

    /// An access would cross the valid window of the buffer.
    #[error("access out of window: need {needed} bytes, {available} available")]
    OutOfWindow {
        /// Bytes the operation needed.
        needed: usize,
        /// Bytes actually available in the window.
        available: usize,
    },

    /// A write would grow the buffer past its max capacity.
    #[error("cannot grow to {needed}: max capacity is {max}")]
    MaxCapacity {
        /// Total capacity the operation required.
        needed: usize,
        /// The buffer's max capacity.
        max: usize,
    },

    /// The buffer was accessed after its reference count reached zero.
    #[error("buffer was already released")]
    Released,

    /// A retain/release call violated the counting contract.
    #[error(transparent)]
    RefCount(#[from] RefCountError),

    /// A composite buffer reached its component limit.
    #[error("composite component limit {limit} reached")]
    TooManyComponents {
        /// The configured component limit.
        limit: usize,
    },
}
