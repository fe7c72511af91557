//! Explicit reference counting.
//!
//! A [`RefCount`] starts at one and is adjusted with `retain`/`release`.
//! The transition to zero is reported exactly once as [`Released::Final`];
//! the owner of the count runs its deallocation hook on that signal and on
//! no other. Misuse is surfaced synchronously: retaining an object whose
//! count already reached zero, or releasing more than is held, is a lifetime
//! bug in the caller and is never papered over.

use std::sync::atomic::{AtomicUsize, Ordering, fence};

use log::warn;
use thiserror::Error;

/// Errors produced by retain/release operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RefCountError {
    /// `retain` was called after the count reached zero. Objects are not
    /// resurrected; this means the caller kept a handle past its release.
    #[error("retain on an object whose reference count already reached zero")]
    Resurrected,

    /// The count would overflow `usize`.
    #[error("reference count overflow")]
    Overflow,

    /// `release` asked for more references than are currently held.
    #[error("release of {requested} exceeds current reference count {current}")]
    Underflow {
        /// How many references the caller tried to release.
        requested: usize,
        /// The count observed at the time of the failure.
        current: usize,
    },
}

/// Result of a successful release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Released {
    /// The count is still positive; other owners remain.
    Shared,
    /// The count reached exactly zero. The deallocation hook must run now,
    /// and must run exactly once.
    Final,
}

/// An atomic reference count starting at one.
#[derive(Debug)]
pub struct RefCount(AtomicUsize);

impl Default for RefCount {
    fn default() -> Self {
        Self::new()
    }
}

impl RefCount {
    /// Creates a count holding a single reference.
    pub fn new() -> Self {
        Self(AtomicUsize::new(1))
    }

    /// Returns the current count.
    pub fn get(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }

    /// Adds `n` references.
    ///
    /// Fails with [`RefCountError::Resurrected`] when the count is already
    /// zero and with [`RefCountError::Overflow`] when the addition would
    /// wrap. `n` must be positive.
    pub fn try_retain(&self, n: usize) -> Result<(), RefCountError> {
        debug_assert!(n > 0, "retain of zero references");
        let mut current = self.0.load(Ordering::Relaxed);
        loop {
            if current == 0 {
                return Err(RefCountError::Resurrected);
            }
            let next = current.checked_add(n).ok_or(RefCountError::Overflow)?;
            match self
                .0
                .compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return Ok(()),
                Err(observed) => current = observed,
            }
        }
    }

    /// Removes `n` references.
    ///
    /// Returns [`Released::Final`] on the transition to exactly zero and
    /// [`Released::Shared`] otherwise. Fails with
    /// [`RefCountError::Underflow`] when `n` exceeds the current count.
    /// `n` must be positive.
    pub fn try_release(&self, n: usize) -> Result<Released, RefCountError> {
        debug_assert!(n > 0, "release of zero references");
        let mut current = self.0.load(Ordering::Relaxed);
        loop {
            if n > current {
                return Err(RefCountError::Underflow {
                    requested: n,
                    current,
                });
            }
            let next = current - n;
            match self
                .0
                .compare_exchange_weak(current, next, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => {
                    if next == 0 {
                        // Pair with the Release above so the deallocating
                        // thread observes all writes made under earlier
                        // references.
                        fence(Ordering::Acquire);
                        return Ok(Released::Final);
                    }
                    return Ok(Released::Shared);
                }
                Err(observed) => current = observed,
            }
        }
    }
}

/// An object whose lifetime is governed by an explicit reference count.
pub trait RefCounted {
    /// Returns the current reference count.
    fn ref_count(&self) -> usize;

    /// Adds one reference.
    fn retain(&self) -> Result<(), RefCountError> {
        self.retain_many(1)
    }

    /// Adds `n` references.
    fn retain_many(&self, n: usize) -> Result<(), RefCountError>;

    /// Removes one reference, deallocating on the transition to zero.
    fn release(&self) -> Result<Released, RefCountError> {
        self.release_many(1)
    }

    /// Removes `n` references, deallocating on the transition to zero.
    fn release_many(&self, n: usize) -> Result<Released, RefCountError>;

    /// Best-effort release for cleanup paths.
    ///
    /// A failure here must not mask the error that put the caller on the
    /// cleanup path in the first place, so it is logged and swallowed.
    fn release_quiet(&self) {
        if let Err(err) = self.release() {
            warn!("swallowed release failure during cleanup: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_at_one() {
        let count = RefCount::new();
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn final_release_reported_once() {
        let count = RefCount::new();
        count.try_retain(2).unwrap();
        assert_eq!(count.try_release(1).unwrap(), Released::Shared);
        assert_eq!(count.try_release(1).unwrap(), Released::Shared);
        assert_eq!(count.try_release(1).unwrap(), Released::Final);
    }

    #[test]
    fn no_resurrection() {
        let count = RefCount::new();
        assert_eq!(count.try_release(1).unwrap(), Released::Final);
        assert_eq!(count.try_retain(1), Err(RefCountError::Resurrected));
    }

    #[test]
    fn underflow_rejected() {
        let count = RefCount::new();
        assert_eq!(
            count.try_release(2),
            Err(RefCountError::Underflow {
                requested: 2,
                current: 1
            })
        );
        // The failed release must not have consumed anything.
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn dealloc_exactly_when_releases_match_retains() {
        // For a fresh object, deallocation happens precisely when cumulative
        // releases equal 1 + cumulative retains.
        let count = RefCount::new();
        let retains = 7;
        for _ in 0..retains {
            count.try_retain(1).unwrap();
        }
        for _ in 0..retains {
            assert_eq!(count.try_release(1).unwrap(), Released::Shared);
        }
        assert_eq!(count.try_release(1).unwrap(), Released::Final);
        assert_eq!(
            count.try_release(1),
            Err(RefCountError::Underflow {
                requested: 1,
                current: 0,
            })
        );
    }

    #[test]
    fn bulk_retain_release() {
        let count = RefCount::new();
        count.try_retain(9).unwrap();
        assert_eq!(count.try_release(10).unwrap(), Released::Final);
    }
}
