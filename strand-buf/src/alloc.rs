//! Allocators and the capacity growth policy.

use log::trace;
use strand_common::Recycler;

use crate::byte_buf::ByteBuf;
use crate::composite::CompositeBuf;
use crate::error::BufError;

/// Capacity used by [`Allocator::buffer`].
pub const DEFAULT_INITIAL_CAPACITY: usize = 256;

/// Max capacity used when the caller does not bound a buffer.
pub const DEFAULT_MAX_CAPACITY: usize = i32::MAX as usize;

/// Below this size, capacity grows by doubling; at or above it, by whole
/// increments of it.
pub const PAGE_THRESHOLD: usize = 4 * 1024 * 1024;

/// The smallest capacity the doubling sequence starts from.
pub const GROWTH_FLOOR: usize = 64;

/// Default component limit for composite buffers.
const DEFAULT_MAX_COMPONENTS: usize = 16;

/// Computes the capacity a buffer should grow to so that `min_new` bytes
/// fit.
///
/// For `min_new` below [`PAGE_THRESHOLD`] this is the smallest value reached
/// by doubling from [`GROWTH_FLOOR`] that covers `min_new`; from the
/// threshold upward it is the smallest whole multiple of the threshold that
/// does. The result is clamped to `max`; a requirement beyond `max` fails.
/// The function is monotonic non-decreasing in `min_new`.
pub fn calculate_new_capacity(min_new: usize, max: usize) -> Result<usize, BufError> {
    if min_new > max {
        return Err(BufError::MaxCapacity {
            needed: min_new,
            max,
        });
    }
    if min_new >= PAGE_THRESHOLD {
        let pages = min_new.div_ceil(PAGE_THRESHOLD);
        let grown = pages.checked_mul(PAGE_THRESHOLD).unwrap_or(usize::MAX);
        return Ok(grown.min(max));
    }
    let mut capacity = GROWTH_FLOOR;
    while capacity < min_new {
        capacity <<= 1;
    }
    Ok(capacity.min(max))
}

/// Factory for buffers, consumed by codecs and transports needing storage.
pub trait Allocator: Send + Sync {
    /// Allocates a buffer with the default initial capacity.
    fn buffer(&self) -> ByteBuf;

    /// Allocates a buffer with `initial` capacity and the default bound.
    fn buffer_with(&self, initial: usize) -> Result<ByteBuf, BufError> {
        self.buffer_bounded(initial, DEFAULT_MAX_CAPACITY)
    }

    /// Allocates a buffer with `initial` capacity growable to `max`.
    ///
    /// `initial > max` is a range error. The buffer starts with a reference
    /// count of one and no readable bytes.
    fn buffer_bounded(&self, initial: usize, max: usize) -> Result<ByteBuf, BufError>;

    /// Creates an empty composite buffer with the default component limit.
    fn composite(&self) -> CompositeBuf {
        self.composite_with(DEFAULT_MAX_COMPONENTS)
    }

    /// Creates an empty composite buffer holding at most `max_components`.
    fn composite_with(&self, max_components: usize) -> CompositeBuf {
        CompositeBuf::new(max_components)
    }

    /// The growth policy; see [`calculate_new_capacity`].
    fn calculate_new_capacity(&self, min_new: usize, max: usize) -> Result<usize, BufError> {
        calculate_new_capacity(min_new, max)
    }
}

/// Plain heap allocation, no pooling.
#[derive(Debug, Default, Clone, Copy)]
pub struct Unpooled;

impl Allocator for Unpooled {
    fn buffer(&self) -> ByteBuf {
        ByteBuf::with_storage(
            vec![0; DEFAULT_INITIAL_CAPACITY],
            DEFAULT_MAX_CAPACITY,
            None,
        )
    }

    fn buffer_bounded(&self, initial: usize, max: usize) -> Result<ByteBuf, BufError> {
        if initial > max {
            return Err(BufError::Range { initial, max });
        }
        Ok(ByteBuf::with_storage(vec![0; initial], max, None))
    }
}

/// An allocator that recycles backing storage through per-thread arenas.
///
/// Storage is grouped into power-of-two size classes from [`GROWTH_FLOOR`]
/// up to 64 KiB; a released buffer's storage returns to the class it was
/// drawn from. Requests larger than the biggest class fall through to the
/// heap. The allocator is safe for unrelated concurrent callers; there is
/// no cross-endpoint synchronization on the hot path.
pub struct PooledAllocator {
    classes: Vec<(usize, Recycler<Vec<u8>>)>,
}

impl Default for PooledAllocator {
    fn default() -> Self {
        Self::new(64, 256)
    }
}

impl PooledAllocator {
    /// Largest pooled storage size.
    pub const MAX_POOLED_SIZE: usize = 64 * 1024;

    /// Creates a pooled allocator.
    ///
    /// `arena_capacity` bounds each thread's free-list per size class and
    /// `overflow_capacity` bounds each class's cross-thread return queue.
    pub fn new(arena_capacity: usize, overflow_capacity: usize) -> Self {
        let mut classes = Vec::new();
        let mut size = GROWTH_FLOOR;
        while size <= Self::MAX_POOLED_SIZE {
            classes.push((
                size,
                Recycler::new(arena_capacity, overflow_capacity, Vec::new),
            ));
            size <<= 1;
        }
        Self { classes }
    }

    fn class_for(&self, initial: usize) -> Option<&Recycler<Vec<u8>>> {
        self.classes
            .iter()
            .find(|(size, _)| *size >= initial)
            .map(|(_, recycler)| recycler)
    }
}

impl Allocator for PooledAllocator {
    fn buffer(&self) -> ByteBuf {
        self.buffer_bounded(DEFAULT_INITIAL_CAPACITY, DEFAULT_MAX_CAPACITY)
            .expect("default capacities are in range")
    }

    fn buffer_bounded(&self, initial: usize, max: usize) -> Result<ByteBuf, BufError> {
        if initial > max {
            return Err(BufError::Range { initial, max });
        }
        match self.class_for(initial) {
            Some(recycler) => {
                let mut storage = recycler.acquire().detach();
                storage.clear();
                storage.resize(initial, 0);
                Ok(ByteBuf::with_storage(storage, max, Some(recycler.clone())))
            }
            None => {
                trace!("allocation of {initial} bytes exceeds the largest pool class");
                Ok(ByteBuf::with_storage(vec![0; initial], max, None))
            }
        }
    }
}
