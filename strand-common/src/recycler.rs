//! Per-thread object pooling with cross-thread returns.
//!
//! A [`Recycler`] keeps a free-list per thread so the hot acquire/release
//! path touches no shared state. Objects released on a thread other than the
//! one that acquired them go through a bounded lock-free overflow queue and
//! are drained back into a local arena on a later acquire. When both the
//! arena and the queue are full the object is simply dropped; the pool is an
//! optimization, never a correctness requirement.
//!
//! Pooled objects are handed out as [`Recycled`] guards, not raw values:
//! the guard owns the value and returns it on drop, so double-free cannot
//! be expressed.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, ThreadId};

use crossbeam_queue::ArrayQueue;

static NEXT_RECYCLER_ID: AtomicU64 = AtomicU64::new(0);

thread_local! {
    // One arena slot per (thread, recycler). Values are `Vec<T>` behind
    // `dyn Any`; each recycler only ever stores its own `T` under its id.
    static ARENAS: RefCell<HashMap<u64, Box<dyn Any>>> = RefCell::new(HashMap::new());
}

struct Shared<T: Send + 'static> {
    id: u64,
    arena_capacity: usize,
    overflow: ArrayQueue<T>,
    factory: Box<dyn Fn() -> T + Send + Sync>,
}

impl<T: Send + 'static> Shared<T> {
    fn with_arena<R>(&self, f: impl FnOnce(&mut Vec<T>) -> R) -> R {
        ARENAS.with(|arenas| {
            let mut arenas = arenas.borrow_mut();
            let slot = arenas
                .entry(self.id)
                .or_insert_with(|| Box::new(Vec::<T>::new()));
            let arena = slot
                .downcast_mut::<Vec<T>>()
                .expect("recycler arena holds a foreign type");
            f(arena)
        })
    }
}

/// A pool of reusable objects with per-thread free-lists.
pub struct Recycler<T: Send + 'static> {
    shared: Arc<Shared<T>>,
}

impl<T: Send + 'static> Clone for Recycler<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Send + 'static> Recycler<T> {
    /// Creates a recycler.
    ///
    /// `arena_capacity` bounds each thread's free-list and
    /// `overflow_capacity` bounds the shared cross-thread return queue;
    /// `factory` constructs a fresh object when both are empty.
    pub fn new(
        arena_capacity: usize,
        overflow_capacity: usize,
        factory: impl Fn() -> T + Send + Sync + 'static,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                id: NEXT_RECYCLER_ID.fetch_add(1, Ordering::Relaxed),
                arena_capacity,
                overflow: ArrayQueue::new(overflow_capacity.max(1)),
                factory: Box::new(factory),
            }),
        }
    }

    /// Takes an object from the pool, constructing one when empty.
    pub fn acquire(&self) -> Recycled<T> {
        let value = self
            .shared
            .with_arena(|arena| arena.pop())
            .or_else(|| self.shared.overflow.pop())
            .unwrap_or_else(|| (self.shared.factory)());
        Recycled {
            value: Some(value),
            origin: thread::current().id(),
            shared: Arc::clone(&self.shared),
        }
    }

    /// Returns a detached object to the pool.
    ///
    /// The object lands in the calling thread's arena when there is room,
    /// spills to the overflow queue otherwise, and is dropped when both are
    /// full.
    pub fn recycle(&self, value: T) {
        let overflowed = self.shared.with_arena(|arena| {
            if arena.len() < self.shared.arena_capacity {
                arena.push(value);
                None
            } else {
                Some(value)
            }
        });
        if let Some(value) = overflowed {
            let _ = self.shared.overflow.push(value);
        }
    }

    /// Number of objects currently parked in the cross-thread return queue.
    pub fn overflow_len(&self) -> usize {
        self.shared.overflow.len()
    }
}

/// An arena handle to a pooled object; returns the object on drop.
pub struct Recycled<T: Send + 'static> {
    value: Option<T>,
    origin: ThreadId,
    shared: Arc<Shared<T>>,
}

impl<T: Send + 'static> Recycled<T> {
    /// Detaches the object from the pool; it will not be recycled.
    pub fn detach(mut self) -> T {
        self.value.take().expect("recycled object already taken")
    }
}

impl<T: Send + 'static> Deref for Recycled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.value.as_ref().expect("recycled object already taken")
    }
}

impl<T: Send + 'static> DerefMut for Recycled<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.value.as_mut().expect("recycled object already taken")
    }
}

impl<T: Send + 'static> Drop for Recycled<T> {
    fn drop(&mut self) {
        let Some(value) = self.value.take() else {
            return;
        };
        if thread::current().id() == self.origin {
            let overflowed = self.shared.with_arena(|arena| {
                if arena.len() < self.shared.arena_capacity {
                    arena.push(value);
                    None
                } else {
                    Some(value)
                }
            });
            if let Some(value) = overflowed {
                let _ = self.shared.overflow.push(value);
            }
        } else {
            // Returned by a non-owning thread: never touch the foreign
            // arena, go through the bounded queue or drop.
            let _ = self.shared.overflow.push(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn reuses_locally_released_objects() {
        let created = Arc::new(AtomicUsize::new(0));
        let counter = created.clone();
        let recycler = Recycler::new(8, 8, move || {
            counter.fetch_add(1, Ordering::Relaxed);
            Vec::<u8>::with_capacity(16)
        });

        drop(recycler.acquire());
        drop(recycler.acquire());
        assert_eq!(created.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn foreign_release_goes_through_overflow() {
        let recycler = Recycler::new(8, 8, || Vec::<u8>::new());
        let guard = recycler.acquire();

        let remote = recycler.clone();
        thread::spawn(move || drop(guard)).join().unwrap();
        assert_eq!(remote.overflow_len(), 1);

        // The next acquire on any thread drains the queue.
        let _guard = recycler.acquire();
        assert_eq!(recycler.overflow_len(), 0);
    }

    #[test]
    fn detach_removes_from_pool() {
        let created = Arc::new(AtomicUsize::new(0));
        let counter = created.clone();
        let recycler = Recycler::new(8, 8, move || {
            counter.fetch_add(1, Ordering::Relaxed);
            0u64
        });
        let value = recycler.acquire().detach();
        assert_eq!(value, 0);
        drop(recycler.acquire());
        assert_eq!(created.load(Ordering::Relaxed), 2);
    }
}
