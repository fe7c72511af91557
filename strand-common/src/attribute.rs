//! Typed per-endpoint attributes.
//!
//! An [`AttributeMap`] hangs off every endpoint and maps interned
//! [`AttributeKey`]s to shared value holders. The map tolerates
//! unsynchronized access from arbitrary threads; the first access to an
//! unset key lazily creates a holder containing `None`.

use std::any::Any;
use std::marker::PhantomData;
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use parking_lot::RwLock;

use crate::constant::{Constant, ConstantPool};

fn key_pool() -> &'static ConstantPool {
    static POOL: OnceLock<ConstantPool> = OnceLock::new();
    POOL.get_or_init(ConstantPool::new)
}

/// A typed key into an [`AttributeMap`], backed by a process-wide constant.
///
/// Name uniqueness within the pool is the caller's responsibility: using the
/// same name with two different value types is a programming error and
/// panics at the map, just like any other type confusion at a dynamic seam.
#[derive(Debug)]
pub struct AttributeKey<T> {
    constant: Constant,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for AttributeKey<T> {
    fn clone(&self) -> Self {
        Self {
            constant: self.constant.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T: Send + 'static> AttributeKey<T> {
    /// Returns the key interned under `name`, creating it on first use.
    pub fn value_of(name: &str) -> Self {
        Self {
            constant: key_pool().value_of(name),
            _marker: PhantomData,
        }
    }

    /// The underlying interned constant.
    pub fn constant(&self) -> &Constant {
        &self.constant
    }

    /// The key's name.
    pub fn name(&self) -> &str {
        self.constant.name()
    }
}

/// A shared, concurrently accessible value holder for one attribute.
///
/// All holders obtained for the same key on the same map observe the same
/// slot.
#[derive(Debug)]
pub struct Attribute<T> {
    slot: Arc<RwLock<Option<T>>>,
}

impl<T> Clone for Attribute<T> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<T: Clone + Send + 'static> Attribute<T> {
    fn empty() -> Self {
        Self {
            slot: Arc::new(RwLock::new(None)),
        }
    }

    /// Returns a clone of the current value, if any.
    pub fn get(&self) -> Option<T> {
        self.slot.read().clone()
    }

    /// Stores `value`, replacing any previous one.
    pub fn set(&self, value: T) {
        *self.slot.write() = Some(value);
    }

    /// Removes and returns the current value.
    pub fn take(&self) -> Option<T> {
        self.slot.write().take()
    }

    /// Returns the current value, initializing the slot with `init` when it
    /// is still unset.
    pub fn get_or_insert_with(&self, init: impl FnOnce() -> T) -> T {
        if let Some(existing) = self.slot.read().clone() {
            return existing;
        }
        let mut slot = self.slot.write();
        slot.get_or_insert_with(init).clone()
    }
}

/// A per-endpoint map from interned keys to attribute holders.
#[derive(Debug, Default)]
pub struct AttributeMap {
    // Keyed by constant id; values are type-erased `Attribute<T>` holders.
    values: DashMap<usize, Box<dyn Any + Send + Sync>>,
}

impl AttributeMap {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the holder for `key`, lazily creating an empty one on first
    /// access.
    ///
    /// # Panics
    ///
    /// Panics when `key`'s name was previously used with a different value
    /// type on this map.
    pub fn attr<T: Clone + Send + Sync + 'static>(&self, key: &AttributeKey<T>) -> Attribute<T> {
        let entry = self
            .values
            .entry(key.constant().id())
            .or_insert_with(|| Box::new(Attribute::<T>::empty()));
        entry
            .downcast_ref::<Attribute<T>>()
            .unwrap_or_else(|| {
                panic!(
                    "attribute key {} used with conflicting value types",
                    key.name()
                )
            })
            .clone()
    }

    /// Returns whether a holder exists for `key` (set or not).
    pub fn has_attr<T: Clone + Send + Sync + 'static>(&self, key: &AttributeKey<T>) -> bool {
        self.values.contains_key(&key.constant().id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn first_access_creates_empty_holder() {
        let map = AttributeMap::new();
        let key = AttributeKey::<String>::value_of("test.first-access");
        assert!(!map.has_attr(&key));
        let attr = map.attr(&key);
        assert!(map.has_attr(&key));
        assert_eq!(attr.get(), None);
    }

    #[test]
    fn holders_share_one_slot() {
        let map = AttributeMap::new();
        let key = AttributeKey::<u32>::value_of("test.shared-slot");
        let a = map.attr(&key);
        let b = map.attr(&key);
        a.set(7);
        assert_eq!(b.get(), Some(7));
        assert_eq!(b.take(), Some(7));
        assert_eq!(a.get(), None);
    }

    #[test]
    fn get_or_insert_with_initializes_once() {
        let map = AttributeMap::new();
        let key = AttributeKey::<u32>::value_of("test.init-once");
        assert_eq!(map.attr(&key).get_or_insert_with(|| 3), 3);
        assert_eq!(map.attr(&key).get_or_insert_with(|| 9), 3);
    }

    #[test]
    fn concurrent_access_from_arbitrary_threads() {
        let map = std::sync::Arc::new(AttributeMap::new());
        let key = AttributeKey::<u64>::value_of("test.concurrent");
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let map = map.clone();
                let key = key.clone();
                thread::spawn(move || {
                    for _ in 0..100 {
                        map.attr(&key).set(1);
                        let _ = map.attr(&key).get();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(map.attr(&key).get(), Some(1));
    }
}
