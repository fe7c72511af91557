//! Process-wide interned constants.
//!
//! A [`Constant`] is a `(numeric id, name)` pair created at most once per
//! name within its [`ConstantPool`]. The pool lives for the whole process
//! and is never torn down; equality and hashing are by id, so two constants
//! compare equal exactly when they came from the same interning call chain.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;

/// A uniquely interned `(id, name)` key.
///
/// Cloning a constant is cheap and preserves identity: all clones share the
/// same id and compare equal.
#[derive(Debug, Clone)]
pub struct Constant {
    id: usize,
    name: Arc<str>,
}

impl Constant {
    /// The pool-unique numeric id.
    pub fn id(&self) -> usize {
        self.id
    }

    /// The name the constant was interned under.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl PartialEq for Constant {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Constant {}

impl Hash for Constant {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// A concurrent name-to-identity interning table.
///
/// Insertion is atomic insert-if-absent: concurrent `value_of` calls for the
/// same name observe the same constant. Pools are expected to be `static`;
/// there is deliberately no way to remove an entry.
#[derive(Debug, Default)]
pub struct ConstantPool {
    next_id: AtomicUsize,
    constants: DashMap<String, Constant>,
}

impl ConstantPool {
    /// Creates an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the constant interned under `name`, creating it on first use.
    pub fn value_of(&self, name: &str) -> Constant {
        if let Some(existing) = self.constants.get(name) {
            return existing.clone();
        }
        self.constants
            .entry(name.to_owned())
            .or_insert_with(|| Constant {
                id: self.next_id.fetch_add(1, Ordering::Relaxed),
                name: Arc::from(name),
            })
            .clone()
    }

    /// Returns whether `name` has been interned already.
    pub fn exists(&self, name: &str) -> bool {
        self.constants.contains_key(name)
    }

    /// Number of constants interned so far.
    pub fn len(&self) -> usize {
        self.constants.len()
    }

    /// Whether the pool is still empty.
    pub fn is_empty(&self) -> bool {
        self.constants.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn interning_is_identity() {
        let pool = ConstantPool::new();
        let a = pool.value_of("alpha");
        let b = pool.value_of("alpha");
        let c = pool.value_of("beta");
        assert_eq!(a, b);
        assert_eq!(a.id(), b.id());
        assert_ne!(a, c);
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn concurrent_value_of_yields_one_instance() {
        let pool = std::sync::Arc::new(ConstantPool::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                thread::spawn(move || pool.value_of("shared").id())
            })
            .collect();
        let ids: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(ids.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(pool.len(), 1);
    }
}
