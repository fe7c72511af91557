//! # Strand Common - Shared Primitives for the Strand Framework
//!
//! `strand-common` holds the small, widely shared building blocks that the
//! rest of the strand ecosystem is layered on:
//!
//! - [`RefCount`] / [`RefCounted`]: explicit reference counting with
//!   deterministic, exactly-once deallocation. Buffers handed between
//!   pipeline handlers are retained and released through this interface.
//! - [`Constant`] / [`ConstantPool`]: process-wide interned keys. A constant
//!   is created once per name and compares by identity for its whole life.
//! - [`AttributeKey`] / [`AttributeMap`]: typed per-endpoint attributes over
//!   interned keys, safe for unsynchronized access from arbitrary threads.
//! - [`Completion`]: a one-shot completion handle used for scheduled tasks
//!   and outbound pipeline writes.
//! - [`Recycler`]: per-thread object arenas with a bounded cross-thread
//!   return queue, so hot paths do not allocate per event.
//!
//! ## Ownership Model
//!
//! Reference counts guard *lifetime*, not mutual exclusion. A buffer with a
//! count of two may still only be mutated by one owner at a time; the
//! pipeline's single-threaded execution is what provides that exclusion.
//! The count only decides when the storage is handed back.
//!
//! ## Example
//!
//! ```rust
//! use strand_common::{AttributeKey, AttributeMap};
//!
//! let map = AttributeMap::new();
//! let key = AttributeKey::<u64>::value_of("connection.id");
//!
//! // First access lazily creates an empty holder.
//! let attr = map.attr(&key);
//! assert_eq!(attr.get(), None);
//!
//! attr.set(42);
//! assert_eq!(map.attr(&key).get(), Some(42));
//! ```

#![warn(rust_2018_idioms)]
#![warn(missing_docs)]

/// Typed per-endpoint attributes over interned keys
pub mod attribute;

/// One-shot completion handles
pub mod completion;

/// Process-wide interned constants
pub mod constant;

/// Explicit reference counting with deterministic deallocation
pub mod refcount;

/// Per-thread object pooling with cross-thread returns
pub mod recycler;

pub use attribute::{Attribute, AttributeKey, AttributeMap};
pub use completion::{Completion, Outcome};
pub use constant::{Constant, ConstantPool};
pub use refcount::{RefCount, RefCountError, RefCounted, Released};
pub use recycler::{Recycled, Recycler};
