//! # Strand Buf - Reference-Counted Byte Buffers
//!
//! `strand-buf` provides the byte storage layer of the strand framework:
//! indexed, growable buffers with independent read/write cursors, explicit
//! reference counting with deterministic release, and pooled allocation so
//! steady-state I/O does not allocate per event.
//!
//! ## Core Types
//!
//! - [`ByteBuf`]: a resizable byte container with a reader and a writer
//!   cursor. Views created with [`ByteBuf::slice`] and
//!   [`ByteBuf::duplicate`] share the backing storage; the `retained_`
//!   variants additionally take their own reference on it.
//! - [`CompositeBuf`]: a virtual buffer over component `ByteBuf`s,
//!   preserving per-component ownership while reading transparently across
//!   component boundaries.
//! - [`Allocator`]: the factory trait consumed by codecs and transports;
//!   [`Unpooled`] allocates from the heap, [`PooledAllocator`] recycles
//!   storage through per-thread arenas.
//!
//! ## Cursor Model
//!
//! ```text
//!      +-------------------+------------------+------------------+
//!      | discardable bytes |  readable bytes  |  writable bytes  |
//!      +-------------------+------------------+------------------+
//!      |                   |                  |                  |
//!      0      <=      readerIndex   <=   writerIndex    <=    capacity
//! ```
//!
//! Every read advances the reader cursor by the width of the value, every
//! write advances the writer cursor. Crossing the valid window is an error,
//! never undefined behavior and never silent truncation.
//!
//! ## Ownership
//!
//! A buffer is held by whoever holds a live reference and is destroyed
//! exactly once, when the count reaches zero. The count guards *lifetime*,
//! not mutual exclusion: two owners must not mutate one buffer concurrently.
//! In practice pipeline single-threading provides that exclusion.
//!
//! ## Example
//!
//! ```rust
//! use strand_buf::{Allocator, ReadableBuf, Unpooled};
//! use strand_common::RefCounted;
//!
//! let alloc = Unpooled;
//! let mut buf = alloc.buffer_with(16).unwrap();
//! buf.write_u16(0x6869).unwrap();
//! assert_eq!(buf.readable_bytes(), 2);
//! assert_eq!(buf.read_u8().unwrap(), b'h');
//! assert_eq!(buf.read_u8().unwrap(), b'i');
//! buf.release().unwrap();
//! ```

#![warn(rust_2018_idioms)]
#![warn(missing_docs)]

mod alloc;
mod byte_buf;
mod composite;
mod error;

pub use alloc::{
    Allocator, PooledAllocator, Unpooled, DEFAULT_INITIAL_CAPACITY, DEFAULT_MAX_CAPACITY,
    GROWTH_FLOOR, PAGE_THRESHOLD, calculate_new_capacity,
};
pub use byte_buf::{ByteBuf, ReadableBuf};
pub use composite::CompositeBuf;
pub use error::BufError;
