//! The `ByteBuf` container and its storage cell.

use std::cell::UnsafeCell;
use std::fmt;
use std::mem;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use strand_common::{RefCount, RefCountError, RefCounted, Recycler, Released};

use crate::alloc::calculate_new_capacity;
use crate::error::BufError;

/// Shared backing storage for one buffer and all of its views.
///
/// # Safety
///
/// The byte vector lives in an `UnsafeCell` because views created by
/// `slice`/`duplicate` share it while each carrying their own cursors. The
/// framework's concurrency model is what makes this sound:
///
/// - The logical reference count guards *lifetime*: the vector is taken out
///   exactly once, on the transition to zero, which `RefCount` serializes.
/// - Mutation is confined to a single owner at a time. Buffers flowing
///   through a pipeline are only ever touched on the endpoint's executor
///   thread; handing a buffer to another owner is a transfer, not a share.
/// - `capacity` is mirrored in an atomic so dead or foreign views can
///   answer size queries without touching the cell.
pub(crate) struct Storage {
    refs: RefCount,
    data: UnsafeCell<Vec<u8>>,
    len: AtomicUsize,
    pool: Option<Recycler<Vec<u8>>>,
}

unsafe impl Send for Storage {}
unsafe impl Sync for Storage {}

impl Storage {
    fn new(data: Vec<u8>, pool: Option<Recycler<Vec<u8>>>) -> Self {
        Self {
            refs: RefCount::new(),
            len: AtomicUsize::new(data.len()),
            data: UnsafeCell::new(data),
            pool,
        }
    }

    fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    /// Runs the deallocation hook. Called exactly once, by the releaser that
    /// observed the zero transition.
    fn deallocate(&self) {
        // Safety: `RefCount` reports `Released::Final` to exactly one
        // caller, and a zero count means no live owner can access the cell
        // anymore.
        let data = unsafe { mem::take(&mut *self.data.get()) };
        self.len.store(0, Ordering::Release);
        if let Some(pool) = &self.pool {
            let mut storage = data;
            storage.clear();
            pool.recycle(storage);
        }
    }
}

/// A resizable byte container with independent read/write cursors.
///
/// Created by an [`Allocator`](crate::Allocator) or derived from another
/// buffer via [`slice`](ByteBuf::slice) / [`duplicate`](ByteBuf::duplicate).
/// Lifetime is governed by the shared reference count: the storage is handed
/// back exactly once, when the count reaches zero, and every access after
/// that fails with [`BufError::Released`].
pub struct ByteBuf {
    storage: Arc<Storage>,
    /// Window start within the storage; non-zero for slices.
    offset: usize,
    /// Fixed window length for slices; `None` tracks the full storage.
    window: Option<usize>,
    reader: usize,
    writer: usize,
    max_capacity: usize,
}

impl ByteBuf {
    pub(crate) fn with_storage(
        data: Vec<u8>,
        max_capacity: usize,
        pool: Option<Recycler<Vec<u8>>>,
    ) -> Self {
        Self {
            storage: Arc::new(Storage::new(data, pool)),
            offset: 0,
            window: None,
            reader: 0,
            writer: 0,
            max_capacity,
        }
    }

    fn ensure_accessible(&self) -> Result<(), BufError> {
        if self.storage.refs.get() == 0 {
            return Err(BufError::Released);
        }
        Ok(())
    }

    /// Bytes this view can address.
    pub fn capacity(&self) -> usize {
        self.window.unwrap_or_else(|| self.storage.len())
    }

    /// The capacity this buffer may grow to.
    pub fn max_capacity(&self) -> usize {
        self.max_capacity
    }

    /// Current reader cursor.
    pub fn reader_index(&self) -> usize {
        self.reader
    }

    /// Current writer cursor.
    pub fn writer_index(&self) -> usize {
        self.writer
    }

    /// Bytes between the reader and writer cursors.
    pub fn readable_bytes(&self) -> usize {
        self.writer - self.reader
    }

    /// Bytes between the writer cursor and the current capacity.
    pub fn writable_bytes(&self) -> usize {
        self.capacity() - self.writer
    }

    /// Whether any readable bytes remain.
    pub fn is_readable(&self) -> bool {
        self.reader < self.writer
    }

    /// Moves the reader cursor. Fails when it would pass the writer cursor.
    pub fn set_reader_index(&mut self, index: usize) -> Result<(), BufError> {
        if index > self.writer {
            return Err(BufError::OutOfWindow {
                needed: index,
                available: self.writer,
            });
        }
        self.reader = index;
        Ok(())
    }

    /// Moves the writer cursor. Fails when it leaves `reader..=capacity`.
    pub fn set_writer_index(&mut self, index: usize) -> Result<(), BufError> {
        if index < self.reader || index > self.capacity() {
            return Err(BufError::OutOfWindow {
                needed: index,
                available: self.capacity(),
            });
        }
        self.writer = index;
        Ok(())
    }

    /// Resets both cursors to zero. The contents are left as-is.
    pub fn clear(&mut self) {
        self.reader = 0;
        self.writer = 0;
    }

    fn data(&self) -> &[u8] {
        // Safety: caller checked accessibility; see `Storage` for the
        // single-owner mutation invariant that keeps shared reads sound.
        unsafe { &*self.storage.data.get() }
    }

    #[allow(clippy::mut_from_ref)]
    fn data_mut(&self) -> &mut Vec<u8> {
        // Safety: as above; mutation happens under a single owner.
        unsafe { &mut *self.storage.data.get() }
    }

    /// The readable region as a slice.
    pub fn readable(&self) -> Result<&[u8], BufError> {
        self.ensure_accessible()?;
        let start = self.offset + self.reader;
        let end = self.offset + self.writer;
        Ok(&self.data()[start..end])
    }

    fn check_readable(&self, width: usize) -> Result<(), BufError> {
        self.ensure_accessible()?;
        let available = self.readable_bytes();
        if width > available {
            return Err(BufError::OutOfWindow {
                needed: width,
                available,
            });
        }
        Ok(())
    }

    /// Grows the buffer so at least `n` more bytes are writable.
    ///
    /// Below the page threshold capacity doubles from a floor of 64 until
    /// the requirement is covered; at or above it, capacity grows in whole
    /// page-threshold increments. The result is clamped to the max capacity
    /// and exceeding it fails. Slices have a fixed window and never grow.
    pub fn ensure_writable(&mut self, n: usize) -> Result<(), BufError> {
        self.ensure_accessible()?;
        let needed = self
            .writer
            .checked_add(n)
            .ok_or(BufError::MaxCapacity {
                needed: usize::MAX,
                max: self.max_capacity,
            })?;
        if needed <= self.capacity() {
            return Ok(());
        }
        if self.window.is_some() || needed > self.max_capacity {
            return Err(BufError::MaxCapacity {
                needed,
                max: self.max_capacity,
            });
        }
        let new_capacity = calculate_new_capacity(needed, self.max_capacity)?;
        self.data_mut().resize(new_capacity, 0);
        self.storage.len.store(new_capacity, Ordering::Release);
        Ok(())
    }

    /// Writes raw bytes, growing as needed.
    pub fn write_bytes(&mut self, src: &[u8]) -> Result<(), BufError> {
        self.ensure_writable(src.len())?;
        let start = self.offset + self.writer;
        self.data_mut()[start..start + src.len()].copy_from_slice(src);
        self.writer += src.len();
        Ok(())
    }

    /// Writes one byte.
    pub fn write_u8(&mut self, value: u8) -> Result<(), BufError> {
        self.write_bytes(&[value])
    }

    /// Writes a big-endian `u16`.
    pub fn write_u16(&mut self, value: u16) -> Result<(), BufError> {
        self.write_bytes(&value.to_be_bytes())
    }

    /// Writes a big-endian `u32`.
    pub fn write_u32(&mut self, value: u32) -> Result<(), BufError> {
        self.write_bytes(&value.to_be_bytes())
    }

    /// Writes a big-endian `u64`.
    pub fn write_u64(&mut self, value: u64) -> Result<(), BufError> {
        self.write_bytes(&value.to_be_bytes())
    }

    /// Writes a big-endian `i32`.
    pub fn write_i32(&mut self, value: i32) -> Result<(), BufError> {
        self.write_bytes(&value.to_be_bytes())
    }

    /// Copies the read bytes out of the window so their space is writable
    /// again. Only meaningful on full views; a no-op when nothing was read.
    pub fn discard_read_bytes(&mut self) -> Result<(), BufError> {
        self.ensure_accessible()?;
        if self.reader == 0 || self.window.is_some() {
            return Ok(());
        }
        let readable = self.readable_bytes();
        self.data_mut().copy_within(
            self.offset + self.reader..self.offset + self.writer,
            self.offset,
        );
        self.reader = 0;
        self.writer = readable;
        Ok(())
    }

    /// A fixed sub-window view sharing this buffer's storage and count.
    ///
    /// The slice starts fully readable and cannot grow. It shares the
    /// reference count without incrementing it; use
    /// [`retained_slice`](ByteBuf::retained_slice) when the view must
    /// outlive this handle's release.
    pub fn slice(&self, at: usize, len: usize) -> Result<ByteBuf, BufError> {
        self.ensure_accessible()?;
        let end = at.checked_add(len).unwrap_or(usize::MAX);
        if end > self.capacity() {
            return Err(BufError::OutOfWindow {
                needed: end,
                available: self.capacity(),
            });
        }
        Ok(ByteBuf {
            storage: Arc::clone(&self.storage),
            offset: self.offset + at,
            window: Some(len),
            reader: 0,
            writer: len,
            max_capacity: len,
        })
    }

    /// An independently advanced full view sharing storage and count.
    pub fn duplicate(&self) -> Result<ByteBuf, BufError> {
        self.ensure_accessible()?;
        Ok(ByteBuf {
            storage: Arc::clone(&self.storage),
            offset: self.offset,
            window: self.window,
            reader: self.reader,
            writer: self.writer,
            max_capacity: self.max_capacity,
        })
    }

    /// Like [`slice`](ByteBuf::slice), but also retains the shared count.
    /// The returned view must be released independently.
    pub fn retained_slice(&self, at: usize, len: usize) -> Result<ByteBuf, BufError> {
        let view = self.slice(at, len)?;
        self.retain()?;
        Ok(view)
    }

    /// Like [`duplicate`](ByteBuf::duplicate), but also retains the shared
    /// count. The returned view must be released independently.
    pub fn retained_duplicate(&self) -> Result<ByteBuf, BufError> {
        let view = self.duplicate()?;
        self.retain()?;
        Ok(view)
    }
}

/// Read-side access shared by [`ByteBuf`] and
/// [`CompositeBuf`](crate::CompositeBuf).
///
/// Frame decoders are written against this trait so a cumulation buffer can
/// be either a merged contiguous buffer or a composite without the decoder
/// noticing.
pub trait ReadableBuf {
    /// Bytes between the reader and writer cursors.
    fn readable_bytes(&self) -> usize;

    /// Reads the byte `ahead` positions past the reader cursor without
    /// consuming anything.
    fn peek_u8(&self, ahead: usize) -> Result<u8, BufError>;

    /// Reads one byte.
    fn read_u8(&mut self) -> Result<u8, BufError>;

    /// Reads `len` bytes into a fresh vector.
    fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>, BufError>;

    /// Advances the reader cursor by `n` without looking at the bytes.
    fn skip_bytes(&mut self, n: usize) -> Result<(), BufError>;

    /// Reads a big-endian `u16`.
    fn read_u16(&mut self) -> Result<u16, BufError> {
        let high = self.read_u8()?;
        let low = self.read_u8()?;
        Ok(u16::from_be_bytes([high, low]))
    }

    /// Reads a big-endian `u32`.
    fn read_u32(&mut self) -> Result<u32, BufError> {
        let bytes = self.read_bytes(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Reads a big-endian `u64`.
    fn read_u64(&mut self) -> Result<u64, BufError> {
        let bytes = self.read_bytes(8)?;
        let mut wide = [0u8; 8];
        wide.copy_from_slice(&bytes);
        Ok(u64::from_be_bytes(wide))
    }
}

impl ReadableBuf for ByteBuf {
    fn readable_bytes(&self) -> usize {
        ByteBuf::readable_bytes(self)
    }

    fn peek_u8(&self, ahead: usize) -> Result<u8, BufError> {
        self.check_readable(ahead + 1)?;
        Ok(self.data()[self.offset + self.reader + ahead])
    }

    fn read_u8(&mut self) -> Result<u8, BufError> {
        self.check_readable(1)?;
        let value = self.data()[self.offset + self.reader];
        self.reader += 1;
        Ok(value)
    }

    fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>, BufError> {
        self.check_readable(len)?;
        let start = self.offset + self.reader;
        let out = self.data()[start..start + len].to_vec();
        self.reader += len;
        Ok(out)
    }

    fn skip_bytes(&mut self, n: usize) -> Result<(), BufError> {
        self.check_readable(n)?;
        self.reader += n;
        Ok(())
    }
}

impl RefCounted for ByteBuf {
    fn ref_count(&self) -> usize {
        self.storage.refs.get()
    }

    fn retain_many(&self, n: usize) -> Result<(), RefCountError> {
        self.storage.refs.try_retain(n)
    }

    fn release_many(&self, n: usize) -> Result<Released, RefCountError> {
        let released = self.storage.refs.try_release(n)?;
        if released == Released::Final {
            self.storage.deallocate();
        }
        Ok(released)
    }
}

impl fmt::Debug for ByteBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteBuf")
            .field("reader", &self.reader)
            .field("writer", &self.writer)
            .field("capacity", &self.capacity())
            .field("max_capacity", &self.max_capacity)
            .field("refs", &self.ref_count())
            .finish()
    }
}
