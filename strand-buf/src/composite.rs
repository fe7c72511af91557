//! Composite buffers: a virtual buffer over component buffers.

use std::fmt;

use strand_common::{RefCount, RefCountError, RefCounted, Released};

use crate::byte_buf::{ByteBuf, ReadableBuf};
use crate::error::BufError;

struct Component {
    buf: ByteBuf,
    /// Absolute index of the component's first byte within the composite.
    offset: usize,
    len: usize,
}

/// A buffer aggregating component [`ByteBuf`]s without copying them.
///
/// Each component keeps its own ownership: the composite holds one
/// reference per component and releasing the composite releases every
/// component exactly once. Reading is transparent across component
/// boundaries; the bytes come out exactly as they would from an equivalent
/// flattened buffer.
pub struct CompositeBuf {
    refs: RefCount,
    components: Vec<Component>,
    max_components: usize,
    reader: usize,
    writer: usize,
}

impl CompositeBuf {
    pub(crate) fn new(max_components: usize) -> Self {
        Self {
            refs: RefCount::new(),
            components: Vec::new(),
            max_components,
            reader: 0,
            writer: 0,
        }
    }

    fn ensure_accessible(&self) -> Result<(), BufError> {
        if self.refs.get() == 0 {
            return Err(BufError::Released);
        }
        Ok(())
    }

    /// Appends `buf`'s readable region as the last component, taking
    /// ownership of the buffer and advancing the writer index by its
    /// readable length.
    pub fn add_component(&mut self, buf: ByteBuf) -> Result<(), BufError> {
        if let Err(err) = self.ensure_accessible() {
            buf.release_quiet();
            return Err(err);
        }
        if self.components.len() >= self.max_components {
            // Do not leak the rejected component.
            buf.release_quiet();
            return Err(BufError::TooManyComponents {
                limit: self.max_components,
            });
        }
        let len = buf.readable_bytes();
        self.components.push(Component {
            buf,
            offset: self.writer,
            len,
        });
        self.writer += len;
        Ok(())
    }

    /// Removes and releases the component at `index`, pulling the writer
    /// index (and the offsets of later components) back by its length.
    pub fn remove_component(&mut self, index: usize) -> Result<(), BufError> {
        self.ensure_accessible()?;
        if index >= self.components.len() {
            return Err(BufError::OutOfWindow {
                needed: index,
                available: self.components.len(),
            });
        }
        let removed = self.components.remove(index);
        for later in &mut self.components[index..] {
            later.offset -= removed.len;
        }
        self.writer -= removed.len;
        self.reader = self.reader.min(self.writer);
        removed.buf.release_quiet();
        Ok(())
    }

    /// Number of components currently aggregated.
    pub fn component_count(&self) -> usize {
        self.components.len()
    }

    /// Total length of all components.
    pub fn capacity(&self) -> usize {
        self.components.iter().map(|c| c.len).sum()
    }

    /// Current reader cursor.
    pub fn reader_index(&self) -> usize {
        self.reader
    }

    /// Current writer cursor.
    pub fn writer_index(&self) -> usize {
        self.writer
    }

    /// Whether any readable bytes remain.
    pub fn is_readable(&self) -> bool {
        self.reader < self.writer
    }

    /// Resolves an absolute index to its component by binary search over
    /// the cumulative offset boundaries.
    fn component_at(&self, index: usize) -> &Component {
        let position = self
            .components
            .partition_point(|c| c.offset + c.len <= index);
        &self.components[position]
    }

    fn byte_at(&self, index: usize) -> Result<u8, BufError> {
        let component = self.component_at(index);
        let bytes = component.buf.readable()?;
        Ok(bytes[index - component.offset])
    }
}

impl ReadableBuf for CompositeBuf {
    fn readable_bytes(&self) -> usize {
        self.writer - self.reader
    }

    fn peek_u8(&self, ahead: usize) -> Result<u8, BufError> {
        self.ensure_accessible()?;
        let available = self.readable_bytes();
        if ahead >= available {
            return Err(BufError::OutOfWindow {
                needed: ahead + 1,
                available,
            });
        }
        self.byte_at(self.reader + ahead)
    }

    fn read_u8(&mut self) -> Result<u8, BufError> {
        let value = self.peek_u8(0)?;
        self.reader += 1;
        Ok(value)
    }

    fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>, BufError> {
        self.ensure_accessible()?;
        let available = self.readable_bytes();
        if len > available {
            return Err(BufError::OutOfWindow {
                needed: len,
                available,
            });
        }
        let mut out = Vec::with_capacity(len);
        let mut index = self.reader;
        while out.len() < len {
            let component = self.component_at(index);
            let bytes = component.buf.readable()?;
            let start = index - component.offset;
            let take = (component.len - start).min(len - out.len());
            out.extend_from_slice(&bytes[start..start + take]);
            index += take;
        }
        self.reader = index;
        Ok(out)
    }

    fn skip_bytes(&mut self, n: usize) -> Result<(), BufError> {
        self.ensure_accessible()?;
        let available = self.readable_bytes();
        if n > available {
            return Err(BufError::OutOfWindow {
                needed: n,
                available,
            });
        }
        self.reader += n;
        Ok(())
    }
}

impl RefCounted for CompositeBuf {
    fn ref_count(&self) -> usize {
        self.refs.get()
    }

    fn retain_many(&self, n: usize) -> Result<(), RefCountError> {
        self.refs.try_retain(n)
    }

    fn release_many(&self, n: usize) -> Result<Released, RefCountError> {
        let released = self.refs.try_release(n)?;
        if released == Released::Final {
            for component in &self.components {
                component.buf.release_quiet();
            }
        }
        Ok(released)
    }
}

impl fmt::Debug for CompositeBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompositeBuf")
            .field("components", &self.components.len())
            .field("reader", &self.reader)
            .field("writer", &self.writer)
            .field("refs", &self.refs.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::{Allocator, Unpooled};

    fn buf_of(bytes: &[u8]) -> ByteBuf {
        let mut buf = Unpooled.buffer_with(bytes.len().max(1)).unwrap();
        buf.write_bytes(bytes).unwrap();
        buf
    }

    #[test]
    fn reads_match_flattened_buffer() {
        let mut composite = Unpooled.composite();
        composite.add_component(buf_of(b"hello ")).unwrap();
        composite.add_component(buf_of(b"wor")).unwrap();
        composite.add_component(buf_of(b"ld")).unwrap();

        let mut flat = buf_of(b"hello world");
        assert_eq!(composite.readable_bytes(), flat.readable_bytes());
        assert_eq!(
            composite.read_bytes(11).unwrap(),
            flat.read_bytes(11).unwrap()
        );
        composite.release().unwrap();
        flat.release().unwrap();
    }

    #[test]
    fn multi_byte_reads_cross_component_boundaries() {
        let mut composite = Unpooled.composite();
        composite.add_component(buf_of(&[0x12])).unwrap();
        composite.add_component(buf_of(&[0x34, 0x56])).unwrap();
        composite.add_component(buf_of(&[0x78])).unwrap();
        assert_eq!(composite.read_u32().unwrap(), 0x1234_5678);
        assert_eq!(composite.readable_bytes(), 0);
        composite.release().unwrap();
    }

    #[test]
    fn add_and_remove_update_writer_index() {
        let mut composite = Unpooled.composite();
        composite.add_component(buf_of(b"abc")).unwrap();
        composite.add_component(buf_of(b"de")).unwrap();
        assert_eq!(composite.writer_index(), 5);

        composite.remove_component(0).unwrap();
        assert_eq!(composite.writer_index(), 2);
        assert_eq!(composite.read_bytes(2).unwrap(), b"de");
        composite.release().unwrap();
    }

    #[test]
    fn release_releases_all_components() {
        let component = buf_of(b"xyz");
        let observer = component.retained_duplicate().unwrap();
        assert_eq!(observer.ref_count(), 2);

        let mut composite = Unpooled.composite();
        composite.add_component(component).unwrap();
        composite.release().unwrap();

        assert_eq!(observer.ref_count(), 1);
        observer.release().unwrap();
    }

    #[test]
    fn component_limit_is_enforced() {
        let mut composite = Unpooled.composite_with(1);
        composite.add_component(buf_of(b"a")).unwrap();
        assert_eq!(
            composite.add_component(buf_of(b"b")).unwrap_err(),
            BufError::TooManyComponents { limit: 1 }
        );
        composite.release().unwrap();
    }

    #[test]
    fn released_composite_rejects_access() {
        let mut composite = Unpooled.composite();
        composite.add_component(buf_of(b"a")).unwrap();
        composite.release().unwrap();
        assert_eq!(composite.read_u8(), Err(BufError::Released));
        assert_eq!(
            composite.add_component(buf_of(b"b")),
            Err(BufError::Released)
        );
    }
}
