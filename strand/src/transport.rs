//! The transport boundary.
//!
//! The core fixes no physical transport. Socket and TLS bindings live
//! outside and plug in through [`Transport`]: the head sentinel calls into
//! it for the actual I/O operation of every outbound event, and the tail
//! sentinel uses it to request more data when a read went unhandled.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;
use strand_buf::ByteBuf;

/// A byte-stream binding for one endpoint.
///
/// Implementations are only ever called on the endpoint's bound executor,
/// in fire order.
pub trait Transport: Send + 'static {
    /// Writes an outbound buffer. Ownership of the buffer transfers here;
    /// the transport releases it once the bytes are handed off.
    fn write(&mut self, buf: ByteBuf) -> io::Result<()>;

    /// Flushes previously written bytes towards the peer.
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// Asks the transport to produce more inbound data when it can.
    fn request_read(&mut self) {}

    /// Closes the underlying stream.
    fn close(&mut self) -> io::Result<()>;

    /// A short name for log context, typically the peer address.
    fn endpoint_name(&self) -> String {
        String::from("unbound")
    }
}

/// A transport that discards everything. The default until a real binding
/// is attached.
#[derive(Debug, Default)]
pub struct NullTransport;

impl Transport for NullTransport {
    fn write(&mut self, buf: ByteBuf) -> io::Result<()> {
        use strand_common::RefCounted;
        buf.release_quiet();
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    written: Mutex<Vec<u8>>,
    flushes: AtomicUsize,
    read_requests: AtomicUsize,
    closed: AtomicBool,
}

/// An in-memory transport capturing everything the pipeline emits.
///
/// Clones share state, so a test can keep one handle while the pipeline
/// owns the other - the embedded-endpoint pattern for exercising handlers
/// without real I/O.
#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    state: Arc<MemoryState>,
}

impl MemoryTransport {
    /// Creates an empty capture transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// All bytes written so far.
    pub fn written(&self) -> Vec<u8> {
        self.state.written.lock().clone()
    }

    /// Number of flushes performed.
    pub fn flushes(&self) -> usize {
        self.state.flushes.load(Ordering::Acquire)
    }

    /// Number of times more inbound data was requested.
    pub fn read_requests(&self) -> usize {
        self.state.read_requests.load(Ordering::Acquire)
    }

    /// Whether the transport was closed.
    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::Acquire)
    }
}

impl Transport for MemoryTransport {
    fn write(&mut self, mut buf: ByteBuf) -> io::Result<()> {
        use strand_buf::ReadableBuf;
        use strand_common::RefCounted;
        let readable = buf.readable_bytes();
        if let Ok(bytes) = buf.read_bytes(readable) {
            self.state.written.lock().extend_from_slice(&bytes);
        }
        buf.release_quiet();
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.state.flushes.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn request_read(&mut self) {
        self.state.read_requests.fetch_add(1, Ordering::AcqRel);
    }

    fn close(&mut self) -> io::Result<()> {
        self.state.closed.store(true, Ordering::Release);
        Ok(())
    }

    fn endpoint_name(&self) -> String {
        String::from("memory")
    }
}
