//! # Strand - Protocol-Agnostic Channel Pipelines
//!
//! `strand` is the pipeline layer of the strand framework: it lets servers
//! and clients exchange structured messages over byte streams through an
//! ordered chain of handlers, with pooled buffer reuse underneath
//! (`strand-buf`) and strictly single-threaded execution per endpoint
//! (`strand-executor`).
//!
//! ## Core Concepts
//!
//! ### Pipeline
//!
//! A [`Pipeline`] is an ordered, mutable chain of named [`Handler`]s bound
//! to one endpoint. Inbound events flow head to tail, outbound events tail
//! to head:
//!
//! ```text
//!                                              write()
//!   +------------------------------------------+----------------+
//!   |                    Pipeline              |                |
//!   |                                         \|/               |
//!   |  tail  +----------+----------+----------+----------+      |
//!   |        |                Handler N                  |      |
//!   |        +----------+----------+----------+----------+      |
//!   |            /|\                           |                |
//!   |             |     ctx.fire_read(msg)    \|/  ctx.write_next(..)
//!   |        +----------+----------+----------+----------+      |
//!   |        |                Handler 1                  |      |
//!   |  head  +----------+----------+----------+----------+      |
//!   |            /|\                           |                |
//!   +-------------+---------------------------+----------------+
//!                 | fire_read()                | Transport::write()
//!                 |                           \|/
//!   +-------------+---------------------------+----------------+
//!   |                 Transport (external binding)              |
//!   +-----------------------------------------------------------+
//! ```
//!
//! Propagation skips handlers whose [`EventMask`] does not declare the
//! event and stops at the first handler that does not forward. The head
//! sentinel performs the actual transport operation; the tail sentinel
//! releases unhandled reads and requests more data, and answers unhandled
//! errors by logging them with endpoint context and closing the endpoint.
//!
//! ### Handler
//!
//! A [`Handler`] overrides only the events it cares about; everything else
//! forwards by default. The capability mask is computed once per concrete
//! handler type and cached by type identity, so unimplemented events are
//! never even dispatched.
//!
//! ### Threading
//!
//! Every pipeline is bound to one `EventExecutor` at construction and all
//! callbacks - event handling as well as handler-added/removed lifecycle
//! callbacks - run there, one at a time. Operations invoked from any other
//! thread are marshalled onto that executor, so handlers are written
//! entirely without locks. Structural mutation (add/remove) is validated
//! synchronously at the call site; only the lifecycle callbacks defer.
//!
//! ## Example: Echo Endpoint
//!
//! ```rust
//! use std::time::Duration;
//! use strand::{EventMask, Handler, HandlerContext, Message, MemoryTransport, Pipeline};
//! use strand_buf::ByteBuf;
//! use strand_executor::EventLoopGroup;
//!
//! struct EchoHandler;
//!
//! impl Handler for EchoHandler {
//!     fn events(&self) -> EventMask {
//!         EventMask::READ
//!     }
//!
//!     fn handle_read(&mut self, ctx: &HandlerContext, msg: Message) {
//!         // Send every inbound buffer straight back out.
//!         if msg.downcast_ref::<ByteBuf>().is_some() {
//!             ctx.write(msg);
//!             ctx.flush_next();
//!         }
//!     }
//! }
//!
//! let group = EventLoopGroup::new(1);
//! let transport = MemoryTransport::new();
//! let pipeline = Pipeline::builder(group.register())
//!     .transport(transport.clone())
//!     .build();
//! pipeline.add_last("echo", EchoHandler).unwrap();
//!
//! let mut buf = pipeline.allocator().buffer_with(8).unwrap();
//! buf.write_bytes(b"ping").unwrap();
//! pipeline.fire_read(Box::new(buf));
//!
//! group
//!     .shutdown_gracefully(Duration::from_millis(10), Duration::from_secs(5))
//!     .await_termination(Duration::from_secs(5));
//! assert_eq!(transport.written(), b"ping");
//! ```

#![warn(rust_2018_idioms)]
#![warn(missing_docs)]

mod error;
mod handler;
mod pipeline;
mod pipeline_internal;
mod transport;

pub use error::PipelineError;
pub use handler::{EventMask, Handler, Message, Shared};
pub use pipeline::{Pipeline, PipelineBuilder};
pub use pipeline_internal::HandlerContext;
pub use transport::{MemoryTransport, NullTransport, Transport};
