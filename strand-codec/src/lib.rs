//! # Strand Codec - Byte/Message Codec Handlers
//!
//! `strand-codec` provides the codec seam of the strand framework: pipeline
//! handlers that turn raw inbound bytes into structured messages and
//! structured outbound messages back into bytes.
//!
//! ## Decoding
//!
//! A [`FrameDecoder`] looks at the accumulated unread bytes and either cuts
//! one complete frame or asks for more data. The [`ByteToMessageHandler`]
//! adapter owns the accumulation: partial input is buffered with one of two
//! strategies with identical external behavior -
//! [`Cumulate::Merge`] copies chunks into one contiguous buffer,
//! [`Cumulate::Compose`] appends them as components of a composite buffer.
//! Consumed input is released, buffered bytes are never retained past
//! removal (the remainder is forwarded instead), and a decoder's own error
//! propagates unchanged while anything else that fails mid-decode is
//! wrapped. A decode error terminates the current input's processing; the
//! pipeline itself continues.
//!
//! ## Encoding
//!
//! A [`MessageEncoder`] writes one outbound message into a fresh buffer
//! from the endpoint's allocator; the [`MessageToByteHandler`] adapter
//! wires it into the outbound chain and fails the write's completion when
//! encoding does.
//!
//! ## Included Codecs
//!
//! - [`LengthFieldFrameDecoder`]: frames prefixed by a big-endian length
//!   field of 1, 2, 4 or 8 bytes.
//! - [`LineFrameDecoder`]: frames terminated by `\n` or `\r\n`.
//! - [`StringCodec`]: UTF-8 `Vec<u8>` frames to `String` and back.
//!
//! ## Example
//!
//! ```rust
//! use std::time::Duration;
//! use strand::{MemoryTransport, Pipeline};
//! use strand_codec::{ByteToMessageHandler, LengthFieldFrameDecoder, StringCodec};
//! use strand_executor::EventLoopGroup;
//!
//! let group = EventLoopGroup::new(1);
//! let pipeline = Pipeline::builder(group.register())
//!     .transport(MemoryTransport::new())
//!     .build();
//!
//! pipeline
//!     .add_last(
//!         "frame-decoder",
//!         ByteToMessageHandler::new(Box::new(LengthFieldFrameDecoder::new(2, 65_535))),
//!     )
//!     .unwrap();
//! pipeline.add_last("string-codec", StringCodec::new()).unwrap();
//!
//! group
//!     .shutdown_gracefully(Duration::ZERO, Duration::from_secs(5))
//!     .await_termination(Duration::from_secs(5));
//! ```

#![warn(rust_2018_idioms)]
#![warn(missing_docs)]

mod byte_to_message;
mod error;
mod length_field;
mod line;
mod message_to_byte;
mod string_codec;

pub use byte_to_message::{ByteToMessageHandler, Cumulate, FrameDecoder};
pub use error::CodecError;
pub use length_field::LengthFieldFrameDecoder;
pub use line::{LineFrameDecoder, Terminator};
pub use message_to_byte::{MessageEncoder, MessageToByteHandler};
pub use string_codec::StringCodec;
