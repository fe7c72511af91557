//! UTF-8 string framing.

use strand::{EventMask, Handler, HandlerContext, Message, PipelineError};
use strand_common::{Completion, RefCounted};

use crate::error::CodecError;

/// Converts inbound `Vec<u8>` frames to `String` and outbound `String`
/// messages back to bytes.
///
/// Sits above a frame decoder such as
/// [`LengthFieldFrameDecoder`](crate::LengthFieldFrameDecoder) or
/// [`LineFrameDecoder`](crate::LineFrameDecoder). Messages of other types
/// pass through untouched in both directions.
#[derive(Debug, Default)]
pub struct StringCodec;

impl StringCodec {
    /// Creates the codec.
    pub fn new() -> Self {
        Self
    }
}

impl Handler for StringCodec {
    fn events(&self) -> EventMask {
        EventMask::READ | EventMask::WRITE
    }

    fn handle_read(&mut self, ctx: &HandlerContext, msg: Message) {
        match msg.downcast::<Vec<u8>>() {
            Ok(bytes) => match String::from_utf8(*bytes) {
                Ok(text) => ctx.fire_read(Box::new(text)),
                Err(_) => ctx.fire_error(PipelineError::from(CodecError::InvalidText)),
            },
            Err(other) => ctx.fire_read(other),
        }
    }

    fn handle_write(&mut self, ctx: &HandlerContext, msg: Message, completion: Completion) {
        match msg.downcast::<String>() {
            Ok(text) => {
                let Some(pipeline) = ctx.pipeline() else {
                    completion.fail("pipeline already dropped");
                    return;
                };
                let mut out = match pipeline.allocator().buffer_with(text.len().max(1)) {
                    Ok(buf) => buf,
                    Err(error) => {
                        completion.fail(error.to_string());
                        return;
                    }
                };
                if let Err(error) = out.write_bytes(text.as_bytes()) {
                    out.release_quiet();
                    completion.fail(error.to_string());
                    ctx.fire_error(PipelineError::from(CodecError::Buf(error)));
                    return;
                }
                ctx.write_next(Box::new(out), completion);
            }
            Err(other) => ctx.write_next(other, completion),
        }
    }
}
