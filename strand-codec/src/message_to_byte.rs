//! The outbound encode adapter.

use strand::{EventMask, Handler, HandlerContext, Message, PipelineError};
use strand_buf::ByteBuf;
use strand_common::{Completion, RefCounted};

use crate::error::CodecError;

/// Encodes one outbound message into a byte buffer.
pub trait MessageEncoder: Send + 'static {
    /// Writes `msg` into `out`.
    ///
    /// Return `Ok(None)` when the message was encoded, or `Ok(Some(msg))`
    /// to pass a message this encoder does not handle through unchanged.
    fn encode(
        &mut self,
        msg: Message,
        out: &mut ByteBuf,
    ) -> Result<Option<Message>, CodecError>;
}

/// Pipeline adapter wiring a [`MessageEncoder`] into the outbound chain.
///
/// Allocates the output buffer from the endpoint's allocator; a failed
/// encode fails the write's completion and raises an error event, but the
/// pipeline keeps running.
pub struct MessageToByteHandler {
    encoder: Box<dyn MessageEncoder>,
}

impl MessageToByteHandler {
    /// Wraps `encoder`.
    pub fn new(encoder: Box<dyn MessageEncoder>) -> Self {
        Self { encoder }
    }
}

impl Handler for MessageToByteHandler {
    fn events(&self) -> EventMask {
        EventMask::WRITE
    }

    fn handle_write(&mut self, ctx: &HandlerContext, msg: Message, completion: Completion) {
        let Some(pipeline) = ctx.pipeline() else {
            completion.fail("pipeline already dropped");
            return;
        };
        let mut out = pipeline.allocator().buffer();
        match self.encoder.encode(msg, &mut out) {
            Ok(None) => ctx.write_next(Box::new(out), completion),
            Ok(Some(passthrough)) => {
                out.release_quiet();
                ctx.write_next(passthrough, completion);
            }
            Err(error) => {
                out.release_quiet();
                completion.fail(error.to_string());
                ctx.fire_error(PipelineError::from(error));
            }
        }
    }
}
