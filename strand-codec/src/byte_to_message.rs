//! The inbound decode adapter and its cumulation strategies.

use log::trace;
use strand::{EventMask, Handler, HandlerContext, Message};
use strand_buf::{Allocator, ByteBuf, CompositeBuf, ReadableBuf, Unpooled};
use strand_common::RefCounted;

use crate::error::CodecError;

/// Cuts structured frames out of an accumulated byte stream.
///
/// `decode` is called repeatedly against the unread region: return
/// `Ok(Some(frame))` after consuming one complete frame, `Ok(None)` when
/// more bytes are needed (consuming nothing), or an error to abort the
/// current input.
pub trait FrameDecoder: Send + 'static {
    /// Attempts to cut one frame from `input`.
    fn decode(&mut self, input: &mut dyn ReadableBuf) -> Result<Option<Message>, CodecError>;

    /// Last call when the endpoint goes inactive with bytes still
    /// buffered. Defaults to a normal decode.
    fn decode_eof(&mut self, input: &mut dyn ReadableBuf) -> Result<Option<Message>, CodecError> {
        self.decode(input)
    }
}

/// How partial input is buffered between reads.
///
/// Both strategies have identical external behavior; the choice is a
/// performance trade (copying into one contiguous buffer versus chaining
/// components).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cumulate {
    /// Copy each chunk into one contiguous buffer, growing it as needed.
    Merge,
    /// Append each chunk as a component of a composite buffer.
    Compose,
}

enum Cumulation {
    Empty,
    Merged(ByteBuf),
    Composed(CompositeBuf),
}

impl Cumulation {
    fn readable_bytes(&self) -> usize {
        match self {
            Cumulation::Empty => 0,
            Cumulation::Merged(buf) => buf.readable_bytes(),
            Cumulation::Composed(buf) => buf.readable_bytes(),
        }
    }

    fn release(self) {
        match self {
            Cumulation::Empty => {}
            Cumulation::Merged(buf) => buf.release_quiet(),
            Cumulation::Composed(buf) => buf.release_quiet(),
        }
    }
}

/// Pipeline adapter feeding accumulated inbound bytes to a
/// [`FrameDecoder`].
///
/// Owns the accumulation buffer; releases consumed input, forwards the
/// unread remainder when removed from the pipeline, and converts decoder
/// errors into pipeline error events without stopping the pipeline.
pub struct ByteToMessageHandler {
    decoder: Box<dyn FrameDecoder>,
    strategy: Cumulate,
    cumulation: Cumulation,
}

impl ByteToMessageHandler {
    /// Wraps `decoder` with the [`Cumulate::Merge`] strategy.
    pub fn new(decoder: Box<dyn FrameDecoder>) -> Self {
        Self::with_strategy(decoder, Cumulate::Merge)
    }

    /// Wraps `decoder` with an explicit cumulation strategy.
    pub fn with_strategy(decoder: Box<dyn FrameDecoder>, strategy: Cumulate) -> Self {
        Self {
            decoder,
            strategy,
            cumulation: Cumulation::Empty,
        }
    }

    /// Bytes currently buffered awaiting more input.
    pub fn buffered_bytes(&self) -> usize {
        self.cumulation.readable_bytes()
    }

    fn cumulate(&mut self, input: ByteBuf) -> Result<(), CodecError> {
        match (&mut self.cumulation, self.strategy) {
            (Cumulation::Empty, Cumulate::Merge) => {
                // First chunk needs no copy; it becomes the accumulation.
                self.cumulation = Cumulation::Merged(input);
            }
            (Cumulation::Empty, Cumulate::Compose) => {
                let mut composite = Unpooled.composite_with(MAX_CUMULATION_COMPONENTS);
                composite.add_component(input)?;
                self.cumulation = Cumulation::Composed(composite);
            }
            (Cumulation::Merged(cumulation), Cumulate::Merge) => {
                let readable = input.readable_bytes();
                cumulation.discard_read_bytes()?;
                let mut consumed = input;
                let bytes = consumed.read_bytes(readable)?;
                cumulation.write_bytes(&bytes)?;
                consumed
                    .release()
                    .map_err(strand_buf::BufError::from)?;
            }
            (Cumulation::Composed(cumulation), Cumulate::Compose) => {
                cumulation.add_component(input)?;
            }
            // The strategy never changes after construction.
            (Cumulation::Merged(_), Cumulate::Compose)
            | (Cumulation::Composed(_), Cumulate::Merge) => unreachable!(),
        }
        Ok(())
    }

    fn decode_loop(&mut self, ctx: &HandlerContext, eof: bool) -> Result<(), CodecError> {
        loop {
            let decoded = match &mut self.cumulation {
                Cumulation::Empty => break,
                Cumulation::Merged(buf) => {
                    if eof {
                        self.decoder.decode_eof(buf)?
                    } else {
                        self.decoder.decode(buf)?
                    }
                }
                Cumulation::Composed(buf) => {
                    if eof {
                        self.decoder.decode_eof(buf)?
                    } else {
                        self.decoder.decode(buf)?
                    }
                }
            };
            match decoded {
                Some(frame) => ctx.fire_read(frame),
                None => break,
            }
        }
        // Fully consumed input does not linger in the accumulation.
        if self.cumulation.readable_bytes() == 0 {
            std::mem::replace(&mut self.cumulation, Cumulation::Empty).release();
        }
        Ok(())
    }

    fn reset(&mut self) {
        std::mem::replace(&mut self.cumulation, Cumulation::Empty).release();
    }
}

/// Component cap for the composing strategy; enough that a stalled frame
/// hits a frame-length limit long before it hits this.
const MAX_CUMULATION_COMPONENTS: usize = 1024;

impl Handler for ByteToMessageHandler {
    fn events(&self) -> EventMask {
        EventMask::READ | EventMask::CHANNEL_INACTIVE
    }

    fn handle_read(&mut self, ctx: &HandlerContext, msg: Message) {
        let input = match msg.downcast::<ByteBuf>() {
            Ok(buf) => *buf,
            Err(other) => {
                // Not bytes; none of our business.
                ctx.fire_read(other);
                return;
            }
        };
        let result = self
            .cumulate(input)
            .and_then(|()| self.decode_loop(ctx, false));
        if let Err(error) = result {
            // The current input is poisoned; drop the accumulation and let
            // the pipeline decide. Subsequent inputs decode afresh.
            self.reset();
            ctx.fire_error(error.into());
        }
    }

    fn channel_inactive(&mut self, ctx: &HandlerContext) {
        if self.cumulation.readable_bytes() > 0 {
            if let Err(error) = self.decode_loop(ctx, true) {
                self.reset();
                ctx.fire_error(error.into());
            }
        }
        self.reset();
        ctx.fire_channel_inactive();
    }

    fn handler_removed(&mut self, ctx: &HandlerContext) {
        // Unread buffered bytes belong to whoever comes after us now.
        match std::mem::replace(&mut self.cumulation, Cumulation::Empty) {
            Cumulation::Empty => {}
            Cumulation::Merged(buf) => {
                if buf.readable_bytes() > 0 {
                    trace!("forwarding {} buffered bytes on removal", buf.readable_bytes());
                    ctx.fire_read(Box::new(buf));
                } else {
                    buf.release_quiet();
                }
            }
            Cumulation::Composed(buf) => {
                if buf.readable_bytes() > 0 {
                    trace!("forwarding {} buffered bytes on removal", buf.readable_bytes());
                    ctx.fire_read(Box::new(buf));
                } else {
                    buf.release_quiet();
                }
            }
        }
    }
}
