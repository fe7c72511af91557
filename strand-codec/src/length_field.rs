//! Length-prefixed framing.

use strand::Message;
use strand_buf::ReadableBuf;

use crate::byte_to_message::FrameDecoder;
use crate::error::CodecError;

/// Decodes frames prefixed by a big-endian length field.
///
/// The field width may be 1, 2, 4 or 8 bytes. A frame announcing more than
/// `max_frame_length` bytes fails with [`CodecError::FrameTooLong`] before
/// any of it is buffered further. Decoded frames are emitted as `Vec<u8>`
/// payloads without the length prefix.
pub struct LengthFieldFrameDecoder {
    field_width: usize,
    max_frame_length: usize,
}

impl LengthFieldFrameDecoder {
    /// Creates a decoder with the given field width (1, 2, 4 or 8 bytes)
    /// and frame length limit.
    ///
    /// # Panics
    ///
    /// Panics on an unsupported field width.
    pub fn new(field_width: usize, max_frame_length: usize) -> Self {
        assert!(
            matches!(field_width, 1 | 2 | 4 | 8),
            "unsupported length field width {field_width}"
        );
        Self {
            field_width,
            max_frame_length,
        }
    }

    fn peek_length(&self, input: &dyn ReadableBuf) -> Result<usize, CodecError> {
        let mut length: u64 = 0;
        for i in 0..self.field_width {
            length = (length << 8) | u64::from(input.peek_u8(i)?);
        }
        Ok(length as usize)
    }
}

impl FrameDecoder for LengthFieldFrameDecoder {
    fn decode(&mut self, input: &mut dyn ReadableBuf) -> Result<Option<Message>, CodecError> {
        if input.readable_bytes() < self.field_width {
            return Ok(None);
        }
        let length = self.peek_length(input)?;
        if length > self.max_frame_length {
            return Err(CodecError::FrameTooLong {
                length,
                limit: self.max_frame_length,
            });
        }
        if input.readable_bytes() < self.field_width + length {
            return Ok(None);
        }
        input.skip_bytes(self.field_width)?;
        let payload = input.read_bytes(length)?;
        Ok(Some(Box::new(payload)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_buf::{Allocator, Unpooled};

    fn feed(decoder: &mut LengthFieldFrameDecoder, bytes: &[u8]) -> Option<Vec<u8>> {
        let mut buf = Unpooled.buffer_with(bytes.len().max(1)).unwrap();
        buf.write_bytes(bytes).unwrap();
        let frame = decoder.decode(&mut buf).unwrap();
        frame.map(|msg| *msg.downcast::<Vec<u8>>().unwrap())
    }

    #[test]
    fn cuts_one_complete_frame() {
        let mut decoder = LengthFieldFrameDecoder::new(2, 1024);
        assert_eq!(feed(&mut decoder, &[0x00, 0x02, b'h', b'i']), Some(b"hi".to_vec()));
    }

    #[test]
    fn waits_for_the_full_frame() {
        let mut decoder = LengthFieldFrameDecoder::new(2, 1024);
        assert_eq!(feed(&mut decoder, &[0x00, 0x02, b'h']), None);
        assert_eq!(feed(&mut decoder, &[0x00]), None);
    }

    #[test]
    fn rejects_oversized_frames() {
        let mut decoder = LengthFieldFrameDecoder::new(2, 4);
        let mut buf = Unpooled.buffer_with(8).unwrap();
        buf.write_bytes(&[0x00, 0x05]).unwrap();
        assert_eq!(
            decoder.decode(&mut buf).unwrap_err(),
            CodecError::FrameTooLong {
                length: 5,
                limit: 4
            }
        );
    }

    #[test]
    fn wide_length_fields() {
        let mut decoder = LengthFieldFrameDecoder::new(4, 1024);
        assert_eq!(
            feed(&mut decoder, &[0, 0, 0, 3, b'a', b'b', b'c']),
            Some(b"abc".to_vec())
        );
    }
}
