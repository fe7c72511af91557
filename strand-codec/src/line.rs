//! Line-based framing.

use strand::Message;
use strand_buf::ReadableBuf;

use crate::byte_to_message::FrameDecoder;
use crate::error::CodecError;

/// Which line endings terminate a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Terminator {
    /// `\n` only.
    Newline,
    /// `\r\n` only.
    CrLf,
    /// Either `\n` or `\r\n`.
    Both,
}

/// Decodes frames terminated by line endings, emitted as `Vec<u8>`.
pub struct LineFrameDecoder {
    max_length: usize,
    strip_terminator: bool,
    terminator: Terminator,
}

impl LineFrameDecoder {
    /// Creates a line decoder.
    ///
    /// `max_length` bounds the line length (terminator excluded);
    /// `strip_terminator` removes the line ending from emitted frames.
    pub fn new(max_length: usize, strip_terminator: bool, terminator: Terminator) -> Self {
        Self {
            max_length,
            strip_terminator,
            terminator,
        }
    }

    /// Index just past the terminator, and the terminator's length, for the
    /// first line ending in the unread bytes.
    fn find_terminator(&self, input: &dyn ReadableBuf) -> Result<Option<(usize, usize)>, CodecError> {
        let readable = input.readable_bytes();
        for i in 0..readable {
            let byte = input.peek_u8(i)?;
            if byte != b'\n' {
                continue;
            }
            let preceded_by_cr = i > 0 && input.peek_u8(i - 1)? == b'\r';
            let matched = match self.terminator {
                Terminator::Newline => true,
                Terminator::CrLf => preceded_by_cr,
                Terminator::Both => true,
            };
            if matched {
                let terminator_len = if preceded_by_cr && self.terminator != Terminator::Newline {
                    2
                } else {
                    1
                };
                return Ok(Some((i + 1, terminator_len)));
            }
        }
        Ok(None)
    }
}

impl FrameDecoder for LineFrameDecoder {
    fn decode(&mut self, input: &mut dyn ReadableBuf) -> Result<Option<Message>, CodecError> {
        match self.find_terminator(input)? {
            Some((end, terminator_len)) => {
                let line_len = end - terminator_len;
                if line_len > self.max_length {
                    input.skip_bytes(end)?;
                    return Err(CodecError::FrameTooLong {
                        length: line_len,
                        limit: self.max_length,
                    });
                }
                let mut frame = input.read_bytes(end)?;
                if self.strip_terminator {
                    frame.truncate(line_len);
                }
                Ok(Some(Box::new(frame)))
            }
            None => {
                if input.readable_bytes() > self.max_length {
                    return Err(CodecError::FrameTooLong {
                        length: input.readable_bytes(),
                        limit: self.max_length,
                    });
                }
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_buf::{Allocator, Unpooled};

    fn decode_all(decoder: &mut LineFrameDecoder, bytes: &[u8]) -> Vec<Vec<u8>> {
        let mut buf = Unpooled.buffer_with(bytes.len().max(1)).unwrap();
        buf.write_bytes(bytes).unwrap();
        let mut frames = Vec::new();
        while let Some(frame) = decoder.decode(&mut buf).unwrap() {
            frames.push(*frame.downcast::<Vec<u8>>().unwrap());
        }
        frames
    }

    #[test]
    fn splits_on_newline() {
        let mut decoder = LineFrameDecoder::new(64, true, Terminator::Both);
        assert_eq!(
            decode_all(&mut decoder, b"one\ntwo\r\nthree"),
            vec![b"one".to_vec(), b"two".to_vec()]
        );
    }

    #[test]
    fn keeps_terminator_when_asked() {
        let mut decoder = LineFrameDecoder::new(64, false, Terminator::Both);
        assert_eq!(decode_all(&mut decoder, b"hi\n"), vec![b"hi\n".to_vec()]);
    }

    #[test]
    fn crlf_only_ignores_bare_newline() {
        let mut decoder = LineFrameDecoder::new(64, true, Terminator::CrLf);
        assert_eq!(decode_all(&mut decoder, b"a\nb\r\n"), vec![b"a\nb".to_vec()]);
    }

    #[test]
    fn overlong_line_is_an_error() {
        let mut decoder = LineFrameDecoder::new(2, true, Terminator::Both);
        let mut buf = Unpooled.buffer_with(8).unwrap();
        buf.write_bytes(b"abcd\n").unwrap();
        assert!(matches!(
            decoder.decode(&mut buf).unwrap_err(),
            CodecError::FrameTooLong { length: 4, limit: 2 }
        ));
    }
}
