use strand_buf::BufError;
use strand::PipelineError;
use thiserror::Error;

/// Errors produced while decoding or encoding frames.
///
/// This is a dedicated kind, distinct from raw transport errors: a codec's
/// own error travels through the pipeline unchanged (still downcastable at
/// any handler), while any other failure raised mid-decode is wrapped in
/// [`CodecError::Buf`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    /// A frame announced or accumulated more bytes than the decoder allows.
    #[error("frame of {length} bytes exceeds the limit of {limit}")]
    FrameTooLong {
        /// The offending frame length.
        length: usize,
        /// The configured limit.
        limit: usize,
    },

    /// The input cannot be a valid frame.
    #[error("malformed frame: {0}")]
    Malformed(String),

    /// A text frame was not valid UTF-8.
    #[error("invalid utf-8 in text frame")]
    InvalidText,

    /// A buffer operation failed while decoding or encoding; wrapped so
    /// the codec origin stays visible.
    #[error("codec buffer failure: {0}")]
    Buf(#[from] BufError),
}

impl From<CodecError> for PipelineError {
    fn from(error: CodecError) -> Self {
        PipelineError::other(error)
    }
}
