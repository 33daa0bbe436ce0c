//! Error types for framing and payload encoding.

use thiserror::Error;

/// Errors raised while reading or writing length-prefixed frames.
#[derive(Debug, Error)]
pub enum FrameError {
    /// A frame announced (or tried to carry) more bytes than allowed.
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    TooLarge {
        /// Announced or actual payload length.
        len: usize,
        /// Configured maximum.
        max: usize,
    },
    /// The peer closed the stream in the middle of a frame.
    #[error("stream ended with {remaining} bytes of an incomplete frame")]
    Truncated {
        /// Bytes left in the buffer when the stream ended.
        remaining: usize,
    },
    /// Underlying transport I/O failure.
    #[error("frame I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while compressing or inflating a payload.
#[derive(Debug, Error)]
pub enum CompressionError {
    /// The deflate stream could not be written.
    #[error("failed to compress payload: {0}")]
    Compress(#[source] std::io::Error),
    /// The deflate stream was corrupt.
    #[error("failed to inflate payload: {0}")]
    Inflate(#[source] std::io::Error),
    /// The inflated payload grew past the configured limit.
    #[error("inflated payload exceeds the {max} byte limit")]
    TooLarge {
        /// Configured maximum.
        max: usize,
    },
}
