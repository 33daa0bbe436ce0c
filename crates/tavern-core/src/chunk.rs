//! Chunked delivery of length-prefixed frames.
//!
//! Data channels cap the size of a single message, so an encoded frame is
//! split into [`CHUNK_SIZE`] pieces before sending. The receiver feeds every
//! piece into a [`ChunkAssembler`], which yields whole payloads as soon as
//! their last byte arrives. A small frame still travels as one chunk.

use bytes::{Bytes, BytesMut};
use tokio_util::codec::Decoder;

use crate::errors::FrameError;
use crate::framing::FrameCodec;

/// Maximum bytes per data channel message.
pub const CHUNK_SIZE: usize = 16 * 1024;

/// Split an encoded frame into chunks of at most `chunk_size` bytes.
///
/// Chunks share the frame's buffer; no payload bytes are copied.
pub fn split_into_chunks(frame: &Bytes, chunk_size: usize) -> Vec<Bytes> {
    let chunk_size = chunk_size.max(1);
    let mut chunks = Vec::with_capacity(frame.len().div_ceil(chunk_size));
    let mut offset = 0;
    while offset < frame.len() {
        let end = (offset + chunk_size).min(frame.len());
        chunks.push(frame.slice(offset..end));
        offset = end;
    }
    chunks
}

/// Reassembles payloads from a sequence of chunks.
#[derive(Debug)]
pub struct ChunkAssembler {
    codec: FrameCodec,
    buffer: BytesMut,
}

impl ChunkAssembler {
    /// Create an assembler rejecting payloads above `max_frame_size`.
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            codec: FrameCodec::new(max_frame_size),
            buffer: BytesMut::new(),
        }
    }

    /// Feed one chunk and return every payload it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<Bytes>, FrameError> {
        self.buffer.extend_from_slice(chunk);
        let mut complete = Vec::new();
        while let Some(payload) = self.codec.decode(&mut self.buffer)? {
            complete.push(payload);
        }
        Ok(complete)
    }

    /// Bytes of an incomplete frame currently buffered.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}
