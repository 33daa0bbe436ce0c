//! Payload compression applied below the application layer.
//!
//! Every payload is deflated before it is framed and inflated after it is
//! reassembled. Compression is a per-server switch; both ends of a
//! connection must agree on it.

use std::io::{Read, Write};

use bytes::Bytes;
use flate2::Compression;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;

use crate::errors::CompressionError;

/// Compress or pass through payloads on their way to and from the wire.
#[derive(Clone, Copy, Debug)]
pub struct PayloadCodec {
    compression: bool,
    max_message_size: usize,
}

impl PayloadCodec {
    /// Create a codec. `max_message_size` bounds inflated payloads.
    pub fn new(compression: bool, max_message_size: usize) -> Self {
        Self {
            compression,
            max_message_size,
        }
    }

    /// Whether payloads are deflated.
    pub fn is_compressed(&self) -> bool {
        self.compression
    }

    /// Largest application payload accepted.
    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    /// Largest wire payload a peer may legitimately send.
    ///
    /// Deflate can grow incompressible input slightly, so compressed wire
    /// payloads get a small allowance over `max_message_size`.
    pub fn max_wire_size(&self) -> usize {
        if self.compression {
            self.max_message_size
                .saturating_add(self.max_message_size / 64)
                .saturating_add(64)
        } else {
            self.max_message_size
        }
    }

    /// Prepare an application payload for the wire.
    pub fn encode(&self, payload: Bytes) -> Result<Bytes, CompressionError> {
        if self.compression {
            compress(&payload)
        } else {
            Ok(payload)
        }
    }

    /// Recover an application payload from the wire.
    pub fn decode(&self, wire: Bytes) -> Result<Bytes, CompressionError> {
        if self.compression {
            inflate(&wire, self.max_message_size)
        } else if wire.len() > self.max_message_size {
            Err(CompressionError::TooLarge {
                max: self.max_message_size,
            })
        } else {
            Ok(wire)
        }
    }
}

/// Deflate `payload` with the default compression level.
pub fn compress(payload: &[u8]) -> Result<Bytes, CompressionError> {
    let mut encoder = DeflateEncoder::new(Vec::with_capacity(payload.len() / 2), Compression::default());
    encoder
        .write_all(payload)
        .map_err(CompressionError::Compress)?;
    let out = encoder.finish().map_err(CompressionError::Compress)?;
    Ok(Bytes::from(out))
}

/// Inflate `compressed`, refusing output larger than `max_size`.
pub fn inflate(compressed: &[u8], max_size: usize) -> Result<Bytes, CompressionError> {
    let limit = u64::try_from(max_size).unwrap_or(u64::MAX).saturating_add(1);
    let mut decoder = DeflateDecoder::new(compressed).take(limit);
    let mut out = Vec::with_capacity(compressed.len().saturating_mul(2).min(max_size));
    let _ = decoder
        .read_to_end(&mut out)
        .map_err(CompressionError::Inflate)?;
    if out.len() > max_size {
        return Err(CompressionError::TooLarge { max: max_size });
    }
    Ok(Bytes::from(out))
}
