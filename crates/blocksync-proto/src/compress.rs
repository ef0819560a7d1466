//! Deflate (zlib container) at maximum compression.

use std::io::{Read, Write};

use flate2::{Compression, read::ZlibDecoder, write::ZlibEncoder};

use crate::error::ProtoError;
use crate::limits::MAX_UNCOMPRESSED_SIZE;

pub fn compress(data: &[u8]) -> Result<Vec<u8>, ProtoError> {
    if data.len() > MAX_UNCOMPRESSED_SIZE {
        return Err(ProtoError::PayloadTooLarge(data.len()));
    }
    let mut encoder = ZlibEncoder::new(
        Vec::with_capacity(data.len() / 2 + 64),
        Compression::best(),
    );
    encoder.write_all(data).map_err(ProtoError::Compression)?;
    encoder.finish().map_err(ProtoError::Compression)
}

/// Inflate `compressed`, which must expand to exactly `expected_len` bytes.
pub fn decompress(compressed: &[u8], expected_len: usize) -> Result<Vec<u8>, ProtoError> {
    if expected_len > MAX_UNCOMPRESSED_SIZE {
        return Err(ProtoError::PayloadTooLarge(expected_len));
    }

    let mut out = Vec::with_capacity(expected_len);
    // One extra byte is enough to detect a body longer than declared.
    ZlibDecoder::new(compressed)
        .take(expected_len as u64 + 1)
        .read_to_end(&mut out)
        .map_err(ProtoError::Compression)?;

    if out.len() != expected_len {
        return Err(ProtoError::DecompressedLengthMismatch {
            expected: expected_len,
            actual: out.len(),
        });
    }
    Ok(out)
}
