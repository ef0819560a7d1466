//! Uncompressed RESYNC body.
//!
//! The stream is a sequence of `(block_index: i32, xor_bytes)` entries closed by
//! [`DELTA_STREAM_END`]. Entry lengths are not on the wire: both sides know every
//! block's size from the registration order, so the reader takes a size lookup.

use bytes::{Buf, BufMut};

use crate::constants::DELTA_STREAM_END;
use crate::error::ProtoError;

/// Staging buffer for one tick's dirty blocks.
#[derive(Debug, Default)]
pub struct DeltaWriter {
    buf: Vec<u8>,
    entries: usize,
}

impl DeltaWriter {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
            entries: 0,
        }
    }

    /// Append the XOR diff of block `index`.
    ///
    /// Block indices are bounded by the registry, which never exceeds `i32::MAX` entries.
    pub fn push(&mut self, index: usize, xor: &[u8]) {
        self.buf.put_i32_le(index as i32);
        self.buf.put_slice(xor);
        self.entries += 1;
    }

    pub fn entries(&self) -> usize {
        self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    /// Close the stream with the terminator and return the raw bytes.
    pub fn finish(mut self) -> Vec<u8> {
        self.buf.put_i32_le(DELTA_STREAM_END);
        self.buf
    }
}

/// One parsed entry, borrowing the XOR bytes from the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeltaEntry<'a> {
    pub index: usize,
    pub xor: &'a [u8],
}

/// Parse a whole delta stream before anything is applied.
///
/// `block_len` maps an index to the receiver's block size, or `None` when the
/// index is not registered. Any failure leaves the caller's state untouched.
pub fn parse_delta_stream<F>(stream: &[u8], block_len: F) -> Result<Vec<DeltaEntry<'_>>, ProtoError>
where
    F: Fn(usize) -> Option<usize>,
{
    let mut entries = Vec::new();
    let mut rest = stream;

    loop {
        if rest.len() < 4 {
            return Err(if rest.is_empty() {
                ProtoError::MissingTerminator
            } else {
                ProtoError::DeltaTruncated
            });
        }
        let index = rest.get_i32_le();
        if index == DELTA_STREAM_END {
            if !rest.is_empty() {
                return Err(ProtoError::TrailingBytes(rest.len()));
            }
            return Ok(entries);
        }
        if index < 0 {
            return Err(ProtoError::BlockIndexOutOfRange(index));
        }

        let len = block_len(index as usize).ok_or(ProtoError::BlockIndexOutOfRange(index))?;
        if rest.len() < len {
            return Err(ProtoError::DeltaTruncated);
        }
        let (xor, tail) = rest.split_at(len);
        entries.push(DeltaEntry {
            index: index as usize,
            xor,
        });
        rest = tail;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sizes(lens: &'static [usize]) -> impl Fn(usize) -> Option<usize> {
        move |i| lens.get(i).copied()
    }

    #[test]
    fn single_dirty_block_layout() {
        let mut w = DeltaWriter::default();
        w.push(0, &[1, 0, 0, 1]);
        let stream = w.finish();

        let mut expected = 0i32.to_le_bytes().to_vec();
        expected.extend_from_slice(&[1, 0, 0, 1]);
        expected.extend_from_slice(&(-1i32).to_le_bytes());
        assert_eq!(stream, expected);

        let entries = parse_delta_stream(&stream, sizes(&[4])).unwrap();
        assert_eq!(
            entries,
            vec![DeltaEntry {
                index: 0,
                xor: &[1, 0, 0, 1]
            }]
        );
    }

    #[test]
    fn entries_use_receiver_block_sizes() {
        let mut w = DeltaWriter::default();
        w.push(2, &[7]);
        w.push(0, &[1, 2, 3]);
        assert_eq!(w.entries(), 2);
        let stream = w.finish();

        let entries = parse_delta_stream(&stream, sizes(&[3, 8, 1])).unwrap();
        assert_eq!(entries[0].index, 2);
        assert_eq!(entries[0].xor, &[7]);
        assert_eq!(entries[1].index, 0);
        assert_eq!(entries[1].xor, &[1, 2, 3]);
    }

    #[test]
    fn unknown_index_fails_before_any_entry_is_returned() {
        let mut w = DeltaWriter::default();
        w.push(0, &[1]);
        w.push(5, &[1]);
        let stream = w.finish();

        let err = parse_delta_stream(&stream, sizes(&[1])).unwrap_err();
        assert!(matches!(err, ProtoError::BlockIndexOutOfRange(5)));
    }

    #[test]
    fn missing_terminator_and_truncation() {
        let mut w = DeltaWriter::default();
        w.push(0, &[1, 2]);
        let stream = w.finish();

        let no_end = &stream[..stream.len() - 4];
        assert!(matches!(
            parse_delta_stream(no_end, sizes(&[2])),
            Err(ProtoError::MissingTerminator)
        ));
        assert!(matches!(
            parse_delta_stream(&stream[..5], sizes(&[2])),
            Err(ProtoError::DeltaTruncated)
        ));
    }

    #[test]
    fn empty_stream_is_just_the_terminator() {
        let stream = DeltaWriter::default().finish();
        assert_eq!(stream, (-1i32).to_le_bytes());
        assert!(parse_delta_stream(&stream, sizes(&[])).unwrap().is_empty());
    }
}
