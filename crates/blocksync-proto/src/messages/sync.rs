use bytes::{BufMut, Bytes, BytesMut};

use super::{take_block, take_bytes, take_len};
use crate::error::ProtoError;
use crate::limits::MAX_UNCOMPRESSED_SIZE;
use crate::msg_id::MsgId;

/// Full snapshot sent to a newly connected (or re-syncing) client.
///
/// Wire: `num_blocks, (size, bytes)*, num_const_blocks, (size, bytes)*`.
/// Blocks carry the server's stale snapshot so the next RESYNC applies cleanly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitialSync {
    pub blocks: Vec<Bytes>,
    pub const_blocks: Vec<Bytes>,
}

impl InitialSync {
    /// Encode straight from borrowed block contents, avoiding an intermediate copy.
    pub fn encode_parts<'a, B, C>(blocks: B, const_blocks: C) -> Bytes
    where
        B: ExactSizeIterator<Item = &'a [u8]> + Clone,
        C: ExactSizeIterator<Item = &'a [u8]> + Clone,
    {
        let payload: usize = blocks.clone().map(|b| 4 + b.len()).sum::<usize>()
            + const_blocks.clone().map(|b| 4 + b.len()).sum::<usize>();

        let mut out = BytesMut::with_capacity(1 + 8 + payload);
        out.put_u8(MsgId::InitialSync as u8);
        out.put_i32_le(blocks.len() as i32);
        for block in blocks {
            out.put_i32_le(block.len() as i32);
            out.put_slice(block);
        }
        out.put_i32_le(const_blocks.len() as i32);
        for block in const_blocks {
            out.put_i32_le(block.len() as i32);
            out.put_slice(block);
        }
        out.freeze()
    }

    pub(crate) fn decode_body(buf: &mut Bytes) -> Result<Self, ProtoError> {
        // Each entry needs at least its 4-byte size, which bounds the counts.
        let max_entries = buf.len() / 4;
        let num_blocks = take_len(buf, max_entries)?;
        let mut blocks = Vec::with_capacity(num_blocks);
        for _ in 0..num_blocks {
            blocks.push(take_block(buf)?);
        }

        let max_entries = buf.len() / 4;
        let num_const = take_len(buf, max_entries)?;
        let mut const_blocks = Vec::with_capacity(num_const);
        for _ in 0..num_const {
            const_blocks.push(take_block(buf)?);
        }

        Ok(Self {
            blocks,
            const_blocks,
        })
    }
}

/// Incremental delta broadcast after a tick with at least one dirty block.
///
/// Wire: `uncompressed_size, compressed_size, deflate(delta stream)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resync {
    pub uncompressed_size: usize,
    pub compressed: Bytes,
}

impl Resync {
    pub(crate) fn encode(&self) -> Bytes {
        encode_compressed(MsgId::Resync, self.uncompressed_size, &self.compressed)
    }

    pub(crate) fn decode_body(buf: &mut Bytes) -> Result<Self, ProtoError> {
        let (uncompressed_size, compressed) = decode_compressed(buf)?;
        Ok(Self {
            uncompressed_size,
            compressed,
        })
    }
}

/// One const block, compressed. Sent unreliably to every connected client.
///
/// Wire: `original_size, compressed_size, deflate(raw bytes)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConstData {
    pub original_size: usize,
    pub compressed: Bytes,
}

impl ConstData {
    pub(crate) fn encode(&self) -> Bytes {
        encode_compressed(MsgId::ConstData, self.original_size, &self.compressed)
    }

    pub(crate) fn decode_body(buf: &mut Bytes) -> Result<Self, ProtoError> {
        let (original_size, compressed) = decode_compressed(buf)?;
        Ok(Self {
            original_size,
            compressed,
        })
    }
}

/// Server asks every client to report the checksum of its mirrored blocks.
///
/// Travels on the sync channel, so it is observed after every preceding RESYNC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncCheck {
    pub check_id: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChecksumReport {
    pub check_id: u32,
    pub checksum: u64,
}

/// Why a client asks for a fresh INITIAL_SYNC.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::FromRepr)]
pub enum FullSyncReason {
    Unknown = 0,
    IndexOutOfRange = 1,
    MalformedDiff = 2,
    Decompression = 3,
    BlockLayout = 4,
}

impl FullSyncReason {
    pub fn from_wire(raw: u8) -> Self {
        Self::from_repr(raw).unwrap_or(Self::Unknown)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FullSyncRequest {
    pub reason: FullSyncReason,
}

fn encode_compressed(msg_id: MsgId, original_size: usize, compressed: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(9 + compressed.len());
    out.put_u8(msg_id as u8);
    out.put_i32_le(original_size as i32);
    out.put_i32_le(compressed.len() as i32);
    out.put_slice(compressed);
    out.freeze()
}

fn decode_compressed(buf: &mut Bytes) -> Result<(usize, Bytes), ProtoError> {
    let original_size = take_len(buf, MAX_UNCOMPRESSED_SIZE)?;
    let compressed_size = take_len(buf, MAX_UNCOMPRESSED_SIZE)?;
    let compressed = take_bytes(buf, compressed_size)?;
    Ok((original_size, compressed))
}
