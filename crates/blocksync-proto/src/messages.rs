//! Sync messages (wire format).
//!
//! Every message starts with its one-byte [`MsgId`]. Integers are little-endian
//! `int32` unless noted; lengths are validated against [`MAX_UNCOMPRESSED_SIZE`]
//! before anything is allocated.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ProtoError;
use crate::limits::{MAX_MESSAGE_SIZE, MAX_UNCOMPRESSED_SIZE};
use crate::msg_id::MsgId;

pub mod handshake;
pub mod input;
pub mod sync;

pub use input::ClientInputs;
pub use sync::{
    ChecksumReport, ConstData, FullSyncReason, FullSyncRequest, InitialSync, Resync, SyncCheck,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    InitialSync(InitialSync),
    Resync(Resync),
    ConstData(ConstData),
    ClientInputs(ClientInputs),
    InitialSyncAck,
    SyncCheck(SyncCheck),
    ChecksumReport(ChecksumReport),
    FullSyncRequest(FullSyncRequest),
}

impl Message {
    pub fn msg_id(&self) -> MsgId {
        match self {
            Message::InitialSync(_) => MsgId::InitialSync,
            Message::Resync(_) => MsgId::Resync,
            Message::ConstData(_) => MsgId::ConstData,
            Message::ClientInputs(_) => MsgId::ClientInputs,
            Message::InitialSyncAck => MsgId::InitialSyncAck,
            Message::SyncCheck(_) => MsgId::SyncCheck,
            Message::ChecksumReport(_) => MsgId::ChecksumReport,
            Message::FullSyncRequest(_) => MsgId::FullSyncRequest,
        }
    }

    /// Encode into a self-describing buffer (leading id byte included).
    pub fn encode(&self) -> Bytes {
        match self {
            Message::InitialSync(m) => InitialSync::encode_parts(
                m.blocks.iter().map(|b| &b[..]),
                m.const_blocks.iter().map(|b| &b[..]),
            ),
            Message::Resync(m) => m.encode(),
            Message::ConstData(m) => m.encode(),
            Message::ClientInputs(m) => m.encode(),
            Message::InitialSyncAck => Bytes::from_static(&[MsgId::InitialSyncAck as u8]),
            Message::SyncCheck(m) => {
                let mut out = BytesMut::with_capacity(5);
                out.put_u8(MsgId::SyncCheck as u8);
                out.put_u32_le(m.check_id);
                out.freeze()
            }
            Message::ChecksumReport(m) => {
                let mut out = BytesMut::with_capacity(13);
                out.put_u8(MsgId::ChecksumReport as u8);
                out.put_u32_le(m.check_id);
                out.put_u64_le(m.checksum);
                out.freeze()
            }
            Message::FullSyncRequest(m) => {
                Bytes::copy_from_slice(&[MsgId::FullSyncRequest as u8, m.reason as u8])
            }
        }
    }

    /// Decode a message. Payload slices share `data`'s allocation.
    pub fn decode(mut data: Bytes) -> Result<Message, ProtoError> {
        if data.is_empty() {
            return Err(ProtoError::Empty);
        }
        if data.len() > MAX_MESSAGE_SIZE {
            return Err(ProtoError::PayloadTooLarge(data.len()));
        }
        let raw_id = data.get_u8();
        let msg_id = MsgId::from_repr(raw_id).ok_or(ProtoError::UnknownMsgId(raw_id))?;

        let msg = match msg_id {
            MsgId::InitialSync => Message::InitialSync(InitialSync::decode_body(&mut data)?),
            MsgId::Resync => Message::Resync(Resync::decode_body(&mut data)?),
            MsgId::ConstData => Message::ConstData(ConstData::decode_body(&mut data)?),
            MsgId::ClientInputs => {
                let inputs = std::mem::take(&mut data);
                Message::ClientInputs(ClientInputs { data: inputs })
            }
            MsgId::InitialSyncAck => Message::InitialSyncAck,
            MsgId::SyncCheck => Message::SyncCheck(SyncCheck {
                check_id: take_u32(&mut data)?,
            }),
            MsgId::ChecksumReport => {
                let check_id = take_u32(&mut data)?;
                if data.remaining() < 8 {
                    return Err(ProtoError::TooShort);
                }
                Message::ChecksumReport(ChecksumReport {
                    check_id,
                    checksum: data.get_u64_le(),
                })
            }
            MsgId::FullSyncRequest => {
                if !data.has_remaining() {
                    return Err(ProtoError::TooShort);
                }
                Message::FullSyncRequest(FullSyncRequest {
                    reason: FullSyncReason::from_wire(data.get_u8()),
                })
            }
        };

        if data.has_remaining() {
            return Err(ProtoError::TrailingBytes(data.remaining()));
        }
        Ok(msg)
    }
}

pub(crate) fn take_u32(buf: &mut Bytes) -> Result<u32, ProtoError> {
    if buf.remaining() < 4 {
        return Err(ProtoError::TooShort);
    }
    Ok(buf.get_u32_le())
}

pub(crate) fn take_i32(buf: &mut Bytes) -> Result<i32, ProtoError> {
    if buf.remaining() < 4 {
        return Err(ProtoError::TooShort);
    }
    Ok(buf.get_i32_le())
}

/// Read an `int32` length and validate it against `max`.
pub(crate) fn take_len(buf: &mut Bytes, max: usize) -> Result<usize, ProtoError> {
    let raw = take_i32(buf)?;
    if raw < 0 {
        return Err(ProtoError::NegativeLength(raw));
    }
    let len = raw as usize;
    if len > max {
        return Err(ProtoError::PayloadTooLarge(len));
    }
    Ok(len)
}

pub(crate) fn take_bytes(buf: &mut Bytes, len: usize) -> Result<Bytes, ProtoError> {
    if buf.remaining() < len {
        return Err(ProtoError::TooShort);
    }
    Ok(buf.split_to(len))
}

pub(crate) fn take_block(buf: &mut Bytes) -> Result<Bytes, ProtoError> {
    let len = take_len(buf, MAX_UNCOMPRESSED_SIZE)?;
    take_bytes(buf, len)
}
