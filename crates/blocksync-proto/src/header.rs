use bitflags::bitflags;
use strum::FromRepr;

use crate::{
    channel::{OrderingChannel, Priority, Reliability, SendOptions},
    constants::{HEADER_LEN, MAGIC, VERSION},
    error::ProtoError,
};

/// Transport-level frame kind.
///
/// Only `Data` frames carry sync messages; the rest belong to the connection
/// lifecycle (handshake, keepalive, graceful close).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
pub enum FrameKind {
    Hello = 1,
    Welcome = 2,
    Reject = 3,
    Data = 4,
    Ping = 5,
    Goodbye = 6,
}

bitflags! {
    /// Delivery flags recorded on each data frame.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FrameFlags: u8 {
        const RELIABLE = 0b0000_0001;
        const SEQUENCED = 0b0000_0010;
        const HIGH_PRIORITY = 0b0000_0100;
    }
}

impl FrameFlags {
    pub fn from_options(opts: &SendOptions) -> Self {
        let mut flags = match opts.reliability {
            Reliability::ReliableOrdered => FrameFlags::RELIABLE,
            Reliability::UnreliableSequenced => FrameFlags::SEQUENCED,
            Reliability::Unreliable => FrameFlags::empty(),
        };
        if opts.priority == Priority::High {
            flags |= FrameFlags::HIGH_PRIORITY;
        }
        flags
    }
}

/// Transport frame header (wire format).
///
/// Encoding rules:
/// - Fixed size: exactly `HEADER_LEN` bytes.
/// - Integer fields are little-endian.
/// - Layout is defined by `encode_into()` / `decode()` offsets below.
///
/// Decode rules:
/// - Requires `buf.len() >= HEADER_LEN`.
/// - Requires `buf[0..2] == MAGIC` and `version == VERSION`.
/// - Requires a known frame kind and ordering channel.
/// - Requires `buf.len() == HEADER_LEN + payload_len`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Wire-format version. `decode()` rejects versions != `VERSION`.
    pub version: u8,
    pub kind: FrameKind,
    /// Ordering domain of the payload. Lifecycle frames use `Control`.
    pub channel: OrderingChannel,
    pub flags: FrameFlags,
    /// Payload length in bytes. `decode()` requires `buf.len() == HEADER_LEN + payload_len`.
    pub payload_len: u32,
}

impl Header {
    /// Header size in bytes for the current wire layout.
    pub const LEN: usize = HEADER_LEN;

    /// Create a lifecycle header of the given kind on the control channel.
    pub fn new(kind: FrameKind) -> Self {
        Self {
            version: VERSION,
            kind,
            channel: OrderingChannel::Control,
            flags: FrameFlags::RELIABLE | FrameFlags::HIGH_PRIORITY,
            payload_len: 0,
        }
    }

    /// Create a data header carrying the given delivery options.
    pub fn data(opts: &SendOptions) -> Self {
        Self {
            version: VERSION,
            kind: FrameKind::Data,
            channel: opts.channel,
            flags: FrameFlags::from_options(opts),
            payload_len: 0,
        }
    }

    /// Recover the send options recorded in a data header.
    pub fn send_options(&self) -> SendOptions {
        let reliability = if self.flags.contains(FrameFlags::RELIABLE) {
            Reliability::ReliableOrdered
        } else if self.flags.contains(FrameFlags::SEQUENCED) {
            Reliability::UnreliableSequenced
        } else {
            Reliability::Unreliable
        };
        let priority = if self.flags.contains(FrameFlags::HIGH_PRIORITY) {
            Priority::High
        } else {
            Priority::Low
        };
        SendOptions::new(priority, reliability, self.channel)
    }

    /// Encode this header into `out` using the current fixed wire layout.
    ///
    /// Offsets (bytes):
    /// - 0..2   magic
    /// - 2      version
    /// - 3      kind
    /// - 4      channel
    /// - 5      flags
    /// - 6..10  payload_len (u32 LE)
    pub fn encode_into(&self, out: &mut [u8; HEADER_LEN]) {
        out[0..2].copy_from_slice(&MAGIC);
        out[2] = self.version;
        out[3] = self.kind as u8;
        out[4] = self.channel as u8;
        out[5] = self.flags.bits();
        out[6..10].copy_from_slice(&self.payload_len.to_le_bytes());
    }

    /// Decode a frame buffer that contains exactly `[Header][Payload]`.
    pub fn decode(buf: &[u8]) -> Result<(Header, &[u8]), ProtoError> {
        if buf.len() < HEADER_LEN {
            return Err(ProtoError::TooShort);
        }
        if buf[0..2] != MAGIC {
            return Err(ProtoError::BadMagic);
        }

        let version = buf[2];
        if version != VERSION {
            return Err(ProtoError::UnsupportedVersion(version));
        }

        let kind = FrameKind::from_repr(buf[3]).ok_or(ProtoError::UnknownFrameKind(buf[3]))?;
        let channel =
            OrderingChannel::from_repr(buf[4]).ok_or(ProtoError::UnknownChannel(buf[4]))?;
        let flags = FrameFlags::from_bits_truncate(buf[5]);
        let payload_len = read_u32_le(buf, 6)?;

        if buf.len() != HEADER_LEN + payload_len as usize {
            return Err(ProtoError::LengthMismatch);
        }

        let h = Header {
            version,
            kind,
            channel,
            flags,
            payload_len,
        };

        Ok((h, &buf[HEADER_LEN..]))
    }
}

fn read_u32_le(buf: &[u8], start: usize) -> Result<u32, ProtoError> {
    let bytes: [u8; 4] = buf
        .get(start..start + 4)
        .ok_or(ProtoError::TooShort)?
        .try_into()
        .map_err(|_| ProtoError::TooShort)?;
    Ok(u32::from_le_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::default_send_options;
    use crate::msg_id::MsgId;

    #[test]
    fn header_len_is_locked() {
        assert_eq!(Header::LEN, HEADER_LEN);
        assert_eq!(Header::LEN, 10);
    }

    #[test]
    fn header_encode_offsets_are_locked() {
        let mut h = Header::data(&default_send_options(MsgId::Resync));
        h.payload_len = 0x11223344;

        let mut buf = [0u8; HEADER_LEN];
        h.encode_into(&mut buf);

        assert_eq!(&buf[0..2], &MAGIC);
        assert_eq!(buf[2], VERSION);
        assert_eq!(buf[3], FrameKind::Data as u8);
        assert_eq!(buf[4], OrderingChannel::Sync as u8);
        assert_eq!(buf[5], FrameFlags::RELIABLE.bits());
        assert_eq!(
            u32::from_le_bytes(buf[6..10].try_into().unwrap()),
            0x11223344
        );
    }

    #[test]
    fn header_decode_requires_exact_total_length() {
        let mut h = Header::new(FrameKind::Ping);
        h.payload_len = 3;

        let mut packet = vec![0u8; HEADER_LEN + 3];
        let mut hbuf = [0u8; HEADER_LEN];
        h.encode_into(&mut hbuf);

        packet[..HEADER_LEN].copy_from_slice(&hbuf);
        packet[HEADER_LEN..].copy_from_slice(&[1, 2, 3]);

        let (decoded, payload) = Header::decode(&packet).unwrap();
        assert_eq!(decoded, h);
        assert_eq!(payload, &[1, 2, 3]);

        let mut too_long = packet.clone();
        too_long.push(9);
        assert!(Header::decode(&too_long).is_err());

        let too_short = &packet[..packet.len() - 1];
        assert!(Header::decode(too_short).is_err());
    }

    #[test]
    fn send_options_survive_the_header() {
        let opts = default_send_options(MsgId::ConstData);
        let h = Header::data(&opts);
        assert_eq!(h.send_options(), opts);

        let opts = default_send_options(MsgId::InitialSync);
        assert_eq!(Header::data(&opts).send_options(), opts);
    }

    #[test]
    fn decode_rejects_unknown_kind() {
        let mut buf = [0u8; HEADER_LEN];
        Header::new(FrameKind::Ping).encode_into(&mut buf);
        buf[3] = 0xEE;
        assert!(matches!(
            Header::decode(&buf),
            Err(ProtoError::UnknownFrameKind(0xEE))
        ));
    }
}
