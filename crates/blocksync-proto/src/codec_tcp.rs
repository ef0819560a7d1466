use crate::{
    constants::{HEADER_LEN, TCP_LEN_PREFIX},
    error::ProtoError,
    header::{FrameKind, Header},
    limits::{MAX_HANDSHAKE_PAYLOAD, MAX_TCP_FRAME},
    packet::FrameView,
};

/// Encode a TCP frame: `[u32 frame_len][Header][payload]`.
///
/// `header.payload_len` is overwritten with the actual payload length.
pub fn encode_tcp_frame(mut header: Header, payload: &[u8]) -> Result<Vec<u8>, ProtoError> {
    let frame_len = HEADER_LEN + payload.len();
    if frame_len > MAX_TCP_FRAME {
        return Err(ProtoError::FrameTooLarge(frame_len));
    }
    header.payload_len = payload.len() as u32;

    let mut out = Vec::with_capacity(TCP_LEN_PREFIX + frame_len);
    out.extend_from_slice(&(frame_len as u32).to_le_bytes());

    let mut hbuf = [0u8; HEADER_LEN];
    header.encode_into(&mut hbuf);
    out.extend_from_slice(&hbuf);
    out.extend_from_slice(payload);
    Ok(out)
}

/// Encode a lifecycle frame whose payload is a postcard-serialized handshake message.
pub fn encode_control_frame<T: serde::Serialize>(
    kind: FrameKind,
    payload: &T,
) -> Result<Vec<u8>, ProtoError> {
    let payload_bytes = postcard::to_stdvec(payload)?;
    if payload_bytes.len() > MAX_HANDSHAKE_PAYLOAD {
        return Err(ProtoError::PayloadTooLarge(payload_bytes.len()));
    }
    encode_tcp_frame(Header::new(kind), &payload_bytes)
}

/// Decode as many complete frames as `in_buf` holds.
///
/// Returns the decoded frames and the number of bytes consumed; a trailing
/// partial frame is left for the next read.
pub fn try_decode_tcp_frames(in_buf: &[u8]) -> Result<(Vec<FrameView<'_>>, usize), ProtoError> {
    let mut frames = Vec::new();
    let mut offset = 0usize;

    loop {
        if in_buf.len().saturating_sub(offset) < TCP_LEN_PREFIX {
            break;
        }
        let mut len_bytes = [0u8; TCP_LEN_PREFIX];
        len_bytes.copy_from_slice(&in_buf[offset..offset + TCP_LEN_PREFIX]);
        let frame_len = u32::from_le_bytes(len_bytes) as usize;

        if frame_len < HEADER_LEN {
            return Err(ProtoError::LengthMismatch);
        }
        if frame_len > MAX_TCP_FRAME {
            return Err(ProtoError::FrameTooLarge(frame_len));
        }

        let total_needed = TCP_LEN_PREFIX + frame_len;
        if in_buf.len().saturating_sub(offset) < total_needed {
            break;
        }

        let frame = &in_buf[offset + TCP_LEN_PREFIX..offset + total_needed];
        let (h, payload) = Header::decode(frame)?;

        frames.push(FrameView::new(h, payload));
        offset += total_needed;
    }

    Ok((frames, offset))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::handshake::Welcome;

    #[test]
    fn partial_frame_is_left_in_buffer() {
        let a = encode_tcp_frame(Header::new(FrameKind::Ping), &[]).unwrap();
        let b = encode_control_frame(FrameKind::Welcome, &Welcome { peer_id: 7 }).unwrap();

        let mut buf = a.clone();
        buf.extend_from_slice(&b[..b.len() - 1]);

        let (frames, consumed) = try_decode_tcp_frames(&buf).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].kind(), FrameKind::Ping);
        assert_eq!(consumed, a.len());
    }

    #[test]
    fn undersized_length_prefix_is_rejected() {
        let buf = [3u8, 0, 0, 0, 0, 0, 0];
        assert!(matches!(
            try_decode_tcp_frames(&buf),
            Err(ProtoError::LengthMismatch)
        ));
    }
}
