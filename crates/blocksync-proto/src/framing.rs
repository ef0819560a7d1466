use bytes::{Buf, Bytes, BytesMut};

use crate::codec_tcp::try_decode_tcp_frames;
use crate::error::ProtoError;
use crate::header::{FrameKind, Header};

/// A single decoded frame that owns its payload bytes.
/// This is safe to move across tasks/channels.
#[derive(Debug, Clone)]
pub struct FrameOwned {
    pub header: Header,
    pub payload: Bytes,
}

impl FrameOwned {
    pub fn kind(&self) -> FrameKind {
        self.header.kind
    }
}

/// A small TCP framing helper:
/// - keeps an internal receive buffer (`BytesMut`)
/// - decodes as many frames as possible
/// - returns owned frames + keeps the remaining bytes for the next read
pub struct TcpFramer {
    buf: BytesMut,
}

impl TcpFramer {
    /// Create a framer with an initial buffer capacity.
    pub fn new(initial_capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(initial_capacity),
        }
    }

    /// Get mutable access to the internal buffer for socket reads.
    ///
    /// Typical usage:
    /// - `framer.buf_mut().reserve(n)`
    /// - `socket.read_buf(framer.buf_mut()).await?`
    pub fn buf_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// Number of buffered bytes not yet decoded.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Try to decode as many frames as possible from the current buffer.
    ///
    /// Decoded bytes are consumed from the internal buffer.
    pub fn drain_frames(&mut self) -> Result<Vec<FrameOwned>, ProtoError> {
        let (views, consumed) = try_decode_tcp_frames(&self.buf)?;

        // Payloads are copied so they outlive the receive buffer.
        let mut out = Vec::with_capacity(views.len());
        for v in views {
            out.push(FrameOwned {
                header: v.header,
                payload: Bytes::copy_from_slice(v.payload),
            });
        }
        self.buf.advance(consumed);

        Ok(out)
    }
}
