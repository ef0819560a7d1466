use bytes::{BufMut, Bytes, BytesMut};

use crate::msg_id::MsgId;

/// Serialized input produced by a client, opaque to the sync layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInputs {
    pub data: Bytes,
}

impl ClientInputs {
    pub(crate) fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(1 + self.data.len());
        out.put_u8(MsgId::ClientInputs as u8);
        out.put_slice(&self.data);
        out.freeze()
    }
}
