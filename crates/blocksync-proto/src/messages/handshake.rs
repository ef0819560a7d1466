//! Transport handshake, exchanged in lifecycle frames before any sync message.

use serde::{Deserialize, Serialize};

/// First frame a client sends after the TCP connection is established.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    pub protocol_version: u8,
    pub password: String,
}

/// Connection accepted; `peer_id` is the identity the server knows this client by.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Welcome {
    pub peer_id: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    IncompatibleProtocol { server_version: u8 },
    InvalidPassword,
    ServerFull,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reject {
    pub reason: RejectReason,
}
