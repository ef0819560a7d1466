//! Sync and transport error types.

use thiserror::Error;

use crate::transport::PeerId;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("block registration is closed once synchronization has started")]
    RegistrationClosed,

    #[error("block size {0} exceeds the protocol limit")]
    BlockTooLarge(usize),

    #[error("registered blocks need a {size}-byte delta stream, limit is {limit}")]
    FamilyTooLarge { size: usize, limit: usize },

    #[error("block index {0} out of range")]
    BlockIndexOutOfRange(usize),

    #[error("block layout mismatch: {0}")]
    LayoutMismatch(String),

    #[error("no initial sync received yet")]
    NotInitialized,

    #[error("not connected")]
    NotConnected,

    #[error("protocol error: {0}")]
    Protocol(#[from] blocksync_proto::error::ProtoError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("unknown peer {0}")]
    UnknownPeer(PeerId),

    #[error("outbound queue full for peer {0}")]
    QueueFull(PeerId),

    #[error("transport closed")]
    Closed,

    #[error("protocol error: {0}")]
    Protocol(#[from] blocksync_proto::error::ProtoError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
