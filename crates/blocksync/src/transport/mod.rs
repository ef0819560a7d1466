//! Transport adapter.
//!
//! Both roles talk to the network through [`Transport`]: fire-and-forget
//! sends tagged with [`SendOptions`], and a blocking event receive with a
//! timeout in place of a polling loop.
//!
//! Implementations must deliver messages sent on the same
//! [`OrderingChannel`](blocksync_proto::channel::OrderingChannel) to a peer in
//! send order. Priority may only reorder messages across channels.

use std::time::Duration;

use blocksync_proto::channel::SendOptions;
use bytes::Bytes;

use crate::error::TransportError;

pub mod loopback;
pub mod tcp;

pub use loopback::{LoopbackHub, LoopbackTransport};
pub use tcp::{TcpConfig, TcpTransport};

/// Network identity of a connection. Clients see the server as
/// [`SERVER_PEER_ID`](blocksync_proto::constants::SERVER_PEER_ID).
pub type PeerId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Peer(PeerId),
    Broadcast,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Server side: a client completed the handshake.
    NewIncomingConnection(PeerId),
    /// Client side: the server accepted us.
    ConnectionAccepted(PeerId),
    /// The remote end closed the connection gracefully.
    Disconnected(PeerId),
    /// The connection died (I/O error, timeout, overflow).
    ConnectionLost(PeerId),
    /// The remote end speaks another protocol version.
    IncompatibleProtocol { peer: PeerId, remote_version: u8 },
    /// Client side: the server refused the connection.
    ConnectionRejected { peer: PeerId, reason: String },
    Packet { peer: PeerId, data: Bytes },
}

pub trait Transport: Send + Sync {
    /// Queue `data` for delivery. Never blocks on the network.
    fn send(&self, target: Target, data: Bytes, options: SendOptions)
    -> Result<(), TransportError>;

    /// Wait up to `timeout` for the next event.
    fn recv_timeout(&self, timeout: Duration) -> Option<TransportEvent>;

    fn try_recv(&self) -> Option<TransportEvent>;

    /// Close every connection. Remote peers observe a disconnect.
    fn shutdown(&self);
}
