//! In-process transport over crossbeam channels.
//!
//! One hub connects a single server endpoint with any number of client
//! endpoints. Delivery is FIFO per endpoint, which satisfies the per-channel
//! ordering contract. Loss can be simulated by dropping unreliable sends or
//! severing a link.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use blocksync_proto::channel::SendOptions;
use blocksync_proto::constants::SERVER_PEER_ID;
use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::Mutex;
use tracing::debug;

use super::{PeerId, Target, Transport, TransportEvent};
use crate::error::TransportError;

#[derive(Default)]
struct HubInner {
    server: Option<Sender<TransportEvent>>,
    clients: BTreeMap<PeerId, Sender<TransportEvent>>,
    next_peer: PeerId,
    drop_unreliable: bool,
}

#[derive(Clone, Default)]
pub struct LoopbackHub {
    inner: Arc<Mutex<HubInner>>,
}

impl LoopbackHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the server endpoint. A hub has at most one; calling this again
    /// replaces the previous endpoint.
    pub fn server(&self) -> LoopbackTransport {
        let (tx, rx) = unbounded();
        self.inner.lock().server = Some(tx);
        LoopbackTransport {
            hub: self.clone(),
            role: Role::Server,
            rx,
            closed: AtomicBool::new(false),
        }
    }

    /// Connect a new client endpoint to the server.
    pub fn connect(&self) -> Result<LoopbackTransport, TransportError> {
        let (tx, rx) = unbounded();
        let mut inner = self.inner.lock();
        let server = inner
            .server
            .clone()
            .ok_or_else(|| TransportError::ConnectionFailed("no loopback server".into()))?;

        inner.next_peer += 1;
        let peer = inner.next_peer;
        server
            .send(TransportEvent::NewIncomingConnection(peer))
            .map_err(|_| TransportError::ConnectionFailed("loopback server closed".into()))?;
        let _ = tx.send(TransportEvent::ConnectionAccepted(SERVER_PEER_ID));
        inner.clients.insert(peer, tx);
        debug!(peer, "loopback client connected");

        Ok(LoopbackTransport {
            hub: self.clone(),
            role: Role::Client(peer),
            rx,
            closed: AtomicBool::new(false),
        })
    }

    /// Silently discard every unreliable send from now on.
    pub fn set_drop_unreliable(&self, drop: bool) {
        self.inner.lock().drop_unreliable = drop;
    }

    /// Cut the link to `peer`; both ends observe `ConnectionLost`.
    pub fn sever(&self, peer: PeerId) {
        let mut inner = self.inner.lock();
        if let Some(client) = inner.clients.remove(&peer) {
            let _ = client.send(TransportEvent::ConnectionLost(SERVER_PEER_ID));
            if let Some(server) = &inner.server {
                let _ = server.send(TransportEvent::ConnectionLost(peer));
            }
        }
    }

    pub fn num_clients(&self) -> usize {
        self.inner.lock().clients.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Server,
    Client(PeerId),
}

pub struct LoopbackTransport {
    hub: LoopbackHub,
    role: Role,
    rx: Receiver<TransportEvent>,
    closed: AtomicBool,
}

impl LoopbackTransport {
    /// Our identity as seen by the other side.
    pub fn peer_id(&self) -> PeerId {
        match self.role {
            Role::Server => SERVER_PEER_ID,
            Role::Client(peer) => peer,
        }
    }
}

impl Transport for LoopbackTransport {
    fn send(
        &self,
        target: Target,
        data: Bytes,
        options: SendOptions,
    ) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let inner = self.hub.inner.lock();
        if inner.drop_unreliable && !options.is_reliable() {
            return Ok(());
        }

        match self.role {
            Role::Server => {
                let from = SERVER_PEER_ID;
                match target {
                    Target::Peer(peer) => {
                        let client = inner
                            .clients
                            .get(&peer)
                            .ok_or(TransportError::UnknownPeer(peer))?;
                        client
                            .send(TransportEvent::Packet { peer: from, data })
                            .map_err(|_| TransportError::UnknownPeer(peer))?;
                    }
                    Target::Broadcast => {
                        for client in inner.clients.values() {
                            let _ = client.send(TransportEvent::Packet {
                                peer: from,
                                data: data.clone(),
                            });
                        }
                    }
                }
            }
            Role::Client(me) => {
                if !inner.clients.contains_key(&me) {
                    return Err(TransportError::Closed);
                }
                let server = inner.server.as_ref().ok_or(TransportError::Closed)?;
                server
                    .send(TransportEvent::Packet { peer: me, data })
                    .map_err(|_| TransportError::Closed)?;
            }
        }
        Ok(())
    }

    fn recv_timeout(&self, timeout: Duration) -> Option<TransportEvent> {
        self.rx.recv_timeout(timeout).ok()
    }

    fn try_recv(&self) -> Option<TransportEvent> {
        self.rx.try_recv().ok()
    }

    fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut inner = self.hub.inner.lock();
        match self.role {
            Role::Server => {
                inner.server = None;
                for (_, client) in std::mem::take(&mut inner.clients) {
                    let _ = client.send(TransportEvent::Disconnected(SERVER_PEER_ID));
                }
            }
            Role::Client(me) => {
                if inner.clients.remove(&me).is_some()
                    && let Some(server) = &inner.server
                {
                    let _ = server.send(TransportEvent::Disconnected(me));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blocksync_proto::channel::{OrderingChannel, Priority, Reliability};

    const RELIABLE: SendOptions = SendOptions::new(
        Priority::High,
        Reliability::ReliableOrdered,
        OrderingChannel::Sync,
    );
    const UNRELIABLE: SendOptions = SendOptions::new(
        Priority::Low,
        Reliability::Unreliable,
        OrderingChannel::ConstData,
    );

    #[test]
    fn connect_announces_both_sides() {
        let hub = LoopbackHub::new();
        let server = hub.server();
        let client = hub.connect().expect("connect");

        assert_eq!(
            server.try_recv(),
            Some(TransportEvent::NewIncomingConnection(client.peer_id()))
        );
        assert_eq!(
            client.try_recv(),
            Some(TransportEvent::ConnectionAccepted(SERVER_PEER_ID))
        );
    }

    #[test]
    fn connect_without_server_fails() {
        let hub = LoopbackHub::new();
        assert!(hub.connect().is_err());
    }

    #[test]
    fn broadcast_reaches_every_client_in_order() {
        let hub = LoopbackHub::new();
        let server = hub.server();
        let a = hub.connect().expect("connect a");
        let b = hub.connect().expect("connect b");
        a.try_recv();
        b.try_recv();

        for n in 0u8..3 {
            server
                .send(Target::Broadcast, Bytes::from(vec![n]), RELIABLE)
                .expect("send");
        }
        for client in [&a, &b] {
            for n in 0u8..3 {
                assert_eq!(
                    client.try_recv(),
                    Some(TransportEvent::Packet {
                        peer: SERVER_PEER_ID,
                        data: Bytes::from(vec![n]),
                    })
                );
            }
        }
    }

    #[test]
    fn dropped_unreliable_and_severed_links() {
        let hub = LoopbackHub::new();
        let server = hub.server();
        let client = hub.connect().expect("connect");
        let peer = client.peer_id();
        server.try_recv();
        client.try_recv();

        hub.set_drop_unreliable(true);
        server
            .send(Target::Peer(peer), Bytes::from_static(b"c"), UNRELIABLE)
            .expect("send");
        assert_eq!(client.try_recv(), None);

        hub.sever(peer);
        assert_eq!(server.try_recv(), Some(TransportEvent::ConnectionLost(peer)));
        assert_eq!(
            client.try_recv(),
            Some(TransportEvent::ConnectionLost(SERVER_PEER_ID))
        );
        assert!(matches!(
            server.send(Target::Peer(peer), Bytes::new(), RELIABLE),
            Err(TransportError::UnknownPeer(_))
        ));
    }

    #[test]
    fn client_shutdown_notifies_server() {
        let hub = LoopbackHub::new();
        let server = hub.server();
        let client = hub.connect().expect("connect");
        server.try_recv();

        client.shutdown();
        assert_eq!(
            server.try_recv(),
            Some(TransportEvent::Disconnected(client.peer_id()))
        );
        assert_eq!(hub.num_clients(), 0);
    }
}
