//! Authoritative side: session manager and sync broadcaster.
//!
//! Lock order is `blocks` before `sessions`. Everything that touches the block
//! family (initial sync, delta tick, const append) holds the `blocks` lock for
//! the whole operation, sends included, so the per-peer order of sync messages
//! always matches the order in which the family changed.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use blocksync_proto::channel::{SendOptions, default_send_options};
use blocksync_proto::compress::compress;
use blocksync_proto::error::ProtoError;
use blocksync_proto::limits::MAX_UNCOMPRESSED_SIZE;
use blocksync_proto::messages::{
    ChecksumReport, ConstData, InitialSync, Message, Resync, SyncCheck,
};
use blocksync_proto::msg_id::MsgId;
use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::block::{BlockHandle, SharedRegion};
use crate::config::ServerConfig;
use crate::delta::{TickChecksums, compute_delta, state_checksum};
use crate::error::SyncError;
use crate::registry::BlockSet;
use crate::session::{InputPush, SessionState, SessionTable};
use crate::transport::{PeerId, Target, Transport, TransportEvent};

/// Outcome of one [`Server::sync`] tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub tick: u64,
    pub dirty_blocks: usize,
    pub bytes_synced: usize,
    /// Size of the delta stream before deflate (0 when nothing changed).
    pub uncompressed_size: usize,
    pub compressed_size: usize,
    pub checksums: TickChecksums,
    /// Whether a RESYNC went out this tick.
    pub sent: bool,
    /// Id of the SYNC_CHECK broadcast this tick, if any.
    pub check_id: Option<u32>,
}

struct ServerBlocks {
    set: BlockSet,
    tick: u64,
    next_check_id: u32,
    /// `(check_id, checksum)` of recent consistency checks, oldest first.
    checks: VecDeque<(u32, u64)>,
    /// Set when a tick advanced the baseline without reaching the clients.
    needs_full_resync: bool,
}

pub struct Server {
    transport: Arc<dyn Transport>,
    config: ServerConfig,
    blocks: Mutex<ServerBlocks>,
    sessions: Mutex<SessionTable>,
}

impl Server {
    pub fn new(transport: Arc<dyn Transport>, config: ServerConfig) -> Self {
        let sessions = SessionTable::with_input_limit(config.input_queue_limit);
        Self {
            transport,
            config,
            blocks: Mutex::new(ServerBlocks {
                set: BlockSet::new(),
                tick: 0,
                next_check_id: 0,
                checks: VecDeque::new(),
                needs_full_resync: false,
            }),
            sessions: Mutex::new(sessions),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Register a zero-initialized block owned by the server.
    pub fn create_memory_block(&self, size: usize) -> Result<BlockHandle, SyncError> {
        self.blocks.lock().set.create_memory_block(size)
    }

    /// Register emulator memory. The emulator keeps writing through its own
    /// clone of `region`.
    pub fn create_shared_memory_block(
        &self,
        region: SharedRegion,
    ) -> Result<BlockHandle, SyncError> {
        self.blocks.lock().set.create_shared_memory_block(region)
    }

    /// Mutate a live block under the family lock.
    pub fn with_block_mut<R>(
        &self,
        index: usize,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R, SyncError> {
        let mut blocks = self.blocks.lock();
        let block = blocks
            .set
            .block_mut(index)
            .ok_or(SyncError::BlockIndexOutOfRange(index))?;
        let mut guard = block.write();
        Ok(f(&mut guard))
    }

    pub fn copy_block(&self, index: usize) -> Option<Vec<u8>> {
        let blocks = self.blocks.lock();
        blocks.set.block(index).map(|b| b.read().to_vec())
    }

    pub fn copy_stale_block(&self, index: usize) -> Option<Vec<u8>> {
        self.blocks.lock().set.stale(index).map(<[u8]>::to_vec)
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.lock().set.len()
    }

    pub fn block_len(&self, index: usize) -> Option<usize> {
        self.blocks.lock().set.block_len(index)
    }

    pub fn num_const_blocks(&self) -> usize {
        self.blocks.lock().set.consts().len()
    }

    pub fn const_block(&self, index: usize) -> Option<Bytes> {
        self.blocks.lock().set.consts().get(index).cloned()
    }

    /// Checksum of the live blocks, comparable with [`crate::Client::state_checksum`].
    pub fn state_checksum(&self) -> u64 {
        let blocks = self.blocks.lock();
        let guards: Vec<_> = (0..blocks.set.len())
            .filter_map(|i| blocks.set.block(i).map(|b| b.read()))
            .collect();
        state_checksum(guards.iter().map(|g| &**g))
    }

    /// Ticks completed so far.
    pub fn tick(&self) -> u64 {
        self.blocks.lock().tick
    }

    /// Number of session slots, free ones included.
    pub fn num_sessions(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn num_connected(&self) -> usize {
        self.sessions.lock().connected().count()
    }

    pub fn session_state(&self, slot: usize) -> Option<SessionState> {
        self.sessions.lock().get(slot).map(|s| s.state)
    }

    pub fn session_peer(&self, slot: usize) -> Option<PeerId> {
        self.sessions.lock().get(slot).and_then(|s| s.peer)
    }

    pub fn session_slot(&self, peer: PeerId) -> Option<usize> {
        self.sessions.lock().index_of(peer)
    }

    /// Oldest buffered input of the session in `slot`.
    pub fn pop_input_buffer(&self, slot: usize) -> Option<Bytes> {
        self.sessions.lock().pop_input(slot)
    }

    /// Wait up to `timeout` for a transport event, then drain whatever else is
    /// queued. Returns the number of events handled.
    pub fn update(&self, timeout: Duration) -> usize {
        let mut handled = 0;
        if let Some(event) = self.transport.recv_timeout(timeout) {
            self.handle_event(event);
            handled += 1;
            while let Some(event) = self.transport.try_recv() {
                self.handle_event(event);
                handled += 1;
            }
        }

        if std::mem::take(&mut self.blocks.lock().needs_full_resync) {
            warn!("forcing full re-sync of every session");
            self.broadcast_initial_sync();
        }
        handled
    }

    /// Send the current stale snapshot plus every held const block to `peer`.
    pub fn initial_sync(&self, peer: PeerId) -> Result<(), SyncError> {
        let mut blocks = self.blocks.lock();
        blocks.set.seal();

        let payload = encode_initial_sync(&blocks.set);
        let size = payload.len();
        self.transport.send(
            Target::Peer(peer),
            payload,
            default_send_options(MsgId::InitialSync),
        )?;
        self.sessions
            .lock()
            .set_state(peer, SessionState::AwaitingInitialSyncAck);
        info!(
            peer,
            size,
            blocks = blocks.set.len(),
            consts = blocks.set.consts().len(),
            "initial sync sent"
        );
        Ok(())
    }

    /// Run one delta tick and broadcast the result.
    ///
    /// The stale baseline advances even when nothing is sent, and ticks
    /// without changes cost no bandwidth.
    pub fn sync(&self) -> SyncReport {
        let mut blocks = self.blocks.lock();
        blocks.set.seal();
        blocks.tick += 1;

        let frame = compute_delta(&mut blocks.set);
        let mut report = SyncReport {
            tick: blocks.tick,
            dirty_blocks: frame.dirty_blocks,
            bytes_synced: frame.bytes_synced,
            checksums: frame.checksums,
            ..SyncReport::default()
        };
        debug!(
            tick = report.tick,
            live = frame.checksums.live,
            xor = frame.checksums.xor,
            stale = frame.checksums.stale,
            dirty = frame.dirty_blocks,
            "sync tick"
        );

        if let Some(stream) = frame.stream {
            report.uncompressed_size = stream.len();
            match compress(&stream) {
                Ok(compressed) => {
                    report.compressed_size = compressed.len();
                    let msg = Message::Resync(Resync {
                        uncompressed_size: stream.len(),
                        compressed: Bytes::from(compressed),
                    });
                    let mut options = default_send_options(MsgId::Resync);
                    options.reliability = self.config.resync_reliability;
                    self.send_to_synced(msg.encode(), options);
                    report.sent = true;
                    debug!(
                        tick = report.tick,
                        bytes = report.bytes_synced,
                        uncompressed = report.uncompressed_size,
                        compressed = report.compressed_size,
                        "resync broadcast"
                    );
                }
                Err(e) => {
                    // The baseline already moved, so the diff is lost for good.
                    error!(tick = report.tick, error = %e, "failed to compress delta, skipping tick");
                    blocks.needs_full_resync = true;
                }
            }
        }

        let interval = u64::from(self.config.sync_check_interval);
        if interval > 0 && blocks.tick % interval == 0 {
            let check_id = blocks.next_check_id;
            blocks.next_check_id = blocks.next_check_id.wrapping_add(1);
            let checksum = state_checksum(blocks.set.stale_blocks());
            blocks.checks.push_back((check_id, checksum));
            while blocks.checks.len() > self.config.check_history.max(1) {
                blocks.checks.pop_front();
            }

            let msg = Message::SyncCheck(SyncCheck { check_id });
            self.send_to_synced(msg.encode(), default_send_options(MsgId::SyncCheck));
            report.check_id = Some(check_id);
            debug!(check_id, checksum, "sync check broadcast");
        }

        report
    }

    /// Append a const block and push it unreliably to every synced client.
    ///
    /// Returns the block's index in the const ring.
    pub fn add_const_block(&self, data: impl Into<Bytes>) -> Result<usize, SyncError> {
        let data: Bytes = data.into();
        if data.len() > MAX_UNCOMPRESSED_SIZE {
            return Err(SyncError::BlockTooLarge(data.len()));
        }

        let mut blocks = self.blocks.lock();
        let compressed = compress(&data);
        let original_size = data.len();
        if let Some(evicted) = blocks.set.push_const(data) {
            debug!(size = evicted.len(), "const ring full, evicted oldest block");
        }
        let index = blocks.set.consts().len() - 1;

        match compressed {
            Ok(compressed) => {
                let msg = Message::ConstData(ConstData {
                    original_size,
                    compressed: Bytes::from(compressed),
                });
                self.send_to_synced(msg.encode(), default_send_options(MsgId::ConstData));
            }
            // Late joiners still get it through the initial sync.
            Err(e) => error!(error = %e, "failed to compress const block, not sending"),
        }
        Ok(index)
    }

    /// Tear down the transport and free every session slot.
    pub fn shutdown(&self) {
        self.transport.shutdown();
        let mut sessions = self.sessions.lock();
        let peers: Vec<PeerId> = sessions.connected().map(|(_, peer)| peer).collect();
        for peer in peers {
            sessions.release(peer);
        }
        info!("server shut down");
    }

    fn handle_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::NewIncomingConnection(peer) => {
                let slot = self.sessions.lock().assign(peer);
                info!(peer, slot, "client connected");
                if let Err(e) = self.initial_sync(peer) {
                    warn!(peer, error = %e, "initial sync failed");
                }
            }
            TransportEvent::Disconnected(peer) | TransportEvent::ConnectionLost(peer) => {
                match self.sessions.lock().release(peer) {
                    Some(slot) => info!(peer, slot, "client disconnected"),
                    None => debug!(peer, "disconnect for unknown peer"),
                }
            }
            TransportEvent::IncompatibleProtocol {
                peer,
                remote_version,
            } => {
                warn!(peer, remote_version, "client uses an incompatible protocol version");
            }
            TransportEvent::ConnectionAccepted(peer)
            | TransportEvent::ConnectionRejected { peer, .. } => {
                debug!(peer, "ignoring client-side transport event");
            }
            TransportEvent::Packet { peer, data } => self.handle_packet(peer, data),
        }
    }

    fn handle_packet(&self, peer: PeerId, data: Bytes) {
        let msg = match Message::decode(data) {
            Ok(msg) => msg,
            Err(ProtoError::UnknownMsgId(id)) => {
                warn!(peer, id, "unknown packet id, ignoring");
                return;
            }
            Err(e) => {
                warn!(peer, error = %e, "malformed packet, ignoring");
                return;
            }
        };

        match msg {
            Message::ClientInputs(inputs) => {
                match self.sessions.lock().push_input(peer, inputs.data) {
                    InputPush::Queued => {}
                    InputPush::Overflowed => {
                        warn!(peer, "input queue full, dropped oldest input");
                    }
                    InputPush::UnknownPeer => warn!(peer, "inputs from unknown peer dropped"),
                }
            }
            Message::InitialSyncAck => {
                if let Some(slot) = self.sessions.lock().set_state(peer, SessionState::Active) {
                    debug!(peer, slot, "session active");
                }
            }
            Message::ChecksumReport(report) => self.handle_checksum_report(peer, report),
            Message::FullSyncRequest(req) => {
                warn!(peer, reason = ?req.reason, "client requested full re-sync");
                if let Err(e) = self.initial_sync(peer) {
                    warn!(peer, error = %e, "full re-sync failed");
                }
            }
            other => {
                warn!(peer, msg_id = ?other.msg_id(), "unexpected message from client, ignoring");
            }
        }
    }

    fn handle_checksum_report(&self, peer: PeerId, report: ChecksumReport) {
        let expected = {
            let blocks = self.blocks.lock();
            blocks
                .checks
                .iter()
                .find(|(id, _)| *id == report.check_id)
                .map(|&(_, checksum)| checksum)
        };

        match expected {
            Some(expected) if expected == report.checksum => {
                debug!(peer, check_id = report.check_id, "client in sync");
            }
            Some(expected) => {
                warn!(
                    peer,
                    check_id = report.check_id,
                    expected,
                    reported = report.checksum,
                    "client desynchronized, sending full re-sync"
                );
                if let Err(e) = self.initial_sync(peer) {
                    warn!(peer, error = %e, "full re-sync failed");
                }
            }
            None => debug!(peer, check_id = report.check_id, "report for an expired check"),
        }
    }

    fn broadcast_initial_sync(&self) {
        let blocks = self.blocks.lock();
        let payload = encode_initial_sync(&blocks.set);
        let mut sessions = self.sessions.lock();
        let peers: Vec<PeerId> = sessions.synced().map(|(_, peer)| peer).collect();
        for peer in peers {
            match self.transport.send(
                Target::Peer(peer),
                payload.clone(),
                default_send_options(MsgId::InitialSync),
            ) {
                Ok(()) => {
                    sessions.set_state(peer, SessionState::AwaitingInitialSyncAck);
                }
                Err(e) => warn!(peer, error = %e, "full re-sync failed"),
            }
        }
    }

    /// Send to every session that already received an INITIAL_SYNC. Newer
    /// sessions pick the change up from their own snapshot.
    fn send_to_synced(&self, payload: Bytes, options: SendOptions) {
        let sessions = self.sessions.lock();
        for (slot, peer) in sessions.synced() {
            if let Err(e) = self.transport.send(Target::Peer(peer), payload.clone(), options) {
                warn!(peer, slot, error = %e, "send failed");
            }
        }
    }
}

fn encode_initial_sync(set: &BlockSet) -> Bytes {
    InitialSync::encode_parts(set.stale_blocks(), set.consts().iter().map(|b| &b[..]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{Client, ClientState};
    use crate::config::ClientConfig;
    use crate::transport::LoopbackHub;

    const TICK: Duration = Duration::from_millis(5);

    fn pump(server: &Server, client: &Client) {
        for _ in 0..8 {
            server.update(TICK);
            client.update(TICK);
        }
    }

    #[test]
    fn lost_tick_forces_full_resync_on_next_update() {
        let hub = LoopbackHub::new();
        let server = Server::new(Arc::new(hub.server()), ServerConfig::default());
        server.create_memory_block(4).expect("register");
        let client = Client::new(
            Arc::new(hub.connect().expect("connect")),
            ClientConfig::default(),
        );
        pump(&server, &client);
        assert_eq!(server.session_state(0), Some(SessionState::Active));

        server
            .with_block_mut(0, |buf| buf.copy_from_slice(&[1, 2, 3, 4]))
            .expect("write");
        // Same state a failed compression leaves behind: baseline moved, nothing sent.
        {
            let mut blocks = server.blocks.lock();
            let frame = compute_delta(&mut blocks.set);
            assert_eq!(frame.dirty_blocks, 1);
            blocks.needs_full_resync = true;
        }

        server.update(TICK);
        assert!(!server.blocks.lock().needs_full_resync);
        assert_eq!(
            server.session_state(0),
            Some(SessionState::AwaitingInitialSyncAck)
        );

        pump(&server, &client);
        assert_eq!(client.state(), ClientState::Synced);
        assert_eq!(client.copy_block(0), Some(vec![1, 2, 3, 4]));
        assert_eq!(server.session_state(0), Some(SessionState::Active));
        assert!(client.check_match(&server).is_empty());
    }

    #[test]
    fn input_flood_keeps_only_the_newest() {
        let hub = LoopbackHub::new();
        let config = ServerConfig {
            input_queue_limit: 2,
            ..ServerConfig::default()
        };
        let server = Server::new(Arc::new(hub.server()), config);
        server.create_memory_block(1).expect("register");
        let client = Client::new(
            Arc::new(hub.connect().expect("connect")),
            ClientConfig::default(),
        );
        pump(&server, &client);

        for input in [&b"1"[..], &b"2"[..], &b"3"[..]] {
            client.send_inputs(input).expect("send");
        }
        pump(&server, &client);

        assert_eq!(server.pop_input_buffer(0).as_deref(), Some(&b"2"[..]));
        assert_eq!(server.pop_input_buffer(0).as_deref(), Some(&b"3"[..]));
        assert_eq!(server.pop_input_buffer(0), None);
    }

    #[test]
    fn oversized_const_block_is_refused() {
        let hub = LoopbackHub::new();
        let server = Server::new(Arc::new(hub.server()), ServerConfig::default());
        let too_big = Bytes::from(vec![0u8; MAX_UNCOMPRESSED_SIZE + 1]);
        assert!(matches!(
            server.add_const_block(too_big),
            Err(SyncError::BlockTooLarge(_))
        ));
        assert_eq!(server.num_const_blocks(), 0);
    }
}
