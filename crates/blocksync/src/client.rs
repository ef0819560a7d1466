//! Client reconciliation engine.
//!
//! Mirrors the server's blocks. An INITIAL_SYNC establishes the baseline, a
//! private copy of the last authoritative state. Every RESYNC XORs the server's
//! diffs into the baseline and then copies it over the mirrors, so bytes the
//! local emulator wrote in between never leak into the next state.
//!
//! ```text
//! Uninitialized -> LoadingInitialData -> Synced <-> Resyncing
//!                                          |
//!                                          v
//!                               Desynced (until the next INITIAL_SYNC)
//! ```
//! Any state moves to `Disconnected` when the transport goes away.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use blocksync_proto::channel::default_send_options;
use blocksync_proto::compress::decompress;
use blocksync_proto::constants::SERVER_PEER_ID;
use blocksync_proto::delta_stream::parse_delta_stream;
use blocksync_proto::error::ProtoError;
use blocksync_proto::messages::{
    ChecksumReport, ClientInputs, ConstData, FullSyncReason, FullSyncRequest, InitialSync,
    Message, Resync,
};
use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::block::{BlockHandle, MemoryBlock, SharedRegion};
use crate::config::ClientConfig;
use crate::const_blocks::ConstBlocks;
use crate::delta::{StateHasher, apply_xor};
use crate::error::SyncError;
use crate::server::Server;
use crate::transport::{Target, Transport, TransportEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientState {
    #[default]
    Uninitialized,
    LoadingInitialData,
    Synced,
    /// A RESYNC is being applied.
    Resyncing,
    /// Local state no longer follows the server; waiting for a fresh INITIAL_SYNC.
    Desynced,
    Disconnected,
}

#[derive(Default)]
struct ClientInner {
    state: ClientState,
    blocks: Vec<MemoryBlock>,
    /// Blocks were registered locally and fix the expected layout.
    preregistered: bool,
    /// At least one INITIAL_SYNC was loaded.
    initialized: bool,
    /// Last authoritative contents of each block, same indices as `blocks`.
    baseline: Vec<Box<[u8]>>,
    consts: ConstBlocks,
    /// Newest const block of the last snapshot. A forced re-sync can overtake a
    /// CONST_DATA still queued for the same block; that copy is dropped once.
    snapshot_tail: Option<Bytes>,
}

pub struct Client {
    transport: Arc<dyn Transport>,
    config: ClientConfig,
    inner: Mutex<ClientInner>,
    connected: AtomicBool,
}

impl Client {
    pub fn new(transport: Arc<dyn Transport>, config: ClientConfig) -> Self {
        Self {
            transport,
            config,
            inner: Mutex::new(ClientInner::default()),
            connected: AtomicBool::new(false),
        }
    }

    /// Pre-register an owned mirror block. Must happen before the first
    /// INITIAL_SYNC and in the same order as on the server.
    pub fn create_memory_block(&self, size: usize) -> Result<BlockHandle, SyncError> {
        self.register(MemoryBlock::owned(size))
    }

    /// Pre-register emulator memory so synchronized bytes land in it directly.
    pub fn create_shared_memory_block(
        &self,
        region: SharedRegion,
    ) -> Result<BlockHandle, SyncError> {
        self.register(MemoryBlock::Borrowed(region))
    }

    fn register(&self, block: MemoryBlock) -> Result<BlockHandle, SyncError> {
        let mut inner = self.inner.lock();
        if inner.initialized || inner.state != ClientState::Uninitialized {
            return Err(SyncError::RegistrationClosed);
        }
        let handle = BlockHandle {
            index: inner.blocks.len(),
            size: block.len(),
        };
        inner.blocks.push(block);
        inner.preregistered = true;
        Ok(handle)
    }

    pub fn state(&self) -> ClientState {
        self.inner.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Whether an INITIAL_SYNC has been loaded.
    pub fn is_init_complete(&self) -> bool {
        self.inner.lock().initialized
    }

    pub fn num_blocks(&self) -> usize {
        self.inner.lock().blocks.len()
    }

    pub fn block_len(&self, index: usize) -> Option<usize> {
        self.inner.lock().blocks.get(index).map(MemoryBlock::len)
    }

    /// Run `f` over a mirrored block.
    pub fn read_block<R>(&self, index: usize, f: impl FnOnce(&[u8]) -> R) -> Option<R> {
        let inner = self.inner.lock();
        let block = inner.blocks.get(index)?;
        let guard = block.read();
        Some(f(&guard))
    }

    pub fn copy_block(&self, index: usize) -> Option<Vec<u8>> {
        self.read_block(index, <[u8]>::to_vec)
    }

    pub fn num_const_blocks(&self) -> usize {
        self.inner.lock().consts.len()
    }

    pub fn const_block(&self, index: usize) -> Option<Bytes> {
        self.inner.lock().consts.get(index).cloned()
    }

    /// Checksum of the last authoritative state, as reported in CHECKSUM_REPORT.
    pub fn state_checksum(&self) -> u64 {
        let inner = self.inner.lock();
        let mut hasher = StateHasher::new();
        for block in &inner.baseline {
            hasher.update(block);
        }
        hasher.finish()
    }

    /// Discard local writes: copy the last authoritative state back over the
    /// mirrors. Returns how many blocks had drifted.
    pub fn revert(&self) -> Result<usize, SyncError> {
        let mut inner = self.inner.lock();
        if !inner.initialized {
            return Err(SyncError::NotInitialized);
        }
        let ClientInner {
            blocks, baseline, ..
        } = &mut *inner;
        Ok(restore(blocks, baseline))
    }

    /// Indices of mirrored blocks that differ from the server's live blocks.
    ///
    /// In-process diagnostic; a block missing on either side counts as a mismatch.
    pub fn check_match(&self, server: &Server) -> Vec<usize> {
        let count = self.num_blocks().max(server.num_blocks());
        (0..count)
            .filter(|&i| match (self.copy_block(i), server.copy_block(i)) {
                (Some(local), Some(remote)) => local != remote,
                _ => true,
            })
            .collect()
    }

    /// Queue serialized input for the server on the client-input channel.
    pub fn send_inputs(&self, data: impl Into<Bytes>) -> Result<(), SyncError> {
        if !self.is_connected() {
            return Err(SyncError::NotConnected);
        }
        let msg = Message::ClientInputs(ClientInputs { data: data.into() });
        self.send(msg)
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
        handled
    }

    /// Load a full snapshot.
    ///
    /// Without pre-registered blocks the first snapshot allocates the mirrors.
    /// Otherwise the snapshot must match the local layout exactly and is copied
    /// in place. Const blocks are replaced.
    pub fn load_initial_data(&self, msg: &InitialSync) -> Result<(), SyncError> {
        let mut inner = self.inner.lock();
        inner.state = ClientState::LoadingInitialData;

        let must_match = inner.preregistered || inner.initialized;
        if must_match {
            if let Err(e) = check_layout(&inner.blocks, &msg.blocks) {
                inner.state = ClientState::Desynced;
                return Err(e);
            }
        } else {
            inner.blocks = msg
                .blocks
                .iter()
                .map(|data| MemoryBlock::owned(data.len()))
                .collect();
        }

        for (block, data) in inner.blocks.iter_mut().zip(&msg.blocks) {
            block.write().copy_from_slice(data);
        }
        inner.baseline = msg
            .blocks
            .iter()
            .map(|data| data.to_vec().into_boxed_slice())
            .collect();

        inner.consts.clear();
        for data in &msg.const_blocks {
            inner.consts.push(data.clone());
        }
        inner.snapshot_tail = msg.const_blocks.last().cloned();

        inner.initialized = true;
        inner.state = ClientState::Synced;
        info!(
            blocks = inner.blocks.len(),
            consts = inner.consts.len(),
            "initial data loaded"
        );
        Ok(())
    }

    /// Apply one incremental diff.
    ///
    /// The whole stream is decoded and validated before any byte is applied,
    /// so a failure leaves the mirrors untouched (and the state `Desynced`).
    /// On success every mirror equals the new authoritative state, local writes
    /// included or not.
    pub fn resync(&self, msg: &Resync) -> Result<(), SyncError> {
        let mut inner = self.inner.lock();
        if inner.state != ClientState::Synced {
            return Err(SyncError::NotInitialized);
        }
        inner.state = ClientState::Resyncing;

        let ClientInner {
            blocks, baseline, ..
        } = &mut *inner;
        let applied = apply_resync(blocks, baseline, msg);
        inner.state = match &applied {
            Ok(dirty) => {
                debug!(dirty = *dirty, size = msg.uncompressed_size, "resync applied");
                ClientState::Synced
            }
            Err(_) => ClientState::Desynced,
        };
        applied.map(|_| ()).map_err(SyncError::from)
    }

    /// Close the connection. The server sees a disconnect.
    pub fn shutdown(&self) {
        self.transport.shutdown();
        self.connected.store(false, Ordering::Release);
        self.inner.lock().state = ClientState::Disconnected;
        info!("client shut down");
    }

    fn send(&self, msg: Message) -> Result<(), SyncError> {
        let options = default_send_options(msg.msg_id());
        self.transport
            .send(Target::Peer(SERVER_PEER_ID), msg.encode(), options)?;
        Ok(())
    }

    fn handle_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::ConnectionAccepted(peer) => {
                info!(peer, "connected");
                self.connected.store(true, Ordering::Release);
            }
            TransportEvent::Disconnected(peer) => {
                info!(peer, "server closed the connection");
                self.mark_disconnected();
            }
            TransportEvent::ConnectionLost(peer) => {
                warn!(peer, "connection lost");
                self.mark_disconnected();
            }
            TransportEvent::ConnectionRejected { peer, reason } => {
                warn!(peer, %reason, "connection rejected");
                self.mark_disconnected();
            }
            TransportEvent::IncompatibleProtocol {
                peer,
                remote_version,
            } => {
                warn!(peer, remote_version, "server uses an incompatible protocol version");
                self.mark_disconnected();
            }
            TransportEvent::NewIncomingConnection(peer) => {
                debug!(peer, "ignoring server-side transport event");
            }
            TransportEvent::Packet { data, .. } => self.handle_packet(data),
        }
    }

    fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::Release);
        self.inner.lock().state = ClientState::Disconnected;
    }

    fn handle_packet(&self, data: Bytes) {
        let msg = match Message::decode(data) {
            Ok(msg) => msg,
            Err(ProtoError::UnknownMsgId(id)) => {
                warn!(id, "unknown packet id, ignoring");
                return;
            }
            Err(e) => {
                warn!(error = %e, "malformed packet, ignoring");
                return;
            }
        };

        match msg {
            Message::InitialSync(snapshot) => self.on_initial_sync(&snapshot),
            Message::Resync(diff) => self.on_resync(&diff),
            Message::ConstData(data) => self.on_const_data(&data),
            Message::SyncCheck(check) => {
                if !self.config.report_checksums || self.state() != ClientState::Synced {
                    return;
                }
                // Same point in the stream as the server's snapshot; drop local drift first.
                match self.revert() {
                    Ok(0) | Err(_) => {}
                    Ok(drifted) => debug!(drifted, "reverted local writes before sync check"),
                }
                let report = ChecksumReport {
                    check_id: check.check_id,
                    checksum: self.state_checksum(),
                };
                if let Err(e) = self.send(Message::ChecksumReport(report)) {
                    warn!(error = %e, "failed to send checksum report");
                }
            }
            other => {
                warn!(msg_id = ?other.msg_id(), "unexpected message from server, ignoring");
            }
        }
    }

    fn on_initial_sync(&self, snapshot: &InitialSync) {
        match self.load_initial_data(snapshot) {
            Ok(()) => {
                if let Err(e) = self.send(Message::InitialSyncAck) {
                    warn!(error = %e, "failed to acknowledge initial sync");
                }
            }
            Err(e) => {
                // Server and client registered different blocks; no resync can fix that.
                error!(error = %e, "initial sync does not match local blocks, disconnecting");
                self.transport.shutdown();
                self.connected.store(false, Ordering::Release);
            }
        }
    }

    fn on_resync(&self, diff: &Resync) {
        match self.resync(diff) {
            Ok(()) => {}
            Err(SyncError::NotInitialized) => {
                debug!(state = ?self.state(), "resync ignored until the next initial sync");
            }
            Err(e) => {
                error!(error = %e, "failed to apply resync");
                if self.config.request_full_sync_on_error {
                    let reason = full_sync_reason(&e);
                    let msg = Message::FullSyncRequest(FullSyncRequest { reason });
                    if let Err(e) = self.send(msg) {
                        warn!(error = %e, "failed to request full re-sync");
                    }
                }
            }
        }
    }

    fn on_const_data(&self, data: &ConstData) {
        match decompress(&data.compressed, data.original_size) {
            Ok(raw) => {
                let mut inner = self.inner.lock();
                if inner.snapshot_tail.take().is_some_and(|tail| tail[..] == raw[..]) {
                    debug!("const block already delivered by the last snapshot");
                    return;
                }
                if inner.consts.push(Bytes::from(raw)).is_some() {
                    debug!("const ring full, evicted oldest block");
                }
            }
            Err(e) => warn!(error = %e, "dropping undecodable const block"),
        }
    }
}

fn check_layout(local: &[MemoryBlock], remote: &[Bytes]) -> Result<(), SyncError> {
    if local.len() != remote.len() {
        return Err(SyncError::LayoutMismatch(format!(
            "{} local blocks, server sent {}",
            local.len(),
            remote.len()
        )));
    }
    for (index, (block, data)) in local.iter().zip(remote).enumerate() {
        if block.len() != data.len() {
            return Err(SyncError::LayoutMismatch(format!(
                "block {index} is {} bytes locally, server sent {}",
                block.len(),
                data.len()
            )));
        }
    }
    Ok(())
}

/// Decode, validate, apply to the baseline, then publish it to the mirrors.
/// Returns the number of blocks the diff touched.
fn apply_resync(
    blocks: &mut [MemoryBlock],
    baseline: &mut [Box<[u8]>],
    msg: &Resync,
) -> Result<usize, ProtoError> {
    let stream = decompress(&msg.compressed, msg.uncompressed_size)?;
    let entries = parse_delta_stream(&stream, |i| baseline.get(i).map(|b| b.len()))?;
    let dirty = entries.len();
    for entry in entries {
        if let Some(base) = baseline.get_mut(entry.index) {
            apply_xor(base, entry.xor);
        }
    }
    restore(blocks, baseline);
    Ok(dirty)
}

/// Copy `baseline` over every mirror that differs from it.
fn restore(blocks: &mut [MemoryBlock], baseline: &[Box<[u8]>]) -> usize {
    let mut drifted = 0;
    for (block, base) in blocks.iter_mut().zip(baseline) {
        if *block.read() != **base {
            block.write().copy_from_slice(base);
            drifted += 1;
        }
    }
    drifted
}

fn full_sync_reason(err: &SyncError) -> FullSyncReason {
    match err {
        SyncError::Protocol(ProtoError::BlockIndexOutOfRange(_)) => FullSyncReason::IndexOutOfRange,
        SyncError::Protocol(
            ProtoError::Compression(_)
            | ProtoError::DecompressedLengthMismatch { .. }
            | ProtoError::PayloadTooLarge(_),
        ) => FullSyncReason::Decompression,
        SyncError::Protocol(_) => FullSyncReason::MalformedDiff,
        SyncError::LayoutMismatch(_) => FullSyncReason::BlockLayout,
        _ => FullSyncReason::Unknown,
    }
}
