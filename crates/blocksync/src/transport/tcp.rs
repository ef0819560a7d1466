//! TCP transport.
//!
//! Owns a small tokio runtime; callers stay synchronous and receive events
//! through a crossbeam channel.
//!
//! Each link carries one bounded FIFO queue per ordering channel. The writer
//! drains them in a fixed priority order (control, inputs, sync, const data),
//! so priority can only reorder frames across channels, never within one.
//!
//! Connection lifecycle:
//! - client sends `Hello{protocol_version, password}`
//! - server answers `Welcome{peer_id}` or `Reject{reason}`
//! - both sides exchange `Data` frames and periodic `Ping`s
//! - a graceful close sends `Goodbye`; silence past the timeout drops the link

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use blocksync_proto::channel::SendOptions;
use blocksync_proto::codec_tcp::{encode_control_frame, encode_tcp_frame};
use blocksync_proto::constants::{HEADER_LEN, SERVER_PEER_ID, TCP_LEN_PREFIX, VERSION};
use blocksync_proto::error::ProtoError;
use blocksync_proto::framing::{FrameOwned, TcpFramer};
use blocksync_proto::header::{FrameKind, Header};
use blocksync_proto::limits::{MAX_HANDSHAKE_PAYLOAD, TCP_RX_BUFFER_LIMIT, TCP_RX_INITIAL_CAPACITY};
use blocksync_proto::messages::handshake::{Hello, Reject, RejectReason, Welcome};
use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender, unbounded};
use futures_util::SinkExt;
use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Runtime;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::codec::{BytesCodec, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{PeerId, Target, Transport, TransportEvent};
use crate::error::TransportError;

/// How long `shutdown` waits for writers to flush queued frames.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

type FrameSink = FramedWrite<OwnedWriteHalf, BytesCodec>;

#[derive(Debug, Clone)]
pub struct TcpConfig {
    /// Shared secret checked during the handshake.
    pub password: String,
    /// Server side: further clients are rejected with `ServerFull`.
    pub max_connections: usize,
    /// Handshake deadline and idle timeout of an established link.
    pub timeout: Duration,
    pub ping_interval: Duration,
    /// Frames buffered per peer and ordering channel.
    pub outbound_queue_capacity: usize,
    pub worker_threads: usize,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            password: String::new(),
            max_connections: 16,
            timeout: Duration::from_secs(30),
            ping_interval: Duration::from_secs(5),
            outbound_queue_capacity: 1024,
            worker_threads: 2,
        }
    }
}

/// Sending half of a link, one queue per ordering channel.
struct PeerLink {
    queues: [mpsc::Sender<Bytes>; 4],
    cancel: CancellationToken,
}

/// Receiving half of a link, drained by the writer task.
struct LinkQueues {
    sync: mpsc::Receiver<Bytes>,
    const_data: mpsc::Receiver<Bytes>,
    inputs: mpsc::Receiver<Bytes>,
    control: mpsc::Receiver<Bytes>,
}

impl PeerLink {
    fn new(capacity: usize) -> (Self, LinkQueues) {
        let capacity = capacity.max(1);
        let (sync_tx, sync) = mpsc::channel(capacity);
        let (const_tx, const_data) = mpsc::channel(capacity);
        let (inputs_tx, inputs) = mpsc::channel(capacity);
        let (control_tx, control) = mpsc::channel(capacity);
        // Indexed by `OrderingChannel as usize`.
        let link = Self {
            queues: [sync_tx, const_tx, inputs_tx, control_tx],
            cancel: CancellationToken::new(),
        };
        let queues = LinkQueues {
            sync,
            const_data,
            inputs,
            control,
        };
        (link, queues)
    }

    fn enqueue(
        &self,
        peer: PeerId,
        frame: Bytes,
        options: SendOptions,
    ) -> Result<(), TransportError> {
        match self.queues[options.channel as usize].try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) if options.is_reliable() => {
                // An ordered stream cannot skip a message; the peer has to resync from scratch.
                warn!(peer, channel = ?options.channel, "outbound queue full, dropping peer");
                self.cancel.cancel();
                Err(TransportError::QueueFull(peer))
            }
            Err(TrySendError::Full(_)) => {
                debug!(peer, channel = ?options.channel, "outbound queue full, dropping unreliable frame");
                Ok(())
            }
            Err(TrySendError::Closed(_)) => Err(TransportError::UnknownPeer(peer)),
        }
    }
}

struct Shared {
    config: TcpConfig,
    events: Sender<TransportEvent>,
    links: Mutex<HashMap<PeerId, PeerLink>>,
    closing: CancellationToken,
    next_peer: AtomicU64,
    /// Identity assigned by the server (client side only, 0 until welcomed).
    local_peer: AtomicU64,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Shared {
    fn new(config: TcpConfig) -> (Arc<Self>, Receiver<TransportEvent>) {
        let (events, rx) = unbounded();
        let shared = Arc::new(Self {
            config,
            events,
            links: Mutex::new(HashMap::new()),
            closing: CancellationToken::new(),
            next_peer: AtomicU64::new(SERVER_PEER_ID + 1),
            local_peer: AtomicU64::new(0),
            tasks: Mutex::new(Vec::new()),
        });
        (shared, rx)
    }

    fn next_peer_id(&self) -> PeerId {
        self.next_peer.fetch_add(1, Ordering::Relaxed)
    }

    fn emit(&self, event: TransportEvent) {
        // The receiver lives in the transport, which outlives every task.
        let _ = self.events.send(event);
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock();
        tasks.retain(|h| !h.is_finished());
        tasks.push(handle);
    }
}

/// Why a link's reader stopped.
#[derive(Debug)]
enum CloseReason {
    Goodbye,
    Eof,
    Timeout,
    Io(std::io::ErrorKind),
    Protocol(String),
    Overflow,
    /// Cancelled locally after a write failure or a full reliable queue.
    Cancelled,
    /// The transport itself is shutting down; no event is reported.
    Shutdown,
}

pub struct TcpTransport {
    shared: Arc<Shared>,
    events: Receiver<TransportEvent>,
    runtime: Mutex<Option<Runtime>>,
    local_addr: Option<SocketAddr>,
}

impl TcpTransport {
    /// Bind `addr` and accept clients in the background.
    pub fn listen(addr: &str, config: TcpConfig) -> Result<Self, TransportError> {
        let runtime = build_runtime(&config)?;
        let listener =
            runtime
                .block_on(TcpListener::bind(addr))
                .map_err(|source| TransportError::Bind {
                    addr: addr.to_string(),
                    source,
                })?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, max_connections = config.max_connections, "listening");

        let (shared, events) = Shared::new(config);
        let task = runtime.spawn(accept_loop(listener, shared.clone()));
        shared.track(task);

        Ok(Self {
            shared,
            events,
            runtime: Mutex::new(Some(runtime)),
            local_addr: Some(local_addr),
        })
    }

    /// Start connecting to `addr`.
    ///
    /// Returns immediately; the outcome arrives as `ConnectionAccepted`,
    /// `ConnectionRejected` or `IncompatibleProtocol`.
    pub fn connect(addr: &str, config: TcpConfig) -> Result<Self, TransportError> {
        let runtime = build_runtime(&config)?;
        let (shared, events) = Shared::new(config);
        let task = runtime.spawn(connect_task(addr.to_string(), shared.clone()));
        shared.track(task);

        Ok(Self {
            shared,
            events,
            runtime: Mutex::new(Some(runtime)),
            local_addr: None,
        })
    }

    /// Bound address (listening side).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Identity the server assigned to us, once welcomed.
    pub fn local_peer_id(&self) -> Option<PeerId> {
        match self.shared.local_peer.load(Ordering::Relaxed) {
            0 => None,
            id => Some(id),
        }
    }

    pub fn num_links(&self) -> usize {
        self.shared.links.lock().len()
    }
}

impl Transport for TcpTransport {
    fn send(
        &self,
        target: Target,
        data: Bytes,
        options: SendOptions,
    ) -> Result<(), TransportError> {
        if self.shared.closing.is_cancelled() {
            return Err(TransportError::Closed);
        }
        let frame = Bytes::from(encode_tcp_frame(Header::data(&options), &data)?);

        let links = self.shared.links.lock();
        match target {
            Target::Peer(peer) => links
                .get(&peer)
                .ok_or(TransportError::UnknownPeer(peer))?
                .enqueue(peer, frame, options),
            Target::Broadcast => {
                for (&peer, link) in links.iter() {
                    // A failing peer is dropped; the others still get the frame.
                    let _ = link.enqueue(peer, frame.clone(), options);
                }
                Ok(())
            }
        }
    }

    fn recv_timeout(&self, timeout: Duration) -> Option<TransportEvent> {
        self.events.recv_timeout(timeout).ok()
    }

    fn try_recv(&self) -> Option<TransportEvent> {
        self.events.try_recv().ok()
    }

    /// Flush queued frames, say goodbye to every peer and stop the runtime.
    ///
    /// Must not be called from inside an async context.
    fn shutdown(&self) {
        let Some(runtime) = self.runtime.lock().take() else {
            return;
        };
        self.shared.closing.cancel();
        // Dropping the senders lets each writer drain and exit.
        self.shared.links.lock().clear();

        let tasks = std::mem::take(&mut *self.shared.tasks.lock());
        runtime.block_on(async {
            let _ =
                tokio::time::timeout(SHUTDOWN_GRACE, futures_util::future::join_all(tasks)).await;
        });
        runtime.shutdown_background();
        debug!("tcp transport shut down");
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn build_runtime(config: &TcpConfig) -> Result<Runtime, TransportError> {
    Ok(tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.worker_threads.max(1))
        .thread_name("blocksync-net")
        .enable_all()
        .build()?)
}

fn lifecycle_frame(kind: FrameKind) -> Bytes {
    // An empty payload always fits in a frame.
    encode_tcp_frame(Header::new(kind), &[])
        .map(Bytes::from)
        .unwrap_or_default()
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
    loop {
        let (stream, addr) = tokio::select! {
            _ = shared.closing.cancelled() => break,
            res = listener.accept() => match res {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            },
        };

        let shared = shared.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_connection(stream, addr, shared).await {
                debug!(%addr, error = %e, "connection closed during handshake");
            }
        });
    }
}

async fn serve_connection(
    stream: TcpStream,
    addr: SocketAddr,
    shared: Arc<Shared>,
) -> Result<(), TransportError> {
    let _ = stream.set_nodelay(true);
    let (mut read, write) = stream.into_split();
    let mut sink = FramedWrite::new(write, BytesCodec::new());
    let mut framer = TcpFramer::new(TCP_RX_INITIAL_CAPACITY);

    let (first, pending) = match read_handshake(&mut read, &mut framer, shared.config.timeout).await
    {
        Ok(frames) => frames,
        Err(TransportError::Protocol(ProtoError::UnsupportedVersion(remote_version))) => {
            reject_incompatible(&mut sink, addr, remote_version, &shared).await;
            return Ok(());
        }
        Err(e) => return Err(e),
    };
    if first.kind() != FrameKind::Hello {
        return Err(TransportError::ConnectionFailed(format!(
            "expected Hello, got {:?}",
            first.kind()
        )));
    }
    let hello: Hello = postcard::from_bytes(&first.payload).map_err(ProtoError::from)?;

    if hello.protocol_version != VERSION {
        reject_incompatible(&mut sink, addr, hello.protocol_version, &shared).await;
        return Ok(());
    }
    if hello.password != shared.config.password {
        warn!(%addr, "rejecting connection: invalid password");
        send_reject(&mut sink, RejectReason::InvalidPassword).await;
        return Ok(());
    }

    let (link, queues) = PeerLink::new(shared.config.outbound_queue_capacity);
    let cancel = link.cancel.clone();
    let admitted = {
        let mut links = shared.links.lock();
        if shared.closing.is_cancelled() || links.len() >= shared.config.max_connections {
            None
        } else {
            let peer = shared.next_peer_id();
            links.insert(peer, link);
            Some(peer)
        }
    };
    let Some(peer) = admitted else {
        warn!(%addr, "rejecting connection: server full");
        send_reject(&mut sink, RejectReason::ServerFull).await;
        return Ok(());
    };

    // Welcome goes out before the writer starts, ahead of anything queued for this peer.
    let welcomed = match encode_control_frame(FrameKind::Welcome, &Welcome { peer_id: peer }) {
        Ok(frame) => sink.send(Bytes::from(frame)).await.map_err(TransportError::from),
        Err(e) => Err(e.into()),
    };
    if let Err(e) = welcomed {
        shared.links.lock().remove(&peer);
        return Err(e);
    }

    info!(peer, %addr, "peer connected");
    shared.emit(TransportEvent::NewIncomingConnection(peer));

    run_link(
        LinkIo {
            peer,
            read,
            sink,
            framer,
            pending,
            queues,
            cancel,
        },
        shared,
    )
    .await;
    Ok(())
}

async fn reject_incompatible(
    sink: &mut FrameSink,
    addr: SocketAddr,
    remote_version: u8,
    shared: &Shared,
) {
    warn!(%addr, remote_version, local_version = VERSION, "rejecting connection: incompatible protocol");
    send_reject(
        sink,
        RejectReason::IncompatibleProtocol {
            server_version: VERSION,
        },
    )
    .await;
    shared.emit(TransportEvent::IncompatibleProtocol {
        peer: shared.next_peer_id(),
        remote_version,
    });
}

async fn send_reject(sink: &mut FrameSink, reason: RejectReason) {
    if let Ok(frame) = encode_control_frame(FrameKind::Reject, &Reject { reason }) {
        let _ = sink.send(Bytes::from(frame)).await;
    }
    let _ = SinkExt::<Bytes>::close(sink).await;
}

async fn connect_task(addr: String, shared: Arc<Shared>) {
    match run_client(&addr, &shared).await {
        Ok(()) => {}
        Err(TransportError::Protocol(ProtoError::UnsupportedVersion(remote_version))) => {
            warn!(%addr, remote_version, "server speaks an incompatible protocol");
            shared.emit(TransportEvent::IncompatibleProtocol {
                peer: SERVER_PEER_ID,
                remote_version,
            });
        }
        Err(e) => {
            warn!(%addr, error = %e, "connection attempt failed");
            shared.emit(TransportEvent::ConnectionRejected {
                peer: SERVER_PEER_ID,
                reason: e.to_string(),
            });
        }
    }
}

async fn run_client(addr: &str, shared: &Arc<Shared>) -> Result<(), TransportError> {
    let timeout = shared.config.timeout;
    let stream = tokio::select! {
        _ = shared.closing.cancelled() => return Ok(()),
        res = tokio::time::timeout(timeout, TcpStream::connect(addr)) => res
            .map_err(|_| TransportError::ConnectionFailed(format!("connect to {addr} timed out")))??,
    };
    let _ = stream.set_nodelay(true);
    let (mut read, write) = stream.into_split();
    let mut sink = FramedWrite::new(write, BytesCodec::new());

    let hello = Hello {
        protocol_version: VERSION,
        password: shared.config.password.clone(),
    };
    sink.send(Bytes::from(encode_control_frame(FrameKind::Hello, &hello)?))
        .await?;

    let mut framer = TcpFramer::new(TCP_RX_INITIAL_CAPACITY);
    let (reply, pending) = read_handshake(&mut read, &mut framer, timeout).await?;
    match reply.kind() {
        FrameKind::Welcome => {
            let welcome: Welcome = postcard::from_bytes(&reply.payload).map_err(ProtoError::from)?;
            shared.local_peer.store(welcome.peer_id, Ordering::Relaxed);

            let (link, queues) = PeerLink::new(shared.config.outbound_queue_capacity);
            let cancel = link.cancel.clone();
            shared.links.lock().insert(SERVER_PEER_ID, link);
            info!(%addr, peer_id = welcome.peer_id, "connected to server");
            shared.emit(TransportEvent::ConnectionAccepted(SERVER_PEER_ID));

            run_link(
                LinkIo {
                    peer: SERVER_PEER_ID,
                    read,
                    sink,
                    framer,
                    pending,
                    queues,
                    cancel,
                },
                shared.clone(),
            )
            .await;
            Ok(())
        }
        FrameKind::Reject => {
            let reject: Reject = postcard::from_bytes(&reply.payload).map_err(ProtoError::from)?;
            match reject.reason {
                RejectReason::IncompatibleProtocol { server_version } => {
                    warn!(%addr, server_version, local_version = VERSION, "server rejected protocol version");
                    shared.emit(TransportEvent::IncompatibleProtocol {
                        peer: SERVER_PEER_ID,
                        remote_version: server_version,
                    });
                }
                reason => {
                    warn!(%addr, ?reason, "server rejected connection");
                    shared.emit(TransportEvent::ConnectionRejected {
                        peer: SERVER_PEER_ID,
                        reason: format!("{reason:?}"),
                    });
                }
            }
            Ok(())
        }
        other => Err(TransportError::ConnectionFailed(format!(
            "unexpected {other:?} frame during handshake"
        ))),
    }
}

/// Read until the first complete frame arrives. Frames that arrived right
/// behind it are returned too, in order.
async fn read_handshake(
    read: &mut OwnedReadHalf,
    framer: &mut TcpFramer,
    timeout: Duration,
) -> Result<(FrameOwned, Vec<FrameOwned>), TransportError> {
    let deadline = Instant::now() + timeout;
    loop {
        let mut frames = framer.drain_frames()?.into_iter();
        if let Some(first) = frames.next() {
            return Ok((first, frames.collect()));
        }
        if framer.buffered() > TCP_LEN_PREFIX + HEADER_LEN + MAX_HANDSHAKE_PAYLOAD {
            return Err(ProtoError::PayloadTooLarge(framer.buffered()).into());
        }

        framer.buf_mut().reserve(4096);
        let n = tokio::time::timeout_at(deadline, read.read_buf(framer.buf_mut()))
            .await
            .map_err(|_| TransportError::ConnectionFailed("handshake timed out".into()))??;
        if n == 0 {
            return Err(TransportError::ConnectionFailed(
                "connection closed during handshake".into(),
            ));
        }
    }
}

struct LinkIo {
    peer: PeerId,
    read: OwnedReadHalf,
    sink: FrameSink,
    framer: TcpFramer,
    pending: Vec<FrameOwned>,
    queues: LinkQueues,
    cancel: CancellationToken,
}

async fn run_link(io: LinkIo, shared: Arc<Shared>) {
    let LinkIo {
        peer,
        mut read,
        sink,
        mut framer,
        pending,
        queues,
        cancel,
    } = io;

    let writer = tokio::spawn(writer_loop(
        peer,
        sink,
        queues,
        cancel.clone(),
        shared.closing.clone(),
        shared.config.ping_interval,
    ));
    shared.track(writer);

    let reason = reader_loop(peer, &mut read, &mut framer, pending, &cancel, &shared).await;
    shared.links.lock().remove(&peer);

    match reason {
        CloseReason::Shutdown => debug!(peer, "link closed by local shutdown"),
        CloseReason::Goodbye => {
            info!(peer, "peer disconnected");
            cancel.cancel();
            shared.emit(TransportEvent::Disconnected(peer));
        }
        reason => {
            match &reason {
                CloseReason::Io(kind) => warn!(peer, %kind, "connection lost: io error"),
                CloseReason::Protocol(detail) => {
                    warn!(peer, %detail, "connection lost: protocol error")
                }
                other => warn!(peer, reason = ?other, "connection lost"),
            }
            cancel.cancel();
            shared.emit(TransportEvent::ConnectionLost(peer));
        }
    }
}

async fn reader_loop(
    peer: PeerId,
    read: &mut OwnedReadHalf,
    framer: &mut TcpFramer,
    pending: Vec<FrameOwned>,
    cancel: &CancellationToken,
    shared: &Shared,
) -> CloseReason {
    for frame in pending {
        if let Some(reason) = dispatch(peer, frame, shared) {
            return reason;
        }
    }

    let idle_timeout = shared.config.timeout;
    let mut deadline = Instant::now() + idle_timeout;
    loop {
        if framer.buffered() > TCP_RX_BUFFER_LIMIT {
            return CloseReason::Overflow;
        }
        framer.buf_mut().reserve(4096);

        let read_res = tokio::select! {
            res = read.read_buf(framer.buf_mut()) => res,
            _ = cancel.cancelled() => return CloseReason::Cancelled,
            _ = shared.closing.cancelled() => return CloseReason::Shutdown,
            _ = tokio::time::sleep_until(deadline) => return CloseReason::Timeout,
        };
        match read_res {
            Ok(0) => return CloseReason::Eof,
            Ok(_) => deadline = Instant::now() + idle_timeout,
            Err(e) => return CloseReason::Io(e.kind()),
        }

        let frames = match framer.drain_frames() {
            Ok(frames) => frames,
            Err(e) => return CloseReason::Protocol(e.to_string()),
        };
        for frame in frames {
            if let Some(reason) = dispatch(peer, frame, shared) {
                return reason;
            }
        }
    }
}

fn dispatch(peer: PeerId, frame: FrameOwned, shared: &Shared) -> Option<CloseReason> {
    match frame.kind() {
        FrameKind::Data => {
            shared.emit(TransportEvent::Packet {
                peer,
                data: frame.payload,
            });
            None
        }
        FrameKind::Ping => None,
        FrameKind::Goodbye => Some(CloseReason::Goodbye),
        other => Some(CloseReason::Protocol(format!("unexpected {other:?} frame"))),
    }
}

async fn writer_loop(
    peer: PeerId,
    mut sink: FrameSink,
    mut queues: LinkQueues,
    cancel: CancellationToken,
    closing: CancellationToken,
    ping_interval: Duration,
) {
    let mut ping = tokio::time::interval_at(Instant::now() + ping_interval, ping_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut draining = false;

    loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled(), if !draining => return,
            Some(frame) = queues.control.recv() => frame,
            Some(frame) = queues.inputs.recv() => frame,
            Some(frame) = queues.sync.recv() => frame,
            Some(frame) = queues.const_data.recv() => frame,
            _ = closing.cancelled(), if !draining => {
                draining = true;
                continue;
            }
            _ = ping.tick(), if !draining => lifecycle_frame(FrameKind::Ping),
            else => break,
        };

        if let Err(e) = sink.send(frame).await {
            warn!(peer, error = %e, "write failed");
            cancel.cancel();
            return;
        }
    }

    // Every queue is closed and drained.
    let _ = sink.send(lifecycle_frame(FrameKind::Goodbye)).await;
    let _ = SinkExt::<Bytes>::close(&mut sink).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use blocksync_proto::channel::{OrderingChannel, Priority, Reliability};

    #[test]
    fn lifecycle_frames_are_header_only() {
        let ping = lifecycle_frame(FrameKind::Ping);
        assert_eq!(ping.len(), TCP_LEN_PREFIX + HEADER_LEN);

        let mut framer = TcpFramer::new(64);
        framer.buf_mut().extend_from_slice(&ping);
        let frames = framer.drain_frames().expect("decode");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].kind(), FrameKind::Ping);
    }

    #[test]
    fn full_queue_drops_unreliable_and_cancels_on_reliable() {
        let (link, _queues) = PeerLink::new(1);
        let unreliable =
            SendOptions::new(Priority::Low, Reliability::Unreliable, OrderingChannel::ConstData);
        let reliable =
            SendOptions::new(Priority::Low, Reliability::ReliableOrdered, OrderingChannel::Sync);

        link.enqueue(7, Bytes::from_static(b"a"), unreliable)
            .expect("first fits");
        link.enqueue(7, Bytes::from_static(b"b"), unreliable)
            .expect("overflow is silent");
        assert!(!link.cancel.is_cancelled());

        link.enqueue(7, Bytes::from_static(b"c"), reliable)
            .expect("sync queue has room");
        assert!(matches!(
            link.enqueue(7, Bytes::from_static(b"d"), reliable),
            Err(TransportError::QueueFull(7))
        ));
        assert!(link.cancel.is_cancelled());
    }

    #[test]
    fn dispatch_routes_data_and_flags_stray_frames() {
        let (shared, events) = Shared::new(TcpConfig::default());
        let data = FrameOwned {
            header: Header::new(FrameKind::Data),
            payload: Bytes::from_static(b"xy"),
        };
        assert!(dispatch(4, data, &shared).is_none());
        assert_eq!(
            events.try_recv().ok(),
            Some(TransportEvent::Packet {
                peer: 4,
                data: Bytes::from_static(b"xy"),
            })
        );

        let stray = FrameOwned {
            header: Header::new(FrameKind::Hello),
            payload: Bytes::new(),
        };
        match dispatch(4, stray, &shared) {
            Some(CloseReason::Protocol(detail)) => assert!(detail.contains("Hello")),
            other => panic!("expected a protocol close, got {other:?}"),
        }
        let goodbye = FrameOwned {
            header: Header::new(FrameKind::Goodbye),
            payload: Bytes::new(),
        };
        assert!(matches!(
            dispatch(4, goodbye, &shared),
            Some(CloseReason::Goodbye)
        ));
    }

    #[test]
    fn closed_queue_reports_unknown_peer() {
        let (link, queues) = PeerLink::new(4);
        drop(queues);
        let opts = SendOptions::new(
            Priority::High,
            Reliability::ReliableOrdered,
            OrderingChannel::Control,
        );
        assert!(matches!(
            link.enqueue(3, Bytes::new(), opts),
            Err(TransportError::UnknownPeer(3))
        ));
    }
}
