//! Sync over real sockets on 127.0.0.1.
//!
//! Covers:
//! - handshake, initial sync, resync and inputs through `TcpTransport`
//! - password and capacity rejection
//! - protocol version mismatch from a raw socket
//! - graceful disconnect

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant};

use blocksync::transport::{TcpConfig, TcpTransport};
use blocksync::{
    Client, ClientConfig, ClientState, Server, ServerConfig, SharedRegion, Transport,
    TransportEvent,
};
use blocksync_proto::codec_tcp::encode_control_frame;
use blocksync_proto::constants::VERSION;
use blocksync_proto::framing::TcpFramer;
use blocksync_proto::header::FrameKind;
use blocksync_proto::messages::handshake::{Hello, Reject, RejectReason};

const PASSWORD: &str = "hunter2";
const DEADLINE: Duration = Duration::from_secs(5);
const POLL: Duration = Duration::from_millis(20);

fn config(password: &str) -> TcpConfig {
    TcpConfig {
        password: password.to_string(),
        ..TcpConfig::default()
    }
}

fn listen(config: TcpConfig) -> (Arc<TcpTransport>, SocketAddr) {
    let transport = TcpTransport::listen("127.0.0.1:0", config).expect("listen");
    let addr = transport.local_addr().expect("bound address");
    (Arc::new(transport), addr)
}

/// Pump until `done` holds or the deadline passes.
fn pump_until(server: &Server, clients: &[&Client], mut done: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < DEADLINE {
        server.update(POLL);
        for client in clients {
            client.update(POLL);
        }
        if done() {
            return true;
        }
    }
    false
}

/// Wait for the first event matching `pred` on a bare transport.
fn wait_event(
    transport: &dyn Transport,
    mut pred: impl FnMut(&TransportEvent) -> bool,
) -> Option<TransportEvent> {
    let start = Instant::now();
    while start.elapsed() < DEADLINE {
        if let Some(event) = transport.recv_timeout(POLL)
            && pred(&event)
        {
            return Some(event);
        }
    }
    None
}

#[test]
fn tcp_sync_end_to_end() {
    let (server_transport, addr) = listen(config(PASSWORD));
    let server = Server::new(server_transport, ServerConfig::default());
    let vram = SharedRegion::new(256);
    server
        .create_shared_memory_block(vram.clone())
        .expect("register");
    server.create_memory_block(8).expect("register");

    let client_transport =
        TcpTransport::connect(&addr.to_string(), config(PASSWORD)).expect("connect");
    let client = Client::new(Arc::new(client_transport), ClientConfig::default());

    assert!(
        pump_until(&server, &[&client], || client.state() == ClientState::Synced),
        "client never loaded the initial sync"
    );
    assert!(client.is_connected());

    vram.write()[17] = 0xAB;
    vram.write()[200] = 0xCD;
    assert!(server.sync().sent);
    assert!(
        pump_until(&server, &[&client], || client.check_match(&server).is_empty()),
        "resync never arrived"
    );

    client.send_inputs(&b"P1:START"[..]).expect("send inputs");
    let mut input = None;
    assert!(pump_until(&server, &[&client], || {
        input = server.pop_input_buffer(0);
        input.is_some()
    }));
    assert_eq!(input.as_deref(), Some(&b"P1:START"[..]));

    client.shutdown();
    assert!(pump_until(&server, &[], || server.num_connected() == 0));
    server.shutdown();
}

#[test]
fn wrong_password_is_rejected() {
    let (server_transport, addr) = listen(config(PASSWORD));
    let server = Server::new(server_transport, ServerConfig::default());
    server.create_memory_block(4).expect("register");

    let client_transport =
        TcpTransport::connect(&addr.to_string(), config("wrong")).expect("connect");
    let client = Client::new(Arc::new(client_transport), ClientConfig::default());

    assert!(pump_until(&server, &[&client], || {
        client.state() == ClientState::Disconnected
    }));
    assert!(!client.is_connected());
    assert_eq!(server.num_connected(), 0);
}

#[test]
fn full_server_rejects_extra_clients() {
    let (server_transport, addr) = listen(TcpConfig {
        max_connections: 1,
        ..config(PASSWORD)
    });

    let first = TcpTransport::connect(&addr.to_string(), config(PASSWORD)).expect("connect");
    assert!(
        wait_event(&first, |e| matches!(e, TransportEvent::ConnectionAccepted(_))).is_some()
    );
    assert!(
        wait_event(&*server_transport, |e| matches!(
            e,
            TransportEvent::NewIncomingConnection(_)
        ))
        .is_some()
    );

    let second = TcpTransport::connect(&addr.to_string(), config(PASSWORD)).expect("connect");
    let event = wait_event(&second, |e| {
        matches!(e, TransportEvent::ConnectionRejected { .. })
    });
    assert!(matches!(
        event,
        Some(TransportEvent::ConnectionRejected { reason, .. }) if reason.contains("ServerFull")
    ));
    assert_eq!(server_transport.num_links(), 1);
}

#[test]
fn incompatible_protocol_version_is_rejected() {
    let (server_transport, addr) = listen(config(PASSWORD));

    let mut stream = TcpStream::connect(addr).expect("raw connect");
    stream
        .set_read_timeout(Some(DEADLINE))
        .expect("read timeout");
    let hello = Hello {
        protocol_version: VERSION + 1,
        password: PASSWORD.to_string(),
    };
    let frame = encode_control_frame(FrameKind::Hello, &hello).expect("encode hello");
    stream.write_all(&frame).expect("write hello");

    let mut framer = TcpFramer::new(1024);
    let reply = loop {
        let mut buf = [0u8; 1024];
        let n = stream.read(&mut buf).expect("read reply");
        assert!(n > 0, "server closed without a reply");
        framer.buf_mut().extend_from_slice(&buf[..n]);
        if let Some(frame) = framer.drain_frames().expect("decode").into_iter().next() {
            break frame;
        }
    };
    assert_eq!(reply.kind(), FrameKind::Reject);
    let reject: Reject = postcard::from_bytes(&reply.payload).expect("reject payload");
    assert_eq!(
        reject.reason,
        RejectReason::IncompatibleProtocol {
            server_version: VERSION
        }
    );

    let event = wait_event(&*server_transport, |e| {
        matches!(e, TransportEvent::IncompatibleProtocol { .. })
    });
    assert!(matches!(
        event,
        Some(TransportEvent::IncompatibleProtocol { remote_version, .. }) if remote_version == VERSION + 1
    ));
}

#[test]
fn graceful_shutdown_reports_disconnect() {
    let (server_transport, addr) = listen(config(PASSWORD));
    let client = TcpTransport::connect(&addr.to_string(), config(PASSWORD)).expect("connect");

    let Some(TransportEvent::NewIncomingConnection(peer)) =
        wait_event(&*server_transport, |e| {
            matches!(e, TransportEvent::NewIncomingConnection(_))
        })
    else {
        panic!("no incoming connection");
    };
    assert!(
        wait_event(&client, |e| matches!(e, TransportEvent::ConnectionAccepted(_))).is_some()
    );
    assert_eq!(client.local_peer_id(), Some(peer));

    client.shutdown();
    let event = wait_event(&*server_transport, |e| {
        matches!(
            e,
            TransportEvent::Disconnected(_) | TransportEvent::ConnectionLost(_)
        )
    });
    assert_eq!(event, Some(TransportEvent::Disconnected(peer)));
}
