use std::sync::Arc;
use std::time::{Duration, Instant};

use blocksync::transport::{TcpConfig, TcpTransport};
use blocksync::{Client, ClientConfig, ClientState, Server, ServerConfig};
use clap::{Parser, Subcommand};
use rand::SeedableRng;
use rand::rngs::StdRng;
use tracing::{Level, debug, info, warn};
use tracing_subscriber::FmtSubscriber;

mod demo;

use demo::DemoMachine;

/// Memory block sync host
#[derive(Parser, Debug)]
#[command(name = "blocksync-netd")]
#[command(about = "Runs a block sync server around a demo machine, or joins one", long_about = None)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    log_level: Level,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Host the authoritative machine and stream its memory to clients.
    Serve {
        /// TCP bind address
        #[arg(short, long, default_value = "0.0.0.0:5234")]
        bind: String,

        /// Password clients must present
        #[arg(short, long, default_value = "")]
        password: String,

        /// Frames per second
        #[arg(long, default_value_t = 60)]
        tick_hz: u32,

        /// Ticks between consistency checks (0 disables)
        #[arg(long, default_value_t = 60)]
        sync_check_interval: u32,

        /// Publish a const block every this many frames (0 disables)
        #[arg(long, default_value_t = 600)]
        const_every: u64,

        /// Maximum connected clients
        #[arg(long, default_value_t = 16)]
        max_connections: usize,
    },
    /// Mirror a server's memory and stream inputs to it.
    Join {
        /// Server address
        #[arg(short, long, default_value = "127.0.0.1:5234")]
        server: String,

        /// Server password
        #[arg(short, long, default_value = "")]
        password: String,

        /// Input packets per second
        #[arg(long, default_value_t = 60)]
        input_hz: u32,
    },
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;
    info!("Log level: {}", args.log_level);

    match args.command {
        Command::Serve {
            bind,
            password,
            tick_hz,
            sync_check_interval,
            const_every,
            max_connections,
        } => serve(ServeOptions {
            bind,
            password,
            tick_hz,
            sync_check_interval,
            const_every,
            max_connections,
        }),
        Command::Join {
            server,
            password,
            input_hz,
        } => join(&server, password, input_hz),
    }
}

struct ServeOptions {
    bind: String,
    password: String,
    tick_hz: u32,
    sync_check_interval: u32,
    const_every: u64,
    max_connections: usize,
}

fn period(hz: u32) -> anyhow::Result<Duration> {
    if hz == 0 {
        anyhow::bail!("rate must be at least 1 Hz");
    }
    Ok(Duration::from_secs(1) / hz)
}

fn serve(opts: ServeOptions) -> anyhow::Result<()> {
    let frame_time = period(opts.tick_hz)?;
    let transport = TcpTransport::listen(
        &opts.bind,
        TcpConfig {
            password: opts.password,
            max_connections: opts.max_connections,
            ..TcpConfig::default()
        },
    )?;
    if let Some(addr) = transport.local_addr() {
        info!(%addr, "Block sync server listening");
    }

    let server = Server::new(
        Arc::new(transport),
        ServerConfig {
            sync_check_interval: opts.sync_check_interval,
            ..ServerConfig::default()
        },
    );
    let mut machine = DemoMachine::install(&server, 0x5eed)?;
    info!(
        blocks = server.num_blocks(),
        tick_hz = opts.tick_hz,
        "Demo machine installed"
    );

    let mut next_frame = Instant::now() + frame_time;
    let mut last_summary = Instant::now();
    let mut bytes_since_summary = 0usize;
    loop {
        loop {
            let now = Instant::now();
            if now >= next_frame {
                break;
            }
            server.update(next_frame - now);
        }
        next_frame += frame_time;

        for slot in 0..server.num_sessions() {
            while let Some(input) = server.pop_input_buffer(slot) {
                machine.apply_input(slot, &input);
            }
        }

        machine.step(&server)?;
        if opts.const_every != 0 && machine.frame() % opts.const_every == 0 {
            let index = server.add_const_block(machine.palette())?;
            debug!(index, frame = machine.frame(), "published const block");
        }

        let report = server.sync();
        bytes_since_summary += report.compressed_size;
        debug!(
            tick = report.tick,
            dirty = report.dirty_blocks,
            synced = report.bytes_synced,
            raw = report.uncompressed_size,
            compressed = report.compressed_size,
            "tick"
        );

        if last_summary.elapsed() >= Duration::from_secs(5) {
            info!(
                frame = machine.frame(),
                clients = server.num_connected(),
                bytes = bytes_since_summary,
                checksum = format_args!("{:016x}", server.state_checksum()),
                "server status"
            );
            bytes_since_summary = 0;
            last_summary = Instant::now();
        }
    }
}

fn join(addr: &str, password: String, input_hz: u32) -> anyhow::Result<()> {
    let input_period = period(input_hz)?;
    let transport = TcpTransport::connect(
        addr,
        TcpConfig {
            password,
            ..TcpConfig::default()
        },
    )?;
    let client = Client::new(Arc::new(transport), ClientConfig::default());
    info!(%addr, "Connecting");

    let mut rng = StdRng::from_os_rng();
    let mut input_frame = 0u32;
    let mut next_input = Instant::now();
    let mut last_report = Instant::now();
    let mut last_state = client.state();
    loop {
        client.update(input_period.min(Duration::from_millis(10)));

        let state = client.state();
        if state != last_state {
            info!(from = ?last_state, to = ?state, "client state changed");
            last_state = state;
        }
        if state == ClientState::Disconnected {
            warn!("Disconnected from server");
            return Ok(());
        }

        if client.is_connected() && Instant::now() >= next_input {
            next_input += input_period;
            input_frame = input_frame.wrapping_add(1);
            if let Err(e) = client.send_inputs(demo::random_input(&mut rng, input_frame)) {
                warn!(error = %e, "failed to send inputs");
            }
        }

        if last_report.elapsed() >= Duration::from_secs(5) {
            info!(
                state = ?state,
                blocks = client.num_blocks(),
                consts = client.num_const_blocks(),
                checksum = format_args!("{:016x}", client.state_checksum()),
                "mirror status"
            );
            last_report = Instant::now();
        }
    }
}
