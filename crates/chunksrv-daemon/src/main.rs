//! Chunk-server data plane daemon: the background job pool plus the
//! master-connection reactor, driven by a single `mio::Poll` loop.

use anyhow::{Context, Result};
use chunksrv_core::collaborators::{ChunkListSummary, ChunkOpRequest, ChunkRecord, HddStore, ReplicationSource, Replicator};
use chunksrv_core::config::ChunkServerConfig;
use chunksrv_jobs::JobPool;
use chunksrv_masterconn::{ChangelogSink, ConnectionState, MasterConnection};
use clap::Parser;
use log::{info, warn};
use metrics_exporter_prometheus::PrometheusBuilder;
use mio::net::TcpStream as MioTcpStream;
use mio::{Events, Interest, Poll, Token};
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{filter, Layer};

#[derive(Parser, Debug)]
#[command(author, version, about = "Chunk-server data plane daemon", long_about = None)]
struct Args {
    /// Path to a TOML config file; CLI flags below override its fields.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    master_host: Option<String>,

    #[arg(long)]
    master_port: Option<String>,

    /// Address exposing Prometheus-format metrics (e.g. 0.0.0.0:9423).
    /// Metrics stay no-op (the `metrics` facade's default) when omitted.
    #[arg(long)]
    metrics_bind: Option<SocketAddr>,

    #[arg(long, default_value = "info")]
    log_level: String,
}

const MASTER_TOKEN: Token = Token(0);
const JOBS_TOKEN: Token = Token(1);

fn main() -> Result<()> {
    let args = Args::parse();
    enable_logging(&args.log_level);

    let mut config = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
            ChunkServerConfig::from_toml_str(&text).with_context(|| format!("parsing {}", path.display()))?
        }
        None => ChunkServerConfig::default(),
    };
    if let Some(host) = args.master_host {
        config.master_host = host;
    }
    if let Some(port) = args.master_port {
        config.master_port = port;
    }

    if let Some(bind) = args.metrics_bind {
        PrometheusBuilder::new()
            .with_http_listener(bind)
            .install()
            .context("installing Prometheus metrics exporter")?;
        info!("metrics exporter listening on {bind}");
    }

    run(config)
}

fn enable_logging(level: &str) {
    let verbosity = match level {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    };
    let filters = filter::Targets::new().with_default(verbosity);
    let fmt_layer = tracing_subscriber::fmt::layer().compact().with_filter(filters);
    tracing_subscriber::registry().with(fmt_layer).init();
    tracing_log::LogTracer::init().expect("failed to bridge `log` records into `tracing`");
}

/// A no-op HDD store/replicator pair: the on-disk chunk store and the
/// inter-chunkserver replicator are out-of-scope collaborators (see
/// `chunksrv-core::collaborators`); the daemon wires stubs so the reactor
/// loop and wire protocol are exercisable end-to-end without a real disk.
struct NullHdd;
impl HddStore for NullHdd {
    fn open(&self, _chunk_id: u64, _version: u32) -> u8 {
        0
    }
    fn close(&self, _chunk_id: u64) -> u8 {
        0
    }
    fn read(&self, _chunk_id: u64, _version: u32, _offset: u32, _size: u32, _buf: &mut [u8]) -> u8 {
        0
    }
    fn write(&self, _chunk_id: u64, _version: u32, _offset: u32, _data: &[u8]) -> u8 {
        0
    }
    fn chunk_op(&self, _req: ChunkOpRequest) -> u8 {
        0
    }
    fn chunk_list_summary(&self) -> ChunkListSummary {
        ChunkListSummary::default()
    }
    fn enumerate_chunks(&self) -> Vec<ChunkRecord> {
        Vec::new()
    }
}

struct NullReplicator;
impl Replicator for NullReplicator {
    fn replicate(&self, _chunk_id: u64, _version: u32, _sources: &[ReplicationSource]) -> u8 {
        0
    }
}

fn resolve_master(config: &ChunkServerConfig) -> Result<SocketAddr> {
    format!("{}:{}", config.master_host, config.master_port)
        .to_socket_addrs()
        .with_context(|| format!("resolving {}:{}", config.master_host, config.master_port))?
        .next()
        .with_context(|| format!("no addresses for {}:{}", config.master_host, config.master_port))
}

fn run(config: ChunkServerConfig) -> Result<()> {
    let (jobs, mut jobs_rx) = JobPool::new(
        config.job_pool_workers,
        config.job_queue_capacity,
        Arc::new(NullHdd),
        Arc::new(NullReplicator),
    )
    .context("starting job pool")?;

    let changelog_dir = std::env::current_dir().context("resolving changelog directory")?;
    let changelog = ChangelogSink::new(changelog_dir, config.back_logs);

    let mut conn: MasterConnection<MioTcpStream, NullHdd, NullReplicator> =
        MasterConnection::new(jobs, changelog, config.clone());

    let mut poll = Poll::new().context("creating mio::Poll")?;
    poll.registry()
        .register(&mut jobs_rx, JOBS_TOKEN, Interest::READABLE)
        .context("registering job pool wakeup pipe")?;

    let mut stream: Option<MioTcpStream> = None;
    let mut next_connect_attempt = Instant::now();
    let mut events = Events::with_capacity(128);

    loop {
        if conn.state() == ConnectionState::Free && Instant::now() >= next_connect_attempt {
            match connect_to_master(&config, &mut poll) {
                Ok(s) => stream = Some(s),
                Err(e) => {
                    warn!("connect to master failed: {e}");
                    next_connect_attempt = Instant::now() + Duration::from_secs(config.master_reconnection_delay as u64);
                }
            }
        }

        poll.poll(&mut events, Some(Duration::from_millis(200)))
            .context("polling reactor")?;

        for event in events.iter() {
            match event.token() {
                MASTER_TOKEN => {
                    // While `stream` is `Some`, the non-blocking `connect()`
                    // hasn't yet been handed to `conn` — this readiness
                    // event is the connect completing, not frame traffic.
                    if let Some(s) = stream.take() {
                        match s.take_error() {
                            Ok(None) => {
                                info!("connected to master");
                                conn.attach_stream(s);
                            }
                            Ok(Some(e)) | Err(e) => {
                                warn!("master connect failed: {e}");
                                next_connect_attempt =
                                    Instant::now() + Duration::from_secs(config.master_reconnection_delay as u64);
                            }
                        }
                        continue;
                    }
                    if event.is_readable() {
                        if let Err(e) = conn.on_readable() {
                            warn!("master connection error, reconnecting: {e}");
                            conn.kill();
                            next_connect_attempt =
                                Instant::now() + Duration::from_secs(config.master_reconnection_delay as u64);
                        }
                    }
                    if event.is_writable() && conn.state() == ConnectionState::Connected {
                        if let Err(e) = conn.on_writable() {
                            warn!("master write error, reconnecting: {e}");
                            conn.kill();
                            next_connect_attempt =
                                Instant::now() + Duration::from_secs(config.master_reconnection_delay as u64);
                        }
                    }
                }
                JOBS_TOKEN => {
                    chunksrv_jobs::wakeup::drain(&mut jobs_rx).ok();
                    conn.drain_job_completions();
                }
                _ => {}
            }
        }

        if conn.state() == ConnectionState::Connected {
            if let Err(e) = conn.on_timer(Instant::now()) {
                warn!("master connection timed out: {e}");
                conn.kill();
                next_connect_attempt = Instant::now() + Duration::from_secs(config.master_reconnection_delay as u64);
            }
        }

        if conn.state() == ConnectionState::Kill {
            conn.reset_to_free();
        }

        // Matches `desc`'s selector rule: read only while the job pool has
        // room, write only while there is something queued to send.
        if conn.state() == ConnectionState::Connected {
            let mut interest = Interest::WRITABLE;
            if conn.jobs_can_add() {
                interest |= Interest::READABLE;
            }
            if let Some(s) = conn.stream_mut() {
                let _ = poll.registry().reregister(s, MASTER_TOKEN, interest);
            }
        }
    }
}

fn connect_to_master(config: &ChunkServerConfig, poll: &mut Poll) -> Result<MioTcpStream> {
    let addr = resolve_master(config)?;
    let mut stream = MioTcpStream::connect(addr).with_context(|| format!("connecting to {addr}"))?;
    poll.registry()
        .register(&mut stream, MASTER_TOKEN, Interest::READABLE | Interest::WRITABLE)
        .context("registering master connection")?;
    Ok(stream)
}
