//! Demo mount client: drives the read path session manager against a
//! live chunkserver over a real TCP connection, standing in for the
//! FUSE layer the original mount process sits behind. The metadata
//! master's chunk-location RPC is out of scope for this workspace, so
//! the chunk layout is supplied on the command line instead of fetched
//! from a real master.

use anyhow::{Context, Result};
use chunksrv_core::collaborators::{ChunkLocation, ChunkServerCandidate, ChunkServerDb, MasterRpc};
use chunksrv_core::config::ChunkServerConfig;
use chunksrv_readcache::manager::ReapStats;
use chunksrv_readcache::peer::tcp::TcpChunkPeerClient;
use chunksrv_readcache::{ReadSessionManager, Reaper, RealSleeper};
use clap::Parser;
use log::info;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::collections::HashMap;
use std::net::{SocketAddr, SocketAddrV4};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{filter, Layer};

#[derive(Parser, Debug)]
#[command(author, version, about = "Demo mount client for the read-path session manager", long_about = None)]
struct Args {
    /// Path to a TOML config file supplying RETRIES/REFRESHTIMEOUT/READDELAY
    /// overrides; CLI flags below take precedence over it.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Chunkserver to read the demo chunk from, e.g. 127.0.0.1:9422.
    #[arg(long)]
    chunkserver: SocketAddrV4,

    #[arg(long, default_value_t = 1)]
    inode: u32,

    #[arg(long, default_value_t = 0)]
    offset: u64,

    #[arg(long, default_value_t = 4096)]
    size: u32,

    /// Length the demo chunk location reports to the session manager.
    #[arg(long, default_value_t = 64 * 1024 * 1024)]
    file_length: u64,

    #[arg(long)]
    metrics_bind: Option<SocketAddr>,

    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Reports a single fixed chunk location instead of querying a real
/// master, since the mount client's `fs_readchunk` RPC is out of scope
/// for this workspace.
struct DemoMasterRpc {
    location: ChunkLocation,
}

impl MasterRpc for DemoMasterRpc {
    fn read_chunk(&self, _inode: u32, _index: u32) -> Result<ChunkLocation, u8> {
        Ok(self.location.clone())
    }
}

#[derive(Default)]
struct DemoCsdb {
    opcounts: Mutex<HashMap<(u32, u16), u32>>,
}

impl ChunkServerDb for DemoCsdb {
    fn read_inc(&self, ip: u32, port: u16) {
        *self.opcounts.lock().unwrap().entry((ip, port)).or_insert(0) += 1;
    }
    fn read_dec(&self, ip: u32, port: u16) {
        if let Some(count) = self.opcounts.lock().unwrap().get_mut(&(ip, port)) {
            *count = count.saturating_sub(1);
        }
    }
    fn opcount(&self, ip: u32, port: u16) -> u32 {
        *self.opcounts.lock().unwrap().get(&(ip, port)).unwrap_or(&0)
    }
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

fn main() -> Result<()> {
    let args = Args::parse();
    enable_logging(&args.log_level);

    if let Some(bind) = args.metrics_bind {
        PrometheusBuilder::new()
            .with_http_listener(bind)
            .install()
            .context("installing Prometheus metrics exporter")?;
        info!("metrics exporter listening on {bind}");
    }

    let config = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
            ChunkServerConfig::from_toml_str(&text).with_context(|| format!("parsing {}", path.display()))?
        }
        None => ChunkServerConfig::default(),
    };

    let ip: u32 = u32::from(*args.chunkserver.ip());
    let port = args.chunkserver.port();
    let master = Arc::new(DemoMasterRpc {
        location: ChunkLocation {
            file_length: args.file_length,
            chunk_id: 1,
            version: 1,
            candidates: vec![ChunkServerCandidate { ip, port }],
        },
    });
    let csdb = Arc::new(DemoCsdb::default());
    let peer_client = Arc::new(TcpChunkPeerClient::default());
    let sleeper = Arc::new(RealSleeper);

    let manager = Arc::new(ReadSessionManager::new(
        master,
        csdb,
        peer_client,
        sleeper,
        config.retries,
        Duration::from_micros(config.refresh_timeout_us),
        Duration::from_micros(config.read_delay_us),
    ));

    let _reaper = Reaper::spawn_with(manager.clone(), manager.read_delay(), |stats: ReapStats| {
        if stats.sessions_dropped > 0 || stats.connections_closed > 0 {
            log::debug!(
                "reaper evicted {} sessions, closed {} connections",
                stats.sessions_dropped,
                stats.connections_closed
            );
        }
    });

    let handle = manager.new_session(args.inode);
    let result = manager.read(&handle, args.offset, args.size);
    manager.end_session(&handle);

    match result {
        Ok(outcome) => {
            info!(
                "read {} bytes from inode {} at offset {}",
                outcome.len(),
                args.inode,
                args.offset
            );
            println!("read {} bytes", outcome.len());
            Ok(())
        }
        Err(e) => {
            let errno = e.to_errno();
            eprintln!("read failed: {e} (errno {errno})");
            std::process::exit(errno);
        }
    }
}
