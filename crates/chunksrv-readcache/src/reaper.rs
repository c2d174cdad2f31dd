use crate::manager::{ReadSessionManager, ReapStats};
use chunksrv_core::collaborators::{ChunkServerDb, MasterRpc};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Drives [`ReadSessionManager::reap_once`] on a fixed period
/// (`READDELAY/2` in the original), stopping cleanly when dropped rather
/// than leaking a detached thread.
pub struct Reaper {
    shutdown_tx: mpsc::Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl Reaper {
    pub fn spawn<M, D>(manager: Arc<ReadSessionManager<M, D>>, read_delay: Duration) -> Self
    where
        M: MasterRpc + 'static,
        D: ChunkServerDb + 'static,
    {
        Self::spawn_with(manager, read_delay, |_stats| {})
    }

    /// Same as [`Reaper::spawn`], but `on_sweep` runs after every sweep with
    /// that sweep's [`ReapStats`] — the hook `chunksrv-mount-demo` uses to
    /// feed its reaper-eviction-count metric without duplicating the
    /// reaper thread.
    pub fn spawn_with<M, D, F>(manager: Arc<ReadSessionManager<M, D>>, read_delay: Duration, on_sweep: F) -> Self
    where
        M: MasterRpc + 'static,
        D: ChunkServerDb + 'static,
        F: Fn(ReapStats) + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel();
        let period = read_delay / 2;
        let handle = thread::Builder::new()
            .name("cs-readcache-reaper".to_string())
            .spawn(move || loop {
                let stats = manager.reap_once();
                if stats.sessions_dropped > 0 || stats.connections_closed > 0 {
                    log::trace!(
                        "reaper sweep: {} sessions dropped, {} connections closed",
                        stats.sessions_dropped,
                        stats.connections_closed
                    );
                }
                on_sweep(stats);
                if shutdown_rx.recv_timeout(period).is_ok() {
                    break;
                }
            })
            .expect("failed to spawn read-session reaper thread");
        Self {
            shutdown_tx,
            handle: Some(handle),
        }
    }
}

impl Drop for Reaper {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
