use crate::peer::ChunkPeerClient;
use crate::session::{ReadOutcome, ReadSession};
use crate::sleeper::Sleeper;
use chunksrv_core::collaborators::{ChunkServerDb, MasterRpc, ERROR_ENOENT};
use chunksrv_core::error::ReadError;
use log::warn;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const MAP_BITS: u32 = 10;
const MAP_BUCKETS: usize = 1 << MAP_BITS;
const MAP_MASK: u32 = (MAP_BUCKETS as u32) - 1;

/// 64MiB, the chunk size `offset >> 26` / `offset & 0x3FFFFFF` assume.
const CHUNK_SIZE: u64 = 1 << 26;
const CHUNK_OFFSET_MASK: u64 = CHUNK_SIZE - 1;

/// An opaque, typed handle to one inode's read session, replacing the
/// `void*` the original mount layer threads through FUSE callbacks. Holds
/// the session alive; the manager's reaper only reclaims the underlying
/// slot once the handle has been dropped and `end` has marked it invalid.
#[derive(Clone)]
pub struct SessionHandle(pub(crate) Arc<ReadSession>);

enum Refresh {
    Connected,
    Hole,
    NoValidCopies,
    StaleInode,
    Io,
}

/// What one [`ReadSessionManager::reap_once`] sweep reclaimed, for the
/// mount demo's eviction-count telemetry.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReapStats {
    pub sessions_dropped: u32,
    pub connections_closed: u32,
}

/// The Read Path Session Manager: per-inode sticky chunkserver
/// connections, global hash-table + list bookkeeping, and the retry/
/// backoff policy `read_data` implements.
pub struct ReadSessionManager<M, D> {
    master: Arc<M>,
    csdb: Arc<D>,
    peer_client: Arc<dyn ChunkPeerClient>,
    sleeper: Arc<dyn Sleeper>,
    retries: u32,
    refresh_timeout: Duration,
    read_delay: Duration,
    buckets: Box<[Mutex<Vec<Arc<ReadSession>>>; MAP_BUCKETS]>,
    all: Mutex<Vec<Arc<ReadSession>>>,
}

impl<M, D> ReadSessionManager<M, D>
where
    M: MasterRpc + 'static,
    D: ChunkServerDb + 'static,
{
    pub fn new(
        master: Arc<M>,
        csdb: Arc<D>,
        peer_client: Arc<dyn ChunkPeerClient>,
        sleeper: Arc<dyn Sleeper>,
        retries: u32,
        refresh_timeout: Duration,
        read_delay: Duration,
    ) -> Self {
        Self {
            master,
            csdb,
            peer_client,
            sleeper,
            retries,
            refresh_timeout,
            read_delay,
            buckets: Box::new(std::array::from_fn(|_| Mutex::new(Vec::new()))),
            all: Mutex::new(Vec::new()),
        }
    }

    pub fn refresh_timeout(&self) -> Duration {
        self.refresh_timeout
    }

    pub fn read_delay(&self) -> Duration {
        self.read_delay
    }

    pub fn new_session(&self, inode: u32) -> SessionHandle {
        let session = Arc::new(ReadSession::new(inode));
        self.buckets[(inode & MAP_MASK) as usize]
            .lock()
            .unwrap()
            .push(session.clone());
        self.all.lock().unwrap().push(session.clone());
        metrics::gauge!("chunksrv_readcache_sessions").set(self.all.lock().unwrap().len() as f64);
        SessionHandle(session)
    }

    /// Ends a session: closes its chunkserver connection (balancing the
    /// opcount), frees its read buffer, and marks it invalid so the
    /// reaper reclaims the slot on its next sweep. Matches
    /// `read_data_end`'s "close now, free later" split.
    pub fn end_session(&self, handle: &SessionHandle) {
        let mut state = handle.0.lock();
        if let Some((ip, port)) = state.peer.take() {
            self.csdb.read_dec(ip, port);
        }
        state.conn = None;
        state.rbuff = Vec::new();
        state.valid = false;
    }

    /// Force-closes every session's chunkserver connection for an inode
    /// (`read_inode_ops`): a truncate/write elsewhere invalidated
    /// whatever chunk layout a session had cached, so the next `read`
    /// must re-resolve it from the master.
    pub fn invalidate_inode(&self, inode: u32) {
        let bucket = self.buckets[(inode & MAP_MASK) as usize].lock().unwrap();
        for session in bucket.iter().filter(|s| s.inode == inode) {
            let mut state = session.lock();
            if let Some((ip, port)) = state.peer.take() {
                self.csdb.read_dec(ip, port);
            }
            state.conn = None;
        }
    }

    /// One reaper sweep: drops sessions marked invalid out of the
    /// bucket/list bookkeeping, and force-closes connections that have
    /// been idle past `read_delay` or open past `refresh_timeout`,
    /// matching `read_data_delayed_ops`.
    pub fn reap_once(&self) -> ReapStats {
        let now = Instant::now();
        let mut stats = ReapStats::default();
        let mut all = self.all.lock().unwrap();
        let mut still_valid = Vec::with_capacity(all.len());
        for session in all.drain(..) {
            let valid = session.lock().valid;
            if !valid {
                self.buckets[(session.inode & MAP_MASK) as usize]
                    .lock()
                    .unwrap()
                    .retain(|s| !Arc::ptr_eq(s, &session));
                stats.sessions_dropped += 1;
                metrics::counter!("chunksrv_readcache_reaper_evictions_total", "kind" => "session").increment(1);
                continue;
            }
            {
                let mut state = session.lock();
                if state.conn.is_some()
                    && (now.duration_since(state.atime) > self.read_delay
                        || now.duration_since(state.vtime) > self.refresh_timeout)
                {
                    if let Some((ip, port)) = state.peer.take() {
                        self.csdb.read_dec(ip, port);
                    }
                    state.conn = None;
                    stats.connections_closed += 1;
                    metrics::counter!("chunksrv_readcache_reaper_evictions_total", "kind" => "connection").increment(1);
                }
            }
            still_valid.push(session);
        }
        metrics::gauge!("chunksrv_readcache_sessions").set(still_valid.len() as f64);
        *all = still_valid;
        stats
    }

    fn refresh_connection(&self, handle: &SessionHandle) -> Refresh {
        let indx = {
            let mut state = handle.0.lock();
            if let Some((ip, port)) = state.peer.take() {
                self.csdb.read_dec(ip, port);
            }
            state.conn = None;
            state.indx
        };
        let location = match self.master.read_chunk(handle.0.inode, indx) {
            Ok(loc) => loc,
            Err(status) => {
                warn!("fs_readchunk returned status {status} for inode {}", handle.0.inode);
                return if status == ERROR_ENOENT {
                    Refresh::StaleInode
                } else {
                    Refresh::Io
                };
            }
        };
        let mut state = handle.0.lock();
        state.file_length = location.file_length;
        state.chunk_id = location.chunk_id;
        state.version = location.version;
        if location.chunk_id == 0 && location.candidates.is_empty() {
            return Refresh::Hole;
        }
        if location.candidates.is_empty() {
            warn!(
                "inode {} index {} - no valid chunk copies available",
                handle.0.inode, indx
            );
            return Refresh::NoValidCopies;
        }
        // Least-loaded peer selection: the first candidate with the
        // lowest opcount wins, so ties break in favor of whichever the
        // master listed first.
        let chosen = location
            .candidates
            .iter()
            .min_by_key(|c| self.csdb.opcount(c.ip, c.port))
            .copied()
            .expect("candidates is non-empty");
        match self.peer_client.connect(chosen.ip, chosen.port) {
            Ok(conn) => {
                state.conn = Some(conn);
                state.peer = Some((chosen.ip, chosen.port));
                state.vtime = Instant::now();
                self.csdb.read_inc(chosen.ip, chosen.port);
                Refresh::Connected
            }
            Err(e) => {
                warn!("can't connect to chunkserver: {e}");
                Refresh::Io
            }
        }
    }

    /// Reads `size` bytes starting at `offset`, matching `read_data`'s
    /// retry/backoff loop. Returns a pinned view into the session's
    /// internal buffer; the caller releases it via [`ReadOutcome::release`]
    /// (or by dropping it).
    pub fn read<'a>(&self, handle: &'a SessionHandle, offset: u64, size: u32) -> Result<ReadOutcome<'a>, ReadError> {
        if size == 0 {
            return Ok(ReadOutcome::empty());
        }

        {
            let mut state = handle.0.lock();
            if (size as usize) > state.rbuff.len() {
                state.rbuff = vec![0u8; size as usize];
            }
        }

        let mut cnt: u32 = 0;
        let mut curr_off = offset;
        let mut remaining = size;
        let mut write_pos: usize = 0;

        while remaining > 0 {
            let indx = (curr_off / CHUNK_SIZE) as u32;
            let needs_refresh = {
                let mut state = handle.0.lock();
                let stale = state.conn.is_none() || state.indx != indx;
                if stale {
                    state.indx = indx;
                }
                stale
            };
            if needs_refresh {
                loop {
                    cnt += 1;
                    metrics::counter!("chunksrv_readcache_retries_total").increment(1);
                    match self.refresh_connection(handle) {
                        Refresh::Connected | Refresh::Hole => break,
                        Refresh::StaleInode => return Err(ReadError::StaleInode),
                        Refresh::NoValidCopies => {
                            self.sleeper.sleep(Duration::from_secs(60));
                            cnt += 9;
                        }
                        Refresh::Io => {
                            self.sleeper.sleep(Duration::from_secs(1 + (cnt / 5) as u64));
                        }
                    }
                    if cnt >= self.retries {
                        return Err(ReadError::Io);
                    }
                }
            }

            let file_length = handle.0.lock().file_length;
            if curr_off >= file_length {
                break;
            }
            let mut this_size = remaining;
            if curr_off + this_size as u64 > file_length {
                this_size = (file_length - curr_off) as u32;
            }
            let chunk_offset = (curr_off & CHUNK_OFFSET_MASK) as u32;
            let chunk_size = if (chunk_offset as u64 + this_size as u64) > CHUNK_SIZE {
                (CHUNK_SIZE - chunk_offset as u64) as u32
            } else {
                this_size
            };

            let has_chunk = handle.0.lock().chunk_id > 0;
            if has_chunk {
                let outcome = {
                    let mut state = handle.0.lock();
                    let (chunk_id, version) = (state.chunk_id, state.version);
                    let conn = state.conn.as_deref_mut();
                    match conn {
                        Some(conn) => {
                            let end = write_pos + chunk_size as usize;
                            conn.read_block(chunk_id, version, chunk_offset, chunk_size, &mut state.rbuff[write_pos..end])
                        }
                        None => Err(std::io::Error::new(std::io::ErrorKind::NotConnected, "no connection")),
                    }
                };
                if let Err(e) = outcome {
                    warn!("readblock error: {e}");
                    handle.0.lock().conn = None;
                    cnt += 1;
                    if cnt >= self.retries {
                        return Err(ReadError::Io);
                    }
                    self.sleeper.sleep(Duration::from_secs(1 + (cnt / 5) as u64));
                    continue;
                }
            } else {
                let mut state = handle.0.lock();
                let end = write_pos + chunk_size as usize;
                state.rbuff[write_pos..end].fill(0);
            }
            curr_off += chunk_size as u64;
            remaining -= chunk_size;
            write_pos += chunk_size as usize;
        }

        let mut state = handle.0.lock();
        state.atime = Instant::now();
        let file_length = state.file_length;
        if file_length <= offset {
            Ok(ReadOutcome::empty())
        } else {
            let available = (file_length - offset).min(size as u64) as usize;
            Ok(ReadOutcome::new(state, 0..available))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::{ChunkPeerClient, ChunkPeerConn};
    use chunksrv_core::collaborators::{ChunkLocation, ChunkServerCandidate};
    use std::collections::HashMap;
    use std::io;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FakeMaster {
        location: Mutex<ChunkLocation>,
    }

    impl MasterRpc for FakeMaster {
        fn read_chunk(&self, _inode: u32, _index: u32) -> Result<ChunkLocation, u8> {
            Ok(self.location.lock().unwrap().clone())
        }
    }

    #[derive(Default)]
    struct FakeCsdb {
        opcounts: Mutex<HashMap<(u32, u16), u32>>,
    }

    impl ChunkServerDb for FakeCsdb {
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

    struct FakePeerConn;
    impl ChunkPeerConn for FakePeerConn {
        fn read_block(&mut self, _chunk_id: u64, _version: u32, _offset: u32, size: u32, buf: &mut [u8]) -> io::Result<()> {
            for (i, b) in buf[..size as usize].iter_mut().enumerate() {
                *b = i as u8;
            }
            Ok(())
        }
    }

    struct FakePeerClient {
        connect_attempts: AtomicU32,
        fail_ports: Vec<u16>,
    }

    impl ChunkPeerClient for FakePeerClient {
        fn connect(&self, ip: u32, port: u16) -> io::Result<Box<dyn ChunkPeerConn>> {
            self.connect_attempts.fetch_add(1, Ordering::SeqCst);
            if self.fail_ports.contains(&port) {
                return Err(io::Error::new(io::ErrorKind::Other, "refused"));
            }
            let _ = ip;
            Ok(Box::new(FakePeerConn))
        }
    }

    fn manager_with(
        location: ChunkLocation,
        fail_ports: Vec<u16>,
    ) -> ReadSessionManager<FakeMaster, FakeCsdb> {
        ReadSessionManager::new(
            Arc::new(FakeMaster {
                location: Mutex::new(location),
            }),
            Arc::new(FakeCsdb::default()),
            Arc::new(FakePeerClient {
                connect_attempts: AtomicU32::new(0),
                fail_ports,
            }),
            Arc::new(crate::sleeper::RecordingSleeper::default()),
            30,
            Duration::from_secs(5),
            Duration::from_secs(1),
        )
    }

    #[test]
    fn read_picks_the_least_loaded_candidate() {
        let location = ChunkLocation {
            file_length: 4096,
            chunk_id: 1,
            version: 1,
            candidates: vec![
                ChunkServerCandidate { ip: 1, port: 9422 },
                ChunkServerCandidate { ip: 2, port: 9423 },
            ],
        };
        let manager = manager_with(location, vec![]);
        manager.csdb.read_inc(1, 9422);
        manager.csdb.read_inc(1, 9422);

        let handle = manager.new_session(7);
        let outcome = manager.read(&handle, 0, 10).unwrap();
        assert_eq!(outcome.len(), 10);
        assert_eq!(handle.0.lock().peer, Some((2, 9423)));
    }

    #[test]
    fn hole_reads_return_zero_filled_data() {
        let location = ChunkLocation {
            file_length: 4096,
            chunk_id: 0,
            version: 0,
            candidates: vec![],
        };
        let manager = manager_with(location, vec![]);
        let handle = manager.new_session(9);
        let outcome = manager.read(&handle, 0, 16).unwrap();
        assert!(outcome.data().iter().all(|&b| b == 0));
    }

    #[test]
    fn stale_inode_status_short_circuits_without_retry() {
        struct AlwaysEnoent;
        impl MasterRpc for AlwaysEnoent {
            fn read_chunk(&self, _inode: u32, _index: u32) -> Result<ChunkLocation, u8> {
                Err(ERROR_ENOENT)
            }
        }
        let manager = ReadSessionManager::new(
            Arc::new(AlwaysEnoent),
            Arc::new(FakeCsdb::default()),
            Arc::new(FakePeerClient {
                connect_attempts: AtomicU32::new(0),
                fail_ports: vec![],
            }),
            Arc::new(crate::sleeper::RecordingSleeper::default()),
            30,
            Duration::from_secs(5),
            Duration::from_secs(1),
        );
        let handle = manager.new_session(3);
        let result = manager.read(&handle, 0, 10);
        assert!(matches!(result, Err(ReadError::StaleInode)));
    }

    #[test]
    fn no_valid_copies_backs_off_before_giving_up() {
        let location = ChunkLocation {
            file_length: 4096,
            chunk_id: 5,
            version: 1,
            candidates: vec![],
        };
        let manager = manager_with(location, vec![]);
        let handle = manager.new_session(4);
        let result = manager.read(&handle, 0, 10);
        assert!(matches!(result, Err(ReadError::Io)));
    }

    #[test]
    fn end_session_balances_the_opcount() {
        let location = ChunkLocation {
            file_length: 4096,
            chunk_id: 1,
            version: 1,
            candidates: vec![ChunkServerCandidate { ip: 1, port: 9422 }],
        };
        let manager = manager_with(location, vec![]);
        let handle = manager.new_session(1);
        manager.read(&handle, 0, 10).unwrap().release();
        assert_eq!(manager.csdb.opcount(1, 9422), 1);
        manager.end_session(&handle);
        assert_eq!(manager.csdb.opcount(1, 9422), 0);
    }
}
