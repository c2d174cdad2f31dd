use crate::peer::ChunkPeerConn;
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

/// One inode's cached read state (`readrec` in `readdata.c`): the
/// currently open chunkserver connection, which chunk index it is
/// positioned at, and the internal read buffer.
pub struct SessionState {
    pub rbuff: Vec<u8>,
    pub file_length: u64,
    /// `offset >> 26`: which 64MiB chunk the open connection is for.
    pub indx: u32,
    pub chunk_id: u64,
    pub version: u32,
    pub conn: Option<Box<dyn ChunkPeerConn>>,
    pub peer: Option<(u32, u16)>,
    /// Set when the connection was (re-)established; forces a refresh
    /// after `refresh_timeout` even if reads keep arriving.
    pub vtime: Instant,
    /// Set on every successful read; the reaper closes the connection
    /// after `read_delay` of inactivity.
    pub atime: Instant,
    pub valid: bool,
}

impl SessionState {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            rbuff: Vec::new(),
            file_length: 0,
            indx: 0,
            chunk_id: 0,
            version: 0,
            conn: None,
            peer: None,
            vtime: now,
            atime: now,
            valid: true,
        }
    }
}

pub struct ReadSession {
    pub inode: u32,
    pub state: Mutex<SessionState>,
}

impl ReadSession {
    pub fn new(inode: u32) -> Self {
        Self {
            inode,
            state: Mutex::new(SessionState::new()),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap()
    }
}

/// Holds a session's buffer lock pinned until the caller calls
/// [`ReadOutcome::release`] (or drops it, which has the same effect) —
/// the Rust shape of `read_data`/`read_data_freebuff`'s split contract,
/// where the caller reads directly out of the session's internal buffer
/// without a copy and must explicitly signal it is done.
pub struct ReadOutcome<'a> {
    guard: Option<MutexGuard<'a, SessionState>>,
    range: std::ops::Range<usize>,
}

impl<'a> ReadOutcome<'a> {
    pub(crate) fn new(guard: MutexGuard<'a, SessionState>, range: std::ops::Range<usize>) -> Self {
        Self {
            guard: Some(guard),
            range,
        }
    }

    pub(crate) fn empty() -> Self {
        Self {
            guard: None,
            range: 0..0,
        }
    }

    pub fn data(&self) -> &[u8] {
        match &self.guard {
            Some(guard) => &guard.rbuff[self.range.clone()],
            None => &[],
        }
    }

    pub fn len(&self) -> usize {
        self.range.len()
    }

    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }

    /// Explicitly releases the pinned session lock (`read_data_freebuff`).
    /// Equivalent to dropping this value, spelled out for callers that
    /// want the release point visible in their own control flow.
    pub fn release(self) {}
}
