//! Trait boundaries for the components this workspace treats as external
//! collaborators: the on-disk chunk store (`HDD` in the original), the
//! chunk replicator, the chunk-server opcount database (`CSDB`), and the
//! metadata master's RPC surface (`FS`/`mastercomm` in the original).
//!
//! None of these traits encode retry, backoff, or connection management —
//! that lives in the callers (`chunksrv-jobs`' workers, `chunksrv-readcache`).
//! They exist so job workers and the read cache can be exercised in tests
//! against fakes instead of a real disk or socket.

/// Chunk operation kinds dispatched by MATOCS_{CREATE,DELETE,SET_VERSION,
/// DUPLICATE,TRUNCATE,DUPTRUNC}, all funneled through the same
/// `OP_CHUNKOP` job kind in the original (`bgjobs.c`'s `job_chunkop`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkOpKind {
    Create,
    Delete,
    SetVersion,
    Duplicate,
    Truncate,
    DupTrunc,
    /// `MATOCS_CHUNKOP`'s own generic opcode: unlike the other six, its
    /// reply echoes every input field back rather than just `(chunkid,
    /// status)`, so it is tracked separately instead of aliasing `Create`.
    Generic,
}

#[derive(Debug, Clone, Copy)]
pub struct ChunkOpRequest {
    pub kind: ChunkOpKind,
    pub chunk_id: u64,
    pub version: u32,
    pub new_version: u32,
    /// Only meaningful for `Duplicate`/`DupTrunc`: the chunk id the result
    /// is copied to.
    pub copy_chunk_id: u64,
    pub copy_version: u32,
    /// Only meaningful for `Truncate`/`DupTrunc`: new chunk length.
    pub length: u32,
}

/// A source chunkserver for a replication job, as carried in the
/// multi-source MATOCS_REPLICATE body: each source names its own copy's
/// `chunk_id`/`version` (which may differ from the replication target's,
/// e.g. while a version bump is in flight) alongside the peer address to
/// fetch it from.
#[derive(Debug, Clone, Copy)]
pub struct ReplicationSource {
    pub chunk_id: u64,
    pub version: u32,
    pub ip: u32,
    pub port: u16,
}

/// Summary returned when enumerating the on-disk chunk list for a
/// registration or telemetry push. `write_chunk_list` still runs its
/// locked enumeration and returns this summary even when `dest` is
/// `None`, mirroring `hdd_get_chunks_data(NULL)`'s unlock-on-null-buffer
/// behavior in the original.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChunkListSummary {
    pub chunk_count: u32,
    pub used_space: u64,
    pub total_space: u64,
    /// Space and chunk count marked for deletion but not yet reclaimed
    /// (`tdusedspace`/`tdtotalspace`/`tdchunkcount` in the registration
    /// packet). Zero for collaborators that don't model a to-delete set.
    pub to_delete_chunk_count: u32,
    pub to_delete_used_space: u64,
    pub to_delete_total_space: u64,
}

/// One chunk record in the registration packet's chunk list
/// (`chunkid:u64, version:u32` repeated `chunk_count` times).
#[derive(Debug, Clone, Copy)]
pub struct ChunkRecord {
    pub chunk_id: u64,
    pub version: u32,
}

pub trait HddStore: Send + Sync {
    fn open(&self, chunk_id: u64, version: u32) -> u8;
    fn close(&self, chunk_id: u64) -> u8;
    fn read(&self, chunk_id: u64, version: u32, offset: u32, size: u32, buf: &mut [u8]) -> u8;
    fn write(&self, chunk_id: u64, version: u32, offset: u32, data: &[u8]) -> u8;
    fn chunk_op(&self, req: ChunkOpRequest) -> u8;
    /// Space/chunk-count snapshot for the registration packet and the
    /// periodic `CSTOMA_SPACE` telemetry push (`hdd_get_chunks_data`'s
    /// summary fields in the original).
    fn chunk_list_summary(&self) -> ChunkListSummary;
    /// Full `(chunk_id, version)` listing for the registration packet.
    fn enumerate_chunks(&self) -> Vec<ChunkRecord>;

    /// Edge-triggered: `true` at most once per actual change in
    /// used/total space, mirroring `hdd_spacechanged()`'s dirty flag so
    /// `CSTOMA_SPACE` is only pushed when something moved.
    fn space_changed(&self) -> bool {
        false
    }
    /// Pops one pending I/O error event, if any (`hdd_errorcounter()`);
    /// each one the reactor observes becomes one `CSTOMA_ERROR_OCCURRED`.
    fn next_error_event(&self) -> bool {
        false
    }
    /// Chunk ids newly discovered to be damaged (checksum mismatch, open
    /// failure) since the last call, cleared on read.
    fn take_damaged_chunks(&self) -> Vec<u64> {
        Vec::new()
    }
    /// Chunk ids newly discovered to be unrecoverably lost since the last
    /// call, cleared on read.
    fn take_lost_chunks(&self) -> Vec<u64> {
        Vec::new()
    }
    /// Per-chunk checksum for `ANTOCS_CHUNK_CHECKSUM`; `Err(status)` on a
    /// non-zero collaborator status (e.g. chunk not found).
    fn checksum(&self, chunk_id: u64, version: u32) -> Result<u32, u8> {
        let _ = (chunk_id, version);
        Err(1)
    }
    /// Per-block checksum table (4096 bytes: 1024 CRC32 entries) for
    /// `ANTOCS_CHUNK_CHECKSUM_TAB`.
    fn checksum_tab(&self, chunk_id: u64, version: u32) -> Result<Vec<u8>, u8> {
        let _ = (chunk_id, version);
        Err(1)
    }
}

pub trait Replicator: Send + Sync {
    fn replicate(&self, chunk_id: u64, version: u32, sources: &[ReplicationSource]) -> u8;
}

/// The chunk-server opcount database. `read_inc`/`read_dec` must balance
/// per spec invariant 7 — every successful `refresh_connection` that picks
/// a chunkserver peer increments that peer's opcount, and the session's
/// teardown or next refresh decrements it.
pub trait ChunkServerDb: Send + Sync {
    fn read_inc(&self, ip: u32, port: u16);
    fn read_dec(&self, ip: u32, port: u16);
    /// Used by `chunksrv-masterconn`'s telemetry push and `chunksrv-readcache`'s
    /// peer selection to find the least-loaded of a chunk's known copies.
    fn opcount(&self, ip: u32, port: u16) -> u32;
}

/// One chunkserver copy of a chunk, as carried in `fs_readchunk`'s
/// `csdata[]` (6 bytes each on the wire: `ip:u32, port:u16`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkServerCandidate {
    pub ip: u32,
    pub port: u16,
}

/// What the master knows about one `(inode, chunk_index)`: its length,
/// chunk id/version, and every chunkserver copy currently available.
/// `chunk_id == 0 && candidates.is_empty()` is a hole (no storage
/// allocated yet for this index); `chunk_id != 0 && candidates.is_empty()`
/// means every copy is currently unreachable ("no valid copies").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkLocation {
    pub file_length: u64,
    pub chunk_id: u64,
    pub version: u32,
    pub candidates: Vec<ChunkServerCandidate>,
}

/// Status codes `fs_readchunk` can return, named the way `readdata.c`
/// checks them (`status != 0`, `status == ERROR_ENOENT`).
pub const ERROR_ENOENT: u8 = 2;

/// The metadata-master RPC surface the read cache needs: which chunk
/// (and which chunkserver copies) back a given `(inode, chunk_index)`.
/// Peer selection among `candidates` (least-loaded via [`ChunkServerDb`])
/// is the read cache's job, not this trait's.
pub trait MasterRpc: Send + Sync {
    fn read_chunk(&self, inode: u32, index: u32) -> Result<ChunkLocation, u8>;
}
