//! Shared types for the chunk-server data plane: configuration, error
//! taxonomy, and the collaborator traits that stand in for the
//! out-of-scope HDD store, replicator, chunk-server database, and
//! metadata-master RPC layer.

pub mod collaborators;
pub mod config;
pub mod error;
pub mod version;

pub use collaborators::{
    ChunkLocation, ChunkListSummary, ChunkOpKind, ChunkOpRequest, ChunkRecord, ChunkServerCandidate,
    ChunkServerDb, HddStore, MasterRpc, ReplicationSource, Replicator,
};
pub use config::ChunkServerConfig;
pub use error::{MasterConnError, ReadError};
pub use version::ProtocolVersion;
