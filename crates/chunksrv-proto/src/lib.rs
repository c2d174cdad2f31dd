//! Wire protocol: the length-prefixed frame codec, the master<->chunkserver
//! message catalogue, and structure-log (changelog) entry validation.

pub mod bytes;
pub mod frame;
pub mod structlog;
pub mod types;

pub use frame::{Frame, FrameDecoder, FrameError, HEADER_SIZE, MAX_BODY_SIZE};
pub use structlog::{StructureLogEntry, StructureLogError};
pub use types::{id, ChunkServerReply, DecodeError, MasterCommand};
