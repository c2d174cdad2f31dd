//! The master<->chunkserver message catalogue: `MATOCS_*` commands flow
//! master-to-chunkserver, `CSTOMA_*` replies flow the other way,
//! `ANTOCS_*`/`CSTOAN_*` are the checksum sub-protocol used by the
//! `mfsmetalogger`-style checksum verifier named in spec.md §6.

use crate::bytes::{ReadError, Reader, Writer};
use crate::frame::Frame;
use crate::structlog::StructureLogError;
use chunksrv_core::collaborators::{ChunkOpKind, ChunkOpRequest, ChunkRecord, ReplicationSource};
use thiserror::Error;

pub mod id {
    pub const MATOCS_CREATE: u32 = 410;
    pub const CSTOMA_CREATE: u32 = 411;
    pub const MATOCS_DELETE: u32 = 412;
    pub const CSTOMA_DELETE: u32 = 413;
    pub const MATOCS_SET_VERSION: u32 = 414;
    pub const CSTOMA_SET_VERSION: u32 = 415;
    pub const MATOCS_DUPLICATE: u32 = 416;
    pub const CSTOMA_DUPLICATE: u32 = 417;
    pub const MATOCS_TRUNCATE: u32 = 418;
    pub const CSTOMA_TRUNCATE: u32 = 419;
    pub const MATOCS_DUPTRUNC: u32 = 420;
    pub const CSTOMA_DUPTRUNC: u32 = 421;
    pub const MATOCS_CHUNKOP: u32 = 422;
    pub const CSTOMA_CHUNKOP: u32 = 423;
    pub const MATOCS_REPLICATE: u32 = 424;
    pub const CSTOMA_REPLICATE: u32 = 425;
    pub const MATOCS_STRUCTURE_LOG: u32 = 426;
    pub const MATOCS_STRUCTURE_LOG_ROTATE: u32 = 427;
    pub const ANTOCS_CHUNK_CHECKSUM: u32 = 428;
    pub const CSTOAN_CHUNK_CHECKSUM: u32 = 429;
    pub const ANTOCS_CHUNK_CHECKSUM_TAB: u32 = 430;
    pub const CSTOAN_CHUNK_CHECKSUM_TAB: u32 = 431;
    pub const ANTOAN_NOP: u32 = 0;
    pub const CSTOMA_REGISTER: u32 = 440;
    pub const CSTOMA_SPACE: u32 = 441;
    pub const CSTOMA_ERROR_OCCURRED: u32 = 442;
    pub const CSTOMA_CHUNK_DAMAGED: u32 = 443;
    pub const CSTOMA_CHUNK_LOST: u32 = 444;
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("unknown command type {0:#x}")]
    UnknownCommand(u32),
    #[error("command {command_type:#x} body length {actual} does not match expected {expected}")]
    BadLength { command_type: u32, expected: u32, actual: u32 },
    #[error(transparent)]
    Body(#[from] ReadError),
    #[error(transparent)]
    StructureLog(#[from] StructureLogError),
}

/// Rejects trailing bytes a `Reader` would otherwise silently ignore: the
/// original KILLs the connection when a command's body length doesn't
/// match its schema exactly, rather than just checking for enough bytes.
fn expect_exact_len(msg_type: u32, body_len: usize, expected: usize) -> Result<(), DecodeError> {
    if body_len != expected {
        return Err(DecodeError::BadLength {
            command_type: msg_type,
            expected: expected as u32,
            actual: body_len as u32,
        });
    }
    Ok(())
}

/// A decoded `MATOCS_*` command, the input side of the dispatch table in
/// spec.md §4.3.
#[derive(Debug, Clone)]
pub enum MasterCommand {
    Nop,
    Create { chunk_id: u64, version: u32 },
    Delete { chunk_id: u64, version: u32 },
    SetVersion { chunk_id: u64, old_version: u32, new_version: u32 },
    Duplicate { chunk_id: u64, version: u32, copy_chunk_id: u64, copy_version: u32 },
    Truncate { chunk_id: u64, version: u32, new_version: u32, length: u32 },
    DupTrunc { chunk_id: u64, version: u32, copy_chunk_id: u64, copy_version: u32, length: u32 },
    ChunkOp(ChunkOpRequest),
    Replicate { chunk_id: u64, version: u32, sources: Vec<ReplicationSource> },
    StructureLog { version: u64, entry: Vec<u8> },
    StructureLogRotate,
    ChunkChecksum { chunk_id: u64, version: u32 },
    ChunkChecksumTab { chunk_id: u64, version: u32 },
}

impl MasterCommand {
    pub fn decode(frame: &Frame) -> Result<Self, DecodeError> {
        use id::*;
        let mut r = Reader::new(&frame.body);
        Ok(match frame.msg_type {
            ANTOAN_NOP => MasterCommand::Nop,
            MATOCS_CREATE => {
                expect_exact_len(frame.msg_type, frame.body.len(), 12)?;
                MasterCommand::Create {
                    chunk_id: r.u64()?,
                    version: r.u32()?,
                }
            }
            MATOCS_DELETE => {
                expect_exact_len(frame.msg_type, frame.body.len(), 12)?;
                MasterCommand::Delete {
                    chunk_id: r.u64()?,
                    version: r.u32()?,
                }
            }
            MATOCS_SET_VERSION => {
                expect_exact_len(frame.msg_type, frame.body.len(), 16)?;
                MasterCommand::SetVersion {
                    chunk_id: r.u64()?,
                    old_version: r.u32()?,
                    new_version: r.u32()?,
                }
            }
            MATOCS_DUPLICATE => {
                expect_exact_len(frame.msg_type, frame.body.len(), 24)?;
                MasterCommand::Duplicate {
                    chunk_id: r.u64()?,
                    version: r.u32()?,
                    copy_chunk_id: r.u64()?,
                    copy_version: r.u32()?,
                }
            }
            MATOCS_TRUNCATE => {
                expect_exact_len(frame.msg_type, frame.body.len(), 20)?;
                MasterCommand::Truncate {
                    chunk_id: r.u64()?,
                    version: r.u32()?,
                    new_version: r.u32()?,
                    length: r.u32()?,
                }
            }
            MATOCS_DUPTRUNC => {
                expect_exact_len(frame.msg_type, frame.body.len(), 28)?;
                MasterCommand::DupTrunc {
                    chunk_id: r.u64()?,
                    version: r.u32()?,
                    copy_chunk_id: r.u64()?,
                    copy_version: r.u32()?,
                    length: r.u32()?,
                }
            }
            MATOCS_CHUNKOP => {
                expect_exact_len(frame.msg_type, frame.body.len(), 32)?;
                let chunk_id = r.u64()?;
                let version = r.u32()?;
                let new_version = r.u32()?;
                let copy_chunk_id = r.u64()?;
                let copy_version = r.u32()?;
                let length = r.u32()?;
                MasterCommand::ChunkOp(ChunkOpRequest {
                    kind: ChunkOpKind::Generic,
                    chunk_id,
                    version,
                    new_version,
                    copy_chunk_id,
                    copy_version,
                    length,
                })
            }
            MATOCS_REPLICATE => {
                let chunk_id = r.u64()?;
                let version = r.u32()?;
                // Single-source fast path: exactly 18 bytes total, no
                // per-source fields beyond the shared (ip, port) pair —
                // handled before entering the generic loop below, which
                // only ever sees the 12+18n multi-source shape.
                if frame.body.len() == 18 {
                    let ip = r.u32()?;
                    let port = r.u16()?;
                    return Ok(MasterCommand::Replicate {
                        chunk_id,
                        version,
                        sources: vec![ReplicationSource {
                            chunk_id,
                            version,
                            ip,
                            port,
                        }],
                    });
                }
                let remaining = frame.body.len() - 12;
                if remaining == 0 || remaining % 18 != 0 || remaining / 18 > 100 {
                    return Err(DecodeError::Body(crate::bytes::ReadError::Truncated {
                        need: 18,
                        have: remaining,
                    }));
                }
                let mut sources = Vec::with_capacity(remaining / 18);
                while r.remaining() >= 18 {
                    sources.push(ReplicationSource {
                        chunk_id: r.u64()?,
                        version: r.u32()?,
                        ip: r.u32()?,
                        port: r.u16()?,
                    });
                }
                MasterCommand::Replicate {
                    chunk_id,
                    version,
                    sources,
                }
            }
            MATOCS_STRUCTURE_LOG => {
                let entry = r.rest().to_vec();
                crate::structlog::StructureLogEntry::validate(&entry)?;
                let (version, text) = crate::structlog::decode_tagged(&entry);
                MasterCommand::StructureLog { version, entry: text }
            }
            MATOCS_STRUCTURE_LOG_ROTATE => MasterCommand::StructureLogRotate,
            ANTOCS_CHUNK_CHECKSUM => {
                expect_exact_len(frame.msg_type, frame.body.len(), 12)?;
                MasterCommand::ChunkChecksum {
                    chunk_id: r.u64()?,
                    version: r.u32()?,
                }
            }
            ANTOCS_CHUNK_CHECKSUM_TAB => {
                expect_exact_len(frame.msg_type, frame.body.len(), 12)?;
                MasterCommand::ChunkChecksumTab {
                    chunk_id: r.u64()?,
                    version: r.u32()?,
                }
            }
            other => return Err(DecodeError::UnknownCommand(other)),
        })
    }
}

/// The registration packet's common payload, shared by all three
/// versions: this chunkserver's own address, used/total space (primary
/// and to-delete), and the full chunk listing.
#[derive(Debug, Clone)]
pub struct RegisterPayload {
    pub my_ip: u32,
    pub my_port: u16,
    pub used_space: u64,
    pub total_space: u64,
    pub to_delete_used_space: u64,
    pub to_delete_total_space: u64,
    pub to_delete_chunk_count: u32,
    pub chunks: Vec<ChunkRecord>,
}

impl RegisterPayload {
    fn write_common(&self, w: &mut Writer) {
        w.u32(self.my_ip).u16(self.my_port);
    }

    fn write_space_and_chunks(&self, w: &mut Writer) {
        w.u64(self.used_space).u64(self.total_space);
        w.u32(self.chunks.len() as u32);
        w.u64(self.to_delete_used_space).u64(self.to_delete_total_space);
        w.u32(self.to_delete_chunk_count);
        for c in &self.chunks {
            w.u64(c.chunk_id).u32(c.version);
        }
    }
}

/// A `CSTOMA_*`/`CSTOAN_*` reply, the output side of the dispatch table.
#[derive(Debug, Clone)]
pub enum ChunkServerReply {
    StatusOnly { msg_type: u32, chunk_id: u64, status: u8 },
    /// `CSTOMA_REPLICATE`'s reply echoes the chunk version back alongside
    /// the status byte, unlike the other `StatusOnly` chunk-op replies.
    ReplicateStatus { chunk_id: u64, version: u32, status: u8 },
    /// `MATOCS_CHUNKOP`'s reply echoes every input field back alongside
    /// the status byte, unlike the other five chunk ops.
    ChunkOpStatus {
        chunk_id: u64,
        version: u32,
        new_version: u32,
        copy_chunk_id: u64,
        copy_version: u32,
        length: u32,
        status: u8,
    },
    ChunkChecksum { chunk_id: u64, version: u32, checksum: u32, status: u8 },
    ChunkChecksumTab { chunk_id: u64, version: u32, checksum_tab: Vec<u8>, status: u8 },
    Space {
        used_space: u64,
        total_space: u64,
        chunk_count: u32,
        to_delete_used_space: u64,
        to_delete_total_space: u64,
        to_delete_chunk_count: u32,
    },
    ErrorOccurred,
    ChunkDamaged { chunk_ids: Vec<u64> },
    ChunkLost { chunk_ids: Vec<u64> },
    RegisterV2(RegisterPayload),
    RegisterV3 { timeout: u16, payload: RegisterPayload },
    RegisterV4 { version_major: u16, version_mid: u8, version_min: u8, timeout: u16, payload: RegisterPayload },
}

impl ChunkServerReply {
    pub fn encode(&self) -> Frame {
        use id::*;
        let mut w = Writer::new();
        let msg_type = match self {
            ChunkServerReply::StatusOnly { msg_type, chunk_id, status } => {
                w.u64(*chunk_id).u8(*status);
                *msg_type
            }
            ChunkServerReply::ReplicateStatus { chunk_id, version, status } => {
                w.u64(*chunk_id).u32(*version).u8(*status);
                CSTOMA_REPLICATE
            }
            ChunkServerReply::ChunkOpStatus {
                chunk_id,
                version,
                new_version,
                copy_chunk_id,
                copy_version,
                length,
                status,
            } => {
                w.u64(*chunk_id)
                    .u32(*version)
                    .u32(*new_version)
                    .u64(*copy_chunk_id)
                    .u32(*copy_version)
                    .u32(*length)
                    .u8(*status);
                CSTOMA_CHUNKOP
            }
            ChunkServerReply::ChunkChecksum { chunk_id, version, checksum, status } => {
                w.u64(*chunk_id).u32(*version).u32(*checksum).u8(*status);
                CSTOAN_CHUNK_CHECKSUM
            }
            ChunkServerReply::ChunkChecksumTab { chunk_id, version, checksum_tab, status } => {
                w.u64(*chunk_id).u32(*version).bytes(checksum_tab).u8(*status);
                CSTOAN_CHUNK_CHECKSUM_TAB
            }
            ChunkServerReply::Space {
                used_space,
                total_space,
                chunk_count,
                to_delete_used_space,
                to_delete_total_space,
                to_delete_chunk_count,
            } => {
                w.u64(*used_space)
                    .u64(*total_space)
                    .u32(*chunk_count)
                    .u64(*to_delete_used_space)
                    .u64(*to_delete_total_space)
                    .u32(*to_delete_chunk_count);
                CSTOMA_SPACE
            }
            ChunkServerReply::ErrorOccurred => CSTOMA_ERROR_OCCURRED,
            ChunkServerReply::ChunkDamaged { chunk_ids } => {
                for id in chunk_ids {
                    w.u64(*id);
                }
                CSTOMA_CHUNK_DAMAGED
            }
            ChunkServerReply::ChunkLost { chunk_ids } => {
                for id in chunk_ids {
                    w.u64(*id);
                }
                CSTOMA_CHUNK_LOST
            }
            ChunkServerReply::RegisterV2(payload) => {
                payload.write_common(&mut w);
                payload.write_space_and_chunks(&mut w);
                CSTOMA_REGISTER
            }
            ChunkServerReply::RegisterV3 { timeout, payload } => {
                payload.write_common(&mut w);
                w.u16(*timeout);
                payload.write_space_and_chunks(&mut w);
                CSTOMA_REGISTER
            }
            ChunkServerReply::RegisterV4 {
                version_major,
                version_mid,
                version_min,
                timeout,
                payload,
            } => {
                w.u16(*version_major).u8(*version_mid).u8(*version_min);
                payload.write_common(&mut w);
                w.u16(*timeout);
                payload.write_space_and_chunks(&mut w);
                CSTOMA_REGISTER
            }
        };
        Frame {
            msg_type,
            body: w.into_vec(),
        }
    }
}

/// Converts the job kind back into the reply `msg_type` a finished
/// `ChunkOp`/create/delete/... job should carry, used by
/// `chunksrv-masterconn` when finalizing a detached reply packet.
pub fn chunk_op_status_msg_type(kind: ChunkOpKind) -> u32 {
    use id::*;
    match kind {
        ChunkOpKind::Create => CSTOMA_CREATE,
        ChunkOpKind::Delete => CSTOMA_DELETE,
        ChunkOpKind::SetVersion => CSTOMA_SET_VERSION,
        ChunkOpKind::Duplicate => CSTOMA_DUPLICATE,
        ChunkOpKind::Truncate => CSTOMA_TRUNCATE,
        ChunkOpKind::DupTrunc => CSTOMA_DUPTRUNC,
        ChunkOpKind::Generic => {
            unreachable!("MATOCS_CHUNKOP replies use ChunkServerReply::ChunkOpStatus, not StatusOnly")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_create_command() {
        let mut w = Writer::new();
        w.u64(7).u32(1);
        let frame = Frame {
            msg_type: id::MATOCS_CREATE,
            body: w.into_vec(),
        };
        match MasterCommand::decode(&frame).unwrap() {
            MasterCommand::Create { chunk_id, version } => {
                assert_eq!(chunk_id, 7);
                assert_eq!(version, 1);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn decodes_replicate_with_multiple_sources() {
        let mut w = Writer::new();
        w.u64(1).u32(2);
        w.u64(1).u32(2).u32(0x0A000001).u16(9422);
        w.u64(1).u32(1).u32(0x0A000002).u16(9422);
        let frame = Frame {
            msg_type: id::MATOCS_REPLICATE,
            body: w.into_vec(),
        };
        match MasterCommand::decode(&frame).unwrap() {
            MasterCommand::Replicate { sources, .. } => assert_eq!(sources.len(), 2),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn decodes_replicate_single_source_fast_path() {
        let mut w = Writer::new();
        w.u64(1).u32(2).u32(0x0A000001).u16(9422);
        let frame = Frame {
            msg_type: id::MATOCS_REPLICATE,
            body: w.into_vec(),
        };
        match MasterCommand::decode(&frame).unwrap() {
            MasterCommand::Replicate { sources, .. } => assert_eq!(sources.len(), 1),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn rejects_replicate_with_more_than_100_sources() {
        let mut w = Writer::new();
        w.u64(1).u32(2);
        for _ in 0..101 {
            w.u64(1).u32(1).u32(0x0A000001).u16(9422);
        }
        let frame = Frame {
            msg_type: id::MATOCS_REPLICATE,
            body: w.into_vec(),
        };
        assert!(MasterCommand::decode(&frame).is_err());
    }

    #[test]
    fn unknown_command_type_errors() {
        let frame = Frame {
            msg_type: 0xDEAD,
            body: vec![],
        };
        assert!(matches!(
            MasterCommand::decode(&frame),
            Err(DecodeError::UnknownCommand(0xDEAD))
        ));
    }

    #[test]
    fn status_reply_round_trips_through_decode() {
        let reply = ChunkServerReply::StatusOnly {
            msg_type: id::CSTOMA_CREATE,
            chunk_id: 99,
            status: 0,
        };
        let frame = reply.encode();
        assert_eq!(frame.msg_type, id::CSTOMA_CREATE);
        let mut r = Reader::new(&frame.body);
        assert_eq!(r.u64().unwrap(), 99);
        assert_eq!(r.u8().unwrap(), 0);
    }
}
