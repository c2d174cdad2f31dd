use std::io;
use thiserror::Error;

/// Errors the Master-Connection Protocol Engine raises internally. Per the
/// error handling design, only these kill the connection (`mode = KILL`);
/// collaborator operation-status bytes never become a Rust error at this
/// boundary.
#[derive(Debug, Error)]
pub enum MasterConnError {
    #[error("frame body of {size} bytes exceeds the 10000-byte limit")]
    FrameTooLarge { size: u32 },

    #[error("received unknown command type {command_type:#x}")]
    UnknownCommand { command_type: u32 },

    #[error("command {command_type:#x} body length {actual} does not match expected {expected}")]
    BadBodyLength {
        command_type: u32,
        expected: u32,
        actual: u32,
    },

    #[error("read timed out after no frame in {elapsed_secs}s")]
    ReadTimeout { elapsed_secs: u16 },

    #[error("dns resolution of master host {host:?} failed: {source}")]
    Resolve {
        host: String,
        #[source]
        source: io::Error,
    },

    #[error("i/o error on master connection: {0}")]
    Io(#[from] io::Error),

    #[error("job pool rejected submission: queue is full")]
    JobPoolFull,
}

/// The four negative status codes `read_data` can return, per
/// `mfsmount/readdata.c`. `Io` covers the generic `-1` transient-failure
/// case (used up all retries on a connect/read failure that was neither
/// stale-inode nor no-copies).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ReadError {
    #[error("inode is stale (file removed or FS returned ENOENT)")]
    StaleInode,
    #[error("chunk has no valid copies available")]
    NoValidCopies,
    #[error("exhausted retries against chunkservers")]
    Io,
    #[error("out of memory allocating read buffer")]
    OutOfMemory,
}

impl ReadError {
    /// POSIX errno this maps onto at the mount boundary, the nearest
    /// equivalent a real mount layer would surface to `read(2)`.
    pub fn to_errno(self) -> i32 {
        match self {
            ReadError::StaleInode => libc_enoent(),
            ReadError::NoValidCopies => libc_eio(),
            ReadError::Io => libc_eio(),
            ReadError::OutOfMemory => libc_enomem(),
        }
    }
}

// Small local constants instead of a `libc` dependency: chunksrv-core has
// no other use for raw FFI, and these four values are fixed across every
// POSIX target this crate supports.
fn libc_enoent() -> i32 {
    2
}
fn libc_eio() -> i32 {
    5
}
fn libc_enomem() -> i32 {
    12
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(ReadError::StaleInode.to_errno(), 2);
        assert_eq!(ReadError::NoValidCopies.to_errno(), 5);
        assert_eq!(ReadError::Io.to_errno(), 5);
        assert_eq!(ReadError::OutOfMemory.to_errno(), 12);
    }
}
