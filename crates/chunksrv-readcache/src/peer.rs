use std::io;

/// A connection to one chunkserver, opened for a single session's sticky
/// use. Dropping it closes the underlying transport.
pub trait ChunkPeerConn: Send {
    fn read_block(
        &mut self,
        chunk_id: u64,
        version: u32,
        offset: u32,
        size: u32,
        buf: &mut [u8],
    ) -> io::Result<()>;
}

/// Dials a chunkserver by address, the Rust analogue of `tcpsocket` +
/// `tcpnodelay` + `tcpnumconnect` in `readdata.c`.
pub trait ChunkPeerClient: Send + Sync {
    fn connect(&self, ip: u32, port: u16) -> io::Result<Box<dyn ChunkPeerConn>>;
}

/// A real TCP-backed client, using `cs_readblock`'s framing conventions:
/// connect, send `(chunk_id, version, offset, size)`, read back a status
/// byte followed by `size` bytes of data.
pub mod tcp {
    use super::*;
    use std::io::{Read, Write};
    use std::net::{Ipv4Addr, TcpStream};
    use std::time::Duration;

    pub struct TcpChunkPeerClient {
        pub connect_timeout: Duration,
    }

    impl Default for TcpChunkPeerClient {
        fn default() -> Self {
            Self {
                connect_timeout: Duration::from_secs(5),
            }
        }
    }

    impl ChunkPeerClient for TcpChunkPeerClient {
        fn connect(&self, ip: u32, port: u16) -> io::Result<Box<dyn ChunkPeerConn>> {
            let addr = (Ipv4Addr::from(ip), port);
            let stream = TcpStream::connect_timeout(
                &std::net::SocketAddr::from(addr),
                self.connect_timeout,
            )?;
            stream.set_nodelay(true)?;
            Ok(Box::new(TcpChunkPeerConn { stream }))
        }
    }

    struct TcpChunkPeerConn {
        stream: TcpStream,
    }

    impl ChunkPeerConn for TcpChunkPeerConn {
        fn read_block(
            &mut self,
            chunk_id: u64,
            version: u32,
            offset: u32,
            size: u32,
            buf: &mut [u8],
        ) -> io::Result<()> {
            let mut req = Vec::with_capacity(20);
            req.extend_from_slice(&chunk_id.to_be_bytes());
            req.extend_from_slice(&version.to_be_bytes());
            req.extend_from_slice(&offset.to_be_bytes());
            req.extend_from_slice(&size.to_be_bytes());
            self.stream.write_all(&req)?;
            let mut status = [0u8; 1];
            self.stream.read_exact(&mut status)?;
            if status[0] != 0 {
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    format!("chunkserver returned status {}", status[0]),
                ));
            }
            self.stream.read_exact(&mut buf[..size as usize])
        }
    }
}
