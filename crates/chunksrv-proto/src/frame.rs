use thiserror::Error;

/// Header is a fixed 8 bytes: `type:u32 BE, size:u32 BE`, matching
/// `masterconn_read`'s `mode == HEADER` parsing.
pub const HEADER_SIZE: usize = 8;

/// Bodies larger than this are a protocol violation and kill the
/// connection, matching `masterconn.c`'s hard-coded body-size ceiling.
pub const MAX_BODY_SIZE: u32 = 10_000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame body of {size} bytes exceeds the {MAX_BODY_SIZE}-byte limit")]
    TooLarge { size: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub msg_type: u32,
    pub body: Vec<u8>,
}

impl Frame {
    /// Encodes `type`, `size`, and `body` into a single contiguous buffer
    /// ready to hand to the write loop.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_SIZE + self.body.len());
        out.extend_from_slice(&self.msg_type.to_be_bytes());
        out.extend_from_slice(&(self.body.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.body);
        out
    }
}

/// Incrementally reassembles frames out of a byte stream coming from a
/// non-blocking socket. Callers append newly-read bytes with
/// [`FrameDecoder::push_bytes`] and then drain as many complete frames as
/// are available with [`FrameDecoder::try_decode_one`], matching the
/// header-then-body two-phase read `masterconn_read` performs, but
/// buffered so a reactor can call it once per readiness event regardless
/// of how many bytes actually arrived.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn push_bytes(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// `Ok(None)` means "not enough bytes yet, try again after the next
    /// read"; `Err` is a protocol violation the caller should treat as
    /// fatal (transition to `KILL`).
    pub fn try_decode_one(&mut self) -> Result<Option<Frame>, FrameError> {
        if self.buf.len() < HEADER_SIZE {
            return Ok(None);
        }
        let msg_type = u32::from_be_bytes(self.buf[0..4].try_into().unwrap());
        let size = u32::from_be_bytes(self.buf[4..8].try_into().unwrap());
        if size > MAX_BODY_SIZE {
            return Err(FrameError::TooLarge { size });
        }
        let total = HEADER_SIZE + size as usize;
        if self.buf.len() < total {
            return Ok(None);
        }
        let body = self.buf[HEADER_SIZE..total].to_vec();
        self.buf.drain(0..total);
        Ok(Some(Frame { msg_type, body }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_frame() {
        let frame = Frame {
            msg_type: 205,
            body: vec![1, 2, 3, 4, 5],
        };
        let encoded = frame.encode();
        let mut dec = FrameDecoder::new();
        dec.push_bytes(&encoded);
        let decoded = dec.try_decode_one().unwrap().unwrap();
        assert_eq!(decoded, frame);
        assert!(dec.try_decode_one().unwrap().is_none());
    }

    #[test]
    fn handles_split_reads() {
        let frame = Frame {
            msg_type: 1,
            body: vec![9; 20],
        };
        let encoded = frame.encode();
        let mut dec = FrameDecoder::new();
        for byte in &encoded {
            assert!(dec.try_decode_one().unwrap().is_none() || dec.buf.is_empty());
            dec.push_bytes(std::slice::from_ref(byte));
        }
        let decoded = dec.try_decode_one().unwrap().unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn rejects_oversized_body() {
        let mut dec = FrameDecoder::new();
        let mut header = Vec::new();
        header.extend_from_slice(&1u32.to_be_bytes());
        header.extend_from_slice(&(MAX_BODY_SIZE + 1).to_be_bytes());
        dec.push_bytes(&header);
        assert_eq!(
            dec.try_decode_one(),
            Err(FrameError::TooLarge {
                size: MAX_BODY_SIZE + 1
            })
        );
    }

    #[test]
    fn decodes_multiple_queued_frames() {
        let a = Frame {
            msg_type: 1,
            body: vec![1],
        };
        let b = Frame {
            msg_type: 2,
            body: vec![2, 2],
        };
        let mut dec = FrameDecoder::new();
        dec.push_bytes(&a.encode());
        dec.push_bytes(&b.encode());
        assert_eq!(dec.try_decode_one().unwrap().unwrap(), a);
        assert_eq!(dec.try_decode_one().unwrap().unwrap(), b);
        assert_eq!(dec.try_decode_one().unwrap(), None);
    }
}
