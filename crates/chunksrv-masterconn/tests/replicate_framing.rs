use chunksrv_proto::bytes::Writer;
use chunksrv_proto::{Frame, FrameDecoder, MAX_BODY_SIZE};

// S4: REPLICATE framing boundary sizes — a body exactly at the 10000-byte
// ceiling decodes, one byte over is rejected as a protocol violation
// before any command-level parsing happens.
#[test]
fn replicate_body_at_exact_ceiling_decodes() {
    let mut w = Writer::new();
    w.u64(1).u32(1);
    let mut body = w.into_vec();
    let padding = MAX_BODY_SIZE as usize - body.len();
    body.extend(std::iter::repeat(0u8).take(padding));
    assert_eq!(body.len(), MAX_BODY_SIZE as usize);

    let frame = Frame {
        msg_type: chunksrv_proto::id::MATOCS_REPLICATE,
        body,
    };
    let encoded = frame.encode();
    let mut dec = FrameDecoder::new();
    dec.push_bytes(&encoded);
    let decoded = dec.try_decode_one().unwrap();
    assert!(decoded.is_some());
}

#[test]
fn body_one_byte_over_ceiling_is_rejected() {
    let mut header = Vec::new();
    header.extend_from_slice(&chunksrv_proto::id::MATOCS_REPLICATE.to_be_bytes());
    header.extend_from_slice(&(MAX_BODY_SIZE + 1).to_be_bytes());
    let mut dec = FrameDecoder::new();
    dec.push_bytes(&header);
    assert!(dec.try_decode_one().is_err());
}
