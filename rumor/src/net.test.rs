use super::*;
use crate::envelope::{Envelope, Kind};
use crate::node::Node;
use crate::value::Value;
use assert_matches::assert_matches;
use std::net::SocketAddr;

fn sample_envelope() -> Envelope {
    let a = Node::new("A", SocketAddr::from(([10, 0, 0, 1], 9000)));
    Envelope::call(
        &a,
        SocketAddr::from(([10, 0, 0, 2], 9000)),
        "echo",
        vec![Value::from("hi"), Value::from(vec![Value::from(1), Value::Null])],
        CallId(42),
    )
}

#[test]
fn test_envelope_frame_encode_decode() {
    let envelope = sample_envelope();
    let frame = Frame::ok(envelope.clone());

    let encoded = frame.encode().unwrap();

    // Verify the length prefix
    let mut prefix_bytes = encoded.slice(0..LENGTH_PREFIX);
    assert_eq!(prefix_bytes.get_u64(), (encoded.len() - LENGTH_PREFIX) as u64);

    let body_bytes = encoded.slice(LENGTH_PREFIX..encoded.len());
    let decoded = Frame::<Envelope>::decode(body_bytes).unwrap();

    match decoded.payload {
        Payload::Ok(decoded) => {
            assert_eq!(decoded, envelope);
            assert_eq!(decoded.kind(), Kind::Call);
            assert_eq!(decoded.call_id(), Some(CallId(42)));
        }
        _ => panic!("Decoded wrong payload"),
    }
}

#[test]
fn test_frame_parser_handles_partial_input() {
    let encoded1 = Frame::ok(sample_envelope()).encode().unwrap();
    let encoded2 = Frame::ok(Ack {
        call_id: Some(CallId(3)),
    })
    .encode()
    .unwrap();

    let mut reader = FrameParser::<Envelope>::new();

    reader.extend(&encoded1[0..4]);
    assert!(reader.parse().unwrap().is_none());

    reader.extend(&encoded1[4..]);
    let parsed = reader.parse().unwrap().unwrap();
    assert_eq!(parsed.payload.ok().map(|e| e.resource().to_string()), Some("echo".into()));
    assert!(reader.parse().unwrap().is_none());

    let mut acks = FrameParser::<Ack>::new();
    acks.extend(&encoded2);
    let ack = acks.parse().unwrap().unwrap();
    assert_eq!(ack.payload.ok(), Some(Ack { call_id: Some(CallId(3)) }));
}

#[test]
fn test_failure_frame_keeps_reason() {
    let encoded = Frame::<Ack>::failure("inbound queue closed").encode().unwrap();
    let frame = Frame::<Ack>::decode_datagram(&encoded).unwrap();
    assert!(!frame.is_ok());
    assert_eq!(
        frame.payload.failure_reason().map(String::as_str),
        Some("inbound queue closed")
    );
}

#[test]
fn test_truncated_datagram_is_rejected() {
    let encoded = Frame::ok(sample_envelope()).encode().unwrap();
    let result = Frame::<Envelope>::decode_datagram(&encoded[..encoded.len() - 3]);
    assert_matches!(result, Err(NetError::InsufficientData { .. }));
}

#[test]
fn test_protocol_version_mismatch() {
    let mut frame = Frame::ok(sample_envelope());
    frame.header.protocol_version = CURRENT_PROTOCOL_VERSION + 1;
    let encoded = frame.encode().unwrap();
    let result = Frame::<Envelope>::decode(encoded.slice(LENGTH_PREFIX..));
    assert_matches!(
        result,
        Err(NetError::ProtocolVersionMismatch { expected, actual })
            if expected == CURRENT_PROTOCOL_VERSION && actual == CURRENT_PROTOCOL_VERSION + 1
    );
}

#[test]
fn test_oversized_length_prefix_is_rejected() {
    let mut parser = FrameParser::<Envelope>::new();
    parser.extend(&((MAX_FRAME_LEN as u64) + 1).to_be_bytes());
    assert_matches!(parser.parse(), Err(NetError::FrameTooLarge(_)));
}

#[tokio::test]
async fn test_reader_and_writer_over_duplex() {
    let (client, server) = tokio::io::duplex(64);
    let (server_read, _server_write) = tokio::io::split(server);
    let (_client_read, client_write) = tokio::io::split(client);

    let mut writer = FrameWriter::<Envelope>::new(Box::new(client_write));
    let mut reader = FrameReader::<Envelope>::new(Box::new(server_read));

    let envelope = sample_envelope();
    let sent = envelope.clone();
    let write = tokio::spawn(async move {
        writer.write_frame(&Frame::ok(sent)).await.unwrap();
        writer.close().await;
    });

    let frame = reader.read_frame().await.unwrap().expect("one frame");
    assert_eq!(frame.payload.ok(), Some(envelope));
    write.await.unwrap();
    assert!(reader.read_frame().await.unwrap().is_none());
}
