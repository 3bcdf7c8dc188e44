// Copyright (C) 2025 Tom Waddington
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.

//! Error path tests for the codec, the framer and a live connection
//!
//! Error messages are checked for content so a regression in the
//! reported position or preview shows up here.

use nrepl_server::codec::{MAX_NESTING_DEPTH, decode, decode_value};
use nrepl_server::framer::{ScanResult, find_bencode_end};
use nrepl_server::{BuiltinEvaluator, Framer, NReplError, NReplServer, ServerConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

#[test]
fn test_decode_empty_input() {
    let err = decode(b"").expect_err("empty input should fail");
    assert!(matches!(err, NReplError::Protocol { .. }));
}

#[test]
fn test_decode_non_dict_has_preview() {
    let err = decode(b"i42e").expect_err("integer is not a request");
    let msg = err.to_string();
    assert!(msg.contains("buffer preview"), "missing preview: {}", msg);
    assert!(msg.contains("69 34 32 65"), "preview should be hex: {}", msg);
}

#[test]
fn test_decode_incomplete_string() {
    let err = decode(b"d2:op10:evae").expect_err("short string body");
    match err {
        NReplError::TruncatedInput {
            expected,
            available,
            ..
        } => {
            assert_eq!(expected, 10);
            assert!(available < expected);
        }
        other => panic!("Expected TruncatedInput, got {:?}", other),
    }
}

#[test]
fn test_decode_integer_overflow() {
    let err = decode(b"d2:idi99999999999999999999ee").expect_err("integer overflow");
    assert!(matches!(err, NReplError::Format { .. }));
}

#[test]
fn test_decode_value_invalid_length() {
    let err = decode_value(b"x:abc").expect_err("non-numeric length");
    let msg = err.to_string();
    assert!(msg.contains("byte 0"), "position should be reported: {}", msg);
}

#[test]
fn test_scan_rejects_overlong_length() {
    assert_eq!(
        find_bencode_end(b"d123456789012345678901:x"),
        ScanResult::Invalid
    );
    assert_eq!(find_bencode_end(b"d3x"), ScanResult::Invalid);
}

#[test]
fn test_framer_skips_garbage_then_frames() {
    let mut framer = Framer::new();
    let mut buf = b"\x01\x02\xffd2:op8:describee".to_vec();

    let frame = framer.next_frame(&mut buf).expect("frame after garbage");
    assert_eq!(frame, b"d2:op8:describee");
    assert!(buf.is_empty());
}

#[test]
fn test_error_recoverability() {
    let io = NReplError::Connection(std::io::Error::other("reset"));
    assert!(!io.is_recoverable());
    assert!(NReplError::UnknownOperation("x".to_string()).is_recoverable());
    assert!(NReplError::protocol("bad", 3).is_recoverable());
}

#[tokio::test]
async fn test_undecodable_frame_is_dropped_and_connection_survives() {
    let server = NReplServer::new(Arc::new(BuiltinEvaluator::new()))
        .bind(&ServerConfig::new("127.0.0.1", 0))
        .await
        .expect("Failed to bind server");
    let mut stream = TcpStream::connect(server.local_addr())
        .await
        .expect("Failed to connect");

    // a framed list is not a request
    stream
        .write_all(b"5:li1ee")
        .await
        .expect("write failed");
    stream
        .write_all(b"23:d2:id1:92:op8:describee")
        .await
        .expect("write failed");

    let mut header = [0u8; 4];
    tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut header))
        .await
        .expect("timed out")
        .expect("read failed");
    let mut body = vec![0u8; u32::from_be_bytes(header) as usize];
    stream.read_exact(&mut body).await.expect("read failed");

    let reply = decode(&body).expect("reply should decode");
    assert_eq!(reply["id"].as_str(), Some("9"));

    server.stop();
    server.join().await.expect("join failed");
}

#[test]
fn test_decode_rejects_deep_nesting() {
    let mut data = b"d1:a".to_vec();
    data.extend(std::iter::repeat_n(b'l', 50_000));
    data.extend(std::iter::repeat_n(b'e', 50_001));

    let err = decode(&data).expect_err("nesting past the limit");
    assert!(matches!(err, NReplError::Format { .. }));
    assert!(err.to_string().contains(&MAX_NESTING_DEPTH.to_string()));
}

#[tokio::test]
async fn test_deeply_nested_frame_is_dropped_and_server_survives() {
    let server = NReplServer::new(Arc::new(BuiltinEvaluator::new()))
        .bind(&ServerConfig::new("127.0.0.1", 0))
        .await
        .expect("Failed to bind server");
    let mut stream = TcpStream::connect(server.local_addr())
        .await
        .expect("Failed to connect");

    let mut body = b"d1:a".to_vec();
    body.extend(std::iter::repeat_n(b'l', 100_000));
    body.extend(std::iter::repeat_n(b'e', 100_001));
    let mut request = format!("{}:", body.len()).into_bytes();
    request.extend_from_slice(&body);
    request.extend_from_slice(b"23:d2:id1:82:op8:describee");
    stream.write_all(&request).await.expect("write failed");

    let mut header = [0u8; 4];
    tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut header))
        .await
        .expect("timed out")
        .expect("read failed");
    let mut reply = vec![0u8; u32::from_be_bytes(header) as usize];
    stream.read_exact(&mut reply).await.expect("read failed");
    let reply = decode(&reply).expect("reply should decode");
    assert_eq!(reply["id"].as_str(), Some("8"));

    // a second client can still connect
    assert!(TcpStream::connect(server.local_addr()).await.is_ok());

    server.stop();
    server.join().await.expect("join failed");
}
