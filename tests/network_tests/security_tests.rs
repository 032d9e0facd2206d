//! Transport Security Tests
//!
//! These tests verify:
//! - Parsing of the security request frame
//! - A TLS-enabled handle refuses anything but a valid request first
//! - An accepted request is answered with `S` and followed by a handshake
//! - A full handshake over a socket pair, then normal traffic
//! - A ClientHello sent in the same write as the request
//! - Security state is reset when a handle is reused
//! - Loading certificates and keys from PEM files

#[path = "../support/mod.rs"]
mod support;

use std::io::{Read, Write};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use sqlgate::network::{
    encode_request, load_server_tls, parse_request, ConnState, Negotiation, SecurityState,
    SECURITY_ACCEPT, SECURITY_PROTOCOL_VERSION, SECURITY_REQUEST_LEN,
};
use sqlgate::protocol::{encode_command, read_reply, write_command, Command, Response};
use sqlgate::GateError;
use support::{fixture, tls_client_config, tls_without_certs, Harness};
use tempfile::NamedTempFile;

// =============================================================================
// Request Parsing Tests
// =============================================================================

#[test]
fn test_parse_valid_request() {
    let frame = encode_request(SECURITY_PROTOCOL_VERSION);
    assert_eq!(frame.len(), SECURITY_REQUEST_LEN);
    assert_eq!(
        parse_request(&frame),
        Negotiation::Request {
            len: SECURITY_REQUEST_LEN
        }
    );
}

#[test]
fn test_parse_incomplete_request() {
    let frame = encode_request(SECURITY_PROTOCOL_VERSION);
    assert_eq!(parse_request(&[]), Negotiation::Incomplete);
    assert_eq!(parse_request(&frame[..3]), Negotiation::Incomplete);
    assert_eq!(parse_request(&frame[..7]), Negotiation::Incomplete);
}

#[test]
fn test_parse_trailing_bytes_not_consumed() {
    let mut frame = encode_request(SECURITY_PROTOCOL_VERSION);
    frame.extend_from_slice(&[0x16, 0x03, 0x01]);
    assert_eq!(
        parse_request(&frame),
        Negotiation::Request {
            len: SECURITY_REQUEST_LEN
        }
    );
}

#[test]
fn test_parse_unsupported_version() {
    assert_eq!(
        parse_request(&encode_request(2)),
        Negotiation::Unsupported { version: 2 }
    );
}

#[test]
fn test_parse_other_frame_is_malformed() {
    let ping = encode_command(&Command::Ping);
    assert!(matches!(parse_request(&ping), Negotiation::Malformed(_)));

    // Right type byte, wrong payload length
    let bad_len = [0x20, 0, 0, 0, 8, 0, 0, 0, 1, 0, 0, 0, 0];
    assert!(matches!(parse_request(&bad_len), Negotiation::Malformed(_)));
}

// =============================================================================
// Negotiation Tests
// =============================================================================

#[test]
fn test_tls_handle_starts_negotiating() {
    let mut h = Harness::with_tls(1, tls_without_certs());
    let (handle, _client) = h.connect(5, 0);

    let guard = handle.lock();
    assert_eq!(guard.state(), ConnState::NegotiatingSecurity);
    assert_eq!(guard.security_state(), SecurityState::NotNegotiated);
    assert!(!guard.handshake_completed());
}

#[test]
fn test_plain_frame_instead_of_request_closes() {
    let mut h = Harness::with_tls(1, tls_without_certs());
    let (handle, mut client) = h.connect(5, 0);

    client.send(&Command::Ping);
    assert!(h.wait_closed(0, &mut client));
    assert!(client.received().is_empty());
    assert!(handle.lock().is_pooled());
    assert!(h.probe.submitted.lock().is_empty());
}

#[test]
fn test_unsupported_version_closes() {
    let mut h = Harness::with_tls(1, tls_without_certs());
    let (handle, mut client) = h.connect(5, 0);

    client.send_raw(&encode_request(7));
    assert!(h.wait_closed(0, &mut client));
    assert!(client.received().is_empty());
    assert!(handle.lock().is_pooled());
}

#[test]
fn test_request_split_across_writes() {
    let mut h = Harness::with_tls(1, tls_without_certs());
    let (handle, mut client) = h.connect(5, 0);
    let request = encode_request(SECURITY_PROTOCOL_VERSION);

    client.send_raw(&request[..4]);
    assert!(h.turn_until(0, || handle.lock().receive_buffer().len() == 4));
    assert_eq!(handle.lock().security_state(), SecurityState::NotNegotiated);

    client.send_raw(&request[4..]);
    assert!(h.turn_until(0, || {
        client.fill();
        !client.received().is_empty()
    }));
    assert_eq!(client.received(), &[SECURITY_ACCEPT]);

    let guard = handle.lock();
    assert_eq!(guard.state(), ConnState::NegotiatingSecurity);
    assert_eq!(guard.security_state(), SecurityState::Negotiating);
    assert!(guard.receive_buffer().is_empty());
}

#[test]
fn test_garbage_after_accept_closes() {
    let mut h = Harness::with_tls(1, tls_without_certs());
    let (handle, mut client) = h.connect(5, 0);

    client.send_raw(&encode_request(SECURITY_PROTOCOL_VERSION));
    assert!(h.turn_until(0, || {
        client.fill();
        !client.received().is_empty()
    }));

    client.send_raw(b"this is not a TLS record");
    assert!(h.wait_closed(0, &mut client));
    // A TLS alert may follow the accept byte
    assert_eq!(client.received()[0], SECURITY_ACCEPT);
    assert!(handle.lock().is_pooled());
}

#[test]
fn test_request_without_tls_is_unknown_command() {
    let mut h = Harness::new(1);
    let (handle, mut client) = h.connect(5, 0);

    client.send_raw(&encode_request(SECURITY_PROTOCOL_VERSION));
    assert!(h.wait_closed(0, &mut client));
    assert!(client.received().is_empty());
    assert!(handle.lock().is_pooled());
}

#[test]
fn test_security_state_reset_on_reuse() {
    let mut h = Harness::with_tls(1, tls_without_certs());
    let (handle, mut client) = h.connect(5, 0);

    client.send_raw(&encode_request(SECURITY_PROTOCOL_VERSION));
    assert!(h.turn_until(0, || handle.lock().security_state() == SecurityState::Negotiating));
    drop(client);
    assert!(h.turn_until(0, || handle.lock().is_pooled()));

    let (again, _client) = h.connect(5, 0);
    assert!(Arc::ptr_eq(&handle, &again));
    let guard = again.lock();
    assert_eq!(guard.state(), ConnState::NegotiatingSecurity);
    assert_eq!(guard.security_state(), SecurityState::NotNegotiated);
    assert!(!guard.handshake_completed());
    assert!(guard.send_buffer().is_empty());
}

#[test]
fn test_full_handshake_then_query() {
    let tls = load_server_tls(&fixture("server.pem"), &fixture("server.key")).unwrap();
    let mut h = Harness::with_tls(1, tls);
    let (handle, client) = h.connect(5, 0);

    // Blocking client on its own thread; this thread drives the task
    let mut stream = client.try_clone_stream();
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let peer = thread::spawn(move || {
        stream
            .write_all(&encode_request(SECURITY_PROTOCOL_VERSION))
            .unwrap();
        let mut accept = [0u8; 1];
        stream.read_exact(&mut accept).unwrap();
        assert_eq!(accept[0], SECURITY_ACCEPT);

        let name = rustls::pki_types::ServerName::try_from("localhost").unwrap();
        let session = rustls::ClientConnection::new(tls_client_config(), name).unwrap();
        let mut tls = rustls::StreamOwned::new(session, stream);

        write_command(&mut tls, &Command::Ping).unwrap();
        let pong = read_reply(&mut tls).unwrap();
        write_command(&mut tls, &Command::query("SELECT secure")).unwrap();
        let rows = read_reply(&mut tls).unwrap();
        (pong, rows)
    });

    for _ in 0..2000 {
        if peer.is_finished() {
            break;
        }
        h.turn(0);
    }
    let (pong, rows) = peer.join().unwrap();
    assert_eq!(pong, vec![Response::pong()]);
    assert_eq!(rows, support::echo("SELECT secure"));

    let guard = handle.lock();
    assert_eq!(guard.security_state(), SecurityState::Established);
    assert!(guard.handshake_completed());
    assert_eq!(guard.state(), ConnState::AwaitingRequest);
}

#[test]
fn test_client_hello_pipelined_with_request() {
    let tls = load_server_tls(&fixture("server.pem"), &fixture("server.key")).unwrap();
    let mut h = Harness::with_tls(1, tls);
    let (handle, client) = h.connect(5, 0);

    let mut stream = client.try_clone_stream();
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let peer = thread::spawn(move || {
        let name = rustls::pki_types::ServerName::try_from("localhost").unwrap();
        let mut session = rustls::ClientConnection::new(tls_client_config(), name).unwrap();

        // Request and ClientHello in one write, before the accept byte is seen
        let mut first = encode_request(SECURITY_PROTOCOL_VERSION);
        while session.wants_write() {
            session.write_tls(&mut first).unwrap();
        }
        stream.write_all(&first).unwrap();

        let mut accept = [0u8; 1];
        stream.read_exact(&mut accept).unwrap();
        assert_eq!(accept[0], SECURITY_ACCEPT);

        let mut tls = rustls::StreamOwned::new(session, stream);
        write_command(&mut tls, &Command::Ping).unwrap();
        read_reply(&mut tls).unwrap()
    });

    for _ in 0..2000 {
        if peer.is_finished() {
            break;
        }
        h.turn(0);
    }
    assert_eq!(peer.join().unwrap(), vec![Response::pong()]);

    let guard = handle.lock();
    assert_eq!(guard.security_state(), SecurityState::Established);
    assert_eq!(guard.state(), ConnState::AwaitingRequest);
}

// =============================================================================
// Certificate Loading Tests
// =============================================================================

#[test]
fn test_load_fixture_certificates() {
    assert!(load_server_tls(&fixture("server.pem"), &fixture("server.key")).is_ok());
}

#[test]
fn test_load_missing_file() {
    let err = load_server_tls(&fixture("missing.pem"), &fixture("server.key")).unwrap_err();
    assert!(matches!(err, GateError::Config(_)));
}

#[test]
fn test_load_empty_certificate_file() {
    let empty = NamedTempFile::new().unwrap();
    let err = load_server_tls(empty.path(), &fixture("server.key")).unwrap_err();
    assert!(matches!(err, GateError::Config(_)));
}

#[test]
fn test_load_file_without_key() {
    let err = load_server_tls(&fixture("server.pem"), &fixture("server.pem")).unwrap_err();
    assert!(matches!(err, GateError::Config(_)));
}
