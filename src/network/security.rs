//! Transport security negotiation
//!
//! When TLS is configured a client opens with a security request framed like
//! any other frame:
//!
//! ```text
//! ┌──────────┬──────────┬──────────────┐
//! │ 0x20 (1) │  4 (4)   │ Version (4)  │
//! └──────────┴──────────┴──────────────┘
//! ```
//!
//! The server answers the single byte `S` and a TLS handshake follows on
//! the same socket. Anything else as a first frame closes the connection.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use bytes::{Buf, BufMut};
use rustls::ServerConnection;

use crate::error::{GateError, Result};
use crate::protocol::{peek_header, HEADER_SIZE};

/// Frame type of a security request
pub const SECURITY_REQUEST: u8 = 0x20;

/// The only negotiation version this server speaks
pub const SECURITY_PROTOCOL_VERSION: u32 = 1;

/// Byte sent back once a request is accepted
pub const SECURITY_ACCEPT: u8 = b'S';

/// Total size of a security request frame
pub const SECURITY_REQUEST_LEN: usize = HEADER_SIZE + 4;

/// Negotiation state of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityState {
    /// TLS configured, no request seen yet
    NotNegotiated,
    /// Request accepted, TLS handshake in progress
    Negotiating,
    /// Handshake finished
    Established,
    /// Server runs without TLS
    NotApplicable,
}

/// Result of inspecting the first bytes of a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Negotiation {
    /// Not enough bytes yet
    Incomplete,
    /// Well-formed request for a supported version; `len` bytes to consume
    Request { len: usize },
    /// Well-formed request for a version we do not speak
    Unsupported { version: u32 },
    /// Not a security request at all
    Malformed(String),
}

/// Inspect buffered bytes for a security request
pub fn parse_request(bytes: &[u8]) -> Negotiation {
    if let Some(&kind) = bytes.first() {
        if kind != SECURITY_REQUEST {
            return Negotiation::Malformed(format!(
                "expected security request, got frame type 0x{:02x}",
                kind
            ));
        }
    }
    let header = match peek_header(bytes) {
        Some(header) => header,
        None => return Negotiation::Incomplete,
    };
    if header.payload_len != 4 {
        return Negotiation::Malformed(format!(
            "security request payload must be 4 bytes, got {}",
            header.payload_len
        ));
    }
    if bytes.len() < SECURITY_REQUEST_LEN {
        return Negotiation::Incomplete;
    }

    let version = (&bytes[HEADER_SIZE..SECURITY_REQUEST_LEN]).get_u32();
    if version != SECURITY_PROTOCOL_VERSION {
        return Negotiation::Unsupported { version };
    }
    Negotiation::Request {
        len: SECURITY_REQUEST_LEN,
    }
}

/// Encode a security request (client side)
pub fn encode_request(version: u32) -> Vec<u8> {
    let mut frame = Vec::with_capacity(SECURITY_REQUEST_LEN);
    frame.put_u8(SECURITY_REQUEST);
    frame.put_u32(4);
    frame.put_u32(version);
    frame
}

/// Per-connection transport security
pub(crate) struct TransportSecurity {
    config: Option<Arc<rustls::ServerConfig>>,
    state: SecurityState,
    handshake_completed: bool,
    session: Option<ServerConnection>,
}

impl TransportSecurity {
    pub(crate) fn new(config: Option<Arc<rustls::ServerConfig>>) -> Self {
        let state = Self::initial_state(&config);
        Self {
            config,
            state,
            handshake_completed: false,
            session: None,
        }
    }

    fn initial_state(config: &Option<Arc<rustls::ServerConfig>>) -> SecurityState {
        if config.is_some() {
            SecurityState::NotNegotiated
        } else {
            SecurityState::NotApplicable
        }
    }

    pub(crate) fn is_configured(&self) -> bool {
        self.config.is_some()
    }

    pub(crate) fn state(&self) -> SecurityState {
        self.state
    }

    pub(crate) fn handshake_completed(&self) -> bool {
        self.handshake_completed
    }

    pub(crate) fn session(&mut self) -> Option<&mut ServerConnection> {
        self.session.as_mut()
    }

    /// Start the TLS session after accepting a request
    pub(crate) fn begin(&mut self) -> Result<&mut ServerConnection> {
        let config = self.config.clone().ok_or_else(|| {
            GateError::InternalInvariant("negotiation without TLS config".to_string())
        })?;
        let session = ServerConnection::new(config)
            .map_err(|e| GateError::Handshake(format!("TLS session setup failed: {}", e)))?;
        self.state = SecurityState::Negotiating;
        Ok(self.session.insert(session))
    }

    pub(crate) fn complete(&mut self) {
        self.state = SecurityState::Established;
        self.handshake_completed = true;
    }

    /// Forget the session and go back to the initial state
    pub(crate) fn reset(&mut self) {
        self.session = None;
        self.handshake_completed = false;
        self.state = Self::initial_state(&self.config);
    }
}

/// Build a rustls server config from PEM certificate chain and key files
pub fn load_server_tls(cert_path: &Path, key_path: &Path) -> Result<Arc<rustls::ServerConfig>> {
    let open = |path: &Path| {
        File::open(path)
            .map(BufReader::new)
            .map_err(|e| GateError::Config(format!("cannot open {}: {}", path.display(), e)))
    };

    let certs = rustls_pemfile::certs(&mut open(cert_path)?)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| GateError::Config(format!("invalid certificate PEM: {}", e)))?;
    if certs.is_empty() {
        return Err(GateError::Config(format!(
            "no certificates found in {}",
            cert_path.display()
        )));
    }

    let key = rustls_pemfile::private_key(&mut open(key_path)?)
        .map_err(|e| GateError::Config(format!("invalid key PEM: {}", e)))?
        .ok_or_else(|| {
            GateError::Config(format!("no private key found in {}", key_path.display()))
        })?;

    let config = rustls::ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()?
    .with_no_client_auth()
    .with_single_cert(certs, key)?;

    Ok(Arc::new(config))
}
