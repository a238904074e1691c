//! Client side of the WebSocket opening handshake
//!
//! [`HandshakeRequest`] turns an address and client options into everything
//! needed to send an upgrade request. [`HandshakeValidator`] checks the
//! server's `101` response and negotiates the subprotocol and extensions.
//! Both are traits with default methods so a single step can be replaced
//! while the rest is reused.

mod request;
mod validator;

use std::time::Duration;

use base64::Engine;
use http::HeaderMap;
use sha1::{Digest, Sha1};

use crate::WS_GUID;

pub use request::{DefaultHandshakeRequest, HandshakeRequest, HandshakeSpec};
pub use validator::{DefaultHandshakeValidator, HandshakeValidator, Negotiated};

/// Protocol versions a client may announce
pub const SUPPORTED_VERSIONS: [u8; 2] = [8, 13];

/// Generate the Sec-WebSocket-Accept value for a key
#[inline]
pub fn generate_accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    let hash = hasher.finalize();
    base64::engine::general_purpose::STANDARD.encode(hash)
}

/// Options for building a client upgrade request
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Value of `Sec-WebSocket-Version` (default: 13)
    pub protocol_version: u8,
    /// Extra request headers; protocol headers replace entries of the same name
    pub headers: HeaderMap,
    /// `Origin` (version 13) or `Sec-WebSocket-Origin` (version 8)
    pub origin: Option<String>,
    /// Basic auth credentials as `user:password`
    pub auth: Option<String>,
    /// Passed through to the transport
    pub handshake_timeout: Option<Duration>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            protocol_version: 13,
            headers: HeaderMap::new(),
            origin: None,
            auth: None,
            handshake_timeout: None,
        }
    }
}

impl ClientOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn protocol_version(mut self, version: u8) -> Self {
        self.protocol_version = version;
        self
    }

    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    pub fn auth(mut self, auth: impl Into<String>) -> Self {
        self.auth = Some(auth.into());
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = Some(timeout);
        self
    }
}
