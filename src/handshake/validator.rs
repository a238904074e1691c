//! Upgrade response validation

use http::header::{SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_EXTENSIONS, SEC_WEBSOCKET_PROTOCOL, UPGRADE};
use http::{HeaderMap, HeaderValue};
use indexmap::IndexMap;

use super::generate_accept_key;
use crate::deflate::{EXTENSION_NAME, PerMessageDeflate};
use crate::error::{Error, Result};
use crate::extension;
use crate::subprotocol::ProtocolSet;

/// Outcome of a successful handshake
#[derive(Debug, Clone, Default)]
pub struct Negotiated {
    /// Selected subprotocol, empty when none was requested
    pub protocol: String,
    /// Accepted extensions by name
    pub extensions: IndexMap<String, PerMessageDeflate>,
}

impl Negotiated {
    /// The negotiated permessage-deflate session, if any
    pub fn per_message_deflate(&self) -> Option<&PerMessageDeflate> {
        self.extensions.get(EXTENSION_NAME)
    }
}

/// Steps for checking the server's `101 Switching Protocols` response.
///
/// `validate` runs the steps in order and stops at the first failure.
pub trait HandshakeValidator {
    fn validate(
        &self,
        headers: &HeaderMap,
        key: &str,
        protocols: &ProtocolSet,
        deflate: Option<&PerMessageDeflate>,
    ) -> Result<Negotiated> {
        self.validate_upgrade(headers)?;
        self.validate_accept_key(headers.get(SEC_WEBSOCKET_ACCEPT), key)?;

        let protocol = self.validate_subprotocol(headers.get(SEC_WEBSOCKET_PROTOCOL), protocols)?;
        let extensions = self.validate_extensions(headers.get(SEC_WEBSOCKET_EXTENSIONS), deflate)?;

        Ok(Negotiated {
            protocol,
            extensions,
        })
    }

    /// `Upgrade` must be present and equal `websocket`, ignoring case
    fn validate_upgrade(&self, headers: &HeaderMap) -> Result<()> {
        let valid = headers
            .get(UPGRADE)
            .is_some_and(|value| value.as_bytes().eq_ignore_ascii_case(b"websocket"));

        if !valid {
            return Err(Error::Handshake("Invalid Upgrade header"));
        }
        Ok(())
    }

    /// `Sec-WebSocket-Accept` must be base64(SHA-1(key + GUID))
    fn validate_accept_key(&self, actual: Option<&HeaderValue>, key: &str) -> Result<()> {
        let expected = generate_accept_key(key);

        match actual {
            Some(actual) if actual.as_bytes() == expected.as_bytes() => Ok(()),
            _ => Err(Error::Handshake("Invalid Sec-WebSocket-Accept header")),
        }
    }

    /// The selected subprotocol must be one of the requested ones
    fn validate_subprotocol(
        &self,
        server_protocol: Option<&HeaderValue>,
        protocols: &ProtocolSet,
    ) -> Result<String> {
        let Some(value) = server_protocol else {
            if !protocols.is_empty() {
                return Err(Error::Handshake("Server sent no subprotocol"));
            }
            return Ok(String::new());
        };

        if protocols.is_empty() {
            return Err(Error::Handshake(
                "Server sent a subprotocol but none was requested",
            ));
        }

        match value.to_str() {
            Ok(protocol) if protocols.contains(protocol) => Ok(protocol.to_owned()),
            _ => Err(Error::Handshake("Server sent an invalid subprotocol")),
        }
    }

    /// The server may only accept the permessage-deflate offer that was sent
    fn validate_extensions(
        &self,
        header: Option<&HeaderValue>,
        deflate: Option<&PerMessageDeflate>,
    ) -> Result<IndexMap<String, PerMessageDeflate>> {
        let Some(value) = header else {
            return Ok(IndexMap::new());
        };

        let Some(deflate) = deflate else {
            return Err(Error::Handshake(
                "Server sent a Sec-WebSocket-Extensions header but no extension was requested",
            ));
        };

        let invalid = || Error::Handshake("Invalid Sec-WebSocket-Extensions header");

        let value = value.to_str().map_err(|_| invalid())?;
        let mut extensions = extension::parse(value).map_err(|_| invalid())?;

        if extensions.len() != 1 || !extensions.contains_key(EXTENSION_NAME) {
            return Err(Error::Handshake(
                "Server indicated an extension that was not requested",
            ));
        }

        let responses = extensions.swap_remove(EXTENSION_NAME).unwrap_or_default();
        if let Err(err) = deflate.accept(&responses) {
            log::debug!("rejecting permessage-deflate response: {err}");
            return Err(invalid());
        }

        let mut accepted = IndexMap::with_capacity(1);
        accepted.insert(EXTENSION_NAME.to_owned(), deflate.clone());
        Ok(accepted)
    }
}

/// Response validator using every default step
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultHandshakeValidator;

impl HandshakeValidator for DefaultHandshakeValidator {}
