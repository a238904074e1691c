//! Upgrade request construction

use std::time::Duration;

use base64::Engine;
use http::header::{
    AUTHORIZATION, CONNECTION, COOKIE, HOST, ORIGIN, SEC_WEBSOCKET_EXTENSIONS, SEC_WEBSOCKET_KEY,
    SEC_WEBSOCKET_PROTOCOL, SEC_WEBSOCKET_VERSION, UPGRADE,
};
use http::{HeaderMap, HeaderName, HeaderValue};
use url::Url;

use super::{ClientOptions, SUPPORTED_VERSIONS};
use crate::error::{Error, Result, SyntaxError};
use crate::extension::is_token_char;
use crate::subprotocol::ProtocolSet;

/// Pre-13 drafts carry the origin under this name
const SEC_WEBSOCKET_ORIGIN: HeaderName = HeaderName::from_static("sec-websocket-origin");

/// Everything a transport needs to send the upgrade request
#[derive(Debug, Clone)]
pub struct HandshakeSpec {
    /// Normalized target URL (`http`/`https` rewritten to `ws`/`wss`)
    pub url: Url,
    /// Base64 `Sec-WebSocket-Key` nonce
    pub key: String,
    /// Requested subprotocols, in order
    pub protocols: ProtocolSet,
    /// Host without IPv6 brackets
    pub host: String,
    pub port: u16,
    pub default_port: u16,
    /// Request target: path plus query
    pub path: String,
    pub headers: HeaderMap,
    /// `user:password` for basic auth, from the URL or the options
    pub auth: Option<String>,
    /// Unix socket path for `ws+unix:` URLs
    pub socket_path: Option<String>,
    pub timeout: Option<Duration>,
}

impl HandshakeSpec {
    /// True for `wss:` targets
    pub fn is_secure(&self) -> bool {
        self.url.scheme() == "wss"
    }
}

/// Steps for building a client upgrade request.
///
/// Every step has a default; implementors override the ones they need.
pub trait HandshakeRequest {
    /// Parse, validate and assemble the request
    fn build(
        &self,
        address: &str,
        protocols: &[&str],
        options: &ClientOptions,
        extension_offer: Option<&str>,
    ) -> Result<HandshakeSpec> {
        if !SUPPORTED_VERSIONS.contains(&options.protocol_version) {
            return Err(Error::InvalidArgument(format!(
                "Unsupported protocol version: {} (supported versions: 8, 13)",
                options.protocol_version
            )));
        }

        let url = self.parse_url(address)?;
        self.validate_url(&url)?;

        let key = self.generate_key()?;
        let protocol_set = self.build_protocol_set(protocols)?;

        let mut headers = options.headers.clone();
        headers.insert(
            SEC_WEBSOCKET_VERSION,
            HeaderValue::from(u16::from(options.protocol_version)),
        );
        headers.insert(SEC_WEBSOCKET_KEY, HeaderValue::from_str(&key)?);
        headers.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
        headers.insert(UPGRADE, HeaderValue::from_static("websocket"));

        if let Some(offer) = extension_offer.filter(|offer| !offer.is_empty()) {
            headers.insert(SEC_WEBSOCKET_EXTENSIONS, HeaderValue::from_str(offer)?);
        }
        if !protocol_set.is_empty() {
            headers.insert(
                SEC_WEBSOCKET_PROTOCOL,
                HeaderValue::from_str(&protocols.join(","))?,
            );
        }
        if let Some(origin) = options.origin.as_deref().filter(|origin| !origin.is_empty()) {
            let name = if options.protocol_version < 13 {
                SEC_WEBSOCKET_ORIGIN
            } else {
                ORIGIN
            };
            headers.insert(name, HeaderValue::from_str(origin)?);
        }

        let default_port = if url.scheme() == "wss" { 443 } else { 80 };
        let host = url
            .host_str()
            .map(|host| {
                host.strip_prefix('[')
                    .and_then(|h| h.strip_suffix(']'))
                    .unwrap_or(host)
            })
            .unwrap_or_default()
            .to_owned();

        let mut path = url.path().to_owned();
        if let Some(query) = url.query().filter(|q| !q.is_empty()) {
            path.push('?');
            path.push_str(query);
        }

        let auth = if !url.username().is_empty() || url.password().is_some() {
            Some(format!(
                "{}:{}",
                url.username(),
                url.password().unwrap_or_default()
            ))
        } else {
            options.auth.clone()
        };

        let mut socket_path = None;
        if url.scheme() == "ws+unix" {
            let (socket, request_path) = match path.split_once(':') {
                Some((socket, rest)) => {
                    let request_path = rest.split(':').next().unwrap_or_default();
                    (socket.to_owned(), request_path.to_owned())
                }
                None => (path.clone(), String::from("/")),
            };
            socket_path = Some(socket);
            path = request_path;
        }

        log::debug!(
            "built upgrade request for {} (protocols: {})",
            url,
            protocol_set.len()
        );

        Ok(HandshakeSpec {
            port: url.port().unwrap_or(default_port),
            url,
            key,
            protocols: protocol_set,
            host,
            default_port,
            path,
            headers,
            auth,
            socket_path,
            timeout: options.handshake_timeout,
        })
    }

    /// Parse an absolute address, mapping `http`/`https` onto `ws`/`wss`
    fn parse_url(&self, address: &str) -> Result<Url> {
        let invalid = || Error::Syntax(SyntaxError::InvalidUrl(address.to_owned()));
        let mut url = Url::parse(address).map_err(|_| invalid())?;

        let scheme = match url.scheme() {
            "http" => Some("ws"),
            "https" => Some("wss"),
            _ => None,
        };
        if let Some(scheme) = scheme {
            url.set_scheme(scheme).map_err(|_| invalid())?;
        }

        Ok(url)
    }

    /// Reject schemes, paths and fragments a WebSocket URL cannot carry
    fn validate_url(&self, url: &Url) -> Result<()> {
        let scheme = url.scheme();
        let is_ipc = scheme == "ws+unix";

        if scheme != "ws" && scheme != "wss" && !is_ipc {
            return Err(SyntaxError::UnsupportedScheme.into());
        }
        if is_ipc && url.path().is_empty() {
            return Err(SyntaxError::EmptyPath.into());
        }
        if url.fragment().is_some_and(|fragment| !fragment.is_empty()) {
            return Err(SyntaxError::FragmentIdentifier.into());
        }
        Ok(())
    }

    /// Fresh `Sec-WebSocket-Key`: 16 random bytes, base64 encoded
    fn generate_key(&self) -> Result<String> {
        let mut nonce = [0u8; 16];
        getrandom::getrandom(&mut nonce)?;
        Ok(base64::engine::general_purpose::STANDARD.encode(nonce))
    }

    /// Validate requested subprotocols: tokens only, no duplicates
    fn build_protocol_set(&self, protocols: &[&str]) -> Result<ProtocolSet> {
        let mut set = ProtocolSet::with_capacity(protocols.len());

        for &protocol in protocols {
            let valid = !protocol.is_empty() && protocol.bytes().all(is_token_char);
            if !valid || !set.insert(protocol.to_owned()) {
                return Err(SyntaxError::InvalidSubprotocol.into());
            }
        }

        Ok(set)
    }

    /// Copy options before following a redirect so the caller's stay intact
    fn init_redirect_options(&self, options: &ClientOptions) -> ClientOptions {
        let mut redirected = options.clone();
        redirected.headers = HeaderMap::with_capacity(options.headers.len());
        for (name, value) in &options.headers {
            redirected.headers.append(name.clone(), value.clone());
        }
        redirected
    }

    /// Drop credentials before following a redirect; `Host` goes too when the
    /// target host changes
    fn strip_redirect_auth(&self, options: &mut ClientOptions, same_host: bool) {
        options.headers.remove(AUTHORIZATION);
        options.headers.remove(COOKIE);

        if !same_host {
            options.headers.remove(HOST);
        }

        options.auth = None;
    }

    /// Add a basic `Authorization` header unless one is already present
    fn inject_auth_header(&self, headers: &mut HeaderMap, auth: Option<&str>) -> Result<()> {
        let Some(auth) = auth.filter(|auth| !auth.is_empty()) else {
            return Ok(());
        };
        if headers.contains_key(AUTHORIZATION) {
            return Ok(());
        }

        let encoded = base64::engine::general_purpose::STANDARD.encode(auth);
        headers.insert(AUTHORIZATION, HeaderValue::from_str(&format!("Basic {encoded}"))?);
        Ok(())
    }
}

/// Request builder using every default step
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultHandshakeRequest;

impl HandshakeRequest for DefaultHandshakeRequest {}
