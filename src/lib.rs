//! # wsframe: WebSocket frame engine
//!
//! The framing layer of an RFC 6455 WebSocket endpoint, with RFC 7692
//! permessage-deflate compression, usable from either side of a connection.
//!
//! - [`receiver::Receiver`] parses inbound bytes, split at any boundary, into
//!   messages and control events
//! - [`sender::Sender`] encodes, masks, compresses and corks outbound frames
//! - [`deflate::PerMessageDeflate`] negotiates and runs compression, one job
//!   at a time, through a FIFO [`limiter::Limiter`]
//! - [`handshake`] builds the client upgrade request and validates the
//!   server's response
//!
//! Sockets, TLS and HTTP parsing are left to the caller.
//!
//! ## Example
//!
//! ```no_run
//! use wsframe::prelude::*;
//!
//! # async fn run() -> wsframe::Result<()> {
//! let config = Config::default();
//! let mut sender = Sender::new(Vec::new(), &config, None);
//! sender.send("hello", SendOptions::text().mask(true)).await?;
//!
//! let mut receiver = Receiver::new(Role::Server, &config, None);
//! let wire = sender.into_inner();
//! for event in receiver.write(&wire).await {
//!     if let FrameEvent::Message(msg) = event {
//!         assert_eq!(msg.as_text(), Some("hello"));
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod cork;
pub mod deflate;
pub mod error;
pub mod extension;
pub mod frame;
pub mod handshake;
pub mod limiter;
pub mod mask;
pub mod receiver;
pub mod sender;
pub mod subprotocol;
pub mod utf8;

pub use deflate::{DeflateOptions, DeflateParams, PerMessageDeflate, WindowBits};
pub use error::{CloseReason, Error, ErrorCode, ProtocolError, ReadyState, Result};
pub use frame::OpCode;
pub use receiver::{BinaryData, BinaryType, FrameEvent, Message, Receiver};
pub use sender::{Payload, SendOptions, Sender, SenderHandle};

/// Default cork buffer size (16KB like uWebSockets)
pub const CORK_BUFFER_SIZE: usize = 16 * 1024;

/// Maximum WebSocket frame header size (2 + 8 + 4 = 14 bytes)
pub const MAX_FRAME_HEADER_SIZE: usize = 14;

/// Small message threshold for fast-path optimization (< 126 bytes uses 2-byte header)
pub const SMALL_MESSAGE_THRESHOLD: usize = 125;

/// Medium message threshold (< 64KB uses 4-byte header)
pub const MEDIUM_MESSAGE_THRESHOLD: usize = 65535;

/// WebSocket GUID for handshake
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Default maximum message size (100 MiB)
pub const DEFAULT_MAX_PAYLOAD: usize = 100 * 1024 * 1024;

/// WebSocket endpoint role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Client (must mask frames)
    Client,
    /// Server (must not mask frames)
    Server,
}

impl Role {
    /// The role on the other end of the connection
    #[inline]
    pub fn peer(self) -> Role {
        match self {
            Role::Client => Role::Server,
            Role::Server => Role::Client,
        }
    }
}

/// Configuration for one side of a WebSocket session
///
/// # Example
///
/// ```
/// use wsframe::{BinaryType, Config, DeflateOptions};
///
/// let config = Config::builder()
///     .max_payload(16 * 1024)
///     .binary_type(BinaryType::Fragments)
///     .per_message_deflate(DeflateOptions::default().threshold(256))
///     .build();
/// assert_eq!(config.max_payload, 16 * 1024);
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum message size, compressed or not (default: 100MB, 0 = unlimited)
    pub max_payload: usize,
    /// How binary messages are delivered (default: one buffer)
    pub binary_type: BinaryType,
    /// Deliver text messages without UTF-8 checks (default: false)
    pub skip_utf8_validation: bool,
    /// Write buffer size for corking (default: 16KB)
    pub write_buffer_size: usize,
    /// permessage-deflate settings; `None` disables the extension
    pub per_message_deflate: Option<DeflateOptions>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_payload: DEFAULT_MAX_PAYLOAD,
            binary_type: BinaryType::default(),
            skip_utf8_validation: false,
            write_buffer_size: CORK_BUFFER_SIZE,
            per_message_deflate: None,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    /// Compression state for one endpoint, when the extension is enabled.
    ///
    /// The returned handle still has to go through negotiation before it
    /// compresses anything.
    pub fn deflate_for(&self, role: Role) -> Option<PerMessageDeflate> {
        self.per_message_deflate
            .clone()
            .map(|options| PerMessageDeflate::new(options, role, self.max_payload))
    }
}

/// Builder for [`Config`]
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder with default values
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    /// Set maximum message size
    pub fn max_payload(mut self, size: usize) -> Self {
        self.config.max_payload = size;
        self
    }

    pub fn binary_type(mut self, binary_type: BinaryType) -> Self {
        self.config.binary_type = binary_type;
        self
    }

    pub fn skip_utf8_validation(mut self, skip: bool) -> Self {
        self.config.skip_utf8_validation = skip;
        self
    }

    /// Set write buffer size for corking
    pub fn write_buffer_size(mut self, size: usize) -> Self {
        self.config.write_buffer_size = size;
        self
    }

    /// Enable permessage-deflate with the given options
    pub fn per_message_deflate(mut self, options: DeflateOptions) -> Self {
        self.config.per_message_deflate = Some(options);
        self
    }

    /// Build the configuration
    pub fn build(self) -> Config {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::deflate::{DeflateOptions, PerMessageDeflate};
    pub use crate::error::{Error, Result};
    pub use crate::handshake::{
        ClientOptions, DefaultHandshakeRequest, DefaultHandshakeValidator, HandshakeRequest,
        HandshakeValidator,
    };
    pub use crate::receiver::{FrameEvent, Message, Receiver};
    pub use crate::sender::{SendOptions, Sender};
    pub use crate::{Config, Role};
}
