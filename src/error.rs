//! Error types for the WebSocket frame engine

use std::io;

use thiserror::Error;

/// Result type alias for WebSocket operations
pub type Result<T> = std::result::Result<T, Error>;

/// WebSocket error types
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from the underlying transport
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The peer violated the framing protocol
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A message (or a decompressed fragment) grew past `max_payload`
    #[error("Max payload size exceeded")]
    MaxPayloadExceeded,

    /// The zlib engine rejected its input
    #[error("{message}")]
    Zlib {
        /// Numeric zlib status (`Z_DATA_ERROR`, `Z_NEED_DICT`, ...)
        code: i32,
        /// Engine message
        message: String,
    },

    /// The compression engine was torn down while a job was queued or running
    #[error("The {0} stream was closed while data was being processed")]
    StreamClosed(&'static str),

    /// The session was terminated while a message was being compressed
    #[error("The socket was closed while data was being compressed")]
    SocketClosed,

    /// Malformed header value or address
    #[error(transparent)]
    Syntax(#[from] SyntaxError),

    /// Extension negotiation failed
    #[error("{0}")]
    Negotiation(String),

    /// A negotiation parameter carried an unusable value
    #[error("Invalid value for parameter \"{name}\": {value}")]
    InvalidParameterValue {
        /// Parameter name
        name: String,
        /// Offending value as received
        value: String,
    },

    /// The server's upgrade response failed validation
    #[error("{0}")]
    Handshake(&'static str),

    /// A header value could not be represented
    #[error("invalid header value")]
    InvalidHeader(#[from] http::header::InvalidHeaderValue),

    /// Operation attempted in a state that does not allow it
    #[error("WebSocket is not open: readyState {0}")]
    InvalidState(ReadyState),

    /// Caller-supplied argument out of range
    #[error("{0}")]
    InvalidArgument(String),

    /// The operating system could not provide random bytes
    #[error("failed to gather random bytes: {0}")]
    Random(#[from] getrandom::Error),
}

impl Error {
    /// Close status code to send to the peer when this error ends a session
    pub fn close_code(&self) -> u16 {
        match self {
            Error::Protocol(e) => e.close_code(),
            Error::MaxPayloadExceeded => CloseReason::TOO_BIG,
            Error::Zlib { .. } => CloseReason::INVALID_PAYLOAD,
            Error::StreamClosed(_) => CloseReason::INVALID_PAYLOAD,
            _ => CloseReason::ABNORMAL,
        }
    }
}

/// Session lifecycle as seen by the sender
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    /// Frames may be sent
    Open,
    /// A close frame has been sent
    Closing,
    /// The session was terminated
    Closed,
}

impl std::fmt::Display for ReadyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReadyState::Open => write!(f, "1 (OPEN)"),
            ReadyState::Closing => write!(f, "2 (CLOSING)"),
            ReadyState::Closed => write!(f, "3 (CLOSED)"),
        }
    }
}

/// Stable identifiers for framing violations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    InvalidOpcode,
    UnexpectedRsv1,
    UnexpectedRsv2Rsv3,
    ExpectedFin,
    ExpectedMask,
    UnexpectedMask,
    InvalidControlPayloadLength,
    UnsupportedDataPayloadLength,
    UnsupportedMessageLength,
    InvalidUtf8,
    InvalidCloseCode,
}

impl ErrorCode {
    /// Close status code mandated for this violation
    pub fn close_code(self) -> u16 {
        match self {
            ErrorCode::UnsupportedDataPayloadLength | ErrorCode::UnsupportedMessageLength => {
                CloseReason::TOO_BIG
            }
            ErrorCode::InvalidUtf8 => CloseReason::INVALID_PAYLOAD,
            _ => CloseReason::PROTOCOL_ERROR,
        }
    }

    /// Identifier in the `WS_ERR_*` naming used on the wire-facing side
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::InvalidOpcode => "WS_ERR_INVALID_OPCODE",
            ErrorCode::UnexpectedRsv1 => "WS_ERR_UNEXPECTED_RSV_1",
            ErrorCode::UnexpectedRsv2Rsv3 => "WS_ERR_UNEXPECTED_RSV_2_3",
            ErrorCode::ExpectedFin => "WS_ERR_EXPECTED_FIN",
            ErrorCode::ExpectedMask => "WS_ERR_EXPECTED_MASK",
            ErrorCode::UnexpectedMask => "WS_ERR_UNEXPECTED_MASK",
            ErrorCode::InvalidControlPayloadLength => "WS_ERR_INVALID_CONTROL_PAYLOAD_LENGTH",
            ErrorCode::UnsupportedDataPayloadLength => "WS_ERR_UNSUPPORTED_DATA_PAYLOAD_LENGTH",
            ErrorCode::UnsupportedMessageLength => "WS_ERR_UNSUPPORTED_MESSAGE_LENGTH",
            ErrorCode::InvalidUtf8 => "WS_ERR_INVALID_UTF8",
            ErrorCode::InvalidCloseCode => "WS_ERR_INVALID_CLOSE_CODE",
        }
    }
}

/// A framing violation detected by the receiver
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ProtocolError {
    code: ErrorCode,
    message: String,
}

impl ProtocolError {
    /// Violation of a frame-level rule; the message is prefixed like
    /// `Invalid WebSocket frame: RSV1 must be clear`
    pub fn frame(code: ErrorCode, detail: impl std::fmt::Display) -> Self {
        Self {
            code,
            message: format!("Invalid WebSocket frame: {detail}"),
        }
    }

    /// Violation reported verbatim
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn close_code(&self) -> u16 {
        self.code.close_code()
    }
}

/// Malformed header grammar, URL, or subprotocol list
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyntaxError {
    #[error("Unexpected character at index {0}")]
    UnexpectedCharacter(usize),
    #[error("Unexpected end of input")]
    UnexpectedEnd,
    #[error("The \"{0}\" subprotocol is duplicated")]
    DuplicateSubprotocol(String),
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
    #[error(
        "The URL's protocol must be one of \"ws:\", \"wss:\", \"http:\", \"https:\", or \"ws+unix:\""
    )]
    UnsupportedScheme,
    #[error("The URL's pathname is empty")]
    EmptyPath,
    #[error("The URL contains a fragment identifier")]
    FragmentIdentifier,
    #[error("An invalid or duplicated subprotocol was specified")]
    InvalidSubprotocol,
}

/// Close status codes used by the engine
#[derive(Debug, Clone, Copy)]
pub struct CloseReason;

impl CloseReason {
    /// Protocol error
    pub const PROTOCOL_ERROR: u16 = 1002;
    /// No status received
    pub const NO_STATUS: u16 = 1005;
    /// Abnormal closure
    pub const ABNORMAL: u16 = 1006;
    /// Invalid frame payload
    pub const INVALID_PAYLOAD: u16 = 1007;
    /// Message too big
    pub const TOO_BIG: u16 = 1009;

    /// Check if a status code may appear in a close frame.
    ///
    /// 1004, 1005 and 1006 are reserved for local use; 1015 and above in the
    /// 1xxx range are unassigned.
    pub fn is_valid_code(code: u16) -> bool {
        matches!(code, 1000..=1003 | 1007..=1014 | 3000..=4999)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_close_codes() {
        for code in [1000, 1001, 1002, 1003, 1007, 1008, 1011, 1012, 1013, 1014, 3000, 4999] {
            assert!(CloseReason::is_valid_code(code), "{code}");
        }
        for code in [0, 999, 1004, 1005, 1006, 1015, 1016, 2000, 2999, 5000, u16::MAX] {
            assert!(!CloseReason::is_valid_code(code), "{code}");
        }
    }

    #[test]
    fn test_close_code_mapping() {
        let err = Error::from(ProtocolError::frame(ErrorCode::InvalidOpcode, "invalid opcode 5"));
        assert_eq!(err.close_code(), 1002);
        assert_eq!(err.to_string(), "Invalid WebSocket frame: invalid opcode 5");

        assert_eq!(Error::MaxPayloadExceeded.close_code(), 1009);
        assert_eq!(
            Error::Zlib {
                code: -3,
                message: "invalid stored block lengths".into()
            }
            .close_code(),
            1007
        );
    }

    #[test]
    fn test_messages() {
        assert_eq!(
            Error::StreamClosed("deflate").to_string(),
            "The deflate stream was closed while data was being processed"
        );
        assert_eq!(
            Error::InvalidState(ReadyState::Closing).to_string(),
            "WebSocket is not open: readyState 2 (CLOSING)"
        );
        assert_eq!(
            SyntaxError::DuplicateSubprotocol("foo".into()).to_string(),
            "The \"foo\" subprotocol is duplicated"
        );
        assert_eq!(ErrorCode::InvalidUtf8.as_str(), "WS_ERR_INVALID_UTF8");
    }
}
