//! Inbound frame state machine
//!
//! [`Receiver`] consumes raw transport bytes in arbitrarily split chunks and
//! turns them into [`FrameEvent`]s. Each call to [`Receiver::write`] runs the
//! parser until it needs more input; frames split across calls are
//! reassembled exactly as if the stream had arrived in one piece.
//!
//! ```text
//! Header -> ExtendedLength16 | ExtendedLength64 -> MaskKey -> Payload -> (Inflating)
//!    ^                                                                        |
//!    +------------------------------------------------------------------------+
//! ```
//!
//! Errors are terminal: once a [`FrameEvent::ProtocolError`] has been
//! reported, further input is discarded. Input following a close frame is
//! ignored as well.

use bytes::{Buf, Bytes, BytesMut};
use log::trace;

use crate::deflate::PerMessageDeflate;
use crate::error::{CloseReason, Error, ErrorCode, ProtocolError, Result};
use crate::frame::OpCode;
use crate::mask::apply_mask;
use crate::utf8::{Utf8Validator, validate_utf8};
use crate::{Config, Role};

/// Largest payload length a peer may declare (2^53 - 1)
const MAX_SAFE_PAYLOAD_LENGTH: u64 = (1 << 53) - 1;

/// Representation used for binary messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BinaryType {
    /// One contiguous buffer
    #[default]
    Buffer,
    /// An owned byte vector
    Array,
    /// The payload as received, one buffer per fragment
    Fragments,
}

/// Binary message payload, shaped by [`BinaryType`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BinaryData {
    Buffer(Bytes),
    Array(Vec<u8>),
    Fragments(Vec<Bytes>),
}

impl BinaryData {
    /// Total payload length
    pub fn len(&self) -> usize {
        match self {
            BinaryData::Buffer(b) => b.len(),
            BinaryData::Array(v) => v.len(),
            BinaryData::Fragments(f) => f.iter().map(Bytes::len).sum(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flatten into one buffer
    pub fn into_bytes(self) -> Bytes {
        match self {
            BinaryData::Buffer(b) => b,
            BinaryData::Array(v) => Bytes::from(v),
            BinaryData::Fragments(f) => {
                let len = f.iter().map(Bytes::len).sum();
                concat(f, len)
            }
        }
    }
}

/// A complete data message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Text message, UTF-8 validated unless validation is disabled
    Text(Bytes),
    /// Binary message
    Binary(BinaryData),
}

impl Message {
    #[inline]
    pub fn is_text(&self) -> bool {
        matches!(self, Message::Text(_))
    }

    #[inline]
    pub fn is_binary(&self) -> bool {
        matches!(self, Message::Binary(_))
    }

    /// Get message as text (returns None for binary messages or, with
    /// validation disabled, malformed text)
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Message::Text(b) => std::str::from_utf8(b).ok(),
            Message::Binary(_) => None,
        }
    }

    /// Convert to a single buffer
    pub fn into_bytes(self) -> Bytes {
        match self {
            Message::Text(b) => b,
            Message::Binary(data) => data.into_bytes(),
        }
    }
}

/// Output of [`Receiver::write`]
#[derive(Debug)]
pub enum FrameEvent {
    Message(Message),
    Ping(Bytes),
    Pong(Bytes),
    /// The peer started the closing handshake; 1005 stands in for an empty
    /// close frame
    Close { code: u16, reason: String },
    /// The stream is unusable; `close_code` is the status to close with
    ProtocolError { error: Error, close_code: u16 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Header,
    ExtendedLength16,
    ExtendedLength64,
    MaskKey,
    Payload,
    Inflating,
    Closed,
    Failed,
}

/// Incremental WebSocket frame parser
#[derive(Debug)]
pub struct Receiver {
    role: Role,
    extension: Option<PerMessageDeflate>,
    binary_type: BinaryType,
    max_payload: usize,
    skip_utf8_validation: bool,

    buffer: BytesMut,
    state: State,

    // current frame
    fin: bool,
    opcode: OpCode,
    masked: bool,
    mask: [u8; 4],
    payload_length: usize,

    // current message
    compressed: bool,
    /// Opcode of the message being reassembled
    fragmented: Option<OpCode>,
    total_payload_length: usize,
    message_length: usize,
    fragments: Vec<Bytes>,
    utf8: Utf8Validator,
}

impl Receiver {
    /// Create a receiver for one side of a connection.
    ///
    /// `extension` is the negotiated permessage-deflate instance, shared
    /// with the connection's sender.
    pub fn new(role: Role, config: &Config, extension: Option<PerMessageDeflate>) -> Self {
        Self {
            role,
            extension,
            binary_type: config.binary_type,
            max_payload: config.max_payload,
            skip_utf8_validation: config.skip_utf8_validation,
            buffer: BytesMut::new(),
            state: State::Header,
            fin: false,
            opcode: OpCode::Continuation,
            masked: false,
            mask: [0; 4],
            payload_length: 0,
            compressed: false,
            fragmented: None,
            total_payload_length: 0,
            message_length: 0,
            fragments: Vec::new(),
            utf8: Utf8Validator::new(),
        }
    }

    pub fn set_binary_type(&mut self, binary_type: BinaryType) {
        self.binary_type = binary_type;
    }

    pub fn binary_type(&self) -> BinaryType {
        self.binary_type
    }

    /// Bytes received but not yet consumed by the parser
    #[inline]
    pub fn buffered_bytes(&self) -> usize {
        self.buffer.len()
    }

    /// Payload bytes accumulated for the message in progress
    #[inline]
    pub fn message_length(&self) -> usize {
        self.message_length
    }

    /// True once a close frame has been received
    pub fn is_closed(&self) -> bool {
        self.state == State::Closed
    }

    /// True once a protocol error has been reported
    pub fn is_failed(&self) -> bool {
        self.state == State::Failed
    }

    /// RSV1 is only meaningful once permessage-deflate has been negotiated
    fn compression_active(&self) -> bool {
        self.extension
            .as_ref()
            .is_some_and(|extension| extension.params().is_some())
    }

    /// Feed a chunk of transport data and collect the resulting events
    pub async fn write(&mut self, chunk: &[u8]) -> Vec<FrameEvent> {
        let mut events = Vec::new();
        if matches!(self.state, State::Closed | State::Failed) {
            return events;
        }

        self.buffer.extend_from_slice(chunk);
        if let Err(error) = self.run(&mut events).await {
            let close_code = error.close_code();
            trace!("receiver failed: {error} ({close_code})");
            self.state = State::Failed;
            self.buffer.clear();
            self.fragments.clear();
            events.push(FrameEvent::ProtocolError { error, close_code });
        }
        events
    }

    async fn run(&mut self, events: &mut Vec<FrameEvent>) -> Result<()> {
        loop {
            let progressed = match self.state {
                State::Header => self.get_info()?,
                State::ExtendedLength16 => self.get_payload_length16()?,
                State::ExtendedLength64 => self.get_payload_length64()?,
                State::MaskKey => self.get_mask(),
                State::Payload => self.get_data(events).await?,
                // a previous write was dropped while a fragment was inflating
                State::Inflating => return Err(Error::StreamClosed("inflate")),
                State::Closed => {
                    self.buffer.clear();
                    false
                }
                State::Failed => false,
            };
            if !progressed {
                return Ok(());
            }
        }
    }

    fn get_info(&mut self) -> Result<bool> {
        if self.buffer.len() < 2 {
            return Ok(false);
        }
        let b0 = self.buffer[0];
        let b1 = self.buffer[1];

        if b0 & 0x30 != 0 {
            return Err(frame_error(ErrorCode::UnexpectedRsv2Rsv3, "RSV2 and RSV3 must be clear"));
        }

        let compressed = b0 & 0x40 != 0;
        if compressed && !self.compression_active() {
            return Err(frame_error(ErrorCode::UnexpectedRsv1, "RSV1 must be clear"));
        }

        self.fin = b0 & 0x80 != 0;
        let raw_opcode = b0 & 0x0f;
        let length = b1 & 0x7f;

        let invalid_opcode = || frame_error(ErrorCode::InvalidOpcode, format!("invalid opcode {raw_opcode}"));
        let opcode = OpCode::from_u8(raw_opcode).ok_or_else(invalid_opcode)?;

        match opcode {
            OpCode::Continuation => {
                if compressed {
                    return Err(frame_error(ErrorCode::UnexpectedRsv1, "RSV1 must be clear"));
                }
                self.opcode = self.fragmented.ok_or_else(invalid_opcode)?;
            }
            OpCode::Text | OpCode::Binary => {
                if self.fragmented.is_some() {
                    return Err(invalid_opcode());
                }
                self.opcode = opcode;
                self.compressed = compressed;
            }
            OpCode::Close | OpCode::Ping | OpCode::Pong => {
                if !self.fin {
                    return Err(frame_error(ErrorCode::ExpectedFin, "FIN must be set"));
                }
                if compressed {
                    return Err(frame_error(ErrorCode::UnexpectedRsv1, "RSV1 must be clear"));
                }
                if length > 125 || (opcode == OpCode::Close && length == 1) {
                    return Err(frame_error(
                        ErrorCode::InvalidControlPayloadLength,
                        format!("invalid payload length {length}"),
                    ));
                }
                self.opcode = opcode;
            }
        }

        if !self.fin && self.fragmented.is_none() {
            self.fragmented = Some(self.opcode);
        }

        self.masked = b1 & 0x80 != 0;
        match self.role {
            Role::Server if !self.masked => {
                return Err(frame_error(ErrorCode::ExpectedMask, "MASK must be set"));
            }
            Role::Client if self.masked => {
                return Err(frame_error(ErrorCode::UnexpectedMask, "MASK must be clear"));
            }
            _ => {}
        }

        self.buffer.advance(2);
        match length {
            126 => self.state = State::ExtendedLength16,
            127 => self.state = State::ExtendedLength64,
            n => self.have_length(u64::from(n))?,
        }
        Ok(true)
    }

    fn get_payload_length16(&mut self) -> Result<bool> {
        if self.buffer.len() < 2 {
            return Ok(false);
        }
        let length = self.buffer.get_u16();
        self.have_length(u64::from(length))?;
        Ok(true)
    }

    fn get_payload_length64(&mut self) -> Result<bool> {
        if self.buffer.len() < 8 {
            return Ok(false);
        }
        let length = self.buffer.get_u64();
        if length > MAX_SAFE_PAYLOAD_LENGTH {
            return Err(ProtocolError::new(
                ErrorCode::UnsupportedDataPayloadLength,
                "Unsupported WebSocket frame: payload length > 2^53 - 1",
            )
            .into());
        }
        self.have_length(length)?;
        Ok(true)
    }

    fn have_length(&mut self, length: u64) -> Result<()> {
        self.payload_length = usize::try_from(length).map_err(|_| {
            ProtocolError::new(
                ErrorCode::UnsupportedDataPayloadLength,
                "Unsupported WebSocket frame: payload length > 2^53 - 1",
            )
        })?;

        if self.payload_length > 0 && self.opcode.is_data() {
            self.total_payload_length = self.total_payload_length.saturating_add(self.payload_length);
            if self.max_payload > 0 && self.total_payload_length > self.max_payload {
                return Err(max_payload_error());
            }
        }

        self.state = if self.masked { State::MaskKey } else { State::Payload };
        Ok(())
    }

    fn get_mask(&mut self) -> bool {
        if self.buffer.len() < 4 {
            return false;
        }
        self.buffer.copy_to_slice(&mut self.mask);
        self.state = State::Payload;
        true
    }

    async fn get_data(&mut self, events: &mut Vec<FrameEvent>) -> Result<bool> {
        if self.buffer.len() < self.payload_length {
            return Ok(false);
        }

        let mut data = self.buffer.split_to(self.payload_length);
        if self.masked && self.mask != [0; 4] {
            apply_mask(&mut data, self.mask);
        }
        let data = data.freeze();

        trace!(
            "frame: opcode={:?} fin={} len={} compressed={}",
            self.opcode,
            self.fin,
            data.len(),
            self.compressed
        );

        if self.opcode.is_control() {
            self.control_message(data, events)?;
            return Ok(true);
        }

        match &self.extension {
            Some(extension) if self.compressed => {
                let inflate = extension.decompress(data, self.fin);
                self.state = State::Inflating;
                let data = inflate.await?;
                self.push_fragment(data)?;
            }
            _ => self.push_fragment(data)?,
        }

        self.data_message(events)?;
        Ok(true)
    }

    fn push_fragment(&mut self, data: Bytes) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }

        self.message_length += data.len();
        if self.max_payload > 0 && self.message_length > self.max_payload {
            return Err(max_payload_error());
        }

        if self.opcode == OpCode::Text && !self.skip_utf8_validation && !self.utf8.feed(&data) {
            return Err(invalid_utf8());
        }

        self.fragments.push(data);
        Ok(())
    }

    fn data_message(&mut self, events: &mut Vec<FrameEvent>) -> Result<()> {
        self.state = State::Header;
        if !self.fin {
            return Ok(());
        }

        let message_length = std::mem::take(&mut self.message_length);
        let fragments = std::mem::take(&mut self.fragments);
        self.total_payload_length = 0;
        self.fragmented = None;

        let message = if self.opcode == OpCode::Binary {
            Message::Binary(match self.binary_type {
                BinaryType::Buffer => BinaryData::Buffer(concat(fragments, message_length)),
                BinaryType::Array => BinaryData::Array(concat(fragments, message_length).into()),
                BinaryType::Fragments => BinaryData::Fragments(fragments),
            })
        } else {
            let complete = self.utf8.finish();
            self.utf8.reset();
            if !self.skip_utf8_validation && !complete {
                return Err(invalid_utf8());
            }
            Message::Text(concat(fragments, message_length))
        };

        events.push(FrameEvent::Message(message));
        Ok(())
    }

    fn control_message(&mut self, data: Bytes, events: &mut Vec<FrameEvent>) -> Result<()> {
        self.state = State::Header;

        match self.opcode {
            OpCode::Close => {
                let event = if data.is_empty() {
                    FrameEvent::Close {
                        code: CloseReason::NO_STATUS,
                        reason: String::new(),
                    }
                } else {
                    let code = u16::from_be_bytes([data[0], data[1]]);
                    if !CloseReason::is_valid_code(code) {
                        return Err(frame_error(
                            ErrorCode::InvalidCloseCode,
                            format!("invalid status code {code}"),
                        ));
                    }
                    let reason = &data[2..];
                    if !self.skip_utf8_validation && !validate_utf8(reason) {
                        return Err(invalid_utf8());
                    }
                    FrameEvent::Close {
                        code,
                        reason: String::from_utf8_lossy(reason).into_owned(),
                    }
                };
                self.state = State::Closed;
                self.buffer.clear();
                events.push(event);
            }
            OpCode::Ping => events.push(FrameEvent::Ping(data)),
            _ => events.push(FrameEvent::Pong(data)),
        }
        Ok(())
    }
}

fn frame_error(code: ErrorCode, detail: impl std::fmt::Display) -> Error {
    ProtocolError::frame(code, detail).into()
}

fn invalid_utf8() -> Error {
    frame_error(ErrorCode::InvalidUtf8, "invalid UTF-8 sequence")
}

fn max_payload_error() -> Error {
    ProtocolError::new(ErrorCode::UnsupportedMessageLength, "Max payload size exceeded").into()
}

fn concat(mut fragments: Vec<Bytes>, total: usize) -> Bytes {
    match fragments.len() {
        0 => Bytes::new(),
        1 => fragments.swap_remove(0),
        _ => {
            let mut buf = BytesMut::with_capacity(total);
            for fragment in &fragments {
                buf.extend_from_slice(fragment);
            }
            buf.freeze()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deflate::DeflateOptions;
    use crate::extension::Params;
    use crate::frame::{OpCode, encode_frame, encode_frame_with_rsv};

    fn client() -> Receiver {
        Receiver::new(Role::Client, &Config::default(), None)
    }

    fn server() -> Receiver {
        Receiver::new(Role::Server, &Config::default(), None)
    }

    fn hex(s: &str) -> Vec<u8> {
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap())
            .collect()
    }

    fn text(events: &[FrameEvent]) -> Vec<&str> {
        events
            .iter()
            .filter_map(|e| match e {
                FrameEvent::Message(m) => m.as_text(),
                _ => None,
            })
            .collect()
    }

    fn protocol_error(events: &[FrameEvent]) -> (String, u16) {
        match events.last() {
            Some(FrameEvent::ProtocolError { error, close_code }) => (error.to_string(), *close_code),
            other => panic!("expected a protocol error, got {other:?}"),
        }
    }

    fn error_code(events: &[FrameEvent]) -> ErrorCode {
        match events.last() {
            Some(FrameEvent::ProtocolError {
                error: Error::Protocol(e),
                ..
            }) => e.code(),
            other => panic!("expected a protocol error, got {other:?}"),
        }
    }

    fn compression(role: Role, max_payload: usize) -> PerMessageDeflate {
        let pmd = PerMessageDeflate::new(DeflateOptions::default(), role, max_payload);
        pmd.accept(&[Params::new()]).unwrap();
        pmd
    }

    #[tokio::test]
    async fn test_unmasked_text_message() {
        let mut receiver = client();
        let events = receiver.write(&hex("810548656c6c6f")).await;
        assert_eq!(text(&events), vec!["Hello"]);
        assert_eq!(receiver.buffered_bytes(), 0);
    }

    #[tokio::test]
    async fn test_close_without_body() {
        let mut receiver = client();
        let events = receiver.write(&[0x88, 0x00]).await;
        match &events[..] {
            [FrameEvent::Close { code, reason }] => {
                assert_eq!(*code, 1005);
                assert!(reason.is_empty());
            }
            other => panic!("{other:?}"),
        }
        assert!(receiver.is_closed());
    }

    #[tokio::test]
    async fn test_close_split_across_writes() {
        let mut receiver = client();
        assert!(receiver.write(&hex("8806")).await.is_empty());
        let events = receiver.write(&hex("03e8444f4e45")).await;
        match &events[..] {
            [FrameEvent::Close { code, reason }] => {
                assert_eq!(*code, 1000);
                assert_eq!(reason, "DONE");
            }
            other => panic!("{other:?}"),
        }
    }

    #[tokio::test]
    async fn test_masked_text_message() {
        let mut receiver = server();
        let events = receiver.write(&hex("81933483a86801b992524fa1c60959e68a5216e6cb005ba1d5")).await;
        assert_eq!(text(&events), vec!["5:::{\"name\":\"echo\"}"]);
    }

    #[tokio::test]
    async fn test_chunk_boundaries() {
        let mut frame = BytesMut::new();
        encode_frame(&mut frame, OpCode::Binary, &[7u8; 300], true, Some([1, 2, 3, 4]));
        encode_frame(&mut frame, OpCode::Ping, b"hi", true, Some([5, 6, 7, 8]));

        let mut receiver = server();
        let mut events = Vec::new();
        for byte in frame.iter() {
            events.extend(receiver.write(&[*byte]).await);
        }
        assert_eq!(events.len(), 2);
        match &events[0] {
            FrameEvent::Message(Message::Binary(BinaryData::Buffer(b))) => assert_eq!(&b[..], &[7u8; 300]),
            other => panic!("{other:?}"),
        }
        assert!(matches!(&events[1], FrameEvent::Ping(p) if &p[..] == b"hi"));
    }

    #[tokio::test]
    async fn test_fragmented_message_with_interleaved_ping() {
        let mut buf = BytesMut::new();
        encode_frame(&mut buf, OpCode::Text, b"Hel", false, None);
        encode_frame(&mut buf, OpCode::Ping, b"", true, None);
        encode_frame(&mut buf, OpCode::Continuation, b"lo", true, None);

        let mut receiver = client();
        let events = receiver.write(&buf).await;
        assert!(matches!(&events[0], FrameEvent::Ping(p) if p.is_empty()));
        assert_eq!(text(&events), vec!["Hello"]);
        assert_eq!(receiver.message_length(), 0);
    }

    #[tokio::test]
    async fn test_fragmented_message_length_tracking() {
        let mut receiver = client();
        let mut buf = BytesMut::new();
        encode_frame(&mut buf, OpCode::Binary, &[1; 10], false, None);
        receiver.write(&buf).await;
        assert_eq!(receiver.message_length(), 10);
    }

    #[tokio::test]
    async fn test_header_violations() {
        let cases: &[(&str, &str, u16, ErrorCode)] = &[
            ("a200", "Invalid WebSocket frame: RSV2 and RSV3 must be clear", 1002, ErrorCode::UnexpectedRsv2Rsv3),
            ("c200", "Invalid WebSocket frame: RSV1 must be clear", 1002, ErrorCode::UnexpectedRsv1),
            ("8500", "Invalid WebSocket frame: invalid opcode 5", 1002, ErrorCode::InvalidOpcode),
            ("8f00", "Invalid WebSocket frame: invalid opcode 15", 1002, ErrorCode::InvalidOpcode),
            ("8000", "Invalid WebSocket frame: invalid opcode 0", 1002, ErrorCode::InvalidOpcode),
            ("0900", "Invalid WebSocket frame: FIN must be set", 1002, ErrorCode::ExpectedFin),
            ("897e", "Invalid WebSocket frame: invalid payload length 126", 1002, ErrorCode::InvalidControlPayloadLength),
            ("880100", "Invalid WebSocket frame: invalid payload length 1", 1002, ErrorCode::InvalidControlPayloadLength),
            ("8180", "Invalid WebSocket frame: MASK must be clear", 1002, ErrorCode::UnexpectedMask),
        ];
        for (input, message, close, code) in cases {
            let mut receiver = client();
            let events = receiver.write(&hex(input)).await;
            assert_eq!(protocol_error(&events), (message.to_string(), *close), "{input}");
            assert_eq!(error_code(&events), *code, "{input}");
            assert!(receiver.is_failed());
        }

        let events = server().write(&hex("8100")).await;
        assert_eq!(
            protocol_error(&events),
            ("Invalid WebSocket frame: MASK must be set".into(), 1002)
        );
        assert_eq!(error_code(&events), ErrorCode::ExpectedMask);
    }

    #[tokio::test]
    async fn test_data_frame_inside_fragmented_message() {
        let mut receiver = client();
        let events = receiver.write(&hex("01026869")).await;
        assert!(events.is_empty());
        let events = receiver.write(&hex("81026869")).await;
        assert_eq!(
            protocol_error(&events),
            ("Invalid WebSocket frame: invalid opcode 1".into(), 1002)
        );
    }

    #[tokio::test]
    async fn test_rsv1_on_continuation() {
        let pmd = compression(Role::Client, 0);
        let mut receiver = Receiver::new(Role::Client, &Config::default(), Some(pmd));
        receiver.write(&hex("01026869")).await;
        let events = receiver.write(&hex("c0026869")).await;
        assert_eq!(error_code(&events), ErrorCode::UnexpectedRsv1);
    }

    #[tokio::test]
    async fn test_rsv1_before_negotiation() {
        let pending = PerMessageDeflate::new(DeflateOptions::default(), Role::Client, 0);
        let mut receiver = Receiver::new(Role::Client, &Config::default(), Some(pending));
        let events = receiver.write(&[0xc1, 0x02, b'h', b'i']).await;

        assert_eq!(
            protocol_error(&events),
            ("Invalid WebSocket frame: RSV1 must be clear".into(), 1002)
        );
        assert_eq!(error_code(&events), ErrorCode::UnexpectedRsv1);
    }

    #[tokio::test]
    async fn test_payload_length_over_2_53() {
        let mut receiver = client();
        let events = receiver.write(&hex("827f0020000000000000")).await;
        assert_eq!(
            protocol_error(&events),
            ("Unsupported WebSocket frame: payload length > 2^53 - 1".into(), 1009)
        );
        assert_eq!(error_code(&events), ErrorCode::UnsupportedDataPayloadLength);
    }

    #[tokio::test]
    async fn test_max_payload_boundary() {
        let config = Config::builder().max_payload(20).build();

        let mut buf = BytesMut::new();
        encode_frame(&mut buf, OpCode::Binary, &[0; 20], true, None);
        let events = Receiver::new(Role::Client, &config, None).write(&buf).await;
        assert!(matches!(&events[..], [FrameEvent::Message(_)]));

        let mut buf = BytesMut::new();
        encode_frame(&mut buf, OpCode::Binary, &[0; 21], true, None);
        let events = Receiver::new(Role::Client, &config, None).write(&buf).await;
        assert_eq!(protocol_error(&events), ("Max payload size exceeded".into(), 1009));
        assert_eq!(error_code(&events), ErrorCode::UnsupportedMessageLength);
    }

    #[tokio::test]
    async fn test_max_payload_across_fragments() {
        let config = Config::builder().max_payload(20).build();
        let mut receiver = Receiver::new(Role::Client, &config, None);

        let mut buf = BytesMut::new();
        encode_frame(&mut buf, OpCode::Binary, &[0; 15], false, None);
        encode_frame(&mut buf, OpCode::Continuation, &[0; 6], true, None);
        let events = receiver.write(&buf).await;
        assert_eq!(protocol_error(&events), ("Max payload size exceeded".into(), 1009));
    }

    #[tokio::test]
    async fn test_max_payload_applies_to_decompressed_size() {
        let config = Config::builder().max_payload(25).build();
        let sender_side = compression(Role::Server, 0);
        let data = sender_side.compress(Bytes::from(vec![b'A'; 50]), true).await.unwrap();
        assert!(data.len() <= 25);

        let mut buf = BytesMut::new();
        encode_frame_with_rsv(&mut buf, OpCode::Binary, &data, true, None, true);
        let mut receiver = Receiver::new(Role::Client, &config, Some(compression(Role::Client, 25)));
        let events = receiver.write(&buf).await;
        assert_eq!(protocol_error(&events), ("Max payload size exceeded".into(), 1009));
    }

    #[tokio::test]
    async fn test_invalid_utf8() {
        let mut receiver = client();
        let events = receiver.write(&hex("8104cebae1bd")).await;
        assert_eq!(
            protocol_error(&events),
            ("Invalid WebSocket frame: invalid UTF-8 sequence".into(), 1007)
        );
        assert_eq!(error_code(&events), ErrorCode::InvalidUtf8);
    }

    #[tokio::test]
    async fn test_invalid_utf8_detected_per_fragment() {
        let mut receiver = client();
        // the first fragment already contains a surrogate half
        let events = receiver.write(&hex("0103eda080")).await;
        assert_eq!(error_code(&events), ErrorCode::InvalidUtf8);
    }

    #[tokio::test]
    async fn test_utf8_split_between_fragments() {
        let mut receiver = client();
        // U+03BA split across two frames
        let events = receiver.write(&hex("0101ce8001ba")).await;
        assert_eq!(text(&events), vec!["\u{03ba}"]);
    }

    #[tokio::test]
    async fn test_skip_utf8_validation() {
        let config = Config::builder().skip_utf8_validation(true).build();
        let mut receiver = Receiver::new(Role::Client, &config, None);
        let events = receiver.write(&hex("8104cebae1bd")).await;
        match &events[..] {
            [FrameEvent::Message(Message::Text(b))] => assert_eq!(&b[..], &hex("cebae1bd")[..]),
            other => panic!("{other:?}"),
        }
    }

    #[tokio::test]
    async fn test_close_validation() {
        let events = client().write(&hex("880203ed")).await;
        assert_eq!(
            protocol_error(&events),
            ("Invalid WebSocket frame: invalid status code 1005".into(), 1002)
        );
        assert_eq!(error_code(&events), ErrorCode::InvalidCloseCode);

        let events = client().write(&hex("880403e8ceff")).await;
        assert_eq!(
            protocol_error(&events),
            ("Invalid WebSocket frame: invalid UTF-8 sequence".into(), 1007)
        );
    }

    #[tokio::test]
    async fn test_data_after_close_is_ignored() {
        let mut receiver = client();
        let events = receiver.write(&hex("8800810548656c6c6f")).await;
        assert!(matches!(&events[..], [FrameEvent::Close { code: 1005, .. }]));
        assert!(receiver.write(&hex("810548656c6c6f")).await.is_empty());
        assert_eq!(receiver.buffered_bytes(), 0);
    }

    #[tokio::test]
    async fn test_no_parsing_after_error() {
        let mut receiver = client();
        receiver.write(&hex("8500")).await;
        assert!(receiver.write(&hex("810548656c6c6f")).await.is_empty());
    }

    #[tokio::test]
    async fn test_binary_types() {
        let mut buf = BytesMut::new();
        encode_frame(&mut buf, OpCode::Binary, b"ab", false, None);
        encode_frame(&mut buf, OpCode::Continuation, b"cd", true, None);

        let expected = [
            (BinaryType::Buffer, BinaryData::Buffer(Bytes::from_static(b"abcd"))),
            (BinaryType::Array, BinaryData::Array(b"abcd".to_vec())),
            (
                BinaryType::Fragments,
                BinaryData::Fragments(vec![Bytes::from_static(b"ab"), Bytes::from_static(b"cd")]),
            ),
        ];
        for (binary_type, data) in expected {
            let mut receiver = client();
            receiver.set_binary_type(binary_type);
            let events = receiver.write(&buf).await;
            match &events[..] {
                [FrameEvent::Message(Message::Binary(got))] => assert_eq!(got, &data),
                other => panic!("{other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_compressed_message() {
        let peer = compression(Role::Server, 0);
        let data = peer.compress(Bytes::from_static(b"Hello"), true).await.unwrap();

        let mut receiver = Receiver::new(Role::Client, &Config::default(), Some(compression(Role::Client, 0)));
        let mut header = vec![0xc1, data.len() as u8];
        header.extend_from_slice(&data);
        let events = receiver.write(&header).await;
        assert_eq!(text(&events), vec!["Hello"]);
    }

    #[tokio::test]
    async fn test_compressed_fragmented_message() {
        let peer = compression(Role::Server, 0);
        let first = peer.compress(Bytes::from_static(b"foo"), false).await.unwrap();
        let second = peer.compress(Bytes::from_static(b"bar"), true).await.unwrap();

        let mut buf = BytesMut::new();
        encode_frame_with_rsv(&mut buf, OpCode::Text, &first, false, None, true);
        encode_frame(&mut buf, OpCode::Continuation, &second, true, None);

        let mut receiver = Receiver::new(Role::Client, &Config::default(), Some(compression(Role::Client, 0)));
        let events = receiver.write(&buf).await;
        assert_eq!(text(&events), vec!["foobar"]);
    }

    #[tokio::test]
    async fn test_corrupt_compressed_payload() {
        let mut buf = BytesMut::new();
        encode_frame_with_rsv(&mut buf, OpCode::Binary, b"something invalid", true, None, true);

        let mut receiver = Receiver::new(Role::Client, &Config::default(), Some(compression(Role::Client, 0)));
        let events = receiver.write(&buf).await;
        match events.last() {
            Some(FrameEvent::ProtocolError {
                error: Error::Zlib { code, .. },
                close_code,
            }) => {
                assert_eq!(*code, -3);
                assert_eq!(*close_code, 1007);
            }
            other => panic!("{other:?}"),
        }
    }
}
