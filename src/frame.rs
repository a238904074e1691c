//! WebSocket frame primitives and serialization
//!
//! Opcodes, the frame header model and the encoder used by the sender.
//! Inbound parsing lives in [`crate::receiver`], which needs the negotiated
//! extension state and so cannot be a free function over bytes.

use bytes::{BufMut, BytesMut};

use crate::mask::apply_mask;
use crate::{MEDIUM_MESSAGE_THRESHOLD, SMALL_MESSAGE_THRESHOLD};

/// WebSocket opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    /// Continuation frame
    Continuation = 0x0,
    /// Text frame
    Text = 0x1,
    /// Binary frame
    Binary = 0x2,
    /// Connection close
    Close = 0x8,
    /// Ping
    Ping = 0x9,
    /// Pong
    Pong = 0xA,
}

impl OpCode {
    /// Parse opcode from the low nibble of the first header byte.
    ///
    /// Reserved opcodes (3-7, 11-15) yield `None`.
    #[inline]
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x0 => Some(OpCode::Continuation),
            0x1 => Some(OpCode::Text),
            0x2 => Some(OpCode::Binary),
            0x8 => Some(OpCode::Close),
            0x9 => Some(OpCode::Ping),
            0xA => Some(OpCode::Pong),
            _ => None,
        }
    }

    /// Check if this is a control frame
    #[inline]
    pub fn is_control(&self) -> bool {
        (*self as u8) >= 0x8
    }

    /// Check if this is a data frame
    #[inline]
    pub fn is_data(&self) -> bool {
        (*self as u8) <= 0x2
    }
}

/// A WebSocket frame header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    /// Final fragment flag
    pub fin: bool,
    /// RSV1 (per-message compression)
    pub rsv1: bool,
    /// Frame opcode
    pub opcode: OpCode,
    /// Mask flag (must be true for client->server)
    pub masked: bool,
    /// Payload length
    pub payload_len: u64,
    /// Masking key (if masked)
    pub mask: Option<[u8; 4]>,
}

impl FrameHeader {
    /// Header for a frame about to be sent
    pub fn new(opcode: OpCode, payload_len: usize, fin: bool, rsv1: bool, mask: Option<[u8; 4]>) -> Self {
        Self {
            fin,
            rsv1,
            opcode,
            masked: mask.is_some(),
            payload_len: payload_len as u64,
            mask,
        }
    }

    /// Get the total header size in bytes
    #[inline]
    pub fn header_size(&self) -> usize {
        let mut size = 2;

        if self.payload_len > MEDIUM_MESSAGE_THRESHOLD as u64 {
            size += 8;
        } else if self.payload_len > SMALL_MESSAGE_THRESHOLD as u64 {
            size += 2;
        }

        if self.masked {
            size += 4;
        }

        size
    }

    /// Encode the frame header into a buffer
    #[inline]
    pub fn encode(&self, buf: &mut BytesMut) {
        // First byte: FIN, RSV1, opcode; RSV2 and RSV3 stay clear
        let mut b0 = self.opcode as u8;
        if self.fin {
            b0 |= 0x80;
        }
        if self.rsv1 {
            b0 |= 0x40;
        }
        buf.put_u8(b0);

        // Second byte: mask flag, payload length
        let mask_bit = if self.masked { 0x80 } else { 0x00 };

        if self.payload_len <= SMALL_MESSAGE_THRESHOLD as u64 {
            buf.put_u8(mask_bit | self.payload_len as u8);
        } else if self.payload_len <= MEDIUM_MESSAGE_THRESHOLD as u64 {
            buf.put_u8(mask_bit | 126);
            buf.put_u16(self.payload_len as u16);
        } else {
            buf.put_u8(mask_bit | 127);
            buf.put_u64(self.payload_len);
        }

        if let Some(mask) = self.mask {
            buf.put_slice(&mask);
        }
    }
}

/// Encode a frame into a buffer
///
/// For masked frames the payload is copied and masked in the output buffer;
/// the caller's bytes are never modified.
#[inline]
pub fn encode_frame(
    buf: &mut BytesMut,
    opcode: OpCode,
    payload: &[u8],
    fin: bool,
    mask: Option<[u8; 4]>,
) {
    encode_frame_with_rsv(buf, opcode, payload, fin, mask, false)
}

/// Encode a frame with RSV1 bit control (for compression)
pub fn encode_frame_with_rsv(
    buf: &mut BytesMut,
    opcode: OpCode,
    payload: &[u8],
    fin: bool,
    mask: Option<[u8; 4]>,
    rsv1: bool,
) {
    let header = FrameHeader::new(opcode, payload.len(), fin, rsv1, mask);
    buf.reserve(header.header_size() + payload.len());
    header.encode(buf);

    let start = buf.len();
    buf.put_slice(payload);
    if let Some(m) = mask {
        apply_mask(&mut buf[start..], m);
    }
}

/// Build a close frame body: 16-bit big-endian code followed by the reason
pub fn close_payload(code: u16, reason: &[u8]) -> BytesMut {
    let mut body = BytesMut::with_capacity(2 + reason.len());
    body.put_u16(code);
    body.put_slice(reason);
    body
}
