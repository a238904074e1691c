//! Outbound frame builder
//!
//! [`Sender`] serializes messages into frames, optionally compressing them
//! through the connection's [`PerMessageDeflate`] instance, and writes them
//! to any [`AsyncWrite`] transport through a [`CorkBuffer`].
//!
//! Every operation takes `&mut self` and completes before the next one
//! starts, so frames reach the transport in call order. A [`SenderHandle`]
//! lets another task tear the session down while an operation is pending.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use log::{debug, trace};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::cork::CorkBuffer;
use crate::deflate::PerMessageDeflate;
use crate::error::{CloseReason, Error, ReadyState, Result};
use crate::frame::{FrameHeader, OpCode, close_payload, encode_frame_with_rsv};
use crate::mask::MaskKeySource;
use crate::{Config, MAX_FRAME_HEADER_SIZE, SMALL_MESSAGE_THRESHOLD};

/// Largest close reason that fits a control frame next to the status code
const MAX_CLOSE_REASON: usize = SMALL_MESSAGE_THRESHOLD - 2;

/// Unmasked payloads above this size are queued without copying
const ZERO_COPY_THRESHOLD: usize = 16 * 1024;

/// Data to send; borrowed payloads are copied only when framed
#[derive(Debug, Clone)]
pub enum Payload<'a> {
    Borrowed(&'a [u8]),
    Owned(Bytes),
}

impl Payload<'_> {
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        match self {
            Payload::Borrowed(s) => s,
            Payload::Owned(b) => b,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn into_bytes(self) -> Bytes {
        match self {
            Payload::Borrowed(s) => Bytes::copy_from_slice(s),
            Payload::Owned(b) => b,
        }
    }
}

impl<'a> From<&'a [u8]> for Payload<'a> {
    fn from(s: &'a [u8]) -> Self {
        Payload::Borrowed(s)
    }
}

impl<'a, const N: usize> From<&'a [u8; N]> for Payload<'a> {
    fn from(s: &'a [u8; N]) -> Self {
        Payload::Borrowed(s)
    }
}

impl<'a> From<&'a str> for Payload<'a> {
    fn from(s: &'a str) -> Self {
        Payload::Borrowed(s.as_bytes())
    }
}

impl From<String> for Payload<'_> {
    fn from(s: String) -> Self {
        Payload::Owned(Bytes::from(s))
    }
}

impl From<Vec<u8>> for Payload<'_> {
    fn from(v: Vec<u8>) -> Self {
        Payload::Owned(Bytes::from(v))
    }
}

impl From<Bytes> for Payload<'_> {
    fn from(b: Bytes) -> Self {
        Payload::Owned(b)
    }
}

/// Per-call options for [`Sender::send`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendOptions {
    /// Binary (true) or text (false) message; ignored on continuation frames
    pub binary: bool,
    /// Compress if the extension was negotiated and the message is large enough
    pub compress: bool,
    /// Last fragment of the message
    pub fin: bool,
    /// Mask the payload (clients must)
    pub mask: bool,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            binary: false,
            compress: true,
            fin: true,
            mask: false,
        }
    }
}

impl SendOptions {
    pub fn text() -> Self {
        Self::default()
    }

    pub fn binary() -> Self {
        Self {
            binary: true,
            ..Self::default()
        }
    }

    pub fn compress(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    pub fn fin(mut self, fin: bool) -> Self {
        self.fin = fin;
        self
    }

    pub fn mask(mut self, mask: bool) -> Self {
        self.mask = mask;
        self
    }
}

/// Cross-task handle that terminates a [`Sender`]
#[derive(Debug, Clone)]
pub struct SenderHandle {
    terminated: Arc<AtomicBool>,
    extension: Option<PerMessageDeflate>,
}

impl SenderHandle {
    /// Close the session. A send waiting on compression fails with
    /// [`Error::SocketClosed`]; later calls fail with [`Error::InvalidState`].
    pub fn terminate(&self) {
        if !self.terminated.swap(true, Ordering::AcqRel) {
            debug!("sender terminated");
            if let Some(extension) = &self.extension {
                extension.cleanup();
            }
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }
}

/// WebSocket frame sender over an async transport
#[derive(Debug)]
pub struct Sender<W> {
    transport: W,
    cork: CorkBuffer,
    extension: Option<PerMessageDeflate>,
    masks: MaskKeySource,
    state: ReadyState,
    first_fragment: bool,
    compress: bool,
    terminated: Arc<AtomicBool>,
}

impl<W> Sender<W>
where
    W: AsyncWrite + Unpin,
{
    /// Create a sender. `extension` is the negotiated permessage-deflate
    /// instance, shared with the connection's receiver.
    pub fn new(transport: W, config: &Config, extension: Option<PerMessageDeflate>) -> Self {
        Self {
            transport,
            cork: CorkBuffer::with_capacity(config.write_buffer_size),
            extension,
            masks: MaskKeySource::new(),
            state: ReadyState::Open,
            first_fragment: true,
            compress: false,
            terminated: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Draw masking keys from a shared pool
    pub fn with_mask_source(mut self, masks: MaskKeySource) -> Self {
        self.masks = masks;
        self
    }

    pub fn handle(&self) -> SenderHandle {
        SenderHandle {
            terminated: Arc::clone(&self.terminated),
            extension: self.extension.clone(),
        }
    }

    pub fn ready_state(&self) -> ReadyState {
        if self.terminated.load(Ordering::Acquire) {
            ReadyState::Closed
        } else {
            self.state
        }
    }

    /// Bytes framed but not yet written to the transport; always 0 once
    /// terminated, as those bytes are never written
    #[inline]
    pub fn buffered_amount(&self) -> usize {
        if self.terminated.load(Ordering::Acquire) {
            0
        } else {
            self.cork.pending_bytes()
        }
    }

    pub fn get_ref(&self) -> &W {
        &self.transport
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.transport
    }

    pub fn into_inner(self) -> W {
        self.transport
    }

    /// Hold frames back until [`uncork`](Self::uncork)
    pub fn cork(&mut self) {
        self.cork.cork();
    }

    /// Write everything held back since [`cork`](Self::cork) in one go
    pub async fn uncork(&mut self) -> Result<()> {
        if self.cork.uncork() {
            self.flush().await?;
        }
        Ok(())
    }

    fn check_open(&mut self) -> Result<()> {
        match self.ready_state() {
            ReadyState::Open => Ok(()),
            state => {
                if self.terminated.load(Ordering::Acquire) {
                    self.cork.clear();
                }
                Err(Error::InvalidState(state))
            }
        }
    }

    /// Send a data frame.
    ///
    /// Whether a message is compressed is decided on its first fragment;
    /// continuation frames follow that decision and carry opcode 0.
    pub async fn send<'a>(&mut self, data: impl Into<Payload<'a>>, options: SendOptions) -> Result<()> {
        self.check_open()?;
        let payload = data.into();

        let (opcode, rsv1) = if self.first_fragment {
            self.compress = options.compress
                && self
                    .extension
                    .as_ref()
                    .is_some_and(|ext| ext.params().is_some() && payload.len() >= ext.threshold());
            let opcode = if options.binary { OpCode::Binary } else { OpCode::Text };
            (opcode, self.compress)
        } else {
            (OpCode::Continuation, false)
        };
        self.first_fragment = options.fin;

        match &self.extension {
            Some(extension) if self.compress => {
                let data = extension.compress(payload.into_bytes(), options.fin).await;
                if self.terminated.load(Ordering::Acquire) {
                    return Err(Error::SocketClosed);
                }
                let data = data?;
                self.frame(opcode, Payload::Owned(data), options.fin, rsv1, options.mask)?;
            }
            _ => self.frame(opcode, payload, options.fin, rsv1, options.mask)?,
        }

        self.flush_if_uncorked().await
    }

    /// Send a ping frame
    pub async fn ping<'a>(&mut self, data: impl Into<Payload<'a>>, mask: bool) -> Result<()> {
        self.control(OpCode::Ping, data.into(), mask).await
    }

    /// Send a pong frame
    pub async fn pong<'a>(&mut self, data: impl Into<Payload<'a>>, mask: bool) -> Result<()> {
        self.control(OpCode::Pong, data.into(), mask).await
    }

    async fn control(&mut self, opcode: OpCode, payload: Payload<'_>, mask: bool) -> Result<()> {
        self.check_open()?;
        if payload.len() > SMALL_MESSAGE_THRESHOLD {
            return Err(Error::InvalidArgument(
                "The data size must not be greater than 125 bytes".into(),
            ));
        }
        self.frame(opcode, payload, true, false, mask)?;
        self.flush_if_uncorked().await
    }

    /// Start the closing handshake.
    ///
    /// Without a code the close frame is empty and `reason` is ignored. The
    /// frame is written immediately, even while corked.
    pub async fn close(&mut self, code: Option<u16>, reason: &str, mask: bool) -> Result<()> {
        self.check_open()?;

        let body = match code {
            None => Bytes::new(),
            Some(code) if !CloseReason::is_valid_code(code) => {
                return Err(Error::InvalidArgument(
                    "First argument must be a valid error code number".into(),
                ));
            }
            Some(_) if reason.len() > MAX_CLOSE_REASON => {
                return Err(Error::InvalidArgument(
                    "The message must not be greater than 123 bytes".into(),
                ));
            }
            Some(code) => close_payload(code, reason.as_bytes()).freeze(),
        };

        self.frame(OpCode::Close, Payload::Owned(body), true, false, mask)?;
        self.state = ReadyState::Closing;
        debug!("close frame queued: code={code:?}");

        self.cork.uncork();
        self.flush().await
    }

    fn frame(&mut self, opcode: OpCode, payload: Payload<'_>, fin: bool, rsv1: bool, mask: bool) -> Result<()> {
        let key = if mask { Some(self.masks.next_key()?) } else { None };
        trace!(
            "frame: opcode={opcode:?} fin={fin} rsv1={rsv1} masked={mask} len={}",
            payload.len()
        );

        match payload {
            Payload::Owned(data) if key.is_none() && data.len() > ZERO_COPY_THRESHOLD => {
                let header = FrameHeader::new(opcode, data.len(), fin, rsv1, None);
                let buf = self.cork.buffer_mut();
                buf.reserve(MAX_FRAME_HEADER_SIZE);
                header.encode(buf);
                self.cork.write_bytes(data);
            }
            payload => {
                encode_frame_with_rsv(self.cork.buffer_mut(), opcode, payload.as_slice(), fin, key, rsv1);
            }
        }
        Ok(())
    }

    async fn flush_if_uncorked(&mut self) -> Result<()> {
        if !self.cork.is_corked() || self.cork.is_full() {
            self.flush().await?;
        }
        Ok(())
    }

    /// Write all buffered frames to the transport
    pub async fn flush(&mut self) -> Result<()> {
        while self.cork.has_data() {
            let written = {
                let slices = self.cork.get_write_slices();
                self.transport.write_vectored(&slices).await?
            };
            if written == 0 {
                return Err(Error::Io(io::ErrorKind::WriteZero.into()));
            }
            self.cork.consume(written);
        }
        self.transport.flush().await?;
        Ok(())
    }
}
