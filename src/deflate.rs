//! Per-Message Deflate Extension (RFC 7692)
//!
//! [`PerMessageDeflate`] negotiates the extension parameters and runs the
//! deflate/inflate engines of one connection. It is a cheap handle: the
//! sender and the receiver of a connection hold clones of the same instance.
//!
//! Every compress and decompress call is queued on a [`Limiter`] with a
//! concurrency of one at the moment it is made, so jobs run strictly in
//! submission order no matter how their futures are scheduled. Large
//! payloads are processed on tokio's blocking pool.
//!
//! Dropping a compress or decompress future after it started leaves the
//! compression context out of step with the peer; callers are expected to
//! tear the session down in that case.

use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use flate2::{
    Compress, CompressError, Compression, Decompress, DecompressError, FlushCompress,
    FlushDecompress, Status,
};
use log::{debug, trace};
use parking_lot::Mutex;

use crate::Role;
use crate::error::{Error, Result};
use crate::extension::{self, Extensions, ParamValue, Params};
use crate::limiter::Limiter;

/// Registered extension token
pub const EXTENSION_NAME: &str = "permessage-deflate";

/// Trailer bytes that are removed after compression and restored before decompression
pub const DEFLATE_TRAILER: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

/// Default LZ77 window size (32KB = 2^15)
pub const DEFAULT_WINDOW_BITS: u8 = 15;

/// Minimum LZ77 window size (256 bytes = 2^8)
pub const MIN_WINDOW_BITS: u8 = 8;

/// Maximum LZ77 window size (32KB = 2^15)
pub const MAX_WINDOW_BITS: u8 = 15;

/// Payloads at least this large are compressed on the blocking pool
const BLOCKING_THRESHOLD: usize = 64 * 1024;

/// zlib status codes surfaced through [`Error::Zlib`]
pub const Z_NEED_DICT: i32 = 2;
pub const Z_STREAM_ERROR: i32 = -2;
pub const Z_DATA_ERROR: i32 = -3;

/// Name of a zlib status code
pub fn zlib_code_name(code: i32) -> &'static str {
    match code {
        Z_NEED_DICT => "Z_NEED_DICT",
        Z_STREAM_ERROR => "Z_STREAM_ERROR",
        Z_DATA_ERROR => "Z_DATA_ERROR",
        _ => "Z_UNKNOWN",
    }
}

/// Local policy for a `*_max_window_bits` parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WindowBits {
    /// No preference; clients advertise support for `client_max_window_bits`
    #[default]
    Unset,
    /// Advertise the parameter without a value
    Enabled,
    /// Refuse the parameter
    Disabled,
    /// Use (and require) this window size
    Bits(u8),
}

/// Configuration for permessage-deflate
#[derive(Debug, Clone)]
pub struct DeflateOptions {
    /// `None` leaves the choice to the peer; `Some(false)` refuses it
    pub server_no_context_takeover: Option<bool>,
    /// `None` leaves the choice to the peer; `Some(false)` refuses it
    pub client_no_context_takeover: Option<bool>,
    pub server_max_window_bits: WindowBits,
    pub client_max_window_bits: WindowBits,
    /// Compression level (0-9)
    pub level: u32,
    /// Messages smaller than this are sent uncompressed
    pub threshold: usize,
    /// Engine output buffer growth step; also the granularity of the
    /// decompressed size check
    pub chunk_size: usize,
}

impl Default for DeflateOptions {
    fn default() -> Self {
        Self {
            server_no_context_takeover: None,
            client_no_context_takeover: None,
            server_max_window_bits: WindowBits::Unset,
            client_max_window_bits: WindowBits::Unset,
            level: 6,
            threshold: 1024,
            chunk_size: 16 * 1024,
        }
    }
}

impl DeflateOptions {
    pub fn level(mut self, level: u32) -> Self {
        self.level = level.min(9);
        self
    }

    pub fn threshold(mut self, threshold: usize) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn server_no_context_takeover(mut self, value: bool) -> Self {
        self.server_no_context_takeover = Some(value);
        self
    }

    pub fn client_no_context_takeover(mut self, value: bool) -> Self {
        self.client_no_context_takeover = Some(value);
        self
    }

    pub fn server_max_window_bits(mut self, value: WindowBits) -> Self {
        self.server_max_window_bits = value;
        self
    }

    pub fn client_max_window_bits(mut self, value: WindowBits) -> Self {
        self.client_max_window_bits = value;
        self
    }
}

/// Negotiated extension parameters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeflateParams {
    pub server_no_context_takeover: bool,
    pub client_no_context_takeover: bool,
    pub server_max_window_bits: Option<u8>,
    pub client_max_window_bits: Option<u8>,
}

impl DeflateParams {
    /// Parameter map in header order
    pub fn to_params(&self) -> Params {
        let mut params = Params::new();
        if self.server_no_context_takeover {
            params.insert("server_no_context_takeover".into(), vec![ParamValue::Flag]);
        }
        if self.client_no_context_takeover {
            params.insert("client_no_context_takeover".into(), vec![ParamValue::Flag]);
        }
        if let Some(bits) = self.server_max_window_bits {
            params.insert("server_max_window_bits".into(), vec![bits.into()]);
        }
        if let Some(bits) = self.client_max_window_bits {
            params.insert("client_max_window_bits".into(), vec![bits.into()]);
        }
        params
    }

    /// `Sec-WebSocket-Extensions` value for a server response
    pub fn to_header(&self) -> String {
        let mut extensions = Extensions::new();
        extensions.insert(EXTENSION_NAME.into(), vec![self.to_params()]);
        extension::format(&extensions)
    }

    fn no_context_takeover(&self, role: Role) -> bool {
        match role {
            Role::Server => self.server_no_context_takeover,
            Role::Client => self.client_no_context_takeover,
        }
    }

    fn max_window_bits(&self, role: Role) -> u8 {
        match role {
            Role::Server => self.server_max_window_bits,
            Role::Client => self.client_max_window_bits,
        }
        .unwrap_or(DEFAULT_WINDOW_BITS)
    }
}

/// `client_max_window_bits` as it may appear in an offer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OfferedBits {
    Flag,
    Bits(u8),
}

/// One offer after parameter validation
#[derive(Debug, Default)]
struct Offer {
    server_no_context_takeover: bool,
    client_no_context_takeover: bool,
    server_max_window_bits: Option<u8>,
    client_max_window_bits: Option<OfferedBits>,
}

fn invalid_value(name: &str, value: &ParamValue) -> Error {
    Error::InvalidParameterValue {
        name: name.to_owned(),
        value: value.to_string(),
    }
}

/// Window bits are read as a number, so `10`, `+10` and `10.0` are the same
/// value; anything non-integral or outside 8..=15 is rejected.
fn parse_window_bits(name: &str, value: &ParamValue) -> Result<u8> {
    value
        .as_str()
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|bits| bits.fract() == 0.0)
        .filter(|bits| (f64::from(MIN_WINDOW_BITS)..=f64::from(MAX_WINDOW_BITS)).contains(bits))
        .map(|bits| bits as u8)
        .ok_or_else(|| invalid_value(name, value))
}

fn normalize(params: &Params, role: Role) -> Result<Offer> {
    let mut offer = Offer::default();

    for (key, values) in params {
        if values.len() > 1 {
            return Err(Error::Negotiation(format!(
                "Parameter \"{key}\" must have only a single value"
            )));
        }
        let Some(value) = values.first() else {
            continue;
        };

        match key.as_str() {
            "client_max_window_bits" => {
                offer.client_max_window_bits = Some(match value {
                    ParamValue::Flag if role == Role::Server => OfferedBits::Flag,
                    _ => OfferedBits::Bits(parse_window_bits(key, value)?),
                });
            }
            "server_max_window_bits" => {
                offer.server_max_window_bits = Some(parse_window_bits(key, value)?);
            }
            "client_no_context_takeover" | "server_no_context_takeover" => {
                if !value.is_flag() {
                    return Err(invalid_value(key, value));
                }
                if key == "client_no_context_takeover" {
                    offer.client_no_context_takeover = true;
                } else {
                    offer.server_no_context_takeover = true;
                }
            }
            _ => return Err(Error::Negotiation(format!("Unknown parameter \"{key}\""))),
        }
    }

    Ok(offer)
}

fn zlib_compress_error(err: CompressError) -> Error {
    Error::Zlib {
        code: Z_STREAM_ERROR,
        message: err.to_string(),
    }
}

fn zlib_decompress_error(err: DecompressError) -> Error {
    let code = if err.needs_dictionary().is_some() {
        Z_NEED_DICT
    } else {
        Z_DATA_ERROR
    };
    Error::Zlib {
        code,
        message: err.to_string(),
    }
}

/// Raw deflate stream for outgoing messages
#[derive(Debug)]
struct Deflater {
    engine: Compress,
    chunk_size: usize,
}

impl Deflater {
    fn new(level: u32, window_bits: u8, chunk_size: usize) -> Self {
        // zlib refuses an 8-bit window for raw deflate and silently uses 9;
        // a 9-bit stream is still readable with an 8-bit window.
        let engine = Compress::new_with_window_bits(
            Compression::new(level),
            false,
            window_bits.max(MIN_WINDOW_BITS + 1),
        );
        Self { engine, chunk_size }
    }

    fn compress(&mut self, data: &[u8], fin: bool) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.chunk_size.min(data.len() + 64));

        // Feeding the input without a flush first makes the sync flush below
        // emit its marker even when `data` is empty.
        self.run(data, &mut out, FlushCompress::None)?;
        self.run(&[], &mut out, FlushCompress::Sync)?;

        if out.is_empty() {
            // the stream is byte aligned after every flush, so an empty
            // stored block is always a valid continuation
            out.extend_from_slice(&[0x00]);
            out.extend_from_slice(&DEFLATE_TRAILER);
        }

        if fin && out.ends_with(&DEFLATE_TRAILER) {
            out.truncate(out.len() - DEFLATE_TRAILER.len());
        }
        Ok(out)
    }

    fn run(&mut self, input: &[u8], out: &mut Vec<u8>, flush: FlushCompress) -> Result<()> {
        let start_in = self.engine.total_in();

        loop {
            if out.len() == out.capacity() {
                out.reserve(self.chunk_size);
            }
            let consumed = (self.engine.total_in() - start_in) as usize;
            self.engine
                .compress_vec(&input[consumed..], out, flush)
                .map_err(zlib_compress_error)?;

            let consumed = (self.engine.total_in() - start_in) as usize;
            if consumed == input.len() && out.len() < out.capacity() {
                return Ok(());
            }
        }
    }

    fn reset(&mut self) {
        self.engine.reset();
    }
}

/// Raw inflate stream for incoming messages
#[derive(Debug)]
struct Inflater {
    engine: Decompress,
    chunk_size: usize,
    ended: bool,
    /// Bytes inflated so far for the current message
    total_length: usize,
}

impl Inflater {
    fn new(window_bits: u8, chunk_size: usize) -> Self {
        Self {
            engine: Decompress::new_with_window_bits(false, window_bits.max(MIN_WINDOW_BITS + 1)),
            chunk_size,
            ended: false,
            total_length: 0,
        }
    }

    /// Inflate one fragment. `max_payload` caps the whole message, not
    /// just this fragment; 0 disables the check.
    fn decompress(&mut self, data: &[u8], fin: bool, max_payload: usize) -> Result<Vec<u8>> {
        let limit = (max_payload > 0).then(|| max_payload.saturating_sub(self.total_length));

        let mut out = Vec::new();
        let result = self.feed(data, &mut out, limit).and_then(|()| {
            if fin && !self.ended {
                self.feed(&DEFLATE_TRAILER, &mut out, limit)
            } else {
                Ok(())
            }
        });

        if let Err(err) = result {
            self.total_length = 0;
            return Err(err);
        }

        self.total_length = if fin { 0 } else { self.total_length + out.len() };
        Ok(out)
    }

    fn feed(&mut self, input: &[u8], out: &mut Vec<u8>, limit: Option<usize>) -> Result<()> {
        let start_in = self.engine.total_in();

        // Anything after the end of the stream is discarded.
        while !self.ended {
            if out.len() == out.capacity() {
                let mut grow = self.chunk_size.max(out.len());
                if let Some(limit) = limit {
                    grow = grow.min((limit + 1).saturating_sub(out.len()).max(1));
                }
                out.reserve_exact(grow);
            }

            let consumed_before = (self.engine.total_in() - start_in) as usize;
            let produced_before = out.len();
            let status = self
                .engine
                .decompress_vec(&input[consumed_before..], out, FlushDecompress::Sync)
                .map_err(zlib_decompress_error)?;

            if limit.is_some_and(|limit| out.len() > limit) {
                return Err(Error::MaxPayloadExceeded);
            }

            let consumed = (self.engine.total_in() - start_in) as usize;
            match status {
                Status::StreamEnd => self.ended = true,
                Status::Ok | Status::BufError => {
                    let spare = out.len() < out.capacity();
                    let stalled = consumed == consumed_before && out.len() == produced_before;
                    if (consumed == input.len() && spare) || (stalled && spare) {
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    /// Start a fresh stream; the running message total is kept
    fn reset(&mut self) {
        self.engine.reset(false);
        self.ended = false;
    }
}

#[derive(Debug, Default)]
struct Engines {
    deflate: Option<Deflater>,
    inflate: Option<Inflater>,
}

#[derive(Debug)]
struct Inner {
    options: DeflateOptions,
    role: Role,
    max_payload: usize,
    params: Mutex<Option<DeflateParams>>,
    engines: Mutex<Engines>,
    limiter: Limiter,
    closed: AtomicBool,
}

impl Inner {
    fn negotiated(&self) -> Result<DeflateParams> {
        self.params.lock()
            .clone()
            .ok_or_else(|| Error::Negotiation("permessage-deflate has not been negotiated".into()))
    }

    fn run_compress(&self, data: &[u8], fin: bool) -> Result<Bytes> {
        let params = self.negotiated()?;
        let mut engines = self.engines.lock();
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::StreamClosed("deflate"));
        }

        let role = self.role;
        let deflater = engines.deflate.get_or_insert_with(|| {
            let bits = params.max_window_bits(role);
            trace!("creating deflate engine: window_bits={bits}");
            Deflater::new(self.options.level, bits, self.options.chunk_size)
        });

        let out = deflater.compress(data, fin)?;
        if fin && params.no_context_takeover(role) {
            deflater.reset();
        }
        Ok(Bytes::from(out))
    }

    fn run_decompress(&self, data: &[u8], fin: bool) -> Result<Bytes> {
        let params = self.negotiated()?;
        let mut engines = self.engines.lock();
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::StreamClosed("inflate"));
        }

        let peer = self.role.peer();
        let inflater = engines.inflate.get_or_insert_with(|| {
            let bits = params.max_window_bits(peer);
            trace!("creating inflate engine: window_bits={bits}");
            Inflater::new(bits, self.options.chunk_size)
        });

        match inflater.decompress(data, fin, self.max_payload) {
            Ok(out) => {
                if inflater.ended || (fin && params.no_context_takeover(peer)) {
                    inflater.reset();
                }
                Ok(Bytes::from(out))
            }
            Err(err) => {
                engines.inflate = None;
                Err(err)
            }
        }
    }
}

/// permessage-deflate state for one connection
#[derive(Debug, Clone)]
pub struct PerMessageDeflate {
    inner: Arc<Inner>,
}

impl PerMessageDeflate {
    /// Create the extension for one side of a connection.
    ///
    /// `max_payload` bounds the inflated size of each message, summed over
    /// its fragments; 0 disables the check.
    pub fn new(options: DeflateOptions, role: Role, max_payload: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                options,
                role,
                max_payload,
                params: Mutex::new(None),
                engines: Mutex::new(Engines::default()),
                limiter: Limiter::new(1),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    pub fn options(&self) -> &DeflateOptions {
        &self.inner.options
    }

    /// Minimum message size worth compressing
    pub fn threshold(&self) -> usize {
        self.inner.options.threshold
    }

    /// Parameters agreed by the last successful [`accept`](Self::accept)
    pub fn params(&self) -> Option<DeflateParams> {
        self.inner.params.lock().clone()
    }

    /// Extension parameters to offer in a client request
    pub fn offer(&self) -> Params {
        let opts = &self.inner.options;
        let mut params = Params::new();

        if opts.server_no_context_takeover == Some(true) {
            params.insert("server_no_context_takeover".into(), vec![ParamValue::Flag]);
        }
        if opts.client_no_context_takeover == Some(true) {
            params.insert("client_no_context_takeover".into(), vec![ParamValue::Flag]);
        }
        match opts.server_max_window_bits {
            WindowBits::Bits(bits) => {
                params.insert("server_max_window_bits".into(), vec![bits.into()]);
            }
            WindowBits::Enabled => {
                params.insert("server_max_window_bits".into(), vec![ParamValue::Flag]);
            }
            WindowBits::Unset | WindowBits::Disabled => {}
        }
        match opts.client_max_window_bits {
            WindowBits::Bits(bits) => {
                params.insert("client_max_window_bits".into(), vec![bits.into()]);
            }
            WindowBits::Enabled | WindowBits::Unset => {
                params.insert("client_max_window_bits".into(), vec![ParamValue::Flag]);
            }
            WindowBits::Disabled => {}
        }

        params
    }

    /// Accept an extension offer (server) or response (client).
    ///
    /// Servers pick the first offer compatible with the local options;
    /// clients validate the single response against what was offered.
    pub fn accept(&self, offers: &[Params]) -> Result<DeflateParams> {
        let role = self.inner.role;
        let offers = offers
            .iter()
            .map(|params| normalize(params, role))
            .collect::<Result<Vec<_>>>()?;

        let params = match role {
            Role::Server => self.accept_as_server(offers)?,
            Role::Client => self.accept_as_client(offers)?,
        };

        debug!("permessage-deflate negotiated: {params:?}");
        *self.inner.params.lock() = Some(params.clone());
        Ok(params)
    }

    fn accept_as_server(&self, offers: Vec<Offer>) -> Result<DeflateParams> {
        let opts = &self.inner.options;

        let accepted = offers
            .into_iter()
            .find(|offer| {
                let refuses_server_takeover = opts.server_no_context_takeover == Some(false)
                    && offer.server_no_context_takeover;
                let refuses_server_bits = match (offer.server_max_window_bits, opts.server_max_window_bits) {
                    (Some(_), WindowBits::Disabled) => true,
                    (Some(offered), WindowBits::Bits(configured)) => configured > offered,
                    _ => false,
                };
                let lacks_client_bits = matches!(opts.client_max_window_bits, WindowBits::Bits(_))
                    && offer.client_max_window_bits.is_none();
                !(refuses_server_takeover || refuses_server_bits || lacks_client_bits)
            })
            .ok_or_else(|| {
                Error::Negotiation("None of the extension offers can be accepted".into())
            })?;

        let mut params = DeflateParams {
            server_no_context_takeover: accepted.server_no_context_takeover,
            client_no_context_takeover: accepted.client_no_context_takeover,
            server_max_window_bits: accepted.server_max_window_bits,
            client_max_window_bits: match accepted.client_max_window_bits {
                Some(OfferedBits::Bits(bits)) => Some(bits),
                _ => None,
            },
        };

        if opts.server_no_context_takeover == Some(true) {
            params.server_no_context_takeover = true;
        }
        if opts.client_no_context_takeover == Some(true) {
            params.client_no_context_takeover = true;
        }
        if let WindowBits::Bits(bits) = opts.server_max_window_bits {
            params.server_max_window_bits = Some(bits);
        }
        match opts.client_max_window_bits {
            WindowBits::Bits(bits) => params.client_max_window_bits = Some(bits),
            WindowBits::Disabled => params.client_max_window_bits = None,
            WindowBits::Unset | WindowBits::Enabled => {}
        }

        Ok(params)
    }

    fn accept_as_client(&self, offers: Vec<Offer>) -> Result<DeflateParams> {
        let opts = &self.inner.options;
        let response = offers.into_iter().next().ok_or_else(|| {
            Error::Negotiation("None of the extension offers can be accepted".into())
        })?;

        if opts.client_no_context_takeover == Some(false) && response.client_no_context_takeover {
            return Err(Error::Negotiation(
                "Unexpected parameter \"client_no_context_takeover\"".into(),
            ));
        }

        let client_max_window_bits = match (response.client_max_window_bits, opts.client_max_window_bits) {
            (None, WindowBits::Bits(configured)) => Some(configured),
            (None, _) => None,
            (Some(OfferedBits::Bits(bits)), WindowBits::Bits(configured)) if bits > configured => {
                return Err(unexpected_client_bits());
            }
            (Some(_), WindowBits::Disabled) => return Err(unexpected_client_bits()),
            (Some(OfferedBits::Bits(bits)), _) => Some(bits),
            // normalization rejects a bare flag on the client side
            (Some(OfferedBits::Flag), _) => return Err(unexpected_client_bits()),
        };

        Ok(DeflateParams {
            server_no_context_takeover: response.server_no_context_takeover,
            client_no_context_takeover: response.client_no_context_takeover,
            server_max_window_bits: response.server_max_window_bits,
            client_max_window_bits,
        })
    }

    /// Compress one fragment of a message.
    ///
    /// The job is queued when this is called, not when the future is first
    /// polled. On the final fragment the trailing `00 00 ff ff` is removed.
    pub fn compress(&self, data: Bytes, fin: bool) -> impl Future<Output = Result<Bytes>> + Send + 'static {
        let slot = self.inner.limiter.add();
        let inner = Arc::clone(&self.inner);

        async move {
            let permit = slot.await.map_err(|_| Error::StreamClosed("deflate"))?;
            let result = run_job(Arc::clone(&inner), data, move |inner, data| {
                let _permit = permit;
                inner.run_compress(&data, fin)
            })
            .await;

            if inner.closed.load(Ordering::Acquire) {
                return Err(Error::StreamClosed("deflate"));
            }
            result
        }
    }

    /// Decompress one fragment of a message.
    ///
    /// Fails with [`Error::MaxPayloadExceeded`] as soon as the message
    /// inflated so far, this fragment included, grows past `max_payload`.
    pub fn decompress(&self, data: Bytes, fin: bool) -> impl Future<Output = Result<Bytes>> + Send + 'static {
        let slot = self.inner.limiter.add();
        let inner = Arc::clone(&self.inner);

        async move {
            let permit = slot.await.map_err(|_| Error::StreamClosed("inflate"))?;
            let result = run_job(Arc::clone(&inner), data, move |inner, data| {
                let _permit = permit;
                inner.run_decompress(&data, fin)
            })
            .await;

            if inner.closed.load(Ordering::Acquire) {
                return Err(Error::StreamClosed("inflate"));
            }
            result
        }
    }

    /// Release both engines. Queued and running jobs fail with
    /// [`Error::StreamClosed`].
    pub fn cleanup(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.limiter.close();
        let mut engines = self.inner.engines.lock();
        engines.deflate = None;
        engines.inflate = None;
        debug!("permessage-deflate engines released");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

fn unexpected_client_bits() -> Error {
    Error::Negotiation("Unexpected or invalid parameter \"client_max_window_bits\"".into())
}

async fn run_job<F>(inner: Arc<Inner>, data: Bytes, job: F) -> Result<Bytes>
where
    F: FnOnce(&Inner, Bytes) -> Result<Bytes> + Send + 'static,
{
    if data.len() < BLOCKING_THRESHOLD {
        return job(&inner, data);
    }
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => handle
            .spawn_blocking(move || job(&inner, data))
            .await
            .map_err(|e| Error::Io(io::Error::other(e)))?,
        Err(_) => job(&inner, data),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offers(header: &str) -> Vec<Params> {
        extension::parse(header)
            .unwrap()
            .shift_remove(EXTENSION_NAME)
            .unwrap_or_default()
    }

    fn negotiation_message(result: Result<DeflateParams>) -> String {
        result.unwrap_err().to_string()
    }

    const ALL_PARAMS: &str = "permessage-deflate; server_no_context_takeover; \
        client_no_context_takeover; server_max_window_bits=10; client_max_window_bits=11";

    #[test]
    fn test_offer_default() {
        let pmd = PerMessageDeflate::new(DeflateOptions::default(), Role::Client, 0);
        let offer = pmd.offer();
        assert_eq!(offer.len(), 1);
        assert_eq!(offer["client_max_window_bits"], vec![ParamValue::Flag]);
    }

    #[test]
    fn test_offer_uses_options() {
        let options = DeflateOptions::default()
            .server_no_context_takeover(true)
            .client_no_context_takeover(true)
            .server_max_window_bits(WindowBits::Bits(10))
            .client_max_window_bits(WindowBits::Bits(11));
        let pmd = PerMessageDeflate::new(options, Role::Client, 0);

        let mut ext = Extensions::new();
        ext.insert(EXTENSION_NAME.into(), vec![pmd.offer()]);
        assert_eq!(
            extension::format(&ext),
            "permessage-deflate; server_no_context_takeover; client_no_context_takeover; \
             server_max_window_bits=10; client_max_window_bits=11"
        );
    }

    #[test]
    fn test_accept_rejects_bad_parameters() {
        let pmd = PerMessageDeflate::new(DeflateOptions::default(), Role::Client, 0);

        assert_eq!(
            negotiation_message(pmd.accept(&offers(
                "permessage-deflate; server_no_context_takeover; server_no_context_takeover"
            ))),
            "Parameter \"server_no_context_takeover\" must have only a single value"
        );
        assert_eq!(
            negotiation_message(pmd.accept(&offers("permessage-deflate;foo"))),
            "Unknown parameter \"foo\""
        );
        assert_eq!(
            negotiation_message(pmd.accept(&offers("permessage-deflate; client_no_context_takeover=10"))),
            "Invalid value for parameter \"client_no_context_takeover\": 10"
        );
        assert_eq!(
            negotiation_message(pmd.accept(&offers("permessage-deflate; server_no_context_takeover=10"))),
            "Invalid value for parameter \"server_no_context_takeover\": 10"
        );
        assert_eq!(
            negotiation_message(pmd.accept(&offers("permessage-deflate; server_max_window_bits=7"))),
            "Invalid value for parameter \"server_max_window_bits\": 7"
        );
        assert_eq!(
            negotiation_message(pmd.accept(&offers("permessage-deflate; server_max_window_bits"))),
            "Invalid value for parameter \"server_max_window_bits\": true"
        );
        assert_eq!(
            negotiation_message(pmd.accept(&offers("permessage-deflate; client_max_window_bits=16"))),
            "Invalid value for parameter \"client_max_window_bits\": 16"
        );
        assert_eq!(
            negotiation_message(pmd.accept(&offers("permessage-deflate; client_max_window_bits"))),
            "Invalid value for parameter \"client_max_window_bits\": true"
        );
        assert!(pmd.params().is_none());
    }

    #[test]
    fn test_window_bits_read_as_numbers() {
        let pmd = PerMessageDeflate::new(DeflateOptions::default(), Role::Server, 0);
        for value in ["10", "+10", "10.0"] {
            let header = format!("permessage-deflate; server_max_window_bits={value}");
            let params = pmd.accept(&offers(&header)).unwrap();
            assert_eq!(params.server_max_window_bits, Some(10), "{value}");
        }

        for value in ["10.5", "-10", "0x0a"] {
            let header = format!("permessage-deflate; server_max_window_bits={value}");
            assert_eq!(
                negotiation_message(pmd.accept(&offers(&header))),
                format!("Invalid value for parameter \"server_max_window_bits\": {value}")
            );
        }
    }

    #[test]
    fn test_accept_as_server() {
        let pmd = PerMessageDeflate::new(DeflateOptions::default(), Role::Server, 0);
        assert_eq!(pmd.accept(&[Params::new()]).unwrap(), DeflateParams::default());

        let params = pmd.accept(&offers(ALL_PARAMS)).unwrap();
        assert_eq!(
            params,
            DeflateParams {
                server_no_context_takeover: true,
                client_no_context_takeover: true,
                server_max_window_bits: Some(10),
                client_max_window_bits: Some(11),
            }
        );
        assert_eq!(pmd.params(), Some(params));

        // a bare client_max_window_bits is dropped from the response
        let params = pmd.accept(&offers("permessage-deflate; client_max_window_bits")).unwrap();
        assert_eq!(params.client_max_window_bits, None);
    }

    #[test]
    fn test_accept_as_server_prefers_options() {
        let options = DeflateOptions::default()
            .server_no_context_takeover(true)
            .client_no_context_takeover(true)
            .server_max_window_bits(WindowBits::Bits(12))
            .client_max_window_bits(WindowBits::Bits(11));
        let pmd = PerMessageDeflate::new(options, Role::Server, 0);

        let params = pmd
            .accept(&offers(
                "permessage-deflate; server_max_window_bits=14; client_max_window_bits=13",
            ))
            .unwrap();
        assert_eq!(
            params,
            DeflateParams {
                server_no_context_takeover: true,
                client_no_context_takeover: true,
                server_max_window_bits: Some(12),
                client_max_window_bits: Some(11),
            }
        );
        assert_eq!(
            params.to_header(),
            "permessage-deflate; server_no_context_takeover; client_no_context_takeover; \
             server_max_window_bits=12; client_max_window_bits=11"
        );
    }

    #[test]
    fn test_accept_as_server_first_supported_offer() {
        let options = DeflateOptions::default().server_max_window_bits(WindowBits::Bits(11));
        let pmd = PerMessageDeflate::new(options, Role::Server, 0);
        let params = pmd
            .accept(&offers("permessage-deflate; server_max_window_bits=10, permessage-deflate"))
            .unwrap();
        assert_eq!(
            params,
            DeflateParams {
                server_max_window_bits: Some(11),
                ..Default::default()
            }
        );
    }

    #[test]
    fn test_accept_as_server_no_acceptable_offer() {
        let cases = [
            (
                DeflateOptions::default().server_no_context_takeover(false),
                "permessage-deflate; server_no_context_takeover",
            ),
            (
                DeflateOptions::default().server_max_window_bits(WindowBits::Disabled),
                "permessage-deflate; server_max_window_bits=10",
            ),
            (
                DeflateOptions::default().server_max_window_bits(WindowBits::Bits(11)),
                "permessage-deflate; server_max_window_bits=10",
            ),
            (
                DeflateOptions::default().client_max_window_bits(WindowBits::Bits(10)),
                "permessage-deflate",
            ),
        ];
        for (options, header) in cases {
            let pmd = PerMessageDeflate::new(options, Role::Server, 0);
            assert_eq!(
                negotiation_message(pmd.accept(&offers(header))),
                "None of the extension offers can be accepted",
                "{header}"
            );
        }
    }

    #[test]
    fn test_accept_as_client() {
        let pmd = PerMessageDeflate::new(DeflateOptions::default(), Role::Client, 0);
        assert_eq!(pmd.accept(&[Params::new()]).unwrap(), DeflateParams::default());
        assert_eq!(
            pmd.accept(&offers(ALL_PARAMS)).unwrap(),
            DeflateParams {
                server_no_context_takeover: true,
                client_no_context_takeover: true,
                server_max_window_bits: Some(10),
                client_max_window_bits: Some(11),
            }
        );

        let pmd = PerMessageDeflate::new(
            DeflateOptions::default().client_max_window_bits(WindowBits::Bits(10)),
            Role::Client,
            0,
        );
        assert_eq!(pmd.accept(&[Params::new()]).unwrap().client_max_window_bits, Some(10));
    }

    #[test]
    fn test_accept_as_client_rejections() {
        let pmd = PerMessageDeflate::new(
            DeflateOptions::default().client_no_context_takeover(false),
            Role::Client,
            0,
        );
        assert_eq!(
            negotiation_message(pmd.accept(&offers("permessage-deflate; client_no_context_takeover"))),
            "Unexpected parameter \"client_no_context_takeover\""
        );

        let pmd = PerMessageDeflate::new(
            DeflateOptions::default().client_max_window_bits(WindowBits::Disabled),
            Role::Client,
            0,
        );
        assert_eq!(
            negotiation_message(pmd.accept(&offers("permessage-deflate; client_max_window_bits=10"))),
            "Unexpected or invalid parameter \"client_max_window_bits\""
        );

        let pmd = PerMessageDeflate::new(
            DeflateOptions::default().client_max_window_bits(WindowBits::Bits(10)),
            Role::Client,
            0,
        );
        assert_eq!(
            negotiation_message(pmd.accept(&offers("permessage-deflate; client_max_window_bits=11"))),
            "Unexpected or invalid parameter \"client_max_window_bits\""
        );
    }

    fn negotiated(options: DeflateOptions, role: Role, header: &str, max_payload: usize) -> PerMessageDeflate {
        let pmd = PerMessageDeflate::new(options, role, max_payload);
        pmd.accept(&offers(header)).unwrap();
        pmd
    }

    #[tokio::test]
    async fn test_unfragmented_round_trip() {
        let pmd = negotiated(DeflateOptions::default(), Role::Client, "permessage-deflate", 0);
        let compressed = pmd.compress(Bytes::from_static(&[1, 2, 3]), true).await.unwrap();
        let data = pmd.decompress(compressed, true).await.unwrap();
        assert_eq!(&data[..], &[1, 2, 3]);
    }

    #[tokio::test]
    async fn test_fragmented_round_trip() {
        let pmd = negotiated(DeflateOptions::default(), Role::Client, "permessage-deflate", 0);
        let c1 = pmd.compress(Bytes::from_static(&[1, 2]), false).await.unwrap();
        let c2 = pmd.compress(Bytes::from_static(&[3, 4]), true).await.unwrap();
        // non-final fragments keep their sync flush marker
        assert!(c1.ends_with(&DEFLATE_TRAILER));
        assert!(!c2.ends_with(&DEFLATE_TRAILER));

        let d1 = pmd.decompress(c1, false).await.unwrap();
        let d2 = pmd.decompress(c2, true).await.unwrap();
        assert_eq!([&d1[..], &d2[..]].concat(), vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_negotiated_parameters_round_trip() {
        let pmd = negotiated(DeflateOptions::default().level(9), Role::Client, ALL_PARAMS, 0);
        let buf = Bytes::from_static(b"Some compressible data, it's compressible.");
        let compressed = pmd.compress(buf.clone(), true).await.unwrap();
        assert_eq!(pmd.decompress(compressed, true).await.unwrap(), buf);
    }

    #[tokio::test]
    async fn test_level_option() {
        let buf = Bytes::from_static(b"Some compressible data, it's compressible.");
        let lev0 = negotiated(DeflateOptions::default().level(0), Role::Client, ALL_PARAMS, 0);
        let lev9 = negotiated(DeflateOptions::default().level(9), Role::Client, ALL_PARAMS, 0);

        let c0 = lev0.compress(buf.clone(), true).await.unwrap();
        let c9 = lev9.compress(buf.clone(), true).await.unwrap();
        assert!(c0.len() > buf.len());
        assert!(c9.len() < buf.len());
        assert_eq!(lev0.decompress(c0, true).await.unwrap(), buf);
        assert_eq!(lev9.decompress(c9, true).await.unwrap(), buf);
    }

    #[tokio::test]
    async fn test_no_context_takeover() {
        let pmd = negotiated(
            DeflateOptions::default(),
            Role::Server,
            "permessage-deflate;server_no_context_takeover",
            0,
        );
        let buf = Bytes::from_static(b"foofoo");
        let c1 = pmd.compress(buf.clone(), true).await.unwrap();
        let c2 = pmd.compress(buf.clone(), true).await.unwrap();
        assert_eq!(c1.len(), c2.len());
    }

    #[tokio::test]
    async fn test_context_takeover() {
        let pmd = negotiated(DeflateOptions::default(), Role::Server, "permessage-deflate", 0);
        let buf = Bytes::from_static(b"foofoo");
        let c1 = pmd.compress(buf.clone(), true).await.unwrap();
        let c2 = pmd.compress(buf.clone(), true).await.unwrap();
        assert!(c2.len() < c1.len());
    }

    #[tokio::test]
    async fn test_inflate_error() {
        let pmd = negotiated(DeflateOptions::default(), Role::Client, "permessage-deflate", 0);
        let err = pmd
            .decompress(Bytes::from_static(b"something invalid"), true)
            .await
            .unwrap_err();
        match err {
            Error::Zlib { code, .. } => {
                assert_eq!(code, -3);
                assert_eq!(zlib_code_name(code), "Z_DATA_ERROR");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(Error::Zlib { code: -3, message: String::new() }.close_code(), 1007);
    }

    #[tokio::test]
    async fn test_max_payload_exceeded() {
        for size in [50, 1024 * 1024] {
            let pmd = negotiated(DeflateOptions::default(), Role::Client, "permessage-deflate", 25);
            let compressed = pmd.compress(Bytes::from(vec![b'A'; size]), true).await.unwrap();
            let err = pmd.decompress(compressed, true).await.unwrap_err();
            assert!(matches!(err, Error::MaxPayloadExceeded), "{size}");
            assert_eq!(err.to_string(), "Max payload size exceeded");
        }
    }

    #[tokio::test]
    async fn test_max_payload_boundary() {
        let pmd = negotiated(DeflateOptions::default(), Role::Client, "permessage-deflate", 100);
        let compressed = pmd.compress(Bytes::from(vec![b'A'; 100]), true).await.unwrap();
        assert_eq!(pmd.decompress(compressed, true).await.unwrap().len(), 100);

        let compressed = pmd.compress(Bytes::from(vec![b'A'; 101]), true).await.unwrap();
        assert!(matches!(
            pmd.decompress(compressed, true).await,
            Err(Error::MaxPayloadExceeded)
        ));
    }

    #[tokio::test]
    async fn test_max_payload_spans_fragments() {
        let pmd = negotiated(DeflateOptions::default(), Role::Client, "permessage-deflate", 100);
        let c1 = pmd.compress(Bytes::from(vec![b'A'; 60]), false).await.unwrap();
        let c2 = pmd.compress(Bytes::from(vec![b'B'; 60]), true).await.unwrap();

        assert_eq!(pmd.decompress(c1, false).await.unwrap().len(), 60);
        assert!(matches!(
            pmd.decompress(c2, true).await,
            Err(Error::MaxPayloadExceeded)
        ));
    }

    #[tokio::test]
    async fn test_max_payload_total_resets_per_message() {
        let sender = negotiated(DeflateOptions::default(), Role::Server, "permessage-deflate", 0);
        let pmd = negotiated(DeflateOptions::default(), Role::Client, "permessage-deflate", 100);

        for _ in 0..3 {
            let c1 = sender.compress(Bytes::from(vec![b'A'; 50]), false).await.unwrap();
            let c2 = sender.compress(Bytes::from(vec![b'B'; 50]), true).await.unwrap();
            let d1 = pmd.decompress(c1, false).await.unwrap();
            let d2 = pmd.decompress(c2, true).await.unwrap();
            assert_eq!(d1.len() + d2.len(), 100);
        }
    }

    #[tokio::test]
    async fn test_cleanup_fails_pending_jobs() {
        let pmd = negotiated(DeflateOptions::default(), Role::Client, "permessage-deflate", 0);
        let running = pmd.compress(Bytes::from(vec![b'A'; 50]), true);
        let queued = pmd.decompress(Bytes::from_static(&[0x00]), true);

        pmd.cleanup();
        assert_eq!(
            running.await.unwrap_err().to_string(),
            "The deflate stream was closed while data was being processed"
        );
        assert_eq!(
            queued.await.unwrap_err().to_string(),
            "The inflate stream was closed while data was being processed"
        );
    }

    #[tokio::test]
    async fn test_recreates_inflate_stream_after_end() {
        let pmd = negotiated(
            DeflateOptions::default(),
            Role::Client,
            "permessage-deflate; client_no_context_takeover; server_no_context_takeover",
            0,
        );
        // a complete deflate stream with the final block bit set
        let buf = Bytes::from_static(&[0x33, 0x34, 0x32, 0x36, 0x31, 0x35, 0x33, 0xb7, 0x00, 0x00, 0x00]);
        assert_eq!(&pmd.decompress(buf.clone(), true).await.unwrap()[..], b"12345678");
        assert_eq!(&pmd.decompress(buf, true).await.unwrap()[..], b"12345678");
    }

    #[tokio::test]
    async fn test_jobs_run_in_submission_order() {
        let pmd = negotiated(DeflateOptions::default(), Role::Client, "permessage-deflate", 0);
        let large = Bytes::from(vec![b'x'; BLOCKING_THRESHOLD * 2]);

        // the second future is polled first; the limiter still runs it second
        let first = pmd.compress(large.clone(), true);
        let second = pmd.compress(Bytes::from_static(b"tail"), true);
        let second = tokio::spawn(second);
        let c1 = first.await.unwrap();
        let c2 = second.await.unwrap().unwrap();

        assert_eq!(pmd.decompress(c1, true).await.unwrap(), large);
        assert_eq!(&pmd.decompress(c2, true).await.unwrap()[..], b"tail");
    }

    #[tokio::test]
    async fn test_compress_before_accept() {
        let pmd = PerMessageDeflate::new(DeflateOptions::default(), Role::Client, 0);
        let err = pmd.compress(Bytes::from_static(b"x"), true).await.unwrap_err();
        assert!(matches!(err, Error::Negotiation(_)));
    }
}
