//! Write batching (corking)
//!
//! Encoded frames accumulate in a [`CorkBuffer`] until the sender flushes
//! them with one vectored write. Small writes are copied into a contiguous
//! tail buffer; large payloads are queued as separate segments without a
//! copy. Segments are always emitted in the order they were written.

use std::collections::VecDeque;
use std::io::IoSlice;

use bytes::{Buf, Bytes, BytesMut};

use crate::CORK_BUFFER_SIZE;

/// Payloads up to this size are copied into the tail buffer
const COPY_THRESHOLD: usize = 1024;

/// Cork buffer state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorkState {
    /// Writes are flushed as soon as a frame is complete
    Uncorked,
    /// Writes accumulate until `uncork`
    Corked,
}

/// Outbound byte queue for one connection
#[derive(Debug)]
pub struct CorkBuffer {
    /// Segments sealed before the tail
    segments: VecDeque<Bytes>,
    /// Total bytes in `segments`
    segment_bytes: usize,
    /// Contiguous tail for small writes
    buffer: BytesMut,
    /// Tail size that triggers sealing
    max_size: usize,
    state: CorkState,
}

impl CorkBuffer {
    /// Create a new cork buffer with default size
    pub fn new() -> Self {
        Self::with_capacity(CORK_BUFFER_SIZE)
    }

    /// Create a new cork buffer with specified capacity
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            segments: VecDeque::new(),
            segment_bytes: 0,
            buffer: BytesMut::with_capacity(capacity),
            max_size: capacity.max(1),
            state: CorkState::Uncorked,
        }
    }

    /// Enter corked state
    #[inline]
    pub fn cork(&mut self) {
        self.state = CorkState::Corked;
    }

    /// Exit corked state
    ///
    /// Returns true if there's data to flush.
    #[inline]
    pub fn uncork(&mut self) -> bool {
        self.state = CorkState::Uncorked;
        self.has_data()
    }

    #[inline]
    pub fn is_corked(&self) -> bool {
        self.state == CorkState::Corked
    }

    #[inline]
    pub fn has_data(&self) -> bool {
        !self.buffer.is_empty() || !self.segments.is_empty()
    }

    /// Get total pending bytes
    #[inline]
    pub fn pending_bytes(&self) -> usize {
        self.buffer.len() + self.segment_bytes
    }

    /// True once the tail has grown past the configured size
    #[inline]
    pub fn is_full(&self) -> bool {
        self.pending_bytes() >= self.max_size
    }

    /// Copy data into the tail
    #[inline]
    pub fn write(&mut self, data: &[u8]) {
        if self.buffer.len() + data.len() > self.max_size {
            self.seal();
        }
        self.buffer.extend_from_slice(data);
    }

    /// Queue bytes, copying only small payloads
    pub fn write_bytes(&mut self, data: Bytes) {
        if data.len() <= COPY_THRESHOLD {
            self.write(&data);
            return;
        }
        self.seal();
        self.segment_bytes += data.len();
        self.segments.push_back(data);
    }

    /// Tail buffer for encoding frames in place
    #[inline]
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }

    /// Move the tail into the segment queue
    fn seal(&mut self) {
        if !self.buffer.is_empty() {
            let tail = self.buffer.split().freeze();
            self.segment_bytes += tail.len();
            self.segments.push_back(tail);
        }
    }

    /// Pending data as `IoSlice`s, in write order
    pub fn get_write_slices(&self) -> Vec<IoSlice<'_>> {
        let mut slices = Vec::with_capacity(self.segments.len() + 1);
        slices.extend(self.segments.iter().map(|s| IoSlice::new(s)));
        if !self.buffer.is_empty() {
            slices.push(IoSlice::new(&self.buffer));
        }
        slices
    }

    /// Drop `n` bytes that have been written to the transport
    pub fn consume(&mut self, mut n: usize) {
        while n > 0 {
            let Some(front) = self.segments.front_mut() else {
                break;
            };
            if n < front.len() {
                front.advance(n);
                self.segment_bytes -= n;
                return;
            }
            n -= front.len();
            self.segment_bytes -= front.len();
            self.segments.pop_front();
        }

        let n = n.min(self.buffer.len());
        self.buffer.advance(n);
    }

    /// Clear all pending data
    pub fn clear(&mut self) {
        self.segments.clear();
        self.segment_bytes = 0;
        self.buffer.clear();
    }
}

impl Default for CorkBuffer {
    fn default() -> Self {
        Self::new()
    }
}
