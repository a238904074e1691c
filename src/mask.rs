//! WebSocket frame masking utilities
//!
//! XOR masking plus [`MaskKeySource`], a pooled CSPRNG reader for the
//! 4-byte keys every client frame needs. Reading the OS generator once per
//! frame is measurable under load, so keys are cut from a refillable pool.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Result;

/// Size of the random pool refill
pub const MASK_POOL_SIZE: usize = 8 * 1024;

/// Refill threshold: the pool is refreshed once fewer bytes remain
pub const MASK_POOL_REFILL_THRESHOLD: usize = 1024;

/// Apply a WebSocket mask in place.
///
/// Used for both masking (outbound client frames) and unmasking (inbound
/// server frames).
#[inline]
pub fn apply_mask(data: &mut [u8], mask: [u8; 4]) {
    apply_mask_offset(data, mask, 0);
}

/// Apply a mask starting at `offset` bytes into the masked stream
#[inline]
pub fn apply_mask_offset(data: &mut [u8], mask: [u8; 4], offset: usize) {
    let rotated = [
        mask[offset & 3],
        mask[(offset + 1) & 3],
        mask[(offset + 2) & 3],
        mask[(offset + 3) & 3],
    ];
    let wide = u64::from_ne_bytes([
        rotated[0], rotated[1], rotated[2], rotated[3], rotated[0], rotated[1], rotated[2],
        rotated[3],
    ]);

    let mut chunks = data.chunks_exact_mut(8);
    for chunk in &mut chunks {
        let mut word = [0u8; 8];
        word.copy_from_slice(chunk);
        chunk.copy_from_slice(&(u64::from_ne_bytes(word) ^ wide).to_ne_bytes());
    }
    for (i, byte) in chunks.into_remainder().iter_mut().enumerate() {
        *byte ^= rotated[i & 3];
    }
}

#[derive(Debug)]
struct Pool {
    buf: Box<[u8]>,
    offset: usize,
}

impl Pool {
    fn refill(&mut self) -> Result<()> {
        getrandom::getrandom(&mut self.buf)?;
        self.offset = 0;
        Ok(())
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.offset
    }
}

/// Pooled source of masking keys.
///
/// Cloning shares the pool, so one source can serve every connection of a
/// client. The pool is refilled in [`MASK_POOL_SIZE`] blocks once fewer than
/// [`MASK_POOL_REFILL_THRESHOLD`] bytes remain; if a refill fails while a
/// few bytes remain the key is read straight from the OS instead.
#[derive(Debug, Clone)]
pub struct MaskKeySource {
    pool: Arc<Mutex<Pool>>,
}

impl MaskKeySource {
    pub fn new() -> Self {
        Self::with_pool_size(MASK_POOL_SIZE)
    }

    pub fn with_pool_size(size: usize) -> Self {
        let size = size.max(4);
        Self {
            pool: Arc::new(Mutex::new(Pool {
                buf: vec![0u8; size].into_boxed_slice(),
                // start exhausted so the first key triggers a refill
                offset: size,
            })),
        }
    }

    /// Draw a fresh 4-byte masking key
    pub fn next_key(&self) -> Result<[u8; 4]> {
        let mut pool = self.pool.lock();

        let threshold = MASK_POOL_REFILL_THRESHOLD.min(pool.buf.len() / 2);
        if pool.remaining() < threshold.max(4) && pool.refill().is_err() && pool.remaining() < 4 {
            drop(pool);
            return Self::direct_key();
        }

        let start = pool.offset;
        let mut key = [0u8; 4];
        key.copy_from_slice(&pool.buf[start..start + 4]);
        pool.offset += 4;
        Ok(key)
    }

    fn direct_key() -> Result<[u8; 4]> {
        let mut key = [0u8; 4];
        getrandom::getrandom(&mut key)?;
        Ok(key)
    }
}

impl Default for MaskKeySource {
    fn default() -> Self {
        Self::new()
    }
}
