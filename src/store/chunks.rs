//! Arraylet chunking arithmetic and chunk-key construction.
//!
//! A value longer than two chunk units is split: chunks 0..n-1 cover one
//! unit each, and the final chunk absorbs the remainder, so it is always
//! at least one and strictly less than two units long.

use crate::store::key::{Key, CLASS_ARRAYLET};
use crate::utils::NimbusError;

use bytes::{BufMut, Bytes, BytesMut};

/// Chunk unit size.
pub const CHUNK_UNIT: u64 = 1 << 20;

/// Whether a value of this length is stored whole or as arraylets.
pub fn needs_chunking(total: u64) -> bool {
    total > 2 * CHUNK_UNIT
}

/// Number of chunks covering a chunked value.
pub fn chunk_count(total: u64) -> u64 {
    debug_assert!(needs_chunking(total));
    total / CHUNK_UNIT
}

/// Byte range `[off, off + len)` of chunk `idx`.
pub fn chunk_range(total: u64, idx: u64) -> (u64, u64) {
    let n = chunk_count(total);
    debug_assert!(idx < n);
    let off = idx * CHUNK_UNIT;
    let len = if idx + 1 == n {
        total - off
    } else {
        CHUNK_UNIT
    };
    (off, len)
}

/// The system key addressing chunk `idx` of the value under `head`.
pub fn chunk_key(head: &Key, idx: u64) -> Result<Key, NimbusError> {
    let mut buf = BytesMut::with_capacity(9 + head.bytes().len());
    buf.put_u8(CLASS_ARRAYLET);
    buf.put_u64_le(idx);
    buf.put_slice(head.bytes());
    Key::raw(buf.freeze(), head.desired())
}

/// Slices chunk `idx` out of a whole in-memory buffer.
pub fn chunk_slice(whole: &Bytes, idx: u64) -> Bytes {
    let (off, len) = chunk_range(whole.len() as u64, idx);
    whole.slice(off as usize..(off + len) as usize)
}
