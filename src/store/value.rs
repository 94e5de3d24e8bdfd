//! Values: effectively immutable byte buffers with persist state, a weak
//! clock stamp, and last-access tracking.
//!
//! The in-memory buffer may hold a true prefix of the logical value
//! (e.g. after a partial load). It is only ever replaced by an
//! equal-or-longer buffer; eviction may drop it entirely once the bytes
//! are safe on a persistence backend.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Mutex, PoisonError};

use crate::node::now_ms;
use crate::store::clock::WeakClock;
use crate::utils::NimbusError;

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Plain value holding its own bytes.
pub const TAG_DATA: u8 = b'V';
/// Head of a large value split into arraylet chunks.
pub const TAG_ARRAYLET: u8 = b'A';
/// Deletion marker.
pub const TAG_TOMBSTONE: u8 = 0;

/// Persist state byte: low 3 bits name the backend.
pub const BACKEND_MASK: u8 = 0x07;
/// Bytes are safely on the backend.
pub const ON_DISK: u8 = 0x08;
/// Goal is deletion rather than storage.
pub const GOAL_DELETE: u8 = 0x10;

/// Length-monotonic buffer cell: grows or clears, never shrinks in place.
#[derive(Debug, Default)]
struct GrowBuf(Mutex<Option<Bytes>>);

impl GrowBuf {
    fn get(&self) -> Option<Bytes> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Installs a buffer iff it is at least as long as the current one.
    fn grow_to(&self, buf: Bytes) -> bool {
        let mut cur = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        match cur.as_ref() {
            Some(old) if buf.len() < old.len() => false,
            _ => {
                *cur = Some(buf);
                true
            }
        }
    }

    /// Drops the buffer, returning the bytes freed.
    fn clear(&self) -> usize {
        let mut cur = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        cur.take().map_or(0, |b| b.len())
    }
}

#[derive(Debug)]
pub struct Value {
    tag: u8,
    /// Maximum logical length; for arraylet heads, the total length
    /// across all chunks.
    max_len: u64,
    pub clock: WeakClock,
    persist: AtomicU8,
    mem: GrowBuf,
    last_accessed: AtomicU64,
}

impl Value {
    pub fn new(bytes: Bytes, clock: WeakClock) -> Value {
        let v = Value {
            tag: TAG_DATA,
            max_len: bytes.len() as u64,
            clock,
            persist: AtomicU8::new(0),
            mem: GrowBuf::default(),
            last_accessed: AtomicU64::new(now_ms()),
        };
        v.mem.grow_to(bytes);
        v
    }

    /// An arraylet head: carries only the total length, the bytes live in
    /// the chunk keys.
    pub fn arraylet(total_len: u64, clock: WeakClock) -> Value {
        Value {
            tag: TAG_ARRAYLET,
            max_len: total_len,
            clock,
            persist: AtomicU8::new(0),
            mem: GrowBuf::default(),
            last_accessed: AtomicU64::new(now_ms()),
        }
    }

    pub fn tombstone(clock: WeakClock) -> Value {
        Value {
            tag: TAG_TOMBSTONE,
            max_len: 0,
            clock,
            persist: AtomicU8::new(GOAL_DELETE),
            mem: GrowBuf::default(),
            last_accessed: AtomicU64::new(now_ms()),
        }
    }

    pub fn tag(&self) -> u8 {
        self.tag
    }

    pub fn is_tombstone(&self) -> bool {
        self.tag == TAG_TOMBSTONE
    }

    pub fn is_arraylet(&self) -> bool {
        self.tag == TAG_ARRAYLET
    }

    pub fn max_len(&self) -> u64 {
        self.max_len
    }

    /// Current in-memory bytes, refreshing the access timestamp.
    pub fn mem(&self) -> Option<Bytes> {
        self.touch();
        self.mem.get()
    }

    /// Current in-memory bytes without counting as an access (sweeper
    /// inspection).
    pub fn peek_mem(&self) -> Option<Bytes> {
        self.mem.get()
    }

    /// Extends the cached buffer; rejected if it would shorten it.
    pub fn grow_mem(&self, bytes: Bytes) -> bool {
        self.touch();
        self.mem.grow_to(bytes)
    }

    /// Frees the in-memory buffer if the bytes are safe on a backend.
    /// Returns the number of bytes freed.
    pub fn evict_mem(&self) -> usize {
        if !self.is_on_disk() {
            return 0;
        }
        self.mem.clear()
    }

    pub fn touch(&self) {
        self.last_accessed.store(now_ms(), Ordering::Relaxed);
    }

    pub fn idle_ms(&self) -> u64 {
        now_ms().saturating_sub(self.last_accessed.load(Ordering::Relaxed))
    }

    pub fn backend(&self) -> u8 {
        self.persist.load(Ordering::SeqCst) & BACKEND_MASK
    }

    pub fn is_on_disk(&self) -> bool {
        self.persist.load(Ordering::SeqCst) & ON_DISK != 0
    }

    pub fn set_on_disk(&self, backend: u8) {
        let p = (backend & BACKEND_MASK) | ON_DISK;
        self.persist.store(p, Ordering::SeqCst);
    }

    pub fn goal_delete(&self) -> bool {
        self.persist.load(Ordering::SeqCst) & GOAL_DELETE != 0
    }

    /// True when two values are the same logical write (identical stamp
    /// and identical bytes): a racing duplicate, not a conflict.
    pub fn same_write(&self, other: &Value) -> bool {
        self.clock == other.clock
            && self.tag == other.tag
            && self.max_len == other.max_len
            && self.peek_mem() == other.peek_mem()
    }

    /// Wire form: tag, persist byte, clock, logical length, then the
    /// resident bytes length-prefixed.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.tag);
        buf.put_u8(self.persist.load(Ordering::SeqCst));
        buf.put_u64_le(self.clock.raw());
        buf.put_u64_le(self.max_len);
        match self.peek_mem() {
            Some(b) => {
                buf.put_u32_le(b.len() as u32);
                buf.put_slice(&b);
            }
            None => buf.put_u32_le(0),
        }
    }

    pub fn decode(buf: &mut Bytes) -> Result<Value, NimbusError> {
        if buf.len() < 22 {
            return Err(NimbusError(format!(
                "value record too short: {}B",
                buf.len()
            )));
        }
        let tag = buf.get_u8();
        let persist = buf.get_u8();
        let clock = WeakClock::from_raw(buf.get_u64_le());
        let max_len = buf.get_u64_le();
        let mem_len = buf.get_u32_le() as usize;
        if mem_len > buf.len() {
            return Err(NimbusError(format!(
                "value record truncated: {} of {}B",
                buf.len(),
                mem_len
            )));
        }
        let v = Value {
            tag,
            max_len,
            clock,
            // on-disk state is local, not a property of the bytes
            persist: AtomicU8::new(persist & GOAL_DELETE),
            mem: GrowBuf::default(),
            last_accessed: AtomicU64::new(now_ms()),
        };
        if mem_len > 0 {
            v.mem.grow_to(buf.split_to(mem_len));
        }
        Ok(v)
    }
}

#[cfg(test)]
mod value_tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn clk(c: u32) -> WeakClock {
        WeakClock::new(Ipv4Addr::new(10, 0, 0, 1), c)
    }

    #[test]
    fn buffer_is_length_monotonic() {
        let v = Value::new(Bytes::from_static(b"abc"), clk(1));
        assert!(v.grow_mem(Bytes::from_static(b"abcdef")));
        assert_eq!(v.mem().unwrap(), Bytes::from_static(b"abcdef"));
        // shorter buffer is refused, even though it is a valid prefix
        assert!(!v.grow_mem(Bytes::from_static(b"ab")));
        assert_eq!(v.mem().unwrap().len(), 6);
    }

    #[test]
    fn eviction_requires_persistence() {
        let v = Value::new(Bytes::from_static(b"payload"), clk(1));
        assert_eq!(v.evict_mem(), 0);
        v.set_on_disk(1);
        assert_eq!(v.evict_mem(), 7);
        assert!(v.peek_mem().is_none());
        assert!(v.is_on_disk());
    }

    #[test]
    fn tombstone_shape() {
        let t = Value::tombstone(clk(9));
        assert!(t.is_tombstone());
        assert!(t.goal_delete());
        assert_eq!(t.max_len(), 0);
    }

    #[test]
    fn codec_preserves_write_identity() {
        let v = Value::new(Bytes::from_static(b"some bytes"), clk(5));
        let mut buf = BytesMut::new();
        v.encode(&mut buf);
        let d = Value::decode(&mut buf.freeze()).unwrap();
        assert!(d.same_write(&v));
        assert!(!d.is_on_disk());

        let t = Value::tombstone(clk(6));
        let mut buf = BytesMut::new();
        t.encode(&mut buf);
        let d = Value::decode(&mut buf.freeze()).unwrap();
        assert!(d.is_tombstone());
        assert!(d.goal_delete());
    }
}
