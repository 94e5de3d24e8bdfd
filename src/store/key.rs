//! Keys: bounded immutable byte names with a precomputed hash, a desired
//! replication factor, a lazily recomputed per-cloud routing cache, and
//! replica-tracking bitfields.

use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::cloud::{idx_newer, Cloud};
use crate::node::{NodeAddr, NodeId};
use crate::utils::NimbusError;

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Hard cap on key length in bytes.
pub const MAX_KEY_LEN: usize = 512;

/// First byte below this marks a system key class.
pub const CLASS_USER_MIN: u8 = 32;
/// System class: one chunk of a large value split into arraylets.
pub const CLASS_ARRAYLET: u8 = 0;
/// System class: a published temporary list of keys (for task launch).
pub const CLASS_KEY_OF_KEYS: u8 = 1;

/// Default desired replication factor for user keys.
pub const DEFAULT_DESIRED: u8 = 2;

/// "Many replicas" degenerate state of a replica bitfield: more than 8
/// nodes hold a copy, stop tracking which.
const BITS_MANY: u64 = u64::MAX;

/// Routing facts for a key under one specific cloud.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloudInfo {
    /// Index into the cloud's sorted member array of replica 0's owner.
    pub home: usize,
    /// Which replica slot this process occupies, if any.
    pub replica: Option<u8>,
    pub desired: u8,
}

#[derive(Debug)]
pub struct Key {
    bytes: Bytes,
    hash: u64,
    desired: u8,

    /// Packed per-cloud cache: cloud idx (8b) | home (16b) | replica slot
    /// of this node, 0xFF for none (8b) | desired (8b). Recomputed when
    /// observed against a newer cloud; never regresses to an older one.
    cache: AtomicU64,

    /// Node ids known (from acks) to hold this value on disk / in memory.
    /// Up to 8 one-byte slots each holding id+1; all-ones means "many".
    disk_bits: AtomicU64,
    mem_bits: AtomicU64,
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.bytes == other.bytes
    }
}
impl Eq for Key {}

impl Hash for Key {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.bytes.hash(state);
    }
}

/// Jenkins one-at-a-time, widened to 64 bits.
fn jhash(bytes: &[u8]) -> u64 {
    let mut h: u64 = 0;
    for &b in bytes {
        h = h.wrapping_add(b as u64);
        h = h.wrapping_add(h << 10);
        h ^= h >> 6;
    }
    h = h.wrapping_add(h << 3);
    h ^= h >> 11;
    h.wrapping_add(h << 15)
}

impl Key {
    /// Internal constructor: length checks only. Used for system keys and
    /// on the decode path, where the class byte is whatever the sender
    /// put there.
    pub(crate) fn raw(bytes: Bytes, desired: u8) -> Result<Key, NimbusError> {
        if bytes.is_empty() || bytes.len() > MAX_KEY_LEN {
            return Err(NimbusError(format!(
                "key length {} outside 1..={}",
                bytes.len(),
                MAX_KEY_LEN
            )));
        }
        let hash = jhash(&bytes);
        Ok(Key {
            bytes,
            hash,
            desired: desired.max(1),
            cache: AtomicU64::new(0),
            disk_bits: AtomicU64::new(0),
            mem_bits: AtomicU64::new(0),
        })
    }

    /// Makes a user key; the first byte must be outside the reserved
    /// system range.
    pub fn user(bytes: Bytes, desired: u8) -> Result<Key, NimbusError> {
        if bytes.first().is_some_and(|b| *b < CLASS_USER_MIN) {
            return Err(NimbusError(format!(
                "first byte {} is reserved for system keys",
                bytes[0]
            )));
        }
        Self::raw(bytes, desired)
    }

    /// Makes a key-of-keys system key pinned to an explicit home list.
    pub fn key_of_keys(
        pinned: &[NodeAddr],
        name: &[u8],
        desired: u8,
    ) -> Result<Key, NimbusError> {
        if pinned.len() > u8::MAX as usize {
            return Err(NimbusError::msg("too many pinned homes"));
        }
        let mut buf = BytesMut::with_capacity(
            2 + pinned.len() * NodeAddr::WIRE_LEN + name.len(),
        );
        buf.put_u8(CLASS_KEY_OF_KEYS);
        buf.put_u8(pinned.len() as u8);
        for p in pinned {
            p.encode(&mut buf);
        }
        buf.put_slice(name);
        Self::raw(buf.freeze(), desired)
    }

    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    pub fn hash(&self) -> u64 {
        self.hash
    }

    pub fn desired(&self) -> u8 {
        self.desired
    }

    pub fn class(&self) -> u8 {
        self.bytes[0]
    }

    pub fn is_system(&self) -> bool {
        self.class() < CLASS_USER_MIN
    }

    /// The explicit home list embedded in pinned system keys; empty for
    /// everything else.
    pub fn pinned(&self) -> Vec<NodeAddr> {
        if self.class() != CLASS_KEY_OF_KEYS || self.bytes.len() < 2 {
            return Vec::new();
        }
        let n = self.bytes[1] as usize;
        if self.bytes.len() < 2 + n * NodeAddr::WIRE_LEN {
            return Vec::new();
        }
        let mut body = self.bytes.slice(2..2 + n * NodeAddr::WIRE_LEN);
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            match NodeAddr::decode(&mut body) {
                Ok(a) => out.push(a),
                Err(_) => return Vec::new(),
            }
        }
        out
    }

    /// Routing facts under the given cloud, recomputing (and caching) if
    /// the cache was built against a different cloud. The cache only ever
    /// moves forward: observing an *older* cloud computes fresh facts for
    /// it but leaves the newer cache in place.
    pub fn cloud_info(
        &self,
        cloud: &Cloud,
        my_addr: &NodeAddr,
    ) -> Option<CloudInfo> {
        if cloud.members.is_empty() {
            return None;
        }
        loop {
            let cur = self.cache.load(Ordering::SeqCst);
            let cached_idx = (cur & 0xFF) as u8;
            if cached_idx == cloud.idx {
                return Some(unpack_info(cur));
            }
            let fresh = self.compute_info(cloud, my_addr)?;
            if cached_idx != 0 && !idx_newer(cloud.idx, cached_idx) {
                return Some(fresh);
            }
            let packed = pack_info(cloud.idx, &fresh);
            if self
                .cache
                .compare_exchange(
                    cur,
                    packed,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_ok()
            {
                return Some(fresh);
            }
        }
    }

    fn compute_info(
        &self,
        cloud: &Cloud,
        my_addr: &NodeAddr,
    ) -> Option<CloudInfo> {
        // pinned home list first; fall back to the hash distribution when
        // every pinned node has left the cluster
        let home = self
            .pinned()
            .iter()
            .find_map(|a| cloud.position(a))
            .or_else(|| cloud.home_index(self.hash, 0))?;
        let replica = cloud.position(my_addr).and_then(|mypos| {
            (0..self.desired as usize).find(|r| {
                cloud.home_index(self.hash, *r) == Some(mypos)
            })
        });
        Some(CloudInfo {
            home,
            replica: replica.map(|r| r as u8),
            desired: self.desired,
        })
    }

    pub fn note_mem_replica(&self, id: NodeId) {
        bits_insert(&self.mem_bits, id);
    }

    pub fn note_disk_replica(&self, id: NodeId) {
        bits_insert(&self.disk_bits, id);
    }

    pub fn has_mem_replica(&self, id: NodeId) -> bool {
        bits_contains(&self.mem_bits, id)
    }

    pub fn has_disk_replica(&self, id: NodeId) -> bool {
        bits_contains(&self.disk_bits, id)
    }

    /// Known in-memory replica count, or `None` once in the "many" state.
    pub fn mem_replica_count(&self) -> Option<usize> {
        bits_count(&self.mem_bits)
    }

    /// A fresh write invalidates everything we knew about other copies.
    pub fn clear_replicas(&self) {
        self.disk_bits.store(0, Ordering::SeqCst);
        self.mem_bits.store(0, Ordering::SeqCst);
    }

    /// Wire form: desired factor, 2-byte length, then the name bytes.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.desired);
        buf.put_u16_le(self.bytes.len() as u16);
        buf.put_slice(&self.bytes);
    }

    pub fn decode(buf: &mut Bytes) -> Result<Key, NimbusError> {
        if buf.len() < 3 {
            return Err(NimbusError::msg("key record too short"));
        }
        let desired = buf.get_u8();
        let len = buf.get_u16_le() as usize;
        if len > buf.len() {
            return Err(NimbusError(format!(
                "key record truncated: {} of {}B",
                buf.len(),
                len
            )));
        }
        let bytes = buf.split_to(len);
        Self::raw(bytes, desired)
    }
}

fn pack_info(idx: u8, info: &CloudInfo) -> u64 {
    (idx as u64)
        | ((info.home as u64 & 0xFFFF) << 8)
        | ((info.replica.map_or(0xFF, |r| r as u64)) << 24)
        | ((info.desired as u64) << 32)
}

fn unpack_info(packed: u64) -> CloudInfo {
    let replica = ((packed >> 24) & 0xFF) as u8;
    CloudInfo {
        home: ((packed >> 8) & 0xFFFF) as usize,
        replica: (replica != 0xFF).then_some(replica),
        desired: ((packed >> 32) & 0xFF) as u8,
    }
}

fn bits_insert(bits: &AtomicU64, id: NodeId) {
    let slot_val = id as u64 + 1;
    loop {
        let cur = bits.load(Ordering::SeqCst);
        if cur == BITS_MANY {
            return;
        }
        let mut next = None;
        for s in 0..8 {
            let b = (cur >> (s * 8)) & 0xFF;
            if b == slot_val {
                return;
            }
            if b == 0 {
                next = Some(cur | (slot_val << (s * 8)));
                break;
            }
        }
        // no free slot left: collapse to "many replicas"
        let next = next.unwrap_or(BITS_MANY);
        if bits
            .compare_exchange(cur, next, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            return;
        }
    }
}

fn bits_contains(bits: &AtomicU64, id: NodeId) -> bool {
    let cur = bits.load(Ordering::SeqCst);
    if cur == BITS_MANY {
        return true;
    }
    let slot_val = id as u64 + 1;
    (0..8).any(|s| (cur >> (s * 8)) & 0xFF == slot_val)
}

fn bits_count(bits: &AtomicU64) -> Option<usize> {
    let cur = bits.load(Ordering::SeqCst);
    if cur == BITS_MANY {
        return None;
    }
    Some((0..8).filter(|s| (cur >> (s * 8)) & 0xFF != 0).count())
}
