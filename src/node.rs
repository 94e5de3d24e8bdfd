//! Canonical node identity and the process-lifetime node registry.
//!
//! A `Node` is interned: one canonical `Arc<Node>` per (address, port) for
//! the lifetime of the process. Each carries a dense small-integer id,
//! issued monotonically and never reused, which indexes replica-tracking
//! bitfields. Nodes are never destroyed; they survive membership changes.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicU16, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::utils::NimbusError;
use crate::wire::HealthRecord;

use bytes::{Buf, BufMut, Bytes};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// Dense per-process node index. At most 256 distinct nodes may ever be
/// sighted by one process; replica bitfields pack these one byte each.
pub type NodeId = u8;

/// A cluster member's network identity: IPv4 address plus UDP port.
/// The TCP bulk-transfer channel listens on `port + 1`.
///
/// Ordering is numeric on (address, port); consensus leadership picks the
/// minimum.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
pub struct NodeAddr {
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl NodeAddr {
    /// Wire form: 4 address bytes followed by a little-endian port.
    pub const WIRE_LEN: usize = 6;

    pub fn new(ip: Ipv4Addr, port: u16) -> Self {
        NodeAddr { ip, port }
    }

    pub fn udp_socket(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.ip, self.port))
    }

    /// Address of this node's TCP bulk-transfer listener.
    pub fn tcp_socket(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.ip, self.port + 1))
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_slice(&self.ip.octets());
        buf.put_u16_le(self.port);
    }

    pub fn decode(buf: &mut Bytes) -> Result<Self, NimbusError> {
        if buf.len() < Self::WIRE_LEN {
            return Err(NimbusError(format!(
                "address record too short: {}B",
                buf.len()
            )));
        }
        let mut octets = [0u8; 4];
        buf.copy_to_slice(&mut octets);
        let port = buf.get_u16_le();
        Ok(NodeAddr {
            ip: Ipv4Addr::from(octets),
            port,
        })
    }
}

impl std::fmt::Display for NodeAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Current wall-clock time in milliseconds since the epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Canonical representation of a sighted cluster member.
#[derive(Debug)]
pub struct Node {
    pub addr: NodeAddr,
    pub id: NodeId,

    /// Millisecond timestamp of the last packet heard from this node.
    last_heard: AtomicU64,

    /// Cloud id this node announced in its latest heartbeat; 0 if none yet.
    announced_cloud: Mutex<u128>,

    /// Latest health record received from this node.
    health: Mutex<HealthRecord>,

    /// Weak-clock counter; only ever bumped on the SELF node.
    clock: AtomicU32,
}

impl Node {
    fn new(addr: NodeAddr, id: NodeId) -> Self {
        Node {
            addr,
            id,
            last_heard: AtomicU64::new(0),
            announced_cloud: Mutex::new(0),
            health: Mutex::new(HealthRecord::default()),
            clock: AtomicU32::new(0),
        }
    }

    /// Marks this node alive as of now.
    pub fn heard_from(&self) {
        self.last_heard.store(now_ms(), Ordering::Relaxed);
    }

    /// Milliseconds since the last packet from this node, saturating.
    pub fn millis_since_heard(&self) -> u64 {
        now_ms().saturating_sub(self.last_heard.load(Ordering::Relaxed))
    }

    pub fn set_announced_cloud(&self, cloud_id: u128) {
        *self
            .announced_cloud
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = cloud_id;
    }

    pub fn announced_cloud(&self) -> u128 {
        *self
            .announced_cloud
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_health(&self, rec: HealthRecord) {
        *self.health.lock().unwrap_or_else(PoisonError::into_inner) = rec;
    }

    pub fn health(&self) -> HealthRecord {
        self.health
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Issues the next weak-clock counter value. Only meaningful on the
    /// node representing this process.
    pub fn next_clock(&self) -> u32 {
        self.clock.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// Process-lifetime intern table for nodes. Lookup by address interns on
/// first sighting; ids are issued densely and never reused.
#[derive(Debug, Default)]
pub struct NodeRegistry {
    by_addr: DashMap<NodeAddr, Arc<Node>>,
    by_id: DashMap<NodeId, Arc<Node>>,
    next_id: AtomicU16,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the canonical `Node` for an address, creating and
    /// registering it on first sighting.
    pub fn intern(&self, addr: NodeAddr) -> Result<Arc<Node>, NimbusError> {
        if let Some(n) = self.by_addr.get(&addr) {
            return Ok(n.value().clone());
        }
        match self.by_addr.entry(addr) {
            Entry::Occupied(e) => Ok(e.get().clone()),
            Entry::Vacant(v) => {
                let id = self.next_id.fetch_add(1, Ordering::SeqCst);
                if id > NodeId::MAX as u16 {
                    return logged_err!(
                        "node id space exhausted at {}",
                        addr
                    );
                }
                let node = Arc::new(Node::new(addr, id as NodeId));
                self.by_id.insert(node.id, node.clone());
                v.insert(node.clone());
                Ok(node)
            }
        }
    }

    pub fn lookup_addr(&self, addr: &NodeAddr) -> Option<Arc<Node>> {
        self.by_addr.get(addr).map(|n| n.value().clone())
    }

    pub fn lookup_id(&self, id: NodeId) -> Option<Arc<Node>> {
        self.by_id.get(&id).map(|n| n.value().clone())
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

#[cfg(test)]
mod node_tests {
    use super::*;

    fn addr(last: u8, port: u16) -> NodeAddr {
        NodeAddr::new(Ipv4Addr::new(10, 0, 0, last), port)
    }

    #[test]
    fn addr_codec() -> Result<(), NimbusError> {
        let a = addr(7, 7001);
        let mut buf = bytes::BytesMut::new();
        a.encode(&mut buf);
        assert_eq!(buf.len(), NodeAddr::WIRE_LEN);
        let decoded = NodeAddr::decode(&mut buf.freeze())?;
        assert_eq!(decoded, a);
        Ok(())
    }

    #[test]
    fn addr_ordering() {
        assert!(addr(1, 9000) < addr(2, 7000));
        assert!(addr(1, 7000) < addr(1, 7002));
    }

    #[test]
    fn intern_is_canonical() -> Result<(), NimbusError> {
        let reg = NodeRegistry::new();
        let n1 = reg.intern(addr(1, 7001))?;
        let n2 = reg.intern(addr(1, 7001))?;
        assert!(Arc::ptr_eq(&n1, &n2));
        assert_eq!(reg.len(), 1);
        Ok(())
    }

    #[test]
    fn ids_dense_and_distinct() -> Result<(), NimbusError> {
        let reg = NodeRegistry::new();
        for i in 0..10u8 {
            let n = reg.intern(addr(i + 1, 7001))?;
            assert_eq!(n.id, i);
            assert!(Arc::ptr_eq(
                &reg.lookup_id(i).unwrap(),
                &reg.lookup_addr(&addr(i + 1, 7001)).unwrap()
            ));
        }
        Ok(())
    }

    #[test]
    fn clock_monotonic() -> Result<(), NimbusError> {
        let reg = NodeRegistry::new();
        let n = reg.intern(addr(1, 7001))?;
        let a = n.next_clock();
        let b = n.next_clock();
        assert!(b > a);
        Ok(())
    }
}
