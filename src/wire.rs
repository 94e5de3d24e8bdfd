//! Datagram frame layout, the opcode dispatch table, and codecs for the
//! fixed-layout payloads (health records and consensus ballots).
//!
//! Every datagram starts with `[opcode u8][sender port u16]`. Task-bearing
//! opcodes (reliable calls and their acknowledgements) follow with a 4-byte
//! task id; everything after that is opcode-specific payload. All integers
//! are little-endian on the wire.

use crate::node::NodeAddr;
use crate::utils::NimbusError;

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Path MTU after transport headers. A frame longer than this goes over the
/// TCP bulk channel instead of being fragmented across datagrams.
pub const MTU: usize = 1492;

/// Offset of the opcode byte.
pub const CTRL_OFF: usize = 0;
/// Offset of the sender's UDP port.
pub const PORT_OFF: usize = 1;
/// Offset of the task id in task-bearing frames.
pub const TASK_OFF: usize = 3;
/// Payload offset for stateless (non-task) frames.
pub const SDATA_OFF: usize = 3;
/// Payload offset for task-bearing frames.
pub const DATA_OFF: usize = 7;

/// Single acknowledgement byte written back by the receiver of a bulk
/// TCP transfer.
pub const BULK_ACK_BYTE: u8 = 99;

/// Control opcodes, dispatched off byte 0 of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// Periodic health/membership announcement.
    Heartbeat = 1,
    /// Fresh process start; peers drop stale per-sender dedup state.
    Rebooted = 2,
    /// Coordinated kill after a fatal membership reshape.
    Shutdown = 3,
    /// Consensus: leader proposes a round number.
    Proposal = 4,
    /// Consensus: acceptor promises a round number.
    Promise = 5,
    /// Consensus: acceptor rejects a stale round number.
    Nack = 6,
    /// Consensus: leader asks acceptors to accept a membership value.
    Accept = 7,
    /// Consensus: acceptor announces the accepted membership value.
    Accepted = 8,
    /// Answer to a reliable call (payload = cached answer bytes).
    Ack = 16,
    /// Sender acknowledges the answer; receiver may release dedup state.
    AckAck = 17,
    /// Fetch the value of a key from its home node.
    GetKey = 32,
    /// Install a value for a key (puts and tombstones alike).
    PutKey = 33,
    /// Offer a replica copy of a key/value to a peer.
    HazKey = 34,
    /// Ship an atomic read-modify-write update to the key's home.
    AtomicUpdate = 35,
    /// Ship a distributed task partition to a peer.
    ForkTask = 36,
}

impl Opcode {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Heartbeat),
            2 => Some(Self::Rebooted),
            3 => Some(Self::Shutdown),
            4 => Some(Self::Proposal),
            5 => Some(Self::Promise),
            6 => Some(Self::Nack),
            7 => Some(Self::Accept),
            8 => Some(Self::Accepted),
            16 => Some(Self::Ack),
            17 => Some(Self::AckAck),
            32 => Some(Self::GetKey),
            33 => Some(Self::PutKey),
            34 => Some(Self::HazKey),
            35 => Some(Self::AtomicUpdate),
            36 => Some(Self::ForkTask),
            _ => None,
        }
    }

    /// Whether frames of this opcode carry a 4-byte task id after the port.
    pub fn task_bearing(&self) -> bool {
        (*self as u8) >= (Self::Ack as u8)
    }

    /// Whether this opcode is a reliable-call request (as opposed to an
    /// acknowledgement or a stateless broadcast).
    pub fn is_request(&self) -> bool {
        (*self as u8) >= (Self::GetKey as u8)
    }
}

/// A decoded inbound frame, before sender interning.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub op: Opcode,
    /// UDP port the sender claims to be reachable at.
    pub port: u16,
    /// Task id; 0 for stateless opcodes.
    pub task: u32,
    pub body: Bytes,
}

/// Frames a stateless (broadcast-style) datagram.
pub fn stateless_frame(op: Opcode, my_port: u16, body: &[u8]) -> Bytes {
    debug_assert!(!op.task_bearing());
    let mut buf = BytesMut::with_capacity(SDATA_OFF + body.len());
    buf.put_u8(op as u8);
    buf.put_u16_le(my_port);
    buf.put_slice(body);
    buf.freeze()
}

/// Frames a task-bearing datagram.
pub fn task_frame(op: Opcode, my_port: u16, task: u32, body: &[u8]) -> Bytes {
    debug_assert!(op.task_bearing());
    let mut buf = BytesMut::with_capacity(DATA_OFF + body.len());
    buf.put_u8(op as u8);
    buf.put_u16_le(my_port);
    buf.put_u32_le(task);
    buf.put_slice(body);
    buf.freeze()
}

/// Parses an inbound datagram into a `RawFrame`. Malformed frames are
/// rejected here and dropped by the caller with a logged warning.
pub fn parse_frame(mut buf: Bytes) -> Result<RawFrame, NimbusError> {
    if buf.len() < SDATA_OFF {
        return Err(NimbusError(format!("frame too short: {}B", buf.len())));
    }
    let opb = buf.get_u8();
    let op = Opcode::from_u8(opb)
        .ok_or_else(|| NimbusError(format!("unknown opcode {}", opb)))?;
    let port = buf.get_u16_le();
    let task = if op.task_bearing() {
        if buf.len() < 4 {
            return Err(NimbusError(format!(
                "truncated task id in {:?} frame",
                op
            )));
        }
        buf.get_u32_le()
    } else {
        0
    };
    Ok(RawFrame {
        op,
        port,
        task,
        body: buf,
    })
}

/// Marker for statistics a node could not sample (fixed-point u16 fields).
pub const STAT_UNKNOWN: u16 = 0xFFFF;

/// Byte length of an encoded `HealthRecord`.
pub const HEALTH_WIRE_LEN: usize = 40;

/// Fixed-layout node health snapshot carried in every heartbeat.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HealthRecord {
    pub cpus: u16,
    /// Memory figures are KB-scaled and capped at 3 wire bytes.
    pub free_mem_kb: u32,
    pub tot_mem_kb: u32,
    pub max_mem_kb: u32,
    pub key_count: u32,
    pub cached_bytes: u32,
    /// Disk figures are MB-scaled.
    pub free_disk_mb: u32,
    pub max_disk_mb: u32,
    /// Fixed-point x1000; `STAT_UNKNOWN` when unsampled.
    pub cpu_util: u16,
    pub load_1: u16,
    pub load_5: u16,
    pub load_15: u16,
    pub threads: u16,
    pub queue_depth: u16,
    pub node_type: u8,
}

impl HealthRecord {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16_le(self.cpus);
        for mem in [self.free_mem_kb, self.tot_mem_kb, self.max_mem_kb] {
            buf.put_uint_le(mem.min(0xFF_FFFF) as u64, 3);
        }
        buf.put_u32_le(self.key_count);
        buf.put_u32_le(self.cached_bytes);
        buf.put_u32_le(self.free_disk_mb);
        buf.put_u32_le(self.max_disk_mb);
        for stat in [
            self.cpu_util,
            self.load_1,
            self.load_5,
            self.load_15,
            self.threads,
            self.queue_depth,
        ] {
            buf.put_u16_le(stat);
        }
        buf.put_u8(self.node_type);
    }

    pub fn decode(buf: &mut Bytes) -> Result<Self, NimbusError> {
        if buf.len() < HEALTH_WIRE_LEN {
            return Err(NimbusError(format!(
                "health record too short: {}B",
                buf.len()
            )));
        }
        Ok(HealthRecord {
            cpus: buf.get_u16_le(),
            free_mem_kb: buf.get_uint_le(3) as u32,
            tot_mem_kb: buf.get_uint_le(3) as u32,
            max_mem_kb: buf.get_uint_le(3) as u32,
            key_count: buf.get_u32_le(),
            cached_bytes: buf.get_u32_le(),
            free_disk_mb: buf.get_u32_le(),
            max_disk_mb: buf.get_u32_le(),
            cpu_util: buf.get_u16_le(),
            load_1: buf.get_u16_le(),
            load_5: buf.get_u16_le(),
            load_15: buf.get_u16_le(),
            threads: buf.get_u16_le(),
            queue_depth: buf.get_u16_le(),
            node_type: buf.get_u8(),
        })
    }
}

/// Encodes a heartbeat payload: 16-byte cloud id followed by the health
/// record.
pub fn encode_heartbeat(cloud_id: u128, health: &HealthRecord) -> Bytes {
    let mut buf = BytesMut::with_capacity(16 + HEALTH_WIRE_LEN);
    buf.put_u128_le(cloud_id);
    health.encode(&mut buf);
    buf.freeze()
}

/// Decodes a heartbeat payload into (announced cloud id, health record).
pub fn decode_heartbeat(
    mut body: Bytes,
) -> Result<(u128, HealthRecord), NimbusError> {
    if body.len() < 16 + HEALTH_WIRE_LEN {
        return Err(NimbusError(format!(
            "heartbeat payload too short: {}B",
            body.len()
        )));
    }
    let cloud_id = body.get_u128_le();
    let health = HealthRecord::decode(&mut body)?;
    Ok((cloud_id, health))
}

/// Shared payload of all consensus packets: the promised and previously
/// accepted proposal numbers, the round's cloud UUID, and the proposed
/// member list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsensusMsg {
    pub promised: u64,
    pub accepted: u64,
    pub cloud_id: u128,
    pub members: Vec<NodeAddr>,
}

impl ConsensusMsg {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(
            8 + 8 + 16 + 2 + self.members.len() * NodeAddr::WIRE_LEN,
        );
        buf.put_u64_le(self.promised);
        buf.put_u64_le(self.accepted);
        buf.put_u128_le(self.cloud_id);
        buf.put_u16_le(self.members.len() as u16);
        for m in &self.members {
            m.encode(&mut buf);
        }
        buf.freeze()
    }

    pub fn decode(mut body: Bytes) -> Result<Self, NimbusError> {
        if body.len() < 8 + 8 + 16 + 2 {
            return Err(NimbusError(format!(
                "consensus payload too short: {}B",
                body.len()
            )));
        }
        let promised = body.get_u64_le();
        let accepted = body.get_u64_le();
        let cloud_id = body.get_u128_le();
        let count = body.get_u16_le() as usize;
        if body.len() < count * NodeAddr::WIRE_LEN {
            return Err(NimbusError(format!(
                "consensus payload truncated: {} members, {}B left",
                count,
                body.len()
            )));
        }
        let mut members = Vec::with_capacity(count);
        for _ in 0..count {
            members.push(NodeAddr::decode(&mut body)?);
        }
        Ok(ConsensusMsg {
            promised,
            accepted,
            cloud_id,
            members,
        })
    }
}
