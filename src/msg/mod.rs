//! Messaging substrate: unicast datagrams, multicast discovery, and the
//! TCP bulk-transfer fallback for oversized payloads.
//!
//! Inbound datagrams from any of the listeners are parsed, their sender
//! interned against the node registry, and then dispatched off the opcode
//! byte to whichever module registered for that opcode.

mod bulk;
mod multicast;
mod udp;

pub use bulk::BulkHub;
pub use multicast::{derive_group, MulticastHub};
pub use udp::UdpHub;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::node::{Node, NodeAddr, NodeRegistry};
use crate::wire::{self, Opcode};

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

/// A fully decoded inbound message with its sender resolved to the
/// canonical interned node.
#[derive(Debug, Clone)]
pub struct Packet {
    pub op: Opcode,
    pub sender: Arc<Node>,
    /// Task id for reliable-call opcodes; 0 otherwise.
    pub task: u32,
    pub body: Bytes,
}

/// Opcode-indexed dispatch table. Built once at node setup, before any
/// listener starts, then shared read-only by all receive loops.
#[derive(Debug, Default)]
pub struct PacketRouter {
    table: HashMap<Opcode, mpsc::UnboundedSender<Packet>>,
}

impl PacketRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a channel as the handler for a set of opcodes.
    pub fn route(
        &mut self,
        ops: &[Opcode],
        tx: mpsc::UnboundedSender<Packet>,
    ) {
        for op in ops {
            self.table.insert(*op, tx.clone());
        }
    }

    /// Hands a packet to its registered handler. Packets for unregistered
    /// opcodes are dropped with a warning.
    pub fn dispatch(&self, pkt: Packet) {
        match self.table.get(&pkt.op) {
            Some(tx) => {
                if tx.send(pkt).is_err() {
                    pf_warn!("packet handler channel closed");
                }
            }
            None => {
                pf_warn!("no handler registered for opcode {:?}", pkt.op);
            }
        }
    }
}

/// Shared receive loop for the unicast and multicast sockets: parse,
/// intern the sender, mark it heard from, dispatch.
pub(crate) fn spawn_recv_loop(
    socket: Arc<UdpSocket>,
    registry: Arc<NodeRegistry>,
    router: Arc<PacketRouter>,
) {
    tokio::spawn(async move {
        let mut buf = vec![0u8; wire::MTU + 128];
        loop {
            let (len, src) = match socket.recv_from(&mut buf).await {
                Ok(r) => r,
                Err(e) => {
                    pf_warn!("datagram recv error: {}", e);
                    continue;
                }
            };
            let frame = Bytes::copy_from_slice(&buf[..len]);
            match pkt_from_datagram(frame, src, &registry) {
                Ok(pkt) => router.dispatch(pkt),
                Err(e) => pf_warn!("dropping datagram from {}: {}", src, e),
            }
        }
    });
}

/// Parses one raw datagram into a routed packet, interning its sender.
pub(crate) fn pkt_from_datagram(
    frame: Bytes,
    src: SocketAddr,
    registry: &NodeRegistry,
) -> Result<Packet, crate::utils::NimbusError> {
    let raw = wire::parse_frame(frame)?;
    let ip = match src.ip() {
        std::net::IpAddr::V4(ip) => ip,
        std::net::IpAddr::V6(_) => {
            return Err(crate::utils::NimbusError::msg(
                "IPv6 sender not supported",
            ));
        }
    };
    // the sender identifies its service port in the frame; the source
    // port of the datagram itself may be ephemeral
    let sender = registry.intern(NodeAddr::new(ip, raw.port))?;
    sender.heard_from();
    Ok(Packet {
        op: raw.op,
        sender,
        task: raw.task,
        body: raw.body,
    })
}

#[cfg(test)]
mod router_tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn dispatch_reaches_registered_channel() {
        let registry = NodeRegistry::new();
        let sender = registry
            .intern(NodeAddr::new(Ipv4Addr::new(127, 0, 0, 1), 7001))
            .unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut router = PacketRouter::new();
        router.route(&[Opcode::Heartbeat, Opcode::Rebooted], tx);

        router.dispatch(Packet {
            op: Opcode::Rebooted,
            sender: sender.clone(),
            task: 0,
            body: Bytes::new(),
        });
        let pkt = rx.try_recv().unwrap();
        assert_eq!(pkt.op, Opcode::Rebooted);

        // unregistered opcode is dropped, not delivered
        router.dispatch(Packet {
            op: Opcode::GetKey,
            sender,
            task: 1,
            body: Bytes::new(),
        });
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn datagram_to_packet_interns_claimed_port() {
        let registry = NodeRegistry::new();
        let frame =
            wire::stateless_frame(Opcode::Heartbeat, 7001, &[0u8; 56]);
        let src = "127.0.0.1:59999".parse().unwrap();
        let pkt = pkt_from_datagram(frame, src, &registry).unwrap();
        assert_eq!(pkt.sender.addr.port, 7001);
        assert_eq!(pkt.sender.addr.ip, Ipv4Addr::new(127, 0, 0, 1));
        assert!(pkt.sender.millis_since_heard() < 1000);
    }
}
