//! Cluster discovery broadcasts: a real multicast group when the network
//! allows it, or unicast fan-out over a configured peer list when it does
//! not (cloud-in-a-datacenter deployments usually block multicast).

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use crate::msg::{self, PacketRouter, UdpHub};
use crate::node::{NodeAddr, NodeRegistry};
use crate::utils::NimbusError;

use bytes::Bytes;
use tokio::net::UdpSocket;

/// Derives a deterministic administratively-scoped multicast group from
/// the cloud name, so nodes sharing a name find each other without any
/// peer list.
pub fn derive_group(cloud_name: &str, port: u16) -> SocketAddrV4 {
    let mut h: u32 = 0x811C_9DC5;
    for b in cloud_name.bytes() {
        h ^= b as u32;
        h = h.wrapping_mul(0x0100_0193);
    }
    // 239.192.0.0/14 is the organization-local scope
    let ip = Ipv4Addr::new(
        239,
        192 | ((h >> 16) & 0x03) as u8,
        (h >> 8) as u8,
        h as u8,
    );
    SocketAddrV4::new(ip, port)
}

/// Hub for membership/heartbeat broadcasts.
#[derive(Debug)]
pub struct MulticastHub {
    udp: Arc<UdpHub>,
    /// Joined group, or `None` when running on a static peer list.
    group: Option<SocketAddrV4>,
    /// Unicast fallback targets (self excluded at send time).
    static_targets: Vec<NodeAddr>,
}

impl MulticastHub {
    /// Joins the multicast group (if configured) and spawns its receive
    /// loop; broadcast sends go out through the unicast hub's socket.
    pub async fn new_and_setup(
        udp: Arc<UdpHub>,
        group: Option<SocketAddrV4>,
        static_targets: Vec<NodeAddr>,
        registry: Arc<NodeRegistry>,
        router: Arc<PacketRouter>,
    ) -> Result<Arc<MulticastHub>, NimbusError> {
        if let Some(group) = group {
            let socket = Arc::new(
                UdpSocket::bind(SocketAddrV4::new(
                    Ipv4Addr::UNSPECIFIED,
                    group.port(),
                ))
                .await?,
            );
            socket.join_multicast_v4(*group.ip(), Ipv4Addr::UNSPECIFIED)?;
            pf_debug!("joined multicast group {}", group);
            msg::spawn_recv_loop(socket, registry, router);
        } else if static_targets.is_empty() {
            pf_warn!("no multicast group and no static peers configured");
        }
        Ok(Arc::new(MulticastHub {
            udp,
            group,
            static_targets,
        }))
    }

    /// Broadcasts a preframed datagram to the whole (prospective) cluster.
    pub async fn multicast(&self, frame: Bytes) -> Result<(), NimbusError> {
        if let Some(group) = self.group {
            self.udp
                .send_frame_raw(&frame, SocketAddr::V4(group))
                .await?;
        }
        let me = self.udp.my_addr();
        for target in &self.static_targets {
            if *target == me {
                continue;
            }
            // best effort per target; one unreachable peer must not stop
            // the rest of the fan-out
            if let Err(e) = self.udp.send_frame(&frame, *target).await {
                pf_trace!("broadcast to {} failed: {}", target, e);
            }
        }
        Ok(())
    }
}
