//! Unicast datagram hub: owns the node's main UDP socket.

use std::sync::Arc;

use crate::msg::{self, PacketRouter};
use crate::node::{NodeAddr, NodeRegistry};
use crate::utils::NimbusError;

use tokio::net::UdpSocket;

/// Hub owning the node's unicast UDP socket. All outbound frames leave
/// through here; inbound datagrams are dispatched by a spawned receive
/// loop.
#[derive(Debug)]
pub struct UdpHub {
    socket: Arc<UdpSocket>,
    my_addr: NodeAddr,
}

impl UdpHub {
    /// Binds the socket and spawns the receive loop.
    pub async fn new_and_setup(
        bind: NodeAddr,
        registry: Arc<NodeRegistry>,
        router: Arc<PacketRouter>,
    ) -> Result<Arc<UdpHub>, NimbusError> {
        let socket = Arc::new(UdpSocket::bind(bind.udp_socket()).await?);
        // bind port 0 means ephemeral; report the port actually bound
        let local = socket.local_addr()?;
        let my_addr = NodeAddr::new(bind.ip, local.port());
        pf_debug!("unicast hub bound at {}", my_addr);

        msg::spawn_recv_loop(socket.clone(), registry, router);
        Ok(Arc::new(UdpHub { socket, my_addr }))
    }

    /// Address peers should reach this node at.
    pub fn my_addr(&self) -> NodeAddr {
        self.my_addr
    }

    /// Sends a preframed datagram to a peer's service port.
    pub async fn send_frame(
        &self,
        frame: &[u8],
        dest: NodeAddr,
    ) -> Result<(), NimbusError> {
        let n = self.socket.send_to(frame, dest.udp_socket()).await?;
        if n != frame.len() {
            return logged_err!(
                "short datagram send to {}: {} of {}B",
                dest,
                n,
                frame.len()
            );
        }
        Ok(())
    }

    /// Sends a preframed datagram to an arbitrary socket address (used for
    /// the multicast group).
    pub async fn send_frame_raw(
        &self,
        frame: &[u8],
        dest: std::net::SocketAddr,
    ) -> Result<(), NimbusError> {
        self.socket.send_to(frame, dest).await?;
        Ok(())
    }
}

#[cfg(test)]
mod udp_tests {
    use super::*;
    use crate::msg::Packet;
    use crate::wire::{self, Opcode};
    use std::net::Ipv4Addr;
    use tokio::sync::mpsc;

    async fn hub_with_router(
        port: u16,
        ops: &[Opcode],
    ) -> (Arc<UdpHub>, mpsc::UnboundedReceiver<Packet>, Arc<NodeRegistry>)
    {
        let registry = Arc::new(NodeRegistry::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let mut router = PacketRouter::new();
        router.route(ops, tx);
        let hub = UdpHub::new_and_setup(
            NodeAddr::new(Ipv4Addr::new(127, 0, 0, 1), port),
            registry.clone(),
            Arc::new(router),
        )
        .await
        .unwrap();
        (hub, rx, registry)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn send_and_receive() {
        let (hub_a, _rx_a, _) =
            hub_with_router(30801, &[Opcode::Rebooted]).await;
        let (_hub_b, mut rx_b, _) =
            hub_with_router(30802, &[Opcode::Rebooted]).await;

        let frame =
            wire::stateless_frame(Opcode::Rebooted, hub_a.my_addr().port, b"");
        hub_a
            .send_frame(&frame, NodeAddr::new(Ipv4Addr::new(127, 0, 0, 1), 30802))
            .await
            .unwrap();

        let pkt = rx_b.recv().await.unwrap();
        assert_eq!(pkt.op, Opcode::Rebooted);
        assert_eq!(pkt.sender.addr.port, 30801);
    }
}
