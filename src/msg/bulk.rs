//! TCP bulk-transfer channel for payloads that would not fit one datagram.
//!
//! Frame on the stream: `[opcode u8][sender port u16][task u32][len u32]`
//! then `len` body bytes; the receiver writes back a single
//! acknowledgement byte once the frame is consumed. Each transfer uses a
//! fresh connection. The bulk listener sits on the node's UDP port + 1.

use std::sync::Arc;

use crate::msg::{Packet, PacketRouter};
use crate::node::{NodeAddr, NodeRegistry};
use crate::utils::NimbusError;
use crate::wire::{Opcode, BULK_ACK_BYTE};

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Upper bound on a single bulk body; anything larger is a malformed or
/// hostile frame.
const MAX_BULK_LEN: usize = 256 << 20;

#[derive(Debug)]
pub struct BulkHub {
    my_addr: NodeAddr,
}

impl BulkHub {
    /// Binds the bulk listener and spawns the accept loop.
    pub async fn new_and_setup(
        my_addr: NodeAddr,
        registry: Arc<NodeRegistry>,
        router: Arc<PacketRouter>,
    ) -> Result<Arc<BulkHub>, NimbusError> {
        let listener = TcpListener::bind(my_addr.tcp_socket()).await?;
        pf_debug!("bulk hub listening at {}", my_addr.tcp_socket());

        tokio::spawn(async move {
            loop {
                let (stream, peer) = match listener.accept().await {
                    Ok(c) => c,
                    Err(e) => {
                        pf_warn!("bulk accept error: {}", e);
                        continue;
                    }
                };
                let registry = registry.clone();
                let router = router.clone();
                tokio::spawn(async move {
                    if let Err(e) =
                        serve_transfer(stream, peer, registry, router).await
                    {
                        pf_warn!("bulk transfer from {} failed: {}", peer, e);
                    }
                });
            }
        });
        Ok(Arc::new(BulkHub { my_addr }))
    }

    /// Sends one oversized frame to a peer's bulk listener and waits for
    /// the acknowledgement byte.
    pub async fn send(
        &self,
        dest: NodeAddr,
        op: Opcode,
        task: u32,
        body: &[u8],
    ) -> Result<(), NimbusError> {
        let mut stream = TcpStream::connect(dest.tcp_socket()).await?;
        let mut header = [0u8; 11];
        header[0] = op as u8;
        header[1..3].copy_from_slice(&self.my_addr.port.to_le_bytes());
        header[3..7].copy_from_slice(&task.to_le_bytes());
        header[7..11].copy_from_slice(&(body.len() as u32).to_le_bytes());
        stream.write_all(&header).await?;
        stream.write_all(body).await?;
        stream.flush().await?;

        let ack = stream.read_u8().await?;
        if ack != BULK_ACK_BYTE {
            return logged_err!(
                "bad bulk ack byte {} from {}",
                ack,
                dest
            );
        }
        Ok(())
    }
}

/// Reads one bulk frame off an accepted connection, acknowledges it, and
/// dispatches it like any other inbound packet.
async fn serve_transfer(
    mut stream: TcpStream,
    peer: std::net::SocketAddr,
    registry: Arc<NodeRegistry>,
    router: Arc<PacketRouter>,
) -> Result<(), NimbusError> {
    let mut header = [0u8; 11];
    stream.read_exact(&mut header).await?;
    let op = Opcode::from_u8(header[0])
        .ok_or_else(|| NimbusError(format!("unknown opcode {}", header[0])))?;
    let port = u16::from_le_bytes([header[1], header[2]]);
    let task = u32::from_le_bytes([header[3], header[4], header[5], header[6]]);
    let len =
        u32::from_le_bytes([header[7], header[8], header[9], header[10]])
            as usize;
    if len > MAX_BULK_LEN {
        return logged_err!("bulk body of {}B exceeds cap", len);
    }
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    stream.write_all(&[BULK_ACK_BYTE]).await?;
    stream.flush().await?;

    let ip = match peer.ip() {
        std::net::IpAddr::V4(ip) => ip,
        std::net::IpAddr::V6(_) => {
            return Err(NimbusError::msg("IPv6 sender not supported"));
        }
    };
    let sender = registry.intern(NodeAddr::new(ip, port))?;
    sender.heard_from();
    router.dispatch(Packet {
        op,
        sender,
        task,
        body: Bytes::from(body),
    });
    Ok(())
}
