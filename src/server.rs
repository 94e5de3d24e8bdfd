//! One cluster node: configuration, subsystem wiring, and the single
//! event loop that drives consensus, the call layer, and the store's
//! background sweep.

use std::net::Ipv4Addr;
use std::sync::Arc;

use crate::cloud::{Cloud, CloudView};
use crate::heartbeat::Heartbeater;
use crate::msg::{
    derive_group, BulkHub, MulticastHub, Packet, PacketRouter, UdpHub,
};
use crate::node::{Node, NodeAddr, NodeRegistry};
use crate::paxos::{Outbound, Paxos};
use crate::rpc::RpcHub;
use crate::store::{MemBackend, MemGauge, Store};
use crate::task::{ForkTaskHandler, TaskRunner};
use crate::utils::NimbusError;
use crate::wire::{self, ConsensusMsg, Opcode};

use tokio::sync::{mpsc, watch};
use tokio::time::{self, Duration, MissedTickBehavior};

/// Node configuration parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeConfig {
    /// Address to bind and advertise.
    pub bind_ip: String,
    /// UDP service port; the bulk TCP listener takes the next port up.
    pub udp_port: u16,

    /// Cluster name; nodes only ever form clouds with namesakes, since
    /// the multicast group is derived from it.
    pub cloud_name: String,
    /// Whether to discover peers over multicast.
    pub use_multicast: bool,
    /// Port of the derived multicast group.
    pub multicast_port: u16,
    /// Static "ip:port" peers, for networks without multicast.
    pub peers: Vec<String>,

    /// Heartbeat emission (and background cadence) interval.
    pub heartbeat_ms: u64,
    /// Silence before a member is flagged as suspect; strictly above the
    /// laggard threshold, so removal from proposals fires first.
    pub suspect_ms: u64,
    /// Silence before consensus drops a member from proposals.
    pub laggard_ms: u64,
    /// How long a disagreeing round may sit idle before a restart.
    pub stall_ms: u64,

    /// Base reliable-call retransmit interval; doubles per retry.
    pub retry_base_ms: u64,

    /// Value cache budget in MB.
    pub mem_max_mb: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            bind_ip: "127.0.0.1".into(),
            udp_port: 40110,
            cloud_name: "nimbus".into(),
            use_multicast: true,
            multicast_port: 40999,
            peers: Vec::new(),
            heartbeat_ms: 1000,
            suspect_ms: 5500,
            laggard_ms: 5000,
            stall_ms: 3000,
            retry_base_ms: 200,
            mem_max_mb: 1024,
        }
    }
}

impl NodeConfig {
    fn validate(&self) -> Result<(), NimbusError> {
        if self.cloud_name.is_empty() {
            return logged_err!("invalid cloud_name ''");
        }
        if self.udp_port <= 1024 || self.udp_port == u16::MAX {
            return logged_err!("invalid udp_port {}", self.udp_port);
        }
        if self.heartbeat_ms == 0 {
            return logged_err!(
                "invalid heartbeat_ms {}",
                self.heartbeat_ms
            );
        }
        if self.laggard_ms >= self.suspect_ms {
            return logged_err!(
                "laggard_ms {} not below suspect_ms {}",
                self.laggard_ms,
                self.suspect_ms
            );
        }
        if self.retry_base_ms == 0 {
            return logged_err!(
                "invalid retry_base_ms {}",
                self.retry_base_ms
            );
        }
        if self.mem_max_mb == 0 {
            return logged_err!("invalid mem_max_mb {}", self.mem_max_mb);
        }
        if !self.use_multicast && self.peers.is_empty() {
            return logged_err!(
                "multicast disabled but no static peers given"
            );
        }
        Ok(())
    }
}

/// A running cluster node.
pub struct NimbusNode {
    me: Arc<Node>,
    view: Arc<CloudView>,
    udp: Arc<UdpHub>,
    mcast: Arc<MulticastHub>,
    rpc: Arc<RpcHub>,
    store: Arc<Store>,
    runner: Arc<TaskRunner>,
    heartbeater: Heartbeater,
    paxos: Paxos,

    paxos_rx: mpsc::UnboundedReceiver<Packet>,
    rpc_rx: mpsc::UnboundedReceiver<Packet>,
    ctrl_rx: mpsc::UnboundedReceiver<Packet>,

    heartbeat_ms: u64,
    stall_ms: u64,
}

impl NimbusNode {
    /// Parses the config, binds all listeners, wires every subsystem,
    /// and announces the fresh process start to the cluster.
    pub async fn new_and_setup(
        config_str: Option<&str>,
    ) -> Result<Self, NimbusError> {
        let config = parsed_config!(config_str => NodeConfig;
                                    bind_ip, udp_port, cloud_name,
                                    use_multicast, multicast_port, peers,
                                    heartbeat_ms, suspect_ms, laggard_ms,
                                    stall_ms, retry_base_ms, mem_max_mb)?;
        config.validate()?;

        let ip: Ipv4Addr = config.bind_ip.parse()?;
        let bind = NodeAddr::new(ip, config.udp_port);
        let registry = Arc::new(NodeRegistry::new());

        let mut router = PacketRouter::new();
        let (paxos_tx, paxos_rx) = mpsc::unbounded_channel();
        router.route(
            &[
                Opcode::Heartbeat,
                Opcode::Proposal,
                Opcode::Promise,
                Opcode::Nack,
                Opcode::Accept,
                Opcode::Accepted,
            ],
            paxos_tx,
        );
        let (rpc_tx, rpc_rx) = mpsc::unbounded_channel();
        router.route(
            &[
                Opcode::Ack,
                Opcode::AckAck,
                Opcode::GetKey,
                Opcode::PutKey,
                Opcode::HazKey,
                Opcode::AtomicUpdate,
                Opcode::ForkTask,
            ],
            rpc_tx,
        );
        let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel();
        router.route(&[Opcode::Rebooted, Opcode::Shutdown], ctrl_tx);
        let router = Arc::new(router);

        let udp = UdpHub::new_and_setup(
            bind,
            registry.clone(),
            router.clone(),
        )
        .await?;
        let me = registry.intern(udp.my_addr())?;
        let _ = crate::ME.set(me.addr.to_string());

        let bulk = BulkHub::new_and_setup(
            me.addr,
            registry.clone(),
            router.clone(),
        )
        .await?;

        let mut peers = Vec::with_capacity(config.peers.len());
        for p in &config.peers {
            let (ip, port) = p.split_once(':').ok_or_else(|| {
                NimbusError(format!("invalid peer address '{}'", p))
            })?;
            peers.push(NodeAddr::new(ip.parse()?, port.parse()?));
        }
        let group = config.use_multicast.then(|| {
            derive_group(&config.cloud_name, config.multicast_port)
        });
        let mcast = MulticastHub::new_and_setup(
            udp.clone(),
            group,
            peers,
            registry.clone(),
            router,
        )
        .await?;

        // born alone: a cloud of one, pre-agreement id 0
        let view = Arc::new(CloudView::new(Arc::new(Cloud::new(
            0,
            vec![me.clone()],
            1,
        ))));
        let rpc = RpcHub::new_and_setup(
            udp.clone(),
            bulk,
            view.clone(),
            config.retry_base_ms,
        );

        let gauge = Arc::new(MemGauge::new(config.mem_max_mb << 20));
        let store = Store::new(
            me.clone(),
            view.clone(),
            Arc::new(MemBackend::new()),
            gauge.clone(),
        );
        store.wire_rpc(rpc.clone());

        let runner =
            TaskRunner::new(me.clone(), view.clone(), store.clone());
        rpc.register_handler(
            Opcode::ForkTask,
            Arc::new(ForkTaskHandler(runner.clone())),
        );

        let heartbeater = Heartbeater::new(
            me.clone(),
            view.clone(),
            store.clone(),
            gauge,
            mcast.clone(),
            config.suspect_ms,
        );
        let paxos = Paxos::new(
            me.clone(),
            registry,
            view.clone(),
            config.laggard_ms,
        );

        // tell everyone our dedup state is fresh
        let reboot = wire::stateless_frame(
            Opcode::Rebooted,
            me.addr.port,
            &[],
        );
        mcast.multicast(reboot).await?;
        pf_info!("node up at {}", me.addr);

        Ok(NimbusNode {
            me,
            view,
            udp,
            mcast,
            rpc,
            store,
            runner,
            heartbeater,
            paxos,
            paxos_rx,
            rpc_rx,
            ctrl_rx,
            heartbeat_ms: config.heartbeat_ms,
            stall_ms: config.stall_ms,
        })
    }

    pub fn addr(&self) -> NodeAddr {
        self.me.addr
    }

    pub fn cloud(&self) -> &Arc<CloudView> {
        &self.view
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn tasks(&self) -> &Arc<TaskRunner> {
        &self.runner
    }

    fn consensus_step(&mut self, pkt: Packet) -> Vec<Outbound> {
        if pkt.op == Opcode::Heartbeat {
            return match self.heartbeater.observe(&pkt) {
                Ok(announced) => {
                    self.paxos.note_heartbeat(&pkt.sender, announced)
                }
                Err(e) => {
                    pf_warn!(
                        "bad heartbeat from {}: {}",
                        pkt.sender.addr,
                        e
                    );
                    Vec::new()
                }
            };
        }
        let msg = match ConsensusMsg::decode(pkt.body.clone()) {
            Ok(m) => m,
            Err(e) => {
                pf_warn!(
                    "bad consensus packet from {}: {}",
                    pkt.sender.addr,
                    e
                );
                return Vec::new();
            }
        };
        match pkt.op {
            Opcode::Proposal => self.paxos.do_proposal(&pkt.sender, msg),
            Opcode::Promise => self.paxos.do_promise(&pkt.sender, msg),
            Opcode::Nack => self.paxos.do_nack(&pkt.sender, msg),
            Opcode::Accept => self.paxos.do_accept(&pkt.sender, msg),
            Opcode::Accepted => self.paxos.do_accepted(&pkt.sender, msg),
            _ => Vec::new(),
        }
    }

    async fn perform(&self, out: Outbound) -> Result<(), NimbusError> {
        let port = self.me.addr.port;
        match out {
            Outbound::Multicast(op, body) => {
                let frame = wire::stateless_frame(op, port, &body);
                self.mcast.multicast(frame).await
            }
            Outbound::Unicast(op, dest, body) => {
                let frame = wire::stateless_frame(op, port, &body);
                self.udp.send_frame(&frame, dest).await
            }
            Outbound::Fatal => {
                let bye =
                    wire::stateless_frame(Opcode::Shutdown, port, &[]);
                for _ in 0..3 {
                    let _ = self.mcast.multicast(bye.clone()).await;
                }
                pf_error!("fatal reshape of a locked cloud; aborting");
                std::process::exit(1);
            }
        }
    }

    /// The node's event loop. Returns after a termination signal or a
    /// cluster-wide shutdown broadcast.
    pub async fn run(
        &mut self,
        mut rx_term: watch::Receiver<bool>,
    ) -> Result<(), NimbusError> {
        let mut cadence = time::interval(Duration::from_millis(
            self.heartbeat_ms,
        ));
        cadence.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                Some(pkt) = self.paxos_rx.recv() => {
                    let outs = self.consensus_step(pkt);
                    for out in outs {
                        if let Err(e) = self.perform(out).await {
                            pf_warn!("consensus send failed: {}", e);
                        }
                    }
                },

                Some(pkt) = self.rpc_rx.recv() => {
                    self.rpc.handle_packet(pkt).await;
                },

                Some(pkt) = self.ctrl_rx.recv() => {
                    match pkt.op {
                        Opcode::Shutdown => {
                            pf_error!(
                                "shutdown broadcast from {}; leaving",
                                pkt.sender.addr
                            );
                            break;
                        }
                        Opcode::Rebooted => {
                            self.rpc.peer_rebooted(&pkt.sender);
                        }
                        _ => {}
                    }
                },

                _ = cadence.tick() => {
                    if let Err(e) = self.heartbeater.beat().await {
                        pf_warn!("heartbeat emission failed: {}", e);
                    }
                    self.heartbeater.suspect_scan();
                    let outs = self.paxos.tick(self.stall_ms);
                    for out in outs {
                        if let Err(e) = self.perform(out).await {
                            pf_warn!("round restart send failed: {}", e);
                        }
                    }
                    self.store.sweep().await;
                },

                _ = rx_term.changed() => {
                    pf_info!("terminating; leaving the cloud");
                    break;
                },
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod server_tests {
    use super::*;
    use crate::store::UpdateKind;
    use bytes::Bytes;

    #[test]
    fn config_rejects_nonsense() {
        let bad_port = NodeConfig {
            udp_port: 80,
            ..NodeConfig::default()
        };
        assert!(bad_port.validate().is_err());

        // a member must drop out of proposals before it is suspected
        let inverted = NodeConfig {
            suspect_ms: 10_000,
            laggard_ms: 20_000,
            ..NodeConfig::default()
        };
        assert!(inverted.validate().is_err());
        assert!(NodeConfig::default().validate().is_ok());

        let deaf = NodeConfig {
            use_multicast: false,
            peers: Vec::new(),
            ..NodeConfig::default()
        };
        assert!(deaf.validate().is_err());
    }

    #[test]
    fn config_parses_partial_toml() -> Result<(), NimbusError> {
        let parsed = parsed_config!(
            Some("udp_port = 30901\npeers = ['127.0.0.1:30903']")
            => NodeConfig;
            bind_ip, udp_port, cloud_name, use_multicast,
            multicast_port, peers, heartbeat_ms, suspect_ms,
            laggard_ms, stall_ms, retry_base_ms, mem_max_mb)?;
        assert_eq!(parsed.udp_port, 30901);
        assert_eq!(parsed.peers, vec!["127.0.0.1:30903".to_string()]);
        assert_eq!(parsed.heartbeat_ms, 1000);
        Ok(())
    }

    #[test]
    fn config_rejects_unknown_fields() {
        let parsed = parsed_config!(
            Some("no_such_knob = 3") => NodeConfig;
            bind_ip, udp_port);
        assert!(parsed.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn single_node_serves_itself() -> Result<(), NimbusError> {
        let config = "udp_port = 30911\n\
                      use_multicast = false\n\
                      peers = ['127.0.0.1:30913']";
        let node = NimbusNode::new_and_setup(Some(config)).await?;
        assert_eq!(node.addr().port, 30911);
        assert_eq!(node.cloud().current().size(), 1);

        let store = node.store();
        let k = store.make_user_key(Bytes::from_static(b"local"))?;
        store.put(&k, Bytes::from_static(&[3, 4])).await?;
        store
            .atomic(&k, &UpdateKind::Append { bytes: vec![5] })
            .await?;
        assert_eq!(
            store.get(&k).await?,
            Some(Bytes::from_static(&[3, 4, 5]))
        );

        let result =
            node.tasks().run(crate::TaskKind::ByteSum, vec![k]).await?;
        assert_eq!(result, 12);
        Ok(())
    }
}
