//! Heartbeat emission and liveness bookkeeping.
//!
//! Once a second every node multicasts a heartbeat carrying the cloud id
//! it believes it is in plus a fixed-layout health record. Received
//! heartbeats refresh the sender's liveness clock and health snapshot;
//! members silent past the suspect threshold are flagged (removal is the
//! consensus layer's business, on its shorter laggard threshold, so a
//! suspected member has normally already dropped out of proposals).

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::thread;

use crate::cloud::CloudView;
use crate::msg::{MulticastHub, Packet};
use crate::node::Node;
use crate::store::{MemGauge, Store};
use crate::utils::NimbusError;
use crate::wire::{self, HealthRecord, Opcode, STAT_UNKNOWN};

use fixedbitset::FixedBitSet;

pub struct Heartbeater {
    me: Arc<Node>,
    view: Arc<CloudView>,
    store: Arc<Store>,
    gauge: Arc<MemGauge>,
    mcast: Arc<MulticastHub>,

    /// Silence threshold before a member is flagged as suspect.
    suspect_ms: u64,
    /// Node ids currently flagged, so each outage logs once.
    suspected: Mutex<FixedBitSet>,
}

impl Heartbeater {
    pub fn new(
        me: Arc<Node>,
        view: Arc<CloudView>,
        store: Arc<Store>,
        gauge: Arc<MemGauge>,
        mcast: Arc<MulticastHub>,
        suspect_ms: u64,
    ) -> Self {
        Heartbeater {
            me,
            view,
            store,
            gauge,
            mcast,
            suspect_ms,
            suspected: Mutex::new(FixedBitSet::with_capacity(256)),
        }
    }

    fn gather_health(&self) -> HealthRecord {
        let max_kb = (self.gauge.max_bytes() / 1024) as u32;
        let cached = self.gauge.cached();
        HealthRecord {
            cpus: thread::available_parallelism()
                .map_or(STAT_UNKNOWN, |n| n.get() as u16),
            free_mem_kb: max_kb
                .saturating_sub((cached / 1024) as u32),
            tot_mem_kb: max_kb,
            max_mem_kb: max_kb,
            key_count: self.store.key_count() as u32,
            cached_bytes: cached.min(u32::MAX as u64) as u32,
            free_disk_mb: 0,
            max_disk_mb: 0,
            cpu_util: STAT_UNKNOWN,
            load_1: STAT_UNKNOWN,
            load_5: STAT_UNKNOWN,
            load_15: STAT_UNKNOWN,
            threads: STAT_UNKNOWN,
            queue_depth: STAT_UNKNOWN,
            node_type: 0,
        }
    }

    /// Emits one heartbeat. The local copy is applied directly since the
    /// multicast path need not loop back to this process.
    pub async fn beat(&self) -> Result<(), NimbusError> {
        let cloud = self.view.current();
        let health = self.gather_health();
        self.me.set_health(health.clone());
        self.me.set_announced_cloud(cloud.id);
        self.me.heard_from();

        let body = wire::encode_heartbeat(cloud.id, &health);
        let frame = wire::stateless_frame(
            Opcode::Heartbeat,
            self.me.addr.port,
            &body,
        );
        self.mcast.multicast(frame).await
    }

    /// Applies a received heartbeat to the sender's record and returns
    /// the cloud id the sender announced (consumed by consensus).
    pub fn observe(&self, pkt: &Packet) -> Result<u128, NimbusError> {
        let (announced, health) =
            wire::decode_heartbeat(pkt.body.clone())?;
        pkt.sender.set_health(health);
        pkt.sender.set_announced_cloud(announced);

        let mut suspected = self
            .suspected
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let id = pkt.sender.id as usize;
        if suspected.contains(id) {
            pf_info!("member {} is heard again", pkt.sender.addr);
            suspected.set(id, false);
        }
        Ok(announced)
    }

    /// Flags cloud members that went silent. Runs on the emit cadence.
    pub fn suspect_scan(&self) {
        let cloud = self.view.current();
        let mut suspected = self
            .suspected
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for member in &cloud.members {
            if member.id == self.me.id {
                continue;
            }
            let silent =
                member.millis_since_heard() > self.suspect_ms;
            let id = member.id as usize;
            if silent && !suspected.contains(id) {
                pf_warn!(
                    "member {} silent for {}ms, suspecting",
                    member.addr,
                    member.millis_since_heard()
                );
                suspected.set(id, true);
            }
        }
    }
}

#[cfg(test)]
mod heartbeat_tests {
    use super::*;
    use crate::cloud::Cloud;
    use crate::msg::{PacketRouter, UdpHub};
    use crate::node::{NodeAddr, NodeRegistry};
    use crate::store::MemBackend;
    use std::net::Ipv4Addr;

    async fn fixture() -> (Arc<NodeRegistry>, Heartbeater) {
        let registry = Arc::new(NodeRegistry::new());
        let router = Arc::new(PacketRouter::new());
        let udp = UdpHub::new_and_setup(
            NodeAddr::new(Ipv4Addr::new(127, 0, 0, 1), 0),
            registry.clone(),
            router.clone(),
        )
        .await
        .unwrap();
        let me = registry.intern(udp.my_addr()).unwrap();
        let view = Arc::new(CloudView::new(Arc::new(Cloud::new(
            7,
            vec![me.clone()],
            1,
        ))));
        let gauge = Arc::new(MemGauge::new(64 << 20));
        let store = Store::new(
            me.clone(),
            view.clone(),
            Arc::new(MemBackend::new()),
            gauge.clone(),
        );
        let mcast = MulticastHub::new_and_setup(
            udp,
            None,
            Vec::new(),
            registry.clone(),
            router,
        )
        .await
        .unwrap();
        let hb = Heartbeater::new(me, view, store, gauge, mcast, 5_000);
        (registry, hb)
    }

    #[tokio::test]
    async fn health_snapshot_is_sane() {
        let (_registry, hb) = fixture().await;
        let h = hb.gather_health();
        assert!(h.tot_mem_kb > 0);
        assert_eq!(h.tot_mem_kb, h.max_mem_kb);
        assert!(h.free_mem_kb <= h.tot_mem_kb);
        assert_eq!(h.cpu_util, STAT_UNKNOWN);
    }

    #[tokio::test]
    async fn observe_applies_sender_state() -> Result<(), NimbusError> {
        let (registry, hb) = fixture().await;
        let peer = registry
            .intern(NodeAddr::new(Ipv4Addr::new(127, 0, 0, 2), 7103))?;

        let health = HealthRecord {
            key_count: 41,
            ..HealthRecord::default()
        };
        let pkt = Packet {
            op: Opcode::Heartbeat,
            sender: peer.clone(),
            task: 0,
            body: wire::encode_heartbeat(99, &health),
        };
        let announced = hb.observe(&pkt)?;
        assert_eq!(announced, 99);
        assert_eq!(peer.announced_cloud(), 99);
        assert_eq!(peer.health().key_count, 41);
        Ok(())
    }

    #[tokio::test]
    async fn silent_member_suspected_once() -> Result<(), NimbusError> {
        let (registry, hb) = fixture().await;
        let peer = registry
            .intern(NodeAddr::new(Ipv4Addr::new(127, 0, 0, 2), 7105))?;
        // never heard from: epoch-old, well past the threshold
        let cloud = Arc::new(Cloud::new(
            8,
            vec![hb.me.clone(), peer.clone()],
            2,
        ));
        hb.view.install(cloud)?;

        hb.suspect_scan();
        assert!(hb
            .suspected
            .lock()
            .unwrap()
            .contains(peer.id as usize));

        // a fresh heartbeat clears the flag
        let pkt = Packet {
            op: Opcode::Heartbeat,
            sender: peer.clone(),
            task: 0,
            body: wire::encode_heartbeat(8, &HealthRecord::default()),
        };
        hb.observe(&pkt)?;
        assert!(!hb
            .suspected
            .lock()
            .unwrap()
            .contains(peer.id as usize));
        Ok(())
    }
}
