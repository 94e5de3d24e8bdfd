//! Immutable cluster-membership snapshots ("clouds") and the process-wide
//! view that swaps them atomically.
//!
//! A `Cloud` is created exactly once per committed consensus round and
//! never mutated. The current cloud is published through a `watch` channel
//! so every component sees whole-snapshot swaps, never partial updates.
//! A bounded history of prior cloud ids is kept to recognize stale senders.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::node::{Node, NodeAddr};
use crate::utils::NimbusError;

use dashmap::DashMap;
use tokio::sync::watch;

/// How many cloud indices back an index may lag and still count as "older"
/// under the rolling 8-bit comparison.
const IDX_WRAP_WINDOW: u8 = 64;

/// Returns true iff rolling cloud index `a` is strictly newer than `b`,
/// under 8-bit wraparound.
pub fn idx_newer(a: u8, b: u8) -> bool {
    a != b && a.wrapping_sub(b) < IDX_WRAP_WINDOW
}

/// An immutable snapshot of agreed cluster membership.
#[derive(Debug, Clone)]
pub struct Cloud {
    /// Unique 16-byte id minted by the consensus round that committed this
    /// membership.
    pub id: u128,

    /// Members sorted by address. A key's home is an index into this array.
    pub members: Vec<Arc<Node>>,

    /// Rolling snapshot index; wraps at 256 and skips 0 (0 means "no cloud
    /// agreed yet").
    pub idx: u8,
}

impl Cloud {
    pub fn new(id: u128, mut members: Vec<Arc<Node>>, idx: u8) -> Self {
        members.sort_by_key(|n| n.addr);
        members.dedup_by_key(|n| n.addr);
        Cloud { id, members, idx }
    }

    pub fn size(&self) -> usize {
        self.members.len()
    }

    /// Position of an address in the sorted member array.
    pub fn position(&self, addr: &NodeAddr) -> Option<usize> {
        self.members.binary_search_by_key(addr, |n| n.addr).ok()
    }

    pub fn contains(&self, addr: &NodeAddr) -> bool {
        self.position(addr).is_some()
    }

    /// The member index owning replica `r` of a key with the given hash,
    /// or `None` when the cloud is too small to host that replica.
    pub fn home_index(&self, hash: u64, replica: usize) -> Option<usize> {
        if self.members.is_empty() || replica >= self.members.len() {
            return None;
        }
        Some(((hash as usize).wrapping_add(replica)) % self.members.len())
    }

    pub fn member_addrs(&self) -> Vec<NodeAddr> {
        self.members.iter().map(|n| n.addr).collect()
    }
}

/// Process-wide handle on the current cloud. Swapped whole on each
/// committed consensus round; lockable once keys have been distributed
/// for computation.
#[derive(Debug)]
pub struct CloudView {
    tx: watch::Sender<Arc<Cloud>>,

    /// Rolling window of installed cloud ids, keyed by snapshot index.
    /// Overwritten on wraparound, so at most 256 entries live here.
    history: DashMap<u8, u128>,

    /// Once set, any further membership reshape is fatal.
    locked: AtomicBool,
}

impl CloudView {
    pub fn new(initial: Arc<Cloud>) -> Self {
        let history = DashMap::new();
        history.insert(initial.idx, initial.id);
        let (tx, _) = watch::channel(initial);
        CloudView {
            tx,
            history,
            locked: AtomicBool::new(false),
        }
    }

    /// The current cloud snapshot.
    pub fn current(&self) -> Arc<Cloud> {
        self.tx.borrow().clone()
    }

    /// Subscribes to cloud swaps; used by the call layer to cancel calls
    /// whose target left the cluster.
    pub fn subscribe(&self) -> watch::Receiver<Arc<Cloud>> {
        self.tx.subscribe()
    }

    /// Installs a freshly committed cloud. The caller (consensus) has
    /// already verified this process is a member and that the cloud lock
    /// permits the reshape.
    pub fn install(&self, cloud: Arc<Cloud>) -> Result<(), NimbusError> {
        let prev = self.current();
        if !idx_newer(cloud.idx, prev.idx) {
            return logged_err!(
                "refusing to install cloud idx {} over {}",
                cloud.idx,
                prev.idx
            );
        }
        self.history.insert(cloud.idx, cloud.id);
        pf_info!(
            "cloud [{}] installed: {} members, id {:032x}",
            cloud.idx,
            cloud.size(),
            cloud.id
        );
        self.tx.send_replace(cloud);
        Ok(())
    }

    /// Whether the given id names a previously installed (now stale) cloud.
    pub fn is_prev_cloud_id(&self, id: u128) -> bool {
        id != self.current().id
            && self.history.iter().any(|e| *e.value() == id)
    }

    /// Locks the cloud shape; called before the first distributed write.
    pub fn lock(&self) {
        if !self.locked.swap(true, Ordering::SeqCst) {
            pf_debug!("cloud locked for distribution");
        }
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::SeqCst)
    }
}
