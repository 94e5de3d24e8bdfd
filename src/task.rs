//! Distributed fork/join tasks over key sets.
//!
//! A task is a closed (kind, key set) pair: code never travels, only the
//! kind tag, so every node agrees on what each kind computes. The runner
//! partitions a key set by home node, recurses locally, and ships the two
//! remote halves as one call each; a half whose target departs is re-run
//! against the reshaped cloud. Large key sets travel as a published
//! key-of-keys instead of inline.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::cloud::CloudView;
use crate::node::Node;
use crate::rpc::{Call, CallOutcome, RemoteHandler};
use crate::store::{Key, Store};
use crate::utils::NimbusError;
use crate::wire::Opcode;

use async_trait::async_trait;
use bytes::{Buf, Bytes};
use serde::{Deserialize, Serialize};

/// Keys shipped inline beyond this count go through a key-of-keys.
const INLINE_KEY_MAX: usize = 64;

/// The closed registry of task computations. Every kind is a pure
/// map over one value's bytes plus an associative, commutative reduce.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize,
)]
pub enum TaskKind {
    /// Sum of all byte values across the key set.
    ByteSum,
    /// Length of the largest value in the key set.
    MaxLen,
}

impl TaskKind {
    pub fn map(&self, bytes: &Bytes) -> u64 {
        match self {
            TaskKind::ByteSum => {
                bytes.iter().map(|b| *b as u64).sum()
            }
            TaskKind::MaxLen => bytes.len() as u64,
        }
    }

    pub fn reduce(&self, a: u64, b: u64) -> u64 {
        match self {
            TaskKind::ByteSum => a + b,
            TaskKind::MaxLen => a.max(b),
        }
    }

    pub fn identity(&self) -> u64 {
        0
    }
}

/// How a shipped task names its key set.
#[derive(Debug, Serialize, Deserialize)]
enum TaskKeys {
    /// (name bytes, desired replication) pairs, for small sets.
    Inline(Vec<(Vec<u8>, u8)>),
    /// Name of a published key-of-keys holding the real set.
    Published(Vec<u8>, u8),
}

#[derive(Debug, Serialize, Deserialize)]
struct TaskEnvelope {
    kind: TaskKind,
    keys: TaskKeys,
}

pub struct TaskRunner {
    me: Arc<Node>,
    view: Arc<CloudView>,
    store: Arc<Store>,
}

impl TaskRunner {
    pub fn new(
        me: Arc<Node>,
        view: Arc<CloudView>,
        store: Arc<Store>,
    ) -> Arc<TaskRunner> {
        Arc::new(TaskRunner { me, view, store })
    }

    /// Runs a task over a key set and returns the folded result. Blocks
    /// first until this node's pending puts are visible at their homes,
    /// so the task sees our own writes.
    pub async fn run(
        &self,
        kind: TaskKind,
        keys: Vec<Arc<Key>>,
    ) -> Result<u64, NimbusError> {
        self.run_gated(kind, keys, Vec::new()).await
    }

    /// Like `run`, but also waits for a list of auxiliary calls (e.g.
    /// replication offers) before reporting the fold, so a caller can
    /// make completion contingent on side effects beyond the task's own
    /// subtree. A cancelled gate still counts as settled.
    pub async fn run_gated(
        &self,
        kind: TaskKind,
        keys: Vec<Arc<Key>>,
        gates: Vec<Arc<Call>>,
    ) -> Result<u64, NimbusError> {
        self.store.write_barrier().await?;
        let result = self.execute(kind, keys).await?;
        for gate in gates {
            gate.outcome().await;
        }
        Ok(result)
    }

    /// Recursive partition step. Boxed since the local half recurses.
    fn execute<'a>(
        &'a self,
        kind: TaskKind,
        keys: Vec<Arc<Key>>,
    ) -> Pin<
        Box<dyn Future<Output = Result<u64, NimbusError>> + Send + 'a>,
    > {
        Box::pin(async move {
            if keys.is_empty() {
                return Ok(kind.identity());
            }
            let cloud = self.view.current();
            let mut local = Vec::new();
            let mut remote: Vec<(usize, Arc<Key>)> = Vec::new();
            for k in keys {
                let info = k
                    .cloud_info(&cloud, &self.me.addr)
                    .ok_or_else(|| NimbusError::msg("empty cloud"))?;
                if cloud.members[info.home].id == self.me.id {
                    local.push(k);
                } else {
                    remote.push((info.home, k));
                }
            }
            // split the remote keys around their median home so the two
            // shipped halves fan out down a binary tree
            remote.sort_by_key(|(home, _)| *home);
            let mid = remote.len() / 2;
            let high = remote.split_off(mid);

            let local_fut = self.fold_local(kind, local);
            let low_fut = self.ship(kind, remote);
            let high_fut = self.ship(kind, high);
            let (a, b, c) =
                futures::future::try_join3(local_fut, low_fut, high_fut)
                    .await?;
            Ok(kind.reduce(kind.reduce(a, b), c))
        })
    }

    /// Maps every locally homed key. Absent keys fold as the identity.
    async fn fold_local(
        &self,
        kind: TaskKind,
        keys: Vec<Arc<Key>>,
    ) -> Result<u64, NimbusError> {
        let mut acc = kind.identity();
        for k in keys {
            if let Some(bytes) = self.store.get(&k).await? {
                acc = kind.reduce(acc, kind.map(&bytes));
            }
        }
        Ok(acc)
    }

    /// Ships one remote half to the first node of that half. The target
    /// recursively re-partitions against its own view.
    async fn ship(
        &self,
        kind: TaskKind,
        subset: Vec<(usize, Arc<Key>)>,
    ) -> Result<u64, NimbusError> {
        let Some((home, _)) = subset.first() else {
            return Ok(kind.identity());
        };
        let cloud = self.view.current();
        let target = match cloud.members.get(*home) {
            Some(n) => n.clone(),
            // the cloud reshaped under us; re-partition from scratch
            None => {
                let keys =
                    subset.into_iter().map(|(_, k)| k).collect();
                return self.execute(kind, keys).await;
            }
        };

        let keys: Vec<Arc<Key>> =
            subset.into_iter().map(|(_, k)| k).collect();
        let task_keys = if keys.len() > INLINE_KEY_MAX {
            let kk = self.store.publish_keys(&keys).await?;
            TaskKeys::Published(kk.bytes().to_vec(), kk.desired())
        } else {
            TaskKeys::Inline(
                keys.iter()
                    .map(|k| (k.bytes().to_vec(), k.desired()))
                    .collect(),
            )
        };
        let envelope = TaskEnvelope { kind, keys: task_keys };
        let body = Bytes::from(rmp_serde::to_vec(&envelope)?);

        match self
            .store
            .rpc_hub()?
            .call(Opcode::ForkTask, target.clone(), body)
            .await?
        {
            CallOutcome::Answered(mut reply) => {
                if reply.len() < 8 {
                    return logged_err!(
                        "malformed task reply from {}",
                        target.addr
                    );
                }
                Ok(reply.get_u64_le())
            }
            CallOutcome::Cancelled => {
                pf_warn!(
                    "task target {} left; re-partitioning {} keys",
                    target.addr,
                    keys.len()
                );
                self.execute(kind, keys).await
            }
        }
    }

    /// Resolves a shipped key set back into interned keys.
    async fn resolve(
        &self,
        keys: TaskKeys,
    ) -> Result<Vec<Arc<Key>>, NimbusError> {
        match keys {
            TaskKeys::Inline(list) => list
                .into_iter()
                .map(|(bytes, desired)| {
                    Ok(self
                        .store
                        .intern(Key::raw(Bytes::from(bytes), desired)?))
                })
                .collect(),
            TaskKeys::Published(name, desired) => {
                let kk = self
                    .store
                    .intern(Key::raw(Bytes::from(name), desired)?);
                let keys = self.store.fetch_keys(&kk).await?;
                // the published list is single-use scaffolding
                self.store.remove(&kk).await?;
                Ok(keys)
            }
        }
    }
}

/// Serves `ForkTask`: resolve the key set, recurse, reply the fold as
/// eight little-endian bytes.
pub struct ForkTaskHandler(pub Arc<TaskRunner>);

#[async_trait]
impl RemoteHandler for ForkTaskHandler {
    async fn serve(
        &self,
        _sender: Arc<Node>,
        body: Bytes,
    ) -> Result<Bytes, NimbusError> {
        let envelope: TaskEnvelope = rmp_serde::from_slice(&body)?;
        let keys = self.0.resolve(envelope.keys).await?;
        let result = self.0.execute(envelope.kind, keys).await?;
        Ok(Bytes::copy_from_slice(&result.to_le_bytes()))
    }
}

#[cfg(test)]
mod task_tests {
    use super::*;
    use crate::cloud::Cloud;
    use crate::msg::{BulkHub, PacketRouter, UdpHub};
    use crate::node::{NodeAddr, NodeRegistry};
    use crate::rpc::RpcHub;
    use crate::store::{MemBackend, MemGauge};
    use std::net::Ipv4Addr;
    use tokio::sync::mpsc;

    fn fixture() -> (Arc<Store>, Arc<TaskRunner>) {
        let registry = NodeRegistry::new();
        let me = registry
            .intern(NodeAddr::new(Ipv4Addr::new(127, 0, 0, 1), 7201))
            .unwrap();
        let view = Arc::new(CloudView::new(Arc::new(Cloud::new(
            1,
            vec![me.clone()],
            1,
        ))));
        let store = Store::new(
            me.clone(),
            view.clone(),
            Arc::new(MemBackend::new()),
            Arc::new(MemGauge::new(64 << 20)),
        );
        let runner = TaskRunner::new(me, view, store.clone());
        (store, runner)
    }

    async fn seed(
        store: &Arc<Store>,
        name: &str,
        bytes: &'static [u8],
    ) -> Arc<Key> {
        let k = store
            .make_user_key(Bytes::copy_from_slice(name.as_bytes()))
            .unwrap();
        store.put(&k, Bytes::from_static(bytes)).await.unwrap();
        k
    }

    #[tokio::test]
    async fn byte_sum_folds_all_keys() -> Result<(), NimbusError> {
        let (store, runner) = fixture();
        let keys = vec![
            seed(&store, "a", &[1, 2, 3]).await,
            seed(&store, "b", &[10]).await,
            seed(&store, "c", &[100, 50]).await,
        ];
        assert_eq!(runner.execute(TaskKind::ByteSum, keys).await?, 166);
        Ok(())
    }

    #[tokio::test]
    async fn max_len_picks_largest() -> Result<(), NimbusError> {
        let (store, runner) = fixture();
        let keys = vec![
            seed(&store, "a", &[0; 2]).await,
            seed(&store, "b", &[0; 5]).await,
            seed(&store, "c", &[0; 3]).await,
        ];
        assert_eq!(runner.execute(TaskKind::MaxLen, keys).await?, 5);
        Ok(())
    }

    #[tokio::test]
    async fn empty_set_folds_to_identity() -> Result<(), NimbusError> {
        let (_store, runner) = fixture();
        assert_eq!(
            runner.execute(TaskKind::ByteSum, Vec::new()).await?,
            0
        );
        Ok(())
    }

    #[tokio::test]
    async fn absent_keys_fold_as_identity() -> Result<(), NimbusError> {
        let (store, runner) = fixture();
        let present = seed(&store, "here", &[7, 7]).await;
        let absent = store
            .make_user_key(Bytes::from_static(b"never-written"))?;
        assert_eq!(
            runner
                .execute(TaskKind::ByteSum, vec![present, absent])
                .await?,
            14
        );
        Ok(())
    }

    #[tokio::test]
    async fn published_key_set_resolves_and_cleans_up(
    ) -> Result<(), NimbusError> {
        let (store, runner) = fixture();
        let keys = vec![
            seed(&store, "p1", &[1]).await,
            seed(&store, "p2", &[2]).await,
        ];
        let kk = store.publish_keys(&keys).await?;
        let shipped =
            TaskKeys::Published(kk.bytes().to_vec(), kk.desired());
        let resolved = runner.resolve(shipped).await?;
        assert_eq!(resolved.len(), 2);
        assert!(Arc::ptr_eq(&resolved[0], &keys[0]));
        // single use: the list itself is tombstoned after resolution
        assert_eq!(store.get(&kk).await?, None);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn gated_run_waits_for_auxiliary_calls(
    ) -> Result<(), NimbusError> {
        let registry = Arc::new(NodeRegistry::new());
        let me_addr = NodeAddr::new(Ipv4Addr::new(127, 0, 0, 1), 30951);
        let me = registry.intern(me_addr)?;
        let view = Arc::new(CloudView::new(Arc::new(Cloud::new(
            1,
            vec![me.clone()],
            1,
        ))));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut router = PacketRouter::new();
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
            tx,
        );
        let router = Arc::new(router);
        let udp =
            UdpHub::new_and_setup(me_addr, registry.clone(), router.clone())
                .await?;
        let bulk = BulkHub::new_and_setup(me_addr, registry, router).await?;
        let rpc = RpcHub::new_and_setup(udp, bulk, view.clone(), 200);
        let store = Store::new(
            me.clone(),
            view.clone(),
            Arc::new(MemBackend::new()),
            Arc::new(MemGauge::new(64 << 20)),
        );
        store.wire_rpc(rpc.clone());
        let pump = rpc.clone();
        tokio::spawn(async move {
            while let Some(pkt) = rx.recv().await {
                pump.handle_packet(pkt).await;
            }
        });

        let runner = TaskRunner::new(me.clone(), view, store.clone());
        let k = seed(&store, "gated", &[4, 5, 6]).await;

        // gate the fold on an auxiliary fetch of the same key
        let mut body = bytes::BytesMut::new();
        k.encode(&mut body);
        let gate = rpc.issue(Opcode::GetKey, me, body.freeze()).await?;
        let sum = runner
            .run_gated(TaskKind::ByteSum, vec![k], vec![gate.clone()])
            .await?;
        assert_eq!(sum, 15);
        assert!(gate.done());
        Ok(())
    }

    #[test]
    fn envelope_codec_roundtrip() -> Result<(), NimbusError> {
        let envelope = TaskEnvelope {
            kind: TaskKind::MaxLen,
            keys: TaskKeys::Inline(vec![(b"abc".to_vec(), 2)]),
        };
        let enc = rmp_serde::to_vec(&envelope)?;
        let dec: TaskEnvelope = rmp_serde::from_slice(&enc)?;
        assert_eq!(dec.kind, TaskKind::MaxLen);
        match dec.keys {
            TaskKeys::Inline(list) => {
                assert_eq!(list, vec![(b"abc".to_vec(), 2)]);
            }
            TaskKeys::Published(..) => panic!("wrong variant"),
        }
        Ok(())
    }
}
