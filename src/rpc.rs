//! Reliable call layer: turns unreliable datagrams into retried,
//! deduplicated, at-most-once-effect remote calls.
//!
//! Sender side: every call gets a never-reused task id, is framed and
//! sent, and sits in the pending table where a sweeper retransmits it on
//! an exponentially growing interval until an `Ack` arrives or the target
//! leaves the cloud (a `Cancelled` terminal state, not an error). Receiver
//! side: repeats of an answered task id get the cached answer resent
//! verbatim; repeats of an in-flight task id are dropped; an `AckAck`
//! releases the cached answer. Oversized payloads ride the TCP bulk
//! channel instead of fragmenting.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use crate::cloud::CloudView;
use crate::msg::{BulkHub, Packet, UdpHub};
use crate::node::{now_ms, Node, NodeId};
use crate::utils::NimbusError;
use crate::wire::{self, Opcode};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use rand::Rng;
use tokio::sync::watch;
use tokio::time::{self, Duration, MissedTickBehavior};

/// Process-local, never-reused reliable-call identifier.
pub type TaskId = u32;

/// How often the retry sweeper scans the pending table.
const SWEEP_INTERVAL_MS: u64 = 100;

/// Terminal state of a reliable call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallOutcome {
    /// The target answered; payload is the answer bytes.
    Answered(Bytes),
    /// The target left the cloud (or the call was cancelled) before
    /// answering. A valid terminal state callers must branch on, distinct
    /// from an empty answer.
    Cancelled,
}

/// One in-flight reliable call.
#[derive(Debug)]
pub struct Call {
    pub task: TaskId,
    pub op: Opcode,
    pub target: Arc<Node>,

    /// Preframed datagram, retransmitted verbatim; empty for TCP calls.
    frame: Bytes,
    /// Original request body (re-sent over TCP; also inspected by the
    /// store's pending-write peek).
    body: Bytes,
    via_tcp: bool,

    outcome: watch::Sender<Option<CallOutcome>>,
    retry_ms: AtomicU64,
    next_due_ms: AtomicU64,
}

impl Call {
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn done(&self) -> bool {
        self.outcome.borrow().is_some()
    }

    fn settle(&self, o: CallOutcome) {
        self.outcome.send_replace(Some(o));
    }

    /// Waits for the call's terminal state. Many waiters may block on the
    /// same call (coalesced remote gets).
    pub async fn outcome(&self) -> CallOutcome {
        let mut rx = self.outcome.subscribe();
        loop {
            if let Some(o) = rx.borrow().clone() {
                return o;
            }
            if rx.changed().await.is_err() {
                return CallOutcome::Cancelled;
            }
        }
    }
}

/// Serving side of a reliable-call opcode. Implementations must be
/// idempotent-friendly: the layer guarantees at most one execution per
/// (sender, task id), but the same logical request may arrive again under
/// a fresh task id after a sender reboot.
#[async_trait]
pub trait RemoteHandler: Send + Sync {
    async fn serve(
        &self,
        sender: Arc<Node>,
        body: Bytes,
    ) -> Result<Bytes, NimbusError>;
}

/// Hub owning both directions of the reliable call protocol.
pub struct RpcHub {
    udp: Arc<UdpHub>,
    bulk: Arc<BulkHub>,
    cloud: Arc<CloudView>,
    retry_base_ms: u64,

    next_task: AtomicU32,
    /// Sender side: calls awaiting an answer, keyed by task id.
    pending: DashMap<TaskId, Arc<Call>>,

    /// Receiver side: answers produced but not yet acknowledged, keyed by
    /// (sender, task id) and resent verbatim on request repeats.
    answered: DashMap<(NodeId, TaskId), Bytes>,
    /// Receiver side: requests currently executing; repeats are dropped.
    working: DashMap<(NodeId, TaskId), ()>,

    handlers: DashMap<Opcode, Arc<dyn RemoteHandler>>,
}

impl RpcHub {
    /// Creates the hub and spawns its retry sweeper.
    pub fn new_and_setup(
        udp: Arc<UdpHub>,
        bulk: Arc<BulkHub>,
        cloud: Arc<CloudView>,
        retry_base_ms: u64,
    ) -> Arc<RpcHub> {
        let hub = Arc::new(RpcHub {
            udp,
            bulk,
            cloud,
            retry_base_ms,
            next_task: AtomicU32::new(1),
            pending: DashMap::new(),
            answered: DashMap::new(),
            working: DashMap::new(),
            handlers: DashMap::new(),
        });

        let sweeper = hub.clone();
        tokio::spawn(async move {
            let mut ticker =
                time::interval(Duration::from_millis(SWEEP_INTERVAL_MS));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                sweeper.sweep_retries().await;
            }
        });
        hub
    }

    /// Registers the serving side of a request opcode. Must happen before
    /// the first request of that opcode arrives; wiring order at node
    /// setup guarantees this.
    pub fn register_handler(
        &self,
        op: Opcode,
        handler: Arc<dyn RemoteHandler>,
    ) {
        self.handlers.insert(op, handler);
    }

    /// Starts a reliable call and returns its handle after the first send
    /// attempt. The handle may be awaited by any number of waiters.
    pub async fn issue(
        &self,
        op: Opcode,
        target: Arc<Node>,
        body: Bytes,
    ) -> Result<Arc<Call>, NimbusError> {
        let call = self.begin(op, target, body);
        self.transmit(&call).await;
        Ok(call)
    }

    /// Registers a call without sending it, for callers that must publish
    /// the handle (e.g. into a coalescing table) before the first
    /// transmit. Follow up with `kick`; the retry sweeper covers the call
    /// either way.
    pub fn begin(&self, op: Opcode, target: Arc<Node>, body: Bytes) -> Arc<Call> {
        let task = self.next_task.fetch_add(1, Ordering::SeqCst);
        let via_tcp = wire::DATA_OFF + body.len() > wire::MTU;
        let frame = if via_tcp {
            Bytes::new()
        } else {
            wire::task_frame(op, self.udp.my_addr().port, task, &body)
        };

        // jitter the first retry so herds of calls started together do
        // not retransmit in lockstep
        let jitter = rand::thread_rng().gen_range(0..=self.retry_base_ms / 4);
        let (tx, _) = watch::channel(None);
        let call = Arc::new(Call {
            task,
            op,
            target,
            frame,
            body,
            via_tcp,
            outcome: tx,
            retry_ms: AtomicU64::new(self.retry_base_ms),
            next_due_ms: AtomicU64::new(
                now_ms() + self.retry_base_ms + jitter,
            ),
        });
        self.pending.insert(task, call.clone());
        call
    }

    /// First transmission of a call created with `begin`.
    pub async fn kick(&self, call: &Call) {
        self.transmit(call).await;
    }

    /// Issues a call and blocks for its terminal state.
    pub async fn call(
        &self,
        op: Opcode,
        target: Arc<Node>,
        body: Bytes,
    ) -> Result<CallOutcome, NimbusError> {
        let call = self.issue(op, target, body).await?;
        Ok(call.outcome().await)
    }

    /// Cancels a pending call: the local wait is abandoned, any in-flight
    /// remote execution keeps running.
    pub fn cancel(&self, task: TaskId) {
        if let Some((_, call)) = self.pending.remove(&task) {
            call.settle(CallOutcome::Cancelled);
        }
    }

    /// Looks for a pending call matching a predicate (used for the
    /// store's same-node read-your-writes peek).
    pub fn find_pending(
        &self,
        pred: impl Fn(&Call) -> bool,
    ) -> Option<Arc<Call>> {
        self.pending
            .iter()
            .find(|e| pred(e.value()))
            .map(|e| e.value().clone())
    }

    /// A peer announced a fresh process start: its per-sender dedup state
    /// is meaningless now.
    pub fn peer_rebooted(&self, node: &Node) {
        self.answered.retain(|(id, _), _| *id != node.id);
        self.working.retain(|(id, _), _| *id != node.id);
    }

    /// One send attempt, UDP or TCP by size.
    async fn transmit(&self, call: &Call) {
        let res = if call.via_tcp {
            self.bulk
                .send(call.target.addr, call.op, call.task, &call.body)
                .await
        } else {
            self.udp.send_frame(&call.frame, call.target.addr).await
        };
        if let Err(e) = res {
            // transient; the sweeper will retransmit
            pf_trace!(
                "send of task {} to {} failed: {}",
                call.task,
                call.target.addr,
                e
            );
        }
    }

    /// Scans the pending table: cancels calls whose target left the
    /// cloud, retransmits calls past their backoff deadline.
    async fn sweep_retries(&self) {
        let cloud = self.cloud.current();
        let now = now_ms();
        let mut cancelled = Vec::new();
        let mut due = Vec::new();
        for entry in self.pending.iter() {
            let call = entry.value();
            if call.done() {
                cancelled.push(call.task);
            } else if !cloud.contains(&call.target.addr) {
                pf_debug!(
                    "cancelling task {}: target {} left the cloud",
                    call.task,
                    call.target.addr
                );
                call.settle(CallOutcome::Cancelled);
                cancelled.push(call.task);
            } else if now >= call.next_due_ms.load(Ordering::Relaxed) {
                due.push(call.clone());
            }
        }
        for task in cancelled {
            self.pending.remove(&task);
        }
        for call in due {
            let retry =
                call.retry_ms.load(Ordering::Relaxed).saturating_mul(2);
            call.retry_ms.store(retry, Ordering::Relaxed);
            call.next_due_ms.store(now + retry, Ordering::Relaxed);
            pf_trace!(
                "retransmitting task {} to {} (next in {}ms)",
                call.task,
                call.target.addr,
                retry
            );
            self.transmit(&call).await;
        }
    }

    /// Entry point for all task-bearing packets from the router.
    pub async fn handle_packet(self: &Arc<Self>, pkt: Packet) {
        match pkt.op {
            Opcode::Ack => self.handle_answer(pkt).await,
            Opcode::AckAck => {
                self.answered.remove(&(pkt.sender.id, pkt.task));
            }
            op if op.is_request() => self.handle_request(pkt),
            op => pf_warn!("unexpected opcode {:?} in call layer", op),
        }
    }

    /// An answer arrived for one of our calls; settle it and release the
    /// answerer's dedup state.
    async fn handle_answer(&self, pkt: Packet) {
        if let Some((_, call)) = self.pending.remove(&pkt.task) {
            call.settle(CallOutcome::Answered(pkt.body));
        }
        // always ack the ack, even for calls we no longer remember, so
        // the answerer can release its cached answer
        let ackack = wire::task_frame(
            Opcode::AckAck,
            self.udp.my_addr().port,
            pkt.task,
            &[],
        );
        if let Err(e) =
            self.udp.send_frame(&ackack, pkt.sender.addr).await
        {
            pf_trace!("ackack to {} failed: {}", pkt.sender.addr, e);
        }
    }

    /// An inbound request: dedup, then execute on a spawned task so the
    /// packet loop never blocks behind a slow handler.
    fn handle_request(self: &Arc<Self>, pkt: Packet) {
        let dedup_key = (pkt.sender.id, pkt.task);
        if let Some(ans) = self.answered.get(&dedup_key) {
            // answered before; the first answer (or its ackack) was lost.
            // resend the cached answer, never recompute.
            let ans = ans.value().clone();
            let hub = self.clone();
            tokio::spawn(async move {
                hub.send_answer(&pkt.sender, pkt.task, ans).await;
            });
            return;
        }
        if self.working.insert(dedup_key, ()).is_some() {
            // already executing; the repeat is redundant
            return;
        }
        let Some(handler) = self.handlers.get(&pkt.op).map(|h| h.clone())
        else {
            self.working.remove(&dedup_key);
            pf_warn!("no handler for request opcode {:?}", pkt.op);
            return;
        };

        let hub = self.clone();
        tokio::spawn(async move {
            match handler.serve(pkt.sender.clone(), pkt.body).await {
                Ok(ans) => {
                    hub.answered.insert(dedup_key, ans.clone());
                    hub.working.remove(&dedup_key);
                    hub.send_answer(&pkt.sender, pkt.task, ans).await;
                }
                Err(e) => {
                    // drop the request; the sender keeps retrying and a
                    // later attempt may succeed
                    hub.working.remove(&dedup_key);
                    pf_warn!(
                        "request {:?} task {} from {} failed: {}",
                        pkt.op,
                        pkt.task,
                        pkt.sender.addr,
                        e
                    );
                }
            }
        });
    }

    /// Sends an answer frame, falling back to the bulk channel when the
    /// answer itself is oversized.
    async fn send_answer(&self, to: &Arc<Node>, task: TaskId, ans: Bytes) {
        let res = if wire::DATA_OFF + ans.len() > wire::MTU {
            self.bulk.send(to.addr, Opcode::Ack, task, &ans).await
        } else {
            let frame = wire::task_frame(
                Opcode::Ack,
                self.udp.my_addr().port,
                task,
                &ans,
            );
            self.udp.send_frame(&frame, to.addr).await
        };
        if let Err(e) = res {
            pf_trace!("answer for task {} to {} failed: {}", task, to.addr, e);
        }
    }
}
