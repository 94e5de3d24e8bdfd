//! Membership agreement: a single-decree Paxos variant over the set of
//! live node addresses.
//!
//! The node with the lowest address in the proposed set leads each round:
//! it multicasts `Proposal`, gathers `Promise` votes, and on a strict
//! majority of the proposed set multicasts `Accept`. Acceptors echo
//! `Accepted`, and every node that sees `Accepted` installs the new cloud
//! shape. All handlers are synchronous and return the packets to send,
//! so the server's event loop stays the only driver and scenarios are
//! testable without sockets.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use crate::cloud::{Cloud, CloudView};
use crate::node::{now_ms, Node, NodeAddr, NodeRegistry};
use crate::wire::{ConsensusMsg, Opcode};

use uuid::Uuid;

/// A packet the event loop must send on the consensus layer's behalf,
/// or the decision to terminate the process.
#[derive(Debug)]
pub enum Outbound {
    Multicast(Opcode, bytes::Bytes),
    Unicast(Opcode, NodeAddr, bytes::Bytes),
    /// The locked cloud was reshaped under us. The event loop broadcasts
    /// `Shutdown` and exits.
    Fatal,
}

pub struct Paxos {
    me: Arc<Node>,
    registry: Arc<NodeRegistry>,
    view: Arc<CloudView>,

    /// Nodes silent this long are dropped from the proposed set before
    /// each round.
    laggard_ms: u64,

    /// Highest proposal number seen anywhere.
    proposal_max: u64,
    /// Highest proposal number this node has promised.
    promised_to: u64,
    /// Proposal number of the value this node last accepted.
    accepted_num: u64,
    /// The value last accepted, re-multicast for laggards.
    accepted_msg: Option<ConsensusMsg>,

    /// The member set currently being voted on, sorted by address.
    proposed: BTreeSet<NodeAddr>,
    /// Promise votes gathered while leading the current round.
    promises: HashMap<NodeAddr, u64>,
    /// One `Accept` per round, no matter how many late promises arrive.
    accept_sent: bool,
    /// Millisecond timestamp of the last state change, for stall restarts.
    changed_ms: u64,
}

impl Paxos {
    pub fn new(
        me: Arc<Node>,
        registry: Arc<NodeRegistry>,
        view: Arc<CloudView>,
        laggard_ms: u64,
    ) -> Self {
        let mut proposed = BTreeSet::new();
        proposed.insert(me.addr);
        Paxos {
            me,
            registry,
            view,
            laggard_ms,
            proposal_max: 0,
            promised_to: 0,
            accepted_num: 0,
            accepted_msg: None,
            proposed,
            promises: HashMap::new(),
            accept_sent: false,
            changed_ms: now_ms(),
        }
    }

    fn leader(&self) -> Option<NodeAddr> {
        self.proposed.iter().next().copied()
    }

    fn leading(&self) -> bool {
        self.leader() == Some(self.me.addr)
    }

    fn majority(&self) -> usize {
        self.proposed.len() / 2 + 1
    }

    fn members_vec(&self) -> Vec<NodeAddr> {
        self.proposed.iter().copied().collect()
    }

    /// A freshly heard heartbeat. `announced` is the cloud id the sender
    /// believes it is in.
    pub fn note_heartbeat(
        &mut self,
        sender: &Arc<Node>,
        announced: u128,
    ) -> Vec<Outbound> {
        let current = self.view.current();
        if announced == current.id && current.contains(&sender.addr) {
            return Vec::new();
        }
        if current.contains(&sender.addr) {
            if self.view.is_prev_cloud_id(announced) {
                // a member one round behind; replay the agreement it
                // missed
                if let Some(msg) = &self.accepted_msg {
                    pf_trace!(
                        "member {} announced a prior cloud; replaying \
                         Accepted",
                        sender.addr
                    );
                    return vec![Outbound::Multicast(
                        Opcode::Accepted,
                        msg.encode(),
                    )];
                }
                return Vec::new();
            }
            // a member announcing a cloud this process never formed has
            // diverged; vote it out before restarting
            if self.proposed.remove(&sender.addr) {
                pf_warn!(
                    "member {} announced unknown cloud {:032x}; \
                     reshaping without it",
                    sender.addr,
                    announced
                );
            }
            return self.propose();
        }
        // a node outside the current shape wants in
        if self.proposed.insert(sender.addr) {
            pf_info!("sighted new member {}, starting a round", sender.addr);
        }
        self.propose()
    }

    /// Starts (or restarts) a round over the current proposed set. Only
    /// the would-be leader emits anything; everyone else waits to vote.
    pub fn propose(&mut self) -> Vec<Outbound> {
        self.drop_laggards();
        self.changed_ms = now_ms();
        if !self.leading() {
            self.promises.clear();
            return Vec::new();
        }

        self.proposal_max += 1;
        self.promised_to = self.proposal_max;
        self.promises.clear();
        self.promises.insert(self.me.addr, self.proposal_max);
        self.accept_sent = false;

        let msg = ConsensusMsg {
            promised: self.proposal_max,
            accepted: self.accepted_num,
            cloud_id: 0,
            members: self.members_vec(),
        };
        pf_debug!(
            "leading proposal #{} over {} members",
            self.proposal_max,
            self.proposed.len()
        );
        vec![Outbound::Multicast(Opcode::Proposal, msg.encode())]
    }

    fn drop_laggards(&mut self) {
        let me = self.me.addr;
        let registry = &self.registry;
        let laggard_ms = self.laggard_ms;
        self.proposed.retain(|addr| {
            if *addr == me {
                return true;
            }
            match registry.lookup_addr(addr) {
                Some(n) if n.millis_since_heard() <= laggard_ms => true,
                _ => {
                    pf_warn!("dropping silent member {}", addr);
                    false
                }
            }
        });
    }

    pub fn do_proposal(
        &mut self,
        sender: &Arc<Node>,
        msg: ConsensusMsg,
    ) -> Vec<Outbound> {
        if sender.addr == self.me.addr {
            // our own broadcast looped back; the self-promise already
            // happened at propose time
            return Vec::new();
        }
        if msg.promised > self.proposal_max {
            self.proposal_max = msg.promised;
        }
        if msg.promised <= self.promised_to {
            // an old (or dueling equal-numbered) proposal; tell the
            // proposer where the bar is
            let nack = ConsensusMsg {
                promised: self.promised_to,
                accepted: self.accepted_num,
                cloud_id: 0,
                members: self.members_vec(),
            };
            return vec![Outbound::Unicast(
                Opcode::Nack,
                sender.addr,
                nack.encode(),
            )];
        }

        self.promised_to = msg.promised;
        self.proposed = msg.members.iter().copied().collect();
        self.changed_ms = now_ms();
        let promise = ConsensusMsg {
            promised: msg.promised,
            accepted: self.accepted_num,
            cloud_id: 0,
            members: msg.members,
        };
        vec![Outbound::Unicast(
            Opcode::Promise,
            sender.addr,
            promise.encode(),
        )]
    }

    pub fn do_promise(
        &mut self,
        sender: &Arc<Node>,
        msg: ConsensusMsg,
    ) -> Vec<Outbound> {
        if !self.leading()
            || msg.promised != self.proposal_max
            || self.accept_sent
        {
            return Vec::new();
        }
        // votes count only when cast for exactly this member set
        let theirs: BTreeSet<NodeAddr> =
            msg.members.iter().copied().collect();
        if theirs != self.proposed {
            return Vec::new();
        }

        self.promises.insert(sender.addr, msg.promised);
        if self.promises.len() < self.majority() {
            return Vec::new();
        }

        self.accept_sent = true;
        let accept = ConsensusMsg {
            promised: self.proposal_max,
            accepted: self.proposal_max,
            cloud_id: Uuid::new_v4().as_u128(),
            members: self.members_vec(),
        };
        pf_info!(
            "majority promised #{}; sending Accept for {} members",
            self.proposal_max,
            self.proposed.len()
        );
        vec![Outbound::Multicast(Opcode::Accept, accept.encode())]
    }

    pub fn do_nack(
        &mut self,
        _sender: &Arc<Node>,
        msg: ConsensusMsg,
    ) -> Vec<Outbound> {
        if msg.promised > self.proposal_max {
            self.proposal_max = msg.promised;
        }
        if self.leading() && !self.accept_sent {
            return self.propose();
        }
        Vec::new()
    }

    pub fn do_accept(
        &mut self,
        _sender: &Arc<Node>,
        msg: ConsensusMsg,
    ) -> Vec<Outbound> {
        if msg.promised < self.promised_to {
            return Vec::new();
        }
        self.promised_to = msg.promised;
        self.accepted_num = msg.promised;
        self.proposed = msg.members.iter().copied().collect();
        self.accepted_msg = Some(msg.clone());
        self.changed_ms = now_ms();
        // echo the leader's cloud id so every node converges on one uuid
        vec![Outbound::Multicast(Opcode::Accepted, msg.encode())]
    }

    pub fn do_accepted(
        &mut self,
        _sender: &Arc<Node>,
        msg: ConsensusMsg,
    ) -> Vec<Outbound> {
        let current = self.view.current();
        if msg.cloud_id == current.id || msg.accepted < self.accepted_num {
            return Vec::new();
        }
        self.accepted_num = msg.accepted;
        self.accepted_msg = Some(msg.clone());
        self.proposed = msg.members.iter().copied().collect();
        self.changed_ms = now_ms();

        if !self.proposed.contains(&self.me.addr) {
            // voted off the island: reset and rejoin from scratch
            pf_warn!("excluded from the agreed shape; rejoining");
            self.proposed.clear();
            self.proposed.insert(self.me.addr);
            self.promises.clear();
            self.accept_sent = false;
            self.accepted_num = 0;
            self.accepted_msg = None;
            return Vec::new();
        }

        let new_addrs: HashSet<NodeAddr> =
            msg.members.iter().copied().collect();
        let cur_addrs: HashSet<NodeAddr> =
            current.member_addrs().into_iter().collect();
        if self.view.is_locked() && new_addrs != cur_addrs {
            pf_error!(
                "cloud shape changed after keys were distributed; \
                 cannot continue"
            );
            return vec![Outbound::Fatal];
        }

        let mut members = Vec::with_capacity(msg.members.len());
        for addr in &msg.members {
            match self.registry.intern(*addr) {
                Ok(n) => members.push(n),
                Err(e) => {
                    pf_error!("cannot intern member {}: {}", addr, e);
                    return Vec::new();
                }
            }
        }
        let mut idx = current.idx.wrapping_add(1);
        if idx == 0 {
            idx = 1; // idx 0 is reserved for "no cloud yet"
        }
        let cloud = Arc::new(Cloud::new(msg.cloud_id, members, idx));
        if let Err(e) = self.view.install(cloud) {
            pf_warn!("stale agreement not installed: {}", e);
        } else {
            pf_info!(
                "cloud of {} formed (idx {})",
                self.proposed.len(),
                idx
            );
        }
        Vec::new()
    }

    /// Periodic nudge from the event loop: restart a round that stalled
    /// with the shape still disagreeing with the installed cloud.
    pub fn tick(&mut self, stall_ms: u64) -> Vec<Outbound> {
        let current = self.view.current();
        let cur_addrs: BTreeSet<NodeAddr> =
            current.member_addrs().into_iter().collect();
        if self.proposed == cur_addrs {
            return Vec::new();
        }
        if now_ms().saturating_sub(self.changed_ms) < stall_ms {
            return Vec::new();
        }
        self.propose()
    }
}

#[cfg(test)]
mod paxos_tests {
    use super::*;
    use crate::utils::NimbusError;
    use std::net::Ipv4Addr;

    fn addr(last: u8) -> NodeAddr {
        NodeAddr::new(Ipv4Addr::new(127, 0, 0, last), 7000)
    }

    struct Sim {
        node: Arc<Node>,
        paxos: Paxos,
    }

    fn sim(last: u8, peers: &[u8]) -> Result<Sim, NimbusError> {
        let registry = Arc::new(NodeRegistry::new());
        let node = registry.intern(addr(last))?;
        node.heard_from();
        for p in peers {
            registry.intern(addr(*p))?.heard_from();
        }
        let view = Arc::new(CloudView::new(Arc::new(Cloud::new(
            0,
            vec![node.clone()],
            1,
        ))));
        let paxos =
            Paxos::new(node.clone(), registry, view, 60_000);
        Ok(Sim { node, paxos })
    }

    fn decode_out(out: &Outbound) -> (Opcode, ConsensusMsg) {
        match out {
            Outbound::Multicast(op, b) => {
                (*op, ConsensusMsg::decode(b.clone()).unwrap())
            }
            Outbound::Unicast(op, _, b) => {
                (*op, ConsensusMsg::decode(b.clone()).unwrap())
            }
            Outbound::Fatal => panic!("unexpected fatal"),
        }
    }

    #[test]
    fn three_nodes_agree() -> Result<(), NimbusError> {
        let mut a = sim(1, &[2, 3])?; // lowest address leads
        let mut b = sim(2, &[1, 3])?;
        let mut c = sim(3, &[1, 2])?;

        // the leader hears both newcomers announce no cloud
        let b_node = a.paxos.registry.intern(addr(2))?;
        let c_node = a.paxos.registry.intern(addr(3))?;
        assert!(!a.paxos.note_heartbeat(&b_node, 0).is_empty());
        let out = a.paxos.note_heartbeat(&c_node, 0);
        let (op, proposal) = decode_out(&out[0]);
        assert_eq!(op, Opcode::Proposal);
        assert_eq!(proposal.members.len(), 3);

        // acceptors vote
        let a_in_b = b.paxos.registry.intern(addr(1))?;
        let a_in_c = c.paxos.registry.intern(addr(1))?;
        let pb = b.paxos.do_proposal(&a_in_b, proposal.clone());
        let pc = c.paxos.do_proposal(&a_in_c, proposal.clone());
        let (op_b, promise_b) = decode_out(&pb[0]);
        let (op_c, promise_c) = decode_out(&pc[0]);
        assert_eq!(op_b, Opcode::Promise);
        assert_eq!(op_c, Opcode::Promise);

        // first remote promise completes the majority of three
        let out = a.paxos.do_promise(&b_node, promise_b);
        let (op, accept) = decode_out(&out[0]);
        assert_eq!(op, Opcode::Accept);
        assert_ne!(accept.cloud_id, 0);
        // the late promise must not trigger a second Accept
        assert!(a.paxos.do_promise(&c_node, promise_c).is_empty());

        // everyone sees Accept, echoes Accepted, installs
        for s in [&mut a, &mut b, &mut c] {
            let leader = s.paxos.registry.intern(addr(1))?;
            let echoed = s.paxos.do_accept(&leader, accept.clone());
            let (op, accepted) = decode_out(&echoed[0]);
            assert_eq!(op, Opcode::Accepted);
            assert!(s.paxos.do_accepted(&leader, accepted).is_empty());
            let cloud = s.paxos.view.current();
            assert_eq!(cloud.id, accept.cloud_id);
            assert_eq!(cloud.size(), 3);
            assert_eq!(cloud.idx, 2);
            assert!(cloud.contains(&s.node.addr));
        }
        Ok(())
    }

    #[test]
    fn minority_of_promises_never_commits() -> Result<(), NimbusError> {
        let mut a = sim(1, &[2, 3, 4, 5])?;
        for p in 2..=5 {
            let n = a.paxos.registry.intern(addr(p))?;
            a.paxos.note_heartbeat(&n, 0);
        }
        assert_eq!(a.paxos.proposed.len(), 5);
        assert!(a.paxos.leading());

        // one remote promise plus self is 2 of 5: short of a majority
        let voter = a.paxos.registry.intern(addr(2))?;
        let vote = ConsensusMsg {
            promised: a.paxos.proposal_max,
            accepted: 0,
            cloud_id: 0,
            members: a.paxos.members_vec(),
        };
        assert!(a.paxos.do_promise(&voter, vote.clone()).is_empty());
        // a third vote (3 of 5) crosses the line
        let voter3 = a.paxos.registry.intern(addr(3))?;
        let out = a.paxos.do_promise(&voter3, vote);
        assert_eq!(decode_out(&out[0]).0, Opcode::Accept);
        Ok(())
    }

    #[test]
    fn equal_proposal_number_gets_nacked() -> Result<(), NimbusError> {
        let mut b = sim(2, &[1, 3])?;
        let first = b.paxos.registry.intern(addr(1))?;
        let rival = b.paxos.registry.intern(addr(3))?;
        let prop = ConsensusMsg {
            promised: 7,
            accepted: 0,
            cloud_id: 0,
            members: vec![addr(1), addr(2), addr(3)],
        };
        let out = b.paxos.do_proposal(&first, prop.clone());
        assert_eq!(decode_out(&out[0]).0, Opcode::Promise);

        // a dueling leader at the same number must not also collect this
        // acceptor's promise
        let out = b.paxos.do_proposal(&rival, prop);
        let (op, nack) = decode_out(&out[0]);
        assert_eq!(op, Opcode::Nack);
        assert_eq!(nack.promised, 7);
        Ok(())
    }

    #[test]
    fn own_proposal_loopback_ignored() -> Result<(), NimbusError> {
        let mut a = sim(1, &[2])?;
        let n = a.paxos.registry.intern(addr(2))?;
        let out = a.paxos.note_heartbeat(&n, 0);
        let (_, proposal) = decode_out(&out[0]);

        // the leader's own multicast comes back around; it already
        // promised itself this number and must not self-nack
        let me = a.node.clone();
        assert!(a.paxos.do_proposal(&me, proposal).is_empty());
        assert!(a.paxos.leading());
        Ok(())
    }

    #[test]
    fn diverged_member_dropped_from_proposal() -> Result<(), NimbusError> {
        let mut a = sim(1, &[2])?;
        let n = a.paxos.registry.intern(addr(2))?;
        a.paxos.note_heartbeat(&n, 0);

        // drive the two-node agreement to completion on a alone
        let vote = ConsensusMsg {
            promised: a.paxos.proposal_max,
            accepted: 0,
            cloud_id: 0,
            members: a.paxos.members_vec(),
        };
        let out = a.paxos.do_promise(&n, vote);
        let (_, accept) = decode_out(&out[0]);
        let echoed = a.paxos.do_accept(&n, accept);
        let (_, accepted) = decode_out(&echoed[0]);
        a.paxos.do_accepted(&n, accepted);
        assert!(a.paxos.view.current().contains(&addr(2)));
        assert!(a.paxos.proposed.contains(&addr(2)));

        // the member announces a cloud this process never formed: it is
        // voted out and a reshape round starts without it
        let out = a.paxos.note_heartbeat(&n, 0xDEAD_BEEF);
        assert!(!a.paxos.proposed.contains(&addr(2)));
        let (op, proposal) = decode_out(&out[0]);
        assert_eq!(op, Opcode::Proposal);
        assert_eq!(proposal.members, vec![addr(1)]);
        Ok(())
    }

    #[test]
    fn mismatched_member_set_vote_ignored() -> Result<(), NimbusError> {
        let mut a = sim(1, &[2, 3])?;
        for p in 2..=3 {
            let n = a.paxos.registry.intern(addr(p))?;
            a.paxos.note_heartbeat(&n, 0);
        }
        let voter = a.paxos.registry.intern(addr(2))?;
        let stale_vote = ConsensusMsg {
            promised: a.paxos.proposal_max,
            accepted: 0,
            cloud_id: 0,
            members: vec![addr(1), addr(2)], // missing addr(3)
        };
        assert!(a.paxos.do_promise(&voter, stale_vote).is_empty());
        assert!(!a.paxos.accept_sent);
        Ok(())
    }

    #[test]
    fn nack_raises_proposal_number() -> Result<(), NimbusError> {
        let mut a = sim(1, &[2])?;
        let n = a.paxos.registry.intern(addr(2))?;
        a.paxos.note_heartbeat(&n, 0);
        let first_num = a.paxos.proposal_max;

        let nack = ConsensusMsg {
            promised: 40,
            accepted: 0,
            cloud_id: 0,
            members: a.paxos.members_vec(),
        };
        let out = a.paxos.do_nack(&n, nack);
        let (op, retry) = decode_out(&out[0]);
        assert_eq!(op, Opcode::Proposal);
        assert!(retry.promised > 40);
        assert!(retry.promised > first_num);
        Ok(())
    }

    #[test]
    fn locked_cloud_reshape_is_fatal() -> Result<(), NimbusError> {
        let mut a = sim(1, &[2])?;
        let n = a.paxos.registry.intern(addr(2))?;
        a.paxos.view.lock();

        let agreed = ConsensusMsg {
            promised: 9,
            accepted: 9,
            cloud_id: Uuid::new_v4().as_u128(),
            members: vec![addr(1), addr(2)],
        };
        let out = a.paxos.do_accepted(&n, agreed);
        assert!(matches!(out[0], Outbound::Fatal));
        Ok(())
    }

    #[test]
    fn exclusion_resets_to_rejoin() -> Result<(), NimbusError> {
        let mut a = sim(5, &[1, 2])?;
        let n = a.paxos.registry.intern(addr(1))?;
        a.paxos.note_heartbeat(&n, 0);

        let without_me = ConsensusMsg {
            promised: 9,
            accepted: 9,
            cloud_id: Uuid::new_v4().as_u128(),
            members: vec![addr(1), addr(2)],
        };
        assert!(a.paxos.do_accepted(&n, without_me).is_empty());
        assert_eq!(a.paxos.proposed.len(), 1);
        assert!(a.paxos.proposed.contains(&a.node.addr));
        assert_eq!(a.paxos.accepted_num, 0);
        // the installed view is untouched; rejoining restarts from it
        assert_eq!(a.paxos.view.current().size(), 1);
        Ok(())
    }

    #[test]
    fn behind_peer_gets_replay() -> Result<(), NimbusError> {
        let mut a = sim(1, &[2])?;
        let n = a.paxos.registry.intern(addr(2))?;
        a.paxos.note_heartbeat(&n, 0);

        // drive a two-node agreement to completion on a alone
        let vote = ConsensusMsg {
            promised: a.paxos.proposal_max,
            accepted: 0,
            cloud_id: 0,
            members: a.paxos.members_vec(),
        };
        let out = a.paxos.do_promise(&n, vote);
        let (_, accept) = decode_out(&out[0]);
        let echoed = a.paxos.do_accept(&n, accept);
        let (_, accepted) = decode_out(&echoed[0]);
        a.paxos.do_accepted(&n, accepted);
        assert_eq!(a.paxos.view.current().size(), 2);

        // n still announces the boot view's id, now only in history;
        // the agreement it missed is replayed wholesale
        let out = a.paxos.note_heartbeat(&n, 0);
        let (op, replay) = decode_out(&out[0]);
        assert_eq!(op, Opcode::Accepted);
        assert_eq!(replay.cloud_id, a.paxos.view.current().id);
        Ok(())
    }
}
