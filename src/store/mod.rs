//! The replicated key/value store: a concurrent local map plus home-node
//! routing, weak-clock ordering, push replication, tombstoned deletes,
//! arraylet fan-out, and the retry-until-CAS atomic update primitive.

mod chunks;
mod clock;
mod key;
mod memman;
mod persist;
mod update;
mod value;

pub use chunks::CHUNK_UNIT;
pub use clock::WeakClock;
pub use key::{
    CloudInfo, Key, CLASS_ARRAYLET, CLASS_KEY_OF_KEYS, CLASS_USER_MIN,
    DEFAULT_DESIRED, MAX_KEY_LEN,
};
pub use memman::MemGauge;
pub use persist::{MemBackend, Persistence};
pub use update::UpdateKind;
pub use value::Value;

use std::sync::Arc;
use std::sync::OnceLock;

use crate::cloud::{Cloud, CloudView};
use crate::node::Node;
use crate::rpc::{Call, CallOutcome, RemoteHandler, RpcHub};
use crate::utils::NimbusError;
use crate::wire::Opcode;

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::time::{self, Duration};
use uuid::Uuid;

/// Encodes a key/value pair for `PutKey`/`HazKey` bodies.
fn encode_kv(key: &Key, val: &Value) -> Bytes {
    let mut buf = BytesMut::new();
    key.encode(&mut buf);
    val.encode(&mut buf);
    buf.freeze()
}

fn decode_kv(mut body: Bytes) -> Result<(Key, Value), NimbusError> {
    let key = Key::decode(&mut body)?;
    let val = Value::decode(&mut body)?;
    Ok((key, val))
}

/// Cheaply extracts the key name bytes from an encoded key/value body
/// without fully decoding it (pending-write peek).
fn peek_kv_key(body: &Bytes) -> Option<Bytes> {
    if body.len() < 3 {
        return None;
    }
    let len = u16::from_le_bytes([body[1], body[2]]) as usize;
    (body.len() >= 3 + len).then(|| body.slice(3..3 + len))
}

/// Body of a shipped atomic update.
#[derive(Debug, Serialize, Deserialize)]
struct AtomicShip {
    key: Vec<u8>,
    desired: u8,
    kind: UpdateKind,
}

pub struct Store {
    me: Arc<Node>,
    cloud: Arc<CloudView>,
    persist: Arc<dyn Persistence>,
    gauge: Arc<MemGauge>,
    rpc: OnceLock<Arc<RpcHub>>,

    /// Intern table: one canonical `Arc<Key>` per name.
    keys: DashMap<Bytes, Arc<Key>>,
    /// The local map. Values are replaced whole, never mutated in place.
    vals: DashMap<Bytes, Arc<Value>>,
    /// At most one in-flight remote fetch per key; waiters share it.
    pending_gets: DashMap<Bytes, Arc<Call>>,
    /// Keys with unfinished writeback / replication / deletion work.
    dirty: DashMap<Bytes, ()>,
}

impl Store {
    pub fn new(
        me: Arc<Node>,
        cloud: Arc<CloudView>,
        persist: Arc<dyn Persistence>,
        gauge: Arc<MemGauge>,
    ) -> Arc<Store> {
        Arc::new(Store {
            me,
            cloud,
            persist,
            gauge,
            rpc: OnceLock::new(),
            keys: DashMap::new(),
            vals: DashMap::new(),
            pending_gets: DashMap::new(),
            dirty: DashMap::new(),
        })
    }

    /// Attaches the call layer and registers the store's serving side.
    pub fn wire_rpc(self: &Arc<Self>, rpc: Arc<RpcHub>) {
        rpc.register_handler(
            Opcode::GetKey,
            Arc::new(GetKeyHandler(self.clone())),
        );
        rpc.register_handler(
            Opcode::PutKey,
            Arc::new(PutKeyHandler(self.clone())),
        );
        rpc.register_handler(
            Opcode::HazKey,
            Arc::new(HazKeyHandler(self.clone())),
        );
        rpc.register_handler(
            Opcode::AtomicUpdate,
            Arc::new(AtomicHandler(self.clone())),
        );
        let _ = self.rpc.set(rpc);
    }

    pub(crate) fn rpc_hub(&self) -> Result<&Arc<RpcHub>, NimbusError> {
        self.rpc
            .get()
            .ok_or_else(|| NimbusError::msg("call layer not attached"))
    }

    /// Canonicalizes a key against the local intern table.
    pub fn intern(&self, key: Key) -> Arc<Key> {
        match self.keys.entry(key.bytes().clone()) {
            Entry::Occupied(e) => e.get().clone(),
            Entry::Vacant(v) => {
                let key = Arc::new(key);
                v.insert(key.clone());
                key
            }
        }
    }

    pub fn make_user_key(
        &self,
        bytes: Bytes,
    ) -> Result<Arc<Key>, NimbusError> {
        Ok(self.intern(Key::user(bytes, DEFAULT_DESIRED)?))
    }

    fn stamp(&self) -> WeakClock {
        WeakClock::new(self.me.addr.ip, self.me.next_clock())
    }

    pub fn key_count(&self) -> usize {
        self.vals.len()
    }

    pub fn cached_bytes(&self) -> u64 {
        self.gauge.cached()
    }

    fn lookup(&self, key: &Key) -> Option<Arc<Value>> {
        self.vals.get(key.bytes()).map(|e| e.value().clone())
    }

    /// The one physical install point: compare-and-swap of the whole
    /// value reference. Succeeds iff the map still holds exactly
    /// `expected`. Returns the displaced buffer's length for accounting.
    pub(crate) fn put_if_match(
        &self,
        key: &Arc<Key>,
        new: Arc<Value>,
        expected: Option<&Arc<Value>>,
    ) -> Result<u64, Option<Arc<Value>>> {
        match self.vals.entry(key.bytes().clone()) {
            Entry::Occupied(mut e) => match expected {
                Some(exp) if Arc::ptr_eq(e.get(), exp) => {
                    let old_len =
                        e.get().peek_mem().map_or(0, |b| b.len() as u64);
                    e.insert(new);
                    Ok(old_len)
                }
                _ => Err(Some(e.get().clone())),
            },
            Entry::Vacant(v) => {
                if expected.is_some() {
                    return Err(None);
                }
                v.insert(new);
                Ok(0)
            }
        }
    }

    /// Installs a value locally under weak-clock ordering, retrying the
    /// CAS until a terminal outcome. Returns the value that ended up
    /// winning (the argument, or a newer incumbent it lost to).
    pub(crate) async fn put_local(
        &self,
        key: &Arc<Key>,
        new: Arc<Value>,
        mark_dirty: bool,
    ) -> Arc<Value> {
        self.keys
            .entry(key.bytes().clone())
            .or_insert_with(|| key.clone());
        let new_len = new.peek_mem().map_or(0, |b| b.len() as u64);
        self.gauge.alloc(new_len).await;

        loop {
            let cur = self.lookup(key);
            if let Some(c) = &cur {
                if c.same_write(&new) {
                    // a racing duplicate of the same write collapses to
                    // a successful no-op
                    self.gauge.release(new_len);
                    return c.clone();
                }
                if new.clock.happens_before(&c.clock) {
                    // late-arriving older update from the same writer
                    self.gauge.release(new_len);
                    return c.clone();
                }
            }
            match self.put_if_match(key, new.clone(), cur.as_ref()) {
                Ok(old_len) => {
                    self.gauge.release(old_len);
                    key.clear_replicas();
                    key.note_mem_replica(self.me.id);
                    if mark_dirty {
                        self.dirty.insert(key.bytes().clone(), ());
                    }
                    return new;
                }
                Err(_) => continue,
            }
        }
    }

    /// Installs locally, then ships the write to the key's home when that
    /// is another node. Tombstones ride the same path as data.
    async fn distribute(
        &self,
        key: &Arc<Key>,
        val: Arc<Value>,
    ) -> Result<(), NimbusError> {
        let winner = self.put_local(key, val.clone(), true).await;
        if !Arc::ptr_eq(&winner, &val) {
            // lost locally; nothing of ours to ship
            return Ok(());
        }
        let cloud = self.cloud.current();
        let info = key
            .cloud_info(&cloud, &self.me.addr)
            .ok_or_else(|| NimbusError::msg("empty cloud"))?;
        let home = cloud.members[info.home].clone();
        if home.id == self.me.id {
            return Ok(());
        }

        // keys are leaving this node: the cloud shape is now load-bearing
        self.cloud.lock();
        let body = encode_kv(key, &val);
        match self.rpc_hub()?.call(Opcode::PutKey, home.clone(), body).await? {
            CallOutcome::Answered(_) => {
                key.note_mem_replica(home.id);
                Ok(())
            }
            CallOutcome::Cancelled => {
                pf_warn!(
                    "home {} left during put; sweeper will re-route",
                    home.addr
                );
                Ok(())
            }
        }
    }

    /// Weak put: stamps the bytes with this node's clock and distributes.
    /// Values past two chunk units fan out into arraylets.
    pub async fn put(
        &self,
        key: &Arc<Key>,
        bytes: Bytes,
    ) -> Result<(), NimbusError> {
        if chunks::needs_chunking(bytes.len() as u64) {
            return self.put_arraylet(key, bytes).await;
        }
        let val = Arc::new(Value::new(bytes, self.stamp()));
        self.distribute(key, val).await
    }

    async fn put_arraylet(
        &self,
        key: &Arc<Key>,
        bytes: Bytes,
    ) -> Result<(), NimbusError> {
        let total = bytes.len() as u64;
        for i in 0..chunks::chunk_count(total) {
            let ck = self.intern(chunks::chunk_key(key, i)?);
            let slice = chunks::chunk_slice(&bytes, i);
            let val = Arc::new(Value::new(slice, self.stamp()));
            self.distribute(&ck, val).await?;
        }
        let head = Arc::new(Value::arraylet(total, self.stamp()));
        self.distribute(key, head).await
    }

    /// Tombstones a key. The tombstone's clock is allocated *before* the
    /// old value is read, so any in-flight put that read earlier is
    /// guaranteed to lose the race (no lost-delete anomaly).
    pub async fn remove(&self, key: &Arc<Key>) -> Result<(), NimbusError> {
        let tomb = Arc::new(Value::tombstone(self.stamp()));
        let old = self.lookup(key);
        if let Some(old) = old {
            if old.is_arraylet() {
                for i in 0..chunks::chunk_count(old.max_len()) {
                    let ck = self.intern(chunks::chunk_key(key, i)?);
                    let ct = Arc::new(Value::tombstone(self.stamp()));
                    self.distribute(&ck, ct).await?;
                }
            }
        }
        self.distribute(key, tomb).await
    }

    /// Weakly consistent get: local map, lazy disk reconstruction, then a
    /// coalesced remote fetch from the key's home. Arraylet heads
    /// reassemble their chunks.
    pub async fn get(
        &self,
        key: &Arc<Key>,
    ) -> Result<Option<Bytes>, NimbusError> {
        match self.get_value(key).await? {
            None => Ok(None),
            Some(v) if v.is_arraylet() => {
                Ok(Some(self.assemble(key, &v).await?))
            }
            Some(v) => self.resident_bytes(key, &v).await,
        }
    }

    /// The value's bytes, reloading from the persistence backend when the
    /// in-memory buffer was evicted.
    async fn resident_bytes(
        &self,
        key: &Arc<Key>,
        val: &Arc<Value>,
    ) -> Result<Option<Bytes>, NimbusError> {
        if let Some(b) = val.mem() {
            return Ok(Some(b));
        }
        if !val.is_on_disk() {
            return Ok(None);
        }
        let len = val.max_len() as usize;
        self.gauge.alloc(len as u64).await;
        let bytes = match self.persist.load(key, len).await {
            Ok(b) => b,
            Err(e) => {
                self.gauge.release(len as u64);
                return Err(e);
            }
        };
        if !val.grow_mem(bytes.clone()) {
            // someone re-cached a longer buffer meanwhile
            self.gauge.release(len as u64);
        }
        Ok(Some(bytes))
    }

    async fn get_value(
        &self,
        key: &Arc<Key>,
    ) -> Result<Option<Arc<Value>>, NimbusError> {
        if let Some(v) = self.lookup(key) {
            if v.is_tombstone() {
                return Ok(None);
            }
            return Ok(Some(v));
        }

        // disk-resident chunk never seen by this map? let the backend
        // reconstruct it lazily
        if let Some(bytes) = self.persist.manifest(key).await? {
            let v = Arc::new(Value::new(bytes, WeakClock::NONE));
            v.set_on_disk(self.persist.backend_id());
            let w = self.put_local(key, v, false).await;
            return Ok((!w.is_tombstone()).then_some(w));
        }

        let cloud = self.cloud.current();
        let info = key
            .cloud_info(&cloud, &self.me.addr)
            .ok_or_else(|| NimbusError::msg("empty cloud"))?;
        let home = cloud.members[info.home].clone();
        if home.id == self.me.id {
            // we are the authority and we have nothing
            return Ok(None);
        }

        // pending-write peek: if our own put to this key is still in
        // flight, answer from it (read-your-writes on one node)
        if let Some(call) = self.rpc_hub()?.find_pending(|c| {
            c.op == Opcode::PutKey
                && peek_kv_key(c.body()).as_ref() == Some(key.bytes())
        }) {
            let (_, v) = decode_kv(call.body().clone())?;
            return Ok((!v.is_tombstone()).then(|| Arc::new(v)));
        }

        self.cloud.lock();
        self.fetch_remote(key, home).await
    }

    /// Coalesced remote fetch: concurrent gets for the same key share one
    /// in-flight call.
    async fn fetch_remote(
        &self,
        key: &Arc<Key>,
        home: Arc<Node>,
    ) -> Result<Option<Arc<Value>>, NimbusError> {
        // reserve the slot under the entry lock before the first send;
        // two racing first gets must never issue two calls for one key
        let mut fresh = None;
        let call = match self.pending_gets.entry(key.bytes().clone()) {
            Entry::Occupied(e) => e.get().clone(),
            Entry::Vacant(v) => {
                let mut buf = BytesMut::new();
                key.encode(&mut buf);
                let c = self.rpc_hub()?.begin(
                    Opcode::GetKey,
                    home.clone(),
                    buf.freeze(),
                );
                v.insert(c.clone());
                fresh = Some(c.clone());
                c
            }
        };
        if let Some(c) = fresh {
            self.rpc_hub()?.kick(&c).await;
        }
        let outcome = call.outcome().await;
        self.pending_gets
            .remove_if(key.bytes(), |_, c| Arc::ptr_eq(c, &call));

        match outcome {
            CallOutcome::Cancelled => logged_err!(
                "fetch abandoned: home {} left the cloud",
                home.addr
            ),
            CallOutcome::Answered(mut body) => {
                if body.first() != Some(&1) {
                    return Ok(None);
                }
                body.advance(1);
                let v = Arc::new(Value::decode(&mut body)?);
                // cache the fetched copy; the home keeps its own
                let w = self.put_local(key, v, false).await;
                key.note_mem_replica(home.id);
                Ok((!w.is_tombstone()).then_some(w))
            }
        }
    }

    async fn assemble(
        &self,
        key: &Arc<Key>,
        head: &Value,
    ) -> Result<Bytes, NimbusError> {
        let total = head.max_len();
        let mut out = BytesMut::with_capacity(total as usize);
        for i in 0..chunks::chunk_count(total) {
            let ck = self.intern(chunks::chunk_key(key, i)?);
            let v = self.get_value(&ck).await?.ok_or_else(|| {
                NimbusError(format!("arraylet chunk {} missing", i))
            })?;
            let b =
                self.resident_bytes(&ck, &v).await?.ok_or_else(|| {
                    NimbusError(format!("arraylet chunk {} empty", i))
                })?;
            out.put_slice(&b);
        }
        Ok(out.freeze())
    }

    /// Retry-until-success read-modify-write at the key's home. Shipped
    /// transparently when this node is not the home; re-routed if the
    /// home departs mid-call.
    pub async fn atomic(
        &self,
        key: &Arc<Key>,
        kind: &UpdateKind,
    ) -> Result<(), NimbusError> {
        loop {
            let cloud = self.cloud.current();
            let info = key
                .cloud_info(&cloud, &self.me.addr)
                .ok_or_else(|| NimbusError::msg("empty cloud"))?;
            let home = cloud.members[info.home].clone();
            if home.id == self.me.id {
                return self.atomic_local(key, kind).await;
            }

            self.cloud.lock();
            let ship = AtomicShip {
                key: key.bytes().to_vec(),
                desired: key.desired(),
                kind: kind.clone(),
            };
            let body = Bytes::from(rmp_serde::to_vec(&ship)?);
            match self
                .rpc_hub()?
                .call(Opcode::AtomicUpdate, home.clone(), body)
                .await?
            {
                CallOutcome::Answered(_) => return Ok(()),
                CallOutcome::Cancelled => {
                    pf_debug!(
                        "atomic target {} left; re-routing",
                        home.addr
                    );
                    time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    async fn atomic_local(
        &self,
        key: &Arc<Key>,
        kind: &UpdateKind,
    ) -> Result<(), NimbusError> {
        loop {
            let cur = self.lookup(key);
            let cur_bytes = match &cur {
                Some(v) if !v.is_tombstone() => {
                    self.resident_bytes(key, v).await?
                }
                _ => None,
            };
            let new = Arc::new(Value::new(
                kind.apply(cur_bytes.as_ref()),
                self.stamp(),
            ));
            let new_len = new.peek_mem().map_or(0, |b| b.len() as u64);
            self.gauge.alloc(new_len).await;
            match self.put_if_match(key, new, cur.as_ref()) {
                Ok(old_len) => {
                    self.gauge.release(old_len);
                    key.clear_replicas();
                    key.note_mem_replica(self.me.id);
                    self.dirty.insert(key.bytes().clone(), ());
                    return Ok(());
                }
                Err(_) => {
                    // lost the race; recompute against the fresh value
                    self.gauge.release(new_len);
                }
            }
        }
    }

    /// Blocks until no put of ours is still in flight.
    pub async fn write_barrier(&self) -> Result<(), NimbusError> {
        while self
            .rpc_hub()?
            .find_pending(|c| c.op == Opcode::PutKey)
            .is_some()
        {
            time::sleep(Duration::from_millis(50)).await;
        }
        Ok(())
    }

    /// Publishes a temporary key-of-keys holding a wire list of keys,
    /// pinned to this node.
    pub async fn publish_keys(
        &self,
        keys: &[Arc<Key>],
    ) -> Result<Arc<Key>, NimbusError> {
        let name = Uuid::new_v4();
        let kk = self.intern(Key::key_of_keys(
            &[self.me.addr],
            name.as_bytes(),
            1,
        )?);
        let mut buf = BytesMut::new();
        buf.put_u32_le(keys.len() as u32);
        for k in keys {
            k.encode(&mut buf);
        }
        self.put(&kk, buf.freeze()).await?;
        Ok(kk)
    }

    /// Resolves a published key-of-keys back into its key list.
    pub async fn fetch_keys(
        &self,
        kk: &Arc<Key>,
    ) -> Result<Vec<Arc<Key>>, NimbusError> {
        let Some(mut body) = self.get(kk).await? else {
            return logged_err!("published key list not found");
        };
        if body.len() < 4 {
            return logged_err!("malformed key list");
        }
        let n = body.get_u32_le() as usize;
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            out.push(self.intern(Key::decode(&mut body)?));
        }
        Ok(out)
    }

    /// Once-a-second background pass: writeback to the persistence
    /// backend, push replication toward each key's desired factor,
    /// completion of tombstoned deletes, and eviction under pressure.
    pub async fn sweep(self: &Arc<Self>) {
        let cloud = self.cloud.current();
        let dirty: Vec<Bytes> =
            self.dirty.iter().map(|e| e.key().clone()).collect();
        for kb in dirty {
            let (key, val) = match (
                self.keys.get(&kb).map(|e| e.value().clone()),
                self.vals.get(&kb).map(|e| e.value().clone()),
            ) {
                (Some(k), Some(v)) => (k, v),
                _ => {
                    self.dirty.remove(&kb);
                    continue;
                }
            };
            if let Err(e) = self.sweep_one(&cloud, &key, val).await {
                pf_warn!("sweep pass failed for a key: {}", e);
            }
        }

        let freed = if self.gauge.over_hi() { self.evict_pass() } else { 0 };
        if self.gauge.sweep_feedback(freed) {
            pf_error!(
                "memory critical at {}B cached with nothing evictable",
                self.gauge.cached()
            );
            std::process::exit(1);
        }
    }

    async fn sweep_one(
        self: &Arc<Self>,
        cloud: &Arc<Cloud>,
        key: &Arc<Key>,
        val: Arc<Value>,
    ) -> Result<(), NimbusError> {
        if val.goal_delete() {
            self.persist.delete(key).await?;
            // the tombstone has done its job once the delete is durable
            self.vals
                .remove_if(key.bytes(), |_, v| Arc::ptr_eq(v, &val));
            self.dirty.remove(key.bytes());
            return Ok(());
        }

        if !val.is_on_disk() {
            if let Some(b) = val.peek_mem() {
                self.persist.store(key, b).await?;
                val.set_on_disk(self.persist.backend_id());
                key.note_disk_replica(self.me.id);
            }
        }

        // offer copies until the desired replication factor is met
        let info = key
            .cloud_info(cloud, &self.me.addr)
            .ok_or_else(|| NimbusError::msg("empty cloud"))?;
        let mut satisfied = true;
        for r in 0..info.desired as usize {
            let Some(pos) = cloud.home_index(key.hash(), r) else {
                break;
            };
            let target = cloud.members[pos].clone();
            if target.id == self.me.id || key.has_mem_replica(target.id)
            {
                continue;
            }
            satisfied = false;
            let rpc = self.rpc_hub()?.clone();
            let body = encode_kv(key, &val);
            let key = key.clone();
            tokio::spawn(async move {
                match rpc
                    .call(Opcode::HazKey, target.clone(), body)
                    .await
                {
                    Ok(CallOutcome::Answered(ans))
                        if ans.first() == Some(&1) =>
                    {
                        key.note_mem_replica(target.id);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        pf_trace!(
                            "replica offer to {} failed: {}",
                            target.addr,
                            e
                        );
                    }
                }
            });
        }
        if satisfied && val.is_on_disk() {
            self.dirty.remove(key.bytes());
        }
        Ok(())
    }

    /// Frees buffers of persisted, idle, clean values until under the low
    /// watermark. Returns bytes freed.
    fn evict_pass(&self) -> u64 {
        let age = self.gauge.evict_age_ms();
        let mut freed = 0u64;
        for e in self.vals.iter() {
            let v = e.value();
            if !v.is_on_disk()
                || v.goal_delete()
                || self.dirty.contains_key(e.key())
                || v.idle_ms() < age
            {
                continue;
            }
            let n = v.evict_mem() as u64;
            if n > 0 {
                freed += n;
                self.gauge.release(n);
            }
            if self.gauge.cached() <= self.gauge.lo_water() {
                break;
            }
        }
        if freed > 0 {
            pf_debug!("eviction freed {}B", freed);
        }
        freed
    }
}

/// Serves `GetKey`: answer with what this node holds, never forwarding.
struct GetKeyHandler(Arc<Store>);

#[async_trait]
impl RemoteHandler for GetKeyHandler {
    async fn serve(
        &self,
        _sender: Arc<Node>,
        mut body: Bytes,
    ) -> Result<Bytes, NimbusError> {
        let key = self.0.intern(Key::decode(&mut body)?);
        let found = match self.0.lookup(&key) {
            Some(v) if !v.is_tombstone() => Some(v),
            Some(_) => None,
            None => match self.0.persist.manifest(&key).await? {
                Some(b) => {
                    let v = Arc::new(Value::new(b, WeakClock::NONE));
                    v.set_on_disk(self.0.persist.backend_id());
                    Some(self.0.put_local(&key, v, false).await)
                }
                None => None,
            },
        };
        let mut reply = BytesMut::new();
        match found {
            None => reply.put_u8(0),
            Some(v) => {
                // repopulate an evicted buffer before answering
                self.0.resident_bytes(&key, &v).await?;
                reply.put_u8(1);
                v.encode(&mut reply);
            }
        }
        Ok(reply.freeze())
    }
}

/// Serves `PutKey`: authoritative install at the home node.
struct PutKeyHandler(Arc<Store>);

#[async_trait]
impl RemoteHandler for PutKeyHandler {
    async fn serve(
        &self,
        sender: Arc<Node>,
        body: Bytes,
    ) -> Result<Bytes, NimbusError> {
        let (key, val) = decode_kv(body)?;
        let key = self.0.intern(key);
        self.0.put_local(&key, Arc::new(val), true).await;
        // the writer keeps its own copy
        key.note_mem_replica(sender.id);
        Ok(Bytes::new())
    }
}

/// Serves `HazKey`: a replica offer, refused under memory pressure.
/// Reply byte 1 = copy held, 0 = declined.
struct HazKeyHandler(Arc<Store>);

#[async_trait]
impl RemoteHandler for HazKeyHandler {
    async fn serve(
        &self,
        sender: Arc<Node>,
        body: Bytes,
    ) -> Result<Bytes, NimbusError> {
        if self.0.gauge.critical() {
            return Ok(Bytes::from_static(&[0]));
        }
        let (key, val) = decode_kv(body)?;
        let key = self.0.intern(key);
        self.0.put_local(&key, Arc::new(val), false).await;
        key.note_mem_replica(sender.id);
        Ok(Bytes::from_static(&[1]))
    }
}

/// Serves shipped atomic updates at the key's home.
struct AtomicHandler(Arc<Store>);

#[async_trait]
impl RemoteHandler for AtomicHandler {
    async fn serve(
        &self,
        _sender: Arc<Node>,
        body: Bytes,
    ) -> Result<Bytes, NimbusError> {
        let ship: AtomicShip = rmp_serde::from_slice(&body)?;
        let key = self
            .0
            .intern(Key::raw(Bytes::from(ship.key), ship.desired)?);
        self.0.atomic(&key, &ship.kind).await?;
        Ok(Bytes::new())
    }
}

#[cfg(test)]
mod store_tests {
    use super::*;
    use crate::msg::{BulkHub, PacketRouter, UdpHub};
    use crate::node::{NodeAddr, NodeRegistry};
    use std::net::Ipv4Addr;
    use tokio::sync::mpsc;

    fn test_store() -> Arc<Store> {
        let registry = NodeRegistry::new();
        let me = registry
            .intern(NodeAddr::new(Ipv4Addr::new(127, 0, 0, 1), 7001))
            .unwrap();
        let cloud = Arc::new(CloudView::new(Arc::new(Cloud::new(
            1,
            vec![me.clone()],
            1,
        ))));
        Store::new(
            me,
            cloud,
            Arc::new(MemBackend::new()),
            Arc::new(MemGauge::new(512 << 20)),
        )
    }

    fn ukey(store: &Store, name: &str) -> Arc<Key> {
        store
            .make_user_key(Bytes::copy_from_slice(name.as_bytes()))
            .unwrap()
    }

    /// One side of a two-node cluster on real localhost sockets, with
    /// the call layer wired and pumped.
    async fn net_store(
        port: u16,
        peer: u16,
    ) -> Result<(Arc<Store>, Arc<RpcHub>), NimbusError> {
        let registry = Arc::new(NodeRegistry::new());
        let me_addr = NodeAddr::new(Ipv4Addr::new(127, 0, 0, 1), port);
        let me = registry.intern(me_addr)?;
        let peer_node = registry
            .intern(NodeAddr::new(Ipv4Addr::new(127, 0, 0, 1), peer))?;
        let view = Arc::new(CloudView::new(Arc::new(Cloud::new(
            0x55,
            vec![me.clone(), peer_node],
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
            me,
            view,
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
        Ok((store, rpc))
    }

    /// First key from a generated family whose home lands on the member
    /// at `pos` of the store's current cloud.
    fn key_homed_at(store: &Arc<Store>, pos: usize) -> Arc<Key> {
        let cloud = store.cloud.current();
        (0..64u8)
            .map(|i| ukey(store, &format!("homed-{}", i)))
            .find(|k| {
                k.cloud_info(&cloud, &store.me.addr)
                    .is_some_and(|info| info.home == pos)
            })
            .unwrap()
    }

    #[tokio::test]
    async fn put_then_get() -> Result<(), NimbusError> {
        let store = test_store();
        let k = ukey(&store, "a");
        store.put(&k, Bytes::from_static(&[1, 2, 3])).await?;
        assert_eq!(
            store.get(&k).await?,
            Some(Bytes::from_static(&[1, 2, 3]))
        );
        assert_eq!(store.key_count(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn missing_key_is_none() -> Result<(), NimbusError> {
        let store = test_store();
        let k = ukey(&store, "nothing-here");
        assert_eq!(store.get(&k).await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn delete_then_get() -> Result<(), NimbusError> {
        let store = test_store();
        let k = ukey(&store, "b");
        store.put(&k, Bytes::from_static(b"doomed")).await?;
        store.remove(&k).await?;
        assert_eq!(store.get(&k).await?, None);

        // a later write resurrects the key
        store.put(&k, Bytes::from_static(b"reborn")).await?;
        assert_eq!(
            store.get(&k).await?,
            Some(Bytes::from_static(b"reborn"))
        );
        Ok(())
    }

    #[tokio::test]
    async fn stale_same_writer_update_loses() {
        let store = test_store();
        let k = ukey(&store, "ordered");
        let ip = store.me.addr.ip;
        let newer =
            Arc::new(Value::new(Bytes::from_static(b"new"), WeakClock::new(ip, 10)));
        let older =
            Arc::new(Value::new(Bytes::from_static(b"old"), WeakClock::new(ip, 3)));

        let w1 = store.put_local(&k, newer.clone(), true).await;
        assert!(Arc::ptr_eq(&w1, &newer));
        // the older stamp arrives late and must lose
        let w2 = store.put_local(&k, older, true).await;
        assert!(Arc::ptr_eq(&w2, &newer));
    }

    #[tokio::test]
    async fn identical_racing_write_is_noop() {
        let store = test_store();
        let k = ukey(&store, "twin");
        let clock = WeakClock::new(store.me.addr.ip, 7);
        let a = Arc::new(Value::new(Bytes::from_static(b"same"), clock));
        let b = Arc::new(Value::new(Bytes::from_static(b"same"), clock));

        let w1 = store.put_local(&k, a.clone(), true).await;
        let w2 = store.put_local(&k, b, true).await;
        assert!(Arc::ptr_eq(&w1, &a));
        assert!(Arc::ptr_eq(&w2, &a));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_atomics_all_land() -> Result<(), NimbusError> {
        let store = test_store();
        let k = ukey(&store, "counter");
        let mut handles = Vec::new();
        for i in 0u8..8 {
            let store = store.clone();
            let k = k.clone();
            handles.push(tokio::spawn(async move {
                store
                    .atomic(
                        &k,
                        &UpdateKind::Append { bytes: vec![i] },
                    )
                    .await
            }));
        }
        for h in handles {
            h.await.map_err(NimbusError::from)??;
        }
        // the final value is a fold of all eight appends in some order
        let got = store.get(&k).await?.unwrap();
        assert_eq!(got.len(), 8);
        let mut seen: Vec<u8> = got.to_vec();
        seen.sort_unstable();
        assert_eq!(seen, (0..8).collect::<Vec<u8>>());
        Ok(())
    }

    #[tokio::test]
    async fn arraylet_roundtrip() -> Result<(), NimbusError> {
        let store = test_store();
        let k = ukey(&store, "large");
        let total = (2 * CHUNK_UNIT + 3) as usize;
        let bytes: Bytes =
            (0..total).map(|i| (i % 251) as u8).collect::<Vec<u8>>().into();
        store.put(&k, bytes.clone()).await?;

        // head plus two chunks live in the map
        assert_eq!(store.key_count(), 3);
        assert_eq!(store.get(&k).await?, Some(bytes));

        store.remove(&k).await?;
        assert_eq!(store.get(&k).await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn sweep_persists_then_eviction_reloads(
    ) -> Result<(), NimbusError> {
        let store = test_store();
        let k = ukey(&store, "survivor");
        store.put(&k, Bytes::from_static(b"durable")).await?;

        store.sweep().await;
        let v = store.lookup(&k).unwrap();
        assert!(v.is_on_disk());

        // evict the buffer, then a get must reload from the backend
        assert_eq!(v.evict_mem(), 7);
        assert!(v.peek_mem().is_none());
        assert_eq!(
            store.get(&k).await?,
            Some(Bytes::from_static(b"durable"))
        );
        Ok(())
    }

    #[tokio::test]
    async fn sweep_completes_tombstoned_delete() -> Result<(), NimbusError>
    {
        let store = test_store();
        let k = ukey(&store, "gone");
        store.put(&k, Bytes::from_static(b"x")).await?;
        store.sweep().await; // persists
        store.remove(&k).await?;
        store.sweep().await; // deletes from the backend, drops the stone
        assert!(store.lookup(&k).is_none());
        assert!(store.persist.load(&k, 1).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn key_of_keys_roundtrip() -> Result<(), NimbusError> {
        let store = test_store();
        let keys =
            vec![ukey(&store, "k1"), ukey(&store, "k2"), ukey(&store, "k3")];
        let kk = store.publish_keys(&keys).await?;
        assert_eq!(kk.class(), CLASS_KEY_OF_KEYS);
        let fetched = store.fetch_keys(&kk).await?;
        assert_eq!(fetched.len(), 3);
        for (a, b) in keys.iter().zip(fetched.iter()) {
            assert!(Arc::ptr_eq(a, b)); // interning preserved identity
        }
        store.remove(&kk).await?;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 3)]
    async fn sweep_pushes_replica_to_peer() -> Result<(), NimbusError> {
        let (a, _rpc_a) = net_store(30941, 30943).await?;
        let (b, _rpc_b) = net_store(30943, 30941).await?;

        // a key homed here, so the sweep (not the put) must move the
        // bytes to the replica node
        let cloud = a.cloud.current();
        let mine = cloud.position(&a.me.addr).unwrap();
        let k = key_homed_at(&a, mine);
        a.put(&k, Bytes::from_static(b"copy me")).await?;

        let peer_id = cloud.members[1 - mine].id;
        assert!(!k.has_mem_replica(peer_id));
        a.sweep().await;
        let mut held = false;
        for _ in 0..40 {
            if k.has_mem_replica(peer_id) {
                held = true;
                break;
            }
            time::sleep(Duration::from_millis(50)).await;
        }
        assert!(held, "replica offer never acknowledged");

        // the replica node holds the very same write
        let kb = b.make_user_key(k.bytes().clone())?;
        let copy = b.lookup(&kb).unwrap();
        assert!(copy.same_write(&a.lookup(&k).unwrap()));
        assert_eq!(
            b.get(&kb).await?,
            Some(Bytes::from_static(b"copy me"))
        );
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 3)]
    async fn concurrent_remote_gets_share_one_call(
    ) -> Result<(), NimbusError> {
        // the peer is a cloud member but nothing listens at its port, so
        // the fetch stays pending while we inspect the coalescing table
        let (a, rpc) = net_store(30945, 30947).await?;
        let cloud = a.cloud.current();
        let mine = cloud.position(&a.me.addr).unwrap();
        let k = key_homed_at(&a, 1 - mine);

        let (s1, k1) = (a.clone(), k.clone());
        let g1 = tokio::spawn(async move { s1.get(&k1).await });
        let (s2, k2) = (a.clone(), k.clone());
        let g2 = tokio::spawn(async move { s2.get(&k2).await });

        time::sleep(Duration::from_millis(100)).await;
        assert_eq!(a.pending_gets.len(), 1);

        // abandon the shared call; both waiters observe the same end
        let task = a.pending_gets.iter().next().unwrap().value().task;
        rpc.cancel(task);
        assert!(g1.await.unwrap().is_err());
        assert!(g2.await.unwrap().is_err());
        assert!(a.pending_gets.is_empty());
        Ok(())
    }
}
