//! Persistence backend interface.
//!
//! Real backends (local disk, distributed filesystems) live outside the
//! core and plug in here. The core ships a memory-backed implementation
//! so the writeback and eviction paths are exercised even without one.

use crate::store::key::Key;
use crate::utils::NimbusError;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;

/// A store/load/delete collaborator for value bytes, keyed by key name.
#[async_trait]
pub trait Persistence: Send + Sync {
    /// Small id packed into the value's persist state byte.
    fn backend_id(&self) -> u8;

    async fn store(&self, key: &Key, bytes: Bytes)
        -> Result<(), NimbusError>;

    async fn delete(&self, key: &Key) -> Result<(), NimbusError>;

    /// Loads the first `len` bytes of a persisted value.
    async fn load(&self, key: &Key, len: usize)
        -> Result<Bytes, NimbusError>;

    /// Lazy reconstruction hook: backends that can enumerate
    /// disk-resident chunks not yet in the map report them here.
    async fn manifest(
        &self,
        _key: &Key,
    ) -> Result<Option<Bytes>, NimbusError> {
        Ok(None)
    }
}

/// Memory-backed persistence: a shadow map standing in for a disk.
#[derive(Debug, Default)]
pub struct MemBackend {
    shadow: DashMap<Bytes, Bytes>,
}

impl MemBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Persistence for MemBackend {
    fn backend_id(&self) -> u8 {
        1
    }

    async fn store(
        &self,
        key: &Key,
        bytes: Bytes,
    ) -> Result<(), NimbusError> {
        self.shadow.insert(key.bytes().clone(), bytes);
        Ok(())
    }

    async fn delete(&self, key: &Key) -> Result<(), NimbusError> {
        self.shadow.remove(key.bytes());
        Ok(())
    }

    async fn load(
        &self,
        key: &Key,
        len: usize,
    ) -> Result<Bytes, NimbusError> {
        match self.shadow.get(key.bytes()) {
            Some(b) => Ok(b.value().slice(0..len.min(b.value().len()))),
            None => Err(NimbusError(format!(
                "no persisted bytes for key of {}B",
                key.bytes().len()
            ))),
        }
    }
}
