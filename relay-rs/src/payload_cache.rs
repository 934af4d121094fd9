//! Short-lived storage of execution payloads, keyed by the slot, proposer and block hash they
//! were built for.
use crate::types::VersionedExecutionPayload;
use async_trait::async_trait;
use ethereum_consensus::primitives::Slot;
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::time::Instant;

mod memcached;

pub use memcached::MemcachedCache;

pub const DEFAULT_KEY_PREFIX: &str = "boost-relay";
pub const DEFAULT_TTL: Duration = Duration::from_secs(45);

const KEY_KIND: &str = "cache-getpayload-response";

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid key component: {0}")]
    InvalidKeyComponent(&'static str),
    #[error("invalid key prefix `{0}`")]
    InvalidPrefix(String),
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
    #[error(transparent)]
    Memcached(#[from] memcache::MemcacheError),
    #[error("cache backend failure: {0}")]
    Backend(String),
}

/// A shared key-value store with per-entry expiry.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), Error>;

    /// Returns `None` if `key` was never written or has expired.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, Error>;
}

struct Entry {
    value: Vec<u8>,
    expires_at: Instant,
}

/// A [`CacheBackend`] held in process memory.
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, Entry>>,
}

#[cfg(test)]
impl MemoryCache {
    fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.lock().values().filter(|entry| entry.expires_at > now).count()
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), Error> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        entries.retain(|_, entry| entry.expires_at > now);
        entries.insert(key.to_string(), Entry { value, expires_at: now + ttl });
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, Error> {
        let entries = self.entries.lock();
        let value = entries
            .get(key)
            .filter(|entry| entry.expires_at > Instant::now())
            .map(|entry| entry.value.clone());
        Ok(value)
    }
}

fn validate_key_component(component: &str, name: &'static str) -> Result<(), Error> {
    if component.is_empty() ||
        component.chars().any(|c| c == '_' || c == ':' || c.is_whitespace())
    {
        Err(Error::InvalidKeyComponent(name))
    } else {
        Ok(())
    }
}

pub struct PayloadCache {
    backend: Arc<dyn CacheBackend>,
    key_prefix: String,
    ttl: Duration,
}

impl PayloadCache {
    pub fn new(
        backend: Arc<dyn CacheBackend>,
        key_prefix: impl Into<String>,
        ttl: Duration,
    ) -> Result<Self, Error> {
        let key_prefix = key_prefix.into();
        if key_prefix.contains(':') {
            return Err(Error::InvalidPrefix(key_prefix))
        }
        Ok(Self { backend, key_prefix, ttl })
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn key_for(
        &self,
        slot: Slot,
        proposer_public_key: &str,
        block_hash: &str,
    ) -> Result<String, Error> {
        validate_key_component(proposer_public_key, "proposer public key")?;
        validate_key_component(block_hash, "block hash")?;
        Ok(format!(
            "{}:{KEY_KIND}:{slot}_{proposer_public_key}_{block_hash}",
            self.key_prefix
        ))
    }

    /// Store `payload`, replacing any entry under the same key.
    pub async fn put(
        &self,
        slot: Slot,
        proposer_public_key: &str,
        block_hash: &str,
        payload: &VersionedExecutionPayload,
    ) -> Result<(), Error> {
        let key = self.key_for(slot, proposer_public_key, block_hash)?;
        let value = serde_json::to_vec(payload)?;
        self.backend.set(&key, value, self.ttl).await
    }

    pub async fn get(
        &self,
        slot: Slot,
        proposer_public_key: &str,
        block_hash: &str,
    ) -> Result<Option<VersionedExecutionPayload>, Error> {
        let key = self.key_for(slot, proposer_public_key, block_hash)?;
        match self.backend.get(&key).await? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }
}
