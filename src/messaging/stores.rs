//! Symmetric key and nonce stores.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::{debug, warn};

use super::clock::Clock;
use super::error::ProtocolError;
use super::random::RandomSource;

/// Length in bytes of keys minted by [`current_key`].
pub const SYMMETRIC_KEY_LEN: usize = 32;

const MAX_COLLISION_RETRIES: usize = 3;

/// An expiring symmetric secret.
#[derive(Clone, PartialEq, Eq)]
pub struct CryptoKey {
    key: Vec<u8>,
    expires_utc: DateTime<Utc>,
}

impl CryptoKey {
    pub fn new(key: Vec<u8>, expires_utc: DateTime<Utc>) -> Self {
        Self { key, expires_utc }
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn expires_utc(&self) -> DateTime<Utc> {
        self.expires_utc
    }
}

impl std::fmt::Debug for CryptoKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoKey")
            .field("len", &self.key.len())
            .field("expires_utc", &self.expires_utc)
            .finish()
    }
}

/// Keys grouped by bucket and addressed by handle.
pub trait CryptoKeyStore: Send + Sync {
    fn get_key(&self, bucket: &str, handle: &str) -> Option<CryptoKey>;

    /// All keys in a bucket, longest remaining life first.
    fn get_keys(&self, bucket: &str) -> Vec<(String, CryptoKey)>;

    /// Fails with [`KeyCollision`] if the handle is taken.
    fn store_key(&self, bucket: &str, handle: &str, key: CryptoKey) -> Result<(), KeyCollision>;

    fn remove_key(&self, bucket: &str, handle: &str);
}

/// A key with the requested handle already exists.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("a key with handle {handle:?} already exists in bucket {bucket:?}")]
pub struct KeyCollision {
    pub bucket: String,
    pub handle: String,
}

/// Returns a key from `bucket` that stays valid for at least
/// `minimum_remaining_life`, minting one when none qualifies.
///
/// New keys live for `minimum_remaining_life + key_lifetime`.
pub fn current_key(
    store: &dyn CryptoKeyStore,
    clock: &dyn Clock,
    random: &dyn RandomSource,
    bucket: &str,
    minimum_remaining_life: TimeDelta,
    key_lifetime: TimeDelta,
) -> Result<(String, CryptoKey), ProtocolError> {
    let cutoff = clock.now() + minimum_remaining_life;
    if let Some(found) = store.get_keys(bucket).into_iter().find(|(_, key)| key.expires_utc > cutoff) {
        return Ok(found);
    }

    for attempt in 1..=MAX_COLLISION_RETRIES {
        let handle = random.alphanumeric(4)?;
        let key = CryptoKey::new(
            random.bytes(SYMMETRIC_KEY_LEN)?,
            clock.now() + minimum_remaining_life + key_lifetime,
        );
        match store.store_key(bucket, &handle, key.clone()) {
            Ok(()) => {
                debug!(bucket, handle = %handle, "minted new symmetric key");
                return Ok((handle, key));
            }
            Err(collision) => warn!(attempt, error = %collision, "key handle collision"),
        }
    }
    Err(ProtocolError::Host(format!("could not store a new key in bucket {}", bucket)))
}

/// Keys held in process memory.
#[derive(Clone, Default)]
pub struct InMemoryCryptoKeyStore {
    keys: Arc<DashMap<(String, String), CryptoKey>>,
}

impl InMemoryCryptoKeyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CryptoKeyStore for InMemoryCryptoKeyStore {
    fn get_key(&self, bucket: &str, handle: &str) -> Option<CryptoKey> {
        self.keys
            .get(&(bucket.to_string(), handle.to_string()))
            .map(|entry| entry.value().clone())
    }

    fn get_keys(&self, bucket: &str) -> Vec<(String, CryptoKey)> {
        let mut keys: Vec<(String, CryptoKey)> = self
            .keys
            .iter()
            .filter(|entry| entry.key().0 == bucket)
            .map(|entry| (entry.key().1.clone(), entry.value().clone()))
            .collect();
        keys.sort_by(|a, b| b.1.expires_utc.cmp(&a.1.expires_utc));
        keys
    }

    fn store_key(&self, bucket: &str, handle: &str, key: CryptoKey) -> Result<(), KeyCollision> {
        match self.keys.entry((bucket.to_string(), handle.to_string())) {
            Entry::Occupied(_) => Err(KeyCollision { bucket: bucket.to_string(), handle: handle.to_string() }),
            Entry::Vacant(slot) => {
                slot.insert(key);
                Ok(())
            }
        }
    }

    fn remove_key(&self, bucket: &str, handle: &str) {
        self.keys.remove(&(bucket.to_string(), handle.to_string()));
    }
}

/// Records (context, nonce, timestamp) triples to detect replays.
pub trait NonceStore: Send + Sync {
    /// Returns `true` the first time a triple is stored and `false` after,
    /// or when the timestamp is already too old to be tracked.
    fn store_nonce(&self, context: &str, nonce: &str, timestamp: DateTime<Utc>) -> bool;
}

const PRUNE_EVERY: usize = 256;

/// Nonces held in process memory for a bounded age.
#[derive(Clone)]
pub struct InMemoryNonceStore {
    seen: Arc<DashMap<(String, String, DateTime<Utc>), ()>>,
    maximum_age: TimeDelta,
    clock: Arc<dyn Clock>,
    inserts: Arc<AtomicUsize>,
}

impl InMemoryNonceStore {
    pub fn new(maximum_age: TimeDelta, clock: Arc<dyn Clock>) -> Self {
        Self {
            seen: Arc::new(DashMap::new()),
            maximum_age,
            clock,
            inserts: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Drops nonces older than the maximum age.
    pub fn prune(&self) {
        let oldest = self.clock.now() - self.maximum_age;
        self.seen.retain(|(_, _, timestamp), _| *timestamp >= oldest);
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

impl NonceStore for InMemoryNonceStore {
    fn store_nonce(&self, context: &str, nonce: &str, timestamp: DateTime<Utc>) -> bool {
        if timestamp + self.maximum_age < self.clock.now() {
            debug!(context, "nonce timestamp is older than the tracked window");
            return false;
        }
        let stored = match self.seen.entry((context.to_string(), nonce.to_string(), timestamp)) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(());
                true
            }
        };
        if stored && self.inserts.fetch_add(1, Ordering::Relaxed) % PRUNE_EVERY == PRUNE_EVERY - 1 {
            self.prune();
        }
        stored
    }
}
