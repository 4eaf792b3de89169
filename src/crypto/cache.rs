//! The two cache tiers in front of the master key provider.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use data_encoding::BASE64;
use zeroize::Zeroizing;

use crate::crypto::dek::DataKey;
use crate::error::Result;
use crate::model::common::BallotId;
use crate::shared::SharedStore;

/// Lifetime of a tier-1 entry.
pub const LOCAL_TTL: Duration = Duration::from_secs(60);

/// Lifetime of a tier-2 entry, refreshed on every hit.
pub const SHARED_TTL: Duration = Duration::from_secs(600);

/// Tier 1: unwrapped keys in process memory.
pub struct LocalKeyCache {
    ttl: Duration,
    entries: Mutex<HashMap<BallotId, (Arc<DataKey>, Instant)>>,
}

impl LocalKeyCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Default::default(),
        }
    }

    pub fn get(&self, ballot_id: &BallotId) -> Option<Arc<DataKey>> {
        let mut entries = self.entries.lock().ok()?;
        match entries.get(ballot_id) {
            Some((dek, expires_at)) if *expires_at > Instant::now() => Some(dek.clone()),
            Some(_) => {
                entries.remove(ballot_id);
                None
            }
            None => None,
        }
    }

    pub fn put(&self, ballot_id: &BallotId, dek: Arc<DataKey>) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(ballot_id.clone(), (dek, Instant::now() + self.ttl));
        }
    }

    pub fn evict(&self, ballot_id: &BallotId) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.remove(ballot_id);
        }
    }

    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
    }
}

impl Default for LocalKeyCache {
    fn default() -> Self {
        Self::new(LOCAL_TTL)
    }
}

/// Tier 2: serialized keys in the shared store, visible to every worker.
pub struct SharedKeyCache {
    store: Arc<dyn SharedStore>,
}

impl SharedKeyCache {
    pub fn new(store: Arc<dyn SharedStore>) -> Self {
        Self { store }
    }

    /// Fetch a key and push its expiry back. An entry that does not parse is treated as a miss.
    pub async fn get(&self, ballot_id: &BallotId) -> Result<Option<DataKey>> {
        let key = ballot_id.dek_cache_key();
        let Some(encoded) = self.store.get(&key).await? else {
            return Ok(None);
        };
        let encoded = Zeroizing::new(encoded);
        let dek = match BASE64.decode(encoded.as_bytes()) {
            Ok(bytes) => DataKey::deserialize(&Zeroizing::new(bytes)).ok(),
            Err(_) => None,
        };
        match dek {
            Some(dek) => {
                self.store.expire(&key, SHARED_TTL).await?;
                Ok(Some(dek))
            }
            None => {
                warn!("Ignoring malformed cached data key for ballot {ballot_id}");
                Ok(None)
            }
        }
    }

    pub async fn put(&self, ballot_id: &BallotId, dek: &DataKey) -> Result<()> {
        let encoded = Zeroizing::new(BASE64.encode(&dek.serialize()));
        self.store
            .set_ex(&ballot_id.dek_cache_key(), &encoded, SHARED_TTL)
            .await
    }

    pub async fn evict(&self, ballot_id: &BallotId) -> Result<()> {
        self.store.delete(&ballot_id.dek_cache_key()).await
    }
}

#[cfg(test)]
mod tests {
    use crate::shared::MemoryStore;

    use super::*;

    #[test]
    fn local_entries_expire() {
        let cache = LocalKeyCache::new(Duration::from_millis(20));
        let ballot = BallotId::generate();
        cache.put(&ballot, Arc::new(DataKey::generate()));
        assert!(cache.get(&ballot).is_some());
        std::thread::sleep(Duration::from_millis(40));
        assert!(cache.get(&ballot).is_none());
    }

    #[test]
    fn local_evict_and_clear() {
        let cache = LocalKeyCache::default();
        let (a, b) = (BallotId::generate(), BallotId::generate());
        cache.put(&a, Arc::new(DataKey::generate()));
        cache.put(&b, Arc::new(DataKey::generate()));
        cache.evict(&a);
        assert!(cache.get(&a).is_none());
        assert!(cache.get(&b).is_some());
        cache.clear();
        assert!(cache.get(&b).is_none());
    }

    #[rocket::async_test]
    async fn shared_hit_refreshes_ttl() {
        let store = MemoryStore::new();
        let cache = SharedKeyCache::new(Arc::new(store.clone()));
        let ballot = BallotId::generate();
        let dek = DataKey::generate();
        cache.put(&ballot, &dek).await.unwrap();

        // Let some of the lifetime run down, then check a hit restores it.
        store
            .expire(&ballot.dek_cache_key(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(cache.get(&ballot).await.unwrap(), Some(dek));
        assert!(store.ttl(&ballot.dek_cache_key()).unwrap() > Duration::from_secs(500));
    }

    #[rocket::async_test]
    async fn shared_garbage_is_a_miss() {
        let store = MemoryStore::new();
        let cache = SharedKeyCache::new(Arc::new(store.clone()));
        let ballot = BallotId::generate();
        store
            .set_ex(&ballot.dek_cache_key(), "garbage", SHARED_TTL)
            .await
            .unwrap();
        assert_eq!(cache.get(&ballot).await.unwrap(), None);

        cache.put(&ballot, &DataKey::generate()).await.unwrap();
        cache.evict(&ballot).await.unwrap();
        assert_eq!(cache.get(&ballot).await.unwrap(), None);
    }
}
