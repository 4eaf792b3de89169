use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, MutexGuard,
};
use std::time::{Duration, Instant};

use rocket::futures::{stream, StreamExt};
use rocket::tokio::sync::broadcast::{self, error::RecvError};

use crate::error::{Error, Result};

use super::{SharedStore, Subscription};

/// Messages buffered per channel before slow subscribers start missing updates.
const CHANNEL_CAPACITY: usize = 256;

/// An in-process shared store.
///
/// Clones share the same underlying state, so several services in one
/// process can use it to stand in for separate workers sharing a Redis.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    unavailable: Arc<AtomicBool>,
}

#[derive(Default)]
struct Inner {
    values: HashMap<String, Entry>,
    channels: HashMap<String, broadcast::Sender<String>>,
}

struct Entry {
    value: String,
    expires_at: Instant,
}

impl Inner {
    /// Look up a live entry, dropping it if it has expired.
    fn live_entry(&mut self, key: &str) -> Option<&mut Entry> {
        let now = Instant::now();
        if self.values.get(key).map_or(false, |e| e.expires_at <= now) {
            self.values.remove(key);
        }
        self.values.get_mut(key)
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent operation fail as if the store were down.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Remaining lifetime of `key`, if it exists.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let mut inner = self.inner.lock().ok()?;
        let expires_at = inner.live_entry(key)?.expires_at;
        Some(expires_at.saturating_duration_since(Instant::now()))
    }

    /// Drop all keys and channels.
    pub fn clear(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.values.clear();
            inner.channels.clear();
        }
    }

    fn state(&self) -> Result<MutexGuard<'_, Inner>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::ServiceUnavailable(
                "shared store: connection refused".to_string(),
            ));
        }
        self.inner
            .lock()
            .map_err(|_| Error::Internal("shared store state poisoned".to_string()))
    }
}

#[rocket::async_trait]
impl SharedStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.state()?.live_entry(key).map(|e| e.value.clone()))
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let entry = Entry {
            value: value.to_string(),
            expires_at: Instant::now() + ttl,
        };
        self.state()?.values.insert(key.to_string(), entry);
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut inner = self.state()?;
        match inner.live_entry(key) {
            Some(entry) => {
                entry.expires_at = Instant::now() + ttl;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.state()?.values.remove(key);
        Ok(())
    }

    async fn try_lock(&self, name: &str, token: &str, lease: Duration) -> Result<bool> {
        let mut inner = self.state()?;
        if inner.live_entry(name).is_some() {
            return Ok(false);
        }
        let entry = Entry {
            value: token.to_string(),
            expires_at: Instant::now() + lease,
        };
        inner.values.insert(name.to_string(), entry);
        Ok(true)
    }

    async fn unlock(&self, name: &str, token: &str) -> Result<bool> {
        let mut inner = self.state()?;
        let held = inner.live_entry(name).map_or(false, |e| e.value == token);
        if held {
            inner.values.remove(name);
        }
        Ok(held)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let mut inner = self.state()?;
        if let Some(sender) = inner.channels.get(channel) {
            if sender.send(payload.to_string()).is_err() {
                // Nobody is listening any more.
                inner.channels.remove(channel);
            }
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let receiver = self
            .state()?
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe();

        let messages = stream::unfold(receiver, |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(message) => return Some((message, receiver)),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Subscriber lagged, skipped {skipped} messages");
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        });
        Ok(messages.boxed())
    }
}

#[cfg(test)]
mod tests {
    use rocket::tokio::time::timeout;

    use super::*;

    #[rocket::async_test]
    async fn values_expire() {
        let store = MemoryStore::new();
        store.set_ex("k", "v", Duration::from_millis(30)).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
        rocket::tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(!store.expire("k", Duration::from_secs(5)).await.unwrap());
    }

    #[rocket::async_test]
    async fn expire_slides_ttl() {
        let store = MemoryStore::new();
        store.set_ex("k", "v", Duration::from_secs(1)).await.unwrap();
        assert!(store.expire("k", Duration::from_secs(600)).await.unwrap());
        assert!(store.ttl("k").unwrap() > Duration::from_secs(500));
    }

    #[rocket::async_test]
    async fn locks_are_exclusive_and_token_checked() {
        let store = MemoryStore::new();
        let lease = Duration::from_secs(10);
        assert!(store.try_lock("l", "a", lease).await.unwrap());
        assert!(!store.try_lock("l", "b", lease).await.unwrap());
        assert!(!store.unlock("l", "b").await.unwrap());
        assert!(store.unlock("l", "a").await.unwrap());
        assert!(store.try_lock("l", "b", lease).await.unwrap());
    }

    #[rocket::async_test]
    async fn lapsed_lease_can_be_taken_over() {
        let store = MemoryStore::new();
        assert!(store.try_lock("l", "a", Duration::from_millis(20)).await.unwrap());
        rocket::tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(store.try_lock("l", "b", Duration::from_secs(10)).await.unwrap());
        // The old holder must not release the new holder's lock.
        assert!(!store.unlock("l", "a").await.unwrap());
    }

    #[rocket::async_test]
    async fn pubsub_reaches_every_subscriber() {
        let store = MemoryStore::new();
        let mut first = store.subscribe("c").await.unwrap();
        let mut second = store.clone().subscribe("c").await.unwrap();
        store.publish("c", "hello").await.unwrap();
        store.publish("other", "ignored").await.unwrap();

        for sub in [&mut first, &mut second] {
            let msg = timeout(Duration::from_secs(1), sub.next()).await.unwrap();
            assert_eq!(msg.as_deref(), Some("hello"));
        }
    }

    #[rocket::async_test]
    async fn outage_fails_every_operation() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        assert!(matches!(store.get("k").await, Err(Error::ServiceUnavailable(_))));
        assert!(matches!(
            store.try_lock("l", "t", Duration::from_secs(1)).await,
            Err(Error::ServiceUnavailable(_))
        ));
        store.set_unavailable(false);
        assert!(store.get("k").await.is_ok());
    }
}
