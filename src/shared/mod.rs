//! The store shared between workers: key/value cache, leased locks, and pub/sub.

use std::time::Duration;

use rocket::futures::stream::BoxStream;

use crate::error::Result;

mod memory;
mod redis_store;

pub use self::memory::MemoryStore;
pub use self::redis_store::RedisStore;

/// A live subscription to a pub/sub channel, yielding message payloads.
/// Dropping it unsubscribes.
pub type Subscription = BoxStream<'static, String>;

/// Operations every worker process needs from the shared store.
///
/// All failures surface as [`crate::error::Error::ServiceUnavailable`].
#[rocket::async_trait]
pub trait SharedStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Set `key` to `value`, expiring after `ttl`.
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Reset the expiry of `key`. Returns false if the key does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Take the lock `name` for `token` if nobody holds it. The lock lapses
    /// after `lease` unless released first.
    async fn try_lock(&self, name: &str, token: &str, lease: Duration) -> Result<bool>;

    /// Release the lock `name`, but only if it is still held by `token`.
    /// Returns false if the lease had lapsed or someone else holds it.
    async fn unlock(&self, name: &str, token: &str) -> Result<bool>;

    async fn publish(&self, channel: &str, payload: &str) -> Result<()>;

    /// Subscribe to `channel`. The subscription is active once this returns.
    async fn subscribe(&self, channel: &str) -> Result<Subscription>;
}
