use std::time::Duration;

use redis::{aio::ConnectionManager, AsyncCommands, Client, RedisResult, Script};
use rocket::futures::StreamExt;

use crate::error::Result;

use super::{SharedStore, Subscription};

/// Deletes the lock only if it still carries the caller's token.
const UNLOCK_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end
"#;

/// Redis-backed shared store.
///
/// Commands share one multiplexed, auto-reconnecting connection. Each
/// subscription gets a dedicated pub/sub connection.
#[derive(Clone)]
pub struct RedisStore {
    client: Client,
    conn: ConnectionManager,
    unlock: Script,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = Client::open(url)?;
        let conn = ConnectionManager::new(client.clone()).await?;
        Ok(Self {
            client,
            conn,
            unlock: Script::new(UNLOCK_SCRIPT),
        })
    }

    /// Run an idempotent read, retrying once on failure.
    async fn read_with_retry<T, F, Fut>(&self, key: &str, read: F) -> Result<T>
    where
        F: Fn(ConnectionManager) -> Fut,
        Fut: std::future::Future<Output = RedisResult<T>>,
    {
        match read(self.conn.clone()).await {
            Ok(value) => Ok(value),
            Err(e) => {
                debug!("Shared store read of {key} failed, retrying once: {e}");
                Ok(read(self.conn.clone()).await?)
            }
        }
    }
}

#[rocket::async_trait]
impl SharedStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.read_with_retry(key, |mut conn| async move { conn.get(key).await })
            .await
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.set_ex(key, value, ttl.as_secs().max(1)).await?;
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let seconds = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX).max(1);
        self.read_with_retry(key, |mut conn| async move { conn.expire(key, seconds).await })
            .await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.del(key).await?;
        Ok(())
    }

    async fn try_lock(&self, name: &str, token: &str, lease: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let lease_ms = u64::try_from(lease.as_millis()).unwrap_or(u64::MAX).max(1);
        let reply: Option<String> = redis::cmd("SET")
            .arg(name)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(lease_ms)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn unlock(&self, name: &str, token: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let deleted: i64 = self
            .unlock
            .key(name)
            .arg(token)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted == 1)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.publish(channel, payload).await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;
        let channel = channel.to_string();
        let messages = pubsub.into_on_message().filter_map(move |msg| {
            let payload = msg.get_payload::<String>();
            if let Err(ref e) = payload {
                warn!("Dropping undecodable message on {channel}: {e}");
            }
            async move { payload.ok() }
        });
        Ok(messages.boxed())
    }
}
