//! Redis sorted-set store for the sliding window log.

use async_trait::async_trait;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use tokio::sync::OnceCell;
use tracing::info;

use super::distributed::SharedStore;
use crate::error::StoreError;

/// Reconnect attempts per failed command before the error surfaces.
const RECONNECT_RETRIES: usize = 2;

/// A [`SharedStore`] backed by Redis sorted sets.
///
/// Each identifier is one sorted set whose members are `timestamp-tiebreaker`
/// strings scored by their timestamp. The connection manager is created on
/// first use, so building the store never touches the network. After that
/// the manager reconnects on its own when the connection drops.
pub struct RedisSortedSetStore {
    client: redis::Client,
    prefix: String,
    manager: OnceCell<ConnectionManager>,
}

impl std::fmt::Debug for RedisSortedSetStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisSortedSetStore")
            .field("prefix", &self.prefix)
            .field("connected", &self.manager.initialized())
            .finish()
    }
}

impl RedisSortedSetStore {
    /// Create a store for the given Redis URL.
    ///
    /// Only the URL is validated here.
    pub fn new(url: &str, prefix: impl Into<String>) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        Ok(Self {
            client,
            prefix: prefix.into(),
            manager: OnceCell::new(),
        })
    }

    fn make_key(&self, key: &str) -> String {
        format!("{}:{}", self.prefix, key)
    }

    /// The shared connection manager, created on first call.
    ///
    /// A failed first connection leaves the cell empty so the next call
    /// tries again.
    async fn connection(&self) -> Result<ConnectionManager, StoreError> {
        let manager = self
            .manager
            .get_or_try_init(|| async {
                let config = ConnectionManagerConfig::new().set_number_of_retries(RECONNECT_RETRIES);
                let manager = self.client.get_connection_manager_with_config(config).await?;
                info!(prefix = %self.prefix, "Connected to shared rate limit store");
                Ok::<_, StoreError>(manager)
            })
            .await?;
        Ok(manager.clone())
    }
}

#[async_trait]
impl SharedStore for RedisSortedSetStore {
    async fn record(
        &self,
        key: &str,
        window_start_ms: i64,
        now_ms: u64,
        member: &str,
        ttl_ms: u64,
    ) -> Result<u64, StoreError> {
        let key = self.make_key(key);
        let mut conn = self.connection().await?;

        let (count,): (u64,) = redis::pipe()
            .atomic()
            .cmd("ZREMRANGEBYSCORE")
            .arg(&key)
            .arg("-inf")
            .arg(window_start_ms)
            .ignore()
            .cmd("ZCARD")
            .arg(&key)
            .cmd("ZADD")
            .arg(&key)
            .arg(now_ms)
            .arg(member)
            .ignore()
            .cmd("PEXPIRE")
            .arg(&key)
            .arg(ttl_ms)
            .ignore()
            .query_async(&mut conn)
            .await?;

        Ok(count)
    }

    async fn withdraw(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let key = self.make_key(key);
        let mut conn = self.connection().await?;

        let _: u64 = redis::cmd("ZREM")
            .arg(&key)
            .arg(member)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        let key = self.make_key(key);
        let mut conn = self.connection().await?;

        let _: u64 = redis::cmd("DEL").arg(&key).query_async(&mut conn).await?;
        Ok(())
    }

    async fn cardinality(&self, key: &str) -> Result<u64, StoreError> {
        let key = self.make_key(key);
        let mut conn = self.connection().await?;

        let count: u64 = redis::cmd("ZCARD").arg(&key).query_async(&mut conn).await?;
        Ok(count)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;

        let reply: String = redis::cmd("PING").query_async(&mut conn).await?;

        match reply {
            reply if reply == "PONG" => Ok(()),
            reply => Err(StoreError::Unavailable(format!("unexpected PING reply: {}", reply))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_key_prefix() {
        let store = RedisSortedSetStore::new("redis://127.0.0.1:6379", "tollgate:ratelimit").unwrap();
        assert_eq!(store.make_key("login:1.2.3.4"), "tollgate:ratelimit:login:1.2.3.4");
    }

    #[test]
    fn test_invalid_url_rejected() {
        assert_err!(RedisSortedSetStore::new("not a url", "p"));
        assert_ok!(RedisSortedSetStore::new("redis://user:pw@cache:6380/2", "p"));
    }

    #[tokio::test]
    async fn test_unreachable_server_is_an_error() {
        // Port 1 is reserved and nothing listens there
        let store = RedisSortedSetStore::new("redis://127.0.0.1:1", "p").unwrap();
        assert_err!(store.ping().await);
        // A failed first connection is not cached
        assert!(!store.manager.initialized());
        assert_err!(store.cardinality("k").await);
    }
}
