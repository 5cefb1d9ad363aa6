//! Redis-backed store.
//!
//! Two connections share one endpoint configuration: [`RedisStore`] issues
//! commands over a `ConnectionManager` (reconnection is the client library's
//! job), while [`RedisSubscriber`] owns a dedicated pub/sub connection, since
//! a subscribed connection cannot issue arbitrary commands. Incoming messages
//! are routed to per-channel senders by a driver task.

use super::{Store, StoreError, StoreMessage, Subscriber, SCAN_BATCH_SIZE};
use crate::config::RedisConfig;
use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::StreamExt;
use redis::aio::{ConnectionManager, PubSubSink, PubSubStream};
use redis::{AsyncCommands, Client, ScanOptions};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

/// Connect the command/subscribe client pair against one endpoint.
pub async fn connect_pair(
    config: &RedisConfig,
) -> Result<(Arc<RedisStore>, Arc<RedisSubscriber>), StoreError> {
    let store = RedisStore::connect(config).await?;
    let subscriber = RedisSubscriber::connect(config).await?;
    info!(url = %config.url, "Connected store client pair");
    Ok((Arc::new(store), Arc::new(subscriber)))
}

/// Command-side client.
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    /// Open the command connection.
    pub async fn connect(config: &RedisConfig) -> Result<Self, StoreError> {
        let client =
            Client::open(config.url.as_str()).map_err(|e| StoreError::Connection(e.to_string()))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn hash_set(&self, key: &str, fields: Vec<(String, String)>) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .hset_multiple(key, &fields)
            .await
            .map_err(|e| StoreError::Command(e.to_string()))?;
        Ok(())
    }

    async fn hash_get_all(&self, key: &str) -> Result<Vec<(String, String)>, StoreError> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn
            .hgetall(key)
            .await
            .map_err(|e| StoreError::Command(e.to_string()))?;
        Ok(fields.into_iter().collect())
    }

    async fn list_push_front(&self, key: &str, value: String) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .lpush(key, value)
            .await
            .map_err(|e| StoreError::Command(e.to_string()))?;
        Ok(())
    }

    async fn list_trim(&self, key: &str, start: i64, stop: i64) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .ltrim(key, start as isize, stop as isize)
            .await
            .map_err(|e| StoreError::Command(e.to_string()))?;
        Ok(())
    }

    async fn list_range(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        let items: Vec<String> = conn
            .lrange(key, start as isize, stop as isize)
            .await
            .map_err(|e| StoreError::Command(e.to_string()))?;
        Ok(items)
    }

    async fn delete(&self, keys: &[String]) -> Result<(), StoreError> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let _: () = conn
            .del(keys.to_vec())
            .await
            .map_err(|e| StoreError::Command(e.to_string()))?;
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: String) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .publish(channel, payload)
            .await
            .map_err(|e| StoreError::Command(e.to_string()))?;
        Ok(())
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        let opts = ScanOptions::default()
            .with_pattern(pattern)
            .with_count(SCAN_BATCH_SIZE);
        let mut iter = conn
            .scan_options::<String>(opts)
            .await
            .map_err(|e| StoreError::Command(e.to_string()))?;

        let mut keys = Vec::new();
        while let Some(key) = iter.next_item().await {
            keys.push(key);
        }
        Ok(keys)
    }
}

type Routes = Arc<DashMap<String, mpsc::UnboundedSender<StoreMessage>>>;

/// Subscription-side client.
///
/// Subscriptions are keyed by the exact channel or pattern string, so the
/// identity used for subscribe is the one used for unsubscribe.
pub struct RedisSubscriber {
    sink: Mutex<PubSubSink>,
    routes: Routes,
}

impl RedisSubscriber {
    /// Open the pub/sub connection and spawn its driver task.
    pub async fn connect(config: &RedisConfig) -> Result<Self, StoreError> {
        let client =
            Client::open(config.url.as_str()).map_err(|e| StoreError::Connection(e.to_string()))?;
        let pubsub = client
            .get_async_pubsub()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        let (sink, stream) = pubsub.split();

        let routes: Routes = Arc::new(DashMap::new());
        tokio::spawn(drive_messages(stream, Arc::clone(&routes)));

        Ok(Self {
            sink: Mutex::new(sink),
            routes,
        })
    }

    async fn register(
        &self,
        key: &str,
        pattern: bool,
    ) -> Result<mpsc::UnboundedReceiver<StoreMessage>, StoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.routes.insert(key.to_string(), tx);

        let mut sink = self.sink.lock().await;
        let result = if pattern {
            sink.psubscribe(key).await
        } else {
            sink.subscribe(key).await
        };
        if let Err(e) = result {
            self.routes.remove(key);
            return Err(StoreError::Subscribe(e.to_string()));
        }
        debug!(key = %key, pattern = pattern, "Subscribed");
        Ok(rx)
    }

    async fn release(&self, key: &str, pattern: bool) -> Result<(), StoreError> {
        let mut sink = self.sink.lock().await;
        let result = if pattern {
            sink.punsubscribe(key).await
        } else {
            sink.unsubscribe(key).await
        };
        result.map_err(|e| StoreError::Subscribe(e.to_string()))?;
        drop(sink);

        self.routes.remove(key);
        debug!(key = %key, pattern = pattern, "Unsubscribed");
        Ok(())
    }
}

#[async_trait]
impl Subscriber for RedisSubscriber {
    async fn subscribe(
        &self,
        channel: &str,
    ) -> Result<mpsc::UnboundedReceiver<StoreMessage>, StoreError> {
        self.register(channel, false).await
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), StoreError> {
        self.release(channel, false).await
    }

    async fn psubscribe(
        &self,
        pattern: &str,
    ) -> Result<mpsc::UnboundedReceiver<StoreMessage>, StoreError> {
        self.register(pattern, true).await
    }

    async fn punsubscribe(&self, pattern: &str) -> Result<(), StoreError> {
        self.release(pattern, true).await
    }
}

/// Route incoming pub/sub messages to their subscription's sender.
///
/// Pattern deliveries route by the pattern that matched, exact deliveries by
/// the channel name. Unroutable messages are dropped; that window is normal
/// between a store-side unsubscribe and the route removal.
async fn drive_messages(mut stream: PubSubStream, routes: Routes) {
    while let Some(msg) = stream.next().await {
        let channel = msg.get_channel_name().to_string();
        let route = msg
            .get_pattern::<Option<String>>()
            .ok()
            .flatten()
            .unwrap_or_else(|| channel.clone());

        let payload: String = match msg.get_payload() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(channel = %channel, error = %e, "Dropping non-UTF8 pub/sub payload");
                continue;
            }
        };

        if let Some(tx) = routes.get(&route) {
            let _ = tx.send(StoreMessage { channel, payload });
        }
    }
    info!("Pub/sub stream closed");
}
