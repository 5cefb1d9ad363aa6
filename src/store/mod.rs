//! Storage provider abstraction.
//!
//! The synchronization core talks to the shared store through two narrow
//! traits. [`Store`] covers the command side (hashes, lists, key scans,
//! publishing); [`Subscriber`] covers the subscription side, which lives on
//! its own connection because a subscribed connection cannot issue arbitrary
//! commands. Backends: [`redis`] for production, [`memory`] for tests and
//! store-less development.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod memory;
pub mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::{RedisStore, RedisSubscriber};

/// Scan batch size passed to the store's cursor.
pub const SCAN_BATCH_SIZE: usize = 100;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("connection error: {0}")]
    Connection(String),
    #[error("command error: {0}")]
    Command(String),
    #[error("subscribe error: {0}")]
    Subscribe(String),
    #[error("decode error: {0}")]
    Decode(String),
}

impl StoreError {
    /// Get a static error code string for metrics and log labeling.
    #[inline]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Connection(_) => "connection",
            Self::Command(_) => "command",
            Self::Subscribe(_) => "subscribe",
            Self::Decode(_) => "decode",
        }
    }
}

/// One message delivered by a subscription.
#[derive(Debug, Clone)]
pub struct StoreMessage {
    /// The literal channel the message was published on.
    pub channel: String,
    /// The raw payload as published.
    pub payload: String,
}

/// Command-side store operations.
#[async_trait]
pub trait Store: Send + Sync {
    /// Set hash fields on `key` (HSET semantics, existing fields overwritten).
    async fn hash_set(&self, key: &str, fields: Vec<(String, String)>) -> Result<(), StoreError>;

    /// Read every field of the hash at `key`. Missing key yields an empty vec.
    async fn hash_get_all(&self, key: &str) -> Result<Vec<(String, String)>, StoreError>;

    /// Prepend a value to the list at `key` (LPUSH semantics).
    async fn list_push_front(&self, key: &str, value: String) -> Result<(), StoreError>;

    /// Trim the list at `key` to the inclusive index range (LTRIM semantics).
    async fn list_trim(&self, key: &str, start: i64, stop: i64) -> Result<(), StoreError>;

    /// Read the inclusive index range of the list at `key` (LRANGE semantics,
    /// negative indexes count from the tail).
    async fn list_range(&self, key: &str, start: i64, stop: i64)
        -> Result<Vec<String>, StoreError>;

    /// Delete keys. Missing keys are ignored.
    async fn delete(&self, keys: &[String]) -> Result<(), StoreError>;

    /// Publish a payload on a channel.
    async fn publish(&self, channel: &str, payload: String) -> Result<(), StoreError>;

    /// Enumerate every key matching the glob `pattern`, driving the store's
    /// cursor in batches of [`SCAN_BATCH_SIZE`] until exhaustion.
    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, StoreError>;
}

/// Subscription-side store operations.
///
/// Each subscription yields a receiver carrying every message for that
/// channel (or pattern) in delivery order. The channel string passed to
/// subscribe is the identity used for unsubscribe; dropping the receiver
/// alone does not release the store-side subscription.
#[async_trait]
pub trait Subscriber: Send + Sync {
    /// Subscribe to one exact channel.
    async fn subscribe(
        &self,
        channel: &str,
    ) -> Result<mpsc::UnboundedReceiver<StoreMessage>, StoreError>;

    /// Release an exact-channel subscription.
    async fn unsubscribe(&self, channel: &str) -> Result<(), StoreError>;

    /// Subscribe to every channel matching a glob pattern.
    async fn psubscribe(
        &self,
        pattern: &str,
    ) -> Result<mpsc::UnboundedReceiver<StoreMessage>, StoreError>;

    /// Release a pattern subscription.
    async fn punsubscribe(&self, pattern: &str) -> Result<(), StoreError>;
}
