//! In-process store backend.
//!
//! Implements both halves of the store abstraction over process-local
//! collections and an internal pub/sub bus. Used by the test suite and by
//! hosts that want the room machinery without an external store. Glob
//! matching supports the `*` wildcard only, which is all the key layout
//! produces.

use super::{Store, StoreError, StoreMessage, Subscriber};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::trace;

/// Match `pattern` (literal text plus `*` wildcards) against `input`.
pub fn glob_match(pattern: &str, input: &str) -> bool {
    let segments: Vec<&str> = pattern.split('*').collect();
    if segments.len() == 1 {
        return pattern == input;
    }

    let mut rest = input;
    for (i, segment) in segments.iter().enumerate() {
        if i == 0 {
            match rest.strip_prefix(segment) {
                Some(r) => rest = r,
                None => return false,
            }
        } else if i == segments.len() - 1 {
            return segment.is_empty() || rest.ends_with(segment);
        } else if segment.is_empty() {
            continue;
        } else {
            match rest.find(segment) {
                Some(idx) => rest = &rest[idx + segment.len()..],
                None => return false,
            }
        }
    }
    true
}

/// Shared in-process store.
///
/// A single instance serves as both the command client and the subscribe
/// client; clone the `Arc` for each role.
#[derive(Default)]
pub struct MemoryStore {
    hashes: DashMap<String, HashMap<String, String>>,
    lists: DashMap<String, Vec<String>>,
    /// Active subscriptions keyed by the channel or pattern string used to
    /// subscribe. A key containing `*` matches published channels by glob.
    subscriptions: DashMap<String, mpsc::UnboundedSender<StoreMessage>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live subscriptions, patterns included.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    fn register(
        &self,
        key: &str,
    ) -> Result<mpsc::UnboundedReceiver<StoreMessage>, StoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscriptions.insert(key.to_string(), tx);
        trace!(key = %key, "Subscription registered");
        Ok(rx)
    }

    fn release(&self, key: &str) -> Result<(), StoreError> {
        self.subscriptions.remove(key);
        trace!(key = %key, "Subscription released");
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn hash_set(&self, key: &str, fields: Vec<(String, String)>) -> Result<(), StoreError> {
        let mut hash = self.hashes.entry(key.to_string()).or_default();
        for (field, value) in fields {
            hash.insert(field, value);
        }
        Ok(())
    }

    async fn hash_get_all(&self, key: &str) -> Result<Vec<(String, String)>, StoreError> {
        Ok(self
            .hashes
            .get(key)
            .map(|hash| hash.iter().map(|(f, v)| (f.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    async fn list_push_front(&self, key: &str, value: String) -> Result<(), StoreError> {
        self.lists.entry(key.to_string()).or_default().insert(0, value);
        Ok(())
    }

    async fn list_trim(&self, key: &str, start: i64, stop: i64) -> Result<(), StoreError> {
        if let Some(mut list) = self.lists.get_mut(key) {
            let len = list.len() as i64;
            let start = normalize_index(start, len).max(0);
            let stop = normalize_index(stop, len).min(len - 1);
            if start > stop || len == 0 {
                list.clear();
            } else {
                let trimmed = list[start as usize..=stop as usize].to_vec();
                *list = trimmed;
            }
        }
        Ok(())
    }

    async fn list_range(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> Result<Vec<String>, StoreError> {
        Ok(self
            .lists
            .get(key)
            .map(|list| {
                let len = list.len() as i64;
                let start = normalize_index(start, len).max(0);
                let stop = normalize_index(stop, len).min(len - 1);
                if start > stop || len == 0 {
                    Vec::new()
                } else {
                    list[start as usize..=stop as usize].to_vec()
                }
            })
            .unwrap_or_default())
    }

    async fn delete(&self, keys: &[String]) -> Result<(), StoreError> {
        for key in keys {
            self.hashes.remove(key);
            self.lists.remove(key);
        }
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: String) -> Result<(), StoreError> {
        // Collect matching senders first, then deliver; a send failure means
        // the receiver side is gone and the subscription entry is stale.
        let mut stale = Vec::new();
        for entry in self.subscriptions.iter() {
            let key = entry.key();
            let matches = if key.contains('*') {
                glob_match(key, channel)
            } else {
                key == channel
            };
            if !matches {
                continue;
            }
            let message = StoreMessage {
                channel: channel.to_string(),
                payload: payload.clone(),
            };
            if entry.value().send(message).is_err() {
                stale.push(key.clone());
            }
        }
        for key in stale {
            self.subscriptions.remove(&key);
        }
        Ok(())
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let mut keys: Vec<String> = self
            .hashes
            .iter()
            .map(|e| e.key().clone())
            .chain(self.lists.iter().map(|e| e.key().clone()))
            .filter(|key| glob_match(pattern, key))
            .collect();
        keys.sort();
        keys.dedup();
        Ok(keys)
    }
}

#[async_trait]
impl Subscriber for MemoryStore {
    async fn subscribe(
        &self,
        channel: &str,
    ) -> Result<mpsc::UnboundedReceiver<StoreMessage>, StoreError> {
        self.register(channel)
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), StoreError> {
        self.release(channel)
    }

    async fn psubscribe(
        &self,
        pattern: &str,
    ) -> Result<mpsc::UnboundedReceiver<StoreMessage>, StoreError> {
        self.register(pattern)
    }

    async fn punsubscribe(&self, pattern: &str) -> Result<(), StoreError> {
        self.release(pattern)
    }
}

/// Resolve a possibly-negative list index against `len`.
fn normalize_index(index: i64, len: i64) -> i64 {
    if index < 0 {
        len + index
    } else {
        index
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_match() {
        assert!(glob_match("room:p:*:hash", "room:p:a:hash"));
        assert!(glob_match("room:p:*:hash", "room:p:a:b:hash"));
        assert!(!glob_match("room:p:*:hash", "room:q:a:hash"));
        assert!(!glob_match("room:p:*:hash", "room:p:a:list"));
        assert!(glob_match("*", "anything"));
        assert!(glob_match("exact", "exact"));
        assert!(!glob_match("exact", "exactly"));
        assert!(glob_match("a*b*c", "aXXbYYc"));
        assert!(!glob_match("a*b*c", "aXXcYYb"));
    }

    #[tokio::test]
    async fn test_hash_round_trip() {
        let store = MemoryStore::new();
        store
            .hash_set("k", vec![("a".into(), "1".into()), ("b".into(), "2".into())])
            .await
            .unwrap();
        store.hash_set("k", vec![("a".into(), "9".into())]).await.unwrap();

        let mut fields = store.hash_get_all("k").await.unwrap();
        fields.sort();
        assert_eq!(
            fields,
            vec![("a".to_string(), "9".to_string()), ("b".to_string(), "2".to_string())]
        );
        assert!(store.hash_get_all("missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_push_trim_range() {
        let store = MemoryStore::new();
        for i in 0..5 {
            store.list_push_front("l", format!("v{i}")).await.unwrap();
        }
        // Newest first: v4 v3 v2 v1 v0
        assert_eq!(
            store.list_range("l", 0, -1).await.unwrap(),
            vec!["v4", "v3", "v2", "v1", "v0"]
        );

        store.list_trim("l", 0, 2).await.unwrap();
        assert_eq!(
            store.list_range("l", 0, -1).await.unwrap(),
            vec!["v4", "v3", "v2"]
        );
    }

    #[tokio::test]
    async fn test_publish_routes_exact_and_pattern() {
        let store = MemoryStore::new();
        let mut exact = store.subscribe("room:a:channel").await.unwrap();
        let mut pattern = store.psubscribe("room:*:channel").await.unwrap();

        store.publish("room:a:channel", "payload".into()).await.unwrap();

        assert_eq!(exact.recv().await.unwrap().payload, "payload");
        let from_pattern = pattern.recv().await.unwrap();
        assert_eq!(from_pattern.channel, "room:a:channel");

        store.unsubscribe("room:a:channel").await.unwrap();
        store.punsubscribe("room:*:channel").await.unwrap();
        assert_eq!(store.subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_scan_keys() {
        let store = MemoryStore::new();
        store.hash_set("room:p:a:hash", vec![("f".into(), "v".into())]).await.unwrap();
        store.hash_set("room:p:b:hash", vec![("f".into(), "v".into())]).await.unwrap();
        store.hash_set("room:q:hash", vec![("f".into(), "v".into())]).await.unwrap();
        store.list_push_front("room:p:a:list", "x".into()).await.unwrap();

        assert_eq!(
            store.scan_keys("room:p:*:hash").await.unwrap(),
            vec!["room:p:a:hash", "room:p:b:hash"]
        );
        assert_eq!(store.scan_keys("room:p:*:list").await.unwrap(), vec!["room:p:a:list"]);
    }

    #[tokio::test]
    async fn test_delete_covers_both_structures() {
        let store = MemoryStore::new();
        store.hash_set("k:hash", vec![("f".into(), "v".into())]).await.unwrap();
        store.list_push_front("k:list", "x".into()).await.unwrap();

        store.delete(&["k:hash".to_string(), "k:list".to_string()]).await.unwrap();

        assert!(store.hash_get_all("k:hash").await.unwrap().is_empty());
        assert!(store.list_range("k:list", 0, -1).await.unwrap().is_empty());
    }
}
