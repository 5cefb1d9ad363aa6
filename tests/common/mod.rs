//! Integration test common infrastructure.
//!
//! Provides a service wired to an in-process store, a delegating store
//! wrapper that counts operations and can inject failures, and a callback
//! recorder for asserting on dispatch flows.

// Each test binary compiles its own copy and uses a subset of the helpers.
#![allow(dead_code)]

use async_trait::async_trait;
use roomsync::config::SyncConfig;
use roomsync::store::{MemoryStore, Store, StoreError, StoreMessage, Subscriber};
use roomsync::{Payload, RoomCallback, RoomService};
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Store wrapper that counts operations and can fail reads on demand.
pub struct CountingStore {
    inner: Arc<MemoryStore>,
    pub hash_reads: AtomicUsize,
    pub list_reads: AtomicUsize,
    pub subscribes: AtomicUsize,
    /// Number of upcoming `hash_get_all` calls that should fail.
    pub fail_hash_reads: AtomicUsize,
}

impl CountingStore {
    pub fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            hash_reads: AtomicUsize::new(0),
            list_reads: AtomicUsize::new(0),
            subscribes: AtomicUsize::new(0),
            fail_hash_reads: AtomicUsize::new(0),
        }
    }

    pub fn fail_next_hash_read(&self) {
        self.fail_hash_reads.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Store for CountingStore {
    async fn hash_set(&self, key: &str, fields: Vec<(String, String)>) -> Result<(), StoreError> {
        self.inner.hash_set(key, fields).await
    }

    async fn hash_get_all(&self, key: &str) -> Result<Vec<(String, String)>, StoreError> {
        self.hash_reads.fetch_add(1, Ordering::SeqCst);
        let pending = self.fail_hash_reads.load(Ordering::SeqCst);
        if pending > 0
            && self
                .fail_hash_reads
                .compare_exchange(pending, pending - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            return Err(StoreError::Command("injected hash read failure".into()));
        }
        self.inner.hash_get_all(key).await
    }

    async fn list_push_front(&self, key: &str, value: String) -> Result<(), StoreError> {
        self.inner.list_push_front(key, value).await
    }

    async fn list_trim(&self, key: &str, start: i64, stop: i64) -> Result<(), StoreError> {
        self.inner.list_trim(key, start, stop).await
    }

    async fn list_range(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> Result<Vec<String>, StoreError> {
        self.list_reads.fetch_add(1, Ordering::SeqCst);
        self.inner.list_range(key, start, stop).await
    }

    async fn delete(&self, keys: &[String]) -> Result<(), StoreError> {
        self.inner.delete(keys).await
    }

    async fn publish(&self, channel: &str, payload: String) -> Result<(), StoreError> {
        self.inner.publish(channel, payload).await
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        self.inner.scan_keys(pattern).await
    }
}

#[async_trait]
impl Subscriber for CountingStore {
    async fn subscribe(
        &self,
        channel: &str,
    ) -> Result<mpsc::UnboundedReceiver<StoreMessage>, StoreError> {
        self.subscribes.fetch_add(1, Ordering::SeqCst);
        self.inner.subscribe(channel).await
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), StoreError> {
        self.inner.unsubscribe(channel).await
    }

    async fn psubscribe(
        &self,
        pattern: &str,
    ) -> Result<mpsc::UnboundedReceiver<StoreMessage>, StoreError> {
        self.subscribes.fetch_add(1, Ordering::SeqCst);
        self.inner.psubscribe(pattern).await
    }

    async fn punsubscribe(&self, pattern: &str) -> Result<(), StoreError> {
        self.inner.punsubscribe(pattern).await
    }
}

/// A service over a fresh in-process store, plus handles to observe it.
pub struct TestBackend {
    pub service: RoomService,
    pub store: Arc<CountingStore>,
    pub raw: Arc<MemoryStore>,
}

impl TestBackend {
    pub fn new() -> Self {
        Self::with_config(SyncConfig::default())
    }

    pub fn with_config(sync: SyncConfig) -> Self {
        // First backend in the process installs the log subscriber; later
        // calls fail try_init and that is fine.
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .with_test_writer()
            .try_init();

        let raw = Arc::new(MemoryStore::new());
        let store = Arc::new(CountingStore::new(Arc::clone(&raw)));
        let service = RoomService::with_backend(
            Arc::clone(&store) as Arc<dyn Store>,
            Arc::clone(&store) as Arc<dyn Subscriber>,
            sync,
        );
        Self { service, store, raw }
    }
}

/// Records every `(snapshot, update)` pair a callback receives.
#[derive(Clone, Default)]
pub struct Recorder {
    calls: Arc<Mutex<Vec<(Payload, Option<Payload>)>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn callback(&self) -> RoomCallback {
        let calls = Arc::clone(&self.calls);
        Arc::new(move |full_data, update, _extra: Option<Value>| {
            calls.lock().expect("recorder lock poisoned").push((full_data, update));
        })
    }

    pub fn calls(&self) -> Vec<(Payload, Option<Payload>)> {
        self.calls.lock().expect("recorder lock poisoned").clone()
    }

    pub fn len(&self) -> usize {
        self.calls.lock().expect("recorder lock poisoned").len()
    }
}

/// Poll `cond` until it holds or roughly a second passes.
pub async fn wait_for<F: Fn() -> bool>(cond: F) -> bool {
    for _ in 0..200 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}
