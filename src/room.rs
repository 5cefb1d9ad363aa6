//! Per-room state machine.
//!
//! A [`Room`] owns the local cache and store subscription for one room name
//! and fans incoming updates out to locally registered callbacks. State is
//! built lazily: the first `join` or data read fetches the snapshot and
//! history from the store, subscribes to the room's channel, and spawns the
//! update pump. Initialization is single-flight; concurrent first users share
//! one fetch+subscribe, and a failed attempt leaves the room uninitialized so
//! the next caller retries.
//!
//! # Lock order
//!
//! All mutable room state lives behind one async mutex. Callbacks are always
//! invoked after the lock is released, so a callback may call back into the
//! room without deadlocking.

use crate::error::{RoomError, RoomResult};
use crate::keys::{self, KeySet};
use crate::manager::{self, PublishOptions};
use crate::metrics;
use crate::payload::{self, Payload};
use crate::store::{Store, StoreMessage, Subscriber};
use serde_json::Value;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Callback invoked with `(snapshot, update, extra)`.
///
/// The snapshot argument is a defensive copy; mutating it never affects the
/// room or other callbacks. `update` is `None` exactly once, on the initial
/// delivery right after `join`.
pub type RoomCallback = Arc<dyn Fn(Payload, Option<Payload>, Option<Value>) + Send + Sync>;

/// Per-room behavior flags, fixed at creation.
///
/// The one exception is `enable_publish`, which a later producer acquisition
/// of the same room may upgrade from false to true.
#[derive(Debug, Clone)]
pub struct RoomOptions {
    /// Maintain the snapshot and deliver it to callbacks.
    pub enable_full_data: bool,
    /// Cap for the history list; 0 disables history.
    pub history_length: usize,
    /// Producer flag. Producers may publish and are never idle-reaped.
    pub enable_publish: bool,
    /// Delete any previous snapshot and history on this producer's first
    /// publish.
    pub clean_on_start_up: bool,
}

impl Default for RoomOptions {
    fn default() -> Self {
        Self {
            enable_full_data: true,
            history_length: 0,
            enable_publish: false,
            clean_on_start_up: false,
        }
    }
}

/// Per-call option override for [`Room::publish`]. Unset fields fall back to
/// the room's own options.
#[derive(Debug, Clone, Copy, Default)]
pub struct PublishOverride {
    pub enable_full_data: Option<bool>,
    pub history_length: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Uninitialized,
    Initializing,
    Initialized,
    Destroyed,
}

struct Registration {
    callback: RoomCallback,
    extra: Option<Value>,
}

struct RoomInner {
    lifecycle: Lifecycle,
    /// Last-writer-wins merge of every published payload.
    full_data: Payload,
    /// Raw payloads, newest first, capped at `history_length`.
    history: Vec<Payload>,
    /// Registered callbacks by subscriber id. Re-registering overwrites.
    callbacks: HashMap<String, Registration>,
    /// Set when the room is initialized and has no callbacks, cleared on
    /// join. The reaper compares this against the idle timeout.
    idle_since: Option<Instant>,
    /// Whether the clean-on-startup delete already ran.
    cleaned: bool,
    pump: Option<JoinHandle<()>>,
}

/// A named, process-local handle onto a shared snapshot and update stream.
pub struct Room {
    name: String,
    keys: KeySet,
    pattern: bool,
    enable_full_data: bool,
    history_length: usize,
    clean_on_start_up: bool,
    producer: AtomicBool,
    store: Arc<dyn Store>,
    subscriber: Arc<dyn Subscriber>,
    inner: Mutex<RoomInner>,
}

impl std::fmt::Debug for Room {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Room")
            .field("name", &self.name)
            .field("pattern", &self.pattern)
            .field("enable_full_data", &self.enable_full_data)
            .field("history_length", &self.history_length)
            .field("clean_on_start_up", &self.clean_on_start_up)
            .finish_non_exhaustive()
    }
}

impl Room {
    pub(crate) fn new(
        name: impl Into<String>,
        prefix: &str,
        opts: RoomOptions,
        store: Arc<dyn Store>,
        subscriber: Arc<dyn Subscriber>,
    ) -> Self {
        let name = name.into();
        let keys = KeySet::new(prefix, &name);
        let pattern = keys::is_pattern(&name);
        Self {
            name,
            keys,
            pattern,
            enable_full_data: opts.enable_full_data,
            history_length: opts.history_length,
            clean_on_start_up: opts.clean_on_start_up,
            producer: AtomicBool::new(opts.enable_publish),
            store,
            subscriber,
            inner: Mutex::new(RoomInner {
                lifecycle: Lifecycle::Uninitialized,
                full_data: Payload::new(),
                history: Vec::new(),
                callbacks: HashMap::new(),
                idle_since: None,
                cleaned: false,
                pump: None,
            }),
        }
    }

    /// The room name as given at creation.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the name contains the `*` wildcard.
    pub fn is_pattern(&self) -> bool {
        self.pattern
    }

    /// Whether the room may publish (and is exempt from idle reaping).
    pub fn is_producer(&self) -> bool {
        self.producer.load(Ordering::Acquire)
    }

    pub(crate) fn mark_producer(&self) {
        self.producer.store(true, Ordering::Release);
    }

    /// Number of registered callbacks.
    pub async fn subscriber_count(&self) -> usize {
        self.inner.lock().await.callbacks.len()
    }

    /// Whether snapshot, history, and subscription are live.
    pub async fn is_initialized(&self) -> bool {
        self.inner.lock().await.lifecycle == Lifecycle::Initialized
    }

    /// Register a callback and deliver the current snapshot.
    ///
    /// The callback is registered (overwriting any prior entry for
    /// `subscriber_id`) before initialization runs; if initialization fails
    /// the error propagates but the registration stays, and a later call
    /// retries. On success the callback is invoked once with
    /// `(snapshot, None, extra)` before this method returns.
    pub async fn join(
        self: &Arc<Self>,
        subscriber_id: impl Into<String>,
        callback: RoomCallback,
        extra: Option<Value>,
    ) -> RoomResult<()> {
        let id = subscriber_id.into();
        let mut inner = self.inner.lock().await;
        if inner.lifecycle == Lifecycle::Destroyed {
            return Err(RoomError::Destroyed(self.name.clone()));
        }

        inner.idle_since = None;
        inner.callbacks.insert(
            id.clone(),
            Registration {
                callback: Arc::clone(&callback),
                extra: extra.clone(),
            },
        );

        self.ensure_initialized(&mut inner).await?;
        let snapshot = inner.full_data.clone();
        drop(inner);

        debug!(room = %self.name, subscriber = %id, "Subscriber joined");
        invoke_callback(&self.name, &callback, snapshot, None, extra);
        Ok(())
    }

    /// Remove a callback registration. Purely local, never fails.
    pub async fn leave(&self, subscriber_id: &str) {
        let mut inner = self.inner.lock().await;
        if inner.callbacks.remove(subscriber_id).is_some() {
            debug!(room = %self.name, subscriber = %subscriber_id, "Subscriber left");
        }
        if inner.callbacks.is_empty() && inner.lifecycle == Lifecycle::Initialized {
            inner.idle_since = Some(Instant::now());
        }
    }

    /// Current snapshot, initializing the room first if needed.
    ///
    /// Returns a copy; callers may mutate it freely.
    pub async fn get_full_data(self: &Arc<Self>) -> RoomResult<Payload> {
        let mut inner = self.inner.lock().await;
        self.ensure_initialized(&mut inner).await?;
        Ok(inner.full_data.clone())
    }

    /// Current history, newest first, initializing the room first if needed.
    ///
    /// Returns a copy; callers may mutate it freely.
    pub async fn get_history_data(self: &Arc<Self>) -> RoomResult<Vec<Payload>> {
        let mut inner = self.inner.lock().await;
        self.ensure_initialized(&mut inner).await?;
        Ok(inner.history.clone())
    }

    /// Publish an update through this room. Producers only.
    ///
    /// On the first publish of a room created with `clean_on_start_up`, the
    /// existing snapshot and history keys are deleted before writing.
    pub async fn publish(
        &self,
        data: Value,
        overrides: Option<PublishOverride>,
    ) -> RoomResult<()> {
        let mut inner = self.inner.lock().await;
        if inner.lifecycle == Lifecycle::Destroyed {
            return Err(RoomError::Destroyed(self.name.clone()));
        }
        if !self.is_producer() {
            return Err(RoomError::NotAProducer(self.name.clone()));
        }

        if self.clean_on_start_up && !inner.cleaned {
            self.store
                .delete(&[
                    self.keys.snapshot().to_string(),
                    self.keys.history().to_string(),
                ])
                .await?;
            inner.cleaned = true;
            info!(room = %self.name, "Cleared previous room state before first publish");
        }
        drop(inner);

        let overrides = overrides.unwrap_or_default();
        let opts = PublishOptions {
            enable_full_data: overrides.enable_full_data.unwrap_or(self.enable_full_data),
            history_length: overrides.history_length.unwrap_or(self.history_length),
        };
        manager::publish_to_store(self.store.as_ref(), &self.keys, data, &opts).await
    }

    /// Tear the room down: release the subscription, clear callbacks and
    /// cached state. Terminal and idempotent; any later operation on this
    /// handle fails with [`RoomError::Destroyed`].
    pub async fn destroy(&self) -> RoomResult<()> {
        let mut inner = self.inner.lock().await;
        if inner.lifecycle == Lifecycle::Destroyed {
            return Ok(());
        }
        let was_initialized = inner.lifecycle == Lifecycle::Initialized;
        inner.lifecycle = Lifecycle::Destroyed;
        inner.callbacks.clear();
        inner.idle_since = None;
        inner.full_data.clear();
        inner.history.clear();
        if let Some(pump) = inner.pump.take() {
            pump.abort();
        }
        drop(inner);

        if was_initialized {
            let released = if self.pattern {
                self.subscriber.punsubscribe(self.keys.channel()).await
            } else {
                self.subscriber.unsubscribe(self.keys.channel()).await
            };
            if let Err(e) = released {
                warn!(room = %self.name, error = %e, "Unsubscribe failed during destroy");
                return Err(e.into());
            }
        }
        info!(room = %self.name, "Room destroyed");
        Ok(())
    }

    /// Whether the idle reaper should destroy this room right now.
    pub(crate) async fn reap_candidate(&self, now: Instant, idle_timeout: Duration) -> bool {
        if self.is_producer() {
            return false;
        }
        let inner = self.inner.lock().await;
        if inner.lifecycle != Lifecycle::Initialized || !inner.callbacks.is_empty() {
            return false;
        }
        match inner.idle_since {
            Some(since) => now.duration_since(since) > idle_timeout,
            None => false,
        }
    }

    /// Bring the room to `Initialized`, fetching state and subscribing on
    /// first use.
    ///
    /// The caller holds the state lock across the whole attempt, which is
    /// what makes initialization single-flight: concurrent first users queue
    /// on the lock and find the room initialized when they get it. On failure
    /// the lifecycle resets to `Uninitialized` so the next caller starts a
    /// fresh attempt.
    async fn ensure_initialized(self: &Arc<Self>, inner: &mut RoomInner) -> RoomResult<()> {
        match inner.lifecycle {
            Lifecycle::Initialized => return Ok(()),
            Lifecycle::Destroyed => return Err(RoomError::Destroyed(self.name.clone())),
            Lifecycle::Uninitialized | Lifecycle::Initializing => {}
        }

        inner.lifecycle = Lifecycle::Initializing;
        match self.initialize(inner).await {
            Ok(()) => {
                inner.lifecycle = Lifecycle::Initialized;
                if inner.callbacks.is_empty() {
                    inner.idle_since = Some(Instant::now());
                }
                info!(room = %self.name, pattern = self.pattern, "Room initialized");
                Ok(())
            }
            Err(e) => {
                inner.lifecycle = Lifecycle::Uninitialized;
                warn!(room = %self.name, error = %e, "Room initialization failed");
                Err(e)
            }
        }
    }

    async fn initialize(self: &Arc<Self>, inner: &mut RoomInner) -> RoomResult<()> {
        let (full_data, history) = if self.pattern {
            self.fetch_aggregated().await?
        } else {
            self.fetch_single().await?
        };

        let rx = if self.pattern {
            self.subscriber.psubscribe(self.keys.channel()).await?
        } else {
            self.subscriber.subscribe(self.keys.channel()).await?
        };

        inner.full_data = full_data;
        inner.history = history;
        inner.pump = Some(self.spawn_pump(rx));
        Ok(())
    }

    /// Snapshot and history fetch for a literal room. The two reads run
    /// concurrently; disabled structures are skipped.
    async fn fetch_single(&self) -> RoomResult<(Payload, Vec<Payload>)> {
        let snapshot_read = async {
            if self.enable_full_data {
                self.store.hash_get_all(self.keys.snapshot()).await
            } else {
                Ok(Vec::new())
            }
        };
        let history_read = async {
            if self.history_length > 0 {
                self.store.list_range(self.keys.history(), 0, -1).await
            } else {
                Ok(Vec::new())
            }
        };
        let (fields, raw_history) = tokio::try_join!(snapshot_read, history_read)?;

        let full_data = payload::decode_snapshot(fields);
        let mut history: Vec<Payload> = raw_history
            .iter()
            .filter_map(|raw| payload::decode_history_entry(raw))
            .collect();
        history.truncate(self.history_length);
        Ok((full_data, history))
    }

    /// Snapshot and history fetch for a pattern room: enumerate matching
    /// keys, merge every snapshot (last writer wins, order undefined) and
    /// concatenate every history list. A key that fails to read is skipped;
    /// the rest of the aggregation proceeds.
    async fn fetch_aggregated(&self) -> RoomResult<(Payload, Vec<Payload>)> {
        let mut full_data = Payload::new();
        if self.enable_full_data {
            for key in self.store.scan_keys(self.keys.snapshot()).await? {
                match self.store.hash_get_all(&key).await {
                    Ok(fields) => {
                        payload::merge_update(&mut full_data, &payload::decode_snapshot(fields));
                    }
                    Err(e) => {
                        warn!(room = %self.name, key = %key, error = %e,
                            "Skipping unreadable snapshot during aggregation");
                    }
                }
            }
        }

        let mut history = Vec::new();
        if self.history_length > 0 {
            for key in self.store.scan_keys(self.keys.history()).await? {
                match self.store.list_range(&key, 0, -1).await {
                    Ok(items) => {
                        history.extend(items.iter().filter_map(|raw| payload::decode_history_entry(raw)));
                    }
                    Err(e) => {
                        warn!(room = %self.name, key = %key, error = %e,
                            "Skipping unreadable history during aggregation");
                    }
                }
            }
            payload::sort_history_by_timestamp(&mut history);
            history.truncate(self.history_length);
        }

        Ok((full_data, history))
    }

    fn spawn_pump(self: &Arc<Self>, mut rx: mpsc::UnboundedReceiver<StoreMessage>) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let room_name = self.name.clone();
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let Some(room) = weak.upgrade() else { break };
                room.apply_update(msg).await;
            }
            debug!(room = %room_name, "Update pump stopped");
        })
    }

    /// Merge one incoming update into the cache and dispatch to callbacks.
    async fn apply_update(&self, msg: StoreMessage) {
        let update = match serde_json::from_str::<Value>(&msg.payload) {
            Ok(Value::Object(map)) => map,
            Ok(_) | Err(_) => {
                metrics::MESSAGES_DROPPED.inc();
                warn!(room = %self.name, channel = %msg.channel, "Dropping malformed update message");
                return;
            }
        };

        let mut inner = self.inner.lock().await;
        if inner.lifecycle != Lifecycle::Initialized {
            return;
        }
        if self.enable_full_data {
            payload::merge_update(&mut inner.full_data, &update);
        }
        if self.history_length > 0 {
            inner.history.insert(0, update.clone());
            inner.history.truncate(self.history_length);
        }
        let snapshot = inner.full_data.clone();
        let targets: Vec<(RoomCallback, Option<Value>)> = inner
            .callbacks
            .values()
            .map(|reg| (Arc::clone(&reg.callback), reg.extra.clone()))
            .collect();
        drop(inner);

        for (callback, extra) in targets {
            invoke_callback(
                &self.name,
                &callback,
                snapshot.clone(),
                Some(update.clone()),
                extra,
            );
            metrics::CALLBACKS_DISPATCHED.inc();
        }
    }
}

/// Invoke one callback, containing any panic so the remaining callbacks (and
/// the update pump) keep running.
fn invoke_callback(
    room: &str,
    callback: &RoomCallback,
    full_data: Payload,
    update: Option<Payload>,
    extra: Option<Value>,
) {
    let result = catch_unwind(AssertUnwindSafe(|| callback(full_data, update, extra)));
    if result.is_err() {
        error!(room = %room, "Subscriber callback panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn test_room(name: &str, opts: RoomOptions) -> Arc<Room> {
        let store = Arc::new(MemoryStore::new());
        Arc::new(Room::new(
            name,
            "room",
            opts,
            Arc::clone(&store) as Arc<dyn Store>,
            store as Arc<dyn Subscriber>,
        ))
    }

    #[tokio::test]
    async fn test_publish_requires_producer() {
        let room = test_room("r", RoomOptions::default());
        let err = room.publish(json!({"a": 1}), None).await.unwrap_err();
        assert!(matches!(err, RoomError::NotAProducer(_)));
    }

    #[tokio::test]
    async fn test_join_delivers_initial_snapshot() {
        let room = test_room("r", RoomOptions::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);

        room.join(
            "u1",
            Arc::new(move |_full, update, _extra| {
                assert!(update.is_none());
                seen.fetch_add(1, Ordering::SeqCst);
            }),
            None,
        )
        .await
        .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(room.is_initialized().await);
        assert_eq!(room.subscriber_count().await, 1);
    }

    #[tokio::test]
    async fn test_rejoin_overwrites_registration() {
        let room = test_room("r", RoomOptions::default());
        let noop: RoomCallback = Arc::new(|_, _, _| {});
        room.join("u1", Arc::clone(&noop), None).await.unwrap();
        room.join("u1", noop, None).await.unwrap();
        assert_eq!(room.subscriber_count().await, 1);
    }

    #[tokio::test]
    async fn test_destroy_is_terminal_and_idempotent() {
        let room = test_room("r", RoomOptions::default());
        room.get_full_data().await.unwrap();
        assert!(room.is_initialized().await);

        room.destroy().await.unwrap();
        room.destroy().await.unwrap();

        let err = room.get_full_data().await.unwrap_err();
        assert!(matches!(err, RoomError::Destroyed(_)));
        let noop: RoomCallback = Arc::new(|_, _, _| {});
        let err = room.join("u1", noop, None).await.unwrap_err();
        assert!(matches!(err, RoomError::Destroyed(_)));
    }

    #[tokio::test]
    async fn test_leave_marks_idle_only_when_initialized() {
        let room = test_room("r", RoomOptions::default());
        // Not initialized yet: leaving must not mark the room idle.
        room.leave("ghost").await;
        assert!(
            !room
                .reap_candidate(Instant::now() + Duration::from_secs(3600), Duration::ZERO)
                .await
        );

        let noop: RoomCallback = Arc::new(|_, _, _| {});
        room.join("u1", noop, None).await.unwrap();
        room.leave("u1").await;
        assert!(
            room.reap_candidate(Instant::now() + Duration::from_secs(3600), Duration::ZERO)
                .await
        );
    }

    #[tokio::test]
    async fn test_producer_never_reap_candidate() {
        let room = test_room(
            "r",
            RoomOptions {
                enable_publish: true,
                ..RoomOptions::default()
            },
        );
        room.get_full_data().await.unwrap();
        assert!(
            !room
                .reap_candidate(Instant::now() + Duration::from_secs(3600), Duration::ZERO)
                .await
        );
    }
}
