//! Room manager: room registry, stateless publish, idle reaping.
//!
//! The manager owns the authoritative map of rooms (one instance per name
//! per process) and the store client pair every room shares. It also hosts
//! the stateless publish path, which writes and fans out without holding a
//! room instance at all.

use crate::config::SyncConfig;
use crate::error::{RoomError, RoomResult};
use crate::keys::{self, KeySet};
use crate::metrics;
use crate::payload;
use crate::room::{Room, RoomOptions};
use crate::store::{Store, StoreError, Subscriber};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Options for one publish on the stateless path.
#[derive(Debug, Clone, Copy)]
pub struct PublishOptions {
    /// Write the payload's fields into the snapshot hash.
    pub enable_full_data: bool,
    /// Push the payload onto the history list, trimmed to this cap. 0 skips
    /// the list entirely.
    pub history_length: usize,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            enable_full_data: true,
            history_length: 0,
        }
    }
}

/// Creates and looks up [`Room`]s, hosts the stateless publish, and runs the
/// periodic idle reaper.
pub struct RoomManager {
    store: Arc<dyn Store>,
    subscriber: Arc<dyn Subscriber>,
    config: SyncConfig,
    rooms: DashMap<String, Arc<Room>>,
    shutdown_tx: broadcast::Sender<()>,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl RoomManager {
    /// Build a manager over an already-connected store client pair.
    pub fn new(
        store: Arc<dyn Store>,
        subscriber: Arc<dyn Subscriber>,
        config: SyncConfig,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            store,
            subscriber,
            config,
            rooms: DashMap::new(),
            shutdown_tx,
            reaper: Mutex::new(None),
        }
    }

    /// Create a room, or return the existing instance for `name`.
    ///
    /// Requesting `enable_publish` on an existing room upgrades it to a
    /// producer in place (the "producer acquired after a consumer" case).
    /// Pattern names cannot be producers.
    pub fn create_room(&self, name: &str, opts: RoomOptions) -> RoomResult<Arc<Room>> {
        if name.is_empty() {
            return Err(RoomError::EmptyRoomName);
        }
        if keys::is_pattern(name) && opts.enable_publish {
            return Err(RoomError::PatternNotAllowedForProducer(name.to_string()));
        }

        let wants_producer = opts.enable_publish;
        match self.rooms.entry(name.to_string()) {
            Entry::Occupied(entry) => {
                let room = Arc::clone(entry.get());
                if wants_producer && !room.is_producer() {
                    room.mark_producer();
                    info!(room = %name, "Existing room upgraded to producer");
                }
                Ok(room)
            }
            Entry::Vacant(entry) => {
                let room = Arc::new(Room::new(
                    name,
                    &self.config.prefix,
                    opts,
                    Arc::clone(&self.store),
                    Arc::clone(&self.subscriber),
                ));
                entry.insert(Arc::clone(&room));
                metrics::ACTIVE_ROOMS.inc();
                debug!(room = %name, producer = wants_producer, "Room created");
                Ok(room)
            }
        }
    }

    /// Return the existing room for `name`, creating one with `opts` if none
    /// exists. Unlike [`Self::create_room`], an existing room is returned
    /// as-is, with no producer upgrade.
    pub fn get_room(&self, name: &str, opts: RoomOptions) -> RoomResult<Arc<Room>> {
        if let Some(room) = self.rooms.get(name) {
            return Ok(Arc::clone(room.value()));
        }
        self.create_room(name, opts)
    }

    /// Stateless publish: write the payload to the room's keys and fan it
    /// out, without creating or touching any local [`Room`].
    ///
    /// `None` options default to snapshot-on, history capped at the
    /// configured `default_history_length`.
    pub async fn publish(
        &self,
        name: &str,
        data: Value,
        opts: Option<PublishOptions>,
    ) -> RoomResult<()> {
        if name.is_empty() {
            return Err(RoomError::EmptyRoomName);
        }
        if keys::is_pattern(name) {
            return Err(RoomError::PatternNotAllowedForProducer(name.to_string()));
        }
        let opts = opts.unwrap_or(PublishOptions {
            enable_full_data: true,
            history_length: self.config.default_history_length,
        });
        let keys = KeySet::new(&self.config.prefix, name);
        publish_to_store(self.store.as_ref(), &keys, data, &opts).await
    }

    /// Schedule the idle reaper. Idempotent; a second call is a no-op.
    pub async fn start(self: &Arc<Self>) {
        let mut guard = self.reaper.lock().await;
        if guard.is_some() {
            return;
        }
        *guard = Some(self.spawn_reaper());
        info!(
            check_interval_secs = self.config.check_interval,
            idle_timeout_secs = self.config.idle_timeout,
            "Idle reaper scheduled"
        );
    }

    /// Stop the reaper and destroy every room. Best-effort; teardown errors
    /// are logged, not returned.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(());
        if let Some(handle) = self.reaper.lock().await.take() {
            handle.abort();
        }

        let rooms: Vec<(String, Arc<Room>)> = self
            .rooms
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();
        self.rooms.clear();
        for (name, room) in rooms {
            if let Err(e) = room.destroy().await {
                warn!(room = %name, error = %e, "Failed to destroy room during shutdown");
            }
        }
        metrics::ACTIVE_ROOMS.set(0);
        info!("Room manager stopped");
    }

    /// Number of rooms currently held.
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Whether a room instance exists for `name`.
    pub fn has_room(&self, name: &str) -> bool {
        self.rooms.contains_key(name)
    }

    /// Names of every room currently held.
    pub fn room_names(&self) -> Vec<String> {
        self.rooms.iter().map(|entry| entry.key().clone()).collect()
    }

    fn spawn_reaper(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::downgrade(self);
        let check_interval = self.config.check_interval();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(check_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately; consume it so sweeps
            // start one full interval after scheduling.
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let Some(manager) = manager.upgrade() else { break };
                        manager.sweep_idle_rooms().await;
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
            debug!("Idle reaper stopped");
        })
    }

    /// One reaper sweep: destroy and drop every initialized, callback-free
    /// consumer room whose idle time exceeds the timeout. Errors on one room
    /// are logged and do not stop the sweep.
    pub async fn sweep_idle_rooms(&self) {
        let now = Instant::now();
        let idle_timeout = self.config.idle_timeout();

        // Collect first, destroy after: destroying while iterating would
        // hold a map shard lock across an await.
        let rooms: Vec<(String, Arc<Room>)> = self
            .rooms
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();

        let mut reaped = 0usize;
        for (name, room) in rooms {
            if !room.reap_candidate(now, idle_timeout).await {
                continue;
            }
            // The room is dropped from the map even if the unsubscribe
            // fails; a destroyed room must not linger in the registry.
            if let Err(e) = room.destroy().await {
                warn!(room = %name, error = %e, "Failed to cleanly destroy idle room");
            }
            self.rooms.remove(&name);
            metrics::ACTIVE_ROOMS.dec();
            metrics::ROOMS_REAPED.inc();
            info!(room = %name, "Idle room reaped");
            reaped += 1;
        }
        if reaped > 0 {
            debug!(count = reaped, remaining = self.rooms.len(), "Reaper sweep complete");
        }
    }
}

/// Write one payload to a room's key triple and fan it out.
///
/// Non-object payloads are logged and ignored. The snapshot and history
/// writes run concurrently; the channel publish follows them. No atomicity
/// across the three structures is claimed.
pub(crate) async fn publish_to_store(
    store: &dyn Store,
    keys: &KeySet,
    data: Value,
    opts: &PublishOptions,
) -> RoomResult<()> {
    let update = match data.as_object() {
        Some(update) => update,
        None => {
            warn!(channel = %keys.channel(), "Ignoring publish of non-object payload");
            return Ok(());
        }
    };
    let encoded = serde_json::to_string(update)
        .map_err(|e| StoreError::Decode(e.to_string()))?;

    let snapshot_write = async {
        if opts.enable_full_data {
            let fields = payload::to_hash_fields(update);
            if !fields.is_empty() {
                store.hash_set(keys.snapshot(), fields).await?;
            }
        }
        Ok::<(), StoreError>(())
    };
    let history_write = async {
        if opts.history_length > 0 {
            store.list_push_front(keys.history(), encoded.clone()).await?;
            store
                .list_trim(keys.history(), 0, opts.history_length as i64 - 1)
                .await?;
        }
        Ok::<(), StoreError>(())
    };
    tokio::try_join!(snapshot_write, history_write)?;

    store.publish(keys.channel(), encoded).await?;
    metrics::PUBLISHES.inc();
    Ok(())
}
