//! Service facade.
//!
//! The thin surface hosting code talks to. It distinguishes intent:
//! [`RoomService::create_room`] acquires a producer (the room may publish and
//! is exempt from idle reaping), [`RoomService::get_room`] acquires a
//! consumer, and [`RoomService::publish`] writes without holding a room at
//! all. Everything else is delegation to the [`RoomManager`].

use crate::config::{Config, SyncConfig};
use crate::error::RoomResult;
use crate::manager::{PublishOptions, RoomManager};
use crate::room::{Room, RoomOptions};
use crate::store::{self, Store, Subscriber};
use serde_json::Value;
use std::sync::Arc;

/// Process-level entry point for room synchronization.
pub struct RoomService {
    manager: Arc<RoomManager>,
}

impl RoomService {
    /// Connect the store client pair and build the service.
    pub async fn connect(config: &Config) -> RoomResult<Self> {
        let (store, subscriber) = store::redis::connect_pair(&config.redis).await?;
        Ok(Self::with_backend(store, subscriber, config.sync.clone()))
    }

    /// Build the service over an already-connected backend. This is the
    /// entry point for the in-memory store.
    pub fn with_backend(
        store: Arc<dyn Store>,
        subscriber: Arc<dyn Subscriber>,
        sync: SyncConfig,
    ) -> Self {
        Self {
            manager: Arc::new(RoomManager::new(store, subscriber, sync)),
        }
    }

    /// Schedule background maintenance (the idle reaper).
    pub async fn start(&self) {
        self.manager.start().await;
    }

    /// Tear down: stop the reaper and destroy every room.
    pub async fn stop(&self) {
        self.manager.stop().await;
    }

    /// Acquire a room as a producer. `enable_publish` is forced on.
    pub fn create_room(&self, name: &str, opts: RoomOptions) -> RoomResult<Arc<Room>> {
        self.manager.create_room(
            name,
            RoomOptions {
                enable_publish: true,
                ..opts
            },
        )
    }

    /// Acquire a room as a consumer; options pass through unchanged.
    pub fn get_room(&self, name: &str, opts: RoomOptions) -> RoomResult<Arc<Room>> {
        self.manager.get_room(name, opts)
    }

    /// Stateless publish to a room name.
    pub async fn publish(
        &self,
        name: &str,
        data: Value,
        opts: Option<PublishOptions>,
    ) -> RoomResult<()> {
        self.manager.publish(name, data, opts).await
    }

    /// The underlying manager, for hosts that need direct access.
    pub fn manager(&self) -> &Arc<RoomManager> {
        &self.manager
    }
}
