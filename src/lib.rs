//! roomsync - distributed room-state synchronization core.
//!
//! Processes in a cluster share named units of state ("rooms") through a
//! Redis-compatible key/value store with publish/subscribe. Any process may
//! publish updates to a room; any process may join a room by exact name or
//! glob pattern and receive an initial snapshot followed by every update.
//!
//! # Architecture
//!
//! - [`keys`]: deterministic mapping from a room name to its store keys
//!   (snapshot hash, history list, pub/sub channel).
//! - [`store`]: the storage abstraction. [`store::Store`] covers the command
//!   side (hashes, lists, scan, publish), [`store::Subscriber`] the pub/sub
//!   side. Backends: [`store::redis`] for production, [`store::memory`] for
//!   tests and store-less development.
//! - [`room`]: the per-room state machine. Lazily initialized snapshot cache,
//!   bounded history, local callback registry, merge and fan-out of incoming
//!   updates.
//! - [`manager`]: creates and looks up rooms (one instance per name per
//!   process), hosts the stateless publish path, and runs the idle reaper.
//! - [`service`]: the thin facade hosting code talks to. Distinguishes
//!   producer acquisition (`create_room`) from consumer acquisition
//!   (`get_room`).

pub mod config;
pub mod error;
pub mod keys;
pub mod manager;
pub mod metrics;
pub mod payload;
pub mod room;
pub mod service;
pub mod store;

pub use config::{Config, RedisConfig, SyncConfig};
pub use error::RoomError;
pub use keys::KeySet;
pub use manager::{PublishOptions, RoomManager};
pub use payload::Payload;
pub use room::{PublishOverride, Room, RoomCallback, RoomOptions};
pub use service::RoomService;
pub use store::{Store, StoreError, Subscriber};
