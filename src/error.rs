//! Unified error handling for roomsync.
//!
//! Room-level errors carry the room name where it helps the caller; store
//! failures wrap the underlying [`StoreError`] and keep its detail.

use crate::store::StoreError;
use thiserror::Error;

/// Errors surfaced by room and manager operations.
#[derive(Debug, Error)]
pub enum RoomError {
    /// `publish` was called on a room that was not acquired as a producer.
    #[error("room {0} is not a producer")]
    NotAProducer(String),

    /// A producer room was requested with a wildcard name. Pattern rooms are
    /// consumer-only; there is no single key triple to write to.
    #[error("pattern name {0} cannot be used for a producer room")]
    PatternNotAllowedForProducer(String),

    /// Room names must be non-empty.
    #[error("room name is empty")]
    EmptyRoomName,

    /// The room was destroyed; the handle must not be used anymore.
    #[error("room {0} is destroyed")]
    Destroyed(String),

    /// A store operation failed during initialization or publish.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl RoomError {
    /// Get a static error code string for metrics and log labeling.
    #[inline]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NotAProducer(_) => "not_a_producer",
            Self::PatternNotAllowedForProducer(_) => "pattern_not_allowed_for_producer",
            Self::EmptyRoomName => "empty_room_name",
            Self::Destroyed(_) => "destroyed",
            Self::Store(_) => "store_error",
        }
    }
}

/// Result type for room operations.
pub type RoomResult<T> = Result<T, RoomError>;
