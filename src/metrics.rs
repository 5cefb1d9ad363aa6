//! Prometheus metrics collection for roomsync.
//!
//! Tracks room population, publish and fan-out throughput, reaper activity,
//! and dropped messages. Hosts call [`init`] once at startup and expose
//! [`gather_metrics`] on their own HTTP surface.

use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

lazy_static! {
    /// Global Prometheus registry for all metrics.
    pub static ref REGISTRY: Registry = Registry::new();

    /// Rooms currently held by the manager.
    // SAFETY: Metrics init at startup via lazy_static, panic acceptable if prometheus fails
    pub static ref ACTIVE_ROOMS: IntGauge = IntGauge::new(
        "roomsync_active_rooms",
        "Rooms currently held by the manager"
    ).expect("ACTIVE_ROOMS metric creation failed");

    /// Total payloads published to the store.
    // SAFETY: Metrics init at startup via lazy_static, panic acceptable if prometheus fails
    pub static ref PUBLISHES: IntCounter = IntCounter::new(
        "roomsync_publishes_total",
        "Payloads published to the store"
    ).expect("PUBLISHES metric creation failed");

    /// Total callback invocations from incoming updates.
    // SAFETY: Metrics init at startup via lazy_static, panic acceptable if prometheus fails
    pub static ref CALLBACKS_DISPATCHED: IntCounter = IntCounter::new(
        "roomsync_callbacks_dispatched_total",
        "Callback invocations from incoming updates"
    ).expect("CALLBACKS_DISPATCHED metric creation failed");

    /// Total rooms destroyed by the idle reaper.
    // SAFETY: Metrics init at startup via lazy_static, panic acceptable if prometheus fails
    pub static ref ROOMS_REAPED: IntCounter = IntCounter::new(
        "roomsync_rooms_reaped_total",
        "Rooms destroyed by the idle reaper"
    ).expect("ROOMS_REAPED metric creation failed");

    /// Total pub/sub messages dropped because they failed to decode.
    // SAFETY: Metrics init at startup via lazy_static, panic acceptable if prometheus fails
    pub static ref MESSAGES_DROPPED: IntCounter = IntCounter::new(
        "roomsync_messages_dropped_total",
        "Pub/sub messages dropped as undecodable"
    ).expect("MESSAGES_DROPPED metric creation failed");
}

/// Initialize the Prometheus metrics registry.
///
/// Must be called once at startup before any metrics are recorded.
pub fn init() {
    if let Err(e) = REGISTRY.register(Box::new(ACTIVE_ROOMS.clone())) {
        tracing::warn!(error = %e, "Failed to register metric roomsync_active_rooms");
    }
    if let Err(e) = REGISTRY.register(Box::new(PUBLISHES.clone())) {
        tracing::warn!(error = %e, "Failed to register metric roomsync_publishes_total");
    }
    if let Err(e) = REGISTRY.register(Box::new(CALLBACKS_DISPATCHED.clone())) {
        tracing::warn!(error = %e, "Failed to register metric roomsync_callbacks_dispatched_total");
    }
    if let Err(e) = REGISTRY.register(Box::new(ROOMS_REAPED.clone())) {
        tracing::warn!(error = %e, "Failed to register metric roomsync_rooms_reaped_total");
    }
    if let Err(e) = REGISTRY.register(Box::new(MESSAGES_DROPPED.clone())) {
        tracing::warn!(error = %e, "Failed to register metric roomsync_messages_dropped_total");
    }
}

/// Gather all metrics and encode them in Prometheus text format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = vec![];
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode Prometheus metrics");
        return String::new();
    }
    match String::from_utf8(buffer) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "Prometheus metrics were not valid UTF-8");
            String::new()
        }
    }
}
