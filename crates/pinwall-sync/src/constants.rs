//! Engine timing and sizing constants.
//!
//! Centralizes hardcoded values for easier configuration and documentation.
//! Every value here is the default for the matching [`SyncConfig`] field.
//!
//! [`SyncConfig`]: crate::config::SyncConfig

use std::time::Duration;

/// Locks older than this are shown as "possibly stale" but still block.
pub const LOCK_STALE_AFTER: Duration = Duration::from_secs(30);

/// Upper bound for the coordination store's disconnect cleanup. Independent
/// of [`LOCK_STALE_AFTER`]; the two are not derived from one another.
pub const DISCONNECT_CLEANUP_BOUND: Duration = Duration::from_secs(60);

/// Timestamp-only presence refresh while the client is visible.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Presence entries offline for longer than this are pruned when seeding.
pub const PRESENCE_GHOST_AFTER: Duration = Duration::from_secs(60);

/// Delays between presence re-establishment attempts after a disconnect.
/// The last entry is the ceiling for any further attempts.
pub const RECONNECT_BACKOFF: [Duration; 4] = [
    Duration::from_millis(500),
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(5),
];

/// Attempts before the re-establishment loop gives up and waits for the next
/// transport signal.
pub const RECONNECT_MAX_ATTEMPTS: u32 = 8;

/// Grid used to snap drag/resize results.
pub const GRID_SIZE: f64 = 20.0;

/// Margin added around the viewport for culling queries.
pub const VIEWPORT_PADDING: f64 = 200.0;

/// Capacity of the object store's change notification channel.
pub const STORE_EVENT_CAPACITY: usize = 1024;

/// Agent-proposed coordinates are clamped into `[-BOARD_EXTENT, BOARD_EXTENT]`.
pub const BOARD_EXTENT: f64 = 50_000.0;

/// Agent-proposed extents are clamped into `[MIN_OBJECT_SIZE, MAX_OBJECT_SIZE]`.
pub const MIN_OBJECT_SIZE: f64 = 10.0;
pub const MAX_OBJECT_SIZE: f64 = 4_000.0;

/// Gap between objects laid out by the agent `arrange` operation.
pub const ARRANGE_GAP: f64 = 20.0;
