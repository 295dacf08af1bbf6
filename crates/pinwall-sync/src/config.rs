//! Engine configuration.
//!
//! Every field has a default from [`crate::constants`], so an empty TOML file
//! is a valid configuration. Durations are stored as milliseconds on the wire
//! and exposed as [`Duration`] through accessors.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants;

/// Errors loading a configuration file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config value: {0}")]
    Invalid(String),
}

/// Tunables for one board session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Age after which a lock is flagged "possibly stale".
    pub lock_stale_after_ms: u64,
    /// Delay before the coordination store runs disconnect cleanups.
    pub disconnect_cleanup_ms: u64,
    /// Presence heartbeat period while visible.
    pub heartbeat_interval_ms: u64,
    /// Offline age beyond which seeded presence entries are dropped.
    pub presence_ghost_after_ms: u64,
    /// Backoff schedule for presence re-establishment; last entry is the ceiling.
    pub reconnect_backoff_ms: Vec<u64>,
    /// Bound on re-establishment attempts per disconnect.
    pub reconnect_max_attempts: u32,
    /// Snap grid for gesture results. Zero disables snapping.
    pub grid_size: f64,
    /// Culling margin around the viewport.
    pub viewport_padding: f64,
    /// Clamp bound for agent-proposed coordinates.
    pub board_extent: f64,
    /// Clamp bounds for agent-proposed extents.
    pub min_object_size: f64,
    pub max_object_size: f64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            lock_stale_after_ms: millis(constants::LOCK_STALE_AFTER),
            disconnect_cleanup_ms: millis(constants::DISCONNECT_CLEANUP_BOUND),
            heartbeat_interval_ms: millis(constants::HEARTBEAT_INTERVAL),
            presence_ghost_after_ms: millis(constants::PRESENCE_GHOST_AFTER),
            reconnect_backoff_ms: constants::RECONNECT_BACKOFF.iter().map(|d| millis(*d)).collect(),
            reconnect_max_attempts: constants::RECONNECT_MAX_ATTEMPTS,
            grid_size: constants::GRID_SIZE,
            viewport_padding: constants::VIEWPORT_PADDING,
            board_extent: constants::BOARD_EXTENT,
            min_object_size: constants::MIN_OBJECT_SIZE,
            max_object_size: constants::MAX_OBJECT_SIZE,
        }
    }
}

fn millis(d: Duration) -> u64 {
    d.as_millis() as u64
}

impl SyncConfig {
    /// Parse from TOML text and validate.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Reject values that would stall or break the protocols.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_interval_ms == 0 {
            return Err(ConfigError::Invalid("heartbeat_interval_ms must be > 0".into()));
        }
        if self.reconnect_backoff_ms.is_empty() {
            return Err(ConfigError::Invalid("reconnect_backoff_ms must not be empty".into()));
        }
        if self.min_object_size > self.max_object_size {
            return Err(ConfigError::Invalid(format!(
                "min_object_size {} exceeds max_object_size {}",
                self.min_object_size, self.max_object_size
            )));
        }
        if self.grid_size < 0.0 || self.viewport_padding < 0.0 || self.board_extent <= 0.0 {
            return Err(ConfigError::Invalid(
                "grid, padding and extent must be non-negative".into(),
            ));
        }
        Ok(())
    }

    pub fn lock_stale_after(&self) -> Duration {
        Duration::from_millis(self.lock_stale_after_ms)
    }

    pub fn disconnect_cleanup(&self) -> Duration {
        Duration::from_millis(self.disconnect_cleanup_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Backoff delay before re-establishment attempt `attempt` (0-based).
    /// Attempts past the schedule reuse the ceiling.
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let idx = (attempt as usize).min(self.reconnect_backoff_ms.len().saturating_sub(1));
        Duration::from_millis(self.reconnect_backoff_ms.get(idx).copied().unwrap_or(0))
    }

    pub fn with_grid_size(mut self, grid_size: f64) -> Self {
        self.grid_size = grid_size;
        self
    }

    pub fn with_disconnect_cleanup(mut self, delay: Duration) -> Self {
        self.disconnect_cleanup_ms = millis(delay);
        self
    }
}
