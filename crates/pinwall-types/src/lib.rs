//! Shared board types for Pinwall.
//!
//! This crate is the data foundation: typed ids, board objects and their
//! patches, geometry, and the ephemeral lock/presence records. It has **no
//! internal pinwall dependencies**. It is a pure leaf crate that the sync engine and
//! tools build on.
//!
//! # Key Types
//!
//! |--------------------|-----------------------------------------------|
//! | Type               | Purpose                                       |
//! |--------------------|-----------------------------------------------|
//! | [`BoardObject`]    | Persisted canvas object (durable store shape) |
//! | [`ObjectPatch`]    | Field-level update                            |
//! | [`Rect`]           | Axis-aligned bounds for indexing and culling  |
//! | [`LockRecord`]     | Soft lock `{holderId, holderName, timestamp}` |
//! | [`PresenceRecord`] | Online state and last-seen heartbeat          |
//! | [`CommandId`]      | Agent command attribution                     |
//! |--------------------|-----------------------------------------------|

pub mod geometry;
pub mod ids;
pub mod object;
pub mod records;

// Re-export primary types at crate root for convenience.
pub use geometry::{Rect, snap_to_grid};
pub use ids::{BoardId, CommandId, ObjectId, UserId};
pub use object::{
    BoardObject, BorderStyle, Geometry, ObjectError, ObjectKind, ObjectPatch, Style, z_order,
};
pub use records::{LockRecord, PresenceRecord};

/// Current time as Unix milliseconds. Used by constructors throughout the crate.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
