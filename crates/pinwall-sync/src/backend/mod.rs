//! Collaborator seams: the durable document store, the ephemeral coordination
//! store, and the remote tool-execution service.
//!
//! The engine never talks to a concrete backend. Each collaborator is a trait
//! object held by the board session; [`memory`] provides in-process
//! implementations used by tests and the simulator.

pub mod memory;

use async_trait::async_trait;
use futures::stream::BoxStream;
use pinwall_types::{BoardId, BoardObject, CommandId, ObjectId, ObjectPatch, UserId};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::BackendError;
use crate::subscription::Subscription;
use crate::tools::ToolCall;

// ============================================================================
// Durable document store
// ============================================================================

/// Kind of change in a feed notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

/// One document change. For `Removed`, `object` is the last committed value.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentChange {
    pub kind: ChangeKind,
    pub object: BoardObject,
}

impl DocumentChange {
    pub fn added(object: BoardObject) -> Self {
        Self { kind: ChangeKind::Added, object }
    }

    pub fn modified(object: BoardObject) -> Self {
        Self { kind: ChangeKind::Modified, object }
    }

    pub fn removed(object: BoardObject) -> Self {
        Self { kind: ChangeKind::Removed, object }
    }
}

/// A change-feed delivery.
#[derive(Debug, Clone)]
pub enum FeedNotification {
    Changes(Vec<DocumentChange>),
    Error(BackendError),
}

/// One write inside an atomic batch.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchWrite {
    /// Create or fully replace.
    Set(BoardObject),
    Update(ObjectId, ObjectPatch),
    Delete(ObjectId),
}

/// The authoritative persisted collection of board objects.
///
/// Every successful write stamps a fresh `revision` on the object. Writes from
/// one client are applied in issue order.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Create (or replace) an object. Returns the committed value.
    async fn create(
        &self,
        board: &BoardId,
        object: BoardObject,
    ) -> Result<BoardObject, BackendError>;

    /// Apply a field patch. Returns the committed value.
    async fn update(
        &self,
        board: &BoardId,
        id: &ObjectId,
        patch: ObjectPatch,
    ) -> Result<BoardObject, BackendError>;

    /// Delete an object. Deleting a missing object succeeds.
    async fn delete(&self, board: &BoardId, id: &ObjectId) -> Result<(), BackendError>;

    /// Apply several writes atomically: all of them or none.
    async fn commit_batch(
        &self,
        board: &BoardId,
        writes: Vec<BatchWrite>,
    ) -> Result<(), BackendError>;

    /// Subscribe to the board's change feed. The first notification is the
    /// full current snapshot as `Added` changes.
    async fn subscribe(
        &self,
        board: &BoardId,
    ) -> Result<Subscription<FeedNotification>, BackendError>;
}

// ============================================================================
// Ephemeral coordination store
// ============================================================================

/// Transport state reported by the coordination store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

/// Event on a subscribed path's direct children.
#[derive(Debug, Clone, PartialEq)]
pub enum ChildEvent {
    Added { key: String, value: serde_json::Value },
    Changed { key: String, value: serde_json::Value },
    Removed { key: String },
}

impl ChildEvent {
    pub fn key(&self) -> &str {
        match self {
            Self::Added { key, .. } | Self::Changed { key, .. } | Self::Removed { key } => key,
        }
    }
}

/// Handle for a registered disconnect cleanup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CleanupId(pub u64);

/// Low-latency, non-durable key/value tree with disconnect-triggered cleanup.
/// There is no storage-level exclusion: concurrent writers race.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    async fn write(&self, path: &str, value: serde_json::Value) -> Result<(), BackendError>;

    /// Merge `fields` into the object at `path`, creating it if absent.
    async fn update(
        &self,
        path: &str,
        fields: serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), BackendError>;

    async fn remove(&self, path: &str) -> Result<(), BackendError>;

    /// One-shot read. Reading an interior path returns an object keyed by
    /// its children.
    async fn read(&self, path: &str) -> Result<Option<serde_json::Value>, BackendError>;

    /// Subscribe to the direct children of `path`. Existing children are
    /// delivered first as `Added`.
    async fn subscribe(&self, path: &str) -> Result<Subscription<ChildEvent>, BackendError>;

    /// Ask the store to remove `path` when this client's connection drops.
    async fn register_disconnect_cleanup(&self, path: &str) -> Result<CleanupId, BackendError>;

    async fn cancel_disconnect_cleanup(&self, id: CleanupId) -> Result<(), BackendError>;

    fn connection_state(&self) -> watch::Receiver<ConnectionState>;
}

/// Path of the lock record for one object.
pub fn lock_path(board: &BoardId, object: &ObjectId) -> String {
    format!("{}/{}", locks_root(board), object)
}

pub fn locks_root(board: &BoardId) -> String {
    format!("boards/{board}/locks")
}

/// Path of one user's presence record.
pub fn presence_path(board: &BoardId, user: &UserId) -> String {
    format!("{}/{}", presence_root(board), user)
}

pub fn presence_root(board: &BoardId) -> String {
    format!("boards/{board}/presence")
}

// ============================================================================
// Remote tool-execution service
// ============================================================================

/// Request to run one agent command.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolRequest {
    pub command_id: CommandId,
    pub board_id: BoardId,
    pub requester_id: UserId,
    pub prompt: String,
    /// Compact board description the service plans against.
    pub board_state: serde_json::Value,
}

/// One item of a tool-execution stream.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolStreamItem {
    Operation(ToolCall),
    Completed { summary: String },
    Failed { message: String },
}

/// Remote service that plans and streams board operations for a prompt.
#[async_trait]
pub trait ToolService: Send + Sync {
    async fn execute(
        &self,
        request: ToolRequest,
    ) -> Result<BoxStream<'static, ToolStreamItem>, BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths() {
        let board = BoardId::new("b1");
        assert_eq!(lock_path(&board, &ObjectId::new("sticky-1")), "boards/b1/locks/sticky-1");
        assert_eq!(presence_path(&board, &UserId::new("u7")), "boards/b1/presence/u7");
    }
}
