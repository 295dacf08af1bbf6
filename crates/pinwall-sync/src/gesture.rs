//! Drag and resize gestures.
//!
//! A gesture holds the object's soft lock and suppresses remote writes for the
//! object while it runs. Intermediate updates only touch the local store; the
//! durable store sees exactly one write, when the gesture ends:
//!
//! ```text
//! begin ── acquire lock ── mark editing
//!   │
//! update* (local only)
//!   │
//! end ──── snap to grid ── durable update ── clear editing ── release
//! cancel ─ restore original ──────────────── clear editing ── release
//! ```
//!
//! Losing the lock mid-gesture aborts it: the original geometry is restored
//! and further calls fail with [`SyncError::LockContention`].

use std::sync::Arc;

use pinwall_types::{
    BoardId, BoardObject, Geometry, LockRecord, ObjectId, ObjectPatch, snap_to_grid,
};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};

use crate::backend::DocumentStore;
use crate::error::SyncError;
use crate::locks::{LockCoordinator, LockEvent};
use crate::store::{ObjectStore, OpSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GestureKind {
    /// Position only.
    Drag,
    /// Position and extent.
    Resize,
}

/// An in-progress gesture on one object.
pub struct GestureSession {
    kind: GestureKind,
    board: BoardId,
    object_id: ObjectId,
    original: BoardObject,
    current: Geometry,
    grid_size: f64,
    store: Arc<ObjectStore>,
    docs: Arc<dyn DocumentStore>,
    locks: Arc<LockCoordinator>,
    events: broadcast::Receiver<LockEvent>,
    /// Set once the gesture ended, was cancelled, or aborted.
    finished: bool,
    lost_to: Option<String>,
}

impl GestureSession {
    /// Start a gesture. Fails with `LockContention` if another client holds
    /// the object.
    pub async fn begin(
        kind: GestureKind,
        board: BoardId,
        object_id: ObjectId,
        store: Arc<ObjectStore>,
        docs: Arc<dyn DocumentStore>,
        locks: Arc<LockCoordinator>,
        grid_size: f64,
    ) -> Result<Self, SyncError> {
        let original = store.get(&object_id).ok_or_else(|| SyncError::NotFound(object_id.clone()))?;
        let events = locks.subscribe();
        locks.acquire(&object_id).await?;
        store.mark_locally_editing(&object_id);
        debug!(object = %object_id, ?kind, "gesture started");

        Ok(Self {
            kind,
            board,
            object_id,
            current: original.geometry,
            original,
            grid_size,
            store,
            docs,
            locks,
            events,
            finished: false,
            lost_to: None,
        })
    }

    pub fn kind(&self) -> GestureKind {
        self.kind
    }

    pub fn object_id(&self) -> &ObjectId {
        &self.object_id
    }

    /// Geometry as last updated (before snapping).
    pub fn geometry(&self) -> Geometry {
        self.current
    }

    /// Apply an intermediate geometry to the local store. A drag only takes
    /// the position.
    pub fn update(&mut self, geometry: Geometry) -> Result<(), SyncError> {
        self.ensure_held()?;
        self.current = match self.kind {
            GestureKind::Drag => Geometry { x: geometry.x, y: geometry.y, ..self.current },
            GestureKind::Resize => geometry,
        };
        self.write_local(self.current);
        Ok(())
    }

    /// Move by a delta.
    pub fn drag_by(&mut self, dx: f64, dy: f64) -> Result<(), SyncError> {
        let next = Geometry { x: self.current.x + dx, y: self.current.y + dy, ..self.current };
        self.update(next)
    }

    /// Snap, commit with one durable write, and release the lock. Returns the
    /// committed object.
    pub async fn end(mut self) -> Result<BoardObject, SyncError> {
        self.ensure_held()?;
        let snapped = self.snapped();
        let patch = match self.kind {
            GestureKind::Drag => ObjectPatch::position(snapped.x, snapped.y),
            GestureKind::Resize => ObjectPatch::geometry(&snapped),
        };
        self.write_local(snapped);

        let result = self.docs.update(&self.board, &self.object_id, patch).await;
        self.finished = true;
        match result {
            Ok(committed) => {
                self.store.clear_locally_editing(&self.object_id);
                self.store.upsert(committed.clone(), OpSource::Remote);
                self.release().await;
                info!(object = %self.object_id, x = snapped.x, y = snapped.y, "gesture committed");
                Ok(committed)
            }
            Err(err) => {
                warn!(object = %self.object_id, error = %err, "gesture commit failed, restoring");
                self.restore();
                self.release().await;
                Err(err.into())
            }
        }
    }

    /// Abandon the gesture and restore the original geometry.
    pub async fn cancel(mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.restore();
        self.release().await;
        debug!(object = %self.object_id, "gesture cancelled");
    }

    /// Wait until this gesture's lock is lost to another client. Hosts
    /// select on this alongside input events.
    pub async fn lost(&mut self) -> Option<LockRecord> {
        loop {
            match self.events.recv().await {
                Ok(LockEvent::Lost { object_id, new_holder }) if object_id == self.object_id => {
                    return new_holder;
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {
                    if !self.finished && !self.locks.is_held(&self.object_id) {
                        return self.locks.lock_status(&self.object_id).map(|s| s.record);
                    }
                }
                Err(RecvError::Closed) => std::future::pending::<()>().await,
            }
        }
    }

    /// Geometry the gesture would commit now.
    pub fn snapped(&self) -> Geometry {
        let g = self.current;
        let grid = self.grid_size;
        match self.kind {
            GestureKind::Drag => Geometry {
                x: snap_to_grid(g.x, grid),
                y: snap_to_grid(g.y, grid),
                ..g
            },
            GestureKind::Resize => Geometry {
                x: snap_to_grid(g.x, grid),
                y: snap_to_grid(g.y, grid),
                width: snap_nonzero(g.width, grid),
                height: snap_nonzero(g.height, grid),
                ..g
            },
        }
    }

    fn ensure_held(&mut self) -> Result<(), SyncError> {
        if let Some(holder_name) = &self.lost_to {
            return Err(SyncError::LockContention {
                object_id: self.object_id.clone(),
                holder_name: holder_name.clone(),
            });
        }
        if self.finished {
            return Err(SyncError::Shutdown);
        }
        if self.locks.is_held(&self.object_id) {
            return Ok(());
        }

        let holder_name = self
            .locks
            .lock_status(&self.object_id)
            .map(|s| s.record.holder_name)
            .unwrap_or_default();
        warn!(object = %self.object_id, holder = %holder_name, "lock lost mid-gesture, aborting");
        self.finished = true;
        self.restore();
        self.lost_to = Some(holder_name.clone());
        Err(SyncError::LockContention { object_id: self.object_id.clone(), holder_name })
    }

    fn write_local(&self, geometry: Geometry) {
        let mut object = self.store.get(&self.object_id).unwrap_or_else(|| self.original.clone());
        object.geometry = geometry;
        self.store.upsert(object, OpSource::Local);
    }

    fn restore(&self) {
        self.store.upsert(self.original.clone(), OpSource::Local);
        self.store.clear_locally_editing(&self.object_id);
    }

    async fn release(&self) {
        if let Err(err) = self.locks.release(&self.object_id).await {
            warn!(object = %self.object_id, error = %err, "gesture lock release failed");
        }
    }
}

impl Drop for GestureSession {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        self.restore();
        let locks = Arc::clone(&self.locks);
        let id = self.object_id.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(err) = locks.release(&id).await {
                    warn!(object = %id, error = %err, "release of dropped gesture failed");
                }
            });
        }
    }
}

/// Snap an extent without collapsing it to zero.
fn snap_nonzero(value: f64, grid: f64) -> f64 {
    let snapped = snap_to_grid(value, grid);
    if snapped == 0.0 && value != 0.0 { grid.copysign(value) } else { snapped }
}

#[cfg(test)]
mod tests {
    use pinwall_types::{ObjectKind, UserId};

    use super::*;
    use crate::backend::memory::{MemoryCoordinationServer, MemoryDocumentStore};
    use crate::clock::{ManualClock, SharedClock};
    use crate::constants::DISCONNECT_CLEANUP_BOUND;

    struct Fixture {
        store: Arc<ObjectStore>,
        docs: MemoryDocumentStore,
        locks: Arc<LockCoordinator>,
        server: MemoryCoordinationServer,
    }

    async fn fixture() -> Fixture {
        let board = BoardId::new("b");
        let docs = MemoryDocumentStore::new();
        let note = BoardObject::new("n1", ObjectKind::Note, Geometry::new(0.0, 0.0, 100.0, 100.0));
        let seeded = docs.seed(&board, note);
        let store = Arc::new(ObjectStore::new());
        store.upsert(seeded, OpSource::Remote);

        let server = MemoryCoordinationServer::new(DISCONNECT_CLEANUP_BOUND);
        let clock: SharedClock = Arc::new(ManualClock::new(1_000));
        let locks = Arc::new(LockCoordinator::new(
            board,
            UserId::new("ada"),
            "Ada",
            Arc::new(server.connect()),
            clock,
            30_000,
        ));
        locks.start().await.expect("start");
        Fixture { store, docs, locks, server }
    }

    async fn begin(f: &Fixture, kind: GestureKind) -> GestureSession {
        GestureSession::begin(
            kind,
            BoardId::new("b"),
            ObjectId::new("n1"),
            Arc::clone(&f.store),
            Arc::new(f.docs.clone()),
            Arc::clone(&f.locks),
            20.0,
        )
        .await
        .expect("begin")
    }

    #[tokio::test]
    async fn test_drag_snaps_and_writes_once() {
        let f = fixture().await;
        let id = ObjectId::new("n1");
        let writes = f.docs.write_count();

        let mut gesture = begin(&f, GestureKind::Drag).await;
        assert!(f.store.is_locally_editing(&id));
        for step in 1..=5 {
            gesture.drag_by(63.0, 52.4).expect("drag");
            assert_eq!(f.store.get(&id).map(|o| o.geometry.x), Some(63.0 * step as f64));
        }
        assert_eq!(f.docs.write_count(), writes);

        let committed = gesture.end().await.expect("end");
        assert_eq!((committed.geometry.x, committed.geometry.y), (320.0, 260.0));
        assert_eq!(f.docs.write_count(), writes + 1);
        assert!(!f.store.is_locally_editing(&id));
        assert!(!f.locks.is_held(&id));
    }

    #[tokio::test]
    async fn test_cancel_restores_original() {
        let f = fixture().await;
        let id = ObjectId::new("n1");
        let mut gesture = begin(&f, GestureKind::Resize).await;
        gesture.update(Geometry::new(5.0, 5.0, 333.0, 333.0)).expect("update");
        gesture.cancel().await;

        let object = f.store.get(&id).expect("object");
        assert_eq!(object.geometry, Geometry::new(0.0, 0.0, 100.0, 100.0));
        assert!(!f.locks.is_held(&id));
    }

    #[tokio::test]
    async fn test_lost_lock_aborts_gesture() {
        let f = fixture().await;
        let id = ObjectId::new("n1");
        let mut gesture = begin(&f, GestureKind::Drag).await;
        gesture.drag_by(40.0, 0.0).expect("drag");

        let path = crate::backend::lock_path(&BoardId::new("b"), &id);
        let bob = LockRecord::new(UserId::new("bob"), "Bob", 2_000);
        f.server.put(&path, serde_json::to_value(&bob).expect("json"));
        let holder = gesture.lost().await.expect("new holder");
        assert_eq!(holder.holder_name, "Bob");

        let err = gesture.drag_by(10.0, 0.0).expect_err("aborted");
        assert!(matches!(
            err,
            SyncError::LockContention { ref holder_name, .. } if holder_name == "Bob"
        ));
        assert_eq!(f.store.get(&id).map(|o| o.geometry.x), Some(0.0));
        assert!(gesture.end().await.is_err());
    }

    #[test]
    fn test_snap_keeps_extent() {
        assert_eq!(snap_nonzero(7.0, 20.0), 20.0);
        assert_eq!(snap_nonzero(-7.0, 20.0), -20.0);
        assert_eq!(snap_nonzero(0.0, 20.0), 0.0);
        assert_eq!(snap_nonzero(31.0, 20.0), 40.0);
    }
}
