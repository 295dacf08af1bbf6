//! Optimistic board mutations.
//!
//! Every mutation lands in the [`ObjectStore`] first (origin `Local`) and is
//! then written to the durable store. A failed durable write reverts the
//! optimistic change and surfaces [`SyncError::Network`]. The committed value
//! returned by the durable store is merged back as a remote write, so the
//! local copy carries the committed revision.
//!
//! Deletes clean up relations in the same batch: connectors attached to the
//! deleted object are deleted, and frame children are detached.

use std::sync::Arc;

use pinwall_types::{BoardId, BoardObject, ObjectId, ObjectKind, ObjectPatch, UserId};
use tracing::{debug, error};

use crate::backend::{BatchWrite, DocumentStore};
use crate::error::SyncError;
use crate::store::{ObjectStore, OpSource};

/// Everything a delete touches.
#[derive(Debug, Clone)]
pub struct DeletePlan {
    pub target: BoardObject,
    /// Connectors with an endpoint on the target.
    pub connectors: Vec<BoardObject>,
    /// Objects whose parent frame is the target.
    pub children: Vec<BoardObject>,
}

impl DeletePlan {
    /// Plan the delete of `id` against the current store contents.
    pub fn new(store: &ObjectStore, id: &ObjectId) -> Option<Self> {
        let target = store.get(id)?;
        let (connectors, children): (Vec<BoardObject>, Vec<BoardObject>) = store
            .referencing(id)
            .into_iter()
            .partition(|o| o.kind == ObjectKind::Connector && o.connected_to.contains(id));
        Some(Self { target, connectors, children })
    }

    pub fn removed_ids(&self) -> Vec<ObjectId> {
        std::iter::once(&self.target)
            .chain(&self.connectors)
            .map(|o| o.id.clone())
            .collect()
    }

    /// Children with their parent frame cleared.
    pub fn detached(&self) -> Vec<BoardObject> {
        self.children
            .iter()
            .cloned()
            .map(|mut child| {
                child.parent_frame = None;
                child
            })
            .collect()
    }

    /// Pre-delete values of every touched object.
    pub fn snapshots(&self) -> impl Iterator<Item = &BoardObject> {
        std::iter::once(&self.target).chain(&self.connectors).chain(&self.children)
    }

    /// Durable writes, optionally tagging detached children with an extra
    /// patch.
    pub fn writes(&self, child_patch: Option<&ObjectPatch>) -> Vec<BatchWrite> {
        let mut writes: Vec<BatchWrite> =
            self.removed_ids().into_iter().map(BatchWrite::Delete).collect();
        for child in &self.children {
            let mut patch = ObjectPatch { parent_frame: Some(None), ..Default::default() };
            if let Some(extra) = child_patch {
                patch = patch.merge(extra.clone());
            }
            writes.push(BatchWrite::Update(child.id.clone(), patch));
        }
        writes
    }

    /// Apply the delete to the local store.
    pub fn apply_local(&self, store: &ObjectStore) {
        store.batch_remove(&self.removed_ids(), OpSource::Local);
        if !self.children.is_empty() {
            store.batch_upsert(self.detached(), OpSource::Local);
        }
    }

    /// Put every touched object back in the local store.
    pub fn restore_local(&self, store: &ObjectStore) {
        store.batch_upsert(self.snapshots().cloned().collect(), OpSource::Local);
    }
}

/// Result of a delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteOutcome {
    pub removed: Vec<ObjectId>,
    pub detached: Vec<ObjectId>,
}

/// Create, update, and delete objects on one board on behalf of one user.
#[derive(Clone)]
pub struct BoardMutator {
    board: BoardId,
    user: UserId,
    store: Arc<ObjectStore>,
    docs: Arc<dyn DocumentStore>,
}

impl BoardMutator {
    pub fn new(
        board: BoardId,
        user: UserId,
        store: Arc<ObjectStore>,
        docs: Arc<dyn DocumentStore>,
    ) -> Self {
        Self { board, user, store, docs }
    }

    /// Create an object. It is attributed to this user and placed on top.
    pub async fn create(&self, mut object: BoardObject) -> Result<BoardObject, SyncError> {
        object.normalize();
        object.validate()?;
        object.created_by.get_or_insert_with(|| self.user.clone());
        if object.z_index == 0 {
            object.z_index = self.store.next_z_index();
        }
        object.revision = 0;

        let id = object.id.clone();
        self.store.upsert(object.clone(), OpSource::Local);
        match self.docs.create(&self.board, object).await {
            Ok(committed) => {
                self.store.upsert(committed.clone(), OpSource::Remote);
                debug!(%id, revision = committed.revision, "object created");
                Ok(committed)
            }
            Err(err) => {
                error!(%id, error = %err, "create failed, reverting");
                self.store.remove(&id, OpSource::Local);
                Err(err.into())
            }
        }
    }

    /// Patch an object.
    pub async fn update(
        &self,
        id: &ObjectId,
        patch: ObjectPatch,
    ) -> Result<BoardObject, SyncError> {
        let previous = self.store.get(id).ok_or_else(|| SyncError::NotFound(id.clone()))?;
        let mut next = previous.clone();
        patch.apply_to(&mut next);
        next.normalize();
        next.validate()?;

        self.store.upsert(next, OpSource::Local);
        match self.docs.update(&self.board, id, patch).await {
            Ok(committed) => {
                self.store.upsert(committed.clone(), OpSource::Remote);
                Ok(committed)
            }
            Err(err) => {
                error!(%id, error = %err, "update failed, reverting");
                self.store.upsert(previous, OpSource::Local);
                Err(err.into())
            }
        }
    }

    /// Delete an object with its attached connectors, detaching frame
    /// children, in one durable batch.
    pub async fn delete(&self, id: &ObjectId) -> Result<DeleteOutcome, SyncError> {
        let plan = DeletePlan::new(&self.store, id).ok_or_else(|| SyncError::NotFound(id.clone()))?;
        plan.apply_local(&self.store);
        match self.docs.commit_batch(&self.board, plan.writes(None)).await {
            Ok(()) => {
                let outcome = DeleteOutcome {
                    removed: plan.removed_ids(),
                    detached: plan.children.iter().map(|c| c.id.clone()).collect(),
                };
                let (removed, detached) = (outcome.removed.len(), outcome.detached.len());
                debug!(%id, removed, detached, "object deleted");
                Ok(outcome)
            }
            Err(err) => {
                error!(%id, error = %err, "delete failed, restoring");
                plan.restore_local(&self.store);
                Err(err.into())
            }
        }
    }

    pub fn store(&self) -> &Arc<ObjectStore> {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use pinwall_types::Geometry;

    use super::*;
    use crate::backend::memory::MemoryDocumentStore;

    fn setup() -> (BoardMutator, MemoryDocumentStore, Arc<ObjectStore>) {
        let docs = MemoryDocumentStore::new();
        let store = Arc::new(ObjectStore::new());
        let mutator = BoardMutator::new(
            BoardId::new("b"),
            UserId::new("ada"),
            Arc::clone(&store),
            Arc::new(docs.clone()),
        );
        (mutator, docs, store)
    }

    fn note(id: &str) -> BoardObject {
        BoardObject::new(id, ObjectKind::Note, Geometry::new(0.0, 0.0, 100.0, 100.0))
    }

    #[tokio::test]
    async fn test_create_commits_and_attributes() {
        let (mutator, docs, store) = setup();
        let committed = mutator.create(note("n1")).await.expect("create");
        assert_eq!(committed.created_by, Some(UserId::new("ada")));
        assert!(committed.revision > 0);
        assert_eq!(store.get(&ObjectId::new("n1")).map(|o| o.revision), Some(committed.revision));
        assert!(docs.get(&BoardId::new("b"), &ObjectId::new("n1")).is_some());
    }

    #[tokio::test]
    async fn test_failed_create_reverts() {
        let (mutator, docs, store) = setup();
        docs.set_available(false);
        let err = mutator.create(note("n1")).await.expect_err("offline");
        assert!(matches!(err, SyncError::Network(_)));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_failed_update_restores_previous() {
        let (mutator, docs, store) = setup();
        mutator.create(note("n1")).await.expect("create");
        docs.set_available(false);
        let id = ObjectId::new("n1");
        assert!(mutator.update(&id, ObjectPatch::position(500.0, 500.0)).await.is_err());
        assert_eq!(store.get(&id).map(|o| o.geometry.x), Some(0.0));
    }

    #[tokio::test]
    async fn test_invalid_connector_rejected_locally() {
        let (mutator, _docs, store) = setup();
        let mut connector = BoardObject::connector("c", "a".into(), "b".into());
        connector.connected_to.pop();
        assert!(matches!(mutator.create(connector).await, Err(SyncError::Invalid(_))));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_delete_cascades_connectors_and_detaches_children() {
        let (mutator, docs, store) = setup();
        let board = BoardId::new("b");
        let frame =
            BoardObject::new("f", ObjectKind::Frame, Geometry::new(0.0, 0.0, 1000.0, 1000.0));
        mutator.create(frame).await.expect("frame");
        mutator.create(note("a").with_parent_frame("f")).await.expect("a");
        mutator.create(note("b")).await.expect("b");
        mutator
            .create(BoardObject::connector("c", ObjectId::new("f"), ObjectId::new("b")))
            .await
            .expect("connector");

        let outcome = mutator.delete(&ObjectId::new("f")).await.expect("delete");
        assert_eq!(outcome.removed, vec![ObjectId::new("f"), ObjectId::new("c")]);
        assert_eq!(outcome.detached, vec![ObjectId::new("a")]);

        assert!(store.get(&ObjectId::new("c")).is_none());
        assert_eq!(store.get(&ObjectId::new("a")).and_then(|o| o.parent_frame), None);
        assert!(docs.get(&board, &ObjectId::new("c")).is_none());
        assert_eq!(docs.get(&board, &ObjectId::new("a")).and_then(|o| o.parent_frame), None);
    }

    #[tokio::test]
    async fn test_failed_delete_restores_everything() {
        let (mutator, docs, store) = setup();
        mutator.create(note("a")).await.expect("a");
        mutator.create(note("b")).await.expect("b");
        mutator
            .create(BoardObject::connector("c", ObjectId::new("a"), ObjectId::new("b")))
            .await
            .expect("connector");
        docs.fail_write_at(1);
        assert!(mutator.delete(&ObjectId::new("a")).await.is_err());
        assert_eq!(store.len(), 3);
    }
}
