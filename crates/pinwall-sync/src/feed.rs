//! Change-feed bridge from the durable store into the object store.
//!
//! [`FeedSync`] is the pure state machine: it decides how each notification
//! lands in the [`ObjectStore`]. [`ChangeFeed`] owns the subscription and a
//! pump task that drives it.
//!
//! # State Machine
//!
//! ```text
//! +--------------+   first notification     +-------------+
//! | InitialLoad  | -----------------------> |  Streaming  |
//! |              |   all added: set_all     |             |
//! +--------------+   otherwise: batches     +-------------+
//!        ^                                         |
//!        |  resubscribe: generation += 1           |
//!        +-----------------------------------------+
//! ```
//!
//! Every notification is tagged with the generation of the subscription that
//! delivered it. Anything from an older generation is dropped.

use std::sync::Arc;

use parking_lot::Mutex;
use pinwall_types::{BoardId, ObjectId};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::backend::{ChangeKind, DocumentChange, DocumentStore, FeedNotification};
use crate::error::SyncError;
use crate::store::{ObjectStore, OpSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedState {
    InitialLoad,
    Streaming,
}

/// How a notification was applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedOutcome {
    /// Full snapshot loaded with `set_all`.
    Snapshot { count: usize },
    /// Incremental changes applied.
    Incremental { upserted: usize, removed: usize },
    /// The feed failed; the store was marked loaded with what it had.
    Degraded,
}

/// Decides how notifications reach the store.
pub struct FeedSync {
    store: Arc<ObjectStore>,
    state: FeedState,
    generation: u64,
}

impl FeedSync {
    pub fn new(store: Arc<ObjectStore>) -> Self {
        Self { store, state: FeedState::InitialLoad, generation: 0 }
    }

    pub fn state(&self) -> FeedState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Start a new subscription generation. Returns the new generation.
    pub fn resubscribe(&mut self) -> u64 {
        self.generation += 1;
        self.state = FeedState::InitialLoad;
        self.generation
    }

    /// Retire the current generation without starting another.
    pub fn invalidate(&mut self) {
        self.generation += 1;
    }

    /// Apply one notification delivered by subscription `generation`.
    pub fn apply(
        &mut self,
        generation: u64,
        notification: FeedNotification,
    ) -> Result<FeedOutcome, SyncError> {
        if generation != self.generation {
            return Err(SyncError::StaleSubscription { got: generation, current: self.generation });
        }
        match notification {
            FeedNotification::Error(err) => {
                warn!(error = %err, "change feed failed, continuing with partial data");
                self.store.mark_loaded();
                Ok(FeedOutcome::Degraded)
            }
            FeedNotification::Changes(changes) => Ok(self.apply_changes(changes)),
        }
    }

    fn apply_changes(&mut self, changes: Vec<DocumentChange>) -> FeedOutcome {
        let initial = self.state == FeedState::InitialLoad;
        self.state = FeedState::Streaming;

        if initial && changes.iter().all(|c| c.kind == ChangeKind::Added) {
            let count = changes.len();
            self.store.set_all(changes.into_iter().map(|c| c.object).collect());
            self.store.mark_loaded();
            info!(count, generation = self.generation, "initial snapshot loaded");
            return FeedOutcome::Snapshot { count };
        }

        let mut upserts = Vec::new();
        let mut removes: Vec<ObjectId> = Vec::new();
        for change in changes {
            match change.kind {
                ChangeKind::Added | ChangeKind::Modified => upserts.push(change.object),
                ChangeKind::Removed => removes.push(change.object.id),
            }
        }
        let upserted = if upserts.is_empty() {
            0
        } else {
            self.store.batch_upsert(upserts, OpSource::Remote).len()
        };
        let removed = if removes.is_empty() {
            0
        } else {
            self.store.batch_remove(&removes, OpSource::Remote).len()
        };
        if initial {
            self.store.mark_loaded();
        }
        trace!(upserted, removed, "feed changes applied");
        FeedOutcome::Incremental { upserted, removed }
    }
}

/// A live change-feed subscription for one board.
pub struct ChangeFeed {
    sync: Arc<Mutex<FeedSync>>,
    docs: Arc<dyn DocumentStore>,
    board: BoardId,
    current: Option<(CancellationToken, JoinHandle<()>)>,
}

impl ChangeFeed {
    pub fn new(store: Arc<ObjectStore>, docs: Arc<dyn DocumentStore>, board: BoardId) -> Self {
        Self { sync: Arc::new(Mutex::new(FeedSync::new(store))), docs, board, current: None }
    }

    pub fn state(&self) -> FeedState {
        self.sync.lock().state()
    }

    pub fn generation(&self) -> u64 {
        self.sync.lock().generation()
    }

    /// (Re)subscribe. Cancels any previous subscription first; its pending
    /// events are dropped.
    pub async fn subscribe(&mut self) -> Result<(), SyncError> {
        self.cancel_current();
        let generation = self.sync.lock().resubscribe();

        let mut subscription = match self.docs.subscribe(&self.board).await {
            Ok(sub) => sub,
            Err(err) => {
                let _ = self.sync.lock().apply(generation, FeedNotification::Error(err.clone()));
                return Err(err.into());
            }
        };
        let token = subscription.cancel_token();
        let sync = Arc::clone(&self.sync);
        let board = self.board.clone();
        let task = tokio::spawn(async move {
            while let Some(notification) = subscription.recv().await {
                let result = sync.lock().apply(generation, notification);
                match result {
                    Ok(outcome) => trace!(board = %board, ?outcome, "feed notification"),
                    Err(SyncError::StaleSubscription { got, current }) => {
                        trace!(board = %board, got, current, "stale feed event dropped");
                        break;
                    }
                    Err(err) => warn!(board = %board, error = %err, "feed notification failed"),
                }
            }
            debug!(board = %board, generation, "feed pump stopped");
        });
        self.current = Some((token, task));
        info!(board = %self.board, generation, "change feed subscribed");
        Ok(())
    }

    /// Stop the feed. Later events from the old subscription are dropped.
    pub fn unsubscribe(&mut self) {
        self.cancel_current();
        self.sync.lock().invalidate();
    }

    fn cancel_current(&mut self) {
        if let Some((token, _task)) = self.current.take() {
            token.cancel();
        }
    }

    /// Unsubscribe and wait for the pump to exit.
    pub async fn shutdown(mut self) {
        self.sync.lock().invalidate();
        if let Some((token, task)) = self.current.take() {
            token.cancel();
            let _ = task.await;
        }
    }
}

impl Drop for ChangeFeed {
    fn drop(&mut self) {
        self.cancel_current();
    }
}

#[cfg(test)]
mod tests {
    use pinwall_types::{BoardObject, Geometry, ObjectKind};

    use super::*;
    use crate::backend::memory::MemoryDocumentStore;
    use crate::error::BackendError;

    fn note(id: &str, revision: u64) -> BoardObject {
        let mut obj = BoardObject::new(id, ObjectKind::Note, Geometry::new(0.0, 0.0, 10.0, 10.0));
        obj.revision = revision;
        obj
    }

    #[test]
    fn test_initial_snapshot_then_incremental() {
        let store = Arc::new(ObjectStore::new());
        let mut sync = FeedSync::new(Arc::clone(&store));
        let generation = sync.resubscribe();

        let snapshot =
            vec![DocumentChange::added(note("a", 1)), DocumentChange::added(note("b", 2))];
        let outcome =
            sync.apply(generation, FeedNotification::Changes(snapshot)).expect("apply");
        assert_eq!(outcome, FeedOutcome::Snapshot { count: 2 });
        assert!(store.is_loaded());
        assert_eq!(sync.state(), FeedState::Streaming);

        let outcome = sync
            .apply(
                generation,
                FeedNotification::Changes(vec![
                    DocumentChange::added(note("c", 3)),
                    DocumentChange::modified(note("a", 4)),
                    DocumentChange::removed(note("b", 2)),
                ]),
            )
            .expect("apply");
        assert_eq!(outcome, FeedOutcome::Incremental { upserted: 2, removed: 1 });
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_stale_generation_rejected() {
        let store = Arc::new(ObjectStore::new());
        let mut sync = FeedSync::new(Arc::clone(&store));
        let old = sync.resubscribe();
        let current = sync.resubscribe();
        let late = FeedNotification::Changes(vec![DocumentChange::added(note("a", 1))]);
        let result = sync.apply(old, late);
        assert!(matches!(
            result,
            Err(SyncError::StaleSubscription { got, current: c }) if got == old && c == current
        ));
        assert!(store.is_empty());
        assert_eq!(sync.state(), FeedState::InitialLoad);
    }

    #[test]
    fn test_error_degrades_to_loaded() {
        let store = Arc::new(ObjectStore::new());
        let mut sync = FeedSync::new(Arc::clone(&store));
        let generation = sync.resubscribe();
        let outcome = sync
            .apply(generation, FeedNotification::Error(BackendError::Unavailable("down".into())))
            .expect("apply");
        assert_eq!(outcome, FeedOutcome::Degraded);
        assert!(store.is_loaded());
    }

    #[tokio::test]
    async fn test_pump_applies_durable_writes() {
        let store = Arc::new(ObjectStore::new());
        let docs = MemoryDocumentStore::new();
        let board = BoardId::new("b");
        docs.seed(&board, note("seeded", 0));

        let mut feed = ChangeFeed::new(Arc::clone(&store), Arc::new(docs.clone()), board.clone());
        feed.subscribe().await.expect("subscribe");
        docs.create(&board, note("later", 0)).await.expect("create");

        for _ in 0..50 {
            if store.len() == 2 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(store.is_loaded());
        assert_eq!(store.len(), 2);
        feed.shutdown().await;
        assert_eq!(docs.subscriber_count(&board), 0);
    }

    #[tokio::test]
    async fn test_rapid_resubscribe_keeps_single_subscriber() {
        let store = Arc::new(ObjectStore::new());
        let docs = MemoryDocumentStore::new();
        let board = BoardId::new("b");
        let mut feed = ChangeFeed::new(Arc::clone(&store), Arc::new(docs.clone()), board.clone());
        for _ in 0..5 {
            feed.subscribe().await.expect("subscribe");
        }
        assert_eq!(feed.generation(), 5);
        assert_eq!(docs.subscriber_count(&board), 1);
        feed.unsubscribe();
        assert_eq!(docs.subscriber_count(&board), 0);
    }
}
