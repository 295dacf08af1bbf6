//! One user's session on one board.
//!
//! [`BoardSession`] owns every per-board service: the object store fed by the
//! change feed, the lock coordinator, the presence monitor, the optimistic
//! mutator, and the agent orchestrator. Nothing is global; leaving tears the
//! services down in order (locks, presence, feed).

use std::sync::Arc;

use pinwall_types::{BoardId, BoardObject, ObjectId, Rect, UserId};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::agent::{AgentOrchestrator, CommandReport};
use crate::backend::{CoordinationStore, DocumentStore, ToolService};
use crate::clock::SharedClock;
use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::feed::{ChangeFeed, FeedState};
use crate::gesture::{GestureKind, GestureSession};
use crate::locks::LockCoordinator;
use crate::mutations::BoardMutator;
use crate::presence::{PresenceHandle, PresenceIdentity};
use crate::store::ObjectStore;

/// External services a session talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub docs: Arc<dyn DocumentStore>,
    pub coord: Arc<dyn CoordinationStore>,
    pub tools: Arc<dyn ToolService>,
}

pub struct BoardSession {
    board: BoardId,
    identity: PresenceIdentity,
    config: SyncConfig,
    store: Arc<ObjectStore>,
    docs: Arc<dyn DocumentStore>,
    feed: ChangeFeed,
    locks: Arc<LockCoordinator>,
    presence: PresenceHandle,
    mutator: BoardMutator,
    agent: AgentOrchestrator,
}

impl BoardSession {
    /// Join `board`: subscribe to the change feed, start mirroring locks, and
    /// announce presence.
    pub async fn open(
        board: BoardId,
        identity: PresenceIdentity,
        collaborators: Collaborators,
        config: SyncConfig,
        clock: SharedClock,
    ) -> Result<Self, SyncError> {
        let Collaborators { docs, coord, tools } = collaborators;
        let store = Arc::new(ObjectStore::with_viewport_padding(config.viewport_padding));

        let mut feed = ChangeFeed::new(Arc::clone(&store), Arc::clone(&docs), board.clone());
        feed.subscribe().await?;

        let locks = Arc::new(LockCoordinator::new(
            board.clone(),
            identity.user.clone(),
            identity.display_name.clone(),
            Arc::clone(&coord),
            Arc::clone(&clock),
            config.lock_stale_after_ms,
        ));
        locks.start().await?;

        let presence =
            PresenceHandle::join(board.clone(), identity.clone(), coord, clock, config.clone())
                .await?;

        let mutator = BoardMutator::new(
            board.clone(),
            identity.user.clone(),
            Arc::clone(&store),
            Arc::clone(&docs),
        );
        let agent = AgentOrchestrator::new(
            board.clone(),
            Arc::clone(&store),
            Arc::clone(&docs),
            tools,
            config.clone(),
        );

        info!(board = %board, user = %identity.user, "board session opened");
        Ok(Self { board, identity, config, store, docs, feed, locks, presence, mutator, agent })
    }

    pub fn board(&self) -> &BoardId {
        &self.board
    }

    pub fn user(&self) -> &UserId {
        &self.identity.user
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<ObjectStore> {
        &self.store
    }

    pub fn locks(&self) -> &Arc<LockCoordinator> {
        &self.locks
    }

    pub fn presence(&self) -> &PresenceHandle {
        &self.presence
    }

    pub fn mutator(&self) -> &BoardMutator {
        &self.mutator
    }

    pub fn agent(&self) -> &AgentOrchestrator {
        &self.agent
    }

    pub fn feed_state(&self) -> FeedState {
        self.feed.state()
    }

    /// Objects visible in `viewport`, in paint order.
    pub fn visible(&self, viewport: &Rect) -> Vec<BoardObject> {
        self.store.query_viewport(viewport)
    }

    /// Re-subscribe the change feed (for example after the host reconnects).
    pub async fn resubscribe(&mut self) -> Result<(), SyncError> {
        self.feed.subscribe().await
    }

    pub fn set_visible(&self, visible: bool) {
        self.presence.set_visible(visible);
    }

    /// Start a drag or resize on `object_id`.
    pub async fn begin_gesture(
        &self,
        kind: GestureKind,
        object_id: &ObjectId,
    ) -> Result<GestureSession, SyncError> {
        GestureSession::begin(
            kind,
            self.board.clone(),
            object_id.clone(),
            Arc::clone(&self.store),
            Arc::clone(&self.docs),
            Arc::clone(&self.locks),
            self.config.grid_size,
        )
        .await
    }

    /// Run an agent prompt as this user.
    pub async fn run_agent(
        &self,
        prompt: &str,
        cancel: CancellationToken,
    ) -> Result<CommandReport, SyncError> {
        self.agent.run(&self.identity.user, prompt, cancel).await
    }

    /// Release locks, leave presence, and stop the feed. Teardown continues
    /// past failures; the first one is returned.
    pub async fn leave(self) -> Result<(), SyncError> {
        let Self { board, identity, locks, presence, feed, .. } = self;

        locks.release_all().await;
        locks.stop();

        let result = presence.leave().await;
        if let Err(err) = &result {
            warn!(board = %board, error = %err, "presence leave failed");
        }

        feed.shutdown().await;
        info!(board = %board, user = %identity.user, "board session closed");
        result
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pinwall_types::{Geometry, ObjectKind};

    use super::*;
    use crate::backend::memory::{
        MemoryCoordinationServer, MemoryDocumentStore, ScriptedToolService,
    };
    use crate::backend::{lock_path, presence_path};
    use crate::clock::ManualClock;

    fn identity(user: &str) -> PresenceIdentity {
        PresenceIdentity {
            user: UserId::new(user),
            display_name: user.to_uppercase(),
            color: "#ff8800".into(),
        }
    }

    #[tokio::test]
    async fn test_open_loads_board_and_leave_cleans_up() {
        let board = BoardId::new("b");
        let docs = MemoryDocumentStore::new();
        let note = BoardObject::new("n1", ObjectKind::Note, Geometry::new(0.0, 0.0, 100.0, 100.0));
        docs.seed(&board, note);
        let server = MemoryCoordinationServer::new(Duration::from_secs(60));
        let collaborators = Collaborators {
            docs: Arc::new(docs.clone()),
            coord: Arc::new(server.connect()),
            tools: Arc::new(ScriptedToolService::new()),
        };

        let session = BoardSession::open(
            board.clone(),
            identity("ada"),
            collaborators,
            SyncConfig::default(),
            Arc::new(ManualClock::new(1_000)),
        )
        .await
        .expect("open");

        for _ in 0..50 {
            if session.store().is_loaded() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(session.store().is_loaded());
        assert_eq!(session.feed_state(), FeedState::Streaming);
        assert_eq!(session.store().len(), 1);

        let id = ObjectId::new("n1");
        let gesture = session.begin_gesture(GestureKind::Drag, &id).await.expect("gesture");
        assert!(server.value(&lock_path(&board, &id)).is_some());
        assert!(server.value(&presence_path(&board, &UserId::new("ada"))).is_some());

        // Leaving mid-gesture still releases the gesture's lock.
        session.leave().await.expect("leave");
        assert!(server.value(&lock_path(&board, &id)).is_none());
        assert!(server.value(&presence_path(&board, &UserId::new("ada"))).is_none());
        assert_eq!(docs.subscriber_count(&board), 0);
        drop(gesture);
    }
}
