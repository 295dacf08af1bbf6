//! Shared setup for integration tests: one board backed by in-memory
//! collaborators, joined by any number of clients.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use pinwall_sync::backend::memory::{
    MemoryCoordinationServer, MemoryCoordinationStore, MemoryDocumentStore, ScriptedToolService,
};
use pinwall_sync::{
    BoardSession, Collaborators, ManualClock, PresenceIdentity, SharedClock, SyncConfig,
};
use pinwall_types::{BoardId, UserId};

pub const CLEANUP_DELAY: Duration = Duration::from_secs(60);

pub struct TestBoard {
    pub id: BoardId,
    pub docs: MemoryDocumentStore,
    pub server: MemoryCoordinationServer,
    pub tools: ScriptedToolService,
    pub clock: Arc<ManualClock>,
    pub config: SyncConfig,
}

/// Route engine logs through the test harness (`RUST_LOG=pinwall_sync=debug`).
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

impl TestBoard {
    pub fn new() -> Self {
        init_tracing();
        Self {
            id: BoardId::new("board-1"),
            docs: MemoryDocumentStore::new(),
            server: MemoryCoordinationServer::new(CLEANUP_DELAY),
            tools: ScriptedToolService::new(),
            clock: Arc::new(ManualClock::new(1_000)),
            config: SyncConfig::default(),
        }
    }

    pub fn identity(user: &str) -> PresenceIdentity {
        let mut name = user.to_string();
        if let Some(first) = name.get_mut(0..1) {
            first.make_ascii_uppercase();
        }
        PresenceIdentity {
            user: UserId::new(user),
            display_name: name,
            color: "#3b82f6".into(),
        }
    }

    /// Join as `user`. Returns the session and the client's coordination
    /// connection (for dropping the transport).
    pub async fn join(&self, user: &str) -> (BoardSession, MemoryCoordinationStore) {
        let connection = self.server.connect();
        let clock: SharedClock = self.clock.clone();
        let collaborators = Collaborators {
            docs: Arc::new(self.docs.clone()),
            coord: Arc::new(connection.clone()),
            tools: Arc::new(self.tools.clone()),
        };
        let session = BoardSession::open(
            self.id.clone(),
            Self::identity(user),
            collaborators,
            self.config.clone(),
            clock,
        )
        .await
        .expect("open session");
        assert!(eventually(|| session.store().is_loaded()).await, "initial load");
        (session, connection)
    }
}

/// Let spawned tasks run.
pub async fn settle() {
    for _ in 0..64 {
        tokio::task::yield_now().await;
    }
}

/// Poll `condition` while yielding to other tasks.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if condition() {
            return true;
        }
        tokio::task::yield_now().await;
    }
    condition()
}
