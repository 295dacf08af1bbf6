//! Soft per-object edit locks in the coordination store.
//!
//! # Protocol
//!
//! ```text
//! acquire:  read ──held by other?──▶ LockContention
//!             │
//!           write {holderId, holderName, timestamp}
//!             │
//!           read ──holder != self?──▶ LockContention (winner's record untouched)
//!             │
//!           register disconnect cleanup (once per hold)
//!
//! release:  cancel cleanup ─▶ read ─▶ remove if the record still names self
//! ```
//!
//! The store has no exclusion, so two clients can both pass the pre-read. The
//! re-read after writing decides the race: only the client whose record
//! survived proceeds. Lock operations from one coordinator are serialized.
//!
//! Locks older than the staleness threshold are reported `possibly_stale` but
//! are still treated as held.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use pinwall_types::{BoardId, LockRecord, ObjectId, UserId};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::backend::{ChildEvent, CleanupId, CoordinationStore, lock_path, locks_root};
use crate::clock::SharedClock;
use crate::error::{BackendError, SyncError};

/// A lock as seen by observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockStatus {
    pub record: LockRecord,
    pub possibly_stale: bool,
}

/// Lock changes visible to this client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockEvent {
    /// The shared lock view changed for an object.
    Changed { object_id: ObjectId, lock: Option<LockRecord> },
    /// This client acquired a lock.
    Acquired { object_id: ObjectId },
    /// This client released a lock.
    Released { object_id: ObjectId },
    /// A lock this client held was overwritten or removed by someone else.
    Lost { object_id: ObjectId, new_holder: Option<LockRecord> },
}

struct Shared {
    board: BoardId,
    user: UserId,
    user_name: String,
    coord: Arc<dyn CoordinationStore>,
    clock: SharedClock,
    stale_after_ms: u64,
    view: DashMap<ObjectId, LockRecord>,
    held: Mutex<HashMap<ObjectId, CleanupId>>,
    events: broadcast::Sender<LockEvent>,
    ops: tokio::sync::Mutex<()>,
}

impl Shared {
    fn emit(&self, event: LockEvent) {
        let _ = self.events.send(event);
    }

    async fn read_record(&self, path: &str) -> Result<Option<LockRecord>, BackendError> {
        let Some(value) = self.coord.read(path).await? else {
            return Ok(None);
        };
        match serde_json::from_value(value) {
            Ok(record) => Ok(Some(record)),
            Err(err) => {
                warn!(path, error = %err, "unreadable lock record ignored");
                Ok(None)
            }
        }
    }

    /// Apply a child event from the locks subscription to the view.
    ///
    /// Events can arrive after this client's own later writes, so an event
    /// that contradicts a current hold is checked against the store before
    /// the hold is given up.
    async fn observe(&self, event: ChildEvent) {
        let object_id = ObjectId::new(event.key());
        let mut lock = match event {
            ChildEvent::Added { value, .. } | ChildEvent::Changed { value, .. } => {
                match serde_json::from_value::<LockRecord>(value) {
                    Ok(record) => Some(record),
                    Err(err) => {
                        warn!(object = %object_id, error = %err, "unreadable lock record ignored");
                        return;
                    }
                }
            }
            ChildEvent::Removed { .. } => None,
        };

        let displaced = lock.as_ref().is_none_or(|record| !record.is_held_by(&self.user));
        if displaced && self.held.lock().contains_key(&object_id) {
            let _guard = self.ops.lock().await;
            let current = match self.read_record(&lock_path(&self.board, &object_id)).await {
                Ok(current) => current,
                Err(err) => {
                    warn!(object = %object_id, error = %err, "lock loss unconfirmed, keeping hold");
                    return;
                }
            };
            let still_ours = current.as_ref().is_some_and(|record| record.is_held_by(&self.user));
            if still_ours {
                trace!(object = %object_id, "lock event predates the current hold");
            } else if let Some(cleanup) = {
                let removed = self.held.lock().remove(&object_id);
                removed
            } {
                let holder = current.as_ref().map(|r| r.holder_name.as_str());
                warn!(object = %object_id, ?holder, "held lock lost");
                if let Err(err) = self.coord.cancel_disconnect_cleanup(cleanup).await {
                    debug!(error = %err, "cancel cleanup after lost lock failed");
                }
                self.emit(LockEvent::Lost {
                    object_id: object_id.clone(),
                    new_holder: current.clone(),
                });
            }
            lock = current;
        }

        match &lock {
            Some(record) => {
                self.view.insert(object_id.clone(), record.clone());
            }
            None => {
                self.view.remove(&object_id);
            }
        }
        self.emit(LockEvent::Changed { object_id, lock });
    }
}

/// Acquires, maintains, and releases this client's locks on one board, and
/// mirrors every client's locks for observers.
pub struct LockCoordinator {
    shared: Arc<Shared>,
    watcher: Mutex<Option<CancellationToken>>,
}

impl LockCoordinator {
    pub fn new(
        board: BoardId,
        user: UserId,
        user_name: impl Into<String>,
        coord: Arc<dyn CoordinationStore>,
        clock: SharedClock,
        stale_after_ms: u64,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            shared: Arc::new(Shared {
                board,
                user,
                user_name: user_name.into(),
                coord,
                clock,
                stale_after_ms,
                view: DashMap::new(),
                held: Mutex::new(HashMap::new()),
                events,
                ops: tokio::sync::Mutex::new(()),
            }),
            watcher: Mutex::new(None),
        }
    }

    pub fn user(&self) -> &UserId {
        &self.shared.user
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LockEvent> {
        self.shared.events.subscribe()
    }

    /// Start mirroring the board's locks into the local view.
    pub async fn start(&self) -> Result<(), SyncError> {
        let mut subscription = self.shared.coord.subscribe(&locks_root(&self.shared.board)).await?;
        let token = subscription.cancel_token();
        if let Some(previous) = self.watcher.lock().replace(token) {
            previous.cancel();
        }
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                trace!(key = event.key(), "lock event");
                shared.observe(event).await;
            }
            debug!(board = %shared.board, "lock watcher stopped");
        });
        Ok(())
    }

    /// Acquire the lock on `object_id`.
    pub async fn acquire(&self, object_id: &ObjectId) -> Result<(), SyncError> {
        let shared = &self.shared;
        let _guard = shared.ops.lock().await;
        if shared.held.lock().contains_key(object_id) {
            trace!(object = %object_id, "lock already held");
            return Ok(());
        }

        let path = lock_path(&shared.board, object_id);
        if let Some(existing) = shared.read_record(&path).await? {
            if !existing.is_held_by(&shared.user) {
                let holder = &existing.holder_name;
                debug!(object = %object_id, %holder, "lock held by another client");
                return Err(SyncError::LockContention {
                    object_id: object_id.clone(),
                    holder_name: existing.holder_name,
                });
            }
        }

        let now = shared.clock.now_millis();
        let record = LockRecord::new(shared.user.clone(), shared.user_name.clone(), now);
        let value =
            serde_json::to_value(&record).map_err(|e| BackendError::Rejected(e.to_string()))?;
        shared.coord.write(&path, value).await?;

        match shared.read_record(&path).await? {
            Some(current) if current.is_held_by(&shared.user) => {}
            Some(current) => {
                debug!(object = %object_id, winner = %current.holder_name, "lock race lost");
                return Err(SyncError::LockContention {
                    object_id: object_id.clone(),
                    holder_name: current.holder_name,
                });
            }
            None => {
                return Err(SyncError::LockContention {
                    object_id: object_id.clone(),
                    holder_name: String::new(),
                });
            }
        }

        let cleanup = match shared.coord.register_disconnect_cleanup(&path).await {
            Ok(cleanup) => cleanup,
            Err(err) => {
                tracing::error!(object = %object_id, error = %err, "cleanup registration failed");
                if let Err(undo) = shared.coord.remove(&path).await {
                    warn!(object = %object_id, error = %undo, "failed to undo lock write");
                }
                return Err(err.into());
            }
        };

        shared.held.lock().insert(object_id.clone(), cleanup);
        shared.view.insert(object_id.clone(), record);
        info!(object = %object_id, "lock acquired");
        shared.emit(LockEvent::Acquired { object_id: object_id.clone() });
        Ok(())
    }

    /// Release the lock on `object_id` if this client holds it.
    pub async fn release(&self, object_id: &ObjectId) -> Result<(), SyncError> {
        let shared = &self.shared;
        let _guard = shared.ops.lock().await;
        let Some(cleanup) = shared.held.lock().remove(object_id) else {
            return Ok(());
        };

        if let Err(err) = shared.coord.cancel_disconnect_cleanup(cleanup).await {
            warn!(object = %object_id, error = %err, "failed to cancel lock cleanup");
        }

        let path = lock_path(&shared.board, object_id);
        let still_ours = shared
            .read_record(&path)
            .await?
            .is_some_and(|record| record.is_held_by(&shared.user));
        if still_ours {
            shared.coord.remove(&path).await?;
            shared.view.remove(object_id);
        }
        info!(object = %object_id, "lock released");
        shared.emit(LockEvent::Released { object_id: object_id.clone() });
        Ok(())
    }

    /// Release every lock this client holds. Errors are logged.
    pub async fn release_all(&self) {
        let ids: Vec<ObjectId> = self.shared.held.lock().keys().cloned().collect();
        for id in ids {
            if let Err(err) = self.release(&id).await {
                warn!(object = %id, error = %err, "release during teardown failed");
            }
        }
    }

    pub fn is_held(&self, object_id: &ObjectId) -> bool {
        self.shared.held.lock().contains_key(object_id)
    }

    pub fn held(&self) -> Vec<ObjectId> {
        self.shared.held.lock().keys().cloned().collect()
    }

    /// Current lock on `object_id` from the shared view.
    pub fn lock_status(&self, object_id: &ObjectId) -> Option<LockStatus> {
        let record = self.shared.view.get(object_id)?.value().clone();
        Some(self.status(record))
    }

    /// Whether another client holds `object_id`.
    pub fn is_locked_by_other(&self, object_id: &ObjectId) -> bool {
        self.shared
            .view
            .get(object_id)
            .is_some_and(|record| !record.is_held_by(&self.shared.user))
    }

    /// Every lock in the shared view.
    pub fn locks(&self) -> Vec<(ObjectId, LockStatus)> {
        let records: Vec<(ObjectId, LockRecord)> = self
            .shared
            .view
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        records.into_iter().map(|(id, record)| (id, self.status(record))).collect()
    }

    fn status(&self, record: LockRecord) -> LockStatus {
        let age = record.age_millis(self.shared.clock.now_millis());
        let possibly_stale = age > self.shared.stale_after_ms;
        LockStatus { record, possibly_stale }
    }

    /// Stop the view mirror. Held locks are not released.
    pub fn stop(&self) {
        if let Some(token) = self.watcher.lock().take() {
            token.cancel();
        }
    }
}

impl Drop for LockCoordinator {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::Value;
    use tokio::sync::watch;
    use tokio::time::Instant;

    use super::*;
    use crate::backend::ConnectionState;
    use crate::backend::memory::{MemoryCoordinationServer, MemoryCoordinationStore};
    use crate::clock::ManualClock;
    use crate::subscription::Subscription;

    /// Coordination connection whose child events arrive `lag` late.
    struct LaggedEvents {
        inner: MemoryCoordinationStore,
        lag: Duration,
    }

    #[async_trait]
    impl CoordinationStore for LaggedEvents {
        async fn write(&self, path: &str, value: Value) -> Result<(), BackendError> {
            self.inner.write(path, value).await
        }

        async fn update(
            &self,
            path: &str,
            fields: serde_json::Map<String, Value>,
        ) -> Result<(), BackendError> {
            self.inner.update(path, fields).await
        }

        async fn remove(&self, path: &str) -> Result<(), BackendError> {
            self.inner.remove(path).await
        }

        async fn read(&self, path: &str) -> Result<Option<Value>, BackendError> {
            self.inner.read(path).await
        }

        async fn subscribe(&self, path: &str) -> Result<Subscription<ChildEvent>, BackendError> {
            let mut upstream = self.inner.subscribe(path).await?;
            let (publisher, subscription) = Subscription::pair();
            let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
            let lag = self.lag;
            tokio::spawn(async move {
                while let Some(event) = upstream.recv().await {
                    if tx.send((Instant::now() + lag, event)).is_err() {
                        break;
                    }
                }
            });
            tokio::spawn(async move {
                while let Some((due, event)) = rx.recv().await {
                    tokio::time::sleep_until(due).await;
                    if !publisher.send(event) {
                        break;
                    }
                }
            });
            Ok(subscription)
        }

        async fn register_disconnect_cleanup(&self, path: &str) -> Result<CleanupId, BackendError> {
            self.inner.register_disconnect_cleanup(path).await
        }

        async fn cancel_disconnect_cleanup(&self, id: CleanupId) -> Result<(), BackendError> {
            self.inner.cancel_disconnect_cleanup(id).await
        }

        fn connection_state(&self) -> watch::Receiver<ConnectionState> {
            self.inner.connection_state()
        }
    }

    fn coordinator(
        store: &MemoryCoordinationStore,
        user: &str,
        clock: Arc<ManualClock>,
    ) -> LockCoordinator {
        LockCoordinator::new(
            BoardId::new("b"),
            UserId::new(user),
            user.to_uppercase(),
            Arc::new(store.clone()),
            clock,
            30_000,
        )
    }

    #[tokio::test]
    async fn test_acquire_release_cycle() {
        let server = MemoryCoordinationServer::new(Duration::from_secs(60));
        let store = server.connect();
        let clock = Arc::new(ManualClock::new(1_000));
        let locks = coordinator(&store, "ada", clock);
        let id = ObjectId::new("sticky-1");
        let path = lock_path(&BoardId::new("b"), &id);

        locks.acquire(&id).await.expect("acquire");
        assert!(locks.is_held(&id));
        assert_eq!(server.registrations_for(&path), 1);

        // Re-acquire is a no-op: no second registration.
        locks.acquire(&id).await.expect("reacquire");
        assert_eq!(server.registrations_for(&path), 1);

        locks.release(&id).await.expect("release");
        assert!(!locks.is_held(&id));
        assert!(server.value(&path).is_none());
        assert_eq!(server.registrations_for(&path), 0);
    }

    #[tokio::test]
    async fn test_contention_leaves_holder_untouched() {
        let server = MemoryCoordinationServer::new(Duration::from_secs(60));
        let clock = Arc::new(ManualClock::new(1_000));
        let ada = coordinator(&server.connect(), "ada", clock.clone());
        let bo = coordinator(&server.connect(), "bo", clock);
        let id = ObjectId::new("sticky-1");

        ada.acquire(&id).await.expect("acquire");
        let err = bo.acquire(&id).await.expect_err("contention");
        assert!(matches!(
            err,
            SyncError::LockContention { ref holder_name, .. } if holder_name == "ADA"
        ));

        let stored = server.value(&lock_path(&BoardId::new("b"), &id)).expect("record");
        assert_eq!(stored["holderId"], "ada");

        // Releasing a lock we don't hold touches nothing.
        bo.release(&id).await.expect("release");
        assert!(server.value(&lock_path(&BoardId::new("b"), &id)).is_some());
    }

    #[tokio::test]
    async fn test_stale_lock_still_blocks() {
        let server = MemoryCoordinationServer::new(Duration::from_secs(60));
        let clock = Arc::new(ManualClock::new(1_000));
        let ada_store = server.connect();
        let ada = coordinator(&ada_store, "ada", clock.clone());
        let bo = coordinator(&server.connect(), "bo", clock.clone());
        bo.start().await.expect("start");
        let id = ObjectId::new("n");

        ada.acquire(&id).await.expect("acquire");
        clock.advance(31_000);
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        let status = bo.lock_status(&id).expect("visible");
        assert!(status.possibly_stale);
        assert!(bo.is_locked_by_other(&id));
        assert!(bo.acquire(&id).await.is_err());
    }

    #[tokio::test]
    async fn test_overwritten_lock_emits_lost() {
        let server = MemoryCoordinationServer::new(Duration::from_secs(60));
        let clock = Arc::new(ManualClock::new(1_000));
        let store = server.connect();
        let ada = coordinator(&store, "ada", clock);
        ada.start().await.expect("start");
        let mut events = ada.subscribe();
        let id = ObjectId::new("n");
        ada.acquire(&id).await.expect("acquire");

        let intruder = LockRecord::new(UserId::new("mallory"), "M", 2_000);
        let value = serde_json::to_value(&intruder).expect("json");
        server.put(&lock_path(&BoardId::new("b"), &id), value);

        let lost = tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                match events.recv().await {
                    Ok(LockEvent::Lost { object_id, new_holder }) => break (object_id, new_holder),
                    Ok(_) => continue,
                    Err(err) => panic!("event stream closed: {err}"),
                }
            }
        })
        .await
        .expect("lost event");
        assert_eq!(lost.0, id);
        assert_eq!(lost.1.map(|r| r.holder_name), Some("M".to_string()));
        assert!(!ada.is_held(&id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_removal_from_previous_hold_keeps_new_hold() {
        let server = MemoryCoordinationServer::new(Duration::from_secs(60));
        let lagged = LaggedEvents { inner: server.connect(), lag: Duration::from_millis(50) };
        let clock = Arc::new(ManualClock::new(1_000));
        let locks = LockCoordinator::new(
            BoardId::new("b"),
            UserId::new("ada"),
            "ADA",
            Arc::new(lagged),
            clock,
            30_000,
        );
        locks.start().await.expect("start");
        let mut events = locks.subscribe();
        let id = ObjectId::new("sticky-1");
        let path = lock_path(&BoardId::new("b"), &id);

        // Two quick gestures on the same object: the first release's removal
        // is delivered after the second acquire.
        locks.acquire(&id).await.expect("first acquire");
        tokio::time::sleep(Duration::from_millis(100)).await;
        locks.release(&id).await.expect("release");
        locks.acquire(&id).await.expect("second acquire");
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert!(locks.is_held(&id));
        assert!(server.value(&path).is_some());
        assert_eq!(server.registrations_for(&path), 1);
        assert!(locks.lock_status(&id).is_some_and(|s| s.record.holder_id == UserId::new("ada")));
        while let Ok(event) = events.try_recv() {
            assert!(!matches!(event, LockEvent::Lost { .. }), "unexpected {event:?}");
        }

        locks.release(&id).await.expect("final release");
        assert!(server.value(&path).is_none());
        assert_eq!(server.registrations_for(&path), 0);
    }
}
