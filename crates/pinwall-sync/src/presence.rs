//! Presence and connection monitoring for one user on one board.
//!
//! A [`PresenceHandle`] fronts an actor task that owns this user's presence
//! record and its disconnect-cleanup registration:
//!
//! ```text
//!   PresenceHandle          mpsc           PresenceActor (tokio task)
//!   ┌──────────────────┐  ───────────▶  ┌─────────────────────────────────┐
//!   │ .set_visible()   │                │ heartbeat timer (while visible) │
//!   │ .refresh()       │                │ connection watch + backoff      │
//!   │ .leave()         │  ◀───────────  │ roster subscription             │
//!   └──────────────────┘    oneshot     └─────────────────────────────────┘
//! ```
//!
//! Re-establishing presence always cancels the previous cleanup registration
//! before registering a new one, so at most one is live per user.

use std::sync::Arc;

use dashmap::DashMap;
use pinwall_types::{BoardId, PresenceRecord, UserId};
use serde_json::json;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::backend::{
    ChildEvent, CleanupId, ConnectionState, CoordinationStore, presence_path, presence_root,
};
use crate::clock::SharedClock;
use crate::config::SyncConfig;
use crate::error::{BackendError, SyncError};
use crate::subscription::Subscription;

/// Who is joining.
#[derive(Debug, Clone)]
pub struct PresenceIdentity {
    pub user: UserId,
    pub display_name: String,
    pub color: String,
}

/// Monitor state visible to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceState {
    Connected,
    /// Transport down; `attempt` re-establishment attempts made so far.
    Reconnecting { attempt: u32 },
    /// Gave up after the attempt bound; waits for the transport to return.
    Disconnected,
    Left,
}

enum PresenceCommand {
    SetVisible(bool),
    Refresh { reply: oneshot::Sender<Result<(), SyncError>> },
    Leave { reply: oneshot::Sender<Result<(), SyncError>> },
}

pub type Roster = Arc<DashMap<UserId, PresenceRecord>>;

/// Handle to a running presence monitor.
pub struct PresenceHandle {
    tx: mpsc::UnboundedSender<PresenceCommand>,
    roster: Roster,
    state: watch::Receiver<PresenceState>,
    task: Option<JoinHandle<()>>,
}

impl PresenceHandle {
    /// Join the board: seed the roster, write the presence record, register
    /// cleanup, and start the monitor task.
    pub async fn join(
        board: BoardId,
        identity: PresenceIdentity,
        coord: Arc<dyn CoordinationStore>,
        clock: SharedClock,
        config: SyncConfig,
    ) -> Result<Self, SyncError> {
        let roster: Roster = Arc::new(DashMap::new());
        let root = presence_root(&board);

        let ghost_after = config.presence_ghost_after_ms;
        seed_roster(&roster, coord.as_ref(), &root, clock.now_millis(), ghost_after).await?;
        let subscription = coord.subscribe(&root).await?;

        let (state_tx, state) = watch::channel(PresenceState::Connected);
        let mut actor = PresenceActor {
            path: presence_path(&board, &identity.user),
            identity,
            coord,
            clock,
            config,
            roster: Arc::clone(&roster),
            cleanup: None,
            visible: true,
            next_heartbeat: None,
            retry: None,
            state: state_tx,
        };
        actor.establish().await?;
        info!(board = %board, user = %actor.identity.user, "presence joined");

        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(actor.run(rx, subscription));
        Ok(Self { tx, roster, state, task: Some(task) })
    }

    /// Tab visibility. Hidden suspends heartbeats; visible refreshes presence.
    pub fn set_visible(&self, visible: bool) {
        let _ = self.tx.send(PresenceCommand::SetVisible(visible));
    }

    /// Force a full presence refresh.
    pub async fn refresh(&self) -> Result<(), SyncError> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(PresenceCommand::Refresh { reply }).map_err(|_| SyncError::Shutdown)?;
        rx.await.map_err(|_| SyncError::Shutdown)?
    }

    /// Leave the board: cancel cleanup, remove the record, stop the task.
    pub async fn leave(mut self) -> Result<(), SyncError> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(PresenceCommand::Leave { reply }).map_err(|_| SyncError::Shutdown)?;
        let result = rx.await.map_err(|_| SyncError::Shutdown)?;
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        result
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    /// Users currently online, sorted by display name.
    pub fn online(&self) -> Vec<(UserId, PresenceRecord)> {
        let mut users: Vec<_> = self
            .roster
            .iter()
            .filter(|entry| entry.value().online)
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        users.sort_by(|a, b| a.1.display_name.cmp(&b.1.display_name));
        users
    }

    pub fn state(&self) -> PresenceState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<PresenceState> {
        self.state.clone()
    }
}

impl Drop for PresenceHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// One-shot full read of the presence tree. Ghost entries are skipped.
async fn seed_roster(
    roster: &Roster,
    coord: &dyn CoordinationStore,
    root: &str,
    now: u64,
    ghost_after_ms: u64,
) -> Result<(), BackendError> {
    let Some(serde_json::Value::Object(entries)) = coord.read(root).await? else {
        return Ok(());
    };
    let mut pruned = 0usize;
    for (key, value) in entries {
        match serde_json::from_value::<PresenceRecord>(value) {
            Ok(record) if record.is_ghost(now, ghost_after_ms) => pruned += 1,
            Ok(record) => {
                roster.insert(UserId::new(key), record);
            }
            Err(err) => debug!(user = %key, error = %err, "unreadable presence record skipped"),
        }
    }
    debug!(seeded = roster.len(), pruned, "presence roster seeded");
    Ok(())
}

async fn next_event(sub: &mut Option<Subscription<ChildEvent>>) -> Option<ChildEvent> {
    match sub {
        Some(sub) => sub.recv().await,
        None => std::future::pending().await,
    }
}

struct PresenceActor {
    identity: PresenceIdentity,
    path: String,
    coord: Arc<dyn CoordinationStore>,
    clock: SharedClock,
    config: SyncConfig,
    roster: Roster,
    cleanup: Option<CleanupId>,
    visible: bool,
    next_heartbeat: Option<Instant>,
    /// Pending re-establishment: (attempt, when).
    retry: Option<(u32, Instant)>,
    state: watch::Sender<PresenceState>,
}

impl PresenceActor {
    async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<PresenceCommand>,
        roster_events: Subscription<ChildEvent>,
    ) {
        let mut connection = self.coord.connection_state();
        connection.borrow_and_update();
        let mut roster_events = Some(roster_events);

        loop {
            let heartbeat_at = self.next_heartbeat;
            let retry_at = self.retry.map(|(_, at)| at);
            let heartbeat_due = tokio::time::sleep_until(heartbeat_at.unwrap_or_else(Instant::now));
            let retry_due = tokio::time::sleep_until(retry_at.unwrap_or_else(Instant::now));
            tokio::select! {
                cmd = rx.recv() => {
                    let Some(cmd) = cmd else {
                        if let Err(err) = self.leave().await {
                            warn!(error = %err, "presence leave on close failed");
                        }
                        break;
                    };
                    if !self.handle_command(cmd).await {
                        break;
                    }
                }
                changed = connection.changed() => {
                    if changed.is_err() {
                        debug!("connection watch closed");
                        break;
                    }
                    let current = *connection.borrow_and_update();
                    self.on_connection(current).await;
                }
                _ = heartbeat_due, if heartbeat_at.is_some() => {
                    self.heartbeat().await;
                }
                _ = retry_due, if retry_at.is_some() => {
                    self.retry_establish().await;
                }
                event = next_event(&mut roster_events), if roster_events.is_some() => {
                    match event {
                        Some(event) => self.observe(event),
                        None => {
                            trace!("presence subscription ended");
                            roster_events = None;
                        }
                    }
                }
            }
        }
        let _ = self.state.send(PresenceState::Left);
        debug!(user = %self.identity.user, "presence actor stopped");
    }

    /// Returns `false` when the actor should stop.
    async fn handle_command(&mut self, cmd: PresenceCommand) -> bool {
        match cmd {
            PresenceCommand::SetVisible(visible) => {
                if visible == self.visible {
                    return true;
                }
                self.visible = visible;
                if visible {
                    info!(user = %self.identity.user, "visible again, refreshing presence");
                    if let Err(err) = self.establish().await {
                        warn!(error = %err, "presence refresh failed");
                    }
                } else {
                    debug!(user = %self.identity.user, "hidden, heartbeats suspended");
                    self.next_heartbeat = None;
                }
                true
            }
            PresenceCommand::Refresh { reply } => {
                let _ = reply.send(self.establish().await);
                true
            }
            PresenceCommand::Leave { reply } => {
                let _ = reply.send(self.leave().await);
                false
            }
        }
    }

    /// Full refresh: cancel the previous cleanup, write the record, register
    /// a new cleanup.
    async fn establish(&mut self) -> Result<(), SyncError> {
        if let Some(previous) = self.cleanup {
            self.coord.cancel_disconnect_cleanup(previous).await?;
            self.cleanup = None;
        }
        let record = PresenceRecord::online(
            self.identity.display_name.clone(),
            self.identity.color.clone(),
            self.clock.now_millis(),
        );
        let value =
            serde_json::to_value(&record).map_err(|e| BackendError::Rejected(e.to_string()))?;
        self.coord.write(&self.path, value).await?;
        self.cleanup = Some(self.coord.register_disconnect_cleanup(&self.path).await?);

        self.retry = None;
        self.schedule_heartbeat();
        self.state.send_replace(PresenceState::Connected);
        Ok(())
    }

    fn schedule_heartbeat(&mut self) {
        let interval = self.config.heartbeat_interval();
        self.next_heartbeat = self.visible.then(|| Instant::now() + interval);
    }

    /// Timestamp-only update.
    async fn heartbeat(&mut self) {
        let mut fields = serde_json::Map::new();
        fields.insert("lastSeenTimestamp".into(), json!(self.clock.now_millis()));
        match self.coord.update(&self.path, fields).await {
            Ok(()) => trace!(user = %self.identity.user, "heartbeat"),
            Err(err) => debug!(error = %err, "heartbeat failed"),
        }
        self.schedule_heartbeat();
    }

    async fn on_connection(&mut self, state: ConnectionState) {
        match state {
            ConnectionState::Connected => {
                info!(user = %self.identity.user, "transport connected, re-establishing presence");
                if let Err(err) = self.establish().await {
                    warn!(error = %err, "re-establish failed, retrying");
                    self.schedule_retry(0);
                }
            }
            ConnectionState::Disconnected => {
                warn!(user = %self.identity.user, "transport disconnected");
                self.next_heartbeat = None;
                self.schedule_retry(0);
            }
        }
    }

    fn schedule_retry(&mut self, attempt: u32) {
        if attempt >= self.config.reconnect_max_attempts {
            let user = &self.identity.user;
            warn!(%user, attempts = attempt, "presence re-establishment gave up");
            self.retry = None;
            self.state.send_replace(PresenceState::Disconnected);
            return;
        }
        let delay = self.config.reconnect_delay(attempt);
        self.retry = Some((attempt, Instant::now() + delay));
        self.state.send_replace(PresenceState::Reconnecting { attempt });
    }

    async fn retry_establish(&mut self) {
        let Some((attempt, _)) = self.retry.take() else {
            return;
        };
        match self.establish().await {
            Ok(()) => info!(user = %self.identity.user, attempt, "presence re-established"),
            Err(err) => {
                debug!(attempt, error = %err, "presence re-establishment failed");
                self.schedule_retry(attempt + 1);
            }
        }
    }

    fn observe(&self, event: ChildEvent) {
        let user = UserId::new(event.key());
        let now = self.clock.now_millis();
        match event {
            ChildEvent::Added { value, .. } | ChildEvent::Changed { value, .. } => {
                match serde_json::from_value::<PresenceRecord>(value) {
                    Ok(record) if record.is_ghost(now, self.config.presence_ghost_after_ms) => {
                        self.roster.remove(&user);
                    }
                    Ok(record) => {
                        self.roster.insert(user, record);
                    }
                    Err(err) => {
                        trace!(user = %user, error = %err, "partial presence record ignored")
                    }
                }
            }
            ChildEvent::Removed { .. } => {
                self.roster.remove(&user);
            }
        }
    }

    async fn leave(&mut self) -> Result<(), SyncError> {
        self.next_heartbeat = None;
        self.retry = None;
        if let Some(cleanup) = self.cleanup.take() {
            self.coord.cancel_disconnect_cleanup(cleanup).await?;
        }
        self.coord.remove(&self.path).await?;
        self.roster.remove(&self.identity.user);
        info!(user = %self.identity.user, "presence left");
        Ok(())
    }
}
