//! In-process collaborators for tests and the simulator.
//!
//! - [`MemoryDocumentStore`]: revision-stamped documents with change-feed
//!   fan-out and failure injection.
//! - [`MemoryCoordinationServer`] / [`MemoryCoordinationStore`]: one shared
//!   tree, one store handle per client connection, disconnect cleanup after a
//!   bounded delay.
//! - [`ScriptedToolService`]: replays queued tool streams.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use pinwall_types::{BoardId, BoardObject, ObjectId, ObjectPatch};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, trace};

use super::{
    BatchWrite, ChangeKind, ChildEvent, CleanupId, ConnectionState, CoordinationStore,
    DocumentChange, DocumentStore, FeedNotification, ToolRequest, ToolService, ToolStreamItem,
};
use crate::error::BackendError;
use crate::subscription::{Publisher, Subscription};

// ============================================================================
// Document store
// ============================================================================

#[derive(Default)]
struct DocState {
    boards: HashMap<BoardId, BTreeMap<ObjectId, BoardObject>>,
    subscribers: HashMap<BoardId, Vec<Publisher<FeedNotification>>>,
    next_revision: u64,
    writes: u64,
    fail_at: Option<u64>,
    unavailable: bool,
}

impl DocState {
    /// Count a write attempt and decide whether it fails.
    fn admit_write(&mut self) -> Result<(), BackendError> {
        if self.unavailable {
            return Err(BackendError::Unavailable("document store offline".into()));
        }
        let attempt = self.writes + 1;
        if self.fail_at == Some(attempt) {
            self.fail_at = None;
            return Err(BackendError::Unavailable(format!("injected failure at write {attempt}")));
        }
        self.writes = attempt;
        Ok(())
    }

    fn stamp(&mut self, object: &mut BoardObject) {
        self.next_revision += 1;
        object.revision = self.next_revision;
    }

    fn notify(&mut self, board: &BoardId, changes: Vec<DocumentChange>) {
        if changes.is_empty() {
            return;
        }
        if let Some(subs) = self.subscribers.get_mut(board) {
            subs.retain(|p| p.send(FeedNotification::Changes(changes.clone())));
        }
    }

    fn set(&mut self, board: &BoardId, mut object: BoardObject) -> DocumentChange {
        object.normalize();
        self.stamp(&mut object);
        let docs = self.boards.entry(board.clone()).or_default();
        let kind = if docs.contains_key(&object.id) {
            ChangeKind::Modified
        } else {
            ChangeKind::Added
        };
        docs.insert(object.id.clone(), object.clone());
        DocumentChange { kind, object }
    }

    fn patch(
        &mut self,
        board: &BoardId,
        id: &ObjectId,
        patch: &ObjectPatch,
    ) -> Result<DocumentChange, BackendError> {
        self.next_revision += 1;
        let revision = self.next_revision;
        let object = self
            .boards
            .get_mut(board)
            .and_then(|docs| docs.get_mut(id))
            .ok_or_else(|| BackendError::NotFound(id.to_string()))?;
        patch.apply_to(object);
        object.normalize();
        object.revision = revision;
        Ok(DocumentChange::modified(object.clone()))
    }

    fn delete(&mut self, board: &BoardId, id: &ObjectId) -> Option<DocumentChange> {
        self.boards
            .get_mut(board)
            .and_then(|docs| docs.remove(id))
            .map(DocumentChange::removed)
    }
}

/// Durable store held in memory.
#[derive(Clone, Default)]
pub struct MemoryDocumentStore {
    state: Arc<Mutex<DocState>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the `n`-th write attempt from now (1-based), once.
    pub fn fail_write_at(&self, n: u64) {
        let mut state = self.state.lock();
        state.fail_at = Some(state.writes + n);
    }

    /// Take the whole store offline (or back online).
    pub fn set_available(&self, available: bool) {
        self.state.lock().unavailable = !available;
    }

    /// Deliver an error notification to every subscriber of `board`.
    pub fn inject_feed_error(&self, board: &BoardId, message: &str) {
        let mut state = self.state.lock();
        if let Some(subs) = state.subscribers.get_mut(board) {
            let err = BackendError::Unavailable(message.to_string());
            subs.retain(|p| p.send(FeedNotification::Error(err.clone())));
        }
    }

    /// Seed an object without counting a write.
    pub fn seed(&self, board: &BoardId, object: BoardObject) -> BoardObject {
        let mut state = self.state.lock();
        let change = state.set(board, object);
        state.notify(board, vec![change.clone()]);
        change.object
    }

    pub fn get(&self, board: &BoardId, id: &ObjectId) -> Option<BoardObject> {
        self.state.lock().boards.get(board).and_then(|docs| docs.get(id)).cloned()
    }

    pub fn snapshot(&self, board: &BoardId) -> Vec<BoardObject> {
        self.state
            .lock()
            .boards
            .get(board)
            .map(|docs| docs.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Successful writes so far.
    pub fn write_count(&self) -> u64 {
        self.state.lock().writes
    }

    pub fn subscriber_count(&self, board: &BoardId) -> usize {
        let mut state = self.state.lock();
        state
            .subscribers
            .get_mut(board)
            .map(|subs| {
                subs.retain(|p| !p.is_closed());
                subs.len()
            })
            .unwrap_or(0)
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn create(
        &self,
        board: &BoardId,
        object: BoardObject,
    ) -> Result<BoardObject, BackendError> {
        tokio::task::yield_now().await;
        let mut state = self.state.lock();
        state.admit_write()?;
        let change = state.set(board, object);
        trace!(board = %board, id = %change.object.id, revision = change.object.revision, "create");
        state.notify(board, vec![change.clone()]);
        Ok(change.object)
    }

    async fn update(
        &self,
        board: &BoardId,
        id: &ObjectId,
        patch: ObjectPatch,
    ) -> Result<BoardObject, BackendError> {
        tokio::task::yield_now().await;
        let mut state = self.state.lock();
        let exists = state.boards.get(board).is_some_and(|docs| docs.contains_key(id));
        if !exists {
            return Err(BackendError::NotFound(id.to_string()));
        }
        state.admit_write()?;
        let change = state.patch(board, id, &patch)?;
        state.notify(board, vec![change.clone()]);
        Ok(change.object)
    }

    async fn delete(&self, board: &BoardId, id: &ObjectId) -> Result<(), BackendError> {
        tokio::task::yield_now().await;
        let mut state = self.state.lock();
        state.admit_write()?;
        if let Some(change) = state.delete(board, id) {
            state.notify(board, vec![change]);
        }
        Ok(())
    }

    async fn commit_batch(
        &self,
        board: &BoardId,
        writes: Vec<BatchWrite>,
    ) -> Result<(), BackendError> {
        tokio::task::yield_now().await;
        let mut state = self.state.lock();
        // Validate before touching anything so the batch is all-or-nothing.
        for write in &writes {
            if let BatchWrite::Update(id, _) = write {
                let exists = state.boards.get(board).is_some_and(|docs| docs.contains_key(id));
                if !exists {
                    return Err(BackendError::NotFound(id.to_string()));
                }
            }
        }
        state.admit_write()?;

        let mut changes = Vec::with_capacity(writes.len());
        for write in writes {
            match write {
                BatchWrite::Set(object) => changes.push(state.set(board, object)),
                BatchWrite::Update(id, patch) => changes.push(state.patch(board, &id, &patch)?),
                BatchWrite::Delete(id) => changes.extend(state.delete(board, &id)),
            }
        }
        debug!(board = %board, changes = changes.len(), "batch committed");
        state.notify(board, changes);
        Ok(())
    }

    async fn subscribe(
        &self,
        board: &BoardId,
    ) -> Result<Subscription<FeedNotification>, BackendError> {
        let mut state = self.state.lock();
        if state.unavailable {
            return Err(BackendError::Unavailable("document store offline".into()));
        }
        let (publisher, subscription) = Subscription::pair();
        let initial = state
            .boards
            .get(board)
            .map(|docs| docs.values().cloned().map(DocumentChange::added).collect())
            .unwrap_or_default();
        publisher.send(FeedNotification::Changes(initial));
        state.subscribers.entry(board.clone()).or_default().push(publisher);
        Ok(subscription)
    }
}

// ============================================================================
// Coordination store
// ============================================================================

type ClientId = u64;

struct Registration {
    client: ClientId,
    path: String,
}

#[derive(Default)]
struct TreeState {
    values: BTreeMap<String, Value>,
    subscribers: Vec<(String, Publisher<ChildEvent>)>,
    cleanups: BTreeMap<CleanupId, Registration>,
    next_cleanup: u64,
    next_client: ClientId,
    registrations_made: u64,
}

impl TreeState {
    fn split(path: &str) -> Option<(&str, &str)> {
        path.rsplit_once('/')
    }

    fn notify(&mut self, path: &str, event: impl Fn(String) -> ChildEvent) {
        let Some((parent, key)) = Self::split(path) else {
            return;
        };
        self.subscribers.retain(|(watched, publisher)| {
            if watched != parent {
                return !publisher.is_closed();
            }
            publisher.send(event(key.to_string()))
        });
    }

    fn put(&mut self, path: &str, value: Value) {
        let existed = self.values.insert(path.to_string(), value.clone()).is_some();
        self.notify(path, |key| {
            if existed {
                ChildEvent::Changed { key, value: value.clone() }
            } else {
                ChildEvent::Added { key, value: value.clone() }
            }
        });
    }

    fn remove(&mut self, path: &str) {
        if self.values.remove(path).is_some() {
            self.notify(path, |key| ChildEvent::Removed { key });
        }
    }
}

/// The shared coordination tree. Each client opens its own
/// [`MemoryCoordinationStore`] via [`connect`](Self::connect).
#[derive(Clone)]
pub struct MemoryCoordinationServer {
    state: Arc<Mutex<TreeState>>,
    cleanup_delay: Duration,
}

impl MemoryCoordinationServer {
    /// `cleanup_delay` is how long the server takes to notice a dropped
    /// connection before running that client's cleanups.
    pub fn new(cleanup_delay: Duration) -> Self {
        Self { state: Arc::default(), cleanup_delay }
    }

    pub fn connect(&self) -> MemoryCoordinationStore {
        let client = {
            let mut state = self.state.lock();
            state.next_client += 1;
            state.next_client
        };
        let (connection, _) = watch::channel(ConnectionState::Connected);
        MemoryCoordinationStore {
            server: self.clone(),
            client,
            connection: Arc::new(connection),
        }
    }

    pub fn value(&self, path: &str) -> Option<Value> {
        self.state.lock().values.get(path).cloned()
    }

    /// The value at `path`, or an object of its direct children when `path`
    /// is an interior node.
    fn read_tree(&self, path: &str) -> Option<Value> {
        let state = self.state.lock();
        if let Some(value) = state.values.get(path) {
            return Some(value.clone());
        }
        let prefix = format!("{path}/");
        let children: serde_json::Map<String, Value> = state
            .values
            .range(prefix.clone()..)
            .take_while(|(full, _)| full.starts_with(&prefix))
            .filter_map(|(full, value)| {
                let key = full.strip_prefix(&prefix)?;
                (!key.contains('/')).then(|| (key.to_string(), value.clone()))
            })
            .collect();
        (!children.is_empty()).then_some(Value::Object(children))
    }

    /// Live cleanup registrations for `path`, across all clients.
    pub fn registrations_for(&self, path: &str) -> usize {
        self.state.lock().cleanups.values().filter(|r| r.path == path).count()
    }

    /// Registrations ever made (including cancelled ones).
    pub fn registrations_made(&self) -> u64 {
        self.state.lock().registrations_made
    }

    /// Write directly, bypassing any client connection.
    pub fn put(&self, path: &str, value: Value) {
        self.state.lock().put(path, value);
    }

    fn registrations_of(&self, client: ClientId) -> Vec<CleanupId> {
        self.state
            .lock()
            .cleanups
            .iter()
            .filter(|(_, r)| r.client == client)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Run the given registrations that are still live.
    fn run_cleanups(&self, due: Vec<CleanupId>) {
        let mut state = self.state.lock();
        for id in due {
            if let Some(registration) = state.cleanups.remove(&id) {
                debug!(path = %registration.path, "disconnect cleanup");
                state.remove(&registration.path);
            }
        }
    }
}

/// One client's connection to a [`MemoryCoordinationServer`].
#[derive(Clone)]
pub struct MemoryCoordinationStore {
    server: MemoryCoordinationServer,
    client: ClientId,
    connection: Arc<watch::Sender<ConnectionState>>,
}

impl MemoryCoordinationStore {
    fn ensure_connected(&self) -> Result<(), BackendError> {
        match *self.connection.borrow() {
            ConnectionState::Connected => Ok(()),
            ConnectionState::Disconnected => {
                Err(BackendError::Unavailable("coordination store disconnected".into()))
            }
        }
    }

    /// Drop the transport abruptly. After its cleanup delay the server runs
    /// every registration this client had at the moment of disconnect, unless
    /// the client cancelled it in the meantime.
    pub fn disconnect(&self) {
        info!(client = self.client, "coordination transport dropped");
        self.connection.send_replace(ConnectionState::Disconnected);
        let server = self.server.clone();
        let due = server.registrations_of(self.client);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    tokio::time::sleep(server.cleanup_delay).await;
                    server.run_cleanups(due);
                });
            }
            Err(_) => server.run_cleanups(due),
        }
    }

    pub fn reconnect(&self) {
        info!(client = self.client, "coordination transport restored");
        self.connection.send_replace(ConnectionState::Connected);
    }

    pub fn server(&self) -> &MemoryCoordinationServer {
        &self.server
    }
}

#[async_trait]
impl CoordinationStore for MemoryCoordinationStore {
    async fn write(&self, path: &str, value: Value) -> Result<(), BackendError> {
        tokio::task::yield_now().await;
        self.ensure_connected()?;
        self.server.state.lock().put(path, value);
        Ok(())
    }

    async fn update(
        &self,
        path: &str,
        fields: serde_json::Map<String, Value>,
    ) -> Result<(), BackendError> {
        tokio::task::yield_now().await;
        self.ensure_connected()?;
        let mut state = self.server.state.lock();
        let mut merged = match state.values.get(path) {
            Some(Value::Object(existing)) => existing.clone(),
            _ => serde_json::Map::new(),
        };
        merged.extend(fields);
        state.put(path, Value::Object(merged));
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<(), BackendError> {
        tokio::task::yield_now().await;
        self.ensure_connected()?;
        self.server.state.lock().remove(path);
        Ok(())
    }

    async fn read(&self, path: &str) -> Result<Option<Value>, BackendError> {
        tokio::task::yield_now().await;
        self.ensure_connected()?;
        Ok(self.server.read_tree(path))
    }

    async fn subscribe(&self, path: &str) -> Result<Subscription<ChildEvent>, BackendError> {
        self.ensure_connected()?;
        let (publisher, subscription) = Subscription::pair();
        let mut state = self.server.state.lock();
        let prefix = format!("{path}/");
        for (full, value) in state.values.range(prefix.clone()..) {
            let Some(key) = full.strip_prefix(&prefix) else {
                break;
            };
            if !key.contains('/') {
                publisher.send(ChildEvent::Added { key: key.to_string(), value: value.clone() });
            }
        }
        state.subscribers.push((path.to_string(), publisher));
        Ok(subscription)
    }

    async fn register_disconnect_cleanup(&self, path: &str) -> Result<CleanupId, BackendError> {
        self.ensure_connected()?;
        let mut state = self.server.state.lock();
        state.next_cleanup += 1;
        state.registrations_made += 1;
        let id = CleanupId(state.next_cleanup);
        state.cleanups.insert(id, Registration { client: self.client, path: path.to_string() });
        trace!(?id, path, "cleanup registered");
        Ok(id)
    }

    async fn cancel_disconnect_cleanup(&self, id: CleanupId) -> Result<(), BackendError> {
        self.ensure_connected()?;
        self.server.state.lock().cleanups.remove(&id);
        Ok(())
    }

    fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.connection.subscribe()
    }
}

// ============================================================================
// Tool service
// ============================================================================

/// Replays one queued script per `execute` call.
#[derive(Clone, Default)]
pub struct ScriptedToolService {
    scripts: Arc<Mutex<VecDeque<Vec<ToolStreamItem>>>>,
    requests: Arc<Mutex<Vec<ToolRequest>>>,
    item_delay: Option<Duration>,
}

impl ScriptedToolService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep between stream items (lets tests abort mid-stream).
    pub fn with_item_delay(mut self, delay: Duration) -> Self {
        self.item_delay = Some(delay);
        self
    }

    pub fn push_script(&self, items: Vec<ToolStreamItem>) {
        self.scripts.lock().push_back(items);
    }

    pub fn requests(&self) -> Vec<ToolRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl ToolService for ScriptedToolService {
    async fn execute(
        &self,
        request: ToolRequest,
    ) -> Result<BoxStream<'static, ToolStreamItem>, BackendError> {
        self.requests.lock().push(request);
        let items = self
            .scripts
            .lock()
            .pop_front()
            .ok_or_else(|| BackendError::Unavailable("no scripted response".into()))?;
        let delay = self.item_delay;
        Ok(stream::iter(items)
            .then(move |item| async move {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                item
            })
            .boxed())
    }
}

#[cfg(test)]
mod tests {
    use pinwall_types::{Geometry, ObjectKind};
    use serde_json::json;

    use super::*;

    fn note(id: &str) -> BoardObject {
        BoardObject::new(id, ObjectKind::Note, Geometry::new(0.0, 0.0, 100.0, 100.0))
    }

    #[tokio::test]
    async fn test_document_store_stamps_revisions_and_notifies() {
        let store = MemoryDocumentStore::new();
        let board = BoardId::new("b");
        let mut feed = store.subscribe(&board).await.expect("subscribe");

        let Some(FeedNotification::Changes(initial)) = feed.recv().await else {
            panic!("expected initial snapshot");
        };
        assert!(initial.is_empty());

        let created = store.create(&board, note("n1")).await.expect("create");
        assert_eq!(created.revision, 1);
        let updated = store
            .update(&board, &created.id, ObjectPatch::position(5.0, 5.0))
            .await
            .expect("update");
        assert_eq!(updated.revision, 2);

        let Some(FeedNotification::Changes(first)) = feed.recv().await else {
            panic!("expected add")
        };
        assert_eq!(first[0].kind, ChangeKind::Added);
        let Some(FeedNotification::Changes(second)) = feed.recv().await else {
            panic!("expected modify")
        };
        assert_eq!(second[0].kind, ChangeKind::Modified);
        assert_eq!(second[0].object.geometry.x, 5.0);
    }

    #[tokio::test]
    async fn test_injected_failure_is_one_shot() {
        let store = MemoryDocumentStore::new();
        let board = BoardId::new("b");
        store.fail_write_at(2);
        store.create(&board, note("a")).await.expect("first write");
        assert!(store.create(&board, note("b")).await.is_err());
        store.create(&board, note("c")).await.expect("third write");
        assert_eq!(store.write_count(), 2);
        assert!(store.get(&board, &ObjectId::new("b")).is_none());
    }

    #[tokio::test]
    async fn test_batch_is_all_or_nothing() {
        let store = MemoryDocumentStore::new();
        let board = BoardId::new("b");
        store.seed(&board, note("a"));
        let result = store
            .commit_batch(
                &board,
                vec![
                    BatchWrite::Delete(ObjectId::new("a")),
                    BatchWrite::Update(ObjectId::new("missing"), ObjectPatch::confirm()),
                ],
            )
            .await;
        assert!(matches!(result, Err(BackendError::NotFound(_))));
        assert!(store.get(&board, &ObjectId::new("a")).is_some());
    }

    #[tokio::test]
    async fn test_coordination_children_and_merge() {
        let server = MemoryCoordinationServer::new(Duration::from_secs(60));
        let client = server.connect();
        client.write("boards/b/locks/x", json!({"holderId": "u1"})).await.expect("write");

        let mut sub = client.subscribe("boards/b/locks").await.expect("subscribe");
        assert_eq!(sub.recv().await.map(|e| e.key().to_string()), Some("x".to_string()));

        let mut fields = serde_json::Map::new();
        fields.insert("holderName".into(), json!("Ada"));
        client.update("boards/b/locks/x", fields).await.expect("update");
        let Some(ChildEvent::Changed { value, .. }) = sub.recv().await else {
            panic!("expected change")
        };
        assert_eq!(value, json!({"holderId": "u1", "holderName": "Ada"}));

        client.remove("boards/b/locks/x").await.expect("remove");
        assert_eq!(sub.recv().await, Some(ChildEvent::Removed { key: "x".into() }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_runs_cleanups_after_delay() {
        let server = MemoryCoordinationServer::new(Duration::from_secs(60));
        let client = server.connect();
        client.write("p/k", json!(1)).await.expect("write");
        client.register_disconnect_cleanup("p/k").await.expect("register");

        client.disconnect();
        assert!(client.write("p/other", json!(2)).await.is_err());
        tokio::time::sleep(Duration::from_secs(59)).await;
        assert!(server.value("p/k").is_some());
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(server.value("p/k").is_none());
        assert_eq!(server.registrations_for("p/k"), 0);
    }

    #[tokio::test]
    async fn test_scripted_tool_service_replays() {
        let service = ScriptedToolService::new();
        service.push_script(vec![ToolStreamItem::Completed { summary: "done".into() }]);
        let request = ToolRequest {
            command_id: pinwall_types::CommandId::new("cmd-1"),
            board_id: BoardId::new("b"),
            requester_id: pinwall_types::UserId::new("u"),
            prompt: "hi".into(),
            board_state: json!({}),
        };
        let stream = service.execute(request.clone()).await.expect("execute");
        let items: Vec<_> = stream.collect().await;
        assert_eq!(items.len(), 1);
        assert!(service.execute(request).await.is_err());
        assert_eq!(service.requests().len(), 2);
    }
}
