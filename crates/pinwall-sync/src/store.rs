//! Canonical in-memory object store for one board.
//!
//! The store is the single writer of the object map. It merges two kinds of
//! writes:
//!
//! - **Local** writes (optimistic edits, gesture updates) always apply.
//! - **Remote** writes (change-feed events) apply last-write-wins by
//!   `revision`: a lower revision than the stored one is dropped, an equal one
//!   replaces. Remote upserts for an object that is being edited locally are
//!   buffered (highest revision kept) and applied when editing ends.
//!
//! The spatial index is patched under the same write lock as the map, so
//! readers never see one without the other. Every mutating call emits at most
//! one [`StoreEvent`].

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;
use pinwall_types::{BoardObject, CommandId, ObjectId, Rect, z_order};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::constants::{STORE_EVENT_CAPACITY, VIEWPORT_PADDING};
use crate::spatial::SpatialIndex;

/// Origin of a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpSource {
    /// Produced by this client (gesture, optimistic edit, agent step).
    #[default]
    Local,
    /// Delivered by the change feed.
    Remote,
}

/// What changed in a store mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreChange {
    /// The whole map was replaced.
    Reset { count: usize },
    Upserted { ids: Vec<ObjectId>, source: OpSource },
    Removed { ids: Vec<ObjectId>, source: OpSource },
    Loaded,
}

/// Change notification, tagged with the store version after the change.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreEvent {
    pub version: u64,
    pub change: StoreChange,
}

#[derive(Default)]
struct Inner {
    objects: HashMap<ObjectId, BoardObject>,
    index: SpatialIndex,
    editing: HashSet<ObjectId>,
    buffered: HashMap<ObjectId, BoardObject>,
    loaded: bool,
    version: u64,
}

impl Inner {
    /// Apply one upsert. Returns `true` if the map changed.
    fn upsert(&mut self, mut object: BoardObject, source: OpSource) -> bool {
        object.normalize();
        if source == OpSource::Remote {
            if self.editing.contains(&object.id) {
                trace!(id = %object.id, revision = object.revision, "remote write buffered");
                self.buffer(object);
                return false;
            }
            if let Some(current) = self.objects.get(&object.id) {
                if object.revision < current.revision {
                    trace!(
                        id = %object.id,
                        incoming = object.revision,
                        stored = current.revision,
                        "stale remote write dropped"
                    );
                    return false;
                }
            }
        }
        self.put(object)
    }

    fn buffer(&mut self, object: BoardObject) {
        let newer = self
            .buffered
            .get(&object.id)
            .is_none_or(|held| object.revision >= held.revision);
        if newer {
            self.buffered.insert(object.id.clone(), object);
        }
    }

    fn put(&mut self, object: BoardObject) -> bool {
        let bounds = object.bounds();
        match self.objects.get(&object.id) {
            Some(current) if *current == object => return false,
            Some(current) if current.bounds() == bounds => {}
            _ => self.index.insert(object.id.clone(), bounds),
        }
        self.objects.insert(object.id.clone(), object);
        true
    }

    fn remove(&mut self, id: &ObjectId) -> bool {
        self.buffered.remove(id);
        self.index.remove(id);
        self.objects.remove(id).is_some()
    }

    fn bump(&mut self) -> u64 {
        self.version += 1;
        self.version
    }
}

/// The canonical object map plus its spatial index.
pub struct ObjectStore {
    inner: RwLock<Inner>,
    events: broadcast::Sender<StoreEvent>,
    viewport_padding: f64,
}

impl Default for ObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectStore {
    pub fn new() -> Self {
        Self::with_viewport_padding(VIEWPORT_PADDING)
    }

    pub fn with_viewport_padding(viewport_padding: f64) -> Self {
        let (events, _) = broadcast::channel(STORE_EVENT_CAPACITY);
        Self { inner: RwLock::new(Inner::default()), events, viewport_padding }
    }

    /// Subscribe to change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    fn emit(&self, version: u64, change: StoreChange) {
        // No receivers is fine.
        let _ = self.events.send(StoreEvent { version, change });
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    /// Replace the whole map (initial load). Objects being edited locally
    /// keep their local value; the incoming value is buffered for them.
    pub fn set_all(&self, objects: Vec<BoardObject>) {
        let (version, count) = {
            let mut inner = self.inner.write();
            let mut next: HashMap<ObjectId, BoardObject> = HashMap::with_capacity(objects.len());
            let mut incoming_buffered = Vec::new();
            for mut object in objects {
                object.normalize();
                if inner.editing.contains(&object.id) {
                    incoming_buffered.push(object);
                } else {
                    next.insert(object.id.clone(), object);
                }
            }
            let editing: Vec<ObjectId> = inner.editing.iter().cloned().collect();
            for id in editing {
                if let Some(local) = inner.objects.remove(&id) {
                    next.insert(id, local);
                }
            }
            inner.buffered.retain(|id, _| next.contains_key(id));
            for object in incoming_buffered {
                inner.buffer(object);
            }

            inner.index.load(next.values().map(|o| (o.id.clone(), o.bounds())));
            inner.objects = next;
            (inner.bump(), inner.objects.len())
        };
        debug!(count, version, "store reset");
        self.emit(version, StoreChange::Reset { count });
    }

    pub fn upsert(&self, object: BoardObject, source: OpSource) -> bool {
        !self.batch_upsert(vec![object], source).is_empty()
    }

    /// Apply several upserts under one lock. Returns the ids that changed;
    /// emits one event if any did.
    pub fn batch_upsert(&self, objects: Vec<BoardObject>, source: OpSource) -> Vec<ObjectId> {
        let (version, ids) = {
            let mut inner = self.inner.write();
            let ids: Vec<ObjectId> = objects
                .into_iter()
                .filter_map(|o| {
                    let id = o.id.clone();
                    inner.upsert(o, source).then_some(id)
                })
                .collect();
            if ids.is_empty() {
                return ids;
            }
            (inner.bump(), ids)
        };
        self.emit(version, StoreChange::Upserted { ids: ids.clone(), source });
        ids
    }

    pub fn remove(&self, id: &ObjectId, source: OpSource) -> bool {
        !self.batch_remove(std::slice::from_ref(id), source).is_empty()
    }

    /// Remove several objects. Removes apply even to objects being edited
    /// locally, discarding any buffered remote value.
    pub fn batch_remove(&self, ids: &[ObjectId], source: OpSource) -> Vec<ObjectId> {
        let (version, removed) = {
            let mut inner = self.inner.write();
            let removed: Vec<ObjectId> =
                ids.iter().filter(|id| inner.remove(id)).cloned().collect();
            if removed.is_empty() {
                return removed;
            }
            (inner.bump(), removed)
        };
        self.emit(version, StoreChange::Removed { ids: removed.clone(), source });
        removed
    }

    /// Start suppressing remote writes for `id`.
    pub fn mark_locally_editing(&self, id: &ObjectId) {
        self.inner.write().editing.insert(id.clone());
    }

    /// Stop suppressing remote writes for `id` and apply any buffered value.
    pub fn clear_locally_editing(&self, id: &ObjectId) -> bool {
        let applied = {
            let mut inner = self.inner.write();
            inner.editing.remove(id);
            let buffered = inner.buffered.remove(id);
            match buffered {
                Some(object) => inner.upsert(object, OpSource::Remote).then(|| inner.bump()),
                None => None,
            }
        };
        match applied {
            Some(version) => {
                debug!(%id, "buffered remote write applied");
                let change =
                    StoreChange::Upserted { ids: vec![id.clone()], source: OpSource::Remote };
                self.emit(version, change);
                true
            }
            None => false,
        }
    }

    pub fn mark_loaded(&self) {
        let version = {
            let mut inner = self.inner.write();
            if inner.loaded {
                return;
            }
            inner.loaded = true;
            inner.bump()
        };
        self.emit(version, StoreChange::Loaded);
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn get(&self, id: &ObjectId) -> Option<BoardObject> {
        self.inner.read().objects.get(id).cloned()
    }

    pub fn contains(&self, id: &ObjectId) -> bool {
        self.inner.read().objects.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.inner.read().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().objects.is_empty()
    }

    pub fn is_loaded(&self) -> bool {
        self.inner.read().loaded
    }

    /// Bumped on every applied mutation.
    pub fn version(&self) -> u64 {
        self.inner.read().version
    }

    pub fn is_locally_editing(&self, id: &ObjectId) -> bool {
        self.inner.read().editing.contains(id)
    }

    /// Remote value held back while `id` is being edited.
    pub fn buffered(&self, id: &ObjectId) -> Option<BoardObject> {
        self.inner.read().buffered.get(id).cloned()
    }

    /// All objects in paint order.
    pub fn all(&self) -> Vec<BoardObject> {
        let mut objects: Vec<BoardObject> = self.inner.read().objects.values().cloned().collect();
        objects.sort_by(z_order);
        objects
    }

    /// Objects intersecting `viewport` grown by the store's padding, in
    /// paint order.
    pub fn query_viewport(&self, viewport: &Rect) -> Vec<BoardObject> {
        let area = viewport.padded(self.viewport_padding);
        let inner = self.inner.read();
        let mut hits: Vec<BoardObject> = inner
            .index
            .search(&area)
            .into_iter()
            .filter_map(|id| inner.objects.get(&id))
            .filter(|o| o.bounds().intersects(&area))
            .cloned()
            .collect();
        drop(inner);
        hits.sort_by(z_order);
        hits
    }

    /// Every object attributed to `command`, pending or confirmed.
    pub fn objects_with_command(&self, command: &CommandId) -> Vec<BoardObject> {
        self.inner
            .read()
            .objects
            .values()
            .filter(|o| o.ai_command_id.as_ref() == Some(command))
            .cloned()
            .collect()
    }

    /// Objects holding a reference (parent frame or connector endpoint) to `id`.
    pub fn referencing(&self, id: &ObjectId) -> Vec<BoardObject> {
        self.inner
            .read()
            .objects
            .values()
            .filter(|o| o.id != *id && o.references(id))
            .cloned()
            .collect()
    }

    /// A z-index above every current object.
    pub fn next_z_index(&self) -> i64 {
        self.inner.read().objects.values().map(|o| o.z_index).max().map_or(0, |z| z + 1)
    }
}

#[cfg(test)]
mod tests {
    use pinwall_types::{Geometry, ObjectKind, ObjectPatch};
    use proptest::prelude::*;

    use super::*;

    fn note(id: &str, x: f64, revision: u64) -> BoardObject {
        let mut obj = BoardObject::new(id, ObjectKind::Note, Geometry::new(x, 0.0, 100.0, 100.0));
        obj.created_at = 1;
        obj.revision = revision;
        obj
    }

    #[test]
    fn test_remote_lww_by_revision() {
        let store = ObjectStore::new();
        assert!(store.upsert(note("a", 10.0, 5), OpSource::Remote));
        assert!(!store.upsert(note("a", 99.0, 4), OpSource::Remote));
        assert_eq!(store.get(&ObjectId::new("a")).map(|o| o.geometry.x), Some(10.0));

        assert!(store.upsert(note("a", 20.0, 5), OpSource::Remote));
        assert_eq!(store.get(&ObjectId::new("a")).map(|o| o.geometry.x), Some(20.0));

        // Local writes always apply.
        assert!(store.upsert(note("a", 30.0, 1), OpSource::Local));
        assert_eq!(store.get(&ObjectId::new("a")).map(|o| o.geometry.x), Some(30.0));
    }

    #[test]
    fn test_echo_suppression_buffers_latest_revision() {
        let store = ObjectStore::new();
        let id = ObjectId::new("a");
        store.upsert(note("a", 0.0, 1), OpSource::Remote);
        store.mark_locally_editing(&id);

        store.upsert(note("a", 50.0, 1), OpSource::Local);
        assert!(!store.upsert(note("a", 300.0, 3), OpSource::Remote));
        assert!(!store.upsert(note("a", 200.0, 2), OpSource::Remote));
        assert_eq!(store.get(&id).map(|o| o.geometry.x), Some(50.0));
        assert_eq!(store.buffered(&id).map(|o| o.revision), Some(3));

        assert!(store.clear_locally_editing(&id));
        assert_eq!(store.get(&id).map(|o| o.geometry.x), Some(300.0));
        assert!(store.buffered(&id).is_none());
    }

    #[test]
    fn test_remote_remove_while_editing_discards_buffer() {
        let store = ObjectStore::new();
        let id = ObjectId::new("a");
        store.upsert(note("a", 0.0, 1), OpSource::Remote);
        store.mark_locally_editing(&id);
        store.upsert(note("a", 10.0, 2), OpSource::Remote);

        assert!(store.remove(&id, OpSource::Remote));
        assert!(store.get(&id).is_none());
        assert!(!store.clear_locally_editing(&id));
        assert!(store.get(&id).is_none());
    }

    #[test]
    fn test_one_event_per_batch() {
        let store = ObjectStore::new();
        let mut rx = store.subscribe();
        let ids = store.batch_upsert(
            vec![note("a", 0.0, 1), note("b", 0.0, 1), note("c", 0.0, 1)],
            OpSource::Remote,
        );
        assert_eq!(ids.len(), 3);
        let event = rx.try_recv().expect("one event");
        assert!(matches!(event.change, StoreChange::Upserted { ref ids, .. } if ids.len() == 3));
        assert!(rx.try_recv().is_err());

        // A batch that changes nothing emits nothing.
        store.batch_upsert(vec![note("a", 0.0, 1)], OpSource::Remote);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_frame_parent_cleared_on_write() {
        let store = ObjectStore::new();
        let frame = BoardObject::new("f", ObjectKind::Frame, Geometry::new(0.0, 0.0, 10.0, 10.0))
            .with_parent_frame("other");
        store.upsert(frame, OpSource::Remote);
        assert_eq!(store.get(&ObjectId::new("f")).and_then(|o| o.parent_frame), None);
    }

    #[test]
    fn test_viewport_query_padding_and_order() {
        let store = ObjectStore::new();
        let square = |id: &str, at: f64| {
            BoardObject::new(id, ObjectKind::Note, Geometry::new(at, at, 50.0, 50.0))
        };
        let mut near = square("near", 1190.0);
        near.z_index = 2;
        let far = square("far", 1350.0);
        let mut inside = square("inside", 10.0);
        inside.z_index = 1;
        store.batch_upsert(vec![near, far, inside], OpSource::Remote);

        let hits: Vec<String> = store
            .query_viewport(&Rect::from_xywh(0.0, 0.0, 1000.0, 1000.0))
            .into_iter()
            .map(|o| o.id.into_inner())
            .collect();
        assert_eq!(hits, vec!["inside", "near"]);
    }

    #[test]
    fn test_viewport_finds_rotated_object_under_either_pivot() {
        let store = ObjectStore::with_viewport_padding(0.0);
        let mut bar =
            BoardObject::new("bar", ObjectKind::Rectangle, Geometry::new(0.0, 0.0, 100.0, 20.0));
        bar.geometry.rotation = 90.0;
        store.upsert(bar, OpSource::Remote);

        // Turned about its (x, y) origin the bar sweeps x in -20..0, y in 0..100.
        assert_eq!(store.query_viewport(&Rect::from_xywh(-15.0, 80.0, 5.0, 5.0)).len(), 1);
        // Turned about its center it spans x in 40..60, y in -40..60.
        assert_eq!(store.query_viewport(&Rect::from_xywh(48.0, -35.0, 4.0, 4.0)).len(), 1);
        assert!(store.query_viewport(&Rect::from_xywh(200.0, 200.0, 10.0, 10.0)).is_empty());
    }

    #[test]
    fn test_set_all_keeps_editing_object() {
        let store = ObjectStore::new();
        let id = ObjectId::new("a");
        store.upsert(note("a", 0.0, 1), OpSource::Remote);
        store.mark_locally_editing(&id);
        store.upsert(note("a", 42.0, 1), OpSource::Local);

        store.set_all(vec![note("a", 7.0, 2), note("b", 0.0, 1)]);
        assert_eq!(store.len(), 2);
        assert_eq!(store.get(&id).map(|o| o.geometry.x), Some(42.0));
        assert_eq!(store.buffered(&id).map(|o| o.geometry.x), Some(7.0));
    }

    #[test]
    fn test_content_change_does_not_touch_index() {
        let store = ObjectStore::new();
        store.upsert(note("a", 0.0, 1), OpSource::Remote);
        let mut changed = note("a", 0.0, 2);
        ObjectPatch { text: Some("hello".into()), ..Default::default() }.apply_to(&mut changed);
        assert!(store.upsert(changed, OpSource::Remote));
        let hits = store.query_viewport(&Rect::from_xywh(0.0, 0.0, 10.0, 10.0));
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].text, "hello");
    }

    proptest! {
        #[test]
        fn prop_replaying_remote_events_is_idempotent(
            events in prop::collection::vec((0u8..4, -500.0..500.0f64, 0u64..10), 1..40)
        ) {
            let once = ObjectStore::new();
            let twice = ObjectStore::new();
            for (slot, x, revision) in &events {
                let obj = note(&format!("o{slot}"), *x, *revision);
                once.upsert(obj.clone(), OpSource::Remote);
                twice.upsert(obj.clone(), OpSource::Remote);
                twice.upsert(obj, OpSource::Remote);
            }
            prop_assert_eq!(once.all(), twice.all());
        }
    }
}
