//! Bounding-box index over board objects.
//!
//! A derived, non-authoritative mirror of the object store. Searches return a
//! conservative superset of the objects whose bounds intersect the query;
//! callers run the exact test afterwards. The index lives behind the store's
//! write lock and is never read mid-rebuild.

use std::collections::{HashMap, HashSet};

use pinwall_types::{ObjectId, Rect};
use rstar::primitives::{GeomWithData, Rectangle};
use rstar::{AABB, RTree};

type Entry = GeomWithData<Rectangle<[f64; 2]>, ObjectId>;

fn entry(id: ObjectId, rect: &Rect) -> Entry {
    let rectangle = Rectangle::from_corners([rect.min_x, rect.min_y], [rect.max_x, rect.max_y]);
    GeomWithData::new(rectangle, id)
}

fn is_finite(rect: &Rect) -> bool {
    [rect.min_x, rect.min_y, rect.max_x, rect.max_y].iter().all(|v| v.is_finite())
}

/// R-tree keyed by object id.
#[derive(Default)]
pub struct SpatialIndex {
    tree: RTree<Entry>,
    bounds: HashMap<ObjectId, Rect>,
    /// Objects whose bounds cannot be indexed (non-finite). Always returned as
    /// candidates so searches never miss them.
    unindexed: HashSet<ObjectId>,
}

impl SpatialIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from scratch.
    pub fn load(&mut self, items: impl IntoIterator<Item = (ObjectId, Rect)>) {
        self.bounds.clear();
        self.unindexed.clear();
        let mut entries = Vec::new();
        for (id, rect) in items {
            if is_finite(&rect) {
                entries.push(entry(id.clone(), &rect));
            } else {
                self.unindexed.insert(id.clone());
            }
            self.bounds.insert(id, rect);
        }
        self.tree = RTree::bulk_load(entries);
    }

    /// Insert or move an object.
    pub fn insert(&mut self, id: ObjectId, rect: Rect) {
        if self.bounds.get(&id) == Some(&rect) {
            return;
        }
        self.remove(&id);
        if is_finite(&rect) {
            self.tree.insert(entry(id.clone(), &rect));
        } else {
            self.unindexed.insert(id.clone());
        }
        self.bounds.insert(id, rect);
    }

    pub fn remove(&mut self, id: &ObjectId) -> bool {
        let Some(rect) = self.bounds.remove(id) else {
            return false;
        };
        if !self.unindexed.remove(id) {
            self.tree.remove(&entry(id.clone(), &rect));
        }
        true
    }

    /// Ids whose indexed bounds may intersect `rect`.
    pub fn search(&self, rect: &Rect) -> Vec<ObjectId> {
        let envelope = AABB::from_corners([rect.min_x, rect.min_y], [rect.max_x, rect.max_y]);
        self.tree
            .locate_in_envelope_intersecting(&envelope)
            .map(|e| e.data.clone())
            .chain(self.unindexed.iter().cloned())
            .collect()
    }

    pub fn bounds_of(&self, id: &ObjectId) -> Option<Rect> {
        self.bounds.get(id).copied()
    }

    pub fn len(&self) -> usize {
        self.bounds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bounds.is_empty()
    }

    pub fn clear(&mut self) {
        self.load(std::iter::empty());
    }
}
