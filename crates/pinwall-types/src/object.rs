//! Board objects, the persisted unit of the shared canvas.
//!
//! The serde shape of [`BoardObject`] is the storage contract shared with
//! existing clients: camelCase field names, geometry and style flattened to the
//! top level, `type` as the kind discriminator, and the agent attribution
//! fields spelled `isAIGenerated` / `isAIPending` / `aiCommandId`.
//!
//! # Relations
//!
//! - `parent_frame` is a weak reference to a frame. Frames never nest, so a
//!   frame's own `parent_frame` is always `None` ([`BoardObject::normalize`]).
//! - `connected_to` on connectors holds exactly two endpoint ids. Endpoints can
//!   dangle after a delete; cleaning them up is the mutation layer's job.

use std::cmp::Ordering;

use serde::{Deserialize, Deserializer, Serialize};
use strum::{AsRefStr, Display, EnumIter, EnumString};

use crate::geometry::Rect;
use crate::ids::{CommandId, ObjectId, UserId};

/// Kind of board object.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
    EnumIter,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ObjectKind {
    Note,
    Rectangle,
    Circle,
    Frame,
    Connector,
    Line,
    Text,
    Legend,
}

impl ObjectKind {
    /// Kinds whose geometry is a path between two points rather than a box.
    pub fn is_linear(&self) -> bool {
        matches!(self, Self::Connector | Self::Line)
    }
}

/// Stroke style for an object's border.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum BorderStyle {
    #[default]
    Solid,
    Dashed,
    Dotted,
    None,
}

/// Position, extent, and rotation (degrees) in board coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Geometry {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    #[serde(default)]
    pub rotation: f64,
}

impl Geometry {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self { x, y, width, height, rotation: 0.0 }
    }

    /// Axis-aligned bounds, expanded to cover rotation.
    ///
    /// `rotation` is clockwise degrees in board coordinates. Clients disagree on
    /// the pivot (the box center or the `(x, y)` origin), so rotated bounds
    /// enclose the box turned about either.
    pub fn bounds(&self) -> Rect {
        let rect = Rect::from_xywh(self.x, self.y, self.width, self.height);
        if self.rotation == 0.0 || !self.rotation.is_finite() {
            return rect;
        }
        let about_center = rect.rotated_bounds(self.rotation);
        let about_origin = rect.rotated_about(self.rotation, (self.x, self.y));
        about_center.union(&about_origin)
    }
}

/// Visual style fields the engine carries but never interprets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Style {
    #[serde(default = "default_color")]
    pub color: String,
    #[serde(default)]
    pub border_style: BorderStyle,
    #[serde(default = "default_thickness")]
    pub thickness: f64,
}

fn default_color() -> String {
    "#fef08a".to_string()
}

fn default_thickness() -> f64 {
    2.0
}

impl Default for Style {
    fn default() -> Self {
        Self {
            color: default_color(),
            border_style: BorderStyle::default(),
            thickness: default_thickness(),
        }
    }
}

/// A single object on the board.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoardObject {
    pub id: ObjectId,
    #[serde(rename = "type")]
    pub kind: ObjectKind,
    #[serde(flatten)]
    pub geometry: Geometry,
    #[serde(flatten)]
    pub style: Style,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub z_index: i64,
    /// Unix millis; tiebreak for equal `z_index`.
    #[serde(default)]
    pub created_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_frame: Option<ObjectId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub connected_to: Vec<ObjectId>,
    #[serde(default, rename = "isAIGenerated")]
    pub is_ai_generated: bool,
    #[serde(default, rename = "isAIPending")]
    pub is_ai_pending: bool,
    #[serde(default, rename = "aiCommandId", skip_serializing_if = "Option::is_none")]
    pub ai_command_id: Option<CommandId>,
    /// Commit counter assigned by the durable store. Zero means "never
    /// committed" (a local optimistic object).
    #[serde(default)]
    pub revision: u64,
}

/// Errors from structural validation of an object.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ObjectError {
    #[error("connector {0} must have exactly two endpoints, has {1}")]
    ConnectorEndpoints(ObjectId, usize),
    #[error("object {0} has non-finite geometry")]
    NonFiniteGeometry(ObjectId),
    #[error("object {0} cannot be its own parent frame")]
    SelfParent(ObjectId),
}

impl BoardObject {
    /// Create an object with default style and no relations.
    pub fn new(id: impl Into<ObjectId>, kind: ObjectKind, geometry: Geometry) -> Self {
        Self {
            id: id.into(),
            kind,
            geometry,
            style: Style::default(),
            text: String::new(),
            z_index: 0,
            created_at: crate::now_millis(),
            created_by: None,
            parent_frame: None,
            connected_to: Vec::new(),
            is_ai_generated: false,
            is_ai_pending: false,
            ai_command_id: None,
            revision: 0,
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    pub fn with_parent_frame(mut self, frame: impl Into<ObjectId>) -> Self {
        self.parent_frame = Some(frame.into());
        self
    }

    pub fn with_z_index(mut self, z_index: i64) -> Self {
        self.z_index = z_index;
        self
    }

    /// Build a connector between two endpoints.
    pub fn connector(id: impl Into<ObjectId>, from: ObjectId, to: ObjectId) -> Self {
        let mut obj = Self::new(id, ObjectKind::Connector, Geometry::new(0.0, 0.0, 0.0, 0.0));
        obj.connected_to = vec![from, to];
        obj
    }

    /// Axis-aligned bounds used for indexing and culling.
    pub fn bounds(&self) -> Rect {
        self.geometry.bounds()
    }

    /// Enforce invariants that must hold in the canonical map.
    ///
    /// Returns `true` if anything changed.
    pub fn normalize(&mut self) -> bool {
        let mut changed = false;
        if self.kind == ObjectKind::Frame && self.parent_frame.is_some() {
            self.parent_frame = None;
            changed = true;
        }
        if self.parent_frame.as_ref() == Some(&self.id) {
            self.parent_frame = None;
            changed = true;
        }
        changed
    }

    /// Structural validation for writes that originate in this engine.
    pub fn validate(&self) -> Result<(), ObjectError> {
        let g = &self.geometry;
        if ![g.x, g.y, g.width, g.height, g.rotation].iter().all(|v| v.is_finite()) {
            return Err(ObjectError::NonFiniteGeometry(self.id.clone()));
        }
        if self.kind == ObjectKind::Connector && self.connected_to.len() != 2 {
            return Err(ObjectError::ConnectorEndpoints(self.id.clone(), self.connected_to.len()));
        }
        if self.parent_frame.as_ref() == Some(&self.id) {
            return Err(ObjectError::SelfParent(self.id.clone()));
        }
        Ok(())
    }

    /// Whether this object is still awaiting confirmation of `command`.
    pub fn is_pending_for(&self, command: &CommandId) -> bool {
        self.is_ai_pending && self.ai_command_id.as_ref() == Some(command)
    }

    /// Tag as an in-flight agent write.
    pub fn tag_pending(&mut self, command: &CommandId) {
        self.is_ai_generated = true;
        self.is_ai_pending = true;
        self.ai_command_id = Some(command.clone());
    }

    /// References this object holds to `other` (as endpoint or parent).
    pub fn references(&self, other: &ObjectId) -> bool {
        self.parent_frame.as_ref() == Some(other) || self.connected_to.iter().any(|id| id == other)
    }
}

/// Paint order: `z_index` ascending, then `created_at`, then id for a total
/// order.
pub fn z_order(a: &BoardObject, b: &BoardObject) -> Ordering {
    a.z_index
        .cmp(&b.z_index)
        .then(a.created_at.cmp(&b.created_at))
        .then_with(|| a.id.cmp(&b.id))
}

// ============================================================================
// Partial updates
// ============================================================================

/// Field-level patch, as sent to the durable store's `update`.
///
/// `None` leaves a field untouched. `parent_frame` and `ai_command_id` are
/// double options so a patch can clear them (`Some(None)` serializes as
/// `null`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub border_style: Option<BorderStyle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thickness: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub z_index: Option<i64>,
    #[serde(default, deserialize_with = "double_option", skip_serializing_if = "Option::is_none")]
    pub parent_frame: Option<Option<ObjectId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connected_to: Option<Vec<ObjectId>>,
    #[serde(default, rename = "isAIGenerated", skip_serializing_if = "Option::is_none")]
    pub is_ai_generated: Option<bool>,
    #[serde(default, rename = "isAIPending", skip_serializing_if = "Option::is_none")]
    pub is_ai_pending: Option<bool>,
    #[serde(
        default,
        rename = "aiCommandId",
        deserialize_with = "double_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub ai_command_id: Option<Option<CommandId>>,
}

/// Distinguish an absent field (`None`) from an explicit `null` (`Some(None)`).
fn double_option<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

impl ObjectPatch {
    /// Patch that moves an object.
    pub fn position(x: f64, y: f64) -> Self {
        Self { x: Some(x), y: Some(y), ..Self::default() }
    }

    /// Patch that replaces the full geometry.
    pub fn geometry(g: &Geometry) -> Self {
        Self {
            x: Some(g.x),
            y: Some(g.y),
            width: Some(g.width),
            height: Some(g.height),
            rotation: Some(g.rotation),
            ..Self::default()
        }
    }

    /// Patch that tags a write as an in-flight agent edit.
    pub fn pending(command: &CommandId) -> Self {
        Self {
            is_ai_generated: Some(true),
            is_ai_pending: Some(true),
            ai_command_id: Some(Some(command.clone())),
            ..Self::default()
        }
    }

    /// Patch that confirms a pending agent write.
    pub fn confirm() -> Self {
        Self { is_ai_pending: Some(false), ..Self::default() }
    }

    /// Merge `other` over `self`; fields set in `other` win.
    pub fn merge(mut self, other: ObjectPatch) -> Self {
        macro_rules! take {
            ($($field:ident),*) => {
                $(
                    if other.$field.is_some() {
                        self.$field = other.$field;
                    }
                )*
            };
        }
        take!(
            x, y, width, height, rotation, color, border_style, thickness, text, z_index,
            parent_frame, connected_to, is_ai_generated, is_ai_pending, ai_command_id
        );
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Whether applying this patch can change an object's bounds.
    pub fn touches_geometry(&self) -> bool {
        self.x.is_some()
            || self.y.is_some()
            || self.width.is_some()
            || self.height.is_some()
            || self.rotation.is_some()
    }

    /// Apply the patch in place.
    pub fn apply_to(&self, obj: &mut BoardObject) {
        let g = &mut obj.geometry;
        if let Some(v) = self.x {
            g.x = v;
        }
        if let Some(v) = self.y {
            g.y = v;
        }
        if let Some(v) = self.width {
            g.width = v;
        }
        if let Some(v) = self.height {
            g.height = v;
        }
        if let Some(v) = self.rotation {
            g.rotation = v;
        }
        if let Some(v) = &self.color {
            obj.style.color = v.clone();
        }
        if let Some(v) = self.border_style {
            obj.style.border_style = v;
        }
        if let Some(v) = self.thickness {
            obj.style.thickness = v;
        }
        if let Some(v) = &self.text {
            obj.text = v.clone();
        }
        if let Some(v) = self.z_index {
            obj.z_index = v;
        }
        if let Some(v) = &self.parent_frame {
            obj.parent_frame = v.clone();
        }
        if let Some(v) = &self.connected_to {
            obj.connected_to = v.clone();
        }
        if let Some(v) = self.is_ai_generated {
            obj.is_ai_generated = v;
        }
        if let Some(v) = self.is_ai_pending {
            obj.is_ai_pending = v;
        }
        if let Some(v) = &self.ai_command_id {
            obj.ai_command_id = v.clone();
        }
    }
}
