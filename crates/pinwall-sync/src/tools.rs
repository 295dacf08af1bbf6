//! Agent tool operations and the geometry policy applied to them.
//!
//! Tool calls arrive from the tool-execution service as JSON tagged by `op`:
//!
//! ```json
//! {"op": "create", "ref": "f1", "type": "frame", "x": 0, "y": 0, "width": 800, "height": 600}
//! {"op": "update", "target": "f1", "text": "Ideas"}
//! {"op": "arrange", "targets": ["n1", "n2", "n3"], "columns": 3}
//! ```
//!
//! A `target` names either a `ref` from an earlier step of the same command or
//! an existing object id. Proposed geometry is clamped, never rejected; each
//! clamp is reported as a [`ClampReport`].

use pinwall_types::{BoardObject, Geometry, ObjectId, ObjectKind};
use serde::{Deserialize, Serialize};

use crate::config::SyncConfig;

/// One operation proposed by the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ToolCall {
    Create(CreateSpec),
    Update(UpdateSpec),
    Delete { target: String },
    Arrange(ArrangeSpec),
    QueryState,
}

impl ToolCall {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Create(_) => "create",
            Self::Update(_) => "update",
            Self::Delete { .. } => "delete",
            Self::Arrange(_) => "arrange",
            Self::QueryState => "query_state",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSpec {
    /// Name later steps use to target the created object.
    #[serde(default, rename = "ref", skip_serializing_if = "Option::is_none")]
    pub ref_key: Option<String>,
    #[serde(rename = "type")]
    pub kind: ObjectKind,
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
    #[serde(default = "default_extent")]
    pub width: f64,
    #[serde(default = "default_extent")]
    pub height: f64,
    #[serde(default)]
    pub rotation: f64,
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_frame: Option<String>,
    /// Connector endpoints (targets).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub connect: Vec<String>,
}

fn default_extent() -> f64 {
    200.0
}

impl CreateSpec {
    pub fn new(kind: ObjectKind, x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            ref_key: None,
            kind,
            x,
            y,
            width,
            height,
            rotation: 0.0,
            text: String::new(),
            color: None,
            parent_frame: None,
            connect: Vec::new(),
        }
    }

    pub fn with_ref(mut self, key: impl Into<String>) -> Self {
        self.ref_key = Some(key.into());
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    pub fn in_frame(mut self, target: impl Into<String>) -> Self {
        self.parent_frame = Some(target.into());
        self
    }

    pub fn geometry(&self) -> Geometry {
        Geometry {
            x: self.x,
            y: self.y,
            width: self.width,
            height: self.height,
            rotation: self.rotation,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateSpec {
    pub target: String,
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
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_frame: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArrangeSpec {
    pub targets: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub columns: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_x: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_y: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gap: Option<f64>,
}

// ============================================================================
// Clamping
// ============================================================================

/// A proposed value that was replaced to fit the board's bounds.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClampReport {
    pub field: &'static str,
    pub proposed: f64,
    pub applied: f64,
}

fn clamp_field(
    field: &'static str,
    value: &mut f64,
    min: f64,
    max: f64,
    fallback: f64,
    out: &mut Vec<ClampReport>,
) {
    let applied = if value.is_finite() { value.clamp(min, max) } else { fallback };
    if applied != *value {
        out.push(ClampReport { field, proposed: *value, applied });
        *value = applied;
    }
}

/// Clamp agent-proposed geometry to the board. Linear kinds keep the sign of
/// their extents (lines may be drawn up or left).
pub fn clamp_geometry(
    kind: ObjectKind,
    geometry: &mut Geometry,
    config: &SyncConfig,
) -> Vec<ClampReport> {
    let mut reports = Vec::new();
    let extent = config.board_extent;
    clamp_field("x", &mut geometry.x, -extent, extent, 0.0, &mut reports);
    clamp_field("y", &mut geometry.y, -extent, extent, 0.0, &mut reports);

    if kind.is_linear() {
        let max = config.max_object_size;
        clamp_field("width", &mut geometry.width, -max, max, 0.0, &mut reports);
        clamp_field("height", &mut geometry.height, -max, max, 0.0, &mut reports);
    } else {
        let (min, max) = (config.min_object_size, config.max_object_size);
        clamp_field("width", &mut geometry.width, min, max, min, &mut reports);
        clamp_field("height", &mut geometry.height, min, max, min, &mut reports);
    }

    if !geometry.rotation.is_finite() {
        reports.push(ClampReport { field: "rotation", proposed: geometry.rotation, applied: 0.0 });
        geometry.rotation = 0.0;
    } else if !(0.0..360.0).contains(&geometry.rotation) {
        let applied = geometry.rotation.rem_euclid(360.0);
        reports.push(ClampReport { field: "rotation", proposed: geometry.rotation, applied });
        geometry.rotation = applied;
    }
    reports
}

// ============================================================================
// Arrange
// ============================================================================

/// Lay `objects` out in a grid, row-major, in the given order. Cells are
/// sized to the largest object. Returns the new geometry for each object.
pub fn arrange_grid(
    objects: &[BoardObject],
    spec: &ArrangeSpec,
    default_gap: f64,
) -> Vec<(ObjectId, Geometry)> {
    if objects.is_empty() {
        return Vec::new();
    }
    let columns = spec
        .columns
        .filter(|c| *c > 0)
        .unwrap_or_else(|| (objects.len() as f64).sqrt().ceil() as usize)
        .max(1);
    let gap = spec.gap.unwrap_or(default_gap);
    let cell_w = objects.iter().map(|o| o.geometry.width.abs()).fold(0.0, f64::max);
    let cell_h = objects.iter().map(|o| o.geometry.height.abs()).fold(0.0, f64::max);
    let origin_x = spec
        .origin_x
        .unwrap_or_else(|| objects.iter().map(|o| o.bounds().min_x).fold(f64::INFINITY, f64::min));
    let origin_y = spec
        .origin_y
        .unwrap_or_else(|| objects.iter().map(|o| o.bounds().min_y).fold(f64::INFINITY, f64::min));

    objects
        .iter()
        .enumerate()
        .map(|(i, o)| {
            let (row, col) = (i / columns, i % columns);
            let geometry = Geometry {
                x: origin_x + col as f64 * (cell_w + gap),
                y: origin_y + row as f64 * (cell_h + gap),
                ..o.geometry
            };
            (o.id.clone(), geometry)
        })
        .collect()
}
