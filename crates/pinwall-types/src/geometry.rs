//! Axis-aligned rectangles and grid snapping.

use serde::{Deserialize, Serialize};

/// An axis-aligned rectangle in board coordinates.
///
/// Always normalized: `min_x <= max_x` and `min_y <= max_y`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl Rect {
    /// Build from origin and extent. Negative extents (lines drawn up/left)
    /// are normalized.
    pub fn from_xywh(x: f64, y: f64, width: f64, height: f64) -> Self {
        let (min_x, max_x) = if width >= 0.0 { (x, x + width) } else { (x + width, x) };
        let (min_y, max_y) = if height >= 0.0 { (y, y + height) } else { (y + height, y) };
        Self { min_x, min_y, max_x, max_y }
    }

    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }

    pub fn center(&self) -> (f64, f64) {
        ((self.min_x + self.max_x) / 2.0, (self.min_y + self.max_y) / 2.0)
    }

    /// Inclusive intersection test: touching edges count as intersecting.
    pub fn intersects(&self, other: &Rect) -> bool {
        self.min_x <= other.max_x
            && other.min_x <= self.max_x
            && self.min_y <= other.max_y
            && other.min_y <= self.max_y
    }

    pub fn contains_point(&self, x: f64, y: f64) -> bool {
        x >= self.min_x && x <= self.max_x && y >= self.min_y && y <= self.max_y
    }

    /// Grow the rectangle by `padding` on every side.
    pub fn padded(&self, padding: f64) -> Self {
        Self {
            min_x: self.min_x - padding,
            min_y: self.min_y - padding,
            max_x: self.max_x + padding,
            max_y: self.max_y + padding,
        }
    }

    pub fn union(&self, other: &Rect) -> Self {
        Self {
            min_x: self.min_x.min(other.min_x),
            min_y: self.min_y.min(other.min_y),
            max_x: self.max_x.max(other.max_x),
            max_y: self.max_y.max(other.max_y),
        }
    }

    /// Smallest axis-aligned box enclosing this rectangle rotated by
    /// `degrees` around its center.
    pub fn rotated_bounds(&self, degrees: f64) -> Self {
        self.rotated_about(degrees, self.center())
    }

    /// Smallest axis-aligned box enclosing this rectangle rotated by
    /// `degrees` around `pivot`.
    pub fn rotated_about(&self, degrees: f64, pivot: (f64, f64)) -> Self {
        if degrees == 0.0 || !degrees.is_finite() {
            return *self;
        }
        let (sin, cos) = degrees.to_radians().sin_cos();
        let (px, py) = pivot;
        let corners = [
            (self.min_x, self.min_y),
            (self.max_x, self.min_y),
            (self.max_x, self.max_y),
            (self.min_x, self.max_y),
        ];
        let mut bounds = Self {
            min_x: f64::INFINITY,
            min_y: f64::INFINITY,
            max_x: f64::NEG_INFINITY,
            max_y: f64::NEG_INFINITY,
        };
        for (x, y) in corners {
            let (dx, dy) = (x - px, y - py);
            let (rx, ry) = (px + dx * cos - dy * sin, py + dx * sin + dy * cos);
            bounds.min_x = bounds.min_x.min(rx);
            bounds.min_y = bounds.min_y.min(ry);
            bounds.max_x = bounds.max_x.max(rx);
            bounds.max_y = bounds.max_y.max(ry);
        }
        bounds
    }
}

/// Round `value` to the nearest multiple of `grid`. A non-positive grid
/// disables snapping.
pub fn snap_to_grid(value: f64, grid: f64) -> f64 {
    if grid <= 0.0 || !grid.is_finite() {
        return value;
    }
    (value / grid).round() * grid
}
