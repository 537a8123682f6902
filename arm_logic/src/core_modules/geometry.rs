// THEORY:
// The `geometry` module holds the small planar vocabulary every other vision module
// speaks: sub-pixel points, axis-aligned reference rectangles and four-corner quads.
// These are "dumb" data containers. The only behavior
// here is the handful of pure queries the command layer needs to reason about where
// a tracked object sits in the frame (containment, centroid).

use serde::{Deserialize, Serialize};

/// A point in image space, in pixels. Sub-pixel precision comes from homography projection.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point2 {
    pub x: f64,
    pub y: f64,
}

impl Point2 {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: &Point2) -> f64 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }
}

/// A four-corner region in frame space, ordered top-left, top-right, bottom-right, bottom-left
/// relative to the reference rectangle it was projected from.
pub type Quad = [Point2; 4];

/// An axis-aligned rectangle given by two opposite corners, inclusive on every edge.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x0: f64,
    pub y0: f64,
    pub x1: f64,
    pub y1: f64,
}

impl Rect {
    /// Builds a rectangle from any two opposite corners.
    pub fn from_corners(a: Point2, b: Point2) -> Self {
        Self {
            x0: a.x.min(b.x),
            y0: a.y.min(b.y),
            x1: a.x.max(b.x),
            y1: a.y.max(b.y),
        }
    }

    pub fn contains(&self, point: &Point2) -> bool {
        self.x0 <= point.x && point.x <= self.x1 && self.y0 <= point.y && point.y <= self.y1
    }

    pub fn center(&self) -> Point2 {
        Point2::new((self.x0 + self.x1) / 2.0, (self.y0 + self.y1) / 2.0)
    }

    pub fn corners(&self) -> Quad {
        [
            Point2::new(self.x0, self.y0),
            Point2::new(self.x1, self.y0),
            Point2::new(self.x1, self.y1),
            Point2::new(self.x0, self.y1),
        ]
    }
}

/// Even-odd ray casting test. Points exactly on an edge may land on either side.
pub fn point_in_polygon(point: &Point2, polygon: &[Point2]) -> bool {
    if polygon.len() < 3 {
        return false;
    }
    let mut inside = false;
    let mut j = polygon.len() - 1;
    for i in 0..polygon.len() {
        let (pi, pj) = (polygon[i], polygon[j]);
        if (pi.y > point.y) != (pj.y > point.y) {
            let crossing_x = pj.x + (point.y - pj.y) * (pi.x - pj.x) / (pi.y - pj.y);
            if point.x < crossing_x {
                inside = !inside;
            }
        }
        j = i;
    }
    inside
}

/// The arithmetic mean of a set of points. An empty set yields the origin.
pub fn centroid(points: &[Point2]) -> Point2 {
    if points.is_empty() {
        return Point2::default();
    }
    let n = points.len() as f64;
    let (sx, sy) = points
        .iter()
        .fold((0.0, 0.0), |(sx, sy), p| (sx + p.x, sy + p.y));
    Point2::new(sx / n, sy / n)
}
