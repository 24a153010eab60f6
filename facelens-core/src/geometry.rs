//! Points, boxes and the rectangle algebra used by every stage.

use std::ops::{Add, Div, Mul, Sub};

use serde::{Deserialize, Serialize};

/// 2D coordinate in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub const ORIGIN: Point = Point { x: 0.0, y: 0.0 };

    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    /// Euclidean length of the vector from the origin.
    pub fn magnitude(self) -> f32 {
        self.x.hypot(self.y)
    }

    pub fn distance(self, other: Point) -> f32 {
        (self - other).magnitude()
    }
}

impl Add for Point {
    type Output = Point;

    fn add(self, rhs: Point) -> Point {
        Point::new(self.x + rhs.x, self.y + rhs.y)
    }
}

impl Sub for Point {
    type Output = Point;

    fn sub(self, rhs: Point) -> Point {
        Point::new(self.x - rhs.x, self.y - rhs.y)
    }
}

impl Mul<f32> for Point {
    type Output = Point;

    fn mul(self, rhs: f32) -> Point {
        Point::new(self.x * rhs, self.y * rhs)
    }
}

impl Div<f32> for Point {
    type Output = Point;

    fn div(self, rhs: f32) -> Point {
        Point::new(self.x / rhs, self.y / rhs)
    }
}

/// Mean of a non-empty set of points; `None` for an empty slice.
pub fn center_of(points: &[Point]) -> Option<Point> {
    if points.is_empty() {
        return None;
    }
    let sum = points.iter().fold(Point::ORIGIN, |acc, p| acc + *p);
    Some(sum / points.len() as f32)
}

/// Axis-aligned box stored as top-left corner plus extents.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub const fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Build a box from its corners `(x1, y1)` and `(x2, y2)`.
    pub fn from_corners(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self::new(x1, y1, x2 - x1, y2 - y1)
    }

    /// Build a box from its centre and extents.
    pub fn from_center(center: Point, width: f32, height: f32) -> Self {
        Self::new(
            center.x - width / 2.0,
            center.y - height / 2.0,
            width,
            height,
        )
    }

    /// Smallest box containing every point; `None` for an empty slice.
    pub fn enclosing(points: &[Point]) -> Option<Self> {
        let first = points.first()?;
        let (mut x1, mut y1, mut x2, mut y2) = (first.x, first.y, first.x, first.y);
        for p in &points[1..] {
            x1 = x1.min(p.x);
            y1 = y1.min(p.y);
            x2 = x2.max(p.x);
            y2 = y2.max(p.y);
        }
        Some(Self::from_corners(x1, y1, x2, y2))
    }

    pub fn x2(&self) -> f32 {
        self.x + self.width
    }

    pub fn y2(&self) -> f32 {
        self.y + self.height
    }

    /// Corners as `(x1, y1, x2, y2)`.
    pub fn corners(&self) -> (f32, f32, f32, f32) {
        (self.x, self.y, self.x2(), self.y2())
    }

    pub fn top_left(&self) -> Point {
        Point::new(self.x, self.y)
    }

    pub fn center(&self) -> Point {
        Point::new(self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    /// Area, treating negative extents as empty.
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// True when the box has no positive area (or carries non-finite values).
    pub fn is_degenerate(&self) -> bool {
        !(self.width > 0.0 && self.height > 0.0) || !self.x.is_finite() || !self.y.is_finite()
    }

    /// True when rounding the corners to whole pixels leaves no area, i.e. no pixel can be cut
    /// out under the box.
    pub fn covers_no_pixel(&self) -> bool {
        self.is_degenerate() || self.round().is_degenerate()
    }

    fn intersection(&self, other: &Self) -> f32 {
        let w = (self.x2().min(other.x2()) - self.x.max(other.x)).max(0.0);
        let h = (self.y2().min(other.y2()) - self.y.max(other.y)).max(0.0);
        w * h
    }

    /// Intersection over union. Disjoint or zero-area boxes yield `0.0`.
    pub fn iou(&self, other: &Self) -> f32 {
        let intersection = self.intersection(other);
        if intersection <= 0.0 {
            return 0.0;
        }
        let union = self.area() + other.area() - intersection;
        if union <= 0.0 { 0.0 } else { intersection / union }
    }

    /// Intersection over the smaller of the two areas.
    pub fn iou_min(&self, other: &Self) -> f32 {
        let intersection = self.intersection(other);
        if intersection <= 0.0 {
            return 0.0;
        }
        let smaller = self.area().min(other.area());
        if smaller <= 0.0 { 0.0 } else { intersection / smaller }
    }

    /// Clamp into `[0, width] x [0, height]`.
    ///
    /// The result can be degenerate when the box lies outside the image; check
    /// [`is_degenerate`](Self::is_degenerate) and drop such boxes.
    pub fn clip_to_image(&self, width: u32, height: u32) -> Self {
        let (w, h) = (width as f32, height as f32);
        let x1 = self.x.clamp(0.0, w);
        let y1 = self.y.clamp(0.0, h);
        let x2 = self.x2().clamp(0.0, w);
        let y2 = self.y2().clamp(0.0, h);
        Self::new(x1, y1, (x2 - x1).max(0.0), (y2 - y1).max(0.0))
    }

    /// Grow the shorter side symmetrically so the box becomes square around the same centre.
    pub fn pad_to_square(&self) -> Self {
        let diff = (self.width - self.height).abs();
        if self.width < self.height {
            Self::new(self.x - diff / 2.0, self.y, self.width + diff, self.height)
        } else if self.height < self.width {
            Self::new(self.x, self.y - diff / 2.0, self.width, self.height + diff)
        } else {
            *self
        }
    }

    /// Grow by `dx` in total width and `dy` in total height, split evenly on both sides.
    pub fn pad(&self, dx: f32, dy: f32) -> Self {
        Self::new(
            self.x - dx / 2.0,
            self.y - dy / 2.0,
            self.width + dx,
            self.height + dy,
        )
    }

    pub fn shift(&self, dx: f32, dy: f32) -> Self {
        Self::new(self.x + dx, self.y + dy, self.width, self.height)
    }

    /// Scale every coordinate (position and extent) by per-axis factors.
    pub fn rescale(&self, sx: f32, sy: f32) -> Self {
        Self::new(self.x * sx, self.y * sy, self.width * sx, self.height * sy)
    }

    /// Round the corners to whole pixels.
    pub fn round(&self) -> Self {
        let (x1, y1, x2, y2) = self.corners();
        Self::from_corners(x1.round(), y1.round(), x2.round(), y2.round())
    }

    pub fn floor(&self) -> Self {
        Self::new(
            self.x.floor(),
            self.y.floor(),
            self.width.floor(),
            self.height.floor(),
        )
    }

    /// Move each corner by a fraction of the box extents, as produced by cascade regressors:
    /// `x1 += dx1 * w`, `y1 += dy1 * h`, `x2 += dx2 * w`, `y2 += dy2 * h`.
    pub fn calibrate(&self, region: [f32; 4]) -> Self {
        let (x1, y1, x2, y2) = self.corners();
        Self::from_corners(
            x1 + region[0] * self.width,
            y1 + region[1] * self.height,
            x2 + region[2] * self.width,
            y2 + region[3] * self.height,
        )
    }
}
