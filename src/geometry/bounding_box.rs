//! Axis-aligned bounding boxes in scaled integer coordinates.

use super::Point;
use crate::Coord;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A 2D axis-aligned bounding box.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min: Point,
    pub max: Point,
}

impl BoundingBox {
    /// New empty (inverted) box; merging any point defines it.
    #[inline]
    pub fn new() -> Self {
        Self {
            min: Point::new(Coord::MAX, Coord::MAX),
            max: Point::new(Coord::MIN, Coord::MIN),
        }
    }

    #[inline]
    pub fn from_min_max(min: Point, max: Point) -> Self {
        Self { min, max }
    }

    pub fn from_points(points: &[Point]) -> Self {
        let mut bb = Self::new();
        for p in points {
            bb.merge_point(*p);
        }
        bb
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.min.x > self.max.x || self.min.y > self.max.y
    }

    pub fn merge_point(&mut self, p: Point) {
        self.min.x = self.min.x.min(p.x);
        self.min.y = self.min.y.min(p.y);
        self.max.x = self.max.x.max(p.x);
        self.max.y = self.max.y.max(p.y);
    }

    pub fn merge(&mut self, other: &BoundingBox) {
        if !other.is_empty() {
            self.merge_point(other.min);
            self.merge_point(other.max);
        }
    }

    /// Grow (or shrink, for negative delta) on all sides.
    pub fn inflated(&self, delta: Coord) -> BoundingBox {
        BoundingBox {
            min: Point::new(self.min.x - delta, self.min.y - delta),
            max: Point::new(self.max.x + delta, self.max.y + delta),
        }
    }

    pub fn intersects(&self, other: &BoundingBox) -> bool {
        !self.is_empty()
            && !other.is_empty()
            && self.min.x <= other.max.x
            && other.min.x <= self.max.x
            && self.min.y <= other.max.y
            && other.min.y <= self.max.y
    }

    pub fn contains_point(&self, p: Point) -> bool {
        p.x >= self.min.x && p.x <= self.max.x && p.y >= self.min.y && p.y <= self.max.y
    }

    #[inline]
    pub fn width(&self) -> Coord {
        (self.max.x - self.min.x).max(0)
    }

    #[inline]
    pub fn height(&self) -> Coord {
        (self.max.y - self.min.y).max(0)
    }

    #[inline]
    pub fn center(&self) -> Point {
        Point::new(
            (self.min.x + self.max.x) / 2,
            (self.min.y + self.max.y) / 2,
        )
    }
}

impl Default for BoundingBox {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for BoundingBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            write!(f, "BoundingBox[empty]")
        } else {
            write!(f, "BoundingBox[{:?}..{:?}]", self.min, self.max)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_until_merged() {
        let mut bb = BoundingBox::new();
        assert!(bb.is_empty());
        bb.merge_point(Point::new(5, 5));
        assert!(!bb.is_empty());
        assert_eq!(bb.min, bb.max);
    }

    #[test]
    fn merge_and_extents() {
        let bb = BoundingBox::from_points(&[Point::new(0, 10), Point::new(20, -5)]);
        assert_eq!(bb.min, Point::new(0, -5));
        assert_eq!(bb.max, Point::new(20, 10));
        assert_eq!(bb.width(), 20);
        assert_eq!(bb.height(), 15);
        assert_eq!(bb.center(), Point::new(10, 2));
    }

    #[test]
    fn intersection_tests() {
        let a = BoundingBox::from_min_max(Point::new(0, 0), Point::new(10, 10));
        let b = BoundingBox::from_min_max(Point::new(5, 5), Point::new(15, 15));
        let c = BoundingBox::from_min_max(Point::new(20, 20), Point::new(30, 30));
        assert!(a.intersects(&b));
        assert!(!a.intersects(&c));
        // Inflation can create an intersection.
        assert!(a.inflated(10).intersects(&c));
    }

    #[test]
    fn empty_never_intersects() {
        let empty = BoundingBox::new();
        let a = BoundingBox::from_min_max(Point::new(0, 0), Point::new(10, 10));
        assert!(!empty.intersects(&a));
        assert!(!a.intersects(&empty));
    }
}
