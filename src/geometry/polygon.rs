//! Closed polygons and open polylines.

use super::{BoundingBox, Point};
use crate::{Coord, CoordF};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A closed polygon defined by a sequence of points.
///
/// Implicitly closed: the last point connects back to the first. Outer
/// contours are counter-clockwise (positive area), holes clockwise.
#[derive(Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Polygon {
    points: Vec<Point>,
}

/// A set of polygons. Holes are carried as separate clockwise rings.
pub type Polygons = Vec<Polygon>;

impl Polygon {
    #[inline]
    pub fn new() -> Self {
        Self { points: Vec::new() }
    }

    #[inline]
    pub fn from_points(points: Vec<Point>) -> Self {
        Self { points }
    }

    /// Axis-aligned rectangle between two corner points.
    pub fn rectangle(min: Point, max: Point) -> Self {
        Self {
            points: vec![
                min,
                Point::new(max.x, min.y),
                max,
                Point::new(min.x, max.y),
            ],
        }
    }

    #[inline]
    pub fn points(&self) -> &[Point] {
        &self.points
    }

    #[inline]
    pub fn points_mut(&mut self) -> &mut Vec<Point> {
        &mut self.points
    }

    #[inline]
    pub fn into_points(self) -> Vec<Point> {
        self.points
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    #[inline]
    pub fn push(&mut self, point: Point) {
        self.points.push(point);
    }

    /// Translate all points by the given offset.
    pub fn translate(&mut self, offset: Point) {
        for p in &mut self.points {
            *p += offset;
        }
    }

    /// A copy translated by the given offset.
    pub fn translated(&self, offset: Point) -> Polygon {
        let mut out = self.clone();
        out.translate(offset);
        out
    }

    /// Signed area via the shoelace formula, in squared scaled units.
    /// Positive for counter-clockwise winding.
    pub fn signed_area(&self) -> f64 {
        if self.points.len() < 3 {
            return 0.0;
        }
        let mut sum: i128 = 0;
        for i in 0..self.points.len() {
            let a = self.points[i];
            let b = self.points[(i + 1) % self.points.len()];
            sum += a.cross(&b);
        }
        sum as f64 / 2.0
    }

    /// Absolute area in squared scaled units.
    #[inline]
    pub fn area(&self) -> f64 {
        self.signed_area().abs()
    }

    /// Contour length in scaled units.
    pub fn perimeter(&self) -> f64 {
        if self.points.len() < 2 {
            return 0.0;
        }
        let mut total = 0.0;
        for i in 0..self.points.len() {
            let a = self.points[i];
            let b = self.points[(i + 1) % self.points.len()];
            total += a.distance(&b);
        }
        total
    }

    /// Arithmetic mean of the vertices.
    pub fn centroid(&self) -> Point {
        if self.points.is_empty() {
            return Point::zero();
        }
        let mut x: i128 = 0;
        let mut y: i128 = 0;
        for p in &self.points {
            x += p.x as i128;
            y += p.y as i128;
        }
        let n = self.points.len() as i128;
        Point::new((x / n) as Coord, (y / n) as Coord)
    }

    /// Ray-casting point-in-polygon test. Boundary points may report
    /// either side; the pipeline never relies on exact boundary behavior.
    pub fn contains_point(&self, point: Point) -> bool {
        if self.points.len() < 3 {
            return false;
        }
        let mut inside = false;
        let mut j = self.points.len() - 1;
        for i in 0..self.points.len() {
            let pi = self.points[i];
            let pj = self.points[j];
            if (pi.y > point.y) != (pj.y > point.y) {
                let dy = (pj.y - pi.y) as f64;
                let t = (point.y - pi.y) as f64 / dy;
                let x_cross = pi.x as f64 + t * (pj.x - pi.x) as f64;
                if (point.x as f64) < x_cross {
                    inside = !inside;
                }
            }
            j = i;
        }
        inside
    }

    pub fn bounding_box(&self) -> BoundingBox {
        BoundingBox::from_points(&self.points)
    }

    /// Squared distance from a point to the contour.
    pub fn distance_to_point_squared(&self, point: Point) -> i128 {
        let mut best = i128::MAX;
        for i in 0..self.points.len() {
            let a = self.points[i];
            let b = self.points[(i + 1) % self.points.len()];
            let c = super::closest_point_on_segment(point, a, b);
            best = best.min(point.distance_squared(&c));
        }
        best
    }

    /// Rotate the vertex order so that index `start` becomes the first
    /// vertex. The set of edges is unchanged.
    pub fn rotate_start(&mut self, start: usize) {
        if !self.points.is_empty() {
            let start = start % self.points.len();
            self.points.rotate_left(start);
        }
    }
}

impl fmt::Debug for Polygon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Polygon[{} pts]", self.points.len())
    }
}

impl From<Vec<Point>> for Polygon {
    fn from(points: Vec<Point>) -> Self {
        Self::from_points(points)
    }
}

/// An open sequence of connected points.
#[derive(Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Polyline {
    points: Vec<Point>,
}

/// A set of polylines.
pub type Polylines = Vec<Polyline>;

impl Polyline {
    #[inline]
    pub fn new() -> Self {
        Self { points: Vec::new() }
    }

    #[inline]
    pub fn from_points(points: Vec<Point>) -> Self {
        Self { points }
    }

    #[inline]
    pub fn points(&self) -> &[Point] {
        &self.points
    }

    #[inline]
    pub fn points_mut(&mut self) -> &mut Vec<Point> {
        &mut self.points
    }

    #[inline]
    pub fn into_points(self) -> Vec<Point> {
        self.points
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    #[inline]
    pub fn push(&mut self, point: Point) {
        self.points.push(point);
    }

    pub fn first(&self) -> Option<Point> {
        self.points.first().copied()
    }

    pub fn last(&self) -> Option<Point> {
        self.points.last().copied()
    }

    /// Whether the polyline returns to its start point.
    pub fn is_closed(&self) -> bool {
        self.points.len() >= 3 && self.points.first() == self.points.last()
    }

    /// Total length in scaled units.
    pub fn length(&self) -> CoordF {
        let mut total = 0.0;
        for w in self.points.windows(2) {
            total += w[0].distance(&w[1]);
        }
        total
    }

    /// Point at the given distance from the start, walking along segments.
    /// Clamps to the last point when the distance exceeds the length.
    pub fn point_at_distance(&self, distance: CoordF) -> Option<Point> {
        if self.points.is_empty() {
            return None;
        }
        let mut remaining = distance;
        for w in self.points.windows(2) {
            let seg = w[0].distance(&w[1]);
            if remaining <= seg && seg > 0.0 {
                let t = remaining / seg;
                return Some(Point::new(
                    w[0].x + ((w[1].x - w[0].x) as f64 * t).round() as Coord,
                    w[0].y + ((w[1].y - w[0].y) as f64 * t).round() as Coord,
                ));
            }
            remaining -= seg;
        }
        self.points.last().copied()
    }
}

impl fmt::Debug for Polyline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Polyline[{} pts]", self.points.len())
    }
}

impl From<Vec<Point>> for Polyline {
    fn from(points: Vec<Point>) -> Self {
        Self::from_points(points)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scale;

    fn unit_square_mm(size: f64) -> Polygon {
        Polygon::rectangle(Point::zero(), Point::new(scale(size), scale(size)))
    }

    #[test]
    fn rectangle_area_and_winding() {
        let square = unit_square_mm(10.0);
        let expected = (scale(10.0) as f64) * (scale(10.0) as f64);
        assert!((square.signed_area() - expected).abs() / expected < 1e-9);
    }

    #[test]
    fn contains_point_inside_outside() {
        let square = unit_square_mm(10.0);
        assert!(square.contains_point(Point::new(scale(5.0), scale(5.0))));
        assert!(!square.contains_point(Point::new(scale(15.0), scale(5.0))));
        assert!(!square.contains_point(Point::new(-scale(1.0), scale(5.0))));
    }

    #[test]
    fn perimeter_of_square() {
        let square = unit_square_mm(10.0);
        assert!((square.perimeter() - scale(40.0) as f64).abs() < 1.0);
    }

    #[test]
    fn centroid_of_square() {
        let square = unit_square_mm(10.0);
        let c = square.centroid();
        assert_eq!(c, Point::new(scale(5.0), scale(5.0)));
    }

    #[test]
    fn translate_moves_all_points() {
        let mut square = unit_square_mm(2.0);
        square.translate(Point::new(scale(1.0), scale(-1.0)));
        assert_eq!(square.points()[0], Point::new(scale(1.0), scale(-1.0)));
    }

    #[test]
    fn polyline_length_and_sampling() {
        let line = Polyline::from_points(vec![
            Point::zero(),
            Point::new(scale(3.0), 0),
            Point::new(scale(3.0), scale(4.0)),
        ]);
        assert!((line.length() - scale(7.0) as f64).abs() < 1.0);
        let mid = line.point_at_distance(scale(5.0) as f64).unwrap();
        assert_eq!(mid, Point::new(scale(3.0), scale(2.0)));
        // Beyond the end clamps to the last point.
        let end = line.point_at_distance(scale(100.0) as f64).unwrap();
        assert_eq!(end, Point::new(scale(3.0), scale(4.0)));
    }

    #[test]
    fn closed_detection() {
        let mut pts = unit_square_mm(1.0).into_points();
        pts.push(pts[0]);
        assert!(Polyline::from_points(pts).is_closed());
    }
}
