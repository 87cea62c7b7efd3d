//! 2D geometry primitives in scaled integer coordinates.
//!
//! All polygon math in the support pipeline runs on [`Point`] / [`Polygon`]
//! with coordinates in scaled units (see [`crate::scale`]); floating point
//! only appears transiently inside offsets, rotations and the organic
//! nudging pass.

mod aabb_tree;
mod bounding_box;
mod expolygon;
mod point;
mod polygon;

pub use aabb_tree::{BoxTree, Segment, SegmentTree};
pub use bounding_box::BoundingBox;
pub use expolygon::{expolygons_to_polygons, ExPolygon, ExPolygons};
pub use point::{closest_point_on_segment, Point, PointF};
pub use polygon::{Polygon, Polygons, Polyline, Polylines};

use crate::Coord;

/// Total length of all polygon contours, in scaled units.
pub fn total_length(polygons: &[Polygon]) -> f64 {
    polygons.iter().map(|p| p.perimeter()).sum()
}

/// Sum of absolute areas of a polygon set, in squared scaled units.
pub fn area(polygons: &[Polygon]) -> f64 {
    polygons.iter().map(|p| p.signed_area()).sum::<f64>().abs()
}

/// Check whether a point lies inside the covered region of a polygon set.
///
/// Even-odd over all contours: a point inside a hole ring reports outside,
/// matching how the pipeline stores holes as separate rings.
pub fn contains(polygons: &[Polygon], point: Point) -> bool {
    let mut inside = false;
    for polygon in polygons {
        if polygon.contains_point(point) {
            inside = !inside;
        }
    }
    inside
}

/// Bounding box of a polygon set.
pub fn get_extents(polygons: &[Polygon]) -> BoundingBox {
    let mut bbox = BoundingBox::new();
    for polygon in polygons {
        for p in polygon.points() {
            bbox.merge_point(*p);
        }
    }
    bbox
}

/// Convert closed polygons into open polylines (repeating the first point).
pub fn to_polylines(polygons: &[Polygon]) -> Polylines {
    polygons
        .iter()
        .filter(|p| p.len() >= 2)
        .map(|p| {
            let mut points = p.points().to_vec();
            points.push(points[0]);
            Polyline::from_points(points)
        })
        .collect()
}

/// Regular polygon approximating a circle of the given radius.
pub fn make_circle(radius: Coord, resolution: usize) -> Polygon {
    let mut points = Vec::with_capacity(resolution);
    for i in 0..resolution {
        let angle = std::f64::consts::TAU * i as f64 / resolution as f64;
        points.push(Point::new(
            (radius as f64 * angle.cos()).round() as Coord,
            (radius as f64 * angle.sin()).round() as Coord,
        ));
    }
    Polygon::from_points(points)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scale;

    #[test]
    fn circle_has_requested_resolution_and_radius() {
        let circle = make_circle(scale(2.0), 32);
        assert_eq!(circle.len(), 32);
        for p in circle.points() {
            let r = ((p.x as f64).hypot(p.y as f64) / crate::SCALING_FACTOR - 2.0).abs();
            assert!(r < 0.01, "vertex radius off by {r} mm");
        }
    }

    #[test]
    fn contains_respects_holes() {
        let outer = Polygon::rectangle(Point::new(0, 0), Point::new(scale(10.0), scale(10.0)));
        let hole = Polygon::rectangle(
            Point::new(scale(4.0), scale(4.0)),
            Point::new(scale(6.0), scale(6.0)),
        );
        let set = vec![outer, hole];
        assert!(contains(&set, Point::new(scale(1.0), scale(1.0))));
        assert!(!contains(&set, Point::new(scale(5.0), scale(5.0))));
        assert!(!contains(&set, Point::new(scale(20.0), scale(20.0))));
    }

    #[test]
    fn total_length_of_square() {
        let square = Polygon::rectangle(Point::new(0, 0), Point::new(scale(10.0), scale(10.0)));
        let len = total_length(&[square]);
        assert!((len - scale(40.0) as f64).abs() < 1.0);
    }
}
