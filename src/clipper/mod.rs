//! Polygon boolean operations and offsets.
//!
//! Wraps the geo / geo_clipper stack: scaled integer rings are converted
//! to millimeter `geo` polygons at this boundary, the boolean runs in
//! f64, and results come back as scaled rings (holes as separate
//! clockwise rings, the representation the pipeline uses everywhere).
//!
//! On top of the raw booleans sit the tree-support-specific safe
//! operations: [`safe_union`] revives areas the clipper collapses to
//! lines (influence areas can be micron-thin), [`safe_offset_inc`] grows
//! an area in bounded steps so it cannot jump across an obstacle, and
//! [`diff_clipped`] trims the clip set to the subject's bounding box
//! before differencing.

use crate::geometry::{
    get_extents, to_polylines, BoundingBox, Point, Polygon, Polygons, Polyline,
};
use crate::{scale, unscale, Coord, TINY_AREA_THRESHOLD};
use geo::{Coord as GeoCoord, LineString, MultiPolygon, Polygon as GeoPolygon};
use geo_clipper::{Clipper, EndType, JoinType};

/// Factor passed to geo_clipper; controls its internal integer scaling.
const CLIPPER_SCALE: f64 = 1000.0;

/// Join type for offset corners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OffsetJoin {
    Square,
    #[default]
    Round,
    Miter,
}

impl From<OffsetJoin> for JoinType {
    fn from(join: OffsetJoin) -> Self {
        match join {
            OffsetJoin::Square => JoinType::Square,
            OffsetJoin::Round => JoinType::Round(0.01),
            OffsetJoin::Miter => JoinType::Miter(1.2),
        }
    }
}

fn ring_to_geo(points: &[Point]) -> LineString<f64> {
    let mut coords: Vec<GeoCoord<f64>> = points
        .iter()
        .map(|p| GeoCoord {
            x: unscale(p.x),
            y: unscale(p.y),
        })
        .collect();
    if let (Some(first), Some(last)) = (coords.first().copied(), coords.last().copied()) {
        if first != last {
            coords.push(first);
        }
    }
    LineString::new(coords)
}

/// Group a flat ring list into geo polygons: counter-clockwise rings are
/// contours, clockwise rings become holes of the contour containing them.
fn rings_to_geo_multi(polygons: &[Polygon]) -> MultiPolygon<f64> {
    let mut contours: Vec<(GeoPolygon<f64>, &Polygon)> = Vec::new();
    let mut holes: Vec<&Polygon> = Vec::new();
    for polygon in polygons {
        if polygon.len() < 3 {
            continue;
        }
        if polygon.signed_area() >= 0.0 {
            contours.push((GeoPolygon::new(ring_to_geo(polygon.points()), vec![]), polygon));
        } else {
            holes.push(polygon);
        }
    }
    for hole in holes {
        let probe = hole.points()[0];
        if let Some((geo_poly, _)) = contours
            .iter_mut()
            .find(|(_, contour)| contour.contains_point(probe))
        {
            geo_poly.interiors_push(ring_to_geo(hole.points()));
        }
        // A hole with no surrounding contour is dropped; the boolean
        // backend would discard it as well.
    }
    MultiPolygon::new(contours.into_iter().map(|(p, _)| p).collect())
}

fn geo_ring_to_polygon(ring: &LineString<f64>) -> Polygon {
    let mut points: Vec<Point> = ring
        .coords()
        .map(|c| Point::new(scale(c.x), scale(c.y)))
        .collect();
    if points.len() > 1 && points.first() == points.last() {
        points.pop();
    }
    Polygon::from_points(points)
}

fn geo_multi_to_rings(multi: &MultiPolygon<f64>) -> Polygons {
    let mut out = Vec::new();
    for poly in &multi.0 {
        let contour = geo_ring_to_polygon(poly.exterior());
        if contour.len() >= 3 {
            out.push(contour);
        }
        for interior in poly.interiors() {
            let hole = geo_ring_to_polygon(interior);
            if hole.len() >= 3 {
                out.push(hole);
            }
        }
    }
    out
}

/// Union of two ring sets.
pub fn union(subject: &[Polygon], clip: &[Polygon]) -> Polygons {
    if subject.is_empty() {
        return union_(clip);
    }
    if clip.is_empty() {
        return union_(subject);
    }
    let result = rings_to_geo_multi(subject).union(&rings_to_geo_multi(clip), CLIPPER_SCALE);
    geo_multi_to_rings(&result)
}

/// Self-union of one ring set (merges overlaps, fixes orientation).
pub fn union_(polygons: &[Polygon]) -> Polygons {
    if polygons.is_empty() {
        return Vec::new();
    }
    let multi = rings_to_geo_multi(polygons);
    let result = multi.union(&MultiPolygon::new(vec![]), CLIPPER_SCALE);
    geo_multi_to_rings(&result)
}

/// Intersection of two ring sets.
pub fn intersection(subject: &[Polygon], clip: &[Polygon]) -> Polygons {
    if subject.is_empty() || clip.is_empty() {
        return Vec::new();
    }
    let result = rings_to_geo_multi(subject).intersection(&rings_to_geo_multi(clip), CLIPPER_SCALE);
    geo_multi_to_rings(&result)
}

/// Difference subject minus clip.
pub fn diff(subject: &[Polygon], clip: &[Polygon]) -> Polygons {
    if subject.is_empty() {
        return Vec::new();
    }
    if clip.is_empty() {
        return subject.to_vec();
    }
    let result = rings_to_geo_multi(subject).difference(&rings_to_geo_multi(clip), CLIPPER_SCALE);
    geo_multi_to_rings(&result)
}

/// Offset (positive grows, negative shrinks) a ring set, in scaled units.
pub fn offset(polygons: &[Polygon], delta: Coord, join: OffsetJoin) -> Polygons {
    if polygons.is_empty() {
        return Vec::new();
    }
    if delta == 0 {
        return union_(polygons);
    }
    let multi = rings_to_geo_multi(polygons);
    let result = multi.offset(
        unscale(delta),
        join.into(),
        EndType::ClosedPolygon,
        CLIPPER_SCALE,
    );
    geo_multi_to_rings(&result)
}

/// Offset open polylines into thin closed areas, in scaled units.
///
/// Each segment becomes a capsule (a hexagon with extended flat caps)
/// of half-width `delta`; the capsules are unioned. Only used with tiny
/// deltas to revive areas the boolean backend collapsed to lines, so cap
/// shape precision does not matter.
pub fn offset_polylines(polylines: &[Polyline], delta: Coord, _join: OffsetJoin) -> Polygons {
    if polylines.is_empty() || delta <= 0 {
        return Vec::new();
    }
    let mut capsules: Polygons = Vec::new();
    for line in polylines {
        let pts = line.points();
        if pts.len() == 1 {
            capsules.push(Polygon::rectangle(
                Point::new(pts[0].x - delta, pts[0].y - delta),
                Point::new(pts[0].x + delta, pts[0].y + delta),
            ));
            continue;
        }
        for w in pts.windows(2) {
            let (a, b) = (w[0], w[1]);
            let len = a.distance(&b);
            if len < 1.0 {
                continue;
            }
            let dx = ((b.x - a.x) as f64 / len * delta as f64).round() as Coord;
            let dy = ((b.y - a.y) as f64 / len * delta as f64).round() as Coord;
            // Normal (-dy, dx); caps extended along the segment direction.
            capsules.push(Polygon::from_points(vec![
                Point::new(a.x - dx - dy, a.y - dy + dx),
                Point::new(a.x - dx + dy, a.y - dy - dx),
                Point::new(b.x + dx + dy, b.y + dy - dx),
                Point::new(b.x + dx - dy, b.y + dy + dx),
            ]));
        }
    }
    union_(&capsules)
}

/// Drop colinear and near-duplicate vertices; tolerance in scaled units.
pub fn simplify(polygons: &[Polygon], tolerance: Coord) -> Polygons {
    let tol2 = (tolerance as f64) * (tolerance as f64);
    polygons
        .iter()
        .filter_map(|polygon| {
            let pts = polygon.points();
            if pts.len() < 3 {
                return None;
            }
            let mut kept: Vec<Point> = Vec::with_capacity(pts.len());
            for &p in pts {
                if let Some(&last) = kept.last() {
                    if last.distance_squared(&p) < tol2 as i128 {
                        continue;
                    }
                }
                // Drop the middle point of a near-straight corner.
                while kept.len() >= 2 {
                    let a = kept[kept.len() - 2];
                    let b = kept[kept.len() - 1];
                    let ab = b - a;
                    let ap = p - a;
                    let cross = ab.cross(&ap).unsigned_abs() as f64;
                    let len = ab.norm();
                    if len > 0.0 && cross / len < tolerance as f64 {
                        kept.pop();
                    } else {
                        break;
                    }
                }
                kept.push(p);
            }
            if kept.len() >= 3 {
                Some(Polygon::from_points(kept))
            } else {
                None
            }
        })
        .collect()
}

/// Remove rings whose absolute area is below `min_area` (squared scaled).
pub fn remove_small(polygons: Polygons, min_area: f64) -> Polygons {
    polygons
        .into_iter()
        .filter(|p| p.area() >= min_area)
        .collect()
}

/// Union that never destroys a non-empty input.
///
/// The boolean backend can slowly erode thin areas to nothing because of
/// rounding; influence areas represent admissible center points and may be
/// exactly that thin. If the regular union comes back empty, the inputs
/// are revived as polylines offset outward by 0.002 mm.
pub fn safe_union(first: &[Polygon], second: &[Polygon]) -> Polygons {
    if first.is_empty() && second.is_empty() {
        return Vec::new();
    }
    let result = union(first, second);
    if !result.is_empty() {
        return result;
    }
    tracing::debug!("caught an area-destroying union, reviving inputs as offset lines");
    let revive = scale(0.002);
    let mut lines = offset_polylines(&to_polylines(first), revive, OffsetJoin::Miter);
    lines.extend(offset_polylines(&to_polylines(second), revive, OffsetJoin::Miter));
    union_(&lines)
}

/// Difference with the clip set pre-trimmed to the subject's bounds.
pub fn diff_clipped(subject: &[Polygon], clip: &[Polygon]) -> Polygons {
    if subject.is_empty() {
        return Vec::new();
    }
    if clip.is_empty() {
        return subject.to_vec();
    }
    let bounds = get_extents(subject).inflated(scale(0.5));
    let trimmed = clip_with_bbox(clip, &bounds);
    diff(subject, &trimmed)
}

/// Keep only clip rings whose bounding box touches `bounds`.
fn clip_with_bbox(polygons: &[Polygon], bounds: &BoundingBox) -> Polygons {
    polygons
        .iter()
        .filter(|p| p.bounding_box().intersects(bounds))
        .cloned()
        .collect()
}

/// Offset outward in bounded steps, subtracting `collision` after each
/// step, so the area cannot tunnel through an obstacle thinner than one
/// step.
///
/// - `distance`: total outward offset (>= 0, scaled units).
/// - `safe_step_size`: largest step that cannot jump an obstacle.
/// - `last_step_offset_without_check`: trailing distance allowed without
///   the per-step difference (the caller subtracts its own forbidden area
///   afterwards); 0 forces a final difference here.
/// - `min_amount_offset`: minimum number of steps. Stepping a round
///   offset repeatedly adds vertices, which keeps very small areas from
///   degenerating.
pub fn safe_offset_inc(
    me: &[Polygon],
    distance: Coord,
    collision: &[Polygon],
    safe_step_size: Coord,
    last_step_offset_without_check: Coord,
    min_amount_offset: usize,
) -> Polygons {
    let mut ret = safe_union(me, &[]);
    let mut do_final_difference = last_step_offset_without_check == 0;

    let collision_trimmed: Polygons = if collision.is_empty() {
        Vec::new()
    } else {
        clip_with_bbox(
            collision,
            &get_extents(&ret).inflated(distance.max(0) + scale(0.01)),
        )
    };

    if distance == 0 {
        return if do_final_difference {
            diff(&ret, &collision_trimmed)
        } else {
            union_(&ret)
        };
    }
    if safe_step_size < 0 || last_step_offset_without_check < 0 {
        tracing::error!(
            safe_step_size,
            last_step_offset_without_check,
            "safe_offset_inc got a negative step parameter"
        );
        return if do_final_difference {
            diff(&ret, &collision_trimmed)
        } else {
            union_(&ret)
        };
    }

    let mut step_size = safe_step_size;
    let mut steps = if distance > last_step_offset_without_check {
        (distance - last_step_offset_without_check) / step_size
    } else {
        0
    };
    if distance - steps * step_size > last_step_offset_without_check {
        if (steps + 1) * step_size <= distance {
            // Happens when last_step_offset_without_check >= step size.
            steps += 1;
        } else {
            do_final_difference = true;
        }
    }
    let extra_step = (distance < last_step_offset_without_check || distance % step_size != 0) as i64;
    if steps + extra_step < min_amount_offset as i64 && min_amount_offset > 1 {
        // Reduce the step size so the area is offset at least the
        // requested number of times.
        step_size = distance / min_amount_offset as Coord;
        if step_size >= safe_step_size {
            step_size = safe_step_size;
            steps = min_amount_offset as i64;
        } else if step_size > 0 {
            steps = distance / step_size;
        } else {
            steps = 0;
        }
    }

    for i in 0..steps {
        ret = diff(&offset(&ret, step_size, OffsetJoin::Round), &collision_trimmed);
        if i % 10 == 7 {
            ret = simplify(&ret, scale(0.015));
        }
    }
    let last_offset = distance - steps * step_size;
    if last_offset > scale(0.0001) {
        ret = offset(&ret, last_offset, OffsetJoin::Round);
    }
    ret = simplify(&ret, scale(0.015));

    if do_final_difference {
        ret = diff(&ret, &collision_trimmed);
    }
    union_(&ret)
}

/// True if the covered area of the set is below the tiny-area threshold.
pub fn is_tiny(polygons: &[Polygon]) -> bool {
    crate::geometry::area(polygons) <= TINY_AREA_THRESHOLD
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::area;
    use crate::scale;

    fn square_mm(x: f64, y: f64, size: f64) -> Polygon {
        Polygon::rectangle(
            Point::new(scale(x), scale(y)),
            Point::new(scale(x + size), scale(y + size)),
        )
    }

    #[test]
    fn union_of_overlapping_squares() {
        let a = square_mm(0.0, 0.0, 10.0);
        let b = square_mm(5.0, 0.0, 10.0);
        let result = union(&[a.clone()], &[b.clone()]);
        let got = area(&result);
        assert!(got < a.area() + b.area());
        assert!(got > a.area());
    }

    #[test]
    fn intersection_of_disjoint_is_empty() {
        let a = square_mm(0.0, 0.0, 5.0);
        let b = square_mm(20.0, 0.0, 5.0);
        assert!(intersection(&[a], &[b]).is_empty());
    }

    #[test]
    fn diff_carves_hole() {
        let outer = square_mm(0.0, 0.0, 20.0);
        let inner = square_mm(5.0, 5.0, 10.0);
        let result = diff(&[outer.clone()], &[inner.clone()]);
        let expected = outer.area() - inner.area();
        let got = area(&result);
        assert!((got - expected).abs() / expected < 0.01);
        // Contour plus hole ring.
        assert!(result.len() >= 2);
    }

    #[test]
    fn offset_grows_and_shrinks() {
        let square = square_mm(0.0, 0.0, 10.0);
        let grown = offset(&[square.clone()], scale(1.0), OffsetJoin::Miter);
        assert!(area(&grown) > square.area());
        let shrunk = offset(&[square.clone()], -scale(1.0), OffsetJoin::Miter);
        assert!(area(&shrunk) < square.area());
        assert!(!shrunk.is_empty());
    }

    #[test]
    fn offset_annihilates_small_area() {
        let small = square_mm(0.0, 0.0, 1.0);
        let gone = offset(&[small], -scale(1.0), OffsetJoin::Miter);
        assert!(gone.is_empty() || area(&gone) < 1.0);
    }

    #[test]
    fn safe_union_keeps_thin_input_alive() {
        // A degenerate sliver the clipper may treat as a line.
        let sliver = Polygon::from_points(vec![
            Point::new(0, 0),
            Point::new(scale(5.0), 10),
            Point::new(scale(5.0), 0),
        ]);
        let result = safe_union(&[sliver], &[]);
        assert!(!result.is_empty());
    }

    #[test]
    fn safe_offset_inc_blocked_by_collision() {
        // Growing a square toward a wall; the wall must stay uncovered.
        let square = square_mm(0.0, 0.0, 4.0);
        let wall = square_mm(5.0, -10.0, 2.0);
        let grown = safe_offset_inc(&[square], scale(4.0), &[wall.clone()], scale(1.0), 0, 1);
        assert!(!grown.is_empty());
        let overlap = intersection(&grown, &[wall]);
        assert!(area(&overlap) < crate::TINY_AREA_THRESHOLD);
    }

    #[test]
    fn safe_offset_inc_zero_distance_is_difference() {
        let square = square_mm(0.0, 0.0, 4.0);
        let blocker = square_mm(2.0, 0.0, 4.0);
        let result = safe_offset_inc(&[square.clone()], 0, &[blocker.clone()], scale(1.0), 0, 1);
        let expected = diff(&[square], &[blocker]);
        assert!((area(&result) - area(&expected)).abs() < crate::TINY_AREA_THRESHOLD);
    }

    #[test]
    fn diff_clipped_matches_diff() {
        let subject = square_mm(0.0, 0.0, 10.0);
        let near = square_mm(5.0, 5.0, 3.0);
        let far = square_mm(500.0, 500.0, 3.0);
        let clipped = diff_clipped(&[subject.clone()], &[near.clone(), far]);
        let full = diff(&[subject], &[near]);
        assert!((area(&clipped) - area(&full)).abs() < crate::TINY_AREA_THRESHOLD);
    }

    #[test]
    fn simplify_drops_colinear_points() {
        let mut points = Vec::new();
        for i in 0..100 {
            points.push(Point::new(scale(0.1) * i, 0));
        }
        points.push(Point::new(scale(10.0), scale(10.0)));
        points.push(Point::new(0, scale(10.0)));
        let result = simplify(&[Polygon::from_points(points)], scale(0.01));
        assert_eq!(result.len(), 1);
        assert!(result[0].len() <= 6);
    }
}
