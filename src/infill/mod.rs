//! Infill oracle: turning an area into support lines.
//!
//! The tip placer does not sample overhangs on a grid; it asks for the
//! lines that would actually be printed inside the overhang and samples
//! those, so tips end up under material. That line generation is behind
//! the [`InfillOracle`] trait so an embedding slicer can plug in its own
//! pattern generator; [`SupportLineFiller`] is the built-in rectilinear
//! implementation used by the pipeline and the tests.

use crate::geometry::{to_polylines, Point, Polygon, Polyline, Polylines};
use crate::{Coord, CoordF, LayerIndex};

/// Fill patterns understood by the built-in filler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FillPattern {
    /// Parallel lines at the seed angle.
    #[default]
    Lines,
    /// Parallel lines with alternating direction per scanline.
    ZigZag,
    /// Inward concentric rings.
    Concentric,
}

/// Generates polylines lying inside a polygon set.
pub trait InfillOracle: Send + Sync {
    /// Fill `area` with `pattern` at `spacing` (scaled units). The seed
    /// `angle` is in radians; implementations may vary it per layer.
    /// Every returned polyline must lie entirely within `area`.
    fn fill(
        &self,
        area: &[Polygon],
        pattern: FillPattern,
        spacing: Coord,
        angle: CoordF,
        layer_idx: LayerIndex,
    ) -> Polylines;
}

/// Built-in rectilinear support-line filler.
///
/// Scanlines perpendicular to the seed angle are intersected with the
/// area's edges (even-odd), producing one polyline per covered span.
/// The angle alternates by 90 degrees on odd layers so support lines
/// cross between layers.
#[derive(Debug, Clone, Default)]
pub struct SupportLineFiller {
    /// Extra angle added on odd layers, radians. Default PI/2.
    pub alternate_angle: Option<CoordF>,
}

impl SupportLineFiller {
    pub fn new() -> Self {
        Self {
            alternate_angle: Some(std::f64::consts::FRAC_PI_2),
        }
    }
}

impl InfillOracle for SupportLineFiller {
    fn fill(
        &self,
        area: &[Polygon],
        pattern: FillPattern,
        spacing: Coord,
        angle: CoordF,
        layer_idx: LayerIndex,
    ) -> Polylines {
        if area.is_empty() || spacing <= 0 {
            return Vec::new();
        }
        let angle = if layer_idx % 2 == 1 {
            angle + self.alternate_angle.unwrap_or(0.0)
        } else {
            angle
        };
        match pattern {
            FillPattern::Lines | FillPattern::ZigZag => {
                scanline_fill(area, spacing, angle, pattern == FillPattern::ZigZag)
            }
            FillPattern::Concentric => concentric_fill(area, spacing),
        }
    }
}

fn rotate_point(p: Point, cos_a: CoordF, sin_a: CoordF) -> Point {
    let x = p.x as CoordF;
    let y = p.y as CoordF;
    Point::new(
        (cos_a * x - sin_a * y).round() as Coord,
        (sin_a * x + cos_a * y).round() as Coord,
    )
}

fn scanline_fill(area: &[Polygon], spacing: Coord, angle: CoordF, zig_zag: bool) -> Polylines {
    let cos_a = angle.cos();
    let sin_a = angle.sin();
    // Rotate the area so scanlines are horizontal.
    let rotated: Vec<Polygon> = area
        .iter()
        .map(|p| {
            Polygon::from_points(
                p.points()
                    .iter()
                    .map(|&pt| rotate_point(pt, cos_a, sin_a))
                    .collect(),
            )
        })
        .collect();

    let bbox = crate::geometry::get_extents(&rotated);
    if bbox.is_empty() {
        return Vec::new();
    }

    let mut result = Vec::new();
    let mut y = bbox.min.y + spacing / 2;
    let mut scanline_idx = 0usize;
    while y < bbox.max.y {
        // Even-odd intersection xs of the scanline with every edge.
        let mut xs: Vec<Coord> = Vec::new();
        for polygon in &rotated {
            let pts = polygon.points();
            for i in 0..pts.len() {
                let a = pts[i];
                let b = pts[(i + 1) % pts.len()];
                if (a.y > y) != (b.y > y) {
                    let t = (y - a.y) as f64 / (b.y - a.y) as f64;
                    xs.push(a.x + ((b.x - a.x) as f64 * t).round() as Coord);
                }
            }
        }
        xs.sort_unstable();
        let mut spans: Vec<(Coord, Coord)> = xs.chunks_exact(2).map(|c| (c[0], c[1])).collect();
        if zig_zag && scanline_idx % 2 == 1 {
            spans.reverse();
        }
        for (x0, x1) in spans {
            if x1 <= x0 {
                continue;
            }
            let (sx0, sx1) = if zig_zag && scanline_idx % 2 == 1 {
                (x1, x0)
            } else {
                (x0, x1)
            };
            // Rotate back to the original frame.
            let a = rotate_point(Point::new(sx0, y), cos_a, -sin_a);
            let b = rotate_point(Point::new(sx1, y), cos_a, -sin_a);
            result.push(Polyline::from_points(vec![a, b]));
        }
        y += spacing;
        scanline_idx += 1;
    }
    result
}

fn concentric_fill(area: &[Polygon], spacing: Coord) -> Polylines {
    let mut result = Vec::new();
    let mut current = area.to_vec();
    // Bounded by the largest possible inset count for the area.
    for _ in 0..10_000 {
        let rings = to_polylines(&current);
        if rings.is_empty() {
            break;
        }
        result.extend(rings);
        current = crate::clipper::offset(&current, -spacing, crate::clipper::OffsetJoin::Round);
        if current.is_empty() {
            break;
        }
    }
    result
}

/// Fallback used when a pattern produces nothing for a non-empty area:
/// the area outline itself as polylines.
pub fn outline_fallback(area: &[Polygon]) -> Polylines {
    to_polylines(area)
}

/// Debug helper: check that polylines stay inside the area.
#[cfg(test)]
fn polylines_inside(lines: &[Polyline], area: &[Polygon]) -> bool {
    lines.iter().all(|line| {
        line.points()
            .iter()
            .all(|&p| crate::geometry::contains(area, p) || on_boundary(area, p))
    })
}

#[cfg(test)]
fn on_boundary(area: &[Polygon], p: Point) -> bool {
    area.iter()
        .any(|poly| poly.distance_to_point_squared(p) < (crate::scale(0.01) as i128).pow(2))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scale;

    fn square_mm(size: f64) -> Polygon {
        Polygon::rectangle(
            Point::zero(),
            Point::new(scale(size), scale(size)),
        )
    }

    #[test]
    fn lines_fill_covers_square() {
        let filler = SupportLineFiller::new();
        let area = vec![square_mm(10.0)];
        let lines = filler.fill(&area, FillPattern::Lines, scale(2.0), 0.0, 0);
        // 10mm / 2mm spacing ~ 5 scanlines.
        assert!(lines.len() >= 4 && lines.len() <= 6, "{}", lines.len());
        assert!(polylines_inside(&lines, &area));
    }

    #[test]
    fn lines_fill_respects_holes() {
        let outer = square_mm(10.0);
        let hole = Polygon::rectangle(
            Point::new(scale(3.0), scale(3.0)),
            Point::new(scale(7.0), scale(7.0)),
        );
        let area = vec![outer, hole];
        let filler = SupportLineFiller::new();
        let lines = filler.fill(&area, FillPattern::Lines, scale(1.0), 0.0, 0);
        assert!(!lines.is_empty());
        // No line midpoint may fall inside the hole.
        for line in &lines {
            let a = line.points()[0];
            let b = line.points()[1];
            let mid = Point::new((a.x + b.x) / 2, (a.y + b.y) / 2);
            assert!(
                crate::geometry::contains(&area, mid) || on_boundary(&area, mid),
                "line crosses hole"
            );
        }
    }

    #[test]
    fn alternating_layer_angle() {
        let filler = SupportLineFiller::new();
        let area = vec![square_mm(10.0)];
        let even = filler.fill(&area, FillPattern::Lines, scale(2.0), 0.0, 0);
        let odd = filler.fill(&area, FillPattern::Lines, scale(2.0), 0.0, 1);
        // Layer 0 lines are horizontal, layer 1 vertical.
        let horiz = even[0].points()[0].y == even[0].points()[1].y;
        let vert = odd[0].points()[0].x == odd[0].points()[1].x;
        assert!(horiz);
        assert!(vert);
    }

    #[test]
    fn concentric_fill_produces_rings() {
        let filler = SupportLineFiller::new();
        let area = vec![square_mm(10.0)];
        let rings = filler.fill(&area, FillPattern::Concentric, scale(1.0), 0.0, 0);
        assert!(rings.len() >= 3);
        for ring in &rings {
            assert!(ring.is_closed());
        }
    }

    #[test]
    fn empty_area_yields_nothing() {
        let filler = SupportLineFiller::new();
        assert!(filler
            .fill(&[], FillPattern::Lines, scale(1.0), 0.0, 0)
            .is_empty());
    }

    #[test]
    fn outline_fallback_matches_contours() {
        let area = vec![square_mm(5.0)];
        let fallback = outline_fallback(&area);
        assert_eq!(fallback.len(), 1);
        assert!(fallback[0].is_closed());
    }
}
