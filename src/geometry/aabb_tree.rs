//! Bounding-box trees for spatial acceleration.
//!
//! Two variants back the support pipeline:
//!
//! - [`BoxTree`]: built over the bounding boxes of influence areas before
//!   merging. Building **reorders the input slice** so tree leaves are
//!   contiguous, which lets the merger bucket spatially-near elements by
//!   slicing the array.
//! - [`SegmentTree`]: a distance-query tree over 2D line segments (in mm),
//!   used by the organic nudging pass to find the deepest penetration of a
//!   collision sphere into a layer outline.
//!
//! Both are balanced binary trees with implicit indexing: children of node
//! `i` live at `2*i + 1` and `2*i + 2`.

use super::{BoundingBox, PointF};
use crate::CoordF;

/// Balanced tree over axis-aligned boxes that sorts its input in place.
#[derive(Debug, Default)]
pub struct BoxTree {
    nodes: Vec<BoundingBox>,
}

impl BoxTree {
    /// Build the tree, reordering `items` so leaves are contiguous.
    ///
    /// Splitting is by the longer axis of the combined box, around the
    /// median element, so adjacent ranges of the reordered slice cover
    /// compact regions of the plane.
    pub fn build_modify_input<T>(items: &mut [T], bbox_of: impl Fn(&T) -> BoundingBox + Copy) -> Self {
        let mut tree = Self { nodes: Vec::new() };
        if items.is_empty() {
            return tree;
        }
        // Complete binary tree over n leaves needs < 4n implicit slots.
        tree.nodes
            .resize(4 * items.len().next_power_of_two(), BoundingBox::new());
        tree.build_recursive(items, 0, bbox_of);
        tree
    }

    fn build_recursive<T>(
        &mut self,
        items: &mut [T],
        node: usize,
        bbox_of: impl Fn(&T) -> BoundingBox + Copy,
    ) {
        let mut bbox = BoundingBox::new();
        for item in items.iter() {
            bbox.merge(&bbox_of(item));
        }
        if node < self.nodes.len() {
            self.nodes[node] = bbox;
        }
        if items.len() <= 1 {
            return;
        }
        let split_x = bbox.width() >= bbox.height();
        let mid = items.len() / 2;
        items.select_nth_unstable_by_key(mid, |item| {
            let c = bbox_of(item).center();
            if split_x {
                c.x
            } else {
                c.y
            }
        });
        let (left, right) = items.split_at_mut(mid);
        self.build_recursive(left, 2 * node + 1, bbox_of);
        self.build_recursive(right, 2 * node + 2, bbox_of);
    }

    pub fn root_bbox(&self) -> BoundingBox {
        self.nodes.first().copied().unwrap_or_default()
    }
}

/// A line segment in millimeter coordinates.
#[derive(Debug, Clone, Copy)]
pub struct Segment {
    pub a: PointF,
    pub b: PointF,
}

impl Segment {
    pub fn new(a: PointF, b: PointF) -> Self {
        Self { a, b }
    }

    /// Closest point on this segment to `p` and the squared distance.
    fn closest_point(&self, p: PointF) -> (CoordF, PointF) {
        let d = self.b - self.a;
        let len2 = d.dot(&d);
        if len2 < 1e-24 {
            let diff = p - self.a;
            return (diff.dot(&diff), self.a);
        }
        let t = ((p - self.a).dot(&d) / len2).clamp(0.0, 1.0);
        let c = self.a + d * t;
        let diff = p - c;
        (diff.dot(&diff), c)
    }
}

#[derive(Debug, Clone, Copy)]
struct BoxF {
    min: PointF,
    max: PointF,
}

impl BoxF {
    fn empty() -> Self {
        Self {
            min: PointF::new(CoordF::MAX, CoordF::MAX),
            max: PointF::new(CoordF::MIN, CoordF::MIN),
        }
    }

    fn merge_point(&mut self, p: PointF) {
        self.min.x = self.min.x.min(p.x);
        self.min.y = self.min.y.min(p.y);
        self.max.x = self.max.x.max(p.x);
        self.max.y = self.max.y.max(p.y);
    }

    fn merge_segment(&mut self, s: &Segment) {
        self.merge_point(s.a);
        self.merge_point(s.b);
    }

    /// Squared distance from a point to this box (0 inside).
    fn distance_squared(&self, p: PointF) -> CoordF {
        let dx = (self.min.x - p.x).max(0.0).max(p.x - self.max.x);
        let dy = (self.min.y - p.y).max(0.0).max(p.y - self.max.y);
        dx * dx + dy * dy
    }
}

/// Distance-query tree over 2D segments.
#[derive(Debug)]
pub struct SegmentTree {
    segments: Vec<Segment>,
    nodes: Vec<BoxF>,
    // (offset, len) ranges of `segments` per implicit node.
    ranges: Vec<(usize, usize)>,
}

impl SegmentTree {
    pub fn build(mut segments: Vec<Segment>) -> Self {
        let n = segments.len();
        let slots = if n == 0 { 0 } else { 4 * n.next_power_of_two() };
        let mut tree = Self {
            segments: Vec::new(),
            nodes: vec![BoxF::empty(); slots],
            ranges: vec![(0, 0); slots],
        };
        if n > 0 {
            tree.build_recursive(&mut segments, 0, 0);
        }
        tree.segments = segments;
        tree
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    fn build_recursive(&mut self, segments: &mut [Segment], node: usize, offset: usize) {
        let mut bbox = BoxF::empty();
        for s in segments.iter() {
            bbox.merge_segment(s);
        }
        self.nodes[node] = bbox;
        self.ranges[node] = (offset, segments.len());
        if segments.len() <= 4 {
            return;
        }
        let split_x = (bbox.max.x - bbox.min.x) >= (bbox.max.y - bbox.min.y);
        let mid = segments.len() / 2;
        segments.select_nth_unstable_by(mid, |l, r| {
            let (lc, rc) = if split_x {
                (l.a.x + l.b.x, r.a.x + r.b.x)
            } else {
                (l.a.y + l.b.y, r.a.y + r.b.y)
            };
            lc.partial_cmp(&rc).unwrap_or(std::cmp::Ordering::Equal)
        });
        let (left, right) = segments.split_at_mut(mid);
        self.build_recursive(left, 2 * node + 1, offset);
        self.build_recursive(right, 2 * node + 2, offset + mid);
    }

    /// Closest point on any segment within `sqrt(max_dist2)` of the query.
    ///
    /// Returns `(distance, closest point)` or None if nothing is within
    /// range.
    pub fn closest_point_within(&self, query: PointF, max_dist2: CoordF) -> Option<(CoordF, PointF)> {
        if self.segments.is_empty() {
            return None;
        }
        let mut best: Option<(CoordF, PointF)> = None;
        let mut best_d2 = max_dist2;
        self.query_recursive(0, query, &mut best_d2, &mut best);
        best.map(|(d2, p)| (d2.sqrt(), p))
    }

    fn query_recursive(
        &self,
        node: usize,
        query: PointF,
        best_d2: &mut CoordF,
        best: &mut Option<(CoordF, PointF)>,
    ) {
        if node >= self.nodes.len() {
            return;
        }
        let (offset, len) = self.ranges[node];
        if len == 0 || self.nodes[node].distance_squared(query) > *best_d2 {
            return;
        }
        if len <= 4 {
            for s in &self.segments[offset..offset + len] {
                let (d2, p) = s.closest_point(query);
                if d2 <= *best_d2 {
                    *best_d2 = d2;
                    *best = Some((d2, p));
                }
            }
            return;
        }
        self.query_recursive(2 * node + 1, query, best_d2, best);
        self.query_recursive(2 * node + 2, query, best_d2, best);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Point;

    #[test]
    fn box_tree_groups_near_items() {
        // Two clusters far apart; after the build each half of the slice
        // should hold one cluster.
        let mut items: Vec<BoundingBox> = vec![
            BoundingBox::from_min_max(Point::new(0, 0), Point::new(10, 10)),
            BoundingBox::from_min_max(Point::new(1000, 0), Point::new(1010, 10)),
            BoundingBox::from_min_max(Point::new(5, 5), Point::new(15, 15)),
            BoundingBox::from_min_max(Point::new(1005, 5), Point::new(1015, 15)),
        ];
        let tree = BoxTree::build_modify_input(&mut items, |b| *b);
        assert!(!tree.root_bbox().is_empty());
        let left_max: i64 = items[..2].iter().map(|b| b.max.x).max().unwrap();
        let right_min: i64 = items[2..].iter().map(|b| b.min.x).min().unwrap();
        assert!(
            left_max < right_min || right_min > 500,
            "clusters were not separated: {items:?}"
        );
    }

    #[test]
    fn segment_tree_finds_closest() {
        let segments = vec![
            Segment::new(PointF::new(0.0, 0.0), PointF::new(10.0, 0.0)),
            Segment::new(PointF::new(0.0, 5.0), PointF::new(10.0, 5.0)),
        ];
        let tree = SegmentTree::build(segments);
        let (dist, closest) = tree
            .closest_point_within(PointF::new(5.0, 1.0), 100.0)
            .unwrap();
        assert!((dist - 1.0).abs() < 1e-9);
        assert!((closest.y - 0.0).abs() < 1e-9);
    }

    #[test]
    fn segment_tree_range_limit() {
        let segments = vec![Segment::new(PointF::new(0.0, 0.0), PointF::new(1.0, 0.0))];
        let tree = SegmentTree::build(segments);
        assert!(tree
            .closest_point_within(PointF::new(0.5, 10.0), 4.0)
            .is_none());
    }

    #[test]
    fn segment_tree_many_segments() {
        // A circle of segments; nearest point from the center is radius away.
        let mut segments = Vec::new();
        let n = 64;
        for i in 0..n {
            let a0 = std::f64::consts::TAU * i as f64 / n as f64;
            let a1 = std::f64::consts::TAU * (i + 1) as f64 / n as f64;
            segments.push(Segment::new(
                PointF::new(3.0 * a0.cos(), 3.0 * a0.sin()),
                PointF::new(3.0 * a1.cos(), 3.0 * a1.sin()),
            ));
        }
        let tree = SegmentTree::build(segments);
        let (dist, _) = tree
            .closest_point_within(PointF::new(0.0, 0.0), 100.0)
            .unwrap();
        assert!((dist - 3.0).abs() < 0.02);
    }
}
