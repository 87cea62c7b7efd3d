//! Polygon-with-holes used for layer outlines.

use super::{BoundingBox, Point, Polygon, Polygons};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A contour with zero or more holes.
///
/// The contour is counter-clockwise, holes clockwise. Layer outlines are
/// handed to the pipeline in this form; internally influence areas are
/// flattened to plain polygon sets.
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExPolygon {
    pub contour: Polygon,
    pub holes: Polygons,
}

/// A set of polygons with holes.
pub type ExPolygons = Vec<ExPolygon>;

impl ExPolygon {
    #[inline]
    pub fn new(contour: Polygon) -> Self {
        Self {
            contour,
            holes: Vec::new(),
        }
    }

    #[inline]
    pub fn with_holes(contour: Polygon, holes: Polygons) -> Self {
        Self { contour, holes }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.contour.is_empty()
    }

    /// Net area (contour minus holes), in squared scaled units.
    pub fn area(&self) -> f64 {
        let mut area = self.contour.area();
        for hole in &self.holes {
            area -= hole.area();
        }
        area
    }

    /// True if the point is inside the contour and outside all holes.
    pub fn contains_point(&self, point: Point) -> bool {
        if !self.contour.contains_point(point) {
            return false;
        }
        !self.holes.iter().any(|h| h.contains_point(point))
    }

    pub fn bounding_box(&self) -> BoundingBox {
        self.contour.bounding_box()
    }

    /// Flatten into a ring list (contour first, then holes).
    pub fn to_polygons(&self) -> Polygons {
        let mut out = Vec::with_capacity(1 + self.holes.len());
        out.push(self.contour.clone());
        out.extend(self.holes.iter().cloned());
        out
    }
}

impl fmt::Debug for ExPolygon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ExPolygon[{} pts, {} holes]",
            self.contour.len(),
            self.holes.len()
        )
    }
}

impl From<Polygon> for ExPolygon {
    fn from(contour: Polygon) -> Self {
        Self::new(contour)
    }
}

/// Flatten a set of ExPolygons into a ring list.
pub fn expolygons_to_polygons(expolygons: &[ExPolygon]) -> Polygons {
    let mut out = Vec::new();
    for ex in expolygons {
        out.push(ex.contour.clone());
        out.extend(ex.holes.iter().cloned());
    }
    out
}
