//! Tree support generation core for FDM 3D printing.
//!
//! Given an object sliced into horizontal layers, this crate computes a
//! branching, tree-like scaffold of support material that holds up
//! overhanging regions, connecting them to the build plate or to surfaces
//! of the object itself.
//!
//! The pipeline is a serial chain of internally-parallel stages:
//!
//! 1. **Overhang extraction** ([`support::overhang`]): per-layer
//!    differencing that finds unsupported regions.
//! 2. **Tip placement** ([`support::tips`]): sampling support points along
//!    overhang contours and classifying them by which avoidance zones they
//!    escape.
//! 3. **Influence propagation** ([`support::propagate`]): a top-down sweep
//!    growing 2D "influence" polygons layer by layer.
//! 4. **Merging** ([`support::merge`]): unioning overlapping influence
//!    areas of a layer through a bucketed divide-and-conquer pass.
//! 5. **Node resolution** ([`support::resolve`]): picking one branch
//!    center inside every influence area, bottom up.
//! 6. **Rendering**: either per-layer ovalised polygons
//!    ([`support::draw`], classic style) or a sliced tube mesh
//!    ([`support::organic`] + [`support::branch_mesh`], organic style).
//! 7. **Finalization** ([`support::finalize`]): reconciling the base /
//!    top-contact / bottom-contact polygon channels.
//!
//! All 2D geometry uses scaled integer coordinates (see [`scale`] /
//! [`unscale`]); polygon booleans go through [`clipper`]. Collision and
//! avoidance queries are answered by the memoized
//! [`volumes::TreeModelVolumes`], or any other [`volumes::VolumeOracle`]
//! implementation.

pub mod clipper;
pub mod error;
pub mod geometry;
pub mod infill;
pub mod mesh;
pub mod support;
pub mod volumes;

pub use error::{CancelToken, DiagnosticsContext, TreeSupportError, TreeSupportResult};

/// Scaled integer coordinate type. 1 unit = 1 nanometer.
pub type Coord = i64;

/// Floating point coordinate type, in millimeters.
pub type CoordF = f64;

/// Layer index type. Layer 0 is the first printed layer.
pub type LayerIndex = usize;

/// Scaling factor between millimeters and scaled integer units.
pub const SCALING_FACTOR: CoordF = 1_000_000.0;

/// Maximum admissible coordinate magnitude in scaled units.
///
/// Anything above this is a programming error upstream (the clipper
/// backend starts losing precision long before i64 overflows).
pub const MAX_COORD: Coord = 1 << 30;

/// Convert millimeters to scaled integer units.
#[inline]
pub fn scale(mm: CoordF) -> Coord {
    (mm * SCALING_FACTOR).round() as Coord
}

/// Convert scaled integer units to millimeters.
#[inline]
pub fn unscale(scaled: Coord) -> CoordF {
    scaled as CoordF / SCALING_FACTOR
}

/// Squared tiny-area threshold in squared scaled units.
///
/// Influence areas represent admissible branch center points and can be
/// arbitrarily thin; polygons whose area falls below this are treated as
/// empty everywhere in the pipeline.
pub const TINY_AREA_THRESHOLD: f64 = (0.001 * SCALING_FACTOR) * (0.001 * SCALING_FACTOR);

/// Check a single coordinate value against the admissible range.
#[inline]
pub fn coord_in_range(v: Coord) -> bool {
    v > -MAX_COORD && v < MAX_COORD
}

/// Validate that a point lies in the admissible coordinate range, failing
/// fast with the name of the offending operation.
#[inline]
pub fn validate_range(pt: &geometry::Point, operation: &'static str) -> Result<(), TreeSupportError> {
    if coord_in_range(pt.x) && coord_in_range(pt.y) {
        Ok(())
    } else {
        Err(TreeSupportError::CoordinateOverflow { operation })
    }
}
