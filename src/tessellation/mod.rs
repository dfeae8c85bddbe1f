//! The ROAM tessellation core.
//!
//! Each terrain patch is represented as a pair of binary triangle trees that
//! are re-split every tessellation pass until the triangulation density
//! matches a view-dependent error metric. Tree nodes are carved in pairs from
//! a per-worker [`TriNodePool`] and discarded wholesale when the pool resets,
//! so the hot split path never touches the heap.
//!
//! Refinement is driven by precomputed variance tables: one conservative
//! error estimate per tree position, recomputed only when the height samples
//! change and reused across many passes. Running out of pool nodes merely
//! truncates refinement for the rest of the frame; the pools then grow at the
//! next reset.

pub mod patch;
pub mod tri_pool;

pub use patch::{Patch, PatchBorders, SkirtGeometry};
pub use tri_pool::{TriNode, TriNodePool, TriPools, TriRef};

use bevy::prelude::*;

/// The camera-derived inputs of one tessellation pass.
#[derive(Clone, Copy, Debug)]
pub struct TessellationParams {
    pub camera_position: Vec3,
    /// Radius of the detailed region around the view.
    pub view_radius: f32,
    /// Fall-off divisor of the camera-distance factor; increase to reduce
    /// detail in the distance.
    pub lod_falloff: f32,
    /// Fraction of the view radius used as the tracked variance ceiling.
    pub variance_ceiling: f32,
    /// Approximate terrain height, used for the patch center distance.
    pub mid_height: f32,
}
