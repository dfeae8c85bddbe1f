//! This crate provides continuously adapting terrain meshes for the Bevy
//! Engine, built on the classic ROAM (Realtime Optimally Adapting Mesh)
//! algorithm.
//!
//! # Background
//! A height field rendered naively needs one vertex per sample, which wastes
//! enormous amounts of geometry on flat or distant regions. ROAM instead
//! represents each square terrain patch as a pair of binary triangle trees
//! that are re-split every frame until the triangulation density matches a
//! view-dependent error metric.
//!
//! Two properties make this cheap enough to run per frame:
//!
//! ## Where do the triangles come from?
//! Tree nodes are carved in pairs from fixed-capacity
//! [`TriNodePool`](tessellation::TriNodePool)s, one per worker thread per
//! rendering pass, and discarded wholesale when a pool resets. The hot split
//! path therefore never allocates, and running out of nodes merely truncates
//! refinement for a frame. The pools observe their own exhaustion and grow at
//! the next reset, up to a fixed multiple of their initial budget.
//!
//! ## How is the error metric evaluated?
//! Every patch keeps one flat variance table per tree half: a conservative
//! per-node estimate of how far a straight hypotenuse deviates from the
//! sampled heights. The tables are recomputed only when the height samples
//! change and are reused across every tessellation pass in between, so the
//! per-frame work reduces to comparing precomputed variance against a
//! camera-distance factor.
//!
//! The [`TerrainPlugin`] wires these pieces into a single `PostUpdate` system
//! chain and publishes plain [`Mesh`](bevy::prelude::Mesh) assets per patch
//! (surface and border skirt), leaving materials and draw setup to the
//! application.

use crate::{
    height_map::{finish_height_map_loading, start_height_map_loading, HeightMapLoader},
    systems::{
        compute_variances, initialize_patch_grids, tessellate_terrains, update_height_maps,
        update_terrain_meshes, PatchGrid, TerrainMeshes,
    },
    terrain::{Terrain, TerrainConfig},
    terrain_view::{TerrainViewComponents, TerrainViewConfig},
    tessellation::TriPools,
};
use bevy::prelude::*;

pub mod height_map;
pub mod systems;
pub mod terrain;
pub mod terrain_view;
pub mod tessellation;

#[allow(missing_docs)]
pub mod prelude {
    #[doc(hidden)]
    pub use crate::{
        height_map::{HeightMap, HeightMapData, HeightMapLoader},
        systems::{PatchGrid, TerrainMeshes},
        terrain::{Terrain, TerrainConfig},
        terrain_view::{TerrainView, TerrainViewComponents, TerrainViewConfig},
        tessellation::{
            Patch, PatchBorders, SkirtGeometry, TessellationParams, TriNodePool, TriPools,
        },
        TerrainBundle, TerrainPlugin,
    };
}

#[derive(Bundle)]
pub struct TerrainBundle {
    pub terrain: Terrain,
    pub config: TerrainConfig,
    pub loader: HeightMapLoader,
}

impl TerrainBundle {
    pub fn new(config: TerrainConfig) -> Self {
        Self {
            terrain: Terrain,
            config,
            loader: HeightMapLoader::default(),
        }
    }
}

pub struct TerrainPlugin;

impl Plugin for TerrainPlugin {
    fn build(&self, app: &mut App) {
        app.init_resource::<TriPools>()
            .init_resource::<TerrainViewComponents<TerrainViewConfig>>()
            .init_resource::<TerrainViewComponents<PatchGrid>>()
            .init_resource::<TerrainViewComponents<TerrainMeshes>>()
            .add_systems(
                PostUpdate,
                (
                    start_height_map_loading,
                    finish_height_map_loading,
                    initialize_patch_grids,
                    update_height_maps,
                    compute_variances,
                    tessellate_terrains,
                    update_terrain_meshes,
                )
                    .chain(),
            );
    }
}
