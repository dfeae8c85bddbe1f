//! The per-frame orchestration of the tessellation core.
//!
//! All systems run in one `PostUpdate` chain: height map ingestion, dirty
//! rectangle application, variance recomputation, tessellation and mesh
//! emission. The ordering is load-bearing; in particular variance
//! recomputation must never overlap a tessellation pass reading the same
//! tables, and the pool reset-and-grow step must not overlap any in-flight
//! tessellation.

use crate::{
    height_map::HeightMap,
    terrain::{Terrain, TerrainConfig},
    terrain_view::{TerrainView, TerrainViewComponents, TerrainViewConfig},
    tessellation::{Patch, PatchBorders, TessellationParams, TriPools},
};
use bevy::{
    math::URect,
    prelude::*,
    render::{mesh::Indices, render_asset::RenderAssetUsages, render_resource::PrimitiveTopology},
    tasks::{ComputeTaskPool, TaskPool},
};
use itertools::iproduct;

/// The patches of one terrain as tessellated for one view.
pub struct PatchGrid {
    pub(crate) patches: Vec<Patch>,
    borders: Vec<PatchBorders>,
    pub(crate) count: UVec2,
    last_camera_position: Vec3,
    force: bool,
    changed: bool,
}

impl PatchGrid {
    fn new(config: &TerrainConfig, height_map: &HeightMap) -> Self {
        let count = config.patch_count(height_map.samples());
        let full = URect::from_corners(
            UVec2::ZERO,
            height_map.samples().max(UVec2::ONE) - UVec2::ONE,
        );

        let mut patches = Vec::with_capacity((count.x * count.y) as usize);
        let mut borders = Vec::with_capacity(patches.capacity());

        for (y, x) in iproduct!(0..count.y, 0..count.x) {
            let mut patch = Patch::new(UVec2::new(x, y) * config.patch_size, config);
            patch.update_height_map(height_map, full);
            patches.push(patch);

            let mut edges = PatchBorders::empty();
            if x == 0 {
                edges |= PatchBorders::LEFT;
            }
            if x + 1 == count.x {
                edges |= PatchBorders::RIGHT;
            }
            if y == 0 {
                edges |= PatchBorders::TOP;
            }
            if y + 1 == count.y {
                edges |= PatchBorders::BOTTOM;
            }
            borders.push(edges);
        }

        Self {
            patches,
            borders,
            count,
            last_camera_position: Vec3::INFINITY,
            force: true,
            changed: false,
        }
    }

    pub fn patches(&self) -> &[Patch] {
        &self.patches
    }
}

/// The mesh assets emitted for one (terrain, view) combination.
///
/// Handles stay stable across frames; the underlying meshes are replaced
/// whenever tessellation changed the tree shape.
#[derive(Default)]
pub struct TerrainMeshes {
    pub surfaces: Vec<Handle<Mesh>>,
    pub skirts: Vec<Handle<Mesh>>,
}

/// Builds a [`PatchGrid`] for every registered (terrain, view) combination
/// whose terrain has height samples, and allocates the pools of its pass.
pub fn initialize_patch_grids(
    view_configs: Res<TerrainViewComponents<TerrainViewConfig>>,
    mut patch_grids: ResMut<TerrainViewComponents<PatchGrid>>,
    mut pools: ResMut<TriPools>,
    terrains: Query<(&TerrainConfig, &HeightMap), With<Terrain>>,
) {
    for (&(terrain, view), view_config) in view_configs.iter() {
        if patch_grids.contains_key(&(terrain, view)) {
            continue;
        }
        let Ok((config, height_map)) = terrains.get(terrain) else {
            continue;
        };

        let workers = ComputeTaskPool::get_or_init(TaskPool::default).thread_num().max(1);
        pools.ensure_pass(view_config.pass, config.pool_size, workers);

        patch_grids.insert((terrain, view), PatchGrid::new(config, height_map));
    }
}

/// Applies the changed height rectangles to all patch vertex caches.
pub fn update_height_maps(
    mut patch_grids: ResMut<TerrainViewComponents<PatchGrid>>,
    mut terrains: Query<(Entity, &mut HeightMap), With<Terrain>>,
) {
    for (terrain, mut height_map) in &mut terrains {
        let changed = height_map.take_changed();
        if changed.is_empty() {
            continue;
        }

        for (&(grid_terrain, _view), grid) in patch_grids.iter_mut() {
            if grid_terrain != terrain {
                continue;
            }

            let mut touched = false;
            for &rect in &changed {
                for patch in &mut grid.patches {
                    touched |= patch.update_height_map(&height_map, rect);
                }
            }

            grid.force |= touched;
        }
    }
}

/// Recomputes the variance tables of all dirty patches.
///
/// Runs strictly before [`tessellate_terrains`], which consumes the tables.
pub fn compute_variances(mut patch_grids: ResMut<TerrainViewComponents<PatchGrid>>) {
    for (_, grid) in patch_grids.iter_mut() {
        let mut recomputed = false;

        for patch in &mut grid.patches {
            if patch.is_dirty() {
                patch.compute_variance();
                recomputed = true;
            }
        }

        grid.force |= recomputed;
    }
}

/// Retessellates every (terrain, view) whose camera moved, whose height data
/// changed or whose pass pools were regrown.
///
/// Patches are split across the worker pools of the view's pass and
/// tessellated in parallel; one patch is always sequential within a worker.
pub fn tessellate_terrains(
    mut pools: ResMut<TriPools>,
    view_configs: Res<TerrainViewComponents<TerrainViewConfig>>,
    mut patch_grids: ResMut<TerrainViewComponents<PatchGrid>>,
    terrains: Query<&HeightMap, With<Terrain>>,
    views: Query<&GlobalTransform, With<TerrainView>>,
) {
    // the serialized reset-and-grow step; observes the previous frame's
    // exhaustion before any new tessellation starts
    pools.reset_all();

    for (&(terrain, view), view_config) in view_configs.iter() {
        let Some(grid) = patch_grids.get_mut(&(terrain, view)) else {
            continue;
        };
        let Ok(height_map) = terrains.get(terrain) else {
            continue;
        };
        let Ok(view_transform) = views.get(view) else {
            continue;
        };

        let camera_position = view_transform.translation();
        let moved = camera_position.distance(grid.last_camera_position)
            > view_config.retessellation_distance;

        if !(grid.force || moved || pools.pass_grew(view_config.pass)) {
            continue;
        }

        grid.last_camera_position = camera_position;
        grid.force = false;

        let params = TessellationParams {
            camera_position,
            view_radius: view_config.view_radius,
            lod_falloff: view_config.lod_falloff,
            variance_ceiling: view_config.variance_ceiling,
            mid_height: (height_map.min_height() + height_map.max_height()) * 0.5,
        };

        let worker_pools = pools.pass_pools_mut(view_config.pass);
        if worker_pools.is_empty() || grid.patches.is_empty() {
            continue;
        }

        let chunk_size = grid.patches.len().div_ceil(worker_pools.len());
        let params = &params;
        let patch_chunks = grid.patches.chunks_mut(chunk_size);
        let border_chunks = grid.borders.chunks(chunk_size);

        let complete = ComputeTaskPool::get_or_init(TaskPool::default)
            .scope(|scope| {
                for (pool, (patches, borders)) in
                    worker_pools.iter_mut().zip(patch_chunks.zip(border_chunks))
                {
                    scope.spawn(async move {
                        let mut complete = true;

                        for (patch, &borders) in patches.iter_mut().zip(borders) {
                            patch.reset();
                            complete &= patch.tessellate(pool, params);
                            patch.generate_indices(pool);
                            patch.generate_skirt(pool, borders);
                        }

                        complete
                    });
                }
            })
            .into_iter()
            .all(|complete| complete);

        if !complete {
            // not an error; the pools grow at the next reset
            debug!("terrain tessellation ran out of nodes, detail reduced this frame");
        }

        grid.changed = true;
    }
}

/// Publishes fresh surface and skirt meshes for every grid whose tree shape
/// changed.
pub fn update_terrain_meshes(
    mut meshes: ResMut<Assets<Mesh>>,
    mut patch_grids: ResMut<TerrainViewComponents<PatchGrid>>,
    mut terrain_meshes: ResMut<TerrainViewComponents<TerrainMeshes>>,
) {
    for (&key, grid) in patch_grids.iter_mut() {
        if !grid.changed {
            continue;
        }
        grid.changed = false;

        let output = terrain_meshes.entry(key).or_default();

        for (index, patch) in grid.patches.iter().enumerate() {
            let surface = surface_mesh(patch);
            let skirt = skirt_mesh(patch);

            if let Some(handle) = output.surfaces.get(index) {
                meshes.insert(handle, surface);
            } else {
                output.surfaces.push(meshes.add(surface));
            }

            if let Some(handle) = output.skirts.get(index) {
                meshes.insert(handle, skirt);
            } else {
                output.skirts.push(meshes.add(skirt));
            }
        }
    }
}

fn surface_mesh(patch: &Patch) -> Mesh {
    let positions: Vec<[f32; 3]> = patch
        .positions()
        .iter()
        .map(|position| position.to_array())
        .collect();

    let mut mesh = Mesh::new(PrimitiveTopology::TriangleList, RenderAssetUsages::default());
    mesh.insert_attribute(Mesh::ATTRIBUTE_POSITION, positions);
    mesh.insert_indices(Indices::U32(patch.indices().to_vec()));
    mesh.compute_smooth_normals();
    mesh
}

fn skirt_mesh(patch: &Patch) -> Mesh {
    let skirt = patch.skirt();
    let positions: Vec<[f32; 3]> = skirt
        .positions
        .iter()
        .map(|position| position.to_array())
        .collect();

    let mut mesh = Mesh::new(PrimitiveTopology::TriangleList, RenderAssetUsages::default());
    mesh.insert_attribute(Mesh::ATTRIBUTE_POSITION, positions);
    mesh.insert_attribute(Mesh::ATTRIBUTE_COLOR, skirt.colors.clone());
    mesh
}
