use crate::{
    height_map::HeightMap,
    terrain::TerrainConfig,
    tessellation::{
        tri_pool::{TriNode, TriNodePool, TriRef},
        TessellationParams,
    },
};
use bevy::{math::URect, prelude::*};
use itertools::iproduct;
use std::mem;

/// Variance never reaches zero, so it always compares meaningfully against
/// the split threshold.
const VARIANCE_FLOOR: f32 = 0.001;

/// Triangles crossing the water line are assigned at least this variance,
/// so shorelines tessellate finely regardless of their raw height delta.
const SHORELINE_VARIANCE: f32 = 20.0;

/// Variance assumed for nodes deeper than the tracked tables. Large enough
/// to keep refinement going rather than silently stabilizing past the
/// cutoff.
const UNTRACKED_VARIANCE: f32 = 10.0;

bitflags::bitflags! {
    /// The patch edges that lie on the terrain boundary and receive skirts.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct PatchBorders: u8 {
        /// The `x = 0` column.
        const LEFT = 1 << 0;
        /// The `x = patch_size` column.
        const RIGHT = 1 << 1;
        /// The `z = 0` row.
        const TOP = 1 << 2;
        /// The `z = patch_size` row.
        const BOTTOM = 1 << 3;
    }
}

/// Vertical skirt geometry along the patch borders, hiding height-field
/// cracks at terrain boundaries when seen from below.
#[derive(Clone, Default)]
pub struct SkirtGeometry {
    pub positions: Vec<Vec3>,
    /// White at the surface, fading to transparent at the skirt bottom.
    pub colors: Vec<[f32; 4]>,
}

impl SkirtGeometry {
    fn clear(&mut self) {
        self.positions.clear();
        self.colors.clear();
    }

    fn push(&mut self, position: Vec3, color: [f32; 4]) {
        self.positions.push(position);
        self.colors.push(color);
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}

/// One square tile of the height field, tessellated independently.
///
/// A patch owns the two root triangles of its binary triangle trees, a
/// cached vertex buffer of `(patch_size + 1)²` positions, one variance table
/// per tree half and the index stream emitted by the last tessellation. All
/// other tree nodes are carved from a [`TriNodePool`] and discarded wholesale
/// whenever that pool resets.
pub struct Patch {
    /// Offset of this patch in the terrain's sample grid.
    offset: UVec2,
    /// Grid squares per side.
    size: u32,
    square_size: f32,
    variance_min_block: u32,
    skirt_depth: f32,

    // the roots persist for the patch's lifetime and are reset in place
    base_left: TriNode,
    base_right: TriNode,

    vertices: Vec<Vec3>,
    variance_left: Vec<f32>,
    variance_right: Vec<f32>,

    indices: Vec<u32>,
    skirt: SkirtGeometry,

    /// Height samples changed since the variance tables were computed.
    dirty: bool,

    variance_limit: f32,
    cam_dist_lod_factor: f32,
}

impl Patch {
    pub fn new(offset: UVec2, config: &TerrainConfig) -> Self {
        let size = config.patch_size;
        let mut vertices = Vec::with_capacity(((size + 1) * (size + 1)) as usize);

        for (z, x) in iproduct!(0..=size, 0..=size) {
            vertices.push(Vec3::new(
                (offset.x + x) as f32 * config.square_size,
                0.0,
                (offset.y + z) as f32 * config.square_size,
            ));
        }

        Self {
            offset,
            size,
            square_size: config.square_size,
            variance_min_block: config.variance_min_block,
            skirt_depth: config.skirt_depth,
            base_left: TriNode::default(),
            base_right: TriNode::default(),
            vertices,
            variance_left: vec![0.0; 1 << config.variance_depth],
            variance_right: vec![0.0; 1 << config.variance_depth],
            indices: Vec::new(),
            skirt: SkirtGeometry::default(),
            dirty: true,
            variance_limit: f32::MAX,
            cam_dist_lod_factor: 1.0,
        }
    }

    /// Returns both trees to their two-triangle base state.
    pub fn reset(&mut self) {
        self.base_left = TriNode::default();
        self.base_right = TriNode::default();

        // attach the two base triangles along their shared hypotenuse
        self.base_left.base_neighbor = TriRef::BASE_RIGHT;
        self.base_right.base_neighbor = TriRef::BASE_LEFT;
    }

    /// Copies the changed height samples into the vertex cache.
    ///
    /// `rect` is an inclusive sample rectangle in terrain coordinates;
    /// returns whether it touched this patch.
    pub fn update_height_map(&mut self, height_map: &HeightMap, rect: URect) -> bool {
        let min = rect.min.max(self.offset);
        let max = rect.max.min(self.offset + UVec2::splat(self.size));

        if min.x > max.x || min.y > max.y {
            return false;
        }

        for (z, x) in iproduct!(min.y..=max.y, min.x..=max.x) {
            let local = UVec2::new(x, z) - self.offset;
            let index = (local.y * (self.size + 1) + local.x) as usize;

            // only the height changes, x and z are fixed at construction
            self.vertices[index].y = height_map.sample(UVec2::new(x, z));
        }

        self.dirty = true;
        true
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn positions(&self) -> &[Vec3] {
        &self.vertices
    }

    pub fn indices(&self) -> &[u32] {
        &self.indices
    }

    pub fn skirt(&self) -> &SkirtGeometry {
        &self.skirt
    }

    fn node<'a>(&'a self, pool: &'a TriNodePool, tri: TriRef) -> &'a TriNode {
        if tri == TriRef::BASE_LEFT {
            &self.base_left
        } else if tri == TriRef::BASE_RIGHT {
            &self.base_right
        } else {
            pool.node(tri)
        }
    }

    fn node_mut<'a>(&'a mut self, pool: &'a mut TriNodePool, tri: TriRef) -> &'a mut TriNode {
        if tri == TriRef::BASE_LEFT {
            &mut self.base_left
        } else if tri == TriRef::BASE_RIGHT {
            &mut self.base_right
        } else {
            pool.node_mut(tri)
        }
    }

    fn height(&self, pos: IVec2) -> f32 {
        self.position(pos).y
    }

    fn position(&self, pos: IVec2) -> Vec3 {
        self.vertices[(pos.y * (self.size as i32 + 1) + pos.x) as usize]
    }

    /// Splits a triangle and links the children into the mesh, force-splitting
    /// the base neighbor where needed so that every split completes as part of
    /// a diamond.
    ///
    /// Returns `false` if the pool ran dry; the triangle then stays a leaf
    /// and any neighbor splits that did complete remain valid.
    fn split(&mut self, pool: &mut TriNodePool, tri: TriRef) -> bool {
        if self.node(pool, tri).is_branch() {
            return true;
        }

        // a triangle outside a proper diamond forces its base neighbor apart
        // first, which may re-point this triangle's own neighbor links
        let base = self.node(pool, tri).base_neighbor;
        if base.is_some() && self.node(pool, base).base_neighbor != tri {
            self.split(pool, base);
        }

        let Some((left_child, right_child)) = pool.allocate_pair() else {
            return false;
        };

        let TriNode {
            base_neighbor,
            left_neighbor,
            right_neighbor,
            ..
        } = *self.node(pool, tri);

        {
            let node = self.node_mut(pool, tri);
            node.left_child = left_child;
            node.right_child = right_child;
        }

        // the children inherit the outward neighbors and face each other
        {
            let child = self.node_mut(pool, left_child);
            child.base_neighbor = left_neighbor;
            child.left_neighbor = right_child;
        }
        {
            let child = self.node_mut(pool, right_child);
            child.base_neighbor = right_neighbor;
            child.right_neighbor = left_child;
        }

        // exactly one of the former left neighbor's links pointed here
        if left_neighbor.is_some() {
            let neighbor = self.node_mut(pool, left_neighbor);
            if neighbor.base_neighbor == tri {
                neighbor.base_neighbor = left_child;
            } else if neighbor.left_neighbor == tri {
                neighbor.left_neighbor = left_child;
            } else if neighbor.right_neighbor == tri {
                neighbor.right_neighbor = left_child;
            } else {
                debug_assert!(false, "left neighbor does not link back to the split triangle");
            }
        }

        if right_neighbor.is_some() {
            let neighbor = self.node_mut(pool, right_neighbor);
            if neighbor.base_neighbor == tri {
                neighbor.base_neighbor = right_child;
            } else if neighbor.right_neighbor == tri {
                neighbor.right_neighbor = right_child;
            } else if neighbor.left_neighbor == tri {
                neighbor.left_neighbor = right_child;
            } else {
                debug_assert!(false, "right neighbor does not link back to the split triangle");
            }
        }

        if base_neighbor.is_some() {
            if self.node(pool, base_neighbor).is_branch() {
                // the neighbor split first; cross-link the four children to
                // complete the diamond without recursing
                let TriNode {
                    left_child: base_left_child,
                    right_child: base_right_child,
                    ..
                } = *self.node(pool, base_neighbor);

                self.node_mut(pool, base_left_child).right_neighbor = right_child;
                self.node_mut(pool, base_right_child).left_neighbor = left_child;
                self.node_mut(pool, left_child).right_neighbor = base_right_child;
                self.node_mut(pool, right_child).left_neighbor = base_left_child;
            } else {
                // the other half of the diamond was not split yet, do so now
                self.split(pool, base_neighbor);
            }
        } else {
            // patch edge, the children face outward into nothing
            self.node_mut(pool, left_child).right_neighbor = TriRef::NONE;
            self.node_mut(pool, right_child).left_neighbor = TriRef::NONE;
        }

        true
    }

    /// Recomputes both variance trees from the cached heights.
    ///
    /// Must run whenever the height samples changed, strictly before the
    /// next tessellation that reads the tables.
    pub fn compute_variance(&mut self) {
        let size = self.size as i32;

        let mut table = mem::take(&mut self.variance_left);
        table.fill(0.0);
        let (left, right, apex) = (IVec2::new(0, size), IVec2::new(size, 0), IVec2::ZERO);
        let heights = [self.height(left), self.height(right), self.height(apex)];
        self.recurs_compute_variance(left, right, apex, heights, 1, &mut table);
        self.variance_left = table;

        let mut table = mem::take(&mut self.variance_right);
        table.fill(0.0);
        let (left, right, apex) = (IVec2::new(size, 0), IVec2::new(0, size), IVec2::splat(size));
        let heights = [self.height(left), self.height(right), self.height(apex)];
        self.recurs_compute_variance(left, right, apex, heights, 1, &mut table);
        self.variance_right = table;

        self.dirty = false;
    }

    /// The three heights are handed down the recursion instead of re-sampling
    /// the vertex cache; a node's final variance is the maximum of its own
    /// and both children's, an upper bound rather than an average.
    fn recurs_compute_variance(
        &self,
        left: IVec2,
        right: IVec2,
        apex: IVec2,
        heights: [f32; 3],
        node: usize,
        table: &mut [f32],
    ) -> f32 {
        let [left_height, right_height, apex_height] = heights;

        // the sampled height at the hypotenuse midpoint versus the
        // interpolation of its endpoints
        let mid = (left + right) / 2;
        let mid_height = self.height(mid);

        let mut variance = (mid_height - (left_height + right_height) * 0.5).abs();

        // shore lines get exaggerated variance for higher accuracy
        if left_height * right_height < 0.0
            || left_height * mid_height < 0.0
            || right_height * mid_height < 0.0
        {
            variance = (variance * 1.5).max(SHORELINE_VARIANCE);
        }

        // variance below a small block is not worth the LOD decision
        let block = self.variance_min_block as i32;
        if (left.x - right.x).abs() >= block || (left.y - right.y).abs() >= block {
            let left_variance = self.recurs_compute_variance(
                apex,
                left,
                mid,
                [apex_height, left_height, mid_height],
                node << 1,
                table,
            );
            let right_variance = self.recurs_compute_variance(
                right,
                apex,
                mid,
                [right_height, apex_height, mid_height],
                (node << 1) + 1,
                table,
            );

            variance = variance.max(left_variance).max(right_variance);
        }

        let variance = variance.max(VARIANCE_FLOOR);

        if node < table.len() {
            table[node] = variance;
        }

        variance
    }

    /// Refines both trees until the error metric is met or the pool runs dry.
    ///
    /// Returns whether the pool had room for the full refinement; `false` is
    /// a quality degradation, not a failure.
    pub fn tessellate(&mut self, pool: &mut TriNodePool, params: &TessellationParams) -> bool {
        let size = self.size as i32;

        let mid = Vec3::new(
            (self.offset.x + self.size / 2) as f32 * self.square_size,
            params.mid_height,
            (self.offset.y + self.size / 2) as f32 * self.square_size,
        );

        // farther camera and larger view radius yield less detail; the floor
        // keeps a very close camera from ever increasing it
        let mut factor = mid.distance(params.camera_position);
        factor *= params.lod_falloff / params.view_radius;
        factor = factor.max(1.0);
        self.cam_dist_lod_factor = 1.0 / factor;

        // clamps the tracked variance, so huge cliffs in the distance do not
        // tessellate regardless of the actual camera distance
        self.variance_limit = params.view_radius * params.variance_ceiling;

        let table = mem::take(&mut self.variance_left);
        self.recurs_tessellate(
            pool,
            TriRef::BASE_LEFT,
            IVec2::new(0, size),
            IVec2::new(size, 0),
            IVec2::ZERO,
            1,
            &table,
        );
        self.variance_left = table;

        let table = mem::take(&mut self.variance_right);
        self.recurs_tessellate(
            pool,
            TriRef::BASE_RIGHT,
            IVec2::new(size, 0),
            IVec2::new(0, size),
            IVec2::splat(size),
            1,
            &table,
        );
        self.variance_right = table;

        !pool.out_of_nodes()
    }

    #[allow(clippy::too_many_arguments)]
    fn recurs_tessellate(
        &mut self,
        pool: &mut TriNodePool,
        tri: TriRef,
        left: IVec2,
        right: IVec2,
        apex: IVec2,
        node: usize,
        variance: &[f32],
    ) {
        // already at single-quad resolution
        if (left.x - right.x).abs() <= 1 && (left.y - right.y).abs() <= 1 {
            return;
        }

        let mut tri_variance = UNTRACKED_VARIANCE;

        if node < variance.len() {
            let size = (left.x - right.x).abs().max((left.y - right.y).abs());

            // distance, variance and triangle footprint all factor in
            tri_variance = variance[node].min(self.variance_limit)
                * self.size as f32
                * size as f32
                * self.cam_dist_lod_factor;
        }

        if tri_variance <= 1.0 {
            return;
        }

        self.split(pool, tri);

        let current = *self.node(pool, tri);
        if current.is_branch() {
            let center = (left + right) / 2;

            self.recurs_tessellate(pool, current.left_child, apex, left, center, node << 1, variance);
            self.recurs_tessellate(
                pool,
                current.right_child,
                right,
                apex,
                center,
                (node << 1) + 1,
                variance,
            );
        }
    }

    /// Walks both trees' leaves in a fixed left-then-right order and emits
    /// their grid-corner indices. A pure read pass, valid any time after
    /// tessellation completes.
    pub fn generate_indices(&mut self, pool: &TriNodePool) {
        let size = self.size as i32;

        let mut indices = mem::take(&mut self.indices);
        indices.clear();

        self.recurs_render(
            pool,
            TriRef::BASE_LEFT,
            IVec2::new(0, size),
            IVec2::new(size, 0),
            IVec2::ZERO,
            &mut indices,
        );
        self.recurs_render(
            pool,
            TriRef::BASE_RIGHT,
            IVec2::new(size, 0),
            IVec2::new(0, size),
            IVec2::splat(size),
            &mut indices,
        );

        self.indices = indices;
    }

    fn recurs_render(
        &self,
        pool: &TriNodePool,
        tri: TriRef,
        left: IVec2,
        right: IVec2,
        apex: IVec2,
        indices: &mut Vec<u32>,
    ) {
        let node = *self.node(pool, tri);

        if node.is_leaf() {
            let pitch = self.size + 1;
            indices.push(apex.x as u32 + apex.y as u32 * pitch);
            indices.push(left.x as u32 + left.y as u32 * pitch);
            indices.push(right.x as u32 + right.y as u32 * pitch);
            return;
        }

        let center = (left + right) / 2;

        self.recurs_render(pool, node.left_child, apex, left, center, indices);
        self.recurs_render(pool, node.right_child, right, apex, center, indices);
    }

    /// Rebuilds the skirt geometry along the selected borders.
    ///
    /// Border vertices always belong to base-level triangles missing a
    /// neighbor on one side, so only those four traversals exist.
    pub fn generate_skirt(&mut self, pool: &TriNodePool, borders: PatchBorders) {
        let size = self.size as i32;

        let mut skirt = mem::take(&mut self.skirt);
        skirt.clear();

        let (left, right, apex) = (IVec2::new(0, size), IVec2::new(size, 0), IVec2::ZERO);
        if borders.contains(PatchBorders::LEFT) && self.base_left.left_neighbor.is_none() {
            self.recurs_skirt(pool, TriRef::BASE_LEFT, left, right, apex, 1, true, &mut skirt);
        }
        if borders.contains(PatchBorders::TOP) && self.base_left.right_neighbor.is_none() {
            self.recurs_skirt(pool, TriRef::BASE_LEFT, left, right, apex, 1, false, &mut skirt);
        }

        let (left, right, apex) = (IVec2::new(size, 0), IVec2::new(0, size), IVec2::splat(size));
        if borders.contains(PatchBorders::RIGHT) && self.base_right.left_neighbor.is_none() {
            self.recurs_skirt(pool, TriRef::BASE_RIGHT, left, right, apex, 1, true, &mut skirt);
        }
        if borders.contains(PatchBorders::BOTTOM) && self.base_right.right_neighbor.is_none() {
            self.recurs_skirt(pool, TriRef::BASE_RIGHT, left, right, apex, 1, false, &mut skirt);
        }

        self.skirt = skirt;
    }

    /// At even depths both children touch the patch edge and must be
    /// visited; at odd depths only one does and the bias flag selects it.
    #[allow(clippy::too_many_arguments)]
    fn recurs_skirt(
        &self,
        pool: &TriNodePool,
        tri: TriRef,
        left: IVec2,
        right: IVec2,
        apex: IVec2,
        depth: u32,
        left_child: bool,
        skirt: &mut SkirtGeometry,
    ) {
        let node = *self.node(pool, tri);

        if node.is_leaf() {
            let (from, to) = if depth % 2 == 0 {
                (self.position(left), self.position(right))
            } else if left_child {
                (self.position(apex), self.position(left))
            } else {
                (self.position(right), self.position(apex))
            };

            self.push_skirt_quad(skirt, from, to);
            return;
        }

        let center = (left + right) / 2;

        if depth % 2 == 0 {
            self.recurs_skirt(pool, node.left_child, apex, left, center, depth + 1, !left_child, skirt);
            self.recurs_skirt(pool, node.right_child, right, apex, center, depth + 1, left_child, skirt);
            return;
        }

        // force a left bias below odd depths so the recursion ends up at the
        // correct leaves
        if left_child {
            self.recurs_skirt(pool, node.left_child, apex, left, center, depth + 1, true, skirt);
        } else {
            self.recurs_skirt(pool, node.right_child, right, apex, center, depth + 1, true, skirt);
        }
    }

    fn push_skirt_quad(&self, skirt: &mut SkirtGeometry, from: Vec3, to: Vec3) {
        const SURFACE: [f32; 4] = [1.0, 1.0, 1.0, 1.0];
        const SUNKEN: [f32; 4] = [1.0, 1.0, 1.0, 0.0];

        let from_low = Vec3::new(from.x, self.skirt_depth, from.z);
        let to_low = Vec3::new(to.x, self.skirt_depth, to.z);

        skirt.push(from, SURFACE);
        skirt.push(from_low, SUNKEN);
        skirt.push(to, SURFACE);

        skirt.push(to, SURFACE);
        skirt.push(from_low, SUNKEN);
        skirt.push(to_low, SUNKEN);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn test_config(patch_size: u32, variance_depth: u32) -> TerrainConfig {
        TerrainConfig {
            patch_size,
            square_size: 1.0,
            variance_depth,
            ..default()
        }
    }

    fn test_patch(size: u32, depth: u32, height: impl FnMut(u32, u32) -> f32) -> Patch {
        let config = test_config(size, depth);
        let map = HeightMap::from_fn(UVec2::splat(size + 1), 1.0, height);

        let mut patch = Patch::new(UVec2::ZERO, &config);
        patch.update_height_map(&map, URect::new(0, 0, size, size));
        patch.compute_variance();
        patch.reset();
        patch
    }

    fn params(camera_position: Vec3) -> TessellationParams {
        TessellationParams {
            camera_position,
            view_radius: 300.0,
            lod_falloff: 300.0,
            variance_ceiling: 0.35,
            mid_height: 0.0,
        }
    }

    fn collect_nodes(patch: &Patch, pool: &TriNodePool) -> Vec<TriRef> {
        fn walk(patch: &Patch, pool: &TriNodePool, tri: TriRef, out: &mut Vec<TriRef>) {
            out.push(tri);
            let node = *patch.node(pool, tri);
            if node.is_branch() {
                walk(patch, pool, node.left_child, out);
                walk(patch, pool, node.right_child, out);
            }
        }

        let mut nodes = Vec::new();
        walk(patch, pool, TriRef::BASE_LEFT, &mut nodes);
        walk(patch, pool, TriRef::BASE_RIGHT, &mut nodes);
        nodes
    }

    fn assert_leaf_branch_duality(patch: &Patch, pool: &TriNodePool) {
        for tri in collect_nodes(patch, pool) {
            let node = patch.node(pool, tri);
            assert_eq!(
                node.left_child.is_some(),
                node.right_child.is_some(),
                "children must be present in pairs"
            );
        }
    }

    #[test]
    fn flat_patch_far_camera_stays_at_two_triangles() {
        let mut patch = test_patch(4, 12, |_, _| 0.0);
        let mut pool = TriNodePool::new(64);

        let complete = patch.tessellate(&mut pool, &params(Vec3::new(10_000.0, 0.0, 10_000.0)));
        patch.generate_indices(&pool);

        assert!(complete);
        assert_eq!(patch.indices().len(), 6);
    }

    #[test]
    fn base_triangle_winding_is_stable() {
        let mut patch = test_patch(4, 12, |_, _| 0.0);
        let mut pool = TriNodePool::new(64);

        patch.tessellate(&mut pool, &params(Vec3::new(10_000.0, 0.0, 10_000.0)));
        patch.generate_indices(&pool);

        // apex, left, right per base triangle, row-major vertex indices
        assert_eq!(patch.indices(), &[0, 20, 4, 24, 4, 20]);
    }

    #[test]
    fn spiked_corner_close_camera_refines() {
        let mut patch = test_patch(4, 12, |x, z| if x == 0 && z == 0 { 100.0 } else { 0.0 });
        let mut pool = TriNodePool::new(128);

        let mut close = params(Vec3::new(0.0, 80.0, 0.0));
        close.mid_height = 50.0;

        let complete = patch.tessellate(&mut pool, &close);
        patch.generate_indices(&pool);

        assert!(complete);
        assert!(patch.indices().len() > 6);
        assert_leaf_branch_duality(&patch, &pool);
    }

    #[test]
    fn degenerate_patch_never_refines() {
        let mut patch = test_patch(16, 8, |_, _| 7.0);
        let mut pool = TriNodePool::new(256);

        for camera in [
            Vec3::new(8.0, 7.0, 8.0),
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(5_000.0, 100.0, 5_000.0),
        ] {
            patch.reset();
            pool.reset();

            let mut params = params(camera);
            params.mid_height = 7.0;

            assert!(patch.tessellate(&mut pool, &params));
            patch.generate_indices(&pool);
            assert_eq!(patch.indices().len(), 6);
        }
    }

    #[test]
    fn splitting_a_root_completes_the_diamond() {
        let mut patch = test_patch(4, 12, |_, _| 0.0);
        let mut pool = TriNodePool::new(8);

        assert!(patch.split(&mut pool, TriRef::BASE_LEFT));

        assert!(patch.base_left.is_branch());
        assert!(patch.base_right.is_branch());

        // the four child cross-links across the shared hypotenuse
        let left = patch.base_left;
        let right = patch.base_right;
        assert_eq!(pool.node(left.left_child).right_neighbor, right.right_child);
        assert_eq!(pool.node(left.right_child).left_neighbor, right.left_child);
        assert_eq!(pool.node(right.left_child).right_neighbor, left.right_child);
        assert_eq!(pool.node(right.right_child).left_neighbor, left.left_child);

        // children at the patch edge face outward into nothing
        assert!(pool.node(left.left_child).base_neighbor.is_none());
        assert!(pool.node(left.right_child).base_neighbor.is_none());
    }

    #[test]
    fn exhausted_pool_aborts_split_and_keeps_prior_splits() {
        let mut patch = test_patch(4, 12, |_, _| 0.0);

        // room for exactly two child pairs: one diamond
        let mut pool = TriNodePool::new(4);

        assert!(patch.split(&mut pool, TriRef::BASE_LEFT));
        assert!(pool.out_of_nodes());

        let left_child = patch.base_left.left_child;
        let before = *pool.node(left_child);

        assert!(!patch.split(&mut pool, left_child));
        assert!(pool.node(left_child).is_leaf());
        assert_eq!(*pool.node(left_child), before);

        assert_leaf_branch_duality(&patch, &pool);
    }

    #[test]
    fn closer_camera_never_coarsens_the_mesh() {
        let mut rng = StdRng::seed_from_u64(7);
        let heights: Vec<f32> = (0..33 * 33).map(|_| rng.random_range(0.0..30.0)).collect();

        let mut patch = test_patch(32, 9, |x, z| heights[(z * 33 + x) as usize]);
        let mut pool = TriNodePool::new(8192);

        let mut leaves = Vec::new();

        for camera in [
            Vec3::new(4_000.0, 50.0, 4_000.0),
            Vec3::new(400.0, 50.0, 400.0),
            Vec3::new(16.0, 20.0, 16.0),
        ] {
            patch.reset();
            pool.reset();

            let mut params = params(camera);
            params.mid_height = 15.0;

            assert!(patch.tessellate(&mut pool, &params));
            patch.generate_indices(&pool);
            assert_leaf_branch_duality(&patch, &pool);

            leaves.push(patch.indices().len() / 3);
        }

        assert!(leaves[1] >= leaves[0]);
        assert!(leaves[2] >= leaves[1]);
    }

    #[test]
    fn variance_is_floored_and_dominates_children() {
        let mut patch = test_patch(16, 6, |x, z| {
            ((x as f32 * 0.7).sin() + (z as f32 * 0.4).cos()) * 10.0
        });
        patch.compute_variance();
        assert!(!patch.is_dirty());

        for table in [&patch.variance_left, &patch.variance_right] {
            assert!(table[1] >= VARIANCE_FLOOR);

            for node in 1..table.len() / 2 {
                let (left, right) = (table[node << 1], table[(node << 1) + 1]);
                if left > 0.0 {
                    assert!(table[node] >= left);
                }
                if right > 0.0 {
                    assert!(table[node] >= right);
                }
            }
        }
    }

    #[test]
    fn shorelines_get_exaggerated_variance() {
        // a linear slope has zero raw variance, but it crosses the water
        // line between samples
        let mut patch = test_patch(8, 6, |x, _| x as f32 - 3.5);
        patch.compute_variance();

        assert!(patch.variance_left[1] >= SHORELINE_VARIANCE);
        assert!(patch.variance_right[1] >= SHORELINE_VARIANCE);
    }

    #[test]
    fn height_updates_are_clamped_to_the_patch() {
        let config = test_config(4, 6);
        let map = HeightMap::from_fn(UVec2::new(9, 5), 1.0, |x, _| x as f32);

        let mut patch = Patch::new(UVec2::new(4, 0), &config);

        assert!(!patch.update_height_map(&map, URect::new(0, 0, 3, 3)));
        assert!(patch.update_height_map(&map, URect::new(2, 0, 8, 4)));

        assert_eq!(patch.height(IVec2::new(0, 0)), 4.0);
        assert_eq!(patch.height(IVec2::new(4, 4)), 8.0);
        assert!(patch.is_dirty());
    }

    #[test]
    fn skirts_cover_the_selected_borders() {
        let mut patch = test_patch(4, 12, |_, _| 0.0);
        let mut pool = TriNodePool::new(64);

        patch.tessellate(&mut pool, &params(Vec3::new(10_000.0, 0.0, 10_000.0)));

        patch.generate_skirt(&pool, PatchBorders::all());
        assert_eq!(patch.skirt().positions.len(), 24);

        // one quad per border on the untessellated base mesh, with the
        // white-transparent color layout of a skirt quad
        patch.generate_skirt(&pool, PatchBorders::LEFT);
        let skirt = patch.skirt();
        assert_eq!(skirt.positions.len(), 6);
        assert!(skirt.positions.iter().all(|p| p.x == 0.0));
        assert_eq!(
            skirt.colors,
            vec![
                [1.0, 1.0, 1.0, 1.0],
                [1.0, 1.0, 1.0, 0.0],
                [1.0, 1.0, 1.0, 1.0],
                [1.0, 1.0, 1.0, 1.0],
                [1.0, 1.0, 1.0, 0.0],
                [1.0, 1.0, 1.0, 0.0],
            ]
        );

        patch.generate_skirt(&pool, PatchBorders::TOP);
        assert!(patch.skirt().positions.iter().all(|p| p.z == 0.0));

        patch.generate_skirt(&pool, PatchBorders::RIGHT);
        assert!(patch.skirt().positions.iter().all(|p| p.x == 4.0));

        patch.generate_skirt(&pool, PatchBorders::BOTTOM);
        assert!(patch.skirt().positions.iter().all(|p| p.z == 4.0));
    }

    #[test]
    fn skirt_bottom_drops_to_the_configured_depth() {
        let mut patch = test_patch(4, 12, |_, _| 2.0);
        let mut pool = TriNodePool::new(64);

        patch.tessellate(&mut pool, &params(Vec3::new(10_000.0, 0.0, 10_000.0)));
        patch.generate_skirt(&pool, PatchBorders::LEFT);

        let skirt = patch.skirt();
        for (position, color) in skirt.positions.iter().zip(&skirt.colors) {
            if color[3] == 0.0 {
                assert_eq!(position.y, TerrainConfig::default().skirt_depth);
            } else {
                assert_eq!(position.y, 2.0);
            }
        }
    }
}
