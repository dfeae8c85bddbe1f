use bevy::prelude::*;
use std::collections::TryReserveError;

/// Pools may grow up to this multiple of their initial node budget.
const POOL_GROWTH_LIMIT: usize = 8;

/// An arena-relative reference to a [`TriNode`].
///
/// Links between triangles never own their target. Besides pool slots there
/// are three reserved values: [`TriRef::NONE`] for a missing neighbor and
/// [`TriRef::BASE_LEFT`]/[`TriRef::BASE_RIGHT`] addressing the two root
/// triangles of a patch, which live outside the pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TriRef(u32);

impl TriRef {
    /// The missing-neighbor sentinel.
    pub const NONE: Self = Self(u32::MAX);
    /// The left root triangle of the owning patch.
    pub const BASE_LEFT: Self = Self(u32::MAX - 2);
    /// The right root triangle of the owning patch.
    pub const BASE_RIGHT: Self = Self(u32::MAX - 1);

    fn new(index: usize) -> Self {
        Self(index as u32)
    }

    pub fn is_none(self) -> bool {
        self == Self::NONE
    }

    pub fn is_some(self) -> bool {
        self != Self::NONE
    }

    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

impl Default for TriRef {
    fn default() -> Self {
        Self::NONE
    }
}

/// A triangle of the binary triangle tree.
///
/// Nodes carry no geometry. A triangle's corners are derived from the
/// traversal path leading to it, so a node is nothing but its two child links
/// and the three links to the triangles sharing its edges.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TriNode {
    pub(crate) left_child: TriRef,
    pub(crate) right_child: TriRef,
    /// The triangle across the hypotenuse.
    pub(crate) base_neighbor: TriRef,
    pub(crate) left_neighbor: TriRef,
    pub(crate) right_neighbor: TriRef,
}

impl TriNode {
    /// Children are only ever present in pairs.
    pub fn is_leaf(&self) -> bool {
        self.left_child.is_none()
    }

    pub fn is_branch(&self) -> bool {
        self.left_child.is_some()
    }
}

/// A fixed-capacity arena of [`TriNode`] slots.
///
/// Child nodes are carved from a monotonically increasing cursor, always in
/// pairs, and are never freed individually. Once the cursor reaches the
/// capacity, allocation fails and tessellation simply stops refining.
pub struct TriNodePool {
    nodes: Vec<TriNode>,
    next_index: usize,
}

impl TriNodePool {
    /// Panics if the allocation fails. Prefer [`TriNodePool::try_new`] where
    /// a fallback size makes sense.
    pub fn new(capacity: usize) -> Self {
        Self::try_new(capacity).expect("failed to allocate triangle node pool")
    }

    /// The capacity is rounded up to an even slot count, since children are
    /// always allocated in pairs.
    pub fn try_new(capacity: usize) -> Result<Self, TryReserveError> {
        let capacity = capacity + (capacity & 1);
        debug_assert!(capacity > 0);

        let mut nodes = Vec::new();
        nodes.try_reserve_exact(capacity)?;
        nodes.resize(capacity, TriNode::default());

        Ok(Self {
            nodes,
            next_index: 0,
        })
    }

    /// Reserves the next two free slots, or `None` once the pool is spent.
    pub fn allocate_pair(&mut self) -> Option<(TriRef, TriRef)> {
        if self.out_of_nodes() {
            return None;
        }

        let left = TriRef::new(self.next_index);
        let right = TriRef::new(self.next_index + 1);
        self.next_index += 2;

        Some((left, right))
    }

    /// Rewinds the cursor and clears the consumed slots.
    ///
    /// Split logic dereferences child links right after allocation, so any
    /// stale neighbor links surviving from the previous frame would corrupt
    /// the new trees.
    pub fn reset(&mut self) {
        self.nodes[..self.next_index].fill(TriNode::default());
        self.next_index = 0;
    }

    pub fn out_of_nodes(&self) -> bool {
        self.next_index == self.nodes.len()
    }

    pub fn capacity(&self) -> usize {
        self.nodes.len()
    }

    pub fn allocated(&self) -> usize {
        self.next_index
    }

    pub(crate) fn node(&self, tri: TriRef) -> &TriNode {
        &self.nodes[tri.index()]
    }

    pub(crate) fn node_mut(&mut self, tri: TriRef) -> &mut TriNode {
        &mut self.nodes[tri.index()]
    }
}

/// The pools of one rendering pass, one per worker thread.
///
/// Passes tessellate independently and in parallel, so their workers never
/// share a pool and the hot split path needs no locking.
struct PassPools {
    pools: Vec<TriNodePool>,
    workers: usize,
    current_size: usize,
    max_size: usize,
    grew: bool,
}

impl PassPools {
    fn new(base_size: usize, workers: usize) -> Self {
        let mut pass = Self {
            pools: Vec::new(),
            workers,
            current_size: 0,
            max_size: base_size * POOL_GROWTH_LIMIT,
            grew: false,
        };
        pass.init(base_size);
        pass
    }

    /// (Re)allocates all pools of the pass at the given total node budget.
    ///
    /// An allocation failure here is recoverable: the requested size shrinks
    /// by a quarter (pulling the growth ceiling down with it) and the
    /// allocation is retried, since a smaller pool only reduces visual
    /// detail.
    fn init(&mut self, mut total: usize) {
        loop {
            match Self::build_pools(total, self.workers) {
                Ok(pools) => {
                    self.pools = pools;
                    self.current_size = total;
                    return;
                }
                Err(error) => {
                    total -= total >> 2;
                    self.max_size = total;
                    warn!("triangle pool allocation failed ({error}), retrying with {total} nodes");
                }
            }
        }
    }

    fn build_pools(total: usize, workers: usize) -> Result<Vec<TriNodePool>, TryReserveError> {
        // the floor keeps a large worker count from starving every pool
        let per_worker = (total / workers).max(total / 3);

        (0..workers)
            .map(|_| TriNodePool::try_new(per_worker))
            .collect()
    }

    /// Rewinds all pools and grows the pass if any of them ran dry during
    /// the previous frame. Must not run concurrently with tessellation.
    fn reset(&mut self) {
        let mut out_of_nodes = false;

        for pool in &mut self.pools {
            out_of_nodes |= pool.out_of_nodes();
            pool.reset();
        }

        self.grew = false;

        if !out_of_nodes || self.current_size >= self.max_size {
            return;
        }

        let grown = (self.current_size * 2).min(self.max_size);
        info!("triangle pools ran dry, growing from {} to {grown} nodes", self.current_size);

        self.init(grown);
        self.grew = true;
    }
}

/// The per-pass triangle node pools of all terrains.
///
/// Replaces process-wide pool state with an explicit registry owned by the
/// plugin: each rendering pass (e.g. main and shadow) holds one
/// [`TriNodePool`] per worker thread, sized from the pass's total node
/// budget.
#[derive(Resource, Default)]
pub struct TriPools {
    passes: Vec<Option<PassPools>>,
}

impl TriPools {
    /// Allocates the pools of a pass on first use.
    pub fn ensure_pass(&mut self, pass: usize, base_size: usize, workers: usize) {
        if self.passes.len() <= pass {
            self.passes.resize_with(pass + 1, || None);
        }

        if self.passes[pass].is_none() {
            self.passes[pass] = Some(PassPools::new(base_size, workers.max(1)));
        }
    }

    /// The serialized reset-and-grow step, run once per frame strictly
    /// between tessellation passes.
    pub fn reset_all(&mut self) {
        for pass in self.passes.iter_mut().flatten() {
            pass.reset();
        }
    }

    /// Whether the pass was regrown during the last reset.
    pub fn pass_grew(&self, pass: usize) -> bool {
        self.passes
            .get(pass)
            .and_then(Option::as_ref)
            .is_some_and(|pass| pass.grew)
    }

    pub fn pass_pools_mut(&mut self, pass: usize) -> &mut [TriNodePool] {
        self.passes
            .get_mut(pass)
            .and_then(Option::as_mut)
            .map(|pass| pass.pools.as_mut_slice())
            .unwrap_or(&mut [])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pairs_are_adjacent_slots() {
        let mut pool = TriNodePool::new(6);

        let (left, right) = pool.allocate_pair().unwrap();
        assert_eq!(left.index(), 0);
        assert_eq!(right.index(), 1);

        let (left, right) = pool.allocate_pair().unwrap();
        assert_eq!(left.index(), 2);
        assert_eq!(right.index(), 3);

        assert_eq!(pool.allocated(), 4);
        assert!(!pool.out_of_nodes());
    }

    #[test]
    fn exhausted_pool_fails_allocation() {
        let mut pool = TriNodePool::new(4);

        assert!(pool.allocate_pair().is_some());
        assert!(pool.allocate_pair().is_some());
        assert!(pool.out_of_nodes());
        assert!(pool.allocate_pair().is_none());
    }

    #[test]
    fn odd_capacity_rounds_up_to_even() {
        let pool = TriNodePool::new(5);
        assert_eq!(pool.capacity(), 6);
    }

    #[test]
    fn reset_zeroes_consumed_slots() {
        let mut pool = TriNodePool::new(8);

        let (left, right) = pool.allocate_pair().unwrap();
        pool.node_mut(left).base_neighbor = right;
        pool.node_mut(right).left_child = left;

        pool.reset();

        // reallocating the same slots must yield nodes indistinguishable
        // from a freshly constructed pool
        let (left, right) = pool.allocate_pair().unwrap();
        assert_eq!(*pool.node(left), TriNode::default());
        assert_eq!(*pool.node(right), TriNode::default());
        assert_eq!(pool.allocated(), 2);
    }

    #[test]
    fn pass_grows_after_exhaustion_until_capped() {
        let mut pass = PassPools::new(16, 2);
        assert_eq!(pass.current_size, 16);
        assert_eq!(pass.max_size, 128);

        for _ in 0..3 {
            let before = pass.current_size;
            while pass.pools[0].allocate_pair().is_some() {}
            pass.reset();
            assert_eq!(pass.current_size, before * 2);
            assert!(pass.grew);
        }

        // at the ceiling, exhaustion no longer grows the pass
        while pass.pools[0].allocate_pair().is_some() {}
        pass.reset();
        assert_eq!(pass.current_size, 128);
        assert!(!pass.grew);
    }

    #[test]
    fn per_worker_size_is_floored() {
        // 24 nodes over 8 workers would leave 3 per pool; the floor of a
        // third of the budget keeps each worker useful
        let pools = PassPools::build_pools(24, 8).unwrap();
        assert!(pools.iter().all(|pool| pool.capacity() == 8));
    }

    #[test]
    fn registry_resets_lazily_created_passes() {
        let mut pools = TriPools::default();
        pools.ensure_pass(1, 8, 2);

        assert!(pools.pass_pools_mut(0).is_empty());
        assert_eq!(pools.pass_pools_mut(1).len(), 2);

        let pool = &mut pools.pass_pools_mut(1)[0];
        while pool.allocate_pair().is_some() {}

        pools.reset_all();
        assert!(pools.pass_grew(1));
        assert!(!pools.pass_grew(0));
    }
}
