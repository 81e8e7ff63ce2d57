//! Two-phase mark/sweep reclamation of emptied cells.
//!
//! Removes never free anything; they only overwrite slots with the invalid
//! sentinel and deposit depth-tagged GC hints up the ancestor chain. A GC
//! cycle then runs in two phases:
//!
//! 1. **Prepare** (single-threaded): reset the allocator's pool bank and
//!    walk the hinted part of the tree down to a fixed target depth,
//!    collecting every hinted node there as a [`GcRoot`]. Hints above the
//!    target are cleared on the way; the roots keep theirs so the sweep
//!    knows where to start. Roots are pairwise disjoint, so sweeps may run
//!    in parallel.
//! 2. **Collect** (parallel over roots): sweep each subtree. Leaves compact
//!    their chains in place; interior nodes detach subtrees that emptied
//!    out and batch the reclaimed chunks into pools of [`REFILL_BATCH`],
//!    handed to the allocator at the end of the sweep.

use std::ptr::NonNull;

use crate::allocator::{OctreeAllocator, REFILL_BATCH};
use crate::chunk_pool::ChunkPool;
use crate::node::{LeafNode, TreeNode, INVALID_INDEX};
use crate::tracing_helpers::debug_log;

use super::{ParallelOctree, DEFAULT_GC_ROOT_DEPTH};

/// Handle to a hinted interior node produced by
/// [`ParallelOctree::prepare_garbage_collection`]; consumed by one
/// [`ParallelOctree::collect_garbage`] sweep.
///
/// Roots from a single preparation are never ancestors of one another, so
/// their sweeps touch disjoint subtrees.
pub struct GcRoot {
    node: NonNull<TreeNode>,
}

// SAFETY: a root is a stable pointer into the tree's arena; the sweep that
// consumes it has exclusive access to its subtree by the disjointness
// guarantee plus the phasing contract.
unsafe impl Send for GcRoot {}

impl std::fmt::Debug for GcRoot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("GcRoot").field(&self.node).finish()
    }
}

impl ParallelOctree {
    /// Phase one: collect sweep roots at `depth` into `roots`.
    ///
    /// Requires all mutators to be quiescent. `depth` must be less than
    /// `size_log` (use [`DEFAULT_GC_ROOT_DEPTH`] for a typical fan-out);
    /// out-of-range depths are clamped in release builds. A depth-0 tree
    /// has no interior nodes and always yields an empty root set, as does
    /// a tree with no hinted removals since the last cycle.
    pub fn prepare_garbage_collection(&mut self, roots: &mut Vec<GcRoot>, depth: u32) {
        self.allocator_mut().prepare_gc();
        roots.clear();

        if self.size_log() == 0 {
            return;
        }
        debug_assert!(depth < self.size_log(), "gc root depth {depth} too deep");
        let depth = depth.min(self.size_log() - 1);

        // SAFETY: size_log > 0 makes the root an interior node.
        let root = unsafe { TreeNode::from_node(self.root()) };
        discover_roots(root, 0, depth, roots);
        debug_log!(roots = roots.len(), "gc prepare");
    }

    /// Phase one with the default root depth.
    pub fn prepare_garbage_collection_default(&mut self, roots: &mut Vec<GcRoot>) {
        let depth = DEFAULT_GC_ROOT_DEPTH.min(self.size_log().saturating_sub(1));
        self.prepare_garbage_collection(roots, depth);
    }

    /// Phase two: sweep one root's subtree, compacting leaves and returning
    /// pruned chunks to the allocator.
    ///
    /// May run in parallel with sweeps of the other roots from the same
    /// preparation, but never with mutators.
    pub fn collect_garbage(&self, root: GcRoot) {
        // SAFETY: the root points at a live interior node and this sweep
        // has exclusive access to its subtree.
        let tree = unsafe { root.node.as_ref() };
        debug_assert!(tree.gc_hint.is_set(), "gc root lost its hint");
        let depth = tree.gc_hint.depth();

        let mut batch = ChunkBatch::new();
        sweep_tree(self.size_log(), tree, depth, &mut batch);
        batch.finish(self.allocator());
    }
}

/// Descend hinted interior nodes. Nodes at the target depth become roots
/// and keep their hint; hints above it are cleared.
fn discover_roots(tree: &TreeNode, depth: u32, target_depth: u32, roots: &mut Vec<GcRoot>) {
    if !tree.gc_hint.is_set() {
        return;
    }

    if depth == target_depth {
        roots.push(GcRoot {
            node: NonNull::from(tree),
        });
        return;
    }

    tree.gc_hint.clear();
    for link in &tree.children {
        if let Some(child) = NonNull::new(link.get()) {
            // SAFETY: depth + 1 <= target_depth < size_log, interior node.
            let child = unsafe { TreeNode::from_node(child) };
            discover_roots(child, depth + 1, target_depth, roots);
        }
    }
}

/// Sweep an interior node; returns whether its whole subtree is now empty
/// (every child slot either null or pruned).
fn sweep_tree(size_log: u32, tree: &TreeNode, depth: u32, batch: &mut ChunkBatch) -> bool {
    if !tree.gc_hint.is_set() {
        return false;
    }
    tree.gc_hint.clear();

    let child_depth = depth + 1;
    let mut all_empty = true;

    for link in &tree.children {
        let Some(child) = NonNull::new(link.get()) else {
            continue;
        };

        let child_empty = if child_depth == size_log {
            // SAFETY: depth discriminates the node kind.
            let leaf = unsafe { LeafNode::from_node(child) };
            let empty = sweep_leaf(leaf);
            if empty {
                reclaim_leaf(leaf, batch);
            }
            empty
        } else {
            // SAFETY: child_depth < size_log, interior node.
            let subtree = unsafe { TreeNode::from_node(child) };
            let empty = sweep_tree(size_log, subtree, child_depth, batch);
            if empty {
                batch.push(child.cast());
            }
            empty
        };

        if child_empty {
            link.store(std::ptr::null_mut());
        } else {
            all_empty = false;
        }
    }

    all_empty
}

/// Compact a hinted leaf in place: surviving indices slide into the
/// earliest physical slots in their original order and `count` drops to
/// the survivor count. Returns whether the leaf emptied out.
///
/// Untouched leaves (clear hint) are skipped entirely, so a leaf that was
/// only ever added to keeps its slots as they are.
fn sweep_leaf(leaf: &LeafNode) -> bool {
    use std::sync::atomic::Ordering;

    if !leaf.gc_hint.is_set() {
        return false;
    }
    leaf.gc_hint.clear();

    let count = leaf.count.load(Ordering::Relaxed) as usize;

    let mut survivors = Vec::with_capacity(count);
    let mut remaining = count;
    for segment in leaf.segments() {
        if remaining == 0 {
            break;
        }
        let in_use = remaining.min(segment.len());
        for slot in &segment[..in_use] {
            let value = slot.load(Ordering::Relaxed);
            if value != INVALID_INDEX {
                survivors.push(value);
            }
        }
        remaining -= in_use;
    }
    debug_assert_eq!(remaining, 0, "leaf chain shorter than its count");

    let mut writer = survivors.iter().copied();
    'write: for segment in leaf.segments() {
        for slot in segment {
            match writer.next() {
                Some(value) => slot.store(value, Ordering::Relaxed),
                None => break 'write,
            }
        }
    }

    let new_count = survivors.len();
    leaf.count.store(new_count as u32, Ordering::Relaxed);
    new_count == 0
}

/// Reclaim an emptied leaf: its own chunk plus its whole extension chain.
/// The chain links are read before any chunk is pushed, since pooling a
/// chunk overwrites its first word.
fn reclaim_leaf(leaf: &LeafNode, batch: &mut ChunkBatch) {
    let mut extension = leaf.next.get();
    batch.push(NonNull::from(leaf).cast());

    while let Some(current) = NonNull::new(extension) {
        // SAFETY: chain links point at live extension chunks; this sweep
        // owns the subtree.
        extension = unsafe { current.as_ref() }.next.get();
        batch.push(current.cast());
    }
}

/// Accumulates reclaimed chunks into pools of [`REFILL_BATCH`] and hands
/// them to the allocator's bank in one locked call at the end of the sweep.
struct ChunkBatch {
    current: ChunkPool<false>,
    current_len: usize,
    full: Vec<ChunkPool<false>>,
}

impl ChunkBatch {
    fn new() -> Self {
        Self {
            current: ChunkPool::new(),
            current_len: 0,
            full: Vec::new(),
        }
    }

    fn push(&mut self, chunk: NonNull<u8>) {
        // SAFETY: detached chunks are unreachable from the tree and owned
        // by this sweep.
        unsafe { self.current.push_unsync(chunk) };
        self.current_len += 1;

        if self.current_len == REFILL_BATCH {
            self.full.push(std::mem::take(&mut self.current));
            self.current_len = 0;
        }
    }

    fn finish(mut self, allocator: &OctreeAllocator) {
        if self.current_len > 0 {
            self.full.push(self.current);
        }
        if !self.full.is_empty() {
            debug_log!(pools = self.full.len(), "gc sweep handoff");
            allocator.add_pools(self.full);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::CHUNK_SIZE;
    use crate::geometry::{Aabb, Point, ShapeData};

    fn corner_shape(index: u32) -> ShapeData {
        ShapeData {
            aabb: Aabb::new(Point::new(0.1, 0.1, 0.1), Point::new(0.2, 0.2, 0.2)),
            index,
        }
    }

    #[test]
    fn empty_tree_produces_no_roots() {
        let mut tree = ParallelOctree::new(2, 4096 * CHUNK_SIZE, 1).unwrap();
        let mut roots = Vec::new();

        tree.prepare_garbage_collection(&mut roots, 1);
        assert!(roots.is_empty());
    }

    #[test]
    fn add_without_remove_produces_no_roots() {
        let mut tree = ParallelOctree::new(2, 4096 * CHUNK_SIZE, 1).unwrap();
        tree.add_exclusive(&corner_shape(1)).unwrap();

        let mut roots = Vec::new();
        tree.prepare_garbage_collection(&mut roots, 1);
        assert!(roots.is_empty());
    }

    #[test]
    fn sweep_compacts_and_prunes_emptied_subtree() {
        let mut tree = ParallelOctree::new(1, 4096 * CHUNK_SIZE, 1).unwrap();

        tree.add_exclusive(&corner_shape(9)).unwrap();
        tree.remove_exclusive(&corner_shape(9));
        let pooled_before = tree.pooled_chunks();

        let mut roots = Vec::new();
        tree.prepare_garbage_collection(&mut roots, 0);
        assert_eq!(roots.len(), 1);

        for root in roots.drain(..) {
            tree.collect_garbage(root);
        }

        // The leaf emptied out and was detached from the root.
        // SAFETY: size_log = 1, the root is an interior node.
        let root = unsafe { TreeNode::from_node(tree.root()) };
        assert!(root.children.iter().all(|link| link.get().is_null()));
        assert!(!root.gc_hint.is_set());

        // Its chunk came back to the allocator: only the root stays live.
        assert_eq!(tree.pooled_chunks(), pooled_before + 1);
        assert_eq!(tree.arena_allocated_chunks(), tree.pooled_chunks() + 1);
    }

    #[test]
    fn surviving_entries_keep_their_order() {
        let mut tree = ParallelOctree::new(1, 4096 * CHUNK_SIZE, 1).unwrap();

        for i in 0..6 {
            tree.add_exclusive(&corner_shape(i)).unwrap();
        }
        tree.remove_exclusive(&corner_shape(1));
        tree.remove_exclusive(&corner_shape(3));

        let mut roots = Vec::new();
        tree.prepare_garbage_collection(&mut roots, 0);
        for root in roots.drain(..) {
            tree.collect_garbage(root);
        }

        // SAFETY: size_log = 1, interior root; octant 0 is the shape's cell.
        let root = unsafe { TreeNode::from_node(tree.root()) };
        let leaf = NonNull::new(root.children[0].get()).unwrap();
        // SAFETY: depth 1 == size_log, leaf.
        let leaf = unsafe { LeafNode::from_node(leaf) };

        use std::sync::atomic::Ordering;
        assert_eq!(leaf.count.load(Ordering::Relaxed), 4);
        let values: Vec<u32> = (0..4)
            .map(|i| leaf.indices[i].load(Ordering::Relaxed))
            .collect();
        assert_eq!(values, vec![0, 2, 4, 5]);
    }

    #[test]
    fn default_depth_clamps_to_shallow_trees() {
        // size_log = 1 cannot host the default root depth of 2; the
        // preparation clamps to the only interior level.
        let mut tree = ParallelOctree::new(1, 4096 * CHUNK_SIZE, 1).unwrap();

        tree.add_exclusive(&corner_shape(3)).unwrap();
        tree.remove_exclusive(&corner_shape(3));

        let mut roots = Vec::new();
        tree.prepare_garbage_collection_default(&mut roots);
        assert_eq!(roots.len(), 1);
    }

    #[test]
    fn second_cycle_is_idempotent() {
        let mut tree = ParallelOctree::new(2, 4096 * CHUNK_SIZE, 1).unwrap();

        tree.add_exclusive(&corner_shape(5)).unwrap();
        tree.remove_exclusive(&corner_shape(5));

        let mut roots = Vec::new();
        tree.prepare_garbage_collection(&mut roots, 1);
        assert!(!roots.is_empty());
        for root in roots.drain(..) {
            tree.collect_garbage(root);
        }

        tree.prepare_garbage_collection(&mut roots, 1);
        assert!(roots.is_empty());
    }
}
