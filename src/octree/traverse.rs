//! Recursive mutation traversers.
//!
//! A [`Traverser`] binds the tree to one worker's allocator slot for the
//! duration of a single mutation. The `SYNCHRONIZED` const generic selects
//! between atomic claims with CAS publication and plain stores; both
//! flavors share every line of traversal logic.
//!
//! New octants and leaf extensions are installed lock-free: allocate a
//! zeroed chunk, publish it with a single compare-exchange from null, and
//! on a lost race recycle the loser into the worker's own pool and continue
//! with the observed winner.

use std::ptr::NonNull;
use std::sync::atomic::Ordering;

use crate::arena::OctreeError;
use crate::geometry::{Aabb, ShapeData, ShapeMove};
use crate::node::{
    init_zeroed, LeafExtension, LeafNode, Node, TreeNode, EXTENSION_CAPACITY,
    INVALID_INDEX, LEAF_INLINE_CAPACITY,
};
use crate::relative_ptr::RelativePtr;
use crate::tracing_helpers::trace_log;

use super::ParallelOctree;

/// One mutation's view of the tree, bound to a worker's allocator slot.
pub(super) struct Traverser<'t, const SYNCHRONIZED: bool> {
    octree: &'t ParallelOctree,
    worker: u32,
}

impl<'t, const SYNCHRONIZED: bool> Traverser<'t, SYNCHRONIZED> {
    pub(super) fn new(octree: &'t ParallelOctree, worker: u32) -> Self {
        debug_assert!(
            worker < octree.allocator().workers(),
            "worker index {worker} out of range"
        );
        Self { octree, worker }
    }

    // ========================================================================
    //  Add
    // ========================================================================

    pub(super) fn add(&self, shape: &ShapeData) -> Result<(), OctreeError> {
        trace_log!(index = shape.index, "add");
        self.add_node(self.octree.root(), &self.octree.initial_aabb(), 0, shape)
    }

    fn add_node(
        &self,
        node: NonNull<Node>,
        aabb: &Aabb,
        depth: u32,
        shape: &ShapeData,
    ) -> Result<(), OctreeError> {
        if depth == self.octree.size_log() {
            // SAFETY: depth discriminates the node kind.
            let leaf = unsafe { LeafNode::from_node(node) };
            return self.add_item(leaf, shape.index);
        }

        // SAFETY: depth < size_log, so this chunk is an interior node.
        let tree = unsafe { TreeNode::from_node(node) };
        let centre = aabb.centre();
        let child_depth = depth + 1;

        for octant in 0..8u32 {
            let child_aabb = aabb.octant(octant, &centre);
            if shape.aabb.intersects(&child_aabb) {
                let child = self.ensure_octant(tree, octant, child_depth)?;
                self.add_node(child, &child_aabb, child_depth, shape)?;
            }
        }
        Ok(())
    }

    /// Return octant `octant`'s child, installing a fresh node if the link
    /// is null. Exactly one racing installer wins the CAS; losers recycle
    /// their chunk into their own pool and adopt the winner.
    fn ensure_octant(
        &self,
        tree: &TreeNode,
        octant: u32,
        child_depth: u32,
    ) -> Result<NonNull<Node>, OctreeError> {
        let link = &tree.children[octant as usize];
        if let Some(existing) = NonNull::new(link.get()) {
            return Ok(existing);
        }

        let chunk = self.octree.allocator().allocate::<SYNCHRONIZED>(self.worker)?;
        // SAFETY: fresh exclusive chunk; zero is a valid empty node.
        let fresh: NonNull<Node> = if child_depth == self.octree.size_log() {
            unsafe { init_zeroed::<LeafNode>(chunk) }.cast()
        } else {
            unsafe { init_zeroed::<TreeNode>(chunk) }.cast()
        };

        if SYNCHRONIZED {
            let mut expected: *mut Node = std::ptr::null_mut();
            if !link.compare_exchange(&mut expected, fresh.as_ptr()) {
                debug_assert!(!expected.is_null());
                trace_log!(octant, "lost octant install race");
                // SAFETY: the loser chunk never became reachable; it is
                // still exclusively ours to recycle.
                unsafe { self.octree.allocator().deallocate(self.worker, chunk) };
                // SAFETY: a failed install observed a non-null winner.
                return Ok(unsafe { NonNull::new_unchecked(expected) });
            }
        } else {
            link.store(fresh.as_ptr());
        }
        Ok(fresh)
    }

    /// Append `index` to the leaf's chain at a freshly reserved slot,
    /// growing the extension chain as needed.
    fn add_item(&self, leaf: &LeafNode, index: u32) -> Result<(), OctreeError> {
        debug_assert_ne!(index, INVALID_INDEX);
        let mut offset = self.reserve_slot(leaf) as usize;

        if offset < LEAF_INLINE_CAPACITY {
            leaf.indices[offset].store(index, Ordering::Relaxed);
            return Ok(());
        }
        offset -= LEAF_INLINE_CAPACITY;

        let mut link: &RelativePtr<LeafExtension> = &leaf.next;
        loop {
            let extension = match NonNull::new(link.get()) {
                Some(extension) => extension,
                None => self.grow_chain(link)?,
            };
            // SAFETY: published extensions stay live while mutators run; GC
            // is phased out by the caller contract.
            let extension = unsafe { &*extension.as_ptr() };

            if offset < EXTENSION_CAPACITY {
                extension.indices[offset].store(index, Ordering::Relaxed);
                return Ok(());
            }
            offset -= EXTENSION_CAPACITY;
            link = &extension.next;
        }
    }

    /// Reserve the next free logical slot. The counter only ever grows;
    /// concurrent adders each get a distinct slot.
    fn reserve_slot(&self, leaf: &LeafNode) -> u32 {
        if SYNCHRONIZED {
            leaf.count.fetch_add(1, Ordering::Relaxed)
        } else {
            let count = leaf.count.load(Ordering::Relaxed);
            leaf.count.store(count + 1, Ordering::Relaxed);
            count
        }
    }

    /// Install a fresh extension at `link`, or adopt a concurrently
    /// installed one.
    fn grow_chain(
        &self,
        link: &RelativePtr<LeafExtension>,
    ) -> Result<NonNull<LeafExtension>, OctreeError> {
        let chunk = self.octree.allocator().allocate::<SYNCHRONIZED>(self.worker)?;
        // SAFETY: fresh exclusive chunk; zero is a valid empty extension.
        let fresh = unsafe { init_zeroed::<LeafExtension>(chunk) };

        if SYNCHRONIZED {
            let mut expected: *mut LeafExtension = std::ptr::null_mut();
            if !link.compare_exchange(&mut expected, fresh.as_ptr()) {
                debug_assert!(!expected.is_null());
                trace_log!("lost extension install race");
                // SAFETY: the loser chunk never became reachable.
                unsafe { self.octree.allocator().deallocate(self.worker, chunk) };
                // SAFETY: a failed install observed a non-null winner.
                return Ok(unsafe { NonNull::new_unchecked(expected) });
            }
        } else {
            link.store(fresh.as_ptr());
        }
        Ok(fresh)
    }

    // ========================================================================
    //  Remove
    // ========================================================================

    pub(super) fn remove(&self, shape: &ShapeData) {
        trace_log!(index = shape.index, "remove");
        self.remove_node(self.octree.root(), &self.octree.initial_aabb(), 0, shape);
    }

    /// Returns whether a descendant deposited a GC hint, in which case this
    /// node's own hint is set on the way back up.
    fn remove_node(&self, node: NonNull<Node>, aabb: &Aabb, depth: u32, shape: &ShapeData) -> bool {
        if depth == self.octree.size_log() {
            // SAFETY: depth discriminates the node kind.
            let leaf = unsafe { LeafNode::from_node(node) };
            self.remove_item(leaf, depth, shape.index);
            return true;
        }

        // SAFETY: depth < size_log, so this chunk is an interior node.
        let tree = unsafe { TreeNode::from_node(node) };
        let centre = aabb.centre();
        let child_depth = depth + 1;
        let mut removed = false;

        for octant in 0..8u32 {
            let child_aabb = aabb.octant(octant, &centre);
            if !shape.aabb.intersects(&child_aabb) {
                continue;
            }
            let Some(child) = NonNull::new(tree.children[octant as usize].get()) else {
                debug_assert!(false, "remove descended into an unallocated octant");
                continue;
            };
            removed |= self.remove_node(child, &child_aabb, child_depth, shape);
        }

        if removed {
            tree.gc_hint.set(depth);
        }
        removed
    }

    /// Overwrite the first occurrence of `index` within the chain's `count`
    /// logical slots with the invalid sentinel, then hint the leaf for GC.
    /// The counter is never decremented here.
    fn remove_item(&self, leaf: &LeafNode, depth: u32, index: u32) {
        let count = leaf.count.load(Ordering::Acquire) as usize;
        let found = vacate_slot(leaf, count, index);
        debug_assert!(found, "remove of index {index} not present in this cell");
        leaf.gc_hint.set(depth);
    }

    // ========================================================================
    //  Move
    // ========================================================================

    pub(super) fn relocate(&self, shape_move: &ShapeMove) -> Result<(), OctreeError> {
        trace_log!(index = shape_move.index, "move");
        let aabb = self.octree.initial_aabb();
        let hits_old = shape_move.aabb_old.intersects(&aabb);
        let hits_new = shape_move.aabb_new.intersects(&aabb);
        self.relocate_node(self.octree.root(), &aabb, 0, hits_old, hits_new, shape_move)?;
        Ok(())
    }

    fn relocate_node(
        &self,
        node: NonNull<Node>,
        aabb: &Aabb,
        depth: u32,
        hits_old: bool,
        hits_new: bool,
        shape_move: &ShapeMove,
    ) -> Result<bool, OctreeError> {
        if depth == self.octree.size_log() {
            // SAFETY: depth discriminates the node kind.
            let leaf = unsafe { LeafNode::from_node(node) };
            if hits_old && !hits_new {
                self.remove_item(leaf, depth, shape_move.index);
                return Ok(true);
            }
            if hits_new && !hits_old {
                self.add_item(leaf, shape_move.index)?;
            }
            // Both or neither: the shape stays put in this cell.
            return Ok(false);
        }

        // SAFETY: depth < size_log, so this chunk is an interior node.
        let tree = unsafe { TreeNode::from_node(node) };
        let centre = aabb.centre();
        let child_depth = depth + 1;
        let mut removed = false;

        for octant in 0..8u32 {
            let child_aabb = aabb.octant(octant, &centre);
            let old = shape_move.aabb_old.intersects(&child_aabb);
            let new = shape_move.aabb_new.intersects(&child_aabb);
            if old || new {
                let child = self.ensure_octant(tree, octant, child_depth)?;
                removed |= self.relocate_node(child, &child_aabb, child_depth, old, new, shape_move)?;
            }
        }

        if removed {
            tree.gc_hint.set(depth);
        }
        Ok(removed)
    }
}

/// Scan the chain's first `count` logical slots for `index` and vacate it.
fn vacate_slot(leaf: &LeafNode, count: usize, index: u32) -> bool {
    let mut remaining = count;
    for segment in leaf.segments() {
        if remaining == 0 {
            return false;
        }
        let in_use = remaining.min(segment.len());
        for slot in &segment[..in_use] {
            if slot.load(Ordering::Relaxed) == index {
                slot.store(INVALID_INDEX, Ordering::Relaxed);
                return true;
            }
        }
        remaining -= in_use;
    }
    debug_assert_eq!(remaining, 0, "leaf chain shorter than its count");
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::CHUNK_SIZE;

    fn world_shape(index: u32) -> ShapeData {
        ShapeData {
            aabb: Aabb::new(
                crate::geometry::Point::new(0.1, 0.1, 0.1),
                crate::geometry::Point::new(0.9, 0.9, 0.9),
            ),
            index,
        }
    }

    #[test]
    fn add_item_spills_into_extensions() {
        // Depth-0 tree: the root is the single leaf cell.
        let mut tree = ParallelOctree::new(0, 4096 * CHUNK_SIZE, 1).unwrap();

        let total = (LEAF_INLINE_CAPACITY + 2 * EXTENSION_CAPACITY) as u32;
        for i in 0..total {
            tree.add_exclusive(&world_shape(i)).unwrap();
        }

        // SAFETY: the root of a depth-0 tree is a leaf.
        let leaf = unsafe { LeafNode::from_node(tree.root()) };
        assert_eq!(leaf.count.load(Ordering::Relaxed), total);

        let segments: Vec<usize> = leaf.segments().map(|segment| segment.len()).collect();
        assert_eq!(
            segments,
            vec![LEAF_INLINE_CAPACITY, EXTENSION_CAPACITY, EXTENSION_CAPACITY]
        );

        let stored: Vec<u32> = leaf
            .segments()
            .flatten()
            .take(total as usize)
            .map(|slot| slot.load(Ordering::Relaxed))
            .collect();
        assert_eq!(stored, (0..total).collect::<Vec<_>>());
    }

    #[test]
    fn remove_vacates_first_match_and_hints() {
        let mut tree = ParallelOctree::new(0, 4096 * CHUNK_SIZE, 1).unwrap();

        tree.add_exclusive(&world_shape(7)).unwrap();
        tree.add_exclusive(&world_shape(7)).unwrap();
        tree.remove_exclusive(&world_shape(7));

        // SAFETY: the root of a depth-0 tree is a leaf.
        let leaf = unsafe { LeafNode::from_node(tree.root()) };
        assert_eq!(leaf.count.load(Ordering::Relaxed), 2);
        assert_eq!(leaf.indices[0].load(Ordering::Relaxed), INVALID_INDEX);
        assert_eq!(leaf.indices[1].load(Ordering::Relaxed), 7);
        assert!(leaf.gc_hint.is_set());
        assert_eq!(leaf.gc_hint.depth(), 0);
    }

    #[test]
    fn remove_propagates_hints_up_interior_nodes() {
        let mut tree = ParallelOctree::new(2, 4096 * CHUNK_SIZE, 1).unwrap();

        let shape = ShapeData {
            aabb: Aabb::new(
                crate::geometry::Point::new(0.1, 0.1, 0.1),
                crate::geometry::Point::new(0.2, 0.2, 0.2),
            ),
            index: 42,
        };
        tree.add_exclusive(&shape).unwrap();

        // SAFETY: size_log > 0 makes the root an interior node.
        let root = unsafe { TreeNode::from_node(tree.root()) };
        assert!(!root.gc_hint.is_set());

        tree.remove_exclusive(&shape);
        assert!(root.gc_hint.is_set());
        assert_eq!(root.gc_hint.depth(), 0);

        let child = NonNull::new(root.children[0].get()).unwrap();
        // SAFETY: depth 1 < size_log, interior node.
        let child = unsafe { TreeNode::from_node(child) };
        assert!(child.gc_hint.is_set());
        assert_eq!(child.gc_hint.depth(), 1);
    }

    #[test]
    fn relocate_within_same_cells_leaves_slots_untouched() {
        let mut tree = ParallelOctree::new(0, 4096 * CHUNK_SIZE, 1).unwrap();

        tree.add_exclusive(&world_shape(3)).unwrap();
        let relocation = ShapeMove {
            aabb_old: world_shape(3).aabb,
            aabb_new: Aabb::new(
                crate::geometry::Point::new(0.2, 0.2, 0.2),
                crate::geometry::Point::new(0.8, 0.8, 0.8),
            ),
            index: 3,
        };
        tree.move_exclusive(&relocation).unwrap();

        // SAFETY: the root of a depth-0 tree is a leaf.
        let leaf = unsafe { LeafNode::from_node(tree.root()) };
        assert_eq!(leaf.count.load(Ordering::Relaxed), 1);
        assert_eq!(leaf.indices[0].load(Ordering::Relaxed), 3);
        assert!(!leaf.gc_hint.is_set());
    }
}
