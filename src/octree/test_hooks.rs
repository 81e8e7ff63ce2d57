//! Tree inspection helpers for tests and debug tooling.
//!
//! These walks take plain snapshots without any synchronization, so they
//! require the same quiescence as the GC phases: no mutator may run while
//! a snapshot is taken.

use std::ptr::NonNull;
use std::sync::atomic::Ordering;

use crate::geometry::Aabb;
use crate::node::{LeafNode, TreeNode, INVALID_INDEX};

use super::ParallelOctree;

/// Snapshot of one allocated leaf cell.
#[derive(Debug, Clone, PartialEq)]
pub struct CellSnapshot {
    /// The cell's AABB in world space.
    pub aabb: Aabb,
    /// The leaf's logical slot counter, vacated slots included.
    pub count: u32,
    /// The first `count` logical slots as stored, sentinel included.
    pub slots: Vec<u32>,
    /// Physical slot capacity of the chain (inline plus extensions).
    pub physical_slots: usize,
}

impl CellSnapshot {
    /// Surviving (non-sentinel) indices in slot order.
    #[must_use]
    pub fn live_indices(&self) -> Vec<u32> {
        self.slots
            .iter()
            .copied()
            .filter(|&index| index != INVALID_INDEX)
            .collect()
    }
}

impl ParallelOctree {
    /// Snapshot every allocated leaf in depth-first octant order.
    #[must_use]
    pub fn cell_snapshots(&self) -> Vec<CellSnapshot> {
        let mut cells = Vec::new();
        let aabb = self.initial_aabb();

        if self.size_log() == 0 {
            // SAFETY: a depth-0 tree's root is its single leaf.
            let leaf = unsafe { LeafNode::from_node(self.root()) };
            cells.push(snapshot_leaf(leaf, &aabb));
        } else {
            // SAFETY: size_log > 0 makes the root an interior node.
            let root = unsafe { TreeNode::from_node(self.root()) };
            collect_cells(self.size_log(), root, &aabb, 0, &mut cells);
        }
        cells
    }

    /// Chunks reachable from the root: every node plus every leaf
    /// extension. Together with the allocator's pools this accounts for
    /// all chunks the arena ever handed out.
    #[must_use]
    pub fn live_tree_chunks(&self) -> usize {
        if self.size_log() == 0 {
            // SAFETY: a depth-0 tree's root is its single leaf.
            let leaf = unsafe { LeafNode::from_node(self.root()) };
            return leaf.segments().count();
        }
        // SAFETY: size_log > 0 makes the root an interior node.
        let root = unsafe { TreeNode::from_node(self.root()) };
        count_chunks(self.size_log(), root, 0)
    }
}

fn collect_cells(
    size_log: u32,
    tree: &TreeNode,
    aabb: &Aabb,
    depth: u32,
    cells: &mut Vec<CellSnapshot>,
) {
    let centre = aabb.centre();
    let child_depth = depth + 1;

    for (octant, link) in tree.children.iter().enumerate() {
        let Some(child) = NonNull::new(link.get()) else {
            continue;
        };
        let child_aabb = aabb.octant(octant as u32, &centre);

        if child_depth == size_log {
            // SAFETY: depth discriminates the node kind.
            let leaf = unsafe { LeafNode::from_node(child) };
            cells.push(snapshot_leaf(leaf, &child_aabb));
        } else {
            // SAFETY: child_depth < size_log, interior node.
            let subtree = unsafe { TreeNode::from_node(child) };
            collect_cells(size_log, subtree, &child_aabb, child_depth, cells);
        }
    }
}

fn snapshot_leaf(leaf: &LeafNode, aabb: &Aabb) -> CellSnapshot {
    let count = leaf.count.load(Ordering::Relaxed);

    let mut physical_slots = 0;
    let mut slots = Vec::with_capacity(count as usize);
    for segment in leaf.segments() {
        physical_slots += segment.len();
        for slot in segment {
            if slots.len() < count as usize {
                slots.push(slot.load(Ordering::Relaxed));
            }
        }
    }

    CellSnapshot {
        aabb: *aabb,
        count,
        slots,
        physical_slots,
    }
}

fn count_chunks(size_log: u32, tree: &TreeNode, depth: u32) -> usize {
    let child_depth = depth + 1;
    let mut chunks = 1;

    for link in &tree.children {
        let Some(child) = NonNull::new(link.get()) else {
            continue;
        };
        chunks += if child_depth == size_log {
            // SAFETY: depth discriminates the node kind.
            let leaf = unsafe { LeafNode::from_node(child) };
            leaf.segments().count()
        } else {
            // SAFETY: child_depth < size_log, interior node.
            count_chunks(size_log, unsafe { TreeNode::from_node(child) }, child_depth)
        };
    }
    chunks
}

#[cfg(test)]
mod tests {
    use crate::arena::CHUNK_SIZE;
    use crate::geometry::{Aabb, Point, ShapeData};
    use crate::octree::ParallelOctree;

    #[test]
    fn snapshots_cover_only_allocated_cells() {
        let mut tree = ParallelOctree::new(1, 4096 * CHUNK_SIZE, 1).unwrap();
        assert!(tree.cell_snapshots().is_empty());

        let shape = ShapeData {
            aabb: Aabb::new(Point::new(0.1, 0.1, 0.1), Point::new(0.2, 0.2, 0.2)),
            index: 11,
        };
        tree.add_exclusive(&shape).unwrap();

        let cells = tree.cell_snapshots();
        assert_eq!(cells.len(), 1);
        assert_eq!(cells[0].count, 1);
        assert_eq!(cells[0].live_indices(), vec![11]);
        assert_eq!(cells[0].aabb.min, Point::new(0.0, 0.0, 0.0));
    }

    #[test]
    fn live_chunks_track_nodes_and_extensions() {
        let mut tree = ParallelOctree::new(0, 4096 * CHUNK_SIZE, 1).unwrap();
        // Root leaf only.
        assert_eq!(tree.live_tree_chunks(), 1);

        let world = ShapeData {
            aabb: Aabb::new(Point::new(0.0, 0.0, 0.0), Point::new(1.0, 1.0, 1.0)),
            index: 0,
        };
        for i in 0..20 {
            tree.add_exclusive(&ShapeData { index: i, ..world }).unwrap();
        }
        // 20 entries spill into one extension.
        assert_eq!(tree.live_tree_chunks(), 2);
    }
}
