//! The parallel octree engine.
//!
//! A fixed-depth octree over the cube `[0, 2^size_log]^3` mapping shape
//! indices to every cell their AABB overlaps. Mutations come in two
//! flavors selected by a const generic on the traverser: *synchronized*
//! entry points take `&self` plus a caller-stable worker index and may run
//! fully in parallel; *exclusive* entry points take `&mut self` and skip
//! all atomic read-modify-writes.
//!
//! # Caller contract
//!
//! - No two concurrent calls share a worker index.
//! - Add/remove for the *same* shape index never race each other; distinct
//!   indices race freely.
//! - GC is phased: all mutators quiesce before
//!   [`ParallelOctree::prepare_garbage_collection`], and every
//!   [`ParallelOctree::collect_garbage`] sweep finishes before mutation
//!   resumes. Sweeps over the roots of one preparation may run in parallel
//!   with each other. The engine does not enforce this ordering.
//!
//! Violations are debug assertions; release behavior is undefined (but
//! stays memory-safe for null-child and missing-index cases, which
//! degenerate to skipped work).

use std::ptr::NonNull;

use crate::allocator::OctreeAllocator;
use crate::arena::OctreeError;
use crate::geometry::{Aabb, Point, ShapeData, ShapeMove};
use crate::node::{init_zeroed, LeafNode, Node, TreeNode};

mod gc;
mod test_hooks;
mod traverse;


pub use gc::GcRoot;
pub use test_hooks::CellSnapshot;

use traverse::Traverser;

/// Default root depth for [`ParallelOctree::prepare_garbage_collection`]:
/// up to 64 disjoint subtrees, enough to feed a typical worker pool.
pub const DEFAULT_GC_ROOT_DEPTH: u32 = 2;

/// A concurrent many-to-many index from shape indices to octree cells.
pub struct ParallelOctree {
    allocator: OctreeAllocator,
    root: NonNull<Node>,
    size_log: u32,
}

// SAFETY: all shared-path mutation goes through atomics (child links, leaf
// counters, GC hints) or through the allocator's per-worker slots; the
// remaining exclusivity requirements are the documented caller contract.
unsafe impl Send for ParallelOctree {}
unsafe impl Sync for ParallelOctree {}

impl ParallelOctree {
    /// Create a tree of depth `size_log` over an arena of `buffer_bytes`
    /// (rounded up to whole chunks), with `workers` allocator slots.
    ///
    /// The root is allocated eagerly: an interior node when `size_log > 0`,
    /// otherwise the tree is a single leaf cell.
    ///
    /// # Errors
    ///
    /// [`OctreeError::OutOfMemory`] when the buffer cannot hold even the
    /// initial refill batch.
    pub fn new(size_log: u32, buffer_bytes: usize, workers: u32) -> Result<Self, OctreeError> {
        debug_assert!(size_log < 31, "world side length overflows");

        let allocator = OctreeAllocator::new(buffer_bytes, workers);
        let chunk = allocator.allocate::<false>(0)?;

        // SAFETY: freshly allocated exclusive chunk; zero is a valid empty
        // node of either kind.
        let root: NonNull<Node> = if size_log > 0 {
            unsafe { init_zeroed::<TreeNode>(chunk) }.cast()
        } else {
            unsafe { init_zeroed::<LeafNode>(chunk) }.cast()
        };

        Ok(Self {
            allocator,
            root,
            size_log,
        })
    }

    /// World side length.
    #[must_use]
    pub fn field_size(&self) -> f32 {
        (1u32 << self.size_log) as f32
    }

    /// Tree depth fixed at construction.
    #[must_use]
    pub fn size_log(&self) -> u32 {
        self.size_log
    }

    /// Worker slots fixed at construction.
    #[must_use]
    pub fn workers(&self) -> u32 {
        self.allocator.workers()
    }

    /// Register `shape` in every cell its AABB overlaps.
    ///
    /// # Errors
    ///
    /// [`OctreeError::OutOfMemory`]; cells already populated keep the shape.
    pub fn add_synchronized(&self, shape: &ShapeData, worker: u32) -> Result<(), OctreeError> {
        Traverser::<true>::new(self, worker).add(shape)
    }

    /// Single-threaded [`ParallelOctree::add_synchronized`].
    ///
    /// # Errors
    ///
    /// [`OctreeError::OutOfMemory`].
    pub fn add_exclusive(&mut self, shape: &ShapeData) -> Result<(), OctreeError> {
        Traverser::<false>::new(self, 0).add(shape)
    }

    /// Vacate `shape`'s index from every cell its AABB overlaps and deposit
    /// GC hints along the touched paths.
    ///
    /// The shape must currently be registered with this exact AABB; removing
    /// an absent shape is a contract violation.
    pub fn remove_synchronized(&self, shape: &ShapeData, worker: u32) {
        Traverser::<true>::new(self, worker).remove(shape);
    }

    /// Single-threaded [`ParallelOctree::remove_synchronized`].
    pub fn remove_exclusive(&mut self, shape: &ShapeData) {
        Traverser::<false>::new(self, 0).remove(shape);
    }

    /// Relocate a shape: remove it from cells only the old AABB overlaps,
    /// add it to cells only the new one overlaps, leave the rest untouched.
    ///
    /// # Errors
    ///
    /// [`OctreeError::OutOfMemory`].
    pub fn move_synchronized(&self, shape_move: &ShapeMove, worker: u32) -> Result<(), OctreeError> {
        Traverser::<true>::new(self, worker).relocate(shape_move)
    }

    /// Single-threaded [`ParallelOctree::move_synchronized`].
    ///
    /// # Errors
    ///
    /// [`OctreeError::OutOfMemory`].
    pub fn move_exclusive(&mut self, shape_move: &ShapeMove) -> Result<(), OctreeError> {
        Traverser::<false>::new(self, 0).relocate(shape_move)
    }

    /// The whole world as an AABB.
    #[must_use]
    pub(crate) fn initial_aabb(&self) -> Aabb {
        let size = self.field_size();
        Aabb::new(Point::new(0.0, 0.0, 0.0), Point::new(size, size, size))
    }

    pub(crate) fn allocator(&self) -> &OctreeAllocator {
        &self.allocator
    }

    pub(crate) fn allocator_mut(&mut self) -> &mut OctreeAllocator {
        &mut self.allocator
    }

    pub(crate) fn root(&self) -> NonNull<Node> {
        self.root
    }

    /// Chunks the arena has handed out so far.
    #[must_use]
    pub fn arena_allocated_chunks(&self) -> usize {
        self.allocator.arena_allocated_chunks()
    }

    /// Chunks idle in the allocator's pools. Requires quiescence.
    #[must_use]
    pub fn pooled_chunks(&mut self) -> usize {
        self.allocator.pooled_chunks()
    }
}

impl std::fmt::Debug for ParallelOctree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParallelOctree")
            .field("size_log", &self.size_log)
            .field("workers", &self.allocator.workers())
            .field("allocator", &self.allocator)
            .finish()
    }
}
