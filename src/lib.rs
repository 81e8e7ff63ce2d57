//! # Parallel Octree
//!
//! A concurrent spatial index: a fixed-depth octree maintaining a
//! many-to-many mapping between integer-tagged AABBs and the cells they
//! overlap, mutated by many worker threads without coarse-grained locking.
//!
//! ## Design
//!
//! - Nodes are cache-line chunks from a pre-sized bump arena; child links
//!   are atomic 32-bit relative pointers so an interior node fits one line.
//! - New octants and leaf-overflow extensions are installed lock-free with
//!   a single CAS; install-race losers recycle their chunk locally.
//! - Allocation is two-tier: per-worker free-list pools, a shared pool bank
//!   refilled by GC, and the arena as the final fallback.
//! - Removes only vacate slots and deposit GC hints; a phased mark/sweep
//!   collector compacts leaves and reclaims emptied subtrees, fanning out
//!   over disjoint roots.
//!
//! ## Concurrency
//!
//! Synchronized mutators run fully in parallel, keyed by caller-supplied
//! worker indices; exclusive variants take `&mut self`. GC phases require
//! mutator quiescence (the caller's barrier). See [`octree`] for the full
//! contract.

pub mod allocator;
pub mod arena;
pub mod chunk_pool;
pub mod geometry;
pub mod octree;
pub mod relative_ptr;
pub mod spin_lock;

pub(crate) mod node;
pub(crate) mod tracing_helpers;

pub use arena::{ChunkArena, OctreeError, CHUNK_SIZE};
pub use geometry::{Aabb, Point, ShapeData, ShapeMove};
pub use node::{EXTENSION_CAPACITY, INVALID_INDEX, LEAF_INLINE_CAPACITY};
pub use octree::{CellSnapshot, GcRoot, ParallelOctree, DEFAULT_GC_ROOT_DEPTH};
