//! Shared helpers for the integration tests: deterministic shape
//! generation and a brute-force grid oracle for leaf membership.

#![allow(dead_code)]

use std::collections::BTreeMap;

use parallel_octree::{Aabb, CellSnapshot, ParallelOctree, Point, ShapeData};

/// Deterministic minstd-style generator so every run sees the same shapes.
pub struct MinStd(u64);

impl MinStd {
    pub fn new(seed: u64) -> Self {
        Self(seed.max(1))
    }

    pub fn next_f32(&mut self) -> f32 {
        self.0 = self.0 * 16807 % 2_147_483_647;
        self.0 as f32 / 2_147_483_647.0
    }
}

/// A random box within the world, edge lengths capped at a quarter of it.
pub fn random_shape(rng: &mut MinStd, field: f32, index: u32) -> ShapeData {
    let cap = (field / 4.0).max(0.25);
    let corner = |rng: &mut MinStd| rng.next_f32() * field;

    let (x0, y0, z0) = (corner(rng), corner(rng), corner(rng));
    let aabb = Aabb::new(
        Point::new(x0, y0, z0),
        Point::new(
            (x0 + rng.next_f32() * cap).min(field),
            (y0 + rng.next_f32() * cap).min(field),
            (z0 + rng.next_f32() * cap).min(field),
        ),
    );
    ShapeData { aabb, index }
}

pub fn random_shapes(seed: u64, count: u32, field: f32) -> Vec<ShapeData> {
    let mut rng = MinStd::new(seed);
    (0..count)
        .map(|i| random_shape(&mut rng, field, i))
        .collect()
}

/// Integer coordinates of a leaf cell at full depth.
pub type Cell = (u32, u32, u32);

/// Brute force the expected leaf contents: every unit cell of the
/// `2^size_log` grid that a shape's AABB overlaps (touching counts) holds
/// its index.
pub fn expected_cells(size_log: u32, shapes: &[ShapeData]) -> BTreeMap<Cell, Vec<u32>> {
    let side = 1u32 << size_log;
    let mut cells: BTreeMap<Cell, Vec<u32>> = BTreeMap::new();

    for shape in shapes {
        for x in 0..side {
            for y in 0..side {
                for z in 0..side {
                    let cell = Aabb::new(
                        Point::new(x as f32, y as f32, z as f32),
                        Point::new((x + 1) as f32, (y + 1) as f32, (z + 1) as f32),
                    );
                    if cell.intersects(&shape.aabb) {
                        cells.entry((x, y, z)).or_default().push(shape.index);
                    }
                }
            }
        }
    }
    cells
}

/// Observed per-cell surviving indices, sorted for multiset comparison.
pub fn observed_cells(tree: &ParallelOctree) -> BTreeMap<Cell, Vec<u32>> {
    tree.cell_snapshots()
        .iter()
        .filter(|snapshot| !snapshot.live_indices().is_empty())
        .map(|snapshot| {
            let mut indices = snapshot.live_indices();
            indices.sort_unstable();
            (cell_of(snapshot), indices)
        })
        .collect()
}

/// Expected map normalized the same way (sorted, empty cells dropped).
pub fn normalized(mut cells: BTreeMap<Cell, Vec<u32>>) -> BTreeMap<Cell, Vec<u32>> {
    cells.retain(|_, indices| !indices.is_empty());
    for indices in cells.values_mut() {
        indices.sort_unstable();
    }
    cells
}

pub fn cell_of(snapshot: &CellSnapshot) -> Cell {
    (
        snapshot.aabb.min.x as u32,
        snapshot.aabb.min.y as u32,
        snapshot.aabb.min.z as u32,
    )
}

/// Run a full GC cycle at the given root depth, sweeping every root.
pub fn run_gc(tree: &mut ParallelOctree, depth: u32) -> usize {
    let mut roots = Vec::new();
    tree.prepare_garbage_collection(&mut roots, depth);
    let count = roots.len();
    for root in roots {
        tree.collect_garbage(root);
    }
    count
}

/// Arena conservation: every chunk the arena handed out is either live in
/// the tree or idle in a pool.
pub fn assert_chunk_conservation(tree: &mut ParallelOctree) {
    let live = tree.live_tree_chunks();
    let pooled = tree.pooled_chunks();
    assert_eq!(
        tree.arena_allocated_chunks(),
        live + pooled,
        "chunk leak: live={live} pooled={pooled}"
    );
}
