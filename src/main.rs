//! Debug binary for concurrent mutation and GC cycles.
//!
//! Hammers one tree from several workers (add, move, remove), then runs a
//! full garbage-collection cycle with parallel sweeps, printing throughput
//! and chunk accounting after each phase.
//!
//! Run with:
//! ```bash
//! cargo run --release
//! RUST_LOG=parallel_octree=debug cargo run --features tracing
//! ```

#![allow(clippy::unwrap_used)]
#![allow(clippy::cast_precision_loss)]

use std::time::Instant;

use parallel_octree::{Aabb, GcRoot, ParallelOctree, Point, ShapeData, ShapeMove};

const SIZE_LOG: u32 = 4;
const WORKERS: u32 = 8;
const SHAPES_PER_WORKER: u32 = 4_000;
const BUFFER_BYTES: usize = 64 << 20;

// =============================================================================
// Deterministic shape generation (minstd linear congruential generator)
// =============================================================================

struct MinStd(u64);

impl MinStd {
    fn new(seed: u64) -> Self {
        Self(seed.max(1))
    }

    fn next_f32(&mut self) -> f32 {
        self.0 = self.0 * 16807 % 2_147_483_647;
        self.0 as f32 / 2_147_483_647.0
    }
}

fn random_aabb(rng: &mut MinStd, size: f32) -> Aabb {
    let (x0, x1) = (rng.next_f32() * size, rng.next_f32() * size);
    let (y0, y1) = (rng.next_f32() * size, rng.next_f32() * size);
    let (z0, z1) = (rng.next_f32() * size, rng.next_f32() * size);

    Aabb::new(
        Point::new(x0.min(x1), y0.min(y1), z0.min(z1)),
        Point::new(x0.max(x1), y0.max(y1), z0.max(z1)),
    )
}

/// Shrink a random box so a shape overlaps a handful of cells instead of
/// half the world.
fn shape_sized(aabb: Aabb, size: f32) -> Aabb {
    let cap = size / 8.0;
    Aabb::new(
        aabb.min,
        Point::new(
            aabb.max.x.min(aabb.min.x + cap),
            aabb.max.y.min(aabb.min.y + cap),
            aabb.max.z.min(aabb.min.z + cap),
        ),
    )
}

fn worker_shapes(worker: u32, field: f32) -> Vec<ShapeData> {
    let mut rng = MinStd::new(u64::from(worker) * 0x9E37_79B9 + 1);
    (0..SHAPES_PER_WORKER)
        .map(|i| ShapeData {
            aabb: shape_sized(random_aabb(&mut rng, field), field),
            index: worker * SHAPES_PER_WORKER + i,
        })
        .collect()
}

// =============================================================================
// Phases
// =============================================================================

fn run_adds(tree: &ParallelOctree, shapes: &[Vec<ShapeData>]) {
    let start = Instant::now();

    std::thread::scope(|scope| {
        for (worker, batch) in shapes.iter().enumerate() {
            scope.spawn(move || {
                for shape in batch {
                    tree.add_synchronized(shape, worker as u32)
                        .expect("arena exhausted during add phase");
                }
            });
        }
    });

    let total = shapes.iter().map(Vec::len).sum::<usize>();
    let elapsed = start.elapsed();
    println!(
        "add:    {total} shapes x {WORKERS} workers in {elapsed:?} ({:.0} ops/s)",
        total as f64 / elapsed.as_secs_f64()
    );
}

fn run_moves(tree: &ParallelOctree, shapes: &mut [Vec<ShapeData>]) {
    let start = Instant::now();
    let field = tree.field_size();

    std::thread::scope(|scope| {
        for (worker, batch) in shapes.iter_mut().enumerate() {
            scope.spawn(move || {
                let mut rng = MinStd::new(0xBF58_476D + worker as u64);
                for shape in batch.iter_mut() {
                    let target = shape_sized(random_aabb(&mut rng, field), field);
                    tree.move_synchronized(
                        &ShapeMove {
                            aabb_old: shape.aabb,
                            aabb_new: target,
                            index: shape.index,
                        },
                        worker as u32,
                    )
                    .expect("arena exhausted during move phase");
                    shape.aabb = target;
                }
            });
        }
    });

    println!("move:   done in {:?}", start.elapsed());
}

fn run_removes(tree: &ParallelOctree, shapes: &[Vec<ShapeData>]) {
    let start = Instant::now();

    std::thread::scope(|scope| {
        for (worker, batch) in shapes.iter().enumerate() {
            scope.spawn(move || {
                for shape in batch {
                    tree.remove_synchronized(shape, worker as u32);
                }
            });
        }
    });

    println!("remove: done in {:?}", start.elapsed());
}

fn run_gc(tree: &mut ParallelOctree) {
    let start = Instant::now();

    let mut roots = Vec::new();
    tree.prepare_garbage_collection_default(&mut roots);
    let root_count = roots.len();

    // Fan the disjoint roots out over sweeper threads.
    let sweepers = (WORKERS as usize).min(root_count.max(1));
    let mut queues: Vec<Vec<GcRoot>> = (0..sweepers).map(|_| Vec::new()).collect();
    for (i, root) in roots.into_iter().enumerate() {
        queues[i % sweepers].push(root);
    }

    {
        let tree = &*tree;
        std::thread::scope(|scope| {
            for queue in queues {
                scope.spawn(move || {
                    for root in queue {
                        tree.collect_garbage(root);
                    }
                });
            }
        });
    }

    println!("gc:     {root_count} roots swept in {:?}", start.elapsed());
}

fn print_accounting(tree: &mut ParallelOctree, label: &str) {
    let live = tree.live_tree_chunks();
    let pooled = tree.pooled_chunks();
    let arena = tree.arena_allocated_chunks();
    println!(
        "chunks[{label}]: arena={arena} live={live} pooled={pooled} ({} cells)",
        tree.cell_snapshots().len()
    );
}

fn main() {
    #[cfg(feature = "tracing")]
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut tree =
        ParallelOctree::new(SIZE_LOG, BUFFER_BYTES, WORKERS).expect("buffer too small");
    println!(
        "tree: size_log={SIZE_LOG} field={} workers={WORKERS}",
        tree.field_size()
    );

    let mut shapes: Vec<Vec<ShapeData>> = (0..WORKERS)
        .map(|w| worker_shapes(w, tree.field_size()))
        .collect();

    run_adds(&tree, &shapes);
    print_accounting(&mut tree, "post-add");

    run_moves(&tree, &mut shapes);
    print_accounting(&mut tree, "post-move");

    run_removes(&tree, &shapes);
    run_gc(&mut tree);
    print_accounting(&mut tree, "post-gc");
}
