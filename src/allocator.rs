//! Two-tier chunk allocator: per-worker pools over a shared bank over the
//! arena.
//!
//! The hot path never synchronizes: each worker owns a private free-list on
//! its own cache line and allocates/frees there. When the private pool runs
//! dry the worker claims one pool from the shared bank with a single
//! fetch-add and merges it in; when the bank is dry too, the arena hands out
//! a contiguous batch of [`REFILL_BATCH`] chunks at the cost of one
//! fetch-add. The bank is refilled in bulk by the GC sweep via
//! [`OctreeAllocator::add_pools`].
//!
//! Phasing contract (caller-enforced, see the engine docs): mutators never
//! run concurrently with [`OctreeAllocator::prepare_gc`] or
//! [`OctreeAllocator::add_pools`]; no two concurrent callers share a worker
//! index.

use std::cell::UnsafeCell;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;
use parking_lot::Mutex;

use crate::arena::{ChunkArena, OctreeError, CHUNK_SIZE};
use crate::chunk_pool::ChunkPool;
use crate::tracing_helpers::debug_log;

/// Chunks pulled from the arena per private-pool refill.
pub const REFILL_BATCH: usize = 64;

/// Per-worker allocator slot. Only the owning worker touches `pool`;
/// `pools_not_empty` is additionally republished by the GC phases.
struct LocalPart {
    pool: ChunkPool<false>,
    pools_not_empty: AtomicBool,
}

impl LocalPart {
    const fn new() -> Self {
        Self {
            pool: ChunkPool::new(),
            pools_not_empty: AtomicBool::new(false),
        }
    }
}

/// The octree's chunk allocator.
pub struct OctreeAllocator {
    arena: ChunkArena,

    /// Shared bank of pools handed over by the GC sweep. Grown only under
    /// `growth_lock` during the GC phase; read lock-free by mutators, which
    /// is sound because the phases never overlap.
    bank: UnsafeCell<Vec<ChunkPool<false>>>,

    /// Next unclaimed bank slot. May overshoot the bank length.
    pool_offset: AtomicUsize,

    growth_lock: Mutex<()>,

    /// One slot per worker, each on its own cache line.
    locals: Box<[CachePadded<LocalPart>]>,
}

// SAFETY: arena and pools synchronize internally or via the documented
// phasing/worker-exclusivity contracts; the bank UnsafeCell is only mutated
// during the single-threaded or mutex-serialized GC phases.
unsafe impl Send for OctreeAllocator {}
unsafe impl Sync for OctreeAllocator {}

impl OctreeAllocator {
    /// Build an allocator with `workers` private slots over a fresh arena of
    /// `buffer_bytes` (rounded up to whole chunks).
    #[must_use]
    pub fn new(buffer_bytes: usize, workers: u32) -> Self {
        debug_assert!(workers >= 1, "at least one worker slot is required");
        let workers = workers.max(1) as usize;

        Self {
            arena: ChunkArena::new(buffer_bytes),
            bank: UnsafeCell::new(Vec::new()),
            pool_offset: AtomicUsize::new(0),
            growth_lock: Mutex::new(()),
            locals: (0..workers)
                .map(|_| CachePadded::new(LocalPart::new()))
                .collect(),
        }
    }

    /// Number of worker slots, fixed at construction.
    #[must_use]
    pub fn workers(&self) -> u32 {
        self.locals.len() as u32
    }

    /// Allocate one chunk on behalf of `worker`.
    ///
    /// `SYNCHRONIZED` selects atomic claims on the shared tiers; the
    /// exclusive flavor uses plain increments. The private tier never
    /// synchronizes either way.
    pub fn allocate<const SYNCHRONIZED: bool>(
        &self,
        worker: u32,
    ) -> Result<NonNull<u8>, OctreeError> {
        let local = self.local(worker);

        if let Some(chunk) = local.pool.try_pop_unsync() {
            return Ok(chunk);
        }

        if local.pools_not_empty.load(Ordering::Relaxed) {
            let slot = if SYNCHRONIZED {
                self.pool_offset.fetch_add(1, Ordering::Relaxed)
            } else {
                let slot = self.pool_offset.load(Ordering::Relaxed);
                self.pool_offset.store(slot + 1, Ordering::Relaxed);
                slot
            };

            // SAFETY: the bank is never resized while mutators run (phasing
            // contract), and slot claims are unique, so reading the Vec and
            // draining the claimed pool are race-free.
            let bank = unsafe { &*self.bank.get() };
            if let Some(pool) = bank.get(slot) {
                if let Some(chain) = pool.take_all_unsync() {
                    local.pool.merge_unsync(chain);
                }
                if let Some(chunk) = local.pool.try_pop_unsync() {
                    return Ok(chunk);
                }
                debug_assert!(false, "claimed bank slot {slot} held an empty pool");
            } else {
                local.pools_not_empty.store(false, Ordering::Relaxed);
            }
        }

        self.refill_from_arena::<SYNCHRONIZED>(local)
    }

    /// Return a chunk to `worker`'s private pool.
    ///
    /// # Safety
    ///
    /// `chunk` must be an arena chunk that no other owner will touch while
    /// pooled (e.g. a CAS-install loser or a GC-detached node).
    pub unsafe fn deallocate(&self, worker: u32, chunk: NonNull<u8>) {
        // SAFETY: forwarded caller contract; worker exclusivity makes the
        // unsynchronized push safe.
        unsafe { self.local(worker).pool.push_unsync(chunk) };
    }

    /// Hand a batch of pools to the shared bank at the end of a GC sweep.
    ///
    /// Sweeps over disjoint roots may call this concurrently; appends are
    /// serialized by the growth mutex. Requires the bank offset to have been
    /// reset by [`OctreeAllocator::prepare_gc`] this cycle.
    pub fn add_pools(&self, pools: Vec<ChunkPool<false>>) {
        if pools.is_empty() {
            return;
        }

        let _guard = self.growth_lock.lock();
        debug_assert_eq!(
            self.pool_offset.load(Ordering::Relaxed),
            0,
            "add_pools requires a prepare_gc reset"
        );

        // SAFETY: mutators are quiescent during the GC phase and the growth
        // mutex serializes concurrent sweeps, so the Vec is ours to grow.
        let bank = unsafe { &mut *self.bank.get() };
        let was_empty = bank.is_empty();

        debug_log!(pools = pools.len(), "bank refill from gc sweep");
        for pool in pools {
            debug_assert!(!pool.is_empty(), "gc handed over an empty pool");
            bank.push(pool);
        }

        if was_empty && !bank.is_empty() {
            for local in self.locals.iter() {
                local.pools_not_empty.store(true, Ordering::Relaxed);
            }
        }
    }

    /// Single-threaded start of a GC cycle: discard the consumed bank
    /// prefix, reset the claim offset, republish bank availability to every
    /// worker.
    pub fn prepare_gc(&mut self) {
        let consumed = *self.pool_offset.get_mut();
        if consumed == 0 {
            return;
        }

        let bank = self.bank.get_mut();
        let consumed = consumed.min(bank.len());
        debug_log!(consumed, remaining = bank.len() - consumed, "bank reset");

        bank.drain(..consumed);
        *self.pool_offset.get_mut() = 0;

        let not_empty = !bank.is_empty();
        for local in self.locals.iter() {
            local.pools_not_empty.store(not_empty, Ordering::Relaxed);
        }
    }

    /// Chunks handed out by the arena so far (live nodes + pooled chunks).
    #[must_use]
    pub fn arena_allocated_chunks(&self) -> usize {
        self.arena.allocated_chunks()
    }

    /// Chunks currently idle in the private pools and the unclaimed bank.
    /// Requires exclusive access; O(total pooled chunks).
    #[must_use]
    pub fn pooled_chunks(&mut self) -> usize {
        let claimed = *self.pool_offset.get_mut();
        let bank: usize = self
            .bank
            .get_mut()
            .iter()
            .skip(claimed)
            .map(ChunkPool::len)
            .sum();
        let locals: usize = self.locals.iter().map(|l| l.pool.len()).sum();
        bank + locals
    }

    fn local(&self, worker: u32) -> &LocalPart {
        debug_assert!(
            (worker as usize) < self.locals.len(),
            "worker index {worker} out of range"
        );
        &self.locals[worker as usize]
    }

    fn refill_from_arena<const SYNCHRONIZED: bool>(
        &self,
        local: &LocalPart,
    ) -> Result<NonNull<u8>, OctreeError> {
        let batch = self.arena.allocate_chunks::<SYNCHRONIZED>(REFILL_BATCH)?;
        debug_log!(batch = REFILL_BATCH, "arena refill");

        for i in 1..REFILL_BATCH {
            // SAFETY: the batch is REFILL_BATCH contiguous chunks owned by
            // this worker until published.
            unsafe {
                local
                    .pool
                    .push_unsync(NonNull::new_unchecked(batch.as_ptr().add(i * CHUNK_SIZE)));
            }
        }
        Ok(batch)
    }
}

impl std::fmt::Debug for OctreeAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OctreeAllocator")
            .field("arena", &self.arena)
            .field("workers", &self.locals.len())
            .field("pool_offset", &self.pool_offset.load(Ordering::Relaxed))
            .finish()
    }
}
