//! Monotonic chunk arena: the backing store for every node in the tree.
//!
//! The arena owns one cache-line-aligned byte buffer, fixed at construction,
//! and hands out whole chunks by bumping an offset. It never takes chunks
//! back; reclaimed chunks circulate through [`crate::chunk_pool::ChunkPool`]
//! free-lists instead.

use std::alloc::{alloc, dealloc, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Allocation unit and alignment: one cache line.
///
/// Every node kind fits in a single chunk; chunk identity is destroyed on
/// reclamation, so any chunk can be re-handed out as any node kind.
pub const CHUNK_SIZE: usize = 64;

/// Error raised by mutations that needed a chunk the arena could not supply.
///
/// The tree stays consistent up to the failing allocation; work already
/// published is not rolled back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OctreeError {
    /// The arena's byte buffer is exhausted.
    OutOfMemory,
}

impl std::fmt::Display for OctreeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OutOfMemory => write!(f, "octree arena is out of memory"),
        }
    }
}

impl std::error::Error for OctreeError {}

/// Cache-line-aligned bump allocator over a fixed buffer.
pub struct ChunkArena {
    data: NonNull<u8>,
    capacity: usize,
    offset: AtomicUsize,
}

// SAFETY: the buffer is owned exclusively by the arena; concurrent
// reservations go through the atomic offset and yield disjoint ranges.
unsafe impl Send for ChunkArena {}
unsafe impl Sync for ChunkArena {}

impl ChunkArena {
    /// Create an arena over `byte_capacity` bytes, rounded up to a whole
    /// number of chunks. A zero capacity yields an arena that always fails.
    #[must_use]
    pub fn new(byte_capacity: usize) -> Self {
        let capacity = byte_capacity.div_ceil(CHUNK_SIZE) * CHUNK_SIZE;

        let data = if capacity == 0 {
            NonNull::dangling()
        } else {
            let layout = Layout::from_size_align(capacity, CHUNK_SIZE)
                .expect("arena capacity overflows Layout");
            // SAFETY: layout has non-zero size.
            let raw = unsafe { alloc(layout) };
            NonNull::new(raw).unwrap_or_else(|| std::alloc::handle_alloc_error(layout))
        };

        Self {
            data,
            capacity,
            offset: AtomicUsize::new(0),
        }
    }

    /// Total capacity in chunks.
    #[must_use]
    pub fn capacity_chunks(&self) -> usize {
        self.capacity / CHUNK_SIZE
    }

    /// Chunks handed out so far. Monotonic; reclamation never returns here.
    #[must_use]
    pub fn allocated_chunks(&self) -> usize {
        self.offset.load(Ordering::Relaxed).min(self.capacity) / CHUNK_SIZE
    }

    /// Reserve `count` contiguous chunks and return the first byte.
    ///
    /// `SYNCHRONIZED` selects an atomic fetch-add reservation; the exclusive
    /// flavor does a plain read-modify-write and relies on the caller having
    /// sole access for the duration of the call.
    ///
    /// The returned pointer is valid for `count * CHUNK_SIZE` bytes for the
    /// lifetime of the arena; the memory is uninitialized.
    pub fn allocate_chunks<const SYNCHRONIZED: bool>(
        &self,
        count: usize,
    ) -> Result<NonNull<u8>, OctreeError> {
        let bytes = count * CHUNK_SIZE;

        let prev = if SYNCHRONIZED {
            self.offset.fetch_add(bytes, Ordering::Relaxed)
        } else {
            let prev = self.offset.load(Ordering::Relaxed);
            self.offset.store(prev + bytes, Ordering::Relaxed);
            prev
        };

        if prev + bytes > self.capacity {
            return Err(OctreeError::OutOfMemory);
        }

        // SAFETY: prev + bytes <= capacity, so the range is inside the
        // buffer, and the reservation above made it exclusively ours.
        Ok(unsafe { NonNull::new_unchecked(self.data.as_ptr().add(prev)) })
    }
}

impl Drop for ChunkArena {
    fn drop(&mut self) {
        if self.capacity > 0 {
            let layout = Layout::from_size_align(self.capacity, CHUNK_SIZE)
                .expect("layout validated at construction");
            // SAFETY: data was allocated with exactly this layout.
            unsafe { dealloc(self.data.as_ptr(), layout) };
        }
    }
}

impl std::fmt::Debug for ChunkArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkArena")
            .field("capacity_chunks", &self.capacity_chunks())
            .field("allocated_chunks", &self.allocated_chunks())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_rounds_up_to_chunk_multiple() {
        assert_eq!(ChunkArena::new(1).capacity_chunks(), 1);
        assert_eq!(ChunkArena::new(CHUNK_SIZE).capacity_chunks(), 1);
        assert_eq!(ChunkArena::new(CHUNK_SIZE + 1).capacity_chunks(), 2);
        assert_eq!(ChunkArena::new(0).capacity_chunks(), 0);
    }

    #[test]
    fn chunks_are_cache_line_aligned_and_contiguous() {
        let arena = ChunkArena::new(8 * CHUNK_SIZE);

        let first = arena.allocate_chunks::<false>(1).unwrap();
        let second = arena.allocate_chunks::<false>(2).unwrap();

        assert_eq!(first.as_ptr() as usize % CHUNK_SIZE, 0);
        assert_eq!(second.as_ptr() as usize % CHUNK_SIZE, 0);
        assert_eq!(
            second.as_ptr() as usize - first.as_ptr() as usize,
            CHUNK_SIZE
        );
    }

    #[test]
    fn exhaustion_reports_out_of_memory() {
        let arena = ChunkArena::new(2 * CHUNK_SIZE);

        assert!(arena.allocate_chunks::<false>(2).is_ok());
        assert_eq!(
            arena.allocate_chunks::<false>(1),
            Err(OctreeError::OutOfMemory)
        );
    }

    #[test]
    fn zero_capacity_always_fails() {
        let arena = ChunkArena::new(0);
        assert_eq!(
            arena.allocate_chunks::<true>(1),
            Err(OctreeError::OutOfMemory)
        );
    }

    #[test]
    fn synchronized_reservations_are_disjoint() {
        use std::collections::HashSet;
        use std::sync::Arc;
        use std::thread;

        const THREADS: usize = 4;
        const PER_THREAD: usize = 32;

        let arena = Arc::new(ChunkArena::new(THREADS * PER_THREAD * CHUNK_SIZE));

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let arena = Arc::clone(&arena);
                thread::spawn(move || {
                    (0..PER_THREAD)
                        .map(|_| arena.allocate_chunks::<true>(1).unwrap().as_ptr() as usize)
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for h in handles {
            for addr in h.join().unwrap() {
                assert!(seen.insert(addr), "chunk handed out twice");
            }
        }
        assert_eq!(seen.len(), THREADS * PER_THREAD);
    }
}
