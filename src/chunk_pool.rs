//! Intrusive LIFO free-list of chunks.
//!
//! A free chunk's first word doubles as the `next` link, so the pool needs
//! no storage of its own. The `SYNCHRONIZED` flavor guards compound
//! operations with a [`SpinLock`]; the unsynchronized flavor relies on the
//! caller holding exclusive access (per-worker pools, claimed bank slots).
//!
//! Either flavor additionally exposes `*_unsync` entry points that skip the
//! lock even on the locked flavor, for callers that can assert exclusivity.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, Ordering};

use crate::arena::CHUNK_SIZE;
use crate::spin_lock::SpinLock;

/// Link view of a free chunk: its first word.
#[repr(C)]
struct FreeChunk {
    next: *mut FreeChunk,
}

const _: () = assert!(CHUNK_SIZE >= std::mem::size_of::<FreeChunk>());

/// A whole free-list detached from a pool in O(1), ready to be spliced into
/// another pool. Owns the chained chunks until merged.
pub struct ChunkChain {
    head: NonNull<FreeChunk>,
}

// SAFETY: a detached chain is exclusively owned by its holder; the chunks it
// links are not reachable from any pool.
unsafe impl Send for ChunkChain {}

// A chain always holds at least its head chunk, so there is no is_empty.
#[allow(clippy::len_without_is_empty)]
impl ChunkChain {
    /// Number of chunks in the chain. O(n).
    #[must_use]
    pub fn len(&self) -> usize {
        let mut n = 0;
        let mut cur = self.head.as_ptr();
        while !cur.is_null() {
            n += 1;
            // SAFETY: every linked chunk was pushed through a pool and its
            // first word is a valid link.
            cur = unsafe { (*cur).next };
        }
        n
    }
}

/// Intrusive chunk free-list; `SYNCHRONIZED` selects the spin-locked flavor.
pub struct ChunkPool<const SYNCHRONIZED: bool> {
    head: AtomicPtr<FreeChunk>,
    lock: SpinLock,
}

// SAFETY: the synchronized flavor serializes compound updates through its
// spin lock; the unsynchronized flavor (and the `*_unsync` entry points) are
// documented to require caller-side exclusivity.
unsafe impl<const SYNCHRONIZED: bool> Send for ChunkPool<SYNCHRONIZED> {}
unsafe impl<const SYNCHRONIZED: bool> Sync for ChunkPool<SYNCHRONIZED> {}

impl<const SYNCHRONIZED: bool> ChunkPool<SYNCHRONIZED> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            head: AtomicPtr::new(std::ptr::null_mut()),
            lock: SpinLock::new(),
        }
    }

    /// Advisory emptiness check; never locks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Relaxed).is_null()
    }

    /// Number of pooled chunks. O(n), never locks; the caller asserts no
    /// concurrent mutation.
    #[must_use]
    pub fn len(&self) -> usize {
        let mut n = 0;
        let mut cur = self.head.load(Ordering::Relaxed);
        while !cur.is_null() {
            n += 1;
            // SAFETY: linked chunks carry valid first-word links.
            cur = unsafe { (*cur).next };
        }
        n
    }

    /// Pop one chunk, locking on the synchronized flavor.
    #[must_use]
    pub fn try_pop(&self) -> Option<NonNull<u8>> {
        if SYNCHRONIZED {
            let _guard = self.lock.lock();
            self.pop_inner()
        } else {
            self.pop_inner()
        }
    }

    /// Pop one chunk without locking, even on the synchronized flavor.
    /// The caller asserts exclusive access to the pool.
    #[must_use]
    pub fn try_pop_unsync(&self) -> Option<NonNull<u8>> {
        self.pop_inner()
    }

    /// Push a chunk, locking on the synchronized flavor.
    ///
    /// # Safety
    ///
    /// `chunk` must point to `CHUNK_SIZE` writable bytes that no other owner
    /// will touch while the pool holds them.
    pub unsafe fn push(&self, chunk: NonNull<u8>) {
        if SYNCHRONIZED {
            let _guard = self.lock.lock();
            // SAFETY: forwarded caller contract.
            unsafe { self.push_inner(chunk) };
        } else {
            // SAFETY: forwarded caller contract.
            unsafe { self.push_inner(chunk) };
        }
    }

    /// Push without locking, even on the synchronized flavor.
    ///
    /// # Safety
    ///
    /// Same as [`ChunkPool::push`], plus the caller asserts exclusive access
    /// to the pool.
    pub unsafe fn push_unsync(&self, chunk: NonNull<u8>) {
        // SAFETY: forwarded caller contract.
        unsafe { self.push_inner(chunk) };
    }

    /// Detach the entire list in O(1), locking on the synchronized flavor.
    #[must_use]
    pub fn take_all(&self) -> Option<ChunkChain> {
        if SYNCHRONIZED {
            let _guard = self.lock.lock();
            self.take_inner()
        } else {
            self.take_inner()
        }
    }

    /// Detach the entire list without locking; caller asserts exclusivity.
    #[must_use]
    pub fn take_all_unsync(&self) -> Option<ChunkChain> {
        self.take_inner()
    }

    /// Prepend a detached chain.
    ///
    /// The chain is walked to its tail before the lock is taken, so the
    /// critical section stays O(1) while the call itself is O(chain length).
    pub fn merge(&self, chain: ChunkChain) {
        let tail = chain_tail(&chain);
        if SYNCHRONIZED {
            let _guard = self.lock.lock();
            self.splice_inner(chain, tail);
        } else {
            self.splice_inner(chain, tail);
        }
    }

    /// Prepend a detached chain without locking; caller asserts exclusivity.
    pub fn merge_unsync(&self, chain: ChunkChain) {
        let tail = chain_tail(&chain);
        self.splice_inner(chain, tail);
    }

    fn pop_inner(&self) -> Option<NonNull<u8>> {
        let head = NonNull::new(self.head.load(Ordering::Relaxed))?;
        // SAFETY: a pooled chunk's first word is a valid link.
        let next = unsafe { (*head.as_ptr()).next };
        self.head.store(next, Ordering::Relaxed);
        Some(head.cast())
    }

    unsafe fn push_inner(&self, chunk: NonNull<u8>) {
        let chunk = chunk.cast::<FreeChunk>();
        // SAFETY: caller hands over CHUNK_SIZE writable bytes.
        unsafe {
            (*chunk.as_ptr()).next = self.head.load(Ordering::Relaxed);
        }
        self.head.store(chunk.as_ptr(), Ordering::Relaxed);
    }

    fn take_inner(&self) -> Option<ChunkChain> {
        let head = NonNull::new(self.head.load(Ordering::Relaxed))?;
        self.head.store(std::ptr::null_mut(), Ordering::Relaxed);
        Some(ChunkChain { head })
    }

    fn splice_inner(&self, chain: ChunkChain, tail: NonNull<FreeChunk>) {
        // SAFETY: the chain is exclusively owned; its tail link is writable.
        unsafe {
            (*tail.as_ptr()).next = self.head.load(Ordering::Relaxed);
        }
        self.head.store(chain.head.as_ptr(), Ordering::Relaxed);
    }
}

fn chain_tail(chain: &ChunkChain) -> NonNull<FreeChunk> {
    let mut cur = chain.head;
    // SAFETY: linked chunks carry valid first-word links.
    while let Some(next) = NonNull::new(unsafe { (*cur.as_ptr()).next }) {
        cur = next;
    }
    cur
}

impl<const SYNCHRONIZED: bool> Default for ChunkPool<SYNCHRONIZED> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const SYNCHRONIZED: bool> std::fmt::Debug for ChunkPool<SYNCHRONIZED> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkPool")
            .field("synchronized", &SYNCHRONIZED)
            .field("is_empty", &self.is_empty())
            .finish()
    }
}
