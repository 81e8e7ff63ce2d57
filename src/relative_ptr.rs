//! Atomic relative pointer: a child link stored as a signed 32-bit offset.
//!
//! A [`RelativePtr`] encodes a raw pointer as `target - own_address`, stored
//! in an `AtomicI32`. Offset 0 is reserved for null, which makes
//! self-reference unrepresentable. Halving the link width is what lets a
//! tree node keep eight children plus a GC hint inside one cache line.
//!
//! The owning structure must guarantee that every possible target lies
//! within `i32` range of the link — here both ends always live in the same
//! arena buffer. Violations are programming errors and are caught by debug
//! assertions.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicI32, Ordering};

/// An atomic pointer stored as a signed offset from its own address.
///
/// `get` carries Acquire and `store`/`compare_exchange` Release semantics,
/// so a reader that observes a non-null link also observes the pointee's
/// initialization.
#[repr(transparent)]
pub struct RelativePtr<T> {
    offset: AtomicI32,
    _marker: PhantomData<*mut T>,
}

impl<T> RelativePtr<T> {
    /// A null link.
    #[must_use]
    pub const fn null() -> Self {
        Self {
            offset: AtomicI32::new(0),
            _marker: PhantomData,
        }
    }

    /// Decode the current target, or null.
    #[inline]
    #[must_use]
    pub fn get(&self) -> *mut T {
        self.decode(self.offset.load(Ordering::Acquire))
    }

    #[inline]
    #[must_use]
    pub fn is_null(&self) -> bool {
        self.offset.load(Ordering::Acquire) == 0
    }

    /// Point the link at `ptr` (null allowed).
    #[inline]
    pub fn store(&self, ptr: *mut T) {
        self.offset.store(self.encode(ptr), Ordering::Release);
    }

    /// Strong compare-exchange on the decoded pointer value.
    ///
    /// On success returns `true`. On failure returns `false` and rewrites
    /// `*expected` with the pointer decoded from the observed offset, so the
    /// caller can continue with the value that won.
    #[inline]
    pub fn compare_exchange(&self, expected: &mut *mut T, desired: *mut T) -> bool {
        let expected_offset = self.encode(*expected);
        match self.offset.compare_exchange(
            expected_offset,
            self.encode(desired),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => true,
            Err(observed) => {
                *expected = self.decode(observed);
                false
            }
        }
    }

    #[inline]
    fn encode(&self, ptr: *mut T) -> i32 {
        if ptr.is_null() {
            return 0;
        }

        let diff = (ptr as isize).wrapping_sub(std::ptr::from_ref(self) as isize);
        debug_assert!(diff != 0, "relative pointer cannot reference itself");
        debug_assert!(
            i32::try_from(diff).is_ok(),
            "relative pointer offset out of range: {diff}"
        );

        #[allow(clippy::cast_possible_truncation)]
        let offset = diff as i32;
        offset
    }

    #[inline]
    fn decode(&self, offset: i32) -> *mut T {
        if offset == 0 {
            return std::ptr::null_mut();
        }
        (std::ptr::from_ref(self) as isize).wrapping_add(offset as isize) as *mut T
    }
}

impl<T> Default for RelativePtr<T> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T> std::fmt::Debug for RelativePtr<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("RelativePtr").field(&self.get()).finish()
    }
}
