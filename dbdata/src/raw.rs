use core::{
    cell::UnsafeCell,
    sync::atomic::{AtomicUsize, Ordering},
};

use crossbeam_utils::CachePadded;

mod reader;
pub(crate) mod writer;

pub use reader::ReadGuard;
pub(crate) use reader::RawReadGuard;

/// The two buffered instances and the selector naming the foreground one
pub(crate) struct SlotPair<T> {
    slots: [UnsafeCell<T>; 2],
    // only ever 0 or 1
    foreground: CachePadded<AtomicUsize>,
}

impl<T> SlotPair<T> {
    #[inline]
    pub(crate) const fn new(foreground: T, background: T) -> Self {
        Self {
            slots: [UnsafeCell::new(foreground), UnsafeCell::new(background)],
            foreground: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    /// # Safety
    ///
    /// The caller must hold a read lease lock registered with the lease
    /// registry that the writer drains, and must only read through the
    /// returned pointer until that lock is released.
    #[inline]
    pub(crate) unsafe fn read_foreground(&self) -> *const T {
        // pairs with the `Release` store in `publish`, so every write the
        // update made before the flip is visible through this pointer
        let index = self.foreground.load(Ordering::Acquire);
        self.slots[index].get()
    }

    /// The index of the slot readers cannot be looking at
    ///
    /// Only meaningful while holding the write serializer, since that is the
    /// only place the selector changes.
    #[inline]
    pub(crate) fn background_index(&self) -> usize {
        self.foreground.load(Ordering::Relaxed) ^ 1
    }

    /// Make `index` the foreground slot
    ///
    /// Only called by the update protocol while holding the write serializer
    #[inline]
    pub(crate) fn publish(&self, index: usize) {
        debug_assert!(index < 2);
        self.foreground.store(index, Ordering::Release);
    }

    /// Returns `(peer, target)`, where `target` is the slot at `index`
    #[inline]
    pub(crate) const fn get(&self, index: usize) -> (*const T, *mut T) {
        (self.slots[index ^ 1].get().cast_const(), self.slots[index].get())
    }
}
