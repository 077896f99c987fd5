use core::time::Duration;

use parking_lot::Mutex;

use crate::{
    lease::LeaseRegistry,
    raw::{writer, ReadGuard, SlotPair},
    update::{Modify, Update, WithForeground},
    Builder, ReadError,
};


/// A value that is read often and modified rarely
///
/// See the [crate docs](crate) for how it works. `Tls` is an optional
/// payload every reading thread gets for itself, reachable through
/// [`ReadGuard::tls`].
///
/// Reads on one thread must not nest: reading the same doubly buffered data
/// again, or calling `modify` on it, while this thread still holds a
/// [`ReadGuard`] panics instead of deadlocking.
pub struct DoublyBufferedData<T, Tls = ()> {
    slots: SlotPair<T>,
    registry: LeaseRegistry<Tls>,
    serializer: Mutex<()>,
    slow_drain: Option<Duration>,
}

// SAFETY: readers on different threads get shared references to the
// foreground slot (so `T: Sync`), and the writer mutates the slots from
// whichever thread calls `modify` (so `T: Send`). Each `Tls` lives behind a
// mutex and may be dropped on any thread (so `Tls: Send`)
unsafe impl<T: Send + Sync, Tls: Send> Sync for DoublyBufferedData<T, Tls> {}

impl<T: Default, Tls> Default for DoublyBufferedData<T, Tls> {
    fn default() -> Self {
        Builder::new().build_with(T::default)
    }
}

impl<T, Tls> DoublyBufferedData<T, Tls> {
    /// Both buffers start as clones of `value`
    pub fn new(value: T) -> Self
    where
        T: Clone,
    {
        Builder::new().build(value)
    }

    /// Start from two buffers, which must be equal
    pub fn with_pair(foreground: T, background: T) -> Self {
        Builder::new().build_pair(foreground, background)
    }

    pub(crate) fn from_parts(builder: Builder, foreground: T, background: T) -> Self {
        Self {
            slots: SlotPair::new(foreground, background),
            registry: LeaseRegistry::new(builder.lease_capacity),
            serializer: Mutex::new(()),
            slow_drain: builder.slow_drain_warning,
        }
    }

    #[cfg(test)]
    pub(crate) fn disabled(value: T) -> Self
    where
        T: Clone,
    {
        Self {
            registry: LeaseRegistry::disabled(),
            ..Self::new(value)
        }
    }

    /// Returns true if reads can never succeed, see [`ReadError::Disabled`]
    #[inline]
    pub const fn is_disabled(&self) -> bool {
        self.registry.is_disabled()
    }

    /// The number of threads currently holding a read lease
    pub fn lease_count(&self) -> usize {
        self.registry.len()
    }
}

impl<T, Tls: Default + Send + 'static> DoublyBufferedData<T, Tls> {
    /// Start reading the foreground value
    ///
    /// The first read on each thread registers a read lease for it, later
    /// reads only lock that lease, which is uncontended unless a `modify`
    /// is draining readers at that moment.
    #[inline]
    pub fn try_read(&self) -> Result<ReadGuard<'_, T, Tls>, ReadError> {
        let lease = self.registry.acquire()?;
        let raw = lease.begin_read();

        // SAFETY: the lease's gate is held, and the lease is registered so
        // the writer will not touch this slot until `raw` is dropped
        unsafe {
            let ptr = self.slots.read_foreground();
            Ok(ReadGuard::new(ptr, raw))
        }
    }

    /// Start reading the foreground value
    ///
    /// # Panics
    ///
    /// If the read fails, see [`try_read`](Self::try_read)
    #[inline]
    pub fn read(&self) -> ReadGuard<'_, T, Tls> {
        #[cold]
        #[inline(never)]
        fn read_failed(err: ReadError) -> ! {
            panic!("could not read doubly buffered data: {err}")
        }

        match self.try_read() {
            Ok(guard) => guard,
            Err(err) => read_failed(err),
        }
    }

    /// Apply `f` to both buffers, and publish the result
    ///
    /// `f` returns how much it changed, if that is `0` nothing is published
    /// and `f` is not called again. Otherwise `f` runs a second time on the
    /// other buffer once every reader of it has finished, and must return the
    /// same value. Only one modify runs at a time.
    ///
    /// # Aborts
    ///
    /// If the two runs of `f` return different values, or if `f` panics.
    pub fn modify<F>(&self, f: F) -> usize
    where
        F: FnMut(&mut T) -> usize,
    {
        self.modify_with(Modify(f))
    }

    /// Like [`modify`](Self::modify), but `f` also sees the other buffer
    ///
    /// On the first run the other buffer is the current foreground.
    pub fn modify_with_foreground<F>(&self, f: F) -> usize
    where
        F: FnMut(&mut T, &T) -> usize,
    {
        self.modify_with(WithForeground(f))
    }

    /// Like [`modify`](Self::modify), for any [`Update`]
    pub fn modify_with<U: Update<T>>(&self, update: U) -> usize {
        writer::modify(
            &self.serializer,
            &self.slots,
            &self.registry,
            self.slow_drain,
            update,
        )
    }

    /// Release the current thread's read lease for this doubly buffered data
    ///
    /// This happens automatically when the thread exits. A later read
    /// registers a new lease.
    ///
    /// # Panics
    ///
    /// If the current thread holds a read handle for this doubly buffered data
    pub fn thread_exiting(&self) {
        self.registry.release_current()
    }

    /// Run `f` on the foreground and background buffers
    #[cfg(test)]
    pub(crate) fn with_slots<R>(&self, f: impl FnOnce(&T, &T) -> R) -> R {
        let _serializer = self.serializer.lock();
        let (foreground, background) = self.slots.get(self.slots.background_index());

        // SAFETY: the write serializer is held so no slot is being mutated
        unsafe { f(&*foreground, &*background) }
    }
}

impl<T, Tls> core::fmt::Debug for DoublyBufferedData<T, Tls> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DoublyBufferedData")
            .field("leases", &self.lease_count())
            .field("disabled", &self.is_disabled())
            .finish_non_exhaustive()
    }
}
