use core::{marker::PhantomData, ops, ptr::NonNull};

use alloc::sync::Arc;

use crate::lease::{Gate, Lease};

/// A scoped read of the foreground value
///
/// The value will not change until this guard is dropped, and the next
/// `modify` will wait for that to happen. Don't hold on to a guard across
/// blocking calls.
#[must_use = "dropping the guard ends the read immediately"]
pub struct ReadGuard<'a, T: ?Sized, Tls = ()> {
    ptr: NonNull<T>,
    raw: RawReadGuard<Tls>,
    lt: PhantomData<&'a T>,
}

/// Holds a lease's gate, and marks the lease idle before unlocking it
pub(crate) struct RawReadGuard<Tls> {
    // `Drop` runs before the fields are dropped, so the gate is still
    // locked when `end_read` runs
    gate: Gate<Tls>,
    lease: Arc<Lease<Tls>>,
}

impl<Tls> RawReadGuard<Tls> {
    #[inline]
    pub(crate) fn new(lease: Arc<Lease<Tls>>, gate: Gate<Tls>) -> Self {
        Self { gate, lease }
    }
}

impl<Tls> Drop for RawReadGuard<Tls> {
    #[inline]
    fn drop(&mut self) {
        self.lease.end_read();
    }
}

impl<'a, T: ?Sized, Tls> ReadGuard<'a, T, Tls> {
    /// # Safety
    ///
    /// `ptr` must be valid for reads for `'a`, and must stay unchanged for as
    /// long as `raw` is alive
    #[inline]
    pub(crate) unsafe fn new(ptr: *const T, raw: RawReadGuard<Tls>) -> Self {
        Self {
            // SAFETY: the caller ensures the pointer is valid, so it is non-null
            ptr: unsafe { NonNull::new_unchecked(ptr.cast_mut()) },
            raw,
            lt: PhantomData,
        }
    }

    /// This thread's payload for this doubly buffered data
    #[inline]
    pub fn tls(&self) -> &Tls {
        &self.raw.gate
    }

    /// This thread's payload for this doubly buffered data
    #[inline]
    pub fn tls_mut(&mut self) -> &mut Tls {
        &mut self.raw.gate
    }

    /// Narrow the handle to a part of the value, or give it back with `f`'s error
    ///
    /// The mapped handle keeps holding this thread's read lease.
    pub fn try_map<U: ?Sized, E>(
        self,
        f: impl FnOnce(&T) -> Result<&U, E>,
    ) -> Result<ReadGuard<'a, U, Tls>, (Self, E)> {
        match f(&*self) {
            Ok(ptr) => {
                let ptr = NonNull::from(ptr);
                Ok(ReadGuard {
                    ptr,
                    raw: self.raw,
                    lt: PhantomData,
                })
            }
            Err(err) => Err((self, err)),
        }
    }

    /// Narrow the handle to a part of the value, the lease stays held
    pub fn map<U: ?Sized>(self, f: impl FnOnce(&T) -> &U) -> ReadGuard<'a, U, Tls> {
        match self.try_map::<_, core::convert::Infallible>(move |t| Ok(f(t))) {
            Ok(guard) => guard,
            Err((_, err)) => match err {},
        }
    }
}

impl<T: ?Sized, Tls> ops::Deref for ReadGuard<'_, T, Tls> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &Self::Target {
        // SAFETY: the pointer stays valid and unchanged while the lease's
        // gate is held, see `ReadGuard::new`
        unsafe { self.ptr.as_ref() }
    }
}

impl<T: ?Sized + core::fmt::Debug, Tls> core::fmt::Debug for ReadGuard<'_, T, Tls> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Debug::fmt(&**self, f)
    }
}
