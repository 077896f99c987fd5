#![forbid(unsafe_code)]

//! Updates applied by [`DoublyBufferedData::modify_with`](crate::DoublyBufferedData::modify_with)
//!
//! Every update runs twice, once on each buffer. Given two equal buffers,
//! both runs must leave them equal again and must return the same change
//! size. The process is aborted if the change sizes differ.

/// An update to a doubly buffered value
pub trait Update<T: ?Sized>: Sized {
    /// Apply the update to the background buffer
    ///
    /// `foreground` is the other buffer. Returns how much changed, `0` means
    /// nothing changed and the update is not published.
    fn apply(&mut self, background: &mut T, foreground: &T) -> usize;

    /// Apply the update for the second and last time
    ///
    /// This can be overridden to move owned arguments into the buffer instead
    /// of cloning them a second time. It must behave exactly like `apply`.
    fn apply_last(mut self, background: &mut T, foreground: &T) -> usize {
        self.apply(background, foreground)
    }
}

/// Adapts `FnMut(&mut T) -> usize`
pub struct Modify<F>(pub(crate) F);

/// Adapts `FnMut(&mut T, &T) -> usize`, the second argument is the foreground
pub struct WithForeground<F>(pub(crate) F);

/// An update function together with the arguments passed to both of its runs
pub struct WithArgs<A, F> {
    args: A,
    f: F,
}

/// Bind `args` to `f`, so both runs of the update see the same arguments
///
/// ```
/// use dbdata::{with_args, DoublyBufferedData};
///
/// let data: DoublyBufferedData<Vec<u32>> = DoublyBufferedData::new(Vec::new());
///
/// let added = data.modify_with(with_args([1, 2, 3], |list: &mut Vec<u32>, items: &[u32; 3]| {
///     list.extend_from_slice(items);
///     items.len()
/// }));
///
/// assert_eq!(added, 3);
/// assert_eq!(*data.read(), [1, 2, 3]);
/// ```
pub const fn with_args<A, F>(args: A, f: F) -> WithArgs<A, F> {
    WithArgs { args, f }
}

impl<T: ?Sized, F: FnMut(&mut T) -> usize> Update<T> for Modify<F> {
    #[inline]
    fn apply(&mut self, background: &mut T, _foreground: &T) -> usize {
        (self.0)(background)
    }
}

impl<T: ?Sized, F: FnMut(&mut T, &T) -> usize> Update<T> for WithForeground<F> {
    #[inline]
    fn apply(&mut self, background: &mut T, foreground: &T) -> usize {
        (self.0)(background, foreground)
    }
}

impl<T: ?Sized, A, F: FnMut(&mut T, &A) -> usize> Update<T> for WithArgs<A, F> {
    #[inline]
    fn apply(&mut self, background: &mut T, _foreground: &T) -> usize {
        (self.f)(background, &self.args)
    }
}

impl<T: ?Sized, U: Update<T>> Update<T> for alloc::vec::Vec<U> {
    fn apply(&mut self, background: &mut T, foreground: &T) -> usize {
        self.iter_mut().fold(0, |changed, update| {
            changed.saturating_add(update.apply(background, foreground))
        })
    }

    fn apply_last(self, background: &mut T, foreground: &T) -> usize {
        self.into_iter().fold(0, |changed, update| {
            changed.saturating_add(update.apply_last(background, foreground))
        })
    }
}
