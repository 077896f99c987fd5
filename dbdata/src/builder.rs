use core::time::Duration;

use crate::DoublyBufferedData;

/// Configures a [`DoublyBufferedData`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Builder {
    pub(crate) lease_capacity: usize,
    pub(crate) slow_drain_warning: Option<Duration>,
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder {
    #[inline]
    pub const fn new() -> Self {
        Self {
            lease_capacity: 64,
            slow_drain_warning: None,
        }
    }

    /// How many read leases to make room for up front, 64 by default
    #[inline]
    pub const fn lease_capacity(mut self, capacity: usize) -> Self {
        self.lease_capacity = capacity;
        self
    }

    /// Log a warning when `modify` waits longer than `threshold` for a single
    /// reader to finish
    ///
    /// `modify` keeps waiting after the warning, this only makes stalled
    /// readers visible. Off by default.
    #[inline]
    pub const fn slow_drain_warning(mut self, threshold: Duration) -> Self {
        self.slow_drain_warning = Some(threshold);
        self
    }

    /// Both buffers start as clones of `value`
    pub fn build<T: Clone, Tls>(self, value: T) -> DoublyBufferedData<T, Tls> {
        self.build_pair(value.clone(), value)
    }

    /// Both buffers are created by `f`, which must return equal values
    pub fn build_with<T, Tls>(self, mut f: impl FnMut() -> T) -> DoublyBufferedData<T, Tls> {
        self.build_pair(f(), f())
    }

    /// Start from two buffers, which must be equal
    pub fn build_pair<T, Tls>(self, foreground: T, background: T) -> DoublyBufferedData<T, Tls> {
        DoublyBufferedData::from_parts(self, foreground, background)
    }
}
