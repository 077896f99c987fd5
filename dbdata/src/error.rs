/// Why a read could not start
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ReadError {
    /// The primitive could not set up per-thread registration when it was
    /// created. This is permanent, every read on it fails the same way.
    #[error("doubly buffered data is disabled: no thread registration key was available")]
    Disabled,
    /// A read lease could not be allocated or bound to the current thread.
    ///
    /// This is transient, the read may be retried. The one exception is a
    /// read issued while the current thread is tearing down its thread
    /// locals, which keeps failing until the thread exits.
    #[error("failed to allocate a read lease for the current thread")]
    AllocationFailure,
}
