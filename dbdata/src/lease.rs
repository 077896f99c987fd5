//! Per-thread read leases and the registry the writer drains
//!
//! Every thread that reads a [`DoublyBufferedData`](crate::DoublyBufferedData)
//! gets one [`Lease`] for it. A read holds the lease's gate (a mutex) for as
//! long as the read handle lives. The writer, after flipping the foreground
//! slot, locks and unlocks every registered gate, which can only succeed once
//! the reads that started before the flip have finished.
//!
//! The registry owns the leases. Threads find theirs through a single
//! `thread_local!` table of weak references keyed by registry id. When a
//! thread exits the table is dropped, which removes each of its leases from
//! its registry. When a registry is dropped first it deallocates every lease
//! it holds (and so every `Tls`), the thread's entries just stop upgrading.

use alloc::{
    sync::{Arc, Weak},
    vec::Vec,
};
use core::{
    any::Any,
    cell::RefCell,
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
    time::Duration,
};
use std::time::Instant;

use hashbrown::HashMap;
use parking_lot::{lock_api::ArcMutexGuard, Mutex, RawMutex};
use tracing::{debug, error, trace, warn};

use crate::{raw::RawReadGuard, ReadError};

#[cfg(test)]
mod tests;

type RegistryId = u64;

static NEXT_REGISTRY_ID: AtomicU64 = AtomicU64::new(1);

std::thread_local! {
    static THREAD_LEASES: RefCell<ThreadLeases> = RefCell::new(ThreadLeases::default());
}

pub(crate) struct Lease<Tls> {
    gate: Arc<Mutex<Tls>>,
    // only written by the owning thread
    reading: AtomicBool,
    registry: Mutex<Weak<RegistryShared<Tls>>>,
}

pub(crate) struct LeaseRegistry<Tls> {
    // `None` if no id could be allocated, which disables the registry
    id: Option<RegistryId>,
    shared: Arc<RegistryShared<Tls>>,
}

struct RegistryShared<Tls> {
    leases: Mutex<Vec<Arc<Lease<Tls>>>>,
}

/// The type erased view of a lease that the thread local table needs
trait ThreadLease: Send + Sync {
    /// Remove this lease from its registry, returns false if the lease is in
    /// the middle of a read and was left registered
    fn release(&self) -> bool;

    fn is_reading(&self) -> bool;

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

// Upgrading an entry may hand out the last strong reference while its
// registry is dropped on another thread. Upgraded leases are only dropped
// after the table borrow ends, since a `Tls` destructor may read.
#[derive(Default)]
struct ThreadLeases {
    leases: HashMap<RegistryId, Weak<dyn ThreadLease>>,
}

impl<Tls> Lease<Tls> {
    fn new(tls: Tls, registry: Weak<RegistryShared<Tls>>) -> Self {
        Self {
            gate: Arc::new(Mutex::new(tls)),
            reading: AtomicBool::new(false),
            registry: Mutex::new(registry),
        }
    }

    #[inline]
    pub(crate) fn is_reading(&self) -> bool {
        self.reading.load(Ordering::Relaxed)
    }

    /// Take the gate for one read
    ///
    /// Must be called from the thread owning the lease.
    #[inline]
    pub(crate) fn begin_read(self: Arc<Self>) -> RawReadGuard<Tls> {
        #[cold]
        #[inline(never)]
        fn nested_read() -> ! {
            panic!("tried to read doubly buffered data while this thread already holds a read handle for it, this would deadlock the next modify")
        }

        if self.is_reading() {
            nested_read()
        }

        let gate = self.gate.lock_arc();
        self.reading.store(true, Ordering::Relaxed);
        RawReadGuard::new(self, gate)
    }

    /// Called by [`RawReadGuard`] right before the gate is unlocked
    #[inline]
    pub(crate) fn end_read(&self) {
        self.reading.store(false, Ordering::Relaxed);
    }

    /// Block until the read in progress on this lease (if any) finishes
    fn wait_read_done(&self, slow_drain: Option<Duration>) {
        let Some(threshold) = slow_drain else {
            drop(self.gate.lock());
            return;
        };

        if let Some(gate) = self.gate.try_lock_for(threshold) {
            drop(gate);
            return;
        }

        let start = Instant::now();
        warn!(
            ?threshold,
            "a reader has held its read handle past the slow drain threshold, modify is still waiting"
        );
        drop(self.gate.lock());
        warn!(waited = ?start.elapsed().saturating_add(threshold), "slow reader finished");
    }

    #[cfg(test)]
    pub(crate) fn is_detached(&self) -> bool {
        self.registry.lock().strong_count() == 0
    }
}

impl<Tls: Send + 'static> ThreadLease for Lease<Tls> {
    fn release(&self) -> bool {
        if self.is_reading() {
            return false;
        }

        // don't hold the back-reference lock while taking the registry lock,
        // the registry's drop takes them in the opposite order
        let registry = core::mem::take(&mut *self.registry.lock());

        if let Some(shared) = registry.upgrade() {
            let removed = shared.remove(self);
            drop(shared);
            drop(removed);
        }

        true
    }

    fn is_reading(&self) -> bool {
        Lease::is_reading(self)
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl<Tls> RegistryShared<Tls> {
    fn remove(&self, lease: &Lease<Tls>) -> Option<Arc<Lease<Tls>>> {
        let mut leases = self.leases.lock();
        let index = leases
            .iter()
            .position(|entry| core::ptr::eq(Arc::as_ptr(entry), lease))?;
        let removed = leases.swap_remove(index);
        debug!(remaining = leases.len(), "released read lease");
        Some(removed)
    }
}

impl<Tls> LeaseRegistry<Tls> {
    pub(crate) fn new(capacity: usize) -> Self {
        let id = NEXT_REGISTRY_ID
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |id| id.checked_add(1))
            .ok();

        if id.is_none() {
            error!("ran out of thread registration keys, this doubly buffered data is disabled");
        }

        Self::with_id(id, capacity)
    }

    #[cfg(test)]
    pub(crate) fn disabled() -> Self {
        Self::with_id(None, 0)
    }

    fn with_id(id: Option<RegistryId>, capacity: usize) -> Self {
        Self {
            id,
            shared: Arc::new(RegistryShared {
                leases: Mutex::new(Vec::with_capacity(capacity)),
            }),
        }
    }

    #[inline]
    pub(crate) const fn is_disabled(&self) -> bool {
        self.id.is_none()
    }

    pub(crate) fn len(&self) -> usize {
        self.shared.leases.lock().len()
    }

    /// Wait for every read that may have started before the last flip
    ///
    /// The registry lock is only held while taking a snapshot, threads may
    /// register new leases while the drain is running. Those can only
    /// observe the new foreground, since registering happens after the flip.
    pub(crate) fn drain(&self, slow_drain: Option<Duration>) -> usize {
        let leases = self.shared.leases.lock().clone();

        for lease in &leases {
            lease.wait_read_done(slow_drain);
        }

        leases.len()
    }
}

impl<Tls: Send + 'static> LeaseRegistry<Tls> {
    /// The current thread's lease, if it has one
    pub(crate) fn current(&self) -> Option<Arc<Lease<Tls>>> {
        let id = self.id?;
        THREAD_LEASES
            .try_with(|leases| leases.borrow().get(id))
            .ok()
            .flatten()
    }

    /// The current thread's lease, registering one on first use
    #[inline]
    pub(crate) fn acquire(&self) -> Result<Arc<Lease<Tls>>, ReadError>
    where
        Tls: Default,
    {
        let Some(id) = self.id else {
            return Err(ReadError::Disabled);
        };

        let found = THREAD_LEASES
            .try_with(|leases| leases.borrow().get(id))
            .map_err(|_| ReadError::AllocationFailure)?;

        match found {
            Some(lease) => Ok(lease),
            None => self.register(id),
        }
    }

    #[cold]
    #[inline(never)]
    fn register(&self, id: RegistryId) -> Result<Arc<Lease<Tls>>, ReadError>
    where
        Tls: Default,
    {
        let lease = Arc::new(Lease::new(Tls::default(), Arc::downgrade(&self.shared)));

        {
            let mut leases = self.shared.leases.lock();
            if leases.try_reserve(1).is_err() {
                return Err(ReadError::AllocationFailure);
            }
            leases.push(lease.clone());
            debug!(registered = leases.len(), "registered read lease");
        }

        let bound = THREAD_LEASES.try_with(|leases| {
            let entry: Weak<dyn ThreadLease> = Arc::downgrade(&lease) as Weak<Lease<Tls>>;
            leases.borrow_mut().insert(id, entry)
        });

        match bound {
            Ok(Ok(())) => Ok(lease),
            Ok(Err(())) | Err(_) => {
                lease.release();
                Err(ReadError::AllocationFailure)
            }
        }
    }

    /// Release the current thread's lease, see [`thread_exiting`]
    pub(crate) fn release_current(&self) {
        let Some(id) = self.id else { return };

        let lease = THREAD_LEASES
            .try_with(|leases| {
                let mut leases = leases.borrow_mut();
                match leases.leases.get(&id).and_then(Weak::upgrade) {
                    Some(lease) if lease.is_reading() => Err(lease),
                    lease => {
                        leases.leases.remove(&id);
                        Ok(lease)
                    }
                }
            })
            .unwrap_or(Ok(None));

        match lease {
            Ok(Some(lease)) => {
                lease.release();
            }
            Ok(None) => (),
            Err(lease) => {
                drop(lease);
                release_while_reading()
            }
        }
    }
}

impl<Tls> Drop for LeaseRegistry<Tls> {
    fn drop(&mut self) {
        // the `Tls` destructors run when `leases` is dropped, outside the lock
        let leases = core::mem::take(&mut *self.shared.leases.lock());

        if !leases.is_empty() {
            debug!(count = leases.len(), "deallocating read leases");
        }
    }
}

impl ThreadLeases {
    /// Only called through the registry with this id, which keeps the lease
    /// alive while the returned reference is in use
    fn get<Tls: Send + 'static>(&self, id: RegistryId) -> Option<Arc<Lease<Tls>>> {
        let lease = self.leases.get(&id)?.upgrade()?;
        lease.into_any().downcast().ok()
    }

    /// Bind a lease to this thread, pruning the entries of dropped registries
    fn insert(&mut self, id: RegistryId, lease: Weak<dyn ThreadLease>) -> Result<(), ()> {
        self.leases.try_reserve(1).map_err(drop)?;

        let before = self.leases.len();
        self.leases.retain(|_, lease| lease.strong_count() != 0);

        let pruned = before.saturating_sub(self.leases.len());
        if pruned != 0 {
            trace!(count = pruned, "pruned leases of dropped registries");
        }

        self.leases.insert(id, lease);
        Ok(())
    }

    /// Every lease of this thread that is still alive
    fn live(&self) -> Vec<Arc<dyn ThreadLease>> {
        self.leases.values().filter_map(Weak::upgrade).collect()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.leases.len()
    }
}

impl Drop for ThreadLeases {
    fn drop(&mut self) {
        for lease in self.live() {
            if !lease.release() {
                warn!("a thread exited while holding a read handle, its lease stays registered");
            }
        }
    }
}

#[cold]
#[inline(never)]
fn release_while_reading() -> ! {
    panic!("tried to release a read lease while this thread holds a read handle on it")
}

/// Release every read lease held by the current thread
///
/// Leases are released automatically when a thread exits. This is for hosts
/// that want to give up the leases earlier, for example a pooled thread
/// that will not read again for a long time. A later read simply registers
/// a new lease.
///
/// # Panics
///
/// If the current thread holds a read handle on any doubly buffered data.
pub fn thread_exiting() {
    let leases = THREAD_LEASES
        .try_with(|leases| {
            let mut leases = leases.borrow_mut();
            let live = leases.live();
            if live.iter().any(|lease| lease.is_reading()) {
                return Err(live);
            }
            leases.leases.clear();
            Ok(live)
        })
        .unwrap_or_else(|_| Ok(Vec::new()));

    let leases = match leases {
        Ok(leases) => leases,
        Err(live) => {
            drop(live);
            release_while_reading()
        }
    };

    for lease in &leases {
        lease.release();
    }

    if !leases.is_empty() {
        debug!(count = leases.len(), "thread gave up its read leases");
    }
}

/// How many registries the current thread has an entry for, live or not
#[cfg(test)]
pub(crate) fn thread_table_len() -> usize {
    THREAD_LEASES.with(|leases| leases.borrow().len())
}

pub(crate) type Gate<Tls> = ArcMutexGuard<RawMutex, Tls>;
