//! The update protocol
//!
//! 1. take the write serializer
//! 2. apply the update to the background slot
//! 3. publish the background slot (a `Release` store of the selector)
//! 4. drain every registered read lease
//! 5. apply the same update to the old foreground slot
//!
//! After step 4 no reader can still be looking at the old foreground, so
//! it is safe to mutate. Both runs of the update must report the same
//! change size, otherwise the slots have diverged and the process aborts.

use core::time::Duration;

use parking_lot::Mutex;
use tracing::{error, trace};

use crate::{lease::LeaseRegistry, raw::SlotPair, update::Update};

pub(crate) fn modify<T, Tls, U>(
    serializer: &Mutex<()>,
    slots: &SlotPair<T>,
    registry: &LeaseRegistry<Tls>,
    slow_drain: Option<Duration>,
    mut update: U,
) -> usize
where
    Tls: Send + 'static,
    U: Update<T>,
{
    #[cold]
    #[inline(never)]
    fn modify_while_reading() -> ! {
        panic!("tried to modify doubly buffered data while this thread holds a read handle for it, this would deadlock")
    }

    // the drain would wait on our own lease forever
    if registry.current().is_some_and(|lease| lease.is_reading()) {
        modify_while_reading()
    }

    let _serializer = serializer.lock();

    // a panic from here on may leave a slot half updated
    let no_unwind = NoUnwind;

    let background = slots.background_index();
    let (foreground, target) = slots.get(background);

    // SAFETY: readers only ever look at the foreground slot, and the last
    // modify drained every reader that could have seen this slot in the
    // foreground. The write serializer is held, so no other writer touches it
    let changed = unsafe { update.apply(&mut *target, &*foreground) };

    if changed == 0 {
        core::mem::forget(no_unwind);
        trace!("update made no change, nothing published");
        return 0;
    }

    slots.publish(background);
    let drained = registry.drain(slow_drain);
    trace!(index = background, drained, "published new foreground");

    let (foreground, target) = slots.get(background ^ 1);

    // SAFETY: the drain above waited for every read that started before the
    // publish, and all later reads see the new foreground. The write
    // serializer is held, so no other writer touches it
    let changed_again = unsafe { update.apply_last(&mut *target, &*foreground) };

    core::mem::forget(no_unwind);

    if changed_again != changed {
        diverged(changed, changed_again, background)
    }

    changed
}

#[cold]
#[inline(never)]
fn diverged(first: usize, second: usize, foreground: usize) -> ! {
    error!(
        first,
        second, foreground, "update returned different change sizes for the two buffers, they have diverged"
    );
    std::process::abort()
}

struct NoUnwind;

impl Drop for NoUnwind {
    fn drop(&mut self) {
        error!("detected unwind while applying an update, the buffers may have diverged which cannot be recovered from");
        std::process::abort()
    }
}
