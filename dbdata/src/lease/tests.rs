use alloc::sync::Arc;
use core::{
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};
use std::{sync::mpsc, thread};

use super::{thread_table_len, LeaseRegistry, ThreadLease};
use crate::ReadError;

#[test]
fn same_thread_reuses_its_lease() {
    let registry = LeaseRegistry::<()>::new(4);

    let first = registry.acquire().unwrap();
    let second = registry.acquire().unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert!(Arc::ptr_eq(&first, &registry.current().unwrap()));
    assert_eq!(registry.len(), 1);
}

#[test]
fn each_registry_has_its_own_lease() {
    let a = LeaseRegistry::<()>::new(4);
    let b = LeaseRegistry::<()>::new(4);

    let lease_a = a.acquire().unwrap();
    let lease_b = b.acquire().unwrap();

    assert!(!Arc::ptr_eq(&lease_a, &lease_b));
    assert_eq!(a.len(), 1);
    assert_eq!(b.len(), 1);
}

#[test]
fn each_thread_has_its_own_lease() {
    let registry = LeaseRegistry::<u32>::new(4);

    let mine = registry.acquire().unwrap();

    thread::scope(|s| {
        s.spawn(|| {
            let theirs = registry.acquire().unwrap();
            assert!(!Arc::ptr_eq(&mine, &theirs));
        });
    });

    assert!(registry.len() >= 1);
}

#[test]
fn disabled_registry() {
    let registry = LeaseRegistry::<()>::disabled();

    assert!(registry.is_disabled());
    assert!(matches!(registry.acquire(), Err(ReadError::Disabled)));
    assert!(registry.current().is_none());
    assert_eq!(registry.drain(None), 0);
}

#[test]
fn drop_detaches_leases() {
    let registry = LeaseRegistry::<()>::new(4);
    let lease = registry.acquire().unwrap();

    assert!(!lease.is_detached());
    drop(registry);
    assert!(lease.is_detached());

    // the thread table only refers to it weakly
    assert_eq!(Arc::strong_count(&lease), 1);

    // releasing a detached lease doesn't touch the dropped registry
    assert!(lease.release());
}

#[test]
fn release_removes_from_registry() {
    let registry = LeaseRegistry::<()>::new(4);
    let lease = registry.acquire().unwrap();

    assert_eq!(registry.len(), 1);
    assert!(lease.release());
    assert_eq!(registry.len(), 0);
    assert!(lease.is_detached());

    // a second release is a no-op
    assert!(lease.release());
}

#[test]
fn release_current_then_reacquire() {
    let registry = LeaseRegistry::<()>::new(4);
    let first = registry.acquire().unwrap();

    registry.release_current();
    assert_eq!(registry.len(), 0);
    assert!(registry.current().is_none());

    let second = registry.acquire().unwrap();
    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(registry.len(), 1);
}

#[test]
fn reading_lease_is_not_released() {
    let registry = LeaseRegistry::<()>::new(4);
    let lease = registry.acquire().unwrap();

    let guard = lease.clone().begin_read();
    assert!(lease.is_reading());
    assert!(!lease.release());
    assert_eq!(registry.len(), 1);

    drop(guard);
    assert!(!lease.is_reading());
    assert!(lease.release());
    assert_eq!(registry.len(), 0);
}

#[test]
fn drop_deallocates_leases() {
    let registry = LeaseRegistry::<()>::new(4);
    let lease = Arc::downgrade(&registry.acquire().unwrap());

    assert!(lease.upgrade().is_some());
    drop(registry);
    assert!(lease.upgrade().is_none());
}

#[test]
fn released_lease_is_registered_again() {
    let registry = LeaseRegistry::<()>::new(4);

    let lease = registry.acquire().unwrap();
    assert!(lease.release());
    drop(lease);
    assert_eq!(registry.len(), 0);

    // the thread's entry no longer upgrades
    assert!(registry.current().is_none());
    let _lease = registry.acquire().unwrap();
    assert_eq!(registry.len(), 1);
}

#[test]
fn stale_entries_are_pruned() {
    let before = thread_table_len();

    let stale = LeaseRegistry::<()>::new(4);
    stale.acquire().unwrap();
    drop(stale);
    assert_eq!(thread_table_len(), before + 1);

    let registry = LeaseRegistry::<()>::new(4);
    let _lease = registry.acquire().unwrap();
    assert_eq!(thread_table_len(), before + 1);
}

#[test]
fn thread_exit_releases_leases() {
    let registry = Arc::new(LeaseRegistry::<String>::new(4));

    thread::spawn({
        let registry = registry.clone();
        move || {
            registry.acquire().unwrap();
        }
    })
    .join()
    .unwrap();

    assert_eq!(registry.len(), 0);
}

#[test]
fn drain_waits_for_reads() {
    let registry = LeaseRegistry::<()>::new(4);
    let drained = AtomicBool::new(false);

    thread::scope(|s| {
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let registry = &registry;

        s.spawn(move || {
            let guard = registry.acquire().unwrap().begin_read();
            started_tx.send(()).unwrap();
            release_rx.recv().unwrap();
            drop(guard);
        });

        started_rx.recv().unwrap();

        let drain = s.spawn(|| {
            let count = registry.drain(None);
            drained.store(true, Ordering::Release);
            count
        });

        thread::sleep(Duration::from_millis(50));
        assert!(!drained.load(Ordering::Acquire));

        release_tx.send(()).unwrap();
        assert_eq!(drain.join().unwrap(), 1);
        assert!(drained.load(Ordering::Acquire));
    });
}

#[test]
fn drain_does_not_block_registration() {
    let registry = LeaseRegistry::<()>::new(4);

    thread::scope(|s| {
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let registry = &registry;

        s.spawn(move || {
            let guard = registry.acquire().unwrap().begin_read();
            started_tx.send(()).unwrap();
            release_rx.recv().unwrap();
            drop(guard);
        });

        started_rx.recv().unwrap();
        let drain = s.spawn(|| registry.drain(Some(Duration::from_millis(1))));
        thread::sleep(Duration::from_millis(20));

        // the drain is stuck on the first reader, but new readers can still
        // register and read
        s.spawn(|| drop(registry.acquire().unwrap().begin_read()))
            .join()
            .unwrap();

        release_tx.send(()).unwrap();
        assert!(drain.join().unwrap() >= 1);
    });
}
