#![allow(missing_docs)]

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use mpool::primitives::concurrency::{
    latch_snapshot, DebugRecursiveMutex, LatchKind, LatchSnapshot, RwLatch,
};
use mpool::{MpoolError, Result};
use parking_lot::Mutex;

fn wait_for_waiters<T>(latch: &RwLatch<T>, n: usize) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while latch_snapshot(latch).waiting < n {
        assert!(Instant::now() < deadline, "waiters never queued");
        thread::yield_now();
    }
}

#[test]
fn queued_writer_goes_before_later_readers() {
    let latch = RwLatch::new(0u32);
    let order = Mutex::new(Vec::new());
    let inside = AtomicU32::new(0);
    let max_inside = AtomicU32::new(0);

    let held = latch.read();
    thread::scope(|scope| {
        let writer = scope.spawn(|| {
            let mut guard = latch.write();
            order.lock().push("w");
            thread::sleep(Duration::from_millis(10));
            *guard += 1;
        });
        wait_for_waiters(&latch, 1);

        let mut readers = Vec::new();
        for n in 0..3 {
            readers.push(scope.spawn(|| {
                let guard = latch.read();
                order.lock().push("r");
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_inside.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(30));
                inside.fetch_sub(1, Ordering::SeqCst);
                *guard
            }));
            wait_for_waiters(&latch, n + 2);
        }

        assert!(latch.try_read().is_none(), "new reader overtook the queue");
        assert_eq!(latch_snapshot(&latch).readers, 1);
        drop(held);

        writer.join().expect("writer thread");
        for reader in readers {
            assert_eq!(reader.join().expect("reader thread"), 1);
        }
    });

    assert_eq!(*order.lock(), vec!["w", "r", "r", "r"]);
    assert!(max_inside.load(Ordering::SeqCst) >= 2);
    assert_eq!(latch_snapshot(&latch), LatchSnapshot::default());
}

#[test]
fn readers_ahead_of_a_writer_share_the_latch() {
    let latch = RwLatch::new(());
    let writer_in = AtomicBool::new(false);
    let first = latch.write();
    thread::scope(|scope| {
        let r1 = scope.spawn(|| {
            let _g = latch.read();
            assert!(!writer_in.load(Ordering::SeqCst));
            thread::sleep(Duration::from_millis(20));
        });
        wait_for_waiters(&latch, 1);
        let r2 = scope.spawn(|| {
            let _g = latch.read();
            assert!(!writer_in.load(Ordering::SeqCst));
            thread::sleep(Duration::from_millis(20));
        });
        wait_for_waiters(&latch, 2);
        let w = scope.spawn(|| {
            let _g = latch.write();
            writer_in.store(true, Ordering::SeqCst);
        });
        wait_for_waiters(&latch, 3);
        drop(first);
        r1.join().expect("reader");
        r2.join().expect("reader");
        w.join().expect("writer");
    });
    assert!(writer_in.load(Ordering::SeqCst));
}

#[test]
fn recursive_mutex_tracks_its_owner() -> Result<()> {
    let mutex = DebugRecursiveMutex::new("file", LatchKind::Recursive { limit: 2 });
    mutex.acquire()?;
    mutex.acquire()?;
    assert_eq!(mutex.depth(), 2);
    assert!(mutex.is_owned_by_current());
    assert!(mutex.owner_location().is_some());
    assert!(matches!(
        mutex.acquire(),
        Err(MpoolError::ProtocolViolation { what, .. }) if what == "recursion depth exceeded"
    ));

    let acquired = AtomicBool::new(false);
    thread::scope(|scope| -> Result<()> {
        let probe = scope.spawn(|| -> Result<bool> {
            assert!(matches!(
                mutex.release(),
                Err(MpoolError::ProtocolViolation { .. })
            ));
            mutex.try_acquire()
        });
        assert!(!probe.join().expect("probe thread")?);

        let waiter = scope.spawn(|| -> Result<()> {
            mutex.acquire()?;
            acquired.store(true, Ordering::SeqCst);
            assert_eq!(mutex.depth(), 1);
            mutex.release()
        });
        mutex.release()?;
        thread::sleep(Duration::from_millis(20));
        assert!(!acquired.load(Ordering::SeqCst));
        mutex.release()?;
        waiter.join().expect("waiter thread")?;
        Ok(())
    })?;
    assert!(acquired.load(Ordering::SeqCst));
    assert_eq!(mutex.depth(), 0);
    assert!(matches!(
        mutex.release(),
        Err(MpoolError::ProtocolViolation { what, .. }) if what == "unlock without lock"
    ));
    Ok(())
}

#[test]
fn plain_mutex_refuses_reentry() -> Result<()> {
    let mutex = DebugRecursiveMutex::new("region", LatchKind::Plain);
    let guard = mutex.lock()?;
    assert!(matches!(
        mutex.acquire(),
        Err(MpoolError::ProtocolViolation { what, .. }) if what.contains("self-deadlock")
    ));
    drop(guard);
    assert_eq!(mutex.depth(), 0);
    Ok(())
}
