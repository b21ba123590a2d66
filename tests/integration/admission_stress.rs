#![allow(missing_docs)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use mpool::{
    Admission, AdmissionConfig, AdmissionSlot, InterruptFlag, MpoolError, Pool, PoolOptions,
    Result,
};

fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn limit_holds_under_contention() -> Result<()> {
    let admission = Admission::new(AdmissionConfig {
        concurrency_limit: 2,
        free_tickets: 5,
        thread_sleep_us: 50,
        adaptive_sleep_max_us: 500,
    });
    let working = AtomicU32::new(0);
    let max_working = AtomicU32::new(0);
    let done = AtomicU64::new(0);

    thread::scope(|scope| -> Result<()> {
        let handles: Vec<_> = (0..10)
            .map(|_| {
                let (admission, working, max_working, done) =
                    (&admission, &working, &max_working, &done);
                scope.spawn(move || -> Result<()> {
                    let mut slot = AdmissionSlot::default();
                    for i in 0..1000u32 {
                        admission.enter(&mut slot, None)?;
                        assert!(slot.is_inside());
                        let now = working.fetch_add(1, Ordering::SeqCst) + 1;
                        max_working.fetch_max(now, Ordering::SeqCst);
                        if i % 64 == 0 {
                            thread::yield_now();
                        }
                        working.fetch_sub(1, Ordering::SeqCst);
                        done.fetch_add(1, Ordering::Relaxed);
                        admission.leave(&mut slot)?;
                    }
                    admission.release(&mut slot);
                    Ok(())
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("admission thread")?;
        }
        Ok(())
    })?;

    assert_eq!(done.load(Ordering::Relaxed), 10_000);
    assert!(max_working.load(Ordering::SeqCst) <= 2);
    assert_eq!(admission.active(), 0);
    assert_eq!(admission.waiting(), 0);
    let stats = admission.stats();
    assert_eq!(stats.entries, 10_000);
    assert!(stats.max_active <= 2);
    assert!(stats.grants >= 2_000);
    assert!(stats.sleep_us <= 500);
    Ok(())
}

#[test]
fn environment_sets_the_limit() -> Result<()> {
    let vars: HashMap<&str, &str> = [
        ("MPOOL_CONCURRENCY_LIMIT", "3"),
        ("MPOOL_ADAPTIVE_SLEEP_MAX_US", "2000"),
        ("MPOOL_POOL_PAGES", "4"),
    ]
    .into_iter()
    .collect();
    let opts = PoolOptions::default().with_overrides(|name| vars.get(name).map(|v| v.to_string()))?;
    let pool = Pool::open(opts)?;
    let config = pool.admission().config();
    assert_eq!(config.concurrency_limit, 3);
    assert_eq!(config.adaptive_sleep_max_us, 2000);
    assert_eq!(pool.stats().pool_pages, 4);

    let mut slots = [AdmissionSlot::default(); 3];
    for slot in &mut slots {
        pool.admission().enter(slot, None)?;
    }
    assert_eq!(pool.admission().active(), 3);
    for slot in &mut slots {
        pool.admission().leave(slot)?;
        pool.admission().release(slot);
    }
    assert_eq!(pool.admission().active(), 0);
    pool.close()
}

#[test]
fn interrupted_waiters_leave_the_queue() -> Result<()> {
    let admission = Admission::new(AdmissionConfig {
        concurrency_limit: 1,
        free_tickets: 10,
        thread_sleep_us: 200,
        adaptive_sleep_max_us: 0,
    });
    let mut holder = AdmissionSlot::default();
    admission.enter(&mut holder, None)?;
    let flags: Vec<InterruptFlag> = (0..4).map(|_| InterruptFlag::new()).collect();

    thread::scope(|scope| {
        let handles: Vec<_> = flags
            .iter()
            .map(|flag| {
                let admission = &admission;
                scope.spawn(move || {
                    let mut slot = AdmissionSlot::default();
                    let res = admission.enter(&mut slot, Some(flag));
                    (res, slot)
                })
            })
            .collect();
        wait_until("four waiters", || admission.waiting() == 4);
        for flag in &flags {
            flag.interrupt();
        }
        for handle in handles {
            let (res, slot) = handle.join().expect("waiter thread");
            assert!(matches!(res, Err(MpoolError::Interrupted)));
            assert!(!slot.is_inside());
            assert_eq!(slot.tickets(), 0);
        }
    });

    assert_eq!(admission.waiting(), 0);
    assert_eq!(admission.active(), 1);
    assert_eq!(admission.stats().interrupts, 4);
    admission.leave(&mut holder)?;
    admission.release(&mut holder);
    assert_eq!(admission.active(), 0);
    Ok(())
}

#[test]
fn misuse_is_a_protocol_violation() {
    let admission = Admission::new(AdmissionConfig {
        concurrency_limit: 1,
        free_tickets: 1,
        thread_sleep_us: 10,
        adaptive_sleep_max_us: 0,
    });
    let mut slot = AdmissionSlot::default();
    assert!(matches!(
        admission.leave(&mut slot),
        Err(MpoolError::ProtocolViolation { .. })
    ));
    admission.enter(&mut slot, None).expect("enter");
    assert!(matches!(
        admission.enter(&mut slot, None),
        Err(MpoolError::ProtocolViolation { .. })
    ));
}
