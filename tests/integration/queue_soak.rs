#![allow(missing_docs)]

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use mpool::primitives::queue::BoundedQueue;
use mpool::{MpoolError, Result};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

const PRODUCERS: u64 = 10;

struct Tally {
    count: AtomicU64,
    xor: AtomicU64,
}

impl Tally {
    fn new() -> Self {
        Self {
            count: AtomicU64::new(0),
            xor: AtomicU64::new(0),
        }
    }

    fn add(&self, count: u64, xor: u64) {
        self.count.fetch_add(count, Ordering::SeqCst);
        self.xor.fetch_xor(xor, Ordering::SeqCst);
    }
}

/// Runs producers until `keep_going` says stop, closes the queue, and checks
/// that the single consumer saw exactly what was produced.
fn soak(limit: usize, keep_going: impl Fn(u64) -> bool + Sync) -> Result<u64> {
    let queue = BoundedQueue::new(limit);
    let produced = Tally::new();
    let consumed = Tally::new();

    thread::scope(|scope| -> Result<()> {
        let consumer = scope.spawn(|| {
            let (mut count, mut xor) = (0u64, 0u64);
            loop {
                match queue.pop() {
                    Ok(value) => {
                        count += 1;
                        xor ^= value;
                    }
                    Err(MpoolError::QueueClosed) => break,
                    Err(err) => panic!("consumer failed: {err}"),
                }
            }
            consumed.add(count, xor);
        });

        let producers: Vec<_> = (0..PRODUCERS)
            .map(|seed| {
                let (queue, produced, keep_going) = (&queue, &produced, &keep_going);
                scope.spawn(move || -> Result<()> {
                    let mut rng = ChaCha8Rng::seed_from_u64(seed);
                    let (mut count, mut xor) = (0u64, 0u64);
                    while keep_going(count) {
                        let value: u64 = rng.gen();
                        queue.push(value)?;
                        count += 1;
                        xor ^= value;
                    }
                    produced.add(count, xor);
                    Ok(())
                })
            })
            .collect();
        for producer in producers {
            producer.join().expect("producer thread")?;
        }
        queue.close();
        consumer.join().expect("consumer thread");
        Ok(())
    })?;

    let count = produced.count.load(Ordering::SeqCst);
    assert_eq!(consumed.count.load(Ordering::SeqCst), count);
    assert_eq!(consumed.xor.load(Ordering::SeqCst), produced.xor.load(Ordering::SeqCst));
    let stats = queue.stats();
    assert_eq!(stats.pushed, count);
    assert_eq!(stats.popped, count);
    assert!(stats.high_water <= limit);
    assert!(queue.is_empty());
    Ok(count)
}

#[test]
fn producers_and_consumer_agree() -> Result<()> {
    let count = soak(10_000, |sent| sent < 50_000)?;
    assert_eq!(count, PRODUCERS * 50_000);
    Ok(())
}

#[test]
fn small_queue_forces_producer_waits() -> Result<()> {
    let count = soak(16, |sent| sent < 5_000)?;
    assert_eq!(count, PRODUCERS * 5_000);
    Ok(())
}

#[test]
#[ignore = "long-running soak; run with --ignored"]
fn twenty_second_soak() -> Result<()> {
    let deadline = Instant::now() + Duration::from_secs(20);
    let count = soak(10_000, |_| Instant::now() < deadline)?;
    assert!(count > 0);
    Ok(())
}

#[test]
fn blocked_producer_waits_for_resume_threshold() -> Result<()> {
    let queue = BoundedQueue::with_resume(10, 3);
    for i in 0..10u32 {
        queue.push(i)?;
    }
    let released = AtomicBool::new(false);
    thread::scope(|scope| -> Result<()> {
        let producer = scope.spawn(|| -> Result<()> {
            queue.push(100)?;
            released.store(true, Ordering::SeqCst);
            Ok(())
        });
        while queue.stats().producer_waits == 0 {
            thread::yield_now();
        }
        for expected in 0..6u32 {
            assert_eq!(queue.pop()?, expected);
        }
        thread::sleep(Duration::from_millis(30));
        assert_eq!(queue.len(), 4);
        assert!(!released.load(Ordering::SeqCst));
        assert_eq!(queue.pop()?, 6);
        producer.join().expect("producer thread")?;
        Ok(())
    })?;
    assert!(released.load(Ordering::SeqCst));
    assert_eq!(queue.len(), 4);
    assert_eq!(queue.resume_threshold(), 3);
    Ok(())
}

#[test]
fn close_releases_blocked_producers() {
    let queue = BoundedQueue::new(1);
    queue.push(1u8).expect("first push");
    thread::scope(|scope| {
        let producer = scope.spawn(|| queue.push(2));
        while queue.stats().producer_waits == 0 {
            thread::yield_now();
        }
        queue.close();
        assert!(matches!(
            producer.join().expect("producer thread"),
            Err(MpoolError::QueueClosed)
        ));
    });
    assert_eq!(queue.pop().ok(), Some(1));
    assert!(matches!(queue.pop(), Err(MpoolError::QueueClosed)));
}
