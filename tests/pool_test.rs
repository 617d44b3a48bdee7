//! Integration tests for the pool lifecycle

mod common;

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use common::{eventually, CountingAllocator, CountingExpiration};
use tidepool::{Pool, PoolConfig, PoolError, TimeExpiration};

const PATIENCE: Duration = Duration::from_secs(5);

fn pool_of(size: usize, allocator: &CountingAllocator, expiration: &CountingExpiration) -> Pool<u64> {
    Pool::new(
        PoolConfig::new(allocator.clone())
            .with_size(size)
            .with_expiration(expiration.clone()),
    )
    .expect("pool construction failed")
}

#[test]
fn test_sequential_claims_reuse_the_same_object() {
    let allocator = CountingAllocator::new();
    let pool = pool_of(1, &allocator, &CountingExpiration::never());

    let first = pool.claim(PATIENCE).unwrap().expect("first claim timed out");
    let first_obj = *first;
    drop(first);

    let second = pool.claim(PATIENCE).unwrap().expect("second claim timed out");
    assert_eq!(*second, first_obj);
    drop(second);

    assert_eq!(pool.alloc_count(), 1);
    assert_eq!(allocator.allocations(), 1);
    assert!(pool.shutdown().await_done(PATIENCE));
}

#[test]
fn test_expired_object_is_replaced() {
    let allocator = CountingAllocator::new();
    let pool = Pool::new(
        PoolConfig::new(allocator.clone())
            .with_size(1)
            .with_expiration(TimeExpiration::after(Duration::from_millis(2)).unwrap()),
    )
    .unwrap();

    let first = pool.claim(PATIENCE).unwrap().expect("first claim timed out");
    let first_obj = *first;
    drop(first);

    // Outlive both the TTL and the coarse clock's ~10 ms precision.
    thread::sleep(Duration::from_millis(50));

    let second = pool.claim(PATIENCE).unwrap().expect("second claim timed out");
    assert_ne!(*second, first_obj);
    drop(second);

    assert!(allocator.allocations() >= 2);
    assert!(pool.shutdown().await_done(PATIENCE));
}

#[test]
fn test_claim_times_out_when_pool_is_exhausted() {
    let allocator = CountingAllocator::new();
    let pool = pool_of(1, &allocator, &CountingExpiration::never());

    let held = pool.claim(PATIENCE).unwrap().expect("claim timed out");

    let contender = {
        let pool = pool.clone();
        thread::spawn(move || {
            let start = Instant::now();
            let outcome = pool.claim(Duration::from_millis(50)).unwrap();
            (outcome.is_none(), start.elapsed())
        })
    };
    let (timed_out, elapsed) = contender.join().unwrap();
    assert!(timed_out, "claim should observe an exhausted pool");
    assert!(
        elapsed >= Duration::from_millis(50),
        "claim returned after {elapsed:?}, before its timeout"
    );

    drop(held);
    assert!(pool.shutdown().await_done(PATIENCE));
}

#[test]
fn test_shutdown_drains_every_idle_slot() {
    let allocator = CountingAllocator::new();
    let pool = pool_of(3, &allocator, &CountingExpiration::never());

    assert!(
        eventually(PATIENCE, || allocator.allocations() == 3),
        "pool never allocated up to its target"
    );

    let completion = pool.shutdown();
    assert!(completion.await_done(PATIENCE));
    assert_eq!(allocator.deallocations(), 3);
    assert_eq!(pool.live_count(), 0);
    assert_eq!(pool.stats().tombstones, 3);
}

#[test]
fn test_allocation_failure_surfaces_to_one_claimer_then_recovers() {
    let allocator = CountingAllocator::failing_when(|attempt| attempt % 2 == 1);
    let pool = pool_of(1, &allocator, &CountingExpiration::never());

    let failure = pool.claim(PATIENCE).unwrap_err();
    assert!(failure.is_allocation_failure(), "got: {failure}");

    let recovered = pool.claim(PATIENCE).unwrap().expect("retry claim timed out");
    assert_eq!(*recovered, 2);
    drop(recovered);

    assert_eq!(allocator.allocations(), 2);
    assert_eq!(pool.alloc_count(), 2);
    assert!(pool.shutdown().await_done(PATIENCE));
}

#[test]
fn test_shrinking_retires_surplus_slots() {
    let allocator = CountingAllocator::new();
    let pool = pool_of(5, &allocator, &CountingExpiration::never());

    assert!(
        eventually(PATIENCE, || allocator.allocations() == 5),
        "pool never allocated up to its target"
    );

    pool.set_target_size(2).unwrap();
    assert_eq!(pool.target_size(), 2);

    // Cycle claims so surplus slots pass through the claim path.
    for _ in 0..5 {
        if let Ok(Some(obj)) = pool.claim(Duration::from_millis(200)) {
            drop(obj);
        }
    }

    assert!(
        eventually(PATIENCE, || pool.live_count() == 2),
        "pool never shrank to its new target: live_count = {}",
        pool.live_count()
    );
    assert_eq!(allocator.deallocations(), 3);
    assert_eq!(pool.stats().tombstones, 3);

    assert!(pool.shutdown().await_done(PATIENCE));
    assert_eq!(allocator.deallocations(), 5);
}

#[test]
fn test_growing_allocates_more_slots() {
    let allocator = CountingAllocator::new();
    let pool = pool_of(1, &allocator, &CountingExpiration::never());

    assert!(eventually(PATIENCE, || allocator.allocations() == 1));

    pool.set_target_size(3).unwrap();
    assert!(
        eventually(PATIENCE, || allocator.allocations() == 3),
        "pool never grew to its new target"
    );
    assert_eq!(pool.live_count(), 3);

    assert!(pool.shutdown().await_done(PATIENCE));
    assert_eq!(allocator.deallocations(), 3);
}

#[test]
fn test_no_claim_overlap_under_contention() {
    let allocator = CountingAllocator::new();
    let pool = pool_of(3, &allocator, &CountingExpiration::never());

    let held: Arc<Mutex<HashSet<u64>>> = Arc::new(Mutex::new(HashSet::new()));
    let claimers: Vec<_> = (0..8)
        .map(|_| {
            let pool = pool.clone();
            let held = held.clone();
            thread::spawn(move || {
                let mut successes = 0;
                for _ in 0..50 {
                    let Some(obj) = pool.claim(Duration::from_secs(1)).unwrap() else {
                        continue;
                    };
                    {
                        let mut held = held.lock().unwrap();
                        assert!(held.insert(*obj), "object {} claimed twice at once", *obj);
                    }
                    thread::yield_now();
                    {
                        let mut held = held.lock().unwrap();
                        held.remove(&*obj);
                    }
                    drop(obj);
                    successes += 1;
                }
                successes
            })
        })
        .collect();

    let mut total = 0;
    for claimer in claimers {
        total += claimer.join().unwrap();
    }
    assert!(total > 0, "no claim ever succeeded");

    assert!(pool.shutdown().await_done(PATIENCE));
    // Slot conservation: everything allocated was either still pooled at
    // shutdown (now tombstoned) or had already been retired.
    assert_eq!(pool.live_count(), 0);
    assert_eq!(allocator.allocations(), allocator.deallocations());
}

#[test]
fn test_claimed_slots_drain_after_release_during_shutdown() {
    let allocator = CountingAllocator::new();
    let pool = pool_of(2, &allocator, &CountingExpiration::never());

    let held = pool.claim(PATIENCE).unwrap().expect("claim timed out");

    let completion = pool.shutdown();
    assert!(
        !completion.await_done(Duration::from_millis(100)),
        "shutdown cannot complete while a claim is outstanding"
    );

    drop(held);
    assert!(completion.await_done(PATIENCE));
    assert_eq!(allocator.allocations(), allocator.deallocations());
}

#[test]
fn test_shutdown_is_idempotent() {
    let allocator = CountingAllocator::new();
    let pool = pool_of(1, &allocator, &CountingExpiration::never());

    let first = pool.shutdown();
    let second = pool.shutdown();
    assert!(first.await_done(PATIENCE));
    assert!(second.await_done(PATIENCE));
}

#[test]
fn test_invalid_configurations_are_rejected() {
    assert!(matches!(
        Pool::new(PoolConfig::new(CountingAllocator::new()).with_size(0)),
        Err(PoolError::InvalidConfig { .. })
    ));
    assert!(TimeExpiration::after(Duration::ZERO).is_err());
}

#[test]
fn test_operations_after_shutdown_are_rejected() {
    let pool = pool_of(1, &CountingAllocator::new(), &CountingExpiration::never());
    pool.shutdown().await_done(PATIENCE);

    assert!(matches!(
        pool.claim(Duration::from_millis(1)),
        Err(PoolError::PoolClosed)
    ));
    assert!(matches!(
        pool.set_target_size(4),
        Err(PoolError::PoolClosed)
    ));
}

#[test]
fn test_counting_expiration_replies_drive_replacement() {
    let allocator = CountingAllocator::new();
    let expiration = CountingExpiration::new(&[false, true, false]);
    let pool = pool_of(1, &allocator, &expiration);

    // Reply 1: not expired, object 1 survives.
    let first = pool.claim(PATIENCE).unwrap().expect("first claim timed out");
    assert_eq!(*first, 1);
    drop(first);

    // Reply 2: expired, so this claim replaces the object and checks the
    // fresh one with reply 3.
    let second = pool.claim(PATIENCE).unwrap().expect("second claim timed out");
    assert_eq!(*second, 2);
    drop(second);

    assert_eq!(expiration.count(), 3);
    assert!(pool.shutdown().await_done(PATIENCE));
}
