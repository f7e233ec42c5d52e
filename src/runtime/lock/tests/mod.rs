//! Lock manager unit tests

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use crate::runtime::errors::LockError;
use crate::runtime::lock::{BackoffPolicy, LockManager, LockStrategy, ResourceId};

fn manager_with(
    strategy: LockStrategy,
    keys: &[u32],
) -> LockManager<u32> {
    let manager = LockManager::new(strategy);
    for key in keys {
        manager.register(*key).unwrap();
    }
    manager
}

fn fast_backoff() -> BackoffPolicy {
    BackoffPolicy {
        per_resource_timeout: Duration::from_millis(2),
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(8),
        jitter: true,
    }
}

#[test]
fn test_register_assigns_sequential_ids() {
    let manager = LockManager::<&str>::ordered();
    assert_eq!(manager.register("a").unwrap(), ResourceId(0));
    assert_eq!(manager.register("b").unwrap(), ResourceId(1));
    assert_eq!(manager.len(), 2);
    assert!(manager.contains(&"a"));
    assert_eq!(manager.keys(), vec!["a", "b"]);
}

#[test]
fn test_duplicate_registration_fails() {
    let manager = LockManager::<&str>::ordered();
    manager.register("a").unwrap();
    assert!(matches!(
        manager.register("a"),
        Err(LockError::DuplicateResource(_))
    ));
}

#[test]
fn test_unknown_resource_is_fatal_and_holds_nothing() {
    let manager = manager_with(LockStrategy::Ordered, &[1, 2]);
    let err = manager.acquire_all(&[1, 99]).unwrap_err();
    assert!(matches!(err, LockError::UnknownResource(_)));
    assert!(!err.is_retryable());
    assert!(!manager.is_held(&1).unwrap());
    assert_eq!(manager.stats().unknown_resources, 1);
}

#[test]
fn test_ordered_acquires_by_rank_not_request_order() {
    let manager = LockManager::<&str>::ordered();
    manager.register_with_rank("late", 10).unwrap();
    manager.register_with_rank("early", 1).unwrap();

    let handle = manager.acquire_all(&["late", "early"]).unwrap();
    assert_eq!(handle.keys(), vec!["early", "late"]);
    assert_eq!(manager.holder(&"early").unwrap(), Some(handle.requester()));
}

#[test]
fn test_duplicate_keys_in_request_are_ignored() {
    let manager = manager_with(LockStrategy::Ordered, &[1, 2]);
    let handle = manager.acquire_all(&[2, 1, 2]).unwrap();
    assert_eq!(handle.resources().len(), 2);
}

#[test]
fn test_release_is_idempotent_and_drop_releases() {
    let manager = manager_with(LockStrategy::Ordered, &[1, 2]);

    let mut handle = manager.acquire_all(&[1, 2]).unwrap();
    assert!(manager.is_held(&1).unwrap());
    handle.release();
    handle.release();
    assert!(handle.is_released());
    assert!(!manager.is_held(&1).unwrap());
    drop(handle);

    {
        let _handle = manager.acquire_all(&[2]).unwrap();
        assert!(manager.is_held(&2).unwrap());
    }
    assert!(!manager.is_held(&2).unwrap());

    let stats = manager.stats();
    assert_eq!(stats.acquisitions, 2);
    assert_eq!(stats.releases, 2);
}

#[test]
fn test_with_locks_releases_after_closure() {
    let manager = manager_with(LockStrategy::Ordered, &[1, 2, 3]);
    let sum = manager
        .with_locks(&[3, 1], |handle| {
            assert_eq!(handle.keys(), vec![1, 3]);
            4
        })
        .unwrap();
    assert_eq!(sum, 4);
    assert!(!manager.is_held(&1).unwrap());
    assert!(!manager.is_held(&3).unwrap());
}

#[test]
fn test_timeout_when_resource_is_held_elsewhere() {
    let manager = manager_with(LockStrategy::Ordered, &[1, 2]);
    let held = manager.acquire_all(&[2]).unwrap();

    let other = manager.clone();
    let result = thread::spawn(move || {
        other
            .acquire_all_timeout(&[1, 2], Duration::from_millis(30))
            .map(|_| ())
    })
    .join()
    .unwrap();

    let err = result.unwrap_err();
    assert!(matches!(err, LockError::Timeout { .. }));
    assert!(err.is_retryable());
    // The partially acquired resource was given back.
    assert!(!manager.is_held(&1).unwrap());
    drop(held);
    assert_eq!(manager.stats().timeouts, 1);
}

#[test]
fn test_blocked_request_proceeds_after_release() {
    let manager = manager_with(LockStrategy::Ordered, &[1]);
    let held = manager.acquire_all(&[1]).unwrap();
    let first = held.requester();

    let other = manager.clone();
    let waiter = thread::spawn(move || {
        let handle = other.acquire_all(&[1]).unwrap();
        handle.requester()
    });
    thread::sleep(Duration::from_millis(20));
    assert_eq!(manager.holder(&1).unwrap(), Some(first));
    drop(held);

    let second = waiter.join().unwrap();
    assert_ne!(first, second);
    assert!(!manager.is_held(&1).unwrap());
}

#[test]
fn test_mutual_exclusion_under_contention() {
    for strategy in [LockStrategy::Ordered, LockStrategy::Backoff(fast_backoff())] {
        let manager = manager_with(strategy, &[1, 2, 3]);
        let inside = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(4));

        let workers: Vec<_> = (0..4)
            .map(|i| {
                let manager = manager.clone();
                let inside = inside.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    let keys = if i % 2 == 0 { [1, 2, 3] } else { [3, 2, 1] };
                    for _ in 0..50 {
                        let _handle = manager.acquire_all(&keys).unwrap();
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(manager.stats().acquisitions, 200);
    }
}

#[test]
fn test_backoff_retries_then_succeeds() {
    let manager = manager_with(LockStrategy::Backoff(fast_backoff()), &[1, 2]);
    let held = manager.acquire_all(&[2]).unwrap();

    let other = manager.clone();
    let waiter = thread::spawn(move || other.acquire_all(&[1, 2]).map(|h| h.keys()));
    thread::sleep(Duration::from_millis(30));
    drop(held);

    assert_eq!(waiter.join().unwrap().unwrap(), vec![1, 2]);
    assert!(manager.stats().retries >= 1);
}

#[test]
fn test_backoff_timeout_reports_attempts() {
    let manager = manager_with(LockStrategy::Backoff(fast_backoff()), &[1]);
    let _held = manager.acquire_all(&[1]).unwrap();

    let other = manager.clone();
    let err = thread::spawn(move || {
        other
            .acquire_all_timeout(&[1], Duration::from_millis(40))
            .map(|_| ())
    })
    .join()
    .unwrap()
    .unwrap_err();

    match err {
        LockError::Timeout { attempts, waited } => {
            assert!(attempts >= 2);
            assert!(waited >= Duration::from_millis(40));
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

#[test]
fn test_backoff_delay_is_bounded() {
    let policy = fast_backoff();
    let mut rng = rand::rng();
    for attempt in 1..20 {
        let delay = policy.delay(attempt, &mut rng);
        assert!(delay <= policy.max_backoff);
        assert!(delay >= policy.initial_backoff / 2);
    }

    let fixed = BackoffPolicy {
        jitter: false,
        ..policy
    };
    assert_eq!(fixed.delay(1, &mut rng), Duration::from_millis(1));
    assert_eq!(fixed.delay(3, &mut rng), Duration::from_millis(4));
    assert_eq!(fixed.delay(10, &mut rng), Duration::from_millis(8));
}

#[test]
fn test_backoff_policy_validation() {
    assert!(BackoffPolicy::default().validate().is_ok());
    let bad = BackoffPolicy {
        max_backoff: Duration::ZERO,
        ..BackoffPolicy::default()
    };
    assert!(bad.validate().is_err());
}

#[cfg(debug_assertions)]
#[test]
#[should_panic(expected = "lock order violation")]
fn test_out_of_order_nested_acquisition_is_caught() {
    let manager = manager_with(LockStrategy::Ordered, &[1, 2]);
    let _outer = manager.acquire_all(&[2]).unwrap();
    let _inner = manager.acquire_all(&[1]);
}

#[test]
fn test_in_order_nested_acquisition_is_allowed() {
    let manager = manager_with(LockStrategy::Ordered, &[1, 2]);
    let _outer = manager.acquire_all(&[1]).unwrap();
    let inner = manager.acquire_all(&[2]).unwrap();
    assert_eq!(inner.keys(), vec![2]);
}
