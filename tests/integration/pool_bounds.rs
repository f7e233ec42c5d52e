//! Pool sizing under load.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use taskweave::runtime::scheduler::PoolConfig;
use taskweave::runtime::CollectingSink;
use taskweave::Scheduler;

fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    false
}

#[test]
fn bounds_hold_under_burst_and_shrink_after() {
    let sink = Arc::new(CollectingSink::new());
    let scheduler = Scheduler::builder()
        .pool(PoolConfig {
            min_workers: 1,
            max_workers: 4,
            idle_timeout: Duration::from_millis(50),
            saturation_threshold: 8,
            ..PoolConfig::default()
        })
        .diagnostics(sink.clone())
        .build()
        .unwrap();

    let concurrent = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let futures: Vec<_> = (0..64)
        .map(|_| {
            let concurrent = concurrent.clone();
            let peak = peak.clone();
            scheduler
                .schedule(move || {
                    let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(3));
                    concurrent.fetch_sub(1, Ordering::SeqCst);
                })
                .unwrap()
        })
        .collect();
    for f in futures {
        f.wait().unwrap();
    }

    assert!(peak.load(Ordering::SeqCst) <= 4);
    let stats = scheduler.pool().stats();
    assert!(stats.peak_workers <= 4);
    assert!(stats.peak_workers >= 2);
    // A burst this deep saturates the pool at least once.
    assert!(sink.saturation_events() >= 1);

    assert!(eventually(|| scheduler.pool().stats().workers() == 1));
}

#[test]
fn reconfigure_at_runtime() {
    let scheduler = Scheduler::builder()
        .workers(1, 2)
        .idle_timeout(Duration::from_secs(5))
        .build()
        .unwrap();
    scheduler.configure(3, 6, Duration::from_secs(5)).unwrap();
    assert_eq!(scheduler.pool().stats().workers(), 3);

    scheduler.configure(1, 1, Duration::from_millis(20)).unwrap();
    assert!(eventually(|| scheduler.pool().stats().workers() == 1));
    assert!(scheduler.configure(2, 1, Duration::from_millis(20)).is_err());
}
