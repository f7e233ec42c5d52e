//! Loading configuration files.

use std::io::Write;
use std::time::Duration;

use taskweave::runtime::lock::LockStrategy;
use taskweave::util::config::{load_config, ConfigError, RuntimeConfig};
use taskweave::{LockManager, Scheduler};

fn write_config(content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

#[test]
fn file_config_drives_scheduler_and_locks() {
    let file = write_config(
        r#"
        [pool]
        min_workers = 2
        max_workers = 3
        idle_timeout_ms = 750
        thread_name = "cfg-worker"

        [locks]
        strategy = "backoff"

        [locks.backoff]
        per_resource_timeout_ms = 4
        initial_backoff_ms = 1
        max_backoff_ms = 16
        "#,
    );
    let config = load_config(file.path()).unwrap();
    assert_eq!(config.pool.idle_timeout, Duration::from_millis(750));
    assert_eq!(config.pool.thread_name, "cfg-worker");

    let scheduler = Scheduler::with_config(config.pool.clone()).unwrap();
    let stats = scheduler.pool().stats();
    assert_eq!((stats.min_workers, stats.max_workers), (2, 3));
    assert_eq!(scheduler.schedule(|| 6 * 7).unwrap().wait().unwrap(), 42);

    let manager = LockManager::<&str>::from_config(&config.locks);
    match manager.strategy() {
        LockStrategy::Backoff(policy) => {
            assert_eq!(policy.per_resource_timeout, Duration::from_millis(4));
            assert_eq!(policy.max_backoff, Duration::from_millis(16));
        }
        other => panic!("unexpected strategy {:?}", other),
    }
}

#[test]
fn empty_file_yields_defaults() {
    let file = write_config("");
    let config = load_config(file.path()).unwrap();
    let defaults = RuntimeConfig::default();
    assert_eq!(config.locks, defaults.locks);
    assert_eq!(config.pool.thread_name, defaults.pool.thread_name);
}

#[test]
fn missing_file_is_an_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = load_config(dir.path().join("absent.toml")).unwrap_err();
    assert!(matches!(err, ConfigError::Io { .. }));
}

#[test]
fn invalid_bounds_are_rejected() {
    let file = write_config("[pool]\nmin_workers = 5\nmax_workers = 1\n");
    assert!(matches!(
        load_config(file.path()),
        Err(ConfigError::Invalid(_))
    ));
}
