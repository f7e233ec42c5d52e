//! Scheduler unit tests


use std::time::{Duration, Instant};

/// Poll `condition` until it holds or `timeout` elapses.
pub(super) fn wait_until(
    timeout: Duration,
    mut condition: impl FnMut() -> bool,
) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    condition()
}

#[cfg(test)]
mod task_id_tests {
    use crate::runtime::scheduler::{FutureId, IdGenerator, TaskId};

    #[test]
    fn test_ids_are_monotonic() {
        let ids = IdGenerator::new();
        let a = ids.next_task();
        let b = ids.next_task();
        assert!(b.0 > a.0);
        let f = ids.next_future();
        assert_eq!(format!("{}", FutureId(f.0)), format!("{}", f));
    }

    #[test]
    fn test_task_id_partial_eq() {
        assert_eq!(TaskId(1), TaskId(1));
        assert_ne!(TaskId(1), TaskId(2));
    }
}

#[cfg(test)]
mod task_priority_tests {
    use crate::runtime::scheduler::TaskPriority;

    #[test]
    fn test_priority_default_is_normal() {
        assert_eq!(TaskPriority::default(), TaskPriority::Normal);
    }

    #[test]
    fn test_higher_priority_has_lower_tier() {
        assert_eq!(TaskPriority::Critical.tier(), 0);
        assert_eq!(TaskPriority::Low.tier(), TaskPriority::TIERS - 1);
        assert!(TaskPriority::High.tier() < TaskPriority::Normal.tier());
    }
}

#[cfg(test)]
mod future_state_tests {
    use crate::runtime::scheduler::FutureState;

    #[test]
    fn test_terminal_states() {
        assert!(!FutureState::Pending.is_terminal());
        assert!(!FutureState::Running.is_terminal());
        assert!(FutureState::Completed.is_terminal());
        assert!(FutureState::Faulted.is_terminal());
        assert!(FutureState::Canceled.is_terminal());
    }
}
