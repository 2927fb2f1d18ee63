//! Admission decisions and wait estimates
//!
//! Pure functions over counts and task lists; the state manager calls them
//! inside its transactions.

use crate::domain::{Task, TaskStatus};
use crate::state::AdmissionCaps;

/// Initial status for a new task given current active counts
///
/// Over either cap the task starts Queued, otherwise Pending.
pub fn initial_status(user_active: usize, global_active: usize, caps: AdmissionCaps) -> TaskStatus {
    if user_active >= caps.per_user || global_active >= caps.global {
        TaskStatus::Queued
    } else {
        TaskStatus::Pending
    }
}

/// 1-based position of `task` among waiting tasks
///
/// Ordered by creation time, ties broken by insert sequence. `None` unless the
/// task is Pending or Queued.
pub fn queue_position(task: &Task, waiting: &[Task]) -> Option<usize> {
    if !TaskStatus::WAITING.contains(&task.status) {
        return None;
    }
    let key = (task.created_at, task.seq);
    let ahead = waiting
        .iter()
        .filter(|other| other.id != task.id && TaskStatus::WAITING.contains(&other.status))
        .filter(|other| (other.created_at, other.seq) < key)
        .count();
    Some(ahead + 1)
}

/// Estimated seconds until a task at `position` starts
///
/// Tasks ahead are served `capacity` at a time: every full wave costs `avg`,
/// and each task already ahead within the current wave adds `avg / capacity`.
pub fn estimate_wait_secs(position: usize, avg_secs: f64, capacity: usize) -> f64 {
    let capacity = capacity.max(1);
    let ahead = position.saturating_sub(1);
    let waves = (ahead / capacity) as f64;
    let remainder = (ahead % capacity) as f64;
    waves * avg_secs + (avg_secs / capacity as f64) * remainder
}

#[cfg(test)]
mod tests {
    use super::*;

    const CAPS: AdmissionCaps = AdmissionCaps { global: 4, per_user: 2 };

    fn waiting_task(created_at: i64, seq: i64, status: TaskStatus) -> Task {
        let mut task = Task::new("alice", 10);
        task.created_at = created_at;
        task.seq = seq;
        task.status = status;
        task
    }

    #[test]
    fn test_initial_status() {
        assert_eq!(initial_status(0, 0, CAPS), TaskStatus::Pending);
        assert_eq!(initial_status(1, 3, CAPS), TaskStatus::Pending);
        assert_eq!(initial_status(2, 2, CAPS), TaskStatus::Queued);
        assert_eq!(initial_status(0, 4, CAPS), TaskStatus::Queued);
    }

    #[test]
    fn test_queue_position_orders_by_creation_then_seq() {
        let a = waiting_task(100, 1, TaskStatus::Queued);
        let b = waiting_task(100, 2, TaskStatus::Pending);
        let c = waiting_task(200, 3, TaskStatus::Queued);
        let all = vec![c.clone(), a.clone(), b.clone()];

        assert_eq!(queue_position(&a, &all), Some(1));
        assert_eq!(queue_position(&b, &all), Some(2));
        assert_eq!(queue_position(&c, &all), Some(3));
    }

    #[test]
    fn test_queue_position_ignores_non_waiting() {
        let running = waiting_task(50, 1, TaskStatus::Running);
        let queued = waiting_task(100, 2, TaskStatus::Queued);
        let all = vec![running.clone(), queued.clone()];

        assert_eq!(queue_position(&running, &all), None);
        assert_eq!(queue_position(&queued, &all), Some(1));
    }

    #[test]
    fn test_estimate_wait() {
        assert_eq!(estimate_wait_secs(1, 60.0, 4), 0.0);
        assert_eq!(estimate_wait_secs(2, 60.0, 4), 15.0);
        assert_eq!(estimate_wait_secs(5, 60.0, 4), 60.0);
        assert_eq!(estimate_wait_secs(7, 60.0, 4), 90.0);
        assert_eq!(estimate_wait_secs(3, 10.0, 1), 20.0);
    }

    #[test]
    fn test_estimate_wait_zero_capacity_treated_as_one() {
        assert_eq!(estimate_wait_secs(3, 10.0, 0), 20.0);
    }
}
