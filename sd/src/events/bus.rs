//! Progress bus - per-task broadcast channels
//!
//! The bus keeps an explicit registry of one broadcast channel per task that
//! currently has subscribers. Publishing never blocks: with no subscribers the
//! event is dropped, and a subscriber that falls behind loses its oldest events.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use tokio::sync::broadcast;
use tracing::debug;

use super::types::TaskEvent;

/// Default per-task channel capacity (events)
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Registry of per-task subscriber channels
pub struct ProgressBus {
    channels: Mutex<HashMap<String, broadcast::Sender<TaskEvent>>>,
    capacity: usize,
}

impl ProgressBus {
    /// Create a bus whose per-task channels hold `capacity` events
    pub fn new(capacity: usize) -> Self {
        debug!(capacity, "ProgressBus::new: creating progress bus");
        Self {
            channels: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, broadcast::Sender<TaskEvent>>> {
        // Registry stays consistent even if a holder panicked
        self.channels.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Subscribe to a task's events
    ///
    /// Only events published after this call are received.
    pub fn subscribe(&self, task_id: &str) -> broadcast::Receiver<TaskEvent> {
        debug!(%task_id, "ProgressBus::subscribe: new subscriber");
        let mut channels = self.lock();
        channels
            .entry(task_id.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Drop a task's channel if nobody listens any more
    pub fn unsubscribe(&self, task_id: &str) {
        let mut channels = self.lock();
        if channels.get(task_id).is_some_and(|tx| tx.receiver_count() == 0) {
            debug!(%task_id, "ProgressBus::unsubscribe: pruning channel");
            channels.remove(task_id);
        }
    }

    /// Publish an event to the task's subscribers
    ///
    /// Fire-and-forget; returns how many subscribers received it.
    pub fn publish(&self, event: TaskEvent) -> usize {
        let mut channels = self.lock();
        let Some(tx) = channels.get(&event.task_id) else {
            return 0;
        };
        if tx.receiver_count() == 0 {
            debug!(task_id = %event.task_id, "ProgressBus::publish: pruning abandoned channel");
            channels.remove(&event.task_id);
            return 0;
        }
        debug!(task_id = %event.task_id, status = %event.status, pct = event.percentage, "ProgressBus::publish");
        tx.send(event).unwrap_or(0)
    }

    /// Number of tasks with a live channel
    pub fn channel_count(&self) -> usize {
        self.lock().len()
    }

    /// Subscribers currently attached to a task
    pub fn subscriber_count(&self, task_id: &str) -> usize {
        self.lock().get(task_id).map_or(0, |tx| tx.receiver_count())
    }
}

impl Default for ProgressBus {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}
