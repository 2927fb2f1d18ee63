//! Scheduler configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Scheduler loop settings
///
/// Caps live in the admission section; this only tunes how often the loop
/// looks for work it was not signalled about (tasks queued by other processes).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Interval between unsolicited scheduling passes
    #[serde(rename = "poll-interval-ms")]
    pub poll_interval_ms: u64,
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(10))
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { poll_interval_ms: 2000 }
    }
}
