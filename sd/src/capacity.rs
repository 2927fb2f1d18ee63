//! Capacity signal for an external replica controller

use serde::Serialize;

use crate::config::AutoscaleConfig;
use crate::state::StatusCounts;

/// Current load, as seen by a replica controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CapacitySignal {
    pub pending: usize,
    pub queued: usize,
    pub running: usize,
    /// Tasks waiting for a slot (pending + queued)
    pub backlog: usize,
    pub desired_replicas: usize,
}

impl CapacitySignal {
    pub fn from_counts(counts: &StatusCounts, autoscale: &AutoscaleConfig) -> Self {
        let backlog = counts.pending + counts.queued;
        Self {
            pending: counts.pending,
            queued: counts.queued,
            running: counts.running,
            backlog,
            desired_replicas: desired_replicas(backlog, autoscale),
        }
    }
}

/// Worker replicas wanted for a given backlog
///
/// One replica per `tasks_per_worker` waiting tasks, plus one, clamped to the
/// configured bounds. An empty backlog asks for the minimum.
pub fn desired_replicas(backlog: usize, autoscale: &AutoscaleConfig) -> usize {
    if backlog == 0 {
        return autoscale.min_replicas;
    }
    let wanted = backlog / autoscale.tasks_per_worker.max(1) + 1;
    wanted.clamp(autoscale.min_replicas, autoscale.max_replicas.max(autoscale.min_replicas))
}
