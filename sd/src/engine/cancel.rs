//! Cooperative cancellation token

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use tracing::debug;

/// Why a computation was asked to stop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// Owner or admin cancelled the task
    Requested,
    /// The soft time limit elapsed
    SoftTimeout,
    /// The task reached a terminal state elsewhere (another process)
    Superseded,
}

impl CancelReason {
    fn to_u8(self) -> u8 {
        match self {
            Self::Requested => 1,
            Self::SoftTimeout => 2,
            Self::Superseded => 3,
        }
    }

    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Requested),
            2 => Some(Self::SoftTimeout),
            3 => Some(Self::Superseded),
            _ => None,
        }
    }
}

/// Shared flag checked by the engine at every checkpoint
///
/// Cheap to clone; all clones observe the same state. The first reason
/// recorded wins, later `cancel` calls are ignored.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    state: Arc<AtomicU8>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation; returns true if this call set the reason
    pub fn cancel(&self, reason: CancelReason) -> bool {
        let set = self
            .state
            .compare_exchange(0, reason.to_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        debug!(?reason, set, "CancelToken::cancel");
        set
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) != 0
    }

    pub fn reason(&self) -> Option<CancelReason> {
        CancelReason::from_u8(self.state.load(Ordering::Acquire))
    }
}
