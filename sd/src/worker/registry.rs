//! In-process registry of cancel tokens for running jobs

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

use crate::engine::{CancelReason, CancelToken};

/// Maps task id to the token of the job computing it
#[derive(Debug, Clone, Default)]
pub struct CancelRegistry {
    tokens: Arc<Mutex<HashMap<String, CancelToken>>>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, CancelToken>> {
        self.tokens.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Create and register a fresh token for a task
    pub fn register(&self, task_id: &str) -> CancelToken {
        debug!(%task_id, "CancelRegistry::register: called");
        let token = CancelToken::new();
        self.lock().insert(task_id.to_string(), token.clone());
        token
    }

    /// Trip the task's token; false if no job for it runs here
    pub fn cancel(&self, task_id: &str, reason: CancelReason) -> bool {
        match self.lock().get(task_id) {
            Some(token) => {
                debug!(%task_id, ?reason, "CancelRegistry::cancel: tripping token");
                token.cancel(reason);
                true
            }
            None => false,
        }
    }

    pub fn unregister(&self, task_id: &str) {
        debug!(%task_id, "CancelRegistry::unregister: called");
        self.lock().remove(task_id);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
