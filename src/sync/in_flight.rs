use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{SyncError, SyncResult};

/// Per-entity single-flight guard: at most one mutation runs for a key at a
/// time, and an overlapping one is rejected rather than queued.
#[derive(Debug, Clone)]
pub struct InFlightKeys {
    operation: &'static str,
    keys: Arc<Mutex<HashSet<String>>>,
}

impl InFlightKeys {
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            keys: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn acquire(&self, key: &str) -> SyncResult<InFlightGuard> {
        if !self.keys.lock().insert(key.to_string()) {
            return Err(SyncError::Busy {
                operation: self.operation,
                key: key.to_string(),
            });
        }
        Ok(InFlightGuard {
            key: key.to_string(),
            keys: Arc::clone(&self.keys),
        })
    }

    pub fn is_busy(&self, key: &str) -> bool {
        self.keys.lock().contains(key)
    }
}

/// Releases its key on drop, including when the mutation is cancelled.
#[derive(Debug)]
pub struct InFlightGuard {
    key: String,
    keys: Arc<Mutex<HashSet<String>>>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.keys.lock().remove(&self.key);
    }
}
