//! Bidirectional call registry
//!
//! Two cooperating maps kept in sync by construction: forward
//! (`CallKey -> WorkerHandle`) for dispatch, reverse
//! (`WorkerId -> CallKey`) for cleanup on worker termination. All
//! mutation goes through the paired insert/remove below, so the two
//! directions can never disagree.

use std::collections::HashMap;

use crate::types::CallKey;
use crate::worker::{WorkerHandle, WorkerId};

/// Registry of live call workers owned by one shard
#[derive(Default)]
pub struct CallRegistry {
    forward: HashMap<CallKey, WorkerHandle>,
    reverse: HashMap<WorkerId, CallKey>,
}

impl CallRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert both directions for a freshly spawned worker.
    ///
    /// Returns false (and leaves the registry untouched) if the key is
    /// already bound; at most one worker may exist per call.
    pub fn insert(&mut self, key: CallKey, handle: WorkerHandle) -> bool {
        if self.forward.contains_key(&key) {
            return false;
        }
        self.reverse.insert(handle.id, key.clone());
        self.forward.insert(key, handle);
        true
    }

    /// Forward lookup for dispatch
    pub fn lookup(&self, key: &CallKey) -> Option<&WorkerHandle> {
        self.forward.get(key)
    }

    /// Remove both directions for a terminated worker
    pub fn remove_by_worker(&mut self, worker: WorkerId) -> Option<(CallKey, WorkerHandle)> {
        let key = self.reverse.remove(&worker)?;
        let handle = self.forward.remove(&key)?;
        Some((key, handle))
    }

    /// Whether the worker is still registered
    pub fn contains_worker(&self, worker: WorkerId) -> bool {
        self.reverse.contains_key(&worker)
    }

    /// Registered call keys
    pub fn keys(&self) -> impl Iterator<Item = &CallKey> {
        self.forward.keys()
    }

    /// Registered worker handles
    pub fn workers(&self) -> impl Iterator<Item = &WorkerHandle> {
        self.forward.values()
    }

    /// Number of live calls on this shard
    pub fn len(&self) -> usize {
        self.forward.len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }

    /// Check both directions agree (test support)
    #[cfg(test)]
    pub fn is_consistent(&self) -> bool {
        self.forward.len() == self.reverse.len()
            && self.forward.iter().all(|(key, handle)| {
                self.reverse.get(&handle.id).map(|k| k == key).unwrap_or(false)
            })
    }
}
