use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

/// Identifier of one registered call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallId(u64);

impl CallId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "call-{}", self.0)
    }
}

/// Cancellation side of a registered call.
pub(crate) trait CallControl: Send + Sync {
    /// Runs the call's cancel contract. Must be idempotent.
    fn cancel(&self);

    /// Returns `true` once the call reached a terminal state.
    fn is_finished(&self) -> bool;
}

struct Entry {
    operation: &'static str,
    control: Arc<dyn CallControl>,
}

#[derive(Default)]
struct RegistryState {
    next_id: u64,
    calls: HashMap<CallId, Entry>,
}

/// In-flight calls of one service, keyed by [`CallId`].
///
/// Entries are added when a call starts and removed when it reaches a terminal
/// state, so the map only ever holds live calls.
#[derive(Clone, Default)]
pub struct CallRegistry {
    state: Arc<Mutex<RegistryState>>,
}

impl CallRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn register(
        &self,
        operation: &'static str,
        control: Arc<dyn CallControl>,
    ) -> CallId {
        let mut state = self.lock();
        state.next_id += 1;
        let id = CallId(state.next_id);
        state.calls.insert(id, Entry { operation, control });
        id
    }

    pub(crate) fn remove(&self, id: CallId) {
        self.lock().calls.remove(&id);
    }

    /// Cancels one call. Returns `false` when it is no longer registered.
    pub fn cancel(&self, id: CallId) -> bool {
        let entry = self.lock().calls.remove(&id);
        match entry {
            Some(entry) => {
                debug!(call = %id, operation = entry.operation, "cancelling call");
                entry.control.cancel();
                true
            }
            None => false,
        }
    }

    /// Force-cancels every registered call and returns how many there were.
    ///
    /// Each call still runs its cancel contract, so stream callers observe their
    /// completion signal.
    pub fn cancel_all(&self) -> usize {
        let entries: Vec<(CallId, Entry)> = self.lock().calls.drain().collect();
        let count = entries.len();
        if count > 0 {
            debug!(count, "cancelling all in-flight calls");
        }
        for (_, entry) in entries {
            entry.control.cancel();
        }
        count
    }

    /// Live calls ordered by id.
    pub fn in_flight(&self) -> Vec<(CallId, &'static str)> {
        let mut calls: Vec<(CallId, &'static str)> = self
            .lock()
            .calls
            .iter()
            .map(|(id, entry)| (*id, entry.operation))
            .collect();
        calls.sort_by_key(|(id, _)| *id);
        calls
    }

    pub fn len(&self) -> usize {
        self.lock().calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for CallRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallRegistry")
            .field("in_flight", &self.in_flight())
            .finish()
    }
}
