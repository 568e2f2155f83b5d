//! Connection liveness bookkeeping.
//!
//! Workers mark traffic per local session index; a maintenance task elsewhere
//! promotes or retires sessions based on these marks. The inbound path only
//! ever records activity and clears indices during teardown.

use std::collections::HashSet;
use std::sync::Mutex;

#[derive(Default)]
struct ConnManagerInner {
    /// Indices that saw inbound traffic since the last maintenance sweep.
    in_marks: HashSet<u32>,
    /// Indices queued for deletion unless traffic revives them.
    pending_deletion: HashSet<u32>,
}

/// Tracks which sessions are alive based on observed traffic.
#[derive(Default)]
pub struct ConnectionManager {
    inner: Mutex<ConnManagerInner>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record inbound traffic for a session. Revives a pending deletion.
    pub fn packet_in(&self, local_index: u32) {
        let mut inner = self.inner.lock().unwrap();
        inner.in_marks.insert(local_index);
        inner.pending_deletion.remove(&local_index);
    }

    pub fn has_in_mark(&self, local_index: u32) -> bool {
        self.inner.lock().unwrap().in_marks.contains(&local_index)
    }

    pub fn clear_local_index(&self, local_index: u32) {
        self.inner.lock().unwrap().in_marks.remove(&local_index);
    }

    pub fn clear_pending_deletion(&self, local_index: u32) {
        self.inner.lock().unwrap().pending_deletion.remove(&local_index);
    }

    pub fn mark_pending_deletion(&self, local_index: u32) {
        self.inner.lock().unwrap().pending_deletion.insert(local_index);
    }

    /// Drain the traffic marks for a maintenance sweep.
    pub fn take_in_marks(&self) -> Vec<u32> {
        self.inner.lock().unwrap().in_marks.drain().collect()
    }
}
