//! Receipt ids handed out by the dispatch backends, per job.
//!
//! In memory only: the ids are used for best-effort withdrawal on cancel,
//! and losing them on restart just means fewer items get withdrawn. An
//! entry is dropped once its job is terminal.

use std::collections::HashMap;
use std::sync::Mutex;

use sweep_core::JobId;

#[derive(Debug, Default)]
pub struct DispatchLedger {
    inner: Mutex<HashMap<JobId, Vec<String>>>,
}

impl DispatchLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, job_id: JobId, message_ids: impl IntoIterator<Item = String>) {
        if let Ok(mut map) = self.inner.lock() {
            map.entry(job_id).or_default().extend(message_ids);
        }
    }

    pub fn len(&self, job_id: JobId) -> usize {
        self.inner
            .lock()
            .map(|m| m.get(&job_id).map_or(0, Vec::len))
            .unwrap_or(0)
    }

    /// Remove and return everything recorded for `job_id`.
    pub fn take(&self, job_id: JobId) -> Vec<String> {
        self.inner
            .lock()
            .ok()
            .and_then(|mut m| m.remove(&job_id))
            .unwrap_or_default()
    }

    /// Drop the entry for a job that can no longer be cancelled.
    pub fn forget(&self, job_id: JobId) {
        if let Ok(mut map) = self.inner.lock() {
            map.remove(&job_id);
        }
    }

    /// Number of jobs with an entry.
    pub fn tracked_jobs(&self) -> usize {
        self.inner.lock().map(|m| m.len()).unwrap_or(0)
    }
}
