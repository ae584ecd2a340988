//! Job storage contract and the in-memory implementation.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::Utc;

use sweep_core::{JobId, MailboxId, MessageId};
use sweep_jobs::{BulkJob, CounterDelta, ItemOutcome, JobCounters, JobError, JobStatus, NewJob};

/// Job store abstraction.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new `pending` job. Fails with [`JobStoreError::Conflict`] when
    /// the mailbox already has an active job.
    async fn create_job(&self, input: NewJob) -> Result<BulkJob, JobStoreError>;

    async fn get(&self, job_id: JobId) -> Result<Option<BulkJob>, JobStoreError>;

    /// Jobs of a mailbox, newest first.
    async fn list_for_mailbox(
        &self,
        mailbox_id: MailboxId,
        limit: usize,
    ) -> Result<Vec<BulkJob>, JobStoreError>;

    async fn mark_running(&self, job_id: JobId) -> Result<BulkJob, JobStoreError>;

    async fn mark_completed(&self, job_id: JobId) -> Result<BulkJob, JobStoreError>;

    async fn mark_failed(&self, job_id: JobId, error: &str) -> Result<BulkJob, JobStoreError>;

    async fn mark_cancelled(&self, job_id: JobId) -> Result<BulkJob, JobStoreError>;

    /// Atomic relative increments; returns the counters after the update.
    async fn increment_counters(
        &self,
        job_id: JobId,
        delta: CounterDelta,
    ) -> Result<JobCounters, JobStoreError>;

    /// Count newly discovered messages into `total_emails`. A message already
    /// discovered for this job is not counted again, so a page fetched twice
    /// after a retry adds nothing the second time. Returns how many were new.
    async fn record_discovered(
        &self,
        job_id: JobId,
        message_ids: &[MessageId],
    ) -> Result<u64, JobStoreError>;

    /// Count discovered messages into `emails_queued`, once per message.
    async fn record_queued(
        &self,
        job_id: JobId,
        message_ids: &[MessageId],
    ) -> Result<u64, JobStoreError>;

    /// Count one item's outcome, at most once per `(job, message)`. Returns
    /// `None` when the item was already counted by an earlier delivery.
    async fn record_outcome(
        &self,
        job_id: JobId,
        message_id: &MessageId,
        outcome: ItemOutcome,
    ) -> Result<Option<JobCounters>, JobStoreError>;

    /// Remember the most recent per-item error without changing status.
    async fn record_error(&self, job_id: JobId, error: &str) -> Result<(), JobStoreError>;

    async fn is_cancelled(&self, job_id: JobId) -> Result<bool, JobStoreError>;

    /// The job, if it belongs to `mailbox_id`. A foreign job is reported as
    /// not found so existence does not leak.
    async fn verify_ownership(
        &self,
        job_id: JobId,
        mailbox_id: MailboxId,
    ) -> Result<BulkJob, JobStoreError>;

    /// Commit a fetched page: `next_page_token` is where discovery resumes.
    async fn save_checkpoint(
        &self,
        job_id: JobId,
        next_page_token: Option<String>,
    ) -> Result<(), JobStoreError>;

    async fn finish_discovery(&self, job_id: JobId) -> Result<(), JobStoreError>;

    /// Move a `running` job to `completed` if discovery is finished and every
    /// counted item has an outcome. Returns whether this call completed it.
    async fn complete_if_drained(&self, job_id: JobId) -> Result<bool, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("mailbox {0} already has an active job")]
    Conflict(MailboxId),
    #[error(transparent)]
    InvalidTransition(#[from] JobError),
    #[error("storage error: {0}")]
    Storage(String),
}

/// In-memory job store for tests/dev.
///
/// A single write lock covers the active-job check and the insert, so two
/// concurrent creations for one mailbox cannot both succeed.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    state: RwLock<State>,
}

#[derive(Debug, Default)]
struct State {
    jobs: HashMap<JobId, BulkJob>,
    discovered: HashSet<(JobId, MessageId)>,
    queued: HashSet<(JobId, MessageId)>,
    counted: HashSet<(JobId, MessageId)>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, State>, JobStoreError> {
        self.state
            .read()
            .map_err(|_| JobStoreError::Storage("job store lock poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>, JobStoreError> {
        self.state
            .write()
            .map_err(|_| JobStoreError::Storage("job store lock poisoned".into()))
    }

    fn update<T>(
        &self,
        job_id: JobId,
        f: impl FnOnce(&mut BulkJob) -> Result<T, JobStoreError>,
    ) -> Result<T, JobStoreError> {
        let mut state = self.write()?;
        let job = state.jobs.get_mut(&job_id).ok_or(JobStoreError::NotFound(job_id))?;
        f(job)
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create_job(&self, input: NewJob) -> Result<BulkJob, JobStoreError> {
        let mut state = self.write()?;
        if state
            .jobs
            .values()
            .any(|j| j.mailbox_id == input.mailbox_id && j.status.is_active())
        {
            return Err(JobStoreError::Conflict(input.mailbox_id));
        }
        let job = BulkJob::new(input);
        state.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get(&self, job_id: JobId) -> Result<Option<BulkJob>, JobStoreError> {
        Ok(self.read()?.jobs.get(&job_id).cloned())
    }

    async fn list_for_mailbox(
        &self,
        mailbox_id: MailboxId,
        limit: usize,
    ) -> Result<Vec<BulkJob>, JobStoreError> {
        let state = self.read()?;
        let mut result: Vec<_> = state
            .jobs
            .values()
            .filter(|j| j.mailbox_id == mailbox_id)
            .cloned()
            .collect();
        result.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        result.truncate(limit);
        Ok(result)
    }

    async fn mark_running(&self, job_id: JobId) -> Result<BulkJob, JobStoreError> {
        self.update(job_id, |job| {
            job.mark_running(Utc::now())?;
            Ok(job.clone())
        })
    }

    async fn mark_completed(&self, job_id: JobId) -> Result<BulkJob, JobStoreError> {
        self.update(job_id, |job| {
            job.mark_completed(Utc::now())?;
            Ok(job.clone())
        })
    }

    async fn mark_failed(&self, job_id: JobId, error: &str) -> Result<BulkJob, JobStoreError> {
        self.update(job_id, |job| {
            job.mark_failed(error, Utc::now())?;
            Ok(job.clone())
        })
    }

    async fn mark_cancelled(&self, job_id: JobId) -> Result<BulkJob, JobStoreError> {
        self.update(job_id, |job| {
            job.mark_cancelled(Utc::now())?;
            Ok(job.clone())
        })
    }

    async fn increment_counters(
        &self,
        job_id: JobId,
        delta: CounterDelta,
    ) -> Result<JobCounters, JobStoreError> {
        self.update(job_id, |job| {
            job.apply(delta, Utc::now());
            Ok(job.counters)
        })
    }

    async fn record_discovered(
        &self,
        job_id: JobId,
        message_ids: &[MessageId],
    ) -> Result<u64, JobStoreError> {
        let mut state = self.write()?;
        let State {
            jobs, discovered, ..
        } = &mut *state;
        let job = jobs.get_mut(&job_id).ok_or(JobStoreError::NotFound(job_id))?;
        let fresh = message_ids
            .iter()
            .filter(|id| discovered.insert((job_id, (*id).clone())))
            .count() as u64;
        if fresh > 0 {
            job.apply(CounterDelta::total(fresh), Utc::now());
        }
        Ok(fresh)
    }

    async fn record_queued(
        &self,
        job_id: JobId,
        message_ids: &[MessageId],
    ) -> Result<u64, JobStoreError> {
        let mut state = self.write()?;
        let State {
            jobs,
            discovered,
            queued,
            ..
        } = &mut *state;
        let job = jobs.get_mut(&job_id).ok_or(JobStoreError::NotFound(job_id))?;
        let fresh = message_ids
            .iter()
            .map(|id| (job_id, id.clone()))
            .filter(|key| discovered.contains(key) && queued.insert(key.clone()))
            .count() as u64;
        if fresh > 0 {
            job.apply(
                CounterDelta {
                    queued: fresh,
                    ..CounterDelta::default()
                },
                Utc::now(),
            );
        }
        Ok(fresh)
    }

    async fn record_outcome(
        &self,
        job_id: JobId,
        message_id: &MessageId,
        outcome: ItemOutcome,
    ) -> Result<Option<JobCounters>, JobStoreError> {
        let mut state = self.write()?;
        let State { jobs, counted, .. } = &mut *state;
        let job = jobs.get_mut(&job_id).ok_or(JobStoreError::NotFound(job_id))?;
        if !counted.insert((job_id, message_id.clone())) {
            return Ok(None);
        }
        job.apply(outcome.delta(), Utc::now());
        Ok(Some(job.counters))
    }

    async fn record_error(&self, job_id: JobId, error: &str) -> Result<(), JobStoreError> {
        self.update(job_id, |job| {
            job.record_error(error);
            Ok(())
        })
    }

    async fn is_cancelled(&self, job_id: JobId) -> Result<bool, JobStoreError> {
        let state = self.read()?;
        let job = state.jobs.get(&job_id).ok_or(JobStoreError::NotFound(job_id))?;
        Ok(job.status == JobStatus::Cancelled)
    }

    async fn verify_ownership(
        &self,
        job_id: JobId,
        mailbox_id: MailboxId,
    ) -> Result<BulkJob, JobStoreError> {
        match self.read()?.jobs.get(&job_id) {
            Some(job) if job.mailbox_id == mailbox_id => Ok(job.clone()),
            _ => Err(JobStoreError::NotFound(job_id)),
        }
    }

    async fn save_checkpoint(
        &self,
        job_id: JobId,
        next_page_token: Option<String>,
    ) -> Result<(), JobStoreError> {
        self.update(job_id, |job| {
            job.checkpoint(next_page_token, Utc::now());
            Ok(())
        })
    }

    async fn finish_discovery(&self, job_id: JobId) -> Result<(), JobStoreError> {
        self.update(job_id, |job| {
            job.finish_discovery(Utc::now());
            Ok(())
        })
    }

    async fn complete_if_drained(&self, job_id: JobId) -> Result<bool, JobStoreError> {
        self.update(job_id, |job| {
            if !job.is_drained() {
                return Ok(false);
            }
            job.mark_completed(Utc::now())?;
            Ok(true)
        })
    }
}

#[async_trait]
impl<S> JobStore for Arc<S>
where
    S: JobStore + ?Sized,
{
    async fn create_job(&self, input: NewJob) -> Result<BulkJob, JobStoreError> {
        (**self).create_job(input).await
    }

    async fn get(&self, job_id: JobId) -> Result<Option<BulkJob>, JobStoreError> {
        (**self).get(job_id).await
    }

    async fn list_for_mailbox(
        &self,
        mailbox_id: MailboxId,
        limit: usize,
    ) -> Result<Vec<BulkJob>, JobStoreError> {
        (**self).list_for_mailbox(mailbox_id, limit).await
    }

    async fn mark_running(&self, job_id: JobId) -> Result<BulkJob, JobStoreError> {
        (**self).mark_running(job_id).await
    }

    async fn mark_completed(&self, job_id: JobId) -> Result<BulkJob, JobStoreError> {
        (**self).mark_completed(job_id).await
    }

    async fn mark_failed(&self, job_id: JobId, error: &str) -> Result<BulkJob, JobStoreError> {
        (**self).mark_failed(job_id, error).await
    }

    async fn mark_cancelled(&self, job_id: JobId) -> Result<BulkJob, JobStoreError> {
        (**self).mark_cancelled(job_id).await
    }

    async fn increment_counters(
        &self,
        job_id: JobId,
        delta: CounterDelta,
    ) -> Result<JobCounters, JobStoreError> {
        (**self).increment_counters(job_id, delta).await
    }

    async fn record_discovered(
        &self,
        job_id: JobId,
        message_ids: &[MessageId],
    ) -> Result<u64, JobStoreError> {
        (**self).record_discovered(job_id, message_ids).await
    }

    async fn record_queued(
        &self,
        job_id: JobId,
        message_ids: &[MessageId],
    ) -> Result<u64, JobStoreError> {
        (**self).record_queued(job_id, message_ids).await
    }

    async fn record_outcome(
        &self,
        job_id: JobId,
        message_id: &MessageId,
        outcome: ItemOutcome,
    ) -> Result<Option<JobCounters>, JobStoreError> {
        (**self).record_outcome(job_id, message_id, outcome).await
    }

    async fn record_error(&self, job_id: JobId, error: &str) -> Result<(), JobStoreError> {
        (**self).record_error(job_id, error).await
    }

    async fn is_cancelled(&self, job_id: JobId) -> Result<bool, JobStoreError> {
        (**self).is_cancelled(job_id).await
    }

    async fn verify_ownership(
        &self,
        job_id: JobId,
        mailbox_id: MailboxId,
    ) -> Result<BulkJob, JobStoreError> {
        (**self).verify_ownership(job_id, mailbox_id).await
    }

    async fn save_checkpoint(
        &self,
        job_id: JobId,
        next_page_token: Option<String>,
    ) -> Result<(), JobStoreError> {
        (**self).save_checkpoint(job_id, next_page_token).await
    }

    async fn finish_discovery(&self, job_id: JobId) -> Result<(), JobStoreError> {
        (**self).finish_discovery(job_id).await
    }

    async fn complete_if_drained(&self, job_id: JobId) -> Result<bool, JobStoreError> {
        (**self).complete_if_drained(job_id).await
    }
}
