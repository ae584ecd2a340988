//! Job record, status machine, and counters.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use sweep_core::{DomainError, JobId, MailboxId, UserId};

/// Job execution status.
///
/// `Pending` and `Running` are the only non-terminal states. Once a job is
/// terminal it never changes again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Created, discovery not yet started
    Pending,
    /// Discovery and/or workers in progress
    Running,
    /// Every discovered item was accounted for
    Completed,
    /// Discovery failed unrecoverably
    Failed,
    /// Cancelled by the owner
    Cancelled,
}

impl JobStatus {
    pub const ACTIVE: [JobStatus; 2] = [JobStatus::Pending, JobStatus::Running];

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(DomainError::validation(format!("unknown job status: {other}"))),
        }
    }
}

/// Errors raised by pure job transitions.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobError {
    /// The job is already terminal; the transition was refused.
    #[error("job {job_id} is already {from}, cannot move to {to}")]
    InvalidTransition {
        job_id: JobId,
        from: JobStatus,
        to: JobStatus,
    },
}

/// Date-bounded mailbox query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryWindow {
    pub start_date: NaiveDate,
    #[serde(default)]
    pub end_date: Option<NaiveDate>,
    #[serde(default)]
    pub unread_only: bool,
}

impl QueryWindow {
    pub fn new(start_date: NaiveDate) -> Self {
        Self {
            start_date,
            end_date: None,
            unread_only: false,
        }
    }

    pub fn until(mut self, end_date: NaiveDate) -> Self {
        self.end_date = Some(end_date);
        self
    }

    pub fn unread_only(mut self, unread_only: bool) -> Self {
        self.unread_only = unread_only;
        self
    }

    pub fn validate(&self) -> Result<(), DomainError> {
        match self.end_date {
            Some(end) if end < self.start_date => Err(DomainError::validation(
                "end_date must not be before start_date",
            )),
            _ => Ok(()),
        }
    }

    /// Render as a provider search expression, e.g.
    /// `after:2024/01/01 before:2024/02/01 is:unread` for a window ending on
    /// 2024-01-31. `before:` is exclusive, so it names the day after the
    /// inclusive end date.
    pub fn to_search_query(&self) -> String {
        let mut parts = vec![format!("after:{}", self.start_date.format("%Y/%m/%d"))];
        if let Some(next_day) = self.end_date.and_then(|end| end.succ_opt()) {
            parts.push(format!("before:{}", next_day.format("%Y/%m/%d")));
        }
        if self.unread_only {
            parts.push("is:unread".to_string());
        }
        parts.join(" ")
    }
}

/// Monotonic progress counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounters {
    /// Items kept by discovery
    pub total_emails: u64,
    /// Items successfully handed to a dispatch backend
    pub emails_queued: u64,
    pub processed_emails: u64,
    pub failed_emails: u64,
}

impl JobCounters {
    pub fn accounted(&self) -> u64 {
        self.processed_emails + self.failed_emails
    }

    /// Apply a delta. Outcome increments are capped so that
    /// `processed + failed` never passes `total`; a redelivered item that
    /// would overshoot is absorbed instead of double counted.
    pub fn apply(&mut self, delta: CounterDelta) {
        self.total_emails += delta.total;
        self.emails_queued = (self.emails_queued + delta.queued).min(self.total_emails);

        let mut room = self.total_emails.saturating_sub(self.accounted());
        let processed = delta.processed.min(room);
        room -= processed;
        let failed = delta.failed.min(room);

        self.processed_emails += processed;
        self.failed_emails += failed;
    }
}

/// Relative counter increments. Counters are never set absolutely.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterDelta {
    pub total: u64,
    pub queued: u64,
    pub processed: u64,
    pub failed: u64,
}

impl CounterDelta {
    pub fn total(n: u64) -> Self {
        Self {
            total: n,
            ..Default::default()
        }
    }

    pub fn queued(n: u64) -> Self {
        Self {
            queued: n,
            ..Default::default()
        }
    }

    pub fn processed(n: u64) -> Self {
        Self {
            processed: n,
            ..Default::default()
        }
    }

    pub fn failed(n: u64) -> Self {
        Self {
            failed: n,
            ..Default::default()
        }
    }

    pub fn and_failed(mut self, n: u64) -> Self {
        self.failed += n;
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Where discovery got to. Saved after every page so a retried discovery
/// run resumes instead of recounting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryProgress {
    /// Continuation token of the next page to fetch
    pub page_token: Option<String>,
    pub pages_fetched: u32,
    pub finished: bool,
}

/// Input to job creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJob {
    pub mailbox_id: MailboxId,
    pub user_id: UserId,
    pub window: QueryWindow,
    pub force_reprocess: bool,
}

impl NewJob {
    pub fn new(mailbox_id: MailboxId, user_id: UserId, window: QueryWindow) -> Self {
        Self {
            mailbox_id,
            user_id,
            window,
            force_reprocess: false,
        }
    }

    pub fn force_reprocess(mut self, force: bool) -> Self {
        self.force_reprocess = force;
        self
    }
}

/// One bulk-processing run over a mailbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkJob {
    pub id: JobId,
    pub mailbox_id: MailboxId,
    pub user_id: UserId,
    pub window: QueryWindow,
    pub force_reprocess: bool,
    pub status: JobStatus,
    pub counters: JobCounters,
    pub discovery: DiscoveryProgress,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set iff `status` is terminal
    pub completed_at: Option<DateTime<Utc>>,
}

impl BulkJob {
    pub fn new(input: NewJob) -> Self {
        Self::with_id(JobId::new(), input, Utc::now())
    }

    pub fn with_id(id: JobId, input: NewJob, now: DateTime<Utc>) -> Self {
        Self {
            id,
            mailbox_id: input.mailbox_id,
            user_id: input.user_id,
            window: input.window,
            force_reprocess: input.force_reprocess,
            status: JobStatus::Pending,
            counters: JobCounters::default(),
            discovery: DiscoveryProgress::default(),
            last_error: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    fn transition(&mut self, to: JobStatus, now: DateTime<Utc>) -> Result<(), JobError> {
        if self.status.is_terminal() {
            return Err(JobError::InvalidTransition {
                job_id: self.id,
                from: self.status,
                to,
            });
        }
        self.status = to;
        self.updated_at = now;
        if to.is_terminal() {
            self.completed_at = Some(now);
        }
        Ok(())
    }

    pub fn mark_running(&mut self, now: DateTime<Utc>) -> Result<(), JobError> {
        self.transition(JobStatus::Running, now)
    }

    pub fn mark_completed(&mut self, now: DateTime<Utc>) -> Result<(), JobError> {
        self.transition(JobStatus::Completed, now)
    }

    pub fn mark_failed(&mut self, error: impl Into<String>, now: DateTime<Utc>) -> Result<(), JobError> {
        self.transition(JobStatus::Failed, now)?;
        self.last_error = Some(error.into());
        Ok(())
    }

    pub fn mark_cancelled(&mut self, now: DateTime<Utc>) -> Result<(), JobError> {
        self.transition(JobStatus::Cancelled, now)
    }

    /// Counters only ever move forward. Terminal jobs still accept
    /// increments from late workers so nothing is lost.
    pub fn apply(&mut self, delta: CounterDelta, now: DateTime<Utc>) {
        self.counters.apply(delta);
        self.updated_at = now;
    }

    pub fn record_error(&mut self, error: impl Into<String>) {
        self.last_error = Some(error.into());
    }

    pub fn checkpoint(&mut self, next_page_token: Option<String>, now: DateTime<Utc>) {
        self.discovery.page_token = next_page_token;
        self.discovery.pages_fetched += 1;
        self.updated_at = now;
    }

    pub fn finish_discovery(&mut self, now: DateTime<Utc>) {
        self.discovery.finished = true;
        self.discovery.page_token = None;
        self.updated_at = now;
    }

    /// Running, discovery done, and every counted item has an outcome.
    pub fn is_drained(&self) -> bool {
        self.status == JobStatus::Running
            && self.discovery.finished
            && self.counters.accounted() >= self.counters.total_emails
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> BulkJob {
        let window = QueryWindow::new(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap());
        BulkJob::new(NewJob::new(MailboxId::new(), UserId::new(), window))
    }

    #[test]
    fn lifecycle_stamps_completed_at_only_on_terminal() {
        let mut job = job();
        assert_eq!(job.status, JobStatus::Pending);

        job.mark_running(Utc::now()).unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert!(job.completed_at.is_none());

        job.mark_completed(Utc::now()).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.completed_at.is_some());
    }

    #[test]
    fn terminal_jobs_refuse_transitions() {
        let mut job = job();
        job.mark_cancelled(Utc::now()).unwrap();

        let err = job.mark_running(Utc::now()).unwrap_err();
        assert_eq!(
            err,
            JobError::InvalidTransition {
                job_id: job.id,
                from: JobStatus::Cancelled,
                to: JobStatus::Running,
            }
        );
        assert!(job.mark_completed(Utc::now()).is_err());
        assert!(job.mark_failed("late", Utc::now()).is_err());
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(job.last_error.is_none());
    }

    #[test]
    fn failure_records_error() {
        let mut job = job();
        job.mark_running(Utc::now()).unwrap();
        job.mark_failed("provider unavailable", Utc::now()).unwrap();
        assert_eq!(job.last_error.as_deref(), Some("provider unavailable"));
        assert!(job.completed_at.is_some());
    }

    #[test]
    fn drained_requires_finished_discovery() {
        let mut job = job();
        job.mark_running(Utc::now()).unwrap();
        job.apply(CounterDelta::total(2), Utc::now());
        job.apply(CounterDelta::processed(1).and_failed(1), Utc::now());
        assert!(!job.is_drained());

        job.finish_discovery(Utc::now());
        assert!(job.is_drained());
    }

    #[test]
    fn outcomes_never_overshoot_total() {
        let mut counters = JobCounters::default();
        counters.apply(CounterDelta::total(2));
        counters.apply(CounterDelta::processed(1));
        counters.apply(CounterDelta::processed(1));
        // Redelivery of an already counted item.
        counters.apply(CounterDelta::processed(1));
        counters.apply(CounterDelta::failed(1));
        assert_eq!(counters.processed_emails, 2);
        assert_eq!(counters.failed_emails, 0);
        assert_eq!(counters.accounted(), counters.total_emails);
    }

    #[test]
    fn empty_job_is_drained_once_discovery_finishes() {
        let mut job = job();
        job.mark_running(Utc::now()).unwrap();
        job.finish_discovery(Utc::now());
        assert!(job.is_drained());
    }

    #[test]
    fn window_validation_and_query() {
        let start = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let end = NaiveDate::from_ymd_opt(2024, 2, 1).unwrap();
        assert!(QueryWindow::new(start).until(end).validate().is_err());

        let window = QueryWindow::new(end).until(start).unread_only(true);
        assert!(window.validate().is_ok());
        assert_eq!(
            window.to_search_query(),
            "after:2024/02/01 before:2024/03/02 is:unread"
        );
    }

    #[test]
    fn end_date_is_inclusive() {
        let start = NaiveDate::from_ymd_opt(2024, 12, 1).unwrap();
        let end = NaiveDate::from_ymd_opt(2024, 12, 31).unwrap();
        assert_eq!(
            QueryWindow::new(start).until(end).to_search_query(),
            "after:2024/12/01 before:2025/01/01"
        );
        // a single-day window still matches that day
        assert_eq!(
            QueryWindow::new(end).until(end).to_search_query(),
            "after:2024/12/31 before:2025/01/01"
        );
    }

    #[test]
    fn status_parses_its_own_rendering() {
        for status in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("dead".parse::<JobStatus>().is_err());
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        fn delta() -> impl Strategy<Value = CounterDelta> {
            (0u64..5, 0u64..5, 0u64..5, 0u64..5).prop_map(|(total, queued, processed, failed)| {
                CounterDelta {
                    total,
                    queued,
                    processed,
                    failed,
                }
            })
        }

        proptest! {
            #[test]
            fn accounted_never_exceeds_total(deltas in proptest::collection::vec(delta(), 0..64)) {
                let mut counters = JobCounters::default();
                let mut previous = counters;
                for d in deltas {
                    counters.apply(d);
                    prop_assert!(counters.accounted() <= counters.total_emails);
                    prop_assert!(counters.emails_queued <= counters.total_emails);
                    prop_assert!(counters.total_emails >= previous.total_emails);
                    prop_assert!(counters.processed_emails >= previous.processed_emails);
                    prop_assert!(counters.failed_emails >= previous.failed_emails);
                    previous = counters;
                }
            }
        }
    }
}
