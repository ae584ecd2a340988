//! Job lifecycle glue behind the start / status / cancel entry points.
//!
//! Starting a job creates it, marks it running and runs discovery in a
//! background task. From then on the job's terminal state is driven by the
//! counters (see `JobStore::complete_if_drained`), by discovery giving up, or
//! by an explicit cancel.

use std::sync::Arc;

use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

use sweep_core::{DomainError, JobId, MailboxId};
use sweep_dispatch::Dispatcher;
use sweep_jobs::{BulkJob, NewJob, RetryPolicy};

use crate::discovery::{DiscoveryError, DiscoveryLoop, DiscoveryReport};
use crate::jobs::{JobStore, JobStoreError};
use crate::ledger::DispatchLedger;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Store(#[from] JobStoreError),
}

/// A started job plus the task running its discovery.
#[derive(Debug)]
pub struct StartedJob {
    pub job: BulkJob,
    pub discovery: JoinHandle<Result<DiscoveryReport, DiscoveryError>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelledJob {
    pub job: BulkJob,
    /// Dispatched items the backend confirmed it withdrew
    pub withdrawn: usize,
}

#[derive(Clone)]
pub struct JobOrchestrator {
    store: Arc<dyn JobStore>,
    discovery: DiscoveryLoop,
    dispatcher: Arc<dyn Dispatcher>,
    ledger: Arc<DispatchLedger>,
    retry: RetryPolicy,
}

impl JobOrchestrator {
    pub fn new(
        store: Arc<dyn JobStore>,
        discovery: DiscoveryLoop,
        dispatcher: Arc<dyn Dispatcher>,
        ledger: Arc<DispatchLedger>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            discovery,
            dispatcher,
            ledger,
            retry,
        }
    }

    #[instrument(skip(self, input), fields(mailbox_id = %input.mailbox_id), err)]
    pub async fn start(&self, input: NewJob) -> Result<StartedJob, OrchestratorError> {
        input.window.validate()?;
        let job = self.store.create_job(input).await?;
        let job = self.store.mark_running(job.id).await?;
        info!(job_id = %job.id, "bulk job started");

        let this = self.clone();
        let job_id = job.id;
        let discovery = tokio::spawn(async move { this.run_discovery(job_id).await });
        Ok(StartedJob { job, discovery })
    }

    /// Run discovery to completion, retrying per the policy. The job is
    /// marked failed once the attempts are exhausted.
    pub async fn run_discovery(&self, job_id: JobId) -> Result<DiscoveryReport, DiscoveryError> {
        let mut attempt = 1;
        loop {
            match self.discovery.run(job_id).await {
                Ok(report) => return Ok(report),
                Err(e) if self.retry.should_retry(attempt) => {
                    let delay = self.retry.delay_for_attempt(attempt);
                    warn!(%job_id, attempt, error = %e, ?delay, "discovery attempt failed; retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!(%job_id, attempt, error = %e, "discovery failed; giving up");
                    match self.store.mark_failed(job_id, &e.to_string()).await {
                        Ok(_) => {}
                        // cancelled meanwhile
                        Err(JobStoreError::InvalidTransition(_)) => {}
                        Err(store_err) => {
                            error!(%job_id, error = %store_err, "could not mark job failed");
                        }
                    }
                    self.ledger.forget(job_id);
                    return Err(e);
                }
            }
        }
    }

    pub async fn status(&self, job_id: JobId, mailbox_id: MailboxId) -> Result<BulkJob, OrchestratorError> {
        Ok(self.store.verify_ownership(job_id, mailbox_id).await?)
    }

    pub async fn list(&self, mailbox_id: MailboxId, limit: usize) -> Result<Vec<BulkJob>, OrchestratorError> {
        Ok(self.store.list_for_mailbox(mailbox_id, limit).await?)
    }

    /// Cancel a non-terminal job and try to withdraw what was already
    /// dispatched. Items that cannot be withdrawn become no-ops at the worker.
    #[instrument(skip(self), err)]
    pub async fn cancel(&self, job_id: JobId, mailbox_id: MailboxId) -> Result<CancelledJob, OrchestratorError> {
        self.store.verify_ownership(job_id, mailbox_id).await?;
        let job = self.store.mark_cancelled(job_id).await?;

        let mut withdrawn = 0;
        for message_id in self.ledger.take(job_id) {
            if self.dispatcher.cancel(&message_id).await {
                withdrawn += 1;
            }
        }
        info!(withdrawn, "bulk job cancelled");
        Ok(CancelledJob { job, withdrawn })
    }
}
