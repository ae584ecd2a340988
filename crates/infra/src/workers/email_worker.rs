use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use sweep_jobs::{ItemOutcome, JobStatus, WorkItem};

use crate::external::{MailProvider, RuleEngine, RuleOutcome};
use crate::jobs::{JobStore, JobStoreError};
use crate::ledger::DispatchLedger;

/// Result of one delivery of a work item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WorkerOutcome {
    /// Rules ran; `rule` names the one that applied, if any
    Processed { rule: Option<String> },
    SkippedCancelled,
    SkippedAlreadyProcessed,
    SkippedNoRules,
    /// Counted as failed on the job
    Failed { error: String },
    /// The item does not match a job this mailbox owns. Nothing was counted.
    Invalid { reason: String },
    /// The job store could not be reached. Nothing was counted; a redelivery
    /// can still succeed.
    Unavailable { error: String },
}

impl WorkerOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. } | Self::Unavailable { .. })
    }
}

/// Processes one delivered work item. Safe to call any number of times for
/// the same item: the rule engine's execution record is re-checked on every
/// delivery, and errors never escape as `Err`.
#[derive(Clone)]
pub struct EmailWorker {
    store: Arc<dyn JobStore>,
    mail: Arc<dyn MailProvider>,
    rules: Arc<dyn RuleEngine>,
    ledger: Option<Arc<DispatchLedger>>,
}

impl EmailWorker {
    pub fn new(store: Arc<dyn JobStore>, mail: Arc<dyn MailProvider>, rules: Arc<dyn RuleEngine>) -> Self {
        Self {
            store,
            mail,
            rules,
            ledger: None,
        }
    }

    /// Release the job's dispatch receipts when this worker completes it.
    pub fn with_ledger(mut self, ledger: Arc<DispatchLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    #[instrument(
        skip(self, item),
        fields(job_id = %item.job_id, message_id = %item.message_id, thread_id = %item.thread_id)
    )]
    pub async fn handle(&self, item: &WorkItem) -> WorkerOutcome {
        let job = match self.store.verify_ownership(item.job_id, item.mailbox_id).await {
            Ok(job) => job,
            Err(JobStoreError::NotFound(_)) => {
                warn!("work item for unknown job or foreign mailbox");
                return WorkerOutcome::Invalid {
                    reason: format!("job {} not found for mailbox {}", item.job_id, item.mailbox_id),
                };
            }
            Err(e) => return unavailable(e),
        };

        if job.status == JobStatus::Cancelled {
            debug!("job cancelled; skipping");
            return WorkerOutcome::SkippedCancelled;
        }

        // Trust the job record over the payload.
        if !job.force_reprocess {
            match self
                .rules
                .is_handled(item.mailbox_id, &item.thread_id, &item.message_id)
                .await
            {
                Ok(true) => {
                    debug!("already handled; skipping");
                    return self
                        .settle(item, ItemOutcome::Processed, WorkerOutcome::SkippedAlreadyProcessed)
                        .await;
                }
                Ok(false) => {}
                Err(e) => return self.fail(item, format!("execution lookup: {e}")).await,
            }
        }

        let message = match self.mail.get_message(item.mailbox_id, &item.message_id).await {
            Ok(message) => message,
            Err(e) => return self.fail(item, format!("fetch {}: {e}", item.message_id)).await,
        };

        let outcome = match self.rules.evaluate(item.mailbox_id, &message).await {
            Ok(RuleOutcome::NoRulesConfigured) => WorkerOutcome::SkippedNoRules,
            Ok(RuleOutcome::NoMatch) => WorkerOutcome::Processed { rule: None },
            Ok(RuleOutcome::Applied { rule }) => WorkerOutcome::Processed { rule },
            Err(e) => return self.fail(item, format!("evaluate {}: {e}", item.message_id)).await,
        };
        info!(outcome = ?outcome, "work item processed");
        self.settle(item, ItemOutcome::Processed, outcome).await
    }

    async fn fail(&self, item: &WorkItem, error: String) -> WorkerOutcome {
        warn!(error = %error, "work item failed");
        if let Err(e) = self.store.record_error(item.job_id, &error).await {
            warn!(error = %e, "could not record item error");
        }
        self.settle(item, ItemOutcome::Failed, WorkerOutcome::Failed { error })
            .await
    }

    /// Count the outcome once per item, then let the job complete if this was
    /// the last one.
    async fn settle(&self, item: &WorkItem, counted: ItemOutcome, outcome: WorkerOutcome) -> WorkerOutcome {
        match self
            .store
            .record_outcome(item.job_id, &item.message_id, counted)
            .await
        {
            Ok(Some(counters)) => debug!(
                accounted = counters.accounted(),
                total = counters.total_emails,
                "outcome counted"
            ),
            Ok(None) => debug!("item already counted by an earlier delivery"),
            Err(e) => return unavailable(e),
        }
        match self.store.complete_if_drained(item.job_id).await {
            Ok(true) => {
                info!("last item accounted for; job completed");
                if let Some(ledger) = &self.ledger {
                    ledger.forget(item.job_id);
                }
            }
            Ok(false) => {}
            Err(e) => warn!(error = %e, "completion check failed"),
        }
        outcome
    }
}

fn unavailable(e: JobStoreError) -> WorkerOutcome {
    warn!(error = %e, "job store unavailable");
    WorkerOutcome::Unavailable { error: e.to_string() }
}
