use serde::{Deserialize, Serialize};

use sweep_core::{JobId, MailboxId, MessageId, ThreadId};

use crate::{BulkJob, CounterDelta};

/// Unit of dispatch. Not persisted; the worker re-reads the job before
/// acting on it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkItem {
    pub job_id: JobId,
    pub mailbox_id: MailboxId,
    pub message_id: MessageId,
    pub thread_id: ThreadId,
    #[serde(default)]
    pub force_reprocess: bool,
}

impl WorkItem {
    pub fn for_job(job: &BulkJob, message_id: MessageId, thread_id: ThreadId) -> Self {
        Self {
            job_id: job.id,
            mailbox_id: job.mailbox_id,
            message_id,
            thread_id,
            force_reprocess: job.force_reprocess,
        }
    }

    /// Key used by backends that de-duplicate deliveries.
    pub fn idempotency_key(&self) -> String {
        format!("{}:{}", self.job_id, self.message_id)
    }
}

/// How a work item was finally accounted on its job. Each item is counted at
/// most once, whatever the number of deliveries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemOutcome {
    Processed,
    Failed,
}

impl ItemOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemOutcome::Processed => "processed",
            ItemOutcome::Failed => "failed",
        }
    }

    pub fn delta(&self) -> CounterDelta {
        match self {
            ItemOutcome::Processed => CounterDelta::processed(1),
            ItemOutcome::Failed => CounterDelta::failed(1),
        }
    }
}

