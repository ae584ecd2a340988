use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::{Value, json};

use sweep_core::{MailboxId, UserId};
use sweep_jobs::{BulkJob, NewJob, QueryWindow, WorkItem};

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct StartJobRequest {
    pub mailbox_id: MailboxId,
    pub start_date: NaiveDate,
    pub end_date: Option<NaiveDate>,
    #[serde(default)]
    pub unread_only: bool,
    #[serde(default)]
    pub force_reprocess: bool,
}

impl StartJobRequest {
    pub fn into_new_job(self, user_id: UserId) -> NewJob {
        let mut window = QueryWindow::new(self.start_date).unread_only(self.unread_only);
        if let Some(end) = self.end_date {
            window = window.until(end);
        }
        NewJob::new(self.mailbox_id, user_id, window).force_reprocess(self.force_reprocess)
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ListJobsQuery {
    pub mailbox: Option<MailboxId>,
    pub limit: Option<usize>,
}

/// Worker payload: a bare work item from the queue service or the fallback,
/// or an event envelope from the event platform.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum WorkerPayload {
    Item(WorkItem),
    Event { data: WorkItem },
}

impl WorkerPayload {
    pub fn into_item(self) -> WorkItem {
        match self {
            WorkerPayload::Item(item) | WorkerPayload::Event { data: item } => item,
        }
    }
}

// -------------------------
// Response mapping
// -------------------------

pub fn job_to_json(job: &BulkJob) -> Value {
    let counters = &job.counters;
    json!({
        "id": job.id.to_string(),
        "mailbox_id": job.mailbox_id.to_string(),
        "user_id": job.user_id.to_string(),
        "status": job.status.as_str(),
        "start_date": job.window.start_date,
        "end_date": job.window.end_date,
        "unread_only": job.window.unread_only,
        "force_reprocess": job.force_reprocess,
        "total_emails": counters.total_emails,
        "emails_queued": counters.emails_queued,
        "processed_emails": counters.processed_emails,
        "failed_emails": counters.failed_emails,
        "discovery_finished": job.discovery.finished,
        "pages_fetched": job.discovery.pages_fetched,
        "last_error": job.last_error,
        "created_at": job.created_at.to_rfc3339(),
        "updated_at": job.updated_at.to_rfc3339(),
        "completed_at": job.completed_at.map(|t| t.to_rfc3339()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_request_defaults_flags() {
        let mailbox = MailboxId::new();
        let body = json!({ "mailbox_id": mailbox, "start_date": "2024-03-01" });
        let req: StartJobRequest = serde_json::from_value(body).unwrap();
        let job = req.into_new_job(UserId::new());
        assert_eq!(job.mailbox_id, mailbox);
        assert!(!job.window.unread_only);
        assert!(!job.force_reprocess);
        assert_eq!(job.window.end_date, None);
    }

    #[test]
    fn worker_payload_accepts_both_shapes() {
        let item = json!({
            "job_id": sweep_core::JobId::new(),
            "mailbox_id": MailboxId::new(),
            "message_id": "m1",
            "thread_id": "t1",
        });
        let bare: WorkerPayload = serde_json::from_value(item.clone()).unwrap();
        let event: WorkerPayload =
            serde_json::from_value(json!({ "name": "bulk/email.process", "data": item })).unwrap();
        assert_eq!(bare.into_item(), event.into_item());

        assert!(serde_json::from_value::<WorkerPayload>(json!({ "job_id": "x" })).is_err());
    }
}
