//! Discovery loop: pages through a mailbox query and dispatches a work item
//! for every message that still needs processing.
//!
//! One run handles one job, one page at a time:
//!
//! 1. stop if the job was cancelled
//! 2. fetch the page at the last committed continuation token
//! 3. drop items without an id, from ignored senders, or on threads the
//!    rule engine already handled (unless the job forces reprocessing)
//! 4. count the kept messages into `total_emails`, then dispatch the page
//! 5. commit the next token as the checkpoint
//!
//! A run that fails part-way can be repeated; it resumes at the checkpoint.
//! Discovery, queueing and dispatch failures are all counted once per
//! message, so a page fetched again after a failure adds nothing twice.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use sweep_core::{JobId, MessageId, ThreadId};
use sweep_dispatch::{DispatchRequest, Dispatcher, EnqueueOptions};
use sweep_jobs::{BulkJob, ItemOutcome, JobStatus, WorkItem};

use crate::config::DiscoveryConfig;
use crate::external::{
    IgnoreList, MailError, MailProvider, MessageQuery, MessageSummary, RuleEngine, RuleError,
};
use crate::jobs::{JobStore, JobStoreError};
use crate::ledger::DispatchLedger;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DiscoveryError {
    #[error("job not found: {0}")]
    JobNotFound(JobId),
    /// The provider returned a continuation token with zero items. Treated as
    /// a transient upstream fault, never as the end of the results.
    #[error("empty page with continuation token after {pages_fetched} pages")]
    EmptyPageWithToken { pages_fetched: u32 },
    #[error(transparent)]
    Mail(#[from] MailError),
    #[error(transparent)]
    Rules(#[from] RuleError),
    #[error(transparent)]
    Store(#[from] JobStoreError),
}

/// What one run did. Counts cover this run only, not earlier attempts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryReport {
    pub pages: u32,
    pub kept: u64,
    pub skipped: u64,
    pub queued: u64,
    pub dispatch_failures: u64,
    pub cancelled: bool,
    /// Whether the job reached `completed` at the end of this run
    pub completed: bool,
}

#[derive(Debug, Clone)]
pub struct DiscoverySettings {
    pub page_size: u32,
    pub concurrency_limit: u32,
    pub ignore: IgnoreList,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            page_size: 25,
            concurrency_limit: 3,
            ignore: IgnoreList::default(),
        }
    }
}

impl From<&DiscoveryConfig> for DiscoverySettings {
    fn from(config: &DiscoveryConfig) -> Self {
        Self {
            page_size: config.page_size,
            concurrency_limit: config.concurrency_limit,
            ignore: IgnoreList::new(&config.ignored_senders),
        }
    }
}

#[derive(Clone)]
pub struct DiscoveryLoop {
    store: Arc<dyn JobStore>,
    mail: Arc<dyn MailProvider>,
    rules: Arc<dyn RuleEngine>,
    dispatcher: Arc<dyn Dispatcher>,
    ledger: Arc<DispatchLedger>,
    settings: DiscoverySettings,
}

/// Outcome of dispatching one page.
#[derive(Debug, Default)]
struct PageDispatch {
    queued: Vec<MessageId>,
    failed: Vec<MessageId>,
    last_error: Option<String>,
}

impl DiscoveryLoop {
    pub fn new(
        store: Arc<dyn JobStore>,
        mail: Arc<dyn MailProvider>,
        rules: Arc<dyn RuleEngine>,
        dispatcher: Arc<dyn Dispatcher>,
        ledger: Arc<DispatchLedger>,
        settings: DiscoverySettings,
    ) -> Self {
        Self {
            store,
            mail,
            rules,
            dispatcher,
            ledger,
            settings,
        }
    }

    #[instrument(skip(self), fields(backend = %self.dispatcher.backend()), err)]
    pub async fn run(&self, job_id: JobId) -> Result<DiscoveryReport, DiscoveryError> {
        let job = self
            .store
            .get(job_id)
            .await?
            .ok_or(DiscoveryError::JobNotFound(job_id))?;
        let mut report = DiscoveryReport::default();

        if job.status.is_terminal() {
            debug!(status = %job.status, "job already terminal; nothing to discover");
            report.cancelled = job.status == JobStatus::Cancelled;
            return Ok(report);
        }

        let query = MessageQuery {
            window: job.window.clone(),
            page_size: self.settings.page_size,
        };
        let mut token = job.discovery.page_token.clone();
        let mut pages_fetched = job.discovery.pages_fetched;

        if !job.discovery.finished {
            loop {
                if self.store.is_cancelled(job_id).await? {
                    info!(pages = report.pages, "job cancelled; discovery stopped");
                    report.cancelled = true;
                    return Ok(report);
                }

                let page = self
                    .mail
                    .list_messages(job.mailbox_id, &query, token.as_deref())
                    .await?;
                if page.items.is_empty() && page.next_page_token.is_some() {
                    warn!(pages_fetched, "provider returned an empty page with a continuation token");
                    return Err(DiscoveryError::EmptyPageWithToken { pages_fetched });
                }

                let fetched = page.items.len() as u64;
                let items = self.select(&job, page.items).await?;
                let kept = items.len() as u64;

                let ids: Vec<MessageId> = items.iter().map(|i| i.message_id.clone()).collect();
                if !ids.is_empty() {
                    self.store.record_discovered(job_id, &ids).await?;
                }
                let dispatched = self.dispatch_page(job_id, items).await;
                if !dispatched.queued.is_empty() {
                    self.store.record_queued(job_id, &dispatched.queued).await?;
                }
                for message_id in &dispatched.failed {
                    self.store
                        .record_outcome(job_id, message_id, ItemOutcome::Failed)
                        .await?;
                }
                if let Some(error) = &dispatched.last_error {
                    self.store.record_error(job_id, error).await?;
                }

                self.store
                    .save_checkpoint(job_id, page.next_page_token.clone())
                    .await?;
                pages_fetched += 1;
                report.pages += 1;
                report.kept += kept;
                report.skipped += fetched - kept;
                report.queued += dispatched.queued.len() as u64;
                report.dispatch_failures += dispatched.failed.len() as u64;
                info!(
                    page = pages_fetched,
                    fetched,
                    kept,
                    queued = dispatched.queued.len(),
                    dispatch_failures = dispatched.failed.len(),
                    "page dispatched"
                );

                token = page.next_page_token;
                if token.is_none() {
                    break;
                }
                match self.dispatcher.page_delay() {
                    Some(delay) => tokio::time::sleep(delay).await,
                    None => tokio::task::yield_now().await,
                }
            }
            self.store.finish_discovery(job_id).await?;
        }

        report.completed = self.store.complete_if_drained(job_id).await?;
        if report.completed {
            self.ledger.forget(job_id);
        }
        info!(
            pages = report.pages,
            kept = report.kept,
            completed = report.completed,
            "discovery finished"
        );
        Ok(report)
    }

    /// Apply the exclusion rules to one page, returning work items to dispatch.
    async fn select(
        &self,
        job: &BulkJob,
        summaries: Vec<MessageSummary>,
    ) -> Result<Vec<WorkItem>, DiscoveryError> {
        let mut candidates = Vec::with_capacity(summaries.len());
        for summary in summaries {
            let Some(message_id) = summary.id.as_deref().and_then(|id| MessageId::parse(id).ok())
            else {
                debug!("skipping entry without a message id");
                continue;
            };
            if let Some(from) = summary.from.as_deref() {
                if self.settings.ignore.is_ignored(from) {
                    debug!(message_id = %message_id, "skipping ignored sender");
                    continue;
                }
            }
            // a message without a thread is its own thread
            let Some(thread_id) = summary
                .thread_id
                .as_deref()
                .and_then(|t| ThreadId::parse(t).ok())
                .or_else(|| ThreadId::parse(message_id.as_str()).ok())
            else {
                continue;
            };
            candidates.push(WorkItem::for_job(job, message_id, thread_id));
        }

        if job.force_reprocess || candidates.is_empty() {
            return Ok(candidates);
        }

        let threads: Vec<ThreadId> = candidates.iter().map(|c| c.thread_id.clone()).collect();
        let handled = self.rules.handled_threads(job.mailbox_id, &threads).await?;
        if !handled.is_empty() {
            candidates.retain(|c| !handled.contains(&c.thread_id));
        }
        Ok(candidates)
    }

    fn options_for(&self, item: &WorkItem) -> EnqueueOptions {
        EnqueueOptions::new()
            .idempotency_key(item.idempotency_key())
            .concurrency_limit(self.settings.concurrency_limit)
    }

    /// Batch first; if the batch call fails, retry item by item so one bad
    /// item cannot sink the page.
    async fn dispatch_page(&self, job_id: JobId, items: Vec<WorkItem>) -> PageDispatch {
        let mut out = PageDispatch::default();
        if items.is_empty() {
            return out;
        }

        let requests: Vec<DispatchRequest> = items
            .into_iter()
            .map(|item| {
                let options = self.options_for(&item);
                DispatchRequest::new(item, options)
            })
            .collect();

        let batch = self.dispatcher.enqueue_batch(&requests).await;
        match batch {
            Ok(batch) => {
                out.queued = requests.into_iter().map(|r| r.item.message_id).collect();
                self.ledger.record(job_id, batch.message_ids);
                return out;
            }
            Err(e) => {
                warn!(error = %e, items = requests.len(), "batch enqueue failed; enqueueing items one by one");
            }
        }

        for request in &requests {
            match self.dispatcher.enqueue(&request.item, &request.options).await {
                Ok(record) => {
                    out.queued.push(request.item.message_id.clone());
                    self.ledger.record(job_id, record.message_id);
                }
                Err(e) => {
                    warn!(message_id = %request.item.message_id, error = %e, "enqueue failed");
                    out.last_error = Some(format!("dispatch {}: {e}", request.item.message_id));
                    out.failed.push(request.item.message_id.clone());
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use sweep_core::{MailboxId, UserId};
    use sweep_dispatch::InMemoryDispatcher;
    use sweep_jobs::{NewJob, QueryWindow};

    use super::*;
    use crate::external::{InMemoryMailProvider, InMemoryRuleEngine, Message, MessagePage};
    use crate::jobs::InMemoryJobStore;

    struct Harness {
        store: Arc<InMemoryJobStore>,
        mail: Arc<InMemoryMailProvider>,
        rules: Arc<InMemoryRuleEngine>,
        dispatcher: Arc<InMemoryDispatcher>,
        ledger: Arc<DispatchLedger>,
        mailbox: MailboxId,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                store: InMemoryJobStore::arc(),
                mail: Arc::new(InMemoryMailProvider::new()),
                rules: Arc::new(InMemoryRuleEngine::new()),
                dispatcher: Arc::new(InMemoryDispatcher::new()),
                ledger: Arc::new(DispatchLedger::new()),
                mailbox: MailboxId::new(),
            }
        }

        fn discovery(&self, ignore: &[&str]) -> DiscoveryLoop {
            DiscoveryLoop::new(
                self.store.clone(),
                self.mail.clone(),
                self.rules.clone(),
                self.dispatcher.clone(),
                self.ledger.clone(),
                DiscoverySettings {
                    page_size: 10,
                    concurrency_limit: 3,
                    ignore: IgnoreList::new(ignore),
                },
            )
        }

        async fn running_job(&self, force: bool) -> BulkJob {
            let window = QueryWindow::new(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap());
            let job = self
                .store
                .create_job(NewJob::new(self.mailbox, UserId::new(), window).force_reprocess(force))
                .await
                .unwrap();
            self.store.mark_running(job.id).await.unwrap()
        }

        async fn job(&self, id: JobId) -> BulkJob {
            self.store.get(id).await.unwrap().unwrap()
        }
    }

    fn message(n: usize, from: &str) -> Message {
        Message {
            id: MessageId::parse(format!("m{n}")).unwrap(),
            thread_id: ThreadId::parse(format!("t{n}")).unwrap(),
            from: from.to_string(),
            to: vec![],
            subject: format!("subject {n}"),
            body: String::new(),
            received_at: None,
        }
    }

    fn summary(id: Option<&str>, thread: Option<&str>, from: &str) -> MessageSummary {
        MessageSummary {
            id: id.map(str::to_string),
            thread_id: thread.map(str::to_string),
            from: Some(from.to_string()),
        }
    }

    #[tokio::test]
    async fn dispatches_every_page_and_checkpoints() {
        let h = Harness::new();
        h.mail
            .add_messages(h.mailbox, (0..25).map(|n| message(n, "news@shop.example")));
        let job = h.running_job(false).await;

        let report = h.discovery(&[]).run(job.id).await.unwrap();
        assert_eq!(report.pages, 3);
        assert_eq!(report.kept, 25);
        assert_eq!(report.queued, 25);
        assert!(!report.completed);

        let job = h.job(job.id).await;
        assert_eq!(job.counters.total_emails, 25);
        assert_eq!(job.counters.emails_queued, 25);
        assert!(job.discovery.finished);
        assert_eq!(job.discovery.pages_fetched, 3);
        assert_eq!(job.discovery.page_token, None);

        let queued = h.dispatcher.take();
        assert_eq!(queued.len(), 25);
        assert_eq!(
            queued[0].options.idempotency_key.as_deref(),
            Some(format!("{}:m0", job.id).as_str())
        );
        assert_eq!(queued[0].options.concurrency_limit, Some(3));
        assert_eq!(h.dispatcher.batch_calls(), 3);
        assert_eq!(h.ledger.len(job.id), 25);
    }

    #[tokio::test]
    async fn filters_missing_ids_ignored_senders_and_handled_threads() {
        let h = Harness::new();
        h.mail.script_pages(
            h.mailbox,
            vec![MessagePage {
                items: vec![
                    summary(Some("m1"), Some("t1"), "a@ok.example"),
                    summary(None, Some("t2"), "a@ok.example"),
                    summary(Some("m3"), Some("t3"), "Promo <deals@spam.example>"),
                    summary(Some("m4"), Some("t4"), "boss@ok.example"),
                    summary(Some("m5"), None, "a@ok.example"),
                ],
                next_page_token: None,
            }],
        );
        h.rules.mark_handled(
            h.mailbox,
            ThreadId::parse("t4").unwrap(),
            MessageId::parse("m-old").unwrap(),
        );
        let job = h.running_job(false).await;

        let report = h.discovery(&["@spam.example"]).run(job.id).await.unwrap();
        assert_eq!(report.kept, 2);
        assert_eq!(report.skipped, 3);

        let queued = h.dispatcher.take();
        let ids: Vec<_> = queued.iter().map(|r| r.item.message_id.as_str()).collect();
        assert_eq!(ids, vec!["m1", "m5"]);
        // missing thread id falls back to the message id
        assert_eq!(queued[1].item.thread_id.as_str(), "m5");
    }

    #[tokio::test]
    async fn force_reprocess_keeps_handled_threads() {
        let h = Harness::new();
        h.mail.add_messages(h.mailbox, (0..3).map(|n| message(n, "a@ok.example")));
        h.rules.mark_handled(
            h.mailbox,
            ThreadId::parse("t1").unwrap(),
            MessageId::parse("m1").unwrap(),
        );
        let job = h.running_job(true).await;

        let report = h.discovery(&[]).run(job.id).await.unwrap();
        assert_eq!(report.kept, 3);
        assert!(h.dispatcher.take().iter().all(|r| r.item.force_reprocess));
    }

    #[tokio::test]
    async fn empty_page_with_token_is_an_anomaly() {
        let h = Harness::new();
        h.mail.script_pages(
            h.mailbox,
            vec![
                MessagePage {
                    items: vec![summary(Some("m1"), Some("t1"), "a@ok.example")],
                    next_page_token: Some("page-1".into()),
                },
                MessagePage {
                    items: vec![],
                    next_page_token: Some("page-2".into()),
                },
            ],
        );
        let job = h.running_job(false).await;

        let err = h.discovery(&[]).run(job.id).await.unwrap_err();
        assert_eq!(err, DiscoveryError::EmptyPageWithToken { pages_fetched: 1 });

        let job = h.job(job.id).await;
        assert_eq!(job.status, JobStatus::Running);
        assert!(!job.discovery.finished);
        assert_eq!(job.discovery.page_token.as_deref(), Some("page-1"));
        assert_eq!(job.counters.total_emails, 1);
    }

    #[tokio::test]
    async fn empty_mailbox_completes_immediately() {
        let h = Harness::new();
        let job = h.running_job(false).await;

        let report = h.discovery(&[]).run(job.id).await.unwrap();
        assert_eq!(report.pages, 1);
        assert!(report.completed);
        assert_eq!(h.job(job.id).await.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn cancelled_job_is_not_discovered() {
        let h = Harness::new();
        h.mail.add_messages(h.mailbox, (0..5).map(|n| message(n, "a@ok.example")));
        let job = h.running_job(false).await;
        h.store.mark_cancelled(job.id).await.unwrap();

        let report = h.discovery(&[]).run(job.id).await.unwrap();
        assert!(report.cancelled);
        assert_eq!(h.mail.list_calls(), 0);
        assert_eq!(h.dispatcher.queued_len(), 0);
        assert_eq!(h.job(job.id).await.counters.total_emails, 0);
    }

    #[tokio::test]
    async fn resumes_from_checkpoint_after_failure() {
        let h = Harness::new();
        h.mail.add_messages(h.mailbox, (0..25).map(|n| message(n, "a@ok.example")));
        let job = h.running_job(false).await;
        h.store
            .save_checkpoint(job.id, Some("offset-20".into()))
            .await
            .unwrap();

        let report = h.discovery(&[]).run(job.id).await.unwrap();
        assert_eq!(report.pages, 1);
        assert_eq!(report.kept, 5);
        assert_eq!(h.job(job.id).await.counters.total_emails, 5);
    }

    #[tokio::test]
    async fn failed_batch_falls_back_to_single_enqueues() {
        let h = Harness::new();
        h.mail.add_messages(h.mailbox, (0..4).map(|n| message(n, "a@ok.example")));
        h.dispatcher.fail_batches(true);
        h.dispatcher.fail_on(MessageId::parse("m2").unwrap());
        let job = h.running_job(false).await;

        let report = h.discovery(&[]).run(job.id).await.unwrap();
        assert_eq!(report.queued, 3);
        assert_eq!(report.dispatch_failures, 1);

        let job = h.job(job.id).await;
        assert_eq!(job.counters.total_emails, 4);
        assert_eq!(job.counters.emails_queued, 3);
        assert_eq!(job.counters.failed_emails, 1);
        assert!(job.last_error.unwrap().contains("m2"));
        assert_eq!(h.ledger.len(job.id), 3);
    }
}
