//! Event-platform backend.
//!
//! Items are sent as events to `POST {base}/e/{event_key}`. The body is
//! always a JSON array, so a batch costs one request. The event `id` is the
//! item's idempotency key and the platform drops repeats of it; `ts` delays
//! delivery until the scheduled instant.

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, instrument};

use sweep_dispatch::{
    BackendKind, BatchRecord, DispatchError, DispatchRecord, DispatchRequest, Dispatcher,
    EnqueueOptions, EventPlatformConfig,
};
use sweep_jobs::WorkItem;

const KIND: BackendKind = BackendKind::EventPlatform;

#[derive(Debug, Serialize)]
struct Event<'a> {
    name: &'a str,
    data: &'a WorkItem,
    id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    ts: Option<i64>,
}

pub struct EventPlatformDispatcher {
    client: Client,
    config: EventPlatformConfig,
}

impl EventPlatformDispatcher {
    pub fn new(client: Client, config: EventPlatformConfig) -> Self {
        Self { client, config }
    }

    fn event<'a>(&'a self, item: &'a WorkItem, options: &EnqueueOptions) -> Event<'a> {
        Event {
            name: &self.config.event_name,
            data: item,
            id: options
                .idempotency_key
                .clone()
                .unwrap_or_else(|| item.idempotency_key()),
            ts: options.scheduled_for.map(|at| at.timestamp_millis()),
        }
    }

    async fn send(&self, events: &[Event<'_>]) -> Result<(), DispatchError> {
        let url = format!(
            "{}/e/{}",
            self.config.base_url.trim_end_matches('/'),
            self.config.event_key
        );
        let response = self
            .client
            .post(&url)
            .json(events)
            .send()
            .await
            .map_err(|e| DispatchError::transport(KIND, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DispatchError::Rejected {
                backend: KIND,
                status: status.as_u16(),
                body,
            });
        }
        debug!(events = events.len(), "events accepted");
        Ok(())
    }
}

#[async_trait]
impl Dispatcher for EventPlatformDispatcher {
    fn backend(&self) -> BackendKind {
        KIND
    }

    #[instrument(skip(self, item, options), fields(job_id = %item.job_id, message_id = %item.message_id), err)]
    async fn enqueue(
        &self,
        item: &WorkItem,
        options: &EnqueueOptions,
    ) -> Result<DispatchRecord, DispatchError> {
        self.send(&[self.event(item, options)]).await?;
        Ok(DispatchRecord {
            backend: KIND,
            message_id: None,
        })
    }

    #[instrument(skip(self, requests), fields(count = requests.len()), err)]
    async fn enqueue_batch(&self, requests: &[DispatchRequest]) -> Result<BatchRecord, DispatchError> {
        let events: Vec<_> = requests
            .iter()
            .map(|r| self.event(&r.item, &r.options))
            .collect();
        if !events.is_empty() {
            self.send(&events).await?;
        }
        Ok(BatchRecord {
            backend: KIND,
            count: events.len(),
            message_ids: Vec::new(),
        })
    }

    /// Scheduled events cannot be withdrawn by id.
    async fn cancel(&self, _message_id: &str) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    use super::*;
    use crate::dispatch::test_support::{CaptureServer, work_item};

    fn dispatcher(base_url: String) -> EventPlatformDispatcher {
        EventPlatformDispatcher::new(
            Client::new(),
            EventPlatformConfig {
                base_url,
                event_key: "ingest-key".into(),
                event_name: "bulk/email.process".into(),
            },
        )
    }

    #[tokio::test]
    async fn enqueue_posts_a_single_event() {
        let server = CaptureServer::start(200, json!({"status": 200})).await;
        let item = work_item("m-1");
        let at = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();

        let record = dispatcher(server.url())
            .enqueue(&item, &EnqueueOptions::new().scheduled_for(at))
            .await
            .unwrap();
        assert_eq!(record.backend, BackendKind::EventPlatform);
        assert_eq!(record.message_id, None);

        let requests = server.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].path, "/e/ingest-key");
        let body = &requests[0].body;
        assert_eq!(body[0]["name"], "bulk/email.process");
        assert_eq!(body[0]["data"]["message_id"], "m-1");
        assert_eq!(body[0]["id"], item.idempotency_key());
        assert_eq!(body[0]["ts"], at.timestamp_millis());
    }

    #[tokio::test]
    async fn batch_is_one_request() {
        let server = CaptureServer::start(200, json!({"status": 200})).await;
        let requests: Vec<_> = ["a", "b", "c"]
            .into_iter()
            .map(|id| DispatchRequest::new(work_item(id), EnqueueOptions::new()))
            .collect();

        let record = dispatcher(server.url()).enqueue_batch(&requests).await.unwrap();
        assert_eq!(record.count, 3);
        let captured = server.requests();
        assert_eq!(captured.len(), 1);
        assert_eq!(captured[0].body.as_array().map(Vec::len), Some(3));
    }

    #[tokio::test]
    async fn rejection_surfaces_status_and_body() {
        let server = CaptureServer::start(401, json!({"error": "bad key"})).await;
        let err = dispatcher(server.url())
            .enqueue(&work_item("m"), &EnqueueOptions::new())
            .await
            .unwrap_err();
        match err {
            DispatchError::Rejected { status, body, .. } => {
                assert_eq!(status, 401);
                assert!(body.contains("bad key"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancel_is_unsupported() {
        assert!(!dispatcher("http://127.0.0.1:9".into()).cancel("anything").await);
    }
}
