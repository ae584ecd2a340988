//! Queue-service backend (QStash-compatible HTTP API).
//!
//! - `POST {base}/v2/publish/{worker_url}`, or `/v2/enqueue/{queue}/{worker_url}`
//!   for a named queue
//! - `POST {base}/v2/batch` for many items in one request
//! - `DELETE {base}/v2/messages/{id}` to withdraw a not-yet-delivered item
//!
//! Scheduling uses `Upstash-Not-Before`, de-duplication uses
//! `Upstash-Deduplication-Id` and per-job parallelism uses flow control keyed
//! by the job id.

use std::collections::BTreeMap;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use sweep_dispatch::{
    BackendKind, BatchRecord, DispatchError, DispatchRecord, DispatchRequest, Dispatcher,
    EnqueueOptions, QueueServiceConfig,
};
use sweep_jobs::WorkItem;

const KIND: BackendKind = BackendKind::QueueService;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PublishResponse {
    message_id: String,
}

#[derive(Debug, Serialize)]
struct BatchEntry {
    destination: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    queue: Option<String>,
    headers: BTreeMap<&'static str, String>,
    body: String,
}

pub struct QueueServiceDispatcher {
    client: Client,
    config: QueueServiceConfig,
    worker_url: String,
}

impl QueueServiceDispatcher {
    pub fn new(client: Client, config: QueueServiceConfig, worker_url: impl Into<String>) -> Self {
        Self {
            client,
            config,
            worker_url: worker_url.into(),
        }
    }

    fn base(&self) -> &str {
        self.config.base_url.trim_end_matches('/')
    }

    fn headers(&self, item: &WorkItem, options: &EnqueueOptions) -> BTreeMap<&'static str, String> {
        let mut headers = BTreeMap::new();
        headers.insert("Content-Type", "application/json".to_string());
        if let Some(at) = options.scheduled_for {
            headers.insert("Upstash-Not-Before", at.timestamp().to_string());
        }
        headers.insert(
            "Upstash-Deduplication-Id",
            options
                .idempotency_key
                .clone()
                .unwrap_or_else(|| item.idempotency_key()),
        );
        let parallelism = options
            .concurrency_limit
            .unwrap_or(self.config.default_parallelism);
        if parallelism > 0 {
            headers.insert("Upstash-Flow-Control-Key", item.job_id.to_string());
            headers.insert("Upstash-Flow-Control-Value", format!("parallelism={parallelism}"));
        }
        headers
    }

    fn destination(&self, options: &EnqueueOptions) -> String {
        match &options.queue_name {
            Some(queue) => format!("enqueue/{queue}/{}", self.worker_url),
            None => format!("publish/{}", self.worker_url),
        }
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, DispatchError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(DispatchError::Rejected {
            backend: KIND,
            status: status.as_u16(),
            body,
        })
    }
}

fn transport(e: reqwest::Error) -> DispatchError {
    DispatchError::transport(KIND, e.to_string())
}

fn decode(e: reqwest::Error) -> DispatchError {
    DispatchError::Serialization(e.to_string())
}

#[async_trait]
impl Dispatcher for QueueServiceDispatcher {
    fn backend(&self) -> BackendKind {
        KIND
    }

    #[instrument(skip(self, item, options), fields(job_id = %item.job_id, message_id = %item.message_id), err)]
    async fn enqueue(
        &self,
        item: &WorkItem,
        options: &EnqueueOptions,
    ) -> Result<DispatchRecord, DispatchError> {
        let url = format!("{}/v2/{}", self.base(), self.destination(options));
        let mut request = self
            .client
            .post(&url)
            .bearer_auth(&self.config.token)
            .json(item);
        for (name, value) in self.headers(item, options) {
            request = request.header(name, value);
        }
        let response = Self::check(request.send().await.map_err(transport)?).await?;
        let published: PublishResponse = response.json().await.map_err(decode)?;
        debug!(queue_message_id = %published.message_id, "published");
        Ok(DispatchRecord {
            backend: KIND,
            message_id: Some(published.message_id),
        })
    }

    #[instrument(skip(self, requests), fields(count = requests.len()), err)]
    async fn enqueue_batch(&self, requests: &[DispatchRequest]) -> Result<BatchRecord, DispatchError> {
        if requests.is_empty() {
            return Ok(BatchRecord {
                backend: KIND,
                count: 0,
                message_ids: Vec::new(),
            });
        }
        let entries = requests
            .iter()
            .map(|r| {
                let body = serde_json::to_string(&r.item)
                    .map_err(|e| DispatchError::Serialization(e.to_string()))?;
                Ok(BatchEntry {
                    destination: self.worker_url.clone(),
                    queue: r.options.queue_name.clone(),
                    headers: self.headers(&r.item, &r.options),
                    body,
                })
            })
            .collect::<Result<Vec<_>, DispatchError>>()?;

        let url = format!("{}/v2/batch", self.base());
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.token)
            .json(&entries)
            .send()
            .await
            .map_err(transport)?;
        let published: Vec<PublishResponse> = Self::check(response).await?.json().await.map_err(decode)?;
        Ok(BatchRecord {
            backend: KIND,
            count: requests.len(),
            message_ids: published.into_iter().map(|p| p.message_id).collect(),
        })
    }

    async fn cancel(&self, message_id: &str) -> bool {
        let url = format!("{}/v2/messages/{}", self.base(), message_id);
        match self
            .client
            .delete(&url)
            .bearer_auth(&self.config.token)
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => true,
            Ok(response) => {
                debug!(message_id, status = %response.status(), "queue refused cancel");
                false
            }
            Err(e) => {
                warn!(message_id, error = %e, "queue cancel failed");
                false
            }
        }
    }
}
