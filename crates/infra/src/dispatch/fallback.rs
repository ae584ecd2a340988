//! Direct-HTTP fallback backend.
//!
//! Each item becomes a background `POST` of the work item to the worker
//! endpoint, authenticated with the shared secret. Nothing is durable: send
//! errors are logged and dropped, and there is nothing to cancel.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use tracing::{debug, warn};

use sweep_auth::SHARED_SECRET_HEADER;
use sweep_dispatch::{
    BackendKind, BatchRecord, DispatchError, DispatchRecord, DispatchRequest, Dispatcher,
    EnqueueOptions, FallbackConfig,
};
use sweep_jobs::WorkItem;

const KIND: BackendKind = BackendKind::Fallback;

pub struct FallbackDispatcher {
    client: Client,
    config: FallbackConfig,
    worker_url: String,
}

impl FallbackDispatcher {
    pub fn new(client: Client, config: FallbackConfig, worker_url: impl Into<String>) -> Self {
        Self {
            client,
            config,
            worker_url: worker_url.into(),
        }
    }

    fn spawn_send(&self, item: WorkItem, delay: Option<Duration>) {
        let mut request = self.client.post(&self.worker_url).json(&item);
        if let Some(secret) = &self.config.shared_secret {
            request = request.header(SHARED_SECRET_HEADER, secret);
        }

        tokio::spawn(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    debug!(job_id = %item.job_id, message_id = %item.message_id, "worker accepted");
                }
                Ok(response) => {
                    warn!(
                        job_id = %item.job_id,
                        message_id = %item.message_id,
                        status = %response.status(),
                        "worker rejected fallback delivery"
                    );
                }
                Err(e) => {
                    warn!(
                        job_id = %item.job_id,
                        message_id = %item.message_id,
                        error = %e,
                        "fallback delivery failed"
                    );
                }
            }
        });
    }
}

#[async_trait]
impl Dispatcher for FallbackDispatcher {
    fn backend(&self) -> BackendKind {
        KIND
    }

    async fn enqueue(
        &self,
        item: &WorkItem,
        options: &EnqueueOptions,
    ) -> Result<DispatchRecord, DispatchError> {
        self.spawn_send(item.clone(), options.delay_from(Utc::now()));
        Ok(DispatchRecord {
            backend: KIND,
            message_id: None,
        })
    }

    /// Sequential sends with `send_delay` between them.
    async fn enqueue_batch(&self, requests: &[DispatchRequest]) -> Result<BatchRecord, DispatchError> {
        for (i, request) in requests.iter().enumerate() {
            if i > 0 && !self.config.send_delay.is_zero() {
                tokio::time::sleep(self.config.send_delay).await;
            }
            self.enqueue(&request.item, &request.options).await?;
        }
        Ok(BatchRecord {
            backend: KIND,
            count: requests.len(),
            message_ids: Vec::new(),
        })
    }

    async fn cancel(&self, _message_id: &str) -> bool {
        false
    }

    fn page_delay(&self) -> Option<Duration> {
        Some(self.config.page_delay).filter(|d| !d.is_zero())
    }
}
