//! HTTP dispatch backends and the call-time selector over them.

mod event_platform;
mod fallback;
mod queue_service;
#[cfg(test)]
pub(crate) mod test_support;

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

use sweep_dispatch::{
    BackendKind, BatchRecord, DispatchConfig, DispatchError, DispatchRecord, DispatchRequest,
    Dispatcher, EnqueueOptions, select_backend,
};
use sweep_jobs::WorkItem;

pub use event_platform::EventPlatformDispatcher;
pub use fallback::FallbackDispatcher;
pub use queue_service::QueueServiceDispatcher;

/// Routes every call to the backend [`select_backend`] picks for the
/// configuration it was built with. Selection happens per call.
pub struct BackendDispatcher {
    config: DispatchConfig,
    event_platform: Option<EventPlatformDispatcher>,
    queue_service: Option<QueueServiceDispatcher>,
    fallback: FallbackDispatcher,
}

impl BackendDispatcher {
    pub fn new(config: DispatchConfig) -> Self {
        Self::with_client(Client::new(), config)
    }

    pub fn with_client(client: Client, config: DispatchConfig) -> Self {
        let event_platform = config
            .event_platform
            .clone()
            .map(|c| EventPlatformDispatcher::new(client.clone(), c));
        let queue_service = config
            .queue_service
            .clone()
            .map(|c| QueueServiceDispatcher::new(client.clone(), c, config.worker_url.clone()));
        let fallback =
            FallbackDispatcher::new(client, config.fallback.clone(), config.worker_url.clone());
        Self {
            config,
            event_platform,
            queue_service,
            fallback,
        }
    }

    fn active(&self) -> &dyn Dispatcher {
        let kind = select_backend(&self.config);
        match kind {
            BackendKind::EventPlatform => {
                if let Some(ep) = &self.event_platform {
                    return ep;
                }
            }
            BackendKind::QueueService => {
                if let Some(qs) = &self.queue_service {
                    return qs;
                }
            }
            BackendKind::Fallback => {}
        }
        &self.fallback
    }
}

#[async_trait]
impl Dispatcher for BackendDispatcher {
    fn backend(&self) -> BackendKind {
        self.active().backend()
    }

    async fn enqueue(
        &self,
        item: &WorkItem,
        options: &EnqueueOptions,
    ) -> Result<DispatchRecord, DispatchError> {
        self.active().enqueue(item, options).await
    }

    async fn enqueue_batch(&self, requests: &[DispatchRequest]) -> Result<BatchRecord, DispatchError> {
        self.active().enqueue_batch(requests).await
    }

    /// Receipt ids are only issued by the queue service, so cancels go there
    /// whenever it is configured.
    async fn cancel(&self, message_id: &str) -> bool {
        match &self.queue_service {
            Some(qs) => qs.cancel(message_id).await,
            None => {
                debug!(message_id, "no queue service configured; nothing to cancel");
                false
            }
        }
    }

    fn page_delay(&self) -> Option<Duration> {
        self.active().page_delay()
    }
}
