//! The dispatch contract.
//!
//! A [`Dispatcher`] moves work items to the worker endpoint through some
//! asynchronous substrate. Delivery is **at-least-once**: an item may reach
//! the worker more than once, late, or out of order. The worker re-checks
//! idempotence itself, so nothing here tries to be exactly-once.
//!
//! ## Error semantics
//!
//! - Durable backends (event platform, queue service) return
//!   [`DispatchError`] when the substrate refuses or cannot be reached. The
//!   discovery loop logs the failure and moves on to the next item.
//! - The fallback backend is fire-and-forget. Its send failures are logged
//!   and never returned.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use sweep_jobs::WorkItem;

use crate::config::BackendKind;

/// Per-item enqueue options. Every backend accepts every option; a backend
/// that cannot honour one natively degrades gracefully.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnqueueOptions {
    /// Do not make the item visible before this instant
    pub scheduled_for: Option<DateTime<Utc>>,
    /// De-duplication key for backends that support it
    pub idempotency_key: Option<String>,
    /// Named queue (queue service); ignored elsewhere
    pub queue_name: Option<String>,
    /// Max parallel deliveries sharing the same flow-control key
    pub concurrency_limit: Option<u32>,
}

impl EnqueueOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scheduled_for(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_for = Some(at);
        self
    }

    pub fn idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn queue_name(mut self, name: impl Into<String>) -> Self {
        self.queue_name = Some(name.into());
        self
    }

    pub fn concurrency_limit(mut self, limit: u32) -> Self {
        self.concurrency_limit = Some(limit);
        self
    }

    /// Time left until `scheduled_for`, if it is in the future.
    pub fn delay_from(&self, now: DateTime<Utc>) -> Option<Duration> {
        let at = self.scheduled_for?;
        (at - now).to_std().ok().filter(|d| !d.is_zero())
    }
}

/// One entry of a batch enqueue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchRequest {
    pub item: WorkItem,
    pub options: EnqueueOptions,
}

impl DispatchRequest {
    pub fn new(item: WorkItem, options: EnqueueOptions) -> Self {
        Self { item, options }
    }
}

/// Which backend took an item, and its receipt id if it issued one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchRecord {
    pub backend: BackendKind,
    pub message_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRecord {
    pub backend: BackendKind,
    pub count: usize,
    /// Receipt ids, when the backend issues them (queue service only)
    #[serde(default)]
    pub message_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    /// The backend could not be reached.
    #[error("{backend} transport error: {message}")]
    Transport {
        backend: BackendKind,
        message: String,
    },
    /// The backend answered with a non-success status.
    #[error("{backend} rejected request ({status}): {body}")]
    Rejected {
        backend: BackendKind,
        status: u16,
        body: String,
    },
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl DispatchError {
    pub fn transport(backend: BackendKind, message: impl Into<String>) -> Self {
        Self::Transport {
            backend,
            message: message.into(),
        }
    }
}

/// Uniform enqueue / batch / cancel contract over all backends.
///
/// Implementations must be `Send + Sync`; one instance is shared by every
/// discovery run and the orchestrator.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Backend that would carry an item enqueued right now.
    fn backend(&self) -> BackendKind;

    async fn enqueue(
        &self,
        item: &WorkItem,
        options: &EnqueueOptions,
    ) -> Result<DispatchRecord, DispatchError>;

    /// Enqueue many items at once. Must not be worse than calling
    /// [`Dispatcher::enqueue`] once per item.
    async fn enqueue_batch(&self, requests: &[DispatchRequest]) -> Result<BatchRecord, DispatchError>;

    /// Best-effort withdrawal of a previously enqueued item. Only the queue
    /// service can answer `true`.
    async fn cancel(&self, message_id: &str) -> bool;

    /// Pause the discovery loop should take between pages.
    fn page_delay(&self) -> Option<Duration> {
        None
    }
}

#[async_trait]
impl<D> Dispatcher for Arc<D>
where
    D: Dispatcher + ?Sized,
{
    fn backend(&self) -> BackendKind {
        (**self).backend()
    }

    async fn enqueue(
        &self,
        item: &WorkItem,
        options: &EnqueueOptions,
    ) -> Result<DispatchRecord, DispatchError> {
        (**self).enqueue(item, options).await
    }

    async fn enqueue_batch(&self, requests: &[DispatchRequest]) -> Result<BatchRecord, DispatchError> {
        (**self).enqueue_batch(requests).await
    }

    async fn cancel(&self, message_id: &str) -> bool {
        (**self).cancel(message_id).await
    }

    fn page_delay(&self) -> Option<Duration> {
        (**self).page_delay()
    }
}
