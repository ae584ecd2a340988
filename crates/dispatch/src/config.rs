//! Backend configuration and selection.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// The three interchangeable execution substrates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Durable event/function platform (native retries, scheduling, batching)
    EventPlatform,
    /// HTTP message queue (server-side delay, per-key concurrency)
    QueueService,
    /// Direct best-effort HTTP POST to the worker endpoint
    Fallback,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::EventPlatform => "event_platform",
            BackendKind::QueueService => "queue_service",
            BackendKind::Fallback => "fallback",
        }
    }
}

impl core::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventPlatformConfig {
    /// Base URL of the event ingest API
    pub base_url: String,
    /// Ingest key appended to the event path
    pub event_key: String,
    /// Event name the worker function is subscribed to
    pub event_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueServiceConfig {
    pub base_url: String,
    pub token: String,
    /// Parallelism applied per flow-control key when the caller does not
    /// pass one.
    pub default_parallelism: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackConfig {
    /// Shared secret sent in the worker auth header
    pub shared_secret: Option<String>,
    /// Pause between sequential sends in a batch
    pub send_delay: Duration,
    /// Pause discovery inserts between pages on this backend
    pub page_delay: Duration,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            shared_secret: None,
            send_delay: Duration::from_millis(100),
            page_delay: Duration::from_secs(1),
        }
    }
}

/// Everything the dispatch layer needs, passed in explicitly at construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Absolute URL of the worker invocation endpoint
    pub worker_url: String,
    pub event_platform: Option<EventPlatformConfig>,
    pub queue_service: Option<QueueServiceConfig>,
    pub fallback: FallbackConfig,
}

impl DispatchConfig {
    pub fn fallback_only(worker_url: impl Into<String>) -> Self {
        Self {
            worker_url: worker_url.into(),
            event_platform: None,
            queue_service: None,
            fallback: FallbackConfig::default(),
        }
    }

    pub fn with_event_platform(mut self, config: EventPlatformConfig) -> Self {
        self.event_platform = Some(config);
        self
    }

    pub fn with_queue_service(mut self, config: QueueServiceConfig) -> Self {
        self.queue_service = Some(config);
        self
    }

    pub fn with_fallback(mut self, config: FallbackConfig) -> Self {
        self.fallback = config;
        self
    }
}

/// Pick the backend for a call.
///
/// Precedence is fixed: event platform, then queue service, then fallback.
/// A section only counts when its URL and credential are both non-blank.
pub fn select_backend(config: &DispatchConfig) -> BackendKind {
    let usable = |url: &str, secret: &str| !url.trim().is_empty() && !secret.trim().is_empty();

    if let Some(ep) = &config.event_platform {
        if usable(&ep.base_url, &ep.event_key) {
            return BackendKind::EventPlatform;
        }
    }
    if let Some(qs) = &config.queue_service {
        if usable(&qs.base_url, &qs.token) {
            return BackendKind::QueueService;
        }
    }
    BackendKind::Fallback
}
