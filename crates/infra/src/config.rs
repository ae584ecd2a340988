//! Configuration loading and representation.
//!
//! Read once from the environment at startup, then handed to components by
//! value. Nothing below `main` looks at process state.

use std::time::Duration;

use sweep_auth::SigningKeys;
use sweep_dispatch::{DispatchConfig, EventPlatformConfig, FallbackConfig, QueueServiceConfig};
use sweep_jobs::RetryPolicy;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

pub use sweep_observability::LogFormat;

#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveryConfig {
    /// Items requested per provider page
    pub page_size: u32,
    /// Parallelism requested per job on backends that bound it
    pub concurrency_limit: u32,
    /// Retries for a failed discovery run
    pub retry: RetryPolicy,
    /// Sender addresses (`a@b.c`) or domains (`@b.c`) never processed
    pub ignored_senders: Vec<String>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            page_size: 25,
            concurrency_limit: 3,
            retry: RetryPolicy::default(),
            ignored_senders: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerAuthConfig {
    pub signing: Option<SigningKeys>,
    pub shared_secret: Option<String>,
}

/// HTTP collaborator endpoints. Unset means the in-memory stand-ins are used.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollaboratorConfig {
    pub mail_gateway_url: Option<String>,
    pub rules_service_url: Option<String>,
    pub token: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub bind_addr: String,
    /// Base URL the dispatch backends use to reach this service
    pub public_url: String,
    pub jwt_secret: Option<String>,
    pub database_url: Option<String>,
    pub log_format: LogFormat,
    pub dispatch: DispatchConfig,
    pub discovery: DiscoveryConfig,
    pub worker_auth: WorkerAuthConfig,
    pub collaborators: CollaboratorConfig,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let public_url = get("SWEEP_PUBLIC_URL")
            .unwrap_or_else(|| "http://localhost:8080".to_string())
            .trim_end_matches('/')
            .to_string();

        let event_platform = match (get("EVENT_PLATFORM_URL"), get("EVENT_PLATFORM_KEY")) {
            (Some(base_url), Some(event_key)) => Some(EventPlatformConfig {
                base_url,
                event_key,
                event_name: get("EVENT_PLATFORM_EVENT")
                    .unwrap_or_else(|| "bulk/email.process".to_string()),
            }),
            _ => None,
        };

        let queue_service = match (get("QUEUE_SERVICE_URL"), get("QUEUE_SERVICE_TOKEN")) {
            (Some(base_url), Some(token)) => Some(QueueServiceConfig {
                base_url,
                token,
                default_parallelism: parse_or("QUEUE_CONCURRENCY", get("QUEUE_CONCURRENCY"), 3)?,
            }),
            _ => None,
        };

        let shared_secret = get("WORKER_SHARED_SECRET");
        let fallback = FallbackConfig {
            shared_secret: shared_secret.clone(),
            send_delay: Duration::from_millis(parse_or(
                "FALLBACK_SEND_DELAY_MS",
                get("FALLBACK_SEND_DELAY_MS"),
                100,
            )?),
            page_delay: Duration::from_millis(parse_or(
                "FALLBACK_PAGE_DELAY_MS",
                get("FALLBACK_PAGE_DELAY_MS"),
                1000,
            )?),
        };

        let dispatch = DispatchConfig {
            worker_url: format!("{public_url}/bulk/worker"),
            event_platform,
            queue_service,
            fallback,
        };

        let defaults = DiscoveryConfig::default();
        let max_attempts = parse_or(
            "DISCOVERY_MAX_ATTEMPTS",
            get("DISCOVERY_MAX_ATTEMPTS"),
            defaults.retry.max_attempts,
        )?;
        let page_size = parse_or("DISCOVERY_PAGE_SIZE", get("DISCOVERY_PAGE_SIZE"), defaults.page_size)?;
        if page_size == 0 {
            return Err(ConfigError::Invalid {
                key: "DISCOVERY_PAGE_SIZE",
                value: "0".into(),
                reason: "must be positive".into(),
            });
        }
        let discovery = DiscoveryConfig {
            page_size,
            concurrency_limit: dispatch
                .queue_service
                .as_ref()
                .map_or(defaults.concurrency_limit, |q| q.default_parallelism),
            retry: RetryPolicy {
                max_attempts: max_attempts.max(1),
                ..defaults.retry
            },
            ignored_senders: get("IGNORED_SENDERS")
                .map(|raw| {
                    raw.split(',')
                        .map(|s| s.trim().to_lowercase())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
        };

        let signing = get("QUEUE_SIGNING_KEY").map(|current| SigningKeys {
            current,
            next: get("QUEUE_NEXT_SIGNING_KEY"),
        });

        let log_format = match get("LOG_FORMAT").as_deref() {
            None | Some("json") => LogFormat::Json,
            Some("pretty") | Some("text") => LogFormat::Pretty,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    key: "LOG_FORMAT",
                    value: other.to_string(),
                    reason: "expected json or pretty".into(),
                });
            }
        };

        Ok(Self {
            bind_addr: get("SWEEP_BIND_ADDR").unwrap_or_else(|| "0.0.0.0:8080".to_string()),
            public_url,
            jwt_secret: get("JWT_SECRET"),
            database_url: get("DATABASE_URL"),
            log_format,
            dispatch,
            discovery,
            worker_auth: WorkerAuthConfig {
                signing,
                shared_secret,
            },
            collaborators: CollaboratorConfig {
                mail_gateway_url: get("MAIL_GATEWAY_URL"),
                rules_service_url: get("RULES_SERVICE_URL"),
                token: get("COLLABORATOR_TOKEN"),
            },
        })
    }
}

fn parse_or<T>(key: &'static str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: core::str::FromStr,
    T::Err: core::fmt::Display,
{
    match raw {
        None => Ok(default),
        Some(value) => value.parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            reason: e.to_string(),
            value,
        }),
    }
}
