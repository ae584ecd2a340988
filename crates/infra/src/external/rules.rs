use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use sweep_core::{MailboxId, MessageId, ThreadId};

use super::mail::Message;

/// Result of evaluating a mailbox's rules against one message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RuleOutcome {
    /// The account has no active rules
    NoRulesConfigured,
    /// Rules ran and none matched
    NoMatch,
    Applied {
        #[serde(default)]
        rule: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuleError {
    #[error("rule engine unavailable: {0}")]
    Unavailable(String),
    #[error("rule evaluation failed: {0}")]
    Evaluation(String),
    #[error("unexpected rule engine response: {0}")]
    Decode(String),
}

/// Rule-engine seam. The engine owns its execution records; they are the
/// idempotence markers this service reads.
#[async_trait]
pub trait RuleEngine: Send + Sync {
    /// Threads among `threads` that already have an applied or in-progress
    /// execution record.
    async fn handled_threads(
        &self,
        mailbox_id: MailboxId,
        threads: &[ThreadId],
    ) -> Result<HashSet<ThreadId>, RuleError>;

    /// Whether a terminal execution record exists for this exact message.
    async fn is_handled(
        &self,
        mailbox_id: MailboxId,
        thread_id: &ThreadId,
        message_id: &MessageId,
    ) -> Result<bool, RuleError>;

    async fn evaluate(&self, mailbox_id: MailboxId, message: &Message) -> Result<RuleOutcome, RuleError>;
}

#[async_trait]
impl<R> RuleEngine for Arc<R>
where
    R: RuleEngine + ?Sized,
{
    async fn handled_threads(
        &self,
        mailbox_id: MailboxId,
        threads: &[ThreadId],
    ) -> Result<HashSet<ThreadId>, RuleError> {
        (**self).handled_threads(mailbox_id, threads).await
    }

    async fn is_handled(
        &self,
        mailbox_id: MailboxId,
        thread_id: &ThreadId,
        message_id: &MessageId,
    ) -> Result<bool, RuleError> {
        (**self).is_handled(mailbox_id, thread_id, message_id).await
    }

    async fn evaluate(&self, mailbox_id: MailboxId, message: &Message) -> Result<RuleOutcome, RuleError> {
        (**self).evaluate(mailbox_id, message).await
    }
}
