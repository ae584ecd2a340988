use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use sweep_core::{MailboxId, MessageId, ThreadId};
use sweep_jobs::QueryWindow;

/// One page request against a mailbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageQuery {
    pub window: QueryWindow,
    pub page_size: u32,
}

/// List entry as returned by the provider. Ids are raw because providers do
/// return entries without them (drafts, partially synced items).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageSummary {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub from: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePage {
    #[serde(default)]
    pub items: Vec<MessageSummary>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

/// A fully fetched message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub thread_id: ThreadId,
    pub from: String,
    #[serde(default)]
    pub to: Vec<String>,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub received_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MailError {
    #[error("message not found: {0}")]
    NotFound(MessageId),
    #[error("mail provider rate limited the request")]
    RateLimited,
    #[error("mail provider unavailable: {0}")]
    Unavailable(String),
    #[error("unexpected mail provider response: {0}")]
    Decode(String),
}

/// Mail-provider seam.
#[async_trait]
pub trait MailProvider: Send + Sync {
    /// One page of messages matching `query`, starting at `page_token`.
    async fn list_messages(
        &self,
        mailbox_id: MailboxId,
        query: &MessageQuery,
        page_token: Option<&str>,
    ) -> Result<MessagePage, MailError>;

    async fn get_message(
        &self,
        mailbox_id: MailboxId,
        message_id: &MessageId,
    ) -> Result<Message, MailError>;
}

#[async_trait]
impl<P> MailProvider for Arc<P>
where
    P: MailProvider + ?Sized,
{
    async fn list_messages(
        &self,
        mailbox_id: MailboxId,
        query: &MessageQuery,
        page_token: Option<&str>,
    ) -> Result<MessagePage, MailError> {
        (**self).list_messages(mailbox_id, query, page_token).await
    }

    async fn get_message(
        &self,
        mailbox_id: MailboxId,
        message_id: &MessageId,
    ) -> Result<Message, MailError> {
        (**self).get_message(mailbox_id, message_id).await
    }
}
