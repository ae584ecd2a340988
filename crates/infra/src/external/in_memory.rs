//! Scripted collaborators for tests/dev.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;

use sweep_core::{MailboxId, MessageId, ThreadId};

use super::mail::{MailError, MailProvider, Message, MessagePage, MessageQuery, MessageSummary};
use super::rules::{RuleEngine, RuleError, RuleOutcome};

#[derive(Debug, Default)]
struct MailState {
    messages: HashMap<MailboxId, Vec<Message>>,
    /// Verbatim pages, served in order instead of paginating `messages`
    pages: HashMap<MailboxId, Vec<MessagePage>>,
    failing_gets: HashSet<MessageId>,
    failing_lists: u32,
    list_calls: u32,
}

/// Mailbox backed by a vector of messages.
///
/// Continuation tokens are `offset-<n>` when paginating messages and
/// `page-<n>` when serving scripted pages.
#[derive(Debug, Default)]
pub struct InMemoryMailProvider {
    state: Mutex<MailState>,
}

impl InMemoryMailProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_messages(&self, mailbox_id: MailboxId, messages: impl IntoIterator<Item = Message>) {
        if let Ok(mut s) = self.state.lock() {
            s.messages.entry(mailbox_id).or_default().extend(messages);
        }
    }

    /// Serve these pages verbatim (ignores the requested page size).
    pub fn script_pages(&self, mailbox_id: MailboxId, pages: Vec<MessagePage>) {
        if let Ok(mut s) = self.state.lock() {
            s.pages.insert(mailbox_id, pages);
        }
    }

    pub fn fail_get(&self, message_id: MessageId) {
        if let Ok(mut s) = self.state.lock() {
            s.failing_gets.insert(message_id);
        }
    }

    /// The next `n` list calls fail with `Unavailable`.
    pub fn fail_next_lists(&self, n: u32) {
        if let Ok(mut s) = self.state.lock() {
            s.failing_lists = n;
        }
    }

    pub fn list_calls(&self) -> u32 {
        self.state.lock().map(|s| s.list_calls).unwrap_or(0)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MailState>, MailError> {
        self.state
            .lock()
            .map_err(|_| MailError::Unavailable("in-memory mailbox poisoned".into()))
    }
}

fn parse_token(token: Option<&str>, prefix: &str) -> Result<usize, MailError> {
    match token {
        None => Ok(0),
        Some(t) => t
            .strip_prefix(prefix)
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| MailError::Decode(format!("unknown page token {t}"))),
    }
}

#[async_trait]
impl MailProvider for InMemoryMailProvider {
    async fn list_messages(
        &self,
        mailbox_id: MailboxId,
        query: &MessageQuery,
        page_token: Option<&str>,
    ) -> Result<MessagePage, MailError> {
        let mut s = self.lock()?;
        s.list_calls += 1;
        if s.failing_lists > 0 {
            s.failing_lists -= 1;
            return Err(MailError::Unavailable("scripted outage".into()));
        }

        if let Some(pages) = s.pages.get(&mailbox_id) {
            let index = parse_token(page_token, "page-")?;
            return Ok(pages.get(index).cloned().unwrap_or_default());
        }

        let messages = s.messages.get(&mailbox_id).map(Vec::as_slice).unwrap_or(&[]);
        let offset = parse_token(page_token, "offset-")?;
        let end = (offset + query.page_size as usize).min(messages.len());
        let items = messages
            .get(offset..end)
            .unwrap_or(&[])
            .iter()
            .map(|m| MessageSummary {
                id: Some(m.id.to_string()),
                thread_id: Some(m.thread_id.to_string()),
                from: Some(m.from.clone()),
            })
            .collect();
        let next_page_token = (end < messages.len()).then(|| format!("offset-{end}"));
        Ok(MessagePage {
            items,
            next_page_token,
        })
    }

    async fn get_message(
        &self,
        mailbox_id: MailboxId,
        message_id: &MessageId,
    ) -> Result<Message, MailError> {
        let s = self.lock()?;
        if s.failing_gets.contains(message_id) {
            return Err(MailError::Unavailable(format!("cannot fetch {message_id}")));
        }
        s.messages
            .get(&mailbox_id)
            .and_then(|ms| ms.iter().find(|m| &m.id == message_id))
            .cloned()
            .ok_or_else(|| MailError::NotFound(message_id.clone()))
    }
}

#[derive(Debug, Default)]
struct RuleState {
    without_rules: HashSet<MailboxId>,
    applied_threads: HashSet<(MailboxId, ThreadId)>,
    handled: HashSet<(MailboxId, ThreadId, MessageId)>,
    failing: HashSet<MessageId>,
    evaluations: Vec<MessageId>,
}

/// Rule engine that "applies" a rule to every message it evaluates and
/// records the execution, so later lookups see it as handled.
#[derive(Debug, Default)]
pub struct InMemoryRuleEngine {
    state: Mutex<RuleState>,
}

impl InMemoryRuleEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn without_rules(&self, mailbox_id: MailboxId) {
        if let Ok(mut s) = self.state.lock() {
            s.without_rules.insert(mailbox_id);
        }
    }

    /// Pre-existing execution record for a message (and its thread).
    pub fn mark_handled(&self, mailbox_id: MailboxId, thread_id: ThreadId, message_id: MessageId) {
        if let Ok(mut s) = self.state.lock() {
            s.applied_threads.insert((mailbox_id, thread_id.clone()));
            s.handled.insert((mailbox_id, thread_id, message_id));
        }
    }

    pub fn fail_on(&self, message_id: MessageId) {
        if let Ok(mut s) = self.state.lock() {
            s.failing.insert(message_id);
        }
    }

    pub fn evaluations(&self) -> Vec<MessageId> {
        self.state.lock().map(|s| s.evaluations.clone()).unwrap_or_default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, RuleState>, RuleError> {
        self.state
            .lock()
            .map_err(|_| RuleError::Unavailable("in-memory rule engine poisoned".into()))
    }
}

#[async_trait]
impl RuleEngine for InMemoryRuleEngine {
    async fn handled_threads(
        &self,
        mailbox_id: MailboxId,
        threads: &[ThreadId],
    ) -> Result<HashSet<ThreadId>, RuleError> {
        let s = self.lock()?;
        Ok(threads
            .iter()
            .filter(|t| s.applied_threads.contains(&(mailbox_id, (*t).clone())))
            .cloned()
            .collect())
    }

    async fn is_handled(
        &self,
        mailbox_id: MailboxId,
        thread_id: &ThreadId,
        message_id: &MessageId,
    ) -> Result<bool, RuleError> {
        let s = self.lock()?;
        Ok(s.handled
            .contains(&(mailbox_id, thread_id.clone(), message_id.clone())))
    }

    async fn evaluate(&self, mailbox_id: MailboxId, message: &Message) -> Result<RuleOutcome, RuleError> {
        let mut s = self.lock()?;
        if s.failing.contains(&message.id) {
            return Err(RuleError::Evaluation(format!("model refused {}", message.id)));
        }
        if s.without_rules.contains(&mailbox_id) {
            return Ok(RuleOutcome::NoRulesConfigured);
        }
        s.evaluations.push(message.id.clone());
        s.applied_threads.insert((mailbox_id, message.thread_id.clone()));
        s.handled
            .insert((mailbox_id, message.thread_id.clone(), message.id.clone()));
        Ok(RuleOutcome::Applied {
            rule: Some("archive-newsletters".to_string()),
        })
    }
}
