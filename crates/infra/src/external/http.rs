//! JSON-over-HTTP adapters for the mail gateway and the rules service.
//!
//! Mail gateway:
//! - `GET  {base}/mailboxes/{mailbox}/messages?q=&page_size=&page_token=` → [`MessagePage`]
//! - `GET  {base}/mailboxes/{mailbox}/messages/{id}` → [`Message`]
//!
//! Rules service:
//! - `POST {base}/mailboxes/{mailbox}/threads/handled` `{thread_ids}` → `{handled}`
//! - `POST {base}/mailboxes/{mailbox}/executions/lookup` `{thread_id, message_id}` → `{handled}`
//! - `POST {base}/mailboxes/{mailbox}/evaluate` `{message}` → [`RuleOutcome`]

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode, Url};
use serde::{Deserialize, Serialize};
use tracing::debug;

use sweep_core::{MailboxId, MessageId, ThreadId};

use super::mail::{MailError, MailProvider, Message, MessagePage, MessageQuery};
use super::rules::{RuleEngine, RuleError, RuleOutcome};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

fn authorize(request: RequestBuilder, token: Option<&str>) -> RequestBuilder {
    match token {
        Some(token) => request.bearer_auth(token),
        None => request,
    }
}

pub struct HttpMailProvider {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl HttpMailProvider {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        }
    }
}

impl HttpMailProvider {
    /// `{base}/mailboxes/{mailbox}/messages/{message}`. The message id is
    /// provider-assigned and is percent-encoded as a single path segment.
    fn message_url(&self, mailbox_id: MailboxId, message_id: &MessageId) -> Result<Url, MailError> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| MailError::Unavailable(format!("mail gateway url: {e}")))?;
        url.path_segments_mut()
            .map_err(|()| MailError::Unavailable(format!("mail gateway url {} has no path", self.base_url)))?
            .pop_if_empty()
            .extend(["mailboxes", &mailbox_id.to_string(), "messages", message_id.as_str()]);
        Ok(url)
    }
}

fn mail_transport(e: reqwest::Error) -> MailError {
    MailError::Unavailable(e.to_string())
}

#[async_trait]
impl MailProvider for HttpMailProvider {
    async fn list_messages(
        &self,
        mailbox_id: MailboxId,
        query: &MessageQuery,
        page_token: Option<&str>,
    ) -> Result<MessagePage, MailError> {
        let url = format!("{}/mailboxes/{}/messages", self.base_url, mailbox_id);
        let page_size = query.page_size.to_string();
        let search = query.window.to_search_query();
        let mut params = vec![("q", search.as_str()), ("page_size", page_size.as_str())];
        if let Some(token) = page_token {
            params.push(("page_token", token));
        }

        debug!(mailbox_id = %mailbox_id, q = %search, "listing messages");
        let response = authorize(self.client.get(&url), self.token.as_deref())
            .query(&params)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(mail_transport)?;

        match response.status() {
            s if s.is_success() => response
                .json::<MessagePage>()
                .await
                .map_err(|e| MailError::Decode(e.to_string())),
            StatusCode::TOO_MANY_REQUESTS => Err(MailError::RateLimited),
            s => Err(MailError::Unavailable(format!("list returned {s}"))),
        }
    }

    async fn get_message(
        &self,
        mailbox_id: MailboxId,
        message_id: &MessageId,
    ) -> Result<Message, MailError> {
        let url = self.message_url(mailbox_id, message_id)?;
        let response = authorize(self.client.get(url), self.token.as_deref())
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(mail_transport)?;

        match response.status() {
            s if s.is_success() => response
                .json::<Message>()
                .await
                .map_err(|e| MailError::Decode(e.to_string())),
            StatusCode::NOT_FOUND => Err(MailError::NotFound(message_id.clone())),
            StatusCode::TOO_MANY_REQUESTS => Err(MailError::RateLimited),
            s => Err(MailError::Unavailable(format!("get returned {s}"))),
        }
    }
}

pub struct HttpRuleEngine {
    client: Client,
    base_url: String,
    token: Option<String>,
}

#[derive(Serialize)]
struct HandledThreadsRequest<'a> {
    thread_ids: &'a [ThreadId],
}

#[derive(Deserialize)]
struct HandledThreadsResponse {
    #[serde(default)]
    handled: Vec<ThreadId>,
}

#[derive(Serialize)]
struct LookupRequest<'a> {
    thread_id: &'a ThreadId,
    message_id: &'a MessageId,
}

#[derive(Deserialize)]
struct LookupResponse {
    handled: bool,
}

#[derive(Serialize)]
struct EvaluateRequest<'a> {
    message: &'a Message,
}

impl HttpRuleEngine {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        }
    }

    async fn post<B, T>(&self, path: String, body: &B) -> Result<T, RuleError>
    where
        B: Serialize + Sync,
        T: serde::de::DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, path);
        let response = authorize(self.client.post(&url), self.token.as_deref())
            .json(body)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|e| RuleError::Unavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RuleError::Unavailable(format!("{path} returned {status}: {body}")));
        }
        response
            .json::<T>()
            .await
            .map_err(|e| RuleError::Decode(e.to_string()))
    }
}

#[async_trait]
impl RuleEngine for HttpRuleEngine {
    async fn handled_threads(
        &self,
        mailbox_id: MailboxId,
        threads: &[ThreadId],
    ) -> Result<HashSet<ThreadId>, RuleError> {
        if threads.is_empty() {
            return Ok(HashSet::new());
        }
        let response: HandledThreadsResponse = self
            .post(
                format!("/mailboxes/{mailbox_id}/threads/handled"),
                &HandledThreadsRequest { thread_ids: threads },
            )
            .await?;
        Ok(response.handled.into_iter().collect())
    }

    async fn is_handled(
        &self,
        mailbox_id: MailboxId,
        thread_id: &ThreadId,
        message_id: &MessageId,
    ) -> Result<bool, RuleError> {
        let response: LookupResponse = self
            .post(
                format!("/mailboxes/{mailbox_id}/executions/lookup"),
                &LookupRequest {
                    thread_id,
                    message_id,
                },
            )
            .await?;
        Ok(response.handled)
    }

    async fn evaluate(&self, mailbox_id: MailboxId, message: &Message) -> Result<RuleOutcome, RuleError> {
        match self
            .post(
                format!("/mailboxes/{mailbox_id}/evaluate"),
                &EvaluateRequest { message },
            )
            .await
        {
            Err(RuleError::Unavailable(msg)) => Err(RuleError::Evaluation(msg)),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use axum::{
        Json, Router,
        extract::{Path, Query},
        routing::{get, post},
    };
    use chrono::NaiveDate;
    use serde_json::{Value, json};
    use sweep_jobs::QueryWindow;

    use super::*;

    async fn serve(app: Router) -> (String, tokio::task::JoinHandle<()>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), handle)
    }

    #[tokio::test]
    async fn mail_gateway_round_trip() {
        let seen = Arc::new(Mutex::new(Vec::<Value>::new()));
        let seen_in = seen.clone();
        let app = Router::new()
            .route(
                "/mailboxes/:mailbox/messages",
                get(move |Query(q): Query<Value>| {
                    let seen = seen_in.clone();
                    async move {
                        seen.lock().unwrap().push(q);
                        Json(json!({
                            "items": [{"id": "m1", "thread_id": "t1", "from": "a@b.example"}, {"thread_id": "t2"}],
                            "next_page_token": "tok-2"
                        }))
                    }
                }),
            )
            .route(
                "/mailboxes/:mailbox/messages/:id",
                get(|Path((_m, id)): Path<(String, String)>| async move {
                    if id == "missing" {
                        return Err(StatusCode::NOT_FOUND);
                    }
                    Ok(Json(json!({"id": id, "thread_id": "t1", "from": "a@b.example", "subject": "hi"})))
                }),
            );
        let (base, handle) = serve(app).await;

        let provider = HttpMailProvider::new(format!("{base}/"), Some("tok".into()));
        let mailbox = MailboxId::new();
        let query = MessageQuery {
            window: QueryWindow::new(NaiveDate::from_ymd_opt(2024, 5, 1).unwrap()).unread_only(true),
            page_size: 25,
        };

        let page = provider.list_messages(mailbox, &query, Some("tok-1")).await.unwrap();
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.items[1].id, None);
        assert_eq!(page.next_page_token.as_deref(), Some("tok-2"));
        let q = seen.lock().unwrap()[0].clone();
        assert_eq!(q["q"], "after:2024/05/01 is:unread");
        assert_eq!(q["page_size"], "25");
        assert_eq!(q["page_token"], "tok-1");

        let msg = provider
            .get_message(mailbox, &MessageId::parse("m1").unwrap())
            .await
            .unwrap();
        assert_eq!(msg.subject, "hi");

        // reserved characters stay inside one path segment
        let odd = provider
            .get_message(mailbox, &MessageId::parse("a/b#c?d").unwrap())
            .await
            .unwrap();
        assert_eq!(odd.id.as_str(), "a/b#c?d");

        let missing = MessageId::parse("missing").unwrap();
        assert_eq!(
            provider.get_message(mailbox, &missing).await.unwrap_err(),
            MailError::NotFound(missing)
        );
        handle.abort();
    }

    #[tokio::test]
    async fn rules_service_round_trip() {
        let app = Router::new()
            .route(
                "/mailboxes/:mailbox/threads/handled",
                post(|Json(body): Json<Value>| async move {
                    let first = body["thread_ids"][0].clone();
                    Json(json!({ "handled": [first] }))
                }),
            )
            .route(
                "/mailboxes/:mailbox/executions/lookup",
                post(|Json(body): Json<Value>| async move {
                    Json(json!({ "handled": body["message_id"] == "done" }))
                }),
            )
            .route(
                "/mailboxes/:mailbox/evaluate",
                post(|| async { Json(json!({ "outcome": "no_rules_configured" })) }),
            );
        let (base, handle) = serve(app).await;
        let engine = HttpRuleEngine::new(base, None);
        let mailbox = MailboxId::new();

        let threads = vec![ThreadId::parse("t1").unwrap(), ThreadId::parse("t2").unwrap()];
        let handled = engine.handled_threads(mailbox, &threads).await.unwrap();
        assert_eq!(handled, HashSet::from([threads[0].clone()]));

        let t = ThreadId::parse("t1").unwrap();
        assert!(engine
            .is_handled(mailbox, &t, &MessageId::parse("done").unwrap())
            .await
            .unwrap());
        assert!(!engine
            .is_handled(mailbox, &t, &MessageId::parse("fresh").unwrap())
            .await
            .unwrap());

        let message = Message {
            id: MessageId::parse("m1").unwrap(),
            thread_id: t,
            from: "a@b.example".into(),
            to: vec![],
            subject: String::new(),
            body: String::new(),
            received_at: None,
        };
        assert_eq!(
            engine.evaluate(mailbox, &message).await.unwrap(),
            RuleOutcome::NoRulesConfigured
        );
        handle.abort();
    }
}
