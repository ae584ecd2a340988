//! Capture server for backend tests.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{Json, Router, body::Bytes, http::{HeaderMap, Method, StatusCode, Uri}};
use serde_json::Value;

use sweep_core::{JobId, MailboxId, MessageId, ThreadId};
use sweep_jobs::WorkItem;

#[derive(Debug, Clone)]
pub struct Captured {
    pub method: String,
    pub path: String,
    pub headers: HeaderMap,
    pub body: Value,
}

impl Captured {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// Answers every request with a fixed status and JSON body, recording it.
pub struct CaptureServer {
    base_url: String,
    requests: Arc<Mutex<Vec<Captured>>>,
    handle: tokio::task::JoinHandle<()>,
}

impl CaptureServer {
    pub async fn start(status: u16, response: Value) -> Self {
        let requests = Arc::new(Mutex::new(Vec::new()));
        let recorded = requests.clone();
        let status = StatusCode::from_u16(status).unwrap();

        let app = Router::new().fallback(
            move |method: Method, uri: Uri, headers: HeaderMap, body: Bytes| {
                let recorded = recorded.clone();
                let response = response.clone();
                async move {
                    recorded.lock().unwrap().push(Captured {
                        method: method.to_string(),
                        path: uri.path().to_string(),
                        headers,
                        body: serde_json::from_slice(&body).unwrap_or(Value::Null),
                    });
                    (status, Json(response))
                }
            },
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self {
            base_url: format!("http://{addr}"),
            requests,
            handle,
        }
    }

    pub fn url(&self) -> String {
        self.base_url.clone()
    }

    pub fn requests(&self) -> Vec<Captured> {
        self.requests.lock().unwrap().clone()
    }

    /// Poll until at least `n` requests arrived (background senders).
    pub async fn wait_for(&self, n: usize) -> Vec<Captured> {
        for _ in 0..200 {
            let seen = self.requests();
            if seen.len() >= n {
                return seen;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {n} requests, saw {}", self.requests().len());
    }
}

impl Drop for CaptureServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub fn work_item(message_id: &str) -> WorkItem {
    WorkItem {
        job_id: JobId::new(),
        mailbox_id: MailboxId::new(),
        message_id: MessageId::parse(message_id).unwrap(),
        thread_id: ThreadId::parse(format!("t-{message_id}")).unwrap(),
        force_reprocess: false,
    }
}
