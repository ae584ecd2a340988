use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::StatusCode;
use serde_json::{Value, json};

use sweep_api::app::{AppServices, build_app};
use sweep_auth::{JwtClaims, QueueSignatureClaims, SHARED_SECRET_HEADER, SIGNATURE_HEADER, body_digest};
use sweep_core::{MailboxId, MessageId, ThreadId, UserId};
use sweep_dispatch::InMemoryDispatcher;
use sweep_infra::config::AppConfig;
use sweep_infra::external::{InMemoryMailProvider, InMemoryRuleEngine, Message};
use sweep_infra::jobs::InMemoryJobStore;

const JWT_SECRET: &str = "test-secret";
const WORKER_SECRET: &str = "worker-secret";
const QUEUE_SIGNING_KEY: &str = "queue-signing-key";

struct TestServer {
    base_url: String,
    mail: Arc<InMemoryMailProvider>,
    dispatcher: Arc<InMemoryDispatcher>,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn spawn() -> Self {
        let config = AppConfig::from_lookup(|key| match key {
            "WORKER_SHARED_SECRET" => Some(WORKER_SECRET.to_string()),
            "QUEUE_SIGNING_KEY" => Some(QUEUE_SIGNING_KEY.to_string()),
            "DISCOVERY_MAX_ATTEMPTS" => Some("1".to_string()),
            _ => None,
        })
        .expect("valid test config");

        let mail = Arc::new(InMemoryMailProvider::new());
        let dispatcher = Arc::new(InMemoryDispatcher::new());
        let services = AppServices::new(
            &config,
            InMemoryJobStore::arc(),
            mail.clone(),
            Arc::new(InMemoryRuleEngine::new()),
            dispatcher.clone(),
        );

        // Same router as prod, bound to an ephemeral port.
        let app = build_app(services, JWT_SECRET.to_string());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url,
            mail,
            dispatcher,
            handle,
        }
    }

    fn seed(&self, mailbox: MailboxId, n: usize) {
        self.mail.add_messages(
            mailbox,
            (0..n).map(|i| Message {
                id: MessageId::parse(format!("m{i}")).unwrap(),
                thread_id: ThreadId::parse(format!("t{i}")).unwrap(),
                from: "shop@deals.example".into(),
                to: vec![],
                subject: format!("deal {i}"),
                body: String::new(),
                received_at: None,
            }),
        );
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn mint_jwt(mailboxes: Vec<MailboxId>) -> String {
    let now = Utc::now();
    let claims = JwtClaims {
        sub: UserId::new(),
        mailboxes,
        issued_at: now,
        expires_at: now + ChronoDuration::minutes(10),
    };

    jsonwebtoken::encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(JWT_SECRET.as_bytes()),
    )
    .expect("failed to encode jwt")
}

/// What the queue service attaches to a delivery of `body`.
fn sign_delivery(body: &[u8]) -> String {
    let now = Utc::now().timestamp();
    let claims = QueueSignatureClaims {
        iss: "queue".into(),
        sub: "http://localhost/bulk/worker".into(),
        exp: now + 300,
        nbf: now - 1,
        iat: now,
        jti: "msg_signed".into(),
        body: body_digest(body),
    };
    jsonwebtoken::encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(QUEUE_SIGNING_KEY.as_bytes()),
    )
    .expect("failed to sign delivery")
}

async fn start_job(client: &reqwest::Client, srv: &TestServer, token: &str, mailbox: MailboxId) -> reqwest::Response {
    client
        .post(format!("{}/bulk/jobs", srv.base_url))
        .bearer_auth(token)
        .json(&json!({ "mailbox_id": mailbox, "start_date": "2024-01-01" }))
        .send()
        .await
        .unwrap()
}

/// Discovery runs in the background; poll until it has finished.
async fn job_after_discovery(client: &reqwest::Client, srv: &TestServer, token: &str, job_id: &str) -> Value {
    for _ in 0..100 {
        let job: Value = client
            .get(format!("{}/bulk/jobs/{}", srv.base_url, job_id))
            .bearer_auth(token)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        if job["discovery_finished"] == true || job["status"] == "failed" {
            return job;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("discovery did not finish within timeout");
}

#[tokio::test]
async fn health_is_public_and_jobs_need_auth() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = client.get(format!("{}/health", srv.base_url)).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let res = client.get(format!("{}/bulk/jobs", srv.base_url)).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    let res = client
        .get(format!("{}/bulk/jobs", srv.base_url))
        .bearer_auth("not-a-jwt")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn start_requires_mailbox_ownership() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let token = mint_jwt(vec![MailboxId::new()]);

    let res = start_job(&client, &srv, &token, MailboxId::new()).await;
    assert_eq!(res.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn job_runs_to_completion_through_the_worker_endpoint() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let mailbox = MailboxId::new();
    let token = mint_jwt(vec![mailbox]);
    srv.seed(mailbox, 30);

    let res = start_job(&client, &srv, &token, mailbox).await;
    assert_eq!(res.status(), StatusCode::CREATED);
    let created: Value = res.json().await.unwrap();
    let job_id = created["job_id"].as_str().unwrap().to_string();
    assert_eq!(created["status"], "running");

    let job = job_after_discovery(&client, &srv, &token, &job_id).await;
    assert_eq!(job["total_emails"], 30);
    assert_eq!(job["status"], "running");

    for request in srv.dispatcher.take() {
        let res = client
            .post(format!("{}/bulk/worker", srv.base_url))
            .header(SHARED_SECRET_HEADER, WORKER_SECRET)
            .json(&request.item)
            .send()
            .await
            .unwrap();
        if res.status() != StatusCode::OK {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            panic!("expected 200 OK from worker, got {status} body={body}");
        }
    }

    let job: Value = client
        .get(format!("{}/bulk/jobs/{}", srv.base_url, job_id))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(job["status"], "completed");
    assert_eq!(job["processed_emails"], 30);
    assert_eq!(job["failed_emails"], 0);

    let list: Value = client
        .get(format!("{}/bulk/jobs?mailbox={}", srv.base_url, mailbox))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(list["items"].as_array().unwrap().len(), 1);
    assert_eq!(list["items"][0]["id"], job_id.as_str());
}

#[tokio::test]
async fn second_active_job_conflicts() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let mailbox = MailboxId::new();
    let token = mint_jwt(vec![mailbox]);
    srv.seed(mailbox, 3);

    assert_eq!(start_job(&client, &srv, &token, mailbox).await.status(), StatusCode::CREATED);
    let res = start_job(&client, &srv, &token, mailbox).await;
    assert_eq!(res.status(), StatusCode::CONFLICT);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "conflict");
}

#[tokio::test]
async fn invalid_window_and_malformed_body_are_bad_requests() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let mailbox = MailboxId::new();
    let token = mint_jwt(vec![mailbox]);

    let res = client
        .post(format!("{}/bulk/jobs", srv.base_url))
        .bearer_auth(&token)
        .json(&json!({ "mailbox_id": mailbox, "start_date": "2024-05-01", "end_date": "2024-01-01" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let res = client
        .post(format!("{}/bulk/jobs", srv.base_url))
        .bearer_auth(&token)
        .json(&json!({ "mailbox_id": mailbox }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn other_users_cannot_see_or_cancel_a_job() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let mailbox = MailboxId::new();
    let owner = mint_jwt(vec![mailbox]);
    let stranger = mint_jwt(vec![MailboxId::new()]);

    let created: Value = start_job(&client, &srv, &owner, mailbox).await.json().await.unwrap();
    let job_id = created["job_id"].as_str().unwrap();

    let res = client
        .get(format!("{}/bulk/jobs/{}", srv.base_url, job_id))
        .bearer_auth(&stranger)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    let res = client
        .post(format!("{}/bulk/jobs/{}/cancel", srv.base_url, job_id))
        .bearer_auth(&stranger)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    let res = client
        .get(format!("{}/bulk/jobs?mailbox={}", srv.base_url, mailbox))
        .bearer_auth(&stranger)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn cancel_then_cancel_again() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let mailbox = MailboxId::new();
    let token = mint_jwt(vec![mailbox]);
    srv.seed(mailbox, 5);

    let created: Value = start_job(&client, &srv, &token, mailbox).await.json().await.unwrap();
    let job_id = created["job_id"].as_str().unwrap().to_string();
    job_after_discovery(&client, &srv, &token, &job_id).await;
    let in_flight = srv.dispatcher.take();

    let res = client
        .post(format!("{}/bulk/jobs/{}/cancel", srv.base_url, job_id))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["job"]["status"], "cancelled");

    let res = client
        .post(format!("{}/bulk/jobs/{}/cancel", srv.base_url, job_id))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    // Deliveries that were already in flight become benign skips.
    let res = client
        .post(format!("{}/bulk/worker", srv.base_url))
        .header(SHARED_SECRET_HEADER, WORKER_SECRET)
        .json(&in_flight[0].item)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let outcome: Value = res.json().await.unwrap();
    assert_eq!(outcome["status"], "skipped_cancelled");
}

#[tokio::test]
async fn worker_endpoint_authenticates_and_validates() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let item = json!({
        "job_id": sweep_core::JobId::new(),
        "mailbox_id": MailboxId::new(),
        "message_id": "m1",
        "thread_id": "t1",
    });

    let res = client
        .post(format!("{}/bulk/worker", srv.base_url))
        .json(&item)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    let res = client
        .post(format!("{}/bulk/worker", srv.base_url))
        .header(SHARED_SECRET_HEADER, "wrong")
        .json(&item)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    let res = client
        .post(format!("{}/bulk/worker", srv.base_url))
        .header(SHARED_SECRET_HEADER, WORKER_SECRET)
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    // Well-formed, but no such job.
    let res = client
        .post(format!("{}/bulk/worker", srv.base_url))
        .header(SHARED_SECRET_HEADER, WORKER_SECRET)
        .json(&item)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let outcome: Value = res.json().await.unwrap();
    assert_eq!(outcome["status"], "invalid");
}

#[tokio::test]
async fn signed_queue_delivery_is_accepted_and_counted() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let mailbox = MailboxId::new();
    let token = mint_jwt(vec![mailbox]);
    srv.seed(mailbox, 1);

    let created: Value = start_job(&client, &srv, &token, mailbox).await.json().await.unwrap();
    let job_id = created["job_id"].as_str().unwrap().to_string();
    job_after_discovery(&client, &srv, &token, &job_id).await;

    let queued = srv.dispatcher.take();
    assert_eq!(queued.len(), 1);
    let body = serde_json::to_vec(&queued[0].item).unwrap();
    let signature = sign_delivery(&body);

    // a signature over a different body is rejected
    let tampered = serde_json::to_vec(&json!({
        "job_id": job_id,
        "mailbox_id": MailboxId::new(),
        "message_id": "m0",
        "thread_id": "t0",
    }))
    .unwrap();
    let res = client
        .post(format!("{}/bulk/worker", srv.base_url))
        .header(SIGNATURE_HEADER, &signature)
        .header("content-type", "application/json")
        .body(tampered)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    let res = client
        .post(format!("{}/bulk/worker", srv.base_url))
        .header(SIGNATURE_HEADER, &signature)
        .header("content-type", "application/json")
        .body(body)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let job: Value = client
        .get(format!("{}/bulk/jobs/{}", srv.base_url, job_id))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(job["processed_emails"], 1);
    assert_eq!(job["status"], "completed");
}
