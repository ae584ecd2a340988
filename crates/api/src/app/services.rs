//! Service wiring: job store, collaborators, dispatch and the job lifecycle.

use std::sync::Arc;

use anyhow::Context;

use sweep_auth::WorkerAuthenticator;
use sweep_dispatch::{Dispatcher, select_backend};
use sweep_infra::{
    BackendDispatcher, DiscoveryLoop, DiscoverySettings, DispatchLedger, EmailWorker,
    JobOrchestrator,
    config::AppConfig,
    external::{
        HttpMailProvider, HttpRuleEngine, InMemoryMailProvider, InMemoryRuleEngine, MailProvider,
        RuleEngine,
    },
    jobs::{InMemoryJobStore, JobStore, PostgresJobStore},
};

/// Everything the handlers need, shared behind an `Arc`.
#[derive(Clone)]
pub struct AppServices {
    pub store: Arc<dyn JobStore>,
    pub orchestrator: JobOrchestrator,
    pub worker: EmailWorker,
    pub worker_auth: WorkerAuthenticator,
}

impl AppServices {
    /// Wire the lifecycle over explicit parts. Tests pass in-memory parts here.
    pub fn new(
        config: &AppConfig,
        store: Arc<dyn JobStore>,
        mail: Arc<dyn MailProvider>,
        rules: Arc<dyn RuleEngine>,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Self {
        let ledger = Arc::new(DispatchLedger::new());
        let discovery = DiscoveryLoop::new(
            store.clone(),
            mail.clone(),
            rules.clone(),
            dispatcher.clone(),
            ledger.clone(),
            DiscoverySettings::from(&config.discovery),
        );
        let orchestrator = JobOrchestrator::new(
            store.clone(),
            discovery,
            dispatcher,
            ledger.clone(),
            config.discovery.retry.clone(),
        );
        let worker = EmailWorker::new(store.clone(), mail, rules).with_ledger(ledger);
        let worker_auth = WorkerAuthenticator::new(
            config.worker_auth.signing.clone(),
            config.worker_auth.shared_secret.clone(),
        );

        Self {
            store,
            orchestrator,
            worker,
            worker_auth,
        }
    }
}

/// Build services from configuration: Postgres when `DATABASE_URL` is set,
/// HTTP collaborators when their URLs are set, in-memory stand-ins otherwise.
pub async fn build_services(config: &AppConfig) -> anyhow::Result<AppServices> {
    let store: Arc<dyn JobStore> = match &config.database_url {
        Some(url) => {
            let store = PostgresJobStore::connect(url)
                .await
                .context("failed to connect to postgres")?;
            store.migrate().await.context("failed to run migrations")?;
            tracing::info!("using postgres job store");
            Arc::new(store)
        }
        None => {
            tracing::warn!("DATABASE_URL not set; jobs are kept in memory");
            InMemoryJobStore::arc()
        }
    };

    let collaborators = &config.collaborators;
    let mail: Arc<dyn MailProvider> = match &collaborators.mail_gateway_url {
        Some(url) => Arc::new(HttpMailProvider::new(url, collaborators.token.clone())),
        None => {
            tracing::warn!("MAIL_GATEWAY_URL not set; using an empty in-memory mailbox");
            Arc::new(InMemoryMailProvider::new())
        }
    };
    let rules: Arc<dyn RuleEngine> = match &collaborators.rules_service_url {
        Some(url) => Arc::new(HttpRuleEngine::new(url, collaborators.token.clone())),
        None => {
            tracing::warn!("RULES_SERVICE_URL not set; using the in-memory rule engine");
            Arc::new(InMemoryRuleEngine::new())
        }
    };

    if config.worker_auth.signing.is_none() && config.worker_auth.shared_secret.is_none() {
        tracing::warn!("no worker credentials configured; /bulk/worker rejects every call");
    }
    tracing::info!(
        backend = select_backend(&config.dispatch).as_str(),
        "dispatch backend selected"
    );
    let dispatcher: Arc<dyn Dispatcher> = Arc::new(BackendDispatcher::new(config.dispatch.clone()));

    Ok(AppServices::new(config, store, mail, rules, dispatcher))
}
