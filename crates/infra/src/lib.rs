//! Infrastructure layer: job storage, dispatch backends, collaborator
//! adapters, and the discovery / worker / orchestration services built on
//! them.

pub mod config;
pub mod discovery;
pub mod dispatch;
pub mod external;
pub mod jobs;
pub mod ledger;
pub mod orchestrator;
pub mod workers;

pub use discovery::{DiscoveryError, DiscoveryLoop, DiscoveryReport, DiscoverySettings};
pub use dispatch::BackendDispatcher;
pub use ledger::DispatchLedger;
pub use orchestrator::{CancelledJob, JobOrchestrator, OrchestratorError, StartedJob};
pub use workers::{EmailWorker, WorkerOutcome};
