//! Work-item execution.

pub mod email_worker;

pub use email_worker::{EmailWorker, WorkerOutcome};
