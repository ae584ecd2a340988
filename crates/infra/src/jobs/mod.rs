//! Durable bulk-job records.
//!
//! ## Design
//!
//! - One active (`pending`/`running`) job per mailbox, enforced at creation
//! - Status transitions refuse terminal jobs so callers can detect races
//! - Counters move only through relative increments
//! - Discovery checkpoints live on the job row so a retried run resumes
//!
//! ## Components
//!
//! - `JobStore`: the store contract
//! - `InMemoryJobStore`: tests/dev
//! - `PostgresJobStore`: production (sqlx)

pub mod postgres;
pub mod store;

pub use postgres::PostgresJobStore;
pub use store::{InMemoryJobStore, JobStore, JobStoreError};
