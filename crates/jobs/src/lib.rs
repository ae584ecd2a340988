//! `sweep-jobs`: the bulk-processing job model.
//!
//! Pure state: a [`BulkJob`] record, its status machine, relative counter
//! deltas, and the [`WorkItem`] handed to dispatch. Persistence lives in
//! `sweep-infra`.

pub mod job;
pub mod retry;
pub mod work_item;

pub use job::{
    BulkJob, CounterDelta, DiscoveryProgress, JobCounters, JobError, JobStatus, NewJob,
    QueryWindow,
};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use work_item::{ItemOutcome, WorkItem};
