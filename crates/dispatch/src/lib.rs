//! Dispatch abstraction: hands [`WorkItem`](sweep_jobs::WorkItem)s to an
//! asynchronous execution backend.
//!
//! Callers depend on [`Dispatcher`] only. Which backend carries an item is a
//! pure function of [`DispatchConfig`] (see [`select_backend`]); the HTTP
//! implementations live in `sweep-infra`.

pub mod config;
pub mod dispatcher;
pub mod in_memory;

pub use config::{
    BackendKind, DispatchConfig, EventPlatformConfig, FallbackConfig, QueueServiceConfig,
    select_backend,
};
pub use dispatcher::{
    BatchRecord, DispatchError, DispatchRecord, DispatchRequest, Dispatcher, EnqueueOptions,
};
pub use in_memory::InMemoryDispatcher;
