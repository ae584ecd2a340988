//! In-memory dispatcher for tests/dev.

use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;

use sweep_core::MessageId;
use sweep_jobs::WorkItem;

use crate::config::BackendKind;
use crate::dispatcher::{BatchRecord, DispatchError, DispatchRecord, DispatchRequest, Dispatcher, EnqueueOptions};

#[derive(Debug, Default)]
struct State {
    queued: Vec<(String, DispatchRequest)>,
    cancelled: Vec<String>,
    failing: HashSet<MessageId>,
    fail_batches: bool,
    batch_calls: usize,
}

/// Records every request instead of delivering it.
///
/// - No IO
/// - Receipt ids are `mem-<n>`; [`Dispatcher::cancel`] withdraws still-queued ones
/// - Items whose message id was registered with [`fail_on`](Self::fail_on)
///   are refused with a transport error
#[derive(Debug)]
pub struct InMemoryDispatcher {
    kind: BackendKind,
    next_id: AtomicU64,
    state: Mutex<State>,
}

impl InMemoryDispatcher {
    pub fn new() -> Self {
        Self::with_kind(BackendKind::QueueService)
    }

    /// Pretend to be a specific backend (affects [`Dispatcher::backend`] only).
    pub fn with_kind(kind: BackendKind) -> Self {
        Self {
            kind,
            next_id: AtomicU64::new(1),
            state: Mutex::new(State::default()),
        }
    }

    pub fn fail_on(&self, message_id: MessageId) {
        if let Ok(mut state) = self.state.lock() {
            state.failing.insert(message_id);
        }
    }

    /// Make every batch call fail so callers exercise their per-item path.
    pub fn fail_batches(&self, fail: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.fail_batches = fail;
        }
    }

    /// Remove and return everything queued so far.
    pub fn take(&self) -> Vec<DispatchRequest> {
        self.state
            .lock()
            .map(|mut s| s.queued.drain(..).map(|(_, r)| r).collect())
            .unwrap_or_default()
    }

    pub fn queued_len(&self) -> usize {
        self.state.lock().map(|s| s.queued.len()).unwrap_or(0)
    }

    pub fn cancelled(&self) -> Vec<String> {
        self.state.lock().map(|s| s.cancelled.clone()).unwrap_or_default()
    }

    pub fn batch_calls(&self) -> usize {
        self.state.lock().map(|s| s.batch_calls).unwrap_or(0)
    }

    fn push(&self, state: &mut State, request: DispatchRequest) -> Result<String, DispatchError> {
        if state.failing.contains(&request.item.message_id) {
            return Err(DispatchError::transport(
                self.kind,
                format!("refused {}", request.item.message_id),
            ));
        }
        let id = format!("mem-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        state.queued.push((id.clone(), request));
        Ok(id)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, State>, DispatchError> {
        self.state
            .lock()
            .map_err(|_| DispatchError::transport(self.kind, "in-memory dispatcher poisoned"))
    }
}

impl Default for InMemoryDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Dispatcher for InMemoryDispatcher {
    fn backend(&self) -> BackendKind {
        self.kind
    }

    async fn enqueue(
        &self,
        item: &WorkItem,
        options: &EnqueueOptions,
    ) -> Result<DispatchRecord, DispatchError> {
        let mut state = self.lock()?;
        let id = self.push(&mut state, DispatchRequest::new(item.clone(), options.clone()))?;
        Ok(DispatchRecord {
            backend: self.kind,
            message_id: Some(id),
        })
    }

    async fn enqueue_batch(&self, requests: &[DispatchRequest]) -> Result<BatchRecord, DispatchError> {
        let mut state = self.lock()?;
        state.batch_calls += 1;
        if state.fail_batches {
            return Err(DispatchError::transport(self.kind, "batch refused"));
        }
        // All-or-nothing, like the real batch endpoints.
        if let Some(bad) = requests.iter().find(|r| state.failing.contains(&r.item.message_id)) {
            return Err(DispatchError::transport(
                self.kind,
                format!("refused {}", bad.item.message_id),
            ));
        }
        let mut ids = Vec::with_capacity(requests.len());
        for request in requests {
            ids.push(self.push(&mut state, request.clone())?);
        }
        Ok(BatchRecord {
            backend: self.kind,
            count: ids.len(),
            message_ids: ids,
        })
    }

    async fn cancel(&self, message_id: &str) -> bool {
        let Ok(mut state) = self.state.lock() else {
            return false;
        };
        let before = state.queued.len();
        state.queued.retain(|(id, _)| id != message_id);
        let removed = state.queued.len() < before;
        if removed {
            state.cancelled.push(message_id.to_string());
        }
        removed
    }
}
