use std::fmt;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::Notify;

use crate::error::DriverResult;
use crate::operation::{OperationId, OperationRecord, State};

/// Single-use slot the queue fills once an operation is terminal.
pub(crate) struct ResultSlot<T> {
    value: Mutex<Option<DriverResult<T>>>,
    ready: Condvar,
    notify: Notify,
}

impl<T> ResultSlot<T> {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            value: Mutex::new(None),
            ready: Condvar::new(),
            notify: Notify::new(),
        })
    }

    pub(crate) fn complete(&self, result: DriverResult<T>) {
        let mut value = self
            .value
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *value = Some(result);
        self.ready.notify_all();
        self.notify.notify_one();
    }

    fn is_complete(&self) -> bool {
        self.value
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_some()
    }

    fn take(&self) -> Option<DriverResult<T>> {
        self.value
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }
}

/// Caller's handle on a queued operation.
///
/// Failures of the operation body are only surfaced here, when the caller
/// asks for the result.
pub struct OperationFuture<T> {
    record: Arc<OperationRecord>,
    slot: Arc<ResultSlot<T>>,
}

impl<T> OperationFuture<T> {
    pub(crate) fn new(record: Arc<OperationRecord>, slot: Arc<ResultSlot<T>>) -> Self {
        Self { record, slot }
    }

    pub fn id(&self) -> OperationId {
        self.record.id()
    }

    pub fn name(&self) -> &'static str {
        self.record.name()
    }

    pub fn state(&self) -> State {
        self.record.state()
    }

    /// Request cooperative cancellation of the operation.
    pub fn cancel(&self) {
        self.record.cancel();
    }

    /// Whether the result is available.
    pub fn is_done(&self) -> bool {
        self.slot.is_complete()
    }

    /// Block until the result is available or `timeout` elapsed.
    ///
    /// Returns `true` if the result is available.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut value = self
            .slot
            .value
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        while value.is_none() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            value = self
                .slot
                .ready
                .wait_timeout(value, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
        true
    }

    /// Block until the operation is terminal and return its outcome.
    ///
    /// Canceled and timed out operations yield `Canceled` and
    /// `OperationTimedOut`; failed ones yield the original cause.
    pub fn get(self) -> DriverResult<T> {
        let mut value = self
            .slot
            .value
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        loop {
            if let Some(result) = value.take() {
                return result;
            }
            value = self
                .slot
                .ready
                .wait(value)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    /// Await the outcome without blocking the async runtime.
    pub async fn wait(self) -> DriverResult<T> {
        loop {
            if let Some(result) = self.slot.take() {
                return result;
            }
            self.slot.notify.notified().await;
        }
    }
}

impl<T> fmt::Debug for OperationFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationFuture")
            .field("id", &self.record.id())
            .field("name", &self.record.name())
            .field("state", &self.record.state())
            .field("done", &self.slot.is_complete())
            .finish()
    }
}
