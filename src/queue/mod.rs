//! Serial scheduler for operations sharing one hardware connection.
//!
//! A single worker thread takes queued operations in submission order and
//! drives each one to a terminal state before starting the next, so at most
//! one operation is RUNNING at any instant. Callers get an
//! [`OperationFuture`] back immediately.

mod future;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex, RwLock, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, trace};

use crate::error::{DriverError, DriverResult};
use crate::operation::{
    AsyncCallback, BoxedOperation, OperationId, OperationInfo, OperationListener,
    OperationRecord, OperationTask, StateChangedEvent,
};

pub use future::OperationFuture;
use future::ResultSlot;

/// Observer of every operation that passes through a queue.
pub trait OperationQueueListener: Send + Sync {
    fn before_state_changed(&self, _event: &StateChangedEvent) {}

    fn after_state_changed(&self, _event: &StateChangedEvent) {}

    /// An operation was accepted.
    fn on_added(&self, _operation: &OperationInfo) {}

    /// An operation reached a terminal state and left the queue.
    fn on_removed(&self, _operation: &OperationInfo) {}
}

trait QueuedJob: Send {
    fn record(&self) -> &Arc<OperationRecord>;

    fn run(self: Box<Self>, shared: &Shared);
}

struct Job<T> {
    task: OperationTask<T>,
    slot: Arc<ResultSlot<T>>,
}

impl<T: Send + 'static> QueuedJob for Job<T> {
    fn record(&self) -> &Arc<OperationRecord> {
        self.task.record()
    }

    fn run(mut self: Box<Self>, shared: &Shared) {
        let result = self.task.call();
        shared.remove(self.task.id());
        self.slot.complete(result);
    }
}

struct Shared {
    operations: Mutex<Vec<Arc<OperationRecord>>>,
    listeners: RwLock<Vec<Arc<dyn OperationQueueListener>>>,
    paused: Mutex<bool>,
    resumed: Condvar,
    closed: AtomicBool,
}

impl Shared {
    fn listeners(&self) -> Vec<Arc<dyn OperationQueueListener>> {
        self.listeners
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn remove(&self, id: OperationId) {
        let removed = {
            let mut operations = self
                .operations
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let index = operations.iter().position(|record| record.id() == id);
            index.map(|index| operations.remove(index))
        };

        if let Some(record) = removed {
            let info = record.info();
            for listener in self.listeners() {
                listener.on_removed(&info);
            }
        }
    }

    fn wait_while_paused(&self) {
        let mut paused = self
            .paused
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        while *paused && !self.closed.load(Ordering::SeqCst) {
            paused = self
                .resumed
                .wait(paused)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }
}

/// Forwards operation transitions to the queue listeners.
///
/// Holds the queue weakly; records outlive the queue in caller futures.
struct QueueForwarder {
    shared: Weak<Shared>,
}

impl OperationListener for QueueForwarder {
    fn before_state_changed(&self, event: &StateChangedEvent) {
        if let Some(shared) = self.shared.upgrade() {
            for listener in shared.listeners() {
                listener.before_state_changed(event);
            }
        }
    }

    fn after_state_changed(&self, event: &StateChangedEvent) {
        if let Some(shared) = self.shared.upgrade() {
            for listener in shared.listeners() {
                listener.after_state_changed(event);
            }
        }
    }
}

/// Pausable single-worker operation queue.
pub struct OperationQueue {
    shared: Arc<Shared>,
    sender: Mutex<Option<Sender<Box<dyn QueuedJob>>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl OperationQueue {
    /// Create a queue and start its worker thread.
    pub fn new() -> DriverResult<Self> {
        let shared = Arc::new(Shared {
            operations: Mutex::new(Vec::new()),
            listeners: RwLock::new(Vec::new()),
            paused: Mutex::new(false),
            resumed: Condvar::new(),
            closed: AtomicBool::new(false),
        });

        let (sender, receiver) = mpsc::channel::<Box<dyn QueuedJob>>();
        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name("operation-queue".into())
            .spawn(move || run_worker(worker_shared, receiver))?;

        Ok(Self {
            shared,
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Enqueue `operation` and return a handle to its outcome.
    ///
    /// A zero `timeout` lets the operation run without limit.
    ///
    /// # Errors
    /// `QueueClosed` once [`shutdown`](Self::shutdown) was called.
    pub fn add_operation<T, C>(
        &self,
        operation: BoxedOperation<T>,
        timeout: Duration,
        callback: C,
    ) -> DriverResult<OperationFuture<T>>
    where
        T: Send + 'static,
        C: AsyncCallback<T> + 'static,
    {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(DriverError::QueueClosed);
        }

        let mut task = OperationTask::new(operation);
        task.init(timeout, Arc::new(callback))?;
        task.add_listener(Arc::new(QueueForwarder {
            shared: Arc::downgrade(&self.shared),
        }));

        let record = Arc::clone(task.record());
        let slot = ResultSlot::new();
        let job: Box<dyn QueuedJob> = Box::new(Job {
            task,
            slot: Arc::clone(&slot),
        });

        // Register before sending so the worker can never remove it first.
        // Checked under the lock shutdown holds while canceling.
        {
            let mut operations = self
                .shared
                .operations
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if self.shared.closed.load(Ordering::SeqCst) {
                return Err(DriverError::QueueClosed);
            }
            operations.push(Arc::clone(&record));
        }

        let info = record.info();
        for listener in self.shared.listeners() {
            listener.on_added(&info);
        }

        let sent = {
            let sender = self
                .sender
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            match sender.as_ref() {
                Some(sender) => sender.send(job).is_ok(),
                None => false,
            }
        };
        if !sent {
            self.shared.remove(record.id());
            return Err(DriverError::QueueClosed);
        }

        debug!(
            "Queued {} {} (timeout: {:?})",
            info.name, info.id, info.timeout
        );

        Ok(OperationFuture::new(record, slot))
    }

    /// Snapshot of every queued or running operation, in submission order.
    pub fn operations(&self) -> Vec<OperationInfo> {
        self.shared
            .operations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .map(|record| record.info())
            .collect()
    }

    pub fn add_listener(&self, listener: Arc<dyn OperationQueueListener>) {
        self.shared
            .listeners
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(listener);
    }

    /// Stop starting new operations. A running operation continues.
    pub fn pause(&self) {
        trace!("Pausing operation queue");
        *self
            .shared
            .paused
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = true;
    }

    pub fn resume(&self) {
        trace!("Resuming operation queue");
        *self
            .shared
            .paused
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = false;
        self.shared.resumed.notify_all();
    }

    pub fn is_paused(&self) -> bool {
        *self
            .shared
            .paused
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Cancel everything still queued or running and stop the worker.
    ///
    /// Pending futures resolve with `Canceled`. Blocks until the worker
    /// thread has exited.
    pub fn shutdown(&self) {
        {
            let operations = self
                .shared
                .operations
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if self.shared.closed.swap(true, Ordering::SeqCst) {
                return;
            }
            debug!("Shutting down operation queue");
            for record in operations.iter() {
                record.cancel();
            }
        }
        self.shared.resumed.notify_all();

        // Closing the channel lets the worker drain and exit.
        self.sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();

        let worker = self
            .worker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(worker) = worker {
            if worker.join().is_err() {
                error!("Operation queue worker panicked");
            }
        }
    }
}

impl Drop for OperationQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker(shared: Arc<Shared>, receiver: Receiver<Box<dyn QueuedJob>>) {
    while let Ok(job) = receiver.recv() {
        shared.wait_while_paused();
        if shared.closed.load(Ordering::SeqCst) {
            job.record().cancel();
        }
        job.run(&shared);
    }
    trace!("Operation queue worker stopped");
}
