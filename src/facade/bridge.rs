//! Background copy of unsolicited device output into the input stream.
//!
//! The bridge never reads while an operation is RUNNING; those bytes belong
//! to the protocol exchange in flight.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, trace};

use super::stream::StreamBuffer;
use crate::connection::Connection;
use crate::error::DriverResult;
use crate::operation::{State, StateChangedEvent};
use crate::queue::OperationQueueListener;

struct BridgeState {
    /// Set by the connection when bytes arrive, cleared by the worker.
    signaled: Mutex<bool>,
    data_available: Condvar,
    /// True while an operation owns the wire. Held during every drain.
    operation_running: Mutex<bool>,
    stop: AtomicBool,
}

impl BridgeState {
    fn signal(&self) {
        *self
            .signaled
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = true;
        self.data_available.notify_all();
    }

    /// Wait for a data signal, at most `poll_interval`.
    fn wait_for_data(&self, poll_interval: Duration) {
        let mut signaled = self
            .signaled
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !*signaled {
            signaled = self
                .data_available
                .wait_timeout(signaled, poll_interval)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
        *signaled = false;
    }

    fn set_operation_running(&self, running: bool) {
        *self
            .operation_running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = running;
    }
}

/// Queue listener that closes the bridge around RUNNING operations.
///
/// The gate closes before the body starts and reopens once it is terminal.
struct RunningGate {
    state: Arc<BridgeState>,
}

impl OperationQueueListener for RunningGate {
    fn before_state_changed(&self, event: &StateChangedEvent) {
        if event.new_state == State::Running {
            self.state.set_operation_running(true);
        }
    }

    fn after_state_changed(&self, event: &StateChangedEvent) {
        if event.old_state == State::Running {
            self.state.set_operation_running(false);
        }
    }
}

pub(crate) struct StreamBridge {
    state: Arc<BridgeState>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl StreamBridge {
    /// Start the worker thread copying from `connection` into `buffer`.
    pub(crate) fn start(
        connection: Arc<dyn Connection>,
        buffer: Arc<StreamBuffer>,
        poll_interval: Duration,
    ) -> DriverResult<Self> {
        let state = Arc::new(BridgeState {
            signaled: Mutex::new(false),
            data_available: Condvar::new(),
            operation_running: Mutex::new(false),
            stop: AtomicBool::new(false),
        });

        // Listeners cannot be removed from a connection; hold the state weakly.
        let weak = Arc::downgrade(&state);
        connection.add_data_available_listener(Box::new(move || {
            if let Some(state) = weak.upgrade() {
                state.signal();
            }
        }));

        let worker_state = Arc::clone(&state);
        let worker = thread::Builder::new()
            .name("stream-bridge".into())
            .spawn(move || run_bridge(worker_state, connection, buffer, poll_interval))?;

        Ok(Self {
            state,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Listener to register on the queue whose operations share the wire.
    pub(crate) fn gate(&self) -> Arc<dyn OperationQueueListener> {
        Arc::new(RunningGate {
            state: Arc::clone(&self.state),
        })
    }

    /// Stop the worker and wait until it has exited.
    pub(crate) fn stop(&self) {
        self.state.stop.store(true, Ordering::SeqCst);
        self.state.signal();

        let worker = self
            .worker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(worker) = worker {
            if worker.join().is_err() {
                error!("Stream bridge worker panicked");
            }
            debug!("Stream bridge stopped");
        }
    }
}

fn run_bridge(
    state: Arc<BridgeState>,
    connection: Arc<dyn Connection>,
    buffer: Arc<StreamBuffer>,
    poll_interval: Duration,
) {
    while !state.stop.load(Ordering::SeqCst) {
        state.wait_for_data(poll_interval);
        if state.stop.load(Ordering::SeqCst) {
            break;
        }

        let running = state
            .operation_running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if *running || !connection.is_connected() {
            continue;
        }
        match read_available(connection.as_ref()) {
            Ok(data) if !data.is_empty() => {
                trace!("Bridged {} bytes", data.len());
                buffer.push(&data);
            }
            Ok(_) => {}
            Err(e) => debug!("Stream bridge read failed: {}", e),
        }
    }
}

fn read_available(connection: &dyn Connection) -> DriverResult<Vec<u8>> {
    let available = connection.bytes_available()?;
    if available == 0 {
        return Ok(Vec::new());
    }
    let mut data = vec![0u8; available];
    let read = connection.read(&mut data, Duration::ZERO)?;
    data.truncate(read);
    Ok(data)
}
