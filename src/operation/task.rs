use std::fmt;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::Duration;

use log::{debug, warn};

use crate::error::{DriverError, DriverResult};

use super::{
    AsyncCallback, BoxedOperation, CancellationToken, OperationContext, OperationId,
    OperationListener, ProgressScope, ProgressTracker, State, StateChangedEvent,
};

/// Point-in-time copy of an operation's observable attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationInfo {
    pub id: OperationId,
    pub name: &'static str,
    pub state: State,
    pub timeout: Option<Duration>,
}

/// Shared, type-independent part of an operation: identity, state, token and
/// listeners.
///
/// All transitions are serialized through one lock, which is also held while
/// progress is forwarded. A progress report can therefore never overtake the
/// terminal notification.
pub struct OperationRecord {
    id: OperationId,
    name: &'static str,
    state: Mutex<State>,
    transition: Mutex<()>,
    token: CancellationToken,
    timeout: Mutex<Option<Duration>>,
    listeners: RwLock<Vec<Arc<dyn OperationListener>>>,
}

impl OperationRecord {
    fn new(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            id: OperationId::next(),
            name,
            state: Mutex::new(State::Created),
            transition: Mutex::new(()),
            token: CancellationToken::new(),
            timeout: Mutex::new(None),
            listeners: RwLock::new(Vec::new()),
        })
    }

    pub fn id(&self) -> OperationId {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn state(&self) -> State {
        *self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Bound timeout. `None` means the operation may run forever.
    pub fn timeout(&self) -> Option<Duration> {
        *self
            .timeout
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Request cooperative cancellation.
    pub fn cancel(&self) {
        debug!("Cancel requested for {} {}", self.name, self.id);
        self.token.cancel();
    }

    pub fn is_canceled(&self) -> bool {
        self.token.is_canceled()
    }

    pub fn add_listener(&self, listener: Arc<dyn OperationListener>) {
        self.listeners
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(listener);
    }

    pub fn info(&self) -> OperationInfo {
        OperationInfo {
            id: self.id,
            name: self.name,
            state: self.state(),
            timeout: self.timeout(),
        }
    }

    fn set_timeout(&self, timeout: Option<Duration>) {
        *self
            .timeout
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = timeout;
    }

    /// Move to `next`, firing listeners around the change and `notify` once
    /// the new state is visible.
    ///
    /// Returns `false` without side effects if the transition is not allowed.
    fn transition<F: FnOnce()>(&self, next: State, notify: F) -> bool {
        let _guard = self
            .transition
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let old = self.state();
        if !old.can_transition_to(next) {
            warn!(
                "Ignoring transition of {} {} from {} to {}",
                self.name, self.id, old, next
            );
            return false;
        }

        let event = StateChangedEvent {
            operation_id: self.id,
            operation_name: self.name,
            old_state: old,
            new_state: next,
        };
        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();

        for listener in &listeners {
            listener.before_state_changed(&event);
        }
        *self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = next;
        debug!("{} {}: {} -> {}", self.name, self.id, old, next);

        for listener in &listeners {
            listener.after_state_changed(&event);
        }
        notify();
        true
    }

    /// Run `f` only while the operation is RUNNING, excluding transitions.
    fn while_running<F: FnOnce()>(&self, f: F) {
        let _guard = self
            .transition
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if self.state() == State::Running {
            f();
        }
    }
}

impl fmt::Debug for OperationRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationRecord")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

/// Runtime wrapper that drives one [`Operation`](super::Operation) through
/// its lifecycle.
pub struct OperationTask<T> {
    record: Arc<OperationRecord>,
    operation: Option<BoxedOperation<T>>,
    callback: Option<Arc<dyn AsyncCallback<T>>>,
}

impl<T: Send + 'static> OperationTask<T> {
    pub fn new(operation: BoxedOperation<T>) -> Self {
        Self {
            record: OperationRecord::new(operation.name()),
            operation: Some(operation),
            callback: None,
        }
    }

    /// Bind timeout and callback. A zero timeout means no limit.
    ///
    /// # Errors
    /// `IllegalState` if the task was already initialized.
    pub fn init(
        &mut self,
        timeout: Duration,
        callback: Arc<dyn AsyncCallback<T>>,
    ) -> DriverResult<()> {
        if self.callback.is_some() {
            return Err(DriverError::illegal_state(format!(
                "{} {} is already initialized",
                self.record.name, self.record.id
            )));
        }
        self.record
            .set_timeout((!timeout.is_zero()).then_some(timeout));
        self.callback = Some(callback);
        Ok(())
    }

    pub fn record(&self) -> &Arc<OperationRecord> {
        &self.record
    }

    pub fn id(&self) -> OperationId {
        self.record.id
    }

    pub fn state(&self) -> State {
        self.record.state()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.record.timeout()
    }

    pub fn cancel(&self) {
        self.record.cancel();
    }

    pub fn is_canceled(&self) -> bool {
        self.record.is_canceled()
    }

    pub fn add_listener(&self, listener: Arc<dyn OperationListener>) {
        self.record.add_listener(listener);
    }

    /// Execute the operation and drive it to a terminal state.
    ///
    /// The body runs on its own thread and is raced against the timeout. On
    /// expiry the token is canceled, the state becomes TIMEDOUT and the body
    /// thread is left to finish on its own; anything it reports afterwards is
    /// dropped.
    pub fn call(&mut self) -> DriverResult<T> {
        let callback = self.callback.clone().ok_or_else(|| {
            DriverError::illegal_state(format!(
                "{} {} was not initialized",
                self.record.name, self.record.id
            ))
        })?;
        let mut operation = self.operation.take().ok_or_else(|| {
            DriverError::illegal_state(format!(
                "{} {} was already executed",
                self.record.name, self.record.id
            ))
        })?;
        let record = Arc::clone(&self.record);

        if record.is_canceled() {
            record.transition(State::Canceled, || callback.on_cancel());
            return Err(DriverError::Canceled);
        }
        if !record.transition(State::Running, || callback.on_execute()) {
            return Err(DriverError::illegal_state(format!(
                "{} {} cannot start from {}",
                record.name,
                record.id,
                record.state()
            )));
        }

        let tracker = {
            let record = Arc::clone(&record);
            let callback = Arc::clone(&callback);
            ProgressTracker::new(move |fraction| {
                record.while_running(|| callback.on_progress_change(fraction))
            })
        };
        let mut context =
            OperationContext::new(record.token.clone(), ProgressScope::root(tracker));

        let (result_tx, result_rx) = mpsc::channel();
        let spawned = thread::Builder::new()
            .name(format!("operation-{}-{}", record.name, record.id.value()))
            .spawn(move || {
                let result = operation.execute(&mut context);
                // Receiver is gone when the operation already timed out.
                let _ = result_tx.send(result);
            });
        if let Err(e) = spawned {
            let error = DriverError::Io(e);
            record.transition(State::Excepted, || callback.on_failure(&error));
            return Err(error);
        }

        let received = match record.timeout() {
            Some(timeout) => result_rx.recv_timeout(timeout),
            None => result_rx
                .recv()
                .map_err(|_| RecvTimeoutError::Disconnected),
        };

        match received {
            Ok(Ok(value)) if !record.is_canceled() => {
                record.transition(State::Done, || callback.on_success(&value));
                Ok(value)
            }
            Ok(Ok(_)) | Ok(Err(DriverError::Canceled)) => {
                record.transition(State::Canceled, || callback.on_cancel());
                Err(DriverError::Canceled)
            }
            Ok(Err(error)) => {
                debug!("{} {} failed: {}", record.name, record.id, error);
                record.transition(State::Excepted, || callback.on_failure(&error));
                Err(error)
            }
            Err(RecvTimeoutError::Timeout) => {
                let timeout_ms = record
                    .timeout()
                    .map(|timeout| timeout.as_millis() as u64)
                    .unwrap_or_default();
                warn!(
                    "{} {} timed out after {}ms, abandoning its thread",
                    record.name, record.id, timeout_ms
                );
                record.token.cancel();
                record.transition(State::TimedOut, || callback.on_timeout());
                Err(DriverError::OperationTimedOut { timeout_ms })
            }
            Err(RecvTimeoutError::Disconnected) => {
                let error = DriverError::ThreadTerminated {
                    operation: record.name,
                };
                record.transition(State::Excepted, || callback.on_failure(&error));
                Err(error)
            }
        }
    }
}

impl<T> fmt::Debug for OperationTask<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationTask")
            .field("record", &self.record)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::{AsyncAdapter, Operation};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Sleeper {
        duration: Duration,
        result: Option<DriverError>,
    }

    impl Sleeper {
        fn new(duration_ms: u64) -> Self {
            Self {
                duration: Duration::from_millis(duration_ms),
                result: None,
            }
        }

        fn failing(error: DriverError) -> Self {
            Self {
                duration: Duration::ZERO,
                result: Some(error),
            }
        }
    }

    impl Operation for Sleeper {
        type Output = &'static str;

        fn name(&self) -> &'static str {
            "sleeper"
        }

        fn execute(&mut self, context: &mut OperationContext) -> DriverResult<&'static str> {
            thread::sleep(self.duration);
            context.worked(0.5);
            match self.result.take() {
                Some(error) => Err(error),
                None => Ok("done"),
            }
        }
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
        terminal: AtomicUsize,
    }

    impl Recorder {
        fn push(&self, event: &str) {
            self.events.lock().unwrap().push(event.to_string());
        }

        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
    }

    impl AsyncCallback<&'static str> for Recorder {
        fn on_execute(&self) {
            self.push("execute");
        }

        fn on_progress_change(&self, _fraction: f32) {
            self.push("progress");
        }

        fn on_success(&self, _result: &&'static str) {
            self.terminal.fetch_add(1, Ordering::SeqCst);
            self.push("success");
        }

        fn on_failure(&self, _error: &DriverError) {
            self.terminal.fetch_add(1, Ordering::SeqCst);
            self.push("failure");
        }

        fn on_cancel(&self) {
            self.terminal.fetch_add(1, Ordering::SeqCst);
            self.push("cancel");
        }

        fn on_timeout(&self) {
            self.terminal.fetch_add(1, Ordering::SeqCst);
            self.push("timeout");
        }
    }

    fn task(operation: Sleeper, timeout_ms: u64) -> (OperationTask<&'static str>, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let mut task = OperationTask::new(Box::new(operation));
        task.init(Duration::from_millis(timeout_ms), recorder.clone())
            .unwrap();
        (task, recorder)
    }

    #[test]
    fn test_call_success() {
        let (mut task, recorder) = task(Sleeper::new(0), 1000);
        assert_eq!(task.call().unwrap(), "done");
        assert_eq!(task.state(), State::Done);
        assert_eq!(recorder.events(), vec!["execute", "progress", "success"]);
    }

    #[test]
    fn test_call_cancel_before_start() {
        let (mut task, recorder) = task(Sleeper::new(0), 1000);
        task.cancel();
        assert!(matches!(task.call(), Err(DriverError::Canceled)));
        assert_eq!(task.state(), State::Canceled);
        assert_eq!(recorder.events(), vec!["cancel"]);
    }

    #[test]
    fn test_call_exception() {
        let (mut task, recorder) =
            task(Sleeper::failing(DriverError::incorrect_data("bad")), 1000);
        assert!(matches!(task.call(), Err(DriverError::IncorrectData { .. })));
        assert_eq!(task.state(), State::Excepted);
        assert_eq!(recorder.terminal.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_call_timeout() {
        let (mut task, recorder) = task(Sleeper::new(100), 50);
        assert!(matches!(
            task.call(),
            Err(DriverError::OperationTimedOut { timeout_ms: 50 })
        ));
        assert_eq!(task.state(), State::TimedOut);
        assert!(task.is_canceled());

        // Let the abandoned body finish; its late progress must be dropped.
        thread::sleep(Duration::from_millis(150));
        assert_eq!(recorder.events(), vec!["execute", "timeout"]);
        assert_eq!(recorder.terminal.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_init_twice_fails() {
        let mut task = OperationTask::new(Box::new(Sleeper::new(0)));
        task.init(Duration::from_millis(100), Arc::new(AsyncAdapter))
            .unwrap();
        assert!(matches!(
            task.init(Duration::from_millis(100), Arc::new(AsyncAdapter)),
            Err(DriverError::IllegalState { .. })
        ));
    }

    #[test]
    fn test_get_timeout() {
        let (task, _) = task(Sleeper::new(0), 100);
        assert_eq!(task.timeout(), Some(Duration::from_millis(100)));

        let mut unbounded = OperationTask::new(Box::new(Sleeper::new(0)));
        unbounded.init(Duration::ZERO, Arc::new(AsyncAdapter)).unwrap();
        assert_eq!(unbounded.timeout(), None);
    }

    #[test]
    fn test_call_twice_fails() {
        let (mut task, _) = task(Sleeper::new(0), 1000);
        task.call().unwrap();
        assert!(matches!(task.call(), Err(DriverError::IllegalState { .. })));
        assert_eq!(task.state(), State::Done);
    }

    #[test]
    fn test_listeners_see_before_and_after() {
        struct Listener(Mutex<Vec<(State, State, State)>>, Arc<OperationRecord>);

        impl OperationListener for Listener {
            fn before_state_changed(&self, event: &StateChangedEvent) {
                assert_eq!(self.1.state(), event.old_state);
            }

            fn after_state_changed(&self, event: &StateChangedEvent) {
                self.0
                    .lock()
                    .unwrap()
                    .push((event.old_state, event.new_state, self.1.state()));
            }
        }

        let (mut task, _) = task(Sleeper::new(0), 1000);
        let listener = Arc::new(Listener(Mutex::new(Vec::new()), Arc::clone(task.record())));
        task.add_listener(listener.clone());
        task.call().unwrap();

        let seen = listener.0.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![
                (State::Created, State::Running, State::Running),
                (State::Running, State::Done, State::Done),
            ]
        );
    }
}
