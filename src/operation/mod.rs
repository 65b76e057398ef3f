//! Cancellable, timeout-bounded units of device work.
//!
//! # Lifecycle
//!
//! ```text
//! Created ──► Running ──► Done | Excepted | TimedOut | Canceled
//!    └──────────────────► Canceled (canceled before it started)
//! ```
//!
//! An [`Operation`] only supplies the body. The [`OperationTask`] wrapping it
//! owns the state machine, races the body against its timeout and notifies
//! listeners and the bound [`AsyncCallback`]. Bodies report progress and
//! observe cancellation through the [`OperationContext`] they are handed, and
//! may run nested operations with [`OperationContext::execute_sub_operation`].

mod callback;
mod cancel;
mod context;
mod progress;
mod task;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::DriverResult;

pub use callback::{AsyncAdapter, AsyncCallback, OperationListener};
pub use cancel::CancellationToken;
pub use context::OperationContext;
pub use progress::{ProgressScope, ProgressTracker};
pub use task::{OperationInfo, OperationRecord, OperationTask};

/// Lifecycle state of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    Created,
    Running,
    Done,
    Excepted,
    TimedOut,
    Canceled,
}

impl State {
    /// Terminal states are absorbing.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            State::Done | State::Excepted | State::TimedOut | State::Canceled
        )
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: State) -> bool {
        match self {
            State::Created => matches!(next, State::Running | State::Canceled),
            State::Running => next.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::Created => "CREATED",
            State::Running => "RUNNING",
            State::Done => "DONE",
            State::Excepted => "EXCEPTED",
            State::TimedOut => "TIMEDOUT",
            State::Canceled => "CANCELED",
        };
        f.write_str(name)
    }
}

/// Unique identity of an operation instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperationId(u64);

impl OperationId {
    pub(crate) fn next() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        OperationId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Notification fired around every state transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChangedEvent {
    pub operation_id: OperationId,
    pub operation_name: &'static str,
    pub old_state: State,
    pub new_state: State,
}

/// The body of a unit of device work.
pub trait Operation: Send {
    /// Value delivered to the caller on success.
    type Output: Send + 'static;

    /// Short name used in logs and error messages.
    fn name(&self) -> &'static str;

    /// Run the body. Only called while the owning task is RUNNING.
    fn execute(&mut self, context: &mut OperationContext) -> DriverResult<Self::Output>;
}

/// Type-erased operation as handed out by the device factories.
pub type BoxedOperation<T> = Box<dyn Operation<Output = T>>;

impl<O: Operation + ?Sized> Operation for Box<O> {
    type Output = O::Output;

    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn execute(&mut self, context: &mut OperationContext) -> DriverResult<Self::Output> {
        (**self).execute(context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states_are_absorbing() {
        for terminal in [State::Done, State::Excepted, State::TimedOut, State::Canceled] {
            assert!(terminal.is_terminal());
            for next in [
                State::Created,
                State::Running,
                State::Done,
                State::Excepted,
                State::TimedOut,
                State::Canceled,
            ] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_created_transitions() {
        assert!(State::Created.can_transition_to(State::Running));
        assert!(State::Created.can_transition_to(State::Canceled));
        assert!(!State::Created.can_transition_to(State::Done));
        assert!(!State::Running.can_transition_to(State::Created));
    }

    #[test]
    fn test_operation_ids_are_unique() {
        let a = OperationId::next();
        let b = OperationId::next();
        assert_ne!(a, b);
        assert!(b > a);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(State::TimedOut.to_string(), "TIMEDOUT");
        assert_eq!(State::Running.to_string(), "RUNNING");
    }
}
