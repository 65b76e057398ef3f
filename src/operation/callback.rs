use crate::error::DriverError;

use super::StateChangedEvent;

/// Caller-side notifications for one operation.
///
/// For a given operation the calls arrive in order: `on_execute`, zero or
/// more increasing `on_progress_change`, then exactly one of `on_success`,
/// `on_failure`, `on_cancel` or `on_timeout`.
pub trait AsyncCallback<T>: Send + Sync {
    /// The operation moved to RUNNING.
    fn on_execute(&self) {}

    /// Root progress of the operation, in `[0, 1]`.
    fn on_progress_change(&self, _fraction: f32) {}

    fn on_success(&self, _result: &T) {}

    fn on_failure(&self, _error: &DriverError) {}

    fn on_cancel(&self) {}

    fn on_timeout(&self) {}
}

/// Callback that ignores every notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct AsyncAdapter;

impl<T> AsyncCallback<T> for AsyncAdapter {}

/// Observer of operation state transitions.
///
/// `before_state_changed` runs while the old state is still visible,
/// `after_state_changed` once the new state is in place.
pub trait OperationListener: Send + Sync {
    fn before_state_changed(&self, _event: &StateChangedEvent) {}

    fn after_state_changed(&self, _event: &StateChangedEvent) {}
}

impl<T, C> AsyncCallback<T> for std::sync::Arc<C>
where
    C: AsyncCallback<T> + ?Sized,
{
    fn on_execute(&self) {
        (**self).on_execute()
    }

    fn on_progress_change(&self, fraction: f32) {
        (**self).on_progress_change(fraction)
    }

    fn on_success(&self, result: &T) {
        (**self).on_success(result)
    }

    fn on_failure(&self, error: &DriverError) {
        (**self).on_failure(error)
    }

    fn on_cancel(&self) {
        (**self).on_cancel()
    }

    fn on_timeout(&self) {
        (**self).on_timeout()
    }
}
