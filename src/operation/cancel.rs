use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::{DriverError, DriverResult};

/// Cooperative cancellation flag shared by an operation and everything it calls.
///
/// Clones observe the same flag. Besides polling, holders can sleep on the
/// token and are woken as soon as it is canceled.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    canceled: Mutex<bool>,
    wake: Condvar,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation and wake every sleeper.
    pub fn cancel(&self) {
        let mut canceled = self
            .inner
            .canceled
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *canceled = true;
        self.inner.wake.notify_all();
    }

    pub fn is_canceled(&self) -> bool {
        *self
            .inner
            .canceled
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Fail with [`DriverError::Canceled`] once cancellation was requested.
    pub fn check(&self) -> DriverResult<()> {
        if self.is_canceled() {
            Err(DriverError::Canceled)
        } else {
            Ok(())
        }
    }

    /// Sleep for `duration` unless canceled first.
    ///
    /// Returns [`DriverError::Canceled`] when woken by a cancel request.
    pub fn sleep(&self, duration: Duration) -> DriverResult<()> {
        let deadline = Instant::now() + duration;
        let mut canceled = self
            .inner
            .canceled
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        while !*canceled {
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            canceled = self
                .inner
                .wake
                .wait_timeout(canceled, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }

        Err(DriverError::Canceled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_clones_share_flag() {
        let token = CancellationToken::new();
        let clone = token.clone();
        assert!(!clone.is_canceled());
        token.cancel();
        assert!(clone.is_canceled());
        assert!(matches!(clone.check(), Err(DriverError::Canceled)));
    }

    #[test]
    fn test_sleep_completes_without_cancel() {
        let token = CancellationToken::new();
        assert!(token.sleep(Duration::from_millis(10)).is_ok());
    }

    #[test]
    fn test_cancel_wakes_sleeper() {
        let token = CancellationToken::new();
        let sleeper = token.clone();
        let started = Instant::now();
        let handle = thread::spawn(move || sleeper.sleep(Duration::from_secs(10)));

        thread::sleep(Duration::from_millis(20));
        token.cancel();

        let result = handle.join().unwrap();
        assert!(matches!(result, Err(DriverError::Canceled)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
