use std::fmt;
use std::sync::{Arc, Mutex};

/// Root of a progress tree.
///
/// Every scope of one operation reports absolute values here. The tracker
/// clamps them to `[0, 1]` and drops values that would move progress
/// backwards, so observers only ever see a non-decreasing sequence.
pub struct ProgressTracker {
    current: Mutex<f32>,
    sink: Box<dyn Fn(f32) + Send + Sync>,
}

impl ProgressTracker {
    /// Create a tracker that forwards every increase to `sink`.
    pub fn new<F>(sink: F) -> Arc<Self>
    where
        F: Fn(f32) + Send + Sync + 'static,
    {
        Arc::new(Self {
            current: Mutex::new(0.0),
            sink: Box::new(sink),
        })
    }

    /// Tracker whose reports go nowhere.
    pub fn detached() -> Arc<Self> {
        Self::new(|_| {})
    }

    pub fn value(&self) -> f32 {
        *self
            .current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn report(&self, value: f32) {
        let value = value.clamp(0.0, 1.0);
        let mut current = self
            .current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if value > *current {
            *current = value;
            // Sink runs under the lock so observers see values in order.
            (self.sink)(value);
        }
    }
}

impl fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressTracker")
            .field("current", &self.value())
            .finish()
    }
}

/// A bounded slice `[lower, upper]` of the root progress range.
///
/// The scope tracks its own position in `[0, 1]`. `worked` advances it and
/// reports `lower + position * (upper - lower)` to the root. Sub-scopes take
/// the next `fraction` of this scope's range.
#[derive(Debug, Clone)]
pub struct ProgressScope {
    tracker: Arc<ProgressTracker>,
    lower: f32,
    upper: f32,
    position: f32,
}

impl ProgressScope {
    /// Scope covering the whole range of `tracker`.
    pub fn root(tracker: Arc<ProgressTracker>) -> Self {
        Self {
            tracker,
            lower: 0.0,
            upper: 1.0,
            position: 0.0,
        }
    }

    pub fn lower(&self) -> f32 {
        self.lower
    }

    pub fn upper(&self) -> f32 {
        self.upper
    }

    /// Position inside this scope, in `[0, 1]`.
    pub fn position(&self) -> f32 {
        self.position
    }

    /// Advance by `fraction` of this scope.
    pub fn worked(&mut self, fraction: f32) {
        if fraction.is_nan() || fraction <= 0.0 {
            return;
        }
        self.position = (self.position + fraction).min(1.0);
        self.report();
    }

    /// Move to an absolute position inside this scope. Never moves backwards.
    pub fn set_progress(&mut self, position: f32) {
        if position.is_nan() {
            return;
        }
        self.position = self.position.max(position.clamp(0.0, 1.0));
        self.report();
    }

    /// Mark the whole scope as worked.
    pub fn done(&mut self) {
        self.position = 1.0;
        self.report();
    }

    /// Reserve the next `fraction` of this scope for a child.
    ///
    /// The reservation is consumed immediately; the child reports progress
    /// inside it. Requests past the end of the scope are clamped.
    pub fn create_sub(&mut self, fraction: f32) -> ProgressScope {
        let fraction = if fraction.is_nan() {
            0.0
        } else {
            fraction.max(0.0)
        };
        let start = self.position;
        let end = (start + fraction).min(1.0);
        self.position = end;

        ProgressScope {
            tracker: Arc::clone(&self.tracker),
            lower: self.absolute(start),
            upper: self.absolute(end),
            position: 0.0,
        }
    }

    fn absolute(&self, position: f32) -> f32 {
        self.lower + position * (self.upper - self.lower)
    }

    fn report(&self) {
        self.tracker.report(self.absolute(self.position));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recording_tracker() -> (Arc<ProgressTracker>, Arc<Mutex<Vec<f32>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let tracker = ProgressTracker::new(move |value| sink.lock().unwrap().push(value));
        (tracker, seen)
    }

    #[test]
    fn test_worked_maps_into_range() {
        let (tracker, _) = recording_tracker();
        let mut root = ProgressScope::root(Arc::clone(&tracker));
        root.worked(0.5);
        let mut sub = root.create_sub(0.25);
        assert_eq!(sub.lower(), 0.5);
        assert_eq!(sub.upper(), 0.75);

        sub.worked(0.5);
        assert!((tracker.value() - 0.625).abs() < 1e-6);
    }

    #[test]
    fn test_nested_scopes_are_monotonic_and_bounded() {
        let (tracker, seen) = recording_tracker();
        let mut root = ProgressScope::root(Arc::clone(&tracker));

        for fraction in [0.0625, 0.0625, 0.0625, 0.75, 0.0125, 0.05] {
            let mut child = root.create_sub(fraction);
            let mut grandchild = child.create_sub(0.5);
            for _ in 0..7 {
                grandchild.worked(0.2);
            }
            child.set_progress(0.3);
            child.worked(0.4);
            child.done();
        }
        root.worked(5.0);
        root.done();

        let seen = seen.lock().unwrap();
        assert!(!seen.is_empty());
        assert!(seen.windows(2).all(|pair| pair[0] <= pair[1]));
        assert!(seen.iter().all(|value| *value <= 1.0));
        assert_eq!(tracker.value(), 1.0);
    }

    #[test]
    fn test_backwards_progress_is_ignored() {
        let (tracker, seen) = recording_tracker();
        let mut root = ProgressScope::root(Arc::clone(&tracker));
        root.set_progress(0.8);
        root.set_progress(0.2);
        assert_eq!(tracker.value(), 0.8);
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_oversized_sub_is_clamped() {
        let (tracker, _) = recording_tracker();
        let mut root = ProgressScope::root(Arc::clone(&tracker));
        root.worked(0.9);
        let mut sub = root.create_sub(0.5);
        assert!((sub.upper() - 1.0).abs() < 1e-6);
        sub.done();
        assert_eq!(tracker.value(), 1.0);
    }
}
