use std::sync::Arc;
use std::time::Duration;

use log::trace;

use crate::error::DriverResult;

use super::{CancellationToken, Operation, ProgressScope, ProgressTracker};

/// Execution context handed to an operation body.
///
/// Carries the cancellation token of the top-level operation and the progress
/// scope the body reports into.
#[derive(Debug)]
pub struct OperationContext {
    token: CancellationToken,
    scope: ProgressScope,
}

impl OperationContext {
    pub fn new(token: CancellationToken, scope: ProgressScope) -> Self {
        Self { token, scope }
    }

    /// Context with a fresh token and a progress tree nobody observes.
    pub fn detached() -> Self {
        Self::new(
            CancellationToken::new(),
            ProgressScope::root(ProgressTracker::detached()),
        )
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_canceled(&self) -> bool {
        self.token.is_canceled()
    }

    /// Fail with `Canceled` if cancellation was requested.
    pub fn check_canceled(&self) -> DriverResult<()> {
        self.token.check()
    }

    /// Sleep unless canceled first.
    pub fn sleep(&self, duration: Duration) -> DriverResult<()> {
        self.token.sleep(duration)
    }

    pub fn scope(&self) -> &ProgressScope {
        &self.scope
    }

    /// Advance by `fraction` of the current scope.
    pub fn worked(&mut self, fraction: f32) {
        self.scope.worked(fraction);
    }

    /// Move to an absolute position within the current scope.
    pub fn set_progress(&mut self, position: f32) {
        self.scope.set_progress(position);
    }

    /// Mark the current scope complete.
    pub fn done(&mut self) {
        self.scope.done();
    }

    /// Context for a nested step that reports into the next `fraction` of
    /// the current scope.
    pub fn create_sub(&mut self, fraction: f32) -> OperationContext {
        OperationContext::new(self.token.clone(), self.scope.create_sub(fraction))
    }

    /// Run `operation` synchronously inside this context.
    ///
    /// The nested operation shares this context's cancellation token and
    /// reports into the next `fraction` of the current scope. Its errors are
    /// returned unchanged so the caller can propagate or handle them.
    pub fn execute_sub_operation<O>(
        &mut self,
        operation: &mut O,
        fraction: f32,
    ) -> DriverResult<O::Output>
    where
        O: Operation + ?Sized,
    {
        self.check_canceled()?;

        let mut context = self.create_sub(fraction);
        trace!("Running sub-operation {}", operation.name());

        let output = operation.execute(&mut context)?;
        context.done();
        Ok(output)
    }
}
