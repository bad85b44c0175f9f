//! Action/rollback transaction engine.
//!
//! Every durable change of a multi-write mutation (a new leaf image,
//! neighbor pointer patches, parent node patches, allocator updates) is one
//! step with a rollback that restores the prior bytes or releases the
//! allocation. Sequential mode stops at the first failure and unwinds the
//! completed prefix; parallel mode drives every step to completion and
//! unwinds exactly the succeeded subset when any step failed.

use arbor_common::{ArborError, Result};
use tracing::warn;

/// Execution state of one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepState {
    /// Not yet run.
    Idle,
    /// Action completed.
    Success,
    /// Action failed.
    Failed,
}

type StepFn<C> = Box<dyn FnMut(&mut C) -> Result<()> + Send>;

/// One transactional step: an action and its compensating rollback.
pub struct TxStep<C> {
    name: &'static str,
    action: StepFn<C>,
    rollback: Option<StepFn<C>>,
    state: StepState,
}

impl<C> TxStep<C> {
    /// Current state of this step.
    pub fn state(&self) -> StepState {
        self.state
    }

    /// Step name, for diagnostics.
    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// An ordered collection of steps over a shared mutable context.
pub struct Transaction<C> {
    steps: Vec<TxStep<C>>,
}

impl<C> Default for Transaction<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> Transaction<C> {
    /// Creates an empty transaction.
    pub fn new() -> Self {
        Self { steps: Vec::new() }
    }

    /// Number of queued steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Returns true when no steps are queued.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Queues a step with a rollback.
    pub fn step(
        &mut self,
        name: &'static str,
        action: impl FnMut(&mut C) -> Result<()> + Send + 'static,
        rollback: impl FnMut(&mut C) -> Result<()> + Send + 'static,
    ) {
        self.steps.push(TxStep {
            name,
            action: Box::new(action),
            rollback: Some(Box::new(rollback)),
            state: StepState::Idle,
        });
    }

    /// Queues a step without a rollback (an action whose effect is benign
    /// to keep, such as returning space to the allocator).
    pub fn step_no_rollback(
        &mut self,
        name: &'static str,
        action: impl FnMut(&mut C) -> Result<()> + Send + 'static,
    ) {
        self.steps.push(TxStep {
            name,
            action: Box::new(action),
            rollback: None,
            state: StepState::Idle,
        });
    }

    /// Runs the steps in order, stopping at the first failure and rolling
    /// back the completed prefix in reverse order.
    pub fn run_sequential(mut self, ctx: &mut C) -> Result<()> {
        let mut failure: Option<(usize, ArborError)> = None;
        for (i, step) in self.steps.iter_mut().enumerate() {
            match (step.action)(ctx) {
                Ok(()) => step.state = StepState::Success,
                Err(err) => {
                    step.state = StepState::Failed;
                    failure = Some((i, err));
                    break;
                }
            }
        }

        match failure {
            None => Ok(()),
            Some((failed_at, err)) => {
                warn!(step = self.steps[failed_at].name(), "transaction step failed, rolling back");
                Err(Self::unwind(&mut self.steps, ctx, err))
            }
        }
    }

    /// Runs every step regardless of individual failures, then rolls back
    /// the succeeded subset when any step failed. The first failure is the
    /// reported error.
    pub fn run_parallel(mut self, ctx: &mut C) -> Result<()> {
        let mut first_failure: Option<ArborError> = None;
        for step in self.steps.iter_mut() {
            match (step.action)(ctx) {
                Ok(()) => step.state = StepState::Success,
                Err(err) => {
                    step.state = StepState::Failed;
                    if first_failure.is_none() {
                        first_failure = Some(err);
                    }
                }
            }
        }

        match first_failure {
            None => Ok(()),
            Some(err) => {
                warn!("parallel transaction failed, rolling back succeeded steps");
                Err(Self::unwind(&mut self.steps, ctx, err))
            }
        }
    }

    /// Rolls back every succeeded step in reverse order. A rollback failure
    /// attaches to the originating error.
    fn unwind(steps: &mut [TxStep<C>], ctx: &mut C, original: ArborError) -> ArborError {
        let mut error = original;
        for step in steps.iter_mut().rev() {
            if step.state != StepState::Success {
                continue;
            }
            if let Some(rollback) = step.rollback.as_mut() {
                if let Err(rollback_err) = rollback(ctx) {
                    warn!(step = step.name, "rollback failed");
                    error = error.with_rollback_failure(rollback_err);
                }
            }
        }
        error
    }
}
