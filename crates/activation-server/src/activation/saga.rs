//! Ordered steps with compensating actions.
//!
//! Steps run in order against a shared context. When a step fails, its own
//! compensation (and only its own) runs, and the saga stops. A step that
//! cannot leave partial effects behind simply keeps the default no-op
//! compensation.

use crate::error::ActivationError;
use async_trait::async_trait;
use tracing::{debug, warn};

#[async_trait]
pub trait SagaStep<C: Send + Sync>: Send + Sync {
    fn name(&self) -> &'static str;

    async fn execute(&self, ctx: &mut C) -> Result<(), ActivationError>;

    /// Whether a failure of this step needs compensating.
    fn compensates(&self) -> bool {
        false
    }

    /// Undo the effects that make a failure of this step unsafe to leave
    /// in place.
    async fn compensate(&self, _ctx: &C) -> Result<(), ActivationError> {
        Ok(())
    }
}

/// What happened to the compensation of a failed step.
#[derive(Debug)]
pub enum Compensation {
    /// The step registers no compensation.
    NotRequired,
    Applied,
    Failed(ActivationError),
}

/// Result of running a saga.
#[derive(Debug)]
pub enum SagaOutcome {
    Completed,
    Failed {
        step: &'static str,
        error: ActivationError,
        compensation: Compensation,
    },
}

pub struct Saga<C> {
    steps: Vec<Box<dyn SagaStep<C>>>,
}

impl<C: Send + Sync> Saga<C> {
    pub fn new() -> Self {
        Self { steps: Vec::new() }
    }

    pub fn step(mut self, step: impl SagaStep<C> + 'static) -> Self {
        self.steps.push(Box::new(step));
        self
    }

    pub async fn run(&self, ctx: &mut C) -> SagaOutcome {
        for step in &self.steps {
            debug!(step = step.name(), "Running saga step");

            let error = match step.execute(ctx).await {
                Ok(()) => continue,
                Err(e) => e,
            };

            if !step.compensates() {
                return SagaOutcome::Failed {
                    step: step.name(),
                    error,
                    compensation: Compensation::NotRequired,
                };
            }

            warn!(step = step.name(), error = %error, "Saga step failed, compensating");
            let compensation = match step.compensate(ctx).await {
                Ok(()) => Compensation::Applied,
                Err(e) => Compensation::Failed(e),
            };

            return SagaOutcome::Failed {
                step: step.name(),
                error,
                compensation,
            };
        }

        SagaOutcome::Completed
    }
}

impl<C: Send + Sync> Default for Saga<C> {
    fn default() -> Self {
        Self::new()
    }
}
