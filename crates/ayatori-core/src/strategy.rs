//! The seam between the process engine and its step-selection logic.

use crate::collection::Steps;
use crate::context::RunState;
use crate::step::StepName;

/// What the engine should do after a step completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Advance {
    /// Start these steps, in order, without waiting for each other. An empty
    /// list means nothing new is eligible right now.
    Run(Vec<StepName>),
    /// Nothing is eligible yet, but a later condition update may change
    /// that. The engine re-asks on every update.
    Await,
    /// This path of the process is finished.
    Finish,
}

impl Advance {
    /// Turns an eligibility list into a decision, finishing when it is empty.
    pub fn from_eligible(names: Vec<StepName>) -> Self {
        if names.is_empty() {
            Advance::Finish
        } else {
            Advance::Run(names)
        }
    }
}

/// Decides which steps run first and which run after each completion.
///
/// Strategies are pure decision functions: they never mutate the run and
/// are consulted only by the engine's driver loop.
pub trait Strategy: Send + Sync + 'static {
    /// Steps to start when a run begins. `start` is the caller's requested
    /// starting step, if any.
    fn initial(&self, steps: &Steps, start: Option<&StepName>) -> Vec<StepName>;

    /// Decision after `finished` completed, judged against the run's current
    /// bookkeeping and conditions.
    fn next(&self, steps: &Steps, state: &RunState, finished: &StepName) -> Advance;
}
