//! Process engine: drives one run of a step collection under a strategy.

use crate::handle::ExecutionHandle;
use ayatori_core::{
    Advance, Context, Control, ProcessError, Recorder, Signal, Step, StepError, StepName, Steps,
    Strategy,
};
use futures::future::join_all;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// A named step collection bound to a [`Strategy`].
///
/// [`Workflow`](crate::Workflow) and [`StateMachine`](crate::StateMachine)
/// wrap a `Process` with their own strategy; custom strategies can be run
/// directly.
pub struct Process<S> {
    name: Arc<str>,
    steps: Steps,
    strategy: Arc<S>,
}

impl<S> Clone for Process<S> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            steps: self.steps.clone(),
            strategy: self.strategy.clone(),
        }
    }
}

impl<S> fmt::Debug for Process<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Process")
            .field("name", &self.name)
            .field("steps", &self.steps)
            .finish()
    }
}

impl<S: Strategy> Process<S> {
    /// Binds `steps` to `strategy` under `name`.
    pub fn new(name: impl Into<String>, steps: Steps, strategy: S) -> Self {
        let name: String = name.into();
        Self {
            name: name.into(),
            steps,
            strategy: Arc::new(strategy),
        }
    }

    /// The process name carried by every error of its runs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The steps every run draws from.
    pub fn steps(&self) -> &Steps {
        &self.steps
    }

    /// The strategy deciding which steps run.
    pub fn strategy(&self) -> &S {
        &self.strategy
    }

    /// Starts one run and returns its handle.
    ///
    /// The run is driven by a task spawned on the current Tokio runtime, so
    /// this must be called from within one.
    pub fn dispatch(
        &self,
        args: Vec<Value>,
        conditions: Map<String, Value>,
        start: Option<StepName>,
    ) -> ExecutionHandle {
        let (
            ctx,
            Control {
                signals,
                outcome,
                recorder,
            },
        ) = Context::open(self.name.as_ref(), args, conditions);
        let (reports_tx, reports) = mpsc::unbounded_channel();
        let (detach, detached) = oneshot::channel();
        let driver = Driver {
            process: self.name.clone(),
            steps: self.steps.clone(),
            strategy: self.strategy.clone(),
            ctx: ctx.clone(),
            recorder,
            signals,
            reports,
            reports_tx,
            detached,
            handle_dropped: false,
            in_flight: 0,
            pending: Vec::new(),
        };
        tokio::spawn(driver.run(start));
        ExecutionHandle::new(ctx, outcome, detach)
    }
}

/// Final word from a step task.
#[derive(Debug)]
enum Report {
    Completed { name: StepName, value: Value },
    Failed { name: StepName, error: StepError },
    /// The step stopped retrying because the run was stopped or settled.
    Abandoned { name: StepName },
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Exit,
}

/// Owns the run's bookkeeping; the only writer of results, started and
/// completed.
struct Driver<S> {
    process: Arc<str>,
    steps: Steps,
    strategy: Arc<S>,
    ctx: Context,
    recorder: Recorder,
    signals: mpsc::UnboundedReceiver<Signal>,
    reports: mpsc::UnboundedReceiver<Report>,
    reports_tx: mpsc::UnboundedSender<Report>,
    /// Resolves once the [`ExecutionHandle`] is dropped.
    detached: oneshot::Receiver<()>,
    handle_dropped: bool,
    in_flight: usize,
    /// Completed steps whose transition decision is waiting on conditions.
    pending: Vec<StepName>,
}

impl<S: Strategy> Driver<S> {
    async fn run(mut self, start: Option<StepName>) {
        info!(process = %self.process, steps = self.steps.len(), "process_started");

        let initial = self.strategy.initial(&self.steps, start.as_ref());
        self.schedule(initial);

        loop {
            if self.ctx.is_settled() {
                return;
            }
            if self.in_flight == 0 {
                if self.ctx.is_stopped() || self.pending.is_empty() {
                    self.finish_success().await;
                    return;
                }
                if self.is_orphaned() {
                    debug!(process = %self.process, pending = ?self.pending, "pending run has no handle or context left");
                    return;
                }
                debug!(process = %self.process, pending = ?self.pending, "awaiting update");
            }

            tokio::select! {
                Some(report) = self.reports.recv() => {
                    if self.on_report(report).await == Flow::Exit {
                        return;
                    }
                }
                Some(signal) = self.signals.recv() => self.on_signal(signal),
                _ = &mut self.detached, if !self.handle_dropped => self.handle_dropped = true,
                else => return,
            }
        }
    }

    /// Nobody can update or observe the run any more: the handle is gone
    /// and the driver holds the only context.
    fn is_orphaned(&self) -> bool {
        self.handle_dropped && self.recorder.live_contexts() <= 1
    }

    /// Whether a stopped run may settle after `name` reported.
    ///
    /// A stop requested by steps waits for those steps' own reports so their
    /// results are kept. An outside stop settles on the next report.
    fn stop_reached(&self, name: &StepName) -> bool {
        self.in_flight == 0
            || !self.recorder.stopped_by_step()
            || self.recorder.stop_requested_by(name.as_str())
    }

    fn schedule(&mut self, names: Vec<StepName>) {
        for name in names {
            if self.ctx.is_cancelled() || self.ctx.is_stopped() {
                break;
            }
            let Some(step) = self.steps.get(name.as_str()).cloned() else {
                warn!(process = %self.process, step = %name, "step not found in process");
                continue;
            };

            self.recorder.record_start(&name);
            self.in_flight += 1;
            info!(process = %self.process, step = %name, "step_started");

            let ctx = self.recorder.context_for(&name);
            let reports = self.reports_tx.clone();
            tokio::spawn(async move {
                let report = run_step(step, &ctx).await;
                drop(ctx);
                // The driver is gone once the run has settled.
                let _ = reports.send(report);
            });
        }
    }

    async fn on_report(&mut self, report: Report) -> Flow {
        self.in_flight = self.in_flight.saturating_sub(1);
        if self.ctx.is_settled() {
            return Flow::Exit;
        }

        match report {
            Report::Completed { name, value } => {
                self.recorder.record_completion(&name, value);
                info!(process = %self.process, step = %name, "step_completed");

                if self.ctx.is_stopped() {
                    if self.stop_reached(&name) {
                        self.finish_success().await;
                        return Flow::Exit;
                    }
                    return Flow::Continue;
                }

                let state = self.ctx.snapshot();
                match self.strategy.next(&self.steps, &state, &name) {
                    Advance::Run(next) => self.schedule(next),
                    Advance::Await => {
                        info!(process = %self.process, step = %name, "process_pending");
                        self.pending.push(name);
                    }
                    Advance::Finish => {}
                }
                Flow::Continue
            }
            Report::Failed { name, error } => {
                self.finish_failure(name, error).await;
                Flow::Exit
            }
            Report::Abandoned { name } => {
                debug!(process = %self.process, step = %name, "step abandoned");
                if self.ctx.is_stopped() && self.stop_reached(&name) {
                    self.finish_success().await;
                    return Flow::Exit;
                }
                Flow::Continue
            }
        }
    }

    fn on_signal(&mut self, signal: Signal) {
        match signal {
            Signal::Update => self.reevaluate(),
            // Stop and cancel are read from the context's flags at the top of
            // the loop.
            Signal::Stop | Signal::Cancel => {}
        }
    }

    /// Re-asks the strategy about every pending step with the refreshed
    /// conditions.
    fn reevaluate(&mut self) {
        if self.pending.is_empty() || self.ctx.is_stopped() || self.ctx.is_settled() {
            return;
        }
        let state = self.ctx.snapshot();
        for from in std::mem::take(&mut self.pending) {
            match self.strategy.next(&self.steps, &state, &from) {
                Advance::Run(next) => {
                    debug!(process = %self.process, step = %from, next = ?next, "pending transition resolved");
                    self.schedule(next);
                }
                Advance::Await => self.pending.push(from),
                Advance::Finish => {}
            }
        }
    }

    async fn finish_success(&self) {
        if self.ctx.is_settled() {
            return;
        }
        let ctx = &self.ctx;
        join_all(self.steps.iter().map(|step| async move {
            if let Err(e) = step.success(ctx).await {
                warn!(process = ctx.process(), step = %step.name(), error = %e, "success hook failed");
            }
        }))
        .await;

        let stopped = ctx.is_stopped();
        if self.recorder.settle(Ok(ctx.results())) {
            if stopped {
                info!(process = %self.process, "process_stopped");
            } else {
                info!(process = %self.process, "process_completed");
            }
        }
    }

    /// Rolls back every started step, notifies every step, then rejects.
    async fn finish_failure(&self, step: StepName, error: StepError) {
        let state = self.ctx.snapshot();
        let failure = ProcessError::StepFailed {
            process: self.process.to_string(),
            step,
            running: state.running(),
            completed: state.completed.clone(),
            error,
        };
        error!(process = %self.process, error = %failure, "process_failed");

        let ctx = &self.ctx;
        let failure_ref = &failure;
        join_all(
            state
                .started
                .iter()
                .filter_map(|name| self.steps.get(name.as_str()))
                .map(|step| async move {
                    if let Err(e) = step.rollback(ctx, failure_ref).await {
                        warn!(process = ctx.process(), step = %step.name(), error = %e, "rollback hook failed");
                    }
                }),
        )
        .await;
        join_all(self.steps.iter().map(|step| async move {
            if let Err(e) = step.failure(ctx, failure_ref).await {
                warn!(process = ctx.process(), step = %step.name(), error = %e, "failure hook failed");
            }
        }))
        .await;

        self.recorder.settle(Err(failure));
    }
}

/// Runs `init` once, then `execute` until it succeeds or `retry` refuses.
async fn run_step(step: Arc<dyn Step>, ctx: &Context) -> Report {
    let name = step.name();
    if let Err(error) = step.init(ctx).await {
        warn!(process = ctx.process(), step = %name, error = %error, "step init failed");
        return Report::Failed { name, error };
    }

    let mut attempt: u32 = 1;
    loop {
        match step.execute(ctx).await {
            Ok(value) => return Report::Completed { name, value },
            Err(error) => {
                warn!(process = ctx.process(), step = %name, attempt, error = %error, "step_failed");
                if ctx.is_stopped() || ctx.is_settled() {
                    return Report::Abandoned { name };
                }
                if let Err(error) = step.retry(ctx, error).await {
                    return Report::Failed { name, error };
                }
                if ctx.is_stopped() || ctx.is_settled() {
                    return Report::Abandoned { name };
                }
                attempt += 1;
            }
        }
    }
}
