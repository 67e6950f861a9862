//! Per-run execution context.
//!
//! A [`Context`] is created fresh for every dispatch and handed to each
//! lifecycle call. It is a cheap, cloneable handle: every clone observes and
//! controls the same run.

use crate::error::ProcessError;
use crate::step::StepName;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, oneshot};
use tracing::info;

/// Step results keyed by step name.
pub type Results = HashMap<StepName, Value>;

/// The settled outcome of a run.
pub type Outcome = Result<Results, ProcessError>;

/// Control requests forwarded from a [`Context`] to the engine driving it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Finish successfully once the current attempt completes.
    Stop,
    /// Conditions changed; re-evaluate pending transitions.
    Update,
    /// The run was cancelled and has already been settled.
    Cancel,
}

/// The mutable bookkeeping of one run.
///
/// Invariant: every name in `completed` is also in `started`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunState {
    /// Arguments passed to dispatch.
    pub args: Vec<Value>,
    /// Conditions consulted by transition predicates.
    pub conditions: Map<String, Value>,
    /// Resolved `execute` values keyed by step name.
    pub results: Results,
    /// Steps that have begun, in start order.
    pub started: Vec<StepName>,
    /// Steps whose final `execute` attempt succeeded, in completion order.
    pub completed: Vec<StepName>,
}

impl RunState {
    /// Returns `true` if `name` has begun at least once in this run.
    pub fn is_started(&self, name: &str) -> bool {
        self.started.iter().any(|s| s.as_str() == name)
    }

    /// Returns `true` if the latest entry of `name` completed.
    pub fn is_completed(&self, name: &str) -> bool {
        self.completed.iter().any(|s| s.as_str() == name)
    }

    /// Steps that have started but not completed.
    pub fn running(&self) -> Vec<StepName> {
        self.started
            .iter()
            .filter(|s| !self.is_completed(s.as_str()))
            .cloned()
            .collect()
    }
}

/// The engine's side of a freshly opened [`Context`].
///
/// Only the party that called [`Context::open`] holds these, so only it can
/// record progress and deliver the outcome.
#[derive(Debug)]
pub struct Control {
    /// Stop/update/cancel requests, consumed by the driver loop.
    pub signals: mpsc::UnboundedReceiver<Signal>,
    /// Delivers the run's outcome exactly once.
    pub outcome: oneshot::Receiver<Outcome>,
    /// Writes the run's bookkeeping.
    pub recorder: Recorder,
}

struct Inner {
    process: String,
    state: Mutex<RunState>,
    stopped: AtomicBool,
    /// Steps whose own context asked the run to stop.
    stopped_by: Mutex<Vec<StepName>>,
    cancelled: AtomicBool,
    settle: Mutex<Option<oneshot::Sender<Outcome>>>,
    signals: mpsc::UnboundedSender<Signal>,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn settle(&self, outcome: Outcome) -> bool {
        let sender = self
            .settle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match sender {
            Some(tx) => {
                // The receiver may be gone if the handle was dropped.
                let _ = tx.send(outcome);
                true
            }
            None => false,
        }
    }
}

/// Execution context shared by every step of one run.
///
/// Steps read `args`, `conditions` and `results` through it and may steer
/// the run with [`stop`](Context::stop), [`update`](Context::update) and
/// [`cancel`](Context::cancel). The bookkeeping itself is read-only here;
/// only the engine's [`Recorder`] writes it.
///
/// # Examples
///
/// ```
/// use ayatori_core::Context;
/// use serde_json::{json, Map};
///
/// let (ctx, _control) = Context::open("demo", vec![json!(42)], Map::new());
///
/// assert_eq!(ctx.arg(0), Some(json!(42)));
///
/// let mut conditions = Map::new();
/// conditions.insert("approved".into(), json!(true));
/// ctx.update(conditions);
/// assert_eq!(ctx.condition("approved"), Some(json!(true)));
/// ```
#[derive(Clone)]
pub struct Context {
    inner: Arc<Inner>,
    step: Option<StepName>,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state();
        f.debug_struct("Context")
            .field("process", &self.inner.process)
            .field("step", &self.step)
            .field("started", &state.started)
            .field("completed", &state.completed)
            .field("stopped", &self.is_stopped())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl Context {
    /// Opens a fresh context for one run of `process`.
    ///
    /// The returned [`Control`] belongs to whoever drives the run.
    pub fn open(
        process: impl Into<String>,
        args: Vec<Value>,
        conditions: Map<String, Value>,
    ) -> (Self, Control) {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let inner = Arc::new(Inner {
            process: process.into(),
            state: Mutex::new(RunState {
                args,
                conditions,
                ..RunState::default()
            }),
            stopped: AtomicBool::new(false),
            stopped_by: Mutex::new(Vec::new()),
            cancelled: AtomicBool::new(false),
            settle: Mutex::new(Some(outcome_tx)),
            signals: signal_tx,
        });
        let control = Control {
            signals: signal_rx,
            outcome: outcome_rx,
            recorder: Recorder {
                inner: inner.clone(),
            },
        };
        (Self { inner, step: None }, control)
    }

    fn state(&self) -> MutexGuard<'_, RunState> {
        self.inner.state()
    }

    /// Name of the process this run belongs to.
    pub fn process(&self) -> &str {
        &self.inner.process
    }

    /// The step this context was handed to, if any. Contexts held by the
    /// caller or by run-wide hook sweeps have none.
    pub fn step(&self) -> Option<&StepName> {
        self.step.as_ref()
    }

    /// Returns all positional dispatch arguments.
    pub fn args(&self) -> Vec<Value> {
        self.state().args.clone()
    }

    /// Returns the positional dispatch argument at `index`.
    pub fn arg(&self, index: usize) -> Option<Value> {
        self.state().args.get(index).cloned()
    }

    /// Returns a copy of the current conditions.
    pub fn conditions(&self) -> Map<String, Value> {
        self.state().conditions.clone()
    }

    /// Returns the condition stored under `key`.
    pub fn condition(&self, key: &str) -> Option<Value> {
        self.state().conditions.get(key).cloned()
    }

    /// Returns a copy of every result recorded so far.
    pub fn results(&self) -> Results {
        self.state().results.clone()
    }

    /// Returns the value a completed step produced.
    pub fn result(&self, step: &str) -> Option<Value> {
        self.state().results.get(step).cloned()
    }

    /// Steps that have begun, in start order.
    pub fn started(&self) -> Vec<StepName> {
        self.state().started.clone()
    }

    /// Steps that have completed, in completion order.
    pub fn completed(&self) -> Vec<StepName> {
        self.state().completed.clone()
    }

    /// Steps that have started but not completed.
    pub fn running(&self) -> Vec<StepName> {
        self.state().running()
    }

    /// Returns a copy of the run's bookkeeping.
    pub fn snapshot(&self) -> RunState {
        self.state().clone()
    }

    /// Returns `true` once [`stop`](Context::stop) was called.
    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Returns `true` once [`cancel`](Context::cancel) was called.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Returns `true` once an outcome has been delivered.
    pub fn is_settled(&self) -> bool {
        self.inner
            .settle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    /// Merges `conditions` into the run's conditions and asks the engine to
    /// re-evaluate any pending transition.
    pub fn update(&self, conditions: Map<String, Value>) {
        self.state().conditions.extend(conditions);
        let _ = self.inner.signals.send(Signal::Update);
    }

    /// Ends the run successfully with the results gathered so far.
    ///
    /// Called from inside `execute`, the run finishes as soon as the current
    /// attempt of the calling step completes, and that step's result is
    /// kept. No further steps are selected.
    pub fn stop(&self) {
        if let Some(step) = &self.step {
            let mut stopped_by = self
                .inner
                .stopped_by
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if !stopped_by.contains(step) {
                stopped_by.push(step.clone());
            }
        }
        if !self.inner.stopped.swap(true, Ordering::SeqCst) {
            let _ = self.inner.signals.send(Signal::Stop);
        }
    }

    /// Rejects the run immediately with a cancellation error carrying `data`.
    ///
    /// Steps already in flight are not interrupted, but no further steps are
    /// started.
    pub fn cancel(&self, data: Map<String, Value>) {
        if self.inner.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        let error = {
            let state = self.state();
            ProcessError::cancelled(
                self.inner.process.clone(),
                state.running(),
                state.completed.clone(),
                data,
            )
        };
        if self.inner.settle(Err(error)) {
            info!(process = %self.inner.process, "process_cancelled");
        }
        let _ = self.inner.signals.send(Signal::Cancel);
    }
}

/// Engine-only writer of a run's bookkeeping.
///
/// Handed out once by [`Context::open`] as part of [`Control`]; steps never
/// see it.
pub struct Recorder {
    inner: Arc<Inner>,
}

impl fmt::Debug for Recorder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Recorder")
            .field("process", &self.inner.process)
            .finish_non_exhaustive()
    }
}

impl Recorder {
    /// A run-wide context, as handed to hook sweeps.
    pub fn context(&self) -> Context {
        Context {
            inner: self.inner.clone(),
            step: None,
        }
    }

    /// A context for one step, so that its `stop()` calls can be traced
    /// back to it.
    pub fn context_for(&self, step: &StepName) -> Context {
        Context {
            inner: self.inner.clone(),
            step: Some(step.clone()),
        }
    }

    /// Marks `name` as started. A re-entered step leaves `completed` until it
    /// finishes again.
    pub fn record_start(&self, name: &StepName) {
        let mut state = self.inner.state();
        state.completed.retain(|s| s != name);
        if !state.is_started(name.as_str()) {
            state.started.push(name.clone());
        }
    }

    /// Stores the value of a finished step and marks it completed.
    pub fn record_completion(&self, name: &StepName, value: Value) {
        let mut state = self.inner.state();
        state.results.insert(name.clone(), value);
        if !state.is_started(name.as_str()) {
            state.started.push(name.clone());
        }
        if !state.is_completed(name.as_str()) {
            state.completed.push(name.clone());
        }
    }

    /// Returns `true` if `step` itself asked the run to stop.
    pub fn stop_requested_by(&self, step: &str) -> bool {
        self.inner
            .stopped_by
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|s| s.as_str() == step)
    }

    /// Returns `true` if any step, as opposed to an outside caller, asked
    /// the run to stop.
    pub fn stopped_by_step(&self) -> bool {
        !self
            .inner
            .stopped_by
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }

    /// Number of [`Context`] clones of this run still alive.
    pub fn live_contexts(&self) -> usize {
        Arc::strong_count(&self.inner).saturating_sub(1)
    }

    /// Delivers the run's outcome. Returns `false` if one was already
    /// delivered.
    pub fn settle(&self, outcome: Outcome) -> bool {
        self.inner.settle(outcome)
    }
}
