//! Handle to a run in flight.

use ayatori_core::{Context, Outcome, ProcessError};
use serde_json::{Map, Value};
use std::future::Future;
use std::pin::Pin;
use std::task::{Poll, Context as TaskContext};
use tokio::sync::oneshot;

/// The value returned by a dispatch.
///
/// Awaiting the handle yields the run's results, or the [`ProcessError`]
/// that ended it. The control methods act on the same run as the
/// [`Context`] its steps receive, so callers can steer a run from outside.
///
/// Dropping the handle does not stop the run. A run left pending with no
/// step in flight, no handle and no other [`Context`] clone can never be
/// resumed, so the engine ends it quietly.
#[must_use = "a dispatched run keeps going; await the handle to observe its outcome"]
#[derive(Debug)]
pub struct ExecutionHandle {
    context: Context,
    outcome: oneshot::Receiver<Outcome>,
    // Dropped after `context`, telling the driver the handle is gone.
    _detach: oneshot::Sender<()>,
}

impl ExecutionHandle {
    pub(crate) fn new(
        context: Context,
        outcome: oneshot::Receiver<Outcome>,
        detach: oneshot::Sender<()>,
    ) -> Self {
        Self {
            context,
            outcome,
            _detach: detach,
        }
    }

    /// The run's context.
    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Rejects the run immediately with a cancellation error carrying
    /// `data`. See [`Context::cancel`].
    pub fn cancel(&self, data: Map<String, Value>) {
        self.context.cancel(data);
    }

    /// Ends the run successfully. See [`Context::stop`].
    pub fn stop(&self) {
        self.context.stop();
    }

    /// Merges conditions and re-evaluates pending transitions. See
    /// [`Context::update`].
    pub fn update(&self, conditions: Map<String, Value>) {
        self.context.update(conditions);
    }

    /// Returns `true` once the outcome is available.
    pub fn is_settled(&self) -> bool {
        self.context.is_settled()
    }

    /// Waits for the run's outcome.
    pub async fn wait(self) -> Outcome {
        self.await
    }
}

impl Future for ExecutionHandle {
    type Output = Outcome;

    fn poll(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.outcome).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(_)) => Poll::Ready(Err(ProcessError::Abandoned {
                process: this.context.process().to_string(),
            })),
            Poll::Pending => Poll::Pending,
        }
    }
}
