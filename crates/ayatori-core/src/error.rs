//! Error taxonomy for step and process failures.

use crate::step::StepName;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

/// How serious a failure is.
///
/// Attached to every [`StepError`] so observers (failure hooks, telemetry
/// sinks) can decide whether a failure is worth escalating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// The failure may be retried or ignored by the caller.
    #[default]
    Recoverable,
    /// The failure should not be retried.
    Fatal,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Recoverable => write!(f, "recoverable"),
            Severity::Fatal => write!(f, "fatal"),
        }
    }
}

/// A failure raised by a step lifecycle method, decorated with a severity
/// and arbitrary key/value data.
///
/// # Examples
///
/// ```
/// use ayatori_core::{Severity, StepError};
/// use serde_json::json;
///
/// let error = StepError::new("upstream unavailable")
///     .with("status", json!(503))
///     .with_severity(Severity::Fatal);
///
/// assert_eq!(error.message(), "upstream unavailable");
/// assert_eq!(error.get("status"), Some(&json!(503)));
/// assert_eq!(error.severity(), Severity::Fatal);
/// ```
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{message}")]
pub struct StepError {
    message: String,
    severity: Severity,
    data: Map<String, Value>,
}

impl StepError {
    /// Creates a recoverable error with the given message and no data.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            severity: Severity::default(),
            data: Map::new(),
        }
    }

    /// Stamps a single key/value pair onto the error.
    pub fn with(mut self, key: impl Into<String>, value: Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    /// Merges every entry of `data` onto the error.
    ///
    /// A `"severity"` entry that names a known [`Severity`] also replaces the
    /// error's severity.
    pub fn with_data(mut self, data: Map<String, Value>) -> Self {
        if let Some(severity) = data
            .get("severity")
            .and_then(|v| serde_json::from_value::<Severity>(v.clone()).ok())
        {
            self.severity = severity;
        }
        self.data.extend(data);
        self
    }

    /// Replaces the severity.
    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    /// The undecorated error message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// How serious the failure is.
    pub fn severity(&self) -> Severity {
        self.severity
    }

    /// Returns a decorated value by key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// Every decoration stamped onto the error.
    pub fn data(&self) -> &Map<String, Value> {
        &self.data
    }
}

impl From<&str> for StepError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<String> for StepError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

/// Errors that terminate a process run or reject its configuration.
///
/// Run-level variants carry the process name together with the steps that
/// were still running and those that had completed when the run ended.
///
/// # Non-Exhaustive
///
/// Always include a wildcard arm when matching:
///
/// ```
/// use ayatori_core::ProcessError;
///
/// fn report(error: &ProcessError) {
///     match error {
///         ProcessError::StepFailed { step, error, .. } => {
///             eprintln!("step {} failed: {}", step, error);
///         }
///         ProcessError::Cancelled { running, .. } => {
///             eprintln!("cancelled while {:?} were running", running);
///         }
///         _ => eprintln!("{}", error),
///     }
/// }
/// ```
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ProcessError {
    /// A step failed and its `retry` hook declined to try again.
    #[error("Process '{process}' failed in step '{step}': {error}")]
    StepFailed {
        /// Name of the failed process.
        process: String,
        /// The step whose failure ended the run.
        step: StepName,
        /// Steps started but not completed at the time of failure.
        running: Vec<StepName>,
        /// Steps completed before the failure.
        completed: Vec<StepName>,
        /// The error the step gave up with.
        #[source]
        error: StepError,
    },

    /// The run was cancelled through its context or handle.
    #[error("{error}")]
    Cancelled {
        /// Name of the cancelled process.
        process: String,
        /// Steps still in flight when the run was cancelled.
        running: Vec<StepName>,
        /// Steps completed before the cancellation.
        completed: Vec<StepName>,
        /// Carries [`CANCELLED_MESSAGE`] and the caller's data.
        error: StepError,
    },

    /// A builder was given inconsistent input.
    #[error("Invalid process configuration: {0}")]
    Configuration(String),

    /// The run's driver went away without delivering an outcome.
    #[error("Process '{process}' ended without an outcome")]
    Abandoned {
        /// Name of the abandoned process.
        process: String,
    },
}

/// Message carried by every cancellation error.
pub const CANCELLED_MESSAGE: &str = "Process cancelled.";

impl ProcessError {
    /// Builds the cancellation error for a run, merging caller data over a
    /// recoverable default.
    pub fn cancelled(
        process: impl Into<String>,
        running: Vec<StepName>,
        completed: Vec<StepName>,
        data: Map<String, Value>,
    ) -> Self {
        ProcessError::Cancelled {
            process: process.into(),
            running,
            completed,
            error: StepError::new(CANCELLED_MESSAGE)
                .with_severity(Severity::Recoverable)
                .with_data(data),
        }
    }

    /// Name of the process this error belongs to, if run-level.
    pub fn process(&self) -> Option<&str> {
        match self {
            ProcessError::StepFailed { process, .. }
            | ProcessError::Cancelled { process, .. }
            | ProcessError::Abandoned { process } => Some(process),
            ProcessError::Configuration(_) => None,
        }
    }

    /// The step whose failure ended the run.
    pub fn step(&self) -> Option<&StepName> {
        match self {
            ProcessError::StepFailed { step, .. } => Some(step),
            _ => None,
        }
    }

    /// Steps that had started but not completed when the run ended.
    pub fn running(&self) -> &[StepName] {
        match self {
            ProcessError::StepFailed { running, .. } | ProcessError::Cancelled { running, .. } => {
                running
            }
            _ => &[],
        }
    }

    /// Steps that had completed when the run ended.
    pub fn completed(&self) -> &[StepName] {
        match self {
            ProcessError::StepFailed { completed, .. }
            | ProcessError::Cancelled { completed, .. } => completed,
            _ => &[],
        }
    }

    /// The underlying decorated error, for run-level variants.
    pub fn source_error(&self) -> Option<&StepError> {
        match self {
            ProcessError::StepFailed { error, .. } | ProcessError::Cancelled { error, .. } => {
                Some(error)
            }
            _ => None,
        }
    }

    /// The message of the underlying failure, without process decoration.
    pub fn message(&self) -> String {
        match self.source_error() {
            Some(error) => error.message().to_string(),
            None => self.to_string(),
        }
    }

    /// Severity of the underlying failure. Configuration errors are always fatal.
    pub fn severity(&self) -> Severity {
        match self {
            ProcessError::Configuration(_) => Severity::Fatal,
            _ => self
                .source_error()
                .map(StepError::severity)
                .unwrap_or_default(),
        }
    }

    /// Looks up decorated data on the underlying error.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.source_error().and_then(|e| e.get(key))
    }

    /// Returns `true` for [`ProcessError::Cancelled`].
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ProcessError::Cancelled { .. })
    }
}
