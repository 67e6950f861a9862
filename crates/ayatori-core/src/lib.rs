//! Core traits and types for the ayatori process engine.
//!
//! This crate holds the pieces step authors need without pulling in the
//! engine itself.
//!
//! # Core Types
//!
//! - [`Step`] - A named unit of work with lifecycle hooks
//! - [`StepBuilder`] / [`step`] - Build a step from async closures
//! - [`Steps`] - Insertion-ordered step collection
//! - [`Context`] - Per-run state and the stop/update/cancel control surface
//! - [`StepError`] / [`ProcessError`] - Decorated step errors and run errors
//! - [`Strategy`] - Pluggable initial/next step selection

mod collection;
mod context;
mod error;
mod func;
mod retry;
mod step;
mod strategy;

pub use collection::Steps;
pub use context::{Context, Control, Outcome, Recorder, Results, RunState, Signal};
pub use error::{ProcessError, Severity, StepError, CANCELLED_MESSAGE};
pub use func::{step, FnStep, Properties, StepBuilder};
pub use retry::RetryPolicy;
pub use step::{Step, StepName};
pub use strategy::{Advance, Strategy};
