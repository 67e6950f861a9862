//! # Ayatori (綾取り)
//!
//! A process engine that runs named, resumable steps either as a
//! dependency-graph [`Workflow`] or as a condition-driven [`StateMachine`].
//!
//! Both modes share one engine that manages the step lifecycle
//! (`init` → `execute` ⟲ `retry` → `success` / `rollback` + `failure`),
//! cancellation, early stop, and live condition updates.
//!
//! ## Workflow
//!
//! ```rust
//! use ayatori::prelude::*;
//! use serde_json::json;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), ProcessError> {
//! let workflow = Workflow::builder("report")
//!     .step(step("users", |_ctx, _props| async { Ok(json!(12)) }).build()?)
//!     .step(step("orders", |_ctx, _props| async { Ok(json!(40)) }).build()?)
//!     .step(step("summary", |ctx, _props| async move {
//!         let users = ctx.result("users").and_then(|v| v.as_i64()).unwrap_or(0);
//!         let orders = ctx.result("orders").and_then(|v| v.as_i64()).unwrap_or(0);
//!         Ok(json!({ "users": users, "orders": orders }))
//!     }).build()?)
//!     .depends_on("summary", ["users", "orders"])
//!     .build()?;
//!
//! let results = workflow.dispatch(vec![]).await?;
//! assert_eq!(results.get("summary"), Some(&json!({ "users": 12, "orders": 40 })));
//! # Ok(())
//! # }
//! ```
//!
//! ## State machine
//!
//! ```rust
//! use ayatori::prelude::*;
//! use serde_json::{json, Map};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), ProcessError> {
//! let machine = StateMachine::builder("review")
//!     .step(step("draft", |_ctx, _props| async { Ok(json!("written")) }).build()?)
//!     .step(step("publish", |_ctx, _props| async { Ok(json!("live")) }).build()?)
//!     .transition(("draft", "publish", "approved"))
//!     .build()?;
//!
//! let handle = machine.start();
//!
//! // Approval may arrive before or after `draft` finishes.
//! let mut approval = Map::new();
//! approval.insert("approved".into(), json!(true));
//! handle.update(approval);
//!
//! let results = handle.await?;
//! assert_eq!(results.get("publish"), Some(&json!("live")));
//! # Ok(())
//! # }
//! ```
//!
//! ## Error Handling
//!
//! A step whose `retry` refuses fails the run: every started step is rolled
//! back, every step's `failure` hook runs, and the handle resolves to
//! [`ProcessError::StepFailed`]. Cancelling resolves it to
//! [`ProcessError::Cancelled`] right away.
//!
//! ```rust
//! use ayatori::prelude::*;
//!
//! fn describe(error: &ProcessError) -> String {
//!     match error {
//!         ProcessError::StepFailed { step, completed, .. } => {
//!             format!("{} failed after {:?}", step, completed)
//!         }
//!         ProcessError::Cancelled { running, .. } => {
//!             format!("cancelled while running {:?}", running)
//!         }
//!         _ => error.to_string(),
//!     }
//! }
//! ```

mod engine;
mod handle;
mod predicate;
mod state_machine;
mod workflow;

// Re-export core types
pub use ayatori_core::*;

pub use engine::Process;
pub use handle::ExecutionHandle;
pub use predicate::Predicate;
pub use state_machine::{StateMachine, StateMachineBuilder, Transition, TransitionGraph};
pub use workflow::{Dependencies, DependencyGraph, Workflow, WorkflowBuilder};

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::{
        step, Context, Dependencies, ExecutionHandle, Predicate, ProcessError, Properties,
        Results, RetryPolicy, Severity, StateMachine, Step, StepBuilder, StepError, StepName,
        Steps, Transition, Workflow,
    };
}
