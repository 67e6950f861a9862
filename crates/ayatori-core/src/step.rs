//! Step trait and step names.

use crate::context::Context;
use crate::error::{ProcessError, StepError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::{self, Debug};

/// Type-safe step name wrapper.
///
/// Names are unique within one process; the engine keys results and the
/// started/completed bookkeeping by them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepName(String);

impl StepName {
    /// Creates a new StepName.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the step name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns `true` if the name is empty or whitespace.
    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for StepName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StepName {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for StepName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&StepName> for StepName {
    fn from(s: &StepName) -> Self {
        s.clone()
    }
}

impl AsRef<str> for StepName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::borrow::Borrow<str> for StepName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl PartialEq<str> for StepName {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for StepName {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

/// A named unit of work with lifecycle hooks.
///
/// Every hook receives the run's [`Context`] explicitly. Only [`name`] is
/// required; the remaining hooks default to no-ops, and the default
/// [`retry`] re-signals the error so a failing step ends the run.
///
/// A step value is shared by every dispatch of the process that owns it,
/// so per-run state kept on the step must be reset in [`init`].
///
/// # Examples
///
/// ```
/// use ayatori_core::{Context, Step, StepError, StepName};
/// use async_trait::async_trait;
/// use serde_json::{json, Value};
///
/// #[derive(Debug)]
/// struct LoadUser;
///
/// #[async_trait]
/// impl Step for LoadUser {
///     fn name(&self) -> StepName {
///         StepName::new("load_user")
///     }
///
///     async fn execute(&self, ctx: &Context) -> Result<Value, StepError> {
///         let id = ctx.arg(0).unwrap_or(Value::Null);
///         Ok(json!({ "id": id, "name": "Alice" }))
///     }
/// }
/// ```
///
/// [`name`]: Step::name
/// [`retry`]: Step::retry
/// [`init`]: Step::init
#[async_trait]
pub trait Step: Send + Sync + Debug {
    /// Returns the step name.
    fn name(&self) -> StepName;

    /// Called once per run, before the first `execute` attempt.
    async fn init(&self, _ctx: &Context) -> Result<(), StepError> {
        Ok(())
    }

    /// Performs the step's work. The returned value is stored in the run's
    /// results under the step's name.
    async fn execute(&self, _ctx: &Context) -> Result<Value, StepError> {
        Ok(Value::Null)
    }

    /// Decides whether a failed `execute` should run again.
    ///
    /// `Ok(())` re-invokes `execute`; an error ends the run. The engine
    /// never caps attempts, so implementations must bound themselves.
    async fn retry(&self, _ctx: &Context, error: StepError) -> Result<(), StepError> {
        Err(error)
    }

    /// Undoes the step's effects after the run failed. Called on every
    /// started step.
    async fn rollback(&self, _ctx: &Context, _error: &ProcessError) -> Result<(), StepError> {
        Ok(())
    }

    /// Called on every step in the process once a run succeeds.
    async fn success(&self, _ctx: &Context) -> Result<(), StepError> {
        Ok(())
    }

    /// Called on every step in the process once a run fails, whether or not
    /// the step was started.
    async fn failure(&self, _ctx: &Context, _error: &ProcessError) -> Result<(), StepError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug)]
    struct Noop;

    #[async_trait]
    impl Step for Noop {
        fn name(&self) -> StepName {
            StepName::new("noop")
        }
    }

    #[test]
    fn test_step_name() {
        let name = StepName::new("test");
        assert_eq!(name.as_str(), "test");
        assert_eq!(name, "test");

        let name: StepName = "test".into();
        assert_eq!(name.to_string(), "test");
        assert!(StepName::new("  ").is_empty());
    }

    #[test]
    fn test_step_name_serde() {
        let name: StepName = serde_json::from_value(json!("fetch")).expect("valid name");
        assert_eq!(name, StepName::new("fetch"));
        assert_eq!(serde_json::to_value(&name).expect("serializable"), json!("fetch"));
    }

    #[tokio::test]
    async fn test_default_hooks() {
        let (ctx, _control) = Context::open("defaults", vec![], Default::default());
        let step = Noop;

        assert!(step.init(&ctx).await.is_ok());
        assert_eq!(step.execute(&ctx).await, Ok(Value::Null));

        let error = StepError::new("nope");
        assert_eq!(step.retry(&ctx, error.clone()).await, Err(error));
    }
}
