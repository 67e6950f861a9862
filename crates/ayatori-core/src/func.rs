//! Closure-defined steps.
//!
//! [`step`] and [`StepBuilder`] build a [`Step`] out of plain async closures
//! plus a [`Properties`] bag for per-step instance data, so simple steps do
//! not need a dedicated type.

use crate::context::Context;
use crate::error::{ProcessError, StepError};
use crate::retry::RetryPolicy;
use crate::step::{Step, StepName};
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use serde_json::{Map, Value};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::debug;

/// Open key/value bag owned by one closure-defined step.
///
/// The bag is reset to the values given to [`StepBuilder::property`] at the
/// start of every run, before the step's `init` closure runs. Clones share
/// the same storage.
#[derive(Clone, Default)]
pub struct Properties {
    values: Arc<Mutex<Map<String, Value>>>,
}

impl fmt::Debug for Properties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.lock().iter()).finish()
    }
}

impl Properties {
    fn lock(&self) -> MutexGuard<'_, Map<String, Value>> {
        self.values.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the property stored under `key`.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.lock().get(key).cloned()
    }

    /// Stores `value` under `key` until the next run resets the bag.
    pub fn set(&self, key: impl Into<String>, value: Value) {
        self.lock().insert(key.into(), value);
    }

    /// Removes and returns the property under `key`.
    pub fn remove(&self, key: &str) -> Option<Value> {
        self.lock().remove(key)
    }

    /// Adds one to an integer property and returns the new value. A missing
    /// or non-integer property counts from zero.
    pub fn increment(&self, key: &str) -> i64 {
        let mut values = self.lock();
        let next = values.get(key).and_then(Value::as_i64).unwrap_or(0) + 1;
        values.insert(key.to_string(), Value::from(next));
        next
    }

    /// Returns a copy of every property.
    pub fn snapshot(&self) -> Map<String, Value> {
        self.lock().clone()
    }

    fn reset(&self, seed: &Map<String, Value>) {
        *self.lock() = seed.clone();
    }
}

type Hook<T> = Arc<dyn Fn(Context, Properties) -> BoxFuture<'static, Result<T, StepError>> + Send + Sync>;
type ErrorHook<E, T> =
    Arc<dyn Fn(Context, Properties, E) -> BoxFuture<'static, Result<T, StepError>> + Send + Sync>;

/// Starts a closure-defined step whose `execute` is `f`.
///
/// # Examples
///
/// ```
/// use ayatori_core::step;
/// use serde_json::json;
///
/// let greet = step("greet", |ctx, _props| async move {
///     let who = ctx.arg(0).unwrap_or(json!("world"));
///     Ok(json!(format!("hello {}", who)))
/// })
/// .build()?;
/// # Ok::<(), ayatori_core::ProcessError>(())
/// ```
pub fn step<F, Fut>(name: impl Into<StepName>, f: F) -> StepBuilder
where
    F: Fn(Context, Properties) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, StepError>> + Send + 'static,
{
    StepBuilder::new(name).execute(f)
}

/// Builder for [`FnStep`].
///
/// Any lifecycle hook left unset keeps the [`Step`] default.
#[must_use]
pub struct StepBuilder {
    name: StepName,
    seed: Map<String, Value>,
    init: Option<Hook<()>>,
    execute: Option<Hook<Value>>,
    retry: Option<ErrorHook<StepError, ()>>,
    rollback: Option<ErrorHook<ProcessError, ()>>,
    success: Option<Hook<()>>,
    failure: Option<ErrorHook<ProcessError, ()>>,
    retry_policy: Option<RetryPolicy>,
    timeout: Option<Duration>,
}

impl fmt::Debug for StepBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepBuilder")
            .field("name", &self.name)
            .field("properties", &self.seed)
            .finish_non_exhaustive()
    }
}

impl StepBuilder {
    /// Starts a builder for a step that does nothing until hooks are set.
    pub fn new(name: impl Into<StepName>) -> Self {
        Self {
            name: name.into(),
            seed: Map::new(),
            init: None,
            execute: None,
            retry: None,
            rollback: None,
            success: None,
            failure: None,
            retry_policy: None,
            timeout: None,
        }
    }

    /// Seeds a property; the bag is restored to its seeds on every run.
    pub fn property(mut self, key: impl Into<String>, value: Value) -> Self {
        self.seed.insert(key.into(), value);
        self
    }

    /// Runs once per run before the first `execute` attempt.
    pub fn init<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Context, Properties) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), StepError>> + Send + 'static,
    {
        self.init = Some(Arc::new(move |ctx, props| f(ctx, props).boxed()));
        self
    }

    /// Produces the step's result.
    pub fn execute<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Context, Properties) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, StepError>> + Send + 'static,
    {
        self.execute = Some(Arc::new(move |ctx, props| f(ctx, props).boxed()));
        self
    }

    /// Resolving with `Ok(())` runs `execute` again.
    pub fn retry<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Context, Properties, StepError) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), StepError>> + Send + 'static,
    {
        self.retry = Some(Arc::new(move |ctx, props, error| f(ctx, props, error).boxed()));
        self
    }

    /// Undoes the step's effects when the run fails after it started.
    pub fn rollback<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Context, Properties, ProcessError) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), StepError>> + Send + 'static,
    {
        self.rollback = Some(Arc::new(move |ctx, props, error| f(ctx, props, error).boxed()));
        self
    }

    /// Runs once the whole run has succeeded.
    pub fn success<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Context, Properties) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), StepError>> + Send + 'static,
    {
        self.success = Some(Arc::new(move |ctx, props| f(ctx, props).boxed()));
        self
    }

    /// Runs once the whole run has failed.
    pub fn failure<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Context, Properties, ProcessError) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), StepError>> + Send + 'static,
    {
        self.failure = Some(Arc::new(move |ctx, props, error| f(ctx, props, error).boxed()));
        self
    }

    /// Bounds retries with `policy`, sleeping its delay before each retry.
    ///
    /// When a `retry` closure is also set it runs after the policy allows
    /// another attempt and may still refuse.
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    /// Fails any single `execute` attempt that runs longer than `timeout`.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Builds the step.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError::Configuration`] if the name is empty.
    pub fn build(self) -> Result<FnStep, ProcessError> {
        if self.name.is_empty() {
            return Err(ProcessError::Configuration(
                "Step name must not be empty".to_string(),
            ));
        }
        let properties = Properties::default();
        properties.reset(&self.seed);
        Ok(FnStep {
            name: self.name,
            seed: self.seed,
            properties,
            attempts: AtomicU32::new(0),
            init: self.init,
            execute: self.execute,
            retry: self.retry,
            rollback: self.rollback,
            success: self.success,
            failure: self.failure,
            retry_policy: self.retry_policy,
            timeout: self.timeout,
        })
    }
}

/// A [`Step`] assembled from closures by [`StepBuilder`].
pub struct FnStep {
    name: StepName,
    seed: Map<String, Value>,
    properties: Properties,
    attempts: AtomicU32,
    init: Option<Hook<()>>,
    execute: Option<Hook<Value>>,
    retry: Option<ErrorHook<StepError, ()>>,
    rollback: Option<ErrorHook<ProcessError, ()>>,
    success: Option<Hook<()>>,
    failure: Option<ErrorHook<ProcessError, ()>>,
    retry_policy: Option<RetryPolicy>,
    timeout: Option<Duration>,
}

impl fmt::Debug for FnStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnStep")
            .field("name", &self.name)
            .field("properties", &self.properties)
            .field("retry_policy", &self.retry_policy)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl FnStep {
    /// The step's property bag.
    pub fn properties(&self) -> &Properties {
        &self.properties
    }
}

#[async_trait]
impl Step for FnStep {
    fn name(&self) -> StepName {
        self.name.clone()
    }

    async fn init(&self, ctx: &Context) -> Result<(), StepError> {
        self.properties.reset(&self.seed);
        self.attempts.store(0, Ordering::SeqCst);
        match &self.init {
            Some(f) => f(ctx.clone(), self.properties.clone()).await,
            None => Ok(()),
        }
    }

    async fn execute(&self, ctx: &Context) -> Result<Value, StepError> {
        let Some(f) = &self.execute else {
            return Ok(Value::Null);
        };
        let attempt = f(ctx.clone(), self.properties.clone());
        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, attempt).await.unwrap_or_else(|_| {
                Err(StepError::new(format!("Step '{}' timed out", self.name))
                    .with("timeout_ms", Value::from(limit.as_millis() as u64)))
            }),
            None => attempt.await,
        }
    }

    async fn retry(&self, ctx: &Context, error: StepError) -> Result<(), StepError> {
        if let Some(policy) = &self.retry_policy {
            let retry = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            let Some(delay) = policy.delay_before(retry) else {
                debug!(step = %self.name, retries = retry - 1, "retry policy exhausted");
                return Err(error);
            };
            debug!(step = %self.name, retry, delay_ms = delay.as_millis() as u64, "retrying step");
            tokio::time::sleep(delay).await;
        }
        match (&self.retry, &self.retry_policy) {
            (Some(f), _) => f(ctx.clone(), self.properties.clone(), error).await,
            (None, Some(_)) => Ok(()),
            (None, None) => Err(error),
        }
    }

    async fn rollback(&self, ctx: &Context, error: &ProcessError) -> Result<(), StepError> {
        match &self.rollback {
            Some(f) => f(ctx.clone(), self.properties.clone(), error.clone()).await,
            None => Ok(()),
        }
    }

    async fn success(&self, ctx: &Context) -> Result<(), StepError> {
        match &self.success {
            Some(f) => f(ctx.clone(), self.properties.clone()).await,
            None => Ok(()),
        }
    }

    async fn failure(&self, ctx: &Context, error: &ProcessError) -> Result<(), StepError> {
        match &self.failure {
            Some(f) => f(ctx.clone(), self.properties.clone(), error.clone()).await,
            None => Ok(()),
        }
    }
}
