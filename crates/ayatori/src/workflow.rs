//! Dependency-graph workflows.

use crate::engine::Process;
use crate::handle::ExecutionHandle;
use ayatori_core::{Advance, ProcessError, RunState, Step, StepName, Steps, Strategy};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// Prerequisites per step. Steps without an entry have none.
pub type Dependencies = HashMap<StepName, Vec<StepName>>;

/// Strategy that starts a step once all of its prerequisites completed.
///
/// Steps with no prerequisites start together at the beginning of a run;
/// a step with several prerequisites waits for all of them, in any order.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    dependencies: Dependencies,
}

impl DependencyGraph {
    /// Wraps a prerequisite map.
    pub fn new(dependencies: Dependencies) -> Self {
        Self { dependencies }
    }

    /// Prerequisites of `step`, empty if it has none.
    pub fn prerequisites(&self, step: &str) -> &[StepName] {
        self.dependencies
            .get(step)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Checks that every step and prerequisite named in the graph exists.
    pub fn validate(&self, steps: &Steps) -> Result<(), ProcessError> {
        for (step, prerequisites) in &self.dependencies {
            if !steps.contains(step.as_str()) {
                return Err(ProcessError::Configuration(format!(
                    "dependencies reference unknown step '{}'",
                    step
                )));
            }
            for prerequisite in prerequisites {
                if prerequisite == step {
                    return Err(ProcessError::Configuration(format!(
                        "step '{}' depends on itself",
                        step
                    )));
                }
                if !steps.contains(prerequisite.as_str()) {
                    return Err(ProcessError::Configuration(format!(
                        "step '{}' depends on unknown step '{}'",
                        step, prerequisite
                    )));
                }
            }
        }
        Ok(())
    }
}

impl Strategy for DependencyGraph {
    fn initial(&self, steps: &Steps, _start: Option<&StepName>) -> Vec<StepName> {
        steps
            .names()
            .filter(|name| self.prerequisites(name.as_str()).is_empty())
            .collect()
    }

    fn next(&self, steps: &Steps, state: &RunState, _finished: &StepName) -> Advance {
        Advance::Run(
            steps
                .names()
                .filter(|name| !state.is_started(name.as_str()))
                .filter(|name| {
                    self.prerequisites(name.as_str())
                        .iter()
                        .all(|p| state.is_completed(p.as_str()))
                })
                .collect(),
        )
    }
}

/// A process whose steps run as soon as their prerequisites complete.
///
/// # Examples
///
/// ```
/// use ayatori::prelude::*;
/// use serde_json::json;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), ProcessError> {
/// let workflow = Workflow::builder("load")
///     .step(step("fetch", |_ctx, _props| async { Ok(json!([1, 2, 3])) }).build()?)
///     .step(step("count", |ctx, _props| async move {
///         let fetched = ctx.result("fetch").unwrap_or_default();
///         Ok(json!(fetched.as_array().map_or(0, |a| a.len())))
///     }).build()?)
///     .depends_on("count", ["fetch"])
///     .build()?;
///
/// let results = workflow.dispatch(vec![]).await?;
/// assert_eq!(results.get("count"), Some(&json!(3)));
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Workflow {
    process: Process<DependencyGraph>,
}

impl Workflow {
    /// Starts building a workflow called `name`.
    pub fn builder(name: impl Into<String>) -> WorkflowBuilder {
        WorkflowBuilder::new(name)
    }

    /// Builds a workflow from an existing collection and dependency map.
    pub fn new(
        name: impl Into<String>,
        steps: Steps,
        dependencies: Dependencies,
    ) -> Result<Self, ProcessError> {
        let graph = DependencyGraph::new(dependencies);
        graph.validate(&steps)?;
        Ok(Self {
            process: Process::new(name, steps, graph),
        })
    }

    /// The workflow's name.
    pub fn name(&self) -> &str {
        self.process.name()
    }

    /// The workflow's steps.
    pub fn steps(&self) -> &Steps {
        self.process.steps()
    }

    /// The dependency graph the workflow follows.
    pub fn dependencies(&self) -> &DependencyGraph {
        self.process.strategy()
    }

    /// Starts a run with `args` as the context's arguments.
    pub fn dispatch(&self, args: Vec<Value>) -> ExecutionHandle {
        self.process.dispatch(args, Map::new(), None)
    }

    /// Returns the dispatch operation as a standalone function.
    pub fn dispatcher(&self) -> impl Fn(Vec<Value>) -> ExecutionHandle + Clone + Send + Sync {
        let workflow = self.clone();
        move |args| workflow.dispatch(args)
    }
}

/// Builder for [`Workflow`].
#[derive(Debug, Default)]
#[must_use]
pub struct WorkflowBuilder {
    name: String,
    steps: Steps,
    dependencies: Dependencies,
}

impl WorkflowBuilder {
    /// Starts an empty builder.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Adds a step.
    pub fn step<S: Step + 'static>(mut self, step: S) -> Self {
        self.steps.add(step);
        self
    }

    /// Adds a step already shared elsewhere.
    pub fn shared_step(mut self, step: Arc<dyn Step>) -> Self {
        self.steps.add_shared(step);
        self
    }

    /// Appends every step of `steps`, keeping their order.
    pub fn steps(mut self, steps: &Steps) -> Self {
        for step in steps {
            self.steps.add_shared(step.clone());
        }
        self
    }

    /// Adds prerequisites for `step`.
    pub fn depends_on<I, N>(mut self, step: impl Into<StepName>, prerequisites: I) -> Self
    where
        I: IntoIterator<Item = N>,
        N: Into<StepName>,
    {
        self.dependencies
            .entry(step.into())
            .or_default()
            .extend(prerequisites.into_iter().map(Into::into));
        self
    }

    /// Merges a whole dependency map.
    pub fn dependencies(mut self, dependencies: Dependencies) -> Self {
        for (step, prerequisites) in dependencies {
            self.dependencies.entry(step).or_default().extend(prerequisites);
        }
        self
    }

    /// Builds the workflow.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError::Configuration`] if the name is empty or a
    /// dependency names a step that is not part of the workflow.
    pub fn build(self) -> Result<Workflow, ProcessError> {
        if self.name.trim().is_empty() {
            return Err(ProcessError::Configuration(
                "Workflow name must be specified".to_string(),
            ));
        }
        Workflow::new(self.name, self.steps, self.dependencies)
    }
}
