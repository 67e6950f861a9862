//! Condition-driven state machines.

use crate::engine::Process;
use crate::handle::ExecutionHandle;
use crate::predicate::Predicate;
use ayatori_core::{Advance, ProcessError, RunState, Step, StepName, Steps, Strategy};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::sync::Arc;

/// A guarded move from one state (step) to another.
///
/// Deserializes from the tuple form `["from", "to"]` or
/// `["from", "to", predicate]`.
///
/// # Examples
///
/// ```
/// use ayatori::{Predicate, Transition};
/// use serde_json::json;
///
/// let plain: Transition = ("a", "b").into();
/// let guarded = Transition::new("b", "c").when("approved");
/// let parsed: Transition = serde_json::from_value(json!(["b", "c", {"goTo": "c"}]))?;
///
/// assert_eq!(plain.target(), "b");
/// assert!(matches!(guarded.predicate(), Predicate::Truthy(_)));
/// assert!(matches!(parsed.predicate(), Predicate::Matches(_)));
/// # Ok::<(), serde_json::Error>(())
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(try_from = "Value")]
pub struct Transition {
    from: StepName,
    to: StepName,
    predicate: Predicate,
}

impl Transition {
    /// An unconditional transition.
    pub fn new(from: impl Into<StepName>, to: impl Into<StepName>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            predicate: Predicate::Always,
        }
    }

    /// Guards the transition with `predicate`.
    pub fn when(mut self, predicate: impl Into<Predicate>) -> Self {
        self.predicate = predicate.into();
        self
    }

    /// The state this transition leaves.
    pub fn source(&self) -> &StepName {
        &self.from
    }

    /// The state this transition enters.
    pub fn target(&self) -> &StepName {
        &self.to
    }

    /// The guard checked before taking this transition.
    pub fn predicate(&self) -> &Predicate {
        &self.predicate
    }
}

impl From<(&str, &str)> for Transition {
    fn from((from, to): (&str, &str)) -> Self {
        Transition::new(from, to)
    }
}

impl<P: Into<Predicate>> From<(&str, &str, P)> for Transition {
    fn from((from, to, predicate): (&str, &str, P)) -> Self {
        Transition::new(from, to).when(predicate)
    }
}

impl TryFrom<Value> for Transition {
    type Error = String;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        let Value::Array(items) = value else {
            return Err("transition must be an array of [from, to, predicate?]".to_string());
        };
        if !(2..=3).contains(&items.len()) {
            return Err(format!(
                "transition must have 2 or 3 elements, got {}",
                items.len()
            ));
        }
        let mut items = items.into_iter();
        let (Some(Value::String(from)), Some(Value::String(to))) = (items.next(), items.next())
        else {
            return Err("transition states must be strings".to_string());
        };
        let predicate = match items.next() {
            Some(p) => Predicate::try_from(p)?,
            None => Predicate::Always,
        };
        Ok(Transition::new(from, to).when(predicate))
    }
}

/// Strategy that follows the first matching transition out of each
/// completed state.
///
/// When transitions leave a state but none matches, the run is pending until
/// a condition update makes one match. A state with no outgoing transitions
/// ends its path.
#[derive(Debug, Clone, Default)]
pub struct TransitionGraph {
    transitions: Vec<Transition>,
}

impl TransitionGraph {
    /// Wraps `transitions`, keeping their order.
    pub fn new(transitions: Vec<Transition>) -> Self {
        Self { transitions }
    }

    /// Transitions in the order they are tried.
    pub fn transitions(&self) -> &[Transition] {
        &self.transitions
    }

    /// Checks that every transition connects known states.
    pub fn validate(&self, steps: &Steps) -> Result<(), ProcessError> {
        for transition in &self.transitions {
            for state in [&transition.from, &transition.to] {
                if !steps.contains(state.as_str()) {
                    return Err(ProcessError::Configuration(format!(
                        "transition {} -> {} references unknown state '{}'",
                        transition.from, transition.to, state
                    )));
                }
            }
        }
        Ok(())
    }
}

impl Strategy for TransitionGraph {
    fn initial(&self, steps: &Steps, start: Option<&StepName>) -> Vec<StepName> {
        if let Some(start) = start.filter(|s| steps.contains(s.as_str())) {
            return vec![start.clone()];
        }
        if let Some(first) = self.transitions.first() {
            return vec![first.from.clone()];
        }
        steps.first().map(|s| vec![s.name()]).unwrap_or_default()
    }

    fn next(&self, _steps: &Steps, state: &RunState, finished: &StepName) -> Advance {
        let mut outgoing = self
            .transitions
            .iter()
            .filter(|t| &t.from == finished)
            .peekable();
        if outgoing.peek().is_none() {
            return Advance::Finish;
        }
        match outgoing.find(|t| t.predicate.evaluate(&state.conditions)) {
            Some(transition) => Advance::Run(vec![transition.to.clone()]),
            None => Advance::Await,
        }
    }
}

/// A process that moves between steps along guarded transitions.
///
/// After a state completes, its outgoing transitions are tried in order and
/// the first whose predicate matches the current conditions is taken.
///
/// # Pending and finished states
///
/// A state only leaves the run pending when it has outgoing transitions and
/// none of them matches; an [`ExecutionHandle::update`] that makes one match
/// resumes the run. A state with no outgoing transitions at all is terminal
/// instead of pending: its path ends there, and once no other step is in
/// flight or pending the run resolves with its results. Add a guarded
/// transition out of a state to make it wait for conditions.
///
/// # Examples
///
/// ```
/// use ayatori::prelude::*;
/// use serde_json::{json, Map};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), ProcessError> {
/// let machine = StateMachine::builder("traffic")
///     .step(step("red", |_ctx, _props| async { Ok(json!("stop")) }).build()?)
///     .step(step("green", |_ctx, _props| async { Ok(json!("go")) }).build()?)
///     .transition(("red", "green", "clear"))
///     .build()?;
///
/// let mut conditions = Map::new();
/// conditions.insert("clear".into(), json!(true));
///
/// let results = machine.dispatch(Some("red"), conditions, vec![]).await?;
/// assert_eq!(results.get("green"), Some(&json!("go")));
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct StateMachine {
    process: Process<TransitionGraph>,
}

impl StateMachine {
    /// Starts building a state machine called `name`.
    pub fn builder(name: impl Into<String>) -> StateMachineBuilder {
        StateMachineBuilder::new(name)
    }

    /// Builds a state machine from an existing collection and transition list.
    pub fn new(
        name: impl Into<String>,
        steps: Steps,
        transitions: Vec<Transition>,
    ) -> Result<Self, ProcessError> {
        let graph = TransitionGraph::new(transitions);
        graph.validate(&steps)?;
        Ok(Self {
            process: Process::new(name, steps, graph),
        })
    }

    /// The state machine's name.
    pub fn name(&self) -> &str {
        self.process.name()
    }

    /// The states, one step each.
    pub fn steps(&self) -> &Steps {
        self.process.steps()
    }

    /// Transitions in the order they are tried.
    pub fn transitions(&self) -> &[Transition] {
        self.process.strategy().transitions()
    }

    /// Starts a run in state `start` with the given initial conditions.
    ///
    /// An absent or unknown `start` falls back to the first transition's
    /// source state, then to the first step.
    pub fn dispatch(
        &self,
        start: Option<&str>,
        conditions: Map<String, Value>,
        args: Vec<Value>,
    ) -> ExecutionHandle {
        self.process
            .dispatch(args, conditions, start.map(StepName::from))
    }

    /// Starts a run from the default state with no conditions.
    pub fn start(&self) -> ExecutionHandle {
        self.dispatch(None, Map::new(), Vec::new())
    }

    /// Returns the dispatch operation as a standalone function.
    pub fn dispatcher(
        &self,
    ) -> impl Fn(Option<&str>, Map<String, Value>, Vec<Value>) -> ExecutionHandle + Clone + Send + Sync
    {
        let machine = self.clone();
        move |start: Option<&str>, conditions: Map<String, Value>, args: Vec<Value>| {
            machine.dispatch(start, conditions, args)
        }
    }
}

/// Builder for [`StateMachine`].
#[derive(Debug, Default)]
#[must_use]
pub struct StateMachineBuilder {
    name: String,
    steps: Steps,
    transitions: Vec<Transition>,
}

impl StateMachineBuilder {
    /// Starts an empty builder.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Adds a state.
    pub fn step<S: Step + 'static>(mut self, step: S) -> Self {
        self.steps.add(step);
        self
    }

    /// Adds a state already shared elsewhere.
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

    /// Appends a transition. Earlier transitions win.
    pub fn transition(mut self, transition: impl Into<Transition>) -> Self {
        self.transitions.push(transition.into());
        self
    }

    /// Appends several transitions in order.
    pub fn transitions<I, T>(mut self, transitions: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Transition>,
    {
        self.transitions
            .extend(transitions.into_iter().map(Into::into));
        self
    }

    /// Builds the state machine.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError::Configuration`] if the name is empty or a
    /// transition references a state that is not one of the steps.
    pub fn build(self) -> Result<StateMachine, ProcessError> {
        if self.name.trim().is_empty() {
            return Err(ProcessError::Configuration(
                "State machine name must be specified".to_string(),
            ));
        }
        StateMachine::new(self.name, self.steps, self.transitions)
    }
}
