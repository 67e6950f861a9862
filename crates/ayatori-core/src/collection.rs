//! Insertion-ordered step collection.

use crate::step::{Step, StepName};
use std::fmt;
use std::sync::Arc;

/// An insertion-ordered set of steps, unique by name.
///
/// Iteration order is the order steps were first added; that order decides
/// which steps a strategy lists first and the order of hook sweeps.
///
/// # Examples
///
/// ```
/// use ayatori_core::{step, Steps};
/// use serde_json::json;
///
/// let mut steps = Steps::new();
/// steps.add(step("a", |_ctx, _props| async { Ok(json!(1)) }).build()?);
/// steps.add(step("b", |_ctx, _props| async { Ok(json!(2)) }).build()?);
///
/// let names: Vec<_> = steps.names().map(|n| n.to_string()).collect();
/// assert_eq!(names, ["a", "b"]);
/// # Ok::<(), ayatori_core::ProcessError>(())
/// ```
#[derive(Clone, Default)]
pub struct Steps {
    items: Vec<Arc<dyn Step>>,
}

impl fmt::Debug for Steps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

impl Steps {
    /// Creates an empty collection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a step. A step with the same name is replaced in place.
    pub fn add<S: Step + 'static>(&mut self, step: S) -> &mut Self {
        self.add_shared(Arc::new(step))
    }

    /// Adds an already shared step.
    pub fn add_shared(&mut self, step: Arc<dyn Step>) -> &mut Self {
        let name = step.name();
        match self.items.iter().position(|s| s.name() == name) {
            Some(index) => self.items[index] = step,
            None => self.items.push(step),
        }
        self
    }

    /// Builder-style [`add`](Steps::add).
    pub fn with<S: Step + 'static>(mut self, step: S) -> Self {
        self.add(step);
        self
    }

    /// Removes and returns the step with the given name.
    pub fn remove(&mut self, name: &str) -> Option<Arc<dyn Step>> {
        let index = self.items.iter().position(|s| s.name() == name)?;
        Some(self.items.remove(index))
    }

    /// Looks up a step by name.
    pub fn get(&self, name: &str) -> Option<&Arc<dyn Step>> {
        self.items.iter().find(|s| s.name() == name)
    }

    /// Returns `true` if a step with this name is present.
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// The first step added.
    pub fn first(&self) -> Option<&Arc<dyn Step>> {
        self.items.first()
    }

    /// Step names in insertion order.
    pub fn names(&self) -> impl Iterator<Item = StepName> + '_ {
        self.items.iter().map(|s| s.name())
    }

    /// Iterates over the steps in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Step>> {
        self.items.iter()
    }

    /// Number of steps.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns `true` if the collection holds no steps.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl FromIterator<Arc<dyn Step>> for Steps {
    fn from_iter<I: IntoIterator<Item = Arc<dyn Step>>>(iter: I) -> Self {
        let mut steps = Steps::new();
        for step in iter {
            steps.add_shared(step);
        }
        steps
    }
}

impl<'a> IntoIterator for &'a Steps {
    type Item = &'a Arc<dyn Step>;
    type IntoIter = std::slice::Iter<'a, Arc<dyn Step>>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}
