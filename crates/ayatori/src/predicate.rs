//! Transition predicates evaluated against run conditions.

use serde::Deserialize;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

type CustomFn = Arc<dyn Fn(&Map<String, Value>) -> bool + Send + Sync>;

/// Guard on a state-machine transition.
///
/// # Examples
///
/// ```
/// use ayatori::Predicate;
/// use serde_json::{json, Map};
///
/// let mut conditions = Map::new();
/// conditions.insert("status".into(), json!("approved"));
/// conditions.insert("retries".into(), json!(0));
///
/// assert!(Predicate::Always.evaluate(&conditions));
/// assert!(Predicate::from("status").evaluate(&conditions));
/// assert!(!Predicate::from("retries").evaluate(&conditions));
/// assert!(Predicate::equals("status", "approved").evaluate(&conditions));
/// assert!(Predicate::custom(|c| c.len() == 2).evaluate(&conditions));
/// ```
#[derive(Clone, Default, Deserialize)]
#[serde(try_from = "Value")]
pub enum Predicate {
    /// Always matches.
    #[default]
    Always,
    /// Every key of the pattern is present in the conditions with a matching
    /// value. Nested objects match as subsets too.
    Matches(Map<String, Value>),
    /// The condition under this key is truthy: present, not `null`, not
    /// `false`, not `0`, and not an empty string.
    Truthy(String),
    /// The condition under this key equals the value.
    Equals(String, Value),
    /// Arbitrary check over all conditions.
    Custom(CustomFn),
}

impl fmt::Debug for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::Always => write!(f, "Always"),
            Predicate::Matches(pattern) => f.debug_tuple("Matches").field(pattern).finish(),
            Predicate::Truthy(key) => f.debug_tuple("Truthy").field(key).finish(),
            Predicate::Equals(key, value) => {
                f.debug_tuple("Equals").field(key).field(value).finish()
            }
            Predicate::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

impl Predicate {
    /// Matches when the condition under `key` equals `value`.
    pub fn equals(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Predicate::Equals(key.into(), value.into())
    }

    /// Matches when `f` returns `true` for the current conditions.
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&Map<String, Value>) -> bool + Send + Sync + 'static,
    {
        Predicate::Custom(Arc::new(f))
    }

    /// Checks the predicate against `conditions`.
    pub fn evaluate(&self, conditions: &Map<String, Value>) -> bool {
        match self {
            Predicate::Always => true,
            Predicate::Matches(pattern) => pattern
                .iter()
                .all(|(key, expected)| conditions.get(key).is_some_and(|v| is_match(v, expected))),
            Predicate::Truthy(key) => conditions.get(key).is_some_and(is_truthy),
            Predicate::Equals(key, value) => conditions.get(key) == Some(value),
            Predicate::Custom(f) => f(conditions),
        }
    }
}

fn is_match(actual: &Value, expected: &Value) -> bool {
    match (actual, expected) {
        (Value::Object(actual), Value::Object(expected)) => expected
            .iter()
            .all(|(key, e)| actual.get(key).is_some_and(|a| is_match(a, e))),
        _ => actual == expected,
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

impl From<&str> for Predicate {
    fn from(key: &str) -> Self {
        Predicate::Truthy(key.to_string())
    }
}

impl From<String> for Predicate {
    fn from(key: String) -> Self {
        Predicate::Truthy(key)
    }
}

impl From<Map<String, Value>> for Predicate {
    fn from(pattern: Map<String, Value>) -> Self {
        Predicate::Matches(pattern)
    }
}

impl From<(&str, Value)> for Predicate {
    fn from((key, value): (&str, Value)) -> Self {
        Predicate::Equals(key.to_string(), value)
    }
}

/// Reads the JSON forms `null`, `"key"`, `["key", value]` and
/// `{"key": value, ...}`.
impl TryFrom<Value> for Predicate {
    type Error = String;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Null => Ok(Predicate::Always),
            Value::String(key) => Ok(Predicate::Truthy(key)),
            Value::Object(pattern) => Ok(Predicate::Matches(pattern)),
            Value::Array(pair) if pair.len() == 2 => {
                let mut pair = pair.into_iter();
                match (pair.next(), pair.next()) {
                    (Some(Value::String(key)), Some(value)) => Ok(Predicate::Equals(key, value)),
                    _ => Err("predicate pair must be [string, value]".to_string()),
                }
            }
            other => Err(format!("unsupported predicate: {}", other)),
        }
    }
}
