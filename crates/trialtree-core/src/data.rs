//! Per-node data records and the tagged value model.
//!
//! Trial data is an insertion-ordered record of [`StepValue`]s. A value is
//! either a plain JSON literal, a deferred generator call (evaluated lazily
//! against a [`GeneratorRegistry`]), or a named component reference. The
//! variant is chosen when the value is constructed; nothing is inferred from
//! source text, and every variant has a stable plain-JSON form, so records
//! always survive serialization.
//!
//! # Example
//!
//! ```
//! use trialtree_core::data::{GeneratorRegistry, StepData, StepValue};
//! use serde_json::json;
//!
//! let data = StepData::new()
//!     .with("color", "red")
//!     .with("delay", StepValue::deferred("runif", [json!(0.2), json!(1.5)]));
//!
//! let mut registry = GeneratorRegistry::new();
//! registry.register("runif", |args| args.first().cloned().unwrap_or(json!(0.0)));
//!
//! let rendered = registry.render(&data);
//! assert_eq!(rendered["color"], json!("red"));
//! assert_eq!(rendered["delay"], json!(0.2));
//! ```

use std::collections::HashMap;
use std::fmt;

use indexmap::IndexMap;
use serde_json::{Map, Value, json};

/// Marker key identifying a deferred generator call in plain form.
pub const DEFERRED_MARKER: &str = "__deferred";
/// Marker key identifying a component reference in plain form.
pub const COMPONENT_MARKER: &str = "__componentRef";

// =============================================================================
// StepValue
// =============================================================================

/// A single value in a trial's data record.
#[derive(Debug, Clone, PartialEq)]
pub enum StepValue {
    /// Plain JSON data, stored as-is. JSON `null` is a legal literal.
    Literal(Value),
    /// A named generator invocation with literal arguments. Evaluated on
    /// demand via [`GeneratorRegistry::resolve`]; the binding is by name, so
    /// a restored call re-binds against whatever registry the embedding
    /// supplies at evaluation time.
    DeferredCall { name: String, args: Vec<Value> },
    /// A named UI component. The tree never instantiates components; it only
    /// carries the name for the embedding to resolve.
    ComponentRef { name: String },
}

impl StepValue {
    /// Wraps any JSON-convertible value as a literal.
    pub fn literal(value: impl Into<Value>) -> Self {
        StepValue::Literal(value.into())
    }

    /// A deferred call to the generator registered under `name`.
    pub fn deferred(name: impl Into<String>, args: impl IntoIterator<Item = Value>) -> Self {
        StepValue::DeferredCall {
            name: name.into(),
            args: args.into_iter().collect(),
        }
    }

    /// A reference to the component registered under `name`.
    pub fn component(name: impl Into<String>) -> Self {
        StepValue::ComponentRef { name: name.into() }
    }

    /// The literal payload, if this value is one.
    #[must_use]
    pub fn as_literal(&self) -> Option<&Value> {
        match self {
            StepValue::Literal(value) => Some(value),
            _ => None,
        }
    }

    /// Encodes the value in its plain JSON form.
    ///
    /// Literals pass through untouched; the other variants become small
    /// tagged objects (`{"__deferred": true, ...}` /
    /// `{"__componentRef": true, ...}`).
    #[must_use]
    pub fn to_plain(&self) -> Value {
        match self {
            StepValue::Literal(value) => value.clone(),
            StepValue::DeferredCall { name, args } => json!({
                DEFERRED_MARKER: true,
                "name": name,
                "params": args,
            }),
            StepValue::ComponentRef { name } => json!({
                COMPONENT_MARKER: true,
                "name": name,
            }),
        }
    }

    /// Decodes a plain JSON value, inverting [`to_plain`](Self::to_plain).
    ///
    /// An object is recognized as tagged only when its marker is literally
    /// `true` and its `name` is a string; anything else is a literal.
    #[must_use]
    pub fn from_plain(value: Value) -> Self {
        if let Value::Object(map) = &value {
            if let Some(name) = tagged_name(map, DEFERRED_MARKER) {
                let args = match map.get("params") {
                    Some(Value::Array(items)) => items.clone(),
                    _ => Vec::new(),
                };
                return StepValue::DeferredCall {
                    name: name.to_owned(),
                    args,
                };
            }
            if let Some(name) = tagged_name(map, COMPONENT_MARKER) {
                return StepValue::ComponentRef {
                    name: name.to_owned(),
                };
            }
        }
        StepValue::Literal(value)
    }
}

fn tagged_name<'a>(map: &'a Map<String, Value>, marker: &str) -> Option<&'a str> {
    if map.get(marker) != Some(&Value::Bool(true)) {
        return None;
    }
    map.get("name").and_then(Value::as_str)
}

impl From<Value> for StepValue {
    fn from(value: Value) -> Self {
        StepValue::Literal(value)
    }
}

impl From<&str> for StepValue {
    fn from(value: &str) -> Self {
        StepValue::Literal(Value::from(value))
    }
}

impl From<String> for StepValue {
    fn from(value: String) -> Self {
        StepValue::Literal(Value::from(value))
    }
}

impl From<bool> for StepValue {
    fn from(value: bool) -> Self {
        StepValue::Literal(Value::from(value))
    }
}

impl From<i64> for StepValue {
    fn from(value: i64) -> Self {
        StepValue::Literal(Value::from(value))
    }
}

impl From<f64> for StepValue {
    fn from(value: f64) -> Self {
        StepValue::Literal(Value::from(value))
    }
}

// =============================================================================
// StepData
// =============================================================================

/// An insertion-ordered data record attached to a tree node.
///
/// Key order is the order keys were first inserted, and it round-trips
/// through the plain form, so column order from bulk population survives
/// save and restore.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepData {
    entries: IndexMap<String, StepValue>,
}

impl StepData {
    /// An empty record.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Inserts or replaces an entry, returning the previous value if any.
    pub fn insert(
        &mut self,
        key: impl Into<String>,
        value: impl Into<StepValue>,
    ) -> Option<StepValue> {
        self.entries.insert(key.into(), value.into())
    }

    /// Builder-style insert.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<StepValue>) -> Self {
        self.insert(key, value);
        self
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&StepValue> {
        self.entries.get(key)
    }

    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Removes an entry, preserving the order of the rest.
    pub fn remove(&mut self, key: &str) -> Option<StepValue> {
        self.entries.shift_remove(key)
    }

    /// Additive merge: every entry of `patch` is upserted into `self`.
    /// Existing keys keep their position; new keys append.
    pub fn merge(&mut self, patch: StepData) {
        for (key, value) in patch.entries {
            self.entries.insert(key, value);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &StepValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// The record in plain JSON form (see [`StepValue::to_plain`]).
    #[must_use]
    pub fn to_plain(&self) -> Map<String, Value> {
        self.entries
            .iter()
            .map(|(key, value)| (key.clone(), value.to_plain()))
            .collect()
    }

    /// Rebuilds a record from its plain JSON form.
    #[must_use]
    pub fn from_plain(map: &Map<String, Value>) -> Self {
        let entries = map
            .iter()
            .map(|(key, value)| (key.clone(), StepValue::from_plain(value.clone())))
            .collect();
        StepData { entries }
    }
}

impl<K: Into<String>, V: Into<StepValue>> FromIterator<(K, V)> for StepData {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let entries = iter
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        StepData { entries }
    }
}

// =============================================================================
// GeneratorRegistry
// =============================================================================

type GeneratorFn = Box<dyn Fn(&[Value]) -> Value + Send + Sync>;

/// Named generator functions for evaluating [`StepValue::DeferredCall`]s.
///
/// The registry lives with the embedding and is never serialized; deferred
/// calls in restored trees re-bind purely by name.
#[derive(Default)]
pub struct GeneratorRegistry {
    generators: HashMap<String, GeneratorFn>,
}

impl GeneratorRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `generator` under `name`, replacing any previous binding.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        generator: impl Fn(&[Value]) -> Value + Send + Sync + 'static,
    ) {
        self.generators.insert(name.into(), Box::new(generator));
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.generators.contains_key(name)
    }

    /// Evaluates a single value.
    ///
    /// Literals resolve to themselves, deferred calls to their generator's
    /// output (or `None` when the name is unbound), component references to
    /// `None` — components are for the embedding, not for data.
    #[must_use]
    pub fn resolve(&self, value: &StepValue) -> Option<Value> {
        match value {
            StepValue::Literal(literal) => Some(literal.clone()),
            StepValue::DeferredCall { name, args } => {
                self.generators.get(name).map(|generator| generator(args))
            }
            StepValue::ComponentRef { .. } => None,
        }
    }

    /// Renders a whole record to plain JSON, evaluating every deferred call.
    ///
    /// Unresolvable calls and component references keep their tagged plain
    /// form so no information is lost; an unbound generator name is logged.
    #[must_use]
    pub fn render(&self, data: &StepData) -> Map<String, Value> {
        let mut out = Map::new();
        for (key, value) in data.iter() {
            let rendered = match value {
                StepValue::DeferredCall { name, .. } if !self.contains(name) => {
                    tracing::warn!(key, generator = %name, "no generator registered; leaving deferred call unevaluated");
                    value.to_plain()
                }
                _ => self.resolve(value).unwrap_or_else(|| value.to_plain()),
            };
            out.insert(key.to_owned(), rendered);
        }
        out
    }
}

impl fmt::Debug for GeneratorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = self.generators.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("GeneratorRegistry")
            .field("generators", &names)
            .finish()
    }
}
