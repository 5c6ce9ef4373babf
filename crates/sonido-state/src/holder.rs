//! The state tree.
//!
//! A [`ParamHolder`] is an ordered tree of [`Parameter`]s, [`StateValue`]s and
//! nested holders. It is built once on the control thread and then handed to
//! [`PluginState::initialise`](crate::PluginState::initialise); topology never
//! changes afterwards.
//!
//! Insertion order is the serialization order. Lookup is by identity.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::error::StateError;
use crate::param::Parameter;
use crate::state_value::{Applied, StateType, StateValue, StateValueRef};

/// One child of a [`ParamHolder`].
#[derive(Debug, Clone)]
pub enum StateNode {
    /// Host-automatable parameter.
    Param(Arc<Parameter>),
    /// Non-parameter state value.
    Value(StateValueRef),
    /// Nested group, serialized as a JSON object under its name.
    Group(ParamHolder),
}

impl StateNode {
    /// Key used for this node in serialized state.
    pub fn key(&self) -> &str {
        match self {
            Self::Param(p) => p.id(),
            Self::Value(v) => v.id(),
            Self::Group(g) => g.name(),
        }
    }
}

/// Ordered tree of plugin state.
///
/// # Example
///
/// ```rust
/// use sonido_state::{ParamHolder, Parameter, StateValue};
///
/// let mut holder = ParamHolder::new("root");
/// let gain = holder.add_param(Parameter::float("gain", "Gain", -60.0, 12.0, 0.0));
/// let label = holder.add_value(StateValue::new("presetName", String::from("Init")));
///
/// let mut tone = ParamHolder::new("tone");
/// tone.add_param(Parameter::float("bass", "Bass", -12.0, 12.0, 0.0));
/// holder.add_group(tone);
///
/// assert_eq!(holder.param_count(), 2);
/// assert!(holder.find_parameter("bass").is_some());
/// assert_eq!(gain.id(), "gain");
/// assert_eq!(label.get(), "Init");
/// ```
#[derive(Debug, Clone)]
pub struct ParamHolder {
    name: String,
    nodes: Vec<StateNode>,
}

impl ParamHolder {
    /// Create an empty group.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: Vec::new(),
        }
    }

    /// Group name (the JSON key when nested).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add a parameter and return a shared handle to it.
    pub fn add_param(&mut self, param: Parameter) -> Arc<Parameter> {
        let param = Arc::new(param);
        self.nodes.push(StateNode::Param(Arc::clone(&param)));
        param
    }

    /// Add a state value and return the same handle.
    pub fn add_value<T: StateType>(&mut self, value: Arc<StateValue<T>>) -> Arc<StateValue<T>> {
        self.nodes.push(StateNode::Value(value.to_ref()));
        value
    }

    /// Add a nested group.
    pub fn add_group(&mut self, group: ParamHolder) -> &mut Self {
        self.nodes.push(StateNode::Group(group));
        self
    }

    /// Direct children in insertion order.
    pub fn nodes(&self) -> &[StateNode] {
        &self.nodes
    }

    /// Number of direct children.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the group has no children.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Visit every parameter in the tree, depth first, in order.
    pub fn for_each_parameter(&self, f: &mut impl FnMut(&Arc<Parameter>)) {
        for node in &self.nodes {
            match node {
                StateNode::Param(p) => f(p),
                StateNode::Group(g) => g.for_each_parameter(f),
                StateNode::Value(_) => {}
            }
        }
    }

    /// Visit every state value in the tree, depth first, in order.
    pub fn for_each_value(&self, f: &mut impl FnMut(&StateValueRef)) {
        for node in &self.nodes {
            match node {
                StateNode::Value(v) => f(v),
                StateNode::Group(g) => g.for_each_value(f),
                StateNode::Param(_) => {}
            }
        }
    }

    /// Every parameter in the tree, in traversal order.
    pub fn parameters(&self) -> Vec<Arc<Parameter>> {
        let mut out = Vec::new();
        self.for_each_parameter(&mut |p| out.push(Arc::clone(p)));
        out
    }

    /// Total number of parameters in the tree.
    pub fn param_count(&self) -> usize {
        let mut count = 0;
        self.for_each_parameter(&mut |_| count += 1);
        count
    }

    /// Total number of state values in the tree.
    pub fn value_count(&self) -> usize {
        let mut count = 0;
        self.for_each_value(&mut |_| count += 1);
        count
    }

    /// Find a parameter anywhere in the tree.
    pub fn find_parameter(&self, id: &str) -> Option<&Arc<Parameter>> {
        self.nodes.iter().find_map(|node| match node {
            StateNode::Param(p) if p.id() == id => Some(p),
            StateNode::Group(g) => g.find_parameter(id),
            _ => None,
        })
    }

    /// Find a state value anywhere in the tree.
    pub fn find_value(&self, id: &str) -> Option<&StateValueRef> {
        self.nodes.iter().find_map(|node| match node {
            StateNode::Value(v) if v.id() == id => Some(v),
            StateNode::Group(g) => g.find_value(id),
            _ => None,
        })
    }

    /// Find a direct child group by name.
    pub fn group(&self, name: &str) -> Option<&ParamHolder> {
        self.nodes.iter().find_map(|node| match node {
            StateNode::Group(g) if g.name() == name => Some(g),
            _ => None,
        })
    }

    /// Check that leaf identities are unique across the tree and that no two
    /// siblings share a key.
    pub fn validate(&self) -> Result<(), StateError> {
        let mut leaves = HashSet::new();
        self.validate_into(&mut leaves)
    }

    fn validate_into<'a>(&'a self, leaves: &mut HashSet<&'a str>) -> Result<(), StateError> {
        let mut siblings = HashSet::new();
        for node in &self.nodes {
            let key = node.key();
            if !siblings.insert(key) {
                return Err(StateError::DuplicateIdentity(key.to_string()));
            }
            match node {
                StateNode::Group(g) => g.validate_into(leaves)?,
                _ if !leaves.insert(key) => {
                    return Err(StateError::DuplicateIdentity(key.to_string()));
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Serialized tree: one entry per child, in order.
    pub(crate) fn to_json(&self) -> Map<String, Value> {
        self.nodes
            .iter()
            .map(|node| {
                let value = match node {
                    StateNode::Param(p) => p.to_json(),
                    StateNode::Value(v) => v.to_json(),
                    StateNode::Group(g) => Value::Object(g.to_json()),
                };
                (node.key().to_string(), value)
            })
            .collect()
    }

    /// Apply a serialized tree by identity. Entries present in `map` but not
    /// in the tree are reported as ignored; children absent from `map` keep
    /// their value.
    pub(crate) fn apply_json(&self, map: &Map<String, Value>, prefix: &str, load: &mut TreeLoad) {
        for node in &self.nodes {
            let path = join_path(prefix, node.key());
            let Some(entry) = map.get(node.key()) else {
                load.missing += 1;
                continue;
            };
            match node {
                StateNode::Group(g) => match entry {
                    Value::Object(inner) => g.apply_json(inner, &path, load),
                    _ => load.rejected.push(path),
                },
                StateNode::Param(p) => {
                    let before = p.to_json();
                    let outcome = p.apply_json(entry);
                    load.record(outcome, path, || LeafChange {
                        leaf: Leaf::Param(Arc::clone(p)),
                        before,
                        after: p.to_json(),
                    });
                }
                StateNode::Value(v) => {
                    let before = v.to_json();
                    let outcome = v.apply_json(entry);
                    load.record(outcome, path, || LeafChange {
                        leaf: Leaf::Value(v.clone()),
                        before,
                        after: v.to_json(),
                    });
                }
            }
        }
        for key in map.keys() {
            if !self.nodes.iter().any(|node| node.key() == key) {
                load.ignored.push(join_path(prefix, key));
            }
        }
    }
}

fn join_path(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}.{key}")
    }
}

/// A leaf of the tree.
#[derive(Debug, Clone)]
pub(crate) enum Leaf {
    Param(Arc<Parameter>),
    Value(StateValueRef),
}

impl Leaf {
    /// Apply a serialized value. Returns whether the leaf changed.
    pub(crate) fn restore(&self, value: &Value) -> bool {
        let outcome = match self {
            Self::Param(p) => p.apply_json(value),
            Self::Value(v) => v.apply_json(value),
        };
        outcome == Applied::Changed
    }
}

/// One leaf whose value changed during a load.
#[derive(Debug, Clone)]
pub(crate) struct LeafChange {
    pub(crate) leaf: Leaf,
    pub(crate) before: Value,
    pub(crate) after: Value,
}

/// Accumulated outcome of applying a serialized tree.
#[derive(Debug, Default)]
pub(crate) struct TreeLoad {
    pub(crate) changed: Vec<LeafChange>,
    pub(crate) unchanged: usize,
    pub(crate) missing: usize,
    pub(crate) ignored: Vec<String>,
    pub(crate) rejected: Vec<String>,
}

impl TreeLoad {
    fn record(&mut self, outcome: Applied, path: String, change: impl FnOnce() -> LeafChange) {
        match outcome {
            Applied::Changed => self.changed.push(change()),
            Applied::Unchanged => self.unchanged += 1,
            Applied::Rejected => self.rejected.push(path),
        }
    }
}
