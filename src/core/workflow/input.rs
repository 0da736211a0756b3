use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Marker prefix that turns a string into a variable reference.
pub const REFERENCE_MARKER: char = '$';

/// Step input as declared in a definition.
///
/// Definitions carry plain JSON; strings starting with `$` become references and
/// arrays/objects are walked structurally, so resolution never inspects runtime
/// types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "Value", into = "Value")]
pub enum InputNode {
    Literal(Value),
    /// Variable path without the leading marker.
    Reference(String),
    List(Vec<InputNode>),
    Map(IndexMap<String, InputNode>),
}

impl Default for InputNode {
    fn default() -> Self {
        InputNode::Literal(Value::Null)
    }
}

impl InputNode {
    pub fn reference(path: impl Into<String>) -> Self {
        let path = path.into();
        InputNode::Reference(path.trim_start_matches(REFERENCE_MARKER).to_string())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, InputNode::Literal(Value::Null))
    }

    /// Resolve every reference through `lookup`; a missing reference becomes `null`.
    pub fn resolve<F>(&self, lookup: &F) -> Value
    where
        F: Fn(&str) -> Option<Value>,
    {
        match self {
            InputNode::Literal(value) => value.clone(),
            InputNode::Reference(path) => lookup(path).unwrap_or(Value::Null),
            InputNode::List(items) => {
                Value::Array(items.iter().map(|item| item.resolve(lookup)).collect())
            }
            InputNode::Map(entries) => {
                let mut resolved = Map::new();
                for (key, child) in entries {
                    resolved.insert(key.clone(), child.resolve(lookup));
                }
                Value::Object(resolved)
            }
        }
    }
}

impl From<Value> for InputNode {
    fn from(value: Value) -> Self {
        match value {
            Value::String(text) if text.starts_with(REFERENCE_MARKER) => {
                InputNode::reference(text)
            }
            Value::Array(items) => {
                InputNode::List(items.into_iter().map(InputNode::from).collect())
            }
            Value::Object(map) => InputNode::Map(
                map.into_iter()
                    .map(|(key, child)| (key, InputNode::from(child)))
                    .collect(),
            ),
            other => InputNode::Literal(other),
        }
    }
}

impl From<&str> for InputNode {
    fn from(value: &str) -> Self {
        InputNode::from(Value::String(value.to_string()))
    }
}

impl From<InputNode> for Value {
    fn from(node: InputNode) -> Self {
        match node {
            InputNode::Literal(value) => value,
            InputNode::Reference(path) => Value::String(format!("{}{}", REFERENCE_MARKER, path)),
            InputNode::List(items) => Value::Array(items.into_iter().map(Value::from).collect()),
            InputNode::Map(entries) => Value::Object(
                entries
                    .into_iter()
                    .map(|(key, child)| (key, Value::from(child)))
                    .collect(),
            ),
        }
    }
}
