//! Product metadata trees.
//!
//! Product info arrives as a tree of named nodes where every leaf carries a
//! textual value. Lookups by name are case-insensitive, matching how the
//! catalog itself treats keys (`depotFromApp` and `depotfromapp` are the same
//! node).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A node in a product metadata tree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyValue {
    pub name: String,
    pub value: Option<String>,
    pub children: Vec<KeyValue>,
}

impl KeyValue {
    /// A leaf node with a value.
    pub fn leaf(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: Some(value.into()),
            children: Vec::new(),
        }
    }

    /// A branch node with children.
    pub fn branch(name: impl Into<String>, children: impl IntoIterator<Item = KeyValue>) -> Self {
        Self {
            name: name.into(),
            value: None,
            children: children.into_iter().collect(),
        }
    }

    /// First child with the given name, ignoring ASCII case.
    pub fn get(&self, name: &str) -> Option<&KeyValue> {
        self.children.iter().find(|child| child.name.eq_ignore_ascii_case(name))
    }

    /// Walks a sequence of child names.
    pub fn path<'a>(&self, path: impl IntoIterator<Item = &'a str>) -> Option<&KeyValue> {
        path.into_iter().try_fold(self, |node, name| node.get(name))
    }

    pub fn as_str(&self) -> Option<&str> {
        self.value.as_deref()
    }

    /// Leaf value parsed as an unsigned 32-bit integer.
    pub fn as_u32(&self) -> Option<u32> {
        self.as_str().and_then(|value| value.trim().parse().ok())
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// Builds a tree from JSON: objects become branches, arrays become
    /// branches keyed by index, everything else a leaf.
    pub fn from_json(name: impl Into<String>, value: &Value) -> Self {
        let name = name.into();
        match value {
            Value::Object(map) => {
                Self::branch(name, map.iter().map(|(key, child)| Self::from_json(key.clone(), child)))
            },
            Value::Array(items) => Self::branch(
                name,
                items.iter().enumerate().map(|(index, child)| Self::from_json(index.to_string(), child)),
            ),
            Value::String(s) => Self::leaf(name, s.clone()),
            Value::Null => Self {
                name,
                ..Self::default()
            },
            other => Self::leaf(name, other.to_string()),
        }
    }

    /// Inverse of [`from_json`](Self::from_json), except that arrays come back
    /// as objects with index keys.
    pub fn to_json(&self) -> Value {
        match (&self.value, self.children.is_empty()) {
            (Some(value), true) => Value::String(value.clone()),
            (None, true) => Value::Null,
            _ => {
                let mut map = Map::new();
                for child in &self.children {
                    map.insert(child.name.clone(), child.to_json());
                }
                Value::Object(map)
            },
        }
    }
}

impl Serialize for KeyValue {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for KeyValue {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Ok(Self::from_json("", &value))
    }
}
