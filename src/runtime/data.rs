//! Immutable data trees read out of the record store.
//!
//! Object and list nodes are `Arc`-shared so unchanged subtrees can be handed
//! back by identity after a re-read (see [`recycle_nodes_into`]).

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{Map, Number, Value};

use super::descriptor::FragmentRef;

/// Field under which a record's fragment reference is exposed.
pub const FRAGMENTS_KEY: &str = "__fragments";
/// Field under which the record id accompanies a fragment reference.
pub const ID_KEY: &str = "__id";

#[derive(Debug, Clone, Default, PartialEq)]
pub enum Data {
    #[default]
    Null,
    Bool(bool),
    Number(Number),
    String(Arc<str>),
    List(Arc<Vec<Data>>),
    Object(Arc<BTreeMap<String, Data>>),
    Fragment(Arc<FragmentRef>),
}

impl Data {
    pub fn object<K: Into<String>>(fields: impl IntoIterator<Item = (K, Data)>) -> Self {
        Data::Object(Arc::new(
            fields
                .into_iter()
                .map(|(key, value)| (key.into(), value))
                .collect(),
        ))
    }

    pub fn list(items: impl IntoIterator<Item = Data>) -> Self {
        Data::List(Arc::new(items.into_iter().collect()))
    }

    pub fn string(value: impl AsRef<str>) -> Self {
        Data::String(Arc::from(value.as_ref()))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Data::Null)
    }

    pub fn get(&self, key: &str) -> Option<&Data> {
        match self {
            Data::Object(fields) => fields.get(key),
            _ => None,
        }
    }

    pub fn at(&self, index: usize) -> Option<&Data> {
        match self {
            Data::List(items) => items.get(index),
            _ => None,
        }
    }

    /// Follows object keys (or list indices written as numbers) down the tree.
    pub fn get_path<S: AsRef<str>>(&self, path: &[S]) -> Option<&Data> {
        path.iter().try_fold(self, |node, segment| {
            let segment = segment.as_ref();
            match node {
                Data::List(_) => segment.parse().ok().and_then(|index| node.at(index)),
                _ => node.get(segment),
            }
        })
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Data::String(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Data::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Data::Number(value) => value.as_i64(),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Data]> {
        match self {
            Data::List(items) => Some(items.as_slice()),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&BTreeMap<String, Data>> {
        match self {
            Data::Object(fields) => Some(fields),
            _ => None,
        }
    }

    /// The fragment reference embedded in this object by a fragment spread.
    pub fn fragment_ref(&self) -> Option<Arc<FragmentRef>> {
        match self.get(FRAGMENTS_KEY) {
            Some(Data::Fragment(reference)) => Some(reference.clone()),
            _ => None,
        }
    }

    /// Identity comparison for shared nodes, value comparison for scalars.
    pub fn same_node(&self, other: &Data) -> bool {
        match (self, other) {
            (Data::Object(a), Data::Object(b)) => Arc::ptr_eq(a, b),
            (Data::List(a), Data::List(b)) => Arc::ptr_eq(a, b),
            (Data::Fragment(a), Data::Fragment(b)) => Arc::ptr_eq(a, b),
            (a, b) => a == b,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Data::Null => Value::Null,
            Data::Bool(value) => Value::Bool(*value),
            Data::Number(value) => Value::Number(value.clone()),
            Data::String(value) => Value::String(value.to_string()),
            Data::List(items) => Value::Array(items.iter().map(Data::to_json).collect()),
            Data::Object(fields) => Value::Object(
                fields
                    .iter()
                    .map(|(key, value)| (key.clone(), value.to_json()))
                    .collect(),
            ),
            Data::Fragment(reference) => {
                let mut fragments = Map::new();
                for (name, variables) in &reference.fragments {
                    fragments.insert(name.clone(), Value::Object(variables.clone()));
                }
                Value::Object(fragments)
            }
        }
    }
}

impl From<Value> for Data {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Data::Null,
            Value::Bool(value) => Data::Bool(value),
            Value::Number(value) => Data::Number(value),
            Value::String(value) => Data::String(Arc::from(value)),
            Value::Array(items) => Data::list(items.into_iter().map(Data::from)),
            Value::Object(fields) => Data::Object(Arc::new(
                fields
                    .into_iter()
                    .map(|(key, value)| (key, Data::from(value)))
                    .collect(),
            )),
        }
    }
}

impl From<&str> for Data {
    fn from(value: &str) -> Self {
        Data::string(value)
    }
}

impl From<bool> for Data {
    fn from(value: bool) -> Self {
        Data::Bool(value)
    }
}

/// Rebuilds `next` so every subtree structurally equal to its counterpart in
/// `prev` is replaced by the `prev` node itself.
///
/// If nothing changed, the result is `prev` (same `Arc`), so callers detect
/// "no update" with [`Data::same_node`].
pub fn recycle_nodes_into(prev: &Data, next: Data) -> Data {
    match (prev, next) {
        (Data::Object(old), Data::Object(new)) => {
            if Arc::ptr_eq(old, &new) {
                return prev.clone();
            }
            let mut reused_all = old.len() == new.len();
            let mut fields = BTreeMap::new();
            for (key, value) in Arc::unwrap_or_clone(new) {
                let value = match old.get(&key) {
                    Some(previous) => {
                        let recycled = recycle_nodes_into(previous, value);
                        reused_all &= recycled.same_node(previous);
                        recycled
                    }
                    None => {
                        reused_all = false;
                        value
                    }
                };
                fields.insert(key, value);
            }
            if reused_all {
                prev.clone()
            } else {
                Data::Object(Arc::new(fields))
            }
        }
        (Data::List(old), Data::List(new)) => {
            if Arc::ptr_eq(old, &new) {
                return prev.clone();
            }
            let mut reused_all = old.len() == new.len();
            let items: Vec<Data> = Arc::unwrap_or_clone(new)
                .into_iter()
                .enumerate()
                .map(|(index, value)| match old.get(index) {
                    Some(previous) => {
                        let recycled = recycle_nodes_into(previous, value);
                        reused_all &= recycled.same_node(previous);
                        recycled
                    }
                    None => {
                        reused_all = false;
                        value
                    }
                })
                .collect();
            if reused_all {
                prev.clone()
            } else {
                Data::List(Arc::new(items))
            }
        }
        (prev, next) => {
            if *prev == next {
                prev.clone()
            } else {
                next
            }
        }
    }
}
