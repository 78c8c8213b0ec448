//! Structured clone
//!
//! [`serialize`] flattens a [`Value`] graph into a [`SerializedMessage`]
//! that owns no `Rc` and can cross threads. Every reference-type node is
//! written once and referred to by index afterwards, so cycles and shared
//! references survive. [`deserialize`] rebuilds the graph in two passes:
//! first an empty shell per node, then the contents, which lets a node refer
//! to shells created after it.

use std::collections::HashMap;

use thiserror::Error;

use super::value::{SharedBuffer, Value};

/// Deepest container nesting [`serialize`] accepts
pub const MAX_CLONE_DEPTH: usize = 1024;

/// Errors raised while cloning a message
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CloneError {
    #[error("{kind} value could not be cloned")]
    Unserializable { kind: &'static str },

    #[error("value is nested deeper than {limit} levels")]
    TooDeep { limit: usize },
}

/// A value position in the serialized graph
#[derive(Debug, Clone)]
pub enum Slot {
    Undefined,
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    BigInt(i128),
    Str(String),
    /// Index into [`SerializedMessage`] nodes
    Ref(usize),
    Shared(SharedBuffer),
}

/// A reference-type node
#[derive(Debug, Clone)]
pub enum Node {
    Array(Vec<Slot>),
    Object(Vec<(String, Slot)>),
    Bytes(Vec<u8>),
}

/// A thread-transferable copy of a value graph
#[derive(Debug, Clone)]
pub struct SerializedMessage {
    root: Slot,
    nodes: Vec<Node>,
}

impl SerializedMessage {
    /// Number of distinct reference-type nodes
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

struct Serializer {
    nodes: Vec<Node>,
    seen: HashMap<*const (), usize>,
    depth: usize,
}

impl Serializer {
    fn slot(&mut self, value: &Value) -> Result<Slot, CloneError> {
        if let Some(ptr) = value.node_ptr() {
            if let Some(&index) = self.seen.get(&ptr) {
                return Ok(Slot::Ref(index));
            }
        }

        let slot = match value {
            Value::Undefined => Slot::Undefined,
            Value::Null => Slot::Null,
            Value::Bool(b) => Slot::Bool(*b),
            Value::Int(n) => Slot::Int(*n),
            Value::Float(x) => Slot::Float(*x),
            Value::BigInt(n) => Slot::BigInt(*n),
            Value::String(s) => Slot::Str(s.clone()),
            Value::Shared(buf) => Slot::Shared(buf.clone()),
            Value::Array(items) => {
                let index = self.reserve(value);
                self.descend()?;
                let items = items.borrow();
                let mut slots = Vec::with_capacity(items.len());
                for item in items.iter() {
                    slots.push(self.slot(item)?);
                }
                self.depth -= 1;
                self.nodes[index] = Node::Array(slots);
                Slot::Ref(index)
            }
            Value::Object(map) => {
                let index = self.reserve(value);
                self.descend()?;
                let map = map.borrow();
                let mut entries = Vec::with_capacity(map.len());
                for (key, item) in map.iter() {
                    entries.push((key.clone(), self.slot(item)?));
                }
                self.depth -= 1;
                self.nodes[index] = Node::Object(entries);
                Slot::Ref(index)
            }
            Value::Bytes(data) => {
                let index = self.reserve(value);
                self.nodes[index] = Node::Bytes(data.borrow().clone());
                Slot::Ref(index)
            }
            Value::Function(_) | Value::Descriptor(_) => {
                return Err(CloneError::Unserializable { kind: value.kind() })
            }
        };
        Ok(slot)
    }

    /// Enter one container level, failing past [`MAX_CLONE_DEPTH`]
    fn descend(&mut self) -> Result<(), CloneError> {
        if self.depth >= MAX_CLONE_DEPTH {
            return Err(CloneError::TooDeep {
                limit: MAX_CLONE_DEPTH,
            });
        }
        self.depth += 1;
        Ok(())
    }

    /// Claim an index for `value` before visiting its children
    fn reserve(&mut self, value: &Value) -> usize {
        let index = self.nodes.len();
        self.nodes.push(Node::Bytes(Vec::new()));
        if let Some(ptr) = value.node_ptr() {
            self.seen.insert(ptr, index);
        }
        index
    }
}

/// Flatten `value`. Fails without side effects on functions, descriptors
/// and containers nested deeper than [`MAX_CLONE_DEPTH`].
pub fn serialize(value: &Value) -> Result<SerializedMessage, CloneError> {
    let mut serializer = Serializer {
        nodes: Vec::new(),
        seen: HashMap::new(),
        depth: 0,
    };
    let root = serializer.slot(value)?;
    Ok(SerializedMessage {
        root,
        nodes: serializer.nodes,
    })
}

/// Rebuild the graph in the receiving context
pub fn deserialize(message: SerializedMessage) -> Value {
    let SerializedMessage { root, nodes } = message;

    let shells: Vec<Value> = nodes
        .iter()
        .map(|node| match node {
            Node::Array(_) => Value::array(Vec::new()),
            Node::Object(_) => Value::object(Vec::<(String, Value)>::new()),
            Node::Bytes(_) => Value::bytes(Vec::new()),
        })
        .collect();

    for (node, shell) in nodes.into_iter().zip(&shells) {
        match (node, shell) {
            (Node::Array(items), Value::Array(target)) => {
                let items = items.into_iter().map(|s| materialize(s, &shells)).collect();
                *target.borrow_mut() = items;
            }
            (Node::Object(entries), Value::Object(target)) => {
                let entries = entries
                    .into_iter()
                    .map(|(k, s)| (k, materialize(s, &shells)))
                    .collect();
                *target.borrow_mut() = entries;
            }
            (Node::Bytes(data), Value::Bytes(target)) => {
                *target.borrow_mut() = data;
            }
            _ => {}
        }
    }

    materialize(root, &shells)
}

fn materialize(slot: Slot, shells: &[Value]) -> Value {
    match slot {
        Slot::Undefined => Value::Undefined,
        Slot::Null => Value::Null,
        Slot::Bool(b) => Value::Bool(b),
        Slot::Int(n) => Value::Int(n),
        Slot::Float(x) => Value::Float(x),
        Slot::BigInt(n) => Value::BigInt(n),
        Slot::Str(s) => Value::String(s),
        Slot::Ref(index) => shells.get(index).cloned().unwrap_or(Value::Undefined),
        Slot::Shared(buf) => Value::Shared(buf),
    }
}
