//! A tagged-union value graph addressed by arena index rather than by
//! pointer, so that the sanitizer's cycle guard can be expressed as a plain
//! `HashSet<usize>` of indices instead of identity-keyed `Rc`/`Weak`
//! bookkeeping (see `SPEC_FULL.md` §4.2).
//!
//! `serde_json::Value` is a tree and cannot itself hold a back-reference;
//! embedders with a genuinely cyclic object graph build a [`ValueArena`]
//! directly (pushing a node, then later pointing a descendant's `NodeId`
//! back at it), or convert from JSON via [`ValueArena::from_json`] for the
//! common acyclic case.

use std::collections::HashMap;

use serde_json::{Map, Value as Json};

/// Index of a node within a [`ValueArena`]. Two equal `NodeId`s in the same
/// arena denote the same node, which is how a cycle is represented: a
/// descendant's `NodeId` equals one of its own ancestors'.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub usize);

/// One node in the value graph. Variants are a dispatch table over the
/// polymorphic shapes the sanitizer must handle — new container kinds are
/// new variants here, not subclasses.
#[derive(Debug, Clone)]
pub enum Node {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    /// A function/closure value — always maps to `"[Function]"`.
    Function,
    /// Passed through by value (RFC3339 text, already a string rendering).
    Date(String),
    /// Passed through by value (source text of the pattern).
    Regex(String),
    /// Opaque byte buffer — always maps to `"[Binary Data]"`.
    Bytes(Vec<u8>),
    /// An in-flight future/promise — always maps to `"[Promise]"`.
    Promise,
    /// `WeakMap`/`WeakSet`-like collection — maps to `"[<tag>]"`.
    WeakCollection(&'static str),
    /// `name` is copied verbatim; `message`/`stack` are recursed.
    Error { name: String, message: NodeId, stack: NodeId },
    Array(Vec<NodeId>),
    /// Keyed mapping with non-string-only keys and value iteration order
    /// (the spec's "keyed mapping with iteration"), distinct from `Object`
    /// which carries own-enumerable string keys.
    Map(Vec<(NodeId, NodeId)>),
    /// Unordered collection; the sanitizer may collapse duplicates that
    /// become equal after sanitizing each element.
    Set(Vec<NodeId>),
    /// A plain object or class instance. `type_tag` is the constructor/class
    /// name when the source is not a plain object; fields preserve own
    /// enumerable key order.
    Object { type_tag: Option<String>, fields: Vec<(String, NodeId)> },
    /// A value whose property access is known to raise. Only ever produced
    /// by a caller simulating a throwing accessor; the sanitizer turns any
    /// reference to this node into `"[Error accessing property]"`.
    Poisoned,
}

#[derive(Debug, Default, Clone)]
pub struct ValueArena {
    nodes: Vec<Node>,
}

impl ValueArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, node: Node) -> NodeId {
        self.nodes.push(node);
        NodeId(self.nodes.len() - 1)
    }

    pub fn push_string(&mut self, s: impl Into<String>) -> NodeId {
        self.push(Node::String(s.into()))
    }

    pub fn get(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Build a cycle-free arena from a `serde_json::Value`. Objects get no
    /// `type_tag` (a plain object, per the dispatch rules).
    pub fn from_json(value: &Json) -> (Self, NodeId) {
        let mut arena = ValueArena::new();
        let root = arena.push_json(value);
        (arena, root)
    }

    fn push_json(&mut self, value: &Json) -> NodeId {
        match value {
            Json::Null => self.push(Node::Null),
            Json::Bool(b) => self.push(Node::Bool(*b)),
            Json::Number(n) => self.push(Node::Number(n.as_f64().unwrap_or(0.0))),
            Json::String(s) => self.push(Node::String(s.clone())),
            Json::Array(items) => {
                let ids: Vec<NodeId> = items.iter().map(|v| self.push_json(v)).collect();
                self.push(Node::Array(ids))
            }
            Json::Object(map) => {
                let fields: Vec<(String, NodeId)> =
                    map.iter().map(|(k, v)| (k.clone(), self.push_json(v))).collect();
                self.push(Node::Object { type_tag: None, fields })
            }
        }
    }

    /// Render an (assumed acyclic) subgraph back to `serde_json::Value`.
    /// Tokens the sanitizer emits (`"[CIRCULAR]"`, etc.) round-trip as
    /// plain strings, which is exactly the JSON shape a sink expects.
    pub fn to_json(&self, root: NodeId) -> Json {
        match self.get(root) {
            Node::Null => Json::Null,
            Node::Bool(b) => Json::Bool(*b),
            Node::Number(n) => serde_json::Number::from_f64(*n)
                .map(Json::Number)
                .unwrap_or(Json::Null),
            Node::String(s) => Json::String(s.clone()),
            Node::Function => Json::String("[Function]".to_string()),
            Node::Date(s) | Node::Regex(s) => Json::String(s.clone()),
            Node::Bytes(_) => Json::String("[Binary Data]".to_string()),
            Node::Promise => Json::String("[Promise]".to_string()),
            Node::WeakCollection(tag) => Json::String(format!("[{tag}]")),
            Node::Error { name, message, stack } => {
                let mut map = Map::new();
                map.insert("name".to_string(), Json::String(name.clone()));
                map.insert("message".to_string(), self.to_json(*message));
                map.insert("stack".to_string(), self.to_json(*stack));
                Json::Object(map)
            }
            Node::Array(items) => Json::Array(items.iter().map(|id| self.to_json(*id)).collect()),
            Node::Map(pairs) => {
                // JSON has no native map-with-arbitrary-key type; render as
                // an array of [key, value] pairs, which preserves iteration
                // order and both key and value sanitization losslessly.
                Json::Array(
                    pairs
                        .iter()
                        .map(|(k, v)| Json::Array(vec![self.to_json(*k), self.to_json(*v)]))
                        .collect(),
                )
            }
            Node::Set(items) => Json::Array(items.iter().map(|id| self.to_json(*id)).collect()),
            Node::Object { type_tag, fields } => {
                let mut map = Map::new();
                for (k, v) in fields {
                    map.insert(k.clone(), self.to_json(*v));
                }
                if let Some(tag) = type_tag {
                    map.insert("__type".to_string(), Json::String(tag.clone()));
                }
                Json::Object(map)
            }
            Node::Poisoned => Json::String("[Error accessing property]".to_string()),
        }
    }

    /// Deep-copy the subgraph reachable from `root`, preserving any cycles
    /// (a back-reference in the source copies to a back-reference in the
    /// destination via the `old -> new` memo). Used for the identity path
    /// (policy disabled / development mode) where the spec requires
    /// `sanitize(v) == v`.
    pub fn deep_copy(&self, root: NodeId) -> (ValueArena, NodeId) {
        let mut out = ValueArena::new();
        let mut memo: HashMap<usize, NodeId> = HashMap::new();
        let new_root = self.copy_node(root, &mut memo, &mut out);
        (out, new_root)
    }

    fn copy_node(&self, id: NodeId, memo: &mut HashMap<usize, NodeId>, out: &mut ValueArena) -> NodeId {
        if let Some(existing) = memo.get(&id.0) {
            return *existing;
        }
        match self.get(id).clone() {
            Node::Null => out.push(Node::Null),
            Node::Bool(b) => out.push(Node::Bool(b)),
            Node::Number(n) => out.push(Node::Number(n)),
            Node::String(s) => out.push(Node::String(s)),
            Node::Function => out.push(Node::Function),
            Node::Date(s) => out.push(Node::Date(s)),
            Node::Regex(s) => out.push(Node::Regex(s)),
            Node::Bytes(b) => out.push(Node::Bytes(b)),
            Node::Promise => out.push(Node::Promise),
            Node::WeakCollection(tag) => out.push(Node::WeakCollection(tag)),
            Node::Poisoned => out.push(Node::Poisoned),
            Node::Error { name, message, stack } => {
                // Reserve the slot before recursing so self-referential
                // errors (unusual, but structurally possible) resolve.
                let placeholder = out.push(Node::Null);
                memo.insert(id.0, placeholder);
                let message = self.copy_node(message, memo, out);
                let stack = self.copy_node(stack, memo, out);
                *out.node_mut(placeholder) = Node::Error { name, message, stack };
                return placeholder;
            }
            Node::Array(items) => {
                let placeholder = out.push(Node::Null);
                memo.insert(id.0, placeholder);
                let items: Vec<NodeId> = items.into_iter().map(|c| self.copy_node(c, memo, out)).collect();
                *out.node_mut(placeholder) = Node::Array(items);
                return placeholder;
            }
            Node::Set(items) => {
                let placeholder = out.push(Node::Null);
                memo.insert(id.0, placeholder);
                let items: Vec<NodeId> = items.into_iter().map(|c| self.copy_node(c, memo, out)).collect();
                *out.node_mut(placeholder) = Node::Set(items);
                return placeholder;
            }
            Node::Map(pairs) => {
                let placeholder = out.push(Node::Null);
                memo.insert(id.0, placeholder);
                let pairs: Vec<(NodeId, NodeId)> = pairs
                    .into_iter()
                    .map(|(k, v)| (self.copy_node(k, memo, out), self.copy_node(v, memo, out)))
                    .collect();
                *out.node_mut(placeholder) = Node::Map(pairs);
                return placeholder;
            }
            Node::Object { type_tag, fields } => {
                let placeholder = out.push(Node::Null);
                memo.insert(id.0, placeholder);
                let fields: Vec<(String, NodeId)> = fields
                    .into_iter()
                    .map(|(k, v)| (k, self.copy_node(v, memo, out)))
                    .collect();
                *out.node_mut(placeholder) = Node::Object { type_tag, fields };
                return placeholder;
            }
        };
        let new_id = NodeId(out.len() - 1);
        memo.insert(id.0, new_id);
        new_id
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.0]
    }
}
