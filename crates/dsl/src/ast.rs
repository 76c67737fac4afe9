//! Abstract syntax tree for Boogie programs
//!
//! Nodes live in a flat arena owned by [`Ast`] and refer to each other by
//! [`NodeId`]. Children are owned top-down; the `parent` link exists only so
//! the parser can return to a join or match after one of its closures ends.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Index of a node inside its [`Ast`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub usize);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Condition selecting a match arm
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Guard {
    /// `default`: always matches
    Default,
    /// `ok`: the accumulator is truthy
    Ok,
    /// `"text"`: the accumulator renders exactly as `text`
    Equals(String),
    /// `name`: memory slot `name` is truthy
    Memory(String),
}

impl fmt::Display for Guard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Guard::Default => f.write_str("default"),
            Guard::Ok => f.write_str("ok"),
            Guard::Equals(text) => write!(f, "\"{}\"", text),
            Guard::Memory(key) => f.write_str(key),
        }
    }
}

/// A named, dispatchable unit of work
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub name: String,
    pub behavior: Option<String>,
    pub parameters: BTreeMap<String, String>,
}

impl Operation {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            behavior: None,
            parameters: BTreeMap::new(),
        }
    }

    /// Record a literal argument: `key=value` is named, anything else positional
    ///
    /// A positional argument takes the first `argN` slot not already used,
    /// so it never overwrites an earlier argument. A repeated named key keeps
    /// the last value.
    pub fn push_argument(&mut self, literal: &str) {
        match literal.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() => {
                self.parameters
                    .insert(key.trim().to_string(), value.to_string());
            }
            _ => {
                let slot = (0..)
                    .map(|n| format!("arg{}", n))
                    .find(|key| !self.parameters.contains_key(key))
                    .unwrap_or_default();
                self.parameters.insert(slot, literal.to_string());
            }
        }
    }
}

/// Node payloads
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKind {
    /// Root, owns exactly one closure
    Program,
    /// Parenthesized, ordered statements
    Closure,
    /// Operation whose children are its outcomes
    Operation(Operation),
    /// Outcome label of the parent operation
    Outcome(String),
    /// Parallel closures that must all finish
    Join,
    /// Guarded closures; `guards[i]` belongs to child `i`
    Match { guards: Vec<Guard> },
}

impl NodeKind {
    pub fn name(&self) -> &'static str {
        match self {
            NodeKind::Program => "program",
            NodeKind::Closure => "closure",
            NodeKind::Operation(_) => "operation",
            NodeKind::Outcome(_) => "outcome",
            NodeKind::Join => "join",
            NodeKind::Match { .. } => "match",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub kind: NodeKind,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    pub line: usize,
    pub column: usize,
}

/// Arena holding every node of one parsed program
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ast {
    nodes: Vec<Node>,
}

impl Default for Ast {
    fn default() -> Self {
        Self::new()
    }
}

impl Ast {
    /// Create an arena containing only the `Program` root
    pub fn new() -> Self {
        Self {
            nodes: vec![Node {
                kind: NodeKind::Program,
                parent: None,
                children: Vec::new(),
                line: 1,
                column: 1,
            }],
        }
    }

    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.0)
    }

    pub(crate) fn get_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(id.0)
    }

    /// Children of `id`, empty for an unknown id
    pub fn children(&self, id: NodeId) -> &[NodeId] {
        self.get(id).map(|n| n.children.as_slice()).unwrap_or(&[])
    }

    pub fn kind(&self, id: NodeId) -> Option<&NodeKind> {
        self.get(id).map(|n| &n.kind)
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.get(id).and_then(|n| n.parent)
    }

    /// Append a node under `parent` and return its id
    pub fn add_child(&mut self, parent: NodeId, kind: NodeKind, line: usize, column: usize) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            kind,
            parent: Some(parent),
            children: Vec::new(),
            line,
            column,
        });
        if let Some(node) = self.nodes.get_mut(parent.0) {
            node.children.push(id);
        }
        id
    }

    /// Indented outline of the tree, one node per line
    pub fn outline(&self) -> String {
        let mut out = String::new();
        self.outline_node(self.root(), 0, &mut out);
        out
    }

    fn outline_node(&self, id: NodeId, depth: usize, out: &mut String) {
        let Some(node) = self.get(id) else {
            return;
        };

        out.push_str(&"  ".repeat(depth));
        match &node.kind {
            NodeKind::Operation(op) => {
                out.push_str("operation ");
                out.push_str(&op.name);
                if let Some(behavior) = &op.behavior {
                    out.push_str(&format!("<{}>", behavior));
                }
                for (key, value) in &op.parameters {
                    out.push_str(&format!(" {}={:?}", key, value));
                }
            }
            NodeKind::Outcome(label) => {
                out.push_str("outcome ");
                out.push_str(label);
            }
            NodeKind::Match { guards } => {
                let guards: Vec<String> = guards.iter().map(|g| g.to_string()).collect();
                out.push_str(&format!("match [{}]", guards.join(", ")));
            }
            other => out.push_str(other.name()),
        }
        out.push('\n');

        for child in &node.children {
            self.outline_node(*child, depth + 1, out);
        }
    }
}
