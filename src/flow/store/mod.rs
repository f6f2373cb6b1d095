// SPDX-License-Identifier: MIT

//! Property-graph store contract
//!
//! The engine persists everything (agents, edges, run contexts, step
//! outputs, tool registrations) through this interface. Nodes are property
//! maps with a store-assigned `node_id`; relationships are typed, directed
//! and carry no properties.

mod memory;

pub use memory::MemoryGraphStore;

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

use crate::adk::error::StoreError;

/// Node property map
pub type Props = Map<String, Value>;

/// Key under which the store keeps a node's identity
pub const NODE_ID: &str = "node_id";

/// Node labels used by the engine
pub mod labels {
    pub const WORKFLOW: &str = "Workflow";
    pub const AGENT: &str = "Agent";
    pub const RUN_CONTEXT: &str = "RunContext";
    pub const STEP_OUTPUT: &str = "IOData";
    pub const TOOL: &str = "Tool";
}

/// Relationship types used by the engine
pub mod rels {
    /// Control flow `src -> dst`
    pub const NEXT: &str = "NEXT";
    /// Data dependency: `dst -> src` means dst consumes src's output
    pub const INPUT: &str = "INPUT";
    /// Agent is allowed to call a tool
    pub const USE_TOOL: &str = "USE_TOOL";
}

/// Build a property map from a `json!({...})` object literal
pub fn props(value: Value) -> Props {
    match value {
        Value::Object(map) => map,
        _ => Props::new(),
    }
}

/// A stored node
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub label: String,
    pub props: Props,
}

impl Node {
    pub fn id(&self) -> &str {
        self.get_str(NODE_ID).unwrap_or_default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.props.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.props.get(key).and_then(Value::as_str)
    }

    /// True when every filter entry is present with an equal value
    pub fn matches(&self, filter: &Props) -> bool {
        filter.iter().all(|(k, v)| self.props.get(k) == Some(v))
    }
}

/// One relationship of a matched path: `(src) -[rel_type]-> (dst)`
#[derive(Debug, Clone, PartialEq)]
pub struct Relationship {
    pub src: Node,
    pub rel_type: String,
    pub dst: Node,
}

/// Path length filter for relationship queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HopRange {
    Exact(usize),
    Range(usize, usize),
    /// One or more hops
    #[default]
    Unbounded,
}

impl HopRange {
    pub fn min(&self) -> usize {
        match self {
            HopRange::Exact(n) => *n,
            HopRange::Range(lo, _) => *lo,
            HopRange::Unbounded => 1,
        }
    }

    /// Upper bound, `None` when unbounded
    pub fn max(&self) -> Option<usize> {
        match self {
            HopRange::Exact(n) => Some(*n),
            HopRange::Range(_, hi) => Some(*hi),
            HopRange::Unbounded => None,
        }
    }

    pub fn contains(&self, hops: usize) -> bool {
        hops >= self.min() && self.max().map_or(true, |hi| hops <= hi)
    }
}

impl FromStr for HopRange {
    type Err = StoreError;

    /// Accepts `""`, `"n"` and `"n1..n2"`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(HopRange::Unbounded);
        }
        let parse = |part: &str| {
            part.trim()
                .parse::<usize>()
                .map_err(|_| StoreError::Constraint(format!("invalid hop count '{}'", s)))
        };
        match s.split_once("..") {
            Some((lo, hi)) => {
                let (lo, hi) = (parse(lo)?, parse(hi)?);
                if lo > hi {
                    return Err(StoreError::Constraint(format!("empty hop range '{}'", s)));
                }
                Ok(HopRange::Range(lo, hi))
            }
            None => Ok(HopRange::Exact(parse(s)?)),
        }
    }
}

impl fmt::Display for HopRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HopRange::Exact(n) => write!(f, "{}", n),
            HopRange::Range(lo, hi) => write!(f, "{}..{}", lo, hi),
            HopRange::Unbounded => Ok(()),
        }
    }
}

/// Pattern for relationship lookups and deletions
#[derive(Debug, Clone, Default)]
pub struct RelQuery {
    pub src_label: Option<String>,
    pub src_props: Props,
    pub target_props: Props,
    /// Empty means any type
    pub rel_types: Vec<String>,
    pub hop: HopRange,
}

impl RelQuery {
    /// Single-hop query from the node with `src_id`
    pub fn outgoing(src_label: &str, src_id: &str, rel_type: &str) -> Self {
        let mut src_props = Props::new();
        src_props.insert(NODE_ID.to_string(), Value::String(src_id.to_string()));
        Self {
            src_label: Some(src_label.to_string()),
            src_props,
            rel_types: vec![rel_type.to_string()],
            hop: HopRange::Exact(1),
            ..Default::default()
        }
    }

    /// Restrict the far end of the path to the node with `target_id`
    pub fn to_target(mut self, target_id: &str) -> Self {
        self.target_props
            .insert(NODE_ID.to_string(), Value::String(target_id.to_string()));
        self
    }

    pub fn with_hop(mut self, hop: HopRange) -> Self {
        self.hop = hop;
        self
    }
}

/// Node/edge CRUD and pattern-matched traversal
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// All nodes with `label` matching every entry in `filter` (empty = all)
    async fn get_node(&self, label: &str, filter: &Props) -> Result<Vec<Node>, StoreError>;

    /// Create a node; the store assigns a unique `node_id`
    async fn add_node(&self, label: &str, props: Props) -> Result<Node, StoreError>;

    /// Merge `props` into every matching node. Fails if nothing matches.
    async fn update_node(
        &self,
        label: &str,
        filter: &Props,
        props: Props,
    ) -> Result<Vec<Node>, StoreError>;

    /// Delete matching nodes and their relationships; returns how many went
    async fn delete_node(&self, label: &str, filter: &Props) -> Result<usize, StoreError>;

    /// Distinct relationships on every path matching `query`
    async fn get_relationship(&self, query: &RelQuery) -> Result<Vec<Relationship>, StoreError>;

    /// Create `src -[rel_type]-> dst`; a duplicate edge is a no-op
    async fn add_relationship(
        &self,
        src_label: &str,
        src_id: &str,
        rel_type: &str,
        dst_label: &str,
        dst_id: &str,
    ) -> Result<(), StoreError>;

    /// Delete single-hop relationships matching `query`; returns how many went
    async fn delete_relationship(&self, query: &RelQuery) -> Result<usize, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_hop_range_parse() {
        assert_eq!("".parse::<HopRange>().unwrap(), HopRange::Unbounded);
        assert_eq!("1".parse::<HopRange>().unwrap(), HopRange::Exact(1));
        assert_eq!("0..10".parse::<HopRange>().unwrap(), HopRange::Range(0, 10));
        assert!("3..1".parse::<HopRange>().is_err());
        assert!("x".parse::<HopRange>().is_err());
    }

    #[test]
    fn test_hop_range_contains() {
        assert!(HopRange::Unbounded.contains(7));
        assert!(!HopRange::Unbounded.contains(0));
        assert!(HopRange::Range(0, 2).contains(0));
        assert!(!HopRange::Exact(1).contains(2));
    }

    #[test]
    fn test_hop_range_display_roundtrips_text_form() {
        assert_eq!(HopRange::Range(1, 3).to_string(), "1..3");
        assert_eq!(HopRange::Unbounded.to_string(), "");
    }

    #[test]
    fn test_node_matches() {
        let node = Node {
            label: labels::AGENT.to_string(),
            props: props(json!({"node_id": "a", "workflow_id": "w", "n": 1})),
        };
        assert!(node.matches(&props(json!({"workflow_id": "w"}))));
        assert!(node.matches(&Props::new()));
        assert!(!node.matches(&props(json!({"n": 2}))));
        assert_eq!(node.id(), "a");
    }
}
