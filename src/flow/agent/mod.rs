// SPDX-License-Identifier: MIT

//! Agents: one executable step of a workflow graph
//!
//! - [prompt] - task materialization, prompt composition, answer parsing
//! - [AgentExecutor] - runs one agent under a run context
//! - [PipeElicitor] - routes tool elicitations through the event pipe

mod elicit;
mod executor;
pub mod prompt;

pub use elicit::PipeElicitor;
pub use executor::AgentExecutor;

use serde_json::Value;

use crate::adk::error::{FlowError, Result};
use crate::flow::config::OutputKind;
use crate::flow::store::{labels, Node};

/// Agent as stored in the graph
#[derive(Debug, Clone, PartialEq)]
pub struct AgentSpec {
    pub id: String,
    pub name: String,
    pub task: String,
    pub output_kind: OutputKind,
}

impl AgentSpec {
    pub fn from_node(node: &Node, default_kind: OutputKind) -> Result<Self> {
        if node.label != labels::AGENT {
            return Err(FlowError::other(format!(
                "node {} is a {}, not an agent",
                node.id(),
                node.label
            )));
        }
        let output_kind = match node.get_str("output_kind") {
            Some(kind) => kind.parse()?,
            None => default_kind,
        };
        Ok(Self {
            id: node.id().to_string(),
            name: node
                .get_str("name")
                .map(str::to_string)
                .unwrap_or_else(|| format!("agent_{}", node.id())),
            task: node.get_str("task").unwrap_or_default().to_string(),
            output_kind,
        })
    }
}

/// What the scheduler should do after an agent finished
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionResult {
    /// Follow the static NEXT edges
    Continue,
    /// Enter the agent with this name instead of the static edges
    JumpTo(String),
    /// Tools ran; their payloads in call order
    ToolResults(Vec<Value>),
}

impl ExecutionResult {
    pub fn jump_target(&self) -> Option<&str> {
        match self {
            ExecutionResult::JumpTo(name) => Some(name),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::store::props;
    use serde_json::json;

    fn node(p: Value) -> Node {
        Node {
            label: labels::AGENT.to_string(),
            props: props(p),
        }
    }

    #[test]
    fn test_spec_defaults() {
        let spec = AgentSpec::from_node(&node(json!({"node_id": "n1"})), OutputKind::PlainText)
            .unwrap();
        assert_eq!(spec.name, "agent_n1");
        assert_eq!(spec.task, "");
        assert_eq!(spec.output_kind, OutputKind::PlainText);
    }

    #[test]
    fn test_spec_reads_output_kind() {
        let spec = AgentSpec::from_node(
            &node(json!({"node_id": "n1", "name": "router", "output_kind": "json"})),
            OutputKind::PlainText,
        )
        .unwrap();
        assert_eq!(spec.output_kind, OutputKind::Json);
    }

    #[test]
    fn test_spec_rejects_other_labels() {
        let tool = Node {
            label: labels::TOOL.to_string(),
            props: props(json!({"node_id": "t"})),
        };
        assert!(AgentSpec::from_node(&tool, OutputKind::PlainText).is_err());
    }
}
