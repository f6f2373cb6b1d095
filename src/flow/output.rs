// SPDX-License-Identifier: MIT

//! Step outputs: the persisted result of one agent within one run
//!
//! At most one record exists per `(workflow_id, agent_id, run_id)`. It is
//! created empty when the agent starts, so "in progress" and "absent" are
//! distinguishable, and filled in when the agent finishes.

use serde_json::{json, Value};
use std::sync::Arc;

use crate::adk::error::Result;
use crate::flow::store::{labels, props, GraphStore, Node, Props, NODE_ID};

/// A stored step output
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutput {
    pub id: String,
    pub workflow_id: String,
    pub agent_id: String,
    pub run_id: String,
    pub name: String,
    pub kind: String,
    pub content: Value,
}

impl StepOutput {
    fn from_node(node: &Node) -> Self {
        let text = |key: &str| node.get_str(key).unwrap_or_default().to_string();
        Self {
            id: node.id().to_string(),
            workflow_id: text("workflow_id"),
            agent_id: text("agent_id"),
            run_id: text("run_id"),
            name: text("name"),
            kind: text("kind"),
            content: node.get("content").cloned().unwrap_or(Value::Null),
        }
    }

    /// Content as prompt text; structured content is rendered as JSON
    pub fn text(&self) -> String {
        match &self.content {
            Value::Null => String::new(),
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.text().is_empty()
    }
}

/// Step output access for one workflow
#[derive(Clone)]
pub struct StepOutputs {
    workflow_id: String,
    store: Arc<dyn GraphStore>,
}

impl StepOutputs {
    pub fn new(workflow_id: impl Into<String>, store: Arc<dyn GraphStore>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            store,
        }
    }

    fn key(&self, agent_id: &str, run_id: &str) -> Props {
        props(json!({
            "workflow_id": self.workflow_id,
            "agent_id": agent_id,
            "run_id": run_id,
        }))
    }

    pub async fn find(&self, agent_id: &str, run_id: &str) -> Result<Option<StepOutput>> {
        let nodes = self
            .store
            .get_node(labels::STEP_OUTPUT, &self.key(agent_id, run_id))
            .await?;
        Ok(nodes.first().map(StepOutput::from_node))
    }

    /// Output of the agent called `name` in `run_id`
    pub async fn find_by_name(&self, name: &str, run_id: &str) -> Result<Option<StepOutput>> {
        let filter = props(json!({
            "workflow_id": self.workflow_id,
            "name": name,
            "run_id": run_id,
        }));
        let nodes = self.store.get_node(labels::STEP_OUTPUT, &filter).await?;
        Ok(nodes.first().map(StepOutput::from_node))
    }

    pub async fn clear(&self, agent_id: &str, run_id: &str) -> Result<usize> {
        Ok(self
            .store
            .delete_node(labels::STEP_OUTPUT, &self.key(agent_id, run_id))
            .await?)
    }

    /// In-progress record with empty content
    pub async fn create_empty(
        &self,
        agent_id: &str,
        run_id: &str,
        name: &str,
        kind: &str,
    ) -> Result<StepOutput> {
        let mut record = self.key(agent_id, run_id);
        record.insert("name".to_string(), json!(name));
        record.insert("kind".to_string(), json!(kind));
        record.insert("content".to_string(), json!(""));
        let node = self.store.add_node(labels::STEP_OUTPUT, record).await?;
        Ok(StepOutput::from_node(&node))
    }

    pub async fn write(&self, output_id: &str, content: Value) -> Result<()> {
        let mut filter = Props::new();
        filter.insert(NODE_ID.to_string(), Value::String(output_id.to_string()));
        self.store
            .update_node(labels::STEP_OUTPUT, &filter, props(json!({ "content": content })))
            .await?;
        Ok(())
    }

    /// Drop an agent's outputs across every run
    pub async fn delete_for_agent(&self, agent_id: &str) -> Result<usize> {
        let filter = props(json!({
            "workflow_id": self.workflow_id,
            "agent_id": agent_id,
        }));
        Ok(self.store.delete_node(labels::STEP_OUTPUT, &filter).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::store::MemoryGraphStore;

    fn outputs() -> StepOutputs {
        StepOutputs::new("wf", Arc::new(MemoryGraphStore::new()))
    }

    #[tokio::test]
    async fn test_empty_then_written() {
        let io = outputs();
        let created = io.create_empty("a", "r1", "writer", "plain_text").await.unwrap();
        let pending = io.find("a", "r1").await.unwrap().unwrap();
        assert!(pending.is_empty());

        io.write(&created.id, json!({"a": 3, "b": 5, "sum": 8})).await.unwrap();
        let done = io.find("a", "r1").await.unwrap().unwrap();
        assert_eq!(done.content["sum"], 8);
        assert_eq!(done.text(), r#"{"a":3,"b":5,"sum":8}"#);
    }

    #[tokio::test]
    async fn test_scoped_by_run() {
        let io = outputs();
        io.create_empty("a", "r1", "writer", "plain_text").await.unwrap();
        assert!(io.find("a", "r2").await.unwrap().is_none());
        assert!(io.find_by_name("writer", "r1").await.unwrap().is_some());
        assert!(io.find_by_name("writer", "r2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_clear_leaves_other_agents() {
        let io = outputs();
        io.create_empty("a", "r1", "a", "plain_text").await.unwrap();
        io.create_empty("b", "r1", "b", "plain_text").await.unwrap();

        assert_eq!(io.clear("a", "r1").await.unwrap(), 1);
        assert!(io.find("a", "r1").await.unwrap().is_none());
        assert!(io.find("b", "r1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_delete_for_agent_spans_runs() {
        let io = outputs();
        io.create_empty("a", "r1", "a", "plain_text").await.unwrap();
        io.create_empty("a", "r2", "a", "plain_text").await.unwrap();
        assert_eq!(io.delete_for_agent("a").await.unwrap(), 2);
    }
}
