// SPDX-License-Identifier: MIT

//! Per-workflow tool catalogue
//!
//! Tools are discovered from the transport once, stored as `Tool` nodes so
//! agents can be bound to them, and cached.

use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::adk::error::Result;
use crate::adk::tool::{ToolRegistration, ToolTransport};
use crate::flow::store::{labels, props, GraphStore, Node};

/// A tool with the id of its `Tool` node
#[derive(Debug, Clone, PartialEq)]
pub struct RegisteredTool {
    pub id: String,
    pub registration: ToolRegistration,
}

impl RegisteredTool {
    fn from_node(node: &Node) -> Result<Self> {
        let mut fields = node.props.clone();
        fields.retain(|_, v| !v.is_null());
        Ok(Self {
            id: node.id().to_string(),
            registration: serde_json::from_value(Value::Object(fields))?,
        })
    }
}

pub struct ToolCatalog {
    workflow_id: String,
    store: Arc<dyn GraphStore>,
    transport: Option<Arc<dyn ToolTransport>>,
    cache: RwLock<Option<Vec<RegisteredTool>>>,
}

impl ToolCatalog {
    pub fn new(
        workflow_id: impl Into<String>,
        store: Arc<dyn GraphStore>,
        transport: Option<Arc<dyn ToolTransport>>,
    ) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            store,
            transport,
            cache: RwLock::new(None),
        }
    }

    /// Cached catalogue; discovers on first use
    pub async fn list(&self) -> Result<Vec<RegisteredTool>> {
        if let Some(tools) = self.cache.read().await.as_ref() {
            return Ok(tools.clone());
        }
        self.refresh().await
    }

    /// Ask the transport again and register tools not stored yet
    pub async fn refresh(&self) -> Result<Vec<RegisteredTool>> {
        let mut cache = self.cache.write().await;
        let scope = props(json!({ "workflow_id": self.workflow_id }));
        let mut tools = self
            .store
            .get_node(labels::TOOL, &scope)
            .await?
            .iter()
            .map(RegisteredTool::from_node)
            .collect::<Result<Vec<_>>>()?;

        if let Some(transport) = &self.transport {
            for discovered in transport.list_tools().await? {
                if tools.iter().any(|t| t.registration.name == discovered.name) {
                    continue;
                }
                let mut record = props(serde_json::to_value(&discovered)?);
                record.insert("workflow_id".to_string(), json!(self.workflow_id));
                let node = self.store.add_node(labels::TOOL, record).await?;
                log::info!("Registered tool '{}' for workflow {}", discovered.name, self.workflow_id);
                tools.push(RegisteredTool {
                    id: node.id().to_string(),
                    registration: discovered,
                });
            }
        } else {
            log::debug!("Workflow {} has no tool transport", self.workflow_id);
        }

        *cache = Some(tools.clone());
        Ok(tools)
    }

    pub async fn find_by_name(&self, name: &str) -> Result<Option<RegisteredTool>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .find(|t| t.registration.name == name))
    }
}
