//! Workflow loader - YAML file loading and store seeding
//!
//! A workflow file names its agents and wires them by name:
//!
//! ```yaml
//! name: arithmetic
//! engine:
//!   feedback_timeout_secs: 60
//! mcp_server:
//!   command: ./calculator-server
//! agents:
//!   - name: planner
//!     task: "What is 3 + 5?"
//!     next: [adder]
//!   - name: adder
//!     task: "Add the numbers in {{planner}}"
//!     tools: [add]
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::Arc;

use crate::adk::error::{FlowError, Result};
use crate::flow::config::{EngineConfig, OutputKind};
use crate::flow::mcp::McpServerConfig;
use crate::flow::workflow::{AgentConfig, Workflow, WorkflowManager};

/// One agent entry of a workflow file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentDefinition {
    pub name: String,
    #[serde(default)]
    pub task: String,
    #[serde(default)]
    pub output_kind: Option<OutputKind>,
    /// Agents entered after this one
    #[serde(default)]
    pub next: Vec<String>,
    /// Extra data dependencies beyond those implied by `next`
    #[serde(default)]
    pub inputs: Vec<String>,
    /// Names of tools this agent may call
    #[serde(default)]
    pub tools: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,
    /// Partial override of the engine configuration
    #[serde(default)]
    pub engine: Option<Value>,
    #[serde(default)]
    pub mcp_server: Option<McpServerConfig>,
    #[serde(default)]
    pub agents: Vec<AgentDefinition>,
}

fn merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                merge(base.entry(key).or_insert(Value::Null), value);
            }
        }
        (base, overlay) => *base = overlay,
    }
}

impl WorkflowDefinition {
    /// `base` with the file's `engine:` section laid over it
    pub fn engine_config(&self, base: EngineConfig) -> Result<EngineConfig> {
        let Some(engine) = &self.engine else {
            return Ok(base);
        };
        let mut merged = serde_json::to_value(&base)?;
        merge(&mut merged, engine.clone());
        let config: EngineConfig = serde_json::from_value(merged)
            .map_err(|e| FlowError::config(format!("invalid engine section: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for agent in &self.agents {
            if !seen.insert(agent.name.as_str()) {
                return Err(FlowError::config(format!("agent '{}' is defined twice", agent.name)));
            }
        }
        for agent in &self.agents {
            for target in agent.next.iter().chain(&agent.inputs) {
                if !seen.contains(target.as_str()) {
                    return Err(FlowError::config(format!(
                        "agent '{}' refers to unknown agent '{}'",
                        agent.name, target
                    )));
                }
            }
        }
        Ok(())
    }

    /// Create the workflow in the manager's store and wire it up
    pub async fn seed(&self, manager: &WorkflowManager) -> Result<Arc<Workflow>> {
        self.validate()?;
        let workflow = manager.create_workflow(&self.name).await?;

        let mut ids = HashMap::new();
        for agent in &self.agents {
            let id = workflow
                .add_agent(&AgentConfig {
                    name: agent.name.clone(),
                    task: agent.task.clone(),
                    output_kind: agent.output_kind,
                })
                .await?;
            ids.insert(agent.name.as_str(), id);
        }

        for agent in &self.agents {
            let id = &ids[agent.name.as_str()];
            for next in &agent.next {
                workflow.add_edge(id, &ids[next.as_str()]).await?;
            }
            for input in &agent.inputs {
                workflow.add_input(id, &ids[input.as_str()]).await?;
            }
            for tool in &agent.tools {
                let registered = workflow
                    .find_tool(tool)
                    .await?
                    .ok_or_else(|| FlowError::not_found("tool", tool.as_str()))?;
                workflow.add_tool(id, &registered.id).await?;
            }
        }

        log::info!(
            "Seeded workflow '{}' with {} agents",
            self.name,
            self.agents.len()
        );
        Ok(workflow)
    }
}

/// Loads workflow definitions from YAML files
pub struct WorkflowLoader;

impl WorkflowLoader {
    pub fn load_workflow<P: AsRef<Path>>(path: P) -> Result<WorkflowDefinition> {
        let content = fs::read_to_string(path)?;
        Self::parse_yaml(&content)
    }

    pub fn parse_yaml(content: &str) -> Result<WorkflowDefinition> {
        Ok(serde_yaml::from_str(content)?)
    }
}
