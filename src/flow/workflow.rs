// SPDX-License-Identifier: MIT

//! Workflow handles and the manager that owns them
//!
//! A [`Workflow`] is the editing and execution surface of one stored
//! workflow: agents, edges, tool bindings, run selection and the feedback
//! path into a running pipe.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::adk::error::{FlowError, Result, StoreError};
use crate::adk::model::Model;
use crate::adk::tool::{ToolRegistration, ToolTransport};
use crate::flow::agent::{AgentExecutor, AgentSpec};
use crate::flow::config::{EngineConfig, OutputKind};
use crate::flow::output::StepOutput;
use crate::flow::pipe::{EventPipe, FeedbackMessage, FeedbackStatus};
use crate::flow::run_context::RunContext;
use crate::flow::scheduler::{RunSession, Scheduler};
use crate::flow::store::{labels, props, rels, GraphStore, Props, RelQuery, NODE_ID};
use crate::flow::tools::{RegisteredTool, ToolCatalog};

/// Fields accepted when creating an agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub name: String,
    #[serde(default)]
    pub task: String,
    #[serde(default)]
    pub output_kind: Option<OutputKind>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GraphNode {
    pub id: String,
    pub name: String,
    pub output_kind: OutputKind,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GraphEdge {
    pub src: String,
    pub dst: String,
}

/// Renderable snapshot of the control-flow graph
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentGraph {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
}

fn id_filter(id: &str) -> Props {
    let mut filter = Props::new();
    filter.insert(NODE_ID.to_string(), Value::String(id.to_string()));
    filter
}

pub struct Workflow {
    id: String,
    name: String,
    store: Arc<dyn GraphStore>,
    scheduler: Arc<Scheduler>,
    tools: ToolCatalog,
    selected: RwLock<Option<Arc<RunContext>>>,
    pipe: RwLock<Option<Arc<EventPipe>>>,
}

impl Workflow {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        store: Arc<dyn GraphStore>,
        model: Arc<dyn Model>,
        transport: Option<Arc<dyn ToolTransport>>,
        config: Arc<EngineConfig>,
    ) -> Self {
        let id = id.into();
        let executor = Arc::new(AgentExecutor::new(
            id.clone(),
            store.clone(),
            model,
            transport.clone(),
            config,
        ));
        Self {
            scheduler: Arc::new(Scheduler::new(id.clone(), executor, store.clone())),
            tools: ToolCatalog::new(id.clone(), store.clone(), transport),
            id,
            name: name.into(),
            store,
            selected: RwLock::new(None),
            pipe: RwLock::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    fn executor(&self) -> &Arc<AgentExecutor> {
        self.scheduler.executor()
    }

    fn agent_filter(&self, agent_id: &str) -> Props {
        let mut filter = id_filter(agent_id);
        filter.insert("workflow_id".to_string(), json!(self.id));
        filter
    }

    // Agents

    pub async fn add_agent(&self, config: &AgentConfig) -> Result<String> {
        let kind = config
            .output_kind
            .unwrap_or(self.executor().config().output_kind_default);
        let node = self
            .store
            .add_node(
                labels::AGENT,
                props(json!({
                    "workflow_id": self.id,
                    "name": config.name,
                    "task": config.task,
                    "output_kind": kind.as_str(),
                })),
            )
            .await?;
        log::info!("Added agent '{}' ({}) to workflow {}", config.name, node.id(), self.id);
        Ok(node.id().to_string())
    }

    pub async fn get_agent(&self, agent_id: &str) -> Result<AgentSpec> {
        let nodes = self
            .store
            .get_node(labels::AGENT, &self.agent_filter(agent_id))
            .await?;
        let node = nodes
            .first()
            .ok_or_else(|| FlowError::not_found("agent", agent_id))?;
        AgentSpec::from_node(node, self.executor().config().output_kind_default)
    }

    /// Merge `patch` into the agent; identity fields are not patchable
    pub async fn update_agent(&self, agent_id: &str, mut patch: Props) -> Result<AgentSpec> {
        patch.remove(NODE_ID);
        patch.remove("workflow_id");
        if let Some(kind) = patch.get("output_kind").and_then(Value::as_str) {
            kind.parse::<OutputKind>()?;
        }
        let updated = self
            .store
            .update_node(labels::AGENT, &self.agent_filter(agent_id), patch)
            .await?;
        let node = updated
            .first()
            .ok_or_else(|| FlowError::not_found("agent", agent_id))?;
        AgentSpec::from_node(node, self.executor().config().output_kind_default)
    }

    /// Delete the agent, its edges and its outputs in every run
    pub async fn delete_agent(&self, agent_id: &str) -> Result<()> {
        let outputs = self.executor().outputs().delete_for_agent(agent_id).await?;
        let deleted = self
            .store
            .delete_node(labels::AGENT, &self.agent_filter(agent_id))
            .await?;
        if deleted == 0 {
            return Err(FlowError::not_found("agent", agent_id));
        }
        log::info!("Deleted agent {} and {} output(s)", agent_id, outputs);
        Ok(())
    }

    // Edges

    /// Control flow `src -> dst`; dst also consumes src's output
    pub async fn add_edge(&self, src: &str, dst: &str) -> Result<()> {
        self.store
            .add_relationship(labels::AGENT, src, rels::NEXT, labels::AGENT, dst)
            .await?;
        self.store
            .add_relationship(labels::AGENT, dst, rels::INPUT, labels::AGENT, src)
            .await?;
        Ok(())
    }

    pub async fn delete_edge(&self, src: &str, dst: &str) -> Result<usize> {
        let next = self
            .store
            .delete_relationship(&RelQuery::outgoing(labels::AGENT, src, rels::NEXT).to_target(dst))
            .await?;
        let input = self
            .store
            .delete_relationship(&RelQuery::outgoing(labels::AGENT, dst, rels::INPUT).to_target(src))
            .await?;
        Ok(next + input)
    }

    pub async fn add_input(&self, agent_id: &str, input_agent_id: &str) -> Result<()> {
        self.store
            .add_relationship(labels::AGENT, agent_id, rels::INPUT, labels::AGENT, input_agent_id)
            .await?;
        Ok(())
    }

    pub async fn delete_input(&self, agent_id: &str, input_agent_id: &str) -> Result<usize> {
        let query = RelQuery::outgoing(labels::AGENT, agent_id, rels::INPUT).to_target(input_agent_id);
        Ok(self.store.delete_relationship(&query).await?)
    }

    /// Agents whose output `agent_id` consumes
    pub async fn inputs(&self, agent_id: &str) -> Result<Vec<AgentSpec>> {
        let default_kind = self.executor().config().output_kind_default;
        self.executor()
            .input_agents(agent_id)
            .await?
            .iter()
            .map(|n| AgentSpec::from_node(n, default_kind))
            .collect()
    }

    // Tools

    pub async fn list_tools(&self) -> Result<Vec<RegisteredTool>> {
        self.tools.list().await
    }

    pub async fn find_tool(&self, name: &str) -> Result<Option<RegisteredTool>> {
        self.tools.find_by_name(name).await
    }

    pub async fn add_tool(&self, agent_id: &str, tool_id: &str) -> Result<()> {
        self.store
            .add_relationship(labels::AGENT, agent_id, rels::USE_TOOL, labels::TOOL, tool_id)
            .await?;
        Ok(())
    }

    pub async fn delete_tool(&self, agent_id: &str, tool_id: &str) -> Result<usize> {
        let query = RelQuery::outgoing(labels::AGENT, agent_id, rels::USE_TOOL).to_target(tool_id);
        Ok(self.store.delete_relationship(&query).await?)
    }

    pub async fn agent_tools(&self, agent_id: &str) -> Result<Vec<ToolRegistration>> {
        self.executor().tools(agent_id).await
    }

    // Graph

    pub async fn agent_graph(&self) -> Result<AgentGraph> {
        let view = self.scheduler.rebuild().await?;
        let nodes = view
            .order
            .iter()
            .filter_map(|id| view.agents.get(id))
            .map(|a| GraphNode {
                id: a.id.clone(),
                name: a.name.clone(),
                output_kind: a.output_kind,
            })
            .collect();
        let edges = view
            .edges
            .iter()
            .map(|(src, dst)| GraphEdge {
                src: src.clone(),
                dst: dst.clone(),
            })
            .collect();
        Ok(AgentGraph { nodes, edges })
    }

    // Runs

    /// The selected run, creating and selecting a fresh one if none is
    pub async fn selected_run(&self) -> Result<Arc<RunContext>> {
        let mut selected = self.selected.write().await;
        if let Some(run) = selected.as_ref() {
            return Ok(run.clone());
        }
        let run = self.scheduler.runs().new_run().await?;
        *selected = Some(run.clone());
        Ok(run)
    }

    pub async fn list_runs(&self) -> Result<Vec<Arc<RunContext>>> {
        self.scheduler.runs().list_runs().await
    }

    /// Select a run by id; `None` selects the most recent one
    pub async fn select_run(&self, run_id: Option<&str>) -> Result<Option<Arc<RunContext>>> {
        let run = match run_id {
            Some(id) => Some(self.scheduler.runs().load_run(id).await?),
            None => self.list_runs().await?.pop(),
        };
        *self.selected.write().await = run.clone();
        Ok(run)
    }

    /// Delete one run or all runs; the selection moves to the latest survivor
    pub async fn delete_run(&self, run_id: Option<&str>) -> Result<usize> {
        let deleted = self.scheduler.runs().delete_run(run_id).await?;
        let lost_selection = {
            let selected = self.selected.read().await;
            match (selected.as_ref(), run_id) {
                (Some(run), Some(id)) => run.id() == id,
                (Some(_), None) => true,
                (None, _) => false,
            }
        };
        if lost_selection {
            self.select_run(None).await?;
        }
        Ok(deleted)
    }

    pub async fn is_runnable(&self, agent_id: &str) -> Result<bool> {
        let run = self.selected_run().await?;
        self.executor().is_ready(agent_id, run.id()).await
    }

    pub async fn step_output(&self, agent_id: &str) -> Result<StepOutput> {
        let run = self.selected_run().await?;
        self.executor()
            .outputs()
            .find(agent_id, run.id())
            .await?
            .ok_or_else(|| FlowError::not_found("step output", agent_id))
    }

    /// Run the whole graph in a fresh run, which becomes the selected one
    pub async fn run(&self) -> Result<RunSession> {
        let run = self.scheduler.runs().new_run().await?;
        *self.selected.write().await = Some(run.clone());
        let session = self.scheduler.run(Some(run)).await?;
        *self.pipe.write().await = Some(session.pipe.clone());
        Ok(session)
    }

    /// Run one agent in the selected run
    pub async fn run_step(&self, agent_id: &str) -> Result<RunSession> {
        let run = self.selected_run().await?;
        let session = self.scheduler.run_step(agent_id, run).await?;
        *self.pipe.write().await = Some(session.pipe.clone());
        Ok(session)
    }

    /// Pipe of the latest started run
    pub async fn pipe(&self) -> Option<Arc<EventPipe>> {
        self.pipe.read().await.clone()
    }

    /// Route a caller's reply to the waiting elicitation.
    ///
    /// The human's description is echoed to the stream first.
    pub async fn feedback(&self, mut message: FeedbackMessage) -> Result<()> {
        let pipe = self
            .pipe()
            .await
            .ok_or_else(|| FlowError::Feedback("no run has been started".to_string()))?;
        if message.workflow_id.is_empty() {
            message.workflow_id = self.id.clone();
        }

        let description = message
            .data
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or("done")
            .to_string();
        pipe.append(&message.workflow_id, &message.agent_id, "user", "markdown", description)
            .await?;

        if message.status == FeedbackStatus::End {
            log::info!("Feedback for {} ends the run", message.agent_id);
            return pipe.abort().await;
        }
        pipe.feedback().deliver(message).await
    }
}

/// Summary of a stored workflow
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkflowInfo {
    pub id: String,
    pub name: String,
}

/// Creates, finds and deletes workflows; hands out cached handles
pub struct WorkflowManager {
    store: Arc<dyn GraphStore>,
    model: Arc<dyn Model>,
    transport: Option<Arc<dyn ToolTransport>>,
    config: Arc<EngineConfig>,
    handles: RwLock<HashMap<String, Arc<Workflow>>>,
}

impl WorkflowManager {
    pub fn new(
        store: Arc<dyn GraphStore>,
        model: Arc<dyn Model>,
        transport: Option<Arc<dyn ToolTransport>>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            model,
            transport,
            config: Arc::new(config),
            handles: RwLock::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn GraphStore> {
        &self.store
    }

    fn handle(&self, id: &str, name: &str) -> Arc<Workflow> {
        Arc::new(Workflow::new(
            id,
            name,
            self.store.clone(),
            self.model.clone(),
            self.transport.clone(),
            self.config.clone(),
        ))
    }

    pub async fn create_workflow(&self, name: &str) -> Result<Arc<Workflow>> {
        let existing = self
            .store
            .get_node(labels::WORKFLOW, &props(json!({ "name": name })))
            .await?;
        if !existing.is_empty() {
            return Err(StoreError::Constraint(format!("workflow '{}' already exists", name)).into());
        }
        let node = self
            .store
            .add_node(
                labels::WORKFLOW,
                props(json!({
                    "name": name,
                    "created_at": chrono::Utc::now().timestamp_millis(),
                })),
            )
            .await?;
        let workflow = self.handle(node.id(), name);
        self.handles
            .write()
            .await
            .insert(node.id().to_string(), workflow.clone());
        log::info!("Created workflow '{}' ({})", name, node.id());
        Ok(workflow)
    }

    pub async fn list_workflows(&self) -> Result<Vec<WorkflowInfo>> {
        let nodes = self.store.get_node(labels::WORKFLOW, &Props::new()).await?;
        Ok(nodes
            .iter()
            .map(|n| WorkflowInfo {
                id: n.id().to_string(),
                name: n.get_str("name").unwrap_or_default().to_string(),
            })
            .collect())
    }

    pub async fn get_workflow(&self, workflow_id: &str) -> Result<Arc<Workflow>> {
        if let Some(workflow) = self.handles.read().await.get(workflow_id) {
            return Ok(workflow.clone());
        }
        let nodes = self
            .store
            .get_node(labels::WORKFLOW, &id_filter(workflow_id))
            .await?;
        let node = nodes
            .first()
            .ok_or_else(|| FlowError::not_found("workflow", workflow_id))?;

        let mut handles = self.handles.write().await;
        let workflow = handles
            .entry(workflow_id.to_string())
            .or_insert_with(|| self.handle(workflow_id, node.get_str("name").unwrap_or_default()))
            .clone();
        Ok(workflow)
    }

    /// Delete a workflow with everything scoped to it
    pub async fn delete_workflow(&self, workflow_id: &str) -> Result<()> {
        let deleted = self
            .store
            .delete_node(labels::WORKFLOW, &id_filter(workflow_id))
            .await?;
        if deleted == 0 {
            return Err(FlowError::not_found("workflow", workflow_id));
        }
        let scope = props(json!({ "workflow_id": workflow_id }));
        for label in [labels::AGENT, labels::STEP_OUTPUT, labels::RUN_CONTEXT, labels::TOOL] {
            let n = self.store.delete_node(label, &scope).await?;
            log::debug!("Deleted {} {} node(s) of workflow {}", n, label, workflow_id);
        }
        self.handles.write().await.remove(workflow_id);
        log::info!("Deleted workflow {}", workflow_id);
        Ok(())
    }
}
