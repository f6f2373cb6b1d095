// SPDX-License-Identifier: MIT

use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use super::{prompt, AgentSpec, ExecutionResult, PipeElicitor};
use crate::adk::error::{FlowError, Result, ToolError};
use crate::adk::model::{Content, Model};
use crate::adk::tool::{CallScope, Elicitor, ToolRegistration, ToolTransport};
use crate::flow::config::{EngineConfig, OutputKind};
use crate::flow::output::StepOutputs;
use crate::flow::pipe::EventPipe;
use crate::flow::run_context::{Outcome, RunContext};
use crate::flow::store::{labels, rels, GraphStore, Node, RelQuery};

async fn cancellable<T>(
    token: &CancellationToken,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        _ = token.cancelled() => Err(FlowError::Cancelled),
        r = fut => r,
    }
}

/// What a tool payload looks like in the event stream
fn payload_display(payload: &Value) -> (String, String) {
    let kind = payload
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("markdown")
        .to_string();
    let text = match payload.get("data").unwrap_or(payload) {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    (text, kind)
}

/// Runs agents of one workflow
pub struct AgentExecutor {
    workflow_id: String,
    store: Arc<dyn GraphStore>,
    outputs: StepOutputs,
    model: Arc<dyn Model>,
    transport: Option<Arc<dyn ToolTransport>>,
    config: Arc<EngineConfig>,
}

impl AgentExecutor {
    pub fn new(
        workflow_id: impl Into<String>,
        store: Arc<dyn GraphStore>,
        model: Arc<dyn Model>,
        transport: Option<Arc<dyn ToolTransport>>,
        config: Arc<EngineConfig>,
    ) -> Self {
        let workflow_id = workflow_id.into();
        Self {
            outputs: StepOutputs::new(workflow_id.clone(), store.clone()),
            workflow_id,
            store,
            model,
            transport,
            config,
        }
    }

    pub fn outputs(&self) -> &StepOutputs {
        &self.outputs
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Agents whose output `agent_id` consumes, in edge order
    pub async fn input_agents(&self, agent_id: &str) -> Result<Vec<Node>> {
        let rels = self
            .store
            .get_relationship(&RelQuery::outgoing(labels::AGENT, agent_id, rels::INPUT))
            .await?;
        Ok(rels.into_iter().map(|r| r.dst).collect())
    }

    /// Tools bound to `agent_id`
    pub async fn tools(&self, agent_id: &str) -> Result<Vec<ToolRegistration>> {
        let rels = self
            .store
            .get_relationship(&RelQuery::outgoing(labels::AGENT, agent_id, rels::USE_TOOL))
            .await?;
        rels.into_iter()
            .map(|r| serde_json::from_value(Value::Object(r.dst.props)).map_err(FlowError::from))
            .collect()
    }

    /// True when every INPUT-linked agent has an output in `run_id`
    pub async fn is_ready(&self, agent_id: &str, run_id: &str) -> Result<bool> {
        for input in self.input_agents(agent_id).await? {
            if self.outputs.find(input.id(), run_id).await?.is_none() {
                log::debug!("Agent {} waits on input {}", agent_id, input.id());
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn build_task(&self, agent: &AgentSpec, run_id: &str) -> Result<String> {
        let mut resolved = Vec::new();
        for name in prompt::placeholders(&agent.task) {
            let value = self
                .outputs
                .find_by_name(&name, run_id)
                .await?
                .filter(|o| !o.is_empty())
                .map(|o| o.text());
            resolved.push((name, value));
        }
        Ok(prompt::materialize_task(&agent.task, &resolved))
    }

    async fn build_inputs(&self, agent_id: &str, run_id: &str) -> Result<String> {
        let mut contents = Vec::new();
        for input in self.input_agents(agent_id).await? {
            if let Some(output) = self.outputs.find(input.id(), run_id).await? {
                contents.push(output.text());
            }
        }
        Ok(prompt::reference_block(&contents))
    }

    /// Execute `agent` once under `run`.
    ///
    /// Records `succeed` on the way out; failures are returned to the caller,
    /// which records them.
    pub async fn invoke(
        &self,
        agent: &AgentSpec,
        run: &RunContext,
        pipe: &Arc<EventPipe>,
    ) -> Result<ExecutionResult> {
        let run_id = run.id();
        log::info!("Invoking agent '{}' ({}) in run {}", agent.name, agent.id, run_id);

        if !self.is_ready(&agent.id, run_id).await? {
            return Err(FlowError::NotReady);
        }

        let task = self.build_task(agent, run_id).await?;
        let reference = self.build_inputs(&agent.id, run_id).await?;
        let tools = self.tools(&agent.id).await?;
        let cancel = pipe.cancel_token();

        pipe.append(&self.workflow_id, &agent.id, "agent", "markdown", agent.task.as_str())
            .await?;

        let preauthored = prompt::preauthored(&agent.task);
        let answer = match &preauthored {
            Some(_) => None,
            None => {
                let text = prompt::compose(
                    &reference,
                    &prompt::tool_catalogue(&tools),
                    &task,
                    !tools.is_empty(),
                );
                log::debug!("Prompt for '{}':\n{}", agent.name, text);
                let generation = self.config.model.generation_config();
                let reply = cancellable(&cancel, async {
                    self.model
                        .generate_content(&[Content::user(text)], Some(&generation))
                        .await
                        .map_err(FlowError::from)
                })
                .await?;
                let answer = reply.text();
                let shown = if answer.is_empty() {
                    "(no answer)".to_string()
                } else {
                    answer.clone()
                };
                pipe.append(&self.workflow_id, &agent.id, "llm", "markdown", shown)
                    .await?;
                Some(answer)
            }
        };

        self.outputs.clear(&agent.id, run_id).await?;
        let record = self
            .outputs
            .create_empty(&agent.id, run_id, &agent.name, agent.output_kind.as_str())
            .await?;

        let mut payloads = Vec::new();
        let mut tool_called = false;
        if !tools.is_empty() {
            let structured = match (&preauthored, &answer) {
                (Some(v), _) => v.clone(),
                (None, Some(text)) => prompt::parse_structured(text)
                    .ok_or_else(|| FlowError::InvalidToolCalls(text.clone()))?,
                (None, None) => return Err(FlowError::InvalidToolCalls(String::new())),
            };
            let calls = prompt::parse_tool_calls(structured)?;
            let transport = self
                .transport
                .as_ref()
                .ok_or_else(|| ToolError::Transport("no tool transport configured".into()))?;
            let scope = CallScope {
                workflow_id: self.workflow_id.clone(),
                agent_id: agent.id.clone(),
                run_id: run_id.to_string(),
                output_id: record.id.clone(),
            };
            let elicitor: Arc<dyn Elicitor> = Arc::new(PipeElicitor::new(
                pipe.clone(),
                self.workflow_id.clone(),
                agent.id.clone(),
                Duration::from_secs(self.config.feedback_timeout_secs),
            ));

            for call in &calls {
                if !tools.iter().any(|t| t.name == call.tool_name) {
                    log::warn!(
                        "Agent '{}' asked for unbound tool '{}'",
                        agent.name,
                        call.tool_name
                    );
                    continue;
                }
                let started = Instant::now();
                let payload = cancellable(&cancel, async {
                    transport
                        .call_tool(call, &scope, elicitor.clone())
                        .await
                        .map_err(FlowError::from)
                })
                .await?;
                log::info!(
                    "Tool '{}' finished in {:?}",
                    call.tool_name,
                    started.elapsed()
                );
                let (text, kind) = payload_display(&payload);
                pipe.append(&self.workflow_id, &agent.id, "tool", &kind, text)
                    .await?;
                payloads.push(payload);
                tool_called = true;
            }
        }

        let (content, result) = if tool_called {
            let content = match payloads.as_slice() {
                [single] => single.clone(),
                _ => Value::Array(payloads.clone()),
            };
            (content, ExecutionResult::ToolResults(payloads))
        } else if agent.output_kind == OutputKind::Json {
            let structured = match (&preauthored, &answer) {
                (Some(v), _) => Some(v.clone()),
                (None, Some(text)) => prompt::parse_structured(text),
                (None, None) => None,
            };
            let jump = structured
                .as_ref()
                .and_then(|v| v.get("tool_name"))
                .and_then(Value::as_str)
                .map(|name| ExecutionResult::JumpTo(name.to_string()))
                .unwrap_or(ExecutionResult::Continue);
            (structured.unwrap_or_else(|| Value::String(String::new())), jump)
        } else {
            (
                Value::String(answer.unwrap_or_default()),
                ExecutionResult::Continue,
            )
        };

        self.outputs.write(&record.id, content).await?;
        run.record(&agent.id, Outcome::Succeed, None).await?;
        log::info!(
            "Agent '{}' succeeded in run {} (started {})",
            agent.name,
            run_id,
            run.time_str()
        );
        Ok(result)
    }
}
