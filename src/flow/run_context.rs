// SPDX-License-Identifier: MIT

//! Run contexts: one per execution of a workflow
//!
//! Outcome bookkeeping lives in memory behind a lock and is written through
//! to the store on every change, so counters stay consistent when several
//! agents finish at once.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::adk::error::{FlowError, Result};
use crate::flow::store::{labels, props, GraphStore, Node, Props, NODE_ID};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Succeed,
    Failed,
}

/// Per-agent outcome counters and last error text
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutcomeLog {
    #[serde(default)]
    pub succeed: BTreeMap<String, u32>,
    #[serde(default)]
    pub failed: BTreeMap<String, u32>,
    #[serde(default)]
    pub errors: BTreeMap<String, String>,
}

impl OutcomeLog {
    /// An agent sits in exactly one bucket: the latest outcome wins
    fn record(&mut self, agent_id: &str, outcome: Outcome, error: Option<String>) {
        match outcome {
            Outcome::Succeed => {
                self.failed.remove(agent_id);
                self.errors.remove(agent_id);
                *self.succeed.entry(agent_id.to_string()).or_default() += 1;
            }
            Outcome::Failed => {
                self.succeed.remove(agent_id);
                *self.failed.entry(agent_id.to_string()).or_default() += 1;
                self.errors
                    .insert(agent_id.to_string(), error.unwrap_or_default());
            }
        }
    }

    pub fn outcome(&self, agent_id: &str) -> Option<Outcome> {
        if self.succeed.contains_key(agent_id) {
            Some(Outcome::Succeed)
        } else if self.failed.contains_key(agent_id) {
            Some(Outcome::Failed)
        } else {
            None
        }
    }
}

/// One execution instance of a workflow
pub struct RunContext {
    id: String,
    workflow_id: String,
    created_at: DateTime<Utc>,
    log: Mutex<OutcomeLog>,
    store: Arc<dyn GraphStore>,
}

impl std::fmt::Debug for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunContext")
            .field("id", &self.id)
            .field("workflow_id", &self.workflow_id)
            .field("created_at", &self.created_at)
            .finish()
    }
}

impl RunContext {
    fn from_node(node: &Node, store: Arc<dyn GraphStore>) -> Result<Self> {
        let millis = node
            .get("timestamp")
            .and_then(Value::as_i64)
            .ok_or_else(|| FlowError::other(format!("run context {} has no timestamp", node.id())))?;
        let created_at = Utc
            .timestamp_millis_opt(millis)
            .single()
            .ok_or_else(|| FlowError::other(format!("run context {} has a bad timestamp", node.id())))?;
        let log = match node.get("outcomes") {
            Some(v) if !v.is_null() => serde_json::from_value(v.clone())?,
            _ => OutcomeLog::default(),
        };

        Ok(Self {
            id: node.id().to_string(),
            workflow_id: node.get_str("workflow_id").unwrap_or_default().to_string(),
            created_at,
            log: Mutex::new(log),
            store,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// `created_at` as `YYYY-mm-dd HH:MM:SS`
    pub fn time_str(&self) -> String {
        self.created_at.format("%Y-%m-%d %H:%M:%S").to_string()
    }

    /// Count an outcome for `agent_id` and persist the counters
    pub async fn record(&self, agent_id: &str, outcome: Outcome, error: Option<String>) -> Result<()> {
        let mut log = self.log.lock().await;
        log.record(agent_id, outcome, error);
        let outcomes = serde_json::to_value(&*log)?;

        let mut filter = Props::new();
        filter.insert(NODE_ID.to_string(), Value::String(self.id.clone()));
        self.store
            .update_node(
                labels::RUN_CONTEXT,
                &filter,
                props(json!({ "outcomes": outcomes })),
            )
            .await?;
        Ok(())
    }

    pub async fn outcome(&self, agent_id: &str) -> Option<Outcome> {
        self.log.lock().await.outcome(agent_id)
    }

    pub async fn error(&self, agent_id: &str) -> Option<String> {
        self.log.lock().await.errors.get(agent_id).cloned()
    }

    pub async fn snapshot(&self) -> OutcomeLog {
        self.log.lock().await.clone()
    }
}

/// Creates, finds and deletes the run contexts of one workflow
pub struct RunContextManager {
    workflow_id: String,
    store: Arc<dyn GraphStore>,
}

impl RunContextManager {
    pub fn new(workflow_id: impl Into<String>, store: Arc<dyn GraphStore>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            store,
        }
    }

    fn scope(&self) -> Props {
        props(json!({ "workflow_id": self.workflow_id }))
    }

    pub async fn new_run(&self) -> Result<Arc<RunContext>> {
        let now = Utc::now();
        let node = self
            .store
            .add_node(
                labels::RUN_CONTEXT,
                props(json!({
                    "workflow_id": self.workflow_id,
                    "timestamp": now.timestamp_millis(),
                    "outcomes": OutcomeLog::default(),
                })),
            )
            .await?;
        log::info!("New run {} for workflow {}", node.id(), self.workflow_id);
        Ok(Arc::new(RunContext::from_node(&node, self.store.clone())?))
    }

    pub async fn load_run(&self, run_id: &str) -> Result<Arc<RunContext>> {
        let mut filter = self.scope();
        filter.insert(NODE_ID.to_string(), Value::String(run_id.to_string()));
        let nodes = self.store.get_node(labels::RUN_CONTEXT, &filter).await?;
        let node = nodes
            .first()
            .ok_or_else(|| FlowError::not_found("run context", run_id))?;
        Ok(Arc::new(RunContext::from_node(node, self.store.clone())?))
    }

    /// Oldest first
    pub async fn list_runs(&self) -> Result<Vec<Arc<RunContext>>> {
        let nodes = self.store.get_node(labels::RUN_CONTEXT, &self.scope()).await?;
        let mut runs = nodes
            .iter()
            .map(|n| RunContext::from_node(n, self.store.clone()).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;
        runs.sort_by_key(|r| r.created_at);
        Ok(runs)
    }

    /// Delete one run (or all of them) together with the outputs it scoped
    pub async fn delete_run(&self, run_id: Option<&str>) -> Result<usize> {
        let mut filter = self.scope();
        if let Some(id) = run_id {
            filter.insert(NODE_ID.to_string(), Value::String(id.to_string()));
        }
        let deleted = self.store.delete_node(labels::RUN_CONTEXT, &filter).await?;

        let mut outputs = self.scope();
        if let Some(id) = run_id {
            outputs.insert("run_id".to_string(), Value::String(id.to_string()));
        }
        let outputs_deleted = self.store.delete_node(labels::STEP_OUTPUT, &outputs).await?;
        log::info!(
            "Deleted {} run(s) and {} output(s) of workflow {}",
            deleted,
            outputs_deleted,
            self.workflow_id
        );
        Ok(deleted)
    }
}
