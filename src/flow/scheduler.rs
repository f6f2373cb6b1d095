// SPDX-License-Identifier: MIT

//! Workflow scheduler
//!
//! Keeps a snapshot of the agent graph and drives a run: one task per head
//! agent, fan-out over NEXT edges, and a join barrier so an agent with
//! several NEXT parents runs once, after all of them have finished.

use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use serde_json::json;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use crate::adk::error::{FlowError, Result};
use crate::flow::agent::{AgentExecutor, AgentSpec, ExecutionResult};
use crate::flow::pipe::{Emission, EventPipe, EventStream, OutboundEvent};
use crate::flow::run_context::{Outcome, RunContext, RunContextManager};
use crate::flow::store::{labels, props, rels, GraphStore, HopRange, RelQuery};

/// Agents and NEXT edges of a workflow at one point in time
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GraphView {
    pub agents: HashMap<String, AgentSpec>,
    /// Agent ids in store order
    pub order: Vec<String>,
    /// Agents with no incoming NEXT edge
    pub heads: Vec<String>,
    /// target -> NEXT sources
    pub incoming: HashMap<String, BTreeSet<String>>,
    pub edges: Vec<(String, String)>,
}

impl GraphView {
    pub fn agent_by_name(&self, name: &str) -> Option<&AgentSpec> {
        self.order
            .iter()
            .filter_map(|id| self.agents.get(id))
            .find(|a| a.name == name)
    }
}

/// A started run: its context, the engine side of its pipe and the stream
/// the caller reads
pub struct RunSession {
    pub run: Arc<RunContext>,
    pub pipe: Arc<EventPipe>,
    pub stream: EventStream,
}

/// Bookkeeping for one run in flight
struct RunState {
    run: Arc<RunContext>,
    pipe: Arc<EventPipe>,
    view: Arc<GraphView>,
    arrived: Mutex<HashMap<String, HashSet<String>>>,
    started: Mutex<HashSet<String>>,
    running: Mutex<HashSet<String>>,
    visits: Mutex<HashMap<String, usize>>,
}

impl RunState {
    fn new(run: Arc<RunContext>, pipe: Arc<EventPipe>, view: Arc<GraphView>) -> Self {
        Self {
            run,
            pipe,
            view,
            arrived: Mutex::new(HashMap::new()),
            started: Mutex::new(HashSet::new()),
            running: Mutex::new(HashSet::new()),
            visits: Mutex::new(HashMap::new()),
        }
    }

    /// Note that `parent` finished; true if `target` may now start
    async fn arrive(&self, parent: &str, target: &str) -> bool {
        let mut arrived = self.arrived.lock().await;
        let seen = arrived.entry(target.to_string()).or_default();
        seen.insert(parent.to_string());

        let complete = self
            .view
            .incoming
            .get(target)
            .map_or(true, |parents| parents.iter().all(|p| seen.contains(p)));
        if !complete {
            return false;
        }
        self.started.lock().await.insert(target.to_string())
    }

    /// A jump satisfies `target`'s barrier, so a later static arrival does
    /// not start it again. False while `target` is still in flight.
    async fn enter_by_jump(&self, target: &str) -> bool {
        self.started.lock().await.insert(target.to_string());
        !self.running.lock().await.contains(target)
    }
}

pub struct Scheduler {
    workflow_id: String,
    store: Arc<dyn GraphStore>,
    executor: Arc<AgentExecutor>,
    runs: RunContextManager,
    view: RwLock<Arc<GraphView>>,
}

impl Scheduler {
    pub fn new(workflow_id: impl Into<String>, executor: Arc<AgentExecutor>, store: Arc<dyn GraphStore>) -> Self {
        let workflow_id = workflow_id.into();
        Self {
            runs: RunContextManager::new(workflow_id.clone(), store.clone()),
            workflow_id,
            store,
            executor,
            view: RwLock::new(Arc::new(GraphView::default())),
        }
    }

    pub fn executor(&self) -> &Arc<AgentExecutor> {
        &self.executor
    }

    pub fn runs(&self) -> &RunContextManager {
        &self.runs
    }

    /// Latest snapshot taken by [`Scheduler::rebuild`]
    pub async fn view(&self) -> Arc<GraphView> {
        self.view.read().await.clone()
    }

    /// Re-read agents and NEXT edges from the store
    pub async fn rebuild(&self) -> Result<Arc<GraphView>> {
        let scope = props(json!({ "workflow_id": self.workflow_id }));
        let nodes = self.store.get_node(labels::AGENT, &scope).await?;
        let default_kind = self.executor.config().output_kind_default;

        let mut view = GraphView::default();
        for node in &nodes {
            let spec = AgentSpec::from_node(node, default_kind)?;
            view.order.push(spec.id.clone());
            view.agents.insert(spec.id.clone(), spec);
        }

        let next = self
            .store
            .get_relationship(&RelQuery {
                src_label: Some(labels::AGENT.to_string()),
                src_props: scope,
                rel_types: vec![rels::NEXT.to_string()],
                hop: HopRange::Exact(1),
                ..Default::default()
            })
            .await?;
        for rel in next {
            let (src, dst) = (rel.src.id().to_string(), rel.dst.id().to_string());
            view.incoming
                .entry(dst.clone())
                .or_default()
                .insert(src.clone());
            view.edges.push((src, dst));
        }

        view.heads = view
            .order
            .iter()
            .filter(|id| !view.incoming.contains_key(*id))
            .cloned()
            .collect();

        log::info!(
            "Workflow {}: {} agents, {} edges, {} heads",
            self.workflow_id,
            view.order.len(),
            view.edges.len(),
            view.heads.len()
        );
        let view = Arc::new(view);
        *self.view.write().await = view.clone();
        Ok(view)
    }

    /// Run the whole graph from its heads.
    ///
    /// Returns once the run is launched; the session's stream ends with a
    /// single `end` event after every branch has finished.
    pub async fn run(self: &Arc<Self>, run: Option<Arc<RunContext>>) -> Result<RunSession> {
        let view = self.rebuild().await?;
        let run = match run {
            Some(run) => run,
            None => self.runs.new_run().await?,
        };
        let (pipe, stream) = EventPipe::new(self.executor.config().pipe_capacity);
        let state = Arc::new(RunState::new(run.clone(), pipe.clone(), view.clone()));

        log::info!("Run {} started with heads {:?}", run.id(), view.heads);
        let this = self.clone();
        tokio::spawn(async move {
            {
                let mut started = state.started.lock().await;
                started.extend(state.view.heads.iter().cloned());
            }
            let heads = state.view.heads.clone();
            join_all(heads.into_iter().map(|id| this.clone().run_agent(state.clone(), id))).await;
            this.finish(&state.pipe, state.run.id()).await;
        });

        Ok(RunSession { run, pipe, stream })
    }

    /// Run a single agent without following its edges
    pub async fn run_step(self: &Arc<Self>, agent_id: &str, run: Arc<RunContext>) -> Result<RunSession> {
        let view = self.rebuild().await?;
        let spec = view
            .agents
            .get(agent_id)
            .cloned()
            .ok_or_else(|| FlowError::not_found("agent", agent_id))?;
        let (pipe, stream) = EventPipe::new(self.executor.config().pipe_capacity);

        let this = self.clone();
        let (task_run, task_pipe) = (run.clone(), pipe.clone());
        tokio::spawn(async move {
            this.execute(&spec, &task_run, &task_pipe).await;
            this.finish(&task_pipe, task_run.id()).await;
        });

        Ok(RunSession { run, pipe, stream })
    }

    async fn finish(&self, pipe: &EventPipe, run_id: &str) {
        if let Err(e) = pipe.end("").await {
            log::debug!("End of run {} not delivered: {}", run_id, e);
        }
        log::info!("Run {} finished", run_id);
    }

    /// Invoke with failure isolation: errors are recorded, never propagated
    async fn execute(&self, spec: &AgentSpec, run: &RunContext, pipe: &Arc<EventPipe>) -> ExecutionResult {
        let step = Emission::NewStep {
            kind: "markdown".to_string(),
            content: spec.name.clone(),
        };
        if let Err(e) = pipe.emit(OutboundEvent::new("agent", step)).await {
            log::debug!("Progress for '{}' not delivered: {}", spec.name, e);
        }
        match self.executor.invoke(spec, run, pipe).await {
            Ok(result) => result,
            Err(e) => {
                log::error!("Agent '{}' failed in run {}: {}", spec.name, run.id(), e);
                if let Err(record_err) = run.record(&spec.id, Outcome::Failed, Some(e.to_string())).await {
                    log::error!("Could not record failure of '{}': {}", spec.name, record_err);
                }
                ExecutionResult::Continue
            }
        }
    }

    fn run_agent(self: Arc<Self>, state: Arc<RunState>, agent_id: String) -> BoxFuture<'static, ()> {
        async move {
            if state.pipe.cancel_token().is_cancelled() {
                return;
            }
            let Some(spec) = state.view.agents.get(&agent_id).cloned() else {
                log::warn!("Agent {} is not part of workflow {}", agent_id, self.workflow_id);
                return;
            };

            let visits = {
                let mut visits = state.visits.lock().await;
                let n = visits.entry(agent_id.clone()).or_default();
                *n += 1;
                *n
            };
            if visits > self.executor.config().max_agent_visits {
                log::warn!("Agent '{}' entered {} times, not running again", spec.name, visits);
                return;
            }

            state.running.lock().await.insert(agent_id.clone());
            let result = self.execute(&spec, &state.run, &state.pipe).await;
            state.running.lock().await.remove(&agent_id);
            self.continue_from(state, &spec, result).await;
        }
        .boxed()
    }

    /// Follow a finished agent: a jump wins over static NEXT edges
    async fn continue_from(self: Arc<Self>, state: Arc<RunState>, spec: &AgentSpec, result: ExecutionResult) {
        if let Some(name) = result.jump_target() {
            let target = state.view.agent_by_name(name).map(|a| a.id.clone());
            match target {
                Some(target) => {
                    if state.enter_by_jump(&target).await {
                        log::info!("Agent '{}' jumps to '{}'", spec.name, name);
                        self.run_agent(state, target).await;
                    } else {
                        log::info!("Agent '{}' jumps to '{}', which is already running", spec.name, name);
                    }
                    return;
                }
                None => log::warn!("Jump target '{}' is not an agent, following edges", name),
            }
        }

        let next = match self
            .store
            .get_relationship(&RelQuery::outgoing(labels::AGENT, &spec.id, rels::NEXT))
            .await
        {
            Ok(next) => next,
            Err(e) => {
                log::error!("Could not read edges of '{}': {}", spec.name, e);
                let error = format!("reading next agents: {}", e);
                if let Err(record_err) = state.run.record(&spec.id, Outcome::Failed, Some(error)).await {
                    log::error!("Could not record failure of '{}': {}", spec.name, record_err);
                }
                return;
            }
        };

        let mut ready = Vec::new();
        for rel in next {
            let target = rel.dst.id().to_string();
            if state.arrive(&spec.id, &target).await {
                ready.push(target);
            }
        }
        join_all(
            ready
                .into_iter()
                .map(|id| self.clone().run_agent(state.clone(), id)),
        )
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adk::error::ModelError;
    use crate::adk::model::{Content, GenerationConfig, Model, Part};
    use crate::flow::config::EngineConfig;
    use crate::adk::error::StoreError;
    use crate::flow::store::{MemoryGraphStore, Node, Props, Relationship, NODE_ID};
    use async_trait::async_trait;
    use futures::StreamExt;
    use std::time::Duration;

    struct Echo;

    #[async_trait]
    impl Model for Echo {
        async fn generate_content(
            &self,
            _history: &[Content],
            _config: Option<&GenerationConfig>,
        ) -> std::result::Result<Content, ModelError> {
            Ok(Content {
                role: "model".into(),
                parts: vec![Part::Text("ok".into())],
            })
        }
    }

    /// Answers after a short delay so pre-authored agents finish first
    struct Slow;

    #[async_trait]
    impl Model for Slow {
        async fn generate_content(
            &self,
            _history: &[Content],
            _config: Option<&GenerationConfig>,
        ) -> std::result::Result<Content, ModelError> {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(Content {
                role: "model".into(),
                parts: vec![Part::Text("slow".into())],
            })
        }
    }

    /// Fails outgoing NEXT lookups of single agents
    struct BrokenEdges(MemoryGraphStore);

    #[async_trait]
    impl GraphStore for BrokenEdges {
        async fn get_node(&self, label: &str, filter: &Props) -> std::result::Result<Vec<Node>, StoreError> {
            self.0.get_node(label, filter).await
        }

        async fn add_node(&self, label: &str, props: Props) -> std::result::Result<Node, StoreError> {
            self.0.add_node(label, props).await
        }

        async fn update_node(
            &self,
            label: &str,
            filter: &Props,
            props: Props,
        ) -> std::result::Result<Vec<Node>, StoreError> {
            self.0.update_node(label, filter, props).await
        }

        async fn delete_node(&self, label: &str, filter: &Props) -> std::result::Result<usize, StoreError> {
            self.0.delete_node(label, filter).await
        }

        async fn get_relationship(&self, query: &RelQuery) -> std::result::Result<Vec<Relationship>, StoreError> {
            if query.rel_types == [rels::NEXT] && query.src_props.contains_key(NODE_ID) {
                return Err(StoreError::Backend("connection reset".into()));
            }
            self.0.get_relationship(query).await
        }

        async fn add_relationship(
            &self,
            src_label: &str,
            src_id: &str,
            rel_type: &str,
            dst_label: &str,
            dst_id: &str,
        ) -> std::result::Result<(), StoreError> {
            self.0
                .add_relationship(src_label, src_id, rel_type, dst_label, dst_id)
                .await
        }

        async fn delete_relationship(&self, query: &RelQuery) -> std::result::Result<usize, StoreError> {
            self.0.delete_relationship(query).await
        }
    }

    async fn setup_with(
        store: Arc<dyn GraphStore>,
        model: Arc<dyn Model>,
        agents: &[(&str, &str, &str)],
        edges: &[(&str, &str)],
    ) -> (Arc<Scheduler>, HashMap<String, String>) {
        let mut ids = HashMap::new();
        for (name, task, kind) in agents {
            let node = store
                .add_node(
                    labels::AGENT,
                    props(json!({"workflow_id": "wf", "name": name, "task": task, "output_kind": kind})),
                )
                .await
                .unwrap();
            ids.insert(name.to_string(), node.id().to_string());
        }
        for (a, b) in edges {
            store
                .add_relationship(labels::AGENT, &ids[*a], rels::NEXT, labels::AGENT, &ids[*b])
                .await
                .unwrap();
        }
        let executor = Arc::new(AgentExecutor::new(
            "wf",
            store.clone(),
            model,
            None,
            Arc::new(EngineConfig::default()),
        ));
        (Arc::new(Scheduler::new("wf", executor, store)), ids)
    }

    async fn setup(names: &[&str], edges: &[(&str, &str)]) -> (Arc<Scheduler>, HashMap<String, String>) {
        let agents: Vec<_> = names.iter().map(|n| (*n, *n, "plain_text")).collect();
        setup_with(Arc::new(MemoryGraphStore::new()), Arc::new(Echo), &agents, edges).await
    }

    fn steps_for(lines: &[String], name: &str) -> usize {
        let needle = format!("\"content\":\"{}\"", name);
        lines
            .iter()
            .filter(|l| l.contains("\"new_step\"") && l.contains(&needle))
            .count()
    }

    #[tokio::test]
    async fn test_rebuild_heads_and_idempotence() {
        let (scheduler, ids) = setup(&["a", "b", "c", "d"], &[("a", "b"), ("a", "c")]).await;
        let first = scheduler.rebuild().await.unwrap();
        let second = scheduler.rebuild().await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.heads, vec![ids["a"].clone(), ids["d"].clone()]);
        assert_eq!(first.incoming[&ids["b"]].len(), 1);
    }

    #[tokio::test]
    async fn test_diamond_runs_join_once() {
        let (scheduler, ids) =
            setup(&["a", "b", "c", "d"], &[("a", "b"), ("a", "c"), ("b", "d"), ("c", "d")]).await;
        let session = scheduler.run(None).await.unwrap();
        let lines: Vec<String> = session.stream.collect().await;

        let ends = lines.iter().filter(|l| l.contains("\"command\":\"end\"")).count();
        assert_eq!(ends, 1);
        let steps = lines.iter().filter(|l| l.contains("\"new_step\"")).count();
        assert_eq!(steps, 4);
        let log = session.run.snapshot().await;
        assert_eq!(log.succeed.get(&ids["d"]), Some(&1));
        assert_eq!(log.succeed.len(), 4);
    }

    #[tokio::test]
    async fn test_jump_target_is_not_restarted_by_its_static_parent() {
        let (scheduler, ids) = setup_with(
            Arc::new(MemoryGraphStore::new()),
            Arc::new(Slow),
            &[
                ("router", r#"{"tool_name": "w"}"#, "json"),
                ("x", "take your time", "plain_text"),
                ("w", "write", "plain_text"),
            ],
            &[("x", "w")],
        )
        .await;
        let session = scheduler.run(None).await.unwrap();
        let lines: Vec<String> = session.stream.collect().await;

        assert_eq!(steps_for(&lines, "w"), 1);
        let log = session.run.snapshot().await;
        assert_eq!(log.succeed.get(&ids["w"]), Some(&1));
        assert_eq!(log.succeed.get(&ids["x"]), Some(&1));
    }

    #[tokio::test]
    async fn test_self_jump_stops_at_visit_cap() {
        let (scheduler, ids) = setup_with(
            Arc::new(MemoryGraphStore::new()),
            Arc::new(Echo),
            &[("again", r#"{"tool_name": "again"}"#, "json")],
            &[],
        )
        .await;
        let session = scheduler.run(None).await.unwrap();
        let lines: Vec<String> = session.stream.collect().await;

        let cap = EngineConfig::default().max_agent_visits;
        assert_eq!(steps_for(&lines, "again"), cap);
        assert_eq!(session.run.snapshot().await.succeed.get(&ids["again"]), Some(&(cap as u32)));
    }

    #[tokio::test]
    async fn test_edge_read_failure_is_recorded() {
        let store: Arc<dyn GraphStore> = Arc::new(BrokenEdges(MemoryGraphStore::new()));
        let (scheduler, ids) = setup_with(
            store,
            Arc::new(Echo),
            &[("a", "a", "plain_text"), ("b", "b", "plain_text")],
            &[("a", "b")],
        )
        .await;
        let session = scheduler.run(None).await.unwrap();
        let lines: Vec<String> = session.stream.collect().await;

        assert_eq!(lines.iter().filter(|l| l.contains("\"command\":\"end\"")).count(), 1);
        assert_eq!(session.run.outcome(&ids["a"]).await, Some(Outcome::Failed));
        let error = session.run.error(&ids["a"]).await.unwrap();
        assert!(error.contains("connection reset"), "{}", error);
        assert_eq!(session.run.outcome(&ids["b"]).await, None);
    }

    #[tokio::test]
    async fn test_run_step_does_not_follow_edges() {
        let (scheduler, ids) = setup(&["a", "b"], &[("a", "b")]).await;
        let run = scheduler.runs().new_run().await.unwrap();
        let session = scheduler.run_step(&ids["a"], run).await.unwrap();
        let _: Vec<String> = session.stream.collect().await;

        assert_eq!(session.run.outcome(&ids["a"]).await, Some(Outcome::Succeed));
        assert_eq!(session.run.outcome(&ids["b"]).await, None);
    }

    #[tokio::test]
    async fn test_run_step_unknown_agent() {
        let (scheduler, _) = setup(&["a"], &[]).await;
        let run = scheduler.runs().new_run().await.unwrap();
        assert!(matches!(
            scheduler.run_step("ghost", run).await,
            Err(FlowError::NotFound { .. })
        ));
    }
}
