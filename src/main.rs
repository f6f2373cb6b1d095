use agentgraph_rs::adk::error::ModelError;
use agentgraph_rs::adk::model::openai::OpenAIModel;
use agentgraph_rs::adk::model::{Content, GenerationConfig, Model};
use agentgraph_rs::adk::tool::ToolTransport;
use agentgraph_rs::flow::config::EngineConfig;
use agentgraph_rs::flow::loader::{WorkflowDefinition, WorkflowLoader};
use agentgraph_rs::flow::mcp::{McpServerConfig, McpToolTransport};
use agentgraph_rs::flow::pipe::FeedbackMessage;
use agentgraph_rs::flow::scheduler::RunSession;
use agentgraph_rs::flow::store::MemoryGraphStore;
use agentgraph_rs::flow::workflow::{Workflow, WorkflowManager};
use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use futures::StreamExt;
use std::io::{BufRead, Write};
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a workflow; events go to stdout, feedback is read from stdin
    Run {
        /// Path to the workflow file
        #[arg(short, long)]
        file: String,
    },
    /// Run a single agent of a workflow in a fresh run
    Step {
        /// Path to the workflow file
        #[arg(short, long)]
        file: String,

        /// Name of the agent to run
        #[arg(short, long)]
        agent: String,
    },
    /// Print the agent graph of a workflow
    Graph {
        /// Path to the workflow file
        #[arg(short, long)]
        file: String,
    },
    /// List the tools an MCP server exposes
    Tools {
        /// Server command line
        #[arg(short, long, num_args = 1.., required = true)]
        server: Vec<String>,
    },
}

/// Stands in when no API key is configured; pre-authored steps still run
struct UnavailableModel {
    reason: String,
}

#[async_trait]
impl Model for UnavailableModel {
    async fn generate_content(
        &self,
        _history: &[Content],
        _config: Option<&GenerationConfig>,
    ) -> Result<Content, ModelError> {
        Err(ModelError::ApiKeyMissing(self.reason.clone()))
    }
}

fn build_model(config: &EngineConfig) -> anyhow::Result<Arc<dyn Model>> {
    if config.model.provider != "openai" {
        bail!("unsupported model provider '{}'", config.model.provider);
    }
    log::info!("Using model {}", config.model.model_name);
    match OpenAIModel::new(config.model.model_name.clone(), config.model.base_url.clone()) {
        Ok(model) => Ok(Arc::new(model)),
        Err(e) => {
            log::warn!("Text generation unavailable: {}", e);
            Ok(Arc::new(UnavailableModel {
                reason: config.model.provider.clone(),
            }))
        }
    }
}

async fn open_workflow(file: &str) -> anyhow::Result<(WorkflowDefinition, Arc<Workflow>)> {
    let def = WorkflowLoader::load_workflow(file).with_context(|| format!("loading {}", file))?;
    let config = def.engine_config(EngineConfig::from_env()?)?;
    let transport = def
        .mcp_server
        .clone()
        .map(|server| Arc::new(McpToolTransport::new(server)) as Arc<dyn ToolTransport>);

    let manager = WorkflowManager::new(
        Arc::new(MemoryGraphStore::new()),
        build_model(&config)?,
        transport,
        config,
    );
    let workflow = def.seed(&manager).await?;
    Ok((def, workflow))
}

/// Forward stdin lines to the run as feedback until the stream ends
fn spawn_feedback_reader(workflow: Arc<Workflow>) {
    let (tx, mut rx) = mpsc::channel::<String>(16);
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            match line {
                Ok(line) if line.trim().is_empty() => continue,
                Ok(line) => {
                    if tx.blocking_send(line).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    log::warn!("stdin closed: {}", e);
                    break;
                }
            }
        }
    });

    tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            let message: FeedbackMessage = match serde_json::from_str(&line) {
                Ok(message) => message,
                Err(e) => {
                    log::warn!("Ignoring malformed feedback: {}", e);
                    continue;
                }
            };
            if let Err(e) = workflow.feedback(message).await {
                log::warn!("Feedback not delivered: {}", e);
            }
        }
    });
}

async fn print_events(session: RunSession) -> anyhow::Result<()> {
    let mut stream = session.stream;
    let mut stdout = std::io::stdout();
    while let Some(line) = stream.next().await {
        stdout.write_all(line.as_bytes())?;
        stdout.flush()?;
    }
    let outcomes = session.run.snapshot().await;
    log::info!(
        "Run {} done: {} succeeded, {} failed",
        session.run.id(),
        outcomes.succeed.len(),
        outcomes.failed.len()
    );
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    env_logger::init();

    let args = Args::parse();

    match args.command {
        Commands::Run { file } => {
            let (def, workflow) = open_workflow(&file).await?;
            log::info!("Running workflow '{}'", def.name);
            let session = workflow.run().await?;
            spawn_feedback_reader(workflow.clone());
            print_events(session).await?;
        }
        Commands::Step { file, agent } => {
            let (_, workflow) = open_workflow(&file).await?;
            let graph = workflow.agent_graph().await?;
            let node = graph
                .nodes
                .iter()
                .find(|n| n.name == agent)
                .ok_or_else(|| anyhow!("no agent named '{}'", agent))?;
            let session = workflow.run_step(&node.id).await?;
            spawn_feedback_reader(workflow.clone());
            print_events(session).await?;
        }
        Commands::Graph { file } => {
            let (_, workflow) = open_workflow(&file).await?;
            let graph = workflow.agent_graph().await?;
            println!("{}", serde_json::to_string_pretty(&graph)?);
        }
        Commands::Tools { server } => {
            let (command, args) = server
                .split_first()
                .ok_or_else(|| anyhow!("missing server command"))?;
            let transport = McpToolTransport::new(McpServerConfig {
                command: command.clone(),
                args: args.to_vec(),
            });
            let tools = transport.list_tools().await?;
            println!("{}", serde_json::to_string_pretty(&tools)?);
        }
    }

    Ok(())
}
