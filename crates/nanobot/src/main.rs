//! Assembly: config in, gateway up.

mod cli;

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use nanobot_agent::{
    AgentEngine, Completer, CompletionItem, CompletionRequest, CompletionResponse, EngineSampler,
    ProgressSink,
};
use nanobot_config::{expand_env_vars, Config};
use nanobot_gateway::{
    AuditCollector, GatewayConfig, GatewayState, TracingAuditSink,
};
use nanobot_session::{MemorySessionStore, ResourceStore, SessionStore, SqliteSessionStore};
use nanobot_tools::{HandlerTree, ToolRegistry};
use nanobot_types::CoreError;
use nanobot_wire::CallbackState;
use tracing::info;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Command, RunArgs};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Validate { config } => {
            let config = load_config(&config)?;
            match config.validate() {
                Ok(()) => {
                    println!("configuration is valid");
                    Ok(())
                }
                Err(errors) => {
                    for error in &errors {
                        eprintln!("{}", error);
                    }
                    bail!("{} configuration problem(s)", errors.len());
                }
            }
        }
        Command::Run(args) => {
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(run(args))
        }
    }
}

fn load_config(path: &std::path::Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let mut document: serde_json::Value =
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
    let env: BTreeMap<String, String> = std::env::vars().collect();
    expand_env_vars(&mut document, &env)?;
    Ok(serde_json::from_value(document)?)
}

async fn run(args: RunArgs) -> Result<()> {
    let config = Arc::new(load_config(&args.config)?);
    if let Err(errors) = config.validate() {
        for error in &errors {
            eprintln!("{}", error);
        }
        bail!("invalid configuration");
    }

    let (store, resources): (Arc<dyn SessionStore>, Arc<ResourceStore>) = match &args.state_db {
        Some(path) => (
            Arc::new(SqliteSessionStore::open(path)?),
            Arc::new(ResourceStore::open(path)?),
        ),
        None => (
            Arc::new(MemorySessionStore::new()),
            Arc::new(ResourceStore::in_memory()?),
        ),
    };

    let callbacks = Arc::new(CallbackState::new());
    let public_url = args
        .public_url
        .clone()
        .unwrap_or_else(|| format!("http://{}", args.listen));
    let redirect_uri = format!("{}/oauth/callback", public_url.trim_end_matches('/'));

    let registry = Arc::new(
        ToolRegistry::new(config.clone()).with_callbacks(callbacks.clone(), redirect_uri),
    );
    let tree = Arc::new(HandlerTree::new(
        config.clone(),
        registry.clone(),
        resources,
        store.clone(),
    ));
    registry.set_builtins(tree.clone());

    // The model itself lives behind the Completer seam; without a provider
    // wired in, a development stand-in echoes the prompt back.
    let completer: Arc<dyn Completer> = Arc::new(EchoCompleter);
    let engine = AgentEngine::new(config.clone(), registry.clone(), completer);
    registry.set_sampler(Arc::new(EngineSampler::new(engine.clone())));
    tree.set_chat_driver(Arc::new(engine));

    let state = GatewayState::new(
        config,
        store,
        tree,
        callbacks,
        AuditCollector::start(Arc::new(TracingAuditSink)),
        args.endpoint.clone(),
    );

    info!(listen = %args.listen, "starting nanobot");
    nanobot_gateway::run(
        GatewayConfig {
            listen: args.listen,
            endpoint_path: args.endpoint,
            health_path: args.health,
        },
        state,
    )
    .await?;
    Ok(())
}

/// Development stand-in for a real model provider: echoes the last user
/// text. Deployments replace this at the `Completer` seam.
struct EchoCompleter;

#[async_trait::async_trait]
impl Completer for EchoCompleter {
    async fn complete(
        &self,
        request: &CompletionRequest,
        progress: &ProgressSink,
    ) -> Result<CompletionResponse, CoreError> {
        let text = request
            .input
            .iter()
            .rev()
            .find_map(|item| match item {
                CompletionItem::Message { role, content, .. } if role == "user" => {
                    content.iter().find_map(|c| c.as_text()).map(str::to_string)
                }
                _ => None,
            })
            .unwrap_or_default();
        let item = CompletionItem::assistant_text(text);
        progress.emit(item.clone());
        Ok(CompletionResponse {
            output: vec![item],
            model: "echo".to_string(),
        })
    }
}
