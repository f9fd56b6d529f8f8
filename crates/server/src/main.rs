use std::{env, io, path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;
use vibe_backend_openai::{OpenAiLikeOracle, OpenAiLikeSettings};
use vibe_core::{ChangeControl, VibeConfig};
use vibe_server::AppState;

#[derive(Parser, Debug)]
#[command(name = "vibe-server", version = env!("CARGO_PKG_VERSION"))]
struct Args {
    /// Workspace root to operate on
    #[arg(long = "workspace", value_name = "PATH")]
    workspace: Option<PathBuf>,

    /// Explicit path to vibe.toml
    #[arg(long = "config", value_name = "FILE")]
    config_path: Option<PathBuf>,

    /// Host binding for the HTTP server
    #[arg(long = "host", value_name = "HOST")]
    host: Option<String>,

    /// Port binding for the HTTP server
    #[arg(long = "port", value_name = "PORT")]
    port: Option<u16>,

    /// Optional log filter (e.g. info, debug, vibe_core=trace)
    #[arg(long = "log-level", value_name = "LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args);

    let workspace_override = args
        .workspace
        .clone()
        .or_else(|| env::var("VIBE_WORKSPACE").ok().map(PathBuf::from));
    let mut config = VibeConfig::from_sources(args.config_path.clone(), workspace_override.as_deref());
    let root = config.resolve_workspace_root(workspace_override)?;
    config.overlay_persisted_permissions(&root);

    if let Some(host) = args.host.clone() {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }

    let api_key = env::var(&config.oracle.api_key_env)
        .ok()
        .filter(|key| !key.trim().is_empty());
    if api_key.is_none() {
        tracing::warn!(
            "{} is not set; oracle requests will be sent without credentials",
            config.oracle.api_key_env
        );
    }
    let oracle = OpenAiLikeOracle::new(OpenAiLikeSettings {
        base_url: config.oracle.base_url.clone(),
        model: config.oracle.model.clone(),
        api_key,
        timeout: Duration::from_secs(config.oracle.timeout_secs),
        history_window: config.gateway.history_window,
    })?;

    let host = config.server.host.clone();
    let port = config.server.port;
    let control = ChangeControl::open(&root, config)
        .with_context(|| format!("Failed to open workspace {}", root.display()))?;
    tracing::info!(root = %root.display(), "workspace ready");

    let state = AppState::new(Arc::new(control), Arc::new(oracle));
    vibe_server::serve(state, &host, port).await
}

fn init_tracing(args: &Args) {
    let filter = match &args.log_level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr);

    let _ = builder.try_init();
}
