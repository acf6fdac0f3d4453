use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::Config;
use crate::router::{build_router, AppState};

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 3000;
const REAP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser, Debug)]
#[command(name = "agent-console", bin_name = "agent-console")]
#[command(about = "Local control plane for an external coding-agent CLI")]
#[command(version, arg_required_else_help = true)]
pub struct AgentConsoleCli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the HTTP server.
    Server(ServerArgs),
}

#[derive(Args, Debug)]
pub struct ServerArgs {
    #[arg(long, short = 'H', default_value = DEFAULT_HOST)]
    host: String,

    #[arg(long, short = 'p', default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Workspace directory override.
    #[arg(long, short = 'w')]
    workspace: Option<PathBuf>,

    #[arg(long = "cors-allow-origin", short = 'O')]
    cors_allow_origin: Vec<String>,

    #[arg(long = "cors-allow-method", short = 'M')]
    cors_allow_method: Vec<String>,

    #[arg(long = "cors-allow-header", short = 'A')]
    cors_allow_header: Vec<String>,

    #[arg(long = "cors-allow-credentials", short = 'C')]
    cors_allow_credentials: bool,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("server error: {0}")]
    Server(String),
    #[error("invalid CORS origin: {0}")]
    InvalidCorsOrigin(String),
    #[error("invalid CORS method: {0}")]
    InvalidCorsMethod(String),
    #[error("invalid CORS header: {0}")]
    InvalidCorsHeader(String),
    #[error("--cors-allow-credentials requires explicit --cors-allow-method and --cors-allow-header values")]
    CorsCredentialsNeedExplicitLists,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub fn run_agent_console() -> Result<(), CliError> {
    let cli = AgentConsoleCli::parse();
    init_logging();
    match cli.command {
        Command::Server(args) => run_server(&args),
    }
}

pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_logfmt::builder()
                .layer()
                .with_writer(std::io::stderr),
        )
        .init();
}

fn run_server(server: &ServerArgs) -> Result<(), CliError> {
    let config = match &server.workspace {
        Some(workspace) => Config::for_workspace(workspace.clone()),
        None => Config::from_env(),
    };
    std::fs::create_dir_all(&config.workspace_dir)?;

    let state = Arc::new(AppState::new(config));
    let cors = build_cors_layer(server)?;
    let router = build_router(state.clone(), cors);

    let addr = format!("{}:{}", server.host, server.port);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| CliError::Server(err.to_string()))?;

    runtime.block_on(async move {
        spawn_reaper(state.clone());
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!(addr = %addr, workspace = %state.config.workspace_dir.display(), "server listening");
        axum::serve(listener, router)
            .with_graceful_shutdown(async {
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("shutting down");
            })
            .await
            .map_err(|err| CliError::Server(err.to_string()))
    })
}

/// Background sweep so finished jobs are evicted even when nobody polls.
fn spawn_reaper(state: Arc<AppState>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(REAP_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            state.engine.reap().await;
        }
    });
}

fn build_cors_layer(server: &ServerArgs) -> Result<CorsLayer, CliError> {
    // tower-http rejects wildcard methods/headers on credentialed requests at
    // request time; refuse the combination up front instead.
    if server.cors_allow_credentials
        && (server.cors_allow_method.is_empty() || server.cors_allow_header.is_empty())
    {
        return Err(CliError::CorsCredentialsNeedExplicitLists);
    }

    let mut cors = CorsLayer::new();

    let mut origins = Vec::new();
    for origin in &server.cors_allow_origin {
        let value = origin
            .parse()
            .map_err(|_| CliError::InvalidCorsOrigin(origin.clone()))?;
        origins.push(value);
    }
    if origins.is_empty() {
        cors = cors.allow_origin(tower_http::cors::AllowOrigin::predicate(|_, _| false));
    } else {
        cors = cors.allow_origin(origins);
    }

    if server.cors_allow_method.is_empty() {
        cors = cors.allow_methods(Any);
    } else {
        let mut methods = Vec::new();
        for method in &server.cors_allow_method {
            let parsed = method
                .parse()
                .map_err(|_| CliError::InvalidCorsMethod(method.clone()))?;
            methods.push(parsed);
        }
        cors = cors.allow_methods(methods);
    }

    if server.cors_allow_header.is_empty() {
        cors = cors.allow_headers(Any);
    } else {
        let mut headers = Vec::new();
        for header in &server.cors_allow_header {
            let parsed = header
                .parse()
                .map_err(|_| CliError::InvalidCorsHeader(header.clone()))?;
            headers.push(parsed);
        }
        cors = cors.allow_headers(headers);
    }

    if server.cors_allow_credentials {
        cors = cors.allow_credentials(true);
    }

    Ok(cors)
}
