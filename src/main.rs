//! acs-gateway - API gateway and session keeper.
//!
//! Usage:
//!   acs-gateway serve [--port 3000] [--backend-url URL]     # Start the gateway
//!   acs-gateway watch --user-id ID [--org-id ID] --token T  # Keep a session warm

use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;
use std::time::Duration;

use acs_gateway::config::ProxyConfig;
use acs_gateway::http_server;
use acs_gateway::refresh::{
    CacheKey, HttpQueryCache, NoopEnvironment, QueryCache, RefetchType, RefreshConfig,
    RefreshCoordinator, StaticToken,
};
use acs_gateway::state::AppState;
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "acs-gateway")]
#[command(about = "Authenticated API gateway for the ACS exam-report analyzer")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP gateway
    Serve {
        /// Port to listen on (overrides GATEWAY_PORT)
        #[arg(long)]
        port: Option<u16>,

        /// Backend API base URL (overrides BACKEND_URL)
        #[arg(long)]
        backend_url: Option<String>,
    },
    /// Keep a session's cached auth data fresh until interrupted
    Watch {
        #[arg(long)]
        user_id: String,

        #[arg(long)]
        org_id: Option<String>,

        /// Bearer token issued by the identity provider
        #[arg(long, env = "ACS_SESSION_TOKEN", hide_env_values = true)]
        token: String,

        #[arg(long, env = "BACKEND_URL", default_value = "http://localhost:8000")]
        backend_url: String,

        /// JSON file with refresh intervals
        #[arg(long)]
        refresh_config: Option<PathBuf>,

        /// Skip user refreshes after 10 minutes without activity
        #[arg(long)]
        activity_gating: bool,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("acs_gateway=info,tower_http=info")),
        )
        .init();

    let args = Args::parse();

    let result = match args.command {
        Commands::Serve { port, backend_url } => serve(port, backend_url).await,
        Commands::Watch {
            user_id,
            org_id,
            token,
            backend_url,
            refresh_config,
            activity_gating,
        } => {
            watch(user_id, org_id, token, backend_url, refresh_config, activity_gating).await
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        exit(1);
    }
}

async fn serve(
    port: Option<u16>,
    backend_url: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = ProxyConfig::from_env()?;
    if let Some(port) = port {
        config.port = port;
    }
    if let Some(url) = backend_url {
        config.backend_url = url.trim_end_matches('/').to_string();
    }
    if config.webhook_secret.is_none() {
        warn!(
            event = "gateway.webhook.unconfigured",
            "CLERK_WEBHOOK_SECRET not set, webhook endpoint will reject all deliveries"
        );
    }

    let state = AppState::new(config)?;
    http_server::run_server(state).await?;
    Ok(())
}

async fn watch(
    user_id: String,
    org_id: Option<String>,
    token: String,
    backend_url: String,
    refresh_config: Option<PathBuf>,
    activity_gating: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = match refresh_config {
        Some(path) => RefreshConfig::from_json_file(&path)?,
        None => RefreshConfig::default(),
    };
    // A headless host never reports activity.
    config.enable_activity_based_refresh = activity_gating;

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()?;
    let cache = Arc::new(HttpQueryCache::new(
        client,
        backend_url,
        Arc::new(StaticToken::new(token)),
    ));

    cache.observe(CacheKey::user(&user_id), config.user_data_interval());
    cache.observe(CacheKey::permissions(&user_id), config.permissions_interval());
    cache.observe(CacheKey::session(&user_id), config.session_check_interval());
    if let Some(org_id) = &org_id {
        cache.observe(CacheKey::organization(org_id), config.user_data_interval());
    }

    let coordinator = RefreshCoordinator::new(cache.clone(), Arc::new(NoopEnvironment), config);

    coordinator.refresh_all(&user_id, org_id.as_deref()).await?;
    if let Err(e) = cache.refetch(&CacheKey::session(&user_id), RefetchType::All).await {
        warn!(event = "watch.probe.failed", error = %e, "Initial session probe failed");
    }

    coordinator.start(&user_id, org_id.as_deref());
    info!(event = "watch.started", user_id = %user_id, "Watching session (Ctrl+C to stop)");

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(event = "watch.signal.failed", error = %e, "Failed to listen for Ctrl+C");
    }

    let status = coordinator.status();
    coordinator.stop();
    info!(
        event = "watch.stopped",
        intervals = status.active_intervals,
        idle_secs = status.last_activity.elapsed().as_secs(),
        "Stopped watching"
    );
    Ok(())
}
