use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::Result;
use clap::Parser;

use dbnode::http::{router, AppState};
use dbnode::region::Region;
use dbnode::{build_node, Config};

/// The Engine: a permissionless, horizontally replicated SQLite-family
/// database node.
#[derive(Debug, Parser)]
#[command(name = "dbnode")]
#[command(about = "Engine database node", long_about = None)]
struct Cli {
    /// Directory holding one SQLite file per hosted database.
    #[clap(long, env = "DBNODE_DATA_DIR", default_value = "data")]
    data_dir: PathBuf,

    /// Address the client HTTP/WebSocket surface listens on.
    #[clap(long, env = "DBNODE_HTTP_ADDR", default_value = "127.0.0.1:8080")]
    http_addr: SocketAddr,

    /// Operator address used in `nodeId` derivation and as ACL owner
    /// fallback.
    #[clap(long, env = "DBNODE_OPERATOR_ADDRESS")]
    operator_address: String,

    /// Public HTTP endpoint advertised to the Registry and peers.
    #[clap(long, env = "DBNODE_ENDPOINT")]
    endpoint: Option<String>,

    /// Public WebSocket endpoint advertised to the Registry and peers.
    #[clap(long, env = "DBNODE_WS_ENDPOINT")]
    ws_endpoint: Option<String>,

    /// Region tag from the eight-region taxonomy (§6); unknown values map
    /// to `global`.
    #[clap(long, env = "DBNODE_REGION", default_value = "global")]
    region: String,

    /// Advertise this Node as TEE-capable.
    #[clap(long, env = "DBNODE_TEE_ENABLED")]
    tee_enabled: bool,

    /// Stake amount submitted on registration.
    #[clap(long, env = "DBNODE_STAKE", default_value = "0")]
    stake: u64,

    /// Base URL of the external Registry. When unset, the Node runs in
    /// permanent offline mode.
    #[clap(long, env = "DBNODE_REGISTRY_URL")]
    registry_url: Option<String>,

    /// Attestation levels this Node accepts for TEE-gated databases
    /// (comma-separated).
    #[clap(long, env = "DBNODE_ACCEPTED_TEE_LEVELS", value_delimiter = ',', default_value = "strict")]
    accepted_tee_levels: Vec<String>,

    /// Enable development-mode auto-provisioning of unknown databases
    /// (SPEC_FULL.md §B.5).
    #[clap(long, env = "DBNODE_DEV")]
    dev: bool,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Cli::parse();

    match run(args).await {
        Ok(()) => std::process::exit(0),
        Err(err) => {
            tracing::error!(error = %err, "fatal startup error");
            std::process::exit(1);
        }
    }
}

async fn run(args: Cli) -> Result<()> {
    let endpoint = args
        .endpoint
        .unwrap_or_else(|| format!("http://{}", args.http_addr));
    let ws_endpoint = args
        .ws_endpoint
        .unwrap_or_else(|| format!("ws://{}", args.http_addr));

    let config = Config {
        data_dir: args.data_dir,
        http_addr: args.http_addr,
        operator_address: args.operator_address,
        endpoint,
        ws_endpoint,
        region: Region::from_str(&args.region).unwrap(),
        tee_enabled: args.tee_enabled,
        stake: args.stake,
        dev_mode: args.dev,
        registry_url: args.registry_url,
        accepted_tee_levels: args.accepted_tee_levels,
    };

    let node = build_node(&config).await?;
    let app = router(AppState { node: node.clone() });

    tracing::info!(addr = %config.http_addr, node_id = %node.info.node_id, "listening");
    axum::Server::bind(&config.http_addr)
        .serve(app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    node.shutdown().await;
    Ok(())
}

/// Waits on SIGINT or (unix only) SIGTERM, driving the §4.5 shutdown
/// sequence (SPEC_FULL.md §B.2).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
