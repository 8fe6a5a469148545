//! CellGrid Server - HTTP front end for the turn controller.
//!
//! Players join, an operator begins a game, every player posts its moves per
//! turn, and the controller drives the external simulation engine:
//! - `GET /players`, `POST /join`, `POST /begin`, `POST /moves`, `GET /state`
//! - `POST /stop` to end the running game
//! - `GET /events` for a server-sent event stream of turn results

mod routes;

use anyhow::Context;
use cellgrid_core::{ControllerConfig, TurnController};
use cellgrid_env::{HttpGateway, TokioContext};
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

use routes::{build_router, AppState};

/// CellGrid turn orchestration server
#[derive(Parser, Debug)]
#[command(name = "cellgrid-server")]
#[command(about = "Turn orchestration server for CellGrid", long_about = None)]
struct Config {
    /// Address to listen on
    #[arg(long, env = "CELLGRID_BIND", default_value = "0.0.0.0:3000")]
    bind: SocketAddr,

    /// Base URL of the simulation engine
    #[arg(long, env = "CELLGRID_ENGINE_URL", default_value = "http://localhost:8000")]
    engine_url: String,

    /// Per-request engine timeout in seconds
    #[arg(long, env = "CELLGRID_ENGINE_TIMEOUT_SECS", default_value = "10")]
    engine_timeout_secs: u64,

    /// Extra engine attempts when a turn computation fails
    #[arg(long, env = "CELLGRID_FINALIZE_RETRIES", default_value = "1")]
    finalize_retries: u32,

    /// Close a turn as soon as every player has submitted, even with a deadline
    #[arg(long, env = "CELLGRID_EARLY_COMPLETION")]
    early_completion: bool,

    /// tracing filter directive
    #[arg(
        long,
        env = "RUST_LOG",
        default_value = "cellgrid_server=info,cellgrid_core=info,tower_http=info"
    )]
    log_filter: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&config.log_filter).context("invalid log filter")?)
        .init();

    let gateway = HttpGateway::new(&config.engine_url, Duration::from_secs(config.engine_timeout_secs))
        .context("failed to create engine gateway")?;

    let controller = TurnController::new(
        TokioContext::shared(),
        Arc::new(gateway),
        ControllerConfig::default()
            .with_finalize_retries(config.finalize_retries)
            .with_early_completion(config.early_completion),
    );

    let app = build_router(AppState { controller });

    info!(
        bind = %config.bind,
        engine = %config.engine_url,
        timeout_secs = config.engine_timeout_secs,
        "cellgrid-server listening"
    );
    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.bind))?;
    axum::serve(listener, app).await?;
    Ok(())
}
