//! AgentOAuth evaluator gateway binary
//!
//! Single binary exposing the HTTP surface. Configuration comes from
//! environment variables (RP_ID, SIGNING_PRIVATE_KEY, STATE_BACKEND_URL,
//! JWKS_URLS, ...); exit code is non-zero on configuration errors.

use agentoauth_gateway::{metrics, router, AppState, GatewayConfig};
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, Level};

#[derive(Parser)]
#[command(name = "agentoauth-gateway")]
#[command(about = "AgentOAuth evaluator gateway")]
struct Cli {
    /// HTTP listen address
    #[arg(long, env = "HTTP_ADDR", default_value = "0.0.0.0:8080")]
    http_addr: String,

    /// Enable CORS for all origins (development only)
    #[arg(long, default_value = "false")]
    cors_permissive: bool,

    /// Force in-memory state even if STATE_BACKEND_URL is configured
    #[arg(long, default_value = "false")]
    memory_only: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_target(true)
        .init();

    let cli = Cli::parse();

    let mut config = GatewayConfig::from_env();
    if cli.memory_only {
        config.state_backend_url = None;
    }

    info!(
        http = %cli.http_addr,
        rp_id = %config.rp_id,
        state_backend = ?config.state_backend_url,
        jwks_urls = ?config.jwks_urls,
        "Starting AgentOAuth gateway"
    );

    let metrics_handle = metrics::init_metrics();

    let state = Arc::new(AppState::with_config(config).await?);

    let cors = if cli.cors_permissive {
        CorsLayer::permissive()
    } else {
        // Restrictive default: browsers only, same-origin; API callers are
        // unaffected by CORS
        CorsLayer::new()
    };

    let app = router(state)
        .merge(metrics::routes(metrics_handle))
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    let http_addr: SocketAddr = cli.http_addr.parse()?;
    let listener = tokio::net::TcpListener::bind(http_addr).await?;
    info!("HTTP server listening on {}", http_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Gateway shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
