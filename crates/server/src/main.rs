//! chatmem server entry point

use std::net::SocketAddr;

use chatmem_config::{load_settings, Settings};
use chatmem_server::{create_router, init_metrics, AppState};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Priority: env vars > config/{env}.yaml > config/default.yaml > defaults
    let env = std::env::var("CHATMEM_ENV").ok();
    let settings = match load_settings(env.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            // Tracing is not up yet; eprintln is the only channel
            eprintln!("failed to load configuration: {e}");
            return Err(e.into());
        }
    };

    init_tracing(&settings);
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        environment = ?settings.environment,
        config_env = env.as_deref().unwrap_or("default"),
        "starting chatmem server"
    );

    if settings.observability.metrics_enabled {
        let _ = init_metrics();
        tracing::info!("Prometheus metrics exposed at /metrics");
    }

    let port = settings.server.port;
    let state = AppState::init(settings).await?;
    let dispatcher = state.dispatcher.clone();
    let app = create_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!(%addr, "listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Drain in-flight extractions before exiting; messages still queued
    // after the deadline are lost and retried upstream
    if !dispatcher.shutdown_soft().await {
        tracing::warn!("drain incomplete, aborting remaining workers");
        dispatcher.shutdown_hard();
    }

    tracing::info!("server shutdown complete");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
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
        _ = ctrl_c => {
            tracing::info!("received Ctrl+C, shutting down");
        }
        _ = terminate => {
            tracing::info!("received SIGTERM, shutting down");
        }
    }
}

/// Initialize tracing from settings; RUST_LOG wins when set
fn init_tracing(settings: &Settings) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!(
            "chatmem={},tower_http=info",
            settings.observability.log_level
        )
        .into()
    });

    let fmt_layer = if settings.observability.log_json {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
