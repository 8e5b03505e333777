use std::sync::Arc;

use bsp_proxy::api::{self, AppState};
use bsp_proxy::config::AppConfig;
use bsp_proxy::metrics::Metrics;
use bsp_proxy::upstream::SapClient;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cfg = AppConfig::from_env()?;
    let listen_addr = cfg.listen_addr();

    let metrics = Metrics::new()?;
    let sap = SapClient::try_new(Arc::new(cfg.sap), metrics.clone())?;

    if cfg.diagnostics {
        tracing::warn!("diagnostics enabled; internal error chains are returned to callers");
    }

    let state = AppState {
        sap,
        metrics,
        diagnostics: cfg.diagnostics,
    };
    let app = api::router(state);

    let listener = tokio::net::TcpListener::bind(listen_addr).await?;

    tracing::info!(%listen_addr, "starting bsp proxy");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("bsp proxy exited cleanly");

    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::warn!(%error, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term_signal) => term_signal.recv().await,
            Err(error) => {
                tracing::warn!(%error, "failed to install SIGTERM handler");
                None
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutdown signal received");
}
