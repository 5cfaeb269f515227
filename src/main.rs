//! Posting sync service binary.
//! Loads config, starts the polling engine, and serves status over HTTP until
//! Ctrl-C / SIGTERM, draining the in-flight cycle before exiting.

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::info;

use posting_sync::api::{create_router, AppState};
use posting_sync::config::AppConfig;
use posting_sync::metrics::Metrics;
use posting_sync::{logging, AppContext};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env in local/dev; no-op when absent.
    let _ = dotenvy::dotenv();

    let config = AppConfig::load_default()?;
    logging::init(&config.logging)?;

    let cadence = config.cadence()?;
    let addr = format!("{}:{}", config.server.host, config.server.port);
    // before the engine: Diagnostics::new describes its series
    let metrics = Metrics::install(&cadence)?;
    let ctx = AppContext::from_config(config)?;

    info!(
        environment = %ctx.config.environment,
        location = %ctx.engine.polling_options().location,
        interval = %cadence.expression,
        "starting posting sync"
    );
    ctx.begin()?;

    let app = create_router(AppState {
        engine: ctx.engine.clone(),
    })
    .merge(metrics.router());

    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(%addr, "listening");

    let engine = ctx.engine.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            info!("shutdown requested, stopping synchronization");
            engine.stop_synchronization().await;
        })
        .await?;

    info!("server closed");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
