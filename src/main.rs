// =============================================================================
// Matrixon Sliding Sync Proxy - Main Entry Point
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Loads the configuration, opens the store, resumes pollers for known
//   accounts and serves the client API until SIGINT/SIGTERM.
//
// =============================================================================

use std::{sync::Arc, time::Instant};

use anyhow::Context;
use matrixon_sliding_proxy::{
    api, database::KeyValueDatabase, service::pollers::upstream::HttpUpstream, Config, Services,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::{net::TcpListener, signal};
use tracing::{error, info, warn};
use tracing_subscriber::{prelude::*, EnvFilter};

mod clap;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let start = Instant::now();
    let args = clap::parse();

    let config = Config::load(args.config.as_deref()).context("Failed to load configuration")?;

    let filter = args.log_level.as_deref().unwrap_or(config.log_filter());
    let filter_layer = match EnvFilter::try_new(filter) {
        Ok(filter) => filter,
        Err(e) => {
            eprintln!("It looks like your log filter is invalid ({e}), falling back to warn");
            EnvFilter::new("warn")
        }
    };
    tracing_subscriber::registry()
        .with(filter_layer)
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(
        "🚀 Starting Matrixon Sliding Sync Proxy {} for {}",
        clap::version(),
        config.server
    );

    if let Some(address) = config.prometheus_address {
        PrometheusBuilder::new()
            .with_http_listener(address)
            .install()
            .context("Failed to install Prometheus exporter")?;
        info!("📊 Prometheus metrics on {}", address);
    }
    if config.pprof_address.is_some() {
        warn!("⚠️ pprof_address is set but profiling is not built into this binary");
    }

    let db = KeyValueDatabase::load_or_create(&config)
        .await
        .context("Database initialization failed")?;
    let upstream = Arc::new(HttpUpstream::new(&config.server)?);
    let services = Services::build(config.clone(), db, upstream)?;

    match services.pollers.start_known().await {
        Ok(started) => info!("🔄 Resumed {} pollers", started),
        Err(e) => error!("❌ Failed to resume pollers: {}", e),
    }
    let janitor = services.spawn_janitor();

    let listener = TcpListener::bind(config.bind_address)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_address))?;
    info!(
        "✅ Listening on {} after {:?}",
        config.bind_address,
        start.elapsed()
    );

    axum::serve(listener, api::router(Arc::clone(&services)))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    janitor.abort();
    services.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("❌ Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("❌ Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let sig: &str;

    tokio::select! {
        _ = ctrl_c => { sig = "Ctrl+C"; },
        _ = terminate => { sig = "SIGTERM"; },
    }

    warn!("Received {}, shutting down...", sig);
}
