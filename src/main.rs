// SPDX-License-Identifier: MIT

//! Strava-Relay server
//!
//! Bridges Strava webhooks and OAuth completions into an ordered,
//! cursor-addressable event log served over a long-polling HTTP API. Also
//! exposes a CLI mode for managing Strava webhook subscriptions.

use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use strava_relay::{
    cli::{Cli, Command},
    config::Config,
    db::Store,
    routes,
    services::{OauthManager, StravaClient},
    worker::Worker,
    AppState,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Cli::parse();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Error: failed to load configuration: {err}");
            std::process::exit(1);
        }
    };

    match args.command {
        Some(Command::Subscriptions { action }) => {
            // Errors only: CLI output goes to stdout, not the log stream
            init_logging("error");
            if let Err(err) = strava_relay::cli::run(action, config).await {
                eprintln!("Error: {err:#}");
                std::process::exit(1);
            }
            Ok(())
        }
        None => run_server(config).await,
    }
}

async fn run_server(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    init_logging(&format!("strava_relay={},info", config.log_level));

    tracing::info!(
        host = %config.host,
        port = config.port,
        database = %config.database_path,
        credential_sets = ?config.credential_set_names(),
        "starting strava-relay"
    );

    let db = Store::open(&config.database_path).await?;
    tracing::info!("database opened");

    let strava = Arc::new(StravaClient::new(config.clone(), db.clone()));
    let oauth = Arc::new(OauthManager::new(
        config.clone(),
        db.clone(),
        strava.clone(),
    ));

    let state = Arc::new(AppState {
        config: config.clone(),
        db: db.clone(),
        oauth: oauth.clone(),
    });

    let app = routes::create_router(state);

    let cancel = CancellationToken::new();

    // Queue worker
    let worker = Worker::new(db, strava, config.clone());
    let worker_cancel = cancel.clone();
    let worker_handle = tokio::spawn(async move { worker.run(worker_cancel).await });

    // OAuth nonce scavenger
    tokio::spawn(oauth.run_state_scavenger(cancel.clone()));

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(address = %addr, "server listening");

    let shutdown_cancel = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            tracing::info!("shutting down gracefully");
            shutdown_cancel.cancel();
        })
        .await?;

    // Let the worker drain whatever it is holding
    cancel.cancel();
    let _ = worker_handle.await;

    tracing::info!("server stopped");
    Ok(())
}

/// Initialize structured JSON logging. `RUST_LOG` overrides the configured
/// directives.
fn init_logging(directives: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directives));

    let format = tracing_subscriber::fmt::layer()
        .json()
        .with_target(false)
        .with_current_span(true)
        .flatten_event(true);

    tracing_subscriber::registry().with(filter).with(format).init();
}

/// Resolve on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
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
