//! mdr-daemon entry point.
//!
//! Thin: load config and secrets, connect and migrate Postgres, build the
//! orchestrator, start the interval scheduler and serve the HTTP API.

use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use axum::http::{HeaderValue, Method};
use mdr_daemon::{routes, state};
use mdr_db::PgStore;
use mdr_runtime::Orchestrator;
use tokio::sync::watch;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{info, Level};

const ENV_CONFIG_PATHS: &str = "MDR_CONFIG_PATHS";
const ENV_DAEMON_ADDR: &str = "MDR_DAEMON_ADDR";
const DEFAULT_CONFIG_PATH: &str = "config/ingest.yaml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Silent if the file does not exist; production injects env vars directly.
    let _ = dotenvy::from_filename(".env.local");

    init_tracing();

    let paths = config_paths_from_env();
    let path_refs: Vec<&str> = paths.iter().map(String::as_str).collect();
    let loaded = mdr_config::load_ingest_config(&path_refs)
        .with_context(|| format!("load config from {paths:?}"))?;
    let secrets = mdr_config::resolve_secrets(&loaded.ingest)?;
    info!(config_hash = %loaded.loaded.config_hash, sources = loaded.ingest.sources.len(), "config loaded");

    let pool = mdr_db::connect_from_env().await?;
    mdr_db::migrate(&pool).await?;
    let store = Arc::new(PgStore::new(pool));

    let orchestrator = Arc::new(Orchestrator::from_config(store, &loaded.ingest, &secrets));
    let shared = Arc::new(state::AppState::new(
        orchestrator,
        secrets.scheduler_token.clone(),
    ));
    if shared.scheduler_token.is_none() {
        info!("no scheduler token configured; trigger and purge are unauthenticated");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = state::spawn_scheduler(
        Arc::clone(&shared),
        loaded.ingest.schedule_interval(),
        shutdown_rx,
    );

    let app = routes::build_router(Arc::clone(&shared))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(local_origin_cors());

    let addr = bind_addr_from_env().unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 8899)));
    info!("mdr-daemon listening on http://{}", addr);

    axum::serve(tokio::net::TcpListener::bind(addr).await?, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
        })
        .await
        .context("http server exited")?;

    let _ = shutdown_tx.send(true);
    let _ = scheduler.await;
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}

/// Comma-separated layered config paths, in merge order.
fn config_paths_from_env() -> Vec<String> {
    let raw = std::env::var(ENV_CONFIG_PATHS).unwrap_or_default();
    let paths: Vec<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect();
    if paths.is_empty() {
        vec![DEFAULT_CONFIG_PATH.to_string()]
    } else {
        paths
    }
}

fn bind_addr_from_env() -> Option<SocketAddr> {
    std::env::var(ENV_DAEMON_ADDR).ok()?.parse().ok()
}

/// Browser access is limited to local dashboards.
fn local_origin_cors() -> CorsLayer {
    let origins: Vec<HeaderValue> = ["http://localhost", "http://127.0.0.1", "http://localhost:3000"]
        .iter()
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(tower_http::cors::Any)
}
