//! Vigil Backend Server
//!
//! Entry point for the vigil-backend server: configuration loading, database
//! migrations, broker and worker wiring, and HTTP server startup.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use vigil_backend::config_helpers::{
    broker_shares_database, database_config_from_config, nvd_settings_from_config,
    parse_bind_address,
};
use vigil_backend::state::AppState;
use vigil_config::Config;
use vigil_db::{DbConnectionConfig, DbPool, SqlBroker, SqlStateStore};
use vigil_job_queue::{Broker, CachedStateStore, ClockService, InMemoryBroker, StateStore};
use vigil_upstream::{HttpTimeSource, NvdSearchClient};

mod cli;
mod tracing_setup;

use cli::CliArgs;
use tracing_setup::install_tracing_from_config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    eprintln!("[STARTUP] Vigil Backend starting...");
    let args = CliArgs::parse();

    eprintln!("[STARTUP] Loading config from: {:?}", args.config_path);
    let config = vigil_config::load_config(args.config_path.as_deref()).map_err(|e| {
        eprintln!("failed to load configuration: {e}");
        anyhow::anyhow!(e.to_string())
    })?;
    eprintln!("[STARTUP] Config loaded successfully");

    eprintln!("[STARTUP] Initializing tracing...");
    let _reload_handle = install_tracing_from_config(&config.logging);
    eprintln!("[STARTUP] Tracing initialized");

    eprintln!("[STARTUP] Setting up database...");
    let db_cfg = database_config_from_config(&config);
    let db_pool = open_database(&db_cfg).await?;
    eprintln!("[STARTUP] Database ready");

    eprintln!("[STARTUP] Connecting broker...");
    let broker = build_broker(&config, &db_pool).await?;
    eprintln!("[STARTUP] Broker configured");

    eprintln!("[STARTUP] Initializing services...");
    let store: Arc<dyn StateStore> = Arc::new(CachedStateStore::new(Arc::new(
        SqlStateStore::new(db_pool.clone()),
    )));
    let search = Arc::new(
        NvdSearchClient::new(nvd_settings_from_config(&config))
            .context("invalid search configuration")?,
    );
    let clock = Arc::new(build_clock(&config)?);
    let state = Arc::new(AppState::assemble(&config, store, broker, search, clock));
    tracing::info!(
        queue = %config.broker.queue,
        workers = config.workers.count,
        search_url = %config.search.base_url,
        time_source = config.clock.time_source_url.as_deref().unwrap_or("local"),
        "services configured"
    );

    if config.workers.autostart {
        state.workers.start().await;
        eprintln!("[STARTUP] Worker pool started");
    }

    let app = vigil_backend::build_router(Arc::clone(&state));

    let addr = parse_bind_address(&config.server.host, config.server.port);
    eprintln!("[STARTUP] Binding to {addr}");
    let listener = TcpListener::bind(addr).await?;
    eprintln!("[STARTUP] Ready to accept connections!");
    tracing::info!(%addr, "server listening");

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("shutting down");
    state.shutdown().await;
    Ok(())
}

/// Create a pool and apply the embedded migrations.
async fn open_database(db_cfg: &DbConnectionConfig) -> anyhow::Result<DbPool> {
    let pool = vigil_db::create_pool(db_cfg)
        .await
        .with_context(|| format!("failed to open database {}", db_cfg.url))?;

    tracing::info!(db_url = %db_cfg.url, "applying SQLite migrations");
    match vigil_migrations::sqlite_migrator().run(&pool).await {
        Ok(_) => {
            tracing::info!("database migrations applied successfully");
            Ok(pool)
        }
        Err(e) => {
            tracing::error!(%e, "failed to apply database migrations");
            Err(anyhow::anyhow!("failed to apply database migrations: {e}"))
        }
    }
}

/// `memory://` selects the in-process broker; anything else is a SQLite
/// queue, sharing the job database when the URLs match.
async fn build_broker(config: &Config, db_pool: &DbPool) -> anyhow::Result<Arc<dyn Broker>> {
    if config.broker.is_memory() {
        tracing::warn!("using in-memory broker; queued jobs do not survive a restart");
        return Ok(Arc::new(InMemoryBroker::new()));
    }

    let pool = if broker_shares_database(config) {
        db_pool.clone()
    } else {
        let mut broker_cfg = config.clone();
        broker_cfg.database.url = config.broker.url.clone();
        open_database(&database_config_from_config(&broker_cfg)).await?
    };

    let broker = SqlBroker::new(pool).with_visibility_timeout(config.broker.visibility_timeout());
    broker
        .recover()
        .await
        .context("failed to recover broker queue")?;
    Ok(Arc::new(broker))
}

fn build_clock(config: &Config) -> anyhow::Result<ClockService> {
    match &config.clock.time_source_url {
        Some(url) => {
            let source = HttpTimeSource::new(url.clone(), config.clock.timeout())
                .context("invalid time source configuration")?;
            Ok(ClockService::with_source(
                Arc::new(source),
                config.clock.timeout(),
            ))
        }
        None => Ok(ClockService::local()),
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(%err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
