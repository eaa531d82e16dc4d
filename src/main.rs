//! NestTask sync agent
//!
//! Keeps the local offline store in step with the remote API: probes
//! connectivity, reconciles pending changes on reconnect, and refreshes
//! cached listings.

use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use nesttask_sync::config::LogFormat;
use nesttask_sync::remote::HttpRemote;
use nesttask_sync::{
    init_database, Config, ConnectivityProbe, ConnectivitySignal, LocalStore, Remotes, Workspace,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize logging
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let registry = tracing_subscriber::registry().with(env_filter);
    match config.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }

    tracing::info!("Starting NestTask sync agent");
    tracing::info!("Database path: {:?}", config.db_path);
    tracing::info!("Remote URL: {}", config.remote_url);

    if config.api_key.is_none() {
        tracing::warn!("No API key configured (NESTTASK_API_KEY). Requests are unauthenticated!");
    }
    if config.user_id.is_none() {
        tracing::warn!("No user configured (NESTTASK_USER_ID). Tasks are not scoped to an owner");
    }

    // Open the local store, degrading to online-only operation
    let store = match init_database(&config.db_path).await {
        Ok(pool) => LocalStore::new(pool),
        Err(e) => {
            tracing::error!("Local store unavailable, running online-only: {}", e);
            LocalStore::unavailable()
        }
    };

    let remote = Arc::new(HttpRemote::from_config(&config)?);
    let initially_online = remote.health().await.is_ok();
    let connectivity = ConnectivitySignal::new(initially_online, config.debounce);

    let workspace = Arc::new(Workspace::new(
        &config,
        store,
        connectivity.clone(),
        Remotes::http(remote.clone()),
    ));

    let probe = ConnectivityProbe::new(connectivity, config.probe_interval).spawn(move || {
        let remote = remote.clone();
        async move { remote.health().await.is_ok() }
    });
    let reconnect = workspace.spawn_reconnect_sync();

    if initially_online {
        let report = workspace.sync_now().await;
        tracing::info!(failed = report.failure_count(), "Initial sync finished");
    } else {
        tracing::warn!("Remote unreachable, starting offline");
    }
    workspace.load_all(false).await;

    for pending in workspace.pending_counts().await {
        tracing::info!("{} record(s) waiting to sync in {}", pending.pending, pending.store);
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    probe.abort();
    reconnect.abort();

    Ok(())
}
