//! Application lifecycle: provider assembly, shared state, and shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio::signal;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::auth::cache::{Cache, SqliteStore};
use crate::auth::providers::Provider;
use crate::auth::AuthStore;
use crate::config::Config;
use crate::server;
use crate::state::AppState;

/// Run the server until a shutdown signal arrives.
pub async fn run(config: Config) -> anyhow::Result<()> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.listen_port,
        mux_enabled = config.mux_enabled,
        "veilgate starting"
    );

    let http = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()?;

    let providers = build_providers(&config);
    if providers.is_empty() {
        warn!("no uuid providers configured, every tunnel will be rejected");
    }

    let l2: Option<Box<dyn Cache>> = match &config.cache_db {
        Some(path) => Some(Box::new(SqliteStore::open(path)?)),
        None => None,
    };

    let auth = Arc::new(AuthStore::new(
        providers,
        l2,
        Duration::from_secs(config.uuid_cache_ttl),
        http.clone(),
    ));

    // Prime the allow-set so the first tunnel doesn't pay the fetch.
    let initial = auth.authorized().await;
    info!(count = initial.len(), "uuid allow-set loaded");

    let state = AppState::new(config, auth, http);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = tokio::spawn(server::run(Arc::clone(&state), shutdown_rx));

    wait_for_shutdown().await;
    info!("shutdown signal received, cleaning up...");
    let _ = shutdown_tx.send(true);
    server.await??;

    info!("veilgate stopped");
    Ok(())
}

/// Assemble providers from the environment, in merge-priority order.
fn build_providers(config: &Config) -> Vec<Provider> {
    let mut providers = Vec::new();
    if config.dev_mode {
        if let Some(uuid) = &config.uuid {
            providers.push(Provider::static_list("static", vec![uuid.clone()]));
        }
    }
    if let (Some(url), Some(key)) = (&config.rw_api_url, &config.rw_api_key) {
        providers.push(Provider::remnawave(url.clone(), key.clone()));
    }
    if let Some(url) = &config.uuid_api_url {
        providers.push(Provider::generic_http(url.clone()));
    }
    providers
}

async fn wait_for_shutdown() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
