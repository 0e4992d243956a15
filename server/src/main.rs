//! `connect-server` — headless binary wiring `connect-core`'s components
//! into an axum HTTP/WebSocket process (spec §11). Grounded on `CLI/src/
//! main.rs`'s startup sequence (config load, `#[tokio::main]`, background
//! task spawning) and `src-tauri/src/main.rs`'s runtime-setup shape, adapted
//! from a Tauri event loop to `tokio::signal::ctrl_c` graceful shutdown.

mod logging;
mod rest;
mod state;

use anyhow::{Context, Result};
use connect_core::auth::Authenticator;
use connect_core::config::Config;
use connect_core::discovery::Discoverer;
use connect_core::session::SessionManager;
use connect_core::transfer::TransferManager;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

use state::AppState;

/// `$XDG_CONFIG_HOME`-rooted directory holding `config.toml`, `credentials.json`,
/// `jwt_secret`, and `logs/` (spec §6.4). Grounded on `GUI/src/main.rs`'s
/// `resolve_config_dir`, simplified: the server always resolves to the OS
/// config directory rather than probing the working directory, since it has
/// no bundled default config to fall back to.
fn state_dir() -> Result<PathBuf> {
    let base = dirs::config_dir().context("no config directory available on this platform")?;
    Ok(base.join("connect"))
}

/// Discovery beacons ride on a fixed UDP port distinct from the HTTP control
/// plane, so a discovery listener restart doesn't collide with port
/// substitution on the HTTP side (spec §4.2).
const DISCOVERY_PORT: u16 = 54329;

#[tokio::main]
async fn main() -> Result<()> {
    let state_dir = state_dir()?;
    std::fs::create_dir_all(&state_dir).context("failed to create state directory")?;

    let config_path = state_dir.join("config.toml");
    let config = Config::load(&config_path).context("failed to load configuration")?;
    logging::setup_logger(&state_dir, config.quiet_output)?;

    log::info!("connect-server {} starting up", state::VERSION);

    let authenticator = Authenticator::load_or_init(
        &state_dir,
        config.jwt_secret.clone(),
        config.token_expiration_hours,
    )
    .context("failed to initialize authenticator")?;
    authenticator
        .seed_default_if_empty()
        .await
        .context("failed to seed default account")?;
    if authenticator.has_default_credentials().await {
        log::warn!(
            "connect-server is running with the default admin/lumo credentials still active — \
             change the password via /api/v1/auth/change-password before exposing this process \
             beyond loopback"
        );
    }

    let discoverer = Arc::new(Discoverer::new(DISCOVERY_PORT));
    discoverer.start().await;

    let transfer = TransferManager::new(config.download_dir.clone(), config.chunk_size)
        .context("failed to initialize transfer manager")?;
    let sessions = Arc::new(SessionManager::new(discoverer.clone(), false));

    // The embedded static web assets themselves are out of scope (spec §1);
    // this just gives the control plane a real directory to serve them from
    // if/when they're dropped in, rather than a route that resolves to
    // nothing (spec §1/§4.8: "the core only serves them").
    let static_dir = state_dir.join("static");
    std::fs::create_dir_all(&static_dir).context("failed to create static assets directory")?;

    let state = AppState {
        config: Arc::new(config.clone()),
        authenticator: Arc::new(authenticator),
        discoverer: discoverer.clone(),
        transfer: Arc::new(transfer),
        sessions: sessions.clone(),
        hub: Arc::new(RwLock::new(None)),
        static_dir,
        started_at: Instant::now(),
    };

    let router = rest::build_router(state.clone());
    let bind_port = connect_core::port::find_available_port(config.server_port, 10)
        .await
        .context("no free port available for the control plane")?;
    if bind_port != config.server_port {
        log::warn!(
            "port {} is in use, substituting {bind_port}",
            config.server_port
        );
    }

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", bind_port))
        .await
        .context("failed to bind control-plane listener")?;
    let local_addr = listener.local_addr()?;
    log::info!("control plane listening on {local_addr}");

    let server_task = tokio::spawn(async move {
        let server = axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        );
        if let Err(e) = server
            .with_graceful_shutdown(shutdown_signal())
            .await
        {
            log::error!("control plane exited with error: {e}");
        }
    });

    self_ping(local_addr.port()).await;

    server_task.await.context("control plane task panicked")?;

    state.sessions.stop().await;
    state.transfer.cleanup();
    state.discoverer.stop().await;
    log::info!("connect-server shut down cleanly");
    Ok(())
}

/// Self-ping `/ping` once after the listener is up (spec §4.7 readiness
/// probe). A failure is only a warning — the process keeps running.
async fn self_ping(port: u16) {
    let url = format!("http://127.0.0.1:{port}/ping");
    match reqwest::Client::new()
        .get(&url)
        .timeout(std::time::Duration::from_secs(5))
        .send()
        .await
    {
        Ok(resp) if resp.status().is_success() => log::info!("readiness probe succeeded"),
        Ok(resp) => log::warn!("readiness probe returned {}", resp.status()),
        Err(e) => log::warn!("readiness probe failed: {e}"),
    }
}

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
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    log::info!("shutdown signal received");
}
