//! Shared process state handed to every axum handler (spec §3's
//! per-process singletons: one `Config`, one `Authenticator`, one
//! `Discoverer`, one `TransferManager`, one `SessionManager`, at most one
//! `Hub`).

use connect_core::auth::Authenticator;
use connect_core::config::Config;
use connect_core::discovery::Discoverer;
use connect_core::hub::Hub;
use connect_core::session::SessionManager;
use connect_core::transfer::TransferManager;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub authenticator: Arc<Authenticator>,
    pub discoverer: Arc<Discoverer>,
    pub transfer: Arc<TransferManager>,
    pub sessions: Arc<SessionManager>,
    /// Set when a session starts a WebSocket hub, cleared on disconnect.
    /// There is at most one live hub at a time, mirroring the
    /// at-most-one-session invariant in `SessionManager`.
    pub hub: Arc<RwLock<Option<Arc<Hub>>>>,
    /// Root directory the embedded static web assets are served from (spec
    /// §1: "the core only serves them"). The assets themselves are built
    /// elsewhere; this crate just mounts whatever is present there.
    pub static_dir: PathBuf,
    pub started_at: Instant,
}

impl AppState {
    pub async fn active_hub(&self) -> Option<Arc<Hub>> {
        self.hub.read().await.clone()
    }

    pub async fn set_hub(&self, hub: Option<Arc<Hub>>) {
        *self.hub.write().await = hub;
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
