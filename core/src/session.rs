//! C6 Peer Session Manager (spec §4.5).
//!
//! Grounded on `src-tauri/src/runtime/lan/mod.rs`'s `LanTasks` (`cancel:
//! CancellationToken`, `handles: Vec<JoinHandle<()>>`, `shutdown`/`abort`) —
//! close to a direct match for `Stop()`'s contract, generalized from
//! "always-on mesh of N peers" to "exactly one session, which may be
//! server/client/duplex". Keeps no HTTP framework policy of its own (§11):
//! `start_server` only allocates the port and binds a `std::net::TcpListener`
//! for the caller (the `server` crate) to hand to `axum::serve`, then
//! registers that task's handle so `Stop` can await it.

use crate::discovery::Discoverer;
use crate::error::ConnectError;
use serde::Serialize;
use std::collections::HashMap;
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// How many neighboring ports `start_server` will probe before giving up
/// (spec §4.1's "small scan window").
const PORT_SCAN_WINDOW: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    Server,
    Client,
    Duplex,
}

impl SessionMode {
    fn as_str(self) -> &'static str {
        match self {
            SessionMode::Server => "server",
            SessionMode::Client => "client",
            SessionMode::Duplex => "duplex",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub mode: String,
    pub bind_addr: Option<String>,
    pub peer_addr: Option<String>,
    pub advertised: bool,
}

struct ActiveSession {
    mode: SessionMode,
    bind_addr: Option<SocketAddr>,
    peer_addr: Option<String>,
    #[allow(dead_code)]
    download_dir: PathBuf,
    advertised: bool,
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

/// Enforces "at most one live Session per process" (spec §3 invariant).
pub struct SessionManager {
    active: Mutex<Option<ActiveSession>>,
    discoverer: Arc<Discoverer>,
    default_duplex: bool,
}

impl SessionManager {
    pub fn new(discoverer: Arc<Discoverer>, default_duplex: bool) -> Self {
        Self {
            active: Mutex::new(None),
            discoverer,
            default_duplex,
        }
    }

    pub async fn is_active(&self) -> bool {
        self.active.lock().await.is_some()
    }

    pub async fn snapshot(&self) -> Option<SessionSnapshot> {
        self.active.lock().await.as_ref().map(|s| SessionSnapshot {
            mode: s.mode.as_str().to_string(),
            bind_addr: s.bind_addr.map(|a| a.to_string()),
            peer_addr: s.peer_addr.clone(),
            advertised: s.advertised,
        })
    }

    /// Tear down any existing session (idempotent), allocate a listening
    /// port via C1 (substituting on conflict), bind it, and — unless
    /// `advertise` is false — announce it via C2. Returns the bound
    /// listener plus the port actually used so the caller can start serving
    /// on it; the caller must register the resulting task with
    /// [`attach_task`] so `Stop` can await its shutdown.
    pub async fn start_server(
        &self,
        requested_port: u16,
        download_dir: PathBuf,
        advertise: bool,
        instance_name: String,
        info: HashMap<String, String>,
    ) -> Result<(StdTcpListener, u16), ConnectError> {
        self.stop().await;

        let port = crate::port::find_available_port(requested_port, PORT_SCAN_WINDOW).await?;
        if port != requested_port {
            log::warn!(
                "session: port {requested_port} is in use, substituting {port}"
            );
        }

        let listener = StdTcpListener::bind(("0.0.0.0", port))
            .map_err(|_| ConnectError::NoFreePort)?;
        listener
            .set_nonblocking(true)
            .map_err(|_| ConnectError::NoFreePort)?;
        let bind_addr = listener.local_addr().ok();

        let mut advertised = false;
        if advertise {
            match self.discoverer.advertise(instance_name, port, info).await {
                Ok(()) => advertised = true,
                Err(e) => log::warn!("session: advertise failed, continuing without it: {e}"),
            }
        }
        self.discoverer.start().await;

        let mode = if self.default_duplex {
            SessionMode::Duplex
        } else {
            SessionMode::Server
        };

        *self.active.lock().await = Some(ActiveSession {
            mode,
            bind_addr,
            peer_addr: None,
            download_dir,
            advertised,
            cancel: CancellationToken::new(),
            handles: Vec::new(),
        });

        Ok((listener, port))
    }

    /// Begin a client-mode (or duplex) session dialing `peer_addr`. Returns
    /// the cancellation token the caller should thread into its dial/read
    /// tasks; those tasks must be registered via [`attach_task`].
    pub async fn connect_to(
        &self,
        peer_addr: String,
        download_dir: PathBuf,
    ) -> CancellationToken {
        self.stop().await;
        let mode = if self.default_duplex {
            SessionMode::Duplex
        } else {
            SessionMode::Client
        };
        let cancel = CancellationToken::new();
        *self.active.lock().await = Some(ActiveSession {
            mode,
            bind_addr: None,
            peer_addr: Some(peer_addr),
            download_dir,
            advertised: false,
            cancel: cancel.clone(),
            handles: Vec::new(),
        });
        cancel
    }

    /// Register a background task (e.g. the spawned `axum::serve` future or
    /// a stdin-drive task) with the currently active session so `Stop` waits
    /// for it. A no-op if no session is active (the task's own cancellation
    /// token will still have fired by the time this would be reached).
    pub async fn attach_task(&self, handle: JoinHandle<()>) {
        if let Some(session) = self.active.lock().await.as_mut() {
            session.handles.push(handle);
        } else {
            handle.abort();
        }
    }

    pub async fn cancellation_token(&self) -> Option<CancellationToken> {
        self.active.lock().await.as_ref().map(|s| s.cancel.clone())
    }

    /// Cancel the active session's context, tear down any advertisement,
    /// and await component shutdown up to the spec's 5-second grace period
    /// before returning. Idempotent.
    pub async fn stop(&self) {
        let session = self.active.lock().await.take();
        let Some(session) = session else { return };

        session.cancel.cancel();
        if session.advertised {
            self.discoverer.stop_advertising().await;
        }

        let deadline = tokio::time::Duration::from_secs(crate::protocol::SHUTDOWN_GRACE_SECS);
        for handle in session.handles {
            if tokio::time::timeout(deadline, handle).await.is_err() {
                log::warn!("session: component did not shut down within grace period");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> SessionManager {
        SessionManager::new(Arc::new(Discoverer::new(0)), false)
    }

    #[tokio::test]
    async fn at_most_one_session_is_active() {
        let mgr = manager();
        assert!(!mgr.is_active().await);

        let (_listener, _port) = mgr
            .start_server(0, PathBuf::from("."), false, "a".into(), HashMap::new())
            .await
            .unwrap();
        assert!(mgr.is_active().await);

        // Starting a client session must cancel the prior server session.
        let cancel = mgr.connect_to("127.0.0.1:9999".into(), PathBuf::from(".")).await;
        assert!(mgr.is_active().await);
        assert!(!cancel.is_cancelled());

        let snapshot = mgr.snapshot().await.unwrap();
        assert_eq!(snapshot.mode, "client");
        assert_eq!(snapshot.peer_addr.as_deref(), Some("127.0.0.1:9999"));
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let mgr = manager();
        mgr.stop().await;
        mgr.stop().await;
        assert!(!mgr.is_active().await);
    }

    #[tokio::test]
    async fn stop_cancels_the_session_token() {
        let mgr = manager();
        let (_listener, _port) = mgr
            .start_server(0, PathBuf::from("."), false, "a".into(), HashMap::new())
            .await
            .unwrap();
        let token = mgr.cancellation_token().await.unwrap();
        mgr.stop().await;
        assert!(token.is_cancelled());
        assert!(!mgr.is_active().await);
    }
}
