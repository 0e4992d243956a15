//! C1 Port Allocator (spec §4.1).

use crate::error::ConnectError;
use tokio::net::TcpListener;

/// Attempt to bind `0.0.0.0:port`, releasing the listener immediately.
/// Returns `true` iff the bind succeeds. Best-effort and inherently racy —
/// callers must bind the returned port immediately and still handle a
/// second failure.
pub async fn is_port_available(port: u16) -> bool {
    TcpListener::bind(("0.0.0.0", port)).await.is_ok()
}

/// Scan `start, start+1, ..., start+max_attempts-1` and return the first
/// available port. `max_attempts == 0` immediately returns `NoFreePort`
/// (spec §8 boundary behavior).
pub async fn find_available_port(start: u16, max_attempts: u32) -> Result<u16, ConnectError> {
    for offset in 0..max_attempts {
        let candidate = start.checked_add(offset as u16);
        let Some(candidate) = candidate else {
            break;
        };
        if is_port_available(candidate).await {
            return Ok(candidate);
        }
    }
    Err(ConnectError::NoFreePort)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn max_attempts_zero_returns_no_free_port() {
        let result = find_available_port(20000, 0).await;
        assert!(matches!(result, Err(ConnectError::NoFreePort)));
    }

    #[tokio::test]
    async fn finds_first_available_port_in_window() {
        // Occupy the first candidate so the scan must skip to the next.
        let held = TcpListener::bind(("0.0.0.0", 0)).await.unwrap();
        let occupied_port = held.local_addr().unwrap().port();

        let found = find_available_port(occupied_port, 5).await.unwrap();
        assert_ne!(found, occupied_port);
        drop(held);
    }

    #[tokio::test]
    async fn is_port_available_reports_free_ephemeral_port() {
        // Bind an ephemeral port, release it, then confirm it reports free.
        let listener = TcpListener::bind(("0.0.0.0", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        assert!(is_port_available(port).await);
    }
}
