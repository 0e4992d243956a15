//! Stable error kinds for the transfer core (spec §7).
//!
//! Glue code (config loading, directory setup) keeps using `anyhow::Result`
//! with `.context(...)`, matching the teacher's style. Components with
//! error kinds the spec calls out by name return `ConnectError` instead so
//! callers can match on them or let `axum` turn them into the right status
//! code via `IntoResponse`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConnectError {
    // ── C7 Authenticator ──────────────────────────────────────────────
    #[error("user not found")]
    UserNotFound,
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("token expired")]
    TokenExpired,
    #[error("invalid token")]
    InvalidToken,

    // ── C1 Port Allocator ─────────────────────────────────────────────
    #[error("no free port found in scan window")]
    NoFreePort,

    // ── C2 mDNS Discoverer ────────────────────────────────────────────
    #[error("advertise failed: {0}")]
    AdvertiseFailed(String),
    #[error("browse timed out")]
    BrowseTimeout,

    // ── C3 Chunked Transfer Manager ───────────────────────────────────
    #[error("unknown upload id")]
    UnknownUpload,
    #[error("chunk id out of range")]
    BadChunkID,
    #[error("chunk size does not match plan")]
    BadChunkSize,
    #[error("upload is incomplete")]
    IncompleteUpload,
    #[error("failed to initialize upload: {0}")]
    InitFailed(String),
    #[error("temporary file I/O error: {0}")]
    TempIOError(String),
    #[error("failed to move finished upload into place: {0}")]
    MoveFailed(String),

    // ── C5 File Sink ──────────────────────────────────────────────────
    #[error("sink degraded, wrote to fallback location: {0}")]
    SinkDegraded(String),

    // ── C6 Peer Session Manager ───────────────────────────────────────
    #[error("peer unreachable: {0}")]
    PeerUnreachable(String),
    #[error("dial failed: {0}")]
    DialFailed(String),

    // ── C8 REST Control Plane ─────────────────────────────────────────
    #[error("method not allowed")]
    MethodNotAllowed,
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("unauthorized")]
    Unauthorized,
}

impl ConnectError {
    /// HTTP status classification, per spec §7.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ConnectError::UserNotFound
            | ConnectError::InvalidCredentials
            | ConnectError::TokenExpired
            | ConnectError::InvalidToken
            | ConnectError::Unauthorized => StatusCode::UNAUTHORIZED,

            ConnectError::NoFreePort => StatusCode::INTERNAL_SERVER_ERROR,

            ConnectError::AdvertiseFailed(_) | ConnectError::BrowseTimeout => {
                StatusCode::INTERNAL_SERVER_ERROR
            }

            ConnectError::UnknownUpload
            | ConnectError::BadChunkID
            | ConnectError::BadChunkSize
            | ConnectError::IncompleteUpload
            | ConnectError::BadRequest(_) => StatusCode::BAD_REQUEST,

            ConnectError::InitFailed(_)
            | ConnectError::TempIOError(_)
            | ConnectError::MoveFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,

            // Sink degradation is non-fatal; the caller still gets 200 with
            // the real path, this variant is only surfaced as a log line in
            // practice. Kept here for completeness of the error kind set.
            ConnectError::SinkDegraded(_) => StatusCode::OK,

            ConnectError::PeerUnreachable(_) | ConnectError::DialFailed(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }

            ConnectError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
        }
    }
}

impl IntoResponse for ConnectError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = json!({ "success": false, "error": self.to_string() });
        (status, axum::Json(body)).into_response()
    }
}
