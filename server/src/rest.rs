//! C8 REST Control Plane (spec §6.1).
//!
//! No teacher module builds an HTTP API of its own; the axum + axum-extra +
//! tower-http stack is pulled wholesale from
//! `other_examples/manifests/morenodevai-haven/Cargo.toml`, and handlers
//! follow the extractor-plus-`Result<Json<T>, ConnectError>` idiom common
//! to axum services in that corpus. The same [`build_router`] is bound both
//! to the control-plane's own port and to each session's listener (spec
//! §4.5: `StartServer` "launches the HTTP listener that hosts the
//! WebSocket hub") so a dialed-in peer gets the identical upload/ws surface
//! a local operator does.

use crate::state::AppState;
use axum::body::Bytes;
use axum::extract::{ConnectInfo, Multipart, Query, State, WebSocketUpgrade};
use axum::http::Request;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use axum_extra::headers::authorization::Bearer;
use axum_extra::headers::{Authorization, HeaderMapExt};
use connect_core::auth::Claims;
use connect_core::error::ConnectError;
use connect_core::hub::Hub;
use connect_core::protocol::PeerEntry;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

const EXEMPT_PREFIXES: &[&str] = &["/static/", "/assets/", "/css/", "/js/"];
const EXEMPT_EXACT: &[&str] = &[
    "/ping",
    "/api/v1/status",
    "/api/v1/auth/login",
    "/api/v1/auth/refresh",
    "/",
];

/// Mount the embedded static web assets under each exempted prefix (spec §1:
/// "the core only serves them") plus a root fallback for the document(s)
/// themselves. Each prefix is served from its own subdirectory of
/// `static_dir` so `/static/`, `/assets/`, `/css/`, and `/js/` don't collide;
/// `ServeDir` answers 404 for anything missing, so an empty placeholder
/// directory is enough to make the routes resolve rather than fall through
/// to axum's default 404.
fn mount_static_assets(router: Router<AppState>, static_dir: &std::path::Path) -> Router<AppState> {
    router
        .nest_service("/static", ServeDir::new(static_dir.join("static")))
        .nest_service("/assets", ServeDir::new(static_dir.join("assets")))
        .nest_service("/css", ServeDir::new(static_dir.join("css")))
        .nest_service("/js", ServeDir::new(static_dir.join("js")))
        .fallback_service(ServeDir::new(static_dir))
}

pub fn build_router(state: AppState) -> Router {
    let static_dir = state.static_dir.clone();
    let router = Router::new()
        .route("/ping", get(ping))
        .route("/api/v1/status", get(status))
        .route("/api/v1/auth/login", post(login))
        .route("/api/v1/auth/refresh", post(refresh))
        .route("/api/v1/auth/change-password", post(change_password))
        .route("/api/v1/execute", post(execute))
        .route("/api/v1/connect/discover", get(discover))
        .route("/api/v1/connect/start-server", post(start_server))
        .route("/api/v1/connect/connect-to-peer", post(connect_to_peer))
        .route("/api/v1/connect/disconnect", post(disconnect))
        .route("/api/v1/connect/send-file", post(send_file))
        .route("/api/v1/connect/ws", get(ws_upgrade))
        .route("/api/v1/connect/upload/init", post(upload_init))
        .route("/api/v1/connect/upload/chunk", post(upload_chunk))
        .route("/api/v1/connect/upload/complete", post(upload_complete));
    mount_static_assets(router, &static_dir)
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bearer-token gate for every non-exempt path (spec §4.8). `/connect/ws`
/// is exempt here because browsers can't set a custom header on the
/// upgrade request; it authenticates itself from the `?token=` query
/// parameter instead.
async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let path = req.uri().path();
    let exempt = !state.config.enable_auth
        || EXEMPT_EXACT.contains(&path)
        || path == "/api/v1/connect/ws"
        || EXEMPT_PREFIXES.iter().any(|p| path.starts_with(p));

    if exempt {
        return next.run(req).await;
    }

    let claims = match req.headers().typed_get::<Authorization<Bearer>>() {
        Some(bearer) => state.authenticator.validate_token(bearer.token()),
        None => Err(ConnectError::Unauthorized),
    };

    match claims {
        Ok(claims) => {
            req.extensions_mut().insert(claims);
            next.run(req).await
        }
        Err(e) => e.into_response(),
    }
}

async fn ping() -> &'static str {
    "pong"
}

#[derive(Serialize)]
struct StatusResponse {
    status: &'static str,
    version: &'static str,
    uptime: u64,
}

async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        status: "ok",
        version: crate::state::VERSION,
        uptime: state.uptime_secs(),
    })
}

#[derive(Deserialize)]
struct LoginRequest {
    username: String,
    password: String,
}

#[derive(Serialize)]
struct TokenResponse {
    token: String,
    refresh_token: String,
    username: String,
    expires_in: i64,
}

async fn login(
    State(state): State<AppState>,
    Json(body): Json<LoginRequest>,
) -> Result<Json<TokenResponse>, ConnectError> {
    state.authenticator.authenticate(&body.username, &body.password).await?;
    let pair = state.authenticator.issue_pair(&body.username)?;
    Ok(Json(TokenResponse {
        token: pair.token,
        refresh_token: pair.refresh_token,
        username: body.username,
        expires_in: pair.expires_in,
    }))
}

#[derive(Deserialize)]
struct RefreshRequest {
    refresh_token: String,
}

async fn refresh(
    State(state): State<AppState>,
    Json(body): Json<RefreshRequest>,
) -> Result<Json<TokenResponse>, ConnectError> {
    let claims = state.authenticator.validate_token(&body.refresh_token)?;
    let pair = state.authenticator.refresh(&body.refresh_token).await?;
    Ok(Json(TokenResponse {
        token: pair.token,
        refresh_token: pair.refresh_token,
        username: claims.sub,
        expires_in: pair.expires_in,
    }))
}

#[derive(Deserialize)]
struct ChangePasswordRequest {
    current_password: String,
    new_password: String,
}

async fn change_password(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(body): Json<ChangePasswordRequest>,
) -> Result<Json<serde_json::Value>, ConnectError> {
    state
        .authenticator
        .authenticate(&claims.sub, &body.current_password)
        .await?;
    state
        .authenticator
        .update_password(&claims.sub, &body.new_password)
        .await?;
    Ok(Json(json!({ "success": true, "message": "password updated" })))
}

#[derive(Deserialize)]
struct ExecuteRequest {
    command: String,
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    params: Option<serde_json::Value>,
}

/// Passthrough stub: the spec marks `/execute` as "not part of the transfer
/// core" (§6.1). It echoes the request back without actually invoking an
/// external command, since no command-execution component exists in scope.
async fn execute(Json(body): Json<ExecuteRequest>) -> Json<serde_json::Value> {
    Json(json!({
        "success": true,
        "output": "",
        "command_run": body.command,
        "type": body.kind,
        "params": body.params,
    }))
}

async fn discover(State(state): State<AppState>) -> Json<serde_json::Value> {
    let devices: Vec<PeerEntry> = state.discoverer.browse().await;
    Json(json!({ "success": true, "devices": devices }))
}

#[derive(Deserialize)]
struct StartServerRequest {
    port: u16,
    path: Option<PathBuf>,
}

async fn start_server(
    State(state): State<AppState>,
    Json(body): Json<StartServerRequest>,
) -> Result<Json<serde_json::Value>, ConnectError> {
    let download_dir = body.path.unwrap_or_else(|| state.config.download_dir.clone());
    let mut info = HashMap::new();
    info.insert("version".to_string(), crate::state::VERSION.to_string());

    let (listener, port) = state
        .sessions
        .start_server(body.port, download_dir.clone(), true, hostname(), info)
        .await?;

    let hub = Arc::new(Hub::new(download_dir, state.config.enable_chunked_all));
    state.set_hub(Some(hub.clone())).await;

    let session_state = AppState {
        config: state.config.clone(),
        authenticator: state.authenticator.clone(),
        discoverer: state.discoverer.clone(),
        transfer: state.transfer.clone(),
        sessions: state.sessions.clone(),
        hub: state.hub.clone(),
        static_dir: state.static_dir.clone(),
        started_at: state.started_at,
    };
    let router = build_router(session_state);
    let std_listener = listener;
    std_listener.set_nonblocking(true).ok();
    let tokio_listener = tokio::net::TcpListener::from_std(std_listener)
        .map_err(|e| ConnectError::InitFailed(e.to_string()))?;

    let cancel = state.sessions.cancellation_token().await;
    let task = tokio::spawn(async move {
        let server = axum::serve(
            tokio_listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        );
        if let Some(cancel) = cancel {
            let graceful = server.with_graceful_shutdown(async move { cancel.cancelled().await });
            if let Err(e) = graceful.await {
                log::warn!("session listener exited with error: {e}");
            }
        } else if let Err(e) = server.await {
            log::warn!("session listener exited with error: {e}");
        }
    });
    state.sessions.attach_task(task).await;

    Ok(Json(json!({ "success": true, "ip": "0.0.0.0", "port": port })))
}

#[derive(Deserialize)]
struct ConnectToPeerRequest {
    ip: String,
    port: u16,
    path: Option<PathBuf>,
}

async fn connect_to_peer(
    State(state): State<AppState>,
    Json(body): Json<ConnectToPeerRequest>,
) -> Result<Json<serde_json::Value>, ConnectError> {
    let download_dir = body.path.unwrap_or_else(|| state.config.download_dir.clone());
    let peer_addr = format!("{}:{}", body.ip, body.port);
    let _cancel = state.sessions.connect_to(peer_addr, download_dir.clone()).await;

    let hub = Arc::new(Hub::new(download_dir, state.config.enable_chunked_all));
    state.set_hub(Some(hub)).await;

    Ok(Json(json!({ "success": true, "ip": body.ip, "port": body.port })))
}

async fn disconnect(State(state): State<AppState>) -> Json<serde_json::Value> {
    if !state.sessions.is_active().await {
        return Json(json!({ "success": false, "error": "No active connection" }));
    }
    state.sessions.stop().await;
    state.set_hub(None).await;
    Json(json!({ "success": true }))
}

async fn send_file(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<serde_json::Value>, ConnectError> {
    let Some(hub) = state.active_hub().await else {
        return Err(ConnectError::BadRequest("no active session".to_string()));
    };
    let peer_base_url = state
        .sessions
        .snapshot()
        .await
        .and_then(|s| s.peer_addr)
        .map(|addr| format!("http://{addr}"));

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ConnectError::BadRequest(e.to_string()))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field.file_name().unwrap_or("upload.bin").to_string();
        let bytes = field
            .bytes()
            .await
            .map_err(|e| ConnectError::BadRequest(e.to_string()))?;
        hub.send_file(&filename, &bytes, peer_base_url.as_deref())
            .await
            .map_err(|e| ConnectError::InitFailed(e.to_string()))?;
        return Ok(Json(json!({ "success": true })));
    }
    Err(ConnectError::BadRequest("missing file field".to_string()))
}

#[derive(Deserialize)]
struct WsQuery {
    token: Option<String>,
}

async fn ws_upgrade(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    if state.config.enable_auth {
        let Some(token) = query.token else {
            return ConnectError::Unauthorized.into_response();
        };
        if state.authenticator.validate_token(&token).is_err() {
            return ConnectError::Unauthorized.into_response();
        }
    }

    let Some(hub) = state.active_hub().await else {
        return ConnectError::BadRequest("no active session".to_string()).into_response();
    };
    let cancel = state
        .sessions
        .cancellation_token()
        .await
        .unwrap_or_default();

    ws.on_upgrade(move |socket| async move {
        hub.handle_socket(socket, addr, cancel).await;
    })
}

#[derive(Deserialize)]
struct UploadInitRequest {
    filename: String,
    file_size: u64,
}

async fn upload_init(
    State(state): State<AppState>,
    Json(body): Json<UploadInitRequest>,
) -> Result<Json<serde_json::Value>, ConnectError> {
    let info = state.transfer.init_upload(&body.filename, body.file_size)?;
    Ok(Json(json!({
        "success": true,
        "upload_id": info.upload_id,
        "chunk_size": info.chunk_size,
        "chunks": info.chunks,
    })))
}

#[derive(Deserialize)]
struct UploadChunkQuery {
    upload_id: String,
    chunk_id: u32,
}

async fn upload_chunk(
    State(state): State<AppState>,
    Query(query): Query<UploadChunkQuery>,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ConnectError> {
    state
        .transfer
        .upload_chunk(&query.upload_id, query.chunk_id, body.to_vec())
        .await?;
    Ok(Json(json!({ "success": true, "chunk_id": query.chunk_id })))
}

#[derive(Deserialize)]
struct UploadCompleteQuery {
    upload_id: String,
}

async fn upload_complete(
    State(state): State<AppState>,
    Query(query): Query<UploadCompleteQuery>,
) -> Result<Json<serde_json::Value>, ConnectError> {
    let path = state.transfer.complete_upload(&query.upload_id).await?;
    Ok(Json(json!({ "success": true, "file_path": path })))
}

fn hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| format!("connect-{}", &uuid::Uuid::new_v4().to_string()[..8]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exempt_paths_cover_the_spec_list() {
        assert!(EXEMPT_EXACT.contains(&"/ping"));
        assert!(EXEMPT_EXACT.contains(&"/api/v1/auth/login"));
        assert!(EXEMPT_PREFIXES.contains(&"/static/"));
    }
}
