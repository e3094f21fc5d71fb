use std::net::SocketAddr;
use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::ConnectInfo;
use axum::extract::Path;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::http::StatusCode;
use axum::http::header;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::response::sse::Event as SseEvent;
use axum::response::sse::KeepAlive;
use axum::response::sse::Sse;
use axum::routing::get;
use axum::routing::post;
use futures::StreamExt;
use serde_json::Value as JsonValue;
use serde_json::json;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;

use crate::RemoteAccessService;
use crate::WorkerPort;

struct AppState {
    service: Arc<RemoteAccessService>,
    worker: Arc<dyn WorkerPort>,
}

/// Running HTTP server; dropping the handle leaks the task, so owners call
/// [`HttpServerHandle::shutdown`].
pub struct HttpServerHandle {
    cancel: CancellationToken,
    join: tokio::task::JoinHandle<()>,
    pub port: u16,
}

impl HttpServerHandle {
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.join.await;
        info!("remote http server stopped");
    }
}

/// Binds the authenticated surface on loopback and serves until shutdown.
pub async fn start_http_server(
    port: u16,
    service: Arc<RemoteAccessService>,
    worker: Arc<dyn WorkerPort>,
) -> std::io::Result<HttpServerHandle> {
    let state = Arc::new(AppState { service, worker });
    let app = Router::new()
        .route("/health", get(health))
        .route("/", get(index))
        .route("/api/status", get(api_status))
        .route("/api/models", get(api_models))
        .route("/api/conversations", get(api_conversations))
        .route(
            "/api/conversations/{chat_id}/messages",
            get(api_conversation_messages),
        )
        .route("/api/chat", post(api_chat))
        .route("/api/chat/stream", post(api_chat_stream))
        .with_state(state);

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let port = listener.local_addr()?.port();
    info!("remote http server listening on http://127.0.0.1:{port}");

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    let join = tokio::spawn(async move {
        let result = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await;
        if let Err(e) = result {
            error!("remote http server failed: {e}");
        }
    });

    Ok(HttpServerHandle { cancel, join, port })
}

/// The real client IP: cloudflared forwards it in CF-Connecting-IP, other
/// proxies in X-Forwarded-For, else the socket peer.
fn client_ip(headers: &HeaderMap, addr: &SocketAddr) -> String {
    if let Some(cf) = headers.get("CF-Connecting-IP").and_then(|v| v.to_str().ok()) {
        return cf.trim().to_string();
    }
    if let Some(forwarded) = headers.get("X-Forwarded-For").and_then(|v| v.to_str().ok())
        && let Some(first) = forwarded.split(',').next()
    {
        return first.trim().to_string();
    }
    addr.ip().to_string()
}

fn secured(headers: &HeaderMap, status: StatusCode, body: JsonValue) -> Response {
    let origin = headers
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("*")
        .to_string();
    (
        status,
        [
            ("X-Content-Type-Options", "nosniff".to_string()),
            ("X-Frame-Options", "DENY".to_string()),
            (
                "Cache-Control",
                "no-store, no-cache, must-revalidate".to_string(),
            ),
            ("Access-Control-Allow-Origin", origin),
            (
                "Access-Control-Allow-Headers",
                "Authorization, Content-Type".to_string(),
            ),
        ],
        Json(body),
    )
        .into_response()
}

fn error_response(headers: &HeaderMap, status: StatusCode, message: &str) -> Response {
    secured(headers, status, json!({"success": false, "error": message}))
}

/// IP allowlist, then per-IP rate limit, then (for protected paths) bearer
/// token auth. Returns the caller's IP on success.
fn preflight(
    state: &AppState,
    headers: &HeaderMap,
    addr: &SocketAddr,
    protected: bool,
) -> Result<String, Response> {
    let ip = client_ip(headers, addr);
    if !state.service.check_ip_allowed(&ip) {
        return Err(error_response(
            headers,
            StatusCode::FORBIDDEN,
            "Your IP address is not in the allowlist",
        ));
    }
    if !state.service.ip_limiter.is_allowed(&ip) {
        return Err(error_response(
            headers,
            StatusCode::TOO_MANY_REQUESTS,
            "Rate limit exceeded. Try again later.",
        ));
    }
    if protected {
        let token = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        let Some(token) = token else {
            return Err(error_response(
                headers,
                StatusCode::UNAUTHORIZED,
                "Missing or invalid Authorization header",
            ));
        };
        let validation = state.service.validate_token(token);
        if validation["valid"] != true {
            let reason = validation["reason"].as_str().unwrap_or("Invalid token");
            return Err(error_response(headers, StatusCode::UNAUTHORIZED, reason));
        }
    }
    Ok(ip)
}

async fn health(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    if let Err(denied) = preflight(&state, &headers, &addr, false) {
        return denied;
    }
    secured(
        &headers,
        StatusCode::OK,
        json!({"status": "healthy", "service": "nimbus"}),
    )
}

async fn index(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    if let Err(denied) = preflight(&state, &headers, &addr, false) {
        return denied;
    }
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "text/html; charset=utf-8"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        INDEX_HTML,
    )
        .into_response()
}

async fn api_status(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    if let Err(denied) = preflight(&state, &headers, &addr, true) {
        return denied;
    }
    let stats = state.worker.system_stats().await;
    secured(
        &headers,
        StatusCode::OK,
        json!({"success": true, "data": stats}),
    )
}

async fn api_models(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    if let Err(denied) = preflight(&state, &headers, &addr, true) {
        return denied;
    }
    match state.worker.models().await {
        Ok(models) => secured(
            &headers,
            StatusCode::OK,
            json!({"success": true, "models": models}),
        ),
        Err(e) => error_response(&headers, StatusCode::INTERNAL_SERVER_ERROR, &e),
    }
}

async fn api_conversations(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    if let Err(denied) = preflight(&state, &headers, &addr, true) {
        return denied;
    }
    let conversations = state.worker.conversations().await;
    secured(
        &headers,
        StatusCode::OK,
        json!({"success": true, "conversations": conversations}),
    )
}

async fn api_conversation_messages(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(chat_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(denied) = preflight(&state, &headers, &addr, true) {
        return denied;
    }
    let messages = state.worker.conversation_messages(&chat_id).await;
    secured(
        &headers,
        StatusCode::OK,
        json!({"success": true, "messages": messages}),
    )
}

/// Blocking chat: drains the stream and returns the full response.
async fn api_chat(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<JsonValue>,
) -> Response {
    if let Err(denied) = preflight(&state, &headers, &addr, true) {
        return denied;
    }
    if let Err(denied) = require_chat_fields(&headers, &body) {
        return denied;
    }

    let mut rx = match state.worker.chat(body).await {
        Ok(rx) => rx,
        Err(e) => return error_response(&headers, StatusCode::INTERNAL_SERVER_ERROR, &e),
    };

    let mut full_response = String::new();
    let mut chat_id = None;
    while let Some(event) = rx.recv().await {
        match event {
            nimbus_protocol::StreamEvent::Token { data, chat_id: id } => {
                full_response.push_str(&data);
                if chat_id.is_none() {
                    chat_id = id;
                }
            }
            nimbus_protocol::StreamEvent::Done { chat_id: id, .. } => {
                if id.is_some() {
                    chat_id = id;
                }
                break;
            }
            nimbus_protocol::StreamEvent::Cancelled { .. } => break,
            nimbus_protocol::StreamEvent::Error { message, .. } => {
                return error_response(&headers, StatusCode::INTERNAL_SERVER_ERROR, &message);
            }
            _ => {}
        }
    }
    secured(
        &headers,
        StatusCode::OK,
        json!({"success": true, "response": full_response, "chat_id": chat_id}),
    )
}

/// Streaming chat over Server-Sent Events; event names mirror the internal
/// stream events.
async fn api_chat_stream(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<JsonValue>,
) -> Response {
    if let Err(denied) = preflight(&state, &headers, &addr, true) {
        return denied;
    }
    if let Err(denied) = require_chat_fields(&headers, &body) {
        return denied;
    }

    let rx = match state.worker.chat(body).await {
        Ok(rx) => rx,
        Err(e) => return error_response(&headers, StatusCode::INTERNAL_SERVER_ERROR, &e),
    };

    let stream = ReceiverStream::new(rx).map(|event| {
        let name = event.sse_name();
        let data = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
        Ok::<SseEvent, std::convert::Infallible>(SseEvent::default().event(name).data(data))
    });
    Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response()
}

fn require_chat_fields(headers: &HeaderMap, body: &JsonValue) -> Result<(), Response> {
    for field in ["model", "prompt"] {
        if body.get(field).and_then(JsonValue::as_str).is_none() {
            return Err(error_response(
                headers,
                StatusCode::BAD_REQUEST,
                &format!("Missing '{field}' parameter"),
            ));
        }
    }
    Ok(())
}

const INDEX_HTML: &str = r#"<!DOCTYPE html>
<html>
<head>
  <meta charset="UTF-8">
  <meta name="viewport" content="width=device-width, initial-scale=1.0">
  <title>Nimbus - Remote Access</title>
  <style>
    body { font-family: system-ui; background: #0a0a0a; color: white;
           display: flex; align-items: center; justify-content: center;
           min-height: 100vh; margin: 0; }
    .card { background: #111; border: 1px solid #222; border-radius: 16px;
            padding: 32px; text-align: center; max-width: 400px; }
    h1 { font-size: 24px; margin-bottom: 8px; }
    p { color: #888; font-size: 14px; }
    .badge { background: #10b98120; color: #10b981; padding: 4px 12px;
             border-radius: 20px; font-size: 12px; display: inline-block; margin-top: 16px; }
  </style>
</head>
<body>
  <div class="card">
    <h1>Nimbus</h1>
    <p>Remote access is enabled</p>
    <div class="badge">Connected</div>
    <p style="margin-top: 24px; font-size: 12px;">
      Use the API endpoints with your token to chat.
    </p>
  </div>
</body>
</html>
"#;
