use std::sync::Arc;

use serde_json::Value as JsonValue;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::info;
use tracing::warn;

use nimbus_core::ActionType;
use nimbus_core::GuardDecision;
use nimbus_core::RateDecision;
use nimbus_core::validate_payload_size;
use nimbus_protocol::ErrorCode;
use nimbus_protocol::Request;
use nimbus_protocol::StreamEvent;

use crate::WorkerContext;
use crate::handlers;
use crate::outgoing::OutgoingSender;

/// Client id the IPC channel is accounted under in the rate limiter. The
/// local channel is single-client; per-IP keys exist only on the HTTP side.
pub const IPC_CLIENT_ID: &str = "ipc";

/// What a handler produces: a terminal value, or a lazy event sequence the
/// stream pump relays under the request id.
pub enum Outcome {
    Value(JsonValue),
    Stream(mpsc::Receiver<StreamEvent>),
}

/// Handler failure surfaced as `{status:"error", error:{code, message}}`.
pub struct HandlerError {
    pub code: ErrorCode,
    pub message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::CmdErr,
            message: message.into(),
        }
    }

    pub fn with_code(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<nimbus_core::CoreErr> for HandlerError {
    fn from(e: nimbus_core::CoreErr) -> Self {
        HandlerError::new(e.to_string())
    }
}

pub type HandlerResult = Result<Outcome, HandlerError>;

/// The dispatcher: two-stage guard, rate limiter, then the closed command
/// registry. One instance serves the whole session.
pub struct MessageProcessor {
    ctx: Arc<WorkerContext>,
    outgoing: OutgoingSender,
}

impl MessageProcessor {
    pub fn new(ctx: Arc<WorkerContext>, outgoing: OutgoingSender) -> Self {
        Self { ctx, outgoing }
    }

    pub async fn process_request(&self, request: Request) {
        let Request { id, cmd, payload } = request;

        // 1. Permission guard (deny-by-default for unknown names).
        if let GuardDecision::Denied { reason } = self.ctx.guard.check(&cmd) {
            self.ctx.audit.log(
                ActionType::PermissionDenied,
                json!({"cmd": cmd, "reason": reason}),
            );
            self.outgoing
                .error(&id, ErrorCode::PermissionDenied, reason)
                .await;
            return;
        }

        // 2. Payload size cap.
        if let Err(reason) = validate_payload_size(&payload) {
            self.outgoing
                .error(&id, ErrorCode::PayloadTooLarge, reason)
                .await;
            return;
        }

        // 3. Rate limiter, for commands it tracks.
        if self.ctx.rate.limits().contains_key(&cmd)
            && let RateDecision::Denied { retry_after } = self.ctx.rate.check(&cmd, IPC_CLIENT_ID)
        {
            self.outgoing.rate_limited(&id, retry_after).await;
            return;
        }

        match self.dispatch(&cmd, &payload).await {
            Ok(Outcome::Value(data)) => self.outgoing.ok(&id, data).await,
            Ok(Outcome::Stream(rx)) => {
                self.outgoing
                    .ok(&id, json!({"status": "streaming_started"}))
                    .await;
                self.spawn_stream_pump(id, rx);
            }
            Err(e) => self.outgoing.error(&id, e.code, e.message).await,
        }

        if cmd == "shutdown" {
            info!("shutdown requested by host");
            self.ctx.shutdown.cancel();
        }
    }

    /// Relays handler events under the request id until the terminal one.
    fn spawn_stream_pump(&self, id: String, mut rx: mpsc::Receiver<StreamEvent>) {
        let outgoing = self.outgoing.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let terminal = event.is_terminal();
                outgoing.stream_event(&id, event).await;
                if terminal {
                    return;
                }
            }
            // The handler dropped its sender without a terminal event; the
            // host must still see the stream close.
            warn!("stream {id} ended without a terminal event");
            outgoing
                .stream_event(
                    &id,
                    StreamEvent::Error {
                        message: "stream ended unexpectedly".to_string(),
                        chat_id: None,
                    },
                )
                .await;
        });
    }

    /// The closed registry. Unknown names only reach this point when the
    /// guard is disabled for debugging, and still fail.
    async fn dispatch(&self, cmd: &str, payload: &JsonValue) -> HandlerResult {
        let ctx = &self.ctx;
        match cmd {
            // -- health & lifecycle ------------------------------------
            "health_check" => Ok(Outcome::Value(json!({"status": "healthy"}))),
            "shutdown" => Ok(Outcome::Value(json!({"status": "shutdown_acknowledged"}))),

            // -- system ------------------------------------------------
            "get_system_stats" | "get_monitoring" => handlers::system::stats(ctx),
            "set_startup" => handlers::system::set_startup(ctx, payload),
            "load_settings" => handlers::system::load_settings(ctx),
            "save_settings" => handlers::system::save_settings(ctx, payload),
            "web_search_available" => handlers::system::web_search_available(ctx),

            // -- ollama models -----------------------------------------
            "pull" => handlers::models::pull(ctx, payload).await,
            "get_models" => handlers::models::get_models(ctx).await,
            "delete_model" => handlers::models::delete_model(ctx, payload).await,

            // -- airllm sidecar ----------------------------------------
            "airllm_list_models" => Ok(Outcome::Value(ctx.airllm.list_models())),
            "airllm_status" => Ok(Outcome::Value(ctx.airllm.status())),
            "airllm_enable" => handlers::airllm::enable(ctx, payload).await,
            "airllm_reload" => handlers::airllm::reload(ctx, payload).await,
            "airllm_disable" => Ok(Outcome::Value(ctx.airllm.disable().await)),
            "airllm_set_active_model" => handlers::airllm::set_active_model(ctx, payload).await,

            // -- chat & history ----------------------------------------
            "chat" => handlers::chat::chat(ctx, payload).await,
            "cancel_chat" => handlers::chat::cancel_chat(ctx, payload),
            "list_conversations" => handlers::conversations::list(ctx),
            "get_conversation_messages" => handlers::conversations::messages(ctx, payload),
            "get_conversation_metadata" => handlers::conversations::metadata(ctx, payload),
            "delete_conversation" => handlers::conversations::delete(ctx, payload),
            "update_conversation_project" => {
                handlers::conversations::update_project(ctx, payload)
            }
            "chat_history_set_crypto_password" | "memory_set_crypto_password" => {
                handlers::conversations::set_crypto_password(ctx, payload)
            }

            // -- memory ------------------------------------------------
            "memory_save" => handlers::memory::save(ctx, payload),
            "memory_get" => handlers::memory::get(ctx, payload),
            "memory_list" => handlers::memory::list(ctx, payload),
            "memory_delete" => handlers::memory::delete(ctx, payload),
            "memory_clear_session" => handlers::memory::clear_session(ctx),

            // -- projects ----------------------------------------------
            "projects_list" => handlers::projects::list(ctx),
            "projects_get" => handlers::projects::get(ctx, payload),
            "projects_create" => handlers::projects::create(ctx, payload),
            "projects_update" => handlers::projects::update(ctx, payload),
            "projects_delete" => handlers::projects::delete(ctx, payload),
            "projects_add_repo" => handlers::projects::add_repo(ctx, payload),
            "projects_remove_repo" => handlers::projects::remove_repo(ctx, payload),
            "projects_get_or_create_orphan" => handlers::projects::get_or_create_orphan(ctx),

            // -- repository analysis -----------------------------------
            "analyze_repository" => handlers::repo::analyze(ctx, payload),
            "get_repo_summary" => handlers::repo::summary(ctx, payload),
            "detect_tech_debt" => handlers::repo::tech_debt(ctx, payload),

            // -- permissions & rate administration ---------------------
            "grant_permission" => handlers::security::grant(ctx, payload),
            "revoke_permission" => handlers::security::revoke(ctx, payload),
            "has_permission" => handlers::security::has(ctx, payload),
            "rate_limiter_is_blocked" => handlers::security::is_blocked(ctx, payload),
            "rate_limiter_get_blocked" => handlers::security::get_blocked(ctx),
            "rate_limiter_set_limit" => handlers::security::set_limit(ctx, payload),
            "rate_limiter_get_limits" => handlers::security::get_limits(ctx),
            "rate_limiter_reset" => handlers::security::reset(ctx),
            "rate_limiter_get_stats" => handlers::security::stats(ctx),

            // -- remote access -----------------------------------------
            "tunnel_check_cloudflared" => handlers::tunnel::check(ctx).await,
            "tunnel_install_cloudflared" => handlers::tunnel::install(ctx),
            "tunnel_install_progress" => handlers::tunnel::install_progress(ctx),
            "tunnel_get_status" => handlers::tunnel::status(ctx).await,
            "tunnel_generate_token" => handlers::tunnel::generate_token(ctx, payload),
            "tunnel_start" => handlers::tunnel::start(ctx, payload).await,
            "tunnel_stop" => handlers::tunnel::stop(ctx).await,
            "tunnel_get_qr" => Ok(Outcome::Value(ctx.remote.qr_data())),
            "tunnel_get_qr_with_token" => handlers::tunnel::qr_with_token(ctx, payload),
            "tunnel_validate_token" => handlers::tunnel::validate_token_cmd(ctx, payload),
            "tunnel_validate_custom_token" => {
                handlers::tunnel::validate_custom_token(ctx, payload)
            }
            "tunnel_set_custom_token" => handlers::tunnel::set_custom_token(ctx, payload),
            "tunnel_add_allowed_ip" => handlers::tunnel::add_allowed_ip(ctx, payload),
            "tunnel_remove_allowed_ip" => handlers::tunnel::remove_allowed_ip(ctx, payload),
            "tunnel_set_named_tunnel" => handlers::tunnel::set_named_tunnel(ctx, payload),

            other => Err(HandlerError::new(format!("Unknown command: {other}"))),
        }
    }
}

/// Required string field accessor shared by the handlers.
pub fn require_str<'a>(payload: &'a JsonValue, field: &str) -> Result<&'a str, HandlerError> {
    payload
        .get(field)
        .and_then(JsonValue::as_str)
        .ok_or_else(|| HandlerError::new(format!("Missing '{field}' parameter")))
}
