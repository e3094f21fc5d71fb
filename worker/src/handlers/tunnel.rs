use std::sync::Arc;

use serde_json::Value as JsonValue;
use serde_json::json;

use nimbus_core::feature_gate;
use nimbus_core::validate_ip_address;
use nimbus_core::validate_token;

use crate::WorkerContext;
use crate::processor::HandlerResult;
use crate::processor::Outcome;
use crate::processor::require_str;
use crate::remote_port::RemotePort;

pub async fn check(ctx: &Arc<WorkerContext>) -> HandlerResult {
    Ok(Outcome::Value(ctx.remote.tunnel.check_installed().await))
}

/// Installation runs in the background; progress is polled via
/// `tunnel_install_progress`.
pub fn install(ctx: &Arc<WorkerContext>) -> HandlerResult {
    let remote = Arc::clone(&ctx.remote);
    let monitor = Arc::clone(&ctx.monitor);
    tokio::spawn(async move {
        let result = remote.tunnel.install().await;
        let summary = result["message"]
            .as_str()
            .or_else(|| result["error"].as_str())
            .unwrap_or("finished")
            .to_string();
        monitor.add_log(&format!("TUNNEL: install {summary}"));
    });
    Ok(Outcome::Value(
        json!({"success": true, "message": "Installation started"}),
    ))
}

pub fn install_progress(ctx: &Arc<WorkerContext>) -> HandlerResult {
    Ok(Outcome::Value(ctx.remote.tunnel.install_progress()))
}

pub async fn status(ctx: &Arc<WorkerContext>) -> HandlerResult {
    Ok(Outcome::Value(ctx.remote.status().await))
}

pub fn generate_token(ctx: &Arc<WorkerContext>, payload: &JsonValue) -> HandlerResult {
    let expires_hours = payload
        .get("expires_hours")
        .and_then(JsonValue::as_u64)
        .unwrap_or(24);
    Ok(Outcome::Value(ctx.remote.generate_auth_token(expires_hours)))
}

/// Starts the HTTP surface and tunnel pair, behind the license gate.
pub async fn start(ctx: &Arc<WorkerContext>, payload: &JsonValue) -> HandlerResult {
    if feature_gate("remote_access", &ctx.license.snapshot()).is_err() {
        return Ok(Outcome::Value(json!({
            "error": true,
            "code": "LICENSE_REQUIRED",
            "message": "Remote access requires an active plan",
        })));
    }
    let port = payload
        .get("port")
        .and_then(JsonValue::as_u64)
        .map(|p| p as u16);
    let worker = Arc::new(RemotePort::new(ctx));
    Ok(Outcome::Value(
        Arc::clone(&ctx.remote).start(port, worker).await,
    ))
}

pub async fn stop(ctx: &Arc<WorkerContext>) -> HandlerResult {
    Ok(Outcome::Value(ctx.remote.stop().await))
}

pub fn qr_with_token(ctx: &Arc<WorkerContext>, payload: &JsonValue) -> HandlerResult {
    let token = require_str(payload, "token")?;
    Ok(Outcome::Value(ctx.remote.qr_data_with_token(token)))
}

pub fn validate_token_cmd(ctx: &Arc<WorkerContext>, payload: &JsonValue) -> HandlerResult {
    let token = require_str(payload, "token")?;
    // Shape check first; a malformed token never reaches the comparison.
    if let Err(reason) = validate_token(token) {
        return Ok(Outcome::Value(json!({"valid": false, "reason": reason})));
    }
    Ok(Outcome::Value(ctx.remote.validate_token(token)))
}

pub fn validate_custom_token(ctx: &Arc<WorkerContext>, payload: &JsonValue) -> HandlerResult {
    let token = require_str(payload, "token")?;
    Ok(Outcome::Value(ctx.remote.validate_custom_token(token)))
}

pub fn set_custom_token(ctx: &Arc<WorkerContext>, payload: &JsonValue) -> HandlerResult {
    let token = require_str(payload, "token")?;
    Ok(Outcome::Value(ctx.remote.set_custom_token(token)))
}

pub fn add_allowed_ip(ctx: &Arc<WorkerContext>, payload: &JsonValue) -> HandlerResult {
    let ip = require_str(payload, "ip")?;
    if let Err(reason) = validate_ip_address(ip) {
        return Ok(Outcome::Value(json!({"success": false, "error": reason})));
    }
    Ok(Outcome::Value(ctx.remote.add_allowed_ip(ip)))
}

pub fn remove_allowed_ip(ctx: &Arc<WorkerContext>, payload: &JsonValue) -> HandlerResult {
    let ip = require_str(payload, "ip")?;
    Ok(Outcome::Value(ctx.remote.remove_allowed_ip(ip)))
}

pub fn set_named_tunnel(ctx: &Arc<WorkerContext>, payload: &JsonValue) -> HandlerResult {
    let token = payload
        .get("token")
        .and_then(JsonValue::as_str)
        .map(str::to_string);
    Ok(Outcome::Value(ctx.remote.set_named_tunnel(token)))
}
