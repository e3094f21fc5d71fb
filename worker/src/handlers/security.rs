use std::sync::Arc;

use serde_json::Value as JsonValue;
use serde_json::json;

use nimbus_core::ActionType;
use nimbus_protocol::Permission;

use crate::WorkerContext;
use crate::processor::HandlerError;
use crate::processor::HandlerResult;
use crate::processor::IPC_CLIENT_ID;
use crate::processor::Outcome;
use crate::processor::require_str;

fn parse_permission(payload: &JsonValue) -> Result<Permission, HandlerError> {
    require_str(payload, "permission")?
        .parse::<Permission>()
        .map_err(HandlerError::new)
}

pub fn grant(ctx: &Arc<WorkerContext>, payload: &JsonValue) -> HandlerResult {
    let permission = parse_permission(payload)?;
    ctx.guard.grant(permission);
    ctx.audit.log(
        ActionType::PermissionGranted,
        json!({"permission": permission.to_string()}),
    );
    Ok(Outcome::Value(
        json!({"success": true, "granted": permission.to_string()}),
    ))
}

pub fn revoke(ctx: &Arc<WorkerContext>, payload: &JsonValue) -> HandlerResult {
    let permission = parse_permission(payload)?;
    let revoked = ctx.guard.revoke(permission);
    ctx.audit.log(
        ActionType::PermissionDenied,
        json!({"action": "revoked", "permission": permission.to_string()}),
    );
    Ok(Outcome::Value(
        json!({"success": revoked, "revoked": permission.to_string()}),
    ))
}

pub fn has(ctx: &Arc<WorkerContext>, payload: &JsonValue) -> HandlerResult {
    let permission = parse_permission(payload)?;
    Ok(Outcome::Value(
        json!({"permission": permission.to_string(), "granted": ctx.guard.has(permission)}),
    ))
}

pub fn is_blocked(ctx: &Arc<WorkerContext>, payload: &JsonValue) -> HandlerResult {
    let client_id = payload
        .get("client_id")
        .and_then(JsonValue::as_str)
        .unwrap_or(IPC_CLIENT_ID);
    Ok(Outcome::Value(
        json!({"client_id": client_id, "blocked": ctx.rate.is_blocked(client_id)}),
    ))
}

pub fn get_blocked(ctx: &Arc<WorkerContext>) -> HandlerResult {
    Ok(Outcome::Value(json!(ctx.rate.blocked())))
}

pub fn set_limit(ctx: &Arc<WorkerContext>, payload: &JsonValue) -> HandlerResult {
    let command = require_str(payload, "command")?;
    let limit = payload
        .get("limit")
        .and_then(JsonValue::as_u64)
        .ok_or_else(|| HandlerError::new("Missing 'limit' parameter"))? as u32;
    ctx.rate.set_limit(command, limit);
    Ok(Outcome::Value(
        json!({"success": true, "command": command, "limit": limit}),
    ))
}

pub fn get_limits(ctx: &Arc<WorkerContext>) -> HandlerResult {
    Ok(Outcome::Value(json!(ctx.rate.limits())))
}

pub fn reset(ctx: &Arc<WorkerContext>) -> HandlerResult {
    ctx.rate.reset();
    Ok(Outcome::Value(json!({"success": true})))
}

pub fn stats(ctx: &Arc<WorkerContext>) -> HandlerResult {
    Ok(Outcome::Value(ctx.rate.stats()))
}
