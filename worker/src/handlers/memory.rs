use std::sync::Arc;

use serde_json::Value as JsonValue;
use serde_json::json;

use nimbus_core::MemoryScope;

use crate::WorkerContext;
use crate::processor::HandlerError;
use crate::processor::HandlerResult;
use crate::processor::Outcome;
use crate::processor::require_str;

fn parse_scope(payload: &JsonValue) -> Result<MemoryScope, HandlerError> {
    require_str(payload, "memory_type")?
        .parse::<MemoryScope>()
        .map_err(HandlerError::new)
}

fn project_id(payload: &JsonValue) -> Option<&str> {
    payload.get("project_id").and_then(JsonValue::as_str)
}

pub fn save(ctx: &Arc<WorkerContext>, payload: &JsonValue) -> HandlerResult {
    let scope = parse_scope(payload)?;
    let key = require_str(payload, "key")?;
    let value = payload
        .get("value")
        .cloned()
        .ok_or_else(|| HandlerError::new("Missing 'value' parameter"))?;
    ctx.memory.save(
        scope,
        key,
        value,
        project_id(payload),
        payload.get("metadata").cloned(),
    )?;
    Ok(Outcome::Value(json!({"success": true})))
}

pub fn get(ctx: &Arc<WorkerContext>, payload: &JsonValue) -> HandlerResult {
    let scope = parse_scope(payload)?;
    let key = require_str(payload, "key")?;
    let value = ctx.memory.get(scope, key, project_id(payload))?;
    Ok(Outcome::Value(json!({"key": key, "value": value})))
}

pub fn list(ctx: &Arc<WorkerContext>, payload: &JsonValue) -> HandlerResult {
    let scope = parse_scope(payload)?;
    let entries = ctx.memory.list(scope, project_id(payload))?;
    Ok(Outcome::Value(json!(entries)))
}

pub fn delete(ctx: &Arc<WorkerContext>, payload: &JsonValue) -> HandlerResult {
    let scope = parse_scope(payload)?;
    let key = require_str(payload, "key")?;
    let deleted = ctx.memory.delete(scope, key, project_id(payload))?;
    Ok(Outcome::Value(json!({"success": deleted})))
}

pub fn clear_session(ctx: &Arc<WorkerContext>) -> HandlerResult {
    let cleared = ctx.memory.clear_session();
    Ok(Outcome::Value(json!({"success": true, "cleared": cleared})))
}
