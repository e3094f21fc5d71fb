use std::sync::Arc;

use serde_json::Value as JsonValue;
use serde_json::json;

use crate::WorkerContext;
use crate::processor::HandlerError;
use crate::processor::HandlerResult;
use crate::processor::Outcome;
use crate::processor::require_str;

pub fn list(ctx: &Arc<WorkerContext>) -> HandlerResult {
    Ok(Outcome::Value(json!(ctx.history.list())))
}

pub fn messages(ctx: &Arc<WorkerContext>, payload: &JsonValue) -> HandlerResult {
    let chat_id = require_str(payload, "chat_id")?;
    Ok(Outcome::Value(json!(ctx.history.get_messages(chat_id))))
}

pub fn metadata(ctx: &Arc<WorkerContext>, payload: &JsonValue) -> HandlerResult {
    let chat_id = require_str(payload, "chat_id")?;
    match ctx.history.get_metadata(chat_id) {
        Some(meta) => Ok(Outcome::Value(json!(meta))),
        None => Err(HandlerError::new(format!("Conversation {chat_id} not found"))),
    }
}

pub fn delete(ctx: &Arc<WorkerContext>, payload: &JsonValue) -> HandlerResult {
    let chat_id = require_str(payload, "chat_id")?;
    let deleted = ctx.history.delete(chat_id)?;
    Ok(Outcome::Value(if deleted {
        json!({"status": "success", "message": format!("Conversation {chat_id} deleted")})
    } else {
        json!({"status": "error", "message": "Conversation not found"})
    }))
}

pub fn update_project(ctx: &Arc<WorkerContext>, payload: &JsonValue) -> HandlerResult {
    let chat_id = require_str(payload, "chat_id")?;
    let project_id = payload
        .get("project_id")
        .and_then(JsonValue::as_str)
        .map(str::to_string);
    let updated = ctx.history.update_project(chat_id, project_id)?;
    Ok(Outcome::Value(json!({"success": updated})))
}

/// Derives the master key from the user's password. History, memory,
/// projects and token storage all share the same crypto service, so either
/// password command unlocks all encrypted stores.
pub fn set_crypto_password(ctx: &Arc<WorkerContext>, payload: &JsonValue) -> HandlerResult {
    let password = require_str(payload, "password")?;
    match ctx.crypto.set_password(password) {
        Ok(()) => Ok(Outcome::Value(json!({"success": true}))),
        Err(e) => Ok(Outcome::Value(
            json!({"success": false, "error": e.to_string()}),
        )),
    }
}
