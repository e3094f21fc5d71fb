use std::sync::Arc;

use serde_json::Value as JsonValue;
use serde_json::json;

use nimbus_core::ActionType;
use nimbus_core::Settings;
use nimbus_core::feature_gate;
use nimbus_core::manage_startup;

use crate::WorkerContext;
use crate::processor::HandlerError;
use crate::processor::HandlerResult;
use crate::processor::Outcome;

pub fn stats(ctx: &Arc<WorkerContext>) -> HandlerResult {
    Ok(Outcome::Value(ctx.monitor.snapshot()))
}

pub fn set_startup(ctx: &Arc<WorkerContext>, payload: &JsonValue) -> HandlerResult {
    let enable = payload
        .get("enable")
        .and_then(JsonValue::as_bool)
        .unwrap_or(false);
    let result = manage_startup(enable)?;
    ctx.audit.log(
        ActionType::CommandExecute,
        json!({"action": "set_startup", "enable": enable}),
    );
    Ok(Outcome::Value(result))
}

pub fn load_settings(ctx: &Arc<WorkerContext>) -> HandlerResult {
    let settings = ctx.settings.load();
    Ok(Outcome::Value(serde_json::to_value(settings).map_err(
        |e| HandlerError::new(format!("settings unreadable: {e}")),
    )?))
}

pub fn save_settings(ctx: &Arc<WorkerContext>, payload: &JsonValue) -> HandlerResult {
    let settings: Settings = serde_json::from_value(payload.clone())
        .map_err(|e| HandlerError::new(format!("invalid settings: {e}")))?;
    ctx.settings.save(&settings)?;
    // Keep the autostart entry in sync when the toggle is part of the save.
    if payload.get("runAtStartup").is_some() {
        let _ = manage_startup(settings.run_at_startup);
    }
    Ok(Outcome::Value(
        json!({"status": "success", "message": "Settings saved successfully"}),
    ))
}

pub fn web_search_available(ctx: &Arc<WorkerContext>) -> HandlerResult {
    let settings = ctx.settings.load();
    let licensed = feature_gate("web_search", &ctx.license.snapshot()).is_ok();
    Ok(Outcome::Value(json!({
        "available": settings.internet_access && licensed,
        "internet_access": settings.internet_access,
        "licensed": licensed,
    })))
}
