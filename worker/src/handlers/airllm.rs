use std::sync::Arc;

use serde_json::Value as JsonValue;

use nimbus_core::validate_model_name;

use crate::WorkerContext;
use crate::processor::HandlerError;
use crate::processor::HandlerResult;
use crate::processor::Outcome;
use crate::processor::require_str;

fn optional_model(payload: &JsonValue) -> Result<Option<String>, HandlerError> {
    match payload.get("model").and_then(JsonValue::as_str) {
        Some(model) => {
            validate_model_name(model).map_err(HandlerError::new)?;
            Ok(Some(model.to_string()))
        }
        None => Ok(None),
    }
}

pub async fn enable(ctx: &Arc<WorkerContext>, payload: &JsonValue) -> HandlerResult {
    let model = optional_model(payload)?;
    Ok(Outcome::Value(Arc::clone(&ctx.airllm).enable(model).await))
}

pub async fn reload(ctx: &Arc<WorkerContext>, payload: &JsonValue) -> HandlerResult {
    let model = optional_model(payload)?;
    Ok(Outcome::Value(Arc::clone(&ctx.airllm).reload(model).await))
}

pub async fn set_active_model(ctx: &Arc<WorkerContext>, payload: &JsonValue) -> HandlerResult {
    let model = require_str(payload, "model")?;
    validate_model_name(model).map_err(HandlerError::new)?;
    Ok(Outcome::Value(
        Arc::clone(&ctx.airllm).set_active_model(model.to_string()).await,
    ))
}
