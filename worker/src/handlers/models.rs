use std::sync::Arc;

use futures::StreamExt;
use serde_json::Value as JsonValue;
use serde_json::json;
use tokio::sync::mpsc;

use nimbus_core::validate_model_name;
use nimbus_ollama::PullEvent;
use nimbus_ollama::list_models_cli;
use nimbus_protocol::ErrorCode;
use nimbus_protocol::StreamEvent;

use crate::WorkerContext;
use crate::processor::HandlerError;
use crate::processor::HandlerResult;
use crate::processor::Outcome;
use crate::processor::require_str;

const CHANNEL_CAPACITY: usize = 128;

/// Streaming model pull: progress events, then one done/error.
pub async fn pull(ctx: &Arc<WorkerContext>, payload: &JsonValue) -> HandlerResult {
    let model = require_str(payload, "model")?.to_string();
    validate_model_name(&model).map_err(HandlerError::new)?;
    ctx.monitor
        .add_log(&format!("INITIATING: Pulling model '{model}'..."));

    let mut stream = ctx
        .ollama
        .pull_model_stream(&model)
        .await
        .map_err(|e| HandlerError::new(e.to_string()))?;

    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    let monitor = Arc::clone(&ctx.monitor);
    tokio::spawn(async move {
        while let Some(event) = stream.next().await {
            let mapped = match &event {
                PullEvent::Status(message) => {
                    monitor.add_log(&format!("OLLAMA: {message}"));
                    StreamEvent::Progress {
                        model: Some(model.clone()),
                        message: message.clone(),
                        progress: None,
                    }
                }
                PullEvent::ChunkProgress { status, .. } => StreamEvent::Progress {
                    model: Some(model.clone()),
                    message: status.clone(),
                    progress: event.percent(),
                },
                PullEvent::Success => {
                    monitor.add_log(&format!("SUCCESS: Model {model} pulled successfully."));
                    StreamEvent::Done {
                        chat_id: None,
                        model: Some(model.clone()),
                    }
                }
                PullEvent::Error(message) => {
                    monitor.add_log(&format!("ERROR: pull failed: {message}"));
                    StreamEvent::Error {
                        message: message.clone(),
                        chat_id: None,
                    }
                }
            };
            let terminal = mapped.is_terminal();
            if tx.send(mapped).await.is_err() || terminal {
                return;
            }
        }
        // Connection dropped without a success line.
        let _ = tx
            .send(StreamEvent::Error {
                message: "pull stream ended unexpectedly".to_string(),
                chat_id: None,
            })
            .await;
    });
    Ok(Outcome::Stream(rx))
}

/// Model listing through the runtime CLI, parsed into
/// `{name, size_bytes, details}` entries.
pub async fn get_models(_ctx: &Arc<WorkerContext>) -> HandlerResult {
    match list_models_cli().await {
        Ok(entries) => Ok(Outcome::Value(json!(entries))),
        Err(e) => {
            let code = match e.kind() {
                std::io::ErrorKind::NotFound | std::io::ErrorKind::TimedOut => {
                    ErrorCode::OllamaCliError
                }
                _ => ErrorCode::ModelListError,
            };
            Err(HandlerError::with_code(code, e.to_string()))
        }
    }
}

pub async fn delete_model(ctx: &Arc<WorkerContext>, payload: &JsonValue) -> HandlerResult {
    let name = require_str(payload, "name")?;
    validate_model_name(name).map_err(HandlerError::new)?;
    match ctx.ollama.delete_model(name).await {
        Ok(()) => {
            ctx.monitor.add_log(&format!("SUCCESS: Model {name} deleted."));
            Ok(Outcome::Value(
                json!({"status": "success", "message": format!("Model {name} deleted")}),
            ))
        }
        Err(e) => {
            ctx.monitor
                .add_log(&format!("ERROR: Failed to delete {name}: {e}"));
            Ok(Outcome::Value(
                json!({"status": "error", "message": e.to_string()}),
            ))
        }
    }
}
