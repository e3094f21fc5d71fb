use std::collections::HashSet;
use std::sync::Arc;

use futures::StreamExt;
use serde_json::Value as JsonValue;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use nimbus_core::MemoryScope;
use nimbus_core::PromptInputs;
use nimbus_core::SaveMessage;
use nimbus_core::feature_gate;
use nimbus_core::validate_model_name;
use nimbus_ollama::ChatEvent;
use nimbus_ollama::ChatTurn;
use nimbus_protocol::Role;
use nimbus_protocol::StreamEvent;

use crate::WorkerContext;
use crate::processor::HandlerError;
use crate::processor::HandlerResult;
use crate::processor::Outcome;
use crate::processor::require_str;

const CHANNEL_CAPACITY: usize = 128;
/// Sidecar responses are re-chunked into pieces of roughly this many chars.
const SIDECAR_CHUNK_CHARS: usize = 80;

struct ChatParams {
    model: String,
    provider: String,
    prompt: String,
    chat_id: Option<String>,
    project_id: Option<String>,
    language: String,
    max_tokens: u32,
    temperature: f64,
    context_files: Vec<(String, String)>,
    memory_keys: Vec<String>,
    repo_context: Option<JsonValue>,
    web_query: Option<String>,
    web_max_results: Option<usize>,
}

fn parse_params(payload: &JsonValue) -> Result<ChatParams, HandlerError> {
    let model = require_str(payload, "model")?.to_string();
    validate_model_name(&model).map_err(HandlerError::new)?;
    let prompt = require_str(payload, "prompt")?.to_string();
    let provider = payload
        .get("provider")
        .and_then(JsonValue::as_str)
        .unwrap_or("ollama")
        .to_string();
    if !matches!(provider.as_str(), "ollama" | "airllm") {
        return Err(HandlerError::new(format!("Unknown provider: {provider}")));
    }
    let context_files = payload
        .get("context_files")
        .and_then(JsonValue::as_array)
        .map(|files| {
            files
                .iter()
                .filter_map(|f| {
                    let path = f.get("path")?.as_str()?.to_string();
                    let content = f.get("content")?.as_str()?.to_string();
                    Some((path, content))
                })
                .collect()
        })
        .unwrap_or_default();
    let memory_keys = payload
        .get("memory_keys")
        .and_then(JsonValue::as_array)
        .map(|keys| {
            keys.iter()
                .filter_map(|k| k.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();

    Ok(ChatParams {
        model,
        provider,
        prompt,
        chat_id: payload
            .get("chat_id")
            .and_then(JsonValue::as_str)
            .map(str::to_string),
        project_id: payload
            .get("project_id")
            .and_then(JsonValue::as_str)
            .map(str::to_string),
        language: payload
            .get("language")
            .and_then(JsonValue::as_str)
            .unwrap_or("en")
            .to_string(),
        max_tokens: payload
            .get("max_tokens")
            .and_then(JsonValue::as_u64)
            .unwrap_or(256) as u32,
        temperature: payload
            .get("temperature")
            .and_then(JsonValue::as_f64)
            .unwrap_or(0.7),
        context_files,
        memory_keys,
        repo_context: payload.get("repo_context").cloned(),
        web_query: payload
            .get("web_query")
            .and_then(JsonValue::as_str)
            .map(str::to_string),
        web_max_results: payload
            .get("web_max_results")
            .and_then(JsonValue::as_u64)
            .map(|n| n as usize),
    })
}

/// The chat command: persists the user turn, builds the structured prompt,
/// streams tokens from the selected provider and persists the assistant
/// turn on success. Returns the event stream the pump relays.
pub async fn chat(ctx: &Arc<WorkerContext>, payload: &JsonValue) -> HandlerResult {
    let params = parse_params(payload)?;

    // The user message is persisted before anything can fail downstream,
    // creating the conversation when needed.
    let chat_id = ctx.history.save_message(SaveMessage {
        chat_id: params.chat_id.clone(),
        role: Role::User,
        content: params.prompt.clone(),
        model: Some(params.model.clone()),
        project_id: params.project_id.clone(),
        encrypt: false,
    })?;

    let cancel = ctx.register_active_chat(&chat_id);
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    let ctx = Arc::clone(ctx);
    tokio::spawn(async move {
        run_chat(&ctx, &params, &chat_id, &tx, &cancel).await;
        ctx.clear_active_chat(&chat_id);
    });
    Ok(Outcome::Stream(rx))
}

/// Raises the cancel flag of the active chat named in the payload.
pub fn cancel_chat(ctx: &Arc<WorkerContext>, payload: &JsonValue) -> HandlerResult {
    let chat_id = require_str(payload, "chat_id")?;
    let cancelled = ctx.cancel_chat(chat_id);
    Ok(Outcome::Value(
        json!({"success": cancelled, "chat_id": chat_id}),
    ))
}

async fn run_chat(
    ctx: &Arc<WorkerContext>,
    params: &ChatParams,
    chat_id: &str,
    tx: &mpsc::Sender<StreamEvent>,
    cancel: &CancellationToken,
) {
    let error_event = |message: String| StreamEvent::Error {
        message,
        chat_id: Some(chat_id.to_string()),
    };

    // Prior turns give the model its context; the just-saved user message
    // is excluded because the prompt builder appends the current turn.
    let mut history = ctx.history.get_messages(chat_id);
    history.pop();

    let memory_entries = resolve_memory(ctx, &params.memory_keys, params.project_id.as_deref());

    let web_context = match &params.web_query {
        Some(query) => {
            let settings = ctx.settings.load();
            let gate = feature_gate("web_search", &ctx.license.snapshot());
            if !settings.internet_access {
                let _ = tx
                    .send(error_event(
                        "Web search unavailable: internet access is disabled in settings"
                            .to_string(),
                    ))
                    .await;
                return;
            }
            if gate.is_err() {
                let _ = tx
                    .send(error_event(
                        "Web search unavailable: LICENSE_REQUIRED".to_string(),
                    ))
                    .await;
                return;
            }
            match ctx.search.search_web(query, params.web_max_results).await {
                Ok(text) => Some(text),
                Err(e) => {
                    let _ = tx.send(error_event(format!("Web search failed: {e}"))).await;
                    return;
                }
            }
        }
        None => None,
    };

    let prompt = ctx.prompts.build(&PromptInputs {
        user_message: params.prompt.clone(),
        chat_history: history,
        context_files: params.context_files.clone(),
        memory_entries,
        repo_context: params.repo_context.clone(),
        web_context,
        system_rules: None,
        language: params.language.clone(),
    });
    let _ = tx
        .send(StreamEvent::PromptPreview {
            text: prompt.to_display_string(),
            prompt_id: prompt.prompt_id.clone(),
            structured: prompt.structured(),
            chat_id: chat_id.to_string(),
        })
        .await;

    let full_response = match params.provider.as_str() {
        "airllm" => stream_from_sidecar(ctx, params, &prompt, chat_id, tx, cancel).await,
        _ => stream_from_ollama(ctx, params, &prompt, chat_id, tx, cancel).await,
    };

    match full_response {
        StreamOutcome::Completed(full_response) => {
            let saved = ctx.history.save_message(SaveMessage {
                chat_id: Some(chat_id.to_string()),
                role: Role::Assistant,
                content: full_response,
                model: Some(params.model.clone()),
                project_id: params.project_id.clone(),
                encrypt: false,
            });
            if let Err(e) = saved {
                warn!("chat: could not persist assistant message: {e}");
            }
            let _ = tx
                .send(StreamEvent::Done {
                    chat_id: Some(chat_id.to_string()),
                    model: Some(params.model.clone()),
                })
                .await;
        }
        StreamOutcome::Cancelled => {
            // The partial response is deliberately not persisted.
            let _ = tx
                .send(StreamEvent::Cancelled {
                    chat_id: chat_id.to_string(),
                })
                .await;
        }
        StreamOutcome::Failed(message) => {
            ctx.monitor.add_log(&format!("CHAT ERROR: {message}"));
            let _ = tx.send(error_event(message)).await;
        }
    }
}

enum StreamOutcome {
    Completed(String),
    Cancelled,
    Failed(String),
}

async fn stream_from_ollama(
    ctx: &Arc<WorkerContext>,
    params: &ChatParams,
    prompt: &nimbus_core::Prompt,
    chat_id: &str,
    tx: &mpsc::Sender<StreamEvent>,
    cancel: &CancellationToken,
) -> StreamOutcome {
    let turns: Vec<ChatTurn> = prompt
        .to_messages()
        .into_iter()
        .map(|m| ChatTurn {
            role: m.role,
            content: m.content,
        })
        .collect();

    let mut stream = match ctx.ollama.chat_stream(&params.model, turns).await {
        Ok(stream) => stream,
        Err(e) => return StreamOutcome::Failed(e.to_string()),
    };

    let mut full_response = String::new();
    while let Some(event) = stream.next().await {
        // The flag is consulted at every token boundary.
        if cancel.is_cancelled() {
            return StreamOutcome::Cancelled;
        }
        match event {
            ChatEvent::Token(token) => {
                full_response.push_str(&token);
                let _ = tx
                    .send(StreamEvent::Token {
                        data: token,
                        chat_id: Some(chat_id.to_string()),
                    })
                    .await;
            }
            ChatEvent::Done => return StreamOutcome::Completed(full_response),
            ChatEvent::Error(message) => return StreamOutcome::Failed(message),
        }
    }
    StreamOutcome::Failed("model stream ended unexpectedly".to_string())
}

async fn stream_from_sidecar(
    ctx: &Arc<WorkerContext>,
    params: &ChatParams,
    prompt: &nimbus_core::Prompt,
    chat_id: &str,
    tx: &mpsc::Sender<StreamEvent>,
    cancel: &CancellationToken,
) -> StreamOutcome {
    // The sidecar takes a flat prompt; render the message array as plain
    // role-tagged text ending on the assistant turn.
    let mut flat = String::new();
    for message in prompt.to_messages() {
        flat.push_str(&format!("{}: {}\n", message.role, message.content));
    }
    flat.push_str("assistant:");

    let response = ctx
        .airllm
        .generate(&flat, params.max_tokens, params.temperature)
        .await;
    if !response.ok {
        return StreamOutcome::Failed(
            response
                .error
                .unwrap_or_else(|| "sidecar generation failed".to_string()),
        );
    }
    let text = response.text.unwrap_or_default();

    let chunks: Vec<String> = text
        .chars()
        .collect::<Vec<char>>()
        .chunks(SIDECAR_CHUNK_CHARS)
        .map(|chunk| chunk.iter().collect())
        .collect();
    for chunk in chunks {
        if cancel.is_cancelled() {
            return StreamOutcome::Cancelled;
        }
        let _ = tx
            .send(StreamEvent::Token {
                data: chunk,
                chat_id: Some(chat_id.to_string()),
            })
            .await;
    }
    StreamOutcome::Completed(text)
}

/// Union of the explicit user-scope keys and the project's declared memory
/// keys, de-duplicated; project scope wins for keys the project declares.
fn resolve_memory(
    ctx: &Arc<WorkerContext>,
    memory_keys: &[String],
    project_id: Option<&str>,
) -> Vec<(String, String)> {
    let project = project_id.and_then(|id| ctx.projects.get(id).ok().flatten());
    let project_keys: HashSet<&str> = project
        .as_ref()
        .map(|p| p.memory_keys.iter().map(String::as_str).collect())
        .unwrap_or_default();

    let mut seen = HashSet::new();
    let mut ordered: Vec<&str> = Vec::new();
    for key in memory_keys {
        if seen.insert(key.as_str()) {
            ordered.push(key);
        }
    }
    if let Some(project) = &project {
        for key in &project.memory_keys {
            if seen.insert(key.as_str()) {
                ordered.push(key);
            }
        }
    }

    let mut entries = Vec::new();
    for key in ordered {
        let value = if project_keys.contains(key) {
            ctx.memory
                .get(MemoryScope::Project, key, project_id)
                .ok()
                .flatten()
                .or_else(|| ctx.memory.get(MemoryScope::User, key, None).ok().flatten())
        } else {
            ctx.memory.get(MemoryScope::User, key, None).ok().flatten()
        };
        if let Some(value) = value {
            let rendered = match value {
                JsonValue::String(s) => s,
                other => other.to_string(),
            };
            entries.push((key.to_string(), rendered));
        }
    }
    entries
}
