use std::sync::Arc;
use std::sync::Weak;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use serde_json::json;
use tokio::sync::mpsc;

use nimbus_ollama::list_models_cli;
use nimbus_protocol::StreamEvent;
use nimbus_remote::WorkerPort;

use crate::WorkerContext;
use crate::handlers;
use crate::processor::Outcome;

/// Adapter the HTTP surface calls into. Holds the context weakly so a
/// running server never keeps the worker alive past shutdown.
pub struct RemotePort {
    ctx: Weak<WorkerContext>,
}

impl RemotePort {
    pub fn new(ctx: &Arc<WorkerContext>) -> Self {
        Self {
            ctx: Arc::downgrade(ctx),
        }
    }

    fn ctx(&self) -> Option<Arc<WorkerContext>> {
        self.ctx.upgrade()
    }
}

#[async_trait]
impl WorkerPort for RemotePort {
    async fn system_stats(&self) -> JsonValue {
        match self.ctx() {
            Some(ctx) => ctx.monitor.snapshot(),
            None => json!({}),
        }
    }

    async fn models(&self) -> Result<JsonValue, String> {
        match list_models_cli().await {
            Ok(entries) => Ok(json!(entries)),
            Err(e) => Err(e.to_string()),
        }
    }

    async fn conversations(&self) -> JsonValue {
        match self.ctx() {
            Some(ctx) => json!(ctx.history.list()),
            None => json!([]),
        }
    }

    async fn conversation_messages(&self, chat_id: &str) -> JsonValue {
        match self.ctx() {
            Some(ctx) => json!(ctx.history.get_messages(chat_id)),
            None => json!([]),
        }
    }

    async fn chat(&self, payload: JsonValue) -> Result<mpsc::Receiver<StreamEvent>, String> {
        let Some(ctx) = self.ctx() else {
            return Err("worker is shutting down".to_string());
        };
        match handlers::chat::chat(&ctx, &payload).await {
            Ok(Outcome::Stream(rx)) => Ok(rx),
            Ok(Outcome::Value(_)) => Err("chat did not return a stream".to_string()),
            Err(e) => Err(e.message),
        }
    }
}
