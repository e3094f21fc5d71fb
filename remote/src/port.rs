use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tokio::sync::mpsc;

use nimbus_protocol::StreamEvent;

/// What the HTTP surface needs from the worker. The worker implements this
/// against its dispatcher so remote requests run through exactly the same
/// handlers as IPC ones.
#[async_trait]
pub trait WorkerPort: Send + Sync {
    async fn system_stats(&self) -> JsonValue;

    async fn models(&self) -> Result<JsonValue, String>;

    async fn conversations(&self) -> JsonValue;

    async fn conversation_messages(&self, chat_id: &str) -> JsonValue;

    /// Starts a chat and returns its event stream. The payload carries the
    /// same fields as the IPC `chat` command.
    async fn chat(&self, payload: JsonValue) -> Result<mpsc::Receiver<StreamEvent>, String>;
}
