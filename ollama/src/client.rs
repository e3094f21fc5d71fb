use std::io;

use bytes::BytesMut;
use futures::StreamExt;
use futures::stream::BoxStream;
use serde::Serialize;
use serde_json::Value as JsonValue;

use crate::pull::PullEvent;
use crate::pull::pull_events_from_value;

/// One message of the chat request body.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ChatTurn {
    pub role: String,
    pub content: String,
}

/// Event of a streaming chat generation.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    Token(String),
    Done,
    Error(String),
}

/// Client for a local Ollama instance.
pub struct OllamaClient {
    client: reqwest::Client,
    host_root: String,
}

impl OllamaClient {
    /// Default client; `NIMBUS_OLLAMA_HOST` overrides the endpoint.
    pub fn new() -> Self {
        let host_root = std::env::var("NIMBUS_OLLAMA_HOST")
            .unwrap_or_else(|_| crate::DEFAULT_HOST_ROOT.to_string());
        Self::from_host_root(host_root)
    }

    /// Low-level constructor given a raw host root, e.g. "http://localhost:11434".
    pub fn from_host_root(host_root: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(5))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            host_root: host_root.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.host_root.trim_end_matches('/'))
    }

    /// Probe whether the server is reachable.
    pub async fn probe_server(&self) -> bool {
        let resp = self.client.get(self.url("/api/tags")).send().await;
        matches!(resp, Ok(r) if r.status().is_success())
    }

    /// Names known to the local instance (HTTP path; the CLI listing in
    /// [`crate::list_models_cli`] is the richer source).
    pub async fn fetch_models(&self) -> io::Result<Vec<String>> {
        let resp = self
            .client
            .get(self.url("/api/tags"))
            .send()
            .await
            .map_err(io::Error::other)?;
        if !resp.status().is_success() {
            return Ok(Vec::new());
        }
        let val = resp.json::<JsonValue>().await.map_err(io::Error::other)?;
        let names = val
            .get("models")
            .and_then(|m| m.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.get("name").and_then(|n| n.as_str()))
                    .map(|s| s.to_string())
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        Ok(names)
    }

    pub async fn delete_model(&self, model: &str) -> io::Result<()> {
        let resp = self
            .client
            .delete(self.url("/api/delete"))
            .json(&serde_json::json!({"model": model}))
            .send()
            .await
            .map_err(io::Error::other)?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(io::Error::other(format!(
                "failed to delete {model}: HTTP {}",
                resp.status()
            )))
        }
    }

    /// Streaming chat against the named model. Yields one `Token` per
    /// server chunk; the stream ends with `Done` or `Error`.
    pub async fn chat_stream(
        &self,
        model: &str,
        messages: Vec<ChatTurn>,
    ) -> io::Result<BoxStream<'static, ChatEvent>> {
        let resp = self
            .client
            .post(self.url("/api/chat"))
            .json(&serde_json::json!({"model": model, "messages": messages, "stream": true}))
            .send()
            .await
            .map_err(io::Error::other)?;
        if !resp.status().is_success() {
            return Err(io::Error::other(format!(
                "failed to start chat: HTTP {}",
                resp.status()
            )));
        }

        let mut stream = resp.bytes_stream();
        let mut buf = BytesMut::new();

        let s = async_stream::stream! {
            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(bytes) => {
                        buf.extend_from_slice(&bytes);
                        while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                            let line = buf.split_to(pos + 1);
                            let Ok(text) = std::str::from_utf8(&line) else { continue };
                            let text = text.trim();
                            if text.is_empty() { continue; }
                            let Ok(value) = serde_json::from_str::<JsonValue>(text) else { continue };
                            if let Some(err_msg) = value.get("error").and_then(|e| e.as_str()) {
                                yield ChatEvent::Error(err_msg.to_string());
                                return;
                            }
                            if let Some(token) = value
                                .get("message")
                                .and_then(|m| m.get("content"))
                                .and_then(|c| c.as_str())
                                && !token.is_empty()
                            {
                                yield ChatEvent::Token(token.to_string());
                            }
                            if value.get("done").and_then(|d| d.as_bool()) == Some(true) {
                                yield ChatEvent::Done;
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        yield ChatEvent::Error(format!("stream error: {e}"));
                        return;
                    }
                }
            }
            yield ChatEvent::Error("chat stream ended unexpectedly".to_string());
        };

        Ok(Box::pin(s))
    }

    /// Start a model pull and emit streaming events. The returned stream
    /// ends when a Success event is observed or the server closes the
    /// connection.
    pub async fn pull_model_stream(
        &self,
        model: &str,
    ) -> io::Result<BoxStream<'static, PullEvent>> {
        let resp = self
            .client
            .post(self.url("/api/pull"))
            .json(&serde_json::json!({"model": model, "stream": true}))
            .send()
            .await
            .map_err(io::Error::other)?;
        if !resp.status().is_success() {
            return Err(io::Error::other(format!(
                "failed to start pull: HTTP {}",
                resp.status()
            )));
        }

        let mut stream = resp.bytes_stream();
        let mut buf = BytesMut::new();

        let s = async_stream::stream! {
            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(bytes) => {
                        buf.extend_from_slice(&bytes);
                        while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                            let line = buf.split_to(pos + 1);
                            if let Ok(text) = std::str::from_utf8(&line) {
                                let text = text.trim();
                                if text.is_empty() { continue; }
                                if let Ok(value) = serde_json::from_str::<JsonValue>(text) {
                                    for ev in pull_events_from_value(&value) { yield ev; }
                                    // A 200 response can still carry an error
                                    // line; the stream, not the status code,
                                    // is authoritative.
                                    if let Some(err_msg) = value.get("error").and_then(|e| e.as_str()) {
                                        yield PullEvent::Error(err_msg.to_string());
                                        return;
                                    }
                                    if value.get("status").and_then(|s| s.as_str()) == Some("success") {
                                        yield PullEvent::Success;
                                        return;
                                    }
                                }
                            }
                        }
                    }
                    Err(_) => {
                        return;
                    }
                }
            }
        };

        Ok(Box::pin(s))
    }
}

impl Default for OllamaClient {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used, clippy::unwrap_used)]
    use super::*;
    use futures::StreamExt;
    use wiremock::Mock;
    use wiremock::MockServer;
    use wiremock::ResponseTemplate;
    use wiremock::matchers::method;
    use wiremock::matchers::path;

    #[tokio::test]
    async fn fetch_models_happy_path() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/tags"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                serde_json::json!({
                    "models": [ {"name": "llama3.2:3b"}, {"name": "mistral"} ]
                })
                .to_string(),
                "application/json",
            ))
            .mount(&server)
            .await;

        let client = OllamaClient::from_host_root(server.uri());
        assert!(client.probe_server().await);
        let models = client.fetch_models().await.expect("fetch models");
        assert!(models.contains(&"llama3.2:3b".to_string()));
        assert!(models.contains(&"mistral".to_string()));
    }

    #[tokio::test]
    async fn chat_stream_yields_tokens_then_done() {
        let server = MockServer::start().await;
        let body = concat!(
            "{\"message\":{\"role\":\"assistant\",\"content\":\"Hel\"},\"done\":false}\n",
            "{\"message\":{\"role\":\"assistant\",\"content\":\"lo\"},\"done\":false}\n",
            "{\"message\":{\"role\":\"assistant\",\"content\":\"\"},\"done\":true}\n",
        );
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "application/x-ndjson"))
            .mount(&server)
            .await;

        let client = OllamaClient::from_host_root(server.uri());
        let stream = client
            .chat_stream(
                "m",
                vec![ChatTurn {
                    role: "user".to_string(),
                    content: "hi".to_string(),
                }],
            )
            .await
            .expect("start chat");
        let events: Vec<ChatEvent> = stream.collect().await;
        assert_eq!(
            events,
            vec![
                ChatEvent::Token("Hel".to_string()),
                ChatEvent::Token("lo".to_string()),
                ChatEvent::Done,
            ]
        );
    }

    #[tokio::test]
    async fn chat_stream_surfaces_server_error_lines() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                "{\"error\":\"model not found\"}\n",
                "application/x-ndjson",
            ))
            .mount(&server)
            .await;

        let client = OllamaClient::from_host_root(server.uri());
        let stream = client.chat_stream("missing", Vec::new()).await.expect("start");
        let events: Vec<ChatEvent> = stream.collect().await;
        assert_eq!(events, vec![ChatEvent::Error("model not found".to_string())]);
    }

    #[tokio::test]
    async fn pull_stream_reports_progress_and_success() {
        let server = MockServer::start().await;
        let body = concat!(
            "{\"status\":\"pulling manifest\"}\n",
            "{\"status\":\"downloading\",\"total\":100,\"completed\":40}\n",
            "{\"status\":\"success\"}\n",
        );
        Mock::given(method("POST"))
            .and(path("/api/pull"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "application/x-ndjson"))
            .mount(&server)
            .await;

        let client = OllamaClient::from_host_root(server.uri());
        let stream = client.pull_model_stream("m").await.expect("start pull");
        let events: Vec<PullEvent> = stream.collect().await;
        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], PullEvent::Status(_)));
        assert_eq!(events[1].percent(), Some(40));
        assert_eq!(events[2], PullEvent::Success);
    }

    #[tokio::test]
    async fn pull_error_line_wins_over_http_200() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/pull"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                "{\"error\":\"pull model manifest: file does not exist\"}\n",
                "application/x-ndjson",
            ))
            .mount(&server)
            .await;

        let client = OllamaClient::from_host_root(server.uri());
        let stream = client.pull_model_stream("nope").await.expect("start pull");
        let events: Vec<PullEvent> = stream.collect().await;
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], PullEvent::Error(_)));
    }

    #[tokio::test]
    async fn delete_model_maps_status() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/api/delete"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        let client = OllamaClient::from_host_root(server.uri());
        assert!(client.delete_model("m").await.is_ok());
    }
}
