#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use serde_json::json;
use tokio::sync::mpsc;

use nimbus_core::AuditLog;
use nimbus_core::CryptoService;
use nimbus_core::NimbusHome;
use nimbus_protocol::StreamEvent;
use nimbus_remote::RemoteAccessService;
use nimbus_remote::WorkerPort;
use nimbus_remote::start_http_server;

struct FakeWorker;

#[async_trait]
impl WorkerPort for FakeWorker {
    async fn system_stats(&self) -> JsonValue {
        json!({"cpu": {"usage_percent": 1.0}})
    }

    async fn models(&self) -> Result<JsonValue, String> {
        Ok(json!([{"name": "llama3.2:3b", "size_bytes": 2_000_000_000u64}]))
    }

    async fn conversations(&self) -> JsonValue {
        json!([])
    }

    async fn conversation_messages(&self, chat_id: &str) -> JsonValue {
        json!([{"role": "user", "content": format!("for {chat_id}")}])
    }

    async fn chat(&self, _payload: JsonValue) -> Result<mpsc::Receiver<StreamEvent>, String> {
        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(async move {
            let chat_id = Some("c-1".to_string());
            let _ = tx
                .send(StreamEvent::Token {
                    data: "Hel".to_string(),
                    chat_id: chat_id.clone(),
                })
                .await;
            let _ = tx
                .send(StreamEvent::Token {
                    data: "lo".to_string(),
                    chat_id: chat_id.clone(),
                })
                .await;
            let _ = tx
                .send(StreamEvent::Done {
                    chat_id,
                    model: None,
                })
                .await;
        });
        Ok(rx)
    }
}

struct Server {
    _tmp: tempfile::TempDir,
    service: Arc<RemoteAccessService>,
    base: String,
    handle: Option<nimbus_remote::HttpServerHandle>,
}

async fn spawn_server() -> Server {
    let tmp = tempfile::tempdir().unwrap();
    let home = NimbusHome::with_root(tmp.path());
    let crypto = Arc::new(CryptoService::new(&home).unwrap());
    let audit = Arc::new(AuditLog::new(&home).unwrap());
    let service = Arc::new(RemoteAccessService::new(&home, crypto, audit).unwrap());
    let handle = start_http_server(0, Arc::clone(&service), Arc::new(FakeWorker))
        .await
        .unwrap();
    let base = format!("http://127.0.0.1:{}", handle.port);
    Server {
        _tmp: tmp,
        service,
        base,
        handle: Some(handle),
    }
}

#[tokio::test]
async fn health_is_public_and_carries_security_headers() {
    let mut server = spawn_server().await;
    let response = reqwest::get(format!("{}/health", server.base)).await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers().get("X-Content-Type-Options").unwrap(),
        "nosniff"
    );
    assert_eq!(response.headers().get("X-Frame-Options").unwrap(), "DENY");
    let body: JsonValue = response.json().await.unwrap();
    assert_eq!(body["status"], "healthy");

    server.handle.take().unwrap().shutdown().await;
}

#[tokio::test]
async fn protected_endpoints_require_a_valid_bearer_token() {
    let mut server = spawn_server().await;
    let client = reqwest::Client::new();

    // No token configured at all.
    let response = client
        .get(format!("{}/api/status", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    let issued = server.service.generate_auth_token(24);
    let token = issued["token"].as_str().unwrap().to_string();

    // Wrong token.
    let response = client
        .get(format!("{}/api/status", server.base))
        .bearer_auth("wrong-token")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    // Right token.
    let response = client
        .get(format!("{}/api/status", server.base))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: JsonValue = response.json().await.unwrap();
    assert_eq!(body["success"], true);
    assert!(body["data"]["cpu"]["usage_percent"].is_number());

    let response = client
        .get(format!("{}/api/models", server.base))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    let body: JsonValue = response.json().await.unwrap();
    assert_eq!(body["models"][0]["name"], "llama3.2:3b");

    let response = client
        .get(format!("{}/api/conversations/c-9/messages", server.base))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    let body: JsonValue = response.json().await.unwrap();
    assert_eq!(body["messages"][0]["content"], "for c-9");

    server.handle.take().unwrap().shutdown().await;
}

#[tokio::test]
async fn blocking_chat_collects_the_full_response() {
    let mut server = spawn_server().await;
    let token = server.service.generate_auth_token(24)["token"]
        .as_str()
        .unwrap()
        .to_string();

    let client = reqwest::Client::new();
    let response = client
        .post(format!("{}/api/chat", server.base))
        .bearer_auth(&token)
        .json(&json!({"model": "m", "prompt": "hi"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: JsonValue = response.json().await.unwrap();
    assert_eq!(body["response"], "Hello");
    assert_eq!(body["chat_id"], "c-1");

    // Missing fields are a 400, not a handler error.
    let response = client
        .post(format!("{}/api/chat", server.base))
        .bearer_auth(&token)
        .json(&json!({"prompt": "hi"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    server.handle.take().unwrap().shutdown().await;
}

#[tokio::test]
async fn sse_stream_mirrors_internal_event_names() {
    let mut server = spawn_server().await;
    let token = server.service.generate_auth_token(24)["token"]
        .as_str()
        .unwrap()
        .to_string();

    let client = reqwest::Client::new();
    let response = client
        .post(format!("{}/api/chat/stream", server.base))
        .bearer_auth(&token)
        .json(&json!({"model": "m", "prompt": "hi"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body = response.text().await.unwrap();
    assert!(body.contains("event: token"));
    assert!(body.contains("event: done"));
    assert!(body.contains("\"data\":\"Hel\""));

    server.handle.take().unwrap().shutdown().await;
}
