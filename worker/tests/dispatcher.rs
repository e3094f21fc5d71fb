#![allow(clippy::unwrap_used, clippy::expect_used)]

//! Dispatcher-level tests: requests go through the real guard, validator,
//! rate limiter and handlers; frames are read back from the outgoing
//! channel exactly as the host would see them on stdout.

use std::sync::Arc;

use serde_json::Value as JsonValue;
use serde_json::json;
use tokio::sync::mpsc;

use nimbus_core::NimbusHome;
use nimbus_protocol::Request;
use nimbus_worker::MessageProcessor;
use nimbus_worker::OutboundFrame;
use nimbus_worker::OutgoingSender;
use nimbus_worker::WorkerContext;

const CHANNEL_CAPACITY: usize = 128;

struct Harness {
    _tmp: tempfile::TempDir,
    ctx: Arc<WorkerContext>,
    processor: Arc<MessageProcessor>,
    rx: mpsc::Receiver<OutboundFrame>,
}

fn harness() -> Harness {
    let tmp = tempfile::tempdir().unwrap();
    let ctx = WorkerContext::new(NimbusHome::with_root(tmp.path())).unwrap();
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    let processor = Arc::new(MessageProcessor::new(
        Arc::clone(&ctx),
        OutgoingSender::new(tx),
    ));
    Harness {
        _tmp: tmp,
        ctx,
        processor,
        rx,
    }
}

fn request(id: &str, cmd: &str, payload: JsonValue) -> Request {
    Request {
        id: id.to_string(),
        cmd: cmd.to_string(),
        payload,
    }
}

async fn next_frame(rx: &mut mpsc::Receiver<OutboundFrame>) -> JsonValue {
    let frame = tokio::time::timeout(std::time::Duration::from_secs(10), rx.recv())
        .await
        .expect("timed out waiting for a frame")
        .expect("outgoing channel closed");
    serde_json::to_value(&frame).unwrap()
}

/// Tests that repoint the ollama client hold this lock so the process-wide
/// environment variable cannot race between concurrently running tests.
static ENV_LOCK: tokio::sync::Mutex<()> = tokio::sync::Mutex::const_new(());

/// A guard that points the worker's ollama client at a mock server for the
/// duration of a test and restores the environment afterwards.
struct EnvVarGuard {
    key: String,
    prev: Option<String>,
}

impl EnvVarGuard {
    fn set(key: &str, value: String) -> Self {
        let prev = std::env::var(key).ok();
        unsafe { std::env::set_var(key, value) };
        Self {
            key: key.to_string(),
            prev,
        }
    }
}

impl Drop for EnvVarGuard {
    fn drop(&mut self) {
        match &self.prev {
            Some(v) => unsafe { std::env::set_var(&self.key, v) },
            None => unsafe { std::env::remove_var(&self.key) },
        }
    }
}

#[tokio::test]
async fn health_check_answers_healthy() {
    let mut h = harness();
    h.processor
        .process_request(request("r1", "health_check", JsonValue::Null))
        .await;
    let frame = next_frame(&mut h.rx).await;
    assert_eq!(
        frame,
        json!({"id": "r1", "status": "ok", "data": {"status": "healthy"}})
    );
}

#[tokio::test]
async fn unknown_commands_are_denied_by_default() {
    let mut h = harness();
    h.processor
        .process_request(request("r2", "nope", JsonValue::Null))
        .await;
    let frame = next_frame(&mut h.rx).await;
    assert_eq!(frame["status"], "error");
    assert_eq!(frame["error"]["code"], "PERMISSION_DENIED");
}

#[tokio::test]
async fn oversized_payloads_are_rejected_before_dispatch() {
    let mut h = harness();
    let big = "x".repeat(1024 * 1024 + 1);
    h.processor
        .process_request(request("r3", "health_check", json!({"blob": big})))
        .await;
    let frame = next_frame(&mut h.rx).await;
    assert_eq!(frame["error"]["code"], "PAYLOAD_TOO_LARGE");
}

#[tokio::test]
async fn analyze_repository_needs_an_explicit_grant() {
    let mut h = harness();
    let repo = tempfile::tempdir().unwrap();
    std::fs::write(repo.path().join("main.rs"), "fn main() {}").unwrap();
    let payload = json!({"path": repo.path().to_str().unwrap()});

    h.processor
        .process_request(request("r1", "analyze_repository", payload.clone()))
        .await;
    let denied = next_frame(&mut h.rx).await;
    assert_eq!(denied["error"]["code"], "PERMISSION_DENIED");

    h.processor
        .process_request(request(
            "r2",
            "grant_permission",
            json!({"permission": "RepoAnalyze"}),
        ))
        .await;
    let granted = next_frame(&mut h.rx).await;
    assert_eq!(granted["status"], "ok");

    h.processor
        .process_request(request("r3", "analyze_repository", payload))
        .await;
    let analyzed = next_frame(&mut h.rx).await;
    assert_eq!(analyzed["status"], "ok");
    assert_eq!(analyzed["data"]["success"], true);
    assert!(analyzed["data"]["analysis"]["file_count"].as_u64().unwrap() >= 1);

    // Revoking closes the door again.
    h.processor
        .process_request(request(
            "r4",
            "revoke_permission",
            json!({"permission": "RepoAnalyze"}),
        ))
        .await;
    next_frame(&mut h.rx).await;
    h.processor
        .process_request(request(
            "r5",
            "analyze_repository",
            json!({"path": "/tmp"}),
        ))
        .await;
    let denied_again = next_frame(&mut h.rx).await;
    assert_eq!(denied_again["error"]["code"], "PERMISSION_DENIED");
}

#[tokio::test]
async fn token_generation_is_rate_limited_with_retry_after() {
    let mut h = harness();
    // Default limit for tunnel_generate_token is 3 per window.
    for i in 0..3 {
        h.processor
            .process_request(request(
                &format!("r{i}"),
                "tunnel_generate_token",
                json!({"expires_hours": 24}),
            ))
            .await;
        let frame = next_frame(&mut h.rx).await;
        assert_eq!(frame["status"], "ok", "request {i} should pass: {frame}");
        assert!(frame["data"]["token"].as_str().unwrap().len() >= 40);
    }

    h.processor
        .process_request(request(
            "r4",
            "tunnel_generate_token",
            json!({"expires_hours": 24}),
        ))
        .await;
    let frame = next_frame(&mut h.rx).await;
    assert_eq!(frame["error"]["code"], "RATE_LIMIT_EXCEEDED");
    assert!(frame["error"]["retry_after"].as_u64().unwrap() >= 290);
}

#[tokio::test]
async fn chat_streams_tokens_then_done_and_persists_both_turns() {
    let server = wiremock::MockServer::start().await;
    let body = concat!(
        "{\"message\":{\"role\":\"assistant\",\"content\":\"Hi \"},\"done\":false}\n",
        "{\"message\":{\"role\":\"assistant\",\"content\":\"there\"},\"done\":false}\n",
        "{\"done\":true}\n",
    );
    wiremock::Mock::given(wiremock::matchers::method("POST"))
        .and(wiremock::matchers::path("/api/chat"))
        .respond_with(
            wiremock::ResponseTemplate::new(200).set_body_raw(body, "application/x-ndjson"),
        )
        .mount(&server)
        .await;
    let _env = ENV_LOCK.lock().await;
    let _guard = EnvVarGuard::set("NIMBUS_OLLAMA_HOST", server.uri());

    let mut h = harness();
    h.processor
        .process_request(request(
            "r5",
            "chat",
            json!({"model": "m1", "prompt": "hello", "language": "en"}),
        ))
        .await;

    let ack = next_frame(&mut h.rx).await;
    assert_eq!(ack["data"]["status"], "streaming_started");

    let mut tokens = Vec::new();
    let mut chat_id = None;
    let mut saw_preview = false;
    loop {
        let frame = next_frame(&mut h.rx).await;
        match frame["event"].as_str() {
            Some("prompt_preview") => {
                saw_preview = true;
                assert!(frame["text"].as_str().unwrap().contains("hello"));
                assert!(!frame["prompt_id"].as_str().unwrap().is_empty());
            }
            Some("token") => {
                tokens.push(frame["data"].as_str().unwrap().to_string());
                chat_id = frame["chat_id"].as_str().map(str::to_string);
            }
            Some("done") => {
                assert_eq!(frame["chat_id"].as_str(), chat_id.as_deref());
                break;
            }
            other => panic!("unexpected frame kind {other:?}: {frame}"),
        }
    }
    assert!(saw_preview);
    assert_eq!(tokens.join(""), "Hi there");
    let chat_id = chat_id.expect("tokens carried a chat id");

    // Both turns persisted under that conversation.
    h.processor
        .process_request(request(
            "r6",
            "get_conversation_messages",
            json!({"chat_id": chat_id}),
        ))
        .await;
    let messages = next_frame(&mut h.rx).await;
    let messages = messages["data"].as_array().unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0]["role"], "user");
    assert_eq!(messages[0]["content"], "hello");
    assert_eq!(messages[1]["role"], "assistant");
    assert_eq!(messages[1]["content"], "Hi there");
}

#[tokio::test]
async fn cancel_chat_ends_the_stream_without_persisting_the_partial_reply() {
    let server = wiremock::MockServer::start().await;
    // Enough token lines that the handler outruns both bounded channels and
    // must block before completing, guaranteeing the cancel flag is seen at
    // a token boundary.
    let mut body = String::new();
    for i in 0..400 {
        body.push_str(&format!(
            "{{\"message\":{{\"role\":\"assistant\",\"content\":\"t{i} \"}},\"done\":false}}\n"
        ));
    }
    body.push_str("{\"done\":true}\n");
    wiremock::Mock::given(wiremock::matchers::method("POST"))
        .and(wiremock::matchers::path("/api/chat"))
        .respond_with(
            wiremock::ResponseTemplate::new(200).set_body_raw(body, "application/x-ndjson"),
        )
        .mount(&server)
        .await;
    let _env = ENV_LOCK.lock().await;
    let _guard = EnvVarGuard::set("NIMBUS_OLLAMA_HOST", server.uri());

    let mut h = harness();
    h.processor
        .process_request(request(
            "r6",
            "chat",
            json!({"model": "m1", "prompt": "long one", "language": "en"}),
        ))
        .await;
    let ack = next_frame(&mut h.rx).await;
    assert_eq!(ack["data"]["status"], "streaming_started");

    // Read a handful of frames, then cancel using the chat id they carry.
    let mut chat_id = None;
    for _ in 0..6 {
        let frame = next_frame(&mut h.rx).await;
        if let Some(id) = frame["chat_id"].as_str() {
            chat_id = Some(id.to_string());
        }
    }
    let chat_id = chat_id.expect("frames carried a chat id");
    // The outgoing channel may be at capacity under backpressure, so the
    // cancel request is issued from its own task while this one drains.
    {
        let processor = Arc::clone(&h.processor);
        let cancel = request("r7", "cancel_chat", json!({"chat_id": chat_id}));
        tokio::spawn(async move {
            processor.process_request(cancel).await;
        });
    }

    // Drain until the terminal event; it must be `cancelled`, and nothing
    // may follow it on this stream.
    let mut terminal = None;
    while terminal.is_none() {
        let frame = next_frame(&mut h.rx).await;
        if frame["id"] == "r7" {
            assert_eq!(frame["data"]["success"], true);
            continue;
        }
        match frame["event"].as_str() {
            Some("token") | Some("prompt_preview") => continue,
            Some("cancelled") => terminal = Some(frame),
            other => panic!("expected cancellation, got {other:?}: {frame}"),
        }
    }
    assert_eq!(terminal.unwrap()["chat_id"], chat_id.as_str());

    // The partial assistant reply was not persisted.
    h.processor
        .process_request(request(
            "r8",
            "get_conversation_messages",
            json!({"chat_id": chat_id}),
        ))
        .await;
    let messages = next_frame(&mut h.rx).await;
    let messages = messages["data"].as_array().unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["role"], "user");
}

#[tokio::test]
async fn model_stream_errors_terminate_without_persisting() {
    let server = wiremock::MockServer::start().await;
    wiremock::Mock::given(wiremock::matchers::method("POST"))
        .and(wiremock::matchers::path("/api/chat"))
        .respond_with(wiremock::ResponseTemplate::new(200).set_body_raw(
            "{\"error\":\"model 'm1' not found\"}\n",
            "application/x-ndjson",
        ))
        .mount(&server)
        .await;
    let _env = ENV_LOCK.lock().await;
    let _guard = EnvVarGuard::set("NIMBUS_OLLAMA_HOST", server.uri());

    let mut h = harness();
    h.processor
        .process_request(request(
            "r9",
            "chat",
            json!({"model": "m1", "prompt": "hi", "language": "en"}),
        ))
        .await;
    next_frame(&mut h.rx).await; // ack

    let mut terminal = None;
    while terminal.is_none() {
        let frame = next_frame(&mut h.rx).await;
        match frame["event"].as_str() {
            Some("prompt_preview") | Some("token") => continue,
            Some("error") => terminal = Some(frame),
            other => panic!("expected error event, got {other:?}"),
        }
    }
    let error = terminal.unwrap();
    assert!(error["message"].as_str().unwrap().contains("not found"));
    let chat_id = error["chat_id"].as_str().unwrap().to_string();

    h.processor
        .process_request(request(
            "r10",
            "get_conversation_messages",
            json!({"chat_id": chat_id}),
        ))
        .await;
    let messages = next_frame(&mut h.rx).await;
    assert_eq!(messages["data"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn memory_commands_respect_the_permission_split() {
    let mut h = harness();

    // Reads are whitelisted.
    h.processor
        .process_request(request(
            "r1",
            "memory_get",
            json!({"memory_type": "user", "key": "k"}),
        ))
        .await;
    let read = next_frame(&mut h.rx).await;
    assert_eq!(read["status"], "ok");
    assert_eq!(read["data"]["value"], JsonValue::Null);

    // Writes need MemoryAccess.
    let save = json!({"memory_type": "user", "key": "k", "value": "v"});
    h.processor
        .process_request(request("r2", "memory_save", save.clone()))
        .await;
    assert_eq!(
        next_frame(&mut h.rx).await["error"]["code"],
        "PERMISSION_DENIED"
    );

    h.processor
        .process_request(request(
            "r3",
            "grant_permission",
            json!({"permission": "MemoryAccess"}),
        ))
        .await;
    next_frame(&mut h.rx).await;

    h.processor
        .process_request(request("r4", "memory_save", save))
        .await;
    assert_eq!(next_frame(&mut h.rx).await["data"]["success"], true);

    h.processor
        .process_request(request(
            "r5",
            "memory_get",
            json!({"memory_type": "user", "key": "k"}),
        ))
        .await;
    assert_eq!(next_frame(&mut h.rx).await["data"]["value"], "v");
}

#[tokio::test]
async fn shutdown_is_acknowledged_and_raises_the_flag() {
    let mut h = harness();
    h.processor
        .process_request(request("r1", "shutdown", JsonValue::Null))
        .await;
    let frame = next_frame(&mut h.rx).await;
    assert_eq!(frame["data"]["status"], "shutdown_acknowledged");
    assert!(h.ctx.shutdown.is_cancelled());
}

#[tokio::test]
async fn conversation_crud_round_trip() {
    let server = wiremock::MockServer::start().await;
    wiremock::Mock::given(wiremock::matchers::method("POST"))
        .and(wiremock::matchers::path("/api/chat"))
        .respond_with(wiremock::ResponseTemplate::new(200).set_body_raw(
            "{\"message\":{\"role\":\"assistant\",\"content\":\"ok\"},\"done\":false}\n{\"done\":true}\n",
            "application/x-ndjson",
        ))
        .mount(&server)
        .await;
    let _env = ENV_LOCK.lock().await;
    let _guard = EnvVarGuard::set("NIMBUS_OLLAMA_HOST", server.uri());

    let mut h = harness();
    h.processor
        .process_request(request(
            "r1",
            "chat",
            json!({"model": "m1", "prompt": "make a chat"}),
        ))
        .await;
    next_frame(&mut h.rx).await; // ack
    let mut chat_id = None;
    loop {
        let frame = next_frame(&mut h.rx).await;
        if frame["event"] == "done" {
            chat_id = frame["chat_id"].as_str().map(str::to_string);
            break;
        }
    }
    let chat_id = chat_id.unwrap();

    h.processor
        .process_request(request("r2", "list_conversations", JsonValue::Null))
        .await;
    let listed = next_frame(&mut h.rx).await;
    assert_eq!(listed["data"].as_array().unwrap().len(), 1);
    assert_eq!(listed["data"][0]["id"], chat_id.as_str());
    assert_eq!(listed["data"][0]["title"], "make a chat");
    assert_eq!(listed["data"][0]["encrypted"], false);

    h.processor
        .process_request(request(
            "r3",
            "get_conversation_metadata",
            json!({"chat_id": chat_id}),
        ))
        .await;
    let meta = next_frame(&mut h.rx).await;
    assert_eq!(meta["data"]["message_count"], 2);

    h.processor
        .process_request(request(
            "r4",
            "delete_conversation",
            json!({"chat_id": chat_id}),
        ))
        .await;
    assert_eq!(next_frame(&mut h.rx).await["data"]["status"], "success");

    h.processor
        .process_request(request("r5", "list_conversations", JsonValue::Null))
        .await;
    assert!(
        next_frame(&mut h.rx).await["data"]
            .as_array()
            .unwrap()
            .is_empty()
    );
}
