use serde::Serialize;
use serde_json::Value as JsonValue;
use tokio::sync::mpsc;
use tracing::warn;

use nimbus_protocol::ErrorCode;
use nimbus_protocol::Response;
use nimbus_protocol::SYSTEM_STATS_ID;
use nimbus_protocol::StreamEvent;
use nimbus_protocol::StreamFrame;

/// Everything the worker ever writes to stdout. A single writer task drains
/// the channel, so frames are serialized whole lines and never interleave.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(untagged)]
pub enum OutboundFrame {
    Response(Response),
    Stream(StreamFrame),
}

/// Cloneable handle every emitter (dispatcher, stream pumps, telemetry)
/// writes through.
#[derive(Clone)]
pub struct OutgoingSender {
    tx: mpsc::Sender<OutboundFrame>,
}

impl OutgoingSender {
    pub fn new(tx: mpsc::Sender<OutboundFrame>) -> Self {
        Self { tx }
    }

    pub async fn ok(&self, id: &str, data: JsonValue) {
        self.send(OutboundFrame::Response(Response::ok(id, data))).await;
    }

    pub async fn error(&self, id: &str, code: ErrorCode, message: impl Into<String>) {
        self.send(OutboundFrame::Response(Response::error(id, code, message)))
            .await;
    }

    pub async fn stream_event(&self, id: &str, event: StreamEvent) {
        self.send(OutboundFrame::Stream(StreamFrame {
            id: id.to_string(),
            event,
        }))
        .await;
    }

    pub async fn rate_limited(&self, id: &str, retry_after: u64) {
        self.send(OutboundFrame::Response(Response::rate_limited(
            id,
            retry_after,
        )))
        .await;
    }

    /// Unsolicited telemetry frame under the reserved id.
    pub async fn telemetry(&self, data: JsonValue) {
        self.ok(SYSTEM_STATS_ID, data).await;
    }

    async fn send(&self, frame: OutboundFrame) {
        if self.tx.send(frame).await.is_err() {
            warn!("outgoing channel closed; dropping frame");
        }
    }
}
