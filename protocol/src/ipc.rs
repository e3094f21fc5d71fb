use serde::Deserialize;
use serde::Serialize;
use serde_json::Value as JsonValue;

/// One framed request from the host. `id` is opaque and echoed on every
/// frame produced for this request.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Request {
    pub id: String,
    pub cmd: String,
    #[serde(default)]
    pub payload: JsonValue,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Ok,
    Error,
}

/// Terminal response for a non-streaming request, or the
/// `streaming_started` acknowledgement for a streaming one.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Response {
    pub id: String,
    pub status: ResponseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Response {
    pub fn ok(id: impl Into<String>, data: JsonValue) -> Self {
        Self {
            id: id.into(),
            status: ResponseStatus::Ok,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(id: impl Into<String>, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: ResponseStatus::Error,
            data: None,
            error: Some(ErrorBody {
                code,
                message: message.into(),
                retry_after: None,
            }),
        }
    }

    pub fn rate_limited(id: impl Into<String>, retry_after: u64) -> Self {
        Self {
            id: id.into(),
            status: ResponseStatus::Error,
            data: None,
            error: Some(ErrorBody {
                code: ErrorCode::RateLimitExceeded,
                message: format!("Too many requests. Try again in {retry_after} seconds"),
                retry_after: Some(retry_after),
            }),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
    /// Seconds after which a rate-limited caller may retry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

/// Dispatcher-level error codes surfaced to the host.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    PermissionDenied,
    PayloadTooLarge,
    RateLimitExceeded,
    CmdErr,
    LicenseRequired,
    OllamaCliError,
    ModelListError,
}

/// Event emitted by a streaming handler. Every stream terminates with
/// exactly one of `done`, `cancelled` or `error`.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StreamEvent {
    Token {
        data: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        chat_id: Option<String>,
    },
    Progress {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        progress: Option<u8>,
    },
    PromptPreview {
        text: String,
        prompt_id: String,
        structured: JsonValue,
        chat_id: String,
    },
    Done {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        chat_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
    },
    Cancelled {
        chat_id: String,
    },
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        chat_id: Option<String>,
    },
}

impl StreamEvent {
    /// True for the frame that closes a stream.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StreamEvent::Done { .. } | StreamEvent::Cancelled { .. } | StreamEvent::Error { .. }
        )
    }

    /// Name used on the SSE surface; mirrors the internal `event` tag.
    pub fn sse_name(&self) -> &'static str {
        match self {
            StreamEvent::Token { .. } => "token",
            StreamEvent::Progress { .. } => "progress",
            StreamEvent::PromptPreview { .. } => "prompt_preview",
            StreamEvent::Done { .. } => "done",
            StreamEvent::Cancelled { .. } => "cancelled",
            StreamEvent::Error { .. } => "error",
        }
    }
}

/// A stream event tagged with the id of the request it belongs to, as it
/// appears on the wire.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct StreamFrame {
    pub id: String,
    #[serde(flatten)]
    pub event: StreamEvent,
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn request_payload_defaults_to_null() {
        let req: Request = serde_json::from_str(r#"{"id":"r1","cmd":"health_check"}"#).unwrap();
        assert_eq!(req.id, "r1");
        assert_eq!(req.cmd, "health_check");
        assert_eq!(req.payload, JsonValue::Null);
    }

    #[test]
    fn ok_response_omits_error_field() {
        let resp = Response::ok("r1", json!({"status": "healthy"}));
        let line = serde_json::to_string(&resp).unwrap();
        assert_eq!(
            line,
            r#"{"id":"r1","status":"ok","data":{"status":"healthy"}}"#
        );
    }

    #[test]
    fn error_codes_serialize_screaming_snake() {
        let resp = Response::error("r2", ErrorCode::PermissionDenied, "nope");
        let value = serde_json::to_value(&resp).unwrap();
        assert_eq!(value["status"], "error");
        assert_eq!(value["error"]["code"], "PERMISSION_DENIED");
        assert_eq!(value["error"]["message"], "nope");
    }

    #[test]
    fn stream_frame_flattens_event_tag() {
        let frame = StreamFrame {
            id: "r5".to_string(),
            event: StreamEvent::Token {
                data: "hel".to_string(),
                chat_id: Some("c1".to_string()),
            },
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(
            value,
            json!({"id": "r5", "event": "token", "data": "hel", "chat_id": "c1"})
        );
    }

    #[test]
    fn terminal_events_are_exactly_done_cancelled_error() {
        assert!(
            StreamEvent::Done {
                chat_id: None,
                model: None
            }
            .is_terminal()
        );
        assert!(
            StreamEvent::Cancelled {
                chat_id: "c".to_string()
            }
            .is_terminal()
        );
        assert!(
            StreamEvent::Error {
                message: "x".to_string(),
                chat_id: None
            }
            .is_terminal()
        );
        assert!(
            !StreamEvent::Token {
                data: "t".to_string(),
                chat_id: None
            }
            .is_terminal()
        );
        assert!(
            !StreamEvent::Progress {
                model: None,
                message: "m".to_string(),
                progress: Some(10)
            }
            .is_terminal()
        );
    }
}
