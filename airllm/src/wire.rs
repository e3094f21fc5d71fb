use serde::Deserialize;
use serde::Serialize;
use serde_json::Value as JsonValue;

/// `{"type":"status",...}` frame the sidecar emits once per model load.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct StatusFrame {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Response to one generation request, correlated by `id`.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct GenerateResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<u64>,
}

impl GenerateResponse {
    pub fn failure(id: Option<String>, error: impl Into<String>) -> Self {
        Self {
            id,
            ok: false,
            text: None,
            error: Some(error.into()),
            elapsed_ms: None,
        }
    }
}

/// One inbound line from the sidecar's stdout.
#[derive(Debug, Clone, PartialEq)]
pub enum SidecarFrame {
    Status(StatusFrame),
    Response(GenerateResponse),
    Unknown,
}

impl SidecarFrame {
    pub fn parse(line: &str) -> Result<Self, serde_json::Error> {
        let value: JsonValue = serde_json::from_str(line)?;
        if value.get("type").and_then(JsonValue::as_str) == Some("status") {
            return Ok(SidecarFrame::Status(serde_json::from_value(value)?));
        }
        if value.get("id").is_some() {
            return Ok(SidecarFrame::Response(serde_json::from_value(value)?));
        }
        Ok(SidecarFrame::Unknown)
    }
}

/// Builds the generation request line sent to the sidecar.
pub(crate) fn generate_request(
    id: &str,
    prompt: &str,
    max_tokens: u32,
    temperature: f64,
) -> JsonValue {
    serde_json::json!({
        "id": id,
        "type": "generate",
        "prompt": prompt,
        "max_tokens": max_tokens,
        "temperature": temperature,
    })
}
