use serde::Deserialize;
use serde::Serialize;

use crate::DEFAULT_HTTP_PORT;

/// On-disk remote-access configuration (`data/tunnel/tunnel_config.json`).
/// `auth_token` holds the sha256 of the clear token, optionally wrapped as
/// `ENC:<base64>`; the clear token is never persisted.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct TunnelSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub tunnel_url: String,
    #[serde(default)]
    pub auth_token: String,
    #[serde(default)]
    pub token_created_at: String,
    #[serde(default = "default_expiry_hours")]
    pub token_expires_hours: u64,
    #[serde(default = "default_rate_requests")]
    pub rate_limit_requests: u32,
    #[serde(default = "default_rate_window")]
    pub rate_limit_window: u64,
    #[serde(default)]
    pub allowed_ips: Vec<String>,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub named_tunnel_token: Option<String>,
}

fn default_expiry_hours() -> u64 {
    24
}

fn default_rate_requests() -> u32 {
    60
}

fn default_rate_window() -> u64 {
    60
}

fn default_http_port() -> u16 {
    DEFAULT_HTTP_PORT
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            tunnel_url: String::new(),
            auth_token: String::new(),
            token_created_at: String::new(),
            token_expires_hours: default_expiry_hours(),
            rate_limit_requests: default_rate_requests(),
            rate_limit_window: default_rate_window(),
            allowed_ips: Vec::new(),
            http_port: default_http_port(),
            named_tunnel_token: None,
        }
    }
}

impl TunnelSettings {
    /// Allowlist check: an empty list admits everyone; loopback is always
    /// admitted.
    pub fn ip_allowed(&self, client_ip: &str) -> bool {
        if matches!(client_ip, "127.0.0.1" | "::1" | "localhost") {
            return true;
        }
        if self.allowed_ips.is_empty() {
            return true;
        }
        self.allowed_ips.iter().any(|ip| ip == client_ip)
    }
}
