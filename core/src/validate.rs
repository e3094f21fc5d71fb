use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::net::Ipv6Addr;

use serde_json::Value as JsonValue;

const MAX_PAYLOAD_BYTES: usize = 1024 * 1024;
const TOKEN_MIN_LEN: usize = 8;
const TOKEN_MAX_LEN: usize = 128;
const MAX_IP_LEN: usize = 45;
const MODEL_NAME_MAX_LEN: usize = 100;

/// Rejects payloads whose serialized form exceeds 1 MiB.
pub fn validate_payload_size(payload: &JsonValue) -> Result<(), String> {
    let serialized = serde_json::to_string(payload)
        .map_err(|e| format!("payload size validation error: {e}"))?;
    let size = serialized.len();
    if size > MAX_PAYLOAD_BYTES {
        return Err(format!(
            "payload too large (max {MAX_PAYLOAD_BYTES} bytes, got {size})"
        ));
    }
    Ok(())
}

/// Token shape: length in [8, 128], restricted charset, and at least two
/// distinct character classes.
pub fn validate_token(token: &str) -> Result<(), String> {
    if token.trim().is_empty() {
        return Err("token cannot be empty".to_string());
    }
    if token.len() < TOKEN_MIN_LEN {
        return Err(format!("token too short (min {TOKEN_MIN_LEN} characters)"));
    }
    if token.len() > TOKEN_MAX_LEN {
        return Err(format!("token too long (max {TOKEN_MAX_LEN} characters)"));
    }
    if !token
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_=+/.".contains(c))
    {
        return Err("token contains invalid characters".to_string());
    }

    let classes = [
        token.chars().any(|c| c.is_ascii_lowercase()),
        token.chars().any(|c| c.is_ascii_uppercase()),
        token.chars().any(|c| c.is_ascii_digit()),
        token.chars().any(|c| "-_=+/.".contains(c)),
    ];
    if classes.iter().filter(|present| **present).count() < 2 {
        return Err("token too weak (needs more character variety)".to_string());
    }
    Ok(())
}

/// Accepts routable IPv4/IPv6 addresses; loopback, multicast and reserved
/// ranges are rejected.
pub fn validate_ip_address(ip: &str) -> Result<(), String> {
    if ip.trim().is_empty() {
        return Err("IP address cannot be empty".to_string());
    }
    if ip.len() > MAX_IP_LEN {
        return Err("IP address too long".to_string());
    }
    let parsed: IpAddr = ip
        .parse()
        .map_err(|_| "invalid IP address format".to_string())?;
    match parsed {
        IpAddr::V4(v4) => {
            if v4.is_loopback() {
                return Err("loopback addresses are not allowed".to_string());
            }
            if v4.is_multicast() {
                return Err("multicast addresses are not allowed".to_string());
            }
            if is_reserved_v4(v4) {
                return Err("reserved addresses are not allowed".to_string());
            }
        }
        IpAddr::V6(v6) => {
            if v6.is_loopback() {
                return Err("loopback addresses are not allowed".to_string());
            }
            if v6.is_multicast() {
                return Err("multicast addresses are not allowed".to_string());
            }
            if is_reserved_v6(&v6) {
                return Err("reserved addresses are not allowed".to_string());
            }
        }
    }
    Ok(())
}

// 240.0.0.0/4 minus the limited broadcast address.
fn is_reserved_v4(ip: Ipv4Addr) -> bool {
    ip.octets()[0] >= 240 && !ip.is_broadcast()
}

fn is_reserved_v6(ip: &Ipv6Addr) -> bool {
    ip.is_unspecified()
}

/// Model names: bounded length, runtime-safe charset, no traversal.
pub fn validate_model_name(name: &str) -> Result<(), String> {
    if name.trim().is_empty() {
        return Err("model name cannot be empty".to_string());
    }
    if name.len() > MODEL_NAME_MAX_LEN {
        return Err("model name too long".to_string());
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || ":._/-".contains(c))
    {
        return Err("model name contains invalid characters".to_string());
    }
    if name.contains("..") || name.starts_with('/') || name.starts_with('\\') {
        return Err("model name contains path traversal".to_string());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use serde_json::json;

    #[test]
    fn payload_size_boundary() {
        assert!(validate_payload_size(&json!({"small": true})).is_ok());
        let big = "x".repeat(MAX_PAYLOAD_BYTES + 1);
        assert!(validate_payload_size(&json!({"data": big})).is_err());
    }

    #[test]
    fn token_shapes() {
        assert!(validate_token("Abcdef12").is_ok());
        assert!(validate_token("with-dash_and.dot8").is_ok());
        // too short
        assert!(validate_token("Ab1").is_err());
        // bad characters
        assert!(validate_token("has space 12345").is_err());
        assert!(validate_token("has!bang12345").is_err());
        // single character class
        assert!(validate_token("abcdefgh").is_err());
        // length cap
        assert!(validate_token(&"aB1".repeat(50)).is_err());
    }

    #[test]
    fn ip_addresses() {
        assert!(validate_ip_address("8.8.8.8").is_ok());
        assert!(validate_ip_address("192.168.1.20").is_ok());
        assert!(validate_ip_address("2001:4860:4860::8888").is_ok());
        assert!(validate_ip_address("127.0.0.1").is_err());
        assert!(validate_ip_address("::1").is_err());
        assert!(validate_ip_address("224.0.0.1").is_err());
        assert!(validate_ip_address("240.0.0.1").is_err());
        assert!(validate_ip_address("not-an-ip").is_err());
        assert!(validate_ip_address("").is_err());
    }

    #[test]
    fn model_names() {
        assert!(validate_model_name("llama3.2:3b").is_ok());
        assert!(validate_model_name("library/mistral-7b_v0.2").is_ok());
        assert!(validate_model_name("").is_err());
        assert!(validate_model_name("../etc/passwd").is_err());
        assert!(validate_model_name("/absolute").is_err());
        assert!(validate_model_name("space name").is_err());
        assert!(validate_model_name(&"m".repeat(101)).is_err());
    }
}
