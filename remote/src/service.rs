use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;
use rand::rngs::OsRng;
use serde_json::Value as JsonValue;
use serde_json::json;
use time::Duration as TimeDuration;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::warn;

use nimbus_core::ActionType;
use nimbus_core::AuditLog;
use nimbus_core::CryptoService;
use nimbus_core::Envelope;
use nimbus_core::NimbusHome;
use nimbus_core::now_rfc3339;
use nimbus_core::sha256_hex;
use nimbus_protocol::ENC_PREFIX;

use crate::DEFAULT_HTTP_PORT;
use crate::HttpServerHandle;
use crate::IpRateLimiter;
use crate::TOKEN_AAD;
use crate::TunnelRuntime;
use crate::TunnelSettings;
use crate::WorkerPort;
use crate::server::start_http_server;

const APP_NAME: &str = "Nimbus";
const APP_VERSION: &str = "1.0";

/// Owner of the remote-access pair: persisted configuration with hashed
/// token material, the per-IP limiter, the HTTP server handle and the
/// tunnel process runtime.
pub struct RemoteAccessService {
    config_path: PathBuf,
    config: Mutex<TunnelSettings>,
    crypto: Arc<CryptoService>,
    audit: Arc<AuditLog>,
    pub ip_limiter: IpRateLimiter,
    pub tunnel: TunnelRuntime,
    http: Mutex<Option<HttpServerHandle>>,
}

impl RemoteAccessService {
    pub fn new(
        home: &NimbusHome,
        crypto: Arc<CryptoService>,
        audit: Arc<AuditLog>,
    ) -> nimbus_core::Result<Self> {
        let dir = home.tunnel_dir()?;
        let config_path = dir.join("tunnel_config.json");
        let config = Self::load_config(&config_path, &crypto);
        let ip_limiter = IpRateLimiter::new(
            config.rate_limit_requests,
            std::time::Duration::from_secs(config.rate_limit_window),
        );
        Ok(Self {
            config_path,
            config: Mutex::new(config),
            crypto,
            audit,
            ip_limiter,
            tunnel: TunnelRuntime::new(dir),
            http: Mutex::new(None),
        })
    }

    fn load_config(path: &PathBuf, crypto: &CryptoService) -> TunnelSettings {
        let Ok(content) = fs::read_to_string(path) else {
            return TunnelSettings::default();
        };
        let mut config: TunnelSettings = match serde_json::from_str(&content) {
            Ok(config) => config,
            Err(e) => {
                warn!("tunnel config unreadable, using defaults: {e}");
                return TunnelSettings::default();
            }
        };
        // Decrypt stored token material when possible; otherwise keep the
        // wrapped form so validation can explain why it is unusable.
        if config.auth_token.starts_with(ENC_PREFIX) && crypto.has_key() {
            match Envelope::sniff(&config.auth_token).open(crypto, Some(TOKEN_AAD)) {
                Ok(hash) => config.auth_token = hash,
                Err(e) => warn!("stored token could not be decrypted: {e}"),
            }
        }
        config
    }

    pub fn config(&self) -> TunnelSettings {
        self.lock_config().clone()
    }

    pub fn update_config(&self, apply: impl FnOnce(&mut TunnelSettings)) {
        let snapshot = {
            let mut config = self.lock_config();
            apply(&mut config);
            config.clone()
        };
        self.persist(snapshot);
    }

    fn persist(&self, mut snapshot: TunnelSettings) {
        // Hashes only ever leave memory encrypted when a key is available.
        if !snapshot.auth_token.is_empty()
            && !snapshot.auth_token.starts_with(ENC_PREFIX)
            && self.crypto.has_key()
        {
            match self.crypto.seal(&snapshot.auth_token, Some(TOKEN_AAD)) {
                Ok(sealed) => snapshot.auth_token = sealed,
                Err(e) => warn!("token encryption failed, persisting hash: {e}"),
            }
        }
        let json = match serde_json::to_string_pretty(&snapshot) {
            Ok(json) => json,
            Err(e) => {
                warn!("tunnel config serialization failed: {e}");
                return;
            }
        };
        if let Err(e) = fs::write(&self.config_path, json) {
            warn!("tunnel config write failed: {e}");
        }
    }

    // ------------------------------------------------------------------
    // Tokens
    // ------------------------------------------------------------------

    /// Generates 256 bits of randomness, persists only the hash, and
    /// returns the clear token to the caller exactly once.
    pub fn generate_auth_token(&self, expires_hours: u64) -> JsonValue {
        let mut raw = [0u8; 32];
        OsRng.fill_bytes(&mut raw);
        let token = URL_SAFE_NO_PAD.encode(raw);
        let created_at = now_rfc3339();

        self.update_config(|config| {
            config.auth_token = sha256_hex(&token);
            config.token_created_at = created_at.clone();
            config.token_expires_hours = expires_hours;
        });

        let expires_at = OffsetDateTime::now_utc() + TimeDuration::hours(expires_hours as i64);
        json!({
            "token": token,
            "expires_at": expires_at.format(&Rfc3339).unwrap_or_default(),
            "expires_hours": expires_hours,
        })
    }

    pub fn validate_token(&self, token: &str) -> JsonValue {
        let config = self.config();
        if token.is_empty() || config.auth_token.is_empty() {
            return json!({"valid": false, "reason": "No token configured"});
        }

        let stored_hash = if config.auth_token.starts_with(ENC_PREFIX) {
            if !self.crypto.has_key() {
                return json!({"valid": false, "reason": "Token encrypted but master key not configured"});
            }
            match Envelope::sniff(&config.auth_token).open(&self.crypto, Some(TOKEN_AAD)) {
                Ok(hash) => hash,
                Err(_) => return json!({"valid": false, "reason": "Token decryption failed"}),
            }
        } else {
            config.auth_token.clone()
        };

        if sha256_hex(token) != stored_hash {
            return json!({"valid": false, "reason": "Invalid token"});
        }

        if !config.token_created_at.is_empty()
            && let Ok(created_at) = OffsetDateTime::parse(&config.token_created_at, &Rfc3339)
        {
            let expires_at = created_at + TimeDuration::hours(config.token_expires_hours as i64);
            if OffsetDateTime::now_utc() > expires_at {
                return json!({"valid": false, "reason": "Token expired"});
            }
        }
        json!({"valid": true})
    }

    /// Custom tokens trade entropy for memorability, so their shape is
    /// stricter: length in [8, 32] with upper, lower and digit present.
    pub fn validate_custom_token(&self, token: &str) -> JsonValue {
        if token.is_empty() {
            return json!({"valid": false, "error": "Token is required"});
        }
        if token.len() < 8 {
            return json!({"valid": false, "error": "Token must be at least 8 characters"});
        }
        if token.len() > 32 {
            return json!({"valid": false, "error": "Token must be less than 32 characters"});
        }
        let has_upper = token.chars().any(|c| c.is_ascii_uppercase());
        let has_lower = token.chars().any(|c| c.is_ascii_lowercase());
        let has_digit = token.chars().any(|c| c.is_ascii_digit());
        if !(has_upper && has_lower && has_digit) {
            return json!({
                "valid": false,
                "error": "Token must contain uppercase, lowercase, and digits",
                "suggestion": "Try adding numbers and mixed case",
            });
        }
        let strength = if token.len() >= 12 { "good" } else { "medium" };
        json!({"valid": true, "strength": strength})
    }

    pub fn set_custom_token(&self, token: &str) -> JsonValue {
        let validation = self.validate_custom_token(token);
        if validation["valid"] != true {
            return json!({
                "success": false,
                "error": validation["error"],
                "suggestion": validation.get("suggestion").cloned().unwrap_or(JsonValue::Null),
            });
        }
        self.update_config(|config| {
            config.auth_token = sha256_hex(token);
            config.token_created_at = now_rfc3339();
        });
        json!({"success": true, "token": token, "strength": validation["strength"]})
    }

    pub fn set_named_tunnel(&self, token: Option<String>) -> JsonValue {
        self.update_config(|config| {
            config.named_tunnel_token = token.clone();
        });
        json!({"success": true, "named": token.is_some()})
    }

    // ------------------------------------------------------------------
    // Allowlist
    // ------------------------------------------------------------------

    pub fn add_allowed_ip(&self, ip: &str) -> JsonValue {
        self.update_config(|config| {
            if !config.allowed_ips.iter().any(|existing| existing == ip) {
                config.allowed_ips.push(ip.to_string());
            }
        });
        json!({"success": true, "allowed_ips": self.config().allowed_ips})
    }

    /// Removing an IP doubles as instant session revocation, hence the
    /// audit entry.
    pub fn remove_allowed_ip(&self, ip: &str) -> JsonValue {
        let mut removed = false;
        self.update_config(|config| {
            let before = config.allowed_ips.len();
            config.allowed_ips.retain(|existing| existing != ip);
            removed = config.allowed_ips.len() != before;
        });
        if removed {
            self.audit.log_with_ip(
                ActionType::RemoteAccessRevoked,
                json!({"ip": ip, "revoked_at": now_rfc3339(), "reason": "IP removed from allowlist"}),
                ip,
            );
        }
        json!({"success": true, "allowed_ips": self.config().allowed_ips})
    }

    pub fn check_ip_allowed(&self, client_ip: &str) -> bool {
        self.lock_config().ip_allowed(client_ip)
    }

    // ------------------------------------------------------------------
    // QR payloads
    // ------------------------------------------------------------------

    pub fn qr_data(&self) -> JsonValue {
        let url = self.tunnel.public_url();
        let Some(url) = url else {
            return json!({"success": false, "error": "No tunnel URL available"});
        };
        // The token is deliberately absent: the user types it on the device.
        let qr = json!({"url": url, "app": APP_NAME, "version": APP_VERSION});
        json!({
            "success": true,
            "qr_content": qr.to_string(),
            "url": url,
            "instructions": "Scan this QR code, then enter your access token",
        })
    }

    pub fn qr_data_with_token(&self, token: &str) -> JsonValue {
        let Some(url) = self.tunnel.public_url() else {
            return json!({"success": false, "error": "No tunnel URL available"});
        };
        let qr_url = format!("{url}?token={token}");
        let qr = json!({"url": qr_url, "app": APP_NAME, "version": APP_VERSION, "direct_access": true});
        json!({
            "success": true,
            "qr_content": qr.to_string(),
            "url": qr_url,
            "instructions": "Scan this QR code for direct access",
        })
    }

    // ------------------------------------------------------------------
    // Lifecycle: the HTTP server and tunnel start and stop as a pair.
    // ------------------------------------------------------------------

    pub async fn start(self: Arc<Self>, port: Option<u16>, worker: Arc<dyn WorkerPort>) -> JsonValue {
        let port = port.unwrap_or(DEFAULT_HTTP_PORT);
        if self.lock_http().is_some() {
            return json!({
                "success": false,
                "error": "Remote access already running",
                "url": self.tunnel.public_url(),
            });
        }

        let http = match start_http_server(port, Arc::clone(&self), worker).await {
            Ok(handle) => handle,
            Err(e) => return json!({"success": false, "error": format!("HTTP server failed: {e}")}),
        };
        *self.lock_http() = Some(http);

        let named_token = self.config().named_tunnel_token.clone();
        let started = self.tunnel.start(port, named_token).await;
        if started.get("success") != Some(&JsonValue::Bool(true)) {
            // Keep the pair invariant: no tunnel, no server.
            let http = self.lock_http().take();
            if let Some(http) = http {
                http.shutdown().await;
            }
            return started;
        }

        self.tunnel.mark_running_if_url();
        self.update_config(|config| {
            config.enabled = true;
            config.http_port = port;
        });
        self.audit.log(
            ActionType::RemoteAccess,
            json!({"action": "remote_access_started", "port": port}),
        );
        json!({
            "success": true,
            "url": self.tunnel.public_url().unwrap_or_else(|| "starting...".to_string()),
            "http_port": port,
            "message": "Remote access started",
        })
    }

    pub async fn stop(&self) -> JsonValue {
        self.tunnel.stop().await;
        let http = self.lock_http().take();
        if let Some(http) = http {
            http.shutdown().await;
        }
        self.update_config(|config| {
            config.enabled = false;
            config.tunnel_url = String::new();
        });
        self.audit.log(
            ActionType::RemoteAccess,
            json!({"action": "remote_access_stopped"}),
        );
        json!({"success": true, "message": "Remote access stopped"})
    }

    pub async fn status(&self) -> JsonValue {
        let config = self.config();
        let binary = self.tunnel.check_installed().await;
        json!({
            "tunnel_running": self.tunnel.is_running(),
            "tunnel_state": self.tunnel.state(),
            "tunnel_url": self.tunnel.public_url(),
            "tunnel_error": self.tunnel.last_error(),
            "http_running": self.lock_http().is_some(),
            "http_port": config.http_port,
            "cloudflared_installed": binary["installed"],
            "cloudflared_version": binary["version"],
            "cloudflared_path": binary["path"],
            "token_configured": !config.auth_token.is_empty(),
            "allowed_ips": config.allowed_ips,
            "rate_limit": {
                "max_requests": config.rate_limit_requests,
                "window_seconds": config.rate_limit_window,
            },
            "installing": self.tunnel.install_progress()["installing"],
            "install_progress": self.tunnel.install_progress()["progress"],
        })
    }

    fn lock_config(&self) -> std::sync::MutexGuard<'_, TunnelSettings> {
        match self.config.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_http(&self) -> std::sync::MutexGuard<'_, Option<HttpServerHandle>> {
        match self.http.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use pretty_assertions::assert_eq;

    fn service() -> (tempfile::TempDir, RemoteAccessService, Arc<CryptoService>) {
        let tmp = tempfile::tempdir().unwrap();
        let home = NimbusHome::with_root(tmp.path());
        let crypto = Arc::new(CryptoService::new(&home).unwrap());
        let audit = Arc::new(AuditLog::new(&home).unwrap());
        let service = RemoteAccessService::new(&home, Arc::clone(&crypto), audit).unwrap();
        (tmp, service, crypto)
    }

    #[test]
    fn generated_token_round_trips_and_only_the_hash_is_stored() {
        let (tmp, service, _) = service();
        let issued = service.generate_auth_token(24);
        let token = issued["token"].as_str().unwrap().to_string();
        assert!(token.len() >= 40);

        assert_eq!(service.validate_token(&token), json!({"valid": true}));
        assert_eq!(
            service.validate_token("not-the-token")["reason"],
            "Invalid token"
        );

        let raw =
            fs::read_to_string(tmp.path().join("data/tunnel/tunnel_config.json")).unwrap();
        assert!(!raw.contains(&token));
        assert!(raw.contains(&sha256_hex(&token)));
    }

    #[test]
    fn token_is_encrypted_at_rest_when_key_is_set() {
        let (tmp, service, crypto) = service();
        crypto.set_password("remote-pass1").unwrap();
        let issued = service.generate_auth_token(24);
        let token = issued["token"].as_str().unwrap().to_string();

        let raw =
            fs::read_to_string(tmp.path().join("data/tunnel/tunnel_config.json")).unwrap();
        let config: TunnelSettings = serde_json::from_str(&raw).unwrap();
        assert!(config.auth_token.starts_with("ENC:"));
        assert!(!raw.contains(&sha256_hex(&token)));

        // Still validates against the in-memory hash.
        assert_eq!(service.validate_token(&token), json!({"valid": true}));
    }

    #[test]
    fn expired_tokens_are_rejected() {
        let (_tmp, service, _) = service();
        let issued = service.generate_auth_token(1);
        let token = issued["token"].as_str().unwrap().to_string();
        // Backdate creation past the expiry horizon.
        let old = (OffsetDateTime::now_utc() - TimeDuration::hours(3))
            .format(&Rfc3339)
            .unwrap();
        service.update_config(|config| config.token_created_at = old.clone());
        assert_eq!(service.validate_token(&token)["reason"], "Token expired");
    }

    #[test]
    fn custom_token_rules() {
        let (_tmp, service, _) = service();
        assert_eq!(service.validate_custom_token("")["valid"], false);
        assert_eq!(service.validate_custom_token("short1A")["valid"], false);
        assert_eq!(
            service.validate_custom_token("alllowercase1")["valid"],
            false
        );
        let ok = service.validate_custom_token("GoodToken12");
        assert_eq!(ok["valid"], true);
        assert_eq!(ok["strength"], "medium");
        assert_eq!(
            service.validate_custom_token("LongerGoodToken12")["strength"],
            "good"
        );

        let set = service.set_custom_token("GoodToken12");
        assert_eq!(set["success"], true);
        assert_eq!(service.validate_token("GoodToken12"), json!({"valid": true}));
    }

    #[test]
    fn allowlist_mutations_persist_and_audit() {
        let (tmp, service, _) = service();
        service.add_allowed_ip("203.0.113.7");
        assert!(service.check_ip_allowed("203.0.113.7"));
        assert!(!service.check_ip_allowed("203.0.113.8"));

        service.remove_allowed_ip("203.0.113.7");
        // empty allowlist admits everyone again
        assert!(service.check_ip_allowed("203.0.113.8"));

        let audit =
            fs::read_to_string(tmp.path().join("data/audit/remote_access.log")).unwrap();
        assert!(audit.contains("remote_access_revoked"));
    }

    #[test]
    fn qr_requires_a_running_tunnel() {
        let (_tmp, service, _) = service();
        assert_eq!(service.qr_data()["success"], false);
        assert_eq!(service.qr_data_with_token("t")["success"], false);
    }

    #[test]
    fn named_tunnel_token_is_stored() {
        let (_tmp, service, _) = service();
        service.set_named_tunnel(Some("eyJhIjoi".to_string()));
        assert_eq!(
            service.config().named_tunnel_token.as_deref(),
            Some("eyJhIjoi")
        );
        service.set_named_tunnel(None);
        assert!(service.config().named_tunnel_token.is_none());
    }
}
