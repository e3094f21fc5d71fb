use std::sync::Mutex;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value as JsonValue;

/// Features included in the free plan.
const FREE_FEATURES: &[&str] = &["local_chat", "model_switch"];

/// Features a paid plan adds on top of the free set.
const PRO_FEATURES: &[&str] = &[
    "remote_access",
    "web_search",
    "unlimited_history",
    "exports",
    "model_pull",
];

/// Plan state pushed by the host. The worker only consumes this snapshot;
/// it never verifies licenses itself.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct LicenseStatus {
    #[serde(default = "default_plan")]
    pub plan: String,
    #[serde(default = "default_plan")]
    pub state: String,
    #[serde(default)]
    pub entitlements: Vec<String>,
    #[serde(default)]
    pub expires_at: Option<String>,
    #[serde(default)]
    pub last_verified_at: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

fn default_plan() -> String {
    "free".to_string()
}

impl Default for LicenseStatus {
    fn default() -> Self {
        Self {
            plan: default_plan(),
            state: default_plan(),
            entitlements: Vec::new(),
            expires_at: None,
            last_verified_at: None,
            error: None,
        }
    }
}

/// Pure gate predicate over a status snapshot.
pub fn feature_gate(feature: &str, status: &LicenseStatus) -> Result<(), &'static str> {
    let state_valid = !matches!(status.state.as_str(), "expired" | "invalid" | "error");
    if !state_valid {
        return Err("LICENSE_REQUIRED");
    }
    let enabled = if status.plan == "free" {
        FREE_FEATURES.contains(&feature)
    } else {
        FREE_FEATURES.contains(&feature) || PRO_FEATURES.contains(&feature)
    };
    if enabled { Ok(()) } else { Err("LICENSE_REQUIRED") }
}

pub struct LicenseService {
    status: Mutex<LicenseStatus>,
}

impl Default for LicenseService {
    fn default() -> Self {
        Self::new()
    }
}

impl LicenseService {
    pub fn new() -> Self {
        Self {
            status: Mutex::new(LicenseStatus::default()),
        }
    }

    pub fn snapshot(&self) -> LicenseStatus {
        self.lock().clone()
    }

    pub fn update_snapshot(&self, snapshot: &JsonValue) {
        if let Ok(parsed) = serde_json::from_value::<LicenseStatus>(snapshot.clone()) {
            *self.lock() = parsed;
        }
    }

    pub fn mark_error(&self, message: &str) {
        let mut status = self.lock();
        status.state = "error".to_string();
        status.error = Some(message.to_string());
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LicenseStatus> {
        match self.status.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn free_plan_gates_pro_features() {
        let status = LicenseStatus::default();
        assert!(feature_gate("local_chat", &status).is_ok());
        assert_eq!(
            feature_gate("web_search", &status),
            Err("LICENSE_REQUIRED")
        );
        assert_eq!(
            feature_gate("remote_access", &status),
            Err("LICENSE_REQUIRED")
        );
    }

    #[test]
    fn pro_plan_unlocks_everything_until_invalidated() {
        let mut status = LicenseStatus {
            plan: "pro".to_string(),
            state: "active".to_string(),
            ..Default::default()
        };
        assert!(feature_gate("web_search", &status).is_ok());
        assert!(feature_gate("local_chat", &status).is_ok());

        status.state = "expired".to_string();
        assert!(feature_gate("web_search", &status).is_err());
        assert!(feature_gate("local_chat", &status).is_err());
    }

    #[test]
    fn service_holds_the_latest_snapshot() {
        let service = LicenseService::new();
        service.update_snapshot(&serde_json::json!({"plan": "pro", "state": "active"}));
        assert_eq!(service.snapshot().plan, "pro");

        service.mark_error("verification failed");
        let status = service.snapshot();
        assert_eq!(status.state, "error");
        assert!(feature_gate("local_chat", &status).is_err());
    }
}
