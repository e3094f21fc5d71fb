use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value as JsonValue;
use serde_json::json;
use tracing::warn;

use crate::NimbusHome;
use crate::Result;
use crate::config::now_rfc3339;

/// Audited action kinds. The serialized form is the on-disk vocabulary, so
/// variants are append-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    FileRead,
    FileWrite,
    FileDelete,
    CommandExecute,
    MemoryWrite,
    MemoryDelete,
    PromptSent,
    RemoteAccess,
    RemoteAccessRevoked,
    PermissionGranted,
    PermissionDenied,
}

/// JSON-lines audit trail under `data/audit/`. `actions.log` receives every
/// entry; a few action families are mirrored into specialized streams so
/// they can be reviewed in isolation.
pub struct AuditLog {
    actions: PathBuf,
    file_access: PathBuf,
    remote_access: PathBuf,
    prompts: PathBuf,
    write_lock: Mutex<()>,
}

impl AuditLog {
    pub fn new(home: &NimbusHome) -> Result<Self> {
        let dir = home.audit_dir()?;
        Ok(Self {
            actions: dir.join("actions.log"),
            file_access: dir.join("file_access.log"),
            remote_access: dir.join("remote_access.log"),
            prompts: dir.join("prompts.log"),
            write_lock: Mutex::new(()),
        })
    }

    pub fn log(&self, action: ActionType, details: JsonValue) {
        self.log_entry(action, details, None);
    }

    pub fn log_with_ip(&self, action: ActionType, details: JsonValue, ip: &str) {
        self.log_entry(action, details, Some(ip));
    }

    fn log_entry(&self, action: ActionType, details: JsonValue, ip: Option<&str>) {
        let mut entry = json!({
            "timestamp": now_rfc3339(),
            "action_type": action,
            "details": details,
        });
        if let (Some(ip), Some(map)) = (ip, entry.as_object_mut()) {
            map.insert("ip_address".to_string(), json!(ip));
        }

        let _guard = match self.write_lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        self.append(&self.actions, &entry);
        match action {
            ActionType::FileRead | ActionType::FileWrite | ActionType::FileDelete => {
                self.append(&self.file_access, &entry);
            }
            ActionType::RemoteAccess | ActionType::RemoteAccessRevoked => {
                self.append(&self.remote_access, &entry);
            }
            ActionType::PromptSent => {
                self.append(&self.prompts, &entry);
            }
            _ => {}
        }
    }

    fn append(&self, path: &PathBuf, entry: &JsonValue) {
        let line = match serde_json::to_string(entry) {
            Ok(line) => line,
            Err(e) => {
                warn!("audit: failed to serialize entry: {e}");
                return;
            }
        };
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|mut f| writeln!(f, "{line}"));
        if let Err(e) = result {
            warn!("audit: failed to write {}: {e}", path.display());
        }
    }

    /// Entry counts per action type across the main stream.
    pub fn stats(&self) -> JsonValue {
        let mut total = 0usize;
        let mut by_type = serde_json::Map::new();
        if let Ok(content) = std::fs::read_to_string(&self.actions) {
            for line in content.lines() {
                let Ok(entry) = serde_json::from_str::<JsonValue>(line) else {
                    continue;
                };
                total += 1;
                let kind = entry["action_type"].as_str().unwrap_or("unknown").to_string();
                let count = by_type.get(&kind).and_then(JsonValue::as_u64).unwrap_or(0);
                by_type.insert(kind, json!(count + 1));
            }
        }
        json!({"total_entries": total, "by_action_type": by_type})
    }
}
