use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::Mutex;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value as JsonValue;
use serde_json::json;

use crate::ActionType;
use crate::AuditLog;
use crate::CoreErr;
use crate::CryptoService;
use crate::Envelope;
use crate::NimbusHome;
use crate::Result;
use crate::config::now_rfc3339;

/// Where a memory entry lives. `Session` entries never touch disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryScope {
    User,
    Project,
    Session,
}

impl FromStr for MemoryScope {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "user" => Ok(MemoryScope::User),
            "project" => Ok(MemoryScope::Project),
            "session" => Ok(MemoryScope::Session),
            other => Err(format!("unknown memory type: {other}")),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct MemoryEntry {
    pub key: String,
    pub value: JsonValue,
    pub memory_type: MemoryScope,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    #[serde(default)]
    pub metadata: JsonValue,
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct MemoryFile {
    #[serde(default)]
    entries: HashMap<String, MemoryEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_updated: Option<String>,
}

/// Key-value memory in three scopes: persistent user memory
/// (`data/memory/user.json`), persistent per-project memory
/// (`data/memory/projects/<uuid>.json`) and volatile session memory.
/// Persistent files are encrypted whenever the master key is set and are
/// `ENC:`-sniffed on read. Mutations are audited.
pub struct MemoryStore {
    user_path: PathBuf,
    projects_dir: PathBuf,
    session: Mutex<HashMap<String, MemoryEntry>>,
    crypto: Arc<CryptoService>,
    audit: Arc<AuditLog>,
}

impl MemoryStore {
    pub fn new(home: &NimbusHome, crypto: Arc<CryptoService>, audit: Arc<AuditLog>) -> Result<Self> {
        Ok(Self {
            user_path: home.memory_dir()?.join("user.json"),
            projects_dir: home.project_memory_dir()?,
            session: Mutex::new(HashMap::new()),
            crypto,
            audit,
        })
    }

    pub fn save(
        &self,
        scope: MemoryScope,
        key: &str,
        value: JsonValue,
        project_id: Option<&str>,
        metadata: Option<JsonValue>,
    ) -> Result<()> {
        if scope == MemoryScope::Project && project_id.is_none() {
            return Err(CoreErr::InvalidInput(
                "project memory requires a project_id".into(),
            ));
        }
        let now = now_rfc3339();
        let entry = MemoryEntry {
            key: key.to_string(),
            value,
            memory_type: scope,
            project_id: project_id.map(str::to_string),
            created_at: now.clone(),
            updated_at: now,
            metadata: metadata.unwrap_or_else(|| json!({})),
        };

        match scope {
            MemoryScope::Session => {
                self.lock_session().insert(key.to_string(), entry);
            }
            MemoryScope::User | MemoryScope::Project => {
                let path = self.file_for(scope, project_id);
                let mut file = self.load_file(&path)?;
                let created_at = file
                    .entries
                    .get(key)
                    .map(|existing| existing.created_at.clone());
                let mut entry = entry;
                if let Some(created_at) = created_at {
                    entry.created_at = created_at;
                }
                file.entries.insert(key.to_string(), entry);
                file.last_updated = Some(now_rfc3339());
                self.write_file(&path, &file)?;
            }
        }

        self.audit.log(
            ActionType::MemoryWrite,
            json!({"memory_type": scope, "key": key, "project_id": project_id}),
        );
        Ok(())
    }

    pub fn get(
        &self,
        scope: MemoryScope,
        key: &str,
        project_id: Option<&str>,
    ) -> Result<Option<JsonValue>> {
        match scope {
            MemoryScope::Session => Ok(self.lock_session().get(key).map(|e| e.value.clone())),
            MemoryScope::User | MemoryScope::Project => {
                if scope == MemoryScope::Project && project_id.is_none() {
                    return Ok(None);
                }
                let file = self.load_file(&self.file_for(scope, project_id))?;
                Ok(file.entries.get(key).map(|e| e.value.clone()))
            }
        }
    }

    /// Entry metadata without values (keys are listable without exposing
    /// stored content).
    pub fn list(&self, scope: MemoryScope, project_id: Option<&str>) -> Result<Vec<JsonValue>> {
        let strip = |entry: &MemoryEntry| {
            json!({
                "key": entry.key,
                "memory_type": entry.memory_type,
                "project_id": entry.project_id,
                "created_at": entry.created_at,
                "updated_at": entry.updated_at,
                "metadata": entry.metadata,
            })
        };
        match scope {
            MemoryScope::Session => Ok(self.lock_session().values().map(strip).collect()),
            MemoryScope::User | MemoryScope::Project => {
                if scope == MemoryScope::Project && project_id.is_none() {
                    return Ok(Vec::new());
                }
                let file = self.load_file(&self.file_for(scope, project_id))?;
                Ok(file.entries.values().map(strip).collect())
            }
        }
    }

    pub fn delete(&self, scope: MemoryScope, key: &str, project_id: Option<&str>) -> Result<bool> {
        let removed = match scope {
            MemoryScope::Session => self.lock_session().remove(key).is_some(),
            MemoryScope::User | MemoryScope::Project => {
                if scope == MemoryScope::Project && project_id.is_none() {
                    return Ok(false);
                }
                let path = self.file_for(scope, project_id);
                let mut file = self.load_file(&path)?;
                let removed = file.entries.remove(key).is_some();
                if removed {
                    file.last_updated = Some(now_rfc3339());
                    self.write_file(&path, &file)?;
                }
                removed
            }
        };
        if removed {
            self.audit.log(
                ActionType::MemoryDelete,
                json!({"memory_type": scope, "key": key, "project_id": project_id}),
            );
        }
        Ok(removed)
    }

    pub fn clear_session(&self) -> usize {
        let mut session = self.lock_session();
        let count = session.len();
        session.clear();
        self.audit.log(
            ActionType::MemoryDelete,
            json!({"memory_type": "session", "action": "clear_all", "count": count}),
        );
        count
    }

    /// Removes a project's whole memory file (project deletion path).
    pub fn delete_project_file(&self, project_id: &str) -> Result<bool> {
        let path = self.projects_dir.join(format!("{project_id}.json"));
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn file_for(&self, scope: MemoryScope, project_id: Option<&str>) -> PathBuf {
        match scope {
            MemoryScope::User | MemoryScope::Session => self.user_path.clone(),
            MemoryScope::Project => self
                .projects_dir
                .join(format!("{}.json", project_id.unwrap_or_default())),
        }
    }

    fn load_file(&self, path: &PathBuf) -> Result<MemoryFile> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(MemoryFile::default());
            }
            Err(e) => return Err(e.into()),
        };
        if content.trim().is_empty() {
            return Ok(MemoryFile::default());
        }
        let envelope = Envelope::sniff(&content);
        if envelope.is_encrypted() && !self.crypto.has_key() {
            return Err(CoreErr::EncryptedWithoutKey);
        }
        Ok(serde_json::from_str(&envelope.open(&self.crypto, None)?)?)
    }

    fn write_file(&self, path: &PathBuf, file: &MemoryFile) -> Result<()> {
        let json = serde_json::to_string_pretty(file)?;
        let on_disk = if self.crypto.has_key() {
            self.crypto.seal(&json, None)?
        } else {
            json
        };
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, on_disk)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    fn lock_session(&self) -> std::sync::MutexGuard<'_, HashMap<String, MemoryEntry>> {
        match self.session.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
