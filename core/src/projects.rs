use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value as JsonValue;
use serde_json::json;
use tracing::warn;

use crate::ActionType;
use crate::AuditLog;
use crate::ChatHistoryStore;
use crate::CoreErr;
use crate::CryptoService;
use crate::Envelope;
use crate::MemoryStore;
use crate::NimbusHome;
use crate::Result;
use crate::config::now_rfc3339;

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProjectRepo {
    pub path: String,
    pub attached_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis: Option<JsonValue>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ProjectPermissions {
    #[serde(default = "default_true")]
    pub read: bool,
    #[serde(default)]
    pub write: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom: Option<JsonValue>,
}

impl Default for ProjectPermissions {
    fn default() -> Self {
        Self {
            read: true,
            write: false,
            custom: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProjectSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
    #[serde(default = "default_true")]
    pub auto_load_repo: bool,
    #[serde(default = "default_context_mode")]
    pub context_mode: String,
}

impl Default for ProjectSettings {
    fn default() -> Self {
        Self {
            default_model: None,
            auto_load_repo: true,
            context_mode: default_context_mode(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_context_mode() -> String {
    "safe".to_string()
}

/// A project is the logical container linking repositories, project-scoped
/// memory keys and conversations.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope_path: Option<String>,
    #[serde(default)]
    pub repos: Vec<ProjectRepo>,
    #[serde(default)]
    pub memory_keys: Vec<String>,
    #[serde(default)]
    pub permissions: ProjectPermissions,
    pub created_at: String,
    pub updated_at: String,
    pub last_accessed_at: String,
    #[serde(default)]
    pub settings: ProjectSettings,
    #[serde(default)]
    pub conversation_count: usize,
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct ProjectsFile {
    #[serde(default)]
    projects: Vec<Project>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_updated: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    version: Option<String>,
}

const ORPHAN_NAME: &str = "Orphan Projects";

/// Projects persisted as one `projects.json` document (ENC:-aware like the
/// other stores).
pub struct ProjectStore {
    file: PathBuf,
    crypto: Arc<CryptoService>,
    audit: Arc<AuditLog>,
}

impl ProjectStore {
    pub fn new(home: &NimbusHome, crypto: Arc<CryptoService>, audit: Arc<AuditLog>) -> Result<Self> {
        Ok(Self {
            file: home.projects_dir()?.join("projects.json"),
            crypto,
            audit,
        })
    }

    /// All projects, most recently accessed first, with live conversation
    /// counts resolved against the history store.
    pub fn list(&self, history: &ChatHistoryStore) -> Vec<Project> {
        let mut projects = self.load().unwrap_or_else(|e| {
            warn!("projects: load failed: {e}");
            Vec::new()
        });
        for project in &mut projects {
            project.conversation_count = history.count_by_project(&project.id);
        }
        projects.sort_by(|a, b| b.last_accessed_at.cmp(&a.last_accessed_at));
        projects
    }

    /// Fetches one project and touches its `lastAccessedAt`.
    pub fn get(&self, project_id: &str) -> Result<Option<Project>> {
        let mut projects = self.load()?;
        let Some(project) = projects.iter_mut().find(|p| p.id == project_id) else {
            return Ok(None);
        };
        project.last_accessed_at = now_rfc3339();
        let found = project.clone();
        self.save(projects)?;
        Ok(Some(found))
    }

    pub fn create(
        &self,
        name: &str,
        description: Option<String>,
        scope_path: Option<String>,
        permissions: Option<ProjectPermissions>,
    ) -> Result<Project> {
        let now = now_rfc3339();
        let project = Project {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            description,
            scope_path,
            repos: Vec::new(),
            memory_keys: Vec::new(),
            permissions: permissions.unwrap_or_default(),
            created_at: now.clone(),
            updated_at: now.clone(),
            last_accessed_at: now,
            settings: ProjectSettings::default(),
            conversation_count: 0,
        };
        let mut projects = self.load()?;
        projects.push(project.clone());
        self.save(projects)?;
        self.audit.log(
            ActionType::PermissionGranted,
            json!({"action": "project_created", "project_id": project.id, "project_name": project.name}),
        );
        Ok(project)
    }

    /// Field-wise merge of host-supplied updates.
    pub fn update(&self, project_id: &str, updates: &JsonValue) -> Result<Option<Project>> {
        let mut projects = self.load()?;
        let Some(project) = projects.iter_mut().find(|p| p.id == project_id) else {
            return Ok(None);
        };

        if let Some(name) = updates.get("name").and_then(JsonValue::as_str) {
            project.name = name.to_string();
        }
        if let Some(v) = updates.get("description") {
            project.description = v.as_str().map(str::to_string);
        }
        if let Some(v) = updates.get("scopePath") {
            project.scope_path = v.as_str().map(str::to_string);
        }
        if let Some(repos) = updates.get("repos") {
            project.repos = serde_json::from_value(repos.clone())?;
        }
        if let Some(keys) = updates.get("memoryKeys") {
            project.memory_keys = serde_json::from_value(keys.clone()).unwrap_or_default();
        }
        if let Some(perms) = updates.get("permissions").and_then(JsonValue::as_object) {
            if let Some(read) = perms.get("read").and_then(JsonValue::as_bool) {
                project.permissions.read = read;
            }
            if let Some(write) = perms.get("write").and_then(JsonValue::as_bool) {
                project.permissions.write = write;
            }
            if let Some(custom) = perms.get("custom") {
                project.permissions.custom = Some(custom.clone());
            }
        }
        if let Some(settings) = updates.get("settings").and_then(JsonValue::as_object) {
            if let Some(v) = settings.get("defaultModel") {
                project.settings.default_model = v.as_str().map(str::to_string);
            }
            if let Some(v) = settings.get("autoLoadRepo").and_then(JsonValue::as_bool) {
                project.settings.auto_load_repo = v;
            }
            if let Some(v) = settings.get("contextMode").and_then(JsonValue::as_str) {
                project.settings.context_mode = v.to_string();
            }
        }
        if let Some(v) = updates.get("lastAccessedAt").and_then(JsonValue::as_str) {
            project.last_accessed_at = v.to_string();
        }
        project.updated_at = now_rfc3339();

        let updated = project.clone();
        self.save(projects)?;
        Ok(Some(updated))
    }

    /// Deletes a project, removes its memory file and orphans its
    /// conversations. Conversations themselves are never deleted here.
    pub fn delete(
        &self,
        project_id: &str,
        memory: &MemoryStore,
        history: &ChatHistoryStore,
    ) -> Result<bool> {
        let mut projects = self.load()?;
        let Some(pos) = projects.iter().position(|p| p.id == project_id) else {
            return Ok(false);
        };
        let removed = projects.remove(pos);
        self.save(projects)?;

        if let Err(e) = memory.delete_project_file(project_id) {
            warn!("projects: could not delete memory for {project_id}: {e}");
        }
        for conv in history.list_by_project(project_id) {
            if let Err(e) = history.update_project(&conv.id, None) {
                warn!("projects: could not orphan conversation {}: {e}", conv.id);
            }
        }

        self.audit.log(
            ActionType::PermissionDenied,
            json!({"action": "project_deleted", "project_id": project_id, "project_name": removed.name}),
        );
        Ok(true)
    }

    pub fn add_repo(
        &self,
        project_id: &str,
        repo_path: &str,
        analysis: Option<JsonValue>,
    ) -> Result<Option<Project>> {
        let mut projects = self.load()?;
        let Some(project) = projects.iter_mut().find(|p| p.id == project_id) else {
            return Ok(None);
        };
        match project.repos.iter_mut().find(|r| r.path == repo_path) {
            Some(existing) => {
                if analysis.is_some() {
                    existing.analysis = analysis;
                    existing.attached_at = now_rfc3339();
                }
            }
            None => project.repos.push(ProjectRepo {
                path: repo_path.to_string(),
                attached_at: now_rfc3339(),
                analysis,
            }),
        }
        project.updated_at = now_rfc3339();
        let updated = project.clone();
        self.save(projects)?;
        Ok(Some(updated))
    }

    pub fn remove_repo(&self, project_id: &str, repo_path: &str) -> Result<Option<Project>> {
        let mut projects = self.load()?;
        let Some(project) = projects.iter_mut().find(|p| p.id == project_id) else {
            return Ok(None);
        };
        project.repos.retain(|r| r.path != repo_path);
        project.updated_at = now_rfc3339();
        let updated = project.clone();
        self.save(projects)?;
        Ok(Some(updated))
    }

    /// Well-known container for conversations without a project.
    pub fn get_or_create_orphan(&self) -> Result<Project> {
        let projects = self.load()?;
        if let Some(existing) = projects.into_iter().find(|p| p.name == ORPHAN_NAME) {
            return Ok(existing);
        }
        self.create(
            ORPHAN_NAME,
            Some("Automatic project for conversations without a project".to_string()),
            None,
            Some(ProjectPermissions {
                read: true,
                write: false,
                custom: None,
            }),
        )
    }

    fn load(&self) -> Result<Vec<Project>> {
        let content = match fs::read_to_string(&self.file) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }
        let envelope = Envelope::sniff(&content);
        if envelope.is_encrypted() && !self.crypto.has_key() {
            return Err(CoreErr::EncryptedWithoutKey);
        }
        let file: ProjectsFile = serde_json::from_str(&envelope.open(&self.crypto, None)?)?;
        Ok(file.projects)
    }

    fn save(&self, projects: Vec<Project>) -> Result<()> {
        let file = ProjectsFile {
            projects,
            last_updated: Some(now_rfc3339()),
            version: Some("2.1".to_string()),
        };
        let json = serde_json::to_string_pretty(&file)?;
        let on_disk = if self.crypto.has_key() {
            self.crypto.seal(&json, None)?
        } else {
            json
        };
        let tmp = self.file.with_extension("json.tmp");
        fs::write(&tmp, on_disk)?;
        fs::rename(&tmp, &self.file)?;
        Ok(())
    }
}
