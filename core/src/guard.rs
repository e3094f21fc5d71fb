use std::collections::HashSet;
use std::sync::RwLock;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use tracing::warn;

use nimbus_protocol::Permission;

/// Commands runnable without any grant.
const ALWAYS_ALLOWED: &[&str] = &[
    "health_check",
    "shutdown",
    "cancel_chat",
    "get_system_stats",
    "get_monitoring",
    "load_settings",
    "save_settings",
    "web_search_available",
    "pull",
    "get_models",
    "delete_model",
    "airllm_list_models",
    "airllm_status",
    "airllm_enable",
    "airllm_reload",
    "airllm_disable",
    "airllm_set_active_model",
    "list_conversations",
    "get_conversation_messages",
    "get_conversation_metadata",
    "delete_conversation",
    "chat_history_set_crypto_password",
    "chat",
    "memory_get",
    "memory_list",
    "memory_clear_session",
    "memory_set_crypto_password",
    "grant_permission",
    "revoke_permission",
    "has_permission",
    "rate_limiter_is_blocked",
    "rate_limiter_get_blocked",
    "rate_limiter_set_limit",
    "rate_limiter_get_limits",
    "rate_limiter_reset",
    "rate_limiter_get_stats",
    "update_conversation_project",
    "projects_list",
    "projects_get",
    "projects_create",
    "projects_update",
    "projects_delete",
    "projects_remove_repo",
    "projects_get_or_create_orphan",
    "get_repo_summary",
    "detect_tech_debt",
    "tunnel_check_cloudflared",
    "tunnel_install_cloudflared",
    "tunnel_install_progress",
    "tunnel_get_status",
    "tunnel_generate_token",
    "tunnel_get_qr",
    "tunnel_get_qr_with_token",
    "tunnel_validate_token",
    "tunnel_validate_custom_token",
    "tunnel_set_custom_token",
    "tunnel_add_allowed_ip",
    "tunnel_remove_allowed_ip",
    "tunnel_set_named_tunnel",
];

/// Sensitive commands and the grant each one requires.
const REQUIRED_PERMISSIONS: &[(&str, Permission)] = &[
    ("analyze_repository", Permission::RepoAnalyze),
    ("projects_add_repo", Permission::RepoAnalyze),
    ("memory_save", Permission::MemoryAccess),
    ("memory_delete", Permission::MemoryAccess),
    ("tunnel_start", Permission::RemoteAccess),
    ("tunnel_stop", Permission::RemoteAccess),
    ("set_startup", Permission::CommandExecute),
];

/// The permission a command requires, if any.
pub fn required_permission(cmd: &str) -> Option<Permission> {
    REQUIRED_PERMISSIONS
        .iter()
        .find(|(name, _)| *name == cmd)
        .map(|(_, p)| *p)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardDecision {
    Allowed,
    Denied { reason: String },
}

/// Process-wide permission guard. A command is allowed iff it is
/// whitelisted, or its required permission is currently granted. Any name
/// in neither table is denied.
pub struct PermissionGuard {
    enabled: AtomicBool,
    granted: RwLock<HashSet<Permission>>,
}

impl Default for PermissionGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl PermissionGuard {
    pub fn new() -> Self {
        Self {
            enabled: AtomicBool::new(true),
            granted: RwLock::new(HashSet::new()),
        }
    }

    pub fn check(&self, cmd: &str) -> GuardDecision {
        if !self.enabled.load(Ordering::Relaxed) {
            warn!("permission guard is DISABLED - all commands allowed!");
            return GuardDecision::Allowed;
        }
        if ALWAYS_ALLOWED.contains(&cmd) {
            return GuardDecision::Allowed;
        }
        match required_permission(cmd) {
            Some(permission) => {
                if self.has(permission) {
                    GuardDecision::Allowed
                } else {
                    GuardDecision::Denied {
                        reason: format!("command '{cmd}' requires permission {permission}"),
                    }
                }
            }
            // Unknown command: deny by default.
            None => GuardDecision::Denied {
                reason: format!("unknown command '{cmd}' denied by default"),
            },
        }
    }

    pub fn grant(&self, permission: Permission) {
        self.write_granted().insert(permission);
    }

    pub fn revoke(&self, permission: Permission) -> bool {
        self.write_granted().remove(&permission)
    }

    pub fn has(&self, permission: Permission) -> bool {
        match self.granted.read() {
            Ok(guard) => guard.contains(&permission),
            Err(poisoned) => poisoned.into_inner().contains(&permission),
        }
    }

    pub fn granted(&self) -> Vec<Permission> {
        match self.granted.read() {
            Ok(guard) => guard.iter().copied().collect(),
            Err(poisoned) => poisoned.into_inner().iter().copied().collect(),
        }
    }

    /// Debug escape hatch. Never ship a build that calls this.
    pub fn disable(&self) {
        warn!("permission guard DISABLED - every command will be allowed");
        self.enabled.store(false, Ordering::Relaxed);
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Relaxed);
    }

    fn write_granted(&self) -> std::sync::RwLockWriteGuard<'_, HashSet<Permission>> {
        match self.granted.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
