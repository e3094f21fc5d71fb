use std::sync::Arc;
use std::sync::Mutex;

use tokio_util::sync::CancellationToken;

use nimbus_airllm::AirLlmSupervisor;
use nimbus_airllm::SidecarConfig;
use nimbus_core::AuditLog;
use nimbus_core::ChatHistoryStore;
use nimbus_core::CryptoService;
use nimbus_core::LicenseService;
use nimbus_core::MemoryStore;
use nimbus_core::Monitor;
use nimbus_core::NimbusHome;
use nimbus_core::PermissionGuard;
use nimbus_core::ProjectStore;
use nimbus_core::PromptBuilder;
use nimbus_core::RateLimiter;
use nimbus_core::SearchClient;
use nimbus_core::SettingsStore;
use nimbus_ollama::OllamaClient;
use nimbus_remote::RemoteAccessService;

/// The currently streaming chat, if any, with its cancellation token.
pub struct ActiveChat {
    pub chat_id: String,
    pub cancel: CancellationToken,
}

/// Single handle threaded through the dispatcher and every handler. All
/// shared state lives here behind its own lock; there are no globals.
pub struct WorkerContext {
    pub home: NimbusHome,
    pub crypto: Arc<CryptoService>,
    pub audit: Arc<AuditLog>,
    pub monitor: Arc<Monitor>,
    pub guard: Arc<PermissionGuard>,
    pub rate: Arc<RateLimiter>,
    pub settings: Arc<SettingsStore>,
    pub history: Arc<ChatHistoryStore>,
    pub memory: Arc<MemoryStore>,
    pub projects: Arc<ProjectStore>,
    pub prompts: Arc<PromptBuilder>,
    pub search: Arc<SearchClient>,
    pub license: Arc<LicenseService>,
    pub ollama: Arc<OllamaClient>,
    pub airllm: Arc<AirLlmSupervisor>,
    pub remote: Arc<RemoteAccessService>,
    pub active_chat: Mutex<Option<ActiveChat>>,
    pub shutdown: CancellationToken,
}

impl WorkerContext {
    pub fn new(home: NimbusHome) -> nimbus_core::Result<Arc<Self>> {
        let crypto = Arc::new(CryptoService::new(&home)?);
        let audit = Arc::new(AuditLog::new(&home)?);
        let history = Arc::new(ChatHistoryStore::new(&home, Arc::clone(&crypto))?);
        let memory = Arc::new(MemoryStore::new(&home, Arc::clone(&crypto), Arc::clone(&audit))?);
        let projects = Arc::new(ProjectStore::new(
            &home,
            Arc::clone(&crypto),
            Arc::clone(&audit),
        )?);
        let remote = Arc::new(RemoteAccessService::new(
            &home,
            Arc::clone(&crypto),
            Arc::clone(&audit),
        )?);

        Ok(Arc::new(Self {
            crypto: Arc::clone(&crypto),
            monitor: Arc::new(Monitor::new()),
            guard: Arc::new(PermissionGuard::new()),
            rate: Arc::new(RateLimiter::new()),
            settings: Arc::new(SettingsStore::new(&home)?),
            prompts: Arc::new(PromptBuilder::new(Arc::clone(&audit))),
            search: Arc::new(SearchClient::new()),
            license: Arc::new(LicenseService::new()),
            ollama: Arc::new(OllamaClient::new()),
            airllm: Arc::new(AirLlmSupervisor::new(SidecarConfig::default())),
            audit,
            history,
            memory,
            projects,
            remote,
            active_chat: Mutex::new(None),
            shutdown: CancellationToken::new(),
            home,
        }))
    }

    /// Registers `chat_id` as the active chat, replacing any previous one,
    /// and returns its cancellation token.
    pub fn register_active_chat(&self, chat_id: &str) -> CancellationToken {
        let cancel = CancellationToken::new();
        *self.lock_active_chat() = Some(ActiveChat {
            chat_id: chat_id.to_string(),
            cancel: cancel.clone(),
        });
        cancel
    }

    /// Raises the cancel flag when `chat_id` matches the active chat.
    pub fn cancel_chat(&self, chat_id: &str) -> bool {
        let guard = self.lock_active_chat();
        match guard.as_ref() {
            Some(active) if active.chat_id == chat_id => {
                active.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    /// Cancels whatever chat is active; used on shutdown.
    pub fn cancel_active_chat(&self) {
        if let Some(active) = self.lock_active_chat().as_ref() {
            active.cancel.cancel();
        }
    }

    /// Clears the active-chat reference if it still belongs to `chat_id`.
    pub fn clear_active_chat(&self, chat_id: &str) {
        let mut guard = self.lock_active_chat();
        if guard.as_ref().is_some_and(|active| active.chat_id == chat_id) {
            *guard = None;
        }
    }

    fn lock_active_chat(&self) -> std::sync::MutexGuard<'_, Option<ActiveChat>> {
        match self.active_chat.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
