use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value as JsonValue;
use serde_json::json;

use nimbus_protocol::ChatMessage;
use nimbus_protocol::Role;

use crate::ActionType;
use crate::AuditLog;
use crate::config::now_rfc3339;

const PROMPT_VERSION: &str = "2.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentType {
    System,
    Memory,
    Context,
    User,
    Assistant,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct PromptComponent {
    #[serde(rename = "type")]
    pub component_type: ComponentType,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<JsonValue>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct PromptMessage {
    pub role: String,
    pub content: String,
}

/// Versioned structured prompt: typed components in order, with a UUID and
/// creation timestamp for audit correlation.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Prompt {
    pub version: String,
    pub prompt_id: String,
    pub created_at: String,
    pub components: Vec<PromptComponent>,
}

impl Prompt {
    /// Message-array rendering for a chat model. System, context and memory
    /// components fold into system messages; history and the current turn
    /// keep their roles.
    pub fn to_messages(&self) -> Vec<PromptMessage> {
        let mut messages = Vec::new();

        let joined = |kind: ComponentType| -> Vec<&str> {
            self.components
                .iter()
                .filter(|c| c.component_type == kind)
                .map(|c| c.content.as_str())
                .collect()
        };

        let system_parts = joined(ComponentType::System);
        if !system_parts.is_empty() {
            messages.push(PromptMessage {
                role: "system".to_string(),
                content: system_parts.join("\n\n"),
            });
        }
        let context_parts = joined(ComponentType::Context);
        if !context_parts.is_empty() {
            messages.push(PromptMessage {
                role: "system".to_string(),
                content: format!("--- CONTEXT ---\n\n{}", context_parts.join("\n\n---\n\n")),
            });
        }
        let memory_parts = joined(ComponentType::Memory);
        if !memory_parts.is_empty() {
            messages.push(PromptMessage {
                role: "system".to_string(),
                content: format!("--- MEMORY ---\n\n{}", memory_parts.join("\n\n")),
            });
        }
        for component in &self.components {
            let role = match component.component_type {
                ComponentType::User => "user",
                ComponentType::Assistant => "assistant",
                _ => continue,
            };
            messages.push(PromptMessage {
                role: role.to_string(),
                content: component.content.clone(),
            });
        }
        messages
    }

    /// Flat rendering for the host's prompt preview.
    pub fn to_display_string(&self) -> String {
        let mut parts = vec![format!(
            "=== PROMPT V{} ({}) ===\n",
            self.version, self.created_at
        )];
        for component in &self.components {
            let kind = match component.component_type {
                ComponentType::System => "SYSTEM",
                ComponentType::Memory => "MEMORY",
                ComponentType::Context => "CONTEXT",
                ComponentType::User => "USER",
                ComponentType::Assistant => "ASSISTANT",
            };
            parts.push(format!("\n--- {kind} ---"));
            if let Some(metadata) = &component.metadata {
                parts.push(format!("[Metadata: {metadata}]"));
            }
            parts.push(component.content.clone());
            parts.push(String::new());
        }
        parts.join("\n")
    }

    pub fn structured(&self) -> JsonValue {
        serde_json::to_value(self).unwrap_or_else(|_| json!({}))
    }
}

/// Inputs assembled by the chat handler.
#[derive(Debug, Clone, Default)]
pub struct PromptInputs {
    pub user_message: String,
    pub chat_history: Vec<ChatMessage>,
    /// `(path, content)` bundles.
    pub context_files: Vec<(String, String)>,
    /// `(key, value)` pairs, already resolved across scopes.
    pub memory_entries: Vec<(String, String)>,
    pub repo_context: Option<JsonValue>,
    pub web_context: Option<String>,
    pub system_rules: Option<String>,
    pub language: String,
}

/// Builds structured prompts and logs metadata (never content) for audit.
pub struct PromptBuilder {
    audit: Arc<AuditLog>,
}

impl PromptBuilder {
    pub fn new(audit: Arc<AuditLog>) -> Self {
        Self { audit }
    }

    pub fn build(&self, inputs: &PromptInputs) -> Prompt {
        let mut components = Vec::new();

        let system_content = inputs
            .system_rules
            .clone()
            .unwrap_or_else(|| default_system_prompt(&inputs.language).to_string());
        components.push(PromptComponent {
            component_type: ComponentType::System,
            content: system_content,
            metadata: Some(json!({"language": inputs.language})),
        });

        if !inputs.memory_entries.is_empty() {
            let memory_text = inputs
                .memory_entries
                .iter()
                .map(|(key, value)| format!("[{key}]: {value}"))
                .collect::<Vec<_>>()
                .join("\n");
            components.push(PromptComponent {
                component_type: ComponentType::Memory,
                content: memory_text,
                metadata: Some(json!({"count": inputs.memory_entries.len()})),
            });
        }

        if let Some(repo) = &inputs.repo_context {
            components.push(PromptComponent {
                component_type: ComponentType::Context,
                content: format_repo_context(repo),
                metadata: Some(json!({"type": "repository"})),
            });
        }

        if let Some(web) = &inputs.web_context {
            components.push(PromptComponent {
                component_type: ComponentType::Context,
                content: format!("=== WEB RESULTS ===\n{web}"),
                metadata: Some(json!({"type": "web"})),
            });
        }

        if !inputs.context_files.is_empty() {
            let files_text = inputs
                .context_files
                .iter()
                .map(|(path, content)| format!("=== {path} ===\n{content}\n"))
                .collect::<Vec<_>>()
                .join("\n");
            let paths: Vec<&String> = inputs.context_files.iter().map(|(p, _)| p).collect();
            components.push(PromptComponent {
                component_type: ComponentType::Context,
                content: files_text,
                metadata: Some(json!({"files": paths, "count": paths.len()})),
            });
        }

        for message in &inputs.chat_history {
            let component_type = match message.role {
                Role::User => ComponentType::User,
                Role::Assistant => ComponentType::Assistant,
                Role::System => continue,
            };
            components.push(PromptComponent {
                component_type,
                content: message.content.clone(),
                metadata: Some(json!({"timestamp": message.timestamp})),
            });
        }

        components.push(PromptComponent {
            component_type: ComponentType::User,
            content: inputs.user_message.clone(),
            metadata: Some(json!({"timestamp": now_rfc3339()})),
        });

        let prompt = Prompt {
            version: PROMPT_VERSION.to_string(),
            prompt_id: uuid::Uuid::new_v4().to_string(),
            created_at: now_rfc3339(),
            components,
        };
        self.log_metadata(&prompt);
        prompt
    }

    // Metadata only: component types and sizes, never content.
    fn log_metadata(&self, prompt: &Prompt) {
        let components: Vec<JsonValue> = prompt
            .components
            .iter()
            .map(|c| {
                json!({
                    "type": c.component_type,
                    "metadata": c.metadata.clone().unwrap_or_else(|| json!({})),
                    "content_length": c.content.len(),
                })
            })
            .collect();
        self.audit.log(
            ActionType::PromptSent,
            json!({
                "prompt_id": prompt.prompt_id,
                "version": prompt.version,
                "created_at": prompt.created_at,
                "components_count": prompt.components.len(),
                "components_metadata": components,
            }),
        );
    }
}

fn default_system_prompt(language: &str) -> &'static str {
    match language {
        "fr" => {
            "Tu es un assistant IA utile et amical. Tu dois TOUJOURS répondre en français.\n\n\
             RÈGLES IMPORTANTES:\n\
             - Tu es en mode \"assistant sécurisé\" : tu ne peux que SUGGÉRER, jamais EXÉCUTER\n\
             - Pour toute modification de fichier, tu dois fournir un DIFF explicite\n\
             - Tu ne dois jamais proposer d'exécuter des commandes système sans validation utilisateur\n\
             - Si tu ne connais pas quelque chose, dis-le clairement\n\
             - Sois concis et précis dans tes réponses"
        }
        _ => {
            "You are a helpful and friendly AI assistant. You must ALWAYS respond in English.\n\n\
             IMPORTANT RULES:\n\
             - You are in \"secure assistant mode\": you can only SUGGEST, never EXECUTE\n\
             - For any file modification, you must provide an explicit DIFF\n\
             - You must never propose to execute system commands without user validation\n\
             - If you don't know something, say so clearly\n\
             - Be concise and precise in your answers"
        }
    }
}

fn format_repo_context(repo: &JsonValue) -> String {
    let mut parts = vec!["=== REPOSITORY CONTEXT ===".to_string()];
    if let Some(summary) = repo.get("summary").and_then(JsonValue::as_str) {
        parts.push(summary.to_string());
    }
    if let Some(languages) = repo
        .get("stack")
        .and_then(|s| s.get("languages"))
        .and_then(JsonValue::as_object)
    {
        parts.push("\nDetected languages:".to_string());
        for (language, count) in languages {
            parts.push(format!("  - {language}: {count} files"));
        }
    }
    if let Some(frameworks) = repo
        .get("stack")
        .and_then(|s| s.get("frameworks"))
        .and_then(JsonValue::as_array)
    {
        let names: Vec<&str> = frameworks.iter().filter_map(JsonValue::as_str).collect();
        if !names.is_empty() {
            parts.push(format!("\nFrameworks: {}", names.join(", ")));
        }
    }
    parts.join("\n")
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::NimbusHome;
    use pretty_assertions::assert_eq;

    fn builder() -> (tempfile::TempDir, PromptBuilder) {
        let tmp = tempfile::tempdir().unwrap();
        let audit = Arc::new(AuditLog::new(&NimbusHome::with_root(tmp.path())).unwrap());
        (tmp, PromptBuilder::new(audit))
    }

    #[test]
    fn components_appear_in_order() {
        let (_tmp, builder) = builder();
        let prompt = builder.build(&PromptInputs {
            user_message: "what now?".to_string(),
            chat_history: vec![
                ChatMessage {
                    role: Role::User,
                    content: "earlier question".to_string(),
                    timestamp: "2026-01-01T00:00:00Z".to_string(),
                },
                ChatMessage {
                    role: Role::Assistant,
                    content: "earlier answer".to_string(),
                    timestamp: "2026-01-01T00:00:01Z".to_string(),
                },
            ],
            memory_entries: vec![("editor".to_string(), "helix".to_string())],
            context_files: vec![("src/main.rs".to_string(), "fn main() {}".to_string())],
            language: "en".to_string(),
            ..Default::default()
        });

        let kinds: Vec<ComponentType> = prompt
            .components
            .iter()
            .map(|c| c.component_type)
            .collect();
        assert_eq!(
            kinds,
            vec![
                ComponentType::System,
                ComponentType::Memory,
                ComponentType::Context,
                ComponentType::User,
                ComponentType::Assistant,
                ComponentType::User,
            ]
        );
        assert!(prompt.components[2].content.contains("=== src/main.rs ==="));
        assert!(!prompt.prompt_id.is_empty());
    }

    #[test]
    fn message_rendering_folds_context_into_system() {
        let (_tmp, builder) = builder();
        let prompt = builder.build(&PromptInputs {
            user_message: "hi".to_string(),
            web_context: Some("Title: x".to_string()),
            language: "en".to_string(),
            ..Default::default()
        });
        let messages = prompt.to_messages();
        assert_eq!(messages[0].role, "system");
        assert_eq!(messages[1].role, "system");
        assert!(messages[1].content.contains("WEB RESULTS"));
        assert_eq!(messages.last().unwrap().role, "user");
        assert_eq!(messages.last().unwrap().content, "hi");
    }

    #[test]
    fn french_language_picks_french_preamble() {
        let (_tmp, builder) = builder();
        let prompt = builder.build(&PromptInputs {
            user_message: "salut".to_string(),
            language: "fr".to_string(),
            ..Default::default()
        });
        assert!(prompt.components[0].content.contains("français"));
    }

    #[test]
    fn display_string_contains_every_section() {
        let (_tmp, builder) = builder();
        let prompt = builder.build(&PromptInputs {
            user_message: "q".to_string(),
            memory_entries: vec![("k".to_string(), "v".to_string())],
            language: "en".to_string(),
            ..Default::default()
        });
        let display = prompt.to_display_string();
        assert!(display.contains("--- SYSTEM ---"));
        assert!(display.contains("--- MEMORY ---"));
        assert!(display.contains("[k]: v"));
    }
}
