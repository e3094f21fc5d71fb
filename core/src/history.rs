use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::warn;

use nimbus_protocol::ChatMessage;
use nimbus_protocol::Conversation;
use nimbus_protocol::ConversationSummary;
use nimbus_protocol::Role;

use crate::CoreErr;
use crate::CryptoService;
use crate::Envelope;
use crate::NimbusHome;
use crate::Result;
use crate::config::now_rfc3339;

const TITLE_MAX_CHARS: usize = 40;

/// Parameters for [`ChatHistoryStore::save_message`].
#[derive(Debug, Clone, Default)]
pub struct SaveMessage {
    pub chat_id: Option<String>,
    pub role: Role,
    pub content: String,
    pub model: Option<String>,
    pub project_id: Option<String>,
    pub encrypt: bool,
}

/// Append-only per-chat JSON files under `data/history/`, optionally
/// envelope-encrypted. Every write replaces the whole file via a temp-file
/// rename so a reader never observes a half-written conversation.
pub struct ChatHistoryStore {
    dir: PathBuf,
    crypto: Arc<CryptoService>,
}

impl ChatHistoryStore {
    pub fn new(home: &NimbusHome, crypto: Arc<CryptoService>) -> Result<Self> {
        Ok(Self {
            dir: home.history_dir()?,
            crypto,
        })
    }

    /// Lists conversation metadata, newest activity first. Corrupted files
    /// are skipped with a warning; encrypted files are skipped entirely when
    /// the master key is absent.
    pub fn list(&self) -> Vec<ConversationSummary> {
        let mut out = Vec::new();
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("history: cannot read {}: {e}", self.dir.display());
                return out;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match self.read_conversation(&path) {
                Ok(Some((conv, encrypted))) => out.push(ConversationSummary {
                    id: conv.id,
                    title: conv.title,
                    model: conv.model,
                    project_id: conv.project_id,
                    created_at: conv.created_at,
                    updated_at: conv.updated_at,
                    message_count: conv.messages.len(),
                    encrypted,
                }),
                Ok(None) => {}
                Err(e) => warn!("history: skipping {}: {e}", path.display()),
            }
        }
        out.sort_by(|a, b| {
            let a_key = a.updated_at.as_deref().unwrap_or(&a.created_at);
            let b_key = b.updated_at.as_deref().unwrap_or(&b.created_at);
            b_key.cmp(a_key)
        });
        out
    }

    /// Messages of one conversation. Missing or undecryptable files yield an
    /// empty list, never an error: a wrong password surfaces as "no
    /// messages" on the UI side.
    pub fn get_messages(&self, chat_id: &str) -> Vec<ChatMessage> {
        match self.read_conversation(&self.path_for(chat_id)) {
            Ok(Some((conv, _))) => conv.messages,
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!("history: cannot read conversation {chat_id}: {e}");
                Vec::new()
            }
        }
    }

    pub fn get_metadata(&self, chat_id: &str) -> Option<ConversationSummary> {
        match self.read_conversation(&self.path_for(chat_id)) {
            Ok(Some((conv, encrypted))) => Some(ConversationSummary {
                id: conv.id,
                title: conv.title,
                model: conv.model,
                project_id: conv.project_id,
                created_at: conv.created_at,
                updated_at: conv.updated_at,
                message_count: conv.messages.len(),
                encrypted,
            }),
            _ => None,
        }
    }

    /// Appends a message, creating the conversation when `chat_id` is
    /// absent. Returns the (possibly new) chat id.
    ///
    /// An existing encrypted conversation stays encrypted; if the master key
    /// is unset at that moment the write is refused instead of silently
    /// downgrading to plaintext.
    pub fn save_message(&self, msg: SaveMessage) -> Result<String> {
        let chat_id = msg
            .chat_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let path = self.path_for(&chat_id);

        let (mut conv, mut encrypt) = match fs::read_to_string(&path) {
            Ok(content) => {
                let envelope = Envelope::sniff(&content);
                if envelope.is_encrypted() && !self.crypto.has_key() {
                    return Err(CoreErr::EncryptedWithoutKey);
                }
                let plaintext = envelope.open(&self.crypto, None)?;
                let conv: Conversation = serde_json::from_str(&plaintext)?;
                // Once encrypted, always encrypted.
                (conv, msg.encrypt || envelope.is_encrypted())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => (
                Conversation {
                    id: chat_id.clone(),
                    title: "New Chat".to_string(),
                    model: None,
                    project_id: None,
                    messages: Vec::new(),
                    created_at: now_rfc3339(),
                    updated_at: None,
                },
                msg.encrypt,
            ),
            Err(e) => return Err(e.into()),
        };

        if encrypt && !self.crypto.has_key() {
            return Err(CoreErr::EncryptedWithoutKey);
        }
        if conv.model.is_none() {
            conv.model = msg.model.clone();
        }
        if msg.project_id.is_some() {
            conv.project_id = msg.project_id.clone();
        }
        if msg.role == Role::User && (conv.title.is_empty() || conv.title == "New Chat") {
            conv.title = seed_title(&msg.content);
        }
        conv.messages.push(ChatMessage {
            role: msg.role,
            content: msg.content,
            timestamp: now_rfc3339(),
        });
        conv.updated_at = Some(now_rfc3339());

        if !self.crypto.has_key() {
            encrypt = false;
        }
        self.write_conversation(&conv, encrypt)?;
        Ok(chat_id)
    }

    pub fn delete(&self, chat_id: &str) -> Result<bool> {
        let path = self.path_for(chat_id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Re-links a conversation to a project (or detaches it with `None`).
    pub fn update_project(&self, chat_id: &str, project_id: Option<String>) -> Result<bool> {
        let path = self.path_for(chat_id);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        let envelope = Envelope::sniff(&content);
        if envelope.is_encrypted() && !self.crypto.has_key() {
            return Err(CoreErr::EncryptedWithoutKey);
        }
        let mut conv: Conversation = serde_json::from_str(&envelope.open(&self.crypto, None)?)?;
        conv.project_id = project_id;
        conv.updated_at = Some(now_rfc3339());
        self.write_conversation(&conv, envelope.is_encrypted())?;
        Ok(true)
    }

    pub fn count_by_project(&self, project_id: &str) -> usize {
        self.list()
            .into_iter()
            .filter(|c| c.project_id.as_deref() == Some(project_id))
            .count()
    }

    pub fn list_by_project(&self, project_id: &str) -> Vec<ConversationSummary> {
        self.list()
            .into_iter()
            .filter(|c| c.project_id.as_deref() == Some(project_id))
            .collect()
    }

    fn path_for(&self, chat_id: &str) -> PathBuf {
        self.dir.join(format!("{chat_id}.json"))
    }

    fn read_conversation(&self, path: &PathBuf) -> Result<Option<(Conversation, bool)>> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if content.trim().is_empty() {
            return Ok(None);
        }
        let envelope = Envelope::sniff(&content);
        if envelope.is_encrypted() && !self.crypto.has_key() {
            return Ok(None);
        }
        let plaintext = envelope.open(&self.crypto, None)?;
        let conv: Conversation = serde_json::from_str(&plaintext)?;
        Ok(Some((conv, envelope.is_encrypted())))
    }

    fn write_conversation(&self, conv: &Conversation, encrypt: bool) -> Result<()> {
        let json = serde_json::to_string_pretty(conv)?;
        let on_disk = if encrypt {
            self.crypto.seal(&json, None)?
        } else {
            json
        };
        let path = self.path_for(&conv.id);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, on_disk)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}

fn seed_title(content: &str) -> String {
    let mut title: String = content.chars().take(TITLE_MAX_CHARS).collect();
    if content.chars().count() > TITLE_MAX_CHARS {
        title.push_str("...");
    }
    title
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use pretty_assertions::assert_eq;

    fn store() -> (tempfile::TempDir, ChatHistoryStore, Arc<CryptoService>) {
        let tmp = tempfile::tempdir().unwrap();
        let home = NimbusHome::with_root(tmp.path());
        let crypto = Arc::new(CryptoService::new(&home).unwrap());
        let store = ChatHistoryStore::new(&home, Arc::clone(&crypto)).unwrap();
        (tmp, store, crypto)
    }

    fn user_message(content: &str) -> SaveMessage {
        SaveMessage {
            role: Role::User,
            content: content.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn first_user_message_seeds_title_and_creates_id() {
        let (_tmp, store, _) = store();
        let long = "a".repeat(60);
        let chat_id = store.save_message(user_message(&long)).unwrap();
        let meta = store.get_metadata(&chat_id).unwrap();
        assert_eq!(meta.title.chars().count(), TITLE_MAX_CHARS + 3);
        assert!(meta.title.ends_with("..."));
        assert_eq!(meta.message_count, 1);
        assert!(!meta.encrypted);
    }

    #[test]
    fn messages_accumulate_and_updated_at_advances() {
        let (_tmp, store, _) = store();
        let chat_id = store.save_message(user_message("hello")).unwrap();
        store
            .save_message(SaveMessage {
                chat_id: Some(chat_id.clone()),
                role: Role::Assistant,
                content: "hi there".to_string(),
                ..Default::default()
            })
            .unwrap();
        let messages = store.get_messages(&chat_id);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].role, Role::Assistant);
        assert!(store.get_metadata(&chat_id).unwrap().updated_at.is_some());
    }

    #[test]
    fn encrypted_round_trip_and_wrong_password_reads_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let home = NimbusHome::with_root(tmp.path());
        let crypto = Arc::new(CryptoService::new(&home).unwrap());
        crypto.set_password("correct-horse1").unwrap();
        let store = ChatHistoryStore::new(&home, Arc::clone(&crypto)).unwrap();

        let chat_id = store
            .save_message(SaveMessage {
                encrypt: true,
                ..user_message("secret plan")
            })
            .unwrap();

        // On-disk bytes carry the envelope prefix, not the plaintext.
        let raw = fs::read_to_string(tmp.path().join(format!("data/history/{chat_id}.json"))).unwrap();
        assert!(raw.starts_with("ENC:"));
        assert!(!raw.contains("secret plan"));

        // Same password reads back identical content.
        let reopened = Arc::new(CryptoService::new(&home).unwrap());
        reopened.set_password("correct-horse1").unwrap();
        let store2 = ChatHistoryStore::new(&home, Arc::clone(&reopened)).unwrap();
        assert_eq!(store2.get_messages(&chat_id)[0].content, "secret plan");

        // A different password surfaces as an empty message list.
        let wrong = Arc::new(CryptoService::new(&home).unwrap());
        wrong.set_password("wrong-password2").unwrap();
        let store3 = ChatHistoryStore::new(&home, wrong).unwrap();
        assert!(store3.get_messages(&chat_id).is_empty());
    }

    #[test]
    fn encrypted_file_is_not_downgraded_without_key() {
        let tmp = tempfile::tempdir().unwrap();
        let home = NimbusHome::with_root(tmp.path());
        let crypto = Arc::new(CryptoService::new(&home).unwrap());
        crypto.set_password("pass-word-7").unwrap();
        let store = ChatHistoryStore::new(&home, Arc::clone(&crypto)).unwrap();
        let chat_id = store
            .save_message(SaveMessage {
                encrypt: true,
                ..user_message("first")
            })
            .unwrap();

        // New process, key never set: appending must be refused.
        let keyless = Arc::new(CryptoService::new(&home).unwrap());
        let store2 = ChatHistoryStore::new(&home, keyless).unwrap();
        let err = store2
            .save_message(SaveMessage {
                chat_id: Some(chat_id.clone()),
                ..user_message("second")
            })
            .unwrap_err();
        assert!(matches!(err, CoreErr::EncryptedWithoutKey));

        // And the encrypted entry is omitted from listings.
        assert!(store2.list().is_empty());
    }

    #[test]
    fn corrupted_files_are_skipped_in_listings() {
        let (tmp, store, _) = store();
        store.save_message(user_message("ok")).unwrap();
        fs::write(tmp.path().join("data/history/broken.json"), "{not json").unwrap();
        let listed = store.list();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].title, "ok");
    }

    #[test]
    fn project_linkage_updates_and_counts() {
        let (_tmp, store, _) = store();
        let a = store.save_message(user_message("one")).unwrap();
        let b = store.save_message(user_message("two")).unwrap();
        assert!(store.update_project(&a, Some("p-1".into())).unwrap());
        assert!(store.update_project(&b, Some("p-1".into())).unwrap());
        assert_eq!(store.count_by_project("p-1"), 2);
        assert!(store.update_project(&b, None).unwrap());
        assert_eq!(store.count_by_project("p-1"), 1);
        assert!(!store.update_project("missing", None).unwrap());
    }

    #[test]
    fn delete_reports_whether_file_existed() {
        let (_tmp, store, _) = store();
        let chat_id = store.save_message(user_message("bye")).unwrap();
        assert!(store.delete(&chat_id).unwrap());
        assert!(!store.delete(&chat_id).unwrap());
    }
}
