use std::fs;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value as JsonValue;

use crate::NimbusHome;
use crate::Result;

/// Host-visible worker settings, persisted as `data/settings.json`. Unknown
/// keys are preserved across load/save so newer hosts can stash extra state.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Settings {
    #[serde(rename = "userName", default = "default_user_name")]
    pub user_name: String,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(rename = "internetAccess", default)]
    pub internet_access: bool,
    #[serde(rename = "runAtStartup", default)]
    pub run_at_startup: bool,
    #[serde(rename = "autoUpdate", default = "default_true")]
    pub auto_update: bool,
    #[serde(default)]
    pub ollama_models_path: String,
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

fn default_user_name() -> String {
    "Nimbus".to_string()
}

fn default_language() -> String {
    "en".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            user_name: default_user_name(),
            language: default_language(),
            internet_access: false,
            run_at_startup: false,
            auto_update: true,
            ollama_models_path: String::new(),
            extra: Map::new(),
        }
    }
}

pub struct SettingsStore {
    file: PathBuf,
}

impl SettingsStore {
    pub fn new(home: &NimbusHome) -> Result<Self> {
        Ok(Self {
            file: home.settings_file()?,
        })
    }

    /// Saved values merged over defaults; a missing or unreadable file
    /// yields the defaults.
    pub fn load(&self) -> Settings {
        match fs::read_to_string(&self.file) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_default(),
            Err(_) => Settings::default(),
        }
    }

    pub fn save(&self, settings: &Settings) -> Result<()> {
        let json = serde_json::to_string_pretty(settings)?;
        fs::write(&self.file, json)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn defaults_apply_when_file_missing() {
        let tmp = tempfile::tempdir().unwrap();
        let store = SettingsStore::new(&NimbusHome::with_root(tmp.path())).unwrap();
        let settings = store.load();
        assert_eq!(settings.user_name, "Nimbus");
        assert_eq!(settings.language, "en");
        assert!(!settings.internet_access);
        assert!(settings.auto_update);
    }

    #[test]
    fn unknown_keys_survive_a_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let store = SettingsStore::new(&NimbusHome::with_root(tmp.path())).unwrap();

        let mut settings = store.load();
        settings.internet_access = true;
        settings
            .extra
            .insert("theme".to_string(), json!("dark"));
        store.save(&settings).unwrap();

        let loaded = store.load();
        assert!(loaded.internet_access);
        assert_eq!(loaded.extra["theme"], "dark");
    }

    #[test]
    fn partial_file_is_merged_over_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let home = NimbusHome::with_root(tmp.path());
        let store = SettingsStore::new(&home).unwrap();
        fs::write(home.settings_file().unwrap(), r#"{"language":"fr"}"#).unwrap();
        let settings = store.load();
        assert_eq!(settings.language, "fr");
        assert_eq!(settings.user_name, "Nimbus");
    }
}
