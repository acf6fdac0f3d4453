//! Model/reasoning settings: a small workspace JSON file, seeded on first
//! read from the agent CLI's own config.toml.

use std::fs;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Mutex;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use toml_edit::DocumentMut;
use utoipa::ToSchema;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema, JsonSchema)]
pub struct WorkspaceSettings {
    pub model: Option<String>,
    pub reasoning_effort: Option<String>,
}

#[derive(Debug)]
pub struct SettingsService {
    settings_path: PathBuf,
    agent_config_path: PathBuf,
    lock: Mutex<()>,
}

impl SettingsService {
    pub fn new(settings_path: PathBuf, agent_config_path: PathBuf) -> Self {
        Self {
            settings_path,
            agent_config_path,
            lock: Mutex::new(()),
        }
    }

    pub fn get(&self) -> WorkspaceSettings {
        let _guard = self.lock.lock().unwrap();
        if self.settings_path.exists() {
            return self.read_settings();
        }
        let fallback = self.read_agent_config();
        if fallback.model.is_some() || fallback.reasoning_effort.is_some() {
            self.write_settings(&fallback);
            return fallback;
        }
        WorkspaceSettings::default()
    }

    pub fn update(
        &self,
        model: Option<&str>,
        reasoning_effort: Option<&str>,
    ) -> WorkspaceSettings {
        let _guard = self.lock.lock().unwrap();
        let mut next = if self.settings_path.exists() {
            self.read_settings()
        } else {
            self.read_agent_config()
        };
        if let Some(model) = model {
            let model = model.trim();
            next.model = (!model.is_empty()).then(|| model.to_string());
        }
        if let Some(reasoning) = reasoning_effort {
            let reasoning = reasoning.trim();
            next.reasoning_effort = (!reasoning.is_empty()).then(|| reasoning.to_string());
        }
        self.write_settings(&next);
        next
    }

    fn read_settings(&self) -> WorkspaceSettings {
        let Ok(raw) = fs::read_to_string(&self.settings_path) else {
            return WorkspaceSettings::default();
        };
        serde_json::from_str(&raw).unwrap_or_default()
    }

    /// Top-level `model` / `model_reasoning_effort` keys from the agent CLI's
    /// config.toml; table sections are ignored.
    fn read_agent_config(&self) -> WorkspaceSettings {
        let Ok(raw) = fs::read_to_string(&self.agent_config_path) else {
            return WorkspaceSettings::default();
        };
        let Ok(document) = DocumentMut::from_str(&raw) else {
            return WorkspaceSettings::default();
        };
        let top_level = |key: &str| -> Option<String> {
            document
                .get(key)
                .and_then(|item| item.as_str())
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string)
        };
        WorkspaceSettings {
            model: top_level("model"),
            reasoning_effort: top_level("model_reasoning_effort"),
        }
    }

    fn write_settings(&self, settings: &WorkspaceSettings) {
        let Ok(content) = serde_json::to_string_pretty(settings) else {
            return;
        };
        if let Some(parent) = self.settings_path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        if let Err(err) = fs::write(&self.settings_path, content) {
            tracing::warn!(path = %self.settings_path.display(), error = %err, "failed to write settings");
        }
    }
}

/// Escape a value for embedding in a quoted TOML string argument.
pub fn escape_toml_string(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn service(dir: &TempDir) -> SettingsService {
        SettingsService::new(
            dir.path().join("agent_settings.json"),
            dir.path().join("config.toml"),
        )
    }

    #[test]
    fn defaults_when_nothing_exists() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(service(&dir).get(), WorkspaceSettings::default());
    }

    #[test]
    fn falls_back_to_agent_config_and_writes_through() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("config.toml"),
            "model = \"gpt-5\"\nmodel_reasoning_effort = \"high\"\n\n[profiles.default]\nmodel = \"other\"\n",
        )
        .unwrap();
        let svc = service(&dir);
        let settings = svc.get();
        assert_eq!(settings.model.as_deref(), Some("gpt-5"));
        assert_eq!(settings.reasoning_effort.as_deref(), Some("high"));
        // Seeded settings file wins on the next read.
        assert!(dir.path().join("agent_settings.json").exists());
        fs::write(dir.path().join("config.toml"), "model = \"changed\"\n").unwrap();
        assert_eq!(svc.get().model.as_deref(), Some("gpt-5"));
    }

    #[test]
    fn update_sets_and_clears_fields() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(&dir);
        let settings = svc.update(Some(" gpt-5-codex "), Some("medium"));
        assert_eq!(settings.model.as_deref(), Some("gpt-5-codex"));
        assert_eq!(settings.reasoning_effort.as_deref(), Some("medium"));

        let cleared = svc.update(Some(""), None);
        assert_eq!(cleared.model, None);
        assert_eq!(cleared.reasoning_effort.as_deref(), Some("medium"));
    }

    #[test]
    fn escapes_toml_values() {
        assert_eq!(escape_toml_string("plain"), "plain");
        assert_eq!(escape_toml_string("say \"hi\"\\"), "say \\\"hi\\\"\\\\");
    }
}
