use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{QuarrelError, Result};
use crate::types::SlotConfig;

/// Durable agent identities, offered back to the configuration surface on
/// the next session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedSettings {
    #[serde(default, alias = "aiSlots")]
    pub agent_slots: Vec<SlotConfig>,
}

/// JSON file holding the last submitted agent identities.
#[derive(Debug, Clone)]
pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the last saved settings. A missing file means no prior settings.
    pub fn load(&self) -> Result<Option<SavedSettings>> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No saved settings");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| QuarrelError::Settings(format!("{}: {}", self.path.display(), e)))
    }

    /// Overwrite the settings file with the given identities.
    pub fn save(&self, settings: &SavedSettings) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(settings)?;
        std::fs::write(&self.path, json)?;
        debug!(path = %self.path.display(), slots = settings.agent_slots.len(), "Saved settings");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::new(dir.path().join("user-settings.json"));
        assert_eq!(store.load().unwrap(), None);
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::new(dir.path().join("nested").join("user-settings.json"));
        let settings = SavedSettings {
            agent_slots: vec![
                SlotConfig::new("Claude", "https://claude.example/chats"),
                SlotConfig::new("", ""),
            ],
        };
        store.save(&settings).unwrap();
        assert_eq!(store.load().unwrap(), Some(settings));
    }

    #[test]
    fn reads_legacy_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("user-settings.json");
        std::fs::write(&path, r#"{"aiSlots":[{"name":"Gemini","url":"https://g.example"}]}"#)
            .unwrap();
        let loaded = SettingsStore::new(path).load().unwrap().unwrap();
        assert_eq!(loaded.agent_slots[0].endpoint_address, "https://g.example");
    }

    #[test]
    fn corrupt_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("user-settings.json");
        std::fs::write(&path, "[[[").unwrap();
        let err = SettingsStore::new(path).load().unwrap_err();
        assert!(matches!(err, QuarrelError::Settings(_)));
    }
}
