use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// User-facing settings persisted between launches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppSettings {
    #[serde(default = "default_language")]
    pub language_code: String,
    #[serde(default)]
    pub dark_mode: bool,
    #[serde(default)]
    pub premium_user: bool,
    pub first_launch_at: DateTime<Utc>,
    #[serde(default)]
    pub launch_count: u64,
}

fn default_language() -> String {
    "en".into()
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            language_code: default_language(),
            dark_mode: false,
            premium_user: false,
            first_launch_at: Utc::now(),
            launch_count: 0,
        }
    }
}

impl AppSettings {
    /// Record one more process start.
    pub fn record_launch(&mut self) {
        self.launch_count += 1;
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("settings store lock poisoned")]
    Poisoned,
}

/// Persistence boundary for [`AppSettings`].
///
/// `get_settings` returns `Ok(None)` when nothing has been saved yet so the
/// caller can decide how to seed a first launch.
pub trait SettingsStore: Send + Sync {
    fn get_settings(&self) -> Result<Option<AppSettings>, SettingsError>;
    fn save(&self, settings: &AppSettings) -> Result<(), SettingsError>;
}

// ---------------------------------------------------------------------------
// FileSettingsStore
// ---------------------------------------------------------------------------

/// Stores settings as a TOML file on disk.
pub struct FileSettingsStore {
    path: PathBuf,
    // Serialises writers so concurrent saves never interleave.
    write_lock: Mutex<()>,
}

impl FileSettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// `settings.toml` inside the given data directory.
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        Self::new(dir.as_ref().join("settings.toml"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SettingsStore for FileSettingsStore {
    fn get_settings(&self) -> Result<Option<AppSettings>, SettingsError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let text =
            std::fs::read_to_string(&self.path).map_err(|e| SettingsError::Io(e.to_string()))?;
        let settings = toml::from_str(&text).map_err(|e| SettingsError::Parse(e.to_string()))?;
        Ok(Some(settings))
    }

    fn save(&self, settings: &AppSettings) -> Result<(), SettingsError> {
        let _guard = self.write_lock.lock().map_err(|_| SettingsError::Poisoned)?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| SettingsError::Io(e.to_string()))?;
        }
        let text =
            toml::to_string_pretty(settings).map_err(|e| SettingsError::Parse(e.to_string()))?;
        std::fs::write(&self.path, text).map_err(|e| SettingsError::Io(e.to_string()))?;
        tracing::debug!(path = %self.path.display(), "settings saved");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemorySettingsStore
// ---------------------------------------------------------------------------

/// Volatile store for tests and ephemeral hosts.
#[derive(Default)]
pub struct MemorySettingsStore {
    current: Mutex<Option<AppSettings>>,
}

impl MemorySettingsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_settings(settings: AppSettings) -> Self {
        Self {
            current: Mutex::new(Some(settings)),
        }
    }
}

impl SettingsStore for MemorySettingsStore {
    fn get_settings(&self) -> Result<Option<AppSettings>, SettingsError> {
        let current = self.current.lock().map_err(|_| SettingsError::Poisoned)?;
        Ok(current.clone())
    }

    fn save(&self, settings: &AppSettings) -> Result<(), SettingsError> {
        let mut current = self.current.lock().map_err(|_| SettingsError::Poisoned)?;
        *current = Some(settings.clone());
        Ok(())
    }
}

/// Load settings, seeding and persisting defaults on first launch, then
/// record the launch.
pub fn load_or_seed(store: &dyn SettingsStore) -> Result<AppSettings, SettingsError> {
    let mut settings = match store.get_settings()? {
        Some(existing) => existing,
        None => {
            tracing::info!("no saved settings found, seeding defaults");
            AppSettings::default()
        }
    };
    settings.record_launch();
    store.save(&settings)?;
    Ok(settings)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_store_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSettingsStore::in_dir(dir.path());
        assert!(store.get_settings().unwrap().is_none());
    }

    #[test]
    fn file_store_save_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSettingsStore::in_dir(dir.path().join("nested").join("deeper"));

        let mut settings = AppSettings::default();
        settings.language_code = "fr".into();
        store.save(&settings).unwrap();

        assert!(store.path().exists());
        let loaded = store.get_settings().unwrap().expect("saved settings");
        assert_eq!(loaded.language_code, "fr");
    }

    #[test]
    fn file_store_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSettingsStore::in_dir(dir.path());
        std::fs::write(store.path(), "this is [not toml").unwrap();
        assert!(matches!(store.get_settings(), Err(SettingsError::Parse(_))));
    }

    #[test]
    fn load_or_seed_counts_launches() {
        let store = MemorySettingsStore::new();
        let first = load_or_seed(&store).unwrap();
        assert_eq!(first.launch_count, 1);

        let second = load_or_seed(&store).unwrap();
        assert_eq!(second.launch_count, 2);
        assert_eq!(second.first_launch_at, first.first_launch_at);
    }
}
