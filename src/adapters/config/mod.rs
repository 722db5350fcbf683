use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::json_file::ListenMode;
use crate::core::ports::settings::{SettingsError, SettingsPort};

/// Bump this when adding new fields with non-trivial defaults.
/// When a loaded config has a lower version, it is re-saved to disk
/// so that users see the new keys in their `config.toml`.
const CURRENT_CONFIG_VERSION: u32 = 1;

const APP_FOLDER: &str = "echonote";
const MIN_POLL_INTERVAL_MS: u64 = 100;

fn default_poll_interval_ms() -> u64 {
    3000
}

fn default_watch_debounce_ms() -> u64 {
    500
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub config_version: u32,
    /// Overrides the platform data directory when it points at an existing
    /// directory.
    pub content_base_path: Option<String>,
    pub listen_mode: ListenMode,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_watch_debounce_ms")]
    pub watch_debounce_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            config_version: 0,
            content_base_path: None,
            listen_mode: ListenMode::default(),
            poll_interval_ms: default_poll_interval_ms(),
            watch_debounce_ms: default_watch_debounce_ms(),
        }
    }
}

impl Settings {
    fn global_config_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".echonote")
    }

    pub fn global_config_path() -> PathBuf {
        Self::global_config_dir().join("config.toml")
    }

    pub fn load_global() -> Self {
        Self::load_from(&Self::global_config_path())
    }

    pub fn load_from(path: &Path) -> Self {
        if !path.exists() {
            return Self {
                config_version: CURRENT_CONFIG_VERSION,
                ..Self::default()
            };
        }

        let content = std::fs::read_to_string(path).unwrap_or_default();
        let mut settings: Self = match toml::from_str(&content) {
            Ok(s) => s,
            Err(e) => {
                log::warn!(
                    "[config] Failed to parse {}: {e}. Using defaults.",
                    path.display()
                );
                Self::default()
            }
        };

        // Re-save when config is from an older version so new fields
        // (with their defaults) appear in the file on disk.
        if settings.config_version < CURRENT_CONFIG_VERSION {
            settings.config_version = CURRENT_CONFIG_VERSION;
            if let Err(e) = settings.save_to(path) {
                log::warn!("[config] Failed to migrate config to v{CURRENT_CONFIG_VERSION}: {e}");
            }
        }

        settings
    }

    pub fn save(&self) -> Result<(), Box<dyn std::error::Error>> {
        self.save_to(&Self::global_config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<(), Box<dyn std::error::Error>> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, &content)?;
        Ok(())
    }

    pub fn set_content_base_path(&mut self, path: Option<&str>) {
        self.content_base_path = path
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(ToOwned::to_owned);
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(MIN_POLL_INTERVAL_MS))
    }

    pub fn watch_debounce(&self) -> Duration {
        Duration::from_millis(self.watch_debounce_ms)
    }

    pub fn default_base() -> Result<PathBuf, SettingsError> {
        let data_dir = dirs::data_dir().ok_or(SettingsError::NoDataDir)?;
        Ok(data_dir.join(APP_FOLDER))
    }

    /// Directory every persisted file lives under. Created when missing.
    pub fn settings_base(&self) -> Result<PathBuf, SettingsError> {
        let custom = self
            .content_base_path
            .as_deref()
            .map(PathBuf::from)
            .filter(|path| path.is_dir());

        let base = match custom {
            Some(path) => path,
            None => Self::default_base()?,
        };
        ensure_dir(base)
    }
}

fn ensure_dir(path: PathBuf) -> Result<PathBuf, SettingsError> {
    std::fs::create_dir_all(&path).map_err(|source| SettingsError::Io {
        path: path.clone(),
        source,
    })?;
    Ok(path)
}

/// Resolves the base directory from [`Settings`] on every call, so a changed
/// `content_base_path` takes effect without restarting persisters.
pub struct ConfiguredBase {
    settings: Settings,
}

impl ConfiguredBase {
    pub fn new(settings: Settings) -> Self {
        Self { settings }
    }
}

impl SettingsPort for ConfiguredBase {
    fn settings_base(&self) -> BoxFuture<'_, Result<PathBuf, SettingsError>> {
        Box::pin(async move { self.settings.settings_base() })
    }
}

/// A base directory chosen up front, e.g. from the command line. Returned
/// as given; writers create parent directories themselves.
pub struct FixedBase {
    path: PathBuf,
}

impl FixedBase {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl SettingsPort for FixedBase {
    fn settings_base(&self) -> BoxFuture<'_, Result<PathBuf, SettingsError>> {
        Box::pin(async move { Ok(self.path.clone()) })
    }
}

#[cfg(test)]
mod tests {
    use super::{ConfiguredBase, FixedBase, Settings, CURRENT_CONFIG_VERSION};
    use crate::core::json_file::ListenMode;
    use crate::core::ports::settings::SettingsPort;

    fn temp_dir() -> std::path::PathBuf {
        std::env::temp_dir().join(format!("echonote-config-test-{}", uuid::Uuid::new_v4()))
    }

    #[test]
    fn missing_file_yields_current_version_defaults() {
        let dir = temp_dir();
        let settings = Settings::load_from(&dir.join("config.toml"));
        assert_eq!(settings.config_version, CURRENT_CONFIG_VERSION);
        assert_eq!(settings.listen_mode, ListenMode::Poll);
        assert_eq!(settings.poll_interval_ms, 3000);
        assert!(!dir.exists());
    }

    #[test]
    fn old_config_is_migrated_and_resaved() {
        let dir = temp_dir();
        std::fs::create_dir_all(&dir).expect("create temp dir");
        let path = dir.join("config.toml");
        std::fs::write(&path, "listen_mode = \"both\"\n").expect("write old config");

        let settings = Settings::load_from(&path);
        assert_eq!(settings.listen_mode, ListenMode::Both);
        assert_eq!(settings.config_version, CURRENT_CONFIG_VERSION);

        let content = std::fs::read_to_string(&path).expect("read migrated");
        assert!(content.contains("config_version"));
        assert!(content.contains("poll_interval_ms"));

        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn invalid_config_falls_back_to_defaults() {
        let dir = temp_dir();
        std::fs::create_dir_all(&dir).expect("create temp dir");
        let path = dir.join("config.toml");
        std::fs::write(&path, "listen_mode = \"sometimes\"\n").expect("write bad config");

        let settings = Settings::load_from(&path);
        assert_eq!(settings.listen_mode, ListenMode::Poll);

        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn poll_interval_has_a_floor() {
        let settings = Settings {
            poll_interval_ms: 0,
            ..Settings::default()
        };
        assert_eq!(settings.poll_interval().as_millis(), 100);
    }

    #[test]
    fn set_content_base_path_clears_blank_values() {
        let mut settings = Settings::default();
        settings.set_content_base_path(Some("  /tmp/notes "));
        assert_eq!(settings.content_base_path.as_deref(), Some("/tmp/notes"));
        settings.set_content_base_path(Some("   "));
        assert!(settings.content_base_path.is_none());
    }

    #[tokio::test]
    async fn content_base_path_wins_when_it_exists() {
        let dir = temp_dir();
        std::fs::create_dir_all(&dir).expect("create temp dir");

        let mut settings = Settings::default();
        settings.set_content_base_path(Some(&dir.to_string_lossy()));
        let base = ConfiguredBase::new(settings)
            .settings_base()
            .await
            .expect("resolve base");
        assert_eq!(base, dir);

        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn fixed_base_is_returned_untouched() {
        let dir = temp_dir().join("nested");
        let base = FixedBase::new(&dir)
            .settings_base()
            .await
            .expect("resolve base");
        assert_eq!(base, dir);
        assert!(!dir.exists());
    }
}
