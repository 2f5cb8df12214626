use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};
use tandem_storage::{DEFAULT_MAX_TEXT_LEN, StoreError, UserId};

use crate::chat::{DEFAULT_REMOTE_CALL_TIMEOUT, DEFAULT_TYPING_TIMEOUT, EngineConfig};

pub const SETTINGS_DIRECTORY_NAME: &str = "tandem";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const ENV_PREFIX: &str = "TANDEM_";
pub const DEFAULT_LOG_LEVEL: &str = "info";

const MIN_TYPING_TIMEOUT_MS: u64 = 500;
const MIN_REMOTE_CALL_TIMEOUT_MS: u64 = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineSettings {
    #[serde(default)]
    pub local_user_id: String,
    #[serde(default = "default_typing_timeout_ms")]
    pub typing_timeout_ms: u64,
    #[serde(default = "default_remote_call_timeout_ms")]
    pub remote_call_timeout_ms: u64,
    #[serde(default = "default_max_text_len")]
    pub max_text_len: usize,
    #[serde(default = "default_auto_mark_read")]
    pub auto_mark_read: bool,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            local_user_id: String::new(),
            typing_timeout_ms: default_typing_timeout_ms(),
            remote_call_timeout_ms: default_remote_call_timeout_ms(),
            max_text_len: default_max_text_len(),
            auto_mark_read: default_auto_mark_read(),
            log_level: default_log_level(),
        }
    }
}

impl EngineSettings {
    pub fn normalized(mut self) -> Self {
        self.local_user_id = self.local_user_id.trim().to_string();
        self.typing_timeout_ms = self.typing_timeout_ms.max(MIN_TYPING_TIMEOUT_MS);
        self.remote_call_timeout_ms = self.remote_call_timeout_ms.max(MIN_REMOTE_CALL_TIMEOUT_MS);
        if self.max_text_len == 0 {
            self.max_text_len = default_max_text_len();
        }
        self.log_level = if self.log_level.trim().is_empty() {
            default_log_level()
        } else {
            self.log_level.trim().to_ascii_lowercase()
        };
        self
    }

    /// Engine configuration; fails while no local user is configured.
    pub fn engine_config(&self) -> Result<EngineConfig, SettingsError> {
        let local_user = UserId::parse(&self.local_user_id).context(LocalUserSnafu {
            stage: "engine-config-local-user",
        })?;
        Ok(EngineConfig {
            local_user,
            typing_timeout: Duration::from_millis(self.typing_timeout_ms),
            remote_call_timeout: Duration::from_millis(self.remote_call_timeout_ms),
            max_text_len: self.max_text_len,
            auto_mark_read: self.auto_mark_read,
        })
    }
}

/// Layered settings: defaults, then the JSON file, then `TANDEM_*` variables.
pub struct SettingsStore {
    settings: Arc<ArcSwap<EngineSettings>>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".tandem"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    pub fn new(config_path: PathBuf) -> Self {
        let settings = Self::load_from_disk(&config_path);
        Self {
            settings: Arc::new(ArcSwap::from_pointee(settings)),
            config_path,
        }
    }

    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn settings(&self) -> Arc<EngineSettings> {
        self.settings.load_full()
    }

    pub fn update(&self, settings: EngineSettings) -> Result<(), SettingsError> {
        let normalized_settings = settings.normalized();
        self.persist(&normalized_settings)?;
        self.settings.store(Arc::new(normalized_settings));
        Ok(())
    }

    fn load_from_disk(path: &Path) -> EngineSettings {
        if !path.exists() {
            tracing::info!("settings file not found at {:?}, using defaults", path);
        }

        let figment = Figment::from(Serialized::defaults(EngineSettings::default()))
            .merge(Json::file(path))
            .merge(Env::prefixed(ENV_PREFIX));

        match figment.extract::<EngineSettings>() {
            Ok(settings) => settings.normalized(),
            Err(error) => {
                tracing::warn!(
                    "failed to parse settings from {:?}: {}. using defaults",
                    path,
                    error
                );
                EngineSettings::default()
            }
        }
    }

    fn persist(&self, settings: &EngineSettings) -> Result<(), SettingsError> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent).context(CreateDirSnafu {
                stage: "create-settings-directory",
                path: parent.to_path_buf(),
            })?;
        }

        let content = serde_json::to_string_pretty(settings).context(SerializeConfigSnafu {
            stage: "serialize-settings-json",
        })?;

        let temp_path = self.config_path.with_extension("json.tmp");
        std::fs::write(&temp_path, content).context(WriteFileSnafu {
            stage: "write-temporary-settings-file",
            path: temp_path.clone(),
        })?;

        std::fs::rename(&temp_path, &self.config_path).context(RenameTempFileSnafu {
            stage: "rename-temporary-settings-file",
            from: temp_path,
            to: self.config_path.clone(),
        })?;

        tracing::info!("saved settings to {:?}", self.config_path);
        Ok(())
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("local user id is not configured on `{stage}`: {source}"))]
    LocalUser {
        stage: &'static str,
        source: StoreError,
    },
    #[snafu(display("failed to create settings directory at {path:?} on `{stage}`: {source}"))]
    CreateDir {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to serialize settings on `{stage}`: {source}"))]
    SerializeConfig {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to write settings file at {path:?} on `{stage}`: {source}"))]
    WriteFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display(
        "failed to replace settings file from {from:?} to {to:?} on `{stage}`: {source}"
    ))]
    RenameTempFile {
        stage: &'static str,
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

fn default_typing_timeout_ms() -> u64 {
    DEFAULT_TYPING_TIMEOUT.as_millis() as u64
}

fn default_remote_call_timeout_ms() -> u64 {
    DEFAULT_REMOTE_CALL_TIMEOUT.as_millis() as u64
}

fn default_max_text_len() -> usize {
    DEFAULT_MAX_TEXT_LEN
}

fn default_auto_mark_read() -> bool {
    true
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_path() -> PathBuf {
        std::env::temp_dir()
            .join(format!("tandem-settings-{}", uuid::Uuid::now_v7()))
            .join(SETTINGS_FILE_NAME)
    }

    #[test]
    fn missing_file_yields_defaults() {
        let store = SettingsStore::new(scratch_path());
        let settings = store.settings();

        assert_eq!(settings.typing_timeout_ms, 3_000);
        assert_eq!(settings.remote_call_timeout_ms, 10_000);
        assert_eq!(settings.max_text_len, DEFAULT_MAX_TEXT_LEN);
        assert!(settings.auto_mark_read);
    }

    #[test]
    fn partial_file_is_merged_over_defaults() {
        let path = scratch_path();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, r#"{ "local_user_id": "  me  ", "typing_timeout_ms": 1500 }"#).unwrap();

        let settings = SettingsStore::new(path.clone()).settings();
        assert_eq!(settings.local_user_id, "me");
        assert_eq!(settings.typing_timeout_ms, 1_500);
        assert_eq!(settings.remote_call_timeout_ms, 10_000);

        std::fs::remove_dir_all(path.parent().unwrap()).unwrap();
    }

    #[test]
    fn update_persists_and_reloads() {
        let path = scratch_path();
        let store = SettingsStore::new(path.clone());

        store
            .update(EngineSettings {
                local_user_id: "me".to_string(),
                max_text_len: 280,
                log_level: " DEBUG ".to_string(),
                ..EngineSettings::default()
            })
            .unwrap();
        assert_eq!(store.settings().log_level, "debug");
        assert!(!path.with_extension("json.tmp").exists());

        let reloaded = SettingsStore::new(path.clone()).settings();
        assert_eq!(reloaded.max_text_len, 280);
        assert_eq!(reloaded.local_user_id, "me");

        std::fs::remove_dir_all(path.parent().unwrap()).unwrap();
    }

    #[test]
    fn normalization_clamps_out_of_range_values() {
        let settings = EngineSettings {
            typing_timeout_ms: 0,
            remote_call_timeout_ms: 1,
            max_text_len: 0,
            log_level: String::new(),
            ..EngineSettings::default()
        }
        .normalized();

        assert_eq!(settings.typing_timeout_ms, MIN_TYPING_TIMEOUT_MS);
        assert_eq!(settings.remote_call_timeout_ms, MIN_REMOTE_CALL_TIMEOUT_MS);
        assert_eq!(settings.max_text_len, DEFAULT_MAX_TEXT_LEN);
        assert_eq!(settings.log_level, DEFAULT_LOG_LEVEL);
    }

    #[test]
    fn engine_config_requires_local_user() {
        let settings = EngineSettings::default();
        assert!(matches!(
            settings.engine_config(),
            Err(SettingsError::LocalUser { .. })
        ));

        let config = EngineSettings {
            local_user_id: "me".to_string(),
            ..EngineSettings::default()
        }
        .engine_config()
        .unwrap();
        assert_eq!(config.local_user, UserId::parse("me").unwrap());
        assert_eq!(config.typing_timeout, DEFAULT_TYPING_TIMEOUT);
    }

    #[test]
    fn unconfigured_typing_timeout_is_three_seconds() {
        let config = EngineSettings {
            local_user_id: "me".to_string(),
            ..EngineSettings::default()
        }
        .normalized()
        .engine_config()
        .unwrap();

        assert_eq!(config.typing_timeout, Duration::from_secs(3));
    }
}
