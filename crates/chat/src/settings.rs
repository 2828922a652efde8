use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use recall_llm::{BackendConfig, ChatOptions, DEFAULT_ENDPOINT, DEFAULT_REQUEST_TIMEOUT};
use serde::{Deserialize, Serialize};
use snafu::{OptionExt, ResultExt, Snafu};
use tempfile::NamedTempFile;

use crate::message::DEFAULT_TITLE_MAX_CHARS;

pub const SETTINGS_DIRECTORY_NAME: &str = "recall";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const SETTINGS_ENV_PREFIX: &str = "RECALL_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatSettings {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<u64>,
    #[serde(default)]
    pub include_references: Option<bool>,
    #[serde(default = "default_title_max_chars")]
    pub title_max_chars: usize,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            api_key: String::new(),
            request_timeout_secs: default_request_timeout_secs(),
            temperature: None,
            max_tokens: None,
            include_references: None,
            title_max_chars: default_title_max_chars(),
        }
    }
}

impl ChatSettings {
    pub fn to_backend_config(&self) -> BackendConfig {
        BackendConfig::new(&self.endpoint)
            .with_api_key(&self.api_key)
            .with_request_timeout(Duration::from_secs(self.request_timeout_secs))
    }

    pub fn chat_options(&self) -> ChatOptions {
        ChatOptions {
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            include_references: self.include_references,
        }
    }

    /// Overrides one setting by its file key. Values are parsed like the JSON fields.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), SettingsError> {
        let value = value.trim();
        match key {
            "endpoint" => self.endpoint = value.to_string(),
            "api_key" => self.api_key = value.to_string(),
            "request_timeout_secs" => self.request_timeout_secs = parse_value(key, value)?,
            "temperature" => self.temperature = parse_optional_value(key, value)?,
            "max_tokens" => self.max_tokens = parse_optional_value(key, value)?,
            "include_references" => self.include_references = parse_optional_value(key, value)?,
            "title_max_chars" => self.title_max_chars = parse_value(key, value)?,
            _ => {
                return UnknownKeySnafu {
                    stage: "set-setting",
                    key,
                }
                .fail();
            }
        }
        Ok(())
    }

    pub fn normalized(mut self) -> Self {
        self.endpoint = if self.endpoint.trim().is_empty() {
            default_endpoint()
        } else {
            self.endpoint.trim().trim_end_matches('/').to_string()
        };
        self.api_key = self.api_key.trim().to_string();
        if self.request_timeout_secs == 0 {
            self.request_timeout_secs = default_request_timeout_secs();
        }
        if self.title_max_chars == 0 {
            self.title_max_chars = default_title_max_chars();
        }
        self.temperature = self
            .temperature
            .filter(|value| value.is_finite())
            .map(|value| value.clamp(0.0, 2.0));
        self.max_tokens = self.max_tokens.filter(|value| *value > 0);

        self
    }
}

/// Settings loaded once and swapped atomically on update.
pub struct SettingsStore {
    settings: Arc<ArcSwap<ChatSettings>>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".recall"))
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

    pub fn settings(&self) -> Arc<ChatSettings> {
        self.settings.load_full()
    }

    pub fn update(&self, settings: ChatSettings) -> Result<(), SettingsError> {
        let normalized_settings = settings.normalized();
        self.persist(&normalized_settings)?;
        self.settings.store(Arc::new(normalized_settings));
        Ok(())
    }

    // Defaults, then the JSON file when present, then RECALL_* variables.
    fn load_from_disk(path: &Path) -> ChatSettings {
        let mut figment = Figment::from(Serialized::defaults(ChatSettings::default()));
        if path.exists() {
            figment = figment.merge(Json::file(path));
        } else {
            tracing::info!(path = ?path, "settings file not found, using defaults");
        }
        figment = figment.merge(Env::prefixed(SETTINGS_ENV_PREFIX));

        match figment.extract::<ChatSettings>() {
            Ok(settings) => settings.normalized(),
            Err(error) => {
                tracing::warn!(
                    path = ?path,
                    error = %error,
                    "failed to parse settings, using defaults"
                );
                ChatSettings::default()
            }
        }
    }

    fn persist(&self, settings: &ChatSettings) -> Result<(), SettingsError> {
        let directory = match self.config_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(directory).context(CreateDirSnafu {
            stage: "create-settings-directory",
            path: directory.to_path_buf(),
        })?;

        // Staged next to the target so the final rename never crosses filesystems.
        let mut staged = NamedTempFile::new_in(directory).context(StageFileSnafu {
            stage: "create-staged-settings-file",
            path: directory.to_path_buf(),
        })?;
        serde_json::to_writer_pretty(staged.as_file_mut(), settings).context(
            SerializeConfigSnafu {
                stage: "serialize-settings-json",
            },
        )?;
        staged.as_file().sync_all().context(StageFileSnafu {
            stage: "sync-staged-settings-file",
            path: staged.path().to_path_buf(),
        })?;
        staged.persist(&self.config_path).context(ReplaceFileSnafu {
            stage: "replace-settings-file",
            path: self.config_path.clone(),
        })?;

        tracing::info!(path = ?self.config_path, "saved settings");
        Ok(())
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("unknown setting `{key}`"))]
    UnknownKey { stage: &'static str, key: String },
    #[snafu(display("`{value}` is not a valid value for setting `{key}`"))]
    InvalidValue {
        stage: &'static str,
        key: String,
        value: String,
    },
    #[snafu(display("cannot create settings directory {path:?} on `{stage}`, {source}"))]
    CreateDir {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("cannot stage settings in {path:?} on `{stage}`, {source}"))]
    StageFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("cannot encode settings on `{stage}`, {source}"))]
    SerializeConfig {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("cannot replace settings file {path:?} on `{stage}`, {source}"))]
    ReplaceFile {
        stage: &'static str,
        path: PathBuf,
        source: tempfile::PersistError,
    },
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> Result<T, SettingsError> {
    value.parse().ok().context(InvalidValueSnafu {
        stage: "parse-setting-value",
        key,
        value,
    })
}

// An empty value clears an optional setting.
fn parse_optional_value<T: FromStr>(key: &str, value: &str) -> Result<Option<T>, SettingsError> {
    if value.is_empty() {
        return Ok(None);
    }
    parse_value(key, value).map(Some)
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

fn default_request_timeout_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT.as_secs()
}

fn default_title_max_chars() -> usize {
    DEFAULT_TITLE_MAX_CHARS
}

#[cfg(test)]
mod tests {
    use figment::Jail;
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn normalization_fills_blank_and_zero_fields() {
        let settings = ChatSettings {
            endpoint: "  http://example.test/api/ ".to_string(),
            api_key: " key ".to_string(),
            request_timeout_secs: 0,
            temperature: Some(9.0),
            max_tokens: Some(0),
            include_references: Some(true),
            title_max_chars: 0,
        }
        .normalized();

        assert_eq!(settings.endpoint, "http://example.test/api");
        assert_eq!(settings.api_key, "key");
        assert_eq!(settings.request_timeout_secs, DEFAULT_REQUEST_TIMEOUT.as_secs());
        assert_eq!(settings.temperature, Some(2.0));
        assert_eq!(settings.max_tokens, None);
        assert_eq!(settings.title_max_chars, DEFAULT_TITLE_MAX_CHARS);
    }

    #[test]
    fn set_parses_values_by_key() {
        let mut settings = ChatSettings::default();

        settings.set("max_tokens", "512").unwrap();
        settings.set("include_references", "true").unwrap();
        settings.set("endpoint", " http://other.test/api ").unwrap();
        assert_eq!(settings.max_tokens, Some(512));
        assert_eq!(settings.include_references, Some(true));
        assert_eq!(settings.endpoint, "http://other.test/api");

        settings.set("max_tokens", "").unwrap();
        assert_eq!(settings.max_tokens, None);
    }

    #[test]
    fn set_rejects_unknown_keys_and_bad_values() {
        let mut settings = ChatSettings::default();

        assert!(matches!(
            settings.set("colour", "blue"),
            Err(SettingsError::UnknownKey { .. })
        ));
        assert!(matches!(
            settings.set("request_timeout_secs", "soon"),
            Err(SettingsError::InvalidValue { .. })
        ));
        assert_eq!(settings, ChatSettings::default());
    }

    #[test]
    fn blank_api_key_means_no_bearer_token() {
        let config = ChatSettings::default().to_backend_config();

        assert_eq!(config.api_key, None);
        assert_eq!(config.endpoint, DEFAULT_ENDPOINT);
    }

    #[test]
    fn file_values_are_overridden_by_environment() {
        Jail::expect_with(|jail| {
            jail.create_file(
                SETTINGS_FILE_NAME,
                r#"{ "endpoint": "http://file.test/api", "max_tokens": 256 }"#,
            )?;
            jail.set_env("RECALL_ENDPOINT", "http://env.test/api");
            jail.set_env("RECALL_TEMPERATURE", "0.5");

            let settings = SettingsStore::new(PathBuf::from(SETTINGS_FILE_NAME)).settings();

            assert_eq!(settings.endpoint, "http://env.test/api");
            assert_eq!(settings.max_tokens, Some(256));
            assert_eq!(settings.temperature, Some(0.5));
            Ok(())
        });
    }

    #[test]
    fn unreadable_file_falls_back_to_defaults() {
        Jail::expect_with(|jail| {
            jail.create_file(SETTINGS_FILE_NAME, "{ not json")?;

            let settings = SettingsStore::new(PathBuf::from(SETTINGS_FILE_NAME)).settings();

            assert_eq!(*settings, ChatSettings::default());
            Ok(())
        });
    }

    #[test]
    fn update_persists_and_swaps_settings() {
        let directory = tempfile::tempdir().unwrap();
        let path = directory.path().join("nested").join(SETTINGS_FILE_NAME);
        let store = SettingsStore::new(path.clone());

        store
            .update(ChatSettings {
                api_key: " secret ".to_string(),
                ..ChatSettings::default()
            })
            .unwrap();

        assert_eq!(store.settings().api_key, "secret");
        let entries: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(entries, vec![std::ffi::OsString::from(SETTINGS_FILE_NAME)]);

        let reloaded = SettingsStore::new(path).settings();
        assert_eq!(reloaded.api_key, "secret");
    }
}
