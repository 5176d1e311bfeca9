//! Configuration loading and management for briefly.
//!
//! Static configuration comes from `briefly.toml` with environment variable
//! overrides for secrets. Per-user settings that can change at runtime live in
//! storage as a versioned [`UserSettings`] record.

use crate::storage::{Storage, StorageError, KEY_SETTINGS};
use crate::summary::{DetailLevel, Language};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Current layout of [`UserSettings`].
pub const SETTINGS_VERSION: u32 = 2;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("missing required API key for provider: {0}")]
    MissingApiKey(String),
    #[error("no models configured for provider: {0}")]
    NoModels(String),
}

/// Endpoints and model lists for the generation providers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// OpenRouter-compatible chat completions endpoint
    pub openrouter_url: String,
    /// Base URL of the Gemini API
    pub gemini_url: String,
    /// First model tried on the primary provider
    pub primary_model: String,
    /// Tried in order after the primary model fails with a retryable error
    pub fallback_models: Vec<String>,
    /// Single model used on the alternate provider
    pub alternate_model: String,
    pub temperature: f32,
    pub timeout_secs: u64,
    /// Global pause applied after a rate-limit or unavailable response
    pub cooldown_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            openrouter_url: "https://openrouter.ai/api/v1/chat/completions".to_string(),
            gemini_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            primary_model: "deepseek/deepseek-r1-0528:free".to_string(),
            fallback_models: vec![
                "meta-llama/llama-3.3-70b-instruct:free".to_string(),
                "qwen/qwen-2.5-72b-instruct:free".to_string(),
                "mistralai/mistral-small-3.1-24b-instruct:free".to_string(),
                "google/gemma-3-27b-it:free".to_string(),
            ],
            alternate_model: "gemini-2.0-flash".to_string(),
            temperature: 0.7,
            timeout_secs: 60,
            cooldown_secs: 20,
        }
    }
}

impl ProviderConfig {
    /// Primary model followed by the fallback models, duplicates removed.
    pub fn model_chain(&self) -> Vec<String> {
        let mut models: Vec<String> = Vec::with_capacity(self.fallback_models.len() + 1);
        for model in std::iter::once(&self.primary_model).chain(&self.fallback_models) {
            let model = model.trim();
            if !model.is_empty() && !models.iter().any(|m| m == model) {
                models.push(model.to_string());
            }
        }
        models
    }
}

/// API keys configuration (loaded from environment)
///
/// The `bundled_*` keys are shared, rate-limited and revocable. They are only
/// used when the user has not configured a key of their own.
#[derive(Clone, Serialize, Deserialize, Default)]
pub struct ApiConfig {
    #[serde(default)]
    pub openrouter_key: Option<String>,
    #[serde(default)]
    pub gemini_key: Option<String>,
    #[serde(default)]
    pub bundled_openrouter_key: Option<String>,
    #[serde(default)]
    pub bundled_gemini_key: Option<String>,
}

impl std::fmt::Debug for ApiConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let set = |k: &Option<String>| if k.is_some() { "<set>" } else { "<unset>" };
        f.debug_struct("ApiConfig")
            .field("openrouter_key", &set(&self.openrouter_key))
            .field("gemini_key", &set(&self.gemini_key))
            .field("bundled_openrouter_key", &set(&self.bundled_openrouter_key))
            .field("bundled_gemini_key", &set(&self.bundled_gemini_key))
            .finish()
    }
}

/// Free tier limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    /// Summaries allowed per calendar day without an entitlement
    pub daily_limit: u32,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self { daily_limit: 5 }
    }
}

/// License backend addresses, in preference order.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct LicenseConfig {
    pub base_urls: Vec<String>,
    pub timeout_secs: Option<u64>,
}

/// Storage paths configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Base path for data storage
    pub path: PathBuf,
    /// Independent copy of the quota state, kept outside `path`
    #[serde(default)]
    pub mirror_path: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data"),
            mirror_path: None,
        }
    }
}

impl StorageConfig {
    /// Where the quota mirror lives; defaults to the platform data directory.
    pub fn mirror_dir(&self) -> Option<PathBuf> {
        self.mirror_path
            .clone()
            .or_else(|| dirs::data_local_dir().map(|d| d.join("briefly").join("mirror")))
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub quota: QuotaConfig,
    #[serde(default)]
    pub license: LicenseConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

impl Config {
    /// Load configuration from the default location (briefly.toml in cwd or home)
    ///
    /// A missing file is not an error; defaults plus environment apply.
    pub fn load() -> Result<Self, ConfigError> {
        match Self::find_config_file() {
            Some(path) => Self::load_from(&path),
            None => {
                let mut config = Config::default();
                config.apply_env();
                Ok(config)
            }
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let mut config = Self::from_toml(&content)?;
        config.apply_env();
        Ok(config)
    }

    /// Parse configuration without consulting the environment.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Override API keys from environment variables
    fn apply_env(&mut self) {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());
        if let Some(key) = var("OPENROUTER_API_KEY") {
            self.api.openrouter_key = Some(key);
        }
        if let Some(key) = var("GEMINI_API_KEY") {
            self.api.gemini_key = Some(key);
        }
        if let Some(key) = var("BRIEFLY_DEFAULT_OPENROUTER_KEY") {
            self.api.bundled_openrouter_key = Some(key);
        }
        if let Some(key) = var("BRIEFLY_DEFAULT_GEMINI_KEY") {
            self.api.bundled_gemini_key = Some(key);
        }
    }

    /// Find the config file in standard locations
    fn find_config_file() -> Option<PathBuf> {
        let local_config = PathBuf::from("briefly.toml");
        if local_config.exists() {
            return Some(local_config);
        }

        let home_config = dirs::home_dir()?
            .join(".config")
            .join("briefly")
            .join("briefly.toml");
        home_config.exists().then_some(home_config)
    }

    /// Decide which credentials apply, given the user's current settings.
    ///
    /// A key the user configured (settings first, then config/env) always wins
    /// over the bundled default.
    pub fn resolve_credentials(&self, settings: &UserSettings) -> Result<Credentials, ConfigError> {
        let openrouter = pick_key(
            [settings.openrouter_key.as_deref(), self.api.openrouter_key.as_deref()],
            self.api.bundled_openrouter_key.as_deref(),
        )
        .ok_or_else(|| ConfigError::MissingApiKey("openrouter".to_string()))?;
        let gemini = pick_key(
            [settings.gemini_key.as_deref(), self.api.gemini_key.as_deref()],
            self.api.bundled_gemini_key.as_deref(),
        );
        Ok(Credentials { openrouter, gemini })
    }
}

fn pick_key(user: [Option<&str>; 2], bundled: Option<&str>) -> Option<ResolvedKey> {
    let clean = |k: Option<&str>| k.map(str::trim).filter(|k| !k.is_empty()).map(str::to_string);
    user.into_iter()
        .find_map(clean)
        .map(|key| ResolvedKey {
            key,
            source: KeySource::User,
        })
        .or_else(|| {
            clean(bundled).map(|key| ResolvedKey {
                key,
                source: KeySource::Bundled,
            })
        })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySource {
    User,
    Bundled,
}

#[derive(Clone, PartialEq, Eq)]
pub struct ResolvedKey {
    pub key: String,
    pub source: KeySource,
}

impl std::fmt::Debug for ResolvedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedKey")
            .field("key", &mask_secret(&self.key))
            .field("source", &self.source)
            .finish()
    }
}

/// Credentials for one request: the primary provider is mandatory, the
/// alternate provider is skipped when no key is available for it.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub openrouter: ResolvedKey,
    pub gemini: Option<ResolvedKey>,
}

/// Show only the last four characters of a secret.
pub fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 4 {
        return "*".repeat(chars.len());
    }
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}{}", "*".repeat(chars.len() - 4), tail)
}

fn legacy_version() -> u32 {
    1
}

/// Settings the user can change while the program runs.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserSettings {
    #[serde(default = "legacy_version")]
    pub version: u32,
    #[serde(alias = "extensionActive")]
    pub extension_active: bool,
    #[serde(alias = "autoSummary")]
    pub auto_summary: bool,
    pub language: Language,
    #[serde(alias = "detailLevel")]
    pub detail_level: DetailLevel,
    pub persona: Option<String>,
    #[serde(alias = "openrouterKey")]
    pub openrouter_key: Option<String>,
    #[serde(alias = "geminiKey")]
    pub gemini_key: Option<String>,
}

impl Default for UserSettings {
    fn default() -> Self {
        Self {
            version: SETTINGS_VERSION,
            extension_active: true,
            auto_summary: true,
            language: Language::Pt,
            detail_level: DetailLevel::Medium,
            persona: None,
            openrouter_key: None,
            gemini_key: None,
        }
    }
}

impl std::fmt::Debug for UserSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserSettings")
            .field("version", &self.version)
            .field("extension_active", &self.extension_active)
            .field("auto_summary", &self.auto_summary)
            .field("language", &self.language)
            .field("detail_level", &self.detail_level)
            .field("persona", &self.persona)
            .field("openrouter_key", &self.openrouter_key.as_deref().map(mask_secret))
            .field("gemini_key", &self.gemini_key.as_deref().map(mask_secret))
            .finish()
    }
}

/// Partial update applied on top of the stored settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SettingsPatch {
    pub extension_active: Option<bool>,
    pub auto_summary: Option<bool>,
    pub language: Option<Language>,
    pub detail_level: Option<DetailLevel>,
    /// `Some("")` clears the persona
    pub persona: Option<String>,
    /// `Some("")` clears the key
    pub openrouter_key: Option<String>,
    pub gemini_key: Option<String>,
}

impl UserSettings {
    /// Bring an older record up to [`SETTINGS_VERSION`].
    ///
    /// Version 1 stored empty strings for unset keys and untrimmed personas.
    pub fn migrate(mut self) -> Self {
        if self.version < SETTINGS_VERSION {
            self.openrouter_key = non_blank(self.openrouter_key.take());
            self.gemini_key = non_blank(self.gemini_key.take());
            self.persona = non_blank(self.persona.take());
            self.version = SETTINGS_VERSION;
        }
        self
    }

    pub fn merge(mut self, patch: SettingsPatch) -> Self {
        if let Some(active) = patch.extension_active {
            self.extension_active = active;
        }
        if let Some(auto) = patch.auto_summary {
            self.auto_summary = auto;
        }
        if let Some(language) = patch.language {
            self.language = language;
        }
        if let Some(level) = patch.detail_level {
            self.detail_level = level;
        }
        if let Some(persona) = patch.persona {
            self.persona = non_blank(Some(persona));
        }
        if let Some(key) = patch.openrouter_key {
            self.openrouter_key = non_blank(Some(key));
        }
        if let Some(key) = patch.gemini_key {
            self.gemini_key = non_blank(Some(key));
        }
        self
    }

    /// Load settings from storage, migrating older records in place.
    pub fn load(storage: &Storage) -> Result<Self, StorageError> {
        let Some(stored) = storage.get_json::<UserSettings>(KEY_SETTINGS)? else {
            return Ok(Self::default());
        };
        let outdated = stored.version < SETTINGS_VERSION;
        let settings = stored.migrate();
        if outdated {
            storage.put_json(KEY_SETTINGS, &settings)?;
        }
        Ok(settings)
    }

    pub fn save(&self, storage: &Storage) -> Result<(), StorageError> {
        storage.put_json(KEY_SETTINGS, self)
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_sections() {
        let config = Config::from_toml("[quota]\ndaily_limit = 12\n").unwrap();
        assert_eq!(config.quota.daily_limit, 12);
        assert_eq!(config.provider.cooldown_secs, 20);
        assert_eq!(config.storage.path, PathBuf::from("./data"));
    }

    #[test]
    fn model_chain_starts_with_primary_and_dedups() {
        let provider = ProviderConfig {
            primary_model: "a".into(),
            fallback_models: vec!["b".into(), "a".into(), " ".into(), "c".into()],
            ..Default::default()
        };
        assert_eq!(provider.model_chain(), vec!["a", "b", "c"]);
    }

    #[test]
    fn user_key_beats_bundled_key() {
        let mut config = Config::default();
        config.api.bundled_openrouter_key = Some("shared".into());
        let mut settings = UserSettings::default();

        let creds = config.resolve_credentials(&settings).unwrap();
        assert_eq!(creds.openrouter.source, KeySource::Bundled);
        assert!(creds.gemini.is_none());

        settings.openrouter_key = Some("mine".into());
        let creds = config.resolve_credentials(&settings).unwrap();
        assert_eq!(creds.openrouter.key, "mine");
        assert_eq!(creds.openrouter.source, KeySource::User);
    }

    #[test]
    fn missing_primary_key_is_an_error() {
        let config = Config::default();
        let err = config.resolve_credentials(&UserSettings::default()).unwrap_err();
        assert!(matches!(err, ConfigError::MissingApiKey(p) if p == "openrouter"));
    }

    #[test]
    fn legacy_settings_migrate() {
        let legacy = r#"{"autoSummary":false,"language":"en","detailLevel":"long","openrouterKey":"  "}"#;
        let parsed: UserSettings = serde_json::from_str(legacy).unwrap();
        assert_eq!(parsed.version, 1);
        let migrated = parsed.migrate();
        assert_eq!(migrated.version, SETTINGS_VERSION);
        assert!(!migrated.auto_summary);
        assert_eq!(migrated.language, Language::En);
        assert_eq!(migrated.detail_level, DetailLevel::Long);
        assert_eq!(migrated.openrouter_key, None);
        assert!(migrated.extension_active);
    }

    #[test]
    fn patch_clears_with_empty_string() {
        let settings = UserSettings {
            persona: Some("formal".into()),
            ..Default::default()
        };
        let patched = settings.merge(SettingsPatch {
            persona: Some(String::new()),
            detail_level: Some(DetailLevel::Deep),
            ..Default::default()
        });
        assert_eq!(patched.persona, None);
        assert_eq!(patched.detail_level, DetailLevel::Deep);
    }

    #[test]
    fn mask_keeps_last_four() {
        assert_eq!(mask_secret("ABCD-EFGH"), "*****EFGH");
        assert_eq!(mask_secret("abc"), "***");
    }
}
