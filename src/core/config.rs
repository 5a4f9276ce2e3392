use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::core::error::ConfigError;
use crate::core::model::ModelId;

/// Default OpenAI-compatible gateway
const DEFAULT_BASE_URL: &str = "https://api.openai.com";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_working_dir")]
    pub working_dir: PathBuf,

    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    #[serde(default)]
    pub api_key: Option<String>,

    /// Base URL of the OpenAI-compatible gateway
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Model selected when no chat or CLI flag picks one
    #[serde(default = "default_model")]
    pub default_model: ModelId,

    #[serde(default)]
    pub timeouts: TimeoutConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default = "default_speed_profile")]
    pub speed: ModeProfile,

    #[serde(default = "default_thinking_profile")]
    pub thinking: ModeProfile,

    #[serde(default)]
    pub debug: bool,
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.into()
}

fn default_model() -> ModelId {
    ModelId("gemini-2.0-flash".into())
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            working_dir: default_working_dir(),
            data_dir: default_data_dir(),
            api_key: None,
            base_url: default_base_url(),
            default_model: default_model(),
            timeouts: TimeoutConfig::default(),
            retry: RetryConfig::default(),
            cache: CacheConfig::default(),
            storage: StorageConfig::default(),
            speed: default_speed_profile(),
            thinking: default_thinking_profile(),
            debug: false,
        }
    }
}

fn default_working_dir() -> PathBuf {
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

fn default_data_dir() -> String {
    ".chatline".into()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Window for each provider call, and for each gap between streamed
    /// fragments
    #[serde(default = "default_request_secs")]
    pub request_secs: f64,

    /// Image generation gets a longer window
    #[serde(default = "default_image_secs")]
    pub image_secs: f64,
}

fn default_request_secs() -> f64 {
    30.0
}

fn default_image_secs() -> f64 {
    60.0
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            request_secs: default_request_secs(),
            image_secs: default_image_secs(),
        }
    }
}

impl TimeoutConfig {
    pub fn request(&self) -> Duration {
        Duration::from_secs_f64(self.request_secs)
    }

    pub fn image(&self) -> Duration {
        Duration::from_secs_f64(self.image_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_delay_ms")]
    pub delay_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1500
}

impl RetryConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            delay_ms: default_retry_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Entries older than this are never served
    #[serde(default = "default_ttl_hours")]
    pub ttl_hours: u64,

    /// Entries older than this are dropped when the cache is loaded
    #[serde(default = "default_purge_hours")]
    pub purge_hours: u64,

    #[serde(default = "default_max_entry_chars")]
    pub max_entry_chars: usize,

    /// Persist when the entry count is a multiple of this
    #[serde(default = "default_flush_every")]
    pub flush_every: usize,

    /// Entries kept when persistence hits the storage quota
    #[serde(default = "default_keep_on_quota")]
    pub keep_on_quota: usize,
}

fn default_ttl_hours() -> u64 {
    12
}

fn default_purge_hours() -> u64 {
    24
}

fn default_max_entry_chars() -> usize {
    100_000
}

fn default_flush_every() -> usize {
    5
}

fn default_keep_on_quota() -> usize {
    20
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_hours: default_ttl_hours(),
            purge_hours: default_purge_hours(),
            max_entry_chars: default_max_entry_chars(),
            flush_every: default_flush_every(),
            keep_on_quota: default_keep_on_quota(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Upper bound on the total bytes held by the key/value store
    #[serde(default = "default_quota_bytes")]
    pub quota_bytes: u64,
}

fn default_quota_bytes() -> u64 {
    5 * 1024 * 1024
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            quota_bytes: default_quota_bytes(),
        }
    }
}

/// Model and sampling overrides applied while a mode is active.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModeProfile {
    /// Model forced when the selected one is not in `allowlist`
    pub default_model: ModelId,
    pub allowlist: Vec<ModelId>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub top_p: Option<f32>,
}

impl ModeProfile {
    pub fn allows(&self, model: &ModelId) -> bool {
        self.allowlist.contains(model)
    }
}

fn model_list(ids: &[&str]) -> Vec<ModelId> {
    ids.iter().map(|id| ModelId::from(*id)).collect()
}

pub fn default_speed_profile() -> ModeProfile {
    ModeProfile {
        default_model: ModelId("gemini-2.0-flash".into()),
        allowlist: model_list(&[
            "gemini-2.0-flash",
            "gemini-1.5-flash",
            "claude-3-haiku",
            "deepseek-chat",
        ]),
        temperature: Some(0.3),
        max_tokens: Some(1024),
        top_p: None,
    }
}

pub fn default_thinking_profile() -> ModeProfile {
    ModeProfile {
        default_model: ModelId("claude-3-5-sonnet".into()),
        allowlist: model_list(&[
            "claude-3-5-sonnet",
            "gpt-4o",
            "deepseek-reasoner",
            "claude-3-opus",
            "gemini-1.5-pro",
            "claude-3-haiku",
            "gemini-2.0-flash",
        ]),
        temperature: Some(0.7),
        max_tokens: Some(2500),
        top_p: Some(0.95),
    }
}

pub fn load_config(working_dir: Option<PathBuf>) -> Result<AppConfig, ConfigError> {
    let wd = working_dir.unwrap_or_else(|| std::env::current_dir().unwrap_or_default());

    let mut config = AppConfig::default();
    config.working_dir = wd.clone();

    // Global config
    if let Some(config_dir) = dirs::config_dir() {
        let global_path = config_dir.join("chatline").join("config.json");
        if global_path.exists() {
            merge_config(&mut config, read_config_file(&global_path)?);
        }
    }

    // Project-local config wins over global
    let local_path = wd.join("chatline.json");
    if local_path.exists() {
        merge_config(&mut config, read_config_file(&local_path)?);
    }

    detect_env(&mut config);
    validate(&config)?;

    Ok(config)
}

fn read_config_file(path: &std::path::Path) -> Result<AppConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::File(e.to_string()))?;
    serde_json::from_str(&content).map_err(|e| ConfigError::Invalid(e.to_string()))
}

fn merge_config(base: &mut AppConfig, overlay: AppConfig) {
    if overlay.api_key.is_some() {
        base.api_key = overlay.api_key;
    }
    if overlay.base_url != default_base_url() {
        base.base_url = overlay.base_url;
    }
    if overlay.data_dir != default_data_dir() {
        base.data_dir = overlay.data_dir;
    }
    if overlay.default_model != default_model() {
        base.default_model = overlay.default_model;
    }
    if overlay.timeouts != TimeoutConfig::default() {
        base.timeouts = overlay.timeouts;
    }
    if overlay.retry != RetryConfig::default() {
        base.retry = overlay.retry;
    }
    if overlay.cache != CacheConfig::default() {
        base.cache = overlay.cache;
    }
    if overlay.storage != StorageConfig::default() {
        base.storage = overlay.storage;
    }
    if overlay.speed != default_speed_profile() {
        base.speed = overlay.speed;
    }
    if overlay.thinking != default_thinking_profile() {
        base.thinking = overlay.thinking;
    }
    if overlay.debug {
        base.debug = true;
    }
}

fn detect_env(config: &mut AppConfig) {
    if config.api_key.is_none() {
        for env_var in ["CHATLINE_API_KEY", "OPENAI_API_KEY"] {
            if let Ok(key) = std::env::var(env_var) {
                if !key.is_empty() {
                    config.api_key = Some(key);
                    break;
                }
            }
        }
    }

    if let Ok(url) = std::env::var("CHATLINE_BASE_URL") {
        if !url.is_empty() {
            config.base_url = url;
        }
    }
}

fn validate(config: &AppConfig) -> Result<(), ConfigError> {
    let positive = |secs: f64| secs.is_finite() && secs > 0.0;
    if !positive(config.timeouts.request_secs) || !positive(config.timeouts.image_secs) {
        return Err(ConfigError::Invalid("timeouts must be positive".into()));
    }
    if config.cache.flush_every == 0 {
        return Err(ConfigError::Invalid("cache.flush_every must be positive".into()));
    }
    if config.speed.allowlist.is_empty() {
        return Err(ConfigError::MissingField("speed.allowlist".into()));
    }
    if config.thinking.allowlist.is_empty() {
        return Err(ConfigError::MissingField("thinking.allowlist".into()));
    }
    Ok(())
}

impl AppConfig {
    pub fn get_api_key(&self) -> Option<&str> {
        self.api_key.as_deref()
    }

    pub fn has_api_key(&self) -> bool {
        self.api_key.as_ref().map_or(false, |k| !k.is_empty())
    }

    pub fn data_path(&self) -> PathBuf {
        self.working_dir.join(&self.data_dir)
    }
}
