use std::env;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-4o";
pub const DEFAULT_MAX_TOKENS: u64 = 300;
pub const DEFAULT_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_LOCK_SETTLE_MS: u64 = 1000;
pub const DEFAULT_EXTENSIONS: &[&str] = &["jpg", "jpeg"];

/// Engine settings resolved from defaults and environment overrides.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub api_base: String,
    pub model: String,
    pub max_tokens: u64,
    pub request_timeout: Duration,
    pub data_dir: Option<PathBuf>,
    pub lock_settle: Duration,
    pub exiftool: String,
    pub extensions: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            model: DEFAULT_MODEL.to_string(),
            max_tokens: DEFAULT_MAX_TOKENS,
            request_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            data_dir: None,
            lock_settle: Duration::from_millis(DEFAULT_LOCK_SETTLE_MS),
            exiftool: "exiftool".to_string(),
            extensions: DEFAULT_EXTENSIONS.iter().map(|ext| ext.to_string()).collect(),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Applies overrides from `lookup`; malformed numbers keep the default.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let mut config = Self::default();

        if let Some(base) = non_empty("SMARTVISION_API_BASE").or_else(|| non_empty("OPENAI_API_BASE"))
        {
            config.api_base = base.trim_end_matches('/').to_string();
        }
        if let Some(model) = non_empty("SMARTVISION_MODEL") {
            config.model = model;
        }
        if let Some(tokens) = non_empty("SMARTVISION_MAX_TOKENS").and_then(|v| v.parse().ok()) {
            config.max_tokens = tokens;
        }
        if let Some(secs) = non_empty("SMARTVISION_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            config.request_timeout = Duration::from_secs(secs);
        }
        if let Some(dir) = non_empty("SMARTVISION_DATA_DIR") {
            config.data_dir = Some(PathBuf::from(dir));
        }
        if let Some(ms) = non_empty("SMARTVISION_LOCK_SETTLE_MS").and_then(|v| v.parse().ok()) {
            config.lock_settle = Duration::from_millis(ms);
        }
        if let Some(tool) = non_empty("SMARTVISION_EXIFTOOL") {
            config.exiftool = tool;
        }
        config
    }
}
