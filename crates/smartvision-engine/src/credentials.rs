use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use smartvision_contracts::FatalError;

pub const APP_DIR_NAME: &str = "SmartVisionAI";
pub const CREDENTIAL_FILE: &str = "openai_key.txt";
const RECORD_SEPARATOR: &str = "; ";

/// One stored credential line: `"<date>; <key>"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialRecord {
    updated: String,
    api_key: String,
}

impl CredentialRecord {
    pub fn parse(raw: &str) -> Result<Self, FatalError> {
        let line = raw.trim();
        let Some((updated, key)) = line.split_once(RECORD_SEPARATOR) else {
            return Err(FatalError::CredentialUnavailable {
                reason: "credential record is not in `<date>; <key>` form".to_string(),
            });
        };
        let api_key = key.trim();
        if api_key.is_empty() {
            return Err(FatalError::CredentialUnavailable {
                reason: "credential record holds an empty key".to_string(),
            });
        }
        Ok(Self {
            updated: updated.trim().to_string(),
            api_key: api_key.to_string(),
        })
    }

    pub fn last_updated(&self) -> &str {
        &self.updated
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }
}

/// File-backed credential store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store inside `data_dir`, or the per-platform application storage directory.
    pub fn locate(data_dir: Option<&Path>) -> Option<Self> {
        let dir = match data_dir {
            Some(dir) => dir.to_path_buf(),
            None => app_storage_dir()?,
        };
        Some(Self::new(dir.join(CREDENTIAL_FILE)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<CredentialRecord, FatalError> {
        let raw = fs::read_to_string(&self.path).map_err(|err| {
            FatalError::CredentialUnavailable {
                reason: format!("could not read {}: {err}", self.path.display()),
            }
        })?;
        CredentialRecord::parse(&raw)
    }
}

/// Where the bearer key comes from. An explicit key wins over the store.
#[derive(Debug, Clone, Default)]
pub struct ApiKeySource {
    explicit: Option<String>,
    store: Option<CredentialStore>,
}

impl ApiKeySource {
    pub fn new(explicit: Option<String>, store: Option<CredentialStore>) -> Self {
        Self {
            explicit: explicit
                .map(|key| key.trim().to_string())
                .filter(|key| !key.is_empty()),
            store,
        }
    }

    /// `OPENAI_API_KEY` from the environment, then the store.
    pub fn from_env(store: Option<CredentialStore>) -> Self {
        Self::new(env::var("OPENAI_API_KEY").ok(), store)
    }

    pub fn resolve(&self) -> Result<String, FatalError> {
        if let Some(key) = &self.explicit {
            return Ok(key.clone());
        }
        match &self.store {
            Some(store) => store.load().map(|record| record.api_key().to_string()),
            None => Err(FatalError::CredentialUnavailable {
                reason: "no API key configured and no credential store location".to_string(),
            }),
        }
    }
}

fn app_storage_dir() -> Option<PathBuf> {
    if cfg!(target_os = "macos") {
        dirs::data_dir().map(|dir| dir.join(APP_DIR_NAME))
    } else if cfg!(target_os = "windows") {
        dirs::data_local_dir().map(|dir| dir.join(APP_DIR_NAME))
    } else {
        dirs::home_dir().map(|dir| dir.join(format!(".{APP_DIR_NAME}")))
    }
}
