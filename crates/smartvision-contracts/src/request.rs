use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::FatalError;
use crate::tasks::KeywordPolicy;

/// How results are committed; chosen once for the whole batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommitStrategy {
    #[default]
    Embed,
    Ledger,
}

impl CommitStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommitStrategy::Embed => "embed",
            CommitStrategy::Ledger => "ledger",
        }
    }
}

/// What the triggering collaborator asks the pipeline to do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRequest {
    pub prompt: String,
    pub source_directory: PathBuf,
    pub destination_directory: Option<PathBuf>,
    pub author_name: Option<String>,
    #[serde(default)]
    pub strategy: CommitStrategy,
    #[serde(default)]
    pub keyword_policy: KeywordPolicy,
}

impl BatchRequest {
    pub fn new(
        prompt: impl Into<String>,
        source_directory: impl Into<PathBuf>,
        strategy: CommitStrategy,
    ) -> Self {
        Self {
            prompt: prompt.into(),
            source_directory: source_directory.into(),
            destination_directory: None,
            author_name: None,
            strategy,
            keyword_policy: KeywordPolicy::default(),
        }
    }

    pub fn with_destination(mut self, destination: impl Into<PathBuf>) -> Self {
        self.destination_directory = Some(destination.into());
        self
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author_name = Some(author.into());
        self
    }

    /// Destination directory, falling back to the source directory.
    pub fn destination(&self) -> &Path {
        self.destination_directory
            .as_deref()
            .filter(|path| !path.as_os_str().is_empty())
            .unwrap_or(&self.source_directory)
    }

    /// Author written into the container; blank names count as absent.
    pub fn author(&self) -> Option<&str> {
        self.author_name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
    }

    pub fn validate(&self) -> Result<(), FatalError> {
        if self.prompt.trim().is_empty() {
            return Err(FatalError::InvalidRequest {
                reason: "prompt is required".to_string(),
            });
        }
        if !self.source_directory.is_dir() {
            return Err(FatalError::InvalidRequest {
                reason: format!(
                    "source folder {} does not exist or is not a directory",
                    self.source_directory.display()
                ),
            });
        }
        Ok(())
    }
}
