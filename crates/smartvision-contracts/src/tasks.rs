use std::path::{Path, PathBuf};

use indexmap::IndexSet;
use serde::{Deserialize, Serialize};

use crate::errors::ParseError;

/// One discovered image file. Immutable once discovery has produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageTask {
    name: String,
    source_path: PathBuf,
    destination_path: PathBuf,
}

impl ImageTask {
    pub fn new(
        name: impl Into<String>,
        source_path: impl Into<PathBuf>,
        destination_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            source_path: source_path.into(),
            destination_path: destination_path.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source_path(&self) -> &Path {
        &self.source_path
    }

    pub fn destination_path(&self) -> &Path {
        &self.destination_path
    }

    pub fn rewrites_in_place(&self) -> bool {
        self.source_path == self.destination_path
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct KeywordPolicy {
    /// When false, `Sun` and `sun` count as the same keyword and the first spelling wins.
    pub case_sensitive: bool,
}

impl KeywordPolicy {
    /// Trims, drops empty entries and removes duplicates while keeping first-seen order.
    pub fn normalize<I, S>(&self, raw: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut seen = IndexSet::new();
        let mut out = Vec::new();
        for row in raw {
            let text = row
                .as_ref()
                .split_whitespace()
                .collect::<Vec<&str>>()
                .join(" ");
            if text.is_empty() {
                continue;
            }
            let key = if self.case_sensitive {
                text.clone()
            } else {
                text.to_lowercase()
            };
            if seen.insert(key) {
                out.push(text);
            }
        }
        out
    }
}

/// Validated output of the response parser.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescriptionResult {
    title: String,
    description: String,
    keywords: Vec<String>,
}

impl DescriptionResult {
    pub fn new<I, S>(
        title: &str,
        description: &str,
        keywords: I,
        policy: KeywordPolicy,
    ) -> Result<Self, ParseError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let title = title.trim();
        if title.is_empty() {
            return Err(ParseError::EmptyField("title"));
        }
        let description = description.trim();
        if description.is_empty() {
            return Err(ParseError::EmptyField("description"));
        }
        Ok(Self {
            title: title.to_string(),
            description: description.to_string(),
            keywords: policy.normalize(keywords),
        })
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn keywords(&self) -> &[String] {
        &self.keywords
    }

    pub fn keywords_joined(&self) -> String {
        self.keywords.join(",")
    }
}
