//! Two-level error taxonomy: batch-fatal conditions and per-item failures.

use std::path::PathBuf;

use thiserror::Error;

/// Aborts the whole batch before any further item is touched.
#[derive(Debug, Error)]
pub enum FatalError {
    #[error("no image files found in the source folder {dir}")]
    EmptyDiscovery { dir: PathBuf },
    #[error("service credential unavailable: {reason}")]
    CredentialUnavailable { reason: String },
    #[error("description service unreachable: {reason}")]
    ServiceUnreachable { reason: String },
    #[error("output location {path} unavailable: {reason}")]
    OutputUnavailable { path: PathBuf, reason: String },
    #[error("invalid batch request: {reason}")]
    InvalidRequest { reason: String },
}

impl FatalError {
    /// Process exit status reported by the command line front end.
    pub fn exit_code(&self) -> i32 {
        match self {
            FatalError::EmptyDiscovery { .. } => 2,
            FatalError::CredentialUnavailable { .. } => 3,
            FatalError::ServiceUnreachable { .. } => 4,
            FatalError::OutputUnavailable { .. } => 5,
            FatalError::InvalidRequest { .. } => 6,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            FatalError::EmptyDiscovery { .. } => "empty_discovery",
            FatalError::CredentialUnavailable { .. } => "credential_unavailable",
            FatalError::ServiceUnreachable { .. } => "service_unreachable",
            FatalError::OutputUnavailable { .. } => "output_unavailable",
            FatalError::InvalidRequest { .. } => "invalid_request",
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("no title/description/keywords structure found in the response")]
    NoStructure,
    #[error("response is missing the `{0}` field")]
    MissingField(&'static str),
    #[error("`{0}` is empty after trimming")]
    EmptyField(&'static str),
    #[error("service reported an error: {0}")]
    ServiceError(String),
}

#[derive(Debug, Error)]
pub enum CommitError {
    #[error("{step} failed for {path}: {source}")]
    Io {
        step: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("metadata container error: {0}")]
    Container(String),
    #[error("failed to move updated file onto {path}: {source}")]
    Move {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A failure isolated to one task; the batch continues.
#[derive(Debug, Error)]
pub enum ItemError {
    #[error("failed to read image {path}: {source}")]
    ImageRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("description service error: {0}")]
    Service(String),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Commit(#[from] CommitError),
}

impl ItemError {
    pub fn kind(&self) -> &'static str {
        match self {
            ItemError::ImageRead { .. } => "image_read",
            ItemError::Service(_) => "service_response",
            ItemError::Parse(_) => "parse",
            ItemError::Commit(_) => "commit",
        }
    }
}
