//! Engine error taxonomy

use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by every engine operation
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Invalid rules: {0}")]
    Validation(#[from] ValidationError),

    #[error("No cloud identity available (company/user id missing)")]
    NotAuthenticated,

    #[error("Registration failed: {0}")]
    Registration(#[from] RegistrationError),

    #[error("Tunnel client binary not found (searched: {})", display_paths(.searched))]
    BinaryNotFound { searched: Vec<PathBuf> },

    #[error("Generated configuration missing: {0:?}")]
    ConfigMissing(PathBuf),

    #[error("Process error: {0}")]
    Process(String),

    #[error("Storage error at {path:?}: {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl EngineError {
    pub(crate) fn storage(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Storage {
            path: path.into(),
            source,
        }
    }

    /// Validation failures are never worth retrying
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Validation(_) | Self::BinaryNotFound { .. })
    }
}

/// A rule list violated a shape or size constraint
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("the main rule list must contain at least one service")]
    EmptyMainRules,

    #[error("the temporary rule list must contain at least one service while enabled")]
    EmptyTemporaryRules,

    #[error("at most {max} services are allowed, got {count}")]
    TooManyRules { max: usize, count: usize },

    #[error("rule #{index}: service name must not be empty")]
    EmptyServiceName { index: usize },

    #[error("rule #{index}: local port {value:?} is not a number in 1..=65535")]
    InvalidLocalPort { index: usize, value: String },
}

/// Distinguishing reason for a failed cloud registration
#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("request timed out")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),

    #[error("endpoint returned HTTP {0}")]
    Status(u16),

    #[error("malformed response body: {0}")]
    MalformedBody(String),

    #[error("endpoint rejected registration (status {status}): {message}")]
    Rejected { status: String, message: String },
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

pub type Result<T> = std::result::Result<T, EngineError>;
