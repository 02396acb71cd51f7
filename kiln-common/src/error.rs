use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The pipeline stage an error belongs to. Used for reporting and for the
/// process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    Load,
    Resolve,
    Fetch,
    Build,
    Install,
    Verify,
    Uninstall,
}

impl Stage {
    pub fn exit_code(self) -> i32 {
        match self {
            Stage::Load => 2,
            Stage::Resolve => 3,
            Stage::Fetch => 4,
            Stage::Build => 5,
            Stage::Install | Stage::Uninstall => 6,
            Stage::Verify => 7,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Load => "load",
            Stage::Resolve => "resolve",
            Stage::Fetch => "fetch",
            Stage::Build => "build",
            Stage::Install => "install",
            Stage::Verify => "verify",
            Stage::Uninstall => "uninstall",
        };
        f.write_str(s)
    }
}

pub const EXIT_GENERIC: i32 = 1;
pub const EXIT_CANCELLED: i32 = 130;

#[derive(Error, Debug, Clone)]
pub enum KilnError {
    #[error("I/O Error: {0}")]
    Io(#[from] Arc<std::io::Error>),

    #[error("HTTP Request Error: {0}")]
    Http(#[from] Arc<reqwest::Error>),

    #[error("JSON Parsing Error: {0}")]
    Json(#[from] Arc<serde_json::Error>),

    #[error("TOML Parsing Error: {0}")]
    Toml(#[from] Arc<toml::de::Error>),

    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("Malformed formula '{name}': {reason}")]
    MalformedFormula { name: String, reason: String },

    #[error("No formula named '{0}' is available")]
    UnknownFormula(String),

    #[error("Formula '{dependent}' depends on '{missing}', which is not available")]
    UnknownDependency { dependent: String, missing: String },

    #[error("Dependency cycle detected: {}", .0.join(" -> "))]
    CyclicDependency(Vec<String>),

    #[error("Checksum mismatch for {url}: expected {expected}, got {actual}")]
    Integrity {
        url: String,
        expected: String,
        actual: String,
    },

    #[error("Failed to fetch {url}: {reason}")]
    Fetch {
        url: String,
        transient: bool,
        reason: String,
    },

    #[error("Build step {step} (`{command}`) failed with {exit_status}")]
    Build {
        step: usize,
        command: String,
        exit_status: String,
        output: String,
    },

    #[error("Installation Error: {0}")]
    Install(String),

    #[error("Verification failed: {0}")]
    Verification(String),

    #[error("Uninstall Error: {0}")]
    Uninstall(String),

    #[error("Lock Error: {0}")]
    Lock(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("'{0}' is not installed")]
    NotInstalled(String),

    #[error("Resource Not Found: {0}")]
    NotFound(String),

    #[error("Generic Error: {0}")]
    Generic(String),
}

impl KilnError {
    /// The stage this error aborts. `None` for errors that are not tied to a
    /// pipeline stage (configuration, cancellation, generic failures).
    pub fn stage(&self) -> Option<Stage> {
        match self {
            KilnError::MalformedFormula { .. } | KilnError::Toml(_) => Some(Stage::Load),
            KilnError::UnknownFormula(_)
            | KilnError::UnknownDependency { .. }
            | KilnError::CyclicDependency(_) => Some(Stage::Resolve),
            KilnError::Integrity { .. } | KilnError::Fetch { .. } | KilnError::Http(_) => {
                Some(Stage::Fetch)
            }
            KilnError::Build { .. } => Some(Stage::Build),
            KilnError::Install(_) => Some(Stage::Install),
            KilnError::Verification(_) => Some(Stage::Verify),
            KilnError::NotInstalled(_) | KilnError::Uninstall(_) => Some(Stage::Uninstall),
            _ => None,
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            KilnError::Cancelled => EXIT_CANCELLED,
            other => other.stage().map_or(EXIT_GENERIC, Stage::exit_code),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            KilnError::Fetch {
                transient: true,
                ..
            }
        )
    }

    /// Captured command output, if this error carries any.
    pub fn captured_output(&self) -> Option<&str> {
        match self {
            KilnError::Build { output, .. } => Some(output.as_str()),
            _ => None,
        }
    }

    pub fn malformed(name: impl Into<String>, reason: impl Into<String>) -> Self {
        KilnError::MalformedFormula {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

impl From<std::io::Error> for KilnError {
    fn from(err: std::io::Error) -> Self {
        KilnError::Io(Arc::new(err))
    }
}

impl From<reqwest::Error> for KilnError {
    fn from(err: reqwest::Error) -> Self {
        KilnError::Http(Arc::new(err))
    }
}

impl From<serde_json::Error> for KilnError {
    fn from(err: serde_json::Error) -> Self {
        KilnError::Json(Arc::new(err))
    }
}

impl From<toml::de::Error> for KilnError {
    fn from(err: toml::de::Error) -> Self {
        KilnError::Toml(Arc::new(err))
    }
}

pub type Result<T> = std::result::Result<T, KilnError>;
