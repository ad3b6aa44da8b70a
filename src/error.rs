//! Error taxonomy shared by every reconciliation step

use std::time::Duration;
use thiserror::Error;

use crate::command::ToolError;
use crate::registry::RegistryError;

/// Failure of a domain operation
#[derive(Debug, Error)]
pub enum DomainError {
    /// A required field is missing or malformed
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The domain is unknown to the registry
    #[error("domain {0} does not exist")]
    NotFound(String),

    /// Reserved for strict-create semantics; create is an upsert today
    #[error("domain {0} already exists")]
    Conflict(String),

    /// Activation was attempted before a config was rendered
    #[error("no rendered configuration for {0}")]
    ConfigMissing(String),

    /// Deactivation was attempted on a domain with no enabled link
    #[error("domain {0} is not enabled")]
    NotActive(String),

    /// An external tool could not be started or exited non-zero
    #[error("{program} failed: {detail}")]
    ExternalToolFailure { program: String, detail: String },

    /// An external tool did not finish within its time budget
    #[error("{program} timed out after {timeout:?}")]
    ExternalToolTimeout { program: String, timeout: Duration },

    /// The registry could not be read or written
    #[error("registry persistence failed: {0}")]
    PersistenceFailure(#[from] RegistryError),

    /// The proxy rejected the configuration set
    #[error("proxy rejected configuration: {0}")]
    SyntaxValidationFailure(String),

    /// Filesystem error on a configuration directory
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl DomainError {
    pub(crate) fn io(path: impl AsRef<std::path::Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().display().to_string(),
            source,
        }
    }

    /// Status code a transport layer reports for this error
    pub fn status_code(&self) -> u16 {
        match self {
            Self::NotFound(_) => 404,
            Self::InvalidInput(_) => 400,
            _ => 500,
        }
    }

    /// Whether the failure was caused by the request rather than the host
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status_code())
    }
}

impl From<ToolError> for DomainError {
    fn from(err: ToolError) -> Self {
        match err {
            ToolError::Timeout { program, timeout } => Self::ExternalToolTimeout { program, timeout },
            ToolError::Spawn { program, source } => Self::ExternalToolFailure {
                program,
                detail: source.to_string(),
            },
            ToolError::Failed {
                program,
                code,
                stderr,
            } => Self::ExternalToolFailure {
                program,
                detail: match code {
                    Some(code) => format!("exit status {}: {}", code, stderr.trim()),
                    None => format!("terminated by signal: {}", stderr.trim()),
                },
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, DomainError>;
