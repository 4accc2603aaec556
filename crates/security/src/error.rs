//! Security specific errors for Citadel Edge.

/// Errors raised by the key manager, policy assembler and violation collector.
#[derive(thiserror::Error, Debug, Clone)]
pub enum SecurityError {
    /// The secrets backend or the violation store could not be reached.
    #[error("Backend unreachable: {0}")]
    Connection(String),

    /// Internally generated material (nonce, key) has the wrong shape.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// No usable report key: none was ever issued or the last one expired
    /// and could not be replaced.
    #[error("No usable report key: {0}")]
    KeyUnavailable(String),

    /// A backend answered but refused or corrupted the operation.
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid security configuration: {0}")]
    InvalidConfiguration(String),
}

impl SecurityError {
    /// Returns true if the failure came from an unreachable backend and is
    /// worth retrying later.
    pub fn is_connection(&self) -> bool {
        matches!(self, SecurityError::Connection(_))
    }
}

impl From<serde_json::Error> for SecurityError {
    fn from(err: serde_json::Error) -> Self {
        SecurityError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for SecurityError {
    fn from(err: std::io::Error) -> Self {
        SecurityError::Storage(err.to_string())
    }
}

impl From<reqwest::Error> for SecurityError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() {
            SecurityError::Connection(err.to_string())
        } else {
            SecurityError::Storage(err.to_string())
        }
    }
}

pub type SecurityResult<T> = Result<T, SecurityError>;
