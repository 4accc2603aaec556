use citadel_edge_security::SecurityError;
use thiserror::Error;

/// NetworkError represents all possible errors that can occur within the networking layer
#[derive(Error, Debug)]
pub enum NetworkError {
    /// Connection errors
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Timeout errors
    #[error("Request timed out after {0:?}")]
    TimeoutError(std::time::Duration),

    /// URL parsing errors
    #[error("URL parsing error: {0}")]
    UrlError(#[from] url::ParseError),

    /// HTTP client errors that are neither connection failures nor timeouts
    #[error("HTTP request error: {0}")]
    HttpError(#[from] reqwest::Error),

    /// The navigation policy could not be assembled; no response may be shipped
    #[error("Policy assembly failed: {0}")]
    PolicyAssembly(#[source] SecurityError),

    /// Resource loading and lifecycle errors
    #[error("Resource loading error: {0}")]
    ResourceError(String),

    /// IO errors
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl NetworkError {
    /// Returns true for page-level fetch failures the interceptor may recover from
    pub fn is_fetch_failure(&self) -> bool {
        matches!(
            self,
            NetworkError::ConnectionError(_)
                | NetworkError::TimeoutError(_)
                | NetworkError::HttpError(_)
                | NetworkError::IoError(_)
        )
    }
}

pub type NetworkResult<T> = Result<T, NetworkError>;
