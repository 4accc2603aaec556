//! Global error boundary for intercepted traffic.

use citadel_edge_security::{log_policy_violation, ViolationEvent, ViolationLogRecord};
use url::Url;

use crate::error::NetworkError;
use crate::routing::is_extension_scheme;

/// An error that reached the boundary
#[derive(Debug, Clone, Default)]
pub struct ErrorReport {
    pub message: String,
    /// URL of the script or resource the error came from
    pub source: Option<String>,
    pub line: Option<u32>,
    /// Set when the error is a policy violation
    pub violation: Option<ViolationEvent>,
}

impl ErrorReport {
    pub fn from_network(url: &Url, error: &NetworkError) -> Self {
        Self {
            message: error.to_string(),
            source: Some(url.to_string()),
            line: None,
            violation: None,
        }
    }

    pub fn from_violation(event: ViolationEvent) -> Self {
        Self {
            message: format!("policy violation: {}", event.violated_directive),
            source: event.source_file.clone(),
            line: event.line_number,
            violation: Some(event),
        }
    }

    fn from_extension(&self) -> bool {
        self.source
            .as_deref()
            .and_then(|s| Url::parse(s).ok())
            .map(|url| is_extension_scheme(url.scheme()))
            .unwrap_or(false)
    }
}

/// What the boundary did with an error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorDisposition {
    /// Came from a browser extension; ignored
    Discarded,
    /// Logged with its structured violation fields
    PolicyViolation(ViolationLogRecord),
    Logged,
}

pub fn handle_error(report: &ErrorReport) -> ErrorDisposition {
    if report.from_extension() {
        log::trace!(
            "Discarding extension error source={}",
            report.source.as_deref().unwrap_or("-")
        );
        return ErrorDisposition::Discarded;
    }

    if let Some(event) = &report.violation {
        return ErrorDisposition::PolicyViolation(log_policy_violation(event));
    }

    log::error!(
        "Unhandled error message={} source={} line={}",
        report.message,
        report.source.as_deref().unwrap_or("-"),
        report
            .line
            .map(|l| l.to_string())
            .unwrap_or_else(|| "-".to_string())
    );
    ErrorDisposition::Logged
}
