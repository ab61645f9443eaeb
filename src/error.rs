use std::time::Duration;
use thiserror::Error;

use crate::job::{ArtifactDescriptor, JobStatus};
use crate::repository::RepositoryError;
use crate::url_validator::UnsafeUrlError;

/// Classified page-load failure reported by a render context.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NavigationError {
    #[error("navigation timed out after {0:?}")]
    Timeout(Duration),

    #[error("network failure: {0}")]
    NetworkFailure(String),

    #[error("HTTP {status}: {status_text}")]
    NonSuccessStatus { status: u16, status_text: String },
}

#[derive(Debug, Clone, Error)]
pub enum CaptureError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unsafe URL: {0}")]
    UnsafeUrl(#[from] UnsafeUrlError),

    #[error("Navigation failed: {0}")]
    Navigation(#[from] NavigationError),

    #[error("Renderer unavailable: {0}")]
    RendererUnavailable(String),

    #[error("Screenshot capture failed: {0}")]
    CaptureFailed(String),

    #[error("Image transform failed: {0}")]
    Transform(String),

    #[error("Storage upload failed: {0}")]
    StorageUpload(String),

    #[error("Persistence error: {0}")]
    Persistence(#[from] RepositoryError),

    #[error("Capture job not found: {0}")]
    JobNotFound(String),

    #[error("Access denied to job {0}")]
    AccessDenied(String),

    #[error("Job is not pending (current status: {0})")]
    JobNotPending(JobStatus),

    #[error("Capture succeeded but job state could not be recorded: {source}")]
    StateWrite {
        artifact: Box<ArtifactDescriptor>,
        source: RepositoryError,
    },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl CaptureError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, CaptureError::Navigation(NavigationError::Timeout(_)))
    }

    /// Message stored on failed jobs and shown to callers. Never carries
    /// internal detail such as engine error strings or file paths.
    pub fn user_message(&self) -> String {
        match self {
            CaptureError::Validation(message) => message.clone(),
            CaptureError::UnsafeUrl(e) => format!("Invalid or unsafe URL: {e}"),
            CaptureError::Navigation(NavigationError::Timeout(_)) => {
                "Page loading timeout exceeded".to_string()
            }
            CaptureError::Navigation(NavigationError::NetworkFailure(_)) => {
                "Failed to load page - network error".to_string()
            }
            CaptureError::Navigation(NavigationError::NonSuccessStatus {
                status,
                status_text,
            }) => format!("Failed to load page - HTTP {status}: {status_text}"),
            CaptureError::RendererUnavailable(_) => "Rendering engine unavailable".to_string(),
            CaptureError::CaptureFailed(_) => "Screenshot capture failed".to_string(),
            CaptureError::Transform(_) => "Image processing failed".to_string(),
            CaptureError::StorageUpload(_) => "Cloud storage upload failed".to_string(),
            CaptureError::JobNotFound(_) => "Capture job not found".to_string(),
            CaptureError::AccessDenied(_) => "Access denied to this job".to_string(),
            CaptureError::JobNotPending(status) => format!("Job is already {status}"),
            CaptureError::Persistence(_)
            | CaptureError::StateWrite { .. }
            | CaptureError::Configuration(_)
            | CaptureError::Io(_)
            | CaptureError::Serialization(_) => "Internal server error".to_string(),
        }
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self {
            CaptureError::Validation(_)
            | CaptureError::UnsafeUrl(_)
            | CaptureError::JobNotFound(_)
            | CaptureError::AccessDenied(_)
            | CaptureError::JobNotPending(_) => ErrorSeverity::Low,
            CaptureError::Navigation(_)
            | CaptureError::CaptureFailed(_)
            | CaptureError::Transform(_)
            | CaptureError::StorageUpload(_) => ErrorSeverity::Medium,
            CaptureError::RendererUnavailable(_)
            | CaptureError::Configuration(_)
            | CaptureError::Io(_)
            | CaptureError::Serialization(_) => ErrorSeverity::High,
            CaptureError::Persistence(_) | CaptureError::StateWrite { .. } => {
                ErrorSeverity::Critical
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl From<std::io::Error> for CaptureError {
    fn from(err: std::io::Error) -> Self {
        CaptureError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for CaptureError {
    fn from(err: serde_json::Error) -> Self {
        CaptureError::Serialization(err.to_string())
    }
}

impl From<image::ImageError> for CaptureError {
    fn from(err: image::ImageError) -> Self {
        CaptureError::Transform(err.to_string())
    }
}

impl From<tokio::task::JoinError> for CaptureError {
    fn from(err: tokio::task::JoinError) -> Self {
        CaptureError::Io(format!("background task failed: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_navigation_messages_are_normalized() {
        let timeout = CaptureError::from(NavigationError::Timeout(Duration::from_secs(5)));
        assert_eq!(timeout.user_message(), "Page loading timeout exceeded");
        assert!(timeout.is_timeout());

        let network = CaptureError::from(NavigationError::NetworkFailure(
            "net::ERR_NAME_NOT_RESOLVED at https://nope.invalid".to_string(),
        ));
        assert_eq!(network.user_message(), "Failed to load page - network error");
        assert!(!network.user_message().contains("ERR_NAME_NOT_RESOLVED"));

        let status = CaptureError::from(NavigationError::NonSuccessStatus {
            status: 404,
            status_text: "Not Found".to_string(),
        });
        assert_eq!(status.user_message(), "Failed to load page - HTTP 404: Not Found");
    }

    #[test]
    fn test_internal_errors_hide_detail() {
        let err = CaptureError::Io("/var/lib/page-capture/temp: permission denied".to_string());
        assert_eq!(err.user_message(), "Internal server error");

        let err = CaptureError::Persistence(RepositoryError::QueryFailed("boom".to_string()));
        assert_eq!(err.user_message(), "Internal server error");
        assert_eq!(err.severity(), ErrorSeverity::Critical);
    }

    #[test]
    fn test_severity_tracks_blame() {
        assert_eq!(
            CaptureError::UnsafeUrl(UnsafeUrlError::Localhost).severity(),
            ErrorSeverity::Low
        );
        assert_eq!(
            CaptureError::Transform("bad".to_string()).severity(),
            ErrorSeverity::Medium
        );
        assert_eq!(
            CaptureError::RendererUnavailable("no chrome".to_string()).severity(),
            ErrorSeverity::High
        );
    }
}
