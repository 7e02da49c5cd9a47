//! Error types for the reconciliation subsystem.

use std::path::PathBuf;

use thiserror::Error;

/// Failures of a reconciliation pass or of one of its collaborators.
#[derive(Error, Debug)]
pub enum GlueError {
    /// The shared peer directory could not be read or written.
    #[error("peer directory unavailable: {0}")]
    DirectoryUnavailable(String),

    /// The configuration template could not be located.
    #[error("configuration template not found: {}", .0.display())]
    TemplateMissing(PathBuf),

    /// The template could not be rendered.
    #[error("failed to render configuration: {0}")]
    Render(String),

    /// The service plan could not be handed to the supervisor.
    #[error("failed to apply service plan: {0}")]
    ServiceApply(String),

    /// A service failed to start.
    #[error("failed to start service {service}: {reason}")]
    ServiceStart { service: String, reason: String },

    /// Any other supervisor failure.
    #[error("supervisor error: {0}")]
    Runtime(#[from] RuntimeError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for reconciliation operations.
pub type Result<T> = std::result::Result<T, GlueError>;

/// Outcome of a failed supervisor primitive.
///
/// Quick exits carry the exit status so callers never have to inspect a
/// diagnostic message to tell a finished command from a crashed one.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    /// The service is already in the requested state.
    #[error("service already in requested state")]
    AlreadyInState,

    /// The process exited before the start grace period elapsed.
    #[error("exited quickly with code {code}")]
    ExitedQuickly { code: i64 },

    /// No definition for the service exists in the plan.
    #[error("unknown service: {0}")]
    UnknownService(String),

    /// The backend rejected the request.
    #[error("{0}")]
    Backend(String),
}

impl GlueError {
    pub fn directory(err: impl std::fmt::Display) -> Self {
        Self::DirectoryUnavailable(err.to_string())
    }

    pub fn start(service: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::ServiceStart {
            service: service.into(),
            reason: reason.to_string(),
        }
    }
}
