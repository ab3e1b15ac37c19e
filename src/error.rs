use thiserror::Error;

/// Failures other modules need to tell apart. Everything else travels as
/// `anyhow::Error` with context attached at the boundary.
#[derive(Debug, Error)]
pub enum ReleaseImpactError {
    #[error("git command failed: git {command}: {stderr}")]
    Vcs { command: String, stderr: String },

    #[error("state file is not valid JSON: {0}")]
    StateUnparsable(String),

    #[error("state file has an invalid structure: {0}")]
    StateInvalid(String),

    #[error("failed to read document {path}: {reason}")]
    DocumentRead { path: String, reason: String },

    #[error("task cancelled")]
    Cancelled,
}
