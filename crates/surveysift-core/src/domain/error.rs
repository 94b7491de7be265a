//! Run-level error taxonomy for surveysift.
//!
//! Per-candidate failures never surface here; they become
//! [`FailureMarker`](super::FailureMarker)s. Everything in [`SiftError`] stops
//! the run.

/// Fatal errors that abort an evaluation run.
#[derive(Debug, thiserror::Error)]
pub enum SiftError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("missing credentials: {0}")]
    MissingCredentials(String),

    #[error("model API rejected credentials: {0}")]
    ModelUnauthorized(String),

    #[error("input unreadable: {0}")]
    InputUnreadable(String),

    #[error(
        "checkpoint does not match input at index {index}: expected {expected}, found {actual}"
    )]
    CheckpointMismatch {
        index: usize,
        expected: String,
        actual: String,
    },

    #[error("checkpoint schema version {found} is newer than supported version {supported}")]
    UnsupportedCheckpointVersion { found: u32, supported: u32 },

    #[error("checkpoint corrupt: {0}")]
    CheckpointCorrupt(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl SiftError {
    /// Configuration-level errors: the run cannot start or continue safely.
    pub fn is_fatal_config(&self) -> bool {
        matches!(
            self,
            Self::InvalidConfig(_)
                | Self::MissingCredentials(_)
                | Self::ModelUnauthorized(_)
                | Self::InputUnreadable(_)
                | Self::CheckpointMismatch { .. }
                | Self::UnsupportedCheckpointVersion { .. }
        )
    }
}

/// Result type for surveysift operations.
pub type Result<T> = std::result::Result<T, SiftError>;
