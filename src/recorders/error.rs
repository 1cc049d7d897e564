use thiserror::Error;

/// Errors surfaced by the recorder registry and by recorder implementations.
#[derive(Debug, Error)]
pub enum RecorderError {
    /// A recorder is already registered for the room.
    #[error("recorder already exists")]
    RecorderExist,

    /// No recorder is registered for the room.
    #[error("recorder does not exist")]
    RecorderNotExist,

    #[error("recorder has already been started")]
    AlreadyStarted,

    #[error("recorder is closed")]
    Closed,

    /// The caller's cancellation token fired before the operation took effect.
    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RecorderError {
    /// Expected-state errors are normal control flow, not failures.
    pub fn is_expected_state(&self) -> bool {
        matches!(self, Self::RecorderExist | Self::RecorderNotExist)
    }
}

impl From<std::io::Error> for RecorderError {
    fn from(err: std::io::Error) -> Self {
        Self::Other(err.into())
    }
}
