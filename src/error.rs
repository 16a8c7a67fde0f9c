use thiserror::Error;

/// Recoverable error taxonomy for the room core.
///
/// `ProgrammerError` conditions (API contract violations such as mutating a
/// room the registry never created) are not represented here; they panic at
/// the call site per the error handling design, since they indicate a bug
/// rather than a condition a client can trigger.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("authorization failed: {0}")]
    Authorization(String),

    #[error("missing entity: {0}")]
    MissingEntity(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("transport error: {0}")]
    Transport(String),
}

impl CoreError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn authorization(msg: impl Into<String>) -> Self {
        Self::Authorization(msg.into())
    }

    pub fn missing_entity(msg: impl Into<String>) -> Self {
        Self::MissingEntity(msg.into())
    }

    pub fn persistence(msg: impl Into<String>) -> Self {
        Self::Persistence(msg.into())
    }

    /// The message to surface to the originating client via an `error` event,
    /// or `None` when the error kind is policy-silent (never shown to peers).
    pub fn client_message(&self) -> Option<String> {
        match self {
            CoreError::Validation(msg) => Some(msg.clone()),
            CoreError::Authorization(_) => None,
            CoreError::MissingEntity(_) => None,
            CoreError::Persistence(_) => None,
            CoreError::Transport(_) => None,
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
