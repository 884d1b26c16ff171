use thiserror::Error;

use crate::state::team::TeamError;

/// Errors that can occur in service layer operations.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Requested team or participant was not found.
    #[error("not found: {0}")]
    NotFound(String),
    /// A team (or a name still being initialized from a peer) already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),
    /// The team lock could not be acquired within the configured wait.
    ///
    /// Callers must treat this as service-unavailable; the operation is never
    /// retried without the lock.
    #[error("team is busy: lock wait expired")]
    Busy,
    /// Invalid input provided by the client.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// Operation cannot be performed in the current state.
    #[error("invalid state: {0}")]
    InvalidState(String),
    /// The caller canceled the operation before it completed.
    #[error("operation canceled")]
    Canceled,
}

impl From<TeamError> for ServiceError {
    fn from(err: TeamError) -> Self {
        match err {
            TeamError::AlreadyJoined(name) => {
                ServiceError::AlreadyExists(format!("participant `{name}`"))
            }
            TeamError::UnknownParticipant(name) => {
                ServiceError::NotFound(format!("participant `{name}`"))
            }
            TeamError::EmptyName => ServiceError::InvalidInput("name must not be empty".into()),
            TeamError::EmptyDeck => ServiceError::InvalidInput("deck must not be empty".into()),
            TeamError::ValueNotInDeck => {
                ServiceError::InvalidInput("estimation value is not part of the deck".into())
            }
            other => ServiceError::InvalidState(other.to_string()),
        }
    }
}
