use thiserror::Error;

use crate::db::DbError;

#[derive(Debug, Error)]
pub enum IngestError {
    /// The stored credential can no longer be refreshed; the user has to log in again.
    #[error("authorization expired: {0}")]
    AuthExpired(String),

    /// One message could not be fetched or normalized.
    #[error("message {id}: {reason}")]
    TransientFetch { id: String, reason: String },

    #[error("remote service unavailable: {0}")]
    RemoteUnavailable(String),

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("user {0} not found")]
    UserNotFound(i64),

    #[error(transparent)]
    Storage(#[from] DbError),
}

impl IngestError {
    pub fn transient(id: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::TransientFetch {
            id: id.into(),
            reason: reason.to_string(),
        }
    }

    /// Errors that end the whole request rather than a single message.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::TransientFetch { .. })
    }
}
