use thiserror::Error;

use super::credentials::StoreError;
use super::notify::{GENERIC_ERROR_MESSAGE, INVALID_CREDENTIALS_MESSAGE, SESSION_EXPIRED_MESSAGE};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Invalid username or password")]
    InvalidCredentials,

    #[error("Token refresh failed: {0}")]
    RefreshFailed(String),

    #[error("Session expired - please log in again")]
    SessionExpired,

    #[error("Credential store error: {0}")]
    Store(#[from] StoreError),

    #[error("Unexpected error: {0}")]
    Unexpected(#[source] anyhow::Error),
}

impl SessionError {
    pub fn unexpected(err: impl Into<anyhow::Error>) -> Self {
        SessionError::Unexpected(err.into())
    }

    /// Message suitable for showing to the user
    pub fn user_message(&self) -> &'static str {
        match self {
            SessionError::InvalidCredentials => INVALID_CREDENTIALS_MESSAGE,
            SessionError::RefreshFailed(_) | SessionError::SessionExpired => SESSION_EXPIRED_MESSAGE,
            SessionError::Store(_) | SessionError::Unexpected(_) => GENERIC_ERROR_MESSAGE,
        }
    }
}
