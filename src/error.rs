//! Error types for Handoff.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Missing or invalid identity.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Authenticated, but not permitted for this resource.
    #[error("Not permitted: {0}")]
    Authorization(String),

    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// A concurrent ownership change won. Callers should re-fetch the
    /// conversation before retrying.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Operation not valid for the conversation's current status.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Internal(String),
}

impl Error {
    /// Stable machine-readable kind, used on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Authentication(_) => "authentication",
            Error::Authorization(_) => "authorization",
            Error::Validation(_) => "validation",
            Error::NotFound(_) => "not_found",
            Error::Conflict(_) => "conflict",
            Error::InvalidState(_) => "invalid_state",
            Error::Config(_)
            | Error::Storage(_)
            | Error::Io(_)
            | Error::Json(_)
            | Error::Internal(_) => "internal",
        }
    }

    /// Whether this error is an internal failure whose detail must not reach
    /// untrusted callers.
    pub fn is_internal(&self) -> bool {
        self.kind() == "internal"
    }

    /// Message safe to show to the caller.
    pub fn public_message(&self) -> String {
        if self.is_internal() {
            "internal error".to_string()
        } else {
            self.to_string()
        }
    }
}

/// Map a SQLite failure into a storage error with context.
pub(crate) fn db(context: &'static str) -> impl Fn(rusqlite::Error) -> Error {
    move |e| Error::Storage(format!("sqlite {}: {}", context, e))
}
