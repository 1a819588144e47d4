//! Rudder error abstractions.

use thiserror::Error;

/// Application error variants.
#[derive(Debug, Error)]
pub enum AppError {
    /// The given input was invalid.
    #[error("validation error: {0}")]
    InvalidInput(String),
    /// The object specified by the given path is not found.
    #[error("the object at {0} was not found")]
    ResourceNotFound(String),
    /// The system has hit an internal error, but will remain online.
    #[error("internal error")]
    Ise(#[from] anyhow::Error),
}

/// The error type used to indicate that a system shutdown is required.
#[derive(Debug, thiserror::Error)]
#[error("fatal error: {0}")]
pub struct ShutdownError(#[from] pub anyhow::Error);

/// A result type where the error is a `ShutdownError`.
pub type ShutdownResult<T> = ::std::result::Result<T, ShutdownError>;
