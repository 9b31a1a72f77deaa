//! Error types for the ServerList client.
//!
//! # Error Types
//!
//! - [`AuthError`] - The single current failure recorded by the session manager
//! - [`ClientError`] - Top-level error encompassing every failure mode of the library
//!
//! Module-specific errors live next to their modules
//! ([`ConfigError`], [`BackendError`], [`StorageError`], [`ValidationError`])
//! and convert into [`ClientError`] with `?`.
//!
//! # Example
//!
//! ```rust,ignore
//! use serverlist_client::error::{AuthError, ClientError};
//!
//! async fn sign_in(app: &ServerList) -> Result<(), ClientError> {
//!     app.session().login("player@example.com", "correct horse").await?;
//!     Ok(())
//! }
//! ```

use thiserror::Error;

use crate::backend::BackendError;
use crate::config::ConfigError;
use crate::storage::StorageError;
use crate::validation::ValidationError;

/// Message shown for failures whose details must not reach the user.
pub const GENERIC_ERROR_MESSAGE: &str = "An unexpected error occurred. Please try again.";

/// A failed auth operation, as recorded in the session state.
///
/// A new error always replaces the previous one; errors never accumulate.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// Rejected locally before reaching the backend.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Rejected by the auth service. The message is shown verbatim.
    #[error("{message}")]
    Rejected {
        /// Message from the auth service.
        message: String,
        /// Machine-readable code, such as `invalid_credentials`.
        code: Option<String>,
    },

    /// Network or unexpected failure. Displays a generic message.
    #[error("An unexpected error occurred. Please try again.")]
    Unexpected {
        /// Underlying failure, for diagnostics only.
        detail: String,
    },
}

impl AuthError {
    /// Returns the machine-readable code, if the service sent one.
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Rejected { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    /// Returns `true` if the failure was caught by local validation.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }
}

impl From<BackendError> for AuthError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Api { message, code, .. } => Self::Rejected { message, code },
            BackendError::MissingSession => Self::Rejected {
                message: err.to_string(),
                code: None,
            },
            other => Self::Unexpected {
                detail: other.to_string(),
            },
        }
    }
}

/// Top-level error type for the ServerList client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Configuration could not be loaded.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// An auth operation failed.
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    /// A table request failed.
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    /// Persisted state could not be read or written.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Local validation failed outside an auth operation.
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    /// The command needs a signed-in user.
    #[error("you must be logged in to do that")]
    NotAuthenticated,

    /// The command needs the admin role.
    #[error("admin access required")]
    NotAuthorized,
}

impl ClientError {
    /// Returns `true` if the user can fix this by changing their input or
    /// signing in, as opposed to a configuration or service problem.
    pub fn is_user_error(&self) -> bool {
        match self {
            Self::Auth(err) => !matches!(err, AuthError::Unexpected { .. }),
            Self::Validation(_) | Self::NotAuthenticated | Self::NotAuthorized => true,
            _ => false,
        }
    }
}

/// A specialized Result type for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;
