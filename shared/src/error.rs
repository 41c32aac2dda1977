//! Error types for the chat gateway Lambda functions.

use thiserror::Error;

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the chat gateway.
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// AWS SDK error
    #[error("AWS error: {0}")]
    Aws(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Validation error (bad shape, unknown protocol kind)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Authentication error (missing or unusable identity)
    #[error("Authentication error: {0}")]
    Auth(String),

    /// An organization-scoped operation was attempted without an organization.
    #[error("Tenant access violation: {0}")]
    TenantAccessViolation(String),

    /// The resource does not exist or belongs to another organization.
    ///
    /// Both cases render identically so callers learn nothing about other tenants.
    #[error("Resource not found: {0}")]
    TenantResourceNotFound(String),

    /// External AI endpoint returned non-2xx or could not be reached.
    #[error("Endpoint error: {0}")]
    Endpoint(String),

    /// Writing the assistant message failed.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// The request was cancelled while an operation was in flight.
    #[error("Request cancelled")]
    Cancelled,

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Get HTTP status code for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::Validation(_) => 400,
            Error::Auth(_) => 401,
            Error::TenantAccessViolation(_) => 403,
            Error::TenantResourceNotFound(_) => 404,
            Error::Endpoint(_) => 502,
            Error::Cancelled => 499,
            _ => 500,
        }
    }

    /// Message safe to return to the caller.
    ///
    /// Infrastructure errors are collapsed so connection strings, SQL and
    /// secret names never leave the Lambda.
    pub fn public_message(&self) -> String {
        match self {
            Error::Validation(_)
            | Error::Auth(_)
            | Error::TenantAccessViolation(_)
            | Error::TenantResourceNotFound(_)
            | Error::Cancelled => self.to_string(),
            Error::Endpoint(_) => "Upstream endpoint error".to_string(),
            _ => "Internal server error".to_string(),
        }
    }
}

impl From<validator::ValidationErrors> for Error {
    fn from(errors: validator::ValidationErrors) -> Self {
        Error::Validation(errors.to_string())
    }
}
