// Error handling module
// Defines the errors surfaced to callers of the credential manager

use thiserror::Error;

/// Errors returned by [`AuthManager::with_authentication`].
///
/// Provider-call failures never appear here directly; they are folded into
/// the manager's state and surfaced as [`AuthError::Authentication`] on the
/// next access.
///
/// [`AuthManager::with_authentication`]: crate::auth::AuthManager::with_authentication
#[derive(Error, Debug)]
pub enum AuthError {
    /// No usable credentials; the last authentication attempt failed
    #[error("Authentication failure: {0}")]
    Authentication(String),

    /// Credentials were valid but the caller-supplied work failed
    #[error("API call failed: {0}")]
    ApiCall(String),

    /// Observed a state the accessor should never see
    #[error("Internal error: unreachable state")]
    UnreachableState,
}

/// Result type alias for credential manager operations
pub type Result<T> = std::result::Result<T, AuthError>;
