use thiserror::Error;

/// Top-level error type for the `aerlink-api` crate.
///
/// Covers the account-service exchange only; socket lifecycle failures are
/// classified by `aerlink-core`, which maps these into its own diagnostics.
#[derive(Debug, Error)]
pub enum Error {
    /// The account service rejected the login.
    #[error("Invalid credentials: {message}")]
    InvalidCredentials { message: String },

    /// HTTP transport error (connection refused, DNS failure, timeout, etc.)
    #[error("Account service unreachable: {0}")]
    Unreachable(#[from] reqwest::Error),

    /// The account service answered, but the payload could not be understood.
    #[error("Malformed account response: {message}")]
    MalformedResponse { message: String },
}

impl Error {
    /// Returns `true` if this failure is terminal for the login attempt
    /// (retrying with the same credentials will not help).
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::InvalidCredentials { .. })
    }

    /// Returns `true` if this is a transient error worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unreachable(_))
    }
}
