//! Errors raised by provider wire clients.
//!
//! Wire clients report what went wrong talking to the provider; adapters
//! fold these into a [`FederationFailure`] before the gateway sees them.

use super::discovery::DiscoveryError;
use super::jwks::JwksError;
use super::{FailureReason, FederationFailure};

/// Errors that can occur while talking to an identity provider.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// The provider could not be reached.
    #[error("Network error: {0}")]
    Network(String),

    /// The provider answered with a non-success status.
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),

    /// The provider response could not be parsed.
    #[error("Failed to parse provider response: {0}")]
    Parse(String),

    /// The provider returned an OAuth error.
    #[error("OAuth error from provider: {error} - {description}")]
    OAuth {
        /// The OAuth error code.
        error: String,
        /// Optional error description.
        description: String,
    },

    /// Discovery of provider metadata failed.
    #[error("Discovery failed: {0}")]
    Discovery(#[from] DiscoveryError),

    /// Signing keys could not be fetched or used.
    #[error("JWKS error: {0}")]
    Jwks(#[from] JwksError),

    /// The ID token failed signature or claim validation.
    #[error("Token validation failed: {0}")]
    TokenValidation(String),

    /// A required field was absent from a provider response.
    #[error("Missing required field: {0}")]
    MissingField(String),

    /// The HTTP client could not be constructed.
    #[error("HTTP client setup failed: {0}")]
    Client(String),

    /// A provider URL could not be parsed.
    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) => Self::HttpStatus(status.as_u16()),
            None => Self::Network(e.to_string()),
        }
    }
}

impl From<jsonwebtoken::errors::Error> for ProviderError {
    fn from(e: jsonwebtoken::errors::Error) -> Self {
        Self::TokenValidation(e.to_string())
    }
}

impl ProviderError {
    /// Creates an `OAuth` error from a provider response.
    #[must_use]
    pub fn oauth_error(error: impl Into<String>, description: impl Into<String>) -> Self {
        Self::OAuth {
            error: error.into(),
            description: description.into(),
        }
    }

    /// Returns `true` if the provider answered but its answer was unusable.
    #[must_use]
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            Self::Parse(_) | Self::TokenValidation(_) | Self::MissingField(_)
        )
    }

    /// Returns `true` if this is a network or external service error.
    #[must_use]
    pub fn is_external_error(&self) -> bool {
        matches!(
            self,
            Self::Network(_)
                | Self::HttpStatus(_)
                | Self::OAuth { .. }
                | Self::Discovery(_)
                | Self::Jwks(_)
        )
    }

    /// Returns the failure category this error maps to.
    #[must_use]
    pub fn failure_reason(&self) -> FailureReason {
        if self.is_malformed() {
            FailureReason::MalformedAssertion
        } else {
            FailureReason::ProviderRejected
        }
    }

    /// Converts the error into a callback failure.
    #[must_use]
    pub fn into_failure(self) -> FederationFailure {
        FederationFailure::new(self.failure_reason(), self.to_string())
    }
}

impl From<ProviderError> for FederationFailure {
    fn from(e: ProviderError) -> Self {
        e.into_failure()
    }
}
