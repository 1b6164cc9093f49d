//! Gateway error types.
//!
//! Federation failures are not errors at this level: they become a
//! [`GatewayOutcome`](crate::gateway::GatewayOutcome). A [`GatewayError`] is
//! either a startup problem or a session backend that stopped working.

use crate::config::ConfigError;
use crate::federation::ProviderError;
use crate::federation::discovery::DiscoveryError;
use crate::nonce::NonceError;
use crate::session::SessionError;

/// Errors that stop the gateway from building or from handling a request.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Invalid or incomplete configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// No secure random source is available.
    #[error(transparent)]
    Entropy(#[from] NonceError),

    /// OIDC provider metadata could not be discovered.
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    /// A provider client could not be set up.
    #[error("Provider setup failed: {0}")]
    Provider(#[from] ProviderError),

    /// The session backend failed.
    #[error(transparent)]
    Session(#[from] SessionError),
}

impl GatewayError {
    /// Returns `true` if the error can only happen while starting up.
    #[must_use]
    pub fn is_startup_error(&self) -> bool {
        matches!(
            self,
            Self::Config(_) | Self::Entropy(_) | Self::Discovery(_) | Self::Provider(_)
        )
    }

    /// Returns `true` if a request failed because of the session backend.
    #[must_use]
    pub fn is_session_error(&self) -> bool {
        matches!(self, Self::Session(_))
    }
}
