//! # gatehouse-auth
//!
//! Protocol core of the Gatehouse authentication gateway.
//!
//! The gateway sits in front of an application that has no login logic of
//! its own. Unauthenticated browsers are sent through an external identity
//! provider; once the provider vouches for them, a [`Credential`] is kept in
//! their session and later requests pass through with an [`Identity`].
//!
//! ## Modules
//!
//! - [`nonce`] - Random tokens from an injected [`NonceSource`]
//! - [`credential`] - Credential issuance and validity
//! - [`session`] - The narrow session interface the gateway needs
//! - [`federation`] - CAS, OpenID 2.0, OIDC and dummy adapters
//! - [`gateway`] - Per-request decision logic
//! - [`config`] - Gateway and provider settings
//!
//! This crate is transport-agnostic: it never reads HTTP headers or writes
//! responses. See `gatehouse-server` for the axum integration.

pub mod config;
pub mod credential;
pub mod error;
pub mod federation;
pub mod gateway;
pub mod nonce;
pub mod session;

pub use config::{ConfigError, GatewayConfig, ProviderConfig};
pub use credential::{Credential, CredentialHooks, CredentialService};
pub use error::GatewayError;
pub use federation::{
    AuthScheme, FailureReason, FederationContext, FederationFailure, ProtocolAdapter,
    ProviderError,
};
pub use gateway::{Gateway, GatewayOutcome, GatewayRequest, Identity};
pub use nonce::{NonceError, NonceSource, OsNonceSource};
pub use session::{MemorySession, Session, SessionError, SessionKeys};

/// Type alias for gateway results.
pub type GatewayResult<T> = Result<T, GatewayError>;
