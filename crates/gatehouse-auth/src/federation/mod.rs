//! External identity provider federation.
//!
//! Every supported protocol is wrapped in an adapter with the same two-call
//! shape:
//!
//! 1. **Begin** - build the provider redirect and a [`FederationContext`]
//!    to keep in the session
//! 2. **Complete** - check the callback against that context and verify
//!    the assertion with the provider
//!
//! The adapters form a closed set, dispatched through [`ProtocolAdapter`]:
//!
//! - [`cas::CasAdapter`] - CAS ticket validation
//! - [`openid2::OpenId2Adapter`] - OpenID 2.0 `checkid_setup`
//! - [`oidc::OidcAdapter`] - OpenID Connect authorization code flow
//! - [`dummy::DummyAdapter`] - fixed identity for development

pub mod cas;
pub mod discovery;
pub mod dummy;
pub mod error;
pub mod jwks;
pub mod oidc;
pub mod openid2;
pub mod token;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::{GatewayConfig, ProviderConfig};
use crate::error::GatewayError;
use crate::nonce::NonceSource;
use crate::session::SessionKeys;

pub use error::ProviderError;

/// Query parameters received on a provider callback.
pub type CallbackParams = HashMap<String, String>;

/// Per-handshake state kept in the session between begin and complete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FederationContext {
    /// Where to send the user once federation succeeds.
    pub return_to: String,

    /// CSRF token the callback must echo.
    pub state: String,

    /// OIDC nonce bound into the ID token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

/// Input to [`ProtocolAdapter::begin_federation`].
#[derive(Debug, Clone)]
pub struct FederationTarget {
    /// URL to resume after a successful handshake.
    pub return_to: String,

    /// Absolute URL the provider should send the user back to.
    pub callback_url: String,
}

/// Output of [`ProtocolAdapter::begin_federation`].
#[derive(Debug, Clone)]
pub struct BeginFederation {
    /// Provider URL the user must visit.
    pub redirect_target: String,

    /// Context to store in the session until the callback arrives.
    pub context: FederationContext,
}

/// A username confirmed by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedUsername(String);

impl VerifiedUsername {
    /// Wraps a confirmed username.
    #[must_use]
    pub fn new(username: impl Into<String>) -> Self {
        Self(username.into())
    }

    /// Returns the username.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consumes the wrapper.
    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}

/// Authentication scheme tag handed to the protected application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuthScheme {
    /// Central Authentication Service.
    #[serde(rename = "CAS")]
    Cas,
    /// OpenID 2.0.
    #[serde(rename = "OID2")]
    OpenId2,
    /// OpenID Connect.
    #[serde(rename = "OIDC")]
    Oidc,
    /// Development adapter.
    #[serde(rename = "DUMMY")]
    Dummy,
}

impl AuthScheme {
    /// Returns the wire tag (`CAS`, `OID2`, `OIDC`, `DUMMY`).
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cas => "CAS",
            Self::OpenId2 => "OID2",
            Self::Oidc => "OIDC",
            Self::Dummy => "DUMMY",
        }
    }
}

impl fmt::Display for AuthScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How an unauthenticated request enters the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryMode {
    /// The provider returns to the originally requested URL (CAS).
    ServiceUrl,
    /// Protected paths bounce to the login path, which shows a login page
    /// linking to the provider (OpenID 2.0).
    LoginPage,
    /// Protected paths redirect straight to the provider, which calls back
    /// on the login path (OIDC).
    ProviderRedirect,
    /// No provider round trip; the identity is assumed (Dummy).
    Assume,
}

/// Why a federation callback was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureReason {
    /// A required callback parameter was absent.
    MissingParameter,
    /// `state` or `nonce` did not match, or no handshake was in flight.
    ContextMismatch,
    /// The provider declined, or could not be reached.
    ProviderRejected,
    /// The provider response could not be parsed or lacked required fields.
    MalformedAssertion,
}

impl FailureReason {
    /// Returns a stable lowercase identifier for logs.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MissingParameter => "missing_parameter",
            Self::ContextMismatch => "context_mismatch",
            Self::ProviderRejected => "provider_rejected",
            Self::MalformedAssertion => "malformed_assertion",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A refused federation callback.
///
/// `detail` is for logs only and must never be shown to the user.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{reason}: {detail}")]
pub struct FederationFailure {
    /// Failure category.
    pub reason: FailureReason,
    /// Diagnostic message.
    pub detail: String,
}

impl FederationFailure {
    /// Creates a failure.
    #[must_use]
    pub fn new(reason: FailureReason, detail: impl Into<String>) -> Self {
        Self {
            reason,
            detail: detail.into(),
        }
    }

    /// A required callback parameter is absent.
    #[must_use]
    pub fn missing_parameter(name: &str) -> Self {
        Self::new(
            FailureReason::MissingParameter,
            format!("missing callback parameter '{name}'"),
        )
    }

    /// The callback does not belong to the stored handshake.
    #[must_use]
    pub fn context_mismatch(detail: impl Into<String>) -> Self {
        Self::new(FailureReason::ContextMismatch, detail)
    }

    /// The provider refused the assertion.
    #[must_use]
    pub fn provider_rejected(detail: impl Into<String>) -> Self {
        Self::new(FailureReason::ProviderRejected, detail)
    }

    /// The provider response was unusable.
    #[must_use]
    pub fn malformed_assertion(detail: impl Into<String>) -> Self {
        Self::new(FailureReason::MalformedAssertion, detail)
    }

    /// Returns `true` if the client sent a malformed or forged callback.
    #[must_use]
    pub fn is_bad_request(&self) -> bool {
        matches!(
            self.reason,
            FailureReason::MissingParameter | FailureReason::ContextMismatch
        )
    }
}

/// The configured federation protocol.
pub enum ProtocolAdapter {
    /// CAS ticket validation.
    Cas(cas::CasAdapter),
    /// OpenID 2.0.
    OpenId2(openid2::OpenId2Adapter),
    /// OpenID Connect.
    Oidc(oidc::OidcAdapter),
    /// Fixed identity.
    Dummy(dummy::DummyAdapter),
}

impl ProtocolAdapter {
    /// Builds the adapter and its wire client from configuration.
    ///
    /// For OIDC this performs provider discovery, so it must run once at
    /// startup rather than per request.
    ///
    /// # Errors
    ///
    /// Returns a [`GatewayError`] if the HTTP client cannot be built or OIDC
    /// discovery fails.
    pub async fn from_config(
        provider: &ProviderConfig,
        gateway: &GatewayConfig,
        nonces: Arc<dyn NonceSource>,
    ) -> Result<Self, GatewayError> {
        let adapter = match provider {
            ProviderConfig::Cas(cas_config) => {
                let client = cas::CasClient::new(
                    cas_config.validate_url.clone(),
                    gateway.request_timeout,
                )?;
                Self::Cas(cas::CasAdapter::new(
                    cas_config.login_url.clone(),
                    Arc::new(client),
                    nonces,
                ))
            }
            ProviderConfig::Openid2(oid_config) => {
                let client = openid2::OpenId2Client::new(
                    oid_config.endpoint.clone(),
                    gateway.request_timeout,
                )?;
                Self::OpenId2(openid2::OpenId2Adapter::new(
                    oid_config.endpoint.clone(),
                    Arc::new(client),
                    nonces,
                ))
            }
            ProviderConfig::Oidc(oidc_config) => {
                let discovery_client = discovery::OidcDiscoveryClient::new(
                    discovery::DiscoveryConfig::default()
                        .with_request_timeout(gateway.request_timeout)
                        .with_allow_http(oidc_config.allow_http),
                )?;
                let document = discovery_client.discover(&oidc_config.issuer).await?;
                let authorization_endpoint = url::Url::parse(&document.authorization_endpoint)
                    .map_err(ProviderError::from)?;
                let token_client = token::OidcTokenClient::new(
                    &document,
                    oidc_config,
                    gateway.request_timeout,
                )?;
                Self::Oidc(oidc::OidcAdapter::new(
                    authorization_endpoint,
                    oidc_config,
                    Arc::new(token_client),
                    nonces,
                ))
            }
            ProviderConfig::Dummy(dummy_config) => {
                Self::Dummy(dummy::DummyAdapter::new(&dummy_config.username, nonces))
            }
        };

        tracing::info!(scheme = %adapter.scheme(), "Identity provider adapter ready");
        Ok(adapter)
    }

    /// Returns the scheme tag this adapter produces.
    #[must_use]
    pub fn scheme(&self) -> AuthScheme {
        match self {
            Self::Cas(_) => AuthScheme::Cas,
            Self::OpenId2(_) => AuthScheme::OpenId2,
            Self::Oidc(_) => AuthScheme::Oidc,
            Self::Dummy(_) => AuthScheme::Dummy,
        }
    }

    /// Returns how unauthenticated requests enter the handshake.
    #[must_use]
    pub fn entry_mode(&self) -> EntryMode {
        match self {
            Self::Cas(_) => EntryMode::ServiceUrl,
            Self::OpenId2(_) => EntryMode::LoginPage,
            Self::Oidc(_) => EntryMode::ProviderRedirect,
            Self::Dummy(_) => EntryMode::Assume,
        }
    }

    /// Returns the session keys this adapter reads and writes.
    #[must_use]
    pub fn session_keys(&self) -> SessionKeys {
        match self {
            Self::Cas(_) => cas::SESSION_KEYS,
            Self::OpenId2(_) => openid2::SESSION_KEYS,
            Self::Oidc(_) => oidc::SESSION_KEYS,
            Self::Dummy(_) => dummy::SESSION_KEYS,
        }
    }

    /// Returns `true` if `params` carry this protocol's callback.
    #[must_use]
    pub fn is_callback(&self, params: &CallbackParams) -> bool {
        match self {
            Self::Cas(adapter) => adapter.is_callback(params),
            Self::OpenId2(adapter) => adapter.is_callback(params),
            Self::Oidc(adapter) => adapter.is_callback(params),
            Self::Dummy(_) => false,
        }
    }

    /// Builds the provider redirect and the context to remember.
    #[must_use]
    pub fn begin_federation(&self, target: &FederationTarget) -> BeginFederation {
        match self {
            Self::Cas(adapter) => adapter.begin_federation(target),
            Self::OpenId2(adapter) => adapter.begin_federation(target),
            Self::Oidc(adapter) => adapter.begin_federation(target),
            Self::Dummy(adapter) => adapter.begin_federation(target),
        }
    }

    /// Verifies a callback against its stored context.
    ///
    /// `request_url` is the absolute callback URL without its query string.
    ///
    /// # Errors
    ///
    /// Returns a [`FederationFailure`] for any missing parameter, context
    /// mismatch, provider refusal or malformed provider response.
    pub async fn complete_federation(
        &self,
        params: &CallbackParams,
        request_url: &str,
        context: &FederationContext,
    ) -> Result<VerifiedUsername, FederationFailure> {
        match self {
            Self::Cas(adapter) => adapter.complete_federation(params, context).await,
            Self::OpenId2(adapter) => {
                adapter
                    .complete_federation(params, request_url, context)
                    .await
            }
            Self::Oidc(adapter) => {
                adapter
                    .complete_federation(params, request_url, context)
                    .await
            }
            Self::Dummy(adapter) => Ok(adapter.complete_federation()),
        }
    }
}

impl fmt::Debug for ProtocolAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ProtocolAdapter").field(&self.scheme()).finish()
    }
}
