//! OpenID Connect Discovery.
//!
//! Provider metadata is fetched once from
//! `{issuer}/.well-known/openid-configuration` when the gateway starts. The
//! document supplies the authorization, token and JWKS endpoints; nothing
//! else about the provider is configured by hand.
//!
//! # Security Considerations
//!
//! - Only HTTPS issuers are accepted unless `allow_http` is set
//! - The document's `issuer` must match the configured issuer
//! - Response size is capped

use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

/// The subset of provider metadata the gateway relies on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OidcDiscoveryDocument {
    /// URL that the OP asserts as its Issuer Identifier.
    pub issuer: String,

    /// URL of the OP's Authorization Endpoint.
    pub authorization_endpoint: String,

    /// URL of the OP's Token Endpoint.
    pub token_endpoint: String,

    /// URL of the OP's JSON Web Key Set document.
    pub jwks_uri: String,

    /// URL of the OP's UserInfo Endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub userinfo_endpoint: Option<String>,

    /// Scope values the provider supports.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scopes_supported: Option<Vec<String>>,

    /// JWS algorithms the provider signs ID tokens with.
    #[serde(default)]
    pub id_token_signing_alg_values_supported: Vec<String>,

    /// Client authentication methods the token endpoint accepts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_endpoint_auth_methods_supported: Option<Vec<String>>,
}

/// Configuration for discovery requests.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// HTTP request timeout (default: 10 seconds).
    pub request_timeout: Duration,

    /// Maximum response size in bytes (default: 1 MB).
    pub max_response_size: usize,

    /// Whether to allow HTTP (non-HTTPS) issuer URLs.
    pub allow_http: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            max_response_size: 1024 * 1024,
            allow_http: false,
        }
    }
}

impl DiscoveryConfig {
    /// Sets the HTTP request timeout.
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Allows HTTP (non-HTTPS) issuer URLs. Local testing only.
    #[must_use]
    pub fn with_allow_http(mut self, allow: bool) -> Self {
        self.allow_http = allow;
        self
    }
}

/// Errors that can occur during OIDC discovery.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    /// A network error occurred while fetching the discovery document.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// The HTTP request returned a non-success status code.
    #[error("HTTP error: status {0}")]
    HttpError(u16),

    /// The discovery document could not be parsed as JSON.
    #[error("Failed to parse discovery document: {0}")]
    ParseError(String),

    /// The issuer URL could not be parsed or is invalid.
    #[error("Invalid issuer URL: {0}")]
    InvalidIssuer(String),

    /// The issuer in the discovery document does not match the expected issuer.
    #[error("Issuer mismatch: expected {expected}, got {actual}")]
    IssuerMismatch {
        /// The expected issuer URL.
        expected: String,
        /// The actual issuer URL from the discovery document.
        actual: String,
    },

    /// The issuer URL scheme is not allowed.
    #[error("Invalid URL scheme: {0} (only HTTPS is allowed)")]
    InvalidScheme(String),

    /// The response exceeded the maximum allowed size.
    #[error("Response exceeds maximum size of {max_size} bytes")]
    ResponseTooLarge {
        /// The maximum allowed size.
        max_size: usize,
    },

    /// The HTTP client could not be constructed.
    #[error("HTTP client setup failed: {0}")]
    ClientSetup(String),
}

/// Client for fetching OIDC discovery documents.
pub struct OidcDiscoveryClient {
    http_client: reqwest::Client,
    config: DiscoveryConfig,
}

impl OidcDiscoveryClient {
    /// Creates a discovery client.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::ClientSetup`] if the HTTP client cannot be
    /// built.
    pub fn new(config: DiscoveryConfig) -> Result<Self, DiscoveryError> {
        let http_client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| DiscoveryError::ClientSetup(e.to_string()))?;

        Ok(Self {
            http_client,
            config,
        })
    }

    /// Fetches and validates the discovery document for `issuer`.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The issuer URL is not HTTPS (unless `allow_http` is true)
    /// - The discovery document cannot be fetched or parsed
    /// - The issuer in the document does not match the expected issuer
    pub async fn discover(&self, issuer: &Url) -> Result<OidcDiscoveryDocument, DiscoveryError> {
        self.validate_issuer_scheme(issuer)?;

        let discovery_url = build_discovery_url(issuer);

        let response = self
            .http_client
            .get(discovery_url.as_str())
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| {
                tracing::warn!(%issuer, error = %e, "Failed to fetch OIDC discovery document");
                DiscoveryError::NetworkError(e.to_string())
            })?;

        if !response.status().is_success() {
            return Err(DiscoveryError::HttpError(response.status().as_u16()));
        }

        if let Some(len) = response.content_length()
            && len as usize > self.config.max_response_size
        {
            return Err(DiscoveryError::ResponseTooLarge {
                max_size: self.config.max_response_size,
            });
        }

        let document: OidcDiscoveryDocument = response.json().await.map_err(|e| {
            tracing::warn!(%issuer, error = %e, "Failed to parse OIDC discovery document");
            DiscoveryError::ParseError(e.to_string())
        })?;

        validate_issuer(&document, issuer)?;

        tracing::debug!(issuer = %document.issuer, "Discovered OIDC configuration");
        Ok(document)
    }

    fn validate_issuer_scheme(&self, issuer: &Url) -> Result<(), DiscoveryError> {
        match issuer.scheme() {
            "https" => Ok(()),
            "http" if self.config.allow_http => Ok(()),
            scheme => Err(DiscoveryError::InvalidScheme(scheme.to_string())),
        }
    }
}

/// Builds `{issuer}/.well-known/openid-configuration`.
fn build_discovery_url(issuer: &Url) -> Url {
    let mut discovery_url = issuer.clone();
    let path = issuer.path().trim_end_matches('/');
    discovery_url.set_path(&format!("{path}/.well-known/openid-configuration"));
    discovery_url
}

/// The document issuer must be identical to the configured one, ignoring a
/// trailing slash.
fn validate_issuer(document: &OidcDiscoveryDocument, expected: &Url) -> Result<(), DiscoveryError> {
    let document_issuer = Url::parse(&document.issuer).map_err(|e| {
        DiscoveryError::InvalidIssuer(format!("{} - {e}", document.issuer))
    })?;

    let expected_normalized = expected.as_str().trim_end_matches('/');
    let document_normalized = document_issuer.as_str().trim_end_matches('/');

    if expected_normalized != document_normalized {
        return Err(DiscoveryError::IssuerMismatch {
            expected: expected_normalized.to_string(),
            actual: document_normalized.to_string(),
        });
    }

    Ok(())
}
