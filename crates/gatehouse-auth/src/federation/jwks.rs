//! Provider signing keys.
//!
//! [`JwksCache`] fetches the provider's JSON Web Key Set from the `jwks_uri`
//! found during discovery and keeps it in memory. A token whose `kid` is not
//! in the cached set forces one refetch, which is how provider key rotation
//! is picked up.
//!
//! The cache honours `Cache-Control: max-age`, clamped to configurable
//! bounds.

use std::time::{Duration, Instant};

use jsonwebtoken::jwk::{Jwk, JwkSet, KeyAlgorithm, PublicKeyUse};
use jsonwebtoken::{Algorithm, DecodingKey};
use tokio::sync::RwLock;
use url::Url;

/// Configuration for the JWKS cache.
#[derive(Debug, Clone)]
pub struct JwksCacheConfig {
    /// TTL when Cache-Control is absent (default: 1 hour).
    pub default_ttl: Duration,

    /// Upper bound on any TTL (default: 24 hours).
    pub max_ttl: Duration,

    /// Lower bound on any TTL (default: 5 minutes).
    pub min_ttl: Duration,

    /// HTTP request timeout (default: 10 seconds).
    pub request_timeout: Duration,

    /// Maximum response size in bytes (default: 1 MB).
    pub max_response_size: usize,

    /// Whether to allow an HTTP (non-HTTPS) JWKS URI.
    pub allow_http: bool,
}

impl Default for JwksCacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(3600),
            max_ttl: Duration::from_secs(86400),
            min_ttl: Duration::from_secs(300),
            request_timeout: Duration::from_secs(10),
            max_response_size: 1024 * 1024,
            allow_http: false,
        }
    }
}

impl JwksCacheConfig {
    /// Sets the HTTP request timeout.
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Allows an HTTP (non-HTTPS) JWKS URI. Local testing only.
    #[must_use]
    pub fn with_allow_http(mut self, allow: bool) -> Self {
        self.allow_http = allow;
        self
    }
}

/// Errors that can occur during JWKS operations.
#[derive(Debug, thiserror::Error)]
pub enum JwksError {
    /// A network error occurred while fetching the JWKS.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// The HTTP request returned a non-success status code.
    #[error("HTTP error: status {0}")]
    HttpError(u16),

    /// The JWKS response could not be parsed as JSON.
    #[error("Failed to parse JWKS: {0}")]
    ParseError(String),

    /// The requested key was not found in the JWKS.
    #[error("Key not found: {0}")]
    KeyNotFound(String),

    /// No signing keys were found in the JWKS.
    #[error("No signing keys found in JWKS")]
    NoSigningKeys,

    /// The JWKS URI scheme is not allowed.
    #[error("Invalid URL scheme: only HTTPS is allowed")]
    InvalidScheme,

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

/// A decoding key with the algorithm its JWK declares, if any.
pub type SigningKey = (DecodingKey, Option<Algorithm>);

struct CachedJwks {
    jwks: JwkSet,
    expires_at: Instant,
}

/// In-memory cache of one provider's JWKS.
pub struct JwksCache {
    jwks_uri: Url,
    http_client: reqwest::Client,
    cached: RwLock<Option<CachedJwks>>,
    config: JwksCacheConfig,
}

impl JwksCache {
    /// Creates an empty cache for `jwks_uri`.
    ///
    /// # Errors
    ///
    /// Returns [`JwksError::InvalidScheme`] for a disallowed URI scheme, or
    /// [`JwksError::ClientSetup`] if the HTTP client cannot be built.
    pub fn new(jwks_uri: Url, config: JwksCacheConfig) -> Result<Self, JwksError> {
        validate_scheme(&jwks_uri, config.allow_http)?;

        let http_client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| JwksError::ClientSetup(e.to_string()))?;

        Ok(Self {
            jwks_uri,
            http_client,
            cached: RwLock::new(None),
            config,
        })
    }

    /// Returns the JWKS endpoint.
    #[must_use]
    pub fn jwks_uri(&self) -> &Url {
        &self.jwks_uri
    }

    /// Gets a decoding key by key ID, refetching once on a cache miss.
    ///
    /// # Errors
    ///
    /// Returns an error if the JWKS cannot be fetched or has no key `kid`.
    pub async fn get_key(&self, kid: &str) -> Result<SigningKey, JwksError> {
        if let Some(key) = self.cached_key(kid).await {
            tracing::trace!(kid, "JWKS cache hit");
            return Ok(key);
        }

        tracing::debug!(kid, jwks_uri = %self.jwks_uri, "JWKS cache miss");
        self.refresh().await?;

        self.cached_key(kid)
            .await
            .ok_or_else(|| JwksError::KeyNotFound(kid.to_string()))
    }

    async fn cached_key(&self, kid: &str) -> Option<SigningKey> {
        let cached = self.cached.read().await;
        let cached = cached.as_ref()?;
        if Instant::now() >= cached.expires_at {
            return None;
        }

        cached
            .jwks
            .keys
            .iter()
            .find(|k| k.common.key_id.as_deref() == Some(kid))
            .and_then(|jwk| {
                DecodingKey::from_jwk(jwk)
                    .ok()
                    .map(|dk| (dk, jwk_algorithm(jwk)))
            })
    }

    /// Returns every non-encryption key, for tokens without a `kid`.
    ///
    /// # Errors
    ///
    /// Returns an error if the JWKS cannot be fetched or holds no usable
    /// signing key.
    pub async fn find_signing_keys(&self) -> Result<Vec<SigningKey>, JwksError> {
        self.ensure_cached().await?;

        let cached = self.cached.read().await;
        let cached = cached
            .as_ref()
            .ok_or_else(|| JwksError::NetworkError("Cache miss after refresh".to_string()))?;

        let keys: Vec<_> = cached
            .jwks
            .keys
            .iter()
            .filter(|k| !matches!(&k.common.public_key_use, Some(PublicKeyUse::Encryption)))
            .filter_map(|jwk| {
                DecodingKey::from_jwk(jwk)
                    .ok()
                    .map(|dk| (dk, jwk_algorithm(jwk)))
            })
            .collect();

        if keys.is_empty() {
            Err(JwksError::NoSigningKeys)
        } else {
            Ok(keys)
        }
    }

    async fn ensure_cached(&self) -> Result<(), JwksError> {
        {
            let cached = self.cached.read().await;
            if let Some(cached) = cached.as_ref()
                && Instant::now() < cached.expires_at
            {
                return Ok(());
            }
        }

        self.refresh().await
    }

    /// Fetches the JWKS and replaces the cached copy.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the body is not a JWKS.
    pub async fn refresh(&self) -> Result<(), JwksError> {
        let response = self
            .http_client
            .get(self.jwks_uri.as_str())
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| {
                tracing::warn!(jwks_uri = %self.jwks_uri, error = %e, "Failed to fetch JWKS");
                JwksError::NetworkError(e.to_string())
            })?;

        if !response.status().is_success() {
            return Err(JwksError::HttpError(response.status().as_u16()));
        }

        if let Some(len) = response.content_length()
            && len as usize > self.config.max_response_size
        {
            return Err(JwksError::ResponseTooLarge {
                max_size: self.config.max_response_size,
            });
        }

        let ttl = self.parse_cache_control(response.headers());

        let jwks: JwkSet = response.json().await.map_err(|e| {
            tracing::warn!(jwks_uri = %self.jwks_uri, error = %e, "Failed to parse JWKS");
            JwksError::ParseError(e.to_string())
        })?;

        tracing::debug!(
            jwks_uri = %self.jwks_uri,
            keys = jwks.keys.len(),
            ?ttl,
            "Cached provider JWKS"
        );

        *self.cached.write().await = Some(CachedJwks {
            jwks,
            expires_at: Instant::now() + ttl,
        });

        Ok(())
    }

    /// Extracts `max-age` and clamps it to `[min_ttl, max_ttl]`.
    fn parse_cache_control(&self, headers: &reqwest::header::HeaderMap) -> Duration {
        let ttl = headers
            .get(reqwest::header::CACHE_CONTROL)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| {
                v.split(',')
                    .find_map(|directive| directive.trim().strip_prefix("max-age=")?.parse().ok())
            })
            .map(Duration::from_secs)
            .unwrap_or(self.config.default_ttl);

        ttl.min(self.config.max_ttl).max(self.config.min_ttl)
    }
}

fn validate_scheme(uri: &Url, allow_http: bool) -> Result<(), JwksError> {
    match uri.scheme() {
        "https" => Ok(()),
        "http" if allow_http => Ok(()),
        _ => Err(JwksError::InvalidScheme),
    }
}

fn jwk_algorithm(jwk: &Jwk) -> Option<Algorithm> {
    jwk.common.key_algorithm.as_ref().and_then(|alg| match alg {
        KeyAlgorithm::HS256 => Some(Algorithm::HS256),
        KeyAlgorithm::HS384 => Some(Algorithm::HS384),
        KeyAlgorithm::HS512 => Some(Algorithm::HS512),
        KeyAlgorithm::RS256 => Some(Algorithm::RS256),
        KeyAlgorithm::RS384 => Some(Algorithm::RS384),
        KeyAlgorithm::RS512 => Some(Algorithm::RS512),
        KeyAlgorithm::ES256 => Some(Algorithm::ES256),
        KeyAlgorithm::ES384 => Some(Algorithm::ES384),
        KeyAlgorithm::PS256 => Some(Algorithm::PS256),
        KeyAlgorithm::PS384 => Some(Algorithm::PS384),
        KeyAlgorithm::PS512 => Some(Algorithm::PS512),
        KeyAlgorithm::EdDSA => Some(Algorithm::EdDSA),
        _ => None,
    })
}
