//! OIDC authorization code exchange and ID token validation.

use std::time::Duration;

use async_trait::async_trait;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use serde::Deserialize;
use url::Url;

use super::discovery::OidcDiscoveryDocument;
use super::error::ProviderError;
use super::jwks::{JwksCache, JwksCacheConfig};
use super::oidc::{CodeExchanger, IdTokenClaims};
use crate::config::OidcConfig;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    id_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Token endpoint client for one OIDC provider.
///
/// Exchanges the authorization code and validates the returned ID token's
/// signature, issuer, audience and expiry. The `nonce` claim is left to the
/// adapter, which owns the per-handshake context.
pub struct OidcTokenClient {
    http_client: reqwest::Client,
    token_endpoint: Url,
    issuer: String,
    client_id: String,
    client_secret: Option<String>,
    jwks: JwksCache,
    clock_skew: Duration,
}

impl OidcTokenClient {
    /// Builds a client from discovered metadata.
    ///
    /// # Errors
    ///
    /// Returns an error if a discovered endpoint is not a valid URL or the
    /// HTTP client cannot be built.
    pub fn new(
        document: &OidcDiscoveryDocument,
        config: &OidcConfig,
        request_timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let token_endpoint = Url::parse(&document.token_endpoint)?;
        let jwks_uri = Url::parse(&document.jwks_uri)?;

        let jwks = JwksCache::new(
            jwks_uri,
            JwksCacheConfig::default()
                .with_request_timeout(request_timeout)
                .with_allow_http(config.allow_http),
        )?;

        let http_client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| ProviderError::Client(e.to_string()))?;

        Ok(Self {
            http_client,
            token_endpoint,
            issuer: document.issuer.clone(),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            jwks,
            clock_skew: config.clock_skew,
        })
    }

    /// Validates an ID token and returns its claims.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::TokenValidation`] if no provider key verifies
    /// the token or a registered claim check fails.
    pub async fn validate_id_token(&self, id_token: &str) -> Result<IdTokenClaims, ProviderError> {
        let header = decode_header(id_token)?;

        let keys = match header.kid.as_deref() {
            Some(kid) => vec![self.jwks.get_key(kid).await?],
            None => self.jwks.find_signing_keys().await?,
        };

        let mut last_error = None;
        for (key, key_alg) in keys {
            if key_alg.is_some_and(|alg| alg != header.alg) {
                continue;
            }
            match self.decode_with(id_token, &key, header.alg) {
                Ok(claims) => return Ok(claims),
                Err(e) => last_error = Some(e),
            }
        }

        Err(last_error.unwrap_or_else(|| {
            ProviderError::TokenValidation(format!(
                "no provider key accepts algorithm {:?}",
                header.alg
            ))
        }))
    }

    fn decode_with(
        &self,
        id_token: &str,
        key: &DecodingKey,
        alg: Algorithm,
    ) -> Result<IdTokenClaims, ProviderError> {
        let mut validation = Validation::new(alg);
        validation.set_audience(&[self.client_id.as_str()]);
        validation.set_issuer(&[self.issuer.as_str()]);
        validation.set_required_spec_claims(&["exp", "iss", "aud", "sub"]);
        validation.leeway = self.clock_skew.as_secs();

        let data = decode::<IdTokenClaims>(id_token, key, &validation)?;
        Ok(data.claims)
    }
}

#[async_trait]
impl CodeExchanger for OidcTokenClient {
    async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
    ) -> Result<IdTokenClaims, ProviderError> {
        let mut form = vec![
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("client_id", self.client_id.as_str()),
        ];
        if let Some(secret) = self.client_secret.as_deref() {
            form.push(("client_secret", secret));
        }

        let response = self
            .http_client
            .post(self.token_endpoint.as_str())
            .header("Accept", "application/json")
            .form(&form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(match serde_json::from_str::<TokenErrorResponse>(&body) {
                Ok(err) => {
                    ProviderError::oauth_error(err.error, err.error_description.unwrap_or_default())
                }
                Err(_) => ProviderError::HttpStatus(status.as_u16()),
            });
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;

        let id_token = token
            .id_token
            .ok_or_else(|| ProviderError::MissingField("id_token".to_string()))?;

        self.validate_id_token(&id_token).await
    }
}
