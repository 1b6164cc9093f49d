//! OpenID Connect relying party (authorization code flow).
//!
//! Begin sends the user to the provider's authorization endpoint with a
//! fresh `state` and `nonce`. Complete requires both to come back unchanged:
//! `state` on the callback query, `nonce` inside the validated ID token.
//! The username is built from the configured claims.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use url::Url;

use super::error::ProviderError;
use super::{
    BeginFederation, CallbackParams, FederationContext, FederationFailure, FederationTarget,
    VerifiedUsername,
};
use crate::config::{OidcConfig, UsernameClaims};
use crate::nonce::{NonceSource, OIDC_NONCE_LENGTH, STATE_LENGTH};
use crate::session::SessionKeys;

/// Session keys used by the OIDC adapter.
pub const SESSION_KEYS: SessionKeys = SessionKeys {
    credential: "oidc.auth_info",
    context: "oidc.state",
};

/// Claims of a validated ID token.
pub type IdTokenClaims = serde_json::Map<String, Value>;

/// Redeems an authorization code for validated ID token claims.
#[async_trait]
pub trait CodeExchanger: Send + Sync {
    /// Exchanges `code` and returns the claims of the verified ID token.
    ///
    /// Implementations must check signature, issuer, audience and expiry.
    async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
    ) -> Result<IdTokenClaims, ProviderError>;
}

/// OIDC protocol adapter.
pub struct OidcAdapter {
    authorization_endpoint: Url,
    client_id: String,
    scopes: Vec<String>,
    username_claims: UsernameClaims,
    exchanger: Arc<dyn CodeExchanger>,
    nonces: Arc<dyn NonceSource>,
}

impl OidcAdapter {
    /// Creates an adapter for a discovered provider.
    #[must_use]
    pub fn new(
        authorization_endpoint: Url,
        config: &OidcConfig,
        exchanger: Arc<dyn CodeExchanger>,
        nonces: Arc<dyn NonceSource>,
    ) -> Self {
        Self {
            authorization_endpoint,
            client_id: config.client_id.clone(),
            scopes: config.scopes.clone(),
            username_claims: config.username_claims.clone(),
            exchanger,
            nonces,
        }
    }

    /// Any of `code`, `state` or `error` marks a provider callback, so a
    /// partial one fails instead of silently restarting the handshake.
    pub(crate) fn is_callback(&self, params: &CallbackParams) -> bool {
        ["code", "state", "error"]
            .iter()
            .any(|key| params.contains_key(*key))
    }

    pub(crate) fn begin_federation(&self, target: &FederationTarget) -> BeginFederation {
        let state = self.nonces.generate(STATE_LENGTH);
        let nonce = self.nonces.generate(OIDC_NONCE_LENGTH);

        let mut url = self.authorization_endpoint.clone();
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &self.client_id)
            .append_pair("redirect_uri", &target.callback_url)
            .append_pair("scope", &self.scopes.join(" "))
            .append_pair("state", &state)
            .append_pair("nonce", &nonce);

        BeginFederation {
            redirect_target: url.into(),
            context: FederationContext {
                return_to: target.return_to.clone(),
                state,
                nonce: Some(nonce),
            },
        }
    }

    pub(crate) async fn complete_federation(
        &self,
        params: &CallbackParams,
        request_url: &str,
        context: &FederationContext,
    ) -> Result<VerifiedUsername, FederationFailure> {
        let state = params
            .get("state")
            .ok_or_else(|| FederationFailure::missing_parameter("state"))?;
        if *state != context.state {
            return Err(FederationFailure::context_mismatch(
                "callback state does not match the stored handshake",
            ));
        }

        if let Some(error) = params.get("error") {
            let description = params
                .get("error_description")
                .map(String::as_str)
                .unwrap_or_default();
            return Err(FederationFailure::provider_rejected(format!(
                "authorization denied: {error} {description}"
            )));
        }

        let code = params
            .get("code")
            .ok_or_else(|| FederationFailure::missing_parameter("code"))?;

        let expected_nonce = context.nonce.as_deref().ok_or_else(|| {
            FederationFailure::context_mismatch("stored handshake carries no nonce")
        })?;

        let claims = self
            .exchanger
            .exchange_code(code, request_url)
            .await
            .map_err(|e| {
                tracing::warn!(error = %e, "OIDC code exchange failed");
                e.into_failure()
            })?;

        match claims.get("nonce").and_then(Value::as_str) {
            Some(nonce) if nonce == expected_nonce => {}
            Some(_) => {
                return Err(FederationFailure::context_mismatch(
                    "ID token nonce does not match the stored handshake",
                ));
            }
            None => {
                return Err(FederationFailure::context_mismatch(
                    "ID token carries no nonce",
                ));
            }
        }

        derive_username(&claims, &self.username_claims).map(VerifiedUsername::new)
    }
}

/// Joins the configured claims with `@`.
///
/// String claims are used verbatim and numbers in their decimal form; any
/// other type, or an absent claim, is a malformed assertion.
pub fn derive_username(
    claims: &IdTokenClaims,
    username_claims: &UsernameClaims,
) -> Result<String, FederationFailure> {
    let parts = username_claims
        .names()
        .into_iter()
        .map(|name| match claims.get(name) {
            Some(Value::String(s)) if s.is_empty() => Err(FederationFailure::malformed_assertion(
                format!("claim '{name}' is empty"),
            )),
            Some(Value::String(s)) => Ok(s.clone()),
            Some(Value::Number(n)) => Ok(n.to_string()),
            Some(_) => Err(FederationFailure::malformed_assertion(format!(
                "claim '{name}' is not a string"
            ))),
            None => Err(FederationFailure::malformed_assertion(format!(
                "ID token lacks claim '{name}'"
            ))),
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(parts.join("@"))
}
