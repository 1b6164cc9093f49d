//! OpenID 2.0 relying party (stateless mode).
//!
//! Begin builds a `checkid_setup` request with identifier select, so the
//! provider chooses the identity. The `return_to` URL carries a `state`
//! parameter that must come back on the callback.
//!
//! Positive assertions are verified directly with the provider through
//! `check_authentication`. No association is ever established. Before that
//! request the callback's `openid.return_to` is checked against the URL the
//! callback actually arrived on, and `openid.op_endpoint` must be the
//! configured endpoint.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use url::Url;

use super::error::ProviderError;
use super::{
    BeginFederation, CallbackParams, FederationContext, FederationFailure, FederationTarget,
    VerifiedUsername,
};
use crate::nonce::{NonceSource, STATE_LENGTH};
use crate::session::SessionKeys;

/// OpenID 2.0 protocol namespace.
pub const OPENID2_NS: &str = "http://specs.openid.net/auth/2.0";

/// Identifier that lets the provider pick the user's identity.
pub const IDENTIFIER_SELECT: &str = "http://specs.openid.net/auth/2.0/identifier_select";

/// Session keys used by the OpenID 2.0 adapter.
pub const SESSION_KEYS: SessionKeys = SessionKeys {
    credential: "oid2.auth_info",
    context: "oid2.return_to",
};

/// Outcome of verifying an assertion with the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssertionStatus {
    /// The provider confirmed the assertion.
    Success,
    /// The user cancelled at the provider.
    Cancelled,
    /// The provider needs user interaction that `checkid_setup` could not
    /// complete.
    SetupNeeded,
    /// The assertion is not acceptable.
    Failure(String),
}

/// Verifies a positive assertion with the OpenID provider.
#[async_trait]
pub trait AssertionVerifier: Send + Sync {
    /// Checks the callback parameters received on `current_url`.
    ///
    /// `current_url` is the absolute callback URL without its query string.
    async fn verify(
        &self,
        params: &CallbackParams,
        current_url: &str,
    ) -> Result<AssertionStatus, ProviderError>;
}

/// `check_authentication` client for one OP endpoint.
pub struct OpenId2Client {
    http_client: reqwest::Client,
    endpoint: Url,
}

impl OpenId2Client {
    /// Creates a client for `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Client`] if the HTTP client cannot be built.
    pub fn new(endpoint: Url, request_timeout: Duration) -> Result<Self, ProviderError> {
        let http_client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| ProviderError::Client(e.to_string()))?;

        Ok(Self {
            http_client,
            endpoint,
        })
    }

    async fn check_authentication(
        &self,
        params: &CallbackParams,
    ) -> Result<AssertionStatus, ProviderError> {
        let mut form: Vec<(&str, &str)> = params
            .iter()
            .filter(|(k, _)| k.starts_with("openid.") && k.as_str() != "openid.mode")
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        form.push(("openid.mode", "check_authentication"));

        let body = self
            .http_client
            .post(self.endpoint.as_str())
            .form(&form)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;

        let response = parse_key_value_form(&body);
        if response.get("is_valid").map(String::as_str) == Some("true") {
            Ok(AssertionStatus::Success)
        } else {
            Ok(AssertionStatus::Failure(
                "provider did not confirm the assertion".to_string(),
            ))
        }
    }
}

#[async_trait]
impl AssertionVerifier for OpenId2Client {
    async fn verify(
        &self,
        params: &CallbackParams,
        current_url: &str,
    ) -> Result<AssertionStatus, ProviderError> {
        match params.get("openid.mode").map(String::as_str) {
            Some("id_res") => {}
            Some("cancel") => return Ok(AssertionStatus::Cancelled),
            Some("setup_needed") => return Ok(AssertionStatus::SetupNeeded),
            Some(other) => {
                return Ok(AssertionStatus::Failure(format!(
                    "unexpected openid.mode '{other}'"
                )));
            }
            None => return Err(ProviderError::MissingField("openid.mode".to_string())),
        }

        if params.get("openid.ns").map(String::as_str) != Some(OPENID2_NS) {
            return Ok(AssertionStatus::Failure(
                "not an OpenID 2.0 response".to_string(),
            ));
        }

        let return_to = params
            .get("openid.return_to")
            .ok_or_else(|| ProviderError::MissingField("openid.return_to".to_string()))?;
        if let Err(reason) = verify_return_to(return_to, current_url, params) {
            return Ok(AssertionStatus::Failure(reason));
        }

        let op_endpoint = params
            .get("openid.op_endpoint")
            .ok_or_else(|| ProviderError::MissingField("openid.op_endpoint".to_string()))?;
        if Url::parse(op_endpoint).ok().as_ref() != Some(&self.endpoint) {
            return Ok(AssertionStatus::Failure(format!(
                "assertion issued by unexpected endpoint {op_endpoint}"
            )));
        }

        self.check_authentication(params).await
    }
}

/// Checks that `openid.return_to` names the URL the callback arrived on and
/// that every query parameter it carries is present with the same value.
fn verify_return_to(
    return_to: &str,
    current_url: &str,
    params: &CallbackParams,
) -> Result<(), String> {
    let return_to =
        Url::parse(return_to).map_err(|e| format!("openid.return_to is not a URL: {e}"))?;
    let current =
        Url::parse(current_url).map_err(|e| format!("callback URL is not a URL: {e}"))?;

    let same_target = return_to.scheme() == current.scheme()
        && return_to.host_str() == current.host_str()
        && return_to.port_or_known_default() == current.port_or_known_default()
        && return_to.path() == current.path();
    if !same_target {
        return Err(format!(
            "openid.return_to {return_to} does not match callback URL {current}"
        ));
    }

    for (key, value) in return_to.query_pairs() {
        if params.get(key.as_ref()) != Some(&value.to_string()) {
            return Err(format!("return_to parameter '{key}' was altered"));
        }
    }

    Ok(())
}

/// Parses an OpenID key-value form body (`key:value` per line).
fn parse_key_value_form(body: &str) -> HashMap<String, String> {
    body.lines()
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

/// OpenID 2.0 protocol adapter.
pub struct OpenId2Adapter {
    endpoint: Url,
    verifier: Arc<dyn AssertionVerifier>,
    nonces: Arc<dyn NonceSource>,
}

impl OpenId2Adapter {
    /// Creates an adapter for the OP at `endpoint`.
    #[must_use]
    pub fn new(
        endpoint: Url,
        verifier: Arc<dyn AssertionVerifier>,
        nonces: Arc<dyn NonceSource>,
    ) -> Self {
        Self {
            endpoint,
            verifier,
            nonces,
        }
    }

    pub(crate) fn is_callback(&self, params: &CallbackParams) -> bool {
        params.contains_key("openid.mode") || params.contains_key("openid.identity")
    }

    pub(crate) fn begin_federation(&self, target: &FederationTarget) -> BeginFederation {
        let state = self.nonces.generate(STATE_LENGTH);

        let (return_to, realm) = match Url::parse(&target.callback_url) {
            Ok(mut callback) => {
                callback.query_pairs_mut().append_pair("state", &state);
                let realm = format!("{}/", callback.origin().ascii_serialization());
                (callback.to_string(), realm)
            }
            Err(_) => (
                format!("{}?state={state}", target.callback_url),
                target.callback_url.clone(),
            ),
        };

        let mut url = self.endpoint.clone();
        url.query_pairs_mut()
            .append_pair("openid.ns", OPENID2_NS)
            .append_pair("openid.mode", "checkid_setup")
            .append_pair("openid.claimed_id", IDENTIFIER_SELECT)
            .append_pair("openid.identity", IDENTIFIER_SELECT)
            .append_pair("openid.return_to", &return_to)
            .append_pair("openid.realm", &realm);

        BeginFederation {
            redirect_target: url.into(),
            context: FederationContext {
                return_to: target.return_to.clone(),
                state,
                nonce: None,
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

        if params.get("openid.mode").map(String::as_str) == Some("cancel") {
            return Err(FederationFailure::provider_rejected(
                "user cancelled at the provider",
            ));
        }

        let identity = params
            .get("openid.identity")
            .filter(|identity| !identity.is_empty())
            .ok_or_else(|| FederationFailure::missing_parameter("openid.identity"))?;

        match self.verifier.verify(params, request_url).await {
            Ok(AssertionStatus::Success) => Ok(VerifiedUsername::new(identity.clone())),
            Ok(AssertionStatus::Cancelled) => Err(FederationFailure::provider_rejected(
                "user cancelled at the provider",
            )),
            Ok(AssertionStatus::SetupNeeded) => Err(FederationFailure::provider_rejected(
                "provider requires setup",
            )),
            Ok(AssertionStatus::Failure(reason)) => {
                Err(FederationFailure::provider_rejected(reason))
            }
            Err(e) => {
                tracing::warn!(endpoint = %self.endpoint, error = %e, "OpenID assertion check failed");
                Err(e.into_failure())
            }
        }
    }
}
