//! Per-request gateway decisions.
//!
//! [`Gateway::handle`] looks at the request URL and the session and decides
//! one of four things: let the request through with an [`Identity`], redirect
//! the browser, show the login page, or reject the callback. Nothing is kept
//! between requests except what is written to the session.
//!
//! # Precedence
//!
//! 1. A valid stored credential wins. On the login path the user is sent to
//!    the default path; everywhere else the request passes through.
//! 2. Otherwise the adapter's [`EntryMode`] decides how the handshake starts
//!    and where its callback lands.
//! 3. A failed callback redirects to `failure_redirect` when configured,
//!    else yields [`GatewayOutcome::Rejected`].

use std::sync::Arc;

use serde::Serialize;

use crate::config::{GatewayConfig, ProviderConfig};
use crate::credential::{Credential, CredentialHooks, CredentialService};
use crate::error::GatewayError;
use crate::federation::{
    AuthScheme, CallbackParams, EntryMode, FederationContext, FederationFailure,
    FederationTarget, ProtocolAdapter,
};
use crate::nonce::NonceSource;
use crate::session::{self, Session};

/// The URL of one incoming request, split the way the gateway needs it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayRequest {
    base_url: String,
    path: String,
    query: Option<String>,
}

impl GatewayRequest {
    /// Creates a request.
    ///
    /// `base_url` is the absolute scheme, host and optional mount prefix,
    /// e.g. `https://app.example.com`. `query` is the raw query string
    /// without the leading `?`.
    #[must_use]
    pub fn new(
        base_url: impl Into<String>,
        path: impl Into<String>,
        query: Option<String>,
    ) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let path = path.into();
        let path = if path.starts_with('/') {
            path
        } else {
            format!("/{path}")
        };

        Self {
            base_url,
            path,
            query: query.filter(|q| !q.is_empty()),
        }
    }

    /// Returns the base URL.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Returns the request path.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns the raw query string.
    #[must_use]
    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    /// Returns the absolute URL as requested, query included.
    #[must_use]
    pub fn original_url(&self) -> String {
        match &self.query {
            Some(query) => format!("{}{}?{query}", self.base_url, self.path),
            None => self.url_without_query(),
        }
    }

    /// Returns the absolute URL without its query string.
    #[must_use]
    pub fn url_without_query(&self) -> String {
        self.url_for(&self.path)
    }

    /// Returns the absolute URL of another path on the same base.
    #[must_use]
    pub fn url_for(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// Decodes the query string. A repeated key keeps its last value.
    #[must_use]
    pub fn params(&self) -> CallbackParams {
        self.query
            .as_deref()
            .map(|query| {
                url::form_urlencoded::parse(query.as_bytes())
                    .into_owned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Who the request is authenticated as.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Identity {
    /// Scheme tag of the adapter that authenticated the user.
    pub scheme: AuthScheme,
    /// Authenticated username.
    pub principal: String,
}

/// What the transport should do with a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayOutcome {
    /// Forward to the protected application.
    PassThrough(Identity),
    /// Answer with a temporary redirect.
    Redirect(String),
    /// Render the login page linking to the provider.
    LoginPage {
        /// Provider URL the login link points at.
        authorization_url: String,
    },
    /// The callback was refused and no failure redirect is configured.
    Rejected(FederationFailure),
}

/// Authentication gateway for one identity provider.
pub struct Gateway {
    config: GatewayConfig,
    credentials: CredentialService,
    adapter: ProtocolAdapter,
}

impl Gateway {
    /// Assembles a gateway from ready-made parts.
    #[must_use]
    pub fn new(
        config: GatewayConfig,
        credentials: CredentialService,
        adapter: ProtocolAdapter,
    ) -> Self {
        Self {
            config,
            credentials,
            adapter,
        }
    }

    /// Validates configuration and builds the gateway and its provider
    /// clients.
    ///
    /// # Errors
    ///
    /// Returns a [`GatewayError`] for invalid configuration, or when OIDC
    /// discovery or client setup fails.
    pub async fn from_config(
        config: GatewayConfig,
        provider: &ProviderConfig,
        nonces: Arc<dyn NonceSource>,
    ) -> Result<Self, GatewayError> {
        config.validate()?;
        provider.validate()?;

        let credentials = CredentialService::from_app_id(config.app_id.as_deref(), nonces.clone())
            .with_global_ttl(config.global_ttl);
        let adapter = ProtocolAdapter::from_config(provider, &config, nonces).await?;

        Ok(Self::new(config, credentials, adapter))
    }

    /// Installs credential allow/deny hooks.
    #[must_use]
    pub fn with_credential_hooks(mut self, hooks: Arc<dyn CredentialHooks>) -> Self {
        self.credentials = self.credentials.with_hooks(hooks);
        self
    }

    /// Returns the gateway settings.
    #[must_use]
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Returns the scheme tag of the configured adapter.
    #[must_use]
    pub fn scheme(&self) -> AuthScheme {
        self.adapter.scheme()
    }

    /// Decides what to do with one request.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Session`] if the session cannot be read or
    /// written. Protocol failures are reported as
    /// [`GatewayOutcome::Rejected`] or a failure redirect instead.
    pub async fn handle(
        &self,
        request: &GatewayRequest,
        session: &dyn Session,
    ) -> Result<GatewayOutcome, GatewayError> {
        let keys = self.adapter.session_keys();
        let on_login_path = request.path() == self.config.login_path;

        if let Some(credential) = session::load::<Credential>(session, keys.credential).await? {
            if self.credentials.is_valid(&credential) {
                if on_login_path {
                    return Ok(GatewayOutcome::Redirect(self.default_url(request)));
                }
                return Ok(GatewayOutcome::PassThrough(Identity {
                    scheme: self.adapter.scheme(),
                    principal: credential.subject,
                }));
            }
            tracing::debug!(subject = %credential.subject, "Stored credential is no longer valid");
        }

        let params = request.params();

        match self.adapter.entry_mode() {
            EntryMode::Assume => {
                let original = request.original_url();
                let begin = self.adapter.begin_federation(&FederationTarget {
                    return_to: original.clone(),
                    callback_url: original,
                });
                self.finish(request, session, &params, begin.context).await
            }
            EntryMode::ServiceUrl => {
                if self.adapter.is_callback(&params) {
                    if let Some(context) =
                        session::take::<FederationContext>(session, keys.context).await?
                    {
                        return self.finish(request, session, &params, context).await;
                    }
                    tracing::debug!(path = request.path(), "Callback without a handshake in flight");
                }

                let original = request.original_url();
                self.begin(session, original.clone(), original)
                    .await
                    .map(|begin| GatewayOutcome::Redirect(begin.redirect_target))
            }
            mode @ (EntryMode::LoginPage | EntryMode::ProviderRedirect) => {
                let login_url = request.url_for(&self.config.login_path);

                if !on_login_path {
                    let begin = self.begin(session, request.original_url(), login_url.clone()).await?;
                    return Ok(match mode {
                        EntryMode::LoginPage => GatewayOutcome::Redirect(login_url),
                        _ => GatewayOutcome::Redirect(begin.redirect_target),
                    });
                }

                if self.adapter.is_callback(&params) {
                    return match session::take::<FederationContext>(session, keys.context).await? {
                        Some(context) => self.finish(request, session, &params, context).await,
                        None => Ok(self.fail(FederationFailure::context_mismatch(
                            "callback without a handshake in flight",
                        ))),
                    };
                }

                let return_to = session::load::<FederationContext>(session, keys.context)
                    .await?
                    .map(|context| context.return_to)
                    .filter(|return_to| !return_to.is_empty())
                    .unwrap_or_else(|| self.default_url(request));
                let begin = self.begin(session, return_to, login_url).await?;

                Ok(match mode {
                    EntryMode::LoginPage => GatewayOutcome::LoginPage {
                        authorization_url: begin.redirect_target,
                    },
                    _ => GatewayOutcome::Redirect(begin.redirect_target),
                })
            }
        }
    }

    /// Starts a handshake and remembers its context.
    async fn begin(
        &self,
        session: &dyn Session,
        return_to: String,
        callback_url: String,
    ) -> Result<crate::federation::BeginFederation, GatewayError> {
        let begin = self.adapter.begin_federation(&FederationTarget {
            return_to,
            callback_url,
        });
        session::store(session, self.adapter.session_keys().context, &begin.context).await?;
        tracing::debug!(scheme = %self.adapter.scheme(), "Started federation handshake");
        Ok(begin)
    }

    /// Completes a handshake and, on success, stores a fresh credential.
    async fn finish(
        &self,
        request: &GatewayRequest,
        session: &dyn Session,
        params: &CallbackParams,
        context: FederationContext,
    ) -> Result<GatewayOutcome, GatewayError> {
        let username = match self
            .adapter
            .complete_federation(params, &request.url_without_query(), &context)
            .await
        {
            Ok(username) => username,
            Err(failure) => return Ok(self.fail(failure)),
        };

        session.regenerate().await?;
        let credential = self.credentials.issue(username.into_inner());
        session::store(session, self.adapter.session_keys().credential, &credential).await?;
        tracing::info!(
            scheme = %self.adapter.scheme(),
            subject = %credential.subject,
            "User authenticated"
        );

        let return_to = if context.return_to.is_empty() {
            self.default_url(request)
        } else {
            context.return_to
        };
        Ok(GatewayOutcome::Redirect(return_to))
    }

    fn fail(&self, failure: FederationFailure) -> GatewayOutcome {
        tracing::warn!(
            scheme = %self.adapter.scheme(),
            reason = %failure.reason,
            detail = %failure.detail,
            "Federation failed"
        );
        match &self.config.failure_redirect {
            Some(url) => GatewayOutcome::Redirect(url.clone()),
            None => GatewayOutcome::Rejected(failure),
        }
    }

    fn default_url(&self, request: &GatewayRequest) -> String {
        request.url_for(&self.config.default_path)
    }
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("config", &self.config)
            .field("credentials", &self.credentials)
            .field("adapter", &self.adapter)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::{Value, json};
    use url::Url;

    use super::*;
    use crate::config::{OidcConfig, UsernameClaims};
    use crate::federation::cas::{CasAdapter, TicketValidator};
    use crate::federation::dummy::DummyAdapter;
    use crate::federation::oidc::{CodeExchanger, IdTokenClaims, OidcAdapter};
    use crate::federation::openid2::{AssertionStatus, AssertionVerifier, OpenId2Adapter};
    use crate::federation::{FailureReason, ProviderError};
    use crate::nonce::testing::SequenceNonceSource;
    use crate::session::{MemorySession, SessionError};

    const BASE: &str = "http://host";

    fn nonces() -> Arc<dyn NonceSource> {
        Arc::new(SequenceNonceSource::default())
    }

    fn gateway_with(adapter: ProtocolAdapter, config: GatewayConfig) -> Gateway {
        let credentials = CredentialService::new("app-1", nonces());
        Gateway::new(config, credentials, adapter)
    }

    fn get(path: &str, query: Option<&str>) -> GatewayRequest {
        GatewayRequest::new(BASE, path, query.map(str::to_string))
    }

    // ---- collaborators ----

    #[derive(Default)]
    struct FakeCas {
        user: Option<String>,
        seen: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl TicketValidator for FakeCas {
        async fn validate(
            &self,
            service: &str,
            ticket: &str,
        ) -> Result<Option<String>, ProviderError> {
            self.seen
                .lock()
                .unwrap()
                .push((service.to_string(), ticket.to_string()));
            Ok(self.user.clone())
        }
    }

    fn cas_gateway(user: Option<&str>, config: GatewayConfig) -> (Gateway, Arc<FakeCas>) {
        let validator = Arc::new(FakeCas {
            user: user.map(str::to_string),
            ..Default::default()
        });
        let adapter = ProtocolAdapter::Cas(CasAdapter::new(
            Url::parse("https://cas.example.com/cas/login").unwrap(),
            validator.clone(),
            nonces(),
        ));
        (gateway_with(adapter, config), validator)
    }

    #[derive(Default)]
    struct FakeOidc {
        subject: String,
        nonce: Mutex<Option<String>>,
        redirect_uris: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CodeExchanger for FakeOidc {
        async fn exchange_code(
            &self,
            _code: &str,
            redirect_uri: &str,
        ) -> Result<IdTokenClaims, ProviderError> {
            self.redirect_uris.lock().unwrap().push(redirect_uri.to_string());
            let claims = json!({
                "sub": self.subject,
                "iss": "https://idp.example.com",
                "nonce": self.nonce.lock().unwrap().clone(),
            });
            match claims {
                Value::Object(map) => Ok(map),
                _ => unreachable!(),
            }
        }
    }

    fn oidc_gateway() -> (Gateway, Arc<FakeOidc>) {
        let exchanger = Arc::new(FakeOidc {
            subject: "alice".to_string(),
            ..Default::default()
        });
        let config = OidcConfig {
            issuer: Url::parse("https://idp.example.com").unwrap(),
            client_id: "gatehouse".to_string(),
            client_secret: None,
            scopes: vec!["openid".to_string()],
            username_claims: UsernameClaims::Single("sub".to_string()),
            clock_skew: Duration::from_secs(60),
            allow_http: false,
        };
        let adapter = ProtocolAdapter::Oidc(OidcAdapter::new(
            Url::parse("https://idp.example.com/authorize").unwrap(),
            &config,
            exchanger.clone(),
            nonces(),
        ));
        (gateway_with(adapter, GatewayConfig::default()), exchanger)
    }

    struct AlwaysValid;

    #[async_trait]
    impl AssertionVerifier for AlwaysValid {
        async fn verify(
            &self,
            _params: &CallbackParams,
            _current_url: &str,
        ) -> Result<AssertionStatus, ProviderError> {
            Ok(AssertionStatus::Success)
        }
    }

    fn openid2_gateway() -> Gateway {
        let adapter = ProtocolAdapter::OpenId2(OpenId2Adapter::new(
            Url::parse("https://steamcommunity.com/openid/login").unwrap(),
            Arc::new(AlwaysValid),
            nonces(),
        ));
        gateway_with(adapter, GatewayConfig::default())
    }

    fn stored_context(session: &MemorySession, key: &str) -> FederationContext {
        serde_json::from_value(session.snapshot()[key].clone()).unwrap()
    }

    // ---- CAS ----

    #[tokio::test]
    async fn test_cas_end_to_end() {
        let (gateway, validator) = cas_gateway(Some("jdoe"), GatewayConfig::default());
        let session = MemorySession::new();

        let outcome = gateway.handle(&get("/protected", None), &session).await.unwrap();
        assert_eq!(
            outcome,
            GatewayOutcome::Redirect(
                "https://cas.example.com/cas/login?service=http%3A%2F%2Fhost%2Fprotected"
                    .to_string()
            )
        );
        assert_eq!(
            stored_context(&session, "cas.service").return_to,
            "http://host/protected"
        );

        let outcome = gateway
            .handle(&get("/protected", Some("ticket=ST-123")), &session)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            GatewayOutcome::Redirect("http://host/protected".to_string())
        );
        assert_eq!(
            validator.seen.lock().unwrap().as_slice(),
            [("http://host/protected".to_string(), "ST-123".to_string())]
        );
        assert!(session.contains("cas.auth_info"));
        assert!(!session.contains("cas.service"));

        let outcome = gateway.handle(&get("/protected", None), &session).await.unwrap();
        assert_eq!(
            outcome,
            GatewayOutcome::PassThrough(Identity {
                scheme: AuthScheme::Cas,
                principal: "jdoe".to_string(),
            })
        );
    }

    #[tokio::test]
    async fn test_cas_ticket_without_context_restarts() {
        let (gateway, validator) = cas_gateway(Some("jdoe"), GatewayConfig::default());
        let session = MemorySession::new();

        let outcome = gateway
            .handle(&get("/protected", Some("ticket=ST-9")), &session)
            .await
            .unwrap();

        let GatewayOutcome::Redirect(location) = outcome else {
            panic!("expected redirect, got {outcome:?}");
        };
        assert!(location.starts_with("https://cas.example.com/cas/login?service="));
        assert!(validator.seen.lock().unwrap().is_empty());
        assert!(session.contains("cas.service"));
    }

    #[tokio::test]
    async fn test_cas_rejected_ticket() {
        let (gateway, _) = cas_gateway(None, GatewayConfig::default());
        let session = MemorySession::new();

        gateway.handle(&get("/protected", None), &session).await.unwrap();
        let outcome = gateway
            .handle(&get("/protected", Some("ticket=ST-1")), &session)
            .await
            .unwrap();

        let GatewayOutcome::Rejected(failure) = outcome else {
            panic!("expected rejection, got {outcome:?}");
        };
        assert_eq!(failure.reason, FailureReason::ProviderRejected);
        assert!(!session.contains("cas.auth_info"));
        assert!(!session.contains("cas.service"));
    }

    #[tokio::test]
    async fn test_failure_redirect() {
        let config = GatewayConfig {
            failure_redirect: Some("https://app.example.com/denied".to_string()),
            ..Default::default()
        };
        let (gateway, _) = cas_gateway(None, config);
        let session = MemorySession::new();

        gateway.handle(&get("/protected", None), &session).await.unwrap();
        let outcome = gateway
            .handle(&get("/protected", Some("ticket=ST-1")), &session)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            GatewayOutcome::Redirect("https://app.example.com/denied".to_string())
        );
    }

    /// Records every identifier rotation and what the record held then.
    #[derive(Default)]
    struct RotatingSession {
        inner: MemorySession,
        rotations: Mutex<Vec<bool>>,
    }

    #[async_trait]
    impl Session for RotatingSession {
        async fn get(&self, key: &str) -> Result<Option<Value>, SessionError> {
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: Value) -> Result<(), SessionError> {
            self.inner.set(key, value).await
        }

        async fn delete(&self, key: &str) -> Result<(), SessionError> {
            self.inner.delete(key).await
        }

        async fn regenerate(&self) -> Result<(), SessionError> {
            let had_credential = self.inner.contains("cas.auth_info");
            self.rotations.lock().unwrap().push(had_credential);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_session_rotated_before_credential_is_stored() {
        let (gateway, _) = cas_gateway(Some("jdoe"), GatewayConfig::default());
        let session = RotatingSession::default();

        gateway.handle(&get("/protected", None), &session).await.unwrap();
        assert!(session.rotations.lock().unwrap().is_empty());

        gateway
            .handle(&get("/protected", Some("ticket=ST-123")), &session)
            .await
            .unwrap();
        assert_eq!(session.rotations.lock().unwrap().as_slice(), [false]);
        assert!(session.inner.contains("cas.auth_info"));

        // Requests riding on the stored credential keep their identifier
        gateway.handle(&get("/protected", None), &session).await.unwrap();
        assert_eq!(session.rotations.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_handshake_does_not_rotate_session() {
        let (gateway, _) = cas_gateway(None, GatewayConfig::default());
        let session = RotatingSession::default();

        gateway.handle(&get("/protected", None), &session).await.unwrap();
        gateway
            .handle(&get("/protected", Some("ticket=ST-1")), &session)
            .await
            .unwrap();
        assert!(session.rotations.lock().unwrap().is_empty());
    }

    // ---- OIDC ----

    #[tokio::test]
    async fn test_oidc_end_to_end() {
        let (gateway, exchanger) = oidc_gateway();
        let session = MemorySession::new();

        let outcome = gateway.handle(&get("/reports", None), &session).await.unwrap();
        let GatewayOutcome::Redirect(location) = outcome else {
            panic!("expected redirect, got {outcome:?}");
        };
        assert!(location.starts_with("https://idp.example.com/authorize?"));
        assert!(location.contains("redirect_uri=http%3A%2F%2Fhost%2Flogin"));

        let context = stored_context(&session, "oidc.state");
        assert_eq!(context.return_to, "http://host/reports");
        *exchanger.nonce.lock().unwrap() = context.nonce.clone();

        let query = format!("code=abc&state={}", context.state);
        let outcome = gateway
            .handle(&get("/login", Some(&query)), &session)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            GatewayOutcome::Redirect("http://host/reports".to_string())
        );
        assert_eq!(
            exchanger.redirect_uris.lock().unwrap().as_slice(),
            ["http://host/login"]
        );
        assert!(!session.contains("oidc.state"));

        let outcome = gateway.handle(&get("/reports", None), &session).await.unwrap();
        assert_eq!(
            outcome,
            GatewayOutcome::PassThrough(Identity {
                scheme: AuthScheme::Oidc,
                principal: "alice".to_string(),
            })
        );
    }

    #[tokio::test]
    async fn test_oidc_wrong_state_is_rejected() {
        let (gateway, exchanger) = oidc_gateway();
        let session = MemorySession::new();

        gateway.handle(&get("/reports", None), &session).await.unwrap();
        let outcome = gateway
            .handle(&get("/login", Some("code=abc&state=forged")), &session)
            .await
            .unwrap();

        let GatewayOutcome::Rejected(failure) = outcome else {
            panic!("expected rejection, got {outcome:?}");
        };
        assert_eq!(failure.reason, FailureReason::ContextMismatch);
        assert!(failure.is_bad_request());
        assert!(!session.contains("oidc.auth_info"));
        assert!(exchanger.redirect_uris.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_oidc_callback_without_code_is_terminal() {
        let (gateway, exchanger) = oidc_gateway();
        let session = MemorySession::new();

        gateway.handle(&get("/reports", None), &session).await.unwrap();
        let context = stored_context(&session, "oidc.state");

        let query = format!("state={}", context.state);
        let outcome = gateway
            .handle(&get("/login", Some(&query)), &session)
            .await
            .unwrap();

        let GatewayOutcome::Rejected(failure) = outcome else {
            panic!("expected rejection, got {outcome:?}");
        };
        assert_eq!(failure.reason, FailureReason::MissingParameter);
        assert!(failure.is_bad_request());
        assert!(!session.contains("oidc.state"));
        assert!(!session.contains("oidc.auth_info"));
        assert!(exchanger.redirect_uris.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_oidc_callback_without_context() {
        let (gateway, _) = oidc_gateway();
        let session = MemorySession::new();

        let outcome = gateway
            .handle(&get("/login", Some("code=abc&state=x")), &session)
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            GatewayOutcome::Rejected(FederationFailure {
                reason: FailureReason::ContextMismatch,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_oidc_login_path_without_callback_redirects_to_provider() {
        let (gateway, _) = oidc_gateway();
        let session = MemorySession::new();

        let outcome = gateway.handle(&get("/login", None), &session).await.unwrap();
        let GatewayOutcome::Redirect(location) = outcome else {
            panic!("expected redirect, got {outcome:?}");
        };
        assert!(location.starts_with("https://idp.example.com/authorize?"));
        assert_eq!(stored_context(&session, "oidc.state").return_to, "http://host/");
    }

    // ---- OpenID 2.0 ----

    #[tokio::test]
    async fn test_openid2_two_hop_login() {
        let gateway = openid2_gateway();
        let session = MemorySession::new();

        let outcome = gateway.handle(&get("/reports", None), &session).await.unwrap();
        assert_eq!(outcome, GatewayOutcome::Redirect("http://host/login".to_string()));

        let outcome = gateway.handle(&get("/login", None), &session).await.unwrap();
        let GatewayOutcome::LoginPage { authorization_url } = outcome else {
            panic!("expected login page, got {outcome:?}");
        };
        assert!(authorization_url.starts_with("https://steamcommunity.com/openid/login?"));

        let context = stored_context(&session, "oid2.return_to");
        assert_eq!(context.return_to, "http://host/reports");

        let identity = "https://steamcommunity.com/openid/id/7656";
        let query = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("state", &context.state)
            .append_pair("openid.mode", "id_res")
            .append_pair("openid.identity", identity)
            .finish();
        let outcome = gateway
            .handle(&get("/login", Some(&query)), &session)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            GatewayOutcome::Redirect("http://host/reports".to_string())
        );

        let outcome = gateway.handle(&get("/reports", None), &session).await.unwrap();
        assert_eq!(
            outcome,
            GatewayOutcome::PassThrough(Identity {
                scheme: AuthScheme::OpenId2,
                principal: identity.to_string(),
            })
        );
    }

    // ---- Dummy ----

    #[tokio::test]
    async fn test_dummy_authenticates_immediately() {
        let adapter = ProtocolAdapter::Dummy(DummyAdapter::new("dev", nonces()));
        let gateway = gateway_with(adapter, GatewayConfig::default());
        let session = MemorySession::new();

        let outcome = gateway.handle(&get("/page", Some("x=1")), &session).await.unwrap();
        assert_eq!(
            outcome,
            GatewayOutcome::Redirect("http://host/page?x=1".to_string())
        );
        assert!(!session.contains("dummy.state"));

        let outcome = gateway.handle(&get("/page", None), &session).await.unwrap();
        assert_eq!(
            outcome,
            GatewayOutcome::PassThrough(Identity {
                scheme: AuthScheme::Dummy,
                principal: "dev".to_string(),
            })
        );
    }

    // ---- credential handling ----

    #[tokio::test]
    async fn test_login_path_is_idempotent_when_authenticated() {
        let (gateway, _) = oidc_gateway();
        let session = MemorySession::new();
        let credential = gateway.credentials.issue("alice");
        session::store(&session, "oidc.auth_info", &credential)
            .await
            .unwrap();

        for query in [None, Some("code=abc&state=x")] {
            let outcome = gateway.handle(&get("/login", query), &session).await.unwrap();
            assert_eq!(outcome, GatewayOutcome::Redirect("http://host/".to_string()));
        }

        let stored: Credential = session::load(&session, "oidc.auth_info")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored, credential);
    }

    #[tokio::test]
    async fn test_expired_credential_restarts_federation() {
        let (gateway, _) = oidc_gateway();
        let gateway = Gateway {
            credentials: gateway
                .credentials
                .clone()
                .with_global_ttl(Some(Duration::from_secs(60))),
            ..gateway
        };
        let session = MemorySession::new();
        let stale = gateway.credentials.issue_at("alice", 0);
        session::store(&session, "oidc.auth_info", &stale).await.unwrap();

        let outcome = gateway.handle(&get("/reports", None), &session).await.unwrap();
        assert!(matches!(outcome, GatewayOutcome::Redirect(url) if url.starts_with("https://idp.example.com/")));
    }

    #[tokio::test]
    async fn test_foreign_audience_is_not_trusted() {
        let (gateway, _) = cas_gateway(Some("jdoe"), GatewayConfig::default());
        let session = MemorySession::new();
        let foreign = CredentialService::new("other-app", nonces()).issue("mallory");
        session::store(&session, "cas.auth_info", &foreign).await.unwrap();

        let outcome = gateway.handle(&get("/protected", None), &session).await.unwrap();
        assert!(matches!(outcome, GatewayOutcome::Redirect(_)));
    }

    struct BrokenSession;

    #[async_trait]
    impl Session for BrokenSession {
        async fn get(&self, _key: &str) -> Result<Option<Value>, SessionError> {
            Err(SessionError::unavailable("store offline"))
        }

        async fn set(&self, _key: &str, _value: Value) -> Result<(), SessionError> {
            Err(SessionError::unavailable("store offline"))
        }

        async fn delete(&self, _key: &str) -> Result<(), SessionError> {
            Err(SessionError::unavailable("store offline"))
        }
    }

    #[tokio::test]
    async fn test_session_failure_escalates() {
        let (gateway, _) = cas_gateway(Some("jdoe"), GatewayConfig::default());
        let err = gateway
            .handle(&get("/protected", None), &BrokenSession)
            .await
            .unwrap_err();
        assert!(err.is_session_error());
    }

    // ---- request URLs ----

    #[test]
    fn test_request_urls() {
        let request = GatewayRequest::new("https://app.example.com/", "/a b", Some("x=1&y=%20".to_string()));
        assert_eq!(request.original_url(), "https://app.example.com/a b?x=1&y=%20");
        assert_eq!(request.url_without_query(), "https://app.example.com/a b");
        assert_eq!(request.url_for("/login"), "https://app.example.com/login");
        assert_eq!(request.params()["y"], " ");

        let request = GatewayRequest::new("https://app.example.com", "/", Some(String::new()));
        assert_eq!(request.query(), None);
        assert!(request.params().is_empty());
    }
}
