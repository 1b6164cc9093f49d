//! Central Authentication Service (CAS 2.0) client.
//!
//! The user is sent to the CAS login URL with `service` set to the URL they
//! originally asked for. CAS returns them to that same URL with a `ticket`
//! parameter, which is checked against `serviceValidate` together with the
//! stored service URL.

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

/// XML namespace of CAS protocol responses.
pub const CAS_NAMESPACE: &str = "http://www.yale.edu/tp/cas";

/// Session keys used by the CAS adapter.
pub const SESSION_KEYS: SessionKeys = SessionKeys {
    credential: "cas.auth_info",
    context: "cas.service",
};

/// Validates a service ticket with the CAS server.
#[async_trait]
pub trait TicketValidator: Send + Sync {
    /// Returns the authenticated user, or `None` if CAS refused the ticket.
    async fn validate(&self, service: &str, ticket: &str) -> Result<Option<String>, ProviderError>;
}

/// HTTP client for the CAS `serviceValidate` endpoint.
pub struct CasClient {
    http_client: reqwest::Client,
    validate_url: Url,
}

impl CasClient {
    /// Creates a client for `validate_url`.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Client`] if the HTTP client cannot be built.
    pub fn new(validate_url: Url, request_timeout: Duration) -> Result<Self, ProviderError> {
        let http_client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| ProviderError::Client(e.to_string()))?;

        Ok(Self {
            http_client,
            validate_url,
        })
    }
}

#[async_trait]
impl TicketValidator for CasClient {
    async fn validate(&self, service: &str, ticket: &str) -> Result<Option<String>, ProviderError> {
        let mut url = self.validate_url.clone();
        url.query_pairs_mut()
            .append_pair("service", service)
            .append_pair("ticket", ticket);

        let body = self
            .http_client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;

        parse_service_response(&body)
    }
}

/// Extracts the user from a `serviceValidate` response.
///
/// Returns `Ok(None)` for `authenticationFailure` and for a success block
/// without a non-empty `user`.
///
/// # Errors
///
/// Returns [`ProviderError::Parse`] if the body is not well-formed XML.
pub fn parse_service_response(body: &str) -> Result<Option<String>, ProviderError> {
    let document =
        roxmltree::Document::parse(body).map_err(|e| ProviderError::Parse(e.to_string()))?;

    let Some(success) = document
        .descendants()
        .find(|n| n.has_tag_name((CAS_NAMESPACE, "authenticationSuccess")))
    else {
        if let Some(failure) = document
            .descendants()
            .find(|n| n.has_tag_name((CAS_NAMESPACE, "authenticationFailure")))
        {
            tracing::debug!(
                code = failure.attribute("code").unwrap_or_default(),
                "CAS refused the ticket"
            );
        }
        return Ok(None);
    };

    let user = success
        .descendants()
        .find(|n| n.has_tag_name((CAS_NAMESPACE, "user")))
        .and_then(|n| n.text())
        .map(str::trim)
        .filter(|user| !user.is_empty())
        .map(str::to_string);

    Ok(user)
}

/// CAS protocol adapter.
pub struct CasAdapter {
    login_url: Url,
    validator: Arc<dyn TicketValidator>,
    nonces: Arc<dyn NonceSource>,
}

impl CasAdapter {
    /// Creates an adapter for the given CAS login URL.
    #[must_use]
    pub fn new(
        login_url: Url,
        validator: Arc<dyn TicketValidator>,
        nonces: Arc<dyn NonceSource>,
    ) -> Self {
        Self {
            login_url,
            validator,
            nonces,
        }
    }

    pub(crate) fn is_callback(&self, params: &CallbackParams) -> bool {
        params.contains_key("ticket")
    }

    pub(crate) fn begin_federation(&self, target: &FederationTarget) -> BeginFederation {
        let mut url = self.login_url.clone();
        url.query_pairs_mut().append_pair("service", &target.return_to);

        BeginFederation {
            redirect_target: url.into(),
            context: FederationContext {
                return_to: target.return_to.clone(),
                state: self.nonces.generate(STATE_LENGTH),
                nonce: None,
            },
        }
    }

    pub(crate) async fn complete_federation(
        &self,
        params: &CallbackParams,
        context: &FederationContext,
    ) -> Result<VerifiedUsername, FederationFailure> {
        let ticket = params
            .get("ticket")
            .filter(|ticket| !ticket.is_empty())
            .ok_or_else(|| FederationFailure::missing_parameter("ticket"))?;

        match self.validator.validate(&context.return_to, ticket).await {
            Ok(Some(user)) => Ok(VerifiedUsername::new(user)),
            Ok(None) => Err(FederationFailure::provider_rejected(
                "CAS did not confirm the ticket",
            )),
            Err(e) => {
                tracing::warn!(error = %e, "CAS ticket validation failed");
                Err(e.into_failure())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::federation::FailureReason;
    use crate::nonce::testing::SequenceNonceSource;

    const SUCCESS: &str = r#"<cas:serviceResponse xmlns:cas="http://www.yale.edu/tp/cas">
    <cas:authenticationSuccess>
        <cas:user>jdoe</cas:user>
    </cas:authenticationSuccess>
</cas:serviceResponse>"#;

    const FAILURE: &str = r#"<cas:serviceResponse xmlns:cas="http://www.yale.edu/tp/cas">
    <cas:authenticationFailure code="INVALID_TICKET">Ticket ST-1 not recognized</cas:authenticationFailure>
</cas:serviceResponse>"#;

    struct RecordingValidator {
        answer: Result<Option<String>, String>,
        seen: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl TicketValidator for RecordingValidator {
        async fn validate(
            &self,
            service: &str,
            ticket: &str,
        ) -> Result<Option<String>, ProviderError> {
            self.seen
                .lock()
                .unwrap()
                .push((service.to_string(), ticket.to_string()));
            self.answer.clone().map_err(ProviderError::Network)
        }
    }

    fn adapter(answer: Result<Option<String>, String>) -> (CasAdapter, Arc<RecordingValidator>) {
        let validator = Arc::new(RecordingValidator {
            answer,
            seen: Mutex::new(Vec::new()),
        });
        let adapter = CasAdapter::new(
            Url::parse("https://cas.example.com/cas/login").unwrap(),
            validator.clone(),
            Arc::new(SequenceNonceSource::default()),
        );
        (adapter, validator)
    }

    fn context() -> FederationContext {
        FederationContext {
            return_to: "http://host/protected".to_string(),
            state: "s".to_string(),
            nonce: None,
        }
    }

    fn ticket(value: &str) -> CallbackParams {
        CallbackParams::from([("ticket".to_string(), value.to_string())])
    }

    #[test]
    fn test_parse_success() {
        assert_eq!(parse_service_response(SUCCESS).unwrap(), Some("jdoe".to_string()));
    }

    #[test]
    fn test_parse_failure_block() {
        assert_eq!(parse_service_response(FAILURE).unwrap(), None);
    }

    #[test]
    fn test_parse_success_without_user() {
        let body = r#"<cas:serviceResponse xmlns:cas="http://www.yale.edu/tp/cas">
            <cas:authenticationSuccess><cas:attributes/></cas:authenticationSuccess>
        </cas:serviceResponse>"#;
        assert_eq!(parse_service_response(body).unwrap(), None);

        let body = r#"<cas:serviceResponse xmlns:cas="http://www.yale.edu/tp/cas">
            <cas:authenticationSuccess><cas:user></cas:user></cas:authenticationSuccess>
        </cas:serviceResponse>"#;
        assert_eq!(parse_service_response(body).unwrap(), None);
    }

    #[test]
    fn test_parse_ignores_foreign_namespace() {
        let body = r#"<serviceResponse xmlns="urn:other">
            <authenticationSuccess><user>mallory</user></authenticationSuccess>
        </serviceResponse>"#;
        assert_eq!(parse_service_response(body).unwrap(), None);
    }

    #[test]
    fn test_parse_rejects_non_xml() {
        let err = parse_service_response("yes\njdoe\n").unwrap_err();
        assert!(err.is_malformed());
    }

    #[test]
    fn test_begin_targets_login_with_service() {
        let (adapter, _) = adapter(Ok(None));
        let begin = adapter.begin_federation(&FederationTarget {
            return_to: "http://host/protected?x=1".to_string(),
            callback_url: "http://host/protected?x=1".to_string(),
        });

        assert_eq!(
            begin.redirect_target,
            "https://cas.example.com/cas/login?service=http%3A%2F%2Fhost%2Fprotected%3Fx%3D1"
        );
        assert_eq!(begin.context.return_to, "http://host/protected?x=1");
        assert!(begin.context.nonce.is_none());
    }

    #[tokio::test]
    async fn test_complete_validates_against_stored_service() {
        let (adapter, validator) = adapter(Ok(Some("jdoe".to_string())));

        let username = adapter
            .complete_federation(&ticket("ST-123"), &context())
            .await
            .unwrap();

        assert_eq!(username.as_str(), "jdoe");
        assert_eq!(
            validator.seen.lock().unwrap().as_slice(),
            [("http://host/protected".to_string(), "ST-123".to_string())]
        );
    }

    #[tokio::test]
    async fn test_complete_without_ticket() {
        let (adapter, validator) = adapter(Ok(Some("jdoe".to_string())));
        let failure = adapter
            .complete_federation(&CallbackParams::new(), &context())
            .await
            .unwrap_err();
        assert_eq!(failure.reason, FailureReason::MissingParameter);
        assert!(validator.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_complete_transport_error_fails() {
        let (adapter, _) = adapter(Err("connection reset".to_string()));
        let failure = adapter
            .complete_federation(&ticket("ST-1"), &context())
            .await
            .unwrap_err();
        assert_eq!(failure.reason, FailureReason::ProviderRejected);
    }

    #[tokio::test]
    async fn test_complete_rejected_ticket_fails() {
        let (adapter, _) = adapter(Ok(None));
        let failure = adapter
            .complete_federation(&ticket("ST-1"), &context())
            .await
            .unwrap_err();
        assert_eq!(failure.reason, FailureReason::ProviderRejected);
    }

    #[tokio::test]
    async fn test_client_sends_service_and_ticket() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/cas/serviceValidate"))
            .and(query_param("service", "http://host/protected"))
            .and(query_param("ticket", "ST-123"))
            .respond_with(ResponseTemplate::new(200).set_body_string(SUCCESS))
            .mount(&server)
            .await;

        let client = CasClient::new(
            Url::parse(&format!("{}/cas/serviceValidate", server.uri())).unwrap(),
            Duration::from_secs(5),
        )
        .unwrap();

        let user = client
            .validate("http://host/protected", "ST-123")
            .await
            .unwrap();
        assert_eq!(user, Some("jdoe".to_string()));
    }

    #[tokio::test]
    async fn test_client_http_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let client = CasClient::new(
            Url::parse(&format!("{}/cas/serviceValidate", server.uri())).unwrap(),
            Duration::from_secs(5),
        )
        .unwrap();

        let err = client.validate("http://host/", "ST-1").await.unwrap_err();
        assert!(matches!(err, ProviderError::HttpStatus(500)));
    }
}
