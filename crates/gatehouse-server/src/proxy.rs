//! Forwarding of authenticated requests to the protected application.

use std::time::Duration;

use axum::{
    body::Body,
    http::{HeaderMap, HeaderName, HeaderValue, Request, StatusCode, header::COOKIE},
    response::{IntoResponse, Response},
};
use axum_extra::extract::cookie::Cookie;
use gatehouse_auth::Identity;
use tracing::{debug, warn};
use url::Url;

/// Header carrying the scheme tag of the authenticating adapter.
pub const AUTH_TYPE_HEADER: HeaderName = HeaderName::from_static("x-auth-type");
/// Header carrying the authenticated username.
pub const REMOTE_USER_HEADER: HeaderName = HeaderName::from_static("x-remote-user");

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("Failed to read request body: {0}")]
    RequestBody(String),

    #[error("Identity cannot be sent as a header: {0}")]
    IdentityHeader(String),

    #[error("Upstream request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Upstream request failed: {0}")]
    Upstream(String),

    #[error("Failed to build response: {0}")]
    Response(String),
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        warn!(error = %self, "Proxying to upstream failed");
        let status = match self {
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::IdentityHeader(_) | Self::Response(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::RequestBody(_) => StatusCode::BAD_REQUEST,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
        };
        let body = status.canonical_reason().unwrap_or("Error");
        (status, body).into_response()
    }
}

/// Reverse proxy to a single upstream base URL.
pub struct UpstreamProxy {
    client: reqwest::Client,
    base: Url,
    timeout: Duration,
    body_limit: usize,
    session_cookie: String,
}

impl UpstreamProxy {
    pub fn new(
        base: Url,
        timeout: Duration,
        body_limit: usize,
        session_cookie: impl Into<String>,
    ) -> Result<Self, ProxyError> {
        // Upstream redirects go back to the browser untouched.
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(timeout)
            .build()
            .map_err(|e| ProxyError::Upstream(e.to_string()))?;
        Ok(Self {
            client,
            base,
            timeout,
            body_limit,
            session_cookie: session_cookie.into(),
        })
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    /// Maps a request path and query onto the upstream base.
    pub fn target_url(&self, path: &str, query: Option<&str>) -> Url {
        let mut target = self.base.clone();
        let prefix = self.base.path().trim_end_matches('/');
        target.set_path(&format!("{prefix}{path}"));
        target.set_query(query);
        target
    }

    /// Sends `request` upstream as `identity` and relays the answer.
    pub async fn forward(
        &self,
        identity: &Identity,
        request: Request<Body>,
    ) -> Result<Response, ProxyError> {
        let target = self.target_url(request.uri().path(), request.uri().query());
        let method = request.method().clone();

        let mut headers = HeaderMap::new();
        for (name, value) in request.headers() {
            if is_hop_by_hop_header(name.as_str()) || is_identity_header(name) {
                debug!(header = %name, "Skipping header");
                continue;
            }
            if name == COOKIE {
                if let Some(value) = strip_cookie(value, &self.session_cookie) {
                    headers.append(COOKIE, value);
                }
                continue;
            }
            headers.append(name.clone(), value.clone());
        }

        headers.insert(
            AUTH_TYPE_HEADER,
            HeaderValue::from_static(identity.scheme.as_str()),
        );
        headers.insert(
            REMOTE_USER_HEADER,
            HeaderValue::from_str(&identity.principal)
                .map_err(|e| ProxyError::IdentityHeader(e.to_string()))?,
        );

        let body_bytes = axum::body::to_bytes(request.into_body(), self.body_limit)
            .await
            .map_err(|e| ProxyError::RequestBody(e.to_string()))?;

        debug!(method = %method, target = %target, "Proxying request");

        let upstream = self
            .client
            .request(method, target)
            .headers(headers)
            .body(body_bytes)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProxyError::Timeout(self.timeout)
                } else {
                    ProxyError::Upstream(e.to_string())
                }
            })?;

        let mut response_builder = Response::builder().status(upstream.status());
        for (name, value) in upstream.headers() {
            if !is_hop_by_hop_header(name.as_str()) {
                response_builder = response_builder.header(name, value);
            }
        }

        let response_body = upstream
            .bytes()
            .await
            .map_err(|e| ProxyError::Upstream(e.to_string()))?;

        response_builder
            .body(Body::from(response_body))
            .map_err(|e| ProxyError::Response(e.to_string()))
    }
}

impl std::fmt::Debug for UpstreamProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamProxy")
            .field("base", &self.base.as_str())
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Checks if a header is a hop-by-hop header that should not be forwarded.
fn is_hop_by_hop_header(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
            | "host"
            | "content-length"
    )
}

fn is_identity_header(name: &HeaderName) -> bool {
    name == AUTH_TYPE_HEADER || name == REMOTE_USER_HEADER
}

/// Removes the gateway's own cookie from a `Cookie` header.
/// Returns `None` if nothing else is left.
fn strip_cookie(value: &HeaderValue, name: &str) -> Option<HeaderValue> {
    let Ok(raw) = value.to_str() else {
        return Some(value.clone());
    };
    let kept: Vec<String> = Cookie::split_parse(raw)
        .filter_map(Result::ok)
        .filter(|cookie| cookie.name() != name)
        .map(|cookie| cookie.stripped().to_string())
        .collect();
    if kept.is_empty() {
        return None;
    }
    HeaderValue::from_str(&kept.join("; ")).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_hop_by_hop_header() {
        assert!(is_hop_by_hop_header("Connection"));
        assert!(is_hop_by_hop_header("Transfer-Encoding"));
        assert!(is_hop_by_hop_header("host"));
        assert!(!is_hop_by_hop_header("Content-Type"));
        assert!(!is_hop_by_hop_header("Authorization"));
    }

    #[test]
    fn test_identity_headers_are_recognised_case_insensitively() {
        let name = HeaderName::from_bytes(b"X-Remote-User").unwrap();
        assert!(is_identity_header(&name));
        assert!(is_identity_header(&AUTH_TYPE_HEADER));
        assert!(!is_identity_header(&HeaderName::from_static("x-remote-addr")));
    }

    #[test]
    fn test_strip_cookie() {
        let value = HeaderValue::from_static("theme=dark; gatehouse_session=abc; lang=en");
        assert_eq!(
            strip_cookie(&value, "gatehouse_session").unwrap(),
            "theme=dark; lang=en"
        );

        let only_ours = HeaderValue::from_static("gatehouse_session=abc");
        assert!(strip_cookie(&only_ours, "gatehouse_session").is_none());

        let quoted = HeaderValue::from_static("gatehouse_session=abc;note=\"x=1\" ;  ;theme=dark");
        assert_eq!(
            strip_cookie(&quoted, "gatehouse_session").unwrap(),
            "note=\"x=1\"; theme=dark"
        );

        // Only an exact name match is removed
        let similar = HeaderValue::from_static("gatehouse_session_old=1; gatehouse_session=abc");
        assert_eq!(
            strip_cookie(&similar, "gatehouse_session").unwrap(),
            "gatehouse_session_old=1"
        );
    }

    #[test]
    fn test_target_url_keeps_base_prefix() {
        let proxy = UpstreamProxy::new(
            Url::parse("http://127.0.0.1:9000/app/").unwrap(),
            Duration::from_secs(5),
            1024,
            "gatehouse_session",
        )
        .unwrap();

        assert_eq!(
            proxy.target_url("/reports", Some("q=1")).as_str(),
            "http://127.0.0.1:9000/app/reports?q=1"
        );
        assert_eq!(
            proxy.target_url("/", None).as_str(),
            "http://127.0.0.1:9000/app/"
        );
    }
}
