use axum::extract::State;
use axum::http::header::{CONTENT_TYPE, HOST, LOCATION};
use axum::response::IntoResponse;
use axum::{
    body::Body,
    http::{HeaderMap, HeaderName, HeaderValue, Request, StatusCode},
    middleware::Next,
    response::Response,
};
use axum_extra::extract::CookieJar;
use axum_extra::extract::cookie::{Cookie, SameSite};
use gatehouse_auth::{GatewayOutcome, GatewayRequest};
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::server::AppState;

// =============================================================================
// Gateway Middleware
// =============================================================================

/// Runs every request through the authentication gateway.
///
/// Authenticated requests continue to the inner service with an
/// [`Identity`](gatehouse_auth::Identity) extension. Everything else is
/// answered here: redirects, the login page, or a failure response.
pub async fn gateway_middleware(
    State(state): State<AppState>,
    jar: CookieJar,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let Some(base_url) = request_base_url(req.headers(), &state.config.server) else {
        tracing::debug!(path = %req.uri().path(), "Cannot determine request origin");
        return (StatusCode::BAD_REQUEST, "Bad Request").into_response();
    };

    let gateway_request = GatewayRequest::new(
        base_url,
        req.uri().path(),
        req.uri().query().map(str::to_string),
    );

    let cookie_name = state.config.session.cookie_name.as_str();
    let session = state
        .sessions
        .open(jar.get(cookie_name).map(|c| c.value()));

    let outcome = match state.gateway.handle(&gateway_request, &session).await {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::error!(error = %e, path = gateway_request.path(), "Gateway failed to handle request");
            return (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response();
        }
    };

    let response = match outcome {
        GatewayOutcome::PassThrough(identity) => {
            req.extensions_mut().insert(identity);
            next.run(req).await
        }
        GatewayOutcome::Redirect(location) => redirect_response(&location),
        GatewayOutcome::LoginPage { authorization_url } => login_page(&authorization_url),
        GatewayOutcome::Rejected(failure) => {
            if failure.is_bad_request() {
                (StatusCode::BAD_REQUEST, "Bad Request").into_response()
            } else {
                (StatusCode::FORBIDDEN, "Authentication failed").into_response()
            }
        }
    };

    if session.needs_cookie() {
        let cookie = Cookie::build((state.config.session.cookie_name.clone(), session.id()))
            .http_only(true)
            .secure(state.secure_cookie())
            .same_site(SameSite::Lax)
            .path("/")
            .build();
        return (jar.add(cookie), response).into_response();
    }

    response
}

fn redirect_response(location: &str) -> Response {
    match HeaderValue::from_str(location) {
        Ok(value) => (StatusCode::FOUND, [(LOCATION, value)]).into_response(),
        Err(_) => {
            tracing::warn!("Redirect target is not a valid header value");
            (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response()
        }
    }
}

fn login_page(authorization_url: &str) -> Response {
    let href = escape_html(authorization_url);
    let body = format!(
        "<!DOCTYPE html>\n<html>\n<head><meta charset=\"utf-8\"><title>Sign in</title></head>\n\
         <body>\n<p>This page requires you to sign in.</p>\n\
         <p><a href=\"{href}\">Sign in with your identity provider</a></p>\n</body>\n</html>\n"
    );
    (
        StatusCode::OK,
        [(CONTENT_TYPE, HeaderValue::from_static("text/html; charset=utf-8"))],
        body,
    )
        .into_response()
}

fn escape_html(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Rebuilds `scheme://host[:port]` for the request.
///
/// A configured `public_url` always wins. Otherwise the `Host` header is
/// used, and `X-Forwarded-Proto` / `X-Forwarded-Host` only when the server
/// is told to trust them. Returns `None` for a missing or malformed host.
pub fn request_base_url(headers: &HeaderMap, server: &ServerConfig) -> Option<String> {
    if let Some(public_url) = &server.public_url {
        return Some(public_url.trim_end_matches('/').to_string());
    }

    let forwarded = |name: &str| {
        server
            .trust_forwarded_headers
            .then(|| first_header_value(headers, name))
            .flatten()
    };

    let host = forwarded("x-forwarded-host")
        .or_else(|| first_header_value(headers, HOST.as_str()))?;
    if !is_valid_host(&host) {
        return None;
    }

    let scheme = match forwarded("x-forwarded-proto").as_deref() {
        Some(proto) if proto.eq_ignore_ascii_case("https") => "https",
        _ => "http",
    };

    Some(format!("{scheme}://{host}"))
}

fn first_header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn is_valid_host(host: &str) -> bool {
    host.bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'-' | b':' | b'[' | b']'))
}

// =============================================================================
// Request ID Middleware
// =============================================================================

pub async fn request_id(mut req: Request<Body>, next: Next) -> Response {
    let header_name = HeaderName::from_static("x-request-id");

    // If the incoming request already has a request-id, preserve it; otherwise generate one
    let Some(req_id_value) = req
        .headers()
        .get(&header_name)
        .cloned()
        .or_else(|| HeaderValue::from_str(&Uuid::new_v4().to_string()).ok())
    else {
        return next.run(req).await;
    };

    req.extensions_mut().insert(req_id_value.clone());

    let mut res = next.run(req).await;
    res.headers_mut().insert(header_name, req_id_value);
    res
}
