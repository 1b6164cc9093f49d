use axum::{
    Extension, Json,
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    response::{IntoResponse, Response},
};
use gatehouse_auth::Identity;
use serde::Serialize;

use crate::server::AppState;

#[derive(Serialize)]
pub struct HealthResponse<'a> {
    pub status: &'a str,
}

pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, Json(HealthResponse { status: "ok" }))
}

#[derive(Debug, Serialize)]
pub struct WhoamiResponse {
    pub auth_type: &'static str,
    pub remote_user: String,
}

impl From<&Identity> for WhoamiResponse {
    fn from(identity: &Identity) -> Self {
        Self {
            auth_type: identity.scheme.as_str(),
            remote_user: identity.principal.clone(),
        }
    }
}

/// Reports who the gateway authenticated the caller as.
pub async fn whoami(Extension(identity): Extension<Identity>) -> impl IntoResponse {
    Json(WhoamiResponse::from(&identity))
}

/// Handles every authenticated request: forwarded upstream when one is
/// configured, otherwise answered with [`whoami`].
pub async fn protected(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    request: Request<Body>,
) -> Response {
    match &state.proxy {
        Some(proxy) => match proxy.forward(&identity, request).await {
            Ok(response) => response,
            Err(e) => e.into_response(),
        },
        None => Json(WhoamiResponse::from(&identity)).into_response(),
    }
}
