//! Gateway and identity provider configuration.
//!
//! # Example (TOML)
//!
//! ```toml
//! [gateway]
//! login_path = "/login"
//! default_path = "/"
//! app_id = "intranet-gateway"
//! global_ttl = "8h"
//!
//! [provider]
//! type = "oidc"
//! issuer = "https://accounts.example.com"
//! client_id = "gatehouse"
//! client_secret = "s3cret"
//! username_claims = ["sub", "iss"]
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

/// Endpoint of Steam's OpenID 2.0 provider.
pub const STEAM_OPENID_ENDPOINT: &str = "https://steamcommunity.com/openid/login";

/// Provider-independent gateway settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Path that hosts the federation callback and login page.
    pub login_path: String,

    /// Path users land on when no original target was captured.
    pub default_path: String,

    /// Where to send users whose federation failed.
    /// When unset a generic failure response is returned instead.
    pub failure_redirect: Option<String>,

    /// Fixed audience identifier. When unset a random one is generated at
    /// startup, invalidating credentials from previous runs.
    pub app_id: Option<String>,

    /// Maximum credential age. Unset means credentials never expire on
    /// their own.
    #[serde(with = "humantime_serde")]
    pub global_ttl: Option<Duration>,

    /// Timeout for every outbound call to the identity provider.
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            login_path: "/login".to_string(),
            default_path: "/".to_string(),
            failure_redirect: None,
            app_id: None,
            global_ttl: None,
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// The identity provider this instance federates with.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProviderConfig {
    /// Central Authentication Service.
    Cas(CasConfig),
    /// OpenID 2.0 relying party.
    Openid2(OpenId2Config),
    /// OpenID Connect relying party.
    Oidc(OidcConfig),
    /// Fixed identity, for development.
    Dummy(DummyConfig),
}

/// CAS server endpoints.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CasConfig {
    /// CAS login URL, e.g. `https://cas.example.com/cas/login`.
    pub login_url: Url,

    /// CAS ticket validation URL, e.g.
    /// `https://cas.example.com/cas/serviceValidate`.
    pub validate_url: Url,
}

/// OpenID 2.0 provider settings.
///
/// The endpoint defaults to Steam's, so `type = "openid2"` alone is a
/// working Steam login.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OpenId2Config {
    /// OP endpoint URL that receives `checkid_setup` requests.
    #[serde(default = "default_openid2_endpoint")]
    pub endpoint: Url,
}

impl Default for OpenId2Config {
    fn default() -> Self {
        Self {
            endpoint: default_openid2_endpoint(),
        }
    }
}

fn default_openid2_endpoint() -> Url {
    Url::parse(STEAM_OPENID_ENDPOINT).expect("Steam endpoint is a valid URL")
}

/// Which ID token claims make up the username.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum UsernameClaims {
    /// Use one claim as-is, e.g. `"email"`.
    Single(String),
    /// Join several claims with `@` in order, e.g. `["sub", "iss"]`.
    Composite(Vec<String>),
}

impl Default for UsernameClaims {
    fn default() -> Self {
        Self::Composite(vec!["sub".to_string(), "iss".to_string()])
    }
}

impl UsernameClaims {
    /// Returns the claim names in join order.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        match self {
            Self::Single(name) => vec![name.as_str()],
            Self::Composite(names) => names.iter().map(String::as_str).collect(),
        }
    }
}

/// OpenID Connect relying-party settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OidcConfig {
    /// Issuer URL; discovery reads `{issuer}/.well-known/openid-configuration`.
    pub issuer: Url,

    /// Client identifier registered with the provider.
    pub client_id: String,

    /// Client secret for confidential clients.
    #[serde(default)]
    pub client_secret: Option<String>,

    /// Scopes requested in the authorization request.
    #[serde(default = "default_oidc_scopes")]
    pub scopes: Vec<String>,

    /// Claims that form the local username.
    #[serde(default)]
    pub username_claims: UsernameClaims,

    /// Tolerance applied to `exp`/`iat` checks on the ID token.
    #[serde(default = "default_clock_skew", with = "humantime_serde")]
    pub clock_skew: Duration,

    /// Allow a plain-HTTP issuer. Only for local testing.
    #[serde(default)]
    pub allow_http: bool,
}

fn default_oidc_scopes() -> Vec<String> {
    vec!["openid".to_string()]
}

fn default_clock_skew() -> Duration {
    Duration::from_secs(60)
}

/// Development provider that authenticates everyone as one user.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DummyConfig {
    /// The username every session receives.
    pub username: String,
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An invalid configuration value was provided.
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),

    /// A required configuration value is missing.
    #[error("Missing required configuration: {0}")]
    Missing(String),
}

impl GatewayConfig {
    /// Validates path and TTL settings.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if a path does not start with `/`,
    /// the login and default paths coincide, or a duration is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, path) in [
            ("login_path", &self.login_path),
            ("default_path", &self.default_path),
        ] {
            if !path.starts_with('/') {
                return Err(ConfigError::InvalidValue(format!(
                    "gateway.{name} must start with '/', got '{path}'"
                )));
            }
        }

        if self.login_path == self.default_path {
            return Err(ConfigError::InvalidValue(
                "gateway.login_path and gateway.default_path must differ".to_string(),
            ));
        }

        if self.global_ttl.is_some_and(|ttl| ttl.is_zero()) {
            return Err(ConfigError::InvalidValue(
                "gateway.global_ttl must be greater than zero".to_string(),
            ));
        }

        if self.request_timeout.is_zero() {
            return Err(ConfigError::InvalidValue(
                "gateway.request_timeout must be greater than zero".to_string(),
            ));
        }

        if let Some(app_id) = &self.app_id
            && app_id.trim().is_empty()
        {
            return Err(ConfigError::InvalidValue(
                "gateway.app_id cannot be blank".to_string(),
            ));
        }

        Ok(())
    }
}

impl ProviderConfig {
    /// Validates provider-specific settings.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` for empty client ids, empty claim lists,
    /// non-HTTP(S) endpoints or an empty dummy username.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            Self::Cas(cas) => {
                require_http("provider.login_url", &cas.login_url)?;
                require_http("provider.validate_url", &cas.validate_url)
            }
            Self::Openid2(oid) => require_http("provider.endpoint", &oid.endpoint),
            Self::Oidc(oidc) => {
                require_http("provider.issuer", &oidc.issuer)?;
                if oidc.issuer.scheme() != "https" && !oidc.allow_http {
                    return Err(ConfigError::InvalidValue(
                        "provider.issuer must use https (set allow_http for testing)".to_string(),
                    ));
                }
                if oidc.client_id.is_empty() {
                    return Err(ConfigError::Missing("provider.client_id".to_string()));
                }
                let names = oidc.username_claims.names();
                if names.is_empty() || names.iter().any(|n| n.is_empty()) {
                    return Err(ConfigError::InvalidValue(
                        "provider.username_claims must name at least one claim".to_string(),
                    ));
                }
                Ok(())
            }
            Self::Dummy(dummy) => {
                if dummy.username.is_empty() {
                    return Err(ConfigError::Missing("provider.username".to_string()));
                }
                Ok(())
            }
        }
    }
}

fn require_http(name: &str, url: &Url) -> Result<(), ConfigError> {
    match url.scheme() {
        "http" | "https" => Ok(()),
        other => Err(ConfigError::InvalidValue(format!(
            "{name} must be an http(s) URL, got scheme '{other}'"
        ))),
    }
}
