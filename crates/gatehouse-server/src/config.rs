use std::net::SocketAddr;
use std::time::Duration;

use gatehouse_auth::config::{GatewayConfig, ProviderConfig};
use serde::{Deserialize, Serialize};
use url::Url;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Cookie-keyed session store settings
    #[serde(default)]
    pub session: SessionConfig,
    /// Login/default paths, TTL, app id
    #[serde(default)]
    pub gateway: GatewayConfig,
    /// The identity provider to federate with (required)
    #[serde(default)]
    pub provider: Option<ProviderConfig>,
    /// Protected application; without one the built-in whoami page is served
    #[serde(default)]
    pub upstream: UpstreamConfig,
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.server.port == 0 {
            return Err("server.port must be > 0".into());
        }
        if let Some(public_url) = &self.server.public_url {
            let url = Url::parse(public_url)
                .map_err(|e| format!("server.public_url is not a valid URL: {e}"))?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err("server.public_url must be an http(s) URL".into());
            }
        }

        let lvl = self.logging.level.to_ascii_lowercase();
        let valid_levels = ["trace", "debug", "info", "warn", "error", "off"];
        if !valid_levels.contains(&lvl.as_str()) {
            return Err(format!("logging.level must be one of {valid_levels:?}"));
        }

        if self.session.cookie_name.is_empty()
            || !self
                .session
                .cookie_name
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
        {
            return Err("session.cookie_name must be a non-empty token of [A-Za-z0-9_-]".into());
        }
        if self.session.idle_timeout.is_zero() || self.session.sweep_interval.is_zero() {
            return Err("session timeouts must be > 0".into());
        }

        self.gateway.validate().map_err(|e| format!("gateway: {e}"))?;

        let provider = self
            .provider
            .as_ref()
            .ok_or_else(|| "a [provider] section is required".to_string())?;
        provider.validate().map_err(|e| format!("provider: {e}"))?;

        if let Some(url) = &self.upstream.url
            && !matches!(url.scheme(), "http" | "https")
        {
            return Err("upstream.url must be an http(s) URL".into());
        }

        Ok(())
    }

    pub fn addr(&self) -> SocketAddr {
        let ip: std::net::IpAddr = self
            .server
            .host
            .parse()
            .unwrap_or_else(|_| std::net::IpAddr::from([0, 0, 0, 0]));
        SocketAddr::new(ip, self.server.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Externally visible base URL, e.g. `https://app.example.com`.
    /// If not set, it is rebuilt from the `Host` header of each request.
    #[serde(default)]
    pub public_url: Option<String>,
    /// Honour `X-Forwarded-Proto` / `X-Forwarded-Host` from a reverse proxy.
    #[serde(default)]
    pub trust_forwarded_headers: bool,
    #[serde(default = "default_body_limit")]
    pub body_limit_bytes: usize,
}

fn default_host() -> String {
    "0.0.0.0".into()
}
fn default_port() -> u16 {
    8080
}
fn default_body_limit() -> usize {
    10 * 1024 * 1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            public_url: None,
            trust_forwarded_headers: false,
            body_limit_bytes: default_body_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}
fn default_log_level() -> String {
    "info".into()
}
impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_cookie_name")]
    pub cookie_name: String,
    /// Mark the session cookie `Secure`. Implied by an https `public_url`.
    #[serde(default)]
    pub secure_cookie: bool,
    /// Sessions untouched for this long are dropped
    #[serde(default = "default_idle_timeout", with = "humantime_serde")]
    pub idle_timeout: Duration,
    /// How often the background sweep looks for idle sessions
    #[serde(default = "default_sweep_interval", with = "humantime_serde")]
    pub sweep_interval: Duration,
}

fn default_cookie_name() -> String {
    "gatehouse_session".into()
}
fn default_idle_timeout() -> Duration {
    Duration::from_secs(8 * 3600)
}
fn default_sweep_interval() -> Duration {
    Duration::from_secs(60)
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cookie_name: default_cookie_name(),
            secure_cookie: false,
            idle_timeout: default_idle_timeout(),
            sweep_interval: default_sweep_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Base URL of the protected application
    #[serde(default)]
    pub url: Option<Url>,
    #[serde(default = "default_upstream_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

fn default_upstream_timeout() -> Duration {
    Duration::from_secs(30)
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: None,
            timeout: default_upstream_timeout(),
        }
    }
}

pub mod loader {
    use super::AppConfig;
    use config::{Config, Environment, File};
    use std::path::{Path, PathBuf};

    pub fn load_config(path: Option<&str>) -> Result<AppConfig, String> {
        let mut builder = Config::builder();
        let pathbuf = PathBuf::from(path.unwrap_or("gatehouse.toml"));
        if pathbuf.exists() {
            builder = builder.add_source(File::from(pathbuf));
        }
        // Environment variable overrides, e.g., GATEHOUSE__SERVER__PORT=9090
        builder = builder.add_source(
            Environment::with_prefix("GATEHOUSE")
                .try_parsing(true)
                .separator("__"),
        );
        let cfg = builder
            .build()
            .map_err(|e| format!("config build error: {e}"))?;
        let merged: AppConfig = cfg
            .try_deserialize()
            .map_err(|e| format!("config deserialize error: {e}"))?;
        merged.validate()?;
        Ok(merged)
    }

    pub fn load_config_with_default_path<P: AsRef<Path>>(
        path: Option<P>,
    ) -> Result<AppConfig, String> {
        let p = path
            .as_ref()
            .map(|p| p.as_ref().to_string_lossy().to_string());
        load_config(p.as_deref())
    }
}
