use std::net::SocketAddr;
use std::sync::Arc;

use axum::{Router, middleware, routing::get};
use gatehouse_auth::{Gateway, NonceSource, OsNonceSource};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::config::AppConfig;
use crate::proxy::UpstreamProxy;
use crate::session::SessionStore;
use crate::{handlers, middleware as app_middleware};

/// Shared state handed to the middleware and handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub gateway: Arc<Gateway>,
    pub sessions: Arc<SessionStore>,
    pub proxy: Option<Arc<UpstreamProxy>>,
}

impl AppState {
    /// Whether the session cookie carries the `Secure` attribute.
    pub fn secure_cookie(&self) -> bool {
        self.config.session.secure_cookie
            || self
                .config
                .server
                .public_url
                .as_deref()
                .is_some_and(|url| url.starts_with("https://"))
    }
}

pub struct GatehouseServer {
    addr: SocketAddr,
    app: Router,
    sweeper: JoinHandle<()>,
}

pub fn build_app(state: AppState) -> Router {
    let body_limit = state.config.server.body_limit_bytes;

    let protected = Router::new()
        .route("/whoami", get(handlers::whoami))
        .fallback(handlers::protected)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            app_middleware::gateway_middleware,
        ));

    Router::new()
        .route("/healthz", get(handlers::healthz))
        .merge(protected)
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(axum::extract::DefaultBodyLimit::max(body_limit))
                .layer(middleware::from_fn(app_middleware::request_id))
                .layer(
                    TraceLayer::new_for_http()
                        .make_span_with(|req: &axum::http::Request<_>| {
                            use tracing::field::Empty;
                            let req_id = req
                                .extensions()
                                .get::<axum::http::HeaderValue>()
                                .and_then(|v| v.to_str().ok())
                                .unwrap_or("")
                                .to_string();
                            tracing::info_span!(
                                "http.request",
                                http.method = %req.method(),
                                http.target = %req.uri().path(),
                                http.status_code = Empty,
                                request_id = %req_id
                            )
                        })
                        .on_response(
                            |res: &axum::http::Response<_>,
                             latency: std::time::Duration,
                             span: &tracing::Span| {
                                span.record(
                                    "http.status_code",
                                    tracing::field::display(res.status().as_u16()),
                                );
                                tracing::info!(
                                    http.status = %res.status().as_u16(),
                                    elapsed_ms = %latency.as_millis(),
                                    "request handled"
                                );
                            },
                        ),
                ),
        )
}

pub struct ServerBuilder {
    addr: SocketAddr,
    config: AppConfig,
    nonces: Option<Arc<dyn NonceSource>>,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerBuilder {
    pub fn new() -> Self {
        let cfg = AppConfig::default();
        Self {
            addr: cfg.addr(),
            config: cfg,
            nonces: None,
        }
    }

    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = addr;
        self
    }

    pub fn with_config(mut self, cfg: AppConfig) -> Self {
        self.addr = cfg.addr();
        self.config = cfg;
        self
    }

    /// Replaces the OS random source, e.g. with a deterministic one.
    pub fn with_nonce_source(mut self, nonces: Arc<dyn NonceSource>) -> Self {
        self.nonces = Some(nonces);
        self
    }

    /// Validates the configuration, sets up the identity provider and the
    /// session store, and starts the idle-session sweep.
    ///
    /// Must be called inside a tokio runtime.
    pub async fn build(self) -> anyhow::Result<GatehouseServer> {
        self.config
            .validate()
            .map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;

        let provider = self
            .config
            .provider
            .clone()
            .ok_or_else(|| anyhow::anyhow!("a [provider] section is required"))?;

        let nonces: Arc<dyn NonceSource> = match self.nonces {
            Some(nonces) => nonces,
            None => Arc::new(OsNonceSource::new()?),
        };

        let gateway =
            Gateway::from_config(self.config.gateway.clone(), &provider, nonces.clone()).await?;

        tracing::info!(
            scheme = %gateway.scheme(),
            login_path = %self.config.gateway.login_path,
            "Gateway ready"
        );

        let proxy = match &self.config.upstream.url {
            Some(url) => {
                let proxy = UpstreamProxy::new(
                    url.clone(),
                    self.config.upstream.timeout,
                    self.config.server.body_limit_bytes,
                    self.config.session.cookie_name.clone(),
                )?;
                tracing::info!(upstream = %url, "Proxying authenticated requests");
                Some(Arc::new(proxy))
            }
            None => {
                tracing::info!("No upstream configured, serving whoami");
                None
            }
        };

        let sessions = Arc::new(SessionStore::new(
            self.config.session.idle_timeout,
            nonces,
        ));
        let sweeper = sessions.spawn_sweeper(self.config.session.sweep_interval);

        let state = AppState {
            config: Arc::new(self.config),
            gateway: Arc::new(gateway),
            sessions,
            proxy,
        };

        Ok(GatehouseServer {
            addr: self.addr,
            app: build_app(state),
            sweeper,
        })
    }
}

impl GatehouseServer {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.addr).await?;
        tracing::info!("listening on {}", self.addr);
        self.serve(listener).await
    }

    /// Serves on an already bound listener until ctrl-c.
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let result = axum::serve(listener, self.app)
            .with_graceful_shutdown(shutdown_signal())
            .await;
        self.sweeper.abort();
        result?;
        Ok(())
    }
}

async fn shutdown_signal() {
    // Wait for Ctrl+C
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
